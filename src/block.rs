use std::ptr::NonNull;

use crate::{
    align,
    error::Error,
    header::Header,
    platform,
    rbtree::RbTree,
    segment::{Segment, SEGMENT_HEADER_SIZE, SIZE_MASK},
    Pointer,
};

/// A single contiguous region obtained from the page provider, carved into
/// segments. The block owns the region: mapping happens on construction and
/// the whole range is returned in one call when the block is dropped.
///
/// Segments are kept in two structures at once. Physically they form a
/// doubly linked list through their `next`/`prev` header fields, in address
/// order and with no gaps, which is what coalescing walks. Logically the
/// free ones are also indexed by a red-black tree keyed on their size, which
/// is what best-fit queries walk. A segment is in the tree if and only if
/// its status bit says free.
///
/// ```text
///                    tree (free segments, by size)
///                          +-------+
///                          |  416  |
///                          +-------+
///                         /         \
///                  +-------+       +-------+
///                  |  64   |       |  528  |
///                  +-------+       +-------+
///
///   +--------+------+--------+------+--------+----------+
///   | 128 u  | 64 f | 256 u  | 416f | 32 u   | 528 f    |   spatial list
///   +--------+------+--------+------+--------+----------+
///   ^ head                                        region end
/// ```
pub(crate) struct Block {
    /// First segment header, also the base address of the mapped region.
    head: NonNull<Header<Segment>>,
    /// Mapped region size in bytes, headers included.
    size: usize,
    /// Free segments indexed by size.
    tree: RbTree<Segment>,
}

impl Block {
    /// Maps a fresh region of `region_bytes` and installs a single free
    /// segment spanning all of it.
    ///
    /// # Safety
    ///
    /// Nothing is required of the caller, the function is only unsafe
    /// because it conjures memory out of a raw syscall. Failure of the page
    /// provider is reported as [`Error::Exhausted`], and so is a region too
    /// small to hold even one header.
    pub unsafe fn new(region_bytes: usize) -> Result<Self, Error> {
        if region_bytes <= SEGMENT_HEADER_SIZE {
            return Err(Error::Exhausted);
        }

        let Some(address) = platform::map(region_bytes) else {
            return Err(Error::Exhausted);
        };

        let head = address.cast::<Header<Segment>>();
        head.as_ptr().write(Header {
            left: None,
            right: None,
            parent: None,
            value: region_bytes - SEGMENT_HEADER_SIZE,
            data: Segment {
                next: None,
                prev: None,
            },
        });

        let mut tree = RbTree::new();
        tree.insert(head);

        Ok(Self {
            head,
            size: region_bytes,
            tree,
        })
    }

    /// Whether `address` falls inside this block's mapped range.
    #[inline]
    pub fn contains(&self, address: NonNull<u8>) -> bool {
        let base = self.head.as_ptr() as usize;
        let address = address.as_ptr() as usize;

        base <= address && address < base + self.size
    }

    /// Returns the free segment of smallest size that can hold `bytes`
    /// payload bytes, or `None` if no free segment is big enough. Does not
    /// mutate anything; calling it twice in a row yields the same node.
    ///
    /// # Safety
    ///
    /// The block must be in a consistent state (it always is between public
    /// calls).
    pub unsafe fn best_fit(&self, bytes: usize) -> Pointer<Header<Segment>> {
        let bytes = align::checked_word_align(bytes)?;
        self.tree.lower_bound(bytes, |key, value| key <= value & SIZE_MASK)
    }

    /// Carves `bytes` out of `node` and returns the payload address.
    ///
    /// # Safety
    ///
    /// `node` must have been obtained from [`Block::best_fit`] with the same
    /// `bytes` on this very block, with no mutation in between.
    pub unsafe fn allocate(&mut self, bytes: usize, node: NonNull<Header<Segment>>) -> NonNull<u8> {
        debug_assert!(node.as_ref().is_free());
        #[cfg(debug_assertions)]
        {
            assert!(self.tree.contains(node));
        }

        let payload = Header::payload_address_of(node);

        self.tree.remove(node);
        self.shrink_then_align(node, align::word_align(bytes));

        payload
    }

    /// Releases the segment that starts right before `payload`, merging it
    /// with free neighbors.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by a prior [`Block::allocate`] on
    /// this block and not freed since. The byte count is accepted for API
    /// symmetry but the header already knows the segment size.
    pub unsafe fn deallocate(&mut self, payload: NonNull<u8>, _bytes: usize) {
        let mut node = Header::<Segment>::from_payload_address(payload);
        debug_assert!(!node.as_ref().is_free(), "double free");

        node.as_mut().mark_free();
        self.coalesce_nodes(node);
    }

    /// Splits an oversized segment into a used prefix of exactly `bytes` and
    /// a free suffix, when the suffix would keep at least one usable payload
    /// byte. Otherwise the whole segment is handed out as is; a little
    /// internal fragmentation beats an unusable sliver in the tree.
    ///
    /// ```text
    /// Before:                          After:
    /// +--------+                       +--------+
    /// | Header |                       | Header |
    /// +--------+                       +--------+
    /// |        |                       | bytes  | <- marked used
    /// |  total |                       +--------+
    /// |        |                       | Header | <- new, goes to the tree
    /// |        |                       +--------+
    /// |        |                       | rest   |
    /// +--------+                       +--------+
    /// ```
    ///
    /// `node` must already be out of the tree; the suffix is inserted here,
    /// the prefix never returns to it. `bytes` must be word aligned.
    unsafe fn shrink_then_align(&mut self, mut node: NonNull<Header<Segment>>, bytes: usize) {
        let total = node.as_ref().size();

        if total >= bytes + SEGMENT_HEADER_SIZE + 1 {
            let address = Header::payload_address_of(node).as_ptr().add(bytes);
            let rest = NonNull::new_unchecked(address.cast::<Header<Segment>>());

            rest.as_ptr().write(Header {
                left: None,
                right: None,
                parent: None,
                value: total - bytes - SEGMENT_HEADER_SIZE,
                data: Segment {
                    next: node.as_ref().data.next,
                    prev: Some(node),
                },
            });
            Header::link_after(node, rest);

            node.as_mut().set_size(bytes);
            self.tree.insert(rest);
        }

        node.as_mut().mark_used();
    }

    /// Merges a just-freed segment with its free spatial neighbors and
    /// inserts the surviving segment into the tree. `node` must be marked
    /// free but not yet inserted.
    ///
    /// ```text
    /// +----------+----------+----------+      +--------------------------+
    /// |  A free  | B freed  |  C free  |  =>  |     A, one segment       |
    /// +----------+----------+----------+      +--------------------------+
    /// ```
    ///
    /// The tree is keyed on size, so a neighbor must leave the tree *before*
    /// its size field is touched; removing it afterwards would descend the
    /// tree with the new key through a structure shaped by the old one.
    unsafe fn coalesce_nodes(&mut self, mut node: NonNull<Header<Segment>>) {
        // Absorb the next segment into this one.
        if let Some(next) = node.as_ref().data.next {
            if next.as_ref().is_free() {
                self.tree.remove(next);
                let merged = node.as_ref().size() + next.as_ref().total_size();
                node.as_mut().set_size(merged);
                Header::unlink(next);
            }
        }

        // This segment disappears into the previous one.
        if let Some(mut prev) = node.as_ref().data.prev {
            if prev.as_ref().is_free() {
                self.tree.remove(prev);
                let merged = prev.as_ref().size() + node.as_ref().total_size();
                prev.as_mut().set_size(merged);
                Header::unlink(node);
                node = prev;
            }
        }

        self.tree.insert(node);
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // One call gives the entire region back; every segment inside
        // becomes invalid at the same time.
        unsafe { platform::unmap(self.head.cast(), self.size) }
    }
}

#[cfg(any(test, debug_assertions))]
impl Block {
    /// Loud failure if any structural invariant does not hold: the spatial
    /// list must cover the region exactly with back links intact, no two
    /// adjacent segments may both be free, and the tree must contain exactly
    /// the free segments while satisfying the red-black properties.
    pub(crate) unsafe fn check_invariants(&self) {
        self.tree.check_consistency();

        let mut total = 0;
        let mut free_segments = 0;
        let mut previous: Pointer<Header<Segment>> = None;
        let mut current = Some(self.head);

        while let Some(segment) = current {
            match previous {
                None => assert!(segment.as_ref().data.prev.is_none(), "head has a prev"),
                Some(prev) => {
                    let expected = prev.as_ptr() as usize + prev.as_ref().total_size();
                    assert_eq!(segment.as_ptr() as usize, expected, "gap in spatial list");
                    assert_eq!(segment.as_ref().data.prev, Some(prev), "broken back link");
                    assert!(
                        !(segment.as_ref().is_free() && prev.as_ref().is_free()),
                        "two adjacent free segments"
                    );
                }
            }

            if segment.as_ref().is_free() {
                free_segments += 1;
                assert!(self.tree.contains(segment), "free segment missing from tree");
            } else {
                assert!(!self.tree.contains(segment), "used segment in tree");
            }

            total += segment.as_ref().total_size();
            previous = current;
            current = segment.as_ref().data.next;
        }

        assert_eq!(total, self.size, "segments do not cover the region");
        assert_eq!(free_segments, self.tree.count(), "tree size mismatch");
    }
}

#[cfg(test)]
impl Block {
    pub(crate) unsafe fn free_segments(&self) -> usize {
        self.tree.count()
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    const H: usize = SEGMENT_HEADER_SIZE;

    /// best_fit + allocate in one go, like callers that don't care about the
    /// intermediate node.
    unsafe fn alloc(block: &mut Block, bytes: usize) -> Option<NonNull<u8>> {
        let node = block.best_fit(bytes)?;
        Some(block.allocate(bytes, node))
    }

    #[test]
    fn full_region_allocation_then_deallocation() {
        unsafe {
            let mut block = Block::new(1024).unwrap();
            block.check_invariants();

            let node = block.best_fit(1024 - H).unwrap();
            assert_eq!(node.as_ref().size(), 1024 - H);

            let payload = block.allocate(1024 - H, node);
            block.check_invariants();
            assert_eq!(block.free_segments(), 0);

            // The region is fully handed out, nothing fits anymore.
            assert!(block.best_fit(1).is_none());
            assert!(block.best_fit(128).is_none());

            // Check for memory corruption while we're at it.
            payload.as_ptr().write_bytes(69, 1024 - H);
            assert_eq!(*payload.as_ptr(), 69);
            assert_eq!(*payload.as_ptr().add(1024 - H - 1), 69);

            block.deallocate(payload, 1024 - H);
            block.check_invariants();

            let node = block.best_fit(512).unwrap();
            assert_eq!(node.as_ref().size(), 1024 - H);
            assert_eq!(block.free_segments(), 1);
        }
    }

    #[test]
    fn split_then_coalesce() {
        unsafe {
            // One initial segment of 100 payload bytes.
            let mut block = Block::new(100 + H).unwrap();

            // Asking for all of it leaves nothing to split off.
            let first = alloc(&mut block, 100 - H).unwrap();
            block.check_invariants();
            assert_eq!(
                Header::<Segment>::from_payload_address(first).as_ref().size(),
                100
            );
            assert!(block.best_fit(1).is_none());

            block.deallocate(first, 100 - H);
            block.check_invariants();

            // A tiny request splits the segment: the rounded request is
            // carved off and the rest becomes a new free segment.
            let word = std::mem::size_of::<usize>();
            let second = alloc(&mut block, 2).unwrap();
            block.check_invariants();
            assert_eq!(
                Header::<Segment>::from_payload_address(second).as_ref().size(),
                word
            );
            assert_eq!(block.free_segments(), 1);
            assert_eq!(
                block.best_fit(1).unwrap().as_ref().size(),
                100 - word - H
            );

            // The suffix serves the next request.
            let third = alloc(&mut block, 2).unwrap();
            block.check_invariants();
            assert_eq!(block.free_segments(), 0);

            // Freeing both merges everything back into one segment.
            block.deallocate(second, 2);
            block.check_invariants();
            assert_eq!(block.free_segments(), 1);

            block.deallocate(third, 2);
            block.check_invariants();
            assert_eq!(block.free_segments(), 1);
            assert_eq!(block.best_fit(1).unwrap().as_ref().size(), 100);
        }
    }

    #[test]
    fn payload_is_usable_memory() {
        unsafe {
            let mut block = Block::new(4096).unwrap();

            let array = alloc(&mut block, 10 * 4).unwrap().cast::<u32>();
            for i in 0..10 {
                array.as_ptr().add(i).write(i as u32 * 10);
            }
            for i in 0..10 {
                assert_eq!(*array.as_ptr().add(i), i as u32 * 10);
            }

            block.deallocate(array.cast(), 10 * 4);
            block.check_invariants();
        }
    }

    #[test]
    fn sequential_allocations_record_their_sizes() {
        unsafe {
            let mut block = Block::new(2048).unwrap();
            let sizes = [16, 32, 64, 128, 256, 512];

            let payloads: Vec<NonNull<u8>> = sizes
                .iter()
                .map(|&bytes| alloc(&mut block, bytes).unwrap())
                .collect();
            block.check_invariants();

            for (&bytes, &payload) in sizes.iter().zip(&payloads) {
                let header = Header::<Segment>::from_payload_address(payload);
                assert_eq!(header.as_ref().size(), bytes);
                assert!(!header.as_ref().is_free());
            }

            // Free in reverse order; each free merges with the growing tail
            // segment, so the block ends as a single span again.
            for (&bytes, &payload) in sizes.iter().zip(&payloads).rev() {
                block.deallocate(payload, bytes);
                block.check_invariants();
            }
            assert_eq!(block.free_segments(), 1);
            assert_eq!(block.best_fit(1).unwrap().as_ref().size(), 2048 - H);
        }
    }

    #[test]
    fn adjacent_frees_merge_into_best_fit_candidates() {
        unsafe {
            let mut block = Block::new(1000).unwrap();

            let a = alloc(&mut block, 64).unwrap();
            let b = alloc(&mut block, 128).unwrap();
            let c = alloc(&mut block, 64).unwrap();
            let d = alloc(&mut block, 128).unwrap();
            block.check_invariants();

            // Freeing two adjacent segments produces one merged hole of
            // 128 + H + 64 bytes.
            block.deallocate(b, 128);
            block.check_invariants();
            assert_eq!(block.free_segments(), 2);

            block.deallocate(c, 64);
            block.check_invariants();
            assert_eq!(block.free_segments(), 2);

            let hole = 128 + H + 64;
            assert_eq!(block.best_fit(hole).unwrap().as_ref().size(), hole);

            // Best fit prefers the merged hole over the bigger tail segment.
            // The backward merge kept the first freed header, so the new
            // allocation starts exactly where `b` did.
            let e = alloc(&mut block, hole).unwrap();
            block.check_invariants();
            assert_eq!(e, b);

            block.deallocate(a, 64);
            block.deallocate(d, 128);
            block.deallocate(e, hole);
            block.check_invariants();
            assert_eq!(block.free_segments(), 1);
        }
    }

    /// Interleaved frees leave no adjacent free pairs, so nothing merges and
    /// a request bigger than one slot fails even though the total free space
    /// would cover it many times over.
    #[test]
    fn fragmentation_without_adjacency_does_not_coalesce() {
        unsafe {
            // Exactly 20 slots of 32 payload bytes (the last one eats the
            // remainder, which is too small to split).
            let mut block = Block::new(20 * (32 + H) + H).unwrap();

            let payloads: Vec<NonNull<u8>> =
                (0..20).map(|_| alloc(&mut block, 32).unwrap()).collect();
            block.check_invariants();
            assert_eq!(block.free_segments(), 0);

            for (index, &payload) in payloads.iter().enumerate() {
                if index % 2 == 0 {
                    block.deallocate(payload, 32);
                }
            }
            block.check_invariants();
            assert_eq!(block.free_segments(), 10);

            // 320 bytes are free, but no hole is bigger than 32.
            assert!(block.best_fit(64).is_none());
            assert!(block.best_fit(100).is_none());
            assert!(alloc(&mut block, 32).is_some());
        }
    }

    #[test]
    fn best_fit_is_read_only() {
        unsafe {
            let mut block = Block::new(1024).unwrap();
            alloc(&mut block, 64).unwrap();

            let first = block.best_fit(128);
            let second = block.best_fit(128);
            assert_eq!(first, second);
            block.check_invariants();
        }
    }

    #[test]
    fn randomized_churn_restores_single_span() {
        let mut rng = StdRng::seed_from_u64(42);
        let region = if cfg!(miri) { 1 << 16 } else { 1 << 20 };
        let rounds = if cfg!(miri) { 200 } else { 5000 };

        unsafe {
            let mut block = Block::new(region).unwrap();
            let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

            for round in 0..rounds {
                if live.is_empty() || rng.gen_bool(0.55) {
                    let bytes = rng.gen_range(8..=512);
                    if let Some(payload) = alloc(&mut block, bytes) {
                        let marker = (round % 251) as u8;
                        payload.as_ptr().write(marker);
                        payload.as_ptr().add(bytes - 1).write(marker);
                        live.push((payload, bytes, marker));
                    }
                } else {
                    let index = rng.gen_range(0..live.len());
                    let (payload, bytes, marker) = live.swap_remove(index);
                    assert_eq!(*payload.as_ptr(), marker);
                    assert_eq!(*payload.as_ptr().add(bytes - 1), marker);
                    block.deallocate(payload, bytes);
                }

                if round % 64 == 0 {
                    block.check_invariants();
                }
            }

            for (payload, bytes, _) in live.drain(..) {
                block.deallocate(payload, bytes);
            }
            block.check_invariants();
            assert_eq!(block.free_segments(), 1);
            assert_eq!(block.best_fit(1).unwrap().as_ref().size(), region - H);
        }
    }
}
