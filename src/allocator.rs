use std::{
    alloc::{AllocError, Allocator, Layout},
    mem,
    ptr::NonNull,
    sync::Mutex,
};

use crate::{
    container::BlockContainer, error::Error, header::Header, segment::Segment,
};

/// Default bytes per mapped block, which is also the largest single
/// allocation the allocator can serve. Generous on purpose: the pages are
/// only reserved, the kernel doesn't commit them until they're touched.
pub const DEFAULT_BLOCK_SIZE: usize = 256 * 1024 * 1024;

/// Default cap on the number of mapped blocks. Total capacity is
/// `DEFAULT_BLOCK_SIZE * DEFAULT_MAX_BLOCKS`.
pub const DEFAULT_MAX_BLOCKS: usize = 4;

/// Best-fit allocator over a fixed set of anonymous memory mappings.
///
/// The two const parameters are the entire configuration: `BLOCK_SIZE` is
/// the size of each region requested from the OS (and therefore the upper
/// bound on a single allocation), `MAX_BLOCKS` caps how many regions will
/// ever be mapped. Once every block is full and the cap is reached,
/// allocation fails until something is freed; nothing is ever swapped out
/// behind the caller's back.
///
/// The interior [`BlockContainer`] is single threaded by design, so the
/// public type wraps it in a [`Mutex`] to satisfy the `&self` contract of
/// [`Allocator`]. Callers that want different locking can keep the
/// allocator thread-local and pay nothing for the uncontended lock.
///
/// # Examples
///
/// Raw byte-count API:
///
/// ```rust
/// use rballoc::Rballoc;
///
/// let allocator = Rballoc::<{ 64 * 1024 }, 4>::try_new().unwrap();
///
/// let address = allocator.alloc(128).unwrap();
/// unsafe {
///     address.as_ptr().write_bytes(0, 128);
///     allocator.dealloc(address, 128).unwrap();
/// }
/// ```
///
/// Standard collections through the allocator API:
///
/// ```rust
/// #![feature(allocator_api)]
///
/// use rballoc::Rballoc;
///
/// let allocator = Rballoc::<{ 64 * 1024 }, 4>::try_new().unwrap();
///
/// let number = Box::new_in(12, &allocator);
/// assert_eq!(*number, 12);
///
/// let mut values = Vec::new_in(&allocator);
/// values.push(5);
/// assert_eq!(values[0], 5);
/// ```
pub struct Rballoc<
    const BLOCK_SIZE: usize = DEFAULT_BLOCK_SIZE,
    const MAX_BLOCKS: usize = DEFAULT_MAX_BLOCKS,
> {
    container: Mutex<BlockContainer<BLOCK_SIZE, MAX_BLOCKS>>,
}

/// The container is full of raw pointers into mapped regions, which makes it
/// `!Sync` by default; the mutex serializes every touch of them.
unsafe impl<const BLOCK_SIZE: usize, const MAX_BLOCKS: usize> Sync
    for Rballoc<BLOCK_SIZE, MAX_BLOCKS>
{
}

unsafe impl<const BLOCK_SIZE: usize, const MAX_BLOCKS: usize> Send
    for Rballoc<BLOCK_SIZE, MAX_BLOCKS>
{
}

impl<const BLOCK_SIZE: usize, const MAX_BLOCKS: usize> Rballoc<BLOCK_SIZE, MAX_BLOCKS> {
    /// Builds the allocator and eagerly maps the first block, so a
    /// misconfigured or memory-starved environment fails here rather than on
    /// some later allocation.
    pub fn try_new() -> Result<Self, Error> {
        let container = unsafe { BlockContainer::new()? };

        Ok(Self {
            container: Mutex::new(container),
        })
    }

    /// Allocates `bytes` bytes and returns the payload address.
    ///
    /// [`Error::InvalidRequest`] for zero bytes, [`Error::Exhausted`] when
    /// no block can fit the request and no new block may be mapped.
    pub fn alloc(&self, bytes: usize) -> Result<NonNull<u8>, Error> {
        match self.container.lock() {
            Ok(mut container) => unsafe { container.allocate(bytes) },
            Err(_) => Err(Error::Exhausted),
        }
    }

    /// Frees an allocation made by [`Rballoc::alloc`].
    ///
    /// The byte count travels along for API symmetry; the in-band header is
    /// what actually knows the segment size. Pointers that no block contains
    /// are reported as [`Error::InvalidRequest`] and nothing is freed.
    ///
    /// # Safety
    ///
    /// `address` must be live, i.e. previously returned by
    /// [`Rballoc::alloc`] on this allocator and not freed since.
    pub unsafe fn dealloc(&self, address: NonNull<u8>, bytes: usize) -> Result<(), Error> {
        match self.container.lock() {
            Ok(mut container) => container.deallocate(address, bytes),
            Err(_) => Ok(()),
        }
    }
}

unsafe impl<const BLOCK_SIZE: usize, const MAX_BLOCKS: usize> Allocator
    for Rballoc<BLOCK_SIZE, MAX_BLOCKS>
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        // Segments are naturally aligned to their headers and nothing more;
        // stricter layouts are out of contract.
        if layout.align() > mem::align_of::<Header<Segment>>() {
            return Err(AllocError);
        }

        // Zero-sized layouts are legal for this trait, a one byte request
        // rounds up to the same minimum segment.
        let bytes = layout.size().max(1);

        match self.alloc(bytes) {
            Ok(address) => {
                // The segment can be bigger than requested when the
                // remainder was too small to split off; report what the
                // caller really owns.
                let header = unsafe { Header::<Segment>::from_payload_address(address) };
                let size = unsafe { header.as_ref().size() };
                Ok(NonNull::slice_from_raw_parts(address, size))
            }
            Err(_) => Err(AllocError),
        }
    }

    unsafe fn deallocate(&self, address: NonNull<u8>, layout: Layout) {
        let _ = self.dealloc(address, layout.size());
    }
}
