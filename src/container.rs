use std::ptr::NonNull;

use crate::{block::Block, error::Error, header::Header, segment::Segment};

/// Fixed capacity collection of [`Block`]s behind a single allocation
/// interface.
///
/// Slot 0 is mapped eagerly on construction; further slots stay empty until
/// an allocation finds no fit anywhere and the container grows by exactly
/// one block. `current_index` is the high-water mark: every slot up to and
/// including it holds a live block, every slot beyond it is `None` and never
/// touched. Blocks are never unmapped individually; they live until the
/// container itself is dropped.
///
/// On allocation each live block reports its local best fit and the
/// globally smallest candidate wins, with the lower index breaking ties, so
/// results are deterministic. On deallocation the owning block is found by
/// address range containment.
pub(crate) struct BlockContainer<const BLOCK_SIZE: usize, const MAX_BLOCKS: usize> {
    blocks: [Option<Block>; MAX_BLOCKS],
    /// Highest initialized slot.
    current_index: usize,
}

impl<const BLOCK_SIZE: usize, const MAX_BLOCKS: usize> BlockContainer<BLOCK_SIZE, MAX_BLOCKS> {
    /// Builds the container and maps its first block.
    ///
    /// # Panics
    ///
    /// If `MAX_BLOCKS` is zero, which is a configuration mistake rather
    /// than a runtime condition. A `BLOCK_SIZE` too small for even one
    /// segment header surfaces as [`Error::Exhausted`] from [`Block::new`].
    ///
    /// # Safety
    ///
    /// Same as [`Block::new`]; provider failure surfaces as
    /// [`Error::Exhausted`].
    pub unsafe fn new() -> Result<Self, Error> {
        assert!(MAX_BLOCKS > 0, "containers need at least one block");

        const EMPTY: Option<Block> = None;
        let mut blocks = [EMPTY; MAX_BLOCKS];
        blocks[0] = Some(Block::new(BLOCK_SIZE)?);

        Ok(Self {
            blocks,
            current_index: 0,
        })
    }

    /// Allocates `bytes` from the block with the globally best fitting free
    /// segment, mapping one more block if nothing fits and capacity allows.
    ///
    /// # Safety
    ///
    /// The container must be in a consistent state (it always is between
    /// public calls).
    pub unsafe fn allocate(&mut self, bytes: usize) -> Result<NonNull<u8>, Error> {
        if bytes == 0 {
            return Err(Error::InvalidRequest);
        }

        let (index, node) = match self.best_fit_across(bytes) {
            Some(winner) => winner,
            None => self.grow_then_retry(bytes)?,
        };

        // Winner indexes never exceed current_index, so the slot is live.
        let block = self.blocks[index].as_mut().unwrap_unchecked();
        Ok(block.allocate(bytes, node))
    }

    /// Returns the freed bytes to the owning block, which coalesces them
    /// with free neighbors.
    ///
    /// # Safety
    ///
    /// If `payload` lies within one of the blocks, it must be live and
    /// previously returned by [`BlockContainer::allocate`]; addresses
    /// outside every block are rejected with [`Error::InvalidRequest`].
    pub unsafe fn deallocate(&mut self, payload: NonNull<u8>, bytes: usize) -> Result<(), Error> {
        let owner = self.owner_of(payload).ok_or(Error::InvalidRequest)?;

        let block = self.blocks[owner].as_mut().unwrap_unchecked();
        block.deallocate(payload, bytes);

        Ok(())
    }

    /// Queries every initialized block and keeps the smallest fitting
    /// segment. Lower indexes win ties, so repeated calls pick the same
    /// block.
    unsafe fn best_fit_across(&self, bytes: usize) -> Option<(usize, NonNull<Header<Segment>>)> {
        let mut winner = None;
        let mut winner_size = usize::MAX;

        for index in 0..=self.current_index {
            let block = self.blocks[index].as_ref().unwrap_unchecked();
            if let Some(node) = block.best_fit(bytes) {
                let size = node.as_ref().size();
                if size < winner_size {
                    winner_size = size;
                    winner = Some((index, node));
                }
            }
        }

        winner
    }

    /// Maps one more block and retries the fit against it alone. Called only
    /// after every existing block came up empty, so there is no point in
    /// scanning them again. If the new block cannot satisfy the request
    /// either (it is larger than a whole fresh block), the allocation fails
    /// for good.
    ///
    /// A failed mapping leaves `current_index` untouched: the container
    /// never exposes a half-initialized slot.
    unsafe fn grow_then_retry(
        &mut self,
        bytes: usize,
    ) -> Result<(usize, NonNull<Header<Segment>>), Error> {
        if self.current_index + 1 >= MAX_BLOCKS {
            return Err(Error::Exhausted);
        }

        let block = Block::new(BLOCK_SIZE)?;
        let index = self.current_index + 1;
        self.blocks[index] = Some(block);
        self.current_index = index;

        let block = self.blocks[index].as_ref().unwrap_unchecked();
        match block.best_fit(bytes) {
            Some(node) => Ok((index, node)),
            None => Err(Error::Exhausted),
        }
    }

    /// Index of the block whose address range contains `payload`. Linear
    /// scan; `MAX_BLOCKS` is small enough that an acceleration structure
    /// would not pay for itself.
    fn owner_of(&self, payload: NonNull<u8>) -> Option<usize> {
        (0..=self.current_index).find(|&index| {
            // Every slot up to current_index is live.
            let block = unsafe { self.blocks[index].as_ref().unwrap_unchecked() };
            block.contains(payload)
        })
    }
}
