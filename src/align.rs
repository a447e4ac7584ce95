use std::mem;

/// Rounds `size` up to the next multiple of the machine word.
///
/// Every segment payload is a word multiple so that the header of the
/// following segment always lands on a word boundary. Requested sizes are
/// rounded through here before they reach the free tree.
#[inline]
pub(crate) fn word_align(size: usize) -> usize {
    (size + mem::size_of::<usize>() - 1) & !(mem::size_of::<usize>() - 1)
}

/// Overflow-checked variant of [`word_align`] for sizes that come straight
/// from the caller.
#[inline]
pub(crate) fn checked_word_align(size: usize) -> Option<usize> {
    let aligned = size.checked_add(mem::size_of::<usize>() - 1)?;
    Some(aligned & !(mem::size_of::<usize>() - 1))
}
