use std::ptr::NonNull;

use crate::node::Node;

/// Every segment begins with its metadata record, so a segment header is just
/// a tree node sitting at the start of the segment. This alias is what we use
/// when we want to talk about the in-band header without thinking about tree
/// nodes.
pub(crate) type Header<T> = Node<T>;

impl<T> Header<T> {
    /// Returns a pointer to a [`Header<T>`] given an address that points right
    /// after a valid [`Header<T>`].
    ///
    /// ```text
    /// +-------------+
    /// |  Header<T>  | <- Returned address points here.
    /// +-------------+
    /// |   Payload   | <- Given address should point here.
    /// +-------------+
    /// |     ...     |
    /// +-------------+
    /// ```
    ///
    /// # Safety
    ///
    /// Caller must guarantee that `address` points exactly to the first
    /// memory cell after a [`Header<T>`]. This is used to recover the segment
    /// from a pointer handed out by a previous allocation, so as long as the
    /// allocator user gives us back the addresses we produced, this is safe.
    /// Anything else is undefined behaviour.
    #[inline]
    pub unsafe fn from_payload_address(address: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(address.as_ptr().cast::<Self>().offset(-1))
    }

    /// Returns the address right after the header, which is where the payload
    /// of the segment begins.
    ///
    /// # Safety
    ///
    /// If `header` points to a valid [`Header<T>`] placed inside a mapped
    /// region, the returned address is safe to use for as many bytes as the
    /// segment's recorded size.
    ///
    /// # Notes
    ///
    /// We use this as `Header::payload_address_of(header)` instead of
    /// `header.payload_address()` to avoid manufacturing intermediary
    /// references to `self`, which would upset Miri's aliasing model. See
    /// [Stacked Borrows](https://github.com/rust-lang/unsafe-code-guidelines/blob/master/wip/stacked-borrows.md).
    #[inline]
    pub unsafe fn payload_address_of(header: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(header.as_ptr().offset(1)).cast()
    }
}
