use std::mem;

use static_assertions::const_assert;

use crate::Pointer;

// The packed `value` word dedicates its two highest bits to flags, so the
// whole scheme needs at least 64 bit words.
const_assert!(mem::size_of::<usize>() >= 8);

/// Intrusive search tree node. The allocator cannot allocate memory for its
/// own bookkeeping (we *are* the allocator), so every piece of metadata lives
/// inside the memory it describes. A node carries the three links that the
/// red-black tree needs, one packed machine word, and a `data` payload for
/// whatever else the embedding structure wants to store next to the links.
///
/// The `value` word is shared between the tree and its callers:
///
/// ```text
///   bit 63      bit 62      bits 0..=61
/// +-----------+-----------+--------------------------------------+
/// | color     | status    | size                                 |
/// | 1 = red   | 1 = used  | payload bytes, excluding the header  |
/// +-----------+-----------+--------------------------------------+
/// ```
///
/// The tree owns bit 63 and compares nodes on everything below it; the
/// allocator owns bit 62 and the size bits (see [`crate::segment`]). Nothing
/// ever reads `value` without masking the bits that belong to the other
/// party.
///
/// The link fields are only meaningful while the node is inserted in a tree.
/// After [`crate::rbtree::RbTree::remove`] they hold whatever the unlinking
/// left behind, and the embedding structure must not read them.
pub(crate) struct Node<T> {
    pub left: Pointer<Self>,
    pub right: Pointer<Self>,
    pub parent: Pointer<Self>,
    /// Packed color, status and size. See the struct docs.
    pub value: usize,
    pub data: T,
}
