use std::{error, fmt};

/// Failures surfaced by the allocator.
///
/// The distinction matters to callers: [`Error::Exhausted`] is an honest
/// out-of-memory answer that may succeed later after some deallocations,
/// while [`Error::InvalidRequest`] means the call itself was malformed and
/// retrying it is pointless.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The page provider refused a new region, or every block is full and
    /// the container already reached its block limit.
    Exhausted,
    /// Zero-size allocation, or a deallocation with a pointer that no
    /// initialized block contains.
    InvalidRequest,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Exhausted => f.write_str("out of memory"),
            Error::InvalidRequest => f.write_str("invalid allocation request"),
        }
    }
}

impl error::Error for Error {}
