use thiserror::Error;

/// An error returned by a map operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A construction parameter was invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A compute callback attempted to modify a bin that it is already computing.
    ///
    /// Callbacks passed to [`HashMap::compute`](crate::HashMap::compute) and related
    /// methods must not update the map for keys that may share a bin with the key
    /// being computed.
    #[error("recursive update")]
    RecursiveUpdate,

    /// Allocating a table failed.
    ///
    /// The map remains valid at its previous size. When the allocation was a resize
    /// triggered by an insertion, the inserted mapping is still present.
    #[error("failed to allocate a table with {capacity} bins")]
    AllocationFailed { capacity: usize },

    /// The requested capacity exceeds the maximum table size.
    #[error("capacity overflow")]
    CapacityOverflow,
}
