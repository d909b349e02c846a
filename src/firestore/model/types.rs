/// Identifier of a watched target. Even ids are allocated by the target cache,
/// odd ids by the sync engine for limbo resolutions.
pub type TargetId = i32;

/// Identifier of a mutation batch, strictly increasing in creation order.
pub type BatchId = i32;

/// Logical clock used to order cache activity for LRU collection.
pub type ListenSequenceNumber = i64;

pub const BATCH_ID_UNKNOWN: BatchId = -1;

pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;
