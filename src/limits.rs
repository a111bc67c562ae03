//! Fixed policy constants.

/// Grid granularity of the board.
pub const SLOT_MINUTES: u32 = 30;

/// Maximum property rows per visit.
pub const MAX_PROPERTIES: usize = 4;

/// An appointment locks once its start is further in the past than this.
pub const LOCK_GRACE_SECS: i64 = 60;

/// Same-day creation cutoffs (local time).
pub const SATURDAY_CUTOFF: (u32, u32) = (12, 30);
pub const WEEKDAY_CUTOFF: (u32, u32) = (18, 0);

/// Soft-deleted documents are hard-deleted after this many days.
pub const RETENTION_DAYS: i64 = 30;

/// Live subscription covers centre date ± this many days.
pub const SUBSCRIPTION_WINDOW_DAYS: i64 = 30;

/// Result cap for the live subscription and the retention scan.
pub const QUERY_CAP: usize = 2000;

/// Largest recurrence range an admin may request, in days.
pub const MAX_RECURRENCE_DAYS: i64 = 366;

/// Largest atomic batch the store accepts.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Buffered snapshots per live subscription before the oldest is dropped.
pub const SUBSCRIPTION_BUFFER: usize = 16;
