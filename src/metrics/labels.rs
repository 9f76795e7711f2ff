//! Label values shared by counters and histograms

/// Attempt or resolution succeeded
pub const OUTCOME_SUCCESS: &str = "success";
/// Attempt failed and will be retried
pub const OUTCOME_RETRY: &str = "retry";
/// Attempt failed and ended the connect loop
pub const OUTCOME_ABORT: &str = "abort";
/// Operation failed
pub const OUTCOME_ERROR: &str = "error";

/// Cache returned an existing record
pub const CACHE_HIT: &str = "hit";
/// Cache had to build a record
pub const CACHE_MISS: &str = "miss";
