use std::time::Duration;

pub(crate) const DEFAULT_DATABASE_ID: &str = "(default)";

/// Number of batches the write stream keeps in flight.
pub(crate) const MAX_PENDING_WRITES: usize = 10;

pub(crate) const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

/// Failed watch connections tolerated before the client reports itself offline.
pub(crate) const MAX_WATCH_STREAM_FAILURES: u32 = 1;

pub(crate) const ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

/// A stream that stays open this long is considered healthy and its backoff resets.
pub(crate) const HEALTHY_STREAM_PERIOD: Duration = Duration::from_secs(10);
