//! Clock port: Source of "now" for timestamps and backoff scheduling.

use chrono::{DateTime, Utc};

/// Trait for reading the current time.
pub trait Clock: Send + Sync {
    /// Current time, truncated to microseconds.
    fn now(&self) -> DateTime<Utc>;
}
