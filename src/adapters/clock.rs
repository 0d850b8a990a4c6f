//! Clock adapters: wall clock for production, a settable clock for tests
//! and simulations.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::domain::truncate_timestamp;
use crate::ports::Clock;

/// Reads the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        truncate_timestamp(Utc::now())
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(truncate_timestamp(at)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("Lock failed");
        *now = truncate_timestamp(*now + by);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().expect("Lock failed") = truncate_timestamp(at);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("Lock failed")
    }
}
