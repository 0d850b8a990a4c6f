//! Adapters layer: Concrete implementations of ports.
//!
//! - `sqlite`: SQLite for on-device storage
//! - `loopback`: in-process remote endpoint
//! - `no_remote`: endpoint for devices with no backend configured
//! - `clock`: system and manual clocks
//! - `sanitize`: identifier filtering for logs

pub mod clock;
pub mod loopback;
pub mod no_remote;
pub mod sanitize;
pub mod sqlite;

pub use clock::{ManualClock, SystemClock};
pub use loopback::LoopbackRemote;
pub use no_remote::NoRemote;
pub use sqlite::SqliteStore;
