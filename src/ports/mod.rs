//! Ports layer: Trait definitions for external operations.
//!
//! Following Hexagonal Architecture, these traits define the boundaries
//! between the sync engine and the things it does not own: on-device
//! storage, the backend, and the wall clock.

mod clock;
mod local_store;
mod remote;

pub use clock::Clock;
pub use local_store::{
    LocalStore, StoreError, StoredEntity, META_CONSENT_CURSOR, META_LAST_SYNC_AT,
};
pub use remote::{ConsentPage, RemoteAck, RemoteEndpoint, RemoteError};
