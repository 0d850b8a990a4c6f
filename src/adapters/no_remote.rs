//! Remote endpoint used when no backend is configured.
//!
//! Every call fails as unreachable, so queued writes stay on the device and
//! nothing is ever acknowledged that was not really stored remotely.

use crate::domain::SyncEnvelope;
use crate::ports::{ConsentPage, RemoteAck, RemoteEndpoint, RemoteError};

const REASON: &str = "no remote endpoint configured";

#[derive(Debug, Default, Clone, Copy)]
pub struct NoRemote;

impl RemoteEndpoint for NoRemote {
    fn upsert(&self, _envelope: &SyncEnvelope) -> Result<RemoteAck, RemoteError> {
        Err(RemoteError::Unreachable(REASON.to_string()))
    }

    fn fetch_consents_since(&self, _cursor: Option<u64>) -> Result<ConsentPage, RemoteError> {
        Err(RemoteError::Unreachable(REASON.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ManualClock, SqliteStore};
    use crate::application::{BackoffPolicy, SyncQueue};
    use crate::domain::{EntityType, Entry, EntryKind, SyncQueueItem};
    use crate::ports::{Clock, LocalStore};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_nothing_is_ever_acknowledged() {
        let now = Utc.timestamp_opt(1_760_000_000, 0).single().expect("valid");
        let store = Arc::new(SqliteStore::in_memory().expect("db"));
        let queue = SyncQueue::new(
            Arc::clone(&store),
            Arc::new(NoRemote),
            Arc::new(ManualClock::new(now)) as Arc<dyn Clock>,
            BackoffPolicy::default(),
            Duration::from_secs(1),
        );

        let entry = Entry::new("p1", EntryKind::Manual, "headache", now);
        store.put_entry(&entry).expect("save");
        queue
            .enqueue(&SyncQueueItem::upsert(EntityType::Entry, entry.id.clone(), "p1", now))
            .expect("enqueue");

        let report = queue.drain().expect("drain");
        assert_eq!(report.synced, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(queue.pending_count().expect("count"), 1);
        assert!(store.get_entry(&entry.id).expect("load").expect("exists").synced_at.is_none());

        assert!(matches!(
            NoRemote.fetch_consents_since(None),
            Err(RemoteError::Unreachable(_))
        ));
    }
}
