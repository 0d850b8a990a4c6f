//! Wiring of the offline core services around one store and one remote.

use std::sync::Arc;

use super::{
    ConsentGate, ConsentLedger, GatePoller, ProtectedView, RecordService, SyncQueue, SyncWorker,
    SyncWorkerHandle,
};
use crate::config::SyncConfig;
use crate::ports::{Clock, LocalStore, RemoteEndpoint};
use crate::Result;

/// The store, queue, ledger and record service sharing one configuration.
pub struct OfflineCore<S, R>
where
    S: LocalStore,
    R: RemoteEndpoint,
{
    pub store: Arc<S>,
    pub queue: Arc<SyncQueue<S, R>>,
    pub ledger: Arc<ConsentLedger<S, R>>,
    pub records: RecordService<S, R>,
    config: SyncConfig,
}

impl<S, R> OfflineCore<S, R>
where
    S: LocalStore + 'static,
    R: RemoteEndpoint + 'static,
{
    pub fn new(store: Arc<S>, remote: Arc<R>, clock: Arc<dyn Clock>, config: SyncConfig) -> Self {
        let queue = Arc::new(SyncQueue::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            Arc::clone(&clock),
            config.backoff(),
            config.remote_timeout,
        ));
        let ledger = Arc::new(ConsentLedger::new(
            Arc::clone(&store),
            remote,
            Arc::clone(&queue),
            Arc::clone(&clock),
        ));
        let records = RecordService::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&ledger),
            clock,
        );

        Self {
            store,
            queue,
            ledger,
            records,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Re-queue writes that were stored but never queued (crash recovery).
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub fn recover(&self) -> Result<usize> {
        self.queue.recover()
    }

    /// Mount a doctor-sharing gate for a subject.
    #[must_use]
    pub fn gate(&self, subject_id: &str) -> ConsentGate<S, R> {
        ConsentGate::mount(Arc::clone(&self.ledger), subject_id)
    }

    /// Doctor-facing view of protected data for a subject.
    #[must_use]
    pub fn doctor_view<T>(&self, subject_id: &str) -> ProtectedView<S, R, T> {
        ProtectedView::new(self.gate(subject_id))
    }

    /// Poll a subject's doctor-sharing gate in background.
    #[must_use]
    pub fn spawn_gate_poller(&self, subject_id: &str) -> GatePoller {
        GatePoller::spawn(self.gate(subject_id), self.config.consent_poll_interval)
    }

    /// Start the background sync worker.
    #[must_use]
    pub fn spawn_worker(&self, start_online: bool) -> SyncWorkerHandle {
        SyncWorker::spawn(
            Arc::clone(&self.queue),
            Arc::clone(&self.ledger),
            self.config.sync_interval,
            start_online,
        )
    }
}
