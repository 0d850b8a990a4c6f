//! Background sync worker.
//!
//! Drains the queue on connectivity changes, on demand and periodically while
//! online, without blocking the caller. Progress is reported on a channel.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{ConsentLedger, DrainReport, SyncQueue};
use crate::ports::{LocalStore, RemoteEndpoint};

/// Events that wake the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Connectivity came back: reconcile consent, then drain
    Online,
    /// Connectivity lost: stop periodic drains
    Offline,
    /// User asked for a sync now
    ForceSync,
    Shutdown,
}

/// Progress updates from the sync worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Consent reconciliation finished; number of pairs that changed
    Reconciled(usize),
    /// A drain pass finished
    Drained(DrainReport),
    /// A drain or reconciliation could not run
    Error(String),
}

/// Handle to a running sync worker. Dropping it stops the worker.
pub struct SyncWorkerHandle {
    trigger_tx: Sender<SyncTrigger>,
    /// Receiver for progress updates
    pub events: Receiver<SyncEvent>,
    handle: Option<JoinHandle<()>>,
}

impl SyncWorkerHandle {
    /// Wake the worker. Returns `false` if it already stopped.
    pub fn trigger(&self, trigger: SyncTrigger) -> bool {
        self.trigger_tx.send(trigger).is_ok()
    }

    /// Try to receive the next progress update (non-blocking).
    #[must_use]
    pub fn try_recv(&self) -> Option<SyncEvent> {
        self.events.try_recv().ok()
    }

    /// Wait up to `timeout` for the next progress update.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SyncEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    /// Stop the worker and wait for the current drain to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.trigger_tx.send(SyncTrigger::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SyncWorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker that drains the sync queue in background.
pub struct SyncWorker;

impl SyncWorker {
    /// Spawn the worker thread.
    pub fn spawn<S, R>(
        queue: Arc<SyncQueue<S, R>>,
        ledger: Arc<ConsentLedger<S, R>>,
        interval: Duration,
        start_online: bool,
    ) -> SyncWorkerHandle
    where
        S: LocalStore + 'static,
        R: RemoteEndpoint + 'static,
    {
        let (trigger_tx, trigger_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            Self::run(&queue, &ledger, &trigger_rx, &event_tx, interval, start_online);
        });

        SyncWorkerHandle {
            trigger_tx,
            events: event_rx,
            handle: Some(handle),
        }
    }

    fn run<S, R>(
        queue: &SyncQueue<S, R>,
        ledger: &ConsentLedger<S, R>,
        triggers: &Receiver<SyncTrigger>,
        events: &Sender<SyncEvent>,
        interval: Duration,
        mut online: bool,
    ) where
        S: LocalStore + 'static,
        R: RemoteEndpoint + 'static,
    {
        tracing::info!("Sync worker started (online: {})", online);

        loop {
            match triggers.recv_timeout(interval) {
                Ok(SyncTrigger::Online) => {
                    online = true;
                    tracing::info!("Connectivity restored");
                    Self::reconcile(ledger, events);
                    Self::drain(queue, events);
                }
                Ok(SyncTrigger::Offline) => {
                    online = false;
                    tracing::info!("Connectivity lost, periodic sync paused");
                }
                Ok(SyncTrigger::ForceSync) => Self::drain(queue, events),
                Ok(SyncTrigger::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if online {
                        Self::drain(queue, events);
                    }
                }
            }
        }

        tracing::info!("Sync worker stopped");
    }

    fn reconcile<S, R>(ledger: &ConsentLedger<S, R>, events: &Sender<SyncEvent>)
    where
        S: LocalStore + 'static,
        R: RemoteEndpoint + 'static,
    {
        let event = match ledger.reconcile() {
            Ok(changed) => SyncEvent::Reconciled(changed),
            Err(e) => {
                tracing::warn!("Consent reconciliation failed: {}", e);
                SyncEvent::Error(e.to_string())
            }
        };
        let _ = events.send(event);
    }

    fn drain<S, R>(queue: &SyncQueue<S, R>, events: &Sender<SyncEvent>)
    where
        S: LocalStore + 'static,
        R: RemoteEndpoint + 'static,
    {
        let event = match queue.drain() {
            Ok(report) => SyncEvent::Drained(report),
            Err(e) => {
                tracing::error!("Drain failed: {}", e);
                SyncEvent::Error(e.to_string())
            }
        };
        let _ = events.send(event);
    }
}
