//! Consent visibility gate for doctor-facing views.
//!
//! A gate starts in `Loading` every time it is mounted and resolves to
//! `Granted`, `Revoked` or `Pending` from the ledger. Protected data lives in
//! a `ProtectedView`, which re-derives consent from the ledger on every load
//! and every read, and drops what it holds as soon as the gate leaves
//! `Granted`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::ConsentLedger;
use crate::domain::{ConsentState, ConsentType};
use crate::ports::{LocalStore, RemoteEndpoint};
use crate::{CareVistaError, Result};

/// What a doctor-facing view may show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Not evaluated yet; nothing protected is read
    Loading,
    Granted,
    /// A grant existed and was revoked
    Revoked,
    /// Never granted
    Pending,
}

impl From<ConsentState> for GateState {
    fn from(state: ConsentState) -> Self {
        match state {
            ConsentState::Granted => Self::Granted,
            ConsentState::Revoked => Self::Revoked,
            ConsentState::NeverGranted => Self::Pending,
        }
    }
}

/// Gate for one (subject, consent type) pair.
pub struct ConsentGate<S, R>
where
    S: LocalStore,
    R: RemoteEndpoint,
{
    ledger: Arc<ConsentLedger<S, R>>,
    subject_id: String,
    consent_type: ConsentType,
    state: GateState,
    grant_seen: bool,
}

impl<S, R> ConsentGate<S, R>
where
    S: LocalStore + 'static,
    R: RemoteEndpoint + 'static,
{
    /// Mount a doctor-sharing gate for a subject.
    pub fn mount(ledger: Arc<ConsentLedger<S, R>>, subject_id: impl Into<String>) -> Self {
        Self::mount_for(ledger, subject_id, ConsentType::DoctorSharing)
    }

    pub fn mount_for(
        ledger: Arc<ConsentLedger<S, R>>,
        subject_id: impl Into<String>,
        consent_type: ConsentType,
    ) -> Self {
        Self {
            ledger,
            subject_id: subject_id.into(),
            consent_type,
            state: GateState::Loading,
            grant_seen: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> GateState {
        self.state
    }

    #[must_use]
    pub fn is_granted(&self) -> bool {
        self.state == GateState::Granted
    }

    #[must_use]
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// Re-derive the state from local records.
    ///
    /// A local read failure never yields `Granted`: the gate reports
    /// `Revoked` if a grant was known, `Pending` otherwise.
    pub fn evaluate(&mut self) -> GateState {
        let next = match self.ledger.current_state(&self.subject_id, self.consent_type) {
            Ok(snapshot) => GateState::from(snapshot.state()),
            Err(e) => {
                tracing::warn!("Consent read failed, gate closed: {}", e);
                let known_grant = self.grant_seen
                    || self.ledger.cached_state(&self.subject_id, self.consent_type).is_some();
                if known_grant {
                    GateState::Revoked
                } else {
                    GateState::Pending
                }
            }
        };

        if next == GateState::Granted {
            self.grant_seen = true;
        }
        if next != self.state {
            tracing::debug!(consent_type = %self.consent_type, "Gate {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        next
    }

    /// Reconcile with the remote ledger, then evaluate. A reconciliation
    /// failure falls back to the last local value.
    pub fn refresh(&mut self) -> GateState {
        if let Err(e) = self.ledger.reconcile() {
            tracing::warn!("Using local consent state: {}", e);
        }
        self.evaluate()
    }

    /// Periodic check.
    pub fn poll(&mut self) -> GateState {
        self.evaluate()
    }
}

/// Holder of protected data that only keeps it while the gate is granted.
pub struct ProtectedView<S, R, T>
where
    S: LocalStore,
    R: RemoteEndpoint,
{
    gate: ConsentGate<S, R>,
    data: Option<T>,
}

impl<S, R, T> ProtectedView<S, R, T>
where
    S: LocalStore + 'static,
    R: RemoteEndpoint + 'static,
{
    pub fn new(gate: ConsentGate<S, R>) -> Self {
        Self { gate, data: None }
    }

    #[must_use]
    pub fn gate(&self) -> &ConsentGate<S, R> {
        &self.gate
    }

    #[must_use]
    pub fn state(&self) -> GateState {
        self.gate.state()
    }

    /// Load protected data through `loader` if consent is granted right now.
    ///
    /// Consent is checked immediately before and again after loading; a
    /// revoke landing in between discards the result.
    ///
    /// # Errors
    /// Returns the loader's error.
    pub fn load<F>(&mut self, loader: F) -> Result<Option<&T>>
    where
        F: FnOnce() -> Result<T>,
    {
        if self.gate.evaluate() != GateState::Granted {
            self.evict();
            return Ok(None);
        }

        let loaded = loader()?;

        if self.gate.evaluate() != GateState::Granted {
            self.evict();
            return Ok(None);
        }

        self.data = Some(loaded);
        Ok(self.data.as_ref())
    }

    /// Re-check consent, dropping held data if it is no longer granted.
    pub fn poll(&mut self) -> GateState {
        let state = self.gate.poll();
        if state != GateState::Granted {
            self.evict();
        }
        state
    }

    /// Protected data, if held and consent is still granted.
    ///
    /// Consent is re-derived from the ledger on every call; a revoke that
    /// landed since the last poll evicts the data here.
    pub fn data(&mut self) -> Option<&T> {
        if self.gate.evaluate() != GateState::Granted {
            self.evict();
            return None;
        }

        match self.check() {
            Ok(()) => self.data.as_ref(),
            Err(e) => {
                debug_assert!(false, "{e}");
                tracing::error!("{}", e);
                None
            }
        }
    }

    fn check(&self) -> Result<()> {
        if self.data.is_some() && !self.gate.is_granted() {
            return Err(CareVistaError::ConsentViolation {
                subject_id: self.gate.subject_id().to_string(),
            });
        }
        Ok(())
    }

    fn evict(&mut self) {
        if self.data.take().is_some() {
            tracing::info!("Consent no longer granted, protected data evicted");
        }
    }
}

/// Background re-check of a gate at a fixed interval.
///
/// Sends the new state on every change. Stops when cancelled or dropped.
pub struct GatePoller {
    updates: Receiver<GateState>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl GatePoller {
    pub fn spawn<S, R>(mut gate: ConsentGate<S, R>, interval: Duration) -> Self
    where
        S: LocalStore + 'static,
        R: RemoteEndpoint + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            let mut last = None;
            while !stop_flag.load(Ordering::SeqCst) {
                let state = gate.poll();
                if last != Some(state) {
                    if tx.send(state).is_err() {
                        break;
                    }
                    last = Some(state);
                }
                thread::park_timeout(interval);
            }
        });

        Self {
            updates: rx,
            stop,
            handle: Some(handle),
        }
    }

    /// Next state change, if one arrived (non-blocking).
    #[must_use]
    pub fn try_recv(&self) -> Option<GateState> {
        self.updates.try_recv().ok()
    }

    /// Wait up to `timeout` for the next state change.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<GateState> {
        self.updates.recv_timeout(timeout).ok()
    }

    pub fn cancel(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for GatePoller {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LoopbackRemote, ManualClock, SqliteStore};
    use crate::application::{BackoffPolicy, SyncQueue};
    use crate::ports::Clock;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).single().expect("valid")
    }

    fn ledger() -> Arc<ConsentLedger<SqliteStore, LoopbackRemote>> {
        let store = Arc::new(SqliteStore::in_memory().expect("db"));
        let remote = Arc::new(LoopbackRemote::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(at(0)));
        let queue = Arc::new(SyncQueue::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            Arc::clone(&clock),
            BackoffPolicy::default(),
            Duration::from_secs(1),
        ));
        Arc::new(ConsentLedger::new(store, remote, queue, clock))
    }

    #[test]
    fn test_gate_starts_loading_and_resolves() {
        let ledger = ledger();
        let mut gate = ConsentGate::mount(Arc::clone(&ledger), "p1");
        assert_eq!(gate.state(), GateState::Loading);
        assert_eq!(gate.evaluate(), GateState::Pending);

        ledger.grant("p1", ConsentType::DoctorSharing, at(0), None).expect("grant");
        assert_eq!(gate.poll(), GateState::Granted);

        ledger.revoke("p1", ConsentType::DoctorSharing, at(5)).expect("revoke");
        assert_eq!(gate.poll(), GateState::Revoked);

        // Remounting goes through loading again.
        let gate = ConsentGate::mount(Arc::clone(&ledger), "p1");
        assert_eq!(gate.state(), GateState::Loading);
    }

    #[test]
    fn test_view_evicts_on_revoke() {
        let ledger = ledger();
        ledger.grant("p1", ConsentType::DoctorSharing, at(0), None).expect("grant");

        let mut view = ProtectedView::new(ConsentGate::mount(Arc::clone(&ledger), "p1"));
        let loaded = view.load(|| Ok("summary".to_string())).expect("load");
        assert_eq!(loaded.map(String::as_str), Some("summary"));

        ledger.revoke("p1", ConsentType::DoctorSharing, at(1)).expect("revoke");
        assert_eq!(view.poll(), GateState::Revoked);
        assert!(view.data().is_none());
    }

    #[test]
    fn test_read_after_revoke_without_poll_is_empty() {
        let ledger = ledger();
        ledger.grant("p1", ConsentType::DoctorSharing, at(0), None).expect("grant");

        let mut view = ProtectedView::new(ConsentGate::mount(Arc::clone(&ledger), "p1"));
        view.load(|| Ok("intake summary".to_string())).expect("load");
        assert_eq!(view.data().map(String::as_str), Some("intake summary"));

        ledger.revoke("p1", ConsentType::DoctorSharing, at(1)).expect("revoke");
        assert!(view.data().is_none());
        assert_eq!(view.state(), GateState::Revoked);

        // Evicted, not hidden: a later grant does not bring the old data back.
        ledger.grant("p1", ConsentType::DoctorSharing, at(2), None).expect("grant");
        assert!(view.data().is_none());
    }

    #[test]
    fn test_view_never_loads_without_consent() {
        let ledger = ledger();
        let mut view: ProtectedView<_, _, String> =
            ProtectedView::new(ConsentGate::mount(Arc::clone(&ledger), "p1"));

        let mut called = false;
        let loaded = view
            .load(|| {
                called = true;
                Ok("summary".to_string())
            })
            .expect("load");
        assert!(loaded.is_none());
        assert!(!called);
        assert_eq!(view.state(), GateState::Pending);
    }

    #[test]
    fn test_revoke_during_load_discards_result() {
        let ledger = ledger();
        ledger.grant("p1", ConsentType::DoctorSharing, at(0), None).expect("grant");
        let mut view = ProtectedView::new(ConsentGate::mount(Arc::clone(&ledger), "p1"));

        let revoking = Arc::clone(&ledger);
        let loaded = view
            .load(|| {
                revoking.revoke("p1", ConsentType::DoctorSharing, at(1))?;
                Ok(vec![1, 2, 3])
            })
            .expect("load");
        assert!(loaded.is_none());
        assert!(view.data().is_none());
    }

    #[test]
    fn test_poller_reports_changes_and_stops() {
        let ledger = ledger();
        let gate = ConsentGate::mount(Arc::clone(&ledger), "p1");
        let mut poller = GatePoller::spawn(gate, Duration::from_millis(10));

        assert_eq!(poller.recv_timeout(Duration::from_secs(2)), Some(GateState::Pending));
        ledger.grant("p1", ConsentType::DoctorSharing, at(0), None).expect("grant");
        assert_eq!(poller.recv_timeout(Duration::from_secs(2)), Some(GateState::Granted));

        poller.cancel();
        assert!(poller.handle.is_none());
    }
}
