//! Call state coordination
//!
//! Owns the current call and turns the calling SDK's lifecycle callbacks,
//! which may arrive duplicated or out of order, into at most one backend
//! status write per transition. Only the caller side writes; the callee
//! observes the same events and just clears its local state.
//!
//! Failed writes are retried per [`RetryPolicy`] in a background task and
//! land in the durable queue when the retries are exhausted. The queue is
//! drained whenever connectivity comes back.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::*;
use crate::network::{CallRecordClient, ConnectivityMonitor};
use crate::retry::RetryPolicy;
use crate::storage::LocalStorage;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Delivered,
    /// Already delivered or currently being sent by another task.
    Deduplicated,
    RetryScheduled,
    Queued,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    InFlight,
    Delivered,
}

enum Attempt {
    Sent,
    Skipped,
}

type WriteKey = (String, CallStatus);

/// Calls whose terminal status is delivered; older ones are forgotten.
const FINISHED_CALLS_KEPT: usize = 64;

fn is_terminal(status: CallStatus) -> bool {
    matches!(status, CallStatus::Ended | CallStatus::Failed)
}

/// Per-(call, status) claims. Once a call's terminal status is delivered its
/// entries collapse into `finished`, and any later write for it is a duplicate.
#[derive(Default)]
struct WriteLog {
    writes: HashMap<WriteKey, WriteState>,
    finished: VecDeque<String>,
}

impl WriteLog {
    fn is_finished(&self, call_id: &str) -> bool {
        self.finished.iter().any(|id| id == call_id)
    }

    fn is_delivered(&self, key: &WriteKey) -> bool {
        self.is_finished(&key.0) || self.writes.get(key) == Some(&WriteState::Delivered)
    }

    /// False when the write is delivered or already in flight.
    fn claim(&mut self, key: &WriteKey) -> bool {
        if self.is_finished(&key.0) || self.writes.contains_key(key) {
            return false;
        }
        self.writes.insert(key.clone(), WriteState::InFlight);
        true
    }

    fn release(&mut self, key: &WriteKey) {
        self.writes.remove(key);
    }

    fn delivered(&mut self, key: WriteKey) {
        let (call_id, status) = key;
        if !is_terminal(status) {
            if self.is_finished(&call_id) {
                self.writes.remove(&(call_id, status));
            } else {
                self.writes.insert((call_id, status), WriteState::Delivered);
            }
            return;
        }

        self.writes
            .retain(|(id, _), state| id != &call_id || *state == WriteState::InFlight);
        if !self.is_finished(&call_id) {
            self.finished.push_back(call_id);
            if self.finished.len() > FINISHED_CALLS_KEPT {
                self.finished.pop_front();
            }
        }
    }

    fn clear(&mut self) {
        self.writes.clear();
        self.finished.clear();
    }
}

// ============================================================================
// Status sync
// ============================================================================

struct StatusSync {
    client: Arc<dyn CallRecordClient>,
    storage: Arc<LocalStorage>,
    connectivity: Arc<ConnectivityMonitor>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    writes: Mutex<WriteLog>,
    drain_lock: tokio::sync::Mutex<()>,
}

impl StatusSync {
    fn is_delivered(&self, call_id: &str, status: CallStatus) -> bool {
        self.writes.lock().is_delivered(&(call_id.to_string(), status))
    }

    /// One network write, claimed per (call, status) so it is never sent twice.
    async fn attempt(&self, call_id: &str, status: CallStatus, at: DateTime<Utc>) -> Result<Attempt> {
        let key = (call_id.to_string(), status);
        if !self.writes.lock().claim(&key) {
            return Ok(Attempt::Skipped);
        }

        let result = self.client.update_status(call_id, status, at).await;

        let mut writes = self.writes.lock();
        match result {
            Ok(()) => {
                writes.delivered(key);
                Ok(Attempt::Sent)
            }
            Err(e) => {
                writes.release(&key);
                Err(e)
            }
        }
    }

    fn enqueue(&self, call_id: &str, status: CallStatus, at: DateTime<Utc>) -> Result<()> {
        if self.storage.enqueue_status_update(call_id, status, at, self.clock.now())? {
            info!("Queued {} for call {}", status, call_id);
        } else {
            debug!("{} for call {} already queued", status, call_id);
        }
        Ok(())
    }

    async fn retry(self: Arc<Self>, call_id: String, status: CallStatus, at: DateTime<Utc>) {
        for attempt in 1..=self.policy.max_retries {
            self.clock.sleep(self.policy.delay_for(attempt)).await;

            if !self.connectivity.is_online() {
                break;
            }
            match self.attempt(&call_id, status, at).await {
                Ok(Attempt::Sent) => {
                    info!("{} for call {} delivered on retry {}", status, call_id, attempt);
                    return;
                }
                Ok(Attempt::Skipped) => return,
                Err(e) => warn!("Retry {} of {} for call {} failed: {}", attempt, status, call_id, e),
            }
        }

        if let Err(e) = self.enqueue(&call_id, status, at) {
            error!("Dropping {} for call {}: could not queue: {}", status, call_id, e);
        }
    }

    async fn drain(&self) -> Result<DrainReport> {
        let _guard = self.drain_lock.lock().await;
        let mut report = DrainReport::default();

        for entry in self.storage.pending_updates()? {
            if !self.connectivity.is_online() {
                report.remaining += 1;
                continue;
            }
            if self.is_delivered(&entry.call_id, entry.status) {
                self.storage.remove_pending(entry.entry_id)?;
                continue;
            }
            match self.attempt(&entry.call_id, entry.status, entry.occurred_at).await {
                Ok(Attempt::Sent) => {
                    self.storage.remove_pending(entry.entry_id)?;
                    report.delivered += 1;
                }
                // Another task is sending it; a later drain settles the entry.
                Ok(Attempt::Skipped) => report.remaining += 1,
                Err(e) => {
                    warn!("Queued {} for call {} still failing: {}", entry.status, entry.call_id, e);
                    report.remaining += 1;
                }
            }
        }

        Ok(report)
    }
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct CallCoordinator {
    sync: Arc<StatusSync>,
    state: Mutex<CallState>,
    retries: Mutex<Vec<JoinHandle<()>>>,
    notices: broadcast::Sender<CallNotice>,
}

impl CallCoordinator {
    pub fn new(
        client: Arc<dyn CallRecordClient>,
        storage: Arc<LocalStorage>,
        connectivity: Arc<ConnectivityMonitor>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        let (notices, _) = broadcast::channel(32);
        Self {
            sync: Arc::new(StatusSync {
                client,
                storage,
                connectivity,
                clock,
                policy,
                writes: Mutex::new(WriteLog::default()),
                drain_lock: tokio::sync::Mutex::new(()),
            }),
            state: Mutex::new(CallState::Idle),
            retries: Mutex::new(Vec::new()),
            notices,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallNotice> {
        self.notices.subscribe()
    }

    pub fn state(&self) -> CallState {
        self.state.lock().clone()
    }

    pub fn current_call(&self) -> Option<ActiveCall> {
        self.state.lock().call().cloned()
    }

    pub fn call_status(&self) -> Option<CallStatus> {
        self.state.lock().status()
    }

    pub fn is_call_active(&self) -> bool {
        self.state.lock().is_active()
    }

    /// Seed a new call. Refused while another call is still active.
    pub fn set_current_call(&self, call_id: &str, receiver_id: Option<&str>, is_caller: bool) -> Result<()> {
        if call_id.trim().is_empty() {
            return Err(Error::Validation("call id is required".into()));
        }

        let mut state = self.state.lock();
        if let Some(active) = state.call().filter(|_| state.is_active()) {
            return Err(Error::CallInProgress(active.call_id.clone()));
        }

        *state = CallState::Initiated(ActiveCall {
            call_id: call_id.to_string(),
            receiver_id: receiver_id.map(str::to_string),
            is_caller,
            started_at: self.sync.clock.now(),
            answered_at: None,
        });
        info!("Current call {} (caller: {})", call_id, is_caller);
        Ok(())
    }

    /// Returns true when this signal produced the ANSWERED transition.
    pub async fn on_answered(&self) -> bool {
        let (call_id, at) = {
            let mut state = self.state.lock();
            let Some(call) = state.call() else {
                debug!("Answered signal with no current call");
                return false;
            };
            if !call.is_caller {
                return false;
            }
            let call_id = call.call_id.clone();
            let at = self.sync.clock.now();
            match state.apply(CallEvent::Answered, at) {
                Ok(next) => *state = next,
                Err(e) => {
                    debug!("Dropping answered signal for {}: {}", call_id, e);
                    return false;
                }
            }
            (call_id, at)
        };

        self.record_locally(&call_id, CallStatus::Answered, at);
        if let Err(e) = self.write_status(&call_id, CallStatus::Answered, at).await {
            warn!("ANSWERED for call {} not synced: {}", call_id, e);
        }
        true
    }

    pub async fn on_ended(&self, reason: EndReason) -> bool {
        self.finish(CallEvent::Ended(reason)).await
    }

    pub async fn on_failed(&self, reason: FailureReason) -> bool {
        self.finish(CallEvent::Failed(reason)).await
    }

    /// First terminal signal wins; every later one is dropped.
    async fn finish(&self, event: CallEvent) -> bool {
        let (call, outcome, at) = {
            let mut state = self.state.lock();
            let at = self.sync.clock.now();
            let next = match state.apply(event, at) {
                Ok(next) => next,
                Err(e) => {
                    debug!("Dropping terminal signal: {}", e);
                    return false;
                }
            };
            let (call, outcome) = match &next {
                CallState::Ended(call, reason) => (call.clone(), CallOutcome::Ended(*reason)),
                CallState::Failed(call, reason) => (call.clone(), CallOutcome::Failed(*reason)),
                _ => return false,
            };
            *state = next;
            (call, outcome, at)
        };

        let status = match outcome {
            CallOutcome::Ended(_) => CallStatus::Ended,
            CallOutcome::Failed(_) => CallStatus::Failed,
        };
        if call.is_caller {
            self.record_locally(&call.call_id, status, at);
            if let Err(e) = self.write_status(&call.call_id, status, at).await {
                warn!("{} for call {} not synced: {}", status, call.call_id, e);
            }
        } else {
            debug!("Callee side, leaving call {} status to the caller", call.call_id);
        }

        self.clear(&call.call_id);

        if let CallOutcome::Failed(reason) = outcome {
            let _ = self.notices.send(CallNotice::Alert {
                message: reason.alert_message().to_string(),
            });
        }
        let _ = self.notices.send(CallNotice::CallClosed {
            call_id: call.call_id,
            outcome,
        });
        true
    }

    fn clear(&self, call_id: &str) {
        let mut state = self.state.lock();
        let same_call = state.call().map(|c| c.call_id == call_id).unwrap_or(false);
        if same_call && !state.is_active() {
            *state = CallState::Idle;
        }
    }

    fn record_locally(&self, call_id: &str, status: CallStatus, at: DateTime<Utc>) {
        if let Err(e) = self.sync.storage.update_call_status(call_id, status, at) {
            warn!("Call log update for {} failed: {}", call_id, e);
        }
    }

    /// Backend status write for UI collaborators.
    pub async fn update_call_status(&self, call_id: &str, status: CallStatus) -> Result<WriteOutcome> {
        let at = self.sync.clock.now();
        self.write_status(call_id, status, at).await
    }

    async fn write_status(&self, call_id: &str, status: CallStatus, at: DateTime<Utc>) -> Result<WriteOutcome> {
        if call_id.trim().is_empty() {
            return Err(Error::Validation("call id is required".into()));
        }
        if self.sync.is_delivered(call_id, status) {
            debug!("{} for call {} already delivered", status, call_id);
            return Ok(WriteOutcome::Deduplicated);
        }
        if !self.sync.connectivity.is_online() {
            self.sync.enqueue(call_id, status, at)?;
            return Ok(WriteOutcome::Queued);
        }

        match self.sync.attempt(call_id, status, at).await {
            Ok(Attempt::Sent) => {
                info!("{} for call {} delivered", status, call_id);
                Ok(WriteOutcome::Delivered)
            }
            Ok(Attempt::Skipped) => Ok(WriteOutcome::Deduplicated),
            Err(e) if e.is_retryable() && self.sync.policy.max_retries > 0 => {
                warn!("{} for call {} failed, retrying: {}", status, call_id, e);
                let task = tokio::spawn(self.sync.clone().retry(call_id.to_string(), status, at));
                let mut retries = self.retries.lock();
                retries.retain(|h| !h.is_finished());
                retries.push(task);
                Ok(WriteOutcome::RetryScheduled)
            }
            Err(e) => {
                warn!("{} for call {} failed: {}", status, call_id, e);
                self.sync.enqueue(call_id, status, at)?;
                Ok(WriteOutcome::Queued)
            }
        }
    }

    /// Single attempt, falling back to the queue. Used on teardown where a
    /// timed retry would not outlive the process.
    async fn write_or_queue(&self, call_id: &str, status: CallStatus, at: DateTime<Utc>) -> Result<WriteOutcome> {
        if self.sync.is_delivered(call_id, status) {
            return Ok(WriteOutcome::Deduplicated);
        }
        if self.sync.connectivity.is_online() {
            match self.sync.attempt(call_id, status, at).await {
                Ok(Attempt::Sent) => return Ok(WriteOutcome::Delivered),
                Ok(Attempt::Skipped) => return Ok(WriteOutcome::Deduplicated),
                Err(e) => warn!("{} for call {} failed during cleanup: {}", status, call_id, e),
            }
        }
        self.sync.enqueue(call_id, status, at)?;
        Ok(WriteOutcome::Queued)
    }

    pub async fn process_queued_updates(&self) -> Result<DrainReport> {
        let report = self.sync.drain().await?;
        if report.delivered > 0 || report.remaining > 0 {
            info!(
                "Drained status queue: {} delivered, {} remaining",
                report.delivered, report.remaining
            );
        }
        Ok(report)
    }

    /// Ends a still-active call on teardown. Returns true if one was active.
    pub async fn force_cleanup(&self) -> bool {
        let (call, at) = {
            let mut state = self.state.lock();
            if !state.is_active() {
                if state.call().is_some() {
                    *state = CallState::Idle;
                }
                return false;
            }
            let at = self.sync.clock.now();
            let next = match state.apply(CallEvent::Ended(EndReason::Cleanup), at) {
                Ok(next) => next,
                Err(_) => return false,
            };
            let Some(call) = next.call().cloned() else {
                return false;
            };
            *state = next;
            (call, at)
        };

        info!("Force-ending call {}", call.call_id);
        if call.is_caller {
            self.record_locally(&call.call_id, CallStatus::Ended, at);
            if let Err(e) = self.write_or_queue(&call.call_id, CallStatus::Ended, at).await {
                error!("ENDED for call {} lost during cleanup: {}", call.call_id, e);
            }
        }

        self.clear(&call.call_id);
        let _ = self.notices.send(CallNotice::CallClosed {
            call_id: call.call_id,
            outcome: CallOutcome::Ended(EndReason::Cleanup),
        });
        true
    }

    /// Drop all call state (logout).
    pub fn reset(&self) {
        self.cancel_retries();
        *self.state.lock() = CallState::Idle;
        self.sync.writes.lock().clear();
    }

    pub async fn wait_for_retries(&self) {
        let handles = std::mem::take(&mut *self.retries.lock());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!("Status retry task failed: {}", e);
                }
            }
        }
    }

    pub fn cancel_retries(&self) {
        for handle in self.retries.lock().drain(..) {
            handle.abort();
        }
    }

    /// Drains the queue on every offline -> online edge.
    pub fn spawn_connectivity_listener(&self) -> JoinHandle<()> {
        let sync = self.sync.clone();
        let mut online = sync.connectivity.subscribe();

        tokio::spawn(async move {
            while online.changed().await.is_ok() {
                if !*online.borrow_and_update() {
                    continue;
                }
                match sync.drain().await {
                    Ok(report) => info!(
                        "Connectivity restored: {} queued updates delivered, {} remaining",
                        report.delivered, report.remaining
                    ),
                    Err(e) => warn!("Queue drain failed: {}", e),
                }
            }
        })
    }
}
