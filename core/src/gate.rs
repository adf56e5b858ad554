//! Pre-flight gate run before the calling SDK places a call

use crate::coordinator::CallCoordinator;
use crate::error::{Error, Result};
use crate::models::*;
use crate::network::{CallRecordClient, ConnectivityMonitor};
use crate::storage::LocalStorage;
use crate::token::TokenCache;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub enum GateDecision {
    Allow { call_record_id: String },
    Block { reason: Error },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allow { .. })
    }

    pub fn call_record_id(&self) -> Option<&str> {
        match self {
            GateDecision::Allow { call_record_id } => Some(call_record_id),
            GateDecision::Block { .. } => None,
        }
    }

    pub fn user_message(&self) -> Option<String> {
        match self {
            GateDecision::Allow { .. } => None,
            GateDecision::Block { reason } => Some(reason.user_message()),
        }
    }

    pub fn into_result(self) -> Result<String> {
        match self {
            GateDecision::Allow { call_record_id } => Ok(call_record_id),
            GateDecision::Block { reason } => Err(reason),
        }
    }
}

/// Releases the setup flag even if the caller drops the future mid-setup.
struct SetupGuard<'a>(&'a AtomicBool);

impl Drop for SetupGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct CallInitiationGate {
    client: Arc<dyn CallRecordClient>,
    coordinator: Arc<CallCoordinator>,
    tokens: Arc<TokenCache>,
    connectivity: Arc<ConnectivityMonitor>,
    storage: Arc<LocalStorage>,
    beginning: AtomicBool,
}

impl CallInitiationGate {
    pub fn new(
        client: Arc<dyn CallRecordClient>,
        coordinator: Arc<CallCoordinator>,
        tokens: Arc<TokenCache>,
        connectivity: Arc<ConnectivityMonitor>,
        storage: Arc<LocalStorage>,
    ) -> Self {
        Self {
            client,
            coordinator,
            tokens,
            connectivity,
            storage,
            beginning: AtomicBool::new(false),
        }
    }

    /// The only place a backend call record is created. On `Allow` the
    /// coordinator holds the new record as the current call, caller side.
    pub async fn begin_call(&self, receiver_id: &str) -> GateDecision {
        match self.try_begin(receiver_id).await {
            Ok(call_record_id) => GateDecision::Allow { call_record_id },
            Err(reason) => {
                warn!("Call to {} blocked: {}", receiver_id, reason);
                GateDecision::Block { reason }
            }
        }
    }

    async fn try_begin(&self, receiver_id: &str) -> Result<String> {
        let receiver_id = receiver_id.trim();
        if receiver_id.is_empty() {
            return Err(Error::Validation("A receiver is required to place a call.".into()));
        }
        if let Some(call) = self.coordinator.current_call().filter(|_| self.coordinator.is_call_active()) {
            return Err(Error::CallInProgress(call.call_id));
        }
        if self
            .beginning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::CallInProgress("call setup in progress".into()));
        }
        let _setup = SetupGuard(&self.beginning);

        self.create_and_seed(receiver_id).await
    }

    async fn create_and_seed(&self, receiver_id: &str) -> Result<String> {
        if !self.connectivity.is_online() {
            return Err(Error::Connectivity);
        }
        self.tokens.get_valid_token().await?;

        let record = self.client.create(receiver_id).await?;

        if let Err(e) = self.coordinator.set_current_call(&record.id, Some(receiver_id), true) {
            // Lost a race with another call; close out the orphaned record.
            if let Err(write_err) = self
                .coordinator
                .update_call_status(&record.id, CallStatus::Failed)
                .await
            {
                warn!("Could not close orphaned call {}: {}", record.id, write_err);
            }
            return Err(e);
        }

        if let Err(e) = self.storage.save_call(&record) {
            warn!("Call log insert for {} failed: {}", record.id, e);
        }

        info!("Call {} to {} initiated", record.id, receiver_id);
        Ok(record.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::testing::{CountingMinter, ManualClock, ScriptedRecordClient};
    use std::time::Duration;

    struct Harness {
        client: Arc<ScriptedRecordClient>,
        minter: Arc<CountingMinter>,
        storage: Arc<LocalStorage>,
        connectivity: Arc<ConnectivityMonitor>,
        coordinator: Arc<CallCoordinator>,
        gate: CallInitiationGate,
    }

    fn harness() -> Harness {
        let client = Arc::new(ScriptedRecordClient::default());
        let storage = Arc::new(LocalStorage::in_memory().unwrap());
        let connectivity = Arc::new(ConnectivityMonitor::new(true));
        let clock = Arc::new(ManualClock::default());
        let minter = Arc::new(CountingMinter::new(clock.clone(), chrono::Duration::days(7)));
        let tokens = Arc::new(TokenCache::new(
            minter.clone(),
            storage.clone(),
            clock.clone(),
            chrono::Duration::hours(24),
        ));
        let coordinator = Arc::new(CallCoordinator::new(
            client.clone(),
            storage.clone(),
            connectivity.clone(),
            clock,
            RetryPolicy::fixed(1, Duration::from_millis(10)),
        ));
        let gate = CallInitiationGate::new(
            client.clone(),
            coordinator.clone(),
            tokens,
            connectivity.clone(),
            storage.clone(),
        );
        Harness {
            client,
            minter,
            storage,
            connectivity,
            coordinator,
            gate,
        }
    }

    #[tokio::test]
    async fn test_allow_seeds_coordinator_as_caller() {
        let h = harness();
        let decision = h.gate.begin_call("U123").await;

        assert!(decision.is_allowed());
        assert_eq!(decision.call_record_id(), Some("c1"));
        let call = h.coordinator.current_call().unwrap();
        assert_eq!(call.call_id, "c1");
        assert_eq!(call.receiver_id.as_deref(), Some("U123"));
        assert!(call.is_caller);
        assert_eq!(h.coordinator.call_status(), Some(CallStatus::Initiated));
        assert_eq!(h.storage.recent_calls(5).unwrap()[0].id, "c1");
    }

    #[tokio::test]
    async fn test_blank_receiver_is_validation_error() {
        let h = harness();
        let decision = h.gate.begin_call("   ").await;
        assert!(matches!(decision, GateDecision::Block { reason: Error::Validation(_) }));
        assert!(h.client.created().is_empty());
    }

    #[tokio::test]
    async fn test_offline_blocks_without_request() {
        let h = harness();
        h.connectivity.set_online(false);
        let decision = h.gate.begin_call("U123").await;
        assert!(matches!(decision, GateDecision::Block { reason: Error::Connectivity }));
        assert!(h.client.created().is_empty());
        assert_eq!(h.minter.calls(), 0);
    }

    #[tokio::test]
    async fn test_create_failure_blocks() {
        let h = harness();
        h.client.fail_create();
        let decision = h.gate.begin_call("U123").await;

        assert!(!decision.is_allowed());
        assert!(decision.user_message().is_some());
        assert!(h.coordinator.current_call().is_none());
    }

    #[tokio::test]
    async fn test_token_failure_blocks_as_auth_expired() {
        let h = harness();
        h.minter.fail_next();
        let decision = h.gate.begin_call("U123").await;
        assert!(matches!(decision, GateDecision::Block { reason: Error::AuthExpired(_) }));
        assert!(h.client.created().is_empty());
    }

    #[tokio::test]
    async fn test_second_call_blocked_while_active() {
        let h = harness();
        assert!(h.gate.begin_call("U123").await.is_allowed());
        let decision = h.gate.begin_call("U456").await;
        assert!(matches!(decision, GateDecision::Block { reason: Error::CallInProgress(_) }));
        assert_eq!(h.client.created(), vec!["U123".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_begins_allow_one() {
        let h = harness();
        let (a, b) = tokio::join!(h.gate.begin_call("U123"), h.gate.begin_call("U456"));
        assert_eq!([a.is_allowed(), b.is_allowed()].iter().filter(|x| **x).count(), 1);
    }
}
