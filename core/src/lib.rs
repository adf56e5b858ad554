//! QR Parking Core Library
//!
//! Shared client library for the QR Parking mobile apps.
//! Provides: call coordination, calling-token cache, status sync, storage.

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gate;
pub mod models;
pub mod network;
pub mod retry;
pub mod sdk;
pub mod storage;
pub mod token;

#[cfg(test)]
mod testing;

use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub use clock::*;
pub use config::*;
pub use coordinator::*;
pub use error::*;
pub use gate::*;
pub use models::*;
pub use network::*;
pub use retry::*;
pub use sdk::*;
pub use storage::*;
pub use token::*;

/// Main client instance
pub struct QrParkClient<B: CallBackend + 'static = ApiClient> {
    config: ClientConfig,
    backend: Arc<B>,
    storage: Arc<LocalStorage>,
    connectivity: Arc<ConnectivityMonitor>,
    clock: Arc<dyn Clock>,
    tokens: Arc<TokenCache>,
    coordinator: Arc<CallCoordinator>,
    gate: CallInitiationGate,
    bridge: SdkEventBridge,
    sdk: Arc<dyn CallingSdk>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl QrParkClient<ApiClient> {
    /// Create new client instance against the configured backend
    pub fn new(config: ClientConfig, data_dir: &str, sdk: Arc<dyn CallingSdk>) -> Result<Self> {
        let storage = Arc::new(LocalStorage::new(data_dir)?);
        let backend = Arc::new(ApiClient::new(&config)?);

        Ok(Self::with_backend(
            config,
            backend,
            storage,
            Arc::new(SystemClock),
            Arc::new(ConnectivityMonitor::default()),
            sdk,
        ))
    }
}

impl<B: CallBackend + 'static> QrParkClient<B> {
    pub fn with_backend(
        config: ClientConfig,
        backend: Arc<B>,
        storage: Arc<LocalStorage>,
        clock: Arc<dyn Clock>,
        connectivity: Arc<ConnectivityMonitor>,
        sdk: Arc<dyn CallingSdk>,
    ) -> Self {
        let tokens = Arc::new(TokenCache::new(
            backend.clone(),
            storage.clone(),
            clock.clone(),
            config.calls.refresh_buffer(),
        ));
        let coordinator = Arc::new(CallCoordinator::new(
            backend.clone(),
            storage.clone(),
            connectivity.clone(),
            clock.clone(),
            RetryPolicy::from_settings(&config.calls),
        ));
        let gate = CallInitiationGate::new(
            backend.clone(),
            coordinator.clone(),
            tokens.clone(),
            connectivity.clone(),
            storage.clone(),
        );
        let bridge = SdkEventBridge::new(coordinator.clone());

        Self {
            config,
            backend,
            storage,
            connectivity,
            clock,
            tokens,
            coordinator,
            gate,
            bridge,
            sdk,
            listener: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start a session: persist it, fetch the calling token and register with the SDK.
    pub async fn login(&self, session: AuthSession) -> Result<()> {
        self.storage.save_session(&session)?;
        self.backend.set_session_token(Some(session.token.clone()));

        if let Err(e) = self.tokens.get_valid_token().await {
            warn!("Calling token fetch after login failed: {}", e);
        }

        let registration = SdkRegistration {
            user_id: session.user_id,
            display_name: session.display_name,
        };
        self.sdk.register(registration, self.tokens.clone()).await?;

        self.start_listener();
        if let Err(e) = self.coordinator.process_queued_updates().await {
            warn!("Queued status updates not processed: {}", e);
        }
        info!("Logged in");
        Ok(())
    }

    /// Resume a stored session after a restart. Returns false when there is
    /// none or it has expired; an expired one is discarded.
    pub async fn restore_session(&self) -> Result<bool> {
        let Some(session) = self.storage.get_session()? else {
            return Ok(false);
        };
        if session.expires_at <= self.clock.now().timestamp() {
            info!("Stored session for {} expired, sign-in required", session.user_id);
            self.tokens.clear()?;
            self.storage.clear_session()?;
            return Ok(false);
        }
        self.login(session).await?;
        Ok(true)
    }

    pub async fn logout(&self) -> Result<()> {
        self.coordinator.force_cleanup().await;
        self.coordinator.wait_for_retries().await;
        self.coordinator.reset();

        if let Err(e) = self.sdk.unregister().await {
            warn!("SDK unregister failed: {}", e);
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }

        self.tokens.clear()?;
        self.storage.clear_session()?;
        self.backend.set_session_token(None);
        info!("Logged out");
        Ok(())
    }

    /// Gate the call, then hand it to the SDK. Returns the call record id.
    pub async fn place_call(&self, receiver_id: &str) -> Result<String> {
        if self.storage.get_session()?.is_none() {
            return Err(Error::NotLoggedIn);
        }

        let call_id = self.gate.begin_call(receiver_id).await.into_result()?;

        if let Err(e) = self.sdk.place_call(receiver_id.trim(), &call_id).await {
            warn!("SDK could not place call {}: {}", call_id, e);
            self.coordinator.on_failed(FailureReason::InvitationFailed).await;
            return Err(e);
        }
        Ok(call_id)
    }

    /// Entry point for every SDK lifecycle hook.
    pub async fn handle_sdk_event(&self, event: SdkEvent) -> bool {
        self.bridge.dispatch(event).await
    }

    /// Seed an incoming call on the callee side. Nothing is written for it.
    pub fn accept_incoming(&self, call_id: &str) -> Result<()> {
        self.coordinator.set_current_call(call_id, None, false)
    }

    pub async fn create_call(&self, receiver_id: &str) -> Result<CallRecord> {
        if receiver_id.trim().is_empty() {
            return Err(Error::Validation("A receiver is required to place a call.".into()));
        }
        self.backend.create(receiver_id.trim()).await
    }

    pub async fn update_call_status(&self, call_id: &str, status: CallStatus) -> Result<WriteOutcome> {
        self.coordinator.update_call_status(call_id, status).await
    }

    pub fn current_call(&self) -> Option<ActiveCall> {
        self.coordinator.current_call()
    }

    pub fn call_status(&self) -> Option<CallStatus> {
        self.coordinator.call_status()
    }

    pub fn is_call_active(&self) -> bool {
        self.coordinator.is_call_active()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<CallNotice> {
        self.coordinator.subscribe()
    }

    pub fn recent_calls(&self, limit: i64) -> Result<Vec<CallRecord>> {
        self.storage.recent_calls(limit)
    }

    /// Feed from the platform network callback.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    /// Refresh the calling token in the background when it is close to expiry.
    pub fn on_app_foreground(&self) -> Option<JoinHandle<()>> {
        if !self.tokens.needs_refresh() {
            return None;
        }
        let tokens = self.tokens.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = tokens.get_valid_token().await {
                warn!("Foreground token refresh failed: {}", e);
            }
        }))
    }

    /// App teardown: end any live call, then let pending retries finish.
    pub async fn shutdown(&self) {
        self.coordinator.force_cleanup().await;
        self.coordinator.wait_for_retries().await;
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }

    fn start_listener(&self) {
        let mut listener = self.listener.lock();
        if listener.as_ref().map(|h| h.is_finished()).unwrap_or(true) {
            *listener = Some(self.coordinator.spawn_connectivity_listener());
        }
    }
}

impl<B: CallBackend + 'static> Drop for QrParkClient<B> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

// C FFI exports for cross-language usage
#[no_mangle]
pub extern "C" fn qrpark_version() -> *const std::ffi::c_char {
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr() as *const std::ffi::c_char
}
