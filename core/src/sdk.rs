//! Calling SDK contract and the bridge from its hooks to the coordinator

use crate::coordinator::CallCoordinator;
use crate::error::Result;
use crate::models::{EndReason, FailureReason};
use crate::token::TokenCache;
use async_trait::async_trait;
use std::sync::Arc;

/// Supplies credentials when the SDK asks for them.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self) -> Result<String>;
}

#[async_trait]
impl CredentialProvider for TokenCache {
    async fn credential(&self) -> Result<String> {
        self.get_valid_token().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkRegistration {
    pub user_id: String,
    pub display_name: String,
}

/// The third-party calling SDK. Media and signalling stay inside it.
#[async_trait]
pub trait CallingSdk: Send + Sync {
    async fn register(
        &self,
        registration: SdkRegistration,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<()>;

    async fn place_call(&self, receiver_id: &str, call_record_id: &str) -> Result<()>;

    async fn unregister(&self) -> Result<()>;
}

/// Lifecycle hooks the SDK invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkEvent {
    DurationTick(u64),
    CallEnd,
    HangUp,
    OnlySelfInRoom,
    OutgoingCallRejectedBusy,
    OutgoingCallDeclined,
    OutgoingCallTimeout,
    OutgoingCallInvitationFailed,
}

pub struct SdkEventBridge {
    coordinator: Arc<CallCoordinator>,
}

impl SdkEventBridge {
    pub fn new(coordinator: Arc<CallCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Returns true when the event changed the call's state.
    pub async fn dispatch(&self, event: SdkEvent) -> bool {
        log::debug!("SDK event: {:?}", event);
        match event {
            // The first non-zero tick is the only answer signal the SDK gives.
            SdkEvent::DurationTick(0) => false,
            SdkEvent::DurationTick(_) => self.coordinator.on_answered().await,
            SdkEvent::CallEnd => self.coordinator.on_ended(EndReason::CallEnd).await,
            SdkEvent::HangUp => self.coordinator.on_ended(EndReason::HangUp).await,
            SdkEvent::OnlySelfInRoom => self.coordinator.on_ended(EndReason::OnlySelfInRoom).await,
            SdkEvent::OutgoingCallRejectedBusy => self.coordinator.on_failed(FailureReason::Busy).await,
            SdkEvent::OutgoingCallDeclined => self.coordinator.on_failed(FailureReason::Declined).await,
            SdkEvent::OutgoingCallTimeout => self.coordinator.on_failed(FailureReason::Timeout).await,
            SdkEvent::OutgoingCallInvitationFailed => {
                self.coordinator.on_failed(FailureReason::InvitationFailed).await
            }
        }
    }
}
