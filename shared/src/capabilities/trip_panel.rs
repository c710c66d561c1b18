//! Outbound channels: the launcher trip panel, the third-party workflow
//! event bus and app-wide broadcasts. All three are fire-and-forget; callers
//! log failures and never retry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::model::MessageId;
use crate::priority::LauncherMessageWithPriority;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    #[error("delivery rejected: {reason}")]
    Rejected { reason: String },
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Unavailable(_))
    }
}

#[async_trait::async_trait]
pub trait TripPanelChannel: Send + Sync {
    async fn send_message(&self, message: &LauncherMessageWithPriority) -> Result<(), DeliveryError>;
    async fn dismiss_event(&self, message_id: &MessageId) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowEventType {
    DispatchAdded,
    DispatchRemoved,
    DispatchStarted,
    DispatchCompleted,
    StopAdded,
    StopUpdated,
    StopRemoved,
}

impl WorkflowEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DispatchAdded => "DISPATCH_ADDED",
            Self::DispatchRemoved => "DISPATCH_REMOVED",
            Self::DispatchStarted => "DISPATCH_STARTED",
            Self::DispatchCompleted => "DISPATCH_COMPLETED",
            Self::StopAdded => "STOP_ADDED",
            Self::StopUpdated => "STOP_UPDATED",
            Self::StopRemoved => "STOP_REMOVED",
        }
    }
}

#[async_trait::async_trait]
pub trait WorkflowEventBus: Send + Sync {
    async fn send_workflow_event(
        &self,
        event_type: WorkflowEventType,
        payload: serde_json::Value,
    ) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BroadcastAction {
    LateNotification,
    DetentionWarning,
    StopsRemoved,
}

impl BroadcastAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LateNotification => "com.routemanifest.LATE_NOTIFICATION",
            Self::DetentionWarning => "com.routemanifest.DETENTION_WARNING",
            Self::StopsRemoved => "com.routemanifest.STOPS_REMOVED",
        }
    }
}

#[async_trait::async_trait]
pub trait Broadcaster: Send + Sync {
    async fn send_broadcast(
        &self,
        action: BroadcastAction,
        extras: HashMap<String, String>,
    ) -> Result<(), DeliveryError>;
}

/// Outbound collaborators bundled for injection.
#[derive(Clone)]
pub struct FanOut {
    pub trip_panel: Arc<dyn TripPanelChannel>,
    pub workflow_events: Arc<dyn WorkflowEventBus>,
    pub broadcaster: Arc<dyn Broadcaster>,
}

impl FanOut {
    pub async fn workflow_event(&self, event_type: WorkflowEventType, payload: serde_json::Value) {
        if let Err(e) = self
            .workflow_events
            .send_workflow_event(event_type, payload)
            .await
        {
            warn!(event = event_type.as_str(), error = %e, "workflow event not delivered");
        }
    }

    pub async fn broadcast(&self, action: BroadcastAction, extras: HashMap<String, String>) {
        if let Err(e) = self.broadcaster.send_broadcast(action, extras).await {
            warn!(action = action.as_str(), error = %e, "broadcast not delivered");
        }
    }

    pub async fn dismiss(&self, message_id: &MessageId) {
        if let Err(e) = self.trip_panel.dismiss_event(message_id).await {
            warn!(message_id = %message_id, error = %e, "trip panel dismiss not delivered");
        }
    }
}
