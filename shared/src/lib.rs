#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod capabilities;
pub mod config;
pub mod form_stack;
pub mod manifest;
pub mod message_store;
pub mod model;
pub mod priority;
pub mod reconcile;
pub mod removal_notifications;
pub mod sweeper;
pub mod timers;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use capabilities::{CapabilityError, KvError, PushError, SourceError};
pub use config::{ConfigError, ManifestConfig};
pub use manifest::{RouteManifest, RouteManifestDeps};
pub use message_store::{
    EnqueueOutcome, LastSentState, LastSentTripPanelMessage, MessageStoreError,
    TripPanelMessageStore,
};
pub use model::{Action, ActionType, Dispatch, DispatchId, LatLon, MessageId, Stop, UnixTimeMs};
pub use priority::{LauncherMessagePriorityComparator, LauncherMessageWithPriority};
pub use reconcile::{DispatchActiveState, StopCount, StopOperation, StopReconciler};
pub use removal_notifications::{NotificationStopRemovalData, StopRemovalNotifications};
pub use sweeper::{ExpiredMessageSweeper, SweepResult};
pub use timers::{ScheduledTasks, TimerKey, TripTimers};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    Storage,
    Serialization,
    Unavailable,
    Rejected,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Unavailable => "UNAVAILABLE",
            Self::Rejected => "REJECTED",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Storage | Self::Unavailable => ErrorSeverity::Transient,
            Self::Validation | Self::Serialization | Self::Rejected => ErrorSeverity::Permanent,
        }
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("message store: {0}")]
    MessageStore(#[from] MessageStoreError),

    #[error("preferences: {0}")]
    Preferences(#[from] KvError),

    #[error("push: {0}")]
    Push(#[from] PushError),

    #[error("stop source: {0}")]
    Source(#[from] SourceError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

impl ManifestError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::MessageStore(_) => ErrorKind::Validation,
            Self::Preferences(KvError::Serialization { .. }) | Self::Push(_) => {
                ErrorKind::Serialization
            }
            Self::Preferences(KvError::InvalidKey { .. } | KvError::ValueTooLarge { .. }) => {
                ErrorKind::Validation
            }
            Self::Preferences(_) => ErrorKind::Storage,
            Self::Source(SourceError::Decode { .. }) => ErrorKind::Serialization,
            Self::Source(_) => ErrorKind::Unavailable,
            Self::Capability(e) if e.is_retryable() => ErrorKind::Unavailable,
            Self::Capability(_) => ErrorKind::Rejected,
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Preferences(e) => e.is_retryable(),
            Self::Source(e) => e.is_retryable(),
            Self::Capability(e) => e.is_retryable(),
            Self::Config(_) | Self::MessageStore(_) | Self::Push(_) => false,
        }
    }
}

pub type ManifestResult<T> = Result<T, ManifestError>;
