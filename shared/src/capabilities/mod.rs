mod kv;
mod push;
mod stop_source;
mod trip_panel;

pub use self::kv::{
    InMemoryPreferenceStore, KeyNamespace, KvError, PreferenceKey, PreferenceStore,
    StorageErrorCode, TypedPreference,
};
#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqlitePreferenceStore;
pub use self::push::{PushError, PushPayload, EVENT_KEY, PAYLOAD_KEY};
pub use self::stop_source::{InMemoryStopSource, SourceError, StopSource, VehicleRef};
pub use self::trip_panel::{
    BroadcastAction, Broadcaster, DeliveryError, FanOut, TripPanelChannel, WorkflowEventBus,
    WorkflowEventType,
};

#[cfg(test)]
pub(crate) use self::trip_panel::testing;

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("Preference error: {0}")]
    Kv(#[from] KvError),

    #[error("Push error: {0}")]
    Push(#[from] PushError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

impl CapabilityError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kv(e) => e.is_retryable(),
            Self::Push(_) => false,
            Self::Source(e) => e.is_retryable(),
            Self::Delivery(e) => e.is_retryable(),
        }
    }
}
