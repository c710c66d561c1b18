use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::model::{Dispatch, DispatchId, Stop};

/// Key of the FCM data entry naming the change.
pub const EVENT_KEY: &str = "event";
/// Key of the FCM data entry carrying the JSON body.
pub const PAYLOAD_KEY: &str = "payload";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PushError {
    #[error("push data is missing '{0}'")]
    MissingField(&'static str),

    #[error("unknown push event: {0}")]
    UnknownEvent(String),

    #[error("malformed {event} payload: {message}")]
    MalformedPayload { event: String, message: String },
}

/// Dispatch and stop changes delivered over FCM data messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PushPayload {
    DispatchAdded(Vec<Dispatch>),
    DispatchRemoved {
        #[serde(rename = "dispatchId")]
        dispatch_id: DispatchId,
    },
    StopAdded(Stop),
    StopUpdated(Stop),
    StopRemoved(Stop),
}

const KNOWN_EVENTS: &[&str] = &[
    "DISPATCH_ADDED",
    "DISPATCH_REMOVED",
    "STOP_ADDED",
    "STOP_UPDATED",
    "STOP_REMOVED",
];

impl PushPayload {
    /// Decodes the string map of an FCM data message.
    pub fn from_data(data: &HashMap<String, String>) -> Result<Self, PushError> {
        let event = data
            .get(EVENT_KEY)
            .map(|e| e.trim().to_ascii_uppercase())
            .ok_or(PushError::MissingField(EVENT_KEY))?;
        if !KNOWN_EVENTS.contains(&event.as_str()) {
            return Err(PushError::UnknownEvent(event));
        }
        let body = data
            .get(PAYLOAD_KEY)
            .ok_or(PushError::MissingField(PAYLOAD_KEY))?;

        let malformed = |e: serde_json::Error| PushError::MalformedPayload {
            event: event.clone(),
            message: e.to_string(),
        };
        let payload: serde_json::Value = serde_json::from_str(body).map_err(malformed)?;
        serde_json::from_value(serde_json::json!({ "event": event, "payload": payload }))
            .map_err(malformed)
    }

    /// Dispatch the change belongs to. `None` for batched dispatch additions.
    pub fn dispatch_id(&self) -> Option<&DispatchId> {
        match self {
            Self::DispatchAdded(_) => None,
            Self::DispatchRemoved { dispatch_id } => Some(dispatch_id),
            Self::StopAdded(stop) | Self::StopUpdated(stop) | Self::StopRemoved(stop) => {
                Some(&stop.dispatch_id)
            }
        }
    }
}
