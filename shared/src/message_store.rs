use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::model::MessageId;
use crate::priority::LauncherMessageWithPriority;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessageStoreError {
    #[error("message {0} has no associated stops")]
    NoStops(MessageId),

    #[error("message {0} has empty text")]
    EmptyMessage(MessageId),

    #[error("queue capacity must be > 0")]
    ZeroCapacity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { ordinal: u64 },
    /// The queue was full; the lowest-ranked entry was dropped. This may be
    /// the message that was just offered.
    Evicted(LauncherMessageWithPriority),
}

/// The message most recently handed to the launcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSentTripPanelMessage {
    pub message_id: MessageId,
    pub message: String,
    pub stop_ids: BTreeSet<i32>,
}

impl From<&LauncherMessageWithPriority> for LastSentTripPanelMessage {
    fn from(m: &LauncherMessageWithPriority) -> Self {
        Self {
            message_id: m.message_id.clone(),
            message: m.message.clone(),
            stop_ids: m.stop_ids.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum LastSentState {
    #[default]
    Unset,
    Sent(LastSentTripPanelMessage),
    Dismissed(LastSentTripPanelMessage),
}

impl LastSentState {
    pub fn state_name(&self) -> &'static str {
        match self {
            LastSentState::Unset => "unset",
            LastSentState::Sent(_) => "sent",
            LastSentState::Dismissed(_) => "dismissed",
        }
    }
}

#[derive(Default)]
struct StoreState {
    queue: BTreeSet<LauncherMessageWithPriority>,
    last_sent: LastSentState,
    next_ordinal: u64,
}

/// Bounded priority queue of pending trip-panel messages plus the
/// last-sent register.
pub struct TripPanelMessageStore {
    capacity: usize,
    state: RwLock<StoreState>,
}

impl TripPanelMessageStore {
    pub fn new(capacity: usize) -> Result<Self, MessageStoreError> {
        if capacity == 0 {
            return Err(MessageStoreError::ZeroCapacity);
        }
        Ok(Self {
            capacity,
            state: RwLock::new(StoreState::default()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[instrument(skip(self, message), fields(message_id = %message.message_id, priority = message.priority))]
    pub async fn enqueue(
        &self,
        mut message: LauncherMessageWithPriority,
    ) -> Result<EnqueueOutcome, MessageStoreError> {
        if message.stop_ids.is_empty() {
            return Err(MessageStoreError::NoStops(message.message_id));
        }
        if message.message.trim().is_empty() {
            return Err(MessageStoreError::EmptyMessage(message.message_id));
        }

        let mut state = self.state.write().await;

        // Re-offering a queued message replaces it.
        state.queue.retain(|m| m.message_id != message.message_id);

        message.ordinal = state.next_ordinal;
        state.next_ordinal = state.next_ordinal.saturating_add(1);
        let ordinal = message.ordinal;
        state.queue.insert(message);

        if state.queue.len() > self.capacity {
            if let Some(evicted) = state.queue.pop_last() {
                warn!(
                    evicted = %evicted.message_id,
                    capacity = self.capacity,
                    "trip panel queue full, dropped lowest-ranked message"
                );
                return Ok(EnqueueOutcome::Evicted(evicted));
            }
        }

        debug!(queue_len = state.queue.len(), "message queued");
        Ok(EnqueueOutcome::Queued { ordinal })
    }

    pub async fn peek(&self) -> Option<LauncherMessageWithPriority> {
        self.state.read().await.queue.first().cloned()
    }

    pub async fn poll(&self) -> Option<LauncherMessageWithPriority> {
        self.state.write().await.queue.pop_first()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.queue.is_empty()
    }

    /// Queue contents in priority order.
    pub async fn snapshot(&self) -> Vec<LauncherMessageWithPriority> {
        self.state.read().await.queue.iter().cloned().collect()
    }

    /// Runs `f` over the queue (in priority order) under a single write lock
    /// and stores whatever it leaves behind.
    pub async fn update_queue<R>(
        &self,
        f: impl FnOnce(&mut Vec<LauncherMessageWithPriority>) -> R,
    ) -> R {
        let mut state = self.state.write().await;
        let mut messages: Vec<_> = std::mem::take(&mut state.queue).into_iter().collect();
        let result = f(&mut messages);
        state.queue = messages
            .into_iter()
            .filter(|m| !m.stop_ids.is_empty())
            .collect();
        while state.queue.len() > self.capacity {
            state.queue.pop_last();
        }
        result
    }

    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.queue.clear();
        info!("trip panel queue cleared");
    }

    pub async fn set_last_sent_message(&self, message: LastSentTripPanelMessage) {
        let mut state = self.state.write().await;
        debug!(message_id = %message.message_id, "last sent message updated");
        state.last_sent = LastSentState::Sent(message);
    }

    /// The last sent message, unless it has since been dismissed.
    pub async fn last_sent_message(&self) -> Option<LastSentTripPanelMessage> {
        match &self.state.read().await.last_sent {
            LastSentState::Sent(message) => Some(message.clone()),
            _ => None,
        }
    }

    pub async fn last_sent_state(&self) -> LastSentState {
        self.state.read().await.last_sent.clone()
    }

    /// Moves `Sent` to `Dismissed`. Returns the dismissed message.
    pub async fn mark_last_sent_dismissed(&self) -> Option<LastSentTripPanelMessage> {
        let mut state = self.state.write().await;
        match std::mem::take(&mut state.last_sent) {
            LastSentState::Sent(message) => {
                state.last_sent = LastSentState::Dismissed(message.clone());
                Some(message)
            }
            other => {
                state.last_sent = other;
                None
            }
        }
    }
}
