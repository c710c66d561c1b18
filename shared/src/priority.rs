//! Ordering of pending trip-panel messages.
//!
//! Lower `priority` values are shown first. Within a tier the message whose
//! stop is closest to the truck wins, and the insertion ordinal breaks any
//! remaining tie so that distinct queued messages never compare equal.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::model::{LatLon, MessageId};

pub const DEFAULT_MESSAGE_PRIORITY: u32 = 100;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LauncherMessageWithPriority {
    pub message_id: MessageId,
    pub message: String,
    pub priority: u32,
    /// Assigned by the message store on enqueue.
    #[serde(default)]
    pub ordinal: u64,
    #[serde(default)]
    pub current_location: Option<LatLon>,
    #[serde(default)]
    pub destination_location: Option<LatLon>,
    pub stop_ids: BTreeSet<i32>,
}

impl LauncherMessageWithPriority {
    pub fn new(
        message: impl Into<String>,
        priority: u32,
        stop_ids: impl IntoIterator<Item = i32>,
    ) -> Self {
        Self {
            message_id: MessageId::generate(),
            message: message.into(),
            priority,
            ordinal: 0,
            current_location: None,
            destination_location: None,
            stop_ids: stop_ids.into_iter().collect(),
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<MessageId>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_locations(mut self, current: LatLon, destination: LatLon) -> Self {
        self.current_location = Some(current);
        self.destination_location = Some(destination);
        self
    }

    /// Meters between the truck and the message's destination, when both are known.
    pub fn distance_m(&self) -> Option<f64> {
        match (&self.current_location, &self.destination_location) {
            (Some(current), Some(destination)) => Some(current.distance_to(destination)),
            _ => None,
        }
    }

    pub fn references_stop(&self, stop_id: i32) -> bool {
        self.stop_ids.contains(&stop_id)
    }
}

pub struct LauncherMessagePriorityComparator;

impl LauncherMessagePriorityComparator {
    pub fn compare(a: &LauncherMessageWithPriority, b: &LauncherMessageWithPriority) -> Ordering {
        a.priority
            .cmp(&b.priority)
            .then_with(|| Self::compare_distance(a.distance_m(), b.distance_m()))
            .then_with(|| a.ordinal.cmp(&b.ordinal))
            .then_with(|| a.message_id.cmp(&b.message_id))
    }

    // Messages with a known distance go before those without.
    fn compare_distance(a: Option<f64>, b: Option<f64>) -> Ordering {
        match (a, b) {
            (Some(a), Some(b)) => a.total_cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

impl PartialEq for LauncherMessageWithPriority {
    fn eq(&self, other: &Self) -> bool {
        LauncherMessagePriorityComparator::compare(self, other) == Ordering::Equal
    }
}

impl Eq for LauncherMessageWithPriority {}

impl PartialOrd for LauncherMessageWithPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LauncherMessageWithPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        LauncherMessagePriorityComparator::compare(self, other)
    }
}
