//! Per-dispatch aggregation of removed stops.
//!
//! Several FCM removals for one dispatch usually arrive in a burst. They are
//! folded into a single entry and announced once the dispatch has been quiet
//! for the debounce window.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;
use tracing::debug;

use crate::model::{DispatchId, UnixTimeMs};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationStopRemovalData {
    pub dispatch_id: DispatchId,
    pub dispatch_name: String,
    pub stop_ids: BTreeSet<i32>,
    pub last_updated: UnixTimeMs,
}

impl NotificationStopRemovalData {
    pub fn new(dispatch_id: DispatchId) -> Self {
        Self {
            dispatch_id,
            ..Default::default()
        }
    }

    /// Driver-facing text for the aggregated removal.
    pub fn message(&self) -> String {
        let trip = if self.dispatch_name.trim().is_empty() {
            self.dispatch_id.to_string()
        } else {
            self.dispatch_name.clone()
        };
        match self.stop_ids.len() {
            1 => format!("1 stop was removed from trip {trip}"),
            n => format!("{n} stops were removed from trip {trip}"),
        }
    }
}

#[derive(Default)]
pub struct StopRemovalNotifications {
    entries: Mutex<HashMap<DispatchId, NotificationStopRemovalData>>,
}

impl StopRemovalNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `mutation` to the dispatch's entry, creating it if needed.
    /// The read-modify-write happens under one lock.
    pub async fn upsert<R>(
        &self,
        dispatch_id: &DispatchId,
        mutation: impl FnOnce(&mut NotificationStopRemovalData) -> R,
    ) -> R {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(dispatch_id.clone())
            .or_insert_with(|| NotificationStopRemovalData::new(dispatch_id.clone()));
        mutation(entry)
    }

    pub async fn record_removed_stops(
        &self,
        dispatch_id: &DispatchId,
        dispatch_name: &str,
        stop_ids: impl IntoIterator<Item = i32>,
        now: UnixTimeMs,
    ) -> NotificationStopRemovalData {
        let stop_ids: Vec<i32> = stop_ids.into_iter().collect();
        self.upsert(dispatch_id, |entry| {
            entry.stop_ids.extend(stop_ids);
            if !dispatch_name.trim().is_empty() {
                entry.dispatch_name = dispatch_name.to_string();
            }
            entry.last_updated = entry.last_updated.max(now);
            debug!(
                dispatch_id = %entry.dispatch_id,
                pending = entry.stop_ids.len(),
                "stop removal recorded"
            );
            entry.clone()
        })
        .await
    }

    pub async fn get(&self, dispatch_id: &DispatchId) -> Option<NotificationStopRemovalData> {
        self.entries.lock().await.get(dispatch_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Removes and returns entries untouched for at least `debounce_ms`,
    /// oldest first.
    pub async fn take_due(&self, now: UnixTimeMs, debounce_ms: u64) -> Vec<NotificationStopRemovalData> {
        let mut entries = self.entries.lock().await;
        let due: Vec<DispatchId> = entries
            .values()
            .filter(|e| e.last_updated.millis_until(now) >= debounce_ms)
            .map(|e| e.dispatch_id.clone())
            .collect();

        let mut taken: Vec<_> = due.iter().filter_map(|id| entries.remove(id)).collect();
        taken.sort_by(|a, b| {
            a.last_updated
                .cmp(&b.last_updated)
                .then_with(|| a.dispatch_id.cmp(&b.dispatch_id))
        });
        taken
    }

    /// Drops the pending entry, e.g. when the whole dispatch goes away.
    pub async fn discard(&self, dispatch_id: &DispatchId) -> Option<NotificationStopRemovalData> {
        self.entries.lock().await.remove(dispatch_id)
    }
}
