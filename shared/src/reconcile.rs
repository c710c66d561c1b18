//! Dispatch and stop list reconciliation.
//!
//! Incoming FCM changes are folded into the cached lists one change at a
//! time. Addition and update never delete: an entry absent from an incoming
//! batch stays until an explicit removal arrives.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::capabilities::{StopSource, VehicleRef};
use crate::model::{Dispatch, DispatchId, Stop};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopOperation {
    Added,
    Removed,
    /// Sentinel for an index that could not be resolved.
    InvalidStopIndex,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopCount {
    pub active: usize,
    pub inactive: usize,
    pub changed: bool,
}

impl StopCount {
    pub const NONE: Self = Self {
        active: 0,
        inactive: 0,
        changed: false,
    };

    /// `(active, inactive)` counts by the soft-delete flag. Stops carrying
    /// any other flag value count as neither.
    pub fn tally(stops: &[Stop]) -> (usize, usize) {
        stops.iter().fold((0, 0), |(active, inactive), s| match s.deleted {
            0 => (active + 1, inactive),
            1 => (active, inactive + 1),
            _ => (active, inactive),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchActiveState {
    Active,
    Previewing,
    NoTripActive,
}

/// Replaces the stop with the same id in place, or appends it. The incoming
/// stop's actions replace the old ones wholesale.
pub fn process_stop_addition_or_update(incoming: &Stop, existing: &[Stop]) -> Vec<Stop> {
    let mut stops = existing.to_vec();
    match stops.iter_mut().find(|s| s.stop_id == incoming.stop_id) {
        Some(slot) => *slot = incoming.clone(),
        None => stops.push(incoming.clone()),
    }
    stops
}

pub fn process_stop_removal(stop: &Stop, existing: &[Stop]) -> Vec<Stop> {
    existing
        .iter()
        .filter(|s| s.stop_id != stop.stop_id)
        .cloned()
        .collect()
}

/// Updates matching dispatches in place and appends new ones.
pub fn handle_dispatch_addition_and_removal(
    incoming: &[Dispatch],
    existing: &[Dispatch],
) -> Vec<Dispatch> {
    let mut dispatches = existing.to_vec();
    for dispatch in incoming {
        match dispatches.iter_mut().find(|d| d.disp_id == dispatch.disp_id) {
            Some(slot) => *slot = dispatch.clone(),
            None => dispatches.push(dispatch.clone()),
        }
    }
    dispatches
}

pub fn process_dispatch_removal(dispatch_id: &DispatchId, existing: &[Dispatch]) -> Vec<Dispatch> {
    existing
        .iter()
        .filter(|d| &d.disp_id != dispatch_id)
        .cloned()
        .collect()
}

pub fn get_dispatch_active_state(
    active_dispatch_id: Option<&str>,
    selected_dispatch_id: Option<&str>,
) -> DispatchActiveState {
    let active = active_dispatch_id.map(str::trim).unwrap_or_default();
    if active.is_empty() {
        return DispatchActiveState::NoTripActive;
    }
    match selected_dispatch_id.map(str::trim) {
        Some(selected) if !selected.is_empty() && selected != active => {
            DispatchActiveState::Previewing
        }
        _ => DispatchActiveState::Active,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopChange {
    Upsert(Stop),
    Remove(Stop),
}

impl StopChange {
    pub fn stop(&self) -> &Stop {
        match self {
            StopChange::Upsert(stop) | StopChange::Remove(stop) => stop,
        }
    }
}

/// Keeps the last reconciled stop list per dispatch and answers count
/// queries against the remote source.
pub struct StopReconciler {
    source: Arc<dyn StopSource>,
    vehicle: VehicleRef,
    cache: Mutex<LruCache<DispatchId, Vec<Stop>>>,
}

impl StopReconciler {
    pub fn new(source: Arc<dyn StopSource>, vehicle: VehicleRef, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            source,
            vehicle,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn vehicle(&self) -> &VehicleRef {
        &self.vehicle
    }

    pub async fn cached_stops(&self, dispatch_id: &DispatchId) -> Option<Vec<Stop>> {
        self.cache.lock().await.get(dispatch_id).cloned()
    }

    pub async fn invalidate(&self, dispatch_id: &DispatchId) {
        self.cache.lock().await.pop(dispatch_id);
    }

    /// Cached stops, falling back to the remote source. A failed read
    /// yields an empty list and is not cached.
    pub async fn load_stops(&self, dispatch_id: &DispatchId) -> Vec<Stop> {
        if let Some(stops) = self.cached_stops(dispatch_id).await {
            return stops;
        }
        let Some(fetched) = self.fetch(dispatch_id).await else {
            return Vec::new();
        };
        let mut cache = self.cache.lock().await;
        if let Some(stops) = cache.get(dispatch_id) {
            return stops.clone();
        }
        cache.put(dispatch_id.clone(), fetched.clone());
        fetched
    }

    /// Folds one change into the dispatch's stop list and returns the new list.
    ///
    /// Returns `None` and leaves the cache untouched when nothing is cached
    /// and the remote read fails; the next change retries the read.
    #[instrument(skip(self, change), fields(dispatch_id = %dispatch_id, stop_id = change.stop().stop_id))]
    pub async fn apply(&self, dispatch_id: &DispatchId, change: &StopChange) -> Option<Vec<Stop>> {
        let fetched = if self.cached_stops(dispatch_id).await.is_some() {
            None
        } else {
            self.fetch(dispatch_id).await
        };

        let mut cache = self.cache.lock().await;
        let Some(base) = cache.get(dispatch_id).cloned().or(fetched) else {
            debug!("no stop list to reconcile against");
            return None;
        };
        let updated = match change {
            StopChange::Upsert(stop) => process_stop_addition_or_update(stop, &base),
            StopChange::Remove(stop) => process_stop_removal(stop, &base),
        };
        debug!(before = base.len(), after = updated.len(), "stop list reconciled");
        cache.put(dispatch_id.clone(), updated.clone());
        Some(updated)
    }

    /// Re-reads the dispatch's stops and compares live/deleted counts with
    /// the previous snapshot.
    #[instrument(skip(self), fields(dispatch_id = %dispatch_id))]
    pub async fn get_manipulated_stop_count(
        &self,
        dispatch_id: &DispatchId,
        operation: StopOperation,
        previous_active: usize,
        previous_inactive: usize,
    ) -> StopCount {
        if operation == StopOperation::InvalidStopIndex {
            return StopCount::NONE;
        }
        if dispatch_id.is_empty() || !self.vehicle.is_complete() {
            debug!("missing identifiers, skipping stop count");
            return StopCount::NONE;
        }
        let Some(stops) = self.fetch(dispatch_id).await else {
            return StopCount::NONE;
        };

        let (active, inactive) = StopCount::tally(&stops);
        StopCount {
            active,
            inactive,
            changed: active != previous_active || inactive != previous_inactive,
        }
    }

    /// Remote dispatch document; `None` when missing or unreadable.
    pub async fn fetch_dispatch(&self, dispatch_id: &DispatchId) -> Option<Dispatch> {
        if dispatch_id.is_empty() || !self.vehicle.is_complete() {
            return None;
        }
        self.source
            .get_dispatch(&self.vehicle, dispatch_id)
            .await
            .unwrap_or_else(|e| {
                warn!(dispatch_id = %dispatch_id, error = %e, "dispatch read failed");
                None
            })
    }

    async fn fetch(&self, dispatch_id: &DispatchId) -> Option<Vec<Stop>> {
        if dispatch_id.is_empty() || !self.vehicle.is_complete() {
            return None;
        }
        match self
            .source
            .get_stops_for_dispatch(&self.vehicle, dispatch_id)
            .await
        {
            Ok(stops) => Some(stops),
            Err(e) => {
                warn!(dispatch_id = %dispatch_id, error = %e, retryable = e.is_retryable(), "stop read failed");
                None
            }
        }
    }
}
