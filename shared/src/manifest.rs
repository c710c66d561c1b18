//! Wiring of the trip-panel queue, stop reconciliation, timers and the
//! outbound fan-out behind one handle.

use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{
    BroadcastAction, FanOut, PreferenceKey, PreferenceStore, PushPayload, StopSource, VehicleRef,
    WorkflowEventType,
};
use crate::config::ManifestConfig;
use crate::form_stack::{self, FormStackEntry};
use crate::message_store::{EnqueueOutcome, LastSentTripPanelMessage, TripPanelMessageStore};
use crate::model::{ActionType, Dispatch, DispatchId, MessageId, Stop, UnixTimeMs};
use crate::priority::LauncherMessageWithPriority;
use crate::reconcile::{
    get_dispatch_active_state, handle_dispatch_addition_and_removal, process_dispatch_removal,
    DispatchActiveState, StopChange, StopCount, StopOperation, StopReconciler,
};
use crate::removal_notifications::{NotificationStopRemovalData, StopRemovalNotifications};
use crate::sweeper::ExpiredMessageSweeper;
use crate::timers::TripTimers;
use crate::ManifestError;

/// Collaborators injected into [`RouteManifest`].
#[derive(Clone)]
pub struct RouteManifestDeps {
    pub stop_source: Arc<dyn StopSource>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub fan_out: FanOut,
    pub vehicle: VehicleRef,
}

pub struct RouteManifest {
    config: ManifestConfig,
    store: Arc<TripPanelMessageStore>,
    sweeper: ExpiredMessageSweeper,
    reconciler: StopReconciler,
    removals: StopRemovalNotifications,
    timers: TripTimers,
    preferences: Arc<dyn PreferenceStore>,
    fan_out: FanOut,
    dispatches: RwLock<Vec<Dispatch>>,
}

fn to_payload<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_default()
}

impl RouteManifest {
    pub fn new(config: ManifestConfig, deps: RouteManifestDeps) -> Result<Self, ManifestError> {
        config.validate()?;
        let store = Arc::new(TripPanelMessageStore::new(config.max_queued_messages)?);
        Ok(Self {
            sweeper: ExpiredMessageSweeper::new(Arc::clone(&store), deps.fan_out.clone()),
            reconciler: StopReconciler::new(
                deps.stop_source,
                deps.vehicle,
                config.stop_cache_capacity,
            ),
            removals: StopRemovalNotifications::new(),
            timers: TripTimers::new(
                deps.fan_out.clone(),
                config.late_notification_grace_ms,
                config.detention_threshold_ms,
            ),
            preferences: deps.preferences,
            fan_out: deps.fan_out,
            dispatches: RwLock::new(Vec::new()),
            store,
            config,
        })
    }

    pub fn config(&self) -> &ManifestConfig {
        &self.config
    }

    pub fn message_store(&self) -> &TripPanelMessageStore {
        &self.store
    }

    pub fn timers(&self) -> &TripTimers {
        &self.timers
    }

    pub fn removal_notifications(&self) -> &StopRemovalNotifications {
        &self.removals
    }

    pub async fn dispatches(&self) -> Vec<Dispatch> {
        self.dispatches.read().await.clone()
    }

    pub async fn stops(&self, dispatch_id: &DispatchId) -> Vec<Stop> {
        self.reconciler.load_stops(dispatch_id).await
    }

    pub async fn active_dispatch_id(&self) -> Option<DispatchId> {
        let raw = self
            .preferences
            .get_value_or(&PreferenceKey::active_dispatch_id(), "")
            .await;
        let id = DispatchId::new(raw.trim());
        (!id.is_empty()).then_some(id)
    }

    pub async fn dispatch_active_state(&self, selected: Option<&DispatchId>) -> DispatchActiveState {
        let active = self.active_dispatch_id().await;
        get_dispatch_active_state(
            active.as_ref().map(DispatchId::as_str),
            selected.map(DispatchId::as_str),
        )
    }

    /// Decodes an FCM data map and applies it.
    pub async fn handle_push_data(
        &self,
        data: &HashMap<String, String>,
        now: UnixTimeMs,
    ) -> Result<(), ManifestError> {
        let payload = PushPayload::from_data(data)?;
        self.handle_push(payload, now).await
    }

    #[instrument(skip(self, payload), fields(dispatch_id = ?payload.dispatch_id()))]
    pub async fn handle_push(&self, payload: PushPayload, now: UnixTimeMs) -> Result<(), ManifestError> {
        match payload {
            PushPayload::DispatchAdded(incoming) => {
                self.apply_dispatches(&incoming).await;
                Ok(())
            }
            PushPayload::DispatchRemoved { dispatch_id } => {
                self.remove_dispatch(&dispatch_id).await
            }
            PushPayload::StopAdded(stop) => {
                self.apply_stop_change(StopChange::Upsert(stop), WorkflowEventType::StopAdded, now)
                    .await
            }
            PushPayload::StopUpdated(stop) => {
                self.apply_stop_change(StopChange::Upsert(stop), WorkflowEventType::StopUpdated, now)
                    .await
            }
            PushPayload::StopRemoved(stop) => {
                self.apply_stop_change(StopChange::Remove(stop), WorkflowEventType::StopRemoved, now)
                    .await
            }
        }
    }

    async fn apply_dispatches(&self, incoming: &[Dispatch]) {
        let added: Vec<Dispatch> = {
            let mut dispatches = self.dispatches.write().await;
            let added = incoming
                .iter()
                .filter(|d| !d.disp_id.is_empty())
                .filter(|d| dispatches.iter().all(|e| e.disp_id != d.disp_id))
                .cloned()
                .collect();
            *dispatches = handle_dispatch_addition_and_removal(incoming, &dispatches);
            added
        };

        info!(incoming = incoming.len(), added = added.len(), "dispatch list reconciled");
        for dispatch in &added {
            self.fan_out
                .workflow_event(WorkflowEventType::DispatchAdded, to_payload(dispatch))
                .await;
        }
    }

    async fn remove_dispatch(&self, dispatch_id: &DispatchId) -> Result<(), ManifestError> {
        if dispatch_id.is_empty() {
            warn!("dispatch removal without id ignored");
            return Ok(());
        }
        let removed = {
            let mut dispatches = self.dispatches.write().await;
            let before = dispatches.len();
            *dispatches = process_dispatch_removal(dispatch_id, &dispatches);
            before != dispatches.len()
        };

        self.reconciler.invalidate(dispatch_id).await;
        self.timers.cancel_for_dispatch(dispatch_id);
        self.removals.discard(dispatch_id).await;

        if self.active_dispatch_id().await.as_ref() == Some(dispatch_id) {
            self.preferences
                .remove_value(&PreferenceKey::active_dispatch_id())
                .await?;
            self.store.clear().await;
            self.dismiss_last_sent().await;
        }

        info!(dispatch_id = %dispatch_id, known = removed, "dispatch removed");
        self.fan_out
            .workflow_event(
                WorkflowEventType::DispatchRemoved,
                json!({ "dispatchId": dispatch_id }),
            )
            .await;
        Ok(())
    }

    async fn apply_stop_change(
        &self,
        change: StopChange,
        event: WorkflowEventType,
        now: UnixTimeMs,
    ) -> Result<(), ManifestError> {
        let stop = change.stop().clone();
        let dispatch_id = stop.dispatch_id.clone();
        if dispatch_id.is_empty() {
            warn!(stop_id = stop.stop_id, "stop change without dispatch id ignored");
            return Ok(());
        }

        let previous = self.reconciler.load_stops(&dispatch_id).await;
        let was_known = previous.iter().any(|s| s.stop_id == stop.stop_id);
        let stops = self.reconciler.apply(&dispatch_id, &change).await;
        if stops.is_none() {
            warn!(
                dispatch_id = %dispatch_id,
                stop_id = stop.stop_id,
                "stop list unavailable, reconciliation deferred"
            );
        }

        let operation = match (&change, was_known) {
            (StopChange::Upsert(_), false) => StopOperation::Added,
            (StopChange::Remove(_), true) => StopOperation::Removed,
            _ => StopOperation::InvalidStopIndex,
        };
        if stops.is_some() && operation != StopOperation::InvalidStopIndex {
            self.refresh_stop_count(&dispatch_id, operation, &previous).await;
        }

        let mut removed = BTreeSet::new();
        match &change {
            StopChange::Remove(_) => {
                self.timers.cancel_for_stop(&dispatch_id, stop.stop_id);
                removed.insert(stop.stop_id);
            }
            StopChange::Upsert(_) if stop.is_deleted() => {
                self.timers.cancel_for_stop(&dispatch_id, stop.stop_id);
                removed.insert(stop.stop_id);
            }
            StopChange::Upsert(_) => {
                self.timers.schedule_late_notification(&stop, now);
            }
        }

        if !removed.is_empty() {
            let name = self.dispatch_name(&dispatch_id).await;
            self.removals
                .record_removed_stops(&dispatch_id, &name, removed.iter().copied(), now)
                .await;
        }

        let is_active = self.active_dispatch_id().await.as_ref() == Some(&dispatch_id);
        if let Some(stops) = stops.filter(|_| is_active) {
            let live: Vec<Stop> = stops.into_iter().filter(|s| !s.is_deleted()).collect();
            let swept = self
                .sweeper
                .remove_launcher_message_of_removed_stops_from_priority_queue(&live)
                .await;
            removed.extend(swept.removed_stop_ids);
            self.sweeper
                .remove_sent_message_if_the_stop_removed(&removed)
                .await;
            if !removed.is_empty() {
                self.sweeper
                    .update_form_stack(self.preferences.as_ref(), &removed)
                    .await;
            }
        }

        self.fan_out.workflow_event(event, to_payload(&stop)).await;
        Ok(())
    }

    async fn refresh_stop_count(
        &self,
        dispatch_id: &DispatchId,
        operation: StopOperation,
        previous: &[Stop],
    ) {
        let (active, inactive) = StopCount::tally(previous);
        let count = self
            .reconciler
            .get_manipulated_stop_count(dispatch_id, operation, active, inactive)
            .await;
        if !count.changed {
            return;
        }
        let mut dispatches = self.dispatches.write().await;
        if let Some(dispatch) = dispatches.iter_mut().find(|d| &d.disp_id == dispatch_id) {
            dispatch.stops_count_of_dispatch = u32::try_from(count.active).unwrap_or(u32::MAX);
            debug!(
                dispatch_id = %dispatch_id,
                active = count.active,
                inactive = count.inactive,
                "stop count refreshed"
            );
        }
    }

    async fn dismiss_last_sent(&self) {
        if let Some(last_sent) = self.store.mark_last_sent_dismissed().await {
            debug!(message_id = %last_sent.message_id, "last sent message dismissed with its dispatch");
            self.fan_out.dismiss(&last_sent.message_id).await;
        }
    }

    async fn dispatch_name(&self, dispatch_id: &DispatchId) -> String {
        let known = self
            .dispatches
            .read()
            .await
            .iter()
            .find(|d| &d.disp_id == dispatch_id)
            .map(|d| d.name.clone());
        match known {
            Some(name) => name,
            None => self
                .reconciler
                .fetch_dispatch(dispatch_id)
                .await
                .map(|d| d.name)
                .unwrap_or_default(),
        }
    }

    #[instrument(skip(self), fields(dispatch_id = %dispatch_id))]
    pub async fn start_trip(&self, dispatch_id: &DispatchId, now: UnixTimeMs) -> Result<(), ManifestError> {
        if dispatch_id.is_empty() {
            warn!("trip start without dispatch id ignored");
            return Ok(());
        }
        self.preferences
            .set_value(&PreferenceKey::active_dispatch_id(), dispatch_id.to_string())
            .await?;

        {
            let mut dispatches = self.dispatches.write().await;
            for dispatch in dispatches.iter_mut() {
                dispatch.is_active = &dispatch.disp_id == dispatch_id;
                if dispatch.is_active {
                    dispatch.trip_start_time.get_or_insert(now);
                }
            }
        }

        let stops = self.reconciler.load_stops(dispatch_id).await;
        let armed = stops
            .iter()
            .filter(|s| self.timers.schedule_late_notification(s, now))
            .count();
        info!(stops = stops.len(), late_timers = armed, "trip started");

        self.fan_out
            .workflow_event(
                WorkflowEventType::DispatchStarted,
                json!({ "dispatchId": dispatch_id, "tripStartTime": now }),
            )
            .await;
        Ok(())
    }

    #[instrument(skip(self), fields(dispatch_id = %dispatch_id))]
    pub async fn complete_trip(&self, dispatch_id: &DispatchId) -> Result<(), ManifestError> {
        if dispatch_id.is_empty() {
            warn!("trip completion without dispatch id ignored");
            return Ok(());
        }
        {
            let mut dispatches = self.dispatches.write().await;
            if let Some(dispatch) = dispatches.iter_mut().find(|d| &d.disp_id == dispatch_id) {
                dispatch.is_completed = true;
                dispatch.is_active = false;
            }
        }

        let cancelled = self.timers.cancel_for_dispatch(dispatch_id);
        if self.active_dispatch_id().await.as_ref() == Some(dispatch_id) {
            self.preferences
                .remove_value(&PreferenceKey::active_dispatch_id())
                .await?;
            self.store.clear().await;
            self.dismiss_last_sent().await;
        }
        info!(cancelled_timers = cancelled, "trip completed");

        self.fan_out
            .workflow_event(
                WorkflowEventType::DispatchCompleted,
                json!({ "dispatchId": dispatch_id }),
            )
            .await;
        Ok(())
    }

    pub async fn enqueue_message(
        &self,
        message: LauncherMessageWithPriority,
    ) -> Result<EnqueueOutcome, ManifestError> {
        Ok(self.store.enqueue(message).await?)
    }

    /// Hands the top queued message to the trip panel. A failed delivery
    /// drops the message.
    #[instrument(skip(self))]
    pub async fn send_next_trip_panel_message(
        &self,
    ) -> Result<Option<LauncherMessageWithPriority>, ManifestError> {
        let Some(message) = self.store.poll().await else {
            return Ok(None);
        };

        if let Err(e) = self.fan_out.trip_panel.send_message(&message).await {
            warn!(message_id = %message.message_id, error = %e, "trip panel message not delivered");
            return Ok(None);
        }

        self.store
            .set_last_sent_message(LastSentTripPanelMessage::from(&message))
            .await;
        self.preferences
            .set_value(
                &PreferenceKey::last_sent_trip_panel_message_id(),
                message.message_id.to_string(),
            )
            .await?;
        debug!(message_id = %message.message_id, "trip panel message sent");
        Ok(Some(message))
    }

    pub async fn last_sent_message_id(&self) -> Option<MessageId> {
        let raw = self
            .preferences
            .get_value_or(&PreferenceKey::last_sent_trip_panel_message_id(), "")
            .await;
        let id = MessageId::new(raw);
        (!id.is_empty()).then_some(id)
    }

    /// Broadcasts every aggregated removal whose debounce window has passed.
    pub async fn flush_removal_notifications(&self, now: UnixTimeMs) -> Vec<NotificationStopRemovalData> {
        let due = self
            .removals
            .take_due(now, self.config.removal_notification_debounce_ms)
            .await;
        for data in &due {
            let stop_ids: Vec<String> = data.stop_ids.iter().map(ToString::to_string).collect();
            let extras = HashMap::from([
                ("dispatchId".to_string(), data.dispatch_id.to_string()),
                ("stopIds".to_string(), stop_ids.join(",")),
                ("message".to_string(), data.message()),
            ]);
            self.fan_out
                .broadcast(BroadcastAction::StopsRemoved, extras)
                .await;
        }
        due
    }

    /// Arms the detention timer and queues the arrive action's form, if any.
    pub async fn record_arrival(
        &self,
        dispatch_id: &DispatchId,
        stop_id: i32,
    ) -> Result<(), ManifestError> {
        let Some(stop) = self.find_stop(dispatch_id, stop_id).await else {
            debug!(dispatch_id = %dispatch_id, stop_id, "arrival for unknown stop ignored");
            return Ok(());
        };
        self.timers.on_arrival(&stop);

        if let Some(action) = stop.action(ActionType::Arrived).filter(|a| a.has_form()) {
            form_stack::push_form(
                self.preferences.as_ref(),
                FormStackEntry::new(stop.stop_id, action.action_id),
            )
            .await?;
        }
        Ok(())
    }

    pub async fn record_departure(&self, dispatch_id: &DispatchId, stop_id: i32) {
        self.timers.cancel_for_stop(dispatch_id, stop_id);
    }

    pub async fn record_form_completed(&self, stop_id: i32, action_id: i32) -> Result<bool, ManifestError> {
        Ok(form_stack::remove_form(self.preferences.as_ref(), stop_id, action_id).await?)
    }

    async fn find_stop(&self, dispatch_id: &DispatchId, stop_id: i32) -> Option<Stop> {
        self.reconciler
            .load_stops(dispatch_id)
            .await
            .into_iter()
            .find(|s| s.stop_id == stop_id)
    }
}
