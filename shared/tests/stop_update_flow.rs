use route_manifest::capabilities::{
    BroadcastAction, Broadcaster, DeliveryError, FanOut, InMemoryStopSource, PreferenceKey,
    PreferenceStore, SqlitePreferenceStore, TripPanelChannel, VehicleRef, WorkflowEventBus,
    WorkflowEventType,
};
use route_manifest::form_stack::{self, FormStackEntry};
use route_manifest::{
    DispatchActiveState, DispatchId, LauncherMessageWithPriority, LastSentState, ManifestConfig,
    MessageId, RouteManifest, RouteManifestDeps, Stop, UnixTimeMs,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<MessageId>>,
    dismissed: Mutex<Vec<MessageId>>,
    events: Mutex<Vec<WorkflowEventType>>,
    broadcasts: Mutex<Vec<(BroadcastAction, HashMap<String, String>)>>,
}

#[async_trait::async_trait]
impl TripPanelChannel for Recorder {
    async fn send_message(&self, message: &LauncherMessageWithPriority) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push(message.message_id.clone());
        Ok(())
    }

    async fn dismiss_event(&self, message_id: &MessageId) -> Result<(), DeliveryError> {
        self.dismissed.lock().unwrap().push(message_id.clone());
        Ok(())
    }
}

#[async_trait::async_trait]
impl WorkflowEventBus for Recorder {
    async fn send_workflow_event(
        &self,
        event_type: WorkflowEventType,
        _payload: serde_json::Value,
    ) -> Result<(), DeliveryError> {
        self.events.lock().unwrap().push(event_type);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Broadcaster for Recorder {
    async fn send_broadcast(
        &self,
        action: BroadcastAction,
        extras: HashMap<String, String>,
    ) -> Result<(), DeliveryError> {
        self.broadcasts.lock().unwrap().push((action, extras));
        Ok(())
    }
}

fn push(event: &str, payload: &str) -> HashMap<String, String> {
    HashMap::from([
        ("event".to_string(), event.to_string()),
        ("payload".to_string(), payload.to_string()),
    ])
}

fn message(id: &str, priority: u32, stops: &[i32]) -> LauncherMessageWithPriority {
    LauncherMessageWithPriority::new(format!("Deliver to {id}"), priority, stops.iter().copied())
        .with_message_id(id)
}

#[tokio::test]
async fn push_driven_trip_with_stop_removals() {
    let dir = tempfile::tempdir().unwrap();
    let preferences = Arc::new(SqlitePreferenceStore::open(&dir.path().join("prefs.db")).unwrap());
    let source = Arc::new(InMemoryStopSource::new());
    let recorder = Arc::new(Recorder::default());
    let fan_out = FanOut {
        trip_panel: recorder.clone(),
        workflow_events: recorder.clone(),
        broadcaster: recorder.clone(),
    };
    let manifest = RouteManifest::new(
        ManifestConfig::default(),
        RouteManifestDeps {
            stop_source: source.clone(),
            preferences: preferences.clone(),
            fan_out,
            vehicle: VehicleRef::new("10119", "truck-1"),
        },
    )
    .unwrap();
    let dispatch_id = DispatchId::new("1000");

    // 1. Dispatch arrives with four stops already on the server
    source
        .put_stops("1000", (1..=4).map(|id| Stop::new(id, "1000")).collect())
        .await;
    manifest
        .handle_push_data(
            &push("DISPATCH_ADDED", r#"[{"dispId": "1000", "name": "North loop", "stopsCountOfDispatch": 4}]"#),
            UnixTimeMs(0),
        )
        .await
        .unwrap();
    manifest.start_trip(&dispatch_id, UnixTimeMs(0)).await.unwrap();
    assert_eq!(
        manifest.dispatch_active_state(Some(&dispatch_id)).await,
        DispatchActiveState::Active
    );

    // 2. A fifth stop is added by push, and the server now reports it too
    source
        .put_stops("1000", (1..=5).map(|id| Stop::new(id, "1000")).collect())
        .await;
    manifest
        .handle_push_data(
            &push("STOP_ADDED", r#"{"stopId": 5, "dispatchId": "1000", "name": "Yard"}"#),
            UnixTimeMs(10),
        )
        .await
        .unwrap();
    assert_eq!(manifest.stops(&dispatch_id).await.len(), 5);
    assert_eq!(manifest.dispatches().await[0].stops_count_of_dispatch, 5);

    // 3. Messages and forms reference stops 5 and 6
    manifest.enqueue_message(message("m1", 1, &[1, 2, 5])).await.unwrap();
    manifest.enqueue_message(message("m2", 2, &[6])).await.unwrap();
    manifest.enqueue_message(message("m3", 3, &[1, 2])).await.unwrap();
    manifest.enqueue_message(message("sent", 0, &[5, 6])).await.unwrap();
    let sent = manifest.send_next_trip_panel_message().await.unwrap().unwrap();
    assert_eq!(sent.message_id.as_str(), "sent");
    for stop_id in 1..=5 {
        form_stack::push_form(preferences.as_ref(), FormStackEntry::new(stop_id, 0))
            .await
            .unwrap();
    }

    // 4. Stop 5 is removed
    manifest
        .handle_push_data(
            &push("STOP_REMOVED", r#"{"stopId": 5, "dispatchId": "1000"}"#),
            UnixTimeMs(1_000),
        )
        .await
        .unwrap();

    let queued = manifest.message_store().snapshot().await;
    let ids: Vec<&str> = queued.iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m3"]);
    assert_eq!(queued[0].stop_ids, BTreeSet::from([1, 2]));

    // Stops 5 and 6 were both referenced by the sent message
    assert_eq!(recorder.dismissed.lock().unwrap().len(), 2);
    assert!(matches!(
        manifest.message_store().last_sent_state().await,
        LastSentState::Dismissed(_)
    ));

    let forms: Vec<i32> = form_stack::load_form_stack(preferences.as_ref())
        .await
        .iter()
        .map(|e| e.stop_id)
        .collect();
    assert_eq!(forms, vec![1, 2, 3, 4]);

    // 5. The aggregated removal goes out once the debounce window passes
    assert!(manifest.flush_removal_notifications(UnixTimeMs(2_000)).await.is_empty());
    let flushed = manifest.flush_removal_notifications(UnixTimeMs(10_000)).await;
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].dispatch_name, "North loop");
    let broadcasts = recorder.broadcasts.lock().unwrap().clone();
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(broadcasts[0].1["stopIds"], "5");

    // 6. Completing the trip clears the active dispatch
    manifest.complete_trip(&dispatch_id).await.unwrap();
    assert_eq!(
        manifest.dispatch_active_state(Some(&dispatch_id)).await,
        DispatchActiveState::NoTripActive
    );
    assert_eq!(
        *recorder.events.lock().unwrap(),
        vec![
            WorkflowEventType::DispatchAdded,
            WorkflowEventType::DispatchStarted,
            WorkflowEventType::StopAdded,
            WorkflowEventType::StopRemoved,
            WorkflowEventType::DispatchCompleted,
        ]
    );

    // Last sent id survives a reopen of the preference file
    drop(manifest);
    let reopened = SqlitePreferenceStore::open(&dir.path().join("prefs.db")).unwrap();
    assert_eq!(
        reopened
            .get_value(&PreferenceKey::last_sent_trip_panel_message_id())
            .await
            .unwrap()
            .as_deref(),
        Some("sent")
    );
}

#[tokio::test]
async fn stops_of_inactive_dispatch_do_not_touch_the_queue() {
    let source = Arc::new(InMemoryStopSource::new());
    let recorder = Arc::new(Recorder::default());
    let manifest = RouteManifest::new(
        ManifestConfig::default(),
        RouteManifestDeps {
            stop_source: source.clone(),
            preferences: Arc::new(route_manifest::capabilities::InMemoryPreferenceStore::new()),
            fan_out: FanOut {
                trip_panel: recorder.clone(),
                workflow_events: recorder.clone(),
                broadcaster: recorder.clone(),
            },
            vehicle: VehicleRef::new("10119", "truck-1"),
        },
    )
    .unwrap();

    source
        .put_stops("1000", vec![Stop::new(1, "1000"), Stop::new(2, "1000")])
        .await;
    manifest.start_trip(&DispatchId::new("1000"), UnixTimeMs(0)).await.unwrap();
    manifest.enqueue_message(message("m1", 1, &[1])).await.unwrap();

    source.put_stops("2000", vec![Stop::new(9, "2000")]).await;
    manifest
        .handle_push_data(
            &push("STOP_UPDATED", r#"{"stopId": 9, "dispatchId": "2000", "deleted": 1}"#),
            UnixTimeMs(5),
        )
        .await
        .unwrap();

    assert_eq!(manifest.message_store().len().await, 1);
    assert!(recorder.dismissed.lock().unwrap().is_empty());
    assert!(manifest
        .removal_notifications()
        .get(&DispatchId::new("2000"))
        .await
        .is_some());
}
