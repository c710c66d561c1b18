//! Drops trip-panel messages whose stops no longer exist.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{FanOut, PreferenceStore};
use crate::form_stack;
use crate::message_store::TripPanelMessageStore;
use crate::model::Stop;
use crate::priority::LauncherMessageWithPriority;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepResult {
    /// Surviving queue in priority order.
    pub queue: Vec<LauncherMessageWithPriority>,
    pub removed_stop_ids: BTreeSet<i32>,
}

/// Prunes `messages` against the set of live stop ids. A message survives
/// while at least one of its stops is live, keeping only the live ones.
pub fn sweep_messages(
    messages: &mut Vec<LauncherMessageWithPriority>,
    live_stop_ids: &BTreeSet<i32>,
) -> BTreeSet<i32> {
    let mut removed = BTreeSet::new();
    for message in messages.iter_mut() {
        removed.extend(message.stop_ids.difference(live_stop_ids).copied());
        message.stop_ids.retain(|id| live_stop_ids.contains(id));
    }
    messages.retain(|m| !m.stop_ids.is_empty());
    removed
}

pub struct ExpiredMessageSweeper {
    store: Arc<TripPanelMessageStore>,
    fan_out: FanOut,
}

impl ExpiredMessageSweeper {
    pub fn new(store: Arc<TripPanelMessageStore>, fan_out: FanOut) -> Self {
        Self { store, fan_out }
    }

    #[instrument(skip_all, fields(live_stops = current_stops.len()))]
    pub async fn remove_launcher_message_of_removed_stops_from_priority_queue(
        &self,
        current_stops: &[Stop],
    ) -> SweepResult {
        let live: BTreeSet<i32> = current_stops.iter().map(|s| s.stop_id).collect();
        let result = self
            .store
            .update_queue(|messages| {
                let removed_stop_ids = sweep_messages(messages, &live);
                SweepResult {
                    queue: messages.clone(),
                    removed_stop_ids,
                }
            })
            .await;

        if !result.removed_stop_ids.is_empty() {
            info!(
                removed = ?result.removed_stop_ids,
                remaining = result.queue.len(),
                "swept messages of removed stops"
            );
        }
        result
    }

    /// Dismisses the last sent message once per removed stop it references.
    #[instrument(skip_all)]
    pub async fn remove_sent_message_if_the_stop_removed(&self, removed_stop_ids: &BTreeSet<i32>) {
        let Some(last_sent) = self.store.last_sent_message().await else {
            debug!("no sent message to dismiss");
            return;
        };

        let hits: Vec<i32> = removed_stop_ids
            .iter()
            .copied()
            .filter(|id| last_sent.stop_ids.contains(id))
            .collect();
        if hits.is_empty() {
            return;
        }

        for stop_id in &hits {
            debug!(stop_id, message_id = %last_sent.message_id, "dismissing sent message");
            self.fan_out.dismiss(&last_sent.message_id).await;
        }
        self.store.mark_last_sent_dismissed().await;
    }

    /// Prunes the uncompleted form stack; returns the stop ids still owed a form.
    pub async fn update_form_stack(
        &self,
        preferences: &dyn PreferenceStore,
        removed_stop_ids: &BTreeSet<i32>,
    ) -> Vec<i32> {
        match form_stack::retain_forms_of_live_stops(preferences, removed_stop_ids).await {
            Ok(stops) => stops,
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "form stack update failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::RecordingChannels;
    use crate::capabilities::InMemoryPreferenceStore;
    use crate::form_stack::{load_form_stack, push_form, FormStackEntry};
    use crate::message_store::LastSentState;
    use proptest::prelude::*;

    fn msg(id: &str, priority: u32, stops: &[i32]) -> LauncherMessageWithPriority {
        LauncherMessageWithPriority::new(format!("msg {id}"), priority, stops.iter().copied())
            .with_message_id(id)
    }

    fn live(ids: &[i32]) -> Vec<Stop> {
        ids.iter().map(|id| Stop::new(*id, "1000")).collect()
    }

    async fn fixture(messages: Vec<LauncherMessageWithPriority>) -> (ExpiredMessageSweeper, Arc<TripPanelMessageStore>, Arc<RecordingChannels>) {
        let store = Arc::new(TripPanelMessageStore::new(10).unwrap());
        for m in messages {
            store.enqueue(m).await.unwrap();
        }
        let recorder = Arc::new(RecordingChannels::default());
        let sweeper = ExpiredMessageSweeper::new(store.clone(), recorder.fan_out());
        (sweeper, store, recorder)
    }

    #[tokio::test]
    async fn sweeps_fully_removed_and_truncates_partial() {
        let (sweeper, store, _) = fixture(vec![
            msg("a", 1, &[1, 2, 5]),
            msg("b", 2, &[6]),
            msg("c", 3, &[1, 2]),
        ])
        .await;

        let result = sweeper
            .remove_launcher_message_of_removed_stops_from_priority_queue(&live(&[1, 3, 4, 2]))
            .await;

        assert_eq!(result.removed_stop_ids, BTreeSet::from([5, 6]));
        let ids: Vec<&str> = result.queue.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(result.queue[0].stop_ids, BTreeSet::from([1, 2]));
        assert_eq!(store.snapshot().await, result.queue);
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let (sweeper, _, _) = fixture(vec![msg("a", 1, &[1, 5]), msg("b", 2, &[6])]).await;
        let stops = live(&[1, 2]);

        let first = sweeper
            .remove_launcher_message_of_removed_stops_from_priority_queue(&stops)
            .await;
        let second = sweeper
            .remove_launcher_message_of_removed_stops_from_priority_queue(&stops)
            .await;

        assert_eq!(first.queue, second.queue);
        assert!(second.removed_stop_ids.is_empty());
    }

    #[tokio::test]
    async fn empty_queue_and_empty_stops() {
        let (sweeper, _, _) = fixture(vec![]).await;
        let result = sweeper
            .remove_launcher_message_of_removed_stops_from_priority_queue(&[])
            .await;
        assert_eq!(result, SweepResult::default());

        let (sweeper, store, _) = fixture(vec![msg("a", 1, &[1])]).await;
        let result = sweeper
            .remove_launcher_message_of_removed_stops_from_priority_queue(&[])
            .await;
        assert!(result.queue.is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn dismisses_once_per_removed_referenced_stop() {
        let (sweeper, store, recorder) = fixture(vec![]).await;
        store
            .set_last_sent_message((&msg("sent", 1, &[1, 5, 6])).into())
            .await;

        sweeper
            .remove_sent_message_if_the_stop_removed(&BTreeSet::from([5, 6, 9]))
            .await;

        assert_eq!(recorder.dismissed().len(), 2);
        assert!(recorder.dismissed().iter().all(|id| id.as_str() == "sent"));
        assert_eq!(store.last_sent_state().await.state_name(), "dismissed");
    }

    #[tokio::test]
    async fn unrelated_removal_leaves_sent_message() {
        let (sweeper, store, recorder) = fixture(vec![]).await;
        store
            .set_last_sent_message((&msg("sent", 1, &[1])).into())
            .await;

        sweeper
            .remove_sent_message_if_the_stop_removed(&BTreeSet::from([2]))
            .await;
        assert!(recorder.dismissed().is_empty());
        assert!(matches!(store.last_sent_state().await, LastSentState::Sent(_)));

        sweeper
            .remove_sent_message_if_the_stop_removed(&BTreeSet::new())
            .await;
        assert!(recorder.dismissed().is_empty());
    }

    #[tokio::test]
    async fn no_sent_message_is_noop() {
        let (sweeper, _, recorder) = fixture(vec![]).await;
        sweeper
            .remove_sent_message_if_the_stop_removed(&BTreeSet::from([1]))
            .await;
        assert!(recorder.all().is_empty());
    }

    #[tokio::test]
    async fn form_stack_drops_removed_stops() {
        let (sweeper, _, _) = fixture(vec![]).await;
        let preferences = InMemoryPreferenceStore::new();
        for stop_id in 1..=5 {
            push_form(&preferences, FormStackEntry::new(stop_id, 0))
                .await
                .unwrap();
        }

        let kept = sweeper
            .update_form_stack(&preferences, &BTreeSet::from([5]))
            .await;

        assert_eq!(kept, vec![1, 2, 3, 4]);
        assert_eq!(load_form_stack(&preferences).await.len(), 4);
        assert!(sweeper
            .update_form_stack(&InMemoryPreferenceStore::new(), &BTreeSet::from([1]))
            .await
            .is_empty());
    }

    proptest! {
        #[test]
        fn survivors_only_reference_live_stops(
            queued in proptest::collection::vec(proptest::collection::btree_set(0i32..20, 1..5), 0..12),
            live_ids in proptest::collection::btree_set(0i32..20, 0..20),
        ) {
            let mut messages: Vec<_> = queued
                .iter()
                .enumerate()
                .map(|(i, stops)| msg(&format!("m{i}"), i as u32, &stops.iter().copied().collect::<Vec<_>>()))
                .collect();
            let referenced: BTreeSet<i32> = queued.iter().flatten().copied().collect();

            let removed = sweep_messages(&mut messages, &live_ids);

            let expected: BTreeSet<i32> = referenced.difference(&live_ids).copied().collect();
            prop_assert_eq!(&removed, &expected);
            for m in &messages {
                prop_assert!(!m.stop_ids.is_empty());
                prop_assert!(m.stop_ids.is_subset(&live_ids));
            }

            let again = sweep_messages(&mut messages.clone(), &live_ids);
            prop_assert!(again.is_empty());
        }
    }
}
