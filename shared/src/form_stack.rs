//! Forms the driver still owes, persisted as a JSON list under
//! [`PreferenceKey::uncompleted_forms_stack`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::capabilities::{KvError, PreferenceKey, PreferenceStore, TypedPreference};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormStackEntry {
    pub stop_id: i32,
    pub action_id: i32,
}

impl FormStackEntry {
    pub fn new(stop_id: i32, action_id: i32) -> Self {
        Self { stop_id, action_id }
    }
}

fn preference() -> TypedPreference<Vec<FormStackEntry>> {
    TypedPreference::new(PreferenceKey::uncompleted_forms_stack())
}

/// Loads the stack. Unset, blank or malformed values load as empty; a failed
/// read is returned so callers never write over a stack they could not see.
pub async fn try_load_form_stack(
    store: &dyn PreferenceStore,
) -> Result<Vec<FormStackEntry>, KvError> {
    match preference().load(store).await {
        Ok(entries) => Ok(entries.unwrap_or_default()),
        Err(KvError::Serialization { message, .. }) => {
            warn!(error = %message, "form stack unreadable, treating as empty");
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

/// Read-only view of the stack; a failed read shows as empty.
pub async fn load_form_stack(store: &dyn PreferenceStore) -> Vec<FormStackEntry> {
    try_load_form_stack(store).await.unwrap_or_else(|e| {
        warn!(error = %e, retryable = e.is_retryable(), "form stack read failed");
        Vec::new()
    })
}

pub async fn is_form_stack_empty(store: &dyn PreferenceStore) -> bool {
    load_form_stack(store).await.is_empty()
}

/// Appends `entry` unless it is already on the stack.
pub async fn push_form(store: &dyn PreferenceStore, entry: FormStackEntry) -> Result<bool, KvError> {
    let mut entries = try_load_form_stack(store).await?;
    if entries.contains(&entry) {
        return Ok(false);
    }
    entries.push(entry);
    preference().save(store, &entries).await?;
    debug!(stop_id = entry.stop_id, action_id = entry.action_id, "form pushed");
    Ok(true)
}

pub async fn remove_form(
    store: &dyn PreferenceStore,
    stop_id: i32,
    action_id: i32,
) -> Result<bool, KvError> {
    let mut entries = try_load_form_stack(store).await?;
    let before = entries.len();
    entries.retain(|e| !(e.stop_id == stop_id && e.action_id == action_id));
    if entries.len() == before {
        return Ok(false);
    }
    preference().save(store, &entries).await?;
    Ok(true)
}

/// Drops entries of removed stops and returns the distinct stop ids left,
/// in stack order. The value is only rewritten when something was dropped.
pub async fn retain_forms_of_live_stops(
    store: &dyn PreferenceStore,
    removed_stop_ids: &BTreeSet<i32>,
) -> Result<Vec<i32>, KvError> {
    let mut entries = try_load_form_stack(store).await?;
    let before = entries.len();
    entries.retain(|e| !removed_stop_ids.contains(&e.stop_id));
    if entries.len() != before {
        preference().save(store, &entries).await?;
        debug!(dropped = before - entries.len(), "form stack pruned");
    }

    let mut seen = BTreeSet::new();
    Ok(entries
        .iter()
        .map(|e| e.stop_id)
        .filter(|id| seen.insert(*id))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{InMemoryPreferenceStore, StorageErrorCode};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Preference store whose reads can be made to fail with `Busy`.
    #[derive(Default)]
    struct BusyStore {
        inner: InMemoryPreferenceStore,
        busy: AtomicBool,
    }

    #[async_trait::async_trait]
    impl PreferenceStore for BusyStore {
        async fn get_value(&self, key: &PreferenceKey) -> Result<Option<String>, KvError> {
            if self.busy.load(Ordering::SeqCst) {
                return Err(KvError::storage(StorageErrorCode::Busy, "database is locked"));
            }
            self.inner.get_value(key).await
        }

        async fn set_value(&self, key: &PreferenceKey, value: String) -> Result<(), KvError> {
            self.inner.set_value(key, value).await
        }

        async fn remove_value(&self, key: &PreferenceKey) -> Result<bool, KvError> {
            self.inner.remove_value(key).await
        }
    }

    async fn seeded(raw: &str) -> InMemoryPreferenceStore {
        let store = InMemoryPreferenceStore::new();
        store
            .set_value(&PreferenceKey::uncompleted_forms_stack(), raw.to_string())
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn unset_and_blank_load_empty() {
        let store = InMemoryPreferenceStore::new();
        assert!(is_form_stack_empty(&store).await);
        assert!(load_form_stack(&seeded("").await).await.is_empty());
    }

    #[tokio::test]
    async fn malformed_loads_empty() {
        let store = seeded("[{\"stopId\": ").await;
        assert!(load_form_stack(&store).await.is_empty());
        let kept = retain_forms_of_live_stops(&store, &BTreeSet::from([1]))
            .await
            .unwrap();
        assert!(kept.is_empty());
    }

    #[tokio::test]
    async fn push_skips_duplicates() {
        let store = InMemoryPreferenceStore::new();
        assert!(push_form(&store, FormStackEntry::new(1, 0)).await.unwrap());
        assert!(!push_form(&store, FormStackEntry::new(1, 0)).await.unwrap());
        assert!(push_form(&store, FormStackEntry::new(1, 1)).await.unwrap());
        assert_eq!(load_form_stack(&store).await.len(), 2);
    }

    #[tokio::test]
    async fn remove_single_form() {
        let store = InMemoryPreferenceStore::new();
        push_form(&store, FormStackEntry::new(2, 0)).await.unwrap();
        assert!(!remove_form(&store, 2, 9).await.unwrap());
        assert!(remove_form(&store, 2, 0).await.unwrap());
        assert!(is_form_stack_empty(&store).await);
    }

    #[tokio::test]
    async fn retains_only_live_stops() {
        let store = seeded(
            r#"[{"stopId":1,"actionId":0},{"stopId":2,"actionId":0},{"stopId":3,"actionId":0},
                {"stopId":4,"actionId":0},{"stopId":5,"actionId":0},{"stopId":2,"actionId":1}]"#,
        )
        .await;

        let kept = retain_forms_of_live_stops(&store, &BTreeSet::from([5]))
            .await
            .unwrap();

        assert_eq!(kept, vec![1, 2, 3, 4]);
        let persisted = load_form_stack(&store).await;
        assert_eq!(persisted.len(), 5);
        assert!(persisted.iter().all(|e| e.stop_id != 5));
    }

    #[tokio::test]
    async fn persisted_format_is_camel_case() {
        let store = InMemoryPreferenceStore::new();
        push_form(&store, FormStackEntry::new(7, 3)).await.unwrap();
        let raw = store
            .get_value(&PreferenceKey::uncompleted_forms_stack())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw, r#"[{"stopId":7,"actionId":3}]"#);
    }

    #[tokio::test]
    async fn busy_read_never_overwrites_stack() {
        let store = BusyStore::default();
        for stop_id in 1..=3 {
            push_form(&store, FormStackEntry::new(stop_id, 0)).await.unwrap();
        }

        store.busy.store(true, Ordering::SeqCst);
        let pushed = push_form(&store, FormStackEntry::new(9, 0)).await;
        assert!(matches!(pushed, Err(KvError::Storage { code: StorageErrorCode::Busy, .. })));
        assert!(remove_form(&store, 1, 0).await.is_err());
        assert!(retain_forms_of_live_stops(&store, &BTreeSet::from([2]))
            .await
            .is_err());
        assert!(try_load_form_stack(&store).await.is_err());
        assert!(load_form_stack(&store).await.is_empty());

        store.busy.store(false, Ordering::SeqCst);
        let stops: Vec<i32> = load_form_stack(&store).await.iter().map(|e| e.stop_id).collect();
        assert_eq!(stops, vec![1, 2, 3]);
    }
}
