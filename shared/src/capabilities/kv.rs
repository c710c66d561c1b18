use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;
pub const MAX_PREFIX_LENGTH: usize = 64;

/// Namespaced preference key, stored as `prefix:key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreferenceKey {
    namespace: KeyNamespace,
    key: String,
}

impl PreferenceKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    /// Id of the dispatch whose trip is currently running.
    pub fn active_dispatch_id() -> Self {
        Self::well_known(KeyNamespace::Dispatch, "active_dispatch_id")
    }

    /// JSON list of `{stopId, actionId}` pairs with forms still to complete.
    pub fn uncompleted_forms_stack() -> Self {
        Self::well_known(KeyNamespace::Forms, "uncompleted_forms_stack")
    }

    pub fn last_sent_trip_panel_message_id() -> Self {
        Self::well_known(KeyNamespace::TripPanel, "last_sent_message_id")
    }

    fn well_known(namespace: KeyNamespace, key: &'static str) -> Self {
        Self {
            namespace,
            key: key.to_string(),
        }
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
            });
        }

        if key.contains(':') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain the namespace separator".to_string(),
            });
        }

        if key.chars().any(|c| c.is_control()) {
            return Err(KvError::InvalidKey {
                key: key.replace('\0', "\\0"),
                reason: "key contains invalid control characters".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyNamespace {
    Dispatch,
    Forms,
    TripPanel,
    Custom(String),
}

impl KeyNamespace {
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::Dispatch => "dispatch",
            KeyNamespace::Forms => "forms",
            KeyNamespace::TripPanel => "trip_panel",
            KeyNamespace::Custom(s) => s.as_str(),
        }
    }

    pub fn custom(prefix: impl Into<String>) -> Result<Self, KvError> {
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LENGTH {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: format!(
                    "custom namespace must be 1..={} bytes",
                    MAX_PREFIX_LENGTH
                ),
            });
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: "custom namespace contains invalid characters".to_string(),
            });
        }
        Ok(KeyNamespace::Custom(prefix))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String, key: Option<String> },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.is_retryable();
        Self::Storage {
            code,
            message: message.into(),
            retryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorCode {
    Unknown,
    Corrupted,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorCode::Busy | StorageErrorCode::Locked)
    }
}

fn check_value_size(value: &str) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// Persisted string preferences. Structured values are stored as JSON.
#[async_trait::async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn get_value(&self, key: &PreferenceKey) -> Result<Option<String>, KvError>;
    async fn set_value(&self, key: &PreferenceKey, value: String) -> Result<(), KvError>;
    async fn remove_value(&self, key: &PreferenceKey) -> Result<bool, KvError>;

    /// Reads a value, falling back to `default` when unset or unreadable.
    async fn get_value_or(&self, key: &PreferenceKey, default: &str) -> String {
        match self.get_value(key).await {
            Ok(Some(value)) => value,
            Ok(None) => default.to_string(),
            Err(e) => {
                warn!(key = %key.raw(), error = %e, "preference read failed, using default");
                default.to_string()
            }
        }
    }
}

/// JSON codec for one well-known key.
pub struct TypedPreference<T> {
    key: PreferenceKey,
    _phantom: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> TypedPreference<T> {
    pub fn new(key: PreferenceKey) -> Self {
        Self {
            key,
            _phantom: PhantomData,
        }
    }

    pub fn key(&self) -> &PreferenceKey {
        &self.key
    }

    pub async fn load(&self, store: &dyn PreferenceStore) -> Result<Option<T>, KvError> {
        let Some(raw) = store.get_value(&self.key).await? else {
            return Ok(None);
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| KvError::Serialization {
                message: e.to_string(),
                key: Some(self.key.raw()),
            })
    }

    pub async fn save(&self, store: &dyn PreferenceStore, value: &T) -> Result<(), KvError> {
        let data = serde_json::to_string(value).map_err(|e| KvError::Serialization {
            message: e.to_string(),
            key: Some(self.key.raw()),
        })?;
        store.set_value(&self.key, data).await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPreferenceStore {
    values: RwLock<HashMap<String, String>>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PreferenceStore for InMemoryPreferenceStore {
    async fn get_value(&self, key: &PreferenceKey) -> Result<Option<String>, KvError> {
        Ok(self.values.read().await.get(&key.raw()).cloned())
    }

    async fn set_value(&self, key: &PreferenceKey, value: String) -> Result<(), KvError> {
        check_value_size(&value)?;
        self.values.write().await.insert(key.raw(), value);
        Ok(())
    }

    async fn remove_value(&self, key: &PreferenceKey) -> Result<bool, KvError> {
        Ok(self.values.write().await.remove(&key.raw()).is_some())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqlitePreferenceStore;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use super::{check_value_size, KvError, PreferenceKey, PreferenceStore, StorageErrorCode};
    use crate::model::UnixTimeMs;
    use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    impl From<rusqlite::Error> for KvError {
        fn from(e: rusqlite::Error) -> Self {
            let code = match &e {
                rusqlite::Error::SqliteFailure(err, _) => match err.code {
                    ErrorCode::DatabaseBusy => StorageErrorCode::Busy,
                    ErrorCode::DatabaseLocked => StorageErrorCode::Locked,
                    ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                        StorageErrorCode::Corrupted
                    }
                    ErrorCode::SystemIoFailure | ErrorCode::DiskFull => StorageErrorCode::IoError,
                    _ => StorageErrorCode::Unknown,
                },
                _ => StorageErrorCode::Unknown,
            };
            KvError::storage(code, e.to_string())
        }
    }

    /// SQLite-backed preferences; one row per key.
    #[derive(Clone)]
    pub struct SqlitePreferenceStore {
        conn: Arc<Mutex<Connection>>,
    }

    impl SqlitePreferenceStore {
        pub fn open(path: &Path) -> Result<Self, KvError> {
            Self::init(Connection::open(path)?)
        }

        pub fn in_memory() -> Result<Self, KvError> {
            Self::init(Connection::open_in_memory()?)
        }

        fn init(conn: Connection) -> Result<Self, KvError> {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS preferences (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );",
            )?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }

        async fn with_conn<T, F>(&self, f: F) -> Result<T, KvError>
        where
            T: Send + 'static,
            F: FnOnce(&Connection) -> Result<T, KvError> + Send + 'static,
        {
            let conn = Arc::clone(&self.conn);
            tokio::task::spawn_blocking(move || {
                let guard = conn
                    .lock()
                    .map_err(|_| KvError::storage(StorageErrorCode::Locked, "connection poisoned"))?;
                f(&guard)
            })
            .await
            .map_err(|e| KvError::storage(StorageErrorCode::Unknown, e.to_string()))?
        }
    }

    #[async_trait::async_trait]
    impl PreferenceStore for SqlitePreferenceStore {
        async fn get_value(&self, key: &PreferenceKey) -> Result<Option<String>, KvError> {
            let raw = key.raw();
            self.with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT value FROM preferences WHERE key = ?1",
                        params![raw],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?)
            })
            .await
        }

        async fn set_value(&self, key: &PreferenceKey, value: String) -> Result<(), KvError> {
            check_value_size(&value)?;
            let raw = key.raw();
            let now = UnixTimeMs::now().0 as i64;
            self.with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO preferences (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    params![raw, value, now],
                )?;
                Ok(())
            })
            .await
        }

        async fn remove_value(&self, key: &PreferenceKey) -> Result<bool, KvError> {
            let raw = key.raw();
            self.with_conn(move |conn| {
                let deleted = conn.execute("DELETE FROM preferences WHERE key = ?1", params![raw])?;
                Ok(deleted > 0)
            })
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_key_validation_empty() {
        let result = PreferenceKey::new(KeyNamespace::Dispatch, "");
        assert!(matches!(result, Err(KvError::InvalidKey { .. })));
    }

    #[test]
    fn test_key_validation_whitespace() {
        assert!(PreferenceKey::new(KeyNamespace::Dispatch, "   ").is_err());
    }

    #[test]
    fn test_key_validation_separator_and_control_chars() {
        assert!(PreferenceKey::new(KeyNamespace::Forms, "a:b").is_err());
        assert!(PreferenceKey::new(KeyNamespace::Forms, "key\0value").is_err());
    }

    #[test]
    fn test_key_validation_too_long() {
        let long_key = "a".repeat(MAX_KEY_LENGTH + 1);
        assert!(PreferenceKey::new(KeyNamespace::Forms, long_key).is_err());
    }

    #[test]
    fn test_well_known_keys() {
        assert_eq!(
            PreferenceKey::active_dispatch_id().raw(),
            "dispatch:active_dispatch_id"
        );
        assert_eq!(
            PreferenceKey::uncompleted_forms_stack().raw(),
            "forms:uncompleted_forms_stack"
        );
    }

    #[test]
    fn test_custom_namespace() {
        assert_eq!(KeyNamespace::custom("fleet").unwrap().prefix(), "fleet");
        assert!(KeyNamespace::custom("").is_err());
        assert!(KeyNamespace::custom("bad namespace!").is_err());
    }

    #[test]
    fn test_error_retryable() {
        assert!(KvError::storage(StorageErrorCode::Busy, "busy").is_retryable());
        assert!(!KvError::storage(StorageErrorCode::Corrupted, "bad").is_retryable());
        assert!(!KvError::Serialization {
            message: "x".into(),
            key: None
        }
        .is_retryable());
    }

    #[tokio::test]
    async fn test_in_memory_get_or_default() {
        let store = InMemoryPreferenceStore::new();
        let key = PreferenceKey::active_dispatch_id();

        assert_eq!(store.get_value_or(&key, "").await, "");

        store.set_value(&key, "1000".into()).await.unwrap();
        assert_eq!(store.get_value_or(&key, "").await, "1000");

        assert!(store.remove_value(&key).await.unwrap());
        assert!(!store.remove_value(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_in_memory_rejects_oversized_value() {
        let store = InMemoryPreferenceStore::new();
        let result = store
            .set_value(&PreferenceKey::active_dispatch_id(), "x".repeat(MAX_VALUE_SIZE + 1))
            .await;
        assert!(matches!(result, Err(KvError::ValueTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_typed_preference_malformed_json() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Pair {
            a: i32,
        }

        let store = InMemoryPreferenceStore::new();
        let pref: TypedPreference<Vec<Pair>> =
            TypedPreference::new(PreferenceKey::uncompleted_forms_stack());

        assert_eq!(pref.load(&store).await.unwrap(), None);

        pref.save(&store, &vec![Pair { a: 1 }]).await.unwrap();
        assert_eq!(pref.load(&store).await.unwrap(), Some(vec![Pair { a: 1 }]));

        store
            .set_value(pref.key(), "{not json".into())
            .await
            .unwrap();
        assert!(matches!(
            pref.load(&store).await,
            Err(KvError::Serialization { .. })
        ));
    }

    #[tokio::test]
    async fn test_sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.db");
        let key = PreferenceKey::active_dispatch_id();

        {
            let store = SqlitePreferenceStore::open(&path).unwrap();
            store.set_value(&key, "1000".into()).await.unwrap();
            store.set_value(&key, "1337".into()).await.unwrap();
        }

        let store = SqlitePreferenceStore::open(&path).unwrap();
        assert_eq!(store.get_value(&key).await.unwrap().as_deref(), Some("1337"));
        assert!(store.remove_value(&key).await.unwrap());
        assert_eq!(store.get_value(&key).await.unwrap(), None);
    }
}
