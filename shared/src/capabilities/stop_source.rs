use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::model::{Dispatch, DispatchId, Stop};

/// Customer id and truck number the remote documents are keyed by.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VehicleRef {
    pub cid: String,
    pub vehicle: String,
}

impl VehicleRef {
    pub fn new(cid: impl Into<String>, vehicle: impl Into<String>) -> Self {
        Self {
            cid: cid.into(),
            vehicle: vehicle.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.cid.trim().is_empty() && !self.vehicle.trim().is_empty()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("remote source unavailable: {message}")]
    Unavailable { message: String, retryable: bool },

    #[error("failed to decode remote document {path}: {message}")]
    Decode { path: String, message: String },
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Unavailable { retryable, .. } => *retryable,
            SourceError::Decode { .. } => false,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            retryable: true,
        }
    }
}

/// Authoritative, eventually-consistent reads of dispatches and stops.
#[async_trait::async_trait]
pub trait StopSource: Send + Sync {
    async fn get_stops_for_dispatch(
        &self,
        vehicle: &VehicleRef,
        dispatch_id: &DispatchId,
    ) -> Result<Vec<Stop>, SourceError>;

    async fn get_dispatch(
        &self,
        vehicle: &VehicleRef,
        dispatch_id: &DispatchId,
    ) -> Result<Option<Dispatch>, SourceError>;
}

/// Source backed by local maps; used for offline replay and tests.
#[derive(Default)]
pub struct InMemoryStopSource {
    stops: RwLock<HashMap<DispatchId, Vec<Stop>>>,
    dispatches: RwLock<HashMap<DispatchId, Dispatch>>,
    reads: AtomicUsize,
    fail_reads: AtomicBool,
}

impl InMemoryStopSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_stops(&self, dispatch_id: impl Into<DispatchId>, stops: Vec<Stop>) {
        self.stops.write().await.insert(dispatch_id.into(), stops);
    }

    pub async fn put_dispatch(&self, dispatch: Dispatch) {
        self.dispatches
            .write()
            .await
            .insert(dispatch.disp_id.clone(), dispatch);
    }

    /// Number of read calls served, including failed ones.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn begin_read(&self) -> Result<(), SourceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SourceError::unavailable("injected read failure"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StopSource for InMemoryStopSource {
    async fn get_stops_for_dispatch(
        &self,
        _vehicle: &VehicleRef,
        dispatch_id: &DispatchId,
    ) -> Result<Vec<Stop>, SourceError> {
        self.begin_read()?;
        Ok(self
            .stops
            .read()
            .await
            .get(dispatch_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_dispatch(
        &self,
        _vehicle: &VehicleRef,
        dispatch_id: &DispatchId,
    ) -> Result<Option<Dispatch>, SourceError> {
        self.begin_read()?;
        Ok(self.dispatches.read().await.get(dispatch_id).cloned())
    }
}
