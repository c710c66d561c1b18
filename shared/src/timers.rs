//! Late-arrival and detention timers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::capabilities::{BroadcastAction, FanOut};
use crate::model::{ActionType, DispatchId, Stop, UnixTimeMs};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Late { dispatch_id: DispatchId, stop_id: i32 },
    Detention { dispatch_id: DispatchId, stop_id: i32 },
}

impl TimerKey {
    pub fn dispatch_id(&self) -> &DispatchId {
        match self {
            TimerKey::Late { dispatch_id, .. } | TimerKey::Detention { dispatch_id, .. } => {
                dispatch_id
            }
        }
    }

    pub fn stop_id(&self) -> i32 {
        match self {
            TimerKey::Late { stop_id, .. } | TimerKey::Detention { stop_id, .. } => *stop_id,
        }
    }
}

struct ScheduledTask {
    generation: u64,
    handle: JoinHandle<()>,
}

type TaskMap = HashMap<TimerKey, ScheduledTask>;

fn lock(tasks: &Mutex<TaskMap>) -> MutexGuard<'_, TaskMap> {
    tasks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Delayed work keyed by [`TimerKey`]. A key holds at most one live task;
/// fired tasks remove themselves.
#[derive(Default)]
pub struct ScheduledTasks {
    tasks: Arc<Mutex<TaskMap>>,
    next_generation: AtomicU64,
}

impl ScheduledTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work` after `delay`, replacing any task already under `key`.
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, key: TimerKey, delay: Duration, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::clone(&self.tasks);
        let task_key = key.clone();

        let mut map = lock(&self.tasks);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut map = lock(&tasks);
                match map.get(&task_key) {
                    Some(task) if task.generation == generation => {
                        map.remove(&task_key);
                    }
                    _ => return,
                }
            }
            work.await;
        });
        if let Some(previous) = map.insert(key.clone(), ScheduledTask { generation, handle }) {
            previous.handle.abort();
            debug!(?key, "timer rescheduled");
        }
    }

    /// Returns whether a live task was cancelled. Cancelling twice is fine.
    pub fn cancel(&self, key: &TimerKey) -> bool {
        match lock(&self.tasks).remove(key) {
            Some(task) => {
                task.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_dispatch(&self, dispatch_id: &DispatchId) -> usize {
        let mut map = lock(&self.tasks);
        let keys: Vec<TimerKey> = map
            .keys()
            .filter(|k| k.dispatch_id() == dispatch_id)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(task) = map.remove(key) {
                task.handle.abort();
            }
        }
        keys.len()
    }

    pub fn cancel_all(&self) {
        for (_, task) in lock(&self.tasks).drain() {
            task.handle.abort();
        }
    }

    pub fn is_scheduled(&self, key: &TimerKey) -> bool {
        lock(&self.tasks).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ScheduledTasks {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn stop_extras(stop: &Stop) -> HashMap<String, String> {
    HashMap::from([
        ("dispatchId".to_string(), stop.dispatch_id.to_string()),
        ("stopId".to_string(), stop.stop_id.to_string()),
        ("stopName".to_string(), stop.name.clone()),
    ])
}

/// Trip timers delivered through the broadcaster.
pub struct TripTimers {
    tasks: ScheduledTasks,
    fan_out: FanOut,
    late_grace: Duration,
    detention_threshold: Duration,
}

impl TripTimers {
    pub fn new(fan_out: FanOut, late_grace_ms: u64, detention_threshold_ms: u64) -> Self {
        Self {
            tasks: ScheduledTasks::new(),
            fan_out,
            late_grace: Duration::from_millis(late_grace_ms),
            detention_threshold: Duration::from_millis(detention_threshold_ms),
        }
    }

    pub fn tasks(&self) -> &ScheduledTasks {
        &self.tasks
    }

    /// Arms the late timer for the stop's arrive ETA. Returns `false` when
    /// the stop has no ETA or is already done.
    pub fn schedule_late_notification(&self, stop: &Stop, now: UnixTimeMs) -> bool {
        let key = TimerKey::Late {
            dispatch_id: stop.dispatch_id.clone(),
            stop_id: stop.stop_id,
        };
        let eta = stop.action(ActionType::Arrived).and_then(|a| a.eta);
        let Some(eta) = eta.filter(|_| !stop.is_deleted() && !stop.is_completed()) else {
            self.tasks.cancel(&key);
            return false;
        };

        let deadline = eta.add_millis(self.late_grace.as_millis() as u64);
        let delay = Duration::from_millis(now.millis_until(deadline));
        let fan_out = self.fan_out.clone();
        let extras = stop_extras(stop);
        debug!(stop_id = stop.stop_id, delay_ms = delay.as_millis() as u64, "late timer armed");
        self.tasks.schedule(key, delay, async move {
            info!(stop_id = %extras["stopId"], "driver late for stop");
            fan_out.broadcast(BroadcastAction::LateNotification, extras).await;
        });
        true
    }

    /// Clears the late timer and starts the detention clock.
    pub fn on_arrival(&self, stop: &Stop) {
        self.tasks.cancel(&TimerKey::Late {
            dispatch_id: stop.dispatch_id.clone(),
            stop_id: stop.stop_id,
        });

        let fan_out = self.fan_out.clone();
        let extras = stop_extras(stop);
        self.tasks.schedule(
            TimerKey::Detention {
                dispatch_id: stop.dispatch_id.clone(),
                stop_id: stop.stop_id,
            },
            self.detention_threshold,
            async move {
                info!(stop_id = %extras["stopId"], "detention threshold reached");
                fan_out
                    .broadcast(BroadcastAction::DetentionWarning, extras)
                    .await;
            },
        );
    }

    pub fn on_departure(&self, stop: &Stop) {
        self.cancel_for_stop(&stop.dispatch_id, stop.stop_id);
    }

    pub fn cancel_for_stop(&self, dispatch_id: &DispatchId, stop_id: i32) {
        let dispatch_id = dispatch_id.clone();
        self.tasks.cancel(&TimerKey::Late {
            dispatch_id: dispatch_id.clone(),
            stop_id,
        });
        self.tasks.cancel(&TimerKey::Detention {
            dispatch_id,
            stop_id,
        });
    }

    pub fn cancel_for_dispatch(&self, dispatch_id: &DispatchId) -> usize {
        let cancelled = self.tasks.cancel_dispatch(dispatch_id);
        if cancelled > 0 {
            debug!(dispatch_id = %dispatch_id, cancelled, "dispatch timers cancelled");
        }
        cancelled
    }
}
