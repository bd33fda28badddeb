use crate::runtime::{FlowcraftRuntime, ResumeData, RunOptions};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// A workflow suspended on a timer, waiting to be resumed.
#[derive(Debug, Clone)]
pub struct ScheduledResume {
    pub blueprint_id: String,
    pub serialized_context: String,
    pub awaiting_node_id: String,
    pub wake_up_at: DateTime<Utc>,
}

/// Polls tracked timer-awaiting workflows and resumes the ones whose
/// wake-up time has elapsed. Optional collaborator; the engine runs fine
/// without it.
pub struct TimerScheduler {
    runtime: Weak<FlowcraftRuntime>,
    entries: Mutex<HashMap<String, ScheduledResume>>,
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerScheduler {
    pub fn new(runtime: &Arc<FlowcraftRuntime>) -> Arc<Self> {
        Self::with_interval(runtime, Duration::from_secs(1))
    }

    pub fn with_interval(runtime: &Arc<FlowcraftRuntime>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            runtime: Arc::downgrade(runtime),
            entries: Mutex::new(HashMap::new()),
            interval,
            handle: Mutex::new(None),
        })
    }

    pub fn track(&self, execution_id: String, entry: ScheduledResume) {
        tracing::debug!(
            execution_id = %execution_id,
            node_id = %entry.awaiting_node_id,
            wake_up_at = %entry.wake_up_at,
            "tracking timer resume"
        );
        self.entries
            .lock()
            .expect("scheduler entries poisoned")
            .insert(execution_id, entry);
    }

    pub fn tracked_count(&self) -> usize {
        self.entries
            .lock()
            .expect("scheduler entries poisoned")
            .len()
    }

    /// Spawns the polling loop. Stops when the runtime is dropped or
    /// [`TimerScheduler::stop`] is called.
    pub fn start(self: &Arc<Self>) {
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.interval);
            loop {
                ticker.tick().await;
                if scheduler.runtime.strong_count() == 0 {
                    break;
                }
                scheduler.poll_due(Utc::now()).await;
            }
        });
        *self.handle.lock().expect("scheduler handle poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .handle
            .lock()
            .expect("scheduler handle poisoned")
            .take()
        {
            handle.abort();
        }
    }

    /// Resumes every entry due at `now`. Entries are dropped whether the
    /// resume succeeds or fails; a workflow that suspends on a further timer
    /// is re-registered by the runtime.
    pub async fn poll_due(&self, now: DateTime<Utc>) {
        let due: Vec<(String, ScheduledResume)> = {
            let mut entries = self.entries.lock().expect("scheduler entries poisoned");
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.wake_up_at <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (execution_id, entry) in due {
            let Some(runtime) = self.runtime.upgrade() else {
                return;
            };
            let Some(blueprint) = runtime.blueprint(&entry.blueprint_id).await else {
                tracing::warn!(
                    blueprint_id = %entry.blueprint_id,
                    "timer fired for unregistered blueprint"
                );
                continue;
            };
            tracing::info!(
                execution_id = %execution_id,
                node_id = %entry.awaiting_node_id,
                "timer elapsed; resuming workflow"
            );
            let outcome = runtime
                .resume(
                    &blueprint,
                    &entry.serialized_context,
                    ResumeData::default(),
                    Some(&entry.awaiting_node_id),
                    RunOptions::default(),
                )
                .await;
            if let Err(error) = outcome {
                // Entry already removed; never retried, to avoid storms.
                tracing::error!(
                    execution_id = %execution_id,
                    error = %error,
                    "timer resume failed"
                );
            }
        }
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self
            .handle
            .lock()
            .expect("scheduler handle poisoned")
            .take()
        {
            handle.abort();
        }
    }
}
