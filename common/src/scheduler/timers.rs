// One-shot alert timers, keyed by dispatch key

use crate::models::DispatchKey;
use crate::telemetry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Set of armed timers. At most one live timer exists per key.
#[derive(Default)]
pub struct TimerSet {
    handles: Mutex<HashMap<DispatchKey, JoinHandle<()>>>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `task` to run after `delay`.
    ///
    /// Returns `false` if a live timer for the key already exists.
    pub fn arm<F>(&self, key: DispatchKey, delay: Duration, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(|_, handle| !handle.is_finished());

        if handles.contains_key(&key) {
            return false;
        }

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        handles.insert(key, handle);

        debug!(key = %key, delay_seconds = delay.as_secs(), "Timer armed");
        telemetry::update_timers_armed(handles.len());
        true
    }

    /// Number of timers that have not fired yet
    pub fn armed(&self) -> usize {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(|_, handle| !handle.is_finished());
        telemetry::update_timers_armed(handles.len());
        handles.len()
    }

    pub fn cancel_all(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for (_, handle) in handles.drain() {
            handle.abort();
        }
        telemetry::update_timers_armed(0);
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
