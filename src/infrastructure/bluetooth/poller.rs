//! Health Poller
//!
//! One cancellable periodic task per servicing device. The task itself only
//! posts [`CoreEvent::PollTick`]s; the probe (connected check + RSSI read)
//! runs on the dispatch loop, which first asks [`HealthPoller::accepts`]
//! so a cancelled task never probes again.

use crate::infrastructure::bluetooth::service::CoreEvent;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default interval between liveness probes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct PollTask {
    task_id: u64,
    interval: Duration,
    token: CancellationToken,
}

pub struct HealthPoller {
    sender: mpsc::UnboundedSender<CoreEvent>,
    tasks: HashMap<String, PollTask>,
    next_task_id: u64,
}

impl HealthPoller {
    pub fn new(sender: mpsc::UnboundedSender<CoreEvent>) -> Self {
        Self {
            sender,
            tasks: HashMap::new(),
            next_task_id: 0,
        }
    }

    /// Schedule probes for `device_id`: the first immediately, then every `interval`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, device_id: &str, interval: Duration) {
        self.cancel(device_id);

        self.next_task_id += 1;
        let task_id = self.next_task_id;
        let token = CancellationToken::new();

        let sender = self.sender.clone();
        let child = token.clone();
        let id = device_id.to_string();
        tokio::spawn(async move {
            loop {
                if child.is_cancelled() {
                    break;
                }
                let tick = CoreEvent::PollTick {
                    device_id: id.clone(),
                    task_id,
                };
                if sender.send(tick).is_err() {
                    break;
                }
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("Poll task {} for {} ended", task_id, id);
        });

        debug!("Started health poll for {} every {:?}", device_id, interval);
        self.tasks.insert(
            device_id.to_string(),
            PollTask {
                task_id,
                interval,
                token,
            },
        );
    }

    /// Whether a tick from `task_id` should run a probe
    pub fn accepts(&self, device_id: &str, task_id: u64) -> bool {
        self.tasks
            .get(device_id)
            .map(|t| t.task_id == task_id && !t.token.is_cancelled())
            .unwrap_or(false)
    }

    /// Stop the task for `device_id`. Returns false if none was running.
    pub fn cancel(&mut self, device_id: &str) -> bool {
        match self.tasks.remove(device_id) {
            Some(task) => {
                task.token.cancel();
                debug!("Cancelled health poll for {}", device_id);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) -> usize {
        let count = self.tasks.len();
        for (_, task) in self.tasks.drain() {
            task.token.cancel();
        }
        count
    }

    pub fn is_active(&self, device_id: &str) -> bool {
        self.tasks.contains_key(device_id)
    }

    pub fn interval(&self, device_id: &str) -> Option<Duration> {
        self.tasks.get(device_id).map(|t| t.interval)
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Drop for HealthPoller {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
