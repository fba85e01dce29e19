use crate::queue::client::QueueClient;
use crate::queue::types::{InstanceRecord, InstanceStatus, now_ms};

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Live availability of one compute node, shared by its manager and workers.
#[derive(Debug)]
pub struct NodeStatus {
    id: String,
    capacity: usize,
    active: AtomicUsize,
    /// 0 until the first task is picked up.
    last_task: AtomicU64,
    stopped: AtomicBool,
}

impl NodeStatus {
    pub fn new(id: impl Into<String>, capacity: usize) -> Self {
        Self {
            id: id.into(),
            capacity,
            active: AtomicUsize::new(0),
            last_task: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_active(&self, active: usize) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn availability(&self) -> usize {
        if self.stopped.load(Ordering::SeqCst) {
            return 0;
        }
        self.capacity.saturating_sub(self.active.load(Ordering::SeqCst))
    }

    pub fn task_started(&self) {
        self.last_task.store(now_ms(), Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> InstanceRecord {
        let last_task = match self.last_task.load(Ordering::SeqCst) {
            0 => None,
            ts => Some(ts),
        };

        if self.stopped.load(Ordering::SeqCst) {
            return InstanceRecord {
                id: self.id.clone(),
                status: InstanceStatus::Stopped,
                capacity: 0,
                availability: 0,
                last_task,
            };
        }

        InstanceRecord {
            id: self.id.clone(),
            status: InstanceStatus::Running,
            capacity: self.capacity,
            availability: self.availability(),
            last_task,
        }
    }

    /// Best effort: a failed publish is logged, the next one catches up.
    pub async fn publish(&self, client: &QueueClient) {
        if let Err(e) = client.publish_instance(&self.snapshot()).await {
            tracing::warn!("Could not publish availability of {}: {}", self.id, e);
        }
    }
}
