//! Manager
//!
//! One per compute node. Every cycle it reaps finished workers, publishes
//! the node's availability, and spawns as many new workers as there is
//! queued work, bounded by its capacity.

use super::registry::TaskHandlerRegistry;
use super::status::NodeStatus;
use super::worker::Worker;
use crate::error::Result;
use crate::queue::client::QueueClient;
use crate::transport::TransportRouter;
use crate::transport::object::ObjectTarget;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Instance id published to the registry.
    pub node_id: String,
    /// Maximum number of concurrent workers.
    pub capacity: usize,
    /// Time between cycles.
    pub poll_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", uuid::Uuid::new_v4()),
            capacity: 4,
            poll_interval: Duration::from_secs(1),
        }
    }
}

pub struct Manager {
    client: QueueClient,
    registry: Arc<TaskHandlerRegistry>,
    transports: TransportRouter,
    config: ManagerConfig,
    status: Arc<NodeStatus>,
    next_worker_id: usize,
}

/// Control handle of a spawned [`Manager`].
pub struct ManagerHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
    status: Arc<NodeStatus>,
}

impl ManagerHandle {
    /// Asks the manager to stop, then waits for it and its in-flight workers.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.join.await {
            tracing::error!("Manager {} ended abnormally: {}", self.status.id(), e);
        }
    }

    pub fn availability(&self) -> usize {
        self.status.availability()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Manager {
    pub fn new(client: QueueClient, registry: Arc<TaskHandlerRegistry>, config: ManagerConfig) -> Self {
        let status = Arc::new(NodeStatus::new(config.node_id.clone(), config.capacity));
        Self {
            transports: TransportRouter::new(client.clone(), None),
            client,
            registry,
            config,
            status,
            next_worker_id: 0,
        }
    }

    /// Enables the object transport for results written on this node.
    pub fn with_object_target(mut self, target: ObjectTarget) -> Self {
        self.transports = TransportRouter::new(self.client.clone(), Some(target));
        self
    }

    /// Runs the manager on a background task.
    pub fn spawn(self) -> ManagerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let status = self.status.clone();
        let join = tokio::spawn(self.run(stop_rx));
        ManagerHandle {
            stop: stop_tx,
            join,
            status,
        }
    }

    /// Cycles until `stop` flips to `true`, then publishes zero capacity and
    /// waits for in-flight workers to finish.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        tracing::info!(
            "Manager {} started with capacity {}",
            self.config.node_id,
            self.config.capacity
        );

        let mut workers: Vec<JoinHandle<usize>> = Vec::new();

        loop {
            if *stop.borrow() {
                break;
            }

            if let Err(e) = self.cycle(&mut workers).await {
                if e.is_connection() {
                    tracing::warn!("Manager {} lost the queue service: {}", self.config.node_id, e);
                    let handle_dropped = tokio::select! {
                        _ = self.client.reconnect() => false,
                        changed = stop.changed() => changed.is_err(),
                    };
                    if handle_dropped {
                        break;
                    }
                    continue;
                }
                tracing::error!("Manager {} cycle failed: {}", self.config.node_id, e);
            }

            // A dropped handle counts as a stop request.
            let handle_dropped = tokio::select! {
                changed = stop.changed() => changed.is_err(),
                _ = tokio::time::sleep(self.config.poll_interval) => false,
            };
            if handle_dropped {
                break;
            }
        }

        tracing::info!(
            "Manager {} stopping, waiting for {} worker(s)",
            self.config.node_id,
            workers.len()
        );
        self.status.stop();
        self.status.publish(&self.client).await;

        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!("Worker ended abnormally: {}", e);
            }
        }
        tracing::info!("Manager {} stopped", self.config.node_id);
    }

    async fn cycle(&mut self, workers: &mut Vec<JoinHandle<usize>>) -> Result<()> {
        // 1. Reap
        let (finished, running): (Vec<_>, Vec<_>) =
            workers.drain(..).partition(|worker| worker.is_finished());
        *workers = running;
        for worker in finished {
            match worker.await {
                Ok(processed) => tracing::trace!("Reaped worker after {} item(s)", processed),
                Err(e) => tracing::error!("Worker ended abnormally: {}", e),
            }
        }

        // 2. Availability
        self.status.set_active(workers.len());
        let availability = self.status.availability();

        // 3. Publish
        self.status.publish(&self.client).await;

        // 4. Spawn
        let stats = self.client.stats().await?;
        let to_spawn = stats.queue_size.min(availability);

        tracing::info!(
            node = %self.config.node_id,
            queue = stats.queue_size,
            store = stats.store_len,
            capacity = self.config.capacity,
            workers = workers.len(),
            availability,
            spawning = to_spawn,
            "Manager cycle"
        );

        for _ in 0..to_spawn {
            let worker = Worker::new(
                self.next_worker_id,
                self.client.clone(),
                self.registry.clone(),
                self.transports.clone(),
                self.status.clone(),
            );
            self.next_worker_id += 1;
            workers.push(tokio::spawn(worker.run()));
        }
        self.status.set_active(workers.len());

        Ok(())
    }
}
