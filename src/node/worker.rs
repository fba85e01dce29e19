//! Worker
//!
//! One execution unit that handles one sub-task at a time. It never idles:
//! when the queue is empty it returns, and the manager spawns fresh workers
//! once new work shows up.

use super::fault;
use super::registry::TaskHandlerRegistry;
use super::status::NodeStatus;
use crate::error::Result;
use crate::queue::client::QueueClient;
use crate::queue::types::*;
use crate::transport::TransportRouter;

use std::sync::Arc;

/// A dequeued item that has not been acknowledged yet.
struct InFlight {
    process_id: ProcessId,
    /// Final record, kept so a lost connection does not re-run the handler.
    finished: Option<ProcessRecord>,
}

pub struct Worker {
    id: usize,
    client: QueueClient,
    registry: Arc<TaskHandlerRegistry>,
    transports: TransportRouter,
    status: Arc<NodeStatus>,
}

impl Worker {
    pub fn new(
        id: usize,
        client: QueueClient,
        registry: Arc<TaskHandlerRegistry>,
        transports: TransportRouter,
        status: Arc<NodeStatus>,
    ) -> Self {
        Self {
            id,
            client,
            registry,
            transports,
            status,
        }
    }

    /// Processes items until the queue is empty. Returns how many were acknowledged.
    ///
    /// Connection faults never end the loop: the worker waits for the
    /// service and retries the item it was holding.
    pub async fn run(self) -> usize {
        tracing::debug!("Worker {} started on {}", self.id, self.status.id());

        let mut processed = 0;
        let mut in_flight: Option<InFlight> = None;

        loop {
            match self.cycle(&mut in_flight).await {
                Ok(true) => processed += 1,
                Ok(false) => break,
                Err(e) if e.is_connection() => {
                    tracing::warn!("Worker {} lost the queue service: {}", self.id, e);
                    self.client.reconnect().await;
                }
                Err(e) => {
                    // Not retryable: acknowledge so joins on the pipeline do not hang.
                    let Some(item) = in_flight.take() else {
                        tracing::error!("Worker {} failed to dequeue: {}", self.id, e);
                        break;
                    };
                    tracing::error!("Worker {} gave up on {}: {}", self.id, item.process_id, e);
                    if let Err(e) = self.client.task_done().await {
                        tracing::error!("Worker {} could not acknowledge {}: {}", self.id, item.process_id, e);
                    }
                }
            }
        }

        tracing::debug!("Worker {} finished after {} item(s)", self.id, processed);
        processed
    }

    /// One dequeue/execute/acknowledge round. `Ok(false)` when the queue is empty.
    async fn cycle(&self, in_flight: &mut Option<InFlight>) -> Result<bool> {
        if in_flight.is_none() {
            let Some(process_id) = self.client.dequeue().await? else {
                return Ok(false);
            };
            *in_flight = Some(InFlight {
                process_id,
                finished: None,
            });
        }
        let Some(item) = in_flight.as_mut() else {
            return Ok(false);
        };

        if item.finished.is_none() {
            item.finished = self.execute(&item.process_id).await?;
        }
        if let Some(record) = &item.finished {
            self.client.store_update(vec![record.clone()]).await?;
            tracing::debug!("Worker {} wrote {} as {:?}", self.id, record.process_id, record.status);
        }

        self.client.task_done().await?;
        *in_flight = None;
        Ok(true)
    }

    /// Marks the record running, runs its handler and builds the final record.
    ///
    /// `Ok(None)` when there is nothing to write back: the record was killed
    /// or another attempt already finished it.
    async fn execute(&self, process_id: &ProcessId) -> Result<Option<ProcessRecord>> {
        let Some(mut record) = self.client.store_get(process_id).await? else {
            tracing::info!("Worker {} skipping {}: no longer in the store", self.id, process_id);
            return Ok(None);
        };
        if record.status.is_terminal() {
            tracing::debug!("Worker {} skipping {}: already {:?}", self.id, process_id, record.status);
            return Ok(None);
        }

        if record.status == ProcessStatus::Waiting {
            record.status = ProcessStatus::Running;
            self.client.store_update(vec![record.clone()]).await?;
        }
        self.status.task_started();
        self.status.publish(&self.client).await;

        tracing::debug!("Worker {} running {} ({})", self.id, process_id, record.task_name);
        let outcome = fault::run_isolated(
            self.registry.clone(),
            &record.task_name,
            record.task_args.clone(),
        )
        .await;

        match outcome {
            Ok(value) => {
                let (transport, results) = self
                    .transports
                    .persist(process_id, record.transport, value)
                    .await;
                record.transport = transport;
                record.results = Some(results);
                record.status = ProcessStatus::Ready;
            }
            Err(payload) => {
                tracing::warn!(
                    "Task {} ({}) failed: {}",
                    process_id,
                    record.task_name,
                    payload.error
                );
                record.results = Some(serde_json::to_value(&payload)?);
                record.transport = TransportKind::Store;
                record.status = ProcessStatus::Error;
            }
        }

        Ok(Some(record))
    }
}
