//! Queue Service
//!
//! The single authoritative rendezvous point between task handles and workers.
//! It owns the FIFO pipeline, the result store, the file vault and the
//! instance registry, and performs no scheduling of its own.
//!
//! ## Consistency
//! Store writes go through one async lock so the status check and the write
//! of a record happen as one step, and so a submit is either fully queued
//! (record stored and id enqueued) or not visible at all.

use super::files::FileVault;
use super::handlers::router;
use super::pipeline::WorkPipeline;
use super::protocol::StatsResponse;
use super::store::ResultStore;
use super::types::*;
use crate::error::TaskError;

use anyhow::Result;
use dashmap::DashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct QueueService {
    pipeline: WorkPipeline,
    store: Arc<dyn ResultStore>,
    files: FileVault,
    instances: DashMap<String, InstanceRecord>,
    write_lock: Mutex<()>,
}

impl QueueService {
    pub fn new(store: Arc<dyn ResultStore>, files: FileVault) -> Arc<Self> {
        Arc::new(Self {
            pipeline: WorkPipeline::new(),
            store,
            files,
            instances: DashMap::new(),
            write_lock: Mutex::new(()),
        })
    }

    /// Binds the HTTP endpoint and serves it on a background task.
    ///
    /// Returns the bound address, which differs from `addr` when port 0 was requested.
    pub async fn bind(
        self: Arc<Self>,
        addr: SocketAddr,
        key: &str,
    ) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
        self.bind_until(addr, key, std::future::pending()).await
    }

    /// Like [`QueueService::bind`], but stops serving once `shutdown` resolves.
    ///
    /// In-flight requests are answered, idle keep-alive connections are
    /// closed, and the listener is released before the task completes. The
    /// state survives, so the same service can be bound again.
    pub async fn bind_until<F>(
        self: Arc<Self>,
        addr: SocketAddr,
        key: &str,
        shutdown: F,
    ) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let app = router(self, key);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("Queue service stopped: {}", e);
            }
            tracing::info!("Queue service on {} shut down", local_addr);
        });

        tracing::info!("Queue service listening on {}", local_addr);
        Ok((local_addr, handle))
    }

    // --- Pipeline ---

    /// Stores a freshly forked record and enqueues its id.
    ///
    /// A record whose id is already stored is left untouched and not
    /// re-queued, so retried submits are harmless.
    pub async fn submit(&self, record: ProcessRecord) -> Result<bool> {
        if record.status != ProcessStatus::Waiting {
            return Err(TaskError::InvalidTransition {
                process_id: record.process_id.clone(),
                from: ProcessStatus::Waiting,
                to: record.status,
            }
            .into());
        }

        let _guard = self.write_lock.lock().await;
        let process_id = record.process_id.clone();

        if !self.store.insert_new(record).await? {
            tracing::debug!("Submit of {} ignored, already stored", process_id);
            return Ok(false);
        }
        self.pipeline.put(process_id.clone());

        tracing::debug!("Queued {}", process_id);
        Ok(true)
    }

    pub fn dequeue(&self) -> Option<ProcessId> {
        self.pipeline.try_get()
    }

    pub fn task_done(&self) -> Result<()> {
        self.pipeline.task_done()
    }

    pub async fn pipeline_join(&self, timeout: Option<Duration>) -> bool {
        self.pipeline.join(timeout).await
    }

    pub fn queue_size(&self) -> usize {
        self.pipeline.size()
    }

    // --- Store ---

    /// Writes a batch of records, rejecting any write that would move a
    /// record's status backward or skip `running`.
    ///
    /// The whole batch is validated before anything is written.
    pub async fn store_update(&self, batch: Vec<ProcessRecord>) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        for record in &batch {
            if let Some(current) = self.store.get(&record.process_id).await?
                && !current.status.can_advance_to(record.status)
            {
                return Err(TaskError::InvalidTransition {
                    process_id: record.process_id.clone(),
                    from: current.status,
                    to: record.status,
                }
                .into());
            }
        }

        self.store.update(batch).await
    }

    pub async fn store_get(&self, process_id: &ProcessId) -> Result<Option<ProcessRecord>> {
        self.store.get(process_id).await
    }

    pub async fn store_get_many(
        &self,
        process_ids: &[ProcessId],
    ) -> Result<Vec<Option<ProcessRecord>>> {
        let mut records = Vec::with_capacity(process_ids.len());
        for process_id in process_ids {
            records.push(self.store.get(process_id).await?);
        }
        Ok(records)
    }

    pub async fn store_pop(&self, process_id: &ProcessId) -> Result<Option<ProcessRecord>> {
        let _guard = self.write_lock.lock().await;
        self.store.pop(process_id).await
    }

    pub async fn store_len(&self) -> Result<usize> {
        self.store.len().await
    }

    // --- Files ---

    pub async fn set_file_contents(&self, process_id: &ProcessId, contents: &[u8]) -> Result<()> {
        Ok(self.files.set_contents(process_id, contents).await?)
    }

    pub async fn get_file_contents(&self, process_id: &ProcessId) -> Result<Option<Vec<u8>>> {
        Ok(self.files.get_contents(process_id).await?)
    }

    pub async fn delete_file(&self, process_id: &ProcessId) -> Result<bool> {
        Ok(self.files.delete(process_id).await?)
    }

    // --- Instances ---

    pub fn publish_instance(&self, record: InstanceRecord) {
        tracing::trace!(
            "Instance {} availability {}/{}",
            record.id,
            record.availability,
            record.capacity
        );
        self.instances.insert(record.id.clone(), record);
    }

    pub fn list_instances(&self) -> Vec<InstanceRecord> {
        let mut instances: Vec<InstanceRecord> = self
            .instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        instances
    }

    pub async fn stats(&self) -> Result<StatsResponse> {
        Ok(StatsResponse {
            queue_size: self.pipeline.size(),
            unfinished: self.pipeline.unfinished(),
            store_len: self.store.len().await?,
            instances: self.list_instances(),
        })
    }
}
