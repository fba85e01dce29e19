use crate::config::{ClientConfig, QueueAddress};
use crate::error::{Result, TaskError};
use crate::queue::client::QueueClient;
use crate::queue::types::*;
use crate::transport::TransportRouter;

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Local bookkeeping of one live sub-task.
#[derive(Debug, Clone)]
struct SubTaskEntry {
    forked_at: u64,
    tag: String,
}

#[derive(Debug, Default)]
struct TaskState {
    next_sub_task_id: SubTaskId,
    sub_tasks: BTreeMap<SubTaskId, SubTaskEntry>,
}

struct TaskCore {
    task_id: TaskId,
    client: QueueClient,
    transports: TransportRouter,
    config: ClientConfig,
    state: Mutex<TaskState>,
    /// Set on the handle created by drop-time teardown so it never re-spawns itself.
    teardown: bool,
}

/// Client-side handle of one logical job.
///
/// Cloning is cheap and every clone shares the same sub-task bookkeeping.
/// When the last clone is dropped inside a tokio runtime, the remaining
/// sub-tasks are joined and removed from the store in the background; call
/// [`Task::close`] to do it explicitly and observe errors.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskCore>,
}

impl Task {
    /// Connects to the queue service and checks it answers.
    pub async fn connect(address: &QueueAddress, config: ClientConfig) -> Result<Self> {
        let client = QueueClient::new(address).with_retry(config.retry.clone());
        client.health().await?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: QueueClient, config: ClientConfig) -> Self {
        Self::from_parts(TaskId::new(), client, config, TaskState::default(), false)
    }

    fn from_parts(
        task_id: TaskId,
        client: QueueClient,
        config: ClientConfig,
        state: TaskState,
        teardown: bool,
    ) -> Self {
        let transports = TransportRouter::new(client.clone(), config.object.clone());
        tracing::debug!("Task {} opened", task_id);
        Self {
            inner: Arc::new(TaskCore {
                task_id,
                client,
                transports,
                config,
                state: Mutex::new(state),
                teardown,
            }),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.inner.task_id
    }

    pub fn client(&self) -> &QueueClient {
        &self.inner.client
    }

    pub fn process_id(&self, sub_task_id: SubTaskId) -> ProcessId {
        ProcessId::new(self.inner.task_id.clone(), sub_task_id)
    }

    /// Id handed out by the most recent `fork`, if any.
    pub fn last_sub_task_id(&self) -> Option<SubTaskId> {
        self.inner.state.lock().next_sub_task_id.checked_sub(1)
    }

    /// Live sub-task ids, optionally restricted to one tag.
    pub fn sub_task_ids(&self, tag: Option<&str>) -> Vec<SubTaskId> {
        self.inner
            .state
            .lock()
            .sub_tasks
            .iter()
            .filter(|(_, entry)| tag.is_none_or(|t| entry.tag == t))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of live sub-tasks, optionally restricted to one tag.
    pub fn pending(&self, tag: Option<&str>) -> usize {
        self.sub_task_ids(tag).len()
    }

    /// Fork timestamp (ms) of a live sub-task.
    pub fn forked_at(&self, sub_task_id: SubTaskId) -> Option<u64> {
        self.inner
            .state
            .lock()
            .sub_tasks
            .get(&sub_task_id)
            .map(|entry| entry.forked_at)
    }

    /// Submits one unit of work for the handler registered as `handler`.
    ///
    /// The record is stored and queued in a single service call, so the
    /// sub-task is either fully queued or not visible at all.
    pub async fn fork(
        &self,
        handler: &str,
        args: Vec<Value>,
        tag: Option<&str>,
        transport: TransportKind,
    ) -> Result<SubTaskId> {
        let sub_task_id = {
            let mut state = self.inner.state.lock();
            let id = state.next_sub_task_id;
            state.next_sub_task_id += 1;
            id
        };

        let record = ProcessRecord::waiting(
            self.process_id(sub_task_id),
            handler,
            args,
            tag.map(str::to_string),
            transport,
        );
        let client = &self.inner.client;
        let record_ref = &record;
        client
            .persistent("fork", move || client.submit(record_ref))
            .await?;

        self.inner.state.lock().sub_tasks.insert(
            sub_task_id,
            SubTaskEntry {
                forked_at: now_ms(),
                tag: record.tag.clone(),
            },
        );

        tracing::debug!("Forked {} ({}) tag={}", record.process_id, handler, record.tag);
        Ok(sub_task_id)
    }

    /// Current record of a sub-task, with a `ready` result resolved through
    /// its transport.
    pub async fn get_sub_task(&self, sub_task_id: SubTaskId) -> Result<ProcessRecord> {
        let process_id = self.process_id(sub_task_id);
        if !self.inner.state.lock().sub_tasks.contains_key(&sub_task_id) {
            return Err(TaskError::UnknownSubTask { process_id });
        }

        let client = &self.inner.client;
        let pid = &process_id;
        let record = client
            .persistent("get_sub_task", move || client.store_get(pid))
            .await?
            .ok_or_else(|| TaskError::StoreRecordMissing {
                process_id: process_id.clone(),
            })?;

        self.resolve(record).await
    }

    /// One field of [`Task::get_sub_task`] in its wire form (`"status"`, `"results"`, ...).
    pub async fn get_sub_task_field(&self, sub_task_id: SubTaskId, field: &str) -> Result<Value> {
        let record = self.get_sub_task(sub_task_id).await?;
        project(&record, field)
    }

    /// Snapshot of every owned sub-task whose record carries `tag` (all when
    /// `None`). Records removed concurrently are skipped.
    pub async fn get_task(&self, tag: Option<&str>) -> Result<Vec<ProcessRecord>> {
        let ids = self.sub_task_ids(tag);
        let process_ids: Vec<ProcessId> = ids.iter().map(|id| self.process_id(*id)).collect();

        let client = &self.inner.client;
        let pids = &process_ids;
        let records = client
            .persistent("get_task", move || client.store_get_many(pids))
            .await?;

        let mut resolved = Vec::with_capacity(records.len());
        for record in records.into_iter().flatten() {
            if tag.is_some_and(|t| record.tag != t) {
                continue;
            }
            resolved.push(self.resolve(record).await?);
        }
        Ok(resolved)
    }

    pub async fn get_task_field(&self, field: &str, tag: Option<&str>) -> Result<Vec<Value>> {
        self.get_task(tag)
            .await?
            .iter()
            .map(|record| project(record, field))
            .collect()
    }

    /// Resolves a transport reference into its payload; see
    /// [`TransportRouter::resolve`].
    pub async fn handle_transport(&self, kind: TransportKind, results: &Value, delete: bool) -> Result<Value> {
        self.inner.transports.resolve(kind, results, delete).await
    }

    async fn resolve(&self, mut record: ProcessRecord) -> Result<ProcessRecord> {
        if record.status == ProcessStatus::Ready
            && let Some(results) = &record.results
        {
            record.results = Some(self.handle_transport(record.transport, results, false).await?);
        }
        Ok(record)
    }

    /// Polls until the sub-task is terminal or `timeout` elapses.
    ///
    /// Returns the last status seen, which is non-terminal on timeout, or
    /// `None` once the record is gone from the store. A zero timeout checks
    /// exactly once.
    pub async fn join_sub_task(
        &self,
        sub_task_id: SubTaskId,
        timeout: Option<Duration>,
    ) -> Result<Option<ProcessStatus>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut statuses = self.poll_until(vec![sub_task_id], deadline).await?;
        Ok(statuses.pop().and_then(|(_, status)| status))
    }

    /// Joins every owned sub-task carrying `tag` (all when `None`) against
    /// one shared deadline.
    pub async fn join_task(
        &self,
        timeout: Option<Duration>,
        tag: Option<&str>,
    ) -> Result<Vec<(SubTaskId, Option<ProcessStatus>)>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.poll_until(self.sub_task_ids(tag), deadline).await
    }

    async fn poll_until(
        &self,
        ids: Vec<SubTaskId>,
        deadline: Option<Instant>,
    ) -> Result<Vec<(SubTaskId, Option<ProcessStatus>)>> {
        // Nothing read yet: a forked record is at least waiting.
        let mut last_seen: BTreeMap<SubTaskId, Option<ProcessStatus>> = ids
            .iter()
            .map(|id| (*id, Some(ProcessStatus::Waiting)))
            .collect();
        let mut pending = ids.clone();

        loop {
            let process_ids: Vec<ProcessId> = pending.iter().map(|id| self.process_id(*id)).collect();

            match self.inner.client.store_get_many(&process_ids).await {
                Ok(records) => {
                    let mut still_pending = Vec::with_capacity(pending.len());
                    for (id, record) in pending.iter().zip(records) {
                        let status = record.map(|r| r.status);
                        last_seen.insert(*id, status);
                        if status.is_some_and(|s| !s.is_terminal()) {
                            still_pending.push(*id);
                        }
                    }
                    pending = still_pending;
                }
                Err(e) if e.is_connection() => {
                    tracing::warn!("Join on task {} could not reach the queue service: {}", self.task_id(), e);
                }
                Err(e) => return Err(e),
            }

            if pending.is_empty() {
                break;
            }

            let mut sleep_for = self.inner.config.poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                sleep_for = sleep_for.min(deadline - now);
            }
            tokio::time::sleep(sleep_for).await;
        }

        Ok(ids.into_iter().map(|id| (id, last_seen[&id])).collect())
    }

    /// Joins the sub-task, then removes its record (and its file, for the
    /// file transport) and forgets it locally.
    ///
    /// Fails with [`TaskError::StoreRecordMissing`] when the store no longer
    /// holds the record and with [`TaskError::UnknownSubTask`] when this
    /// handle does not own the id. When the file cannot be deleted the
    /// sub-task is still forgotten and [`TaskError::ResultNotDiscarded`] is
    /// returned, so the caller can clean up the leftover by process id.
    pub async fn kill_sub_task(&self, sub_task_id: SubTaskId) -> Result<SubTaskId> {
        let process_id = self.process_id(sub_task_id);
        self.join_sub_task(sub_task_id, None).await?;

        let client = &self.inner.client;
        let pid = &process_id;
        let popped = client
            .persistent("kill", move || client.store_pop(pid))
            .await?;

        let Some(record) = popped else {
            self.forget(sub_task_id);
            return Err(TaskError::StoreRecordMissing { process_id });
        };

        let discarded = if record.transport == TransportKind::File {
            let transports = &self.inner.transports;
            let kind = record.transport;
            client
                .persistent("kill", move || transports.discard(kind, pid))
                .await
        } else {
            Ok(false)
        };

        if self.forget(sub_task_id).is_none() {
            return Err(TaskError::UnknownSubTask { process_id });
        }

        if let Err(e) = discarded {
            return Err(TaskError::ResultNotDiscarded {
                process_id,
                message: e.to_string(),
            });
        }

        tracing::debug!("Killed {} ({:?})", process_id, record.status);
        Ok(sub_task_id)
    }

    /// Kills every owned sub-task carrying `tag` (all when `None`).
    ///
    /// Ids that turn out to be gone already are logged and skipped. Ids whose
    /// file could not be deleted count as killed and are logged.
    pub async fn kill_task(&self, tag: Option<&str>) -> Result<Vec<SubTaskId>> {
        self.join_task(None, tag).await?;

        let mut killed = Vec::new();
        for sub_task_id in self.sub_task_ids(tag) {
            match self.kill_sub_task(sub_task_id).await {
                Ok(id) => killed.push(id),
                Err(e @ TaskError::ResultNotDiscarded { .. }) => {
                    tracing::warn!("{}", e);
                    killed.push(sub_task_id);
                }
                Err(e) if e.is_not_found() => {
                    tracing::warn!("Skipping kill of {}: {}", self.process_id(sub_task_id), e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(killed)
    }

    /// Waits until every item on the service pipeline has been acknowledged.
    pub async fn join_queue(&self, timeout: Option<Duration>) -> Result<bool> {
        self.inner.client.pipeline_join(timeout).await
    }

    /// Explicit teardown: kills every remaining sub-task.
    pub async fn close(&self) -> Result<Vec<SubTaskId>> {
        let killed = self.kill_task(None).await?;
        tracing::debug!("Task {} closed, {} sub-tasks killed", self.task_id(), killed.len());
        Ok(killed)
    }

    fn forget(&self, sub_task_id: SubTaskId) -> Option<SubTaskEntry> {
        self.inner.state.lock().sub_tasks.remove(&sub_task_id)
    }
}

fn project(record: &ProcessRecord, field: &str) -> Result<Value> {
    let mut value = serde_json::to_value(record)?;
    Ok(value.get_mut(field).map(Value::take).unwrap_or(Value::Null))
}

impl Drop for TaskCore {
    fn drop(&mut self) {
        if self.teardown {
            return;
        }
        let state = std::mem::take(self.state.get_mut());
        if state.sub_tasks.is_empty() {
            return;
        }

        let remaining = state.sub_tasks.len();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let task = Task::from_parts(
                    self.task_id.clone(),
                    self.client.clone(),
                    self.config.clone(),
                    state,
                    true,
                );
                runtime.spawn(async move {
                    if let Err(e) = task.close().await {
                        tracing::error!("Teardown of task {} failed: {}", task.task_id(), e);
                    }
                });
                tracing::debug!("Task {} dropped, tearing down {} sub-tasks", self.task_id, remaining);
            }
            Err(_) => {
                tracing::warn!(
                    "Task {} dropped outside a runtime, {} sub-tasks left in the store",
                    self.task_id,
                    remaining
                );
            }
        }
    }
}
