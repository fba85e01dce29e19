//! Stage descriptors and the context handed to stage callbacks.

use super::logs::StageLogs;
use crate::error::{Result, TaskError};
use crate::queue::types::{ProcessRecord, SubTaskId, TransportKind};
use crate::task::Task;

use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type StageFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

pub type StartFn = Arc<dyn Fn(StageContext) -> StageFuture + Send + Sync>;

/// Receives the ready and the error records drained in one turn.
pub type BatchFn =
    Arc<dyn Fn(StageContext, Vec<ProcessRecord>, Vec<ProcessRecord>) -> StageFuture + Send + Sync>;

pub type CleanupFn = Arc<dyn Fn(StageSummary) -> StageFuture + Send + Sync>;

/// One named step of a [`StagedTask`](super::StagedTask).
///
/// A stage with an `on_batch` callback loops: it drains the sub-tasks
/// tagged with its name and hands them to the callback until nothing is
/// pending and its predecessor has finished. A stage with only `on_start`
/// is a source: it runs the callback once (typically forking the initial
/// work onto the next stage) and finishes.
#[derive(Clone)]
pub struct Stage {
    pub(crate) name: String,
    pub(crate) on_start: Option<StartFn>,
    pub(crate) on_batch: Option<BatchFn>,
    pub(crate) on_cleanup: Option<CleanupFn>,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on_start: None,
            on_batch: None,
            on_cleanup: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_source(&self) -> bool {
        self.on_batch.is_none()
    }

    pub fn on_start<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(StageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_start = Some(Arc::new(move |ctx| Box::pin(callback(ctx))));
        self
    }

    pub fn on_batch<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(StageContext, Vec<ProcessRecord>, Vec<ProcessRecord>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_batch = Some(Arc::new(move |ctx, ready, errors| {
            Box::pin(callback(ctx, ready, errors))
        }));
        self
    }

    /// Runs after every stage of the pipeline has finished, in declaration order.
    pub fn on_cleanup<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(StageSummary) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_cleanup = Some(Arc::new(move |summary| Box::pin(callback(summary))));
        self
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("on_start", &self.on_start.is_some())
            .field("on_batch", &self.on_batch.is_some())
            .field("on_cleanup", &self.on_cleanup.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCount {
    pub forked: u64,
    pub processed: u64,
}

/// Counters of every stage, indexed by declaration order.
#[derive(Debug)]
pub(crate) struct StageCounters {
    names: Vec<String>,
    counts: Mutex<Vec<StageCount>>,
}

impl StageCounters {
    pub(crate) fn new(names: Vec<String>) -> Self {
        let counts = Mutex::new(vec![StageCount::default(); names.len()]);
        Self { names, counts }
    }

    pub(crate) fn add_forked(&self, stage: usize, n: u64) {
        if let Some(count) = self.counts.lock().get_mut(stage) {
            count.forked += n;
        }
    }

    pub(crate) fn add_processed(&self, stage: usize, n: u64) {
        if let Some(count) = self.counts.lock().get_mut(stage) {
            count.processed += n;
        }
    }

    pub(crate) fn get(&self, stage: usize) -> StageCount {
        self.counts.lock().get(stage).copied().unwrap_or_default()
    }

    /// `name forked/processed -> ...` over all stages.
    pub(crate) fn status_line(&self) -> String {
        let counts = self.counts.lock();
        self.names
            .iter()
            .zip(counts.iter())
            .map(|(name, count)| format!("{} {}/{}", name, count.forked, count.processed))
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

/// Handle passed to stage callbacks.
#[derive(Clone)]
pub struct StageContext {
    pub(crate) task: Task,
    pub(crate) stage: usize,
    pub(crate) names: Arc<Vec<String>>,
    pub(crate) counters: Arc<StageCounters>,
}

impl StageContext {
    pub fn stage_name(&self) -> &str {
        &self.names[self.stage]
    }

    /// Name of the stage that consumes this stage's forks, if any.
    pub fn next_stage(&self) -> Option<&str> {
        self.names.get(self.stage + 1).map(String::as_str)
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Forks work onto the next stage.
    pub async fn fork(&self, handler: &str, args: Vec<Value>) -> Result<SubTaskId> {
        self.fork_with_transport(handler, args, TransportKind::Store).await
    }

    pub async fn fork_with_transport(
        &self,
        handler: &str,
        args: Vec<Value>,
        transport: TransportKind,
    ) -> Result<SubTaskId> {
        let next = self
            .next_stage()
            .ok_or_else(|| TaskError::NoNextStage(self.stage_name().to_string()))?
            .to_string();
        self.fork_onto(&next, handler, args, transport).await
    }

    /// Forks work onto an explicitly named stage.
    pub async fn fork_to(&self, stage: &str, handler: &str, args: Vec<Value>) -> Result<SubTaskId> {
        if !self.names.iter().any(|name| name == stage) {
            return Err(TaskError::descriptor(stage, "no such stage"));
        }
        self.fork_onto(stage, handler, args, TransportKind::Store).await
    }

    async fn fork_onto(
        &self,
        stage: &str,
        handler: &str,
        args: Vec<Value>,
        transport: TransportKind,
    ) -> Result<SubTaskId> {
        let id = self.task.fork(handler, args, Some(stage), transport).await?;
        self.counters.add_forked(self.stage, 1);
        Ok(id)
    }
}

/// What a cleanup callback receives once the pipeline has drained.
#[derive(Debug, Clone)]
pub struct StageSummary {
    pub name: String,
    pub count: StageCount,
    pub logs: StageLogs,
}
