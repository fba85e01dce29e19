use super::logs::StageLogs;
use super::regulator::TurnRegulator;
use super::stage::{Stage, StageContext, StageCount, StageCounters, StageSummary};
use crate::error::{Result, TaskError};
use crate::queue::types::{ProcessRecord, ProcessStatus, TaskId};
use crate::task::Task;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A [`Task`] split into an ordered list of stages.
///
/// Each stage runs on its own tokio task and consumes the sub-tasks tagged
/// with its name. Order is fixed by the builder, never by registration
/// side effects.
pub struct StagedTask {
    task: Task,
    log_dir: PathBuf,
    idle_interval: Duration,
    stages: Vec<Stage>,
}

pub struct StagedTaskBuilder {
    task: Task,
    log_dir: PathBuf,
    idle_interval: Duration,
    stages: Vec<Stage>,
}

impl StagedTaskBuilder {
    /// Appends a stage; the call order is the pipeline order.
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Pause between two turns of the same stage.
    pub fn idle_interval(mut self, idle_interval: Duration) -> Self {
        self.idle_interval = idle_interval;
        self
    }

    pub fn build(self) -> Result<StagedTask> {
        if self.stages.is_empty() {
            return Err(TaskError::descriptor("pipeline", "at least one stage is required"));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.is_empty() {
                return Err(TaskError::descriptor("pipeline", "stage names must not be empty"));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(TaskError::descriptor(&stage.name, "duplicate stage name"));
            }
        }

        Ok(StagedTask {
            task: self.task,
            log_dir: self.log_dir,
            idle_interval: self.idle_interval,
            stages: self.stages,
        })
    }
}

/// Counters and exit observations of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub name: String,
    pub count: StageCount,
    /// Owned sub-tasks tagged with the stage when it exited.
    pub pending_at_exit: usize,
    /// Whether the previous stage had finished when this one decided to
    /// exit. Always `true` for the first stage.
    pub predecessor_finished_at_exit: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub task_id: TaskId,
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|stage| stage.name == name)
    }
}

impl StagedTask {
    pub fn builder(task: Task, log_dir: impl Into<PathBuf>) -> StagedTaskBuilder {
        StagedTaskBuilder {
            task,
            log_dir: log_dir.into(),
            idle_interval: Duration::from_millis(10),
            stages: Vec::new(),
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name.as_str()).collect()
    }

    /// Runs every stage to completion, then the cleanup callbacks in
    /// declaration order.
    pub async fn run(self) -> Result<PipelineReport> {
        let task_id = self.task.task_id().clone();
        let names: Arc<Vec<String>> = Arc::new(self.stages.iter().map(|s| s.name.clone()).collect());
        let counters = Arc::new(StageCounters::new(names.to_vec()));
        let regulator = Arc::new(TurnRegulator::new(self.stages.len()));
        let finished: Arc<Vec<AtomicBool>> =
            Arc::new(self.stages.iter().map(|_| AtomicBool::new(false)).collect());

        let mut logs = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            logs.push(StageLogs::open(&self.log_dir, &task_id, &stage.name).await?);
        }

        // Sources never take turns.
        for (index, stage) in self.stages.iter().enumerate() {
            if stage.is_source() {
                regulator.retire(index);
            }
        }

        tracing::info!("Pipeline {} starting: {}", task_id, names.join(" -> "));

        let mut handles = Vec::with_capacity(self.stages.len());
        for (index, stage) in self.stages.iter().enumerate() {
            let runner = StageRunner {
                index,
                stage: stage.clone(),
                logs: logs[index].clone(),
                ctx: StageContext {
                    task: self.task.clone(),
                    stage: index,
                    names: names.clone(),
                    counters: counters.clone(),
                },
                regulator: regulator.clone(),
                finished: finished.clone(),
                idle_interval: self.idle_interval,
            };
            handles.push(tokio::spawn(runner.run()));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (index, handle) in handles.into_iter().enumerate() {
            let exit = match handle.await {
                Ok(exit) => exit,
                Err(e) => {
                    tracing::error!("Stage {} ended abnormally: {}", names[index], e);
                    StageExit {
                        pending: self.task.pending(Some(names[index].as_str())),
                        predecessor_finished: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            reports.push(StageReport {
                name: names[index].clone(),
                count: counters.get(index),
                pending_at_exit: exit.pending,
                predecessor_finished_at_exit: exit.predecessor_finished,
                error: exit.error,
            });
        }

        for (index, stage) in self.stages.iter().enumerate() {
            let Some(cleanup) = &stage.on_cleanup else {
                continue;
            };
            let summary = StageSummary {
                name: stage.name.clone(),
                count: counters.get(index),
                logs: logs[index].clone(),
            };
            if let Err(e) = cleanup(summary).await {
                tracing::error!("Cleanup of stage {} failed: {:#}", stage.name, e);
            }
        }

        tracing::info!(
            task = %task_id,
            status = %counters.status_line(),
            "Pipeline finished"
        );

        Ok(PipelineReport {
            task_id,
            stages: reports,
        })
    }
}

struct StageExit {
    pending: usize,
    predecessor_finished: bool,
    error: Option<String>,
}

struct StageRunner {
    index: usize,
    stage: Stage,
    logs: StageLogs,
    ctx: StageContext,
    regulator: Arc<TurnRegulator>,
    finished: Arc<Vec<AtomicBool>>,
    idle_interval: Duration,
}

/// Marks the stage finished and out of the rotation however it exits.
struct FinishGuard {
    index: usize,
    regulator: Arc<TurnRegulator>,
    finished: Arc<Vec<AtomicBool>>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.finished[self.index].store(true, Ordering::SeqCst);
        self.regulator.retire(self.index);
    }
}

impl StageRunner {
    fn name(&self) -> &str {
        &self.stage.name
    }

    fn predecessor_finished(&self) -> bool {
        match self.index.checked_sub(1) {
            Some(previous) => self.finished[previous].load(Ordering::SeqCst),
            None => true,
        }
    }

    async fn run(self) -> StageExit {
        let _guard = FinishGuard {
            index: self.index,
            regulator: self.regulator.clone(),
            finished: self.finished.clone(),
        };
        tracing::info!("Stage {} started", self.name());

        if let Some(on_start) = &self.stage.on_start
            && let Err(e) = on_start(self.ctx.clone()).await
        {
            tracing::error!("Start callback of stage {} failed: {:#}", self.name(), e);
        }

        let exit = if self.stage.is_source() {
            StageExit {
                pending: self.ctx.task.pending(Some(self.name())),
                predecessor_finished: self.predecessor_finished(),
                error: None,
            }
        } else {
            self.drain_loop().await
        };

        tracing::info!(
            stage = %self.name(),
            pending = exit.pending,
            status = %self.ctx.counters.status_line(),
            "Stage completed"
        );
        exit
    }

    async fn drain_loop(&self) -> StageExit {
        loop {
            self.regulator.wait_turn(self.index).await;

            // Read before draining: once it is set every upstream fork is
            // already in the local bookkeeping.
            let predecessor_finished = self.predecessor_finished();

            let drained = match self.drain().await {
                Ok(drained) => drained,
                Err(e) => {
                    tracing::error!("Stage {} failed: {}", self.name(), e);
                    return StageExit {
                        pending: self.ctx.task.pending(Some(self.name())),
                        predecessor_finished,
                        error: Some(e.to_string()),
                    };
                }
            };

            let pending = self.ctx.task.pending(Some(self.name()));
            if drained > 0 {
                tracing::info!(
                    stage = %self.name(),
                    drained,
                    pending,
                    status = %self.ctx.counters.status_line(),
                    "Stage status"
                );
            }

            if pending == 0 && predecessor_finished {
                return StageExit {
                    pending,
                    predecessor_finished,
                    error: None,
                };
            }

            self.regulator.pass(self.index);
            tokio::time::sleep(self.idle_interval).await;
        }
    }

    /// Logs and kills every terminal sub-task of this stage, then hands the
    /// batch to the stage callback. Returns the number of records drained.
    async fn drain(&self) -> Result<usize> {
        let records = self.ctx.task.get_task(Some(self.name())).await?;
        let (ready, errors): (Vec<ProcessRecord>, Vec<ProcessRecord>) = records
            .into_iter()
            .filter(|record| record.status.is_terminal())
            .partition(|record| record.status == ProcessStatus::Ready);

        for record in &ready {
            self.logs.append_ok(record).await?;
            self.kill(record).await?;
        }
        for record in &errors {
            self.logs.append_err(record).await?;
            self.kill(record).await?;
        }

        let drained = ready.len() + errors.len();
        if drained == 0 {
            return Ok(0);
        }

        if let Some(on_batch) = &self.stage.on_batch
            && let Err(e) = on_batch(self.ctx.clone(), ready, errors).await
        {
            tracing::error!("Batch callback of stage {} failed: {:#}", self.name(), e);
        }
        self.ctx.counters.add_processed(self.index, drained as u64);

        Ok(drained)
    }

    async fn kill(&self, record: &ProcessRecord) -> Result<()> {
        match self.ctx.task.kill_sub_task(record.process_id.sub_task_id).await {
            Ok(_) => Ok(()),
            Err(e @ TaskError::ResultNotDiscarded { .. }) => {
                tracing::warn!("Stage {}: {}", self.name(), e);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!("Stage {} could not kill {}: {}", self.name(), record.process_id, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
