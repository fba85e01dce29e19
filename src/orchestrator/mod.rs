//! Pipeline Orchestrator Module
//!
//! Chains several rounds of distributed work into a pipeline of named
//! stages on top of one [`Task`](crate::task::Task).
//!
//! ## Architecture Overview
//! 1. **Composition**: Stages are declared through
//!    [`StagedTask::builder`]; the order of the `.stage(..)` calls is the
//!    pipeline order and cannot change once `build()` returns.
//! 2. **Tagging**: Every stage owns the tag equal to its name. Forking from
//!    a [`StageContext`] tags the new sub-task with the *next* stage, which
//!    is how results flow downstream.
//! 3. **Turn taking**: A [`TurnRegulator`] circulates a single token in
//!    declared order. Only the holder drains its finished sub-tasks
//!    (logging them to `<stage>.ok` / `<stage>.err` and killing them) and
//!    runs its batch callback.
//! 4. **Termination**: A stage exits once nothing tagged with it is pending
//!    and its predecessor has already exited. Cleanup callbacks then run in
//!    declaration order.
//!
//! ## Submodules
//! - **`stage`**: Stage descriptors, callback types and the stage context.
//! - **`regulator`**: The token-passing turn regulator.
//! - **`logs`**: Append-only per-stage result logs.
//! - **`staged`**: The builder, the per-stage loop and the run report.

pub mod logs;
pub mod regulator;
pub mod stage;
pub mod staged;

pub use logs::StageLogs;
pub use regulator::TurnRegulator;
pub use stage::{Stage, StageContext, StageCount, StageSummary};
pub use staged::{PipelineReport, StageReport, StagedTask, StagedTaskBuilder};
