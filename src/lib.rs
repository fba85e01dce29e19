//! Distributed Task Cluster Library
//!
//! This library crate defines the core modules of the task cluster.
//! It serves as the foundation for the binary executables (`task-queue`
//! and `task-node`).
//!
//! ## Architecture Modules
//! The system is composed of four loosely coupled subsystems:
//!
//! - **`queue`**: The Queue Service. A passive rendezvous point holding the FIFO
//!   work pipeline, the pluggable result store, the file-transport primitives and
//!   the instance registry, reachable over an authenticated HTTP endpoint.
//! - **`task`**: The Task Protocol. A client handle that forks sub-tasks, reads
//!   and joins their results, and kills them once consumed.
//! - **`node`**: The Worker Pool. A per-node Manager spawning capacity-bounded
//!   Workers that execute registered handlers by name.
//! - **`orchestrator`**: Staged pipelines built on top of a Task, with ordered
//!   turn-taking between stages.
//!
//! Supporting modules: **`transport`** (where result payloads live),
//! **`config`** (endpoint descriptors and CLI options) and **`error`**.

pub mod config;
pub mod error;
pub mod node;
pub mod orchestrator;
pub mod queue;
pub mod task;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
