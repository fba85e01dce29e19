//! Worker Pool Module
//!
//! Runs on every compute node and turns queued sub-tasks into results.
//!
//! ## Architecture Overview
//! The pool follows a **Pull-based** model driven by one [`manager::Manager`]:
//! 1. **Supervision**: Each cycle the manager reaps finished workers, works
//!    out `availability = capacity - active workers` and publishes it for the
//!    autoscaler.
//! 2. **Spawning**: It starts `min(queue size, availability)` new workers.
//! 3. **Execution**: A [`worker::Worker`] dequeues one id, marks the record
//!    `running`, runs the handler registered under the record's task name,
//!    and writes the record back as `ready` or `error` before acknowledging.
//!    An empty queue ends the worker.
//! 4. **Faults**: Handler errors and panics become structured error
//!    payloads. Lost connections to the queue service are waited out and the
//!    current item is retried (at-least-once).
//!
//! ## Submodules
//! - **`registry`**: Maps handler names to executable Rust closures.
//! - **`fault`**: Failure capture and the [`step!`](crate::step) macro.
//! - **`worker`**: The per-item execution loop.
//! - **`manager`**: The supervision loop and its stop handle.

pub mod registry;
pub mod fault;
pub mod status;
pub mod worker;
pub mod manager;

#[cfg(test)]
mod tests;
