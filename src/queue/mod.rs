//! Queue Service Module
//!
//! The shared rendezvous point of the cluster. Task handles submit work here,
//! workers pull it from here, and results are written back here.
//!
//! ## Architecture Overview
//! 1. **Submission**: A client stores a `waiting` process record and enqueues
//!    its id in one call, so a sub-task is either fully queued or not visible.
//! 2. **Dequeue**: Workers take ids off the FIFO pipeline without blocking. An
//!    empty pipeline tells a worker there is nothing left to do right now.
//! 3. **Acknowledgment**: Every dequeued id is acknowledged with `task_done`
//!    once its record is written back; `pipeline_join` waits on those acks.
//! 4. **Results**: Records live in a pluggable [`store::ResultStore`]. Large
//!    payloads can bypass it through the file vault.
//!
//! ## Submodules
//! - **`types`**: Process ids, records, status machine, instance records.
//! - **`protocol`**: HTTP endpoint paths and request/response DTOs.
//! - **`pipeline`**: FIFO queue with completion acknowledgment.
//! - **`store`**: The `ResultStore` trait and its memory/redis backends.
//! - **`files`**: Per-task directory of file-transport payloads.
//! - **`service`**: `QueueService`, which ties the above together.
//! - **`handlers`**: axum router and handlers, shared-key middleware.
//! - **`client`**: Typed `reqwest` client used by tasks and workers.

pub mod types;
pub mod protocol;
pub mod pipeline;
pub mod store;
pub mod files;
pub mod service;
pub mod handlers;
pub mod client;
