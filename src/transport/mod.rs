//! Result Transports
//!
//! A sub-task picks at fork time where its result payload will live:
//! - **`store`**: inline in the process record (default).
//! - **`file`**: a file held by the queue service, see [`file::FileStore`].
//! - **`object`**: an object in a bucket, see [`object::ObjectFile`].
//!
//! For the last two the record's `results` only carries a reference (the
//! process id). [`TransportRouter`] writes payloads on the worker side and
//! resolves references on the client side.

pub mod file;
pub mod object;
mod router;

pub use router::TransportRouter;

/// Direction of a transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Download on open.
    Read,
    /// Upload on close.
    Write,
}
