//! Error taxonomy shared by the queue client, the task protocol, the worker
//! pool and the orchestrator.
//!
//! Connectivity faults are recovered by the long-running loops (workers,
//! managers, join polling). Everything else is raised to the caller.

use crate::queue::types::{ProcessId, ProcessStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    /// The queue service could not be reached after all retry attempts.
    #[error("queue service unreachable: {0}")]
    Connection(String),

    #[error("queue service rejected the shared key")]
    Unauthorized,

    /// `kill` found no record in the store.
    #[error("could not find task store: {process_id}")]
    StoreRecordMissing { process_id: ProcessId },

    /// `kill` found no entry in the local sub-task bookkeeping.
    #[error("unknown subtask: {process_id}")]
    UnknownSubTask { process_id: ProcessId },

    /// A file or object reference that no longer exists.
    #[error("{transport} transport resource not found: {reference}")]
    ResourceNotFound {
        transport: &'static str,
        reference: String,
    },

    /// `kill` removed the record but the transported result outlived it.
    #[error("killed {process_id} but could not delete its result: {message}")]
    ResultNotDiscarded {
        process_id: ProcessId,
        message: String,
    },

    #[error("missing credentials for {0} transport")]
    MissingCredentials(&'static str),

    #[error("invalid descriptor '{descriptor}': {reason}")]
    InvalidDescriptor { descriptor: String, reason: String },

    #[error("invalid status transition for {process_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        process_id: ProcessId,
        from: ProcessStatus,
        to: ProcessStatus,
    },

    #[error("stage '{0}' has no next stage to fork onto")]
    NoNextStage(String),

    #[error("{transport} transport error: {message}")]
    Transport {
        transport: &'static str,
        message: String,
    },

    #[error("queue service error ({status}): {message}")]
    Service { status: u16, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskError {
    pub fn is_connection(&self) -> bool {
        matches!(self, TaskError::Connection(_))
    }

    /// True for every "the thing you asked about does not exist" condition.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TaskError::StoreRecordMissing { .. }
                | TaskError::UnknownSubTask { .. }
                | TaskError::ResourceNotFound { .. }
        )
    }

    pub(crate) fn descriptor(descriptor: &str, reason: impl Into<String>) -> Self {
        TaskError::InvalidDescriptor {
            descriptor: descriptor.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
