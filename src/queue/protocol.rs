//! Queue Service Network Protocol
//!
//! Defines the API endpoints and Data Transfer Objects (DTOs) exchanged between
//! the queue service and its clients (task handles, workers, managers).
//!
//! Every request must carry the shared key in the [`AUTH_HEADER`] header.

use super::types::*;
use serde::{Deserialize, Serialize};

/// Header carrying the shared authentication key.
pub const AUTH_HEADER: &str = "x-queue-key";

// --- API Endpoints ---

pub const ENDPOINT_HEALTH: &str = "/health";
pub const ENDPOINT_STATS: &str = "/stats";

/// Atomic store-insert + enqueue of a freshly forked record.
pub const ENDPOINT_SUBMIT: &str = "/pipeline/submit";
/// Non-blocking dequeue of the next process id.
pub const ENDPOINT_DEQUEUE: &str = "/pipeline/dequeue";
/// Completion acknowledgment for a dequeued id.
pub const ENDPOINT_TASK_DONE: &str = "/pipeline/task_done";
/// Long-poll until every queued item has been acknowledged.
pub const ENDPOINT_PIPELINE_JOIN: &str = "/pipeline/join";

pub const ENDPOINT_STORE_UPDATE: &str = "/store/update";
pub const ENDPOINT_STORE_GET: &str = "/store/get";
pub const ENDPOINT_STORE_GET_MANY: &str = "/store/get_many";
pub const ENDPOINT_STORE_POP: &str = "/store/pop";
pub const ENDPOINT_STORE_LEN: &str = "/store/len";

/// `PUT`/`GET`/`DELETE` on `/files/:process_id`.
pub const ENDPOINT_FILES: &str = "/files";

pub const ENDPOINT_INSTANCES: &str = "/instances";

// --- Data Transfer Objects ---

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub record: ProcessRecord,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// False when the process id was already present (retried submit).
    pub queued: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DequeueResponse {
    /// `None` when the queue is empty at this instant.
    pub process_id: Option<ProcessId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineJoinRequest {
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineJoinResponse {
    /// True when every queued item has been acknowledged.
    pub drained: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreUpdateRequest {
    pub entries: Vec<ProcessRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreKeyRequest {
    pub process_id: ProcessId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreGetManyRequest {
    pub process_ids: Vec<ProcessId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreRecordResponse {
    pub record: Option<ProcessRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreRecordsResponse {
    /// Same order as the request; `None` for absent keys.
    pub records: Vec<Option<ProcessRecord>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreLenResponse {
    pub len: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstancesResponse {
    pub instances: Vec<InstanceRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub queue_size: usize,
    pub unfinished: usize,
    pub store_len: usize,
    pub instances: Vec<InstanceRecord>,
}

/// Body returned with every non-2xx status.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
