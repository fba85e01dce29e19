use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Identifier of one logical job.
///
/// All sub-tasks forked through the same handle share it. The service uses it
/// as a directory name for file-transport results, so ids that could escape
/// that directory are rejected when a [`ProcessId`] is parsed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generates a new random UUID v4-based TaskId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Checks that the id is safe to use as a single path segment.
    pub fn validate(raw: &str) -> Result<(), String> {
        if raw.is_empty() {
            return Err("empty task id".to_string());
        }
        if raw == "." || raw == ".." {
            return Err(format!("reserved task id: {}", raw));
        }
        if raw.contains(['/', '\\', '\0']) {
            return Err(format!("task id contains a path separator: {:?}", raw));
        }
        Ok(())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type SubTaskId = u64;

/// Composite key `<taskId>.<subTaskId>` of one queued unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId {
    pub task_id: TaskId,
    pub sub_task_id: SubTaskId,
}

impl ProcessId {
    pub fn new(task_id: TaskId, sub_task_id: SubTaskId) -> Self {
        Self {
            task_id,
            sub_task_id,
        }
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.task_id.0, self.sub_task_id)
    }
}

impl FromStr for ProcessId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (task_id, sub_task_id) = s
            .rsplit_once('.')
            .ok_or_else(|| format!("invalid process id (missing '.'): {}", s))?;
        TaskId::validate(task_id).map_err(|e| format!("invalid process id ({}): {}", e, s))?;
        let sub_task_id = sub_task_id
            .parse()
            .map_err(|e| format!("invalid sub task id in {}: {}", s, e))?;
        Ok(Self::new(TaskId(task_id.to_string()), sub_task_id))
    }
}

impl Serialize for ProcessId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProcessId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Lifecycle state of a process record.
///
/// Transitions only move forward: `Waiting -> Running -> {Ready | Error}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// Forked and queued, no worker has claimed it yet.
    Waiting,
    /// A worker is executing it.
    Running,
    /// Finished, `results` holds the payload (or a transport reference).
    Ready,
    /// The handler failed, `results` holds an [`ErrorPayload`].
    Error,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessStatus::Ready | ProcessStatus::Error)
    }

    /// Whether a record currently in `self` may be rewritten with `next`.
    /// Rewriting the same status is allowed so retried writes stay idempotent.
    pub fn can_advance_to(&self, next: ProcessStatus) -> bool {
        use ProcessStatus::*;
        matches!(
            (self, next),
            (Waiting, Waiting)
                | (Waiting, Running)
                | (Running, Running)
                | (Running, Ready)
                | (Running, Error)
                | (Ready, Ready)
                | (Error, Error)
        )
    }
}

/// Where the result payload of a sub-task lives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Inline in the store record.
    #[default]
    Store,
    /// A file held by the queue service, keyed by process id.
    File,
    /// An object in external object storage, keyed by process id.
    #[serde(alias = "s3")]
    Object,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Store => "store",
            TransportKind::File => "file",
            TransportKind::Object => "object",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The record stored under a [`ProcessId`] in the queue service store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub process_id: ProcessId,
    /// Name of the handler registered on the worker nodes.
    pub task_name: String,
    pub task_args: Vec<serde_json::Value>,
    /// Grouping key for batch join/kill. Defaults to the process id.
    pub tag: String,
    pub status: ProcessStatus,
    pub results: Option<serde_json::Value>,
    pub transport: TransportKind,
}

impl ProcessRecord {
    pub fn waiting(
        process_id: ProcessId,
        task_name: impl Into<String>,
        task_args: Vec<serde_json::Value>,
        tag: Option<String>,
        transport: TransportKind,
    ) -> Self {
        let tag = tag.unwrap_or_else(|| process_id.to_string());
        Self {
            process_id,
            task_name: task_name.into(),
            task_args,
            tag,
            status: ProcessStatus::Waiting,
            results: None,
            transport,
        }
    }
}

/// Structured payload stored as `results` when a handler fails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error: String,
    pub task_name: String,
    /// `file:line` of the failing step, when known.
    pub location: Option<String>,
    /// Source text of the failing statement, when known.
    pub statement: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Running,
    Stopped,
}

/// Availability report of one compute node, read by the autoscaler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: String,
    pub status: InstanceStatus,
    pub capacity: usize,
    pub availability: usize,
    /// Timestamp (ms) of the last task a worker on this node picked up.
    #[serde(rename = "lastTaskTimestamp", alias = "lastTask")]
    pub last_task: Option<u64>,
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
