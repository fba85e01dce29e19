use super::TransferMode;
use super::file::FileStore;
use super::object::{ObjectFile, ObjectTarget};
use crate::error::{Result, TaskError};
use crate::queue::client::QueueClient;
use crate::queue::types::{ProcessId, TransportKind};

use serde_json::Value;

/// Moves result payloads between the store record and their transport.
#[derive(Debug, Clone)]
pub struct TransportRouter {
    client: QueueClient,
    object: Option<ObjectTarget>,
}

impl TransportRouter {
    pub fn new(client: QueueClient, object: Option<ObjectTarget>) -> Self {
        Self { client, object }
    }

    /// Worker side: writes `value` through the requested transport.
    ///
    /// Returns the transport actually used and what belongs in the record's
    /// `results`. A transport that is unavailable or fails falls back to
    /// keeping the value inline in the store.
    pub async fn persist(&self, process_id: &ProcessId, kind: TransportKind, value: Value) -> (TransportKind, Value) {
        let written = match kind {
            TransportKind::Store => return (TransportKind::Store, value),
            TransportKind::File => self.write_file(process_id, &value).await,
            TransportKind::Object => self.write_object(process_id, &value).await,
        };

        match written {
            Ok(reference) => (kind, Value::String(reference)),
            Err(e) => {
                tracing::warn!(
                    "{} transport failed for {}, using the store instead: {}",
                    kind,
                    process_id,
                    e
                );
                (TransportKind::Store, value)
            }
        }
    }

    async fn write_file(&self, process_id: &ProcessId, value: &Value) -> Result<String> {
        let mut file = FileStore::open(self.client.clone(), process_id.clone(), TransferMode::Write).await?;
        file.write(&serde_json::to_vec(value)?).await?;
        let name = file.name();
        file.close(false).await?;
        Ok(name)
    }

    async fn write_object(&self, process_id: &ProcessId, value: &Value) -> Result<String> {
        let target = self
            .object
            .clone()
            .ok_or(TaskError::MissingCredentials("object"))?;
        let mut file = ObjectFile::open(target, process_id.to_string(), TransferMode::Write).await?;
        file.write(&serde_json::to_vec(value)?).await?;
        let name = file.name().to_string();
        file.close(false).await?;
        Ok(name)
    }

    /// Client side: replaces a transport reference with the payload it points to.
    ///
    /// `delete` removes the backing resource once read. Misconfiguration and
    /// missing resources are errors; there is no fallback to the store.
    pub async fn resolve(&self, kind: TransportKind, results: &Value, delete: bool) -> Result<Value> {
        let contents = match kind {
            TransportKind::Store => return Ok(results.clone()),
            TransportKind::File => {
                let reference = reference_of(kind, results)?;
                let process_id: ProcessId = reference
                    .parse()
                    .map_err(|e: String| TaskError::descriptor(reference, e))?;
                let file = FileStore::open(self.client.clone(), process_id, TransferMode::Read).await?;
                let contents = file.read().await?;
                file.close(delete).await?;
                contents
            }
            TransportKind::Object => {
                let reference = reference_of(kind, results)?;
                let target = self
                    .object
                    .clone()
                    .ok_or(TaskError::MissingCredentials("object"))?;
                let file = ObjectFile::open(target, reference, TransferMode::Read).await?;
                let contents = file.read().await?;
                file.close(delete).await?;
                contents
            }
        };

        Ok(serde_json::from_slice(&contents)?)
    }

    /// Removes the resource behind a killed sub-task. Only the file
    /// transport is cleaned up; objects outlive their records.
    pub async fn discard(&self, kind: TransportKind, process_id: &ProcessId) -> Result<bool> {
        match kind {
            TransportKind::File => self.client.delete_file(process_id).await,
            TransportKind::Store | TransportKind::Object => Ok(false),
        }
    }
}

fn reference_of(kind: TransportKind, results: &Value) -> Result<&str> {
    results.as_str().ok_or_else(|| TaskError::Transport {
        transport: kind.as_str(),
        message: format!("expected a reference, found {}", results),
    })
}
