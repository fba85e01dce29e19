//! File transport handle.
//!
//! A `FileStore` is a local temporary copy of a payload held by the queue
//! service. In read mode the remote contents are downloaded when it is
//! opened; in write mode the local contents are uploaded when it is closed.

use super::TransferMode;
use crate::error::{Result, TaskError};
use crate::queue::client::QueueClient;
use crate::queue::types::ProcessId;

use std::path::Path;
use tempfile::NamedTempFile;

pub struct FileStore {
    client: QueueClient,
    process_id: ProcessId,
    mode: TransferMode,
    local: NamedTempFile,
}

impl FileStore {
    pub async fn open(client: QueueClient, process_id: ProcessId, mode: TransferMode) -> Result<Self> {
        let local = NamedTempFile::new()?;

        if mode == TransferMode::Read {
            let contents = client.get_file_contents(&process_id).await?.ok_or_else(|| {
                TaskError::ResourceNotFound {
                    transport: "file",
                    reference: process_id.to_string(),
                }
            })?;
            tokio::fs::write(local.path(), contents).await?;
        }

        Ok(Self {
            client,
            process_id,
            mode,
            local,
        })
    }

    /// Name under which the service stores the payload.
    pub fn name(&self) -> String {
        self.process_id.to_string()
    }

    /// Path of the local temporary copy.
    pub fn path(&self) -> &Path {
        self.local.path()
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.local.path()).await?)
    }

    pub async fn write(&mut self, contents: &[u8]) -> Result<()> {
        if self.mode != TransferMode::Write {
            return Err(TaskError::Transport {
                transport: "file",
                message: format!("{} was opened read-only", self.process_id),
            });
        }
        tokio::fs::write(self.local.path(), contents).await?;
        Ok(())
    }

    /// Syncs with the service and drops the local copy.
    ///
    /// `delete` removes the remote payload of a read-mode handle.
    pub async fn close(self, delete: bool) -> Result<()> {
        match self.mode {
            TransferMode::Write => {
                let contents = tokio::fs::read(self.local.path()).await?;
                self.client
                    .set_file_contents(&self.process_id, contents)
                    .await?;
            }
            TransferMode::Read if delete => {
                if !self.client.delete_file(&self.process_id).await? {
                    tracing::debug!("File for {} was already gone", self.process_id);
                }
            }
            TransferMode::Read => {}
        }
        Ok(())
    }
}
