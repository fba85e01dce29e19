//! File-transport primitives hosted by the queue service.
//!
//! Results written through the `file` transport live at
//! `<task_dir>/<taskId>/<processId>` on the service host, which keeps large
//! payloads out of the store.

use super::types::{ProcessId, TaskId};

use std::io::{Error, ErrorKind};
use std::path::{Path, PathBuf};

pub struct FileVault {
    task_dir: PathBuf,
}

impl FileVault {
    pub fn new(task_dir: impl Into<PathBuf>) -> Self {
        Self {
            task_dir: task_dir.into(),
        }
    }

    pub fn task_dir(&self) -> &Path {
        &self.task_dir
    }

    /// Ids built in code skip `ProcessId` parsing, so they are checked again here.
    fn task_path(&self, process_id: &ProcessId) -> std::io::Result<PathBuf> {
        TaskId::validate(&process_id.task_id.0)
            .map_err(|e| Error::new(ErrorKind::InvalidInput, e))?;
        Ok(self.task_dir.join(&process_id.task_id.0))
    }

    fn file_path(&self, process_id: &ProcessId) -> std::io::Result<PathBuf> {
        Ok(self.task_path(process_id)?.join(process_id.to_string()))
    }

    pub async fn set_contents(&self, process_id: &ProcessId, contents: &[u8]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.task_path(process_id)?).await?;
        tokio::fs::write(self.file_path(process_id)?, contents).await?;
        tracing::debug!("Stored {} bytes for {}", contents.len(), process_id);
        Ok(())
    }

    /// `Ok(None)` when no file exists for the process id.
    pub async fn get_contents(&self, process_id: &ProcessId) -> std::io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.file_path(process_id)?).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Removes the file and, once empty, the per-task directory.
    /// Returns whether a file was removed.
    pub async fn delete(&self, process_id: &ProcessId) -> std::io::Result<bool> {
        let removed = match tokio::fs::remove_file(self.file_path(process_id)?).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e),
        };

        let task_path = self.task_path(process_id)?;
        if let Ok(mut entries) = tokio::fs::read_dir(&task_path).await
            && entries.next_entry().await?.is_none()
        {
            // Another writer may have raced us into the directory; ignore.
            let _ = tokio::fs::remove_dir(&task_path).await;
        }

        Ok(removed)
    }
}
