//! Per-stage result logs.
//!
//! Every drained record is appended as one JSON line to
//! `<log_dir>/<taskId>/<stage>.ok` (ready) or `<stage>.err` (error).

use crate::error::Result;
use crate::queue::types::{ProcessRecord, TaskId};

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone)]
pub struct StageLogs {
    ok_path: PathBuf,
    err_path: PathBuf,
}

impl StageLogs {
    /// Creates the task directory and both (possibly empty) log files.
    pub async fn open(log_dir: &Path, task_id: &TaskId, stage: &str) -> Result<Self> {
        let dir = log_dir.join(&task_id.0);
        tokio::fs::create_dir_all(&dir).await?;

        let logs = Self {
            ok_path: dir.join(format!("{}.ok", stage)),
            err_path: dir.join(format!("{}.err", stage)),
        };
        for path in [&logs.ok_path, &logs.err_path] {
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
        }
        Ok(logs)
    }

    pub fn ok_path(&self) -> &Path {
        &self.ok_path
    }

    pub fn err_path(&self) -> &Path {
        &self.err_path
    }

    pub async fn append_ok(&self, record: &ProcessRecord) -> Result<()> {
        append(&self.ok_path, record).await
    }

    pub async fn append_err(&self, record: &ProcessRecord) -> Result<()> {
        append(&self.err_path, record).await
    }

    pub async fn read_ok(&self) -> Result<Vec<ProcessRecord>> {
        read(&self.ok_path).await
    }

    pub async fn read_err(&self) -> Result<Vec<ProcessRecord>> {
        read(&self.err_path).await
    }
}

async fn append(path: &Path, record: &ProcessRecord) -> Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}

async fn read(path: &Path) -> Result<Vec<ProcessRecord>> {
    let contents = tokio::fs::read_to_string(path).await?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(Into::into))
        .collect()
}
