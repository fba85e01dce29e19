//! Object storage transport.
//!
//! Payloads live in a bucket under key = process id. The storage itself sits
//! behind [`ObjectBackend`]; [`HttpObjectBackend`] talks to an HTTP object
//! gateway (`PUT/GET/DELETE {endpoint}/{bucket}/{key}` with basic auth) and
//! [`MemoryObjectBackend`] keeps everything in process.

use super::TransferMode;
use crate::config::ObjectCredentials;
use crate::error::{Result, TaskError};

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::StatusCode;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;

#[async_trait]
pub trait ObjectBackend: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()>;

    /// `Ok(None)` when the object does not exist.
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Returns whether an object was removed.
    async fn delete(&self, bucket: &str, key: &str) -> Result<bool>;
}

/// A backend bound to one bucket.
#[derive(Clone)]
pub struct ObjectTarget {
    pub backend: Arc<dyn ObjectBackend>,
    pub bucket: String,
}

impl ObjectTarget {
    pub fn new(backend: Arc<dyn ObjectBackend>, bucket: impl Into<String>) -> Self {
        Self {
            backend,
            bucket: bucket.into(),
        }
    }

    pub fn http(endpoint: impl Into<String>, credentials: ObjectCredentials) -> Self {
        let bucket = credentials.bucket.clone();
        Self::new(
            Arc::new(HttpObjectBackend::new(endpoint, credentials)),
            bucket,
        )
    }
}

impl fmt::Debug for ObjectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectTarget")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

/// Local temporary copy of one object, same contract as
/// [`FileStore`](super::file::FileStore).
pub struct ObjectFile {
    target: ObjectTarget,
    key: String,
    mode: TransferMode,
    local: NamedTempFile,
}

impl ObjectFile {
    pub async fn open(target: ObjectTarget, key: impl Into<String>, mode: TransferMode) -> Result<Self> {
        let key = key.into();
        let local = NamedTempFile::new()?;

        if mode == TransferMode::Read {
            let contents = target
                .backend
                .get(&target.bucket, &key)
                .await?
                .ok_or_else(|| TaskError::ResourceNotFound {
                    transport: "object",
                    reference: format!("{}/{}", target.bucket, key),
                })?;
            tokio::fs::write(local.path(), contents).await?;
        }

        Ok(Self {
            target,
            key,
            mode,
            local,
        })
    }

    pub fn name(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        self.local.path()
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.local.path()).await?)
    }

    pub async fn write(&mut self, contents: &[u8]) -> Result<()> {
        if self.mode != TransferMode::Write {
            return Err(TaskError::Transport {
                transport: "object",
                message: format!("{} was opened read-only", self.key),
            });
        }
        tokio::fs::write(self.local.path(), contents).await?;
        Ok(())
    }

    pub async fn close(self, delete: bool) -> Result<()> {
        match self.mode {
            TransferMode::Write => {
                let contents = tokio::fs::read(self.local.path()).await?;
                self.target
                    .backend
                    .put(&self.target.bucket, &self.key, contents)
                    .await?;
            }
            TransferMode::Read if delete => {
                self.target
                    .backend
                    .delete(&self.target.bucket, &self.key)
                    .await?;
            }
            TransferMode::Read => {}
        }
        Ok(())
    }
}

/// Client for an HTTP object gateway.
pub struct HttpObjectBackend {
    endpoint: String,
    credentials: ObjectCredentials,
    http_client: reqwest::Client,
}

impl HttpObjectBackend {
    pub fn new(endpoint: impl Into<String>, credentials: ObjectCredentials) -> Self {
        let endpoint: String = endpoint.into();
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            credentials,
            http_client: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, bucket: &str, key: &str) -> reqwest::RequestBuilder {
        self.http_client
            .request(method, format!("{}/{}/{}", self.endpoint, bucket, key))
            .basic_auth(&self.credentials.access_key, Some(&self.credentials.secret_key))
    }
}

fn object_error(e: impl fmt::Display) -> TaskError {
    TaskError::Transport {
        transport: "object",
        message: e.to_string(),
    }
}

#[async_trait]
impl ObjectBackend for HttpObjectBackend {
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        self.request(reqwest::Method::PUT, bucket, key)
            .body(body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(object_error)?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .request(reqwest::Method::GET, bucket, key)
            .send()
            .await
            .map_err(object_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = response
            .error_for_status()
            .map_err(object_error)?
            .bytes()
            .await
            .map_err(object_error)?;
        Ok(Some(bytes.to_vec()))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
        let response = self
            .request(reqwest::Method::DELETE, bucket, key)
            .send()
            .await
            .map_err(object_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        response.error_for_status().map_err(object_error)?;
        Ok(true)
    }
}

/// In-process backend, used for local runs and tests.
#[derive(Default)]
pub struct MemoryObjectBackend {
    objects: DashMap<(String, String), Vec<u8>>,
}

impl MemoryObjectBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectBackend for MemoryObjectBackend {
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        self.objects
            .insert((bucket.to_string(), key.to_string()), body);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self
            .objects
            .remove(&(bucket.to_string(), key.to_string()))
            .is_some())
    }
}
