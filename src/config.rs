//! Endpoint descriptors and command-line configuration.
//!
//! Every component reaches the queue service through a `host:port:key`
//! descriptor. Descriptors are parsed eagerly so a malformed one fails at
//! startup rather than on first use.

use crate::error::TaskError;
use crate::queue::client::RetryPolicy;
use crate::transport::object::ObjectTarget;

use clap::Parser;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// `host:port:key` address of a queue service.
#[derive(Clone, PartialEq, Eq)]
pub struct QueueAddress {
    pub host: String,
    pub port: u16,
    pub key: String,
}

impl QueueAddress {
    pub fn new(host: impl Into<String>, port: u16, key: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            key: key.into(),
        }
    }

    pub fn from_socket(addr: SocketAddr, key: impl Into<String>) -> Self {
        Self::new(addr.ip().to_string(), addr.port(), key)
    }
}

impl FromStr for QueueAddress {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(host), Some(port), Some(key)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(TaskError::descriptor(s, "expected host:port:key"));
        };
        if host.is_empty() {
            return Err(TaskError::descriptor(s, "empty host"));
        }
        if key.is_empty() {
            return Err(TaskError::descriptor(s, "empty key"));
        }
        let port = port
            .parse()
            .map_err(|e| TaskError::descriptor(s, format!("bad port: {}", e)))?;
        Ok(Self::new(host, port, key))
    }
}

// The key never ends up in logs.
impl fmt::Debug for QueueAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueueAddress({}:{})", self.host, self.port)
    }
}

impl fmt::Display for QueueAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// `accessKey:secretKey:bucket` credentials for the object transport.
#[derive(Clone, PartialEq, Eq)]
pub struct ObjectCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
}

impl FromStr for ObjectCredentials {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [access, secret, bucket] if !access.is_empty() && !secret.is_empty() && !bucket.is_empty() => {
                Ok(Self {
                    access_key: access.to_string(),
                    secret_key: secret.to_string(),
                    bucket: bucket.to_string(),
                })
            }
            _ => Err(TaskError::descriptor(
                "<object credentials>",
                "expected accessKey:secretKey:bucket",
            )),
        }
    }
}

impl fmt::Debug for ObjectCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCredentials")
            .field("access_key", &self.access_key)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

/// Which result store the queue service runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSpec {
    Memory,
    /// `redis://host:port[/db]`
    Redis(String),
}

impl FromStr for StoreSpec {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("memory") {
            Ok(StoreSpec::Memory)
        } else if s.starts_with("redis://") || s.starts_with("rediss://") {
            Ok(StoreSpec::Redis(s.to_string()))
        } else {
            Err(TaskError::descriptor(s, "expected 'memory' or a redis:// url"))
        }
    }
}

/// Settings for a [`Task`](crate::task::Task) handle.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Delay between status checks while joining.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// Needed to resolve `object` transport results.
    pub object: Option<ObjectTarget>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            retry: RetryPolicy::default(),
            object: None,
        }
    }
}

/// Options of the `task-queue` binary.
#[derive(Parser, Debug)]
#[command(name = "task-queue", about = "Runs the shared queue service")]
pub struct QueueArgs {
    /// Address the service listens on.
    #[arg(long, env = "TASK_QUEUE_BIND", default_value = "127.0.0.1:5000")]
    pub bind: SocketAddr,

    /// Shared key every client must present.
    #[arg(long, env = "TASK_QUEUE_KEY")]
    pub key: String,

    /// `memory` or `redis://host:port[/db]`.
    #[arg(long, env = "TASK_QUEUE_STORE", default_value = "memory")]
    pub store: StoreSpec,

    /// Root directory of the file transport.
    #[arg(long, env = "TASK_QUEUE_DIR", default_value = "./tasks")]
    pub task_dir: PathBuf,
}

/// Options of the `task-node` binary.
#[derive(Parser, Debug)]
#[command(name = "task-node", about = "Runs a worker manager for one compute node")]
pub struct NodeArgs {
    /// Queue service as `host:port:key`.
    #[arg(long, env = "TASK_QUEUE")]
    pub queue: QueueAddress,

    /// Instance id published to the registry. Defaults to a random id.
    #[arg(long, env = "TASK_NODE_ID")]
    pub node_id: Option<String>,

    /// Maximum number of concurrent workers.
    #[arg(long, env = "TASK_NODE_CAPACITY", default_value_t = 4)]
    pub capacity: usize,

    /// Manager cycle period in milliseconds.
    #[arg(long, env = "TASK_NODE_POLL_MS", default_value_t = 1000)]
    pub poll_ms: u64,

    /// Object transport credentials as `accessKey:secretKey:bucket`.
    #[arg(long, env = "TASK_OBJECT_CREDENTIALS")]
    pub object: Option<ObjectCredentials>,

    /// Base URL of the object storage gateway.
    #[arg(long, env = "TASK_OBJECT_ENDPOINT")]
    pub object_endpoint: Option<String>,
}

impl NodeArgs {
    /// Object transport target, if one was configured.
    pub fn object_target(&self) -> Result<Option<ObjectTarget>, TaskError> {
        match (&self.object, &self.object_endpoint) {
            (Some(credentials), Some(endpoint)) => Ok(Some(ObjectTarget::http(
                endpoint.clone(),
                credentials.clone(),
            ))),
            (None, None) => Ok(None),
            (Some(_), None) => Err(TaskError::descriptor(
                "--object",
                "object credentials given without --object-endpoint",
            )),
            (None, Some(_)) => Err(TaskError::MissingCredentials("object")),
        }
    }
}
