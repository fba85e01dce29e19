//! Queue Service RPC client.
//!
//! Every capability of the service is a typed method here; there is no
//! attribute-style proxy. Transport-level failures (refused connections,
//! timeouts) are retried with exponential backoff and jitter, then surface as
//! [`TaskError::Connection`] so long-running loops can [`QueueClient::reconnect`].

use super::protocol::*;
use super::types::*;
use crate::config::QueueAddress;
use crate::error::{Result, TaskError};

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(150),
            max_delay: Duration::from_millis(1200),
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueClient {
    base_url: String,
    key: String,
    http_client: reqwest::Client,
    retry: RetryPolicy,
}

impl QueueClient {
    /// Creates a client without touching the network.
    pub fn new(address: &QueueAddress) -> Self {
        Self {
            base_url: format!("http://{}:{}", address.host, address.port),
            key: address.key.clone(),
            http_client: reqwest::Client::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Creates a client and checks that the service answers.
    pub async fn connect(address: &QueueAddress) -> Result<Self> {
        let client = Self::new(address);
        client.health().await?;
        tracing::debug!("Connected to queue service at {}", client.base_url);
        Ok(client)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Blocks until the service answers a health probe again.
    pub async fn reconnect(&self) {
        let mut delay_ms = self.retry.base_delay.as_millis() as u64;
        let max_delay_ms = self.retry.max_delay.as_millis() as u64;

        loop {
            match self.health().await {
                Ok(()) => {
                    tracing::info!("Reconnected to queue service at {}", self.base_url);
                    return;
                }
                Err(e) => {
                    tracing::warn!("Queue service still unreachable: {}", e);
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(max_delay_ms);
                }
            }
        }
    }

    /// Runs `op` until it stops failing with a connection fault, waiting for
    /// the service to come back in between. Other errors are returned as is.
    pub async fn persistent<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            match op().await {
                Err(e) if e.is_connection() => {
                    tracing::warn!("{} lost the queue service: {}", what, e);
                    self.reconnect().await;
                }
                other => return other,
            }
        }
    }

    // --- Pipeline ---

    /// Stores the record and enqueues its id in one step.
    pub async fn submit(&self, record: &ProcessRecord) -> Result<bool> {
        let payload = SubmitRequest {
            record: record.clone(),
        };
        let response = self
            .send(Method::POST, ENDPOINT_SUBMIT, None, |rb| rb.json(&payload))
            .await?;
        Ok(decode::<SubmitResponse>(response).await?.queued)
    }

    /// Non-blocking dequeue.
    pub async fn dequeue(&self) -> Result<Option<ProcessId>> {
        let response = self.send(Method::POST, ENDPOINT_DEQUEUE, None, |rb| rb).await?;
        Ok(decode::<DequeueResponse>(response).await?.process_id)
    }

    pub async fn task_done(&self) -> Result<()> {
        self.send(Method::POST, ENDPOINT_TASK_DONE, None, |rb| rb)
            .await?;
        Ok(())
    }

    /// Waits until every queued item has been acknowledged.
    pub async fn pipeline_join(&self, timeout: Option<Duration>) -> Result<bool> {
        let payload = PipelineJoinRequest {
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
        };
        // The long-poll must outlive the server-side wait.
        let request_timeout = timeout
            .map(|t| t + self.retry.request_timeout)
            .unwrap_or(Duration::from_secs(24 * 60 * 60));
        let response = self
            .send(
                Method::POST,
                ENDPOINT_PIPELINE_JOIN,
                Some(request_timeout),
                |rb| rb.json(&payload),
            )
            .await?;
        Ok(decode::<PipelineJoinResponse>(response).await?.drained)
    }

    // --- Store ---

    pub async fn store_update(&self, entries: Vec<ProcessRecord>) -> Result<()> {
        let payload = StoreUpdateRequest { entries };
        self.send(Method::POST, ENDPOINT_STORE_UPDATE, None, |rb| {
            rb.json(&payload)
        })
        .await?;
        Ok(())
    }

    pub async fn store_get(&self, process_id: &ProcessId) -> Result<Option<ProcessRecord>> {
        let payload = StoreKeyRequest {
            process_id: process_id.clone(),
        };
        let response = self
            .send(Method::POST, ENDPOINT_STORE_GET, None, |rb| rb.json(&payload))
            .await?;
        Ok(decode::<StoreRecordResponse>(response).await?.record)
    }

    pub async fn store_get_many(
        &self,
        process_ids: &[ProcessId],
    ) -> Result<Vec<Option<ProcessRecord>>> {
        if process_ids.is_empty() {
            return Ok(Vec::new());
        }
        let payload = StoreGetManyRequest {
            process_ids: process_ids.to_vec(),
        };
        let response = self
            .send(Method::POST, ENDPOINT_STORE_GET_MANY, None, |rb| {
                rb.json(&payload)
            })
            .await?;
        Ok(decode::<StoreRecordsResponse>(response).await?.records)
    }

    pub async fn store_pop(&self, process_id: &ProcessId) -> Result<Option<ProcessRecord>> {
        let payload = StoreKeyRequest {
            process_id: process_id.clone(),
        };
        let response = self
            .send(Method::POST, ENDPOINT_STORE_POP, None, |rb| rb.json(&payload))
            .await?;
        Ok(decode::<StoreRecordResponse>(response).await?.record)
    }

    pub async fn store_len(&self) -> Result<usize> {
        let response = self.send(Method::GET, ENDPOINT_STORE_LEN, None, |rb| rb).await?;
        Ok(decode::<StoreLenResponse>(response).await?.len)
    }

    // --- Files ---

    pub async fn set_file_contents(&self, process_id: &ProcessId, contents: Vec<u8>) -> Result<()> {
        let path = format!("{}/{}", ENDPOINT_FILES, process_id);
        self.send(Method::PUT, &path, None, |rb| rb.body(contents.clone()))
            .await?;
        Ok(())
    }

    /// `Ok(None)` when the service holds no file for the id.
    pub async fn get_file_contents(&self, process_id: &ProcessId) -> Result<Option<Vec<u8>>> {
        let path = format!("{}/{}", ENDPOINT_FILES, process_id);
        match self.send(Method::GET, &path, None, |rb| rb).await {
            Ok(response) => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| TaskError::Connection(e.to_string()))?;
                Ok(Some(bytes.to_vec()))
            }
            Err(TaskError::Service { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns whether a file was deleted.
    pub async fn delete_file(&self, process_id: &ProcessId) -> Result<bool> {
        let path = format!("{}/{}", ENDPOINT_FILES, process_id);
        match self.send(Method::DELETE, &path, None, |rb| rb).await {
            Ok(_) => Ok(true),
            Err(TaskError::Service { status: 404, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // --- Instances ---

    pub async fn publish_instance(&self, record: &InstanceRecord) -> Result<()> {
        self.send(Method::POST, ENDPOINT_INSTANCES, None, |rb| rb.json(record))
            .await?;
        Ok(())
    }

    pub async fn list_instances(&self) -> Result<Vec<InstanceRecord>> {
        let response = self.send(Method::GET, ENDPOINT_INSTANCES, None, |rb| rb).await?;
        Ok(decode::<InstancesResponse>(response).await?.instances)
    }

    pub async fn stats(&self) -> Result<StatsResponse> {
        let response = self.send(Method::GET, ENDPOINT_STATS, None, |rb| rb).await?;
        decode(response).await
    }

    pub async fn health(&self) -> Result<()> {
        self.send(Method::GET, ENDPOINT_HEALTH, None, |rb| rb).await?;
        Ok(())
    }

    // --- HTTP Helpers with Backoff ---

    async fn send<F>(
        &self,
        method: Method,
        path: &str,
        timeout: Option<Duration>,
        build: F,
    ) -> Result<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let url = format!("{}{}", self.base_url, path);
        let timeout = timeout.unwrap_or(self.retry.request_timeout);
        let attempts = self.retry.attempts.max(1);
        let mut delay_ms = self.retry.base_delay.as_millis() as u64;
        let max_delay_ms = self.retry.max_delay.as_millis() as u64;

        for attempt in 0..attempts {
            let request = self
                .http_client
                .request(method.clone(), &url)
                .header(AUTH_HEADER, &self.key)
                .timeout(timeout);

            match build(request).send().await {
                Ok(response) => return check_status(response).await,
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(TaskError::Connection(format!("{} {}: {}", method, path, e)));
                    }
                    tracing::debug!("{} {} failed (attempt {}): {}", method, path, attempt + 1, e);
                    // Simple jitter to prevent thundering herd
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(max_delay_ms);
                }
            }
        }

        Err(TaskError::Connection("Retry attempts exhausted".to_string()))
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(TaskError::Unauthorized);
    }

    let message = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    Err(TaskError::Service {
        status: status.as_u16(),
        message,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status().as_u16();
    response.json::<T>().await.map_err(|e| TaskError::Service {
        status,
        message: format!("malformed response: {}", e),
    })
}
