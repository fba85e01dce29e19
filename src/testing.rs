//! Shared fixtures for the in-crate test suites.

use crate::config::{ClientConfig, QueueAddress};
use crate::queue::client::{QueueClient, RetryPolicy};
use crate::queue::files::FileVault;
use crate::queue::service::QueueService;
use crate::queue::store::MemoryStore;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;

pub const TEST_KEY: &str = "test-key";

/// A queue service bound to an ephemeral local port.
pub struct TestService {
    pub service: Arc<QueueService>,
    pub address: QueueAddress,
    pub task_dir: TempDir,
    server: tokio::task::JoinHandle<()>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestService {
    pub async fn start() -> Self {
        let task_dir = tempfile::tempdir().unwrap();
        let service = QueueService::new(
            Arc::new(MemoryStore::new()),
            FileVault::new(task_dir.path()),
        );
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (local_addr, server, shutdown) = serve(&service, bind).await.unwrap();

        Self {
            service,
            address: QueueAddress::from_socket(local_addr, TEST_KEY),
            task_dir,
            server,
            shutdown: Some(shutdown),
        }
    }

    /// Takes the endpoint down and waits until the port is released.
    /// Queue, store and files are kept.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        (&mut self.server).await.unwrap();
    }

    /// Serves the same state again on the same port.
    pub async fn resume(&mut self) {
        let bind: SocketAddr = format!("{}:{}", self.address.host, self.address.port)
            .parse()
            .unwrap();

        let mut attempt = 0;
        let (_, server, shutdown) = loop {
            match serve(&self.service, bind).await {
                Ok(bound) => break bound,
                Err(e) if attempt < 50 => {
                    attempt += 1;
                    tracing::debug!("Port {} not free yet: {}", bind, e);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => panic!("could not bind {} again: {}", bind, e),
            }
        };
        self.server = server;
        self.shutdown = Some(shutdown);
    }

    pub fn client(&self) -> QueueClient {
        QueueClient::new(&self.address).with_retry(fast_retry())
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            poll_interval: Duration::from_millis(20),
            retry: fast_retry(),
            object: None,
        }
    }
}

impl Drop for TestService {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn serve(
    service: &Arc<QueueService>,
    bind: SocketAddr,
) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>, oneshot::Sender<()>)> {
    let (tx, rx) = oneshot::channel::<()>();
    let signal = async move {
        let _ = rx.await;
    };
    let (local_addr, server) = service.clone().bind_until(bind, TEST_KEY, signal).await?;
    Ok((local_addr, server, tx))
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 2,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        request_timeout: Duration::from_secs(5),
    }
}
