use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use task_cluster::config::{QueueArgs, StoreSpec};
use task_cluster::queue::files::FileVault;
use task_cluster::queue::service::QueueService;
use task_cluster::queue::store::{MemoryStore, ResultStore};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = QueueArgs::parse();

    tracing::info!("Starting queue service on {}", args.bind);
    tracing::info!("File transport directory: {}", args.task_dir.display());

    // 1. Result store:
    let store: Arc<dyn ResultStore> = match &args.store {
        StoreSpec::Memory => {
            tracing::info!("Using in-memory result store");
            Arc::new(MemoryStore::new())
        }
        StoreSpec::Redis(url) => open_redis(url).await?,
    };

    // 2. Service:
    tokio::fs::create_dir_all(&args.task_dir).await?;
    let service = QueueService::new(store, FileVault::new(args.task_dir.clone()));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Could not listen for ctrl-c, serving until killed: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutting down queue service");
    };
    let (local_addr, server) = service
        .clone()
        .bind_until(args.bind, &args.key, shutdown)
        .await?;
    tracing::info!("Queue service ready on {}", local_addr);

    // 3. Spawn stats reporter:
    let stats_service = service.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));

        loop {
            interval.tick().await;
            match stats_service.stats().await {
                Ok(stats) => tracing::info!(
                    queue = stats.queue_size,
                    unfinished = stats.unfinished,
                    store = stats.store_len,
                    instances = stats.instances.len(),
                    "Queue stats"
                ),
                Err(e) => tracing::warn!("Could not read queue stats: {}", e),
            }
        }
    });

    if let Err(e) = server.await {
        tracing::error!("Server task ended abnormally: {}", e);
    }

    Ok(())
}

#[cfg(feature = "redis")]
async fn open_redis(url: &str) -> anyhow::Result<Arc<dyn ResultStore>> {
    let store = task_cluster::queue::store::RedisStore::connect(url).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn open_redis(url: &str) -> anyhow::Result<Arc<dyn ResultStore>> {
    anyhow::bail!("store {} requires building with the `redis` feature", url)
}
