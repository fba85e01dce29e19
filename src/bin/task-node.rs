use clap::Parser;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use task_cluster::config::NodeArgs;
use task_cluster::node::manager::{Manager, ManagerConfig};
use task_cluster::node::registry::TaskHandlerRegistry;
use task_cluster::queue::client::QueueClient;
use task_cluster::step;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = NodeArgs::parse();
    let object_target = args.object_target()?;

    tracing::info!("Connecting to queue service at {}", args.queue);
    let client = QueueClient::new(&args.queue);
    client.reconnect().await;

    // 1. Handlers:
    let registry = builtin_handlers();
    tracing::info!("Registered handlers: {:?}", registry.list_handlers());

    // 2. Manager:
    let mut config = ManagerConfig {
        capacity: args.capacity,
        poll_interval: Duration::from_millis(args.poll_ms),
        ..ManagerConfig::default()
    };
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }
    tracing::info!("Node ID: {}", config.node_id);

    let mut manager = Manager::new(client, registry, config);
    if let Some(target) = object_target {
        tracing::info!("Object transport enabled: {:?}", target);
        manager = manager.with_object_target(target);
    }
    let handle = manager.spawn();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Stopping node, waiting for in-flight workers");
    handle.stop().await;

    Ok(())
}

/// Handlers every node ships with.
fn builtin_handlers() -> Arc<TaskHandlerRegistry> {
    let registry = TaskHandlerRegistry::new();

    registry.register("echo", |args| async move { Ok(Value::Array(args)) });

    registry.register("sum", |args| async move {
        let total: f64 = args.iter().filter_map(Value::as_f64).sum();
        Ok(json!(total))
    });

    registry.register("sleep_ms", |args| async move {
        let ms = args.first().and_then(Value::as_u64).unwrap_or(1000);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!(ms))
    });

    registry.register("word_count", |args| async move {
        let text = step!(
            args.first()
                .and_then(Value::as_str)
                .ok_or("expected a string argument")
        );
        Ok(json!(text.split_whitespace().count()))
    });

    registry
}
