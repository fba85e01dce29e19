//! Worker Pool Module Tests
//!
//! This module contains unit and integration tests for the worker pool.
//!
//! ## Test Scopes
//! - **Registry**: Verifies handler registration, lookup, and execution mechanics.
//! - **Fault Capture**: Handler errors, `step!` locations and panics.
//! - **Worker**: Full dequeue/execute/acknowledge rounds against a live service.
//! - **Manager**: Capacity-bounded draining and the stop protocol.

#[cfg(test)]
mod tests {
    use crate::node::fault::{StepFailure, describe_failure, run_isolated};
    use crate::node::manager::{Manager, ManagerConfig};
    use crate::node::registry::TaskHandlerRegistry;
    use crate::node::status::NodeStatus;
    use crate::node::worker::Worker;
    use crate::queue::types::*;
    use crate::testing::TestService;
    use crate::transport::TransportRouter;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn registry_with_defaults() -> Arc<TaskHandlerRegistry> {
        let registry = TaskHandlerRegistry::new();
        registry.register("double", |args| async move {
            let n = args.first().and_then(Value::as_i64).unwrap_or_default();
            Ok(json!(n * 2))
        });
        registry.register("parse", |args| async move {
            let raw = args.first().and_then(Value::as_str).unwrap_or_default().to_string();
            let n: i64 = crate::step!(raw.parse::<i64>());
            Ok(json!(n))
        });
        registry.register("explode", |args| async move {
            if args.is_empty() {
                panic!("boom");
            }
            Ok(Value::Null)
        });
        registry
    }

    fn worker_for(svc: &TestService, registry: Arc<TaskHandlerRegistry>) -> Worker {
        let client = svc.client();
        Worker::new(
            0,
            client.clone(),
            registry,
            TransportRouter::new(client, None),
            Arc::new(NodeStatus::new("test-node", 1)),
        )
    }

    fn record(sub: u64, handler: &str, args: Vec<Value>) -> ProcessRecord {
        ProcessRecord::waiting(
            ProcessId::new(TaskId("job".to_string()), sub),
            handler,
            args,
            None,
            TransportKind::Store,
        )
    }

    // ============================================================
    // TEST 1: TaskHandlerRegistry - Registration and Execution
    // ============================================================

    #[tokio::test]
    async fn test_registry_register_and_execute() {
        // ARRANGE: Create registry and call counter
        let registry = TaskHandlerRegistry::new();
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();

        // ACT: Register handler
        registry.register("test_handler", move |_args| {
            let count = call_count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });

        // ASSERT: Handler is registered
        assert!(registry.has_handler("test_handler"));
        assert_eq!(registry.handler_count(), 1);

        // ACT: Execute
        let result = registry.execute("test_handler", vec![json!({"test": "data"})]).await;

        // ASSERT: Handler was called
        assert!(result.is_ok());
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registry_unknown_handler_returns_error() {
        let registry = TaskHandlerRegistry::new();

        let result = registry.execute("non_existent_handler", vec![]).await;

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Unknown task handler"));
    }

    #[tokio::test]
    async fn test_registry_handler_receives_args() {
        let registry = registry_with_defaults();

        let result = registry.execute("double", vec![json!(21)]).await.unwrap();

        assert_eq!(result, json!(42));
        assert_eq!(registry.list_handlers(), vec!["double", "explode", "parse"]);
    }

    // ============================================================
    // TEST 2: Fault Capture
    // ============================================================

    #[tokio::test]
    async fn test_step_failure_records_location_and_statement() {
        let registry = registry_with_defaults();

        let payload = run_isolated(registry, "parse", vec![json!("not a number")])
            .await
            .unwrap_err();

        assert_eq!(payload.task_name, "parse");
        assert!(payload.error.contains("invalid digit"));
        assert!(payload.location.unwrap().contains("tests.rs:"));
        assert!(payload.statement.unwrap().contains("parse"));
    }

    #[tokio::test]
    async fn test_panic_becomes_error_payload() {
        let registry = registry_with_defaults();

        let payload = run_isolated(registry, "explode", vec![]).await.unwrap_err();

        assert!(payload.error.contains("boom"));
        assert_eq!(payload.task_name, "explode");
    }

    #[test]
    fn test_plain_errors_have_no_location() {
        let err = anyhow::anyhow!("disk full").context("writing output");
        let payload = describe_failure("save", &err);

        assert_eq!(payload.error, "writing output: disk full");
        assert!(payload.location.is_none());

        let step = StepFailure::new("bad", "src/x.rs:1", "f()").into_error();
        assert_eq!(describe_failure("save", &step).location.as_deref(), Some("src/x.rs:1"));
    }

    // ============================================================
    // TEST 3: Worker
    // ============================================================

    #[tokio::test]
    async fn test_worker_runs_item_to_ready() {
        // ARRANGE
        let svc = TestService::start().await;
        let client = svc.client();
        let rec = record(0, "double", vec![json!(5)]);
        client.submit(&rec).await.unwrap();

        // ACT
        let processed = worker_for(&svc, registry_with_defaults()).run().await;

        // ASSERT
        assert_eq!(processed, 1);
        let stored = client.store_get(&rec.process_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ProcessStatus::Ready);
        assert_eq!(stored.results, Some(json!(10)));
        assert!(client.pipeline_join(Some(Duration::ZERO)).await.unwrap());
    }

    #[tokio::test]
    async fn test_worker_reports_failure_as_error_status() {
        let svc = TestService::start().await;
        let client = svc.client();
        let rec = record(0, "parse", vec![json!("x")]);
        client.submit(&rec).await.unwrap();

        worker_for(&svc, registry_with_defaults()).run().await;

        let stored = client.store_get(&rec.process_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ProcessStatus::Error);
        let payload: ErrorPayload = serde_json::from_value(stored.results.unwrap()).unwrap();
        assert_eq!(payload.task_name, "parse");
        assert!(payload.statement.is_some());
    }

    #[tokio::test]
    async fn test_worker_unknown_handler_is_error_not_crash() {
        let svc = TestService::start().await;
        let client = svc.client();
        client.submit(&record(0, "missing", vec![])).await.unwrap();
        client.submit(&record(1, "double", vec![json!(1)])).await.unwrap();

        let processed = worker_for(&svc, registry_with_defaults()).run().await;

        assert_eq!(processed, 2);
        let first = client.store_get(&record(0, "", vec![]).process_id).await.unwrap().unwrap();
        assert_eq!(first.status, ProcessStatus::Error);
    }

    #[tokio::test]
    async fn test_worker_acknowledges_killed_record() {
        // ARRANGE: queued id whose record was removed
        let svc = TestService::start().await;
        let client = svc.client();
        let rec = record(0, "double", vec![json!(1)]);
        client.submit(&rec).await.unwrap();
        client.store_pop(&rec.process_id).await.unwrap();

        // ACT
        let processed = worker_for(&svc, registry_with_defaults()).run().await;

        // ASSERT
        assert_eq!(processed, 1);
        assert_eq!(client.store_len().await.unwrap(), 0);
        assert!(client.pipeline_join(Some(Duration::ZERO)).await.unwrap());
    }

    #[tokio::test]
    async fn test_worker_file_transport_keeps_payload_out_of_store() {
        let svc = TestService::start().await;
        let client = svc.client();
        let mut rec = record(0, "double", vec![json!(4)]);
        rec.transport = TransportKind::File;
        client.submit(&rec).await.unwrap();

        worker_for(&svc, registry_with_defaults()).run().await;

        let stored = client.store_get(&rec.process_id).await.unwrap().unwrap();
        assert_eq!(stored.transport, TransportKind::File);
        assert_eq!(stored.results, Some(json!("job.0")));
        assert_eq!(
            client.get_file_contents(&rec.process_id).await.unwrap(),
            Some(b"8".to_vec())
        );
    }

    #[tokio::test]
    async fn test_worker_exits_on_empty_queue() {
        let svc = TestService::start().await;
        assert_eq!(worker_for(&svc, registry_with_defaults()).run().await, 0);
    }

    // ============================================================
    // TEST 4: Manager
    // ============================================================

    #[tokio::test]
    async fn test_manager_drains_queue_within_capacity() {
        // ARRANGE: handler tracking its peak concurrency
        let svc = TestService::start().await;
        let client = svc.client();
        let registry = TaskHandlerRegistry::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        {
            let running = running.clone();
            let peak = peak.clone();
            registry.register("slow", move |_args| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            });
        }
        for sub in 0..8 {
            client.submit(&record(sub, "slow", vec![])).await.unwrap();
        }

        // ACT
        let handle = Manager::new(
            client.clone(),
            registry,
            ManagerConfig {
                node_id: "node-a".to_string(),
                capacity: 2,
                poll_interval: Duration::from_millis(20),
            },
        )
        .spawn();
        let drained = client.pipeline_join(Some(Duration::from_secs(10))).await.unwrap();
        handle.stop().await;

        // ASSERT
        assert!(drained);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        let ids: Vec<ProcessId> = (0..8).map(|sub| record(sub, "", vec![]).process_id).collect();
        for rec in client.store_get_many(&ids).await.unwrap() {
            assert_eq!(rec.unwrap().status, ProcessStatus::Ready);
        }
    }

    #[tokio::test]
    async fn test_manager_stop_publishes_zero_capacity() {
        let svc = TestService::start().await;
        let client = svc.client();
        let handle = Manager::new(
            client.clone(),
            registry_with_defaults(),
            ManagerConfig {
                node_id: "node-b".to_string(),
                capacity: 3,
                poll_interval: Duration::from_millis(20),
            },
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let running = client.list_instances().await.unwrap();
        assert_eq!(running[0].availability, 3);
        assert_eq!(running[0].status, InstanceStatus::Running);

        handle.stop().await;

        let stopped = client.list_instances().await.unwrap();
        assert_eq!(stopped[0].id, "node-b");
        assert_eq!(stopped[0].status, InstanceStatus::Stopped);
        assert_eq!(stopped[0].capacity, 0);
        assert_eq!(stopped[0].availability, 0);
    }
}
