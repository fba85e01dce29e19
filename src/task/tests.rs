//! Task Protocol Tests
//!
//! ## Test Scopes
//! - **Fork / Get**: Records appear `waiting`, tags group sub-tasks.
//! - **Join**: Timeout semantics, including the single-check zero timeout.
//! - **Kill**: Store removal, the two not-found failures, file cleanup.
//! - **End-to-end**: A capacity-bounded worker pool drains a tagged batch.
//! - **Outage**: Workers, managers and joins ride out a service restart.

#[cfg(test)]
mod tests {
    use crate::error::TaskError;
    use crate::node::manager::{Manager, ManagerConfig, ManagerHandle};
    use crate::node::registry::TaskHandlerRegistry;
    use crate::queue::types::*;
    use crate::task::Task;
    use crate::testing::TestService;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;

    fn task_for(svc: &TestService) -> Task {
        Task::with_client(svc.client(), svc.client_config())
    }

    fn registry() -> Arc<TaskHandlerRegistry> {
        let registry = TaskHandlerRegistry::new();
        registry.register("square", |args| async move {
            let n = args.first().and_then(Value::as_i64).unwrap_or_default();
            Ok(json!(n * n))
        });
        registry.register("fail", |_args| async move {
            Err(anyhow::anyhow!("Intentional error"))
        });
        registry
    }

    fn start_pool(svc: &TestService, capacity: usize) -> ManagerHandle {
        Manager::new(
            svc.client(),
            registry(),
            ManagerConfig {
                node_id: format!("pool-{}", capacity),
                capacity,
                poll_interval: Duration::from_millis(20),
            },
        )
        .spawn()
    }

    // ============================================================
    // TEST 1: fork / get_sub_task / get_task
    // ============================================================

    #[tokio::test]
    async fn test_fork_is_waiting_before_any_worker() {
        // ARRANGE
        let svc = TestService::start().await;
        let task = task_for(&svc);

        // ACT
        let id = task
            .fork("square", vec![json!(3)], None, TransportKind::Store)
            .await
            .unwrap();
        let record = task.get_sub_task(id).await.unwrap();

        // ASSERT
        assert_eq!(id, 0);
        assert_eq!(record.status, ProcessStatus::Waiting);
        assert_eq!(record.tag, task.process_id(id).to_string());
        assert_eq!(task.last_sub_task_id(), Some(0));
        assert!(task.forked_at(id).is_some());
        assert_eq!(svc.service.queue_size(), 1);
    }

    #[tokio::test]
    async fn test_sub_task_ids_increase_monotonically() {
        let svc = TestService::start().await;
        let task = task_for(&svc);

        let mut ids = Vec::new();
        for n in 0..3 {
            ids.push(
                task.fork("square", vec![json!(n)], None, TransportKind::Store)
                    .await
                    .unwrap(),
            );
        }

        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(task.sub_task_ids(None), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_get_task_filters_by_tag() {
        let svc = TestService::start().await;
        let task = task_for(&svc);
        for n in 0..5 {
            let tag = if n % 2 == 0 { "even" } else { "odd" };
            task.fork("square", vec![json!(n)], Some(tag), TransportKind::Store)
                .await
                .unwrap();
        }

        let even = task.get_task(Some("even")).await.unwrap();
        let odd = task.get_task(Some("odd")).await.unwrap();
        let all = task.get_task(None).await.unwrap();

        assert_eq!(even.len(), 3);
        assert!(even.iter().all(|r| r.tag == "even"));
        assert_eq!(odd.len(), 2);
        assert_eq!(all.len(), 5);
        assert!(task.get_task(Some("none")).await.unwrap().is_empty());

        let statuses = task.get_task_field("status", Some("odd")).await.unwrap();
        assert_eq!(statuses, vec![json!("waiting"), json!("waiting")]);
    }

    #[tokio::test]
    async fn test_get_unknown_sub_task() {
        let svc = TestService::start().await;
        let task = task_for(&svc);

        let err = task.get_sub_task(7).await.unwrap_err();

        assert!(matches!(err, TaskError::UnknownSubTask { .. }));
    }

    // ============================================================
    // TEST 2: join
    // ============================================================

    #[tokio::test]
    async fn test_join_with_zero_timeout_checks_once() {
        let svc = TestService::start().await;
        let task = task_for(&svc);
        let id = task
            .fork("square", vec![json!(2)], None, TransportKind::Store)
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let status = task.join_sub_task(id, Some(Duration::ZERO)).await.unwrap();

        assert_eq!(status, Some(ProcessStatus::Waiting));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_join_times_out_with_last_status() {
        let svc = TestService::start().await;
        let task = task_for(&svc);
        task.fork("square", vec![json!(2)], Some("t"), TransportKind::Store)
            .await
            .unwrap();
        task.fork("square", vec![json!(3)], Some("t"), TransportKind::Store)
            .await
            .unwrap();

        let statuses = task
            .join_task(Some(Duration::from_millis(80)), Some("t"))
            .await
            .unwrap();

        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|(_, s)| *s == Some(ProcessStatus::Waiting)));
    }

    #[tokio::test]
    async fn test_join_then_get_resolves_results() {
        // ARRANGE
        let svc = TestService::start().await;
        let pool = start_pool(&svc, 2);
        let task = task_for(&svc);
        let ok = task
            .fork("square", vec![json!(7)], None, TransportKind::Store)
            .await
            .unwrap();
        let bad = task
            .fork("fail", vec![], None, TransportKind::Store)
            .await
            .unwrap();

        // ACT
        let ok_status = task.join_sub_task(ok, Some(Duration::from_secs(10))).await.unwrap();
        let bad_status = task.join_sub_task(bad, Some(Duration::from_secs(10))).await.unwrap();

        // ASSERT
        assert_eq!(ok_status, Some(ProcessStatus::Ready));
        assert_eq!(bad_status, Some(ProcessStatus::Error));
        assert_eq!(task.get_sub_task(ok).await.unwrap().results, Some(json!(49)));

        let failure: ErrorPayload =
            serde_json::from_value(task.get_sub_task_field(bad, "results").await.unwrap()).unwrap();
        assert!(failure.error.contains("Intentional error"));

        task.close().await.unwrap();
        pool.stop().await;
    }

    // ============================================================
    // TEST 3: kill
    // ============================================================

    #[tokio::test]
    async fn test_double_kill_is_not_found() {
        // ARRANGE
        let svc = TestService::start().await;
        let pool = start_pool(&svc, 1);
        let task = task_for(&svc);
        let id = task
            .fork("square", vec![json!(1)], None, TransportKind::Store)
            .await
            .unwrap();

        // ACT
        let first = task.kill_sub_task(id).await;
        let second = task.kill_sub_task(id).await;

        // ASSERT
        assert_eq!(first.unwrap(), id);
        let err = second.unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(err, TaskError::StoreRecordMissing { .. }));
        assert_eq!(svc.client().store_len().await.unwrap(), 0);
        assert!(task.sub_task_ids(None).is_empty());

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_kill_by_another_handle_finds_no_record() {
        let svc = TestService::start().await;
        let owner = task_for(&svc);
        let other = Task::with_client(svc.client(), svc.client_config());
        let id = owner
            .fork("square", vec![json!(1)], None, TransportKind::Store)
            .await
            .unwrap();

        // Make the record terminal so the join inside kill returns.
        let client = svc.client();
        let mut record = client.store_get(&owner.process_id(id)).await.unwrap().unwrap();
        record.status = ProcessStatus::Running;
        client.store_update(vec![record.clone()]).await.unwrap();
        record.status = ProcessStatus::Ready;
        client.store_update(vec![record]).await.unwrap();

        // A handle with a different task id never sees the record.
        let err = other.kill_sub_task(id).await.unwrap_err();
        assert!(matches!(err, TaskError::StoreRecordMissing { .. }));

        assert_eq!(owner.kill_sub_task(id).await.unwrap(), id);
    }

    #[tokio::test]
    async fn test_file_transport_round_trip_and_kill_cleanup() {
        // ARRANGE
        let svc = TestService::start().await;
        let pool = start_pool(&svc, 1);
        let task = task_for(&svc);
        let id = task
            .fork("square", vec![json!(12)], None, TransportKind::File)
            .await
            .unwrap();

        // ACT
        task.join_sub_task(id, Some(Duration::from_secs(10))).await.unwrap();
        let record = task.get_sub_task(id).await.unwrap();
        let raw = svc.client().store_get(&task.process_id(id)).await.unwrap().unwrap();

        // ASSERT: store holds a reference, get resolves the payload
        assert_eq!(record.transport, TransportKind::File);
        assert_eq!(record.results, Some(json!(144)));
        assert_eq!(raw.results, Some(json!(task.process_id(id).to_string())));

        task.kill_sub_task(id).await.unwrap();
        assert_eq!(svc.client().get_file_contents(&task.process_id(id)).await.unwrap(), None);
        assert!(!svc.task_dir.path().join(&task.task_id().0).exists());

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_kill_reports_file_it_could_not_delete() {
        // ARRANGE: a finished file-transport result whose path is then
        // replaced by a non-empty directory the service cannot unlink.
        let svc = TestService::start().await;
        let pool = start_pool(&svc, 1);
        let task = task_for(&svc);
        let id = task
            .fork("square", vec![json!(5)], None, TransportKind::File)
            .await
            .unwrap();
        task.join_sub_task(id, Some(Duration::from_secs(10))).await.unwrap();

        let pid = task.process_id(id);
        let file = svc.task_dir.path().join(&task.task_id().0).join(pid.to_string());
        std::fs::remove_file(&file).unwrap();
        std::fs::create_dir(&file).unwrap();
        std::fs::write(file.join("blocker"), b"x").unwrap();

        // ACT
        let err = task.kill_sub_task(id).await.unwrap_err();

        // ASSERT: the failure is surfaced, the kill itself went through
        match err {
            TaskError::ResultNotDiscarded { process_id, .. } => assert_eq!(process_id, pid),
            other => panic!("unexpected error: {}", other),
        }
        assert!(task.sub_task_ids(None).is_empty());
        assert_eq!(svc.client().store_len().await.unwrap(), 0);
        assert!(file.join("blocker").exists());
        let again = task.kill_sub_task(id).await.unwrap_err();
        assert!(matches!(again, TaskError::StoreRecordMissing { .. }));

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_handle_transport_delete_makes_next_read_fail() {
        let svc = TestService::start().await;
        let pool = start_pool(&svc, 1);
        let task = task_for(&svc);
        let id = task
            .fork("square", vec![json!(3)], None, TransportKind::File)
            .await
            .unwrap();
        task.join_sub_task(id, Some(Duration::from_secs(10))).await.unwrap();
        let reference = json!(task.process_id(id).to_string());

        let value = task
            .handle_transport(TransportKind::File, &reference, true)
            .await
            .unwrap();
        let again = task.handle_transport(TransportKind::File, &reference, false).await;

        assert_eq!(value, json!(9));
        assert!(again.unwrap_err().is_not_found());
        assert!(task.get_sub_task(id).await.is_err());

        pool.stop().await;
    }

    // ============================================================
    // TEST 4: End-to-end
    // ============================================================

    #[tokio::test]
    async fn test_batch_drained_by_pool_and_killed() {
        // ARRANGE: empty queue, pool of 3
        let svc = TestService::start().await;
        let task = task_for(&svc);
        assert_eq!(svc.service.queue_size(), 0);
        let pool = start_pool(&svc, 3);

        // ACT
        for n in 0..10 {
            task.fork("square", vec![json!(n)], Some("batch1"), TransportKind::Store)
                .await
                .unwrap();
        }
        let statuses = task
            .join_task(Some(Duration::from_secs(20)), Some("batch1"))
            .await
            .unwrap();
        let mut results: Vec<i64> = task
            .get_task(Some("batch1"))
            .await
            .unwrap()
            .into_iter()
            .filter_map(|r| r.results.and_then(|v| v.as_i64()))
            .collect();
        let killed = task.kill_task(Some("batch1")).await.unwrap();

        // ASSERT
        assert_eq!(statuses.len(), 10);
        assert!(statuses.iter().all(|(_, s)| s.is_some_and(|s| s.is_terminal())));
        results.sort();
        assert_eq!(results, vec![0, 1, 4, 9, 16, 25, 36, 49, 64, 81]);
        assert_eq!(killed.len(), 10);
        assert_eq!(svc.client().store_len().await.unwrap(), 0);
        assert!(task.sub_task_ids(Some("batch1")).is_empty());

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_join_queue_waits_for_pool_to_drain() {
        let svc = TestService::start().await;
        let task = task_for(&svc);
        for n in 0..5 {
            task.fork("square", vec![json!(n)], None, TransportKind::Store)
                .await
                .unwrap();
        }

        // Nobody is consuming yet.
        assert!(!task.join_queue(Some(Duration::from_millis(50))).await.unwrap());

        let pool = start_pool(&svc, 2);
        assert!(task.join_queue(Some(Duration::from_secs(10))).await.unwrap());
        assert_eq!(svc.service.queue_size(), 0);

        let statuses = task.join_task(Some(Duration::ZERO), None).await.unwrap();
        assert!(statuses.iter().all(|(_, s)| s.is_some_and(|s| s.is_terminal())));

        task.close().await.unwrap();
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_drop_tears_down_remaining_sub_tasks() {
        let svc = TestService::start().await;
        let pool = start_pool(&svc, 2);
        let client = svc.client();
        {
            let task = task_for(&svc);
            for n in 0..4 {
                task.fork("square", vec![json!(n)], None, TransportKind::Store)
                    .await
                    .unwrap();
            }
        }

        let mut remaining = usize::MAX;
        for _ in 0..200 {
            remaining = client.store_len().await.unwrap();
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        assert_eq!(remaining, 0);
        pool.stop().await;
    }

    // ============================================================
    // TEST 5: Service outage
    // ============================================================

    #[tokio::test]
    async fn test_pool_and_join_survive_service_restart() {
        // ARRANGE: one long handler is running when the service goes away
        let mut svc = TestService::start().await;
        let registry = registry();
        registry.register("nap", |args| async move {
            let ms = args.first().and_then(Value::as_u64).unwrap_or_default();
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(ms))
        });
        let pool = Manager::new(
            svc.client(),
            registry,
            ManagerConfig {
                node_id: "restart".to_string(),
                capacity: 2,
                poll_interval: Duration::from_millis(20),
            },
        )
        .spawn();

        let task = task_for(&svc);
        let napping = task
            .fork("nap", vec![json!(400)], None, TransportKind::Store)
            .await
            .unwrap();
        for n in 0..3 {
            task.fork("square", vec![json!(n)], None, TransportKind::Store)
                .await
                .unwrap();
        }

        let mut claimed = false;
        for _ in 0..200 {
            let record = task.get_sub_task(napping).await.unwrap();
            if record.status == ProcessStatus::Running {
                claimed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(claimed, "nap was never picked up");

        // ACT: join while the service is down, then bring it back
        svc.stop().await;
        assert!(svc.client().health().await.unwrap_err().is_connection());

        let joiner = {
            let task = task.clone();
            tokio::spawn(async move { task.join_task(Some(Duration::from_secs(30)), None).await })
        };
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!joiner.is_finished());

        svc.resume().await;
        let statuses = joiner.await.unwrap().unwrap();

        // ASSERT
        assert_eq!(statuses.len(), 4);
        assert!(
            statuses
                .iter()
                .all(|(_, s)| *s == Some(ProcessStatus::Ready)),
            "{:?}",
            statuses
        );
        let record = task.get_sub_task(napping).await.unwrap();
        assert_eq!(record.results, Some(json!(400)));
        assert!(task.join_queue(Some(Duration::from_secs(5))).await.unwrap());
        assert_eq!(svc.service.queue_size(), 0);
        assert!(!pool.is_finished());

        task.close().await.unwrap();
        pool.stop().await;
    }
}
