//! End-to-end tests of the executor against real `mpipool-worker` processes
//! started by the local backend.

use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::json;

use mpipool::{BackendKind, Call, Executor, FutureState, PoolConfig, PoolError, TaskError};

const TIMEOUT: Duration = Duration::from_secs(20);

fn local_config(max_workers: usize) -> PoolConfig {
    PoolConfig::new(max_workers)
        .backend(BackendKind::Local)
        .worker_program(env!("CARGO_BIN_EXE_mpipool-worker"))
}

async fn ready(config: PoolConfig) -> Executor {
    let exe = Executor::new(config).unwrap();
    tokio::time::timeout(TIMEOUT, exe.wait_ready())
        .await
        .expect("pool did not start in time")
        .unwrap();
    exe
}

#[tokio::test]
async fn submit_returns_remote_result() {
    let exe = ready(local_config(1)).await;

    let future = exe.submit(Call::new("add").arg(2).arg(3)).unwrap();
    let value = tokio::time::timeout(TIMEOUT, future.clone()).await.unwrap().unwrap();

    assert_eq!(value, json!(5));
    assert_eq!(future.state(), FutureState::Done(json!(5)));
    exe.shutdown(true, false).await.unwrap();
}

#[tokio::test]
async fn map_yields_in_submission_order() {
    let exe = ready(local_config(3)).await;

    // later inputs finish first
    let inputs = vec![
        vec![json!(0.3), json!("a")],
        vec![json!(0.1), json!("b")],
        vec![json!(0.2), json!("c")],
    ];
    let results: Vec<_> = tokio::time::timeout(TIMEOUT, exe.map("sleep", inputs).unwrap().collect())
        .await
        .unwrap();
    let values: Vec<_> = results.into_iter().map(Result::unwrap).collect();

    assert_eq!(values, vec![json!("a"), json!("b"), json!("c")]);
    exe.shutdown(true, false).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slots_run_tasks_in_parallel_up_to_max_workers() {
    let exe = ready(local_config(2)).await;

    let started = Instant::now();
    let futures: Vec<_> = (0..4)
        .map(|i| exe.submit(Call::new("sleep").arg(0.2).arg(i)).unwrap())
        .collect();
    for (i, future) in futures.into_iter().enumerate() {
        let value = tokio::time::timeout(TIMEOUT, future).await.unwrap().unwrap();
        assert_eq!(value, json!(i));
    }
    let elapsed = started.elapsed();

    // two rounds of 0.2s on two slots, not four
    assert!(elapsed < Duration::from_millis(750), "took {elapsed:?}");
    let stats = exe.stats();
    assert!(stats.peak_executing <= 2, "peak was {}", stats.peak_executing);
    assert_eq!(stats.completed, 4);
    exe.shutdown(true, false).await.unwrap();
}

#[tokio::test]
async fn waiting_shutdown_finishes_queued_tasks() {
    let exe = ready(local_config(1)).await;

    let futures: Vec<_> = (0..4)
        .map(|i| exe.submit(Call::new("sleep").arg(0.05).arg(i)).unwrap())
        .collect();
    tokio::time::timeout(TIMEOUT, exe.shutdown(true, false))
        .await
        .unwrap()
        .unwrap();

    for (i, future) in futures.iter().enumerate() {
        assert_eq!(future.state(), FutureState::Done(json!(i)));
    }
    assert!(matches!(
        exe.submit(Call::new("add").arg(1).arg(1)),
        Err(PoolError::ExecutorShutdown)
    ));
}

#[tokio::test]
async fn cancel_futures_drops_unclaimed_tasks() {
    let exe = ready(local_config(1)).await;

    let running = exe.submit(Call::new("sleep").arg(0.5).arg("first")).unwrap();
    let queued: Vec<_> = (0..3)
        .map(|_| exe.submit(Call::new("add").arg(1).arg(2)).unwrap())
        .collect();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(running.running());

    tokio::time::timeout(TIMEOUT, exe.shutdown(true, true))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(running.state(), FutureState::Done(json!("first")));
    for future in &queued {
        assert!(future.cancelled());
        assert_eq!(future.result().await, Err(TaskError::Cancelled));
    }
    assert_eq!(exe.stats().cancelled, 3);
}

#[tokio::test]
async fn remote_errors_stay_with_their_task() {
    let exe = ready(local_config(1)).await;

    let err = exe
        .submit(Call::new("fail").arg("boom"))
        .unwrap()
        .await
        .unwrap_err();
    match err {
        TaskError::Remote(remote) => {
            assert_eq!(remote.kind, "error");
            assert_eq!(remote.message, "boom");
        }
        other => panic!("expected a remote error, got {other}"),
    }

    let err = exe.submit(Call::new("no_such_function")).unwrap().await.unwrap_err();
    assert!(matches!(err, TaskError::Remote(ref r) if r.kind == "unknown_function"));

    // the slot survives
    let value = exe.submit(Call::new("add").arg(1).arg(1)).unwrap().await.unwrap();
    assert_eq!(value, json!(2));
    exe.check().unwrap();
    exe.shutdown(true, false).await.unwrap();
}

#[tokio::test]
async fn dead_process_fails_task_and_slot() {
    let exe = ready(local_config(1)).await;

    let err = tokio::time::timeout(TIMEOUT, exe.submit(Call::new("exit").arg(3)).unwrap())
        .await
        .expect("task hung after the worker died")
        .unwrap_err();
    assert!(err.is_communication(), "got {err}");

    let deadline = Instant::now() + TIMEOUT;
    while exe.stats().alive_slots > 0 {
        assert!(Instant::now() < deadline, "slot never exited");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // the slot failure is reported once, then the pool has nobody left
    let first = exe.submit(Call::new("add").arg(1).arg(1)).unwrap_err();
    assert!(matches!(first, PoolError::Communication(_)), "got {first}");
    let second = exe.submit(Call::new("add").arg(1).arg(1)).unwrap_err();
    assert!(matches!(second, PoolError::NoLiveWorkers), "got {second}");

    exe.shutdown(true, false).await.unwrap();
}

#[tokio::test]
async fn initializer_state_is_per_slot_and_overridable() {
    let exe = ready(local_config(1).initializer("init_rank")).await;

    let init_pid = exe
        .submit(Call::new("get_kwarg").arg("init_pid"))
        .unwrap()
        .await
        .unwrap();
    let pid = exe.submit(Call::new("pid")).unwrap().await.unwrap();
    assert_eq!(init_pid, pid);

    let explicit = exe
        .submit(Call::new("get_kwarg").arg("init_rank").kwarg("init_rank", 99))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(explicit, json!(99));
    exe.shutdown(true, false).await.unwrap();
}

#[tokio::test]
async fn without_initializer_no_state_is_injected() {
    let exe = ready(local_config(1)).await;
    let value = exe
        .submit(Call::new("get_kwarg").arg("init_pid"))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(value, serde_json::Value::Null);
    exe.shutdown(true, false).await.unwrap();
}

#[tokio::test]
async fn failing_initializer_is_a_bootup_error() {
    let exe = Executor::new(local_config(1).initializer("fail")).unwrap();
    let err = tokio::time::timeout(TIMEOUT, exe.wait_ready())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, PoolError::Bootup { slot: 0, .. }), "got {err}");
    exe.shutdown(true, false).await.unwrap();
}

#[tokio::test]
async fn missing_entry_point_is_a_bootup_error() {
    let config = PoolConfig::new(1)
        .backend(BackendKind::Local)
        .worker_program("/nonexistent/mpipool-worker");
    let exe = Executor::new(config).unwrap();
    let err = tokio::time::timeout(TIMEOUT, exe.wait_ready())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, PoolError::Bootup { .. }), "got {err}");
    exe.shutdown(true, false).await.unwrap();
}

#[tokio::test]
async fn multi_rank_results_come_back_in_rank_order() {
    let exe = ready(local_config(1).cores_per_worker(2)).await;

    let value = exe
        .submit(Call::new("rank_info").arg(5))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(value, json!([[5, 2, 0], [5, 2, 1]]));
    exe.shutdown(true, false).await.unwrap();
}

#[tokio::test]
async fn scoped_executor_shuts_down_on_exit() {
    let value = Executor::scoped(local_config(2), |exe| async move {
        let future = exe.submit(Call::new("sum").args([json!(1), json!(2), json!(3)]))?;
        Ok(future.await?)
    })
    .await
    .unwrap();
    assert_eq!(value, json!(6));
}

#[tokio::test]
async fn scoped_executor_propagates_body_errors() {
    let result = Executor::scoped(local_config(1), |exe| async move {
        exe.submit(Call::new("fail").arg("inside scope"))?.await?;
        Ok(())
    })
    .await;
    assert!(matches!(result, Err(PoolError::RemoteExecution(ref r)) if r.message == "inside scope"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_waiting_shutdown_blocks_until_slots_exit() {
    let exe = ready(local_config(1)).await;
    let slow = exe.submit(Call::new("sleep").arg(1.0).arg("slow")).unwrap();

    let first = exe.clone();
    let first_shutdown = tokio::spawn(async move { first.shutdown(true, false).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = exe.clone();
    tokio::time::timeout(TIMEOUT, second.shutdown(true, false))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(slow.state(), FutureState::Done(json!("slow")));
    assert_eq!(exe.stats().alive_slots, 0);
    first_shutdown.await.unwrap().unwrap();
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn dropping_the_last_handle_cancels_queued_tasks_and_stops_slots() {
    let exe = ready(local_config(1)).await;
    let pid = exe.submit(Call::new("pid")).unwrap().await.unwrap();
    let running = exe.submit(Call::new("sleep").arg(0.3).arg("running")).unwrap();
    let queued: Vec<_> = (0..3)
        .map(|i| exe.submit(Call::new("add").arg(i).arg(1)).unwrap())
        .collect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(running.running());

    drop(exe);

    for future in &queued {
        assert!(future.cancelled());
        assert_eq!(future.result().await, Err(TaskError::Cancelled));
    }
    let value = tokio::time::timeout(TIMEOUT, running.result())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, json!("running"));

    // the worker process is terminated and reaped
    let proc_dir = std::path::PathBuf::from(format!("/proc/{pid}"));
    let deadline = Instant::now() + TIMEOUT;
    while proc_dir.exists() {
        assert!(Instant::now() < deadline, "worker {pid} still running");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn cancelled_task_surfaces_as_cancelled_in_scope() {
    let result = Executor::scoped(local_config(1), |exe| async move {
        exe.submit(Call::new("sleep").arg(0.3).arg("busy"))?;
        let queued = exe.submit(Call::new("add").arg(1).arg(1))?;
        exe.shutdown(false, true).await?;
        queued.await?;
        Ok(())
    })
    .await;
    assert!(matches!(result, Err(PoolError::Cancelled)), "got {result:?}");
}
