use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use super::{Engine, EngineBuilder};
use crate::domain::{
    OperationResult, RequestContext, TaskError, TaskId, TaskSchedule, TaskState, TaskStatus,
};
use crate::ports::{InMemoryMetrics, Storage};
use crate::testing::tasks::{
    BadCancelTask, CancelBehaviour, DoublerTask, FailureTask, LongTask, PanicTask, RegularTask,
    SilentFailureTask, SixTimesTask, StubbornTask, UNSTABLE_FAILURE, UnstableTask,
};
use crate::testing::test_config;
use crate::typed::TaskType;

const WAIT: Duration = Duration::from_secs(10);

fn builder() -> EngineBuilder {
    EngineBuilder::new()
        .config(test_config())
        .register_typed_for_execution::<DoublerTask>()
        .unwrap()
        .register_typed_for_execution::<LongTask>()
        .unwrap()
        .register_typed_for_execution::<UnstableTask>()
        .unwrap()
        .register_typed_for_execution::<FailureTask>()
        .unwrap()
        .register_typed_for_execution::<PanicTask>()
        .unwrap()
        .register_typed_for_execution::<StubbornTask>()
        .unwrap()
        .register_typed_for_execution::<SilentFailureTask>()
        .unwrap()
        .register_for_execution_with(SixTimesTask::TYPE, |s| {
            Box::new(SixTimesTask::new(s.clone()))
        })
}

fn started(builder: EngineBuilder) -> Engine {
    let mut engine = builder.build().unwrap();
    engine.start();
    engine
}

async fn schedule<R: serde::Serialize>(engine: &Engine, task_type: &str, request: &R) -> TaskId {
    engine
        .scheduler()
        .schedule_task(&RequestContext::default(), task_type, "", request, "", "")
        .await
        .unwrap()
}

async fn ended(engine: &Engine, id: TaskId) -> TaskState {
    tokio::time::timeout(WAIT, engine.scheduler().wait_task_ended(id))
        .await
        .unwrap()
        .unwrap();
    engine.storage().get_task(id).await.unwrap()
}

fn with_bad_cancel(builder: EngineBuilder, cancels: &Arc<AtomicUsize>) -> EngineBuilder {
    let cancels = cancels.clone();
    builder
        .register_for_execution(BadCancelTask::TYPE, move || {
            Box::new(BadCancelTask::new(cancels.clone()))
        })
        .unwrap()
}

#[tokio::test]
async fn doubler_doubles() {
    let engine = started(builder());
    let id = schedule(&engine, DoublerTask::TYPE, &123).await;

    let response = engine.scheduler().wait_task_sync(id, WAIT).await.unwrap();
    assert_eq!(response, json!(246));

    let op = engine.scheduler().get_operation(id).await.unwrap();
    assert!(op.done);
    assert_eq!(op.result, Some(OperationResult::Response(json!(246))));
    engine.shutdown_and_join().await;
}

#[tokio::test]
async fn six_times_waits_on_its_doubler() {
    let engine = started(builder());
    let id = schedule(&engine, SixTimesTask::TYPE, &123).await;

    let response = engine.scheduler().wait_task_sync(id, WAIT).await.unwrap();
    assert_eq!(response, json!(738));

    let task = engine.storage().get_task(id).await.unwrap();
    assert!(task.dependencies.is_empty());
    engine.shutdown_and_join().await;
}

#[tokio::test]
async fn type_not_registered_for_execution_is_never_run() {
    let engine = started(
        EngineBuilder::new()
            .config(test_config())
            .register_typed::<DoublerTask>()
            .unwrap(),
    );
    let id = schedule(&engine, DoublerTask::TYPE, &123).await;

    let err = engine
        .scheduler()
        .wait_task_sync(id, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(err.is_non_retriable());
    assert_eq!(
        engine.storage().get_task(id).await.unwrap().status,
        TaskStatus::ReadyToRun
    );
    engine.shutdown_and_join().await;
}

#[tokio::test]
async fn unstable_task_succeeds_within_retry_budget() {
    let engine = started(builder());
    let id = schedule(&engine, UnstableTask::TYPE, &2u64).await;

    let response = engine.scheduler().wait_task_sync(id, WAIT).await.unwrap();
    assert_eq!(response, json!(2));
    assert_eq!(
        engine.storage().get_task(id).await.unwrap().retriable_error_count,
        2
    );
    engine.shutdown_and_join().await;
}

#[tokio::test]
async fn unstable_task_fails_past_retry_budget() {
    let engine = started(builder());
    let id = schedule(&engine, UnstableTask::TYPE, &3u64).await;

    let err = engine.scheduler().wait_task_sync(id, WAIT).await.unwrap_err();
    assert_eq!(err.to_string(), TaskError::retriable(UNSTABLE_FAILURE).to_string());

    engine.scheduler().wait_task_ended(id).await.unwrap();
    assert_eq!(
        engine.storage().get_task(id).await.unwrap().status,
        TaskStatus::Cancelled
    );
    engine.shutdown_and_join().await;
}

#[tokio::test]
async fn non_retriable_failure_goes_to_cancel_path() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let engine = started(builder().metrics(metrics.clone()));
    let id = schedule(&engine, FailureTask::TYPE, &()).await;

    let err = engine.scheduler().wait_task_sync(id, WAIT).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        TaskError::non_retriable("failure task always fails").to_string()
    );
    engine.scheduler().wait_task_ended(id).await.unwrap();

    let task = engine.storage().get_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.retriable_error_count, 0);
    assert_eq!(
        metrics.counter("errors/nonRetriable", &[("type", FailureTask::TYPE)]),
        1
    );
    engine.shutdown_and_join().await;
}

#[tokio::test]
async fn panic_is_contained_and_retried() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let engine = started(builder().metrics(metrics.clone()));
    let id = schedule(&engine, PanicTask::TYPE, &()).await;

    engine.scheduler().wait_task_sync(id, WAIT).await.unwrap();
    let task = engine.storage().get_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Finished);
    assert_eq!(task.panic_count, 1);
    assert_eq!(metrics.counter("errors/panic", &[("type", PanicTask::TYPE)]), 1);

    // the pool keeps working
    let doubler = schedule(&engine, DoublerTask::TYPE, &1).await;
    assert_eq!(
        engine.scheduler().wait_task_sync(doubler, WAIT).await.unwrap(),
        json!(2)
    );
    engine.shutdown_and_join().await;
}

#[tokio::test]
async fn cancelling_a_running_task() {
    let engine = started(builder());
    let id = schedule(&engine, LongTask::TYPE, &60_000u64).await;

    tokio::time::timeout(WAIT, async {
        while engine.storage().get_task(id).await.unwrap().status != TaskStatus::Running {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    assert!(engine.scheduler().cancel_task(id).await.unwrap());
    tokio::time::timeout(WAIT, engine.scheduler().wait_task_ended(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        engine.storage().get_task(id).await.unwrap().status,
        TaskStatus::Cancelled
    );
    engine.shutdown_and_join().await;
}

#[tokio::test]
async fn inflight_limit_serialises_long_tasks() {
    let engine = started(builder());
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(schedule(&engine, LongTask::TYPE, &300u64).await);
    }

    let mut max_running = 0;
    tokio::time::timeout(WAIT, async {
        loop {
            let running = engine.storage().list_tasks_running(100).await.unwrap();
            let long = running.iter().filter(|t| t.task_type == LongTask::TYPE).count();
            max_running = max_running.max(long);

            let mut ended = 0;
            for id in &ids {
                if engine.storage().get_task(*id).await.unwrap().status.is_ended() {
                    ended += 1;
                }
            }
            if ended == ids.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(max_running, 1);
    engine.shutdown_and_join().await;
}

#[tokio::test]
async fn regular_tasks_keep_running() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let engine = started(
        builder()
            .register_for_execution(RegularTask::TYPE, move || {
                Box::new(RegularTask::new(counter.clone()))
            })
            .unwrap(),
    );
    engine.scheduler().schedule_regular_tasks(
        RegularTask::TYPE,
        "Regular",
        TaskSchedule::every(Duration::from_millis(1), 2),
    );

    tokio::time::timeout(WAIT, async {
        while runs.load(Ordering::SeqCst) <= 4 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    engine.shutdown_and_join().await;
}

#[tokio::test]
async fn stalled_task_is_picked_up_by_another_host() {
    let engine = started(builder());

    let mut task = TaskState::new(DoublerTask::TYPE, Utc::now());
    task.request = b"21".to_vec();
    let id = engine.storage().create_task(task).await.unwrap();
    let info = engine.storage().get_task(id).await.unwrap().info();
    engine
        .storage()
        .lock_task_to_run(&info, Utc::now() - chrono::Duration::seconds(10), "dead-host", "r")
        .await
        .unwrap();

    let response = engine.scheduler().wait_task_sync(id, WAIT).await.unwrap();
    assert_eq!(response, json!(42));
    assert_eq!(
        engine.storage().get_task(id).await.unwrap().last_host,
        "localhost"
    );
    engine.shutdown_and_join().await;
}

#[tokio::test]
async fn heartbeats_register_the_node() {
    let engine = started(builder().host("node-1"));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let alive = engine.storage().get_alive_nodes().await.unwrap();
    assert!(alive.iter().any(|n| n.host == "node-1"));
    engine.shutdown_and_join().await;
}

#[tokio::test]
async fn shutdown_stops_every_loop() {
    let engine = started(builder());
    schedule(&engine, LongTask::TYPE, &60_000u64).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    tokio::time::timeout(Duration::from_secs(5), engine.shutdown_and_join())
        .await
        .unwrap();
}

#[tokio::test]
async fn retries_ignoring_limit_go_past_the_budget() {
    let engine = started(builder());
    let failures = test_config().max_retriable_error_count + 2;
    let id = schedule(&engine, StubbornTask::TYPE, &failures).await;

    let response = engine.scheduler().wait_task_sync(id, WAIT).await.unwrap();
    assert_eq!(response, json!(failures));

    let task = engine.storage().get_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Finished);
    assert_eq!(task.retriable_error_count, failures);
    engine.shutdown_and_join().await;
}

#[tokio::test]
async fn silent_failure_is_recorded_without_error_metric() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let engine = started(builder().metrics(metrics.clone()));
    let id = schedule(&engine, SilentFailureTask::TYPE, &()).await;

    let task = ended(&engine, id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.error_silent);
    assert_eq!(
        task.error_message,
        TaskError::silent("expected failure").to_string()
    );
    assert_eq!(
        metrics.counter("errors/nonRetriable", &[("type", SilentFailureTask::TYPE)]),
        0
    );
    engine.shutdown_and_join().await;
}

#[tokio::test]
async fn retriable_cancel_error_is_retried() {
    let cancels = Arc::new(AtomicUsize::new(0));
    let metrics = Arc::new(InMemoryMetrics::new());
    let engine = started(with_bad_cancel(builder().metrics(metrics.clone()), &cancels));
    let id = schedule(&engine, BadCancelTask::TYPE, &CancelBehaviour::RetriableOnce).await;

    let task = ended(&engine, id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(cancels.load(Ordering::SeqCst), 2);
    assert_eq!(
        metrics.counter("errors/retriable", &[("type", BadCancelTask::TYPE)]),
        1
    );
    engine.shutdown_and_join().await;
}

#[tokio::test]
async fn non_cancellable_cancel_gives_up() {
    let cancels = Arc::new(AtomicUsize::new(0));
    let metrics = Arc::new(InMemoryMetrics::new());
    let engine = started(with_bad_cancel(builder().metrics(metrics.clone()), &cancels));
    let id = schedule(&engine, BadCancelTask::TYPE, &CancelBehaviour::NonCancellable).await;

    let task = ended(&engine, id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(cancels.load(Ordering::SeqCst), 1);
    assert_eq!(
        metrics.counter("errors/nonCancellable", &[("type", BadCancelTask::TYPE)]),
        1
    );
    engine.shutdown_and_join().await;
}

#[tokio::test]
async fn panic_during_cancel_is_counted() {
    let cancels = Arc::new(AtomicUsize::new(0));
    let metrics = Arc::new(InMemoryMetrics::new());
    let engine = started(with_bad_cancel(builder().metrics(metrics.clone()), &cancels));
    let id = schedule(&engine, BadCancelTask::TYPE, &CancelBehaviour::Panic).await;

    let task = ended(&engine, id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.panic_count, 1);
    assert_eq!(
        metrics.counter("errors/panic", &[("type", BadCancelTask::TYPE)]),
        1
    );
    engine.shutdown_and_join().await;
}

#[tokio::test]
async fn hanging_task_is_reported_while_it_runs() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let mut config = test_config();
    config.hanging_task_timeout = Duration::from_millis(200);
    let engine = started(builder().config(config).metrics(metrics.clone()));
    let id = schedule(&engine, LongTask::TYPE, &1_500u64).await;

    let hanging = || metrics.gauge("hangingTasks", &[("type", LongTask::TYPE)]);
    tokio::time::timeout(WAIT, async {
        while hanging() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(hanging(), 1);

    engine.scheduler().wait_task_sync(id, WAIT).await.unwrap();
    assert_eq!(hanging(), 0);
    engine.shutdown_and_join().await;
}

#[tokio::test]
async fn excepted_types_are_never_hanging() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let mut config = test_config();
    config.hanging_task_timeout = Duration::from_millis(100);
    config.except_hanging_task_types = vec![LongTask::TYPE.to_string()];
    let engine = started(builder().config(config).metrics(metrics.clone()));
    let id = schedule(&engine, LongTask::TYPE, &800u64).await;

    tokio::time::timeout(WAIT, async {
        while !engine.storage().get_task(id).await.unwrap().status.is_ended() {
            assert_eq!(metrics.gauge("hangingTasks", &[("type", LongTask::TYPE)]), 0);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    engine.shutdown_and_join().await;
}
