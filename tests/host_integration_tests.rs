use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use worker_host::{
    ExceptionTypeExt, HostConfig, HostExit, ServiceContainer, TokioClock, ValidationFailureMode,
    WorkerError, WorkerHost, WorkerKind,
};
use worker_host_testing_utils::{CallRecorder, ErrorSink, TestEnv};

const MINUTE: Duration = Duration::from_secs(60);

struct Mailer;

fn config_with(mode: ValidationFailureMode) -> HostConfig {
    let mut config = HostConfig::default();
    config.engine.validation_failure = mode;
    config.engine.metrics_enabled = false;
    config
}

fn counting(
    recorder: &CallRecorder,
) -> impl Fn((), CancellationToken) -> std::future::Ready<()> + Send + Sync + 'static {
    let recorder = recorder.clone();
    move |(): (), _cancel: CancellationToken| {
        let (_call, _guard) = recorder.enter();
        std::future::ready(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_validation_failure_raises_before_any_worker_starts() {
    let host = WorkerHost::builder()
        .with_config(config_with(ValidationFailureMode::Raise))
        .build();
    let recorder = CallRecorder::new();

    host.registry()
        .register_continuous(counting(&recorder))
        .unwrap();
    host.registry()
        .register_continuous(|_mailer: Arc<Mailer>, _cancel: CancellationToken| async {})
        .unwrap()
        .with_name("newsletter");

    let err = host.start().await.err().expect("Mailer is not registered");
    match err {
        WorkerError::Validation { worker, .. } => assert_eq!(worker, "newsletter"),
        other => panic!("unexpected error: {other:?}"),
    }

    tokio::time::sleep(MINUTE).await;
    assert_eq!(recorder.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_validation_failure_shuts_down_with_non_zero_exit() {
    let host = WorkerHost::builder()
        .with_config(config_with(ValidationFailureMode::Shutdown))
        .build();
    let recorder = CallRecorder::new();

    host.registry()
        .register_periodic(MINUTE, counting(&recorder))
        .unwrap();
    host.registry()
        .register_continuous(|_mailer: Arc<Mailer>, _cancel: CancellationToken| async {})
        .unwrap()
        .with_name("newsletter");

    let exit = host.run_until(std::future::pending::<()>()).await.unwrap();

    match &exit {
        HostExit::Fatal { worker, reason } => {
            assert_eq!(worker.as_deref(), Some("newsletter"));
            assert!(reason.contains("Mailer"));
        }
        other => panic!("unexpected exit: {other:?}"),
    }
    assert_eq!(exit.exit_code(), 1);
    assert!(host.shutdown_handle().is_shutdown());
    assert_eq!(recorder.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_exits_with_zero() {
    let host = WorkerHost::builder()
        .with_config(config_with(ValidationFailureMode::Raise))
        .build();
    let recorder = CallRecorder::new();

    host.registry()
        .register_periodic(MINUTE, counting(&recorder))
        .unwrap()
        .with_name("ticker");

    let exit = host
        .run_until(tokio::time::sleep(MINUTE * 5))
        .await
        .unwrap();

    assert_eq!(exit, HostExit::Graceful);
    assert_eq!(exit.exit_code(), 0);
    assert_eq!(recorder.calls(), 4);

    let stats = host.stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].name, "ticker");
    assert_eq!(stats[0].kind, WorkerKind::Periodic);
    assert_eq!(stats[0].executions, 4);
    assert_eq!(stats[0].errors, 0);
    assert!(!stats[0].active);
}

#[tokio::test(start_paused = true)]
async fn test_unhandled_failure_stops_every_worker() {
    let host = WorkerHost::builder()
        .with_config(config_with(ValidationFailureMode::Raise))
        .build();

    let observed_cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&observed_cancel);
    host.registry()
        .register_continuous(move |(): (), cancel: CancellationToken| {
            let flag = Arc::clone(&flag);
            async move {
                cancel.cancelled().await;
                flag.store(true, Ordering::SeqCst);
            }
        })
        .unwrap()
        .with_name("listener");
    host.registry()
        .register_periodic(MINUTE, |(): (), _cancel: CancellationToken| async {
            Err::<(), _>(anyhow::anyhow!("disk full"))
        })
        .unwrap()
        .with_name("fragile");

    let exit = host.run_until(std::future::pending::<()>()).await.unwrap();

    match &exit {
        HostExit::Fatal { worker, reason } => {
            assert_eq!(worker.as_deref(), Some("fragile"));
            assert!(reason.contains("disk full"));
        }
        other => panic!("unexpected exit: {other:?}"),
    }
    assert_eq!(exit.exit_code(), 1);
    assert!(observed_cancel.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_does_not_reach_error_handler() {
    let host = WorkerHost::builder()
        .with_config(config_with(ValidationFailureMode::Raise))
        .build();
    let sink = ErrorSink::new();

    let builder = host
        .registry()
        .register_continuous(|(): (), cancel: CancellationToken| async move {
            cancel.cancelled().await;
            Err::<(), _>(anyhow::anyhow!("interrupted"))
        })
        .unwrap()
        .with_error_handler(sink.handler());

    let exit = host.run_until(tokio::time::sleep(MINUTE)).await.unwrap();

    assert_eq!(exit, HostExit::Graceful);
    assert_eq!(sink.count(), 0);
    let stats = host
        .stats()
        .into_iter()
        .find(|stats| stats.id == builder.id())
        .unwrap();
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.executions, 0);
}

#[tokio::test(start_paused = true)]
async fn test_tagged_error_reaches_handler_with_its_exception_type() {
    let host = WorkerHost::builder()
        .with_config(config_with(ValidationFailureMode::Raise))
        .build();
    let sink = ErrorSink::new();

    host.registry()
        .register_periodic(MINUTE, |(): (), _cancel: CancellationToken| async {
            Err::<(), _>(anyhow::anyhow!("quota used up")).exception_type("QuotaExceeded")
        })
        .unwrap()
        .with_name("billing")
        .with_error_handler(sink.handler());

    let exit = host
        .run_until(tokio::time::sleep(MINUTE + MINUTE / 2))
        .await
        .unwrap();

    assert_eq!(exit, HostExit::Graceful);
    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].exception_type, "QuotaExceeded");
    assert!(errors[0].message.contains("quota used up"));
}

#[tokio::test(start_paused = true)]
async fn test_stubborn_worker_aborted_after_shutdown_timeout() {
    let mut config = config_with(ValidationFailureMode::Raise);
    config.engine.shutdown_timeout_seconds = 2;
    let host = WorkerHost::builder().with_config(config).build();

    host.registry()
        .register_continuous(|(): (), _cancel: CancellationToken| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        })
        .unwrap();

    let started = tokio::time::Instant::now();
    let exit = host
        .run_until(tokio::time::sleep(Duration::from_secs(1)))
        .await
        .unwrap();

    assert_eq!(exit, HostExit::Graceful);
    assert!(started.elapsed() < MINUTE);
}

#[tokio::test(start_paused = true)]
async fn test_cron_worker_through_host() {
    let host = WorkerHost::builder()
        .with_config(config_with(ValidationFailureMode::Raise))
        .with_clock(TokioClock::anchored_at(TestEnv::midnight()))
        .build();
    let recorder = CallRecorder::new();

    host.registry()
        .register_cron("*/5 * * * *", counting(&recorder))
        .unwrap();

    let exit = host
        .run_until(tokio::time::sleep(MINUTE * 30))
        .await
        .unwrap();

    assert_eq!(exit, HostExit::Graceful);
    // 第5, 10, ..., 30分钟；窗口结束时刻到期的触发同样执行
    assert_eq!(recorder.calls(), 6);
    let starts = recorder.start_times();
    for pair in starts.windows(2) {
        assert_eq!(pair[1] - pair[0], MINUTE * 5);
    }
}

#[tokio::test(start_paused = true)]
async fn test_scoped_services_resolved_through_host() {
    struct Batch;

    let mut container = ServiceContainer::new();
    container.add_scoped(|_| Ok(Batch));
    let host = WorkerHost::builder()
        .with_config(config_with(ValidationFailureMode::Raise))
        .with_services(container.clone())
        .build();
    let recorder = CallRecorder::new();

    let cb_recorder = recorder.clone();
    host.registry()
        .register_periodic(MINUTE, move |_batch: Arc<Batch>, _cancel: CancellationToken| {
            let (_call, _guard) = cb_recorder.enter();
            async {}
        })
        .unwrap();

    host.run_until(tokio::time::sleep(MINUTE * 2 + MINUTE / 2))
        .await
        .unwrap();

    assert_eq!(recorder.calls(), 2);
    let stats = container.scope_stats();
    // 启动校验一个作用域，每次触发一个
    assert_eq!(stats.created, 3);
    assert_eq!(stats.live(), 0);
}

#[tokio::test]
async fn test_host_cannot_start_twice() {
    let host = WorkerHost::builder().build();
    let running = host.start().await.unwrap();
    assert!(host.start().await.is_err());

    host.shutdown();
    assert_eq!(running.wait().await, HostExit::Graceful);
}

#[tokio::test]
async fn test_registration_after_start_is_rejected() {
    let host = WorkerHost::builder().build();
    let recorder = CallRecorder::new();
    let running = host.start().await.unwrap();

    let late = host.registry().register_continuous(counting(&recorder));
    assert!(matches!(late, Err(WorkerError::Configuration(_))));
    assert!(host.registry().is_empty());

    host.shutdown();
    assert_eq!(running.wait().await, HostExit::Graceful);
    assert_eq!(recorder.calls(), 0);
}
