//! Timeout, retry and outcome classification around one logical execution.
//!
//! Each attempt gets a child of the host shutdown token. When the attempt deadline
//! fires, only the child is cancelled, so the engine can tell a timeout apart from
//! host shutdown by checking which token is cancelled.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument};

use worker_host_core::{CallbackError, ServiceScope, WorkerDefinition, WorkerError};
use worker_host_observability::WorkerInstruments;

/// 单次调用的原始结果
#[derive(Debug)]
pub enum AttemptResult {
    /// 回调在截止时间前返回（包括panic）
    Completed(Result<(), CallbackError>),
    /// 截止时间先到
    DeadlineElapsed(Duration),
}

/// 单次调用的分类结果
#[derive(Debug)]
pub enum AttemptOutcome {
    Success,
    RetryableFailure(CallbackError),
    TimedOut(Duration),
    ShutdownCancelled,
}

/// 一次逻辑执行（含全部重试）的结果
#[derive(Debug)]
pub enum ExecutionOutcome {
    Succeeded { attempts: u32 },
    Failed(WorkerError),
    Cancelled,
}

/// 最终失败交给错误处理器后的去向
#[derive(Debug)]
pub enum FailureDisposition {
    Handled,
    Fatal(WorkerError),
}

/// 分类单次调用结果
///
/// 主机关闭优先于其他一切：关闭期间回调返回的任何错误都视为关闭取消。
/// 回调自己产生的取消或超时类错误属于普通失败，可重试。
pub fn classify(result: AttemptResult, shutdown_requested: bool) -> AttemptOutcome {
    match result {
        AttemptResult::Completed(Ok(())) => AttemptOutcome::Success,
        _ if shutdown_requested => AttemptOutcome::ShutdownCancelled,
        AttemptResult::Completed(Err(e)) => AttemptOutcome::RetryableFailure(e),
        AttemptResult::DeadlineElapsed(timeout) => AttemptOutcome::TimedOut(timeout),
    }
}

/// 弹性执行引擎
#[derive(Debug, Clone)]
pub struct ResilienceEngine {
    shutdown: CancellationToken,
    cancellation_grace: Duration,
}

impl ResilienceEngine {
    pub fn new(shutdown: CancellationToken, cancellation_grace: Duration) -> Self {
        Self {
            shutdown,
            cancellation_grace,
        }
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// 执行一次调用尝试
    pub async fn run_attempt(
        &self,
        worker: &WorkerDefinition,
        scope: &dyn ServiceScope,
    ) -> AttemptOutcome {
        let attempt_token = self.shutdown.child_token();
        let invocation = AssertUnwindSafe(async {
            worker.callback.invoke(scope, attempt_token.clone()).await
        })
        .catch_unwind()
        .map(|result| {
            result.unwrap_or_else(|payload| Err(CallbackError::panic(panic_message(&*payload))))
        });
        tokio::pin!(invocation);

        let deadline = async {
            match worker.timeout {
                Some(timeout) => {
                    tokio::time::sleep(timeout).await;
                    timeout
                }
                None => std::future::pending().await,
            }
        };

        let result = tokio::select! {
            biased;
            result = &mut invocation => AttemptResult::Completed(result),
            timeout = deadline => AttemptResult::DeadlineElapsed(timeout),
        };

        let outcome = classify(result, self.shutdown.is_cancelled());
        if let AttemptOutcome::TimedOut(timeout) = &outcome {
            attempt_token.cancel();
            warn!(
                "Worker {} 执行超过 {:?}，已发出取消信号",
                worker.name, timeout
            );
            if tokio::time::timeout(self.cancellation_grace, &mut invocation)
                .await
                .is_err()
            {
                warn!(
                    "Worker {} 在 {:?} 宽限期内未响应取消，放弃该次调用",
                    worker.name, self.cancellation_grace
                );
            }
        }
        outcome
    }

    /// 执行一次逻辑触发：按重试策略反复尝试，直到成功、超时、耗尽次数或主机关闭
    ///
    /// 所有尝试共用调用方传入的作用域。
    pub async fn execute(
        &self,
        worker: &WorkerDefinition,
        instruments: &Arc<WorkerInstruments>,
        scope: &dyn ServiceScope,
        iteration: u64,
    ) -> ExecutionOutcome {
        let max_attempts = worker.max_attempts();
        let mut attempt = 1;

        loop {
            let span = instruments.start_attempt(iteration, attempt);
            let outcome = self
                .run_attempt(worker, scope)
                .instrument(span.span().clone())
                .await;

            match outcome {
                AttemptOutcome::Success => {
                    span.finish_ok();
                    instruments.record_success();
                    debug!(
                        "Worker {} 第 {} 次触发执行成功 (尝试 {} 次)",
                        worker.name, iteration, attempt
                    );
                    return ExecutionOutcome::Succeeded { attempts: attempt };
                }
                AttemptOutcome::ShutdownCancelled => {
                    span.finish_error(WorkerError::ShutdownCancelled.exception_type());
                    debug!("Worker {} 因主机关闭而取消", worker.name);
                    return ExecutionOutcome::Cancelled;
                }
                AttemptOutcome::TimedOut(timeout) => {
                    let err = WorkerError::Timeout {
                        worker: worker.name.clone(),
                        timeout,
                    };
                    span.finish_error(err.exception_type());
                    instruments.record_failure(err.exception_type());
                    return ExecutionOutcome::Failed(err);
                }
                AttemptOutcome::RetryableFailure(e) => {
                    span.finish_error(e.exception_type());

                    let delay = match worker.retry {
                        Some(retry) if attempt < max_attempts => retry.delay,
                        _ => {
                            instruments.record_failure(e.exception_type());
                            return ExecutionOutcome::Failed(
                                e.into_worker_error(&worker.name, attempt),
                            );
                        }
                    };

                    warn!(
                        "Worker {} 第 {}/{} 次尝试失败，{:?} 后重试: {}",
                        worker.name, attempt, max_attempts, delay, e
                    );
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => {
                            debug!("Worker {} 在重试等待期间收到关闭信号", worker.name);
                            return ExecutionOutcome::Cancelled;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// 将最终失败交给错误处理器；没有处理器或处理器panic时升级为致命错误
    pub fn handle_failure(
        &self,
        worker: &WorkerDefinition,
        err: WorkerError,
    ) -> FailureDisposition {
        let Some(handler) = &worker.error_handler else {
            error!(
                worker.id = worker.id,
                worker.name = %worker.name,
                exception.type = err.exception_type(),
                "Worker {} 发生未处理的错误，主机将关闭: {}",
                worker.name,
                err
            );
            return FailureDisposition::Fatal(err);
        };

        warn!(
            worker.id = worker.id,
            worker.name = %worker.name,
            exception.type = err.exception_type(),
            "Worker {} 执行失败，交由错误处理器: {}",
            worker.name,
            err
        );
        match std::panic::catch_unwind(AssertUnwindSafe(|| handler(&err))) {
            Ok(()) => FailureDisposition::Handled,
            Err(payload) => {
                error!(
                    "Worker {} 的错误处理器发生panic: {}",
                    worker.name,
                    panic_message(&*payload)
                );
                FailureDisposition::Fatal(err)
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> CallbackError {
        CallbackError::new(anyhow::anyhow!("boom"))
    }

    #[test]
    fn test_classify_success_wins_even_during_shutdown() {
        assert!(matches!(
            classify(AttemptResult::Completed(Ok(())), true),
            AttemptOutcome::Success
        ));
    }

    #[test]
    fn test_classify_errors_during_shutdown_are_cancellation() {
        assert!(matches!(
            classify(AttemptResult::Completed(Err(failure())), true),
            AttemptOutcome::ShutdownCancelled
        ));
        assert!(matches!(
            classify(AttemptResult::DeadlineElapsed(Duration::from_secs(1)), true),
            AttemptOutcome::ShutdownCancelled
        ));
    }

    #[test]
    fn test_classify_deadline_is_timeout() {
        assert!(matches!(
            classify(AttemptResult::DeadlineElapsed(Duration::from_secs(1)), false),
            AttemptOutcome::TimedOut(timeout) if timeout == Duration::from_secs(1)
        ));
    }

    #[test]
    fn test_classify_self_raised_cancellation_is_retryable() {
        let own_timeout = CallbackError::new(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "upstream timed out",
        ));
        assert!(matches!(
            classify(AttemptResult::Completed(Err(own_timeout)), false),
            AttemptOutcome::RetryableFailure(_)
        ));
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(&*payload), "static message");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(&*payload), "owned message");
        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(&*payload), "未知panic");
    }
}
