use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use worker_host_core::{
    Clock, CronScheduler, ServiceProvider, WorkerDefinition, WorkerError, WorkerSchedule,
};
use worker_host_observability::WorkerInstruments;

use crate::retry_service::{ExecutionOutcome, FailureDisposition, ResilienceEngine};
use crate::scope::ScopeGuard;

/// Worker循环的退出原因
#[derive(Debug)]
pub enum LoopExit {
    /// 连续型Worker的唯一一次调用已结束，或CRON表达式不再有后续触发
    Completed,
    /// 主机关闭
    Shutdown,
    /// 未处理的错误，主机需要关闭
    Fatal(WorkerError),
}

/// 单个Worker的调度循环
///
/// 同一Worker的调用从不重叠：下一次等待只在上一次调用（含全部重试）结束后开始。
pub struct WorkerLoop {
    worker: WorkerDefinition,
    provider: Arc<dyn ServiceProvider>,
    instruments: Arc<WorkerInstruments>,
    engine: ResilienceEngine,
    clock: Arc<dyn Clock>,
}

impl WorkerLoop {
    pub fn new(
        worker: WorkerDefinition,
        provider: Arc<dyn ServiceProvider>,
        instruments: Arc<WorkerInstruments>,
        engine: ResilienceEngine,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            worker,
            provider,
            instruments,
            engine,
            clock,
        }
    }

    pub fn worker(&self) -> &WorkerDefinition {
        &self.worker
    }

    pub async fn run(self) -> LoopExit {
        info!(
            worker.id = self.worker.id,
            worker.name = %self.worker.name,
            worker.type = self.worker.kind().as_str(),
            "Worker {} 启动",
            self.worker.name
        );

        let exit = match self.worker.schedule.clone() {
            WorkerSchedule::Continuous => self.run_continuous().await,
            WorkerSchedule::Interval(period) => self.run_periodic(period).await,
            WorkerSchedule::Cron(cron) => self.run_cron(&cron).await,
        };

        match &exit {
            LoopExit::Fatal(err) => warn!("Worker {} 因致命错误终止: {}", self.worker.name, err),
            other => info!("Worker {} 已停止: {:?}", self.worker.name, other),
        }
        exit
    }

    /// 连续型：一个作用域，一次调用
    async fn run_continuous(&self) -> LoopExit {
        if self.engine.shutdown_token().is_cancelled() {
            return LoopExit::Shutdown;
        }
        self.run_trigger().await.unwrap_or(LoopExit::Completed)
    }

    async fn run_periodic(&self, period: Duration) -> LoopExit {
        let shutdown = self.engine.shutdown_token();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return LoopExit::Shutdown,
                _ = ticker.tick() => {}
            }
            if let Some(exit) = self.run_trigger().await {
                return exit;
            }
        }
    }

    async fn run_cron(&self, cron: &CronScheduler) -> LoopExit {
        let shutdown = self.engine.shutdown_token();
        let mut last_fired: Option<DateTime<Utc>> = None;

        loop {
            let now = self.clock.now();
            let from = last_fired.map_or(now, |fired| fired.max(now));
            let Some(next) = cron.next_execution_time(from) else {
                warn!(
                    "CRON表达式 {} 没有后续触发时间，Worker {} 停止",
                    cron, self.worker.name
                );
                return LoopExit::Completed;
            };

            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(
                "Worker {} 下次触发时间: {} (等待 {:?})",
                self.worker.name, next, wait
            );
            // 已到期的触发优先于同一时刻的关闭信号
            tokio::select! {
                biased;
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.cancelled() => return LoopExit::Shutdown,
            }

            last_fired = Some(next);
            if let Some(exit) = self.run_trigger().await {
                return exit;
            }
        }
    }

    /// 在新作用域中执行一次触发；返回 `Some` 表示循环应当结束
    async fn run_trigger(&self) -> Option<LoopExit> {
        let iteration = self.instruments.next_iteration();
        let outcome = {
            let guard = ScopeGuard::create(self.provider.as_ref());
            self.engine
                .execute(&self.worker, &self.instruments, guard.scope(), iteration)
                .await
        };

        match outcome {
            ExecutionOutcome::Succeeded { .. } => None,
            ExecutionOutcome::Cancelled => Some(LoopExit::Shutdown),
            ExecutionOutcome::Failed(err) => match self.engine.handle_failure(&self.worker, err) {
                FailureDisposition::Handled => None,
                FailureDisposition::Fatal(err) => Some(LoopExit::Fatal(err)),
            },
        }
    }
}
