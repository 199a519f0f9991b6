use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{Id, JoinSet};
use tracing::{error, info, warn};

use worker_host_core::{
    Clock, HostConfig, ServiceContainer, ServiceProvider, SystemClock, ValidationFailureMode,
    WorkerError, WorkerRegistry, WorkerResult,
};
use worker_host_dispatcher::{DependencyChecker, LoopExit, ResilienceEngine, WorkerLoop};
use worker_host_observability::{WorkerStats, WorkerTag, WorkerTelemetry};

use crate::shutdown::ShutdownManager;

/// 主机退出结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostExit {
    /// 收到关闭信号后正常退出
    Graceful,
    /// 依赖校验失败或Worker发生未处理的错误
    Fatal {
        worker: Option<String>,
        reason: String,
    },
}

impl HostExit {
    /// 进程退出码
    pub fn exit_code(&self) -> i32 {
        match self {
            HostExit::Graceful => 0,
            HostExit::Fatal { .. } => 1,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, HostExit::Fatal { .. })
    }
}

/// Worker主机构建器
pub struct WorkerHostBuilder {
    config: HostConfig,
    registry: Arc<WorkerRegistry>,
    provider: Option<Arc<dyn ServiceProvider>>,
    clock: Arc<dyn Clock>,
    telemetry: Option<WorkerTelemetry>,
}

impl WorkerHostBuilder {
    pub fn with_config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: Arc<WorkerRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_services<P>(mut self, provider: P) -> Self
    where
        P: ServiceProvider + 'static,
    {
        self.provider = Some(Arc::new(provider));
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn ServiceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_telemetry(mut self, telemetry: WorkerTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn build(self) -> WorkerHost {
        let telemetry = self
            .telemetry
            .unwrap_or_else(|| WorkerTelemetry::new(self.config.engine.metrics_enabled));
        let provider = self
            .provider
            .unwrap_or_else(|| Arc::new(ServiceContainer::new()) as Arc<dyn ServiceProvider>);

        WorkerHost {
            config: self.config,
            registry: self.registry,
            provider,
            clock: self.clock,
            telemetry,
            shutdown: ShutdownManager::new(),
            started: AtomicBool::new(false),
        }
    }
}

/// Worker主机
///
/// 持有注册表和依赖解析器；启动时先完成依赖校验，再为每个Worker启动独立的调度循环。
pub struct WorkerHost {
    config: HostConfig,
    registry: Arc<WorkerRegistry>,
    provider: Arc<dyn ServiceProvider>,
    clock: Arc<dyn Clock>,
    telemetry: WorkerTelemetry,
    shutdown: ShutdownManager,
    started: AtomicBool,
}

impl WorkerHost {
    pub fn builder() -> WorkerHostBuilder {
        WorkerHostBuilder {
            config: HostConfig::default(),
            registry: Arc::new(WorkerRegistry::new()),
            provider: None,
            clock: Arc::new(SystemClock),
            telemetry: None,
        }
    }

    /// Worker注册入口
    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn shutdown_handle(&self) -> ShutdownManager {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    /// 各Worker的统计快照
    pub fn stats(&self) -> Vec<WorkerStats> {
        self.telemetry.snapshot()
    }

    /// 启动主机
    ///
    /// 依赖校验是启动屏障：校验完成前不会启动任何Worker。校验失败时，
    /// `raise` 模式直接返回错误，`shutdown` 模式返回一个立即以致命结果结束的 [`RunningHost`]。
    pub async fn start(&self) -> WorkerResult<RunningHost> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::Internal("Worker主机已经启动".to_string()));
        }
        self.config.validate()?;

        let definitions = self.registry.freeze();
        info!("启动Worker主机，共 {} 个Worker", definitions.len());

        let checker = DependencyChecker::new(Arc::clone(&self.provider));
        if let Err(err) = checker.validate_all(&definitions) {
            return match self.config.engine.validation_failure {
                ValidationFailureMode::Raise => Err(err),
                ValidationFailureMode::Shutdown => {
                    error!("依赖校验失败，Worker主机将关闭: {}", err);
                    self.shutdown.shutdown();
                    Ok(RunningHost::failed(self, validation_exit(&err)))
                }
            };
        }

        let engine = ResilienceEngine::new(
            self.shutdown.token(),
            self.config.engine.cancellation_grace(),
        );

        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();
        for definition in definitions {
            let name = definition.name.clone();
            let instruments = self.telemetry.register(WorkerTag::from(&definition));
            let worker_loop = WorkerLoop::new(
                definition,
                Arc::clone(&self.provider),
                instruments,
                engine.clone(),
                Arc::clone(&self.clock),
            );
            let handle = tasks.spawn(worker_loop.run());
            names.insert(handle.id(), name);
        }

        Ok(RunningHost {
            tasks,
            names,
            shutdown: self.shutdown.clone(),
            shutdown_timeout: self.config.engine.shutdown_timeout(),
            exit: None,
        })
    }

    /// 启动主机并运行，直到 `signal` 完成或发生致命错误
    pub async fn run_until<F>(&self, signal: F) -> WorkerResult<HostExit>
    where
        F: Future<Output = ()>,
    {
        let running = self.start().await?;
        let shutdown = running.shutdown_handle();

        let waiter = running.wait();
        tokio::pin!(waiter);
        tokio::select! {
            exit = &mut waiter => return Ok(exit),
            _ = signal => {
                info!("收到关闭信号，开始优雅关闭...");
                shutdown.shutdown();
            }
        }
        Ok(waiter.await)
    }
}

fn validation_exit(err: &WorkerError) -> HostExit {
    let worker = match err {
        WorkerError::Validation { worker, .. } => Some(worker.clone()),
        _ => None,
    };
    HostExit::Fatal {
        worker,
        reason: err.to_string(),
    }
}

/// 运行中的主机
pub struct RunningHost {
    tasks: JoinSet<LoopExit>,
    names: HashMap<Id, String>,
    shutdown: ShutdownManager,
    shutdown_timeout: Duration,
    exit: Option<HostExit>,
}

impl RunningHost {
    fn failed(host: &WorkerHost, exit: HostExit) -> Self {
        Self {
            tasks: JoinSet::new(),
            names: HashMap::new(),
            shutdown: host.shutdown.clone(),
            shutdown_timeout: host.config.engine.shutdown_timeout(),
            exit: Some(exit),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownManager {
        self.shutdown.clone()
    }

    /// 等待主机结束
    ///
    /// 在收到关闭信号或第一个致命错误前持续运行；之后在 `shutdown_timeout` 内等待所有Worker退出，
    /// 超时仍未退出的Worker将被中止。
    pub async fn wait(mut self) -> HostExit {
        if let Some(exit) = self.exit.take() {
            return exit;
        }

        let mut fatal: Option<HostExit> = None;
        while fatal.is_none() {
            tokio::select! {
                _ = self.shutdown.wait_for_shutdown() => break,
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    fatal = self.classify_exit(joined);
                }
            }
        }

        if let Some(HostExit::Fatal { worker, reason }) = &fatal {
            error!(
                "Worker {} 发生致命错误，关闭其他Worker: {}",
                worker.as_deref().unwrap_or("<unknown>"),
                reason
            );
        }
        self.shutdown.shutdown();

        let shutdown_timeout = self.shutdown_timeout;
        let drained = tokio::time::timeout(shutdown_timeout, async {
            while let Some(joined) = self.tasks.join_next_with_id().await {
                if let Some(exit) = self.classify_exit(joined) {
                    fatal.get_or_insert(exit);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "等待Worker退出超时 ({:?})，中止剩余 {} 个Worker",
                shutdown_timeout,
                self.tasks.len()
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        info!("Worker主机已停止");
        fatal.unwrap_or(HostExit::Graceful)
    }

    fn classify_exit(
        &self,
        joined: Result<(Id, LoopExit), tokio::task::JoinError>,
    ) -> Option<HostExit> {
        match joined {
            Ok((id, LoopExit::Fatal(err))) => Some(HostExit::Fatal {
                worker: self.names.get(&id).cloned(),
                reason: err.to_string(),
            }),
            Ok(_) => None,
            Err(e) if e.is_panic() => Some(HostExit::Fatal {
                worker: self.names.get(&e.id()).cloned(),
                reason: "Worker任务panic".to_string(),
            }),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(HostExit::Graceful.exit_code(), 0);
        let fatal = HostExit::Fatal {
            worker: Some("sync".to_string()),
            reason: "boom".to_string(),
        };
        assert_eq!(fatal.exit_code(), 1);
        assert!(fatal.is_fatal());
    }

    #[test]
    fn test_validation_exit_names_worker() {
        let err = WorkerError::Validation {
            worker: "mailer".to_string(),
            type_name: "Smtp",
            message: "未注册".to_string(),
        };
        match validation_exit(&err) {
            HostExit::Fatal { worker, reason } => {
                assert_eq!(worker.as_deref(), Some("mailer"));
                assert!(reason.contains("Smtp"));
            }
            HostExit::Graceful => panic!("validation failure must be fatal"),
        }
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_on_start() {
        let mut config = HostConfig::default();
        config.engine.shutdown_timeout_seconds = 0;
        let host = WorkerHost::builder().with_config(config).build();
        assert!(matches!(
            host.start().await,
            Err(WorkerError::Configuration(_))
        ));
    }
}
