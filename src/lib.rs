//! # Worker Host
//!
//! 进程内后台Worker托管：注册持续运行、固定间隔和CRON三类Worker，
//! 启动前校验依赖，为每次触发创建独立的服务作用域，并在超时、重试和关闭之间做出一致的分类。

pub mod app;
pub mod shutdown;

pub use app::{HostExit, RunningHost, WorkerHost, WorkerHostBuilder};
pub use shutdown::{wait_for_shutdown_signal, ShutdownManager};

pub use worker_host_core::{
    resolve, CallbackError, Clock, Dependencies, ExceptionTypeExt, HostConfig, IntoWorkerResult,
    LogFormat, LoggingConfig, ServiceContainer, ServiceLifetime, ServiceProvider, ServiceScope,
    SystemClock, TaggedError, TokioClock, ValidationFailureMode, WorkerBuilder, WorkerError,
    WorkerKind, WorkerRegistry, WorkerResult, WorkerSchedule,
};
pub use worker_host_observability::{init_logging, WorkerStats, SPAN_NAME};
