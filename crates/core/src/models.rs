use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cron_utils::CronScheduler;
use crate::errors::{WorkerError, WorkerResult};
use crate::traits::WorkerCallback;

/// Worker类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    /// 启动时调用一次，由回调自行管理内部循环
    Continuous,
    /// 按固定间隔调用，不重叠
    Periodic,
    /// 按CRON表达式调用，不重叠
    Cron,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Continuous => "continuous",
            WorkerKind::Periodic => "periodic",
            WorkerKind::Cron => "cron",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker调度计划，注册时即完成校验
#[derive(Debug, Clone)]
pub enum WorkerSchedule {
    Continuous,
    Interval(Duration),
    Cron(CronScheduler),
}

impl WorkerSchedule {
    pub fn interval(interval: Duration) -> WorkerResult<Self> {
        if interval.is_zero() {
            return Err(WorkerError::Configuration(
                "周期Worker的间隔必须大于0".to_string(),
            ));
        }
        Ok(WorkerSchedule::Interval(interval))
    }

    pub fn cron(expression: &str) -> WorkerResult<Self> {
        CronScheduler::new(expression).map(WorkerSchedule::Cron)
    }

    pub fn kind(&self) -> WorkerKind {
        match self {
            WorkerSchedule::Continuous => WorkerKind::Continuous,
            WorkerSchedule::Interval(_) => WorkerKind::Periodic,
            WorkerSchedule::Cron(_) => WorkerKind::Cron,
        }
    }

    /// `worker.schedule` 标签值，连续型Worker没有调度计划
    pub fn describe(&self) -> Option<String> {
        match self {
            WorkerSchedule::Continuous => None,
            WorkerSchedule::Interval(interval) => Some(format!("{interval:?}")),
            WorkerSchedule::Cron(cron) => Some(cron.expression().to_string()),
        }
    }
}

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> WorkerResult<Self> {
        if max_attempts < 1 {
            return Err(WorkerError::Configuration(
                "重试次数 max_attempts 必须至少为1".to_string(),
            ));
        }
        if delay.is_zero() {
            return Err(WorkerError::Configuration(
                "重试间隔 delay 必须大于0".to_string(),
            ));
        }
        Ok(Self {
            max_attempts,
            delay,
        })
    }
}

pub type ErrorHandler = Arc<dyn Fn(&WorkerError) + Send + Sync>;

/// 注册后仍可修改的设置，Worker启动前最后一次写入生效
#[derive(Clone, Default)]
pub struct WorkerSettings {
    pub name: Option<String>,
    pub error_handler: Option<ErrorHandler>,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl fmt::Debug for WorkerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSettings")
            .field("name", &self.name)
            .field("error_handler", &self.error_handler.is_some())
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Worker启动时冻结的完整定义
#[derive(Clone)]
pub struct WorkerDefinition {
    pub id: u64,
    pub name: String,
    pub schedule: WorkerSchedule,
    pub callback: Arc<dyn WorkerCallback>,
    pub error_handler: Option<ErrorHandler>,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl WorkerDefinition {
    pub fn kind(&self) -> WorkerKind {
        self.schedule.kind()
    }

    /// 单次触发允许的最大尝试次数，未配置重试时为1
    pub fn max_attempts(&self) -> u32 {
        self.retry.map_or(1, |retry| retry.max_attempts)
    }
}

impl fmt::Debug for WorkerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

pub fn default_worker_name(id: u64) -> String {
    format!("worker-{id}")
}
