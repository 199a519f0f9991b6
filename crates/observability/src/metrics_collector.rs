use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram, Label};
use tokio::time::Instant;
use tracing::field::Empty;
use tracing::{info_span, Span};

use worker_host_core::{WorkerDefinition, WorkerKind};

pub const SPAN_NAME: &str = "worker.execute";

const EXECUTIONS: &str = "worker.executions";
const ERRORS: &str = "worker.errors";
const DURATION: &str = "worker.duration";
const ACTIVE: &str = "worker.active";
const CONSECUTIVE_FAILURES: &str = "worker.consecutive_failures";
const LAST_SUCCESS_TIME: &str = "worker.last_success_time";

/// 遥测标签
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTag {
    pub id: u64,
    pub name: String,
    pub kind: WorkerKind,
    pub schedule: Option<String>,
}

impl From<&WorkerDefinition> for WorkerTag {
    fn from(definition: &WorkerDefinition) -> Self {
        Self {
            id: definition.id,
            name: definition.name.clone(),
            kind: definition.kind(),
            schedule: definition.schedule.describe(),
        }
    }
}

/// Worker遥测注册表
///
/// 为每个Worker创建一组指标句柄，并保留进程内的统计快照。
#[derive(Clone)]
pub struct WorkerTelemetry {
    metrics_enabled: bool,
    workers: Arc<Mutex<BTreeMap<u64, Arc<WorkerInstruments>>>>,
}

impl Default for WorkerTelemetry {
    fn default() -> Self {
        Self::new(true)
    }
}

impl WorkerTelemetry {
    pub fn new(metrics_enabled: bool) -> Self {
        Self {
            metrics_enabled,
            workers: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn register(&self, tag: WorkerTag) -> Arc<WorkerInstruments> {
        let instruments = Arc::new(WorkerInstruments::new(tag, self.metrics_enabled));
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instruments.tag.id, Arc::clone(&instruments));
        instruments
    }

    pub fn stats(&self, worker_id: u64) -> Option<WorkerStats> {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&worker_id)
            .map(|instruments| instruments.stats())
    }

    /// 按Worker id排序的统计快照
    pub fn snapshot(&self) -> Vec<WorkerStats> {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|instruments| instruments.stats())
            .collect()
    }
}

/// 单个Worker的统计快照
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStats {
    pub id: u64,
    pub name: String,
    pub kind: WorkerKind,
    /// 已触发的次数
    pub iterations: u64,
    /// 回调实际被调用的次数，包含重试
    pub attempts: u64,
    /// 以最终结果计的执行次数
    pub executions: u64,
    pub errors: u64,
    pub consecutive_failures: u64,
    pub active: bool,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_error_type: Option<String>,
}

/// 单个Worker的指标句柄和计数
pub struct WorkerInstruments {
    tag: WorkerTag,
    labels: Vec<Label>,
    metrics_enabled: bool,

    executions_total: Counter,
    duration: Histogram,
    active_gauge: Gauge,
    consecutive_failures_gauge: Gauge,
    last_success_gauge: Gauge,

    iterations: AtomicU64,
    attempts: AtomicU64,
    executions: AtomicU64,
    errors: AtomicU64,
    consecutive_failures: AtomicU64,
    active: AtomicBool,
    last_success: Mutex<Option<DateTime<Utc>>>,
    last_error_type: Mutex<Option<String>>,
}

impl WorkerInstruments {
    fn new(tag: WorkerTag, metrics_enabled: bool) -> Self {
        let mut labels = vec![
            Label::new("worker.id", tag.id.to_string()),
            Label::new("worker.name", tag.name.clone()),
            Label::new("worker.type", tag.kind.as_str()),
        ];
        if let Some(schedule) = &tag.schedule {
            labels.push(Label::new("worker.schedule", schedule.clone()));
        }

        let handles = if metrics_enabled {
            (
                counter!(EXECUTIONS, labels.clone()),
                histogram!(DURATION, labels.clone()),
                gauge!(ACTIVE, labels.clone()),
                gauge!(CONSECUTIVE_FAILURES, labels.clone()),
                gauge!(LAST_SUCCESS_TIME, labels.clone()),
            )
        } else {
            (
                Counter::noop(),
                Histogram::noop(),
                Gauge::noop(),
                Gauge::noop(),
                Gauge::noop(),
            )
        };
        let (executions_total, duration, active_gauge, consecutive_failures_gauge, last_success) =
            handles;

        Self {
            tag,
            labels,
            metrics_enabled,
            executions_total,
            duration,
            active_gauge,
            consecutive_failures_gauge,
            last_success_gauge: last_success,
            iterations: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            active: AtomicBool::new(false),
            last_success: Mutex::new(None),
            last_error_type: Mutex::new(None),
        }
    }

    pub fn tag(&self) -> &WorkerTag {
        &self.tag
    }

    /// 递增并返回本Worker的触发序号，从1开始
    pub fn next_iteration(&self) -> u64 {
        self.iterations.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 开始一次调用尝试，打开 `worker.execute` span 并置位活跃状态
    pub fn start_attempt(self: &Arc<Self>, iteration: u64, attempt: u32) -> AttemptSpan {
        let span = info_span!(
            "worker.execute",
            worker.id = self.tag.id,
            worker.name = %self.tag.name,
            worker.type = self.tag.kind.as_str(),
            worker.schedule = Empty,
            worker.iteration = Empty,
            worker.attempt = attempt,
            exception.type = Empty,
            otel.status_code = Empty,
        );
        // 连续型Worker没有调度，也不记录触发序号
        if let Some(schedule) = &self.tag.schedule {
            span.record("worker.schedule", schedule.as_str());
            span.record("worker.iteration", iteration);
        }

        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
        self.active_gauge.set(1.0);

        AttemptSpan {
            span,
            started_at: Instant::now(),
            instruments: Arc::clone(self),
        }
    }

    /// 记录一次成功的执行，并重置连续失败计数
    pub fn record_success(&self) {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.executions_total.increment(1);

        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.consecutive_failures_gauge.set(0.0);

        let now = Utc::now();
        *self
            .last_success
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(now);
        self.last_success_gauge.set(now.timestamp_millis() as f64 / 1000.0);
    }

    /// 记录一次最终失败的执行
    pub fn record_failure(&self, exception_type: &str) {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.executions_total.increment(1);
        self.errors.fetch_add(1, Ordering::SeqCst);

        if self.metrics_enabled {
            let mut labels = self.labels.clone();
            labels.push(Label::new("exception.type", exception_type.to_string()));
            counter!(ERRORS, labels).increment(1);
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.consecutive_failures_gauge.set(failures as f64);

        *self
            .last_error_type
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(exception_type.to_string());
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.tag.id,
            name: self.tag.name.clone(),
            kind: self.tag.kind,
            iterations: self.iterations.load(Ordering::SeqCst),
            attempts: self.attempts.load(Ordering::SeqCst),
            executions: self.executions.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
            last_success_time: *self
                .last_success
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            last_error_type: self
                .last_error_type
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    fn end_attempt(&self, started_at: Instant) {
        self.duration
            .record(started_at.elapsed().as_secs_f64() * 1000.0);
        self.active.store(false, Ordering::SeqCst);
        self.active_gauge.set(0.0);
    }
}

/// 一次调用尝试的 span
///
/// 调用 `finish_*` 关闭；若在完成前被丢弃（例如任务被中止），同样会记录耗时并清除活跃状态。
pub struct AttemptSpan {
    span: Span,
    started_at: Instant,
    instruments: Arc<WorkerInstruments>,
}

impl AttemptSpan {
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn finish_ok(self) {
        self.span.record("otel.status_code", "OK");
    }

    pub fn finish_error(self, exception_type: &str) {
        self.span.record("exception.type", exception_type);
        self.span.record("otel.status_code", "ERROR");
    }
}

impl Drop for AttemptSpan {
    fn drop(&mut self) {
        self.instruments.end_attempt(self.started_at);
    }
}
