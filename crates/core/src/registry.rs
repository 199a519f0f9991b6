use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{WorkerError, WorkerResult};
use crate::models::{
    default_worker_name, ErrorHandler, RetryPolicy, WorkerDefinition, WorkerKind, WorkerSchedule,
    WorkerSettings,
};
use crate::traits::{Dependencies, FnCallback, IntoWorkerResult, WorkerCallback};

/// Worker注册表
///
/// 由宿主构建器持有，启动时交给执行引擎。注册可以并发进行。
#[derive(Default)]
pub struct WorkerRegistry {
    next_id: AtomicU64,
    registrations: Mutex<Vec<Arc<WorkerRegistration>>>,
    frozen: AtomicBool,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册连续型Worker，启动后调用一次
    pub fn register_continuous<D, F, Fut, R>(&self, callback: F) -> WorkerResult<WorkerBuilder>
    where
        D: Dependencies,
        F: Fn(D, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoWorkerResult,
    {
        self.push(WorkerSchedule::Continuous, Arc::new(FnCallback::new(callback)))
    }

    /// 注册周期型Worker，`interval` 必须大于0
    pub fn register_periodic<D, F, Fut, R>(
        &self,
        interval: Duration,
        callback: F,
    ) -> WorkerResult<WorkerBuilder>
    where
        D: Dependencies,
        F: Fn(D, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoWorkerResult,
    {
        let schedule = WorkerSchedule::interval(interval)?;
        self.push(schedule, Arc::new(FnCallback::new(callback)))
    }

    /// 注册CRON型Worker，表达式在注册时解析
    pub fn register_cron<D, F, Fut, R>(
        &self,
        expression: &str,
        callback: F,
    ) -> WorkerResult<WorkerBuilder>
    where
        D: Dependencies,
        F: Fn(D, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoWorkerResult,
    {
        let schedule = WorkerSchedule::cron(expression)?;
        self.push(schedule, Arc::new(FnCallback::new(callback)))
    }

    /// 注册自定义的 [`WorkerCallback`] 实现
    pub fn register_callback(
        &self,
        schedule: WorkerSchedule,
        callback: Arc<dyn WorkerCallback>,
    ) -> WorkerResult<WorkerBuilder> {
        self.push(schedule, callback)
    }

    /// 冻结注册表并返回所有Worker定义
    ///
    /// 宿主启动时调用一次；之后的注册会被拒绝。
    pub fn freeze(&self) -> Vec<WorkerDefinition> {
        let mut registrations = {
            let guard = self.lock();
            self.frozen.store(true, Ordering::SeqCst);
            guard.clone()
        };
        registrations.sort_by_key(|registration| registration.id);
        registrations
            .iter()
            .map(|registration| registration.definition())
            .collect()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// 按id排序的注册快照
    pub fn registrations(&self) -> Vec<Arc<WorkerRegistration>> {
        let mut registrations = self.lock().clone();
        registrations.sort_by_key(|registration| registration.id);
        registrations
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// 清空注册表，仅用于测试隔离
    pub fn clear(&self) {
        let mut registrations = self.lock();
        registrations.clear();
        self.frozen.store(false, Ordering::SeqCst);
    }

    fn push(
        &self,
        schedule: WorkerSchedule,
        callback: Arc<dyn WorkerCallback>,
    ) -> WorkerResult<WorkerBuilder> {
        let mut registrations = self.lock();
        if self.is_frozen() {
            warn!("Worker主机已启动，拒绝新的{}Worker注册", schedule.kind().as_str());
            return Err(WorkerError::Configuration(
                "Worker主机已启动，不能再注册Worker".to_string(),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let registration = Arc::new(WorkerRegistration {
            id,
            schedule,
            callback,
            settings: Mutex::new(WorkerSettings::default()),
            started: AtomicBool::new(false),
        });
        debug!(
            "注册Worker: id={}, 类型={}",
            id,
            registration.kind().as_str()
        );
        registrations.push(Arc::clone(&registration));
        Ok(WorkerBuilder { registration })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<WorkerRegistration>>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// 单个Worker的注册信息
pub struct WorkerRegistration {
    id: u64,
    schedule: WorkerSchedule,
    callback: Arc<dyn WorkerCallback>,
    settings: Mutex<WorkerSettings>,
    started: AtomicBool,
}

impl WorkerRegistration {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> WorkerKind {
        self.schedule.kind()
    }

    pub fn schedule(&self) -> &WorkerSchedule {
        &self.schedule
    }

    pub fn name(&self) -> String {
        self.lock_settings()
            .name
            .clone()
            .unwrap_or_else(|| default_worker_name(self.id))
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// 冻结当前设置并标记为已启动，之后的修改将被忽略
    pub fn definition(&self) -> WorkerDefinition {
        let settings = {
            let guard = self.lock_settings();
            self.started.store(true, Ordering::SeqCst);
            guard.clone()
        };

        WorkerDefinition {
            id: self.id,
            name: settings
                .name
                .unwrap_or_else(|| default_worker_name(self.id)),
            schedule: self.schedule.clone(),
            callback: Arc::clone(&self.callback),
            error_handler: settings.error_handler,
            timeout: settings.timeout,
            retry: settings.retry,
        }
    }

    fn update(&self, field: &str, apply: impl FnOnce(&mut WorkerSettings)) {
        let mut settings = self.lock_settings();
        if self.is_started() {
            warn!(
                "Worker {} 已启动，忽略对 {} 的修改",
                self.id, field
            );
            return;
        }
        apply(&mut settings);
    }

    fn lock_settings(&self) -> MutexGuard<'_, WorkerSettings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 注册后的流式配置，重复调用以最后一次为准
#[derive(Clone)]
pub struct WorkerBuilder {
    registration: Arc<WorkerRegistration>,
}

impl WorkerBuilder {
    pub fn id(&self) -> u64 {
        self.registration.id
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.registration
            .update("name", |settings| settings.name = Some(name));
        self
    }

    pub fn with_error_handler<H>(self, handler: H) -> Self
    where
        H: Fn(&WorkerError) + Send + Sync + 'static,
    {
        let handler: ErrorHandler = Arc::new(handler);
        self.registration
            .update("error_handler", |settings| settings.error_handler = Some(handler));
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> WorkerResult<Self> {
        if timeout.is_zero() {
            return Err(WorkerError::Configuration(
                "超时时间必须大于0".to_string(),
            ));
        }
        self.registration
            .update("timeout", |settings| settings.timeout = Some(timeout));
        Ok(self)
    }

    pub fn with_retry(self, max_attempts: u32, delay: Duration) -> WorkerResult<Self> {
        let policy = RetryPolicy::new(max_attempts, delay)?;
        self.registration
            .update("retry", |settings| settings.retry = Some(policy));
        Ok(self)
    }
}
