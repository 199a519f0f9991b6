//! Seams between the engine and its collaborators.
//!
//! - [`ServiceProvider`] / [`ServiceScope`]: the opaque dependency resolver.
//! - [`Dependencies`]: a callback's declared dependency list, bound at registration time.
//! - [`WorkerCallback`]: the uniform `invoke(scope, cancel)` contract the engine calls.
//! - [`Clock`]: wall-clock source used to compute cron occurrences.

use std::any::{Any, TypeId};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::errors::{CallbackError, WorkerError, WorkerResult};

pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

/// 依赖解析作用域
///
/// 作用域内解析出的 scoped / transient 实例在 [`ServiceScope::dispose`] 时一并释放。
pub trait ServiceScope: Send + Sync {
    fn resolve_service(
        &self,
        type_id: TypeId,
        type_name: &'static str,
    ) -> WorkerResult<ServiceInstance>;

    /// 释放作用域持有的实例，重复调用无副作用
    fn dispose(&self);
}

/// 依赖解析器
pub trait ServiceProvider: Send + Sync {
    fn create_scope(&self) -> Arc<dyn ServiceScope>;
}

/// 从作用域中解析 `T`
pub fn resolve<T>(scope: &dyn ServiceScope) -> WorkerResult<Arc<T>>
where
    T: Send + Sync + 'static,
{
    let type_name = std::any::type_name::<T>();
    let instance = scope.resolve_service(TypeId::of::<T>(), type_name)?;
    instance
        .downcast::<T>()
        .map_err(|_| WorkerError::DependencyResolution {
            type_name,
            message: "注册的实例类型不匹配".to_string(),
        })
}

/// 回调声明的单个依赖
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DependencyDescriptor {
    pub type_id: TypeId,
    pub type_name: &'static str,
}

impl DependencyDescriptor {
    pub fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }
}

/// 回调的依赖列表
///
/// 实现于 `()`（无依赖）、`Arc<T>`（单个依赖）以及由它们组成的元组。
pub trait Dependencies: Sized + Send + 'static {
    fn descriptors() -> Vec<DependencyDescriptor>;

    fn resolve(scope: &dyn ServiceScope) -> WorkerResult<Self>;
}

impl Dependencies for () {
    fn descriptors() -> Vec<DependencyDescriptor> {
        Vec::new()
    }

    fn resolve(_scope: &dyn ServiceScope) -> WorkerResult<Self> {
        Ok(())
    }
}

impl<T> Dependencies for Arc<T>
where
    T: Send + Sync + 'static,
{
    fn descriptors() -> Vec<DependencyDescriptor> {
        vec![DependencyDescriptor::of::<T>()]
    }

    fn resolve(scope: &dyn ServiceScope) -> WorkerResult<Self> {
        resolve::<T>(scope)
    }
}

macro_rules! impl_dependencies_for_tuple {
    ($($ty:ident),+) => {
        impl<$($ty),+> Dependencies for ($($ty,)+)
        where
            $($ty: Dependencies),+
        {
            fn descriptors() -> Vec<DependencyDescriptor> {
                let mut descriptors = Vec::new();
                $(descriptors.extend($ty::descriptors());)+
                descriptors
            }

            fn resolve(scope: &dyn ServiceScope) -> WorkerResult<Self> {
                Ok(($($ty::resolve(scope)?,)+))
            }
        }
    };
}

impl_dependencies_for_tuple!(A);
impl_dependencies_for_tuple!(A, B);
impl_dependencies_for_tuple!(A, B, C);
impl_dependencies_for_tuple!(A, B, C, D);
impl_dependencies_for_tuple!(A, B, C, D, E);
impl_dependencies_for_tuple!(A, B, C, D, E, F);

/// 回调返回值: `()` 或 `Result<(), E>`
pub trait IntoWorkerResult {
    fn into_worker_result(self) -> Result<(), CallbackError>;
}

impl IntoWorkerResult for () {
    fn into_worker_result(self) -> Result<(), CallbackError> {
        Ok(())
    }
}

impl<E> IntoWorkerResult for Result<(), E>
where
    E: Into<anyhow::Error> + 'static,
{
    fn into_worker_result(self) -> Result<(), CallbackError> {
        self.map_err(CallbackError::new)
    }
}

pub type CallbackFuture = BoxFuture<'static, Result<(), CallbackError>>;

/// 引擎调用Worker的统一入口
pub trait WorkerCallback: Send + Sync {
    /// 回调声明的依赖，供启动校验使用
    fn dependencies(&self) -> Vec<DependencyDescriptor>;

    /// 从 `scope` 解析依赖并开始一次调用
    fn invoke(&self, scope: &dyn ServiceScope, cancel: CancellationToken) -> CallbackFuture;
}

/// 闭包形式的回调，依赖类型在注册时绑定
pub struct FnCallback<D, F> {
    f: F,
    _dependencies: PhantomData<fn() -> D>,
}

impl<D, F, Fut, R> FnCallback<D, F>
where
    D: Dependencies,
    F: Fn(D, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoWorkerResult,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _dependencies: PhantomData,
        }
    }
}

impl<D, F, Fut, R> WorkerCallback for FnCallback<D, F>
where
    D: Dependencies,
    F: Fn(D, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoWorkerResult,
{
    fn dependencies(&self) -> Vec<DependencyDescriptor> {
        D::descriptors()
    }

    fn invoke(&self, scope: &dyn ServiceScope, cancel: CancellationToken) -> CallbackFuture {
        match D::resolve(scope) {
            Ok(dependencies) => {
                let fut = (self.f)(dependencies, cancel);
                Box::pin(async move { fut.await.into_worker_result() })
            }
            Err(e) => Box::pin(futures::future::ready(Err(CallbackError::new(e)))),
        }
    }
}

/// 时钟抽象，CRON循环据此计算下一次触发时间
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 以 tokio 时间为基准的时钟
///
/// 将创建时刻的 `tokio::time::Instant` 映射到给定的墙上时间，之后随 tokio 时间推进。
/// 在 `tokio::time::pause()` 下可以确定性地驱动CRON调度。
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor_wall: DateTime<Utc>,
    anchor_instant: tokio::time::Instant,
}

impl TokioClock {
    pub fn anchored_at(wall: DateTime<Utc>) -> Self {
        Self {
            anchor_wall: wall,
            anchor_instant: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().saturating_duration_since(self.anchor_instant);
        self.anchor_wall + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    struct MapScope(HashMap<TypeId, ServiceInstance>);

    impl ServiceScope for MapScope {
        fn resolve_service(
            &self,
            type_id: TypeId,
            type_name: &'static str,
        ) -> WorkerResult<ServiceInstance> {
            self.0
                .get(&type_id)
                .cloned()
                .ok_or(WorkerError::DependencyResolution {
                    type_name,
                    message: "未注册".to_string(),
                })
        }

        fn dispose(&self) {}
    }

    struct Database(&'static str);
    struct Mailer;

    fn scope_with_database() -> MapScope {
        let mut services: HashMap<TypeId, ServiceInstance> = HashMap::new();
        services.insert(TypeId::of::<Database>(), Arc::new(Database("primary")));
        MapScope(services)
    }

    #[test]
    fn test_tuple_descriptors_preserve_order() {
        let descriptors = <(Arc<Database>, Arc<Mailer>)>::descriptors();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0], DependencyDescriptor::of::<Database>());
        assert_eq!(descriptors[1], DependencyDescriptor::of::<Mailer>());
        assert!(<()>::descriptors().is_empty());
    }

    #[test]
    fn test_resolve_single_dependency() {
        let scope = scope_with_database();
        let db = <Arc<Database>>::resolve(&scope).unwrap();
        assert_eq!(db.0, "primary");
    }

    #[test]
    fn test_resolve_missing_dependency_names_type() {
        let scope = scope_with_database();
        let err = <(Arc<Database>, Arc<Mailer>)>::resolve(&scope).err().unwrap();
        assert!(err.to_string().contains("Mailer"));
    }

    #[tokio::test]
    async fn test_fn_callback_receives_dependencies() {
        let callback = FnCallback::new(|db: Arc<Database>, _cancel: CancellationToken| async move {
            if db.0 == "primary" {
                Ok(())
            } else {
                Err(anyhow::anyhow!("wrong database"))
            }
        });

        assert_eq!(callback.dependencies().len(), 1);
        let scope = scope_with_database();
        let result = callback.invoke(&scope, CancellationToken::new()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_fn_callback_resolution_failure_is_callback_error() {
        let callback = FnCallback::new(|(): (), _cancel| async {});
        let scope = scope_with_database();
        assert!(callback.invoke(&scope, CancellationToken::new()).await.is_ok());

        let needs_mailer = FnCallback::new(|_mailer: Arc<Mailer>, _cancel| async {});
        let result = needs_mailer.invoke(&scope, CancellationToken::new()).await;
        let err = result.err().unwrap();
        assert_eq!(err.exception_type(), "WorkerError");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = TokioClock::anchored_at(start);
        tokio::time::advance(std::time::Duration::from_secs(90)).await;
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }
}
