use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::errors::{WorkerError, WorkerResult};
use crate::traits::{ServiceInstance, ServiceProvider, ServiceScope};

/// 服务生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceLifetime {
    /// 全局共享，首次解析时创建
    Singleton,
    /// 每个作用域一个实例
    Scoped,
    /// 每次解析创建新实例
    Transient,
}

type Factory = Arc<dyn Fn(&dyn ServiceScope) -> WorkerResult<ServiceInstance> + Send + Sync>;

struct ServiceRegistration {
    lifetime: ServiceLifetime,
    factory: Factory,
    singleton: Mutex<Option<ServiceInstance>>,
}

impl ServiceRegistration {
    fn singleton_instance(&self, scope: &dyn ServiceScope) -> WorkerResult<ServiceInstance> {
        if let Some(instance) = self.lock_singleton().as_ref() {
            return Ok(Arc::clone(instance));
        }
        // 在锁外构造，工厂可能解析其他服务
        let created = (self.factory)(scope)?;
        let mut slot = self.lock_singleton();
        Ok(Arc::clone(slot.get_or_insert(created)))
    }

    fn lock_singleton(&self) -> std::sync::MutexGuard<'_, Option<ServiceInstance>> {
        self.singleton.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 作用域创建/释放计数
#[derive(Debug, Default)]
struct ScopeCounters {
    created: AtomicU64,
    disposed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeStats {
    pub created: u64,
    pub disposed: u64,
}

impl ScopeStats {
    pub fn live(&self) -> u64 {
        self.created.saturating_sub(self.disposed)
    }
}

/// 内存依赖注入容器
///
/// 按类型注册服务，支持 singleton / scoped / transient 三种生命周期。
#[derive(Clone, Default)]
pub struct ServiceContainer {
    services: Arc<HashMap<TypeId, Arc<ServiceRegistration>>>,
    counters: Arc<ScopeCounters>,
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个已构造好的单例
    pub fn add_singleton<T>(&mut self, instance: T) -> &mut Self
    where
        T: Send + Sync + 'static,
    {
        let instance: ServiceInstance = Arc::new(instance);
        self.insert::<T>(ServiceRegistration {
            lifetime: ServiceLifetime::Singleton,
            factory: Arc::new(move |_: &dyn ServiceScope| Ok(Arc::clone(&instance))),
            singleton: Mutex::new(None),
        })
    }

    pub fn add_singleton_factory<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&dyn ServiceScope) -> WorkerResult<T> + Send + Sync + 'static,
    {
        self.add_factory(ServiceLifetime::Singleton, factory)
    }

    pub fn add_scoped<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&dyn ServiceScope) -> WorkerResult<T> + Send + Sync + 'static,
    {
        self.add_factory(ServiceLifetime::Scoped, factory)
    }

    pub fn add_transient<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&dyn ServiceScope) -> WorkerResult<T> + Send + Sync + 'static,
    {
        self.add_factory(ServiceLifetime::Transient, factory)
    }

    pub fn is_registered<T: 'static>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<T>())
    }

    pub fn lifetime_of<T: 'static>(&self) -> Option<ServiceLifetime> {
        self.services
            .get(&TypeId::of::<T>())
            .map(|registration| registration.lifetime)
    }

    pub fn scope_stats(&self) -> ScopeStats {
        ScopeStats {
            created: self.counters.created.load(Ordering::SeqCst),
            disposed: self.counters.disposed.load(Ordering::SeqCst),
        }
    }

    fn add_factory<T, F>(&mut self, lifetime: ServiceLifetime, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&dyn ServiceScope) -> WorkerResult<T> + Send + Sync + 'static,
    {
        self.insert::<T>(ServiceRegistration {
            lifetime,
            factory: Arc::new(move |scope: &dyn ServiceScope| {
                factory(scope).map(|instance| Arc::new(instance) as ServiceInstance)
            }),
            singleton: Mutex::new(None),
        })
    }

    fn insert<T: 'static>(&mut self, registration: ServiceRegistration) -> &mut Self {
        Arc::make_mut(&mut self.services).insert(TypeId::of::<T>(), Arc::new(registration));
        self
    }
}

impl ServiceProvider for ServiceContainer {
    fn create_scope(&self) -> Arc<dyn ServiceScope> {
        let id = self.counters.created.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("创建依赖作用域 #{}", id);
        Arc::new(ContainerScope {
            id,
            services: Arc::clone(&self.services),
            counters: Arc::clone(&self.counters),
            scoped: Mutex::new(HashMap::new()),
            owned: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }
}

/// [`ServiceContainer`] 创建的作用域
pub struct ContainerScope {
    id: u64,
    services: Arc<HashMap<TypeId, Arc<ServiceRegistration>>>,
    counters: Arc<ScopeCounters>,
    scoped: Mutex<HashMap<TypeId, ServiceInstance>>,
    owned: Mutex<Vec<ServiceInstance>>,
    disposed: AtomicBool,
}

impl ContainerScope {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn track(&self, instance: &ServiceInstance) {
        self.owned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(instance));
    }
}

impl ServiceScope for ContainerScope {
    fn resolve_service(
        &self,
        type_id: TypeId,
        type_name: &'static str,
    ) -> WorkerResult<ServiceInstance> {
        if self.is_disposed() {
            return Err(WorkerError::DependencyResolution {
                type_name,
                message: format!("作用域 #{} 已释放", self.id),
            });
        }

        let registration =
            self.services
                .get(&type_id)
                .ok_or_else(|| WorkerError::DependencyResolution {
                    type_name,
                    message: "服务未注册".to_string(),
                })?;

        match registration.lifetime {
            ServiceLifetime::Singleton => registration.singleton_instance(self),
            ServiceLifetime::Scoped => {
                let cached = self
                    .scoped
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&type_id)
                    .cloned();
                if let Some(instance) = cached {
                    return Ok(instance);
                }

                let created = (registration.factory)(self)?;
                let instance = Arc::clone(
                    self.scoped
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .entry(type_id)
                        .or_insert(created),
                );
                self.track(&instance);
                Ok(instance)
            }
            ServiceLifetime::Transient => {
                let instance = (registration.factory)(self)?;
                self.track(&instance);
                Ok(instance)
            }
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let released = {
            let mut owned = self.owned.lock().unwrap_or_else(PoisonError::into_inner);
            let count = owned.len();
            owned.clear();
            count
        };
        self.scoped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.counters.disposed.fetch_add(1, Ordering::SeqCst);
        debug!("释放依赖作用域 #{}，释放实例 {} 个", self.id, released);
    }
}

impl Drop for ContainerScope {
    fn drop(&mut self) {
        self.dispose();
    }
}
