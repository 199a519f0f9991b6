use std::sync::Arc;

use worker_host_core::{ServiceProvider, ServiceScope};

/// 依赖作用域守卫
///
/// 离开作用域时释放实例，包括提前返回和任务被取消的路径。
pub struct ScopeGuard {
    scope: Arc<dyn ServiceScope>,
}

impl ScopeGuard {
    pub fn create(provider: &dyn ServiceProvider) -> Self {
        Self {
            scope: provider.create_scope(),
        }
    }

    pub fn scope(&self) -> &dyn ServiceScope {
        self.scope.as_ref()
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.scope.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worker_host_core::ServiceContainer;

    #[test]
    fn test_guard_disposes_on_drop() {
        let container = ServiceContainer::new();
        {
            let _guard = ScopeGuard::create(&container);
            assert_eq!(container.scope_stats().live(), 1);
        }
        assert_eq!(container.scope_stats().live(), 0);
    }

    #[test]
    fn test_guard_disposes_on_early_return() {
        fn fails(container: &ServiceContainer) -> Result<(), &'static str> {
            let _guard = ScopeGuard::create(container);
            let step: Result<(), &'static str> = Err("boom");
            step?;
            Ok(())
        }

        let container = ServiceContainer::new();
        assert!(fails(&container).is_err());
        assert_eq!(container.scope_stats().disposed, 1);
    }
}
