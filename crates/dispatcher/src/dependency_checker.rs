use std::sync::Arc;

use tracing::{debug, error, info};

use worker_host_core::{ServiceProvider, WorkerDefinition, WorkerError, WorkerResult};

use crate::scope::ScopeGuard;

/// 启动时的依赖校验
///
/// 在任何Worker开始执行前，用仅供校验的作用域解析每个回调声明的依赖。
pub struct DependencyChecker {
    provider: Arc<dyn ServiceProvider>,
}

/// 单个无法解析的依赖
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyIssue {
    pub worker_id: u64,
    pub worker: String,
    pub type_name: &'static str,
    pub message: String,
}

impl DependencyIssue {
    fn into_error(self) -> WorkerError {
        WorkerError::Validation {
            worker: self.worker,
            type_name: self.type_name,
            message: self.message,
        }
    }
}

impl DependencyChecker {
    pub fn new(provider: Arc<dyn ServiceProvider>) -> Self {
        Self { provider }
    }

    /// 检查单个Worker，返回所有无法解析的依赖
    pub fn check_worker(&self, worker: &WorkerDefinition) -> Vec<DependencyIssue> {
        let guard = ScopeGuard::create(self.provider.as_ref());
        worker
            .callback
            .dependencies()
            .into_iter()
            .filter_map(|dependency| {
                match guard
                    .scope()
                    .resolve_service(dependency.type_id, dependency.type_name)
                {
                    Ok(_) => {
                        debug!(
                            "Worker {} 的依赖 {} 解析成功",
                            worker.name, dependency.type_name
                        );
                        None
                    }
                    Err(e) => Some(DependencyIssue {
                        worker_id: worker.id,
                        worker: worker.name.clone(),
                        type_name: dependency.type_name,
                        message: e.to_string(),
                    }),
                }
            })
            .collect()
    }

    /// 校验全部Worker，任一依赖无法解析即失败
    ///
    /// 所有问题都会记录日志，返回的错误对应第一个问题。
    pub fn validate_all(&self, workers: &[WorkerDefinition]) -> WorkerResult<()> {
        let issues: Vec<DependencyIssue> = workers
            .iter()
            .flat_map(|worker| self.check_worker(worker))
            .collect();

        for issue in &issues {
            error!(
                worker.id = issue.worker_id,
                worker.name = %issue.worker,
                dependency = issue.type_name,
                "依赖校验失败: {}",
                issue.message
            );
        }

        match issues.into_iter().next() {
            Some(issue) => Err(issue.into_error()),
            None => {
                info!("依赖校验通过，共 {} 个Worker", workers.len());
                Ok(())
            }
        }
    }
}
