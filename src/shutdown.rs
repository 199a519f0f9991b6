use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 优雅关闭管理器
///
/// 所有Worker循环和调用尝试的取消令牌都派生自这里的根令牌。
#[derive(Debug, Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    /// 创建新的关闭管理器
    pub fn new() -> Self {
        Self::default()
    }

    /// 根取消令牌
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭，重复调用无副作用
    pub fn shutdown(&self) {
        if self.token.is_cancelled() {
            debug!("关闭管理器已经触发过关闭");
            return;
        }
        info!("触发Worker主机关闭");
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 等待关闭信号
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }
}

/// 等待进程关闭信号 (Ctrl+C / SIGTERM)
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shutdown_manager_basic() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown());

        let token = manager.token();
        manager.shutdown();

        assert!(token.is_cancelled());
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_double_shutdown() {
        let manager = ShutdownManager::new();
        manager.shutdown();
        manager.shutdown();
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_wait_for_shutdown() {
        let manager = ShutdownManager::new();

        let manager_clone = manager.clone();
        let wait_handle = tokio::spawn(async move {
            manager_clone.wait_for_shutdown().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.shutdown();

        let result = timeout(Duration::from_millis(100), wait_handle).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_child_tokens_follow_shutdown() {
        let manager = ShutdownManager::new();
        let child = manager.token().child_token();
        child.cancel();
        assert!(!manager.is_shutdown());

        let child = manager.token().child_token();
        manager.shutdown();
        assert!(child.is_cancelled());
    }
}
