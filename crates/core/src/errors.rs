use std::time::Duration;

use thiserror::Error;

/// Worker托管引擎错误类型定义
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("依赖校验失败: Worker {worker} 无法解析依赖 {type_name}: {message}")]
    Validation {
        worker: String,
        type_name: &'static str,
        message: String,
    },

    #[error("依赖解析失败: {type_name} - {message}")]
    DependencyResolution {
        type_name: &'static str,
        message: String,
    },

    #[error("Worker {worker} 执行失败 (尝试 {attempts} 次, {exception_type}): {source}")]
    Execution {
        worker: String,
        exception_type: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("Worker {worker} 执行超时: {timeout:?}")]
    Timeout { worker: String, timeout: Duration },

    #[error("主机正在关闭，执行已取消")]
    ShutdownCancelled,

    #[error("内部错误: {0}")]
    Internal(String),
}

impl WorkerError {
    /// 用于 `exception.type` 标签的错误类型名
    pub fn exception_type(&self) -> &str {
        match self {
            WorkerError::Execution { exception_type, .. } => exception_type,
            WorkerError::Timeout { .. } => "TimeoutError",
            WorkerError::Configuration(_) | WorkerError::InvalidCron { .. } => "ConfigurationError",
            WorkerError::Validation { .. } => "ValidationError",
            WorkerError::DependencyResolution { .. } => "DependencyResolutionError",
            WorkerError::ShutdownCancelled => "ShutdownCancellation",
            WorkerError::Internal(_) => "InternalError",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, WorkerError::Timeout { .. })
    }
}

/// 统一的Result类型
pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

/// Worker回调返回的失败
///
/// 保留原始错误的类型名，供遥测标签和错误处理器使用。
#[derive(Debug)]
pub struct CallbackError {
    exception_type: String,
    error: anyhow::Error,
}

impl CallbackError {
    pub fn new<E>(error: E) -> Self
    where
        E: Into<anyhow::Error> + 'static,
    {
        let error: anyhow::Error = error.into();
        let exception_type = match error.downcast_ref::<TaggedError>() {
            Some(tagged) => tagged.exception_type.clone(),
            None => short_type_name::<E>().to_string(),
        };
        Self {
            exception_type,
            error,
        }
    }

    /// 回调执行过程中发生panic
    pub fn panic(message: impl Into<String>) -> Self {
        Self {
            exception_type: "panic".to_string(),
            error: anyhow::anyhow!("Worker回调发生panic: {}", message.into()),
        }
    }

    pub fn exception_type(&self) -> &str {
        &self.exception_type
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }

    pub fn into_worker_error(self, worker: &str, attempts: u32) -> WorkerError {
        WorkerError::Execution {
            worker: worker.to_string(),
            exception_type: self.exception_type,
            attempts,
            source: self.error,
        }
    }
}

impl std::fmt::Display for CallbackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.exception_type, self.error)
    }
}

/// 带有显式 `exception.type` 标签的回调错误
///
/// `anyhow::Error` 不保留原始类型名，未标记时标签为 `Error`。
#[derive(Debug)]
pub struct TaggedError {
    exception_type: String,
    error: anyhow::Error,
}

impl TaggedError {
    pub fn new(exception_type: impl Into<String>, error: impl Into<anyhow::Error>) -> Self {
        Self {
            exception_type: exception_type.into(),
            error: error.into(),
        }
    }

    pub fn exception_type(&self) -> &str {
        &self.exception_type
    }
}

impl std::fmt::Display for TaggedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for TaggedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// 为回调返回的错误打上 `exception.type` 标签
///
/// ```ignore
/// fetch_quota().await.exception_type("QuotaExceeded")?;
/// ```
pub trait ExceptionTypeExt<T> {
    fn exception_type(self, exception_type: &str) -> Result<T, TaggedError>;
}

impl<T, E> ExceptionTypeExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn exception_type(self, exception_type: &str) -> Result<T, TaggedError> {
        self.map_err(|error| TaggedError::new(exception_type, error))
    }
}

/// `std::io::error::Error` -> `Error`, `alloc::boxed::Box<dyn Error>` -> `Box`
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
