//! Host configuration
//!
//! Loaded from an optional TOML file and `WORKER_HOST_*` environment variables,
//! falling back to defaults for everything not provided.

use std::path::Path;
use std::time::Duration;

use ::config::{Config as ConfigBuilder, Environment, File, FileFormat};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::{WorkerError, WorkerResult};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["config/worker-host.toml", "worker-host.toml"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

/// 执行引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 关闭时等待Worker退出的最长时间（秒）
    pub shutdown_timeout_seconds: u64,
    /// 超时触发后等待回调响应取消的宽限期（毫秒）
    pub cancellation_grace_ms: u64,
    /// 依赖校验失败时的处理方式
    pub validation_failure: ValidationFailureMode,
    /// 是否向 `metrics` 记录器上报指标
    pub metrics_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_seconds: 30,
            cancellation_grace_ms: 5_000,
            validation_failure: ValidationFailureMode::Shutdown,
            metrics_enabled: true,
        }
    }
}

impl EngineConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn cancellation_grace(&self) -> Duration {
        Duration::from_millis(self.cancellation_grace_ms)
    }

    pub fn validate(&self) -> WorkerResult<()> {
        if self.shutdown_timeout_seconds == 0 {
            return Err(WorkerError::Configuration(
                "engine.shutdown_timeout_seconds 必须大于0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 依赖校验失败时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationFailureMode {
    /// 记录诊断信息并以非零状态关闭主机
    #[default]
    Shutdown,
    /// 将校验错误直接返回给调用方（测试环境）
    Raise,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> WorkerResult<()> {
        match self.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(WorkerError::Configuration(format!(
                "无效的日志级别: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = WorkerError;

    fn from_str(s: &str) -> WorkerResult<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(WorkerError::Configuration(format!(
                "不支持的日志格式: {other}"
            ))),
        }
    }
}

impl HostConfig {
    /// 加载配置: 配置文件 (可选) -> 环境变量 -> 默认值
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        match config_path {
            Some(path) => {
                if !Path::new(path).exists() {
                    return Err(anyhow::anyhow!("配置文件不存在: {}", path));
                }
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
            None => {
                if let Some(path) = DEFAULT_CONFIG_PATHS
                    .iter()
                    .find(|path| Path::new(path).exists())
                {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("WORKER_HOST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: HostConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: HostConfig = ConfigBuilder::builder()
            .add_source(File::from_str(toml_str, FileFormat::Toml))
            .build()
            .context("解析TOML配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> WorkerResult<()> {
        self.engine.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();
        assert_eq!(config.engine.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(config.engine.cancellation_grace(), Duration::from_secs(5));
        assert_eq!(
            config.engine.validation_failure,
            ValidationFailureMode::Shutdown
        );
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial_sections() {
        let config = HostConfig::from_toml(
            r#"
            [engine]
            shutdown_timeout_seconds = 5
            validation_failure = "raise"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.shutdown_timeout_seconds, 5);
        assert_eq!(config.engine.validation_failure, ValidationFailureMode::Raise);
        assert_eq!(config.engine.cancellation_grace_ms, 5_000);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(HostConfig::from_toml("[engine]\nshutdown_timeout_seconds = 0\n").is_err());
        assert!(HostConfig::from_toml("[logging]\nlevel = \"loud\"\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[engine]\ncancellation_grace_ms = 250").unwrap();

        let config = HostConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.engine.cancellation_grace(), Duration::from_millis(250));
    }

    #[test]
    fn test_load_missing_file() {
        let result = HostConfig::load(Some("/nonexistent/worker-host.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
