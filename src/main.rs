use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use worker_host::{
    init_logging, wait_for_shutdown_signal, ExceptionTypeExt, HostConfig, LogFormat,
    ServiceContainer, WorkerError, WorkerHost,
};

/// 示例服务：请求计数器
#[derive(Default)]
struct RequestCounter {
    value: AtomicU64,
}

impl RequestCounter {
    fn bump(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// 示例服务：每次触发新建的批处理上下文
struct BatchContext {
    started_at: chrono::DateTime<chrono::Utc>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("worker-host-demo")
        .version("1.0.0")
        .about("进程内后台Worker托管示例")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径 (默认查找 config/worker-host.toml)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty", "compact"]),
        )
        .arg(
            Arg::new("run-for")
                .long("run-for")
                .value_name("SECONDS")
                .help("运行指定秒数后自动关闭")
                .value_parser(clap::value_parser!(u64)),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mut config = HostConfig::load(config_path.map(String::as_str))
        .with_context(|| format!("加载配置失败: {:?}", config_path))?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.logging.format = format.parse::<LogFormat>()?;
    }

    init_logging(&config.logging)?;
    info!("启动Worker托管示例");

    let host = WorkerHost::builder()
        .with_config(config)
        .with_services(demo_services())
        .build();
    register_demo_workers(&host)?;

    let run_for = matches.get_one::<u64>("run-for").copied();
    let exit = host
        .run_until(async move {
            match run_for {
                Some(seconds) => {
                    tokio::select! {
                        _ = wait_for_shutdown_signal() => {}
                        _ = tokio::time::sleep(Duration::from_secs(seconds)) => {
                            info!("运行时间到达 {} 秒，自动关闭", seconds);
                        }
                    }
                }
                None => wait_for_shutdown_signal().await,
            }
        })
        .await?;

    for stats in host.stats() {
        info!(
            "Worker {} ({}): 执行 {} 次, 失败 {} 次",
            stats.name, stats.kind, stats.executions, stats.errors
        );
    }

    info!("Worker托管示例已退出: {:?}", exit);
    std::process::exit(exit.exit_code());
}

fn demo_services() -> ServiceContainer {
    let mut container = ServiceContainer::new();
    container.add_singleton(RequestCounter::default());
    container.add_scoped(|_| {
        Ok(BatchContext {
            started_at: chrono::Utc::now(),
        })
    });
    container
}

fn register_demo_workers(host: &WorkerHost) -> Result<()> {
    let registry = host.registry();

    registry
        .register_continuous(|counter: Arc<RequestCounter>, cancel: CancellationToken| async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        info!("心跳 #{}", counter.bump());
                    }
                }
            }
        })?
        .with_name("heartbeat");

    registry
        .register_periodic(
            Duration::from_secs(10),
            |(counter, batch): (Arc<RequestCounter>, Arc<BatchContext>),
             _cancel: CancellationToken| async move {
                let seen = counter.bump();
                if seen % 3 == 0 {
                    return Err(anyhow::anyhow!("第 {} 次请求模拟失败", seen))
                        .exception_type("SimulatedFailure");
                }
                info!("批处理开始于 {}", batch.started_at);
                Ok(())
            },
        )?
        .with_name("batch")
        .with_timeout(Duration::from_secs(3))?
        .with_retry(3, Duration::from_secs(1))?
        .with_error_handler(|err: &WorkerError| {
            warn!("batch 执行失败 ({}): {}", err.exception_type(), err);
        });

    registry
        .register_cron("* * * * *", |(): (), _cancel: CancellationToken| async {
            info!("每分钟报告");
        })?
        .with_name("minutely-report")
        .with_error_handler(|err: &WorkerError| {
            warn!("minutely-report 执行失败: {}", err);
        });

    Ok(())
}
