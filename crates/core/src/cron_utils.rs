use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

use crate::errors::{WorkerError, WorkerResult};

/// CRON表达式解析和调度工具
///
/// 接受标准5字段表达式（分 时 日 月 周），自动补齐秒字段；6/7字段表达式原样解析。
#[derive(Debug, Clone)]
pub struct CronScheduler {
    expression: String,
    schedule: Schedule,
}

impl CronScheduler {
    /// 创建新的CRON调度器
    pub fn new(cron_expr: &str) -> WorkerResult<Self> {
        let normalized = Self::normalize(cron_expr)?;
        let schedule = Schedule::from_str(&normalized).map_err(|e| WorkerError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            expression: cron_expr.trim().to_string(),
            schedule,
        })
    }

    /// 注册时提供的原始表达式
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// 获取严格晚于 `from` 的下一次执行时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    /// 获取从指定时间开始的多个执行时间
    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&from).take(count).collect()
    }

    /// 计算下次执行时间距离现在的时长
    pub fn time_until_next_execution(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next_execution_time(now).map(|next| next - now)
    }

    /// 验证CRON表达式是否有效
    pub fn validate_cron_expression(cron_expr: &str) -> WorkerResult<()> {
        Self::new(cron_expr).map(|_| ())
    }

    fn normalize(cron_expr: &str) -> WorkerResult<String> {
        let trimmed = cron_expr.trim();
        if trimmed.is_empty() {
            return Err(WorkerError::Configuration(
                "CRON表达式不能为空".to_string(),
            ));
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() == 5 {
            Ok(format!("0 {}", fields.join(" ")))
        } else {
            Ok(fields.join(" "))
        }
    }
}

impl std::fmt::Display for CronScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_cron_scheduler_creation() {
        assert!(CronScheduler::new("0 0 0 * * *").is_ok());
        assert!(CronScheduler::new("*/5 * * * *").is_ok());
        assert!(CronScheduler::new("invalid").is_err());
    }

    #[test]
    fn test_empty_expression_is_configuration_error() {
        assert!(matches!(
            CronScheduler::new(""),
            Err(WorkerError::Configuration(_))
        ));
        assert!(matches!(
            CronScheduler::new("   \t "),
            Err(WorkerError::Configuration(_))
        ));
    }

    #[test]
    fn test_unparseable_expression_is_invalid_cron() {
        match CronScheduler::new("0 0 0 32 * *") {
            Err(WorkerError::InvalidCron { expr, .. }) => assert_eq!(expr, "0 0 0 32 * *"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_five_field_expression_every_five_minutes() {
        let scheduler = CronScheduler::new("*/5 * * * *").unwrap();
        assert_eq!(scheduler.expression(), "*/5 * * * *");

        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let upcoming = scheduler.upcoming_times(start, 6);
        let minutes: Vec<u32> = upcoming.iter().map(|t| t.minute()).collect();
        assert_eq!(minutes, vec![5, 10, 15, 20, 25, 30]);
        assert!(upcoming.iter().all(|t| t.second() == 0));
    }

    #[test]
    fn test_next_execution_time_is_strictly_after() {
        let scheduler = CronScheduler::new("0 0 * * * *").unwrap();

        let on_the_hour = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let next = scheduler.next_execution_time(on_the_hour).unwrap();
        assert_eq!(next.hour(), 13);
    }

    #[test]
    fn test_time_until_next_execution() {
        let scheduler = CronScheduler::new("0 0 * * * *").unwrap();

        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap();
        let duration = scheduler.time_until_next_execution(now).unwrap();
        assert_eq!(duration.num_minutes(), 30);
    }

    #[test]
    fn test_validate_cron_expression() {
        assert!(CronScheduler::validate_cron_expression("0 */5 * * * *").is_ok());
        assert!(CronScheduler::validate_cron_expression("0 0 9-17 * * 1-5").is_ok());
        assert!(CronScheduler::validate_cron_expression("").is_err());
    }
}
