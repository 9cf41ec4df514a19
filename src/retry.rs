use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// 外部调用的重试策略
///
/// 所有外部调用（媒体命令、评分 oracle）默认只重试一次，且在每次重试前按指数退避等待。
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 最大重试次数（不含首次调用）
    pub max_retries: u32,
    /// 退避基准时长，每次重试翻倍
    pub base_delay: Duration,
    /// 单次等待上限
    pub max_delay: Duration,
    /// 用于日志的操作名
    pub operation_name: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            operation_name: "operation".to_string(),
        }
    }
}

impl RetryConfig {
    pub fn new(operation_name: impl Into<String>) -> Self {
        Self {
            operation_name: operation_name.into(),
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        delay.min(self.max_delay)
    }
}

/// 带重试地执行异步操作
///
/// `should_retry` 返回 false 的错误会立即返回，不再消耗重试次数。
pub async fn retry_async<F, Fut, T, E, P>(
    config: &RetryConfig,
    should_retry: P,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < config.max_retries && should_retry(&e) => {
                attempt += 1;
                let delay = config.delay_for_attempt(attempt);
                debug!(
                    "🔁 [重试] {} 第 {} 次失败，{:?} 后重试: {}",
                    config.operation_name, attempt, delay, e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if attempt > 0 {
                    warn!(
                        "⚠️  [重试] {} 在 {} 次尝试后仍然失败: {}",
                        config.operation_name,
                        attempt + 1,
                        e
                    );
                }
                return Err(e);
            }
        }
    }
}
