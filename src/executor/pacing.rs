//! 调用节流与重试退避

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::EngineSection;

/// 重试退避：第 n 次尝试（n > 1）前等待 min(base * 2^(n-2), max)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn from_config(engine: &EngineSection) -> Self {
        Self {
            base: Duration::from_millis(engine.retry_backoff_base_ms),
            max: Duration::from_millis(engine.retry_backoff_max_ms),
        }
    }

    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 || self.base.is_zero() {
            return Duration::ZERO;
        }
        let exp = (attempt - 2).min(16);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }
}

/// 决策类能力调用之间的最小间隔
#[derive(Debug)]
pub struct CallPacer {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl CallPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// 距上次调用不足 min_interval 时等待补足
    pub async fn pace(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_interval;
            if ready_at > Instant::now() {
                tracing::debug!(wait_ms = (ready_at - Instant::now()).as_millis() as u64, "pacing capability call");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}
