//! 反馈队列数据：播报档位、队列条目、投递回执与状态快照

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::config::TierSection;
use crate::core::FeedbackError;

/// 播报档位：决定最长播报时长与默认优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// ≤200ms，队列拥挤时直接丢弃
    Quick,
    Normal,
    /// ≤3000ms，最终总结等
    Detailed,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Quick => write!(f, "quick"),
            Tier::Normal => write!(f, "normal"),
            Tier::Detailed => write!(f, "detailed"),
        }
    }
}

/// 三档的时长与优先级表（来自 [feedback.tiers]）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierTable {
    quick: (Duration, u8),
    normal: (Duration, u8),
    detailed: (Duration, u8),
}

impl TierTable {
    pub fn max_duration(&self, tier: Tier) -> Duration {
        self.entry(tier).0
    }

    /// 数字越小越优先
    pub fn priority(&self, tier: Tier) -> u8 {
        self.entry(tier).1
    }

    fn entry(&self, tier: Tier) -> (Duration, u8) {
        match tier {
            Tier::Quick => self.quick,
            Tier::Normal => self.normal,
            Tier::Detailed => self.detailed,
        }
    }
}

impl From<&TierSection> for TierTable {
    fn from(t: &TierSection) -> Self {
        Self {
            quick: (Duration::from_millis(t.quick_ms), t.quick_priority),
            normal: (Duration::from_millis(t.normal_ms), t.normal_priority),
            detailed: (Duration::from_millis(t.detailed_ms), t.detailed_priority),
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::from(&TierSection::default())
    }
}

/// 单次入队的选项，未设置的项取档位默认值
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub priority: Option<u8>,
    /// 覆盖档位的最长播报时长
    pub max_duration: Option<Duration>,
    /// 队列已满（size >= max_size）时直接丢弃，不挤出其他条目；对任何档位生效
    pub skip_if_busy: bool,
}

impl EnqueueOptions {
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    pub fn skip_if_busy(mut self) -> Self {
        self.skip_if_busy = true;
        self
    }
}

/// 队列中的一条播报
#[derive(Debug, Clone)]
pub struct FeedbackItem {
    /// 入队序号，同优先级按它保持 FIFO
    pub seq: u64,
    pub text: String,
    pub tier: Tier,
    pub priority: u8,
    pub max_duration: Duration,
    pub stage: Option<String>,
    pub enqueued_at: Instant,
}

impl FeedbackItem {
    pub fn view(&self) -> FeedbackItemView {
        FeedbackItemView {
            text: self.text.clone(),
            tier: self.tier,
            priority: self.priority,
            stage: self.stage.clone(),
            age_ms: self.enqueued_at.elapsed().as_millis() as u64,
        }
    }
}

/// 播报结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Spoken,
    /// 播报超过档位时长，已停止等待
    Truncated,
    /// 因队列拥挤未入队（quick 档，或设置了 skip_if_busy）
    Dropped,
}

pub(crate) type DeliveryResult = Result<Delivery, FeedbackError>;

/// 投递回执：生产者可以选择等待播报结果，也可以直接丢弃
#[derive(Debug)]
pub struct Ticket(TicketState);

#[derive(Debug)]
enum TicketState {
    Ready(DeliveryResult),
    Pending(oneshot::Receiver<DeliveryResult>),
}

impl Ticket {
    pub(crate) fn ready(result: DeliveryResult) -> Self {
        Self(TicketState::Ready(result))
    }

    pub(crate) fn pending(rx: oneshot::Receiver<DeliveryResult>) -> Self {
        Self(TicketState::Pending(rx))
    }

    pub async fn wait(self) -> DeliveryResult {
        match self.0 {
            TicketState::Ready(result) => result,
            TicketState::Pending(rx) => rx.await.unwrap_or(Err(FeedbackError::Closed)),
        }
    }
}

/// 每档条目数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub quick: usize,
    pub normal: usize,
    pub detailed: usize,
}

impl TierCounts {
    pub(crate) fn add(&mut self, tier: Tier) {
        match tier {
            Tier::Quick => self.quick += 1,
            Tier::Normal => self.normal += 1,
            Tier::Detailed => self.detailed += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedbackItemView {
    pub text: String,
    pub tier: Tier,
    pub priority: u8,
    pub stage: Option<String>,
    pub age_ms: u64,
}

/// 队列状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// 等待中的条目数（不含正在播报的）
    pub size: usize,
    pub by_tier: TierCounts,
    pub current_stage: Option<String>,
    pub is_processing: bool,
    /// 正在播报的文本
    pub current_text: Option<String>,
    pub items: Vec<FeedbackItemView>,
}
