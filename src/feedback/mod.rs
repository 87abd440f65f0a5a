//! 反馈队列：按优先级排序、有界、单消费者的播报邮箱

pub mod queue;
pub mod types;

pub use queue::FeedbackQueue;
pub use types::{
    Delivery, EnqueueOptions, FeedbackItem, FeedbackItemView, QueueStatus, Ticket, Tier, TierCounts, TierTable,
};
