//! 优先级播报队列
//!
//! - 按优先级升序插入，同优先级保持入队顺序
//! - 队列已有 ≥ quick_drop_threshold 条时 quick 条目直接丢弃
//! - 超出 max_size 时从队尾挤出低优先级条目，其等待方收到 Overflow
//! - skip_if_busy 的条目在队列已满时直接丢弃，任何档位都一样
//! - 单消费者：`processing` 标志保证任意时刻最多一个播报循环；队列空时循环退出，下次入队自动重启
//!
//! 队列由调用方持有（可 Clone 共享），通过 start / stop 控制生命周期。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::capability::{NarrationSink, SpeakOptions};
use crate::config::FeedbackSection;
use crate::core::FeedbackError;
use crate::feedback::types::DeliveryResult;
use crate::feedback::{
    Delivery, EnqueueOptions, FeedbackItem, QueueStatus, Ticket, Tier, TierCounts, TierTable,
};

struct Entry {
    item: FeedbackItem,
    waiter: Option<oneshot::Sender<DeliveryResult>>,
}

impl Entry {
    fn resolve(mut self, result: DeliveryResult) {
        if let Some(tx) = self.waiter.take() {
            let _ = tx.send(result);
        }
    }
}

struct QueueState {
    pending: Vec<Entry>,
    speaking: Option<FeedbackItem>,
    current_stage: Option<String>,
    processing: bool,
    started: bool,
    next_seq: u64,
    cancel: CancellationToken,
}

struct Shared {
    state: Mutex<QueueState>,
    sink: Arc<dyn NarrationSink>,
    tiers: TierTable,
    max_size: usize,
    quick_drop_threshold: usize,
    gap: Duration,
    /// 每次出队 / 播报结束 / 清空时通知 wait_for_stage_completion
    changed: Notify,
}

#[derive(Clone)]
pub struct FeedbackQueue {
    inner: Arc<Shared>,
}

impl FeedbackQueue {
    /// 创建队列（未启动：入队的条目会保留，直到 start）
    pub fn new(sink: Arc<dyn NarrationSink>, config: &FeedbackSection) -> Self {
        Self {
            inner: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    pending: Vec::new(),
                    speaking: None,
                    current_stage: None,
                    processing: false,
                    started: false,
                    next_seq: 0,
                    cancel: CancellationToken::new(),
                }),
                sink,
                tiers: TierTable::from(&config.tiers),
                max_size: config.max_size.max(1),
                quick_drop_threshold: config.quick_drop_threshold,
                gap: Duration::from_millis(config.gap_ms),
                changed: Notify::new(),
            }),
        }
    }

    /// 创建并立即启动
    pub async fn started(sink: Arc<dyn NarrationSink>, config: &FeedbackSection) -> Self {
        let queue = Self::new(sink, config);
        queue.start().await;
        queue
    }

    /// 启动消费循环；已启动时无操作
    pub async fn start(&self) {
        let mut st = self.inner.state.lock().await;
        if st.started {
            return;
        }
        st.started = true;
        self.spawn_if_idle(&mut st);
        tracing::debug!(pending = st.pending.len(), "feedback queue started");
    }

    /// 停止：取消正在播报与等待中的条目（等待方收到 Cancelled）
    pub async fn stop(&self) {
        let cancelled = {
            let mut st = self.inner.state.lock().await;
            st.started = false;
            st.processing = false;
            st.speaking = None;
            st.cancel.cancel();
            st.cancel = CancellationToken::new();
            std::mem::take(&mut st.pending)
        };
        let count = cancelled.len();
        for entry in cancelled {
            entry.resolve(Err(FeedbackError::Cancelled));
        }
        self.inner.changed.notify_waiters();
        tracing::debug!(cancelled = count, "feedback queue stopped");
    }

    /// 按档位默认优先级与时长入队
    pub async fn enqueue(&self, text: impl Into<String>, tier: Tier) -> Ticket {
        self.enqueue_with(text, tier, EnqueueOptions::default()).await
    }

    pub async fn enqueue_with_priority(
        &self,
        text: impl Into<String>,
        tier: Tier,
        priority: u8,
    ) -> Ticket {
        self.enqueue_with(text, tier, EnqueueOptions::default().priority(priority))
            .await
    }

    pub async fn enqueue_with(
        &self,
        text: impl Into<String>,
        tier: Tier,
        options: EnqueueOptions,
    ) -> Ticket {
        let text = text.into();
        let priority = options
            .priority
            .unwrap_or_else(|| self.inner.tiers.priority(tier));
        let max_duration = options
            .max_duration
            .unwrap_or_else(|| self.inner.tiers.max_duration(tier));
        let mut st = self.inner.state.lock().await;

        if tier == Tier::Quick && st.pending.len() >= self.inner.quick_drop_threshold {
            tracing::debug!(queued = st.pending.len(), %text, "quick narration dropped");
            return Ticket::ready(Ok(Delivery::Dropped));
        }
        if options.skip_if_busy && st.pending.len() >= self.inner.max_size {
            tracing::debug!(queued = st.pending.len(), %text, tier = %tier, "queue busy, narration skipped");
            return Ticket::ready(Ok(Delivery::Dropped));
        }

        let seq = st.next_seq;
        st.next_seq += 1;
        let (tx, rx) = oneshot::channel();
        let entry = Entry {
            item: FeedbackItem {
                seq,
                text,
                tier,
                priority,
                max_duration,
                stage: st.current_stage.clone(),
                enqueued_at: Instant::now(),
            },
            waiter: Some(tx),
        };
        let pos = st
            .pending
            .iter()
            .position(|e| e.item.priority > priority)
            .unwrap_or(st.pending.len());
        st.pending.insert(pos, entry);

        let mut evicted_any = false;
        while st.pending.len() > self.inner.max_size {
            if let Some(evicted) = st.pending.pop() {
                tracing::warn!(
                    text = %evicted.item.text,
                    priority = evicted.item.priority,
                    "feedback queue overflow, evicting tail item"
                );
                evicted.resolve(Err(FeedbackError::Overflow));
                evicted_any = true;
            }
        }

        self.spawn_if_idle(&mut st);
        drop(st);
        if evicted_any {
            self.inner.changed.notify_waiters();
        }
        Ticket::pending(rx)
    }

    /// 之后入队的条目带上该阶段标签
    pub async fn set_current_stage(&self, stage: impl Into<String>) {
        self.inner.state.lock().await.current_stage = Some(stage.into());
    }

    /// 等到该阶段的条目既不在队列中也不在播报中；超时返回 false（不视为错误）
    pub async fn wait_for_stage_completion(&self, stage: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.stage_busy(stage).await {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::debug!(stage, "stage wait timed out");
                return false;
            }
        }
    }

    async fn stage_busy(&self, stage: &str) -> bool {
        let st = self.inner.state.lock().await;
        let tagged = |item: &FeedbackItem| item.stage.as_deref() == Some(stage);
        st.pending.iter().any(|e| tagged(&e.item)) || st.speaking.as_ref().is_some_and(tagged)
    }

    /// 移除匹配阶段（None 表示全部）的等待条目，等待方收到 Cancelled；返回移除数量
    pub async fn clear_queue(&self, stage: Option<&str>) -> usize {
        let removed = {
            let mut st = self.inner.state.lock().await;
            let (removed, kept): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut st.pending)
                .into_iter()
                .partition(|e| stage.is_none() || e.item.stage.as_deref() == stage);
            st.pending = kept;
            removed
        };
        let count = removed.len();
        for entry in removed {
            entry.resolve(Err(FeedbackError::Cancelled));
        }
        self.inner.changed.notify_waiters();
        count
    }

    pub async fn status(&self) -> QueueStatus {
        let st = self.inner.state.lock().await;
        let mut by_tier = TierCounts::default();
        for entry in &st.pending {
            by_tier.add(entry.item.tier);
        }
        QueueStatus {
            size: st.pending.len(),
            by_tier,
            current_stage: st.current_stage.clone(),
            is_processing: st.processing,
            current_text: st.speaking.as_ref().map(|i| i.text.clone()),
            items: st.pending.iter().map(|e| e.item.view()).collect(),
        }
    }

    fn spawn_if_idle(&self, st: &mut QueueState) {
        if st.started && !st.processing && !st.pending.is_empty() {
            st.processing = true;
            tokio::spawn(drain(Arc::clone(&self.inner), st.cancel.clone()));
        }
    }
}

/// 消费循环：取队首 → 播报（受条目时长限制）→ 间隔 → 下一条；队列空时退出
async fn drain(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let entry = {
            let mut st = shared.state.lock().await;
            if cancel.is_cancelled() {
                return;
            }
            if st.pending.is_empty() {
                st.processing = false;
                drop(st);
                shared.changed.notify_waiters();
                return;
            }
            let entry = st.pending.remove(0);
            st.speaking = Some(entry.item.clone());
            entry
        };

        let tier = entry.item.tier;
        let options = SpeakOptions {
            tier,
            max_duration: entry.item.max_duration,
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(FeedbackError::Cancelled),
            spoken = tokio::time::timeout(options.max_duration, shared.sink.speak(&entry.item.text, options)) => {
                match spoken {
                    Ok(Ok(())) => Ok(Delivery::Spoken),
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, tier = %tier, "narration sink failed");
                        Err(FeedbackError::Sink(e.to_string()))
                    }
                    Err(_) => {
                        tracing::debug!(tier = %tier, "narration exceeded tier duration");
                        Ok(Delivery::Truncated)
                    }
                }
            }
        };
        entry.resolve(result);

        let more = {
            let mut st = shared.state.lock().await;
            if cancel.is_cancelled() {
                return;
            }
            st.speaking = None;
            !st.pending.is_empty()
        };
        shared.changed.notify_waiters();

        if more && !shared.gap.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(shared.gap) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::mock::RecordingSink;

    fn config(max_size: usize) -> FeedbackSection {
        FeedbackSection {
            max_size,
            gap_ms: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_dequeue_order_is_priority_then_fifo() {
        let sink = Arc::new(RecordingSink::new());
        let queue = FeedbackQueue::new(sink.clone(), &config(10));
        let mut tickets = Vec::new();
        tickets.push(queue.enqueue("n1", Tier::Normal).await);
        tickets.push(queue.enqueue("d1", Tier::Detailed).await);
        tickets.push(queue.enqueue("n2", Tier::Normal).await);
        tickets.push(queue.enqueue_with_priority("urgent", Tier::Normal, 0).await);
        tickets.push(queue.enqueue("d2", Tier::Detailed).await);

        queue.start().await;
        for ticket in tickets {
            assert_eq!(ticket.wait().await, Ok(Delivery::Spoken));
        }
        assert_eq!(sink.texts(), vec!["urgent", "n1", "n2", "d1", "d2"]);
    }

    #[tokio::test]
    async fn test_quick_dropped_when_two_items_queued() {
        let sink = Arc::new(RecordingSink::new());
        let queue = FeedbackQueue::new(sink.clone(), &config(5));
        let first = queue.enqueue("q1", Tier::Quick).await;
        queue.enqueue("n1", Tier::Normal).await;
        let dropped = queue.enqueue("q2", Tier::Quick).await;
        assert_eq!(dropped.wait().await, Ok(Delivery::Dropped));
        assert_eq!(queue.status().await.size, 2);

        queue.start().await;
        assert_eq!(first.wait().await, Ok(Delivery::Spoken));
        assert!(queue.wait_for_stage_completion("none", Duration::from_secs(1)).await);
        assert!(!sink.texts().contains(&"q2".to_string()));
    }

    #[tokio::test]
    async fn test_overflow_evicts_lowest_priority_tail() {
        let sink = Arc::new(RecordingSink::new());
        let queue = FeedbackQueue::new(sink.clone(), &config(3));
        let d1 = queue.enqueue("d1", Tier::Detailed).await;
        let d2 = queue.enqueue("d2", Tier::Detailed).await;
        let _n1 = queue.enqueue("n1", Tier::Normal).await;
        let _n2 = queue.enqueue("n2", Tier::Normal).await;

        assert_eq!(d2.wait().await, Err(FeedbackError::Overflow));
        let status = queue.status().await;
        assert_eq!(status.size, 3);
        let texts: Vec<_> = status.items.iter().map(|i| i.text.as_str()).collect();
        assert_eq!(texts, vec!["n1", "n2", "d1"]);
        drop(d1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_eviction_wakes_stage_waiter() {
        let sink = Arc::new(RecordingSink::new());
        let queue = FeedbackQueue::new(sink, &config(1));
        queue.set_current_stage("old").await;
        let evicted = queue.enqueue("detail", Tier::Detailed).await;

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let started = tokio::time::Instant::now();
                let done = queue
                    .wait_for_stage_completion("old", Duration::from_secs(10))
                    .await;
                (done, started.elapsed())
            })
        };
        tokio::task::yield_now().await;

        queue.set_current_stage("new").await;
        queue.enqueue("normal", Tier::Normal).await;
        assert_eq!(evicted.wait().await, Err(FeedbackError::Overflow));

        let (done, elapsed) = waiter.await.unwrap();
        assert!(done);
        assert!(elapsed < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_skip_if_busy_drops_any_tier_when_full() {
        let sink = Arc::new(RecordingSink::new());
        let queue = FeedbackQueue::new(sink, &config(2));
        let busy = EnqueueOptions::default().skip_if_busy();
        let first = queue.enqueue_with("first", Tier::Normal, busy).await;
        let _d1 = queue.enqueue("d1", Tier::Detailed).await;

        let skipped = queue.enqueue_with("n2", Tier::Normal, busy).await;
        assert_eq!(skipped.wait().await, Ok(Delivery::Dropped));
        // 队列已满时即使优先级更高也不挤出别人
        let urgent = queue
            .enqueue_with("urgent", Tier::Detailed, busy.priority(0))
            .await;
        assert_eq!(urgent.wait().await, Ok(Delivery::Dropped));

        let texts: Vec<_> = queue
            .status()
            .await
            .items
            .into_iter()
            .map(|i| i.text)
            .collect();
        assert_eq!(texts, vec!["first", "d1"]);
        drop(first);
    }

    #[tokio::test]
    async fn test_alternating_quick_and_detailed_stays_bounded_and_sorted() {
        let sink = Arc::new(RecordingSink::new());
        let queue = FeedbackQueue::new(sink, &config(5));
        for i in 0..7 {
            let tier = if i % 2 == 0 { Tier::Quick } else { Tier::Detailed };
            queue.enqueue(format!("item {i}"), tier).await;
        }
        let status = queue.status().await;
        assert!(status.size <= 5);
        let priorities: Vec<u8> = status.items.iter().map(|i| i.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort();
        assert_eq!(priorities, sorted);
        assert_eq!(status.by_tier.quick, 1);
        assert_eq!(status.by_tier.detailed, 3);
    }

    #[tokio::test]
    async fn test_clear_queue_by_stage_cancels_waiters() {
        let sink = Arc::new(RecordingSink::new());
        let queue = FeedbackQueue::new(sink, &config(5));
        queue.set_current_stage("item-1:execute").await;
        let a = queue.enqueue("a", Tier::Normal).await;
        queue.set_current_stage("item-1:verify").await;
        let _b = queue.enqueue("b", Tier::Normal).await;

        assert_eq!(queue.clear_queue(Some("item-1:execute")).await, 1);
        assert_eq!(a.wait().await, Err(FeedbackError::Cancelled));
        let status = queue.status().await;
        assert_eq!(status.size, 1);
        assert_eq!(status.current_stage.as_deref(), Some("item-1:verify"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_wait_times_out_without_consumer() {
        let sink = Arc::new(RecordingSink::new());
        let queue = FeedbackQueue::new(sink, &config(5));
        queue.set_current_stage("s").await;
        queue.enqueue("waiting", Tier::Normal).await;
        assert!(!queue.wait_for_stage_completion("s", Duration::from_millis(50)).await);

        queue.start().await;
        assert!(queue.wait_for_stage_completion("s", Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sink_is_truncated_at_tier_duration() {
        let sink = Arc::new(RecordingSink::with_delay(Duration::from_secs(10)));
        let queue = FeedbackQueue::started(sink, &config(5)).await;
        let ticket = queue.enqueue("long", Tier::Quick).await;
        assert_eq!(ticket.wait().await, Ok(Delivery::Truncated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_item_duration_overrides_tier() {
        let sink = Arc::new(RecordingSink::with_delay(Duration::from_secs(1)));
        let queue = FeedbackQueue::started(sink, &config(5)).await;
        let started = tokio::time::Instant::now();
        let ticket = queue
            .enqueue_with(
                "summary",
                Tier::Detailed,
                EnqueueOptions::default().max_duration(Duration::from_millis(50)),
            )
            .await;
        assert_eq!(ticket.wait().await, Ok(Delivery::Truncated));
        assert!(started.elapsed() < Duration::from_millis(500));

        let full = queue.enqueue("summary", Tier::Detailed).await;
        assert_eq!(full.wait().await, Ok(Delivery::Spoken));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_and_in_flight() {
        let sink = Arc::new(RecordingSink::with_delay(Duration::from_millis(500)));
        let queue = FeedbackQueue::started(sink, &config(5)).await;
        let speaking = queue.enqueue("one", Tier::Detailed).await;
        let waiting = queue.enqueue("two", Tier::Detailed).await;
        tokio::task::yield_now().await;

        queue.stop().await;
        assert_eq!(waiting.wait().await, Err(FeedbackError::Cancelled));
        assert_eq!(speaking.wait().await, Err(FeedbackError::Cancelled));
        assert!(!queue.status().await.is_processing);
    }
}
