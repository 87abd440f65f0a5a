//! 执行总结：计数、成功率、各条目原因与语气

use std::time::Duration;

use serde::Serialize;

use crate::plan::{ItemId, ItemStatus, Plan, PlanId, PlanItem};

/// 成功率整数百分比（四舍五入）；空计划为 0
pub fn success_rate(completed: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    ((completed * 100 + total / 2) / total) as u32
}

/// 总结语气
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    /// ≥80%
    Positive,
    /// 50-79%
    Neutral,
    /// <50%
    Critical,
}

impl Tone {
    pub fn for_rate(rate: u32) -> Self {
        match rate {
            80.. => Tone::Positive,
            50..=79 => Tone::Neutral,
            _ => Tone::Critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemReport {
    pub id: ItemId,
    pub action: String,
    pub attempts: u32,
    pub reason: Option<String>,
}

impl ItemReport {
    fn from_item(item: &PlanItem) -> Self {
        let reason = item.status_reason.clone().or_else(|| {
            item.verification
                .as_ref()
                .map(|v| v.reason.clone())
                .filter(|r| !r.is_empty())
        });
        Self {
            id: item.id,
            action: item.action.clone(),
            attempts: item.attempt,
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub plan_id: PlanId,
    pub request: String,
    pub total_items: usize,
    pub completed: Vec<ItemReport>,
    pub failed: Vec<ItemReport>,
    pub skipped: Vec<ItemReport>,
    pub success_rate: u32,
    pub total_attempts: u32,
    pub replans: u32,
    pub aborted: bool,
    pub tone: Tone,
    pub duration_ms: u64,
    /// 已完成条目的验证结论
    pub key_results: Vec<String>,
    /// 失败条目的原因
    pub issues: Vec<String>,
}

impl Summary {
    pub fn from_plan(plan: &Plan, elapsed: Duration) -> Self {
        let reports = |status: ItemStatus| -> Vec<ItemReport> {
            plan.items
                .iter()
                .filter(|i| i.status == status)
                .map(ItemReport::from_item)
                .collect()
        };
        let completed = reports(ItemStatus::Completed);
        let failed = reports(ItemStatus::Failed);
        let skipped = reports(ItemStatus::Skipped);
        let rate = success_rate(completed.len(), plan.items.len());

        let key_results = plan
            .items
            .iter()
            .filter(|i| i.status == ItemStatus::Completed)
            .filter_map(|i| {
                i.verification
                    .as_ref()
                    .map(|v| format!("{}: {}", i.action, v.reason))
            })
            .collect();
        let issues = failed
            .iter()
            .map(|r| {
                format!(
                    "{}: {}",
                    r.action,
                    r.reason.as_deref().unwrap_or("no reason recorded")
                )
            })
            .collect();

        Self {
            plan_id: plan.id.clone(),
            request: plan.original_request.clone(),
            total_items: plan.items.len(),
            completed,
            failed,
            skipped,
            success_rate: rate,
            total_attempts: plan.execution.total_attempts,
            replans: plan.execution.replans,
            aborted: plan.aborted,
            tone: Tone::for_rate(rate),
            duration_ms: elapsed.as_millis() as u64,
            key_results,
            issues,
        }
    }

    /// 最终 detailed 播报
    pub fn narration(&self) -> String {
        let mut text = format!(
            "Plan finished: {}% successful ({} of {} items completed)",
            self.success_rate,
            self.completed.len(),
            self.total_items
        );
        if self.aborted {
            text.push_str(", aborted");
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ExecutionState, PlanMode};

    #[test]
    fn test_success_rate_rounds() {
        assert_eq!(success_rate(2, 3), 67);
        assert_eq!(success_rate(1, 3), 33);
        assert_eq!(success_rate(1, 2), 50);
        assert_eq!(success_rate(3, 3), 100);
        assert_eq!(success_rate(0, 0), 0);
    }

    #[test]
    fn test_tone_thresholds() {
        assert_eq!(Tone::for_rate(100), Tone::Positive);
        assert_eq!(Tone::for_rate(80), Tone::Positive);
        assert_eq!(Tone::for_rate(79), Tone::Neutral);
        assert_eq!(Tone::for_rate(50), Tone::Neutral);
        assert_eq!(Tone::for_rate(49), Tone::Critical);
    }

    #[test]
    fn test_summary_from_plan() {
        let mut items = vec![
            PlanItem::new(1, "a", "ok"),
            PlanItem::new(2, "b", "ok"),
            PlanItem::new(3, "c", "ok"),
        ];
        items[0].finish(ItemStatus::Completed, None);
        items[1].finish(ItemStatus::Failed, Some("disk full".to_string()));
        items[2].finish(ItemStatus::Skipped, Some("dependency 2 not completed".to_string()));
        let plan = Plan {
            id: "p".to_string(),
            original_request: "req".to_string(),
            mode: PlanMode::Standard,
            complexity_score: 2,
            items,
            execution: ExecutionState {
                total_attempts: 4,
                ..Default::default()
            },
            aborted: false,
            created_at: chrono::Utc::now(),
        };
        let summary = Summary::from_plan(&plan, Duration::from_millis(12));
        assert_eq!(summary.success_rate, 33);
        assert_eq!(summary.tone, Tone::Critical);
        assert_eq!(summary.total_attempts, 4);
        assert_eq!(summary.issues, vec!["b: disk full"]);
        assert_eq!(summary.skipped[0].reason.as_deref(), Some("dependency 2 not completed"));
        assert!(summary.narration().contains("33%"));
    }
}
