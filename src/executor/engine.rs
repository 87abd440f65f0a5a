//! 执行引擎
//!
//! - create_plan：Planner 出草稿 → 校验 → 记入活动计划
//! - run：按顺序处理条目（依赖未满足则跳过），每个条目交给 RecoveryMachine，结束后生成 Summary 并归档
//!
//! 计划只由引擎修改；能力调用拿到的都是快照。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::capability::{
    Adjuster, CapabilityGate, Planner, Replanner, ToolExecutor, ToolPlanner, Verifier,
};
use crate::config::EngineSection;
use crate::core::{CapabilityError, PlanError};
use crate::executor::pacing::CallPacer;
use crate::executor::recovery::{Narrator, PlanRun, RecoveryMachine, RecoverySettings};
use crate::executor::Summary;
use crate::feedback::{FeedbackQueue, QueueStatus, Tier};
use crate::plan::{build_plan, ItemStatus, Plan, PlanId, PlanLimits};

/// 引擎依赖的全部外部能力
#[derive(Clone)]
pub struct Capabilities {
    pub planner: Arc<dyn Planner>,
    pub tool_planner: Arc<dyn ToolPlanner>,
    pub executor: Arc<dyn ToolExecutor>,
    pub verifier: Arc<dyn Verifier>,
    pub adjuster: Arc<dyn Adjuster>,
    pub replanner: Arc<dyn Replanner>,
}

#[derive(Default)]
struct PlanBook {
    active: HashMap<PlanId, Plan>,
    completed: HashMap<PlanId, Plan>,
}

pub struct ExecutionEngine {
    planner: Arc<dyn Planner>,
    recovery: RecoveryMachine,
    feedback: FeedbackQueue,
    narrator: Narrator,
    limits: PlanLimits,
    pacer: Arc<CallPacer>,
    capability_timeout: Duration,
    plans: RwLock<PlanBook>,
}

impl ExecutionEngine {
    pub fn new(capabilities: Capabilities, feedback: FeedbackQueue, config: &EngineSection) -> Self {
        let pacer = Arc::new(CallPacer::new(Duration::from_millis(config.min_call_interval_ms)));
        let narrator = Narrator::new(feedback.clone(), config);
        let settings = RecoverySettings::from(config);
        let capability_timeout = settings.capability_timeout;
        let recovery = RecoveryMachine {
            tool_planner: capabilities.tool_planner,
            executor: capabilities.executor,
            verifier: capabilities.verifier,
            adjuster: capabilities.adjuster,
            replanner: capabilities.replanner,
            gate: None,
            settings,
            pacer: Arc::clone(&pacer),
            narrator: narrator.clone(),
        };
        Self {
            planner: capabilities.planner,
            recovery,
            feedback,
            narrator,
            limits: PlanLimits::from(config),
            pacer,
            capability_timeout,
            plans: RwLock::new(PlanBook::default()),
        }
    }

    /// 启用能力组筛选门
    pub fn with_gate(mut self, gate: CapabilityGate) -> Self {
        self.recovery.gate = Some(gate);
        self
    }

    pub fn feedback(&self) -> &FeedbackQueue {
        &self.feedback
    }

    /// 请求 → 已校验的计划；结构错误是致命的，不返回部分计划
    pub async fn create_plan(
        &self,
        request: &str,
        context: &serde_json::Value,
    ) -> Result<Plan, PlanError> {
        self.pacer.pace().await;
        let raw = tokio::time::timeout(self.capability_timeout, self.planner.create_plan(request, context))
            .await
            .unwrap_or_else(|_| Err(CapabilityError::Timeout("planner".to_string())))?;

        let plan = build_plan(raw, request, &self.limits).map_err(|e| {
            tracing::warn!(error = %e, "plan rejected");
            e
        })?;
        tracing::info!(
            plan_id = %plan.id,
            mode = %plan.mode,
            items = plan.items.len(),
            complexity = plan.complexity_score,
            "plan created"
        );
        self.narrator
            .say(
                format!("plan-{}:created", plan.id),
                format!("Plan ready with {} steps", plan.items.len()),
                Tier::Detailed,
            )
            .await;

        self.plans
            .write()
            .await
            .active
            .insert(plan.id.clone(), plan.clone());
        Ok(plan)
    }

    /// 执行计划直到全部条目到达终态；逐条目失败都收进 Summary，不会向调用方抛出
    pub async fn run(&self, mut plan: Plan) -> Summary {
        let started = Instant::now();
        tracing::info!(plan_id = %plan.id, items = plan.items.len(), "plan execution started");

        let mut run = PlanRun::new(&mut plan);
        while let Some(slot) = run.work.next() {
            run.execution.current_index += 1;
            if let Some(dep) = run.work.unmet_dependency(slot) {
                let item = run.work.item_mut(slot);
                tracing::info!(item_id = item.id, dependency = dep, "dependency not completed, skipping");
                item.finish(
                    ItemStatus::Skipped,
                    Some(format!("dependency {dep} not completed")),
                );
                continue;
            }
            let outcome = self.recovery.run_item(&mut run, slot).await;
            tracing::debug!(outcome = ?outcome, "item processed");
        }
        run.finish_into(&mut plan);

        let summary = Summary::from_plan(&plan, started.elapsed());
        tracing::info!(
            plan_id = %plan.id,
            success_rate = summary.success_rate,
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            aborted = summary.aborted,
            "plan execution finished"
        );
        self.narrator
            .say(format!("plan-{}:summary", plan.id), summary.narration(), Tier::Detailed)
            .await;

        let mut book = self.plans.write().await;
        book.active.remove(&plan.id);
        book.completed.insert(plan.id.clone(), plan);
        summary
    }

    pub async fn get_queue_status(&self) -> QueueStatus {
        self.feedback.status().await
    }

    pub async fn set_current_stage(&self, stage: impl Into<String>) {
        self.feedback.set_current_stage(stage).await;
    }

    pub async fn wait_for_stage_completion(&self, stage: &str, timeout: Duration) -> bool {
        self.feedback.wait_for_stage_completion(stage, timeout).await
    }

    pub async fn active_plan_ids(&self) -> Vec<PlanId> {
        self.plans.read().await.active.keys().cloned().collect()
    }

    /// 已归档计划（执行后的最终状态）
    pub async fn completed_plan(&self, id: &str) -> Option<Plan> {
        self.plans.read().await.completed.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::mock::{
        EchoToolExecutor, FixedAdjuster, FixedReplanner, RecordingSink, ScriptedVerifier,
        StaticPlanner, StaticToolPlanner,
    };
    use crate::config::FeedbackSection;
    use crate::plan::{PlanMode, RawItem, RawPlan};

    fn capabilities(raw: RawPlan) -> Capabilities {
        Capabilities {
            planner: Arc::new(StaticPlanner::new(raw)),
            tool_planner: Arc::new(StaticToolPlanner::new()),
            executor: Arc::new(EchoToolExecutor::new()),
            verifier: Arc::new(ScriptedVerifier::new()),
            adjuster: Arc::new(FixedAdjuster::retry()),
            replanner: Arc::new(FixedReplanner::skip()),
        }
    }

    fn config() -> EngineSection {
        EngineSection {
            retry_backoff_base_ms: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_plan_archives_after_run() {
        let raw = RawPlan {
            mode: Some(PlanMode::Standard),
            complexity: None,
            items: vec![RawItem::new("a", "ok"), RawItem::new("b", "ok")],
        };
        let sink = Arc::new(RecordingSink::new());
        let feedback = FeedbackQueue::new(sink, &FeedbackSection::default());
        let engine = ExecutionEngine::new(capabilities(raw), feedback, &config());

        let plan = engine.create_plan("do a and b", &serde_json::json!({})).await.unwrap();
        assert_eq!(engine.active_plan_ids().await, vec![plan.id.clone()]);

        let id = plan.id.clone();
        let summary = engine.run(plan).await;
        assert_eq!(summary.success_rate, 100);
        assert!(engine.active_plan_ids().await.is_empty());
        let archived = engine.completed_plan(&id).await.unwrap();
        assert!(archived.is_finished());
        assert_eq!(archived.execution.completed_items, 2);
    }

    #[tokio::test]
    async fn test_create_plan_propagates_planner_failure() {
        let mut caps = capabilities(RawPlan::default());
        caps.planner = Arc::new(StaticPlanner::failing(CapabilityError::Unavailable(
            "offline".to_string(),
        )));
        let feedback = FeedbackQueue::new(Arc::new(RecordingSink::new()), &FeedbackSection::default());
        let engine = ExecutionEngine::new(caps, feedback, &config());
        let err = engine.create_plan("x", &serde_json::Value::Null).await.unwrap_err();
        assert!(matches!(err, PlanError::Planner(CapabilityError::Unavailable(_))));
        assert!(engine.active_plan_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_final_summary_narration_is_detailed() {
        let raw = RawPlan {
            mode: None,
            complexity: None,
            items: vec![RawItem::new("a", "ok")],
        };
        let sink = Arc::new(RecordingSink::new());
        let feedback = FeedbackQueue::started(
            sink.clone(),
            &FeedbackSection {
                gap_ms: 0,
                ..Default::default()
            },
        )
        .await;
        let engine = ExecutionEngine::new(capabilities(raw), feedback, &config());
        let plan = engine.create_plan("a", &serde_json::json!({})).await.unwrap();
        let id = plan.id.clone();
        engine.run(plan).await;

        let stage = format!("plan-{id}:summary");
        assert!(engine.wait_for_stage_completion(&stage, Duration::from_secs(5)).await);
        let records = sink.records();
        let (text, tier) = records.last().unwrap();
        assert!(text.starts_with("Plan finished: 100%"));
        assert_eq!(*tier, Tier::Detailed);
    }
}
