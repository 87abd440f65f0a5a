//! 条目级恢复状态机
//!
//! Planning → Executing → Verifying → {Completed | AdjustAndRetry | DeepReplan | Skipped}
//!
//! 每次尝试：规划工具 → 执行 → 验证。未通过且还有尝试次数时交给 Adjuster（retry / modify / split / skip），
//! 尝试耗尽后交给 Replanner（replan_and_continue / skip_and_continue / abort）。
//! 能力调用失败按一次验证失败处理，只有重规划阶段的失败退化为 skip_and_continue。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::capability::{
    AdjustStrategy, Adjuster, CapabilityGate, ExecutionResult, FailureContext, PlanContext,
    PlanView, ReplanDecision, ReplanStrategy, Replanner, ToolExecutor, ToolInvocationPlan,
    ToolPlanner, Verification, Verifier,
};
use crate::config::EngineSection;
use crate::core::CapabilityError;
use crate::executor::pacing::{Backoff, CallPacer};
use crate::feedback::{FeedbackQueue, Tier};
use crate::plan::{
    build_inserted_items, ExecutionState, ItemId, ItemStatus, Plan, PlanId, PlanMode, Slot,
    WorkQueue,
};

/// 恢复相关的配置
#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub backoff: Backoff,
    pub capability_timeout: Duration,
    pub max_replans: u32,
    pub enforce_skip_policy: bool,
    pub default_max_attempts: u32,
}

impl From<&EngineSection> for RecoverySettings {
    fn from(engine: &EngineSection) -> Self {
        Self {
            backoff: Backoff::from_config(engine),
            capability_timeout: Duration::from_secs(engine.capability_timeout_secs.max(1)),
            max_replans: engine.max_replans_per_plan,
            enforce_skip_policy: engine.enforce_skip_policy,
            default_max_attempts: engine.default_max_attempts.max(1),
        }
    }
}

/// 给条目各阶段打标签并入队播报；sync 时等待该阶段播报完成
#[derive(Clone)]
pub(crate) struct Narrator {
    feedback: FeedbackQueue,
    sync: bool,
    stage_timeout: Duration,
}

impl Narrator {
    pub(crate) fn new(feedback: FeedbackQueue, engine: &EngineSection) -> Self {
        Self {
            feedback,
            sync: engine.sync_narration,
            stage_timeout: Duration::from_millis(engine.stage_wait_timeout_ms),
        }
    }

    pub(crate) async fn say(&self, stage: String, text: impl Into<String>, tier: Tier) {
        self.feedback.set_current_stage(stage.clone()).await;
        let _ticket = self.feedback.enqueue(text, tier).await;
        if self.sync && !self.feedback.wait_for_stage_completion(&stage, self.stage_timeout).await {
            tracing::debug!(stage = %stage, "narration still pending, continuing");
        }
    }
}

fn stage_tag(id: ItemId, stage: &str) -> String {
    format!("item-{id}:{stage}")
}

/// 一次 run 的可变状态，只由引擎持有
pub(crate) struct PlanRun {
    pub plan_id: PlanId,
    pub request: String,
    pub mode: PlanMode,
    pub work: WorkQueue,
    pub execution: ExecutionState,
    pub aborted: bool,
}

impl PlanRun {
    pub(crate) fn new(plan: &mut Plan) -> Self {
        Self {
            plan_id: plan.id.clone(),
            request: plan.original_request.clone(),
            mode: plan.mode,
            work: WorkQueue::new(std::mem::take(&mut plan.items)),
            execution: plan.execution.clone(),
            aborted: plan.aborted,
        }
    }

    /// 把条目与计数写回计划
    pub(crate) fn finish_into(self, plan: &mut Plan) {
        plan.items = self.work.into_items();
        plan.execution = self.execution;
        plan.execution.completed_items = plan.count(ItemStatus::Completed);
        plan.execution.failed_items = plan.count(ItemStatus::Failed);
        plan.execution.skipped_items = plan.count(ItemStatus::Skipped);
        plan.aborted = self.aborted;
    }

    fn view(&self) -> PlanView {
        PlanView {
            plan_id: self.plan_id.clone(),
            request: self.request.clone(),
            mode: self.mode,
            items: self.work.digests(),
        }
    }
}

/// 单次尝试留下的证据
#[derive(Debug, Default)]
struct AttemptRecord {
    tool_plan: Option<ToolInvocationPlan>,
    execution: Option<ExecutionResult>,
    verification: Verification,
}

/// 条目处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// 条目到达终态
    Finished(ItemStatus),
    /// 条目被拆分替换，新条目接着执行
    Split(Vec<ItemId>),
}

pub struct RecoveryMachine {
    pub(crate) tool_planner: Arc<dyn ToolPlanner>,
    pub(crate) executor: Arc<dyn ToolExecutor>,
    pub(crate) verifier: Arc<dyn Verifier>,
    pub(crate) adjuster: Arc<dyn Adjuster>,
    pub(crate) replanner: Arc<dyn Replanner>,
    pub(crate) gate: Option<CapabilityGate>,
    pub(crate) settings: RecoverySettings,
    pub(crate) pacer: Arc<CallPacer>,
    pub(crate) narrator: Narrator,
}

impl RecoveryMachine {
    /// 处理一个已通过依赖检查的条目，直到它到达终态或被拆分
    pub(crate) async fn run_item(&self, run: &mut PlanRun, slot: Slot) -> ItemOutcome {
        loop {
            let (id, attempt, max_attempts) = {
                let item = run.work.item_mut(slot);
                item.attempt += 1;
                item.status = ItemStatus::InProgress;
                (item.id, item.attempt, item.max_attempts)
            };
            run.execution.total_attempts += 1;

            let delay = self.settings.backoff.delay_before(attempt);
            if !delay.is_zero() {
                tracing::debug!(item_id = id, attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
                tokio::time::sleep(delay).await;
            }

            tracing::info!(plan_id = %run.plan_id, item_id = id, attempt, max_attempts, "attempting item");
            let record = self.attempt(run, slot).await;
            let verified = record.verification.verified;
            {
                let item = run.work.item_mut(slot);
                item.execution_result = record.execution.clone();
                item.verification = Some(record.verification.clone());
            }

            let narration = run.work.item(slot).narration.clone();
            if verified {
                self.narrator
                    .say(stage_tag(id, "success"), narration.success, Tier::Quick)
                    .await;
                run.work.item_mut(slot).finish(ItemStatus::Completed, None);
                tracing::info!(item_id = id, attempt, "item completed");
                return ItemOutcome::Finished(ItemStatus::Completed);
            }

            self.narrator
                .say(stage_tag(id, "failure"), narration.failure, Tier::Quick)
                .await;
            tracing::warn!(item_id = id, attempt, reason = %record.verification.reason, "item attempt failed");

            if attempt >= max_attempts {
                return self.escalate(run, slot, record).await;
            }

            match self.adjust(run, slot, &record.verification, attempt).await {
                AdjustStep::Continue => continue,
                AdjustStep::Done(outcome) => return outcome,
            }
        }
    }

    /// 规划工具 → 执行 → 验证；任一能力失败都折算成未通过的验证
    async fn attempt(&self, run: &PlanRun, slot: Slot) -> AttemptRecord {
        let item = run.work.item(slot).clone();
        let mut record = AttemptRecord::default();

        let selected_groups = match &self.gate {
            Some(gate) => Some(gate.narrow(&item, self.settings.capability_timeout).await),
            None => None,
        };
        let context = PlanContext {
            plan_id: run.plan_id.clone(),
            request: run.request.clone(),
            previous: run.work.digests_before(slot),
            selected_groups,
            attempt: item.attempt,
        };

        let tool_plan = match self
            .decide("plan_tools", self.tool_planner.plan(&item, &context))
            .await
            .and_then(|plan| {
                if plan.is_empty() {
                    Err(CapabilityError::Malformed("no tool calls generated".to_string()))
                } else {
                    Ok(plan)
                }
            }) {
            Ok(plan) => plan,
            Err(e) => {
                record.verification = Verification::from_capability_error("plan_tools", &e);
                return record;
            }
        };
        let text = tool_plan
            .narration
            .clone()
            .unwrap_or_else(|| item.narration.start.clone());
        self.narrator
            .say(stage_tag(item.id, "plan_tools"), text, Tier::Quick)
            .await;
        tracing::debug!(item_id = item.id, calls = tool_plan.tool_calls.len(), "tool plan ready");

        let execution = match self
            .bounded("execute_tools", async { Ok(self.executor.execute(&tool_plan).await) })
            .await
        {
            Ok(result) => result,
            Err(e) => {
                record.tool_plan = Some(tool_plan);
                record.verification = Verification::from_capability_error("execute_tools", &e);
                return record;
            }
        };
        self.narrator
            .say(
                stage_tag(item.id, "execute"),
                format!(
                    "{} of {} tool calls succeeded",
                    execution.successful_calls(),
                    execution.outcomes.len()
                ),
                Tier::Normal,
            )
            .await;
        record.tool_plan = Some(tool_plan);

        self.narrator
            .say(stage_tag(item.id, "verify"), item.narration.verify.clone(), Tier::Normal)
            .await;
        record.verification = match self
            .decide("verify", self.verifier.verify(&item, &execution))
            .await
        {
            Ok(v) => v,
            Err(e) => Verification::from_capability_error("verify", &e),
        };
        record.execution = Some(execution);
        record
    }

    async fn adjust(
        &self,
        run: &mut PlanRun,
        slot: Slot,
        verification: &Verification,
        attempt: u32,
    ) -> AdjustStep {
        let item = run.work.item(slot).clone();
        let adjustment = match self
            .decide("adjust", self.adjuster.adjust(&item, verification, attempt))
            .await
        {
            Ok(adj) => adj,
            Err(e) => {
                tracing::warn!(item_id = item.id, error = %e, "adjuster failed, retrying as-is");
                return AdjustStep::Continue;
            }
        };
        tracing::info!(
            item_id = item.id,
            attempt,
            strategy = adjustment.strategy.name(),
            reasoning = %adjustment.reasoning,
            "adjusting item"
        );
        self.narrator
            .say(
                stage_tag(item.id, "adjust"),
                format!("Adjusting approach: {}", adjustment.strategy.name()),
                Tier::Normal,
            )
            .await;

        match adjustment.strategy {
            AdjustStrategy::Retry => AdjustStep::Continue,
            AdjustStrategy::Modify(patch) => {
                patch.apply(run.work.item_mut(slot));
                AdjustStep::Continue
            }
            AdjustStrategy::Split(raw_items) => {
                // 被拆分条目的 id 可以由第一个子条目沿用
                let mut existing = run.work.all_ids();
                existing.remove(&item.id);
                let items = build_inserted_items(
                    raw_items,
                    &existing,
                    &run.work.ids_before(slot),
                    self.settings.default_max_attempts,
                );
                match items {
                    Ok(items) => {
                        let ids = run.work.replace(slot, items);
                        run.work.item_mut(slot).finish(
                            ItemStatus::Skipped,
                            Some(format!("split into items {ids:?}")),
                        );
                        tracing::info!(item_id = item.id, new_items = ?ids, "item split");
                        AdjustStep::Done(ItemOutcome::Split(ids))
                    }
                    Err(e) => {
                        tracing::warn!(item_id = item.id, error = %e, "split rejected, retrying");
                        AdjustStep::Continue
                    }
                }
            }
            AdjustStrategy::Skip => {
                if self.settings.enforce_skip_policy && attempt < item.max_attempts {
                    tracing::warn!(item_id = item.id, attempt, "premature skip refused, retrying");
                    return AdjustStep::Continue;
                }
                let reason = if adjustment.reasoning.is_empty() {
                    "skipped by adjuster".to_string()
                } else {
                    adjustment.reasoning
                };
                run.work.item_mut(slot).finish(ItemStatus::Skipped, Some(reason));
                AdjustStep::Done(ItemOutcome::Finished(ItemStatus::Skipped))
            }
        }
    }

    /// 尝试耗尽：深度重规划（预算内），否则失败
    async fn escalate(&self, run: &mut PlanRun, slot: Slot, record: AttemptRecord) -> ItemOutcome {
        let item = run.work.item(slot).clone();
        if run.execution.replans >= self.settings.max_replans {
            tracing::warn!(item_id = item.id, "replan budget exhausted");
            run.work.item_mut(slot).finish(
                ItemStatus::Failed,
                Some(format!(
                    "attempts exhausted ({}), replan budget used up: {}",
                    item.max_attempts, record.verification.reason
                )),
            );
            return ItemOutcome::Finished(ItemStatus::Failed);
        }
        run.execution.replans += 1;

        let failure = FailureContext {
            failed_item: item.clone(),
            plan: run.view(),
            tool_plan: record.tool_plan,
            execution: record.execution,
            verification: Some(record.verification),
        };
        let decision = match self.decide("replan", self.replanner.replan(&failure)).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(item_id = item.id, error = %e, "replanner failed, skipping item");
                ReplanDecision::skip(format!("replanner failed: {e}"))
            }
        };
        tracing::info!(
            item_id = item.id,
            strategy = ?decision.strategy,
            new_items = decision.new_items.len(),
            reasoning = %decision.reasoning,
            "replan decision"
        );
        self.narrator
            .say(
                stage_tag(item.id, "replan"),
                format!("Replanning after {} failed attempts", item.max_attempts),
                Tier::Normal,
            )
            .await;

        match decision.strategy {
            ReplanStrategy::ReplanAndContinue => self.apply_replan(run, slot, decision),
            ReplanStrategy::SkipAndContinue => {
                let reason = if decision.reasoning.is_empty() {
                    "skipped after exhausting attempts".to_string()
                } else {
                    decision.reasoning
                };
                run.work.item_mut(slot).finish(ItemStatus::Skipped, Some(reason));
                ItemOutcome::Finished(ItemStatus::Skipped)
            }
            ReplanStrategy::Abort => {
                run.work.item_mut(slot).finish(
                    ItemStatus::Failed,
                    Some(format!("plan aborted: {}", decision.reasoning)),
                );
                let drained = run.work.drain_pending("plan aborted");
                run.aborted = true;
                tracing::warn!(item_id = item.id, skipped = ?drained, "plan aborted by replanner");
                ItemOutcome::Finished(ItemStatus::Failed)
            }
        }
    }

    fn apply_replan(&self, run: &mut PlanRun, slot: Slot, decision: ReplanDecision) -> ItemOutcome {
        let id = run.work.item(slot).id;
        let items = if decision.new_items.is_empty() {
            Err(CapabilityError::Rejected("replan without new items".to_string()))
        } else {
            build_inserted_items(
                decision.new_items,
                &run.work.all_ids(),
                &run.work.ids_before(slot),
                self.settings.default_max_attempts,
            )
        };
        let items = match items {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(item_id = id, error = %e, "replan rejected, skipping item");
                run.work
                    .item_mut(slot)
                    .finish(ItemStatus::Skipped, Some(format!("replan rejected: {e}")));
                return ItemOutcome::Finished(ItemStatus::Skipped);
            }
        };

        run.work.item_mut(slot).finish(
            ItemStatus::Skipped,
            Some(format!("superseded by replan: {}", decision.reasoning)),
        );
        if let Some(continue_from) = decision.continue_from_id {
            match run.work.bypass_until(slot, continue_from) {
                Some(bypassed) if !bypassed.is_empty() => {
                    tracing::info!(item_id = id, bypassed = ?bypassed, continue_from, "bypassing items")
                }
                Some(_) => {}
                None => tracing::warn!(item_id = id, continue_from, "continue_from item not found ahead, ignoring"),
            }
        }
        let ids = run.work.insert_after(slot, items);
        run.work.supersede(id, ids.clone());
        tracing::info!(item_id = id, new_items = ?ids, "replan inserted items");
        ItemOutcome::Finished(ItemStatus::Skipped)
    }

    /// 决策类能力调用：节流 + 超时
    async fn decide<T, F>(&self, name: &str, call: F) -> Result<T, CapabilityError>
    where
        F: Future<Output = Result<T, CapabilityError>>,
    {
        self.pacer.pace().await;
        self.bounded(name, call).await
    }

    async fn bounded<T, F>(&self, name: &str, call: F) -> Result<T, CapabilityError>
    where
        F: Future<Output = Result<T, CapabilityError>>,
    {
        match tokio::time::timeout(self.settings.capability_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CapabilityError::Timeout(format!(
                "{name} exceeded {}s",
                self.settings.capability_timeout.as_secs()
            ))),
        }
    }
}

enum AdjustStep {
    Continue,
    Done(ItemOutcome),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::mock::{
        EchoToolExecutor, FixedAdjuster, FixedReplanner, ScriptedVerifier, SilentSink,
        StaticToolPlanner,
    };
    use crate::config::FeedbackSection;
    use crate::plan::{ItemPatch, PlanItem, RawItem};

    fn engine_config() -> EngineSection {
        EngineSection {
            retry_backoff_base_ms: 0,
            ..Default::default()
        }
    }

    fn machine(
        tool_planner: StaticToolPlanner,
        verifier: ScriptedVerifier,
        adjuster: FixedAdjuster,
        replanner: FixedReplanner,
    ) -> RecoveryMachine {
        let config = engine_config();
        let feedback = FeedbackQueue::new(Arc::new(SilentSink), &FeedbackSection::default());
        RecoveryMachine {
            tool_planner: Arc::new(tool_planner),
            executor: Arc::new(EchoToolExecutor::new()),
            verifier: Arc::new(verifier),
            adjuster: Arc::new(adjuster),
            replanner: Arc::new(replanner),
            gate: None,
            settings: RecoverySettings::from(&config),
            pacer: Arc::new(CallPacer::new(Duration::ZERO)),
            narrator: Narrator::new(feedback, &config),
        }
    }

    fn run_of(items: Vec<PlanItem>) -> PlanRun {
        PlanRun {
            plan_id: "p".to_string(),
            request: "req".to_string(),
            mode: PlanMode::Standard,
            work: WorkQueue::new(items),
            execution: ExecutionState::default(),
            aborted: false,
        }
    }

    #[tokio::test]
    async fn test_success_short_circuits() {
        let m = machine(
            StaticToolPlanner::new(),
            ScriptedVerifier::new(),
            FixedAdjuster::retry(),
            FixedReplanner::skip(),
        );
        let mut run = run_of(vec![PlanItem::new(1, "a", "ok")]);
        let slot = run.work.next().unwrap();
        assert_eq!(
            m.run_item(&mut run, slot).await,
            ItemOutcome::Finished(ItemStatus::Completed)
        );
        assert_eq!(run.work.item(slot).attempt, 1);
        assert_eq!(run.execution.total_attempts, 1);
    }

    #[tokio::test]
    async fn test_modify_keeps_success_criteria() {
        let m = machine(
            StaticToolPlanner::new(),
            ScriptedVerifier::new().script(1, [false, true]),
            FixedAdjuster::new(AdjustStrategy::Modify(ItemPatch {
                action: Some("a, more carefully".to_string()),
                ..Default::default()
            })),
            FixedReplanner::skip(),
        );
        let mut run = run_of(vec![PlanItem::new(1, "a", "file exists")]);
        let slot = run.work.next().unwrap();
        m.run_item(&mut run, slot).await;
        let item = run.work.item(slot);
        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.action, "a, more carefully");
        assert_eq!(item.success_criteria, "file exists");
        assert_eq!(item.attempt, 2);
    }

    #[tokio::test]
    async fn test_tool_planner_error_counts_as_failed_attempt() {
        let replanner = FixedReplanner::skip();
        let m = machine(
            StaticToolPlanner::new().failing_for([1]),
            ScriptedVerifier::new(),
            FixedAdjuster::retry(),
            replanner,
        );
        let mut run = run_of(vec![PlanItem::new(1, "a", "ok")]);
        let slot = run.work.next().unwrap();
        assert_eq!(
            m.run_item(&mut run, slot).await,
            ItemOutcome::Finished(ItemStatus::Skipped)
        );
        let item = run.work.item(slot);
        assert_eq!(item.attempt, 3);
        assert!(item.verification.as_ref().unwrap().reason.contains("plan_tools"));
    }

    #[tokio::test]
    async fn test_empty_tool_plan_is_failure() {
        let m = machine(
            StaticToolPlanner::new().empty_for([1]),
            ScriptedVerifier::new(),
            FixedAdjuster::retry(),
            FixedReplanner::skip(),
        );
        let mut run = run_of(vec![PlanItem::new(1, "a", "ok").with_max_attempts(1)]);
        let slot = run.work.next().unwrap();
        m.run_item(&mut run, slot).await;
        let reason = &run.work.item(slot).verification.as_ref().unwrap().reason;
        assert!(reason.contains("no tool calls generated"));
    }

    #[tokio::test]
    async fn test_invalid_split_falls_back_to_retry() {
        let m = machine(
            StaticToolPlanner::new(),
            ScriptedVerifier::new().script(2, [false, true]),
            FixedAdjuster::retry().then_first([AdjustStrategy::Split(vec![
                RawItem::new("x", "ok").with_dependencies(vec![9]),
            ])]),
            FixedReplanner::skip(),
        );
        let mut run = run_of(vec![PlanItem::new(1, "a", "ok"), PlanItem::new(2, "b", "ok")]);
        let first = run.work.next().unwrap();
        m.run_item(&mut run, first).await;
        let second = run.work.next().unwrap();
        assert_eq!(
            m.run_item(&mut run, second).await,
            ItemOutcome::Finished(ItemStatus::Completed)
        );
        assert_eq!(run.work.len(), 2);
    }

    #[tokio::test]
    async fn test_replan_budget_exhaustion_fails_item() {
        let mut m = machine(
            StaticToolPlanner::new(),
            ScriptedVerifier::new().always_fail(1),
            FixedAdjuster::retry(),
            FixedReplanner::skip(),
        );
        m.settings.max_replans = 0;
        let mut run = run_of(vec![PlanItem::new(1, "a", "ok")]);
        let slot = run.work.next().unwrap();
        assert_eq!(
            m.run_item(&mut run, slot).await,
            ItemOutcome::Finished(ItemStatus::Failed)
        );
        assert!(run.work.item(slot).status_reason.as_ref().unwrap().contains("replan budget"));
    }
}
