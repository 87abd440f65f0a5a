//! 脚本化能力实现（测试与 demo 用，无需任何后端）
//!
//! 每个实现都记录调用次数，便于断言"调用了几次 / 没有被调用"。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::capability::{
    AdjustStrategy, Adjuster, Adjustment, CapabilityGroupSelector, ExecutionResult,
    FailureContext, NarrationSink, PlanContext, Planner, ReplanDecision, Replanner,
    SelectionRequest, SpeakOptions, ToolCall, ToolCallOutcome, ToolExecutor, ToolInvocationPlan,
    ToolPlanner, Verification, Verifier,
};
use crate::core::CapabilityError;
use crate::feedback::Tier;
use crate::plan::{ItemId, PlanItem, RawPlan};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 总是返回同一份草稿
#[derive(Debug)]
pub struct StaticPlanner {
    plan: Result<RawPlan, CapabilityError>,
}

impl StaticPlanner {
    pub fn new(plan: RawPlan) -> Self {
        Self { plan: Ok(plan) }
    }

    pub fn failing(error: CapabilityError) -> Self {
        Self { plan: Err(error) }
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn create_plan(
        &self,
        _request: &str,
        _context: &serde_json::Value,
    ) -> Result<RawPlan, CapabilityError> {
        self.plan.clone()
    }
}

/// 把条目的 tools_hint 直接变成工具调用；没有提示时调用 `noop`
#[derive(Debug, Default)]
pub struct StaticToolPlanner {
    failing: HashSet<ItemId>,
    empty: HashSet<ItemId>,
    contexts: Mutex<Vec<(ItemId, PlanContext)>>,
}

impl StaticToolPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// 这些条目的规划返回 Unavailable
    pub fn failing_for(mut self, ids: impl IntoIterator<Item = ItemId>) -> Self {
        self.failing.extend(ids);
        self
    }

    /// 这些条目的规划返回空计划
    pub fn empty_for(mut self, ids: impl IntoIterator<Item = ItemId>) -> Self {
        self.empty.extend(ids);
        self
    }

    pub fn contexts(&self) -> Vec<(ItemId, PlanContext)> {
        lock(&self.contexts).clone()
    }
}

#[async_trait]
impl ToolPlanner for StaticToolPlanner {
    async fn plan(
        &self,
        item: &PlanItem,
        context: &PlanContext,
    ) -> Result<ToolInvocationPlan, CapabilityError> {
        lock(&self.contexts).push((item.id, context.clone()));
        if self.failing.contains(&item.id) {
            return Err(CapabilityError::Unavailable(format!(
                "tool planner offline for item {}",
                item.id
            )));
        }
        if self.empty.contains(&item.id) {
            return Ok(ToolInvocationPlan::default());
        }
        let group = context
            .selected_groups
            .as_ref()
            .and_then(|g| g.first())
            .or_else(|| item.capability_hint.first())
            .cloned();
        let tools = if item.tools_hint.is_empty() {
            vec!["noop".to_string()]
        } else {
            item.tools_hint.clone()
        };
        Ok(ToolInvocationPlan {
            tool_calls: tools
                .into_iter()
                .map(|tool| ToolCall {
                    tool,
                    group: group.clone(),
                    parameters: item.parameters.clone(),
                })
                .collect(),
            reasoning: format!("direct mapping for item {}", item.id),
            narration: None,
        })
    }
}

/// 模拟执行：除 failing 列表中的工具外全部成功，输出即参数
#[derive(Debug, Default)]
pub struct EchoToolExecutor {
    failing_tools: HashSet<String>,
    delay: Option<Duration>,
    calls: Mutex<usize>,
}

impl EchoToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing_tools.extend(tools.into_iter().map(Into::into));
        self
    }

    /// 每次执行前等待（模拟慢工具）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        *lock(&self.calls)
    }
}

#[async_trait]
impl ToolExecutor for EchoToolExecutor {
    async fn execute(&self, plan: &ToolInvocationPlan) -> ExecutionResult {
        *lock(&self.calls) += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        ExecutionResult {
            outcomes: plan
                .tool_calls
                .iter()
                .map(|call| {
                    if self.failing_tools.contains(&call.tool) {
                        ToolCallOutcome::failed(call, format!("{} failed", call.tool))
                    } else {
                        ToolCallOutcome::ok(call, call.parameters.clone())
                    }
                })
                .collect(),
        }
    }
}

/// 按条目脚本给出裁决；脚本耗尽后按"执行是否全部成功"裁决
#[derive(Debug, Default)]
pub struct ScriptedVerifier {
    scripts: Mutex<HashMap<ItemId, VecDeque<bool>>>,
    always_fail: HashSet<ItemId>,
    calls: Mutex<HashMap<ItemId, usize>>,
}

impl ScriptedVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, id: ItemId, verdicts: impl IntoIterator<Item = bool>) -> Self {
        lock(&self.scripts).insert(id, verdicts.into_iter().collect());
        self
    }

    pub fn always_fail(mut self, id: ItemId) -> Self {
        self.always_fail.insert(id);
        self
    }

    pub fn calls(&self, id: ItemId) -> usize {
        lock(&self.calls).get(&id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Verifier for ScriptedVerifier {
    async fn verify(
        &self,
        item: &PlanItem,
        result: &ExecutionResult,
    ) -> Result<Verification, CapabilityError> {
        *lock(&self.calls).entry(item.id).or_insert(0) += 1;
        let scripted = lock(&self.scripts)
            .get_mut(&item.id)
            .and_then(VecDeque::pop_front);
        let verified = if self.always_fail.contains(&item.id) {
            false
        } else {
            scripted.unwrap_or_else(|| result.all_successful())
        };
        Ok(if verified {
            Verification::passed(format!("criteria met: {}", item.success_criteria))
        } else {
            Verification::failed(format!("criteria not met: {}", item.success_criteria))
        })
    }
}

/// 按脚本依次返回调整，脚本耗尽后返回 fallback
#[derive(Debug)]
pub struct FixedAdjuster {
    script: Mutex<VecDeque<Result<Adjustment, CapabilityError>>>,
    fallback: Result<Adjustment, CapabilityError>,
    calls: Mutex<usize>,
}

impl FixedAdjuster {
    pub fn new(strategy: AdjustStrategy) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(Adjustment::new(strategy, "scripted")),
            calls: Mutex::new(0),
        }
    }

    pub fn retry() -> Self {
        Self::new(AdjustStrategy::Retry)
    }

    pub fn failing(error: CapabilityError) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Err(error),
            calls: Mutex::new(0),
        }
    }

    /// 在 fallback 之前先返回这些调整
    pub fn then_first(self, strategies: impl IntoIterator<Item = AdjustStrategy>) -> Self {
        lock(&self.script).extend(
            strategies
                .into_iter()
                .map(|s| Ok(Adjustment::new(s, "scripted"))),
        );
        self
    }

    pub fn calls(&self) -> usize {
        *lock(&self.calls)
    }
}

#[async_trait]
impl Adjuster for FixedAdjuster {
    async fn adjust(
        &self,
        _item: &PlanItem,
        _verification: &Verification,
        _attempt: u32,
    ) -> Result<Adjustment, CapabilityError> {
        *lock(&self.calls) += 1;
        lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// 按脚本依次返回重规划决策，脚本耗尽后返回 fallback；记录收到的失败上下文
#[derive(Debug)]
pub struct FixedReplanner {
    script: Mutex<VecDeque<Result<ReplanDecision, CapabilityError>>>,
    fallback: Result<ReplanDecision, CapabilityError>,
    seen: Mutex<Vec<FailureContext>>,
}

impl FixedReplanner {
    pub fn new(decision: ReplanDecision) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(decision),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn skip() -> Self {
        Self::new(ReplanDecision::skip("scripted skip"))
    }

    pub fn failing(error: CapabilityError) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Err(error),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn then_first(self, decisions: impl IntoIterator<Item = ReplanDecision>) -> Self {
        lock(&self.script).extend(decisions.into_iter().map(Ok));
        self
    }

    pub fn calls(&self) -> usize {
        lock(&self.seen).len()
    }

    pub fn seen(&self) -> Vec<FailureContext> {
        lock(&self.seen).clone()
    }
}

#[async_trait]
impl Replanner for FixedReplanner {
    async fn replan(&self, failure: &FailureContext) -> Result<ReplanDecision, CapabilityError> {
        lock(&self.seen).push(failure.clone());
        lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// 记录所有播报
#[derive(Debug, Default)]
pub struct RecordingSink {
    delay: Option<Duration>,
    spoken: Mutex<Vec<(String, Tier)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次播报耗时 delay（超过档位时长会被截断）
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            spoken: Mutex::new(Vec::new()),
        }
    }

    pub fn texts(&self) -> Vec<String> {
        lock(&self.spoken).iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn records(&self) -> Vec<(String, Tier)> {
        lock(&self.spoken).clone()
    }
}

#[async_trait]
impl NarrationSink for RecordingSink {
    async fn speak(&self, text: &str, options: SpeakOptions) -> Result<(), CapabilityError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.spoken).push((text.to_string(), options.tier));
        Ok(())
    }
}

/// 丢弃所有播报
#[derive(Debug, Default)]
pub struct SilentSink;

#[async_trait]
impl NarrationSink for SilentSink {
    async fn speak(&self, _text: &str, _options: SpeakOptions) -> Result<(), CapabilityError> {
        Ok(())
    }
}

/// 只写日志的播报出口
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NarrationSink for LogSink {
    async fn speak(&self, text: &str, options: SpeakOptions) -> Result<(), CapabilityError> {
        tracing::info!(tier = %options.tier, "narration: {}", text);
        Ok(())
    }
}

/// 按脚本依次返回能力组选择，脚本耗尽后返回 fallback
#[derive(Debug)]
pub struct StaticGroupSelector {
    script: Mutex<VecDeque<Vec<String>>>,
    fallback: Vec<String>,
    requests: Mutex<Vec<SelectionRequest>>,
}

impl StaticGroupSelector {
    pub fn new<I, S>(fallback: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: fallback.into_iter().map(Into::into).collect(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn then_first<I, S>(self, selection: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.script).push_back(selection.into_iter().map(Into::into).collect());
        self
    }

    pub fn requests(&self) -> Vec<SelectionRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl CapabilityGroupSelector for StaticGroupSelector {
    async fn select(&self, request: &SelectionRequest) -> Result<Vec<String>, CapabilityError> {
        lock(&self.requests).push(request.clone());
        Ok(lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}
