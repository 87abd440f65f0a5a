//! 能力调用的输入 / 输出数据
//!
//! 引擎只把只读快照交给外部能力，能力返回新数据，由引擎决定如何应用到计划上。

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::core::CapabilityError;
use crate::feedback::Tier;
use crate::plan::{ItemDigest, ItemId, ItemPatch, PlanItem, PlanMode, RawItem};

/// 单次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolCall {
    pub tool: String,
    /// 工具所属能力组（原 MCP server）
    #[serde(default, alias = "server")]
    pub group: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// 工具调用计划（ToolPlanner 输出）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolInvocationPlan {
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub reasoning: String,
    /// 规划阶段的简短播报；缺省时由引擎按动作生成
    #[serde(default, alias = "tts_phrase")]
    pub narration: Option<String>,
}

impl ToolInvocationPlan {
    pub fn new(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

/// 单个工具调用的结果；失败被编码在这里而不是抛出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallOutcome {
    pub tool: String,
    pub group: Option<String>,
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ToolCallOutcome {
    pub fn ok(call: &ToolCall, output: serde_json::Value) -> Self {
        Self {
            tool: call.tool.clone(),
            group: call.group.clone(),
            success: true,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(call: &ToolCall, error: impl Into<String>) -> Self {
        Self {
            tool: call.tool.clone(),
            group: call.group.clone(),
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// 工具执行结果（部分失败时保留已完成部分）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub outcomes: Vec<ToolCallOutcome>,
}

impl ExecutionResult {
    pub fn all_successful(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(|o| o.success)
    }

    pub fn successful_calls(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    pub fn failed_calls(&self) -> usize {
        self.outcomes.len() - self.successful_calls()
    }
}

/// Verifier 裁决
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Verification {
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub evidence: serde_json::Value,
}

impl Verification {
    pub fn passed(reason: impl Into<String>) -> Self {
        Self {
            verified: true,
            reason: reason.into(),
            evidence: serde_json::Value::Null,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            verified: false,
            reason: reason.into(),
            evidence: serde_json::Value::Null,
        }
    }

    /// 能力调用失败按一次验证失败处理
    pub fn from_capability_error(stage: &str, err: &CapabilityError) -> Self {
        Self {
            verified: false,
            reason: format!("{stage} failed: {err}"),
            evidence: serde_json::json!({ "capability_error": err.to_string(), "stage": stage }),
        }
    }
}

/// 局部修复策略（Adjuster 输出）
#[derive(Debug, Clone, PartialEq)]
pub enum AdjustStrategy {
    /// 原样重试
    Retry,
    /// 修改条目字段后重试
    Modify(ItemPatch),
    /// 用若干新条目替换当前条目（原位置插入）
    Split(Vec<RawItem>),
    /// 立即终止为 skipped
    Skip,
}

impl AdjustStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            AdjustStrategy::Retry => "retry",
            AdjustStrategy::Modify(_) => "modify",
            AdjustStrategy::Split(_) => "split",
            AdjustStrategy::Skip => "skip",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Adjustment {
    pub strategy: AdjustStrategy,
    pub reasoning: String,
}

impl Adjustment {
    pub fn new(strategy: AdjustStrategy, reasoning: impl Into<String>) -> Self {
        Self {
            strategy,
            reasoning: reasoning.into(),
        }
    }
}

/// 策略名（线上格式）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AdjustStrategyKind {
    Retry,
    Modify,
    Split,
    Skip,
}

/// Adjuster 的线上响应格式，经 into_adjustment 收敛为 Adjustment
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AdjustmentResponse {
    pub strategy: AdjustStrategyKind,
    #[serde(default, alias = "updated_todo_item")]
    pub updated_item: Option<ItemPatch>,
    #[serde(default)]
    pub new_items: Vec<RawItem>,
    #[serde(default)]
    pub reasoning: String,
}

impl AdjustmentResponse {
    pub fn into_adjustment(self) -> Result<Adjustment, CapabilityError> {
        let strategy = match self.strategy {
            AdjustStrategyKind::Retry => AdjustStrategy::Retry,
            AdjustStrategyKind::Modify => match self.updated_item {
                Some(patch) if !patch.is_empty() => AdjustStrategy::Modify(patch),
                _ => {
                    tracing::warn!("modify adjustment carried no changes, treating as retry");
                    AdjustStrategy::Retry
                }
            },
            AdjustStrategyKind::Split => {
                let items = if self.new_items.is_empty() {
                    self.updated_item.map(|p| p.split_into).unwrap_or_default()
                } else {
                    self.new_items
                };
                if items.is_empty() {
                    return Err(CapabilityError::Malformed(
                        "split adjustment without new_items".to_string(),
                    ));
                }
                AdjustStrategy::Split(items)
            }
            AdjustStrategyKind::Skip => AdjustStrategy::Skip,
        };
        Ok(Adjustment::new(strategy, self.reasoning))
    }
}

/// 深度重规划策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReplanStrategy {
    ReplanAndContinue,
    SkipAndContinue,
    Abort,
}

/// Replanner 输出（同时是线上格式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReplanDecision {
    #[serde(default)]
    pub replanned: bool,
    pub strategy: ReplanStrategy,
    #[serde(default)]
    pub new_items: Vec<RawItem>,
    #[serde(default, alias = "continue_from_item_id")]
    pub continue_from_id: Option<ItemId>,
    #[serde(default)]
    pub reasoning: String,
}

impl ReplanDecision {
    /// 重规划失败时的兜底：跳过并继续，原因记录错误
    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            replanned: false,
            strategy: ReplanStrategy::SkipAndContinue,
            new_items: Vec::new(),
            continue_from_id: None,
            reasoning: reason.into(),
        }
    }
}

/// 计划只读视图
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanView {
    pub plan_id: String,
    pub request: String,
    pub mode: PlanMode,
    pub items: Vec<ItemDigest>,
}

/// 交给 ToolPlanner 的计划上下文
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanContext {
    pub plan_id: String,
    pub request: String,
    /// 当前条目之前的条目摘要
    pub previous: Vec<ItemDigest>,
    /// 能力组筛选结果；None 表示使用全部能力组
    pub selected_groups: Option<Vec<String>>,
    pub attempt: u32,
}

/// 交给 Replanner 的完整失败上下文
#[derive(Debug, Clone, Serialize)]
pub struct FailureContext {
    pub failed_item: PlanItem,
    pub plan: PlanView,
    pub tool_plan: Option<ToolInvocationPlan>,
    pub execution: Option<ExecutionResult>,
    pub verification: Option<Verification>,
}

/// 播报参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeakOptions {
    pub tier: Tier,
    pub max_duration: Duration,
}

/// 可供筛选的能力组
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityGroup {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl CapabilityGroup {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// 能力组筛选请求
#[derive(Debug, Clone, Serialize)]
pub struct SelectionRequest {
    pub item: PlanItem,
    pub available: Vec<CapabilityGroup>,
    /// 上一次选择非法时的纠正提示
    pub correction: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjustment_response_modify_without_patch_is_retry() {
        let resp: AdjustmentResponse =
            serde_json::from_str(r#"{"strategy": "modify", "reasoning": "x"}"#).unwrap();
        let adj = resp.into_adjustment().unwrap();
        assert_eq!(adj.strategy, AdjustStrategy::Retry);
    }

    #[test]
    fn test_adjustment_response_split_requires_items() {
        let resp: AdjustmentResponse = serde_json::from_str(r#"{"strategy": "split"}"#).unwrap();
        assert!(matches!(
            resp.into_adjustment(),
            Err(CapabilityError::Malformed(_))
        ));
    }

    #[test]
    fn test_adjustment_response_accepts_legacy_field_name() {
        let resp: AdjustmentResponse = serde_json::from_str(
            r#"{"strategy": "modify", "updated_todo_item": {"action": "open the file"}}"#,
        )
        .unwrap();
        match resp.into_adjustment().unwrap().strategy {
            AdjustStrategy::Modify(patch) => {
                assert_eq!(patch.action.as_deref(), Some("open the file"))
            }
            other => panic!("unexpected strategy {other:?}"),
        }
    }

    #[test]
    fn test_adjustment_response_reads_split_into_from_updated_item() {
        let resp: AdjustmentResponse = serde_json::from_str(
            r#"{
                "strategy": "split",
                "updated_todo_item": {
                    "split_into": [
                        {"id": 3, "action": "search", "success_criteria": "results shown", "dependencies": [2]},
                        {"id": 4, "action": "collect prices", "success_criteria": "5 prices", "dependencies": [3]}
                    ],
                    "renumber_following_items": true
                },
                "reasoning": "two actions in one item"
            }"#,
        )
        .unwrap();
        let adjustment = resp.into_adjustment().unwrap();
        match adjustment.strategy {
            AdjustStrategy::Split(items) => {
                let ids: Vec<_> = items.iter().map(|i| i.id).collect();
                assert_eq!(ids, vec![Some(3), Some(4)]);
                assert_eq!(items[1].dependencies, vec![3]);
            }
            other => panic!("unexpected strategy {other:?}"),
        }
        assert_eq!(adjustment.reasoning, "two actions in one item");
    }

    #[test]
    fn test_split_without_any_items_is_malformed() {
        let resp: AdjustmentResponse =
            serde_json::from_str(r#"{"strategy": "split", "updated_todo_item": {}}"#).unwrap();
        assert!(matches!(
            resp.into_adjustment(),
            Err(CapabilityError::Malformed(_))
        ));
    }

    #[test]
    fn test_replan_decision_parses_snake_case_strategy() {
        let decision: ReplanDecision = serde_json::from_str(
            r#"{"replanned": true, "strategy": "replan_and_continue", "continue_from_item_id": 4}"#,
        )
        .unwrap();
        assert_eq!(decision.strategy, ReplanStrategy::ReplanAndContinue);
        assert_eq!(decision.continue_from_id, Some(4));
        assert!(decision.new_items.is_empty());
    }

    #[test]
    fn test_execution_result_counts() {
        let call = ToolCall {
            tool: "write_file".to_string(),
            group: Some("filesystem".to_string()),
            parameters: serde_json::Value::Null,
        };
        let result = ExecutionResult {
            outcomes: vec![
                ToolCallOutcome::ok(&call, serde_json::json!("ok")),
                ToolCallOutcome::failed(&call, "denied"),
            ],
        };
        assert!(!result.all_successful());
        assert_eq!(result.successful_calls(), 1);
        assert_eq!(result.failed_calls(), 1);
        assert!(!ExecutionResult::default().all_successful());
    }
}
