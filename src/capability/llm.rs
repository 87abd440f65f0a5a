//! 基于 LLM 的能力实现
//!
//! 每个适配器拼 system prompt（附期望响应的 JSON Schema）+ user 消息（JSON 上下文），
//! 再从模型输出中提取 JSON 对象。模型常把 JSON 包在 ```json 代码块或说明文字里。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::capability::{
    Adjuster, Adjustment, AdjustmentResponse, CapabilityGroupSelector, ExecutionResult,
    FailureContext, PlanContext, Planner, ReplanDecision, Replanner, SelectionRequest,
    ToolInvocationPlan, ToolPlanner, Verification, Verifier,
};
use crate::core::CapabilityError;
use crate::llm::{LlmClient, Message};
use crate::plan::{PlanItem, RawPlan};

/// 从模型输出中截取 JSON 对象：优先 ```json 代码块，否则取第一个 `{` 到最后一个 `}`
pub fn extract_json_object(output: &str) -> Result<&str, CapabilityError> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Ok(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => Ok(&trimmed[start..=end]),
        _ => Err(CapabilityError::Malformed(format!(
            "no JSON object in response: {}",
            truncate(trimmed, 200)
        ))),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    }
}

fn parse_json<T: DeserializeOwned>(output: &str) -> Result<T, CapabilityError> {
    let json = extract_json_object(output)?;
    serde_json::from_str(json)
        .map_err(|e| CapabilityError::Malformed(format!("{}: {}", e, truncate(json, 200))))
}

fn schema_prompt<T: JsonSchema>(instructions: &str) -> String {
    let schema = serde_json::to_string_pretty(&schema_for!(T)).unwrap_or_default();
    format!(
        "{instructions}\n\nRespond with a single JSON object that matches this JSON Schema, and nothing else:\n{schema}"
    )
}

async fn ask(
    llm: &dyn LlmClient,
    system: &str,
    user: serde_json::Value,
) -> Result<String, CapabilityError> {
    let messages = [Message::system(system), Message::user(user.to_string())];
    llm.complete(&messages)
        .await
        .map_err(CapabilityError::Unavailable)
}

/// 请求 → 计划草稿
pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: schema_prompt::<RawPlan>(
                "Break the user's request into an ordered list of concrete work items. \
                 Use mode \"standard\" for 1-3 items and \"extended\" for up to 10. \
                 Every item needs an imperative action and a verifiable success_criteria. \
                 Dependencies may only reference earlier items by their 1-based position.",
            ),
        }
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn create_plan(
        &self,
        request: &str,
        context: &serde_json::Value,
    ) -> Result<RawPlan, CapabilityError> {
        let output = ask(
            self.llm.as_ref(),
            &self.system_prompt,
            serde_json::json!({ "request": request, "context": context }),
        )
        .await?;
        parse_json(&output)
    }
}

/// 条目 → 工具调用计划
pub struct LlmToolPlanner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmToolPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self::with_tool_catalog(llm, "")
    }

    /// catalog：可用工具说明，附在 system prompt 末尾
    pub fn with_tool_catalog(llm: Arc<dyn LlmClient>, catalog: &str) -> Self {
        let mut system_prompt = schema_prompt::<ToolInvocationPlan>(
            "Choose the tool calls that accomplish the work item. \
             Prefer the selected capability groups when they are given.",
        );
        if !catalog.is_empty() {
            system_prompt.push_str("\n\nAvailable tools:\n");
            system_prompt.push_str(catalog);
        }
        Self { llm, system_prompt }
    }
}

#[async_trait]
impl ToolPlanner for LlmToolPlanner {
    async fn plan(
        &self,
        item: &PlanItem,
        context: &PlanContext,
    ) -> Result<ToolInvocationPlan, CapabilityError> {
        let output = ask(
            self.llm.as_ref(),
            &self.system_prompt,
            serde_json::json!({ "item": item, "context": context }),
        )
        .await?;
        parse_json(&output)
    }
}

/// 按成功标准裁决；无法解析的回复视为未通过
pub struct LlmVerifier {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmVerifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: schema_prompt::<Verification>(
                "Decide whether the execution result satisfies the item's success_criteria. \
                 Only set verified to true when the evidence clearly shows it.",
            ),
        }
    }
}

#[async_trait]
impl Verifier for LlmVerifier {
    async fn verify(
        &self,
        item: &PlanItem,
        result: &ExecutionResult,
    ) -> Result<Verification, CapabilityError> {
        let output = ask(
            self.llm.as_ref(),
            &self.system_prompt,
            serde_json::json!({
                "action": item.action,
                "success_criteria": item.success_criteria,
                "execution_result": result,
            }),
        )
        .await?;
        match parse_json::<Verification>(&output) {
            Ok(verification) => Ok(verification),
            Err(e) => {
                tracing::warn!(item_id = item.id, error = %e, "verifier response unparseable");
                Ok(Verification::failed(format!("unparseable verifier response: {e}")))
            }
        }
    }
}

/// 局部修复
pub struct LlmAdjuster {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmAdjuster {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: schema_prompt::<AdjustmentResponse>(
                "The work item failed verification. Pick a strategy: retry (same item), \
                 modify (give updated_item with only the fields to change), \
                 split (give new_items replacing this item), or skip (only if the item is impossible).",
            ),
        }
    }
}

#[async_trait]
impl Adjuster for LlmAdjuster {
    async fn adjust(
        &self,
        item: &PlanItem,
        verification: &Verification,
        attempt: u32,
    ) -> Result<Adjustment, CapabilityError> {
        let output = ask(
            self.llm.as_ref(),
            &self.system_prompt,
            serde_json::json!({
                "item": item,
                "verification": verification,
                "attempt": attempt,
                "max_attempts": item.max_attempts,
            }),
        )
        .await?;
        parse_json::<AdjustmentResponse>(&output)?.into_adjustment()
    }
}

/// 深度重规划；无法解析的回复退化为 skip_and_continue
pub struct LlmReplanner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmReplanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: schema_prompt::<ReplanDecision>(
                "A work item exhausted its attempts. Decide how the plan continues: \
                 replan_and_continue (give new_items to insert after the failed item), \
                 skip_and_continue, or abort.",
            ),
        }
    }
}

#[async_trait]
impl Replanner for LlmReplanner {
    async fn replan(&self, failure: &FailureContext) -> Result<ReplanDecision, CapabilityError> {
        let context = serde_json::to_value(failure)
            .map_err(|e| CapabilityError::Malformed(e.to_string()))?;
        let output = ask(self.llm.as_ref(), &self.system_prompt, context).await?;
        match parse_json::<ReplanDecision>(&output) {
            Ok(decision) => Ok(decision),
            Err(e) => {
                tracing::warn!(item_id = failure.failed_item.id, error = %e, "replanner response unparseable");
                Ok(ReplanDecision::skip(format!("unparseable replanner response: {e}")))
            }
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GroupSelection {
    #[serde(alias = "servers", alias = "selected_servers")]
    groups: Vec<String>,
}

/// 能力组分类器
pub struct LlmGroupSelector {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmGroupSelector {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: schema_prompt::<GroupSelection>(
                "Select the 1-2 capability groups most relevant to the work item. \
                 Use only names from the available list.",
            ),
        }
    }
}

#[async_trait]
impl CapabilityGroupSelector for LlmGroupSelector {
    async fn select(&self, request: &SelectionRequest) -> Result<Vec<String>, CapabilityError> {
        let mut user = serde_json::json!({
            "action": request.item.action,
            "capability_hint": request.item.capability_hint,
            "available": request.available,
        });
        if let Some(correction) = &request.correction {
            user["correction"] = serde_json::Value::String(correction.clone());
        }
        let output = ask(self.llm.as_ref(), &self.system_prompt, user).await?;
        Ok(parse_json::<GroupSelection>(&output)?.groups)
    }
}
