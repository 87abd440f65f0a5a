//! 计划原始数据（Planner / Adjuster / Replanner 的线上格式）
//!
//! 字段别名兼容旧格式：tools_needed、mcp_servers、tts、updated_todo_item 等。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::plan::{ItemId, Narration, PlanItem, PlanMode};

/// Planner 返回的计划草稿
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RawPlan {
    #[serde(default)]
    pub mode: Option<PlanMode>,
    /// 复杂度 1-10
    #[serde(default)]
    pub complexity: Option<u8>,
    #[serde(default)]
    pub items: Vec<RawItem>,
}

/// 条目草稿
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RawItem {
    /// 计划创建时忽略（按顺序重新编号）；拆分 / 重规划时由能力负责编号，缺省则自动分配
    #[serde(default)]
    pub id: Option<ItemId>,
    pub action: String,
    #[serde(default, alias = "tools_needed")]
    pub tools_hint: Vec<String>,
    #[serde(default, alias = "mcp_servers")]
    pub capability_hint: Vec<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub success_criteria: Option<String>,
    #[serde(default)]
    pub fallback_options: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<ItemId>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default, alias = "tts")]
    pub narration: Option<RawNarration>,
}

impl RawItem {
    pub fn new(action: impl Into<String>, success_criteria: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            success_criteria: Some(success_criteria.into()),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: ItemId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<ItemId>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// 播报短语草稿，缺失的短语用默认值补齐
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RawNarration {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub success: Option<String>,
    #[serde(default)]
    pub failure: Option<String>,
    #[serde(default)]
    pub verify: Option<String>,
}

impl RawNarration {
    pub fn resolve(self, action: &str) -> Narration {
        let defaults = Narration::for_action(action);
        Narration {
            start: self.start.unwrap_or(defaults.start),
            success: self.success.unwrap_or(defaults.success),
            failure: self.failure.unwrap_or(defaults.failure),
            verify: self.verify.unwrap_or(defaults.verify),
        }
    }
}

/// modify 策略的字段补丁；None 表示保持原值（success_criteria 仅在显式给出时改变）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ItemPatch {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default, alias = "tools_needed")]
    pub tools_hint: Option<Vec<String>>,
    #[serde(default, alias = "mcp_servers")]
    pub capability_hint: Option<Vec<String>>,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub success_criteria: Option<String>,
    #[serde(default)]
    pub fallback_options: Option<Vec<String>>,
    #[serde(default, alias = "tts")]
    pub narration: Option<RawNarration>,
    /// split 时的子条目（旧格式把它放在 updated_todo_item 里），modify 不使用
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub split_into: Vec<RawItem>,
}

impl ItemPatch {
    /// 没有任何可应用于条目的字段
    pub fn is_empty(&self) -> bool {
        self.action.is_none()
            && self.tools_hint.is_none()
            && self.capability_hint.is_none()
            && self.parameters.is_none()
            && self.success_criteria.is_none()
            && self.fallback_options.is_none()
            && self.narration.is_none()
    }

    /// 就地应用补丁；id / dependencies / attempt / status 不受影响
    pub fn apply(self, item: &mut PlanItem) {
        if let Some(action) = self.action {
            item.action = action;
        }
        if let Some(tools) = self.tools_hint {
            item.tools_hint = tools;
        }
        if let Some(groups) = self.capability_hint {
            item.capability_hint = groups;
        }
        if let Some(parameters) = self.parameters {
            item.parameters = parameters;
        }
        if let Some(criteria) = self.success_criteria.filter(|c| !c.trim().is_empty()) {
            item.success_criteria = criteria;
        }
        if let Some(fallbacks) = self.fallback_options {
            item.fallback_options = fallbacks;
        }
        if let Some(narration) = self.narration {
            item.narration = narration.resolve(&item.action);
        }
    }
}
