//! 计划数据模型
//!
//! Plan 是聚合根；PlanItem 的插入顺序即执行顺序。

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::capability::{ExecutionResult, Verification};

pub type PlanId = String;
pub type ItemId = u32;

/// 计划模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    /// 建议 1-3 个条目（软限制）
    #[default]
    Standard,
    /// 最多 10 个条目（硬限制）
    Extended,
}

impl std::fmt::Display for PlanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanMode::Standard => write!(f, "standard"),
            PlanMode::Extended => write!(f, "extended"),
        }
    }
}

/// 条目状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Skipped)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// 条目的四句播报：开始 / 成功 / 失败 / 验证中
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Narration {
    pub start: String,
    pub success: String,
    pub failure: String,
    pub verify: String,
}

impl Narration {
    /// 条目未提供播报时的默认短语
    pub fn for_action(action: &str) -> Self {
        Self {
            start: format!("Working on: {action}"),
            success: "Done".to_string(),
            failure: "Failed".to_string(),
            verify: "Verifying...".to_string(),
        }
    }
}

/// 计划条目
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanItem {
    /// 计划内唯一，正整数
    pub id: ItemId,
    /// 祈使句形式的动作描述
    pub action: String,
    /// 建议使用的工具（仅供参考）
    pub tools_hint: Vec<String>,
    /// 建议使用的能力组（仅供参考）
    pub capability_hint: Vec<String>,
    pub parameters: serde_json::Value,
    /// Verifier 依据的成功标准
    pub success_criteria: String,
    pub fallback_options: Vec<String>,
    /// 必须先 completed 的条目 id，均小于自身 id
    pub dependencies: Vec<ItemId>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub status: ItemStatus,
    /// 最近一次工具执行证据
    pub execution_result: Option<ExecutionResult>,
    /// 最近一次验证结论
    pub verification: Option<Verification>,
    pub narration: Narration,
    /// 终态原因（失败 / 跳过时的人类可读说明）
    pub status_reason: Option<String>,
}

impl PlanItem {
    pub fn new(id: ItemId, action: impl Into<String>, success_criteria: impl Into<String>) -> Self {
        let action = action.into();
        Self {
            id,
            narration: Narration::for_action(&action),
            action,
            tools_hint: Vec::new(),
            capability_hint: Vec::new(),
            parameters: serde_json::Value::Null,
            success_criteria: success_criteria.into(),
            fallback_options: Vec::new(),
            dependencies: Vec::new(),
            attempt: 0,
            max_attempts: 3,
            status: ItemStatus::Pending,
            execution_result: None,
            verification: None,
            status_reason: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<ItemId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 置为终态并记录原因
    pub fn finish(&mut self, status: ItemStatus, reason: Option<String>) {
        self.status = status;
        self.status_reason = reason;
    }

    pub fn digest(&self) -> ItemDigest {
        ItemDigest {
            id: self.id,
            action: self.action.clone(),
            status: self.status,
        }
    }
}

/// 条目摘要（给能力调用的上下文）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemDigest {
    pub id: ItemId,
    pub action: String,
    pub status: ItemStatus,
}

/// 执行进度
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionState {
    pub current_index: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    pub skipped_items: usize,
    pub total_attempts: u32,
    pub replans: u32,
}

/// 计划（聚合根）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub id: PlanId,
    pub original_request: String,
    pub mode: PlanMode,
    /// 1-10
    pub complexity_score: u8,
    pub items: Vec<PlanItem>,
    pub execution: ExecutionState,
    pub aborted: bool,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn item(&self, id: ItemId) -> Option<&PlanItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn count(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }

    pub fn digests(&self) -> Vec<ItemDigest> {
        self.items.iter().map(PlanItem::digest).collect()
    }

    pub fn is_finished(&self) -> bool {
        self.items.iter().all(PlanItem::is_terminal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!ItemStatus::Pending.is_terminal());
        assert!(!ItemStatus::InProgress.is_terminal());
        assert!(ItemStatus::Completed.is_terminal());
        assert!(ItemStatus::Failed.is_terminal());
        assert!(ItemStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_new_item_defaults() {
        let item = PlanItem::new(1, "Create report.txt", "file exists").with_max_attempts(0);
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempt, 0);
        assert_eq!(item.max_attempts, 1);
        assert!(item.narration.start.contains("Create report.txt"));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ItemStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        assert_eq!(PlanMode::Extended.to_string(), "extended");
    }
}
