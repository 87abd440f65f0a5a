//! 错误类型
//!
//! - PlanError：计划结构错误（创建阶段致命，计划不会返回）
//! - CapabilityError：外部能力调用失败（在条目内部恢复，视为一次验证失败）
//! - FeedbackError：反馈队列投递失败（溢出 / 取消 / 播报失败）
//! - NarrowingError：能力组筛选结果非法（可恢复，附带合法名称提示）

use thiserror::Error;

/// 计划结构错误：非法形状、前向/循环依赖、模式与条目数冲突
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan must contain at least one item")]
    Empty,

    #[error("{mode} mode allows at most {limit} items, got {count}")]
    TooManyItems {
        mode: String,
        count: usize,
        limit: usize,
    },

    #[error("item {item} has no success criteria")]
    MissingCriteria { item: u32 },

    #[error("item {item} depends on unknown item {dependency}")]
    UnknownDependency { item: u32, dependency: u32 },

    #[error("item {item} has forward/circular dependency {dependency}")]
    ForwardDependency { item: u32, dependency: u32 },

    #[error("duplicate item id {0}")]
    DuplicateId(u32),

    /// Planner 能力本身失败（未得到可校验的计划数据）
    #[error("planner failed: {0}")]
    Planner(#[from] CapabilityError),
}

/// 外部能力调用失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    /// 响应无法解析或缺少必要字段
    #[error("malformed response: {0}")]
    Malformed(String),

    /// 传输失败 / 后端不可用
    #[error("capability unavailable: {0}")]
    Unavailable(String),

    #[error("capability timed out: {0}")]
    Timeout(String),

    /// 响应可解析但内容不被接受（如拆分条目依赖非法）
    #[error("response rejected: {0}")]
    Rejected(String),
}

/// 反馈队列投递失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedbackError {
    /// 队列超出上限，低优先级条目被挤出
    #[error("feedback queue overflow")]
    Overflow,

    /// 被 clear_queue / stop 取消
    #[error("feedback cancelled")]
    Cancelled,

    #[error("narration sink failed: {0}")]
    Sink(String),

    /// 队列已释放，等待方再也拿不到结果
    #[error("feedback queue closed")]
    Closed,
}

/// 能力组筛选错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NarrowingError {
    #[error("no capability group selected")]
    Empty,

    #[error("unknown capability groups: {}. Available: {}", invalid.join(", "), valid.join(", "))]
    UnknownGroups {
        invalid: Vec<String>,
        valid: Vec<String>,
    },

    #[error("group selector failed: {0}")]
    Capability(#[from] CapabilityError),
}

impl NarrowingError {
    /// 给选择器的纠正提示（仅 UnknownGroups / Empty 有意义）
    pub fn correction_hint(&self) -> Option<String> {
        match self {
            NarrowingError::UnknownGroups { valid, .. } => Some(format!(
                "Choose 1-2 groups only from: {}",
                valid.join(", ")
            )),
            NarrowingError::Empty => Some("Select at least one capability group.".to_string()),
            NarrowingError::Capability(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_groups_message_lists_valid_names() {
        let err = NarrowingError::UnknownGroups {
            invalid: vec!["browser".to_string()],
            valid: vec!["filesystem".to_string(), "shell".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("browser"));
        assert!(msg.contains("filesystem, shell"));
        assert!(err.correction_hint().unwrap().contains("filesystem"));
    }

    #[test]
    fn test_planner_error_wraps_capability_error() {
        let err: PlanError = CapabilityError::Timeout("planner".to_string()).into();
        assert!(matches!(err, PlanError::Planner(CapabilityError::Timeout(_))));
    }
}
