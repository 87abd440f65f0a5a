//! Waypoint - 自适应计划执行引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型
//! - **plan**: Plan / PlanItem 数据模型、草稿格式、校验、执行工作队列
//! - **capability**: 外部能力契约（规划 / 执行 / 验证 / 调整 / 重规划 / 播报 / 能力组筛选）及 LLM 与脚本化实现
//! - **llm**: LLM 客户端抽象
//! - **feedback**: 优先级播报队列
//! - **executor**: 执行引擎、条目恢复状态机、执行总结
//! - **observability**: tracing 初始化

pub mod capability;
pub mod config;
pub mod core;
pub mod executor;
pub mod feedback;
pub mod llm;
pub mod observability;
pub mod plan;

pub use executor::{Capabilities, ExecutionEngine, Summary};
pub use feedback::FeedbackQueue;
pub use plan::{Plan, PlanItem, RawPlan};
