//! 外部能力：契约 trait、数据类型、能力组筛选门、LLM 适配与脚本化实现

pub mod llm;
pub mod mock;
pub mod narrowing;
pub mod traits;
pub mod types;

pub use narrowing::CapabilityGate;
pub use traits::{
    Adjuster, CapabilityGroupSelector, NarrationSink, Planner, Replanner, ToolExecutor,
    ToolPlanner, Verifier,
};
pub use types::{
    AdjustStrategy, AdjustStrategyKind, Adjustment, AdjustmentResponse, CapabilityGroup,
    ExecutionResult, FailureContext, PlanContext, PlanView, ReplanDecision, ReplanStrategy,
    SelectionRequest, SpeakOptions, ToolCall, ToolCallOutcome, ToolInvocationPlan, Verification,
};
