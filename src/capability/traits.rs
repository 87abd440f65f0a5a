//! 外部能力契约
//!
//! 引擎只通过这些 trait 与决策 / 执行后端交互。所有方法接收只读数据、返回新数据，
//! 计划本身只由引擎修改。

use async_trait::async_trait;

use crate::capability::{
    Adjustment, ExecutionResult, FailureContext, PlanContext, ReplanDecision, SelectionRequest,
    SpeakOptions, ToolInvocationPlan, Verification,
};
use crate::core::CapabilityError;
use crate::plan::{PlanItem, RawPlan};

/// 请求 → 计划草稿
#[async_trait]
pub trait Planner: Send + Sync {
    async fn create_plan(
        &self,
        request: &str,
        context: &serde_json::Value,
    ) -> Result<RawPlan, CapabilityError>;
}

/// 条目 → 工具调用计划
#[async_trait]
pub trait ToolPlanner: Send + Sync {
    async fn plan(
        &self,
        item: &PlanItem,
        context: &PlanContext,
    ) -> Result<ToolInvocationPlan, CapabilityError>;
}

/// 执行工具调用；单个调用失败记录在结果里，不返回错误
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, plan: &ToolInvocationPlan) -> ExecutionResult;
}

/// 按成功标准给出裁决
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(
        &self,
        item: &PlanItem,
        result: &ExecutionResult,
    ) -> Result<Verification, CapabilityError>;
}

/// 失败后的局部修复
#[async_trait]
pub trait Adjuster: Send + Sync {
    async fn adjust(
        &self,
        item: &PlanItem,
        verification: &Verification,
        attempt: u32,
    ) -> Result<Adjustment, CapabilityError>;
}

/// 重试耗尽后的深度重规划
#[async_trait]
pub trait Replanner: Send + Sync {
    async fn replan(&self, failure: &FailureContext) -> Result<ReplanDecision, CapabilityError>;
}

/// 播报出口（TTS / 状态栏 / 日志）
#[async_trait]
pub trait NarrationSink: Send + Sync {
    async fn speak(&self, text: &str, options: SpeakOptions) -> Result<(), CapabilityError>;
}

/// 能力组分类器：为条目挑选 1-2 个能力组
#[async_trait]
pub trait CapabilityGroupSelector: Send + Sync {
    async fn select(&self, request: &SelectionRequest) -> Result<Vec<String>, CapabilityError>;
}
