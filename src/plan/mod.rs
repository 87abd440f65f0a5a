//! 计划模型：Plan / PlanItem、草稿格式、校验与执行工作队列

pub mod raw;
pub mod types;
pub mod validate;
pub mod work;

pub use raw::{ItemPatch, RawItem, RawNarration, RawPlan};
pub use types::{
    ExecutionState, ItemDigest, ItemId, ItemStatus, Narration, Plan, PlanId, PlanItem, PlanMode,
};
pub use validate::{build_inserted_items, build_plan, PlanLimits};
pub use work::{Slot, WorkQueue};
