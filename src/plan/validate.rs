//! 计划校验：RawPlan → Plan，以及拆分 / 重规划插入条目的校验
//!
//! 创建阶段任何错误都是致命的，不会返回部分计划。

use std::collections::HashSet;

use chrono::Utc;

use crate::config::EngineSection;
use crate::core::{CapabilityError, PlanError};
use crate::plan::{ExecutionState, ItemId, Plan, PlanItem, PlanMode, RawItem, RawPlan};

/// 条目数量与默认重试预算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub default_max_attempts: u32,
    /// standard 模式建议上限（超出仅告警）
    pub standard_advisory: usize,
    /// extended 模式硬上限
    pub extended_limit: usize,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self::from(&EngineSection::default())
    }
}

impl From<&EngineSection> for PlanLimits {
    fn from(engine: &EngineSection) -> Self {
        Self {
            default_max_attempts: engine.default_max_attempts.max(1),
            standard_advisory: engine.standard_item_advisory,
            extended_limit: engine.extended_item_limit,
        }
    }
}

/// 校验草稿并生成计划；条目按列表顺序从 1 开始编号
///
/// 草稿中显式给出的 id 不参与编号，但重复时整份草稿被拒绝。
pub fn build_plan(
    raw: RawPlan,
    request: impl Into<String>,
    limits: &PlanLimits,
) -> Result<Plan, PlanError> {
    let mode = raw.mode.unwrap_or_default();
    let count = raw.items.len();
    if count == 0 {
        return Err(PlanError::Empty);
    }
    match mode {
        PlanMode::Extended if count > limits.extended_limit => {
            return Err(PlanError::TooManyItems {
                mode: mode.to_string(),
                count,
                limit: limits.extended_limit,
            });
        }
        PlanMode::Standard if count > limits.standard_advisory => {
            tracing::warn!(
                count,
                advisory = limits.standard_advisory,
                "standard plan exceeds advisory item count"
            );
        }
        _ => {}
    }

    let mut declared = HashSet::new();
    if let Some(dup) = raw
        .items
        .iter()
        .filter_map(|r| r.id)
        .find(|&id| !declared.insert(id))
    {
        return Err(PlanError::DuplicateId(dup));
    }

    let mut items = Vec::with_capacity(count);
    for (index, raw_item) in raw.items.into_iter().enumerate() {
        let id = (index + 1) as ItemId;
        for &dep in &raw_item.dependencies {
            if dep == 0 || dep as usize > count {
                return Err(PlanError::UnknownDependency { item: id, dependency: dep });
            }
            if dep >= id {
                return Err(PlanError::ForwardDependency { item: id, dependency: dep });
            }
        }
        let item = to_item(id, raw_item, limits.default_max_attempts)
            .ok_or(PlanError::MissingCriteria { item: id })?;
        items.push(item);
    }

    Ok(Plan {
        id: uuid::Uuid::new_v4().to_string(),
        original_request: request.into(),
        mode,
        complexity_score: raw.complexity.unwrap_or(5).clamp(1, 10),
        items,
        execution: ExecutionState::default(),
        aborted: false,
        created_at: Utc::now(),
    })
}

/// 校验拆分 / 重规划产生的新条目
///
/// - `existing`：计划中已有的全部 id（含被替换的条目）
/// - `preceding`：执行顺序位于插入点之前的 id，新条目只能依赖它们或同批次中更早的条目
///
/// 缺省 id 从当前最大 id 之后顺延分配。
pub fn build_inserted_items(
    raw_items: Vec<RawItem>,
    existing: &HashSet<ItemId>,
    preceding: &HashSet<ItemId>,
    default_max_attempts: u32,
) -> Result<Vec<PlanItem>, CapabilityError> {
    if raw_items.is_empty() {
        return Err(CapabilityError::Rejected("no new items supplied".to_string()));
    }

    let mut next_id = existing
        .iter()
        .copied()
        .chain(raw_items.iter().filter_map(|r| r.id))
        .max()
        .unwrap_or(0);

    let mut batch: HashSet<ItemId> = HashSet::new();
    let mut items = Vec::with_capacity(raw_items.len());
    for raw in raw_items {
        let id = match raw.id {
            Some(id) if id > 0 => id,
            _ => {
                next_id += 1;
                next_id
            }
        };
        if existing.contains(&id) || batch.contains(&id) {
            return Err(CapabilityError::Rejected(format!("duplicate item id {id}")));
        }
        if let Some(&dep) = raw
            .dependencies
            .iter()
            .find(|dep| !preceding.contains(dep) && !batch.contains(dep))
        {
            return Err(CapabilityError::Rejected(format!(
                "item {id} depends on {dep}, which does not precede it"
            )));
        }
        let item = to_item(id, raw, default_max_attempts).ok_or_else(|| {
            CapabilityError::Rejected(format!("item {id} has no success criteria"))
        })?;
        batch.insert(id);
        items.push(item);
    }
    Ok(items)
}

/// 缺少成功标准时返回 None
fn to_item(id: ItemId, raw: RawItem, default_max_attempts: u32) -> Option<PlanItem> {
    let criteria = raw
        .success_criteria
        .filter(|c| !c.trim().is_empty())?;
    let max_attempts = raw.max_attempts.unwrap_or(default_max_attempts);
    let mut item = PlanItem::new(id, raw.action, criteria)
        .with_dependencies(raw.dependencies)
        .with_max_attempts(max_attempts);
    item.tools_hint = raw.tools_hint;
    item.capability_hint = raw.capability_hint;
    item.parameters = raw.parameters;
    item.fallback_options = raw.fallback_options;
    if let Some(narration) = raw.narration {
        item.narration = narration.resolve(&item.action);
    }
    Some(item)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_plan(mode: PlanMode, deps: Vec<Vec<ItemId>>) -> RawPlan {
        RawPlan {
            mode: Some(mode),
            complexity: Some(3),
            items: deps
                .into_iter()
                .enumerate()
                .map(|(i, d)| RawItem::new(format!("step {}", i + 1), "done").with_dependencies(d))
                .collect(),
        }
    }

    #[test]
    fn test_ids_assigned_in_list_order() {
        let mut raw = raw_plan(PlanMode::Standard, vec![vec![], vec![], vec![1]]);
        raw.items[0].id = Some(42);
        let plan = build_plan(raw, "req", &PlanLimits::default()).unwrap();
        let ids: Vec<_> = plan.items.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(plan.items[2].dependencies, vec![1]);
        assert_eq!(plan.items[0].max_attempts, 3);
    }

    #[test]
    fn test_duplicate_draft_ids_rejected() {
        let mut raw = raw_plan(PlanMode::Standard, vec![vec![], vec![], vec![]]);
        raw.items[0].id = Some(7);
        raw.items[2].id = Some(7);
        assert_eq!(
            build_plan(raw, "req", &PlanLimits::default()),
            Err(PlanError::DuplicateId(7))
        );
    }

    #[test]
    fn test_empty_plan_rejected() {
        let raw = RawPlan::default();
        assert_eq!(build_plan(raw, "req", &PlanLimits::default()), Err(PlanError::Empty));
    }

    #[test]
    fn test_self_and_forward_dependencies_rejected() {
        let raw = raw_plan(PlanMode::Standard, vec![vec![], vec![2]]);
        assert_eq!(
            build_plan(raw, "req", &PlanLimits::default()),
            Err(PlanError::ForwardDependency { item: 2, dependency: 2 })
        );

        let raw = raw_plan(PlanMode::Standard, vec![vec![2], vec![]]);
        assert_eq!(
            build_plan(raw, "req", &PlanLimits::default()),
            Err(PlanError::ForwardDependency { item: 1, dependency: 2 })
        );

        let raw = raw_plan(PlanMode::Standard, vec![vec![], vec![9]]);
        assert_eq!(
            build_plan(raw, "req", &PlanLimits::default()),
            Err(PlanError::UnknownDependency { item: 2, dependency: 9 })
        );
    }

    #[test]
    fn test_mode_item_limits() {
        let extended = raw_plan(PlanMode::Extended, vec![vec![]; 11]);
        assert!(matches!(
            build_plan(extended, "req", &PlanLimits::default()),
            Err(PlanError::TooManyItems { count: 11, limit: 10, .. })
        ));

        // standard 模式超出建议值只告警
        let standard = raw_plan(PlanMode::Standard, vec![vec![]; 5]);
        assert_eq!(build_plan(standard, "req", &PlanLimits::default()).unwrap().items.len(), 5);
    }

    #[test]
    fn test_missing_criteria_rejected() {
        let mut raw = raw_plan(PlanMode::Standard, vec![vec![], vec![]]);
        raw.items[1].success_criteria = Some("   ".to_string());
        assert_eq!(
            build_plan(raw, "req", &PlanLimits::default()),
            Err(PlanError::MissingCriteria { item: 2 })
        );
    }

    #[test]
    fn test_inserted_items_assign_ids_and_check_dependencies() {
        let existing: HashSet<ItemId> = [1, 2, 3].into_iter().collect();
        let preceding: HashSet<ItemId> = [1].into_iter().collect();

        let items = build_inserted_items(
            vec![
                RawItem::new("a", "ok").with_dependencies(vec![1]),
                RawItem::new("b", "ok").with_dependencies(vec![4]),
            ],
            &existing,
            &preceding,
            2,
        )
        .unwrap();
        assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(items[0].max_attempts, 2);

        let err = build_inserted_items(
            vec![RawItem::new("a", "ok").with_dependencies(vec![3])],
            &existing,
            &preceding,
            3,
        )
        .unwrap_err();
        assert!(matches!(err, CapabilityError::Rejected(_)));

        let err = build_inserted_items(
            vec![RawItem::new("a", "ok").with_id(2)],
            &existing,
            &preceding,
            3,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }
}
