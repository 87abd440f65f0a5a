//! 能力组筛选门
//!
//! 工具规划前让分类器为条目挑选 1-2 个能力组，缩小规划的选择空间。
//! 非法选择作为可恢复错误返回（附合法名称列表），不会被静默纠正。

use std::sync::Arc;
use std::time::Duration;

use crate::capability::{CapabilityGroup, CapabilityGroupSelector, SelectionRequest};
use crate::config::NarrowingSection;
use crate::core::{CapabilityError, NarrowingError};
use crate::plan::PlanItem;

pub struct CapabilityGate {
    selector: Arc<dyn CapabilityGroupSelector>,
    groups: Vec<CapabilityGroup>,
    max_groups: usize,
}

impl CapabilityGate {
    pub fn new(
        selector: Arc<dyn CapabilityGroupSelector>,
        groups: Vec<CapabilityGroup>,
        max_groups: usize,
    ) -> Self {
        Self {
            selector,
            groups,
            max_groups: max_groups.max(1),
        }
    }

    /// 按 [narrowing] 段构建；未启用或没有配置能力组时返回 None
    pub fn from_config(
        selector: Arc<dyn CapabilityGroupSelector>,
        config: &NarrowingSection,
    ) -> Option<Self> {
        if !config.enabled || config.groups.is_empty() {
            return None;
        }
        let groups = config
            .groups
            .iter()
            .map(|g| CapabilityGroup::new(g.name.clone(), g.description.clone()))
            .collect();
        Some(Self::new(selector, groups, config.max_groups))
    }

    pub fn groups(&self) -> &[CapabilityGroup] {
        &self.groups
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.name.clone()).collect()
    }

    /// 询问分类器并校验结果
    pub async fn select_groups(
        &self,
        item: &PlanItem,
        correction: Option<String>,
    ) -> Result<Vec<String>, NarrowingError> {
        let request = SelectionRequest {
            item: item.clone(),
            available: self.groups.clone(),
            correction,
        };
        let selected = self.selector.select(&request).await?;
        self.validate_selection(selected)
    }

    /// 去重、去空白；空选择与未知名称是错误，超出 max_groups 截断并告警
    pub fn validate_selection(&self, selected: Vec<String>) -> Result<Vec<String>, NarrowingError> {
        let mut names: Vec<String> = Vec::new();
        for name in selected.into_iter().map(|s| s.trim().to_string()) {
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        if names.is_empty() {
            return Err(NarrowingError::Empty);
        }

        let invalid: Vec<String> = names
            .iter()
            .filter(|n| !self.groups.iter().any(|g| &g.name == *n))
            .cloned()
            .collect();
        if !invalid.is_empty() {
            return Err(NarrowingError::UnknownGroups {
                invalid,
                valid: self.group_names(),
            });
        }

        if names.len() > self.max_groups {
            tracing::warn!(
                selected = names.len(),
                max = self.max_groups,
                "too many capability groups selected, truncating"
            );
            names.truncate(self.max_groups);
        }
        Ok(names)
    }

    /// 引擎使用的筛选流程：失败时带纠正提示重问一次，仍失败则退回全部能力组
    pub async fn narrow(&self, item: &PlanItem, timeout: Duration) -> Vec<String> {
        let first = self.select_with_timeout(item, None, timeout).await;
        let err = match first {
            Ok(groups) => return groups,
            Err(err) => err,
        };
        tracing::warn!(item_id = item.id, error = %err, "capability selection rejected");

        if let Some(hint) = err.correction_hint() {
            match self.select_with_timeout(item, Some(hint), timeout).await {
                Ok(groups) => return groups,
                Err(err) => {
                    tracing::warn!(item_id = item.id, error = %err, "capability selection retry rejected")
                }
            }
        }
        tracing::info!(item_id = item.id, "falling back to all capability groups");
        self.group_names()
    }

    async fn select_with_timeout(
        &self,
        item: &PlanItem,
        correction: Option<String>,
        timeout: Duration,
    ) -> Result<Vec<String>, NarrowingError> {
        tokio::time::timeout(timeout, self.select_groups(item, correction))
            .await
            .unwrap_or_else(|_| {
                Err(NarrowingError::Capability(CapabilityError::Timeout(
                    "group selector".to_string(),
                )))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::mock::StaticGroupSelector;

    fn groups() -> Vec<CapabilityGroup> {
        vec![
            CapabilityGroup::new("filesystem", "files"),
            CapabilityGroup::new("shell", "commands"),
            CapabilityGroup::new("browser", "web pages"),
        ]
    }

    fn gate(selector: StaticGroupSelector) -> (CapabilityGate, Arc<StaticGroupSelector>) {
        let selector = Arc::new(selector);
        (CapabilityGate::new(selector.clone(), groups(), 2), selector)
    }

    #[test]
    fn test_validate_rejects_unknown_and_empty() {
        let (gate, _) = gate(StaticGroupSelector::new(["shell"]));
        assert_eq!(gate.validate_selection(vec![]), Err(NarrowingError::Empty));
        match gate.validate_selection(vec!["shell".into(), "email".into()]) {
            Err(NarrowingError::UnknownGroups { invalid, valid }) => {
                assert_eq!(invalid, vec!["email"]);
                assert_eq!(valid.len(), 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_validate_dedups_and_truncates() {
        let (gate, _) = gate(StaticGroupSelector::new(["shell"]));
        let selected = gate
            .validate_selection(vec![
                " shell".into(),
                "shell".into(),
                "browser".into(),
                "filesystem".into(),
            ])
            .unwrap();
        assert_eq!(selected, vec!["shell", "browser"]);
    }

    #[tokio::test]
    async fn test_narrow_reasks_once_with_correction_hint() {
        let (gate, selector) =
            gate(StaticGroupSelector::new(["filesystem"]).then_first(["email"]));
        let item = PlanItem::new(1, "Save notes", "saved");
        let groups = gate.narrow(&item, Duration::from_secs(1)).await;
        assert_eq!(groups, vec!["filesystem"]);

        let requests = selector.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].correction.is_none());
        assert!(requests[1].correction.as_deref().unwrap().contains("filesystem"));
    }

    #[tokio::test]
    async fn test_narrow_falls_back_to_all_groups() {
        let (gate, _) = gate(StaticGroupSelector::new(["nope"]));
        let item = PlanItem::new(1, "Do something", "done");
        let groups = gate.narrow(&item, Duration::from_secs(1)).await;
        assert_eq!(groups, vec!["filesystem", "shell", "browser"]);
    }
}
