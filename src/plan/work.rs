//! 执行工作队列：条目 arena + 执行顺序 + 待访问队列
//!
//! 拆分 / 重规划会在执行中插入条目。引擎不直接遍历可变列表，而是从 `ready` 中取槽位；
//! 插入的新条目放到 `ready` 队首，保证在同一轮中紧接着被访问。

use std::collections::{HashMap, HashSet, VecDeque};

use crate::plan::{ItemDigest, ItemId, ItemStatus, PlanItem};

/// arena 下标
pub type Slot = usize;

#[derive(Debug, Clone, Default)]
pub struct WorkQueue {
    arena: Vec<PlanItem>,
    /// 当前执行顺序（被拆分替换的条目不在其中）
    order: Vec<Slot>,
    ready: VecDeque<Slot>,
    /// 被替换条目 id → 接替它的条目 id
    superseded: HashMap<ItemId, Vec<ItemId>>,
}

impl WorkQueue {
    pub fn new(items: Vec<PlanItem>) -> Self {
        let order: Vec<Slot> = (0..items.len()).collect();
        Self {
            ready: order.iter().copied().collect(),
            order,
            arena: items,
            superseded: HashMap::new(),
        }
    }

    /// 下一个待处理槽位；已是终态的条目（被绕过 / 中止）直接跳过
    pub fn next(&mut self) -> Option<Slot> {
        while let Some(slot) = self.ready.pop_front() {
            if !self.arena[slot].is_terminal() {
                return Some(slot);
            }
        }
        None
    }

    pub fn item(&self, slot: Slot) -> &PlanItem {
        &self.arena[slot]
    }

    pub fn item_mut(&mut self, slot: Slot) -> &mut PlanItem {
        &mut self.arena[slot]
    }

    /// 按 id 查找（同 id 取最近加入的条目）
    pub fn find(&self, id: ItemId) -> Option<Slot> {
        self.arena.iter().rposition(|i| i.id == id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// 按执行顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = &PlanItem> {
        self.order.iter().map(|&slot| &self.arena[slot])
    }

    pub fn digests(&self) -> Vec<ItemDigest> {
        self.iter().map(PlanItem::digest).collect()
    }

    /// 执行顺序位于 slot 之前的条目摘要
    pub fn digests_before(&self, slot: Slot) -> Vec<ItemDigest> {
        self.order
            .iter()
            .take_while(|&&s| s != slot)
            .map(|&s| self.arena[s].digest())
            .collect()
    }

    /// arena 中全部 id（含被替换的条目，新条目不得复用）
    pub fn all_ids(&self) -> HashSet<ItemId> {
        self.arena.iter().map(|i| i.id).collect()
    }

    /// 执行顺序位于 slot 之前的 id
    pub fn ids_before(&self, slot: Slot) -> HashSet<ItemId> {
        self.order
            .iter()
            .take_while(|&&s| s != slot)
            .map(|&s| self.arena[s].id)
            .collect()
    }

    /// 第一个未满足的依赖；None 表示可以执行
    pub fn unmet_dependency(&self, slot: Slot) -> Option<ItemId> {
        let preceding = self.ids_before(slot);
        self.arena[slot]
            .dependencies
            .iter()
            .copied()
            .find(|&dep| !self.is_satisfied(dep, &preceding, &mut HashSet::new()))
    }

    /// 依赖满足：条目 completed；若已被替换，则要求排在依赖方之前的全部接替条目满足
    ///
    /// 子条目沿用原 id 时，同批次里依赖该 id 的条目只等待沿用 id 的新条目。
    fn is_satisfied(
        &self,
        id: ItemId,
        preceding: &HashSet<ItemId>,
        visited: &mut HashSet<ItemId>,
    ) -> bool {
        if !visited.insert(id) {
            return false;
        }
        match self.superseded.get(&id) {
            Some(replacements) => {
                let before: Vec<ItemId> = replacements
                    .iter()
                    .copied()
                    .filter(|r| preceding.contains(r))
                    .collect();
                !before.is_empty()
                    && before.iter().all(|&r| {
                        if r == id {
                            self.status_of(r) == Some(ItemStatus::Completed)
                        } else {
                            self.is_satisfied(r, preceding, visited)
                        }
                    })
            }
            None => self.status_of(id) == Some(ItemStatus::Completed),
        }
    }

    fn status_of(&self, id: ItemId) -> Option<ItemStatus> {
        self.find(id).map(|slot| self.arena[slot].status)
    }

    fn position(&self, slot: Slot) -> Option<usize> {
        self.order.iter().position(|&s| s == slot)
    }

    /// 拆分：用新条目原位替换 slot，新条目紧接着被访问
    pub fn replace(&mut self, slot: Slot, items: Vec<PlanItem>) -> Vec<ItemId> {
        let Some(pos) = self.position(slot) else {
            return Vec::new();
        };
        let new_ids: Vec<ItemId> = items.iter().map(|i| i.id).collect();
        let new_slots = self.push_all(items);
        self.order.splice(pos..=pos, new_slots.iter().copied());
        self.schedule_front(&new_slots);

        // 沿用 id 的子条目再次被拆分时，在原有接替链中展开
        let old_id = self.arena[slot].id;
        let chain = match self.superseded.get(&old_id) {
            Some(previous) => previous
                .iter()
                .flat_map(|&r| if r == old_id { new_ids.clone() } else { vec![r] })
                .collect(),
            None => new_ids.clone(),
        };
        self.superseded.insert(old_id, chain);
        new_ids
    }

    /// 重规划：在 slot 之后插入新条目，新条目紧接着被访问
    pub fn insert_after(&mut self, slot: Slot, items: Vec<PlanItem>) -> Vec<ItemId> {
        let Some(pos) = self.position(slot) else {
            return Vec::new();
        };
        let new_ids: Vec<ItemId> = items.iter().map(|i| i.id).collect();
        let new_slots = self.push_all(items);
        self.order.splice(pos + 1..pos + 1, new_slots.iter().copied());
        self.schedule_front(&new_slots);
        new_ids
    }

    /// 记录 id 由 replacements 接替（依赖它的条目改为等待接替条目）
    pub fn supersede(&mut self, id: ItemId, replacements: Vec<ItemId>) {
        if !replacements.is_empty() {
            self.superseded.insert(id, replacements);
        }
    }

    /// 把 slot 与 continue_from 之间的 pending 条目标为 skipped
    ///
    /// continue_from 不存在或不在 slot 之后时不做任何事，返回 None。
    pub fn bypass_until(&mut self, slot: Slot, continue_from: ItemId) -> Option<Vec<ItemId>> {
        let pos = self.position(slot)?;
        let target = self.order[pos + 1..]
            .iter()
            .position(|&s| self.arena[s].id == continue_from && !self.arena[s].is_terminal())?
            + pos
            + 1;
        let mut bypassed = Vec::new();
        for &s in &self.order[pos + 1..target] {
            let item = &mut self.arena[s];
            if item.status == ItemStatus::Pending {
                item.finish(
                    ItemStatus::Skipped,
                    Some(format!("bypassed by replan, continuing from item {continue_from}")),
                );
                bypassed.push(item.id);
            }
        }
        Some(bypassed)
    }

    /// 把所有 pending 条目标为 skipped（计划中止）
    pub fn drain_pending(&mut self, reason: &str) -> Vec<ItemId> {
        let mut drained = Vec::new();
        for &slot in &self.order {
            let item = &mut self.arena[slot];
            if item.status == ItemStatus::Pending {
                item.finish(ItemStatus::Skipped, Some(reason.to_string()));
                drained.push(item.id);
            }
        }
        self.ready.clear();
        drained
    }

    /// 按执行顺序取出条目（被替换的条目丢弃）
    pub fn into_items(self) -> Vec<PlanItem> {
        let mut arena: Vec<Option<PlanItem>> = self.arena.into_iter().map(Some).collect();
        self.order
            .into_iter()
            .filter_map(|slot| arena[slot].take())
            .collect()
    }

    fn push_all(&mut self, items: Vec<PlanItem>) -> Vec<Slot> {
        let start = self.arena.len();
        self.arena.extend(items);
        (start..self.arena.len()).collect()
    }

    fn schedule_front(&mut self, slots: &[Slot]) {
        for &slot in slots.iter().rev() {
            self.ready.push_front(slot);
        }
    }
}
