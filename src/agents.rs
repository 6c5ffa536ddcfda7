//! Agent id to slot mapping.
//!
//! Every agent that appears anywhere in the store gets one slot, assigned in
//! ascending id order. Slots index the point cloud and the dense buffer, so
//! they must stay stable for the lifetime of a load.

use std::collections::HashMap;

use crate::AgentId;

/// Sorted, de-duplicated agent ids with their slot numbers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentIndex {
    ids: Vec<AgentId>,
    slots: HashMap<AgentId, usize>,
}

impl AgentIndex {
    /// Build from ids in any order. Duplicates collapse onto one slot.
    pub fn from_ids(mut ids: Vec<AgentId>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        let slots = ids
            .iter()
            .enumerate()
            .map(|(slot, &id)| (id, slot))
            .collect();
        Self { ids, slots }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[inline]
    pub fn slot_of(&self, agent_id: AgentId) -> Option<usize> {
        self.slots.get(&agent_id).copied()
    }

    pub fn id_of(&self, slot: usize) -> Option<AgentId> {
        self.ids.get(slot).copied()
    }

    /// All ids in slot order.
    pub fn ids(&self) -> &[AgentId] {
        &self.ids
    }

    /// `(slot, id)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, AgentId)> + '_ {
        self.ids.iter().copied().enumerate()
    }

    /// Ids for slots `start..start + len`, clamped to the index size.
    pub fn chunk(&self, start: usize, len: usize) -> &[AgentId] {
        let start = start.min(self.ids.len());
        let end = start.saturating_add(len).min(self.ids.len());
        &self.ids[start..end]
    }
}
