use std::collections::HashMap;

/// Per-group unread counters. Before the first membership baseline every group is accepted;
/// afterwards only member groups are counted.
#[derive(Debug, Default)]
pub(crate) struct UnreadTracker {
    counts: HashMap<String, u32>,
    baseline_loaded: bool,
}

impl UnreadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether a counter changed.
    pub fn increment(&mut self, group_id: &str) -> bool {
        if self.baseline_loaded && !self.counts.contains_key(group_id) {
            return false;
        }
        let c = self.counts.entry(group_id.to_string()).or_insert(0);
        *c = c.saturating_add(1);
        true
    }

    pub fn reset(&mut self, group_id: &str) {
        if let Some(c) = self.counts.get_mut(group_id) {
            *c = 0;
        } else if !self.baseline_loaded {
            self.counts.insert(group_id.to_string(), 0);
        }
    }

    pub fn counts(&self) -> &HashMap<String, u32> {
        &self.counts
    }

    pub fn count(&self, group_id: &str) -> u32 {
        self.counts.get(group_id).copied().unwrap_or(0)
    }

    /// New membership baseline: retained groups keep their count, new ones start at 0,
    /// departed ones are dropped, and the active group is 0.
    pub fn set_memberships<I>(&mut self, group_ids: I, active: Option<&str>)
    where
        I: IntoIterator<Item = String>,
    {
        let mut next = HashMap::new();
        for id in group_ids {
            let count = if Some(id.as_str()) == active {
                0
            } else {
                self.counts.get(&id).copied().unwrap_or(0)
            };
            next.insert(id, count);
        }
        self.counts = next;
        self.baseline_loaded = true;
    }

    pub fn clear(&mut self) {
        self.counts.clear();
        self.baseline_loaded = false;
    }
}
