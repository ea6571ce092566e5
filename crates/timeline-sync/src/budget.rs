use crate::media::ClipSource;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Memory accounting for resident buffer slots.
///
/// Only the preload manager mutates the budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBudget {
    used_mb: u64,
    max_mb: u64,
    max_slots: usize,
    fallback_estimate_mb: u64,
}

impl MemoryBudget {
    pub fn new(max_mb: u64, max_slots: usize, fallback_estimate_mb: u64) -> Self {
        Self {
            used_mb: 0,
            max_mb,
            max_slots,
            fallback_estimate_mb,
        }
    }

    pub fn used_mb(&self) -> u64 {
        self.used_mb
    }

    pub fn max_mb(&self) -> u64 {
        self.max_mb
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    pub fn available_mb(&self) -> u64 {
        self.max_mb.saturating_sub(self.used_mb)
    }

    /// Per-clip size estimate in whole megabytes, rounded up.
    pub fn estimate_mb(&self, source: &ClipSource) -> u64 {
        match source.estimated_bytes {
            Some(bytes) => bytes.div_ceil(BYTES_PER_MB).max(1),
            None => self.fallback_estimate_mb,
        }
    }

    /// Returns true when one more slot of `estimate_mb` fits next to
    /// `resident_slots` existing ones.
    pub fn fits(&self, estimate_mb: u64, resident_slots: usize) -> bool {
        resident_slots < self.max_slots && self.used_mb.saturating_add(estimate_mb) <= self.max_mb
    }

    pub(crate) fn reserve(&mut self, estimate_mb: u64) {
        self.used_mb = self.used_mb.saturating_add(estimate_mb);
    }

    pub(crate) fn release(&mut self, estimate_mb: u64) {
        self.used_mb = self.used_mb.saturating_sub(estimate_mb);
    }
}
