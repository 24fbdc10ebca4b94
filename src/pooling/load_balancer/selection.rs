//! Target bookkeeping shared by every balancing policy
//!
//! Items here are `pub` only so the policy trait can name them; the module
//! itself is private, which keeps [`Policy`] sealed.

use super::{Allocation, HealthCache, LoadBalancerConfig, Target, Validator};
use crate::pooling::cache::Cache;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Live allocations keyed by borrower
pub(super) type BorrowerMap = parking_lot::Mutex<HashMap<String, Allocation>>;

/// Per-target weight and load
#[derive(Debug, Clone, Copy)]
pub struct TargetSlot {
    pub weight: u32,
    pub outstanding: usize,
    /// Distinguishes a re-added target from the one it replaced
    generation: u64,
}

/// Targets in insertion order
#[derive(Debug, Default)]
pub struct TargetTable {
    slots: IndexMap<String, TargetSlot>,
    generations: u64,
}

impl TargetTable {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TargetSlot)> {
        self.slots.iter().map(|(id, slot)| (id.as_str(), slot))
    }

    /// Whether the target exists with a non-zero weight
    pub fn is_active(&self, id: &str) -> bool {
        self.slots.get(id).is_some_and(|slot| slot.weight > 0)
    }

    /// Whether an allocation made at `generation` still points at an
    /// active target
    pub(super) fn is_current(&self, id: &str, generation: u64) -> bool {
        self.slots
            .get(id)
            .is_some_and(|slot| slot.weight > 0 && slot.generation == generation)
    }

    /// Add one unit of load, returning the slot generation
    pub(super) fn increase_load(&mut self, id: &str) -> Option<u64> {
        self.slots.get_mut(id).map(|slot| {
            slot.outstanding += 1;
            slot.generation
        })
    }

    pub(super) fn decrease_load(&mut self, id: &str) {
        if let Some(slot) = self.slots.get_mut(id) {
            slot.outstanding = slot.outstanding.saturating_sub(1);
        }
    }

    /// Give back load taken at `generation`; a replaced target is untouched
    pub(super) fn release(&mut self, id: &str, generation: u64) {
        if let Some(slot) = self.slots.get_mut(id) {
            if slot.generation == generation {
                slot.outstanding = slot.outstanding.saturating_sub(1);
            }
        }
    }
}

/// Selection state common to all policies
///
/// Health lookups and validators may run caller code that calls back into
/// the balancer, so they are never evaluated with the table lock held.
pub struct BalancerCore {
    table: Arc<parking_lot::Mutex<TargetTable>>,
    borrowers: Arc<BorrowerMap>,
    sticky: Option<Cache<String, String>>,
    unhealthy: Option<Arc<HealthCache>>,
}

impl BalancerCore {
    pub fn new(config: &LoadBalancerConfig, sticky: bool) -> Self {
        Self {
            table: Arc::new(parking_lot::Mutex::new(TargetTable::default())),
            borrowers: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            sticky: sticky.then(|| Cache::new(config.sticky.clone())),
            unhealthy: None,
        }
    }

    pub fn set_unhealthy(&mut self, unhealthy: Arc<HealthCache>) {
        self.unhealthy = Some(unhealthy);
    }

    pub fn set_weight(&self, id: &str, weight: u32) {
        let mut table = self.table.lock();
        match table.slots.get_mut(id) {
            Some(slot) => slot.weight = weight,
            None => {
                table.generations += 1;
                let generation = table.generations;
                table.slots.insert(
                    id.to_string(),
                    TargetSlot {
                        weight,
                        outstanding: 0,
                        generation,
                    },
                );
            }
        }
        tracing::debug!("Target {} weight set to {}", id, weight);
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = self.table.lock().slots.shift_remove(id).is_some();
        if removed {
            tracing::debug!("Target {} removed", id);
        }
        removed
    }

    pub fn targets(&self) -> Vec<Target> {
        self.table
            .lock()
            .iter()
            .map(|(id, slot)| Target::with_weight(id, slot.weight))
            .collect()
    }

    pub fn outstanding(&self, id: &str) -> usize {
        self.table
            .lock()
            .slots
            .get(id)
            .map_or(0, |slot| slot.outstanding)
    }

    #[cfg(test)]
    pub fn borrower_count(&self) -> usize {
        self.borrowers.lock().len()
    }

    /// Health cache and validator combined into one eligibility test
    pub fn eligibility<'a>(
        &'a self,
        unhealthy: Option<&'a HealthCache>,
        validator: Option<Validator<'a>>,
    ) -> impl Fn(&str) -> bool + 'a {
        let health = unhealthy.or(self.unhealthy.as_deref());
        move |id: &str| validator.map_or(true, |accept| accept(id)) && is_healthy(health, id)
    }

    /// Live allocation already held by a borrower
    ///
    /// An allocation whose target was removed, re-added, zero-weighted or
    /// failed `eligible` is released and `None` is returned.
    pub fn borrowed(
        &self,
        borrower: &str,
        eligible: &dyn Fn(&str) -> bool,
    ) -> Option<Allocation> {
        let existing = self
            .borrowers
            .lock()
            .get(borrower)
            .filter(|allocation| !allocation.is_released())
            .cloned()?;

        let current = self
            .table
            .lock()
            .is_current(existing.id(), existing.generation());
        if current && eligible(existing.id()) {
            return Some(existing);
        }

        tracing::debug!(
            "Borrower {} leaves ineligible target {}",
            borrower,
            existing.id()
        );
        existing.release();
        None
    }

    /// Pick a target id, honoring sticky tags and `eligible`
    pub fn choose<F>(
        &self,
        tag: Option<&str>,
        eligible: &dyn Fn(&str) -> bool,
        pick: F,
    ) -> Option<String>
    where
        F: FnOnce(&TargetTable, &dyn Fn(&str) -> bool) -> Option<String>,
    {
        let sticky = self.sticky.as_ref().zip(tag);

        if let Some((sticky, tag)) = sticky {
            if let Some(id) = sticky.find(&tag.to_string()) {
                let active = self.table.lock().is_active(&id);
                if active && eligible(id.as_str()) {
                    return Some(id);
                }
            }
        }

        let candidates: Vec<String> = self
            .table
            .lock()
            .iter()
            .filter(|(_, slot)| slot.weight > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        let passed: HashSet<String> = candidates
            .into_iter()
            .filter(|id| eligible(id.as_str()))
            .collect();

        let chosen = {
            let table = self.table.lock();
            pick(&table, &|id: &str| passed.contains(id))
        };

        let Some(id) = chosen else {
            tracing::debug!("No eligible target");
            return None;
        };

        if let Some((sticky, tag)) = sticky {
            sticky.set(tag.to_string(), id.clone());
        }

        Some(id)
    }

    /// Account one allocation against `id` and hand out its handle
    ///
    /// Returns `None` if the target disappeared since it was chosen.
    pub fn allocate(&self, id: String, borrower: Option<&str>) -> Option<Allocation> {
        let generation = self.table.lock().increase_load(&id)?;
        let allocation = Allocation::new(
            id,
            generation,
            borrower.map(str::to_string),
            Arc::downgrade(&self.table),
            Arc::downgrade(&self.borrowers),
        );

        if let Some(borrower) = borrower {
            let previous = self
                .borrowers
                .lock()
                .insert(borrower.to_string(), allocation.clone());
            drop(previous);
        }

        Some(allocation)
    }

    pub fn increase_load(&self, id: &str) {
        self.table.lock().increase_load(id);
    }

    pub fn decrease_load(&self, id: &str) {
        self.table.lock().decrease_load(id);
    }

    pub fn release_borrower(&self, borrower: &str) -> bool {
        let allocation = self.borrowers.lock().remove(borrower);
        match allocation {
            Some(allocation) => {
                allocation.release();
                true
            }
            None => false,
        }
    }
}

fn is_healthy(unhealthy: Option<&HealthCache>, id: &str) -> bool {
    let Some(cache) = unhealthy else {
        return true;
    };

    match cache.get(&id.to_string()) {
        Ok(Some(reason)) => {
            tracing::debug!("Skipping unhealthy target {}: {}", id, reason);
            false
        }
        Ok(None) => true,
        Err(e) => {
            tracing::warn!("Health lookup for {} failed, treating as healthy: {}", id, e);
            true
        }
    }
}

/// Selection algorithm plugged into the shared [`BalancerCore`]
pub trait Policy: Send + Sync {
    fn core(&self) -> &BalancerCore;

    /// Choose among targets of `table` passing `eligible`
    fn pick(
        &self,
        table: &TargetTable,
        key: Option<&str>,
        eligible: &dyn Fn(&str) -> bool,
    ) -> Option<String>;

    fn on_set(&self, _id: &str, _weight: u32) {}

    fn on_remove(&self, _id: &str) {}
}
