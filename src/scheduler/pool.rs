//! Resource Pool
//!
//! Capacity accounting for named resources. Only the coordinator loop
//! touches the pool; demands are allocated on dispatch and released when
//! the executor reports an outcome.

use std::collections::BTreeMap;

use log::debug;

use crate::settings::Settings;
use crate::workflow::model::{CORES_RESOURCE, JOBS_RESOURCE};

/// Demand or capacity per resource name.
pub type Demand = BTreeMap<String, u64>;

#[derive(Debug, Clone, Default)]
pub struct ResourcePool {
    capacity: Demand,
    available: Demand,
}

impl ResourcePool {
    /// Pool with the given capacities. Resources not listed are unlimited.
    pub fn new(capacity: Demand) -> Self {
        Self {
            available: capacity.clone(),
            capacity,
        }
    }

    /// Cores, the unit limit and all declared limits of `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut capacity = settings.resources.limits.clone();
        capacity.insert(CORES_RESOURCE.to_string(), settings.cores() as u64);
        if let Some(max_jobs) = settings.resources.max_jobs {
            capacity.insert(JOBS_RESOURCE.to_string(), max_jobs as u64);
        }
        Self::new(capacity)
    }

    pub fn capacity(&self, resource: &str) -> Option<u64> {
        self.capacity.get(resource).copied()
    }

    pub fn available(&self, resource: &str) -> Option<u64> {
        self.available.get(resource).copied()
    }

    pub fn capacities(&self) -> &Demand {
        &self.capacity
    }

    /// Amount of `resource` currently allocated.
    pub fn in_use(&self, resource: &str) -> u64 {
        match (self.capacity(resource), self.available(resource)) {
            (Some(total), Some(free)) => total - free,
            _ => 0,
        }
    }

    /// First resource in `demand` exceeding total capacity.
    pub fn unsatisfiable(&self, demand: &Demand) -> Option<(String, u64, u64)> {
        demand.iter().find_map(|(name, &amount)| {
            self.capacity(name)
                .filter(|&total| amount > total)
                .map(|total| (name.clone(), amount, total))
        })
    }

    /// True if `demand` fits what is currently free.
    pub fn fits(&self, demand: &Demand) -> bool {
        demand
            .iter()
            .all(|(name, &amount)| self.available(name).map_or(true, |free| amount <= free))
    }

    /// Takes `demand` from the pool. Returns false, changing nothing, if it
    /// does not fit.
    pub fn allocate(&mut self, demand: &Demand) -> bool {
        if !self.fits(demand) {
            return false;
        }
        for (name, amount) in demand {
            if let Some(free) = self.available.get_mut(name) {
                *free -= amount;
            }
        }
        debug!("Allocated {:?}, available {:?}", demand, self.available);
        true
    }

    /// Returns `demand` to the pool.
    pub fn release(&mut self, demand: &Demand) {
        for (name, amount) in demand {
            if let (Some(free), Some(total)) = (self.available.get_mut(name), self.capacity.get(name)) {
                *free = (*free + amount).min(*total);
            }
        }
    }

    /// True when nothing is allocated.
    pub fn is_idle(&self) -> bool {
        self.capacity == self.available
    }
}
