//! Candidate Selection
//!
//! Orders ready units for dispatch: higher priority first, then the
//! configured [`DispatchOrder`], then declaration order. The coordinator
//! walks this order and admits every unit that still fits the pool.

use std::cmp::Reverse;

use crate::settings::DispatchOrder;

use super::groups::Unit;
use super::pool::ResourcePool;

/// Sorts `units` into dispatch order.
///
/// `downstream` gives the number of jobs waiting on each unit.
pub fn dispatch_order<'u>(
    mut units: Vec<&'u Unit>,
    order: DispatchOrder,
    downstream: impl Fn(&Unit) -> usize,
) -> Vec<&'u Unit> {
    units.sort_by_key(|unit| {
        let waiting = downstream(unit) as i64;
        let secondary = match order {
            DispatchOrder::MostDownstream => -waiting,
            DispatchOrder::FewestDownstream => waiting,
            DispatchOrder::Declaration => 0,
        };
        (Reverse(unit.priority), secondary, unit.jobs[0])
    });
    units
}

/// Greedy admission: takes units in order while they fit, skipping those
/// that do not. Allocates their demand from `pool`.
pub fn admit<'u>(ordered: Vec<&'u Unit>, pool: &mut ResourcePool) -> Vec<&'u Unit> {
    ordered
        .into_iter()
        .filter(|unit| pool.allocate(&unit.demand))
        .collect()
}
