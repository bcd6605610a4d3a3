//! Job Scheduling Module
//!
//! Turns an analysed job graph into executor submissions under resource
//! constraints.
//!
//! # Components
//!
//! - [`ResourcePool`]: Capacity accounting for named resources
//! - [`Unit`]: A job, or a connected group of jobs, dispatched as one
//! - [`dispatch_order`]: Priority and secondary-key ordering of ready units
//! - [`Scheduler`]: The coordinator loop

pub mod groups;
pub mod pool;
pub mod scheduler;
pub mod selector;

pub use groups::{build_units, Unit, UnitId};
pub use pool::{Demand, ResourcePool};
pub use scheduler::{Scheduler, PAUSE_CHECK_INTERVAL};
pub use selector::{admit, dispatch_order};
