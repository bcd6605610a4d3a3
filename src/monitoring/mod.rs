//! Resource Monitoring Module
//!
//! Provides utilities for tracking host capacity, resource usage and the
//! execution timeline of a run.
//!
//! # Components
//!
//! - [`HostCapacity`]: Cores and memory of the machine
//! - [`ResourceMonitor`]: CPU and memory usage tracking
//! - [`ExecutionTimeline`]: Job start/end timing for Gantt charts

pub mod resource;
pub mod timeline;

pub use resource::{HostCapacity, ResourceMonitor, ResourceSample};
pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
