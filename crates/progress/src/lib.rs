//! Progress reporting (Layer 3)
//!
//! Follows the foreground task across every task service of a context.

#![warn(missing_docs)]

pub mod monitor;

pub use monitor::{MonitorEvent, TaskMonitor};
