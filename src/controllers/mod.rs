//! The two reconcile loops (spec.md §4.1, §4.6) and their shared plumbing.

pub mod cluster_controller;
pub mod context;
pub mod machine_controller;
pub mod metrics;

pub use context::{Context, State};
