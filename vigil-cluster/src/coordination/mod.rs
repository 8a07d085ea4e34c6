//! Task coordination.
//!
//! Decides which nodes check which monitors. Triggers (monitor changes,
//! membership changes, leadership) are debounced so a burst of changes
//! produces one redistribution, and only the leader replicates the result
//! as an `AssignTasks` command.

mod debounce;
mod placement;
mod service;

pub use debounce::Debouncer;
pub use placement::plan;
pub use service::{recompute, CoordinationService};
