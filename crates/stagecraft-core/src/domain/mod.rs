//! Domain model (IDs, stages, task records, claim pass, failure policy, ...).
//!
//! Everything here is free of I/O. Stores and the scheduler build on it.

pub mod claim;
pub mod decision;
pub mod dependency;
pub mod errors;
pub mod events;
pub mod ids;
pub mod plan;
pub mod stage;
pub mod state;
pub mod task;

pub use claim::{ClaimRequest, ClaimSource, ConcurrencyLimits, claim_order, run_claim_pass};
pub use decision::{Decider, Decision, DefaultDecider};
pub use dependency::DependencyGraph;
pub use errors::{ErrorKind, StageError};
pub use events::{ResetReason, SchedulerEvent};
pub use ids::{IdParseError, ProjectId, TaskId};
pub use plan::{PlanError, StageOptions, plan_project};
pub use stage::StageType;
pub use state::{StatusCounts, TaskStatus};
pub use task::{NewTask, Progress, TaskFailure, TaskRecord};
