pub mod cache;
pub mod context;
pub mod engine;
pub mod filter;
pub mod planner;
pub mod scheduler;
pub mod sync;
pub mod task;

pub use cache::{CacheInvalidator, StatCache};
pub use context::{CancelSignal, TransferContext};
pub use engine::{plan_and_run, Engine, Plan};
pub use filter::{IgnoreMatcher, DEFAULT_IGNORE};
pub use planner::{PlanSummary, TransferPlanner};
pub use scheduler::{RunReport, SchedulerHandle, TaskFailure, TransferScheduler};
pub use sync::SyncPlanner;
pub use task::{
    IgnoreFn, SyncOptions, TaskId, TaskIdGen, TaskKind, TransferDirection, TransferOptions,
    TransferTask,
};
