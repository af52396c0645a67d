pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use crate::core::{
    Engine, RunReport, SyncOptions, SyncPlanner, TransferDirection, TransferOptions,
    TransferPlanner, TransferScheduler,
};
pub use config::{StorageConfig, StorageType, SyncProfile};
pub use error::{EngineError, FsError, SchedulerError};
pub use storage::{create_storage, FileSystem, LocalFs, OperatorFs};
