//! 错误类型

use crate::core::task::TaskId;
use serde::Serialize;
use thiserror::Error;

/// 文件系统操作错误（本地与远程后端共用同一分类）
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FsError {
    #[error("路径不存在: {path}")]
    NotFound { path: String },

    #[error("权限不足: {path}")]
    PermissionDenied { path: String },

    #[error("路径已存在: {path}")]
    AlreadyExists { path: String },

    #[error("IO 错误: {path}: {message}")]
    Io { path: String, message: String },

    /// 设备、套接字等，只跳过不算失败
    #[error("不支持的文件类型: {path}")]
    UnsupportedEntryKind { path: String },

    #[error("前置任务 {prerequisite} 失败: {path}")]
    DependencyFailed { path: String, prerequisite: TaskId },
}

impl FsError {
    /// 按 io::ErrorKind 归类，并附带出错路径
    pub fn from_io(path: &str, err: std::io::Error) -> Self {
        let path = path.to_string();
        match err.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound { path },
            std::io::ErrorKind::PermissionDenied => FsError::PermissionDenied { path },
            std::io::ErrorKind::AlreadyExists => FsError::AlreadyExists { path },
            _ => FsError::Io {
                path,
                message: err.to_string(),
            },
        }
    }

    pub fn from_opendal(path: &str, err: opendal::Error) -> Self {
        let path = path.to_string();
        match err.kind() {
            opendal::ErrorKind::NotFound => FsError::NotFound { path },
            opendal::ErrorKind::PermissionDenied => FsError::PermissionDenied { path },
            opendal::ErrorKind::AlreadyExists => FsError::AlreadyExists { path },
            _ => FsError::Io {
                path,
                message: err.to_string(),
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound { .. })
    }
}

/// 调度器使用错误（调用方编程错误，不包括单个任务失败）
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("并发数必须大于 0")]
    ZeroConcurrency,

    #[error("调度器已关闭，不能再添加任务")]
    Closed,

    #[error("调度器已结束运行，不能再添加任务")]
    Finished,
}

/// 引擎级错误：计划阶段的致命错误或调用方错误
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("无法遍历根目录: {0}")]
    Plan(#[from] FsError),

    #[error("删除失败: {0}")]
    Remove(FsError),

    #[error("选项无效: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("计划任务异常退出: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type FsResult<T> = std::result::Result<T, FsError>;
