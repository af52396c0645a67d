//! 任务模型：计划器产出、调度器消费的数据结构

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 任务编号，在一次运行内唯一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 任务编号分配器，多个计划器共享同一个分配器时编号不冲突
#[derive(Debug, Clone, Default)]
pub struct TaskIdGen {
    next: Arc<AtomicU64>,
}

impl TaskIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> TaskId {
        TaskId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskKind {
    MakeDir,
    CopyFile,
    RemoveFile,
    RemoveDir,
    Chmod,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::MakeDir => write!(f, "mkdir"),
            TaskKind::CopyFile => write!(f, "copy"),
            TaskKind::RemoveFile => write!(f, "unlink"),
            TaskKind::RemoveDir => write!(f, "rmdir"),
            TaskKind::Chmod => write!(f, "chmod"),
        }
    }
}

/// 一次文件系统变更。由计划器创建一次，调度器执行一次，不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTask {
    pub id: TaskId,
    pub kind: TaskKind,
    pub source_path: String,
    pub target_path: String,
    pub size: Option<u64>,
    pub mode: Option<u32>,
    /// 所在目录的 MakeDir 任务；None 表示父目录是已存在的根
    pub depends_on_dir: Option<TaskId>,
    /// 额外的先后顺序：chmod 跟随的任务、rmdir 的子项删除、替换前的删除
    pub after: Vec<TaskId>,
    /// CopyFile 覆盖已存在的目标
    pub overwrite: bool,
    /// CopyFile 先写临时文件再重命名
    pub use_temp_file: bool,
    /// MakeDir 连同缺失的上级目录一起创建，目录已存在不算错误
    pub recursive: bool,
}

impl TransferTask {
    fn base(id: TaskId, kind: TaskKind, source_path: &str, target_path: &str) -> Self {
        Self {
            id,
            kind,
            source_path: source_path.to_string(),
            target_path: target_path.to_string(),
            size: None,
            mode: None,
            depends_on_dir: None,
            after: Vec::new(),
            overwrite: false,
            use_temp_file: false,
            recursive: false,
        }
    }

    pub fn make_dir(id: TaskId, source_path: &str, target_path: &str) -> Self {
        Self::base(id, TaskKind::MakeDir, source_path, target_path)
    }

    pub fn copy_file(id: TaskId, source_path: &str, target_path: &str, size: u64) -> Self {
        let mut task = Self::base(id, TaskKind::CopyFile, source_path, target_path);
        task.size = Some(size);
        task
    }

    pub fn remove_file(id: TaskId, target_path: &str) -> Self {
        Self::base(id, TaskKind::RemoveFile, "", target_path)
    }

    pub fn remove_dir(id: TaskId, target_path: &str) -> Self {
        Self::base(id, TaskKind::RemoveDir, "", target_path)
    }

    /// 跟随 `follows` 任务之后修改权限
    pub fn chmod(id: TaskId, follows: &TransferTask, mode: u32) -> Self {
        let mut task = Self::base(id, TaskKind::Chmod, &follows.source_path, &follows.target_path);
        task.mode = Some(mode);
        task.depends_on_dir = follows.depends_on_dir;
        task.after.push(follows.id);
        task
    }

    pub fn in_dir(mut self, dir: Option<TaskId>) -> Self {
        self.depends_on_dir = dir;
        self
    }

    /// 根目录及其上级目录可能都不存在
    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    pub fn after_task(mut self, id: TaskId) -> Self {
        self.after.push(id);
        self
    }

    /// 执行前必须成功完成的全部任务
    pub fn prerequisites(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.depends_on_dir.iter().copied().chain(self.after.iter().copied())
    }

    pub fn is_removal(&self) -> bool {
        matches!(self.kind, TaskKind::RemoveFile | TaskKind::RemoveDir)
    }
}

/// 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferDirection {
    LocalToRemote,
    RemoteToLocal,
    /// 下载单个远程文件到本地临时文件
    RemoteToLocalTemp,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::LocalToRemote => write!(f, "local ➞ remote"),
            TransferDirection::RemoteToLocal => write!(f, "remote ➞ local"),
            TransferDirection::RemoteToLocalTemp => write!(f, "remote ➞ local temp"),
        }
    }
}

/// 忽略判断，参数是相对源根目录、以 / 分隔的路径
pub type IgnoreFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// 传输选项
#[derive(Clone)]
pub struct TransferOptions {
    /// 返回 true 的路径连同子树一起跳过。默认不忽略任何路径
    pub ignore: IgnoreFn,
    /// 保留目标端写入后得到的权限，不追加 chmod。默认 false
    pub preserve_target_mode: bool,
    /// 先写临时文件再原子重命名。默认 false
    pub use_temp_file: bool,
    /// 文件权限，仅在 preserve_target_mode 为 false 时生效
    pub file_perm: Option<u32>,
    /// 目录权限，仅在 preserve_target_mode 为 false 时生效
    pub dir_perm: Option<u32>,
    pub direction: TransferDirection,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            ignore: Arc::new(|_| false),
            preserve_target_mode: false,
            use_temp_file: false,
            file_perm: None,
            dir_perm: None,
            direction: TransferDirection::LocalToRemote,
        }
    }
}

impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOptions")
            .field("preserve_target_mode", &self.preserve_target_mode)
            .field("use_temp_file", &self.use_temp_file)
            .field("file_perm", &self.file_perm.map(|m| format!("{:o}", m)))
            .field("dir_perm", &self.dir_perm.map(|m| format!("{:o}", m)))
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

impl TransferOptions {
    pub fn with_ignore<F>(mut self, ignore: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.ignore = Arc::new(ignore);
        self
    }

    pub fn is_ignored(&self, rel_path: &str) -> bool {
        (self.ignore)(rel_path)
    }

    /// 文件需要追加的 chmod 权限
    pub fn file_chmod(&self) -> Option<u32> {
        if self.preserve_target_mode {
            None
        } else {
            self.file_perm
        }
    }

    /// 目录需要追加的 chmod 权限
    pub fn dir_chmod(&self) -> Option<u32> {
        if self.preserve_target_mode {
            None
        } else {
            self.dir_perm
        }
    }

    /// 入口处统一校验一次
    pub fn validate(&self) -> Result<(), EngineError> {
        for (name, perm) in [("filePerm", self.file_perm), ("dirPerm", self.dir_perm)] {
            if let Some(mode) = perm {
                if mode > 0o7777 {
                    return Err(EngineError::InvalidOptions(format!(
                        "{} 超出范围: {:o}",
                        name, mode
                    )));
                }
            }
        }
        Ok(())
    }
}

/// 同步选项，在传输选项基础上增加差异策略
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub transfer: TransferOptions,
    /// 删除目标端多余的条目。默认 false
    pub delete: bool,
    /// 不创建目标端缺失的条目。默认 false
    pub skip_create: bool,
    /// 目标端已存在的条目一律不动。默认 false
    pub ignore_existing: bool,
    /// 只有源文件严格更新时才覆盖。默认 false（总是覆盖）
    pub update: bool,
}

impl SyncOptions {
    pub fn validate(&self) -> Result<(), EngineError> {
        self.transfer.validate()
    }
}
