//! 任务调度：固定数量的工作协程按依赖顺序执行任务

use super::cache::CacheInvalidator;
use super::context::{CancelSignal, TransferContext};
use super::task::{TaskId, TaskKind, TransferTask};
use crate::error::{FsError, FsResult, SchedulerError};
use crate::storage::FileSystem;
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// 单个任务的失败记录
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub path: String,
    pub error: FsError,
}

/// 一次运行的汇总结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub start_time: i64,
    pub end_time: i64,
    /// 耗时（毫秒）
    pub duration: u64,
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
    /// 前置任务失败而未执行的任务，以及计划阶段跳过的不支持条目
    pub skipped: u32,
    pub failed: u32,
    /// chmod 失败，内容已就位
    pub degraded: u32,
    /// 取消时尚未开始的任务
    pub not_run: u32,
    pub cancelled: bool,
    pub bytes_transferred: u64,
    pub errors: Vec<TaskFailure>,
    /// 下载到临时文件时的本地路径
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_path: Option<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped_by_dependency() == 0 && !self.cancelled
    }

    pub fn skipped_by_dependency(&self) -> usize {
        self.errors
            .iter()
            .filter(|f| matches!(f.error, FsError::DependencyFailed { .. }))
            .count()
    }

    /// 前几条错误信息，供调用方展示
    pub fn first_errors(&self, n: usize) -> Vec<String> {
        self.errors
            .iter()
            .take(n)
            .map(|f| format!("{} {}: {}", f.kind, f.path, f.error))
            .collect()
    }
}

#[derive(Debug, Default)]
struct RunStats {
    created: u32,
    updated: u32,
    deleted: u32,
    skipped: u32,
    failed: u32,
    degraded: u32,
    bytes: u64,
    errors: Vec<TaskFailure>,
}

impl RunStats {
    fn succeeded(&mut self, task: &TransferTask, bytes: u64) {
        match task.kind {
            TaskKind::MakeDir => self.created += 1,
            TaskKind::CopyFile if task.overwrite => self.updated += 1,
            TaskKind::CopyFile => self.created += 1,
            TaskKind::RemoveFile | TaskKind::RemoveDir => self.deleted += 1,
            TaskKind::Chmod => {}
        }
        self.bytes += bytes;
    }

    fn failed(&mut self, task: &TransferTask, error: FsError) {
        warn!("任务失败 {} {} {}: {}", task.id, task.kind, task.target_path, error);
        self.failed += 1;
        self.errors.push(TaskFailure {
            task_id: task.id,
            kind: task.kind,
            path: task.target_path.clone(),
            error,
        });
    }

    fn dependency_failed(&mut self, task: &TransferTask, prerequisite: TaskId) {
        debug!("跳过 {} {}：前置任务 {} 失败", task.id, task.target_path, prerequisite);
        self.skipped += 1;
        self.errors.push(TaskFailure {
            task_id: task.id,
            kind: task.kind,
            path: task.target_path.clone(),
            error: FsError::DependencyFailed {
                path: task.target_path.clone(),
                prerequisite,
            },
        });
    }
}

struct Blocked {
    task: TransferTask,
    remaining: usize,
}

enum Step {
    Run(TransferTask),
    Wait,
    Exit,
}

#[derive(Default)]
struct SchedulerState {
    ready: VecDeque<TransferTask>,
    blocked: HashMap<TaskId, Blocked>,
    /// 前置任务 -> 等待它的任务
    waiters: HashMap<TaskId, Vec<TaskId>>,
    outcomes: HashMap<TaskId, bool>,
    running: usize,
    /// 取消后才加入的任务
    dropped: u32,
    closed: bool,
    finished: bool,
    stats: RunStats,
}

impl SchedulerState {
    fn admit(&mut self, task: TransferTask) {
        let mut pending = Vec::new();
        for prerequisite in task.prerequisites() {
            match self.outcomes.get(&prerequisite) {
                Some(true) => {}
                Some(false) => {
                    self.stats.dependency_failed(&task, prerequisite);
                    self.resolve(task.id, false);
                    return;
                }
                None => pending.push(prerequisite),
            }
        }

        if pending.is_empty() {
            self.ready.push_back(task);
            return;
        }
        for prerequisite in &pending {
            self.waiters.entry(*prerequisite).or_default().push(task.id);
        }
        self.blocked.insert(
            task.id,
            Blocked {
                task,
                remaining: pending.len(),
            },
        );
    }

    fn next_step(&mut self, cancelled: bool) -> Step {
        if cancelled {
            return Step::Exit;
        }
        if let Some(task) = self.ready.pop_front() {
            self.running += 1;
            return Step::Run(task);
        }
        if self.closed && self.running == 0 {
            self.fail_orphans();
            return Step::Exit;
        }
        Step::Wait
    }

    fn complete(&mut self, task: &TransferTask, result: FsResult<u64>) {
        self.running -= 1;
        match result {
            Ok(bytes) => {
                self.stats.succeeded(task, bytes);
                self.resolve(task.id, true);
            }
            // 权限是后端可选能力，chmod 失败不影响后续任务
            Err(e) if task.kind == TaskKind::Chmod => {
                warn!("设置权限失败 {}: {}", task.target_path, e);
                self.stats.degraded += 1;
                self.resolve(task.id, true);
            }
            Err(e) => {
                self.stats.failed(task, e);
                self.resolve(task.id, false);
            }
        }
    }

    /// 记录结果并释放（或级联跳过）等待它的任务
    fn resolve(&mut self, id: TaskId, ok: bool) {
        let mut pending = vec![(id, ok)];
        while let Some((id, ok)) = pending.pop() {
            self.outcomes.insert(id, ok);
            let Some(dependents) = self.waiters.remove(&id) else {
                continue;
            };
            for dependent in dependents {
                if ok {
                    let released = match self.blocked.get_mut(&dependent) {
                        Some(blocked) => {
                            blocked.remaining -= 1;
                            blocked.remaining == 0
                        }
                        None => false,
                    };
                    if released {
                        if let Some(blocked) = self.blocked.remove(&dependent) {
                            self.ready.push_back(blocked.task);
                        }
                    }
                } else if let Some(blocked) = self.blocked.remove(&dependent) {
                    self.stats.dependency_failed(&blocked.task, id);
                    pending.push((dependent, false));
                }
            }
        }
    }

    /// 关闭后仍在等待的任务：前置任务从未加入
    fn fail_orphans(&mut self) {
        if self.blocked.is_empty() {
            return;
        }
        let mut orphans: Vec<_> = self.blocked.drain().map(|(_, b)| b.task).collect();
        orphans.sort_by_key(|t| t.id);
        for task in orphans {
            let missing = task
                .prerequisites()
                .find(|p| self.outcomes.get(p) != Some(&true))
                .unwrap_or(task.id);
            self.stats.dependency_failed(&task, missing);
            self.outcomes.insert(task.id, false);
        }
        self.waiters.clear();
    }
}

struct Shared {
    state: Mutex<SchedulerState>,
    notify: Notify,
    cancel: CancelSignal,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 向调度器提交任务的句柄，可在计划器所在协程中使用
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// 提交任务；前置任务全部成功后才会执行
    pub fn add(&self, task: TransferTask) -> Result<(), SchedulerError> {
        {
            let mut state = self.shared.lock();
            if state.finished {
                return Err(SchedulerError::Finished);
            }
            if state.closed {
                return Err(SchedulerError::Closed);
            }
            if self.shared.cancel.is_cancelled() {
                state.dropped += 1;
                return Ok(());
            }
            state.admit(task);
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// 不再提交新任务，run() 在剩余任务执行完后返回
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    /// 停止派发新任务，正在执行的任务会执行完
    pub fn cancel(&self) {
        if !self.shared.cancel.is_cancelled() {
            info!("取消传输");
        }
        self.shared.cancel.cancel();
        self.shared.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

/// 执行单个任务
struct Executor {
    source: Arc<dyn FileSystem>,
    target: Arc<dyn FileSystem>,
    invalidator: Option<Arc<dyn CacheInvalidator>>,
}

impl Executor {
    async fn execute(&self, task: &TransferTask) -> FsResult<u64> {
        // release 构建是 panic = "abort"，只有 debug 和测试构建会捕获到 panic
        let result = match AssertUnwindSafe(self.apply(task)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!("任务执行异常 {} {}", task.id, task.target_path);
                Err(FsError::Io {
                    path: task.target_path.clone(),
                    message: "任务执行时发生 panic".to_string(),
                })
            }
        };
        if result.is_ok() {
            if let Some(invalidator) = &self.invalidator {
                invalidator.invalidate(&task.target_path);
            }
        }
        result
    }

    async fn apply(&self, task: &TransferTask) -> FsResult<u64> {
        let path = task.target_path.as_str();
        debug!("执行 {} {} {}", task.id, task.kind, path);
        match task.kind {
            TaskKind::MakeDir => {
                if let Err(e) = self.target.mkdir(path, task.recursive).await {
                    // 目录已存在视为成功
                    match self.target.lstat(path).await {
                        Ok(stat) if stat.is_dir() => {}
                        _ => return Err(e),
                    }
                }
                Ok(0)
            }
            TaskKind::CopyFile => self.copy_file(task).await,
            TaskKind::RemoveFile => self.target.unlink(path).await.map(|_| 0),
            TaskKind::RemoveDir => self.target.rmdir(path, false).await.map(|_| 0),
            TaskKind::Chmod => {
                let mode = task.mode.unwrap_or(0o644);
                self.target.chmod(path, mode).await.map(|_| 0)
            }
        }
    }

    async fn copy_file(&self, task: &TransferTask) -> FsResult<u64> {
        let stream = self.source.read_file(&task.source_path).await?;
        if !task.use_temp_file {
            return self.target.write_file(&task.target_path, stream).await;
        }
        if !self.target.supports_rename() {
            debug!("{} 不支持重命名，直接写入 {}", self.target.name(), task.target_path);
            return self.target.write_file(&task.target_path, stream).await;
        }

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let temp_path = format!("{}.tmp-{}", task.target_path, &suffix[..8]);

        let written = match self.target.write_file(&temp_path, stream).await {
            Ok(n) => n,
            Err(e) => {
                let _ = self.target.unlink(&temp_path).await;
                return Err(e);
            }
        };

        match self.target.rename(&temp_path, &task.target_path).await {
            Ok(()) => Ok(written),
            // 后端不允许覆盖已有目标：删除目标后重试一次
            Err(FsError::AlreadyExists { .. }) => {
                debug!("目标已存在，删除后重试重命名: {}", task.target_path);
                let retry = async {
                    match self.target.unlink(&task.target_path).await {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                    self.target.rename(&temp_path, &task.target_path).await
                };
                match retry.await {
                    Ok(()) => Ok(written),
                    Err(e) => {
                        let _ = self.target.unlink(&temp_path).await;
                        Err(e)
                    }
                }
            }
            // 其他错误保留原目标，只清理临时文件
            Err(e) => {
                let _ = self.target.unlink(&temp_path).await;
                Err(e)
            }
        }
    }
}

/// 传输调度器
pub struct TransferScheduler {
    shared: Arc<Shared>,
    executor: Executor,
    concurrency: usize,
}

impl TransferScheduler {
    pub fn new(
        source: Arc<dyn FileSystem>,
        target: Arc<dyn FileSystem>,
        concurrency: usize,
    ) -> Result<Self, SchedulerError> {
        Self::build(source, target, CancelSignal::new(), concurrency)
    }

    /// 使用运行上下文中的两端文件系统，并与计划器共享取消信号
    pub fn from_context(
        ctx: &TransferContext,
        concurrency: usize,
    ) -> Result<Self, SchedulerError> {
        Self::build(
            ctx.source.clone(),
            ctx.target.clone(),
            ctx.cancel.clone(),
            concurrency,
        )
    }

    fn build(
        source: Arc<dyn FileSystem>,
        target: Arc<dyn FileSystem>,
        cancel: CancelSignal,
        concurrency: usize,
    ) -> Result<Self, SchedulerError> {
        if concurrency == 0 {
            return Err(SchedulerError::ZeroConcurrency);
        }
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SchedulerState::default()),
                notify: Notify::new(),
                cancel,
            }),
            executor: Executor {
                source,
                target,
                invalidator: None,
            },
            concurrency,
        })
    }

    /// 变更成功后使缓存失效
    pub fn with_invalidator(mut self, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        self.executor.invalidator = Some(invalidator);
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// 执行直到 close() 之后全部任务结束，或取消后在途任务结束
    pub async fn run(self) -> Result<RunReport, SchedulerError> {
        let TransferScheduler {
            shared,
            executor,
            concurrency,
        } = self;
        if shared.lock().finished {
            return Err(SchedulerError::Finished);
        }

        let started = std::time::Instant::now();
        let start_time = Utc::now().timestamp();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!("开始执行 {} (并发 {})", run_id, concurrency);

        let executor = Arc::new(executor);
        let mut workers = JoinSet::new();
        for _ in 0..concurrency {
            workers.spawn(worker(shared.clone(), executor.clone()));
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("工作协程异常退出: {}", e);
            }
        }

        let cancelled = shared.cancel.is_cancelled();
        let (not_run, stats) = {
            let mut state = shared.lock();
            state.finished = true;
            let not_run =
                state.ready.len() as u32 + state.blocked.len() as u32 + state.dropped;
            state.ready.clear();
            state.blocked.clear();
            (not_run, std::mem::take(&mut state.stats))
        };

        let report = RunReport {
            run_id,
            start_time,
            end_time: Utc::now().timestamp(),
            duration: started.elapsed().as_millis() as u64,
            created: stats.created,
            updated: stats.updated,
            deleted: stats.deleted,
            skipped: stats.skipped,
            failed: stats.failed,
            degraded: stats.degraded,
            not_run,
            cancelled,
            bytes_transferred: stats.bytes,
            errors: stats.errors,
            scratch_path: None,
        };

        if cancelled {
            info!("传输已取消，{} 个任务未执行", not_run);
        }
        info!(
            "执行完成: 新建 {}, 更新 {}, 删除 {}, 跳过 {}, 失败 {}, 降级 {}, 传输 {} 字节",
            report.created,
            report.updated,
            report.deleted,
            report.skipped,
            report.failed,
            report.degraded,
            report.bytes_transferred
        );
        Ok(report)
    }
}

async fn worker(shared: Arc<Shared>, executor: Arc<Executor>) {
    loop {
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let step = shared.lock().next_step(shared.cancel.is_cancelled());
        match step {
            Step::Run(task) => {
                let result = executor.execute(&task).await;
                shared.lock().complete(&task, result);
                shared.notify.notify_waiters();
            }
            Step::Wait => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = shared.cancel.cancelled() => {}
                }
            }
            Step::Exit => {
                shared.notify.notify_waiters();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskIdGen;
    use crate::storage::{ByteStream, DirEntry, FileStat, LocalFs};
    use async_trait::async_trait;

    #[derive(Clone, Copy)]
    enum RenameBehavior {
        /// 网络错误之类，和目标是否存在无关
        Fails,
        /// 对象存储：没有 rename
        Unsupported,
        /// 目标存在时拒绝覆盖
        NoOverwrite,
        Panics,
    }

    /// 本地磁盘，但 rename 的行为可配置
    struct RenameQuirkFs {
        inner: LocalFs,
        rename: RenameBehavior,
    }

    #[async_trait]
    impl FileSystem for RenameQuirkFs {
        async fn lstat(&self, path: &str) -> FsResult<FileStat> {
            self.inner.lstat(path).await
        }
        async fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
            self.inner.read_dir(path).await
        }
        async fn mkdir(&self, path: &str, recursive: bool) -> FsResult<()> {
            self.inner.mkdir(path, recursive).await
        }
        async fn read_file(&self, path: &str) -> FsResult<ByteStream> {
            self.inner.read_file(path).await
        }
        async fn write_file(&self, path: &str, stream: ByteStream) -> FsResult<u64> {
            self.inner.write_file(path, stream).await
        }
        async fn unlink(&self, path: &str) -> FsResult<()> {
            self.inner.unlink(path).await
        }
        async fn rmdir(&self, path: &str, recursive: bool) -> FsResult<()> {
            self.inner.rmdir(path, recursive).await
        }
        async fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
            self.inner.chmod(path, mode).await
        }
        async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
            match self.rename {
                RenameBehavior::Fails | RenameBehavior::Unsupported => Err(FsError::Io {
                    path: to.to_string(),
                    message: "rename refused".to_string(),
                }),
                RenameBehavior::NoOverwrite => {
                    if self.inner.exists(to).await? {
                        return Err(FsError::AlreadyExists {
                            path: to.to_string(),
                        });
                    }
                    self.inner.rename(from, to).await
                }
                RenameBehavior::Panics => panic!("rename exploded"),
            }
        }
        fn supports_rename(&self) -> bool {
            !matches!(self.rename, RenameBehavior::Unsupported)
        }
        fn name(&self) -> &str {
            "quirky"
        }
    }

    /// 用 temp 文件把 src/a.txt 覆盖到 dst/a.txt（目标原内容 "precious"）
    async fn overwrite_with_temp_file(rename: RenameBehavior) -> (RunReport, tempfile::TempDir) {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"fresh").unwrap();
        std::fs::write(dst.path().join("a.txt"), b"precious").unwrap();

        let target = RenameQuirkFs {
            inner: LocalFs::new(),
            rename,
        };
        let sched = TransferScheduler::new(Arc::new(LocalFs::new()), Arc::new(target), 1).unwrap();
        let handle = sched.handle();
        let mut copy = TransferTask::copy_file(
            TaskId(1),
            &path(&src, "a.txt"),
            &path(&dst, "a.txt"),
            5,
        );
        copy.use_temp_file = true;
        copy.overwrite = true;
        handle.add(copy).unwrap();
        handle.close();
        (sched.run().await.unwrap(), dst)
    }

    fn file_names(dir: &tempfile::TempDir) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    fn scheduler(concurrency: usize) -> TransferScheduler {
        TransferScheduler::new(Arc::new(LocalFs::new()), Arc::new(LocalFs::new()), concurrency)
            .unwrap()
    }

    fn path(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_str().unwrap().to_string()
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let result =
            TransferScheduler::new(Arc::new(LocalFs::new()), Arc::new(LocalFs::new()), 0);
        assert!(matches!(result, Err(SchedulerError::ZeroConcurrency)));
    }

    #[tokio::test]
    async fn failed_make_dir_skips_dependents() {
        let dst = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("f"), b"data").unwrap();
        let ids = TaskIdGen::new();

        let sched = scheduler(2);
        let handle = sched.handle();
        // 父目录不存在，非递归 mkdir 失败
        let dir = TransferTask::make_dir(ids.next_id(), "", &path(&dst, "missing/sub"));
        let copy = TransferTask::copy_file(ids.next_id(), &path(&src, "f"), &path(&dst, "missing/sub/f"), 4)
            .in_dir(Some(dir.id));
        let chmod = TransferTask::chmod(ids.next_id(), &copy, 0o600);
        let dir_id = dir.id;
        handle.add(dir).unwrap();
        handle.add(copy).unwrap();
        handle.add(chmod).unwrap();
        handle.close();

        let report = sched.run().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.created, 0);
        assert!(!report.is_success());
        assert!(report.errors.iter().any(|f| matches!(
            f.error,
            FsError::DependencyFailed { prerequisite, .. } if prerequisite == dir_id
        )));
    }

    #[tokio::test]
    async fn temp_file_copy_leaves_no_scratch_behind() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"new content").unwrap();
        std::fs::write(dst.path().join("a.txt"), b"old").unwrap();
        let ids = TaskIdGen::new();

        let sched = scheduler(1);
        let handle = sched.handle();
        let mut copy = TransferTask::copy_file(ids.next_id(), &path(&src, "a.txt"), &path(&dst, "a.txt"), 11);
        copy.use_temp_file = true;
        copy.overwrite = true;
        handle.add(copy).unwrap();
        handle.close();

        let report = sched.run().await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.bytes_transferred, 11);
        assert_eq!(std::fs::read(dst.path().join("a.txt")).unwrap(), b"new content");
        let names: Vec<_> = std::fs::read_dir(dst.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn chmod_failure_is_degraded_not_failed() {
        let dst = tempfile::tempdir().unwrap();
        let ids = TaskIdGen::new();
        let sched = scheduler(1);
        let handle = sched.handle();

        let dir = TransferTask::make_dir(ids.next_id(), "", &path(&dst, "d"));
        let mut chmod = TransferTask::chmod(ids.next_id(), &dir, 0o755);
        chmod.target_path = path(&dst, "not-there");
        handle.add(dir).unwrap();
        handle.add(chmod).unwrap();
        handle.close();

        let report = sched.run().await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.failed, 0);
        if cfg!(unix) {
            assert_eq!(report.degraded, 1);
        }
    }

    #[tokio::test]
    async fn add_after_close_or_finish_is_an_error() {
        let sched = scheduler(1);
        let handle = sched.handle();
        let ids = TaskIdGen::new();
        handle.close();
        assert_eq!(
            handle.add(TransferTask::remove_file(ids.next_id(), "/nope")),
            Err(SchedulerError::Closed)
        );

        let report = sched.run().await.unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(
            handle.add(TransferTask::remove_file(ids.next_id(), "/nope")),
            Err(SchedulerError::Finished)
        );
    }

    #[tokio::test]
    async fn cancel_before_run_leaves_everything_not_run() {
        let dst = tempfile::tempdir().unwrap();
        let ids = TaskIdGen::new();
        let sched = scheduler(2);
        let handle = sched.handle();
        for i in 0..3 {
            handle
                .add(TransferTask::make_dir(ids.next_id(), "", &path(&dst, &format!("d{}", i))))
                .unwrap();
        }
        handle.cancel();
        handle.add(TransferTask::make_dir(ids.next_id(), "", &path(&dst, "late"))).unwrap();
        handle.close();

        let report = sched.run().await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.not_run, 4);
        assert_eq!(report.created, 0);
        assert_eq!(std::fs::read_dir(dst.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn missing_prerequisite_fails_at_close() {
        let dst = tempfile::tempdir().unwrap();
        let sched = scheduler(1);
        let handle = sched.handle();
        let orphan = TransferTask::make_dir(TaskId(10), "", &path(&dst, "x")).in_dir(Some(TaskId(99)));
        handle.add(orphan).unwrap();
        handle.close();

        let report = sched.run().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(matches!(
            report.errors[0].error,
            FsError::DependencyFailed { prerequisite: TaskId(99), .. }
        ));
    }

    #[tokio::test]
    async fn failed_rename_keeps_the_existing_target() {
        let (report, dst) = overwrite_with_temp_file(RenameBehavior::Fails).await;
        assert_eq!(report.failed, 1);
        assert_eq!(std::fs::read(dst.path().join("a.txt")).unwrap(), b"precious");
        assert_eq!(file_names(&dst), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn backend_without_rename_writes_directly() {
        let (report, dst) = overwrite_with_temp_file(RenameBehavior::Unsupported).await;
        assert_eq!(report.failed, 0);
        assert_eq!(report.updated, 1);
        assert_eq!(std::fs::read(dst.path().join("a.txt")).unwrap(), b"fresh");
        assert_eq!(file_names(&dst), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn rename_refusing_to_overwrite_is_retried_once() {
        let (report, dst) = overwrite_with_temp_file(RenameBehavior::NoOverwrite).await;
        assert_eq!(report.updated, 1);
        assert_eq!(std::fs::read(dst.path().join("a.txt")).unwrap(), b"fresh");
        assert_eq!(file_names(&dst), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn panicking_task_is_recorded_and_the_run_finishes() {
        let (report, dst) = overwrite_with_temp_file(RenameBehavior::Panics).await;
        assert_eq!(report.failed, 1);
        assert!(!report.is_success());
        assert_eq!(std::fs::read(dst.path().join("a.txt")).unwrap(), b"precious");
    }

    #[tokio::test]
    async fn recursive_make_dir_creates_missing_parents() {
        let dst = tempfile::tempdir().unwrap();
        let ids = TaskIdGen::new();
        let sched = scheduler(1);
        let handle = sched.handle();
        let dir = TransferTask::make_dir(ids.next_id(), "", &path(&dst, "a/b/c")).recursive();
        let again = TransferTask::make_dir(ids.next_id(), "", &path(&dst, "a/b"))
            .recursive()
            .after_task(dir.id);
        handle.add(dir).unwrap();
        handle.add(again).unwrap();
        handle.close();

        let report = sched.run().await.unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.created, 2);
        assert!(dst.path().join("a/b/c").is_dir());
    }
}
