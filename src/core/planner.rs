//! 单向传输计划：先序遍历源目录树，产出 MakeDir / CopyFile / Chmod 任务

use super::context::{CancelSignal, TransferContext};
use super::task::{TaskId, TransferOptions, TransferTask};
use crate::error::{EngineError, FsError};
use crate::storage::{join_path, parent_path, DirEntry, FileKind};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// 计划器与调度器之间通道的容量
pub const PLAN_CHANNEL_CAPACITY: usize = 256;

/// 计划统计
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub emitted: usize,
    /// 被 ignore 剪掉的子树数量
    pub ignored: usize,
    /// 目标已是最新、按策略跳过的条目数量
    pub unchanged: usize,
    /// 设备、套接字等不支持的条目，只跳过不算失败
    pub unsupported: Vec<FsError>,
    /// 无法读取的子目录（根目录读取失败直接返回错误）
    pub unreadable: Vec<String>,
    /// 因取消或接收端关闭而提前结束
    pub aborted: bool,
}

/// 任务发送端，记录统计并在取消后停止发送
pub(crate) struct TaskEmitter {
    tx: mpsc::Sender<TransferTask>,
    cancel: CancelSignal,
    pub(crate) summary: PlanSummary,
}

impl TaskEmitter {
    pub(crate) fn new(tx: mpsc::Sender<TransferTask>, cancel: CancelSignal) -> Self {
        Self {
            tx,
            cancel,
            summary: PlanSummary::default(),
        }
    }

    pub(crate) fn stopped(&mut self) -> bool {
        if !self.summary.aborted && self.cancel.is_cancelled() {
            info!("收到取消信号，停止遍历");
            self.summary.aborted = true;
        }
        self.summary.aborted
    }

    /// 发送任务，返回任务编号；已停止时返回 None
    pub(crate) async fn emit(&mut self, task: TransferTask) -> Option<TaskId> {
        if self.stopped() {
            return None;
        }
        let id = task.id;
        debug!("计划 {} {} {}", id, task.kind, task.target_path);
        if self.tx.send(task).await.is_err() {
            warn!("任务接收端已关闭，停止遍历");
            self.summary.aborted = true;
            return None;
        }
        self.summary.emitted += 1;
        Some(id)
    }

    pub(crate) fn unsupported(&mut self, path: &str) {
        warn!("跳过不支持的文件类型: {}", path);
        self.summary.unsupported.push(FsError::UnsupportedEntryKind {
            path: path.to_string(),
        });
    }

    pub(crate) fn finish(self) -> PlanSummary {
        self.summary
    }
}

/// 单向传输计划器
#[derive(Debug, Clone)]
pub struct TransferPlanner {
    ctx: TransferContext,
    options: TransferOptions,
}

impl TransferPlanner {
    pub fn new(ctx: TransferContext, options: TransferOptions) -> Self {
        Self { ctx, options }
    }

    /// 遍历源根目录，把任务依次发送到 tx
    ///
    /// 根路径是文件时只产出一个 CopyFile；根路径无法 stat 或读取时返回错误。
    pub async fn plan(&self, tx: mpsc::Sender<TransferTask>) -> Result<PlanSummary, EngineError> {
        self.options.validate()?;
        let ctx = &self.ctx;
        info!(
            "开始计划传输 ({}): {}:{} -> {}:{}",
            self.options.direction,
            ctx.source.name(),
            ctx.source_root,
            ctx.target.name(),
            ctx.target_root
        );

        let mut emitter = TaskEmitter::new(tx, ctx.cancel.clone());
        let root = ctx.source.lstat(&ctx.source_root).await?;

        match root.kind {
            FileKind::Directory => {
                let entries = ctx.source.read_dir(&ctx.source_root).await?;
                let root_dir = if ctx.target.exists(&ctx.target_root).await? {
                    None
                } else {
                    // 目标根目录的上级也可能不存在
                    let task = TransferTask::make_dir(
                        ctx.ids.next_id(),
                        &ctx.source_root,
                        &ctx.target_root,
                    )
                    .recursive();
                    self.emit_with_dir_chmod(task, &mut emitter).await
                };
                self.walk_entries(String::new(), entries, root_dir, &mut emitter)
                    .await;
            }
            FileKind::File | FileKind::SymbolicLink => {
                let parent_dir = self.ensure_target_parent(&mut emitter).await?;
                if !emitter.summary.aborted {
                    let task =
                        self.copy_task(&ctx.source_root, &ctx.target_root, root.size, parent_dir);
                    self.emit_with_file_chmod(task, &mut emitter).await;
                }
            }
            FileKind::Other => emitter.unsupported(&ctx.source_root),
        }

        let summary = emitter.finish();
        info!(
            "计划完成: {} 个任务, {} 个被忽略, {} 个不支持",
            summary.emitted,
            summary.ignored,
            summary.unsupported.len()
        );
        Ok(summary)
    }

    /// 单文件模式：只产出一个 CopyFile 到调用方给出的临时路径，不创建目录
    pub async fn plan_single_file(
        &self,
        source_path: &str,
        scratch_path: &str,
        tx: mpsc::Sender<TransferTask>,
    ) -> Result<PlanSummary, EngineError> {
        let stat = self.ctx.source.lstat(source_path).await?;
        let mut emitter = TaskEmitter::new(tx, self.ctx.cancel.clone());
        if stat.kind.is_content() {
            let task = self.copy_task(source_path, scratch_path, stat.size, None);
            emitter.emit(task).await;
        } else {
            emitter.unsupported(source_path);
        }
        Ok(emitter.finish())
    }

    /// 在后台任务中计划，返回惰性任务流和计划结果句柄
    pub fn stream(
        self,
    ) -> (
        ReceiverStream<TransferTask>,
        tokio::task::JoinHandle<Result<PlanSummary, EngineError>>,
    ) {
        let (tx, rx) = mpsc::channel(PLAN_CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move { self.plan(tx).await });
        (ReceiverStream::new(rx), handle)
    }

    /// 单文件根：目标文件的上级目录不存在时先递归创建
    async fn ensure_target_parent(
        &self,
        emitter: &mut TaskEmitter,
    ) -> Result<Option<TaskId>, EngineError> {
        let ctx = &self.ctx;
        let Some(parent) = parent_path(&ctx.target_root) else {
            return Ok(None);
        };
        if ctx.target.exists(parent).await? {
            return Ok(None);
        }
        let source_parent = parent_path(&ctx.source_root).unwrap_or_default();
        let task = TransferTask::make_dir(ctx.ids.next_id(), source_parent, parent).recursive();
        Ok(emitter.emit(task).await)
    }

    fn walk_entries<'a>(
        &'a self,
        rel_dir: String,
        entries: Vec<DirEntry>,
        dir_task: Option<TaskId>,
        emitter: &'a mut TaskEmitter,
    ) -> BoxFuture<'a, ()> {
        async move {
            for entry in entries {
                if emitter.stopped() {
                    return;
                }

                let rel = join_path(&rel_dir, &entry.name);
                if self.options.is_ignored(&rel) {
                    debug!("忽略: {}", rel);
                    emitter.summary.ignored += 1;
                    continue;
                }

                let source_path = self.ctx.source_path(&rel);
                let target_path = self.ctx.target_path(&rel);

                match entry.stat.kind {
                    FileKind::Directory => {
                        let task =
                            TransferTask::make_dir(self.ctx.ids.next_id(), &source_path, &target_path)
                                .in_dir(dir_task);
                        let Some(id) = self.emit_with_dir_chmod(task, emitter).await else {
                            return;
                        };
                        match self.ctx.source.read_dir(&source_path).await {
                            Ok(children) => {
                                self.walk_entries(rel, children, Some(id), emitter).await
                            }
                            Err(e) => {
                                warn!("读取目录失败: {} - {}", source_path, e);
                                emitter.summary.unreadable.push(source_path);
                            }
                        }
                    }
                    FileKind::File | FileKind::SymbolicLink => {
                        let task =
                            self.copy_task(&source_path, &target_path, entry.stat.size, dir_task);
                        self.emit_with_file_chmod(task, emitter).await;
                    }
                    FileKind::Other => emitter.unsupported(&source_path),
                }
            }
        }
        .boxed()
    }

    fn copy_task(
        &self,
        source_path: &str,
        target_path: &str,
        size: u64,
        dir_task: Option<TaskId>,
    ) -> TransferTask {
        let mut task =
            TransferTask::copy_file(self.ctx.ids.next_id(), source_path, target_path, size)
                .in_dir(dir_task);
        task.use_temp_file = self.options.use_temp_file;
        task
    }

    async fn emit_with_dir_chmod(
        &self,
        task: TransferTask,
        emitter: &mut TaskEmitter,
    ) -> Option<TaskId> {
        emit_with_chmod(&self.ctx, task, self.options.dir_chmod(), emitter).await
    }

    async fn emit_with_file_chmod(
        &self,
        task: TransferTask,
        emitter: &mut TaskEmitter,
    ) -> Option<TaskId> {
        emit_with_chmod(&self.ctx, task, self.options.file_chmod(), emitter).await
    }
}

/// 发送任务，需要时紧跟一个 chmod
pub(crate) async fn emit_with_chmod(
    ctx: &TransferContext,
    task: TransferTask,
    mode: Option<u32>,
    emitter: &mut TaskEmitter,
) -> Option<TaskId> {
    let chmod = mode.map(|mode| TransferTask::chmod(ctx.ids.next_id(), &task, mode));
    let id = emitter.emit(task).await?;
    if let Some(chmod) = chmod {
        emitter.emit(chmod).await;
    }
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskKind;
    use crate::storage::LocalFs;
    use std::sync::Arc;

    async fn collect(planner: &TransferPlanner) -> (Vec<TransferTask>, PlanSummary) {
        let (tx, mut rx) = mpsc::channel(PLAN_CHANNEL_CAPACITY);
        let summary = planner.plan(tx).await.unwrap();
        let mut tasks = Vec::new();
        while let Some(t) = rx.recv().await {
            tasks.push(t);
        }
        (tasks, summary)
    }

    fn context(src: &std::path::Path, dst: &std::path::Path) -> TransferContext {
        TransferContext::new(
            Arc::new(LocalFs::new()),
            src.to_str().unwrap(),
            Arc::new(LocalFs::new()),
            dst.to_str().unwrap(),
        )
    }

    #[tokio::test]
    async fn pre_order_walk_emits_dir_before_children() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("a")).unwrap();
        std::fs::write(src.path().join("a/x.txt"), b"x").unwrap();
        std::fs::write(src.path().join("b.txt"), b"bb").unwrap();

        let planner = TransferPlanner::new(context(src.path(), dst.path()), Default::default());
        let (tasks, summary) = collect(&planner).await;

        let kinds: Vec<_> = tasks.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![TaskKind::MakeDir, TaskKind::CopyFile, TaskKind::CopyFile]
        );
        assert!(tasks[0].target_path.ends_with("/a"));
        assert!(tasks[1].target_path.ends_with("/a/x.txt"));
        assert_eq!(tasks[1].depends_on_dir, Some(tasks[0].id));
        assert!(tasks[2].target_path.ends_with("/b.txt"));
        assert_eq!(tasks[2].depends_on_dir, None);
        assert_eq!(tasks[2].size, Some(2));
        assert_eq!(summary.emitted, 3);
    }

    #[tokio::test]
    async fn chmod_tasks_follow_when_permissions_are_forced() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("d")).unwrap();
        std::fs::write(src.path().join("d/f"), b"f").unwrap();

        let options = TransferOptions {
            file_perm: Some(0o644),
            dir_perm: Some(0o755),
            ..Default::default()
        };
        let planner = TransferPlanner::new(context(src.path(), dst.path()), options.clone());
        let (tasks, _) = collect(&planner).await;
        let kinds: Vec<_> = tasks.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TaskKind::MakeDir,
                TaskKind::Chmod,
                TaskKind::CopyFile,
                TaskKind::Chmod
            ]
        );
        assert_eq!(tasks[1].mode, Some(0o755));
        assert_eq!(tasks[3].mode, Some(0o644));
        assert_eq!(tasks[3].after, vec![tasks[2].id]);

        let preserve = TransferOptions {
            preserve_target_mode: true,
            ..options
        };
        let planner = TransferPlanner::new(context(src.path(), dst.path()), preserve);
        let (tasks, _) = collect(&planner).await;
        assert!(tasks.iter().all(|t| t.kind != TaskKind::Chmod));
    }

    #[tokio::test]
    async fn ignored_subtrees_are_pruned() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("docs/deep")).unwrap();
        std::fs::write(src.path().join("docs/deep/new.md"), b"m").unwrap();
        std::fs::write(src.path().join("keep.txt"), b"k").unwrap();

        let options = TransferOptions::default().with_ignore(|p| p == "docs");
        let planner = TransferPlanner::new(context(src.path(), dst.path()), options);
        let (tasks, summary) = collect(&planner).await;

        assert_eq!(tasks.len(), 1);
        assert!(tasks.iter().all(|t| !t.source_path.contains("/docs")));
        assert_eq!(summary.ignored, 1);
    }

    #[tokio::test]
    async fn missing_target_root_gets_a_make_dir() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("f"), b"f").unwrap();
        let target_root = dst.path().join("new-root");

        let planner = TransferPlanner::new(context(src.path(), &target_root), Default::default());
        let (tasks, _) = collect(&planner).await;
        assert_eq!(tasks[0].kind, TaskKind::MakeDir);
        assert_eq!(tasks[0].target_path, target_root.to_str().unwrap());
        assert!(tasks[0].recursive);
        assert_eq!(tasks[1].depends_on_dir, Some(tasks[0].id));
    }

    #[tokio::test]
    async fn file_root_creates_its_missing_parent() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let file = src.path().join("f.txt");
        std::fs::write(&file, b"f").unwrap();
        let target = dst.path().join("x/y/f.txt");

        let planner = TransferPlanner::new(context(&file, &target), Default::default());
        let (tasks, _) = collect(&planner).await;
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].kind, TaskKind::MakeDir);
        assert_eq!(tasks[0].target_path, dst.path().join("x/y").to_str().unwrap());
        assert!(tasks[0].recursive);
        assert_eq!(tasks[1].kind, TaskKind::CopyFile);
        assert_eq!(tasks[1].depends_on_dir, Some(tasks[0].id));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sockets_are_skipped_as_unsupported() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let socket = src.path().join("app.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&socket).unwrap();
        std::fs::write(src.path().join("plain.txt"), b"p").unwrap();

        let planner = TransferPlanner::new(context(src.path(), dst.path()), Default::default());
        let (tasks, summary) = collect(&planner).await;
        assert_eq!(tasks.len(), 1);
        assert!(tasks.iter().all(|t| !t.source_path.ends_with("app.sock")));
        assert_eq!(
            summary.unsupported,
            vec![FsError::UnsupportedEntryKind {
                path: socket.to_str().unwrap().to_string()
            }]
        );
    }

    #[tokio::test]
    async fn single_file_root_and_scratch_mode() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let file = src.path().join("one.txt");
        std::fs::write(&file, b"12345").unwrap();

        let planner = TransferPlanner::new(context(&file, &dst.path().join("one.txt")), Default::default());
        let (tasks, _) = collect(&planner).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, TaskKind::CopyFile);
        assert_eq!(tasks[0].size, Some(5));

        let scratch = dst.path().join("scratch.tmp");
        let (tx, mut rx) = mpsc::channel(4);
        planner
            .plan_single_file(file.to_str().unwrap(), scratch.to_str().unwrap(), tx)
            .await
            .unwrap();
        let task = rx.recv().await.unwrap();
        assert_eq!(task.target_path, scratch.to_str().unwrap());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn missing_root_is_fatal() {
        let dst = tempfile::tempdir().unwrap();
        let planner = TransferPlanner::new(
            context(&dst.path().join("nope"), dst.path()),
            Default::default(),
        );
        let (tx, _rx) = mpsc::channel(4);
        let err = planner.plan(tx).await.unwrap_err();
        assert!(matches!(err, EngineError::Plan(ref e) if e.is_not_found()));
    }

    #[tokio::test]
    async fn cancel_stops_the_walk() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(src.path().join(format!("f{}", i)), b"x").unwrap();
        }
        let ctx = context(src.path(), dst.path());
        ctx.cancel.cancel();
        let planner = TransferPlanner::new(ctx, Default::default());
        let (tasks, summary) = collect(&planner).await;
        assert!(tasks.is_empty());
        assert!(summary.aborted);
    }
}
