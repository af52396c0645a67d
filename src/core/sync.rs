//! 差异同步计划：成对遍历源和目标，只为有差异的条目产出任务

use super::context::TransferContext;
use super::planner::{emit_with_chmod, PlanSummary, TaskEmitter};
use super::task::{SyncOptions, TaskId, TransferTask};
use crate::error::EngineError;
use crate::storage::{join_path, DirEntry, FileKind, FileStat};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 同步计划器
#[derive(Debug, Clone)]
pub struct SyncPlanner {
    ctx: TransferContext,
    options: SyncOptions,
}

impl SyncPlanner {
    pub fn new(ctx: TransferContext, options: SyncOptions) -> Self {
        Self { ctx, options }
    }

    /// 比较两棵树，把任务依次发送到 tx
    ///
    /// 源根路径必须是目录；目标根目录不存在时整棵树按新建处理。
    pub async fn plan(&self, tx: mpsc::Sender<TransferTask>) -> Result<PlanSummary, EngineError> {
        self.options.validate()?;
        let ctx = &self.ctx;
        info!(
            "开始计划同步 ({}): {}:{} -> {}:{} (delete={}, skipCreate={}, ignoreExisting={}, update={})",
            self.options.transfer.direction,
            ctx.source.name(),
            ctx.source_root,
            ctx.target.name(),
            ctx.target_root,
            self.options.delete,
            self.options.skip_create,
            self.options.ignore_existing,
            self.options.update
        );

        let mut emitter = TaskEmitter::new(tx, ctx.cancel.clone());

        let root = ctx.source.lstat(&ctx.source_root).await?;
        if !root.is_dir() {
            return Err(EngineError::InvalidOptions(format!(
                "同步源必须是目录: {}",
                ctx.source_root
            )));
        }
        let source_entries = ctx.source.read_dir(&ctx.source_root).await?;

        let target_root = match ctx.target.lstat(&ctx.target_root).await {
            Ok(stat) => Some(stat),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        match target_root {
            Some(stat) if stat.is_dir() => {
                let target_entries = ctx.target.read_dir(&ctx.target_root).await?;
                self.sync_dir(
                    String::new(),
                    source_entries,
                    Some(target_entries),
                    None,
                    &mut emitter,
                )
                .await;
            }
            Some(_) => {
                return Err(EngineError::InvalidOptions(format!(
                    "同步目标已存在且不是目录: {}",
                    ctx.target_root
                )));
            }
            None if self.options.skip_create => {
                debug!("目标根目录不存在且 skipCreate，无事可做");
            }
            None => {
                let task =
                    TransferTask::make_dir(ctx.ids.next_id(), &ctx.source_root, &ctx.target_root)
                        .recursive();
                let dir_chmod = self.options.transfer.dir_chmod();
                if let Some(id) = emit_with_chmod(ctx, task, dir_chmod, &mut emitter).await {
                    self.sync_dir(String::new(), source_entries, None, Some(id), &mut emitter)
                        .await;
                }
            }
        }

        let summary = emitter.finish();
        info!(
            "同步计划完成: {} 个任务, {} 个未变化, {} 个被忽略, {} 个不支持",
            summary.emitted,
            summary.unchanged,
            summary.ignored,
            summary.unsupported.len()
        );
        Ok(summary)
    }

    /// 比较一层目录
    ///
    /// `target_entries` 为 None 表示目标目录尚不存在（由 `dir_task` 创建）。
    fn sync_dir<'a>(
        &'a self,
        rel_dir: String,
        source_entries: Vec<DirEntry>,
        target_entries: Option<Vec<DirEntry>>,
        dir_task: Option<TaskId>,
        emitter: &'a mut TaskEmitter,
    ) -> BoxFuture<'a, ()> {
        async move {
            let target_exists = target_entries.is_some();
            let targets: BTreeMap<String, FileStat> = target_entries
                .unwrap_or_default()
                .into_iter()
                .map(|e| (e.name, e.stat))
                .collect();
            let source_names: HashSet<String> =
                source_entries.iter().map(|e| e.name.clone()).collect();

            for entry in source_entries {
                if emitter.stopped() {
                    return;
                }

                let rel = join_path(&rel_dir, &entry.name);
                if self.options.transfer.is_ignored(&rel) {
                    debug!("忽略: {}", rel);
                    emitter.summary.ignored += 1;
                    continue;
                }

                match targets.get(&entry.name) {
                    None => {
                        if !self.options.skip_create {
                            self.create(rel, entry.stat, dir_task, None, emitter).await;
                        }
                    }
                    Some(target) => {
                        self.reconcile(rel, entry.stat, *target, dir_task, emitter)
                            .await
                    }
                }
            }

            if !self.options.delete || !target_exists {
                return;
            }

            for (name, stat) in &targets {
                if source_names.contains(name) {
                    continue;
                }
                if emitter.stopped() {
                    return;
                }
                let rel = join_path(&rel_dir, name);
                if self.options.transfer.is_ignored(&rel) {
                    debug!("忽略多余条目: {}", rel);
                    continue;
                }
                self.plan_removal(rel, *stat, emitter).await;
            }
        }
        .boxed()
    }

    /// 源与目标都存在同名条目
    async fn reconcile(
        &self,
        rel: String,
        source: FileStat,
        target: FileStat,
        dir_task: Option<TaskId>,
        emitter: &mut TaskEmitter,
    ) {
        let ctx = &self.ctx;

        if source.kind == FileKind::Other {
            emitter.unsupported(&ctx.source_path(&rel));
            return;
        }

        if self.options.ignore_existing {
            if source.is_dir() && target.is_dir() {
                self.descend(rel, dir_task, emitter).await;
            } else {
                emitter.summary.unchanged += 1;
            }
            return;
        }

        if source.is_dir() && target.is_dir() {
            self.descend(rel, dir_task, emitter).await;
            return;
        }

        if source.kind.is_content() && target.kind.is_content() {
            if self.options.update && source.modified_at <= target.modified_at {
                debug!("目标已是最新: {}", rel);
                emitter.summary.unchanged += 1;
                return;
            }
            let mut task = TransferTask::copy_file(
                ctx.ids.next_id(),
                &ctx.source_path(&rel),
                &ctx.target_path(&rel),
                source.size,
            )
            .in_dir(dir_task);
            task.overwrite = true;
            task.use_temp_file = self.options.transfer.use_temp_file;
            let file_chmod = self.options.transfer.file_chmod();
            emit_with_chmod(ctx, task, file_chmod, emitter).await;
            return;
        }

        // 类型不同：先删除目标，再按源重建
        match self.plan_removal(rel.clone(), target, emitter).await {
            Some(removal) => self.create(rel, source, dir_task, Some(removal), emitter).await,
            None => warn!(
                "目标 {} 含有被忽略的内容，无法替换为{}",
                ctx.target_path(&rel),
                if source.is_dir() { "目录" } else { "文件" }
            ),
        }
    }

    /// 在目标端新建条目（目录会连同子树一起创建）
    fn create<'a>(
        &'a self,
        rel: String,
        source: FileStat,
        dir_task: Option<TaskId>,
        after: Option<TaskId>,
        emitter: &'a mut TaskEmitter,
    ) -> BoxFuture<'a, ()> {
        async move {
            let ctx = &self.ctx;
            let source_path = ctx.source_path(&rel);
            let target_path = ctx.target_path(&rel);

            match source.kind {
                FileKind::Directory => {
                    let mut task =
                        TransferTask::make_dir(ctx.ids.next_id(), &source_path, &target_path)
                            .in_dir(dir_task);
                    task.after.extend(after);
                    let dir_chmod = self.options.transfer.dir_chmod();
                    let Some(id) = emit_with_chmod(ctx, task, dir_chmod, emitter).await else {
                        return;
                    };
                    match ctx.source.read_dir(&source_path).await {
                        Ok(children) => self.sync_dir(rel, children, None, Some(id), emitter).await,
                        Err(e) => {
                            warn!("读取目录失败: {} - {}", source_path, e);
                            emitter.summary.unreadable.push(source_path);
                        }
                    }
                }
                FileKind::File | FileKind::SymbolicLink => {
                    let mut task = TransferTask::copy_file(
                        ctx.ids.next_id(),
                        &source_path,
                        &target_path,
                        source.size,
                    )
                    .in_dir(dir_task);
                    task.after.extend(after);
                    task.use_temp_file = self.options.transfer.use_temp_file;
                    let file_chmod = self.options.transfer.file_chmod();
                    emit_with_chmod(ctx, task, file_chmod, emitter).await;
                }
                FileKind::Other => emitter.unsupported(&source_path),
            }
        }
        .boxed()
    }

    /// 进入两端都存在的目录
    async fn descend(&self, rel: String, dir_task: Option<TaskId>, emitter: &mut TaskEmitter) {
        let source_path = self.ctx.source_path(&rel);
        let target_path = self.ctx.target_path(&rel);

        let source_entries = match self.ctx.source.read_dir(&source_path).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("读取目录失败: {} - {}", source_path, e);
                emitter.summary.unreadable.push(source_path);
                return;
            }
        };
        // 目标目录读不出来时不做比较，避免误覆盖
        let target_entries = match self.ctx.target.read_dir(&target_path).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("读取目录失败: {} - {}", target_path, e);
                emitter.summary.unreadable.push(target_path);
                return;
            }
        };

        self.sync_dir(rel, source_entries, Some(target_entries), dir_task, emitter)
            .await;
    }

    /// 后序删除目标端条目，返回最外层删除任务的编号
    ///
    /// 目录下有被忽略的内容时保留该目录（以及其上层目录），返回 None。
    fn plan_removal<'a>(
        &'a self,
        rel: String,
        stat: FileStat,
        emitter: &'a mut TaskEmitter,
    ) -> BoxFuture<'a, Option<TaskId>> {
        async move {
            let ctx = &self.ctx;
            let target_path = ctx.target_path(&rel);

            if !stat.is_dir() {
                let task = TransferTask::remove_file(ctx.ids.next_id(), &target_path);
                return emitter.emit(task).await;
            }

            let children = match ctx.target.read_dir(&target_path).await {
                Ok(children) => children,
                Err(e) => {
                    warn!("读取目录失败，保留: {} - {}", target_path, e);
                    emitter.summary.unreadable.push(target_path);
                    return None;
                }
            };

            let mut retained = false;
            let mut removals = Vec::with_capacity(children.len());
            for child in children {
                let child_rel = join_path(&rel, &child.name);
                if self.options.transfer.is_ignored(&child_rel) {
                    debug!("保留被忽略的条目: {}", child_rel);
                    retained = true;
                    continue;
                }
                match self.plan_removal(child_rel, child.stat, emitter).await {
                    Some(id) => removals.push(id),
                    None => retained = true,
                }
            }

            if retained || emitter.stopped() {
                return None;
            }

            let mut task = TransferTask::remove_dir(ctx.ids.next_id(), &target_path);
            task.after = removals;
            emitter.emit(task).await
        }
        .boxed()
    }
}
