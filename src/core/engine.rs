//! 传输引擎：把计划器的任务流接到调度器，并提供上传、下载、同步、删除等入口

use super::cache::CacheInvalidator;
use super::context::{CancelSignal, TransferContext};
use super::planner::{PlanSummary, TransferPlanner, PLAN_CHANNEL_CAPACITY};
use super::scheduler::{RunReport, TransferScheduler};
use super::sync::SyncPlanner;
use super::task::{SyncOptions, TransferDirection, TransferOptions, TransferTask};
use crate::error::{EngineError, SchedulerError};
use crate::storage::{FileKind, FileSystem};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 一次运行使用的计划器
pub enum Plan {
    Transfer(TransferPlanner),
    /// 单文件模式：源文件复制到调用方给出的临时路径
    SingleFile {
        planner: TransferPlanner,
        source: String,
        scratch: String,
    },
    Sync(SyncPlanner),
}

impl Plan {
    async fn execute(self, tx: mpsc::Sender<TransferTask>) -> Result<PlanSummary, EngineError> {
        match self {
            Plan::Transfer(planner) => planner.plan(tx).await,
            Plan::SingleFile {
                planner,
                source,
                scratch,
            } => planner.plan_single_file(&source, &scratch, tx).await,
            Plan::Sync(planner) => planner.plan(tx).await,
        }
    }
}

/// 计划与执行并行：计划器一边遍历，调度器一边执行
///
/// 根目录无法遍历时返回错误；单个任务的失败记录在报告中。
pub async fn plan_and_run(
    plan: Plan,
    scheduler: TransferScheduler,
) -> Result<RunReport, EngineError> {
    let handle = scheduler.handle();
    let (tx, mut rx) = mpsc::channel(PLAN_CHANNEL_CAPACITY);
    let planning = tokio::spawn(plan.execute(tx));

    let forward = async {
        let mut result = Ok::<(), SchedulerError>(());
        while let Some(task) = rx.recv().await {
            if let Err(e) = handle.add(task) {
                result = Err(e);
                break;
            }
        }
        // 接收端关闭后计划器会停止发送
        drop(rx);
        handle.close();
        result
    };

    let (forwarded, report) = tokio::join!(forward, scheduler.run());
    let summary = planning.await??;
    forwarded?;
    let mut report = report?;

    report.skipped += summary.unsupported.len() as u32;
    if summary.aborted && !report.cancelled {
        warn!("计划提前结束，结果可能不完整");
    }
    Ok(report)
}

/// 本地与远程之间的传输引擎
pub struct Engine {
    local: Arc<dyn FileSystem>,
    remote: Arc<dyn FileSystem>,
    concurrency: usize,
    invalidator: Option<Arc<dyn CacheInvalidator>>,
    /// 当前运行的取消信号
    cancel: Mutex<CancelSignal>,
}

impl Engine {
    pub fn new(
        local: Arc<dyn FileSystem>,
        remote: Arc<dyn FileSystem>,
        concurrency: usize,
    ) -> Result<Self, EngineError> {
        if concurrency == 0 {
            return Err(SchedulerError::ZeroConcurrency.into());
        }
        Ok(Self {
            local,
            remote,
            concurrency,
            invalidator: None,
            cancel: Mutex::new(CancelSignal::new()),
        })
    }

    /// 远程写入成功后使缓存失效
    pub fn with_invalidator(mut self, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    /// 取消当前运行：停止遍历，不再派发新任务
    pub fn cancel(&self) {
        self.current_signal().cancel();
    }

    /// 当前运行的取消信号，可交给其他协程（例如 Ctrl-C 处理）
    pub fn cancel_signal(&self) -> CancelSignal {
        self.current_signal()
    }

    fn current_signal(&self) -> CancelSignal {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn context(&self, direction: TransferDirection, local: &str, remote: &str) -> TransferContext {
        let (source, source_root, target, target_root) = match direction {
            TransferDirection::LocalToRemote => (&self.local, local, &self.remote, remote),
            TransferDirection::RemoteToLocal | TransferDirection::RemoteToLocalTemp => {
                (&self.remote, remote, &self.local, local)
            }
        };
        let mut ctx =
            TransferContext::new(source.clone(), source_root, target.clone(), target_root);
        ctx.cancel = self.current_signal();
        ctx
    }

    async fn run(&self, ctx: &TransferContext, plan: Plan) -> Result<RunReport, EngineError> {
        let mut scheduler = TransferScheduler::from_context(ctx, self.concurrency)?;
        if let Some(invalidator) = &self.invalidator {
            scheduler = scheduler.with_invalidator(invalidator.clone());
        }
        let report = plan_and_run(plan, scheduler).await?;

        // 已取消的信号不能复用
        if report.cancelled {
            *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = CancelSignal::new();
        }
        Ok(report)
    }

    /// 上传或下载一个文件或一棵目录树
    pub async fn transfer(
        &self,
        direction: TransferDirection,
        local: &str,
        remote: &str,
        mut options: TransferOptions,
    ) -> Result<RunReport, EngineError> {
        if direction == TransferDirection::RemoteToLocalTemp {
            return self.download_temp(remote, options).await;
        }
        options.direction = direction;
        options.validate()?;

        let ctx = self.context(direction, local, remote);
        let planner = TransferPlanner::new(ctx.clone(), options);
        self.run(&ctx, Plan::Transfer(planner)).await
    }

    /// 把远程文件下载到新的本地临时文件，报告中带上临时文件路径
    pub async fn download_temp(
        &self,
        remote: &str,
        mut options: TransferOptions,
    ) -> Result<RunReport, EngineError> {
        options.direction = TransferDirection::RemoteToLocalTemp;
        options.preserve_target_mode = false;
        options.use_temp_file = false;
        options.validate()?;

        let scratch = scratch_path(remote);
        let scratch = scratch.to_string_lossy().to_string();
        info!("下载到临时文件: {} -> {}", remote, scratch);

        let ctx = self.context(TransferDirection::RemoteToLocalTemp, &scratch, remote);
        let planner = TransferPlanner::new(ctx.clone(), options);
        let plan = Plan::SingleFile {
            planner,
            source: remote.to_string(),
            scratch: scratch.clone(),
        };
        let mut report = self.run(&ctx, plan).await?;
        report.scratch_path = Some(scratch);
        Ok(report)
    }

    /// 让远程目录与本地目录一致
    pub async fn sync_to_remote(
        &self,
        local: &str,
        remote: &str,
        mut options: SyncOptions,
    ) -> Result<RunReport, EngineError> {
        options.transfer.direction = TransferDirection::LocalToRemote;
        let ctx = self.context(TransferDirection::LocalToRemote, local, remote);
        let planner = SyncPlanner::new(ctx.clone(), options);
        self.run(&ctx, Plan::Sync(planner)).await
    }

    /// 让本地目录与远程目录一致
    pub async fn sync_to_local(
        &self,
        local: &str,
        remote: &str,
        mut options: SyncOptions,
    ) -> Result<RunReport, EngineError> {
        options.transfer.direction = TransferDirection::RemoteToLocal;
        let ctx = self.context(TransferDirection::RemoteToLocal, local, remote);
        let planner = SyncPlanner::new(ctx.clone(), options);
        self.run(&ctx, Plan::Sync(planner)).await
    }

    /// 删除远程路径；目录整棵删除，`skip_dir` 为 true 时跳过目录
    pub async fn remove_remote(&self, path: &str, skip_dir: bool) -> Result<(), EngineError> {
        let stat = self.remote.lstat(path).await.map_err(EngineError::Remove)?;
        let removed = match stat.kind {
            FileKind::Directory if skip_dir => {
                debug!("跳过目录: {}", path);
                return Ok(());
            }
            FileKind::Directory => self.remote.rmdir(path, true).await,
            FileKind::File | FileKind::SymbolicLink => self.remote.unlink(path).await,
            FileKind::Other => {
                warn!("不支持删除的文件类型: {}", path);
                return Ok(());
            }
        };
        removed.map_err(EngineError::Remove)?;

        info!("已删除 {}:{}", self.remote.name(), path);
        if let Some(invalidator) = &self.invalidator {
            invalidator.invalidate(path);
        }
        Ok(())
    }
}

/// 系统临时目录下的新文件名，保留原扩展名
fn scratch_path(remote: &str) -> PathBuf {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let name = match Path::new(remote).extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("remotesync-{}.{}", &suffix[..12], ext),
        None => format!("remotesync-{}", &suffix[..12]),
    };
    std::env::temp_dir().join(name)
}
