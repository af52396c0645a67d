//! 一次传输运行的上下文：两端文件系统、根路径、编号分配器和取消信号

use super::task::TaskIdGen;
use crate::storage::{join_path, FileSystem};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// 取消信号，计划器与调度器共享
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// 等待取消
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// 不可变的运行上下文，按引用传给计划器和调度器
#[derive(Clone)]
pub struct TransferContext {
    pub source: Arc<dyn FileSystem>,
    pub target: Arc<dyn FileSystem>,
    pub source_root: String,
    pub target_root: String,
    pub ids: TaskIdGen,
    pub cancel: CancelSignal,
}

impl TransferContext {
    pub fn new(
        source: Arc<dyn FileSystem>,
        source_root: impl Into<String>,
        target: Arc<dyn FileSystem>,
        target_root: impl Into<String>,
    ) -> Self {
        Self {
            source,
            target,
            source_root: source_root.into(),
            target_root: target_root.into(),
            ids: TaskIdGen::new(),
            cancel: CancelSignal::new(),
        }
    }

    pub fn source_path(&self, rel: &str) -> String {
        join_path(&self.source_root, rel)
    }

    pub fn target_path(&self, rel: &str) -> String {
        join_path(&self.target_root, rel)
    }
}

impl std::fmt::Debug for TransferContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferContext")
            .field("source", &self.source.name())
            .field("source_root", &self.source_root)
            .field("target", &self.target.name())
            .field("target_root", &self.target_root)
            .finish()
    }
}
