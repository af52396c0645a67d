#![allow(dead_code)]

use futures::StreamExt;
use remotesync::core::{SyncPlanner, TransferContext, TransferPlanner};
use remotesync::{LocalFs, SyncOptions, TransferOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::mpsc;

pub use remotesync::core::{TaskKind, TransferTask};

pub fn s(path: &Path) -> &str {
    path.to_str().unwrap()
}

pub fn write(root: &Path, rel: &str, content: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

pub fn set_mtime(root: &Path, rel: &str, secs: u64) {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(root.join(rel))
        .unwrap();
    file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

/// 目录树快照：相对路径，目录以 / 结尾
pub fn snapshot(root: &Path) -> Vec<String> {
    let mut entries: Vec<String> = walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .map(|e| e.unwrap())
        .map(|e| {
            let rel = e
                .path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/");
            if e.file_type().is_dir() {
                format!("{}/", rel)
            } else {
                rel
            }
        })
        .collect();
    entries.sort();
    entries
}

pub fn local_context(src: &Path, dst: &Path) -> TransferContext {
    TransferContext::new(
        Arc::new(LocalFs::new()),
        s(src),
        Arc::new(LocalFs::new()),
        s(dst),
    )
}

pub async fn plan_transfer(src: &Path, dst: &Path, options: TransferOptions) -> Vec<TransferTask> {
    let planner = TransferPlanner::new(local_context(src, dst), options);
    let (stream, summary) = planner.stream();
    let tasks: Vec<_> = stream.collect().await;
    summary.await.unwrap().unwrap();
    tasks
}

pub async fn plan_sync(src: &Path, dst: &Path, options: SyncOptions) -> Vec<TransferTask> {
    let planner = SyncPlanner::new(local_context(src, dst), options);
    let (tx, mut rx) = mpsc::channel(16);
    let planning = tokio::spawn(async move { planner.plan(tx).await });
    let mut tasks = Vec::new();
    while let Some(task) = rx.recv().await {
        tasks.push(task);
    }
    planning.await.unwrap().unwrap();
    tasks
}

/// 相对目标根目录的路径
pub fn rel<'a>(task: &'a TransferTask, dst: &Path) -> &'a str {
    task.target_path
        .strip_prefix(s(dst))
        .unwrap_or(&task.target_path)
        .trim_start_matches('/')
}

/// 每个非 MakeDir 任务的父目录要么是根，要么有更早的 MakeDir
pub fn assert_containment(tasks: &[TransferTask], dst: &Path) {
    let mut made = std::collections::HashSet::new();
    for task in tasks {
        let path = rel(task, dst);
        let parent = path.rsplit_once('/').map(|(p, _)| p);
        if task.kind != TaskKind::MakeDir || !path.is_empty() {
            if let Some(parent) = parent {
                assert!(
                    made.contains(parent) || dst.join(parent).is_dir(),
                    "{} 在父目录创建之前出现",
                    path
                );
            }
        }
        if task.kind == TaskKind::MakeDir {
            made.insert(path.to_string());
        }
    }
}
