pub mod local;
pub mod remote;

use crate::config::{StorageConfig, StorageType};
use crate::error::FsResult;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;

pub use local::LocalFs;
pub use remote::OperatorFs;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;
/// 流式读取的块大小
pub const STREAM_CHUNK_SIZE: usize = 256 * 1024;

/// 文件类型，本地与远程后端必须给出相同的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileKind {
    File,
    Directory,
    SymbolicLink,
    /// 设备、套接字等不支持传输的类型
    Other,
}

impl FileKind {
    /// 按普通文件内容传输（符号链接跟随读取，不重建链接）
    pub fn is_content(&self) -> bool {
        matches!(self, FileKind::File | FileKind::SymbolicLink)
    }
}

/// lstat 快照，遍历期间不缓存
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    pub kind: FileKind,
    pub size: u64,
    /// 修改时间（Unix 秒）
    pub modified_at: i64,
    /// 权限位，后端不支持时为 0
    pub mode: u32,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// 目录项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub stat: FileStat,
}

/// 字节流（用于大文件，避免整个读入内存）
pub type ByteStream = Pin<Box<dyn Stream<Item = FsResult<Bytes>> + Send>>;

/// 文件系统能力接口，本地磁盘和远程协议都实现它
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// 获取元数据（不跟随符号链接）
    async fn lstat(&self, path: &str) -> FsResult<FileStat>;

    /// 列出目录内容，按名称排序
    async fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>>;

    /// 创建目录；recursive 为 true 时目录已存在不算错误
    async fn mkdir(&self, path: &str, recursive: bool) -> FsResult<()>;

    /// 打开读取流
    async fn read_file(&self, path: &str) -> FsResult<ByteStream>;

    /// 把流写入文件，返回写入的字节数
    async fn write_file(&self, path: &str, stream: ByteStream) -> FsResult<u64>;

    /// 删除文件
    async fn unlink(&self, path: &str) -> FsResult<()>;

    /// 删除目录
    async fn rmdir(&self, path: &str, recursive: bool) -> FsResult<()>;

    /// 修改权限；不支持权限的后端直接返回 Ok
    async fn chmod(&self, path: &str, mode: u32) -> FsResult<()>;

    /// 重命名（用于临时文件落盘）
    async fn rename(&self, from: &str, to: &str) -> FsResult<()>;

    /// 是否支持重命名；不支持时临时文件策略退化为直接写入
    fn supports_rename(&self) -> bool {
        true
    }

    /// 检查路径是否存在
    async fn exists(&self, path: &str) -> FsResult<bool> {
        match self.lstat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// 获取后端名称（用于日志）
    fn name(&self) -> &str;
}

/// 用 / 拼接路径
pub fn join_path(base: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if name.is_empty() {
        return base.to_string();
    }
    if base.is_empty() {
        name.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// 上级目录路径；没有上级（根或单段相对路径）时返回 None
pub fn parent_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => None,
        Some(i) => Some(&trimmed[..i]),
    }
}

/// 根据配置创建存储实例
pub async fn create_storage(config: &StorageConfig) -> Result<Arc<dyn FileSystem>> {
    match config.typ {
        StorageType::Local => {
            tracing::info!("初始化本地存储: {:?}", config.path);
            let fs = match config.path.as_deref() {
                Some(base) => LocalFs::with_base(base),
                None => LocalFs::new(),
            };
            Ok(Arc::new(fs) as Arc<dyn FileSystem>)
        }
        StorageType::S3 => {
            let bucket = config
                .bucket
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires bucket"))?;
            let region = config
                .region
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires region"))?;
            let access_key = config
                .access_key
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires accessKey"))?;
            let secret_key = config
                .secret_key
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires secretKey"))?;
            tracing::info!("初始化S3存储: bucket={}, region={}", bucket, region);
            Ok(Arc::new(OperatorFs::s3(
                bucket,
                region,
                access_key,
                secret_key,
                config.endpoint.clone(),
                config.prefix.clone(),
            )?) as Arc<dyn FileSystem>)
        }
        StorageType::WebDav => {
            let endpoint = config
                .webdav_endpoint
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV storage requires endpoint"))?;
            let username = config
                .username
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV storage requires username"))?;
            let password = config
                .password
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV storage requires password"))?;
            tracing::info!("创建WebDAV存储: endpoint={}, root={:?}", endpoint, config.root);
            Ok(Arc::new(
                OperatorFs::webdav(endpoint, username, password, config.root.clone()).await?,
            ) as Arc<dyn FileSystem>)
        }
    }
}
