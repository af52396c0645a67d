//! 基于 opendal 的远程文件系统（WebDAV / S3 / 任意 Operator）

use super::{ByteStream, DirEntry, FileKind, FileStat, FileSystem, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use crate::error::{FsError, FsResult};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use opendal::{layers::TimeoutLayer, ErrorKind, Metadata, Metakey, Operator};
use std::time::Duration;
use tracing::debug;

/// 远程分块读取大小
const READ_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

pub struct OperatorFs {
    operator: Operator,
    name: String,
}

impl OperatorFs {
    /// 包装一个已连接的 Operator
    pub fn new(operator: Operator, name: impl Into<String>) -> Self {
        Self {
            operator,
            name: name.into(),
        }
    }

    pub async fn webdav(
        endpoint: &str,
        username: &str,
        password: &str,
        root: Option<String>,
    ) -> Result<Self> {
        use opendal::services::Webdav;

        let mut builder = Webdav::default()
            .endpoint(endpoint)
            .username(username)
            .password(password);

        if let Some(ref r) = root {
            builder = builder.root(r);
        }

        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        let name = format!(
            "webdav://{}{}",
            endpoint.trim_end_matches('/'),
            root.as_deref()
                .map(|r| format!("/{}", r.trim_start_matches('/')))
                .unwrap_or_default()
        );

        // 某些 WebDAV 服务器需要先创建根目录，已存在时忽略错误
        let _ = operator.create_dir("/").await;

        Ok(Self { operator, name })
    }

    pub fn s3(
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        endpoint: Option<String>,
        prefix: Option<String>,
    ) -> Result<Self> {
        use opendal::services::S3;

        let mut builder = S3::default()
            .bucket(bucket)
            .region(region)
            .access_key_id(access_key)
            .secret_access_key(secret_key);

        if let Some(ref ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        if let Some(ref p) = prefix {
            builder = builder.root(p);
        }

        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        let name = format!(
            "s3://{}{}",
            bucket,
            prefix
                .as_deref()
                .map(|p| format!("/{}", p))
                .unwrap_or_default()
        );

        Ok(Self { operator, name })
    }

    /// 以本地目录为根的 opendal fs 服务
    pub fn fs(root: &str) -> Result<Self> {
        use opendal::services::Fs;

        let operator = Operator::new(Fs::default().root(root))?.finish();
        Ok(Self {
            operator,
            name: format!("fs://{}", root),
        })
    }

    /// opendal 路径不带前导 /
    fn object_path(path: &str) -> String {
        path.replace('\\', "/").trim_start_matches('/').to_string()
    }

    /// 目录路径必须以 / 结尾
    fn dir_path(path: &str) -> String {
        let p = Self::object_path(path);
        let p = p.trim_end_matches('/');
        if p.is_empty() {
            "/".to_string()
        } else {
            format!("{}/", p)
        }
    }

    fn stat_from_metadata(meta: &Metadata) -> FileStat {
        let kind = if meta.is_dir() {
            FileKind::Directory
        } else if meta.is_file() {
            FileKind::File
        } else {
            FileKind::Other
        };
        FileStat {
            kind,
            size: if kind == FileKind::Directory {
                0
            } else {
                meta.content_length()
            },
            modified_at: meta.last_modified().map_or(0, |t| t.timestamp()),
            mode: 0,
        }
    }
}

#[async_trait]
impl FileSystem for OperatorFs {
    async fn lstat(&self, path: &str) -> FsResult<FileStat> {
        let object = Self::object_path(path);
        if object.is_empty() {
            return Ok(FileStat {
                kind: FileKind::Directory,
                size: 0,
                modified_at: 0,
                mode: 0,
            });
        }

        match self.operator.stat(&object).await {
            Ok(meta) => Ok(Self::stat_from_metadata(&meta)),
            // 部分后端只认带 / 的目录路径
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::IsADirectory) => {
                let meta = self
                    .operator
                    .stat(&Self::dir_path(path))
                    .await
                    .map_err(|e| FsError::from_opendal(path, e))?;
                Ok(Self::stat_from_metadata(&meta))
            }
            Err(e) => Err(FsError::from_opendal(path, e)),
        }
    }

    async fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let dir = Self::dir_path(path);
        let listed = self
            .operator
            .list_with(&dir)
            .metakey(Metakey::ContentLength | Metakey::LastModified | Metakey::Mode)
            .await
            .map_err(|e| FsError::from_opendal(path, e))?;

        let mut entries = Vec::with_capacity(listed.len());
        for entry in listed {
            // 跳过目录自身
            if entry.path().trim_end_matches('/') == dir.trim_end_matches('/') {
                continue;
            }
            let name = entry.name().trim_end_matches('/').to_string();
            if name.is_empty() {
                continue;
            }
            entries.push(DirEntry {
                name,
                stat: Self::stat_from_metadata(entry.metadata()),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn mkdir(&self, path: &str, _recursive: bool) -> FsResult<()> {
        // opendal 的 create_dir 本身是幂等的，会补齐父目录
        self.operator
            .create_dir(&Self::dir_path(path))
            .await
            .map_err(|e| FsError::from_opendal(path, e))
    }

    async fn read_file(&self, path: &str) -> FsResult<ByteStream> {
        let object = Self::object_path(path);
        let total = self
            .operator
            .stat(&object)
            .await
            .map_err(|e| FsError::from_opendal(path, e))?
            .content_length();

        let operator = self.operator.clone();
        let stream = futures::stream::try_unfold(0u64, move |offset| {
            let operator = operator.clone();
            let object = object.clone();
            async move {
                if offset >= total {
                    return Ok(None);
                }
                let end = (offset + READ_CHUNK_SIZE).min(total);
                let data = operator
                    .read_with(&object)
                    .range(offset..end)
                    .await
                    .map_err(|e| FsError::from_opendal(&object, e))?
                    .to_vec();
                if data.is_empty() {
                    return Ok(None);
                }
                let next = offset + data.len() as u64;
                Ok(Some((Bytes::from(data), next)))
            }
        });

        Ok(Box::pin(stream))
    }

    async fn write_file(&self, path: &str, mut stream: ByteStream) -> FsResult<u64> {
        let object = Self::object_path(path);
        let mut writer = self
            .operator
            .writer(&object)
            .await
            .map_err(|e| FsError::from_opendal(path, e))?;

        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(e);
                }
            };
            written += chunk.len() as u64;
            if let Err(e) = writer.write(chunk).await {
                let _ = writer.abort().await;
                return Err(FsError::from_opendal(path, e));
            }
        }

        writer
            .close()
            .await
            .map_err(|e| FsError::from_opendal(path, e))?;

        Ok(written)
    }

    async fn unlink(&self, path: &str) -> FsResult<()> {
        self.operator
            .delete(&Self::object_path(path))
            .await
            .map_err(|e| FsError::from_opendal(path, e))
    }

    async fn rmdir(&self, path: &str, recursive: bool) -> FsResult<()> {
        let dir = Self::dir_path(path);
        let result = if recursive {
            self.operator.remove_all(&dir).await
        } else {
            self.operator.delete(&dir).await
        };
        result.map_err(|e| FsError::from_opendal(path, e))
    }

    async fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        debug!("{} 不支持权限设置，忽略 chmod {:o} {}", self.name, mode, path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        self.operator
            .rename(&Self::object_path(from), &Self::object_path(to))
            .await
            .map_err(|e| FsError::from_opendal(to, e))
    }

    fn supports_rename(&self) -> bool {
        // S3 等对象存储没有 rename
        self.operator.info().full_capability().rename
    }

    fn name(&self) -> &str {
        &self.name
    }
}
