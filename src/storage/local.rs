use super::{ByteStream, DirEntry, FileKind, FileStat, FileSystem, STREAM_CHUNK_SIZE};
use crate::error::{FsError, FsResult};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// 本地磁盘
pub struct LocalFs {
    base_path: Option<PathBuf>,
    name: String,
}

impl LocalFs {
    /// 直接使用调用方给出的绝对路径
    pub fn new() -> Self {
        Self {
            base_path: None,
            name: "local".to_string(),
        }
    }

    /// 所有路径都相对 base 解析
    pub fn with_base(path: &str) -> Self {
        Self {
            base_path: Some(PathBuf::from(path)),
            name: format!("local:{}", path),
        }
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        match &self.base_path {
            None => PathBuf::from(path),
            Some(base) => {
                let path = path.trim_start_matches('/').trim_start_matches('\\');
                if path.is_empty() {
                    base.clone()
                } else {
                    base.join(path)
                }
            }
        }
    }

    fn stat_from_metadata(metadata: &std::fs::Metadata) -> FileStat {
        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            FileKind::SymbolicLink
        } else if file_type.is_dir() {
            FileKind::Directory
        } else if file_type.is_file() {
            FileKind::File
        } else {
            FileKind::Other
        };

        let modified_at = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs() as i64);

        FileStat {
            kind,
            size: if kind == FileKind::Directory {
                0
            } else {
                metadata.len()
            },
            modified_at,
            mode: Self::mode_bits(metadata),
        }
    }

    #[cfg(unix)]
    fn mode_bits(metadata: &std::fs::Metadata) -> u32 {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o7777
    }

    #[cfg(not(unix))]
    fn mode_bits(_metadata: &std::fs::Metadata) -> u32 {
        0
    }
}

impl Default for LocalFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for LocalFs {
    async fn lstat(&self, path: &str) -> FsResult<FileStat> {
        let metadata = fs::symlink_metadata(self.resolve_path(path))
            .await
            .map_err(|e| FsError::from_io(path, e))?;
        Ok(Self::stat_from_metadata(&metadata))
    }

    async fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let mut reader = fs::read_dir(self.resolve_path(path))
            .await
            .map_err(|e| FsError::from_io(path, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| FsError::from_io(path, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            // DirEntry::metadata 不跟随符号链接
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| FsError::from_io(&name, e))?;
            entries.push(DirEntry {
                name,
                stat: Self::stat_from_metadata(&metadata),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> FsResult<()> {
        let full_path = self.resolve_path(path);
        let result = if recursive {
            fs::create_dir_all(&full_path).await
        } else {
            fs::create_dir(&full_path).await
        };
        result.map_err(|e| FsError::from_io(path, e))
    }

    async fn read_file(&self, path: &str) -> FsResult<ByteStream> {
        let file = fs::File::open(self.resolve_path(path))
            .await
            .map_err(|e| FsError::from_io(path, e))?;
        let path = path.to_string();
        let stream = ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE)
            .map_err(move |e| FsError::from_io(&path, e));
        Ok(Box::pin(stream))
    }

    async fn write_file(&self, path: &str, mut stream: ByteStream) -> FsResult<u64> {
        let mut file = fs::File::create(self.resolve_path(path))
            .await
            .map_err(|e| FsError::from_io(path, e))?;

        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| FsError::from_io(path, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| FsError::from_io(path, e))?;

        Ok(written)
    }

    async fn unlink(&self, path: &str) -> FsResult<()> {
        fs::remove_file(self.resolve_path(path))
            .await
            .map_err(|e| FsError::from_io(path, e))
    }

    async fn rmdir(&self, path: &str, recursive: bool) -> FsResult<()> {
        let full_path = self.resolve_path(path);
        let result = if recursive {
            fs::remove_dir_all(&full_path).await
        } else {
            fs::remove_dir(&full_path).await
        };
        result.map_err(|e| FsError::from_io(path, e))
    }

    #[cfg(unix)]
    async fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(
            self.resolve_path(path),
            std::fs::Permissions::from_mode(mode),
        )
        .await
        .map_err(|e| FsError::from_io(path, e))
    }

    #[cfg(not(unix))]
    async fn chmod(&self, _path: &str, _mode: u32) -> FsResult<()> {
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        fs::rename(self.resolve_path(from), self.resolve_path(to))
            .await
            .map_err(|e| FsError::from_io(to, e))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
