//! 同步配置模块
//!
//! 配置文件为 JSON，字段使用 camelCase，与编辑器侧的项目配置保持一致。

use crate::core::filter::IgnoreMatcher;
use crate::core::task::{SyncOptions, TransferDirection, TransferOptions};
use crate::error::EngineError;
use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 远程协议
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Sftp,
    Ftp,
    Webdav,
    S3,
    Local,
}

/// 存储类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Local,
    S3,
    WebDav,
}

/// 远程存储连接配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(rename = "type", default)]
    pub typ: StorageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webdav_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

/// 同步策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptionProfile {
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub skip_create: bool,
    #[serde(default)]
    pub ignore_existing: bool,
    #[serde(default)]
    pub update: bool,
}

/// 上传的范围，决定哪些权限参与 preserveTargetMode 的判断
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadScope {
    /// 文件或目录，由源路径类型决定
    Any,
    File,
    Folder,
}

/// 项目配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProfile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
    /// 本地项目根目录，默认是配置文件所在目录
    #[serde(default)]
    pub context: Option<String>,
    pub remote_path: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default, deserialize_with = "deserialize_perm")]
    pub file_perm: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_perm")]
    pub dir_perm: Option<u32>,
    #[serde(default)]
    pub use_temp_file: bool,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default)]
    pub sync_option: SyncOptionProfile,
    /// 远程元数据缓存有效期（秒），0 表示永不过期
    #[serde(default = "default_remote_ttl")]
    pub remote_cache_ttl: u64,
    #[serde(default)]
    pub remote: StorageConfig,
}

fn default_concurrency() -> usize {
    4
}

fn default_remote_ttl() -> u64 {
    1800 // 默认 30 分钟
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PermValue {
    Number(u64),
    Text(String),
}

/// 权限可以写成 "0755"、"755" 或 755，都按八进制理解
fn deserialize_perm<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<PermValue>::deserialize(deserializer)?;
    let text = match value {
        None => return Ok(None),
        Some(PermValue::Number(n)) => n.to_string(),
        Some(PermValue::Text(s)) => s,
    };
    parse_perm(&text).map(Some).map_err(serde::de::Error::custom)
}

pub fn parse_perm(text: &str) -> Result<u32, String> {
    let digits = text.trim().trim_start_matches("0o");
    let mode = u32::from_str_radix(digits, 8).map_err(|_| format!("无效的权限: {}", text))?;
    if mode > 0o7777 {
        return Err(format!("权限超出范围: {}", text));
    }
    Ok(mode)
}

impl SyncProfile {
    /// 从 JSON 文件加载，并把 context 解析为绝对路径
    pub fn load(config_file: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(config_file)
            .with_context(|| format!("读取配置文件失败: {}", config_file.display()))?;
        let mut profile: SyncProfile = serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", config_file.display()))?;

        let base = config_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let context = match profile.context.as_deref() {
            Some(ctx) if Path::new(ctx).is_absolute() => PathBuf::from(ctx),
            Some(ctx) => base.join(ctx),
            None => base,
        };
        profile.context = Some(context.to_string_lossy().to_string());

        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.concurrency == 0 {
            return Err(EngineError::InvalidOptions("concurrency 必须大于 0".into()));
        }
        if self.remote_path.trim().is_empty() {
            return Err(EngineError::InvalidOptions("remotePath 不能为空".into()));
        }
        IgnoreMatcher::new(&self.ignore)?;
        self.base_transfer()?.validate()
    }

    /// 本地项目根目录
    pub fn local_root(&self) -> &str {
        self.context.as_deref().unwrap_or(".")
    }

    /// 本地路径对应的远程路径；不在项目根目录下时返回 None
    pub fn remote_path_for(&self, local: &Path) -> Option<String> {
        let rel = local.strip_prefix(self.local_root()).ok()?;
        let rel = rel.to_string_lossy().replace('\\', "/");
        Some(crate::storage::join_path(&self.remote_path, &rel))
    }

    fn base_transfer(&self) -> Result<TransferOptions, EngineError> {
        Ok(TransferOptions {
            ignore: IgnoreMatcher::new(&self.ignore)?.into_ignore_fn(),
            ..Default::default()
        })
    }

    fn is_sftp(&self) -> bool {
        self.protocol == Protocol::Sftp
    }

    /// 上传选项：sftp 且未指定权限时保留目标端权限
    pub fn upload_options(&self, scope: UploadScope) -> Result<TransferOptions, EngineError> {
        let no_perm = match scope {
            UploadScope::Any => self.file_perm.is_none() && self.dir_perm.is_none(),
            UploadScope::File => self.file_perm.is_none(),
            UploadScope::Folder => self.dir_perm.is_none(),
        };
        Ok(TransferOptions {
            preserve_target_mode: self.is_sftp() && no_perm,
            use_temp_file: self.use_temp_file,
            file_perm: self.file_perm,
            dir_perm: self.dir_perm,
            direction: TransferDirection::LocalToRemote,
            ..self.base_transfer()?
        })
    }

    /// 下载选项：不保留权限，不使用临时文件，不追加 chmod
    pub fn download_options(&self) -> Result<TransferOptions, EngineError> {
        Ok(TransferOptions {
            direction: TransferDirection::RemoteToLocal,
            ..self.base_transfer()?
        })
    }

    pub fn sync_to_remote_options(&self) -> Result<SyncOptions, EngineError> {
        Ok(self.with_sync_option(self.upload_options(UploadScope::Any)?))
    }

    pub fn sync_to_local_options(&self) -> Result<SyncOptions, EngineError> {
        Ok(self.with_sync_option(self.download_options()?))
    }

    fn with_sync_option(&self, transfer: TransferOptions) -> SyncOptions {
        SyncOptions {
            transfer,
            delete: self.sync_option.delete,
            skip_create: self.sync_option.skip_create,
            ignore_existing: self.sync_option.ignore_existing,
            update: self.sync_option.update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(json: serde_json::Value) -> SyncProfile {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let p = profile(serde_json::json!({ "remotePath": "/srv/www" }));
        assert_eq!(p.protocol, Protocol::Sftp);
        assert_eq!(p.concurrency, 4);
        assert_eq!(p.remote_cache_ttl, 1800);
        assert_eq!(p.remote.typ, StorageType::Local);
        assert!(!p.sync_option.delete);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn permissions_are_octal() {
        let p = profile(serde_json::json!({
            "remotePath": "/srv",
            "filePerm": 644,
            "dirPerm": "0755"
        }));
        assert_eq!(p.file_perm, Some(0o644));
        assert_eq!(p.dir_perm, Some(0o755));

        assert!(serde_json::from_value::<SyncProfile>(serde_json::json!({
            "remotePath": "/srv",
            "filePerm": "899"
        }))
        .is_err());
        assert_eq!(parse_perm("0o600"), Ok(0o600));
        assert!(parse_perm("17777").is_err());
    }

    #[test]
    fn upload_preserves_target_mode_only_for_sftp_without_perms() {
        let p = profile(serde_json::json!({ "remotePath": "/srv", "useTempFile": true }));
        let opts = p.upload_options(UploadScope::Any).unwrap();
        assert!(opts.preserve_target_mode);
        assert!(opts.use_temp_file);

        let p = profile(serde_json::json!({ "remotePath": "/srv", "filePerm": "640" }));
        assert!(!p.upload_options(UploadScope::Any).unwrap().preserve_target_mode);
        assert!(!p.upload_options(UploadScope::File).unwrap().preserve_target_mode);
        // 只上传目录时只看 dirPerm
        assert!(p.upload_options(UploadScope::Folder).unwrap().preserve_target_mode);

        let p = profile(serde_json::json!({ "remotePath": "/srv", "protocol": "webdav" }));
        assert!(!p.upload_options(UploadScope::Any).unwrap().preserve_target_mode);
    }

    #[test]
    fn download_and_sync_to_local_never_carry_permissions() {
        let p = profile(serde_json::json!({
            "remotePath": "/srv",
            "filePerm": "600",
            "useTempFile": true,
            "ignore": [".git"],
            "syncOption": { "delete": true, "update": true }
        }));
        let down = p.download_options().unwrap();
        assert_eq!(down.file_chmod(), None);
        assert!(!down.use_temp_file);
        assert!(down.is_ignored(".git"));

        let sync = p.sync_to_local_options().unwrap();
        assert!(sync.delete && sync.update);
        assert!(!sync.skip_create);
        assert_eq!(sync.transfer.file_perm, None);

        let sync = p.sync_to_remote_options().unwrap();
        assert_eq!(sync.transfer.file_chmod(), Some(0o600));
    }

    #[test]
    fn load_resolves_context_and_maps_remote_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sftp.json");
        fs::write(
            &file,
            r#"{ "remotePath": "/srv/app", "context": "site", "concurrency": 2 }"#,
        )
        .unwrap();

        let p = SyncProfile::load(&file).unwrap();
        let root = dir.path().join("site");
        assert_eq!(p.local_root(), root.to_str().unwrap());
        assert_eq!(
            p.remote_path_for(&root.join("css/a.css")).as_deref(),
            Some("/srv/app/css/a.css")
        );
        assert_eq!(p.remote_path_for(&root).as_deref(), Some("/srv/app"));
        assert_eq!(p.remote_path_for(Path::new("/elsewhere")), None);

        fs::write(&file, r#"{ "remotePath": "/srv", "concurrency": 0 }"#).unwrap();
        assert!(SyncProfile::load(&file).is_err());
    }
}
