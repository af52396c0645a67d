use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use remotesync::config::UploadScope;
use remotesync::core::StatCache;
use remotesync::logging::init_logging;
use remotesync::{create_storage, Engine, LocalFs, RunReport, SyncProfile, TransferDirection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "remotesync")]
#[command(about = "Upload, download and sync a project tree with a remote server")]
#[command(version)]
struct Cli {
    /// 项目配置文件
    #[arg(short, long, default_value = ".vscode/sftp.json")]
    config: PathBuf,

    /// 覆盖配置中的并发数
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// 日志目录（读取其中 config.json 的 log 字段）
    #[arg(long, default_value = ".remotesync")]
    log_dir: PathBuf,

    /// 输出调试日志到控制台
    #[arg(short, long)]
    verbose: bool,

    /// 以 JSON 输出运行报告
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Scope {
    Any,
    File,
    Folder,
}

impl From<Scope> for UploadScope {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Any => UploadScope::Any,
            Scope::File => UploadScope::File,
            Scope::Folder => UploadScope::Folder,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// 上传本地文件或目录
    Upload {
        local: PathBuf,
        /// 远程路径，默认按项目根目录映射
        #[arg(short, long)]
        remote: Option<String>,
        #[arg(long, value_enum, default_value = "any")]
        scope: Scope,
    },
    /// 下载远程文件或目录到本地
    Download {
        local: PathBuf,
        #[arg(short, long)]
        remote: Option<String>,
    },
    /// 下载远程文件到临时文件并打印路径
    DownloadTemp { remote: String },
    /// 让远程目录与本地一致
    SyncRemote {
        local: Option<PathBuf>,
        #[arg(short, long)]
        remote: Option<String>,
    },
    /// 让本地目录与远程一致
    SyncLocal {
        local: Option<PathBuf>,
        #[arg(short, long)]
        remote: Option<String>,
    },
    /// 删除远程路径
    Remove {
        remote: String,
        /// 是目录时跳过
        #[arg(long)]
        skip_dir: bool,
    },
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn path_str(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("路径不是有效的 UTF-8: {}", path.display()))
}

/// 本地路径与远程路径，远程路径缺省时由项目根目录映射
fn resolve(
    profile: &SyncProfile,
    local: Option<&Path>,
    remote: Option<String>,
) -> Result<(String, String)> {
    let local = match local {
        Some(p) => absolute(p)?,
        None => PathBuf::from(profile.local_root()),
    };
    let remote = match remote {
        Some(r) => r,
        None => profile
            .remote_path_for(&local)
            .ok_or_else(|| anyhow!("{} 不在项目目录 {} 下", local.display(), profile.local_root()))?,
    };
    Ok((path_str(&local)?, remote))
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!(
        "created {}, updated {}, deleted {}, skipped {}, failed {}, degraded {}, {} bytes in {} ms{}",
        report.created,
        report.updated,
        report.deleted,
        report.skipped,
        report.failed,
        report.degraded,
        report.bytes_transferred,
        report.duration,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    for line in report.first_errors(5) {
        eprintln!("  {}", line);
    }
    if let Some(path) = &report.scratch_path {
        println!("{}", path);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<bool> {
    let mut profile = SyncProfile::load(&cli.config)?;
    if let Some(concurrency) = cli.concurrency {
        profile.concurrency = concurrency;
    }
    profile.validate()?;

    let remote = create_storage(&profile.remote)
        .await
        .context("连接远程存储失败")?;
    info!("远程存储: {}", remote.name());

    let cache = Arc::new(StatCache::new().with_ttl(profile.remote_cache_ttl));
    let engine = Arc::new(
        Engine::new(Arc::new(LocalFs::new()), remote, profile.concurrency)?
            .with_invalidator(cache),
    );

    {
        let engine = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("收到中断信号，等待进行中的任务结束");
                engine.cancel();
            }
        });
    }

    let report = match cli.command {
        Commands::Upload {
            local,
            remote,
            scope,
        } => {
            let (local, remote) = resolve(&profile, Some(local.as_path()), remote)?;
            let options = profile.upload_options(scope.into())?;
            engine
                .transfer(TransferDirection::LocalToRemote, &local, &remote, options)
                .await?
        }
        Commands::Download { local, remote } => {
            let (local, remote) = resolve(&profile, Some(local.as_path()), remote)?;
            let options = profile.download_options()?;
            engine
                .transfer(TransferDirection::RemoteToLocal, &local, &remote, options)
                .await?
        }
        Commands::DownloadTemp { remote } => {
            engine
                .download_temp(&remote, profile.download_options()?)
                .await?
        }
        Commands::SyncRemote { local, remote } => {
            let (local, remote) = resolve(&profile, local.as_deref(), remote)?;
            engine
                .sync_to_remote(&local, &remote, profile.sync_to_remote_options()?)
                .await?
        }
        Commands::SyncLocal { local, remote } => {
            let (local, remote) = resolve(&profile, local.as_deref(), remote)?;
            engine
                .sync_to_local(&local, &remote, profile.sync_to_local_options()?)
                .await?
        }
        Commands::Remove { remote, skip_dir } => {
            engine.remove_remote(&remote, skip_dir).await?;
            return Ok(true);
        }
    };

    print_report(&report, cli.json)?;
    Ok(report.is_success())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_dir, cli.verbose);

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            std::process::exit(2);
        }
    }
}
