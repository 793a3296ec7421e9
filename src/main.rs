use anyhow::{bail, Context, Result};
use media_downloader_rust::{
    config::LogConfig, logging, AppConfig, DownloadEvent, EventListener, StreamDescriptor, Task,
    TaskRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const CONFIG_PATH: &str = "config/app.toml";

const USAGE: &str = "用法: media-downloader-rust <目标文件> [--video URL] [--audio URL] \
[--subtitle URL] [--thumbnail URL] [--threads N]";

/// 命令行参数
#[derive(Debug)]
struct CliArgs {
    destination: PathBuf,
    video: Option<String>,
    audio: Option<String>,
    subtitle: Option<String>,
    thumbnail: Option<String>,
    threads: usize,
}

impl CliArgs {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut destination = None;
        let mut parsed = CliArgs {
            destination: PathBuf::new(),
            video: None,
            audio: None,
            subtitle: None,
            thumbnail: None,
            threads: 0,
        };

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let mut value = |name: &str| {
                args.next()
                    .with_context(|| format!("参数 {} 缺少取值", name))
            };
            match arg.as_str() {
                "--video" => parsed.video = Some(value("--video")?),
                "--audio" => parsed.audio = Some(value("--audio")?),
                "--subtitle" => parsed.subtitle = Some(value("--subtitle")?),
                "--thumbnail" => parsed.thumbnail = Some(value("--thumbnail")?),
                "--threads" => {
                    parsed.threads = value("--threads")?
                        .parse()
                        .context("--threads 必须是正整数")?;
                }
                flag if flag.starts_with("--") => bail!("未知参数: {}\n{}", flag, USAGE),
                path => {
                    if destination.replace(PathBuf::from(path)).is_some() {
                        bail!("只能指定一个目标文件\n{}", USAGE);
                    }
                }
            }
        }

        parsed.destination = destination.with_context(|| USAGE.to_string())?;
        Ok(parsed)
    }

    fn into_task(self, download_dir: PathBuf) -> Task {
        // 相对路径放到下载目录下
        let destination = if self.destination.is_absolute() {
            self.destination
        } else {
            download_dir.join(self.destination)
        };

        let mut task = Task::new(destination).with_thread_count(self.threads);
        if let Some(url) = self.video {
            task = task.with_video(StreamDescriptor::new(url));
        }
        if let Some(url) = self.audio {
            task = task.with_audio(StreamDescriptor::new(url));
        }
        if let Some(url) = self.subtitle {
            task = task.with_subtitle(StreamDescriptor::new(url));
        }
        if let Some(url) = self.thumbnail {
            task = task.with_thumbnail(StreamDescriptor::new(url));
        }
        task
    }
}

/// 加载日志配置
///
/// 日志要在完整配置之前初始化，这里只读取 [log] 段
async fn load_log_config() -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(CONFIG_PATH).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }
    LogConfig::default()
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = load_log_config().await;
    let _log_guard = logging::init_logging(&log_config);

    let args = CliArgs::parse(std::env::args().skip(1))?;

    let config = AppConfig::load_or_default(CONFIG_PATH).await;
    let registry = TaskRegistry::from_config(&config)?;
    let download_dir = registry.download_directory()?;

    let task = args.into_task(download_dir);
    let (tx, mut rx) = mpsc::unbounded_channel::<DownloadEvent>();
    let listener: Arc<dyn EventListener> = Arc::new(tx);

    let task_id = registry.generate_task_id();
    registry.start_task(task_id, task, listener)?;

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    bail!("事件通道意外关闭");
                };
                match event {
                    DownloadEvent::Progress { percent, downloaded, total } => {
                        info!("进度: {}% ({}/{} 字节)", percent, downloaded, total);
                    }
                    DownloadEvent::Merge => info!("正在合并音视频..."),
                    DownloadEvent::Complete(path) => {
                        info!("✓ 下载完成: {:?}", path);
                        return Ok(());
                    }
                    DownloadEvent::Error(e) => {
                        error!("下载失败: {}", e);
                        return Err(e.into());
                    }
                    DownloadEvent::Cancel => {
                        warn!("下载已取消");
                        return Ok(());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("收到中断信号，取消下载");
                registry.shutdown();
            }
        }
    }
}
