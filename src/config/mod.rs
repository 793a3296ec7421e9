// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::downloader::DEFAULT_CONCURRENCY;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info），RUST_LOG 优先
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 默认下载目录
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 临时文件目录（分流下载和合并的中间文件）
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// 单个资源的默认并发分片数
    #[serde(default = "default_thread_count")]
    pub default_thread_count: usize,
    /// 最大同时运行任务数，0 表示按 CPU 核数
    #[serde(default)]
    pub max_concurrent_tasks: usize,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("downloads/.cache")
}

fn default_thread_count() -> usize {
    DEFAULT_CONCURRENCY
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            scratch_dir: default_scratch_dir(),
            default_thread_count: default_thread_count(),
            max_concurrent_tasks: 0,
        }
    }
}

impl DownloadConfig {
    /// 校验数值范围
    pub fn validate(&self) -> Result<()> {
        if self.default_thread_count == 0 {
            anyhow::bail!("default_thread_count 必须大于 0");
        }
        if self.download_dir.as_os_str().is_empty() {
            anyhow::bail!("download_dir 不能为空");
        }
        Ok(())
    }
}

/// 持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 断点续传位图目录
    #[serde(default = "default_progress_dir")]
    pub progress_dir: PathBuf,
    /// 下载历史文件
    #[serde(default = "default_history_file")]
    pub history_file: PathBuf,
    /// 是否记录下载历史
    #[serde(default = "default_history_enabled")]
    pub history_enabled: bool,
}

fn default_progress_dir() -> PathBuf {
    PathBuf::from("data/progress")
}

fn default_history_file() -> PathBuf {
    PathBuf::from("data/history.json")
}

fn default_history_enabled() -> bool {
    true
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            progress_dir: default_progress_dir(),
            history_file: default_history_file(),
            history_enabled: default_history_enabled(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;

        let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;
        config.download.validate().context("配置校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.download.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("创建配置目录失败")?;
            }
        }
        fs::write(path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {:?}", path))?;

        tracing::info!("配置已保存: {:?}", path);
        Ok(())
    }

    /// 加载配置，失败时使用默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}
