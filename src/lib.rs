// Media Downloader Rust Library
// 多流媒体断点续传下载核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 持久化模块（断点位图、下载历史）
pub mod persistence;

// 下载引擎与任务编排
pub mod downloader;

// 音视频合并
pub mod muxer;

// 导出常用类型
pub use config::AppConfig;
pub use downloader::{
    DownloadEngine, DownloadError, DownloadEvent, DownloaderState, EventListener, StreamDescriptor,
    Task, TaskOrchestrator, TaskRegistry,
};
pub use muxer::{Mp4Muxer, MuxError, Muxer};
pub use persistence::{DownloadHistory, FileProgressStore, MemoryProgressStore, ProgressStore};
