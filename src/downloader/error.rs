//! 下载错误类型
//!
//! 所有错误都实现 `Clone`，同一个错误既要通过回调推送给调用方，
//! 也要保存在 `FetchHandle` 的结果里。

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::muxer::MuxError;

/// 下载相关错误
#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    /// 探测或分片 GET 请求失败
    #[error("网络连接失败: {0}")]
    Connection(String),

    /// 服务器返回非预期的状态码
    #[error("服务器返回异常状态码: {0}")]
    HttpStatus(u16),

    /// 分片响应长度与计划不符
    #[error("分片 #{index} 数据长度异常: 期望 {expected} 字节, 实际 {actual} 字节")]
    Incomplete {
        index: usize,
        expected: u64,
        actual: u64,
    },

    /// 目录创建、文件写入或移动失败
    #[error("{context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// 音视频合并失败
    #[error("音视频合并失败: {0}")]
    Muxing(#[from] MuxError),

    /// 任务未包含任何可下载的流
    #[error("任务未包含任何可下载的流")]
    EmptyTask,

    /// 抓取在任务之外被取消（例如同一 URL 被直接交给引擎重新抓取）
    #[error("抓取被外部取消")]
    Aborted,

    /// 被暂停或取消打断（内部使用，不会推送给调用方）
    #[error("下载已中断")]
    Interrupted,
}

impl DownloadError {
    pub fn storage(context: impl Into<String>, source: io::Error) -> Self {
        Self::Storage {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::HttpStatus(status.as_u16()),
            None => Self::Connection(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_keeps_source() {
        let err = DownloadError::storage(
            "创建临时目录失败",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        let text = err.to_string();
        assert!(text.starts_with("创建临时目录失败"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_mux_error_converts() {
        let err: DownloadError = MuxError::EmptyTrack.into();
        assert!(matches!(err, DownloadError::Muxing(MuxError::EmptyTrack)));
        assert!(!err.is_interrupted());
    }
}
