//! 音视频合并模块
//!
//! 只做容器层面的重新封装：从视频文件取第一条视频轨，从音频文件取第一条音频轨，
//! 写入一个新的容器文件，不重新编码。

pub mod mp4_muxer;

use std::io;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

pub use mp4_muxer::Mp4Muxer;

/// 合并错误
#[derive(Debug, Clone, Error)]
pub enum MuxError {
    /// 视频文件里没有视频轨，或音频文件里没有音频轨
    #[error("未在输入文件中找到视频或音频轨道")]
    EmptyTrack,

    #[error("不支持的编码格式: {0}")]
    UnsupportedCodec(String),

    #[error("容器解析失败: {0}")]
    Container(String),

    #[error("文件读写失败: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl From<io::Error> for MuxError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<mp4::Error> for MuxError {
    fn from(err: mp4::Error) -> Self {
        match err {
            mp4::Error::IoError(e) => Self::Io(Arc::new(e)),
            other => Self::Container(other.to_string()),
        }
    }
}

/// 合并器接口
///
/// 同步阻塞执行，调用方负责放到阻塞线程池里
pub trait Muxer: Send + Sync {
    /// 合并视频和音频到 `output`
    ///
    /// 选轨失败时不会创建输出文件；写入中途失败会删除不完整的输出
    fn merge(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), MuxError>;
}
