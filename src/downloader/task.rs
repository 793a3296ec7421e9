use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 任务状态（单写者，只能单调推进）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DownloaderState {
    /// 已登记，等待派发
    Pending,
    /// 已派发到工作线程
    Running,
    /// 下载中
    Downloading,
    /// 合并音视频中
    Merging,
    /// 已完成
    Finished,
    /// 已取消
    Cancelled,
    /// 出错停止
    Stopped,
}

impl DownloaderState {
    /// 是否为终结状态
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled | Self::Stopped)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Downloading => 2,
            Self::Merging => 3,
            Self::Finished | Self::Cancelled | Self::Stopped => 4,
        }
    }

    /// 是否允许从当前状态迁移到 `next`
    ///
    /// 终结状态不可离开；取消和出错可以从任意非终结状态进入；其余只能向前
    pub fn can_transition_to(&self, next: DownloaderState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank()
    }

    /// 迁移状态，不合法时保持原状态并返回 false
    pub fn advance(&mut self, next: DownloaderState) -> bool {
        if self.can_transition_to(next) {
            *self = next;
            true
        } else {
            false
        }
    }
}

/// 流在任务中的角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StreamRole {
    Video,
    Audio,
    Subtitle,
    Thumbnail,
}

impl StreamRole {
    /// 临时文件名后缀
    pub fn temp_suffix(&self) -> &'static str {
        match self {
            Self::Video => "_v",
            Self::Audio => "_a",
            Self::Subtitle => "_s",
            Self::Thumbnail => "_t",
        }
    }
}

/// 单路流描述
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// 流地址
    pub url: String,
    /// 声明的大小（提取阶段给出，可能未知），用于进度加权
    #[serde(default)]
    pub content_length: Option<u64>,
    /// 文件扩展名（不含点），字幕用来决定输出文件名
    #[serde(default)]
    pub extension: Option<String>,
}

impl StreamDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            content_length: None,
            extension: None,
        }
    }

    pub fn with_length(mut self, length: u64) -> Self {
        self.content_length = Some(length);
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }
}

/// 任务组成
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// 仅字幕或仅封面，直接下载到目标位置
    SingleFile(StreamRole),
    /// 含视频和/或音频
    Combined,
}

/// 下载任务
///
/// 创建后不可变；状态由 TaskRegistry 单独维护
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub video: Option<StreamDescriptor>,
    #[serde(default)]
    pub audio: Option<StreamDescriptor>,
    #[serde(default)]
    pub subtitle: Option<StreamDescriptor>,
    #[serde(default)]
    pub thumbnail: Option<StreamDescriptor>,
    /// 最终输出路径（含文件名）
    pub destination: PathBuf,
    /// 并发分片数建议值，0 表示沿用引擎当前设置
    #[serde(default)]
    pub thread_count: usize,
}

impl Task {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            video: None,
            audio: None,
            subtitle: None,
            thumbnail: None,
            destination: destination.into(),
            thread_count: 0,
        }
    }

    pub fn with_video(mut self, stream: StreamDescriptor) -> Self {
        self.video = Some(stream);
        self
    }

    pub fn with_audio(mut self, stream: StreamDescriptor) -> Self {
        self.audio = Some(stream);
        self
    }

    pub fn with_subtitle(mut self, stream: StreamDescriptor) -> Self {
        self.subtitle = Some(stream);
        self
    }

    pub fn with_thumbnail(mut self, stream: StreamDescriptor) -> Self {
        self.thumbnail = Some(stream);
        self
    }

    pub fn with_thread_count(mut self, threads: usize) -> Self {
        self.thread_count = threads;
        self
    }

    /// 根据已填写的流判断任务组成，没有任何流时返回 None
    pub fn kind(&self) -> Option<TaskKind> {
        if self.video.is_some() || self.audio.is_some() {
            Some(TaskKind::Combined)
        } else if self.subtitle.is_some() {
            Some(TaskKind::SingleFile(StreamRole::Subtitle))
        } else if self.thumbnail.is_some() {
            Some(TaskKind::SingleFile(StreamRole::Thumbnail))
        } else {
            None
        }
    }

    pub fn stream(&self, role: StreamRole) -> Option<&StreamDescriptor> {
        match role {
            StreamRole::Video => self.video.as_ref(),
            StreamRole::Audio => self.audio.as_ref(),
            StreamRole::Subtitle => self.subtitle.as_ref(),
            StreamRole::Thumbnail => self.thumbnail.as_ref(),
        }
    }

    /// 文件名根（目标文件名去掉扩展名），用于命名临时文件
    pub fn file_name_root(&self) -> String {
        self.destination
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "download".to_string())
    }

    /// 目标文件名（用于日志和历史记录）
    pub fn file_name(&self) -> String {
        self.destination
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file_name_root())
    }

    /// 组合任务中字幕的输出路径：与目标文件同目录、同名，扩展名取字幕自身的
    pub fn subtitle_destination(&self) -> Option<PathBuf> {
        let subtitle = self.subtitle.as_ref()?;
        let extension = subtitle.extension.as_deref().unwrap_or("vtt");
        let dir = self.destination.parent().unwrap_or_else(|| Path::new(""));
        Some(dir.join(format!("{}.{}", self.file_name_root(), extension)))
    }
}
