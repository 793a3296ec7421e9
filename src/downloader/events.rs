// 下载事件与监听器
//
// 引擎和任务编排器都只通过这一种事件类型向外汇报状态

use std::path::PathBuf;

use tokio::sync::mpsc::UnboundedSender;

use super::error::DownloadError;

/// 下载事件
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// 进度更新（百分比严格递增，完成前最高 99）
    Progress {
        percent: u8,
        downloaded: u64,
        total: u64,
    },
    /// 开始合并音视频（每个任务最多一次）
    Merge,
    /// 下载完成
    Complete(PathBuf),
    /// 下载失败
    Error(DownloadError),
    /// 已取消
    Cancel,
}

impl DownloadEvent {
    /// 是否为终结事件
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Error(_) | Self::Cancel)
    }
}

/// 事件监听器
///
/// 回调在工作线程上同步执行，实现方应尽快返回。
pub trait EventListener: Send + Sync + 'static {
    fn on_event(&self, event: DownloadEvent);
}

impl<F> EventListener for F
where
    F: Fn(DownloadEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: DownloadEvent) {
        self(event)
    }
}

impl EventListener for UnboundedSender<DownloadEvent> {
    fn on_event(&self, event: DownloadEvent) {
        // 接收端已关闭说明调用方不再关心事件
        let _ = self.send(event);
    }
}
