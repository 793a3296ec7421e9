use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::DownloadError;
use super::events::{DownloadEvent, EventListener};

/// 单个任务的回调闸门
///
/// 保证每个任务只送达一个终结事件；取消一旦发生，之后的进度、完成、
/// 错误都会被丢弃，所以取消总是胜出。
pub struct TaskControl {
    task_id: u64,
    cancel: CancellationToken,
    terminal: AtomicBool,
    merge_sent: AtomicBool,
    last_percent: Mutex<i32>,
    listener: Arc<dyn EventListener>,
}

impl TaskControl {
    pub fn new(task_id: u64, listener: Arc<dyn EventListener>) -> Self {
        Self {
            task_id,
            cancel: CancellationToken::new(),
            terminal: AtomicBool::new(false),
            merge_sent: AtomicBool::new(false),
            last_percent: Mutex::new(-1),
            listener,
        }
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 任务被取消时完成
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.terminal.load(Ordering::SeqCst)
    }

    /// 推送进度，只转发严格递增的百分比
    pub fn progress(&self, percent: u8, downloaded: u64, total: u64) {
        // 与终结事件共用这把锁，终结之后不会再有进度漏出去
        let mut last = self.last_percent.lock();
        if self.is_closed() || self.is_cancelled() || i32::from(percent) <= *last {
            return;
        }
        *last = i32::from(percent);
        self.listener.on_event(DownloadEvent::Progress {
            percent,
            downloaded,
            total,
        });
    }

    /// 推送"开始合并"，每个任务最多一次
    pub fn merge(&self) {
        let _order = self.last_percent.lock();
        if self.is_closed() || self.is_cancelled() {
            return;
        }
        if !self.merge_sent.swap(true, Ordering::SeqCst) {
            self.listener.on_event(DownloadEvent::Merge);
        }
    }

    pub fn complete(&self, path: PathBuf) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.close(DownloadEvent::Complete(path))
    }

    pub fn fail(&self, err: DownloadError) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.close(DownloadEvent::Error(err))
    }

    /// 取消任务，返回是否由这次调用送达了取消事件
    pub fn cancel(&self) -> bool {
        self.cancel.cancel();
        self.close(DownloadEvent::Cancel)
    }

    fn close(&self, event: DownloadEvent) -> bool {
        let _order = self.last_percent.lock();
        if self.terminal.swap(true, Ordering::SeqCst) {
            debug!("任务 {} 已结束，丢弃事件: {:?}", self.task_id, event);
            return false;
        }
        self.listener.on_event(event);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn control() -> (TaskControl, Arc<StdMutex<Vec<DownloadEvent>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        let listener: Arc<dyn EventListener> =
            Arc::new(move |e: DownloadEvent| sink.lock().unwrap().push(e));
        (TaskControl::new(1, listener), events)
    }

    #[test]
    fn test_single_terminal_event() {
        let (control, events) = control();
        control.progress(10, 10, 100);
        control.progress(10, 12, 100);
        control.merge();
        control.merge();
        assert!(control.complete(PathBuf::from("/d/movie.mp4")));
        assert!(!control.fail(DownloadError::EmptyTask));
        assert!(!control.cancel());
        control.progress(50, 50, 100);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], DownloadEvent::Progress { percent: 10, .. }));
        assert!(matches!(events[1], DownloadEvent::Merge));
        assert!(matches!(events[2], DownloadEvent::Complete(_)));
    }

    #[test]
    fn test_cancel_wins_over_late_completion() {
        let (control, events) = control();
        assert!(control.cancel());
        assert!(!control.complete(PathBuf::from("/d/movie.mp4")));
        control.merge();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], DownloadEvent::Cancel));
    }
}
