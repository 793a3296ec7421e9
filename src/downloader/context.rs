use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bit_set::BitSet;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::DownloadError;
use super::events::{DownloadEvent, EventListener};
use crate::persistence::fingerprint;

/// 单次抓取的最终结果
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Completed(PathBuf),
    Failed(DownloadError),
    Cancelled,
}

/// 抓取句柄
///
/// 可以多次 clone，每个副本都能等待同一个结果
#[derive(Debug, Clone)]
pub struct FetchHandle {
    url: String,
    rx: watch::Receiver<Option<FetchOutcome>>,
    ctx: Weak<DownloadContext>,
}

impl FetchHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// 等待抓取结束（完成、失败或取消）
    ///
    /// 暂停中的抓取会一直等待，直到恢复后结束或被取消
    pub async fn wait(&self) -> FetchOutcome {
        let mut rx = self.rx.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // 上下文已销毁却没有写入结果，只可能是引擎被整体丢弃
                return FetchOutcome::Cancelled;
            }
        }
    }

    /// 等待后台运行彻底退出
    ///
    /// 取消后结果会立即送达，但分片可能还在收尾；删除输出文件前应先等这里返回
    pub async fn settled(&self) {
        if let Some(ctx) = self.ctx.upgrade() {
            let _idle = ctx.run_lock.lock().await;
        }
    }

    /// 非阻塞地查看结果
    pub fn outcome(&self) -> Option<FetchOutcome> {
        self.rx.borrow().clone()
    }

    /// 句柄对应的上下文，抓取结束且引擎不再持有时返回 None
    pub(crate) fn context(&self) -> Option<Arc<DownloadContext>> {
        self.ctx.upgrade()
    }
}

/// 单次抓取的运行时状态
///
/// 由引擎独占持有，完成、取消或失败后从引擎中移除
pub struct DownloadContext {
    pub(crate) url: String,
    pub(crate) output: PathBuf,
    pub(crate) key: String,
    /// 本次抓取独立的并发上限，None 时使用引擎线程池
    pub(crate) thread_limit: Option<usize>,
    paused: AtomicBool,
    cancel: CancellationToken,
    /// 当前这一轮运行的令牌，暂停时取消，恢复时重建
    attempt: Mutex<CancellationToken>,
    pub(crate) downloaded: AtomicU64,
    last_progress: Mutex<i32>,
    /// 完成位图，持久化也在这把锁下进行
    pub(crate) bitmap: Mutex<BitSet>,
    finished: AtomicBool,
    /// 同一时刻只允许一轮运行（恢复时需等上一轮彻底退出）
    pub(crate) run_lock: tokio::sync::Mutex<()>,
    listener: Option<Arc<dyn EventListener>>,
    outcome: watch::Sender<Option<FetchOutcome>>,
}

impl DownloadContext {
    pub(crate) fn new(
        url: &str,
        output: &Path,
        thread_limit: Option<usize>,
        listener: Option<Arc<dyn EventListener>>,
    ) -> (Arc<Self>, FetchHandle) {
        let (tx, rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let attempt = cancel.child_token();

        let ctx = Arc::new(Self {
            url: url.to_string(),
            output: output.to_path_buf(),
            key: fingerprint(url),
            thread_limit: thread_limit.map(|n| n.max(1)),
            paused: AtomicBool::new(false),
            cancel,
            attempt: Mutex::new(attempt),
            downloaded: AtomicU64::new(0),
            last_progress: Mutex::new(-1),
            bitmap: Mutex::new(BitSet::new()),
            finished: AtomicBool::new(false),
            run_lock: tokio::sync::Mutex::new(()),
            listener,
            outcome: tx,
        });

        let handle = FetchHandle {
            url: url.to_string(),
            rx,
            ctx: Arc::downgrade(&ctx),
        };
        (ctx, handle)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 暂停或取消后，分片读循环和派发循环都应停止
    pub fn is_inactive(&self) -> bool {
        self.is_paused() || self.is_cancelled()
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::SeqCst)
    }

    /// 开始新一轮运行，返回本轮的令牌
    pub(crate) fn begin_attempt(&self) -> CancellationToken {
        let token = self.cancel.child_token();
        *self.attempt.lock() = token.clone();
        token
    }

    pub(crate) fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.attempt.lock().cancel();
    }

    /// 仅当处于暂停状态时才会恢复，返回是否真正发生了状态切换
    pub(crate) fn try_resume(&self) -> bool {
        self.paused
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn clear_pause(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 尝试汇报进度
    ///
    /// 百分比上限 99，只有严格大于上次汇报值时才推送；
    /// 整个过程持锁，保证多个分片并发汇报时回调看到的序列也是递增的
    pub(crate) fn report_progress(&self, total: u64) {
        if total == 0 {
            return;
        }
        let downloaded = self.downloaded().min(total);
        let percent = ((downloaded as u128 * 100 / total as u128) as i32).min(99);

        let mut last = self.last_progress.lock();
        if percent <= *last {
            return;
        }
        *last = percent;

        if let Some(listener) = &self.listener {
            listener.on_event(DownloadEvent::Progress {
                percent: percent as u8,
                downloaded,
                total,
            });
        }
    }

    /// 写入终结结果并推送对应事件，只有第一次调用生效
    pub(crate) fn finish(&self, outcome: FetchOutcome) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }

        let event = match &outcome {
            FetchOutcome::Completed(path) => DownloadEvent::Complete(path.clone()),
            FetchOutcome::Failed(err) => DownloadEvent::Error(err.clone()),
            FetchOutcome::Cancelled => DownloadEvent::Cancel,
        };
        debug!("抓取结束: url={}, 结果={:?}", self.url, outcome);

        if let Some(listener) = &self.listener {
            listener.on_event(event);
        }
        self.outcome.send_replace(Some(outcome));
        true
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn collecting_listener() -> (Arc<dyn EventListener>, Arc<StdMutex<Vec<DownloadEvent>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        let listener: Arc<dyn EventListener> =
            Arc::new(move |e: DownloadEvent| sink.lock().unwrap().push(e));
        (listener, events)
    }

    #[test]
    fn test_progress_strictly_increasing_and_capped() {
        let (listener, events) = collecting_listener();
        let (ctx, _handle) = DownloadContext::new("http://a/b", Path::new("/tmp/x"), None, Some(listener));

        for downloaded in [0u64, 5, 5, 3, 50, 100, 100] {
            ctx.downloaded.store(downloaded, Ordering::SeqCst);
            ctx.report_progress(100);
        }

        let percents: Vec<u8> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                DownloadEvent::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![0, 5, 50, 99]);
    }

    #[tokio::test]
    async fn test_finish_only_once() {
        let (listener, events) = collecting_listener();
        let (ctx, handle) = DownloadContext::new("http://a/b", Path::new("/tmp/x"), None, Some(listener));

        assert!(ctx.finish(FetchOutcome::Cancelled));
        assert!(!ctx.finish(FetchOutcome::Completed(PathBuf::from("/tmp/x"))));

        assert!(matches!(handle.wait().await, FetchOutcome::Cancelled));
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_pause_cancels_current_attempt_only() {
        let (ctx, _handle) = DownloadContext::new("http://a/b", Path::new("/tmp/x"), None, None);
        let first = ctx.begin_attempt();
        ctx.pause();
        assert!(first.is_cancelled());
        assert!(ctx.is_inactive());
        assert!(!ctx.is_cancelled());

        assert!(ctx.try_resume());
        assert!(!ctx.try_resume());
        let second = ctx.begin_attempt();
        assert!(!second.is_cancelled());
    }

    #[test]
    fn test_handle_reaches_context_while_alive() {
        let (ctx, handle) = DownloadContext::new("http://a/b", Path::new("/tmp/x"), Some(0), None);
        assert_eq!(ctx.thread_limit, Some(1));
        assert!(Arc::ptr_eq(&handle.context().unwrap(), &ctx));

        drop(ctx);
        assert!(handle.context().is_none());
        assert_eq!(handle.url(), "http://a/b");
    }
}
