use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bit_set::BitSet;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::chunk::{Chunk, ChunkPlan};
use super::context::{DownloadContext, FetchHandle, FetchOutcome};
use super::error::DownloadError;
use super::events::EventListener;
use super::http::HttpFetcher;
use crate::persistence::{decode_bitmap, encode_bitmap, fingerprint, ProgressStore};

/// 默认并发分片数
pub const DEFAULT_CONCURRENCY: usize = 8;

/// 分片下载引擎
///
/// 把一个 URL 抓取到一个本地文件：HEAD 探测 -> 生成分片计划 -> 读取完成位图 ->
/// 并发下载未完成分片 -> 每个分片完成后立即持久化位图。
///
/// 抓取默认共享同一个线程池（信号量），`set_concurrency` 调整的是它的大小；
/// `fetch_with_threads` 发起的抓取使用自己的上限。
pub struct DownloadEngine {
    fetcher: Arc<dyn HttpFetcher>,
    store: Arc<dyn ProgressStore>,
    /// 当前并发上限
    max_threads: AtomicUsize,
    /// 分片线程池
    pool: RwLock<Arc<Semaphore>>,
    /// 进行中的抓取（URL -> 上下文）
    contexts: DashMap<String, Arc<DownloadContext>>,
}

impl DownloadEngine {
    pub fn new(
        fetcher: Arc<dyn HttpFetcher>,
        store: Arc<dyn ProgressStore>,
        concurrency: usize,
    ) -> Self {
        let concurrency = concurrency.max(1);
        info!("创建下载引擎: 并发分片数={}", concurrency);
        Self {
            fetcher,
            store,
            max_threads: AtomicUsize::new(concurrency),
            pool: RwLock::new(Arc::new(Semaphore::new(concurrency))),
            contexts: DashMap::new(),
        }
    }

    /// 开始抓取，立即返回句柄，结果通过监听器和句柄异步送达
    ///
    /// 同一 URL 已有进行中的抓取时，旧抓取会被取消（保留其位图供新抓取续传）
    pub fn fetch(
        self: &Arc<Self>,
        url: &str,
        output: impl AsRef<Path>,
        listener: Option<Arc<dyn EventListener>>,
    ) -> FetchHandle {
        self.start(url, output.as_ref(), None, listener)
    }

    /// 以独立的并发上限抓取，不占用也不调整引擎线程池
    pub fn fetch_with_threads(
        self: &Arc<Self>,
        url: &str,
        output: impl AsRef<Path>,
        threads: usize,
        listener: Option<Arc<dyn EventListener>>,
    ) -> FetchHandle {
        self.start(url, output.as_ref(), Some(threads), listener)
    }

    fn start(
        self: &Arc<Self>,
        url: &str,
        output: &Path,
        thread_limit: Option<usize>,
        listener: Option<Arc<dyn EventListener>>,
    ) -> FetchHandle {
        let (ctx, handle) = DownloadContext::new(url, output, thread_limit, listener);

        if let Some(previous) = self.contexts.insert(url.to_string(), ctx.clone()) {
            warn!("同一 URL 已有进行中的抓取，旧抓取将被取消: {}", url);
            previous.cancel_token().cancel();
            previous.finish(FetchOutcome::Cancelled);
        }

        info!(
            "📥 提交抓取: url={}, 输出={:?}, 指纹={}, 独立并发={:?}",
            url,
            ctx.output(),
            ctx.key(),
            ctx.thread_limit
        );
        tokio::spawn(self.clone().run(ctx));
        handle
    }

    /// 暂停抓取，位图保留
    pub fn pause(&self, url: &str) -> bool {
        match self.contexts.get(url) {
            Some(entry) => {
                entry.value().pause();
                info!("⏸ 暂停抓取: {}", url);
                true
            }
            None => false,
        }
    }

    /// 恢复已暂停的抓取，只重新下载位图中未完成的分片
    pub fn resume(self: &Arc<Self>, url: &str) -> bool {
        let Some(ctx) = self.contexts.get(url).map(|entry| entry.value().clone()) else {
            return false;
        };
        if !ctx.try_resume() {
            debug!("抓取未处于暂停状态，忽略恢复: {}", url);
            return false;
        }

        info!("▶ 恢复抓取: {}", url);
        tokio::spawn(self.clone().run(ctx));
        true
    }

    /// 取消抓取并删除位图，之后同一 URL 只能从头开始
    pub fn cancel(&self, url: &str) -> bool {
        let Some((_, ctx)) = self.contexts.remove(url) else {
            return false;
        };
        self.abort(&ctx);
        true
    }

    /// 只取消句柄自己的那次抓取
    ///
    /// 同一 URL 已被另一次抓取接管时不做任何事，返回 false
    pub fn cancel_handle(&self, handle: &FetchHandle) -> bool {
        let Some(ctx) = handle.context() else {
            return false;
        };
        match self
            .contexts
            .remove_if(ctx.url(), |_, current| Arc::ptr_eq(current, &ctx))
        {
            Some((_, ctx)) => {
                self.abort(&ctx);
                true
            }
            None => false,
        }
    }

    /// 丢弃 URL 的持久化进度，URL 仍在引擎中时保留
    pub fn discard_progress(&self, url: &str) -> bool {
        if self.contexts.contains_key(url) {
            return false;
        }
        let key = fingerprint(url);
        match self.store.remove(&key) {
            Ok(()) => {
                debug!("已丢弃进度位图: key={}", key);
                true
            }
            Err(e) => {
                warn!("删除进度位图失败: key={}, 错误: {}", key, e);
                false
            }
        }
    }

    fn abort(&self, ctx: &Arc<DownloadContext>) {
        ctx.cancel_token().cancel();
        {
            // 与分片完成时的持久化互斥，避免删除后又被写回
            let _bits = ctx.bitmap.lock();
            if let Err(e) = self.store.remove(ctx.key()) {
                warn!("删除进度位图失败: key={}, 错误: {}", ctx.key(), e);
            }
        }
        ctx.finish(FetchOutcome::Cancelled);

        info!("✗ 已取消抓取: {}", ctx.url());
    }

    /// 调整并发分片数
    ///
    /// 已经拿到许可的分片继续按旧上限运行，新派发的分片使用新线程池
    pub fn set_concurrency(&self, n: usize) {
        let n = n.max(1);
        let old = self.max_threads.swap(n, Ordering::SeqCst);
        if old == n {
            return;
        }
        *self.pool.write() = Arc::new(Semaphore::new(n));
        info!("调整引擎并发分片数: {} -> {}", old, n);
    }

    pub fn concurrency(&self) -> usize {
        self.max_threads.load(Ordering::SeqCst)
    }

    /// URL 是否仍在引擎中（进行中或已暂停）
    pub fn is_active(&self, url: &str) -> bool {
        self.contexts.contains_key(url)
    }

    async fn run(self: Arc<Self>, ctx: Arc<DownloadContext>) {
        // 恢复时可能上一轮还没完全退出，等它结束
        let _running = ctx.run_lock.lock().await;
        if ctx.is_inactive() || ctx.is_finished() {
            return;
        }

        let attempt = ctx.begin_attempt();
        match self.execute(&ctx, &attempt).await {
            Ok(()) => self.complete(&ctx),
            Err(_) if ctx.is_cancelled() => {
                debug!("抓取已取消，丢弃本轮结果: {}", ctx.url());
            }
            Err(e) if e.is_interrupted() || ctx.is_paused() => {
                info!(
                    "抓取已暂停: url={}, 已下载 {} bytes",
                    ctx.url(),
                    ctx.downloaded()
                );
            }
            Err(e) => {
                error!("抓取失败: url={}, 错误: {}", ctx.url(), e);
                self.contexts
                    .remove_if(ctx.url(), |_, current| Arc::ptr_eq(current, &ctx));
                ctx.finish(FetchOutcome::Failed(e));
            }
        }
    }

    async fn execute(
        &self,
        ctx: &Arc<DownloadContext>,
        attempt: &CancellationToken,
    ) -> Result<(), DownloadError> {
        // 1. 探测
        let probe = tokio::select! {
            probe = self.fetcher.probe(ctx.url()) => probe?,
            _ = attempt.cancelled() => return Err(DownloadError::Interrupted),
        };

        // 2. 分片计划
        let plan = ChunkPlan::new(probe.total, probe.accepts_ranges);

        // 3. 完成位图 + 预分配文件
        let mut completed = if plan.is_ranged() {
            self.load_bitmap(ctx, &plan)
        } else {
            BitSet::new()
        };
        if !completed.is_empty() && !Self::output_matches(ctx.output(), plan.total()).await {
            warn!(
                "输出文件缺失或大小不符，忽略已有进度从头下载: {:?}",
                ctx.output()
            );
            completed.clear();
        }

        let file = Self::prepare_file(ctx.output(), plan.total(), plan.is_ranged()).await?;

        let pending: Vec<Chunk> = plan.pending(&completed).cloned().collect();
        ctx.downloaded
            .store(plan.completed_bytes(&completed), Ordering::SeqCst);
        *ctx.bitmap.lock() = completed;
        if let Some(total) = plan.total() {
            ctx.report_progress(total);
        }

        info!(
            "开始抓取: url={}, 总大小={:?}, 分片 {}/{} 待下载, 已完成 {} bytes",
            ctx.url(),
            plan.total(),
            pending.len(),
            plan.chunk_count(),
            ctx.downloaded()
        );

        // 4. 并发下载
        self.download_chunks(ctx, &plan, pending, file, attempt)
            .await
    }

    async fn download_chunks(
        &self,
        ctx: &Arc<DownloadContext>,
        plan: &ChunkPlan,
        pending: Vec<Chunk>,
        file: File,
        attempt: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let file = Arc::new(Mutex::new(file));
        let pool = match ctx.thread_limit {
            Some(limit) => Arc::new(Semaphore::new(limit)),
            None => self.pool.read().clone(),
        };

        let mut units = JoinSet::new();
        let mut interrupted = false;

        for chunk in pending {
            if ctx.is_inactive() || attempt.is_cancelled() {
                interrupted = true;
                break;
            }

            // 所有分片立即派发，在任务内部等待线程池许可
            let unit = ChunkUnit {
                fetcher: self.fetcher.clone(),
                store: self.store.clone(),
                ctx: ctx.clone(),
                chunk,
                ranged: plan.is_ranged(),
                total: plan.total(),
                file: file.clone(),
                pool: pool.clone(),
                attempt: attempt.clone(),
            };
            units.spawn(unit.run());
        }

        let mut first_error: Option<DownloadError> = None;
        while let Some(joined) = units.join_next().await {
            let result = joined
                .unwrap_or_else(|e| Err(DownloadError::Connection(format!("分片任务异常: {}", e))));
            match result {
                Ok(()) => {}
                Err(e) if e.is_interrupted() => interrupted = true,
                Err(e) => {
                    if first_error.is_none() {
                        warn!("分片下载失败，终止其余分片: {}", e);
                        // 让其余分片尽快退出
                        attempt.cancel();
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if interrupted || ctx.is_cancelled() {
            return Err(DownloadError::Interrupted);
        }

        let mut file = file.lock().await;
        file.flush()
            .await
            .map_err(|e| DownloadError::storage("刷新文件缓冲失败", e))?;
        file.sync_all()
            .await
            .map_err(|e| DownloadError::storage("同步文件失败", e))?;
        Ok(())
    }

    fn complete(&self, ctx: &Arc<DownloadContext>) {
        {
            let _bits = ctx.bitmap.lock();
            if let Err(e) = self.store.remove(ctx.key()) {
                warn!("删除进度位图失败: key={}, 错误: {}", ctx.key(), e);
            }
        }
        self.contexts
            .remove_if(ctx.url(), |_, current| Arc::ptr_eq(current, ctx));
        ctx.clear_pause();

        if ctx.finish(FetchOutcome::Completed(ctx.output().to_path_buf())) {
            info!("✓ 抓取完成: url={}, 文件={:?}", ctx.url(), ctx.output());
        }
    }

    fn load_bitmap(&self, ctx: &DownloadContext, plan: &ChunkPlan) -> BitSet {
        let Some(bytes) = self.store.load(ctx.key()) else {
            return BitSet::new();
        };

        let bits = decode_bitmap(&bytes);
        if !plan.accepts_bitmap(&bits) {
            warn!("进度位图与分片计划不匹配，丢弃: key={}", ctx.key());
            return BitSet::new();
        }

        debug!(
            "读取进度位图: key={}, 已完成分片 {}/{}",
            ctx.key(),
            bits.len(),
            plan.chunk_count()
        );
        bits
    }

    async fn output_matches(path: &Path, total: Option<u64>) -> bool {
        match (tokio::fs::metadata(path).await, total) {
            (Ok(meta), Some(total)) => meta.len() == total,
            _ => false,
        }
    }

    /// 准备输出文件
    ///
    /// 分片计划保留已有内容并预分配到总长度；不分片时从空文件开始
    async fn prepare_file(path: &Path, total: Option<u64>, ranged: bool) -> Result<File, DownloadError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| DownloadError::storage("创建父目录失败", e))?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(!ranged)
            .open(path)
            .await
            .map_err(|e| DownloadError::storage("打开输出文件失败", e))?;

        if let Some(total) = total {
            file.set_len(total)
                .await
                .map_err(|e| DownloadError::storage("预分配文件空间失败", e))?;
        }

        debug!("文件准备完成: {:?}, 大小: {:?}", path, total);
        Ok(file)
    }
}

/// 单个分片的下载单元
struct ChunkUnit {
    fetcher: Arc<dyn HttpFetcher>,
    store: Arc<dyn ProgressStore>,
    ctx: Arc<DownloadContext>,
    chunk: Chunk,
    ranged: bool,
    total: Option<u64>,
    file: Arc<Mutex<File>>,
    pool: Arc<Semaphore>,
    attempt: CancellationToken,
}

impl ChunkUnit {
    async fn run(self) -> Result<(), DownloadError> {
        let _permit = tokio::select! {
            permit = self.pool.clone().acquire_owned() => {
                permit.map_err(|_| DownloadError::Interrupted)?
            }
            _ = self.attempt.cancelled() => return Err(DownloadError::Interrupted),
        };

        if self.ctx.is_inactive() {
            return Err(DownloadError::Interrupted);
        }

        let range = if self.ranged {
            self.chunk.range.clone()
        } else {
            None
        };
        debug!("分片 #{} 开始下载: range={:?}", self.chunk.index, range);

        let mut stream = tokio::select! {
            opened = self.fetcher.open(self.ctx.url(), range) => opened?,
            _ = self.attempt.cancelled() => return Err(DownloadError::Interrupted),
        };

        let start = self.chunk.start();
        let expected = self.chunk.size();
        let mut written = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.attempt.cancelled() => return Err(DownloadError::Interrupted),
                next = stream.next() => next,
            };
            let Some(item) = next else {
                break;
            };
            let data = item?;

            if self.ctx.is_inactive() {
                return Err(DownloadError::Interrupted);
            }

            let len = data.len() as u64;
            if let Some(expected) = expected {
                if written + len > expected {
                    return Err(DownloadError::Incomplete {
                        index: self.chunk.index,
                        expected,
                        actual: written + len,
                    });
                }
            }

            // 锁只保护 seek + write 这一对操作
            {
                let mut file = self.file.lock().await;
                file.seek(SeekFrom::Start(start + written))
                    .await
                    .map_err(|e| DownloadError::storage("文件定位失败", e))?;
                file.write_all(&data)
                    .await
                    .map_err(|e| DownloadError::storage("写入文件失败", e))?;
            }

            written += len;
            self.ctx.downloaded.fetch_add(len, Ordering::SeqCst);
            if let Some(total) = self.total {
                self.ctx.report_progress(total);
            }
        }

        if let Some(expected) = expected {
            if written != expected {
                return Err(DownloadError::Incomplete {
                    index: self.chunk.index,
                    expected,
                    actual: written,
                });
            }
        }

        if self.ranged {
            self.mark_completed();
        }
        debug!("分片 #{} 下载完成: {} bytes", self.chunk.index, written);
        Ok(())
    }

    fn mark_completed(&self) {
        let mut bits = self.ctx.bitmap.lock();
        // 已取消的抓取不能再写回位图
        if self.ctx.is_cancelled() {
            return;
        }
        bits.insert(self.chunk.index);
        if let Err(e) = self.store.save(self.ctx.key(), &encode_bitmap(&bits)) {
            warn!("持久化进度位图失败: key={}, 错误: {}", self.ctx.key(), e);
        }
    }
}
