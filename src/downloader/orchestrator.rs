//! 任务编排
//!
//! 把一个 [`Task`] 从声明的流集合推进到唯一的输出文件：
//!
//! ```text
//! 仅字幕/仅封面:  fetch ──────────────────────────────> destination
//! 组合任务:       fetch(_v) ┐
//!                 fetch(_a) ┼─> (merge -> _m) ─> place -> destination
//!                 fetch(字幕, 失败可忽略) ┘
//! ```
//!
//! 每个阶段之间都检查取消；临时文件无论成功、失败还是取消都会被清理。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use super::aggregator::ProgressAggregator;
use super::context::{FetchHandle, FetchOutcome};
use super::control::TaskControl;
use super::engine::DownloadEngine;
use super::error::DownloadError;
use super::events::{DownloadEvent, EventListener};
use super::placement::{available_path, place_file, remove_quietly};
use super::task::{StreamRole, Task, TaskKind};
use crate::muxer::{MuxError, Muxer};

/// 组合任务中一路流的抓取描述，编排开始时一次性构造
#[derive(Debug, Clone)]
struct RoleFetch {
    role: StreamRole,
    url: String,
    /// 临时文件（字幕为最终输出文件）
    target: PathBuf,
}

/// 组合任务用到的全部路径
#[derive(Debug, Clone)]
struct CombinedPlan {
    media: Vec<RoleFetch>,
    subtitle: Option<RoleFetch>,
    merged: PathBuf,
    video_size: Option<u64>,
    audio_size: Option<u64>,
}

impl CombinedPlan {
    fn urls(&self) -> Vec<String> {
        self.media
            .iter()
            .chain(self.subtitle.iter())
            .map(|fetch| fetch.url.clone())
            .collect()
    }
}

/// 已启动的抓取句柄，与 [`CombinedPlan`] 中的顺序一致
struct StartedFetches {
    media: Vec<(StreamRole, FetchHandle)>,
    subtitle: Option<FetchHandle>,
}

type LeaseTable = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// 流 URL 的租约表
///
/// 引擎对同一 URL 的新抓取会取消旧抓取；任务在抓取前先拿到自己全部 URL 的租约，
/// 共享 URL 的任务因此排队执行，不会互相抢占
#[derive(Default)]
struct StreamLeases {
    locks: LeaseTable,
}

impl StreamLeases {
    /// 按字典序依次加锁，两个任务交叉共享 URL 时也不会死锁
    async fn acquire(&self, mut urls: Vec<String>) -> StreamLease {
        urls.sort();
        urls.dedup();

        let mut lease = StreamLease {
            locks: self.locks.clone(),
            urls: urls.clone(),
            guards: Vec::with_capacity(urls.len()),
        };
        for url in urls {
            let lock = self.locks.entry(url.clone()).or_default().value().clone();
            let guard = match lock.clone().try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => {
                    info!("URL 正被其他任务使用，排队等待: {}", url);
                    lock.lock_owned().await
                }
            };
            lease.guards.push(guard);
        }
        lease
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

/// 一个任务持有的全部 URL 租约，释放时回收无人使用的锁
struct StreamLease {
    locks: LeaseTable,
    urls: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.guards.clear();
        for url in &self.urls {
            self.locks
                .remove_if(url, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

/// 任务编排器
pub struct TaskOrchestrator {
    engine: Arc<DownloadEngine>,
    muxer: Arc<dyn Muxer>,
    scratch_dir: PathBuf,
    leases: StreamLeases,
}

impl TaskOrchestrator {
    pub fn new(engine: Arc<DownloadEngine>, muxer: Arc<dyn Muxer>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            muxer,
            scratch_dir: scratch_dir.into(),
            leases: StreamLeases::default(),
        }
    }

    pub fn engine(&self) -> &Arc<DownloadEngine> {
        &self.engine
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// 执行一个任务，结果通过 `control` 送达
    pub async fn run(&self, task: &Task, control: Arc<TaskControl>) {
        if control.is_cancelled() {
            return;
        }

        match task.kind() {
            Some(TaskKind::SingleFile(role)) => self.run_single(task, role, &control).await,
            Some(TaskKind::Combined) => self.run_combined(task, &control).await,
            None => {
                control.fail(DownloadError::EmptyTask);
            }
        }
    }

    /// 仅字幕或仅封面：直接抓取到目标位置
    pub(crate) async fn run_single(&self, task: &Task, role: StreamRole, control: &Arc<TaskControl>) {
        let Some(stream) = task.stream(role) else {
            control.fail(DownloadError::EmptyTask);
            return;
        };
        let Some(_lease) = self.lease(control, vec![stream.url.clone()]).await else {
            return;
        };

        let target = available_path(&task.destination);
        info!(
            "任务 {} 开始单文件下载: role={:?}, 目标={:?}",
            control.task_id(),
            role,
            target
        );

        let handle = self.fetch(
            task,
            &stream.url,
            &target,
            Some(passthrough_listener(control.clone())),
        );

        let outcome = tokio::select! {
            outcome = handle.wait() => outcome,
            _ = control.cancelled() => {
                self.discard(&stream.url, &handle, &target).await;
                return;
            }
        };

        match outcome {
            FetchOutcome::Completed(path) => {
                if control.complete(path.clone()) {
                    info!("✓ 任务 {} 完成: {:?}", control.task_id(), path);
                }
            }
            FetchOutcome::Failed(e) => {
                error!("任务 {} 下载失败: {}", control.task_id(), e);
                self.discard(&stream.url, &handle, &target).await;
                control.fail(e);
            }
            FetchOutcome::Cancelled => {
                warn!("任务 {} 的抓取被外部取消", control.task_id());
                self.discard(&stream.url, &handle, &target).await;
                control.fail(DownloadError::Aborted);
            }
        }
    }

    pub(crate) async fn run_combined(&self, task: &Task, control: &Arc<TaskControl>) {
        if let Err(e) = tokio::fs::create_dir_all(&self.scratch_dir).await {
            control.fail(DownloadError::storage("创建临时目录失败", e));
            return;
        }

        let plan = self.plan_combined(task);
        let Some(_lease) = self.lease(control, plan.urls()).await else {
            return;
        };
        info!(
            "任务 {} 开始组合下载: 流={:?}, 字幕={}, 目标={:?}",
            control.task_id(),
            plan.media.iter().map(|f| f.role).collect::<Vec<_>>(),
            plan.subtitle.is_some(),
            task.destination
        );

        let fetches = self.start_fetches(task, &plan, control);
        let result = self.combined_pipeline(task, &plan, &fetches, control).await;
        self.cleanup(&plan, &fetches).await;

        match result {
            Ok(Some(path)) => {
                if control.complete(path.clone()) {
                    info!("✓ 任务 {} 完成: {:?}", control.task_id(), path);
                }
            }
            Ok(None) => info!("任务 {} 已取消，临时文件已清理", control.task_id()),
            Err(e) => {
                error!("任务 {} 失败: {}", control.task_id(), e);
                control.fail(e);
            }
        }
    }

    /// 等待任务用到的 URL 全部空闲；等待期间任务被取消时返回 None
    async fn lease(&self, control: &TaskControl, urls: Vec<String>) -> Option<StreamLease> {
        tokio::select! {
            lease = self.leases.acquire(urls) => Some(lease),
            _ = control.cancelled() => {
                debug!("任务 {} 在等待 URL 时被取消", control.task_id());
                None
            }
        }
    }

    /// 任务带线程数时使用独立的并发上限，其余任务共享引擎线程池
    fn fetch(
        &self,
        task: &Task,
        url: &str,
        target: &Path,
        listener: Option<Arc<dyn EventListener>>,
    ) -> FetchHandle {
        match task.thread_count {
            0 => self.engine.fetch(url, target, listener),
            threads => self.engine.fetch_with_threads(url, target, threads, listener),
        }
    }

    /// 放弃一次没有完成的抓取：停止它、删除残留文件和已经无用的位图
    async fn discard(&self, url: &str, handle: &FetchHandle, target: &Path) {
        if !self.engine.cancel_handle(handle) {
            self.engine.discard_progress(url);
        }
        handle.settled().await;
        remove_quietly(target).await;
    }

    fn plan_combined(&self, task: &Task) -> CombinedPlan {
        let root = task.file_name_root();
        let temp_path = |suffix: &str| self.scratch_dir.join(format!("{}{}.tmp", root, suffix));

        let media = [StreamRole::Video, StreamRole::Audio]
            .into_iter()
            .filter_map(|role| {
                task.stream(role).map(|stream| RoleFetch {
                    role,
                    url: stream.url.clone(),
                    target: temp_path(role.temp_suffix()),
                })
            })
            .collect();

        let subtitle = task
            .subtitle
            .as_ref()
            .zip(task.subtitle_destination())
            .map(|(stream, destination)| RoleFetch {
                role: StreamRole::Subtitle,
                url: stream.url.clone(),
                target: available_path(&destination),
            });

        CombinedPlan {
            media,
            subtitle,
            merged: temp_path("_m"),
            video_size: task.video.as_ref().and_then(|s| s.content_length),
            audio_size: task.audio.as_ref().and_then(|s| s.content_length),
        }
    }

    /// 同时启动视频、音频和字幕的抓取
    fn start_fetches(&self, task: &Task, plan: &CombinedPlan, control: &Arc<TaskControl>) -> StartedFetches {
        let aggregator = Arc::new(ProgressAggregator::new(plan.video_size, plan.audio_size));
        let single_stream = plan.media.len() == 1;

        let media = plan
            .media
            .iter()
            .map(|fetch| {
                let listener = if single_stream {
                    passthrough_listener(control.clone())
                } else {
                    aggregated_listener(control.clone(), aggregator.clone(), fetch.role)
                };
                let handle = self.fetch(task, &fetch.url, &fetch.target, Some(listener));
                (fetch.role, handle)
            })
            .collect();

        let subtitle = plan
            .subtitle
            .as_ref()
            .map(|fetch| self.fetch(task, &fetch.url, &fetch.target, None));

        StartedFetches { media, subtitle }
    }

    /// 返回 Ok(None) 表示任务在中途被取消
    async fn combined_pipeline(
        &self,
        task: &Task,
        plan: &CombinedPlan,
        fetches: &StartedFetches,
        control: &Arc<TaskControl>,
    ) -> Result<Option<PathBuf>, DownloadError> {
        // 1. 等待视频/音频抓取
        let waits = fetches.media.iter().map(|(role, handle)| async move {
            match handle.wait().await {
                FetchOutcome::Completed(path) => Ok((*role, path)),
                FetchOutcome::Failed(e) => Err(e),
                FetchOutcome::Cancelled => Err(DownloadError::Aborted),
            }
        });

        let finished = tokio::select! {
            result = futures::future::try_join_all(waits) => result,
            _ = control.cancelled() => return Ok(None),
        };
        let finished = match finished {
            Ok(finished) => finished,
            Err(_) if control.is_cancelled() => return Ok(None),
            Err(e) => return Err(e),
        };

        // 字幕失败不影响合并
        if let (Some(handle), Some(fetch)) = (&fetches.subtitle, &plan.subtitle) {
            let outcome = tokio::select! {
                outcome = handle.wait() => outcome,
                _ = control.cancelled() => return Ok(None),
            };
            match outcome {
                FetchOutcome::Completed(path) => info!("字幕已保存: {:?}", path),
                FetchOutcome::Failed(e) => {
                    warn!("⚠️ 字幕下载失败，忽略: {}", e);
                    self.discard(&fetch.url, handle, &fetch.target).await;
                }
                FetchOutcome::Cancelled => {}
            }
        }

        if control.is_cancelled() {
            return Ok(None);
        }

        // 2. 合并（仅当视频和音频都存在）
        let output = match finished.as_slice() {
            [(_, only)] => only.clone(),
            _ => {
                let video = stream_path(&finished, StreamRole::Video)?;
                let audio = stream_path(&finished, StreamRole::Audio)?;

                control.merge();
                info!("任务 {} 开始合并音视频", control.task_id());
                self.merge(video, audio, plan.merged.clone()).await?;
                plan.merged.clone()
            }
        };

        if control.is_cancelled() {
            return Ok(None);
        }

        // 3. 放到目标位置
        let placed = place_file(&output, &task.destination).await?;
        Ok(Some(placed))
    }

    async fn merge(&self, video: PathBuf, audio: PathBuf, output: PathBuf) -> Result<(), DownloadError> {
        let muxer = self.muxer.clone();
        tokio::task::spawn_blocking(move || muxer.merge(&video, &audio, &output))
            .await
            .map_err(|e| MuxError::Container(format!("合并线程异常: {}", e)))??;
        Ok(())
    }

    /// 清理临时文件，只停止本任务自己发起的抓取
    async fn cleanup(&self, plan: &CombinedPlan, fetches: &StartedFetches) {
        for (fetch, (_, handle)) in plan.media.iter().zip(&fetches.media) {
            self.discard(&fetch.url, handle, &fetch.target).await;
        }
        remove_quietly(&plan.merged).await;

        if let (Some(subtitle), Some(handle)) = (&plan.subtitle, &fetches.subtitle) {
            // 没有完成的字幕只会留下半个文件
            if !matches!(handle.outcome(), Some(FetchOutcome::Completed(_))) {
                self.discard(&subtitle.url, handle, &subtitle.target).await;
            }
        }
    }
}

fn stream_path(finished: &[(StreamRole, PathBuf)], role: StreamRole) -> Result<PathBuf, DownloadError> {
    finished
        .iter()
        .find(|(r, _)| *r == role)
        .map(|(_, path)| path.clone())
        .ok_or(DownloadError::Muxing(MuxError::EmptyTrack))
}

/// 只转发进度，终结事件由编排器根据抓取结果自行送达
fn passthrough_listener(control: Arc<TaskControl>) -> Arc<dyn EventListener> {
    Arc::new(move |event: DownloadEvent| {
        if let DownloadEvent::Progress {
            percent,
            downloaded,
            total,
        } = event
        {
            control.progress(percent, downloaded, total);
        }
    })
}

fn aggregated_listener(
    control: Arc<TaskControl>,
    aggregator: Arc<ProgressAggregator>,
    role: StreamRole,
) -> Arc<dyn EventListener> {
    Arc::new(move |event: DownloadEvent| {
        if let DownloadEvent::Progress { percent, .. } = event {
            let combined = aggregator.update(role, percent);
            control.progress(combined.percent, combined.downloaded, combined.total);
        }
    })
}
