use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::control::TaskControl;
use super::engine::DownloadEngine;
use super::error::DownloadError;
use super::events::{DownloadEvent, EventListener};
use super::http::ReqwestFetcher;
use super::orchestrator::TaskOrchestrator;
use super::task::{DownloaderState, Task, TaskKind};
use crate::config::AppConfig;
use crate::muxer::Mp4Muxer;
use crate::persistence::{DownloadHistory, DownloadRecord, FileProgressStore, RecordStatus};

/// 注册表中的一条任务
#[derive(Clone)]
struct TaskEntry {
    task: Arc<Task>,
    state: DownloaderState,
    /// 启动后才有
    control: Option<Arc<TaskControl>>,
}

/// 任务快照（对外只读）
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: u64,
    pub task: Arc<Task>,
    pub state: DownloaderState,
}

/// 任务注册表
///
/// 负责分配任务 ID、登记任务、派发到后台执行、取消。
/// 任务到达终结状态后自动从注册表移除。
pub struct TaskRegistry {
    next_id: AtomicU64,
    tasks: Arc<DashMap<u64, TaskEntry>>,
    /// 同时运行的任务数上限
    dispatch: Arc<Semaphore>,
    orchestrator: Arc<TaskOrchestrator>,
    history: Option<Arc<DownloadHistory>>,
    download_dir: PathBuf,
}

impl TaskRegistry {
    /// `max_concurrent_tasks` 为 0 时按 CPU 核数
    pub fn new(
        orchestrator: Arc<TaskOrchestrator>,
        download_dir: impl Into<PathBuf>,
        max_concurrent_tasks: usize,
    ) -> Self {
        let workers = if max_concurrent_tasks > 0 {
            max_concurrent_tasks
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        };
        info!("任务注册表初始化: 最大同时任务数={}", workers);

        Self {
            next_id: AtomicU64::new(1),
            tasks: Arc::new(DashMap::new()),
            dispatch: Arc::new(Semaphore::new(workers)),
            orchestrator,
            history: None,
            download_dir: download_dir.into(),
        }
    }

    /// 启用下载历史
    pub fn with_history(mut self, history: Arc<DownloadHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// 按配置装配完整的下载栈
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let fetcher = Arc::new(ReqwestFetcher::new().context("创建 HTTP 客户端失败")?);
        let store = Arc::new(FileProgressStore::new(&config.persistence.progress_dir));
        let engine = Arc::new(DownloadEngine::new(
            fetcher,
            store,
            config.download.default_thread_count,
        ));
        let orchestrator = Arc::new(TaskOrchestrator::new(
            engine,
            Arc::new(Mp4Muxer::new()),
            &config.download.scratch_dir,
        ));

        let registry = Self::new(
            orchestrator,
            &config.download.download_dir,
            config.download.max_concurrent_tasks,
        );
        if config.persistence.history_enabled {
            let history = DownloadHistory::open(&config.persistence.history_file);
            return Ok(registry.with_history(Arc::new(history)));
        }
        Ok(registry)
    }

    pub fn orchestrator(&self) -> &Arc<TaskOrchestrator> {
        &self.orchestrator
    }

    pub fn history(&self) -> Option<&Arc<DownloadHistory>> {
        self.history.as_ref()
    }

    /// 分配一个新的任务 ID，从 1 开始单调递增
    pub fn generate_task_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// 登记任务（不启动），同 ID 的旧任务被替换
    pub fn add_task(&self, id: u64, task: Task) {
        let entry = TaskEntry {
            task: Arc::new(task),
            state: DownloaderState::Pending,
            control: None,
        };
        if self.tasks.insert(id, entry).is_some() {
            warn!("任务 {} 已存在，覆盖旧记录", id);
        }
    }

    pub fn get_task(&self, id: u64) -> Option<TaskSnapshot> {
        self.tasks.get(&id).map(|entry| TaskSnapshot {
            id,
            task: entry.task.clone(),
            state: entry.state,
        })
    }

    pub fn task_state(&self, id: u64) -> Option<DownloaderState> {
        self.tasks.get(&id).map(|entry| entry.state)
    }

    /// 从注册表移除，不会停止正在运行的任务
    pub fn remove_task(&self, id: u64) -> Option<TaskSnapshot> {
        self.tasks.remove(&id).map(|(id, entry)| TaskSnapshot {
            id,
            task: entry.task,
            state: entry.state,
        })
    }

    /// 当前登记中的任务 ID（升序）
    pub fn active_task_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.tasks.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// 启动任务
    ///
    /// 立即返回；任务在后台执行，进度和结果通过 `listener` 送达。
    /// 任务不含任何流时直接返回 [`DownloadError::EmptyTask`]，不会登记。
    pub fn start_task(
        &self,
        id: u64,
        task: Task,
        listener: Arc<dyn EventListener>,
    ) -> Result<(), DownloadError> {
        let kind = task.kind().ok_or(DownloadError::EmptyTask)?;
        let task = Arc::new(task);

        let progress = Arc::new(AtomicU8::new(0));
        let tracked: Arc<dyn EventListener> = Arc::new(RegistryListener {
            task_id: id,
            tasks: self.tasks.clone(),
            history: self.history.clone(),
            progress,
            inner: listener,
        });
        let control = Arc::new(TaskControl::new(id, tracked));

        self.tasks.insert(
            id,
            TaskEntry {
                task: task.clone(),
                state: DownloaderState::Pending,
                control: Some(control.clone()),
            },
        );

        if let Some(history) = &self.history {
            if let Err(e) = history.upsert(DownloadRecord::new(id, task.file_name())) {
                warn!("写入下载历史失败: task={}, 错误: {}", id, e);
            }
        }

        info!("任务 {} 已登记: {:?} -> {:?}", id, kind, task.destination);

        let tasks = self.tasks.clone();
        let dispatch = self.dispatch.clone();
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let _permit = match dispatch.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("派发队列已关闭，任务 {} 未执行", id);
                    control.cancel();
                    return;
                }
            };
            if control.is_cancelled() {
                return;
            }

            if let Some(mut entry) = tasks.get_mut(&id) {
                entry.state.advance(DownloaderState::Running);
            }
            debug!("任务 {} 开始执行: {:?}", id, kind);

            match kind {
                TaskKind::SingleFile(role) => orchestrator.run_single(&task, role, &control).await,
                TaskKind::Combined => orchestrator.run_combined(&task, &control).await,
            }
        });

        Ok(())
    }

    /// 取消任务，返回是否找到了正在运行的任务
    pub fn cancel_task(&self, id: u64) -> bool {
        // 先取出 control 再取消：取消回调会移除注册表条目
        let control = self.tasks.get(&id).and_then(|entry| entry.control.clone());
        match control {
            Some(control) => {
                info!("取消任务: {}", id);
                control.cancel();
                true
            }
            None => {
                debug!("取消任务 {} 失败: 未找到或尚未启动", id);
                false
            }
        }
    }

    /// 下载目录，不存在时创建
    pub fn download_directory(&self) -> Result<PathBuf, DownloadError> {
        ensure_dir(&self.download_dir)?;
        Ok(self.download_dir.clone())
    }

    /// 取消全部任务并停止派发
    pub fn shutdown(&self) {
        let ids = self.active_task_ids();
        info!("关闭任务注册表，取消 {} 个任务", ids.len());
        for id in ids {
            self.cancel_task(id);
        }
        self.dispatch.close();
    }
}

fn ensure_dir(dir: &Path) -> Result<(), DownloadError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| DownloadError::storage("创建下载目录失败", e))?;
        info!("✓ 下载目录已创建: {:?}", dir);
    }
    Ok(())
}

/// 事件驱动状态迁移，再转发给调用方
struct RegistryListener {
    task_id: u64,
    tasks: Arc<DashMap<u64, TaskEntry>>,
    history: Option<Arc<DownloadHistory>>,
    progress: Arc<AtomicU8>,
    inner: Arc<dyn EventListener>,
}

impl RegistryListener {
    fn apply(&self, next: DownloaderState) {
        if next.is_terminal() {
            if self.tasks.remove(&self.task_id).is_some() {
                debug!("任务 {} 进入 {:?}，已移出注册表", self.task_id, next);
            }
            return;
        }
        if let Some(mut entry) = self.tasks.get_mut(&self.task_id) {
            entry.state.advance(next);
        }
    }

    /// 事件在 [`TaskControl`] 的锁内送达，这里只改内存，写盘交给阻塞线程池
    fn record(&self, event: &DownloadEvent) {
        let Some(history) = &self.history else {
            return;
        };
        let progress = self.progress.load(Ordering::SeqCst);
        let changed = match event {
            DownloadEvent::Progress { .. } => return,
            DownloadEvent::Merge => history.modify(self.task_id, |r| {
                r.status = RecordStatus::Merging;
                r.progress = progress;
            }),
            DownloadEvent::Complete(path) => history.modify(self.task_id, |r| {
                r.status = RecordStatus::Completed;
                r.progress = 100;
                r.output_path = Some(path.clone());
            }),
            DownloadEvent::Error(e) => history.modify(self.task_id, |r| {
                r.status = RecordStatus::Failed;
                r.progress = progress;
                r.error_message = Some(e.to_string());
            }),
            DownloadEvent::Cancel => history.modify(self.task_id, |r| {
                r.status = RecordStatus::Cancelled;
                r.progress = progress;
            }),
        };
        if changed {
            flush_history(history.clone(), self.task_id);
        }
    }
}

fn flush_history(history: Arc<DownloadHistory>, task_id: u64) {
    let flush = move || {
        if let Err(e) = history.flush() {
            warn!("更新下载历史失败: task={}, 错误: {}", task_id, e);
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(flush);
        }
        // 不在运行时内（例如同步调用 cancel_task），直接写
        Err(_) => flush(),
    }
}

impl EventListener for RegistryListener {
    fn on_event(&self, event: DownloadEvent) {
        let next = match &event {
            DownloadEvent::Progress { percent, .. } => {
                self.progress.store(*percent, Ordering::SeqCst);
                DownloaderState::Downloading
            }
            DownloadEvent::Merge => DownloaderState::Merging,
            DownloadEvent::Complete(_) => DownloaderState::Finished,
            DownloadEvent::Error(_) => DownloaderState::Stopped,
            DownloadEvent::Cancel => DownloaderState::Cancelled,
        };
        self.apply(next);
        self.record(&event);
        self.inner.on_event(event);
    }
}
