//! 下载历史模块
//!
//! 记录每个任务的最终结果，供界面层展示"下载记录"。
//!
//! ## 文件格式
//!
//! 单个 JSON 数组文件，每个元素是一条 [`DownloadRecord`]：
//! ```text
//! [{"task_id":1,"file_name":"movie.mp4","status":"completed",...}]
//! ```
//! 写入时先写 `.tmp` 再重命名，避免进程中断导致文件损坏。
//! 内存记录和磁盘文件分开加锁：[`DownloadHistory::modify`] 只改内存，
//! [`DownloadHistory::flush`] 串行地把最新快照写盘。

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// 历史记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Running,
    Merging,
    Completed,
    Failed,
    Cancelled,
}

impl RecordStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// 单条下载记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub task_id: u64,
    pub file_name: String,
    /// 最终输出路径（完成后才有）
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    pub status: RecordStatus,
    /// 0-100
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadRecord {
    pub fn new(task_id: u64, file_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            file_name: file_name.into(),
            output_path: None,
            status: RecordStatus::Running,
            progress: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 下载历史仓库
pub struct DownloadHistory {
    path: PathBuf,
    records: Mutex<Vec<DownloadRecord>>,
    /// 串行化写盘，多个 flush 不会同时写同一个临时文件
    write_lock: Mutex<()>,
}

impl DownloadHistory {
    /// 打开历史文件，文件不存在或损坏时从空记录开始
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<Vec<DownloadRecord>>(&bytes).unwrap_or_else(|e| {
                warn!("解析下载历史失败，将重新开始记录: {:?}, 错误: {}", path, e);
                Vec::new()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!("读取下载历史失败: {:?}, 错误: {}", path, e);
                Vec::new()
            }
        };

        debug!("已加载 {} 条下载历史: {:?}", records.len(), path);

        Self {
            path,
            records: Mutex::new(records),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 按创建时间倒序返回全部记录
    pub fn all_sorted(&self) -> Vec<DownloadRecord> {
        let mut records = self.records.lock().clone();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    pub fn find(&self, task_id: u64) -> Option<DownloadRecord> {
        self.records
            .lock()
            .iter()
            .find(|r| r.task_id == task_id)
            .cloned()
    }

    /// 插入或更新记录（按 task_id 匹配，保留原创建时间）
    pub fn upsert(&self, mut record: DownloadRecord) -> io::Result<()> {
        {
            let mut records = self.records.lock();
            record.updated_at = Utc::now();

            match records.iter_mut().find(|r| r.task_id == record.task_id) {
                Some(existing) => {
                    record.created_at = existing.created_at;
                    *existing = record;
                }
                None => records.push(record),
            }
        }
        self.flush()
    }

    /// 原地修改一条记录并写盘，记录不存在时返回 Ok(false)
    pub fn update<F>(&self, task_id: u64, updater: F) -> io::Result<bool>
    where
        F: FnOnce(&mut DownloadRecord),
    {
        if !self.modify(task_id, updater) {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    /// 只修改内存中的记录，不写盘
    pub fn modify<F>(&self, task_id: u64, updater: F) -> bool
    where
        F: FnOnce(&mut DownloadRecord),
    {
        let mut records = self.records.lock();
        let Some(record) = records.iter_mut().find(|r| r.task_id == task_id) else {
            return false;
        };
        updater(record);
        record.updated_at = Utc::now();
        true
    }

    pub fn remove(&self, task_id: u64) -> io::Result<bool> {
        {
            let mut records = self.records.lock();
            let before = records.len();
            records.retain(|r| r.task_id != task_id);
            if records.len() == before {
                return Ok(false);
            }
        }
        self.flush()?;
        Ok(true)
    }

    pub fn clear(&self) -> io::Result<()> {
        self.records.lock().clear();
        self.flush()
    }

    /// 把当前内存快照写盘
    ///
    /// 快照在拿到写锁之后才取，最后一次 flush 写下的总是最新状态
    pub fn flush(&self) -> io::Result<()> {
        let _writing = self.write_lock.lock();
        let snapshot = self.records.lock().clone();
        self.persist(&snapshot)
    }

    fn persist(&self, records: &[DownloadRecord]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp_path = self.path.with_extension("json.tmp");
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        serde_json::to_writer(&mut writer, records)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, &self.path)
    }
}
