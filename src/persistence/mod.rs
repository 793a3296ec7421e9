//! 持久化模块
//!
//! 该模块负责两类需要跨进程保留的数据：
//! - 断点续传位图：每个资源指纹一份"已完成分片"位图，暂停/重启后据此跳过已下载分片
//! - 下载历史：任务的最终结果记录
//!
//! ## 文件结构
//!
//! ```text
//! data/
//! ├── progress/
//! │   └── {fingerprint}.bits   # 完成位图（原始字节）
//! └── history.json             # 下载历史（JSON 数组）
//! ```
//!
//! 位图条目在抓取完成或显式取消时删除，暂停时保留。

pub mod history;
pub mod progress_store;

pub use history::{DownloadHistory, DownloadRecord, RecordStatus};
pub use progress_store::{
    decode_bitmap, encode_bitmap, fingerprint, FileProgressStore, MemoryProgressStore,
    ProgressStore,
};
