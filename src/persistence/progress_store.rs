//! 断点续传进度存储
//!
//! 以资源指纹为键，保存"已完成分片位图"的原始字节。
//! 引擎只依赖 [`ProgressStore`] 这一层键值接口，底层可以是平面文件，
//! 也可以是内存表（测试使用）。
//!
//! ## 文件格式
//!
//! 每个指纹一个文件：`{progress_dir}/{fingerprint}.bits`，
//! 内容为 `BitVec::to_bytes()` 的结果（高位在前）。

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bit_set::BitSet;
use dashmap::DashMap;
use tracing::{debug, warn};

/// 位图文件扩展名
const BITMAP_EXTENSION: &str = "bits";

/// 进度键值存储
pub trait ProgressStore: Send + Sync {
    /// 读取指纹对应的位图字节，不存在时返回 None
    fn load(&self, key: &str) -> Option<Vec<u8>>;

    /// 写入（覆盖）位图字节
    fn save(&self, key: &str, value: &[u8]) -> io::Result<()>;

    /// 删除指纹对应的记录，记录不存在不视为错误
    fn remove(&self, key: &str) -> io::Result<()>;
}

/// 计算 URL 的资源指纹（跨进程稳定）
pub fn fingerprint(url: &str) -> String {
    format!("dl_{:x}", md5::compute(url.as_bytes()))
}

/// 位图序列化
pub fn encode_bitmap(bits: &BitSet) -> Vec<u8> {
    bits.get_ref().to_bytes()
}

/// 位图反序列化
pub fn decode_bitmap(bytes: &[u8]) -> BitSet {
    BitSet::from_bytes(bytes)
}

/// 平面文件实现
#[derive(Debug, Clone)]
pub struct FileProgressStore {
    dir: PathBuf,
}

impl FileProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, BITMAP_EXTENSION))
    }
}

impl ProgressStore for FileProgressStore {
    fn load(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("读取进度位图失败: {:?}, 错误: {}", path, e);
                None
            }
        }
    }

    fn save(&self, key: &str, value: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let path = self.path_for(key);
        // 先写临时文件再重命名，崩溃时不会留下半个位图
        let temp_path = path.with_extension("bits.tmp");

        let mut file = File::create(&temp_path)?;
        file.write_all(value)?;
        file.sync_data()?;
        drop(file);

        fs::rename(&temp_path, &path)?;
        debug!("已保存进度位图: {:?} ({} 字节)", path, value.len());
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => {
                debug!("已删除进度位图: {}", key);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// 内存实现，进程退出即丢失
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn load(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    fn save(&self, key: &str, value: &[u8]) -> io::Result<()> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fingerprint_is_stable() {
        let a = fingerprint("https://example.com/video.mp4");
        let b = fingerprint("https://example.com/video.mp4");
        let c = fingerprint("https://example.com/audio.m4a");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("dl_"));
        assert_eq!(a.len(), 3 + 32);
    }

    #[test]
    fn test_bitmap_codec_keeps_indices() {
        let mut bits = BitSet::new();
        for i in [0usize, 3, 9, 127] {
            bits.insert(i);
        }
        let decoded = decode_bitmap(&encode_bitmap(&bits));
        assert_eq!(decoded.iter().collect::<Vec<_>>(), vec![0, 3, 9, 127]);
        assert_eq!(decoded.len(), 4);
    }

    #[test]
    fn test_file_store_lifecycle() {
        let temp = TempDir::new().unwrap();
        let store = FileProgressStore::new(temp.path().join("progress"));

        assert!(store.load("dl_x").is_none());
        store.save("dl_x", &[0b1010_0000]).unwrap();
        assert_eq!(store.load("dl_x"), Some(vec![0b1010_0000]));

        // 覆盖写入
        store.save("dl_x", &[0xff, 0x01]).unwrap();
        assert_eq!(store.load("dl_x"), Some(vec![0xff, 0x01]));
        assert!(!temp.path().join("progress/dl_x.bits.tmp").exists());

        store.remove("dl_x").unwrap();
        assert!(store.load("dl_x").is_none());
        // 重复删除不报错
        store.remove("dl_x").unwrap();
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryProgressStore::new();
        store.save("k", &[1, 2, 3]).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.load("k"), Some(vec![1, 2, 3]));
        store.remove("k").unwrap();
        assert!(store.is_empty());
    }
}
