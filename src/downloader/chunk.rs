use bit_set::BitSet;
use std::ops::Range;
use tracing::debug;

/// 单个分片的最小目标大小: 512KB
pub const MIN_CHUNK_SIZE: u64 = 512 * 1024;
/// 可分片下载时的最少分片数
pub const MIN_CHUNKS: u64 = 4;
/// 分片数上限
pub const MAX_CHUNKS: u64 = 128;

/// 分片信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围（左闭右开），总长度未知时为 None
    pub range: Option<Range<u64>>,
}

impl Chunk {
    /// 分片大小
    pub fn size(&self) -> Option<u64> {
        self.range.as_ref().map(|r| r.end - r.start)
    }

    /// 写入文件的起始偏移
    pub fn start(&self) -> u64 {
        self.range.as_ref().map(|r| r.start).unwrap_or(0)
    }
}

/// 分片计划
///
/// 在每次抓取开始时根据探测结果生成，分片范围恰好覆盖 `[0, total)`。
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    total: Option<u64>,
    ranged: bool,
    chunks: Vec<Chunk>,
}

impl ChunkPlan {
    /// 根据资源总长度和是否支持 Range 请求生成分片计划
    pub fn new(total: Option<u64>, accepts_ranges: bool) -> Self {
        let total = total.filter(|t| *t > 0);
        let ranged = accepts_ranges && total.is_some();

        let chunks = match total {
            Some(total) if ranged => Self::calculate_chunks(total),
            Some(total) => vec![Chunk {
                index: 0,
                range: Some(0..total),
            }],
            None => vec![Chunk {
                index: 0,
                range: None,
            }],
        };

        debug!(
            "生成分片计划: 总大小={:?}, 支持Range={}, 分片数量={}",
            total,
            ranged,
            chunks.len()
        );

        Self {
            total,
            ranged,
            chunks,
        }
    }

    /// 计算分片数量
    pub fn chunk_count_for(total: u64) -> u64 {
        let count = (total / MIN_CHUNK_SIZE).clamp(MIN_CHUNKS, MAX_CHUNKS);
        if total / count == 0 {
            1
        } else {
            count
        }
    }

    fn calculate_chunks(total: u64) -> Vec<Chunk> {
        let count = Self::chunk_count_for(total);
        let part = total / count;

        (0..count)
            .map(|i| {
                let start = i * part;
                let end = if i == count - 1 { total } else { start + part };
                Chunk {
                    index: i as usize,
                    range: Some(start..end),
                }
            })
            .collect()
    }

    /// 资源总长度（未知时为 None）
    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// 是否按 Range 分片请求（只有这种计划才会持久化完成位图）
    pub fn is_ranged(&self) -> bool {
        self.ranged
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// 位图是否与当前计划匹配（不能包含越界的分片索引）
    pub fn accepts_bitmap(&self, completed: &BitSet) -> bool {
        completed.iter().all(|i| i < self.chunks.len())
    }

    /// 尚未完成的分片
    pub fn pending<'a>(&'a self, completed: &'a BitSet) -> impl Iterator<Item = &'a Chunk> + 'a {
        self.chunks.iter().filter(move |c| !completed.contains(c.index))
    }

    /// 已完成分片的总字节数
    pub fn completed_bytes(&self, completed: &BitSet) -> u64 {
        self.chunks
            .iter()
            .filter(|c| completed.contains(c.index))
            .filter_map(Chunk::size)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_unknown_length_single_chunk() {
        let plan = ChunkPlan::new(None, true);
        assert_eq!(plan.chunk_count(), 1);
        assert!(!plan.is_ranged());
        assert_eq!(plan.chunks()[0].range, None);
        assert_eq!(plan.chunks()[0].start(), 0);
    }

    #[test]
    fn test_no_range_support_single_chunk() {
        let plan = ChunkPlan::new(Some(10 * 1024 * 1024), false);
        assert_eq!(plan.chunk_count(), 1);
        assert!(!plan.is_ranged());
        assert_eq!(plan.chunks()[0].range, Some(0..10 * 1024 * 1024));
    }

    #[test]
    fn test_chunk_calculation() {
        // 小文件仍然切成 4 片
        let plan = ChunkPlan::new(Some(1000), true);
        assert_eq!(plan.chunk_count(), 4);
        assert_eq!(plan.chunks()[0].range, Some(0..250));
        assert_eq!(plan.chunks()[3].range, Some(750..1000));

        // 10MB -> 20 片
        let plan = ChunkPlan::new(Some(10 * 1024 * 1024), true);
        assert_eq!(plan.chunk_count(), 20);
        assert_eq!(plan.chunks()[0].size(), Some(MIN_CHUNK_SIZE));

        // 超大文件封顶 128 片，最后一片吸收余数
        let total = 1024 * 1024 * 1024 + 7;
        let plan = ChunkPlan::new(Some(total), true);
        assert_eq!(plan.chunk_count(), 128);
        let last = plan.chunks().last().unwrap();
        assert_eq!(last.range.as_ref().unwrap().end, total);
        assert_eq!(last.size(), Some(total / 128 + 7));
    }

    #[test]
    fn test_tiny_file_collapses() {
        let plan = ChunkPlan::new(Some(3), true);
        assert_eq!(plan.chunk_count(), 1);
        assert_eq!(plan.chunks()[0].range, Some(0..3));
    }

    #[test]
    fn test_completed_bytes_and_pending() {
        let plan = ChunkPlan::new(Some(1003), true);
        let mut done = BitSet::new();
        done.insert(1);
        done.insert(3);

        assert_eq!(plan.completed_bytes(&done), 250 + 253);
        let pending: Vec<usize> = plan.pending(&done).map(|c| c.index).collect();
        assert_eq!(pending, vec![0, 2]);
    }

    #[test]
    fn test_stale_bitmap_rejected() {
        let plan = ChunkPlan::new(Some(1000), true);
        let mut bits = BitSet::new();
        bits.insert(2);
        assert!(plan.accepts_bitmap(&bits));
        bits.insert(9);
        assert!(!plan.accepts_bitmap(&bits));
    }

    proptest! {
        #[test]
        fn prop_chunks_partition_total(total in 1u64..(8u64 << 30)) {
            let plan = ChunkPlan::new(Some(total), true);
            let count = plan.chunk_count() as u64;
            prop_assert!(count == 1 || (MIN_CHUNKS..=MAX_CHUNKS).contains(&count));

            let mut expected_start = 0;
            for (i, chunk) in plan.chunks().iter().enumerate() {
                let range = chunk.range.clone().unwrap();
                prop_assert_eq!(chunk.index, i);
                prop_assert_eq!(range.start, expected_start);
                prop_assert!(range.end > range.start);
                expected_start = range.end;
            }
            prop_assert_eq!(expected_start, total);
        }
    }
}
