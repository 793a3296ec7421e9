use parking_lot::Mutex;

use super::task::StreamRole;

/// 聚合后的任务进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatedProgress {
    pub percent: u8,
    pub downloaded: u64,
    pub total: u64,
}

/// 视频 + 音频进度聚合器
///
/// 按两路流声明的大小加权；大小未知时按 1 计算，避免除零
#[derive(Debug)]
pub struct ProgressAggregator {
    video_size: u64,
    audio_size: u64,
    /// (视频百分比, 音频百分比)
    latest: Mutex<(u8, u8)>,
}

impl ProgressAggregator {
    pub fn new(video_size: Option<u64>, audio_size: Option<u64>) -> Self {
        Self {
            video_size: video_size.unwrap_or(0).max(1),
            audio_size: audio_size.unwrap_or(0).max(1),
            latest: Mutex::new((0, 0)),
        }
    }

    /// 记录某一路的最新百分比，返回聚合结果
    pub fn update(&self, role: StreamRole, percent: u8) -> AggregatedProgress {
        let percent = percent.min(100);
        let (video, audio) = {
            let mut latest = self.latest.lock();
            match role {
                StreamRole::Video => latest.0 = percent,
                StreamRole::Audio => latest.1 = percent,
                _ => {}
            }
            *latest
        };
        Self::combine(self.video_size, video, self.audio_size, audio)
    }

    /// 加权合并两路进度
    pub fn combine(video_size: u64, video_percent: u8, audio_size: u64, audio_percent: u8) -> AggregatedProgress {
        let video_size = video_size.max(1) as u128;
        let audio_size = audio_size.max(1) as u128;
        let total = video_size + audio_size;

        let weighted = video_percent as u128 * video_size + audio_percent as u128 * audio_size;
        let percent = (weighted / total) as u8;
        let downloaded = (weighted / 100) as u64;

        AggregatedProgress {
            percent,
            downloaded,
            total: total as u64,
        }
    }
}
