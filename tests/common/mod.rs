//! 集成测试公共工具：Range 感知的模拟服务器和 MP4 样本构造
#![allow(dead_code)]

use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use media_downloader_rust::{DownloadEvent, EventListener};
use mp4::{
    AacConfig, AudioObjectType, AvcConfig, ChannelConfig, MediaConfig, Mp4Config, Mp4Sample,
    Mp4Writer, SampleFreqIndex, TrackConfig, TrackType,
};
use wiremock::matchers::path;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// 按 Range 头返回对应片段的响应器，HEAD 只返回长度
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    accept_ranges: bool,
    delay: Option<Duration>,
    /// 起点不小于该偏移的 Range GET 延迟后返回 500
    fail_from: Option<usize>,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            accept_ranges: true,
            delay: None,
            fail_from: None,
        }
    }

    pub fn without_ranges(mut self) -> Self {
        self.accept_ranges = false;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_from(mut self, offset: usize) -> Self {
        self.fail_from = Some(offset);
        self
    }

    fn parse_range(&self, request: &Request) -> Option<(usize, usize)> {
        let value = request.headers.get("range")?.to_str().ok()?;
        let spec = value.strip_prefix("bytes=")?;
        let (start, end) = spec.split_once('-')?;
        let start: usize = start.parse().ok()?;
        let end: usize = if end.is_empty() {
            self.body.len() - 1
        } else {
            end.parse().ok()?
        };
        Some((start, end.min(self.body.len() - 1)))
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let template = if request.method.as_str() == "HEAD" {
            let mut template =
                ResponseTemplate::new(200).insert_header("content-length", self.body.len().to_string());
            if self.accept_ranges {
                template = template.insert_header("accept-ranges", "bytes");
            }
            template
        } else {
            match self.parse_range(request).filter(|_| self.accept_ranges) {
                // 让前面的分片先完成并写入位图
                Some((start, _)) if self.fail_from.is_some_and(|from| start >= from) => {
                    ResponseTemplate::new(500).set_delay(Duration::from_millis(300))
                }
                Some((start, end)) => ResponseTemplate::new(206)
                    .insert_header(
                        "content-range",
                        format!("bytes {}-{}/{}", start, end, self.body.len()),
                    )
                    .set_body_bytes(self.body[start..=end].to_vec()),
                None => ResponseTemplate::new(200).set_body_bytes(self.body.as_ref().clone()),
            }
        };

        match self.delay {
            Some(delay) => template.set_delay(delay),
            None => template,
        }
    }
}

/// 在 `route` 上挂载一个资源，返回完整 URL
pub async fn mount(server: &MockServer, route: &str, responder: RangeResponder) -> String {
    Mock::given(path(route))
        .respond_with(responder)
        .mount(server)
        .await;
    format!("{}{}", server.uri(), route)
}

/// 服务器收到的 GET 请求的 Range 起点
pub async fn requested_starts(server: &MockServer, route: &str) -> Vec<u64> {
    let requests = server.received_requests().await.unwrap_or_default();
    let mut starts: Vec<u64> = requests
        .iter()
        .filter(|r| r.method.as_str() == "GET" && r.url.path() == route)
        .filter_map(|r| {
            let value = r.headers.get("range")?.to_str().ok()?;
            value.strip_prefix("bytes=")?.split('-').next()?.parse().ok()
        })
        .collect();
    starts.sort_unstable();
    starts
}

/// 目录中的条目数，目录不存在时为 0
pub fn entry_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

pub fn sample_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// 记录全部事件的监听器
pub fn recorder() -> (Arc<dyn EventListener>, Arc<Mutex<Vec<DownloadEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let listener: Arc<dyn EventListener> =
        Arc::new(move |e: DownloadEvent| sink.lock().unwrap().push(e));
    (listener, events)
}

/// 等待直到出现终结事件
pub async fn wait_for_terminal(events: &Arc<Mutex<Vec<DownloadEvent>>>) {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if events.lock().unwrap().iter().any(|e| e.is_terminal()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("等待终结事件超时");
}

const SPS: [u8; 12] = [
    0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9, 0x40, 0x50, 0x05, 0xBB, 0x01, 0x10,
];
const PPS: [u8; 6] = [0x68, 0xEB, 0xE3, 0xCB, 0x22, 0xC0];

pub fn avc_track() -> TrackConfig {
    TrackConfig {
        track_type: TrackType::Video,
        timescale: 1000,
        language: "und".to_string(),
        media_conf: MediaConfig::AvcConfig(AvcConfig {
            width: 1280,
            height: 720,
            seq_param_set: SPS.to_vec(),
            pic_param_set: PPS.to_vec(),
        }),
    }
}

pub fn aac_track() -> TrackConfig {
    TrackConfig {
        track_type: TrackType::Audio,
        timescale: 48000,
        language: "und".to_string(),
        media_conf: MediaConfig::AacConfig(AacConfig {
            bitrate: 128_000,
            profile: AudioObjectType::AacLowComplexity,
            freq_index: SampleFreqIndex::Freq48000,
            chan_conf: ChannelConfig::Stereo,
        }),
    }
}

/// 构造一个只含给定轨道的 MP4 文件，每条轨道写 `samples` 个大小为 `sample_size` 的样本
pub fn build_mp4(tracks: &[TrackConfig], samples: u32, sample_size: usize) -> Vec<u8> {
    let config = Mp4Config {
        major_brand: "isom".parse().unwrap(),
        minor_version: 512,
        compatible_brands: vec!["isom".parse().unwrap(), "mp41".parse().unwrap()],
        timescale: 1000,
    };
    let mut writer = Mp4Writer::write_start(Cursor::new(Vec::new()), &config).unwrap();
    for track in tracks {
        writer.add_track(track).unwrap();
    }

    for (index, track) in tracks.iter().enumerate() {
        let duration = track.timescale / 25;
        for i in 0..samples {
            let sample = Mp4Sample {
                start_time: u64::from(i * duration),
                duration,
                rendering_offset: 0,
                is_sync: i == 0,
                bytes: Bytes::from(vec![(i % 255) as u8; sample_size]),
            };
            writer.write_sample(index as u32 + 1, &sample).unwrap();
        }
    }

    writer.write_end().unwrap();
    writer.into_writer().into_inner()
}

pub fn write_file(path: &Path, data: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, data).unwrap();
}
