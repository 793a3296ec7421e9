use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;

use mp4::{
    AacConfig, AvcConfig, FourCC, HevcConfig, MediaConfig, MediaType, Mp4Config, Mp4Reader,
    Mp4Track, Mp4Writer, TrackConfig, TrackType, Vp9Config,
};
use tracing::{debug, info, warn};

use super::{MuxError, Muxer};

/// 基于 `mp4` crate 的 MP4 重新封装
#[derive(Debug, Clone, Default)]
pub struct Mp4Muxer;

impl Mp4Muxer {
    pub fn new() -> Self {
        Self
    }
}

/// 选中的输入轨道
struct SelectedTrack {
    track_id: u32,
    config: TrackConfig,
    sample_count: u32,
}

impl Muxer for Mp4Muxer {
    fn merge(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), MuxError> {
        let mut video_reader = open_reader(video)?;
        let mut audio_reader = open_reader(audio)?;

        // 先选轨，选不到就直接返回，不创建输出文件
        let video_track = select_track(&video_reader, TrackType::Video)?;
        let audio_track = select_track(&audio_reader, TrackType::Audio)?;

        debug!(
            "合并选轨: 视频轨 #{} ({} 帧), 音频轨 #{} ({} 帧)",
            video_track.track_id,
            video_track.sample_count,
            audio_track.track_id,
            audio_track.sample_count
        );

        let file = File::create(output)?;
        let result = write_output(
            BufWriter::new(file),
            (&mut video_reader, &video_track),
            (&mut audio_reader, &audio_track),
        );

        if let Err(e) = &result {
            warn!("合并失败，删除不完整的输出: {:?}, 错误: {}", output, e);
            let _ = fs::remove_file(output);
        } else {
            info!("✓ 音视频合并完成: {:?}", output);
        }
        result
    }
}

fn open_reader(path: &Path) -> Result<Mp4Reader<BufReader<File>>, MuxError> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    Ok(Mp4Reader::read_header(BufReader::new(file), size)?)
}

/// 按轨道 ID 顺序取第一条指定类型的轨道
fn select_track<R: Read + Seek>(
    reader: &Mp4Reader<R>,
    kind: TrackType,
) -> Result<SelectedTrack, MuxError> {
    let mut tracks: Vec<&Mp4Track> = reader
        .tracks()
        .values()
        .filter(|track| track.track_type().map(|t| t == kind).unwrap_or(false))
        .collect();
    tracks.sort_by_key(|track| track.track_id());

    let track = tracks.first().ok_or(MuxError::EmptyTrack)?;
    Ok(SelectedTrack {
        track_id: track.track_id(),
        config: track_config(track)?,
        sample_count: track.sample_count(),
    })
}

fn track_config(track: &Mp4Track) -> Result<TrackConfig, MuxError> {
    let media_conf = match track.media_type()? {
        MediaType::H264 => MediaConfig::AvcConfig(AvcConfig {
            width: track.width(),
            height: track.height(),
            seq_param_set: track.sequence_parameter_set()?.to_vec(),
            pic_param_set: track.picture_parameter_set()?.to_vec(),
        }),
        MediaType::H265 => MediaConfig::HevcConfig(HevcConfig {
            width: track.width(),
            height: track.height(),
        }),
        MediaType::VP9 => MediaConfig::Vp9Config(Vp9Config {
            width: track.width(),
            height: track.height(),
        }),
        MediaType::AAC => MediaConfig::AacConfig(AacConfig {
            bitrate: track.bitrate(),
            profile: track.audio_profile()?,
            freq_index: track.sample_freq_index()?,
            chan_conf: track.channel_config()?,
        }),
        other => return Err(MuxError::UnsupportedCodec(format!("{:?}", other))),
    };

    Ok(TrackConfig {
        track_type: track.track_type()?,
        timescale: track.timescale(),
        language: track.language().to_string(),
        media_conf,
    })
}

fn write_output<W, R1, R2>(
    writer: W,
    video: (&mut Mp4Reader<R1>, &SelectedTrack),
    audio: (&mut Mp4Reader<R2>, &SelectedTrack),
) -> Result<(), MuxError>
where
    W: Write + Seek,
    R1: Read + Seek,
    R2: Read + Seek,
{
    let brands = ["isom", "iso2", "avc1", "mp41"]
        .iter()
        .map(|b| b.parse::<FourCC>())
        .collect::<Result<Vec<_>, _>>()?;
    let config = Mp4Config {
        major_brand: "isom".parse()?,
        minor_version: 512,
        compatible_brands: brands,
        timescale: 1000,
    };

    let mut writer = Mp4Writer::write_start(writer, &config)?;
    // 输出文件中视频轨 ID 为 1，音频轨 ID 为 2
    writer.add_track(&video.1.config)?;
    writer.add_track(&audio.1.config)?;

    copy_samples(video.0, video.1, &mut writer, 1)?;
    copy_samples(audio.0, audio.1, &mut writer, 2)?;

    writer.write_end()?;
    writer.into_writer().flush()?;
    Ok(())
}

fn copy_samples<R, W>(
    reader: &mut Mp4Reader<R>,
    track: &SelectedTrack,
    writer: &mut Mp4Writer<W>,
    output_track_id: u32,
) -> Result<(), MuxError>
where
    R: Read + Seek,
    W: Write + Seek,
{
    // 样本 ID 从 1 开始
    for sample_id in 1..=track.sample_count {
        if let Some(sample) = reader.read_sample(track.track_id, sample_id)? {
            writer.write_sample(output_track_id, &sample)?;
        }
    }
    Ok(())
}
