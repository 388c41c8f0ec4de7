//! Normalized technical metadata
//!
//! [`MediaInfo`] is what callers get back from a probe. Turning the raw
//! prober document into it is the job of a [`ProbeNormalizer`]; the crate ships
//! [`DefaultNormalizer`] but callers with their own library model can plug in
//! another one.

use crate::args::MediaProtocol;
use crate::probe::{MediaInfoRequest, ProbeChapter, ProbeResult, ProbeStream};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaStreamType {
    Audio,
    Video,
    Subtitle,
    EmbeddedImage,
    Data,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaStream {
    pub index: i32,
    pub stream_type: Option<MediaStreamType>,
    pub codec: Option<String>,
    pub profile: Option<String>,
    pub language: Option<String>,
    pub title: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub aspect_ratio: Option<String>,
    pub is_interlaced: bool,
    pub is_anamorphic: Option<bool>,
    pub average_frame_rate: Option<f32>,
    pub real_frame_rate: Option<f32>,
    pub level: Option<f64>,
    pub pixel_format: Option<String>,
    pub bit_depth: Option<i32>,
    pub bit_rate: Option<i64>,
    pub channels: Option<i32>,
    pub channel_layout: Option<String>,
    pub sample_rate: Option<i32>,
    pub ref_frames: Option<i32>,
    pub is_avc: Option<bool>,
    pub is_default: bool,
    pub is_forced: bool,
    /// Keyframe offsets in milliseconds, attached after the probe when analysed
    pub key_frames: Option<Vec<u64>>,
}

impl MediaStream {
    pub fn is_video(&self) -> bool {
        self.stream_type == Some(MediaStreamType::Video)
    }

    pub fn is_audio(&self) -> bool {
        self.stream_type == Some(MediaStreamType::Audio)
    }

    pub fn codec_is(&self, codec: &str) -> bool {
        self.codec
            .as_deref()
            .map(|c| c.eq_ignore_ascii_case(codec))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterInfo {
    pub start_ms: u64,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    pub path: String,
    pub protocol: MediaProtocol,
    pub container: Option<String>,
    pub duration_ms: Option<u64>,
    pub size: Option<u64>,
    pub bit_rate: Option<i64>,
    pub streams: Vec<MediaStream>,
    pub chapters: Vec<ChapterInfo>,
}

impl MediaInfo {
    pub fn video_streams(&self) -> impl Iterator<Item = &MediaStream> {
        self.streams.iter().filter(|s| s.is_video())
    }

    pub fn audio_streams(&self) -> impl Iterator<Item = &MediaStream> {
        self.streams.iter().filter(|s| s.is_audio())
    }
}

/// Converts a raw probe document into [`MediaInfo`]
pub trait ProbeNormalizer: Send + Sync {
    fn normalize(&self, result: ProbeResult, request: &MediaInfoRequest) -> MediaInfo;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultNormalizer;

impl ProbeNormalizer for DefaultNormalizer {
    fn normalize(&self, result: ProbeResult, request: &MediaInfoRequest) -> MediaInfo {
        let format = result.format.unwrap_or_default();

        let duration_ms = parse_seconds_ms(format.duration.as_deref()).or_else(|| {
            result
                .streams
                .iter()
                .find_map(|s| parse_seconds_ms(s.duration.as_deref()))
        });

        MediaInfo {
            path: request.input.path.clone(),
            protocol: request.input.protocol,
            container: format.format_name.filter(|name| !name.is_empty()),
            duration_ms,
            size: format.size.as_deref().and_then(|s| s.parse().ok()),
            bit_rate: format.bit_rate.as_deref().and_then(|s| s.parse().ok()),
            streams: result.streams.into_iter().map(normalize_stream).collect(),
            chapters: result.chapters.into_iter().filter_map(normalize_chapter).collect(),
        }
    }
}

fn normalize_stream(stream: ProbeStream) -> MediaStream {
    let stream_type = match stream.codec_type.as_deref() {
        Some("video") if stream.disposition_flag("attached_pic") => Some(MediaStreamType::EmbeddedImage),
        Some("video") => Some(MediaStreamType::Video),
        Some("audio") => Some(MediaStreamType::Audio),
        Some("subtitle") => Some(MediaStreamType::Subtitle),
        Some("data") => Some(MediaStreamType::Data),
        _ => None,
    };

    let is_interlaced = stream
        .field_order
        .as_deref()
        .map(|order| !order.trim().is_empty() && !order.eq_ignore_ascii_case("progressive"))
        .unwrap_or(false);

    let is_anamorphic = match stream.sample_aspect_ratio.as_deref().map(str::trim) {
        Some("1:1") => Some(false),
        Some(sar) if !sar.is_empty() => Some(true),
        _ => None,
    };

    MediaStream {
        index: stream.index,
        stream_type,
        codec: stream.codec_name.clone(),
        profile: stream.profile.clone(),
        language: stream.tag("language"),
        title: stream.tag("title"),
        width: stream.width,
        height: stream.height,
        aspect_ratio: stream.display_aspect_ratio.clone().filter(|dar| !dar.is_empty()),
        is_interlaced,
        is_anamorphic,
        average_frame_rate: parse_frame_rate(stream.avg_frame_rate.as_deref()),
        real_frame_rate: parse_frame_rate(stream.r_frame_rate.as_deref()),
        level: stream.level.map(f64::from),
        pixel_format: stream.pix_fmt.clone(),
        bit_depth: stream.bits_per_raw_sample.as_deref().and_then(|s| s.parse().ok()),
        bit_rate: stream.bit_rate.as_deref().and_then(|s| s.parse().ok()),
        channels: stream.channels,
        channel_layout: stream.channel_layout.clone(),
        sample_rate: stream.sample_rate.as_deref().and_then(|s| s.parse().ok()),
        ref_frames: stream.refs,
        is_avc: stream.is_avc.as_deref().map(|v| v.eq_ignore_ascii_case("true") || v == "1"),
        is_default: stream.disposition_flag("default"),
        is_forced: stream.disposition_flag("forced"),
        key_frames: None,
    }
}

fn normalize_chapter(chapter: ProbeChapter) -> Option<ChapterInfo> {
    let start_ms = parse_seconds_ms(chapter.start_time.as_deref())?;
    let name = chapter.tags.get("title").cloned();
    Some(ChapterInfo { start_ms, name })
}

fn parse_seconds_ms(value: Option<&str>) -> Option<u64> {
    let seconds: f64 = value?.trim().parse().ok()?;
    if seconds.is_finite() && seconds >= 0.0 {
        Some((seconds * 1000.0).round() as u64)
    } else {
        None
    }
}

/// Parse `num/den` (or a bare number) into frames per second
pub fn parse_frame_rate(value: Option<&str>) -> Option<f32> {
    let value = value?.trim();
    let rate = match value.split_once('/') {
        Some((num, den)) => {
            let num: f32 = num.parse().ok()?;
            let den: f32 = den.parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => value.parse().ok()?,
    };
    if rate > 0.0 && rate.is_finite() {
        Some(rate)
    } else {
        None
    }
}
