//! Probe pipeline: structured metadata from the prober
//!
//! One probe is one prober run under a probe-pool permit. Its JSON document is
//! deserialized into [`ProbeResult`], cleaned up, handed to the configured
//! [`ProbeNormalizer`], and, for eligible local video files, enriched with
//! keyframe offsets. Keyframe data is advisory: failing to get it never fails
//! the probe, though cancellation still does.

use crate::args::{self, InputDescriptor, MediaProtocol};
use crate::config::EncoderConfig;
use crate::error::{EncoderError, Result};
use crate::ffmpeg::FfmpegCommand;
use crate::keyframes::KeyframeExtractor;
use crate::media_info::{MediaInfo, MediaStream, MediaStreamType, ProbeNormalizer};
use crate::pool::{PoolKind, ResourcePools};
use crate::process::{ManagedProcess, ProcessSpec, ProcessSupervisor};
use crate::validation;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const ASPECT_RATIO_SENTINEL: &str = "0:1";

// ============================================================================
// Raw prober document
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeResult {
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ProbeFormat>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chapters: Vec<ProbeChapter>,
}

impl ProbeResult {
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty() && self.format.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeStream {
    pub index: i32,
    pub codec_name: Option<String>,
    pub codec_long_name: Option<String>,
    pub profile: Option<String>,
    pub codec_type: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub sample_aspect_ratio: Option<String>,
    pub display_aspect_ratio: Option<String>,
    pub pix_fmt: Option<String>,
    pub level: Option<i32>,
    pub field_order: Option<String>,
    pub refs: Option<i32>,
    pub is_avc: Option<String>,
    pub r_frame_rate: Option<String>,
    pub avg_frame_rate: Option<String>,
    pub time_base: Option<String>,
    pub duration: Option<String>,
    pub bit_rate: Option<String>,
    pub bits_per_raw_sample: Option<String>,
    pub channels: Option<i32>,
    pub channel_layout: Option<String>,
    pub sample_rate: Option<String>,
    pub disposition: HashMap<String, i64>,
    pub tags: HashMap<String, String>,
}

impl ProbeStream {
    pub fn tag(&self, key: &str) -> Option<String> {
        self.tags
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.clone())
    }

    pub fn disposition_flag(&self, key: &str) -> bool {
        self.disposition.get(key).copied().unwrap_or(0) != 0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeFormat {
    pub filename: Option<String>,
    pub nb_streams: Option<i32>,
    pub format_name: Option<String>,
    pub format_long_name: Option<String>,
    pub start_time: Option<String>,
    pub duration: Option<String>,
    pub size: Option<String>,
    pub bit_rate: Option<String>,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeChapter {
    pub id: i64,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub tags: HashMap<String, String>,
}

/// Rewrite the prober's `0:1` "no aspect ratio" sentinel to empty
pub fn normalize_aspect_ratios(result: &mut ProbeResult) {
    for stream in &mut result.streams {
        for ratio in [
            &mut stream.display_aspect_ratio,
            &mut stream.sample_aspect_ratio,
        ] {
            if let Some(value) = ratio.as_mut() {
                if value.eq_ignore_ascii_case(ASPECT_RATIO_SENTINEL) {
                    value.clear();
                }
            }
        }
    }
}

// ============================================================================
// Requests and policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoType {
    VideoFile,
    Iso,
    Dvd,
    BluRay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfoRequest {
    pub input: InputDescriptor,
    pub media_type: MediaType,
    #[serde(default)]
    pub video_type: Option<VideoType>,
    #[serde(default)]
    pub extract_chapters: bool,
    #[serde(default)]
    pub extract_keyframes: bool,
}

impl MediaInfoRequest {
    pub fn video(input: InputDescriptor) -> Self {
        Self {
            input,
            media_type: MediaType::Video,
            video_type: Some(VideoType::VideoFile),
            extract_chapters: false,
            extract_keyframes: false,
        }
    }

    pub fn audio(input: InputDescriptor) -> Self {
        Self {
            input,
            media_type: MediaType::Audio,
            video_type: None,
            extract_chapters: false,
            extract_keyframes: false,
        }
    }

    pub fn with_chapters(mut self) -> Self {
        self.extract_chapters = true;
        self
    }

    pub fn with_keyframes(mut self) -> Self {
        self.extract_keyframes = true;
        self
    }

    pub fn is_audio(&self) -> bool {
        self.media_type == MediaType::Audio
    }
}

/// Keyframe analysis only pays off for progressive, square-pixel h264.
/// A lone AAC audio track usually means the item direct-plays anyway, so the
/// analysis is skipped for it.
pub fn keyframe_eligible(info: &MediaInfo, stream: &MediaStream) -> bool {
    if !stream.is_video()
        || !stream.codec_is("h264")
        || stream.is_interlaced
        || stream.is_anamorphic.unwrap_or(false)
    {
        return false;
    }

    let audio: Vec<&MediaStream> = info.audio_streams().collect();
    !(audio.len() == 1 && audio[0].codec_is("aac"))
}

// ============================================================================
// Pipeline
// ============================================================================

#[derive(Clone)]
pub struct ProbePipeline {
    config: Arc<EncoderConfig>,
    supervisor: ProcessSupervisor,
    pools: Arc<ResourcePools>,
    normalizer: Arc<dyn ProbeNormalizer>,
    keyframes: KeyframeExtractor,
}

impl ProbePipeline {
    pub fn new(
        config: Arc<EncoderConfig>,
        supervisor: ProcessSupervisor,
        pools: Arc<ResourcePools>,
        normalizer: Arc<dyn ProbeNormalizer>,
    ) -> Self {
        let keyframes = KeyframeExtractor::new(&config.ffprobe_path, supervisor.clone());
        Self {
            config,
            supervisor,
            pools,
            normalizer,
            keyframes,
        }
    }

    /// Input argument plus the prober invocation for `request`
    pub fn build_command(&self, request: &MediaInfoRequest) -> Result<(String, ProcessSpec)> {
        let input_files = request.input.input_files();
        let input = args::input_argument(&input_files, request.input.protocol)?;
        let extract_chapters = request.media_type == MediaType::Video && request.extract_chapters;

        let mut command = FfmpegCommand::new(&self.config.ffprobe_path)
            .extend(args::probe_size_args(input_files.len()))
            .input(input.clone())
            .args(&[
                "-threads",
                "0",
                "-v",
                "info",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ]);
        if extract_chapters {
            command = command.args(&["-show_chapters"]);
        }

        Ok((input, command.into_spec()))
    }

    pub async fn probe(
        &self,
        request: &MediaInfoRequest,
        cancel: &CancellationToken,
    ) -> Result<MediaInfo> {
        validation::validate_media_info_request(request)?;
        let (input, spec) = self.build_command(request)?;

        // held until the probe (keyframes included) is done, on every path
        let _permit = self.pools.acquire(PoolKind::Probe, cancel).await?;

        let mut process = self.supervisor.start(spec)?;

        let raw = match read_probe_output(&mut process, &input, cancel).await {
            Ok(raw) => raw,
            Err(e) => {
                if !e.is_cancelled() {
                    error!(input = %input, "Probe failed: {}", e);
                }
                self.supervisor
                    .terminate(
                        process.handle(),
                        self.config.timeouts.probe_failure_quit_wait(),
                        true,
                    )
                    .await;
                return Err(e);
            }
        };

        let mut result = match raw {
            Some(result) if !result.is_empty() => result,
            _ => {
                return Err(EncoderError::EmptyResult {
                    input: request.input.path.clone(),
                })
            }
        };

        normalize_aspect_ratios(&mut result);
        let mut info = self.normalizer.normalize(result, request);

        if self.keyframes_wanted(request) && info.duration_ms.is_some() {
            self.attach_keyframes(&mut info, &input, cancel).await?;
        }

        Ok(info)
    }

    fn keyframes_wanted(&self, request: &MediaInfoRequest) -> bool {
        self.config.enable_keyframe_analysis
            && request.extract_keyframes
            && request.input.protocol == MediaProtocol::File
            && request.video_type == Some(VideoType::VideoFile)
    }

    async fn attach_keyframes(
        &self,
        info: &mut MediaInfo,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // the prober's v:N selector counts every video-typed stream
        let mut video_ordinal = 0usize;
        let mut targets = Vec::new();
        for (position, stream) in info.streams.iter().enumerate() {
            if matches!(
                stream.stream_type,
                Some(MediaStreamType::Video) | Some(MediaStreamType::EmbeddedImage)
            ) {
                if keyframe_eligible(info, stream) {
                    targets.push((position, video_ordinal));
                }
                video_ordinal += 1;
            }
        }

        for (position, ordinal) in targets {
            match self.keyframes.extract(input, ordinal, cancel).await {
                Ok(frames) => info.streams[position].key_frames = Some(frames),
                Err(EncoderError::Cancelled) => return Err(EncoderError::Cancelled),
                Err(e) => error!(input = %input, "Error getting key frame interval: {}", e),
            }
        }

        Ok(())
    }
}

/// Read stdout to EOF while stderr drains in the background
async fn read_probe_output(
    process: &mut ManagedProcess,
    input: &str,
    cancel: &CancellationToken,
) -> Result<Option<ProbeResult>> {
    process.drain_stderr();
    let mut stdout = process.take_stdout().ok_or_else(|| {
        EncoderError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "prober stdout was not captured",
        ))
    })?;

    let mut buffer = Vec::new();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(EncoderError::Cancelled),
        read = stdout.read_to_end(&mut buffer) => { read?; }
    }

    // stdout can close before the prober exits
    let state = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(EncoderError::Cancelled),
        state = process.wait_for_exit(None) => state,
    };
    debug!(input, ?state, bytes = buffer.len(), "Prober finished");

    let text = String::from_utf8_lossy(&buffer);
    let text = text.trim();
    if text.is_empty() {
        warn!(input, "Prober produced no output");
        return Ok(None);
    }

    serde_json::from_str::<Option<ProbeResult>>(text).map_err(|e| EncoderError::ParseFailure {
        input: input.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_info::{DefaultNormalizer, MediaStreamType};

    fn stream(stream_type: MediaStreamType, codec: &str) -> MediaStream {
        MediaStream {
            stream_type: Some(stream_type),
            codec: Some(codec.to_string()),
            ..Default::default()
        }
    }

    fn media(streams: Vec<MediaStream>) -> MediaInfo {
        MediaInfo {
            path: "/media/movie.mp4".to_string(),
            protocol: MediaProtocol::File,
            container: None,
            duration_ms: Some(60_000),
            size: None,
            bit_rate: None,
            streams,
            chapters: Vec::new(),
        }
    }

    fn pipeline() -> ProbePipeline {
        let config = Arc::new(EncoderConfig::default());
        ProbePipeline::new(
            Arc::clone(&config),
            ProcessSupervisor::default(),
            Arc::new(ResourcePools::new(&config.pools)),
            Arc::new(DefaultNormalizer),
        )
    }

    #[test]
    fn test_aspect_ratio_sentinel_cleared() {
        let mut result: ProbeResult = serde_json::from_str(
            r#"{"streams": [{"index": 0, "codec_type": "video",
                 "display_aspect_ratio": "0:1", "sample_aspect_ratio": "0:1"},
                {"index": 1, "codec_type": "video",
                 "display_aspect_ratio": "16:9", "sample_aspect_ratio": "1:1"}]}"#,
        )
        .unwrap();

        normalize_aspect_ratios(&mut result);

        assert_eq!(result.streams[0].display_aspect_ratio.as_deref(), Some(""));
        assert_eq!(result.streams[0].sample_aspect_ratio.as_deref(), Some(""));
        assert_eq!(result.streams[1].display_aspect_ratio.as_deref(), Some("16:9"));
        assert_eq!(result.streams[1].sample_aspect_ratio.as_deref(), Some("1:1"));
    }

    #[test]
    fn test_eligible_with_two_audio_tracks() {
        let info = media(vec![
            stream(MediaStreamType::Video, "h264"),
            stream(MediaStreamType::Audio, "aac"),
            stream(MediaStreamType::Audio, "ac3"),
        ]);
        assert!(keyframe_eligible(&info, &info.streams[0]));
    }

    #[test]
    fn test_single_aac_track_not_eligible() {
        let info = media(vec![
            stream(MediaStreamType::Video, "h264"),
            stream(MediaStreamType::Audio, "AAC"),
        ]);
        assert!(!keyframe_eligible(&info, &info.streams[0]));
    }

    #[test]
    fn test_ineligible_video_streams() {
        let mut interlaced = stream(MediaStreamType::Video, "h264");
        interlaced.is_interlaced = true;
        let mut anamorphic = stream(MediaStreamType::Video, "h264");
        anamorphic.is_anamorphic = Some(true);
        let hevc = stream(MediaStreamType::Video, "hevc");

        let info = media(vec![interlaced, anamorphic, hevc]);
        for s in &info.streams {
            assert!(!keyframe_eligible(&info, s));
        }
        let audio = stream(MediaStreamType::Audio, "h264");
        assert!(!keyframe_eligible(&info, &audio));
    }

    #[test]
    fn test_round_trip_preserves_streams() {
        let json = r#"{"streams": [
            {"index": 0, "codec_name": "h264", "codec_type": "video"},
            {"index": 1, "codec_name": "aac", "codec_type": "audio"},
            {"index": 2, "codec_name": "subrip", "codec_type": "subtitle"}],
            "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "12.5"}}"#;

        let mut result: ProbeResult = serde_json::from_str(json).unwrap();
        normalize_aspect_ratios(&mut result);
        let reparsed: ProbeResult =
            serde_json::from_str(&serde_json::to_string(&result).unwrap()).unwrap();

        assert_eq!(reparsed.streams.len(), 3);
        let codecs: Vec<_> = reparsed
            .streams
            .iter()
            .map(|s| s.codec_name.as_deref().unwrap())
            .collect();
        assert_eq!(codecs, vec!["h264", "aac", "subrip"]);
    }

    #[test]
    fn test_empty_document_detection() {
        assert!(ProbeResult::default().is_empty());
        let result: ProbeResult = serde_json::from_str(r#"{"format": {}}"#).unwrap();
        assert!(!result.is_empty());
    }

    #[test]
    fn test_command_chapters_only_for_video() {
        let pipeline = pipeline();
        let input = InputDescriptor::file("/media/movie.mkv");

        let (arg, spec) = pipeline
            .build_command(&MediaInfoRequest::video(input.clone()).with_chapters())
            .unwrap();
        assert_eq!(arg, "file:/media/movie.mkv");
        assert_eq!(spec.args.last().map(String::as_str), Some("-show_chapters"));
        assert_eq!(&spec.args[..2], &["-i", "file:/media/movie.mkv"]);

        let (_, spec) = pipeline
            .build_command(&MediaInfoRequest::audio(input).with_chapters())
            .unwrap();
        assert!(!spec.args.iter().any(|a| a == "-show_chapters"));
        assert_eq!(spec.args.last().map(String::as_str), Some("-show_format"));
    }

    #[test]
    fn test_command_probe_size_for_concatenation() {
        let pipeline = pipeline();
        let dir = tempfile::tempdir().unwrap();
        for name in ["00001.m2ts", "00002.m2ts"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let input = InputDescriptor {
            path: "/library/Disc.iso".to_string(),
            protocol: MediaProtocol::File,
            mounted_path: Some(dir.path().to_path_buf()),
            playable_stream_files: vec!["00001.m2ts".to_string(), "00002.m2ts".to_string()],
        };

        let (arg, spec) = pipeline.build_command(&MediaInfoRequest::video(input)).unwrap();
        assert!(arg.starts_with("concat:"));
        assert_eq!(&spec.args[..4], &["-probesize", "1G", "-analyzeduration", "200M"]);
    }

    #[test]
    fn test_keyframes_only_for_local_video_files() {
        let config = EncoderConfig {
            enable_keyframe_analysis: true,
            ..Default::default()
        };
        let config = Arc::new(config);
        let pipeline = ProbePipeline::new(
            Arc::clone(&config),
            ProcessSupervisor::default(),
            Arc::new(ResourcePools::new(&config.pools)),
            Arc::new(DefaultNormalizer),
        );

        let local = MediaInfoRequest::video(InputDescriptor::file("/media/a.mp4")).with_keyframes();
        assert!(pipeline.keyframes_wanted(&local));

        let remote = MediaInfoRequest::video(InputDescriptor::remote(
            "http://example.test/a.mp4",
            MediaProtocol::Http,
        ))
        .with_keyframes();
        assert!(!pipeline.keyframes_wanted(&remote));

        let mut disc = local.clone();
        disc.video_type = Some(VideoType::BluRay);
        assert!(!pipeline.keyframes_wanted(&disc));

        let not_requested = MediaInfoRequest::video(InputDescriptor::file("/media/a.mp4"));
        assert!(!pipeline.keyframes_wanted(&not_requested));
    }
}
