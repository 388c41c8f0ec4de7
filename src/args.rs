//! Engine input arguments and filter chains
//!
//! Pure helpers: nothing in here touches a process.

use crate::error::{EncoderError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

const PROBE_SIZE_ARGS: [&str; 4] = ["-probesize", "1G", "-analyzeduration", "200M"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaProtocol {
    File,
    Http,
    Rtmp,
    Rtsp,
    Udp,
    Rtp,
}

impl MediaProtocol {
    pub fn is_remote(&self) -> bool {
        !matches!(self, MediaProtocol::File)
    }
}

/// Arrangement of the two eye views inside a 3D frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Video3DFormat {
    HalfSideBySide,
    FullSideBySide,
    HalfTopAndBottom,
    FullTopAndBottom,
}

/// Where a media item lives and how to reach it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDescriptor {
    pub path: String,
    pub protocol: MediaProtocol,
    /// Mount point of an optical disc image, when one is mounted
    #[serde(default)]
    pub mounted_path: Option<PathBuf>,
    /// Stream files (VOB/M2TS parts) to concatenate, in playback order
    #[serde(default)]
    pub playable_stream_files: Vec<String>,
}

impl InputDescriptor {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            protocol: MediaProtocol::File,
            mounted_path: None,
            playable_stream_files: Vec::new(),
        }
    }

    pub fn remote(url: impl Into<String>, protocol: MediaProtocol) -> Self {
        Self {
            path: url.into(),
            protocol,
            mounted_path: None,
            playable_stream_files: Vec::new(),
        }
    }

    /// The concrete files the engine should read
    pub fn input_files(&self) -> Vec<String> {
        if self.protocol != MediaProtocol::File || self.playable_stream_files.is_empty() {
            return vec![self.path.clone()];
        }

        let root = self
            .mounted_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.path));
        let files = find_playable_stream_files(&root, &self.playable_stream_files);

        if files.is_empty() {
            vec![self.path.clone()]
        } else {
            files
        }
    }
}

/// Locate the named stream files under `root`, keeping the requested order
pub fn find_playable_stream_files(root: &Path, names: &[String]) -> Vec<String> {
    let all_files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();

    names
        .iter()
        .filter_map(|name| {
            all_files.iter().find(|path| {
                path.file_name()
                    .map(|file_name| file_name.to_string_lossy().eq_ignore_ascii_case(name))
                    .unwrap_or(false)
            })
        })
        .map(|path| path.to_string_lossy().into_owned())
        .collect()
}

/// Compose the value passed after `-i`
pub fn input_argument(input_files: &[String], protocol: MediaProtocol) -> Result<String> {
    let first = input_files
        .first()
        .ok_or_else(|| EncoderError::InvalidArgument("no input files".to_string()))?;

    if protocol.is_remote() {
        return Ok(first.clone());
    }

    if input_files.len() > 1 {
        return Ok(format!("concat:{}", input_files.join("|")));
    }

    if first.contains("://") {
        Ok(first.clone())
    } else {
        Ok(format!("file:{}", first))
    }
}

/// Larger probe window, needed only when segments are concatenated
pub fn probe_size_args(input_count: usize) -> Vec<String> {
    if input_count > 1 {
        PROBE_SIZE_ARGS.iter().map(|s| s.to_string()).collect()
    } else {
        Vec::new()
    }
}

/// Drop a leading `file:`-style prefix and any surrounding quotes
pub fn strip_protocol_prefix(input: &str) -> &str {
    let path = match input.split_once(':') {
        Some((_, rest)) => rest,
        None => input,
    };
    path.trim_matches('"')
}

/// `HH:MM:SS.mmm`, as taken by `-ss`
pub fn time_parameter(offset: Duration) -> String {
    let total_ms = offset.as_millis();
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let seconds = (total_ms / 1_000) % 60;
    let millis = total_ms % 1_000;
    format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, seconds, millis)
}

/// Seconds rendered with a `.` separator and no trailing zeros
pub fn seconds_parameter(interval: Duration) -> String {
    format!("{}", interval.as_secs_f64())
}

// crop out bars introduced by the eye split and restore the display aspect
const ASPECT_FIX: &str = "setdar=dar=a,crop=min(iw\\,ih*dar):min(ih\\,iw/dar):(iw-min(iw\\,iw*sar))/2:(ih - min (ih\\,ih/sar))/2,setsar=sar=1";

/// Single-eye crop plus aspect correction for a stereoscopic layout
pub fn stereo_crop_chain(format: Video3DFormat) -> String {
    match format {
        Video3DFormat::HalfSideBySide => format!("crop=iw/2:ih:0:0,scale=(iw*2):ih,{}", ASPECT_FIX),
        Video3DFormat::FullSideBySide => format!("crop=iw/2:ih:0:0,{}", ASPECT_FIX),
        Video3DFormat::HalfTopAndBottom => format!("crop=iw:ih/2:0:0,scale=(iw*2):ih,{}", ASPECT_FIX),
        Video3DFormat::FullTopAndBottom => format!("crop=iw:ih/2:0:0,{}", ASPECT_FIX),
    }
}

/// Still-frame filter chain: optional eye crop, then a fixed-width scale
/// with an even height derived from the display aspect ratio
pub fn thumbnail_filter(stereo: Option<Video3DFormat>, width: u32) -> String {
    let scale = format!("scale={w}:trunc({w}/dar/2)*2", w = width);
    match stereo {
        Some(format) => format!("{},{}", stereo_crop_chain(format), scale),
        None => scale,
    }
}

/// Interval filter chain: one frame per `interval`, optionally width-capped
pub fn interval_filter(
    stereo: Option<Video3DFormat>,
    interval: Duration,
    max_width: Option<u32>,
) -> String {
    let mut filters = Vec::new();
    if let Some(format) = stereo {
        filters.push(stereo_crop_chain(format));
    }
    filters.push(format!("fps=fps=1/{}", seconds_parameter(interval)));
    if let Some(width) = max_width {
        filters.push(format!("scale=min(iw\\,{}):trunc(ow/dar/2)*2", width));
    }
    filters.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_single_file_argument() {
        let arg = input_argument(&files(&["/media/movie.mkv"]), MediaProtocol::File).unwrap();
        assert_eq!(arg, "file:/media/movie.mkv");
    }

    #[test]
    fn test_concat_argument() {
        let arg = input_argument(
            &files(&["/dvd/VTS_01_1.VOB", "/dvd/VTS_01_2.VOB"]),
            MediaProtocol::File,
        )
        .unwrap();
        assert_eq!(arg, "concat:/dvd/VTS_01_1.VOB|/dvd/VTS_01_2.VOB");
    }

    #[test]
    fn test_remote_argument_passes_through() {
        let url = "http://example.test/live/stream.ts";
        assert_eq!(input_argument(&files(&[url]), MediaProtocol::Http).unwrap(), url);
        assert_eq!(input_argument(&files(&[url]), MediaProtocol::File).unwrap(), url);
    }

    #[test]
    fn test_empty_inputs_rejected() {
        let err = input_argument(&[], MediaProtocol::File).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_probe_size_only_for_concatenation() {
        assert!(probe_size_args(1).is_empty());
        assert_eq!(
            probe_size_args(3),
            vec!["-probesize", "1G", "-analyzeduration", "200M"]
        );
    }

    #[test]
    fn test_strip_protocol_prefix() {
        assert_eq!(strip_protocol_prefix("file:/media/movie.mkv"), "/media/movie.mkv");
        assert_eq!(strip_protocol_prefix("file:\"/media/a b.mkv\""), "/media/a b.mkv");
        assert_eq!(strip_protocol_prefix("/media/movie.mkv"), "/media/movie.mkv");
    }

    #[test]
    fn test_time_parameter() {
        assert_eq!(time_parameter(Duration::from_millis(0)), "00:00:00.000");
        assert_eq!(time_parameter(Duration::from_millis(3_723_045)), "01:02:03.045");
        assert_eq!(time_parameter(Duration::from_secs(10)), "00:00:10.000");
    }

    #[test]
    fn test_seconds_parameter() {
        assert_eq!(seconds_parameter(Duration::from_secs(10)), "10");
        assert_eq!(seconds_parameter(Duration::from_millis(500)), "0.5");
    }

    #[test]
    fn test_thumbnail_filter_plain() {
        assert_eq!(thumbnail_filter(None, 600), "scale=600:trunc(600/dar/2)*2");
    }

    #[test]
    fn test_thumbnail_filter_stereo_layouts() {
        let hsbs = thumbnail_filter(Some(Video3DFormat::HalfSideBySide), 600);
        assert!(hsbs.starts_with("crop=iw/2:ih:0:0,scale=(iw*2):ih,setdar=dar=a,"));
        assert!(hsbs.ends_with(",setsar=sar=1,scale=600:trunc(600/dar/2)*2"));

        let fsbs = thumbnail_filter(Some(Video3DFormat::FullSideBySide), 600);
        assert!(fsbs.starts_with("crop=iw/2:ih:0:0,setdar=dar=a,"));

        let htab = thumbnail_filter(Some(Video3DFormat::HalfTopAndBottom), 600);
        assert!(htab.starts_with("crop=iw:ih/2:0:0,scale=(iw*2):ih,setdar=dar=a,"));

        let ftab = thumbnail_filter(Some(Video3DFormat::FullTopAndBottom), 600);
        assert!(ftab.starts_with("crop=iw:ih/2:0:0,setdar=dar=a,"));
        assert!(ftab.contains("crop=min(iw\\,ih*dar):min(ih\\,iw/dar)"));
    }

    #[test]
    fn test_interval_filter() {
        assert_eq!(
            interval_filter(None, Duration::from_secs(10), None),
            "fps=fps=1/10"
        );
        assert_eq!(
            interval_filter(None, Duration::from_secs(10), Some(320)),
            "fps=fps=1/10,scale=min(iw\\,320):trunc(ow/dar/2)*2"
        );

        let stereo = interval_filter(Some(Video3DFormat::FullTopAndBottom), Duration::from_secs(5), None);
        assert!(stereo.starts_with("crop=iw:ih/2:0:0,"));
        assert!(stereo.ends_with(",fps=fps=1/5"));
    }

    #[test]
    fn test_playable_stream_files_in_requested_order() {
        let dir = tempfile::tempdir().unwrap();
        let video_ts = dir.path().join("VIDEO_TS");
        std::fs::create_dir_all(&video_ts).unwrap();
        for name in ["VTS_01_1.VOB", "VTS_01_2.VOB", "VIDEO_TS.IFO"] {
            std::fs::write(video_ts.join(name), b"").unwrap();
        }

        let input = InputDescriptor {
            path: "/library/Movie.iso".to_string(),
            protocol: MediaProtocol::File,
            mounted_path: Some(dir.path().to_path_buf()),
            playable_stream_files: files(&["vts_01_2.vob", "VTS_01_1.VOB"]),
        };

        let resolved = input.input_files();
        assert_eq!(resolved.len(), 2);
        assert!(resolved[0].ends_with("VTS_01_2.VOB"));
        assert!(resolved[1].ends_with("VTS_01_1.VOB"));
    }

    #[test]
    fn test_missing_stream_files_fall_back_to_path() {
        let dir = tempfile::tempdir().unwrap();
        let input = InputDescriptor {
            path: "/library/Movie.iso".to_string(),
            protocol: MediaProtocol::File,
            mounted_path: Some(dir.path().to_path_buf()),
            playable_stream_files: files(&["VTS_01_1.VOB"]),
        };

        assert_eq!(input.input_files(), files(&["/library/Movie.iso"]));
    }
}
