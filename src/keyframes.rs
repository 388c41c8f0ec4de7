//! Keyframe timing via the prober's packet dump
//!
//! The prober is asked for `flags` and `pts_time` of every packet in one video
//! stream, printed in its compact format (`packet|flags=K|pts_time=1.5`). Lines
//! whose flags equal `k` become keyframe offsets in milliseconds.

use crate::args::strip_protocol_prefix;
use crate::error::{EncoderError, Result};
use crate::ffmpeg::FfmpegCommand;
use crate::process::{ProcessSpec, ProcessSupervisor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Parse one packet line; `Some(ms)` only for keyframes with a usable timestamp
pub fn parse_packet_line(line: &str) -> Option<u64> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let fields: HashMap<&str, &str> = line
        .split('|')
        .filter(|field| !field.trim().is_empty())
        .filter_map(|field| field.split_once('='))
        .collect();

    let flags = fields.get("flags")?;
    if !flags.trim().eq_ignore_ascii_case("k") {
        return None;
    }

    let seconds: f64 = fields.get("pts_time")?.trim().parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }

    Some((seconds * 1000.0).round() as u64)
}

/// Keyframe offsets for a whole packet dump, in packet (stream) order
pub fn parse_keyframes(text: &str) -> Vec<u64> {
    text.lines().filter_map(parse_packet_line).collect()
}

/// Runs the prober in packet-dump mode. Not pool gated: it only ever runs
/// nested inside a probe that already holds a probe permit.
#[derive(Clone)]
pub struct KeyframeExtractor {
    ffprobe_path: PathBuf,
    supervisor: ProcessSupervisor,
}

impl KeyframeExtractor {
    pub fn new(ffprobe_path: impl AsRef<Path>, supervisor: ProcessSupervisor) -> Self {
        Self {
            ffprobe_path: ffprobe_path.as_ref().to_path_buf(),
            supervisor,
        }
    }

    pub fn build_command(&self, input_path: &str, video_stream_index: usize) -> ProcessSpec {
        let path = strip_protocol_prefix(input_path);
        let selector = format!("v:{}", video_stream_index);

        FfmpegCommand::new(&self.ffprobe_path)
            .args(&[
                "-show_packets",
                "-print_format",
                "compact",
                "-select_streams",
                &selector,
                "-show_entries",
                "packet=flags",
                "-show_entries",
                "packet=pts_time",
            ])
            .output(path)
            .into_spec()
    }

    /// Keyframe offsets (ms) for the `video_stream_index`-th video stream.
    ///
    /// Cancellation aborts the whole extraction. Any other read error is
    /// logged and whatever was parsed up to that point is returned.
    pub async fn extract(
        &self,
        input_path: &str,
        video_stream_index: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<u64>> {
        let started = Instant::now();
        let mut process = self
            .supervisor
            .start(self.build_command(input_path, video_stream_index))?;
        process.drain_stderr();

        let stdout = process.take_stdout().ok_or_else(|| {
            EncoderError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "prober stdout was not captured",
            ))
        })?;

        let mut keyframes = Vec::new();
        let read = match read_keyframes(stdout, &mut keyframes, cancel).await {
            Ok(()) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(EncoderError::Cancelled),
                _ = process.wait_for_exit(None) => Ok(()),
            },
            Err(e) => Err(e),
        };

        match read {
            Ok(()) => {}
            Err(EncoderError::Cancelled) => {
                self.supervisor
                    .terminate(process.handle(), Duration::ZERO, true)
                    .await;
                return Err(EncoderError::Cancelled);
            }
            Err(e) => {
                warn!(input = input_path, "Error reading ffprobe output: {}", e);
                self.supervisor
                    .terminate(process.handle(), Duration::ZERO, true)
                    .await;
            }
        }

        debug!(
            input = input_path,
            count = keyframes.len(),
            "Keyframe extraction took {:.2} seconds",
            started.elapsed().as_secs_f64()
        );
        Ok(keyframes)
    }
}

async fn read_keyframes<R>(
    reader: R,
    keyframes: &mut Vec<u64>,
    cancel: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EncoderError::Cancelled),
            line = lines.next_line() => line?,
        };

        match line {
            Some(line) => keyframes.extend(parse_packet_line(&line)),
            None => return Ok(()),
        }
    }
}
