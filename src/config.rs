//! Engine locations, pool capacities and timing knobs

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// Server-wide switch for frame-by-frame keyframe analysis during probes
    pub enable_keyframe_analysis: bool,
    pub thumbnail_width: u32,
    pub pools: PoolLimits,
    pub timeouts: Timeouts,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            enable_keyframe_analysis: false,
            thumbnail_width: 600,
            pools: PoolLimits::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl EncoderConfig {
    /// Load a JSON config file; missing fields fall back to defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Concurrent engine invocations allowed per operation class
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolLimits {
    pub probe: usize,
    pub audio_image: usize,
    pub video_image: usize,
    pub interval_image: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            probe: 2,
            audio_image: 2,
            video_image: 1,
            interval_image: 1,
        }
    }
}

/// All values in milliseconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub image_exit_ms: u64,
    pub image_quit_wait_ms: u64,
    pub interval_heartbeat_ms: u64,
    pub interval_quit_wait_ms: u64,
    pub probe_failure_quit_wait_ms: u64,
    pub shutdown_grace_ms: u64,
    pub kill_wait_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            image_exit_ms: 10_000,
            image_quit_wait_ms: 1_000,
            interval_heartbeat_ms: 30_000,
            interval_quit_wait_ms: 1_000,
            probe_failure_quit_wait_ms: 100,
            shutdown_grace_ms: 500,
            kill_wait_ms: 5_000,
        }
    }
}

impl Timeouts {
    pub fn image_exit(&self) -> Duration {
        Duration::from_millis(self.image_exit_ms)
    }

    pub fn image_quit_wait(&self) -> Duration {
        Duration::from_millis(self.image_quit_wait_ms)
    }

    pub fn interval_heartbeat(&self) -> Duration {
        Duration::from_millis(self.interval_heartbeat_ms)
    }

    pub fn interval_quit_wait(&self) -> Duration {
        Duration::from_millis(self.interval_quit_wait_ms)
    }

    pub fn probe_failure_quit_wait(&self) -> Duration {
        Duration::from_millis(self.probe_failure_quit_wait_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool_limits() {
        let config = EncoderConfig::default();
        assert_eq!(config.pools.probe, 2);
        assert_eq!(config.pools.audio_image, 2);
        assert_eq!(config.pools.video_image, 1);
        assert_eq!(config.pools.interval_image, 1);
        assert_eq!(config.thumbnail_width, 600);
        assert!(!config.enable_keyframe_analysis);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EncoderConfig = serde_json::from_str(
            r#"{"ffprobe_path": "/opt/engine/ffprobe", "timeouts": {"interval_heartbeat_ms": 250}}"#,
        )
        .unwrap();

        assert_eq!(config.ffprobe_path, PathBuf::from("/opt/engine/ffprobe"));
        assert_eq!(config.ffmpeg_path, PathBuf::from("ffmpeg"));
        assert_eq!(config.timeouts.interval_heartbeat(), Duration::from_millis(250));
        assert_eq!(config.timeouts.image_exit(), Duration::from_secs(10));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encoder.json");
        std::fs::write(&path, r#"{"enable_keyframe_analysis": true}"#).unwrap();

        let config = EncoderConfig::from_file(&path).unwrap();
        assert!(config.enable_keyframe_analysis);
        assert_eq!(config.pools.probe, 2);
    }
}
