//! Interval thumbnails written to disk
//!
//! Long videos can legitimately take many minutes, so there is no overall
//! deadline. Instead the output directory is checked once per heartbeat: as
//! long as new JPEGs keep appearing the encoder is considered alive. A
//! heartbeat without a new file means the encoder is stuck; it is asked to
//! quit and the call fails with [`EncoderError::Hang`].

use crate::args::{self, MediaProtocol, Video3DFormat};
use crate::config::EncoderConfig;
use crate::error::{EncoderError, Result};
use crate::ffmpeg::FfmpegCommand;
use crate::pool::{PoolKind, ResourcePools};
use crate::process::{spawn_log_drain, ProcessSpec, ProcessSupervisor};
use crate::validation;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct IntervalRequest {
    pub inputs: Vec<String>,
    pub protocol: MediaProtocol,
    pub stereo_format: Option<Video3DFormat>,
    pub interval: Duration,
    pub output_dir: PathBuf,
    pub filename_prefix: String,
    pub max_width: Option<u32>,
}

impl IntervalRequest {
    pub fn new(inputs: Vec<String>, output_dir: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            inputs,
            protocol: MediaProtocol::File,
            stereo_format: None,
            interval,
            output_dir: output_dir.into(),
            filename_prefix: "img_".to_string(),
            max_width: None,
        }
    }

    /// `<dir>/<prefix>%05d.jpg`
    pub fn output_pattern(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}%05d.jpg", self.filename_prefix))
    }

    fn display_input(&self) -> String {
        self.inputs.first().cloned().unwrap_or_default()
    }
}

/// Number of `.jpg` files directly inside `dir`; a missing dir counts as empty
pub async fn count_images(dir: &Path) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut count = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_jpeg = entry
            .path()
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("jpg"))
            .unwrap_or(false);
        if is_jpeg {
            count += 1;
        }
    }
    count
}

#[derive(Clone)]
pub struct IntervalExtractor {
    config: Arc<EncoderConfig>,
    supervisor: ProcessSupervisor,
    pools: Arc<ResourcePools>,
}

impl IntervalExtractor {
    pub fn new(
        config: Arc<EncoderConfig>,
        supervisor: ProcessSupervisor,
        pools: Arc<ResourcePools>,
    ) -> Self {
        Self {
            config,
            supervisor,
            pools,
        }
    }

    pub fn build_command(&self, request: &IntervalRequest) -> Result<ProcessSpec> {
        let input = args::input_argument(&request.inputs, request.protocol)?;
        let filter = args::interval_filter(request.stereo_format, request.interval, request.max_width);

        Ok(FfmpegCommand::new(&self.config.ffmpeg_path)
            .extend(args::probe_size_args(request.inputs.len()))
            .input(input)
            .args(&["-threads", "1", "-v", "quiet", "-vf"])
            .output(filter)
            .args(&["-f", "image2"])
            .output(request.output_pattern().to_string_lossy().into_owned())
            .into_spec())
    }

    pub async fn extract(&self, request: &IntervalRequest, cancel: &CancellationToken) -> Result<()> {
        validation::validate_interval_request(request)?;
        let spec = self.build_command(request)?;
        let timeouts = self.config.timeouts;
        let heartbeat = timeouts.interval_heartbeat();

        tokio::fs::create_dir_all(&request.output_dir).await?;

        let _permit = self.pools.acquire(PoolKind::IntervalImage, cancel).await?;

        // progress is measured against whatever the directory already held
        let mut last_count = count_images(&request.output_dir).await;

        let mut process = self.supervisor.start(spec)?;
        process.drain_stderr();
        if let Some(stdout) = process.take_stdout() {
            spawn_log_drain(stdout, "ffmpeg".to_string());
        }

        let state = loop {
            let waited = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.supervisor
                        .terminate(process.handle(), timeouts.interval_quit_wait(), false)
                        .await;
                    return Err(EncoderError::Cancelled);
                }
                state = process.wait_for_exit(Some(heartbeat)) => state,
            };

            if let Some(state) = waited {
                break state;
            }

            let count = count_images(&request.output_dir).await;
            if count > last_count {
                debug!(input = %request.display_input(), images = count, "Interval extraction progressing");
                last_count = count;
                continue;
            }

            warn!(
                input = %request.display_input(),
                images = count,
                "No new images after {:?}, stopping ffmpeg", heartbeat
            );
            self.supervisor
                .terminate(process.handle(), timeouts.interval_quit_wait(), false)
                .await;
            return Err(EncoderError::Hang {
                input: request.display_input(),
                waited: heartbeat,
            });
        };

        if state.exit_code() != Some(0) {
            error!(
                input = %request.display_input(),
                exit_code = ?state.exit_code(),
                "ffmpeg interval image extraction failed"
            );
            return Err(EncoderError::ExtractionFailure {
                input: request.display_input(),
            });
        }

        info!(
            input = %request.display_input(),
            images = count_images(&request.output_dir).await,
            "Interval image extraction complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> IntervalExtractor {
        let config = Arc::new(EncoderConfig::default());
        IntervalExtractor::new(
            Arc::clone(&config),
            ProcessSupervisor::default(),
            Arc::new(ResourcePools::new(&config.pools)),
        )
    }

    #[test]
    fn test_command_layout() {
        let mut request = IntervalRequest::new(
            vec!["/media/movie.mkv".to_string()],
            "/cache/chapters/abc",
            Duration::from_secs(10),
        );
        request.max_width = Some(320);
        request.filename_prefix = "thumb_".to_string();

        let spec = extractor().build_command(&request).unwrap();
        assert_eq!(
            spec.args,
            vec![
                "-i",
                "file:/media/movie.mkv",
                "-threads",
                "1",
                "-v",
                "quiet",
                "-vf",
                "fps=fps=1/10,scale=min(iw\\,320):trunc(ow/dar/2)*2",
                "-f",
                "image2",
                "/cache/chapters/abc/thumb_%05d.jpg",
            ]
        );
    }

    #[test]
    fn test_stereo_crop_precedes_fps() {
        let mut request = IntervalRequest::new(
            vec!["/media/3d.mkv".to_string()],
            "/cache/out",
            Duration::from_secs(5),
        );
        request.stereo_format = Some(Video3DFormat::HalfTopAndBottom);

        let spec = extractor().build_command(&request).unwrap();
        let filter = &spec.args[spec.args.iter().position(|a| a == "-vf").unwrap() + 1];
        assert!(filter.starts_with("crop=iw:ih/2:0:0,scale=(iw*2):ih,"));
        assert!(filter.ends_with(",fps=fps=1/5"));
    }

    #[tokio::test]
    async fn test_count_images_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["img_00001.jpg", "img_00002.JPG", "notes.txt", "img_00003.png"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        assert_eq!(count_images(dir.path()).await, 2);
        assert_eq!(count_images(&dir.path().join("missing")).await, 0);
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let request = IntervalRequest::new(
            vec!["/media/movie.mkv".to_string()],
            dir.path(),
            Duration::ZERO,
        );

        let err = extractor()
            .extract(&request, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }
}
