//! Entry point owning the supervisor, the pools and the extractors

use crate::args::{MediaProtocol, Video3DFormat};
use crate::config::EncoderConfig;
use crate::error::{EncoderError, Result};
use crate::image::{ImageExtractor, ImageRequest};
use crate::interval::{IntervalExtractor, IntervalRequest};
use crate::keyframes::KeyframeExtractor;
use crate::media_info::{DefaultNormalizer, MediaInfo, ProbeNormalizer};
use crate::metrics::{self, Metrics, Outcome, Timer};
use crate::pool::ResourcePools;
use crate::probe::{MediaInfoRequest, ProbePipeline};
use crate::process::ProcessSupervisor;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// One per process. Every engine invocation goes through the supervisor and
/// pools held here, so [`MediaEncoder::shutdown`] reaches all of them.
pub struct MediaEncoder {
    config: Arc<EncoderConfig>,
    supervisor: ProcessSupervisor,
    pools: Arc<ResourcePools>,
    metrics: Arc<Metrics>,
    probe: ProbePipeline,
    keyframes: KeyframeExtractor,
    images: ImageExtractor,
    intervals: IntervalExtractor,
}

impl MediaEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self::with_normalizer(config, Arc::new(DefaultNormalizer))
    }

    pub fn with_normalizer(config: EncoderConfig, normalizer: Arc<dyn ProbeNormalizer>) -> Self {
        let config = Arc::new(config);
        let supervisor = ProcessSupervisor::new(config.timeouts.kill_wait());
        let pools = Arc::new(ResourcePools::new(&config.pools));

        info!(
            ffmpeg = %config.ffmpeg_path.display(),
            ffprobe = %config.ffprobe_path.display(),
            "Media encoder initialized"
        );

        Self {
            probe: ProbePipeline::new(
                Arc::clone(&config),
                supervisor.clone(),
                Arc::clone(&pools),
                normalizer,
            ),
            keyframes: KeyframeExtractor::new(&config.ffprobe_path, supervisor.clone()),
            images: ImageExtractor::new(Arc::clone(&config), supervisor.clone(), Arc::clone(&pools)),
            intervals: IntervalExtractor::new(
                Arc::clone(&config),
                supervisor.clone(),
                Arc::clone(&pools),
            ),
            metrics: Metrics::new(),
            config,
            supervisor,
            pools,
        }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn pools(&self) -> &ResourcePools {
        &self.pools
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub async fn get_media_info(
        &self,
        request: &MediaInfoRequest,
        cancel: &CancellationToken,
    ) -> Result<MediaInfo> {
        let timer = Timer::new();
        let result = self.probe.probe(request, cancel).await;
        self.record(metrics::OP_PROBE, &timer, &result);
        result
    }

    /// Keyframe offsets (ms) of the `video_stream_index`-th video stream.
    /// Runs outside the probe pool.
    pub async fn extract_keyframes(
        &self,
        input_path: &str,
        video_stream_index: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<u64>> {
        let timer = Timer::new();
        let result = self
            .keyframes
            .extract(input_path, video_stream_index, cancel)
            .await;
        self.record(metrics::OP_KEYFRAMES, &timer, &result);
        result
    }

    pub async fn extract_image(
        &self,
        request: &ImageRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let op = if request.is_audio {
            metrics::OP_AUDIO_IMAGE
        } else {
            metrics::OP_VIDEO_IMAGE
        };

        let timer = Timer::new();
        let result = self.images.extract(request, cancel).await;
        self.record(op, &timer, &result);
        result
    }

    pub async fn extract_audio_image(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        self.extract_image(&ImageRequest::audio(path), cancel).await
    }

    pub async fn extract_video_image(
        &self,
        inputs: &[String],
        protocol: MediaProtocol,
        stereo_format: Option<Video3DFormat>,
        offset: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let request = ImageRequest {
            inputs: inputs.to_vec(),
            protocol,
            is_audio: false,
            stereo_format,
            offset,
        };
        self.extract_image(&request, cancel).await
    }

    pub async fn extract_video_images_on_interval(
        &self,
        request: &IntervalRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let timer = Timer::new();
        let result = self.intervals.extract(request, cancel).await;
        self.record(metrics::OP_INTERVAL_IMAGES, &timer, &result);
        result
    }

    /// Close every pool, then stop all live engine processes
    pub async fn shutdown(&self) {
        self.pools.close_all();
        self.supervisor
            .shutdown(self.config.timeouts.shutdown_grace())
            .await;
        info!("Media encoder shut down");
    }

    fn record<T>(&self, op: &str, timer: &Timer, result: &Result<T>) {
        let outcome = match result {
            Ok(_) => Outcome::Success,
            Err(EncoderError::Cancelled) => Outcome::Cancelled,
            Err(_) => Outcome::Failure,
        };
        self.metrics.record_request(op, outcome, timer.elapsed_ms());
    }
}
