//! Single still image extraction
//!
//! The encoder writes one encoded frame to stdout, which is collected in
//! memory. Video first tries the `thumbnail` filter, which samples a batch of
//! frames and keeps the most representative one; if that fails for any reason
//! other than bad arguments, a plain single-frame grab is attempted.

use crate::args::{self, MediaProtocol, Video3DFormat};
use crate::config::EncoderConfig;
use crate::error::{EncoderError, Result};
use crate::ffmpeg::FfmpegCommand;
use crate::pool::{PoolKind, ResourcePools};
use crate::process::{ProcessSpec, ProcessSupervisor};
use crate::validation;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub inputs: Vec<String>,
    pub protocol: MediaProtocol,
    pub is_audio: bool,
    pub stereo_format: Option<Video3DFormat>,
    pub offset: Option<Duration>,
}

impl ImageRequest {
    /// Embedded cover art of a local audio file
    pub fn audio(path: impl Into<String>) -> Self {
        Self {
            inputs: vec![path.into()],
            protocol: MediaProtocol::File,
            is_audio: true,
            stereo_format: None,
            offset: None,
        }
    }

    pub fn video(inputs: Vec<String>, protocol: MediaProtocol) -> Self {
        Self {
            inputs,
            protocol,
            is_audio: false,
            stereo_format: None,
            offset: None,
        }
    }

    pub fn with_offset(mut self, offset: Duration) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_stereo_format(mut self, format: Video3DFormat) -> Self {
        self.stereo_format = Some(format);
        self
    }

    fn pool(&self) -> PoolKind {
        if self.is_audio {
            PoolKind::AudioImage
        } else {
            PoolKind::VideoImage
        }
    }

    fn display_input(&self) -> String {
        self.inputs.first().cloned().unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct ImageExtractor {
    config: Arc<EncoderConfig>,
    supervisor: ProcessSupervisor,
    pools: Arc<ResourcePools>,
}

impl ImageExtractor {
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

    pub fn build_command(&self, request: &ImageRequest, use_iframe: bool) -> Result<ProcessSpec> {
        let input = args::input_argument(&request.inputs, request.protocol)?;

        let mut filter = args::thumbnail_filter(request.stereo_format, self.config.thumbnail_width);
        if use_iframe {
            filter.push_str(",thumbnail=30");
        }

        let mut command = FfmpegCommand::new(&self.config.ffmpeg_path)
            .extend(args::probe_size_args(request.inputs.len()));
        if let Some(offset) = request.offset {
            command = command.extend(["-ss".to_string(), args::time_parameter(offset)]);
        }

        Ok(command
            .input(input)
            .args(&["-threads", "1", "-v", "quiet", "-vframes", "1", "-vf"])
            .output(filter)
            .args(&["-f", "image2", "-"])
            .into_spec())
    }

    /// Encoded image bytes for `request`
    pub async fn extract(&self, request: &ImageRequest, cancel: &CancellationToken) -> Result<Vec<u8>> {
        validation::validate_image_request(request)?;

        if !request.is_audio {
            match self.extract_once(request, true, cancel).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_cancelled() || e.is_invalid_argument() => return Err(e),
                Err(e) => warn!(
                    input = %request.display_input(),
                    "I-frame image extraction failed, will attempt standard way. {}", e
                ),
            }
        }

        self.extract_once(request, false, cancel).await
    }

    async fn extract_once(
        &self,
        request: &ImageRequest,
        use_iframe: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let spec = self.build_command(request, use_iframe)?;
        let timeouts = self.config.timeouts;

        let permit = self.pools.acquire(request.pool(), cancel).await?;
        let mut process = self.supervisor.start(spec)?;
        process.drain_stderr();

        let mut stdout = process.take_stdout().ok_or_else(|| {
            EncoderError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "encoder stdout was not captured",
            ))
        })?;
        let copy = tokio::spawn(async move {
            let mut buffer = Vec::new();
            stdout.read_to_end(&mut buffer).await.map(|_| buffer)
        });

        let exited = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.supervisor
                    .terminate(process.handle(), timeouts.image_quit_wait(), false)
                    .await;
                copy.abort();
                return Err(EncoderError::Cancelled);
            }
            state = process.wait_for_exit(Some(timeouts.image_exit())) => state,
        };

        let state = match exited {
            Some(state) => state,
            None => {
                warn!(
                    input = %request.display_input(),
                    "Image extraction did not finish within {:?}", timeouts.image_exit()
                );
                self.supervisor
                    .terminate(process.handle(), timeouts.image_quit_wait(), false)
                    .await;
                copy.abort();
                return Err(EncoderError::ExtractionFailure {
                    input: request.display_input(),
                });
            }
        };
        permit.release();

        let buffer = match copy.await {
            Ok(Ok(buffer)) => buffer,
            Ok(Err(e)) => {
                warn!(input = %request.display_input(), "Error reading encoder output: {}", e);
                Vec::new()
            }
            Err(e) => {
                warn!(input = %request.display_input(), "Encoder output reader failed: {}", e);
                Vec::new()
            }
        };

        if state.exit_code() != Some(0) || buffer.is_empty() {
            error!(
                input = %request.display_input(),
                exit_code = ?state.exit_code(),
                bytes = buffer.len(),
                "ffmpeg image extraction failed"
            );
            return Err(EncoderError::ExtractionFailure {
                input: request.display_input(),
            });
        }

        debug!(input = %request.display_input(), bytes = buffer.len(), use_iframe, "Extracted image");
        Ok(buffer)
    }
}
