//! soma_encoder - supervised ffprobe/ffmpeg invocations for a media server
//!
//! Probing, keyframe analysis and thumbnail extraction all shell out to the
//! system `ffprobe`/`ffmpeg` binaries (LGPL-safe, no linking). Concurrency is
//! bounded per operation class and every spawned process is tracked so that
//! shutdown can stop it.

pub mod args;
pub mod config;
pub mod encoder;
pub mod error;
pub mod ffmpeg;
pub mod image;
pub mod interval;
pub mod keyframes;
pub mod media_info;
pub mod metrics;
pub mod pool;
pub mod probe;
pub mod process;
pub mod validation;

pub use args::{InputDescriptor, MediaProtocol, Video3DFormat};
pub use config::{EncoderConfig, PoolLimits, Timeouts};
pub use encoder::MediaEncoder;
pub use error::{EncoderError, Result};
pub use ffmpeg::{engine_available, FfmpegCommand};
pub use image::{ImageExtractor, ImageRequest};
pub use interval::{IntervalExtractor, IntervalRequest};
pub use keyframes::KeyframeExtractor;
pub use media_info::{
    ChapterInfo, DefaultNormalizer, MediaInfo, MediaStream, MediaStreamType, ProbeNormalizer,
};
pub use pool::{PoolKind, PoolPermit, ResourcePool, ResourcePools};
pub use probe::{MediaInfoRequest, MediaType, ProbePipeline, ProbeResult, VideoType};
pub use process::{ExitReason, ManagedProcess, ProcessHandle, ProcessSpec, ProcessState, ProcessSupervisor};

pub use tokio_util::sync::CancellationToken;
