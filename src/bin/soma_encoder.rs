// soma_encoder - command line front-end
// Runs one probe or extraction against the configured engine binaries and
// prints the result as JSON. Ctrl-C cancels the operation and stops any
// engine process still running.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use soma_encoder::interval::count_images;
use soma_encoder::{
    engine_available, EncoderConfig, InputDescriptor, IntervalRequest, MediaEncoder,
    MediaInfoRequest, MediaProtocol, Video3DFormat,
};

#[derive(Parser)]
#[command(name = "soma_encoder", version, about = "SOMA Encoder - ffprobe/ffmpeg orchestration")]
struct Args {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the ffmpeg binary
    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    /// Override the ffprobe binary
    #[arg(long)]
    ffprobe: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe a media item and print its MediaInfo
    Probe {
        path: String,

        #[arg(long, value_enum, default_value_t = Protocol::File)]
        protocol: Protocol,

        /// Treat the item as audio
        #[arg(long)]
        audio: bool,

        #[arg(long)]
        chapters: bool,

        /// Attach keyframe offsets to eligible video streams
        #[arg(long)]
        keyframes: bool,

        /// Mount point of a disc image
        #[arg(long)]
        mount: Option<PathBuf>,

        /// Playable stream file to concatenate (repeatable, in order)
        #[arg(long = "stream-file")]
        stream_files: Vec<String>,
    },

    /// Print keyframe offsets (ms) for one video stream
    Keyframes {
        path: String,

        /// Ordinal of the video stream
        #[arg(long, default_value_t = 0)]
        stream: usize,
    },

    /// Extract a single still image
    Image {
        /// One or more inputs; several are concatenated
        #[arg(required = true)]
        inputs: Vec<String>,

        #[arg(long, value_enum, default_value_t = Protocol::File)]
        protocol: Protocol,

        /// Extract embedded cover art from an audio file
        #[arg(long)]
        audio: bool,

        /// Seek offset in seconds
        #[arg(long)]
        offset: Option<f64>,

        #[arg(long, value_enum)]
        stereo: Option<Stereo>,

        /// Where to write the image
        #[arg(long, short)]
        output: PathBuf,
    },

    /// Write one JPEG per interval into a directory
    Interval {
        #[arg(required = true)]
        inputs: Vec<String>,

        #[arg(long, value_enum, default_value_t = Protocol::File)]
        protocol: Protocol,

        #[arg(long)]
        output_dir: PathBuf,

        /// Seconds between images
        #[arg(long, default_value_t = 10.0)]
        interval: f64,

        #[arg(long, default_value = "img_")]
        prefix: String,

        #[arg(long)]
        max_width: Option<u32>,

        #[arg(long, value_enum)]
        stereo: Option<Stereo>,
    },

    /// Check that the engine binaries run
    Check,
}

#[derive(Clone, Copy, ValueEnum)]
enum Protocol {
    File,
    Http,
    Rtmp,
    Rtsp,
    Udp,
    Rtp,
}

impl From<Protocol> for MediaProtocol {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::File => MediaProtocol::File,
            Protocol::Http => MediaProtocol::Http,
            Protocol::Rtmp => MediaProtocol::Rtmp,
            Protocol::Rtsp => MediaProtocol::Rtsp,
            Protocol::Udp => MediaProtocol::Udp,
            Protocol::Rtp => MediaProtocol::Rtp,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Stereo {
    Hsbs,
    Fsbs,
    Htab,
    Ftab,
}

impl From<Stereo> for Video3DFormat {
    fn from(stereo: Stereo) -> Self {
        match stereo {
            Stereo::Hsbs => Video3DFormat::HalfSideBySide,
            Stereo::Fsbs => Video3DFormat::FullSideBySide,
            Stereo::Htab => Video3DFormat::HalfTopAndBottom,
            Stereo::Ftab => Video3DFormat::FullTopAndBottom,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EncoderConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EncoderConfig::default(),
    };
    if let Some(ffmpeg) = args.ffmpeg {
        config.ffmpeg_path = ffmpeg;
    }
    if let Some(ffprobe) = args.ffprobe {
        config.ffprobe_path = ffprobe;
    }

    let encoder = MediaEncoder::new(config);
    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    let outcome = run(&encoder, args.command, &cancel).await;
    encoder.shutdown().await;

    let output = outcome?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(
    encoder: &MediaEncoder,
    command: Command,
    cancel: &CancellationToken,
) -> Result<serde_json::Value> {
    match command {
        Command::Probe {
            path,
            protocol,
            audio,
            chapters,
            keyframes,
            mount,
            stream_files,
        } => {
            let input = InputDescriptor {
                path,
                protocol: protocol.into(),
                mounted_path: mount,
                playable_stream_files: stream_files,
            };
            let mut request = if audio {
                MediaInfoRequest::audio(input)
            } else {
                MediaInfoRequest::video(input)
            };
            request.extract_chapters = chapters;
            request.extract_keyframes = keyframes;

            let info = encoder
                .get_media_info(&request, cancel)
                .await
                .context("Probe failed")?;
            Ok(serde_json::to_value(info)?)
        }

        Command::Keyframes { path, stream } => {
            let keyframes = encoder
                .extract_keyframes(&path, stream, cancel)
                .await
                .context("Keyframe extraction failed")?;
            Ok(json!({ "path": path, "stream": stream, "keyframes_ms": keyframes }))
        }

        Command::Image {
            inputs,
            protocol,
            audio,
            offset,
            stereo,
            output,
        } => {
            let offset = offset.map(seconds).transpose()?;
            let extracted = if audio {
                let path = inputs.first().context("No input given")?;
                encoder.extract_audio_image(path, cancel).await
            } else {
                encoder
                    .extract_video_image(
                        &inputs,
                        protocol.into(),
                        stereo.map(Into::into),
                        offset,
                        cancel,
                    )
                    .await
            };
            let bytes = extracted.context("Image extraction failed")?;

            let mime = infer::get(&bytes)
                .map(|kind| kind.mime_type())
                .unwrap_or("application/octet-stream");
            tokio::fs::write(&output, &bytes)
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!("Wrote {} bytes to {}", bytes.len(), output.display());

            Ok(json!({
                "output": output,
                "bytes": bytes.len(),
                "mime_type": mime,
            }))
        }

        Command::Interval {
            inputs,
            protocol,
            output_dir,
            interval,
            prefix,
            max_width,
            stereo,
        } => {
            let request = IntervalRequest {
                inputs,
                protocol: protocol.into(),
                stereo_format: stereo.map(Into::into),
                interval: seconds(interval)?,
                output_dir,
                filename_prefix: prefix,
                max_width,
            };

            encoder
                .extract_video_images_on_interval(&request, cancel)
                .await
                .context("Interval extraction failed")?;

            Ok(json!({
                "output_dir": request.output_dir,
                "images": count_images(&request.output_dir).await,
            }))
        }

        Command::Check => {
            let config = encoder.config();
            let ffmpeg = engine_available(&config.ffmpeg_path).await;
            let ffprobe = engine_available(&config.ffprobe_path).await;
            if !ffmpeg || !ffprobe {
                warn!(ffmpeg, ffprobe, "Engine binaries missing");
            }
            Ok(json!({
                "ffmpeg": { "path": config.ffmpeg_path, "available": ffmpeg },
                "ffprobe": { "path": config.ffprobe_path, "available": ffprobe },
            }))
        }
    }
}

fn seconds(value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("Invalid number of seconds: {}", value))
}
