//! FFmpeg/FFprobe command line builder

use crate::process::ProcessSpec;
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// Builds the argument vector for one prober or encoder invocation.
/// Nothing is run here; [`FfmpegCommand::into_spec`] hands the result to the
/// process supervisor.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl FfmpegCommand {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
        }
    }

    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.args.push("-i".to_string());
        self.args.push(input.into());
        self
    }

    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.args.push(output.into());
        self
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|s| s.to_string()));
        self
    }

    pub fn extend<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn into_spec(self) -> ProcessSpec {
        ProcessSpec::new(self.program).args(self.args)
    }
}

/// Whether `<program> -version` runs successfully
pub async fn engine_available(program: impl AsRef<Path>) -> bool {
    tokio::process::Command::new(program.as_ref())
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}
