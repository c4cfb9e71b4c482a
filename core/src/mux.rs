use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{CoreError, CoreResult};

/// Rewraps a finished transport stream into another container.
pub trait Muxer: Send + Sync {
    fn mux(&self, input: &Path, output: &Path) -> CoreResult<()>;
}

/// Stream copy through an `ffmpeg` binary, no re-encoding.
pub struct FfmpegMuxer {
    program: PathBuf,
}

impl FfmpegMuxer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for FfmpegMuxer {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl Muxer for FfmpegMuxer {
    fn mux(&self, input: &Path, output: &Path) -> CoreResult<()> {
        let result = Command::new(&self.program)
            .arg("-y")
            .arg("-i")
            .arg(input)
            .args(["-c", "copy"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();
        let result = match result {
            Ok(result) => result,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CoreError::Muxing(format!(
                    "{} not found",
                    self.program.display()
                )))
            }
            Err(err) => return Err(CoreError::Muxing(err.to_string())),
        };
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(3).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(CoreError::Muxing(format!(
                "{} exited with {}: {}",
                self.program.display(),
                result.status,
                tail.join(" | ")
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_is_a_muxing_error() {
        let muxer = FfmpegMuxer::new("/nonexistent/hlsdl-ffmpeg");
        let dir = tempfile::tempdir().unwrap();
        let err = muxer
            .mux(&dir.path().join("in.ts"), &dir.path().join("out.mp4"))
            .unwrap_err();
        assert!(matches!(err, CoreError::Muxing(_)), "{err}");
    }
}
