use std::process::Command;

use anyhow::{Context, bail};
use camino::{Utf8Path, Utf8PathBuf};

/// Reads metadata from a video file.
pub trait VideoProbe {
    /// Number of frames in the video.
    fn frame_count(&self, path: &Utf8Path) -> anyhow::Result<usize>;
}

/// Counts frames with `ffprobe`.
#[derive(Debug, Clone)]
pub struct FfprobeVideo {
    program: Utf8PathBuf,
}

impl Default for FfprobeVideo {
    fn default() -> Self {
        Self {
            program: "ffprobe".into(),
        }
    }
}

impl FfprobeVideo {
    pub fn new(program: impl Into<Utf8PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

fn parse_frame_count(stdout: &str) -> anyhow::Result<usize> {
    let value = stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .context("ffprobe printed nothing")?;
    value
        .trim_end_matches(',')
        .parse()
        .with_context(|| format!("ffprobe printed '{value}'"))
}

impl VideoProbe for FfprobeVideo {
    fn frame_count(&self, path: &Utf8Path) -> anyhow::Result<usize> {
        let output = Command::new(self.program.as_std_path())
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-count_packets",
                "-show_entries",
                "stream=nb_read_packets",
                "-of",
                "csv=p=0",
            ])
            .arg(path.as_std_path())
            .output()
            .with_context(|| format!("couldn't start {}", self.program))?;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_frame_count(&String::from_utf8_lossy(&output.stdout))
    }
}
