use std::process::Command;

use anyhow::{Context, bail};
use camino::{Utf8Path, Utf8PathBuf};
use ndarray::ArrayD;
use ndarray_npy::read_npy;
use serde::{Deserialize, Serialize};

/// Settings of the preprocessing chain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessParams {
    /// Frame rate of the stack, in Hz.
    pub fs: f64,
    /// Channel holding the calcium signal, the other one is the isosbestic.
    pub functional_channel: usize,
    /// Number of frames averaged into the baseline.
    pub nbaseline_frames: usize,
    /// Number of SVD components kept.
    pub k: usize,
}

impl Default for PreprocessParams {
    fn default() -> Self {
        Self {
            fs: 30.0,
            functional_channel: 0,
            nbaseline_frames: 30,
            k: 200,
        }
    }
}

/// The image processing steps applied to a raw widefield stack.
///
/// Every step reads its inputs from and writes its outputs to `data_path`.
pub trait WidefieldToolkit {
    fn motion(&self, data_path: &Utf8Path) -> anyhow::Result<()>;

    /// Writes `frames_average.npy`.
    fn baseline(&self, data_path: &Utf8Path, nbaseline_frames: usize) -> anyhow::Result<()>;

    /// Writes `U.npy` and `SVT.npy`.
    fn decompose(&self, data_path: &Utf8Path, k: usize) -> anyhow::Result<()>;

    /// Number of interleaved light channels in the stack.
    fn channel_count(&self, data_path: &Utf8Path) -> anyhow::Result<usize>;

    /// Writes `SVTcorr.npy`.
    fn hemocorrect(
        &self,
        data_path: &Utf8Path,
        fs: f64,
        functional_channel: usize,
    ) -> anyhow::Result<()>;
}

/// Runs the steps through the `wfield` command line tool.
#[derive(Debug, Clone)]
pub struct WfieldCli {
    program: Utf8PathBuf,
}

impl Default for WfieldCli {
    fn default() -> Self {
        Self::new("wfield")
    }
}

impl WfieldCli {
    pub fn new(program: impl Into<Utf8PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, step: &str, data_path: &Utf8Path, extra: &[String]) -> anyhow::Result<()> {
        let mut command = Command::new(self.program.as_std_path());
        command.arg(step).arg(data_path.as_std_path()).args(extra);
        tracing::info!("running {} {} on {}", self.program, step, data_path);

        let output = command
            .output()
            .with_context(|| format!("couldn't start {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!("{} {} failed with status {}", self.program, step, output.status);
            bail!("{} {} exited with {}: {}", self.program, step, output.status, stderr.trim());
        }
        Ok(())
    }
}

impl WidefieldToolkit for WfieldCli {
    fn motion(&self, data_path: &Utf8Path) -> anyhow::Result<()> {
        self.run("motion", data_path, &[])
    }

    fn baseline(&self, data_path: &Utf8Path, nbaseline_frames: usize) -> anyhow::Result<()> {
        self.run(
            "baseline",
            data_path,
            &["--nbaseline-frames".into(), nbaseline_frames.to_string()],
        )
    }

    fn decompose(&self, data_path: &Utf8Path, k: usize) -> anyhow::Result<()> {
        self.run("decompose", data_path, &["-k".into(), k.to_string()])
    }

    /// Read off the frame average, shaped `(channels, height, width)`.
    fn channel_count(&self, data_path: &Utf8Path) -> anyhow::Result<usize> {
        let path = data_path.join("frames_average.npy");
        let shape = match read_npy::<_, ArrayD<f32>>(&path) {
            Ok(average) => average.shape().to_vec(),
            Err(_) => read_npy::<_, ArrayD<f64>>(&path)
                .with_context(|| format!("reading {path}"))?
                .shape()
                .to_vec(),
        };

        match shape.as_slice() {
            [channels, _, _] => Ok(*channels),
            [_, _] => Ok(1),
            other => bail!("unexpected frame average shape {:?}", other),
        }
    }

    fn hemocorrect(
        &self,
        data_path: &Utf8Path,
        fs: f64,
        functional_channel: usize,
    ) -> anyhow::Result<()> {
        self.run(
            "hemocorrect",
            data_path,
            &[
                "--fs".into(),
                fs.to_string(),
                "--functional-channel".into(),
                functional_channel.to_string(),
            ],
        )
    }
}
