//! Widefield imaging extraction.
//!
//! A raw session holds the imaging stack, the camera log and the camera video
//! under `raw_widefield_data`. Extraction runs the preprocessing chain over the
//! stack, aligns the frames onto the FPGA clock and moves the products to
//! their standard dataset names.

mod camlog;
pub mod clock;
mod sync;
mod toolkit;
mod video;

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use ndarray::Array1;
use ndarray_npy::write_npy;

use crate::error::ExtractError;

pub use camlog::{CamLog, FrameRecord, LedEvent, SyncEvent};
pub use sync::{Fronts, SYNC_COLLECTION, SyncSources, SyncTrain};
pub use toolkit::{PreprocessParams, WfieldCli, WidefieldToolkit};
pub use video::{FfprobeVideo, VideoProbe};

/// Collection holding the raw widefield data.
pub const RAW_COLLECTION: &str = "raw_widefield_data";

/// Raw output file and its dataset path relative to the session.
pub const FILENAME_MAP: &[(&str, &str)] = &[
    (
        "frames_average.npy",
        "raw_widefield_data/widefieldChannels.frameAverage.npy",
    ),
    ("U.npy", "alf/widefieldU.images.npy"),
    ("SVT.npy", "alf/widefieldSVT.uncorrected.npy"),
    ("SVTcorr.npy", "alf/widefieldSVT.haemoCorrected.npy"),
    ("timestamps.npy", "alf/widefield.times.npy"),
    ("led.npy", "alf/widefield.widefieldLightSource.npy"),
];

/// Frame times on the FPGA clock and the LED lit for each frame.
#[derive(Debug, Clone)]
pub struct WidefieldTimes {
    pub times: Array1<f64>,
    pub leds: Array1<i64>,
    pub drift_ppm: f64,
}

#[derive(Debug, Clone)]
pub struct Widefield {
    session_path: Utf8PathBuf,
    data_path: Utf8PathBuf,
}

impl Widefield {
    pub fn new(session_path: impl Into<Utf8PathBuf>) -> Self {
        let session_path = session_path.into();
        let data_path = session_path.join(RAW_COLLECTION);
        Self {
            session_path,
            data_path,
        }
    }

    pub fn session_path(&self) -> &Utf8Path {
        &self.session_path
    }

    pub fn data_path(&self) -> &Utf8Path {
        &self.data_path
    }

    /// Files in the raw folder matching `pattern`, sorted.
    fn glob(&self, pattern: &str) -> Result<Vec<Utf8PathBuf>, ExtractError> {
        let full = format!("{}/{}", glob::Pattern::escape(self.data_path.as_str()), pattern);
        let mut found = Vec::new();
        for entry in glob::glob(&full)? {
            found.push(Utf8PathBuf::try_from(entry?)?);
        }
        found.sort();
        Ok(found)
    }

    fn find_one(&self, pattern: &str) -> Result<Utf8PathBuf, ExtractError> {
        let mut found = self.glob(pattern)?;
        if found.len() > 1 {
            tracing::warn!("{} files match {}, using {}", found.len(), pattern, found[0]);
        }
        if found.is_empty() {
            return Err(ExtractError::FileNotFound(format!("{}/{}", self.data_path, pattern)));
        }
        Ok(found.swap_remove(0))
    }

    /// Motion correction, baseline, decomposition, and haemodynamic correction
    /// for two-channel stacks.
    pub fn preprocess(
        &self,
        toolkit: &dyn WidefieldToolkit,
        params: &PreprocessParams,
    ) -> Result<(), ExtractError> {
        let data = self.data_path.as_path();
        let step = |step: &'static str| {
            move |source: anyhow::Error| ExtractError::Toolkit { step, source }
        };

        tracing::info!("motion correction");
        toolkit.motion(data).map_err(step("motion"))?;

        tracing::info!("baseline over {} frames", params.nbaseline_frames);
        toolkit
            .baseline(data, params.nbaseline_frames)
            .map_err(step("baseline"))?;

        tracing::info!("decomposition with k = {}", params.k);
        toolkit.decompose(data, params.k).map_err(step("decompose"))?;

        let channels = toolkit.channel_count(data).map_err(step("channel_count"))?;
        if channels == 2 {
            tracing::info!("haemodynamic correction");
            toolkit
                .hemocorrect(data, params.fs, params.functional_channel)
                .map_err(step("hemocorrect"))?;
        } else {
            tracing::info!("{} channel stack, skipping haemodynamic correction", channels);
        }

        Ok(())
    }

    /// Time every video frame on the FPGA clock.
    pub fn sync_timestamps(
        &self,
        sources: &SyncSources,
        video: &dyn VideoProbe,
    ) -> Result<WidefieldTimes, ExtractError> {
        let log = CamLog::read(self.find_one("*.camlog")?)?;

        let train = SyncTrain::load(&self.session_path, &sources.collection)?;
        let bpod = train.fronts(sources.bpod_channel);
        if bpod.times.is_empty() {
            return Err(ExtractError::SyncBpodFpga);
        }

        let clock = clock::sync_timestamps(&log.sync_seconds(), &bpod.times, clock::DEFAULT_TBIN)?;
        tracing::debug!("Widefield-FPGA clock drift: {} ppm", clock.drift_ppm);

        if log.leds.windows(2).any(|w| w[1].frame < w[0].frame) {
            return Err(ExtractError::NonMonotonicFrames);
        }

        let video_path = self.find_one("widefield.raw*.mov")?;
        let frames = video
            .frame_count(&video_path)
            .map_err(|source| ExtractError::Video {
                path: video_path.clone(),
                source,
            })?;

        let leds = log.leds.len();
        if leds < frames {
            return Err(ExtractError::MoreFramesThanTimestamps { frames, leds });
        }
        if leds - frames > 2 {
            return Err(ExtractError::FrameCountMismatch { frames, leds });
        }

        let kept = &log.leds[..frames];
        let camera: Array1<f64> = kept.iter().map(|e| e.timestamp / 1e3).collect();

        Ok(WidefieldTimes {
            times: clock.apply_all(camera.view()),
            leds: kept.iter().map(|e| e.led).collect(),
            drift_ppm: clock.drift_ppm,
        })
    }

    /// Write `timestamps.npy` and `led.npy` to the raw folder.
    pub fn save_timestamps(
        &self,
        times: &WidefieldTimes,
    ) -> Result<[Utf8PathBuf; 2], ExtractError> {
        fs::create_dir_all(&self.data_path)?;
        let times_path = self.data_path.join("timestamps.npy");
        let leds_path = self.data_path.join("led.npy");

        write_npy(&times_path, &times.times).map_err(|source| ExtractError::WriteArray {
            path: times_path.clone(),
            source,
        })?;
        write_npy(&leds_path, &times.leds).map_err(|source| ExtractError::WriteArray {
            path: leds_path.clone(),
            source,
        })?;

        Ok([times_path, leds_path])
    }

    /// Move the raw outputs to their dataset names. Missing files are logged
    /// and skipped.
    pub fn rename_outputs(&self) -> Result<Vec<Utf8PathBuf>, ExtractError> {
        let mut moved = Vec::new();
        if !self.data_path.exists() {
            tracing::warn!("Path does not exist: {}", self.data_path);
            return Ok(moved);
        }

        for (raw, dataset) in FILENAME_MAP {
            let from = self.data_path.join(raw);
            if !from.exists() {
                tracing::warn!("File not found: {}", raw);
                continue;
            }

            let to = self.session_path.join(dataset);
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&from, &to)?;
            tracing::debug!("moved {} to {}", from, to);
            moved.push(to);
        }

        Ok(moved)
    }

    /// Delete the raw files whose name starts with `prefix`, such as the
    /// motion corrected stack once it has been decomposed.
    pub fn remove_files(&self, prefix: &str) -> Result<Vec<Utf8PathBuf>, ExtractError> {
        let pattern = format!("{}*", glob::Pattern::escape(prefix));
        let files = self.glob(&pattern)?;
        for file in &files {
            tracing::info!("Removing {}", file);
            fs::remove_file(file)?;
        }
        Ok(files)
    }

    /// Preprocess the stack, optionally time the frames, then move everything
    /// to its dataset name.
    pub fn extract(
        &self,
        toolkit: &dyn WidefieldToolkit,
        params: &PreprocessParams,
        timestamps: Option<(&SyncSources, &dyn VideoProbe)>,
    ) -> Result<Vec<Utf8PathBuf>, ExtractError> {
        self.preprocess(toolkit, params)?;

        if let Some((sources, video)) = timestamps {
            let times = self.sync_timestamps(sources, video)?;
            self.save_timestamps(&times)?;
        }

        self.rename_outputs()
    }
}
