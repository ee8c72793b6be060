//! FPGA sync pulse trains saved by the ephys acquisition.

use camino::{Utf8Path, Utf8PathBuf};
use ndarray::Array1;
use ndarray_npy::{ReadNpyError, read_npy};

use crate::error::ExtractError;

/// Default collection holding the sync files.
pub const SYNC_COLLECTION: &str = "raw_ephys_data";

/// Where to find the sync train and which channel carries the behaviour pulses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSources {
    pub collection: String,
    pub bpod_channel: u32,
}

impl Default for SyncSources {
    fn default() -> Self {
        Self {
            collection: SYNC_COLLECTION.into(),
            bpod_channel: crate::config::BPOD_CHANNEL,
        }
    }
}

/// Every front detected on every digital channel of a probe.
#[derive(Debug, Clone)]
pub struct SyncTrain {
    pub times: Array1<f64>,
    pub channels: Array1<f64>,
    pub polarities: Array1<f64>,
}

/// The fronts of a single channel.
#[derive(Debug, Clone, Default)]
pub struct Fronts {
    pub times: Vec<f64>,
    pub polarities: Vec<f64>,
}

/// Read a one dimensional numeric array, whatever its integer or float type.
pub(crate) fn read_numeric(path: &Utf8Path) -> Result<Array1<f64>, ExtractError> {
    let wrap = |source: ReadNpyError| ExtractError::ReadArray {
        path: path.to_path_buf(),
        source,
    };

    match read_npy::<_, Array1<f64>>(path) {
        Ok(array) => return Ok(array),
        Err(ReadNpyError::WrongDescriptor(_)) => {}
        Err(err) => return Err(wrap(err)),
    }
    if let Ok(array) = read_npy::<_, Array1<f32>>(path) {
        return Ok(array.mapv(f64::from));
    }
    if let Ok(array) = read_npy::<_, Array1<i16>>(path) {
        return Ok(array.mapv(f64::from));
    }
    if let Ok(array) = read_npy::<_, Array1<i32>>(path) {
        return Ok(array.mapv(f64::from));
    }
    read_npy::<_, Array1<i64>>(path)
        .map(|array| array.mapv(|v| v as f64))
        .map_err(wrap)
}

impl SyncTrain {
    /// Load the main probe sync of a session.
    ///
    /// The shallowest `_spikeglx_sync.times*.npy` below the collection wins, so
    /// a NI-DAQ sync at the top of the collection takes precedence over the
    /// per-probe ones.
    pub fn load(session_path: &Utf8Path, collection: &str) -> Result<Self, ExtractError> {
        let root = session_path.join(collection);
        let pattern = format!(
            "{}/**/_spikeglx_sync.times*.npy",
            glob::Pattern::escape(root.as_str())
        );

        let mut found = Vec::new();
        for entry in glob::glob(&pattern)? {
            found.push(Utf8PathBuf::try_from(entry?)?);
        }
        found.sort_by_key(|p| (p.components().count(), p.clone()));

        let times_path = found
            .into_iter()
            .next()
            .ok_or_else(|| ExtractError::FileNotFound(pattern.clone()))?;
        let sibling = |attribute: &str| -> Utf8PathBuf {
            let name = times_path
                .file_name()
                .unwrap_or_default()
                .replacen(".times", &format!(".{attribute}"), 1);
            times_path.with_file_name(name)
        };

        tracing::debug!("loading sync train from {}", times_path);
        let train = Self {
            times: read_numeric(&times_path)?,
            channels: read_numeric(&sibling("channels"))?,
            polarities: read_numeric(&sibling("polarities"))?,
        };

        if train.channels.len() != train.times.len()
            || train.polarities.len() != train.times.len()
        {
            return Err(ExtractError::SyncShape(format!(
                "{} times, {} channels, {} polarities",
                train.times.len(),
                train.channels.len(),
                train.polarities.len()
            )));
        }

        Ok(train)
    }

    pub fn fronts(&self, channel: u32) -> Fronts {
        let channel = f64::from(channel);
        let mut fronts = Fronts::default();
        for ((&t, &c), &p) in self.times.iter().zip(&self.channels).zip(&self.polarities) {
            if c == channel {
                fronts.times.push(t);
                fronts.polarities.push(p);
            }
        }
        fronts
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use ndarray_npy::write_npy;

    use super::*;

    fn write_train(dir: &Utf8Path) {
        std::fs::create_dir_all(dir).unwrap();
        write_npy(dir.join("_spikeglx_sync.times.npy"), &array![0.1, 0.2, 0.3, 0.4]).unwrap();
        write_npy(dir.join("_spikeglx_sync.channels.npy"), &array![16i64, 3, 16, 16]).unwrap();
        write_npy(dir.join("_spikeglx_sync.polarities.npy"), &array![1.0, 1.0, -1.0, 1.0]).unwrap();
    }

    #[test]
    fn test_load_and_fronts() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        write_train(&session.join("raw_ephys_data"));

        let train = SyncTrain::load(&session, SYNC_COLLECTION).unwrap();
        let bpod = train.fronts(16);
        assert_eq!(bpod.times, [0.1, 0.3, 0.4]);
        assert_eq!(bpod.polarities, [1.0, -1.0, 1.0]);
        assert!(train.fronts(2).times.is_empty());
    }

    #[test]
    fn test_shallowest_sync_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let probe = session.join("raw_ephys_data/probe00");
        std::fs::create_dir_all(&probe).unwrap();
        write_npy(probe.join("_spikeglx_sync.times.probe00.npy"), &array![9.0]).unwrap();
        write_npy(probe.join("_spikeglx_sync.channels.probe00.npy"), &array![16i64]).unwrap();
        write_npy(probe.join("_spikeglx_sync.polarities.probe00.npy"), &array![1.0]).unwrap();

        let train = SyncTrain::load(&session, SYNC_COLLECTION).unwrap();
        assert_eq!(train.times.to_vec(), [9.0]);

        write_train(&session.join("raw_ephys_data"));
        let train = SyncTrain::load(&session, SYNC_COLLECTION).unwrap();
        assert_eq!(train.times.len(), 4);
    }

    #[test]
    fn test_missing_sync() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();

        assert!(matches!(
            SyncTrain::load(&session, SYNC_COLLECTION),
            Err(ExtractError::FileNotFound(_))
        ));
    }
}
