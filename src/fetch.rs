//! Downloading datasets from a bucket mirror into the local cache.

use std::fs;
use std::sync::LazyLock;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::Params;
use crate::error::FetchError;
use crate::one::DatasetRecord;
use crate::one::alf::add_uuid_string;

static PROGRESS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
});

/// A remote store of objects addressed by POSIX-style keys.
pub trait ObjectStore: Send + Sync {
    /// Bucket name, for log messages.
    fn name(&self) -> &str;

    /// Every key starting with `prefix`.
    fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>>;

    /// Copy the object at `key` to `dest`. The parent directory exists, and a
    /// failed call may leave a partial file behind.
    fn download(&self, key: &str, dest: &Utf8Path) -> anyhow::Result<()>;
}

/// An object store backed by a local directory, such as a mounted bucket.
#[derive(Debug, Clone)]
pub struct LocalBucket {
    name: String,
    root: Utf8PathBuf,
}

impl LocalBucket {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        let root = root.into();
        let name = root.file_name().unwrap_or(root.as_str()).to_string();
        Self { name, root }
    }

    fn walk(&self, dir: &Utf8Path, keys: &mut Vec<String>) -> anyhow::Result<()> {
        for entry in dir.read_dir_utf8()? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.walk(path, keys)?;
            } else if let Ok(key) = path.strip_prefix(&self.root) {
                keys.push(key.as_str().replace('\\', "/"));
            }
        }
        Ok(())
    }
}

impl ObjectStore for LocalBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        // only walk the deepest directory the prefix names
        let dir = match prefix.rsplit_once('/') {
            Some((dir, _)) => self.root.join(dir),
            None => self.root.clone(),
        };
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        self.walk(&dir, &mut keys)?;
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn download(&self, key: &str, dest: &Utf8Path) -> anyhow::Result<()> {
        let source = self.root.join(key);
        fs::copy(&source, dest).with_context(|| format!("copying {source} to {dest}"))?;
        Ok(())
    }
}

/// Outcome of a download pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub downloaded: Vec<Utf8PathBuf>,
    pub skipped_existing: Vec<Utf8PathBuf>,
    /// Remote keys with no matching object.
    pub missing: Vec<String>,
    /// Remote keys matching more than one object.
    pub ambiguous: Vec<String>,
}

pub struct Fetcher<'a> {
    store: &'a dyn ObjectStore,
    params: &'a Params,
}

impl<'a> Fetcher<'a> {
    pub fn new(store: &'a dyn ObjectStore, params: &'a Params) -> Self {
        Self { store, params }
    }

    /// Remote key of a dataset, `<aws_root>/<session_path>/<rel_path>` with the
    /// dataset UUID inserted into the file name.
    pub fn remote_key(&self, record: &DatasetRecord) -> String {
        let tagged = add_uuid_string(record.relative_file(), &record.id);
        let key = format!("{}/{}", self.params.aws_root.trim_end_matches('/'), tagged);
        key.replace('\\', "/")
    }

    /// Download every dataset that is not already present in the cache.
    ///
    /// Existing files are never overwritten.
    pub fn download_datasets(
        &self,
        datasets: &[DatasetRecord],
    ) -> Result<FetchReport, FetchError> {
        let mut report = FetchReport::default();

        let pb = ProgressBar::new(datasets.len() as u64);
        pb.set_style(PROGRESS_STYLE.clone());
        pb.set_message(format!("Fetching from {}...", self.store.name()));

        for record in datasets {
            let file = self.params.cache_dir.join(record.relative_file());
            if let Some(parent) = file.parent() {
                fs::create_dir_all(parent)?;
            }

            if file.exists() {
                tracing::warn!("{} already exists, won't redownload", file);
                report.skipped_existing.push(file);
                pb.inc(1);
                continue;
            }

            let key = self.remote_key(record);
            let objects = self
                .store
                .list(&key)
                .map_err(|source| FetchError::List {
                    bucket: self.store.name().to_string(),
                    source,
                })?;

            match objects.as_slice() {
                [only] if *only == key => {
                    tracing::debug!("downloading {} to {}", key, file);
                    self.fetch_one(&key, &file)?;
                    report.downloaded.push(file);
                }
                [] | [_] => {
                    tracing::warn!("{} not found on bucket {}", key, self.store.name());
                    report.missing.push(key);
                }
                many => {
                    tracing::warn!(
                        "{} matches {} objects on bucket {}",
                        key,
                        many.len(),
                        self.store.name()
                    );
                    report.ambiguous.push(key);
                }
            }
            pb.inc(1);
        }

        pb.finish_with_message(format!(
            "Fetched {} datasets from {}",
            report.downloaded.len(),
            self.store.name()
        ));

        Ok(report)
    }

    /// Download into a sibling `.part` file, then rename it over `file`. A
    /// partial download never sits at the final path.
    fn fetch_one(&self, key: &str, file: &Utf8Path) -> Result<(), FetchError> {
        let partial = Utf8PathBuf::from(format!("{file}.part"));

        if let Err(source) = self.store.download(key, &partial) {
            if partial.exists() {
                let _ = fs::remove_file(&partial);
            }
            return Err(FetchError::Download {
                bucket: self.store.name().to_string(),
                key: key.to_string(),
                source,
            });
        }

        fs::rename(&partial, file)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    const SESSION: &str = "angelakilab/Subjects/FMR019/2021-03-18/002";
    const WHEEL_ID: &str = "257ff7ae-9ab4-35dc-bac0-245cdc81f6d1";

    fn utf8(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap()
    }

    fn wheel() -> DatasetRecord {
        DatasetRecord::new(
            Uuid::parse_str(WHEEL_ID).unwrap(),
            SESSION,
            "alf/_ibl_wheel.position.npy",
        )
    }

    fn put(root: &Utf8Path, key: &str, contents: &str) {
        let path = root.join(key);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_remote_key() {
        let params = Params::new("/cache");
        let bucket = LocalBucket::new("/nowhere/ibl-brain-wide-map");
        let fetcher = Fetcher::new(&bucket, &params);

        assert_eq!(
            fetcher.remote_key(&wheel()),
            "aws_spikesorting/angelakilab/Subjects/FMR019/2021-03-18/002/alf/_ibl_wheel.position.257ff7ae-9ab4-35dc-bac0-245cdc81f6d1.npy"
        );
        assert_eq!(bucket.name(), "ibl-brain-wide-map");
    }

    #[test]
    fn test_download_skip_and_missing() {
        let remote = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let bucket = LocalBucket::new(utf8(&remote));
        let params = Params::new(utf8(&cache));
        let fetcher = Fetcher::new(&bucket, &params);

        let key = fetcher.remote_key(&wheel());
        put(&utf8(&remote), &key, "wheel");

        let present = DatasetRecord::new(Uuid::nil(), SESSION, "alf/_ibl_trials.table.pqt");
        put(&utf8(&cache), &present.relative_file().to_string(), "local copy");

        let absent = DatasetRecord::new(
            Uuid::parse_str("6d1e6c64-2b9a-4b8c-8f1e-0c3f3d9a7b21").unwrap(),
            SESSION,
            "alf/_ibl_wheel.timestamps.npy",
        );

        let report = fetcher
            .download_datasets(&[wheel(), present.clone(), absent.clone()])
            .unwrap();

        let wheel_file = utf8(&cache).join(SESSION).join("alf/_ibl_wheel.position.npy");
        assert_eq!(report.downloaded, vec![wheel_file.clone()]);
        assert_eq!(fs::read_to_string(wheel_file).unwrap(), "wheel");

        assert_eq!(report.skipped_existing.len(), 1);
        let kept = utf8(&cache).join(present.relative_file());
        assert_eq!(fs::read_to_string(kept).unwrap(), "local copy");

        assert_eq!(report.missing, vec![fetcher.remote_key(&absent)]);
        assert!(report.ambiguous.is_empty());
    }

    #[test]
    fn test_ambiguous_prefix_is_not_downloaded() {
        let remote = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let bucket = LocalBucket::new(utf8(&remote));
        let params = Params::new(utf8(&cache));
        let fetcher = Fetcher::new(&bucket, &params);

        let key = fetcher.remote_key(&wheel());
        put(&utf8(&remote), &key, "wheel");
        put(&utf8(&remote), &format!("{key}.bak"), "old wheel");

        let report = fetcher.download_datasets(&[wheel()]).unwrap();
        assert_eq!(report.ambiguous, vec![key]);
        assert!(report.downloaded.is_empty());
        assert!(!utf8(&cache).join(wheel().relative_file()).exists());
    }

    #[test]
    fn test_lone_lookalike_key_counts_as_missing() {
        let remote = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let bucket = LocalBucket::new(utf8(&remote));
        let params = Params::new(utf8(&cache));
        let fetcher = Fetcher::new(&bucket, &params);

        let key = fetcher.remote_key(&wheel());
        put(&utf8(&remote), &format!("{key}.partial"), "half a wheel");

        let timestamps = DatasetRecord::new(
            Uuid::parse_str("6d1e6c64-2b9a-4b8c-8f1e-0c3f3d9a7b21").unwrap(),
            SESSION,
            "alf/_ibl_wheel.timestamps.npy",
        );
        put(&utf8(&remote), &fetcher.remote_key(&timestamps), "timestamps");

        let report = fetcher
            .download_datasets(&[wheel(), timestamps.clone()])
            .unwrap();
        assert_eq!(report.missing, vec![key]);
        assert_eq!(
            report.downloaded,
            vec![utf8(&cache).join(timestamps.relative_file())]
        );
        assert!(!utf8(&cache).join(wheel().relative_file()).exists());
    }

    struct BrokenStore;

    impl ObjectStore for BrokenStore {
        fn name(&self) -> &str {
            "broken"
        }

        fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
            Ok(vec![prefix.to_string()])
        }

        fn download(&self, _key: &str, dest: &Utf8Path) -> anyhow::Result<()> {
            fs::write(dest, "trunc")?;
            anyhow::bail!("connection reset")
        }
    }

    #[test]
    fn test_interrupted_download_leaves_no_file() {
        let cache = tempfile::tempdir().unwrap();
        let params = Params::new(utf8(&cache));
        let store = BrokenStore;
        let fetcher = Fetcher::new(&store, &params);

        let err = fetcher.download_datasets(&[wheel()]).unwrap_err();
        assert!(matches!(err, FetchError::Download { .. }));

        let file = utf8(&cache).join(wheel().relative_file());
        assert!(!file.exists());
        assert!(!Utf8PathBuf::from(format!("{file}.part")).exists());
    }
}
