use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default public data server for released datasets.
pub const HTTP_DATA_SERVER: &str = "https://ibl.flatironinstitute.org";

/// Key prefix under which datasets are mirrored in the object store.
pub const AWS_ROOT_PATH: &str = "aws_spikesorting";

/// FPGA channel carrying the behaviour controller sync pulses on 3B rigs.
pub const BPOD_CHANNEL: u32 = 16;

/// Shared settings for the converter, the fetcher and the extractor.
///
/// Every field has a default, so a parameters file only needs the keys it
/// wants to change. `ONE_CACHE_DIR` and `ONE_HTTP_DATA_SERVER` override the
/// corresponding fields after loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Root of the local ALF cache.
    pub cache_dir: Utf8PathBuf,
    /// Root URL of the HTTP data server mirroring the cache layout.
    pub http_data_server: String,
    /// Object store key prefix for mirrored datasets.
    pub aws_root: String,
    /// FPGA channel index of the Bpod sync signal.
    pub bpod_channel: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            cache_dir: Utf8PathBuf::from("."),
            http_data_server: HTTP_DATA_SERVER.to_string(),
            aws_root: AWS_ROOT_PATH.to_string(),
            bpod_channel: BPOD_CHANNEL,
        }
    }
}

impl Params {
    pub fn new(cache_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// Load parameters from a JSON file, then apply environment overrides.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref())?;
        let params: Params = serde_json::from_str(&text)?;

        Ok(params.with_env())
    }

    pub fn with_env(mut self) -> Self {
        if let Ok(dir) = std::env::var("ONE_CACHE_DIR") {
            self.cache_dir = dir.into();
        }
        if let Ok(url) = std::env::var("ONE_HTTP_DATA_SERVER") {
            self.http_data_server = url;
        }
        self
    }

    /// The cache root in forward-slash form, as it appears in URLs.
    pub(crate) fn cache_root(&self) -> String {
        self.cache_dir.as_str().replace('\\', "/")
    }

    /// The data server root without a trailing slash.
    pub(crate) fn server_root(&self) -> &str {
        self.http_data_server.trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("params.json")).unwrap();
        fs::write(&path, r#"{"cache_dir": "/data/one"}"#).unwrap();

        let params: Params = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(params.cache_dir, Utf8PathBuf::from("/data/one"));
        assert_eq!(params.http_data_server, HTTP_DATA_SERVER);
        assert_eq!(params.aws_root, AWS_ROOT_PATH);
        assert_eq!(params.bpod_channel, 16);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("params.json")).unwrap();
        fs::write(&path, "cache_dir = 1").unwrap();

        assert!(matches!(Params::load(&path), Err(ConfigError::Format(_))));
    }

    #[test]
    fn test_server_root_trims_slash() {
        let params = Params {
            http_data_server: "https://example.org/".into(),
            ..Params::default()
        };
        assert_eq!(params.server_root(), "https://example.org");
    }
}
