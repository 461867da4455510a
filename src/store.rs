//! JSON host store used to re-hydrate drivers across invocations.
//!
//! Each host is persisted as `<root>/<host>.json` holding the validated
//! [`HostConfig`] and the resolved [`HostState`].

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::HostConfig;
use crate::driver::HostState;
use crate::fs;

/// Everything needed to act on a host again.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    /// Validated configuration.
    pub config: HostConfig,
    /// Resources resolved while driving the host.
    pub state: HostState,
}

/// Errors raised while reading or writing host records.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum StoreError {
    /// Raised when no record exists for the host.
    #[error("no record for host {host} in {root}")]
    NotFound {
        /// Host name.
        host: String,
        /// Store directory.
        root: Utf8PathBuf,
    },
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a record cannot be encoded or decoded.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path of the record.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Directory of host records.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostStore {
    root: Utf8PathBuf,
}

impl HostStore {
    /// Store rooted at `root`. The directory is created on first save.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store directory.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Location of the record for `host`.
    #[must_use]
    pub fn path(&self, host: &str) -> Utf8PathBuf {
        self.root.join(format!("{host}.json"))
    }

    /// Whether a record exists for `host`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the directory cannot be inspected.
    pub fn contains(&self, host: &str) -> Result<bool, StoreError> {
        let path = self.path(host);
        fs::exists(&path).map_err(|err| io_error(&path, &err))
    }

    /// Writes `record`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when encoding or writing fails.
    pub fn save(&self, record: &HostRecord) -> Result<Utf8PathBuf, StoreError> {
        let path = self.path(&record.config.name);
        let json = serde_json::to_string_pretty(record).map_err(|err| StoreError::Parse {
            path: path.clone(),
            message: err.to_string(),
        })?;
        fs::write(&path, &json).map_err(|err| io_error(&path, &err))?;
        Ok(path)
    }

    /// Reads the record for `host`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no record exists, or
    /// [`StoreError`] when reading or decoding fails.
    pub fn load(&self, host: &str) -> Result<HostRecord, StoreError> {
        if !self.contains(host)? {
            return Err(StoreError::NotFound {
                host: host.to_owned(),
                root: self.root.clone(),
            });
        }
        let path = self.path(host);
        let json = fs::read_to_string(&path).map_err(|err| io_error(&path, &err))?;
        serde_json::from_str(&json).map_err(|err| StoreError::Parse {
            path,
            message: err.to_string(),
        })
    }

    /// Deletes the record for `host`. A missing record is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the file cannot be removed.
    pub fn delete(&self, host: &str) -> Result<(), StoreError> {
        let path = self.path(host);
        fs::remove(&path).map_err(|err| io_error(&path, &err))
    }
}

fn io_error(path: &Utf8Path, err: &std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::host_options;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> HostStore {
        let root = Utf8PathBuf::from_path_buf(tmp.path().join("hosts"))
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
        HostStore::new(root)
    }

    #[test]
    fn missing_records_are_reported() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let hosts = store(&tmp);

        assert!(matches!(
            hosts.load("web-1"),
            Err(StoreError::NotFound { host, .. }) if host == "web-1"
        ));
        assert_eq!(hosts.delete("web-1"), Ok(()));
    }

    #[test]
    fn corrupt_records_surface_a_parse_error() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let hosts = store(&tmp);
        fs::write(&hosts.path("web-1"), "{not json")
            .unwrap_or_else(|err| panic!("seed record: {err}"));

        assert!(matches!(hosts.load("web-1"), Err(StoreError::Parse { .. })));
    }

    #[test]
    fn saved_records_load_back() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let hosts = store(&tmp);
        let config = HostConfig::from_options("web-1", &host_options())
            .unwrap_or_else(|err| panic!("config: {err}"));
        let record = HostRecord {
            config,
            state: HostState {
                instance_id: Some(String::from("srv-1")),
                ..HostState::default()
            },
        };

        let path = hosts.save(&record).unwrap_or_else(|err| panic!("save: {err}"));

        assert_eq!(path, hosts.path("web-1"));
        assert_eq!(hosts.load("web-1"), Ok(record));
    }
}
