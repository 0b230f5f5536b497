//! Typed JSON snapshot files.
//!
//! Both persisted data sets (rules and telemetry) are whole-value snapshots:
//! every save rewrites the file with the complete, pretty-printed value.
//! Writes go to a sibling `.tmp` file first and are then renamed over the
//! target, so a crash mid-write never leaves a truncated snapshot behind.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Handle to a JSON file holding one value of type `T`.
#[derive(Debug)]
pub struct JsonFile<T> {
    path: PathBuf,
    _value: PhantomData<fn() -> T>,
}

impl<T> JsonFile<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _value: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

impl<T: Serialize> JsonFile<T> {
    /// Replace the file contents with `value`.
    pub async fn save(&self, value: &T) -> Result<(), SnapshotError> {
        let mut bytes = serde_json::to_vec_pretty(value)?;
        bytes.push(b'\n');

        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|source| SnapshotError::Write {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| SnapshotError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

impl<T: Serialize + DeserializeOwned + Default> JsonFile<T> {
    /// Read the snapshot. A missing or blank file is (re)created holding
    /// `T::default()`, which is also what gets returned.
    pub async fn load_or_create(&self) -> Result<T, SnapshotError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => self.create_default().await,
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| SnapshotError::Parse {
                path: self.path.clone(),
                source,
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => self.create_default().await,
            Err(source) => Err(SnapshotError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    async fn create_default(&self) -> Result<T, SnapshotError> {
        let value = T::default();
        self.save(&value).await?;
        tracing::info!(path = %self.path.display(), "snapshot file created");
        Ok(value)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        #[serde(default)]
        values: Vec<u32>,
    }

    #[tokio::test]
    async fn missing_file_is_created_with_default() {
        let dir = tempdir().unwrap();
        let file: JsonFile<Sample> = JsonFile::new(dir.path().join("sample.json"));

        let loaded = file.load_or_create().await.unwrap();
        assert_eq!(loaded, Sample::default());
        assert!(file.path().exists());
    }

    #[tokio::test]
    async fn blank_file_is_treated_as_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.json");
        std::fs::write(&path, "  \n").unwrap();

        let file: JsonFile<Sample> = JsonFile::new(&path);
        assert_eq!(file.load_or_create().await.unwrap(), Sample::default());

        let rewritten = std::fs::read_to_string(&path).unwrap();
        assert!(rewritten.contains("\"values\""), "got: {rewritten}");
    }

    #[tokio::test]
    async fn save_then_load_returns_saved_value() {
        let dir = tempdir().unwrap();
        let file: JsonFile<Sample> = JsonFile::new(dir.path().join("sample.json"));

        let value = Sample {
            values: vec![3, 1, 2],
        };
        file.save(&value).await.unwrap();

        assert_eq!(file.load_or_create().await.unwrap(), value);
    }

    #[tokio::test]
    async fn save_is_pretty_printed() {
        let dir = tempdir().unwrap();
        let file: JsonFile<Sample> = JsonFile::new(dir.path().join("sample.json"));
        file.save(&Sample { values: vec![1] }).await.unwrap();

        let text = std::fs::read_to_string(file.path()).unwrap();
        assert!(text.contains("\n  \"values\": ["), "got: {text}");
        assert!(!file.tmp_path().exists());
    }

    #[tokio::test]
    async fn garbage_content_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.json");
        std::fs::write(&path, "{ not json").unwrap();

        let file: JsonFile<Sample> = JsonFile::new(&path);
        let err = file.load_or_create().await.unwrap_err();
        assert!(matches!(err, SnapshotError::Parse { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn save_into_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let file: JsonFile<Sample> = JsonFile::new(dir.path().join("nope").join("sample.json"));

        let err = file.save(&Sample::default()).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Write { .. }), "got: {err}");
    }
}
