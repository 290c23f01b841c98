//! Dataset layout discovery.
//!
//! A dataset root holds one or more `export_*` directories; the most recent
//! one (last by name) contains a directory per recognition, named either
//! `recognition_<id>` or just `<id>`.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{IngestError, IngestResult};

const EXPORT_PREFIX: &str = "export_";
const RECORD_PREFIX: &str = "recognition_";

#[derive(Debug, Clone)]
pub struct DatasetScanner {
    root: PathBuf,
}

impl DatasetScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// First existing directory among `search_paths`.
    pub fn find_dataset(search_paths: &[PathBuf]) -> IngestResult<PathBuf> {
        search_paths
            .iter()
            .find(|path| path.is_dir())
            .cloned()
            .ok_or_else(|| {
                let tried = search_paths
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                IngestError::not_found(format!("Dataset not found in any search path: {}", tried))
            })
    }

    /// Most recent `export_*` directory under the root.
    pub fn export_dir(&self) -> IngestResult<PathBuf> {
        let mut exports = subdirectories(&self.root)?
            .into_iter()
            .filter(|dir| dir_name(dir).is_some_and(|name| name.starts_with(EXPORT_PREFIX)))
            .collect::<Vec<_>>();
        exports.sort();

        exports.pop().ok_or_else(|| {
            IngestError::not_found(format!(
                "No {}* directory in dataset {}",
                EXPORT_PREFIX,
                self.root.display()
            ))
        })
    }

    /// Record directories of the latest export, name-sorted, truncated to `limit`.
    pub fn record_dirs(&self, limit: Option<usize>) -> IngestResult<Vec<PathBuf>> {
        let export = self.export_dir()?;
        info!(export = %export.display(), "Using export directory");

        let mut records = subdirectories(&export)?
            .into_iter()
            .filter(|dir| is_record_dir(dir))
            .collect::<Vec<_>>();
        records.sort();

        if records.is_empty() {
            return Err(IngestError::not_found(format!(
                "No recognition directories in {}",
                export.display()
            )));
        }

        if let Some(limit) = limit {
            records.truncate(limit);
        }

        debug!(count = records.len(), "Found recognition directories");
        Ok(records)
    }
}

/// Recognition id encoded in a record directory name.
pub fn recognition_id_from_dir(path: &Path) -> Option<i64> {
    let name = dir_name(path)?;
    let digits = name.strip_prefix(RECORD_PREFIX).unwrap_or(name);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn is_record_dir(path: &Path) -> bool {
    dir_name(path).is_some_and(|name| {
        name.starts_with(RECORD_PREFIX) || (!name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()))
    })
}

fn dir_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

fn subdirectories(path: &Path) -> IngestResult<Vec<PathBuf>> {
    if !path.is_dir() {
        return Err(IngestError::not_found(format!(
            "Dataset directory {} does not exist",
            path.display()
        )));
    }

    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn layout(dirs: &[&str]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for dir in dirs {
            fs::create_dir_all(tmp.path().join(dir)).unwrap();
        }
        tmp
    }

    #[test]
    fn test_recognition_id_from_dir() {
        assert_eq!(recognition_id_from_dir(Path::new("/x/recognition_123")), Some(123));
        assert_eq!(recognition_id_from_dir(Path::new("/x/456")), Some(456));
        assert_eq!(recognition_id_from_dir(Path::new("/x/recognition_")), None);
        assert_eq!(recognition_id_from_dir(Path::new("/x/recognition_12a")), None);
        assert_eq!(recognition_id_from_dir(Path::new("/x/notes")), None);
    }

    #[test]
    fn test_picks_latest_export() {
        let tmp = layout(&[
            "export_2024_01_01/recognition_1",
            "export_2024_06_01/recognition_2",
            "export_2024_06_01/recognition_3",
        ]);
        let scanner = DatasetScanner::new(tmp.path());

        assert!(scanner.export_dir().unwrap().ends_with("export_2024_06_01"));
        let dirs = scanner.record_dirs(None).unwrap();
        let ids: Vec<_> = dirs.iter().filter_map(|d| recognition_id_from_dir(d)).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_limit_and_mixed_names() {
        let tmp = layout(&[
            "export_1/recognition_10",
            "export_1/11",
            "export_1/recognition_12",
            "export_1/thumbnails",
        ]);
        let scanner = DatasetScanner::new(tmp.path());

        assert_eq!(scanner.record_dirs(None).unwrap().len(), 3);
        assert_eq!(scanner.record_dirs(Some(2)).unwrap().len(), 2);
    }

    #[test]
    fn test_missing_export_is_not_found() {
        let tmp = layout(&["recognition_1"]);
        let err = DatasetScanner::new(tmp.path()).record_dirs(None).unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));
    }

    #[test]
    fn test_empty_export_is_not_found() {
        let tmp = layout(&["export_1/readme"]);
        let err = DatasetScanner::new(tmp.path()).record_dirs(None).unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));
    }

    #[test]
    fn test_find_dataset() {
        let tmp = layout(&["second"]);
        let paths = vec![tmp.path().join("first"), tmp.path().join("second")];
        assert_eq!(DatasetScanner::find_dataset(&paths).unwrap(), paths[1]);

        let missing = vec![tmp.path().join("nope")];
        assert!(DatasetScanner::find_dataset(&missing).is_err());
    }
}
