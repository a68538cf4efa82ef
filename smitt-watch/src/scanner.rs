//! Batch folder scanner
//!
//! Lists the files a stage may act on: immediate subfolders of a watch root,
//! then the matching files inside each. Both levels are sorted by name so a
//! scan of an unchanged tree always yields the same sequence, whatever order
//! the filesystem returns entries in.
//!
//! Nothing here keeps state between polls. Diffing against the known-set is
//! a pure function; the engine decides when a unit becomes known.

use crate::stage::{Source, WorkUnit};
use smitt_common::Ledger;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Scanner errors
#[derive(Debug, Error)]
pub enum ScanError {
    /// Specified path does not exist
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Path exists but is not a directory
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    /// Directory listing failed
    #[error("Read error on {0}: {1}")]
    ReadDir(PathBuf, String),
}

/// Batch folder scanner for one stage's input convention
#[derive(Debug, Clone)]
pub struct FileScanner {
    suffix: String,
}

impl FileScanner {
    /// Scanner accepting files whose name ends with `suffix`, compared
    /// case-insensitively
    pub fn new(suffix: &str) -> Self {
        Self {
            suffix: suffix.to_lowercase(),
        }
    }

    /// Sorted names of the immediate subfolders of `root`
    pub fn subfolders(root: &Path) -> Result<Vec<String>, ScanError> {
        if !root.exists() {
            return Err(ScanError::PathNotFound(root.to_path_buf()));
        }
        if !root.is_dir() {
            return Err(ScanError::NotADirectory(root.to_path_buf()));
        }

        let mut names = Vec::new();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .sort_by_file_name();

        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_dir() => {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                Ok(_) => {}
                Err(e) => {
                    // One unreadable entry must not hide the rest
                    tracing::warn!("Error accessing entry under {}: {}", root.display(), e);
                }
            }
        }
        Ok(names)
    }

    /// Sorted matching files directly inside `folder`
    pub fn files_in(&self, folder: &Path) -> Result<Vec<PathBuf>, ScanError> {
        let mut files = Vec::new();
        let walker = WalkDir::new(folder)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .sort_by_file_name();

        for entry in walker {
            let entry = entry.map_err(|e| ScanError::ReadDir(folder.to_path_buf(), e.to_string()))?;
            if entry.file_type().is_file() && self.matches(&entry.file_name().to_string_lossy()) {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }

    /// Whether a file name follows this scanner's convention
    pub fn matches(&self, file_name: &str) -> bool {
        file_name.to_lowercase().ends_with(&self.suffix)
    }

    /// All matching files under `root`, subfolder by subfolder
    ///
    /// A missing root yields an empty scan; watchers keep polling until it
    /// appears.
    pub fn scan(&self, root: &Path) -> Vec<PathBuf> {
        let subfolders = match Self::subfolders(root) {
            Ok(subs) => subs,
            Err(e) => {
                tracing::warn!("Watch root unavailable: {}", e);
                return Vec::new();
            }
        };
        tracing::debug!(root = %root.display(), subfolders = ?subfolders, "Scanning watch root");

        let mut found = Vec::new();
        for sub in &subfolders {
            match self.files_in(&root.join(sub)) {
                Ok(files) => {
                    tracing::debug!(subfolder = %sub, count = files.len(), "Matching files found");
                    found.extend(files);
                }
                Err(e) => tracing::error!(subfolder = %sub, "Error reading subfolder: {}", e),
            }
        }
        found
    }

    /// Scan `root` into work units keyed by absolute path
    pub fn scan_units(&self, root: &Path) -> Vec<WorkUnit> {
        let root = absolute(root);
        self.scan(&root)
            .into_iter()
            .filter_map(|path| {
                let subfolder = path.parent()?.file_name()?.to_string_lossy().into_owned();
                let label = path.file_name()?.to_string_lossy().into_owned();
                Some(WorkUnit {
                    key: path.to_string_lossy().into_owned(),
                    subfolder,
                    label,
                    path,
                    companion: None,
                })
            })
            .collect()
    }
}

/// Units not yet recorded in `known`, in scan order
///
/// `known` is only read; marking units done is the caller's decision.
pub fn diff(scanned: Vec<WorkUnit>, known: &dyn Ledger) -> Vec<WorkUnit> {
    scanned
        .into_iter()
        .filter(|unit| !known.contains(&unit.key))
        .collect()
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Raw input files of a watch root, for the profiling stage
pub struct FileSource {
    root: PathBuf,
    scanner: FileScanner,
}

impl FileSource {
    pub fn new(root: impl Into<PathBuf>, suffix: &str) -> Self {
        Self {
            root: root.into(),
            scanner: FileScanner::new(suffix),
        }
    }
}

impl Source for FileSource {
    fn discover(&self) -> Vec<WorkUnit> {
        self.scanner.scan_units(&self.root)
    }
}
