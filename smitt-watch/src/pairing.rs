//! Profile/metadata pairing
//!
//! The profiling tool writes two files per run into `<results>/<batch>/`:
//!
//! ```text
//! cgmlst.profile.<batch>_<YYYY-MM-DD>_<seq>
//! metadata.tsv.<batch>_<YYYY-MM-DD>_<seq>
//! ```
//!
//! A pair is ready for clustering when both exist under the batch folder
//! named in the file name, and both look like complete TSV files. The label
//! of a pair is `<YYYY-MM-DD>_<seq>`.
//!
//! Older runs wrote `cgmlst.profile.<batch>_<YYYY-MM-DD>` without a sequence
//! number. Those names are reported as deprecated and never paired: a
//! sequence-less label cannot be told apart from a second run on the same day.

use crate::scanner::FileScanner;
use crate::stage::{Source, WorkUnit};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const PROFILE_PREFIX: &str = "cgmlst.profile.";
pub const METADATA_PREFIX: &str = "metadata.tsv.";
pub const PARTITIONS_SUFFIX: &str = "_partitions.tsv";

static PROFILE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^cgmlst\.profile\.([A-Za-z0-9_]+)_(\d{4}-\d{2}-\d{2})_(\d+)$")
        .expect("profile name pattern is valid")
});

static LEGACY_PROFILE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^cgmlst\.profile\.(.+)_(\d{4}-\d{2}-\d{2})$")
        .expect("legacy profile name pattern is valid")
});

/// Fields encoded in a canonical profile file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileName {
    pub subfolder: String,
    pub date: String,
    /// Sequence as written in the file name; `01` and `1` are different runs
    pub sequence: String,
}

impl ProfileName {
    /// Parse `cgmlst.profile.<batch>_<date>_<seq>`
    pub fn parse(file_name: &str) -> Option<Self> {
        let caps = PROFILE_NAME.captures(file_name)?;
        Some(Self {
            subfolder: caps[1].to_string(),
            date: caps[2].to_string(),
            sequence: caps[3].to_string(),
        })
    }

    /// Numeric sequence, for ordering runs of one day
    pub fn sequence_number(&self) -> Option<u64> {
        self.sequence.parse().ok()
    }

    /// Label shared by the profile and its metadata: `<date>_<seq>`
    pub fn label(&self) -> String {
        format!("{}_{}", self.date, self.sequence)
    }

    /// Run label embedded in both file names: `<batch>_<date>_<seq>`
    pub fn run_label(&self) -> String {
        format!("{}_{}_{}", self.subfolder, self.date, self.sequence)
    }

    pub fn profile_file_name(&self) -> String {
        format!("{}{}", PROFILE_PREFIX, self.run_label())
    }

    pub fn metadata_file_name(&self) -> String {
        format!("{}{}", METADATA_PREFIX, self.run_label())
    }
}

/// A profile with its matching metadata file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPair {
    pub subfolder: String,
    pub label: String,
    pub profile_path: PathBuf,
    pub meta_path: PathBuf,
}

impl ArtifactPair {
    /// Known-set key; labels are only unique within a subfolder
    pub fn key(&self) -> String {
        format!("{}:{}", self.subfolder, self.label)
    }
}

/// Find all profile/metadata pairs under `results_dir`
///
/// Does not apply the readiness gate; see [`is_likely_tsv`].
pub fn find_pairs(results_dir: &Path) -> Vec<ArtifactPair> {
    let subfolders = match FileScanner::subfolders(results_dir) {
        Ok(subs) => subs,
        Err(e) => {
            debug!("Results directory unavailable: {}", e);
            return Vec::new();
        }
    };

    let mut pairs = Vec::new();
    for sub in subfolders {
        let folder = results_dir.join(&sub);
        let names = match sorted_file_names(&folder) {
            Ok(names) => names,
            Err(e) => {
                warn!(subfolder = %sub, error = %e, "Error reading results subfolder");
                continue;
            }
        };

        for name in names.iter().filter(|n| n.starts_with(PROFILE_PREFIX)) {
            let Some(parsed) = ProfileName::parse(name) else {
                if LEGACY_PROFILE_NAME.is_match(name) {
                    warn!(subfolder = %sub, file = %name, "Ignoring profile with deprecated name (no sequence number)");
                } else {
                    debug!(subfolder = %sub, file = %name, "Ignoring profile with unrecognised name");
                }
                continue;
            };

            // A misplaced file is left alone rather than paired across batches
            if parsed.subfolder != sub {
                debug!(
                    subfolder = %sub,
                    file = %name,
                    embedded = %parsed.subfolder,
                    "Ignoring profile whose name belongs to another batch"
                );
                continue;
            }

            let meta_name = parsed.metadata_file_name();
            if !names.contains(&meta_name) {
                debug!(subfolder = %sub, file = %name, "Metadata not present yet");
                continue;
            }

            pairs.push(ArtifactPair {
                subfolder: sub.clone(),
                label: parsed.label(),
                profile_path: folder.join(name),
                meta_path: folder.join(meta_name),
            });
        }
    }
    pairs
}

/// Best-effort check that a file is a complete TSV table
///
/// The file must exist, be non-empty and have a tab in its first line. This
/// catches files the producer has created but not yet written.
pub fn is_likely_tsv(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    match file.metadata() {
        Ok(meta) if meta.is_file() && meta.len() > 0 => {}
        _ => return false,
    }

    let mut first_line = Vec::new();
    match BufReader::new(file).read_until(b'\n', &mut first_line) {
        Ok(_) => first_line.contains(&b'\t'),
        Err(_) => false,
    }
}

/// Most recently modified `*_partitions.tsv` in `cluster_dir`
pub fn latest_partitions(cluster_dir: &Path) -> Option<PathBuf> {
    let names = sorted_file_names(cluster_dir).ok()?;
    names
        .into_iter()
        .filter(|n| n.ends_with(PARTITIONS_SUFFIX))
        .filter_map(|n| {
            let path = cluster_dir.join(&n);
            let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
            Some((modified, path))
        })
        // Sorted names make ties resolve to the lexicographically last file
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, path)| path)
}

/// Highest sequence number among canonical profiles of `subfolder` and `date`
pub fn max_sequence(subfolder_dir: &Path, subfolder: &str, date: &str) -> Option<u64> {
    let names = sorted_file_names(subfolder_dir).ok()?;
    names
        .iter()
        .filter_map(|n| ProfileName::parse(n))
        .filter(|p| p.subfolder == subfolder && p.date == date)
        .filter_map(|p| p.sequence_number())
        .max()
}

fn sorted_file_names(folder: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Ready profile/metadata pairs of a results tree, for the clustering stage
pub struct PairSource {
    results_dir: PathBuf,
}

impl PairSource {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
        }
    }
}

impl Source for PairSource {
    fn discover(&self) -> Vec<WorkUnit> {
        find_pairs(&self.results_dir)
            .into_iter()
            .filter(|pair| {
                let ready = is_likely_tsv(&pair.profile_path) && is_likely_tsv(&pair.meta_path);
                if !ready {
                    warn!(
                        subfolder = %pair.subfolder,
                        label = %pair.label,
                        "Skipping pair: profile or metadata not ready or empty"
                    );
                }
                ready
            })
            .map(|pair| WorkUnit {
                key: pair.key(),
                subfolder: pair.subfolder,
                label: pair.label,
                path: pair.profile_path,
                companion: Some(pair.meta_path),
            })
            .collect()
    }
}
