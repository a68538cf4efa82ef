//! Cluster alerts
//!
//! ReporTree writes a `<label>_clusterComposition.tsv` per run. Each row is
//! `partition<TAB>cluster<TAB>n<TAB>samples`, where `samples` is a
//! comma-separated list. A row naming more than one sample is a multi-sample
//! cluster: those samples are within the clustering threshold of each other.
//!
//! The reference comparator reports new samples within the threshold of a
//! reference sample as `sampleA<TAB>sampleB<TAB>diffs<TAB>compared_loci<TAB>pct_diff`
//! rows. Those are kept as a `matches_*.tsv` table and raised as alerts too.
//!
//! Scanning decides which alerts exist. Delivering them is the job of an
//! [`AlertSink`].

use crate::runner::{self, exit_zero, CommandSpec};
use async_trait::async_trait;
use smitt_common::time;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const COMPOSITION_SUFFIX: &str = "_clusterComposition.tsv";

const ALERT_TITLE: &str = "Smittvarning: multi-sample cluster detected";

const MATCH_TITLE: &str = "Smittvarning: new sample close to reference";

/// Header of a reference matches table
pub const MATCHES_HEADER: &str = "sampleA\tsampleB\tdiffs\tcompared_loci\tpct_diff";

/// One multi-sample cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub title: String,
    pub samples: Vec<String>,
    pub threshold: u32,
    /// Composition file the row came from
    pub source: PathBuf,
}

impl Alert {
    /// Human-readable alert body
    pub fn message(&self) -> String {
        format!(
            "Samples {} differ by less than {} variants. Risk for outbreak!",
            self.samples.join(" and "),
            self.threshold
        )
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title, self.message())
    }
}

/// Sample list of one composition row, when it names more than one sample
pub fn parse_composition_line(line: &str) -> Option<Vec<String>> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() || line.starts_with("partition") {
        return None;
    }

    let columns: Vec<&str> = line.split('\t').collect();
    if columns.len() < 4 || !columns[3].contains(',') {
        return None;
    }

    let samples: Vec<String> = columns[3]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    Some(samples)
}

/// Alerts for every multi-sample row of one composition file
pub fn scan_file(path: &Path, threshold: u32) -> std::io::Result<Vec<Alert>> {
    let bytes = std::fs::read(path)?;
    let content = String::from_utf8_lossy(&bytes);

    Ok(content
        .lines()
        .filter_map(parse_composition_line)
        .map(|samples| Alert {
            title: ALERT_TITLE.to_string(),
            samples,
            threshold,
            source: path.to_path_buf(),
        })
        .collect())
}

/// Composition files in `dir`, sorted by name
///
/// With a `prefix`, only `<prefix>_clusterComposition.tsv` is considered.
pub fn composition_files(dir: &Path, prefix: Option<&str>) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            info!(dir = %dir.display(), error = %e, "Cluster folder not available");
            return Vec::new();
        }
    };

    let wanted = prefix.map(|p| format!("{}{}", p, COMPOSITION_SUFFIX));
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let keep = match &wanted {
                Some(exact) => name == *exact,
                None => name.ends_with(COMPOSITION_SUFFIX),
            };
            keep.then(|| entry.path())
        })
        .collect();
    files.sort();
    files
}

/// Alerts for all composition files in `dir`
///
/// Unreadable files are logged and skipped.
pub fn scan_clusters(dir: &Path, threshold: u32) -> Vec<Alert> {
    scan_files(&composition_files(dir, None), threshold)
}

pub(crate) fn scan_files(files: &[PathBuf], threshold: u32) -> Vec<Alert> {
    let mut alerts = Vec::new();
    for file in files {
        match scan_file(file, threshold) {
            Ok(found) => {
                debug!(path = %file.display(), alerts = found.len(), "Scanned cluster composition");
                alerts.extend(found);
            }
            Err(e) => warn!(path = %file.display(), error = %e, "Failed to read cluster composition"),
        }
    }
    alerts
}

// ============================================================================
// Reference matches
// ============================================================================

/// Match rows of comparator output; the header and status lines are dropped
pub fn match_rows(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .map(|line| line.trim_end_matches(['\r', '\n']))
        .filter(|line| line.contains('\t') && !line.starts_with("sampleA"))
        .map(str::to_string)
        .collect()
}

/// Write `rows` under `dir` as `matches_<timestamp>_<label>.tsv`
pub fn write_matches(dir: &Path, label: &str, rows: &[String]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("matches_{}_{}.tsv", time::stamp_label(), label));

    let mut content = String::from(MATCHES_HEADER);
    content.push('\n');
    for row in rows {
        content.push_str(row);
        content.push('\n');
    }
    std::fs::write(&path, content)?;
    Ok(path)
}

/// One alert per match row, naming the new sample and its reference neighbour
pub fn match_alerts(rows: &[String], threshold: u32, source: &Path) -> Vec<Alert> {
    rows.iter()
        .filter_map(|row| {
            let mut columns = row.split('\t').map(str::trim);
            let new_sample = columns.next().filter(|s| !s.is_empty())?;
            let reference = columns.next().filter(|s| !s.is_empty())?;
            Some(Alert {
                title: MATCH_TITLE.to_string(),
                samples: vec![new_sample.to_string(), reference.to_string()],
                threshold,
                source: source.to_path_buf(),
            })
        })
        .collect()
}

// ============================================================================
// Delivery
// ============================================================================

/// Alert delivery channel; delivery failures are logged, never returned
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &Alert);
}

/// Writes alerts to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn deliver(&self, alert: &Alert) {
        warn!(
            source = %alert.source.display(),
            samples = ?alert.samples,
            threshold = alert.threshold,
            "ALERT {}: {}",
            alert.title,
            alert.message()
        );
    }
}

/// Runs a desktop notifier as `<command...> <title> <message>`
#[derive(Debug, Clone)]
pub struct CommandSink {
    command: Vec<String>,
}

impl CommandSink {
    /// `None` for an empty command line
    pub fn new(command: Vec<String>) -> Option<Self> {
        if command.first().map(|p| p.trim().is_empty()).unwrap_or(true) {
            return None;
        }
        Some(Self { command })
    }

    pub fn spec_for(&self, alert: &Alert) -> CommandSpec {
        CommandSpec::new(&self.command[0], "alert")
            .args(&self.command[1..])
            .arg(&alert.title)
            .arg(alert.message())
    }
}

#[async_trait]
impl AlertSink for CommandSink {
    async fn deliver(&self, alert: &Alert) {
        let spec = self.spec_for(alert);
        if !runner::run("notify", &spec, exit_zero).await.is_success() {
            warn!(command = %spec, "Alert notifier did not complete");
        }
    }
}

/// Deliver every alert to every sink
pub async fn dispatch(alerts: &[Alert], sinks: &[Box<dyn AlertSink>]) {
    for alert in alerts {
        for sink in sinks {
            sink.deliver(alert).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_sample_row() {
        assert_eq!(
            parse_composition_line("1\tfoo\tbar\tS1,S2"),
            Some(vec!["S1".to_string(), "S2".to_string()])
        );
    }

    #[test]
    fn test_single_sample_row() {
        assert_eq!(parse_composition_line("1\tfoo\tbar\tS1"), None);
    }

    #[test]
    fn test_short_row() {
        assert_eq!(parse_composition_line("1\tfoo\tS1,S2"), None);
    }

    #[test]
    fn test_header_blank_and_crlf() {
        assert_eq!(parse_composition_line("partition\tcluster\tcluster_length\tsamples"), None);
        assert_eq!(parse_composition_line("   "), None);
        assert_eq!(
            parse_composition_line("MST-10x1.0\tcluster_1\t2\tA, B ,\r"),
            Some(vec!["A".to_string(), "B".to_string()])
        );
    }

    #[test]
    fn test_message_format() {
        let alert = Alert {
            title: ALERT_TITLE.to_string(),
            samples: vec!["A".into(), "B".into()],
            threshold: 10,
            source: PathBuf::from("x_clusterComposition.tsv"),
        };
        assert_eq!(
            alert.message(),
            "Samples A and B differ by less than 10 variants. Risk for outbreak!"
        );
    }

    #[test]
    fn test_match_rows_drop_header_and_chatter() {
        let lines: Vec<String> = [
            "sampleA\tsampleB\tdiffs\tcompared_loci\tpct_diff",
            "N1\tR7\t2\t3000\t0.07",
            "No new samples found",
            "N2\tR9\t0\t2990\t0.00\r",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let rows = match_rows(&lines);
        assert_eq!(rows, vec!["N1\tR7\t2\t3000\t0.07", "N2\tR9\t0\t2990\t0.00"]);

        let alerts = match_alerts(&rows, 10, Path::new("m.tsv"));
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].samples, vec!["N1", "R7"]);
        assert_eq!(alerts[0].title, MATCH_TITLE);
    }

    #[test]
    fn test_write_matches_table() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("alerts");
        let path = write_matches(&dir, "labA_2024-01-01_1", &["N1\tR7\t2\t3000\t0.07".to_string()]).unwrap();

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("matches_") && name.ends_with("_labA_2024-01-01_1.tsv"));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            format!("{}\nN1\tR7\t2\t3000\t0.07\n", MATCHES_HEADER)
        );
    }

    #[test]
    fn test_command_sink_requires_program() {
        assert!(CommandSink::new(vec![]).is_none());
        assert!(CommandSink::new(vec![" ".into()]).is_none());

        let sink = CommandSink::new(vec!["notify-send".into(), "-u".into(), "critical".into()]).unwrap();
        let alert = Alert {
            title: "T".into(),
            samples: vec!["A".into(), "B".into()],
            threshold: 5,
            source: PathBuf::new(),
        };
        let args = sink.spec_for(&alert).args_lossy();
        assert_eq!(args[..3], ["-u", "critical", "T"]);
    }
}
