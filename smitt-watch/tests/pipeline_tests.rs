//! Profiling output feeding the clustering stage's pair discovery
#![cfg(unix)]

mod helpers;

use helpers::{appended, write_file, write_ref_scripts, RecordingSink, APPEND_RECORDING, COMPARE_WITH_MATCH, TSV};
use smitt_common::config::Settings;
use smitt_common::{DirLock, Lease};
use smitt_watch::clustering::ClusterAlertFollowUp;
use smitt_watch::pairing::PairSource;
use smitt_watch::profiling::profile_stage;
use smitt_watch::stage::{FollowUp, Source};
use smitt_watch::{CommandSpec, Engine, WorkGroup, WorkUnit};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// Stand-in profiler: `$1` results base, `$2` label, `$3..` input files
const FAKE_PROFILER: &str = r#"
batch=$(basename "$(dirname "$3")")
out="$1/$batch"
mkdir -p "$out"
printf 'sample\tlocus\nS1\t1\n' > "$out/cgmlst.profile.$2"
printf 'sample\tRegion\nS1\tnorth\n' > "$out/metadata.tsv.$2"
"#;

fn settings(root: &Path) -> Settings {
    let intermediate_dir = root.join("intermediate_files");
    let mut settings = Settings {
        watch_dir: root.join("jasen_out"),
        results_base: intermediate_dir.join("profiles_for_reportree"),
        cluster_base: intermediate_dir.join("clusters"),
        intermediate_dir,
        ..Settings::default()
    };
    settings.profiler.program = "sh".to_string();
    settings.profiler.args = vec!["-c".to_string(), FAKE_PROFILER.to_string(), "sh".to_string()];
    settings
}

#[tokio::test]
async fn test_profiles_become_pairs() {
    let tmp = TempDir::new().unwrap();
    let settings = settings(tmp.path());
    write_file(&settings.watch_dir, "labA", "s1.json", "{}");
    write_file(&settings.watch_dir, "labA", "s2.json", "{}");

    let mut engine = Engine::new(profile_stage(&settings, vec![]));
    let report = engine.run_once().await;
    assert_eq!(report.succeeded(), 1);

    let pairs = PairSource::new(&settings.results_base).discover();
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].subfolder, "labA");
    assert!(pairs[0].label.ends_with("_1"));

    // A second batch of the same day gets the next sequence number
    write_file(&settings.watch_dir, "labA", "s3.json", "{}");
    engine.run_once().await;

    let labels: Vec<String> = PairSource::new(&settings.results_base)
        .discover()
        .into_iter()
        .map(|u| u.label)
        .collect();
    assert_eq!(labels.len(), 2);
    assert!(labels[1].ends_with("_2"));
}

#[tokio::test]
async fn test_busy_reference_update_is_retried() {
    let tmp = TempDir::new().unwrap();
    let mut settings = settings(tmp.path());
    let ref_dir = tmp.path().join("ref");
    fs::create_dir(&ref_dir).unwrap();
    settings.reference.ref_dir = Some(ref_dir.clone());
    settings.reference.python = "sh".to_string();
    settings.reference.scripts_dir = write_ref_scripts(tmp.path(), COMPARE_WITH_MATCH, APPEND_RECORDING);
    settings.alerts.alerts_dir = tmp.path().join("alerts");
    write_file(&settings.watch_dir, "labA", "s1.json", "{}");

    let sink = RecordingSink::default();
    let mut engine = Engine::new(profile_stage(&settings, vec![Box::new(sink.clone())]));

    let held = DirLock::new(&ref_dir)
        .acquire(Duration::from_secs(3600), false)
        .unwrap();
    let first = engine.run_once().await;
    assert_eq!(first.succeeded(), 1);
    assert!(appended(&ref_dir).is_empty());
    held.release().unwrap();

    // Nothing new to profile, but the queued update goes through
    let second = engine.run_once().await;
    assert_eq!(second.fresh, 0);
    let lines = appended(&ref_dir);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("cgmlst.profile.labA_"));
    assert!(!DirLock::new(&ref_dir).marker_path().exists());

    // Match from the comparator was saved and raised
    assert_eq!(fs::read_dir(&settings.alerts.alerts_dir).unwrap().count(), 1);
    assert_eq!(sink.delivered()[0].samples, vec!["S1", "REF1"]);

    engine.run_once().await;
    assert_eq!(appended(&ref_dir).len(), 1);
}

#[tokio::test]
async fn test_cluster_follow_up_scans_own_run_only() {
    let tmp = TempDir::new().unwrap();
    let cluster_base = tmp.path().join("clusters");
    write_file(&cluster_base, "labA", "2024-01-01_1_clusterComposition.tsv", "1\tc1\t2\tOLD1,OLD2\n");
    write_file(&cluster_base, "labA", "2024-01-01_2_clusterComposition.tsv", "1\tc1\t2\tS1,S2\n");
    write_file(&cluster_base, "labA", "2024-01-01_2_partitions.tsv", TSV);

    let sink = RecordingSink::default();
    let follow_up = ClusterAlertFollowUp::new(cluster_base.clone(), 10, vec![Box::new(sink.clone())]);

    let group = WorkGroup {
        subfolder: "labA".to_string(),
        units: vec![WorkUnit {
            key: "labA:2024-01-01_2".to_string(),
            subfolder: "labA".to_string(),
            label: "2024-01-01_2".to_string(),
            path: tmp.path().join("profile"),
            companion: None,
        }],
    };
    follow_up
        .on_success(&group, &CommandSpec::new("docker", "2024-01-01_2"))
        .await;

    let alerts = sink.delivered();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].samples, vec!["S1", "S2"]);
    assert_eq!(alerts[0].threshold, 10);
}

#[tokio::test]
async fn test_cluster_follow_up_without_output() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("labA")).unwrap();

    let sink = RecordingSink::default();
    let follow_up = ClusterAlertFollowUp::new(tmp.path().to_path_buf(), 10, vec![Box::new(sink.clone())]);
    let group = WorkGroup {
        subfolder: "labA".to_string(),
        units: vec![],
    };
    follow_up.on_success(&group, &CommandSpec::new("docker", "x")).await;

    assert!(sink.delivered().is_empty());
}
