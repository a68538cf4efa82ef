//! Cluster composition scanning

use smitt_watch::alert::{composition_files, scan_clusters, scan_file};
use std::fs;
use tempfile::TempDir;

const COMPOSITION: &str = "partition\tcluster\tcluster_length\tsamples\n\
MST-10x1.0\tcluster_1\t2\tS1,S2\n\
MST-10x1.0\tcluster_2\t1\tS3\n\
\n\
MST-10x1.0\tcluster_3\t3\tS4, S5 ,S6\n";

#[test]
fn test_one_alert_per_multi_sample_row() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("2024-01-01_1_clusterComposition.tsv");
    fs::write(&file, COMPOSITION).unwrap();

    let alerts = scan_file(&file, 10).unwrap();
    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts[0].samples, vec!["S1", "S2"]);
    assert_eq!(alerts[1].samples, vec!["S4", "S5", "S6"]);
    assert_eq!(
        alerts[1].message(),
        "Samples S4 and S5 and S6 differ by less than 10 variants. Risk for outbreak!"
    );
    assert_eq!(alerts[0].source, file);
}

#[test]
fn test_composition_row_rules() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("a_clusterComposition.tsv"), "1\tfoo\tbar\tS1,S2\n").unwrap();
    fs::write(tmp.path().join("b_clusterComposition.tsv"), "1\tfoo\tbar\tS1\n").unwrap();
    fs::write(tmp.path().join("c_clusterComposition.tsv"), "1\tfoo\tS1,S2\n").unwrap();

    let alerts = scan_clusters(tmp.path(), 5);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].threshold, 5);
    assert!(alerts[0].source.ends_with("a_clusterComposition.tsv"));
}

#[test]
fn test_only_composition_files_scanned() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("x_partitions.tsv"), "1\tfoo\tbar\tS1,S2\n").unwrap();
    fs::write(tmp.path().join("2024-01-02_1_clusterComposition.tsv"), COMPOSITION).unwrap();
    fs::write(tmp.path().join("2024-01-01_1_clusterComposition.tsv"), COMPOSITION).unwrap();

    let all = composition_files(tmp.path(), None);
    assert_eq!(all.len(), 2);
    assert!(all[0].ends_with("2024-01-01_1_clusterComposition.tsv"));

    let own = composition_files(tmp.path(), Some("2024-01-02_1"));
    assert_eq!(own, vec![tmp.path().join("2024-01-02_1_clusterComposition.tsv")]);
}

#[test]
fn test_missing_dir_yields_nothing() {
    let tmp = TempDir::new().unwrap();
    assert!(scan_clusters(&tmp.path().join("absent"), 10).is_empty());
}

#[test]
fn test_non_utf8_content_still_scanned() {
    let tmp = TempDir::new().unwrap();
    let mut bytes = b"1\tfoo\tbar\tS1,S2\n".to_vec();
    bytes.extend_from_slice(b"2\t\xff\xfe\tbar\tS3\n");
    fs::write(tmp.path().join("x_clusterComposition.tsv"), bytes).unwrap();

    assert_eq!(scan_clusters(tmp.path(), 10).len(), 1);
}
