//! Integration tests for the reference dataset lock

use smitt_common::lock::{DirLock, Lease, LockError, OWNER_FILE};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tempfile::TempDir;

const TTL: Duration = Duration::from_secs(3600);

#[test]
fn test_release_without_lock_is_ok() {
    let temp_dir = TempDir::new().unwrap();
    let lock = DirLock::new(temp_dir.path().join("ref"));

    lock.release().unwrap();
    lock.release().unwrap();
    assert!(!lock.marker_path().exists());
}

#[test]
fn test_second_acquire_is_busy_until_release() {
    let temp_dir = TempDir::new().unwrap();
    let lock = DirLock::new(temp_dir.path().join("ref"));

    let guard = lock.acquire(TTL, false).unwrap();
    assert!(matches!(lock.acquire(TTL, false), Err(LockError::Busy { .. })));
    // force does not break a fresh lock
    assert!(matches!(lock.acquire(TTL, true), Err(LockError::Busy { .. })));

    drop(guard);
    let again = lock.acquire(TTL, false).unwrap();
    again.release().unwrap();
}

#[test]
fn test_marker_lives_beside_resource() {
    let temp_dir = TempDir::new().unwrap();
    let ref_dir = temp_dir.path().join("ref");
    std::fs::create_dir(&ref_dir).unwrap();

    let lock = DirLock::new(&ref_dir);
    let _guard = lock.acquire(TTL, false).unwrap();

    let marker = temp_dir.path().join("ref.lock");
    assert!(marker.is_dir());
    assert!(marker.join(OWNER_FILE).is_file());
    // The resource directory itself is untouched
    assert_eq!(std::fs::read_dir(&ref_dir).unwrap().count(), 0);
}

#[test]
fn test_is_stale_reports_fresh_and_missing() {
    let temp_dir = TempDir::new().unwrap();
    let lock = DirLock::new(temp_dir.path().join("ref"));

    assert!(!lock.is_stale(TTL).unwrap());
    let _guard = lock.acquire(TTL, false).unwrap();
    assert!(!lock.is_stale(TTL).unwrap());
}

#[test]
fn test_concurrent_acquire_has_single_winner() {
    let temp_dir = TempDir::new().unwrap();
    let ref_dir = temp_dir.path().join("ref");
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            let ref_dir = ref_dir.clone();
            std::thread::spawn(move || {
                let lock = DirLock::new(&ref_dir);
                barrier.wait();
                // Leak winners so the lock stays held for the whole race
                lock.acquire(TTL, false).map(std::mem::forget).is_ok()
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);

    DirLock::new(&ref_dir).release().unwrap();
}
