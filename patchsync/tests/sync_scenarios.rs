//! End-to-end synchronization runs over a real directory and an in-memory
//! remote source.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use patchsync::fileops::checksum::digest_hex;
use patchsync::transfer::{part_path, ProgressMarker};
use patchsync::{
    CancellationFlag, Manifest, ManifestEntry, MemorySource, ProgressMonitor, ProgressSnapshot,
    RemoteSource, RetryBackoff, SyncConfig, SyncError, Synchronizer, VersionMarker,
};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

fn sha(data: &[u8]) -> String {
    digest_hex(Sha256::new_with_prefix(data))
}

fn payload(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8) | 1).collect()
}

fn entry(path: &str, data: &[u8], remote: &str) -> ManifestEntry {
    ManifestEntry::new(path, sha(data), data.len() as u64, remote)
}

fn config(root: &Path) -> SyncConfig {
    SyncConfig::new(root)
        .with_worker_count(4)
        .with_backoff(RetryBackoff::none())
        .with_progress_interval(Duration::from_millis(10))
}

fn synchronizer(config: SyncConfig, source: &Arc<MemorySource>) -> Synchronizer {
    let source: Arc<dyn RemoteSource> = source.clone();
    Synchronizer::with_source(config, source, CancellationFlag::new())
}

struct Fixture {
    temp: TempDir,
    source: Arc<MemorySource>,
    manifest: Manifest,
    h1: Vec<u8>,
    h2: Vec<u8>,
}

/// Manifest {A(H1,100), B(H1,100), C(H2,50)}.
fn abc_fixture() -> Fixture {
    let h1 = payload(1, 100);
    let h2 = payload(7, 50);
    let source = Arc::new(
        MemorySource::new()
            .with_file("r/h1", h1.clone())
            .with_file("r/h2", h2.clone()),
    );
    let manifest = Manifest::new(vec![
        entry("A", &h1, "r/h1"),
        entry("dir/B", &h1, "r/h1"),
        entry("C", &h2, "r/h2"),
    ])
    .unwrap();
    Fixture {
        temp: TempDir::new().unwrap(),
        source,
        manifest,
        h1,
        h2,
    }
}

#[test]
fn test_fresh_install_downloads_once_per_bundle() {
    let f = abc_fixture();
    let sync = synchronizer(config(f.temp.path()), &f.source);

    let report = sync.run(&f.manifest, None).unwrap();

    assert_eq!(report.bundles, 2);
    assert_eq!(report.validated_bundles, 2);
    assert_eq!(report.downloads, 2);
    assert_eq!(report.copies, 1);
    assert_eq!(report.bytes_transferred, 150);
    assert_eq!(f.source.open_count(), 2);

    assert_eq!(fs::read(f.temp.path().join("A")).unwrap(), f.h1);
    assert_eq!(fs::read(f.temp.path().join("dir/B")).unwrap(), f.h1);
    assert_eq!(fs::read(f.temp.path().join("C")).unwrap(), f.h2);
    assert!(!f.temp.path().join("A.part").exists());
    assert!(!f.temp.path().join("A.progress").exists());
}

#[test]
fn test_second_run_is_idempotent() {
    let f = abc_fixture();
    synchronizer(config(f.temp.path()), &f.source)
        .run(&f.manifest, None)
        .unwrap();

    let report = synchronizer(config(f.temp.path()), &f.source)
        .run(&f.manifest, None)
        .unwrap();

    assert_eq!(report.downloads, 0);
    assert_eq!(report.copies, 0);
    assert_eq!(f.source.open_count(), 2);
    for (_, audit) in &report.audit {
        assert_eq!(audit, "V");
    }
}

#[test]
fn test_repair_from_local_sibling() {
    let temp = TempDir::new().unwrap();
    let data = payload(3, 64);
    let source = Arc::new(MemorySource::new().with_file("r/x", data.clone()));
    let manifest = Manifest::new(
        (0..4)
            .map(|i| entry(&format!("copy{}.bin", i), &data, "r/x"))
            .collect(),
    )
    .unwrap();
    fs::write(temp.path().join("copy2.bin"), &data).unwrap();
    fs::write(temp.path().join("copy0.bin"), b"corrupt").unwrap();

    let report = synchronizer(config(temp.path()), &source)
        .run(&manifest, None)
        .unwrap();

    assert_eq!(source.open_count(), 0);
    assert_eq!(report.downloads, 0);
    assert_eq!(report.copies, 3);
    for i in 0..4 {
        assert_eq!(fs::read(temp.path().join(format!("copy{}.bin", i))).unwrap(), data);
    }
}

#[test]
fn test_transient_failures_are_retried() {
    let temp = TempDir::new().unwrap();
    let data = payload(9, 200);
    let source = Arc::new(MemorySource::new().with_file("r/x", data.clone()));
    source.fail_next("r/x", 2);
    let manifest = Manifest::new(vec![entry("x.bin", &data, "r/x")]).unwrap();

    let report = synchronizer(config(temp.path()).with_retries(5), &source)
        .run(&manifest, None)
        .unwrap();

    assert_eq!(report.validated_bundles, 1);
    assert_eq!(report.audit[0].1, "VDDDV");
    assert_eq!(fs::read(temp.path().join("x.bin")).unwrap(), data);
}

#[test]
fn test_exhausted_retries_report_error() {
    let temp = TempDir::new().unwrap();
    let data = payload(9, 20);
    let source = Arc::new(MemorySource::new().with_file("r/x", data.clone()));
    source.fail_next("r/x", 10);
    let manifest = Manifest::new(vec![entry("x.bin", &data, "r/x")]).unwrap();

    let err = synchronizer(config(temp.path()).with_retries(2), &source)
        .run(&manifest, None)
        .unwrap_err();

    match err {
        SyncError::Aggregate { message, failures } => {
            assert_eq!(failures, 1);
            assert!(message.contains("injected failure"), "{}", message);
            assert!(message.contains("after 3 attempt(s)"), "{}", message);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!temp.path().join("x.bin").exists());
}

#[test]
fn test_every_failed_bundle_is_reported() {
    let temp = TempDir::new().unwrap();
    let source = Arc::new(MemorySource::new());
    let manifest = Manifest::new(
        (0..3u8)
            .map(|i| entry(&format!("f{}", i), &payload(i, 10), "r/missing"))
            .collect(),
    )
    .unwrap();

    let err = synchronizer(config(temp.path()).with_retries(0), &source)
        .run(&manifest, None)
        .unwrap_err();

    let SyncError::Aggregate { message, failures } = err else {
        panic!("expected aggregate error");
    };
    assert_eq!(failures, 3);
    assert_eq!(message.lines().count(), 3);
    assert!(message.contains("not found"));
}

#[test]
fn test_verify_only_never_downloads() {
    let f = abc_fixture();
    fs::write(f.temp.path().join("A"), &f.h1).unwrap();
    let sync = synchronizer(config(f.temp.path()).with_verify_only(true), &f.source);

    let err = sync.run(&f.manifest, None).unwrap_err();

    assert_eq!(f.source.open_count(), 0);
    // B is repaired locally; C has no local source.
    assert_eq!(fs::read(f.temp.path().join("dir/B")).unwrap(), f.h1);
    let SyncError::Aggregate { message, failures } = err else {
        panic!("expected aggregate error");
    };
    assert_eq!(failures, 1);
    assert!(message.contains("C: missing or corrupt, needs download"));
}

#[test]
fn test_cancelled_run_returns_cancelled() {
    let f = abc_fixture();
    let cancel = CancellationFlag::new();
    cancel.cancel();
    let source: Arc<dyn RemoteSource> = f.source.clone();
    let sync = Synchronizer::with_source(config(f.temp.path()), source, cancel);

    let result = sync.run(&f.manifest, None);

    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert_eq!(f.source.open_count(), 0);
}

#[test]
fn test_partial_transfer_resumes() {
    let temp = TempDir::new().unwrap();
    let data = payload(5, 1000);
    let source = Arc::new(MemorySource::new().with_file("r/big", data.clone()));
    let manifest = Manifest::new(vec![entry("big.bin", &data, "r/big")]).unwrap();

    let target = temp.path().join("big.bin");
    fs::write(part_path(&target), &data[..400]).unwrap();
    ProgressMarker::new(400, 1000, "v1").store(&target).unwrap();

    let report = synchronizer(config(temp.path()), &source)
        .run(&manifest, None)
        .unwrap();

    assert_eq!(report.bytes_transferred, 600);
    assert_eq!(fs::read(&target).unwrap(), data);
}

#[test]
fn test_version_marker_written_after_success() {
    let f = abc_fixture();
    let config = config(f.temp.path()).with_version_marker(VersionMarker::new(".version", "2.1"));

    synchronizer(config, &f.source).run(&f.manifest, None).unwrap();

    assert_eq!(
        fs::read_to_string(f.temp.path().join(".version")).unwrap(),
        "2.1"
    );
    assert!(!f.temp.path().join(".version.new").exists());
}

#[derive(Default)]
struct Recorder {
    snapshots: Mutex<Vec<ProgressSnapshot>>,
}

impl ProgressMonitor for Recorder {
    fn on_progress(&self, snapshot: ProgressSnapshot) {
        self.snapshots.lock().push(snapshot);
    }
}

#[test]
fn test_progress_reaches_total() {
    let f = abc_fixture();
    let recorder = Arc::new(Recorder::default());
    let monitor: Arc<dyn ProgressMonitor> = recorder.clone();

    let report = synchronizer(config(f.temp.path()), &f.source)
        .run(&f.manifest, Some(monitor))
        .unwrap();

    assert_eq!(report.progress.total, 250);
    assert_eq!(report.progress.validated, 250);
    let snapshots = recorder.snapshots.lock();
    assert_eq!(snapshots.last().map(|s| s.validated), Some(250));
    for pair in snapshots.windows(2) {
        assert!(pair[0].validated <= pair[1].validated);
        assert!(pair[0].transferred <= pair[1].transferred);
    }
}
