//! Deferral of retryable commit failures and the replay sweep.

mod common;

use std::sync::atomic::Ordering;

use archivist_core::{ArchiveRequest, ArchiveStatus, ErrorCode, ReplayReport};
use common::{FlakyCatalog, Fixture, fits_bytes, push};

fn names(paths: &[std::path::PathBuf]) -> Vec<String> {
    paths
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect()
}

#[test]
fn transient_catalog_failure_buffers_and_replays() {
    let fx = Fixture::single_set();
    let catalog = FlakyCatalog::new();
    let archiver = fx.builder().catalog(catalog.clone()).open().unwrap();
    let bytes = fits_bytes(1);

    catalog.fail_next_inserts(1);
    let outcome = push(&archiver, "obs.fits", &bytes);
    assert_eq!(outcome.status, ArchiveStatus::Buffered, "{}", outcome.message);
    assert_eq!(outcome.code, Some(ErrorCode::CatalogUnavailable));
    assert_eq!(outcome.file_id.as_deref(), Some("obs.fits"));
    assert!(catalog.rows().is_empty());

    // data file plus record
    assert_eq!(fx.backlog_entries().len(), 2);
    assert!(fx.staging_entries("p1").is_empty());
    assert!(fx.bad_file_entries().is_empty());
    // the committed primary bytes stay put until the replay lands on them
    assert_eq!(archiver.find_orphans("p1").unwrap().len(), 1);
    assert!(archiver.find_orphans("r1").unwrap().is_empty());

    let entries = archiver.backlog().entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].record.failure.code, ErrorCode::CatalogUnavailable);
    assert_eq!(entries[0].record.attempts, 0);

    let report = archiver.replay_backlog().unwrap();
    assert_eq!(
        report,
        ReplayReport {
            replayed: 1,
            ..ReplayReport::default()
        }
    );
    let rows = catalog.rows();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.version == 1));
    assert!(fx.backlog_entries().is_empty());
    assert!(fx.staging_entries("p1").is_empty());
    assert!(archiver.find_orphans("p1").unwrap().is_empty());

    let primary = rows.iter().find(|r| r.disk_id == "p1").unwrap();
    assert_eq!(std::fs::read(fx.mount("p1").join(&primary.filename)).unwrap(), bytes);
}

#[test]
fn replay_that_fails_again_keeps_the_entry() {
    let fx = Fixture::single_set();
    let catalog = FlakyCatalog::new();
    let archiver = fx.builder().catalog(catalog.clone()).open().unwrap();

    catalog.fail_next_inserts(2);
    assert_eq!(
        push(&archiver, "obs.fits", &fits_bytes(1)).status,
        ArchiveStatus::Buffered
    );

    let report = archiver.replay_backlog().unwrap();
    assert_eq!(report.still_buffered, 1);
    assert_eq!(report.replayed, 0);
    let entries = archiver.backlog().entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].record.attempts, 1);
    assert!(fx.staging_entries("p1").is_empty());

    let report = archiver.replay_backlog().unwrap();
    assert_eq!(report.replayed, 1);
    assert!(archiver.backlog().entries().unwrap().is_empty());
}

#[test]
fn replay_that_fails_terminally_quarantines() {
    let fx = Fixture::single_set();
    let catalog = FlakyCatalog::new();
    let archiver = fx.builder().catalog(catalog.clone()).open().unwrap();

    catalog.fail_next_inserts(1);
    push(&archiver, "obs.fits", &fits_bytes(1));

    catalog.permanent.store(true, Ordering::SeqCst);
    catalog.fail_next_inserts(1);
    let report = archiver.replay_backlog().unwrap();
    assert_eq!(report.quarantined, 1);
    assert!(fx.backlog_entries().is_empty());

    let bad = names(&fx.bad_file_entries());
    assert_eq!(bad.len(), 2, "{bad:?}");
    assert!(bad[0].starts_with("BAD-FILE-UNRETRYABLE-"));
    assert!(bad[1].ends_with(".req.json"));
}

#[test]
fn locked_entries_are_skipped() {
    let fx = Fixture::single_set();
    let catalog = FlakyCatalog::new();
    let archiver = fx.builder().catalog(catalog.clone()).open().unwrap();

    catalog.fail_next_inserts(1);
    push(&archiver, "obs.fits", &fits_bytes(1));

    let entries = archiver.backlog().entries().unwrap();
    let held = archiver.backlog().try_lock(&entries[0]).unwrap();
    assert!(held.is_some());

    let report = archiver.replay_backlog().unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(archiver.backlog().entries().unwrap().len(), 1);

    drop(held);
    assert_eq!(archiver.replay_backlog().unwrap().replayed, 1);
}

#[test]
fn disabled_back_log_quarantines_retryable_failures() {
    let mut fx = Fixture::single_set();
    fx.config.back_log_buffering = false;
    let catalog = FlakyCatalog::new();
    let archiver = fx.builder().catalog(catalog.clone()).open().unwrap();

    catalog.fail_next_inserts(1);
    let outcome = push(&archiver, "obs.fits", &fits_bytes(1));
    assert_eq!(outcome.status, ArchiveStatus::Failure);
    assert_eq!(outcome.code, Some(ErrorCode::CatalogUnavailable));

    let bad = names(&fx.bad_file_entries());
    assert_eq!(bad.len(), 2, "{bad:?}");
    assert!(bad[0].starts_with("BAD-FILE-UNRETRYABLE-"));
    assert!(fx.backlog_entries().is_empty());
    assert!(fx.staging_entries("p1").is_empty());
}

#[test]
fn permanent_catalog_error_is_not_buffered() {
    let fx = Fixture::single_set();
    let catalog = FlakyCatalog::new();
    catalog.permanent.store(true, Ordering::SeqCst);
    let archiver = fx.builder().catalog(catalog.clone()).open().unwrap();

    catalog.fail_next_inserts(1);
    let outcome = push(&archiver, "obs.fits", &fits_bytes(1));
    assert_eq!(outcome.status, ArchiveStatus::Failure);
    assert_eq!(outcome.code, Some(ErrorCode::CatalogRejected));
    assert!(fx.backlog_entries().is_empty());
    assert_eq!(fx.bad_file_entries().len(), 2);
    assert!(fx.staging_entries("p1").is_empty());
}

#[test]
fn sync_replica_failure_is_buffered() {
    let fx = Fixture::single_set();
    let archiver = fx.open();
    let replica_content = fx.mount("r1").join("saf");
    std::fs::remove_dir_all(&replica_content).ok();
    std::fs::write(&replica_content, b"not a directory").unwrap();

    let outcome = push(&archiver, "obs.fits", &fits_bytes(1));
    assert_eq!(outcome.status, ArchiveStatus::Buffered, "{}", outcome.message);
    assert_eq!(outcome.code, Some(ErrorCode::ReplicaWrite));
    assert!(archiver.catalog().get_max_version("obs.fits").unwrap().is_none());

    std::fs::remove_file(&replica_content).unwrap();
    assert_eq!(archiver.replay_backlog().unwrap().replayed, 1);
    assert_eq!(
        archiver
            .catalog()
            .get_file_location("obs.fits", 1, None)
            .unwrap()
            .len(),
        2
    );
}

#[test]
fn failed_overwrite_keeps_the_cataloged_copies() {
    let fx = Fixture::single_set();
    let catalog = FlakyCatalog::new();
    let archiver = fx.builder().catalog(catalog.clone()).open().unwrap();
    let original = fits_bytes(1);
    let replacement = fits_bytes(2);
    assert!(push(&archiver, "obs.fits", &original).is_success());
    let before = catalog.rows();
    assert_eq!(before.len(), 2);

    catalog.fail_next_inserts(1);
    let request = ArchiveRequest::push("obs.fits").no_versioning();
    let outcome = archiver.archive(&request, &mut &replacement[..]);
    assert_eq!(outcome.status, ArchiveStatus::Buffered, "{}", outcome.message);

    // the existing rows still own their bytes
    assert_eq!(catalog.rows(), before);
    for row in &before {
        let stored = std::fs::read(fx.mount(&row.disk_id).join(&row.filename)).unwrap();
        assert_eq!(stored, original);
    }
    let reports = archiver.verify_file("obs.fits", 1, None).unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.status.is_ok()), "{reports:?}");

    assert_eq!(archiver.replay_backlog().unwrap().replayed, 1);
    let rows = catalog.rows();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(row.version, 1);
        assert_eq!(row.size, replacement.len() as u64);
        let stored = std::fs::read(fx.mount(&row.disk_id).join(&row.filename)).unwrap();
        assert_eq!(stored, replacement);
    }
    let reports = archiver.verify_file("obs.fits", 1, None).unwrap();
    assert!(reports.iter().all(|r| r.status.is_ok()), "{reports:?}");
    assert!(archiver.find_orphans("p1").unwrap().is_empty());
    assert!(archiver.find_orphans("r1").unwrap().is_empty());
}
