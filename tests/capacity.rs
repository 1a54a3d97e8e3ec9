//! Capacity thresholds, storage-set failover and concurrent versioning.

mod common;

use std::collections::BTreeSet;

use archivist_core::{ArchiveError, ArchiveStatus, ErrorCode, NotificationKind};
use common::{Fixture, MB, RecordingNotifier, SetSpec, push};

fn text(len: u64) -> Vec<u8> {
    vec![b'a'; len as usize]
}

#[test]
fn completed_disk_fails_over_to_the_next_set() {
    let fx = Fixture::with_sets(
        &[
            SetSpec::sync("set1", "p1", &["r1"]),
            SetSpec::sync("set2", "p2", &["r2"]),
        ],
        3 * MB,
    );
    let notifier = RecordingNotifier::new();
    let archiver = fx.builder().notifier(notifier.clone()).open().unwrap();
    let big = text(5 * MB / 2);

    let first = push(&archiver, "a.txt", &big);
    assert_eq!(first.status, ArchiveStatus::Success, "{}", first.message);
    assert_eq!(first.disk_id.as_deref(), Some("p1"));
    assert!(archiver.registry().disk_state("p1").unwrap().completed);
    assert!(archiver.registry().disk_state("r1").unwrap().completed);

    let second = push(&archiver, "b.txt", &big);
    assert_eq!(second.status, ArchiveStatus::Success, "{}", second.message);
    assert_eq!(second.disk_id.as_deref(), Some("p2"));

    let third = push(&archiver, "c.txt", &big);
    assert_eq!(third.status, ArchiveStatus::Failure);
    assert_eq!(third.code, Some(ErrorCode::NoFreeStorageSet));
    assert!(fx.staging_entries("p1").is_empty());
    assert!(fx.staging_entries("p2").is_empty());
    assert!(fx.bad_file_entries().is_empty());
    assert!(fx.backlog_entries().is_empty());

    let changes: Vec<String> = notifier
        .events()
        .into_iter()
        .filter(|n| n.kind == NotificationKind::DiskChange)
        .map(|n| n.subject)
        .collect();
    assert_eq!(changes, ["p1", "r1", "p2", "r2"]);

    assert!(matches!(
        archiver.registry().record_write("p1", 1),
        Err(ArchiveError::DiskCompleted { .. })
    ));
}

#[test]
fn space_warning_is_raised_once_per_disk() {
    let fx = Fixture::with_sets(&[SetSpec::sync("set1", "p1", &["r1"])], 4 * MB);
    let notifier = RecordingNotifier::new();
    let archiver = fx.builder().notifier(notifier.clone()).open().unwrap();

    for (name, len) in [("a.txt", 3 * MB / 2), ("b.txt", 3 * MB / 4), ("c.txt", MB / 4)] {
        let outcome = push(&archiver, name, &text(len));
        assert!(outcome.is_success(), "{}", outcome.message);
    }

    let warned: Vec<String> = notifier
        .events()
        .into_iter()
        .filter(|n| n.kind == NotificationKind::SpaceWarning)
        .map(|n| n.subject)
        .collect();
    assert_eq!(warned, ["p1", "r1"]);
    assert!(
        !notifier
            .events()
            .iter()
            .any(|n| n.kind == NotificationKind::DiskChange)
    );
}

#[test]
fn mutex_set_completes_together() {
    let fx = Fixture::with_sets(&[SetSpec::sync("set1", "p1", &["r1"]).mutex()], 3 * MB);
    let notifier = RecordingNotifier::new();
    let archiver = fx.builder().notifier(notifier.clone()).open().unwrap();

    let outcome = push(&archiver, "a.txt", &text(5 * MB / 2));
    assert_eq!(outcome.status, ArchiveStatus::Success, "{}", outcome.message);
    assert_eq!(
        archiver
            .catalog()
            .get_file_location("a.txt", 1, None)
            .unwrap()
            .len(),
        2
    );
    assert!(archiver.registry().disk_state("p1").unwrap().completed);
    let replica = archiver.registry().disk_state("r1").unwrap();
    assert!(replica.completed);
    // booked together with the primary, before the set completed
    assert_eq!(replica.used_bytes, 5 * MB / 2);
    assert!(matches!(
        archiver.registry().record_write("r1", 1),
        Err(ArchiveError::DiskCompleted { .. })
    ));

    let changes: Vec<_> = notifier
        .events()
        .into_iter()
        .filter(|n| n.kind == NotificationKind::DiskChange)
        .collect();
    assert_eq!(changes.len(), 1);
    assert_eq!(
        changes[0].details.get("completed_disks").map(String::as_str),
        Some("p1,r1")
    );

    let next = push(&archiver, "b.txt", b"small");
    assert_eq!(next.code, Some(ErrorCode::NoFreeStorageSet));
}

#[test]
fn operator_reopens_a_completed_disk() {
    let fx = Fixture::with_sets(&[SetSpec::sync("set1", "p1", &[])], 3 * MB);
    let archiver = fx.open();
    assert!(push(&archiver, "a.txt", &text(5 * MB / 2)).is_success());
    assert_eq!(
        push(&archiver, "b.txt", b"x").code,
        Some(ErrorCode::NoFreeStorageSet)
    );

    archiver.registry().release_write("p1", 5 * MB / 2).unwrap();
    archiver.registry().set_completed("p1", false).unwrap();
    assert!(push(&archiver, "b.txt", b"x").is_success());
}

#[test]
fn concurrent_pushes_get_distinct_versions() {
    let fx = Fixture::single_set();
    let archiver = fx.open();

    let versions: Vec<u32> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let archiver = &archiver;
                scope.spawn(move || {
                    (0..5)
                        .map(|i| {
                            let body = format!("worker {worker} copy {i}");
                            let outcome = push(archiver, "shared.txt", body.as_bytes());
                            assert!(outcome.is_success(), "{}", outcome.message);
                            outcome.version.unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });

    let unique: BTreeSet<u32> = versions.iter().copied().collect();
    assert_eq!(unique, (1..=40).collect::<BTreeSet<u32>>());
    assert_eq!(
        archiver.catalog().get_max_version("shared.txt").unwrap(),
        Some(40)
    );
    for version in [1, 17, 40] {
        let rows = archiver
            .catalog()
            .get_file_location("shared.txt", version, None)
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| fx.mount(&r.disk_id).join(&r.filename).is_file()));
    }
    assert!(fx.staging_entries("p1").is_empty());
}
