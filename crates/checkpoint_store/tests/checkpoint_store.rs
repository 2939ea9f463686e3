use std::fs;
use std::path::PathBuf;

use checkpoint_store::{
    checkpoint_root, CheckpointError, CheckpointOrigin, CheckpointStore, FileState,
    RestoreOutcome, LAST,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    project: PathBuf,
    data: PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let project = dir.path().join("project");
    let data = dir.path().join("data");
    fs::create_dir_all(&project).expect("project dir");
    Fixture {
        _dir: dir,
        project,
        data,
    }
}

fn open(fixture: &Fixture, session_id: &str) -> CheckpointStore {
    CheckpointStore::open(&checkpoint_root(&fixture.data), session_id).expect("store opens")
}

#[test]
fn restore_round_trips_file_content_byte_for_byte() {
    let fixture = fixture();
    let mut store = open(&fixture, "s1");
    let file = fixture.project.join("notes.bin");
    let original = vec![0_u8, 159, 146, 150, b'\n', b'x'];
    fs::write(&file, &original).expect("seed file");

    let checkpoint = store
        .snapshot(&[file.clone()], Some("before edit"), CheckpointOrigin::Auto)
        .expect("snapshot");
    fs::write(&file, b"overwritten").expect("mutate");

    let report = store.restore(&checkpoint.id).expect("restore");

    assert_eq!(fs::read(&file).expect("read back"), original);
    assert_eq!(report.paths, vec![(file, RestoreOutcome::Restored)]);
    assert!(report.is_complete());
}

#[test]
fn absent_paths_are_deleted_on_restore_and_parents_recreated() {
    let fixture = fixture();
    let mut store = open(&fixture, "s1");
    let created = fixture.project.join("new/deep/file.txt");
    let existing = fixture.project.join("gone/kept.txt");
    fs::create_dir_all(existing.parent().expect("parent")).expect("gone dir");
    fs::write(&existing, "keep me").expect("seed");

    let checkpoint = store
        .snapshot(
            &[created.clone(), existing.clone()],
            None,
            CheckpointOrigin::Auto,
        )
        .expect("snapshot");
    assert_eq!(
        checkpoint
            .entries
            .iter()
            .find(|entry| entry.path == created)
            .map(|entry| &entry.state),
        Some(&FileState::Absent)
    );

    fs::create_dir_all(created.parent().expect("parent")).expect("mkdir");
    fs::write(&created, "agent output").expect("create");
    fs::remove_dir_all(fixture.project.join("gone")).expect("remove dir");

    let report = store.restore(LAST).expect("restore");

    assert!(!created.exists());
    assert_eq!(fs::read_to_string(&existing).expect("restored"), "keep me");
    assert!(report.paths.contains(&(created, RestoreOutcome::Deleted)));
    assert!(report.paths.contains(&(existing, RestoreOutcome::Restored)));
}

#[test]
fn restoring_last_twice_returns_to_the_state_before_the_first_restore() {
    let fixture = fixture();
    let mut store = open(&fixture, "s1");
    let file = fixture.project.join("a.txt");
    fs::write(&file, "v1").expect("v1");
    store
        .snapshot(&[file.clone()], None, CheckpointOrigin::Auto)
        .expect("snapshot");
    fs::write(&file, "v2").expect("v2");

    let first = store.restore(LAST).expect("first restore");
    assert_eq!(fs::read_to_string(&file).expect("after first"), "v1");

    let second = store.restore(LAST).expect("second restore");
    assert_eq!(second.checkpoint_id, first.pre_restore_id);
    assert_eq!(fs::read_to_string(&file).expect("after second"), "v2");
}

#[test]
fn unchanged_files_are_reported_and_not_rewritten() {
    let fixture = fixture();
    let mut store = open(&fixture, "s1");
    let file = fixture.project.join("same.txt");
    fs::write(&file, "same").expect("seed");
    let checkpoint = store
        .snapshot(&[file.clone()], None, CheckpointOrigin::Manual)
        .expect("snapshot");

    let report = store.restore(&checkpoint.id).expect("restore");

    assert_eq!(report.paths, vec![(file, RestoreOutcome::Unchanged)]);
}

#[test]
fn one_failing_path_does_not_abort_the_rest() {
    let fixture = fixture();
    let mut store = open(&fixture, "s1");
    let damaged = fixture.project.join("damaged.txt");
    let fine = fixture.project.join("fine.txt");
    fs::write(&damaged, "damaged v1").expect("damaged");
    fs::write(&fine, "fine v1").expect("fine");
    let checkpoint = store
        .snapshot(&[damaged.clone(), fine.clone()], None, CheckpointOrigin::Auto)
        .expect("snapshot");

    let FileState::Present { hash, .. } = &checkpoint.entries[0].state else {
        panic!("damaged.txt should be recorded as present");
    };
    let object = checkpoint_root(&fixture.data)
        .join("objects")
        .join(&hash[..2])
        .join(&hash[2..]);
    fs::write(object, "tampered").expect("tamper object");
    fs::write(&damaged, "damaged v2").expect("damaged v2");
    fs::write(&fine, "fine v2").expect("fine v2");

    let report = store.restore(&checkpoint.id).expect("restore");

    assert_eq!(report.failures(), 1);
    assert!(matches!(&report.paths[0], (path, RestoreOutcome::Failed(_)) if *path == damaged));
    assert_eq!(report.paths[1], (fine.clone(), RestoreOutcome::Restored));
    assert_eq!(fs::read_to_string(&damaged).expect("left alone"), "damaged v2");
    assert_eq!(fs::read_to_string(&fine).expect("restored"), "fine v1");
}

#[test]
fn directories_created_since_the_checkpoint_are_reported_per_path() {
    let fixture = fixture();
    let mut store = open(&fixture, "s1");
    let kept = fixture.project.join("keep.txt");
    let created = fixture.project.join("newdir");
    let occupied = fixture.project.join("occupied");
    let edited = fixture.project.join("edited.txt");
    fs::write(&kept, "v1\n").expect("seed keep");
    fs::write(&edited, "edited v1").expect("seed edited");
    let checkpoint = store
        .snapshot(
            &[kept.clone(), created.clone(), occupied.clone(), edited.clone()],
            None,
            CheckpointOrigin::Auto,
        )
        .expect("snapshot");

    fs::write(&kept, "v2\n").expect("modify keep");
    fs::create_dir(&created).expect("mkdir newdir");
    fs::create_dir_all(occupied.join("inner")).expect("non-empty dir");
    fs::remove_file(&edited).expect("remove edited");
    fs::create_dir(&edited).expect("dir where a file was");

    let report = store.restore(LAST).expect("restore proceeds past directories");

    let outcome = |path: &PathBuf| {
        report
            .paths
            .iter()
            .find(|(recorded, _)| recorded == path)
            .map(|(_, outcome)| outcome.clone())
            .expect("path reported")
    };
    assert_eq!(report.checkpoint_id, checkpoint.id);
    assert_eq!(outcome(&kept), RestoreOutcome::Restored);
    assert_eq!(outcome(&created), RestoreOutcome::Deleted);
    assert!(matches!(outcome(&occupied), RestoreOutcome::Failed(_)));
    assert!(matches!(outcome(&edited), RestoreOutcome::Failed(_)));
    assert_eq!(report.failures(), 2);
    assert_eq!(fs::read_to_string(&kept).expect("restored"), "v1\n");
    assert!(!created.exists());
    assert!(occupied.join("inner").is_dir());

    // Directories are not part of the pre-restore snapshot.
    let pre_restore = store.get(&report.pre_restore_id).expect("pre-restore manifest");
    assert_eq!(pre_restore.paths(), vec![kept.clone()]);
}

#[test]
fn ids_are_monotonic_and_listing_is_newest_first_across_reopen() {
    let fixture = fixture();
    let file = fixture.project.join("a.txt");
    fs::write(&file, "a").expect("seed");
    {
        let mut store = open(&fixture, "s1");
        store
            .snapshot(&[file.clone()], Some("one"), CheckpointOrigin::Auto)
            .expect("first");
        store
            .snapshot(&[file.clone()], Some("two"), CheckpointOrigin::Manual)
            .expect("second");
    }

    let mut store = open(&fixture, "s1");
    let third = store
        .snapshot(&[file], Some("three"), CheckpointOrigin::Auto)
        .expect("third");
    assert_eq!(third.id, "cp-000003");

    let labels = store
        .list()
        .expect("list")
        .into_iter()
        .map(|summary| (summary.id, summary.label))
        .collect::<Vec<_>>();
    assert_eq!(
        labels,
        vec![
            ("cp-000003".to_string(), Some("three".to_string())),
            ("cp-000002".to_string(), Some("two".to_string())),
            ("cp-000001".to_string(), Some("one".to_string())),
        ]
    );
}

#[test]
fn sessions_are_partitioned_but_share_objects() {
    let fixture = fixture();
    let file = fixture.project.join("shared.txt");
    fs::write(&file, "shared bytes").expect("seed");

    let mut first = open(&fixture, "s1");
    let mut second = open(&fixture, "s2");
    let a = first
        .snapshot(&[file.clone()], None, CheckpointOrigin::Auto)
        .expect("s1 snapshot");
    let b = second
        .snapshot(&[file], None, CheckpointOrigin::Auto)
        .expect("s2 snapshot");

    assert_eq!(a.id, b.id);
    assert_eq!(a.entries[0].state, b.entries[0].state);
    assert_eq!(first.list().expect("s1").len(), 1);
    assert_eq!(second.list().expect("s2").len(), 1);

    let objects = checkpoint_root(&fixture.data).join("objects");
    let object_files = fs::read_dir(&objects)
        .expect("objects dir")
        .flat_map(|fan| fs::read_dir(fan.expect("fan").path()).expect("fan dir"))
        .count();
    assert_eq!(object_files, 1);
}

#[test]
fn unknown_ids_and_empty_last_are_not_found() {
    let fixture = fixture();
    let mut store = open(&fixture, "s1");

    assert!(matches!(
        store.resolve(LAST),
        Err(CheckpointError::CheckpointNotFound { .. })
    ));
    assert!(matches!(
        store.restore("cp-000042"),
        Err(CheckpointError::CheckpointNotFound { .. })
    ));
    assert!(matches!(
        store.get("../../etc/passwd"),
        Err(CheckpointError::CheckpointNotFound { .. })
    ));
}

#[test]
fn directories_and_relative_paths_are_refused_without_a_manifest() {
    let fixture = fixture();
    let mut store = open(&fixture, "s1");

    let error = store
        .snapshot(&[fixture.project.clone()], None, CheckpointOrigin::Auto)
        .expect_err("directory");
    assert!(matches!(error, CheckpointError::NotAFile { .. }));

    let error = store
        .snapshot(&[PathBuf::from("relative.txt")], None, CheckpointOrigin::Auto)
        .expect_err("relative");
    assert!(matches!(error, CheckpointError::RelativePath { .. }));

    assert!(store.list().expect("list").is_empty());
}

#[test]
fn retention_prunes_the_oldest_manifests() {
    let fixture = fixture();
    let file = fixture.project.join("a.txt");
    fs::write(&file, "a").expect("seed");
    let mut store = open(&fixture, "s1").with_retention(Some(2));

    for _ in 0..4 {
        store
            .snapshot(&[file.clone()], None, CheckpointOrigin::Auto)
            .expect("snapshot");
    }

    let ids = store
        .list()
        .expect("list")
        .into_iter()
        .map(|summary| summary.id)
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["cp-000004".to_string(), "cp-000003".to_string()]);
    assert!(store.storage_bytes().expect("size") > 0);
}

#[test]
fn deleted_checkpoints_disappear_and_partition_removal_is_idempotent() {
    let fixture = fixture();
    let file = fixture.project.join("a.txt");
    fs::write(&file, "a").expect("seed");
    let mut store = open(&fixture, "s1");
    let checkpoint = store
        .snapshot(&[file], None, CheckpointOrigin::Manual)
        .expect("snapshot");

    store.delete(&checkpoint.id).expect("delete");
    assert!(matches!(
        store.get(&checkpoint.id),
        Err(CheckpointError::CheckpointNotFound { .. })
    ));

    let root = checkpoint_root(&fixture.data);
    CheckpointStore::remove_partition(&root, "s1").expect("remove");
    CheckpointStore::remove_partition(&root, "s1").expect("remove again");
    assert!(!root.join("s1").exists());
}
