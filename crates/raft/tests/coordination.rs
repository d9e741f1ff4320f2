//! End-to-end tests over the change log, state machine and snapshot
//! manager together.

use bytes::Bytes;
use changelog::{Changelog, LogEntry, LogFileSettings};
use common::{CoordinationSettings, SessionId, Zxid};
use protocol::request::ResponseBody;
use protocol::{ErrorCode, Request};
use raft::{
    RequestForSession, SnapshotManager, SnapshotMeta, SrvState, StateMachine, StateManager,
    StorageSnapshot,
};
use std::path::Path;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use store::{Node, ServerState, Storage};
use tempfile::{tempdir, TempDir};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn wait_durable(log: &Changelog) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while log.last_durable_index() + 1 != log.next_slot() {
        assert!(Instant::now() < deadline, "flush worker never caught up");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn ext(compress: bool) -> &'static str {
    if compress {
        ".zstd"
    } else {
        ""
    }
}

/// Mirrors the direct-container setup used by the snapshot tests: place a
/// node and wire the parent, bypassing the request pipeline.
fn add_node(storage: &mut Storage, path: &str, data: &str, ephemeral_owner: SessionId) {
    let mut node = Node::new(data.to_string());
    node.stat.ephemeral_owner = ephemeral_owner;
    node.stat.data_length = data.len() as i32;
    storage.container.insert_or_replace(path, node);

    let parent = protocol::paths::parent_path(path).to_string();
    let child = protocol::paths::base_name(path).to_string();
    storage.container.update_value(&parent, |p| {
        if p.children.insert(child) {
            p.stat.num_children += 1;
        }
    });
}

fn settings_for(
    logs: &TempDir,
    snapshots: &TempDir,
    compress: bool,
    snapshot_distance: u64,
    reserved_log_items: u64,
    rotate_interval: u64,
) -> CoordinationSettings {
    CoordinationSettings::builder()
        .log_storage_path(logs.path().to_path_buf())
        .snapshot_storage_path(snapshots.path().to_path_buf())
        .snapshot_distance(snapshot_distance)
        .reserved_log_items(reserved_log_items)
        .rotate_log_storage_interval(rotate_interval)
        .compress_logs(compress)
        .build()
}

fn log_settings(settings: &CoordinationSettings) -> LogFileSettings {
    LogFileSettings::builder()
        .compress(settings.compress_logs)
        .rotate_interval(settings.rotate_log_storage_interval)
        .build()
}

fn new_state_machine(
    settings: &CoordinationSettings,
) -> (
    StateMachine,
    mpsc::Receiver<store::ResponseForSession>,
    mpsc::Receiver<raft::CreateSnapshotTask>,
) {
    let (responses_tx, responses_rx) = mpsc::channel();
    let (snapshots_tx, snapshots_rx) = mpsc::channel();
    let state_machine = StateMachine::new(responses_tx, snapshots_tx, settings).unwrap();
    state_machine.init().unwrap();
    (state_machine, responses_rx, snapshots_rx)
}

fn create_entry(session_id: SessionId, zxid: Zxid, path: &str) -> Vec<u8> {
    RequestForSession::new(session_id, 0, Request::create(path, ""), zxid)
        .encode()
        .unwrap()
}

fn test_log_and_state_machine(
    snapshot_distance: u64,
    reserved_log_items: u64,
    rotate_interval: u64,
    total_logs: u64,
    compress: bool,
) {
    let logs_dir = tempdir().unwrap();
    let snapshots_dir = tempdir().unwrap();
    let settings = settings_for(
        &logs_dir,
        &snapshots_dir,
        compress,
        snapshot_distance,
        reserved_log_items,
        rotate_interval,
    );

    let (state_machine, _responses, snapshots_rx) = new_state_machine(&settings);
    let mut changelog = Changelog::new(logs_dir.path(), log_settings(&settings)).unwrap();
    changelog
        .init(state_machine.last_commit_index() + 1, reserved_log_items)
        .unwrap();

    for i in 1..=total_logs {
        let payload = create_entry(1, i as Zxid, &format!("/hello_{i}"));
        changelog.append(LogEntry::new(0, payload)).unwrap();
        changelog.end_of_append_batch(0, 0).unwrap();
        wait_durable(&changelog);

        let buf = changelog.entry_at(i).unwrap().data.clone();
        state_machine.pre_commit(i, &buf).unwrap();
        state_machine.commit(i, &buf).unwrap();

        let mut snapshot_created = false;
        if i % snapshot_distance == 0 {
            let (done_tx, done_rx) = mpsc::channel();
            state_machine
                .create_snapshot(SnapshotMeta::new(i, 0), move |ok| {
                    let _ = done_tx.send(ok);
                })
                .unwrap();
            let task = snapshots_rx.recv().unwrap();
            task.run();
            snapshot_created = done_rx.recv().unwrap();
            assert!(snapshot_created, "snapshot at {i} failed");
        }
        if snapshot_created && changelog.size() > reserved_log_items {
            changelog.compact(i - reserved_log_items).unwrap();
        }
    }

    let (restore_machine, _responses2, _snapshots2) = new_state_machine(&settings);
    let expected_commit = total_logs - total_logs % snapshot_distance;
    assert_eq!(restore_machine.last_commit_index(), expected_commit);

    let mut restore_changelog = Changelog::new(logs_dir.path(), log_settings(&settings)).unwrap();
    restore_changelog
        .init(restore_machine.last_commit_index() + 1, reserved_log_items)
        .unwrap();

    assert_eq!(
        restore_changelog.size(),
        (reserved_log_items + total_logs % snapshot_distance).min(total_logs)
    );
    assert_eq!(restore_changelog.next_slot(), total_logs + 1);
    if total_logs > reserved_log_items + 1 {
        assert_eq!(
            restore_changelog.start_index(),
            total_logs - total_logs % snapshot_distance - reserved_log_items + 1
        );
    } else {
        assert_eq!(restore_changelog.start_index(), 1);
    }

    for i in restore_machine.last_commit_index() + 1..restore_changelog.next_slot() {
        let buf = restore_changelog.entry_at(i).unwrap().data.clone();
        restore_machine.pre_commit(i, &buf).unwrap();
        restore_machine.commit(i, &buf).unwrap();
    }

    let source = state_machine.storage();
    let source = source.read().unwrap();
    let restored = restore_machine.storage();
    let restored = restored.read().unwrap();
    assert_eq!(source.container.size(), restored.container.size());
    for i in 1..=total_logs {
        let path = format!("/hello_{i}");
        assert_eq!(
            source.container.get(&path).unwrap().data,
            restored.container.get(&path).unwrap().data,
            "node {path} differs after restore"
        );
    }
}

#[test]
fn state_machine_and_log_store() {
    init_tracing();
    for compress in [false, true] {
        test_log_and_state_machine(10, 10, 10, 37, compress);
        test_log_and_state_machine(10, 10, 10, 11, compress);
        test_log_and_state_machine(10, 10, 10, 40, compress);
        test_log_and_state_machine(10, 20, 30, 40, compress);
        test_log_and_state_machine(10, 0, 10, 40, compress);
        test_log_and_state_machine(1, 1, 32, 32, compress);
        test_log_and_state_machine(10, 7, 1, 33, compress);
        test_log_and_state_machine(37, 1000, 5000, 33, compress);
        test_log_and_state_machine(37, 1000, 5000, 45, compress);
    }
}

#[test]
fn ephemeral_node_removed_across_sessions() {
    let logs_dir = tempdir().unwrap();
    let snapshots_dir = tempdir().unwrap();
    let settings = settings_for(&logs_dir, &snapshots_dir, false, 100_000, 100_000, 100_000);
    let (state_machine, _responses, _snapshots) = new_state_machine(&settings);

    let create = RequestForSession::new(
        1,
        0,
        Request::Create {
            path: "/hello".into(),
            data: Bytes::new(),
            is_ephemeral: true,
            is_sequential: false,
            acls: Vec::new(),
        },
        state_machine.next_zxid(),
    )
    .encode()
    .unwrap();
    state_machine.pre_commit(1, &create).unwrap();
    state_machine.commit(1, &create).unwrap();

    {
        let storage = state_machine.storage();
        let storage = storage.read().unwrap();
        assert_eq!(storage.ephemerals.len(), 1);
    }

    // Deleted by a different session.
    let remove = RequestForSession::new(
        2,
        0,
        Request::Remove {
            path: "/hello".into(),
            version: -1,
        },
        state_machine.next_zxid(),
    )
    .encode()
    .unwrap();
    state_machine.pre_commit(2, &remove).unwrap();
    state_machine.commit(2, &remove).unwrap();

    let storage = state_machine.storage();
    let storage = storage.read().unwrap();
    assert_eq!(storage.ephemerals.len(), 0);
}

#[test]
fn commit_responses_are_queued() {
    let logs_dir = tempdir().unwrap();
    let snapshots_dir = tempdir().unwrap();
    let settings = settings_for(&logs_dir, &snapshots_dir, false, 100_000, 100_000, 100_000);
    let (state_machine, responses_rx, _snapshots) = new_state_machine(&settings);

    let payload = create_entry(7, 1, "/queued");
    state_machine.pre_commit(1, &payload).unwrap();
    state_machine.commit(1, &payload).unwrap();
    assert_eq!(state_machine.last_commit_index(), 1);

    let committed = responses_rx.try_recv().unwrap();
    assert_eq!(committed.session_id, 7);
    assert_eq!(committed.response.error, ErrorCode::Ok);
    match committed.response.body {
        ResponseBody::Create { path_created } => assert_eq!(path_created, "/queued"),
        other => panic!("unexpected body {other:?}"),
    }
    assert!(!committed.watch_triggers.is_empty());
}

#[test]
fn rollback_discards_precommitted_entry() {
    let logs_dir = tempdir().unwrap();
    let snapshots_dir = tempdir().unwrap();
    let settings = settings_for(&logs_dir, &snapshots_dir, false, 100_000, 100_000, 100_000);
    let (state_machine, _responses, _snapshots) = new_state_machine(&settings);

    let payload = create_entry(1, 1, "/rolled_back");
    state_machine.pre_commit(1, &payload).unwrap();
    state_machine.rollback(1, &payload).unwrap();

    let replacement = create_entry(1, 1, "/kept");
    state_machine.pre_commit(1, &replacement).unwrap();
    state_machine.commit(1, &replacement).unwrap();

    let storage = state_machine.storage();
    let storage = storage.read().unwrap();
    assert!(!storage.container.contains("/rolled_back"));
    assert!(storage.container.contains("/kept"));
}

fn snapshot_file(dir: &TempDir, idx: u64, compress: bool) -> std::path::PathBuf {
    dir.path().join(format!("snapshot_{idx}.bin{}", ext(compress)))
}

#[test]
fn storage_snapshot_simple() {
    for compress in [false, true] {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), 3, compress).unwrap();

        let mut storage = Storage::new(500, ServerState::Init);
        add_node(&mut storage, "/hello", "world", 1);
        add_node(&mut storage, "/hello/somepath", "somedata", 3);
        storage.session_id_counter = 5;
        storage.zxid = 2;
        storage.get_session_id(130);
        storage.get_session_id(130);
        storage.recalculate_digest();

        let snapshot = StorageSnapshot::capture(&mut storage, SnapshotMeta::new(2, 0));
        assert_eq!(snapshot.meta.last_log_idx, 2);
        assert_eq!(snapshot.session_id_counter, 7);
        assert_eq!(snapshot.snapshot_container_size, 6);
        assert_eq!(snapshot.session_and_timeout.len(), 2);

        let buf = manager.serialize_snapshot_to_buffer(&storage, &snapshot).unwrap();
        manager.serialize_snapshot_buffer_to_disk(&buf, 2).unwrap();
        assert!(snapshot_file(&dir, 2, compress).exists());

        let debuf = manager.deserialize_snapshot_buffer_from_disk(2).unwrap();
        let (restored, meta, _config) = manager.deserialize_snapshot_from_buffer(&debuf).unwrap();

        assert_eq!(meta.last_log_idx, 2);
        assert_eq!(restored.container.size(), 6);
        assert_eq!(restored.container.get("/").unwrap().children.len(), 2);
        assert_eq!(restored.container.get("/hello").unwrap().children.len(), 1);
        assert_eq!(
            restored.container.get("/hello/somepath").unwrap().children.len(),
            0
        );
        assert_eq!(restored.container.get("/").unwrap().data.as_ref(), b"");
        assert_eq!(restored.container.get("/hello").unwrap().data.as_ref(), b"world");
        assert_eq!(
            restored.container.get("/hello/somepath").unwrap().data.as_ref(),
            b"somedata"
        );
        assert_eq!(restored.session_id_counter, 7);
        assert_eq!(restored.zxid, 2);
        assert_eq!(restored.ephemerals.len(), 2);
        assert_eq!(restored.ephemerals.get(&1).unwrap().len(), 1);
        assert_eq!(restored.ephemerals.get(&3).unwrap().len(), 1);
        assert_eq!(restored.session_and_timeout.len(), 2);
    }
}

#[test]
fn storage_snapshot_more_writes() {
    for compress in [false, true] {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), 3, compress).unwrap();

        let mut storage = Storage::new(500, ServerState::Init);
        storage.get_session_id(130);
        for i in 0..50 {
            add_node(&mut storage, &format!("/hello_{i}"), &format!("world_{i}"), 0);
        }
        storage.recalculate_digest();

        let snapshot = StorageSnapshot::capture(&mut storage, SnapshotMeta::new(50, 0));
        assert_eq!(snapshot.meta.last_log_idx, 50);
        assert_eq!(snapshot.snapshot_container_size, 54);

        // Writes racing the serializer land as shadows past the frozen
        // prefix.
        for i in 50..100 {
            add_node(&mut storage, &format!("/hello_{i}"), &format!("world_{i}"), 0);
        }
        assert_eq!(storage.container.size(), 104);

        let buf = manager.serialize_snapshot_to_buffer(&storage, &snapshot).unwrap();
        manager.serialize_snapshot_buffer_to_disk(&buf, 50).unwrap();
        assert!(snapshot_file(&dir, 50, compress).exists());

        let debuf = manager.deserialize_snapshot_buffer_from_disk(50).unwrap();
        let (restored, _, _) = manager.deserialize_snapshot_from_buffer(&debuf).unwrap();

        assert_eq!(restored.container.size(), 54);
        for i in 0..50 {
            assert_eq!(
                restored.container.get(&format!("/hello_{i}")).unwrap().data.as_ref(),
                format!("world_{i}").as_bytes()
            );
        }
    }
}

#[test]
fn storage_snapshot_many_snapshots() {
    for compress in [false, true] {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), 3, compress).unwrap();

        let mut storage = Storage::new(500, ServerState::Init);
        storage.get_session_id(130);

        for j in 1..=5u64 {
            for i in (j - 1) * 50..j * 50 {
                add_node(&mut storage, &format!("/hello_{i}"), &format!("world_{i}"), 0);
            }
            storage.recalculate_digest();
            let snapshot = StorageSnapshot::capture(&mut storage, SnapshotMeta::new(j * 50, 0));
            let buf = manager.serialize_snapshot_to_buffer(&storage, &snapshot).unwrap();
            manager.serialize_snapshot_buffer_to_disk(&buf, j * 50).unwrap();
            assert!(snapshot_file(&dir, j * 50, compress).exists());
            storage.clear_garbage_after_snapshot();
            storage.container.disable_snapshot_mode();
        }

        assert!(!snapshot_file(&dir, 50, compress).exists());
        assert!(!snapshot_file(&dir, 100, compress).exists());
        assert!(snapshot_file(&dir, 150, compress).exists());
        assert!(snapshot_file(&dir, 200, compress).exists());
        assert!(snapshot_file(&dir, 250, compress).exists());

        let (restored, meta, _) = manager.restore_from_latest_snapshot().unwrap().unwrap();
        assert_eq!(meta.last_log_idx, 250);
        assert_eq!(restored.container.size(), 254);
        for i in 0..250 {
            assert_eq!(
                restored.container.get(&format!("/hello_{i}")).unwrap().data.as_ref(),
                format!("world_{i}").as_bytes()
            );
        }
    }
}

#[test]
fn storage_snapshot_mode() {
    for compress in [false, true] {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), 3, compress).unwrap();

        let mut storage = Storage::new(500, ServerState::Init);
        for i in 0..50 {
            add_node(&mut storage, &format!("/hello_{i}"), &format!("world_{i}"), 0);
        }
        storage.recalculate_digest();

        {
            let snapshot = StorageSnapshot::capture(&mut storage, SnapshotMeta::new(50, 0));
            for i in 0..50 {
                add_node(&mut storage, &format!("/hello_{i}"), &format!("wlrd_{i}"), 0);
            }
            for i in 0..50 {
                assert_eq!(
                    storage.container.get(&format!("/hello_{i}")).unwrap().data.as_ref(),
                    format!("wlrd_{i}").as_bytes()
                );
            }
            for i in (0..50).step_by(2) {
                storage.container.erase(&format!("/hello_{i}"));
            }
            assert_eq!(storage.container.size(), 29);
            assert_eq!(storage.container.snapshot_size_with_version().0, 105);
            assert_eq!(storage.container.snapshot_size_with_version().1, 1);

            let buf = manager.serialize_snapshot_to_buffer(&storage, &snapshot).unwrap();
            manager.serialize_snapshot_buffer_to_disk(&buf, 50).unwrap();
        }
        assert!(snapshot_file(&dir, 50, compress).exists());
        assert_eq!(storage.container.size(), 29);

        storage.clear_garbage_after_snapshot();
        storage.container.disable_snapshot_mode();
        assert_eq!(storage.container.snapshot_size_with_version().0, 29);
        for i in 0..50 {
            if i % 2 != 0 {
                assert_eq!(
                    storage.container.get(&format!("/hello_{i}")).unwrap().data.as_ref(),
                    format!("wlrd_{i}").as_bytes()
                );
            } else {
                assert!(!storage.container.contains(&format!("/hello_{i}")));
            }
        }

        let (restored, _, _) = manager.restore_from_latest_snapshot().unwrap().unwrap();
        for i in 0..50 {
            assert_eq!(
                restored.container.get(&format!("/hello_{i}")).unwrap().data.as_ref(),
                format!("world_{i}").as_bytes()
            );
        }
    }
}

#[test]
fn storage_snapshot_broken() {
    for compress in [false, true] {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), 3, compress).unwrap();

        let mut storage = Storage::new(500, ServerState::Init);
        for i in 0..50 {
            add_node(&mut storage, &format!("/hello_{i}"), &format!("world_{i}"), 0);
        }
        storage.recalculate_digest();
        let snapshot = StorageSnapshot::capture(&mut storage, SnapshotMeta::new(50, 0));
        let buf = manager.serialize_snapshot_to_buffer(&storage, &snapshot).unwrap();
        manager.serialize_snapshot_buffer_to_disk(&buf, 50).unwrap();

        let path = snapshot_file(&dir, 50, compress);
        assert!(path.exists());
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(34).unwrap();
        file.sync_all().unwrap();

        // A corrupt snapshot is a hard error, never silently skipped.
        assert!(manager.restore_from_latest_snapshot().is_err());
    }
}

#[test]
fn storage_snapshot_equal() {
    for compress in [false, true] {
        let dir = tempdir().unwrap();
        let mut reference: Option<Vec<u8>> = None;

        for _ in 0..15 {
            let manager = SnapshotManager::new(dir.path(), 3, compress).unwrap();
            let mut storage = Storage::new(500, ServerState::Init);
            add_node(&mut storage, "/hello", "", 0);
            for j in 0..500 {
                add_node(&mut storage, &format!("/hello_{j}"), "world", 1);
                add_node(&mut storage, &format!("/hello/somepath_{j}"), "somedata", 3);
            }
            storage.session_id_counter = 5;
            for j in 0..333 {
                storage.get_session_id(130 * j);
            }
            storage.recalculate_digest();

            let zxid = storage.zxid as u64;
            let snapshot = StorageSnapshot::capture(&mut storage, SnapshotMeta::new(zxid, 0));
            let buf = manager.serialize_snapshot_to_buffer(&storage, &snapshot).unwrap();

            match &reference {
                None => reference = Some(buf),
                Some(previous) => assert_eq!(previous, &buf, "snapshot bytes diverged"),
            }
        }
    }
}

#[test]
fn storage_snapshot_different_compressions() {
    for compress in [false, true] {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), 3, compress).unwrap();

        let mut storage = Storage::new(500, ServerState::Init);
        add_node(&mut storage, "/hello", "world", 1);
        add_node(&mut storage, "/hello/somepath", "somedata", 3);
        storage.session_id_counter = 5;
        storage.zxid = 2;
        storage.get_session_id(130);
        storage.get_session_id(130);
        storage.recalculate_digest();

        let snapshot = StorageSnapshot::capture(&mut storage, SnapshotMeta::new(2, 0));
        let buf = manager.serialize_snapshot_to_buffer(&storage, &snapshot).unwrap();
        manager.serialize_snapshot_buffer_to_disk(&buf, 2).unwrap();

        // A manager configured the other way still reads it.
        let other_manager = SnapshotManager::new(dir.path(), 3, !compress).unwrap();
        let debuf = other_manager.deserialize_snapshot_buffer_from_disk(2).unwrap();
        let (restored, _, _) = other_manager.deserialize_snapshot_from_buffer(&debuf).unwrap();

        assert_eq!(restored.container.size(), 6);
        assert_eq!(restored.container.get("/hello").unwrap().data.as_ref(), b"world");
        assert_eq!(restored.session_id_counter, 7);
        assert_eq!(restored.zxid, 2);
        assert_eq!(restored.session_and_timeout.len(), 2);
    }
}

#[test]
fn snapshot_worker_releases_snapshot_mode() {
    let logs_dir = tempdir().unwrap();
    let snapshots_dir = tempdir().unwrap();
    let settings = settings_for(&logs_dir, &snapshots_dir, false, 100_000, 100_000, 100_000);
    let (state_machine, _responses, snapshots_rx) = new_state_machine(&settings);
    let worker = raft::spawn_snapshot_worker(snapshots_rx);

    for i in 1..=5u64 {
        let payload = create_entry(1, i as Zxid, &format!("/hello_{i}"));
        state_machine.pre_commit(i, &payload).unwrap();
        state_machine.commit(i, &payload).unwrap();
    }

    let (done_tx, done_rx) = mpsc::channel();
    state_machine
        .create_snapshot(SnapshotMeta::new(5, 0), move |ok| {
            let _ = done_tx.send(ok);
        })
        .unwrap();
    assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());

    assert!(snapshots_dir.path().join("snapshot_5.bin").exists());
    {
        let storage = state_machine.storage();
        let storage = storage.read().unwrap();
        let (snapshot_size, _) = storage.container.snapshot_size_with_version();
        assert_eq!(snapshot_size, storage.container.size());
    }
    drop(state_machine);
    worker.join().unwrap();
}

#[test]
fn apply_snapshot_replaces_store() {
    let logs_dir = tempdir().unwrap();
    let snapshots_dir = tempdir().unwrap();
    let settings = settings_for(&logs_dir, &snapshots_dir, false, 100_000, 100_000, 100_000);

    let (source, _responses, snapshots_rx) = new_state_machine(&settings);
    for i in 1..=10u64 {
        let payload = create_entry(1, i as Zxid, &format!("/hello_{i}"));
        source.pre_commit(i, &payload).unwrap();
        source.commit(i, &payload).unwrap();
    }
    let (done_tx, done_rx) = mpsc::channel();
    source
        .create_snapshot(SnapshotMeta::new(10, 0), move |ok| {
            let _ = done_tx.send(ok);
        })
        .unwrap();
    snapshots_rx.recv().unwrap().run();
    assert!(done_rx.recv().unwrap());

    // A second machine over the same snapshot directory installs it.
    let logs_dir2 = tempdir().unwrap();
    let settings2 = CoordinationSettings::builder()
        .log_storage_path(logs_dir2.path().to_path_buf())
        .snapshot_storage_path(snapshots_dir.path().to_path_buf())
        .build();
    let (responses_tx, _responses_rx) = mpsc::channel();
    let (snapshots_tx, _snapshots_rx2) = mpsc::channel();
    let target = StateMachine::new(responses_tx, snapshots_tx, &settings2).unwrap();
    target.apply_snapshot(&SnapshotMeta::new(10, 0)).unwrap();

    assert_eq!(target.last_commit_index(), 10);
    let storage = target.storage();
    let storage = storage.read().unwrap();
    for i in 1..=10u64 {
        assert!(storage.container.contains(&format!("/hello_{i}")));
    }
    assert_eq!(storage.zxid, 10);
}

#[test]
fn durable_state_file() {
    let dir = tempdir().unwrap();
    let mut state_manager = StateManager::new(dir.path()).unwrap();

    assert_eq!(state_manager.read_state().unwrap(), None);

    let state = SrvState {
        term: 1,
        voted_for: 2,
        election_timer_allowed: true,
    };
    state_manager.save_state(&state).unwrap();

    assert_eq!(state_manager.read_state().unwrap(), Some(state));

    // Reload from a fresh manager over the same directory.
    state_manager = StateManager::new(dir.path()).unwrap();
    assert_eq!(state_manager.read_state().unwrap(), Some(state));

    let state_path = dir.path().join("state");

    {
        // Flip a byte: well-sized but corrupted. Debug builds refuse loudly.
        let mut raw = std::fs::read(&state_path).unwrap();
        raw[10] ^= 0xFF;
        std::fs::write(&state_path, &raw).unwrap();
        let manager = StateManager::new(dir.path()).unwrap();
        if cfg!(debug_assertions) {
            let result = std::panic::catch_unwind(|| manager.read_state());
            assert!(result.is_err());
        } else {
            assert_eq!(manager.read_state().unwrap(), None);
        }
    }

    {
        // Wrong size reads as "no state" everywhere.
        std::fs::write(&state_path, [20u8; 8]).unwrap();
        let manager = StateManager::new(dir.path()).unwrap();
        assert_eq!(manager.read_state().unwrap(), None);
    }

    {
        std::fs::remove_file(&state_path).unwrap();
        let manager = StateManager::new(dir.path()).unwrap();
        assert_eq!(manager.read_state().unwrap(), None);
    }
}

#[test]
fn engine_wires_log_and_state_machine() {
    let base = tempdir().unwrap();
    let settings = CoordinationSettings::builder()
        .log_storage_path(base.path().join("logs"))
        .snapshot_storage_path(base.path().join("snapshots"))
        .state_file_path(base.path().join("state"))
        .rotate_log_storage_interval(10)
        .build();

    let (responses_tx, _responses_rx) = mpsc::channel();
    let (snapshots_tx, _snapshots_rx) = mpsc::channel();
    let mut engine = raft::Engine::new(&settings, responses_tx, snapshots_tx).unwrap();

    let request = RequestForSession::new(1, 0, Request::create("/engine", "on"), 1);
    let index = engine.append_request(1, &request).unwrap();
    engine.log.end_of_append_batch(0, 0).unwrap();
    wait_durable(&engine.log);

    let buf = engine.log.entry_at(index).unwrap().data.clone();
    engine.state_machine.pre_commit(index, &buf).unwrap();
    engine.state_machine.commit(index, &buf).unwrap();

    engine
        .state_manager
        .save_state(&SrvState {
            term: 1,
            voted_for: 1,
            election_timer_allowed: false,
        })
        .unwrap();

    assert!(Path::new(&base.path().join("logs/changelog_1_10.bin")).exists());
    assert_eq!(engine.state_machine.last_commit_index(), index);
    let storage = engine.state_machine.storage();
    let storage = storage.read().unwrap();
    assert_eq!(storage.container.get("/engine").unwrap().data.as_ref(), b"on");
}

#[test]
fn expired_sessions_close_via_log_entries() {
    let logs_dir = tempdir().unwrap();
    let snapshots_dir = tempdir().unwrap();
    let mut settings = settings_for(&logs_dir, &snapshots_dir, false, 100_000, 100_000, 100_000);
    settings.dead_session_check_period_ms = 10;
    let (state_machine, _responses, _snapshots) = new_state_machine(&settings);

    let session_id = {
        let storage = state_machine.storage();
        let mut storage = storage.write().unwrap();
        storage.get_session_id(50)
    };

    let create = RequestForSession::new(
        session_id,
        0,
        Request::Create {
            path: "/expiring".into(),
            data: Bytes::new(),
            is_ephemeral: true,
            is_sequential: false,
            acls: Vec::new(),
        },
        1,
    )
    .encode()
    .unwrap();
    state_machine.pre_commit(1, &create).unwrap();
    state_machine.commit(1, &create).unwrap();

    std::thread::sleep(Duration::from_millis(150));
    let expired = state_machine.expired_sessions();
    assert_eq!(expired, vec![session_id]);

    // The host synthesizes one internal close entry per expired session.
    let close = RequestForSession::close_session(session_id, 0, 2)
        .encode()
        .unwrap();
    state_machine.pre_commit(2, &close).unwrap();
    state_machine.commit(2, &close).unwrap();

    let storage = state_machine.storage();
    let storage = storage.read().unwrap();
    assert!(!storage.container.contains("/expiring"));
    assert!(storage.ephemerals.is_empty());
    assert!(!storage.session_and_timeout.contains_key(&session_id));
}
