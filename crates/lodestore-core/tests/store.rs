//! End-to-end store lifecycle tests: save/load round-trips, event replay
//! across generations, tombstones, corruption recovery, and the partial
//! serialization mode.

use std::path::Path;

use lodestore_core::{partial_record_struct, Bytes, SaveMode, Store, StoreFlags};
use tempfile::TempDir;

type TestStore = Store<Bytes, Bytes>;

fn open(dir: &Path) -> TestStore {
    Store::open(dir, StoreFlags::new()).unwrap()
}

fn b(s: &str) -> Bytes {
    Bytes::from(s)
}

/// Data files in the directory, split into (snapshots, event logs), sorted.
fn data_files(dir: &Path) -> (Vec<String>, Vec<String>) {
    let mut snapshots = Vec::new();
    let mut events = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let name = entry.unwrap().file_name().to_string_lossy().into_owned();
        if name.ends_with(".snapshot") {
            snapshots.push(name);
        } else if name.ends_with(".events") {
            events.push(name);
        }
    }
    snapshots.sort();
    events.sort();
    (snapshots, events)
}

#[test]
fn basic_round_trip() {
    let tmp = TempDir::new().unwrap();

    {
        let mut store = open(tmp.path());
        store.update(b("aabbcc"), b("ddeeff")).unwrap();
        store.save(SaveMode::Sync).unwrap();
        assert_eq!(store.generation(), 1);
    }

    let (snapshots, events) = data_files(tmp.path());
    assert_eq!(snapshots, vec!["00000000000000000001.snapshot"]);
    assert!(events.is_empty(), "a clean save leaves no event logs: {:?}", events);

    let store = open(tmp.path());
    assert_eq!(store.get(&b("aabbcc")), Some(&b("ddeeff")));
    assert_eq!(store.generation(), 1);
    assert_eq!(store.len(), 1);
}

#[test]
fn events_replay_on_top_of_snapshot() {
    let tmp = TempDir::new().unwrap();

    {
        let mut store = open(tmp.path());
        store.update(b("a"), b("1")).unwrap();
        store.save(SaveMode::Sync).unwrap();
        store.update(b("b"), b("2")).unwrap();
        store.update(b("a"), b("3")).unwrap();
        store.flush(false).unwrap();
    }

    let (snapshots, events) = data_files(tmp.path());
    assert_eq!(snapshots, vec!["00000000000000000001.snapshot"]);
    assert_eq!(events, vec!["00000000000000000001.events"]);

    let store = open(tmp.path());
    assert_eq!(store.len(), 2);
    assert_eq!(store.get(&b("a")), Some(&b("3")), "last record wins");
    assert_eq!(store.get(&b("b")), Some(&b("2")));
    assert_eq!(store.generation(), 1);
}

#[test]
fn empty_value_is_a_tombstone() {
    let tmp = TempDir::new().unwrap();

    {
        let mut store = open(tmp.path());
        store.update(b("key"), b("value")).unwrap();
        store.save(SaveMode::Sync).unwrap();
        store.update(b("key"), Bytes::new()).unwrap();
        store.flush(false).unwrap();

        // In memory the key now holds the empty value; replay drops it.
        assert_eq!(store.get(&b("key")), Some(&Bytes::new()));
    }

    let (_, events) = data_files(tmp.path());
    assert_eq!(events, vec!["00000000000000000001.events"], "tombstone retained");

    let store = open(tmp.path());
    assert!(!store.contains_key(&b("key")));
    assert_eq!(store.len(), 0);
    assert_eq!(store.generation(), 1);
}

#[test]
fn erase_writes_tombstone() {
    let tmp = TempDir::new().unwrap();

    {
        let mut store = open(tmp.path());
        store.update(b("stay"), b("s")).unwrap();
        store.update(b("go"), b("g")).unwrap();
        store.save(SaveMode::Sync).unwrap();
        assert!(store.erase(&b("go")).unwrap());
        assert!(!store.erase(&b("go")).unwrap(), "second erase is a no-op");
        store.flush(false).unwrap();
    }

    let store = open(tmp.path());
    assert_eq!(store.len(), 1);
    assert!(store.contains_key(&b("stay")));
    assert!(!store.contains_key(&b("go")));
}

#[test]
fn multi_generation_replay_without_snapshot() {
    let tmp = TempDir::new().unwrap();
    let backup = TempDir::new().unwrap();

    let keys: Vec<Bytes> = (0..4).map(|i| b(&format!("k{}", i))).collect();
    let vals: Vec<Bytes> = (0..4).map(|i| b(&format!("v{}", i))).collect();

    {
        let mut store = open(tmp.path());
        for gen in 0..4u64 {
            store.update(keys[gen as usize].clone(), vals[gen as usize].clone()).unwrap();
            store.flush(false).unwrap();
            // Stash this generation's event log before save() deletes it.
            let name = format!("{:020}.events", gen);
            std::fs::copy(tmp.path().join(&name), backup.path().join(&name)).unwrap();
            if gen < 3 {
                store.save(SaveMode::Sync).unwrap();
            }
        }
    }

    // Strip the directory down to the four event logs alone.
    for entry in std::fs::read_dir(tmp.path()).unwrap() {
        std::fs::remove_file(entry.unwrap().path()).unwrap();
    }
    for entry in std::fs::read_dir(backup.path()).unwrap() {
        let entry = entry.unwrap();
        std::fs::copy(entry.path(), tmp.path().join(entry.file_name())).unwrap();
    }

    let store = open(tmp.path());
    assert_eq!(store.len(), 4);
    for i in 0..4 {
        assert_eq!(store.get(&keys[i]), Some(&vals[i]), "key {} lost in replay", i);
    }
    assert_eq!(store.generation(), 3);

    let (snapshots, _) = data_files(tmp.path());
    assert!(snapshots.is_empty(), "a clean replay takes no snapshot");
}

#[test]
fn torn_tail_is_discarded_and_resnapshotted() {
    let tmp = TempDir::new().unwrap();
    let events_path = tmp.path().join("00000000000000000000.events");

    {
        let mut store = open(tmp.path());
        store.update(b("solid"), b("frame-one")).unwrap();
        store.flush(false).unwrap();
        store.update(b("torn"), b("frame-two")).unwrap();
        store.flush(false).unwrap();
    }

    // Tear the last byte off the second frame.
    let raw = std::fs::read(&events_path).unwrap();
    std::fs::write(&events_path, &raw[..raw.len() - 1]).unwrap();

    let store = open(tmp.path());
    assert_eq!(store.get(&b("solid")), Some(&b("frame-one")));
    assert!(!store.contains_key(&b("torn")), "torn frame must not replay");

    assert!(!events_path.exists(), "corrupt log must be unlinked");
    let (snapshots, _) = data_files(tmp.path());
    assert_eq!(
        snapshots,
        vec!["00000000000000000001.snapshot"],
        "survivors must be re-snapshotted"
    );

    // The repaired lineage replays cleanly.
    let store = open(tmp.path());
    assert_eq!(store.get(&b("solid")), Some(&b("frame-one")));
    assert_eq!(store.generation(), 1);
    drop(store);
}

#[test]
fn payload_bit_flip_discards_whole_file_tail() {
    let tmp = TempDir::new().unwrap();
    let events_path = tmp.path().join("00000000000000000000.events");

    {
        let mut store = open(tmp.path());
        store.update(b("first"), b("ok")).unwrap();
        store.flush(false).unwrap();
        store.update(b("second"), b("doomed")).unwrap();
        store.flush(false).unwrap();
    }

    // Flip a bit inside the second frame's payload.
    let mut raw = std::fs::read(&events_path).unwrap();
    let at = raw.len() - 2;
    raw[at] ^= 0x10;
    std::fs::write(&events_path, &raw).unwrap();

    let store = open(tmp.path());
    assert!(store.contains_key(&b("first")));
    assert!(!store.contains_key(&b("second")));
    assert!(!events_path.exists());
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Device {
    id: u64,
    heavy: Bytes,
    counter: u64,
}

partial_record_struct!(Device {
    full: [id, heavy, counter],
    partial: [id, counter],
});

#[test]
fn partial_serialization_is_porous_across_restarts() {
    let tmp = TempDir::new().unwrap();
    type DeviceStore = Store<u64, Device>;

    let heavy_original = Bytes::from("ORIGINAL_HEAVY_DATA_THAT_MUST_SURVIVE");
    let heavy_transient = Bytes::from("TRANSIENT_DATA_THAT_MUST_NOT_PERSIST");

    {
        let mut store: DeviceStore = Store::open(tmp.path(), StoreFlags::new()).unwrap();
        let device = Device {
            id: 1,
            heavy: heavy_original.clone(),
            counter: 10,
        };
        store.update(100, device).unwrap();
        store.save(SaveMode::Sync).unwrap();
    }

    {
        let mut store: DeviceStore = Store::open(tmp.path(), StoreFlags::new()).unwrap();
        assert_eq!(store.get(&100).unwrap().heavy, heavy_original);

        let mut device = store.get(&100).cloned().unwrap();
        device.counter = 20;
        device.heavy = heavy_transient.clone();
        store.update(100, device).unwrap();
        store.flush(false).unwrap();
    }

    {
        let store: DeviceStore = Store::open(tmp.path(), StoreFlags::new()).unwrap();
        let device = store.get(&100).unwrap();
        assert_eq!(device.counter, 20, "partial member must update");
        assert_ne!(device.heavy, heavy_transient, "event record must not carry heavy data");
        assert_eq!(device.heavy, heavy_original, "heavy member must survive from the snapshot");
    }
}

#[test]
fn clear_collapses_history_into_empty_snapshot() {
    let tmp = TempDir::new().unwrap();

    {
        let mut store = open(tmp.path());
        store.update(b("a"), b("1")).unwrap();
        store.save(SaveMode::Sync).unwrap();
        store.update(b("b"), b("2")).unwrap();
        store.clear().unwrap();
        assert!(store.is_empty());
        assert_eq!(store.generation(), 2);
    }

    let (snapshots, events) = data_files(tmp.path());
    assert_eq!(snapshots, vec!["00000000000000000002.snapshot"]);
    assert!(events.is_empty());

    let store = open(tmp.path());
    assert!(store.is_empty());
    assert_eq!(store.generation(), 2);
}

#[test]
fn persist_logs_direct_mutations() {
    let tmp = TempDir::new().unwrap();

    {
        let mut store = open(tmp.path());
        store.update(b("logged"), b("v1")).unwrap();

        // Direct mutation bypasses the log until persisted.
        store.objects_mut().insert(b("direct"), b("v2"));
        store.persist(&b("direct")).unwrap();
        store.flush(false).unwrap();
    }

    {
        let mut store = open(tmp.path());
        assert_eq!(store.get(&b("direct")), Some(&b("v2")));

        // Direct removal persists as a tombstone.
        store.objects_mut().remove(&b("logged"));
        store.persist(&b("logged")).unwrap();
        store.flush(false).unwrap();
    }

    let store = open(tmp.path());
    assert!(!store.contains_key(&b("logged")));
    assert_eq!(store.get(&b("direct")), Some(&b("v2")));
}

#[test]
fn save_cleans_superseded_generations() {
    let tmp = TempDir::new().unwrap();

    let mut store = open(tmp.path());
    for round in 0..3 {
        store.update(b(&format!("k{}", round)), b("v")).unwrap();
        store.save(SaveMode::Sync).unwrap();

        let (snapshots, events) = data_files(tmp.path());
        assert_eq!(snapshots.len(), 1, "exactly one snapshot after save");
        assert_eq!(snapshots[0], format!("{:020}.snapshot", round + 1));
        assert!(events.is_empty(), "no stale event logs after save");
    }
    assert_eq!(store.len(), 3);
}

#[test]
fn async_clear_removes_obsolete_files_in_background() {
    let tmp = TempDir::new().unwrap();

    let mut store = open(tmp.path());
    store.update(b("k"), b("v")).unwrap();
    store.save(SaveMode::Sync).unwrap();
    store.update(b("k2"), b("v2")).unwrap();
    store.flush(false).unwrap();
    store.save(SaveMode::AsyncClear).unwrap();
    assert_eq!(store.generation(), 2);

    // The detached cleanup owns its path list; give it a moment.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let (snapshots, events) = data_files(tmp.path());
        if snapshots == vec!["00000000000000000002.snapshot".to_string()] && events.is_empty() {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "cleanup did not finish: {:?} {:?}",
            snapshots,
            events
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    drop(store);
    let store = open(tmp.path());
    assert_eq!(store.len(), 2);
}

#[cfg(unix)]
#[test]
fn fork_save_persists_through_the_child() {
    let tmp = TempDir::new().unwrap();

    {
        let mut store = open(tmp.path());
        store.update(b("base_key"), b("base_value")).unwrap();

        let pid = store.save(SaveMode::Fork).unwrap();
        let pid = pid.expect("fork save must return the child pid");
        assert!(pid > 0);
        assert_eq!(store.generation(), 1, "parent advances immediately");

        // Lands in the new generation's event log, not the child's snapshot.
        store.update(b("fork_key"), b("fork_value")).unwrap();
        store.flush(false).unwrap();
    }

    // Let the child finish writing the snapshot.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let (snapshots, _) = data_files(tmp.path());
        if snapshots == vec!["00000000000000000001.snapshot".to_string()] {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "child snapshot never appeared: {:?}",
            snapshots
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    let store = open(tmp.path());
    assert_eq!(store.get(&b("base_key")), Some(&b("base_value")));
    assert_eq!(store.get(&b("fork_key")), Some(&b("fork_value")));
    assert_eq!(store.generation(), 1);
}

#[test]
fn set_directory_switches_data_roots() {
    let tmp = TempDir::new().unwrap();
    let dir_a = tmp.path().join("a");
    let dir_b = tmp.path().join("b");
    std::fs::create_dir_all(&dir_a).unwrap();
    std::fs::create_dir_all(&dir_b).unwrap();

    {
        let mut store = open(&dir_a);
        store.update(b("alpha"), b("1")).unwrap();
        // Buffered records are flushed to the old root before switching.
        store.set_directory(&dir_b).unwrap();
        assert!(store.is_empty());
        store.update(b("beta"), b("2")).unwrap();
        store.flush(false).unwrap();
    }

    let store_a = open(&dir_a);
    assert_eq!(store_a.get(&b("alpha")), Some(&b("1")));
    assert!(!store_a.contains_key(&b("beta")));

    let store_b = open(&dir_b);
    assert_eq!(store_b.get(&b("beta")), Some(&b("2")));
    assert!(!store_b.contains_key(&b("alpha")));
}

#[test]
fn force_crc32_marks_small_frames() {
    let tmp = TempDir::new().unwrap();

    let mut store = open(tmp.path());
    store.set_force_crc32(true);
    store.update(b("k"), b("v")).unwrap();
    store.flush(false).unwrap();

    let raw = std::fs::read(tmp.path().join("00000000000000000000.events")).unwrap();
    assert_ne!(raw[0] & 0x20, 0, "CRC32 control bit must be set");

    drop(store);
    let store = open(tmp.path());
    assert_eq!(store.get(&b("k")), Some(&b("v")));
}

#[test]
fn tiny_buffers_still_round_trip() {
    for buffer_size in [5usize, 9, 16, 20, 30, 50] {
        let tmp = TempDir::new().unwrap();

        {
            let mut store: TestStore =
                Store::open_with_buffer(tmp.path(), StoreFlags::new(), buffer_size).unwrap();
            store.update(b("k"), b("v")).unwrap();
            store.update(b("key_long"), b("value_very_long_indeed")).unwrap();
            store.save(SaveMode::Sync).unwrap();
        }

        let store: TestStore =
            Store::open_with_buffer(tmp.path(), StoreFlags::new(), buffer_size).unwrap();
        assert_eq!(store.len(), 2, "buffer size {}", buffer_size);
        assert_eq!(store.get(&b("k")), Some(&b("v")));
        assert_eq!(store.get(&b("key_long")), Some(&b("value_very_long_indeed")));
    }
}

#[test]
fn integer_store_elides_empty_values_from_snapshots() {
    let tmp = TempDir::new().unwrap();
    type IntStore = Store<u64, u64>;

    {
        let mut store: IntStore = Store::open(tmp.path(), StoreFlags::new()).unwrap();
        store.update(100, 300).unwrap();
        store.update(200, 0).unwrap(); // empty value
        assert_eq!(store.len(), 2);
        store.save(SaveMode::Sync).unwrap();
    }

    let store: IntStore = Store::open(tmp.path(), StoreFlags::new()).unwrap();
    assert_eq!(store.len(), 1, "the empty value is elided from the snapshot");
    assert_eq!(store.get(&100), Some(&300));
}

#[test]
fn btree_backed_store_works() {
    use std::collections::BTreeMap;
    let tmp = TempDir::new().unwrap();
    type OrderedStore = Store<String, String, BTreeMap<String, String>>;

    {
        let mut store: OrderedStore = Store::open(tmp.path(), StoreFlags::new()).unwrap();
        store.update("A".to_string(), "B".to_string()).unwrap();
        store.update("some larger key".to_string(), "some larger value".to_string()).unwrap();
        store.update("E".to_string(), String::new()).unwrap();
        store.flush(false).unwrap();
        assert_eq!(store.len(), 3);
        store.save(SaveMode::Sync).unwrap();
    }

    let store: OrderedStore = Store::open(tmp.path(), StoreFlags::new()).unwrap();
    assert_eq!(store.len(), 2);
    assert_eq!(store.get(&"A".to_string()), Some(&"B".to_string()));
}

#[test]
fn stale_temp_snapshot_is_ignored() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("tmp_snapshot_1234_99887766_5"), b"garbage").unwrap();

    let mut store = open(tmp.path());
    assert!(store.is_empty());
    store.update(b("k"), b("v")).unwrap();
    store.save(SaveMode::Sync).unwrap();

    let store = open(tmp.path());
    assert_eq!(store.get(&b("k")), Some(&b("v")));
}

#[test]
fn pack_mutations_into_one_frame_with_flush() {
    let tmp = TempDir::new().unwrap();

    let mut store = open(tmp.path());
    store.update(b("warmup"), b("x")).unwrap();
    store.flush(false).unwrap();

    // Everything after the flush packs into the next single frame.
    assert!(store.remaining_capacity() >= 64);
    store.update(b("a"), b("1")).unwrap();
    store.update(b("b"), b("2")).unwrap();
    let pending = store.pending_bytes();
    assert!(pending > 0 && pending <= store.buffer_size());
    store.flush(true).unwrap();
    assert_eq!(store.pending_bytes(), 0);

    drop(store);
    let store2 = open(tmp.path());
    assert_eq!(store2.len(), 3);
}
