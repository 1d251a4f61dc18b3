//! End-to-end dumps against the fake server.

mod common;

use cachedump::{DumpError, Dumper};
use cachedump::ketama::HashRing;
use cachedump::layout::{CHECKPOINT_PREFIX, OutputLayout};
use cachedump::upload::DirectoryUploader;
use cachedump::writer::to_hex;
use common::{Behavior, FakeMemcached, config, items, now, read_all_records};
use md5::{Digest, Md5};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::Arc;

fn by_key(records: Vec<common::Record>) -> HashMap<String, common::Record> {
    let mut map = HashMap::new();
    for record in records {
        let key = record.key.clone();
        assert!(map.insert(key.clone(), record).is_none(), "{} written twice", key);
    }
    map
}

#[test]
fn test_full_dump() {
    let items = items(200);
    let server = FakeMemcached::start(
        items.clone(),
        Behavior {
            write_size: 97,
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let config = config(server.port(), &out);
    let layout = OutputLayout::new(&out, &config.memcached.host);

    let metrics = Dumper::new(Arc::new(config)).run().unwrap();
    assert_eq!(metrics.keyvalue_metrics.total, 200);
    assert_eq!(metrics.keyvalue_metrics.dumped, 200);
    assert_eq!(metrics.keyvalue_metrics.not_found, 0);
    assert_eq!(server.metadumps(), 1);

    let key_files = layout.list_key_files().unwrap();
    assert!(key_files.len() > 1);
    assert_eq!(metrics.key_files_processed, key_files.len() as u64);
    assert_eq!(
        fs::read_to_string(layout.key_files_done_path()).unwrap(),
        format!("{} key files dumped.\n", key_files.len())
    );
    assert_eq!(layout.read_checkpoints().unwrap().len(), key_files.len());

    let records = by_key(read_all_records(&layout.completed_dir()));
    assert_eq!(records.len(), 200);
    for item in &items {
        let record = &records[&item.key];
        assert_eq!(record.value, item.value);
        assert_eq!(record.flags, item.flags);
        assert_eq!(record.expiry, -1);
    }

    // finished files carry the digest of their contents
    let mut bytes = 0;
    for path in common::data_files(&layout.completed_dir()) {
        let contents = fs::read(&path).unwrap();
        bytes += contents.len() as u64;
        let name = path.file_name().unwrap().to_str().unwrap();
        let digest = name.rsplit('_').next().unwrap();
        assert_eq!(digest, to_hex(&Md5::digest(&contents)));
    }
    assert_eq!(bytes, metrics.bytes_written);
    assert_eq!(fs::read_dir(layout.staging_dir()).unwrap().count(), 0);

    let done: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(layout.done_path()).unwrap()).unwrap();
    assert_eq!(done["keyvalue_metrics"]["dumped"], 200);
}

#[test]
fn test_expiring_and_missing_keys() {
    let mut items = items(60);
    let soon = now() + 100;
    let later = now() + 100_000;
    for item in items.iter_mut().take(10) {
        item.expiry = soon;
    }
    for item in items.iter_mut().skip(10).take(10) {
        item.expiry = later;
    }
    let hidden: HashSet<String> = items[50..].iter().map(|i| i.key.clone()).collect();
    let server = FakeMemcached::start(
        items.clone(),
        Behavior {
            hidden: hidden.clone(),
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let config = config(server.port(), dir.path());
    let completed = OutputLayout::new(dir.path(), "127.0.0.1").completed_dir();

    let metrics = Dumper::new(Arc::new(config)).run().unwrap();
    assert_eq!(metrics.keyvalue_metrics.total, 60);
    assert_eq!(metrics.keyvalue_metrics.skipped, 10);
    assert_eq!(metrics.keyvalue_metrics.not_found, 10);
    assert_eq!(metrics.keyvalue_metrics.dumped, 40);

    let records = by_key(read_all_records(&completed));
    assert_eq!(records.len(), 40);
    assert_eq!(records[&items[15].key].expiry, later);
    assert!(!records.contains_key(&items[0].key));

    // each missing key is asked for three times before it is given up on
    let requested = server.requested();
    for key in &hidden {
        assert_eq!(requested.iter().filter(|k| *k == key).count(), 3);
    }
}

#[test]
fn test_busy_crawler_is_retried() {
    let server = FakeMemcached::start(
        items(20),
        Behavior {
            busy_responses: 2,
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let metrics = Dumper::new(Arc::new(config(server.port(), dir.path())))
        .run()
        .unwrap();
    assert_eq!(server.metadumps(), 3);
    assert_eq!(metrics.keyvalue_metrics.dumped, 20);
}

#[test]
fn test_broken_connection_during_get() {
    let items = items(80);
    let server = FakeMemcached::start(
        items.clone(),
        Behavior {
            drop_get_after: Some(150),
            write_size: 64,
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let config = config(server.port(), dir.path());
    let completed = OutputLayout::new(dir.path(), "127.0.0.1").completed_dir();

    let metrics = Dumper::new(Arc::new(config)).run().unwrap();
    assert_eq!(metrics.keyvalue_metrics.dumped, 80);
    assert_eq!(metrics.keyvalue_metrics.not_found, 0);

    let records = by_key(read_all_records(&completed));
    assert_eq!(records.len(), 80);
    for item in &items {
        assert_eq!(records[&item.key].value, item.value);
    }
    // pool connections plus the replacement
    assert_eq!(server.connections(), 4);
}

#[test]
fn test_crawl_retried_after_dropped_metadump() {
    let items = items(120);
    let server = FakeMemcached::start(
        items.clone(),
        Behavior {
            cut_metadumps: 1,
            metadump_cut_after: 100,
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path(), "127.0.0.1");

    let metrics = Dumper::new(Arc::new(config(server.port(), dir.path())))
        .run()
        .unwrap();
    assert_eq!(server.metadumps(), 2);
    assert_eq!(metrics.keyvalue_metrics.total, 120);
    assert_eq!(metrics.keyvalue_metrics.dumped, 120);

    // the partial key file of the dropped attempt is not dumped twice
    let records = by_key(read_all_records(&layout.completed_dir()));
    assert_eq!(records.len(), 120);
    let key_files = layout.list_key_files().unwrap();
    assert_eq!(
        fs::read_to_string(layout.key_files_done_path()).unwrap(),
        format!("{} key files dumped.\n", key_files.len())
    );
}

#[test]
fn test_crawl_failure_after_handoff_is_fatal() {
    let server = FakeMemcached::start(
        items(150),
        Behavior {
            cut_metadumps: 1,
            metadump_cut_after: 5000,
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path(), "127.0.0.1");

    let result = Dumper::new(Arc::new(config(server.port(), dir.path()))).run();
    assert!(
        matches!(result, Err(DumpError::ConnectionBroken(_))),
        "unexpected result {:?}",
        result
    );
    assert_eq!(server.metadumps(), 1);
    assert!(!layout.key_files_done_path().exists());
}

#[test]
fn test_server_error_counts_as_attempt() {
    let items = items(40);
    let error_keys: HashSet<String> = [5, 17, 33].iter().map(|i| items[*i].key.clone()).collect();
    let server = FakeMemcached::start(
        items.clone(),
        Behavior {
            error_keys: error_keys.clone(),
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let completed = OutputLayout::new(dir.path(), "127.0.0.1").completed_dir();

    let metrics = Dumper::new(Arc::new(config(server.port(), dir.path())))
        .run()
        .unwrap();
    assert_eq!(metrics.keyvalue_metrics.total, 40);
    assert_eq!(metrics.keyvalue_metrics.not_found, error_keys.len() as u64);
    assert_eq!(metrics.keyvalue_metrics.dumped, 37);

    let records = by_key(read_all_records(&completed));
    assert_eq!(records.len(), 37);
    for item in &items {
        assert_eq!(records.contains_key(&item.key), !error_keys.contains(&item.key));
    }

    let requested = server.requested();
    for key in &error_keys {
        assert_eq!(requested.iter().filter(|k| *k == key).count(), 3);
    }
}

#[test]
fn test_empty_cache() {
    let server = FakeMemcached::start(Vec::new(), Behavior::default());
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path(), "127.0.0.1");

    let metrics = Dumper::new(Arc::new(config(server.port(), dir.path())))
        .run()
        .unwrap();
    assert_eq!(metrics.keyvalue_metrics.total, 0);
    assert_eq!(metrics.key_files_processed, 0);
    assert_eq!(
        fs::read_to_string(layout.key_files_done_path()).unwrap(),
        "0 key files dumped.\n"
    );
    assert!(layout.done_path().exists());
    assert!(common::data_files(&layout.completed_dir()).is_empty());
}

#[test]
fn test_filter_keeps_owned_keys() {
    let items = items(300);
    let server = FakeMemcached::start(items.clone(), Behavior::default());
    let dir = tempfile::tempdir().unwrap();
    let all: Vec<String> = ["10.0.0.1:11211", "10.0.0.2:11211", "10.0.0.3:11211"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut config = config(server.port(), dir.path());
    config.filter.all_ips = all.clone();
    config.filter.dest_ips = vec![all[1].clone()];
    let completed = OutputLayout::new(dir.path(), "127.0.0.1").completed_dir();

    let metrics = Dumper::new(Arc::new(config)).run().unwrap();

    let ring = HashRing::new(&all, 160).unwrap();
    let owned = items
        .iter()
        .filter(|i| ring.classify(i.key.as_bytes()) == 1)
        .count() as u64;
    assert!(owned > 0 && owned < 300);
    assert_eq!(metrics.keyvalue_metrics.dumped, owned);
    assert_eq!(metrics.keyvalue_metrics.filtered, 300 - owned);

    for record in read_all_records(&completed) {
        assert_eq!(ring.classify(record.key.as_bytes()), 1);
    }
}

#[test]
fn test_resume_after_interruption() {
    let items = items(150);
    let server = FakeMemcached::start(items.clone(), Behavior::default());
    let dir = tempfile::tempdir().unwrap();
    let config = config(server.port(), dir.path());
    let layout = OutputLayout::new(dir.path(), &config.memcached.host);

    Dumper::new(Arc::new(config.clone())).run().unwrap();
    let key_files = layout.list_key_files().unwrap();
    assert!(key_files.len() > 2);

    // pretend only the first key file was finished before the process died
    for entry in fs::read_dir(layout.key_dir()).unwrap() {
        let path = entry.unwrap().path();
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        if name.starts_with(CHECKPOINT_PREFIX) {
            fs::remove_file(&path).unwrap();
        }
    }
    layout.append_checkpoint("dump-worker-0", &key_files[0]).unwrap();
    fs::remove_file(layout.done_path()).unwrap();
    let leftover = layout
        .staging_dir()
        .join(format!("{}_0", layout.data_prefix(&key_files[1])));
    fs::write(&leftover, b"partial").unwrap();

    let first_lines = fs::read_to_string(layout.key_file_path(&key_files[0]))
        .unwrap()
        .lines()
        .count() as u64;

    let mut config = config;
    config.dump.resume = true;
    let metrics = Dumper::new(Arc::new(config)).run().unwrap();

    assert_eq!(server.metadumps(), 1);
    assert!(!leftover.exists());
    assert_eq!(metrics.key_files_processed, key_files.len() as u64 - 1);
    assert_eq!(metrics.keyvalue_metrics.total, 150 - first_lines);
    assert_eq!(metrics.keyvalue_metrics.dumped, 150 - first_lines);

    let records = by_key(read_all_records(&layout.completed_dir()));
    assert_eq!(records.len(), 150);
    assert_eq!(layout.read_checkpoints().unwrap().len(), key_files.len());
}

#[test]
fn test_resume_without_marker_starts_over() {
    let server = FakeMemcached::start(items(30), Behavior::default());
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path(), "127.0.0.1");
    fs::create_dir_all(layout.key_dir()).unwrap();
    fs::write(layout.key_dir().join("key_127.0.0.1_0"), b"key=junk exp=-1 la=1\n").unwrap();

    let mut config = config(server.port(), dir.path());
    config.dump.resume = true;
    let metrics = Dumper::new(Arc::new(config)).run().unwrap();

    assert_eq!(server.metadumps(), 1);
    assert_eq!(metrics.keyvalue_metrics.dumped, 30);
    let records = by_key(read_all_records(&layout.completed_dir()));
    assert!(!records.contains_key("junk"));
}

#[test]
fn test_upload() {
    let items = items(100);
    let server = FakeMemcached::start(items.clone(), Behavior::default());
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let objects = dir.path().join("objects");

    let mut config = config(server.port(), &out);
    config.upload.enabled = true;
    config.upload.root = Some(objects.clone());
    config.upload.bucket = "bkt".to_string();
    config.upload.path = "memcached".to_string();
    config.dump.req_id = "r1".to_string();
    let layout = OutputLayout::new(&out, &config.memcached.host);

    let metrics = Dumper::new(Arc::new(config)).run().unwrap();
    assert_eq!(metrics.keyvalue_metrics.dumped, 100);

    // local copies are removed once uploaded
    assert!(common::data_files(&layout.completed_dir()).is_empty());
    assert!(layout.done_path().exists());

    let stored = objects.join("bkt/memcached/r1");
    let uploaded = common::data_files(&stored);
    assert!(!uploaded.is_empty());
    let records = by_key(read_all_records(&stored));
    assert_eq!(records.len(), 100);

    let notifications = fs::read_to_string(objects.join("notifications.jsonl")).unwrap();
    assert_eq!(notifications.lines().count(), uploaded.len());
}

#[test]
fn test_custom_uploader() {
    let server = FakeMemcached::start(items(10), Behavior::default());
    let dir = tempfile::tempdir().unwrap();
    let objects = dir.path().join("objects");
    let out = dir.path().join("out");

    let mut config = config(server.port(), &out);
    config.dump.req_id = "custom".to_string();
    let dumper = Dumper::new(Arc::new(config))
        .with_uploader(Arc::new(DirectoryUploader::new(&objects, "b")));
    dumper.run().unwrap();

    assert_eq!(read_all_records(&objects.join("b/custom")).len(), 10);
}
