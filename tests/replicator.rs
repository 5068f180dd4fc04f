//! Integration coverage for end-to-end replicator scenarios, driven
//! entirely through the public `replicator`/`dipmap` API.

use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use beamer_mux::dipmap::DipHistoryMap;
use beamer_mux::replicator::testing::MockCoordinationClient;
use beamer_mux::replicator::Replicator;

fn zlib(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

fn entry_bytes(current: u32, prev: u32, timestamp: u32) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[0..4].copy_from_slice(&current.to_ne_bytes());
    out[4..8].copy_from_slice(&prev.to_ne_bytes());
    out[8..12].copy_from_slice(&timestamp.to_ne_bytes());
    out
}

fn log_bytes(timestamp: u32, entries: &[(u32, &[u32])]) -> Vec<u8> {
    let mut out = timestamp.to_ne_bytes().to_vec();
    for (dip, buckets) in entries {
        out.extend_from_slice(&dip.to_ne_bytes());
        out.extend_from_slice(&(buckets.len() as u32).to_ne_bytes());
        for b in *buckets {
            out.extend_from_slice(&b.to_ne_bytes());
        }
    }
    out
}

fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition never became true");
}

/// Scenario 1: fresh replica install, snapshot + two logs applied in order.
#[test]
fn fresh_replica_install_scenario() {
    let _ = env_logger::try_init();
    let map = Arc::new(RwLock::new(DipHistoryMap::init(4)));
    let client = MockCoordinationClient::new();

    client.set_int32("/beamer/mux_ring/latest_blob", 5);
    let blob = zlib(
        &[
            entry_bytes(10, 0, 100),
            entry_bytes(11, 0, 100),
            entry_bytes(12, 0, 100),
            entry_bytes(13, 0, 100),
        ]
        .concat(),
    );
    client.set_sharded_raw("/beamer/mux_ring/gen_5/blob", &blob);
    client.set_int32("/beamer/mux_ring/latest_gen", 7);
    let log6 = zlib(&log_bytes(200, &[(20, &[0])]));
    client.set_sharded_raw("/beamer/mux_ring/gen_6/log", &log6);
    let log7 = zlib(&log_bytes(300, &[(30, &[2, 3])]));
    client.set_sharded_raw("/beamer/mux_ring/gen_7/log", &log7);

    let replicator = Replicator::new("/beamer/mux_ring/", map.clone(), client);
    let gen = replicator.gen_handle();
    let thread = replicator.spawn();

    wait_for(|| gen.load(Ordering::Acquire) == 7);

    let snapshot = map.read().unwrap();
    assert_eq!(snapshot.get(0).current, 20);
    assert_eq!(snapshot.get(0).prev, 10);
    assert_eq!(snapshot.get(0).timestamp, 200);
    assert_eq!(snapshot.get(1).current, 11);
    assert_eq!(snapshot.get(2).current, 30);
    assert_eq!(snapshot.get(2).prev, 12);
    assert_eq!(snapshot.get(3).current, 30);
    assert_eq!(snapshot.get(3).prev, 13);
    drop(snapshot);

    drop(thread);
}

/// Scenario 5: a missing log forces re-discovery of a newer snapshot.
#[test]
fn blob_gc_recovery_scenario() {
    let _ = env_logger::try_init();
    let map = Arc::new(RwLock::new(DipHistoryMap::init(1)));
    let client = MockCoordinationClient::new();

    client.set_int32("/r/latest_blob", 3);
    let blob3 = zlib(&entry_bytes(0, 0, 0));
    client.set_sharded_raw("/r/gen_3/blob", &blob3);
    client.set_int32("/r/latest_gen", 3);

    let replicator = Replicator::new("/r/", map.clone(), client.clone());
    let gen = replicator.gen_handle();
    let thread = replicator.spawn();
    wait_for(|| gen.load(Ordering::Acquire) == 3);

    // gen_4's log was already GC'd by the time we look for it; a gen_9
    // snapshot is what's actually current.
    client.set_int32("/r/latest_blob", 9);
    let blob9 = zlib(&entry_bytes(99, 0, 999));
    client.set_sharded_raw("/r/gen_9/blob", &blob9);
    client.set_int32("/r/latest_gen", 10);
    let log10 = zlib(&log_bytes(1000, &[(100, &[0])]));
    client.set_sharded_raw("/r/gen_10/log", &log10);
    client.fire_kick();

    wait_for(|| gen.load(Ordering::Acquire) == 10);
    assert_eq!(map.read().unwrap().get(0).current, 100);

    drop(thread);
}
