//! The snapshot+log replicator that keeps a [`DipMap`] in sync with the
//! coordination service.
//!
//! The FSM (`Init` → `FindNewestBlob` → `UpdateFromBlob` → `UpdateFromGen`)
//! runs on a dedicated background thread that consumes an `mpsc::Receiver`
//! rather than being polled; the channel carries `Event::Kick` messages
//! produced by the coordination client's async callbacks, not raw packets.
//!
//! The replicator is generic over [`CoordinationClient`] so it can run
//! against a real ensemble (production: [`ZkCoordinationClient`]) or an
//! in-memory stand-in (`testing::MockCoordinationClient`).

use std::io::Read;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{mpsc, Arc, RwLock};
use std::thread;

use flate2::read::ZlibDecoder;

use crate::dipmap::{DipMap, LogHeader};
use crate::error::ReplicatorFatal;

const LATEST_BLOB: &str = "latest_blob";
const LATEST_GEN: &str = "latest_gen";

/// Wakes the FSM thread up to re-evaluate its state. Sent by the
/// coordination client whenever its `latest_gen` watch fires or an async
/// "sync" round-trip completes — both are folded into a single event kind
/// here since both just mean "poke the FSM".
pub enum Event {
    Kick,
}

/// What the replicator needs from a coordination-service session. All
/// methods other than `connect`/`kick` are synchronous reads; "no such
/// node" is reported as `Ok(None)` (recoverable) while every other failure
/// is [`ReplicatorFatal`] (auth failure, bad arguments, marshalling,
/// invalid session state — not retryable from the data plane).
pub trait CoordinationClient {
    /// Establishes a watch-capable session and arranges for `events` to
    /// receive an [`Event::Kick`] whenever the coordination service pokes
    /// this client.
    fn connect(&mut self, events: mpsc::Sender<Event>) -> Result<(), ReplicatorFatal>;

    /// Pings the service purely to get a callback tick that drives the FSM
    /// forward.
    fn kick(&self);

    /// Reads a 4-byte integer node. Missing nodes are fatal here —
    /// `latest_blob` and `latest_gen` are expected to always exist once the
    /// controller has initialized the tree.
    fn read_int32(&self, path: &str, watch: bool) -> Result<i32, ReplicatorFatal>;

    /// Reads a (possibly multi-shard) compressed blob or log node,
    /// reassembling shards and returning the still-compressed bytes, or
    /// `None` if the node doesn't exist. Shard reassembly is the
    /// coordination service's wire-protocol concern, so it lives behind
    /// this trait rather than in the FSM.
    fn read_sharded_raw(&self, path: &str) -> Result<Option<Vec<u8>>, ReplicatorFatal>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    FindNewestBlob,
    UpdateFromBlob,
    UpdateFromGen,
}

fn inflate(compressed: &[u8]) -> Vec<u8> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .expect("coordination service served a non-zlib blob");
    out
}

/// Drives one [`DipMap`] (ring or id map) from a coordination service.
pub struct Replicator<M: DipMap, C: CoordinationClient> {
    root: String,
    map: Arc<RwLock<M>>,
    client: C,
    gen: Arc<AtomicI32>,
    latest_gen: i32,
    latest_blob: i32,
    state: State,
}

impl<M, C> Replicator<M, C>
where
    M: DipMap,
    C: CoordinationClient,
{
    /// `root` is the coordination-service path prefix for this map (e.g.
    /// `/beamer/mux_ring/` or `/beamer/id/`).
    pub fn new(root: impl Into<String>, map: Arc<RwLock<M>>, client: C) -> Self {
        Replicator {
            root: root.into(),
            map,
            client,
            gen: Arc::new(AtomicI32::new(-1)),
            latest_gen: -1,
            latest_blob: -1,
            state: State::Init,
        }
    }

    /// A shared, atomically-readable view of the current generation —
    /// reads always see either the old or the new value, never a torn one.
    /// Dispatch-path code and the `gen` operator handler clone this instead
    /// of talking to the replicator.
    pub fn gen_handle(&self) -> Arc<AtomicI32> {
        self.gen.clone()
    }

    fn path(&self, suffix: &str) -> String {
        format!("{}{}", self.root, suffix)
    }

    fn gen(&self) -> i32 {
        self.gen.load(Ordering::Acquire)
    }

    fn set_gen(&self, value: i32) {
        self.gen.store(value, Ordering::Release);
    }

    /// One pass of the state machine: loops internally while it has more
    /// work to do in the same tick, and returns (idling until the next
    /// kick) once a state has nothing further to do right now.
    fn fsm(&mut self) {
        'fsm: loop {
            match self.state {
                State::Init => {
                    self.state = State::FindNewestBlob;
                    continue 'fsm;
                }

                State::FindNewestBlob => {
                    let new_latest_blob =
                        self.client.read_int32(&self.path(LATEST_BLOB), false).unwrap_or_else(|e| {
                            log::error!("{}", e);
                            panic!("{}", e);
                        });
                    assert!(
                        new_latest_blob > self.gen() && new_latest_blob > self.latest_blob,
                        "controller published latest_blob={} out of order (gen={}, latest_blob={})",
                        new_latest_blob,
                        self.gen(),
                        self.latest_blob
                    );
                    self.latest_blob = new_latest_blob;
                    self.state = State::UpdateFromBlob;
                    log::trace!("FIND_NEWEST_BLOB -> UPDATE_FROM_BLOB (blob={})", new_latest_blob);
                    continue 'fsm;
                }

                State::UpdateFromBlob => {
                    match self.install_blob(self.latest_blob) {
                        Ok(()) => {
                            self.state = State::UpdateFromGen;
                            log::trace!("UPDATE_FROM_BLOB -> UPDATE_FROM_GEN");
                            continue 'fsm;
                        }
                        Err(()) => {
                            log::warn!("blob {} disappeared, looking for a newer one", self.latest_blob);
                            self.state = State::FindNewestBlob;
                            continue 'fsm;
                        }
                    }
                }

                State::UpdateFromGen => {
                    // The watch on latest_gen is re-armed on every read; a
                    // kick arriving while idle here means it fired, so
                    // always refresh before deciding whether there's new
                    // work.
                    let fresh_latest_gen =
                        self.client.read_int32(&self.path(LATEST_GEN), true).unwrap_or_else(|e| {
                            log::error!("{}", e);
                            panic!("{}", e);
                        });
                    if fresh_latest_gen > self.latest_gen {
                        self.latest_gen = fresh_latest_gen;
                    }

                    while self.gen() < self.latest_gen {
                        match self.replay_log(self.gen() + 1) {
                            Ok(()) => {
                                self.set_gen(self.gen() + 1);
                                log::info!("applied log, gen={}", self.gen());
                            }
                            Err(()) => {
                                log::warn!(
                                    "log {} missing, controller must have GC'd old generations",
                                    self.gen() + 1
                                );
                                self.state = State::FindNewestBlob;
                                continue 'fsm;
                            }
                        }
                    }
                    return;
                }
            }
        }
    }

    /// `Err(())` means the blob node was missing, or its inflated contents
    /// didn't decode into a whole number of entries matching the map's size
    /// (both recoverable — the caller re-enters `FindNewestBlob`); any other
    /// coordination failure panics via [`CoordinationClient::read_sharded_raw`].
    fn install_blob(&mut self, blob_no: i32) -> Result<(), ()> {
        let path = self.path(&format!("gen_{}/blob", blob_no));
        let compressed = match self.client.read_sharded_raw(&path) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Err(()),
            Err(e) => {
                log::error!("{}", e);
                panic!("{}", e);
            }
        };
        let inflated = inflate(&compressed);

        let entry_size = M::entry_wire_size();
        if inflated.len() % entry_size != 0 {
            log::warn!(
                "blob {} size {} is not a multiple of entry size {}, looking for a newer one",
                blob_no,
                inflated.len(),
                entry_size
            );
            return Err(());
        }
        let entry_count = inflated.len() / entry_size;
        let map_size = self.map.read().unwrap().size();
        if entry_count != map_size {
            log::warn!(
                "blob {} has {} entries, map expects {}, looking for a newer one",
                blob_no,
                entry_count,
                map_size
            );
            return Err(());
        }

        let entries: Vec<M::Entry> = inflated.chunks(entry_size).map(M::decode_entry).collect();
        self.map.write().unwrap().put_entries(0, &entries);
        self.set_gen(blob_no);
        Ok(())
    }

    /// `Err(())` means the log node was missing (recoverable, triggers a
    /// fresh `FIND_NEWEST_BLOB`).
    fn replay_log(&mut self, index: i32) -> Result<(), ()> {
        let path = self.path(&format!("gen_{}/log", index));
        let compressed = match self.client.read_sharded_raw(&path) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Err(()),
            Err(e) => {
                log::error!("{}", e);
                panic!("{}", e);
            }
        };
        let inflated = inflate(&compressed);
        assert!(inflated.len() >= 4, "log shorter than its own header");

        let timestamp = u32::from_ne_bytes(inflated[0..4].try_into().unwrap());
        let header = LogHeader { timestamp };

        let mut map = self.map.write().unwrap();
        let mut cursor = 4;
        while cursor < inflated.len() {
            assert!(inflated.len() - cursor >= 8, "truncated log entry");
            let dip = u32::from_ne_bytes(inflated[cursor..cursor + 4].try_into().unwrap());
            let bucket_count =
                u32::from_ne_bytes(inflated[cursor + 4..cursor + 8].try_into().unwrap()) as usize;
            cursor += 8;
            assert!(
                inflated.len() - cursor >= bucket_count * 4,
                "truncated log entry bucket list"
            );
            for i in 0..bucket_count {
                let off = cursor + i * 4;
                let bucket =
                    u32::from_ne_bytes(inflated[off..off + 4].try_into().unwrap()) as usize;
                map.update(bucket, dip, header);
            }
            cursor += bucket_count * 4;
        }
        Ok(())
    }
}

impl<M, C> Replicator<M, C>
where
    M: DipMap + Send + 'static,
    M::Entry: Send,
    C: CoordinationClient + Send + 'static,
{
    /// Connects, sends the initial kick to get the FSM moving, and spawns
    /// the background thread that owns it from then on — every subsequent
    /// step runs in response to an [`Event`] arriving on the channel.
    pub fn spawn(mut self) -> ReplicatorThread {
        let (tx, rx) = mpsc::channel();
        if let Err(e) = self.client.connect(tx) {
            log::error!("{}", e);
            panic!("{}", e);
        }
        self.client.kick();

        let join = thread::spawn(move || {
            for _event in rx.iter() {
                self.fsm();
            }
        });
        ReplicatorThread { join }
    }
}

/// A handle to the spawned replicator background thread.
pub struct ReplicatorThread {
    join: thread::JoinHandle<()>,
}

impl ReplicatorThread {
    pub fn join(self) {
        let _ = self.join.join();
    }
}

/// Production coordination client backed by the `zookeeper` crate's
/// callback/watcher-driven session API.
pub mod zk {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use zookeeper::{WatchedEvent, Watcher, ZkError, ZooKeeper};

    struct NullWatcher;
    impl Watcher for NullWatcher {
        fn handle(&self, _event: WatchedEvent) {}
    }

    struct KickWatcher {
        events_tx: Arc<Mutex<Option<mpsc::Sender<Event>>>>,
    }

    impl Watcher for KickWatcher {
        fn handle(&self, _event: WatchedEvent) {
            if let Some(tx) = self.events_tx.lock().unwrap().as_ref() {
                let _ = tx.send(Event::Kick);
            }
        }
    }

    pub struct ZkCoordinationClient {
        connect_string: String,
        session_timeout: Duration,
        handle: Option<ZooKeeper>,
        events_tx: Arc<Mutex<Option<mpsc::Sender<Event>>>>,
    }

    impl ZkCoordinationClient {
        pub fn new(connect_string: impl Into<String>) -> Self {
            ZkCoordinationClient {
                connect_string: connect_string.into(),
                session_timeout: Duration::from_secs(10),
                handle: None,
                events_tx: Arc::new(Mutex::new(None)),
            }
        }

        fn zk(&self) -> &ZooKeeper {
            self.handle
                .as_ref()
                .expect("ZkCoordinationClient used before connect()")
        }

        fn read_raw(&self, path: &str, watch: bool) -> Result<Option<Vec<u8>>, ReplicatorFatal> {
            match self.zk().get_data(path, watch) {
                Ok((data, _stat)) => Ok(Some(data)),
                Err(ZkError::NoNode) => Ok(None),
                Err(e) => Err(ReplicatorFatal(format!("zoo_get {}: {}", path, e))),
            }
        }
    }

    impl CoordinationClient for ZkCoordinationClient {
        fn connect(&mut self, events: mpsc::Sender<Event>) -> Result<(), ReplicatorFatal> {
            *self.events_tx.lock().unwrap() = Some(events);
            let zk = ZooKeeper::connect(&self.connect_string, self.session_timeout, NullWatcher)
                .map_err(|e| ReplicatorFatal(format!("zookeeper connect: {}", e)))?;
            self.handle = Some(zk);
            Ok(())
        }

        fn kick(&self) {
            let watcher = KickWatcher {
                events_tx: self.events_tx.clone(),
            };
            if let Err(e) = self.zk().exists_w("/", watcher) {
                log::warn!("kick ping failed: {}", e);
            }
        }

        fn read_int32(&self, path: &str, watch: bool) -> Result<i32, ReplicatorFatal> {
            match self.read_raw(path, watch)? {
                Some(bytes) if bytes.len() == 4 => {
                    Ok(i32::from_ne_bytes(bytes[0..4].try_into().unwrap()))
                }
                Some(_) => Err(ReplicatorFatal(format!("{} is not a 4-byte node", path))),
                None => Err(ReplicatorFatal(format!("{} missing", path))),
            }
        }

        fn read_sharded_raw(&self, path: &str) -> Result<Option<Vec<u8>>, ReplicatorFatal> {
            let first = match self.read_raw(&format!("{}_0", path), false)? {
                Some(bytes) => bytes,
                None => return Ok(None),
            };
            if first.len() < 4 {
                return Err(ReplicatorFatal(format!(
                    "{} shard 0 missing its shard-count header",
                    path
                )));
            }
            let shard_count = u32::from_be_bytes(first[0..4].try_into().unwrap());
            let mut combined = first[4..].to_vec();
            for shard in 1..shard_count {
                match self.read_raw(&format!("{}_{}", path, shard), false)? {
                    Some(bytes) => combined.extend_from_slice(&bytes),
                    None => return Ok(None),
                }
            }
            Ok(Some(combined))
        }
    }
}

pub use zk::ZkCoordinationClient;

/// In-memory [`CoordinationClient`] used by tests in place of a real
/// ensemble.
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Inner {
        nodes: HashMap<String, Vec<u8>>,
        events_tx: Option<mpsc::Sender<Event>>,
    }

    /// Stores nodes in a `HashMap` behind a `Mutex` and fires the FSM's
    /// kick channel synchronously on every write, so a test can script an
    /// exact snapshot/log sequence and assert on the result with no
    /// polling or timing dependence.
    #[derive(Clone, Default)]
    pub struct MockCoordinationClient {
        inner: Arc<Mutex<Inner>>,
    }

    impl MockCoordinationClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_int32(&self, path: &str, value: i32) {
            self.set_node(path, &value.to_ne_bytes());
        }

        pub fn set_sharded_raw(&self, path: &str, value: &[u8]) {
            self.set_node(&format!("{}_0", path), value);
        }

        pub fn remove_node(&self, path: &str) {
            self.inner.lock().unwrap().nodes.remove(path);
        }

        fn set_node(&self, path: &str, bytes: &[u8]) {
            self.inner.lock().unwrap().nodes.insert(path.to_string(), bytes.to_vec());
        }

        /// Fires an `Event::Kick`, simulating the `latest_gen` watcher or a
        /// completed async sync round-trip.
        pub fn fire_kick(&self) {
            let tx = self.inner.lock().unwrap().events_tx.clone();
            if let Some(tx) = tx {
                let _ = tx.send(Event::Kick);
            }
        }
    }

    impl CoordinationClient for MockCoordinationClient {
        fn connect(&mut self, events: mpsc::Sender<Event>) -> Result<(), ReplicatorFatal> {
            self.inner.lock().unwrap().events_tx = Some(events);
            Ok(())
        }

        fn kick(&self) {
            self.fire_kick();
        }

        fn read_int32(&self, path: &str, _watch: bool) -> Result<i32, ReplicatorFatal> {
            let inner = self.inner.lock().unwrap();
            match inner.nodes.get(path) {
                Some(bytes) if bytes.len() == 4 => {
                    Ok(i32::from_ne_bytes(bytes[0..4].try_into().unwrap()))
                }
                Some(_) => Err(ReplicatorFatal(format!("{} is not a 4-byte node", path))),
                None => Err(ReplicatorFatal(format!("{} missing", path))),
            }
        }

        fn read_sharded_raw(&self, path: &str) -> Result<Option<Vec<u8>>, ReplicatorFatal> {
            let inner = self.inner.lock().unwrap();
            Ok(inner.nodes.get(&format!("{}_0", path)).cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockCoordinationClient;
    use super::*;
    use crate::dipmap::DipHistoryMap;
    use std::io::Write;
    use std::time::Duration;

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
        for _ in 0..200 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition never became true");
    }

    #[test]
    fn fresh_replica_installs_snapshot_then_idles() {
        let map = Arc::new(RwLock::new(DipHistoryMap::init(2)));
        let client = MockCoordinationClient::new();

        client.set_int32("/beamer/mux_ring/latest_blob", 5);
        let blob = zlib(&[
            entry_bytes(1, 0, 10),
            entry_bytes(2, 0, 20),
        ]
        .concat());
        client.set_sharded_raw("/beamer/mux_ring/gen_5/blob", &blob);
        client.set_int32("/beamer/mux_ring/latest_gen", 5);

        let replicator = Replicator::new("/beamer/mux_ring/", map.clone(), client);
        let gen = replicator.gen_handle();
        let thread = replicator.spawn();

        wait_for(|| gen.load(Ordering::Acquire) == 5);
        assert_eq!(map.read().unwrap().get(0).current, 1);
        assert_eq!(map.read().unwrap().get(1).current, 2);

        drop(thread);
    }

    #[test]
    fn snapshot_then_log_catches_up_to_latest_gen() {
        let map = Arc::new(RwLock::new(DipHistoryMap::init(4)));
        let client = MockCoordinationClient::new();

        client.set_int32("/r/latest_blob", 1);
        let blob = zlib(
            &[
                entry_bytes(0, 0, 0),
                entry_bytes(0, 0, 0),
                entry_bytes(0, 0, 0),
                entry_bytes(0, 0, 0),
            ]
            .concat(),
        );
        client.set_sharded_raw("/r/gen_1/blob", &blob);
        client.set_int32("/r/latest_gen", 2);
        let log = zlib(&log_bytes(99, &[(7, &[0, 2])]));
        client.set_sharded_raw("/r/gen_2/log", &log);

        let replicator = Replicator::new("/r/", map.clone(), client);
        let gen = replicator.gen_handle();
        let thread = replicator.spawn();

        wait_for(|| gen.load(Ordering::Acquire) == 2);
        assert_eq!(map.read().unwrap().get(0).current, 7);
        assert_eq!(map.read().unwrap().get(2).current, 7);
        assert_eq!(map.read().unwrap().get(1).current, 0);

        drop(thread);
    }

    #[test]
    fn missing_log_restarts_from_a_fresh_blob_search() {
        let map = Arc::new(RwLock::new(DipHistoryMap::init(1)));
        let client = MockCoordinationClient::new();

        client.set_int32("/r/latest_blob", 1);
        let blob1 = zlib(&entry_bytes(0, 0, 0));
        client.set_sharded_raw("/r/gen_1/blob", &blob1);
        client.set_int32("/r/latest_gen", 1);

        let replicator = Replicator::new("/r/", map.clone(), client.clone());
        let gen = replicator.gen_handle();
        let thread = replicator.spawn();

        wait_for(|| gen.load(Ordering::Acquire) == 1);

        // Controller advances to gen 2 but, by the time the replicator
        // looks for gen_2/log, it has already been GC'd in favor of a
        // gen_3 snapshot — gen_2/log is deliberately never published.
        client.set_int32("/r/latest_blob", 3);
        let blob3 = zlib(&entry_bytes(55, 0, 1234));
        client.set_sharded_raw("/r/gen_3/blob", &blob3);
        client.set_int32("/r/latest_gen", 2);
        client.fire_kick();

        wait_for(|| gen.load(Ordering::Acquire) == 3);
        assert_eq!(map.read().unwrap().get(0).current, 55);

        drop(thread);
    }
}
