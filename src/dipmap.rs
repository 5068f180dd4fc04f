//! The two fixed-size maps the replicator keeps in sync: [`DipHistoryMap`]
//! (the consistent-hash ring) and [`PlainDipMap`] (the reserved-port side
//! channel). Both are exposed through the shared [`DipMap`] capability set
//! so [`crate::replicator`] can be written once and instantiated for either,
//! as a trait rather than a tagged enum since neither map's shape changes
//! at runtime.

/// A 32-bit IPv4 address in network byte order. Zero means "unassigned".
pub type Dip = u32;

/// Per-log-entry header carried alongside a bucket update. Both map types
/// accept one as `update`'s third argument; only `DipHistoryMap` uses the
/// timestamp it carries.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LogHeader {
    pub timestamp: u32,
}

/// `{ current, prev, timestamp }` for one bucket of a [`DIPHistoryMap`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DipHistoryEntry {
    pub current: Dip,
    pub prev: Dip,
    pub timestamp: u32,
}

impl DipHistoryEntry {
    pub const WIRE_SIZE: usize = 12;

    fn from_wire(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= Self::WIRE_SIZE);
        DipHistoryEntry {
            current: u32::from_ne_bytes(bytes[0..4].try_into().unwrap()),
            prev: u32::from_ne_bytes(bytes[4..8].try_into().unwrap()),
            timestamp: u32::from_ne_bytes(bytes[8..12].try_into().unwrap()),
        }
    }
}

/// The capability set the replicator needs from a ring map, shared between
/// [`DipHistoryMap`] and [`PlainDipMap`].
pub trait DipMap {
    /// The persisted, on-the-wire form of one slot (what a snapshot blob is
    /// a tightly packed array of).
    type Entry: Copy;

    /// Number of slots in the map. Fixed at construction, never resized.
    fn size(&self) -> usize;

    /// Byte width of one [`Self::Entry`] as it appears in a snapshot blob.
    fn entry_wire_size() -> usize;

    /// Decodes one wire-format entry out of `bytes` (at least
    /// `entry_wire_size()` bytes long).
    fn decode_entry(bytes: &[u8]) -> Self::Entry;

    /// Bulk-overwrites `count` consecutive slots starting at `offset` —
    /// the snapshot-install path. O(count).
    fn put_entries(&mut self, offset: usize, entries: &[Self::Entry]);

    /// Applies one log-replicated assignment of `dip` to bucket/port
    /// `index`, given the log's header. For [`DipHistoryMap`] this rotates
    /// history (unless `dip` is already `current`); for [`PlainDipMap`] it
    /// unconditionally overwrites and ignores `header`.
    fn update(&mut self, index: usize, dip: Dip, header: LogHeader);
}

/// A fixed-length ring of [`DipHistoryEntry`], one per bucket.
/// Bucket index is `hash(flow) mod ring_size`, computed by the caller via
/// [`bucket_index`] — `get`/`update` here take an already-resolved index so
/// the map itself stays a pure fixed-size container.
pub struct DipHistoryMap {
    entries: Vec<DipHistoryEntry>,
}

impl DipHistoryMap {
    /// Allocates `n` zeroed entries. `n` is bounded to `[0, 2^23]` by the
    /// caller; this constructor does not itself enforce the bound so it can
    /// also be sized from a controller-supplied `/beamer/config/ring_size`
    /// value that was already validated upstream.
    pub fn init(n: usize) -> Self {
        DipHistoryMap {
            entries: vec![DipHistoryEntry::default(); n],
        }
    }

    /// Pure read of one bucket's current history triple.
    pub fn get(&self, bucket: usize) -> DipHistoryEntry {
        self.entries[bucket]
    }
}

impl DipMap for DipHistoryMap {
    type Entry = DipHistoryEntry;

    fn size(&self) -> usize {
        self.entries.len()
    }

    fn entry_wire_size() -> usize {
        DipHistoryEntry::WIRE_SIZE
    }

    fn decode_entry(bytes: &[u8]) -> Self::Entry {
        DipHistoryEntry::from_wire(bytes)
    }

    fn put_entries(&mut self, offset: usize, entries: &[Self::Entry]) {
        self.entries[offset..offset + entries.len()].copy_from_slice(entries);
    }

    fn update(&mut self, index: usize, dip: Dip, header: LogHeader) {
        let entry = &mut self.entries[index];
        if dip == entry.current {
            log::trace!("dip history bucket {} already at {:08x}, no-op", index, dip);
            return;
        }
        entry.prev = entry.current;
        entry.current = dip;
        entry.timestamp = header.timestamp;
        log::debug!(
            "dip history bucket {} -> current={:08x} prev={:08x} ts={}",
            index,
            entry.current,
            entry.prev,
            entry.timestamp
        );
    }
}

/// A fixed-length array of 65536 [`Dip`]s, indexed directly by
/// destination TCP port. Encodes the reserved-port side channel for
/// controller-issued long-lived connections.
pub struct PlainDipMap {
    entries: Vec<Dip>,
}

impl PlainDipMap {
    pub const RESERVED_PORT_COUNT: usize = 1024;
    pub const SIZE: usize = 0x10000;

    /// Always sized to 65536 regardless of `RING_SIZE`.
    pub fn init() -> Self {
        PlainDipMap {
            entries: vec![0; Self::SIZE],
        }
    }

    pub fn get(&self, port: u16) -> Dip {
        self.entries[port as usize]
    }
}

impl DipMap for PlainDipMap {
    type Entry = Dip;

    fn size(&self) -> usize {
        self.entries.len()
    }

    fn entry_wire_size() -> usize {
        4
    }

    fn decode_entry(bytes: &[u8]) -> Self::Entry {
        u32::from_ne_bytes(bytes[0..4].try_into().unwrap())
    }

    fn put_entries(&mut self, offset: usize, entries: &[Self::Entry]) {
        self.entries[offset..offset + entries.len()].copy_from_slice(entries);
    }

    fn update(&mut self, index: usize, dip: Dip, _header: LogHeader) {
        self.entries[index] = dip;
        log::debug!("plain dip map port {} -> {:08x}", index, dip);
    }
}

/// Resolves a flow hash to a ring bucket: `hash mod ring_size`.
pub fn bucket_index(hash: u32, ring_size: usize) -> usize {
    (hash as usize) % ring_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_rotation_on_distinct_writes() {
        let mut map = DipHistoryMap::init(4);
        map.update(0, 10, LogHeader { timestamp: 100 });
        assert_eq!(
            map.get(0),
            DipHistoryEntry {
                current: 10,
                prev: 0,
                timestamp: 100
            }
        );

        map.update(0, 20, LogHeader { timestamp: 200 });
        assert_eq!(
            map.get(0),
            DipHistoryEntry {
                current: 20,
                prev: 10,
                timestamp: 200
            }
        );
    }

    #[test]
    fn repeated_write_of_same_dip_is_a_no_op() {
        let mut map = DipHistoryMap::init(1);
        map.update(0, 10, LogHeader { timestamp: 100 });
        map.update(0, 10, LogHeader { timestamp: 999 });
        assert_eq!(
            map.get(0),
            DipHistoryEntry {
                current: 10,
                prev: 0,
                timestamp: 100
            }
        );
    }

    #[test]
    fn applying_same_log_entry_twice_rotates_on_second_apply_if_dip_changed_between() {
        // Not a no-op in general: writing a *different* dip, then writing the
        // first dip back again, rotates history both times.
        let mut map = DipHistoryMap::init(1);
        map.update(0, 10, LogHeader { timestamp: 1 });
        map.update(0, 20, LogHeader { timestamp: 2 });
        map.update(0, 10, LogHeader { timestamp: 3 });
        assert_eq!(
            map.get(0),
            DipHistoryEntry {
                current: 10,
                prev: 20,
                timestamp: 3
            }
        );
    }

    #[test]
    fn put_entries_bulk_overwrite() {
        let mut map = DipHistoryMap::init(4);
        let entries = [
            DipHistoryEntry {
                current: 1,
                prev: 0,
                timestamp: 1,
            },
            DipHistoryEntry {
                current: 2,
                prev: 0,
                timestamp: 1,
            },
        ];
        map.put_entries(1, &entries);
        assert_eq!(map.get(0), DipHistoryEntry::default());
        assert_eq!(map.get(1).current, 1);
        assert_eq!(map.get(2).current, 2);
        assert_eq!(map.get(3), DipHistoryEntry::default());
    }

    #[test]
    fn plain_map_overwrites_without_history() {
        let mut map = PlainDipMap::init();
        assert_eq!(map.size(), PlainDipMap::SIZE);
        map.update(500, 7, LogHeader { timestamp: 1 });
        assert_eq!(map.get(500), 7);
        map.update(500, 8, LogHeader { timestamp: 2 });
        assert_eq!(map.get(500), 8);
    }

    #[test]
    fn bucket_index_wraps() {
        assert_eq!(bucket_index(5, 4), 1);
        assert_eq!(bucket_index(0, 4), 0);
    }
}
