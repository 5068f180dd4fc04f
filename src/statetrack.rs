//! The per-CPU, bounded, time-expiring flow state table that gives the
//! stateful Mux its pinning behavior.
//!
//! A `HashMap` keyed on an arbitrary flow-key type, with per-entry expiry
//! against an elapsed-tick budget, extended with a bounded capacity and an
//! eviction queue so a table never grows without limit.

use std::collections::{HashMap, VecDeque};

use crate::dipmap::Dip;

/// A monotonically increasing tick count, caller-supplied. Decoupled from
/// wall-clock `Instant` so dispatch-path code can use whatever per-worker
/// clock source it already samples once per batch rather than calling into
/// the OS per packet.
pub type Tick = u64;

/// Four minutes' worth of ticks at `tick_rate` ticks/second.
pub fn idle_ticks(tick_rate: u64) -> Tick {
    4 * 60 * tick_rate
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub src_ip: u32,
    pub src_port: u16,
    pub dst_ip: u32,
    pub dst_port: u16,
    pub proto: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MuxState {
    pub dip: Dip,
    pub last_touched: Tick,
}

/// One CPU's flow table. Entries older than `idle_ticks` are treated as
/// absent by `lookup_best_effort` and reaped lazily on the next access to
/// the same key. The dispatcher calls `refresh` on every hit, sliding the
/// idle deadline forward: a busy flow's session never ends, but which DIP
/// it's pinned to never changes either, since `refresh` only ever touches
/// `last_touched`. The eviction queue tracks insertion order, which can
/// drift from last-touched order once `refresh` is in play — acceptable
/// here since eviction is a capacity release valve, not a correctness
/// requirement.
pub struct StateTrack {
    capacity: usize,
    idle_ticks: Tick,
    entries: HashMap<FiveTuple, MuxState>,
    insertion_order: VecDeque<FiveTuple>,
}

impl StateTrack {
    pub fn new(capacity: usize, idle_ticks: Tick) -> Self {
        StateTrack {
            capacity,
            idle_ticks,
            entries: HashMap::with_capacity(capacity),
            insertion_order: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns the flow's pinned state if one exists and hasn't gone idle
    /// for longer than `T_idle`. A stale hit is reaped on the spot and
    /// reported as a miss.
    pub fn lookup_best_effort(&mut self, key: &FiveTuple, now: Tick) -> Option<MuxState> {
        match self.entries.get(key) {
            Some(state) if now.saturating_sub(state.last_touched) < self.idle_ticks => {
                Some(*state)
            }
            Some(_) => {
                log::debug!("state for {:?} went idle, reaping", key);
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Sets `last_touched` on an existing entry, extending its idle
    /// deadline. Called on every stateful-dispatch cache hit — this only
    /// ever postpones expiry, never changes `dip`, so it cannot undo
    /// pinning.
    pub fn refresh(&mut self, key: &FiveTuple, now: Tick) {
        if let Some(state) = self.entries.get_mut(key) {
            state.last_touched = now;
        }
    }

    /// Binds `key` to `dip`, evicting the oldest entry if the table is at
    /// capacity. Best-effort: a capacity of zero means every insert is a
    /// silent no-op, and callers must tolerate `lookup_best_effort` never
    /// finding what they just inserted.
    pub fn insert_best_effort(&mut self, key: FiveTuple, dip: Dip, now: Tick) {
        if self.capacity == 0 {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            if let Some(evicted) = self.insertion_order.pop_front() {
                self.entries.remove(&evicted);
                log::debug!("state table full, evicted {:?}", evicted);
            }
        }
        if self.entries.insert(key, MuxState { dip, last_touched: now }).is_none() {
            self.insertion_order.push_back(key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One independent [`StateTrack`] per CPU, each owned solely by its CPU —
/// there is no cross-CPU synchronization here because there is nothing to
/// synchronize.
pub struct PerCpuStateTrack {
    shards: Vec<StateTrack>,
}

impl PerCpuStateTrack {
    /// `max_states` is divided evenly across `cpu_count` shards.
    pub fn new(cpu_count: usize, max_states: usize, idle_ticks: Tick) -> Self {
        let per_cpu = max_states / cpu_count.max(1);
        let shards = (0..cpu_count)
            .map(|_| StateTrack::new(per_cpu, idle_ticks))
            .collect();
        PerCpuStateTrack { shards }
    }

    pub fn shard(&mut self, cpu: usize) -> &mut StateTrack {
        &mut self.shards[cpu]
    }
}
