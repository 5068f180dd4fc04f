//! The Mux dispatcher.
//!
//! [`StatelessMux`] and [`StatefulMux`] share nearly all of their
//! configuration and dispatch logic; this crate factors that shared part
//! into [`MuxCore`] (ring + id map + encapsulators + the current
//! generation) and builds the two dispatchers on top of it instead of
//! duplicating the TCP/UDP handling twice.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, RwLock};

use crate::dipmap::{bucket_index, Dip, DipHistoryEntry, DipHistoryMap, PlainDipMap};
use crate::encap::{GgEncapper, IpipEncapper, Packet};
use crate::error::PacketError;
use crate::hash;
use crate::statetrack::{FiveTuple, PerCpuStateTrack, Tick};

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

#[derive(Copy, Clone, Debug)]
struct Meta {
    proto: u8,
    src_ip: u32,
    src_port: u16,
    dst_ip: u32,
    dst_port: u16,
}

/// Reads just enough of an IPv4 datagram to classify it: the protocol
/// field, both addresses, and — for TCP/UDP — both ports. Returns `None`
/// for anything this dispatcher doesn't classify (non-IPv4, non-TCP/UDP,
/// or too short to contain the headers it claims to), which the caller
/// treats as "pass through unchanged".
fn read_meta(bytes: &[u8]) -> Option<Meta> {
    if bytes.len() < 20 || bytes[0] >> 4 != 4 {
        return None;
    }
    let ihl = ((bytes[0] & 0x0F) as usize) * 4;
    let proto = bytes[9];
    if proto != IPPROTO_TCP && proto != IPPROTO_UDP {
        return None;
    }
    if bytes.len() < ihl + 4 {
        return None;
    }
    let src_ip = u32::from_ne_bytes(bytes[12..16].try_into().unwrap());
    let dst_ip = u32::from_ne_bytes(bytes[16..20].try_into().unwrap());
    let l4 = &bytes[ihl..];
    let src_port = u16::from_be_bytes([l4[0], l4[1]]);
    let dst_port = u16::from_be_bytes([l4[2], l4[3]]);
    Some(Meta {
        proto,
        src_ip,
        src_port,
        dst_ip,
        dst_port,
    })
}

/// The ring, the id map, the current generation, and the two
/// encapsulators — everything `StatelessMux`/`StatefulMux` share, owned
/// for the lifetime of whichever element holds it.
pub struct MuxCore {
    vip: Dip,
    ring: Arc<RwLock<DipHistoryMap>>,
    id_map: Arc<RwLock<PlainDipMap>>,
    gen: Arc<AtomicI32>,
    ipip: IpipEncapper,
    gg: GgEncapper,
}

impl MuxCore {
    pub fn new(
        vip: Dip,
        ring: Arc<RwLock<DipHistoryMap>>,
        id_map: Arc<RwLock<PlainDipMap>>,
        gen: Arc<AtomicI32>,
    ) -> Self {
        MuxCore {
            vip,
            ring,
            id_map,
            gen,
            ipip: IpipEncapper::new(),
            gg: GgEncapper::new(),
        }
    }

    fn bucket(&self, hash: u32) -> DipHistoryEntry {
        let ring = self.ring.read().unwrap();
        let idx = bucket_index(hash, ring.size());
        ring.get(idx)
    }

    fn reserved_dip(&self, port: u16) -> Dip {
        self.id_map.read().unwrap().get(port)
    }

    fn gen_be(&self) -> u32 {
        (self.gen.load(Ordering::Acquire) as u32).to_be()
    }

    fn handle_udp(&self, packet: &mut Packet, meta: Meta) -> Result<(), PacketError> {
        let h = hash::hash(meta.src_ip, meta.src_port, meta.dst_port);
        let entry = self.bucket(h);
        self.ipip.encapsulate(packet, self.vip, entry.current)
    }
}

/// The stateless Mux: every TCP/UDP packet is routed purely off the ring
/// or the id map, with no per-flow memory.
pub struct StatelessMux {
    core: MuxCore,
}

impl StatelessMux {
    pub fn new(core: MuxCore) -> Self {
        StatelessMux { core }
    }

    pub fn on_packet(&self, packet: &mut Packet) -> Result<(), PacketError> {
        let meta = match read_meta(packet.as_bytes()) {
            Some(m) => m,
            None => return Ok(()),
        };
        match meta.proto {
            IPPROTO_TCP => self.handle_tcp(packet, meta),
            IPPROTO_UDP => self.core.handle_udp(packet, meta),
            _ => Ok(()),
        }
    }

    fn handle_tcp(&self, packet: &mut Packet, meta: Meta) -> Result<(), PacketError> {
        if meta.dst_port < PlainDipMap::RESERVED_PORT_COUNT as u16 {
            let h = hash::hash(meta.src_ip, meta.src_port, meta.dst_port);
            let entry = self.core.bucket(h);
            let gen = self.core.gen_be();
            self.core.gg.encapsulate(
                packet,
                self.core.vip,
                entry.current,
                entry.prev,
                entry.timestamp.to_be(),
                gen,
            )
        } else {
            let dip = self.core.reserved_dip(meta.dst_port);
            self.core.ipip.encapsulate(packet, self.core.vip, dip)
        }
    }

    /// Processes a batch of packets in place, preserving input order;
    /// packets that fail encapsulation (insufficient tailroom or malformed
    /// input) are dropped from the output rather than causing the batch to
    /// unwind.
    pub fn on_batch(&self, packets: Vec<Packet>) -> Vec<Packet> {
        let mut out = Vec::with_capacity(packets.len());
        for mut p in packets {
            match self.on_packet(&mut p) {
                Ok(()) => out.push(p),
                Err(e) => log::warn!("dropping packet: {}", e),
            }
        }
        out
    }
}

/// The stateful Mux: TCP flows below `RESERVED_PORT_COUNT` are pinned to
/// whichever DIP they first landed on, via a per-CPU [`PerCpuStateTrack`].
pub struct StatefulMux {
    core: MuxCore,
    states: PerCpuStateTrack,
}

impl StatefulMux {
    pub fn new(core: MuxCore, cpu_count: usize, max_states: usize, idle_ticks: Tick) -> Self {
        StatefulMux {
            core,
            states: PerCpuStateTrack::new(cpu_count, max_states, idle_ticks),
        }
    }

    pub fn on_packet(&mut self, packet: &mut Packet, cpu: usize, now: Tick) -> Result<(), PacketError> {
        let meta = match read_meta(packet.as_bytes()) {
            Some(m) => m,
            None => return Ok(()),
        };
        match meta.proto {
            IPPROTO_TCP => self.handle_tcp(packet, meta, cpu, now),
            IPPROTO_UDP => self.core.handle_udp(packet, meta),
            _ => Ok(()),
        }
    }

    pub fn on_batch(&mut self, packets: Vec<Packet>, cpu: usize, now: Tick) -> Vec<Packet> {
        let mut out = Vec::with_capacity(packets.len());
        for mut p in packets {
            match self.on_packet(&mut p, cpu, now) {
                Ok(()) => out.push(p),
                Err(e) => log::warn!("dropping packet: {}", e),
            }
        }
        out
    }

    fn handle_tcp(
        &mut self,
        packet: &mut Packet,
        meta: Meta,
        cpu: usize,
        now: Tick,
    ) -> Result<(), PacketError> {
        if meta.dst_port >= PlainDipMap::RESERVED_PORT_COUNT as u16 {
            let dip = self.core.reserved_dip(meta.dst_port);
            return self.core.ipip.encapsulate(packet, self.core.vip, dip);
        }

        let h = hash::hash(meta.src_ip, meta.src_port, meta.dst_port);
        let entry = self.core.bucket(h);
        let key = FiveTuple {
            src_ip: meta.src_ip,
            src_port: meta.src_port,
            dst_ip: meta.dst_ip,
            dst_port: meta.dst_port,
            proto: IPPROTO_TCP,
        };
        let track = self.states.shard(cpu);

        // `daisy` is only ever consulted behind `stateful-daisy-chain`;
        // without the feature the Mux always emits plain IPIP.
        #[cfg(feature = "stateful-daisy-chain")]
        let mut daisy: Option<(Dip, u32)> = None;

        let dip = if let Some(state) = track.lookup_best_effort(&key, now) {
            track.refresh(&key, now);
            #[cfg(feature = "stateful-daisy-chain")]
            {
                if state.dip == entry.current {
                    daisy = Some((entry.prev, entry.timestamp));
                }
            }
            state.dip
        } else {
            let dip = entry.current;
            #[cfg(feature = "stateful-daisy-chain")]
            {
                daisy = Some((entry.prev, entry.timestamp));
            }
            track.insert_best_effort(key, dip, now);
            dip
        };

        #[cfg(feature = "stateful-daisy-chain")]
        {
            if let Some((pdip, ts)) = daisy {
                if pdip != 0 && pdip != dip {
                    let gen = self.core.gen_be();
                    return self
                        .core
                        .gg
                        .encapsulate(packet, self.core.vip, dip, pdip, ts.to_be(), gen);
                }
            }
        }

        self.core.ipip.encapsulate(packet, self.core.vip, dip)
    }
}
