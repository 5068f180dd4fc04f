//! Components E & F: the IPIP and GG encapsulators, plus the [`Packet`]
//! buffer type they operate on.
//!
//! Both encapsulators precompute a header template once (at construction)
//! and, per packet, only ever apply [`crate::checksum`] fixups on top of the
//! template's checksum — never a from-scratch resum of the prepended bytes.

use crate::checksum;
use crate::error::PacketError;

/// A packet buffer with headroom reserved in front of the network-layer
/// start, so prepending an outer header is a pointer bump rather than a
/// bulk copy of the tail. `grow_front` fails cleanly instead of panicking
/// when too little headroom remains.
pub struct Packet {
    buf: Vec<u8>,
    start: usize,
}

impl Packet {
    /// Wraps `payload` (an already-framed IPv4 datagram) with `headroom`
    /// spare bytes reserved before it for encapsulators to grow into.
    pub fn with_headroom(payload: &[u8], headroom: usize) -> Self {
        let mut buf = vec![0u8; headroom + payload.len()];
        buf[headroom..].copy_from_slice(payload);
        Packet { buf, start: headroom }
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.buf[self.start..]
    }

    /// Reveals `n` bytes of headroom in front of the current start,
    /// extending the packet by `n` bytes total. Fails if fewer than `n`
    /// bytes of headroom remain.
    pub fn grow_front(&mut self, n: usize) -> Result<(), PacketError> {
        if n > self.start {
            return Err(PacketError::InsufficientTailroom {
                needed: n - self.start,
            });
        }
        self.start -= n;
        Ok(())
    }
}

fn from_scratch_checksum(bytes: &[u8]) -> u16 {
    let mut acc: u32 = 0;
    let mut chunks = bytes.chunks(2);
    for chunk in &mut chunks {
        if chunk.len() == 2 {
            acc += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
        } else {
            acc += u32::from(chunk[0]) << 8;
        }
    }
    while acc >> 16 != 0 {
        acc = (acc & 0xFFFF) + (acc >> 16);
    }
    !(acc as u16)
}

const IP_VERSION_IHL_NO_OPTS: u8 = 0x45;
const IP_PROTO_IPIP: u8 = 4;
const IP_TTL: u8 = 250;

/// Prepends a bare 20-byte IP-in-IP header.
pub struct IpipEncapper {
    template: [u8; 20],
    template_ip_sum: u16,
}

impl IpipEncapper {
    pub fn new() -> Self {
        let mut template = [0u8; 20];
        template[0] = IP_VERSION_IHL_NO_OPTS;
        template[8] = IP_TTL;
        template[9] = IP_PROTO_IPIP;
        let template_ip_sum = from_scratch_checksum(&template);
        IpipEncapper {
            template,
            template_ip_sum,
        }
    }

    /// Prepends a 20-byte outer IPv4 header with `src=vip, dst=dip`, fixing
    /// up the checksum incrementally from the template rather than
    /// re-summing the 20 bytes.
    pub fn encapsulate(&self, packet: &mut Packet, vip: u32, dip: u32) -> Result<(), PacketError> {
        let inner_total_len = packet.len();
        packet.grow_front(20)?;

        let buf = packet.as_mut_bytes();
        buf[0..20].copy_from_slice(&self.template);

        let total_length = inner_total_len as u32 + 20;
        buf[2..4].copy_from_slice(&(total_length as u16).to_be_bytes());
        buf[12..16].copy_from_slice(&vip.to_ne_bytes());
        buf[16..20].copy_from_slice(&dip.to_ne_bytes());

        let acc = checksum::seed(self.template_ip_sum);
        let acc = checksum::fixup32(acc, 0, vip);
        let acc = checksum::fixup32(acc, 0, dip);
        let acc = checksum::fixup16(acc, 0, total_length as u16);
        let ip_sum = checksum::fold(acc);
        buf[10..12].copy_from_slice(&ip_sum.to_be_bytes());

        log::debug!(
            "ipip encapsulate: vip={:08x} dip={:08x} total_length={}",
            vip,
            dip,
            total_length
        );
        Ok(())
    }
}

impl Default for IpipEncapper {
    fn default() -> Self {
        Self::new()
    }
}

const GG_OPTION_LEN: usize = 16;
const GG_TOTAL_HEADER_LEN: usize = 20 + GG_OPTION_LEN;
// copied=0, class=3 (experimental/reserved), number=1.
const GG_OPTION_TYPE_BYTE: u8 = (0 << 7) | (3 << 5) | 1;
const GG_OPTION_LENGTH_BYTE: u8 = GG_OPTION_LEN as u8;

/// Prepends a 36-byte outer header — a 20-byte IPv4 header
/// followed by a 16-byte IP option carrying `{ pdip, ts, gen }`, the
/// daisy-chaining metadata.
pub struct GgEncapper {
    template: [u8; GG_TOTAL_HEADER_LEN],
    template_ip_sum: u16,
}

impl GgEncapper {
    pub fn new() -> Self {
        let mut template = [0u8; GG_TOTAL_HEADER_LEN];
        // IHL counts 4-byte words: 20-byte base header + 16-byte option = 36
        // bytes = 9 words.
        template[0] = 0x40 | 9;
        template[8] = IP_TTL;
        template[9] = IP_PROTO_IPIP;
        template[20] = GG_OPTION_TYPE_BYTE;
        template[21] = GG_OPTION_LENGTH_BYTE;
        // template[22..24] is the 2-byte pad, left zero.
        let template_ip_sum = from_scratch_checksum(&template);
        GgEncapper {
            template,
            template_ip_sum,
        }
    }

    /// Prepends the 36-byte outer header, filling in `vip`/`dip` and the
    /// daisy-chain triple `{pdip, ts, gen}` (all taken as already in their
    /// on-wire byte representation — `gen` in particular is the caller's
    /// `htonl(gen)`, not a host-order generation counter).
    #[allow(clippy::too_many_arguments)]
    pub fn encapsulate(
        &self,
        packet: &mut Packet,
        vip: u32,
        dip: u32,
        pdip: u32,
        ts: u32,
        gen: u32,
    ) -> Result<(), PacketError> {
        let inner_total_len = packet.len();
        packet.grow_front(GG_TOTAL_HEADER_LEN)?;

        let buf = packet.as_mut_bytes();
        buf[0..GG_TOTAL_HEADER_LEN].copy_from_slice(&self.template);

        let total_length = inner_total_len as u32 + GG_TOTAL_HEADER_LEN as u32;
        buf[2..4].copy_from_slice(&(total_length as u16).to_be_bytes());
        buf[12..16].copy_from_slice(&vip.to_ne_bytes());
        buf[16..20].copy_from_slice(&dip.to_ne_bytes());
        buf[24..28].copy_from_slice(&pdip.to_ne_bytes());
        buf[28..32].copy_from_slice(&ts.to_ne_bytes());
        buf[32..36].copy_from_slice(&gen.to_ne_bytes());

        let acc = checksum::seed(self.template_ip_sum);
        let acc = checksum::fixup32(acc, 0, vip);
        let acc = checksum::fixup32(acc, 0, dip);
        let acc = checksum::fixup16(acc, 0, total_length as u16);
        let acc = checksum::fixup32(acc, 0, pdip);
        let acc = checksum::fixup32(acc, 0, ts);
        let acc = checksum::fixup32(acc, 0, gen);
        let ip_sum = checksum::fold(acc);
        buf[10..12].copy_from_slice(&ip_sum.to_be_bytes());

        log::debug!(
            "gg encapsulate: vip={:08x} dip={:08x} pdip={:08x} ts={} gen={:08x}",
            vip,
            dip,
            pdip,
            ts,
            gen
        );
        Ok(())
    }
}

impl Default for GgEncapper {
    fn default() -> Self {
        Self::new()
    }
}
