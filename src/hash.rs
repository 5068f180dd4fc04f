//! 32-bit hash of a flow's (src-ip, src-port[, dst-port]), used to select a
//! bucket in the consistent-hash ring.
//!
//! Two backends are selectable at build time via Cargo features: `hash-crc`
//! (default) and `hash-bob`. Consistency between the controller and all Mux
//! replicas of this choice is a deployment invariant, not something this
//! crate can check at runtime.

/// Hashes a flow's source IP and source port (network byte order, i.e. as
/// they appear on the wire). `dst_port_be` is only consulted by the Bob
/// Jenkins backend; the CRC backend ignores it and hashes only the
/// (src-ip, src-port) pair.
pub fn hash(src_ip_be: u32, src_port_be: u16, dst_port_be: u16) -> u32 {
    #[cfg(feature = "hash-bob")]
    {
        bob_jenkins(src_ip_be, src_port_be, dst_port_be)
    }
    #[cfg(not(feature = "hash-bob"))]
    {
        let _ = dst_port_be;
        crc(src_ip_be, src_port_be)
    }
}

/// A 6-byte CRC-32 over the concatenation `src_ip_be || src_port_be ||
/// 0x0000` — an 8-byte tuple buffer with the final two bytes left zero.
pub fn crc(src_ip_be: u32, src_port_be: u16) -> u32 {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&src_ip_be.to_ne_bytes());
    buf[4..6].copy_from_slice(&src_port_be.to_ne_bytes());
    // buf[6..8] stay zero: the reserved half of the 8-byte tuple.
    crc32fast::hash(&buf[..6])
}

/// Bob Jenkins' one-at-a-time / lookup3-style three-word mixer over
/// `(src_ip, src_port, dst_port)`, used when the P4/hardware hash tables
/// were provisioned with this function instead of CRC-32.
pub fn bob_jenkins(src_ip_be: u32, src_port_be: u16, dst_port_be: u16) -> u32 {
    let mut a = src_ip_be;
    let mut b = src_port_be as u32;
    let mut c = dst_port_be as u32;

    a = a.wrapping_sub(b);
    a = a.wrapping_sub(c);
    a ^= c >> 13;
    b = b.wrapping_sub(c);
    b = b.wrapping_sub(a);
    b ^= a << 8;
    c = c.wrapping_sub(a);
    c = c.wrapping_sub(b);
    c ^= b >> 13;
    a = a.wrapping_sub(b);
    a = a.wrapping_sub(c);
    a ^= c >> 12;
    b = b.wrapping_sub(c);
    b = b.wrapping_sub(a);
    b ^= a << 16;
    c = c.wrapping_sub(a);
    c = c.wrapping_sub(b);
    c ^= b >> 5;
    a = a.wrapping_sub(b);
    a = a.wrapping_sub(c);
    a ^= c >> 3;
    b = b.wrapping_sub(c);
    b = b.wrapping_sub(a);
    b ^= a << 10;
    c = c.wrapping_sub(a);
    c = c.wrapping_sub(b);
    c ^= b >> 15;

    c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_is_deterministic() {
        let a = crc(0x0100_007f, 0x5000);
        let b = crc(0x0100_007f, 0x5000);
        assert_eq!(a, b);
    }

    #[test]
    fn crc_distinguishes_ports() {
        let a = crc(0x0100_007f, 0x5000);
        let b = crc(0x0100_007f, 0x5100);
        assert_ne!(a, b);
    }

    #[test]
    fn crc_ignores_dst_port() {
        // The CRC touple never includes dport, so hash() must not change
        // when only dst_port_be varies under the default feature set.
        assert_eq!(hash(0x0100_007f, 42, 80), hash(0x0100_007f, 42, 8080));
    }

    #[test]
    fn bob_jenkins_is_deterministic() {
        let a = bob_jenkins(0x0100_007f, 42, 80);
        let b = bob_jenkins(0x0100_007f, 42, 80);
        assert_eq!(a, b);
    }

    #[test]
    fn bob_jenkins_distinguishes_dst_port() {
        let a = bob_jenkins(0x0100_007f, 42, 80);
        let b = bob_jenkins(0x0100_007f, 42, 8080);
        assert_ne!(a, b);
    }
}
