//! Incremental (RFC 1624) checksum fixup.
//!
//! Unlike a from-scratch one's-complement sum over a header's bytes (the
//! style `rpkt`'s `checksum_utils` and `pnet::packet::ipv4::checksum` use),
//! the encapsulators in this crate never re-sum the payload: they start from
//! a precomputed checksum over a header *template* and apply a fixup for
//! exactly the fields that differ between the template and the packet being
//! built. `fixup16`/`fixup32` implement RFC 1624's incremental update of a
//! one's-complement sum; `fold` collapses the accumulator to the final
//! header value.

/// RFC 1624 incremental update of a one's-complement checksum accumulator
/// for a 16-bit field change. `old` and `new` are the old and new field
/// values, both in the same byte order (the header's wire order); `acc` is
/// the running accumulator, initially `!checksum` of the template (i.e. the
/// one's complement of the template's stored checksum, so that repeated
/// fixups compose and `fold` can complement once at the end).
///
/// Per RFC 1624: `HC' = ~(~HC + ~m + m')` where `m`/`m'` are the old/new
/// 16-bit field values (one's-complement arithmetic, with end-around carry).
pub fn fixup16(acc: u32, old: u16, new: u16) -> u32 {
    let acc = acc
        .wrapping_add(!(old as u32) & 0xFFFF)
        .wrapping_add(new as u32);
    fold_to_u32(acc)
}

/// Same as [`fixup16`] but for a 32-bit field change (e.g. an IPv4 address),
/// applied as two 16-bit fixups over the field's high and low halves.
pub fn fixup32(acc: u32, old: u32, new: u32) -> u32 {
    let acc = fixup16(acc, (old >> 16) as u16, (new >> 16) as u16);
    fixup16(acc, old as u16, new as u16)
}

/// Collapses an accumulator built up via [`fixup16`]/[`fixup32`] into the
/// final 16-bit header checksum value (already complemented, ready to store
/// on the wire).
pub fn fold(acc: u32) -> u16 {
    !(fold_to_u32(acc) as u16)
}

/// Folds carries out of the upper 16 bits, iterating until none remain (a
/// single 32-to-16 fold can itself generate a new carry when the input had
/// more than one pending carry, which happens once we've chained several
/// fixups together).
fn fold_to_u32(mut acc: u32) -> u32 {
    while acc >> 16 != 0 {
        acc = (acc & 0xFFFF) + (acc >> 16);
    }
    acc
}

/// Seeds an accumulator from a stored (already-complemented) header
/// checksum, so that [`fixup16`]/[`fixup32`] calls can be chained on top of
/// it and [`fold`] applied once at the end.
pub fn seed(stored_checksum: u16) -> u32 {
    !(stored_checksum as u32) & 0xFFFF
}
