//! The operator read/write handlers: `assign` (write), `dump` (write,
//! stateless Mux only), `gen` (read). The CLI/RPC glue that routes a named
//! command string to these functions is an external collaborator; these
//! functions take the already-identified command's argument string.

use std::net::Ipv4Addr;
use std::path::Path;

use crate::config::tokenize;
use crate::dipmap::{DipHistoryMap, DipMap, LogHeader, PlainDipMap};
use crate::dumper;
use crate::error::{DumpError, HandlerError};

/// `assign DIP idx1 idx2 …`: applies `update(idx_i, DIP, {timestamp: now})`
/// to every listed bucket. Local only — never advances `gen` — exists for
/// manual steering and gets reconciled away by the next snapshot.
pub fn handle_assign<M: DipMap>(map: &mut M, input: &str, now_ts: u32) -> Result<(), HandlerError> {
    let tokens = tokenize(input);
    if tokens.len() < 2 {
        return Err(HandlerError::TooFewTokens(tokens.len()));
    }

    let dip_addr: Ipv4Addr = tokens[0]
        .parse()
        .map_err(|_| HandlerError::BadDip(tokens[0].to_string()))?;
    let dip = u32::from_ne_bytes(dip_addr.octets());

    let mut indices = Vec::with_capacity(tokens.len() - 1);
    for tok in &tokens[1..] {
        let idx: usize = tok
            .parse()
            .map_err(|_| HandlerError::BadBucketIndex((*tok).to_string()))?;
        if idx >= map.size() {
            return Err(HandlerError::BadBucketIndex((*tok).to_string()));
        }
        indices.push(idx);
    }

    for idx in indices {
        map.update(idx, dip, LogHeader { timestamp: now_ts });
    }
    Ok(())
}

/// `dump`: writes `hash_dump.raw` and `id_dump.raw` into `dir`, each
/// prefixed with the current replication generation (stateless Mux only).
pub fn handle_dump(
    hash_map: &DipHistoryMap,
    id_map: &PlainDipMap,
    gen: u32,
    dir: &Path,
) -> Result<(), DumpError> {
    dumper::dump_to_path(&dir.join("hash_dump.raw"), |f| {
        dumper::dump_with_gen(gen, f, |f| dumper::dump_dip_history_map(hash_map, f))
    })?;
    dumper::dump_to_path(&dir.join("id_dump.raw"), |f| {
        dumper::dump_with_gen(gen, f, |f| dumper::dump_plain_dip_map(id_map, f))
    })?;
    Ok(())
}

/// `gen`: the current replication generation as a decimal string.
pub fn handle_gen(gen: u32) -> String {
    gen.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_rejects_too_few_tokens() {
        let mut map = DipHistoryMap::init(4);
        let err = handle_assign(&mut map, "10.0.0.1", 1).unwrap_err();
        assert_eq!(err, HandlerError::TooFewTokens(1));
    }

    #[test]
    fn assign_rejects_bad_dip() {
        let mut map = DipHistoryMap::init(4);
        let err = handle_assign(&mut map, "not-an-ip 0", 1).unwrap_err();
        assert_eq!(err, HandlerError::BadDip("not-an-ip".to_string()));
    }

    #[test]
    fn assign_rejects_out_of_range_bucket() {
        let mut map = DipHistoryMap::init(4);
        let err = handle_assign(&mut map, "10.0.0.1 99", 1).unwrap_err();
        assert_eq!(err, HandlerError::BadBucketIndex("99".to_string()));
    }

    #[test]
    fn assign_applies_to_every_listed_bucket() {
        let mut map = DipHistoryMap::init(4);
        handle_assign(&mut map, "10.0.0.1 0 2", 42).unwrap();

        let expected = u32::from_ne_bytes([10, 0, 0, 1]);
        assert_eq!(map.get(0).current, expected);
        assert_eq!(map.get(2).current, expected);
        assert_eq!(map.get(1).current, 0);
    }

    #[test]
    fn gen_handler_formats_decimal() {
        assert_eq!(handle_gen(7), "7");
        assert_eq!(handle_gen(0), "0");
    }

    #[test]
    fn dump_handler_writes_both_files_with_gen_prefix() {
        let dir = std::env::temp_dir().join(format!("beamer-mux-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let hash_map = DipHistoryMap::init(2);
        let id_map = PlainDipMap::init();
        handle_dump(&hash_map, &id_map, 42, &dir).unwrap();

        let hash_bytes = std::fs::read(dir.join("hash_dump.raw")).unwrap();
        assert_eq!(u32::from_ne_bytes(hash_bytes[0..4].try_into().unwrap()), 42);
        let id_bytes = std::fs::read(dir.join("id_dump.raw")).unwrap();
        assert_eq!(u32::from_ne_bytes(id_bytes[0..4].try_into().unwrap()), 42);

        std::fs::remove_dir_all(&dir).ok();
    }
}
