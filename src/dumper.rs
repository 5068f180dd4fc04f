//! Synchronous binary snapshot writer: every write retries on
//! `EINTR`/`EAGAIN` rather than surfacing a partial write, and a fully
//! written dump returns `Ok(())` explicitly.

use std::fs::OpenOptions;
use std::io::{self, Write};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::dipmap::{DipHistoryMap, PlainDipMap};
use crate::error::DumpError;

/// Writes `buf` in full, retrying on `Interrupted`/`WouldBlock` rather than
/// propagating them, matching `writeAll`'s `EINTR`/`EAGAIN`/`EWOULDBLOCK`
/// retry loop. A `write` returning `Ok(0)` on a non-empty buffer is treated
/// as a short write rather than looped on forever.
fn write_all_retrying<W: Write>(w: &mut W, buf: &[u8]) -> Result<(), DumpError> {
    let mut written = 0;
    while written < buf.len() {
        match w.write(&buf[written..]) {
            Ok(0) => {
                return Err(DumpError::ShortWrite {
                    wrote: written,
                    expected: buf.len(),
                })
            }
            Ok(n) => written += n,
            Err(e)
                if e.kind() == io::ErrorKind::Interrupted
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                continue
            }
            Err(e) => return Err(DumpError::Io(e)),
        }
    }
    Ok(())
}

fn write_u32<W: Write>(w: &mut W, value: u32) -> Result<(), DumpError> {
    write_all_retrying(w, &value.to_ne_bytes())
}

/// Dumps a [`DipHistoryMap`]: a `u32` entry count followed by each entry's
/// `{current, prev, timestamp}` written field by field, in host byte order.
pub fn dump_dip_history_map<W: Write>(map: &DipHistoryMap, w: &mut W) -> Result<(), DumpError> {
    write_u32(w, map.size() as u32)?;
    for i in 0..map.size() {
        let entry = map.get(i);
        write_u32(w, entry.current)?;
        write_u32(w, entry.prev)?;
        write_u32(w, entry.timestamp)?;
    }
    Ok(())
}

/// Dumps a [`PlainDipMap`]: a `u32` entry count followed by each slot's DIP.
pub fn dump_plain_dip_map<W: Write>(map: &PlainDipMap, w: &mut W) -> Result<(), DumpError> {
    write_u32(w, map.size() as u32)?;
    for port in 0..map.size() {
        write_u32(w, map.get(port as u16))?;
    }
    Ok(())
}

/// Dumps a replicated map preceded by its generation counter, matching the
/// `ZKClient<T>` specialization: `{ gen: u32, <map dump> }`.
pub fn dump_with_gen<W: Write>(
    gen: u32,
    w: &mut W,
    dump_map: impl FnOnce(&mut W) -> Result<(), DumpError>,
) -> Result<(), DumpError> {
    write_u32(w, gen)?;
    dump_map(w)
}

/// Opens `path` for writing (truncating, creating with mode 0600 on unix)
/// and performs `body` against the open file, matching the
/// `dump(T*, filename)` overload that opens, dumps, and closes.
pub fn dump_to_path(
    path: &Path,
    body: impl FnOnce(&mut std::fs::File) -> Result<(), DumpError>,
) -> Result<(), DumpError> {
    let mut options = OpenOptions::new();
    options.write(true).truncate(true).create(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path)?;
    body(&mut file)
}
