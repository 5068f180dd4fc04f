//! Error types shared across the crate.

use std::io;
use thiserror::Error;

/// Returned from [`crate::config::MuxConfig::from_pairs`] on malformed or
/// out-of-range configuration. The element that produced this error is never
/// started.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing mandatory option {0}")]
    Missing(&'static str),

    #[error("option {key} out of range [{min}, {max}]: got {value}")]
    OutOfRange {
        key: &'static str,
        min: i64,
        max: i64,
        value: i64,
    },

    #[error("bad value for option {key}: {value}")]
    BadValue { key: &'static str, value: String },
}

/// Returned by the encapsulators when a packet cannot be grown or is too
/// short to carry the header it claims to. The dispatcher's response to
/// either variant is the same: drop the packet, no exception unwind.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum PacketError {
    #[error("insufficient tailroom to grow packet by {needed} bytes")]
    InsufficientTailroom { needed: usize },

    #[error("packet too short to contain a valid header")]
    Malformed,
}

/// Returned by [`crate::dumper::dump_to_path`] on a short write or I/O
/// failure; the operator sees this surfaced as a numeric errno.
#[derive(Debug, Error)]
pub enum DumpError {
    #[error("dump I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("short write: wrote {wrote} of {expected} bytes")]
    ShortWrite { wrote: usize, expected: usize },
}

/// Returned when applying a malformed `assign` operator command.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum HandlerError {
    #[error("expected 2+ whitespace-delimited tokens, got {0}")]
    TooFewTokens(usize),

    #[error("bad DIP literal: {0}")]
    BadDip(String),

    #[error("bad bucket index: {0}")]
    BadBucketIndex(String),

    #[error("unknown operator command: {0}")]
    UnknownCommand(String),
}

/// A coordination-service condition that cannot be recovered from locally:
/// auth failure, bad arguments, marshalling errors, or an invalid session
/// handle. These are fatal — the replicator logs one of these and then
/// panics. This type is deliberately not threaded through a `Result` that
/// implies a caller could recover from it.
#[derive(Debug, Error)]
#[error("fatal coordination-service error: {0}")]
pub struct ReplicatorFatal(pub String);
