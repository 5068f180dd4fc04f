//! Configuration parsing and the operator-command tokenizer (an iterative
//! scanner, not a recursive one).
//!
//! A small typed reader that accumulates [`ConfigError`]s tagged with the
//! offending key, rather than a general-purpose CLI/env parser — the glue
//! that feeds operator commands into this crate is an external
//! collaborator.

use crate::error::ConfigError;

pub const RING_SIZE_MIN: i64 = 0;
pub const RING_SIZE_MAX: i64 = 0x0080_0000;
pub const RING_SIZE_DEFAULT: u32 = 1;

/// Recognized element options.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Coordination-service connect string. Empty disables replication —
    /// the Mux then runs entirely off a locally-sized, never-updated ring.
    pub zk: String,
    /// Local ring size when `zk` is empty; ignored once a coordination
    /// service supplies `/beamer/config/ring_size`.
    pub ring_size: u32,
    /// Total state-table capacity across all CPUs. Only read by the
    /// stateful Mux; `None` for the stateless variant.
    pub max_states: Option<u32>,
}

impl MuxConfig {
    /// Parses `pairs` (already-tokenized `key=value` element arguments) into
    /// a validated [`MuxConfig`]. `stateful` selects whether `MAX_STATES` is
    /// mandatory (stateful Mux) or simply ignored if present (stateless).
    pub fn from_pairs<'a, I>(pairs: I, stateful: bool) -> Result<MuxConfig, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut zk = String::new();
        let mut ring_size = RING_SIZE_DEFAULT;
        let mut max_states: Option<u32> = None;

        for (key, value) in pairs {
            match key {
                "ZK" => zk = value.to_string(),
                "RING_SIZE" => {
                    let parsed: i64 = value
                        .parse()
                        .map_err(|_| ConfigError::BadValue {
                            key: "RING_SIZE",
                            value: value.to_string(),
                        })?;
                    if parsed < RING_SIZE_MIN || parsed > RING_SIZE_MAX {
                        return Err(ConfigError::OutOfRange {
                            key: "RING_SIZE",
                            min: RING_SIZE_MIN,
                            max: RING_SIZE_MAX,
                            value: parsed,
                        });
                    }
                    ring_size = parsed as u32;
                }
                "MAX_STATES" => {
                    let parsed: u32 = value.parse().map_err(|_| ConfigError::BadValue {
                        key: "MAX_STATES",
                        value: value.to_string(),
                    })?;
                    max_states = Some(parsed);
                }
                other => {
                    log::warn!("ignoring unrecognized option {}", other);
                }
            }
        }

        if stateful {
            match max_states {
                Some(0) | None => return Err(ConfigError::Missing("MAX_STATES")),
                Some(_) => {}
            }
        }

        Ok(MuxConfig {
            zk,
            ring_size,
            max_states,
        })
    }

    pub fn replication_enabled(&self) -> bool {
        !self.zk.is_empty()
    }
}

/// Splits an operator `assign` command into whitespace-delimited tokens.
/// A single iterative pass rather than a recursive descent, so a
/// pathological input can't exhaust the stack.
pub fn tokenize(input: &str) -> Vec<&str> {
    input.split_whitespace().collect()
}
