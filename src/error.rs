// src/error.rs
//! Error taxonomy for the RPL engine.
//!
//! Errors fall into two groups:
//! - fatal: protocol violations, broken table/socket invariants and an
//!   exhausted loop budget; these halt the protocol instance
//! - recoverable: transport hiccups, which are logged and retried through the
//!   normal Trickle/DAO machinery
//!
//! Cross-DODAG mismatches are not errors at all; the engine drops them with a
//! debug log.

use std::io;
use std::net::Ipv6Addr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RplError {
    #[error("not an RPL control message: icmpv6 type {0}")]
    NotRpl(u8),

    #[error("unrecognized RPL control message code {0}")]
    UnknownCode(u8),

    #[error("truncated {what}: expected at least {expected} bytes, got {got}")]
    Truncated {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("malformed option type {option_type}: {reason}")]
    MalformedOption { option_type: u8, reason: String },

    #[error("no socket bound for interface {0:?}")]
    MissingSocket(Option<u32>),

    #[error("failed to bind {binding}: {source}")]
    Bind {
        binding: String,
        #[source]
        source: io::Error,
    },

    #[error("no routing entry for {0}")]
    RouteNotFound(Ipv6Addr),

    #[error("rank error budget exhausted after {0} loop detections")]
    LoopBudgetExhausted(u8),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("protocol instance halted")]
    Halted,
}

impl RplError {
    /// Whether this error terminates the protocol instance.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RplError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, RplError>;
