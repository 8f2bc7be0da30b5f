// src/event.rs
//! High-level events emitted by an RPL node.
//!
//! Applications drain these to react to DODAG membership and route changes
//! without diffing internal state.

use std::net::Ipv6Addr;

use crate::routing::RoutingEntry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Joined (or rebuilt membership in) a DODAG.
    Joined {
        dodag_id: Ipv6Addr,
        version: u8,
        rank: u16,
    },

    /// The preferred parent changed; `None` means no parent is left.
    ParentChanged(Option<Ipv6Addr>),

    RouteAdded(RoutingEntry),

    RouteRemoved(RoutingEntry),

    /// A new DODAG version was adopted (or, at the root, issued).
    GlobalRepair { version: u8 },

    DaoAcknowledged { sequence: u8 },

    /// No DAO-ACK after every retry; the node is rejoining.
    DaoRetriesExhausted,

    /// A DAO or DAO-ACK broke rank ordering.
    RankError { sender: Ipv6Addr, sender_rank: u16 },

    /// Too many rank errors; the instance stops.
    LoopBudgetExhausted { errors: u8 },

    /// Poison sent; waiting out the hold-down before rebooting.
    Disjoined,

    Rebooted { as_root: bool },

    /// A fatal error terminated the instance.
    Halted { reason: String },
}
