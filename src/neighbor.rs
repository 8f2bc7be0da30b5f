// src/neighbor.rs
//! Neighbor tracking for an RPL node.
//!
//! This module handles:
//! - Recording every node heard via DIO (address, DODAG, DTSN, rank, interface)
//! - Keeping the set ordered by ascending rank
//! - Preferred parent selection
//!
//! The preferred parent is stored as an address key into the set, so removing
//! a neighbor can never leave a dangling parent.

use std::net::Ipv6Addr;

/// Role a neighbor plays relative to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NeighborKind {
    /// Member of another DODAG.
    DifferentDodag,
    /// Same DODAG, rank not lower than ours.
    #[default]
    SubDodag,
    /// Eligible parent, not preferred.
    DodagParent,
    /// Selected preferred parent.
    PreferredParent,
}

/// Representation of an RPL neighbor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    /// Link-local source address of the neighbor's DIOs.
    pub address: Ipv6Addr,
    pub dodag_id: Ipv6Addr,
    pub dtsn: u8,
    pub rank: u16,
    /// Local interface index on which this neighbor was heard.
    pub interface: u32,
    pub kind: NeighborKind,
    pub reachable: bool,
}

impl Neighbor {
    pub fn new(address: Ipv6Addr, dodag_id: Ipv6Addr, dtsn: u8, rank: u16, interface: u32) -> Self {
        Neighbor {
            address,
            dodag_id,
            dtsn,
            rank,
            interface,
            kind: NeighborKind::default(),
            reachable: true,
        }
    }
}

/// Rank-ordered set of neighbors with an optional preferred parent.
#[derive(Debug, Default)]
pub struct NeighborSet {
    neighbors: Vec<Neighbor>,
    preferred: Option<Ipv6Addr>,
}

impl NeighborSet {
    pub fn new() -> Self {
        NeighborSet::default()
    }

    /// Neighbors in ascending rank order.
    pub fn all(&self) -> impl Iterator<Item = &Neighbor> {
        self.neighbors.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    /// Insert a neighbor, then re-sort by rank. Equal ranks keep insertion
    /// order.
    pub fn add(&mut self, neighbor: Neighbor) {
        self.neighbors.push(neighbor);
        self.neighbors.sort_by_key(|n| n.rank);
    }

    pub fn find(&self, address: &Ipv6Addr) -> Option<&Neighbor> {
        self.neighbors.iter().find(|n| &n.address == address)
    }

    /// Remove a neighbor. Clears the preferred parent if it was this one.
    pub fn delete(&mut self, address: &Ipv6Addr) -> Option<Neighbor> {
        let idx = self.neighbors.iter().position(|n| &n.address == address)?;
        if self.preferred.as_ref() == Some(address) {
            self.preferred = None;
        }
        Some(self.neighbors.remove(idx))
    }

    /// Refresh a neighbor from a new DIO. No-op if the address is unknown.
    ///
    /// Returns true when the change can affect parent selection: the rank
    /// moved or the neighbor became reachable again.
    pub fn update(
        &mut self,
        address: &Ipv6Addr,
        dodag_id: Ipv6Addr,
        dtsn: u8,
        rank: u16,
        interface: u32,
    ) -> bool {
        let Some(n) = self.neighbors.iter_mut().find(|n| &n.address == address) else {
            return false;
        };
        let rank_changed = n.rank != rank;
        let revived = !n.reachable;
        n.dodag_id = dodag_id;
        n.dtsn = dtsn;
        n.rank = rank;
        n.interface = interface;
        n.reachable = true;
        if rank_changed {
            self.neighbors.sort_by_key(|n| n.rank);
        }
        rank_changed || revived
    }

    /// Mark every neighbor heard on `interface` unreachable. Returns how many
    /// changed.
    pub fn mark_interface_unreachable(&mut self, interface: u32) -> usize {
        let mut changed = 0;
        for n in self.neighbors.iter_mut().filter(|n| n.interface == interface) {
            if n.reachable {
                n.reachable = false;
                changed += 1;
            }
        }
        changed
    }

    /// Choose the first reachable neighbor, in rank order, whose rank is
    /// strictly below `own_rank`. Clears the preferred parent when none
    /// qualifies.
    pub fn select_parent(&mut self, own_rank: u16) -> Option<&Neighbor> {
        self.preferred = None;
        for n in self.neighbors.iter_mut() {
            if n.kind == NeighborKind::DifferentDodag {
                continue;
            }
            let eligible = n.reachable && n.rank < own_rank;
            n.kind = match (eligible, self.preferred.is_some()) {
                (true, false) => {
                    self.preferred = Some(n.address);
                    NeighborKind::PreferredParent
                }
                (true, true) => NeighborKind::DodagParent,
                (false, _) => NeighborKind::SubDodag,
            };
        }
        self.preferred_parent()
    }

    pub fn preferred_parent(&self) -> Option<&Neighbor> {
        let address = self.preferred?;
        self.find(&address)
    }

    /// Empty the set and drop the preferred parent.
    pub fn clear(&mut self) {
        self.neighbors.clear();
        self.preferred = None;
    }
}
