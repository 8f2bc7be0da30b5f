// src/routing.rs
//! Routing table and DODAG session state for an RPL node.
//!
//! The table is a flat `Vec` of entries looked up by exact destination
//! match; the first match wins. It also owns the node's DODAG session
//! parameters, which are reset together with the entries on clear.

use std::net::Ipv6Addr;
use std::time::Duration;

use crate::error::{Result, RplError};
use crate::packet::DEFAULT_RPL_INSTANCE;

/// Per-node DODAG membership parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DodagSession {
    pub instance_id: u8,
    pub dodag_id: Ipv6Addr,
    pub version: u8,
    pub rank: u16,
    pub objective_code_point: u16,
    pub dtsn: u8,
    pub grounded: bool,
    pub is_router: bool,
    pub metric: u8,
}

impl Default for DodagSession {
    fn default() -> Self {
        DodagSession {
            instance_id: DEFAULT_RPL_INSTANCE,
            dodag_id: Ipv6Addr::UNSPECIFIED,
            version: 0,
            rank: 0,
            objective_code_point: 0,
            dtsn: 0,
            grounded: true,
            is_router: true,
            metric: 0,
        }
    }
}

impl DodagSession {
    /// A session is fixed once a DODAG id has been adopted.
    pub fn is_set(&self) -> bool {
        !self.dodag_id.is_unspecified()
    }
}

/// How an entry came to be in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOrigin {
    /// Address owned by this node.
    Local,
    /// Learned from a DAO.
    Dao,
    /// One-hop neighbor heard via DIS or DIO.
    Neighbor,
}

/// One routing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEntry {
    pub destination: Ipv6Addr,
    /// `None` for on-link destinations.
    pub next_hop: Option<Ipv6Addr>,
    pub interface: u32,
    pub origin: RouteOrigin,
    /// UDP port of the neighbor, for neighbor routes.
    pub sender_port: Option<u16>,
    pub path_sequence: u8,
    pub dao_sequence: u8,
    /// Remaining lifetime in lifetime units, as advertised.
    pub dao_lifetime: u8,
    pub path_control: u8,
    pub retry_counter: u8,
    /// Absolute expiry for DAO routes.
    pub expires_at: Option<Duration>,
}

impl RoutingEntry {
    fn new(destination: Ipv6Addr, next_hop: Option<Ipv6Addr>, interface: u32, origin: RouteOrigin) -> Self {
        RoutingEntry {
            destination,
            next_hop,
            interface,
            origin,
            sender_port: None,
            path_sequence: 0,
            dao_sequence: 0,
            dao_lifetime: 0,
            path_control: 0,
            retry_counter: 0,
            expires_at: None,
        }
    }

    /// Return a short human-ish description string for debugging/logging.
    pub fn summary(&self) -> String {
        match self.next_hop {
            Some(hop) => format!(
                "{} via {} iface={} ({:?})",
                self.destination, hop, self.interface, self.origin
            ),
            None => format!(
                "{} on-link iface={} ({:?})",
                self.destination, self.interface, self.origin
            ),
        }
    }
}

/// DAO bookkeeping attached to a DAO-derived route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DaoInfo {
    pub path_sequence: u8,
    pub dao_sequence: u8,
    pub lifetime: u8,
    pub path_control: u8,
    pub expires_at: Option<Duration>,
}

/// Result of a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub destination: Ipv6Addr,
    /// Unspecified for on-link destinations.
    pub gateway: Ipv6Addr,
    pub interface: u32,
}

#[derive(Debug, Default)]
pub struct RoutingTable {
    pub session: DodagSession,
    entries: Vec<RoutingEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        RoutingTable::default()
    }

    pub fn all(&self) -> &[RoutingEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, destination: &Ipv6Addr) -> Option<&RoutingEntry> {
        self.entries.iter().find(|e| &e.destination == destination)
    }

    pub fn find_mut(&mut self, destination: &Ipv6Addr) -> Option<&mut RoutingEntry> {
        self.entries.iter_mut().find(|e| &e.destination == destination)
    }

    /// Resolve a destination.
    ///
    /// Multicast destinations are sent straight out of the hinted interface;
    /// without a hint there is no route. Unicast destinations use the first
    /// exact match.
    pub fn lookup(&self, destination: &Ipv6Addr, interface_hint: Option<u32>) -> Option<Route> {
        if destination.is_multicast() {
            return interface_hint.map(|interface| Route {
                destination: *destination,
                gateway: Ipv6Addr::UNSPECIFIED,
                interface,
            });
        }
        self.find(destination).map(|e| Route {
            destination: e.destination,
            gateway: e.next_hop.unwrap_or(Ipv6Addr::UNSPECIFIED),
            interface: e.interface,
        })
    }

    /// Route to an address owned by this node.
    pub fn add_local_route(&mut self, address: Ipv6Addr, interface: u32) {
        self.entries
            .push(RoutingEntry::new(address, None, interface, RouteOrigin::Local));
    }

    /// Route to a DAO target through `next_hop`.
    pub fn add_dao_route(&mut self, destination: Ipv6Addr, interface: u32, next_hop: Ipv6Addr, info: DaoInfo) {
        let mut entry = RoutingEntry::new(destination, Some(next_hop), interface, RouteOrigin::Dao);
        entry.path_sequence = info.path_sequence;
        entry.dao_sequence = info.dao_sequence;
        entry.dao_lifetime = info.lifetime;
        entry.path_control = info.path_control;
        entry.expires_at = info.expires_at;
        self.entries.push(entry);
    }

    /// Route to a one-hop neighbor that reached us from `port`.
    pub fn add_neighbor_route(&mut self, neighbor: Ipv6Addr, interface: u32, port: u16) {
        let mut entry = RoutingEntry::new(neighbor, Some(neighbor), interface, RouteOrigin::Neighbor);
        entry.sender_port = Some(port);
        self.entries.push(entry);
    }

    /// Remove the entry for `destination`. A missing entry means the caller's
    /// view of the table is wrong.
    pub fn delete_route(&mut self, destination: &Ipv6Addr) -> Result<RoutingEntry> {
        let idx = self
            .entries
            .iter()
            .position(|e| &e.destination == destination)
            .ok_or(RplError::RouteNotFound(*destination))?;
        Ok(self.entries.remove(idx))
    }

    /// Drop every entry bound to `interface`. Returns the removed entries.
    pub fn invalidate_route(&mut self, interface: u32) -> Vec<RoutingEntry> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.interface == interface);
        self.entries = kept;
        removed
    }

    /// Drop DAO routes whose lifetime has run out.
    pub fn purge_expired(&mut self, now: Duration) -> Vec<RoutingEntry> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.expires_at.is_some_and(|t| t <= now));
        self.entries = kept;
        removed
    }

    /// Empty the table and reset the session to defaults.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.session = DodagSession::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    #[test]
    fn lookup_first_exact_match() {
        let mut table = RoutingTable::new();
        table.add_dao_route(a("2001:1::3"), 1, a("fe80::2"), DaoInfo::default());
        table.add_dao_route(a("2001:1::3"), 2, a("fe80::9"), DaoInfo::default());

        let route = table.lookup(&a("2001:1::3"), None).unwrap();
        assert_eq!(route.gateway, a("fe80::2"));
        assert_eq!(route.interface, 1);
        assert!(table.lookup(&a("2001:1::4"), None).is_none());
    }

    #[test]
    fn multicast_lookup_uses_hint() {
        let table = RoutingTable::new();
        let group = a("ff02::1a");
        let route = table.lookup(&group, Some(3)).unwrap();
        assert_eq!(route.interface, 3);
        assert!(route.gateway.is_unspecified());
        assert!(table.lookup(&group, None).is_none());
    }

    #[test]
    fn local_and_neighbor_routes() {
        let mut table = RoutingTable::new();
        table.add_local_route(a("2001:1::2"), 1);
        table.add_neighbor_route(a("fe80::1"), 1, 521);

        assert!(table.lookup(&a("2001:1::2"), None).unwrap().gateway.is_unspecified());
        let entry = table.find(&a("fe80::1")).unwrap();
        assert_eq!(entry.origin, RouteOrigin::Neighbor);
        assert_eq!(entry.sender_port, Some(521));
    }

    #[test]
    fn delete_missing_route_is_error() {
        let mut table = RoutingTable::new();
        table.add_local_route(a("2001:1::2"), 1);
        assert!(table.delete_route(&a("2001:1::2")).is_ok());
        assert!(matches!(
            table.delete_route(&a("2001:1::2")),
            Err(RplError::RouteNotFound(_))
        ));
    }

    #[test]
    fn invalidate_drops_only_that_interface() {
        let mut table = RoutingTable::new();
        table.add_local_route(a("2001:1::2"), 1);
        table.add_neighbor_route(a("fe80::1"), 2, 521);
        table.add_dao_route(a("2001:1::5"), 2, a("fe80::1"), DaoInfo::default());

        let removed = table.invalidate_route(2);
        assert_eq!(removed.len(), 2);
        assert_eq!(table.all().len(), 1);
        assert_eq!(table.all()[0].interface, 1);
    }

    #[test]
    fn purge_removes_expired_dao_routes() {
        let mut table = RoutingTable::new();
        let info = |secs| DaoInfo {
            expires_at: Some(Duration::from_secs(secs)),
            ..Default::default()
        };
        table.add_local_route(a("2001:1::1"), 1);
        table.add_dao_route(a("2001:1::5"), 1, a("fe80::5"), info(10));
        table.add_dao_route(a("2001:1::6"), 1, a("fe80::6"), info(100));

        let removed = table.purge_expired(Duration::from_secs(10));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].destination, a("2001:1::5"));
        assert_eq!(table.all().len(), 2);
    }

    #[test]
    fn clear_twice_leaves_defaults() {
        let mut table = RoutingTable::new();
        table.session.instance_id = 30;
        table.session.rank = 769;
        table.session.version = 2;
        table.session.dtsn = 5;
        table.session.dodag_id = a("2002:1::");
        table.add_local_route(a("2001:1::2"), 1);

        table.clear();
        table.clear();

        assert!(table.is_empty());
        assert_eq!(table.session, DodagSession::default());
        assert_eq!(table.session.instance_id, 0);
        assert_eq!(table.session.rank, 0);
        assert_eq!(table.session.version, 0);
        assert_eq!(table.session.dtsn, 0);
        assert!(!table.session.is_set());
    }
}
