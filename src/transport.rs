// src/transport.rs
//! Datagram transport seam and the engine's socket bookkeeping.
//!
//! The engine does not touch the network directly. It binds logical
//! sockets through a [`Transport`] when it attaches to interfaces, sends
//! encoded packets through them, and closes them on dispose. Inbound traffic
//! arrives as [`Datagram`]s passed to `RplNode::receive`.

use std::collections::BTreeMap;
use std::io;
use std::net::Ipv6Addr;

use crate::error::{Result, RplError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u32);

/// What a socket is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketBinding {
    /// Egress/ingress socket on one interface address.
    Unicast {
        address: Ipv6Addr,
        port: u16,
        interface: u32,
    },
    /// Shared listener joined to a multicast group on every interface.
    Multicast { group: Ipv6Addr, port: u16 },
}

/// One received datagram.
///
/// The transport fills in the sender and the local interface it arrived on,
/// and never delivers a node's own multicast back to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub source: Ipv6Addr,
    pub source_port: u16,
    pub interface: u32,
}

pub trait Transport {
    fn bind(&mut self, binding: SocketBinding) -> io::Result<SocketId>;

    fn send_to(
        &mut self,
        socket: SocketId,
        payload: &[u8],
        destination: Ipv6Addr,
        port: u16,
    ) -> io::Result<usize>;

    fn close(&mut self, socket: SocketId);
}

/// Sockets owned by one engine: one per interface plus the shared listener.
#[derive(Debug, Default)]
pub struct SocketMap {
    per_interface: BTreeMap<u32, SocketId>,
    shared: Option<SocketId>,
}

impl SocketMap {
    pub fn new() -> Self {
        SocketMap::default()
    }

    pub fn insert_interface(&mut self, interface: u32, socket: SocketId) -> Option<SocketId> {
        self.per_interface.insert(interface, socket)
    }

    pub fn remove_interface(&mut self, interface: u32) -> Option<SocketId> {
        self.per_interface.remove(&interface)
    }

    pub fn has_interface(&self, interface: u32) -> bool {
        self.per_interface.contains_key(&interface)
    }

    pub fn set_shared(&mut self, socket: SocketId) -> Option<SocketId> {
        self.shared.replace(socket)
    }

    /// Socket to send from.
    ///
    /// With an interface the socket bound there is used; without one (plain
    /// multicast) the lowest-numbered interface socket is. Either way the
    /// shared socket is the fallback.
    pub fn egress(&self, interface: Option<u32>) -> Result<SocketId> {
        let bound = match interface {
            Some(iface) => self.per_interface.get(&iface).copied(),
            None => self.per_interface.values().next().copied(),
        };
        bound
            .or(self.shared)
            .ok_or(RplError::MissingSocket(interface))
    }

    /// Take every socket out of the map, interface sockets first.
    pub fn drain(&mut self) -> Vec<SocketId> {
        let mut all: Vec<SocketId> = std::mem::take(&mut self.per_interface)
            .into_values()
            .collect();
        all.extend(self.shared.take());
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn egress_prefers_matching_interface() {
        let mut map = SocketMap::new();
        map.set_shared(SocketId(1));
        map.insert_interface(2, SocketId(20));
        map.insert_interface(3, SocketId(30));

        assert_eq!(map.egress(Some(3)).unwrap(), SocketId(30));
        assert_eq!(map.egress(None).unwrap(), SocketId(20));
        assert_eq!(map.egress(Some(9)).unwrap(), SocketId(1));
    }

    #[test]
    fn missing_socket_is_an_error() {
        let map = SocketMap::new();
        assert!(matches!(
            map.egress(Some(4)),
            Err(RplError::MissingSocket(Some(4)))
        ));
    }

    #[test]
    fn drain_empties_the_map() {
        let mut map = SocketMap::new();
        map.set_shared(SocketId(1));
        map.insert_interface(2, SocketId(20));

        assert_eq!(map.drain(), vec![SocketId(20), SocketId(1)]);
        assert!(map.egress(None).is_err());
        assert!(map.drain().is_empty());
    }
}
