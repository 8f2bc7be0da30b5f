// src/sim.rs
//! Deterministic in-memory network for driving several RPL nodes.
//!
//! Each node gets one interface (index 1) with a link-local address
//! `fe80::N` and a global address `2001:1::N/64`, where `N` is its creation
//! order starting at 1. Links are symmetric and explicit: multicast reaches
//! every linked node, unicast reaches the linked node owning the
//! destination, anything else is silently lost.
//!
//! Time only moves when [`NetworkSim::run`] pops events, so runs are fully
//! reproducible for a given set of RNG seeds.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::io;
use std::net::Ipv6Addr;
use std::time::Duration;

use tracing::{trace, warn};

use crate::config::{InterfaceAddress, RplConfig};
use crate::error::Result;
use crate::node::{NodeState, RplNode};
use crate::packet::{CODE_DAO, CODE_DAO_ACK, CODE_DIO, CODE_DIS, ICMPV6_RPL_TYPE, Packet};
use crate::scheduler::{Scheduler, Timer, TimerHandle};
use crate::transport::{Datagram, SocketBinding, SocketId, Transport};

/// Interface index every simulated node uses.
pub const SIM_INTERFACE: u32 = 1;

/// One datagram put on the air.
#[derive(Debug, Clone)]
pub struct SimMessage {
    pub at: Duration,
    /// Index of the sending node.
    pub from: usize,
    pub to: Ipv6Addr,
    pub data: Vec<u8>,
}

impl SimMessage {
    fn code(&self) -> Option<u8> {
        match self.data.as_slice() {
            [ICMPV6_RPL_TYPE, code, ..] => Some(*code),
            _ => None,
        }
    }

    pub fn is_dis(&self) -> bool {
        self.code() == Some(CODE_DIS)
    }

    pub fn is_dio(&self) -> bool {
        self.code() == Some(CODE_DIO)
    }

    pub fn is_dao(&self) -> bool {
        self.code() == Some(CODE_DAO)
    }

    pub fn is_dao_ack(&self) -> bool {
        self.code() == Some(CODE_DAO_ACK)
    }

    pub fn is_multicast(&self) -> bool {
        self.to.is_multicast()
    }

    /// Decode the payload.
    pub fn packet(&self) -> Result<Packet> {
        Packet::from_bytes(&self.data)
    }
}

#[derive(Debug)]
enum Action {
    Timer { handle: TimerHandle, timer: Timer },
    Deliver(Datagram),
}

#[derive(Debug)]
struct Pending {
    at: Duration,
    seq: u64,
    node: usize,
    action: Action,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

#[derive(Debug)]
struct Host {
    link_local: Ipv6Addr,
    global: Ipv6Addr,
    sockets: HashMap<SocketId, SocketBinding>,
}

/// Everything except the engines themselves, so a node can borrow it as
/// its context while being driven.
#[derive(Debug, Default)]
struct Medium {
    now: Duration,
    queue: BinaryHeap<Reverse<Pending>>,
    canceled: HashSet<TimerHandle>,
    next_seq: u64,
    next_handle: u64,
    next_socket: u32,
    link_delay: Duration,
    links: HashSet<(usize, usize)>,
    hosts: Vec<Host>,
    messages: Vec<SimMessage>,
}

impl Medium {
    fn push(&mut self, at: Duration, node: usize, action: Action) {
        self.next_seq += 1;
        self.queue.push(Reverse(Pending {
            at,
            seq: self.next_seq,
            node,
            action,
        }));
    }

    fn linked(&self, a: usize, b: usize) -> bool {
        self.links.contains(&(a.min(b), a.max(b)))
    }

    fn owner_of(&self, address: &Ipv6Addr) -> Option<usize> {
        self.hosts
            .iter()
            .position(|h| &h.link_local == address || &h.global == address)
    }
}

/// Context handed to one node while it runs.
pub struct SimContext<'a> {
    medium: &'a mut Medium,
    node: usize,
}

impl Scheduler for SimContext<'_> {
    fn now(&self) -> Duration {
        self.medium.now
    }

    fn schedule(&mut self, delay: Duration, timer: Timer) -> TimerHandle {
        self.medium.next_handle += 1;
        let handle = TimerHandle(self.medium.next_handle);
        let at = self.medium.now + delay;
        self.medium.push(at, self.node, Action::Timer { handle, timer });
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.medium.canceled.insert(handle);
    }
}

impl Transport for SimContext<'_> {
    fn bind(&mut self, binding: SocketBinding) -> io::Result<SocketId> {
        self.medium.next_socket += 1;
        let id = SocketId(self.medium.next_socket);
        let host = self
            .medium
            .hosts
            .get_mut(self.node)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such host"))?;
        host.sockets.insert(id, binding);
        Ok(id)
    }

    fn send_to(&mut self, socket: SocketId, payload: &[u8], destination: Ipv6Addr, port: u16) -> io::Result<usize> {
        let medium = &mut *self.medium;
        let host = &medium.hosts[self.node];
        let (source, source_port) = match host.sockets.get(&socket) {
            Some(SocketBinding::Unicast { address, port, .. }) => (*address, *port),
            Some(SocketBinding::Multicast { port, .. }) => (host.link_local, *port),
            None => return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed")),
        };

        medium.messages.push(SimMessage {
            at: medium.now,
            from: self.node,
            to: destination,
            data: payload.to_vec(),
        });

        let receivers: Vec<usize> = if destination.is_multicast() {
            (0..medium.hosts.len())
                .filter(|&peer| peer != self.node && medium.linked(self.node, peer))
                .collect()
        } else {
            medium
                .owner_of(&destination)
                .filter(|&peer| peer != self.node && medium.linked(self.node, peer))
                .into_iter()
                .collect()
        };
        if receivers.is_empty() && !destination.is_multicast() {
            trace!("node {}: {} unreachable, datagram lost", self.node, destination);
        }

        let at = medium.now + medium.link_delay;
        for peer in receivers {
            let datagram = Datagram {
                payload: payload.to_vec(),
                source,
                source_port,
                interface: SIM_INTERFACE,
            };
            trace!("node {} -> node {} port {}", self.node, peer, port);
            medium.push(at, peer, Action::Deliver(datagram));
        }
        Ok(payload.len())
    }

    fn close(&mut self, socket: SocketId) {
        if let Some(host) = self.medium.hosts.get_mut(self.node) {
            host.sockets.remove(&socket);
        }
    }
}

/// A simulated network of RPL nodes.
#[derive(Default)]
pub struct NetworkSim {
    nodes: Vec<RplNode>,
    medium: Medium,
}

impl NetworkSim {
    /// Create an empty network with a 1 ms link delay.
    pub fn new() -> Self {
        let mut sim = NetworkSim::default();
        sim.medium.link_delay = Duration::from_millis(1);
        sim
    }

    pub fn link_delay(mut self, delay: Duration) -> Self {
        self.medium.link_delay = delay;
        self
    }

    /// Create a node and return its index.
    pub fn create_node(&mut self, config: RplConfig) -> Result<usize> {
        let index = self.nodes.len();
        let n = u16::try_from(index + 1).unwrap_or(u16::MAX);
        let link_local = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, n);
        let global = Ipv6Addr::new(0x2001, 1, 0, 0, 0, 0, 0, n);

        let config = match config.rng_seed {
            Some(_) => config,
            None => config.rng_seed(index as u64 + 1),
        };
        let node = RplNode::new(
            config,
            vec![
                InterfaceAddress::new(SIM_INTERFACE, link_local, 64),
                InterfaceAddress::new(SIM_INTERFACE, global, 64),
            ],
        )?;

        self.nodes.push(node);
        self.medium.hosts.push(Host {
            link_local,
            global,
            sockets: HashMap::new(),
        });
        Ok(index)
    }

    pub fn link(&mut self, a: usize, b: usize) {
        if a != b {
            self.medium.links.insert((a.min(b), a.max(b)));
        }
    }

    pub fn unlink(&mut self, a: usize, b: usize) {
        self.medium.links.remove(&(a.min(b), a.max(b)));
    }

    /// Link nodes `0..n` in a chain.
    pub fn chain(&mut self) {
        for i in 1..self.nodes.len() {
            self.link(i - 1, i);
        }
    }

    /// Start every node that has not been started yet.
    pub fn start(&mut self) {
        for index in 0..self.nodes.len() {
            if self.nodes[index].state() == NodeState::Unattached {
                self.with_node(index, |node, ctx| node.start(ctx));
            }
        }
    }

    /// Run `f` against node `index` with its context. A fatal error leaves
    /// the node halted; it is logged and otherwise ignored.
    pub fn with_node<F>(&mut self, index: usize, f: F)
    where
        F: FnOnce(&mut RplNode, &mut SimContext<'_>) -> Result<()>,
    {
        let Some(node) = self.nodes.get_mut(index) else {
            return;
        };
        let mut ctx = SimContext {
            medium: &mut self.medium,
            node: index,
        };
        if let Err(err) = f(node, &mut ctx) {
            warn!("node {}: {}", index, err);
        }
    }

    /// Deliver a hand-made datagram to node `index` at the current time.
    pub fn inject(&mut self, index: usize, datagram: Datagram) {
        let at = self.medium.now;
        self.medium.push(at, index, Action::Deliver(datagram));
    }

    /// Process every event up to `now + duration`.
    pub fn run(&mut self, duration: Duration) {
        let deadline = self.medium.now + duration;
        loop {
            let due = self
                .medium
                .queue
                .peek()
                .is_some_and(|Reverse(p)| p.at <= deadline);
            if !due {
                break;
            }
            let Some(Reverse(pending)) = self.medium.queue.pop() else {
                break;
            };
            self.medium.now = pending.at;
            self.dispatch(pending);
        }
        self.medium.now = deadline;
    }

    fn dispatch(&mut self, pending: Pending) {
        let index = pending.node;
        if self
            .nodes
            .get(index)
            .is_none_or(|n| n.state() == NodeState::Halted)
        {
            return;
        }
        match pending.action {
            Action::Timer { handle, timer } => {
                if self.medium.canceled.remove(&handle) {
                    return;
                }
                self.with_node(index, |node, ctx| node.on_timer(ctx, handle, timer));
            }
            Action::Deliver(datagram) => {
                self.with_node(index, |node, ctx| node.receive(ctx, &datagram));
            }
        }
    }

    pub fn now(&self) -> Duration {
        self.medium.now
    }

    pub fn node(&self, index: usize) -> &RplNode {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut RplNode {
        &mut self.nodes[index]
    }

    pub fn nodes(&self) -> &[RplNode] {
        &self.nodes
    }

    pub fn link_local(&self, index: usize) -> Ipv6Addr {
        self.medium.hosts[index].link_local
    }

    pub fn global(&self, index: usize) -> Ipv6Addr {
        self.medium.hosts[index].global
    }

    /// Every datagram sent so far.
    pub fn msgs(&self) -> &[SimMessage] {
        &self.medium.messages
    }

    pub fn clear_msgs(&mut self) {
        self.medium.messages.clear();
    }

    /// Open sockets on node `index`.
    pub fn open_sockets(&self, index: usize) -> usize {
        self.medium.hosts[index].sockets.len()
    }
}
