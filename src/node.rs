// src/node.rs
//! High-level RPL node.
//!
//! This wraps Packet + NeighborSet + RoutingTable + TrickleTimer into a
//! protocol engine that joins a DODAG, selects a parent, advertises its
//! address upward with DAOs and keeps the tables consistent through repairs.
//!
//! The engine never blocks and owns no clock or socket. Everything arrives
//! through three doors:
//! - [`RplNode::receive`] for every inbound datagram
//! - [`RplNode::on_timer`] for every callback the scheduler fires
//! - the interface lifecycle calls (`interface_up`, `add_address`,
//!   `interface_down`, `dispose`)
//!
//! Each call runs to completion against a [`Context`] that provides time,
//! timers and sockets.

use std::net::Ipv6Addr;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, error, info, trace, warn};

use crate::config::{InterfaceAddress, RplConfig};
use crate::error::{Result, RplError};
use crate::event::Event;
use crate::neighbor::{Neighbor, NeighborKind, NeighborSet};
use crate::objective::ObjectiveFunction;
use crate::option::RplOption;
use crate::packet::{
    ALL_RPL_NODES, Dao, DaoAck, Dio, INFINITE_RANK, Message, ModeOfOperation, Packet, RPL_PORT,
};
use crate::routing::{DaoInfo, DodagSession, Route, RouteOrigin, RoutingEntry, RoutingTable};
use crate::scheduler::{Scheduler, Timer, TimerHandle, TimerSlot};
use crate::transport::{Datagram, SocketBinding, SocketMap, Transport};
use crate::trickle::TrickleTimer;

/// Transit path lifetime meaning "never expires".
const INFINITE_LIFETIME: u8 = 0xff;

/// DAO-ACK status values from 128 upward reject the DAO.
const DAO_ACK_REJECT: u8 = 128;

/// Everything the engine needs from its host.
pub trait Context: Scheduler + Transport {}

impl<T: Scheduler + Transport> Context for T {}

/// Lifecycle of a protocol instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Created but not started, or disposed.
    Unattached,
    /// Soliciting DIOs.
    Joining,
    /// Member of a DODAG with a rank.
    Attached,
    /// DODAG root.
    Root,
    /// Poison sent; waiting out the hold-down before rebooting.
    Disjoining,
    /// Stopped by a fatal error. Every further call fails.
    Halted,
}

/// A single RPL protocol instance.
pub struct RplNode {
    config: RplConfig,
    addresses: Vec<InterfaceAddress>,
    state: NodeState,

    objective: ObjectiveFunction,
    /// Rank step of the current DODAG, as advertised by its root.
    min_hop_rank_increase: u16,
    mode_of_operation: ModeOfOperation,
    trickle: TrickleTimer,
    rng: StdRng,
    sockets: SocketMap,

    dis_timer: TimerSlot,
    dao_timer: TimerSlot,
    dao_ack_timer: TimerSlot,
    reboot_timer: TimerSlot,

    rank_errors: u8,
    /// Version the root last issued, so a reboot can move past it.
    last_root_version: u8,

    pub neighbors: NeighborSet,
    pub routes: RoutingTable,
    events: Vec<Event>,
}

impl RplNode {
    /// Create a node owning `addresses`. Nothing is bound until [`start`].
    ///
    /// [`start`]: RplNode::start
    pub fn new(config: RplConfig, addresses: Vec<InterfaceAddress>) -> Result<Self> {
        config.validate()?;

        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let trickle = TrickleTimer::new(config.i_min, config.i_max, config.redundancy_constant);

        Ok(RplNode {
            objective: config.objective,
            min_hop_rank_increase: config.min_hop_rank_increase,
            mode_of_operation: config.mode_of_operation,
            last_root_version: config.root.map(|r| r.version).unwrap_or(0),
            config,
            addresses,
            state: NodeState::Unattached,
            trickle,
            rng,
            sockets: SocketMap::new(),
            dis_timer: TimerSlot::default(),
            dao_timer: TimerSlot::default(),
            dao_ack_timer: TimerSlot::default(),
            reboot_timer: TimerSlot::default(),
            rank_errors: 0,
            neighbors: NeighborSet::new(),
            routes: RoutingTable::new(),
            events: Vec::new(),
        })
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn config(&self) -> &RplConfig {
        &self.config
    }

    pub fn session(&self) -> &DodagSession {
        &self.routes.session
    }

    pub fn rank(&self) -> u16 {
        self.routes.session.rank
    }

    pub fn is_root(&self) -> bool {
        self.state == NodeState::Root
    }

    pub fn addresses(&self) -> &[InterfaceAddress] {
        &self.addresses
    }

    /// Immutable view of all known neighbors.
    pub fn neighbors(&self) -> impl Iterator<Item = &Neighbor> {
        self.neighbors.all()
    }

    /// Immutable view of all known routes.
    pub fn routes(&self) -> &[RoutingEntry] {
        self.routes.all()
    }

    pub fn preferred_parent(&self) -> Option<Ipv6Addr> {
        self.neighbors.preferred_parent().map(|p| p.address)
    }

    pub fn trickle(&self) -> &TrickleTimer {
        &self.trickle
    }

    pub fn rank_errors(&self) -> u8 {
        self.rank_errors
    }

    /// Resolve the outgoing route for a packet to `destination`.
    pub fn route_output(&self, destination: &Ipv6Addr, interface_hint: Option<u32>) -> Option<Route> {
        self.routes.lookup(destination, interface_hint)
    }

    /// Take and return all pending events since the last call.
    pub fn drain_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    fn push_event(&mut self, ev: Event) {
        self.events.push(ev);
    }

    //=== Entry points ===

    /// Bind sockets, install local routes and either become root or start
    /// soliciting a DODAG.
    pub fn start<C: Context>(&mut self, ctx: &mut C) -> Result<()> {
        self.ensure_running()?;
        let result = self.attach(ctx);
        self.guard(ctx, result)
    }

    /// Process one inbound datagram.
    pub fn receive<C: Context>(&mut self, ctx: &mut C, datagram: &Datagram) -> Result<()> {
        self.ensure_running()?;
        let result = self.handle_datagram(ctx, datagram);
        self.guard(ctx, result)
    }

    /// Process one scheduler callback. Stale handles are ignored.
    pub fn on_timer<C: Context>(&mut self, ctx: &mut C, handle: TimerHandle, timer: Timer) -> Result<()> {
        self.ensure_running()?;
        let result = self.dispatch_timer(ctx, handle, timer);
        self.guard(ctx, result)
    }

    /// Bring `interface` up with the addresses already known for it.
    pub fn interface_up<C: Context>(&mut self, ctx: &mut C, interface: u32) -> Result<()> {
        self.ensure_running()?;
        let result = self.bring_up(ctx, interface);
        self.guard(ctx, result)
    }

    /// A new address appeared on an interface.
    pub fn add_address<C: Context>(&mut self, ctx: &mut C, address: InterfaceAddress) -> Result<()> {
        self.ensure_running()?;
        if !self.addresses.contains(&address) {
            self.addresses.push(address);
        }
        let result = self.bring_up(ctx, address.interface);
        self.guard(ctx, result)
    }

    /// Drop every route over `interface`, close its socket and reselect the
    /// parent without the neighbors heard there.
    pub fn interface_down<C: Context>(&mut self, ctx: &mut C, interface: u32) -> Result<()> {
        self.ensure_running()?;
        let result = self.take_down(ctx, interface);
        self.guard(ctx, result)
    }

    /// Leave the DODAG: poison, clear, and reboot after the hold-down.
    pub fn disjoin<C: Context>(&mut self, ctx: &mut C) -> Result<()> {
        self.ensure_running()?;
        let result = self.leave_dodag(ctx);
        self.guard(ctx, result)
    }

    /// Root only: issue a new DODAG version so the whole graph rebuilds.
    pub fn trigger_global_repair<C: Context>(&mut self, ctx: &mut C) -> Result<()> {
        self.ensure_running()?;
        if !self.is_root() {
            debug!("global repair requested on a non-root node, ignoring");
            return Ok(());
        }
        let version = next_version(self.routes.session.version);
        self.routes.session.version = version;
        self.last_root_version = version;
        info!("issuing DODAG version {}", version);
        self.push_event(Event::GlobalRepair { version });
        self.reset_trickle(ctx);
        Ok(())
    }

    /// Root only: bump the DTSN so every node re-advertises its routes.
    pub fn refresh_downward_routes<C: Context>(&mut self, ctx: &mut C) -> Result<()> {
        self.ensure_running()?;
        if !self.is_root() {
            debug!("DTSN refresh requested on a non-root node, ignoring");
            return Ok(());
        }
        self.routes.session.dtsn = self.routes.session.dtsn.wrapping_add(1);
        info!("DTSN now {}", self.routes.session.dtsn);
        self.reset_trickle(ctx);
        Ok(())
    }

    /// Stop everything and release all sockets.
    pub fn dispose<C: Context>(&mut self, ctx: &mut C) {
        self.stop_timers(ctx);
        self.reboot_timer.cancel(ctx);
        self.routes.clear();
        self.neighbors.clear();
        for socket in self.sockets.drain() {
            ctx.close(socket);
        }
        if self.state != NodeState::Halted {
            self.state = NodeState::Unattached;
        }
        info!("disposed");
    }

    //=== Error policy ===

    fn ensure_running(&self) -> Result<()> {
        if self.state == NodeState::Halted {
            return Err(RplError::Halted);
        }
        Ok(())
    }

    /// Fatal errors halt the instance; recoverable ones are logged and
    /// swallowed.
    fn guard<C: Context>(&mut self, ctx: &mut C, result: Result<()>) -> Result<()> {
        match result {
            Err(err) if err.is_fatal() => {
                self.halt(ctx, &err);
                Err(err)
            }
            Err(err) => {
                warn!("recoverable error: {}", err);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn halt<C: Context>(&mut self, ctx: &mut C, err: &RplError) {
        error!("halting protocol instance: {}", err);
        self.stop_timers(ctx);
        self.reboot_timer.cancel(ctx);
        self.state = NodeState::Halted;
        self.push_event(Event::Halted {
            reason: err.to_string(),
        });
    }

    fn stop_timers<C: Context>(&mut self, ctx: &mut C) {
        self.trickle.disable(ctx);
        self.dis_timer.cancel(ctx);
        self.dao_timer.cancel(ctx);
        self.dao_ack_timer.cancel(ctx);
    }

    //=== Attachment ===

    fn attach<C: Context>(&mut self, ctx: &mut C) -> Result<()> {
        let binding = SocketBinding::Multicast {
            group: ALL_RPL_NODES,
            port: RPL_PORT,
        };
        let shared = ctx.bind(binding).map_err(|source| RplError::Bind {
            binding: format!("{ALL_RPL_NODES} port {RPL_PORT}"),
            source,
        })?;
        if let Some(old) = self.sockets.set_shared(shared) {
            ctx.close(old);
        }

        let mut interfaces: Vec<u32> = self.addresses.iter().map(|a| a.interface).collect();
        interfaces.sort_unstable();
        interfaces.dedup();
        for interface in interfaces {
            self.bring_up(ctx, interface)?;
        }

        match self.config.root {
            Some(root) => {
                self.become_root(ctx, root.version);
                Ok(())
            }
            None => self.join(ctx),
        }
    }

    /// Bind the link-local socket for `interface` and install local routes
    /// for its global addresses.
    fn bring_up<C: Context>(&mut self, ctx: &mut C, interface: u32) -> Result<()> {
        let on_interface: Vec<InterfaceAddress> = self
            .addresses
            .iter()
            .filter(|a| a.interface == interface)
            .copied()
            .collect();

        for addr in on_interface {
            if addr.is_link_local() {
                if self.sockets.has_interface(interface) {
                    continue;
                }
                let binding = SocketBinding::Unicast {
                    address: addr.address,
                    port: RPL_PORT,
                    interface,
                };
                let socket = ctx.bind(binding).map_err(|source| RplError::Bind {
                    binding: format!("{} port {} iface {}", addr.address, RPL_PORT, interface),
                    source,
                })?;
                self.sockets.insert_interface(interface, socket);
                debug!("bound {} on iface {}", addr.address, interface);
            } else if self.routes.find(&addr.address).is_none() {
                self.routes.add_local_route(addr.address, interface);
            }
        }
        Ok(())
    }

    fn take_down<C: Context>(&mut self, ctx: &mut C, interface: u32) -> Result<()> {
        info!("interface {} down", interface);
        for entry in self.routes.invalidate_route(interface) {
            if entry.origin != RouteOrigin::Local {
                self.push_event(Event::RouteRemoved(entry));
            }
        }
        if let Some(socket) = self.sockets.remove_interface(interface) {
            ctx.close(socket);
        }

        let previous = self.preferred_parent();
        if self.neighbors.mark_interface_unreachable(interface) > 0 {
            self.reselect_parent(ctx, previous)?;
        }
        Ok(())
    }

    /// Re-add local routes for every global address we own.
    fn install_local_routes(&mut self) {
        for addr in &self.addresses {
            if !addr.is_link_local() && self.routes.find(&addr.address).is_none() {
                self.routes.add_local_route(addr.address, addr.interface);
            }
        }
    }

    fn become_root<C: Context>(&mut self, ctx: &mut C, version: u8) {
        let root = self.config.root.unwrap_or_default();
        self.objective = self.config.objective;
        self.min_hop_rank_increase = self.config.min_hop_rank_increase;
        self.mode_of_operation = self.config.mode_of_operation;
        self.routes.session = DodagSession {
            instance_id: root.instance_id,
            dodag_id: root.dodag_id,
            version,
            rank: self.objective.root_rank(),
            objective_code_point: self.objective.ocp(),
            dtsn: 1,
            grounded: true,
            is_router: true,
            metric: 0,
        };
        self.state = NodeState::Root;
        self.last_root_version = version;
        self.rank_errors = 0;

        info!(
            "DODAG root for {} (instance {}, version {})",
            root.dodag_id, root.instance_id, version
        );
        self.push_event(Event::Joined {
            dodag_id: root.dodag_id,
            version,
            rank: self.routes.session.rank,
        });
        self.trickle.start(ctx, &mut self.rng);
    }

    /// Start soliciting: one DIS now, then one per `dis_interval` until a
    /// DIO shows up.
    fn join<C: Context>(&mut self, ctx: &mut C) -> Result<()> {
        self.state = NodeState::Joining;
        self.rank_errors = 0;
        info!("soliciting DODAG information");
        self.dis_timer
            .arm(ctx, self.config.dis_interval, Timer::DisRetransmit);
        self.send_dis(ctx)
    }

    fn leave_dodag<C: Context>(&mut self, ctx: &mut C) -> Result<()> {
        if self.state == NodeState::Disjoining {
            return Ok(());
        }
        info!("disjoining DODAG {}", self.routes.session.dodag_id);
        self.stop_timers(ctx);

        // Poison before the session is forgotten.
        let session = self.routes.session;
        if session.version != 0 {
            let poison = Packet::build_dio(self.dio_for(&session, INFINITE_RANK), self.advertised_configuration());
            match self.send(ctx, &poison, ALL_RPL_NODES, RPL_PORT, None) {
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!("poison DIO not sent, disjoining anyway: {}", err),
                Ok(()) => {}
            }
        }

        self.routes.clear();
        self.neighbors.clear();
        self.install_local_routes();

        self.state = NodeState::Disjoining;
        self.push_event(Event::Disjoined);
        self.reboot_timer
            .arm(ctx, self.config.disjoin_delay, Timer::Reboot);
        Ok(())
    }

    //=== Timers ===

    fn dispatch_timer<C: Context>(&mut self, ctx: &mut C, handle: TimerHandle, timer: Timer) -> Result<()> {
        match timer {
            Timer::TrickleTransmit => {
                if self.trickle.on_transmit(handle) {
                    self.send_dio(ctx, None)?;
                } else {
                    trace!(
                        "DIO suppressed (heard {} consistent)",
                        self.trickle.counter()
                    );
                }
            }
            Timer::TrickleInterval => {
                self.trickle.on_interval_expiry(handle, ctx, &mut self.rng);
            }
            Timer::DisRetransmit => {
                if self.dis_timer.fire(handle) && self.state == NodeState::Joining {
                    self.dis_timer
                        .arm(ctx, self.config.dis_interval, Timer::DisRetransmit);
                    self.send_dis(ctx)?;
                }
            }
            Timer::SendDao => {
                if self.dao_timer.fire(handle) {
                    self.send_dao(ctx, false)?;
                }
            }
            Timer::DaoAckCheck => {
                if self.dao_ack_timer.fire(handle) {
                    self.check_dao_ack(ctx)?;
                }
            }
            Timer::Reboot => {
                if self.reboot_timer.fire(handle) {
                    self.reboot(ctx)?;
                }
            }
        }
        Ok(())
    }

    fn reboot<C: Context>(&mut self, ctx: &mut C) -> Result<()> {
        let as_root = self.config.is_root();
        info!("rebooting{}", if as_root { " as root" } else { "" });
        self.push_event(Event::Rebooted { as_root });
        if as_root {
            self.become_root(ctx, next_version(self.last_root_version));
            Ok(())
        } else {
            self.join(ctx)
        }
    }

    /// No DAO-ACK arrived in time: resend, or give up and rejoin.
    fn check_dao_ack<C: Context>(&mut self, ctx: &mut C) -> Result<()> {
        let remaining = self
            .own_target()
            .and_then(|t| self.routes.find_mut(&t.address))
            .map(|entry| {
                let left = entry.retry_counter;
                entry.retry_counter = left.saturating_sub(1);
                left
            })
            .unwrap_or(0);

        if remaining > 0 {
            warn!("no DAO-ACK, resending ({} retries left)", remaining - 1);
            return self.send_dao(ctx, true);
        }

        warn!("no DAO-ACK after {} retries, rejoining", self.config.dao_max_retries);
        self.push_event(Event::DaoRetriesExhausted);
        self.stop_timers(ctx);
        self.routes.clear();
        self.neighbors.clear();
        self.install_local_routes();
        self.join(ctx)
    }

    fn reset_trickle<C: Context>(&mut self, ctx: &mut C) {
        if self.trickle.is_running() {
            self.trickle.reset(ctx, &mut self.rng);
        }
    }

    //=== Inbound ===

    fn handle_datagram<C: Context>(&mut self, ctx: &mut C, datagram: &Datagram) -> Result<()> {
        if self.owns(&datagram.source) {
            trace!("ignoring own datagram");
            return Ok(());
        }
        let packet = Packet::from_bytes(&datagram.payload)?;
        trace!(
            "received {} from {} on iface {}",
            packet.message, datagram.source, datagram.interface
        );

        match packet.message {
            Message::Dis(_) => self.handle_dis(ctx, datagram, &packet),
            Message::Dio(dio) => self.handle_dio(ctx, datagram, &dio, &packet),
            Message::Dao(dao) => self.handle_dao(ctx, datagram, &dao, &packet),
            Message::DaoAck(ack) => self.handle_dao_ack(ctx, datagram, &ack, &packet),
        }
    }

    fn handle_dis<C: Context>(&mut self, ctx: &mut C, datagram: &Datagram, packet: &Packet) -> Result<()> {
        if self.state == NodeState::Disjoining {
            debug!("DIS from {} ignored while disjoining", datagram.source);
            return Ok(());
        }
        if !self.routes.session.is_router {
            debug!("DIS from {} ignored: not a router", datagram.source);
            return Ok(());
        }
        if !self.solicitation_matches(packet) {
            debug!("DIS from {} ignored: predicates do not match", datagram.source);
            return Ok(());
        }

        if self.routes.find(&datagram.source).is_none() {
            self.routes
                .add_neighbor_route(datagram.source, datagram.interface, datagram.source_port);
            if let Some(entry) = self.routes.find(&datagram.source).cloned() {
                self.push_event(Event::RouteAdded(entry));
            }
        }

        if self.routes.session.version != 0 {
            self.reset_trickle(ctx);
            self.send_dio(
                ctx,
                Some((datagram.source, datagram.source_port, datagram.interface)),
            )?;
        }
        Ok(())
    }

    /// Solicited Information predicates, when present, must all hold.
    fn solicitation_matches(&self, packet: &Packet) -> bool {
        let session = &self.routes.session;
        packet.options.iter().all(|o| match o {
            RplOption::SolicitedInformation {
                instance_id,
                version_predicate,
                instance_predicate,
                dodag_id_predicate,
                dodag_id,
                version,
            } => {
                (!version_predicate || *version == session.version)
                    && (!instance_predicate || *instance_id == session.instance_id)
                    && (!dodag_id_predicate || *dodag_id == session.dodag_id)
            }
            _ => true,
        })
    }

    fn handle_dio<C: Context>(
        &mut self,
        ctx: &mut C,
        datagram: &Datagram,
        dio: &Dio,
        packet: &Packet,
    ) -> Result<()> {
        let src = datagram.source;
        if self.state == NodeState::Disjoining {
            debug!("DIO from {} ignored while disjoining", src);
            return Ok(());
        }

        let session = self.routes.session;
        if session.is_set()
            && (dio.instance_id != session.instance_id || dio.dodag_id != session.dodag_id)
        {
            debug!(
                "DIO from {} for instance {} DODAG {} dropped: member of instance {} DODAG {}",
                src, dio.instance_id, dio.dodag_id, session.instance_id, session.dodag_id
            );
            if self.neighbors.find(&src).is_none() {
                let mut n = Neighbor::new(src, dio.dodag_id, dio.dtsn, dio.rank, datagram.interface);
                n.kind = NeighborKind::DifferentDodag;
                self.neighbors.add(n);
            }
            return Ok(());
        }

        if dio.rank == INFINITE_RANK {
            return self.handle_poison(ctx, src);
        }

        if session.is_set() && dio.version == session.version {
            self.trickle.hear_consistent();
            if !self.is_root() && dio.dtsn != session.dtsn && self.preferred_parent() == Some(src) {
                debug!("parent {} moved DTSN {} -> {}", src, session.dtsn, dio.dtsn);
                self.routes.session.dtsn = dio.dtsn;
                self.schedule_dao(ctx);
            }
        } else if !self.is_root() && (!session.is_set() || dio.rank < session.rank) {
            return self.adopt_dodag(ctx, datagram, dio, packet);
        }

        self.note_neighbor(ctx, datagram, dio)
    }

    /// A neighbor advertised infinite rank: forget it and reselect.
    fn handle_poison<C: Context>(&mut self, ctx: &mut C, src: Ipv6Addr) -> Result<()> {
        info!("{} poisoned its rank", src);
        if self.routes.find(&src).is_some() {
            let entry = self.routes.delete_route(&src)?;
            self.push_event(Event::RouteRemoved(entry));
        }
        let previous = self.preferred_parent();
        if self.neighbors.delete(&src).is_some() {
            self.reselect_parent(ctx, previous)?;
        }
        Ok(())
    }

    /// Global repair: rebuild membership around a new DODAG or version.
    fn adopt_dodag<C: Context>(
        &mut self,
        ctx: &mut C,
        datagram: &Datagram,
        dio: &Dio,
        packet: &Packet,
    ) -> Result<()> {
        let (ocp, min_hop_rank_increase) = packet
            .dodag_configuration()
            .map(|c| (c.objective_code_point, c.min_hop_rank_increase))
            .unwrap_or((self.config.objective.ocp(), self.config.min_hop_rank_increase));
        let Some(objective) = ObjectiveFunction::from_ocp(ocp) else {
            warn!("DIO from {} uses unsupported objective code point {}", datagram.source, ocp);
            return Ok(());
        };
        if min_hop_rank_increase == 0 {
            warn!("DIO from {} advertises a zero MinHopRankIncrease", datagram.source);
            return Ok(());
        }
        self.dis_timer.cancel(ctx);

        let previous_version = self.routes.session.version;
        self.routes.clear();
        self.neighbors.clear();
        self.install_local_routes();

        let rank = objective.compute_rank(dio.rank, min_hop_rank_increase);
        self.objective = objective;
        self.min_hop_rank_increase = min_hop_rank_increase;
        self.mode_of_operation = dio.mode_of_operation;
        self.routes.session = DodagSession {
            instance_id: dio.instance_id,
            dodag_id: dio.dodag_id,
            version: dio.version,
            rank,
            objective_code_point: ocp,
            dtsn: dio.dtsn,
            grounded: dio.grounded,
            is_router: true,
            metric: self.hops(rank),
        };
        self.state = NodeState::Attached;
        self.rank_errors = 0;

        if previous_version != 0 && self.trickle.is_running() {
            self.trickle.reset(ctx, &mut self.rng);
        } else {
            self.trickle.start(ctx, &mut self.rng);
        }

        info!(
            "joined DODAG {} version {} with rank {} via {}",
            dio.dodag_id, dio.version, rank, datagram.source
        );
        self.push_event(Event::Joined {
            dodag_id: dio.dodag_id,
            version: dio.version,
            rank,
        });
        if previous_version != 0 && previous_version != dio.version {
            self.push_event(Event::GlobalRepair {
                version: dio.version,
            });
        }

        self.note_neighbor(ctx, datagram, dio)
    }

    /// Record the DIO sender and let parent selection react.
    fn note_neighbor<C: Context>(&mut self, ctx: &mut C, datagram: &Datagram, dio: &Dio) -> Result<()> {
        let src = datagram.source;
        let previous = self.preferred_parent();

        if self.neighbors.find(&src).is_some() {
            if self
                .neighbors
                .update(&src, dio.dodag_id, dio.dtsn, dio.rank, datagram.interface)
            {
                self.reselect_parent(ctx, previous)?;
            }
            return Ok(());
        }

        self.neighbors.add(Neighbor::new(
            src,
            dio.dodag_id,
            dio.dtsn,
            dio.rank,
            datagram.interface,
        ));
        self.reselect_parent(ctx, previous)?;

        if self.preferred_parent().is_some()
            && dio.rank < self.routes.session.rank
            && self.routes.find(&src).is_none()
        {
            self.routes
                .add_neighbor_route(src, datagram.interface, datagram.source_port);
            if let Some(entry) = self.routes.find(&src).cloned() {
                self.push_event(Event::RouteAdded(entry));
            }
        }
        Ok(())
    }

    /// Run parent selection and react to its outcome. `previous` is the
    /// parent before the triggering change.
    fn reselect_parent<C: Context>(&mut self, ctx: &mut C, previous: Option<Ipv6Addr>) -> Result<()> {
        if self.is_root() || self.state != NodeState::Attached {
            return Ok(());
        }

        let own_rank = self.routes.session.rank;
        let selected = self
            .neighbors
            .select_parent(own_rank)
            .map(|p| (p.address, p.rank));

        let Some((parent, parent_rank)) = selected else {
            if let Some(lost) = previous {
                info!("lost preferred parent {}, no candidate left", lost);
                self.push_event(Event::ParentChanged(None));
                return self.leave_dodag(ctx);
            }
            return Ok(());
        };

        let rank = self
            .objective
            .compute_rank(parent_rank, self.min_hop_rank_increase);
        if rank != own_rank {
            debug!("rank {} -> {} through {}", own_rank, rank, parent);
            self.routes.session.rank = rank;
            self.routes.session.metric = self.hops(rank);
            self.neighbors.select_parent(rank);
            self.reset_trickle(ctx);
        }

        if previous != Some(parent) {
            info!("preferred parent is now {} (rank {})", parent, parent_rank);
            self.push_event(Event::ParentChanged(Some(parent)));
            self.schedule_dao(ctx);
        }
        Ok(())
    }

    fn handle_dao<C: Context>(
        &mut self,
        ctx: &mut C,
        datagram: &Datagram,
        dao: &Dao,
        packet: &Packet,
    ) -> Result<()> {
        let src = datagram.source;
        let session = self.routes.session;
        if !session.is_set() {
            debug!("DAO from {} dropped: not attached", src);
            return Ok(());
        }
        if dao.instance_id != session.instance_id
            || (dao.dodag_id_present && dao.dodag_id != session.dodag_id)
        {
            debug!(
                "DAO from {} for instance {} DODAG {} dropped",
                src, dao.instance_id, dao.dodag_id
            );
            return Ok(());
        }

        // Upward: the sender must sit strictly deeper than us.
        if let Some(sender_rank) = packet.sender_rank() {
            if sender_rank <= session.rank {
                return self.rank_error(ctx, src, sender_rank);
            }
        }

        self.purge_expired_routes(ctx);

        let Some((target, _prefix_length)) = packet.options.iter().find_map(|o| match o {
            RplOption::Target {
                prefix, prefix_length, ..
            } => Some((*prefix, *prefix_length)),
            _ => None,
        }) else {
            debug!("DAO from {} carries no target", src);
            return Ok(());
        };
        let transit = packet.options.iter().find_map(|o| match o {
            RplOption::TransitInformation {
                path_control,
                path_sequence,
                path_lifetime,
                parent,
                ..
            } => Some((*path_control, *path_sequence, *path_lifetime, *parent)),
            _ => None,
        });
        let (path_control, path_sequence, lifetime, transit_parent) =
            transit.unwrap_or((0, 0, self.config.default_lifetime, src));

        let storing = self.mode_of_operation.is_storing();
        if storing || self.is_root() {
            // Non-storing roots route through the advertised parent unless
            // that parent is the root itself.
            let next_hop = if storing || self.owns(&transit_parent) {
                src
            } else {
                transit_parent
            };
            let info = DaoInfo {
                path_sequence,
                dao_sequence: dao.sequence,
                lifetime,
                path_control,
                expires_at: self.expiry(ctx, lifetime),
            };
            self.install_dao_route(target, datagram.interface, next_hop, info);
        }

        if !self.is_root() {
            self.forward_dao(ctx, dao, packet)?;
        }

        // Every storing hop that was asked acknowledges, the root included,
        // so children of the root are supervised like any other node.
        if storing && dao.ack_requested {
            let ack = DaoAck {
                dodag_id_present: true,
                status: 0,
                sequence: dao.sequence,
                instance_id: session.instance_id,
                dodag_id: session.dodag_id,
            };
            let pkt = Packet::build_dao_ack(ack, session.rank);
            trace!("acknowledging DAO #{} from {}", dao.sequence, src);
            self.send(ctx, &pkt, src, datagram.source_port, Some(datagram.interface))?;
        }
        Ok(())
    }

    /// Install, refresh, or (for a zero lifetime) remove a DAO route.
    fn install_dao_route(&mut self, target: Ipv6Addr, interface: u32, next_hop: Ipv6Addr, info: DaoInfo) {
        let existing = self.routes.find(&target).map(|e| (e.origin, e.next_hop));
        match existing {
            Some((RouteOrigin::Local, _)) => {
                debug!("DAO for own address {} ignored", target);
            }
            Some((_, hop)) if info.lifetime == 0 => {
                if let Ok(entry) = self.routes.delete_route(&target) {
                    info!("no-path DAO removed route to {} via {:?}", target, hop);
                    self.push_event(Event::RouteRemoved(entry));
                }
            }
            None if info.lifetime == 0 => {}
            Some((RouteOrigin::Dao, Some(hop))) if hop == next_hop => {
                if let Some(entry) = self.routes.find_mut(&target) {
                    entry.interface = interface;
                    entry.path_sequence = info.path_sequence;
                    entry.dao_sequence = info.dao_sequence;
                    entry.dao_lifetime = info.lifetime;
                    entry.path_control = info.path_control;
                    entry.expires_at = info.expires_at;
                }
            }
            Some(_) | None => {
                if let Ok(old) = self.routes.delete_route(&target) {
                    self.push_event(Event::RouteRemoved(old));
                }
                self.routes.add_dao_route(target, interface, next_hop, info);
                info!("route to {} via {}", target, next_hop);
                if let Some(entry) = self.routes.find(&target).cloned() {
                    self.push_event(Event::RouteAdded(entry));
                }
            }
        }
    }

    /// Pass a DAO on to our parent with our own rank in the hop-by-hop
    /// option.
    fn forward_dao<C: Context>(&mut self, ctx: &mut C, dao: &Dao, packet: &Packet) -> Result<()> {
        let Some((parent, interface)) = self
            .neighbors
            .preferred_parent()
            .map(|p| (p.address, p.interface))
        else {
            debug!("DAO #{} not forwarded: no parent", dao.sequence);
            return Ok(());
        };

        let mut fwd = packet.clone();
        if self.mode_of_operation.is_storing() {
            // Acknowledged here; the next hop need not answer us.
            fwd.message = Message::Dao(Dao {
                ack_requested: false,
                ..*dao
            });
        }
        fwd.set_sender_rank(self.routes.session.instance_id, self.routes.session.rank, false);
        trace!("forwarding DAO #{} to {}", dao.sequence, parent);
        self.send(ctx, &fwd, parent, RPL_PORT, Some(interface))
    }

    fn handle_dao_ack<C: Context>(
        &mut self,
        ctx: &mut C,
        datagram: &Datagram,
        ack: &DaoAck,
        packet: &Packet,
    ) -> Result<()> {
        let src = datagram.source;
        let session = self.routes.session;
        if !session.is_set()
            || ack.instance_id != session.instance_id
            || (ack.dodag_id_present && ack.dodag_id != session.dodag_id)
        {
            debug!("DAO-ACK from {} dropped: DODAG mismatch", src);
            return Ok(());
        }

        // Downward: the sender must sit strictly closer to the root.
        if let Some(sender_rank) = packet.sender_rank() {
            if sender_rank >= session.rank {
                return self.rank_error(ctx, src, sender_rank);
            }
        }

        if !self.dao_ack_timer.is_armed() {
            debug!("unexpected DAO-ACK #{} from {}", ack.sequence, src);
            return Ok(());
        }
        let outstanding = self
            .own_target()
            .and_then(|t| self.routes.find(&t.address))
            .map(|e| e.dao_sequence);
        if outstanding != Some(ack.sequence) {
            debug!("DAO-ACK #{} from {} does not match {:?}", ack.sequence, src, outstanding);
            return Ok(());
        }
        if ack.status >= DAO_ACK_REJECT {
            warn!("DAO #{} rejected by {} with status {}", ack.sequence, src, ack.status);
            return Ok(());
        }

        self.dao_ack_timer.cancel(ctx);
        info!("DAO #{} acknowledged by {}", ack.sequence, src);
        self.push_event(Event::DaoAcknowledged {
            sequence: ack.sequence,
        });
        Ok(())
    }

    /// Count a loop detection. Past the budget the instance halts.
    fn rank_error<C: Context>(&mut self, ctx: &mut C, sender: Ipv6Addr, sender_rank: u16) -> Result<()> {
        self.rank_errors = self.rank_errors.saturating_add(1);
        warn!(
            "rank error from {}: sender rank {} against own rank {} ({} of {})",
            sender,
            sender_rank,
            self.routes.session.rank,
            self.rank_errors,
            self.config.max_rank_errors
        );
        self.push_event(Event::RankError { sender, sender_rank });

        if self.rank_errors > self.config.max_rank_errors {
            self.push_event(Event::LoopBudgetExhausted {
                errors: self.rank_errors,
            });
            return Err(RplError::LoopBudgetExhausted(self.rank_errors));
        }
        self.reset_trickle(ctx);
        Ok(())
    }

    fn purge_expired_routes<C: Context>(&mut self, ctx: &mut C) {
        for entry in self.routes.purge_expired(ctx.now()) {
            info!("route to {} expired", entry.destination);
            self.push_event(Event::RouteRemoved(entry));
        }
    }

    //=== Outbound ===

    fn send<C: Context>(
        &mut self,
        ctx: &mut C,
        packet: &Packet,
        destination: Ipv6Addr,
        port: u16,
        interface: Option<u32>,
    ) -> Result<()> {
        let socket = self.sockets.egress(interface)?;
        let bytes = packet.to_bytes();
        trace!("sending {} to {} ({} bytes)", packet.message, destination, bytes.len());
        ctx.send_to(socket, &bytes, destination, port)?;
        Ok(())
    }

    fn send_dis<C: Context>(&mut self, ctx: &mut C) -> Result<()> {
        let pkt = Packet::build_dis();
        self.send(ctx, &pkt, ALL_RPL_NODES, RPL_PORT, None)
    }

    /// Multicast a DIO, or unicast it to `(address, port, interface)`.
    fn send_dio<C: Context>(&mut self, ctx: &mut C, unicast: Option<(Ipv6Addr, u16, u32)>) -> Result<()> {
        let session = self.routes.session;
        if session.version == 0 {
            trace!("DIO suppressed: no DODAG version yet");
            return Ok(());
        }
        let pkt = Packet::build_dio(
            self.dio_for(&session, session.rank),
            self.advertised_configuration(),
        );
        match unicast {
            Some((address, port, interface)) => self.send(ctx, &pkt, address, port, Some(interface)),
            None => self.send(ctx, &pkt, ALL_RPL_NODES, RPL_PORT, None),
        }
    }

    fn dio_for(&self, session: &DodagSession, rank: u16) -> Dio {
        Dio {
            instance_id: session.instance_id,
            version: session.version,
            rank,
            grounded: session.grounded,
            mode_of_operation: self.mode_of_operation,
            preference: 0,
            dtsn: session.dtsn,
            flags: 0,
            dodag_id: session.dodag_id,
        }
    }

    fn advertised_configuration(&self) -> crate::option::DodagConfiguration {
        let mut conf = self.config.dodag_configuration();
        conf.objective_code_point = self.routes.session.objective_code_point;
        conf.min_hop_rank_increase = self.min_hop_rank_increase;
        conf
    }

    fn schedule_dao<C: Context>(&mut self, ctx: &mut C) {
        if matches!(
            self.mode_of_operation,
            ModeOfOperation::NoDownwardRoutes | ModeOfOperation::Unknown(_)
        ) {
            return;
        }
        self.dao_timer.arm(ctx, self.config.dao_delay, Timer::SendDao);
    }

    /// Advertise our global address to the preferred parent. A retry resends
    /// the outstanding sequence number.
    fn send_dao<C: Context>(&mut self, ctx: &mut C, retry: bool) -> Result<()> {
        if self.state != NodeState::Attached {
            return Ok(());
        }
        let Some((parent, interface)) = self
            .neighbors
            .preferred_parent()
            .map(|p| (p.address, p.interface))
        else {
            debug!("DAO not sent: no parent");
            return Ok(());
        };
        let Some(target) = self.own_target() else {
            debug!("DAO not sent: no global address to advertise");
            return Ok(());
        };
        let Some(entry) = self.routes.find_mut(&target.address) else {
            debug!("DAO not sent: no local route for {}", target.address);
            return Ok(());
        };
        if !retry {
            entry.dao_sequence = entry.dao_sequence.wrapping_add(1);
            entry.path_sequence = entry.path_sequence.wrapping_add(1);
        }
        let (sequence, path_sequence) = (entry.dao_sequence, entry.path_sequence);

        let storing = self.mode_of_operation.is_storing();
        let session = self.routes.session;
        let dao = Dao {
            ack_requested: storing,
            dodag_id_present: true,
            sequence,
            instance_id: session.instance_id,
            dodag_id: session.dodag_id,
        };
        let mut pkt = Packet::with_options(
            Message::Dao(dao),
            vec![
                RplOption::Target {
                    prefix_length: target.prefix_length,
                    flags: 0,
                    prefix: target.address,
                },
                RplOption::TransitInformation {
                    external: false,
                    path_control: 0,
                    path_sequence,
                    path_lifetime: self.config.default_lifetime,
                    parent,
                },
            ],
        );
        pkt.set_sender_rank(session.instance_id, session.rank, false);

        // Supervise before sending so a lost send is retried like a lost ACK.
        if storing {
            if !retry {
                let retries = self.config.dao_max_retries;
                if let Some(entry) = self.routes.find_mut(&target.address) {
                    entry.retry_counter = retries;
                }
            }
            self.dao_ack_timer
                .arm(ctx, self.config.dao_ack_timeout, Timer::DaoAckCheck);
        }

        info!("DAO #{} for {} to parent {}", sequence, target.address, parent);
        self.send(ctx, &pkt, parent, RPL_PORT, Some(interface))
    }

    //=== Helpers ===

    fn owns(&self, address: &Ipv6Addr) -> bool {
        self.addresses.iter().any(|a| &a.address == address)
    }

    /// The address advertised in our DAOs.
    fn own_target(&self) -> Option<InterfaceAddress> {
        self.addresses.iter().find(|a| !a.is_link_local()).copied()
    }

    /// Hop distance from the root implied by `rank`.
    fn hops(&self, rank: u16) -> u8 {
        let step = self
            .objective
            .rank_increase(self.min_hop_rank_increase)
            .max(1);
        let hops = rank.saturating_sub(self.objective.root_rank()) / step;
        u8::try_from(hops).unwrap_or(u8::MAX)
    }

    fn expiry<C: Context>(&self, ctx: &C, lifetime: u8) -> Option<Duration> {
        if lifetime == INFINITE_LIFETIME {
            return None;
        }
        let secs = u64::from(lifetime) * u64::from(self.config.lifetime_unit);
        Some(ctx.now() + Duration::from_secs(secs))
    }
}

/// Next DODAG version, skipping 0 (reserved for "none").
fn next_version(version: u8) -> u8 {
    match version.wrapping_add(1) {
        0 => 1,
        v => v,
    }
}
