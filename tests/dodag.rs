// End-to-end DODAG behaviour over the simulated network.

use std::net::Ipv6Addr;
use std::time::Duration;

use rpl_rs::option::RplOption;
use rpl_rs::packet::{Dao, Message, RPL_PORT};
use rpl_rs::sim::{NetworkSim, SIM_INTERFACE};
use rpl_rs::{
    Datagram, Event, NodeState, ObjectiveFunction, Packet, RootConfig, RplConfig, RplError,
};

const ONE_HOUR: Duration = Duration::from_secs(60 * 60);

fn a(s: &str) -> Ipv6Addr {
    s.parse().unwrap()
}

/// Root at index 0 followed by `routers` nodes linked in a chain.
fn chain(config: RplConfig, routers: usize) -> NetworkSim {
    let mut sim = NetworkSim::new();
    sim.create_node(config.clone().as_root(RootConfig::default()))
        .unwrap();
    for _ in 0..routers {
        sim.create_node(config.clone()).unwrap();
    }
    sim.chain();
    sim.start();
    sim
}

fn looping_dao(sender_rank: u16) -> Datagram {
    let mut pkt = Packet::with_options(
        Message::Dao(Dao {
            ack_requested: false,
            dodag_id_present: true,
            sequence: 1,
            instance_id: 0,
            dodag_id: a("2002:1::"),
        }),
        vec![RplOption::Target {
            prefix_length: 64,
            flags: 0,
            prefix: a("2001:1::99"),
        }],
    );
    pkt.set_sender_rank(0, sender_rank, false);
    Datagram {
        payload: pkt.to_bytes(),
        source: a("fe80::99"),
        source_port: RPL_PORT,
        interface: SIM_INTERFACE,
    }
}

#[test]
fn root_alone_only_sends_dios() {
    let mut sim = NetworkSim::new();
    sim.create_node(RplConfig::new().as_root(RootConfig::default()))
        .unwrap();
    sim.start();
    sim.run(ONE_HOUR);

    assert!(!sim.msgs().is_empty());
    assert!(sim.msgs().iter().all(|m| m.is_dio() && m.is_multicast()));
    assert_eq!(sim.node(0).state(), NodeState::Root);
}

#[test]
fn router_attaches_below_root() {
    let mut sim = chain(RplConfig::new(), 1);
    sim.run(Duration::from_secs(5));

    let router = sim.node(1);
    assert_eq!(router.state(), NodeState::Attached);
    assert_eq!(router.rank(), 769);
    assert_eq!(router.preferred_parent(), Some(sim.link_local(0)));
    assert_eq!(router.session().dodag_id, a("2002:1::"));
    assert!(router.route_output(&sim.link_local(0), None).is_some());

    // Non-storing: the router's DAO lands at the root only.
    let route = sim.node(0).route_output(&sim.global(1), None).unwrap();
    assert_eq!(route.gateway, sim.link_local(1));
}

#[test]
fn chain_ranks_grow_by_one_hop_each() {
    let mut sim = chain(RplConfig::new(), 2);
    sim.run(Duration::from_secs(10));

    assert_eq!(sim.node(0).rank(), 1);
    assert_eq!(sim.node(1).rank(), 769);
    assert_eq!(sim.node(2).rank(), 1537);
    assert_eq!(sim.node(2).preferred_parent(), Some(sim.link_local(1)));

    // The far router's DAO was relayed; the root routes through its parent.
    let root = sim.node(0);
    assert_eq!(
        root.route_output(&sim.global(2), None).unwrap().gateway,
        sim.link_local(1)
    );
    assert!(sim.node(1).route_output(&sim.global(2), None).is_none());
    assert_eq!(sim.node(2).session().metric, 2);
}

#[test]
fn hop_count_objective_is_adopted_from_root() {
    let mut sim = chain(RplConfig::new().objective(ObjectiveFunction::HopCount), 2);
    sim.run(Duration::from_secs(10));

    assert_eq!(sim.node(0).rank(), 0);
    assert_eq!(sim.node(1).rank(), 1);
    assert_eq!(sim.node(2).rank(), 2);
}

#[test]
fn rank_step_follows_root_min_hop_rank_increase() {
    let mut sim = NetworkSim::new();
    sim.create_node(
        RplConfig::new()
            .min_hop_rank_increase(128)
            .as_root(RootConfig::default()),
    )
    .unwrap();
    // Routers keep the default locally; the root's advertisement wins.
    sim.create_node(RplConfig::new()).unwrap();
    sim.create_node(RplConfig::new()).unwrap();
    sim.chain();
    sim.start();
    sim.run(Duration::from_secs(10));

    assert_eq!(sim.node(1).rank(), 385);
    assert_eq!(sim.node(2).rank(), 769);
    assert_eq!(sim.node(2).session().metric, 2);
}

#[test]
fn storing_mode_keeps_routes_at_every_hop() {
    let mut sim = chain(RplConfig::new().storing(), 2);
    sim.run(Duration::from_secs(10));

    let middle = sim.node(1).route_output(&sim.global(2), None).unwrap();
    assert_eq!(middle.gateway, sim.link_local(2));
    let root = sim.node(0).route_output(&sim.global(2), None).unwrap();
    assert_eq!(root.gateway, sim.link_local(1));
    assert!(sim.node(0).route_output(&sim.global(1), None).is_some());

    assert!(sim.msgs().iter().filter(|m| m.is_dao_ack()).count() >= 2);
    for i in 1..=2 {
        let events = sim.node_mut(i).drain_events();
        assert!(
            events
                .iter()
                .any(|e| matches!(e, Event::DaoAcknowledged { .. })),
            "node {i} never saw its DAO acknowledged"
        );
    }
}

#[test]
fn no_downward_routes_sends_no_daos() {
    let mut sim = chain(
        RplConfig::new().mode_of_operation(rpl_rs::ModeOfOperation::NoDownwardRoutes),
        2,
    );
    sim.run(Duration::from_secs(10));

    assert_eq!(sim.node(2).rank(), 1537);
    assert!(!sim.msgs().iter().any(|m| m.is_dao()));
}

#[test]
fn disjoined_router_poisons_and_rejoins() {
    let mut sim = chain(RplConfig::new(), 1);
    sim.run(Duration::from_secs(5));
    sim.clear_msgs();

    sim.with_node(1, |node, ctx| node.disjoin(ctx));
    assert_eq!(sim.node(1).state(), NodeState::Disjoining);
    let poison = sim.msgs()[0].packet().unwrap();
    assert!(matches!(poison.message, Message::Dio(dio) if dio.rank == 0xffff));

    sim.run(Duration::from_millis(10));
    assert!(
        sim.node(0)
            .neighbors()
            .all(|n| n.address != sim.link_local(1))
    );

    sim.run(Duration::from_secs(10));
    assert_eq!(sim.node(1).state(), NodeState::Attached);
    assert_eq!(sim.node(1).rank(), 769);
    assert!(
        sim.node_mut(1)
            .drain_events()
            .contains(&Event::Rebooted { as_root: false })
    );
}

#[test]
fn global_repair_propagates_new_version() {
    let mut sim = chain(RplConfig::new(), 2);
    sim.run(Duration::from_secs(10));
    assert!(sim.nodes().iter().all(|n| n.session().version == 1));

    sim.with_node(0, |node, ctx| node.trigger_global_repair(ctx));
    sim.run(Duration::from_secs(20));

    for (i, node) in sim.nodes().iter().enumerate() {
        assert_eq!(node.session().version, 2, "node {i} kept the old version");
    }
    assert_eq!(sim.node(1).rank(), 769);
    assert_eq!(sim.node(2).rank(), 1537);
    assert!(
        sim.node_mut(2)
            .drain_events()
            .contains(&Event::GlobalRepair { version: 2 })
    );
    assert!(sim.node(0).route_output(&sim.global(2), None).is_some());
}

#[test]
fn lost_parent_link_exhausts_dao_retries() {
    let mut sim = chain(RplConfig::new().storing(), 1);
    sim.run(Duration::from_millis(500));
    assert_eq!(sim.node(1).state(), NodeState::Attached);

    // The first DAO is only due after the one second delay.
    sim.unlink(0, 1);
    sim.run(Duration::from_secs(30));

    assert_eq!(sim.node(1).state(), NodeState::Joining);
    assert!(sim.node(1).neighbors().next().is_none());
    assert!(
        sim.node_mut(1)
            .drain_events()
            .contains(&Event::DaoRetriesExhausted)
    );
    // One original DAO plus three retries.
    assert_eq!(sim.msgs().iter().filter(|m| m.is_dao()).count(), 4);
}

#[test]
fn repeated_rank_errors_halt_the_node() {
    let mut sim = chain(RplConfig::new(), 1);
    sim.run(Duration::from_secs(5));

    for _ in 0..4 {
        sim.inject(1, looping_dao(1));
        sim.run(Duration::from_millis(1));
    }

    assert_eq!(sim.node(1).state(), NodeState::Halted);
    let events = sim.node_mut(1).drain_events();
    assert!(events.contains(&Event::LoopBudgetExhausted { errors: 4 }));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::RankError { .. }))
            .count(),
        4
    );

    // The rest of the network carries on.
    sim.run(Duration::from_secs(5));
    assert_eq!(sim.node(0).state(), NodeState::Root);
}

#[test]
fn unknown_message_code_halts_the_node() {
    let mut sim = chain(RplConfig::new(), 1);
    sim.run(Duration::from_secs(2));

    let mut payload = Packet::build_dis().to_bytes();
    payload[1] = 0x42;
    sim.inject(
        1,
        Datagram {
            payload,
            source: a("fe80::99"),
            source_port: RPL_PORT,
            interface: SIM_INTERFACE,
        },
    );
    sim.run(Duration::from_millis(1));

    assert_eq!(sim.node(1).state(), NodeState::Halted);
    let mut result = Ok(());
    sim.with_node(1, |node, ctx| {
        result = node.start(ctx);
        Ok(())
    });
    assert!(matches!(result, Err(RplError::Halted)));
}
