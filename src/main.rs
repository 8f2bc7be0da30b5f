// src/main.rs
// Builds a DODAG in the simulated network and prints what every node ended
// up with.
//
// Usage: rpl_rs [routers] [seconds] [storing]

use std::env;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use rpl_rs::sim::NetworkSim;
use rpl_rs::{RootConfig, RplConfig, RplError};

fn main() -> Result<(), RplError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let routers: usize = args.first().and_then(|s| s.parse().ok()).unwrap_or(3);
    let seconds: u64 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(30);
    let storing = args.iter().any(|a| a == "storing");

    let base = if storing {
        RplConfig::new().storing()
    } else {
        RplConfig::new()
    };

    // Root first, then a chain of routers hanging off it
    let mut sim = NetworkSim::new();
    sim.create_node(base.clone().as_root(RootConfig::default()))?;
    for _ in 0..routers {
        sim.create_node(base.clone())?;
    }
    sim.chain();
    sim.start();
    sim.run(Duration::from_secs(seconds));

    for (i, node) in sim.nodes().iter().enumerate() {
        println!(
            "node {} ({}) {:?} rank={} parent={:?}",
            i,
            sim.global(i),
            node.state(),
            node.rank(),
            node.preferred_parent()
        );
        for entry in node.routes() {
            println!("    {}", entry.summary());
        }
    }

    let dio = sim.msgs().iter().filter(|m| m.is_dio()).count();
    let dao = sim.msgs().iter().filter(|m| m.is_dao()).count();
    println!("{} messages sent ({} DIO, {} DAO)", sim.msgs().len(), dio, dao);
    Ok(())
}
