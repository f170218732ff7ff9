// Aguada Simulator - Simulated sensor network
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Aguada Simulator
//!
//! Runs sensor nodes and gateways on one host over an in-memory radio
//! medium, forwarding to an HTTP backend or to an in-memory one.
//!
//! ## Usage
//!
//! ```bash
//! # Two nodes, two gateways, backend down between cycles 10 and 20
//! aguada-sim --nodes 2 --gateways 2 --cycles 40 --outage 10:20
//!
//! # Add a station that only reports raw distances in the compact format
//! aguada-sim --compact
//!
//! # Forward to a real ingest endpoint, queue persisted on disk
//! aguada-sim --backend-url http://127.0.0.1:8080/ingest --state-dir /tmp/aguada
//! ```

mod tank;

use aguada::protocol::ULTRASONIC_FLAG_SENSOR_ERROR;
use aguada::{
    AckSlot, BlobStore, DeliveryConfig, Ether, EtherRadio, FileStore, FrameHandler, MacAddress,
    MemoryStore, Node, NodeConfig, Radio, RangeSample, Ranger, TankConfig, UltrasonicPacket,
};
use aguada_gateway::{
    Backend, Gateway, GatewayConfig, GatewayError, GatewayHandle, HttpBackend, MemoryBackend,
};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tank::{SimulatedTank, TankProfile};
use thiserror::Error;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Aguada network simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of sensor nodes
    #[arg(short, long, default_value = "2")]
    nodes: u8,

    /// Number of gateways (1-3)
    #[arg(short, long, default_value = "2")]
    gateways: u8,

    /// Measurement cycles to run
    #[arg(short, long, default_value = "30")]
    cycles: u32,

    /// Pause between cycles in milliseconds
    #[arg(long, default_value = "200")]
    interval_ms: u64,

    /// Make the last node a dual-sensor device
    #[arg(long)]
    dual: bool,

    /// Backend ingest URL; records are kept in memory when absent
    #[arg(long)]
    backend_url: Option<String>,

    /// Cycle range START:END during which the in-memory backend is down
    #[arg(long, value_parser = parse_range)]
    outage: Option<(u32, u32)>,

    /// Cycle range START:END during which the first gateway is off the air
    #[arg(long, value_parser = parse_range)]
    gateway_down: Option<(u32, u32)>,

    /// Add a station sending compact ultrasonic readings to the last gateway
    #[arg(long)]
    compact: bool,

    /// Ping after which the first tank springs a leak
    #[arg(long)]
    leak_at: Option<u32>,

    /// Directory for persisted node and gateway state
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Random seed for the simulated tanks
    #[arg(long, default_value = "7")]
    seed: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Error, Debug)]
enum SimError {
    #[error("invalid arguments: {0}")]
    Args(String),

    #[error(transparent)]
    Aguada(#[from] aguada::AguadaError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Storage(#[from] aguada::StorageError),

    #[error(transparent)]
    Radio(#[from] aguada::RadioError),
}

const COMPACT_NODE_ID: u8 = 200;

/// Fire-and-forget station reporting raw distances only
struct CompactStation {
    radio: EtherRadio,
    tank: SimulatedTank,
    gateway: MacAddress,
}

impl CompactStation {
    fn new(ether: &Arc<Ether>, address: MacAddress, gateway: MacAddress, seed: u64) -> Result<Self, SimError> {
        let ignore: FrameHandler = Arc::new(|_, _, _| {});
        let radio = ether.attach(address, ignore);
        radio.add_peer(gateway)?;
        let tank = SimulatedTank::new(TankConfig::default(), TankProfile::default(), seed);
        Ok(Self { radio, tank, gateway })
    }

    fn report(&mut self) -> Result<UltrasonicPacket, SimError> {
        let packet = match self.tank.ping() {
            RangeSample::Distance(cm) => {
                UltrasonicPacket::new(COMPACT_NODE_ID, i16::try_from(cm).unwrap_or(i16::MAX))
            }
            RangeSample::Timeout => UltrasonicPacket {
                flags: ULTRASONIC_FLAG_SENSOR_ERROR,
                ..UltrasonicPacket::new(COMPACT_NODE_ID, 0)
            },
        };
        self.radio.send(self.gateway, &packet.to_bytes())?;
        Ok(packet)
    }
}

fn parse_range(s: &str) -> Result<(u32, u32), String> {
    let (start, end) = s
        .split_once(':')
        .ok_or_else(|| format!("expected START:END, got {:?}", s))?;
    let start: u32 = start.parse().map_err(|e| format!("bad start: {}", e))?;
    let end: u32 = end.parse().map_err(|e| format!("bad end: {}", e))?;
    if end < start {
        return Err("END must not be before START".to_string());
    }
    Ok((start, end))
}

fn within(range: Option<(u32, u32)>, cycle: u32) -> bool {
    range.map_or(false, |(start, end)| (start..end).contains(&cycle))
}

fn gateway_address(index: u8) -> MacAddress {
    MacAddress::new([0x24, 0x6F, 0x28, 0xA0, 0x00, index + 1])
}

fn node_address(index: u8) -> MacAddress {
    MacAddress::new([0x24, 0x6F, 0x28, 0xB0, 0x00, index + 1])
}

fn open_store(args: &Args, name: &str) -> Result<Box<dyn BlobStore>, SimError> {
    match &args.state_dir {
        Some(dir) => Ok(Box::new(FileStore::open(dir.join(name))?)),
        None => Ok(Box::new(MemoryStore::new())),
    }
}

fn make_backend(args: &Args, shared: &MemoryBackend) -> Result<Box<dyn Backend>, SimError> {
    match &args.backend_url {
        Some(url) => {
            let config = GatewayConfig::new().with_backend_url(url.clone());
            config.validate().map_err(GatewayError::from)?;
            Ok(Box::new(HttpBackend::new(&config.backend)?))
        }
        None => Ok(Box::new(shared.clone())),
    }
}

type SimNode = Node<EtherRadio, Box<dyn BlobStore>>;

fn build_nodes(
    args: &Args,
    ether: &Arc<Ether>,
    delivery: &DeliveryConfig,
) -> Result<Vec<SimNode>, SimError> {
    let mut nodes = Vec::with_capacity(usize::from(args.nodes));
    let mut next_id = 1u8;

    for index in 0..args.nodes {
        let dual = args.dual && index + 1 == args.nodes;
        let config = if dual {
            NodeConfig::dual([next_id, next_id + 1], delivery.clone())
        } else {
            NodeConfig::single(next_id, delivery.clone())
        };

        let rangers: Vec<Box<dyn Ranger>> = config
            .sensors
            .iter()
            .map(|sensor| {
                let profile = TankProfile {
                    initial_fill: 0.3 + 0.15 * f32::from(sensor.node_id % 4),
                    leak: if sensor.node_id == 1 {
                        args.leak_at.map(|at| (at, 120.0))
                    } else {
                        None
                    },
                    ..TankProfile::default()
                };
                let seed = args.seed.wrapping_add(u64::from(sensor.node_id));
                Box::new(SimulatedTank::new(TankConfig::default(), profile, seed)) as Box<dyn Ranger>
            })
            .collect();
        next_id += config.sensors.len() as u8;

        let acks = Arc::new(AckSlot::new());
        let radio = ether.attach(node_address(index), acks.handler());
        let store = open_store(args, &format!("node{}", index + 1))?;
        let node = Node::new(config, radio, acks, store, rangers)?;
        info!(
            "node device {} at {} hosting {} sensor(s)",
            index + 1,
            node.address(),
            node.channels().len()
        );
        nodes.push(node);
    }
    Ok(nodes)
}

fn run(args: Args) -> Result<(), SimError> {
    if !(1..=3).contains(&args.gateways) {
        return Err(SimError::Args("--gateways must be between 1 and 3".to_string()));
    }
    if args.nodes == 0 || args.nodes > 100 {
        return Err(SimError::Args("--nodes must be between 1 and 100".to_string()));
    }
    if args.outage.is_some() && args.backend_url.is_some() {
        warn!("--outage only applies to the in-memory backend, ignoring");
    }

    let ether = Ether::new();
    let records = MemoryBackend::new();

    let mut gateways: Vec<GatewayHandle<EtherRadio>> = Vec::new();
    for index in 0..args.gateways {
        let mut config = GatewayConfig::new()
            .with_gateway_id(index + 1)
            .with_retry_interval(Duration::from_millis(args.interval_ms.max(50) * 2));
        config.housekeeping_interval_ms = args.interval_ms.max(50) * 10;
        if let Some(url) = &args.backend_url {
            config = config.with_backend_url(url.clone());
        }

        let address = gateway_address(index);
        let store = open_store(&args, &format!("gateway{}", index + 1))?;
        let backend = make_backend(&args, &records)?;
        let handle = Gateway::new(config).start(
            |handler| ether.attach(address, handler),
            store,
            backend,
        )?;
        gateways.push(handle);
    }

    let delivery = DeliveryConfig {
        ack_timeout_ms: 50,
        initial_backoff_ms: 20,
        ..DeliveryConfig::with_gateways((0..args.gateways).map(gateway_address).collect())
    };
    let mut nodes = build_nodes(&args, &ether, &delivery)?;
    let mut compact = if args.compact {
        let gateway = gateway_address(args.gateways - 1);
        let seed = args.seed.wrapping_add(u64::from(COMPACT_NODE_ID));
        Some(CompactStation::new(&ether, node_address(args.nodes), gateway, seed)?)
    } else {
        None
    };

    for cycle in 0..args.cycles {
        let backend_up = !within(args.outage, cycle);
        records.set_online(backend_up);
        ether.set_online(gateway_address(0), !within(args.gateway_down, cycle));

        for node in nodes.iter_mut() {
            for report in node.run_cycle() {
                let p = &report.packet;
                if report.outcome.is_delivered() {
                    info!(
                        "cycle {:>3} node {} seq {}: {} cm ({}%), alert {}",
                        cycle, report.node_id, report.sequence, p.level_cm, p.percent, p.alert_type
                    );
                } else {
                    error!(
                        "cycle {:>3} node {} seq {}: not delivered",
                        cycle, report.node_id, report.sequence
                    );
                }
            }
        }
        if let Some(station) = compact.as_mut() {
            match station.report() {
                Ok(p) => info!(
                    "cycle {:>3} node {} compact: {} cm, flags {:#04x}",
                    cycle, p.node_id, p.distance_cm, p.flags
                ),
                Err(e) => error!("cycle {:>3} node {} compact: {}", cycle, COMPACT_NODE_ID, e),
            }
        }
        thread::sleep(Duration::from_millis(args.interval_ms));
    }

    // Give the forwarders a chance to replay what is still queued
    records.set_online(true);
    ether.set_online(gateway_address(0), true);
    thread::sleep(Duration::from_millis(args.interval_ms.max(50) * 4));

    for node in &nodes {
        info!("node {} delivery: {}", node.address(), node.stats().summary());
    }
    for gateway in gateways {
        let address = gateway.address();
        let stats = gateway.shutdown()?;
        info!("gateway {}: {}", address, stats.summary());
    }
    if args.backend_url.is_none() {
        let accepted = records.records();
        let backlog = accepted.iter().filter(|r| r["is_backlog"] == true).count();
        info!(
            "backend accepted {} record(s), {} replayed from offline queues",
            accepted.len(),
            backlog
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Aguada Simulator v{}", env!("CARGO_PKG_VERSION"));

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("10:20"), Ok((10, 20)));
        assert!(parse_range("20:10").is_err());
        assert!(parse_range("10").is_err());
        assert!(parse_range("a:b").is_err());
    }

    #[test]
    fn test_within() {
        assert!(within(Some((2, 4)), 2));
        assert!(!within(Some((2, 4)), 4));
        assert!(!within(None, 3));
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["aguada-sim", "--nodes", "3", "--dual", "--outage", "5:9"]);
        assert_eq!(args.nodes, 3);
        assert!(args.dual);
        assert_eq!(args.outage, Some((5, 9)));
        assert_eq!(args.gateways, 2);
    }

    #[test]
    fn test_short_simulation_runs() {
        let args = Args::parse_from([
            "aguada-sim",
            "--nodes",
            "2",
            "--dual",
            "--cycles",
            "3",
            "--interval-ms",
            "10",
            "--outage",
            "0:2",
            "--compact",
        ]);
        assert!(run(args).is_ok());
    }
}
