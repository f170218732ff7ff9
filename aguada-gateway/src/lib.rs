// Aguada Gateway - Receive, acknowledge and forward
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Aguada Gateway - Receive, acknowledge and forward
//!
//! Gateway side of the Aguada telemetry network. Frames arriving from sensor
//! nodes are validated, stamped, acknowledged on the spot and forwarded to
//! an HTTP backend. While the backend is unreachable packets are kept in a
//! durable offline queue and replayed in arrival order once it returns.
//!
//! ## Features
//!
//! - **Non-blocking receive path**: decode, enrich, acknowledge, enqueue
//! - **Durable offline queue**: CRC-protected circular buffer that survives restarts
//! - **Ordered replay**: backlog first, head popped only after the backend accepted it
//! - **Bounded retries**: a circuit breaker paces requests to a failing backend
//!
//! ## Quick Start
//!
//! ```rust
//! use aguada::{Ether, MacAddress, MemoryStore, TelemetryPacket};
//! use aguada_gateway::{Gateway, GatewayConfig, MemoryBackend};
//!
//! let ether = Ether::new();
//! let backend = MemoryBackend::new();
//! let gw_addr = MacAddress::new([0x24, 0x6F, 0x28, 0, 0, 1]);
//!
//! let gateway = Gateway::new(GatewayConfig::default())
//!     .start(
//!         |handler| ether.attach(gw_addr, handler),
//!         MemoryStore::new(),
//!         backend.clone(),
//!     )
//!     .unwrap();
//!
//! let node = MacAddress::new([0x24, 0x6F, 0x28, 0, 0, 4]);
//! gateway.on_frame(node, -55, &TelemetryPacket::new(4, node, 1).to_bytes());
//!
//! let stats = gateway.shutdown().unwrap();
//! assert_eq!(stats.parsed, 1);
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  radio ──► Receiver::on_frame ──ack──► node
//!                 │ try_send
//!                 ▼
//!        [inbound queue, 20] ──► processing thread (log, housekeeping)
//!                                      │
//!                                      ▼
//!                        [forward queue, 20] ──► forwarder thread
//!                                                   │        ▲
//!                                            POST   ▼        │ replay
//!                                               backend   OfflineQueue
//! ```

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod gateway;
pub mod packet;
pub mod processing;
pub mod queue;
pub mod receive;

pub use backend::{Backend, HttpBackend, MemoryBackend};
pub use clock::{Clock, GatewayTime, ManualClock, SystemClock};
pub use config::{BackendConfig, GatewayConfig};
pub use error::{GatewayError, Result};
pub use forwarder::Forwarder;
pub use gateway::{Gateway, GatewayHandle};
pub use packet::{DataPacket, Envelope};
pub use processing::ProcessingConfig;
pub use queue::OfflineQueue;
pub use receive::Receiver;
