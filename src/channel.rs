// Aguada - Water-level telemetry protocol
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Radio channel abstraction
//!
//! This module provides the [`Radio`] trait implemented by the peer-to-peer
//! link driver, the [`AckSlot`] used to hand acknowledgements from the radio
//! receive context to the node control loop, and [`Ether`], an in-memory
//! shared medium for tests and simulation.

use crate::error::RadioError;
use crate::protocol::{AckPacket, AckStatus, MacAddress, MAX_FRAME_SIZE};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Channel every radio starts on
pub const DEFAULT_RADIO_CHANNEL: u8 = 11;

/// Callback invoked in the radio receive context: `(sender, rssi, bytes)`
pub type FrameHandler = Arc<dyn Fn(MacAddress, i8, &[u8]) + Send + Sync>;

/// Best-effort datagram radio with a peer registry
pub trait Radio: Send + Sync {
    /// Address of this station
    fn local_address(&self) -> MacAddress;

    /// Send a frame to a registered peer or to [`MacAddress::BROADCAST`]
    fn send(&self, dest: MacAddress, bytes: &[u8]) -> Result<(), RadioError>;

    /// Whether `addr` is in the peer registry
    fn is_peer(&self, addr: MacAddress) -> bool;

    /// Register `addr` as a peer
    fn add_peer(&self, addr: MacAddress) -> Result<(), RadioError>;

    /// Current radio channel
    fn channel(&self) -> u8;

    /// Tune to `channel`; stations only hear frames sent on their own channel
    fn set_channel(&self, channel: u8) -> Result<(), RadioError>;
}

impl<R: Radio + ?Sized> Radio for Arc<R> {
    fn local_address(&self) -> MacAddress {
        (**self).local_address()
    }

    fn send(&self, dest: MacAddress, bytes: &[u8]) -> Result<(), RadioError> {
        (**self).send(dest, bytes)
    }

    fn is_peer(&self, addr: MacAddress) -> bool {
        (**self).is_peer(addr)
    }

    fn add_peer(&self, addr: MacAddress) -> Result<(), RadioError> {
        (**self).add_peer(addr)
    }

    fn channel(&self) -> u8 {
        (**self).channel()
    }

    fn set_channel(&self, channel: u8) -> Result<(), RadioError> {
        (**self).set_channel(channel)
    }
}

const SLOT_PRESENT: u64 = 1 << 63;

/// Single-slot acknowledgement handoff.
///
/// The receive context stores the most recent acknowledgement with one
/// atomic write; the control loop takes it. Layout of the packed word:
/// bits 0-31 sequence, 32-39 node id, 40-47 gateway id, 48-55 signal
/// strength, 56-57 status, 63 present.
#[derive(Debug, Default)]
pub struct AckSlot {
    word: AtomicU64,
}

impl AckSlot {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    fn pack(ack: &AckPacket) -> u64 {
        SLOT_PRESENT
            | u64::from(ack.acked_sequence)
            | u64::from(ack.node_id) << 32
            | u64::from(ack.gateway_id) << 40
            | u64::from(ack.signal_strength as u8) << 48
            | u64::from(ack.status as u8 & 0x03) << 56
    }

    fn unpack(word: u64) -> Option<AckPacket> {
        if word & SLOT_PRESENT == 0 {
            return None;
        }
        Some(AckPacket {
            acked_sequence: word as u32,
            node_id: (word >> 32) as u8,
            gateway_id: (word >> 40) as u8,
            signal_strength: (word >> 48) as u8 as i8,
            status: AckStatus::from_u8(((word >> 56) & 0x03) as u8).unwrap_or(AckStatus::Error),
        })
    }

    /// Publish an acknowledgement, replacing any unconsumed one
    pub fn store(&self, ack: &AckPacket) {
        self.word.store(Self::pack(ack), Ordering::Release);
    }

    /// Take the pending acknowledgement, leaving the slot empty
    pub fn take(&self) -> Option<AckPacket> {
        Self::unpack(self.word.swap(0, Ordering::AcqRel))
    }

    /// Read the pending acknowledgement without consuming it
    pub fn peek(&self) -> Option<AckPacket> {
        Self::unpack(self.word.load(Ordering::Acquire))
    }

    /// Discard any pending acknowledgement
    pub fn clear(&self) {
        self.word.store(0, Ordering::Release);
    }

    /// Receive callback for a node radio: decodes acknowledgements into
    /// this slot and drops everything else
    pub fn handler(self: &Arc<Self>) -> FrameHandler {
        let slot = Arc::clone(self);
        Arc::new(move |src: MacAddress, _rssi: i8, bytes: &[u8]| {
            match AckPacket::from_bytes(bytes) {
                Ok(ack) => slot.store(&ack),
                Err(e) => log::trace!("ignoring {} byte frame from {}: {}", bytes.len(), src, e),
            }
        })
    }
}

/// Frame counters of the in-memory medium
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EtherStats {
    /// Frames handed to the medium
    pub frames_sent: u64,
    /// Frames delivered to a receive handler
    pub frames_delivered: u64,
    /// Frames lost (station offline or injected loss)
    pub frames_dropped: u64,
    /// Bytes delivered
    pub bytes_delivered: u64,
}

struct Station {
    handler: FrameHandler,
    channel: u8,
    online: bool,
    rssi: i8,
    drop_next: u32,
}

#[derive(Default)]
struct EtherState {
    stations: HashMap<MacAddress, Station>,
    stats: EtherStats,
}

/// In-memory shared radio medium.
///
/// Frames are delivered synchronously on the sender's thread, the way a
/// driver invokes its receive callback. Handlers are invoked with no lock
/// held, so a handler may transmit a reply.
#[derive(Default)]
pub struct Ether {
    state: Mutex<EtherState>,
}

impl Ether {
    /// Create an empty medium
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, EtherState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a station and return its radio
    pub fn attach(self: &Arc<Self>, address: MacAddress, handler: FrameHandler) -> EtherRadio {
        self.lock().stations.insert(
            address,
            Station {
                handler,
                channel: DEFAULT_RADIO_CHANNEL,
                online: true,
                rssi: -60,
                drop_next: 0,
            },
        );
        EtherRadio {
            ether: Arc::clone(self),
            address,
            peers: Mutex::new(HashSet::new()),
        }
    }

    /// Take a station off the air (frames to it are lost) or bring it back
    pub fn set_online(&self, address: MacAddress, online: bool) {
        if let Some(station) = self.lock().stations.get_mut(&address) {
            station.online = online;
        }
    }

    /// Signal strength reported to frames received by `address`
    pub fn set_rssi(&self, address: MacAddress, rssi: i8) {
        if let Some(station) = self.lock().stations.get_mut(&address) {
            station.rssi = rssi;
        }
    }

    /// Silently lose the next `count` frames addressed to `address`
    pub fn drop_next(&self, address: MacAddress, count: u32) {
        if let Some(station) = self.lock().stations.get_mut(&address) {
            station.drop_next = count;
        }
    }

    /// Snapshot of the frame counters
    pub fn stats(&self) -> EtherStats {
        self.lock().stats.clone()
    }

    fn transmit(&self, from: MacAddress, dest: MacAddress, bytes: &[u8]) -> Result<(), RadioError> {
        let mut deliveries: Vec<(FrameHandler, i8)> = Vec::new();
        {
            let mut state = self.lock();
            state.stats.frames_sent += 1;
            let channel = state
                .stations
                .get(&from)
                .map_or(DEFAULT_RADIO_CHANNEL, |s| s.channel);

            if dest == MacAddress::BROADCAST {
                for (addr, station) in state.stations.iter() {
                    if *addr != from && station.online && station.channel == channel {
                        deliveries.push((Arc::clone(&station.handler), station.rssi));
                    }
                }
            } else {
                match state.stations.get_mut(&dest) {
                    Some(station) if station.online && station.channel == channel => {
                        if station.drop_next > 0 {
                            station.drop_next -= 1;
                            state.stats.frames_dropped += 1;
                            return Ok(());
                        }
                        deliveries.push((Arc::clone(&station.handler), station.rssi));
                    }
                    _ => {
                        state.stats.frames_dropped += 1;
                        return Err(RadioError::SendFailed {
                            reason: format!("no link-layer ack from {}", dest),
                        });
                    }
                }
            }

            state.stats.frames_delivered += deliveries.len() as u64;
            state.stats.bytes_delivered += (deliveries.len() * bytes.len()) as u64;
        }

        for (handler, rssi) in deliveries {
            handler(from, rssi, bytes);
        }
        Ok(())
    }
}

/// A station's radio on an [`Ether`]
pub struct EtherRadio {
    ether: Arc<Ether>,
    address: MacAddress,
    peers: Mutex<HashSet<MacAddress>>,
}

impl EtherRadio {
    fn peers(&self) -> MutexGuard<'_, HashSet<MacAddress>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Radio for EtherRadio {
    fn local_address(&self) -> MacAddress {
        self.address
    }

    fn send(&self, dest: MacAddress, bytes: &[u8]) -> Result<(), RadioError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(RadioError::FrameTooLarge {
                size: bytes.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        if dest != MacAddress::BROADCAST && !self.is_peer(dest) {
            return Err(RadioError::UnknownPeer(dest.to_string()));
        }
        self.ether.transmit(self.address, dest, bytes)
    }

    fn is_peer(&self, addr: MacAddress) -> bool {
        self.peers().contains(&addr)
    }

    fn add_peer(&self, addr: MacAddress) -> Result<(), RadioError> {
        self.peers().insert(addr);
        Ok(())
    }

    fn channel(&self) -> u8 {
        self.ether
            .lock()
            .stations
            .get(&self.address)
            .map_or(DEFAULT_RADIO_CHANNEL, |s| s.channel)
    }

    fn set_channel(&self, channel: u8) -> Result<(), RadioError> {
        if !(1..=14).contains(&channel) {
            return Err(RadioError::InvalidChannel(channel));
        }
        if let Some(station) = self.ether.lock().stations.get_mut(&self.address) {
            station.channel = channel;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> MacAddress {
        MacAddress([0x02, 0, 0, 0, 0, last])
    }

    fn recorder() -> (FrameHandler, Arc<Mutex<Vec<(MacAddress, i8, Vec<u8>)>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let handler: FrameHandler = Arc::new(move |src, rssi, bytes: &[u8]| {
            sink.lock().unwrap().push((src, rssi, bytes.to_vec()));
        });
        (handler, log)
    }

    #[test]
    fn test_ack_slot_roundtrip() {
        let slot = AckSlot::new();
        assert_eq!(slot.take(), None);

        let ack = AckPacket {
            node_id: 3,
            acked_sequence: 0xFFFF_FFFF,
            signal_strength: -92,
            status: AckStatus::Queued,
            gateway_id: 7,
        };
        slot.store(&ack);
        assert_eq!(slot.peek(), Some(ack));
        assert_eq!(slot.take(), Some(ack));
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn test_ack_slot_keeps_latest() {
        let slot = AckSlot::new();
        slot.store(&AckPacket::new(1, 10, 0));
        slot.store(&AckPacket::new(1, 11, 0));
        assert_eq!(slot.take().map(|a| a.acked_sequence), Some(11));

        slot.store(&AckPacket::new(1, 12, 0));
        slot.clear();
        assert_eq!(slot.peek(), None);
    }

    #[test]
    fn test_ack_slot_handler_filters_frames() {
        let slot = Arc::new(AckSlot::new());
        let handler = slot.handler();

        handler(addr(9), -40, &[0x01, 0x02, 0x03]);
        assert_eq!(slot.peek(), None);

        let ack = AckPacket::new(2, 77, 1);
        handler(addr(9), -40, &ack.to_bytes());
        assert_eq!(slot.take(), Some(ack));
    }

    #[test]
    fn test_ether_unicast_requires_peer() {
        let ether = Ether::new();
        let (h1, _) = recorder();
        let (h2, log2) = recorder();
        let a = ether.attach(addr(1), h1);
        let _b = ether.attach(addr(2), h2);

        assert!(matches!(
            a.send(addr(2), b"hi"),
            Err(RadioError::UnknownPeer(_))
        ));

        a.add_peer(addr(2)).unwrap();
        assert!(a.is_peer(addr(2)));
        a.send(addr(2), b"hi").unwrap();

        let received = log2.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, addr(1));
        assert_eq!(received[0].1, -60);
        assert_eq!(received[0].2, b"hi".to_vec());
    }

    #[test]
    fn test_ether_broadcast_skips_sender() {
        let ether = Ether::new();
        let (h1, log1) = recorder();
        let (h2, log2) = recorder();
        let (h3, log3) = recorder();
        let a = ether.attach(addr(1), h1);
        let _b = ether.attach(addr(2), h2);
        let _c = ether.attach(addr(3), h3);

        a.send(MacAddress::BROADCAST, b"all").unwrap();
        assert!(log1.lock().unwrap().is_empty());
        assert_eq!(log2.lock().unwrap().len(), 1);
        assert_eq!(log3.lock().unwrap().len(), 1);
        assert_eq!(ether.stats().frames_delivered, 2);
    }

    #[test]
    fn test_ether_offline_and_loss() {
        let ether = Ether::new();
        let (h1, _) = recorder();
        let (h2, log2) = recorder();
        let a = ether.attach(addr(1), h1);
        let _b = ether.attach(addr(2), h2);
        a.add_peer(addr(2)).unwrap();

        ether.set_online(addr(2), false);
        assert!(matches!(
            a.send(addr(2), b"x"),
            Err(RadioError::SendFailed { .. })
        ));

        ether.set_online(addr(2), true);
        ether.drop_next(addr(2), 1);
        a.send(addr(2), b"lost").unwrap();
        a.send(addr(2), b"kept").unwrap();

        let received = log2.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].2, b"kept".to_vec());
        assert_eq!(ether.stats().frames_dropped, 2);
    }

    #[test]
    fn test_ether_stations_hear_only_their_channel() {
        let ether = Ether::new();
        let (h1, _) = recorder();
        let (h2, log2) = recorder();
        let (h3, log3) = recorder();
        let a = ether.attach(addr(1), h1);
        let b = ether.attach(addr(2), h2);
        let _c = ether.attach(addr(3), h3);
        a.add_peer(addr(2)).unwrap();
        assert_eq!(a.channel(), DEFAULT_RADIO_CHANNEL);

        b.set_channel(6).unwrap();
        assert_eq!(b.channel(), 6);
        assert!(matches!(
            a.send(addr(2), b"x"),
            Err(RadioError::SendFailed { .. })
        ));
        a.send(MacAddress::BROADCAST, b"all").unwrap();
        assert!(log2.lock().unwrap().is_empty());
        assert_eq!(log3.lock().unwrap().len(), 1);

        a.set_channel(6).unwrap();
        a.send(addr(2), b"x").unwrap();
        assert_eq!(log2.lock().unwrap().len(), 1);

        assert_eq!(a.set_channel(0), Err(RadioError::InvalidChannel(0)));
        assert_eq!(a.set_channel(15), Err(RadioError::InvalidChannel(15)));
        assert_eq!(a.channel(), 6);
    }

    #[test]
    fn test_ether_rejects_oversized_frame() {
        let ether = Ether::new();
        let (h1, _) = recorder();
        let a = ether.attach(addr(1), h1);
        let big = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            a.send(MacAddress::BROADCAST, &big),
            Err(RadioError::FrameTooLarge { size: 251, max: 250 })
        ));
    }

    #[test]
    fn test_handler_may_reply() {
        let ether = Ether::new();
        let (h1, log1) = recorder();
        let a = ether.attach(addr(1), h1);
        a.add_peer(addr(2)).unwrap();

        let reply_radio: Arc<Mutex<Option<Arc<EtherRadio>>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&reply_radio);
        let echo: FrameHandler = Arc::new(move |src, _rssi, bytes: &[u8]| {
            if let Some(radio) = slot.lock().unwrap().as_ref() {
                radio.add_peer(src).unwrap();
                radio.send(src, bytes).unwrap();
            }
        });
        let b = Arc::new(ether.attach(addr(2), echo));
        *reply_radio.lock().unwrap() = Some(Arc::clone(&b));

        a.send(addr(2), b"ping").unwrap();
        assert_eq!(log1.lock().unwrap()[0].2, b"ping".to_vec());
    }
}
