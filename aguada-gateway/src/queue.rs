// Aguada Gateway - Receive, acknowledge and forward
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Durable FIFO offline queue
//!
//! A circular buffer of packets kept in a [`BlobStore`] so that a gateway
//! restart resumes exactly where it left off.
//!
//! ## Layout
//!
//! ```text
//! oq/meta      "OQ" | version | 0 | capacity:u32 | head:u32 | tail:u32 | count:u32 | base:u32 | crc32
//! oq/slot/<k>  flags:u8 | len:u16 | packet bytes | crc32
//! ```
//!
//! All integers are little-endian; checksums are CRC-32/ISO-HDLC over the
//! preceding bytes. The ring has `capacity + 1` slots stored under keys
//! `base .. base + capacity + 1`, so the slot written by a push is never a
//! live one: the slot is written first and the metadata commit makes it
//! visible. A crash between the two leaves the queue in its pre-push state.
//!
//! A capacity change copies the surviving entries into a key range disjoint
//! from the current ring and then commits metadata pointing at it. Until
//! that commit the old ring is untouched.

use crate::packet::{DataPacket, Envelope};
use aguada::{BlobStore, StorageError};
use crc::{Crc, CRC_32_ISO_HDLC};
use log::{debug, warn};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Metadata key
pub const META_KEY: &str = "oq/meta";

const META_MAGIC: [u8; 2] = *b"OQ";
const META_VERSION: u8 = 2;
const META_SIZE: usize = 28;
const SLOT_OVERHEAD: usize = 7;
const FLAG_TIME_SYNCED: u8 = 0x01;

/// Largest supported queue capacity
pub const MAX_CAPACITY: u32 = 1 << 20;

// Migration never places a ring beyond two maximal rings
const MAX_BASE: u32 = 2 * (MAX_CAPACITY + 1);

/// Storage key of slot number `key_index`
pub fn slot_key(key_index: u32) -> String {
    format!("oq/slot/{}", key_index)
}

fn checksum(bytes: &[u8]) -> [u8; 4] {
    CRC32.checksum(bytes).to_le_bytes()
}

fn verify(bytes: &[u8]) -> Option<&[u8]> {
    let split = bytes.len().checked_sub(4)?;
    let (body, crc) = bytes.split_at(split);
    (checksum(body).as_slice() == crc).then_some(body)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Meta {
    capacity: u32,
    head: u32,
    tail: u32,
    count: u32,
    base: u32,
}

impl Meta {
    fn empty(capacity: u32) -> Self {
        Self {
            capacity,
            head: 0,
            tail: 0,
            count: 0,
            base: 0,
        }
    }

    /// Physical slots in the ring; callers keep `capacity <= MAX_CAPACITY`
    fn slots(&self) -> u32 {
        self.capacity + 1
    }

    fn key(&self, index: u32) -> String {
        slot_key(self.base + index)
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(META_SIZE);
        out.extend_from_slice(&META_MAGIC);
        out.push(META_VERSION);
        out.push(0);
        out.extend_from_slice(&self.capacity.to_le_bytes());
        out.extend_from_slice(&self.head.to_le_bytes());
        out.extend_from_slice(&self.tail.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.base.to_le_bytes());
        let crc = checksum(&out);
        out.extend_from_slice(&crc);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() != META_SIZE {
            return Err(format!("expected {} bytes, got {}", META_SIZE, bytes.len()));
        }
        let body = verify(bytes).ok_or("checksum mismatch")?;
        if body[0..2] != META_MAGIC {
            return Err("bad magic".to_string());
        }
        if body[2] != META_VERSION {
            return Err(format!("unsupported version {}", body[2]));
        }
        let meta = Self {
            capacity: read_u32(body, 4),
            head: read_u32(body, 8),
            tail: read_u32(body, 12),
            count: read_u32(body, 16),
            base: read_u32(body, 20),
        };
        if meta.capacity == 0 || meta.capacity > MAX_CAPACITY || meta.base > MAX_BASE {
            return Err(format!("out of range {:?}", meta));
        }
        if meta.head >= meta.slots()
            || meta.tail >= meta.slots()
            || meta.count > meta.capacity
            || (meta.head + meta.count) % meta.slots() != meta.tail
        {
            return Err(format!("inconsistent pointers {:?}", meta));
        }
        Ok(meta)
    }
}

fn encode_slot(envelope: &Envelope) -> Vec<u8> {
    let bytes = envelope.packet.to_bytes();
    let mut out = Vec::with_capacity(bytes.len() + SLOT_OVERHEAD);
    out.push(if envelope.time_synced { FLAG_TIME_SYNCED } else { 0 });
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(&bytes);
    let crc = checksum(&out);
    out.extend_from_slice(&crc);
    out
}

fn decode_slot(bytes: &[u8]) -> Result<Envelope, String> {
    let body = verify(bytes).ok_or("checksum mismatch")?;
    if body.len() < 3 {
        return Err("truncated slot".to_string());
    }
    let len = usize::from(u16::from_le_bytes([body[1], body[2]]));
    if body.len() != 3 + len {
        return Err(format!("length {} does not match slot size", len));
    }
    let packet = DataPacket::from_bytes(&body[3..]).map_err(|e| e.to_string())?;
    Ok(Envelope::new(packet, body[0] & FLAG_TIME_SYNCED != 0))
}

/// Durable FIFO of envelopes awaiting the backend
pub struct OfflineQueue<S: BlobStore> {
    store: S,
    meta: Meta,
}

impl<S: BlobStore> OfflineQueue<S> {
    /// Open the queue stored in `store`, creating it if absent.
    ///
    /// Unreadable metadata resets the queue. A stored queue with a different
    /// capacity is migrated, keeping the newest entries.
    pub fn open(store: S, capacity: u32) -> Result<Self, StorageError> {
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(StorageError::Corrupt {
                key: META_KEY.to_string(),
                reason: format!("capacity must be between 1 and {}", MAX_CAPACITY),
            });
        }

        let meta = match store.get_blob(META_KEY)? {
            None => Meta::empty(capacity),
            Some(bytes) => match Meta::decode(&bytes) {
                Ok(meta) => meta,
                Err(reason) => {
                    warn!("Offline queue metadata unreadable ({}), starting empty", reason);
                    Meta::empty(capacity)
                }
            },
        };

        let mut queue = Self { store, meta };
        if meta.capacity != capacity {
            queue.migrate(capacity)?;
        }
        if queue.meta.count > 0 {
            debug!("Offline queue opened with {} pending", queue.meta.count);
        }
        Ok(queue)
    }

    fn migrate(&mut self, capacity: u32) -> Result<(), StorageError> {
        let mut entries = Vec::with_capacity(self.meta.count as usize);
        let mut index = self.meta.head;
        for _ in 0..self.meta.count {
            if let Some(envelope) = self.read_slot(index)? {
                entries.push(envelope);
            }
            index = (index + 1) % self.meta.slots();
        }

        let keep_from = entries.len().saturating_sub(capacity as usize);
        if keep_from > 0 {
            warn!(
                "Offline queue shrunk from {} to {}: dropping {} oldest entries",
                self.meta.capacity, capacity, keep_from
            );
        }

        let old = self.meta;
        let mut meta = Meta::empty(capacity);
        // Below the old ring if it fits there, otherwise right after it
        meta.base = if meta.slots() <= old.base {
            0
        } else {
            old.base + old.slots()
        };
        for envelope in &entries[keep_from..] {
            self.store.set_blob(&meta.key(meta.tail), &encode_slot(envelope))?;
            meta.tail += 1;
            meta.count += 1;
        }
        self.commit(meta)?;

        for index in 0..old.slots() {
            if let Err(e) = self.store.remove_blob(&old.key(index)) {
                warn!("Offline queue could not remove stale slot: {}", e);
                break;
            }
        }
        Ok(())
    }

    fn read_slot(&self, index: u32) -> Result<Option<Envelope>, StorageError> {
        let key = self.meta.key(index);
        match self.store.get_blob(&key)? {
            None => {
                warn!("Offline queue slot {} missing", index);
                Ok(None)
            }
            Some(bytes) => match decode_slot(&bytes) {
                Ok(envelope) => Ok(Some(envelope)),
                Err(reason) => {
                    warn!("Offline queue slot {} corrupt: {}", index, reason);
                    Ok(None)
                }
            },
        }
    }

    fn commit(&mut self, meta: Meta) -> Result<(), StorageError> {
        self.store.set_blob(META_KEY, &meta.encode())?;
        self.meta = meta;
        Ok(())
    }

    /// Append at the tail. Returns `true` if the oldest entry was evicted
    /// to make room.
    pub fn push(&mut self, envelope: &Envelope) -> Result<bool, StorageError> {
        let mut next = self.meta;
        let evicted = next.count == next.capacity;
        if evicted {
            next.head = (next.head + 1) % next.slots();
        } else {
            next.count += 1;
        }
        next.tail = (next.tail + 1) % next.slots();

        self.store
            .set_blob(&self.meta.key(self.meta.tail), &encode_slot(envelope))?;
        self.commit(next)?;

        if evicted {
            warn!(
                "Offline queue full ({}): evicted oldest entry",
                self.meta.capacity
            );
        }
        Ok(evicted)
    }

    /// Oldest entry, if any. Corrupt entries at the head are skipped.
    pub fn peek(&mut self) -> Result<Option<Envelope>, StorageError> {
        while self.meta.count > 0 {
            if let Some(envelope) = self.read_slot(self.meta.head)? {
                return Ok(Some(envelope));
            }
            self.pop()?;
        }
        Ok(None)
    }

    /// Remove the oldest entry
    pub fn pop(&mut self) -> Result<(), StorageError> {
        if self.meta.count == 0 {
            return Ok(());
        }
        let mut next = self.meta;
        next.head = (next.head + 1) % next.slots();
        next.count -= 1;
        self.commit(next)
    }

    pub fn len(&self) -> usize {
        self.meta.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.meta.count == 0
    }

    pub fn capacity(&self) -> u32 {
        self.meta.capacity
    }

    /// Underlying store
    pub fn store(&self) -> &S {
        &self.store
    }
}
