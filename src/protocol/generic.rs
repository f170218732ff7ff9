// Aguada - Water-level telemetry protocol
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Generic key-value packet
//!
//! Variable-length packet for nodes that report arbitrary labelled values.
//!
//! # Format
//!
//! ```text
//! [magic:1][version:1][node_id:1][mac:6][seq:4][pair_count:1]
//! pair_count × [label_len:1][label][type:1][value_len:1][value]
//! [rssi:1][gateway_ts:4]
//! ```
//!
//! The encoder tracks the encoded size as pairs are added and refuses any
//! pair that would push the packet past [`MAX_FRAME_SIZE`].

use super::{MacAddress, Reader, MAX_FRAME_SIZE};
use crate::error::{DecodeError, EncodeError};
use std::fmt;

/// Generic packet magic byte
pub const GENERIC_MAGIC: u8 = 0xDA;

/// Generic packet format version
pub const GENERIC_VERSION: u8 = 2;

/// Maximum number of pairs per packet
pub const MAX_PAIRS: usize = 10;

/// Maximum label length in bytes
pub const MAX_LABEL_LEN: usize = 31;

/// Maximum string value length in bytes
pub const MAX_STRING_LEN: usize = 31;

/// Fixed header size
pub const HEADER_SIZE: usize = 14;

/// Gateway trailer size (signal strength + timestamp)
pub const TRAILER_SIZE: usize = 5;

/// Wire type tag of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    Int8 = 0x01,
    UInt8 = 0x02,
    Int16 = 0x03,
    UInt16 = 0x04,
    Int32 = 0x05,
    UInt32 = 0x06,
    Float32 = 0x07,
    Bool = 0x08,
    Text = 0x09,
}

impl ValueType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ValueType::Int8),
            0x02 => Some(ValueType::UInt8),
            0x03 => Some(ValueType::Int16),
            0x04 => Some(ValueType::UInt16),
            0x05 => Some(ValueType::Int32),
            0x06 => Some(ValueType::UInt32),
            0x07 => Some(ValueType::Float32),
            0x08 => Some(ValueType::Bool),
            0x09 => Some(ValueType::Text),
            _ => None,
        }
    }

    /// Encoded width for fixed-size types, `None` for text
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            ValueType::Int8 | ValueType::UInt8 | ValueType::Bool => Some(1),
            ValueType::Int16 | ValueType::UInt16 => Some(2),
            ValueType::Int32 | ValueType::UInt32 | ValueType::Float32 => Some(4),
            ValueType::Text => None,
        }
    }
}

/// A typed value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Float32(f32),
    Bool(bool),
    Text(String),
}

impl Value {
    /// Wire type tag
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Int8(_) => ValueType::Int8,
            Value::UInt8(_) => ValueType::UInt8,
            Value::Int16(_) => ValueType::Int16,
            Value::UInt16(_) => ValueType::UInt16,
            Value::Int32(_) => ValueType::Int32,
            Value::UInt32(_) => ValueType::UInt32,
            Value::Float32(_) => ValueType::Float32,
            Value::Bool(_) => ValueType::Bool,
            Value::Text(_) => ValueType::Text,
        }
    }

    /// Encoded length of the value bytes
    pub fn encoded_len(&self) -> usize {
        match self {
            Value::Text(s) => s.len(),
            other => other.value_type().fixed_width().unwrap_or(0),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int8(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::UInt8(v) => out.push(*v),
            Value::Int16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::UInt16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::UInt32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Float32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Bool(v) => out.push(u8::from(*v)),
            Value::Text(s) => out.extend_from_slice(s.as_bytes()),
        }
    }

    fn read(kind: ValueType, r: &mut Reader<'_>, len: usize) -> Result<Self, DecodeError> {
        let offset = r.position();
        if let Some(width) = kind.fixed_width() {
            if width != len {
                return Err(DecodeError::BadField {
                    offset,
                    reason: format!("{:?} value must be {} bytes, got {}", kind, width, len),
                });
            }
        }

        let value = match kind {
            ValueType::Int8 => Value::Int8(r.i8()?),
            ValueType::UInt8 => Value::UInt8(r.u8()?),
            ValueType::Int16 => Value::Int16(r.i16()?),
            ValueType::UInt16 => Value::UInt16(r.u16()?),
            ValueType::Int32 => Value::Int32(r.i32()?),
            ValueType::UInt32 => Value::UInt32(r.u32()?),
            ValueType::Float32 => Value::Float32(r.f32()?),
            ValueType::Bool => Value::Bool(r.u8()? != 0),
            ValueType::Text => {
                if len > MAX_STRING_LEN {
                    return Err(DecodeError::BadField {
                        offset,
                        reason: format!("string of {} bytes exceeds {}", len, MAX_STRING_LEN),
                    });
                }
                let raw = r.take(len)?;
                let text = std::str::from_utf8(raw).map_err(|_| DecodeError::BadField {
                    offset,
                    reason: "string is not valid UTF-8".to_string(),
                })?;
                Value::Text(text.to_string())
            }
        };
        Ok(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int8(v) => write!(f, "{}", v),
            Value::UInt8(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::UInt16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::Float32(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{:?}", s),
        }
    }
}

/// A labelled value
#[derive(Debug, Clone, PartialEq)]
pub struct DataPair {
    pub label: String,
    pub value: Value,
}

impl DataPair {
    /// Encoded size of this pair including its length and type bytes
    pub fn encoded_len(&self) -> usize {
        1 + self.label.len() + 2 + self.value.encoded_len()
    }

    fn validate(&self) -> Result<(), EncodeError> {
        if self.label.len() > MAX_LABEL_LEN {
            return Err(EncodeError::LabelTooLong {
                len: self.label.len(),
                max: MAX_LABEL_LEN,
            });
        }
        if let Value::Text(s) = &self.value {
            if s.len() > MAX_STRING_LEN {
                return Err(EncodeError::ValueTooLong {
                    len: s.len(),
                    max: MAX_STRING_LEN,
                });
            }
        }
        Ok(())
    }
}

/// Variable key-value measurement packet
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenericPacket {
    pub node_id: u8,
    pub source_address: MacAddress,
    pub sequence: u32,
    pub pairs: Vec<DataPair>,
    /// Filled by the gateway
    pub signal_strength: i8,
    /// Filled by the gateway
    pub gateway_timestamp: u32,
}

impl GenericPacket {
    /// Encoded size of the packet
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.pairs.iter().map(DataPair::encoded_len).sum::<usize>() + TRAILER_SIZE
    }

    /// Look up a value by label
    pub fn get(&self, label: &str) -> Option<&Value> {
        self.pairs
            .iter()
            .find(|p| p.label == label)
            .map(|p| &p.value)
    }

    /// Serialize, re-checking every encoder limit
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        if self.pairs.len() > MAX_PAIRS {
            return Err(EncodeError::TooManyPairs { max: MAX_PAIRS });
        }
        for pair in &self.pairs {
            pair.validate()?;
        }
        let size = self.encoded_len();
        if size > MAX_FRAME_SIZE {
            return Err(EncodeError::PayloadTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut out = Vec::with_capacity(size);
        out.push(GENERIC_MAGIC);
        out.push(GENERIC_VERSION);
        out.push(self.node_id);
        out.extend_from_slice(&self.source_address.0);
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.push(self.pairs.len() as u8);

        for pair in &self.pairs {
            out.push(pair.label.len() as u8);
            out.extend_from_slice(pair.label.as_bytes());
            out.push(pair.value.value_type() as u8);
            out.push(pair.value.encoded_len() as u8);
            pair.value.write(&mut out);
        }

        out.extend_from_slice(&self.signal_strength.to_le_bytes());
        out.extend_from_slice(&self.gateway_timestamp.to_le_bytes());
        Ok(out)
    }

    /// Deserialize from a received buffer
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(DecodeError::BadLength {
                expected: MAX_FRAME_SIZE,
                actual: bytes.len(),
            });
        }

        let mut r = Reader::new(bytes);
        let magic = r.u8()?;
        if magic != GENERIC_MAGIC {
            return Err(DecodeError::BadMagic {
                expected: GENERIC_MAGIC,
                actual: magic,
            });
        }
        let version = r.u8()?;
        if version != GENERIC_VERSION {
            return Err(DecodeError::BadVersion {
                expected: GENERIC_VERSION,
                actual: version,
            });
        }

        let node_id = r.u8()?;
        let source_address = MacAddress(r.array()?);
        let sequence = r.u32()?;

        let offset = r.position();
        let pair_count = r.u8()? as usize;
        if pair_count > MAX_PAIRS {
            return Err(DecodeError::BadField {
                offset,
                reason: format!("{} pairs exceeds maximum {}", pair_count, MAX_PAIRS),
            });
        }

        let mut pairs = Vec::with_capacity(pair_count);
        for _ in 0..pair_count {
            let offset = r.position();
            let label_len = r.u8()? as usize;
            if label_len > MAX_LABEL_LEN {
                return Err(DecodeError::BadField {
                    offset,
                    reason: format!("label of {} bytes exceeds {}", label_len, MAX_LABEL_LEN),
                });
            }
            let label = std::str::from_utf8(r.take(label_len)?)
                .map_err(|_| DecodeError::BadField {
                    offset: offset + 1,
                    reason: "label is not valid UTF-8".to_string(),
                })?
                .to_string();

            let offset = r.position();
            let tag = r.u8()?;
            let kind = ValueType::from_u8(tag).ok_or_else(|| DecodeError::BadField {
                offset,
                reason: format!("unknown value type 0x{:02x}", tag),
            })?;
            let value_len = r.u8()? as usize;
            let value = Value::read(kind, &mut r, value_len)?;
            pairs.push(DataPair { label, value });
        }

        let signal_strength = r.i8()?;
        let gateway_timestamp = r.u32()?;

        if r.remaining() != 0 {
            return Err(DecodeError::BadLength {
                expected: r.position(),
                actual: bytes.len(),
            });
        }

        Ok(Self {
            node_id,
            source_address,
            sequence,
            pairs,
            signal_strength,
            gateway_timestamp,
        })
    }
}

/// Incremental builder enforcing the encoder limits as pairs are added
#[derive(Debug, Clone)]
pub struct GenericPacketBuilder {
    packet: GenericPacket,
    size: usize,
}

impl GenericPacketBuilder {
    /// Start a packet for the given node and sequence
    pub fn new(node_id: u8, source_address: MacAddress, sequence: u32) -> Self {
        Self {
            packet: GenericPacket {
                node_id,
                source_address,
                sequence,
                ..Default::default()
            },
            size: HEADER_SIZE + TRAILER_SIZE,
        }
    }

    /// Current encoded size
    pub fn encoded_len(&self) -> usize {
        self.size
    }

    /// Bytes still available under the frame ceiling
    pub fn remaining(&self) -> usize {
        MAX_FRAME_SIZE - self.size
    }

    /// Number of pairs added so far
    pub fn pair_count(&self) -> usize {
        self.packet.pairs.len()
    }

    /// Add a pair, or refuse it if any limit would be exceeded.
    ///
    /// A refused pair leaves the builder unchanged.
    pub fn push(&mut self, label: impl Into<String>, value: Value) -> Result<&mut Self, EncodeError> {
        if self.packet.pairs.len() >= MAX_PAIRS {
            return Err(EncodeError::TooManyPairs { max: MAX_PAIRS });
        }
        let pair = DataPair {
            label: label.into(),
            value,
        };
        pair.validate()?;

        let new_size = self.size + pair.encoded_len();
        if new_size > MAX_FRAME_SIZE {
            return Err(EncodeError::PayloadTooLarge {
                size: new_size,
                max: MAX_FRAME_SIZE,
            });
        }

        self.size = new_size;
        self.packet.pairs.push(pair);
        Ok(self)
    }

    /// Finish building
    pub fn build(self) -> GenericPacket {
        self.packet
    }
}
