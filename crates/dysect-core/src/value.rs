//! Typed polymorphic scalar.
//!
//! [`Value`] is the unit of data read from a stopped target process and
//! folded into aggregates. The variant set is closed: none, bool, int,
//! long, float, double, pointer. Each variant has a stable wire tag byte
//! ([`ValueTag`]); the tag plus a fixed-width big-endian payload is the
//! on-wire form used inside aggregate payloads.
//!
//! Comparison and addition widen: anything long-like compares as `i64`,
//! anything double-like as `f64`. Mixed long/double comparisons go
//! through `f64`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{DysectError, Result};

/// Stable wire tag for each [`Value`] variant.
///
/// Tag bytes are part of the packet format and must remain fixed.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueTag {
    None = 0,
    Bool = 1,
    Int = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Pointer = 6,
}

impl ValueTag {
    /// Wire byte for this tag.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse a wire byte back into a tag.
    #[must_use]
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::None),
            1 => Some(Self::Bool),
            2 => Some(Self::Int),
            3 => Some(Self::Long),
            4 => Some(Self::Float),
            5 => Some(Self::Double),
            6 => Some(Self::Pointer),
            _ => None,
        }
    }

    /// Payload width in bytes for this tag.
    #[must_use]
    pub const fn payload_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::Bool => 1,
            Self::Int | Self::Float => 4,
            Self::Long | Self::Double | Self::Pointer => 8,
        }
    }

    /// Human-readable label for diagnostics.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Pointer => "pointer",
        }
    }
}

/// Tagged scalar read from a target process.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// No value (identity for sum-style folds).
    None,
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Pointer(u64),
}

impl Value {
    /// Wire tag of the active variant.
    #[must_use]
    pub const fn tag(&self) -> ValueTag {
        match self {
            Self::None => ValueTag::None,
            Self::Bool(_) => ValueTag::Bool,
            Self::Int(_) => ValueTag::Int,
            Self::Long(_) => ValueTag::Long,
            Self::Float(_) => ValueTag::Float,
            Self::Double(_) => ValueTag::Double,
            Self::Pointer(_) => ValueTag::Pointer,
        }
    }

    /// True when the value widens losslessly to `i64`.
    #[must_use]
    pub const fn is_long_like(&self) -> bool {
        matches!(
            self,
            Self::Bool(_) | Self::Int(_) | Self::Long(_) | Self::Pointer(_)
        )
    }

    /// True when the value widens to `f64`.
    #[must_use]
    pub const fn is_double_like(&self) -> bool {
        matches!(
            self,
            Self::Bool(_) | Self::Int(_) | Self::Long(_) | Self::Float(_) | Self::Double(_)
        )
    }

    /// Lossless widening to `i64` where the tag permits.
    #[must_use]
    pub fn as_long(&self) -> Option<i64> {
        match *self {
            Self::Bool(b) => Some(i64::from(b)),
            Self::Int(i) => Some(i64::from(i)),
            Self::Long(l) => Some(l),
            Self::Pointer(p) => i64::try_from(p).ok(),
            _ => None,
        }
    }

    /// Widening to `f64` where the tag permits.
    #[must_use]
    pub fn as_double(&self) -> Option<f64> {
        match *self {
            Self::Bool(b) => Some(f64::from(u8::from(b))),
            Self::Int(i) => Some(f64::from(i)),
            Self::Long(l) => Some(l as f64),
            Self::Float(f) => Some(f64::from(f)),
            Self::Double(d) => Some(d),
            _ => None,
        }
    }

    /// Numeric comparison with widening. Returns `None` when either side
    /// is `None`-tagged or the shapes are not comparable (e.g. pointer
    /// against double).
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::None, _) | (_, Self::None) => None,
            (Self::Pointer(a), Self::Pointer(b)) => Some(a.cmp(b)),
            _ => {
                if let (Some(a), Some(b)) = (self.as_long(), other.as_long()) {
                    return Some(a.cmp(&b));
                }
                let a = self.as_double()?;
                let b = other.as_double()?;
                a.partial_cmp(&b)
            }
        }
    }

    /// Addition used by sum-style aggregates. Widens to long when both
    /// sides are long-like, otherwise to double. `None` plus anything is
    /// the other operand.
    #[must_use]
    pub fn try_add(&self, other: &Self) -> Option<Self> {
        match (self, other) {
            (Self::None, v) | (v, Self::None) => Some(*v),
            _ if self.is_long_like() && other.is_long_like() => {
                Some(Self::Long(self.as_long()?.wrapping_add(other.as_long()?)))
            }
            _ => Some(Self::Double(self.as_double()? + other.as_double()?)),
        }
    }

    /// Append the wire form (tag byte + big-endian payload).
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.tag().to_u8());
        match *self {
            Self::None => {}
            Self::Bool(b) => out.push(u8::from(b)),
            Self::Int(i) => out.extend_from_slice(&i.to_be_bytes()),
            Self::Long(l) => out.extend_from_slice(&l.to_be_bytes()),
            Self::Float(f) => out.extend_from_slice(&f.to_be_bytes()),
            Self::Double(d) => out.extend_from_slice(&d.to_be_bytes()),
            Self::Pointer(p) => out.extend_from_slice(&p.to_be_bytes()),
        }
    }

    /// Decode a wire-form value from the front of `buf`. Returns the
    /// value and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let tag_byte = *buf
            .first()
            .ok_or_else(|| DysectError::MalformedPacket("empty value".into()))?;
        let tag = ValueTag::from_u8(tag_byte)
            .ok_or_else(|| DysectError::MalformedPacket(format!("bad value tag {tag_byte:#x}")))?;
        let need = tag.payload_len();
        let payload = buf
            .get(1..1 + need)
            .ok_or_else(|| DysectError::MalformedPacket("value payload overrun".into()))?;

        let fixed8 = |p: &[u8]| -> [u8; 8] { p.try_into().unwrap_or([0; 8]) };
        let fixed4 = |p: &[u8]| -> [u8; 4] { p.try_into().unwrap_or([0; 4]) };

        let value = match tag {
            ValueTag::None => Self::None,
            ValueTag::Bool => Self::Bool(payload[0] != 0),
            ValueTag::Int => Self::Int(i32::from_be_bytes(fixed4(payload))),
            ValueTag::Long => Self::Long(i64::from_be_bytes(fixed8(payload))),
            ValueTag::Float => Self::Float(f32::from_be_bytes(fixed4(payload))),
            ValueTag::Double => Self::Double(f64::from_be_bytes(fixed8(payload))),
            ValueTag::Pointer => Self::Pointer(u64::from_be_bytes(fixed8(payload))),
        };
        Ok((value, 1 + need))
    }

    /// Rendered form used by trace output.
    #[must_use]
    pub fn render(&self) -> String {
        match *self {
            Self::None => "<none>".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Long(l) => l.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Double(d) => d.to_string(),
            Self::Pointer(p) => format!("{p:#x}"),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}
