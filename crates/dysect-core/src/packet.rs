//! Tagged packet format for the overlay.
//!
//! Packets are big-endian. The envelope is:
//!
//! ```text
//! offset  size  field
//! 0       1     magic = 0x7E
//! 1       4     stream id (u32)
//! 5       4     probe id  (u32)
//! 9       4     count     (u32)   participating processes
//! 13      2     flags     (u16)   bit 0 = partial
//! 15      4     length    (u32)   body bytes, padding included
//! 19      5     padding             body starts 8-aligned at 24
//! ```
//!
//! The body is a sequence of aggregate records, each a 16-byte envelope
//! `{kind(u16) id(u32) count(u32) length(u32) pad(2)}` followed by the
//! payload, padded to the next 8-byte boundary.
//!
//! The top byte of the first word of every packet is the magic, so the
//! overlay can route dysect traffic by inspecting one word
//! ([`is_dysect_tag`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::aggregate::{AggId, AggKind, Aggregate};
use crate::error::{DysectError, Result};
use crate::wire::{pad_to, put_u16, put_u32, Reader};

/// Magic byte carried by every dysect packet.
pub const DYSECT_MAGIC: u8 = 0x7E;

/// Header size before body padding.
const HEADER_BYTES: usize = 19;

/// Body offset; the header is padded so records start 8-aligned.
const BODY_OFFSET: usize = 24;

/// Aggregate record envelope size.
const RECORD_ENVELOPE: usize = 16;

/// Routing check used by the overlay: accepts iff the top byte of the
/// packet's first word is the dysect magic.
#[must_use]
pub const fn is_dysect_tag(first_word: u32) -> bool {
    (first_word & 0xFF00_0000) == 0x7E00_0000
}

/// First big-endian word of an encoded packet, when present.
#[must_use]
pub fn first_word(bytes: &[u8]) -> Option<u32> {
    let word = bytes.get(..4)?;
    Some(u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
}

/// Envelope flag word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketFlags(pub u16);

impl PacketFlags {
    /// Quorum was missed; the packet carries partial participation.
    pub const PARTIAL: u16 = 1 << 0;

    /// No flags set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Flags for a partial emit.
    #[must_use]
    pub const fn partial() -> Self {
        Self(Self::PARTIAL)
    }

    /// True when the partial bit is set.
    #[must_use]
    pub const fn is_partial(self) -> bool {
        self.0 & Self::PARTIAL != 0
    }
}

/// One probe round's aggregated output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Overlay stream the probe reports on.
    pub stream_id: u32,
    /// Backend probe id (tree-position hash).
    pub probe_id: u32,
    /// Number of processes that participated.
    pub count: u32,
    /// Envelope flags.
    pub flags: PacketFlags,
    /// Aggregates keyed by id.
    pub aggregates: BTreeMap<AggId, Aggregate>,
}

impl Packet {
    /// Empty packet for a probe round.
    #[must_use]
    pub fn new(stream_id: u32, probe_id: u32) -> Self {
        Self {
            stream_id,
            probe_id,
            count: 0,
            flags: PacketFlags::empty(),
            aggregates: BTreeMap::new(),
        }
    }

    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for agg in self.aggregates.values() {
            let mut payload = Vec::new();
            agg.encode_payload(&mut payload);

            put_u16(&mut body, agg.kind.to_u16());
            put_u32(&mut body, agg.id);
            put_u32(&mut body, agg.count);
            put_u32(&mut body, payload.len() as u32);
            body.extend_from_slice(&[0u8; 2]); // envelope pad to 16
            body.extend_from_slice(&payload);
            body.extend(std::iter::repeat_n(0u8, pad_to(payload.len(), 8)));
        }

        let mut out = Vec::with_capacity(BODY_OFFSET + body.len());
        out.push(DYSECT_MAGIC);
        put_u32(&mut out, self.stream_id);
        put_u32(&mut out, self.probe_id);
        put_u32(&mut out, self.count);
        put_u16(&mut out, self.flags.0);
        put_u32(&mut out, body.len() as u32);
        out.extend(std::iter::repeat_n(0u8, BODY_OFFSET - HEADER_BYTES));
        out.extend_from_slice(&body);
        out
    }

    /// Merge another packet of the same `(stream, probe)` into this one:
    /// aggregates merge per id, counts sum, and the partial flag is
    /// sticky. Aggregates whose id collides with a different kind are
    /// dropped — both sides — with a warning.
    pub fn merge(&mut self, other: Self) {
        debug_assert_eq!(self.stream_id, other.stream_id);
        debug_assert_eq!(self.probe_id, other.probe_id);

        self.count += other.count;
        self.flags.0 |= other.flags.0;

        let mut dropped = Vec::new();
        for (id, agg) in other.aggregates {
            match self.aggregates.get_mut(&id) {
                None => {
                    self.aggregates.insert(id, agg);
                }
                Some(existing) => {
                    if existing.merge(&agg).is_err() {
                        warn!(
                            id,
                            left = existing.kind.label(),
                            right = agg.kind.label(),
                            "aggregate kind mismatch while merging packets, dropping both"
                        );
                        dropped.push(id);
                    }
                }
            }
        }
        for id in dropped {
            self.aggregates.remove(&id);
        }
    }

    /// Decode wire bytes.
    ///
    /// Records whose id collides with a different kind are dropped — both
    /// sides — with a warning; the rest of the packet survives.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);

        let magic = r.u8()?;
        if magic != DYSECT_MAGIC {
            return Err(DysectError::MalformedPacket(format!(
                "bad magic {magic:#04x}"
            )));
        }
        let stream_id = r.u32()?;
        let probe_id = r.u32()?;
        let count = r.u32()?;
        let flags = PacketFlags(r.u16()?);
        let length = r.u32()? as usize;
        r.skip(BODY_OFFSET - HEADER_BYTES)?;

        if length > r.remaining() {
            return Err(DysectError::MalformedPacket(format!(
                "body length {length} overruns buffer ({} left)",
                r.remaining()
            )));
        }

        let body = r.take(length)?;
        let mut aggregates: BTreeMap<AggId, Aggregate> = BTreeMap::new();
        let mut dropped: Vec<AggId> = Vec::new();
        let mut br = Reader::new(body);

        while br.remaining() > 0 {
            if br.remaining() < RECORD_ENVELOPE {
                return Err(DysectError::MalformedPacket(format!(
                    "{} trailing bytes where a record envelope was expected",
                    br.remaining()
                )));
            }
            let raw_kind = br.u16()?;
            let id = br.u32()?;
            let agg_count = br.u32()?;
            let payload_len = br.u32()? as usize;
            br.skip(2)?; // envelope pad

            let kind = AggKind::from_u16(raw_kind).ok_or_else(|| {
                DysectError::MalformedPacket(format!("unknown aggregate kind {raw_kind}"))
            })?;
            let payload = br.take(payload_len)?;
            br.skip(pad_to(payload_len, 8))?;

            let agg = Aggregate::decode_payload(kind, id, agg_count, payload)?;

            match aggregates.get_mut(&id) {
                None => {
                    aggregates.insert(id, agg);
                }
                Some(existing) if existing.kind == kind => {
                    existing.merge(&agg)?;
                }
                Some(existing) => {
                    warn!(
                        id,
                        left = existing.kind.label(),
                        right = kind.label(),
                        "aggregate kind mismatch, dropping both"
                    );
                    dropped.push(id);
                }
            }
        }

        for id in dropped {
            aggregates.remove(&id);
        }

        Ok(Self {
            stream_id,
            probe_id,
            count,
            flags,
            aggregates,
        })
    }
}
