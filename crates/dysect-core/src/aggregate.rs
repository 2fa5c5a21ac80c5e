//! Aggregate kernel: the closed set of mergeable summaries.
//!
//! An aggregate is a compact summary of data collected at many target
//! processes. Merging is commutative and associative over aggregates of
//! equal `(kind, id)`, so interior overlay nodes can fold packets in any
//! arrival order. After a merge, `count` is the sum of both sides'
//! counts; the identity element for every kind has `count == 0`.
//!
//! | kind             | state                        | merge rule            |
//! |------------------|------------------------------|-----------------------|
//! | countSampled     | u64                          | a + b                 |
//! | min / max        | Value                        | pick extremum         |
//! | sum / avg        | Value (widened)              | value sum             |
//! | first / last     | Value + logical timestamp    | smaller / larger ts   |
//! | staticStr        | string                       | lexicographic min     |
//! | rankList         | RLE rank set                 | set union             |
//! | stackTraces      | frame-id prefix tree         | prefix merge          |
//! | describeVariable | map of sub-aggregates        | per-sub-id merge      |
//!
//! `describeVariable` is synthetic: it owns real sub-aggregates that are
//! serialized inline in its payload and reassembled by id on decode.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{DysectError, Result};
use crate::value::Value;
use crate::wire::{put_u16, put_u32, put_u64, Reader};

/// Aggregate identifier, unique per session.
pub type AggId = u32;

/// Allocator for aggregate ids, monotonically increasing per session.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AggIdGen {
    next: AggId,
}

impl AggIdGen {
    /// Allocate the next id.
    pub fn next_id(&mut self) -> AggId {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Wire discriminant for each aggregate kind.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggKind {
    CountSampled = 1,
    Min = 2,
    Max = 3,
    Sum = 4,
    Avg = 5,
    First = 6,
    Last = 7,
    StaticStr = 8,
    RankList = 9,
    StackTraces = 10,
    DescribeVariable = 11,
}

impl AggKind {
    /// Wire value.
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse a wire value.
    #[must_use]
    pub const fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::CountSampled),
            2 => Some(Self::Min),
            3 => Some(Self::Max),
            4 => Some(Self::Sum),
            5 => Some(Self::Avg),
            6 => Some(Self::First),
            7 => Some(Self::Last),
            8 => Some(Self::StaticStr),
            9 => Some(Self::RankList),
            10 => Some(Self::StackTraces),
            11 => Some(Self::DescribeVariable),
            _ => None,
        }
    }

    /// Diagnostic label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::CountSampled => "countSampled",
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::First => "first",
            Self::Last => "last",
            Self::StaticStr => "staticStr",
            Self::RankList => "rankList",
            Self::StackTraces => "stackTraces",
            Self::DescribeVariable => "describeVariable",
        }
    }
}

// ---------------------------------------------------------------------------
// RankSet
// ---------------------------------------------------------------------------

/// Run-length-encoded set of rank ids.
///
/// Ranges are sorted, non-overlapping, and coalesced: `[0,3] [7,7]`
/// renders as `0-3,7`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankSet {
    ranges: Vec<(u32, u32)>,
}

impl RankSet {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ranks in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges
            .iter()
            .map(|&(lo, hi)| (hi - lo) as usize + 1)
            .sum()
    }

    /// True when no ranks are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, rank: u32) -> bool {
        self.ranges.iter().any(|&(lo, hi)| lo <= rank && rank <= hi)
    }

    /// Insert a single rank.
    pub fn insert(&mut self, rank: u32) {
        self.insert_range(rank, rank);
    }

    /// Insert an inclusive range, coalescing neighbors.
    pub fn insert_range(&mut self, lo: u32, hi: u32) {
        debug_assert!(lo <= hi);
        self.ranges.push((lo, hi));
        self.normalize();
    }

    /// Set union.
    pub fn union(&mut self, other: &Self) {
        self.ranges.extend_from_slice(&other.ranges);
        self.normalize();
    }

    fn normalize(&mut self) {
        self.ranges.sort_unstable();
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(self.ranges.len());
        for &(lo, hi) in &self.ranges {
            match merged.last_mut() {
                // Adjacent or overlapping runs coalesce.
                Some(last) if u64::from(lo) <= u64::from(last.1) + 1 => {
                    last.1 = last.1.max(hi);
                }
                _ => merged.push((lo, hi)),
            }
        }
        self.ranges = merged;
    }

    /// The underlying RLE ranges.
    #[must_use]
    pub fn ranges(&self) -> &[(u32, u32)] {
        &self.ranges
    }

    /// Iterate over the member ranks.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().flat_map(|&(lo, hi)| lo..=hi)
    }

    /// Rendered form, e.g. `0-3,7`.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, &(lo, hi)) in self.ranges.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            if lo == hi {
                out.push_str(&lo.to_string());
            } else {
                out.push_str(&format!("{lo}-{hi}"));
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// TraceTree
// ---------------------------------------------------------------------------

/// One node of a merged stack-trace prefix tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceNode {
    /// Parent node index; `None` for roots.
    pub parent: Option<u32>,
    /// Frame identifier (content hash of the function name).
    pub frame_id: u64,
    /// How many walked stacks passed through this node.
    pub count: u32,
}

/// Prefix tree of frame ids with per-node counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceTree {
    nodes: Vec<TraceNode>,
}

impl TraceTree {
    /// Empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Node storage, index-addressed.
    #[must_use]
    pub fn nodes(&self) -> &[TraceNode] {
        &self.nodes
    }

    /// True when no stacks have been folded in.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn find_child(&self, parent: Option<u32>, frame_id: u64) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.parent == parent && n.frame_id == frame_id)
    }

    /// Fold one walked stack, outermost frame first.
    pub fn add_path(&mut self, frames: &[u64]) {
        let mut parent: Option<u32> = None;
        for &frame_id in frames {
            let idx = match self.find_child(parent, frame_id) {
                Some(idx) => {
                    self.nodes[idx].count += 1;
                    idx
                }
                None => {
                    self.nodes.push(TraceNode {
                        parent,
                        frame_id,
                        count: 1,
                    });
                    self.nodes.len() - 1
                }
            };
            parent = Some(idx as u32);
        }
    }

    /// Prefix-merge another tree; counts of shared prefixes sum.
    pub fn merge(&mut self, other: &Self) {
        // Map other-node index -> self-node index, built top-down.
        let mut mapping: Vec<u32> = Vec::with_capacity(other.nodes.len());
        for node in &other.nodes {
            let parent = node.parent.map(|p| mapping[p as usize]);
            let idx = match self.find_child(parent, node.frame_id) {
                Some(idx) => {
                    self.nodes[idx].count += node.count;
                    idx
                }
                None => {
                    self.nodes.push(TraceNode {
                        parent,
                        frame_id: node.frame_id,
                        count: node.count,
                    });
                    self.nodes.len() - 1
                }
            };
            mapping.push(idx as u32);
        }
    }

    /// Render the tree, one frame per line, indented by depth.
    #[must_use]
    pub fn render(&self, names: Option<&BTreeMap<u64, String>>) -> String {
        let mut out = String::new();
        self.render_children(None, 0, names, &mut out);
        out
    }

    fn render_children(
        &self,
        parent: Option<u32>,
        depth: usize,
        names: Option<&BTreeMap<u64, String>>,
        out: &mut String,
    ) {
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.parent != parent {
                continue;
            }
            let label = names
                .and_then(|table| table.get(&node.frame_id).cloned())
                .unwrap_or_else(|| format!("#{:016x}", node.frame_id));
            out.push_str(&format!(
                "{}{} x{}\n",
                "  ".repeat(depth),
                label,
                node.count
            ));
            self.render_children(Some(idx as u32), depth + 1, names, out);
        }
    }
}

/// FNV-1a hash of a function name; the frame id used on the wire.
#[must_use]
pub fn frame_id(name: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// ---------------------------------------------------------------------------
// Aggregate
// ---------------------------------------------------------------------------

/// Kind-specific aggregate state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggData {
    /// Total number of samples seen (kind `countSampled`).
    CountSampled { total: u64 },
    /// Current extremum (kinds `min` / `max`).
    Extremum { val: Value },
    /// Running sum, widened (kinds `sum` / `avg`).
    Sum { val: Value },
    /// Value plus the logical timestamp it was sampled at
    /// (kinds `first` / `last`).
    Stamped { val: Value, timestamp: u64 },
    /// Lexicographic-min string (kind `staticStr`).
    StaticStr { text: String },
    /// RLE rank set (kind `rankList`).
    RankList { ranks: RankSet },
    /// Merged stack prefix tree (kind `stackTraces`).
    StackTraces { tree: TraceTree },
    /// Synthetic bundle of sub-aggregates (kind `describeVariable`).
    DescribeVariable { subs: BTreeMap<AggId, Aggregate> },
}

/// A mergeable summary with wire identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    /// Kind discriminant; fixed for the lifetime of the id.
    pub kind: AggKind,
    /// Session-unique id; packets with the same id merge.
    pub id: AggId,
    /// Number of samples folded in.
    pub count: u32,
    /// Kind-specific state.
    pub data: AggData,
}

impl Aggregate {
    /// Identity element for a kind: `count == 0`, empty state.
    #[must_use]
    pub fn identity(kind: AggKind, id: AggId) -> Self {
        let data = match kind {
            AggKind::CountSampled => AggData::CountSampled { total: 0 },
            AggKind::Min | AggKind::Max => AggData::Extremum { val: Value::None },
            AggKind::Sum | AggKind::Avg => AggData::Sum { val: Value::None },
            AggKind::First | AggKind::Last => AggData::Stamped {
                val: Value::None,
                timestamp: 0,
            },
            AggKind::StaticStr => AggData::StaticStr {
                text: String::new(),
            },
            AggKind::RankList => AggData::RankList {
                ranks: RankSet::new(),
            },
            AggKind::StackTraces => AggData::StackTraces {
                tree: TraceTree::new(),
            },
            AggKind::DescribeVariable => AggData::DescribeVariable {
                subs: BTreeMap::new(),
            },
        };
        Self {
            kind,
            id,
            count: 0,
            data,
        }
    }

    // -- Collect-side folds ----------------------------------------------------

    /// Fold one sampled value (value-shaped kinds).
    pub fn fold_value(&mut self, value: Value, timestamp: u64) {
        match (&mut self.data, self.kind) {
            (AggData::CountSampled { total }, _) => *total += 1,
            (AggData::Extremum { val }, kind) => {
                let keep_new = match val.compare(&value) {
                    None => val.tag() == crate::value::ValueTag::None,
                    Some(ordering) => match kind {
                        AggKind::Min => ordering == Ordering::Greater,
                        _ => ordering == Ordering::Less,
                    },
                };
                if keep_new {
                    *val = value;
                }
            }
            (AggData::Sum { val }, _) => {
                if let Some(sum) = val.try_add(&value) {
                    *val = sum;
                }
            }
            (AggData::Stamped { val, timestamp: ts }, kind) => {
                let replace = self.count == 0
                    || match kind {
                        AggKind::First => timestamp < *ts,
                        _ => timestamp >= *ts,
                    };
                if replace {
                    *val = value;
                    *ts = timestamp;
                }
            }
            (AggData::DescribeVariable { subs }, _) => {
                for sub in subs.values_mut() {
                    sub.fold_value(value, timestamp);
                }
            }
            _ => {}
        }
        self.count += 1;
    }

    /// Fold one string sample (kind `staticStr`).
    pub fn fold_str(&mut self, sample: &str) {
        if let AggData::StaticStr { text } = &mut self.data {
            if self.count == 0 || sample < text.as_str() {
                *text = sample.to_string();
            }
        }
        self.count += 1;
    }

    /// Fold one rank (kind `rankList`).
    pub fn fold_rank(&mut self, rank: u32) {
        if let AggData::RankList { ranks } = &mut self.data {
            ranks.insert(rank);
        }
        self.count += 1;
    }

    /// Fold one walked stack, outermost frame first (kind `stackTraces`).
    pub fn fold_trace(&mut self, frames: &[u64]) {
        if let AggData::StackTraces { tree } = &mut self.data {
            tree.add_path(frames);
        }
        self.count += 1;
    }

    // -- Merge -----------------------------------------------------------------

    /// Symmetric merge. Fails with `KindMismatch` when the kinds differ;
    /// callers drop both inputs in that case.
    pub fn merge(&mut self, other: &Self) -> Result<()> {
        if self.kind != other.kind {
            return Err(DysectError::KindMismatch {
                id: self.id,
                left: self.kind.label(),
                right: other.kind.label(),
            });
        }

        // Identity on either side short-circuits; counts still sum.
        if other.count == 0 {
            return Ok(());
        }
        if self.count == 0 {
            self.data = other.data.clone();
            self.count = other.count;
            return Ok(());
        }

        match (&mut self.data, &other.data) {
            (AggData::CountSampled { total }, AggData::CountSampled { total: b }) => {
                *total += *b;
            }
            (AggData::Extremum { val }, AggData::Extremum { val: b }) => {
                let take_other = match val.compare(b) {
                    None => val.tag() == crate::value::ValueTag::None,
                    Some(ordering) => match self.kind {
                        AggKind::Min => ordering == Ordering::Greater,
                        _ => ordering == Ordering::Less,
                    },
                };
                if take_other {
                    *val = *b;
                }
            }
            (AggData::Sum { val }, AggData::Sum { val: b }) => {
                if let Some(sum) = val.try_add(b) {
                    *val = sum;
                }
            }
            (
                AggData::Stamped { val, timestamp },
                AggData::Stamped {
                    val: b,
                    timestamp: bts,
                },
            ) => {
                let take_other = match self.kind {
                    AggKind::First => bts < timestamp,
                    _ => bts > timestamp,
                };
                if take_other {
                    *val = *b;
                    *timestamp = *bts;
                }
            }
            (AggData::StaticStr { text }, AggData::StaticStr { text: b }) => {
                if b.as_str() < text.as_str() {
                    *text = b.clone();
                }
            }
            (AggData::RankList { ranks }, AggData::RankList { ranks: b }) => {
                ranks.union(b);
            }
            (AggData::StackTraces { tree }, AggData::StackTraces { tree: b }) => {
                tree.merge(b);
            }
            (AggData::DescribeVariable { subs }, AggData::DescribeVariable { subs: b }) => {
                for (sub_id, sub) in b {
                    match subs.get_mut(sub_id) {
                        Some(existing) => existing.merge(sub)?,
                        None => {
                            subs.insert(*sub_id, sub.clone());
                        }
                    }
                }
            }
            // Kind equality was checked above; mismatched data shapes
            // cannot be constructed through the public API.
            _ => {
                return Err(DysectError::KindMismatch {
                    id: self.id,
                    left: self.kind.label(),
                    right: other.kind.label(),
                })
            }
        }

        self.count += other.count;
        Ok(())
    }

    /// True for kinds that decompose into real aggregates.
    #[must_use]
    pub fn is_synthetic(&self) -> bool {
        matches!(self.kind, AggKind::DescribeVariable)
    }

    /// The real aggregates a synthetic decomposes into.
    #[must_use]
    pub fn expand(&self) -> Vec<Aggregate> {
        match &self.data {
            AggData::DescribeVariable { subs } => subs.values().cloned().collect(),
            _ => vec![self.clone()],
        }
    }

    // -- Wire ------------------------------------------------------------------

    /// Append the kind-specific payload bytes.
    pub fn encode_payload(&self, out: &mut Vec<u8>) {
        match &self.data {
            AggData::CountSampled { total } => put_u64(out, *total),
            AggData::Extremum { val } | AggData::Sum { val } => val.encode(out),
            AggData::Stamped { val, timestamp } => {
                val.encode(out);
                put_u64(out, *timestamp);
            }
            AggData::StaticStr { text } => out.extend_from_slice(text.as_bytes()),
            AggData::RankList { ranks } => {
                put_u32(out, ranks.ranges().len() as u32);
                for &(lo, hi) in ranks.ranges() {
                    put_u32(out, lo);
                    put_u32(out, hi);
                }
            }
            AggData::StackTraces { tree } => {
                put_u32(out, tree.nodes().len() as u32);
                for node in tree.nodes() {
                    put_u32(out, node.parent.map_or(u32::MAX, |p| p));
                    put_u64(out, node.frame_id);
                    put_u32(out, node.count);
                }
            }
            AggData::DescribeVariable { subs } => {
                put_u16(out, subs.len() as u16);
                for sub in subs.values() {
                    put_u32(out, sub.id);
                    put_u16(out, sub.kind.to_u16());
                    let mut sub_payload = Vec::new();
                    sub.encode_payload(&mut sub_payload);
                    put_u32(out, sub_payload.len() as u32);
                    out.extend_from_slice(&sub_payload);
                }
            }
        }
    }

    /// Decode a payload for a known `(kind, id, count)` envelope.
    pub fn decode_payload(
        kind: AggKind,
        id: AggId,
        count: u32,
        payload: &[u8],
    ) -> Result<Self> {
        let mut r = Reader::new(payload);
        let data = match kind {
            AggKind::CountSampled => AggData::CountSampled { total: r.u64()? },
            AggKind::Min | AggKind::Max => {
                let (val, used) = Value::decode(payload)?;
                r.skip(used)?;
                AggData::Extremum { val }
            }
            AggKind::Sum | AggKind::Avg => {
                let (val, used) = Value::decode(payload)?;
                r.skip(used)?;
                AggData::Sum { val }
            }
            AggKind::First | AggKind::Last => {
                let (val, used) = Value::decode(payload)?;
                r.skip(used)?;
                let timestamp = r.u64()?;
                AggData::Stamped { val, timestamp }
            }
            AggKind::StaticStr => {
                let text = String::from_utf8(payload.to_vec()).map_err(|_| {
                    DysectError::MalformedPacket("staticStr payload not utf-8".into())
                })?;
                r.skip(payload.len())?;
                AggData::StaticStr { text }
            }
            AggKind::RankList => {
                let rle_count = r.u32()? as usize;
                let mut ranks = RankSet::new();
                for _ in 0..rle_count {
                    let lo = r.u32()?;
                    let hi = r.u32()?;
                    if lo > hi {
                        return Err(DysectError::MalformedPacket(format!(
                            "inverted rank range {lo}-{hi}"
                        )));
                    }
                    ranks.insert_range(lo, hi);
                }
                AggData::RankList { ranks }
            }
            AggKind::StackTraces => {
                let node_count = r.u32()? as usize;
                let mut tree = TraceTree::new();
                let mut nodes = Vec::with_capacity(node_count.min(4096));
                for i in 0..node_count {
                    let parent_raw = r.u32()?;
                    let frame = r.u64()?;
                    let node_samples = r.u32()?;
                    let parent = if parent_raw == u32::MAX {
                        None
                    } else {
                        // Parents must precede children.
                        if parent_raw as usize >= i {
                            return Err(DysectError::MalformedPacket(format!(
                                "trace node {i} references forward parent {parent_raw}"
                            )));
                        }
                        Some(parent_raw)
                    };
                    nodes.push(TraceNode {
                        parent,
                        frame_id: frame,
                        count: node_samples,
                    });
                }
                tree.nodes = nodes;
                AggData::StackTraces { tree }
            }
            AggKind::DescribeVariable => {
                let sub_count = r.u16()? as usize;
                let mut subs = BTreeMap::new();
                for _ in 0..sub_count {
                    let sub_id = r.u32()?;
                    let raw_kind = r.u16()?;
                    let sub_kind = AggKind::from_u16(raw_kind).ok_or_else(|| {
                        DysectError::MalformedPacket(format!(
                            "unknown sub-aggregate kind {raw_kind}"
                        ))
                    })?;
                    // Synthetics expand into real aggregates before
                    // encoding; a nested synthetic is malformed.
                    if sub_kind == AggKind::DescribeVariable {
                        return Err(DysectError::MalformedPacket(
                            "nested synthetic aggregate".into(),
                        ));
                    }
                    let sub_len = r.u32()? as usize;
                    let sub_payload = r.take(sub_len)?;
                    // Sub records carry no count on the wire; they
                    // inherit the synthetic's count.
                    let sub = Self::decode_payload(sub_kind, sub_id, count, sub_payload)?;
                    subs.insert(sub_id, sub);
                }
                AggData::DescribeVariable { subs }
            }
        };

        if r.remaining() != 0 {
            return Err(DysectError::MalformedPacket(format!(
                "{} trailing bytes after {} payload",
                r.remaining(),
                kind.label()
            )));
        }

        Ok(Self {
            kind,
            id,
            count,
            data,
        })
    }

    // -- Rendering -------------------------------------------------------------

    /// Rendered result used by front-end trace interpolation.
    #[must_use]
    pub fn render(&self, frame_names: Option<&BTreeMap<u64, String>>) -> String {
        match &self.data {
            AggData::CountSampled { total } => total.to_string(),
            AggData::Extremum { val } => val.render(),
            AggData::Sum { val } => match self.kind {
                AggKind::Avg => {
                    if self.count == 0 {
                        "<none>".to_string()
                    } else {
                        val.as_double().map_or_else(
                            || "<none>".to_string(),
                            |sum| format!("{}", sum / f64::from(self.count)),
                        )
                    }
                }
                _ => val.render(),
            },
            AggData::Stamped { val, .. } => val.render(),
            AggData::StaticStr { text } => text.clone(),
            AggData::RankList { ranks } => ranks.render(),
            AggData::StackTraces { tree } => tree.render(frame_names),
            AggData::DescribeVariable { subs } => {
                let mut parts = Vec::new();
                for sub in subs.values() {
                    match sub.kind {
                        AggKind::Min => parts.push(format!("min:{}", sub.render(None))),
                        AggKind::Max => parts.push(format!("max:{}", sub.render(None))),
                        AggKind::CountSampled => {
                            parts.push(format!("n:{}", sub.render(None)));
                        }
                        _ => parts.push(sub.render(None)),
                    }
                }
                format!("[{}]", parts.join(", "))
            }
        }
    }
}

/// Build the `describeVariable` synthetic for one variable: min, max,
/// and sample count over its values.
#[must_use]
pub fn describe_variable(id_gen: &mut AggIdGen, desc_id: AggId) -> Aggregate {
    let mut subs = BTreeMap::new();
    let min = Aggregate::identity(AggKind::Min, id_gen.next_id());
    let max = Aggregate::identity(AggKind::Max, id_gen.next_id());
    let n = Aggregate::identity(AggKind::CountSampled, id_gen.next_id());
    subs.insert(min.id, min);
    subs.insert(max.id, max);
    subs.insert(n.id, n);
    Aggregate {
        kind: AggKind::DescribeVariable,
        id: desc_id,
        count: 0,
        data: AggData::DescribeVariable { subs },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn min_with(id: AggId, v: Value) -> Aggregate {
        let mut agg = Aggregate::identity(AggKind::Min, id);
        agg.fold_value(v, 0);
        agg
    }

    // -- RankSet ----------------------------------------------------------------

    #[test]
    fn rank_set_coalesces_adjacent() {
        let mut ranks = RankSet::new();
        ranks.insert(0);
        ranks.insert(2);
        ranks.insert(1);
        ranks.insert(7);
        assert_eq!(ranks.render(), "0-2,7");
        assert_eq!(ranks.len(), 4);
        assert!(ranks.contains(1));
        assert!(!ranks.contains(5));
    }

    #[test]
    fn rank_set_union() {
        let mut a = RankSet::new();
        a.insert_range(0, 3);
        let mut b = RankSet::new();
        b.insert_range(2, 5);
        b.insert(9);
        a.union(&b);
        assert_eq!(a.render(), "0-5,9");
    }

    // -- TraceTree --------------------------------------------------------------

    #[test]
    fn trace_tree_shares_prefixes() {
        let mut tree = TraceTree::new();
        let (main, foo, bar) = (frame_id("main"), frame_id("foo"), frame_id("bar"));
        tree.add_path(&[main, foo]);
        tree.add_path(&[main, bar]);
        tree.add_path(&[main, foo]);
        // main shared by all three, foo seen twice, bar once
        assert_eq!(tree.nodes().len(), 3);
        assert_eq!(tree.nodes()[0].count, 3);
        let foo_node = tree.nodes().iter().find(|n| n.frame_id == foo).unwrap();
        assert_eq!(foo_node.count, 2);
    }

    #[test]
    fn trace_tree_merge_sums_shared_nodes() {
        let (main, foo) = (frame_id("main"), frame_id("foo"));
        let mut a = TraceTree::new();
        a.add_path(&[main, foo]);
        let mut b = TraceTree::new();
        b.add_path(&[main, foo]);
        b.add_path(&[main]);
        a.merge(&b);
        assert_eq!(a.nodes().len(), 2);
        assert_eq!(a.nodes()[0].count, 3);
    }

    // -- Merge algebra ----------------------------------------------------------

    #[test]
    fn merge_min_picks_extremum_and_sums_counts() {
        let mut a = min_with(1, Value::Int(5));
        let b = min_with(1, Value::Int(2));
        a.merge(&b).unwrap();
        assert_eq!(a.data, AggData::Extremum { val: Value::Int(2) });
        assert_eq!(a.count, 2);
    }

    #[test]
    fn merge_identity_is_neutral() {
        let mut a = min_with(1, Value::Int(5));
        let before = a.clone();
        a.merge(&Aggregate::identity(AggKind::Min, 1)).unwrap();
        assert_eq!(a, before);

        let mut identity = Aggregate::identity(AggKind::Min, 1);
        identity.merge(&before).unwrap();
        assert_eq!(identity, before);
    }

    #[test]
    fn merge_kind_mismatch_is_rejected() {
        let mut a = Aggregate::identity(AggKind::Min, 1);
        let b = Aggregate::identity(AggKind::Max, 1);
        assert!(matches!(
            a.merge(&b),
            Err(DysectError::KindMismatch { id: 1, .. })
        ));
    }

    #[test]
    fn merge_first_keeps_smaller_timestamp() {
        let mut a = Aggregate::identity(AggKind::First, 3);
        a.fold_value(Value::Int(10), 100);
        let mut b = Aggregate::identity(AggKind::First, 3);
        b.fold_value(Value::Int(20), 50);
        a.merge(&b).unwrap();
        assert_eq!(
            a.data,
            AggData::Stamped {
                val: Value::Int(20),
                timestamp: 50
            }
        );
    }

    #[test]
    fn merge_static_str_lexicographic_min() {
        let mut a = Aggregate::identity(AggKind::StaticStr, 4);
        a.fold_str("foo");
        let mut b = Aggregate::identity(AggKind::StaticStr, 4);
        b.fold_str("bar");
        a.merge(&b).unwrap();
        assert_eq!(
            a.data,
            AggData::StaticStr {
                text: "bar".into()
            }
        );
        assert_eq!(a.count, 2);
    }

    #[test]
    fn avg_renders_sum_over_count() {
        let mut avg = Aggregate::identity(AggKind::Avg, 5);
        avg.fold_value(Value::Int(1), 0);
        avg.fold_value(Value::Int(2), 0);
        avg.fold_value(Value::Int(3), 0);
        assert_eq!(avg.render(None), "2");
    }

    // -- Synthetic --------------------------------------------------------------

    #[test]
    fn describe_variable_folds_into_subs() {
        let mut ids = AggIdGen::default();
        let desc_id = ids.next_id();
        let mut desc = describe_variable(&mut ids, desc_id);
        desc.fold_value(Value::Int(3), 0);
        desc.fold_value(Value::Int(1), 1);
        let rendered = desc.render(None);
        assert!(rendered.contains("min:1"), "{rendered}");
        assert!(rendered.contains("max:3"), "{rendered}");
        assert!(rendered.contains("n:2"), "{rendered}");
    }

    #[test]
    fn describe_variable_expands_into_real_aggregates() {
        let mut ids = AggIdGen::default();
        let desc_id = ids.next_id();
        let mut desc = describe_variable(&mut ids, desc_id);
        desc.fold_value(Value::Int(3), 0);

        assert!(desc.is_synthetic());
        let real = desc.expand();
        assert_eq!(real.len(), 3);
        assert!(real.iter().all(|a| !a.is_synthetic()));
        assert!(real.iter().any(|a| a.kind == AggKind::Min));
        assert!(real.iter().any(|a| a.kind == AggKind::Max));
        assert!(real.iter().any(|a| a.kind == AggKind::CountSampled));

        // Non-synthetic aggregates expand to themselves.
        let plain = min_with(9, Value::Int(1));
        assert_eq!(plain.expand(), vec![plain.clone()]);
    }

    #[test]
    fn describe_variable_payload_roundtrip() {
        let mut ids = AggIdGen::default();
        let desc_id = ids.next_id();
        let mut desc = describe_variable(&mut ids, desc_id);
        desc.fold_value(Value::Int(3), 7);

        let mut payload = Vec::new();
        desc.encode_payload(&mut payload);
        let back =
            Aggregate::decode_payload(AggKind::DescribeVariable, desc.id, desc.count, &payload)
                .unwrap();
        assert_eq!(back.render(None), desc.render(None));
    }

    // -- Wire -------------------------------------------------------------------

    #[test]
    fn payload_roundtrip_all_kinds() {
        let mut samples = vec![
            {
                let mut a = Aggregate::identity(AggKind::CountSampled, 1);
                a.fold_value(Value::None, 0);
                a.fold_value(Value::None, 0);
                a
            },
            min_with(2, Value::Double(1.5)),
            {
                let mut a = Aggregate::identity(AggKind::Sum, 3);
                a.fold_value(Value::Int(4), 0);
                a
            },
            {
                let mut a = Aggregate::identity(AggKind::Last, 4);
                a.fold_value(Value::Pointer(0xbeef), 9);
                a
            },
            {
                let mut a = Aggregate::identity(AggKind::StaticStr, 5);
                a.fold_str("foo");
                a
            },
            {
                let mut a = Aggregate::identity(AggKind::RankList, 6);
                a.fold_rank(0);
                a.fold_rank(1);
                a.fold_rank(5);
                a
            },
            {
                let mut a = Aggregate::identity(AggKind::StackTraces, 7);
                a.fold_trace(&[frame_id("main"), frame_id("foo")]);
                a
            },
        ];
        for agg in samples.drain(..) {
            let mut payload = Vec::new();
            agg.encode_payload(&mut payload);
            let back =
                Aggregate::decode_payload(agg.kind, agg.id, agg.count, &payload).unwrap();
            assert_eq!(back, agg, "kind {}", agg.kind.label());
        }
    }

    #[test]
    fn decode_rejects_forward_parent_reference() {
        let mut payload = Vec::new();
        put_u32(&mut payload, 1); // one node
        put_u32(&mut payload, 0); // parent 0 == itself (forward)
        put_u64(&mut payload, 42);
        put_u32(&mut payload, 1);
        assert!(Aggregate::decode_payload(AggKind::StackTraces, 1, 1, &payload).is_err());
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut payload = Vec::new();
        put_u64(&mut payload, 3);
        payload.push(0xff);
        assert!(Aggregate::decode_payload(AggKind::CountSampled, 1, 3, &payload).is_err());
    }
}
