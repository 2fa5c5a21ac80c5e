//! Interior-tier upstream filter.
//!
//! Interior overlay nodes run the same staging shape as back-ends, but
//! keyed by back-end rank instead of process id: packets with matching
//! `(stream, probe)` ids merge with the kernel's associative merge and
//! forward upstream as one packet once every downstream back-end has
//! contributed, or when the stream timeout closes the window.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::error::{DysectError, Result};
use crate::packet::{first_word, is_dysect_tag, Packet, PacketFlags};
use crate::probe::ProbeId;
use crate::process_table::BackendRank;

#[derive(Debug)]
struct PendingMerge {
    packet: Packet,
    backends_seen: BTreeSet<BackendRank>,
    first_ms: u64,
}

/// Merge state for one interior node and one overlay stream.
#[derive(Debug)]
pub struct UpstreamFilter {
    stream_id: u32,
    /// Downstream back-ends expected per probe; probes without an entry
    /// forward on timeout only.
    expected: BTreeMap<ProbeId, BTreeSet<BackendRank>>,
    pending: BTreeMap<ProbeId, PendingMerge>,
    timeout_ms: u64,
}

impl UpstreamFilter {
    /// Filter for one stream with the session's stream timeout.
    #[must_use]
    pub fn new(stream_id: u32, timeout_ms: u64) -> Self {
        Self {
            stream_id,
            expected: BTreeMap::new(),
            pending: BTreeMap::new(),
            timeout_ms,
        }
    }

    /// Declare the downstream back-ends a probe reports from.
    pub fn set_expected(&mut self, probe: ProbeId, backends: BTreeSet<BackendRank>) {
        self.expected.insert(probe, backends);
    }

    /// Ingest one downstream packet. Returns the merged upstream packet
    /// once all expected back-ends have contributed.
    ///
    /// Malformed packets are rejected; the caller drops them and keeps
    /// the stream open.
    pub fn ingest(
        &mut self,
        backend: BackendRank,
        bytes: &[u8],
        now_ms: u64,
    ) -> Result<Option<Vec<u8>>> {
        match first_word(bytes) {
            Some(word) if is_dysect_tag(word) => {}
            _ => {
                return Err(DysectError::MalformedPacket(
                    "missing dysect tag on upstream packet".into(),
                ))
            }
        }

        let packet = Packet::decode(bytes)?;
        if packet.stream_id != self.stream_id {
            return Err(DysectError::StreamError(format!(
                "packet for stream {} on filter for stream {}",
                packet.stream_id, self.stream_id
            )));
        }

        let probe = packet.probe_id;
        match self.pending.get_mut(&probe) {
            None => {
                let mut backends_seen = BTreeSet::new();
                backends_seen.insert(backend);
                self.pending.insert(
                    probe,
                    PendingMerge {
                        packet,
                        backends_seen,
                        first_ms: now_ms,
                    },
                );
            }
            Some(pending) => {
                if !pending.backends_seen.insert(backend) {
                    warn!(probe, backend, "duplicate packet from back-end, merging anyway");
                }
                pending.packet.merge(packet);
            }
        }

        if let Some(expected) = self.expected.get(&probe) {
            let pending = &self.pending[&probe];
            if pending.backends_seen.is_superset(expected) {
                debug!(probe, backends = pending.backends_seen.len(), "probe round complete");
                let done = self.pending.remove(&probe).expect("pending entry");
                return Ok(Some(done.packet.encode()));
            }
        }
        Ok(None)
    }

    /// Earliest pending window deadline, for the poll loop.
    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.pending
            .values()
            .map(|p| p.first_ms + self.timeout_ms)
            .min()
    }

    /// Forward every pending merge whose window expired, partial flag
    /// set when back-ends are missing.
    pub fn flush_expired(&mut self, now_ms: u64) -> Vec<Vec<u8>> {
        let expired: Vec<ProbeId> = self
            .pending
            .iter()
            .filter(|(_, p)| now_ms.saturating_sub(p.first_ms) >= self.timeout_ms)
            .map(|(&probe, _)| probe)
            .collect();

        let mut out = Vec::new();
        for probe in expired {
            let mut pending = self.pending.remove(&probe).expect("expired entry");
            let missing = self
                .expected
                .get(&probe)
                .is_some_and(|want| !pending.backends_seen.is_superset(want));
            if missing {
                pending.packet.flags = PacketFlags(pending.packet.flags.0 | PacketFlags::PARTIAL);
                warn!(probe, "stream window closed with missing back-ends");
            }
            out.push(pending.packet.encode());
        }
        out
    }

    /// Forward everything (session teardown).
    pub fn flush_all(&mut self) -> Vec<Vec<u8>> {
        let pending = std::mem::take(&mut self.pending);
        pending.into_values().map(|p| p.packet.encode()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggKind, Aggregate};
    use crate::value::Value;

    fn backend_packet(probe: ProbeId, rank: u32, v: i32) -> Vec<u8> {
        let mut packet = Packet::new(1, probe);
        packet.count = 1;
        let mut min = Aggregate::identity(AggKind::Min, 40);
        min.fold_value(Value::Int(v), 0);
        let mut ranks = Aggregate::identity(AggKind::RankList, 41);
        ranks.fold_rank(rank);
        packet.aggregates.insert(min.id, min);
        packet.aggregates.insert(ranks.id, ranks);
        packet.encode()
    }

    #[test]
    fn merges_until_all_backends_report() {
        let mut filter = UpstreamFilter::new(1, 1000);
        filter.set_expected(9, BTreeSet::from([0, 1]));

        assert!(filter
            .ingest(0, &backend_packet(9, 0, 5), 10)
            .unwrap()
            .is_none());
        let merged = filter
            .ingest(1, &backend_packet(9, 3, 2), 20)
            .unwrap()
            .expect("round complete");

        let packet = Packet::decode(&merged).unwrap();
        assert_eq!(packet.count, 2);
        assert_eq!(packet.aggregates[&40].render(None), "2");
        assert_eq!(packet.aggregates[&41].render(None), "0,3");
        assert!(!packet.flags.is_partial());
    }

    #[test]
    fn window_expiry_forwards_partial() {
        let mut filter = UpstreamFilter::new(1, 100);
        filter.set_expected(9, BTreeSet::from([0, 1]));
        filter.ingest(0, &backend_packet(9, 0, 5), 10).unwrap();

        assert!(filter.flush_expired(50).is_empty());
        let flushed = filter.flush_expired(110);
        assert_eq!(flushed.len(), 1);
        let packet = Packet::decode(&flushed[0]).unwrap();
        assert!(packet.flags.is_partial());
        assert_eq!(packet.count, 1);
    }

    #[test]
    fn rejects_foreign_and_malformed_traffic() {
        let mut filter = UpstreamFilter::new(1, 100);
        assert!(matches!(
            filter.ingest(0, &[0u8; 32], 0),
            Err(DysectError::MalformedPacket(_))
        ));

        let mut other_stream = Packet::new(2, 9);
        other_stream.count = 1;
        assert!(matches!(
            filter.ingest(0, &other_stream.encode(), 0),
            Err(DysectError::StreamError(_))
        ));
    }

    #[test]
    fn unexpected_probe_waits_for_timeout() {
        // No expected-set entry: forwarding happens via the window only.
        let mut filter = UpstreamFilter::new(1, 100);
        assert!(filter
            .ingest(0, &backend_packet(3, 0, 1), 0)
            .unwrap()
            .is_none());
        assert_eq!(filter.next_deadline(), Some(100));
        let flushed = filter.flush_expired(100);
        assert_eq!(flushed.len(), 1);
        let packet = Packet::decode(&flushed[0]).unwrap();
        // Without an expected set nothing is provably missing.
        assert!(!packet.flags.is_partial());
    }
}
