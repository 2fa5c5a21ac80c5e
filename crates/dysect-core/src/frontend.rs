//! Front-end tier: demultiplexing and action finish.
//!
//! The front-end mirrors the back-end flattening of the probe tree so
//! aggregate slot ids line up, then consumes merged packets from the
//! overlay. A probe's round closes when a full (non-partial) packet
//! arrives, when the accumulated process count reaches the domain's
//! expected count, or when the global ceiling timer fires; the round's
//! actions then render their output lines in declaration order.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::domain::DomainKind;
use crate::error::Result;
use crate::packet::Packet;
use crate::probe::{probe_id, ProbeId, ProbeSpec};
use crate::probe_tree::ProbeTree;
use crate::process_table::ProcessTable;
use crate::timer::WaitTimer;
use crate::aggregate::AggIdGen;

#[derive(Debug)]
struct FrontProbe {
    actions: Vec<crate::action::Action>,
    /// Processes expected across the whole job; 0 when statically
    /// unknown (inherit domains).
    expected_count: u32,
    pending: Option<Packet>,
    first_ms: Option<u64>,
}

/// Front-end session state.
pub struct Frontend {
    stream_id: u32,
    ceiling_ms: u64,
    probes: BTreeMap<ProbeId, FrontProbe>,
    ceilings: WaitTimer<ProbeId>,
    /// Frame-id → name table for stack rendering, fed by the embedder
    /// when symbol names are available at the front-end.
    frame_names: BTreeMap<u64, String>,
    output: Vec<String>,
}

impl Frontend {
    /// Mirror the probe tree. Must see the same tree the back-ends see.
    pub fn new(
        stream_id: u32,
        config: &SessionConfig,
        tree: &ProbeTree,
        table: &ProcessTable,
    ) -> Result<Self> {
        let mut frontend = Self {
            stream_id,
            ceiling_ms: config.stream_timeout_ms(),
            probes: BTreeMap::new(),
            ceilings: WaitTimer::new(),
            frame_names: BTreeMap::new(),
            output: Vec::new(),
        };

        // Flatten in the exact order the back-end session uses so the
        // shared aggregate-id generator stays aligned.
        let mut ids = AggIdGen::default();
        for (root_index, root) in tree.roots().iter().enumerate() {
            frontend.flatten(root, root_index, &mut Vec::new(), table, &mut ids)?;
        }
        Ok(frontend)
    }

    fn flatten(
        &mut self,
        spec: &ProbeSpec,
        root_index: usize,
        path: &mut Vec<u8>,
        table: &ProcessTable,
        ids: &mut AggIdGen,
    ) -> Result<()> {
        let id = probe_id(root_index, path);
        let mut actions = spec.actions.clone();
        for action in &mut actions {
            action.prepare(ids);
        }

        let expected_count = match spec.domain.kind() {
            DomainKind::World => table.all_ranks().len() as u32,
            DomainKind::Group(expr) => {
                let intervals = crate::domain::parse_group_expr(expr)?;
                table
                    .all_ranks()
                    .iter()
                    .filter(|&&rank| {
                        intervals.iter().any(|&(lo, hi)| rank >= lo && rank <= hi)
                    })
                    .count() as u32
            }
            // The inherit set depends on which processes satisfy the
            // parent at run time; the ceiling closes these rounds.
            DomainKind::Inherit => 0,
        };

        self.probes.insert(
            id,
            FrontProbe {
                actions,
                expected_count,
                pending: None,
                first_ms: None,
            },
        );

        for (child_index, child) in spec.children.iter().enumerate() {
            path.push(child_index as u8);
            self.flatten(child, root_index, path, table, ids)?;
            path.pop();
        }
        Ok(())
    }

    /// Supply frame names for stack-trace rendering.
    pub fn add_frame_names(&mut self, names: impl IntoIterator<Item = (u64, String)>) {
        self.frame_names.extend(names);
    }

    /// Ingest one upstream packet; completed rounds render immediately.
    pub fn handle_packet(&mut self, bytes: &[u8], now_ms: u64) -> Result<()> {
        let packet = Packet::decode(bytes)?;
        if packet.stream_id != self.stream_id {
            return Err(crate::error::DysectError::StreamError(format!(
                "packet for stream {} on front-end stream {}",
                packet.stream_id, self.stream_id
            )));
        }

        let probe_id = packet.probe_id;
        let Some(probe) = self.probes.get_mut(&probe_id) else {
            warn!(probe = probe_id, "packet for unknown probe, dropping");
            return Ok(());
        };

        let full = !packet.flags.is_partial();
        match &mut probe.pending {
            None => {
                probe.pending = Some(packet);
                probe.first_ms = Some(now_ms);
                self.ceilings.start(probe_id, now_ms + self.ceiling_ms);
            }
            Some(pending) => pending.merge(packet),
        }

        let accumulated = probe.pending.as_ref().map_or(0, |p| p.count);
        let complete =
            full || (probe.expected_count > 0 && accumulated >= probe.expected_count);
        if complete {
            self.finish_round(probe_id);
        }
        Ok(())
    }

    /// Fire expired ceiling timers; their rounds finish partial.
    pub fn tick(&mut self, now_ms: u64) {
        for probe_id in self.ceilings.drain_expired(now_ms) {
            debug!(probe = probe_id, "ceiling timer closed probe round");
            self.finish_round(probe_id);
        }
    }

    fn finish_round(&mut self, probe_id: ProbeId) {
        let Some(probe) = self.probes.get_mut(&probe_id) else {
            return;
        };
        let Some(packet) = probe.pending.take() else {
            return;
        };
        probe.first_ms = None;
        self.ceilings.clear(&probe_id);

        for action in &probe.actions {
            if let Some(line) = action.finish_fe(packet.count, &packet.aggregates, &self.frame_names)
            {
                self.output.push(line);
            }
        }
    }

    /// Earliest ceiling deadline, for the poll loop.
    pub fn next_deadline(&mut self) -> Option<u64> {
        self.ceilings.next_deadline()
    }

    /// Drain rendered output lines.
    pub fn drain_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    /// Number of mirrored probes.
    #[must_use]
    pub fn probe_count(&self) -> usize {
        self.probes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::aggregate::{AggKind, Aggregate};
    use crate::domain::Domain;
    use crate::event::Event;
    use crate::packet::PacketFlags;
    use crate::value::Value;

    fn table() -> ProcessTable {
        let mut t = ProcessTable::new(u32::MAX); // front-end is not a back-end
        for rank in 0..4 {
            t.add(100 + rank, rank, rank / 2);
        }
        t
    }

    fn tree_with_trace(format: &str) -> ProbeTree {
        let mut tree = ProbeTree::new();
        tree.add_root(
            ProbeSpec::new(Event::signal(10), Domain::world_with(1000))
                .action(Action::trace(format).unwrap()),
        )
        .unwrap();
        tree
    }

    fn root_packet(count: u32) -> Packet {
        // Mirror the backend-side id allocation: the first trace slot
        // of the first root gets id 0.
        let mut packet = Packet::new(7, probe_id(0, &[]));
        packet.count = count;
        let mut name = Aggregate::identity(AggKind::StaticStr, 0);
        name.fold_str("foo");
        packet.aggregates.insert(0, name);
        packet
    }

    #[test]
    fn full_packet_renders_immediately() {
        let table = table();
        let tree = tree_with_trace("hit @function()");
        let mut frontend =
            Frontend::new(7, &SessionConfig::default(), &tree, &table).unwrap();
        assert_eq!(frontend.probe_count(), 1);

        let packet = root_packet(4);
        frontend.handle_packet(&packet.encode(), 0).unwrap();
        assert_eq!(frontend.drain_output(), vec!["hit foo".to_string()]);
    }

    #[test]
    fn partial_packet_waits_for_ceiling() {
        let table = table();
        let tree = tree_with_trace("hit @function()");
        let config = SessionConfig {
            stream_timeout_secs: 1,
            ..SessionConfig::default()
        };
        let mut frontend = Frontend::new(7, &config, &tree, &table).unwrap();

        let mut packet = root_packet(2);
        packet.flags = PacketFlags::partial();
        frontend.handle_packet(&packet.encode(), 0).unwrap();
        assert!(frontend.drain_output().is_empty(), "partial rendered early");
        assert_eq!(frontend.next_deadline(), Some(1000));

        frontend.tick(999);
        assert!(frontend.drain_output().is_empty());
        frontend.tick(1000);
        assert_eq!(frontend.drain_output(), vec!["hit foo".to_string()]);
    }

    #[test]
    fn partial_packets_accumulate_to_expected_count() {
        let table = table();
        let tree = tree_with_trace("v=@min(x)");
        let mut frontend =
            Frontend::new(7, &SessionConfig::default(), &tree, &table).unwrap();

        for (count, v) in [(2u32, 5), (2u32, 3)] {
            let mut packet = Packet::new(7, probe_id(0, &[]));
            packet.count = count;
            packet.flags = PacketFlags::partial();
            let mut min = Aggregate::identity(AggKind::Min, 0);
            min.fold_value(Value::Int(v), 0);
            packet.aggregates.insert(0, min);
            frontend.handle_packet(&packet.encode(), 0).unwrap();
        }
        // 2 + 2 reaches the world count of 4.
        assert_eq!(frontend.drain_output(), vec!["v=3".to_string()]);
    }

    #[test]
    fn unknown_probe_packets_are_dropped() {
        let table = table();
        let tree = tree_with_trace("x");
        let mut frontend =
            Frontend::new(7, &SessionConfig::default(), &tree, &table).unwrap();
        let mut packet = Packet::new(7, 0xdead_beef);
        packet.count = 1;
        frontend.handle_packet(&packet.encode(), 0).unwrap();
        assert!(frontend.drain_output().is_empty());
    }
}
