//! Property-based tests for the packet codec.
//!
//! Verifies the wire invariants the overlay depends on:
//! - every encoded packet carries the dysect tag in its first word
//! - encode/decode round-trips arbitrary aggregate sets
//! - the decoder rejects truncation at every offset without panicking
//! - packet merge sums counts and keeps the partial flag sticky

use std::collections::BTreeMap;

use proptest::prelude::*;

use dysect_core::aggregate::{AggId, AggKind, Aggregate};
use dysect_core::packet::{first_word, is_dysect_tag, Packet, PacketFlags};
use dysect_core::value::Value;

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_aggregate(id: AggId) -> impl Strategy<Value = Aggregate> {
    prop_oneof![
        prop::collection::vec(-100i32..100, 1..8).prop_map(move |xs| {
            let mut agg = Aggregate::identity(AggKind::Min, id);
            for x in xs {
                agg.fold_value(Value::Int(x), 0);
            }
            agg
        }),
        prop::collection::vec(0u32..32, 1..8).prop_map(move |ranks| {
            let mut agg = Aggregate::identity(AggKind::RankList, id);
            for rank in ranks {
                agg.fold_rank(rank);
            }
            agg
        }),
        "[a-z]{1,12}".prop_map(move |s| {
            let mut agg = Aggregate::identity(AggKind::StaticStr, id);
            agg.fold_str(&s);
            agg
        }),
        (1u64..1000).prop_map(move |n| {
            let mut agg = Aggregate::identity(AggKind::CountSampled, id);
            for _ in 0..n.min(20) {
                agg.fold_value(Value::None, 0);
            }
            agg
        }),
    ]
}

fn arb_packet() -> impl Strategy<Value = Packet> {
    (
        0u32..0x00FF_FFFF,
        any::<u32>(),
        1u32..64,
        any::<bool>(),
        prop::collection::vec(0u32..16, 0..6),
    )
        .prop_flat_map(|(stream, probe, count, partial, ids)| {
            let distinct: Vec<AggId> = ids
                .into_iter()
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .collect();
            let aggs: Vec<_> = distinct.into_iter().map(arb_aggregate).collect();
            aggs.prop_map(move |aggs| {
                let mut packet = Packet::new(stream, probe);
                packet.count = count;
                if partial {
                    packet.flags = PacketFlags::partial();
                }
                for agg in aggs {
                    packet.aggregates.insert(agg.id, agg);
                }
                packet
            })
        })
}

// ────────────────────────────────────────────────────────────────────
// Signature and round trip
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Every packet produced by the kernel carries the routing tag.
    #[test]
    fn prop_signature(packet in arb_packet()) {
        let bytes = packet.encode();
        let word = first_word(&bytes).expect("at least one word");
        prop_assert!(is_dysect_tag(word));
    }

    /// decode(encode(p)) == p.
    #[test]
    fn prop_roundtrip(packet in arb_packet()) {
        let back = Packet::decode(&packet.encode()).unwrap();
        prop_assert_eq!(back, packet);
    }

    /// Truncation at any offset is rejected, never a panic.
    #[test]
    fn prop_truncation_rejected(packet in arb_packet(), cut_ratio in 0.0f64..1.0) {
        let bytes = packet.encode();
        let cut = ((bytes.len() as f64) * cut_ratio) as usize;
        if cut < bytes.len() {
            prop_assert!(Packet::decode(&bytes[..cut]).is_err());
        }
    }

    /// Arbitrary bytes never panic the decoder.
    #[test]
    fn prop_garbage_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = Packet::decode(&bytes);
    }

    /// Bit flips never panic the decoder.
    #[test]
    fn prop_bitflip_never_panics(
        packet in arb_packet(),
        offset in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let mut bytes = packet.encode();
        let at = offset.index(bytes.len());
        bytes[at] ^= 1 << bit;
        let _ = Packet::decode(&bytes);
    }
}

// ────────────────────────────────────────────────────────────────────
// Merge
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Counts sum and the partial flag is sticky under merge.
    #[test]
    fn prop_merge_counts_and_flags(a in arb_packet(), b in arb_packet()) {
        let mut a = a;
        let mut b = b;
        b.stream_id = a.stream_id;
        b.probe_id = a.probe_id;
        // Avoid id collisions across differing kinds; shift b's ids.
        let shifted: BTreeMap<_, _> = b
            .aggregates
            .values()
            .map(|agg| {
                let mut agg = agg.clone();
                agg.id += 1000;
                (agg.id, agg)
            })
            .collect();
        b.aggregates = shifted;

        let expect_partial = a.flags.is_partial() || b.flags.is_partial();
        let expect_count = a.count + b.count;
        let expected_len = a.aggregates.len() + b.aggregates.len();

        a.merge(b);
        prop_assert_eq!(a.count, expect_count);
        prop_assert_eq!(a.flags.is_partial(), expect_partial);
        prop_assert_eq!(a.aggregates.len(), expected_len);
    }
}
