//! Property-based tests for the aggregate kernel.
//!
//! Verifies the algebra the overlay relies on:
//! - merge is associative and commutative over equal `(kind, id)`
//! - the identity element (count == 0) is neutral on either side
//! - counts always sum across merges
//! - payload encode/decode round-trips every kind
//! - rank sets behave as sets under union

use proptest::prelude::*;

use dysect_core::aggregate::{frame_id, AggKind, Aggregate, RankSet};
use dysect_core::value::Value;

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_samples() -> impl Strategy<Value = Vec<i32>> {
    prop::collection::vec(-1000i32..1000, 1..16)
}

fn arb_ranks() -> impl Strategy<Value = Vec<u32>> {
    prop::collection::vec(0u32..64, 1..20)
}

fn arb_paths() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(0u8..6, 1..5), 1..8)
}

fn arb_value_kind() -> impl Strategy<Value = AggKind> {
    prop::sample::select(vec![
        AggKind::Min,
        AggKind::Max,
        AggKind::Sum,
        AggKind::Avg,
        AggKind::CountSampled,
    ])
}

/// Build an aggregate of a value-shaped kind by folding samples.
/// Timestamps are unique per fold so first/last merges stay total.
fn fold_values(kind: AggKind, id: u32, samples: &[i32], ts_base: u64) -> Aggregate {
    let mut agg = Aggregate::identity(kind, id);
    for (i, &sample) in samples.iter().enumerate() {
        agg.fold_value(Value::Int(sample), ts_base + i as u64);
    }
    agg
}

fn fold_ranks(id: u32, ranks: &[u32]) -> Aggregate {
    let mut agg = Aggregate::identity(AggKind::RankList, id);
    for &rank in ranks {
        agg.fold_rank(rank);
    }
    agg
}

fn fold_paths(id: u32, paths: &[Vec<u8>]) -> Aggregate {
    let mut agg = Aggregate::identity(AggKind::StackTraces, id);
    for path in paths {
        let frames: Vec<u64> = path
            .iter()
            .map(|&f| frame_id(&format!("frame{f}")))
            .collect();
        agg.fold_trace(&frames);
    }
    agg
}

fn merged(a: &Aggregate, b: &Aggregate) -> Aggregate {
    let mut out = a.clone();
    out.merge(b).expect("same-kind merge");
    out
}

// ────────────────────────────────────────────────────────────────────
// Algebra
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// merge(merge(a,b),c) == merge(a,merge(b,c)) for value kinds.
    #[test]
    fn prop_value_merge_is_associative(
        kind in arb_value_kind(),
        xs in arb_samples(),
        ys in arb_samples(),
        zs in arb_samples(),
    ) {
        let a = fold_values(kind, 1, &xs, 0);
        let b = fold_values(kind, 1, &ys, 1000);
        let c = fold_values(kind, 1, &zs, 2000);
        prop_assert_eq!(merged(&merged(&a, &b), &c), merged(&a, &merged(&b, &c)));
    }

    /// merge(a,b) == merge(b,a) for value kinds.
    #[test]
    fn prop_value_merge_is_commutative(
        kind in arb_value_kind(),
        xs in arb_samples(),
        ys in arb_samples(),
    ) {
        let a = fold_values(kind, 1, &xs, 0);
        let b = fold_values(kind, 1, &ys, 1000);
        prop_assert_eq!(merged(&a, &b), merged(&b, &a));
    }

    /// First/last are associative and commutative when timestamps are
    /// distinct.
    #[test]
    fn prop_stamped_merge_laws(
        xs in arb_samples(),
        ys in arb_samples(),
        keep_last in any::<bool>(),
    ) {
        let kind = if keep_last { AggKind::Last } else { AggKind::First };
        let a = fold_values(kind, 1, &xs, 0);
        let b = fold_values(kind, 1, &ys, 100_000);
        prop_assert_eq!(merged(&a, &b), merged(&b, &a));
    }

    /// Identity is neutral on either side; counts still sum.
    #[test]
    fn prop_identity_is_neutral(
        kind in arb_value_kind(),
        xs in arb_samples(),
    ) {
        let a = fold_values(kind, 1, &xs, 0);
        let identity = Aggregate::identity(kind, 1);
        prop_assert_eq!(merged(&a, &identity), a.clone());
        prop_assert_eq!(merged(&identity, &a), a);
    }

    /// Counts sum across every merge.
    #[test]
    fn prop_counts_sum(
        kind in arb_value_kind(),
        xs in arb_samples(),
        ys in arb_samples(),
    ) {
        let a = fold_values(kind, 1, &xs, 0);
        let b = fold_values(kind, 1, &ys, 1000);
        prop_assert_eq!(merged(&a, &b).count, a.count + b.count);
    }

    /// Rank-list merge is set union.
    #[test]
    fn prop_rank_merge_is_union(
        xs in arb_ranks(),
        ys in arb_ranks(),
    ) {
        let union = merged(&fold_ranks(1, &xs), &fold_ranks(1, &ys));
        let expected: std::collections::BTreeSet<u32> =
            xs.iter().chain(ys.iter()).copied().collect();
        let got: std::collections::BTreeSet<u32> = match &union.data {
            dysect_core::aggregate::AggData::RankList { ranks } => ranks.iter().collect(),
            other => {
                prop_assert!(false, "wrong data {:?}", other);
                unreachable!()
            }
        };
        prop_assert_eq!(got, expected);
    }

    /// Stack-trace merge preserves total root sample count.
    #[test]
    fn prop_trace_merge_preserves_samples(
        xs in arb_paths(),
        ys in arb_paths(),
    ) {
        let a = fold_paths(1, &xs);
        let b = fold_paths(1, &ys);
        let both = merged(&a, &b);
        let root_total = |agg: &Aggregate| -> u64 {
            match &agg.data {
                dysect_core::aggregate::AggData::StackTraces { tree } => tree
                    .nodes()
                    .iter()
                    .filter(|n| n.parent.is_none())
                    .map(|n| u64::from(n.count))
                    .sum(),
                _ => 0,
            }
        };
        prop_assert_eq!(root_total(&both), root_total(&a) + root_total(&b));
    }

    /// Mismatched kinds always refuse to merge.
    #[test]
    fn prop_kind_mismatch_rejected(
        xs in arb_samples(),
    ) {
        let mut min = fold_values(AggKind::Min, 1, &xs, 0);
        let max = fold_values(AggKind::Max, 1, &xs, 0);
        prop_assert!(min.merge(&max).is_err());
    }
}

// ────────────────────────────────────────────────────────────────────
// Payload round-trip
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn prop_value_payload_roundtrip(
        kind in arb_value_kind(),
        xs in arb_samples(),
    ) {
        let agg = fold_values(kind, 9, &xs, 0);
        let mut payload = Vec::new();
        agg.encode_payload(&mut payload);
        let back = Aggregate::decode_payload(agg.kind, agg.id, agg.count, &payload).unwrap();
        prop_assert_eq!(back, agg);
    }

    #[test]
    fn prop_rank_payload_roundtrip(xs in arb_ranks()) {
        let agg = fold_ranks(9, &xs);
        let mut payload = Vec::new();
        agg.encode_payload(&mut payload);
        let back = Aggregate::decode_payload(agg.kind, agg.id, agg.count, &payload).unwrap();
        prop_assert_eq!(back, agg);
    }

    #[test]
    fn prop_trace_payload_roundtrip(xs in arb_paths()) {
        let agg = fold_paths(9, &xs);
        let mut payload = Vec::new();
        agg.encode_payload(&mut payload);
        let back = Aggregate::decode_payload(agg.kind, agg.id, agg.count, &payload).unwrap();
        prop_assert_eq!(back, agg);
    }

    /// The decoder never panics on arbitrary payload bytes.
    #[test]
    fn prop_decode_never_panics(
        raw_kind in 1u16..12,
        bytes in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        if let Some(kind) = AggKind::from_u16(raw_kind) {
            let _ = Aggregate::decode_payload(kind, 1, 1, &bytes);
        }
    }
}

// ────────────────────────────────────────────────────────────────────
// RankSet
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Insertion order never changes the resulting set.
    #[test]
    fn prop_rank_set_insert_order_irrelevant(mut xs in arb_ranks()) {
        let mut forward = RankSet::new();
        for &x in &xs {
            forward.insert(x);
        }
        xs.reverse();
        let mut backward = RankSet::new();
        for &x in &xs {
            backward.insert(x);
        }
        prop_assert_eq!(forward, backward);
    }

    /// len() matches the number of distinct ranks.
    #[test]
    fn prop_rank_set_len(xs in arb_ranks()) {
        let mut set = RankSet::new();
        for &x in &xs {
            set.insert(x);
        }
        let distinct: std::collections::BTreeSet<u32> = xs.into_iter().collect();
        prop_assert_eq!(set.len(), distinct.len());
    }
}
