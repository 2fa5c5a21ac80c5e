//! Property-based tests for the expression evaluator.
//!
//! Verifies:
//! - parenthesized constant expressions evaluate to the oracle value
//! - relational results agree with direct comparison
//! - the parser never panics on arbitrary input
//! - unresolved leaves poison arithmetic but not absorbing logic

use proptest::prelude::*;

use dysect_core::expr::{EvalOutcome, ExprTree};
use dysect_core::test_support::MockEngine;
use dysect_core::value::Value;

/// Fully parenthesized arithmetic over small literals, with its value.
fn arb_const_expr() -> impl Strategy<Value = (String, i64)> {
    let leaf = (0i64..100).prop_map(|n| (n.to_string(), n));
    leaf.prop_recursive(4, 64, 2, |inner| {
        (
            inner.clone(),
            inner,
            prop::sample::select(vec!['+', '-', '*']),
        )
            .prop_map(|((ls, lv), (rs, rv), op)| {
                let value = match op {
                    '+' => lv.wrapping_add(rv),
                    '-' => lv.wrapping_sub(rv),
                    _ => lv.wrapping_mul(rv),
                };
                (format!("({ls} {op} {rs})"), value)
            })
    })
}

fn eval_const(expr: &str) -> EvalOutcome {
    let engine = MockEngine::new();
    ExprTree::parse(expr)
        .unwrap()
        .evaluate(&engine, 1, 1)
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(400))]

    /// Constant arithmetic matches the oracle.
    #[test]
    fn prop_constant_arithmetic((expr, expected) in arb_const_expr()) {
        prop_assert_eq!(eval_const(&expr), EvalOutcome::Val(Value::Long(expected)));
    }

    /// Relational operators agree with direct comparison.
    #[test]
    fn prop_relational_agrees(
        (le, lv) in arb_const_expr(),
        (re, rv) in arb_const_expr(),
    ) {
        let cases = [
            ("<", lv < rv),
            ("<=", lv <= rv),
            (">", lv > rv),
            (">=", lv >= rv),
            ("==", lv == rv),
            ("!=", lv != rv),
        ];
        for (op, expected) in cases {
            let outcome = eval_const(&format!("{le} {op} {re}"));
            prop_assert_eq!(outcome, EvalOutcome::Val(Value::Bool(expected)), "op {}", op);
        }
    }

    /// The parser never panics, whatever the input.
    #[test]
    fn prop_parser_never_panics(input in "[ -~]{0,48}") {
        let _ = ExprTree::parse(&input);
    }

    /// Token soup built from the grammar's alphabet never panics either.
    #[test]
    fn prop_token_soup_never_panics(
        tokens in prop::collection::vec(
            prop::sample::select(vec![
                "x", "42", "(", ")", "&&", "||", "!", "<", "<=", "==",
                "+", "-", "*", "/", ">=",
            ]),
            0..24,
        )
    ) {
        let _ = ExprTree::parse(&tokens.join(" "));
    }

    /// An unresolved leaf poisons arithmetic.
    #[test]
    fn prop_unresolved_poisons_arithmetic((expr, _) in arb_const_expr()) {
        let outcome = eval_const(&format!("ghost + {expr}"));
        prop_assert_eq!(outcome, EvalOutcome::Unresolved);
    }

    /// Absorbing boolean positions mask an unresolved leaf.
    #[test]
    fn prop_absorbing_logic_masks_unresolved(truthy in any::<bool>()) {
        let (expr, expected) = if truthy {
            ("1 || ghost", true)
        } else {
            ("0 && ghost", false)
        };
        prop_assert_eq!(eval_const(expr), EvalOutcome::Val(Value::Bool(expected)));
    }
}
