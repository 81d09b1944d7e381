//! Property-based tests over small, randomly generated programs.

use proptest::prelude::*;
use wisp_runtime::{InterpretResult, Interpreter};

fn run(source: &str) -> (String, InterpretResult) {
    let mut interpreter = Interpreter::new();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let result = interpreter.interpret(source, &mut stdout, &mut stderr);
    (String::from_utf8(stdout).unwrap(), result)
}

proptest! {
    /// Interning is content-addressed: any two literal occurrences of the
    /// same byte sequence compare equal under `==`, regardless of how the
    /// strings were built (literal vs. concatenation of literal halves).
    #[test]
    fn equal_string_literals_always_compare_equal(s in "[a-zA-Z0-9]{0,16}") {
        let source = format!(r#"print "{s}" == "{s}";"#);
        let (out, result) = run(&source);
        prop_assert_eq!(result, InterpretResult::Ok);
        prop_assert_eq!(out, "true\n");
    }

    /// Integer addition compiled through the VM matches native `f64`
    /// addition for any pair of small integers, since both operands stay
    /// well inside `f64`'s exactly-representable integer range.
    #[test]
    fn addition_matches_host_arithmetic(a in -1000i64..1000, b in -1000i64..1000) {
        let source = format!("print {a} + {b};");
        let (out, result) = run(&source);
        prop_assert_eq!(result, InterpretResult::Ok);
        let expected = format!("{}\n", (a + b) as f64);
        prop_assert_eq!(out, expected);
    }

    /// Every non-zero numeric literal is truthy; `0` (and only `0`) is
    /// falsey, per this language's documented deviation from the usual
    /// dialect convention.
    #[test]
    fn only_zero_is_a_falsey_number(n in -1000i64..1000) {
        let source = format!(r#"if ({n}) {{ print "truthy"; }} else {{ print "falsey"; }}"#);
        let (out, result) = run(&source);
        prop_assert_eq!(result, InterpretResult::Ok);
        let expected = if n == 0 { "falsey\n" } else { "truthy\n" };
        prop_assert_eq!(out, expected);
    }
}
