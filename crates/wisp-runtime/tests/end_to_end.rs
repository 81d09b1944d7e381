//! End-to-end interpreter tests: the six scenarios from base-spec §8,
//! plus the GC/interning invariants from §8's property list.

use pretty_assertions::assert_eq;
use rstest::rstest;
use wisp_runtime::{Heap, InterpretResult, Interpreter};

fn run(source: &str) -> (String, String, InterpretResult) {
    let mut interpreter = Interpreter::new();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let result = interpreter.interpret(source, &mut stdout, &mut stderr);
    (
        String::from_utf8(stdout).unwrap(),
        String::from_utf8(stderr).unwrap(),
        result,
    )
}

#[test]
fn scenario_1_closures_capture_by_reference() {
    let source = r#"
        fun makeCounter() {
            var count = 0;
            fun increment() {
                count = count + 1;
                return count;
            }
            return increment;
        }
        var counter = makeCounter();
        print counter();
        print counter();
        print counter();
    "#;
    let (out, _, result) = run(source);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "1\n2\n3\n");
}

#[test]
fn scenario_2_classes_inheritance_and_super() {
    let source = r#"
        class Animal {
            speak() { print "..."; }
        }
        class Dog < Animal {
            speak() {
                super.speak();
                print "Woof";
            }
        }
        var d = Dog();
        d.speak();
    "#;
    let (out, _, result) = run(source);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "...\nWoof\n");
}

#[test]
fn scenario_3_initializer_binds_fields() {
    let (out, _, result) = run(r#"class Point { init(x, y) { this.x = x; this.y = y; } } var p = Point(1, 2); print p.x + p.y;"#);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "3\n");
}

#[test]
fn scenario_3_returning_value_from_init_is_a_compile_error() {
    let (_, _, result) = run("class Q { init() { return 1; } }");
    assert_eq!(result, InterpretResult::CompileError);
}

#[test]
fn scenario_4_string_interning_determines_equality() {
    let (out, _, result) = run(r#"var a = "foo" + "bar"; var b = "foobar"; print a == b;"#);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "true\n");
}

#[test]
fn scenario_5_local_initializer_self_reference_is_rejected() {
    let (_, err, result) = run("{ var x = x; }");
    assert_eq!(result, InterpretResult::CompileError);
    assert!(err.contains("Can't read local variable in its own initializer."));
}

#[test]
fn scenario_6_arity_mismatch_is_recoverable_in_a_repl_session() {
    let mut interpreter = Interpreter::new();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    interpreter.interpret("fun f(a) {}", &mut stdout, &mut stderr);

    let result = interpreter.interpret("f();", &mut stdout, &mut stderr);
    assert_eq!(result, InterpretResult::RuntimeError);

    stdout.clear();
    let result = interpreter.interpret("f(1);", &mut stdout, &mut stderr);
    assert_eq!(result, InterpretResult::Ok);
}

#[rstest]
#[case("1 + 1;", true)]
#[case("var x = 1;", true)]
#[case("var x = ;", false)]
#[case("class A < A {}", false)]
fn compiles_or_rejects_as_expected(#[case] source: &str, #[case] should_succeed: bool) {
    let (_, _, result) = run(source);
    assert_eq!(result == InterpretResult::Ok, should_succeed);
}

#[test]
fn fibonacci_recursion_runs_to_completion() {
    let source = r#"
        fun fib(n) {
            if (n < 2) return n;
            return fib(n - 1) + fib(n - 2);
        }
        print fib(15);
    "#;
    let (out, _, result) = run(source);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "610\n");
}

#[test]
fn stress_gc_does_not_change_observable_output() {
    let source = r#"
        class Node {
            init(value, next) {
                this.value = value;
                this.next = next;
            }
        }
        fun sumList(node) {
            var total = 0;
            while (node != nil) {
                total = total + node.value;
                node = node.next;
            }
            return total;
        }
        var list = nil;
        var i = 0;
        while (i < 200) {
            list = Node(i, list);
            i = i + 1;
        }
        print sumList(list);
    "#;

    let (calm, _, calm_result) = run(source);

    let mut interpreter = Interpreter::new();
    interpreter.set_stress_gc(true);
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let stressed_result = interpreter.interpret(source, &mut stdout, &mut stderr);
    let stressed = String::from_utf8(stdout).unwrap();

    assert_eq!(calm_result, InterpretResult::Ok);
    assert_eq!(stressed_result, InterpretResult::Ok);
    assert_eq!(calm, stressed);
}

#[test]
fn unreferenced_interned_strings_do_not_leak_across_collections() {
    let mut heap = Heap::new();
    for i in 0..50 {
        heap.intern_str(&format!("garbage{i}"));
    }
    struct NoRoots;
    impl wisp_runtime::heap::RootProvider for NoRoots {
        fn mark_roots(&self, _heap: &mut Heap) {}
    }
    let before = heap.bytes_allocated();
    heap.collect_garbage(&NoRoots);
    assert!(heap.bytes_allocated() < before);
}

#[test]
fn division_by_zero_is_ieee754_not_a_trapped_error() {
    let (out, _, result) = run("print 1 / 0; print -1 / 0; print 0 / 0;");
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "inf\n-inf\nNaN\n");
}

#[test]
fn zero_is_falsey_unlike_the_usual_dialect_convention() {
    let (out, _, result) = run(r#"if (0) { print "truthy"; } else { print "falsey"; }"#);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(out, "falsey\n");
}

#[test]
fn runtime_error_stack_trace_includes_the_innermost_frame() {
    let source = r#"
        fun inner() { return 1 + nil; }
        fun outer() { return inner(); }
        outer();
    "#;
    let (_, err, result) = run(source);
    assert_eq!(result, InterpretResult::RuntimeError);
    assert!(err.contains("inner()"));
    assert!(err.contains("outer()"));
    assert!(err.contains("script"));
}
