//! Interpreter execution benchmarks.
//!
//! Benchmarks the compile-and-run path end to end on canonical programs
//! that stress different parts of the VM: arithmetic, recursion, string
//! interning/concatenation, and class/instance dispatch.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use wisp_runtime::interpret;

fn run(source: &str) {
    let _ = interpret(black_box(source));
}

fn bench_arithmetic_loop(c: &mut Criterion) {
    c.bench_function("arithmetic_loop_10k", |b| {
        let code = "var sum = 0; var i = 0; while (i < 10000) { sum = sum + i; i = i + 1; } print sum;";
        b.iter(|| run(code));
    });
}

fn bench_fibonacci(c: &mut Criterion) {
    c.bench_function("fibonacci_recursive_20", |b| {
        let code = "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(20);";
        b.iter(|| run(code));
    });
}

fn bench_string_concat(c: &mut Criterion) {
    c.bench_function("string_concat_500", |b| {
        let code = r#"var s = ""; var i = 0; while (i < 500) { s = s + "x"; i = i + 1; } print s;"#;
        b.iter(|| run(code));
    });
}

fn bench_closures(c: &mut Criterion) {
    c.bench_function("closure_counter_10k_calls", |b| {
        let code = r#"
            fun makeCounter() {
                var count = 0;
                fun increment() { count = count + 1; return count; }
                return increment;
            }
            var counter = makeCounter();
            var i = 0;
            while (i < 10000) { counter(); i = i + 1; }
            print counter();
        "#;
        b.iter(|| run(code));
    });
}

fn bench_class_heavy_workload(c: &mut Criterion) {
    c.bench_function("class_instances_and_methods_5k", |b| {
        let code = r#"
            class Vector {
                init(x, y) { this.x = x; this.y = y; }
                lengthSquared() { return this.x * this.x + this.y * this.y; }
            }
            class Vector3 < Vector {
                init(x, y, z) { super.init(x, y); this.z = z; }
                lengthSquared() { return super.lengthSquared() + this.z * this.z; }
            }
            var total = 0;
            var i = 0;
            while (i < 5000) {
                var v = Vector3(i, i, i);
                total = total + v.lengthSquared();
                i = i + 1;
            }
            print total;
        "#;
        b.iter(|| run(code));
    });
}

criterion_group!(
    benches,
    bench_arithmetic_loop,
    bench_fibonacci,
    bench_string_concat,
    bench_closures,
    bench_class_heavy_workload,
);
criterion_main!(benches);
