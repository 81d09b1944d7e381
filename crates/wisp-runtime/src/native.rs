//! Native (host-provided) function bodies.
//!
//! The base spec treats native function bodies as an external collaborator's
//! concern; these two are the minimum needed for the repository to run
//! anything, registered once at `VM::new`.

use crate::error::RuntimeError;
use crate::heap::Heap;
use crate::value::Value;

/// Wall-clock seconds since this VM started, in lieu of the reference's
/// process-accumulated CPU time — close enough for a hosted embedding
/// with no `libc::clock()` equivalent in safe, portable Rust. Documented
/// as an Open Question resolution in DESIGN.md.
pub fn clock(heap: &mut Heap, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Number(heap.start_time.elapsed().as_secs_f64()))
}

/// Read one line from stdin, interning it. Returns `Nil` at EOF.
pub fn readln(heap: &mut Heap, _args: &[Value]) -> Result<Value, RuntimeError> {
    let mut line = String::new();
    match std::io::stdin().read_line(&mut line) {
        Ok(0) => Ok(Value::Nil),
        Ok(_) => {
            let trimmed = line.trim_end_matches(['\n', '\r']);
            Ok(Value::Obj(heap.intern_str(trimmed)))
        }
        Err(e) => Err(RuntimeError::Native(e.to_string())),
    }
}
