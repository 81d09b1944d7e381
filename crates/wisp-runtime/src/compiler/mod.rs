//! Single-pass compiler: scanner, Pratt parser, local/upvalue resolver,
//! and bytecode emitter fused into one pass over the token stream, per
//! the base spec's §4.2 — there is no persistent AST here, unlike
//! `atlas-runtime::compiler`'s two-pass (parse-to-AST, then
//! AST-to-bytecode) design. What's kept from the teacher is the
//! bookkeeping shape: a per-function `locals`/`scope_depth`/`upvalues`
//! record (`atlas-runtime::compiler::{Local, UpvalueCapture,
//! UpvalueContext}`), generalized here to drive emission directly
//! instead of annotating an AST node after the fact.
//!
//! Submodules hold everything that isn't core driver plumbing:
//! [`rules`] is the Pratt table and expression parse functions,
//! [`decls`] is statements/declarations/jumps/scoping, [`class`] is
//! class and method compilation.

mod class;
mod decls;
mod rules;

use crate::chunk::{Chunk, Opcode};
use crate::diagnostic::{Diagnostic, ErrorLocation};
use crate::heap::{Heap, ObjRef, RootProvider};
use crate::scanner::Scanner;
use crate::token::{Token, TokenKind};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// `-1` means declared but not yet initialized (its own initializer
    /// expression is still being compiled); reading it in that state is
    /// a compile error.
    depth: i32,
    is_captured: bool,
}

pub(crate) struct UpvalueDescriptor {
    pub(crate) index: u8,
    pub(crate) is_local: bool,
}

struct FunctionState<'src> {
    function: ObjRef,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    scope_depth: u32,
    upvalues: Vec<UpvalueDescriptor>,
}

impl<'src> FunctionState<'src> {
    /// Slot 0 of every frame is reserved: `this` for methods and
    /// initializers (so `OP_GET_LOCAL 0` inside a method reaches the
    /// receiver), the empty name otherwise (nothing can ever name it,
    /// so user code can't shadow it).
    fn new(function: ObjRef, kind: FunctionKind) -> Self {
        let slot0 = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
            "this"
        } else {
            ""
        };
        Self {
            function,
            kind,
            locals: vec![Local {
                name: slot0,
                depth: 0,
                is_captured: false,
            }],
            scope_depth: 0,
            upvalues: Vec::new(),
        }
    }
}

struct ClassState<'src> {
    name: &'src str,
    has_superclass: bool,
}

pub struct Compiler<'src> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
    functions: Vec<FunctionState<'src>>,
    classes: Vec<ClassState<'src>>,
}

/// Roots a GC cycle needs while compilation is still in progress: every
/// `ObjFunction` currently under construction. None of them are
/// reachable any other way yet — the outermost one isn't even bound to
/// a global until `compile` returns it.
struct CompilerRoots<'a, 'src> {
    functions: &'a [FunctionState<'src>],
}

impl<'a, 'src> RootProvider for CompilerRoots<'a, 'src> {
    fn mark_roots(&self, heap: &mut Heap) {
        for state in self.functions {
            heap.mark_object(state.function);
        }
    }
}

/// Compile `source` into a top-level script function. On success, the
/// returned `ObjRef` is an `ObjFunction` with no name and zero arity —
/// the VM wraps it in a closure and calls it like any other.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Vec<Diagnostic>> {
    let script = heap.alloc_function();
    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        previous: Token::new(TokenKind::Eof, "", 0),
        current: Token::new(TokenKind::Eof, "", 0),
        had_error: false,
        panic_mode: false,
        diagnostics: Vec::new(),
        functions: vec![FunctionState::new(script, FunctionKind::Script)],
        classes: Vec::new(),
    };
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration(heap);
    }
    let state = compiler.end_compiler(heap);
    if compiler.had_error {
        Err(compiler.diagnostics)
    } else {
        Ok(state.function)
    }
}

impl<'src> Compiler<'src> {
    fn current_fn(&self) -> &FunctionState<'src> {
        self.functions
            .last()
            .expect("compiler always has an active function while parsing")
    }

    fn current_fn_mut(&mut self) -> &mut FunctionState<'src> {
        self.functions
            .last_mut()
            .expect("compiler always has an active function while parsing")
    }

    fn current_chunk<'h>(&self, heap: &'h mut Heap) -> &'h mut Chunk {
        &mut heap.get_function_mut(self.current_fn().function).chunk
    }

    /// Checked after any allocation that lands somewhere already
    /// reachable from an in-progress function (its constants pool) —
    /// never between an allocation and the point it gets attached there.
    fn maybe_collect(&mut self, heap: &mut Heap) {
        if heap.should_collect() {
            let roots = CompilerRoots {
                functions: &self.functions,
            };
            heap.collect_garbage(&roots);
        }
    }

    // ---- token stream --------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // ---- error reporting -------------------------------------------------

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    /// Once a parse error has been reported, later cascading errors from
    /// the same confusion are suppressed until `synchronize` resets
    /// `panic_mode` at the next statement boundary.
    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let location = match token.kind {
            TokenKind::Eof => ErrorLocation::AtEnd,
            TokenKind::Error => ErrorLocation::None,
            _ => ErrorLocation::AtLexeme(token.lexeme.to_string()),
        };
        self.diagnostics
            .push(Diagnostic::error(token.line, location, message.to_string()));
    }

    // ---- emission ----------------------------------------------------------

    fn emit_byte(&mut self, heap: &mut Heap, byte: u8) {
        let line = self.previous.line;
        self.current_chunk(heap).write_byte(byte, line);
    }

    fn emit_op(&mut self, heap: &mut Heap, op: Opcode) {
        self.emit_byte(heap, op as u8);
    }

    fn emit_jump(&mut self, heap: &mut Heap, op: Opcode) -> usize {
        self.emit_byte(heap, op as u8);
        self.emit_byte(heap, 0xff);
        self.emit_byte(heap, 0xff);
        self.current_chunk(heap).current_offset() - 2
    }

    fn patch_jump(&mut self, heap: &mut Heap, offset: usize) {
        if let Err(message) = self.current_chunk(heap).patch_jump(offset) {
            self.error(&message);
        }
    }

    fn emit_loop(&mut self, heap: &mut Heap, loop_start: usize) {
        let line = self.previous.line;
        self.emit_byte(heap, Opcode::Loop as u8);
        let here = self.current_chunk(heap).current_offset();
        let distance = here - loop_start + 2;
        if distance > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.current_chunk(heap).write_u16(distance as u16, line);
    }

    /// Emits the short or long form of a constant-indexed opcode
    /// depending on whether `index` fits in one byte, per every
    /// short/long opcode pair in the base spec's §4.3 table.
    fn emit_constant_indexed(&mut self, heap: &mut Heap, short_op: Opcode, long_op: Opcode, index: usize) {
        if index < 256 {
            self.emit_op(heap, short_op);
            self.emit_byte(heap, index as u8);
        } else if index <= 0xFF_FFFF {
            self.emit_op(heap, long_op);
            let line = self.previous.line;
            self.current_chunk(heap).write_u24(index as u32, line);
        } else {
            self.error("Too many constants in one chunk.");
        }
    }

    /// `OP_CLOSURE` is pinned to a 1-byte constant operand with no long
    /// form, per the base spec: nested function definitions beyond the
    /// first 256 constants in a chunk are a compile error rather than a
    /// wider encoding.
    fn emit_closure(&mut self, heap: &mut Heap, index: usize) {
        if index >= 256 {
            self.error("Too many constants in one chunk.");
            return;
        }
        self.emit_op(heap, Opcode::Closure);
        self.emit_byte(heap, index as u8);
    }

    fn emit_constant(&mut self, heap: &mut Heap, value: Value) {
        let index = self.current_chunk(heap).add_constant(value);
        self.emit_constant_indexed(heap, Opcode::Constant, Opcode::ConstantLong, index);
    }

    fn emit_return(&mut self, heap: &mut Heap) {
        if self.current_fn().kind == FunctionKind::Initializer {
            self.emit_byte(heap, Opcode::GetLocal as u8);
            self.emit_byte(heap, 0);
        } else {
            self.emit_op(heap, Opcode::Nil);
        }
        self.emit_op(heap, Opcode::Return);
    }

    /// Interns `name` and adds it to the current chunk's constants pool,
    /// returning its index. Safe to call without an intervening
    /// `maybe_collect`: the string is attached to the (rooted) constants
    /// pool in the very next statement, with no allocation in between
    /// that could trigger a collection first.
    fn identifier_constant(&mut self, heap: &mut Heap, name: &str) -> usize {
        let interned = heap.intern_str(name);
        let index = self.current_chunk(heap).add_constant(Value::Obj(interned));
        self.maybe_collect(heap);
        index
    }

    /// Finalizes the function at the top of the compiler stack: emits
    /// the implicit return, records its upvalue count, and pops it off.
    /// The caller (top-level `compile`, or [`decls`]'s `function`) is
    /// responsible for wiring the result into the enclosing chunk.
    fn end_compiler(&mut self, heap: &mut Heap) -> FunctionState<'src> {
        self.emit_return(heap);
        let state = self
            .functions
            .pop()
            .expect("end_compiler called with no active function");
        heap.get_function_mut(state.function).upvalue_count = state.upvalues.len() as u8;
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Opcode;

    fn compile_ok(source: &str) -> (ObjRef, Heap) {
        let mut heap = Heap::new();
        let script = compile(source, &mut heap).expect("expected source to compile");
        (script, heap)
    }

    #[test]
    fn empty_source_compiles_to_a_script_with_a_bare_return() {
        let (script, heap) = compile_ok("");
        let function = heap.get_function(script);
        assert_eq!(function.arity, 0);
        assert_eq!(function.name, None);
        assert_eq!(function.chunk.code, vec![Opcode::Nil as u8, Opcode::Return as u8]);
    }

    #[test]
    fn print_statement_emits_print_opcode() {
        let (script, heap) = compile_ok("print 1;");
        let function = heap.get_function(script);
        assert!(function.chunk.code.contains(&(Opcode::Print as u8)));
    }

    #[test]
    fn unterminated_string_is_a_compile_error() {
        let mut heap = Heap::new();
        let diagnostics = compile("\"unterminated", &mut heap).unwrap_err();
        assert!(!diagnostics.is_empty());
    }

    #[test]
    fn missing_semicolon_reports_expected_location() {
        let mut heap = Heap::new();
        let diagnostics = compile("var x = 1", &mut heap).unwrap_err();
        assert_eq!(diagnostics.len(), 1);
        assert!(matches!(diagnostics[0].location, ErrorLocation::AtEnd));
    }

    #[test]
    fn panic_mode_suppresses_cascading_errors_until_synchronize() {
        let mut heap = Heap::new();
        // Two independent malformed statements on separate lines: without
        // synchronization the first error would cascade into spurious
        // reports for the rest of the first statement's tokens.
        let diagnostics = compile("var;\nvar;\n", &mut heap).unwrap_err();
        assert_eq!(diagnostics.len(), 2);
    }

    #[test]
    fn redeclaring_a_local_in_the_same_scope_is_rejected() {
        let mut heap = Heap::new();
        let diagnostics = compile("{ var x = 1; var x = 2; }", &mut heap).unwrap_err();
        assert!(diagnostics[0].message.contains("Already a variable with this name"));
    }

    #[test]
    fn returning_from_top_level_code_is_rejected() {
        let mut heap = Heap::new();
        let diagnostics = compile("return 1;", &mut heap).unwrap_err();
        assert!(diagnostics[0].message.contains("Can't return from top-level code."));
    }
}
