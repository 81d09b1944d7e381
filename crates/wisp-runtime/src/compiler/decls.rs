//! Statements, declarations, local/upvalue resolution, and the jump/loop
//! emission helpers that implement them. Grounded on
//! `atlas-runtime::compiler`'s `Local`/`UpvalueCapture`/`UpvalueContext`
//! bookkeeping (see [`super::FunctionState`]), but driving emission
//! directly rather than annotating AST nodes.

use super::{Compiler, FunctionKind, FunctionState, Local, UpvalueDescriptor};
use crate::chunk::Opcode;
use crate::heap::Heap;
use crate::token::TokenKind;

enum Resolved {
    Local(u8),
    Upvalue(u8),
    Global(usize),
}

impl<'src> Compiler<'src> {
    pub(super) fn declaration(&mut self, heap: &mut Heap) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration(heap);
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration(heap);
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(heap);
        } else {
            self.statement(heap);
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- declarations --------------------------------------------------

    pub(super) fn var_declaration(&mut self, heap: &mut Heap) {
        let global = self.parse_variable(heap, "Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression(heap);
        } else {
            self.emit_op(heap, Opcode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(heap, global);
    }

    fn fun_declaration(&mut self, heap: &mut Heap) {
        let global = self.parse_variable(heap, "Expect function name.");
        self.mark_initialized();
        let name = self.previous.lexeme;
        self.function(heap, FunctionKind::Function, name);
        self.define_variable(heap, global);
    }

    /// Compiles a nested function body end to end: pushes a fresh
    /// [`FunctionState`], parses `(params) { body }`, finalizes it, and
    /// emits `OP_CLOSURE` plus its upvalue descriptor pairs into the
    /// *enclosing* chunk. Shared by `fun` declarations and methods.
    pub(super) fn function(&mut self, heap: &mut Heap, kind: FunctionKind, name: &str) {
        let function_ref = heap.alloc_function();
        // Push onto the function stack *before* interning the name, so
        // `function_ref` is already a GC root (via `CompilerRoots`) by
        // the time `maybe_collect` can possibly run.
        self.functions.push(FunctionState::new(function_ref, kind));
        let interned_name = heap.intern_str(name);
        heap.get_function_mut(function_ref).name = Some(interned_name);
        self.maybe_collect(heap);

        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = heap.get_function(function_ref).arity as usize + 1;
                if arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                heap.get_function_mut(function_ref).arity = arity.min(255) as u8;
                let const_idx = self.parse_variable(heap, "Expect parameter name.");
                self.define_variable(heap, const_idx);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block(heap);

        let state = self.end_compiler(heap);
        let const_idx = self.current_chunk(heap).add_constant(crate::value::Value::Obj(state.function));
        self.emit_closure(heap, const_idx);
        for upvalue in &state.upvalues {
            self.emit_byte(heap, upvalue.is_local as u8);
            self.emit_byte(heap, upvalue.index);
        }
    }

    // ---- statements ----------------------------------------------------

    pub(super) fn statement(&mut self, heap: &mut Heap) {
        if self.match_token(TokenKind::Print) {
            self.print_statement(heap);
        } else if self.match_token(TokenKind::If) {
            self.if_statement(heap);
        } else if self.match_token(TokenKind::While) {
            self.while_statement(heap);
        } else if self.match_token(TokenKind::For) {
            self.for_statement(heap);
        } else if self.match_token(TokenKind::Return) {
            self.return_statement(heap);
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block(heap);
            self.end_scope(heap);
        } else {
            self.expression_statement(heap);
        }
    }

    pub(super) fn block(&mut self, heap: &mut Heap) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration(heap);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self, heap: &mut Heap) {
        self.expression(heap);
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(heap, Opcode::Print);
    }

    fn expression_statement(&mut self, heap: &mut Heap) {
        self.expression(heap);
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(heap, Opcode::Pop);
    }

    fn if_statement(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression(heap);
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(heap, Opcode::JumpIfFalse);
        self.emit_op(heap, Opcode::Pop);
        self.statement(heap);

        let else_jump = self.emit_jump(heap, Opcode::Jump);
        self.patch_jump(heap, then_jump);
        self.emit_op(heap, Opcode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement(heap);
        }
        self.patch_jump(heap, else_jump);
    }

    fn while_statement(&mut self, heap: &mut Heap) {
        let loop_start = self.current_chunk(heap).current_offset();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression(heap);
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(heap, Opcode::JumpIfFalse);
        self.emit_op(heap, Opcode::Pop);
        self.statement(heap);
        self.emit_loop(heap, loop_start);

        self.patch_jump(heap, exit_jump);
        self.emit_op(heap, Opcode::Pop);
    }

    /// Desugars to the same shape a `while` loop compiles to, with the
    /// increment clause spliced in right before the loop edge, per the
    /// base spec's §4.2 "for" description.
    fn for_statement(&mut self, heap: &mut Heap) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(heap);
        } else {
            self.expression_statement(heap);
        }

        let mut loop_start = self.current_chunk(heap).current_offset();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression(heap);
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(heap, Opcode::JumpIfFalse));
            self.emit_op(heap, Opcode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(heap, Opcode::Jump);
            let increment_start = self.current_chunk(heap).current_offset();
            self.expression(heap);
            self.emit_op(heap, Opcode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(heap, loop_start);
            loop_start = increment_start;
            self.patch_jump(heap, body_jump);
        }

        self.statement(heap);
        self.emit_loop(heap, loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(heap, exit_jump);
            self.emit_op(heap, Opcode::Pop);
        }

        self.end_scope(heap);
    }

    fn return_statement(&mut self, heap: &mut Heap) {
        if self.current_fn().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return(heap);
        } else {
            if self.current_fn().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression(heap);
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(heap, Opcode::Return);
        }
    }

    // ---- scopes and locals --------------------------------------------

    pub(super) fn begin_scope(&mut self) {
        self.current_fn_mut().scope_depth += 1;
    }

    pub(super) fn end_scope(&mut self, heap: &mut Heap) {
        self.current_fn_mut().scope_depth -= 1;
        let depth = self.current_fn().scope_depth as i32;
        while let Some(local) = self.current_fn().locals.last() {
            if local.depth <= depth {
                break;
            }
            let is_captured = local.is_captured;
            self.current_fn_mut().locals.pop();
            if is_captured {
                self.emit_op(heap, Opcode::CloseUpvalue);
            } else {
                self.emit_op(heap, Opcode::Pop);
            }
        }
    }

    pub(super) fn declare_variable(&mut self, name: &'src str) {
        if self.current_fn().scope_depth == 0 {
            return;
        }
        let depth = self.current_fn().scope_depth as i32;
        let mut duplicate = false;
        for local in self.current_fn().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
            return;
        }
        self.add_local(name);
    }

    pub(super) fn add_local(&mut self, name: &'src str) {
        if self.current_fn().locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_fn_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    pub(super) fn mark_initialized(&mut self) {
        if self.current_fn().scope_depth == 0 {
            return;
        }
        let depth = self.current_fn().scope_depth as i32;
        if let Some(local) = self.current_fn_mut().locals.last_mut() {
            local.depth = depth;
        }
    }

    pub(super) fn parse_variable(&mut self, heap: &mut Heap, message: &str) -> usize {
        self.consume(TokenKind::Identifier, message);
        let name = self.previous.lexeme;
        self.declare_variable(name);
        if self.current_fn().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(heap, name)
    }

    pub(super) fn define_variable(&mut self, heap: &mut Heap, global_const_index: usize) {
        if self.current_fn().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_constant_indexed(heap, Opcode::DefineGlobal, Opcode::DefineGlobalLong, global_const_index);
    }

    fn resolve_local(&mut self, fn_index: usize, name: &str) -> Option<usize> {
        let locals = &self.functions[fn_index].locals;
        for (idx, local) in locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(idx);
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, fn_index: usize, name: &str) -> Option<usize> {
        if fn_index == 0 {
            return None;
        }
        let enclosing = fn_index - 1;
        if let Some(local_idx) = self.resolve_local(enclosing, name) {
            self.functions[enclosing].locals[local_idx].is_captured = true;
            return Some(self.add_upvalue(fn_index, local_idx as u8, true));
        }
        if let Some(upvalue_idx) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(fn_index, upvalue_idx as u8, false));
        }
        None
    }

    fn add_upvalue(&mut self, fn_index: usize, index: u8, is_local: bool) -> usize {
        let upvalues = &self.functions[fn_index].upvalues;
        if let Some(pos) = upvalues.iter().position(|u| u.index == index && u.is_local == is_local) {
            return pos;
        }
        if upvalues.len() >= 256 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.functions[fn_index].upvalues.push(UpvalueDescriptor { index, is_local });
        self.functions[fn_index].upvalues.len() - 1
    }

    fn resolve_name(&mut self, heap: &mut Heap, name: &'src str) -> Resolved {
        let fn_index = self.functions.len() - 1;
        if let Some(slot) = self.resolve_local(fn_index, name) {
            Resolved::Local(slot as u8)
        } else if let Some(slot) = self.resolve_upvalue(fn_index, name) {
            Resolved::Upvalue(slot as u8)
        } else {
            Resolved::Global(self.identifier_constant(heap, name))
        }
    }

    pub(super) fn named_variable(&mut self, heap: &mut Heap, name: &'src str, can_assign: bool) {
        let resolved = self.resolve_name(heap, name);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression(heap);
            match resolved {
                Resolved::Local(slot) => {
                    self.emit_op(heap, Opcode::SetLocal);
                    self.emit_byte(heap, slot);
                }
                Resolved::Upvalue(slot) => {
                    self.emit_op(heap, Opcode::SetUpvalue);
                    self.emit_byte(heap, slot);
                }
                Resolved::Global(idx) => {
                    self.emit_constant_indexed(heap, Opcode::SetGlobal, Opcode::SetGlobalLong, idx);
                }
            }
        } else {
            match resolved {
                Resolved::Local(slot) => {
                    self.emit_op(heap, Opcode::GetLocal);
                    self.emit_byte(heap, slot);
                }
                Resolved::Upvalue(slot) => {
                    self.emit_op(heap, Opcode::GetUpvalue);
                    self.emit_byte(heap, slot);
                }
                Resolved::Global(idx) => {
                    self.emit_constant_indexed(heap, Opcode::GetGlobal, Opcode::GetGlobalLong, idx);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::chunk::Opcode;
    use crate::heap::Heap;

    fn compile_ok(source: &str) -> (crate::heap::ObjRef, Heap) {
        let mut heap = Heap::new();
        let script = super::super::compile(source, &mut heap).expect("expected source to compile");
        (script, heap)
    }

    #[test]
    fn shadowing_a_local_in_the_same_scope_is_rejected() {
        let mut heap = Heap::new();
        let diagnostics = super::super::compile("{ var a = 1; var a = 2; }", &mut heap).unwrap_err();
        assert!(diagnostics
            .iter()
            .any(|d| d.message.contains("Already a variable with this name in this scope.")));
    }

    #[test]
    fn shadowing_across_nested_scopes_is_allowed() {
        compile_ok("{ var a = 1; { var a = 2; print a; } print a; }");
    }

    #[test]
    fn for_loop_desugars_to_a_while_with_the_increment_before_the_loop_edge() {
        let (script, heap) = compile_ok("for (var i = 0; i < 10; i = i + 1) print i;");
        let code = &heap.get_function(script).chunk.code;
        assert!(code.contains(&(Opcode::JumpIfFalse as u8)));
        assert!(code.contains(&(Opcode::Loop as u8)));
        assert!(code.contains(&(Opcode::Print as u8)));
    }

    #[test]
    fn returning_a_value_from_top_level_code_is_rejected() {
        let mut heap = Heap::new();
        let diagnostics = super::super::compile("return 1;", &mut heap).unwrap_err();
        assert!(diagnostics.iter().any(|d| d.message.contains("Can't return from top-level code.")));
    }

    #[test]
    fn panic_mode_recovers_at_the_next_statement_boundary() {
        let mut heap = Heap::new();
        let diagnostics = super::super::compile("var ; var x = 1; print x;", &mut heap).unwrap_err();
        assert_eq!(diagnostics.len(), 1);
    }

    #[test]
    fn closing_a_captured_local_emits_close_upvalue_not_pop() {
        let source = r#"
            fun outer() {
                var x = 1;
                fun inner() { return x; }
                return inner;
            }
        "#;
        let (script, heap) = compile_ok(source);
        let function = heap.get_function(script);
        let outer_ref = function
            .chunk
            .constants
            .iter()
            .find_map(|v| match v {
                crate::value::Value::Obj(r) if heap.kind_of(*r) == crate::object::ObjKind::Function => Some(*r),
                _ => None,
            })
            .expect("outer() constant present");
        let outer = heap.get_function(outer_ref);
        assert!(outer.chunk.code.contains(&(Opcode::CloseUpvalue as u8)));
    }
}
