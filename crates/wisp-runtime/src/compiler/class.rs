//! Class and method compilation: the class-compiler stack, `super`
//! binding via a synthetic local, and `OP_INHERIT`/`OP_METHOD` emission
//! order, per the base spec's §4.2 class-compilation notes.

use super::{ClassState, Compiler, FunctionKind};
use crate::chunk::Opcode;
use crate::heap::Heap;
use crate::token::TokenKind;

impl<'src> Compiler<'src> {
    pub(super) fn class_declaration(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme;
        let name_const = self.identifier_constant(heap, class_name);
        self.declare_variable(class_name);

        self.emit_constant_indexed(heap, Opcode::Class, Opcode::ClassLong, name_const);
        self.define_variable(heap, name_const);

        self.classes.push(ClassState {
            name: class_name,
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let superclass_name = self.previous.lexeme;
            if superclass_name == class_name {
                self.error("A class can't inherit from itself.");
            }
            self.variable(heap, false);

            self.begin_scope();
            self.add_local("super");
            self.mark_initialized();

            self.named_variable(heap, class_name, false);
            self.emit_op(heap, Opcode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(heap, class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method(heap);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(heap, Opcode::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope(heap);
        }
        self.classes.pop();
    }

    fn method(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme;
        let const_idx = self.identifier_constant(heap, name);
        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(heap, kind, name);
        self.emit_constant_indexed(heap, Opcode::Method, Opcode::MethodLong, const_idx);
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
    fn a_class_cannot_inherit_from_itself() {
        let mut heap = Heap::new();
        let diagnostics = super::super::compile("class A < A {}", &mut heap).unwrap_err();
        assert!(diagnostics.iter().any(|d| d.message.contains("A class can't inherit from itself.")));
    }

    #[test]
    fn plain_class_with_no_superclass_emits_no_inherit_opcode() {
        let (script, heap) = compile_ok("class A { greet() { print \"hi\"; } }");
        let code = &heap.get_function(script).chunk.code;
        assert!(!code.contains(&(Opcode::Inherit as u8)));
        assert!(code.contains(&(Opcode::Class as u8)));
        assert!(code.contains(&(Opcode::Method as u8)));
    }

    #[test]
    fn a_subclass_emits_inherit_before_its_own_methods() {
        let (script, heap) = compile_ok("class A { f() {} } class B < A { g() {} }");
        let code = &heap.get_function(script).chunk.code;
        let inherit_pos = code.iter().position(|&b| b == Opcode::Inherit as u8).unwrap();
        let method_positions: Vec<_> = code.iter().enumerate().filter(|(_, &b)| b == Opcode::Method as u8).map(|(i, _)| i).collect();
        assert_eq!(method_positions.len(), 2);
        assert!(method_positions.iter().any(|&p| p > inherit_pos));
    }

    #[test]
    fn an_init_method_compiles_as_an_initializer() {
        compile_ok("class Point { init(x) { this.x = x; } }");
    }
}
