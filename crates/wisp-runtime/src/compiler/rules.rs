//! The Pratt table: one `{prefix, infix, precedence}` rule per token
//! kind, and every prefix/infix parse function it dispatches to. This is
//! the textbook precedence-climbing scheme the base spec's §4.2
//! prescribes, carried over unchanged in shape from the teacher's
//! recursive-descent-with-precedence expression parser, just emitting
//! bytecode directly instead of building expression AST nodes.

use super::Compiler;
use crate::chunk::Opcode;
use crate::heap::Heap;
use crate::token::TokenKind;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src> = fn(&mut Compiler<'src>, &mut Heap, bool);

struct ParseRule<'src> {
    prefix: Option<ParseFn<'src>>,
    infix: Option<ParseFn<'src>>,
    precedence: Precedence,
}

fn get_rule<'src>(kind: TokenKind) -> ParseRule<'src> {
    use TokenKind::*;
    match kind {
        LeftParen => ParseRule {
            prefix: Some(Compiler::grouping),
            infix: Some(Compiler::call),
            precedence: Precedence::Call,
        },
        Dot => ParseRule {
            prefix: None,
            infix: Some(Compiler::dot),
            precedence: Precedence::Call,
        },
        Minus => ParseRule {
            prefix: Some(Compiler::unary),
            infix: Some(Compiler::binary),
            precedence: Precedence::Term,
        },
        Plus => ParseRule {
            prefix: None,
            infix: Some(Compiler::binary),
            precedence: Precedence::Term,
        },
        Slash | Star => ParseRule {
            prefix: None,
            infix: Some(Compiler::binary),
            precedence: Precedence::Factor,
        },
        Bang => ParseRule {
            prefix: Some(Compiler::unary),
            infix: None,
            precedence: Precedence::None,
        },
        BangEqual | EqualEqual => ParseRule {
            prefix: None,
            infix: Some(Compiler::binary),
            precedence: Precedence::Equality,
        },
        Greater | GreaterEqual | Less | LessEqual => ParseRule {
            prefix: None,
            infix: Some(Compiler::binary),
            precedence: Precedence::Comparison,
        },
        Identifier => ParseRule {
            prefix: Some(Compiler::variable),
            infix: None,
            precedence: Precedence::None,
        },
        String => ParseRule {
            prefix: Some(Compiler::string_literal),
            infix: None,
            precedence: Precedence::None,
        },
        Number => ParseRule {
            prefix: Some(Compiler::number),
            infix: None,
            precedence: Precedence::None,
        },
        And => ParseRule {
            prefix: None,
            infix: Some(Compiler::and_),
            precedence: Precedence::And,
        },
        Or => ParseRule {
            prefix: None,
            infix: Some(Compiler::or_),
            precedence: Precedence::Or,
        },
        False | Nil | True => ParseRule {
            prefix: Some(Compiler::literal),
            infix: None,
            precedence: Precedence::None,
        },
        This => ParseRule {
            prefix: Some(Compiler::this_),
            infix: None,
            precedence: Precedence::None,
        },
        Super => ParseRule {
            prefix: Some(Compiler::super_),
            infix: None,
            precedence: Precedence::None,
        },
        _ => ParseRule {
            prefix: None,
            infix: None,
            precedence: Precedence::None,
        },
    }
}

impl<'src> Compiler<'src> {
    pub(super) fn expression(&mut self, heap: &mut Heap) {
        self.parse_precedence(heap, Precedence::Assignment);
    }

    pub(super) fn parse_precedence(&mut self, heap: &mut Heap, precedence: Precedence) {
        self.advance();
        let Some(prefix) = get_rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, heap, can_assign);

        while precedence <= get_rule(self.current.kind).precedence {
            self.advance();
            let infix = get_rule(self.previous.kind)
                .infix
                .expect("current token's precedence implies an infix rule exists");
            infix(self, heap, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn number(&mut self, heap: &mut Heap, _can_assign: bool) {
        let value: f64 = self
            .previous
            .lexeme
            .parse()
            .expect("scanner only produces well-formed number lexemes");
        self.emit_constant(heap, Value::Number(value));
    }

    fn string_literal(&mut self, heap: &mut Heap, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let contents = &lexeme[1..lexeme.len() - 1];
        let interned = heap.intern_str(contents);
        self.emit_constant(heap, Value::Obj(interned));
        self.maybe_collect(heap);
    }

    fn grouping(&mut self, heap: &mut Heap, _can_assign: bool) {
        self.expression(heap);
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, heap: &mut Heap, _can_assign: bool) {
        let op_kind = self.previous.kind;
        self.parse_precedence(heap, Precedence::Unary);
        match op_kind {
            TokenKind::Bang => self.emit_op(heap, Opcode::Not),
            TokenKind::Minus => self.emit_op(heap, Opcode::Negate),
            _ => unreachable!("unary rule only registered for '!' and '-'"),
        }
    }

    fn binary(&mut self, heap: &mut Heap, _can_assign: bool) {
        let op_kind = self.previous.kind;
        let rule_precedence = get_rule::<'src>(op_kind).precedence;
        self.parse_precedence(heap, rule_precedence.next());
        match op_kind {
            TokenKind::BangEqual => self.emit_op(heap, Opcode::NotEqual),
            TokenKind::EqualEqual => self.emit_op(heap, Opcode::Equal),
            TokenKind::Greater => self.emit_op(heap, Opcode::Greater),
            TokenKind::GreaterEqual => self.emit_op(heap, Opcode::GreaterEqual),
            TokenKind::Less => self.emit_op(heap, Opcode::Less),
            TokenKind::LessEqual => self.emit_op(heap, Opcode::LessEqual),
            TokenKind::Plus => self.emit_op(heap, Opcode::Add),
            TokenKind::Minus => self.emit_op(heap, Opcode::Subtract),
            TokenKind::Star => self.emit_op(heap, Opcode::Multiply),
            TokenKind::Slash => self.emit_op(heap, Opcode::Divide),
            _ => unreachable!("binary rule only registered for the operators matched above"),
        }
    }

    fn literal(&mut self, heap: &mut Heap, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(heap, Opcode::False),
            TokenKind::True => self.emit_op(heap, Opcode::True),
            TokenKind::Nil => self.emit_op(heap, Opcode::Nil),
            _ => unreachable!("literal rule only registered for false/true/nil"),
        }
    }

    fn and_(&mut self, heap: &mut Heap, _can_assign: bool) {
        let end_jump = self.emit_jump(heap, Opcode::JumpIfFalse);
        self.emit_op(heap, Opcode::Pop);
        self.parse_precedence(heap, Precedence::And);
        self.patch_jump(heap, end_jump);
    }

    fn or_(&mut self, heap: &mut Heap, _can_assign: bool) {
        let else_jump = self.emit_jump(heap, Opcode::JumpIfFalse);
        let end_jump = self.emit_jump(heap, Opcode::Jump);
        self.patch_jump(heap, else_jump);
        self.emit_op(heap, Opcode::Pop);
        self.parse_precedence(heap, Precedence::Or);
        self.patch_jump(heap, end_jump);
    }

    fn call(&mut self, heap: &mut Heap, _can_assign: bool) {
        let arg_count = self.argument_list(heap);
        self.emit_op(heap, Opcode::Call);
        self.emit_byte(heap, arg_count);
    }

    pub(super) fn argument_list(&mut self, heap: &mut Heap) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression(heap);
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(255) as u8
    }

    fn dot(&mut self, heap: &mut Heap, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme;
        let const_idx = self.identifier_constant(heap, name);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression(heap);
            self.emit_constant_indexed(heap, Opcode::SetProperty, Opcode::SetPropertyLong, const_idx);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list(heap);
            self.emit_constant_indexed(heap, Opcode::Invoke, Opcode::InvokeLong, const_idx);
            self.emit_byte(heap, arg_count);
        } else {
            self.emit_constant_indexed(heap, Opcode::GetProperty, Opcode::GetPropertyLong, const_idx);
        }
    }

    fn this_(&mut self, heap: &mut Heap, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable(heap, "this", false);
    }

    fn super_(&mut self, heap: &mut Heap, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme;
        let const_idx = self.identifier_constant(heap, name);

        self.named_variable(heap, "this", false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list(heap);
            self.named_variable(heap, "super", false);
            self.emit_constant_indexed(heap, Opcode::SuperInvoke, Opcode::SuperInvokeLong, const_idx);
            self.emit_byte(heap, arg_count);
        } else {
            self.named_variable(heap, "super", false);
            self.emit_constant_indexed(heap, Opcode::GetSuper, Opcode::GetSuperLong, const_idx);
        }
    }

    pub(super) fn variable(&mut self, heap: &mut Heap, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(heap, name, can_assign);
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

    /// `*` binds tighter than `+`, so `1 + 2 * 3` emits the multiply
    /// before the add, not in source order.
    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let (script, heap) = compile_ok("1 + 2 * 3;");
        let code = &heap.get_function(script).chunk.code;
        let mul_pos = code.iter().position(|&b| b == Opcode::Multiply as u8).unwrap();
        let add_pos = code.iter().position(|&b| b == Opcode::Add as u8).unwrap();
        assert!(mul_pos < add_pos);
    }

    #[test]
    fn invalid_assignment_target_is_a_compile_error() {
        let mut heap = Heap::new();
        let diagnostics = super::super::compile("1 + 2 = 3;", &mut heap).unwrap_err();
        assert!(!diagnostics.is_empty());
    }

    #[test]
    fn more_than_255_arguments_is_a_compile_error() {
        let args = (0..300).map(|n| n.to_string()).collect::<Vec<_>>().join(", ");
        let source = format!("foo({args});");
        let mut heap = Heap::new();
        let diagnostics = super::super::compile(&source, &mut heap).unwrap_err();
        assert!(diagnostics.iter().any(|d| d.message.contains("Can't have more than 255 arguments.")));
    }

    #[test]
    fn this_outside_a_class_is_a_compile_error() {
        let mut heap = Heap::new();
        let diagnostics = super::super::compile("print this;", &mut heap).unwrap_err();
        assert!(diagnostics.iter().any(|d| d.message.contains("Can't use 'this' outside of a class.")));
    }

    #[test]
    fn super_with_no_superclass_is_a_compile_error() {
        let mut heap = Heap::new();
        let source = "class A { who() { print super.who(); } }";
        let diagnostics = super::super::compile(source, &mut heap).unwrap_err();
        assert!(diagnostics
            .iter()
            .any(|d| d.message.contains("Can't use 'super' in a class with no superclass.")));
    }

    #[test]
    fn grouping_overrides_default_precedence() {
        let (script, heap) = compile_ok("(1 + 2) * 3;");
        let code = &heap.get_function(script).chunk.code;
        let add_pos = code.iter().position(|&b| b == Opcode::Add as u8).unwrap();
        let mul_pos = code.iter().position(|&b| b == Opcode::Multiply as u8).unwrap();
        assert!(add_pos < mul_pos);
    }
}
