//! # Expression parsing — the precedence-climbing table
//!
//! Every token kind gets at most a prefix rule, an infix rule, and an
//! infix precedence, per the ladder `None < Assignment < Or < And <
//! Equality < Comparison < Term < Factor < Unary < Call < Primary`.
//! [`parse_precedence`] is the climb; [`get_rule`] is the table, written as
//! a match rather than the array-of-function-pointers a C implementation
//! would use — a flat switch reads the same way and needs no static
//! initialization dance.
//!
//! Assignment-target validity is checked once, after a whole expression
//! has been parsed, rather than threaded through every prefix rule as a
//! `can_assign` invariant each one has to individually honor: if a trailing
//! `=` is still sitting there after the climb finishes, whatever was
//! parsed wasn't a valid place to assign to.

use super::Compiler;
use crate::chunk::OpCode;
use crate::heap::Heap;
use crate::scanner::TokenKind;
use crate::value::{format_number, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
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
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
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
    let (prefix, infix, precedence): (Option<ParseFn>, Option<ParseFn>, Precedence) = match kind {
        LeftParen => (Some(grouping), Some(call), Precedence::Call),
        LeftBracket => (Some(array_literal), Some(index), Precedence::Call),
        LeftBrace => (Some(map_literal), None, Precedence::None),
        Dot => (None, Some(dot), Precedence::Call),
        Minus => (Some(unary), Some(binary), Precedence::Term),
        Plus => (None, Some(binary), Precedence::Term),
        Slash | Star | Percent => (None, Some(binary), Precedence::Factor),
        Bang => (Some(unary), None, Precedence::None),
        BangEqual | EqualEqual => (None, Some(binary), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => (None, Some(binary), Precedence::Comparison),
        Identifier => (Some(variable), None, Precedence::None),
        String => (Some(string), None, Precedence::None),
        Number => (Some(number), None, Precedence::None),
        And => (None, Some(and_), Precedence::And),
        Or => (None, Some(or_), Precedence::Or),
        False | True | Nil => (Some(literal), None, Precedence::None),
        This => (Some(this_), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

pub fn expression<'src>(c: &mut Compiler<'src>, heap: &mut Heap) {
    parse_precedence(c, heap, Precedence::Assignment);
}

fn parse_precedence<'src>(c: &mut Compiler<'src>, heap: &mut Heap, precedence: Precedence) {
    c.advance();
    let prefix = get_rule(c.previous.kind).prefix;
    let prefix = match prefix {
        Some(f) => f,
        None => {
            c.error("Expect expression.");
            return;
        }
    };

    let can_assign = precedence <= Precedence::Assignment;
    prefix(c, heap, can_assign);

    while precedence <= get_rule(c.current.kind).precedence {
        c.advance();
        let infix = get_rule(c.previous.kind)
            .infix
            .expect("infix-precedence token must have an infix rule");
        infix(c, heap, can_assign);
    }

    if can_assign && c.match_token(TokenKind::Equal) {
        c.error("Invalid assignment target.");
    }
}

fn grouping(c: &mut Compiler, heap: &mut Heap, _can_assign: bool) {
    expression(c, heap);
    c.consume(TokenKind::RightParen, "Expect ')' after expression.");
}

fn unary(c: &mut Compiler, heap: &mut Heap, _can_assign: bool) {
    let operator = c.previous.kind;
    parse_precedence(c, heap, Precedence::Unary);
    match operator {
        TokenKind::Minus => c.emit_op(OpCode::Negate),
        TokenKind::Bang => c.emit_op(OpCode::Not),
        _ => unreachable!("unary rule only installed for - and !"),
    }
}

fn binary(c: &mut Compiler, heap: &mut Heap, _can_assign: bool) {
    let operator = c.previous.kind;
    let rule = get_rule(operator);
    parse_precedence(c, heap, rule.precedence.next());
    match operator {
        TokenKind::Plus => c.emit_op(OpCode::Add),
        TokenKind::Minus => c.emit_op(OpCode::Subtract),
        TokenKind::Star => c.emit_op(OpCode::Multiply),
        TokenKind::Slash => c.emit_op(OpCode::Divide),
        TokenKind::Percent => c.emit_op(OpCode::Remainder),
        TokenKind::EqualEqual => c.emit_op(OpCode::Equal),
        TokenKind::BangEqual => {
            c.emit_op(OpCode::Equal);
            c.emit_op(OpCode::Not);
        }
        TokenKind::Greater => c.emit_op(OpCode::Greater),
        TokenKind::GreaterEqual => {
            c.emit_op(OpCode::Less);
            c.emit_op(OpCode::Not);
        }
        TokenKind::Less => c.emit_op(OpCode::Less),
        TokenKind::LessEqual => {
            c.emit_op(OpCode::Greater);
            c.emit_op(OpCode::Not);
        }
        _ => unreachable!("binary rule only installed for arithmetic/comparison tokens"),
    }
}

fn number(c: &mut Compiler, _heap: &mut Heap, _can_assign: bool) {
    let value: f64 = c.previous.lexeme.parse().unwrap_or(0.0);
    c.emit_constant(Value::Number(value));
}

fn string(c: &mut Compiler, heap: &mut Heap, _can_assign: bool) {
    let raw = c.previous.lexeme;
    let inner = &raw[1..raw.len() - 1];
    let decoded = decode_escapes(inner);
    let obj = c.intern_string(heap, decoded);
    c.emit_constant(Value::Obj(obj));
}

/// Recognizes `\"`, `\'`, `\n`, `\\`; any other escape silently drops just
/// the backslash, leaving the following character to be copied verbatim.
fn decode_escapes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.peek() {
            Some('"') => {
                out.push('"');
                chars.next();
            }
            Some('\'') => {
                out.push('\'');
                chars.next();
            }
            Some('n') => {
                out.push('\n');
                chars.next();
            }
            Some('\\') => {
                out.push('\\');
                chars.next();
            }
            _ => {}
        }
    }
    out
}

fn literal(c: &mut Compiler, _heap: &mut Heap, _can_assign: bool) {
    match c.previous.kind {
        TokenKind::False => c.emit_op(OpCode::False),
        TokenKind::True => c.emit_op(OpCode::True),
        TokenKind::Nil => c.emit_op(OpCode::Nil),
        _ => unreachable!("literal rule only installed for false/true/nil"),
    }
}

fn variable(c: &mut Compiler, heap: &mut Heap, can_assign: bool) {
    let name = c.previous.lexeme.to_string();
    c.named_variable(heap, &name, can_assign);
}

fn this_(c: &mut Compiler, heap: &mut Heap, _can_assign: bool) {
    if !c.in_class() {
        c.error("Can't use 'this' outside of a class.");
        return;
    }
    c.named_variable(heap, "this", false);
}

fn and_(c: &mut Compiler, heap: &mut Heap, _can_assign: bool) {
    let end_jump = c.emit_jump(OpCode::JumpIfFalse);
    c.emit_op(OpCode::Pop);
    parse_precedence(c, heap, Precedence::And);
    c.patch_jump(end_jump);
}

fn or_(c: &mut Compiler, heap: &mut Heap, _can_assign: bool) {
    let else_jump = c.emit_jump(OpCode::JumpIfFalse);
    let end_jump = c.emit_jump(OpCode::Jump);
    c.patch_jump(else_jump);
    c.emit_op(OpCode::Pop);
    parse_precedence(c, heap, Precedence::Or);
    c.patch_jump(end_jump);
}

fn call(c: &mut Compiler, heap: &mut Heap, _can_assign: bool) {
    let argc = argument_list(c, heap, TokenKind::RightParen, ")", "arguments");
    c.emit_bytes(OpCode::Call as u8, argc);
}

fn argument_list(
    c: &mut Compiler,
    heap: &mut Heap,
    closing: TokenKind,
    closing_lexeme: &str,
    what: &str,
) -> u8 {
    let mut count: u32 = 0;
    if !c.check(closing) {
        loop {
            expression(c, heap);
            if count == 255 {
                c.error(&format!("Can't have more than 255 {}.", what));
            }
            count += 1;
            if !c.match_token(TokenKind::Comma) {
                break;
            }
        }
    }
    let message = format!("Expect '{}' after {}.", closing_lexeme, what);
    c.consume(closing, &message);
    count as u8
}

fn dot(c: &mut Compiler, heap: &mut Heap, can_assign: bool) {
    c.consume(TokenKind::Identifier, "Expect property name after '.'.");
    let name = c.previous.lexeme.to_string();
    let constant = c.identifier_constant(heap, &name);

    if c.match_token(TokenKind::LeftParen) {
        let argc = argument_list(c, heap, TokenKind::RightParen, ")", "arguments");
        c.emit_bytes(OpCode::Invoke as u8, constant);
        c.emit_byte(argc);
    } else if can_assign && c.match_token(TokenKind::Equal) {
        expression(c, heap);
        c.emit_bytes(OpCode::SetProperty as u8, constant);
    } else {
        c.emit_bytes(OpCode::GetProperty as u8, constant);
    }
}

fn index(c: &mut Compiler, heap: &mut Heap, can_assign: bool) {
    expression(c, heap);
    c.consume(TokenKind::RightBracket, "Expect ']' after index.");

    if can_assign && c.match_token(TokenKind::Equal) {
        expression(c, heap);
        c.emit_op(OpCode::SetPropertyByKey);
    } else if c.match_token(TokenKind::LeftParen) {
        let argc = argument_list(c, heap, TokenKind::RightParen, ")", "arguments");
        c.emit_bytes(OpCode::InvokeByKey as u8, argc);
    } else {
        c.emit_op(OpCode::GetPropertyByKey);
    }
}

fn array_literal(c: &mut Compiler, heap: &mut Heap, _can_assign: bool) {
    let count = argument_list(c, heap, TokenKind::RightBracket, "]", "elements in an array literal");
    c.emit_bytes(OpCode::Array as u8, count);
}

fn map_literal(c: &mut Compiler, heap: &mut Heap, _can_assign: bool) {
    c.emit_op(OpCode::Map);
    if !c.check(TokenKind::RightBrace) {
        loop {
            let key_name = map_key(c);
            c.consume(TokenKind::Colon, "Expect ':' after map key.");
            expression(c, heap);
            let constant = c.identifier_constant(heap, &key_name);
            c.emit_bytes(OpCode::Key as u8, constant);
            if !c.match_token(TokenKind::Comma) {
                break;
            }
        }
    }
    c.consume(TokenKind::RightBrace, "Expect '}' after map literal.");
}

/// Map keys are a lexical restriction, not an expression: only a bare
/// identifier or number literal token is legal, never an arbitrary
/// expression (so `{ x + 1: y }` is a compile error, not a computed key).
fn map_key(c: &mut Compiler) -> String {
    if c.check(TokenKind::Identifier) {
        c.advance();
        c.previous.lexeme.to_string()
    } else if c.check(TokenKind::Number) {
        c.advance();
        let n: f64 = c.previous.lexeme.parse().unwrap_or(0.0);
        format_number(n)
    } else {
        c.error_at_current("Expect identifier or number as map key.");
        c.advance();
        String::new()
    }
}
