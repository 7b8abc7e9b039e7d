//! # Compiler — single-pass Pratt compiler
//!
//! Walks the token stream exactly once, emitting bytecode directly into the
//! chunk of whichever function is currently being built — there is no
//! intermediate AST. [`expr`] holds the precedence table and the
//! prefix/infix parse functions; this module owns declarations, statements,
//! scope/local/upvalue bookkeeping, and the class and function compilers.
//!
//! A stack of [`FunctionState`] values stands in for the "chain of nested
//! compilers" a pointer-based implementation would thread through enclosing
//! pointers: `states.last()` is always the function currently being
//! compiled, and `states[i - 1]` is its lexical enclosing function. Walking
//! that stack is also how the garbage collector finds every constant a
//! still-unfinished function has built so far — see [`Compiler::mark_all_roots`].

pub mod expr;

use crate::chunk::{Chunk, OpCode, MAX_JUMP, MAX_U8_INDEX};
use crate::error::{CompileError, ErrorLocation};
use crate::heap::Heap;
use crate::scanner::{Scanner, Token, TokenKind};
use crate::value::{FunctionObj, ObjRef, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// `-1` means declared but not yet initialized (its own initializer
    /// expression is still being compiled).
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct Upvalue {
    index: u8,
    is_local: bool,
}

struct FunctionState<'src> {
    name: String,
    function_type: FunctionType,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    upvalues: Vec<Upvalue>,
    scope_depth: i32,
}

impl<'src> FunctionState<'src> {
    fn new(name: String, function_type: FunctionType) -> FunctionState<'src> {
        // Slot 0 is reserved: the callee itself for plain functions and the
        // script, `this` for methods and initializers. Marking it captured
        // is never needed from here; it behaves like any other local.
        let reserved = match function_type {
            FunctionType::Method | FunctionType::Initializer => "this",
            FunctionType::Function | FunctionType::Script => "",
        };
        FunctionState {
            name,
            function_type,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![Local {
                name: reserved,
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

pub struct Compiler<'src> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    panic_mode: bool,
    had_error: bool,
    errors: Vec<CompileError>,
    states: Vec<FunctionState<'src>>,
    class_nesting: u32,
    vm_roots: Box<dyn Fn(&mut Heap) + 'src>,
}

/// Compiles `source` into a top-level script function, or collects the
/// diagnostics that made that impossible. `vm_roots` marks whatever the VM
/// already considers live (globals, natives) so a collection triggered by
/// a constant allocation mid-compile can't sweep them out from under us.
pub fn compile<'src>(
    source: &'src str,
    heap: &mut Heap,
    vm_roots: impl Fn(&mut Heap) + 'src,
) -> Result<ObjRef, Vec<CompileError>> {
    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        current: Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 1,
        },
        previous: Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 1,
        },
        panic_mode: false,
        had_error: false,
        errors: Vec::new(),
        states: vec![FunctionState::new(String::new(), FunctionType::Script)],
        class_nesting: 0,
        vm_roots: Box::new(vm_roots),
    };

    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration(heap);
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");

    let (function, _upvalues) = compiler.end_function(heap);
    if compiler.had_error {
        Err(compiler.errors)
    } else {
        Ok(function)
    }
}

impl<'src> Compiler<'src> {
    // --- token stream -----------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.report_error(self.current.line, ErrorLocation::None, message);
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

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn report_error(&mut self, line: usize, location: ErrorLocation, message: String) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.errors.push(CompileError {
            line,
            location,
            message,
        });
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        let location = if token.kind == TokenKind::Eof {
            ErrorLocation::AtEnd
        } else {
            ErrorLocation::AtLexeme(token.lexeme.to_string())
        };
        self.report_error(token.line, location, message.to_string());
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
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
                | TokenKind::Println
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // --- function/scope state ----------------------------------------------

    fn current_state(&self) -> &FunctionState<'src> {
        self.states.last().expect("at least the script state")
    }

    fn current_state_mut(&mut self) -> &mut FunctionState<'src> {
        self.states.last_mut().expect("at least the script state")
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.current_state_mut().chunk
    }

    /// Marks every root the VM already knows about, plus every constant
    /// built so far by every function still under construction. Passed to
    /// the heap as the root closure for any allocation made during compile.
    fn mark_all_roots(&self, heap: &mut Heap) {
        (self.vm_roots)(heap);
        for state in &self.states {
            for constant in &state.chunk.constants {
                heap.mark_value(*constant);
            }
        }
    }

    fn intern_string(&mut self, heap: &mut Heap, s: String) -> ObjRef {
        let this: &Self = self;
        heap.alloc_string(s, |h| this.mark_all_roots(h))
    }

    fn identifier_constant(&mut self, heap: &mut Heap, name: &str) -> u8 {
        let obj = self.intern_string(heap, name.to_string());
        self.make_constant(Value::Obj(obj))
    }

    fn begin_scope(&mut self) {
        self.current_state_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_state_mut().scope_depth -= 1;
        let depth = self.current_state().scope_depth;
        loop {
            let should_pop = matches!(self.current_state().locals.last(), Some(l) if l.depth > depth);
            if !should_pop {
                break;
            }
            let local = self.current_state_mut().locals.pop().unwrap();
            if local.is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn declare_variable(&mut self) {
        if self.current_state().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let depth = self.current_state().scope_depth;
        for local in self.current_state().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                self.error("Already a variable with this name in this scope.");
            }
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.current_state().locals.len() >= MAX_U8_INDEX {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_state_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let depth = self.current_state().scope_depth;
        if depth == 0 {
            return;
        }
        self.current_state_mut().locals.last_mut().unwrap().depth = depth;
    }

    fn parse_variable(&mut self, heap: &mut Heap, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.current_state().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme.to_string();
        self.identifier_constant(heap, &name)
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(OpCode::DefineGlobal as u8, global);
    }

    fn resolve_local(&self, state_idx: usize, name: &str) -> Option<u8> {
        self.states[state_idx]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(i, _)| i as u8)
    }

    fn add_upvalue(&mut self, state_idx: usize, index: u8, is_local: bool) -> u8 {
        let upvalues = &mut self.states[state_idx].upvalues;
        for (i, up) in upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if upvalues.len() >= MAX_U8_INDEX {
            self.error("Too many closure variables in function.");
            return 0;
        }
        upvalues.push(Upvalue { index, is_local });
        (upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, state_idx: usize, name: &str) -> Option<u8> {
        if state_idx == 0 {
            return None;
        }
        let enclosing = state_idx - 1;
        if let Some(local) = self.resolve_local(enclosing, name) {
            self.states[enclosing].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(state_idx, local, true));
        }
        if let Some(up) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(state_idx, up, false));
        }
        None
    }

    pub(crate) fn named_variable(&mut self, heap: &mut Heap, name: &str, can_assign: bool) {
        let idx = self.states.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(idx, name) {
            if self.states[idx].locals[slot as usize].depth == -1 {
                self.error("Can't read local variable in its own initializer.");
            }
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(idx, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let k = self.identifier_constant(heap, name);
            (OpCode::GetGlobal, OpCode::SetGlobal, k)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            expr::expression(self, heap);
            self.emit_bytes(set_op as u8, arg);
        } else {
            self.emit_bytes(get_op as u8, arg);
        }
    }

    // --- emission -----------------------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_bytes(&mut self, a: u8, b: u8) {
        self.emit_byte(a);
        self.emit_byte(b);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_chunk().len() - offset - 2;
        if jump > MAX_JUMP {
            self.error("Too much code to jump over.");
        }
        let bytes = (jump as u16).to_be_bytes();
        self.current_chunk().code[offset] = bytes[0];
        self.current_chunk().code[offset + 1] = bytes[1];
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().len() - loop_start + 2;
        if offset > MAX_JUMP {
            self.error("Loop body too large.");
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    fn emit_return(&mut self) {
        if self.current_state().function_type == FunctionType::Initializer {
            self.emit_bytes(OpCode::GetLocal as u8, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.current_chunk().add_constant(value);
        if index >= MAX_U8_INDEX {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_bytes(OpCode::Constant as u8, constant);
    }

    /// Pops the innermost [`FunctionState`], finalizes its implicit return,
    /// and allocates the finished [`FunctionObj`] on the heap. The state's
    /// own constants are rooted explicitly for this one allocation: by the
    /// time it runs, the state has already been popped off `self.states`,
    /// so `mark_all_roots` alone would miss them.
    fn end_function(&mut self, heap: &mut Heap) -> (ObjRef, Vec<Upvalue>) {
        self.emit_return();
        let state = self.states.pop().expect("end_function on a pushed state");
        let extra_roots = state.chunk.constants.clone();
        let upvalues = state.upvalues;
        let func_obj = FunctionObj {
            name: state.name,
            arity: state.arity,
            upvalue_count: upvalues.len() as u8,
            chunk: state.chunk,
        };
        let this: &Self = self;
        let func_ref = heap.alloc_function(func_obj, move |h| {
            this.mark_all_roots(h);
            for v in &extra_roots {
                h.mark_value(*v);
            }
        });
        (func_ref, upvalues)
    }

    fn function(&mut self, heap: &mut Heap, function_type: FunctionType, name: String) {
        self.states.push(FunctionState::new(name, function_type));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.current_state_mut().arity += 1;
                if self.current_state().arity as usize > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable(heap, "Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block(heap);

        let (func_ref, upvalues) = self.end_function(heap);
        let constant = self.make_constant(Value::Obj(func_ref));
        self.emit_bytes(OpCode::Closure as u8, constant);
        for up in &upvalues {
            self.emit_byte(up.is_local as u8);
            self.emit_byte(up.index);
        }
    }

    pub(crate) fn in_class(&self) -> bool {
        self.class_nesting > 0
    }

    fn method(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme.to_string();
        let constant = self.identifier_constant(heap, &name);
        let function_type = if name == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(heap, function_type, name);
        self.emit_bytes(OpCode::Method as u8, constant);
    }

    // --- declarations & statements -------------------------------------------

    fn declaration(&mut self, heap: &mut Heap) {
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

    fn class_declaration(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let name = self.previous.lexeme.to_string();
        let name_constant = self.identifier_constant(heap, &name);
        self.declare_variable();

        self.emit_bytes(OpCode::Class as u8, name_constant);
        self.define_variable(name_constant);

        self.class_nesting += 1;
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");

        self.named_variable(heap, &name, false);
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method(heap);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        self.class_nesting -= 1;
    }

    fn fun_declaration(&mut self, heap: &mut Heap) {
        let global = self.parse_variable(heap, "Expect function name.");
        let name = self.previous.lexeme.to_string();
        self.mark_initialized();
        self.function(heap, FunctionType::Function, name);
        self.define_variable(global);
    }

    fn var_declaration(&mut self, heap: &mut Heap) {
        let global = self.parse_variable(heap, "Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            expr::expression(self, heap);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn statement(&mut self, heap: &mut Heap) {
        if self.match_token(TokenKind::Print) {
            self.print_statement(heap, OpCode::Print);
        } else if self.match_token(TokenKind::Println) {
            self.print_statement(heap, OpCode::Println);
        } else if self.match_token(TokenKind::If) {
            self.if_statement(heap);
        } else if self.match_token(TokenKind::Return) {
            self.return_statement(heap);
        } else if self.match_token(TokenKind::While) {
            self.while_statement(heap);
        } else if self.match_token(TokenKind::For) {
            self.for_statement(heap);
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block(heap);
            self.end_scope();
        } else {
            self.expression_statement(heap);
        }
    }

    fn block(&mut self, heap: &mut Heap) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration(heap);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self, heap: &mut Heap, op: OpCode) {
        expr::expression(self, heap);
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(op);
    }

    fn expression_statement(&mut self, heap: &mut Heap) {
        expr::expression(self, heap);
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        expr::expression(self, heap);
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement(heap);

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement(heap);
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self, heap: &mut Heap) {
        let loop_start = self.current_chunk().len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        expr::expression(self, heap);
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement(heap);
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self, heap: &mut Heap) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer clause
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(heap);
        } else {
            self.expression_statement(heap);
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            expr::expression(self, heap);
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();
            expr::expression(self, heap);
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement(heap);
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
    }

    fn return_statement(&mut self, heap: &mut Heap) {
        if self.states.len() == 1 {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_state().function_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            expr::expression(self, heap);
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }
}
