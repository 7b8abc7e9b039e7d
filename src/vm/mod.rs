//! # Virtual machine — stack-based bytecode interpreter
//!
//! [`Vm`] owns the operand stack, the call-frame stack, the global table,
//! the open-upvalue list and the heap, and drives the decode-execute loop
//! in [`Vm::run`]. The opcode set and every operation's stack effect follow
//! the compiler's emission exactly; see [`crate::chunk::OpCode`].
//!
//! Submodules mirror the teacher's own split of VM concerns into separate
//! files: [`ops_arith`] for arithmetic/comparison, [`ops_struct`] for
//! property/array/map access, [`ops_control`] for calls, method dispatch
//! and upvalue capture/close, and [`builtins`] for the native callables
//! installed as globals at startup.

mod builtins;
mod ops_arith;
mod ops_control;
mod ops_struct;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::io::Write;

use crate::chunk::OpCode;
use crate::compiler;
use crate::error::{InterpretResult, RuntimeError};
use crate::heap::Heap;
use crate::value::{stringify, values_equal, ClosureObj, ObjRef, Value};

/// A single active function call: its closure, instruction cursor and
/// operand-stack base (spec.md §4.3 "Frame").
pub(super) struct CallFrame {
    closure: ObjRef,
    ip: usize,
    base: usize,
}

/// Marks every value/object the VM itself considers live: the operand
/// stack, open upvalues, globals and every frame's closure. Passed to the
/// heap as (part of) the root closure at every allocation site that can
/// trigger a collection while the VM is running.
pub(super) fn mark_roots(
    heap: &mut Heap,
    stack: &[Value],
    frames: &[CallFrame],
    globals: &HashMap<String, Value>,
    open_upvalues: &[ObjRef],
) {
    for v in stack {
        heap.mark_value(*v);
    }
    for r in open_upvalues {
        heap.mark(*r);
    }
    for v in globals.values() {
        heap.mark_value(*v);
    }
    for frame in frames {
        heap.mark(frame.closure);
    }
}

/// A stack-based bytecode interpreter. `W` is where `print`/`println`
/// write; the driver supplies `io::stdout()`, tests supply an in-memory
/// buffer so stdout assertions don't need to shell out or touch the real
/// terminal (spec.md §1 treats the I/O sink as an external collaborator,
/// so this is purely an implementation choice within that latitude).
pub struct Vm<W: Write> {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: HashMap<String, Value>,
    open_upvalues: Vec<ObjRef>,
    out: W,
    trace: bool,
}

impl<W: Write> Vm<W> {
    pub fn new(out: W) -> Vm<W> {
        let mut heap = Heap::new();
        let globals = builtins::install(&mut heap);
        Vm {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            globals,
            open_upvalues: Vec::new(),
            out,
            trace: false,
        }
    }

    /// Enables opcode tracing: before executing each instruction, prints
    /// its line, byte offset, decoded opcode and the current operand stack
    /// to stderr. Not part of the language itself, purely a debugging aid
    /// for whoever is embedding or extending this VM.
    pub fn with_trace(mut self, trace: bool) -> Vm<W> {
        self.trace = trace;
        self
    }

    /// Unwraps the writer this VM was constructed with (tests pull their
    /// captured output buffer back out after a run).
    pub fn into_writer(self) -> W {
        self.out
    }

    /// Compiles and runs one program, per spec.md §2's control-flow:
    /// compile, and on success, execute. A compile failure is reported to
    /// stderr (one line per diagnostic) without ever reaching the VM loop.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let compiled = {
            let stack = &self.stack;
            let frames = &self.frames;
            let globals = &self.globals;
            let open_upvalues = &self.open_upvalues;
            compiler::compile(source, &mut self.heap, move |h| {
                mark_roots(h, stack, frames, globals, open_upvalues);
            })
        };

        let function_ref = match compiled {
            Ok(f) => f,
            Err(errors) => {
                for e in &errors {
                    eprintln!("{}", e);
                }
                return InterpretResult::CompileError;
            }
        };

        let closure_obj = ClosureObj {
            function: function_ref,
            upvalues: Vec::new(),
        };
        let closure_ref = self.heap.alloc_closure(closure_obj, |h| {
            mark_roots(h, &self.stack, &self.frames, &self.globals, &self.open_upvalues)
        });
        self.stack.push(Value::Obj(closure_ref));
        self.frames.push(CallFrame {
            closure: closure_ref,
            ip: 0,
            base: 0,
        });

        match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(err) => {
                self.runtime_error(&err.message);
                InterpretResult::RuntimeError
            }
        }
    }

    // --- stack helpers ------------------------------------------------

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.stack
            .pop()
            .expect("compiler-emitted bytecode never underflows the operand stack")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // --- frame/bytecode cursor ------------------------------------------

    fn frame_base(&self) -> usize {
        self.frames.last().expect("at least one active frame").base
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("at least one active frame");
        let closure = self.heap.closure(frame.closure);
        let function = self.heap.function(closure.function);
        let byte = function.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte();
        let frame = self.frames.last().expect("at least one active frame");
        let closure = self.heap.closure(frame.closure);
        let function = self.heap.function(closure.function);
        function.chunk.constants[index as usize]
    }

    fn read_string(&mut self) -> String {
        match self.read_constant() {
            Value::Obj(r) => self.heap.string(r).to_string(),
            _ => unreachable!("name constants are always interned strings"),
        }
    }

    fn jump(&mut self, offset: u16) {
        self.frames.last_mut().unwrap().ip += offset as usize;
    }

    fn loop_back(&mut self, offset: u16) {
        self.frames.last_mut().unwrap().ip -= offset as usize;
    }

    /// Prints the faulting message plus a frame-by-frame backtrace to
    /// stderr (innermost first), then clears both the frame and operand
    /// stacks — the language has no catch construct, so a runtime error
    /// always ends the program (spec.md §4.3, §7).
    fn runtime_error(&mut self, message: &str) {
        eprintln!("{}", message);
        for frame in self.frames.iter().rev() {
            let closure = self.heap.closure(frame.closure);
            let function = self.heap.function(closure.function);
            let instruction = frame.ip.saturating_sub(1);
            let line = function.chunk.lines.get(instruction).copied().unwrap_or(0);
            if function.name.is_empty() {
                eprintln!("[line {}] in script", line);
            } else {
                eprintln!("[line {}] in {}()", line, function.name);
            }
        }
        self.frames.clear();
        self.stack.clear();
    }

    /// Prints the instruction about to execute plus the current operand
    /// stack to stderr. Decodes without consuming: it peeks the opcode
    /// byte at `ip` the same way `read_byte` would but leaves the cursor
    /// untouched for the real decode that follows.
    fn trace_instruction(&self) {
        let frame = self.frames.last().expect("at least one active frame");
        let closure = self.heap.closure(frame.closure);
        let function = self.heap.function(closure.function);
        let op = OpCode::from_u8(function.chunk.code[frame.ip]);
        let line = function.chunk.lines.get(frame.ip).copied().unwrap_or(0);
        let stack_repr: Vec<String> = self
            .stack
            .iter()
            .map(|v| stringify(&self.heap, *v))
            .collect();
        eprintln!(
            "[line {}] {:04} {:?}  stack: [{}]",
            line,
            frame.ip,
            op,
            stack_repr.join(", ")
        );
    }

    /// The decode-execute loop. Runs until the outermost frame returns
    /// (`Ok(())`) or an operation produces a [`RuntimeError`].
    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.trace {
                self.trace_instruction();
            }
            let instruction = OpCode::from_u8(self.read_byte());
            match instruction {
                OpCode::Constant => {
                    let v = self.read_constant();
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame_base();
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame_base();
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(&name) {
                        Some(v) => {
                            let v = *v;
                            self.push(v);
                        }
                        None => {
                            return Err(RuntimeError::new(format!(
                                "Undefined variable '{}'.",
                                name
                            )))
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let v = self.pop();
                    self.globals.insert(name, v);
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    if !self.globals.contains_key(&name) {
                        return Err(RuntimeError::new(format!(
                            "Undefined variable '{}'.",
                            name
                        )));
                    }
                    self.globals.insert(name, self.peek(0));
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let frame = self.frames.last().unwrap();
                    let closure = self.heap.closure(frame.closure);
                    let up_ref = closure.upvalues[slot];
                    let v = ops_control::upvalue_value(&self.heap, &self.stack, up_ref);
                    self.push(v);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let frame = self.frames.last().unwrap();
                    let closure = self.heap.closure(frame.closure);
                    let up_ref = closure.upvalues[slot];
                    let v = self.peek(0);
                    ops_control::set_upvalue_value(&mut self.heap, &mut self.stack, up_ref, v);
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    ops_struct::get_property(
                        &mut self.stack,
                        &mut self.heap,
                        &self.frames,
                        &self.globals,
                        &self.open_upvalues,
                        &name,
                    )?;
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    ops_struct::set_property(&mut self.stack, &mut self.heap, &name)?;
                }
                OpCode::GetPropertyByKey => {
                    ops_struct::get_property_by_key(
                        &mut self.stack,
                        &mut self.heap,
                        &self.frames,
                        &self.globals,
                        &self.open_upvalues,
                    )?;
                }
                OpCode::SetPropertyByKey => {
                    ops_struct::set_property_by_key(&mut self.stack, &mut self.heap)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(values_equal(&self.heap, a, b)));
                }
                OpCode::Greater => ops_arith::greater(&mut self.stack)?,
                OpCode::Less => ops_arith::less(&mut self.stack)?,
                OpCode::Add => {
                    ops_arith::add(
                        &mut self.stack,
                        &mut self.heap,
                        &self.frames,
                        &self.globals,
                        &self.open_upvalues,
                    )?;
                }
                OpCode::Subtract => ops_arith::subtract(&mut self.stack)?,
                OpCode::Multiply => ops_arith::multiply(&mut self.stack)?,
                OpCode::Divide => ops_arith::divide(&mut self.stack)?,
                OpCode::Remainder => ops_arith::remainder(&mut self.stack)?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(!v.is_truthy()));
                }
                OpCode::Negate => ops_arith::negate(&mut self.stack)?,
                OpCode::Print => {
                    let v = self.pop();
                    let s = stringify(&self.heap, v);
                    write!(self.out, "{}", s).expect("write to print sink");
                }
                OpCode::Println => {
                    let v = self.pop();
                    let s = stringify(&self.heap, v);
                    writeln!(self.out, "{}", s).expect("write to print sink");
                }
                OpCode::Jump => {
                    let offset = self.read_short();
                    self.jump(offset);
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short();
                    if !self.peek(0).is_truthy() {
                        self.jump(offset);
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short();
                    self.loop_back(offset);
                }
                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    ops_control::call_value(
                        &mut self.stack,
                        &mut self.frames,
                        &mut self.heap,
                        &self.globals,
                        &self.open_upvalues,
                        callee,
                        argc,
                    )?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    ops_control::invoke(
                        &mut self.stack,
                        &mut self.frames,
                        &mut self.heap,
                        &self.globals,
                        &self.open_upvalues,
                        &name,
                        argc,
                    )?;
                }
                OpCode::InvokeByKey => {
                    let argc = self.read_byte();
                    ops_control::invoke_by_key(
                        &mut self.stack,
                        &mut self.frames,
                        &mut self.heap,
                        &self.globals,
                        &self.open_upvalues,
                        argc,
                    )?;
                }
                OpCode::Closure => {
                    let function_ref = match self.read_constant() {
                        Value::Obj(r) => r,
                        _ => unreachable!("function constants are always heap objects"),
                    };
                    let closure_obj = ClosureObj {
                        function: function_ref,
                        upvalues: Vec::new(),
                    };
                    let closure_ref = self.heap.alloc_closure(closure_obj, |h| {
                        mark_roots(
                            h,
                            &self.stack,
                            &self.frames,
                            &self.globals,
                            &self.open_upvalues,
                        )
                    });
                    self.push(Value::Obj(closure_ref));

                    let upvalue_count = self.heap.function(function_ref).upvalue_count;
                    let enclosing = self.frames.last().unwrap().closure;
                    let base = self.frame_base();
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let up_ref = if is_local {
                            let slot = base + index;
                            ops_control::capture_upvalue(
                                &mut self.heap,
                                &mut self.open_upvalues,
                                &self.stack,
                                &self.frames,
                                &self.globals,
                                slot,
                            )
                        } else {
                            self.heap.closure(enclosing).upvalues[index]
                        };
                        self.heap.closure_mut(closure_ref).upvalues.push(up_ref);
                    }
                }
                OpCode::CloseUpvalue => {
                    let threshold = self.stack.len() - 1;
                    ops_control::close_upvalues(
                        &mut self.heap,
                        &mut self.open_upvalues,
                        &self.stack,
                        threshold,
                    );
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let base = self.frame_base();
                    ops_control::close_upvalues(
                        &mut self.heap,
                        &mut self.open_upvalues,
                        &self.stack,
                        base,
                    );
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let class_ref = self.heap.alloc_class(name, |h| {
                        mark_roots(
                            h,
                            &self.stack,
                            &self.frames,
                            &self.globals,
                            &self.open_upvalues,
                        )
                    });
                    self.push(Value::Obj(class_ref));
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    let method_ref = method.as_obj().expect("method value is always a closure");
                    let class_ref = self.peek(1).as_obj().expect("METHOD runs under a class");
                    self.heap.class_mut(class_ref).methods.insert(name, method_ref);
                    self.pop();
                }
                OpCode::Array => {
                    let count = self.read_byte();
                    ops_struct::build_array(
                        &mut self.stack,
                        &mut self.heap,
                        &self.frames,
                        &self.globals,
                        &self.open_upvalues,
                        count,
                    );
                }
                OpCode::Map => {
                    ops_struct::build_map(
                        &mut self.stack,
                        &mut self.heap,
                        &self.frames,
                        &self.globals,
                        &self.open_upvalues,
                    );
                }
                OpCode::Key => {
                    let name = self.read_string();
                    ops_struct::insert_key(&mut self.stack, &mut self.heap, &name);
                }
            }
        }
    }
}
