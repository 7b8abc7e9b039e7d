//! Calls, method dispatch, and upvalue capture/close.
//!
//! `call_value` is the single entry point every call-shaped opcode
//! (`OP_CALL`, `OP_INVOKE`, `OP_INVOKE_BY_KEY`, and instantiating a class)
//! eventually funnels through once the callee is resolved to a closure.

use std::collections::HashMap;

use crate::error::RuntimeError;
use crate::heap::Heap;
use crate::value::{Object, ObjRef, UpvalueLoc, Value};
use crate::vm::CallFrame;

/// Matches the book-standard recursion-depth guard; a deeply recursive
/// program fails with a language-level error instead of a native stack
/// overflow.
const FRAMES_MAX: usize = 64;

fn peek(stack: &[Value], distance: usize) -> Value {
    stack[stack.len() - 1 - distance]
}

fn key_name(heap: &Heap, key: Value) -> Result<String, RuntimeError> {
    match key {
        Value::Number(n) => Ok(crate::value::format_number(n)),
        Value::Obj(r) if matches!(heap.get(r), Object::Str(_)) => Ok(heap.string(r).to_string()),
        _ => Err(RuntimeError::new("A key must be a number or a string.")),
    }
}

enum Callable {
    Closure(ObjRef),
    Native(ObjRef),
    Class(ObjRef),
    BoundMethod(ObjRef),
}

fn classify(heap: &Heap, r: ObjRef) -> Option<Callable> {
    match heap.get(r) {
        Object::Closure(_) => Some(Callable::Closure(r)),
        Object::Native(_) => Some(Callable::Native(r)),
        Object::Class(_) => Some(Callable::Class(r)),
        Object::BoundMethod(_) => Some(Callable::BoundMethod(r)),
        _ => None,
    }
}

/// Pushes a new call frame for `closure_ref`, checking its arity and the
/// recursion-depth guard. `stack` already holds the receiver/callee slot
/// followed by `argc` arguments; that slot becomes the new frame's local
/// slot `0`.
pub(super) fn call(
    stack: &[Value],
    frames: &mut Vec<CallFrame>,
    heap: &Heap,
    closure_ref: ObjRef,
    argc: u8,
) -> Result<(), RuntimeError> {
    let function = heap.function(heap.closure(closure_ref).function);
    if argc != function.arity {
        return Err(RuntimeError::new(format!(
            "Expected {} arguments but got {}.",
            function.arity, argc
        )));
    }
    if frames.len() >= FRAMES_MAX {
        return Err(RuntimeError::new("Stack overflow."));
    }
    let base = stack.len() - argc as usize - 1;
    frames.push(CallFrame {
        closure: closure_ref,
        ip: 0,
        base,
    });
    Ok(())
}

/// Resolves whatever value sits in the callee slot (`peek(argc)`) and
/// dispatches it: a closure pushes a frame, a native runs immediately and
/// collapses its args, a class instantiates (invoking `init` if defined),
/// a bound method rewrites the receiver into the callee slot and calls
/// through to its closure.
pub(super) fn call_value(
    stack: &mut Vec<Value>,
    frames: &mut Vec<CallFrame>,
    heap: &mut Heap,
    globals: &HashMap<String, Value>,
    open_upvalues: &[ObjRef],
    callee: Value,
    argc: u8,
) -> Result<(), RuntimeError> {
    let r = match callee {
        Value::Obj(r) => r,
        _ => return Err(RuntimeError::new("Can only call functions and classes.")),
    };

    match classify(heap, r) {
        Some(Callable::Closure(closure_ref)) => call(stack, frames, heap, closure_ref, argc),
        Some(Callable::Native(native_ref)) => {
            let (name, arity, func) = match heap.get(native_ref) {
                Object::Native(n) => (n.name, n.arity, n.func),
                _ => unreachable!(),
            };
            if argc != arity {
                return Err(RuntimeError::new(format!(
                    "Expected {} arguments but got {}.",
                    arity, argc
                )));
            }
            let base = stack.len() - argc as usize - 1;
            let args: Vec<Value> = stack[base + 1..].to_vec();
            let roots = |h: &mut Heap| crate::vm::mark_roots(h, stack, frames, globals, open_upvalues);
            let result = func(heap, &args, &roots).map_err(|e| {
                RuntimeError::new(format!("{} (in native fn {})", e.message, name))
            })?;
            stack.truncate(base);
            stack.push(result);
            Ok(())
        }
        Some(Callable::Class(class_ref)) => {
            let inst_ref = heap.alloc_instance(Some(class_ref), |h| {
                crate::vm::mark_roots(h, stack, frames, globals, open_upvalues)
            });
            let slot = stack.len() - 1 - argc as usize;
            stack[slot] = Value::Obj(inst_ref);

            let init_ref = heap.class(class_ref).methods.get("init").copied();
            match init_ref {
                Some(init_ref) => call(stack, frames, heap, init_ref, argc),
                None => {
                    if argc != 0 {
                        Err(RuntimeError::new(format!(
                            "Expected 0 arguments but got {}.",
                            argc
                        )))
                    } else {
                        Ok(())
                    }
                }
            }
        }
        Some(Callable::BoundMethod(bound_ref)) => {
            let (receiver, closure_ref) = match heap.get(bound_ref) {
                Object::BoundMethod(bm) => (bm.receiver, bm.closure),
                _ => unreachable!(),
            };
            let slot = stack.len() - 1 - argc as usize;
            stack[slot] = receiver;
            call(stack, frames, heap, closure_ref, argc)
        }
        None => Err(RuntimeError::new("Can only call functions and classes.")),
    }
}

/// `OP_INVOKE`: fuses `receiver.name(args)` into one dispatch, checking
/// instance fields (a field can hold a callable) before falling back to
/// the class method table.
pub(super) fn invoke(
    stack: &mut Vec<Value>,
    frames: &mut Vec<CallFrame>,
    heap: &mut Heap,
    globals: &HashMap<String, Value>,
    open_upvalues: &[ObjRef],
    name: &str,
    argc: u8,
) -> Result<(), RuntimeError> {
    let receiver = peek(stack, argc as usize);
    let inst_ref = match receiver {
        Value::Obj(r) if matches!(heap.get(r), Object::Instance(_)) => r,
        _ => return Err(RuntimeError::new("Only instances have methods.")),
    };

    if let Some(v) = heap.instance(inst_ref).fields.get(name).copied() {
        let slot = stack.len() - 1 - argc as usize;
        stack[slot] = v;
        return call_value(stack, frames, heap, globals, open_upvalues, v, argc);
    }

    invoke_from_class(stack, frames, heap, inst_ref, name, argc)
}

fn invoke_from_class(
    stack: &mut Vec<Value>,
    frames: &mut Vec<CallFrame>,
    heap: &mut Heap,
    inst_ref: ObjRef,
    name: &str,
    argc: u8,
) -> Result<(), RuntimeError> {
    let class_ref = heap
        .instance(inst_ref)
        .class
        .ok_or_else(|| RuntimeError::new("Only instances have methods."))?;
    let method_ref = *heap
        .class(class_ref)
        .methods
        .get(name)
        .ok_or_else(|| RuntimeError::new(format!("Undefined property '{}'.", name)))?;
    call(stack, frames, heap, method_ref, argc)
}

/// `OP_INVOKE_BY_KEY`: stack is `[receiver, key, arg0, ..., argN-1]`; the
/// key is stringified and spliced out before dispatch proceeds exactly
/// like [`invoke`].
pub(super) fn invoke_by_key(
    stack: &mut Vec<Value>,
    frames: &mut Vec<CallFrame>,
    heap: &mut Heap,
    globals: &HashMap<String, Value>,
    open_upvalues: &[ObjRef],
    argc: u8,
) -> Result<(), RuntimeError> {
    let key = peek(stack, argc as usize);
    let name = key_name(heap, key)?;
    let receiver = peek(stack, argc as usize + 1);
    let inst_ref = match receiver {
        Value::Obj(r) if matches!(heap.get(r), Object::Instance(_)) => r,
        _ => return Err(RuntimeError::new("Only instances have methods.")),
    };

    let key_index = stack.len() - 1 - argc as usize;
    stack.remove(key_index);

    if let Some(v) = heap.instance(inst_ref).fields.get(&name).copied() {
        let slot = stack.len() - 1 - argc as usize;
        stack[slot] = v;
        return call_value(stack, frames, heap, globals, open_upvalues, v, argc);
    }

    invoke_from_class(stack, frames, heap, inst_ref, &name, argc)
}

/// Returns the existing open upvalue for `slot` if one is already being
/// shared, otherwise allocates a new one and inserts it keeping
/// `open_upvalues` sorted by strictly decreasing slot index.
pub(super) fn capture_upvalue(
    heap: &mut Heap,
    open_upvalues: &mut Vec<ObjRef>,
    stack: &[Value],
    frames: &[CallFrame],
    globals: &HashMap<String, Value>,
    slot: usize,
) -> ObjRef {
    for &r in open_upvalues.iter() {
        if let UpvalueLoc::Open(s) = heap.upvalue(r).location {
            if s == slot {
                return r;
            }
        }
    }

    let snapshot = &*open_upvalues;
    let new_ref = heap.alloc_upvalue(slot, |h| {
        crate::vm::mark_roots(h, stack, frames, globals, snapshot)
    });

    let insert_pos = open_upvalues
        .iter()
        .position(|&r| match heap.upvalue(r).location {
            UpvalueLoc::Open(s) => s < slot,
            UpvalueLoc::Closed(_) => false,
        })
        .unwrap_or(open_upvalues.len());
    open_upvalues.insert(insert_pos, new_ref);
    new_ref
}

/// Closes every open upvalue pointing at or above `threshold`, copying
/// the live stack value into the upvalue itself so it survives the frame
/// being popped. `open_upvalues` stays sorted by decreasing slot, so this
/// only ever needs to look at the front.
pub(super) fn close_upvalues(
    heap: &mut Heap,
    open_upvalues: &mut Vec<ObjRef>,
    stack: &[Value],
    threshold: usize,
) {
    while let Some(&r) = open_upvalues.first() {
        let slot = match heap.upvalue(r).location {
            UpvalueLoc::Open(s) => s,
            UpvalueLoc::Closed(_) => break,
        };
        if slot < threshold {
            break;
        }
        let value = stack[slot];
        heap.upvalue_mut(r).location = UpvalueLoc::Closed(value);
        open_upvalues.remove(0);
    }
}

pub(super) fn upvalue_value(heap: &Heap, stack: &[Value], up_ref: ObjRef) -> Value {
    match heap.upvalue(up_ref).location {
        UpvalueLoc::Open(slot) => stack[slot],
        UpvalueLoc::Closed(v) => v,
    }
}

pub(super) fn set_upvalue_value(heap: &mut Heap, stack: &mut [Value], up_ref: ObjRef, value: Value) {
    match heap.upvalue(up_ref).location {
        UpvalueLoc::Open(slot) => stack[slot] = value,
        UpvalueLoc::Closed(_) => heap.upvalue_mut(up_ref).location = UpvalueLoc::Closed(value),
    }
}
