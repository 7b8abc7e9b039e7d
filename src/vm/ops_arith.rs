//! Arithmetic, comparison and unary operators.
//!
//! These take their operands straight off the passed-in stack rather than
//! through a `Vm` method, mirroring the teacher's own preference for free
//! functions with explicit parameter lists at a call site that already
//! holds several disjoint `&mut` borrows of the VM's fields.

use crate::error::RuntimeError;
use crate::heap::Heap;
use crate::value::{Object, Value};
use crate::vm::CallFrame;
use std::collections::HashMap;

fn pop(stack: &mut Vec<Value>) -> Value {
    stack.pop().expect("operand stack underflow")
}

fn push(stack: &mut Vec<Value>, v: Value) {
    stack.push(v);
}

/// `+`. Two numbers add; two strings concatenate (allocating a new heap
/// string, rooted by pushing it back before any further allocation can
/// happen). Any other combination is a type error.
pub(super) fn add(
    stack: &mut Vec<Value>,
    heap: &mut Heap,
    frames: &[CallFrame],
    globals: &HashMap<String, Value>,
    open_upvalues: &[crate::value::ObjRef],
) -> Result<(), RuntimeError> {
    let b = pop(stack);
    let a = pop(stack);
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            push(stack, Value::Number(x + y));
            Ok(())
        }
        (Value::Obj(ra), Value::Obj(rb))
            if matches!(heap.get(ra), Object::Str(_)) && matches!(heap.get(rb), Object::Str(_)) =>
        {
            let mut s = heap.string(ra).to_string();
            s.push_str(heap.string(rb));
            let stack_ref = &*stack;
            let r = heap.alloc_string(s, |h| {
                crate::vm::mark_roots(h, stack_ref, frames, globals, open_upvalues)
            });
            push(stack, Value::Obj(r));
            Ok(())
        }
        _ => Err(RuntimeError::new(
            "Operands must be two numbers or two strings.",
        )),
    }
}

fn numeric_binop(
    stack: &mut Vec<Value>,
    op: impl Fn(f64, f64) -> f64,
) -> Result<(), RuntimeError> {
    let b = pop(stack);
    let a = pop(stack);
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => {
            push(stack, Value::Number(op(x, y)));
            Ok(())
        }
        _ => Err(RuntimeError::new("Operands must be numbers.")),
    }
}

/// `-`. Computed directly as `a - b`, not the ulp-off `(b - a) * -1.0`
/// the original reference implementation used.
pub(super) fn subtract(stack: &mut Vec<Value>) -> Result<(), RuntimeError> {
    numeric_binop(stack, |a, b| a - b)
}

pub(super) fn multiply(stack: &mut Vec<Value>) -> Result<(), RuntimeError> {
    numeric_binop(stack, |a, b| a * b)
}

/// `/`. Computed directly as `a / b`, not the ulp-off `1.0 / b * a`
/// the original reference implementation used.
pub(super) fn divide(stack: &mut Vec<Value>) -> Result<(), RuntimeError> {
    numeric_binop(stack, |a, b| a / b)
}

pub(super) fn remainder(stack: &mut Vec<Value>) -> Result<(), RuntimeError> {
    numeric_binop(stack, |a, b| a % b)
}

pub(super) fn negate(stack: &mut Vec<Value>) -> Result<(), RuntimeError> {
    let v = pop(stack);
    match v.as_number() {
        Some(n) => {
            push(stack, Value::Number(-n));
            Ok(())
        }
        None => Err(RuntimeError::new("Operand must be a number.")),
    }
}

/// `>`. Pops the right operand first, then the left, then compares
/// `left > right` explicitly, left-to-right — never relying on an
/// unspecified argument evaluation order the way `pop() > pop()` would.
pub(super) fn greater(stack: &mut Vec<Value>) -> Result<(), RuntimeError> {
    let right = pop(stack);
    let left = pop(stack);
    match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => {
            push(stack, Value::Bool(a > b));
            Ok(())
        }
        _ => Err(RuntimeError::new("Operands must be numbers.")),
    }
}

/// `<`. See [`greater`] for the evaluation-order note.
pub(super) fn less(stack: &mut Vec<Value>) -> Result<(), RuntimeError> {
    let right = pop(stack);
    let left = pop(stack);
    match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => {
            push(stack, Value::Bool(a < b));
            Ok(())
        }
        _ => Err(RuntimeError::new("Operands must be numbers.")),
    }
}
