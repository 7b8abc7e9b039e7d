//! Property access (by constant-pool name and by runtime key), method
//! binding, and array/map literal construction.
//!
//! Arrays and maps are both represented as classless [`crate::value::InstanceObj`]s
//! (`class: None`); an array's fields are simply named `"0"`, `"1"`, ...
//! Because field keys are plain `String`s rather than heap-interned
//! strings, building one never needs an extra heap allocation per key.

use std::collections::HashMap;

use crate::error::RuntimeError;
use crate::heap::Heap;
use crate::value::{format_number, Object, ObjRef, Value};
use crate::vm::CallFrame;

fn pop(stack: &mut Vec<Value>) -> Value {
    stack.pop().expect("operand stack underflow")
}

fn push(stack: &mut Vec<Value>, v: Value) {
    stack.push(v);
}

fn peek(stack: &[Value], distance: usize) -> Value {
    stack[stack.len() - 1 - distance]
}

fn key_name(heap: &Heap, key: Value) -> Result<String, RuntimeError> {
    match key {
        Value::Number(n) => Ok(format_number(n)),
        Value::Obj(r) if matches!(heap.get(r), Object::Str(_)) => Ok(heap.string(r).to_string()),
        _ => Err(RuntimeError::new("A key must be a number or a string.")),
    }
}

fn instance_ref(heap: &Heap, v: Value, not_instance_message: &str) -> Result<ObjRef, RuntimeError> {
    match v {
        Value::Obj(r) if matches!(heap.get(r), Object::Instance(_)) => Ok(r),
        _ => Err(RuntimeError::new(not_instance_message)),
    }
}

/// Binds `method_name` found on `receiver`'s class into a bound-method
/// object. Caller has already confirmed the class has the method.
fn bind_method(
    stack: &[Value],
    heap: &mut Heap,
    frames: &[CallFrame],
    globals: &HashMap<String, Value>,
    open_upvalues: &[ObjRef],
    receiver: Value,
    method_ref: ObjRef,
) -> ObjRef {
    heap.alloc_bound_method(receiver, method_ref, |h| {
        crate::vm::mark_roots(h, stack, frames, globals, open_upvalues)
    })
}

/// `OP_GET_PROPERTY`: field lookup first, then a method bound off the
/// instance's class, else an "Undefined property" error.
pub(super) fn get_property(
    stack: &mut Vec<Value>,
    heap: &mut Heap,
    frames: &[CallFrame],
    globals: &HashMap<String, Value>,
    open_upvalues: &[ObjRef],
    name: &str,
) -> Result<(), RuntimeError> {
    let receiver = peek(stack, 0);
    let inst_ref = instance_ref(heap, receiver, "Only instances have properties.")?;

    if let Some(v) = heap.instance(inst_ref).fields.get(name).copied() {
        pop(stack);
        push(stack, v);
        return Ok(());
    }

    let class_ref = heap.instance(inst_ref).class;
    if let Some(class_ref) = class_ref {
        if let Some(&method_ref) = heap.class(class_ref).methods.get(name) {
            let bound_ref = bind_method(
                stack,
                heap,
                frames,
                globals,
                open_upvalues,
                receiver,
                method_ref,
            );
            pop(stack);
            push(stack, Value::Obj(bound_ref));
            return Ok(());
        }
    }

    Err(RuntimeError::new(format!(
        "Undefined property '{}'.",
        name
    )))
}

/// `OP_SET_PROPERTY`: stack is `[instance, value]`; writes `value` into
/// `name` unconditionally (fields aren't declared ahead of time) and
/// leaves `value` as the expression's result.
pub(super) fn set_property(
    stack: &mut Vec<Value>,
    heap: &mut Heap,
    name: &str,
) -> Result<(), RuntimeError> {
    let value = pop(stack);
    let receiver = peek(stack, 0);
    let inst_ref = instance_ref(heap, receiver, "Only instances have fields.")?;
    heap.instance_mut(inst_ref)
        .fields
        .insert(name.to_string(), value);
    pop(stack);
    push(stack, value);
    Ok(())
}

/// `OP_GET_PROPERTY_BY_KEY`: stack is `[instance, key]`; `key` must be a
/// number or string, stringified the same way `[0]`/`["x"]` would name a
/// field written by the array/map literal syntax.
pub(super) fn get_property_by_key(
    stack: &mut Vec<Value>,
    heap: &mut Heap,
    frames: &[CallFrame],
    globals: &HashMap<String, Value>,
    open_upvalues: &[ObjRef],
) -> Result<(), RuntimeError> {
    let key = peek(stack, 0);
    let name = key_name(heap, key)?;
    let receiver = peek(stack, 1);
    let inst_ref = instance_ref(heap, receiver, "Only instances have properties.")?;

    if let Some(v) = heap.instance(inst_ref).fields.get(&name).copied() {
        pop(stack);
        pop(stack);
        push(stack, v);
        return Ok(());
    }

    let class_ref = heap.instance(inst_ref).class;
    if let Some(class_ref) = class_ref {
        if let Some(&method_ref) = heap.class(class_ref).methods.get(&name) {
            pop(stack);
            let bound_ref = bind_method(
                stack,
                heap,
                frames,
                globals,
                open_upvalues,
                receiver,
                method_ref,
            );
            pop(stack);
            push(stack, Value::Obj(bound_ref));
            return Ok(());
        }
    }

    Err(RuntimeError::new(format!("Undefined property '{}'.", name)))
}

/// `OP_SET_PROPERTY_BY_KEY`: stack is `[instance, key, value]`.
pub(super) fn set_property_by_key(
    stack: &mut Vec<Value>,
    heap: &mut Heap,
) -> Result<(), RuntimeError> {
    let value = pop(stack);
    let key = pop(stack);
    let name = key_name(heap, key)?;
    let receiver = peek(stack, 0);
    let inst_ref = instance_ref(heap, receiver, "Only instances have fields.")?;
    heap.instance_mut(inst_ref).fields.insert(name, value);
    pop(stack);
    push(stack, value);
    Ok(())
}

/// `OP_ARRAY`: pops `count` items off the stack (in source order, so the
/// first-pushed item ends up at index `0`) and builds a classless instance
/// with `"0"`, `"1"`, ... fields. Allocation happens first, while the
/// items are still rooted on the operand stack.
pub(super) fn build_array(
    stack: &mut Vec<Value>,
    heap: &mut Heap,
    frames: &[CallFrame],
    globals: &HashMap<String, Value>,
    open_upvalues: &[ObjRef],
    count: u8,
) {
    let count = count as usize;
    let inst_ref = heap.alloc_instance(None, |h| {
        crate::vm::mark_roots(h, stack, frames, globals, open_upvalues)
    });

    let base = stack.len() - count;
    for i in 0..count {
        let v = stack[base + i];
        heap.instance_mut(inst_ref).fields.insert(i.to_string(), v);
    }
    stack.truncate(base);
    push(stack, Value::Obj(inst_ref));
}

/// `OP_MAP`: pushes a fresh, empty classless instance; entries are
/// populated one at a time by subsequent `OP_KEY` instructions.
pub(super) fn build_map(
    stack: &mut Vec<Value>,
    heap: &mut Heap,
    frames: &[CallFrame],
    globals: &HashMap<String, Value>,
    open_upvalues: &[ObjRef],
) {
    let inst_ref = heap.alloc_instance(None, |h| {
        crate::vm::mark_roots(h, stack, frames, globals, open_upvalues)
    });
    push(stack, Value::Obj(inst_ref));
}

/// `OP_KEY`: stack is `[..., instance, value]`; inserts `value` under
/// `name` and leaves `instance` on the stack for the next entry.
pub(super) fn insert_key(stack: &mut Vec<Value>, heap: &mut Heap, name: &str) {
    let value = pop(stack);
    let inst_ref = peek(stack, 0)
        .as_obj()
        .expect("OP_MAP always runs ahead of OP_KEY");
    heap.instance_mut(inst_ref)
        .fields
        .insert(name.to_string(), value);
}
