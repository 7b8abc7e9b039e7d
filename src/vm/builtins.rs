//! Native functions installed as globals at VM startup.
//!
//! Each is a plain `NativeFn` — arity is checked by the caller
//! ([`super::ops_control::call_value`]) before the function body ever runs,
//! so these only need to validate argument *types*.

use std::collections::HashMap;
use std::io::{self, BufRead};
use std::time::Instant;

use once_cell::sync::Lazy;

use crate::error::RuntimeError;
use crate::heap::Heap;
use crate::value::{stringify as stringify_value, NativeFn, Value};

/// Forced in [`install`] so it captures the moment the VM comes up, not the
/// moment the first `clock()` call happens to run.
static START: Lazy<Instant> = Lazy::new(Instant::now);

fn native_clock(
    _heap: &mut Heap,
    _args: &[Value],
    _roots: &dyn Fn(&mut Heap),
) -> Result<Value, RuntimeError> {
    Ok(Value::Number(START.elapsed().as_secs_f64()))
}

/// Reads one line from stdin and parses it as a number; a blank line or a
/// line that doesn't parse yields `0`, matching the original's tolerant
/// behavior rather than raising a runtime error for bad input.
fn native_read_number(
    _heap: &mut Heap,
    _args: &[Value],
    _roots: &dyn Fn(&mut Heap),
) -> Result<Value, RuntimeError> {
    let mut line = String::new();
    let stdin = io::stdin();
    stdin
        .lock()
        .read_line(&mut line)
        .map_err(|e| RuntimeError::new(format!("Failed to read input: {}", e)))?;
    let n = line.trim().parse::<f64>().unwrap_or(0.0);
    Ok(Value::Number(n))
}

fn native_stringify(
    heap: &mut Heap,
    args: &[Value],
    roots: &dyn Fn(&mut Heap),
) -> Result<Value, RuntimeError> {
    let s = stringify_value(heap, args[0]);
    let r = heap.alloc_string(s, |h| roots(h));
    Ok(Value::Obj(r))
}

/// Rounds `x` to the nearest multiple of `step`: `round(x / step) * step`.
fn native_round(
    _heap: &mut Heap,
    args: &[Value],
    _roots: &dyn Fn(&mut Heap),
) -> Result<Value, RuntimeError> {
    let (x, step) = match (args[0].as_number(), args[1].as_number()) {
        (Some(x), Some(step)) => (x, step),
        _ => return Err(RuntimeError::new("Arguments should be numbers.")),
    };
    Ok(Value::Number((x / step).round() * step))
}

struct NativeDef {
    name: &'static str,
    arity: u8,
    func: NativeFn,
}

const NATIVES: &[NativeDef] = &[
    NativeDef {
        name: "clock",
        arity: 0,
        func: native_clock,
    },
    NativeDef {
        name: "readNumber",
        arity: 0,
        func: native_read_number,
    },
    NativeDef {
        name: "stringify",
        arity: 1,
        func: native_stringify,
    },
    NativeDef {
        name: "round",
        arity: 2,
        func: native_round,
    },
];

/// Allocates every native as a heap object and binds it under its name in
/// the global table. Called once, before any user code runs, so there's
/// nothing yet for a collection to root.
pub(super) fn install(heap: &mut Heap) -> HashMap<String, Value> {
    Lazy::force(&START);
    let mut globals = HashMap::new();
    for def in NATIVES {
        let r = heap.alloc_native(def.name, def.arity, def.func);
        globals.insert(def.name.to_string(), Value::Obj(r));
    }
    globals
}
