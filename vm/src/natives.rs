use std::time::{SystemTime, UNIX_EPOCH};

use compiler::{Heap, NativeFn, Value};

/// `clock()` — seconds since the Unix epoch, as a float. Arity is enforced
/// by the VM before the native is ever invoked, so these bodies don't
/// re-check argument counts.
fn clock(_heap: &mut Heap, _args: &[Value]) -> Result<Value, String> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| "system clock is set before the Unix epoch".to_string())?
        .as_secs_f64();
    Ok(Value::Number(secs))
}

/// `str(value)` — explicit conversion to a string, using the same rendering
/// `print` does.
fn str_fn(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    let text = args[0].display(heap).to_string();
    Ok(Value::Obj(heap.intern(&text)))
}

/// Name, arity, and function pointer for every native seeded into a fresh
/// VM's globals.
pub const NATIVES: &[(&str, u8, NativeFn)] = &[("clock", 0, clock), ("str", 1, str_fn)];
