//! Source-to-stdout scenarios exercising the public `Vm` API the way a CLI
//! caller would, rather than the crate-internal unit tests beside the
//! dispatch loop.

use std::io::Write;
use std::sync::{Arc, Mutex};

use vm::{InterpretError, Vm};

struct Sink(Arc<Mutex<Vec<u8>>>);

impl Write for Sink {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> (Result<(), InterpretError>, String) {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let mut vm = Vm::with_output(Box::new(Sink(buf.clone())));
    let result = vm.interpret(source);
    let output = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
    (result, output)
}

#[test]
fn str_native_converts_every_value_kind() {
    let (result, out) = run(
        r#"
        print str(1);
        print str(true);
        print str(nil);
        "#,
    );
    assert!(result.is_ok());
    assert_eq!(out, "1\ntrue\nnil\n");
}

#[test]
fn clock_native_returns_a_number() {
    let (result, out) = run("print clock() >= 0;");
    assert!(result.is_ok());
    assert_eq!(out, "true\n");
}

#[test]
fn a_long_running_allocation_loop_survives_garbage_collection() {
    let (result, out) = run(
        r#"
        var total = 0;
        for (var i = 0; i < 100000; i = i + 1) {
            var label = str(i);
            if (label == "") total = total + 1;
        }
        print total;
        "#,
    );
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(out, "0\n");
}

#[test]
fn multiple_scripts_share_state_across_interpret_calls() {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let mut vm = Vm::with_output(Box::new(Sink(buf.clone())));
    assert!(vm.interpret("var count = 0;").is_ok());
    assert!(vm.interpret("count = count + 1; print count;").is_ok());
    assert!(vm.interpret("count = count + 1; print count;").is_ok());
    let out = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
    assert_eq!(out, "1\n2\n");
}

#[test]
fn field_access_on_a_number_is_a_runtime_error_not_a_panic() {
    let (result, _) = run("var x = 1; print x.y;");
    assert!(result.is_err());
}

#[test]
fn disassembly_reaches_nested_function_constants() {
    let mut vm = Vm::new();
    let text = vm
        .compile_for_disassembly("fun outer() { fun inner() { return 1; } return inner; }")
        .expect("valid source should compile");
    assert!(text.contains("<script>") || text.contains("outer"));
    assert!(text.contains("inner"));
}
