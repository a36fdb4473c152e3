mod natives;

use std::fmt;
use std::io::Write;

use compiler::{
    compile, BoundMethodObj, ClassObj, ClosureObj, CompileError, Heap, InstanceObj, ObjData,
    ObjRef, OpCode, RuntimeError, Table, UpvalueObj, Value,
};

/// Calls deeper than this overflow the VM (spec.md §4.6, §8).
const FRAMES_MAX: usize = 64;

/// One activation of a closure: which closure is running, where its
/// instruction pointer sits in that closure's chunk, and where its locals
/// begin on the value stack.
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slots_start: usize,
}

/// Either a compile-time or a runtime failure, the two ways `Vm::interpret`
/// can come back without a result. Kept distinct (rather than folded into
/// one error type) because the CLI maps them to different exit codes.
#[derive(Debug)]
pub enum InterpretError {
    Compile(Vec<CompileError>),
    Runtime(RuntimeError),
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpretError::Compile(errors) => {
                for (i, e) in errors.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{e}")?;
                }
                Ok(())
            }
            InterpretError::Runtime(e) => write!(f, "{e}"),
        }
    }
}

/// The stack machine: a value stack, a call-frame stack, globals, and the
/// object heap the compiler also allocates into. One `Vm` can run many
/// top-level scripts in sequence (the REPL's use case) since globals and
/// the heap persist across `interpret` calls.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table<Value>,
    /// Open upvalues still pointing at a live stack slot, kept sorted by
    /// descending slot so `close_upvalues` can stop at the first slot below
    /// its target.
    open_upvalues: Vec<ObjRef>,
    /// `"init"`, interned once so initializer lookup never re-interns it.
    init_string: ObjRef,
    out: Box<dyn Write>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(std::io::stdout()))
    }

    /// Builds a VM that writes `print` output to `out` instead of stdout.
    /// Used by tests that need to assert on program output.
    pub fn with_output(out: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut globals = Table::new();
        for &(name, arity, function) in natives::NATIVES {
            let name_ref = heap.intern(name);
            let native_ref = heap.alloc_native(compiler::NativeObj {
                name,
                arity,
                function,
            });
            globals.set(heap.objects(), name_ref, Value::Obj(native_ref));
        }
        Self {
            heap,
            stack: Vec::new(),
            frames: Vec::new(),
            globals,
            open_upvalues: Vec::new(),
            init_string,
            out,
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Compiles `source` without running it and renders the resulting
    /// function (and every function nested in its constant pool) as
    /// disassembly text. Used by the CLI's `--disassemble` flag; never
    /// called during ordinary `interpret`.
    pub fn compile_for_disassembly(&mut self, source: &str) -> Result<String, Vec<CompileError>> {
        let script = compile(source, &mut self.heap)?;
        Ok(compiler::disassemble_function(script, &self.heap))
    }

    /// Compiles and runs one source unit. On a runtime error the stack and
    /// frames are reset so the same `Vm` can go on to the next REPL line;
    /// globals defined before the error stay defined.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let script = compile(source, &mut self.heap).map_err(InterpretError::Compile)?;
        self.stack.push(Value::Obj(script));
        let closure_ref = self.heap.alloc_closure(ClosureObj {
            function: script,
            upvalues: Vec::new(),
        });
        self.stack.pop();
        self.stack.push(Value::Obj(closure_ref));
        self.frames.push(CallFrame {
            closure: closure_ref,
            ip: 0,
            slots_start: 0,
        });
        let result = self.run();
        if result.is_err() {
            self.stack.clear();
            self.frames.clear();
            self.open_upvalues.clear();
        }
        result.map_err(InterpretError::Runtime)
    }

    // --- stack helpers -----------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack
            .pop()
            .expect("stack underflow: compiler-emitted bytecode must keep the stack balanced")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // --- bytecode fetch ------------------------------------------------

    fn current_ip(&self) -> usize {
        self.frames.last().unwrap().ip
    }

    fn current_function(&self) -> ObjRef {
        self.closure_function(self.frames.last().unwrap().closure)
    }

    fn chunk_byte_at(&self, ip: usize) -> u8 {
        match self.heap.data(self.current_function()) {
            ObjData::Function(f) => f.chunk.byte(ip),
            _ => unreachable!("frame closure did not point at a function"),
        }
    }

    fn chunk_u16_at(&self, ip: usize) -> u16 {
        match self.heap.data(self.current_function()) {
            ObjData::Function(f) => f.chunk.read_u16(ip),
            _ => unreachable!(),
        }
    }

    fn chunk_line_at(&self, ip: usize) -> u32 {
        match self.heap.data(self.current_function()) {
            ObjData::Function(f) => f.chunk.line_at(ip),
            _ => unreachable!(),
        }
    }

    fn read_byte(&mut self) -> u8 {
        let ip = self.current_ip();
        let byte = self.chunk_byte_at(ip);
        self.frames.last_mut().unwrap().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let ip = self.current_ip();
        let value = self.chunk_u16_at(ip);
        self.frames.last_mut().unwrap().ip += 2;
        value
    }

    fn read_constant(&self, index: u8) -> Value {
        match self.heap.data(self.current_function()) {
            ObjData::Function(f) => f.chunk.constant(index),
            _ => unreachable!(),
        }
    }

    /// Reads a constant and unwraps it as an `ObjRef`. Used for every
    /// name-idx operand (global/property/method names are always interned
    /// strings) and for the function operand of `CLOSURE`.
    fn constant_obj(&mut self, index: u8) -> ObjRef {
        self.read_constant(index)
            .as_obj()
            .expect("name-idx constant operand was not an object handle")
    }

    fn current_line(&self) -> u32 {
        self.chunk_line_at(self.current_ip().saturating_sub(1))
    }

    // --- object accessors ------------------------------------------------

    fn closure_function(&self, closure: ObjRef) -> ObjRef {
        match self.heap.data(closure) {
            ObjData::Closure(c) => c.function,
            other => unreachable!("expected a closure, found {}", other.kind_name()),
        }
    }

    fn function_arity(&self, function: ObjRef) -> u8 {
        match self.heap.data(function) {
            ObjData::Function(f) => f.arity,
            _ => unreachable!(),
        }
    }

    fn function_upvalue_count(&self, function: ObjRef) -> u8 {
        match self.heap.data(function) {
            ObjData::Function(f) => f.upvalue_count,
            _ => unreachable!(),
        }
    }

    fn function_name(&self, function: ObjRef) -> Option<String> {
        match self.heap.data(function) {
            ObjData::Function(f) => f.name.map(|n| self.heap.as_str(n).to_string()),
            _ => unreachable!(),
        }
    }

    fn is_string(&self, r: ObjRef) -> bool {
        matches!(self.heap.data(r), ObjData::String(_))
    }

    // --- GC --------------------------------------------------------------

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    /// Roots per spec.md §5.5: every value on the stack, every frame's
    /// closure, every open upvalue, every global (key and value), and the
    /// cached `init` string. The compiler's own frame chain isn't a root
    /// here because compilation always completes before execution starts —
    /// nothing is collected mid-compile.
    fn collect_garbage(&mut self) {
        let Vm {
            heap,
            stack,
            frames,
            globals,
            open_upvalues,
            init_string,
            ..
        } = self;
        heap.collect_garbage(|h| {
            for v in stack.iter() {
                h.mark_value(*v);
            }
            for f in frames.iter() {
                h.mark_object(f.closure);
            }
            for uv in open_upvalues.iter() {
                h.mark_object(*uv);
            }
            for (key, value) in globals.iter() {
                h.mark_object(key);
                h.mark_value(*value);
            }
            h.mark_object(*init_string);
        });
    }

    // --- upvalues ----------------------------------------------------------

    /// Finds or creates the open upvalue for stack slot `slot`, keeping
    /// `open_upvalues` sorted by descending slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        for &uv_ref in &self.open_upvalues {
            match self.heap.data(uv_ref) {
                ObjData::Upvalue(UpvalueObj::Open(s)) if *s == slot => return uv_ref,
                ObjData::Upvalue(UpvalueObj::Open(s)) if *s < slot => break,
                _ => {}
            }
        }
        let new_ref = self.heap.alloc_upvalue(UpvalueObj::Open(slot));
        let pos = self
            .open_upvalues
            .iter()
            .position(|&r| match self.heap.data(r) {
                ObjData::Upvalue(UpvalueObj::Open(s)) => *s < slot,
                _ => false,
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(pos, new_ref);
        new_ref
    }

    /// Closes (hoists onto the heap) every open upvalue at or above
    /// `from_slot`. Called both by `CLOSE_UPVALUE` and when a frame returns.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&top_ref) = self.open_upvalues.first() {
            let slot = match self.heap.data(top_ref) {
                ObjData::Upvalue(UpvalueObj::Open(s)) => *s,
                _ => unreachable!(),
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot];
            if let ObjData::Upvalue(u) = self.heap.data_mut(top_ref) {
                *u = UpvalueObj::Closed(value);
            }
            self.open_upvalues.remove(0);
        }
    }

    // --- calling -----------------------------------------------------------

    fn call_closure(&mut self, closure: ObjRef, argc: u8, slots_start: usize) -> Result<(), RuntimeError> {
        let function = self.closure_function(closure);
        let arity = self.function_arity(function);
        if arity != argc {
            return Err(self.err_arity(arity, argc as usize));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.err_stack_overflow());
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots_start,
        });
        Ok(())
    }

    fn call_native(&mut self, native: ObjRef, argc: u8, slots_start: usize) -> Result<(), RuntimeError> {
        let (arity, function) = match self.heap.data(native) {
            ObjData::Native(n) => (n.arity, n.function),
            _ => unreachable!(),
        };
        if arity != argc {
            return Err(self.err_arity(arity, argc as usize));
        }
        let args: Vec<Value> = self.stack[slots_start + 1..].to_vec();
        match function(&mut self.heap, &args) {
            Ok(result) => {
                self.stack.truncate(slots_start);
                self.push(result);
                self.maybe_collect();
                Ok(())
            }
            Err(message) => Err(self.err_native(message)),
        }
    }

    fn call_class(&mut self, class: ObjRef, argc: u8, slots_start: usize) -> Result<(), RuntimeError> {
        let instance = self.heap.alloc_instance(InstanceObj {
            class,
            fields: Table::new(),
        });
        self.stack[slots_start] = Value::Obj(instance);
        self.maybe_collect();
        match self.heap.get_method(class, self.init_string) {
            Some(init) => self.call_closure(init, argc, slots_start),
            None if argc == 0 => Ok(()),
            None => Err(self.err_arity(0, argc as usize)),
        }
    }

    fn call_bound_method(&mut self, bound: ObjRef, argc: u8, slots_start: usize) -> Result<(), RuntimeError> {
        let (receiver, method) = match self.heap.data(bound) {
            ObjData::BoundMethod(b) => (b.receiver, b.method),
            _ => unreachable!(),
        };
        self.stack[slots_start] = receiver;
        self.call_closure(method, argc, slots_start)
    }

    fn call_value(&mut self, argc: u8) -> Result<(), RuntimeError> {
        let slots_start = self.stack.len() - argc as usize - 1;
        let callee = self.stack[slots_start];
        match callee {
            Value::Obj(r) if matches!(self.heap.data(r), ObjData::Closure(_)) => {
                self.call_closure(r, argc, slots_start)
            }
            Value::Obj(r) if matches!(self.heap.data(r), ObjData::Native(_)) => {
                self.call_native(r, argc, slots_start)
            }
            Value::Obj(r) if matches!(self.heap.data(r), ObjData::Class(_)) => {
                self.call_class(r, argc, slots_start)
            }
            Value::Obj(r) if matches!(self.heap.data(r), ObjData::BoundMethod(_)) => {
                self.call_bound_method(r, argc, slots_start)
            }
            _ => Err(self.err_not_callable()),
        }
    }

    // --- arithmetic helpers --------------------------------------------------

    fn binary_numeric(&mut self, op: fn(f64, f64) -> Value) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.push(op(x, y));
                Ok(())
            }
            _ => {
                let bad = if a.as_number().is_none() { a } else { b };
                Err(self.err_type_mismatch("number", bad))
            }
        }
    }

    fn binary_compare(&mut self, op: fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.push(Value::Bool(op(x, y)));
                Ok(())
            }
            _ => {
                let bad = if a.as_number().is_none() { a } else { b };
                Err(self.err_type_mismatch("number", bad))
            }
        }
    }

    // --- errors --------------------------------------------------------------

    /// The source line a frame's instruction pointer is currently sitting
    /// at, looked up in that frame's own function (not necessarily the
    /// topmost one — every frame on the stack needs this for backtraces).
    fn frame_line(&self, frame: &CallFrame) -> u32 {
        let function = self.closure_function(frame.closure);
        match self.heap.data(function) {
            ObjData::Function(f) => f.chunk.line_at(frame.ip.saturating_sub(1)),
            _ => unreachable!(),
        }
    }

    /// Walks the live frame stack outermost-first, so `Backtrace`'s own
    /// reversed `Display` prints innermost-first.
    fn build_backtrace(&self) -> compiler::Backtrace {
        let mut backtrace = compiler::Backtrace::default();
        for frame in &self.frames {
            let function = self.closure_function(frame.closure);
            let name = self.function_name(function);
            backtrace.push(name, self.frame_line(frame));
        }
        backtrace
    }

    fn err_type_mismatch(&self, expected: &'static str, got: Value) -> RuntimeError {
        RuntimeError::TypeMismatch {
            expected,
            got: got.type_name(&self.heap),
            line: self.current_line(),
            backtrace: self.build_backtrace(),
        }
    }

    fn err_undefined_variable(&self, name: ObjRef) -> RuntimeError {
        RuntimeError::UndefinedVariable {
            name: self.heap.as_str(name).to_string(),
            line: self.current_line(),
            backtrace: self.build_backtrace(),
        }
    }

    fn err_not_instance(&self) -> RuntimeError {
        RuntimeError::NotAnInstance {
            line: self.current_line(),
            backtrace: self.build_backtrace(),
        }
    }

    fn err_undefined_property(&self, name: ObjRef) -> RuntimeError {
        RuntimeError::UndefinedProperty {
            name: self.heap.as_str(name).to_string(),
            line: self.current_line(),
            backtrace: self.build_backtrace(),
        }
    }

    fn err_not_callable(&self) -> RuntimeError {
        RuntimeError::NotCallable {
            line: self.current_line(),
            backtrace: self.build_backtrace(),
        }
    }

    fn err_arity(&self, expected: u8, got: usize) -> RuntimeError {
        RuntimeError::ArityMismatch {
            expected,
            got,
            line: self.current_line(),
            backtrace: self.build_backtrace(),
        }
    }

    fn err_stack_overflow(&self) -> RuntimeError {
        RuntimeError::StackOverflow {
            line: self.current_line(),
            backtrace: self.build_backtrace(),
        }
    }

    fn err_superclass_not_class(&self) -> RuntimeError {
        RuntimeError::SuperclassNotAClass {
            line: self.current_line(),
            backtrace: self.build_backtrace(),
        }
    }

    fn err_native(&self, message: String) -> RuntimeError {
        RuntimeError::Native {
            message,
            line: self.current_line(),
            backtrace: self.build_backtrace(),
        }
    }

    // --- the dispatch loop ---------------------------------------------------

    #[cfg(feature = "verbose")]
    fn trace_instruction(&self) {
        let stack_text: Vec<String> = self
            .stack
            .iter()
            .map(|v| format!("[ {} ]", v.display(&self.heap)))
            .collect();
        eprint!("          {}\n", stack_text.concat());
        let function = self.current_function();
        if let ObjData::Function(f) = self.heap.data(function) {
            let (text, _) = compiler::disassemble_instruction(&f.chunk, self.current_ip(), &self.heap);
            eprint!("{text}");
        }
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            #[cfg(feature = "verbose")]
            self.trace_instruction();
            let instruction = OpCode::from(self.read_byte());
            match instruction {
                OpCode::Constant => {
                    let idx = self.read_byte();
                    let value = self.read_constant(idx);
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte();
                    let index = self.frames.last().unwrap().slots_start + slot as usize;
                    self.push(self.stack[index]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte();
                    let index = self.frames.last().unwrap().slots_start + slot as usize;
                    self.stack[index] = self.peek(0);
                }
                OpCode::GetUpvalue => {
                    let idx = self.read_byte();
                    let uv_ref = match self.heap.data(self.frames.last().unwrap().closure) {
                        ObjData::Closure(c) => c.upvalues[idx as usize],
                        _ => unreachable!(),
                    };
                    let value = match self.heap.data(uv_ref) {
                        ObjData::Upvalue(UpvalueObj::Open(slot)) => self.stack[*slot],
                        ObjData::Upvalue(UpvalueObj::Closed(v)) => *v,
                        _ => unreachable!(),
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let idx = self.read_byte();
                    let uv_ref = match self.heap.data(self.frames.last().unwrap().closure) {
                        ObjData::Closure(c) => c.upvalues[idx as usize],
                        _ => unreachable!(),
                    };
                    let value = self.peek(0);
                    match self.heap.data_mut(uv_ref) {
                        ObjData::Upvalue(UpvalueObj::Open(slot)) => {
                            let slot = *slot;
                            self.stack[slot] = value;
                        }
                        ObjData::Upvalue(UpvalueObj::Closed(v)) => *v = value,
                        _ => unreachable!(),
                    }
                }
                OpCode::GetGlobal => {
                    let idx = self.read_byte();
                    let name = self.constant_obj(idx);
                    match self.globals.get(self.heap.objects(), name).copied() {
                        Some(value) => self.push(value),
                        None => return Err(self.err_undefined_variable(name)),
                    }
                }
                OpCode::DefineGlobal => {
                    let idx = self.read_byte();
                    let name = self.constant_obj(idx);
                    let value = self.pop();
                    self.globals.set(self.heap.objects(), name, value);
                }
                OpCode::SetGlobal => {
                    let idx = self.read_byte();
                    let name = self.constant_obj(idx);
                    let value = self.peek(0);
                    if self.globals.get(self.heap.objects(), name).is_none() {
                        return Err(self.err_undefined_variable(name));
                    }
                    self.globals.set(self.heap.objects(), name, value);
                }
                OpCode::GetProperty => {
                    let idx = self.read_byte();
                    let name = self.constant_obj(idx);
                    let receiver = self.pop();
                    let instance = match receiver {
                        Value::Obj(r) if matches!(self.heap.data(r), ObjData::Instance(_)) => r,
                        _ => return Err(self.err_not_instance()),
                    };
                    if let Some(field) = self.heap.get_field(instance, name) {
                        self.push(field);
                    } else {
                        let class = self.heap.instance_class(instance);
                        match self.heap.get_method(class, name) {
                            Some(method) => {
                                let bound = self.heap.alloc_bound_method(BoundMethodObj {
                                    receiver,
                                    method,
                                });
                                self.push(Value::Obj(bound));
                                self.maybe_collect();
                            }
                            None => return Err(self.err_undefined_property(name)),
                        }
                    }
                }
                OpCode::SetProperty => {
                    let idx = self.read_byte();
                    let name = self.constant_obj(idx);
                    let value = self.pop();
                    let receiver = self.pop();
                    let instance = match receiver {
                        Value::Obj(r) if matches!(self.heap.data(r), ObjData::Instance(_)) => r,
                        _ => return Err(self.err_not_instance()),
                    };
                    self.heap.set_field(instance, name, value);
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let idx = self.read_byte();
                    let name = self.constant_obj(idx);
                    let superclass = self.pop();
                    let superclass = match superclass {
                        Value::Obj(r) if matches!(self.heap.data(r), ObjData::Class(_)) => r,
                        _ => return Err(self.err_superclass_not_class()),
                    };
                    let receiver = self.pop();
                    match self.heap.get_method(superclass, name) {
                        Some(method) => {
                            let bound = self.heap.alloc_bound_method(BoundMethodObj {
                                receiver,
                                method,
                            });
                            self.push(Value::Obj(bound));
                            self.maybe_collect();
                        }
                        None => return Err(self.err_undefined_property(name)),
                    }
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.binary_compare(|x, y| x > y)?,
                OpCode::Less => self.binary_compare(|x, y| x < y)?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(!value.is_truthy()));
                }
                OpCode::Negate => {
                    let value = self.pop();
                    match value.as_number() {
                        Some(n) => self.push(Value::Number(-n)),
                        None => return Err(self.err_type_mismatch("number", value)),
                    }
                }
                OpCode::Add => {
                    let b = self.pop();
                    let a = self.pop();
                    match (a, b) {
                        (Value::Number(x), Value::Number(y)) => self.push(Value::Number(x + y)),
                        (Value::Obj(ra), Value::Obj(rb))
                            if self.is_string(ra) && self.is_string(rb) =>
                        {
                            let mut joined = self.heap.as_str(ra).to_string();
                            joined.push_str(self.heap.as_str(rb));
                            let r = self.heap.intern(&joined);
                            self.push(Value::Obj(r));
                            self.maybe_collect();
                        }
                        _ => {
                            return Err(RuntimeError::TypeMismatch {
                                expected: "two numbers or two strings",
                                got: a.type_name(&self.heap),
                                line: self.current_line(),
                                backtrace: self.build_backtrace(),
                            })
                        }
                    }
                }
                OpCode::Subtract => self.binary_numeric(|x, y| Value::Number(x - y))?,
                OpCode::Multiply => self.binary_numeric(|x, y| Value::Number(x * y))?,
                OpCode::Divide => self.binary_numeric(|x, y| Value::Number(x / y))?,
                OpCode::Print => {
                    let value = self.pop();
                    let text = value.display(&self.heap).to_string();
                    let _ = writeln!(self.out, "{text}");
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte();
                    self.call_value(argc)?;
                }
                OpCode::Invoke => {
                    let idx = self.read_byte();
                    let name = self.constant_obj(idx);
                    let argc = self.read_byte();
                    let receiver_slot = self.stack.len() - 1 - argc as usize;
                    let receiver = self.stack[receiver_slot];
                    let instance = match receiver {
                        Value::Obj(r) if matches!(self.heap.data(r), ObjData::Instance(_)) => r,
                        _ => return Err(self.err_not_instance()),
                    };
                    if let Some(field) = self.heap.get_field(instance, name) {
                        self.stack[receiver_slot] = field;
                        self.call_value(argc)?;
                    } else {
                        let class = self.heap.instance_class(instance);
                        match self.heap.get_method(class, name) {
                            Some(method) => self.call_closure(method, argc, receiver_slot)?,
                            None => return Err(self.err_undefined_property(name)),
                        }
                    }
                }
                OpCode::SuperInvoke => {
                    let idx = self.read_byte();
                    let name = self.constant_obj(idx);
                    let argc = self.read_byte();
                    let superclass = self.pop();
                    let superclass = match superclass {
                        Value::Obj(r) if matches!(self.heap.data(r), ObjData::Class(_)) => r,
                        _ => return Err(self.err_superclass_not_class()),
                    };
                    let slots_start = self.stack.len() - argc as usize - 1;
                    match self.heap.get_method(superclass, name) {
                        Some(method) => self.call_closure(method, argc, slots_start)?,
                        None => return Err(self.err_undefined_property(name)),
                    }
                }
                OpCode::Closure => {
                    let idx = self.read_byte();
                    let function = self.constant_obj(idx);
                    let upvalue_count = self.function_upvalue_count(function);
                    let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte();
                        if is_local {
                            let slot = self.frames.last().unwrap().slots_start + index as usize;
                            upvalues.push(self.capture_upvalue(slot));
                        } else {
                            let enclosing = self.frames.last().unwrap().closure;
                            let uv = match self.heap.data(enclosing) {
                                ObjData::Closure(c) => c.upvalues[index as usize],
                                _ => unreachable!(),
                            };
                            upvalues.push(uv);
                        }
                    }
                    let closure = self.heap.alloc_closure(ClosureObj { function, upvalues });
                    self.push(Value::Obj(closure));
                    self.maybe_collect();
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let value = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.slots_start);
                    self.stack.truncate(frame.slots_start);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(value);
                }
                OpCode::Class => {
                    let idx = self.read_byte();
                    let name = self.constant_obj(idx);
                    let class = self.heap.alloc_class(ClassObj {
                        name,
                        methods: Table::new(),
                    });
                    self.push(Value::Obj(class));
                    self.maybe_collect();
                }
                OpCode::Inherit => {
                    let subclass = self.pop();
                    let superclass = self.peek(0);
                    let superclass_ref = match superclass {
                        Value::Obj(r) if matches!(self.heap.data(r), ObjData::Class(_)) => r,
                        _ => return Err(self.err_superclass_not_class()),
                    };
                    let subclass_ref = subclass
                        .as_obj()
                        .expect("INHERIT target must be a class value");
                    self.heap.inherit_methods(superclass_ref, subclass_ref);
                }
                OpCode::Method => {
                    let idx = self.read_byte();
                    let name = self.constant_obj(idx);
                    let closure = self
                        .pop()
                        .as_obj()
                        .expect("METHOD operand must be a closure value");
                    let class = self
                        .peek(0)
                        .as_obj()
                        .expect("METHOD target must be a class value");
                    self.heap.set_method(class, name, closure);
                }
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn run_capturing(source: &str) -> (Result<(), InterpretError>, String) {
        let buf = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        struct Sink(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);
        impl Write for Sink {
            fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(data);
                Ok(data.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let mut vm = Vm::with_output(Box::new(Sink(buf.clone())));
        let result = vm.interpret(source);
        let output = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
        (result, output)
    }

    #[test]
    fn prints_arithmetic() {
        let (result, out) = run_capturing("print 1 + 2 * 3;");
        assert!(result.is_ok());
        assert_eq!(out, "7\n");
    }

    #[test]
    fn string_concatenation_interns_the_result() {
        let (result, out) = run_capturing(r#"print "foo" + "bar";"#);
        assert!(result.is_ok());
        assert_eq!(out, "foobar\n");
    }

    #[test]
    fn recursive_fibonacci() {
        let (result, out) = run_capturing(
            r#"
            fun fib(n) {
                if (n < 2) return n;
                return fib(n - 1) + fib(n - 2);
            }
            print fib(10);
            "#,
        );
        assert!(result.is_ok());
        assert_eq!(out, "55\n");
    }

    #[test]
    fn closures_share_captured_state() {
        let (result, out) = run_capturing(
            r#"
            fun makeCounter() {
                var count = 0;
                fun counter() {
                    count = count + 1;
                    print count;
                }
                return counter;
            }
            var c = makeCounter();
            c();
            c();
            "#,
        );
        assert!(result.is_ok());
        assert_eq!(out, "1\n2\n");
    }

    #[test]
    fn class_inheritance_and_super_calls() {
        let (result, out) = run_capturing(
            r#"
            class Animal {
                speak() { print "..."; }
            }
            class Dog < Animal {
                speak() {
                    super.speak();
                    print "woof";
                }
            }
            Dog().speak();
            "#,
        );
        assert!(result.is_ok());
        assert_eq!(out, "...\nwoof\n");
    }

    #[test]
    fn initializer_runs_on_construction() {
        let (result, out) = run_capturing(
            r#"
            class Point {
                init(x, y) {
                    this.x = x;
                    this.y = y;
                }
            }
            var p = Point(1, 2);
            print p.x + p.y;
            "#,
        );
        assert!(result.is_ok());
        assert_eq!(out, "3\n");
    }

    #[test]
    fn undefined_variable_is_a_runtime_error() {
        let (result, _) = run_capturing("print doesNotExist;");
        assert!(matches!(
            result,
            Err(InterpretError::Runtime(RuntimeError::UndefinedVariable { .. }))
        ));
    }

    #[test]
    fn calling_a_number_is_not_callable() {
        let (result, _) = run_capturing("var x = 1; x();");
        assert!(matches!(
            result,
            Err(InterpretError::Runtime(RuntimeError::NotCallable { .. }))
        ));
    }

    #[test]
    fn vm_recovers_after_a_runtime_error_for_repl_use() {
        let mut vm = Vm::with_output(Box::new(std::io::sink()));
        assert!(vm.interpret("print oops;").is_err());
        assert!(vm.interpret("print 1 + 1;").is_ok());
    }

    #[test]
    fn deep_recursion_overflows_cleanly() {
        let (result, _) = run_capturing(
            r#"
            fun recurse(n) { return recurse(n + 1); }
            recurse(0);
            "#,
        );
        assert!(matches!(
            result,
            Err(InterpretError::Runtime(RuntimeError::StackOverflow { .. }))
        ));
    }

    proptest! {
        /// For any left-associative chain of `+`/`-` over small integers, the
        /// VM's printed result matches evaluating the same chain directly in
        /// Rust (spec.md §8's "after each statement the stack top returns to
        /// its starting depth" is what makes a single final `print` valid
        /// evidence here: if intermediate opcodes ever left the stack
        /// unbalanced, the printed value would drift from the arithmetic).
        #[test]
        fn additive_chains_match_native_evaluation(
            first in -1000i64..1000,
            rest in prop::collection::vec((-1000i64..1000, any::<bool>()), 0..12),
        ) {
            let mut source = first.to_string();
            let mut expected = first as f64;
            for (n, is_add) in &rest {
                if *is_add {
                    source += &format!(" + {n}");
                    expected += *n as f64;
                } else {
                    source += &format!(" - {n}");
                    expected -= *n as f64;
                }
            }
            source += ";";
            let (result, out) = run_capturing(&format!("print {source}"));
            prop_assert!(result.is_ok());
            prop_assert_eq!(out.trim_end(), expected.to_string());
        }
    }
}
