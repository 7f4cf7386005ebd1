//! Call-frame dispatch loop (§4.4) and the garbage collector's VM-side root
//! set (§4.5 items 1-4, 6 — item 5, the compiler chain, is rooted by
//! `glimmer-compiler` while it is running).

use glimmer_core::chunk::{disassemble_instruction, OpCode};
use glimmer_core::gc::GcRoots;
use glimmer_core::object::{
    Handle, Heap, NativeFn, ObjBoundMethod, ObjClass, ObjClosure, ObjInstance, ObjNative,
    ObjUpvalue, UpvalueLocation,
};
use glimmer_core::table::Table;
use glimmer_core::value::Value;

use crate::error::InterpretResult;
use crate::frame::CallFrame;
use crate::native;

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Where `print` and natives that want to talk to the outside world send
/// their output. `DefaultHost` writes to real stdout; tests and the
/// end-to-end scenarios in §8 use a buffering host instead.
pub trait Host {
    fn print(&mut self, line: &str);
}

#[derive(Default)]
pub struct DefaultHost;

impl Host for DefaultHost {
    fn print(&mut self, line: &str) {
        println!("{line}");
    }
}

/// Captures everything `print`s instead of touching real stdout — handy
/// for asserting on the end-to-end scenarios in §8.
#[derive(Default)]
pub struct StringHost {
    pub output: String,
}

impl Host for StringHost {
    fn print(&mut self, line: &str) {
        self.output.push_str(line);
        self.output.push('\n');
    }
}

impl Vm<StringHost> {
    pub fn host_output(&self) -> &str {
        &self.host.output
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VmOptions {
    pub trace_execution: bool,
    pub install_stdlib: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions { trace_execution: false, install_stdlib: true }
    }
}

struct VmRoots<'a> {
    stack: &'a [Value],
    frames: &'a [CallFrame],
    globals: &'a Table,
    open_upvalues: &'a [Handle],
    init_string: Handle,
}

impl<'a> GcRoots for VmRoots<'a> {
    fn mark_roots(&mut self, heap: &mut Heap, gray: &mut Vec<Handle>) {
        for &value in self.stack {
            heap.mark_value(gray, value);
        }
        for frame in self.frames {
            heap.mark_handle(gray, frame.closure);
        }
        for &upvalue in self.open_upvalues {
            heap.mark_handle(gray, upvalue);
        }
        self.globals.mark(&mut |v| heap.mark_value(gray, v));
        heap.mark_handle(gray, self.init_string);
    }
}

pub struct Vm<H: Host = DefaultHost> {
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Vec<Handle>,
    init_string: Handle,
    options: VmOptions,
    host: H,
}

impl<H: Host + Default> Vm<H> {
    pub fn new(options: VmOptions) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern_string("init");
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
            options,
            host: H::default(),
        };
        if options.install_stdlib {
            vm.define_native("clock", 0, native::clock);
        }
        vm
    }
}

impl<H: Host> Vm<H> {
    fn maybe_collect(&mut self) {
        let mut roots = VmRoots {
            stack: &self.stack,
            frames: &self.frames,
            globals: &self.globals,
            open_upvalues: &self.open_upvalues,
            init_string: self.init_string,
        };
        self.heap.maybe_collect(&mut roots);
    }

    /// Registers a native function into globals, pushing name and value
    /// onto the stack first so neither is collected mid-registration
    /// (§4.5 "Safety during allocation").
    pub fn define_native(&mut self, name: &str, arity: u8, function: NativeFn) {
        self.maybe_collect();
        let name_handle = self.heap.intern_string(name);
        self.stack.push(Value::Object(name_handle));
        let native_handle = self.heap.alloc_native(ObjNative { name: name_handle, arity, function });
        self.stack.push(Value::Object(native_handle));
        let hash = self.heap.hash_of(name_handle);
        self.globals.set(name_handle, hash, Value::Object(native_handle));
        self.stack.pop();
        self.stack.pop();
    }

    /// Number of values currently on the stack; empty after normal
    /// termination of a top-level script (invariant 1 in §3).
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub fn globals_get(&self, name: &str) -> Option<Value> {
        // used only by tests/CLI introspection; a fresh lookup is fine here
        // since it is never on the hot path.
        self.globals.iter().find_map(|(k, v)| {
            (self.heap.get(k).as_string().map(|s| s.chars.as_ref()) == Some(name)).then_some(v)
        })
    }

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let (function, diagnostics) = {
            let mut roots = VmRoots {
                stack: &self.stack,
                frames: &self.frames,
                globals: &self.globals,
                open_upvalues: &self.open_upvalues,
                init_string: self.init_string,
            };
            glimmer_compiler::compile(source, &mut self.heap, &mut roots)
        };
        let Some(function) = function else {
            diagnostics.report_to_stderr();
            return InterpretResult::CompileError;
        };
        let closure_handle = self.heap.alloc_closure(ObjClosure { function, upvalues: Vec::new() });
        self.stack.push(Value::Object(closure_handle));
        self.frames.push(CallFrame { closure: closure_handle, ip: 0, slot_base: 0 });
        self.run()
    }

    // ---- stack helpers -----------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn runtime_error(&mut self, message: &str) {
        eprintln!("{message}");
        for frame in self.frames.iter().rev() {
            let closure = self.heap.get(frame.closure).as_closure().expect("frame closure");
            let function = self.heap.get(closure.function).as_function().expect("closure function");
            let line = function.chunk.line_at(frame.ip - 1);
            match function.name {
                Some(name) => {
                    let name = self.heap.get(name).as_string().unwrap().chars.to_string();
                    eprintln!("[line {line}] in {name}()");
                }
                None => eprintln!("[line {line}] in script"),
            }
        }
        self.stack.clear();
        self.frames.clear();
    }

    // ---- bytecode fetch -----------------------------------------------

    fn current_chunk(&self) -> &glimmer_core::chunk::Chunk {
        let frame = self.frames.last().expect("no active frame");
        let closure = self.heap.get(frame.closure).as_closure().expect("frame closure");
        &self.heap.get(closure.function).as_function().expect("closure function").chunk
    }

    fn read_byte(&mut self) -> u8 {
        let idx = self.frames.len() - 1;
        let ip = self.frames[idx].ip;
        let byte = self.current_chunk().code()[ip];
        self.frames[idx].ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        ((hi as u16) << 8) | lo as u16
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte();
        self.current_chunk().constant(idx)
    }

    fn read_string(&mut self) -> Handle {
        self.read_constant().as_object().expect("constant is not an object")
    }

    // ---- calls -----------------------------------------------

    fn call_closure(&mut self, closure_handle: Handle, argc: u8) -> Result<(), String> {
        let function_handle = self.heap.get(closure_handle).as_closure().unwrap().function;
        let arity = self.heap.get(function_handle).as_function().unwrap().arity;
        if argc != arity {
            return Err(format!("Expected {arity} arguments but got {argc}."));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        let slot_base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame { closure: closure_handle, ip: 0, slot_base });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), String> {
        let Value::Object(handle) = callee else {
            return Err("Can only call functions and classes.".to_string());
        };
        match self.heap.get(handle) {
            glimmer_core::object::Obj::Closure(_) => self.call_closure(handle, argc),
            glimmer_core::object::Obj::Class(_) => {
                self.maybe_collect();
                let instance = self.heap.alloc_instance(ObjInstance { class: handle, fields: Table::new() });
                let callee_slot = self.stack.len() - argc as usize - 1;
                self.stack[callee_slot] = Value::Object(instance);
                let init = {
                    let hash = self.heap.hash_of(self.init_string);
                    self.heap.get(handle).as_class().unwrap().methods.get(self.init_string, hash)
                };
                match init {
                    Some(Value::Object(init_closure)) => self.call_closure(init_closure, argc),
                    _ if argc == 0 => Ok(()),
                    _ => Err(format!("Expected 0 arguments but got {argc}.")),
                }
            }
            glimmer_core::object::Obj::BoundMethod(bound) => {
                let method = bound.method;
                let receiver = bound.receiver;
                let callee_slot = self.stack.len() - argc as usize - 1;
                self.stack[callee_slot] = receiver;
                self.call_closure(method, argc)
            }
            glimmer_core::object::Obj::Native(native) => {
                let arg_start = self.stack.len() - argc as usize;
                let function = native.function;
                let result = function(&self.stack[arg_start..]).map_err(|e| e)?;
                self.stack.truncate(arg_start - 1);
                self.push(result);
                Ok(())
            }
            _ => Err("Can only call functions and classes.".to_string()),
        }
    }

    fn invoke_from_class(&mut self, class: Handle, name: Handle, argc: u8) -> Result<(), String> {
        let hash = self.heap.hash_of(name);
        let method = self.heap.get(class).as_class().unwrap().methods.get(name, hash);
        match method {
            Some(Value::Object(closure)) => self.call_closure(closure, argc),
            _ => {
                let name_str = self.heap.get(name).as_string().unwrap().chars.to_string();
                Err(format!("Undefined property '{name_str}'."))
            }
        }
    }

    fn invoke(&mut self, name: Handle, argc: u8) -> Result<(), String> {
        let receiver = self.peek(argc as usize);
        let Value::Object(receiver_handle) = receiver else {
            return Err("Only instances have methods.".to_string());
        };
        let Some(instance) = self.heap.get(receiver_handle).as_instance() else {
            return Err("Only instances have methods.".to_string());
        };
        let class = instance.class;
        let hash = self.heap.hash_of(name);
        if let Some(field) = instance.fields.get(name, hash) {
            let slot = self.stack.len() - 1 - argc as usize;
            self.stack[slot] = field;
            return self.call_value(field, argc);
        }
        self.invoke_from_class(class, name, argc)
    }

    fn bind_method(&mut self, class: Handle, name: Handle) -> Result<(), String> {
        let hash = self.heap.hash_of(name);
        let method = self.heap.get(class).as_class().unwrap().methods.get(name, hash);
        let Some(Value::Object(method_handle)) = method else {
            let name_str = self.heap.get(name).as_string().unwrap().chars.to_string();
            return Err(format!("Undefined property '{name_str}'."));
        };
        self.maybe_collect();
        let receiver = self.peek(0);
        let bound = self.heap.alloc_bound_method(ObjBoundMethod { receiver, method: method_handle });
        self.pop();
        self.push(Value::Object(bound));
        Ok(())
    }

    // ---- upvalues -----------------------------------------------

    fn capture_upvalue(&mut self, slot: usize) -> Handle {
        for &handle in &self.open_upvalues {
            if let UpvalueLocation::Open(s) = self.heap.get(handle).as_upvalue().unwrap().location {
                if s == slot {
                    return handle;
                }
                if s < slot {
                    break;
                }
            }
        }
        self.maybe_collect();
        let handle = self.heap.alloc_upvalue(ObjUpvalue { location: UpvalueLocation::Open(slot) });
        let pos = self
            .open_upvalues
            .iter()
            .position(|&h| match self.heap.get(h).as_upvalue().unwrap().location {
                UpvalueLocation::Open(s) => s < slot,
                UpvalueLocation::Closed(_) => false,
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(pos, handle);
        handle
    }

    fn close_upvalues(&mut self, from_slot: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let handle = self.open_upvalues[i];
            let slot = match self.heap.get(handle).as_upvalue().unwrap().location {
                UpvalueLocation::Open(s) => s,
                UpvalueLocation::Closed(_) => {
                    i += 1;
                    continue;
                }
            };
            if slot >= from_slot {
                let value = self.stack[slot];
                self.heap.get_mut(handle).as_upvalue_mut().unwrap().location = UpvalueLocation::Closed(value);
                self.open_upvalues.remove(i);
            } else {
                i += 1;
            }
        }
    }

    // ---- main loop -----------------------------------------------

    fn run(&mut self) -> InterpretResult {
        loop {
            if self.options.trace_execution {
                let ip = self.frames.last().unwrap().ip;
                let (text, _) = disassemble_instruction(self.current_chunk(), ip, &self.heap);
                #[cfg(feature = "tracing")]
                tracing::trace!("{text}");
                #[cfg(not(feature = "tracing"))]
                let _ = text;
            }

            let byte = self.read_byte();
            let Some(op) = OpCode::from_byte(byte) else {
                self.runtime_error(&format!("Unknown opcode {byte}."));
                return InterpretResult::RuntimeError;
            };

            macro_rules! bail {
                ($result:expr) => {
                    match $result {
                        Ok(v) => v,
                        Err(message) => {
                            self.runtime_error(&message);
                            return InterpretResult::RuntimeError;
                        }
                    }
                };
            }

            macro_rules! fail {
                ($message:expr) => {{
                    self.runtime_error(&$message);
                    return InterpretResult::RuntimeError;
                }};
            }

            match op {
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
                    let base = self.frames.last().unwrap().slot_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slot_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.hash_of(name);
                    match self.globals.get(name, hash) {
                        Some(v) => self.push(v),
                        None => {
                            let n = self.heap.get(name).as_string().unwrap().chars.to_string();
                            fail!(format!("Undefined variable '{n}'."));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.hash_of(name);
                    let value = self.pop();
                    self.globals.set(name, hash, value);
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.hash_of(name);
                    if self.globals.get(name, hash).is_none() {
                        let n = self.heap.get(name).as_string().unwrap().chars.to_string();
                        fail!(format!("Undefined variable '{n}'."));
                    }
                    self.globals.set(name, hash, self.peek(0));
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().unwrap().closure;
                    let upvalue = self.heap.get(closure).as_closure().unwrap().upvalues[slot];
                    let value = match self.heap.get(upvalue).as_upvalue().unwrap().location {
                        UpvalueLocation::Open(s) => self.stack[s],
                        UpvalueLocation::Closed(v) => v,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().unwrap().closure;
                    let upvalue = self.heap.get(closure).as_closure().unwrap().upvalues[slot];
                    let value = self.peek(0);
                    match self.heap.get(upvalue).as_upvalue().unwrap().location {
                        UpvalueLocation::Open(s) => self.stack[s] = value,
                        UpvalueLocation::Closed(_) => {
                            self.heap.get_mut(upvalue).as_upvalue_mut().unwrap().location =
                                UpvalueLocation::Closed(value);
                        }
                    }
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    let Value::Object(receiver) = self.peek(0) else {
                        fail!("Only instances have properties.".to_string());
                    };
                    let Some(instance) = self.heap.get(receiver).as_instance() else {
                        fail!("Only instances have properties.".to_string());
                    };
                    let class = instance.class;
                    let hash = self.heap.hash_of(name);
                    if let Some(field) = instance.fields.get(name, hash) {
                        self.pop();
                        self.push(field);
                    } else {
                        bail!(self.bind_method(class, name));
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let Value::Object(receiver) = self.peek(1) else {
                        fail!("Only instances have fields.".to_string());
                    };
                    if self.heap.get(receiver).as_instance().is_none() {
                        fail!("Only instances have fields.".to_string());
                    }
                    let hash = self.heap.hash_of(name);
                    let value = self.peek(0);
                    self.heap.get_mut(receiver).as_instance_mut().unwrap().fields.set(name, hash, value);
                    self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let Value::Object(superclass) = self.pop() else { unreachable!("compiler always pushes a class") };
                    bail!(self.bind_method(superclass, name));
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(Value::values_equal(a, b)));
                }
                OpCode::Greater => bail!(self.numeric_binary(op)),
                OpCode::Less => bail!(self.numeric_binary(op)),
                OpCode::Add => bail!(self.add()),
                OpCode::Subtract | OpCode::Multiply | OpCode::Divide => bail!(self.numeric_binary(op)),
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Negate => {
                    let v = self.peek(0);
                    match v.as_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::Number(-n));
                        }
                        None => fail!("Operand must be a number.".to_string()),
                    }
                }
                OpCode::Print => {
                    let v = self.pop();
                    let text = v.render(&self.heap);
                    self.host.print(&text);
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    bail!(self.call_value(callee, argc));
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    bail!(self.invoke(name, argc));
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    let Value::Object(superclass) = self.pop() else { unreachable!("compiler always pushes a class") };
                    bail!(self.invoke_from_class(superclass, name, argc));
                }
                OpCode::Closure => {
                    let Value::Object(function) = self.read_constant() else { unreachable!() };
                    let upvalue_count = self.heap.get(function).as_function().unwrap().upvalue_count;
                    let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                    let base = self.frames.last().unwrap().slot_base;
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            let enclosing = self.frames.last().unwrap().closure;
                            upvalues.push(self.heap.get(enclosing).as_closure().unwrap().upvalues[index]);
                        }
                    }
                    self.maybe_collect();
                    let handle = self.heap.alloc_closure(ObjClosure { function, upvalues });
                    self.push(Value::Object(handle));
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let slot_base = self.frames.last().unwrap().slot_base;
                    self.close_upvalues(slot_base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.pop();
                        return InterpretResult::Ok;
                    }
                    self.stack.truncate(slot_base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    self.maybe_collect();
                    let handle = self.heap.alloc_class(ObjClass { name, methods: Table::new() });
                    self.push(Value::Object(handle));
                }
                OpCode::Inherit => {
                    let Value::Object(superclass) = self.peek(1) else {
                        fail!("Superclass must be a class.".to_string());
                    };
                    if self.heap.get(superclass).as_class().is_none() {
                        fail!("Superclass must be a class.".to_string());
                    }
                    let Value::Object(subclass) = self.peek(0) else { unreachable!() };
                    let entries: Vec<(Handle, Value)> =
                        self.heap.get(superclass).as_class().unwrap().methods.iter().collect();
                    for (k, v) in entries {
                        let hash = self.heap.hash_of(k);
                        self.heap.get_mut(subclass).as_class_mut().unwrap().methods.set(k, hash, v);
                    }
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = self.pop();
                    let Value::Object(class) = self.peek(0) else { unreachable!() };
                    let hash = self.heap.hash_of(name);
                    self.heap.get_mut(class).as_class_mut().unwrap().methods.set(name, hash, method);
                }
            }
        }
    }

    fn numeric_binary(&mut self, op: OpCode) -> Result<(), String> {
        let (Some(b), Some(a)) = (self.peek(0).as_number(), self.peek(1).as_number()) else {
            return Err("Operands must be numbers.".to_string());
        };
        self.pop();
        self.pop();
        let result = match op {
            OpCode::Greater => Value::Bool(a > b),
            OpCode::Less => Value::Bool(a < b),
            OpCode::Subtract => Value::Number(a - b),
            OpCode::Multiply => Value::Number(a * b),
            OpCode::Divide => Value::Number(a / b),
            _ => unreachable!(),
        };
        self.push(result);
        Ok(())
    }

    fn add(&mut self) -> Result<(), String> {
        match (self.peek(0), self.peek(1)) {
            (Value::Number(b), Value::Number(a)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b));
                Ok(())
            }
            (Value::Object(b), Value::Object(a))
                if self.heap.get(a).as_string().is_some() && self.heap.get(b).as_string().is_some() =>
            {
                let a_str = self.heap.get(a).as_string().unwrap().chars.to_string();
                let b_str = self.heap.get(b).as_string().unwrap().chars.to_string();
                self.maybe_collect();
                let handle = self.heap.intern_string(&(a_str + &b_str));
                self.pop();
                self.pop();
                self.push(Value::Object(handle));
                Ok(())
            }
            _ => Err("Operands must be two numbers or two strings.".to_string()),
        }
    }
}

