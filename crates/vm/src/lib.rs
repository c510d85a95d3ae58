//! The Lox virtual machine.
//!
//! A fetch-decode-execute loop over call frames. The value stack and
//! frame stack are bounded; closures reach captured variables through
//! upvalue objects that stay "open" (pointing at a live stack slot)
//! until the slot is about to die, at which point the VM closes them by
//! moving the value into the upvalue itself.
//!
//! The VM owns the heap and is the garbage collector's root provider:
//! collections run between instructions at allocation points, marking
//! the value stack, frame closures, open upvalues, globals, and the
//! cached `init` string before tracing and sweeping.

mod natives;

use lox_compiler::compile;
use lox_core::chunk::{Chunk, OpCode};
use lox_core::debug::disassemble_instruction;
use lox_core::heap::Heap;
use lox_core::object::{
    BoundMethod, Class, Closure, Instance, Native, NativeFn, Obj, ObjRef, Upvalue,
};
use lox_core::table::Table;
use lox_core::value::Value;
use std::io::{self, Write};

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// The two failure outcomes of [`Vm::interpret`]; success is `Ok(())`.
/// Diagnostics are printed to stderr as they occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretError {
    Compile,
    Runtime,
}

impl std::fmt::Display for InterpretError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterpretError::Compile => write!(f, "compile error"),
            InterpretError::Runtime => write!(f, "runtime error"),
        }
    }
}

impl std::error::Error for InterpretError {}

impl From<lox_compiler::CompileError> for InterpretError {
    fn from(_: lox_compiler::CompileError) -> InterpretError {
        InterpretError::Compile
    }
}

/// One activation record: the closure being run, its instruction
/// pointer, and the stack index of its slot 0 (receiver or reserved).
#[derive(Debug, Clone, Copy)]
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slots: usize,
}

pub struct Vm {
    heap: Heap,
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    globals: Table,
    /// Open upvalues, sorted by strictly decreasing stack slot.
    open_upvalues: Vec<ObjRef>,
    /// Interned `"init"`, looked up on every class call.
    init_string: ObjRef,
    /// Where `print` writes. Diagnostics go to stderr regardless.
    output: Box<dyn Write>,
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}

impl Vm {
    pub fn new() -> Vm {
        Vm::with_output(Box::new(io::stdout()))
    }

    /// Build a VM whose program output goes to `output` instead of
    /// stdout. Used by embedders and tests.
    pub fn with_output(output: Box<dyn Write>) -> Vm {
        natives::init_clock();
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Vm {
            heap,
            frames: Vec::with_capacity(FRAMES_MAX),
            stack: Vec::with_capacity(STACK_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
            output,
        };
        vm.define_native("clock", natives::clock);
        vm
    }

    /// Compile and run one source buffer. Globals persist across calls,
    /// which is what gives the REPL its session state.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = compile(source, &mut self.heap)?;
        // No collection here: nested functions are reachable only
        // through this function's constants until it lands on the stack.
        let function = self.heap.alloc(Obj::Function(function));
        self.push(Value::Obj(function))?;
        let closure = self.allocate(Obj::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure))?;
        self.call_closure(closure, 0)?;
        self.run()
    }

    // --- dispatch loop --------------------------------------------------

    fn run(&mut self) -> Result<(), InterpretError> {
        loop {
            if tracing::enabled!(target: "lox_vm::trace", tracing::Level::TRACE) {
                self.trace_instruction();
            }
            let byte = self.read_byte();
            let Some(op) = OpCode::decode(byte) else {
                return Err(self.runtime_error(&format!("Unknown opcode {byte}.")));
            };
            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value)?;
                }
                OpCode::Nil => self.push(Value::Nil)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().slots + slot];
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string_constant();
                    let hash = self.heap.str_hash(name);
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value)?,
                        None => return Err(self.undefined_variable(name)),
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant();
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant();
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        // The assignment created the key; undo and fail.
                        self.globals.delete(name, hash);
                        return Err(self.undefined_variable(name));
                    }
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[index];
                    let value = match self.heap.upvalue(upvalue) {
                        Upvalue::Open(slot) => self.stack[*slot],
                        Upvalue::Closed(value) => *value,
                    };
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[index];
                    let value = self.peek(0);
                    match self.heap.upvalue_mut(upvalue) {
                        Upvalue::Open(slot) => {
                            let slot = *slot;
                            self.stack[slot] = value;
                        }
                        Upvalue::Closed(cell) => *cell = value,
                    }
                }
                OpCode::GetProperty => {
                    let name = self.read_string_constant();
                    let Some(instance) = self.as_instance(self.peek(0)) else {
                        return Err(self.runtime_error("Only instances have properties."));
                    };
                    let hash = self.heap.str_hash(name);
                    if let Some(value) = self.heap.instance(instance).fields.get(name, hash) {
                        self.pop();
                        self.push(value)?;
                    } else {
                        let class = self.heap.instance(instance).class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string_constant();
                    let Some(instance) = self.as_instance(self.peek(1)) else {
                        return Err(self.runtime_error("Only instances have fields."));
                    };
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    self.heap.instance_mut(instance).fields.set(name, hash, value);
                    let value = self.pop();
                    self.pop();
                    self.push(value)?;
                }
                OpCode::GetSuper => {
                    let name = self.read_string_constant();
                    let superclass = self.pop_obj();
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b))?;
                }
                OpCode::Greater => self.binary_number_op(|a, b| Value::Bool(a > b))?,
                OpCode::Less => self.binary_number_op(|a, b| Value::Bool(a < b))?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.binary_number_op(|a, b| Value::Number(a - b))?,
                OpCode::Multiply => self.binary_number_op(|a, b| Value::Number(a * b))?,
                OpCode::Divide => self.binary_number_op(|a, b| Value::Number(a / b))?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()))?;
                }
                OpCode::Negate => {
                    let Value::Number(n) = self.peek(0) else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(-n))?;
                }
                OpCode::Print => {
                    let value = self.pop();
                    let text = self.heap.show_value(value);
                    let _ = writeln!(self.output, "{text}");
                }
                OpCode::Jump => {
                    let offset = self.read_short() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short() as usize;
                    self.frame_mut().ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string_constant();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string_constant();
                    let arg_count = self.read_byte() as usize;
                    let superclass = self.pop_obj();
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                OpCode::Closure => {
                    let function = match self.read_constant() {
                        Value::Obj(r) => r,
                        _ => unreachable!("closure operand is not a function"),
                    };
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    let closure = self.allocate(Obj::Closure(Closure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    self.push(Value::Obj(closure))?;
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let slot = self.frame().slots + index;
                            self.capture_upvalue(slot)
                        } else {
                            self.heap.closure(self.frame().closure).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = match self.frames.pop() {
                        Some(frame) => frame,
                        None => unreachable!("return without a frame"),
                    };
                    self.close_upvalues(frame.slots);
                    if self.frames.is_empty() {
                        // Pop the implicit script closure and finish.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots);
                    self.push(result)?;
                }
                OpCode::Class => {
                    let name = self.read_string_constant();
                    let class = self.allocate(Obj::Class(Class::new(name)));
                    self.push(Value::Obj(class))?;
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let Some(superclass) = superclass
                        .as_obj()
                        .filter(|&r| matches!(self.heap.obj(r), Obj::Class(_)))
                    else {
                        return Err(self.runtime_error("Superclass must be a class."));
                    };
                    let subclass = match self.peek(0) {
                        Value::Obj(r) => r,
                        _ => unreachable!("INHERIT without a class on the stack"),
                    };
                    self.heap.copy_methods(superclass, subclass);
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string_constant();
                    let method = self.peek(0);
                    let class = match self.peek(1) {
                        Value::Obj(r) => r,
                        _ => unreachable!("METHOD without a class on the stack"),
                    };
                    let hash = self.heap.str_hash(name);
                    self.heap.class_mut(class).methods.set(name, hash, method);
                    self.pop();
                }
            }
        }
    }

    // --- instruction stream ---------------------------------------------

    fn frame(&self) -> &CallFrame {
        &self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        let top = self.frames.len() - 1;
        &mut self.frames[top]
    }

    fn current_chunk(&self) -> &Chunk {
        let function = self.heap.closure(self.frame().closure).function;
        &self.heap.function(function).chunk
    }

    fn read_byte(&mut self) -> u8 {
        let ip = {
            let frame = self.frame_mut();
            let ip = frame.ip;
            frame.ip += 1;
            ip
        };
        self.current_chunk().code[ip]
    }

    fn read_short(&mut self) -> u16 {
        let high = self.read_byte();
        let low = self.read_byte();
        u16::from_be_bytes([high, low])
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.current_chunk().constants[index]
    }

    fn read_string_constant(&mut self) -> ObjRef {
        match self.read_constant() {
            Value::Obj(r) => r,
            _ => unreachable!("name operand is not a string constant"),
        }
    }

    // --- value stack ----------------------------------------------------

    fn push(&mut self, value: Value) -> Result<(), InterpretError> {
        if self.stack.len() == STACK_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(value) => value,
            None => unreachable!("value stack underflow"),
        }
    }

    fn pop_obj(&mut self) -> ObjRef {
        match self.pop() {
            Value::Obj(r) => r,
            _ => unreachable!("expected an object on the stack"),
        }
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn as_instance(&self, value: Value) -> Option<ObjRef> {
        value
            .as_obj()
            .filter(|&r| matches!(self.heap.obj(r), Obj::Instance(_)))
    }

    // --- operators ------------------------------------------------------

    fn binary_number_op(
        &mut self,
        op: fn(f64, f64) -> Value,
    ) -> Result<(), InterpretError> {
        let (Value::Number(b), Value::Number(a)) = (self.peek(0), self.peek(1)) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        self.push(op(a, b))
    }

    /// `+` is overloaded: numbers add, strings concatenate (allocating
    /// and re-interning). Operands stay on the stack until the result
    /// exists so a collection during interning still sees them as roots.
    fn add(&mut self) -> Result<(), InterpretError> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b))
            }
            (Value::Obj(a), Value::Obj(b))
                if matches!(self.heap.obj(a), Obj::Str(_))
                    && matches!(self.heap.obj(b), Obj::Str(_)) =>
            {
                let mut chars =
                    String::with_capacity(self.heap.as_str(a).len() + self.heap.as_str(b).len());
                chars.push_str(self.heap.as_str(a));
                chars.push_str(self.heap.as_str(b));
                let result = self.intern(&chars);
                self.pop();
                self.pop();
                self.push(Value::Obj(result))
            }
            _ => Err(self.runtime_error("Operands must be two numbers or two strings.")),
        }
    }

    // --- calls ----------------------------------------------------------

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), InterpretError> {
        if let Value::Obj(r) = callee {
            match self.heap.obj(r) {
                Obj::Closure(_) => return self.call_closure(r, arg_count),
                Obj::Native(native) => {
                    let function = native.function;
                    let start = self.stack.len() - arg_count;
                    let result = function(&self.stack[start..]);
                    self.stack.truncate(start - 1);
                    return self.push(result);
                }
                Obj::Class(_) => return self.call_class(r, arg_count),
                Obj::BoundMethod(bound) => {
                    let receiver = bound.receiver;
                    let method = bound.method;
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = receiver;
                    return self.call_closure(method, arg_count);
                }
                _ => {}
            }
        }
        Err(self.runtime_error("Can only call functions and classes."))
    }

    fn call_closure(&mut self, closure: ObjRef, arg_count: usize) -> Result<(), InterpretError> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity as usize;
        if arg_count != arity {
            let message = format!("Expected {arity} arguments but got {arg_count}.");
            return Err(self.runtime_error(&message));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    fn call_class(&mut self, class: ObjRef, arg_count: usize) -> Result<(), InterpretError> {
        let instance = self.allocate(Obj::Instance(Instance::new(class)));
        let slot = self.stack.len() - arg_count - 1;
        self.stack[slot] = Value::Obj(instance);
        let hash = self.heap.str_hash(self.init_string);
        if let Some(initializer) = self.heap.class(class).methods.get(self.init_string, hash) {
            let initializer = match initializer {
                Value::Obj(r) => r,
                _ => unreachable!("initializer is not a closure"),
            };
            return self.call_closure(initializer, arg_count);
        }
        if arg_count != 0 {
            let message = format!("Expected 0 arguments but got {arg_count}.");
            return Err(self.runtime_error(&message));
        }
        Ok(())
    }

    fn invoke(&mut self, name: ObjRef, arg_count: usize) -> Result<(), InterpretError> {
        let receiver = self.peek(arg_count);
        let Some(instance) = self.as_instance(receiver) else {
            return Err(self.runtime_error("Only instances have methods."));
        };
        let hash = self.heap.str_hash(name);
        // A field shadowing the method name wins; it may hold anything
        // callable.
        if let Some(field) = self.heap.instance(instance).fields.get(name, hash) {
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = field;
            return self.call_value(field, arg_count);
        }
        let class = self.heap.instance(instance).class;
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        arg_count: usize,
    ) -> Result<(), InterpretError> {
        let hash = self.heap.str_hash(name);
        let Some(method) = self.heap.class(class).methods.get(name, hash) else {
            return Err(self.undefined_property(name));
        };
        let method = match method {
            Value::Obj(r) => r,
            _ => unreachable!("method is not a closure"),
        };
        self.call_closure(method, arg_count)
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), InterpretError> {
        let hash = self.heap.str_hash(name);
        let Some(method) = self.heap.class(class).methods.get(name, hash) else {
            return Err(self.undefined_property(name));
        };
        let method = match method {
            Value::Obj(r) => r,
            _ => unreachable!("method is not a closure"),
        };
        let receiver = self.peek(0);
        let bound = self.allocate(Obj::BoundMethod(BoundMethod { receiver, method }));
        self.pop();
        self.push(Value::Obj(bound))
    }

    // --- upvalues -------------------------------------------------------

    /// Find or create the open upvalue for a stack slot, keeping the
    /// open list sorted by strictly decreasing slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &upvalue) in self.open_upvalues.iter().enumerate() {
            let open_slot = match self.heap.upvalue(upvalue) {
                Upvalue::Open(s) => *s,
                Upvalue::Closed(_) => unreachable!("closed upvalue in the open list"),
            };
            if open_slot == slot {
                return upvalue;
            }
            if open_slot < slot {
                insert_at = i;
                break;
            }
        }
        let created = self.allocate(Obj::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Close every open upvalue at or above `boundary`: copy the stack
    /// value into the upvalue and drop it from the open list.
    fn close_upvalues(&mut self, boundary: usize) {
        let mut closed = 0;
        while closed < self.open_upvalues.len() {
            let upvalue = self.open_upvalues[closed];
            let slot = match self.heap.upvalue(upvalue) {
                Upvalue::Open(s) => *s,
                Upvalue::Closed(_) => unreachable!("closed upvalue in the open list"),
            };
            if slot < boundary {
                break;
            }
            let value = self.stack[slot];
            *self.heap.upvalue_mut(upvalue) = Upvalue::Closed(value);
            closed += 1;
        }
        self.open_upvalues.drain(..closed);
    }

    // --- memory ---------------------------------------------------------

    fn allocate(&mut self, obj: Obj) -> ObjRef {
        self.maybe_collect();
        self.heap.alloc(obj)
    }

    fn intern(&mut self, chars: &str) -> ObjRef {
        self.maybe_collect();
        self.heap.intern(chars)
    }

    fn maybe_collect(&mut self) {
        if cfg!(feature = "stress-gc") || self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    /// Mark the documented root set, then trace, sweep the intern set's
    /// dead keys, and sweep the heap.
    pub fn collect_garbage(&mut self) {
        let before = self.heap.bytes_allocated();
        tracing::debug!(target: "lox_vm::gc", "gc begin, {before} bytes live");
        for &value in &self.stack {
            self.heap.mark_value(value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        for &upvalue in &self.open_upvalues {
            self.heap.mark_object(upvalue);
        }
        self.heap.mark_table(&self.globals);
        self.heap.mark_object(self.init_string);
        self.heap.trace_references();
        self.heap.remove_white_strings();
        self.heap.sweep();
        let after = self.heap.bytes_allocated();
        tracing::debug!(
            target: "lox_vm::gc",
            "gc end, collected {} bytes ({before} -> {after}), next at {}",
            before - after,
            self.heap.next_gc()
        );
    }

    // --- natives --------------------------------------------------------

    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.intern(name);
        // Both objects ride the stack while the other allocation runs.
        self.stack.push(Value::Obj(name));
        let native = self.allocate(Obj::Native(Native { name, function }));
        self.stack.push(Value::Obj(native));
        let hash = self.heap.str_hash(name);
        self.globals.set(name, hash, Value::Obj(native));
        self.pop();
        self.pop();
    }

    // --- diagnostics ----------------------------------------------------

    /// Print the message and a stack trace, then reset the VM so the
    /// session (e.g. a REPL) can continue with fresh stacks.
    fn runtime_error(&mut self, message: &str) -> InterpretError {
        eprintln!("{message}");
        for frame in self.frames.iter().rev() {
            let function = self.heap.closure(frame.closure).function;
            let function = self.heap.function(function);
            let line = function.chunk.lines[frame.ip.saturating_sub(1)];
            match function.name {
                Some(name) => eprintln!("[line {line}] in {}()", self.heap.as_str(name)),
                None => eprintln!("[line {line}] in script"),
            }
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        InterpretError::Runtime
    }

    fn undefined_variable(&mut self, name: ObjRef) -> InterpretError {
        let message = format!("Undefined variable '{}'.", self.heap.as_str(name));
        self.runtime_error(&message)
    }

    fn undefined_property(&mut self, name: ObjRef) -> InterpretError {
        let message = format!("Undefined property '{}'.", self.heap.as_str(name));
        self.runtime_error(&message)
    }

    fn trace_instruction(&self) {
        let mut dump = String::from("          ");
        for &value in &self.stack {
            dump.push_str(&format!("[ {} ]", self.heap.show_value(value)));
        }
        let (text, _) = disassemble_instruction(&self.heap, self.current_chunk(), self.frame().ip);
        tracing::trace!(target: "lox_vm::trace", "{dump}\n{text}");
    }
}
