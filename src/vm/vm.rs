// src/vm/vm.rs

use std::io::{self, Write};

use tracing::{debug, info, trace};

use crate::config::{VmConfig, UINT8_COUNT};
use crate::error::{InterpretError, InterpretResult, RuntimeError, RuntimeErrorKind};
use crate::memory::{Heap, HeapObject, HeapStats, ObjRef};
use crate::table::Table;
use crate::value::Value;
use crate::vm::class::{BoundMethod, Class, Instance};
use crate::vm::closure::{Closure, Upvalue, UpvalueCell};
use crate::vm::compiler::compile;
use crate::vm::natives::{Native, NativeFn, NATIVES};
use crate::vm::opcode::OpCode;

/// One active call: the closure being run, its instruction pointer and
/// where its window starts on the value stack (slot 0 is the callee or receiver).
#[derive(Debug, Clone, Copy)]
pub struct CallFrame {
    pub closure: ObjRef,
    function: ObjRef,
    ip: usize,
    base: usize,
}

/// How a script run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Finished,
    Exit(i32),
}

// What a callee turned out to be, copied out of the heap before dispatching.
enum Callee {
    Bound { receiver: Value, method: ObjRef },
    Class,
    Closure,
    Native(NativeFn),
    Other,
}

/// The Virtual Machine. Owns every piece of interpreter state, so independent
/// instances can coexist.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    // Head of the open upvalue list, ordered by descending stack slot.
    open_upvalues: Option<ObjRef>,
    init_string: ObjRef,
    config: VmConfig,
    out: Box<dyn Write>,
    err: Box<dyn Write>,
    last_error: Option<RuntimeError>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        Self::with_output(config, io::stdout(), io::stderr())
    }

    /// A VM whose `print` output and error reports go to the given writers.
    pub fn with_output(config: VmConfig, out: impl Write + 'static, err: impl Write + 'static) -> Self {
        let mut heap = Heap::with_config(&config);
        let init_string = heap.intern("init");
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(config.stack_max),
            frames: Vec::with_capacity(config.frames_max),
            globals: Table::new(),
            open_upvalues: None,
            init_string,
            config,
            out: Box::new(out),
            err: Box::new(err),
            last_error: None,
        };
        for native in NATIVES {
            vm.define_native(native.name, native.func);
        }
        info!(natives = NATIVES.len(), "vm initialised");
        vm
    }

    /// Releases every heap object. The VM cannot be used afterwards.
    pub fn teardown(mut self) {
        let stats = self.heap.stats();
        self.reset_stack();
        self.globals = Table::new();
        self.heap.free_all();
        info!(live_objects = stats.live_objects, collections = stats.collections, "vm torn down");
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn stats(&self) -> HeapStats {
        self.heap.stats()
    }

    pub fn last_error(&self) -> Option<&RuntimeError> {
        self.last_error.as_ref()
    }

    /// Current value of a global, without allocating.
    pub fn global(&self, name: &str) -> Option<Value> {
        let obj = self.heap.find_interned(name)?;
        self.globals.get(self.heap.key(obj))
    }

    /// Registers a host function as a global.
    pub fn define_native(&mut self, name: &str, func: NativeFn) {
        let name = self.intern(name);
        self.push(Value::Obj(name));
        let native = self.alloc(HeapObject::Native(Native { func }));
        self.push(Value::Obj(native));
        let key = self.heap.key(name);
        self.globals.set(key, Value::Obj(native));
        self.stack.truncate(self.stack.len() - 2);
    }

    // --- Entry points ---

    /// Compiles and runs `source`, reporting any error to the error writer.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        match self.execute(source) {
            Ok(Completion::Finished) => InterpretResult::Ok,
            Ok(Completion::Exit(0)) => InterpretResult::ExitOk,
            Ok(Completion::Exit(code)) => InterpretResult::Exit(code),
            Err(InterpretError::Compile(err)) => {
                for diagnostic in &err.diagnostics {
                    let _ = writeln!(self.err, "{diagnostic}");
                }
                InterpretResult::CompileError
            }
            Err(InterpretError::Runtime(err)) => {
                let _ = writeln!(self.err, "{}", err.report());
                InterpretResult::RuntimeError
            }
        }
    }

    /// Like [`Vm::interpret`] but hands errors back instead of printing them.
    pub fn execute(&mut self, source: &str) -> Result<Completion, InterpretError> {
        let roots = self.roots();
        let script = compile(source, &mut self.heap, &roots)?;

        // Keep the function reachable while its closure is allocated.
        self.push(Value::Obj(script));
        let closure = self.alloc(HeapObject::Closure(Closure::new(script, 0)));
        self.stack.pop();
        self.push(Value::Obj(closure));

        let outcome = self.call(closure, 0).and_then(|()| self.run());
        match outcome {
            Ok(completion) => {
                if let Completion::Exit(code) = completion {
                    debug!(code, "script requested exit");
                    self.reset_stack();
                }
                Ok(completion)
            }
            Err(err) => {
                debug!(error = %err, line = err.line, "runtime error");
                self.last_error = Some(err.clone());
                self.reset_stack();
                Err(err.into())
            }
        }
    }

    // --- Stack ---

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop_stack(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or_else(|| self.runtime_error(RuntimeErrorKind::StackUnderflow))
    }

    fn peek(&self, distance: usize) -> Result<Value, RuntimeError> {
        self.stack
            .len()
            .checked_sub(distance + 1)
            .map(|index| self.stack[index])
            .ok_or_else(|| self.runtime_error(RuntimeErrorKind::StackUnderflow))
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }

    // --- Allocation and collection ---

    /// Every value reachable without going through the heap.
    fn roots(&self) -> Vec<Value> {
        let mut roots = Vec::with_capacity(self.stack.len() + self.frames.len() + self.globals.capacity() * 2 + 1);
        roots.extend_from_slice(&self.stack);
        roots.extend(self.frames.iter().map(|frame| Value::Obj(frame.closure)));
        for (key, value) in self.globals.iter() {
            roots.push(Value::Obj(key.obj));
            roots.push(value);
        }
        let mut upvalue = self.open_upvalues;
        while let Some(obj) = upvalue {
            roots.push(Value::Obj(obj));
            upvalue = self.heap.upvalue(obj).and_then(|cell| cell.next_open);
        }
        roots.push(Value::Obj(self.init_string));
        roots
    }

    pub fn collect_garbage(&mut self) {
        let roots = self.roots();
        self.heap.collect_full(&roots);
    }

    // Anything the new object points to must already be reachable from the roots.
    fn alloc(&mut self, object: HeapObject) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.register(object)
    }

    fn intern(&mut self, text: &str) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.intern(text)
    }

    fn take_string(&mut self, text: String) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.take_string(text)
    }

    // --- Errors ---

    fn runtime_error(&self, kind: RuntimeErrorKind) -> RuntimeError {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            let line = function.map_or(0, |f| f.chunk.line_at(frame.ip.saturating_sub(1)));
            match function.and_then(|f| f.name) {
                Some(name) => trace.push(format!("[line {line}] in {}()", self.heap.str(name))),
                None => trace.push(format!("[line {line}] in script")),
            }
        }
        let line = self
            .frames
            .last()
            .and_then(|frame| Some(self.heap.function(frame.function)?.chunk.line_at(frame.ip.saturating_sub(1))))
            .unwrap_or(0);
        RuntimeError { kind, line, trace }
    }

    // --- Instruction decoding ---

    fn frame(&self) -> &CallFrame {
        &self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        let index = self.frames.len() - 1;
        &mut self.frames[index]
    }

    fn read_byte(&mut self) -> Result<u8, RuntimeError> {
        let CallFrame { function, ip, .. } = *self.frame();
        let byte = self
            .heap
            .function(function)
            .and_then(|f| f.chunk.code.get(ip).copied())
            .ok_or_else(|| self.runtime_error(RuntimeErrorKind::MalformedBytecode))?;
        self.frame_mut().ip += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<usize, RuntimeError> {
        let hi = self.read_byte()? as usize;
        let lo = self.read_byte()? as usize;
        Ok((hi << 8) | lo)
    }

    fn read_constant(&mut self, index: usize) -> Result<Value, RuntimeError> {
        let function = self.frame().function;
        self.heap
            .function(function)
            .and_then(|f| f.chunk.constants.get(index).copied())
            .ok_or_else(|| self.runtime_error(RuntimeErrorKind::MalformedBytecode))
    }

    fn read_string(&mut self) -> Result<ObjRef, RuntimeError> {
        let index = self.read_byte()? as usize;
        match self.read_constant(index)? {
            Value::Obj(obj) if self.heap.string(obj).is_some() => Ok(obj),
            _ => Err(self.runtime_error(RuntimeErrorKind::MalformedBytecode)),
        }
    }

    fn slot(&self, index: usize) -> Result<Value, RuntimeError> {
        self.stack
            .get(index)
            .copied()
            .ok_or_else(|| self.runtime_error(RuntimeErrorKind::MalformedBytecode))
    }

    // --- The main execution loop ---

    fn run(&mut self) -> Result<Completion, RuntimeError> {
        loop {
            let byte = self.read_byte()?;
            let op = OpCode::try_from(byte).map_err(|b| self.runtime_error(RuntimeErrorKind::UnknownOpcode(b)))?;
            if self.config.trace_execution {
                trace!(depth = self.frames.len(), ip = self.frame().ip - 1, ?op, stack = self.stack.len(), "execute");
            }

            match op {
                OpCode::OpConstant => {
                    let index = self.read_byte()? as usize;
                    let constant = self.read_constant(index)?;
                    self.push(constant);
                }
                OpCode::OpConstantLong => {
                    let hi = self.read_byte()? as usize;
                    let index = (hi << 16) | self.read_u16()?;
                    let constant = self.read_constant(index)?;
                    self.push(constant);
                }
                OpCode::OpNil => self.push(Value::Nil),
                OpCode::OpTrue => self.push(Value::Bool(true)),
                OpCode::OpFalse => self.push(Value::Bool(false)),
                OpCode::OpPop => {
                    self.pop_stack()?;
                }
                OpCode::OpPopN => {
                    let count = self.read_byte()? as usize;
                    let Some(len) = self.stack.len().checked_sub(count) else {
                        return Err(self.runtime_error(RuntimeErrorKind::StackUnderflow));
                    };
                    self.stack.truncate(len);
                }
                OpCode::OpDup => {
                    let top = self.peek(0)?;
                    self.push(top);
                }

                // --- Variables ---
                OpCode::OpGetLocal => {
                    let slot = self.read_byte()? as usize;
                    let value = self.slot(self.frame().base + slot)?;
                    self.push(value);
                }
                OpCode::OpSetLocal => {
                    let slot = self.read_byte()? as usize;
                    let index = self.frame().base + slot;
                    let value = self.peek(0)?;
                    if index >= self.stack.len() {
                        return Err(self.runtime_error(RuntimeErrorKind::MalformedBytecode));
                    }
                    self.stack[index] = value;
                }
                OpCode::OpGetGlobal => {
                    let name = self.read_string()?;
                    match self.globals.get(self.heap.key(name)) {
                        Some(value) => self.push(value),
                        None => return Err(self.undefined_variable(name)),
                    }
                }
                OpCode::OpDefineGlobal => {
                    let name = self.read_string()?;
                    let value = self.peek(0)?;
                    self.globals.set(self.heap.key(name), value);
                    self.pop_stack()?;
                }
                OpCode::OpSetGlobal => {
                    let name = self.read_string()?;
                    let key = self.heap.key(name);
                    let value = self.peek(0)?;
                    // Assignment never creates a global.
                    if self.globals.set(key, value) {
                        self.globals.delete(key);
                        return Err(self.undefined_variable(name));
                    }
                }
                OpCode::OpGetUpvalue => {
                    let index = self.read_byte()? as usize;
                    let cell = self.current_upvalue(index)?;
                    let value = match self.heap.upvalue(cell).map(|u| u.upvalue) {
                        Some(Upvalue::Open(slot)) => self.slot(slot)?,
                        Some(Upvalue::Closed(value)) => value,
                        None => return Err(self.runtime_error(RuntimeErrorKind::MalformedBytecode)),
                    };
                    self.push(value);
                }
                OpCode::OpSetUpvalue => {
                    let index = self.read_byte()? as usize;
                    let cell = self.current_upvalue(index)?;
                    let value = self.peek(0)?;
                    let open_slot = self.heap.upvalue(cell).and_then(UpvalueCell::open_slot);
                    match open_slot {
                        Some(slot) => {
                            if let Some(target) = self.stack.get_mut(slot) {
                                *target = value;
                            }
                        }
                        None => {
                            if let Some(cell) = self.heap.upvalue_mut(cell) {
                                cell.upvalue = Upvalue::Closed(value);
                            }
                        }
                    }
                }
                OpCode::OpGetProperty => {
                    let receiver = self.peek(0)?;
                    let Some(instance) = receiver.as_obj().and_then(|obj| self.heap.instance(obj)) else {
                        return Err(self.runtime_error(RuntimeErrorKind::OnlyInstancesHaveProperties));
                    };
                    let class = instance.class;
                    let name = self.read_string()?;
                    let field = receiver
                        .as_obj()
                        .and_then(|obj| self.heap.instance(obj))
                        .and_then(|instance| instance.fields.get(self.heap.key(name)));
                    match field {
                        Some(value) => {
                            self.pop_stack()?;
                            self.push(value);
                        }
                        None => self.bind_method(class, name)?,
                    }
                }
                OpCode::OpSetProperty => {
                    let target = self.peek(1)?.as_obj().filter(|obj| self.heap.instance(*obj).is_some());
                    let Some(instance) = target else {
                        return Err(self.runtime_error(RuntimeErrorKind::OnlyInstancesHaveFields));
                    };
                    let name = self.read_string()?;
                    let key = self.heap.key(name);
                    let value = self.pop_stack()?;
                    if let Some(instance) = self.heap.instance_mut(instance) {
                        instance.fields.set(key, value);
                    }
                    self.pop_stack()?;
                    self.push(value);
                }
                OpCode::OpGetSuper => {
                    let name = self.read_string()?;
                    let superclass = self.pop_class()?;
                    self.bind_method(superclass, name)?;
                }

                // --- Comparison ---
                OpCode::OpEqual => {
                    let b = self.pop_stack()?;
                    let a = self.pop_stack()?;
                    self.push(Value::Bool(a == b));
                }
                OpCode::OpGreater => self.binary_op(|a, b| Value::Bool(a > b))?,
                OpCode::OpLess => self.binary_op(|a, b| Value::Bool(a < b))?,

                // --- Arithmetic ---
                OpCode::OpAdd => {
                    let (b, a) = (self.peek(0)?, self.peek(1)?);
                    match (a, b) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.stack.truncate(self.stack.len() - 2);
                            self.push(Value::Number(a + b));
                        }
                        _ => match (self.heap.value_as_str(a), self.heap.value_as_str(b)) {
                            (Some(a), Some(b)) => {
                                let joined = format!("{a}{b}");
                                self.stack.truncate(self.stack.len() - 2);
                                let result = self.take_string(joined);
                                self.push(Value::Obj(result));
                            }
                            _ => return Err(self.runtime_error(RuntimeErrorKind::OperandsMustBeNumbersOrStrings)),
                        },
                    }
                }
                OpCode::OpSubtract => self.binary_op(|a, b| Value::Number(a - b))?,
                OpCode::OpMultiply => self.binary_op(|a, b| Value::Number(a * b))?,
                // Division by zero follows IEEE-754.
                OpCode::OpDivide => self.binary_op(|a, b| Value::Number(a / b))?,
                OpCode::OpNot => {
                    let value = self.pop_stack()?;
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::OpNegate => {
                    let Value::Number(n) = self.peek(0)? else {
                        return Err(self.runtime_error(RuntimeErrorKind::OperandMustBeNumber));
                    };
                    self.pop_stack()?;
                    self.push(Value::Number(-n));
                }

                OpCode::OpPrint => {
                    let value = self.pop_stack()?;
                    let _ = writeln!(self.out, "{}", value.display(&self.heap));
                }

                // --- Jumps ---
                OpCode::OpJump => {
                    let offset = self.read_u16()?;
                    self.frame_mut().ip += offset;
                }
                OpCode::OpJumpIfFalse => {
                    let offset = self.read_u16()?;
                    if self.peek(0)?.is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::OpLoop => {
                    let offset = self.read_u16()?;
                    self.frame_mut().ip -= offset;
                }

                // --- Calls and Closures ---
                OpCode::OpCall => {
                    let arg_count = self.read_byte()? as usize;
                    let callee = self.peek(arg_count)?;
                    self.call_value(callee, arg_count)?;
                }
                OpCode::OpInvoke => {
                    let name = self.read_string()?;
                    let arg_count = self.read_byte()? as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::OpSuperInvoke => {
                    let name = self.read_string()?;
                    let arg_count = self.read_byte()? as usize;
                    let superclass = self.pop_class()?;
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                OpCode::OpClosure => {
                    let index = self.read_byte()? as usize;
                    let Some(function) = self.read_constant(index)?.as_obj() else {
                        return Err(self.runtime_error(RuntimeErrorKind::MalformedBytecode));
                    };
                    let upvalue_count = self.heap.function(function).map_or(0, |f| f.upvalue_count);
                    let closure = self.alloc(HeapObject::Closure(Closure::new(function, upvalue_count)));
                    // Rooted on the stack before capturing, which may allocate.
                    self.push(Value::Obj(closure));

                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte()? == 1;
                        let index = self.read_byte()? as usize;
                        let upvalue = if is_local {
                            let slot = self.frame().base + index;
                            self.capture_upvalue(slot)
                        } else {
                            self.current_upvalue(index)?
                        };
                        if let Some(closure) = self.heap.closure_mut(closure) {
                            closure.upvalues.push(upvalue);
                        }
                    }
                }
                OpCode::OpCloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop_stack()?;
                }
                OpCode::OpReturn => {
                    let result = self.pop_stack()?;
                    let Some(frame) = self.frames.pop() else {
                        return Err(self.runtime_error(RuntimeErrorKind::MalformedBytecode));
                    };
                    self.close_upvalues(frame.base);
                    self.stack.truncate(frame.base);
                    if self.frames.is_empty() {
                        return Ok(Completion::Finished);
                    }
                    self.push(result);
                }

                OpCode::OpAssert => {
                    if self.pop_stack()?.is_falsey() {
                        return Err(self.runtime_error(RuntimeErrorKind::AssertionFailed));
                    }
                }
                OpCode::OpExit => match self.pop_stack()? {
                    Value::Number(code) if !code.is_nan() => return Ok(Completion::Exit(exit_status(code))),
                    _ => return Err(self.runtime_error(RuntimeErrorKind::ExitCodeMustBeNumber)),
                },

                // --- Classes ---
                OpCode::OpClass => {
                    let name = self.read_string()?;
                    let class = self.alloc(HeapObject::Class(Class::new(name)));
                    self.push(Value::Obj(class));
                }
                OpCode::OpInherit => {
                    let superclass = self.peek(1)?;
                    let Some(methods) = superclass.as_obj().and_then(|obj| self.heap.class(obj)).map(|c| c.methods.clone()) else {
                        return Err(self.runtime_error(RuntimeErrorKind::SuperclassMustBeClass));
                    };
                    let subclass = self.peek(0)?;
                    if let Some(subclass) = subclass.as_obj().and_then(|obj| self.heap.class_mut(obj)) {
                        Table::add_all(&methods, &mut subclass.methods);
                    }
                    self.pop_stack()?;
                }
                OpCode::OpMethod => {
                    let name = self.read_string()?;
                    let key = self.heap.key(name);
                    let method = self.peek(0)?;
                    let class = self.peek(1)?;
                    if let Some(class) = class.as_obj().and_then(|obj| self.heap.class_mut(obj)) {
                        class.methods.set(key, method);
                    }
                    self.pop_stack()?;
                }
            }
        }
    }

    fn binary_op(&mut self, op: impl Fn(f64, f64) -> Value) -> Result<(), RuntimeError> {
        let (Value::Number(a), Value::Number(b)) = (self.peek(1)?, self.peek(0)?) else {
            return Err(self.runtime_error(RuntimeErrorKind::OperandsMustBeNumbers));
        };
        self.stack.truncate(self.stack.len() - 2);
        self.push(op(a, b));
        Ok(())
    }

    fn undefined_variable(&self, name: ObjRef) -> RuntimeError {
        self.runtime_error(RuntimeErrorKind::UndefinedVariable(self.heap.str(name).to_string()))
    }

    fn undefined_property(&self, name: ObjRef) -> RuntimeError {
        self.runtime_error(RuntimeErrorKind::UndefinedProperty(self.heap.str(name).to_string()))
    }

    fn pop_class(&mut self) -> Result<ObjRef, RuntimeError> {
        match self.pop_stack()? {
            Value::Obj(obj) if self.heap.class(obj).is_some() => Ok(obj),
            _ => Err(self.runtime_error(RuntimeErrorKind::SuperclassMustBeClass)),
        }
    }

    // --- Calls ---

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        let Value::Obj(obj) = callee else {
            return Err(self.runtime_error(RuntimeErrorKind::NotCallable));
        };
        let kind = match self.heap.get(obj) {
            Some(HeapObject::BoundMethod(bound)) => Callee::Bound { receiver: bound.receiver, method: bound.method },
            Some(HeapObject::Class(_)) => Callee::Class,
            Some(HeapObject::Closure(_)) => Callee::Closure,
            Some(HeapObject::Native(native)) => Callee::Native(native.func),
            _ => Callee::Other,
        };
        // The callee (or receiver) sits just below the arguments.
        let callee_slot = self.stack.len() - arg_count - 1;

        match kind {
            Callee::Bound { receiver, method } => {
                self.stack[callee_slot] = receiver;
                self.call(method, arg_count)
            }
            Callee::Class => {
                let instance = self.alloc(HeapObject::Instance(Instance::new(obj)));
                self.stack[callee_slot] = Value::Obj(instance);
                let init_key = self.heap.key(self.init_string);
                match self.heap.class(obj).and_then(|class| class.methods.get(init_key)) {
                    Some(Value::Obj(initializer)) => self.call(initializer, arg_count),
                    _ if arg_count != 0 => Err(self.runtime_error(RuntimeErrorKind::ArityMismatch { expected: 0, got: arg_count })),
                    _ => Ok(()),
                }
            }
            Callee::Closure => self.call(obj, arg_count),
            Callee::Native(func) => {
                let args_start = self.stack.len() - arg_count;
                let result = func(&mut self.heap, &self.stack[args_start..]);
                self.stack.truncate(callee_slot);
                self.push(result);
                Ok(())
            }
            Callee::Other => Err(self.runtime_error(RuntimeErrorKind::NotCallable)),
        }
    }

    fn call(&mut self, closure: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let Some(function) = self.heap.closure(closure).map(|c| c.function) else {
            return Err(self.runtime_error(RuntimeErrorKind::NotCallable));
        };
        let arity = self.heap.function(function).map_or(0, |f| f.arity);
        if arg_count != arity {
            return Err(self.runtime_error(RuntimeErrorKind::ArityMismatch { expected: arity, got: arg_count }));
        }
        let base = self.stack.len() - arg_count - 1;
        if self.frames.len() >= self.config.frames_max || base + UINT8_COUNT > self.config.stack_max {
            return Err(self.runtime_error(RuntimeErrorKind::StackOverflow));
        }
        self.frames.push(CallFrame { closure, function, ip: 0, base });
        Ok(())
    }

    fn invoke(&mut self, name: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count)?;
        let Some(instance) = receiver.as_obj().and_then(|obj| self.heap.instance(obj)) else {
            return Err(self.runtime_error(RuntimeErrorKind::OnlyInstancesHaveMethods));
        };
        let class = instance.class;
        // A field holding a callable shadows a method of the same name.
        if let Some(field) = instance.fields.get(self.heap.key(name)) {
            let callee_slot = self.stack.len() - arg_count - 1;
            self.stack[callee_slot] = field;
            return self.call_value(field, arg_count);
        }
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(&mut self, class: ObjRef, name: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let key = self.heap.key(name);
        match self.heap.class(class).and_then(|c| c.methods.get(key)) {
            Some(Value::Obj(method)) => self.call(method, arg_count),
            _ => Err(self.undefined_property(name)),
        }
    }

    // Replaces the receiver on top of the stack with a bound method.
    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), RuntimeError> {
        let key = self.heap.key(name);
        let Some(Value::Obj(method)) = self.heap.class(class).and_then(|c| c.methods.get(key)) else {
            return Err(self.undefined_property(name));
        };
        let receiver = self.peek(0)?;
        let bound = self.alloc(HeapObject::BoundMethod(BoundMethod { receiver, method }));
        self.pop_stack()?;
        self.push(Value::Obj(bound));
        Ok(())
    }

    // --- Upvalues ---

    fn current_upvalue(&self, index: usize) -> Result<ObjRef, RuntimeError> {
        self.heap
            .closure(self.frame().closure)
            .and_then(|closure| closure.upvalues.get(index).copied())
            .ok_or_else(|| self.runtime_error(RuntimeErrorKind::MalformedBytecode))
    }

    // Reuses the open upvalue for `slot` if there is one, else inserts a new
    // one keeping the list sorted by descending slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut previous = None;
        let mut current = self.open_upvalues;
        while let Some(obj) = current {
            match self.heap.upvalue(obj) {
                Some(cell) if cell.open_slot().is_some_and(|s| s > slot) => {
                    previous = Some(obj);
                    current = cell.next_open;
                }
                _ => break,
            }
        }

        if let Some(obj) = current {
            if self.heap.upvalue(obj).and_then(UpvalueCell::open_slot) == Some(slot) {
                return obj;
            }
        }

        let created = self.alloc(HeapObject::Upvalue(UpvalueCell::open(slot, current)));
        match previous.and_then(|obj| self.heap.upvalue_mut(obj)) {
            Some(cell) => cell.next_open = Some(created),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Closes every open upvalue pointing at `last` or above.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(obj) = self.open_upvalues {
            let Some(cell) = self.heap.upvalue(obj) else { break };
            let Some(slot) = cell.open_slot().filter(|slot| *slot >= last) else { break };
            let next = cell.next_open;
            let value = self.stack.get(slot).copied().unwrap_or(Value::Nil);
            if let Some(cell) = self.heap.upvalue_mut(obj) {
                cell.upvalue = Upvalue::Closed(value);
                cell.next_open = None;
            }
            self.open_upvalues = next;
        }
    }
}

// Only an exact zero is a clean exit. Fractions that truncate to 0 still asked
// for a failure status.
fn exit_status(code: f64) -> i32 {
    match code as i32 {
        0 if code != 0.0 => 1,
        status => status,
    }
}
