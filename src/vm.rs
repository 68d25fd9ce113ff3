//! Stack VM dispatch loop (spec.md §4.4, component C6 — the largest single
//! component by spec.md's size budget).
//!
//! Grounded on `dynac/src/vm.rs`'s `Vm` (fixed operand stack, `binary_op`
//! helper, a debug-trace feature module) generalized from its six literal
//! opcodes to spec.md §4.3's full table, and on
//! `examples/other_examples/423824ee_letung3105-rox__src-vm.rs.rs`'s
//! `VirtualMachine` (`frames`, `globals`, `stack_push`/`stack_pop`,
//! `interpret`/`run` split) for the frame/call-stack shape the teacher's own
//! `vm.rs` never actually wires up. `examples/cartman-fr-vitte/crates/
//! vitte-vm/src/lib.rs`'s `VmOptions` builder and `Host` trait informed the
//! `print_hook`/`module_loader` embedding seam (component C9).

use std::collections::HashMap;

use crate::call_frame::CallFrame;
use crate::chunk::{Chunk, OpCode};
use crate::coroutine::{Coroutine, CoroutineId, CoroutineState};
use crate::error::{CompileError, InterpretResult, LocatedRuntimeError, RuntimeError};
use crate::executor::Executor;
use crate::gc::{GarbageCollector, Roots};
use crate::glue::{ModuleLoader, PrintHook};
use crate::intern::StringInterner;
use crate::object_manager::ObjectManager;
use crate::objects::closure::ObjectClosure;
use crate::objects::function::ObjectFunction;
use crate::objects::instance::ObjectInstance;
use crate::objects::native::NativeFn;
use crate::objects::promise::{ObjectPromise, PromiseState};
use crate::objects::struct_type::ObjectStructType;
use crate::objects::upvalue::ObjectUpvalue;
use crate::table::Table;
use crate::value::{format_value, Value};

/// Default prototypes installed at startup (spec.md §4.2: "`Array` has
/// `Object` as its prototype; others similarly").
pub struct Prototypes {
    pub object: *mut ObjectInstance,
    pub array: *mut ObjectInstance,
    pub string: *mut ObjectInstance,
    pub function: *mut ObjectInstance,
    pub number: *mut ObjectInstance,
}

/// What a single `run` invocation produced, before the executor/tick layer
/// decides what to do with it.
enum RunSignal {
    Completed(Value),
    Suspended(*mut ObjectPromise),
    Yielded(Value),
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table<Value>,
    struct_types: Table<*mut ObjectStructType>,
    interner: StringInterner,
    objects: ObjectManager,
    gc: GarbageCollector,
    /// Sorted by descending stack index (spec.md §4.4's "Open-upvalue
    /// invariant").
    open_upvalues: Vec<*mut ObjectUpvalue>,
    executor: Executor,
    /// Promise created for a spawned async call, so its coroutine's
    /// completion can settle it (spec.md §4.7 doesn't name this table
    /// directly; it falls out of "calling an async function ... returns a
    /// promise" once coroutines are backed by the executor in this module).
    coroutine_promises: HashMap<CoroutineId, *mut ObjectPromise>,
    print_hook: Option<PrintHook>,
    module_loader: Option<Box<dyn ModuleLoader>>,
    pub prototypes: Prototypes,
}

impl Vm {
    pub fn new() -> Self {
        let mut objects = ObjectManager::new();
        let object_proto = objects.alloc_object(None);
        let array_proto = objects.alloc_object(Some(object_proto));
        let string_proto = objects.alloc_object(Some(object_proto));
        let function_proto = objects.alloc_object(Some(object_proto));
        let number_proto = objects.alloc_object(Some(object_proto));

        Vm {
            stack: Vec::with_capacity(crate::constants::INITIAL_STACK_CAPACITY),
            frames: Vec::new(),
            globals: Table::new(),
            struct_types: Table::new(),
            interner: StringInterner::new(),
            objects,
            gc: GarbageCollector::new(),
            open_upvalues: Vec::new(),
            executor: Executor::new(),
            coroutine_promises: HashMap::new(),
            print_hook: None,
            module_loader: None,
            prototypes: Prototypes {
                object: object_proto,
                array: array_proto,
                string: string_proto,
                function: function_proto,
                number: number_proto,
            },
        }
    }

    // ---- embedding interface (spec.md §6) ----------------------------

    pub fn set_print_hook(&mut self, hook: PrintHook) {
        self.print_hook = Some(hook);
    }

    pub fn set_module_loader(&mut self, loader: Box<dyn ModuleLoader>) {
        self.module_loader = Some(loader);
    }

    pub fn define_global(&mut self, name: &str, value: Value) {
        let key = self.interner.intern(name);
        self.globals.insert(key, value);
    }

    pub fn intern(&mut self, text: &str) -> crate::intern::StringRef {
        self.interner.intern(text)
    }

    pub fn define_native(&mut self, name: &str, arity: u8, function: NativeFn) {
        let native = self
            .objects
            .alloc_native_function(name.to_string(), arity, function);
        self.define_global(name, Value::Native(native));
    }

    pub fn gc_stats(&self) -> crate::gc::GcStats {
        self.gc.stats()
    }

    pub fn object_count(&self) -> usize {
        self.objects.object_count()
    }

    fn print(&mut self, text: &str) {
        match &mut self.print_hook {
            Some(hook) => hook(text),
            None => println!("{text}"),
        }
    }

    /// `vm_interpret` (spec.md §6): runs `chunk` as the program's implicit
    /// main coroutine, driving the executor until it reaches a terminal
    /// state. This folds "plain top-level execution" and "coroutine
    /// execution" into one code path, matching spec.md §4.7's
    /// `run_until_complete(main)` entry point literally rather than
    /// treating top-level execution as a separate, simpler case.
    pub fn interpret(&mut self, chunk: Chunk) -> InterpretResult {
        let mut function = ObjectFunction::new(0, String::new());
        function.chunk = Box::new(chunk);
        let function_ptr = self.objects.alloc_function(function);
        let closure_ptr = self.objects.alloc_closure(function_ptr, 0);
        let main = Coroutine::new(closure_ptr, Vec::new());
        let main_id = self.executor.spawn(main);
        self.run_until_complete(main_id)
    }

    /// `vm_call_value` (spec.md §6): invoke a callable value synchronously
    /// from host code (used by native higher-order functions such as
    /// `map`/`filter`/`reduce`). May itself run while `run` is already
    /// executing further up the native call stack (a native calling back
    /// into a user closure); `floor` records the frame depth to stop at so
    /// this nested call never consumes frames that belong to the caller.
    pub fn call_value(&mut self, callee: Value, args: &[Value]) -> Result<Value, RuntimeError> {
        let floor = self.frames.len();
        self.stack.push(callee);
        self.stack.extend_from_slice(args);
        self.invoke(args.len() as u8)?;
        if self.frames.len() == floor {
            // `invoke` ran a native function (or spawned an async call)
            // inline; its result/promise is already the sole value left on
            // the stack above this call's starting height.
            return Ok(self.stack.pop().unwrap_or(Value::Nil));
        }
        match self.run(floor)? {
            RunSignal::Completed(value) => Ok(value),
            RunSignal::Suspended(_) | RunSignal::Yielded(_) => Err(RuntimeError::CoroutineFailed(
                "a host-initiated call may not suspend".to_string(),
            )),
        }
    }

    fn run_until_complete(&mut self, id: CoroutineId) -> InterpretResult {
        loop {
            if self.executor.get(id).is_terminal() {
                break;
            }
            if !self.tick() {
                // No ready coroutine exists but `id` hasn't completed: every
                // remaining coroutine is suspended on a promise nobody will
                // ever settle.
                return InterpretResult::RuntimeError(LocatedRuntimeError {
                    error: RuntimeError::CoroutineFailed(
                        "deadlock: no ready coroutines remain".to_string(),
                    ),
                    line: 0,
                });
            }
        }
        match &self.executor.get(id).result {
            Some(Ok(_)) => InterpretResult::Ok,
            Some(Err(err)) => InterpretResult::RuntimeError(err.clone()),
            None => InterpretResult::CompileError(CompileError(
                "coroutine reached a terminal state without a result".to_string(),
            )),
        }
    }

    /// Dequeues and resumes one coroutine (spec.md §4.7's `tick()`). Returns
    /// `false` if the ready queue was empty.
    fn tick(&mut self) -> bool {
        let Some(id) = self.executor.pop_ready() else {
            return false;
        };

        {
            let coroutine = self.executor.get_mut(id);
            coroutine.state = CoroutineState::Running;
            std::mem::swap(&mut self.stack, &mut coroutine.stack);
            std::mem::swap(&mut self.frames, &mut coroutine.frames);
        }

        let outcome = self.run(0);
        // Attach the erroring frame's source line (spec.md §7) while
        // `self.frames` still reflects this coroutine's state, before the
        // swap-back below restores whichever coroutine ran previously.
        let outcome = outcome.map_err(|error| LocatedRuntimeError {
            line: self.current_line(),
            error,
        });

        {
            let coroutine = self.executor.get_mut(id);
            std::mem::swap(&mut self.stack, &mut coroutine.stack);
            std::mem::swap(&mut self.frames, &mut coroutine.frames);
        }

        match outcome {
            Ok(RunSignal::Completed(value)) => {
                self.executor.get_mut(id).state = CoroutineState::Completed;
                self.executor.get_mut(id).result = Some(Ok(value));
                self.settle_if_async(id, Ok(value));
            }
            Ok(RunSignal::Suspended(promise)) => {
                self.executor.get_mut(id).state = CoroutineState::Suspended;
                unsafe { (*promise).add_waiter(id) };
            }
            Ok(RunSignal::Yielded(_)) => {
                // Cooperative yield: round-robin back onto the ready queue.
                self.executor.get_mut(id).state = CoroutineState::Suspended;
                self.executor.reschedule(id);
            }
            Err(err) => {
                self.executor.get_mut(id).state = CoroutineState::Failed;
                self.executor.get_mut(id).result = Some(Err(err.clone()));
                self.settle_if_async(id, Err(err));
            }
        }
        true
    }

    fn settle_if_async(&mut self, id: CoroutineId, result: Result<Value, LocatedRuntimeError>) {
        if let Some(promise) = self.coroutine_promises.remove(&id) {
            let (state, value) = match result {
                Ok(v) => (PromiseState::Resolved, v),
                Err(e) => {
                    let handle = self.interner.intern(&e.to_string());
                    (PromiseState::Failed, Value::Str(handle))
                }
            };
            let waiters = unsafe { (*promise).settle(state, value) };
            for waiter in waiters {
                self.executor.reschedule(waiter);
            }
        }
    }

    // ---- the dispatch loop --------------------------------------------

    fn current_function(&self) -> *mut ObjectFunction {
        let frame = self.frames.last().expect("run called with no active frame");
        unsafe { (*frame.closure).function }
    }

    fn read_byte(&mut self) -> u8 {
        let function = self.current_function();
        let frame = self.frames.last_mut().unwrap();
        let byte = unsafe { (*function).chunk.code[frame.ip] };
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte();
        let function = self.current_function();
        unsafe { (*function).chunk.constants[idx as usize] }
    }

    fn read_constant_str(&mut self) -> crate::intern::StringRef {
        match self.read_constant() {
            Value::Str(handle) => handle,
            other => crate::error::bug(&format!("expected a string constant, found {other:?}")),
        }
    }

    fn current_line(&self) -> u32 {
        let function = self.current_function();
        let frame = self.frames.last().unwrap();
        unsafe { (*function).chunk.lines.get(frame.ip.saturating_sub(1)).copied() }.unwrap_or(0)
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack
            .pop()
            .unwrap_or_else(|| crate::error::bug("operand stack underflow"))
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    /// The interpreter loop. Runs until the frame stack depth drops back to
    /// `floor` (`Completed` — this covers both "the whole coroutine
    /// returned", `floor == 0`, and "a nested `call_value` callee
    /// returned", `floor` equal to the depth when that call started), an
    /// `AWAIT` suspends on a pending promise (`Suspended`), a `YIELD`
    /// cooperatively pauses (`Yielded`), or a `RuntimeError` propagates.
    fn run(&mut self, floor: usize) -> Result<RunSignal, RuntimeError> {
        loop {
            #[cfg(feature = "debug_trace_execution")]
            self.trace_stack();

            let opcode = OpCode::from_byte(self.read_byte())
                .ok_or_else(|| RuntimeError::BadCast("invalid opcode".to_string()))?;

            match opcode {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slots_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slots_base;
                    let value = self.copy_for_binding(self.peek(0));
                    self.stack[base + slot] = value;
                    self.collect_if_needed();
                }
                OpCode::GetGlobal => {
                    let name = self.read_constant_str();
                    let value = self
                        .globals
                        .find(name)
                        .copied()
                        .ok_or_else(|| RuntimeError::UndefinedGlobal(resolve_name(name)))?;
                    self.push(value);
                }
                OpCode::SetGlobal => {
                    let name = self.read_constant_str();
                    if !self.globals.contains_key(name) {
                        return Err(RuntimeError::UndefinedGlobal(resolve_name(name)));
                    }
                    let value = self.copy_for_binding(self.peek(0));
                    self.globals.insert(name, value);
                    self.collect_if_needed();
                }
                OpCode::DefineGlobal => {
                    let name = self.read_constant_str();
                    let value = self.pop();
                    let value = self.copy_for_binding(value);
                    self.globals.insert(name, value);
                    self.collect_if_needed();
                }
                OpCode::GetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let closure = self.frames.last().unwrap().closure;
                    let upvalue = unsafe { (*closure).upvalues[idx] };
                    self.push(self.read_upvalue(upvalue));
                }
                OpCode::SetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let closure = self.frames.last().unwrap().closure;
                    let upvalue = unsafe { (*closure).upvalues[idx] };
                    let value = self.peek(0);
                    self.write_upvalue(upvalue, value);
                }
                OpCode::GetProperty => {
                    let name = self.read_constant_str();
                    let receiver = self.pop();
                    let value = self.get_property(receiver, name)?;
                    self.push(value);
                }
                OpCode::SetProperty => {
                    let name = self.read_constant_str();
                    let value = self.pop();
                    let receiver = self.pop();
                    self.set_property(receiver, name, value)?;
                    self.push(value);
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Less => self.numeric_compare(|a, b| a < b)?,
                OpCode::Greater => self.numeric_compare(|a, b| a > b)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.numeric_binary(|a, b| a - b)?,
                OpCode::Multiply => self.numeric_binary(|a, b| a * b)?,
                OpCode::Divide => self.numeric_binary(|a, b| a / b)?,
                OpCode::Mod => self.modulo()?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let value = self.pop();
                    match value {
                        Value::Integer(i) => self.push(Value::Integer(-i)),
                        Value::Number(n) => self.push(Value::Number(-n)),
                        other => {
                            return Err(RuntimeError::TypeMismatch(format!(
                                "cannot negate {}",
                                other.type_name()
                            )))
                        }
                    }
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
                    self.invoke(argc)?;
                }
                OpCode::Closure => {
                    self.build_closure();
                    self.collect_if_needed();
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues_from(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues_from(frame.slots_base);
                    self.stack.truncate(frame.slots_base);
                    if self.frames.len() == floor {
                        return Ok(RunSignal::Completed(result));
                    }
                    self.push(result);
                }
                OpCode::Array => {
                    let count = self.read_byte() as usize;
                    let values = self.pop_n(count);
                    let array = self.objects.alloc_array(Some(self.prototypes.array));
                    for value in values {
                        unsafe { (*array).push(value) };
                    }
                    self.push(Value::Object(array));
                    self.collect_if_needed();
                }
                OpCode::Object => {
                    let count = self.read_byte() as usize;
                    let object = self.objects.alloc_object(Some(self.prototypes.object));
                    let pairs = self.pop_n(count * 2);
                    for pair in pairs.chunks_exact(2) {
                        let key = match pair[0] {
                            Value::Str(handle) => handle,
                            other => {
                                return Err(RuntimeError::TypeMismatch(format!(
                                    "object literal key must be a string, found {}",
                                    other.type_name()
                                )))
                            }
                        };
                        unsafe { (*object).set(key, pair[1]) };
                    }
                    self.push(Value::Object(object));
                    self.collect_if_needed();
                }
                OpCode::StructType => {
                    self.define_struct_type()?;
                    self.collect_if_needed();
                }
                OpCode::StructInit => {
                    self.init_struct()?;
                    self.collect_if_needed();
                }
                OpCode::Await => {
                    // Peek, not pop: a pending promise must still be on top
                    // of the stack when this coroutine resumes, because the
                    // resume point rewinds `ip` back onto this same `AWAIT`
                    // (see below) rather than threading the eventual result
                    // through some side channel.
                    let awaited = self.peek(0);
                    match awaited {
                        Value::Promise(promise) => {
                            let (state, result) = unsafe { ((*promise).state, (*promise).result) };
                            match state {
                                PromiseState::Pending => {
                                    self.frames.last_mut().unwrap().ip -= 1;
                                    return Ok(RunSignal::Suspended(promise));
                                }
                                PromiseState::Resolved => {
                                    self.pop();
                                    self.push(result.unwrap_or(Value::Nil));
                                }
                                PromiseState::Failed => {
                                    self.pop();
                                    let message = result
                                        .and_then(|v| v.as_str().map(|s| s.to_string()))
                                        .unwrap_or_default();
                                    return Err(RuntimeError::CoroutineFailed(message));
                                }
                            }
                        }
                        other => {
                            // Awaiting a non-promise resolves immediately to
                            // the value itself (common in dynamic languages'
                            // `await` on already-realized values).
                            self.pop();
                            self.push(other);
                        }
                    }
                }
                OpCode::Yield => {
                    let value = self.pop();
                    return Ok(RunSignal::Yielded(value));
                }
                OpCode::Print => {
                    let value = self.pop();
                    let text = format_value(&value);
                    self.print(&text);
                }
            }
        }
    }

    fn pop_n(&mut self, count: usize) -> Vec<Value> {
        let at = self.stack.len() - count;
        self.stack.split_off(at)
    }

    fn numeric_binary(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        self.require_numeric_pair(a, b)?;
        if let (Value::Integer(x), Value::Integer(y)) = (a, b) {
            let result = op(x as f64, y as f64);
            if result.fract() == 0.0 && result.is_finite() {
                self.push(Value::Integer(result as i64));
                return Ok(());
            }
        }
        self.push(Value::Number(op(a.as_f64(), b.as_f64())));
        Ok(())
    }

    fn numeric_compare(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        self.require_numeric_pair(a, b)?;
        self.push(Value::Bool(op(a.as_f64(), b.as_f64())));
        Ok(())
    }

    fn modulo(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        self.require_numeric_pair(a, b)?;
        // Mirrors `numeric_binary`'s integer-preservation path (SPEC_FULL.md
        // §3): `Integer % Integer` stays `Integer` instead of promoting.
        if let (Value::Integer(x), Value::Integer(y)) = (a, b) {
            if y == 0 {
                return Err(RuntimeError::DivisionByZero);
            }
            self.push(Value::Integer(x % y));
            return Ok(());
        }
        let divisor = b.as_f64();
        if divisor == 0.0 {
            return Err(RuntimeError::DivisionByZero);
        }
        // IEEE-754 `fmod` semantics (spec.md §4.4): Rust's `%` on `f64` is
        // exactly C's `fmod`.
        self.push(Value::Number(a.as_f64() % divisor));
        Ok(())
    }

    fn require_numeric_pair(&self, a: Value, b: Value) -> Result<(), RuntimeError> {
        if a.is_number() && b.is_number() {
            Ok(())
        } else {
            Err(RuntimeError::TypeMismatch(format!(
                "expected two numbers, found {} and {}",
                a.type_name(),
                b.type_name()
            )))
        }
    }

    /// `ADD` (spec.md §4.4): numeric addition, or string concatenation if
    /// either operand is a string.
    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        if a.is_string() || b.is_string() {
            let mut text = format_value(&a);
            text.push_str(&format_value(&b));
            let handle = self.interner.intern(&text);
            self.push(Value::Str(handle));
            return Ok(());
        }
        self.require_numeric_pair(a, b)?;
        if let (Value::Integer(x), Value::Integer(y)) = (a, b) {
            self.push(Value::Integer(x.wrapping_add(y)));
            return Ok(());
        }
        self.push(Value::Number(a.as_f64() + b.as_f64()));
        Ok(())
    }

    fn get_property(&mut self, receiver: Value, name: crate::intern::StringRef) -> Result<Value, RuntimeError> {
        match receiver {
            Value::Object(ptr) => unsafe { (*ptr).get(name) }?.ok_or_else(|| {
                RuntimeError::UndefinedProperty(resolve_name(name))
            }),
            Value::Struct(ptr) => {
                let struct_type = unsafe { (*ptr).struct_type };
                if let Some(slot) = unsafe { (*struct_type).field_slot(name) } {
                    Ok(unsafe { (*ptr).fields[slot] })
                } else {
                    let methods = unsafe { (*struct_type).methods };
                    if methods.is_null() {
                        return Err(RuntimeError::StructFieldMissing {
                            struct_name: unsafe { (*struct_type).name.clone() },
                            field: resolve_name(name),
                        });
                    }
                    unsafe { (*methods).get(name) }?.ok_or_else(|| RuntimeError::StructFieldMissing {
                        struct_name: unsafe { (*struct_type).name.clone() },
                        field: resolve_name(name),
                    })
                }
            }
            other => Err(RuntimeError::TypeMismatch(format!(
                "cannot read property of {}",
                other.type_name()
            ))),
        }
    }

    fn set_property(&mut self, receiver: Value, name: crate::intern::StringRef, value: Value) -> Result<(), RuntimeError> {
        match receiver {
            Value::Object(ptr) => {
                unsafe { (*ptr).set(name, value) };
                Ok(())
            }
            Value::Struct(ptr) => {
                let struct_type = unsafe { (*ptr).struct_type };
                let slot = unsafe { (*struct_type).field_slot(name) }.ok_or_else(|| {
                    RuntimeError::StructFieldMissing {
                        struct_name: unsafe { (*struct_type).name.clone() },
                        field: resolve_name(name),
                    }
                })?;
                unsafe { (*ptr).fields[slot] = value };
                Ok(())
            }
            other => Err(RuntimeError::TypeMismatch(format!(
                "cannot set property on {}",
                other.type_name()
            ))),
        }
    }

    // ---- calls ----------------------------------------------------------

    /// `CALL argc` (spec.md §4.4): a closure call pushes a new frame (the
    /// caller's loop keeps running and will observe the callee's `RETURN`);
    /// a native call runs to completion inline; an async closure call spawns
    /// a coroutine and pushes a pending `Promise` instead of either.
    fn invoke(&mut self, argc: u8) -> Result<(), RuntimeError> {
        let callee = self.peek(argc as usize);
        match callee {
            Value::Closure(closure) => {
                let function = unsafe { (*closure).function };
                let arity = unsafe { (*function).arity };
                if arity != argc {
                    return Err(RuntimeError::ArityMismatch {
                        expected: arity as usize,
                        got: argc as usize,
                    });
                }
                if unsafe { (*function).is_async } {
                    self.spawn_async_call(closure, argc);
                    self.collect_if_needed();
                    return Ok(());
                }
                if self.frames.len() >= crate::constants::MAX_FRAME_DEPTH {
                    return Err(RuntimeError::StackOverflow);
                }
                let slots_base = self.stack.len() - argc as usize - 1;
                // spec.md §3/§4.2: "parameter passing produce[s] a deep
                // copy" for struct arguments, so the callee's locals never
                // alias the caller's.
                for slot in slots_base + 1..self.stack.len() {
                    self.stack[slot] = self.copy_for_binding(self.stack[slot]);
                }
                self.collect_if_needed();
                self.frames.push(CallFrame::new(closure, slots_base));
                Ok(())
            }
            Value::Native(native) => {
                let args_start = self.stack.len() - argc as usize;
                let args: Vec<Value> = self.stack[args_start..].to_vec();
                let result = unsafe { (*native).call(self, &args)? };
                self.stack.truncate(args_start - 1);
                self.push(result);
                Ok(())
            }
            other => Err(RuntimeError::Uncallable(other.type_name().to_string())),
        }
    }

    /// Spawns `closure`'s call as a coroutine and replaces the in-place
    /// callee+argv span with a freshly allocated, pending `Promise`
    /// (spec.md §4.7's "executing a closure" coroutine model, extended so
    /// calling an async function is itself the spawn point).
    fn spawn_async_call(&mut self, closure: *mut ObjectClosure, argc: u8) {
        let args_start = self.stack.len() - argc as usize;
        let args: Vec<Value> = self.stack[args_start..].to_vec();
        self.stack.truncate(args_start - 1);
        let coroutine = Coroutine::new(closure, args);
        let id = self.executor.spawn(coroutine);
        let promise = self.objects.alloc_promise();
        self.coroutine_promises.insert(id, promise);
        self.push(Value::Promise(promise));
    }

    // ---- upvalues ---------------------------------------------------

    fn read_upvalue(&self, upvalue: *mut ObjectUpvalue) -> Value {
        match unsafe { (*upvalue).state } {
            crate::objects::upvalue::UpvalueState::Open(index) => self.stack[index],
            crate::objects::upvalue::UpvalueState::Closed(value) => value,
        }
    }

    fn write_upvalue(&mut self, upvalue: *mut ObjectUpvalue, value: Value) {
        match unsafe { (*upvalue).state } {
            crate::objects::upvalue::UpvalueState::Open(index) => self.stack[index] = value,
            crate::objects::upvalue::UpvalueState::Closed(_) => unsafe {
                (*upvalue).state = crate::objects::upvalue::UpvalueState::Closed(value);
            },
        }
    }

    /// Finds an existing open upvalue for `stack_index`, or splices a new
    /// one into the descending-sorted list (spec.md §4.4's "Open-upvalue
    /// invariant").
    fn find_or_create_upvalue(&mut self, stack_index: usize) -> *mut ObjectUpvalue {
        let mut insert_at = self.open_upvalues.len();
        for (i, &upvalue) in self.open_upvalues.iter().enumerate() {
            match unsafe { (*upvalue).stack_index() } {
                Some(idx) if idx == stack_index => return upvalue,
                Some(idx) if idx < stack_index => {
                    insert_at = i;
                    break;
                }
                _ => {}
            }
        }
        let created = self.objects.alloc_upvalue(stack_index);
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Closes (and removes from the open list) every upvalue pointing at a
    /// stack slot `>= from`, copying the live value in before the frame that
    /// owns it goes away (spec.md §4.4's `RETURN` and `CLOSE_UPVALUE`).
    fn close_upvalues_from(&mut self, from: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let upvalue = self.open_upvalues[i];
            let Some(index) = (unsafe { (*upvalue).stack_index() }) else {
                i += 1;
                continue;
            };
            if index >= from {
                let value = self.stack[index];
                unsafe { (*upvalue).close(value) };
                self.open_upvalues.remove(i);
            } else {
                i += 1;
            }
        }
    }

    fn build_closure(&mut self) {
        let constant = self.read_constant();
        let function = match constant {
            Value::Function(ptr) => ptr,
            other => crate::error::bug(&format!("CLOSURE operand must be a function, found {other:?}")),
        };
        let upvalue_count = unsafe { (*function).upvalue_count };
        let closure = self.objects.alloc_closure(function, upvalue_count);
        let enclosing = self.frames.last().map(|f| f.closure);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte();
            let index = self.read_byte() as usize;
            let upvalue = if is_local != 0 {
                let base = self.frames.last().unwrap().slots_base;
                self.find_or_create_upvalue(base + index)
            } else {
                unsafe { (*enclosing.expect("CLOSURE outside a frame")).upvalues[index] }
            };
            unsafe { (*closure).upvalues.push(upvalue) };
        }
        self.push(Value::Closure(closure));
    }

    // ---- struct types -------------------------------------------------

    fn define_struct_type(&mut self) -> Result<(), RuntimeError> {
        let name_handle = self.read_constant_str();
        let name = resolve_name(name_handle);
        if self.struct_types.contains_key(name_handle) {
            return Err(RuntimeError::AlreadyDeclared(name));
        }
        let field_count = self.read_byte() as usize;
        let mut field_names = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            field_names.push(self.read_constant_str());
        }
        let methods = self.objects.alloc_object(Some(self.prototypes.object));
        let struct_type = self.objects.alloc_struct_type(name, field_names, methods);
        self.struct_types.insert(name_handle, struct_type);
        Ok(())
    }

    fn init_struct(&mut self) -> Result<(), RuntimeError> {
        let name_handle = self.read_constant_str();
        let struct_type = *self
            .struct_types
            .find(name_handle)
            .ok_or_else(|| RuntimeError::UndefinedGlobal(resolve_name(name_handle)))?;
        let field_count = unsafe { (*struct_type).field_count() };
        let fields = self.pop_n(field_count);
        let instance = self.objects.alloc_struct_instance(struct_type, fields);
        self.push(Value::Struct(instance));
        Ok(())
    }

    /// Gives a value the copy semantics spec.md §3/§4.2 requires of
    /// "assignment and parameter passing": a `Struct` is deep-copied
    /// (nested `Struct` fields recurse, `Object` fields stay shared by
    /// reference, `Str` fields need no work since interning already gives
    /// them stable identity); every other value is `Copy` and passes
    /// through unchanged.
    fn copy_for_binding(&mut self, value: Value) -> Value {
        match value {
            Value::Struct(ptr) => {
                let copied = unsafe {
                    (*ptr).deep_copy(&mut |ty, fields| self.objects.alloc_struct_instance(ty, fields))
                };
                Value::Struct(copied)
            }
            other => other,
        }
    }

    // ---- garbage collection -------------------------------------------

    /// Runs a collection if the allocation threshold has been crossed
    /// (spec.md §4.6's triggering policy). Exposed as `collect_if_needed`
    /// for call sites right after an allocation, and as `force_collect` for
    /// tests and embedder memory-pressure hooks.
    pub fn collect_if_needed(&mut self) {
        if self.gc.should_collect(&self.objects) {
            self.force_collect();
        }
    }

    pub fn force_collect(&mut self) {
        let frame_closures: Vec<*mut ObjectClosure> =
            self.frames.iter().map(|f| f.closure).collect();
        let extra: Vec<Value> = self
            .executor
            .coroutines()
            .flat_map(|c| c.stack.iter().copied())
            .collect();
        let prototypes = [
            self.prototypes.object,
            self.prototypes.array,
            self.prototypes.string,
            self.prototypes.function,
            self.prototypes.number,
        ];
        let roots = Roots {
            stack: &self.stack,
            frame_closures: &frame_closures,
            globals: &self.globals,
            struct_types: &self.struct_types,
            open_upvalues: &self.open_upvalues,
            prototypes: &prototypes,
            extra: &extra,
        };
        unsafe {
            self.gc.collect(&mut self.objects, &mut self.interner, roots);
        }
    }

    #[cfg(feature = "debug_trace_execution")]
    fn trace_stack(&self) {
        let mut line = String::from("          ");
        for value in &self.stack {
            line.push_str(&format!("[ {} ]", format_value(value)));
        }
        log::trace!("{line}");
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_name(handle: crate::intern::StringRef) -> String {
    crate::intern::resolve(handle).as_str().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkBuilder;

    fn run_chunk(chunk: Chunk) -> (Vm, InterpretResult) {
        let mut vm = Vm::new();
        let result = vm.interpret(chunk);
        (vm, result)
    }

    #[test]
    fn arithmetic_adds_two_numbers() {
        let mut builder = ChunkBuilder::new();
        builder
            .emit_constant(Value::Number(1.0), 1)
            .emit_constant(Value::Number(2.0), 1)
            .emit_op(OpCode::Add, 1)
            .emit_op(OpCode::Pop, 1)
            .emit_op(OpCode::Nil, 1)
            .emit_op(OpCode::Return, 1);
        let (_, result) = run_chunk(builder.finish());
        assert_eq!(result, InterpretResult::Ok);
    }

    #[test]
    fn add_concatenates_when_either_operand_is_a_string() {
        let mut vm = Vm::new();
        let a = vm.intern("foo");
        let b = vm.intern("bar");
        let mut builder = ChunkBuilder::new();
        builder
            .emit_constant(Value::Str(a), 1)
            .emit_constant(Value::Str(b), 1)
            .emit_op(OpCode::Add, 1)
            .emit_op(OpCode::Return, 1);
        let result = vm.interpret(builder.finish());
        assert_eq!(result, InterpretResult::Ok);
    }

    #[test]
    fn division_by_zero_is_not_an_error() {
        let mut builder = ChunkBuilder::new();
        builder
            .emit_constant(Value::Number(1.0), 1)
            .emit_constant(Value::Number(0.0), 1)
            .emit_op(OpCode::Divide, 1)
            .emit_op(OpCode::Return, 1);
        let (_, result) = run_chunk(builder.finish());
        assert_eq!(result, InterpretResult::Ok);
    }

    #[test]
    fn mod_by_zero_errors() {
        let mut builder = ChunkBuilder::new();
        builder
            .emit_constant(Value::Number(1.0), 1)
            .emit_constant(Value::Number(0.0), 1)
            .emit_op(OpCode::Mod, 1)
            .emit_op(OpCode::Return, 1);
        let (_, result) = run_chunk(builder.finish());
        assert!(matches!(
            result,
            InterpretResult::RuntimeError(LocatedRuntimeError {
                error: RuntimeError::DivisionByZero,
                ..
            })
        ));
    }

    #[test]
    fn mod_of_two_integers_stays_integer() {
        let mut vm = Vm::new();
        let mut builder = ChunkBuilder::new();
        builder
            .emit_constant(Value::Integer(7), 1)
            .emit_constant(Value::Integer(3), 1)
            .emit_op(OpCode::Mod, 1)
            .emit_op(OpCode::Return, 1);
        assert!(matches!(
            run_to_value(&mut vm, builder.finish()),
            Value::Integer(1)
        ));
    }

    #[test]
    fn undefined_global_read_errors() {
        let mut vm = Vm::new();
        let name = vm.intern("missing");
        let mut builder = ChunkBuilder::new();
        builder.emit_op(OpCode::GetGlobal, 1);
        let idx = builder.constant(Value::Str(name));
        // emit_op already wrote the opcode byte; now append the operand.
        builder.emit_byte(idx, 1).emit_op(OpCode::Return, 1);
        let result = vm.interpret(builder.finish());
        assert!(matches!(
            result,
            InterpretResult::RuntimeError(LocatedRuntimeError {
                error: RuntimeError::UndefinedGlobal(_),
                ..
            })
        ));
    }

    #[test]
    fn struct_field_access_round_trips() {
        let mut vm = Vm::new();
        let struct_name = vm.intern("Point");
        let field_x = vm.intern("x");
        let field_y = vm.intern("y");

        let mut builder = ChunkBuilder::new();
        builder.emit_op(OpCode::StructType, 1);
        let name_idx = builder.constant(Value::Str(struct_name));
        builder.emit_byte(name_idx, 1);
        builder.emit_byte(2, 1);
        let x_idx = builder.constant(Value::Str(field_x));
        builder.emit_byte(x_idx, 1);
        let y_idx = builder.constant(Value::Str(field_y));
        builder.emit_byte(y_idx, 1);

        builder
            .emit_constant(Value::Integer(3), 1)
            .emit_constant(Value::Integer(4), 1);
        builder.emit_op(OpCode::StructInit, 1);
        let init_name_idx = builder.constant(Value::Str(struct_name));
        builder.emit_byte(init_name_idx, 1);

        builder.emit_op(OpCode::GetProperty, 1);
        let prop_idx = builder.constant(Value::Str(field_y));
        builder.emit_byte(prop_idx, 1);
        builder.emit_op(OpCode::Return, 1);

        let result = vm.interpret(builder.finish());
        assert_eq!(result, InterpretResult::Ok);
    }

    /// Spawns `chunk` as a fresh top-level coroutine the same way
    /// `Vm::interpret` does, runs it to completion, and returns whatever
    /// value it produced — used by the scenarios below that need the
    /// result `interpret`'s `InterpretResult` doesn't carry.
    fn run_to_value(vm: &mut Vm, chunk: Chunk) -> Value {
        let mut function = ObjectFunction::new(0, String::new());
        function.chunk = Box::new(chunk);
        let function_ptr = vm.objects.alloc_function(function);
        let closure_ptr = vm.objects.alloc_closure(function_ptr, 0);
        let main = Coroutine::new(closure_ptr, Vec::new());
        let main_id = vm.executor.spawn(main);
        let outcome = vm.run_until_complete(main_id);
        assert_eq!(outcome, InterpretResult::Ok, "program should run to completion");
        match vm.executor.get(main_id).result {
            Some(Ok(value)) => value,
            ref other => panic!("expected a successful result, got {other:?}"),
        }
    }

    /// E1 (spec.md §8): a recursive closure bound to a global computes
    /// `fib(10) == 55`. Hand-assembled because the compiler that would turn
    /// `let fib = func(n){ ... }` into this bytecode is out of scope.
    #[test]
    fn e1_fibonacci_closure_returns_55() {
        let mut vm = Vm::new();
        let fib_name = vm.intern("fib");

        // fn fib(n) { if n < 2 { return n } return fib(n-1) + fib(n-2) }
        // Slot 0 of every frame is the callee itself (spec.md §4.4's call
        // convention), so the sole parameter `n` lives in slot 1.
        let mut fib = ChunkBuilder::new();
        fib.emit_op(OpCode::GetLocal, 1)
            .emit_byte(1, 1)
            .emit_constant(Value::Integer(2), 1)
            .emit_op(OpCode::Less, 1);
        let else_jump = fib.emit_jump(OpCode::JumpIfFalse, 1);
        fib.emit_op(OpCode::Pop, 1)
            .emit_op(OpCode::GetLocal, 1)
            .emit_byte(1, 1)
            .emit_op(OpCode::Return, 1);
        fib.patch_jump(else_jump);
        fib.emit_op(OpCode::Pop, 1);

        fib.emit_op(OpCode::GetGlobal, 1);
        let fib_ref_a = fib.constant(Value::Str(fib_name));
        fib.emit_byte(fib_ref_a, 1)
            .emit_op(OpCode::GetLocal, 1)
            .emit_byte(1, 1)
            .emit_constant(Value::Integer(1), 1)
            .emit_op(OpCode::Subtract, 1)
            .emit_op(OpCode::Call, 1)
            .emit_byte(1, 1);

        fib.emit_op(OpCode::GetGlobal, 1);
        let fib_ref_b = fib.constant(Value::Str(fib_name));
        fib.emit_byte(fib_ref_b, 1)
            .emit_op(OpCode::GetLocal, 1)
            .emit_byte(1, 1)
            .emit_constant(Value::Integer(2), 1)
            .emit_op(OpCode::Subtract, 1)
            .emit_op(OpCode::Call, 1)
            .emit_byte(1, 1);

        fib.emit_op(OpCode::Add, 1).emit_op(OpCode::Return, 1);

        let mut function = ObjectFunction::new(1, "fib".to_string());
        function.chunk = Box::new(fib.finish());
        let function_ptr = vm.objects.alloc_function(function);

        let mut main = ChunkBuilder::new();
        main.emit_op(OpCode::Closure, 1);
        let fn_const = main.constant(Value::Function(function_ptr));
        main.emit_byte(fn_const, 1); // upvalue_count == 0: no capture pairs follow

        main.emit_op(OpCode::DefineGlobal, 1);
        let def_idx = main.constant(Value::Str(fib_name));
        main.emit_byte(def_idx, 1);

        main.emit_op(OpCode::GetGlobal, 1);
        let call_idx = main.constant(Value::Str(fib_name));
        main.emit_byte(call_idx, 1);
        main.emit_constant(Value::Integer(10), 1);
        main.emit_op(OpCode::Call, 1).emit_byte(1, 1);
        main.emit_op(OpCode::Return, 1);

        let result = run_to_value(&mut vm, main.finish());
        assert!(
            matches!(result, Value::Integer(55)),
            "expected fib(10) == 55, got {result:?}"
        );
    }

    /// E4 (spec.md §8): copying a struct and mutating the copy must not
    /// affect the original (`var b = a; b.x = 2` leaves `a.x == 1`).
    #[test]
    fn e4_struct_assignment_copies_the_value() {
        let mut vm = Vm::new();
        let point = vm.intern("Point");
        let field_x = vm.intern("x");
        let a_name = vm.intern("a");
        let b_name = vm.intern("b");

        let mut setup = ChunkBuilder::new();
        setup.emit_op(OpCode::StructType, 1);
        let type_idx = setup.constant(Value::Str(point));
        setup.emit_byte(type_idx, 1);
        setup.emit_byte(1, 1);
        let field_idx = setup.constant(Value::Str(field_x));
        setup.emit_byte(field_idx, 1);

        setup.emit_constant(Value::Integer(1), 1);
        setup.emit_op(OpCode::StructInit, 1);
        let init_idx = setup.constant(Value::Str(point));
        setup.emit_byte(init_idx, 1);
        setup.emit_op(OpCode::DefineGlobal, 1);
        let a_idx = setup.constant(Value::Str(a_name));
        setup.emit_byte(a_idx, 1);

        // var b = a  (DEFINE_GLOBAL deep-copies a Struct operand)
        setup.emit_op(OpCode::GetGlobal, 1);
        let a_ref = setup.constant(Value::Str(a_name));
        setup.emit_byte(a_ref, 1);
        setup.emit_op(OpCode::DefineGlobal, 1);
        let b_idx = setup.constant(Value::Str(b_name));
        setup.emit_byte(b_idx, 1);

        // b.x = 2
        setup.emit_op(OpCode::GetGlobal, 1);
        let b_ref = setup.constant(Value::Str(b_name));
        setup.emit_byte(b_ref, 1);
        setup.emit_constant(Value::Integer(2), 1);
        setup.emit_op(OpCode::SetProperty, 1);
        let set_field_idx = setup.constant(Value::Str(field_x));
        setup.emit_byte(set_field_idx, 1);
        setup.emit_op(OpCode::Pop, 1); // SET_PROPERTY leaves the value on TOS

        setup.emit_op(OpCode::Nil, 1).emit_op(OpCode::Return, 1);
        run_to_value(&mut vm, setup.finish());

        let mut read_a = ChunkBuilder::new();
        read_a.emit_op(OpCode::GetGlobal, 1);
        let a_ref2 = read_a.constant(Value::Str(a_name));
        read_a.emit_byte(a_ref2, 1);
        read_a.emit_op(OpCode::GetProperty, 1);
        let ax_idx = read_a.constant(Value::Str(field_x));
        read_a.emit_byte(ax_idx, 1);
        read_a.emit_op(OpCode::Return, 1);
        assert!(
            matches!(run_to_value(&mut vm, read_a.finish()), Value::Integer(1)),
            "mutating the copy must not affect the original"
        );

        let mut read_b = ChunkBuilder::new();
        read_b.emit_op(OpCode::GetGlobal, 1);
        let b_ref2 = read_b.constant(Value::Str(b_name));
        read_b.emit_byte(b_ref2, 1);
        read_b.emit_op(OpCode::GetProperty, 1);
        let bx_idx = read_b.constant(Value::Str(field_x));
        read_b.emit_byte(bx_idx, 1);
        read_b.emit_op(OpCode::Return, 1);
        assert!(
            matches!(run_to_value(&mut vm, read_b.finish()), Value::Integer(2)),
            "the copy itself must observe its own mutation"
        );
    }

    /// E5 (spec.md §8): three objects referencing each other in a cycle,
    /// reachable from no root, are fully reclaimed by one collection — and
    /// the five default prototypes, reachable from no root either, survive
    /// it regardless, because the VM owns them for its entire lifetime.
    #[test]
    fn e5_gc_collects_an_unreachable_cycle_but_keeps_the_prototypes() {
        let mut vm = Vm::new();
        assert_eq!(vm.object_count(), 5, "Object/Array/String/Function/Number prototypes");

        let next = vm.intern("next");
        let a = vm.objects.alloc_object(None);
        let b = vm.objects.alloc_object(None);
        let c = vm.objects.alloc_object(None);
        unsafe {
            (*a).set(next, Value::Object(b));
            (*b).set(next, Value::Object(c));
            (*c).set(next, Value::Object(a));
        }
        assert_eq!(vm.object_count(), 8);

        vm.force_collect();
        assert_eq!(
            vm.object_count(),
            5,
            "the unreachable cycle is freed but the prototypes are not"
        );
    }

    /// E6 (spec.md §8): two coroutines awaiting the same pending promise
    /// resume in the order they awaited, once it resolves.
    #[test]
    fn e6_await_resolves_waiters_in_fifo_order() {
        let mut vm = Vm::new();
        let promise = vm.objects.alloc_promise();

        let spawn_awaiter = |vm: &mut Vm| -> CoroutineId {
            let mut builder = ChunkBuilder::new();
            builder
                .emit_constant(Value::Promise(promise), 1)
                .emit_op(OpCode::Await, 1)
                .emit_op(OpCode::Return, 1);
            let mut function = ObjectFunction::new(0, String::new());
            function.chunk = Box::new(builder.finish());
            let function_ptr = vm.objects.alloc_function(function);
            let closure_ptr = vm.objects.alloc_closure(function_ptr, 0);
            vm.executor.spawn(Coroutine::new(closure_ptr, Vec::new()))
        };

        let first = spawn_awaiter(&mut vm);
        let second = spawn_awaiter(&mut vm);

        // Resume each once: both block on the still-pending promise.
        assert!(vm.tick());
        assert!(vm.tick());
        assert_eq!(vm.executor.get(first).state, CoroutineState::Suspended);
        assert_eq!(vm.executor.get(second).state, CoroutineState::Suspended);
        assert!(!vm.tick(), "no coroutine should be ready while the promise is pending");

        let waiters = unsafe { (*promise).settle(PromiseState::Resolved, Value::Integer(42)) };
        assert_eq!(waiters, vec![first, second], "waiters recorded in await order");
        for waiter in waiters {
            vm.executor.reschedule(waiter);
        }

        assert!(vm.tick());
        assert!(vm.tick());
        assert_eq!(vm.executor.get(first).result.clone(), Some(Ok(Value::Integer(42))));
        assert_eq!(vm.executor.get(second).result.clone(), Some(Ok(Value::Integer(42))));
    }
}
