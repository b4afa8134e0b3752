use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::config::RuntimeConfig;

use super::chunk::{Chunk, Op};
use super::heap::{
    BoundMethod, Class, Function, GcRef, GcStats, Heap, HostInstance, Instance, Native, ObjKind,
    Upvalue,
};
use super::native::{HostObject, HostValue, NativeFn};
use super::{RuntimeError, Value};

/// One active function invocation: the function object, the saved
/// instruction pointer, and the stack slot of the callee (slot 0 of the
/// frame's locals).
#[derive(Debug)]
struct Frame {
    function: GcRef,
    ip: usize,
    base: usize,
}

/// What a callee turned out to be, copied out of the heap before the
/// borrow is released.
enum Callee {
    Function { arity: u8 },
    Native { name: String, arity: u8, func: NativeFn },
    Bound { receiver: Value, method: GcRef },
    Class { init: Option<GcRef> },
    NotCallable,
}

/// The opal virtual machine. Owns its operand stack, call-frame stack,
/// heap, and globals table exclusively; all three bulk resources are
/// fixed-capacity, sized at construction, and exceeding any of them is a
/// fatal runtime error.
#[derive(Debug)]
pub struct VM {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    heap: Heap,
    globals: HashMap<String, Value>,
    /// Head of the open-upvalue list, sorted by slot index descending,
    /// chained through each upvalue's intrusive next reference.
    open_upvalues: Option<GcRef>,
    stack_capacity: usize,
    frame_capacity: usize,
    /// Source line of the instruction being executed, for error reporting.
    line: u32,
}

impl VM {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            stack: Vec::with_capacity(config.stack_capacity),
            frames: Vec::with_capacity(config.frame_capacity),
            heap: Heap::new(config.heap_capacity, config.trace_gc),
            globals: HashMap::new(),
            open_upvalues: None,
            stack_capacity: config.stack_capacity,
            frame_capacity: config.frame_capacity,
            line: 0,
        }
    }

    pub fn gc_stats(&self) -> GcStats {
        self.heap.stats()
    }

    /// Register a host callback into the globals table by name.
    pub fn register_native(
        &mut self,
        name: &str,
        arity: u8,
        func: NativeFn,
    ) -> Result<(), RuntimeError> {
        let r = self.alloc(ObjKind::Native(Native {
            name: name.to_string(),
            arity,
            func,
        }))?;
        self.globals.insert(name.to_string(), Value::Obj(r));
        Ok(())
    }

    /// Register a host object into the globals table by name. Member
    /// access on it routes through the [`HostObject`] bridge.
    pub fn register_host_object(
        &mut self,
        name: &str,
        handle: Rc<RefCell<dyn HostObject>>,
    ) -> Result<(), RuntimeError> {
        let r = self.alloc(ObjKind::HostInstance(HostInstance { handle }))?;
        self.globals.insert(name.to_string(), Value::Obj(r));
        Ok(())
    }

    /// Execute a chunk from its entry point until the outermost frame
    /// returns. Runtime errors are fatal to the script.
    pub fn run(&mut self, chunk: &Chunk) -> Result<(), RuntimeError> {
        let script = self.alloc(ObjKind::Function(Function {
            name: String::new(),
            arity: 0,
            entry: 0,
            upvalues: Vec::new(),
        }))?;
        self.push(Value::Obj(script))?;
        self.frames.push(Frame {
            function: script,
            ip: 0,
            base: 0,
        });
        let result = self.dispatch(chunk);
        if result.is_err() {
            // Leave the machine reusable after an abandoned run.
            self.stack.clear();
            self.frames.clear();
            self.open_upvalues = None;
        }
        result
    }

    // =========================================================================
    // Dispatch loop
    // =========================================================================

    fn dispatch(&mut self, chunk: &Chunk) -> Result<(), RuntimeError> {
        loop {
            let op_byte = {
                let frame = self.frames.last_mut().expect("no active frame");
                self.line = chunk.line_at(frame.ip);
                let byte = chunk.code[frame.ip];
                frame.ip += 1;
                byte
            };
            let op = Op::from_u8(op_byte)
                .ok_or_else(|| self.error(format!("invalid opcode {}", op_byte)))?;

            match op {
                Op::Const => {
                    let idx = self.read_u16(chunk) as usize;
                    self.push(Value::Int(chunk.consts[idx]))?;
                }
                Op::Str => {
                    let idx = self.read_u16(chunk) as usize;
                    let r = self.alloc(ObjKind::Str(chunk.strings[idx].clone()))?;
                    self.push(Value::Obj(r))?;
                }
                Op::True => self.push(Value::Bool(true))?,
                Op::False => self.push(Value::Bool(false))?,
                Op::Nil => self.push(Value::Nil)?,
                Op::Pop => {
                    self.pop();
                }
                Op::Dup => {
                    let v = self.peek(0);
                    self.push(v)?;
                }

                Op::GetLocal => {
                    let slot = self.read_byte(chunk) as usize;
                    let base = self.frames.last().expect("no active frame").base;
                    let v = self.stack[base + slot];
                    self.push(v)?;
                }
                Op::SetLocal => {
                    let slot = self.read_byte(chunk) as usize;
                    let base = self.frames.last().expect("no active frame").base;
                    self.stack[base + slot] = self.peek(0);
                }
                Op::GetGlobal => {
                    let idx = self.read_u16(chunk) as usize;
                    let name = &chunk.names[idx];
                    match self.globals.get(name) {
                        Some(v) => {
                            let v = *v;
                            self.push(v)?;
                        }
                        None => {
                            return Err(self.error(format!("undefined variable '{}'", name)));
                        }
                    }
                }
                Op::SetGlobal => {
                    let idx = self.read_u16(chunk) as usize;
                    let name = &chunk.names[idx];
                    if !self.globals.contains_key(name) {
                        return Err(self.error(format!("undefined variable '{}'", name)));
                    }
                    let v = self.peek(0);
                    self.globals.insert(name.clone(), v);
                }
                Op::DefineGlobal => {
                    let idx = self.read_u16(chunk) as usize;
                    let name = chunk.names[idx].clone();
                    let v = self.pop();
                    self.globals.insert(name, v);
                }
                Op::GetUpvalue => {
                    let idx = self.read_byte(chunk) as usize;
                    let r = self.current_upvalue(idx);
                    let v = match self.heap.get(r) {
                        ObjKind::Upvalue(Upvalue::Open { slot, .. }) => self.stack[*slot],
                        ObjKind::Upvalue(Upvalue::Closed { value }) => *value,
                        _ => unreachable!("upvalue slot holds a non-upvalue"),
                    };
                    self.push(v)?;
                }
                Op::SetUpvalue => {
                    let idx = self.read_byte(chunk) as usize;
                    let r = self.current_upvalue(idx);
                    let v = self.peek(0);
                    let open_slot = match self.heap.get(r) {
                        ObjKind::Upvalue(Upvalue::Open { slot, .. }) => Some(*slot),
                        ObjKind::Upvalue(Upvalue::Closed { .. }) => None,
                        _ => unreachable!("upvalue slot holds a non-upvalue"),
                    };
                    match open_slot {
                        Some(slot) => self.stack[slot] = v,
                        None => {
                            *self.heap.get_mut(r) =
                                ObjKind::Upvalue(Upvalue::Closed { value: v });
                        }
                    }
                }

                Op::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    let eq = self.values_equal(a, b);
                    self.push(Value::Bool(eq))?;
                }
                Op::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    let eq = self.values_equal(a, b);
                    self.push(Value::Bool(!eq))?;
                }
                Op::Less => self.compare_op(|a, b| a < b)?,
                Op::LessEqual => self.compare_op(|a, b| a <= b)?,
                Op::Greater => self.compare_op(|a, b| a > b)?,
                Op::GreaterEqual => self.compare_op(|a, b| a >= b)?,

                Op::Add => self.add_op()?,
                Op::Sub => self.int_op(|a, b| Ok(a.wrapping_sub(b)))?,
                Op::Mul => self.int_op(|a, b| Ok(a.wrapping_mul(b)))?,
                Op::Div => self.int_op(|a, b| {
                    if b == 0 {
                        Err("division by zero")
                    } else {
                        Ok(a.wrapping_div(b))
                    }
                })?,
                Op::Mod => self.int_op(|a, b| {
                    if b == 0 {
                        Err("division by zero")
                    } else {
                        Ok(a.wrapping_rem(b))
                    }
                })?,
                Op::BitAnd => self.int_op(|a, b| Ok(a & b))?,
                Op::BitOr => self.int_op(|a, b| Ok(a | b))?,
                Op::BitXor => self.int_op(|a, b| Ok(a ^ b))?,
                Op::Shl => self.int_op(|a, b| {
                    if !(0..64).contains(&b) {
                        Err("shift amount out of range")
                    } else {
                        Ok(a << b)
                    }
                })?,
                Op::Shr => self.int_op(|a, b| {
                    if !(0..64).contains(&b) {
                        Err("shift amount out of range")
                    } else {
                        Ok(a >> b)
                    }
                })?,

                Op::Negate => {
                    let v = self.pop();
                    match v.as_int() {
                        Some(n) => self.push(Value::Int(n.wrapping_neg()))?,
                        None => return Err(self.error("operand must be an integer")),
                    }
                }
                Op::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(!v.is_truthy()))?;
                }
                Op::BitNot => {
                    let v = self.pop();
                    match v.as_int() {
                        Some(n) => self.push(Value::Int(!n))?,
                        None => return Err(self.error("operand must be an integer")),
                    }
                }
                Op::Inc => {
                    let v = self.pop();
                    match v.as_int() {
                        Some(n) => self.push(Value::Int(n.wrapping_add(1)))?,
                        None => return Err(self.error("operand must be an integer")),
                    }
                }
                Op::Dec => {
                    let v = self.pop();
                    match v.as_int() {
                        Some(n) => self.push(Value::Int(n.wrapping_sub(1)))?,
                        None => return Err(self.error("operand must be an integer")),
                    }
                }

                Op::Jump => {
                    let offset = self.read_u16(chunk) as usize;
                    self.frames.last_mut().expect("no active frame").ip += offset;
                }
                Op::JumpIfFalse => {
                    let offset = self.read_u16(chunk) as usize;
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().expect("no active frame").ip += offset;
                    }
                }
                Op::Loop => {
                    let offset = self.read_u16(chunk) as usize;
                    self.frames.last_mut().expect("no active frame").ip -= offset;
                }

                Op::Call => {
                    let argc = self.read_byte(chunk) as usize;
                    self.call_value(argc)?;
                }
                Op::Closure => self.make_closure(chunk)?,
                Op::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                Op::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("no active frame");
                    self.close_upvalues(frame.base);
                    self.stack.truncate(frame.base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result)?;
                }

                Op::Class => {
                    let idx = self.read_u16(chunk) as usize;
                    let name = chunk.names[idx].clone();
                    let r = self.alloc(ObjKind::Class(Class {
                        name,
                        methods: HashMap::new(),
                    }))?;
                    self.push(Value::Obj(r))?;
                }
                Op::Inherit => {
                    // Stack: [superclass, subclass]. Copies the method table
                    // once; later additions to the superclass are invisible
                    // to this subclass.
                    let sub = self.peek(0);
                    let sup = self.peek(1);
                    let methods = match sup.as_obj().map(|r| self.heap.get(r)) {
                        Some(ObjKind::Class(c)) => c.methods.clone(),
                        _ => return Err(self.error("superclass must be a class")),
                    };
                    let sub_ref = sub.as_obj().expect("subclass on stack");
                    match self.heap.get_mut(sub_ref) {
                        ObjKind::Class(c) => c.methods = methods,
                        _ => unreachable!("inherit target is not a class"),
                    }
                    self.pop();
                }
                Op::Method => {
                    let idx = self.read_u16(chunk) as usize;
                    let name = chunk.names[idx].clone();
                    let method = self.peek(0);
                    let class = self.peek(1).as_obj().expect("class on stack");
                    match self.heap.get_mut(class) {
                        ObjKind::Class(c) => {
                            c.methods.insert(name, method);
                        }
                        _ => unreachable!("method target is not a class"),
                    }
                    self.pop();
                }

                Op::GetProp => {
                    let idx = self.read_u16(chunk) as usize;
                    let name = chunk.names[idx].clone();
                    self.get_property(&name)?;
                }
                Op::SetProp => {
                    let idx = self.read_u16(chunk) as usize;
                    let name = chunk.names[idx].clone();
                    self.set_property(&name)?;
                }
                Op::Invoke => {
                    let idx = self.read_u16(chunk) as usize;
                    let argc = self.read_byte(chunk) as usize;
                    let name = chunk.names[idx].clone();
                    self.invoke(&name, argc)?;
                }
                Op::GetSuper => {
                    let idx = self.read_u16(chunk) as usize;
                    let name = chunk.names[idx].clone();
                    let superclass = self.pop().as_obj().expect("superclass on stack");
                    let method = self.class_method(superclass, &name)?;
                    let receiver = self.peek(0);
                    let bound = self.alloc(ObjKind::BoundMethod(BoundMethod {
                        receiver,
                        method,
                    }))?;
                    let top = self.stack.len() - 1;
                    self.stack[top] = Value::Obj(bound);
                }
                Op::SuperInvoke => {
                    let idx = self.read_u16(chunk) as usize;
                    let argc = self.read_byte(chunk) as usize;
                    let name = chunk.names[idx].clone();
                    let superclass = self.pop().as_obj().expect("superclass on stack");
                    let method = self.class_method(superclass, &name)?;
                    let arity = self.function_arity(method);
                    self.call_function(method, arity, argc)?;
                }
            }
        }
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn call_value(&mut self, argc: usize) -> Result<(), RuntimeError> {
        let callee_idx = self.stack.len() - 1 - argc;
        let callee = self.stack[callee_idx];
        let resolved = match callee.as_obj() {
            None => Callee::NotCallable,
            Some(r) => match self.heap.get(r) {
                ObjKind::Function(f) => Callee::Function { arity: f.arity },
                ObjKind::Native(n) => Callee::Native {
                    name: n.name.clone(),
                    arity: n.arity,
                    func: n.func.clone(),
                },
                ObjKind::BoundMethod(b) => Callee::Bound {
                    receiver: b.receiver,
                    method: b.method,
                },
                ObjKind::Class(c) => Callee::Class {
                    init: c.methods.get("init").and_then(|v| v.as_obj()),
                },
                _ => Callee::NotCallable,
            },
        };

        match resolved {
            Callee::Function { arity } => {
                let r = callee.as_obj().expect("function callee");
                self.call_function(r, arity, argc)
            }
            Callee::Native { name, arity, func } => self.call_native(&name, arity, func, argc),
            Callee::Bound { receiver, method } => {
                // The receiver takes the callee's slot, becoming `this`.
                self.stack[callee_idx] = receiver;
                let arity = self.function_arity(method);
                self.call_function(method, arity, argc)
            }
            Callee::Class { init } => {
                let class = callee.as_obj().expect("class callee");
                let instance = self.alloc(ObjKind::Instance(Instance {
                    class,
                    fields: HashMap::new(),
                }))?;
                self.stack[callee_idx] = Value::Obj(instance);
                match init {
                    Some(m) => {
                        let arity = self.function_arity(m);
                        self.call_function(m, arity, argc)
                    }
                    None if argc != 0 => {
                        Err(self.error(format!("expected 0 arguments but got {}", argc)))
                    }
                    None => Ok(()),
                }
            }
            Callee::NotCallable => Err(self.error("can only call functions and classes")),
        }
    }

    fn call_function(&mut self, r: GcRef, arity: u8, argc: usize) -> Result<(), RuntimeError> {
        if argc != arity as usize {
            return Err(self.error(format!(
                "expected {} arguments but got {}",
                arity, argc
            )));
        }
        if self.frames.len() == self.frame_capacity {
            return Err(self.error("call stack overflow"));
        }
        let entry = match self.heap.get(r) {
            ObjKind::Function(f) => f.entry,
            _ => unreachable!("callee is not a function"),
        };
        self.frames.push(Frame {
            function: r,
            ip: entry,
            base: self.stack.len() - argc - 1,
        });
        Ok(())
    }

    fn call_native(
        &mut self,
        name: &str,
        arity: u8,
        func: NativeFn,
        argc: usize,
    ) -> Result<(), RuntimeError> {
        if argc != arity as usize {
            return Err(self.error(format!(
                "expected {} arguments but got {}",
                arity, argc
            )));
        }
        let args_start = self.stack.len() - argc;
        let mut args = Vec::with_capacity(argc);
        for i in 0..argc {
            let v = self.stack[args_start + i];
            args.push(self.to_host(v, name)?);
        }
        let result = func(&args).map_err(|e| self.error(e))?;
        self.stack.truncate(args_start - 1);
        let v = self.from_host(result)?;
        self.push(v)
    }

    fn function_arity(&self, r: GcRef) -> u8 {
        match self.heap.get(r) {
            ObjKind::Function(f) => f.arity,
            _ => unreachable!("callee is not a function"),
        }
    }

    fn class_method(&self, class: GcRef, name: &str) -> Result<GcRef, RuntimeError> {
        match self.heap.get(class) {
            ObjKind::Class(c) => match c.methods.get(name).and_then(|v| v.as_obj()) {
                Some(m) => Ok(m),
                None => Err(self.error(format!("undefined property '{}'", name))),
            },
            _ => unreachable!("method lookup on a non-class"),
        }
    }

    // =========================================================================
    // Properties
    // =========================================================================

    fn get_property(&mut self, name: &str) -> Result<(), RuntimeError> {
        let target = self.peek(0);
        let Some(r) = target.as_obj() else {
            return Err(self.error("only instances have properties"));
        };
        enum Found {
            Field(Value),
            Method(GcRef),
            Host(Rc<RefCell<dyn HostObject>>),
            NotAnInstance,
        }
        let found = match self.heap.get(r) {
            ObjKind::Instance(i) => match i.fields.get(name) {
                Some(v) => Found::Field(*v),
                None => match self.heap.get(i.class) {
                    ObjKind::Class(c) => match c.methods.get(name).and_then(|v| v.as_obj()) {
                        Some(m) => Found::Method(m),
                        None => {
                            return Err(self.error(format!("undefined property '{}'", name)));
                        }
                    },
                    _ => unreachable!("instance class is not a class"),
                },
            },
            ObjKind::HostInstance(h) => Found::Host(h.handle.clone()),
            _ => Found::NotAnInstance,
        };
        let top = self.stack.len() - 1;
        match found {
            Found::Field(v) => {
                self.stack[top] = v;
                Ok(())
            }
            Found::Method(m) => {
                // The receiver stays on the stack while the bound method is
                // allocated, keeping it rooted if a collection runs.
                let bound = self.alloc(ObjKind::BoundMethod(BoundMethod {
                    receiver: target,
                    method: m,
                }))?;
                self.stack[top] = Value::Obj(bound);
                Ok(())
            }
            Found::Host(handle) => {
                let hv = handle.borrow().get(name).map_err(|e| self.error(e))?;
                let v = self.from_host(hv)?;
                let top = self.stack.len() - 1;
                self.stack[top] = v;
                Ok(())
            }
            Found::NotAnInstance => Err(self.error("only instances have properties")),
        }
    }

    fn set_property(&mut self, name: &str) -> Result<(), RuntimeError> {
        let value = self.peek(0);
        let target = self.peek(1);
        let Some(r) = target.as_obj() else {
            return Err(self.error("only instances have fields"));
        };
        enum Target {
            Script,
            Host(Rc<RefCell<dyn HostObject>>),
            NotAnInstance,
        }
        let target_kind = match self.heap.get(r) {
            ObjKind::Instance(_) => Target::Script,
            ObjKind::HostInstance(h) => Target::Host(h.handle.clone()),
            _ => Target::NotAnInstance,
        };
        match target_kind {
            Target::Script => {
                if let ObjKind::Instance(i) = self.heap.get_mut(r) {
                    i.fields.insert(name.to_string(), value);
                }
            }
            Target::Host(handle) => {
                let hv = self.to_host(value, name)?;
                handle
                    .borrow_mut()
                    .set(name, hv)
                    .map_err(|e| self.error(e))?;
            }
            Target::NotAnInstance => {
                return Err(self.error("only instances have fields"));
            }
        }
        // The assignment expression evaluates to the assigned value.
        self.pop();
        self.pop();
        self.push(value)
    }

    fn invoke(&mut self, name: &str, argc: usize) -> Result<(), RuntimeError> {
        let receiver_idx = self.stack.len() - 1 - argc;
        let receiver = self.stack[receiver_idx];
        let Some(r) = receiver.as_obj() else {
            return Err(self.error("only instances have methods"));
        };
        enum Plan {
            CallField(Value),
            CallMethod(GcRef),
            Host(Rc<RefCell<dyn HostObject>>),
            NotAnInstance,
        }
        let plan = match self.heap.get(r) {
            ObjKind::Instance(i) => match i.fields.get(name) {
                // A field holding a callable shadows any method of the
                // same name.
                Some(v) => Plan::CallField(*v),
                None => match self.heap.get(i.class) {
                    ObjKind::Class(c) => match c.methods.get(name).and_then(|v| v.as_obj()) {
                        Some(m) => Plan::CallMethod(m),
                        None => {
                            return Err(self.error(format!("undefined property '{}'", name)));
                        }
                    },
                    _ => unreachable!("instance class is not a class"),
                },
            },
            ObjKind::HostInstance(h) => Plan::Host(h.handle.clone()),
            _ => Plan::NotAnInstance,
        };
        match plan {
            Plan::CallField(v) => {
                self.stack[receiver_idx] = v;
                self.call_value(argc)
            }
            Plan::CallMethod(m) => {
                // The receiver already sits in the callee slot, becoming
                // `this` without a bound-method allocation.
                let arity = self.function_arity(m);
                self.call_function(m, arity, argc)
            }
            Plan::Host(handle) => {
                let args_start = self.stack.len() - argc;
                let mut args = Vec::with_capacity(argc);
                for i in 0..argc {
                    let v = self.stack[args_start + i];
                    args.push(self.to_host(v, name)?);
                }
                let result = handle
                    .borrow_mut()
                    .invoke(name, &args)
                    .map_err(|e| self.error(e))?;
                self.stack.truncate(args_start - 1);
                let v = self.from_host(result)?;
                self.push(v)
            }
            Plan::NotAnInstance => Err(self.error("only instances have methods")),
        }
    }

    // =========================================================================
    // Closures and upvalues
    // =========================================================================

    fn make_closure(&mut self, chunk: &Chunk) -> Result<(), RuntimeError> {
        let entry = self.read_u16(chunk) as usize;
        let name_idx = self.read_u16(chunk) as usize;
        let arity = self.read_byte(chunk);
        let n_upvalues = self.read_byte(chunk) as usize;

        let (base, parent) = {
            let frame = self.frames.last().expect("no active frame");
            (frame.base, frame.function)
        };

        // Every resolved reference is rooted while the rest are created:
        // open upvalues through the open list, inherited ones through the
        // enclosing frame's function.
        let mut upvalues = Vec::with_capacity(n_upvalues);
        for _ in 0..n_upvalues {
            let is_local = self.read_byte(chunk) == 1;
            let index = self.read_byte(chunk) as usize;
            if is_local {
                let r = self.capture_upvalue(base + index)?;
                upvalues.push(r);
            } else {
                let r = match self.heap.get(parent) {
                    ObjKind::Function(f) => f.upvalues[index],
                    _ => unreachable!("enclosing frame is not a function"),
                };
                upvalues.push(r);
            }
        }

        let name = chunk.names[name_idx].clone();
        let r = self.alloc(ObjKind::Function(Function {
            name,
            arity,
            entry,
            upvalues,
        }))?;
        self.push(Value::Obj(r))
    }

    /// Find or create the open upvalue aliasing `slot`, keeping the list
    /// sorted by slot index descending from the head.
    fn capture_upvalue(&mut self, slot: usize) -> Result<GcRef, RuntimeError> {
        let mut prev: Option<GcRef> = None;
        let mut cur = self.open_upvalues;
        while let Some(r) = cur {
            let (cur_slot, next) = match self.heap.get(r) {
                ObjKind::Upvalue(Upvalue::Open { slot, next }) => (*slot, *next),
                _ => unreachable!("open list entry is not an open upvalue"),
            };
            if cur_slot == slot {
                return Ok(r);
            }
            if cur_slot < slot {
                break;
            }
            prev = Some(r);
            cur = next;
        }

        let created = self.alloc(ObjKind::Upvalue(Upvalue::Open { slot, next: cur }))?;
        match prev {
            None => self.open_upvalues = Some(created),
            Some(p) => match self.heap.get_mut(p) {
                ObjKind::Upvalue(Upvalue::Open { next, .. }) => *next = Some(created),
                _ => unreachable!("open list entry is not an open upvalue"),
            },
        }
        Ok(created)
    }

    /// Close every open upvalue aliasing a slot at or above `from`: the
    /// value is copied off the stack into the upvalue itself, decoupling
    /// it from the slot it used to alias.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(r) = self.open_upvalues {
            let (slot, next) = match self.heap.get(r) {
                ObjKind::Upvalue(Upvalue::Open { slot, next }) => (*slot, *next),
                _ => unreachable!("open list entry is not an open upvalue"),
            };
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            *self.heap.get_mut(r) = ObjKind::Upvalue(Upvalue::Closed { value });
            self.open_upvalues = next;
        }
    }

    fn current_upvalue(&self, index: usize) -> GcRef {
        let frame = self.frames.last().expect("no active frame");
        match self.heap.get(frame.function) {
            ObjKind::Function(f) => f.upvalues[index],
            _ => unreachable!("frame function is not a function"),
        }
    }

    // =========================================================================
    // Allocation and collection
    // =========================================================================

    /// Allocate a heap object, collecting first if no slot is free. If a
    /// full collection still leaves the heap exhausted, the program dies
    /// with "out of heap space".
    fn alloc(&mut self, kind: ObjKind) -> Result<GcRef, RuntimeError> {
        if !self.heap.has_free() {
            self.collect_garbage();
        }
        match self.heap.try_alloc(kind) {
            Some(r) => Ok(r),
            None => Err(self.error("out of heap space")),
        }
    }

    fn collect_garbage(&mut self) {
        // Roots: operand stack, globals, every frame's function, and the
        // open-upvalue list (traced through its intrusive next refs).
        for v in &self.stack {
            self.heap.mark_value(*v);
        }
        for v in self.globals.values() {
            self.heap.mark_value(*v);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.function);
        }
        if let Some(head) = self.open_upvalues {
            self.heap.mark_object(head);
        }
        self.heap.trace();
        self.heap.sweep();
    }

    // =========================================================================
    // Host-value coercion
    // =========================================================================

    fn to_host(&self, v: Value, member: &str) -> Result<HostValue, RuntimeError> {
        match v {
            Value::Int(n) => Ok(HostValue::Int(n)),
            Value::Bool(b) => Ok(HostValue::Bool(b)),
            Value::Nil => Ok(HostValue::Nil),
            Value::Obj(r) => match self.heap.get_str(r) {
                Some(s) => Ok(HostValue::Str(s.to_string())),
                None => Err(self.error(format!(
                    "unsupported argument type '{}' for '{}'",
                    self.heap.get(r).type_name(),
                    member
                ))),
            },
        }
    }

    fn from_host(&mut self, hv: HostValue) -> Result<Value, RuntimeError> {
        match hv {
            HostValue::Int(n) => Ok(Value::Int(n)),
            HostValue::Bool(b) => Ok(Value::Bool(b)),
            HostValue::Nil => Ok(Value::Nil),
            HostValue::Str(s) => {
                let r = self.alloc(ObjKind::Str(s))?;
                Ok(Value::Obj(r))
            }
        }
    }

    // =========================================================================
    // Small helpers
    // =========================================================================

    fn read_byte(&mut self, chunk: &Chunk) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let byte = chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self, chunk: &Chunk) -> u16 {
        let frame = self.frames.last_mut().expect("no active frame");
        let value = chunk.read_u16(frame.ip);
        frame.ip += 2;
        value
    }

    fn push(&mut self, v: Value) -> Result<(), RuntimeError> {
        if self.stack.len() == self.stack_capacity {
            return Err(self.error("stack overflow"));
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        // The VM trusts its compiler: underflow is a bytecode bug, not a
        // script error.
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, depth: usize) -> Value {
        self.stack[self.stack.len() - 1 - depth]
    }

    fn values_equal(&self, a: Value, b: Value) -> bool {
        if let (Some(ra), Some(rb)) = (a.as_obj(), b.as_obj()) {
            if let (Some(sa), Some(sb)) = (self.heap.get_str(ra), self.heap.get_str(rb)) {
                return sa == sb;
            }
        }
        a.same(&b)
    }

    fn int_op(
        &mut self,
        f: impl Fn(i64, i64) -> Result<i64, &'static str>,
    ) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_int(), b.as_int()) {
            (Some(a), Some(b)) => {
                let result = f(a, b).map_err(|e| self.error(e))?;
                self.push(Value::Int(result))
            }
            _ => Err(self.error("operands must be integers")),
        }
    }

    fn compare_op(&mut self, f: impl Fn(i64, i64) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_int(), b.as_int()) {
            (Some(a), Some(b)) => self.push(Value::Bool(f(a, b))),
            _ => Err(self.error("operands must be integers")),
        }
    }

    fn add_op(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => {
                self.pop();
                self.pop();
                self.push(Value::Int(x.wrapping_add(y)))
            }
            (Value::Obj(ra), Value::Obj(rb)) => {
                let concat = match (self.heap.get_str(ra), self.heap.get_str(rb)) {
                    (Some(sa), Some(sb)) => {
                        let mut s = String::with_capacity(sa.len() + sb.len());
                        s.push_str(sa);
                        s.push_str(sb);
                        s
                    }
                    _ => {
                        return Err(
                            self.error("operands must be two integers or two strings")
                        );
                    }
                };
                // Allocate while both operands are still on the stack.
                let r = self.alloc(ObjKind::Str(concat))?;
                self.pop();
                self.pop();
                self.push(Value::Obj(r))
            }
            _ => Err(self.error("operands must be two integers or two strings")),
        }
    }

    fn error(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError::new(message, self.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, Lexer};

    fn run_source(source: &str) -> Result<VM, RuntimeError> {
        let tokens = Lexer::new(source).scan_tokens().unwrap();
        let chunk = compile(tokens).unwrap();
        let config = RuntimeConfig::default();
        let mut vm = VM::new(&config);
        vm.run(&chunk)?;
        Ok(vm)
    }

    fn run_capture(source: &str) -> Result<String, RuntimeError> {
        let tokens = Lexer::new(source).scan_tokens().unwrap();
        let chunk = compile(tokens).unwrap();
        let config = RuntimeConfig::default();
        let mut vm = VM::new(&config);
        let output = Rc::new(RefCell::new(String::new()));
        let sink = output.clone();
        vm.register_native(
            "print",
            1,
            Rc::new(move |args: &[HostValue]| {
                let line = match &args[0] {
                    HostValue::Int(n) => n.to_string(),
                    HostValue::Bool(b) => b.to_string(),
                    HostValue::Str(s) => s.clone(),
                    HostValue::Nil => "nil".to_string(),
                };
                sink.borrow_mut().push_str(&line);
                sink.borrow_mut().push('\n');
                Ok(HostValue::Nil)
            }),
        )?;
        vm.run(&chunk)?;
        let captured = output.borrow().clone();
        Ok(captured)
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run_capture("print((2 + 3) * 4);").unwrap(), "20\n");
    }

    #[test]
    fn test_string_concat() {
        assert_eq!(run_capture("print(\"a\" + \"b\");").unwrap(), "ab\n");
    }

    #[test]
    fn test_comparison() {
        assert_eq!(run_capture("print(1 < 2);").unwrap(), "true\n");
    }

    #[test]
    fn test_string_equality_by_content() {
        assert_eq!(run_capture("print(\"a\" + \"b\" == \"ab\");").unwrap(), "true\n");
    }

    #[test]
    fn test_bitwise_ops() {
        assert_eq!(
            run_capture("print(6 & 3); print(6 | 3); print(6 ^ 3); print(1 << 4); print(~0);")
                .unwrap(),
            "2\n7\n5\n16\n-1\n"
        );
    }

    #[test]
    fn test_division_by_zero() {
        let err = run_source("1 / 0;").unwrap_err();
        assert!(err.message.contains("division by zero"));
    }

    #[test]
    fn test_type_error_on_add() {
        let err = run_source("1 + \"a\";").unwrap_err();
        assert!(err.message.contains("two integers or two strings"));
    }

    #[test]
    fn test_undefined_global() {
        let err = run_source("missing;").unwrap_err();
        assert!(err.message.contains("undefined variable 'missing'"));
    }

    #[test]
    fn test_locals_and_blocks() {
        let out = run_capture("{ var a = 1; { var a = 2; print(a); } print(a); }").unwrap();
        assert_eq!(out, "2\n1\n");
    }

    #[test]
    fn test_control_flow() {
        let out = run_capture(
            "var i = 0; while (i < 5) { if (i % 2 == 0) { print(i); } i = i + 1; }",
        )
        .unwrap();
        assert_eq!(out, "0\n2\n4\n");
    }

    #[test]
    fn test_for_loop_with_increment() {
        let out = run_capture("for (var i = 0; i < 3; i++) { print(i); }").unwrap();
        assert_eq!(out, "0\n1\n2\n");
    }

    #[test]
    fn test_recursion() {
        let out = run_capture(
            "fun fib(n) { if (n <= 1) { return n; } return fib(n - 1) + fib(n - 2); } \
             print(fib(10));",
        )
        .unwrap();
        assert_eq!(out, "55\n");
    }

    #[test]
    fn test_arity_mismatch_names_counts() {
        let err = run_source("fun f(a, b) { return a; } f(1);").unwrap_err();
        assert!(err.message.contains("expected 2 arguments but got 1"));
    }

    #[test]
    fn test_open_upvalue_sees_mutation() {
        // The closure aliases the live slot, not a copy.
        let out = run_capture(
            "fun outer() { var x = 1; fun f() { return x; } x = 2; return f(); } \
             print(outer());",
        )
        .unwrap();
        assert_eq!(out, "2\n");
    }

    #[test]
    fn test_closed_upvalue_survives_scope_exit() {
        let out = run_capture(
            "fun make() { var n = 10; fun get() { return n; } n = 20; return get; } \
             var g = make(); print(g());",
        )
        .unwrap();
        assert_eq!(out, "20\n");
    }

    #[test]
    fn test_closure_counter() {
        let out = run_capture(
            "fun counter() { var n = 0; fun next() { n = n + 1; return n; } return next; } \
             var c = counter(); print(c()); print(c()); print(c());",
        )
        .unwrap();
        assert_eq!(out, "1\n2\n3\n");
    }

    #[test]
    fn test_two_closures_share_one_upvalue() {
        let out = run_capture(
            "fun pair() { var n = 0; \
               fun inc() { n = n + 1; return n; } \
               fun get() { return n; } \
               inc(); inc(); print(get()); return nil; } \
             pair();",
        )
        .unwrap();
        assert_eq!(out, "2\n");
    }

    #[test]
    fn test_class_instantiation_and_fields() {
        let out = run_capture(
            "class Point { init(x, y) { this.x = x; this.y = y; } } \
             var p = Point(3, 4); print(p.x + p.y);",
        )
        .unwrap();
        assert_eq!(out, "7\n");
    }

    #[test]
    fn test_method_invocation() {
        let out = run_capture(
            "class Adder { init(base) { this.base = base; } \
               add(n) { return this.base + n; } } \
             var a = Adder(10); print(a.add(5));",
        )
        .unwrap();
        assert_eq!(out, "15\n");
    }

    #[test]
    fn test_bound_method_keeps_receiver() {
        let out = run_capture(
            "class Greeter { init(word) { this.word = word; } \
               greet() { return this.word; } } \
             var m = Greeter(\"hi\").greet; print(m());",
        )
        .unwrap();
        assert_eq!(out, "hi\n");
    }

    #[test]
    fn test_inheritance_copies_methods() {
        let out = run_capture(
            "class A { m() { return 1; } } \
             class B < A { } \
             print(B().m());",
        )
        .unwrap();
        assert_eq!(out, "1\n");
    }

    #[test]
    fn test_super_dispatches_past_override() {
        let out = run_capture(
            "class A { m() { return 1; } } \
             class B < A { m() { return super.m() + 10; } } \
             class C < B { m() { return super.m() + 100; } } \
             print(C().m());",
        )
        .unwrap();
        assert_eq!(out, "111\n");
    }

    #[test]
    fn test_initializer_returns_instance() {
        let out = run_capture(
            "class A { init() { this.x = 5; } } \
             print(A().x);",
        )
        .unwrap();
        assert_eq!(out, "5\n");
    }

    #[test]
    fn test_class_arity_checked_through_init() {
        let err = run_source("class A { init(x) { } } A();").unwrap_err();
        assert!(err.message.contains("expected 1 arguments but got 0"));
    }

    #[test]
    fn test_call_non_callable() {
        let err = run_source("var x = 1; x();").unwrap_err();
        assert!(err.message.contains("can only call functions and classes"));
    }

    #[test]
    fn test_undefined_property() {
        let err = run_source("class A { } A().missing;").unwrap_err();
        assert!(err.message.contains("undefined property 'missing'"));
    }

    #[test]
    fn test_field_shadows_method_on_invoke() {
        let out = run_capture(
            "class A { m() { return 1; } } \
             fun two() { return 2; } \
             var a = A(); a.m = two; print(a.m());",
        )
        .unwrap();
        assert_eq!(out, "2\n");
    }

    #[test]
    fn test_call_stack_overflow() {
        let err = run_source("fun loop() { return loop(); } loop();").unwrap_err();
        assert!(err.message.contains("call stack overflow"));
    }

    #[test]
    fn test_heap_exhaustion_with_reachable_objects() {
        let tokens = Lexer::new(
            "class Node { init(next) { this.next = next; } } \
             var head = nil; \
             for (var i = 0; i < 100; i++) { head = Node(head); }",
        )
        .scan_tokens()
        .unwrap();
        let chunk = compile(tokens).unwrap();
        let config = RuntimeConfig {
            heap_capacity: 32,
            ..Default::default()
        };
        let mut vm = VM::new(&config);
        let err = vm.run(&chunk).unwrap_err();
        assert!(err.message.contains("out of heap space"));
    }

    #[test]
    fn test_heap_reclaims_unreachable_garbage() {
        // The same allocation count succeeds when each object becomes
        // garbage right away.
        let tokens = Lexer::new(
            "for (var i = 0; i < 100; i++) { var s = \"aaaa\" + \"bbbb\"; }",
        )
        .scan_tokens()
        .unwrap();
        let chunk = compile(tokens).unwrap();
        let config = RuntimeConfig {
            heap_capacity: 32,
            ..Default::default()
        };
        let mut vm = VM::new(&config);
        vm.run(&chunk).unwrap();
        assert!(vm.gc_stats().cycles > 0);
    }

    #[test]
    fn test_native_function_round_trip() {
        let tokens = Lexer::new("var x = double(21);").scan_tokens().unwrap();
        let chunk = compile(tokens).unwrap();
        let mut vm = VM::new(&RuntimeConfig::default());
        vm.register_native(
            "double",
            1,
            Rc::new(|args: &[HostValue]| match args {
                [HostValue::Int(n)] => Ok(HostValue::Int(n * 2)),
                _ => Err("double expects an int".to_string()),
            }),
        )
        .unwrap();
        vm.run(&chunk).unwrap();
        assert_eq!(vm.globals.get("x").unwrap().as_int(), Some(42));
    }

    #[test]
    fn test_native_arity_mismatch() {
        let tokens = Lexer::new("nop(1, 2);").scan_tokens().unwrap();
        let chunk = compile(tokens).unwrap();
        let mut vm = VM::new(&RuntimeConfig::default());
        vm.register_native("nop", 0, Rc::new(|_: &[HostValue]| Ok(HostValue::Nil)))
            .unwrap();
        let err = vm.run(&chunk).unwrap_err();
        assert!(err.message.contains("expected 0 arguments but got 2"));
    }

    #[test]
    fn test_host_object_members() {
        struct Gauge {
            level: i64,
        }
        impl HostObject for Gauge {
            fn type_name(&self) -> &str {
                "Gauge"
            }
            fn get(&self, member: &str) -> Result<HostValue, String> {
                match member {
                    "level" => Ok(HostValue::Int(self.level)),
                    _ => Err(super::super::native::missing_member(
                        self.type_name(),
                        member,
                    )),
                }
            }
            fn set(&mut self, member: &str, value: HostValue) -> Result<(), String> {
                match (member, value) {
                    ("level", HostValue::Int(n)) => {
                        self.level = n;
                        Ok(())
                    }
                    _ => Err(super::super::native::missing_member(
                        self.type_name(),
                        member,
                    )),
                }
            }
            fn invoke(&mut self, member: &str, args: &[HostValue]) -> Result<HostValue, String> {
                match (member, args) {
                    ("raise", [HostValue::Int(by)]) => {
                        self.level += by;
                        Ok(HostValue::Int(self.level))
                    }
                    _ => Err(super::super::native::missing_member(
                        self.type_name(),
                        member,
                    )),
                }
            }
        }

        let tokens = Lexer::new(
            "gauge.level = 10; var a = gauge.level; var b = gauge.raise(5);",
        )
        .scan_tokens()
        .unwrap();
        let chunk = compile(tokens).unwrap();
        let mut vm = VM::new(&RuntimeConfig::default());
        let gauge = Rc::new(RefCell::new(Gauge { level: 0 }));
        vm.register_host_object("gauge", gauge.clone()).unwrap();
        vm.run(&chunk).unwrap();
        assert_eq!(vm.globals.get("a").unwrap().as_int(), Some(10));
        assert_eq!(vm.globals.get("b").unwrap().as_int(), Some(15));
        assert_eq!(gauge.borrow().level, 15);
    }

    #[test]
    fn test_host_object_missing_member_is_runtime_error() {
        let tokens = Lexer::new("gauge.bogus;").scan_tokens().unwrap();
        let chunk = compile(tokens).unwrap();
        struct Empty;
        impl HostObject for Empty {
            fn type_name(&self) -> &str {
                "Empty"
            }
        }
        let mut vm = VM::new(&RuntimeConfig::default());
        vm.register_host_object("gauge", Rc::new(RefCell::new(Empty)))
            .unwrap();
        let err = vm.run(&chunk).unwrap_err();
        assert!(err.message.contains("bogus"));
    }

    #[test]
    fn test_dup_via_hand_built_chunk() {
        let mut chunk = Chunk::new();
        let idx = chunk.add_const(21);
        chunk.push_op(Op::Const, 1);
        chunk.push_u16(idx, 1);
        chunk.push_op(Op::Dup, 1);
        chunk.push_op(Op::Add, 1);
        let name = chunk.add_name("result");
        chunk.push_op(Op::DefineGlobal, 1);
        chunk.push_u16(name, 1);
        chunk.push_op(Op::Nil, 1);
        chunk.push_op(Op::Return, 1);

        let mut vm = VM::new(&RuntimeConfig::default());
        vm.run(&chunk).unwrap();
        assert_eq!(vm.globals.get("result").unwrap().as_int(), Some(42));
    }

    #[test]
    fn test_stack_overflow_detected() {
        let tokens = Lexer::new(
            "fun grow(n) { if (n == 0) { return 0; } return 1 + grow(n - 1); } grow(5000);",
        )
        .scan_tokens()
        .unwrap();
        let chunk = compile(tokens).unwrap();
        let config = RuntimeConfig {
            stack_capacity: 64,
            frame_capacity: 10000,
            ..Default::default()
        };
        let mut vm = VM::new(&config);
        let err = vm.run(&chunk).unwrap_err();
        assert!(err.message.contains("stack overflow"));
    }

    #[test]
    fn test_runtime_error_carries_line() {
        let err = run_source("var a = 1;\nvar b = 2;\na + \"x\";").unwrap_err();
        assert_eq!(err.line, 3);
    }
}
