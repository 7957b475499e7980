use rustc_hash::FxHashMap;

use alkb_bytecode::{Constant, Insn, Module, Opcode, REG_NONE};

use crate::error::VmError;
use crate::fields::FieldTable;
use crate::heap::{GcStats, Heap, INITIAL_GC_THRESHOLD};
use crate::jit::{Jit, JitStats, RegionFn, HOT_THRESHOLD};
use crate::memory::FrameStack;
use crate::natives::{self, Native};
use crate::value::{value_equals, ObjRef, Value};

/// VM construction options.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Compile hot regions to native code
    pub jit: bool,
    /// Heap size that triggers the first collection
    pub gc_threshold: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            jit: true,
            gc_threshold: INITIAL_GC_THRESHOLD,
        }
    }
}

/// A module function bound into the VM: constants interned into the
/// heap, code ready for dispatch.
pub(crate) struct BoundFunction {
    pub(crate) name: String,
    pub(crate) num_params: u32,
    pub(crate) reg_count: u16,
    pub(crate) consts: Vec<Value>,
    pub(crate) code: Vec<Insn>,
}

/// The ALKB virtual machine.
///
/// Owns every piece of run state: heap, register/call stacks, bound
/// functions, field-slot registry and the JIT cache. Two instances are
/// fully independent.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) mem: FrameStack,
    pub(crate) funcs: Vec<BoundFunction>,
    by_name: FxHashMap<String, usize>,
    pub(crate) fields: FieldTable,
    jit: Option<Jit>,
    /// Entry return value, set when the last frame pops
    pub(crate) finished: Option<Value>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let jit = if config.jit {
            match Jit::new() {
                Ok(jit) => Some(jit),
                Err(err) => {
                    tracing::warn!(%err, "JIT unavailable, running interpreted only");
                    None
                }
            }
        } else {
            None
        };
        Vm {
            heap: Heap::with_threshold(config.gc_threshold),
            mem: FrameStack::new(),
            funcs: Vec::new(),
            by_name: FxHashMap::default(),
            fields: FieldTable::default(),
            jit,
            finished: None,
        }
    }

    // ---
    // Module binding
    // ---

    /// Bind a loaded module: intern constants into the heap and index
    /// functions by name (last writer wins on collisions).
    pub fn bind_module(&mut self, module: &Module) {
        for f in &module.functions {
            let consts = f.consts.iter().map(|k| self.intern_const(k)).collect();
            let idx = self.funcs.len();
            self.funcs.push(BoundFunction {
                name: f.name.clone(),
                num_params: f.num_params,
                reg_count: f.reg_count,
                consts,
                code: f.code.clone(),
            });
            self.by_name.insert(f.name.clone(), idx);
            tracing::debug!(name = %f.name, regs = f.reg_count, insns = f.code.len(), "bound function");
        }
    }

    fn intern_const(&mut self, k: &Constant) -> Value {
        match k {
            Constant::Int(v) => Value::Int(*v),
            Constant::Float(v) => Value::Float(*v),
            Constant::Bool(v) => Value::Bool(*v),
            Constant::Str(s) => Value::Obj(self.heap.alloc_str(s)),
            Constant::FuncRef { name, arity } => {
                let name = self.heap.alloc_str(name);
                Value::Obj(self.heap.alloc_funcref(name, *arity))
            }
            Constant::ClassRef { name } => {
                let name = self.heap.alloc_str(name);
                Value::Obj(self.heap.alloc_classref(name))
            }
            Constant::FieldRef {
                class_name,
                field_name,
            } => {
                let class_name = self.heap.alloc_str(class_name);
                let field_name = self.heap.alloc_str(field_name);
                Value::Obj(self.heap.alloc_fieldref(class_name, field_name))
            }
        }
    }

    /// Declared parameter count of a bound function, if present.
    pub fn param_count(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).map(|&i| self.funcs[i].num_params)
    }

    // ---
    // Entry runner
    // ---

    /// Run a bound function to completion and return its result.
    ///
    /// Arguments are copied into `R[0]..R[argc-1]` of the entry frame.
    pub fn run(&mut self, entry: &str, args: &[Value]) -> Result<Value, VmError> {
        let &fidx = self
            .by_name
            .get(entry)
            .ok_or_else(|| VmError::MissingEntry(entry.to_string()))?;
        let reg_count = self.funcs[fidx].reg_count;
        if args.len() as u32 > reg_count as u32 {
            return Err(VmError::TooManyArgs {
                argc: args.len() as u32,
                regs: reg_count,
            });
        }
        self.mem.push_frame(fidx, reg_count, -1, REG_NONE)?;
        for (i, &v) in args.iter().enumerate() {
            self.mem.set_reg(i as u8, v);
        }
        self.interpret()
    }

    // ---
    // Garbage collection
    // ---

    /// Collect now, using the full root set: every register of every
    /// frame plus the constant pools of all bound functions.
    pub fn collect_garbage(&mut self) {
        let mem = &self.mem;
        let funcs = &self.funcs;
        self.heap.collect(|marker| {
            mem.mark_roots(marker);
            for f in funcs {
                for &v in &f.consts {
                    marker.mark_value(v);
                }
            }
        });
    }

    pub fn gc_stats(&self) -> GcStats {
        self.heap.stats().clone()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.heap.bytes_allocated()
    }

    pub fn live_objects(&self) -> usize {
        self.heap.live_objects()
    }

    /// Slot assigned to `(class, field)`, if it has been resolved.
    pub fn field_slot(&self, class: &str, field: &str) -> Option<usize> {
        self.fields.lookup(class, field)
    }

    pub fn jit_stats(&self) -> JitStats {
        self.jit.as_ref().map(Jit::stats).unwrap_or_default()
    }

    // ---
    // Interpreter
    // ---

    fn interpret(&mut self) -> Result<Value, VmError> {
        loop {
            if let Some(result) = self.finished.take() {
                return Ok(result);
            }
            // Dispatch boundaries are the GC safe points.
            if self.heap.gc_pending() {
                self.collect_garbage();
            }

            let frame = self.mem.current();
            let fidx = frame.func;
            let pc = frame.pc;
            let code = &self.funcs[fidx].code;
            if pc < 0 || pc as usize >= code.len() {
                return Err(VmError::PcOutOfBounds(pc));
            }
            let insn = code[pc as usize];
            let op = insn.opcode().map_err(VmError::UnknownOpcode)?;

            match op {
                Opcode::Nop => self.mem.current_mut().pc = pc + 1,

                Opcode::Mov => {
                    let v = self.mem.reg(insn.b());
                    self.mem.set_reg(insn.a(), v);
                    self.mem.current_mut().pc = pc + 1;
                }

                Opcode::LoadK => {
                    let v = self.constant(fidx, insn.bx())?;
                    self.mem.set_reg(insn.a(), v);
                    self.mem.current_mut().pc = pc + 1;
                }

                Opcode::AddI
                | Opcode::SubI
                | Opcode::MulI
                | Opcode::DivI
                | Opcode::ModI => {
                    let lhs = as_int(self.mem.reg(insn.b()))?;
                    let rhs = as_int(self.mem.reg(insn.c()))?;
                    let res = match op {
                        Opcode::AddI => lhs.wrapping_add(rhs),
                        Opcode::SubI => lhs.wrapping_sub(rhs),
                        Opcode::MulI => lhs.wrapping_mul(rhs),
                        Opcode::DivI | Opcode::ModI => {
                            if rhs == 0 {
                                return Err(VmError::DivisionByZero);
                            }
                            if op == Opcode::DivI {
                                lhs.wrapping_div(rhs)
                            } else {
                                lhs.wrapping_rem(rhs)
                            }
                        }
                        _ => unreachable!(),
                    };
                    self.mem.set_reg(insn.a(), Value::Int(res));
                    self.mem.current_mut().pc = pc + 1;
                }

                Opcode::AddF
                | Opcode::SubF
                | Opcode::MulF
                | Opcode::DivF
                | Opcode::ModF => {
                    let lhs = as_float(self.mem.reg(insn.b()))?;
                    let rhs = as_float(self.mem.reg(insn.c()))?;
                    let res = match op {
                        Opcode::AddF => lhs + rhs,
                        Opcode::SubF => lhs - rhs,
                        Opcode::MulF => lhs * rhs,
                        Opcode::DivF => lhs / rhs,
                        Opcode::ModF => lhs % rhs,
                        _ => unreachable!(),
                    };
                    self.mem.set_reg(insn.a(), Value::Float(res));
                    self.mem.current_mut().pc = pc + 1;
                }

                Opcode::LtI | Opcode::LeI | Opcode::GtI | Opcode::GeI => {
                    let lhs = as_int(self.mem.reg(insn.b()))?;
                    let rhs = as_int(self.mem.reg(insn.c()))?;
                    let res = match op {
                        Opcode::LtI => lhs < rhs,
                        Opcode::LeI => lhs <= rhs,
                        Opcode::GtI => lhs > rhs,
                        Opcode::GeI => lhs >= rhs,
                        _ => unreachable!(),
                    };
                    self.mem.set_reg(insn.a(), Value::Bool(res));
                    self.mem.current_mut().pc = pc + 1;
                }

                Opcode::LtF | Opcode::LeF | Opcode::GtF | Opcode::GeF => {
                    let lhs = as_float(self.mem.reg(insn.b()))?;
                    let rhs = as_float(self.mem.reg(insn.c()))?;
                    let res = match op {
                        Opcode::LtF => lhs < rhs,
                        Opcode::LeF => lhs <= rhs,
                        Opcode::GtF => lhs > rhs,
                        Opcode::GeF => lhs >= rhs,
                        _ => unreachable!(),
                    };
                    self.mem.set_reg(insn.a(), Value::Bool(res));
                    self.mem.current_mut().pc = pc + 1;
                }

                Opcode::Eq | Opcode::Ne => {
                    let eq = value_equals(self.mem.reg(insn.b()), self.mem.reg(insn.c()));
                    self.mem
                        .set_reg(insn.a(), Value::Bool(if op == Opcode::Eq { eq } else { !eq }));
                    self.mem.current_mut().pc = pc + 1;
                }

                Opcode::Not => {
                    let v = as_bool(self.mem.reg(insn.b()))?;
                    self.mem.set_reg(insn.a(), Value::Bool(!v));
                    self.mem.current_mut().pc = pc + 1;
                }

                Opcode::And | Opcode::Or => {
                    let lhs = as_bool(self.mem.reg(insn.b()))?;
                    let rhs = as_bool(self.mem.reg(insn.c()))?;
                    let res = if op == Opcode::And {
                        lhs && rhs
                    } else {
                        lhs || rhs
                    };
                    self.mem.set_reg(insn.a(), Value::Bool(res));
                    self.mem.current_mut().pc = pc + 1;
                }

                Opcode::Jmp => {
                    self.mem.current_mut().pc = pc + 1 + insn.sbx() as i32;
                }

                Opcode::JmpT | Opcode::JmpF => {
                    let cond = as_bool(self.mem.reg(insn.a()))?;
                    let take = if op == Opcode::JmpT { cond } else { !cond };
                    let sbx = insn.sbx();
                    if take {
                        self.mem.current_mut().pc = pc + 1 + sbx as i32;
                    } else {
                        self.mem.current_mut().pc = pc + 1;
                        // A not-taken forward guard is the shape of a
                        // loop back-edge; feed the hot-path detector.
                        if sbx > 0 {
                            self.note_loop_edge(fidx, pc, sbx)?;
                        }
                    }
                }

                Opcode::I2F => {
                    let v = as_int(self.mem.reg(insn.b()))?;
                    self.mem.set_reg(insn.a(), Value::Float(v as f32));
                    self.mem.current_mut().pc = pc + 1;
                }

                Opcode::NewArr => {
                    self.op_new_arr(insn.a(), insn.b())?;
                    self.mem.current_mut().pc = pc + 1;
                }

                Opcode::GetElem => {
                    self.op_get_elem(insn.a(), insn.b(), insn.c())?;
                    self.mem.current_mut().pc = pc + 1;
                }

                Opcode::SetElem => {
                    self.op_set_elem(insn.a(), insn.b(), insn.c())?;
                    self.mem.current_mut().pc = pc + 1;
                }

                Opcode::NewObj => {
                    self.op_new_obj(insn.a(), insn.bx())?;
                    self.mem.current_mut().pc = pc + 1;
                }

                Opcode::GetField => {
                    self.op_get_field(insn.a(), insn.b(), insn.c())?;
                    self.mem.current_mut().pc = pc + 1;
                }

                Opcode::SetField => {
                    self.op_set_field(insn.a(), insn.b(), insn.c())?;
                    self.mem.current_mut().pc = pc + 1;
                }

                Opcode::Call => self.op_call(pc, insn.a(), insn.b(), insn.c())?,

                Opcode::CallK => self.op_callk(pc, insn.a(), insn.bx())?,

                Opcode::CallNative => {
                    self.op_call_native(insn.a(), insn.b(), insn.c())?;
                    self.mem.current_mut().pc = pc + 1;
                }

                Opcode::Ret => self.op_ret(insn.a())?,
            }
        }
    }

    fn constant(&self, fidx: usize, idx: u16) -> Result<Value, VmError> {
        self.funcs[fidx]
            .consts
            .get(idx as usize)
            .copied()
            .ok_or(VmError::ConstOutOfBounds(idx))
    }

    // ---
    // Object and call operations
    //
    // These are shared verbatim with emitted code: the JIT's runtime
    // helpers call straight into them.
    // ---

    pub(crate) fn op_new_arr(&mut self, a: u8, b: u8) -> Result<(), VmError> {
        let len = as_int(self.mem.reg(b))?;
        if len < 0 {
            return Err(VmError::NegativeArrayLength(len));
        }
        let arr = self.heap.alloc_array(len as usize);
        self.mem.set_reg(a, Value::Obj(arr));
        Ok(())
    }

    pub(crate) fn op_get_elem(&mut self, a: u8, b: u8, c: u8) -> Result<(), VmError> {
        let arr = as_obj(self.mem.reg(b), "array")?;
        let cell = arr.as_array().ok_or(VmError::Type {
            expected: "array",
            got: arr.type_name(),
        })?;
        let idx = as_int(self.mem.reg(c))?;
        let v = {
            let elems = cell.borrow();
            let i = check_index(idx, elems.len())?;
            elems[i]
        };
        self.mem.set_reg(a, v);
        Ok(())
    }

    pub(crate) fn op_set_elem(&mut self, a: u8, b: u8, c: u8) -> Result<(), VmError> {
        let arr = as_obj(self.mem.reg(a), "array")?;
        let cell = arr.as_array().ok_or(VmError::Type {
            expected: "array",
            got: arr.type_name(),
        })?;
        let idx = as_int(self.mem.reg(b))?;
        let v = self.mem.reg(c);
        let mut elems = cell.borrow_mut();
        let i = check_index(idx, elems.len())?;
        elems[i] = v;
        Ok(())
    }

    pub(crate) fn op_new_obj(&mut self, a: u8, bx: u16) -> Result<(), VmError> {
        let fidx = self.mem.current().func;
        let k = self.constant(fidx, bx)?;
        let class_name = match k {
            Value::Obj(o) => match o.as_classref() {
                Some(cr) => cr.name,
                None => {
                    return Err(VmError::Type {
                        expected: "classref",
                        got: o.type_name(),
                    })
                }
            },
            other => {
                return Err(VmError::Type {
                    expected: "classref",
                    got: other.type_name(),
                })
            }
        };
        let instance = self.heap.alloc_instance(class_name);
        self.mem.set_reg(a, Value::Obj(instance));
        Ok(())
    }

    pub(crate) fn op_get_field(&mut self, a: u8, b: u8, c: u8) -> Result<(), VmError> {
        let instance = as_obj(self.mem.reg(b), "instance")?;
        let fref = as_obj(self.mem.reg(c), "fieldref")?;
        let slot = self.resolve_slot(fref)?;
        let ins = instance.as_instance().ok_or(VmError::Type {
            expected: "instance",
            got: instance.type_name(),
        })?;
        let v = {
            let mut fields = ins.fields.borrow_mut();
            if fields.len() <= slot {
                fields.resize(slot + 1, Value::Nil);
            }
            fields[slot]
        };
        self.mem.set_reg(a, v);
        Ok(())
    }

    pub(crate) fn op_set_field(&mut self, a: u8, b: u8, c: u8) -> Result<(), VmError> {
        let instance = as_obj(self.mem.reg(a), "instance")?;
        let fref = as_obj(self.mem.reg(b), "fieldref")?;
        let v = self.mem.reg(c);
        let slot = self.resolve_slot(fref)?;
        let ins = instance.as_instance().ok_or(VmError::Type {
            expected: "instance",
            got: instance.type_name(),
        })?;
        let mut fields = ins.fields.borrow_mut();
        if fields.len() <= slot {
            fields.resize(slot + 1, Value::Nil);
        }
        fields[slot] = v;
        Ok(())
    }

    fn resolve_slot(&mut self, fref: ObjRef) -> Result<usize, VmError> {
        let fr = fref.as_fieldref().ok_or(VmError::Type {
            expected: "fieldref",
            got: fref.type_name(),
        })?;
        let class = fr.class_name.as_str().unwrap_or_default();
        let field = fr.field_name.as_str().unwrap_or_default();
        Ok(self.fields.resolve(class, field))
    }

    pub(crate) fn op_call(&mut self, pc: i32, a: u8, b: u8, c: u8) -> Result<(), VmError> {
        let fref = as_obj(self.mem.reg(b), "funcref")?;
        let fr = fref.as_funcref().ok_or(VmError::Type {
            expected: "funcref",
            got: fref.type_name(),
        })?;
        let name = fr.name.as_str().unwrap_or_default();
        let callee = *self
            .by_name
            .get(name)
            .ok_or_else(|| VmError::UnknownFunction(name.to_string()))?;
        self.push_call(pc, a, callee, c as u32)
    }

    pub(crate) fn op_callk(&mut self, pc: i32, a: u8, bx: u16) -> Result<(), VmError> {
        let fidx = self.mem.current().func;
        let k = self.constant(fidx, bx)?;
        let fref = as_obj(k, "funcref")?;
        let fr = fref.as_funcref().ok_or(VmError::Type {
            expected: "funcref",
            got: fref.type_name(),
        })?;
        let name = fr.name.as_str().unwrap_or_default();
        let arity = fr.arity;
        let callee = *self
            .by_name
            .get(name)
            .ok_or_else(|| VmError::UnknownFunction(name.to_string()))?;
        self.push_call(pc, a, callee, arity)
    }

    fn push_call(&mut self, pc: i32, dst: u8, callee: usize, argc: u32) -> Result<(), VmError> {
        let reg_count = self.funcs[callee].reg_count;
        if argc > reg_count as u32 {
            return Err(VmError::TooManyArgs {
                argc,
                regs: reg_count,
            });
        }
        self.mem.current_mut().pc = pc + 1;
        self.mem.push_frame(callee, reg_count, pc + 1, dst)?;
        self.mem.copy_args_from_caller(argc as usize);
        Ok(())
    }

    pub(crate) fn op_call_native(&mut self, a: u8, b: u8, c: u8) -> Result<(), VmError> {
        let native = Native::from_id(b).ok_or(VmError::UnknownNative(b))?;
        let args: Vec<Value> = (0..c).map(|i| self.mem.reg(i)).collect();
        let result = natives::call(&mut self.heap, native, &args)?;
        self.mem.set_reg(a, result);
        Ok(())
    }

    pub(crate) fn op_ret(&mut self, a: u8) -> Result<(), VmError> {
        let ret = if a == REG_NONE {
            Value::Nil
        } else {
            self.mem.reg(a)
        };
        let popped = self.mem.pop_frame().ok_or(VmError::EmptyCallStack)?;
        if self.mem.is_empty() {
            self.finished = Some(ret);
        } else {
            self.mem.current_mut().pc = popped.return_pc;
            if popped.return_dst != REG_NONE {
                self.mem.set_reg(popped.return_dst, ret);
            }
        }
        Ok(())
    }

    // ---
    // Hot-path detection and region entry
    // ---

    fn note_loop_edge(&mut self, fidx: usize, pc: i32, sbx: i16) -> Result<(), VmError> {
        let key = (fidx, pc);
        let cached = self.jit.as_ref().and_then(|j| j.cached(key));
        if let Some(entry) = cached {
            if let Some(jit) = self.jit.as_mut() {
                jit.note_invocation();
            }
            return self.enter_region(entry);
        }

        if let Some(jit) = self.jit.as_mut() {
            if jit.observe(key) {
                let func = &self.funcs[fidx];
                let start = pc + 1;
                let end = pc + 1 + sbx as i32;
                match jit.compile_region(func, start, end) {
                    Ok(entry) => {
                        tracing::debug!(func = %func.name, pc, start, end, "promoted hot region");
                        jit.insert(key, entry);
                    }
                    Err(err) => {
                        tracing::debug!(func = %func.name, pc, %err, "region demoted");
                        jit.reject(key);
                    }
                }
            }
        }
        Ok(())
    }

    /// Trampoline into an emitted region for the current frame.
    ///
    /// The region returns the pc to resume at, or -1 when it already
    /// performed frame surgery (call/return) through a runtime helper.
    fn enter_region(&mut self, entry: RegionFn) -> Result<(), VmError> {
        let vm: *mut Vm = self;
        let regs = self.mem.regs_base_ptr();
        let consts = self.funcs[self.mem.current().func].consts.as_ptr();
        let next = unsafe { entry(vm, regs, consts) };
        if next >= 0 {
            self.mem.current_mut().pc = next as i32;
        }
        Ok(())
    }

    /// Observations of a loop edge before its region is promoted.
    pub fn hot_threshold(&self) -> u32 {
        HOT_THRESHOLD
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

// ---
// Operand extraction
// ---

fn as_int(v: Value) -> Result<i32, VmError> {
    match v {
        Value::Int(i) => Ok(i),
        other => Err(VmError::Type {
            expected: "int",
            got: other.type_name(),
        }),
    }
}

fn as_float(v: Value) -> Result<f32, VmError> {
    match v {
        Value::Float(f) => Ok(f),
        other => Err(VmError::Type {
            expected: "float",
            got: other.type_name(),
        }),
    }
}

fn as_bool(v: Value) -> Result<bool, VmError> {
    match v {
        Value::Bool(b) => Ok(b),
        other => Err(VmError::Type {
            expected: "bool",
            got: other.type_name(),
        }),
    }
}

fn as_obj(v: Value, expected: &'static str) -> Result<ObjRef, VmError> {
    match v {
        Value::Obj(o) => Ok(o),
        other => Err(VmError::Type {
            expected,
            got: other.type_name(),
        }),
    }
}

fn check_index(idx: i32, len: usize) -> Result<usize, VmError> {
    if idx < 0 || idx as usize >= len {
        return Err(VmError::IndexOutOfBounds {
            index: idx as i64,
            len,
        });
    }
    Ok(idx as usize)
}
