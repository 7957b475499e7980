//! Tracing JIT: compiles hot linear bytecode regions to native code.
//!
//! The interpreter counts not-taken forward conditional branches (the
//! shape of a loop back-edge) and promotes a site once its counter
//! crosses [`HOT_THRESHOLD`]. The region covering the next `sBx`
//! instructions is then compiled with cranelift and entered on every
//! later visit.
//!
//! Emitted code keeps all observable state in the register file: every
//! instruction loads its operands from the value stack and stores its
//! result back, so an exit at any instruction boundary leaves the frame
//! exactly as the interpreter would. Moves, constant loads, arithmetic,
//! comparisons, boolean ops and intra-region branches are inlined;
//! allocation, element/field access, equality, calls, natives and
//! returns go through the `rt_*` runtime helpers below.
//!
//! A region returns the pc to resume interpretation at, or -1 after a
//! helper already performed frame surgery. Anything the emitted code
//! cannot handle (an unexpected operand tag, a division edge case, a
//! failing helper) exits with the pc of the offending instruction; the
//! interpreter re-executes it and raises the error through its normal
//! path.

use std::collections::HashMap;

use cranelift::codegen;
use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use rustc_hash::{FxHashMap, FxHashSet};

use alkb_bytecode::Opcode;

use crate::value::layout;
use crate::value::{value_equals, Value as VmValue};
use crate::vm::{BoundFunction, Vm};

/// Loop-edge observations before a site is promoted.
pub const HOT_THRESHOLD: u32 = 100;

/// Signature of an emitted region: `(vm, regs, consts) -> next_pc`.
pub(crate) type RegionFn =
    unsafe extern "C" fn(*mut Vm, *mut VmValue, *const VmValue) -> i64;

/// Region returned this value after frame surgery through a helper.
const PC_FRAME_CHANGED: i64 = -1;

pub(crate) type RegionKey = (usize, i32);

/// JIT activity counters.
#[derive(Debug, Default, Clone)]
pub struct JitStats {
    /// Regions compiled and cached
    pub regions_compiled: usize,
    /// Promotions cancelled by the emitter
    pub regions_rejected: usize,
    /// Entries into cached regions
    pub region_invocations: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error("cannot initialize JIT backend: {0}")]
    Init(String),
    #[error("code generation failed: {0}")]
    Codegen(String),
    #[error("unknown opcode {0} in region")]
    UnsupportedOpcode(u8),
    #[error("region bounds fall outside the function")]
    BadRegion,
}

/// Imported runtime entry points, declared once per module.
struct RtFuncs {
    new_arr: FuncId,
    new_obj: FuncId,
    get_elem: FuncId,
    set_elem: FuncId,
    get_field: FuncId,
    set_field: FuncId,
    call: FuncId,
    callk: FuncId,
    call_native: FuncId,
    ret: FuncId,
    value_eq: FuncId,
    fmodf: FuncId,
}

impl RtFuncs {
    fn declare(module: &mut JITModule) -> Result<RtFuncs, JitError> {
        let ptr = module.target_config().pointer_type();
        let sig = |params: &[Type], ret: Type, module: &mut JITModule| {
            let mut s = module.make_signature();
            for &p in params {
                s.params.push(AbiParam::new(p));
            }
            s.returns.push(AbiParam::new(ret));
            s
        };
        let declare = |name: &str, s: &Signature, module: &mut JITModule| {
            module
                .declare_function(name, Linkage::Import, s)
                .map_err(|e| JitError::Codegen(e.to_string()))
        };

        let i = types::I64;
        let vm2 = sig(&[ptr, i, i], i, module);
        let vm3 = sig(&[ptr, i, i, i], i, module);
        let vm4 = sig(&[ptr, i, i, i, i], i, module);
        let vm1 = sig(&[ptr, i], i, module);
        let ff = sig(&[types::F32, types::F32], types::F32, module);

        Ok(RtFuncs {
            new_arr: declare("alkb_rt_new_arr", &vm2, module)?,
            new_obj: declare("alkb_rt_new_obj", &vm2, module)?,
            get_elem: declare("alkb_rt_get_elem", &vm3, module)?,
            set_elem: declare("alkb_rt_set_elem", &vm3, module)?,
            get_field: declare("alkb_rt_get_field", &vm3, module)?,
            set_field: declare("alkb_rt_set_field", &vm3, module)?,
            call: declare("alkb_rt_call", &vm4, module)?,
            callk: declare("alkb_rt_callk", &vm3, module)?,
            call_native: declare("alkb_rt_call_native", &vm3, module)?,
            ret: declare("alkb_rt_ret", &vm1, module)?,
            value_eq: declare("alkb_rt_value_eq", &vm2, module)?,
            fmodf: declare("alkb_rt_fmodf", &ff, module)?,
        })
    }
}

/// The region compiler plus its code cache and hotness state.
pub struct Jit {
    module: JITModule,
    ctx: codegen::Context,
    builder_ctx: FunctionBuilderContext,
    rt: RtFuncs,
    regions: FxHashMap<RegionKey, RegionFn>,
    blacklist: FxHashSet<RegionKey>,
    hot: FxHashMap<RegionKey, u32>,
    stats: JitStats,
    next_id: u32,
}

impl Jit {
    pub fn new() -> Result<Jit, JitError> {
        let mut flag_builder = settings::builder();
        let set = |fb: &mut settings::Builder, k: &str, v: &str| {
            fb.set(k, v).map_err(|e| JitError::Init(e.to_string()))
        };
        set(&mut flag_builder, "use_colocated_libcalls", "false")?;
        set(&mut flag_builder, "is_pic", "false")?;
        set(&mut flag_builder, "opt_level", "speed")?;

        let isa_builder =
            cranelift_native::builder().map_err(|e| JitError::Init(e.to_string()))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| JitError::Init(e.to_string()))?;

        let mut jit_builder =
            JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        register_runtime_symbols(&mut jit_builder);
        let mut module = JITModule::new(jit_builder);
        let rt = RtFuncs::declare(&mut module)?;

        Ok(Jit {
            module,
            ctx: codegen::Context::new(),
            builder_ctx: FunctionBuilderContext::new(),
            rt,
            regions: FxHashMap::default(),
            blacklist: FxHashSet::default(),
            hot: FxHashMap::default(),
            stats: JitStats::default(),
            next_id: 0,
        })
    }

    pub(crate) fn cached(&self, key: RegionKey) -> Option<RegionFn> {
        self.regions.get(&key).copied()
    }

    /// Record one loop-edge observation. True exactly when the site has
    /// just crossed the threshold and should be promoted.
    pub(crate) fn observe(&mut self, key: RegionKey) -> bool {
        if self.blacklist.contains(&key) || self.regions.contains_key(&key) {
            return false;
        }
        let count = self.hot.entry(key).or_insert(0);
        *count += 1;
        *count > HOT_THRESHOLD
    }

    pub(crate) fn insert(&mut self, key: RegionKey, entry: RegionFn) {
        self.regions.insert(key, entry);
    }

    /// Cancel promotion of a site for good; it stays interpreted.
    pub(crate) fn reject(&mut self, key: RegionKey) {
        self.blacklist.insert(key);
        self.stats.regions_rejected += 1;
    }

    pub(crate) fn note_invocation(&mut self) {
        self.stats.region_invocations += 1;
    }

    pub fn stats(&self) -> JitStats {
        self.stats.clone()
    }

    /// Compile `func.code[start..end]` into one native procedure.
    pub(crate) fn compile_region(
        &mut self,
        func: &BoundFunction,
        start: i32,
        end: i32,
    ) -> Result<RegionFn, JitError> {
        if start < 0 || end <= start || end as usize > func.code.len() {
            return Err(JitError::BadRegion);
        }

        let ptr_ty = self.module.target_config().pointer_type();
        let mut sig = self.module.make_signature();
        sig.params.push(AbiParam::new(ptr_ty)); // vm
        sig.params.push(AbiParam::new(ptr_ty)); // registers
        sig.params.push(AbiParam::new(ptr_ty)); // constant pool
        sig.returns.push(AbiParam::new(types::I64)); // next pc

        let name = format!("region_{}_{}", self.next_id, start);
        self.next_id += 1;
        let func_id = self
            .module
            .declare_function(&name, Linkage::Local, &sig)
            .map_err(|e| JitError::Codegen(e.to_string()))?;

        self.ctx.clear();
        self.ctx.func.signature = sig;
        {
            let mut builder = FunctionBuilder::new(&mut self.ctx.func, &mut self.builder_ctx);
            emit_region(&mut builder, &mut self.module, &self.rt, func, start, end)?;
            builder.finalize();
        }

        self.module
            .define_function(func_id, &mut self.ctx)
            .map_err(|e| JitError::Codegen(e.to_string()))?;
        self.module.clear_context(&mut self.ctx);
        self.module
            .finalize_definitions()
            .map_err(|e| JitError::Codegen(e.to_string()))?;

        let code = self.module.get_finalized_function(func_id);
        self.stats.regions_compiled += 1;
        Ok(unsafe { std::mem::transmute::<*const u8, RegionFn>(code) })
    }
}

// ---
// IR emission
// ---

const VAL: i32 = layout::SIZE as i32;

fn reg_off(r: u8) -> i32 {
    r as i32 * VAL
}

struct Emitter<'a, 'b> {
    b: &'a mut FunctionBuilder<'b>,
    vm: Value,
    regs: Value,
    consts: Value,
    exit: Block,
}

impl Emitter<'_, '_> {
    fn iconst(&mut self, v: i64) -> Value {
        self.b.ins().iconst(types::I64, v)
    }

    fn load_tag(&mut self, r: u8) -> Value {
        self.b
            .ins()
            .load(types::I8, MemFlags::trusted(), self.regs, reg_off(r))
    }

    fn load_i32(&mut self, r: u8) -> Value {
        self.b.ins().load(
            types::I32,
            MemFlags::trusted(),
            self.regs,
            reg_off(r) + layout::INT_OFFSET,
        )
    }

    fn load_f32(&mut self, r: u8) -> Value {
        self.b.ins().load(
            types::F32,
            MemFlags::trusted(),
            self.regs,
            reg_off(r) + layout::FLOAT_OFFSET,
        )
    }

    fn load_bool(&mut self, r: u8) -> Value {
        self.b.ins().load(
            types::I8,
            MemFlags::trusted(),
            self.regs,
            reg_off(r) + layout::BOOL_OFFSET,
        )
    }

    /// Copy one 16-byte value between slots of the register file or
    /// from the constant pool.
    fn copy_value(&mut self, from: Value, from_off: i32, to_off: i32) {
        let lo = self
            .b
            .ins()
            .load(types::I64, MemFlags::trusted(), from, from_off);
        let hi = self
            .b
            .ins()
            .load(types::I64, MemFlags::trusted(), from, from_off + 8);
        self.b
            .ins()
            .store(MemFlags::trusted(), lo, self.regs, to_off);
        self.b
            .ins()
            .store(MemFlags::trusted(), hi, self.regs, to_off + 8);
    }

    fn store_tag(&mut self, r: u8, tag: u8) {
        let t = self.b.ins().iconst(types::I8, tag as i64);
        self.b
            .ins()
            .store(MemFlags::trusted(), t, self.regs, reg_off(r));
        let zero = self.iconst(0);
        self.b
            .ins()
            .store(MemFlags::trusted(), zero, self.regs, reg_off(r) + 8);
    }

    fn store_int(&mut self, r: u8, v: Value) {
        self.store_tag(r, layout::TAG_INT);
        self.b.ins().store(
            MemFlags::trusted(),
            v,
            self.regs,
            reg_off(r) + layout::INT_OFFSET,
        );
    }

    fn store_float(&mut self, r: u8, v: Value) {
        self.store_tag(r, layout::TAG_FLOAT);
        self.b.ins().store(
            MemFlags::trusted(),
            v,
            self.regs,
            reg_off(r) + layout::FLOAT_OFFSET,
        );
    }

    /// `flag` is an I8 holding 0 or 1.
    fn store_bool(&mut self, r: u8, flag: Value) {
        self.store_tag(r, layout::TAG_BOOL);
        self.b.ins().store(
            MemFlags::trusted(),
            flag,
            self.regs,
            reg_off(r) + layout::BOOL_OFFSET,
        );
    }

    /// Continue only when `ok` holds; otherwise leave the region at
    /// `bail_pc` for the interpreter to re-execute.
    fn guard(&mut self, ok: Value, bail_pc: i32) {
        let cont = self.b.create_block();
        let pc = self.iconst(bail_pc as i64);
        self.b.ins().brif(ok, cont, &[], self.exit, &[pc]);
        self.b.switch_to_block(cont);
    }

    fn guard_tag(&mut self, r: u8, tag: u8, bail_pc: i32) {
        let t = self.load_tag(r);
        let ok = self.b.ins().icmp_imm(IntCC::Equal, t, tag as i64);
        self.guard(ok, bail_pc);
    }

    /// Unconditional region exit resuming at `pc`.
    fn exit_to(&mut self, pc: i64) {
        let v = self.iconst(pc);
        self.b.ins().jump(self.exit, &[v]);
    }

    fn call_rt(&mut self, module: &mut JITModule, id: FuncId, args: &[Value]) -> Value {
        let callee = module.declare_func_in_func(id, self.b.func);
        let call = self.b.ins().call(callee, args);
        self.b.inst_results(call)[0]
    }

    /// Call a helper that executes one instruction; bail when it fails.
    fn rt_op(&mut self, module: &mut JITModule, id: FuncId, args: &[Value], bail_pc: i32) {
        let status = self.call_rt(module, id, args);
        let ok = self.b.ins().icmp_imm(IntCC::Equal, status, 0);
        self.guard(ok, bail_pc);
    }
}

fn emit_region(
    builder: &mut FunctionBuilder,
    module: &mut JITModule,
    rt: &RtFuncs,
    func: &BoundFunction,
    start: i32,
    end: i32,
) -> Result<(), JitError> {
    let code = &func.code;

    // Blocks for every branch landing site inside the region, plus the
    // fall-through side of each conditional branch.
    let mut blocks: HashMap<i32, Block> = HashMap::new();
    for pc in start..end {
        let insn = code[pc as usize];
        let op = insn
            .opcode()
            .map_err(JitError::UnsupportedOpcode)?;
        match op {
            Opcode::Jmp | Opcode::JmpT | Opcode::JmpF => {
                let target = pc + 1 + insn.sbx() as i32;
                if (start..end).contains(&target) {
                    blocks.entry(target).or_insert_with(|| builder.create_block());
                }
                if op != Opcode::Jmp && pc + 1 < end {
                    blocks.entry(pc + 1).or_insert_with(|| builder.create_block());
                }
            }
            _ => {}
        }
    }

    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);

    let exit = builder.create_block();
    builder.append_block_param(exit, types::I64);

    let params = builder.block_params(entry);
    let (vm, regs, consts) = (params[0], params[1], params[2]);

    let mut e = Emitter {
        b: builder,
        vm,
        regs,
        consts,
        exit,
    };

    let mut terminated = false;
    for pc in start..end {
        if let Some(&block) = blocks.get(&pc) {
            if !terminated {
                e.b.ins().jump(block, &[]);
            }
            e.b.switch_to_block(block);
            terminated = false;
        } else if terminated {
            // Unreachable from inside the region.
            continue;
        }

        let insn = code[pc as usize];
        let op = insn.opcode().map_err(JitError::UnsupportedOpcode)?;
        match op {
            Opcode::Nop => {}

            Opcode::Mov => {
                let regs = e.regs;
                e.copy_value(regs, reg_off(insn.b()), reg_off(insn.a()));
            }

            Opcode::LoadK => {
                let bx = insn.bx();
                if (bx as usize) < func.consts.len() {
                    let consts = e.consts;
                    e.copy_value(consts, bx as i32 * VAL, reg_off(insn.a()));
                } else {
                    // Out-of-range pool index: let the interpreter fail.
                    e.exit_to(pc as i64);
                    terminated = true;
                }
            }

            Opcode::AddI | Opcode::SubI | Opcode::MulI | Opcode::DivI | Opcode::ModI => {
                e.guard_tag(insn.b(), layout::TAG_INT, pc);
                e.guard_tag(insn.c(), layout::TAG_INT, pc);
                let x = e.load_i32(insn.b());
                let y = e.load_i32(insn.c());
                let res = match op {
                    Opcode::AddI => e.b.ins().iadd(x, y),
                    Opcode::SubI => e.b.ins().isub(x, y),
                    Opcode::MulI => e.b.ins().imul(x, y),
                    Opcode::DivI | Opcode::ModI => {
                        // Zero divisors and the wrapping overflow case
                        // go back to the interpreter.
                        let nz = e.b.ins().icmp_imm(IntCC::NotEqual, y, 0);
                        e.guard(nz, pc);
                        let min = e.b.ins().icmp_imm(IntCC::Equal, x, i32::MIN as i64);
                        let neg1 = e.b.ins().icmp_imm(IntCC::Equal, y, -1);
                        let wraps = e.b.ins().band(min, neg1);
                        let ok = e.b.ins().icmp_imm(IntCC::Equal, wraps, 0);
                        e.guard(ok, pc);
                        if op == Opcode::DivI {
                            e.b.ins().sdiv(x, y)
                        } else {
                            e.b.ins().srem(x, y)
                        }
                    }
                    _ => unreachable!(),
                };
                e.store_int(insn.a(), res);
            }

            Opcode::AddF | Opcode::SubF | Opcode::MulF | Opcode::DivF | Opcode::ModF => {
                e.guard_tag(insn.b(), layout::TAG_FLOAT, pc);
                e.guard_tag(insn.c(), layout::TAG_FLOAT, pc);
                let x = e.load_f32(insn.b());
                let y = e.load_f32(insn.c());
                let res = match op {
                    Opcode::AddF => e.b.ins().fadd(x, y),
                    Opcode::SubF => e.b.ins().fsub(x, y),
                    Opcode::MulF => e.b.ins().fmul(x, y),
                    Opcode::DivF => e.b.ins().fdiv(x, y),
                    Opcode::ModF => e.call_rt(module, rt.fmodf, &[x, y]),
                    _ => unreachable!(),
                };
                e.store_float(insn.a(), res);
            }

            Opcode::LtI | Opcode::LeI | Opcode::GtI | Opcode::GeI => {
                e.guard_tag(insn.b(), layout::TAG_INT, pc);
                e.guard_tag(insn.c(), layout::TAG_INT, pc);
                let x = e.load_i32(insn.b());
                let y = e.load_i32(insn.c());
                let cc = match op {
                    Opcode::LtI => IntCC::SignedLessThan,
                    Opcode::LeI => IntCC::SignedLessThanOrEqual,
                    Opcode::GtI => IntCC::SignedGreaterThan,
                    Opcode::GeI => IntCC::SignedGreaterThanOrEqual,
                    _ => unreachable!(),
                };
                let flag = e.b.ins().icmp(cc, x, y);
                e.store_bool(insn.a(), flag);
            }

            Opcode::LtF | Opcode::LeF | Opcode::GtF | Opcode::GeF => {
                e.guard_tag(insn.b(), layout::TAG_FLOAT, pc);
                e.guard_tag(insn.c(), layout::TAG_FLOAT, pc);
                let x = e.load_f32(insn.b());
                let y = e.load_f32(insn.c());
                let cc = match op {
                    Opcode::LtF => FloatCC::LessThan,
                    Opcode::LeF => FloatCC::LessThanOrEqual,
                    Opcode::GtF => FloatCC::GreaterThan,
                    Opcode::GeF => FloatCC::GreaterThanOrEqual,
                    _ => unreachable!(),
                };
                let flag = e.b.ins().fcmp(cc, x, y);
                e.store_bool(insn.a(), flag);
            }

            Opcode::Eq | Opcode::Ne => {
                let vm = e.vm;
                let b_ix = e.iconst(insn.b() as i64);
                let c_ix = e.iconst(insn.c() as i64);
                let eq = e.call_rt(module, rt.value_eq, &[vm, b_ix, c_ix]);
                let mut flag = e.b.ins().ireduce(types::I8, eq);
                if op == Opcode::Ne {
                    flag = e.b.ins().bxor_imm(flag, 1);
                }
                e.store_bool(insn.a(), flag);
            }

            Opcode::Not => {
                e.guard_tag(insn.b(), layout::TAG_BOOL, pc);
                let v = e.load_bool(insn.b());
                let flipped = e.b.ins().bxor_imm(v, 1);
                e.store_bool(insn.a(), flipped);
            }

            Opcode::And | Opcode::Or => {
                e.guard_tag(insn.b(), layout::TAG_BOOL, pc);
                e.guard_tag(insn.c(), layout::TAG_BOOL, pc);
                let x = e.load_bool(insn.b());
                let y = e.load_bool(insn.c());
                let res = if op == Opcode::And {
                    e.b.ins().band(x, y)
                } else {
                    e.b.ins().bor(x, y)
                };
                e.store_bool(insn.a(), res);
            }

            Opcode::I2F => {
                e.guard_tag(insn.b(), layout::TAG_INT, pc);
                let v = e.load_i32(insn.b());
                let f = e.b.ins().fcvt_from_sint(types::F32, v);
                e.store_float(insn.a(), f);
            }

            Opcode::Jmp => {
                let target = pc + 1 + insn.sbx() as i32;
                if let Some(&block) = blocks.get(&target) {
                    e.b.ins().jump(block, &[]);
                } else {
                    e.exit_to(target as i64);
                }
                terminated = true;
            }

            Opcode::JmpT | Opcode::JmpF => {
                e.guard_tag(insn.a(), layout::TAG_BOOL, pc);
                let cond = e.load_bool(insn.a());
                let taken = if op == Opcode::JmpT {
                    e.b.ins().icmp_imm(IntCC::NotEqual, cond, 0)
                } else {
                    e.b.ins().icmp_imm(IntCC::Equal, cond, 0)
                };
                let target = pc + 1 + insn.sbx() as i32;
                let fall = pc + 1;

                match (blocks.get(&target).copied(), blocks.get(&fall).copied()) {
                    (Some(tb), Some(fb)) => {
                        e.b.ins().brif(taken, tb, &[], fb, &[]);
                    }
                    (Some(tb), None) => {
                        let fv = e.iconst(fall as i64);
                        e.b.ins().brif(taken, tb, &[], e.exit, &[fv]);
                    }
                    (None, Some(fb)) => {
                        let tv = e.iconst(target as i64);
                        e.b.ins().brif(taken, e.exit, &[tv], fb, &[]);
                    }
                    (None, None) => {
                        let tv = e.iconst(target as i64);
                        let fv = e.iconst(fall as i64);
                        let next = e.b.ins().select(taken, tv, fv);
                        e.b.ins().jump(e.exit, &[next]);
                    }
                }
                terminated = true;
            }

            Opcode::NewArr => {
                let vm = e.vm;
                let a = e.iconst(insn.a() as i64);
                let b = e.iconst(insn.b() as i64);
                e.rt_op(module, rt.new_arr, &[vm, a, b], pc);
            }

            Opcode::NewObj => {
                let vm = e.vm;
                let a = e.iconst(insn.a() as i64);
                let bx = e.iconst(insn.bx() as i64);
                e.rt_op(module, rt.new_obj, &[vm, a, bx], pc);
            }

            Opcode::GetElem | Opcode::SetElem | Opcode::GetField | Opcode::SetField => {
                let id = match op {
                    Opcode::GetElem => rt.get_elem,
                    Opcode::SetElem => rt.set_elem,
                    Opcode::GetField => rt.get_field,
                    Opcode::SetField => rt.set_field,
                    _ => unreachable!(),
                };
                let vm = e.vm;
                let a = e.iconst(insn.a() as i64);
                let b = e.iconst(insn.b() as i64);
                let c = e.iconst(insn.c() as i64);
                e.rt_op(module, id, &[vm, a, b, c], pc);
            }

            Opcode::CallNative => {
                let vm = e.vm;
                let a = e.iconst(insn.a() as i64);
                let b = e.iconst(insn.b() as i64);
                let c = e.iconst(insn.c() as i64);
                e.rt_op(module, rt.call_native, &[vm, a, b, c], pc);
            }

            Opcode::Call | Opcode::CallK => {
                let vm = e.vm;
                let pcv = e.iconst(pc as i64);
                let a = e.iconst(insn.a() as i64);
                let status = if op == Opcode::Call {
                    let b = e.iconst(insn.b() as i64);
                    let c = e.iconst(insn.c() as i64);
                    e.call_rt(module, rt.call, &[vm, pcv, a, b, c])
                } else {
                    let bx = e.iconst(insn.bx() as i64);
                    e.call_rt(module, rt.callk, &[vm, pcv, a, bx])
                };
                // On success the callee frame is current; either way the
                // interpreter takes over.
                let ok = e.b.ins().icmp_imm(IntCC::Equal, status, 0);
                let done = e.iconst(PC_FRAME_CHANGED);
                let bail = e.iconst(pc as i64);
                let next = e.b.ins().select(ok, done, bail);
                e.b.ins().jump(e.exit, &[next]);
                terminated = true;
            }

            Opcode::Ret => {
                let vm = e.vm;
                let a = e.iconst(insn.a() as i64);
                e.call_rt(module, rt.ret, &[vm, a]);
                e.exit_to(PC_FRAME_CHANGED);
                terminated = true;
            }
        }
    }

    if !terminated {
        e.exit_to(end as i64);
    }

    e.b.switch_to_block(exit);
    let next_pc = e.b.block_params(exit)[0];
    e.b.ins().return_(&[next_pc]);

    e.b.seal_all_blocks();
    Ok(())
}

// ---
// Runtime helpers
//
// Called from emitted code under the host C calling convention. Each
// executes exactly one instruction through the interpreter's own
// operation, returning 0 on success and 1 to make the region bail; a
// failed operation mutates nothing, so the interpreter's re-execution
// observes the identical error.
// ---

fn register_runtime_symbols(builder: &mut JITBuilder) {
    builder.symbol("alkb_rt_new_arr", rt_new_arr as *const u8);
    builder.symbol("alkb_rt_new_obj", rt_new_obj as *const u8);
    builder.symbol("alkb_rt_get_elem", rt_get_elem as *const u8);
    builder.symbol("alkb_rt_set_elem", rt_set_elem as *const u8);
    builder.symbol("alkb_rt_get_field", rt_get_field as *const u8);
    builder.symbol("alkb_rt_set_field", rt_set_field as *const u8);
    builder.symbol("alkb_rt_call", rt_call as *const u8);
    builder.symbol("alkb_rt_callk", rt_callk as *const u8);
    builder.symbol("alkb_rt_call_native", rt_call_native as *const u8);
    builder.symbol("alkb_rt_ret", rt_ret as *const u8);
    builder.symbol("alkb_rt_value_eq", rt_value_eq as *const u8);
    builder.symbol("alkb_rt_fmodf", rt_fmodf as *const u8);
}

fn status(result: Result<(), crate::error::VmError>) -> i64 {
    match result {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

extern "C" fn rt_new_arr(vm: *mut Vm, a: i64, b: i64) -> i64 {
    let vm = unsafe { &mut *vm };
    status(vm.op_new_arr(a as u8, b as u8))
}

extern "C" fn rt_new_obj(vm: *mut Vm, a: i64, bx: i64) -> i64 {
    let vm = unsafe { &mut *vm };
    status(vm.op_new_obj(a as u8, bx as u16))
}

extern "C" fn rt_get_elem(vm: *mut Vm, a: i64, b: i64, c: i64) -> i64 {
    let vm = unsafe { &mut *vm };
    status(vm.op_get_elem(a as u8, b as u8, c as u8))
}

extern "C" fn rt_set_elem(vm: *mut Vm, a: i64, b: i64, c: i64) -> i64 {
    let vm = unsafe { &mut *vm };
    status(vm.op_set_elem(a as u8, b as u8, c as u8))
}

extern "C" fn rt_get_field(vm: *mut Vm, a: i64, b: i64, c: i64) -> i64 {
    let vm = unsafe { &mut *vm };
    status(vm.op_get_field(a as u8, b as u8, c as u8))
}

extern "C" fn rt_set_field(vm: *mut Vm, a: i64, b: i64, c: i64) -> i64 {
    let vm = unsafe { &mut *vm };
    status(vm.op_set_field(a as u8, b as u8, c as u8))
}

extern "C" fn rt_call(vm: *mut Vm, pc: i64, a: i64, b: i64, c: i64) -> i64 {
    let vm = unsafe { &mut *vm };
    status(vm.op_call(pc as i32, a as u8, b as u8, c as u8))
}

extern "C" fn rt_callk(vm: *mut Vm, pc: i64, a: i64, bx: i64) -> i64 {
    let vm = unsafe { &mut *vm };
    status(vm.op_callk(pc as i32, a as u8, bx as u16))
}

extern "C" fn rt_call_native(vm: *mut Vm, a: i64, b: i64, c: i64) -> i64 {
    let vm = unsafe { &mut *vm };
    status(vm.op_call_native(a as u8, b as u8, c as u8))
}

extern "C" fn rt_ret(vm: *mut Vm, a: i64) -> i64 {
    let vm = unsafe { &mut *vm };
    status(vm.op_ret(a as u8))
}

extern "C" fn rt_value_eq(vm: *mut Vm, b: i64, c: i64) -> i64 {
    let vm = unsafe { &mut *vm };
    value_equals(vm.mem.reg(b as u8), vm.mem.reg(c as u8)) as i64
}

extern "C" fn rt_fmodf(a: f32, b: f32) -> f32 {
    a % b
}

#[cfg(test)]
mod tests {
    use super::*;
    use alkb_bytecode::Insn;

    #[test]
    fn jit_backend_initializes() {
        assert!(Jit::new().is_ok());
    }

    #[test]
    fn observe_crosses_threshold_once() {
        let mut jit = Jit::new().unwrap();
        let key = (0, 3);
        for _ in 0..HOT_THRESHOLD {
            assert!(!jit.observe(key));
        }
        assert!(jit.observe(key));
    }

    #[test]
    fn rejected_sites_stay_cold() {
        let mut jit = Jit::new().unwrap();
        let key = (0, 3);
        jit.reject(key);
        for _ in 0..HOT_THRESHOLD * 2 {
            assert!(!jit.observe(key));
        }
        assert_eq!(jit.stats().regions_rejected, 1);
    }

    #[test]
    fn bad_region_bounds_are_refused() {
        let mut jit = Jit::new().unwrap();
        let func = BoundFunction {
            name: "f".to_string(),
            num_params: 0,
            reg_count: 1,
            consts: Vec::new(),
            code: vec![Insn::abc(Opcode::Ret, 0, 0, 0)],
        };
        assert!(matches!(
            jit.compile_region(&func, 1, 5),
            Err(JitError::BadRegion)
        ));
        assert!(matches!(
            jit.compile_region(&func, 1, 1),
            Err(JitError::BadRegion)
        ));
    }

    #[test]
    fn straight_line_region_compiles() {
        let mut jit = Jit::new().unwrap();
        let func = BoundFunction {
            name: "f".to_string(),
            num_params: 0,
            reg_count: 4,
            consts: vec![crate::value::Value::Int(7)],
            code: vec![
                Insn::abc(Opcode::Nop, 0, 0, 0),
                Insn::abx(Opcode::LoadK, 0, 0),
                Insn::abc(Opcode::Mov, 1, 0, 0),
                Insn::abc(Opcode::AddI, 2, 0, 1),
                Insn::abc(Opcode::LtI, 3, 0, 2),
                Insn::abc(Opcode::Ret, 2, 0, 0),
            ],
        };
        assert!(jit.compile_region(&func, 1, 6).is_ok());
        assert_eq!(jit.stats().regions_compiled, 1);
    }
}
