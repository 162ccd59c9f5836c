//! Per-opcode code generation (everything except the call family)
//!
//! Each generator consumes and produces abstract stack slots on the
//! [`Context`] while emitting machine code, and reports whether the driver
//! should keep going, close the block with an exit, or stop because the
//! generator already ended it. Side exits always restore the state at the
//! *start* of the instruction so the interpreter re-executes it whole.

use crate::asm::x86_64::{mem, Cond, Opnd};
use crate::codegen::{
    gen_check_ints, jit_guard_known_klass, jit_mov_gc_ptr, jit_prepare_routine_call, jump_to_next_insn,
    CodegenStatus, JitState, C_ARG_REGS, REG0, REG1, REG_CFP, REG_EC, REG_SP,
};
use crate::core::context::{Context, InsnOpnd};
use crate::core::types::Type;
use crate::stats::Counter;
use crate::vm::frame::{
    local_index_from_slot, EnvFlags, BLOCK_HANDLER_ISEQ_TAG, BLOCK_HANDLER_TYPE_MASK,
    CFP_OFFSET_EP, CFP_OFFSET_JIT_RETURN, CFP_OFFSET_SELF, CFP_OFFSET_SP, EC_OFFSET_CFP,
    SIZEOF_CFP, VM_ENV_PREV_EP_MASK,
};
use crate::vm::iseq::{constant_serial, IcEntry};
use crate::vm::method::{BasicOp, RedefinitionFlag};
use crate::vm::value::{
    IvarId, Value, FIXNUM_FLAG, OBJ_EMBED_FLAG, OBJ_EMBED_LEN_MAX, QNIL, QTRUE, QUNDEF,
    RBASIC_OFFSET_FLAGS, ROBJECT_OFFSET_AS_ARY, ROBJECT_OFFSET_IVPTR, ROBJECT_OFFSET_NUMIV,
    T_MASK, T_OBJECT,
};
use crate::vm::{block_param_proxy, host_fns};
use crate::Jit;

use CodegenStatus::*;
use InsnOpnd::StackOpnd;

fn fn_addr<T>(f: T) -> *const u8
where
    T: Copy,
{
    // Function pointers are data here: their address gets embedded in code
    debug_assert_eq!(std::mem::size_of::<T>(), 8);
    unsafe { std::mem::transmute_copy::<T, *const u8>(&f) }
}

fn fits_imm32(val: Value) -> bool {
    (val.0 as i64) >= i32::MIN as i64 && (val.0 as i64) <= i32::MAX as i64
}

// ---------------------------------------------------------------------------
// Stack manipulation
// ---------------------------------------------------------------------------

pub(crate) fn gen_pop(_jit: &mut Jit, _state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    ctx.stack_pop(1);
    KeepCompiling
}

pub(crate) fn gen_adjuststack(
    _jit: &mut Jit,
    state: &mut JitState,
    ctx: &mut Context,
) -> CodegenStatus {
    let n = state.operand(0) as u16;
    ctx.stack_pop(n);
    KeepCompiling
}

pub(crate) fn gen_dup(jit: &mut Jit, _state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let mapping = ctx.get_opnd_mapping(StackOpnd(0));
    let ty = ctx.get_opnd_type(StackOpnd(0));
    let src = ctx.stack_opnd(0);
    let dst = ctx.stack_push_mapping(mapping, ty);
    jit.cb.mov(REG0.into(), src.into());
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

pub(crate) fn gen_dupn(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    // The interpreter only emits dupn 2
    if state.operand(0) != 2 {
        return CantCompile;
    }
    let map1 = ctx.get_opnd_mapping(StackOpnd(1));
    let ty1 = ctx.get_opnd_type(StackOpnd(1));
    let map0 = ctx.get_opnd_mapping(StackOpnd(0));
    let ty0 = ctx.get_opnd_type(StackOpnd(0));
    let src1 = ctx.stack_opnd(1);
    let src0 = ctx.stack_opnd(0);

    let dst1 = ctx.stack_push_mapping(map1, ty1);
    jit.cb.mov(REG0.into(), src1.into());
    jit.cb.mov(dst1.into(), REG0.into());
    let dst0 = ctx.stack_push_mapping(map0, ty0);
    jit.cb.mov(REG0.into(), src0.into());
    jit.cb.mov(dst0.into(), REG0.into());
    KeepCompiling
}

pub(crate) fn gen_swap(jit: &mut Jit, _state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let opnd0 = ctx.stack_opnd(0);
    let opnd1 = ctx.stack_opnd(1);
    let map0 = ctx.get_opnd_mapping(StackOpnd(0));
    let ty0 = ctx.get_opnd_type(StackOpnd(0));
    let map1 = ctx.get_opnd_mapping(StackOpnd(1));
    let ty1 = ctx.get_opnd_type(StackOpnd(1));

    jit.cb.mov(REG0.into(), opnd0.into());
    jit.cb.mov(REG1.into(), opnd1.into());
    jit.cb.mov(opnd0.into(), REG1.into());
    jit.cb.mov(opnd1.into(), REG0.into());

    ctx.set_opnd_mapping(StackOpnd(0), map1, ty1);
    ctx.set_opnd_mapping(StackOpnd(1), map0, ty0);
    KeepCompiling
}

pub(crate) fn gen_setn(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let n = state.operand(0) as u16;
    let top = ctx.stack_opnd(0);
    let dst = ctx.stack_opnd(n);
    jit.cb.mov(REG0.into(), top.into());
    jit.cb.mov(dst.into(), REG0.into());

    let mapping = ctx.get_opnd_mapping(StackOpnd(0));
    let ty = ctx.get_opnd_type(StackOpnd(0));
    ctx.set_opnd_mapping(StackOpnd(n), mapping, ty);
    KeepCompiling
}

pub(crate) fn gen_topn(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let n = state.operand(0) as u16;
    let src = ctx.stack_opnd(n);
    let mapping = ctx.get_opnd_mapping(StackOpnd(n));
    let ty = ctx.get_opnd_type(StackOpnd(n));
    let dst = ctx.stack_push_mapping(mapping, ty);
    jit.cb.mov(REG0.into(), src.into());
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

// ---------------------------------------------------------------------------
// Literals and self
// ---------------------------------------------------------------------------

pub(crate) fn gen_putnil(jit: &mut Jit, _state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let dst = ctx.stack_push(Type::Nil);
    jit.cb.mov(dst.into(), Opnd::Imm(QNIL.0 as i64));
    KeepCompiling
}

pub(crate) fn gen_putobject(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let val = Value(state.operand(0));
    let dst = ctx.stack_push(Type::of(val));
    if fits_imm32(val) {
        jit.cb.mov(dst.into(), Opnd::Imm(val.0 as i64));
    } else {
        jit_mov_gc_ptr(jit, state, REG0, val);
        jit.cb.mov(dst.into(), REG0.into());
    }
    KeepCompiling
}

pub(crate) fn gen_putobject_fix(
    jit: &mut Jit,
    _state: &mut JitState,
    ctx: &mut Context,
    n: i64,
) -> CodegenStatus {
    let dst = ctx.stack_push(Type::Fixnum);
    jit.cb.mov(dst.into(), Opnd::Imm(Value::fixnum(n).0 as i64));
    KeepCompiling
}

pub(crate) fn gen_putself(jit: &mut Jit, _state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let dst = ctx.stack_push_self();
    jit.cb.mov(REG0.into(), mem(REG_CFP, CFP_OFFSET_SELF).into());
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

pub(crate) fn gen_putstring(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let lit = Value(state.operand(0));
    jit_prepare_routine_call(jit, state, ctx);
    jit_mov_gc_ptr(jit, state, C_ARG_REGS[0], lit);
    jit.cb.call_ptr(REG0, fn_addr(host_fns().str_resurrect));
    let dst = ctx.stack_push(Type::TString);
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

// ---------------------------------------------------------------------------
// Locals
// ---------------------------------------------------------------------------

pub(crate) fn gen_getlocal_wc0(
    jit: &mut Jit,
    state: &mut JitState,
    ctx: &mut Context,
) -> CodegenStatus {
    let slot = state.operand(0) as u32;
    let local_idx = local_index_from_slot(state.iseq.body().local_table_size, slot);

    jit.cb.mov(REG0.into(), mem(REG_CFP, CFP_OFFSET_EP).into());
    jit.cb.mov(REG0.into(), mem(REG0, -8 * slot as i32).into());
    let dst = ctx.stack_push_local(local_idx as usize);
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

fn gen_getlocal_level(jit: &mut Jit, ctx: &mut Context, slot: u32, level: u32) -> CodegenStatus {
    jit.cb.mov(REG0.into(), mem(REG_CFP, CFP_OFFSET_EP).into());
    for _ in 0..level {
        jit.cb.mov(REG0.into(), mem(REG0, -8).into());
        jit.cb.and_(REG0.into(), Opnd::Imm(!(VM_ENV_PREV_EP_MASK as i64)));
    }
    jit.cb.mov(REG0.into(), mem(REG0, -8 * slot as i32).into());
    // No aliasing across environments
    let dst = ctx.stack_push(Type::Unknown);
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

pub(crate) fn gen_getlocal(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let slot = state.operand(0) as u32;
    let level = state.operand(1) as u32;
    if level == 0 {
        return gen_getlocal_wc0(jit, state, ctx);
    }
    gen_getlocal_level(jit, ctx, slot, level)
}

pub(crate) fn gen_getlocal_wc1(
    jit: &mut Jit,
    state: &mut JitState,
    ctx: &mut Context,
) -> CodegenStatus {
    gen_getlocal_level(jit, ctx, state.operand(0) as u32, 1)
}

pub(crate) fn gen_setlocal_wc0(
    jit: &mut Jit,
    state: &mut JitState,
    ctx: &mut Context,
) -> CodegenStatus {
    let slot = state.operand(0) as u32;
    let local_idx = local_index_from_slot(state.iseq.body().local_table_size, slot);

    // An escaped environment needs the write barrier; let the interpreter
    // handle that store
    let side_exit = state.counted_exit(jit, ctx, Counter::ExitWriteBarrier);
    jit.cb.mov(REG0.into(), mem(REG_CFP, CFP_OFFSET_EP).into());
    jit.cb
        .test(mem(REG0, 0).into(), Opnd::Imm(EnvFlags::WB_REQUIRED.bits() as i64));
    jit.cb.jcc_ptr(Cond::Ne, side_exit);

    ctx.set_local_type(local_idx as usize, ctx.get_opnd_type(StackOpnd(0)));
    let val = ctx.stack_pop(1);
    jit.cb.mov(REG1.into(), val.into());
    jit.cb.mov(mem(REG0, -8 * slot as i32).into(), REG1.into());
    KeepCompiling
}

// ---------------------------------------------------------------------------
// Instance variables
// ---------------------------------------------------------------------------

pub const GET_IVAR_MAX_DEPTH: u8 = 10;

/// Shared ivar-read emitter: used by `getinstancevariable` (on self) and
/// by attr-reader dispatch (on a popped receiver).
pub(crate) fn gen_get_ivar(
    jit: &mut Jit,
    state: &mut JitState,
    ctx: &mut Context,
    comptime_recv: Value,
    ivar_id: IvarId,
    recv_opnd: InsnOpnd,
    max_chain_depth: u8,
) -> CodegenStatus {
    let pops_receiver = matches!(recv_opnd, StackOpnd(_));

    // Shape information only helps for default-allocator objects with a
    // known slot; everything else takes the host call
    let specializable = comptime_recv.is_heap()
        && comptime_recv.rbasic().flags & T_MASK == T_OBJECT
        && comptime_recv
            .class_of()
            .as_rclass()
            .ivar_index_lookup(ivar_id)
            .is_some();

    if !specializable {
        jit_prepare_routine_call(jit, state, ctx);
        match recv_opnd {
            InsnOpnd::SelfOpnd => {
                jit.cb.mov(C_ARG_REGS[0].into(), mem(REG_CFP, CFP_OFFSET_SELF).into())
            }
            StackOpnd(n) => jit.cb.mov(C_ARG_REGS[0].into(), ctx.stack_opnd(n).into()),
        }
        jit.cb.mov(C_ARG_REGS[1].into(), Opnd::Imm(ivar_id.0 as i64));
        jit.cb.call_ptr(REG0, fn_addr(host_fns().ivar_get));
        if pops_receiver {
            ctx.stack_pop(1);
        }
        let dst = ctx.stack_push(Type::Unknown);
        jit.cb.mov(dst.into(), REG0.into());
        return KeepCompiling;
    }

    let side_exit = state.side_exit(jit, ctx);
    let klass = comptime_recv.class_of();
    let index = klass.as_rclass().ivar_index_lookup(ivar_id).unwrap();
    let embedded = comptime_recv.rbasic().flags & OBJ_EMBED_FLAG != 0;

    match recv_opnd {
        InsnOpnd::SelfOpnd => jit.cb.mov(REG0.into(), mem(REG_CFP, CFP_OFFSET_SELF).into()),
        StackOpnd(n) => jit.cb.mov(REG0.into(), ctx.stack_opnd(n).into()),
    }
    jit_guard_known_klass(
        jit,
        state,
        ctx,
        klass,
        recv_opnd,
        REG0.into(),
        comptime_recv,
        max_chain_depth,
        side_exit,
    );

    if embedded && index < OBJ_EMBED_LEN_MAX {
        // Embedded object: the slot lives inline
        jit.cb
            .test(mem(REG0, RBASIC_OFFSET_FLAGS).into(), Opnd::Imm(OBJ_EMBED_FLAG as i64));
        jit.cb.jcc_ptr(Cond::E, side_exit);
        jit.cb
            .mov(REG0.into(), mem(REG0, ROBJECT_OFFSET_AS_ARY + 8 * index as i32).into());
    } else {
        // Extended table: check the slot exists, then double-load
        jit.cb
            .test(mem(REG0, RBASIC_OFFSET_FLAGS).into(), Opnd::Imm(OBJ_EMBED_FLAG as i64));
        jit.cb.jcc_ptr(Cond::Ne, side_exit);
        jit.cb.cmp(mem(REG0, ROBJECT_OFFSET_NUMIV).into(), Opnd::Imm(index as i64));
        jit.cb.jcc_ptr(Cond::Be, side_exit);
        jit.cb.mov(REG0.into(), mem(REG0, ROBJECT_OFFSET_IVPTR).into());
        jit.cb.mov(REG0.into(), mem(REG0, 8 * index as i32).into());
    }

    // Unset slots read as nil
    jit.cb.cmp(REG0.into(), Opnd::Imm(QUNDEF.0 as i64));
    jit.cb.mov(REG1.into(), Opnd::Imm(QNIL.0 as i64));
    jit.cb.cmov(Cond::E, REG0, REG1.into());

    if pops_receiver {
        ctx.stack_pop(1);
    }
    let dst = ctx.stack_push(Type::Unknown);
    jit.cb.mov(dst.into(), REG0.into());

    jump_to_next_insn(jit, state, ctx);
    EndBlock
}

pub(crate) fn gen_getinstancevariable(
    jit: &mut Jit,
    state: &mut JitState,
    ctx: &mut Context,
) -> CodegenStatus {
    if !state.at_current_insn() {
        jit.defer_compilation(state.block, state.blockid(), ctx);
        return EndBlock;
    }
    let ivar_id = IvarId(state.operand(0) as u32);
    let comptime_recv = state.peek_at_self();
    gen_get_ivar(jit, state, ctx, comptime_recv, ivar_id, InsnOpnd::SelfOpnd, GET_IVAR_MAX_DEPTH)
}

pub(crate) fn gen_setinstancevariable(
    jit: &mut Jit,
    state: &mut JitState,
    ctx: &mut Context,
) -> CodegenStatus {
    let ivar_id = state.operand(0);
    jit_prepare_routine_call(jit, state, ctx);
    jit.cb.mov(C_ARG_REGS[0].into(), mem(REG_CFP, CFP_OFFSET_SELF).into());
    jit.cb.mov(C_ARG_REGS[1].into(), Opnd::Imm(ivar_id as i64));
    jit.cb.mov(C_ARG_REGS[2].into(), ctx.stack_opnd(0).into());
    ctx.stack_pop(1);
    jit.cb.call_ptr(REG0, fn_addr(host_fns().setinstancevariable));
    KeepCompiling
}

// ---------------------------------------------------------------------------
// Globals
// ---------------------------------------------------------------------------

pub(crate) fn gen_getglobal(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let gid = state.operand(0);
    jit_prepare_routine_call(jit, state, ctx);
    jit.cb.mov_u64(C_ARG_REGS[0], gid);
    jit.cb.call_ptr(REG0, fn_addr(host_fns().gvar_get));
    let dst = ctx.stack_push(Type::Unknown);
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

pub(crate) fn gen_setglobal(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let gid = state.operand(0);
    jit_prepare_routine_call(jit, state, ctx);
    jit.cb.mov_u64(C_ARG_REGS[0], gid);
    jit.cb.mov(C_ARG_REGS[1].into(), ctx.stack_opnd(0).into());
    ctx.stack_pop(1);
    jit.cb.call_ptr(REG0, fn_addr(host_fns().gvar_set));
    KeepCompiling
}

// ---------------------------------------------------------------------------
// Aggregate literals
// ---------------------------------------------------------------------------

pub(crate) fn gen_newarray(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let n = state.operand(0);
    jit_prepare_routine_call(jit, state, ctx);
    jit.cb.mov(C_ARG_REGS[0].into(), Opnd::Imm(n as i64));
    jit.cb.lea(C_ARG_REGS[1], ctx.sp_opnd(-8 * n as i32));
    jit.cb.call_ptr(REG0, fn_addr(host_fns().ary_new_from_values));
    ctx.stack_pop(n as u16);
    let dst = ctx.stack_push(Type::TArray);
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

pub(crate) fn gen_duparray(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let lit = Value(state.operand(0));
    jit_prepare_routine_call(jit, state, ctx);
    jit_mov_gc_ptr(jit, state, C_ARG_REGS[0], lit);
    jit.cb.call_ptr(REG0, fn_addr(host_fns().ary_resurrect));
    let dst = ctx.stack_push(Type::TArray);
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

pub(crate) fn gen_newhash(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let n = state.operand(0);
    debug_assert!(n % 2 == 0, "newhash takes key/value pairs");
    jit_prepare_routine_call(jit, state, ctx);
    jit.cb.mov(C_ARG_REGS[0].into(), Opnd::Imm(n as i64));
    jit.cb.lea(C_ARG_REGS[1], ctx.sp_opnd(-8 * n as i32));
    jit.cb.call_ptr(REG0, fn_addr(host_fns().hash_new_from_values));
    ctx.stack_pop(n as u16);
    let dst = ctx.stack_push(Type::THash);
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

pub(crate) fn gen_newrange(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let exclusive = state.operand(0);
    // The endpoints may have user-defined comparison
    jit_prepare_routine_call(jit, state, ctx);
    jit.cb.mov(C_ARG_REGS[0].into(), ctx.stack_opnd(1).into());
    jit.cb.mov(C_ARG_REGS[1].into(), ctx.stack_opnd(0).into());
    jit.cb.mov(C_ARG_REGS[2].into(), Opnd::Imm(exclusive as i64));
    jit.cb.call_ptr(REG0, fn_addr(host_fns().range_new));
    ctx.stack_pop(2);
    let dst = ctx.stack_push(Type::Heap);
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

pub(crate) fn gen_splatarray(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let flag = Value(state.operand(0));
    jit_prepare_routine_call(jit, state, ctx);
    jit.cb.mov(C_ARG_REGS[0].into(), Opnd::Imm(flag.0 as i64));
    jit.cb.mov(C_ARG_REGS[1].into(), ctx.stack_opnd(0).into());
    ctx.stack_pop(1);
    jit.cb.call_ptr(REG0, fn_addr(host_fns().splat_array));
    let dst = ctx.stack_push(Type::TArray);
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

pub(crate) fn gen_concatstrings(
    jit: &mut Jit,
    state: &mut JitState,
    ctx: &mut Context,
) -> CodegenStatus {
    let n = state.operand(0);
    jit_prepare_routine_call(jit, state, ctx);
    jit.cb.mov(C_ARG_REGS[0].into(), Opnd::Imm(n as i64));
    jit.cb.lea(C_ARG_REGS[1], ctx.sp_opnd(-8 * n as i32));
    jit.cb.call_ptr(REG0, fn_addr(host_fns().str_concat_literals));
    ctx.stack_pop(n as u16);
    let dst = ctx.stack_push(Type::TString);
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

pub(crate) fn gen_tostring(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    jit_prepare_routine_call(jit, state, ctx);
    jit.cb.mov(C_ARG_REGS[0].into(), ctx.stack_opnd(0).into());
    jit.cb.mov(C_ARG_REGS[1].into(), ctx.stack_opnd(1).into());
    jit.cb.call_ptr(REG0, fn_addr(host_fns().obj_as_string_result));
    ctx.stack_pop(2);
    let dst = ctx.stack_push(Type::TString);
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

pub(crate) fn gen_toregexp(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let opt = state.operand(0) as i64;
    let n = state.operand(1);
    jit_prepare_routine_call(jit, state, ctx);
    // Collect the strings into a temporary array, then build the regexp
    jit.cb.mov(C_ARG_REGS[0].into(), Opnd::Imm(n as i64));
    jit.cb.lea(C_ARG_REGS[1], ctx.sp_opnd(-8 * n as i32));
    jit.cb.call_ptr(REG0, fn_addr(host_fns().ary_tmp_new_from_values));
    jit.cb.mov(C_ARG_REGS[0].into(), REG0.into());
    jit.cb.mov(C_ARG_REGS[1].into(), Opnd::Imm(opt));
    jit.cb.call_ptr(REG0, fn_addr(host_fns().reg_new_ary));
    ctx.stack_pop(n as u16);
    let dst = ctx.stack_push(Type::Heap);
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

pub(crate) fn gen_defined(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let op_type = state.operand(0);
    let obj = Value(state.operand(1));
    let pushval = Value(state.operand(2));

    jit_prepare_routine_call(jit, state, ctx);
    jit.cb.mov(C_ARG_REGS[0].into(), REG_EC.into());
    jit.cb.mov(C_ARG_REGS[1].into(), Opnd::Imm(op_type as i64));
    jit_mov_gc_ptr(jit, state, C_ARG_REGS[2], obj);
    jit_mov_gc_ptr(jit, state, C_ARG_REGS[3], pushval);
    jit.cb.mov(C_ARG_REGS[4].into(), ctx.stack_opnd(0).into());
    ctx.stack_pop(1);
    jit.cb.call_ptr(REG0, fn_addr(host_fns().vm_defined));
    let dst = ctx.stack_push(Type::Unknown);
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

// ---------------------------------------------------------------------------
// Constant cache
// ---------------------------------------------------------------------------

pub(crate) fn gen_opt_getinlinecache(
    jit: &mut Jit,
    state: &mut JitState,
    ctx: &mut Context,
) -> CodegenStatus {
    let jump_offset = state.operand(0) as i64;
    let ic_idx = state.operand(1) as usize;

    let entry: Option<IcEntry> = *state.iseq.body().inline_caches[ic_idx].entry.lock();
    let Some(entry) = entry else {
        // Empty cache; let the interpreter fill it first
        return CantCompile;
    };
    if entry.ic_serial != constant_serial() || entry.cref_sensitive {
        return CantCompile;
    }

    // The cached value is only stable while constants are and while no
    // other ractor can race the cache
    if !jit.assume_single_ractor_mode(state.block) {
        return CantCompile;
    }
    jit.assume_stable_constant_state(state.block);

    let val = entry.value;
    let dst = ctx.stack_push(Type::of(val));
    if fits_imm32(val) {
        jit.cb.mov(dst.into(), Opnd::Imm(val.0 as i64));
    } else {
        jit_mov_gc_ptr(jit, state, REG0, val);
        jit.cb.mov(dst.into(), REG0.into());
    }

    // Skip over the cache-fill instructions
    let jump_idx = (state.next_idx() as i64 + jump_offset) as u32;
    jit.gen_direct_jump(state.block, ctx, crate::core::block::BlockId {
        iseq: state.iseq,
        idx: jump_idx,
    });
    EndBlock
}

// ---------------------------------------------------------------------------
// Block parameter proxy
// ---------------------------------------------------------------------------

pub(crate) fn gen_getblockparamproxy(
    jit: &mut Jit,
    state: &mut JitState,
    ctx: &mut Context,
) -> CodegenStatus {
    let level = state.operand(1);
    if level != 0 {
        return CantCompile;
    }

    let side_exit = state.side_exit(jit, ctx);
    let modified_exit = state.counted_exit(jit, ctx, Counter::ExitBlockParam);

    // A block parameter that was written through is no longer the proxy
    jit.cb.mov(REG0.into(), mem(REG_CFP, CFP_OFFSET_EP).into());
    jit.cb.test(
        mem(REG0, 0).into(),
        Opnd::Imm(EnvFlags::MODIFIED_BLOCK_PARAM.bits() as i64),
    );
    jit.cb.jcc_ptr(Cond::Ne, modified_exit);

    // Only an iseq block handler maps to the proxy
    jit.cb.mov(REG0.into(), mem(REG0, -8).into());
    jit.cb.mov(REG1.into(), REG0.into());
    jit.cb.and_(REG1.into(), Opnd::Imm(BLOCK_HANDLER_TYPE_MASK as i64));
    jit.cb.cmp(REG1.into(), Opnd::Imm(BLOCK_HANDLER_ISEQ_TAG as i64));
    jit.cb.jcc_ptr(Cond::Ne, side_exit);

    let dst = ctx.stack_push(Type::Heap);
    jit_mov_gc_ptr(jit, state, REG0, block_param_proxy());
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

// ---------------------------------------------------------------------------
// Branches
// ---------------------------------------------------------------------------

fn branch_target_indices(state: &JitState) -> (u32, u32, i64) {
    let jump_offset = state.operand(0) as i64;
    let next_idx = state.next_idx();
    let jump_idx = (next_idx as i64 + jump_offset) as u32;
    (jump_idx, next_idx, jump_offset)
}

pub(crate) fn gen_branchif(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let (jump_idx, next_idx, jump_offset) = branch_target_indices(state);
    if jump_offset < 0 {
        let exit = state.counted_exit(jit, ctx, Counter::ExitInterrupt);
        gen_check_ints(jit, exit);
    }

    let val_type = ctx.get_opnd_type(StackOpnd(0));
    let val = ctx.stack_pop(1);
    let jump_block = crate::core::block::BlockId { iseq: state.iseq, idx: jump_idx };
    let next_block = crate::core::block::BlockId { iseq: state.iseq, idx: next_idx };

    match val_type.known_truthy() {
        Some(true) => {
            jit.gen_direct_jump(state.block, ctx, jump_block);
        }
        Some(false) => {
            jit.gen_direct_jump(state.block, ctx, next_block);
        }
        None => {
            jit.cb.test(val.into(), Opnd::Imm(!(QNIL.0 as i64)));
            jit.gen_branch(state.block, Cond::Ne, jump_block, ctx, next_block, ctx);
        }
    }
    EndBlock
}

pub(crate) fn gen_branchunless(
    jit: &mut Jit,
    state: &mut JitState,
    ctx: &mut Context,
) -> CodegenStatus {
    let (jump_idx, next_idx, jump_offset) = branch_target_indices(state);
    if jump_offset < 0 {
        let exit = state.counted_exit(jit, ctx, Counter::ExitInterrupt);
        gen_check_ints(jit, exit);
    }

    let val_type = ctx.get_opnd_type(StackOpnd(0));
    let val = ctx.stack_pop(1);
    let jump_block = crate::core::block::BlockId { iseq: state.iseq, idx: jump_idx };
    let next_block = crate::core::block::BlockId { iseq: state.iseq, idx: next_idx };

    match val_type.known_truthy() {
        Some(true) => {
            jit.gen_direct_jump(state.block, ctx, next_block);
        }
        Some(false) => {
            jit.gen_direct_jump(state.block, ctx, jump_block);
        }
        None => {
            jit.cb.test(val.into(), Opnd::Imm(!(QNIL.0 as i64)));
            jit.gen_branch(state.block, Cond::E, jump_block, ctx, next_block, ctx);
        }
    }
    EndBlock
}

pub(crate) fn gen_branchnil(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let (jump_idx, next_idx, jump_offset) = branch_target_indices(state);
    if jump_offset < 0 {
        let exit = state.counted_exit(jit, ctx, Counter::ExitInterrupt);
        gen_check_ints(jit, exit);
    }

    let val_type = ctx.get_opnd_type(StackOpnd(0));
    let val = ctx.stack_pop(1);
    let jump_block = crate::core::block::BlockId { iseq: state.iseq, idx: jump_idx };
    let next_block = crate::core::block::BlockId { iseq: state.iseq, idx: next_idx };

    if val_type == Type::Nil {
        jit.gen_direct_jump(state.block, ctx, jump_block);
    } else if !matches!(val_type, Type::Unknown | Type::UnknownImm) {
        jit.gen_direct_jump(state.block, ctx, next_block);
    } else {
        jit.cb.cmp(val.into(), Opnd::Imm(QNIL.0 as i64));
        jit.gen_branch(state.block, Cond::E, jump_block, ctx, next_block, ctx);
    }
    EndBlock
}

pub(crate) fn gen_jump(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let (jump_idx, _, jump_offset) = branch_target_indices(state);
    if jump_offset < 0 {
        let exit = state.counted_exit(jit, ctx, Counter::ExitInterrupt);
        gen_check_ints(jit, exit);
    }
    jit.gen_direct_jump(state.block, ctx, crate::core::block::BlockId {
        iseq: state.iseq,
        idx: jump_idx,
    });
    EndBlock
}

// ---------------------------------------------------------------------------
// Fixnum arithmetic and comparisons
// ---------------------------------------------------------------------------

/// Guard that both top stack operands carry the fixnum tag. Refuses when
/// either is known to be something else.
fn guard_two_fixnums(jit: &mut Jit, ctx: &mut Context, side_exit: crate::asm::CodePtr) -> bool {
    for n in [1u16, 0] {
        match ctx.get_opnd_type(StackOpnd(n)) {
            Type::Fixnum => {}
            Type::Unknown | Type::UnknownImm => {
                jit.cb
                    .test(ctx.stack_opnd(n).into(), Opnd::Imm(FIXNUM_FLAG as i64));
                jit.cb.jcc_ptr(Cond::E, side_exit);
                ctx.upgrade_opnd_type(StackOpnd(n), Type::Fixnum);
            }
            _ => return false,
        }
    }
    true
}

pub(crate) fn gen_opt_plus(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    if !jit.assume_bop_not_redefined(state.block, RedefinitionFlag::Integer, BasicOp::Plus) {
        return CantCompile;
    }
    let side_exit = state.side_exit(jit, ctx);
    if !guard_two_fixnums(jit, ctx, side_exit) {
        return CantCompile;
    }
    let overflow_exit = state.counted_exit(jit, ctx, Counter::ExitOverflow);

    let arg1 = ctx.stack_opnd(0);
    let arg0 = ctx.stack_opnd(1);
    // Un-tag one operand so the tags add back to one
    jit.cb.mov(REG0.into(), arg0.into());
    jit.cb.sub(REG0.into(), Opnd::Imm(1));
    jit.cb.add(REG0.into(), arg1.into());
    jit.cb.jcc_ptr(Cond::O, overflow_exit);

    ctx.stack_pop(2);
    let dst = ctx.stack_push(Type::Fixnum);
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

pub(crate) fn gen_opt_minus(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    if !jit.assume_bop_not_redefined(state.block, RedefinitionFlag::Integer, BasicOp::Minus) {
        return CantCompile;
    }
    let side_exit = state.side_exit(jit, ctx);
    if !guard_two_fixnums(jit, ctx, side_exit) {
        return CantCompile;
    }
    let overflow_exit = state.counted_exit(jit, ctx, Counter::ExitOverflow);

    let arg1 = ctx.stack_opnd(0);
    let arg0 = ctx.stack_opnd(1);
    // The tags cancel; put the result tag back
    jit.cb.mov(REG0.into(), arg0.into());
    jit.cb.sub(REG0.into(), arg1.into());
    jit.cb.jcc_ptr(Cond::O, overflow_exit);
    jit.cb.add(REG0.into(), Opnd::Imm(1));

    ctx.stack_pop(2);
    let dst = ctx.stack_push(Type::Fixnum);
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

fn gen_fixnum_bitop(
    jit: &mut Jit,
    state: &mut JitState,
    ctx: &mut Context,
    op: BasicOp,
) -> CodegenStatus {
    if !jit.assume_bop_not_redefined(state.block, RedefinitionFlag::Integer, op) {
        return CantCompile;
    }
    let side_exit = state.side_exit(jit, ctx);
    if !guard_two_fixnums(jit, ctx, side_exit) {
        return CantCompile;
    }

    let arg1 = ctx.stack_opnd(0);
    let arg0 = ctx.stack_opnd(1);
    jit.cb.mov(REG0.into(), arg0.into());
    match op {
        // Both tags survive an AND; an OR keeps the single shared tag bit
        BasicOp::And => jit.cb.and_(REG0.into(), arg1.into()),
        BasicOp::Or => jit.cb.or_(REG0.into(), arg1.into()),
        _ => unreachable!("not a fixnum bitop"),
    }

    ctx.stack_pop(2);
    let dst = ctx.stack_push(Type::Fixnum);
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

pub(crate) fn gen_opt_and(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    gen_fixnum_bitop(jit, state, ctx, BasicOp::And)
}

pub(crate) fn gen_opt_or(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    gen_fixnum_bitop(jit, state, ctx, BasicOp::Or)
}

pub(crate) fn gen_fixnum_cmp(
    jit: &mut Jit,
    state: &mut JitState,
    ctx: &mut Context,
    cond: Cond,
) -> CodegenStatus {
    let op = match cond {
        Cond::L => BasicOp::Lt,
        Cond::Le => BasicOp::Le,
        Cond::G => BasicOp::Gt,
        Cond::Ge => BasicOp::Ge,
        _ => unreachable!("not a comparison condition"),
    };
    if !jit.assume_bop_not_redefined(state.block, RedefinitionFlag::Integer, op) {
        return CantCompile;
    }
    let side_exit = state.side_exit(jit, ctx);
    if !guard_two_fixnums(jit, ctx, side_exit) {
        return CantCompile;
    }

    let arg1 = ctx.stack_opnd(0);
    let arg0 = ctx.stack_opnd(1);
    jit.cb.mov(REG0.into(), arg0.into());
    jit.cb.cmp(REG0.into(), arg1.into());
    jit.cb.mov(REG0.into(), Opnd::Imm(0)); // Qfalse
    jit.cb.mov(REG1.into(), Opnd::Imm(QTRUE.0 as i64));
    jit.cb.cmov(cond, REG0, REG1.into());

    ctx.stack_pop(2);
    let dst = ctx.stack_push(Type::UnknownImm);
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

pub(crate) fn gen_opt_mod(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    // The helper may allocate on bignum promotion
    jit_prepare_routine_call(jit, state, ctx);
    let side_exit = state.counted_exit(jit, ctx, Counter::ExitOptHelperUndef);

    jit.cb.mov(C_ARG_REGS[0].into(), ctx.stack_opnd(1).into());
    jit.cb.mov(C_ARG_REGS[1].into(), ctx.stack_opnd(0).into());
    jit.cb.call_ptr(REG0, fn_addr(host_fns().opt_mod));
    // Qundef means the interpreter's fast path refused; retry over there
    jit.cb.cmp(REG0.into(), Opnd::Imm(QUNDEF.0 as i64));
    jit.cb.jcc_ptr(Cond::E, side_exit);

    ctx.stack_pop(2);
    let dst = ctx.stack_push(Type::Unknown);
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

pub(crate) fn gen_opt_aset(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    jit_prepare_routine_call(jit, state, ctx);
    let side_exit = state.counted_exit(jit, ctx, Counter::ExitOptHelperUndef);

    jit.cb.mov(C_ARG_REGS[0].into(), ctx.stack_opnd(2).into());
    jit.cb.mov(C_ARG_REGS[1].into(), ctx.stack_opnd(1).into());
    jit.cb.mov(C_ARG_REGS[2].into(), ctx.stack_opnd(0).into());
    jit.cb.call_ptr(REG0, fn_addr(host_fns().opt_aset));
    jit.cb.cmp(REG0.into(), Opnd::Imm(QUNDEF.0 as i64));
    jit.cb.jcc_ptr(Cond::E, side_exit);

    ctx.stack_pop(3);
    let dst = ctx.stack_push(Type::Unknown);
    jit.cb.mov(dst.into(), REG0.into());
    KeepCompiling
}

// ---------------------------------------------------------------------------
// Equality and indexing, specialized on observed operands
// ---------------------------------------------------------------------------

/// Shared emitter for `opt_eq`/`opt_neq`: specialize two-fixnum and
/// two-string comparisons, with the result inverted for `!=`. Anything
/// else delegates to a full send.
fn gen_equality_specialized(
    jit: &mut Jit,
    state: &mut JitState,
    ctx: &mut Context,
    negate: bool,
) -> CodegenStatus {
    if !state.at_current_insn() {
        jit.defer_compilation(state.block, state.blockid(), ctx);
        return EndBlock;
    }

    let comptime_a = state.peek_at_stack(1);
    let comptime_b = state.peek_at_stack(0);
    let core = crate::vm::value::core_classes();

    if comptime_a.is_fixnum() && comptime_b.is_fixnum() {
        // `!=` additionally rides on the default negation of `==`
        if !jit.assume_bop_not_redefined(state.block, RedefinitionFlag::Integer, BasicOp::Eq) {
            return CantCompile;
        }
        if negate
            && !jit.assume_bop_not_redefined(state.block, RedefinitionFlag::Integer, BasicOp::Neq)
        {
            return CantCompile;
        }
        let side_exit = state.side_exit(jit, ctx);
        if !guard_two_fixnums(jit, ctx, side_exit) {
            return CantCompile;
        }

        let arg1 = ctx.stack_opnd(0);
        let arg0 = ctx.stack_opnd(1);
        jit.cb.mov(REG0.into(), arg0.into());
        jit.cb.cmp(REG0.into(), arg1.into());
        jit.cb.mov(REG0.into(), Opnd::Imm(0));
        jit.cb.mov(REG1.into(), Opnd::Imm(QTRUE.0 as i64));
        jit.cb.cmov(if negate { Cond::Ne } else { Cond::E }, REG0, REG1.into());

        ctx.stack_pop(2);
        let dst = ctx.stack_push(Type::UnknownImm);
        jit.cb.mov(dst.into(), REG0.into());
        jump_to_next_insn(jit, state, ctx);
        return EndBlock;
    }

    if comptime_a.class_of() == core.string && comptime_b.class_of() == core.string {
        if !jit.assume_bop_not_redefined(state.block, RedefinitionFlag::String, BasicOp::Eq) {
            return CantCompile;
        }
        if negate
            && !jit.assume_bop_not_redefined(state.block, RedefinitionFlag::String, BasicOp::Neq)
        {
            return CantCompile;
        }
        let side_exit = state.side_exit(jit, ctx);
        jit.cb.mov(REG0.into(), ctx.stack_opnd(1).into());
        jit_guard_known_klass(
            jit, state, ctx, core.string, StackOpnd(1), REG0.into(), comptime_a, 2, side_exit,
        );
        jit.cb.mov(REG0.into(), ctx.stack_opnd(0).into());
        jit_guard_known_klass(
            jit, state, ctx, core.string, StackOpnd(0), REG0.into(), comptime_b, 2, side_exit,
        );

        jit.cb.mov(C_ARG_REGS[0].into(), ctx.stack_opnd(1).into());
        jit.cb.mov(C_ARG_REGS[1].into(), ctx.stack_opnd(0).into());
        jit.cb.call_ptr(REG0, fn_addr(host_fns().str_eql_internal));
        if negate {
            // Flip the helper's Qtrue/Qfalse
            jit.cb.cmp(REG0.into(), Opnd::Imm(0));
            jit.cb.mov(REG0.into(), Opnd::Imm(0));
            jit.cb.mov(REG1.into(), Opnd::Imm(QTRUE.0 as i64));
            jit.cb.cmov(Cond::E, REG0, REG1.into());
        }

        ctx.stack_pop(2);
        let dst = ctx.stack_push(Type::UnknownImm);
        jit.cb.mov(dst.into(), REG0.into());
        jump_to_next_insn(jit, state, ctx);
        return EndBlock;
    }

    crate::codegen::send::gen_opt_send_without_block(jit, state, ctx)
}

pub(crate) fn gen_opt_eq(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    gen_equality_specialized(jit, state, ctx, false)
}

pub(crate) fn gen_opt_neq(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    gen_equality_specialized(jit, state, ctx, true)
}

pub(crate) fn gen_opt_aref(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let ci = state.iseq.body().call_infos[state.operand(0) as usize];
    if ci.argc != 1 {
        return crate::codegen::send::gen_opt_send_without_block(jit, state, ctx);
    }
    if !state.at_current_insn() {
        jit.defer_compilation(state.block, state.blockid(), ctx);
        return EndBlock;
    }

    let comptime_recv = state.peek_at_stack(1);
    let comptime_idx = state.peek_at_stack(0);
    let core = crate::vm::value::core_classes();

    if comptime_recv.is_heap() && comptime_recv.class_of() == core.array && comptime_idx.is_fixnum()
    {
        if !jit.assume_bop_not_redefined(state.block, RedefinitionFlag::Array, BasicOp::Aref) {
            return CantCompile;
        }
        let side_exit = state.side_exit(jit, ctx);
        jit.cb.mov(REG0.into(), ctx.stack_opnd(1).into());
        jit_guard_known_klass(
            jit, state, ctx, core.array, StackOpnd(1), REG0.into(), comptime_recv, 2, side_exit,
        );
        if ctx.get_opnd_type(StackOpnd(0)) != Type::Fixnum {
            jit.cb.test(ctx.stack_opnd(0).into(), Opnd::Imm(FIXNUM_FLAG as i64));
            jit.cb.jcc_ptr(Cond::E, side_exit);
            ctx.upgrade_opnd_type(StackOpnd(0), Type::Fixnum);
        }

        jit.cb.mov(C_ARG_REGS[0].into(), ctx.stack_opnd(1).into());
        jit.cb.mov(C_ARG_REGS[1].into(), ctx.stack_opnd(0).into());
        jit.cb.sar(C_ARG_REGS[1], 1);
        jit.cb.call_ptr(REG0, fn_addr(host_fns().ary_entry_internal));

        ctx.stack_pop(2);
        let dst = ctx.stack_push(Type::Unknown);
        jit.cb.mov(dst.into(), REG0.into());
        jump_to_next_insn(jit, state, ctx);
        return EndBlock;
    }

    if comptime_recv.is_heap() && comptime_recv.class_of() == core.hash {
        if !jit.assume_bop_not_redefined(state.block, RedefinitionFlag::Hash, BasicOp::Aref) {
            return CantCompile;
        }
        let side_exit = state.side_exit(jit, ctx);
        jit.cb.mov(REG0.into(), ctx.stack_opnd(1).into());
        jit_guard_known_klass(
            jit, state, ctx, core.hash, StackOpnd(1), REG0.into(), comptime_recv, 2, side_exit,
        );

        // Key lookup may invoke user `hash`/`eql?`
        jit_prepare_routine_call(jit, state, ctx);
        jit.cb.mov(C_ARG_REGS[0].into(), ctx.stack_opnd(1).into());
        jit.cb.mov(C_ARG_REGS[1].into(), ctx.stack_opnd(0).into());
        jit.cb.call_ptr(REG0, fn_addr(host_fns().hash_aref));

        ctx.stack_pop(2);
        let dst = ctx.stack_push(Type::Unknown);
        jit.cb.mov(dst.into(), REG0.into());
        jump_to_next_insn(jit, state, ctx);
        return EndBlock;
    }

    crate::codegen::send::gen_opt_send_without_block(jit, state, ctx)
}

// ---------------------------------------------------------------------------
// Return
// ---------------------------------------------------------------------------

pub(crate) fn gen_leave(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    debug_assert_eq!(ctx.stack_size, 1, "leave expects exactly the return value");

    let exit = state.counted_exit(jit, ctx, Counter::ExitInterrupt);
    gen_check_ints(jit, exit);

    let retval = ctx.stack_pop(1);
    jit.cb.mov(REG0.into(), retval.into());

    // Pop this frame and land on the caller's
    jit.cb.add(REG_CFP.into(), Opnd::Imm(SIZEOF_CFP as i64));
    jit.cb.mov(mem(REG_EC, EC_OFFSET_CFP).into(), REG_CFP.into());

    // The caller's stored SP points where the return value belongs
    jit.cb.mov(REG_SP.into(), mem(REG_CFP, CFP_OFFSET_SP).into());
    jit.cb.mov(mem(REG_SP, 0).into(), REG0.into());

    // Resume wherever the popped frame said compiled code continues
    jit.cb
        .jmp_mem(mem(REG_CFP, CFP_OFFSET_JIT_RETURN - SIZEOF_CFP));
    EndBlock
}

