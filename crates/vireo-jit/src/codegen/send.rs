//! Method dispatch
//!
//! Every call opcode funnels through the same pipeline: refuse complex
//! call shapes, observe the receiver on a deferred compile, guard its
//! class (growing a chain per polymorphic receiver), resolve and pin the
//! method entry, then specialize per definition kind. Interpreted callees
//! get a real frame and a direct jump into their own compiled entry; C
//! functions get a C frame and a native call with a tracing patch point at
//! the return address; attribute readers collapse into an ivar load.

use std::sync::Arc;

use crate::asm::x86_64::{mem, Cond, Opnd};
use crate::codegen::opcodes::{gen_get_ivar, GET_IVAR_MAX_DEPTH};
use crate::codegen::{
    gen_check_ints, jit_guard_known_klass, jit_mov_gc_ptr, jit_save_pc, jit_save_sp,
    jump_to_next_insn, CodegenStatus, JitState, C_ARG_REGS, REG0, REG1, REG_CFP, REG_EC, REG_SP,
};
use crate::core::block::BlockId;
use crate::core::context::{Context, InsnOpnd::StackOpnd};
use crate::core::types::Type;
use crate::stats::{incr_counter, Counter};
use crate::vm::frame::{
    EnvFlags, BLOCK_HANDLER_ISEQ_TAG, CFP_OFFSET_BLOCK_CODE, CFP_OFFSET_BP, CFP_OFFSET_EP,
    CFP_OFFSET_ISEQ, CFP_OFFSET_JIT_RETURN, CFP_OFFSET_PC, CFP_OFFSET_SELF, CFP_OFFSET_SP,
    EC_OFFSET_CFP, SIZEOF_CFP,
};
use crate::vm::iseq::{IseqPtr, ParamFlags};
use crate::vm::method::{
    callable_method_entry, resolve_alias, CFunc, CallFlags, CallInfo, MethodDef, MethodEntry,
    Visibility,
};
use crate::vm::value::{QNIL, T_ICLASS, T_MASK};
use crate::Jit;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use CodegenStatus::*;

/// Receiver-class guard chains at call sites stop growing here.
pub const SEND_MAX_DEPTH: u8 = 5;

fn fn_addr<T: Copy>(f: T) -> *const u8 {
    debug_assert_eq!(std::mem::size_of::<T>(), 8);
    unsafe { std::mem::transmute_copy::<T, *const u8>(&f) }
}

// ---------------------------------------------------------------------------
// Specialized C-method codegens, keyed by method definition serial
// ---------------------------------------------------------------------------

/// Hand-written fast paths for a few core C methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CFuncCodegen {
    /// `BasicObject#!`: logical negation of truthiness
    NotOp,
    /// `NilClass#nil?` and friends: the guard already proved the answer
    AlwaysTrue,
    /// `Kernel#eql?`, `Module#==`, `Symbol#==`: object identity
    IdentityEqual,
}

static CFUNC_CODEGENS: Lazy<Mutex<FxHashMap<u64, CFuncCodegen>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

/// Register a specialized codegen for a C method. The host calls this for
/// the handful of core methods worth open-coding.
pub fn register_cfunc_codegen(me: &Arc<MethodEntry>, kind: CFuncCodegen) {
    CFUNC_CODEGENS.lock().insert(me.serial, kind);
}

fn lookup_cfunc_codegen(serial: u64) -> Option<CFuncCodegen> {
    CFUNC_CODEGENS.lock().get(&serial).copied()
}

/// Attempt the specialized emit. Returns false to fall back to the
/// generic cfunc path.
fn gen_specialized_cfunc(
    jit: &mut Jit,
    ctx: &mut Context,
    kind: CFuncCodegen,
    argc: u32,
) -> bool {
    match kind {
        CFuncCodegen::NotOp => {
            if argc != 0 {
                return false;
            }
            let recv = ctx.stack_opnd(0);
            jit.cb.test(recv.into(), Opnd::Imm(!(QNIL.0 as i64)));
            jit.cb.mov(REG0.into(), Opnd::Imm(0));
            jit.cb.mov(REG1.into(), Opnd::Imm(crate::vm::value::QTRUE.0 as i64));
            jit.cb.cmov(Cond::E, REG0, REG1.into());
            ctx.stack_pop(1);
            let dst = ctx.stack_push(Type::UnknownImm);
            jit.cb.mov(dst.into(), REG0.into());
            true
        }
        CFuncCodegen::AlwaysTrue => {
            if argc != 0 {
                return false;
            }
            ctx.stack_pop(1);
            let dst = ctx.stack_push(Type::True);
            jit.cb.mov(dst.into(), Opnd::Imm(crate::vm::value::QTRUE.0 as i64));
            true
        }
        CFuncCodegen::IdentityEqual => {
            if argc != 1 {
                return false;
            }
            jit.cb.mov(REG0.into(), ctx.stack_opnd(1).into());
            jit.cb.cmp(REG0.into(), ctx.stack_opnd(0).into());
            jit.cb.mov(REG0.into(), Opnd::Imm(0));
            jit.cb.mov(REG1.into(), Opnd::Imm(crate::vm::value::QTRUE.0 as i64));
            jit.cb.cmov(Cond::E, REG0, REG1.into());
            ctx.stack_pop(2);
            let dst = ctx.stack_push(Type::UnknownImm);
            jit.cb.mov(dst.into(), REG0.into());
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points from the dispatch table
// ---------------------------------------------------------------------------

pub(crate) fn gen_opt_send_without_block(
    jit: &mut Jit,
    state: &mut JitState,
    ctx: &mut Context,
) -> CodegenStatus {
    let ci = state.iseq.body().call_infos[state.operand(0) as usize];
    gen_send_general(jit, state, ctx, ci, None)
}

pub(crate) fn gen_send(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let ci = state.iseq.body().call_infos[state.operand(0) as usize];
    let block_word = state.operand(1);
    let block_iseq =
        if block_word == 0 { None } else { Some(IseqPtr(block_word as *const crate::vm::iseq::Iseq)) };
    gen_send_general(jit, state, ctx, ci, block_iseq)
}

fn gen_send_general(
    jit: &mut Jit,
    state: &mut JitState,
    ctx: &mut Context,
    ci: CallInfo,
    block_iseq: Option<IseqPtr>,
) -> CodegenStatus {
    // Only simple call shapes take the fast path
    if ci.flags.contains(CallFlags::KW_SPLAT) || ci.flags.contains(CallFlags::KWARG) {
        incr_counter(Counter::SendKeywords);
        return CantCompile;
    }
    if ci.flags.contains(CallFlags::ARGS_SPLAT) {
        incr_counter(Counter::SendSplat);
        return CantCompile;
    }
    if ci.flags.contains(CallFlags::ARGS_BLOCKARG) {
        incr_counter(Counter::SendBlockArg);
        return CantCompile;
    }

    // Specialize on the live receiver
    if !state.at_current_insn() {
        jit.defer_compilation(state.block, state.blockid(), ctx);
        return EndBlock;
    }

    let argc = ci.argc;
    let recv_idx = argc as u16;
    let comptime_recv = state.peek_at_stack(recv_idx as isize);
    let comptime_klass = comptime_recv.class_of();

    let side_exit = state.side_exit(jit, ctx);
    jit.cb.mov(REG0.into(), ctx.stack_opnd(recv_idx).into());
    jit_guard_known_klass(
        jit,
        state,
        ctx,
        comptime_klass,
        StackOpnd(recv_idx),
        REG0.into(),
        comptime_recv,
        SEND_MAX_DEPTH,
        side_exit,
    );

    let Some(me) = callable_method_entry(comptime_klass, ci.mid) else {
        // NoMethodError territory; the interpreter raises it
        return CantCompile;
    };
    jit.assume_method_lookup_stable(state.block, comptime_klass, ci.mid);
    jit.block_mut(state.block).cme_refs.push(me.clone());

    match me.visibility {
        Visibility::Public => {}
        Visibility::Private => {
            // Only receiver-less call sites reach private methods
            if !ci.flags.contains(CallFlags::FCALL) {
                return CantCompile;
            }
        }
        Visibility::Protected => {
            // self must be an instance of the defining class
            jit.cb
                .mov(C_ARG_REGS[0].into(), mem(REG_CFP, CFP_OFFSET_SELF).into());
            jit_mov_gc_ptr(jit, state, C_ARG_REGS[1], me.defined_class);
            jit.cb
                .call_ptr(REG0, fn_addr(crate::vm::host_fns().obj_is_kind_of));
            jit.cb.test(REG0.into(), REG0.into());
            jit.cb.jcc_ptr(Cond::E, side_exit);
        }
    }

    // Aliases dispatch as their original definition
    let me = resolve_alias(&me);
    match &me.def {
        MethodDef::Iseq(iseq) => {
            let iseq = *iseq;
            gen_send_iseq(jit, state, ctx, ci, block_iseq, &me, iseq)
        }
        MethodDef::Cfunc(cfunc) => {
            let cfunc = *cfunc;
            gen_send_cfunc(jit, state, ctx, ci, block_iseq, &me, cfunc)
        }
        MethodDef::AttrReader(ivar_id) => {
            if argc != 0 {
                return CantCompile;
            }
            let ivar_id = *ivar_id;
            gen_get_ivar(jit, state, ctx, comptime_recv, ivar_id, StackOpnd(0), GET_IVAR_MAX_DEPTH)
        }
        _ => {
            incr_counter(Counter::SendUnsupportedDef);
            CantCompile
        }
    }
}

// ---------------------------------------------------------------------------
// Interpreted callees
// ---------------------------------------------------------------------------

fn gen_send_iseq(
    jit: &mut Jit,
    state: &mut JitState,
    ctx: &mut Context,
    ci: CallInfo,
    block_iseq: Option<IseqPtr>,
    me: &Arc<MethodEntry>,
    iseq: IseqPtr,
) -> CodegenStatus {
    let body = iseq.body();
    let param = &body.param;
    let argc = ci.argc;

    if ci.flags.contains(CallFlags::TAILCALL) {
        return CantCompile;
    }
    if param.flags.intersects(
        ParamFlags::HAS_REST | ParamFlags::HAS_POST | ParamFlags::HAS_KW | ParamFlags::HAS_KWREST
            | ParamFlags::HAS_BLOCK,
    ) {
        return CantCompile;
    }

    // Arity regimes: exact lead, or lead plus a run of optionals with the
    // start PC taken from the opt table
    let lead = param.lead_num;
    let start_idx = if param.flags.contains(ParamFlags::HAS_OPT) {
        if argc < lead || argc > lead + param.opt_num {
            incr_counter(Counter::SendArityMiss);
            return CantCompile;
        }
        param.opt_table[(argc - lead) as usize]
    } else {
        if argc != lead {
            incr_counter(Counter::SendArityMiss);
            return CantCompile;
        }
        0
    };

    // A leaf body that just delegates to a builtin gets called directly,
    // no frame at all
    if block_iseq.is_none() && !param.flags.contains(ParamFlags::HAS_OPT) {
        if let Some(builtin) = iseq.leaf_builtin() {
            if builtin.argc == argc && (builtin.argc + 1) as usize <= C_ARG_REGS.len() {
                jit.cb
                    .mov(C_ARG_REGS[0].into(), ctx.stack_opnd(argc as u16).into());
                for i in 0..argc {
                    jit.cb.mov(
                        C_ARG_REGS[(1 + i) as usize].into(),
                        ctx.stack_opnd((argc - 1 - i) as u16).into(),
                    );
                }
                jit.cb.call_ptr(REG0, builtin.func);
                ctx.stack_pop((argc + 1) as u16);
                let dst = ctx.stack_push(Type::Unknown);
                jit.cb.mov(dst.into(), REG0.into());
                return KeepCompiling;
            }
        }
    }

    let side_exit = state.side_exit(jit, ctx);

    // Stack overflow check: room for the callee's locals, its worst-case
    // stack, and two frames of headroom
    let headroom = 8 * (body.local_table_size + body.stack_max) as i32 + 2 * SIZEOF_CFP;
    jit.cb.lea(REG0, ctx.sp_opnd(headroom));
    jit.cb.cmp(REG_CFP.into(), REG0.into());
    jit.cb.jcc_ptr(Cond::Be, side_exit);

    // The caller resumes after this instruction, with recv and args gone
    let next_pc = state.iseq.pc_at(state.next_idx());
    jit.cb.mov_u64(REG0, next_pc as u64);
    jit.cb.mov(mem(REG_CFP, CFP_OFFSET_PC).into(), REG0.into());
    jit.cb.lea(REG0, ctx.sp_opnd(-8 * (argc + 1) as i32));
    jit.cb.mov(mem(REG_CFP, CFP_OFFSET_SP).into(), REG0.into());

    // Locals the caller didn't pass start out nil
    let num_extra = (body.local_table_size - param.size) as i32;
    for i in 0..num_extra {
        jit.cb.mov(ctx.sp_opnd(8 * i).into(), Opnd::Imm(QNIL.0 as i64));
    }

    // Environment data: method entry, block handler, frame flags
    let me_ptr = Arc::as_ptr(me) as u64;
    jit.cb.mov_u64(REG0, me_ptr);
    jit.cb.mov(ctx.sp_opnd(8 * num_extra).into(), REG0.into());
    match block_iseq {
        Some(bi) => {
            jit.cb.mov_u64(REG0, bi.0 as u64 | BLOCK_HANDLER_ISEQ_TAG);
            jit.cb.mov(ctx.sp_opnd(8 * (num_extra + 1)).into(), REG0.into());
        }
        None => {
            jit.cb.mov(ctx.sp_opnd(8 * (num_extra + 1)).into(), Opnd::Imm(0));
        }
    }
    let frame_flags = (EnvFlags::FRAME_METHOD | EnvFlags::LOCAL).bits();
    jit.cb
        .mov(ctx.sp_opnd(8 * (num_extra + 2)).into(), Opnd::Imm(frame_flags as i64));

    // Build the callee frame one slot down in the frame array
    jit.cb.lea(REG0, ctx.sp_opnd(8 * (num_extra + 3)));
    jit.cb.mov(mem(REG_CFP, CFP_OFFSET_SP - SIZEOF_CFP).into(), REG0.into());
    jit.cb.mov(mem(REG_CFP, CFP_OFFSET_BP - SIZEOF_CFP).into(), REG0.into());
    jit.cb.lea(REG1, mem(REG0, -8));
    jit.cb.mov(mem(REG_CFP, CFP_OFFSET_EP - SIZEOF_CFP).into(), REG1.into());
    jit.cb.mov_u64(REG1, iseq.0 as u64);
    jit.cb.mov(mem(REG_CFP, CFP_OFFSET_ISEQ - SIZEOF_CFP).into(), REG1.into());
    jit.cb.mov(REG1.into(), ctx.stack_opnd(argc as u16).into());
    jit.cb.mov(mem(REG_CFP, CFP_OFFSET_SELF - SIZEOF_CFP).into(), REG1.into());
    jit.cb.mov_u64(REG1, iseq.pc_at(start_idx) as u64);
    jit.cb.mov(mem(REG_CFP, CFP_OFFSET_PC - SIZEOF_CFP).into(), REG1.into());
    match block_iseq {
        Some(bi) => {
            jit.cb.mov_u64(REG1, bi.0 as u64);
            jit.cb
                .mov(mem(REG_CFP, CFP_OFFSET_BLOCK_CODE - SIZEOF_CFP).into(), REG1.into());
        }
        None => {
            jit.cb
                .mov(mem(REG_CFP, CFP_OFFSET_BLOCK_CODE - SIZEOF_CFP).into(), Opnd::Imm(0));
        }
    }
    jit.cb
        .mov(mem(REG_CFP, CFP_OFFSET_JIT_RETURN - SIZEOF_CFP).into(), Opnd::Imm(0));

    // Switch into the callee: REG_SP at its stack base, REG_CFP pushed
    jit.cb.mov(REG_SP.into(), REG0.into());
    jit.cb.sub(REG_CFP.into(), Opnd::Imm(SIZEOF_CFP as i64));
    jit.cb.mov(mem(REG_EC, EC_OFFSET_CFP).into(), REG_CFP.into());

    // When the callee leaves it resumes at our next instruction, with the
    // arguments replaced by one unknown return value. The callee may have
    // captured a binding, so everything known about locals dies here.
    let mut return_ctx = *ctx;
    return_ctx.stack_pop((argc + 1) as u16);
    return_ctx.stack_push(Type::Unknown);
    return_ctx.sp_offset = 1;
    return_ctx.chain_depth = 0;
    return_ctx.clear_local_types();
    jit.gen_return_branch(
        state.block,
        BlockId { iseq: state.iseq, idx: state.next_idx() },
        &return_ctx,
    );

    // The callee starts knowing its parameter types and receiver type
    let mut callee_ctx = Context::default();
    for j in 0..argc {
        let ty = ctx.get_opnd_type(StackOpnd((argc - 1 - j) as u16));
        callee_ctx.set_local_type(j as usize, ty);
    }
    callee_ctx.set_self_type(ctx.get_opnd_type(StackOpnd(argc as u16)));

    jit.gen_direct_jump(state.block, &callee_ctx, BlockId { iseq, idx: start_idx });
    EndBlock
}

// ---------------------------------------------------------------------------
// C function callees
// ---------------------------------------------------------------------------

fn gen_send_cfunc(
    jit: &mut Jit,
    state: &mut JitState,
    ctx: &mut Context,
    ci: CallInfo,
    block_iseq: Option<IseqPtr>,
    me: &Arc<MethodEntry>,
    cfunc: CFunc,
) -> CodegenStatus {
    let argc = ci.argc;

    // With c_call/c_return tracing on, frames must be interpreter-built
    if crate::vm::c_tracing_enabled() {
        incr_counter(Counter::SendCfuncTracing);
        return CantCompile;
    }
    match cfunc.argc {
        n if n >= 0 => {
            if n as u32 != argc {
                incr_counter(Counter::SendArityMiss);
                return CantCompile;
            }
        }
        -1 => {}
        _ => return CantCompile,
    }
    if (argc + 1) as usize > C_ARG_REGS.len() {
        return CantCompile;
    }

    if let Some(kind) = lookup_cfunc_codegen(me.serial) {
        if gen_specialized_cfunc(jit, ctx, kind, argc) {
            return KeepCompiling;
        }
    }

    let side_exit = state.side_exit(jit, ctx);
    gen_check_ints(jit, side_exit);

    // Fixed headroom: the C frame plus a little scratch
    jit.cb.lea(REG0, ctx.sp_opnd(8 * 4 + 2 * SIZEOF_CFP));
    jit.cb.cmp(REG_CFP.into(), REG0.into());
    jit.cb.jcc_ptr(Cond::Be, side_exit);

    // The callee may raise; leave a coherent frame behind. The caller's
    // stored SP already excludes receiver and arguments, which is where
    // the return value lands if the interpreter finishes this call.
    jit_save_pc(jit, state);
    jit.cb.lea(REG0, ctx.sp_opnd(-8 * (argc + 1) as i32));
    jit.cb.mov(mem(REG_CFP, CFP_OFFSET_SP).into(), REG0.into());

    // Environment data above the arguments
    let me_ptr = Arc::as_ptr(me) as u64;
    jit.cb.mov_u64(REG0, me_ptr);
    jit.cb.mov(ctx.sp_opnd(0).into(), REG0.into());
    match block_iseq {
        Some(bi) => {
            jit.cb.mov_u64(REG0, bi.0 as u64 | BLOCK_HANDLER_ISEQ_TAG);
            jit.cb.mov(ctx.sp_opnd(8).into(), REG0.into());
        }
        None => jit.cb.mov(ctx.sp_opnd(8).into(), Opnd::Imm(0)),
    }
    let frame_flags = (EnvFlags::FRAME_CFUNC | EnvFlags::CFRAME | EnvFlags::LOCAL).bits();
    jit.cb.mov(ctx.sp_opnd(16).into(), Opnd::Imm(frame_flags as i64));

    // C frame; REG_CFP stays on the caller since no jitted code runs below
    jit.cb.lea(REG0, ctx.sp_opnd(24));
    jit.cb.mov(mem(REG_CFP, CFP_OFFSET_SP - SIZEOF_CFP).into(), REG0.into());
    jit.cb.mov(mem(REG_CFP, CFP_OFFSET_BP - SIZEOF_CFP).into(), REG0.into());
    jit.cb.lea(REG1, mem(REG0, -8));
    jit.cb.mov(mem(REG_CFP, CFP_OFFSET_EP - SIZEOF_CFP).into(), REG1.into());
    jit.cb.mov(mem(REG_CFP, CFP_OFFSET_ISEQ - SIZEOF_CFP).into(), Opnd::Imm(0));
    jit.cb.mov(REG1.into(), ctx.stack_opnd(argc as u16).into());
    jit.cb.mov(mem(REG_CFP, CFP_OFFSET_SELF - SIZEOF_CFP).into(), REG1.into());
    jit.cb.mov(mem(REG_CFP, CFP_OFFSET_PC - SIZEOF_CFP).into(), Opnd::Imm(0));
    jit.cb
        .mov(mem(REG_CFP, CFP_OFFSET_BLOCK_CODE - SIZEOF_CFP).into(), Opnd::Imm(0));
    jit.cb
        .mov(mem(REG_CFP, CFP_OFFSET_JIT_RETURN - SIZEOF_CFP).into(), Opnd::Imm(0));
    jit.cb.lea(REG0, mem(REG_CFP, -SIZEOF_CFP));
    jit.cb.mov(mem(REG_EC, EC_OFFSET_CFP).into(), REG0.into());

    // Marshal arguments into the C calling convention
    if cfunc.argc >= 0 {
        jit.cb
            .mov(C_ARG_REGS[0].into(), ctx.stack_opnd(argc as u16).into());
        for i in 0..argc {
            jit.cb.mov(
                C_ARG_REGS[(1 + i) as usize].into(),
                ctx.stack_opnd((argc - 1 - i) as u16).into(),
            );
        }
    } else {
        // (argc, argv, recv)
        jit.cb.mov(C_ARG_REGS[0].into(), Opnd::Imm(argc as i64));
        jit.cb.lea(C_ARG_REGS[1], ctx.sp_opnd(-8 * argc as i32));
        jit.cb.mov(C_ARG_REGS[2].into(), ctx.stack_opnd(argc as u16).into());
    }
    jit.cb.call_ptr(REG0, cfunc.func);

    // Tracing invalidation redirects this return address through the
    // c_return event routine
    let return_routine = crate::codegen::full_cfunc_return(jit);
    let outlined_pos = jit.ocb.pos_of(return_routine);
    let inline_pos = jit.cb.write_pos();
    jit.patches
        .push(crate::invariants::CodePatch { inline_pos, outlined_pos });

    // Pop the C frame, push the result
    jit.cb.mov(mem(REG_EC, EC_OFFSET_CFP).into(), REG_CFP.into());
    ctx.stack_pop((argc + 1) as u16);
    let dst = ctx.stack_push(Type::Unknown);
    jit.cb.mov(dst.into(), REG0.into());
    jit_save_sp(jit, ctx);

    // The callee saw the frame; anything cached about locals is stale
    ctx.clear_local_types();

    jump_to_next_insn(jit, state, ctx);
    EndBlock
}

// ---------------------------------------------------------------------------
// Super dispatch
// ---------------------------------------------------------------------------

pub(crate) fn gen_invokesuper(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    let ci = state.iseq.body().call_infos[state.operand(0) as usize];
    let block_word = state.operand(1);
    let block_iseq =
        if block_word == 0 { None } else { Some(IseqPtr(block_word as *const crate::vm::iseq::Iseq)) };

    if ci.flags.contains(CallFlags::KW_SPLAT)
        || ci.flags.contains(CallFlags::KWARG)
        || ci.flags.contains(CallFlags::ARGS_SPLAT)
        || ci.flags.contains(CallFlags::ARGS_BLOCKARG)
    {
        return CantCompile;
    }
    // Zsuper forwards the caller's arguments implicitly; not supported
    if ci.flags.contains(CallFlags::ZSUPER) {
        return CantCompile;
    }

    if !state.at_current_insn() {
        jit.defer_compilation(state.block, state.blockid(), ctx);
        return EndBlock;
    }

    // Specialize on the frame's current method entry
    let me_ptr = unsafe {
        let ep = (*(*state.ec).cfp).ep;
        (*ep.offset(-2)).0 as *const MethodEntry
    };
    if me_ptr.is_null() {
        return CantCompile;
    }
    let current_me: &MethodEntry = unsafe { &*me_ptr };

    let defined_class = current_me.defined_class;
    if !defined_class.is_heap() || defined_class.rbasic().flags & T_MASK == T_ICLASS {
        // Refinement scopes change super resolution dynamically
        return CantCompile;
    }
    let superclass = defined_class.as_rclass().superclass;
    if superclass == QNIL {
        return CantCompile;
    }
    let mid = current_me.called_id;
    let Some(cme) = callable_method_entry(superclass, mid) else {
        return CantCompile;
    };

    let side_exit = state.side_exit(jit, ctx);

    // Guard: the environment still carries the method entry this code was
    // specialized against (blocks and binding can swap it)
    jit.cb.mov(REG0.into(), mem(REG_CFP, CFP_OFFSET_EP).into());
    jit.cb.mov_u64(REG1, me_ptr as u64);
    jit.cb.cmp(mem(REG0, -16).into(), REG1.into());
    jit.cb.jcc_ptr(Cond::Ne, side_exit);

    // Guard: no block is being forwarded implicitly
    if block_iseq.is_none() {
        jit.cb.cmp(mem(REG0, -8).into(), Opnd::Imm(0));
        jit.cb.jcc_ptr(Cond::Ne, side_exit);
    }

    // Both the current entry and the resolved super target must stay put
    jit.assume_method_lookup_stable(state.block, defined_class, mid);
    jit.assume_method_lookup_stable(state.block, superclass, mid);
    jit.block_mut(state.block).cme_refs.push(cme.clone());

    match &cme.def {
        MethodDef::Iseq(iseq) => {
            let iseq = *iseq;
            gen_send_iseq(jit, state, ctx, ci, block_iseq, &cme, iseq)
        }
        MethodDef::Cfunc(cfunc) => {
            let cfunc = *cfunc;
            gen_send_cfunc(jit, state, ctx, ci, block_iseq, &cme, cfunc)
        }
        _ => {
            incr_counter(Counter::SendUnsupportedDef);
            CantCompile
        }
    }
}
