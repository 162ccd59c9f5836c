//! Code generation driver and shared emit helpers
//!
//! Register convention (System V, callee-saved where state must survive C
//! calls):
//! - `r12`: execution context
//! - `r13`: current control frame
//! - `rbx`: materialized stack pointer of the current frame
//! - `rax`/`rcx`: scratch
//!
//! The entry prologue keeps `rsp` 16-byte aligned for the duration of
//! generated code, so helper calls need no per-site adjustment.

pub mod opcodes;
pub mod send;

use crate::asm::x86_64::{mem, Cond, Opnd, Reg};
use crate::asm::{CodeBlock, CodePtr, CODE_SAFETY_MARGIN};
use crate::core::block::{BlockId, BlockRef};
use crate::core::context::{Context, InsnOpnd, MAX_TEMP_TYPES};
use crate::core::types::Type;
use crate::stats::{counter_ptr, incr_counter, Counter};
use crate::vm::frame::{
    ControlFrame, ExecutionContext, CFP_OFFSET_JIT_RETURN, CFP_OFFSET_PC, CFP_OFFSET_SP,
    EC_OFFSET_INTERRUPT_FLAG, EC_OFFSET_INTERRUPT_MASK,
};
use crate::vm::iseq::{IseqPtr, Opcode};
use crate::vm::value::{Value, QUNDEF};
use crate::Jit;

pub const REG_EC: Reg = Reg::R12;
pub const REG_CFP: Reg = Reg::R13;
pub const REG_SP: Reg = Reg::Rbx;
pub const REG0: Reg = Reg::Rax;
pub const REG1: Reg = Reg::Rcx;

pub const C_ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// Size of an unconditional rel32 jump; the minimum patchable unit.
pub const JMP_PTR_BYTES: usize = 5;

/// What one opcode's generator reports back to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodegenStatus {
    KeepCompiling,
    CantCompile,
    EndBlock,
}

/// Why a block could not be produced at all.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("out of executable memory")]
    OutOfMemory,
}

/// Per-block compilation state threaded through the opcode generators.
pub struct JitState {
    pub iseq: IseqPtr,
    pub insn_idx: u32,
    pub opcode: Opcode,
    /// The block version being filled in
    pub block: BlockRef,
    /// Live execution context for deferred compiles; null at entry compiles
    /// that race ahead of execution
    pub ec: *mut ExecutionContext,
    /// Emit a boundary patch point before the next instruction
    pub record_boundary_patch_point: bool,
    /// Cached outlined exit for the current instruction
    side_exit_for_pc: Option<CodePtr>,
}

impl JitState {
    pub fn pc(&self) -> *const u64 {
        self.iseq.pc_at(self.insn_idx)
    }

    pub fn next_idx(&self) -> u32 {
        self.insn_idx + self.opcode.len()
    }

    pub fn operand(&self, n: u32) -> u64 {
        self.iseq.operand(self.insn_idx, n)
    }

    pub fn blockid(&self) -> BlockId {
        BlockId { iseq: self.iseq, idx: self.insn_idx }
    }

    /// Whether execution is live at this exact instruction, making stack
    /// and receiver values observable.
    pub fn at_current_insn(&self) -> bool {
        if self.ec.is_null() {
            return false;
        }
        unsafe { (*(*self.ec).cfp).pc == self.pc() }
    }

    /// Read the live value `n` entries from the top of the stack. Only
    /// valid when [`JitState::at_current_insn`] holds.
    pub fn peek_at_stack(&self, n: isize) -> Value {
        debug_assert!(self.at_current_insn());
        unsafe {
            let sp = (*(*self.ec).cfp).sp;
            *sp.offset(-1 - n)
        }
    }

    pub fn peek_at_self(&self) -> Value {
        debug_assert!(self.at_current_insn());
        unsafe { (*(*self.ec).cfp).self_val }
    }
}

/// Epilogue shared by every path that returns to the interpreter. Expects
/// the return value (or Qundef) already in rax.
fn gen_epilogue(cb: &mut CodeBlock) {
    cb.add(Reg::Rsp.into(), Opnd::Imm(8));
    cb.pop(Reg::R13);
    cb.pop(Reg::R12);
    cb.pop(Reg::Rbx);
    cb.pop(Reg::Rbp);
    cb.ret();
}

/// Emit interpreter-exit code at the current position of `cb`: restore the
/// interpreter SP and PC for re-execution at `exit_pc`, optionally bump a
/// counter, and return the undefined sentinel.
fn gen_exit_code(cb: &mut CodeBlock, exit_pc: *const u64, ctx: &Context, counter: Option<Counter>) {
    if ctx.sp_offset != 0 {
        cb.lea(REG_SP, ctx.sp_opnd(0));
        cb.mov(mem(REG_CFP, CFP_OFFSET_SP).into(), REG_SP.into());
    }
    cb.mov_u64(REG0, exit_pc as u64);
    cb.mov(mem(REG_CFP, CFP_OFFSET_PC).into(), REG0.into());

    if let Some(counter) = counter {
        if crate::options::get().gen_stats {
            cb.mov_u64(REG1, counter_ptr(counter) as u64);
            cb.lock_add(mem(REG1, 0), 1);
        }
    }

    cb.mov(REG0.into(), Opnd::Imm(QUNDEF.0 as i64));
    gen_epilogue(cb);
}

/// Emit an exit into the outlined arena and return its address.
pub fn gen_outlined_exit(ocb: &mut CodeBlock, exit_pc: *const u64, ctx: &Context) -> CodePtr {
    let ptr = ocb.get_write_ptr();
    gen_exit_code(ocb, exit_pc, ctx, None);
    ptr
}

fn gen_counted_exit(ocb: &mut CodeBlock, exit_pc: *const u64, ctx: &Context, counter: Counter) -> CodePtr {
    let ptr = ocb.get_write_ptr();
    gen_exit_code(ocb, exit_pc, ctx, Some(counter));
    ptr
}

impl JitState {
    /// The side exit for the current instruction: re-executes it in the
    /// interpreter with the state `ctx` describes. Snapshot `ctx` *after*
    /// any SP materialization in the same generator.
    pub fn side_exit(&mut self, jit: &mut Jit, ctx: &Context) -> CodePtr {
        if let Some(exit) = self.side_exit_for_pc {
            return exit;
        }
        let exit = gen_outlined_exit(&mut jit.ocb, self.pc(), ctx);
        self.side_exit_for_pc = Some(exit);
        exit
    }

    /// A side exit that also bumps `counter` when stats are enabled.
    pub fn counted_exit(&mut self, jit: &mut Jit, ctx: &Context, counter: Counter) -> CodePtr {
        if !crate::options::get().gen_stats {
            return self.side_exit(jit, ctx);
        }
        gen_counted_exit(&mut jit.ocb, self.pc(), ctx, counter)
    }
}

/// Write the PC of the next instruction into the frame, for callees that
/// may raise or re-enter the VM.
pub fn jit_save_pc(jit: &mut Jit, state: &JitState) {
    let next_pc = state.iseq.pc_at(state.next_idx());
    jit.cb.mov_u64(REG0, next_pc as u64);
    jit.cb.mov(mem(REG_CFP, CFP_OFFSET_PC).into(), REG0.into());
}

/// Materialize the abstract stack top into REG_SP and the frame. Resets
/// `sp_offset`; memory operands taken before this call go stale.
pub fn jit_save_sp(jit: &mut Jit, ctx: &mut Context) {
    if ctx.sp_offset != 0 {
        let sp = ctx.sp_opnd(0);
        jit.cb.lea(REG_SP, sp);
        jit.cb.mov(mem(REG_CFP, CFP_OFFSET_SP).into(), REG_SP.into());
        ctx.sp_offset = 0;
    }
}

/// Standard preamble for calling a host routine: sync PC and SP so the
/// callee can raise or inspect the frame, and request a boundary patch
/// point at the next instruction for tracing invalidation.
pub fn jit_prepare_routine_call(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) {
    jit_save_pc(jit, state);
    jit_save_sp(jit, ctx);
    state.record_boundary_patch_point = true;
}

/// Interrupt poll: exits when any unmasked interrupt flag is set.
pub fn gen_check_ints(jit: &mut Jit, side_exit: CodePtr) {
    jit.cb.mov(REG0.into(), mem(REG_EC, EC_OFFSET_INTERRUPT_MASK).into());
    jit.cb.not_(REG0);
    jit.cb.test(mem(REG_EC, EC_OFFSET_INTERRUPT_FLAG).into(), REG0.into());
    jit.cb.jcc_ptr(Cond::Ne, side_exit);
}

/// Load a 64-bit value immediate into `reg`, recording its code offset
/// when it names a heap object the GC must trace.
pub fn jit_mov_gc_ptr(jit: &mut Jit, state: &JitState, reg: Reg, val: Value) {
    let imm_pos = jit.cb.mov_u64(reg, val.0);
    if val.is_heap() {
        let start_addr = jit.block(state.block).start_addr.unwrap();
        let block_start = jit.cb.pos_of(start_addr);
        jit.block_mut(state.block).gc_obj_offsets.push((imm_pos - block_start) as u32);
    }
}

/// End the current block with a direct jump to the next instruction,
/// resetting the guard-chain depth. Used by deferred specializations so
/// their versions converge on a shared continuation. A boundary patch
/// point still pending from this instruction lands here, just before the
/// jump.
pub fn jump_to_next_insn(jit: &mut Jit, state: &mut JitState, ctx: &Context) {
    let mut next_ctx = *ctx;
    next_ctx.chain_depth = 0;

    if state.record_boundary_patch_point {
        let next_pc = state.iseq.pc_at(state.next_idx());
        let exit_pos = jit.ocb.write_pos();
        gen_exit_code(&mut jit.ocb, next_pc, &next_ctx, None);
        let inline_pos = jit.cb.write_pos();
        jit.patches.push(crate::invariants::CodePatch { inline_pos, outlined_pos: exit_pos });
        state.record_boundary_patch_point = false;
    }

    let target = BlockId { iseq: state.iseq, idx: state.next_idx() };
    jit.gen_direct_jump(state.block, &next_ctx, target);
}

/// Verify the compile-time context against live values. Runs at block
/// entries when execution is at the compiled instruction (self-check).
fn verify_ctx(state: &JitState, ctx: &Context) {
    for n in 0..ctx.stack_size.min(MAX_TEMP_TYPES as u16) {
        let learned = ctx.get_opnd_type(InsnOpnd::StackOpnd(n));
        let actual = Type::of(state.peek_at_stack(n as isize));
        assert!(
            actual.diff(learned) != crate::core::types::TypeDiff::Incompatible,
            "context mismatch at stack slot {}: compiled for {:?}, live value is {:?}",
            n,
            learned,
            actual
        );
    }
    let self_learned = ctx.get_self_type();
    let self_actual = Type::of(state.peek_at_self());
    assert!(
        self_actual.diff(self_learned) != crate::core::types::TypeDiff::Incompatible,
        "context mismatch on self: compiled for {:?}, live value is {:?}",
        self_learned,
        self_actual
    );
}

/// Compile one block version at the current inline position.
pub fn gen_single_block(
    jit: &mut Jit,
    blockid: BlockId,
    start_ctx: &Context,
    ec: *mut ExecutionContext,
) -> Result<BlockRef, CodegenError> {
    if !jit.cb.has_capacity(CODE_SAFETY_MARGIN)
        || !jit.ocb.has_capacity(CODE_SAFETY_MARGIN)
        || jit.cb.has_dropped_bytes()
        || jit.ocb.has_dropped_bytes()
    {
        return Err(CodegenError::OutOfMemory);
    }

    let mut ctx = *start_ctx;
    let blockref = jit.make_block(blockid, start_ctx);
    let start_pos = jit.cb.write_pos();
    jit.block_mut(blockref).start_addr = Some(jit.cb.get_ptr(start_pos));

    let mut state = JitState {
        iseq: blockid.iseq,
        insn_idx: blockid.idx,
        opcode: Opcode::Nop,
        block: blockref,
        ec,
        record_boundary_patch_point: false,
        side_exit_for_pc: None,
    };

    let iseq_size = blockid.iseq.body().iseq_size;
    let mut insn_idx = blockid.idx;

    while insn_idx < iseq_size {
        state.insn_idx = insn_idx;
        state.side_exit_for_pc = None;

        let Some(opcode) = blockid.iseq.opcode_at(insn_idx) else {
            gen_exit_code(&mut jit.cb, blockid.iseq.pc_at(insn_idx), &ctx, None);
            break;
        };
        state.opcode = opcode;

        if crate::options::get().self_check && state.at_current_insn() {
            verify_ctx(&state, &ctx);
        }

        // A previous instruction handed control to the VM; give tracing
        // invalidation a resume point at this boundary
        if state.record_boundary_patch_point {
            let exit_pos = jit.ocb.write_pos();
            gen_exit_code(&mut jit.ocb, blockid.iseq.pc_at(insn_idx), &ctx, None);
            let inline_pos = jit.cb.write_pos();
            jit.patches.push(crate::invariants::CodePatch { inline_pos, outlined_pos: exit_pos });
            state.record_boundary_patch_point = false;
        }

        match gen_insn(jit, &mut state, &mut ctx) {
            CodegenStatus::KeepCompiling => {
                insn_idx += opcode.len();
                ctx.chain_depth = 0;
            }
            CodegenStatus::CantCompile => {
                // Exit to the interpreter at *this* instruction
                gen_exit_code(&mut jit.cb, blockid.iseq.pc_at(insn_idx), &ctx, None);
                break;
            }
            CodegenStatus::EndBlock => break,
        }
    }

    if jit.cb.has_dropped_bytes() || jit.ocb.has_dropped_bytes() {
        jit.cb.set_pos(start_pos);
        return Err(CodegenError::OutOfMemory);
    }

    // Keep every block patchable with a full jump at its entry
    if jit.cb.write_pos() < start_pos + JMP_PTR_BYTES {
        jit.cb.pad_to(start_pos + JMP_PTR_BYTES);
    }

    let end_pos = jit.cb.write_pos();
    let end_ptr = jit.cb.get_ptr(end_pos);
    let block = jit.block_mut(blockref);
    block.end_idx = state.insn_idx;
    block.end_addr = Some(end_ptr);
    incr_counter(Counter::CompiledBlockCount);

    if crate::options::get().dump_mode >= 1 {
        eprintln!(
            "block {:?}@{} [{:#x}..{:#x}] stack_size={}",
            blockid.iseq.0, blockid.idx, start_pos, end_pos, ctx.stack_size
        );
    }

    Ok(blockref)
}

/// Opcode dispatch. Unknown or unsupported opcodes fall out as
/// `CantCompile` and the driver closes the block with an exit.
fn gen_insn(jit: &mut Jit, state: &mut JitState, ctx: &mut Context) -> CodegenStatus {
    use Opcode::*;
    match state.opcode {
        Nop => CodegenStatus::KeepCompiling,
        Pop => opcodes::gen_pop(jit, state, ctx),
        Dup => opcodes::gen_dup(jit, state, ctx),
        DupN => opcodes::gen_dupn(jit, state, ctx),
        Swap => opcodes::gen_swap(jit, state, ctx),
        SetN => opcodes::gen_setn(jit, state, ctx),
        TopN => opcodes::gen_topn(jit, state, ctx),
        AdjustStack => opcodes::gen_adjuststack(jit, state, ctx),
        PutNil => opcodes::gen_putnil(jit, state, ctx),
        PutObject => opcodes::gen_putobject(jit, state, ctx),
        PutObjectFixZero => opcodes::gen_putobject_fix(jit, state, ctx, 0),
        PutObjectFixOne => opcodes::gen_putobject_fix(jit, state, ctx, 1),
        PutSelf => opcodes::gen_putself(jit, state, ctx),
        PutString => opcodes::gen_putstring(jit, state, ctx),
        GetLocal => opcodes::gen_getlocal(jit, state, ctx),
        GetLocalWc0 => opcodes::gen_getlocal_wc0(jit, state, ctx),
        GetLocalWc1 => opcodes::gen_getlocal_wc1(jit, state, ctx),
        SetLocalWc0 => opcodes::gen_setlocal_wc0(jit, state, ctx),
        GetInstanceVariable => opcodes::gen_getinstancevariable(jit, state, ctx),
        SetInstanceVariable => opcodes::gen_setinstancevariable(jit, state, ctx),
        GetGlobal => opcodes::gen_getglobal(jit, state, ctx),
        SetGlobal => opcodes::gen_setglobal(jit, state, ctx),
        NewArray => opcodes::gen_newarray(jit, state, ctx),
        DupArray => opcodes::gen_duparray(jit, state, ctx),
        NewHash => opcodes::gen_newhash(jit, state, ctx),
        NewRange => opcodes::gen_newrange(jit, state, ctx),
        SplatArray => opcodes::gen_splatarray(jit, state, ctx),
        ConcatStrings => opcodes::gen_concatstrings(jit, state, ctx),
        ToString => opcodes::gen_tostring(jit, state, ctx),
        ToRegexp => opcodes::gen_toregexp(jit, state, ctx),
        Defined => opcodes::gen_defined(jit, state, ctx),
        OptGetInlineCache => opcodes::gen_opt_getinlinecache(jit, state, ctx),
        GetBlockParamProxy => opcodes::gen_getblockparamproxy(jit, state, ctx),
        BranchIf => opcodes::gen_branchif(jit, state, ctx),
        BranchUnless => opcodes::gen_branchunless(jit, state, ctx),
        BranchNil => opcodes::gen_branchnil(jit, state, ctx),
        Jump => opcodes::gen_jump(jit, state, ctx),
        OptPlus => opcodes::gen_opt_plus(jit, state, ctx),
        OptMinus => opcodes::gen_opt_minus(jit, state, ctx),
        OptAnd => opcodes::gen_opt_and(jit, state, ctx),
        OptOr => opcodes::gen_opt_or(jit, state, ctx),
        OptLt => opcodes::gen_fixnum_cmp(jit, state, ctx, Cond::L),
        OptLe => opcodes::gen_fixnum_cmp(jit, state, ctx, Cond::Le),
        OptGt => opcodes::gen_fixnum_cmp(jit, state, ctx, Cond::G),
        OptGe => opcodes::gen_fixnum_cmp(jit, state, ctx, Cond::Ge),
        OptMod => opcodes::gen_opt_mod(jit, state, ctx),
        OptEq => opcodes::gen_opt_eq(jit, state, ctx),
        OptNeq => opcodes::gen_opt_neq(jit, state, ctx),
        OptAref => opcodes::gen_opt_aref(jit, state, ctx),
        OptAset => opcodes::gen_opt_aset(jit, state, ctx),
        OptSendWithoutBlock => send::gen_opt_send_without_block(jit, state, ctx),
        Send => send::gen_send(jit, state, ctx),
        InvokeSuper => send::gen_invokesuper(jit, state, ctx),
        Leave => opcodes::gen_leave(jit, state, ctx),
        OptSetInlineCache => CodegenStatus::CantCompile,
    }
}

/// The shared epilogue a compiled `leave` jumps to when returning into the
/// interpreter; the return value rides in rax.
pub fn leave_exit(jit: &mut Jit) -> CodePtr {
    if let Some(ptr) = jit.leave_exit {
        return ptr;
    }
    let ptr = jit.ocb.get_write_ptr();
    gen_epilogue(&mut jit.ocb);
    jit.leave_exit = Some(ptr);
    ptr
}

extern "C" fn full_cfunc_return_handler(ec: *mut ExecutionContext, val: Value) {
    // Fire the c_return hook, pop the C frame, and push the return value
    // where the interpreter expects it
    (crate::vm::host_fns().c_return_event)(ec, val);
    unsafe {
        let callee: *mut ControlFrame = (*ec).cfp;
        let caller = callee.add(1);
        (*ec).cfp = caller;
        *(*caller).sp = val;
        (*caller).sp = (*caller).sp.add(1);
    }
}

/// Out-of-line routine patched-in C calls return through once tracing is
/// enabled: fires the c_return event, unwinds the frame, and exits.
pub fn full_cfunc_return(jit: &mut Jit) -> CodePtr {
    if let Some(ptr) = jit.cfunc_return_exit {
        return ptr;
    }
    let ptr = jit.ocb.get_write_ptr();
    let ocb = &mut jit.ocb;
    ocb.mov(Reg::Rdi.into(), REG_EC.into());
    ocb.mov(Reg::Rsi.into(), REG0.into());
    ocb.call_ptr(Reg::R11, full_cfunc_return_handler as *const u8);
    ocb.mov(REG0.into(), Opnd::Imm(QUNDEF.0 as i64));
    gen_epilogue(ocb);
    jit.cfunc_return_exit = Some(ptr);
    ptr
}

/// Compile the outward-facing entry point for `(iseq, insn_idx)`: set up
/// the JIT register state, install the leave exit, guard the entry PC when
/// optional parameters can divert it, and fall into the first block.
pub fn gen_entry_point(
    jit: &mut Jit,
    iseq: IseqPtr,
    ec: *mut ExecutionContext,
    insn_idx: u32,
) -> Option<CodePtr> {
    if !jit.cb.has_capacity(CODE_SAFETY_MARGIN) || !jit.ocb.has_capacity(CODE_SAFETY_MARGIN) {
        return None;
    }

    jit.cb.align(64);
    let code_ptr = jit.cb.get_write_ptr();
    let start_pos = jit.cb.write_pos();

    // Prologue: save callee-saved state, load the JIT registers. The odd
    // slot keeps rsp 16-byte aligned at every call site in generated code.
    jit.cb.push(Reg::Rbp);
    jit.cb.push(Reg::Rbx);
    jit.cb.push(Reg::R12);
    jit.cb.push(Reg::R13);
    jit.cb.sub(Reg::Rsp.into(), Opnd::Imm(8));
    jit.cb.mov(REG_EC.into(), Reg::Rdi.into());
    jit.cb.mov(REG_CFP.into(), Reg::Rsi.into());
    jit.cb.mov(REG_SP.into(), mem(REG_CFP, CFP_OFFSET_SP).into());

    // Returns out of this frame resume in the interpreter
    let leave = leave_exit(jit);
    jit.cb.mov_u64(REG0, leave.as_usize() as u64);
    jit.cb.mov(mem(REG_CFP, CFP_OFFSET_JIT_RETURN).into(), REG0.into());

    // Optional parameters land at different start PCs; only enter when the
    // frame is where this entry was compiled for
    if iseq.body().param.flags.contains(crate::vm::iseq::ParamFlags::HAS_OPT) {
        let exit = {
            let ocb = &mut jit.ocb;
            let ptr = ocb.get_write_ptr();
            if crate::options::get().gen_stats {
                ocb.mov_u64(REG1, counter_ptr(Counter::ExitEntryPcMismatch) as u64);
                ocb.lock_add(mem(REG1, 0), 1);
            }
            ocb.mov(REG0.into(), Opnd::Imm(QUNDEF.0 as i64));
            gen_epilogue(ocb);
            ptr
        };
        jit.cb.mov(REG0.into(), mem(REG_CFP, CFP_OFFSET_PC).into());
        jit.cb.mov_u64(REG1, iseq.pc_at(insn_idx) as u64);
        jit.cb.cmp(REG0.into(), REG1.into());
        jit.cb.jcc_ptr(Cond::Ne, exit);
    }

    let blockid = BlockId { iseq, idx: insn_idx };
    let mut entry_ctx = Context::default();
    entry_ctx.set_self_type(Type::Unknown);
    if jit.gen_block_version(blockid, &entry_ctx, ec).is_none() {
        jit.cb.set_pos(start_pos);
        return None;
    }

    incr_counter(Counter::CompiledIseqEntry);
    Some(code_ptr)
}

/// Narrow an operand's type only when the refinement is consistent with
/// what is already known. A contradictory guard (this site saw a String
/// where an Array is now expected) still emits and simply always fails at
/// run time.
fn refine_if_compatible(ctx: &mut Context, opnd: InsnOpnd, ty: Type) {
    use crate::core::types::TypeDiff;
    if ty.diff(ctx.get_opnd_type(opnd)) != TypeDiff::Incompatible {
        ctx.upgrade_opnd_type(opnd, ty);
    }
}

/// Emit the common receiver-class guard. `val_opnd` addresses the value;
/// `sample` is the live instance the class was observed on. Narrows the
/// operand's type on success; failures branch into the guard chain until
/// `limit`, then side-exit.
#[allow(clippy::too_many_arguments)]
pub fn jit_guard_known_klass(
    jit: &mut Jit,
    state: &mut JitState,
    ctx: &mut Context,
    known_klass: Value,
    insn_opnd: InsnOpnd,
    val_opnd: Opnd,
    sample: Value,
    limit: u8,
    side_exit: CodePtr,
) {
    let core = crate::vm::value::core_classes();
    let val_type = ctx.get_opnd_type(insn_opnd);

    if known_klass == core.nil_class {
        if val_type != Type::Nil {
            jit.cb.cmp(val_opnd, Opnd::Imm(crate::vm::value::QNIL.0 as i64));
            jit_chain_guard(jit, state, ctx, Cond::Ne, limit, side_exit);
            refine_if_compatible(ctx, insn_opnd, Type::Nil);
        }
    } else if known_klass == core.true_class {
        if val_type != Type::True {
            jit.cb.cmp(val_opnd, Opnd::Imm(crate::vm::value::QTRUE.0 as i64));
            jit_chain_guard(jit, state, ctx, Cond::Ne, limit, side_exit);
            refine_if_compatible(ctx, insn_opnd, Type::True);
        }
    } else if known_klass == core.false_class {
        if val_type != Type::False {
            jit.cb.cmp(val_opnd, Opnd::Imm(0));
            jit_chain_guard(jit, state, ctx, Cond::Ne, limit, side_exit);
            refine_if_compatible(ctx, insn_opnd, Type::False);
        }
    } else if known_klass == core.integer && sample.is_fixnum() {
        if val_type != Type::Fixnum {
            jit.cb.test(val_opnd, Opnd::Imm(crate::vm::value::FIXNUM_FLAG as i64));
            jit_chain_guard(jit, state, ctx, Cond::E, limit, side_exit);
            refine_if_compatible(ctx, insn_opnd, Type::Fixnum);
        }
    } else if known_klass == core.symbol && sample.is_static_sym() {
        if val_type != Type::ImmSymbol {
            jit.cb.mov(REG0.into(), val_opnd);
            jit.cb.and_(REG0.into(), Opnd::Imm(crate::vm::value::SYMBOL_MASK as i64));
            jit.cb.cmp(REG0.into(), Opnd::Imm(crate::vm::value::SYMBOL_FLAG as i64));
            jit_chain_guard(jit, state, ctx, Cond::Ne, limit, side_exit);
            refine_if_compatible(ctx, insn_opnd, Type::ImmSymbol);
        }
    } else if known_klass == core.float && sample.is_flonum() {
        if val_type != Type::Flonum {
            jit.cb.mov(REG0.into(), val_opnd);
            jit.cb.and_(REG0.into(), Opnd::Imm(crate::vm::value::FLONUM_MASK as i64));
            jit.cb.cmp(REG0.into(), Opnd::Imm(crate::vm::value::FLONUM_FLAG as i64));
            jit_chain_guard(jit, state, ctx, Cond::Ne, limit, side_exit);
            refine_if_compatible(ctx, insn_opnd, Type::Flonum);
        }
    } else if known_klass.is_heap() && known_klass.as_rclass().is_singleton {
        // Singleton class: guard identity against the one attached object
        jit_mov_gc_ptr(jit, state, REG1, sample);
        jit.cb.cmp(val_opnd, REG1.into());
        jit_chain_guard(jit, state, ctx, Cond::Ne, limit, side_exit);
    } else {
        // Generic heap class: reject immediates and nil/false, then
        // compare the object header's class word
        if val_type.heap_known() == Some(false) {
            // A known immediate can never carry this class
            jit.cb.jmp_ptr(side_exit);
            return;
        }
        if val_type.heap_known().is_none() {
            jit.cb.test(val_opnd, Opnd::Imm(crate::vm::value::IMMEDIATE_MASK as i64));
            jit_chain_guard(jit, state, ctx, Cond::Ne, limit, side_exit);
            jit.cb.cmp(val_opnd, Opnd::Imm(crate::vm::value::QNIL.0 as i64));
            jit_chain_guard(jit, state, ctx, Cond::Be, limit, side_exit);
            refine_if_compatible(ctx, insn_opnd, Type::UnknownHeap);
        }
        jit.cb.mov(REG0.into(), val_opnd);
        jit_mov_gc_ptr(jit, state, REG1, known_klass);
        jit.cb.cmp(
            mem(REG0, crate::vm::value::RBASIC_OFFSET_KLASS).into(),
            REG1.into(),
        );
        jit_chain_guard(jit, state, ctx, Cond::Ne, limit, side_exit);
        refine_if_compatible(ctx, insn_opnd, Type::of(sample));
    }
}

/// On guard failure, branch to a deeper version of this same instruction
/// (extending the polymorphic chain) until the per-site cap, then fall
/// back to the side exit.
pub fn jit_chain_guard(
    jit: &mut Jit,
    state: &mut JitState,
    ctx: &Context,
    fail_cond: Cond,
    limit: u8,
    side_exit: CodePtr,
) {
    if ctx.chain_depth < limit {
        let mut deeper = *ctx;
        deeper.chain_depth += 1;
        jit.gen_guard_branch(state.block, fail_cond, state.blockid(), &deeper);
    } else {
        jit.cb.jcc_ptr(fail_cond, side_exit);
    }
}
