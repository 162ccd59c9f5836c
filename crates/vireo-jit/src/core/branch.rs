//! Branches and stubs
//!
//! A branch is an outgoing control-flow edge from a block version. Its
//! targets start out as outlined stubs; the first execution through a stub
//! compiles the destination block under the VM lock and rewrites the
//! branch in place to jump there directly. Re-emission keeps the original
//! code region: rel32 forms are fixed-size, and a branch is only allowed
//! to shrink when it terminates the arena (fallthrough compaction).
//!
//! Deferred compilation rides the same machinery: a branch whose target is
//! the *same* instruction at one deeper chain depth, so the second visit
//! can observe live values before specializing.

use crate::asm::x86_64::{Cond, Reg};
use crate::asm::{CodeBlock, CodePtr};
use crate::codegen::{JMP_PTR_BYTES, REG_CFP};
use crate::core::block::{BlockId, BlockRef};
use crate::core::context::Context;
use crate::stats::incr_counter;
use crate::vm::frame::{ControlFrame, ExecutionContext, CFP_OFFSET_JIT_RETURN};
use crate::Jit;

/// Index of a branch in the root store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchRef(pub usize);

/// How a branch's targets are laid out relative to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchShape {
    /// Target 0 immediately follows the branch
    Next0,
    /// Target 1 immediately follows the branch
    Next1,
    /// Both targets are jumped to
    Default,
}

/// The code a branch emits, parameterized over its current targets.
#[derive(Debug, Clone, Copy)]
pub enum BranchGenFn {
    /// Unconditional transfer
    Jump,
    /// `jcc` to target 0, else target 1
    TwoWay(Cond),
    /// No transfer: writes target 0's address into the frame's
    /// `jit_return` slot, for return-branch continuations
    JitReturn,
}

pub struct Branch {
    /// Source block version
    pub block: BlockRef,
    /// Inline code region of the emitted jump(s)
    pub start_pos: usize,
    pub end_pos: usize,
    pub gen_fn: BranchGenFn,
    pub shape: BranchShape,
    pub targets: [Option<BlockId>; 2],
    pub dst_ctxs: [Context; 2],
    /// Current jump destinations: stub or linked block entry
    pub dst_addrs: [Option<CodePtr>; 2],
    /// Destination blocks once linked
    pub dst_blocks: [Option<BlockRef>; 2],
}

impl Branch {
    /// A branch is unlinked while any live target still points at a stub.
    pub fn linked(&self, target_idx: usize) -> bool {
        self.dst_blocks[target_idx].is_some()
    }
}

/// Emit the branch's code for its current shape and target addresses.
fn emit_branch_code(
    cb: &mut CodeBlock,
    gen_fn: BranchGenFn,
    shape: BranchShape,
    t0: Option<CodePtr>,
    t1: Option<CodePtr>,
) {
    match gen_fn {
        BranchGenFn::Jump => match shape {
            BranchShape::Next0 => {}
            _ => cb.jmp_ptr(t0.expect("jump target unset")),
        },
        BranchGenFn::TwoWay(cond) => match shape {
            BranchShape::Next0 => cb.jcc_ptr(cond.invert(), t1.expect("branch target unset")),
            BranchShape::Next1 => cb.jcc_ptr(cond, t0.expect("branch target unset")),
            BranchShape::Default => {
                cb.jcc_ptr(cond, t0.expect("branch target unset"));
                cb.jmp_ptr(t1.expect("branch target unset"));
            }
        },
        BranchGenFn::JitReturn => {
            let addr = t0.expect("return target unset");
            cb.mov_u64(Reg::Rax, addr.as_usize() as u64);
            cb.mov(
                crate::asm::x86_64::mem(REG_CFP, CFP_OFFSET_JIT_RETURN).into(),
                Reg::Rax.into(),
            );
        }
    }
}

impl Jit {
    pub(crate) fn make_branch(
        &mut self,
        block: BlockRef,
        gen_fn: BranchGenFn,
    ) -> BranchRef {
        self.branches.push(Branch {
            block,
            start_pos: 0,
            end_pos: 0,
            gen_fn,
            shape: BranchShape::Default,
            targets: [None, None],
            dst_ctxs: [Context::default(); 2],
            dst_addrs: [None, None],
            dst_blocks: [None, None],
        });
        let branchref = BranchRef(self.branches.len() - 1);
        self.block_mut(block).outgoing.push(branchref);
        branchref
    }

    /// Resolve one branch target: an existing compatible block version, or
    /// a fresh stub in the outlined arena.
    fn branch_target(
        &mut self,
        branchref: BranchRef,
        target_idx: usize,
        blockid: BlockId,
        ctx: &Context,
    ) -> CodePtr {
        if let Some(dst) = self.find_block_version(blockid, ctx) {
            self.block_mut(dst).incoming.push(branchref);
            self.branch_mut(branchref).dst_blocks[target_idx] = Some(dst);
            return self.block(dst).start_addr.expect("linked target not finalized");
        }
        self.gen_branch_stub_for(branchref, target_idx)
    }

    /// Write a stub: spill the branch identity into argument registers and
    /// trampoline into the stub-hit handler, then jump wherever it says.
    pub(crate) fn gen_branch_stub_for(&mut self, branchref: BranchRef, target_idx: usize) -> CodePtr {
        let ocb = &mut self.ocb;
        let stub = ocb.get_write_ptr();
        ocb.mov(Reg::Rdi.into(), crate::asm::x86_64::Opnd::Imm(branchref.0 as i64));
        ocb.mov(Reg::Rsi.into(), crate::asm::x86_64::Opnd::Imm(target_idx as i64));
        ocb.mov(Reg::Rdx.into(), crate::codegen::REG_EC.into());
        ocb.call_ptr(Reg::Rax, branch_stub_hit as *const u8);
        ocb.jmp_reg(Reg::Rax);
        stub
    }

    /// Emit a two-target conditional branch at the current inline position.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn gen_branch(
        &mut self,
        block: BlockRef,
        cond: Cond,
        target0: BlockId,
        ctx0: &Context,
        target1: BlockId,
        ctx1: &Context,
    ) -> BranchRef {
        let branchref = self.make_branch(block, BranchGenFn::TwoWay(cond));
        let addr0 = self.branch_target(branchref, 0, target0, ctx0);
        let addr1 = self.branch_target(branchref, 1, target1, ctx1);

        let branch = self.branch_mut(branchref);
        branch.targets = [Some(target0), Some(target1)];
        branch.dst_ctxs = [*ctx0, *ctx1];
        branch.dst_addrs = [Some(addr0), Some(addr1)];
        branch.shape = BranchShape::Default;

        let start = self.cb.write_pos();
        emit_branch_code(&mut self.cb, BranchGenFn::TwoWay(cond), BranchShape::Default, Some(addr0), Some(addr1));
        let end = self.cb.write_pos();
        let branch = self.branch_mut(branchref);
        branch.start_pos = start;
        branch.end_pos = end;
        branchref
    }

    /// A guard's failure edge: `jcc` into a deeper version of the same
    /// instruction (stubbed until first failure), falling through on
    /// success. Used to grow polymorphic chains one class at a time.
    pub(crate) fn gen_guard_branch(
        &mut self,
        block: BlockRef,
        fail_cond: Cond,
        target0: BlockId,
        ctx0: &Context,
    ) -> BranchRef {
        let branchref = self.make_branch(block, BranchGenFn::TwoWay(fail_cond));
        let addr = self.branch_target(branchref, 0, target0, ctx0);

        let branch = self.branch_mut(branchref);
        branch.targets[0] = Some(target0);
        branch.dst_ctxs[0] = *ctx0;
        branch.dst_addrs[0] = Some(addr);
        branch.shape = BranchShape::Next1;

        let start = self.cb.write_pos();
        emit_branch_code(
            &mut self.cb,
            BranchGenFn::TwoWay(fail_cond),
            BranchShape::Next1,
            Some(addr),
            None,
        );
        let end = self.cb.write_pos();
        let branch = self.branch_mut(branchref);
        branch.start_pos = start;
        branch.end_pos = end;
        branchref
    }

    /// Unconditional transfer to `target`. Jumps directly when a version
    /// already exists; otherwise leaves a fallthrough edge for the driver
    /// to compile the destination immediately after this block.
    pub(crate) fn gen_direct_jump(
        &mut self,
        block: BlockRef,
        ctx: &Context,
        target: BlockId,
    ) -> BranchRef {
        let branchref = self.make_branch(block, BranchGenFn::Jump);
        self.branch_mut(branchref).targets[0] = Some(target);
        self.branch_mut(branchref).dst_ctxs[0] = *ctx;

        if let Some(dst) = self.find_block_version(target, ctx) {
            self.block_mut(dst).incoming.push(branchref);
            let addr = self.block(dst).start_addr.expect("linked target not finalized");
            let start = self.cb.write_pos();
            emit_branch_code(&mut self.cb, BranchGenFn::Jump, BranchShape::Default, Some(addr), None);
            let end = self.cb.write_pos();
            let branch = self.branch_mut(branchref);
            branch.dst_blocks[0] = Some(dst);
            branch.dst_addrs[0] = Some(addr);
            branch.start_pos = start;
            branch.end_pos = end;
        } else {
            // The driver places the target next; nothing to emit
            let pos = self.cb.write_pos();
            let branch = self.branch_mut(branchref);
            branch.shape = BranchShape::Next0;
            branch.start_pos = pos;
            branch.end_pos = pos;
        }
        branchref
    }

    /// Compile the same instruction again once live values are observable:
    /// a jump to a stub for this position at one deeper chain depth.
    pub(crate) fn defer_compilation(
        &mut self,
        block: BlockRef,
        blockid: BlockId,
        ctx: &Context,
    ) -> BranchRef {
        let mut next_ctx = *ctx;
        next_ctx.chain_depth = ctx.chain_depth.checked_add(1).expect("chain depth overflow");

        let branchref = self.make_branch(block, BranchGenFn::Jump);
        let addr = self.branch_target(branchref, 0, blockid, &next_ctx);

        let branch = self.branch_mut(branchref);
        branch.targets[0] = Some(blockid);
        branch.dst_ctxs[0] = next_ctx;
        branch.dst_addrs[0] = Some(addr);

        let start = self.cb.write_pos();
        emit_branch_code(&mut self.cb, BranchGenFn::Jump, BranchShape::Default, Some(addr), None);
        let end = self.cb.write_pos();
        let branch = self.branch_mut(branchref);
        branch.start_pos = start;
        branch.end_pos = end;
        branchref
    }

    /// The return continuation of a call: stores target 0's address into
    /// the callee frame's `jit_return` slot.
    pub(crate) fn gen_return_branch(
        &mut self,
        block: BlockRef,
        target: BlockId,
        ctx: &Context,
    ) -> BranchRef {
        let branchref = self.make_branch(block, BranchGenFn::JitReturn);
        let addr = self.branch_target(branchref, 0, target, ctx);

        let branch = self.branch_mut(branchref);
        branch.targets[0] = Some(target);
        branch.dst_ctxs[0] = *ctx;
        branch.dst_addrs[0] = Some(addr);

        let start = self.cb.write_pos();
        emit_branch_code(&mut self.cb, BranchGenFn::JitReturn, BranchShape::Default, Some(addr), None);
        let end = self.cb.write_pos();
        let branch = self.branch_mut(branchref);
        branch.start_pos = start;
        branch.end_pos = end;
        branchref
    }

    /// Re-emit a branch in place after a target address or shape change.
    pub(crate) fn regenerate_branch(&mut self, branchref: BranchRef) {
        let (start, old_end, gen_fn, shape, t0, t1, src_block) = {
            let b = self.branch(branchref);
            (b.start_pos, b.end_pos, b.gen_fn, b.shape, b.dst_addrs[0], b.dst_addrs[1], b.block)
        };
        if start < self.cb.frozen_bytes() {
            // Tracing already patched this region; leave it be
            return;
        }

        let at_arena_end = self.cb.write_pos() == old_end;
        let saved = self.cb.write_pos();
        self.cb.set_pos(start);
        emit_branch_code(&mut self.cb, gen_fn, shape, t0, t1);

        if at_arena_end {
            // Terminating branch may shrink, but its block must stay big
            // enough to take an invalidation jump over its entry
            let block_start = self.cb.pos_of(self.block(src_block).start_addr.unwrap());
            if self.cb.write_pos() < block_start + JMP_PTR_BYTES {
                self.cb.pad_to(block_start + JMP_PTR_BYTES);
            }
            let new_end = self.cb.write_pos();
            let end_ptr = self.cb.get_ptr(new_end);
            self.branch_mut(branchref).end_pos = new_end;
            self.block_mut(src_block).end_addr = Some(end_ptr);
        } else {
            assert!(
                self.cb.write_pos() <= old_end,
                "regenerated branch must fit its region"
            );
            self.cb.pad_to(old_end);
            self.cb.set_pos(saved);
        }
    }
}

impl Jit {
    /// Re-emit a branch whose rewrite may legitimately grow: when its
    /// fallthrough target was invalidated, the dead target's bytes up to
    /// `region_end` are available to grow into.
    pub(crate) fn regenerate_branch_in(&mut self, branchref: BranchRef, region_end: usize) {
        let (start, old_end, gen_fn, shape, t0, t1) = {
            let b = self.branch(branchref);
            (b.start_pos, b.end_pos, b.gen_fn, b.shape, b.dst_addrs[0], b.dst_addrs[1])
        };
        if start < self.cb.frozen_bytes() {
            return;
        }

        let saved = self.cb.write_pos();
        self.cb.set_pos(start);
        emit_branch_code(&mut self.cb, gen_fn, shape, t0, t1);
        let new_end = self.cb.write_pos();
        assert!(new_end <= region_end, "branch rewrite ran past the dead region");
        if new_end < old_end {
            self.cb.pad_to(old_end);
        }
        self.branch_mut(branchref).end_pos = new_end.max(old_end);
        // Never hand the cursor back inside the rewritten region
        self.cb.set_pos(saved.max(new_end));
    }
}

/// Branch-stub hit handler. Called from generated code with the world
/// stopped only by the JIT lock; compiles the missing target, links the
/// branch, and returns the address to resume at.
pub extern "C" fn branch_stub_hit(
    branch_idx: usize,
    target_idx: usize,
    ec: *mut ExecutionContext,
) -> *const u8 {
    crate::with_jit(|jit| branch_stub_hit_body(jit, branch_idx, target_idx, ec)).raw_ptr()
}

fn branch_stub_hit_body(
    jit: &mut Jit,
    branch_idx: usize,
    target_idx: usize,
    ec: *mut ExecutionContext,
) -> CodePtr {
    let branchref = BranchRef(branch_idx);
    incr_counter(crate::stats::Counter::BranchStubHit);

    // Another thread may have linked this target while we waited
    if let Some(dst) = jit.branch(branchref).dst_blocks[target_idx] {
        return jit.block(dst).start_addr.expect("linked block without code");
    }

    let blockid = jit.branch(branchref).targets[target_idx].expect("stub hit on empty target");
    let target_ctx = jit.branch(branchref).dst_ctxs[target_idx];

    // Sync the frame: jitted code leaves the interpreter-visible PC and SP
    // stale between materialization points, and compilation wants to peek
    // at live values. The SP nudge is undone before resuming.
    let (cfp, original_sp) = unsafe {
        let cfp: *mut ControlFrame = (*ec).cfp;
        let original_sp = (*cfp).sp;
        (*cfp).pc = blockid.iseq.pc_at(blockid.idx);
        (*cfp).sp = original_sp.offset(target_ctx.sp_offset as isize);
        (cfp, original_sp)
    };

    // A stub whose branch terminates the arena can become a fallthrough:
    // compact the branch and place the new block right after it.
    let branch_end = jit.branch(branchref).end_pos;
    if jit.cb.write_pos() == branch_end && jit.branch(branchref).start_pos >= jit.cb.frozen_bytes()
    {
        let shape = if target_idx == 0 { BranchShape::Next0 } else { BranchShape::Next1 };
        jit.branch_mut(branchref).shape = shape;
        jit.regenerate_branch(branchref);
    }

    let resume_addr = match jit
        .find_block_version(blockid, &target_ctx)
        .or_else(|| jit.gen_block_version(blockid, &target_ctx, ec))
    {
        Some(blockref) => {
            let dst_addr = jit.block(blockref).start_addr.expect("compiled block without code");
            jit.block_mut(blockref).incoming.push(branchref);
            let fallthrough_end = jit.cb.get_ptr(jit.branch(branchref).end_pos);
            let branch = jit.branch_mut(branchref);
            branch.dst_blocks[target_idx] = Some(blockref);
            branch.dst_addrs[target_idx] = Some(dst_addr);
            // The compaction above only holds if the block really did land
            // right after the branch; a reused version needs a full jump
            if dst_addr != fallthrough_end
                && matches!(
                    (branch.shape, target_idx),
                    (BranchShape::Next0, 0) | (BranchShape::Next1, 1)
                )
            {
                branch.shape = BranchShape::Default;
            }
            jit.regenerate_branch(branchref);
            dst_addr
        }
        None => {
            // Compilation refused: route this edge straight to the
            // interpreter at the target instruction
            let exit = crate::codegen::gen_outlined_exit(
                &mut jit.ocb,
                blockid.iseq.pc_at(blockid.idx),
                &target_ctx,
            );
            let branch = jit.branch_mut(branchref);
            branch.dst_addrs[target_idx] = Some(exit);
            if matches!(
                (branch.shape, target_idx),
                (BranchShape::Next0, 0) | (BranchShape::Next1, 1)
            ) {
                branch.shape = BranchShape::Default;
            }
            jit.regenerate_branch(branchref);
            exit
        }
    };

    // Undo the peek adjustment; the compiled code re-materializes SP itself
    unsafe { (*cfp).sp = original_sp };
    resume_addr
}
