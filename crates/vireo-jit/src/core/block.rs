//! Block versions and the version index
//!
//! A block version is one compiled specialization of a linear bytecode
//! range, keyed by its entry [`Context`]. The version index maps
//! `(iseq, instruction index)` to every live version there; lookups pick
//! the closest compatible version, and a per-position cap forces a generic
//! fallback version once too many specializations accumulate.
//!
//! Invalidation makes a version unreachable without freeing it: the block
//! leaves the index, its entry gets overwritten with a jump to a side
//! exit, and every incoming branch is rewritten to target a fresh stub.

use crate::asm::CodePtr;
use crate::codegen::JMP_PTR_BYTES;
use crate::core::branch::{BranchRef, BranchShape};
use crate::core::context::{Context, CtxDiff};
use crate::stats::{incr_counter, Counter};
use crate::vm::frame::ExecutionContext;
use crate::vm::iseq::IseqPtr;
use crate::Jit;

/// A bytecode location: one instruction in one iseq.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub iseq: IseqPtr,
    pub idx: u32,
}

/// Index of a block in the root store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef(pub usize);

pub struct Block {
    pub blockid: BlockId,
    /// Index one past the last instruction covered
    pub end_idx: u32,
    /// Entry context; the version key
    pub ctx: Context,
    pub start_addr: Option<CodePtr>,
    pub end_addr: Option<CodePtr>,
    /// Branches that jump into this block
    pub incoming: Vec<BranchRef>,
    /// Branches out of this block; destroyed with it
    pub outgoing: Vec<BranchRef>,
    /// Offsets of heap-value immediates in the code, for GC mark/compact
    pub gc_obj_offsets: Vec<u32>,
    /// Method entries this code embeds pointers to; kept alive with it
    pub cme_refs: Vec<std::sync::Arc<crate::vm::method::MethodEntry>>,
    /// Side exit replicating the entry state; invalidation jumps here
    pub entry_exit: Option<CodePtr>,
    /// Unlinked and leaked, awaiting quiescence
    pub invalidated: bool,
}

impl Jit {
    pub(crate) fn make_block(&mut self, blockid: BlockId, ctx: &Context) -> BlockRef {
        self.blocks.push(Block {
            blockid,
            end_idx: blockid.idx,
            ctx: *ctx,
            start_addr: None,
            end_addr: None,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            gc_obj_offsets: Vec::new(),
            cme_refs: Vec::new(),
            entry_exit: None,
            invalidated: false,
        });
        BlockRef(self.blocks.len() - 1)
    }

    fn version_list(&self, blockid: BlockId) -> &[BlockRef] {
        self.versions
            .get(&blockid.iseq)
            .and_then(|m| m.get(&blockid.idx))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn version_count(&self, blockid: BlockId) -> usize {
        self.version_list(blockid).len()
    }

    /// Find the closest existing version code compiled for `ctx` may jump
    /// to. Never returns a version stricter than `ctx`.
    pub fn find_block_version(&self, blockid: BlockId, ctx: &Context) -> Option<BlockRef> {
        let mut best: Option<(BlockRef, usize)> = None;
        for &blockref in self.version_list(blockid) {
            let block = self.block(blockref);
            if let CtxDiff::Compatible(d) = ctx.diff(&block.ctx) {
                if best.map_or(true, |(_, bd)| d < bd) {
                    best = Some((blockref, d));
                }
            }
        }

        // Greedy versioning keeps specializing until the cap forces reuse
        if let Some((_, d)) = best {
            if d > 0
                && crate::options::get().greedy_versioning
                && self.version_list(blockid).len() < crate::options::get().max_versions
            {
                return None;
            }
        }
        best.map(|(b, _)| b)
    }

    /// Entry context to actually compile for: `ctx` itself, or the generic
    /// shape once this position is at the version cap.
    pub fn limit_block_versions(&self, blockid: BlockId, ctx: &Context) -> Context {
        if ctx.chain_depth > 0 {
            // Guard-chain members are keyed exactly
            return *ctx;
        }
        if self.version_count(blockid) < crate::options::get().max_versions {
            return *ctx;
        }
        let generic = ctx.generic();
        debug_assert!(matches!(ctx.diff(&generic), CtxDiff::Compatible(_)));
        incr_counter(Counter::VersionLimitHit);
        generic
    }

    pub(crate) fn add_block_version(&mut self, blockref: BlockRef) {
        let blockid = self.block(blockref).blockid;
        self.versions
            .entry(blockid.iseq)
            .or_default()
            .entry(blockid.idx)
            .or_default()
            .push(blockref);
    }

    pub(crate) fn remove_block_version(&mut self, blockref: BlockRef) {
        let blockid = self.block(blockref).blockid;
        if let Some(by_idx) = self.versions.get_mut(&blockid.iseq) {
            if let Some(list) = by_idx.get_mut(&blockid.idx) {
                list.retain(|&b| b != blockref);
            }
        }
    }

    /// Compile a series of block versions starting at `blockid`: the first
    /// block plus every fallthrough successor it opens up. Returns the
    /// first block, or `None` when compilation is refused.
    pub fn gen_block_version(
        &mut self,
        blockid: BlockId,
        start_ctx: &Context,
        ec: *mut ExecutionContext,
    ) -> Option<BlockRef> {
        let ctx = self.limit_block_versions(blockid, start_ctx);
        let first = match crate::codegen::gen_single_block(self, blockid, &ctx, ec) {
            Ok(b) => b,
            Err(_) => {
                incr_counter(Counter::CompileRefused);
                return None;
            }
        };
        self.add_block_version(first);

        // Keep laying fallthrough successors right after their predecessor
        let mut prev = first;
        loop {
            let pending = {
                let block = self.block(prev);
                match block.outgoing.last().copied() {
                    Some(br) if self.branch(br).dst_addrs[0].is_none() => Some(br),
                    _ => None,
                }
            };
            let Some(branchref) = pending else { break };
            let target = self.branch(branchref).targets[0].expect("fallthrough without target");
            let target_ctx = self.branch(branchref).dst_ctxs[0];

            // A version may exist by now (loops close back on blocks this
            // same series just registered); jump to it instead
            if let Some(existing) = self.find_block_version(target, &target_ctx) {
                let addr = self.block(existing).start_addr.expect("block without code");
                self.block_mut(existing).incoming.push(branchref);
                let branch = self.branch_mut(branchref);
                branch.dst_blocks[0] = Some(existing);
                branch.dst_addrs[0] = Some(addr);
                branch.shape = BranchShape::Default;
                self.regenerate_branch(branchref);
                break;
            }

            let next_ctx = self.limit_block_versions(target, &target_ctx);
            let next = match crate::codegen::gen_single_block(self, target, &next_ctx, ec) {
                Ok(b) => b,
                Err(_) => {
                    // Roll the edge over to an interpreter exit so the
                    // series stays consistent
                    let exit = crate::codegen::gen_outlined_exit(
                        &mut self.ocb,
                        target.iseq.pc_at(target.idx),
                        &target_ctx,
                    );
                    let branch = self.branch_mut(branchref);
                    branch.dst_addrs[0] = Some(exit);
                    // The target is no longer placed next; emit a real jump
                    branch.shape = BranchShape::Default;
                    self.regenerate_branch(branchref);
                    incr_counter(Counter::CompileRefused);
                    break;
                }
            };
            self.add_block_version(next);
            let addr = self.block(next).start_addr.expect("block without code");
            self.block_mut(next).incoming.push(branchref);
            let branch = self.branch_mut(branchref);
            branch.dst_blocks[0] = Some(next);
            branch.dst_addrs[0] = Some(addr);
            debug_assert_eq!(branch.shape, BranchShape::Next0);
            prev = next;
        }

        Some(first)
    }

    /// Make sure the block has an outlined exit replicating its entry
    /// state. Required before registering any assumption, so invalidation
    /// always has somewhere to send the entry jump.
    pub(crate) fn ensure_block_entry_exit(&mut self, blockref: BlockRef) {
        if self.block(blockref).entry_exit.is_some() {
            return;
        }
        let (blockid, ctx) = {
            let b = self.block(blockref);
            (b.blockid, b.ctx)
        };
        let exit =
            crate::codegen::gen_outlined_exit(&mut self.ocb, blockid.iseq.pc_at(blockid.idx), &ctx);
        self.block_mut(blockref).entry_exit = Some(exit);
    }

    /// Invalidate one block version: unlink it from the index, overwrite
    /// its entry with a jump to its entry exit, and point every incoming
    /// branch back at a stub. The storage leaks until quiescence.
    pub fn invalidate_block_version(&mut self, blockref: BlockRef) {
        if self.block(blockref).invalidated {
            return;
        }
        incr_counter(Counter::InvalidateBlock);

        self.remove_block_version(blockref);
        self.invariants.forget_block(blockref);

        let (blockid, start_addr, end_addr) = {
            let b = self.block(blockref);
            (b.blockid, b.start_addr, b.end_addr)
        };
        let (Some(start_addr), Some(end_addr)) = (start_addr, end_addr) else {
            // Never finished compiling; nothing is reachable
            self.block_mut(blockref).invalidated = true;
            return;
        };
        let start_pos = self.cb.pos_of(start_addr);
        let end_pos = self.cb.pos_of(end_addr);

        // Send the block's own entry to the interpreter, so anything that
        // still reaches the old code leaves immediately
        if start_pos >= self.cb.frozen_bytes() {
            self.ensure_block_entry_exit(blockref);
            let exit = self.block(blockref).entry_exit.unwrap();
            debug_assert!(end_pos - start_pos >= JMP_PTR_BYTES, "block too small to patch");
            let saved = self.cb.write_pos();
            self.cb.set_pos(start_pos);
            self.cb.jmp_ptr(exit);
            self.cb.set_pos(saved);
        }

        // Re-route every incoming branch through a fresh stub
        let incoming = std::mem::take(&mut self.block_mut(blockref).incoming);
        for branchref in incoming {
            let target_idx = {
                let b = self.branch(branchref);
                match b.dst_blocks.iter().position(|&d| d == Some(blockref)) {
                    Some(i) => i,
                    None => continue,
                }
            };
            let stub = self.gen_branch_stub_for(branchref, target_idx);
            let was_fallthrough = {
                let b = self.branch_mut(branchref);
                b.dst_blocks[target_idx] = None;
                b.dst_addrs[target_idx] = Some(stub);
                let fallthrough = matches!(
                    (b.shape, target_idx),
                    (BranchShape::Next0, 0) | (BranchShape::Next1, 1)
                );
                if fallthrough {
                    // The target no longer follows: the rewrite needs a
                    // real jump, growing into the dead block's bytes
                    b.shape = BranchShape::Default;
                }
                fallthrough
            };
            if was_fallthrough {
                self.regenerate_branch_in(branchref, end_pos);
            } else {
                self.regenerate_branch(branchref);
            }
        }

        self.block_mut(blockref).invalidated = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Type;

    fn test_blockid() -> BlockId {
        use crate::vm::iseq::{IseqBuilder, IseqParam, Opcode};
        let mut b = IseqBuilder::new();
        b.op(Opcode::PutNil);
        b.op(Opcode::Leave);
        BlockId { iseq: b.build(0, IseqParam::default(), 1), idx: 0 }
    }

    #[test]
    fn test_version_index_add_find_remove() {
        crate::with_jit(|jit| {
            let blockid = test_blockid();
            let mut ctx = Context::default();
            ctx.stack_push(Type::Fixnum);

            let blockref = jit.make_block(blockid, &ctx);
            jit.blocks[blockref.0].start_addr = Some(jit.cb.get_ptr(0));
            jit.add_block_version(blockref);

            // Exact context finds it
            assert_eq!(jit.find_block_version(blockid, &ctx), Some(blockref));
            // A looser context cannot use the specialized version
            let mut loose = Context::default();
            loose.stack_push(Type::Unknown);
            assert_eq!(jit.find_block_version(blockid, &loose), None);
            // A stricter context can
            let mut strict = ctx;
            strict.upgrade_opnd_type(crate::core::context::InsnOpnd::StackOpnd(0), Type::Fixnum);
            assert_eq!(jit.find_block_version(blockid, &strict), Some(blockref));

            jit.remove_block_version(blockref);
            assert_eq!(jit.find_block_version(blockid, &ctx), None);
        });
    }

    #[test]
    fn test_version_limit_falls_back_to_generic() {
        crate::with_jit(|jit| {
            let blockid = test_blockid();
            let max = crate::options::get().max_versions;
            for i in 0..max {
                let mut ctx = Context::default();
                ctx.stack_push(if i % 2 == 0 { Type::Fixnum } else { Type::Flonum });
                ctx.set_local_type(0, if i < 2 { Type::Nil } else { Type::True });
                let blockref = jit.make_block(blockid, &ctx);
                jit.blocks[blockref.0].start_addr = Some(jit.cb.get_ptr(0));
                jit.add_block_version(blockref);
            }

            let mut ctx = Context::default();
            ctx.stack_push(Type::TArray);
            let limited = jit.limit_block_versions(blockid, &ctx);
            assert_eq!(
                limited.get_opnd_type(crate::core::context::InsnOpnd::StackOpnd(0)),
                Type::Unknown
            );
            assert_eq!(limited.stack_size, 1);
        });
    }
}
