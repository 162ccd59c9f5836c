//! Speculative assumptions and their invalidation
//!
//! Code generation is allowed to bake in facts about the VM (a method
//! lookup result, an unredefined basic operator, single-ractor mode, the
//! constant state) provided it registers each fact here first. The host
//! reports every event that could falsify one, and each registered block
//! is invalidated before user code can observe stale behavior.
//!
//! Enabling c-call/c-return tracing invalidates everything at once: block
//! versions leave their indices, every recorded boundary patch point is
//! overwritten with a jump to its outlined exit, and the patched prefix of
//! the inline arena is frozen for good.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::core::block::BlockRef;
use crate::stats::{incr_counter, Counter};
use crate::vm::method::{BasicOp, MethodId, RedefinitionFlag};
use crate::vm::value::Value;
use crate::{with_jit_if_enabled, Jit};

/// One registered speculative fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Subject {
    BasicOp(RedefinitionFlag, BasicOp),
    MethodLookup(Value, MethodId),
    SingleRactor,
    ConstantState,
}

/// A recorded boundary patch point: an inline resume position and the
/// outlined code tracing invalidation redirects it to.
#[derive(Debug, Clone, Copy)]
pub struct CodePatch {
    pub inline_pos: usize,
    pub outlined_pos: usize,
}

/// Reverse indices from assumption subjects to dependent blocks.
#[derive(Default)]
pub struct Invariants {
    basic_operators: FxHashMap<(RedefinitionFlag, BasicOp), FxHashSet<BlockRef>>,
    method_lookup: FxHashMap<(Value, MethodId), FxHashSet<BlockRef>>,
    single_ractor: FxHashSet<BlockRef>,
    constant_state: FxHashSet<BlockRef>,
    /// Per-block list of registered subjects, for O(subjects) teardown
    block_subjects: FxHashMap<BlockRef, Vec<Subject>>,
    /// Tracing invalidation already ran; the world stays deoptimized
    tracing_invalidated: bool,
}

impl Invariants {
    fn register(&mut self, blockref: BlockRef, subject: Subject) {
        let set = match subject {
            Subject::BasicOp(klass, op) => self.basic_operators.entry((klass, op)).or_default(),
            Subject::MethodLookup(klass, mid) => {
                self.method_lookup.entry((klass, mid)).or_default()
            }
            Subject::SingleRactor => &mut self.single_ractor,
            Subject::ConstantState => &mut self.constant_state,
        };
        if set.insert(blockref) {
            self.block_subjects.entry(blockref).or_default().push(subject);
        }
    }

    /// Drop every registration the block made. Called when the block is
    /// invalidated or the world deoptimizes.
    pub fn forget_block(&mut self, blockref: BlockRef) {
        let Some(subjects) = self.block_subjects.remove(&blockref) else {
            return;
        };
        for subject in subjects {
            match subject {
                Subject::BasicOp(klass, op) => {
                    if let Some(set) = self.basic_operators.get_mut(&(klass, op)) {
                        set.remove(&blockref);
                    }
                }
                Subject::MethodLookup(klass, mid) => {
                    if let Some(set) = self.method_lookup.get_mut(&(klass, mid)) {
                        set.remove(&blockref);
                    }
                }
                Subject::SingleRactor => {
                    self.single_ractor.remove(&blockref);
                }
                Subject::ConstantState => {
                    self.constant_state.remove(&blockref);
                }
            }
        }
    }
}

impl Jit {
    /// Compile on the assumption that `op` on `klass` keeps its builtin
    /// meaning. False when the operator is already redefined.
    pub fn assume_bop_not_redefined(
        &mut self,
        blockref: BlockRef,
        klass: RedefinitionFlag,
        op: BasicOp,
    ) -> bool {
        if !crate::vm::method::basic_op_unredefined(klass, op) {
            return false;
        }
        self.ensure_block_entry_exit(blockref);
        self.invariants.register(blockref, Subject::BasicOp(klass, op));
        true
    }

    /// Compile on the assumption that `mid` on `klass` keeps resolving to
    /// the entry observed now.
    pub fn assume_method_lookup_stable(
        &mut self,
        blockref: BlockRef,
        klass: Value,
        mid: MethodId,
    ) {
        self.ensure_block_entry_exit(blockref);
        self.invariants.register(blockref, Subject::MethodLookup(klass, mid));
    }

    /// Compile on the assumption that only one ractor exists. False when
    /// that already stopped being true.
    pub fn assume_single_ractor_mode(&mut self, blockref: BlockRef) -> bool {
        if crate::vm::multi_ractor_p() {
            return false;
        }
        self.ensure_block_entry_exit(blockref);
        self.invariants.register(blockref, Subject::SingleRactor);
        true
    }

    /// Compile on the assumption that no constant is reassigned.
    pub fn assume_stable_constant_state(&mut self, blockref: BlockRef) {
        self.ensure_block_entry_exit(blockref);
        self.invariants.register(blockref, Subject::ConstantState);
    }
}

fn invalidate_set(jit: &mut Jit, set: Option<FxHashSet<BlockRef>>, reason: Counter) {
    if let Some(set) = set {
        for blockref in set {
            jit.invalidate_block_version(blockref);
            incr_counter(reason);
        }
    }
}

/// Host callback: `rb_callable_method_entry(klass, mid)` is about to
/// change (redefinition, removal, include/prepend, refinement activation).
pub fn method_lookup_changed(klass: Value, mid: MethodId) {
    with_jit_if_enabled(|jit| {
        let set = jit.invariants.method_lookup.remove(&(klass, mid));
        invalidate_set(jit, set, Counter::InvalidateMethodLookup);
    });
}

/// Host callback: a basic operator was redefined on a core class.
pub fn bop_redefined(klass: RedefinitionFlag, op: BasicOp) {
    with_jit_if_enabled(|jit| {
        let set = jit.invariants.basic_operators.remove(&(klass, op));
        invalidate_set(jit, set, Counter::InvalidateBopRedefined);
    });
}

/// Host callback: a second ractor is about to spawn.
pub fn before_ractor_spawn() {
    with_jit_if_enabled(|jit| {
        let set = std::mem::take(&mut jit.invariants.single_ractor);
        invalidate_set(jit, Some(set), Counter::InvalidateRactorSpawn);
    });
}

/// Host callback: the global constant state was bumped.
pub fn constant_state_changed() {
    with_jit_if_enabled(|jit| {
        let set = std::mem::take(&mut jit.invariants.constant_state);
        invalidate_set(jit, Some(set), Counter::InvalidateConstantState);
    });
}

/// Host callback: c-call/c-return tracing was enabled. Makes all generated
/// code unreachable without freeing any of it: in-flight frames resume at
/// their next boundary patch point, which now jumps to an exit (or, for
/// C-function returns, through the routine that fires the c-return hook).
pub fn tracing_invalidate_all() {
    with_jit_if_enabled(|jit| {
        if jit.invariants.tracing_invalidated {
            return;
        }
        jit.invariants.tracing_invalidated = true;
        incr_counter(Counter::InvalidateTracing);

        // No version may be targeted by new edges or entries
        let all_blocks: Vec<BlockRef> = jit
            .versions
            .values()
            .flat_map(|by_idx| by_idx.values())
            .flatten()
            .copied()
            .collect();
        jit.versions.clear();
        for blockref in all_blocks {
            jit.invariants.forget_block(blockref);
            jit.block_mut(blockref).invalidated = true;
        }

        // Rewrite every boundary patch point into a jump to its outlined
        // exit, then freeze the patched region for good
        let old_pos = jit.cb.write_pos();
        let patches = std::mem::take(&mut jit.patches);
        for patch in &patches {
            let target = jit.ocb.get_ptr(patch.outlined_pos);
            jit.cb.set_pos(patch.inline_pos);
            jit.cb.jmp_ptr(target);
        }
        jit.cb.set_pos(old_pos);
        jit.cb.freeze_up_to(old_pos);
    });
}
