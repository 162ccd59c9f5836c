//! Vireo JIT: the basic-block-versioning JIT tier of the Vireo VM
//!
//! The compiler translates the interpreter's stack bytecode into x86-64
//! machine code one basic-block version at a time, specializing each
//! version on the types and classes observed at run time. Control flow
//! between versions starts out routed through stubs and is patched to
//! direct jumps as targets get compiled; speculative assumptions are
//! tracked in a registry and invalidate dependent code when the host
//! reports monkey-patching, ractor spawn, constant writes, or tracing.
//!
//! All mutable JIT state (the two code arenas, the block/branch stores,
//! the version index, the assumption registry, and the tracing patch list)
//! lives behind one root handle guarded by a single lock, standing in for
//! the host's VM lock. Compilation, stub hits, and invalidation all enter
//! through it.

pub mod asm;
pub mod codegen;
pub mod core;
pub mod invariants;
pub mod options;
pub mod stats;
pub mod vm;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;

use crate::asm::{CodeBlock, CodePtr, ExecMem};
use crate::core::block::{Block, BlockRef};
use crate::core::branch::{Branch, BranchRef};
use crate::invariants::{CodePatch, Invariants};
use crate::vm::frame::ExecutionContext;
use crate::vm::iseq::IseqPtr;

/// The root JIT handle: one per process, acquired under [`with_jit`].
pub struct Jit {
    /// Inline arena: hot block code
    pub cb: CodeBlock,
    /// Outlined arena: stubs, side exits, cold paths
    pub ocb: CodeBlock,
    pub blocks: Vec<Block>,
    pub branches: Vec<Branch>,
    /// Per-iseq, per-instruction block version lists
    pub versions: FxHashMap<IseqPtr, FxHashMap<u32, Vec<BlockRef>>>,
    pub invariants: Invariants,
    /// Boundary patch points for tracing invalidation
    pub patches: Vec<CodePatch>,
    /// Shared epilogue jumped to when a frame returns to the interpreter
    pub leave_exit: Option<CodePtr>,
    /// Shared c-return routine used by patched cfunc return points
    pub cfunc_return_exit: Option<CodePtr>,
}

impl Jit {
    fn new(exec_mem_bytes: usize) -> Jit {
        let mem = ExecMem::alloc(exec_mem_bytes).expect("out of executable memory");
        let half = mem.size() / 2;
        let cb = CodeBlock::from_raw_parts(mem.as_ptr(), half);
        let ocb = CodeBlock::from_raw_parts(unsafe { mem.as_ptr().add(half) }, half);
        std::mem::forget(mem);
        Jit {
            cb,
            ocb,
            blocks: Vec::new(),
            branches: Vec::new(),
            versions: FxHashMap::default(),
            invariants: Invariants::default(),
            patches: Vec::new(),
            leave_exit: None,
            cfunc_return_exit: None,
        }
    }

    pub fn block(&self, blockref: BlockRef) -> &Block {
        &self.blocks[blockref.0]
    }

    pub fn block_mut(&mut self, blockref: BlockRef) -> &mut Block {
        &mut self.blocks[blockref.0]
    }

    pub fn branch(&self, branchref: BranchRef) -> &Branch {
        &self.branches[branchref.0]
    }

    pub fn branch_mut(&mut self, branchref: BranchRef) -> &mut Branch {
        &mut self.branches[branchref.0]
    }
}

static JIT: OnceCell<Mutex<Jit>> = OnceCell::new();

/// Initialize the JIT with the host-supplied options. Idempotent; the
/// first caller wins.
pub fn init(opts: options::Options) {
    options::install(opts);
    let _ = JIT.set(Mutex::new(Jit::new(options::get().exec_mem_size * 1024 * 1024)));
}

/// True once [`init`] (or the first compile request) has run.
pub fn initialized() -> bool {
    JIT.get().is_some()
}

/// Acquire the JIT root handle. Models taking the host VM lock: every
/// compile, stub hit, patch, and invalidation goes through here.
pub fn with_jit<R>(f: impl FnOnce(&mut Jit) -> R) -> R {
    let mutex =
        JIT.get_or_init(|| Mutex::new(Jit::new(options::get().exec_mem_size * 1024 * 1024)));
    let mut guard: MutexGuard<'_, Jit> = mutex.lock();
    f(&mut guard)
}

/// Like [`with_jit`], but does nothing when the JIT was never initialized.
/// Host invalidation hooks use this so a JIT-less process pays nothing.
pub fn with_jit_if_enabled(f: impl FnOnce(&mut Jit)) {
    if let Some(mutex) = JIT.get() {
        f(&mut mutex.lock());
    }
}

/// Compile an entry point into `iseq` at `insn_idx` and return its address,
/// or `None` when compilation is refused. The returned code conforms to
/// the JIT call ABI: `fn(ec, cfp) -> Value`, returning the undefined
/// sentinel when execution must resume in the interpreter.
pub fn compile_iseq_entry(
    iseq: IseqPtr,
    ec: *mut ExecutionContext,
    insn_idx: u32,
) -> Option<CodePtr> {
    with_jit(|jit| codegen::gen_entry_point(jit, iseq, ec, insn_idx))
}

/// Iterate the byte offsets of heap values embedded in `iseq`'s compiled
/// code, for the host GC's mark/compact phases.
pub fn for_each_object_offset(iseq: IseqPtr, mut f: impl FnMut(CodePtr)) {
    with_jit_if_enabled(|jit| {
        if let Some(by_idx) = jit.versions.get(&iseq) {
            for blocks in by_idx.values() {
                for &blockref in blocks {
                    let block = jit.block(blockref);
                    if let Some(start) = block.start_addr {
                        for &off in &block.gc_obj_offsets {
                            f(CodePtr((start.as_usize() + off as usize) as *const u8));
                        }
                    }
                }
            }
        }
    });
}
