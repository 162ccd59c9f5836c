//! Compilation and runtime counters
//!
//! Two producers feed the same cells: Rust code bumps them with relaxed
//! atomics, and generated code bumps the side-exit counters with a locked
//! add, which keeps them coherent across ractors without further
//! synchronization. Collection is gated on the `stats` option; the cells
//! always exist so codegen can embed their addresses unconditionally.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Everything the JIT counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Counter {
    // Compilation
    CompiledBlockCount,
    CompiledIseqEntry,
    CompileRefused,
    VersionLimitHit,
    BranchStubHit,
    DeferredCompilation,

    // Side exits taken at run time (bumped from generated code)
    ExitInterrupt,
    ExitGuardFixnum,
    ExitGuardClass,
    ExitOverflow,
    ExitWriteBarrier,
    ExitChainGuard,
    ExitBlockParam,
    ExitOptHelperUndef,
    ExitEntryPcMismatch,

    // Compile-time refusals by cause
    SendKeywords,
    SendSplat,
    SendBlockArg,
    SendArityMiss,
    SendUnsupportedDef,
    SendCfuncTracing,

    // Invalidation events
    InvalidateBlock,
    InvalidateMethodLookup,
    InvalidateBopRedefined,
    InvalidateRactorSpawn,
    InvalidateConstantState,
    InvalidateTracing,
}

const COUNTER_COUNT: usize = Counter::InvalidateTracing as usize + 1;

const COUNTER_NAMES: [&str; COUNTER_COUNT] = [
    "compiled_block_count",
    "compiled_iseq_entry",
    "compile_refused",
    "version_limit_hit",
    "branch_stub_hit",
    "deferred_compilation",
    "exit_interrupt",
    "exit_guard_fixnum",
    "exit_guard_class",
    "exit_overflow",
    "exit_write_barrier",
    "exit_chain_guard",
    "exit_block_param",
    "exit_opt_helper_undef",
    "exit_entry_pc_mismatch",
    "send_keywords",
    "send_splat",
    "send_block_arg",
    "send_arity_miss",
    "send_unsupported_def",
    "send_cfunc_tracing",
    "invalidate_block",
    "invalidate_method_lookup",
    "invalidate_bop_redefined",
    "invalidate_ractor_spawn",
    "invalidate_constant_state",
    "invalidate_tracing",
];

static COUNTERS: [AtomicU64; COUNTER_COUNT] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicU64 = AtomicU64::new(0);
    [ZERO; COUNTER_COUNT]
};

/// Bump a counter from Rust code.
pub fn incr_counter(counter: Counter) {
    if crate::options::get().gen_stats {
        COUNTERS[counter as usize].fetch_add(1, Ordering::Relaxed);
    }
}

/// Address of a counter cell, for the locked add emitted into exits.
pub fn counter_ptr(counter: Counter) -> *const u64 {
    COUNTERS[counter as usize].as_ptr() as *const u64
}

pub fn counter_value(counter: Counter) -> u64 {
    COUNTERS[counter as usize].load(Ordering::Relaxed)
}

/// Snapshot of the non-zero counters.
pub struct StatsReport;

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== JIT counters ===")?;
        for (i, name) in COUNTER_NAMES.iter().enumerate() {
            let val = COUNTERS[i].load(Ordering::Relaxed);
            if val != 0 {
                writeln!(f, "  {:<28} {}", name, val)?;
            }
        }
        Ok(())
    }
}
