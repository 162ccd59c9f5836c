//! Invalidation scenarios. Everything here mutates process-global VM state
//! (redefinition bitmaps, the constant serial, ractor mode), so the phases
//! run in one test, in order.

#![cfg(all(unix, target_arch = "x86_64"))]

mod common;

use common::*;

use vireo_jit::stats::{counter_value, Counter};
use vireo_jit::vm::iseq::{bump_constant_serial, constant_serial, IcEntry, IseqBuilder, IseqParam, Opcode};
use vireo_jit::vm::method::{
    redefine_basic_op, BasicOp, CallFlags, CallInfo, MethodId, RedefinitionFlag,
};
use vireo_jit::vm::value::{core_classes, RClass, RObject, Value, QNIL, QUNDEF};

extern "C" fn cfunc_one(_recv: Value) -> Value {
    Value::fixnum(1)
}

extern "C" fn cfunc_two(_recv: Value) -> Value {
    Value::fixnum(2)
}

#[test]
fn test_invalidation_lifecycle() {
    jit_init();
    method_redefinition_reroutes_call_site();
    bop_redefinition_kills_specialized_arithmetic();
    constant_state_bump_kills_cached_constant();
    ractor_spawn_kills_single_ractor_blocks();
}

/// Compile a call site, monkey-patch the method, and watch the same entry
/// transparently dispatch to the new definition through a fresh stub.
fn method_redefinition_reroutes_call_site() {
    let class = RClass::define("Patchable", core_classes().object);
    let mid = MethodId(500);
    define_cfunc_method(class, mid, cfunc_one as *const u8, 0);

    // Keep the send out of the entry block so the rerouted edge heals
    // without recompiling the entry
    let mut b = IseqBuilder::new();
    let ci = b.call_info(CallInfo { mid, argc: 0, flags: CallFlags::FCALL });
    b.op(Opcode::PutNil);
    b.op(Opcode::BranchIf).word(0);
    b.op(Opcode::PutSelf);
    b.op(Opcode::OptSendWithoutBlock).word(ci);
    b.op(Opcode::Leave);
    let iseq = b.build(0, IseqParam::default(), 2);

    let this = RObject::alloc(class, 0);
    let machine = make_machine(iseq, this, &[], None, 0);
    let entry = compile(iseq, &machine, 0);
    assert_eq!(run(entry, &machine), Value::fixnum(1));

    let invalidations_before = counter_value(Counter::InvalidateMethodLookup);
    define_cfunc_method(class, mid, cfunc_two as *const u8, 0);
    assert!(counter_value(Counter::InvalidateMethodLookup) > invalidations_before);

    // Same entry point, new behavior
    let machine2 = make_machine(iseq, this, &[], None, 0);
    assert_eq!(run(entry, &machine2), Value::fixnum(2));
}

/// Specialized fixnum subtraction dies with its basic-op assumption, and
/// the operator can never be specialized again.
fn bop_redefinition_kills_specialized_arithmetic() {
    let mut b = IseqBuilder::new();
    let ci = b.call_info(CallInfo { mid: MethodId(510), argc: 1, flags: CallFlags::empty() });
    b.op(Opcode::GetLocalWc0).word(3);
    b.op(Opcode::PutObjectFixOne);
    b.op(Opcode::OptMinus).word(ci);
    b.op(Opcode::Leave);
    let iseq = b.build(1, IseqParam::default(), 2);

    let m1 = make_machine(iseq, QNIL, &[Value::fixnum(10)], None, 0);
    let entry = compile(iseq, &m1, 0);
    assert_eq!(run(entry, &m1), Value::fixnum(9));

    let before = counter_value(Counter::InvalidateBopRedefined);
    redefine_basic_op(RedefinitionFlag::Integer, BasicOp::Minus);
    assert!(counter_value(Counter::InvalidateBopRedefined) > before);

    // The old code now leads straight to an interpreter exit
    let m2 = make_machine(iseq, QNIL, &[Value::fixnum(10)], None, 0);
    assert_eq!(run(entry, &m2), QUNDEF);

    // A fresh compile refuses to specialize the redefined operator
    let mut b2 = IseqBuilder::new();
    let ci2 = b2.call_info(CallInfo { mid: MethodId(511), argc: 1, flags: CallFlags::empty() });
    b2.op(Opcode::GetLocalWc0).word(3);
    b2.op(Opcode::PutObjectFixOne);
    b2.op(Opcode::OptMinus).word(ci2);
    b2.op(Opcode::Leave);
    let iseq2 = b2.build(1, IseqParam::default(), 2);
    let m3 = make_machine(iseq2, QNIL, &[Value::fixnum(10)], None, 0);
    let entry2 = compile(iseq2, &m3, 0);
    assert_eq!(run(entry2, &m3), QUNDEF);
}

fn build_const_iseq(value: Value) -> vireo_jit::vm::iseq::IseqPtr {
    // getinlinecache LABEL, ic; (fill region); setinlinecache; LABEL: leave
    let mut b = IseqBuilder::new();
    let ic_idx = b.inline_cache();
    b.op(Opcode::OptGetInlineCache).word(0).word(ic_idx);
    let fill_start = b.here();
    b.op(Opcode::PutNil);
    b.op(Opcode::OptSetInlineCache).word(ic_idx);
    let skip = b.here();
    b.op(Opcode::Leave);
    // Patch the skip offset, relative to the end of getinlinecache
    b.set_word(1, (skip - fill_start) as u64);

    let iseq = b.build(0, IseqParam::default(), 1);
    *iseq.body().inline_caches[ic_idx as usize].entry.lock() = Some(IcEntry {
        value,
        ic_serial: constant_serial(),
        cref_sensitive: false,
    });
    iseq
}

/// A cached constant compiles to a literal push; any constant assignment
/// invalidates it.
fn constant_state_bump_kills_cached_constant() {
    let iseq = build_const_iseq(Value::fixnum(5));
    let m1 = make_machine(iseq, QNIL, &[], None, 0);
    let entry = compile(iseq, &m1, 0);
    assert_eq!(run(entry, &m1), Value::fixnum(5));

    let before = counter_value(Counter::InvalidateConstantState);
    bump_constant_serial();
    assert!(counter_value(Counter::InvalidateConstantState) > before);

    let m2 = make_machine(iseq, QNIL, &[], None, 0);
    assert_eq!(run(entry, &m2), QUNDEF);
}

/// Spawning a second ractor invalidates everything that assumed there was
/// only one, and stops new constant-cache specialization entirely.
fn ractor_spawn_kills_single_ractor_blocks() {
    let iseq = build_const_iseq(Value::fixnum(6));
    let m1 = make_machine(iseq, QNIL, &[], None, 0);
    let entry = compile(iseq, &m1, 0);
    assert_eq!(run(entry, &m1), Value::fixnum(6));

    let before = counter_value(Counter::InvalidateRactorSpawn);
    vireo_jit::vm::ractor_spawn();
    assert!(counter_value(Counter::InvalidateRactorSpawn) > before);

    let m2 = make_machine(iseq, QNIL, &[], None, 0);
    assert_eq!(run(entry, &m2), QUNDEF);

    // Multi-ractor mode refuses the specialization outright
    let iseq2 = build_const_iseq(Value::fixnum(7));
    let m3 = make_machine(iseq2, QNIL, &[], None, 0);
    let entry2 = compile(iseq2, &m3, 0);
    assert_eq!(run(entry2, &m3), QUNDEF);
}
