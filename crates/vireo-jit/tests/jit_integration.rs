//! End-to-end scenarios: build iseqs the way the host compiler would,
//! compile entries, and execute the generated x86-64 code against live
//! frames.

#![cfg(all(unix, target_arch = "x86_64"))]

mod common;

use common::*;

use vireo_jit::vm::frame::BLOCK_HANDLER_ISEQ_TAG;
use vireo_jit::vm::iseq::{
    BuiltinFunc, Iseq, IseqBody, IseqBuilder, IseqParam, Opcode, ParamFlags,
};
use vireo_jit::vm::method::{CallFlags, CallInfo, MethodId, Visibility};
use vireo_jit::vm::value::{
    core_classes, IvarId, RArray, RClass, RHash, RObject, RRange, RString, Value, QNIL, QTRUE,
    QUNDEF,
};

#[test]
fn test_fixnum_addition_loop() {
    jit_init();
    const N: i64 = 100_000;

    // a = 0; while a < N; a = a + 1; end; a
    let mut b = IseqBuilder::new();
    let ci_lt = b.call_info(CallInfo { mid: MethodId(100), argc: 1, flags: CallFlags::empty() });
    let ci_plus = b.call_info(CallInfo { mid: MethodId(101), argc: 1, flags: CallFlags::empty() });
    let slot_a = 3; // one local

    b.op(Opcode::PutObjectFixZero);
    b.op(Opcode::SetLocalWc0).word(slot_a);
    let loop_head = b.here();
    b.op(Opcode::GetLocalWc0).word(slot_a);
    b.op(Opcode::PutObject).value(Value::fixnum(N));
    b.op(Opcode::OptLt).word(ci_lt);
    b.op(Opcode::BranchUnless).word(0); // patched below
    let branch_operand = b.here() - 1;
    let branch_next = b.here();
    b.op(Opcode::GetLocalWc0).word(slot_a);
    b.op(Opcode::PutObjectFixOne);
    b.op(Opcode::OptPlus).word(ci_plus);
    b.op(Opcode::SetLocalWc0).word(slot_a);
    let jump_at = b.here();
    b.op(Opcode::Jump).word((loop_head as i64 - (jump_at + 2) as i64) as u64);
    let exit_idx = b.here();
    b.op(Opcode::GetLocalWc0).word(slot_a);
    b.op(Opcode::Leave);
    b.set_word(branch_operand, (exit_idx - branch_next) as u64);

    let iseq = b.build(1, IseqParam::default(), 2);
    let obj = RObject::alloc(core_classes().object, 0);
    let machine = make_machine(iseq, obj, &[QNIL], None, 0);
    let entry = compile(iseq, &machine, 0);

    assert_eq!(run(entry, &machine), Value::fixnum(N));
}

#[test]
fn test_overflow_side_exit_restores_interpreter_state() {
    jit_init();
    let max_fixnum = i64::MAX >> 1;

    let mut b = IseqBuilder::new();
    let ci = b.call_info(CallInfo { mid: MethodId(110), argc: 1, flags: CallFlags::empty() });
    b.op(Opcode::PutObject).value(Value::fixnum(max_fixnum));
    b.op(Opcode::PutObjectFixOne);
    let plus_idx = b.here();
    b.op(Opcode::OptPlus).word(ci);
    b.op(Opcode::Leave);
    let iseq = b.build(0, IseqParam::default(), 2);

    let machine = make_machine(iseq, QNIL, &[], None, 0);
    let entry = compile(iseq, &machine, 0);
    let bp = unsafe { (*machine.cfp).sp };

    // Overflow falls back to the interpreter, re-executing opt_plus with
    // both operands back on the stack
    assert_eq!(run(entry, &machine), QUNDEF);
    unsafe {
        assert_eq!((*machine.cfp).pc, iseq.pc_at(plus_idx));
        assert_eq!((*machine.cfp).sp, bp.add(2));
        assert_eq!(*bp, Value::fixnum(max_fixnum));
        assert_eq!(*bp.add(1), Value::fixnum(1));
    }
}

fn build_aref_iseq() -> vireo_jit::vm::iseq::IseqPtr {
    // f(x) = x[0]
    let mut b = IseqBuilder::new();
    let ci = b.call_info(CallInfo { mid: MethodId(120), argc: 1, flags: CallFlags::empty() });
    b.op(Opcode::GetLocalWc0).word(3);
    b.op(Opcode::PutObjectFixZero);
    b.op(Opcode::OptAref).word(ci);
    b.op(Opcode::Leave);
    b.build(1, IseqParam::default(), 2)
}

#[test]
fn test_polymorphic_aref_guard_chain() {
    jit_init();
    let iseq = build_aref_iseq();
    let this = RObject::alloc(core_classes().object, 0);

    // First receiver: an array; deferred compile specializes on it
    let ary = RArray::alloc(vec![Value::fixnum(8), Value::fixnum(9)]);
    let m1 = make_machine(iseq, this, &[ary], None, 0);
    let entry = compile(iseq, &m1, 0);
    assert_eq!(run(entry, &m1), Value::fixnum(8));

    // Second receiver: a hash; the chain grows one link
    let val = RString::alloc("a");
    let hash = RHash::alloc(vec![(Value::fixnum(0), val)]);
    let m2 = make_machine(iseq, this, &[hash], None, 0);
    assert_eq!(run(entry, &m2), val);

    // The array path still works after the chain grew
    let m3 = make_machine(iseq, this, &[ary], None, 0);
    assert_eq!(run(entry, &m3), Value::fixnum(8));

    // Third receiver class: past the chain cap, dispatch falls back to a
    // full send, and this class has no [] method for the interpreter
    let plain = RObject::alloc(RClass::define("ArefPlain", core_classes().object), 0);
    let m4 = make_machine(iseq, this, &[plain], None, 0);
    assert_eq!(run(entry, &m4), QUNDEF);
}

#[test]
fn test_send_to_interpreted_method_and_return() {
    jit_init();
    let class = RClass::define("Adder", core_classes().object);
    let mid = MethodId(130);

    // def add1(x) = x + 1
    let mut cb = IseqBuilder::new();
    let ci_plus = cb.call_info(CallInfo { mid: MethodId(131), argc: 1, flags: CallFlags::empty() });
    cb.op(Opcode::GetLocalWc0).word(3);
    cb.op(Opcode::PutObjectFixOne);
    cb.op(Opcode::OptPlus).word(ci_plus);
    cb.op(Opcode::Leave);
    let callee = cb.build(
        1,
        IseqParam { size: 1, lead_num: 1, ..IseqParam::default() },
        2,
    );
    define_iseq_method(class, mid, callee, Visibility::Public);

    // self.add1(5)
    let mut caller = IseqBuilder::new();
    let ci = caller.call_info(CallInfo { mid, argc: 1, flags: CallFlags::FCALL });
    caller.op(Opcode::PutSelf);
    caller.op(Opcode::PutObject).value(Value::fixnum(5));
    caller.op(Opcode::OptSendWithoutBlock).word(ci);
    caller.op(Opcode::Leave);
    let caller_iseq = caller.build(0, IseqParam::default(), 3);

    let this = RObject::alloc(class, 0);
    let machine = make_machine(caller_iseq, this, &[], None, 0);
    let entry = compile(caller_iseq, &machine, 0);
    assert_eq!(run(entry, &machine), Value::fixnum(6));

    // Run it again: everything is linked now, no stubs left to hit
    let machine2 = make_machine(caller_iseq, this, &[], None, 0);
    assert_eq!(run(entry, &machine2), Value::fixnum(6));
}

#[test]
fn test_optional_parameter_entry_pc_guard() {
    jit_init();

    // def f(a, b = 2) = a + b
    let mut b = IseqBuilder::new();
    let ci = b.call_info(CallInfo { mid: MethodId(140), argc: 1, flags: CallFlags::empty() });
    let (slot_a, slot_b) = (4, 3); // two locals
    b.op(Opcode::PutObject).value(Value::fixnum(2));
    b.op(Opcode::SetLocalWc0).word(slot_b);
    let body_start = b.here();
    b.op(Opcode::GetLocalWc0).word(slot_a);
    b.op(Opcode::GetLocalWc0).word(slot_b);
    b.op(Opcode::OptPlus).word(ci);
    b.op(Opcode::Leave);
    let iseq = b.build(
        2,
        IseqParam {
            size: 2,
            lead_num: 1,
            opt_num: 1,
            opt_table: vec![0, body_start],
            flags: ParamFlags::HAS_OPT,
        },
        2,
    );

    // One argument: enters at the default-filling prologue
    let m1 = make_machine(iseq, QNIL, &[Value::fixnum(10)], None, 0);
    let entry0 = compile(iseq, &m1, 0);
    assert_eq!(run(entry0, &m1), Value::fixnum(12));

    // Two arguments enter at the body; the zero-index entry refuses them
    let m2 = make_machine(iseq, QNIL, &[Value::fixnum(10), Value::fixnum(30)], None, body_start);
    assert_eq!(run(entry0, &m2), QUNDEF);

    let entry_body = compile(iseq, &m2, body_start);
    assert_eq!(run(entry_body, &m2), Value::fixnum(40));
}

#[test]
fn test_deferred_ivar_specialization_and_chain() {
    jit_init();
    let ivar = IvarId(7);

    let class_w = RClass::define("WidgetIvar", core_classes().object);
    class_w.as_rclass().set_ivar_index(ivar, 0);
    let obj_w = RObject::alloc(class_w, 1);
    *obj_w.as_robject().ivar_slot(0) = Value::fixnum(7);

    let mut b = IseqBuilder::new();
    b.op(Opcode::PutNil);
    b.op(Opcode::Pop);
    b.op(Opcode::GetInstanceVariable).word(ivar.0 as u64);
    b.op(Opcode::Leave);
    let iseq = b.build(0, IseqParam::default(), 1);

    let m1 = make_machine(iseq, obj_w, &[], None, 0);
    let entry = compile(iseq, &m1, 0);
    assert_eq!(run(entry, &m1), Value::fixnum(7));

    // A second receiver class extends the guard chain with its own version
    let class_v = RClass::define("WidgetIvarB", core_classes().object);
    class_v.as_rclass().set_ivar_index(ivar, 0);
    let obj_v = RObject::alloc(class_v, 1);
    *obj_v.as_robject().ivar_slot(0) = Value::fixnum(9);
    let m2 = make_machine(iseq, obj_v, &[], None, 0);
    assert_eq!(run(entry, &m2), Value::fixnum(9));

    // An unset ivar on yet another class reads as nil through the
    // generic path
    let class_u = RClass::define("WidgetIvarC", core_classes().object);
    let obj_u = RObject::alloc(class_u, 1);
    let m3 = make_machine(iseq, obj_u, &[], None, 0);
    assert_eq!(run(entry, &m3), QNIL);
}

#[test]
fn test_opt_eq_specializations() {
    jit_init();

    // Fixnum equality
    let mut b = IseqBuilder::new();
    let ci = b.call_info(CallInfo { mid: MethodId(150), argc: 1, flags: CallFlags::empty() });
    b.op(Opcode::GetLocalWc0).word(4);
    b.op(Opcode::GetLocalWc0).word(3);
    b.op(Opcode::OptEq).word(ci);
    b.op(Opcode::Leave);
    let iseq = b.build(2, IseqParam::default(), 2);

    let m1 = make_machine(iseq, QNIL, &[Value::fixnum(5), Value::fixnum(5)], None, 0);
    let entry = compile(iseq, &m1, 0);
    assert_eq!(run(entry, &m1), QTRUE);
    let m2 = make_machine(iseq, QNIL, &[Value::fixnum(5), Value::fixnum(7)], None, 0);
    assert_eq!(run(entry, &m2), Value(0)); // Qfalse

    // String equality takes the str_eql fast path on a fresh call site
    let mut b2 = IseqBuilder::new();
    let ci2 = b2.call_info(CallInfo { mid: MethodId(151), argc: 1, flags: CallFlags::empty() });
    b2.op(Opcode::GetLocalWc0).word(4);
    b2.op(Opcode::GetLocalWc0).word(3);
    b2.op(Opcode::OptEq).word(ci2);
    b2.op(Opcode::Leave);
    let iseq2 = b2.build(2, IseqParam::default(), 2);

    let s1 = RString::alloc("vireo");
    let s2 = RString::alloc("vireo");
    let s3 = RString::alloc("finch");
    let m3 = make_machine(iseq2, QNIL, &[s1, s2], None, 0);
    let entry2 = compile(iseq2, &m3, 0);
    assert_eq!(run(entry2, &m3), QTRUE);
    let m4 = make_machine(iseq2, QNIL, &[s1, s3], None, 0);
    assert_eq!(run(entry2, &m4), Value(0));
}

#[test]
fn test_opt_neq_specializations() {
    jit_init();

    // Fixnum inequality is the inverted compare
    let mut b = IseqBuilder::new();
    let ci = b.call_info(CallInfo { mid: MethodId(220), argc: 1, flags: CallFlags::empty() });
    b.op(Opcode::GetLocalWc0).word(4);
    b.op(Opcode::GetLocalWc0).word(3);
    b.op(Opcode::OptNeq).word(ci);
    b.op(Opcode::Leave);
    let iseq = b.build(2, IseqParam::default(), 2);

    let m1 = make_machine(iseq, QNIL, &[Value::fixnum(5), Value::fixnum(5)], None, 0);
    let entry = compile(iseq, &m1, 0);
    assert_eq!(run(entry, &m1), Value(0)); // Qfalse
    let m2 = make_machine(iseq, QNIL, &[Value::fixnum(5), Value::fixnum(7)], None, 0);
    assert_eq!(run(entry, &m2), QTRUE);

    // String inequality flips the str_eql fast path on a fresh call site
    let mut b2 = IseqBuilder::new();
    let ci2 = b2.call_info(CallInfo { mid: MethodId(221), argc: 1, flags: CallFlags::empty() });
    b2.op(Opcode::GetLocalWc0).word(4);
    b2.op(Opcode::GetLocalWc0).word(3);
    b2.op(Opcode::OptNeq).word(ci2);
    b2.op(Opcode::Leave);
    let iseq2 = b2.build(2, IseqParam::default(), 2);

    let s1 = RString::alloc("wren");
    let s2 = RString::alloc("wren");
    let s3 = RString::alloc("lark");
    let m3 = make_machine(iseq2, QNIL, &[s1, s2], None, 0);
    let entry2 = compile(iseq2, &m3, 0);
    assert_eq!(run(entry2, &m3), Value(0));
    let m4 = make_machine(iseq2, QNIL, &[s1, s3], None, 0);
    assert_eq!(run(entry2, &m4), QTRUE);
}

#[test]
fn test_opt_mod_helper_and_side_exit() {
    jit_init();

    let mut b = IseqBuilder::new();
    let ci = b.call_info(CallInfo { mid: MethodId(230), argc: 1, flags: CallFlags::empty() });
    b.op(Opcode::GetLocalWc0).word(4);
    b.op(Opcode::GetLocalWc0).word(3);
    b.op(Opcode::OptMod).word(ci);
    b.op(Opcode::Leave);
    let iseq = b.build(2, IseqParam::default(), 2);

    let m1 = make_machine(iseq, QNIL, &[Value::fixnum(10), Value::fixnum(3)], None, 0);
    let entry = compile(iseq, &m1, 0);
    assert_eq!(run(entry, &m1), Value::fixnum(1));

    // The result takes the divisor's sign
    let m2 = make_machine(iseq, QNIL, &[Value::fixnum(-7), Value::fixnum(3)], None, 0);
    assert_eq!(run(entry, &m2), Value::fixnum(2));

    // Division by zero makes the helper refuse; the interpreter raises
    let m3 = make_machine(iseq, QNIL, &[Value::fixnum(5), Value::fixnum(0)], None, 0);
    assert_eq!(run(entry, &m3), QUNDEF);
}

#[test]
fn test_opt_aset_on_array_and_fallback() {
    jit_init();

    // x[0] = 5
    let mut b = IseqBuilder::new();
    let ci = b.call_info(CallInfo { mid: MethodId(240), argc: 2, flags: CallFlags::empty() });
    b.op(Opcode::GetLocalWc0).word(3);
    b.op(Opcode::PutObjectFixZero);
    b.op(Opcode::PutObject).value(Value::fixnum(5));
    b.op(Opcode::OptAset).word(ci);
    b.op(Opcode::Leave);
    let iseq = b.build(1, IseqParam::default(), 3);

    let ary = RArray::alloc(vec![QNIL]);
    let m1 = make_machine(iseq, QNIL, &[ary], None, 0);
    let entry = compile(iseq, &m1, 0);
    assert_eq!(run(entry, &m1), Value::fixnum(5));
    assert_eq!(RArray::of(ary).elems.lock()[0], Value::fixnum(5));

    // A receiver the helper does not handle falls back to the interpreter
    let m2 = make_machine(iseq, QNIL, &[Value::fixnum(7)], None, 0);
    assert_eq!(run(entry, &m2), QUNDEF);
}

#[test]
fn test_newhash_and_newrange() {
    jit_init();

    // { 1 => 2 }
    let mut b = IseqBuilder::new();
    b.op(Opcode::PutObjectFixOne);
    b.op(Opcode::PutObject).value(Value::fixnum(2));
    b.op(Opcode::NewHash).word(2);
    b.op(Opcode::Leave);
    let iseq = b.build(0, IseqParam::default(), 2);
    let m1 = make_machine(iseq, QNIL, &[], None, 0);
    let entry = compile(iseq, &m1, 0);
    let hash = run(entry, &m1);
    assert_ne!(hash, QUNDEF);
    assert_eq!(RHash::of(hash).lookup(Value::fixnum(1)), Some(Value::fixnum(2)));

    // 1...9
    let mut b2 = IseqBuilder::new();
    b2.op(Opcode::PutObjectFixOne);
    b2.op(Opcode::PutObject).value(Value::fixnum(9));
    b2.op(Opcode::NewRange).word(1);
    b2.op(Opcode::Leave);
    let iseq2 = b2.build(0, IseqParam::default(), 2);
    let m2 = make_machine(iseq2, QNIL, &[], None, 0);
    let entry2 = compile(iseq2, &m2, 0);
    let range = RRange::of(run(entry2, &m2));
    assert_eq!(range.lo, Value::fixnum(1));
    assert_eq!(range.hi, Value::fixnum(9));
    assert!(range.exclusive);
}

#[test]
fn test_splatarray_coercion() {
    jit_init();

    let mut b = IseqBuilder::new();
    b.op(Opcode::GetLocalWc0).word(3);
    b.op(Opcode::SplatArray).word(0);
    b.op(Opcode::Leave);
    let iseq = b.build(1, IseqParam::default(), 1);

    // An array passes through untouched when no copy is requested
    let ary = RArray::alloc(vec![Value::fixnum(4)]);
    let m1 = make_machine(iseq, QNIL, &[ary], None, 0);
    let entry = compile(iseq, &m1, 0);
    assert_eq!(run(entry, &m1), ary);

    // Anything else gets wrapped
    let m2 = make_machine(iseq, QNIL, &[Value::fixnum(8)], None, 0);
    let wrapped = run(entry, &m2);
    assert_ne!(wrapped, QUNDEF);
    assert_eq!(RArray::of(wrapped).elems.lock().clone(), vec![Value::fixnum(8)]);
}

#[test]
fn test_string_building_opcodes() {
    jit_init();

    // "song" + "bird" through resurrected literals
    let mut b = IseqBuilder::new();
    b.op(Opcode::PutString).value(RString::alloc("song"));
    b.op(Opcode::PutString).value(RString::alloc("bird"));
    b.op(Opcode::ConcatStrings).word(2);
    b.op(Opcode::Leave);
    let iseq = b.build(0, IseqParam::default(), 2);
    let m1 = make_machine(iseq, QNIL, &[], None, 0);
    let entry = compile(iseq, &m1, 0);
    let joined = run(entry, &m1);
    assert_eq!(*RString::of(joined).chars.lock(), "songbird");

    // tostring coerces the value when the conversion slot is not a string
    let mut b2 = IseqBuilder::new();
    b2.op(Opcode::PutObject).value(Value::fixnum(42));
    b2.op(Opcode::PutNil);
    b2.op(Opcode::ToString);
    b2.op(Opcode::Leave);
    let iseq2 = b2.build(0, IseqParam::default(), 2);
    let m2 = make_machine(iseq2, QNIL, &[], None, 0);
    let entry2 = compile(iseq2, &m2, 0);
    assert_eq!(*RString::of(run(entry2, &m2)).chars.lock(), "42");

    // toregexp collects its parts and builds a regexp object
    let mut b3 = IseqBuilder::new();
    b3.op(Opcode::PutString).value(RString::alloc("ab"));
    b3.op(Opcode::PutString).value(RString::alloc("cd"));
    b3.op(Opcode::ToRegexp).word(0).word(2);
    b3.op(Opcode::Leave);
    let iseq3 = b3.build(0, IseqParam::default(), 2);
    let m3 = make_machine(iseq3, QNIL, &[], None, 0);
    let entry3 = compile(iseq3, &m3, 0);
    let re = run(entry3, &m3);
    assert_eq!(re.class_of(), core_classes().regexp);
    assert_eq!(*RString::of(re).chars.lock(), "abcd");
}

#[test]
fn test_defined_pushes_query_result() {
    jit_init();

    let pushval = Value::static_sym(9);
    let mut b = IseqBuilder::new();
    b.op(Opcode::PutNil);
    b.op(Opcode::Defined).word(1).value(QNIL).value(pushval);
    b.op(Opcode::Leave);
    let iseq = b.build(0, IseqParam::default(), 1);

    let machine = make_machine(iseq, QNIL, &[], None, 0);
    let entry = compile(iseq, &machine, 0);
    assert_eq!(run(entry, &machine), pushval);
}

extern "C" fn builtin_double(_recv: Value, arg: Value) -> Value {
    Value::fixnum(arg.as_fixnum() * 2)
}

#[test]
fn test_leaf_builtin_is_called_without_a_frame() {
    jit_init();
    let class = RClass::define("BuiltinHolder", core_classes().object);
    let mid = MethodId(160);

    let callee = Iseq {
        body: IseqBody {
            iseq_encoded: vec![Opcode::Leave as u64],
            iseq_size: 1,
            local_table_size: 1,
            param: IseqParam { size: 1, lead_num: 1, ..IseqParam::default() },
            stack_max: 1,
            builtin_func: Some(BuiltinFunc { func: builtin_double as *const u8, argc: 1 }),
            ..IseqBody::default()
        },
    }
    .into_ptr();
    define_iseq_method(class, mid, callee, Visibility::Public);

    let mut b = IseqBuilder::new();
    let ci = b.call_info(CallInfo { mid, argc: 1, flags: CallFlags::FCALL });
    b.op(Opcode::PutSelf);
    b.op(Opcode::PutObject).value(Value::fixnum(20));
    b.op(Opcode::OptSendWithoutBlock).word(ci);
    b.op(Opcode::Leave);
    let caller = b.build(0, IseqParam::default(), 3);

    let this = RObject::alloc(class, 0);
    let machine = make_machine(caller, this, &[], None, 0);
    let entry = compile(caller, &machine, 0);
    assert_eq!(run(entry, &machine), Value::fixnum(40));
}

extern "C" fn cfunc_forty_two(_recv: Value) -> Value {
    Value::fixnum(42)
}

#[test]
fn test_send_to_c_function() {
    jit_init();
    let class = RClass::define("CFuncHolder", core_classes().object);
    let mid = MethodId(170);
    define_cfunc_method(class, mid, cfunc_forty_two as *const u8, 0);

    let mut b = IseqBuilder::new();
    let ci = b.call_info(CallInfo { mid, argc: 0, flags: CallFlags::FCALL });
    b.op(Opcode::PutSelf);
    b.op(Opcode::OptSendWithoutBlock).word(ci);
    b.op(Opcode::Leave);
    let caller = b.build(0, IseqParam::default(), 2);

    let this = RObject::alloc(class, 0);
    let machine = make_machine(caller, this, &[], None, 0);
    let entry = compile(caller, &machine, 0);
    assert_eq!(run(entry, &machine), Value::fixnum(42));
}

extern "C" fn cfunc_never(_recv: Value, _arg: Value) -> Value {
    QNIL
}

#[test]
fn test_specialized_cfunc_identity_equal() {
    jit_init();
    let class = RClass::define("IdentityHolder", core_classes().object);
    let mid = MethodId(180);
    let me = define_cfunc_method(class, mid, cfunc_never as *const u8, 1);
    vireo_jit::codegen::send::register_cfunc_codegen(
        &me,
        vireo_jit::codegen::send::CFuncCodegen::IdentityEqual,
    );

    // x.equal_to?(y)
    let mut b = IseqBuilder::new();
    let ci = b.call_info(CallInfo { mid, argc: 1, flags: CallFlags::empty() });
    b.op(Opcode::GetLocalWc0).word(4);
    b.op(Opcode::GetLocalWc0).word(3);
    b.op(Opcode::OptSendWithoutBlock).word(ci);
    b.op(Opcode::Leave);
    let iseq = b.build(2, IseqParam::default(), 3);

    let a = RObject::alloc(class, 0);
    let b_obj = RObject::alloc(class, 0);
    let m1 = make_machine(iseq, QNIL, &[a, a], None, 0);
    let entry = compile(iseq, &m1, 0);
    assert_eq!(run(entry, &m1), QTRUE);
    let m2 = make_machine(iseq, QNIL, &[a, b_obj], None, 0);
    assert_eq!(run(entry, &m2), Value(0));
}

#[test]
fn test_invokesuper_dispatches_to_superclass() {
    jit_init();
    let base = RClass::define("SuperBase", core_classes().object);
    let derived = RClass::define("SuperDerived", base);
    let mid = MethodId(190);
    define_cfunc_method(base, mid, cfunc_forty_two as *const u8, 0);

    // Derived#m: super
    let mut b = IseqBuilder::new();
    let ci = b.call_info(CallInfo { mid, argc: 0, flags: CallFlags::SUPER });
    b.op(Opcode::PutSelf);
    b.op(Opcode::InvokeSuper).word(ci).word(0);
    b.op(Opcode::Leave);
    let derived_m = b.build(0, IseqParam::default(), 2);
    let derived_me = define_iseq_method(derived, mid, derived_m, Visibility::Public);

    let this = RObject::alloc(derived, 0);
    let machine = make_machine(derived_m, this, &[], Some(&derived_me), 0);
    let entry = compile(derived_m, &machine, 0);
    assert_eq!(run(entry, &machine), Value::fixnum(42));
}

#[test]
fn test_block_param_proxy() {
    jit_init();
    let mut b = IseqBuilder::new();
    b.op(Opcode::GetBlockParamProxy).word(3).word(0);
    b.op(Opcode::Leave);
    let iseq = b.build(1, IseqParam::default(), 1);

    // Hand the frame an iseq block handler
    let machine = make_machine(iseq, QNIL, &[QNIL], None, 0);
    let block_iseq = IseqBuilder::new().build(0, IseqParam::default(), 0);
    unsafe {
        let ep = (*machine.cfp).ep as *mut Value;
        *ep.offset(-1) = Value(block_iseq.0 as u64 | BLOCK_HANDLER_ISEQ_TAG);
    }

    let entry = compile(iseq, &machine, 0);
    assert_eq!(run(entry, &machine), vireo_jit::vm::block_param_proxy());

    // Without a block, the proxy read leaves to the interpreter
    let bare = make_machine(iseq, QNIL, &[QNIL], None, 0);
    assert_eq!(run(entry, &bare), QUNDEF);
}

#[test]
fn test_aggregate_literals_and_globals() {
    jit_init();

    // [1, 2] built through the host helper
    let mut b = IseqBuilder::new();
    b.op(Opcode::PutObjectFixOne);
    b.op(Opcode::PutObject).value(Value::fixnum(2));
    b.op(Opcode::NewArray).word(2);
    b.op(Opcode::Leave);
    let iseq = b.build(0, IseqParam::default(), 2);
    let machine = make_machine(iseq, QNIL, &[], None, 0);
    let entry = compile(iseq, &machine, 0);
    let result = run(entry, &machine);
    assert_ne!(result, QUNDEF);
    let elems = RArray::of(result).elems.lock().clone();
    assert_eq!(elems, vec![Value::fixnum(1), Value::fixnum(2)]);

    // $g = 9; $g
    let mut b2 = IseqBuilder::new();
    b2.op(Opcode::PutObject).value(Value::fixnum(9));
    b2.op(Opcode::SetGlobal).word(777);
    b2.op(Opcode::GetGlobal).word(777);
    b2.op(Opcode::Leave);
    let iseq2 = b2.build(0, IseqParam::default(), 1);
    let m2 = make_machine(iseq2, QNIL, &[], None, 0);
    let entry2 = compile(iseq2, &m2, 0);
    assert_eq!(run(entry2, &m2), Value::fixnum(9));
}

#[test]
fn test_identical_inputs_compile_to_identical_code_shape() {
    jit_init();

    // Two structurally identical iseqs produce blocks of the same size;
    // only embedded addresses may differ
    let build = || {
        let mut b = IseqBuilder::new();
        let ci = b.call_info(CallInfo { mid: MethodId(210), argc: 1, flags: CallFlags::empty() });
        b.op(Opcode::GetLocalWc0).word(4);
        b.op(Opcode::GetLocalWc0).word(3);
        b.op(Opcode::OptPlus).word(ci);
        b.op(Opcode::Leave);
        b.build(2, IseqParam::default(), 2)
    };
    let iseq_a = build();
    let iseq_b = build();

    let args = [Value::fixnum(3), Value::fixnum(4)];
    let ma = make_machine(iseq_a, QNIL, &args, None, 0);
    let mb = make_machine(iseq_b, QNIL, &args, None, 0);
    let entry_a = compile(iseq_a, &ma, 0);
    let entry_b = compile(iseq_b, &mb, 0);
    assert_eq!(run(entry_a, &ma), Value::fixnum(7));
    assert_eq!(run(entry_b, &mb), Value::fixnum(7));

    vireo_jit::with_jit(|jit| {
        let sizes = |iseq| {
            let mut out: Vec<usize> = jit.versions[&iseq]
                .values()
                .flatten()
                .map(|&b| {
                    let block = jit.block(b);
                    block.end_addr.unwrap().as_usize() - block.start_addr.unwrap().as_usize()
                })
                .collect();
            out.sort_unstable();
            out
        };
        assert_eq!(sizes(iseq_a), sizes(iseq_b));
    });
}

#[test]
fn test_interrupt_flag_takes_side_exit_on_backward_branch() {
    jit_init();

    // Tight loop that never terminates on its own: jump back to putnil/pop
    let mut b = IseqBuilder::new();
    let head = b.here();
    b.op(Opcode::PutNil);
    b.op(Opcode::Pop);
    let jump_at = b.here();
    b.op(Opcode::Jump).word((head as i64 - (jump_at + 2) as i64) as u64);
    b.op(Opcode::Leave);
    let iseq = b.build(0, IseqParam::default(), 1);

    let machine = make_machine(iseq, QNIL, &[], None, 0);
    unsafe { (*machine.ec).interrupt_flag = 1 };
    let entry = compile(iseq, &machine, 0);
    // The pending interrupt bails out to the interpreter at the jump
    assert_eq!(run(entry, &machine), QUNDEF);
}
