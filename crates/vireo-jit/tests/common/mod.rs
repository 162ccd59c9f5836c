//! Test machine: a value stack, a frame array, and an execution context
//! laid out the way the interpreter would before handing a frame to
//! compiled code.

#![allow(dead_code)]

use std::sync::Arc;

use vireo_jit::asm::CodePtr;
use vireo_jit::options::Options;
use vireo_jit::vm::frame::{ControlFrame, EnvFlags, ExecutionContext};
use vireo_jit::vm::iseq::IseqPtr;
use vireo_jit::vm::method::{define_method, MethodDef, MethodEntry, MethodId, Visibility};
use vireo_jit::vm::value::{Value, QNIL};

const STACK_WORDS: usize = 4096;

pub fn jit_init() {
    vireo_jit::init(Options { exec_mem_size: 32, gen_stats: true, ..Options::default() });
}

pub struct Machine {
    pub ec: *mut ExecutionContext,
    pub cfp: *mut ControlFrame,
}

/// Build a method frame for `iseq` with the interpreter's layout:
/// receiver, parameter locals, nil-filled extras, then the three
/// environment slots, with a dummy caller frame above for `leave`.
pub fn make_machine(
    iseq: IseqPtr,
    self_val: Value,
    args: &[Value],
    me: Option<&Arc<MethodEntry>>,
    pc_idx: u32,
) -> Machine {
    let region: &'static mut [u64] = Box::leak(vec![0u64; STACK_WORDS].into_boxed_slice());
    let base = region.as_mut_ptr() as *mut Value;
    let region_end = unsafe { base.add(STACK_WORDS) };

    let body = iseq.body();
    let mut sp = base;
    unsafe {
        *sp = self_val;
        sp = sp.add(1);
        for &arg in args {
            *sp = arg;
            sp = sp.add(1);
        }
        for _ in args.len()..body.local_table_size as usize {
            *sp = QNIL;
            sp = sp.add(1);
        }
        *sp = Value(me.map_or(0, |m| Arc::as_ptr(m) as u64));
        sp = sp.add(1);
        *sp = Value(0); // no block handler
        sp = sp.add(1);
        *sp = Value((EnvFlags::FRAME_METHOD | EnvFlags::LOCAL).bits());
        sp = sp.add(1);
    }
    let ep = unsafe { sp.sub(1) };

    let caller_cfp = unsafe { (region_end as *mut ControlFrame).sub(1) };
    let entry_cfp = unsafe { caller_cfp.sub(1) };
    unsafe {
        *caller_cfp = ControlFrame {
            pc: std::ptr::null(),
            sp, // the return value lands here
            iseq: std::ptr::null(),
            self_val: QNIL,
            ep: std::ptr::null(),
            block_code: std::ptr::null(),
            bp: sp,
            jit_return: std::ptr::null(),
        };
        *entry_cfp = ControlFrame {
            pc: iseq.pc_at(pc_idx),
            sp,
            iseq: iseq.0,
            self_val,
            ep,
            block_code: std::ptr::null(),
            bp: sp,
            jit_return: std::ptr::null(),
        };
    }

    let ec = Box::leak(Box::new(ExecutionContext {
        cfp: entry_cfp,
        interrupt_flag: 0,
        interrupt_mask: 0,
    }));
    Machine { ec, cfp: entry_cfp }
}

/// Call into compiled code through the JIT entry ABI.
pub fn run(entry: CodePtr, machine: &Machine) -> Value {
    let f: extern "C" fn(*mut ExecutionContext, *mut ControlFrame) -> Value =
        unsafe { std::mem::transmute(entry.raw_ptr()) };
    f(machine.ec, machine.cfp)
}

/// Compile an entry for `(iseq, pc_idx)` against the machine's live state.
pub fn compile(iseq: IseqPtr, machine: &Machine, pc_idx: u32) -> CodePtr {
    vireo_jit::compile_iseq_entry(iseq, machine.ec, pc_idx).expect("compilation refused")
}

pub fn define_iseq_method(
    class: Value,
    mid: MethodId,
    iseq: IseqPtr,
    visibility: Visibility,
) -> Arc<MethodEntry> {
    let me = MethodEntry::new(mid, class, visibility, MethodDef::Iseq(iseq));
    define_method(class, mid, me.clone());
    me
}

pub fn define_cfunc_method(
    class: Value,
    mid: MethodId,
    func: *const u8,
    argc: i32,
) -> Arc<MethodEntry> {
    let me = MethodEntry::new(
        mid,
        class,
        Visibility::Public,
        MethodDef::Cfunc(vireo_jit::vm::method::CFunc { func, argc }),
    );
    define_method(class, mid, me.clone());
    me
}
