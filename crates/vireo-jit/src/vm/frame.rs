//! Control frame and execution context layouts
//!
//! These mirror the host interpreter's frame machinery bit for bit:
//! generated code indexes into both structs with the offset constants
//! below, so field order is load-bearing. The environment (`EP`) layout is
//! the interpreter's: three trailing data slots above the locals, with the
//! parent environment reachable through the tagged specval slot.

use crate::vm::iseq::Iseq;
use crate::vm::value::Value;

/// One interpreter control frame. Frames grow downward in a separate array
/// from the value stack.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ControlFrame {
    pub pc: *const u64,
    pub sp: *mut Value,
    pub iseq: *const Iseq,
    pub self_val: Value,
    pub ep: *const Value,
    /// Block iseq passed at the call site, if any
    pub block_code: *const u8,
    /// Base pointer of this frame's section of the value stack
    pub bp: *mut Value,
    /// Where compiled code resumes when a callee frame leaves
    pub jit_return: *const u8,
}

pub const CFP_OFFSET_PC: i32 = 0x00;
pub const CFP_OFFSET_SP: i32 = 0x08;
pub const CFP_OFFSET_ISEQ: i32 = 0x10;
pub const CFP_OFFSET_SELF: i32 = 0x18;
pub const CFP_OFFSET_EP: i32 = 0x20;
pub const CFP_OFFSET_BLOCK_CODE: i32 = 0x28;
pub const CFP_OFFSET_BP: i32 = 0x30;
pub const CFP_OFFSET_JIT_RETURN: i32 = 0x38;
pub const SIZEOF_CFP: i32 = 0x40;

/// Per-thread execution context: current frame plus interrupt state.
#[repr(C)]
#[derive(Debug)]
pub struct ExecutionContext {
    pub cfp: *mut ControlFrame,
    pub interrupt_flag: u64,
    pub interrupt_mask: u64,
}

pub const EC_OFFSET_CFP: i32 = 0x00;
pub const EC_OFFSET_INTERRUPT_FLAG: i32 = 0x08;
pub const EC_OFFSET_INTERRUPT_MASK: i32 = 0x10;

/// Trailing environment data slots, relative to EP.
pub const VM_ENV_DATA_SIZE: u32 = 3;
/// `ep[0]`: frame/env flag word
pub const VM_ENV_INDEX_FLAGS: i32 = 0;
/// `ep[-1]`: block handler, or tagged parent EP
pub const VM_ENV_INDEX_SPECVAL: i32 = -1;
/// `ep[-2]`: method entry / cref
pub const VM_ENV_INDEX_ME_CREF: i32 = -2;

/// Tag bits on the specval slot when it holds a parent environment pointer.
pub const VM_ENV_PREV_EP_MASK: u64 = 0x03;

bitflags::bitflags! {
    /// Flags stored in the env flag slot (`ep[0]`). The low bits are env
    /// state; the high bits identify the frame kind.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvFlags: u64 {
        const LOCAL                = 1 << 1;
        const ESCAPED              = 1 << 2;
        const WB_REQUIRED          = 1 << 3;
        const MODIFIED_BLOCK_PARAM = 1 << 5;
        const FRAME_METHOD         = 1 << 16;
        const FRAME_CFUNC          = 1 << 17;
        const CFRAME               = 1 << 18;
    }
}

/// Block handler encodings in the specval slot of a method frame.
pub const BLOCK_HANDLER_NONE: u64 = 0x00;
/// Low bits identifying a captured iseq block
pub const BLOCK_HANDLER_ISEQ_TAG: u64 = 0x01;
pub const BLOCK_HANDLER_TYPE_MASK: u64 = 0x03;

/// Follow one level up the environment chain.
///
/// # Safety
/// `ep` must point at a live environment's flag slot.
pub unsafe fn prev_ep(ep: *const Value) -> *const Value {
    let specval = (*ep.offset(VM_ENV_INDEX_SPECVAL as isize)).0;
    (specval & !VM_ENV_PREV_EP_MASK) as *const Value
}

/// EP-relative slot index of local `j` in a frame with `local_size` locals:
/// locals sit directly below the three env data slots, receiver below them.
pub fn local_slot_from_index(local_size: u32, j: u32) -> u32 {
    debug_assert!(j < local_size);
    local_size - j + (VM_ENV_DATA_SIZE - 1)
}

/// Inverse of [`local_slot_from_index`].
pub fn local_index_from_slot(local_size: u32, slot: u32) -> u32 {
    local_size + (VM_ENV_DATA_SIZE - 1) - slot
}
