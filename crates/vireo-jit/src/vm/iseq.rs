//! Bytecode objects
//!
//! An iseq is a flat array of 64-bit words: an opcode word followed by its
//! operands. Operand words hold small integers, interned ids, tagged
//! [`Value`]s, or raw pointers, depending on the opcode. Branch operands
//! are word offsets relative to the end of the instruction.
//!
//! The JIT reads iseq bodies but never mutates them; the version index for
//! compiled blocks lives on the JIT side, keyed by [`IseqPtr`].

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::vm::method::CallInfo;
use crate::vm::value::Value;

/// The instruction set the JIT tier understands. Anything else ends the
/// block with an exit to the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Opcode {
    Nop = 0,
    Pop,
    Dup,
    DupN,
    Swap,
    SetN,
    TopN,
    AdjustStack,
    PutNil,
    PutObject,
    PutObjectFixZero,
    PutObjectFixOne,
    PutSelf,
    PutString,
    GetLocal,
    GetLocalWc0,
    GetLocalWc1,
    SetLocalWc0,
    GetInstanceVariable,
    SetInstanceVariable,
    GetGlobal,
    SetGlobal,
    NewArray,
    DupArray,
    NewHash,
    NewRange,
    SplatArray,
    ConcatStrings,
    ToString,
    ToRegexp,
    Defined,
    OptGetInlineCache,
    OptSetInlineCache,
    GetBlockParamProxy,
    BranchIf,
    BranchUnless,
    BranchNil,
    Jump,
    OptPlus,
    OptMinus,
    OptAnd,
    OptOr,
    OptLt,
    OptLe,
    OptGt,
    OptGe,
    OptMod,
    OptEq,
    OptNeq,
    OptAref,
    OptAset,
    OptSendWithoutBlock,
    Send,
    InvokeSuper,
    Leave,
}

impl Opcode {
    pub fn from_u64(word: u64) -> Option<Opcode> {
        if word <= Opcode::Leave as u64 {
            // Discriminants are dense starting at zero
            Some(unsafe { std::mem::transmute::<u64, Opcode>(word) })
        } else {
            None
        }
    }

    /// Total instruction length in words, opcode included.
    pub fn len(self) -> u32 {
        use Opcode::*;
        match self {
            Nop | Pop | Dup | Swap | PutNil | PutObjectFixZero | PutObjectFixOne | PutSelf
            | ToString | Leave => 1,
            DupN | SetN | TopN | AdjustStack | PutObject | PutString | GetLocalWc0
            | GetLocalWc1 | SetLocalWc0 | GetInstanceVariable | SetInstanceVariable
            | GetGlobal | SetGlobal | NewArray | DupArray | NewHash | NewRange | SplatArray
            | ConcatStrings | OptSetInlineCache | BranchIf | BranchUnless | BranchNil | Jump
            | OptPlus | OptMinus | OptAnd | OptOr | OptLt | OptLe | OptGt | OptGe | OptMod
            | OptEq | OptNeq | OptAref | OptAset | OptSendWithoutBlock => 2,
            GetLocal | ToRegexp | OptGetInlineCache | GetBlockParamProxy | Send
            | InvokeSuper => 3,
            Defined => 4,
        }
    }
}

bitflags::bitflags! {
    /// Parameter shape flags on an iseq body.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ParamFlags: u32 {
        const HAS_OPT    = 1 << 0;
        const HAS_REST   = 1 << 1;
        const HAS_POST   = 1 << 2;
        const HAS_KW     = 1 << 3;
        const HAS_KWREST = 1 << 4;
        const HAS_BLOCK  = 1 << 5;
    }
}

/// Parameter description.
#[derive(Debug, Clone, Default)]
pub struct IseqParam {
    /// Number of parameter locals
    pub size: u32,
    pub lead_num: u32,
    pub opt_num: u32,
    /// Start PC for each accepted lead+optional count; `opt_num + 1`
    /// entries when `HAS_OPT` is set
    pub opt_table: Vec<u32>,
    pub flags: ParamFlags,
}

/// An inline constant cache slot, filled by the interpreter.
#[derive(Debug, Default)]
pub struct InlineCache {
    pub entry: Mutex<Option<IcEntry>>,
}

#[derive(Debug, Clone, Copy)]
pub struct IcEntry {
    pub value: Value,
    /// Global constant serial at fill time
    pub ic_serial: u64,
    /// Lexically-scoped lookup; never JIT-specialized
    pub cref_sensitive: bool,
}

/// A builtin C function an iseq body may delegate to.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinFunc {
    pub func: *const u8,
    pub argc: u32,
}

unsafe impl Send for BuiltinFunc {}
unsafe impl Sync for BuiltinFunc {}

#[derive(Default)]
pub struct IseqBody {
    pub iseq_encoded: Vec<u64>,
    pub iseq_size: u32,
    pub local_table_size: u32,
    pub param: IseqParam,
    pub stack_max: u32,
    pub call_infos: Vec<CallInfo>,
    pub inline_caches: Vec<InlineCache>,
    /// Set when the body is a leaf delegating straight to a builtin
    pub builtin_func: Option<BuiltinFunc>,
}

pub struct Iseq {
    pub body: IseqBody,
}

impl Iseq {
    /// Leak the iseq, handing out the stable pointer the version index and
    /// frames key on. Iseqs live for the life of the process.
    pub fn into_ptr(self) -> IseqPtr {
        IseqPtr(Box::leak(Box::new(self)))
    }
}

/// Stable identity of a bytecode object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IseqPtr(pub *const Iseq);

unsafe impl Send for IseqPtr {}
unsafe impl Sync for IseqPtr {}

impl IseqPtr {
    pub fn body(self) -> &'static IseqBody {
        unsafe { &(*self.0).body }
    }

    pub fn opcode_at(self, idx: u32) -> Option<Opcode> {
        Opcode::from_u64(self.body().iseq_encoded[idx as usize])
    }

    pub fn operand(self, idx: u32, n: u32) -> u64 {
        self.body().iseq_encoded[(idx + 1 + n) as usize]
    }

    /// Address of the encoded word at `idx`, as the interpreter's PC.
    pub fn pc_at(self, idx: u32) -> *const u64 {
        &self.body().iseq_encoded[idx as usize] as *const u64
    }

    /// Leaf-builtin delegate body, when the whole method is one builtin
    /// call plus `leave`.
    pub fn leaf_builtin(self) -> Option<BuiltinFunc> {
        self.body().builtin_func
    }
}

static CONSTANT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Current global constant serial; inline caches are stale when theirs
/// differs.
pub fn constant_serial() -> u64 {
    CONSTANT_SERIAL.load(Ordering::Acquire)
}

/// Host-side event: a constant was assigned or a constant cache was bumped.
pub fn bump_constant_serial() {
    CONSTANT_SERIAL.fetch_add(1, Ordering::AcqRel);
    crate::invariants::constant_state_changed();
}

/// Assembles iseq bodies word by word; the shape the host compiler emits.
#[derive(Default)]
pub struct IseqBuilder {
    words: Vec<u64>,
    call_infos: Vec<CallInfo>,
    inline_caches: Vec<InlineCache>,
}

impl IseqBuilder {
    pub fn new() -> IseqBuilder {
        IseqBuilder::default()
    }

    /// Current index, used for computing branch offsets.
    pub fn here(&self) -> u32 {
        self.words.len() as u32
    }

    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.words.push(op as u64);
        self
    }

    pub fn word(&mut self, w: u64) -> &mut Self {
        self.words.push(w);
        self
    }

    pub fn value(&mut self, v: Value) -> &mut Self {
        self.words.push(v.0);
        self
    }

    /// Backpatch an operand word, for forward branch offsets.
    pub fn set_word(&mut self, idx: u32, w: u64) {
        self.words[idx as usize] = w;
    }

    pub fn call_info(&mut self, ci: CallInfo) -> u64 {
        self.call_infos.push(ci);
        (self.call_infos.len() - 1) as u64
    }

    pub fn inline_cache(&mut self) -> u64 {
        self.inline_caches.push(InlineCache::default());
        (self.inline_caches.len() - 1) as u64
    }

    pub fn build(self, local_table_size: u32, param: IseqParam, stack_max: u32) -> IseqPtr {
        let iseq_size = self.words.len() as u32;
        Iseq {
            body: IseqBody {
                iseq_encoded: self.words,
                iseq_size,
                local_table_size,
                param,
                stack_max,
                call_infos: self.call_infos,
                inline_caches: self.inline_caches,
                builtin_func: None,
            },
        }
        .into_ptr()
    }
}
