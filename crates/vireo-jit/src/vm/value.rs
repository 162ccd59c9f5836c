//! Tagged value encoding and heap object headers
//!
//! The Vireo VM uses a pointer-sized tagged value word:
//! - `........ ...1` fixnum (63-bit signed integer, shifted left once)
//! - `........ ..10` flonum
//! - `........ 1100` static symbol (id in the upper 56 bits)
//! - `0x00` false, `0x08` nil, `0x14` true, `0x34` undefined (sentinel)
//! - any other value is a pointer to a heap object starting with [`RBasic`]
//!
//! Only the `RBasic` header and the `RObject` ivar storage have a pinned
//! binary layout; generated code reads the class word and ivar slots
//! directly. Everything else on the heap side of the model is plain Rust
//! reached through the host helper table.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::vm::method::{MethodEntry, MethodId};

/// A tagged VM value word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(pub u64);

pub const QFALSE: Value = Value(0x00);
pub const QNIL: Value = Value(0x08);
pub const QTRUE: Value = Value(0x14);
/// Sentinel for "no value"; never visible to user code.
pub const QUNDEF: Value = Value(0x34);

pub const FIXNUM_FLAG: u64 = 0x1;
pub const FLONUM_MASK: u64 = 0x3;
pub const FLONUM_FLAG: u64 = 0x2;
pub const SYMBOL_MASK: u64 = 0xff;
pub const SYMBOL_FLAG: u64 = 0x0c;
pub const IMMEDIATE_MASK: u64 = 0x7;

impl Value {
    pub const fn fixnum(val: i64) -> Value {
        Value(((val << 1) | 1) as u64)
    }

    pub fn as_fixnum(self) -> i64 {
        debug_assert!(self.is_fixnum());
        (self.0 as i64) >> 1
    }

    pub const fn static_sym(id: u64) -> Value {
        Value((id << 8) | SYMBOL_FLAG)
    }

    pub fn is_fixnum(self) -> bool {
        self.0 & FIXNUM_FLAG != 0
    }

    pub fn is_flonum(self) -> bool {
        self.0 & FLONUM_MASK == FLONUM_FLAG
    }

    pub fn is_static_sym(self) -> bool {
        self.0 & SYMBOL_MASK == SYMBOL_FLAG
    }

    pub fn is_immediate(self) -> bool {
        self.0 & IMMEDIATE_MASK != 0
    }

    /// Nil, false, or any immediate: values with no heap header.
    pub fn is_special_const(self) -> bool {
        self.is_immediate() || !self.truthy()
    }

    pub fn is_heap(self) -> bool {
        !self.is_special_const()
    }

    pub fn is_nil(self) -> bool {
        self == QNIL
    }

    pub fn truthy(self) -> bool {
        self.0 & !QNIL.0 != 0
    }

    /// Header of a heap value.
    pub fn rbasic(self) -> &'static RBasic {
        debug_assert!(self.is_heap());
        unsafe { &*(self.0 as *const RBasic) }
    }

    /// The class of any value, immediates included.
    pub fn class_of(self) -> Value {
        let core = core_classes();
        if self.is_fixnum() {
            core.integer
        } else if self.is_flonum() {
            core.float
        } else if self.is_static_sym() {
            core.symbol
        } else if self == QNIL {
            core.nil_class
        } else if self == QTRUE {
            core.true_class
        } else if self == QFALSE {
            core.false_class
        } else {
            self.rbasic().klass
        }
    }

    pub fn as_rclass(self) -> &'static RClass {
        debug_assert!(self.is_heap());
        unsafe { &*(self.0 as *const RClass) }
    }

    pub fn as_robject(self) -> &'static mut RObject {
        debug_assert!(self.is_heap());
        unsafe { &mut *(self.0 as *mut RObject) }
    }

    /// `kind_of?` against a class: walks the superclass chain.
    pub fn is_kind_of(self, class: Value) -> bool {
        let mut k = self.class_of();
        loop {
            if k == class {
                return true;
            }
            if !k.is_heap() {
                return false;
            }
            k = k.as_rclass().superclass;
            if k == QNIL {
                return false;
            }
        }
    }
}

/// Heap object header. Generated code reads the class word at offset 8 for
/// class guards, so the layout is load-bearing.
#[repr(C)]
pub struct RBasic {
    pub flags: u64,
    pub klass: Value,
}

pub const RBASIC_OFFSET_FLAGS: i32 = 0;
pub const RBASIC_OFFSET_KLASS: i32 = 8;

/// Heap type tag kept in the low bits of `RBasic::flags`.
pub const T_MASK: u64 = 0x1f;
pub const T_OBJECT: u64 = 0x01;
pub const T_CLASS: u64 = 0x02;
pub const T_ICLASS: u64 = 0x03;
pub const T_STRING: u64 = 0x05;
pub const T_ARRAY: u64 = 0x07;
pub const T_HASH: u64 = 0x08;

/// Flag bit: the object's ivars live inline in the object slot rather than
/// behind the `ivptr` indirection.
pub const OBJ_EMBED_FLAG: u64 = 1 << 13;

pub const OBJ_EMBED_LEN_MAX: usize = 3;

/// Default-allocator object: ivars either embedded or in a heap table.
#[repr(C)]
pub struct RObject {
    pub basic: RBasic,
    pub ivars: RObjectIvars,
}

#[repr(C)]
pub union RObjectIvars {
    pub ary: [Value; OBJ_EMBED_LEN_MAX],
    pub heap: RObjectHeap,
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct RObjectHeap {
    pub numiv: u64,
    pub ivptr: *mut Value,
}

pub const ROBJECT_OFFSET_AS_ARY: i32 = 16;
pub const ROBJECT_OFFSET_NUMIV: i32 = 16;
pub const ROBJECT_OFFSET_IVPTR: i32 = 24;

impl RObject {
    /// Allocate an instance of `class` with `numiv` ivar slots, embedded
    /// when they fit. All slots start undefined.
    pub fn alloc(class: Value, numiv: usize) -> Value {
        let embed = numiv <= OBJ_EMBED_LEN_MAX;
        let mut flags = T_OBJECT;
        let ivars = if embed {
            flags |= OBJ_EMBED_FLAG;
            RObjectIvars { ary: [QUNDEF; OBJ_EMBED_LEN_MAX] }
        } else {
            let slots: &'static mut [Value] =
                Box::leak(vec![QUNDEF; numiv].into_boxed_slice());
            RObjectIvars {
                heap: RObjectHeap { numiv: numiv as u64, ivptr: slots.as_mut_ptr() },
            }
        };
        let obj = Box::leak(Box::new(RObject { basic: RBasic { flags, klass: class }, ivars }));
        Value(obj as *mut RObject as u64)
    }

    pub fn embedded(&self) -> bool {
        self.basic.flags & OBJ_EMBED_FLAG != 0
    }

    pub fn ivar_slot(&mut self, index: usize) -> &mut Value {
        unsafe {
            if self.embedded() {
                &mut self.ivars.ary[index]
            } else {
                debug_assert!((index as u64) < self.ivars.heap.numiv);
                &mut *self.ivars.heap.ivptr.add(index)
            }
        }
    }

    /// Store into `index`, re-housing the ivar table when it does not fit.
    pub fn ivar_slot_grow(&mut self, index: usize, val: Value) {
        let capacity = if self.embedded() {
            OBJ_EMBED_LEN_MAX
        } else {
            unsafe { self.ivars.heap.numiv as usize }
        };
        if index >= capacity {
            let new_cap = (index + 1).max(capacity * 2);
            let slots: &'static mut [Value] =
                Box::leak(vec![QUNDEF; new_cap].into_boxed_slice());
            for i in 0..capacity {
                slots[i] = *self.ivar_slot(i);
            }
            self.basic.flags &= !OBJ_EMBED_FLAG;
            self.ivars = RObjectIvars {
                heap: RObjectHeap { numiv: new_cap as u64, ivptr: slots.as_mut_ptr() },
            };
        }
        *self.ivar_slot(index) = val;
    }
}

/// Interned ivar name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IvarId(pub u32);

/// A class object. Only the header is binary; the rest is the part of the
/// host class model that compilation consults.
#[repr(C)]
pub struct RClass {
    pub basic: RBasic,
    pub name: &'static str,
    pub superclass: Value,
    /// For singleton classes: the one object this class is attached to.
    pub attached_object: Value,
    pub is_singleton: bool,
    pub method_table: Mutex<FxHashMap<MethodId, Arc<MethodEntry>>>,
    /// ivar name -> slot index, for instances using the default allocator
    pub ivar_index_tbl: Mutex<FxHashMap<IvarId, usize>>,
}

impl RClass {
    pub fn define(name: &'static str, superclass: Value) -> Value {
        let class = Box::leak(Box::new(RClass {
            basic: RBasic { flags: T_CLASS, klass: QNIL },
            name,
            superclass,
            attached_object: QNIL,
            is_singleton: false,
            method_table: Mutex::new(FxHashMap::default()),
            ivar_index_tbl: Mutex::new(FxHashMap::default()),
        }));
        Value(class as *mut RClass as u64)
    }

    /// Singleton class attached to one object.
    pub fn define_singleton(attached: Value, superclass: Value) -> Value {
        let v = RClass::define("#singleton", superclass);
        let class = unsafe { &mut *(v.0 as *mut RClass) };
        class.is_singleton = true;
        class.attached_object = attached;
        v
    }

    /// Register the ivar slot index used by instances of this class.
    pub fn set_ivar_index(&self, id: IvarId, index: usize) {
        self.ivar_index_tbl.lock().insert(id, index);
    }

    /// `ivar_index_tbl_lookup` in the host helper list.
    pub fn ivar_index_lookup(&self, id: IvarId) -> Option<usize> {
        self.ivar_index_tbl.lock().get(&id).copied()
    }
}

/// The classes of the core value types, consulted when mapping lattice
/// types to guardable classes.
pub struct CoreClasses {
    pub basic_object: Value,
    pub object: Value,
    pub integer: Value,
    pub float: Value,
    pub symbol: Value,
    pub nil_class: Value,
    pub true_class: Value,
    pub false_class: Value,
    pub array: Value,
    pub hash: Value,
    pub string: Value,
    pub range: Value,
    pub regexp: Value,
}

static CORE_CLASSES: once_cell::sync::Lazy<CoreClasses> = once_cell::sync::Lazy::new(|| {
    let basic_object = RClass::define("BasicObject", QNIL);
    let object = RClass::define("Object", basic_object);
    CoreClasses {
        basic_object,
        object,
        integer: RClass::define("Integer", object),
        float: RClass::define("Float", object),
        symbol: RClass::define("Symbol", object),
        nil_class: RClass::define("NilClass", object),
        true_class: RClass::define("TrueClass", object),
        false_class: RClass::define("FalseClass", object),
        array: RClass::define("Array", object),
        hash: RClass::define("Hash", object),
        string: RClass::define("String", object),
        range: RClass::define("Range", object),
        regexp: RClass::define("Regexp", object),
    }
});

pub fn core_classes() -> &'static CoreClasses {
    &CORE_CLASSES
}

/// Array model object. Reached only through host helpers; no embedded form.
#[repr(C)]
pub struct RArray {
    pub basic: RBasic,
    pub elems: Mutex<Vec<Value>>,
}

impl RArray {
    pub fn alloc(elems: Vec<Value>) -> Value {
        let ary = Box::leak(Box::new(RArray {
            basic: RBasic { flags: T_ARRAY, klass: core_classes().array },
            elems: Mutex::new(elems),
        }));
        Value(ary as *mut RArray as u64)
    }

    pub fn of(val: Value) -> &'static RArray {
        debug_assert_eq!(val.rbasic().flags & T_MASK, T_ARRAY);
        unsafe { &*(val.0 as *const RArray) }
    }
}

/// Hash model object.
#[repr(C)]
pub struct RHash {
    pub basic: RBasic,
    pub entries: Mutex<Vec<(Value, Value)>>,
}

impl RHash {
    pub fn alloc(entries: Vec<(Value, Value)>) -> Value {
        let hash = Box::leak(Box::new(RHash {
            basic: RBasic { flags: T_HASH, klass: core_classes().hash },
            entries: Mutex::new(entries),
        }));
        Value(hash as *mut RHash as u64)
    }

    pub fn of(val: Value) -> &'static RHash {
        debug_assert_eq!(val.rbasic().flags & T_MASK, T_HASH);
        unsafe { &*(val.0 as *const RHash) }
    }

    pub fn lookup(&self, key: Value) -> Option<Value> {
        self.entries.lock().iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }
}

/// Range model object.
#[repr(C)]
pub struct RRange {
    pub basic: RBasic,
    pub lo: Value,
    pub hi: Value,
    pub exclusive: bool,
}

impl RRange {
    pub fn alloc(lo: Value, hi: Value, exclusive: bool) -> Value {
        let range = Box::leak(Box::new(RRange {
            basic: RBasic { flags: 0, klass: core_classes().range },
            lo,
            hi,
            exclusive,
        }));
        Value(range as *mut RRange as u64)
    }

    pub fn of(val: Value) -> &'static RRange {
        debug_assert_eq!(val.class_of(), core_classes().range);
        unsafe { &*(val.0 as *const RRange) }
    }
}

/// String model object.
#[repr(C)]
pub struct RString {
    pub basic: RBasic,
    pub chars: Mutex<String>,
}

impl RString {
    pub fn alloc(s: &str) -> Value {
        let string = Box::leak(Box::new(RString {
            basic: RBasic { flags: T_STRING, klass: core_classes().string },
            chars: Mutex::new(s.to_owned()),
        }));
        Value(string as *mut RString as u64)
    }

    pub fn of(val: Value) -> &'static RString {
        debug_assert_eq!(val.rbasic().flags & T_MASK, T_STRING);
        unsafe { &*(val.0 as *const RString) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixnum_tagging_round_trips() {
        assert_eq!(Value::fixnum(0).0, 1);
        assert_eq!(Value::fixnum(1).0, 3);
        assert_eq!(Value::fixnum(-1).as_fixnum(), -1);
        assert_eq!(Value::fixnum(1 << 40).as_fixnum(), 1 << 40);
        assert!(Value::fixnum(7).is_fixnum());
        assert!(Value::fixnum(7).is_immediate());
    }

    #[test]
    fn test_special_const_predicates() {
        assert!(QNIL.is_special_const());
        assert!(QFALSE.is_special_const());
        assert!(QTRUE.is_special_const());
        assert!(!QNIL.truthy());
        assert!(!QFALSE.truthy());
        assert!(QTRUE.truthy());
        assert!(Value::fixnum(0).truthy());
        assert!(!QNIL.is_heap());
    }

    #[test]
    fn test_static_sym_encoding() {
        let sym = Value::static_sym(42);
        assert!(sym.is_static_sym());
        assert!(sym.is_immediate());
        assert!(!sym.is_fixnum());
    }

    #[test]
    fn test_class_of_immediates() {
        let core = core_classes();
        assert_eq!(Value::fixnum(5).class_of(), core.integer);
        assert_eq!(QNIL.class_of(), core.nil_class);
        assert_eq!(QTRUE.class_of(), core.true_class);
        assert_eq!(Value::static_sym(1).class_of(), core.symbol);
    }

    #[test]
    fn test_object_header_layout() {
        assert_eq!(std::mem::offset_of!(RBasic, klass), RBASIC_OFFSET_KLASS as usize);
        assert_eq!(std::mem::offset_of!(RObject, ivars), ROBJECT_OFFSET_AS_ARY as usize);
        assert_eq!(std::mem::size_of::<RObjectHeap>(), 16);
    }

    #[test]
    fn test_embedded_and_extended_ivars() {
        let class = RClass::define("Widget", core_classes().object);
        let small = RObject::alloc(class, 2);
        assert!(small.as_robject().embedded());

        let big = RObject::alloc(class, 8);
        assert!(!big.as_robject().embedded());
        *big.as_robject().ivar_slot(5) = Value::fixnum(9);
        assert_eq!(*big.as_robject().ivar_slot(5), Value::fixnum(9));
    }

    #[test]
    fn test_kind_of_walks_superclasses() {
        let core = core_classes();
        let animal = RClass::define("Animal", core.object);
        let dog = RClass::define("Dog", animal);
        let obj = RObject::alloc(dog, 0);
        assert!(obj.is_kind_of(dog));
        assert!(obj.is_kind_of(animal));
        assert!(obj.is_kind_of(core.object));
        assert!(!obj.is_kind_of(core.array));
    }
}
