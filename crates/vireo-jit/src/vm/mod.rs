//! Host VM interface model
//!
//! The JIT compiles against the host virtual machine through three surfaces:
//! - binary layouts ([`value`], [`frame`], [`iseq`]) that generated code
//!   addresses directly,
//! - compile-time queries ([`method`], class/ivar tables, global flags),
//! - a C-ABI table of runtime helper functions ([`HostFns`]) whose
//!   addresses get embedded in generated code.
//!
//! The helper table ships with model implementations backed by the object
//! model in [`value`], so the crate is executable standalone; an embedding
//! host installs its own table at init.

pub mod frame;
pub mod iseq;
pub mod method;
pub mod value;

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use frame::ExecutionContext;
use value::{
    core_classes, RArray, RHash, RObject, RRange, RString, Value, QFALSE, QNIL, QTRUE, QUNDEF,
    T_ARRAY, T_HASH, T_MASK, T_OBJECT, T_STRING,
};

/// Runtime helper functions called from generated code. Function pointers
/// are embedded as 64-bit immediates at emit time.
#[derive(Clone, Copy)]
pub struct HostFns {
    pub ivar_get: extern "C" fn(Value, u64) -> Value,
    pub setinstancevariable: extern "C" fn(Value, u64, Value),
    pub ary_entry_internal: extern "C" fn(Value, i64) -> Value,
    pub hash_aref: extern "C" fn(Value, Value) -> Value,
    pub str_eql_internal: extern "C" fn(Value, Value) -> Value,
    pub ary_new_from_values: extern "C" fn(i64, *const Value) -> Value,
    pub ary_tmp_new_from_values: extern "C" fn(i64, *const Value) -> Value,
    pub ary_resurrect: extern "C" fn(Value) -> Value,
    pub hash_new_from_values: extern "C" fn(i64, *const Value) -> Value,
    pub range_new: extern "C" fn(Value, Value, i64) -> Value,
    pub str_resurrect: extern "C" fn(Value) -> Value,
    pub str_concat_literals: extern "C" fn(i64, *const Value) -> Value,
    pub reg_new_ary: extern "C" fn(Value, i64) -> Value,
    pub obj_as_string_result: extern "C" fn(Value, Value) -> Value,
    pub gvar_get: extern "C" fn(u64) -> Value,
    pub gvar_set: extern "C" fn(u64, Value),
    pub vm_defined: extern "C" fn(*mut ExecutionContext, u64, Value, Value, Value) -> Value,
    pub splat_array: extern "C" fn(Value, Value) -> Value,
    pub opt_aset: extern "C" fn(Value, Value, Value) -> Value,
    pub opt_mod: extern "C" fn(Value, Value) -> Value,
    pub obj_is_kind_of: extern "C" fn(Value, Value) -> Value,
    /// Fired by the patched C-function return path under tracing
    pub c_return_event: extern "C" fn(*mut ExecutionContext, Value),
}

static HOST_FNS: OnceCell<HostFns> = OnceCell::new();

/// Install the host helper table. May be called once; later calls are
/// ignored so embedders and tests can race benignly.
pub fn install_host_fns(fns: HostFns) {
    let _ = HOST_FNS.set(fns);
}

pub fn host_fns() -> &'static HostFns {
    HOST_FNS.get_or_init(HostFns::model)
}

// ---------------------------------------------------------------------------
// Global VM mode flags
// ---------------------------------------------------------------------------

static MULTI_RACTOR: AtomicBool = AtomicBool::new(false);
static C_TRACING: AtomicBool = AtomicBool::new(false);

pub fn multi_ractor_p() -> bool {
    MULTI_RACTOR.load(Ordering::Acquire)
}

/// Host-side event: a second ractor is about to spawn.
pub fn ractor_spawn() {
    crate::invariants::before_ractor_spawn();
    MULTI_RACTOR.store(true, Ordering::Release);
}

pub fn c_tracing_enabled() -> bool {
    C_TRACING.load(Ordering::Acquire)
}

/// Host-side event: a c-call/c-return tracing hook was enabled. All
/// generated code must become unreachable.
pub fn enable_c_tracing() {
    C_TRACING.store(true, Ordering::Release);
    crate::invariants::tracing_invalidate_all();
}

/// The block-parameter proxy singleton.
pub fn block_param_proxy() -> Value {
    static PROXY: Lazy<Value> = Lazy::new(|| RObject::alloc(core_classes().object, 0));
    *PROXY
}

// ---------------------------------------------------------------------------
// Model implementations of the helper table
// ---------------------------------------------------------------------------

static GLOBALS: Lazy<Mutex<FxHashMap<u64, Value>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

fn values_from_raw(n: i64, ptr: *const Value) -> Vec<Value> {
    unsafe { std::slice::from_raw_parts(ptr, n as usize) }.to_vec()
}

extern "C" fn model_ivar_get(obj: Value, id: u64) -> Value {
    if !obj.is_heap() || obj.rbasic().flags & T_MASK != T_OBJECT {
        return QNIL;
    }
    let index = obj
        .class_of()
        .as_rclass()
        .ivar_index_lookup(value::IvarId(id as u32));
    match index {
        Some(i) => {
            let slot = *obj.as_robject().ivar_slot(i);
            if slot == QUNDEF {
                QNIL
            } else {
                slot
            }
        }
        None => QNIL,
    }
}

extern "C" fn model_setinstancevariable(obj: Value, id: u64, val: Value) {
    debug_assert!(obj.is_heap());
    let class = obj.class_of().as_rclass();
    let id = value::IvarId(id as u32);
    let index = match class.ivar_index_lookup(id) {
        Some(i) => i,
        None => {
            let next = class.ivar_index_tbl.lock().len();
            class.set_ivar_index(id, next);
            next
        }
    };
    obj.as_robject().ivar_slot_grow(index, val);
}

extern "C" fn model_ary_entry_internal(ary: Value, idx: i64) -> Value {
    let elems = RArray::of(ary).elems.lock();
    let i = if idx < 0 { elems.len() as i64 + idx } else { idx };
    if i < 0 || i as usize >= elems.len() {
        QNIL
    } else {
        elems[i as usize]
    }
}

extern "C" fn model_hash_aref(hash: Value, key: Value) -> Value {
    RHash::of(hash).lookup(key).unwrap_or(QNIL)
}

extern "C" fn model_str_eql_internal(a: Value, b: Value) -> Value {
    if *RString::of(a).chars.lock() == *RString::of(b).chars.lock() {
        QTRUE
    } else {
        QFALSE
    }
}

extern "C" fn model_ary_new_from_values(n: i64, ptr: *const Value) -> Value {
    RArray::alloc(values_from_raw(n, ptr))
}

extern "C" fn model_ary_resurrect(ary: Value) -> Value {
    RArray::alloc(RArray::of(ary).elems.lock().clone())
}

extern "C" fn model_hash_new_from_values(n: i64, ptr: *const Value) -> Value {
    let flat = values_from_raw(n, ptr);
    let entries = flat.chunks(2).map(|kv| (kv[0], kv[1])).collect();
    RHash::alloc(entries)
}

extern "C" fn model_range_new(lo: Value, hi: Value, excl: i64) -> Value {
    RRange::alloc(lo, hi, excl != 0)
}

extern "C" fn model_str_resurrect(s: Value) -> Value {
    RString::alloc(&RString::of(s).chars.lock())
}

extern "C" fn model_str_concat_literals(n: i64, ptr: *const Value) -> Value {
    let mut out = String::new();
    for v in values_from_raw(n, ptr) {
        out.push_str(&RString::of(v).chars.lock());
    }
    RString::alloc(&out)
}

extern "C" fn model_reg_new_ary(ary: Value, _opt: i64) -> Value {
    let mut source = String::new();
    for v in RArray::of(ary).elems.lock().iter() {
        source.push_str(&RString::of(*v).chars.lock());
    }
    let re = RString::alloc(&source);
    unsafe { (*(re.0 as *mut value::RBasic)).klass = core_classes().regexp };
    re
}

extern "C" fn model_obj_as_string_result(str_val: Value, val: Value) -> Value {
    if str_val.is_heap() && str_val.rbasic().flags & T_MASK == T_STRING {
        return str_val;
    }
    if val.is_fixnum() {
        return RString::alloc(&val.as_fixnum().to_string());
    }
    RString::alloc("")
}

extern "C" fn model_gvar_get(id: u64) -> Value {
    GLOBALS.lock().get(&id).copied().unwrap_or(QNIL)
}

extern "C" fn model_gvar_set(id: u64, val: Value) {
    GLOBALS.lock().insert(id, val);
}

extern "C" fn model_vm_defined(
    _ec: *mut ExecutionContext,
    _op_type: u64,
    _obj: Value,
    pushval: Value,
    _v: Value,
) -> Value {
    // The model host resolves every definedness query positively
    pushval
}

extern "C" fn model_splat_array(flag: Value, ary: Value) -> Value {
    if ary.is_heap() && ary.rbasic().flags & T_MASK == T_ARRAY {
        if flag.truthy() {
            model_ary_resurrect(ary)
        } else {
            ary
        }
    } else {
        RArray::alloc(vec![ary])
    }
}

extern "C" fn model_opt_aset(recv: Value, key: Value, val: Value) -> Value {
    if !recv.is_heap() {
        return QUNDEF;
    }
    match recv.rbasic().flags & T_MASK {
        T_ARRAY if key.is_fixnum() => {
            let mut elems = RArray::of(recv).elems.lock();
            let i = key.as_fixnum();
            if i < 0 {
                return QUNDEF;
            }
            if i as usize >= elems.len() {
                elems.resize(i as usize + 1, QNIL);
            }
            elems[i as usize] = val;
            val
        }
        T_HASH => {
            let mut entries = RHash::of(recv).entries.lock();
            if let Some(slot) = entries.iter_mut().find(|(k, _)| *k == key) {
                slot.1 = val;
            } else {
                entries.push((key, val));
            }
            val
        }
        _ => QUNDEF,
    }
}

extern "C" fn model_opt_mod(a: Value, b: Value) -> Value {
    use method::{basic_op_unredefined, BasicOp, RedefinitionFlag};
    if !a.is_fixnum()
        || !b.is_fixnum()
        || !basic_op_unredefined(RedefinitionFlag::Integer, BasicOp::Mod)
    {
        return QUNDEF;
    }
    let (x, y) = (a.as_fixnum(), b.as_fixnum());
    if y == 0 {
        return QUNDEF;
    }
    // Result takes the divisor's sign
    let mut r = x % y;
    if r != 0 && (r < 0) != (y < 0) {
        r += y;
    }
    Value::fixnum(r)
}

extern "C" fn model_obj_is_kind_of(obj: Value, class: Value) -> Value {
    if obj.is_kind_of(class) {
        QTRUE
    } else {
        QFALSE
    }
}

static C_RETURN_EVENTS: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

extern "C" fn model_c_return_event(_ec: *mut ExecutionContext, _val: Value) {
    C_RETURN_EVENTS.fetch_add(1, Ordering::Relaxed);
}

/// How many c_return events the model hook has observed.
pub fn c_return_event_count() -> u64 {
    C_RETURN_EVENTS.load(Ordering::Relaxed)
}

impl HostFns {
    /// The model-backed table; what tests and the standalone build run on.
    pub fn model() -> HostFns {
        HostFns {
            ivar_get: model_ivar_get,
            setinstancevariable: model_setinstancevariable,
            ary_entry_internal: model_ary_entry_internal,
            hash_aref: model_hash_aref,
            str_eql_internal: model_str_eql_internal,
            ary_new_from_values: model_ary_new_from_values,
            ary_tmp_new_from_values: model_ary_new_from_values,
            ary_resurrect: model_ary_resurrect,
            hash_new_from_values: model_hash_new_from_values,
            range_new: model_range_new,
            str_resurrect: model_str_resurrect,
            str_concat_literals: model_str_concat_literals,
            reg_new_ary: model_reg_new_ary,
            obj_as_string_result: model_obj_as_string_result,
            gvar_get: model_gvar_get,
            gvar_set: model_gvar_set,
            vm_defined: model_vm_defined,
            splat_array: model_splat_array,
            opt_aset: model_opt_aset,
            opt_mod: model_opt_mod,
            obj_is_kind_of: model_obj_is_kind_of,
            c_return_event: model_c_return_event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_ary_helpers() {
        let vals = [Value::fixnum(1), Value::fixnum(2)];
        let ary = model_ary_new_from_values(2, vals.as_ptr());
        assert_eq!(model_ary_entry_internal(ary, 0), Value::fixnum(1));
        assert_eq!(model_ary_entry_internal(ary, -1), Value::fixnum(2));
        assert_eq!(model_ary_entry_internal(ary, 5), QNIL);

        let dup = model_ary_resurrect(ary);
        assert_ne!(dup, ary);
        assert_eq!(model_ary_entry_internal(dup, 1), Value::fixnum(2));
    }

    #[test]
    fn test_model_gvar_round_trip() {
        model_gvar_set(91, Value::fixnum(5));
        assert_eq!(model_gvar_get(91), Value::fixnum(5));
        assert_eq!(model_gvar_get(92), QNIL);
    }

    #[test]
    fn test_model_opt_aset_dispatch() {
        let ary = RArray::alloc(vec![QNIL]);
        assert_eq!(model_opt_aset(ary, Value::fixnum(0), QTRUE), QTRUE);
        assert_eq!(model_ary_entry_internal(ary, 0), QTRUE);
        // Non-container receivers report unsupported
        assert_eq!(model_opt_aset(Value::fixnum(3), Value::fixnum(0), QTRUE), QUNDEF);
    }

    #[test]
    fn test_model_ivar_round_trip() {
        let class = value::RClass::define("IvarModel", core_classes().object);
        let obj = RObject::alloc(class, 1);
        let id = 33u64;
        assert_eq!(model_ivar_get(obj, id), QNIL);
        model_setinstancevariable(obj, id, Value::fixnum(8));
        assert_eq!(model_ivar_get(obj, id), Value::fixnum(8));
    }
}
