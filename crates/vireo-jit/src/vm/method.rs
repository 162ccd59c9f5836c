//! Method entries, call-site info, and the lookup/redefinition surface
//!
//! Models exactly the slice of the host method machinery the compiler
//! consults: callable method entries keyed by `(class, method id)`, the
//! definition kinds the dispatcher specializes on, call-info flag words,
//! and the per-class basic-operator redefinition bitmap.
//!
//! Mutation entry points (`define_method`, `redefine_basic_op`) notify the
//! assumption registry before publishing the change, the way the host VM
//! calls the JIT's invalidation hooks under its lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::vm::iseq::IseqPtr;
use crate::vm::value::{IvarId, Value, QNIL};

/// Interned method name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId(pub u32);

bitflags::bitflags! {
    /// Call-site flags from the instruction's call info.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CallFlags: u32 {
        const ARGS_SPLAT    = 1 << 0;
        const ARGS_BLOCKARG = 1 << 1;
        const FCALL         = 1 << 2;
        const KWARG         = 1 << 3;
        const KW_SPLAT      = 1 << 4;
        const TAILCALL      = 1 << 5;
        const SUPER         = 1 << 6;
        const ZSUPER        = 1 << 7;
    }
}

/// Static call-site description.
#[derive(Debug, Clone, Copy)]
pub struct CallInfo {
    pub mid: MethodId,
    pub argc: u32,
    pub flags: CallFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
    Protected,
}

/// A C-implemented method.
#[derive(Debug, Clone, Copy)]
pub struct CFunc {
    pub func: *const u8,
    /// Fixed arity, or -1 for (argc, argv, recv)
    pub argc: i32,
}

unsafe impl Send for CFunc {}
unsafe impl Sync for CFunc {}

/// The definition behind a method entry. Kinds past the first four are
/// recognized but never specialized.
pub enum MethodDef {
    Iseq(IseqPtr),
    Cfunc(CFunc),
    AttrReader(IvarId),
    Alias(Arc<MethodEntry>),
    AttrWriter(IvarId),
    Bmethod,
    Zsuper,
    Optimized,
    Missing,
    Refined,
    NotImplemented,
}

/// A callable method entry.
pub struct MethodEntry {
    pub called_id: MethodId,
    pub owner: Value,
    pub defined_class: Value,
    pub visibility: Visibility,
    pub def: MethodDef,
    /// Global definition serial; keys the specialized-cfunc codegen table.
    pub serial: u64,
}

static METHOD_SERIAL: AtomicU64 = AtomicU64::new(1);

impl MethodEntry {
    pub fn new(
        called_id: MethodId,
        owner: Value,
        visibility: Visibility,
        def: MethodDef,
    ) -> Arc<MethodEntry> {
        Arc::new(MethodEntry {
            called_id,
            owner,
            defined_class: owner,
            visibility,
            def,
            serial: METHOD_SERIAL.fetch_add(1, Ordering::Relaxed),
        })
    }
}

/// `rb_callable_method_entry`: resolve `mid` against `class`, walking the
/// superclass chain.
pub fn callable_method_entry(class: Value, mid: MethodId) -> Option<Arc<MethodEntry>> {
    let mut k = class;
    while k != QNIL {
        let rclass = k.as_rclass();
        if let Some(me) = rclass.method_table.lock().get(&mid) {
            return Some(me.clone());
        }
        k = rclass.superclass;
    }
    None
}

/// Resolve an aliased entry down to the original definition.
pub fn resolve_alias(me: &Arc<MethodEntry>) -> Arc<MethodEntry> {
    match &me.def {
        MethodDef::Alias(orig) => resolve_alias(orig),
        _ => me.clone(),
    }
}

/// Define (or redefine) a method. Fires the JIT's method-lookup
/// invalidation hook before the new entry becomes visible.
pub fn define_method(class: Value, mid: MethodId, me: Arc<MethodEntry>) {
    crate::invariants::method_lookup_changed(class, mid);
    class.as_rclass().method_table.lock().insert(mid, me);
}

/// Remove a method. Also an invalidation event.
pub fn remove_method(class: Value, mid: MethodId) {
    crate::invariants::method_lookup_changed(class, mid);
    class.as_rclass().method_table.lock().remove(&mid);
}

/// Per-class redefinition bitmap subjects: which core class a basic
/// operator belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedefinitionFlag {
    Integer,
    Float,
    String,
    Array,
    Hash,
}

/// Basic operators the interpreter specializes and the JIT guards on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicOp {
    Plus,
    Minus,
    Mod,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Aref,
    Aset,
}

static REDEFINED_OPS: Mutex<Option<FxHashSet<(RedefinitionFlag, BasicOp)>>> = Mutex::new(None);

/// `BASIC_OP_UNREDEFINED_P`
pub fn basic_op_unredefined(klass: RedefinitionFlag, op: BasicOp) -> bool {
    !REDEFINED_OPS
        .lock()
        .as_ref()
        .map_or(false, |set| set.contains(&(klass, op)))
}

/// Host-side event: a basic operator was monkey-patched. Marks the bitmap
/// and invalidates dependent blocks.
pub fn redefine_basic_op(klass: RedefinitionFlag, op: BasicOp) {
    REDEFINED_OPS
        .lock()
        .get_or_insert_with(FxHashSet::default)
        .insert((klass, op));
    crate::invariants::bop_redefined(klass, op);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::value::{core_classes, RClass};

    #[test]
    fn test_lookup_walks_superclass_chain() {
        let core = core_classes();
        let base = RClass::define("LookupBase", core.object);
        let child = RClass::define("LookupChild", base);
        let mid = MethodId(7001);
        let me = MethodEntry::new(mid, base, Visibility::Public, MethodDef::NotImplemented);
        base.as_rclass().method_table.lock().insert(mid, me.clone());

        let found = callable_method_entry(child, mid).unwrap();
        assert_eq!(found.called_id, mid);
        assert_eq!(found.owner, base);
        assert!(callable_method_entry(child, MethodId(7002)).is_none());
    }

    #[test]
    fn test_alias_resolution() {
        let core = core_classes();
        let class = RClass::define("AliasHolder", core.object);
        let orig = MethodEntry::new(MethodId(7100), class, Visibility::Public, MethodDef::NotImplemented);
        let alias = MethodEntry::new(
            MethodId(7101),
            class,
            Visibility::Public,
            MethodDef::Alias(orig.clone()),
        );
        assert_eq!(resolve_alias(&alias).serial, orig.serial);
    }

    #[test]
    fn test_basic_op_bitmap() {
        assert!(basic_op_unredefined(RedefinitionFlag::Integer, BasicOp::Mod));
        redefine_basic_op(RedefinitionFlag::Integer, BasicOp::Mod);
        assert!(!basic_op_unredefined(RedefinitionFlag::Integer, BasicOp::Mod));
    }
}
