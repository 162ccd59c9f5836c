//! The value-type lattice
//!
//! Compile-time knowledge about one value slot. `Unknown` sits at the top;
//! `UnknownImm` and `UnknownHeap` partition it; the leaves are the exact
//! shapes guards can establish. Narrowing must go through [`Type::diff`] so
//! incompatible refinements are caught instead of silently miscompiled.

use crate::vm::value::{core_classes, Value};

/// What is known about one stack slot, local, or the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Type {
    #[default]
    Unknown,
    UnknownImm,
    UnknownHeap,
    Nil,
    True,
    False,
    Fixnum,
    Flonum,
    ImmSymbol,
    TArray,
    THash,
    TString,
    /// Heap object of no further known shape
    Heap,
}

/// Distance between two lattice points, or proof they are unordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeDiff {
    /// `src` can flow where `dst` is expected; 0 means equal
    Compatible(usize),
    Incompatible,
}

impl Type {
    /// Exact type of a concrete value.
    pub fn of(val: Value) -> Type {
        if val.is_fixnum() {
            Type::Fixnum
        } else if val.is_flonum() {
            Type::Flonum
        } else if val.is_static_sym() {
            Type::ImmSymbol
        } else if val.is_nil() {
            Type::Nil
        } else if val == crate::vm::value::QTRUE {
            Type::True
        } else if val == crate::vm::value::QFALSE {
            Type::False
        } else {
            let core = core_classes();
            let class = val.class_of();
            if class == core.array {
                Type::TArray
            } else if class == core.hash {
                Type::THash
            } else if class == core.string {
                Type::TString
            } else {
                Type::Heap
            }
        }
    }

    pub fn is_imm(self) -> bool {
        matches!(
            self,
            Type::UnknownImm
                | Type::Nil
                | Type::True
                | Type::False
                | Type::Fixnum
                | Type::Flonum
                | Type::ImmSymbol
        )
    }

    pub fn is_heap(self) -> bool {
        matches!(self, Type::UnknownHeap | Type::TArray | Type::THash | Type::TString | Type::Heap)
    }

    /// Whether a value of this type definitely has (or lacks) a heap
    /// header. `None` when the lattice point spans both.
    pub fn heap_known(self) -> Option<bool> {
        if self.is_heap() {
            Some(true)
        } else if self.is_imm() {
            Some(false)
        } else {
            None
        }
    }

    /// Truthiness, when the lattice point decides it.
    pub fn known_truthy(self) -> Option<bool> {
        match self {
            Type::Nil | Type::False => Some(false),
            Type::Unknown | Type::UnknownImm => None,
            _ => Some(true),
        }
    }

    /// The exact class a guard on this type establishes, when there is one.
    pub fn known_class(self) -> Option<Value> {
        let core = core_classes();
        match self {
            Type::Nil => Some(core.nil_class),
            Type::True => Some(core.true_class),
            Type::False => Some(core.false_class),
            Type::Fixnum => Some(core.integer),
            Type::Flonum => Some(core.float),
            Type::ImmSymbol => Some(core.symbol),
            Type::TArray => Some(core.array),
            Type::THash => Some(core.hash),
            Type::TString => Some(core.string),
            _ => None,
        }
    }

    /// Distance from `self` up (or sideways) to `dst`.
    pub fn diff(self, dst: Type) -> TypeDiff {
        if self == dst {
            return TypeDiff::Compatible(0);
        }
        match dst {
            Type::Unknown => TypeDiff::Compatible(1),
            Type::UnknownImm if self.is_imm() => TypeDiff::Compatible(1),
            Type::UnknownHeap if self.is_heap() => TypeDiff::Compatible(1),
            // A bare Heap expectation is met by any known heap shape
            Type::Heap if self.is_heap() => TypeDiff::Compatible(1),
            _ => TypeDiff::Incompatible,
        }
    }

    /// Narrow to `src`. The caller must have emitted (or be about to emit)
    /// the guard establishing it; incompatible narrowing is a compiler bug.
    pub fn upgrade(&mut self, src: Type) {
        debug_assert!(
            src.diff(*self) != TypeDiff::Incompatible,
            "incompatible type refinement: {:?} -> {:?}",
            self,
            src
        );
        *self = src;
    }

    /// Widest common supertype.
    pub fn join(self, other: Type) -> Type {
        if self == other {
            self
        } else if self.is_imm() && other.is_imm() {
            Type::UnknownImm
        } else if self.is_heap() && other.is_heap() {
            Type::UnknownHeap
        } else {
            Type::Unknown
        }
    }
}

/// Where a stack temp's value actually lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TempMapping {
    /// Plain stack slot; its type is tracked per-temp
    #[default]
    MapToStack,
    /// Alias of the receiver
    MapToSelf,
    /// Alias of local `i`; reads the local's tracked type
    MapToLocal(u8),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::value::{RArray, RString, QNIL, QTRUE};

    #[test]
    fn test_type_of_values() {
        assert_eq!(Type::of(Value::fixnum(3)), Type::Fixnum);
        assert_eq!(Type::of(QNIL), Type::Nil);
        assert_eq!(Type::of(QTRUE), Type::True);
        assert_eq!(Type::of(Value::static_sym(4)), Type::ImmSymbol);
        assert_eq!(Type::of(RArray::alloc(vec![])), Type::TArray);
        assert_eq!(Type::of(RString::alloc("x")), Type::TString);
    }

    #[test]
    fn test_imm_heap_partition() {
        assert!(Type::Fixnum.is_imm());
        assert!(!Type::Fixnum.is_heap());
        assert!(Type::TArray.is_heap());
        assert!(!Type::Unknown.is_imm());
        assert!(!Type::Unknown.is_heap());
    }

    #[test]
    fn test_diff_orders_the_lattice() {
        assert_eq!(Type::Fixnum.diff(Type::Fixnum), TypeDiff::Compatible(0));
        assert_eq!(Type::Fixnum.diff(Type::Unknown), TypeDiff::Compatible(1));
        assert_eq!(Type::Fixnum.diff(Type::UnknownImm), TypeDiff::Compatible(1));
        assert_eq!(Type::Fixnum.diff(Type::UnknownHeap), TypeDiff::Incompatible);
        assert_eq!(Type::TArray.diff(Type::UnknownHeap), TypeDiff::Compatible(1));
        assert_eq!(Type::Unknown.diff(Type::Fixnum), TypeDiff::Incompatible);
    }

    #[test]
    fn test_join_widens() {
        assert_eq!(Type::Fixnum.join(Type::Fixnum), Type::Fixnum);
        assert_eq!(Type::Fixnum.join(Type::Flonum), Type::UnknownImm);
        assert_eq!(Type::TArray.join(Type::TString), Type::UnknownHeap);
        assert_eq!(Type::Fixnum.join(Type::TArray), Type::Unknown);
    }

    #[test]
    fn test_known_truthy() {
        assert_eq!(Type::Nil.known_truthy(), Some(false));
        assert_eq!(Type::False.known_truthy(), Some(false));
        assert_eq!(Type::Fixnum.known_truthy(), Some(true));
        assert_eq!(Type::Unknown.known_truthy(), None);
        assert_eq!(Type::UnknownHeap.known_truthy(), Some(true));
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn test_incompatible_upgrade_asserts() {
        let mut t = Type::Fixnum;
        t.upgrade(Type::TArray);
    }
}
