//! Compile-time abstract interpreter state
//!
//! A [`Context`] describes everything the compiler knows at one point in a
//! block version: stack height, per-temp types and aliases, local types,
//! the receiver's type, the unmaterialized SP delta, and the position in a
//! polymorphic guard chain. Contexts key the version index: block versions
//! are deduplicated up to context compatibility.

use crate::asm::x86_64::{mem, Mem};
use crate::codegen::REG_SP;
use crate::core::types::{TempMapping, Type, TypeDiff};

/// Number of topmost stack temps with tracked types/mappings.
pub const MAX_TEMP_TYPES: usize = 8;
/// Number of leading locals with tracked types.
pub const MAX_LOCAL_TYPES: usize = 8;

/// One operand as the codegen sees it: the receiver or a stack temp,
/// counted from the top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnOpnd {
    SelfOpnd,
    StackOpnd(u16),
}

/// Compatibility distance between two contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxDiff {
    Compatible(usize),
    Incompatible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Context {
    /// Abstract operand-stack height
    pub stack_size: u16,
    /// Slots of delta between the interpreter-visible SP and the
    /// compile-time stack top (not yet written back)
    pub sp_offset: i16,
    /// Depth in a polymorphic guard chain at this instruction
    pub chain_depth: u8,
    self_type: Type,
    local_types: [Type; MAX_LOCAL_TYPES],
    temp_types: [Type; MAX_TEMP_TYPES],
    temp_mapping: [TempMapping; MAX_TEMP_TYPES],
}

impl Context {
    /// Address of the `n`th-from-top stack temp.
    pub fn stack_opnd(&self, n: u16) -> Mem {
        mem(REG_SP, 8 * (self.sp_offset as i32 - 1 - n as i32))
    }

    /// SP-relative address `byte_off` past the abstract stack top.
    pub fn sp_opnd(&self, byte_off: i32) -> Mem {
        mem(REG_SP, 8 * self.sp_offset as i32 + byte_off)
    }

    /// Push a temp with an explicit mapping (used when duplicating slots).
    pub fn stack_push_mapping(&mut self, mapping: TempMapping, ty: Type) -> Mem {
        self.push_with(mapping, ty)
    }

    fn push_with(&mut self, mapping: TempMapping, ty: Type) -> Mem {
        let idx = self.stack_size as usize;
        if idx < MAX_TEMP_TYPES {
            self.temp_types[idx] = ty;
            self.temp_mapping[idx] = mapping;
        }
        self.stack_size += 1;
        self.sp_offset += 1;
        self.stack_opnd(0)
    }

    /// Push a fresh temp of type `ty`.
    pub fn stack_push(&mut self, ty: Type) -> Mem {
        self.push_with(TempMapping::MapToStack, ty)
    }

    /// Push an alias of the receiver.
    pub fn stack_push_self(&mut self) -> Mem {
        self.push_with(TempMapping::MapToSelf, Type::Unknown)
    }

    /// Push an alias of local `idx`.
    pub fn stack_push_local(&mut self, idx: usize) -> Mem {
        if idx < MAX_LOCAL_TYPES {
            self.push_with(TempMapping::MapToLocal(idx as u8), Type::Unknown)
        } else {
            self.stack_push(Type::Unknown)
        }
    }

    /// Pop `n` temps; returns the address of the old top.
    pub fn stack_pop(&mut self, n: u16) -> Mem {
        debug_assert!(n <= self.stack_size);
        let top = self.stack_opnd(0);
        for i in 0..n {
            let idx = (self.stack_size - 1 - i) as usize;
            if idx < MAX_TEMP_TYPES {
                self.temp_types[idx] = Type::Unknown;
                self.temp_mapping[idx] = TempMapping::MapToStack;
            }
        }
        self.stack_size -= n;
        self.sp_offset -= n as i16;
        top
    }

    pub fn get_opnd_type(&self, opnd: InsnOpnd) -> Type {
        match opnd {
            InsnOpnd::SelfOpnd => self.self_type,
            InsnOpnd::StackOpnd(n) => {
                debug_assert!(n < self.stack_size);
                let idx = (self.stack_size - 1 - n) as usize;
                if idx >= MAX_TEMP_TYPES {
                    return Type::Unknown;
                }
                match self.temp_mapping[idx] {
                    TempMapping::MapToSelf => self.self_type,
                    TempMapping::MapToStack => self.temp_types[idx],
                    TempMapping::MapToLocal(l) => self.local_types[l as usize],
                }
            }
        }
    }

    pub fn get_opnd_mapping(&self, opnd: InsnOpnd) -> TempMapping {
        match opnd {
            InsnOpnd::SelfOpnd => TempMapping::MapToSelf,
            InsnOpnd::StackOpnd(n) => {
                debug_assert!(n < self.stack_size);
                let idx = (self.stack_size - 1 - n) as usize;
                if idx < MAX_TEMP_TYPES {
                    self.temp_mapping[idx]
                } else {
                    TempMapping::MapToStack
                }
            }
        }
    }

    pub fn set_opnd_mapping(&mut self, opnd: InsnOpnd, mapping: TempMapping, ty: Type) {
        let n = match opnd {
            InsnOpnd::StackOpnd(n) => n,
            InsnOpnd::SelfOpnd => panic!("self has a fixed mapping"),
        };
        debug_assert!(n < self.stack_size);
        let idx = (self.stack_size - 1 - n) as usize;
        if idx < MAX_TEMP_TYPES {
            self.temp_mapping[idx] = mapping;
            self.temp_types[idx] = ty;
        }
    }

    /// Narrow an operand's type after a guard. Refinements through an alias
    /// are visible at the aliased location too.
    pub fn upgrade_opnd_type(&mut self, opnd: InsnOpnd, ty: Type) {
        match opnd {
            InsnOpnd::SelfOpnd => self.self_type.upgrade(ty),
            InsnOpnd::StackOpnd(n) => {
                debug_assert!(n < self.stack_size);
                let idx = (self.stack_size - 1 - n) as usize;
                if idx >= MAX_TEMP_TYPES {
                    return;
                }
                match self.temp_mapping[idx] {
                    TempMapping::MapToSelf => self.self_type.upgrade(ty),
                    TempMapping::MapToStack => self.temp_types[idx].upgrade(ty),
                    TempMapping::MapToLocal(l) => self.local_types[l as usize].upgrade(ty),
                }
            }
        }
    }

    pub fn get_local_type(&self, idx: usize) -> Type {
        if idx < MAX_LOCAL_TYPES {
            self.local_types[idx]
        } else {
            Type::Unknown
        }
    }

    /// The local is being overwritten: temps aliasing it detach, keeping
    /// the value's old type.
    pub fn set_local_type(&mut self, idx: usize, ty: Type) {
        if idx >= MAX_LOCAL_TYPES {
            return;
        }
        for t in 0..MAX_TEMP_TYPES.min(self.stack_size as usize) {
            if self.temp_mapping[t] == TempMapping::MapToLocal(idx as u8) {
                self.temp_mapping[t] = TempMapping::MapToStack;
                self.temp_types[t] = self.local_types[idx];
            }
        }
        self.local_types[idx] = ty;
    }

    pub fn get_self_type(&self) -> Type {
        self.self_type
    }

    pub fn set_self_type(&mut self, ty: Type) {
        self.self_type = ty;
    }

    /// Forget everything about the locals. Must run after any operation
    /// that may have executed code with access to the local frame; stale
    /// local aliases on the stack downgrade to untyped temps.
    pub fn clear_local_types(&mut self) {
        for t in 0..MAX_TEMP_TYPES.min(self.stack_size as usize) {
            if matches!(self.temp_mapping[t], TempMapping::MapToLocal(_)) {
                self.temp_mapping[t] = TempMapping::MapToStack;
                self.temp_types[t] = Type::Unknown;
            }
        }
        self.local_types = [Type::Unknown; MAX_LOCAL_TYPES];
    }

    /// Context with the same shape but no knowledge; the fallback once a
    /// position hits the version cap.
    pub fn generic(&self) -> Context {
        Context {
            stack_size: self.stack_size,
            sp_offset: self.sp_offset,
            ..Context::default()
        }
    }

    /// Can code compiled for `dst` soundly run in state `self`, and at what
    /// precision cost?
    pub fn diff(&self, dst: &Context) -> CtxDiff {
        if self.stack_size != dst.stack_size
            || self.sp_offset != dst.sp_offset
            || self.chain_depth != dst.chain_depth
        {
            return CtxDiff::Incompatible;
        }

        let mut total = 0usize;
        let mut add = |d: TypeDiff| match d {
            TypeDiff::Compatible(n) => {
                total += n;
                true
            }
            TypeDiff::Incompatible => false,
        };

        if !add(self.self_type.diff(dst.self_type)) {
            return CtxDiff::Incompatible;
        }
        for i in 0..MAX_LOCAL_TYPES {
            if !add(self.local_types[i].diff(dst.local_types[i])) {
                return CtxDiff::Incompatible;
            }
        }
        for n in 0..self.stack_size.min(MAX_TEMP_TYPES as u16) {
            let opnd = InsnOpnd::StackOpnd(n);
            let src_map = self.get_opnd_mapping(opnd);
            let dst_map = dst.get_opnd_mapping(opnd);
            if src_map != dst_map {
                if dst_map == TempMapping::MapToStack {
                    // Losing an alias is allowed, at a cost
                    add(TypeDiff::Compatible(1));
                } else {
                    return CtxDiff::Incompatible;
                }
            }
            if !add(self.get_opnd_type(opnd).diff(dst.get_opnd_type(opnd))) {
                return CtxDiff::Incompatible;
            }
        }
        CtxDiff::Compatible(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_tracks_height_and_sp() {
        let mut ctx = Context::default();
        ctx.stack_push(Type::Fixnum);
        ctx.stack_push(Type::Nil);
        assert_eq!(ctx.stack_size, 2);
        assert_eq!(ctx.sp_offset, 2);
        assert_eq!(ctx.get_opnd_type(InsnOpnd::StackOpnd(0)), Type::Nil);
        assert_eq!(ctx.get_opnd_type(InsnOpnd::StackOpnd(1)), Type::Fixnum);

        ctx.stack_pop(1);
        assert_eq!(ctx.stack_size, 1);
        assert_eq!(ctx.sp_offset, 1);
        assert_eq!(ctx.get_opnd_type(InsnOpnd::StackOpnd(0)), Type::Fixnum);
    }

    #[test]
    fn test_stack_opnd_addressing() {
        let mut ctx = Context::default();
        ctx.stack_push(Type::Unknown);
        ctx.stack_push(Type::Unknown);
        // Two temps above a materialized SP: top at +8, below it at +0
        assert_eq!(ctx.stack_opnd(0).disp, 8);
        assert_eq!(ctx.stack_opnd(1).disp, 0);
        assert_eq!(ctx.sp_opnd(0).disp, 16);
    }

    #[test]
    fn test_local_alias_observes_refinement() {
        let mut ctx = Context::default();
        ctx.set_local_type(2, Type::Unknown);
        ctx.stack_push_local(2);
        ctx.upgrade_opnd_type(InsnOpnd::StackOpnd(0), Type::Fixnum);
        // The refinement propagated through to the local
        assert_eq!(ctx.get_local_type(2), Type::Fixnum);
        assert_eq!(ctx.get_opnd_type(InsnOpnd::StackOpnd(0)), Type::Fixnum);
    }

    #[test]
    fn test_set_local_detaches_aliases_with_old_type() {
        let mut ctx = Context::default();
        ctx.set_local_type(0, Type::Fixnum);
        ctx.stack_push_local(0);
        ctx.set_local_type(0, Type::TString);
        // The temp kept the value it aliased, typed as before the store
        assert_eq!(ctx.get_opnd_type(InsnOpnd::StackOpnd(0)), Type::Fixnum);
        assert_eq!(ctx.get_opnd_mapping(InsnOpnd::StackOpnd(0)), TempMapping::MapToStack);
        assert_eq!(ctx.get_local_type(0), Type::TString);
    }

    #[test]
    fn test_clear_local_types_downgrades_aliases() {
        let mut ctx = Context::default();
        ctx.set_local_type(1, Type::Fixnum);
        ctx.stack_push_local(1);
        ctx.clear_local_types();
        assert_eq!(ctx.get_local_type(1), Type::Unknown);
        assert_eq!(ctx.get_opnd_mapping(InsnOpnd::StackOpnd(0)), TempMapping::MapToStack);
        assert_eq!(ctx.get_opnd_type(InsnOpnd::StackOpnd(0)), Type::Unknown);
    }

    #[test]
    fn test_self_alias() {
        let mut ctx = Context::default();
        ctx.set_self_type(Type::Unknown);
        ctx.stack_push_self();
        ctx.upgrade_opnd_type(InsnOpnd::StackOpnd(0), Type::THash);
        assert_eq!(ctx.get_self_type(), Type::THash);
    }

    #[test]
    fn test_diff_compatibility() {
        let mut precise = Context::default();
        precise.stack_push(Type::Fixnum);
        let mut loose = Context::default();
        loose.stack_push(Type::Unknown);

        // A fixnum state can run code expecting nothing in particular...
        assert!(matches!(precise.diff(&loose), CtxDiff::Compatible(_)));
        // ...but an unknown state cannot run fixnum-specialized code
        assert_eq!(loose.diff(&precise), CtxDiff::Incompatible);
        // Equal contexts diff at zero
        assert_eq!(precise.diff(&precise.clone()), CtxDiff::Compatible(0));
    }

    #[test]
    fn test_diff_rejects_shape_mismatch() {
        let mut a = Context::default();
        a.stack_push(Type::Unknown);
        let b = Context::default();
        assert_eq!(a.diff(&b), CtxDiff::Incompatible);

        let mut chained = b;
        chained.chain_depth = 1;
        assert_eq!(b.diff(&chained), CtxDiff::Incompatible);
    }

    #[test]
    fn test_generic_keeps_shape_only() {
        let mut ctx = Context::default();
        ctx.stack_push(Type::Fixnum);
        ctx.set_local_type(0, Type::TArray);
        let g = ctx.generic();
        assert_eq!(g.stack_size, 1);
        assert_eq!(g.sp_offset, 1);
        assert_eq!(g.get_opnd_type(InsnOpnd::StackOpnd(0)), Type::Unknown);
        assert_eq!(g.get_local_type(0), Type::Unknown);
        assert!(matches!(ctx.diff(&g), CtxDiff::Compatible(_)));
    }
}
