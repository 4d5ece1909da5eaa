//! Forward value propagation state.
//!
//! A [`Context`] maps atomic registers to symbolic [`Operand`] values. The
//! forward dataflow pass threads one through the statement tree: loads update
//! it, uses substitute from it, branches fork it and merge the agreeing
//! bindings, loop headers invalidate it. Register pairs are decomposed into
//! independent hi/lo byte values on entry and reassembled with `word(..)` on
//! lookup, so partial overwrites of a pair behave correctly.

use std::collections::HashMap;

use crate::operand::{FuncOp, Operand};
use crate::registers::{Cond, Reg, RegSet};

/// A flow-sensitive mapping from registers to symbolic values.
#[derive(Debug, Clone, Default)]
pub struct Context {
    values: HashMap<Reg, Operand>,
}

impl Context {
    /// Creates an empty context: every register is unknown.
    #[must_use]
    pub fn new() -> Self {
        Context::default()
    }

    /// Records `value` for `reg`.
    ///
    /// Pairs split into hi/lo byte values; `AF` keeps only the accumulator
    /// and conservatively invalidates the flags. A value that depends on the
    /// register it defines collapses to an opaque complex value - the
    /// previous value is gone and cannot be referenced.
    pub fn set(&mut self, reg: Reg, value: Operand) {
        if let Some((hi, lo)) = reg.halves() {
            self.set(hi, Operand::func(FuncOp::Hi, vec![value.clone()]));
            self.set(lo, Operand::func(FuncOp::Lo, vec![value]));
            return;
        }
        if reg == Reg::Af {
            self.set(Reg::A, Operand::func(FuncOp::Hi, vec![value]));
            for flag in [Reg::Fz, Reg::Fc, Reg::Fn, Reg::Fh] {
                self.set_complex(flag);
            }
            return;
        }
        self.invalidate(reg);
        if value.dependencies().intersects(reg.deps()) {
            self.set_complex(reg);
        } else {
            self.values.insert(reg, value);
        }
    }

    /// Records that `reg` now holds an unknown value.
    pub fn set_complex(&mut self, reg: Reg) {
        if let Some((hi, lo)) = reg.halves() {
            self.set_complex(hi);
            self.set_complex(lo);
            return;
        }
        if reg == Reg::Af {
            self.set_complex(Reg::A);
            for flag in [Reg::Fz, Reg::Fc, Reg::Fn, Reg::Fh] {
                self.set_complex(flag);
            }
            return;
        }
        self.invalidate(reg);
        self.values.insert(
            reg,
            Operand::Complex {
                hint: "ctx",
                deps: RegSet::empty(),
            },
        );
    }

    /// Drops every binding whose value depends on `reg`.
    pub fn invalidate(&mut self, reg: Reg) {
        let bits = reg.deps();
        self.values.retain(|_, v| !v.dependencies().intersects(bits));
    }

    /// Drops every binding whose value depends on memory.
    pub fn invalidate_mem(&mut self) {
        self.values
            .retain(|_, v| !v.dependencies().contains(RegSet::MEM));
    }

    /// Drops all bindings.
    pub fn invalidate_all(&mut self) {
        self.values.clear();
    }

    /// Returns `true` when `reg` has a usable (non-opaque) value; for a pair,
    /// both halves must.
    #[must_use]
    pub fn has_value(&self, reg: Reg) -> bool {
        if let Some((hi, lo)) = reg.halves() {
            return self.has_value(hi) && self.has_value(lo);
        }
        match self.values.get(&reg) {
            Some(Operand::Complex { .. }) | None => false,
            Some(_) => true,
        }
    }

    /// The current value of `reg`, if known. Pairs reassemble as
    /// `word(hi, lo)`, which folds back to the original expression when both
    /// halves came from the same 16-bit value.
    #[must_use]
    pub fn value_of(&self, reg: Reg) -> Option<Operand> {
        if let Some((hi, lo)) = reg.halves() {
            if self.has_value(hi) && self.has_value(lo) {
                return Some(Operand::func(
                    FuncOp::Word,
                    vec![self.value_of(hi)?, self.value_of(lo)?],
                ));
            }
            return None;
        }
        if self.has_value(reg) {
            self.values.get(&reg).cloned()
        } else {
            None
        }
    }

    /// The value a branch condition evaluates to, if its flag is known.
    #[must_use]
    pub fn condition_value(&self, cond: Cond) -> Option<Operand> {
        match cond {
            Cond::Fz => self.value_of(Reg::Fz),
            Cond::Fc => self.value_of(Reg::Fc),
            Cond::Fnz => self.value_of(Reg::Fz).map(Operand::logical_not),
            Cond::Fnc => self.value_of(Reg::Fc).map(Operand::logical_not),
            Cond::Always => None,
        }
    }

    /// The constant value of `reg`, if it is known to be constant.
    #[must_use]
    pub fn constant_of(&self, reg: Reg) -> Option<u16> {
        self.value_of(reg).and_then(|v| v.value())
    }

    /// Returns `true` when `reg` is known to hold a constant.
    #[must_use]
    pub fn has_constant(&self, reg: Reg) -> bool {
        self.constant_of(reg).is_some()
    }

    /// Joins two branch contexts: only bindings present and equal in both
    /// survive. Opaque values never compare equal, so they are invalidated
    /// by construction.
    #[must_use]
    pub fn merged(a: &Context, b: &Context) -> Context {
        Context {
            values: a
                .values
                .iter()
                .filter(|(reg, value)| b.values.get(reg) == Some(value))
                .map(|(reg, value)| (*reg, value.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_decomposition() {
        let mut ctx = Context::new();
        ctx.set(Reg::Hl, Operand::Constant(0x1234));
        assert_eq!(ctx.constant_of(Reg::H), Some(0x12));
        assert_eq!(ctx.constant_of(Reg::L), Some(0x34));
        assert_eq!(ctx.constant_of(Reg::Hl), Some(0x1234));
    }

    #[test]
    fn pair_reassembly_is_lossless() {
        let mut ctx = Context::new();
        ctx.set(Reg::Bc, Operand::Register(Reg::Hl));
        // word(hi(HL), lo(HL)) folds back to HL.
        assert_eq!(ctx.value_of(Reg::Bc), Some(Operand::Register(Reg::Hl)));
    }

    #[test]
    fn writes_invalidate_dependents() {
        let mut ctx = Context::new();
        ctx.set(Reg::B, Operand::Register(Reg::A));
        assert!(ctx.has_value(Reg::B));
        // Writing A kills the recorded B = A.
        ctx.set(Reg::A, Operand::Constant(1));
        assert!(!ctx.has_value(Reg::B));
        assert_eq!(ctx.constant_of(Reg::A), Some(1));
    }

    #[test]
    fn self_referential_value_collapses() {
        let mut ctx = Context::new();
        // A = A + 1 with unknown A: no usable value.
        ctx.set(
            Reg::A,
            Operand::binary(
                crate::operand::BinaryOp::Add,
                Operand::Register(Reg::A),
                Operand::Constant(1),
            ),
        );
        assert!(!ctx.has_value(Reg::A));
    }

    #[test]
    fn af_keeps_only_accumulator() {
        let mut ctx = Context::new();
        ctx.set(Reg::Fz, Operand::Constant(1));
        ctx.set(Reg::Af, Operand::Constant(0x12FF));
        assert_eq!(ctx.constant_of(Reg::A), Some(0x12));
        assert!(!ctx.has_value(Reg::Fz));
    }

    #[test]
    fn condition_values() {
        let mut ctx = Context::new();
        ctx.set(
            Reg::Fz,
            Operand::binary(
                crate::operand::BinaryOp::Equals,
                Operand::Register(Reg::A),
                Operand::Constant(0),
            ),
        );
        assert_eq!(
            ctx.condition_value(Cond::Fz).unwrap().to_string(),
            "A == 0"
        );
        assert_eq!(
            ctx.condition_value(Cond::Fnz).unwrap().to_string(),
            "A != 0"
        );
        assert_eq!(ctx.condition_value(Cond::Always), None);
    }

    #[test]
    fn merge_keeps_agreeing_bindings() {
        let mut a = Context::new();
        a.set(Reg::A, Operand::Constant(1));
        a.set(Reg::B, Operand::Constant(2));
        let mut b = Context::new();
        b.set(Reg::A, Operand::Constant(1));
        b.set(Reg::B, Operand::Constant(3));
        let merged = Context::merged(&a, &b);
        assert_eq!(merged.constant_of(Reg::A), Some(1));
        assert!(!merged.has_value(Reg::B));
    }

    #[test]
    fn mem_invalidation() {
        let mut ctx = Context::new();
        ctx.set(
            Reg::A,
            Operand::deref(Operand::Constant(0xC000), None),
        );
        assert!(ctx.has_value(Reg::A));
        ctx.invalidate_mem();
        assert!(!ctx.has_value(Reg::A));
    }
}
