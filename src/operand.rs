//! Operand expression trees and their folding algebra.
//!
//! Every decoded operand is a tree of [`Operand`] nodes. The tree is built
//! exclusively through the smart constructors ([`Operand::binary`],
//! [`Operand::func`], [`Operand::deref`], ...), which apply algebraic
//! rewrites eagerly: constant folding, identity elimination, shift/mask
//! normalization, word reassembly. Rewrites are pure tree-to-tree functions
//! and idempotent - re-optimizing an already folded tree is a no-op, which
//! the dataflow passes rely on.
//!
//! Two [`Operand::Complex`] values never compare equal: each stands for a
//! distinct unknown, so `x - x` must not fold to zero across two of them.

use std::collections::BTreeSet;
use std::fmt;

use crate::address::Address;
use crate::context::Context;
use crate::registers::{Cond, Reg, RegSet};

/// Classification of address constants, controlling how a renderer links
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrKind {
    /// A procedure entry point.
    Proc,
    /// A label inside the current procedure.
    Label,
    /// A data location.
    Data,
    /// A jump table.
    JumpTable,
}

/// Binary operators of the expression algebra.
///
/// The plain operators work on 8-bit values; the dotted variants
/// (`+.`, `-.`, `<<.`, `>>.`) are their 16-bit counterparts. Comparisons
/// yield single-bit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// 8-bit addition.
    Add,
    /// 8-bit subtraction.
    Sub,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise exclusive or.
    Xor,
    /// Equality comparison.
    Equals,
    /// Inequality comparison.
    NotEquals,
    /// Unsigned less-than.
    Less,
    /// Unsigned greater-or-equal.
    GreaterEqual,
    /// 8-bit shift left.
    Shl,
    /// 8-bit shift right.
    Shr,
    /// 16-bit addition.
    Add16,
    /// 16-bit subtraction.
    Sub16,
    /// 16-bit shift left.
    Shl16,
    /// 16-bit shift right.
    Shr16,
}

impl BinaryOp {
    /// The rendering symbol.
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
            BinaryOp::Equals => "==",
            BinaryOp::NotEquals => "!=",
            BinaryOp::Less => "<",
            BinaryOp::GreaterEqual => ">=",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Add16 => "+.",
            BinaryOp::Sub16 => "-.",
            BinaryOp::Shl16 => "<<.",
            BinaryOp::Shr16 => ">>.",
        }
    }

    /// Result width in bits.
    #[must_use]
    pub const fn bits(&self) -> u8 {
        match self {
            BinaryOp::Equals | BinaryOp::NotEquals | BinaryOp::Less | BinaryOp::GreaterEqual => 1,
            BinaryOp::Add16 | BinaryOp::Sub16 | BinaryOp::Shl16 | BinaryOp::Shr16 => 16,
            _ => 8,
        }
    }

    /// Evaluates the operator on two constant values.
    #[must_use]
    pub fn calculate(&self, left: u16, right: u16) -> u16 {
        match self {
            BinaryOp::Add => left.wrapping_add(right) & 0xFF,
            BinaryOp::Sub => left.wrapping_sub(right) & 0xFF,
            BinaryOp::And => left & right,
            BinaryOp::Or => left | right,
            BinaryOp::Xor => left ^ right,
            BinaryOp::Equals => u16::from(left == right),
            BinaryOp::NotEquals => u16::from(left != right),
            BinaryOp::Less => u16::from(left < right),
            BinaryOp::GreaterEqual => u16::from(left >= right),
            BinaryOp::Shl => left.wrapping_shl(u32::from(right) & 0xF) & 0xFF,
            BinaryOp::Shr => (left & 0xFF) >> (right & 0xF),
            BinaryOp::Add16 => left.wrapping_add(right),
            BinaryOp::Sub16 => left.wrapping_sub(right),
            BinaryOp::Shl16 => left.wrapping_shl(u32::from(right) & 0xF),
            BinaryOp::Shr16 => left.wrapping_shr(u32::from(right) & 0xF),
        }
    }
}

/// Named value functions of the expression algebra.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncOp {
    /// Low byte of a 16-bit value.
    Lo,
    /// High byte of a 16-bit value.
    Hi,
    /// Assembles a 16-bit value from high and low bytes.
    Word,
    /// Stack pointer after pushing a value: `push(sp, value)`.
    Push,
    /// The value popped from a stack state.
    PopValue,
    /// The stack pointer after popping.
    PopStack,
    /// Carry out of an 8-bit addition.
    CarryAdd,
    /// Logical negation.
    Not,
}

impl FuncOp {
    /// The rendering name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            FuncOp::Lo => "lo",
            FuncOp::Hi => "hi",
            FuncOp::Word => "word",
            FuncOp::Push => "push",
            FuncOp::PopValue => "popval",
            FuncOp::PopStack => "popst",
            FuncOp::CarryAdd => "c_add",
            FuncOp::Not => "not",
        }
    }

    fn calculate(&self, args: &[u16]) -> Option<u16> {
        match (self, args) {
            (FuncOp::Lo, [v]) => Some(v & 0xFF),
            (FuncOp::Hi, [v]) => Some(v >> 8),
            (FuncOp::Word, [hi, lo]) => Some(hi.wrapping_shl(8) | (lo & 0xFF)),
            _ => None,
        }
    }
}

/// A node of the operand expression tree.
#[derive(Debug, Clone)]
pub enum Operand {
    /// A literal value.
    Constant(u16),
    /// A typed address constant.
    Addr {
        /// How the address is used (procedure, label, data, jump table).
        kind: AddrKind,
        /// The address itself.
        addr: Address,
    },
    /// A register or register pair.
    Register(Reg),
    /// A branch condition.
    Condition(Cond),
    /// A memory dereference.
    Dereference(Box<Operand>),
    /// A bank:address pair computed at runtime.
    ComputedAddr {
        /// The bank half.
        bank: Box<Operand>,
        /// The in-window address half.
        addr: Box<Operand>,
    },
    /// An opaque value that the algebra cannot express, carrying only its
    /// dependency set. Two complex values never compare equal.
    Complex {
        /// Short origin tag for display (usually the producing mnemonic).
        hint: &'static str,
        /// Locations the value was computed from.
        deps: RegSet,
    },
    /// A binary operator application.
    Binary {
        /// The operator.
        op: BinaryOp,
        /// Left operand.
        left: Box<Operand>,
        /// Right operand.
        right: Box<Operand>,
    },
    /// A value-function application.
    Func {
        /// The function.
        op: FuncOp,
        /// Argument list.
        args: Vec<Operand>,
    },
}

impl PartialEq for Operand {
    fn eq(&self, other: &Self) -> bool {
        use Operand::*;
        match (self, other) {
            // The constant family compares by value, addresses included.
            (Constant(_) | Addr { .. }, Constant(_) | Addr { .. }) => self.value() == other.value(),
            (Register(a), Register(b)) => a == b,
            (Condition(a), Condition(b)) => a == b,
            (Dereference(a), Dereference(b)) => a == b,
            (
                ComputedAddr { bank: ab, addr: aa },
                ComputedAddr { bank: bb, addr: ba },
            ) => ab == bb && aa == ba,
            (
                Binary {
                    op: ao,
                    left: al,
                    right: ar,
                },
                Binary {
                    op: bo,
                    left: bl,
                    right: br,
                },
            ) => ao == bo && al == bl && ar == br,
            (Func { op: ao, args: aa }, Func { op: bo, args: ba }) => ao == bo && aa == ba,
            // Complex values are distinct unknowns.
            _ => false,
        }
    }
}

impl Operand {
    /// Convenience constructor for a plain constant.
    #[must_use]
    pub const fn constant(value: u16) -> Operand {
        Operand::Constant(value)
    }

    /// Convenience constructor for a typed address constant.
    #[must_use]
    pub const fn addr(kind: AddrKind, addr: Address) -> Operand {
        Operand::Addr { kind, addr }
    }

    /// The constant value of this node, if it has one.
    ///
    /// Address constants count as their virtual offset and the unconditional
    /// condition as 1, matching how the folding rules treat them.
    #[must_use]
    pub fn value(&self) -> Option<u16> {
        match self {
            Operand::Constant(v) => Some(*v),
            Operand::Addr { addr, .. } => Some(addr.virtual_offset()),
            Operand::Condition(Cond::Always) => Some(1),
            _ => None,
        }
    }

    /// Result width in bits.
    #[must_use]
    pub fn bits(&self) -> u8 {
        match self {
            Operand::Constant(v) => {
                if *v > 0xFF {
                    16
                } else {
                    8
                }
            }
            Operand::Addr { .. } => 16,
            Operand::Register(r) => r.bits(),
            Operand::Condition(_) => 1,
            Operand::ComputedAddr { .. } => 24,
            Operand::Binary { op, .. } => op.bits(),
            Operand::Func { op, .. } => match op {
                FuncOp::Word => 16,
                FuncOp::Not => 1,
                _ => 8,
            },
            _ => 8,
        }
    }

    /// The set of bits this expression can possibly have set, used by the
    /// `and` folding rules. Conservative: defaults to the full width.
    #[must_use]
    pub fn value_mask(&self) -> u16 {
        if let Some(v) = self.value() {
            return v;
        }
        if let Operand::Binary { op, left, right } = self {
            if let Some(shift) = right.value() {
                match op {
                    BinaryOp::Shl => {
                        return left.value_mask().wrapping_shl(u32::from(shift) & 0xF) & 0xFF
                    }
                    BinaryOp::Shr => return (left.value_mask() & 0xFF) >> (shift & 0xF),
                    _ => {}
                }
            }
        }
        match self.bits() {
            1 => 1,
            16 => 0xFFFF,
            _ => 0xFF,
        }
    }

    /// Atomic locations this expression reads.
    #[must_use]
    pub fn dependencies(&self) -> RegSet {
        match self {
            Operand::Register(r) => r.deps(),
            Operand::Condition(c) => c.deps(),
            Operand::Complex { deps, .. } => *deps,
            Operand::Dereference(target) => RegSet::MEM | target.dependencies(),
            Operand::ComputedAddr { bank, addr } => bank.dependencies() | addr.dependencies(),
            Operand::Binary { left, right, .. } => left.dependencies() | right.dependencies(),
            Operand::Func { op, args } => {
                let base = match op {
                    FuncOp::Push | FuncOp::PopValue | FuncOp::PopStack => RegSet::MEM,
                    _ => RegSet::empty(),
                };
                args.iter()
                    .fold(base, |acc, arg| acc | arg.dependencies())
            }
            _ => RegSet::empty(),
        }
    }

    /// Collects the concrete memory addresses this expression reads.
    pub fn mem_reads_into(&self, out: &mut BTreeSet<Address>) {
        if let Operand::Dereference(target) = self {
            if let Operand::Addr { addr, .. } = target.as_ref() {
                out.insert(*addr);
            }
        }
        match self {
            Operand::Dereference(target) => target.mem_reads_into(out),
            Operand::ComputedAddr { bank, addr } => {
                bank.mem_reads_into(out);
                addr.mem_reads_into(out);
            }
            Operand::Binary { left, right, .. } => {
                left.mem_reads_into(out);
                right.mem_reads_into(out);
            }
            Operand::Func { args, .. } => {
                for arg in args {
                    arg.mem_reads_into(out);
                }
            }
            _ => {}
        }
    }

    /// Rewrites this expression under the value mapping of `ctx`:
    /// registers are substituted by their known values, ambiguous address
    /// constants pick up the tracked bank, and every rebuilt node re-folds.
    #[must_use]
    pub fn optimized(&self, ctx: &Context) -> Operand {
        match self {
            Operand::Constant(_) | Operand::Complex { .. } => self.clone(),
            Operand::Addr { kind, addr } => {
                if addr.is_ambiguous() {
                    if let Some(bank) = ctx.constant_of(Reg::RomBank) {
                        return Operand::addr(*kind, addr.with_bank(bank));
                    }
                }
                self.clone()
            }
            Operand::Register(reg) => ctx.value_of(*reg).unwrap_or_else(|| self.clone()),
            Operand::Condition(cond) => ctx.condition_value(*cond).unwrap_or_else(|| self.clone()),
            Operand::Dereference(target) => {
                let mut target = target.optimized(ctx);
                if !matches!(target, Operand::Addr { .. }) {
                    if let Some(v) = target.value() {
                        target =
                            Operand::addr(AddrKind::Data, Address::from_virtual(v)).optimized(ctx);
                    }
                }
                Operand::Dereference(Box::new(target))
            }
            Operand::ComputedAddr { bank, addr } => {
                Operand::computed_addr(bank.optimized(ctx), addr.optimized(ctx))
            }
            Operand::Binary { op, left, right } => {
                Operand::binary(*op, left.optimized(ctx), right.optimized(ctx))
            }
            Operand::Func { op, args } => {
                Operand::func(*op, args.iter().map(|a| a.optimized(ctx)).collect())
            }
        }
    }

    /// Builds a dereference, resolving constant targets into data address
    /// constants. `current` supplies bank context for targets inside the
    /// switchable window.
    #[must_use]
    pub fn deref(target: Operand, current: Option<Address>) -> Operand {
        if matches!(target, Operand::Addr { .. }) {
            return Operand::Dereference(Box::new(target));
        }
        if let Some(v) = target.value() {
            let addr = match current {
                Some(cur) => Address::from_virtual_and_current(v, cur),
                None => Address::from_virtual(v),
            };
            return Operand::Dereference(Box::new(Operand::addr(AddrKind::Data, addr)));
        }
        Operand::Dereference(Box::new(target))
    }

    /// Builds a bank:address pair, folding to a procedure address when both
    /// halves are constant.
    #[must_use]
    pub fn computed_addr(bank: Operand, addr: Operand) -> Operand {
        if let (Some(b), Some(a)) = (bank.value(), addr.value()) {
            return Operand::addr(AddrKind::Proc, Address::from_virtual_and_bank(a, b));
        }
        Operand::ComputedAddr {
            bank: Box::new(bank),
            addr: Box::new(addr),
        }
    }

    /// Logical negation: conditions and comparisons invert structurally,
    /// anything else wraps in `not(..)`.
    #[must_use]
    pub fn logical_not(value: Operand) -> Operand {
        match value {
            Operand::Condition(c) => Operand::Condition(c.negated()),
            Operand::Binary { op, left, right } => {
                let inverse = match op {
                    BinaryOp::Equals => Some(BinaryOp::NotEquals),
                    BinaryOp::NotEquals => Some(BinaryOp::Equals),
                    BinaryOp::Less => Some(BinaryOp::GreaterEqual),
                    BinaryOp::GreaterEqual => Some(BinaryOp::Less),
                    _ => None,
                };
                match inverse {
                    Some(op) => Operand::Binary { op, left, right },
                    None => Operand::Func {
                        op: FuncOp::Not,
                        args: vec![Operand::Binary { op, left, right }],
                    },
                }
            }
            other => Operand::Func {
                op: FuncOp::Not,
                args: vec![other],
            },
        }
    }

    /// Builds a binary operator application, applying the folding rules.
    #[must_use]
    pub fn binary(op: BinaryOp, left: Operand, right: Operand) -> Operand {
        use BinaryOp::*;

        let (mut left, mut right) = (left, right);

        // Commutative operators normalize constants to the right.
        if matches!(op, Add | And | Or | Equals | Add16) && left.value().is_some() {
            std::mem::swap(&mut left, &mut right);
        }

        match op {
            Add => {
                if right.value() == Some(0) {
                    return left;
                }
                if left == right {
                    return Operand::binary(Shl, left, Operand::Constant(1));
                }
                // (x - a) + b  =>  x + (b - a)
                if let (Some(b), Operand::Binary { op: Sub, left: x, right: a }) =
                    (right.value(), &left)
                {
                    if let Some(a) = a.value() {
                        return Operand::binary(
                            Add,
                            (**x).clone(),
                            Operand::Constant(Sub.calculate(b, a)),
                        );
                    }
                }
            }
            Sub => {
                if right.value() == Some(0) {
                    return left;
                }
                if left == right {
                    return Operand::Constant(0);
                }
                // (x - a) - b  =>  x - (a + b)
                if let (Some(b), Operand::Binary { op: Sub, left: x, right: a }) =
                    (right.value(), &left)
                {
                    if let Some(a) = a.value() {
                        return Operand::binary(
                            Sub,
                            (**x).clone(),
                            Operand::Constant(Add.calculate(b, a)),
                        );
                    }
                }
            }
            And => {
                if let Some(r) = right.value() {
                    let mask = left.value_mask();
                    if mask & r == mask {
                        return left;
                    }
                    if mask & r == 0 {
                        return Operand::Constant(0);
                    }
                    // Distribute a constant mask over an or.
                    if let Operand::Binary { op: Or, left: a, right: b } = &left {
                        return Operand::binary(
                            Or,
                            Operand::binary(And, (**a).clone(), right.clone()),
                            Operand::binary(And, (**b).clone(), right),
                        );
                    }
                }
                if left == right {
                    return left;
                }
            }
            Or => {
                if left == right {
                    return left;
                }
                if right.value() == Some(0) {
                    return left;
                }
                // (x & a) | (x & b)  =>  x & (a | b)
                if let (
                    Operand::Binary { op: And, left: al, right: ar },
                    Operand::Binary { op: And, left: bl, right: br },
                ) = (&left, &right)
                {
                    if al == bl {
                        return Operand::binary(
                            And,
                            (**al).clone(),
                            Operand::binary(Or, (**ar).clone(), (**br).clone()),
                        );
                    }
                }
            }
            Xor => {
                if left == right {
                    return Operand::Constant(0);
                }
            }
            Equals => {
                // (x - a) == b  =>  x == a + b
                if let (Some(b), Operand::Binary { op: Sub, left: x, right: a }) =
                    (right.value(), &left)
                {
                    if let Some(a) = a.value() {
                        return Operand::binary(
                            Equals,
                            (**x).clone(),
                            Operand::Constant(Add.calculate(b, a)),
                        );
                    }
                }
            }
            Shl | Shr => {
                if let Some(shift) = right.value() {
                    // Merge nested same-direction shifts.
                    if let Operand::Binary { op: inner, left: x, right: a } = &left {
                        if *inner == op {
                            if let Some(a) = a.value() {
                                return Operand::binary(
                                    op,
                                    (**x).clone(),
                                    Operand::Constant(shift + a),
                                );
                            }
                        }
                    }
                    // Opposite-direction shifts become a single shift plus a
                    // mask of the surviving bits.
                    let opposite = if op == Shl { Shr } else { Shl };
                    if let Operand::Binary { op: inner, left: x, right: a } = &left {
                        if *inner == opposite {
                            if let Some(a) = a.value() {
                                let (sh_a, sh_b) = (a & 0xF, shift & 0xF);
                                let mask = if op == Shl {
                                    (0xFFu16 >> sh_a).wrapping_shl(u32::from(sh_b)) & 0xFF
                                } else {
                                    (0xFFu16.wrapping_shl(u32::from(sh_a)) & 0xFF) >> sh_b
                                };
                                let total = i32::from(sh_b) - i32::from(sh_a);
                                let shifted = if total < 0 {
                                    Operand::binary(
                                        opposite,
                                        (**x).clone(),
                                        Operand::Constant((-total) as u16),
                                    )
                                } else {
                                    Operand::binary(
                                        op,
                                        (**x).clone(),
                                        Operand::Constant(total as u16),
                                    )
                                };
                                return Operand::binary(And, shifted, Operand::Constant(mask));
                            }
                        }
                    }
                    // Distribute over a mask.
                    if let Operand::Binary { op: And, left: a, right: b } = &left {
                        return Operand::binary(
                            And,
                            Operand::binary(op, (**a).clone(), right.clone()),
                            Operand::binary(op, (**b).clone(), right),
                        );
                    }
                }
            }
            Add16 => {
                if right.value() == Some(0) {
                    return left;
                }
                // (x +. a) +. b  =>  x +. (a + b)
                if let (Some(b), Operand::Binary { op: Add16, left: x, right: a }) =
                    (right.value(), &left)
                {
                    if let Some(a) = a.value() {
                        return Operand::binary(
                            Add16,
                            (**x).clone(),
                            Operand::Constant(Add16.calculate(b, a)),
                        );
                    }
                }
            }
            _ => {}
        }

        if let (Some(l), Some(r)) = (left.value(), right.value()) {
            return Operand::Constant(op.calculate(l, r));
        }
        Operand::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Serializes the operand through a renderer, tagging constants and
    /// registers and emitting address constants as symbolic references.
    pub fn render(&self, r: &mut dyn crate::render::Renderer) {
        use crate::render::TextClass;
        match self {
            Operand::Constant(_) => r.tagged(&self.to_string(), TextClass::Constant),
            Operand::Addr { kind, addr } => r.address_ref(*kind, *addr),
            Operand::Register(reg) => r.tagged(&reg.to_string(), TextClass::Register),
            Operand::Condition(cond) => r.tagged(&cond.to_string(), TextClass::Register),
            Operand::Dereference(target) => {
                r.raw("[");
                target.render(r);
                r.raw("]");
            }
            Operand::ComputedAddr { bank, addr } => {
                r.raw("[L ");
                bank.render(r);
                r.raw(":");
                addr.render(r);
                r.raw("]");
            }
            Operand::Complex { .. } => r.raw(&self.to_string()),
            Operand::Binary { op, left, right } => {
                let paren = |x: &Operand| matches!(x, Operand::Binary { .. });
                if paren(left) {
                    r.raw("(");
                }
                left.render(r);
                if paren(left) {
                    r.raw(")");
                }
                r.raw(&format!(" {} ", op.symbol()));
                if paren(right) {
                    r.raw("(");
                }
                right.render(r);
                if paren(right) {
                    r.raw(")");
                }
            }
            Operand::Func { op: FuncOp::Not, args } => {
                r.raw("not ");
                args[0].render(r);
            }
            Operand::Func { op, args } => {
                r.raw(op.name());
                r.raw("(");
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        r.raw(", ");
                    }
                    arg.render(r);
                }
                r.raw(")");
            }
        }
    }

    /// Builds a value-function application, applying the folding rules.
    #[must_use]
    pub fn func(op: FuncOp, args: Vec<Operand>) -> Operand {
        use BinaryOp::{Shl, Shl16, Shr};

        match (op, args.as_slice()) {
            (FuncOp::Word, [hi, lo]) => {
                // word(hi(x), lo(x))  =>  x
                if let (
                    Operand::Func { op: FuncOp::Hi, args: ha },
                    Operand::Func { op: FuncOp::Lo, args: la },
                ) = (hi, lo)
                {
                    if ha.first() == la.first() {
                        if let Some(x) = ha.first() {
                            return x.clone();
                        }
                    }
                }
                if hi.value() == Some(0) {
                    return lo.clone();
                }
                // word(x >> a, x << b) with a + b == 8  =>  x <<. b
                if let (
                    Operand::Binary { op: Shr, left: xl, right: a },
                    Operand::Binary { op: Shl, left: xr, right: b },
                ) = (hi, lo)
                {
                    if xl == xr {
                        if let (Some(a), Some(b)) = (a.value(), b.value()) {
                            if a + b == 8 {
                                return Operand::binary(
                                    Shl16,
                                    (**xr).clone(),
                                    Operand::Constant(b),
                                );
                            }
                        }
                    }
                }
            }
            (FuncOp::PopValue, [Operand::Func { op: FuncOp::Push, args: pa }]) => {
                return pa[1].clone();
            }
            (FuncOp::PopStack, [Operand::Func { op: FuncOp::Push, args: pa }]) => {
                return pa[0].clone();
            }
            _ => {}
        }

        let values: Option<Vec<u16>> = args.iter().map(Operand::value).collect();
        if let Some(values) = values {
            if let Some(result) = op.calculate(&values) {
                return Operand::Constant(result);
            }
        }
        Operand::Func { op, args }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Constant(v) => {
                if *v <= 9 {
                    write!(f, "{v}")
                } else {
                    write!(f, "0x{v:x}")
                }
            }
            Operand::Addr { addr, .. } => write!(f, "{addr}"),
            Operand::Register(r) => write!(f, "{r}"),
            Operand::Condition(c) => write!(f, "{c}"),
            Operand::Dereference(target) => write!(f, "[{target}]"),
            Operand::ComputedAddr { bank, addr } => write!(f, "[L {bank}:{addr}]"),
            Operand::Complex { hint, deps } => {
                write!(f, "#{hint}:{}#", deps.join_names().join(","))
            }
            Operand::Binary { op, left, right } => {
                let paren = |x: &Operand| matches!(x, Operand::Binary { .. });
                if paren(left) {
                    write!(f, "({left})")?;
                } else {
                    write!(f, "{left}")?;
                }
                write!(f, " {} ", op.symbol())?;
                if paren(right) {
                    write!(f, "({right})")
                } else {
                    write!(f, "{right}")
                }
            }
            Operand::Func { op: FuncOp::Not, args } => write!(f, "not {}", args[0]),
            Operand::Func { op, args } => {
                write!(f, "{}(", op.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(r: Reg) -> Operand {
        Operand::Register(r)
    }

    #[test]
    fn constant_folding() {
        let sum = Operand::binary(BinaryOp::Add, Operand::Constant(1), Operand::Constant(1));
        assert_eq!(sum, Operand::Constant(2));

        let wrap = Operand::binary(BinaryOp::Add, Operand::Constant(0xFF), Operand::Constant(2));
        assert_eq!(wrap, Operand::Constant(1));
    }

    #[test]
    fn identities() {
        assert_eq!(
            Operand::binary(BinaryOp::Add, reg(Reg::A), Operand::Constant(0)),
            reg(Reg::A)
        );
        assert_eq!(
            Operand::binary(BinaryOp::Xor, reg(Reg::A), reg(Reg::A)),
            Operand::Constant(0)
        );
        assert_eq!(
            Operand::binary(BinaryOp::Sub, reg(Reg::B), reg(Reg::B)),
            Operand::Constant(0)
        );
        assert_eq!(
            Operand::binary(BinaryOp::Or, reg(Reg::A), reg(Reg::A)),
            reg(Reg::A)
        );
    }

    #[test]
    fn self_add_becomes_shift() {
        let doubled = Operand::binary(BinaryOp::Add, reg(Reg::A), reg(Reg::A));
        assert_eq!(doubled.to_string(), "A << 1");
    }

    #[test]
    fn shift_mask_normalization() {
        // (A >> 7) << 1  =>  (A >> 6) & 2
        let inner = Operand::binary(BinaryOp::Shr, reg(Reg::A), Operand::Constant(7));
        let outer = Operand::binary(BinaryOp::Shl, inner, Operand::Constant(1));
        assert_eq!(outer.to_string(), "(A >> 6) & 2");

        // Re-optimizing the folded tree is a no-op.
        let again = outer.optimized(&Context::new());
        assert_eq!(again, outer);
    }

    #[test]
    fn and_mask_elision() {
        // (A >> 6) already fits in 2 bits, so & 3 is the identity.
        let shifted = Operand::binary(BinaryOp::Shr, reg(Reg::A), Operand::Constant(6));
        let masked = Operand::binary(BinaryOp::And, shifted.clone(), Operand::Constant(3));
        assert_eq!(masked, shifted);

        let zero = Operand::binary(BinaryOp::And, shifted, Operand::Constant(0xF0));
        assert_eq!(zero, Operand::Constant(0));
    }

    #[test]
    fn word_reassembly() {
        let hl = reg(Reg::Hl);
        let word = Operand::func(
            FuncOp::Word,
            vec![
                Operand::func(FuncOp::Hi, vec![hl.clone()]),
                Operand::func(FuncOp::Lo, vec![hl.clone()]),
            ],
        );
        assert_eq!(word, hl);
    }

    #[test]
    fn push_pop_pairing() {
        let pushed = Operand::func(FuncOp::Push, vec![reg(Reg::Sp), reg(Reg::Bc)]);
        assert_eq!(
            Operand::func(FuncOp::PopValue, vec![pushed.clone()]),
            reg(Reg::Bc)
        );
        assert_eq!(Operand::func(FuncOp::PopStack, vec![pushed]), reg(Reg::Sp));
    }

    #[test]
    fn complex_values_are_distinct() {
        let a = Operand::Complex {
            hint: "ctx",
            deps: RegSet::empty(),
        };
        let b = a.clone();
        assert_ne!(a, b);
        // So x - x over unknowns must not fold to zero.
        let diff = Operand::binary(BinaryOp::Sub, a, b);
        assert!(matches!(diff, Operand::Binary { .. }));
    }

    #[test]
    fn constant_propagation_through_context() {
        let mut ctx = Context::new();
        ctx.set(Reg::A, Operand::Constant(1));
        let sum = Operand::Binary {
            op: BinaryOp::Add,
            left: Box::new(Operand::Constant(1)),
            right: Box::new(reg(Reg::A)),
        };
        assert_eq!(sum.optimized(&ctx), Operand::Constant(2));
    }

    #[test]
    fn dependencies_cover_dereference() {
        let deref = Operand::deref(reg(Reg::Hl), None);
        assert_eq!(deref.dependencies(), RegSet::MEM | RegSet::H | RegSet::L);
    }

    #[test]
    fn deref_constant_becomes_data_address() {
        let deref = Operand::deref(Operand::Constant(0xC123), None);
        assert_eq!(deref.to_string(), "[WORK:C123]");
        let mut reads = BTreeSet::new();
        deref.mem_reads_into(&mut reads);
        assert!(reads.contains(&Address::from_virtual(0xC123)));
    }

    #[test]
    fn subtract_fold_chain() {
        // (A - 1) - 2  =>  A - 3
        let one = Operand::binary(BinaryOp::Sub, reg(Reg::A), Operand::Constant(1));
        let three = Operand::binary(BinaryOp::Sub, one, Operand::Constant(2));
        assert_eq!(three.to_string(), "A - 3");

        // (A - 1) == 2  =>  A == 3
        let cmp = Operand::binary(
            BinaryOp::Equals,
            Operand::binary(BinaryOp::Sub, reg(Reg::A), Operand::Constant(1)),
            Operand::Constant(2),
        );
        assert_eq!(cmp.to_string(), "A == 3");
    }

    #[test]
    fn logical_not_inverts_comparisons() {
        let eq = Operand::binary(BinaryOp::Equals, reg(Reg::A), Operand::Constant(3));
        assert_eq!(Operand::logical_not(eq).to_string(), "A != 3");
        assert_eq!(
            Operand::logical_not(Operand::Condition(Cond::Fz)),
            Operand::Condition(Cond::Fnz)
        );
    }
}
