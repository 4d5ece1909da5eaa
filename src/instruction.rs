//! Decoded instruction kinds.
//!
//! The decoder classifies every decoded operation into one of a closed set
//! of kinds: generic expression ops, loads, jumps, calls (tail calls
//! included), returns, jump-table switches, and the non-continuing bad
//! opcode. Each kind knows its control flow (`has_continue`, `jumps`,
//! `calls`), its dependency behavior, and how to rewrite itself under a
//! value context. All rewrites produce new values.
//!
//! Compound expression ops are decomposed into simple per-location loads
//! ([`Instruction::split_to_simple`]) when blocks are built, so the dataflow
//! passes mostly see assignments.

use std::collections::{BTreeMap, BTreeSet};

use crate::address::Address;
use crate::context::Context;
use crate::depend::DependencySet;
use crate::operand::{AddrKind, Operand};
use crate::registers::{Cond, Reg, RegSet};
use crate::render::{render_list, Renderer, TextClass};
use crate::rom::ByteSource;
use crate::session::{AnalysisOverrides, CallIdiom};
use crate::xref::CrossReferenceStore;

/// A generic operation described entirely by its effect expression.
#[derive(Debug, Clone)]
pub struct ExpressionOp {
    /// Mnemonic from the rule table.
    pub name: &'static str,
    /// Display operands.
    pub operands: Vec<Operand>,
    /// Location of the opcode byte.
    pub addr: Address,
    /// Locations read.
    pub reads: RegSet,
    /// Locations written.
    pub writes: RegSet,
    /// Ordered `(target, value)` assignments for writes with known values.
    pub loads: Vec<(Operand, Operand)>,
}

/// An assignment: `target = source`.
#[derive(Debug, Clone)]
pub struct LoadOp {
    /// Originating mnemonic.
    pub name: &'static str,
    /// Register or dereference target.
    pub target: Operand,
    /// Source expression.
    pub source: Operand,
    /// Location of the opcode byte.
    pub addr: Address,
    /// Locations read.
    pub reads: RegSet,
    /// Locations written.
    pub writes: RegSet,
}

impl LoadOp {
    /// Builds a load, deriving the read/write sets from the operands: a
    /// dereference target reads its pointer and writes memory, a register
    /// target writes the register.
    #[must_use]
    pub fn new(name: &'static str, target: Operand, source: Operand, addr: Address) -> Self {
        let mut reads = source.dependencies();
        let writes;
        if matches!(target, Operand::Dereference(_)) {
            reads |= target.dependencies();
            writes = RegSet::MEM;
        } else {
            writes = target.dependencies();
        }
        LoadOp {
            name,
            target,
            source,
            addr,
            reads,
            writes,
        }
    }
}

/// A jump, conditional or not, direct or register-indirect.
#[derive(Debug, Clone)]
pub struct JumpOp {
    /// Mnemonic (`JP`).
    pub name: &'static str,
    /// Target operand as displayed.
    pub target: Operand,
    /// Statically known target, when the operand resolves to one.
    pub target_addr: Option<Address>,
    /// Branch condition.
    pub cond: Cond,
    /// Location of the opcode byte.
    pub addr: Address,
    /// Locations read (the condition flag).
    pub reads: RegSet,
    /// Locations written (the side-effect marker).
    pub writes: RegSet,
}

impl JumpOp {
    fn resolve(name: &'static str, target: Operand, cond: Cond, addr: Address, reads: RegSet, writes: RegSet) -> Self {
        let (target, target_addr) = match target {
            Operand::Addr { addr: t, kind: _ } => {
                (Operand::addr(AddrKind::Proc, t), Some(t))
            }
            other => match other.value() {
                Some(v) => {
                    let t = Address::from_virtual_and_current(v, addr);
                    (Operand::addr(AddrKind::Proc, t), Some(t))
                }
                None => (other, None),
            },
        };
        JumpOp {
            name,
            target,
            target_addr,
            cond,
            addr,
            reads,
            writes,
        }
    }
}

/// A call, with the callee's calling contract captured from the store.
#[derive(Debug, Clone)]
pub struct CallOp {
    /// `CALL` or `tail-call`.
    pub name: &'static str,
    /// Target operand as displayed.
    pub target: Operand,
    /// Resolved callee address; an ambiguous placeholder when the target is
    /// computed at runtime.
    pub target_addr: Address,
    /// Call condition.
    pub cond: Cond,
    /// Location of the opcode byte.
    pub addr: Address,
    /// The callee's dependency set as known at decode time.
    pub target_deps: DependencySet,
    /// Parameters proven constant at the call site by the forward pass.
    pub constant_params: BTreeMap<Reg, u16>,
    /// Callee writes actually consumed after the call, from the backward
    /// pass.
    pub returns_used: RegSet,
}

impl CallOp {
    /// Builds a call instruction, applying configured register-indirect call
    /// idioms and capturing the callee's dependency set.
    #[must_use]
    pub fn new(
        store: &dyn CrossReferenceStore,
        overrides: &AnalysisOverrides,
        name: &'static str,
        target: Operand,
        cond: Cond,
        addr: Address,
    ) -> Self {
        // Known dispatch thunks take their real target in registers.
        let target = match target.value().and_then(|v| overrides.call_idioms.get(&v)) {
            Some(CallIdiom::Register(reg)) => Operand::Register(*reg),
            Some(CallIdiom::Long { bank, addr }) => Operand::ComputedAddr {
                bank: Box::new(Operand::Register(*bank)),
                addr: Box::new(Operand::Register(*addr)),
            },
            None => target,
        };

        let (target, target_addr) = match &target {
            Operand::Addr { addr: t, .. } => (Operand::addr(AddrKind::Proc, *t), *t),
            other => match other.value() {
                Some(v) => {
                    let t = Address::from_virtual_and_current(v, addr);
                    (Operand::addr(AddrKind::Proc, t), t)
                }
                // Unresolvable target: park on the ambiguous window base.
                None => (target.clone(), Address::from_virtual(0x4000)),
            },
        };

        let target_deps = store.get(target_addr).dependency_set;
        CallOp {
            name,
            target,
            target_addr,
            cond,
            addr,
            target_deps,
            constant_params: BTreeMap::new(),
            returns_used: RegSet::tracked(),
        }
    }

    /// Builds the stub tail-call used for out-of-range branch targets.
    #[must_use]
    pub fn tail(store: &dyn CrossReferenceStore, target: Address) -> Self {
        CallOp {
            name: "tail-call",
            target: Operand::addr(AddrKind::Proc, target),
            target_addr: target,
            cond: Cond::Always,
            addr: target,
            target_deps: store.get(target).dependency_set,
            constant_params: BTreeMap::new(),
            returns_used: RegSet::tracked(),
        }
    }

    /// The call's effective dependency set: the callee contract minus
    /// parameters proven constant at this site.
    #[must_use]
    pub fn dependency_set(&self) -> DependencySet {
        let mut reads = self.target_deps.reads;
        for reg in self.constant_params.keys() {
            reads -= reg.deps();
        }
        DependencySet::new(reads, self.target_deps.writes)
    }

    /// The `ins -> outs` summary rendered next to the call.
    #[must_use]
    pub fn signature(&self) -> String {
        let deps = self.dependency_set();
        let mut ins: Vec<String> = (deps.reads - RegSet::MEM).join_names();
        for (reg, value) in &self.constant_params {
            ins.push(format!("{reg}={}", Operand::Constant(*value)));
        }
        ins.sort();
        let outs = (self.returns_used - RegSet::MEM).join_names().join(", ");
        let mut out = String::new();
        if !self.cond.always_true() {
            out.push_str("CONDITIONAL");
        }
        if !ins.is_empty() {
            out.push_str(&format!(" @ ({})", ins.join(", ")));
        }
        out.push_str(" -> ");
        out.push_str(if outs.is_empty() { "void" } else { &outs });
        out
    }
}

/// A conditional or unconditional return.
#[derive(Debug, Clone)]
pub struct RetOp {
    /// `RET` or `RETI`.
    pub name: &'static str,
    /// Return condition.
    pub cond: Cond,
    /// Location of the opcode byte.
    pub addr: Address,
}

/// A jump-table dispatch (the call-to-zero idiom).
#[derive(Debug, Clone)]
pub struct SwitchOp {
    /// Location of the dispatch instruction.
    pub addr: Address,
    /// Location of the first table entry.
    pub table_addr: Address,
    /// Candidate targets read from the table, before length inference.
    pub targets: Vec<Address>,
}

impl SwitchOp {
    /// Reads the jump table behind the dispatch instruction, accepting
    /// entries while they land in mapped ROM.
    #[must_use]
    pub fn new(rom: &dyn ByteSource, addr: Address) -> Self {
        let table_addr = addr.offset(1);
        let mut targets = Vec::new();
        for i in 0..256 {
            let entry = table_addr.offset(i * 2);
            let Ok(word) = rom.get_word(entry) else {
                break;
            };
            let target = Address::from_virtual_and_current(word, table_addr);
            if !target.in_rom() {
                break;
            }
            targets.push(target);
        }
        SwitchOp {
            addr,
            table_addr,
            targets,
        }
    }

    /// The first `size` inferred targets.
    #[must_use]
    pub fn jumps_for_size(&self, size: usize) -> &[Address] {
        &self.targets[..size.min(self.targets.len())]
    }
}

/// An opcode no rule matches; decodes as a non-continuing instruction.
#[derive(Debug, Clone)]
pub struct BadOp {
    /// Location of the unmatched byte.
    pub addr: Address,
    /// The raw byte.
    pub byte: u8,
}

/// A decoded instruction.
#[derive(Debug, Clone)]
pub enum Instruction {
    /// Generic effect-described operation.
    Expression(ExpressionOp),
    /// Assignment.
    Load(LoadOp),
    /// Jump.
    Jump(JumpOp),
    /// Call or tail call.
    Call(CallOp),
    /// Return.
    Ret(RetOp),
    /// Jump-table dispatch.
    Switch(SwitchOp),
    /// Unmatched opcode byte.
    Bad(BadOp),
}

impl Instruction {
    /// Classifies a freshly decoded operation into its instruction kind.
    ///
    /// `JP` becomes a jump, `CALL` a call - except a call to constant zero,
    /// which is the jump-table dispatch idiom - `RET`/`RETI` a return and
    /// `LD`/`LD16` a load; everything else stays a generic expression op.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn from_decoded(
        rom: &dyn ByteSource,
        store: &dyn CrossReferenceStore,
        overrides: &AnalysisOverrides,
        name: &'static str,
        mut operands: Vec<Operand>,
        addr: Address,
        reads: RegSet,
        writes: RegSet,
        loads: Vec<(Operand, Operand)>,
    ) -> Instruction {
        let cond_of = |operands: &[Operand]| match operands.get(1) {
            Some(Operand::Condition(c)) => *c,
            _ => Cond::Always,
        };
        match (name, operands.len()) {
            ("JP", 1) => Instruction::Jump(JumpOp::resolve(
                name,
                operands.remove(0),
                Cond::Always,
                addr,
                reads,
                writes,
            )),
            ("JP", 2) => {
                let cond = cond_of(&operands);
                Instruction::Jump(JumpOp::resolve(
                    name,
                    operands.remove(0),
                    cond,
                    addr,
                    reads,
                    writes,
                ))
            }
            ("CALL", 1) => {
                if operands[0].value() == Some(0) {
                    return Instruction::Switch(SwitchOp::new(rom, addr));
                }
                Instruction::Call(CallOp::new(
                    store,
                    overrides,
                    name,
                    operands.remove(0),
                    Cond::Always,
                    addr,
                ))
            }
            ("CALL", 2) => {
                let cond = cond_of(&operands);
                Instruction::Call(CallOp::new(
                    store,
                    overrides,
                    name,
                    operands.remove(0),
                    cond,
                    addr,
                ))
            }
            ("RET" | "RETI", 0) => Instruction::Ret(RetOp {
                name,
                cond: Cond::Always,
                addr,
            }),
            ("RET" | "RETI", 1) => {
                let cond = match operands[0] {
                    Operand::Condition(c) => c,
                    _ => Cond::Always,
                };
                Instruction::Ret(RetOp { name, cond, addr })
            }
            ("LD" | "LD16", 2) => {
                let source = operands.pop().unwrap_or(Operand::Constant(0));
                let target = operands.pop().unwrap_or(Operand::Constant(0));
                Instruction::Load(LoadOp::new(name, target, source, addr))
            }
            _ => Instruction::Expression(ExpressionOp {
                name,
                operands,
                addr,
                reads,
                writes,
                loads,
            }),
        }
    }

    /// Builds a bad-opcode instruction for a byte no rule matches.
    #[must_use]
    pub fn bad(addr: Address, byte: u8) -> Instruction {
        Instruction::Bad(BadOp { addr, byte })
    }

    /// Display name of the operation.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::Expression(op) => op.name,
            Instruction::Load(op) => op.name,
            Instruction::Jump(op) => op.name,
            Instruction::Call(op) => op.name,
            Instruction::Ret(op) => op.name,
            Instruction::Switch(_) => "switch",
            Instruction::Bad(_) => "BAD-OP",
        }
    }

    /// Location of the opcode byte.
    #[must_use]
    pub fn addr(&self) -> Address {
        match self {
            Instruction::Expression(op) => op.addr,
            Instruction::Load(op) => op.addr,
            Instruction::Jump(op) => op.addr,
            Instruction::Call(op) => op.addr,
            Instruction::Ret(op) => op.addr,
            Instruction::Switch(op) => op.addr,
            Instruction::Bad(op) => op.addr,
        }
    }

    /// Whether execution can continue to the following byte.
    #[must_use]
    pub fn has_continue(&self) -> bool {
        match self {
            Instruction::Jump(op) => !op.cond.always_true(),
            Instruction::Ret(op) => !op.cond.always_true(),
            Instruction::Switch(_) | Instruction::Bad(_) => false,
            _ => true,
        }
    }

    /// Statically known, bank-resolved branch targets.
    #[must_use]
    pub fn jumps(&self) -> Vec<Address> {
        match self {
            Instruction::Jump(op) => op
                .target_addr
                .into_iter()
                .filter(|t| !t.is_ambiguous())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Branch targets including bank-ambiguous ones.
    #[must_use]
    pub fn all_jumps(&self) -> Vec<Address> {
        match self {
            Instruction::Jump(op) => op.target_addr.into_iter().collect(),
            _ => Vec::new(),
        }
    }

    /// The statically known callee, when the target resolves into ROM.
    #[must_use]
    pub fn calls(&self) -> Option<Address> {
        match self {
            Instruction::Call(op) if op.target_addr.in_rom() && !op.target_addr.is_ambiguous() => {
                Some(op.target_addr)
            }
            _ => None,
        }
    }

    /// The externally observable read/write contract.
    ///
    /// Returns, switches and bad opcodes are treated pessimistically: they
    /// end or escape the register model.
    #[must_use]
    pub fn dependency_set(&self) -> DependencySet {
        match self {
            Instruction::Expression(op) => DependencySet::new(op.reads, op.writes),
            Instruction::Load(op) => DependencySet::new(op.reads, op.writes),
            Instruction::Jump(op) => DependencySet::new(op.reads, op.writes),
            Instruction::Call(op) => op.dependency_set(),
            _ => DependencySet::unknown(),
        }
    }

    /// Threads the backward needed-set through this instruction.
    #[must_use]
    pub fn get_dependencies(&self, needed: RegSet) -> RegSet {
        match self {
            Instruction::Expression(op) => (needed - op.writes) | op.reads,
            Instruction::Load(op) => (needed - op.writes) | op.reads,
            Instruction::Jump(op) => (needed - op.writes) | op.reads,
            Instruction::Call(op) => {
                let deps = op.dependency_set();
                (needed - deps.writes) | deps.reads
            }
            // A return path or unknown control transfer may consume anything.
            _ => needed | RegSet::tracked(),
        }
    }

    /// Rewrites the instruction under the current value mapping and updates
    /// the mapping with its own writes.
    #[must_use]
    pub fn optimized(&self, ctx: &mut Context, overrides: &AnalysisOverrides) -> Instruction {
        match self {
            Instruction::Load(op) => {
                let source = op.source.optimized(ctx);
                let mut target = op.target.clone();
                if matches!(target, Operand::Dereference(_)) {
                    target = target.optimized(ctx);
                    // A store to the bank-switch port range is a bank
                    // selection; promote it to the tracked pseudo-register.
                    if let Operand::Dereference(inner) = &target {
                        if let Operand::Addr { addr, .. } = inner.as_ref() {
                            if (0x2000..0x4000).contains(&addr.virtual_offset()) {
                                target = Operand::Register(Reg::RomBank);
                            }
                        }
                    }
                    if matches!(target, Operand::Dereference(_)) {
                        ctx.invalidate_mem();
                    }
                }
                if let Operand::Register(reg) = &target {
                    ctx.set(*reg, source.clone());
                }
                Instruction::Load(LoadOp::new(op.name, target, source, op.addr))
            }
            Instruction::Expression(op) => {
                let mut covered = RegSet::empty();
                for (target, value) in &op.loads {
                    let value = value.optimized(ctx);
                    if let Operand::Register(reg) = target {
                        ctx.set(*reg, value);
                        covered |= reg.deps();
                    }
                }
                for reg in (op.writes - covered).iter_regs() {
                    ctx.set_complex(reg);
                }
                if op.writes.contains(RegSet::MEM) {
                    ctx.invalidate_mem();
                }
                self.clone()
            }
            Instruction::Jump(op) => Instruction::Jump(JumpOp::resolve(
                op.name,
                op.target.optimized(ctx),
                op.cond,
                op.addr,
                op.reads,
                op.writes,
            )),
            Instruction::Call(op) => {
                let mut new = op.clone();
                new.target = op.target.optimized(ctx);
                match &new.target {
                    Operand::Addr { addr, .. } => new.target_addr = *addr,
                    other => {
                        if let Some(v) = other.value() {
                            let t = Address::from_virtual_and_current(v, op.addr);
                            new.target = Operand::addr(AddrKind::Proc, t);
                            new.target_addr = t;
                        }
                    }
                }
                let deps = new.dependency_set();
                for reg in (deps.reads - RegSet::MEM).join_regs() {
                    if let Some(value) = ctx.constant_of(reg) {
                        new.constant_params.insert(reg, value);
                    }
                }
                for reg in deps.writes.iter_regs() {
                    ctx.set_complex(reg);
                }
                if deps.writes.contains(RegSet::MEM) {
                    ctx.invalidate_mem();
                }
                // A call into the bank-switch helper with a constant
                // accumulator selects that bank.
                if let Some(helper) = overrides.bank_switch_proc {
                    if new.target_addr.virtual_offset() == helper {
                        if let Some(bank) = new.constant_params.get(&Reg::A) {
                            ctx.set(Reg::RomBank, Operand::Constant(*bank));
                        }
                    }
                }
                Instruction::Call(new)
            }
            Instruction::Ret(_) | Instruction::Switch(_) => self.clone(),
            Instruction::Bad(_) => {
                ctx.invalidate_all();
                self.clone()
            }
        }
    }

    /// Dead-write elimination step: drops the instruction when nothing it
    /// writes is needed later and the write has no memory or side effect.
    #[must_use]
    pub fn optimize_dependencies(&self, needed: RegSet) -> Option<Instruction> {
        let prunable = |writes: RegSet| {
            !writes.intersects(needed)
                && !writes.contains(RegSet::SIDE_EFFECTS)
                && !writes.contains(RegSet::MEM)
        };
        match self {
            Instruction::Expression(op) if prunable(op.writes) => None,
            Instruction::Load(op) if prunable(op.writes) => None,
            Instruction::Call(op) => {
                let mut new = op.clone();
                new.returns_used = needed & op.dependency_set().writes;
                Some(Instruction::Call(new))
            }
            _ => Some(self.clone()),
        }
    }

    /// Decomposes a compound expression op into simple per-location loads.
    ///
    /// Writes with a known value become explicit assignments; remaining
    /// register writes become assignments of an opaque value carrying the
    /// op's read set. Side-effecting operations stay whole.
    #[must_use]
    pub fn split_to_simple(self) -> Vec<Instruction> {
        let Instruction::Expression(op) = &self else {
            return vec![self];
        };
        if op.writes.contains(RegSet::SIDE_EFFECTS) {
            return vec![self];
        }

        let mut leftover = op.writes - RegSet::MEM;
        let mut out = Vec::new();
        for (target, value) in &op.loads {
            leftover -= target.dependencies();
            out.push(Instruction::Load(LoadOp::new(
                op.name,
                target.clone(),
                value.clone(),
                op.addr,
            )));
        }
        for reg in leftover.iter_regs() {
            out.push(Instruction::Load(LoadOp::new(
                op.name,
                Operand::Register(reg),
                Operand::Complex {
                    hint: op.name,
                    deps: op.reads,
                },
                op.addr,
            )));
        }
        out
    }

    /// Collects the concrete memory addresses this instruction reads.
    pub fn mem_reads_into(&self, out: &mut BTreeSet<Address>) {
        match self {
            Instruction::Load(op) => {
                op.source.mem_reads_into(out);
                if let Operand::Dereference(inner) = &op.target {
                    inner.mem_reads_into(out);
                }
            }
            Instruction::Expression(op) if !op.writes.contains(RegSet::SIDE_EFFECTS) => {
                for sub in self.clone().split_to_simple() {
                    sub.mem_reads_into(out);
                }
            }
            _ => {}
        }
    }

    /// Collects the concrete memory addresses this instruction writes.
    pub fn mem_writes_into(&self, out: &mut BTreeSet<Address>) {
        match self {
            Instruction::Load(op) => {
                if let Operand::Dereference(inner) = &op.target {
                    if let Operand::Addr { addr, .. } = inner.as_ref() {
                        out.insert(*addr);
                    }
                }
            }
            Instruction::Expression(op) if !op.writes.contains(RegSet::SIDE_EFFECTS) => {
                for sub in self.clone().split_to_simple() {
                    sub.mem_writes_into(out);
                }
            }
            _ => {}
        }
    }

    /// Serializes the instruction through a renderer.
    pub fn render(&self, r: &mut dyn Renderer) {
        match self {
            Instruction::Load(op) => {
                r.line(op.addr);
                op.target.render(r);
                r.raw(" = ");
                op.source.render(r);
            }
            Instruction::Expression(op) => {
                r.line(op.addr);
                r.tagged(op.name, TextClass::OpName);
                r.raw("    ");
                render_list(r, &op.operands);
            }
            Instruction::Jump(op) => {
                r.line(op.addr);
                r.tagged(op.name, TextClass::OpName);
                r.raw("    ");
                op.target.render(r);
                if !op.cond.always_true() {
                    r.raw(", ");
                    r.tagged(&op.cond.to_string(), TextClass::Register);
                }
            }
            Instruction::Call(op) => {
                r.line(op.addr);
                r.tagged(op.name, TextClass::OpName);
                r.raw("    ");
                op.target.render(r);
                if !op.cond.always_true() {
                    r.raw(", ");
                    r.tagged(&op.cond.to_string(), TextClass::Register);
                }
                r.tagged(&op.signature(), TextClass::Signature);
            }
            Instruction::Ret(op) => {
                r.line(op.addr);
                r.tagged(op.name, TextClass::OpName);
                if !op.cond.always_true() {
                    r.raw("    ");
                    r.tagged(&op.cond.to_string(), TextClass::Register);
                }
            }
            Instruction::Switch(op) => {
                r.line(op.addr);
                r.tagged("switch", TextClass::OpName);
                r.raw("    ");
                r.tagged("A", TextClass::Register);
                r.raw(", ");
                r.address_ref(AddrKind::JumpTable, op.table_addr);
            }
            Instruction::Bad(op) => {
                r.line(op.addr);
                r.tagged("BAD-OP", TextClass::OpName);
            }
        }
    }
}
