//! Structured statements and the two dataflow passes.
//!
//! The structurer emits a tree of [`Statement`] nodes; two independent,
//! idempotent passes then rewrite it:
//!
//! - the **forward pass** ([`Block::optimized`]) threads a
//!   [`Context`] through the tree, substituting known register values into
//!   operands and folding them;
//! - the **backward pass** ([`Block::optimize_dependencies`]) threads a
//!   needed-location set back-to-front and drops writes nothing consumes.
//!
//! Both passes produce new trees; statements are never mutated in place.
//!
//! Non-local control (`Goto`/`Break`/`Continue`) references labels by id.
//! All label bookkeeping - referrer counts, the needed-set and write-set a
//! label's environment observes - lives in the [`LabelTable`] side
//! structure, rebuilt once after tree construction.

use crate::address::Address;
use crate::context::Context;
use crate::depend::DependencySet;
use crate::instruction::Instruction;
use crate::operand::{AddrKind, BinaryOp, Operand};
use crate::registers::RegSet;
use crate::render::{Renderer, TextClass};
use crate::session::AnalysisOverrides;

/// Index of a label in the [`LabelTable`].
pub type LabelId = usize;

/// Bookkeeping for one label.
#[derive(Debug, Clone)]
pub struct LabelInfo {
    /// The block-start address the label names.
    pub addr: Address,
    /// Locations needed by whoever jumps here, as recorded by the backward
    /// pass; conservatively everything-but-flags until recorded.
    pub needed: RegSet,
    /// Locations written by the construct guarding this label, as recorded
    /// by the forward pass; conservatively almost everything until
    /// recorded.
    pub writes: RegSet,
    /// Number of `Goto` statements targeting this label.
    pub gotos: usize,
    /// Number of `Break` statements targeting this label.
    pub breaks: usize,
    /// Number of `Continue` statements (and owning loops) targeting this
    /// label.
    pub continues: usize,
}

impl LabelInfo {
    fn new(addr: Address) -> Self {
        LabelInfo {
            addr,
            needed: RegSet::tracked() - RegSet::FLAGS,
            writes: DependencySet::unknown().writes,
            gotos: 0,
            breaks: 0,
            continues: 0,
        }
    }

    /// Total non-local references to this label.
    #[must_use]
    pub fn referrers(&self) -> usize {
        self.gotos + self.breaks + self.continues
    }
}

/// Side table of all labels in one procedure's tree.
#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    infos: Vec<LabelInfo>,
}

impl LabelTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        LabelTable::default()
    }

    /// Allocates a new label for `addr`.
    pub fn create(&mut self, addr: Address) -> LabelId {
        self.infos.push(LabelInfo::new(addr));
        self.infos.len() - 1
    }

    /// The bookkeeping entry for `id`.
    #[must_use]
    pub fn info(&self, id: LabelId) -> &LabelInfo {
        &self.infos[id]
    }

    fn info_mut(&mut self, id: LabelId) -> &mut LabelInfo {
        &mut self.infos[id]
    }

    /// Number of labels allocated.
    #[must_use]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether any labels exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Recounts referrers from the finished tree. Loops register a continue
    /// on their own header label, matching explicit `Continue` statements.
    pub fn rebuild_referrers(&mut self, body: &Block) {
        for info in &mut self.infos {
            info.gotos = 0;
            info.breaks = 0;
            info.continues = 0;
        }
        body.visit(&mut |statement| match statement {
            Statement::Goto(id) => self.infos[*id].gotos += 1,
            Statement::Break(id) => self.infos[*id].breaks += 1,
            Statement::Continue(id)
            | Statement::While { label: id, .. }
            | Statement::DoWhile { label: id, .. } => self.infos[*id].continues += 1,
            _ => {}
        });
    }

    fn label_signature(&self, id: LabelId) -> String {
        let names = (self.infos[id].needed - RegSet::MEM).join_names();
        format!(" @ {}", names.join(", "))
    }
}

/// One node of the structured tree.
#[derive(Debug, Clone)]
pub enum Statement {
    /// A primitive instruction.
    Instr(Instruction),
    /// Two-way branch. A missing branch renders as an asymmetric `if`.
    If {
        /// Address of the branch instruction.
        addr: Address,
        /// Condition for the then branch.
        cond: Operand,
        /// Taken when the condition holds.
        then_branch: Option<Block>,
        /// Taken otherwise.
        else_branch: Option<Block>,
    },
    /// Jump-table dispatch over consecutive case values.
    Switch {
        /// Address of the dispatch instruction.
        addr: Address,
        /// The scrutinee.
        arg: Operand,
        /// Case value of the first branch.
        base: u16,
        /// One body per table slot.
        branches: Vec<Block>,
    },
    /// Infinite loop; exits happen via `Break` or non-local control.
    While {
        /// Loop body.
        body: Block,
        /// Header label, target of the loop's continues.
        label: LabelId,
    },
    /// Post-tested loop.
    DoWhile {
        /// Loop body.
        body: Block,
        /// Loop-again condition, tested after the body.
        cond: Operand,
        /// Header label, target of the loop's continues.
        label: LabelId,
    },
    /// Label definition.
    Label(LabelId),
    /// Unstructured transfer to a label.
    Goto(LabelId),
    /// Exit from the enclosing construct tracked by `LabelId`.
    Break(LabelId),
    /// Back to the loop header tracked by `LabelId`.
    Continue(LabelId),
    /// Procedure return.
    Return,
}

/// A statement sequence.
#[derive(Debug, Clone, Default)]
pub struct Block {
    /// The statements, in execution order.
    pub contents: Vec<Statement>,
}

impl Block {
    /// Builds a block, decomposing compound instructions into simple loads.
    #[must_use]
    pub fn new(statements: Vec<Statement>) -> Self {
        let mut contents = Vec::with_capacity(statements.len());
        for statement in statements {
            match statement {
                Statement::Instr(instruction) => {
                    contents.extend(instruction.split_to_simple().into_iter().map(Statement::Instr));
                }
                other => contents.push(other),
            }
        }
        Block { contents }
    }

    /// Whether the block has no statements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// Whether execution can fall out of the end of this block.
    #[must_use]
    pub fn has_continue(&self) -> bool {
        self.contents.last().map_or(true, Statement::has_continue)
    }

    /// Heuristic code size used by the branch-ordering rules.
    #[must_use]
    pub fn complexity(&self) -> usize {
        self.contents
            .iter()
            .map(|s| 1 + s.extra_complexity())
            .sum()
    }

    /// Runs the forward value propagation pass over the block.
    #[must_use]
    pub fn optimized(
        &self,
        ctx: &mut Context,
        labels: &mut LabelTable,
        overrides: &AnalysisOverrides,
    ) -> Block {
        Block {
            contents: self
                .contents
                .iter()
                .map(|s| s.optimized(ctx, labels, overrides))
                .collect(),
        }
    }

    /// Threads the backward needed-set through the block.
    #[must_use]
    pub fn dependencies(&self, mut needed: RegSet, labels: &LabelTable) -> RegSet {
        for statement in self.contents.iter().rev() {
            needed = statement.dependencies(needed, labels);
        }
        needed
    }

    /// The block's combined dependency set, by sequential join back to
    /// front.
    #[must_use]
    pub fn dependency_set(&self, labels: &LabelTable) -> DependencySet {
        let mut current = DependencySet::default();
        for statement in self.contents.iter().rev() {
            current = DependencySet::join(statement.dependency_set(labels), current);
        }
        current
    }

    /// Runs the backward dead-write elimination pass over the block.
    #[must_use]
    pub fn optimize_dependencies(&self, mut needed: RegSet, labels: &mut LabelTable) -> Block {
        let mut kept = Vec::new();
        for statement in self.contents.iter().rev() {
            if let Some(statement) = statement.optimize_dependencies(needed, labels) {
                needed = statement.dependencies(needed, labels);
                kept.push(statement);
            }
        }
        kept.reverse();
        Block { contents: kept }
    }

    /// Visits every statement in the tree, depth first.
    pub fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Statement)) {
        for statement in &self.contents {
            statement.visit(f);
        }
    }

    /// Serializes the block through a renderer.
    pub fn render(&self, r: &mut dyn Renderer, labels: &LabelTable) {
        for statement in &self.contents {
            statement.render(r, labels);
        }
    }
}

impl Statement {
    /// Whether execution can continue past this statement.
    #[must_use]
    pub fn has_continue(&self) -> bool {
        match self {
            Statement::Instr(i) => i.has_continue(),
            Statement::If {
                then_branch,
                else_branch,
                ..
            } => match (then_branch, else_branch) {
                (Some(a), Some(b)) => a.has_continue() || b.has_continue(),
                _ => true,
            },
            Statement::While { .. } => false,
            Statement::Goto(_) | Statement::Break(_) | Statement::Continue(_) => false,
            Statement::Return => false,
            _ => true,
        }
    }

    fn extra_complexity(&self) -> usize {
        match self {
            Statement::While { body, .. } | Statement::DoWhile { body, .. } => {
                4 + body.complexity()
            }
            _ => 0,
        }
    }

    /// Forward value propagation for one statement.
    #[must_use]
    pub fn optimized(
        &self,
        ctx: &mut Context,
        labels: &mut LabelTable,
        overrides: &AnalysisOverrides,
    ) -> Statement {
        match self {
            Statement::Instr(instruction) => {
                Statement::Instr(instruction.optimized(ctx, overrides))
            }
            Statement::If {
                addr,
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = cond.optimized(ctx);
                let mut then_ctx = ctx.clone();
                let then_branch = then_branch
                    .as_ref()
                    .map(|b| b.optimized(&mut then_ctx, labels, overrides));
                let mut else_ctx = ctx.clone();
                let else_branch = else_branch
                    .as_ref()
                    .map(|b| b.optimized(&mut else_ctx, labels, overrides));
                // Merge point: keep only bindings both arms agree on.
                *ctx = Context::merged(&then_ctx, &else_ctx);
                Statement::If {
                    addr: *addr,
                    cond,
                    then_branch,
                    else_branch,
                }
            }
            Statement::Switch {
                addr,
                arg,
                base,
                branches,
            } => {
                let mut arg = arg.optimized(ctx);
                let mut base = *base;
                // A biased scrutinee folds into the case values.
                if let Operand::Binary {
                    op: BinaryOp::Sub,
                    left,
                    right,
                } = &arg
                {
                    if let Some(v) = right.value() {
                        base = base.wrapping_add(v);
                        arg = (**left).clone();
                    }
                }
                let new_branches: Vec<Block> = branches
                    .iter()
                    .map(|b| b.optimized(&mut ctx.clone(), labels, overrides))
                    .collect();
                for branch in branches {
                    let writes = branch.dependency_set(labels).writes;
                    for reg in writes.iter_regs() {
                        ctx.set_complex(reg);
                    }
                    if writes.contains(RegSet::MEM) {
                        ctx.invalidate_mem();
                    }
                }
                Statement::Switch {
                    addr: *addr,
                    arg,
                    base,
                    branches: new_branches,
                }
            }
            Statement::While { body, label } => {
                // Single conservative pass: nothing survives a back-edge.
                ctx.invalidate_all();
                let mut body_ctx = Context::new();
                let body = body.optimized(&mut body_ctx, labels, overrides);
                Statement::While {
                    body,
                    label: *label,
                }
            }
            Statement::DoWhile { body, cond, label } => {
                let writes = self.dependency_set(labels).writes;
                labels.info_mut(*label).writes = writes;
                let body = body.optimized(ctx, labels, overrides);
                let cond = cond.optimized(ctx);
                Statement::DoWhile {
                    body,
                    cond,
                    label: *label,
                }
            }
            Statement::Label(id) => {
                if labels.info(*id).referrers() > 0 {
                    let writes = labels.info(*id).writes;
                    for reg in writes.iter_regs() {
                        ctx.set_complex(reg);
                    }
                    if writes.contains(RegSet::MEM) {
                        ctx.invalidate_mem();
                    }
                }
                self.clone()
            }
            Statement::Goto(_) | Statement::Break(_) | Statement::Continue(_)
            | Statement::Return => {
                // Whatever follows in the sequence is reached from
                // elsewhere; its context starts unknown.
                ctx.invalidate_all();
                self.clone()
            }
        }
    }

    /// Threads the backward needed-set through one statement.
    #[must_use]
    pub fn dependencies(&self, needed: RegSet, labels: &LabelTable) -> RegSet {
        match self {
            Statement::Instr(i) => i.get_dependencies(needed),
            Statement::If {
                cond,
                then_branch,
                else_branch,
                ..
            } => {
                let then_needs = then_branch
                    .as_ref()
                    .map_or(needed, |b| b.dependencies(needed, labels));
                let else_needs = else_branch
                    .as_ref()
                    .map_or(needed, |b| b.dependencies(needed, labels));
                then_needs | else_needs | cond.dependencies()
            }
            Statement::Switch { arg, branches, .. } => branches
                .iter()
                .fold(arg.dependencies(), |acc, b| {
                    acc | b.dependencies(needed, labels)
                }),
            Statement::While { body, .. } => {
                let pass1 = body.dependencies(needed, labels);
                let pass2 = body.dependencies(pass1, labels);
                debug_assert_eq!(body.dependencies(pass2, labels), pass2);
                pass2
            }
            Statement::DoWhile { body, cond, .. } => {
                let pass1 = body.dependencies(needed | cond.dependencies(), labels);
                let pass2 = body.dependencies(pass1, labels);
                debug_assert_eq!(body.dependencies(pass2, labels), pass2);
                pass2
            }
            Statement::Goto(id) | Statement::Break(id) | Statement::Continue(id) => {
                labels.info(*id).needed
            }
            Statement::Label(_) | Statement::Return => needed,
        }
    }

    /// The statement's combined dependency set.
    #[must_use]
    pub fn dependency_set(&self, labels: &LabelTable) -> DependencySet {
        match self {
            Statement::Instr(i) => i.dependency_set(),
            Statement::If {
                cond,
                then_branch,
                else_branch,
                ..
            } => {
                let mut deps = DependencySet::default();
                if let Some(b) = then_branch {
                    deps = DependencySet::parallel(b.dependency_set(labels), deps);
                }
                if let Some(b) = else_branch {
                    deps = DependencySet::parallel(b.dependency_set(labels), deps);
                }
                DependencySet::join(
                    DependencySet::new(cond.dependencies(), RegSet::empty()),
                    deps,
                )
            }
            Statement::Switch { arg, branches, .. } => {
                let mut deps = DependencySet::default();
                for branch in branches {
                    deps = DependencySet::parallel(branch.dependency_set(labels), deps);
                }
                DependencySet::new(deps.reads | arg.dependencies(), deps.writes)
            }
            Statement::While { body, .. } => body.dependency_set(labels),
            Statement::DoWhile { body, cond, .. } => DependencySet::join(
                body.dependency_set(labels),
                DependencySet::new(cond.dependencies(), RegSet::empty()),
            ),
            Statement::Goto(id) | Statement::Break(id) | Statement::Continue(id) => {
                DependencySet::new(labels.info(*id).needed, RegSet::empty())
            }
            Statement::Label(_) | Statement::Return => DependencySet::default(),
        }
    }

    /// Backward dead-write elimination for one statement. `None` drops the
    /// statement entirely.
    #[must_use]
    pub fn optimize_dependencies(
        &self,
        needed: RegSet,
        labels: &mut LabelTable,
    ) -> Option<Statement> {
        match self {
            Statement::Instr(i) => i.optimize_dependencies(needed).map(Statement::Instr),
            Statement::If {
                addr,
                cond,
                then_branch,
                else_branch,
            } => {
                let prune = |branch: &Option<Block>, labels: &mut LabelTable| {
                    branch
                        .as_ref()
                        .map(|b| b.optimize_dependencies(needed, labels))
                        .filter(|b| !b.is_empty())
                };
                let then_branch = prune(then_branch, labels);
                let else_branch = prune(else_branch, labels);
                Some(Statement::If {
                    addr: *addr,
                    cond: cond.clone(),
                    then_branch,
                    else_branch,
                })
            }
            Statement::Switch {
                addr,
                arg,
                base,
                branches,
            } => Some(Statement::Switch {
                addr: *addr,
                arg: arg.clone(),
                base: *base,
                branches: branches
                    .iter()
                    .map(|b| b.optimize_dependencies(needed, labels))
                    .collect(),
            }),
            Statement::While { body, label } => {
                let loop_needs = self.dependencies(needed, labels);
                if labels.info(*label).referrers() > 0 {
                    labels.info_mut(*label).needed = loop_needs;
                }
                let body = body.optimize_dependencies(needed | loop_needs, labels);
                Some(Statement::While {
                    body,
                    label: *label,
                })
            }
            Statement::DoWhile { body, cond, label } => {
                let loop_needs = self.dependencies(needed, labels);
                if labels.info(*label).referrers() > 0 {
                    labels.info_mut(*label).needed = loop_needs;
                }
                let body =
                    body.optimize_dependencies(needed | cond.dependencies() | loop_needs, labels);
                Some(Statement::DoWhile {
                    body,
                    cond: cond.clone(),
                    label: *label,
                })
            }
            Statement::Label(id) => {
                if labels.info(*id).referrers() > 0 {
                    labels.info_mut(*id).needed = needed;
                    Some(self.clone())
                } else {
                    None
                }
            }
            Statement::Goto(_) | Statement::Break(_) | Statement::Continue(_)
            | Statement::Return => Some(self.clone()),
        }
    }

    /// Visits this statement and all nested statements, depth first.
    pub fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Statement)) {
        f(self);
        match self {
            Statement::If {
                then_branch,
                else_branch,
                ..
            } => {
                if let Some(b) = then_branch {
                    b.visit(f);
                }
                if let Some(b) = else_branch {
                    b.visit(f);
                }
            }
            Statement::Switch { branches, .. } => {
                for branch in branches {
                    branch.visit(f);
                }
            }
            Statement::While { body, .. } | Statement::DoWhile { body, .. } => body.visit(f),
            _ => {}
        }
    }

    /// Serializes one statement through a renderer.
    pub fn render(&self, r: &mut dyn Renderer, labels: &LabelTable) {
        match self {
            Statement::Instr(i) => i.render(r),
            Statement::If {
                addr,
                cond,
                then_branch,
                else_branch,
            } => {
                r.line(*addr);
                r.tagged("if", TextClass::Keyword);
                r.raw(" (");
                cond.render(r);
                r.raw(") {");
                if let Some(then_branch) = then_branch {
                    r.indent();
                    then_branch.render(r, labels);
                    r.outdent();
                } else if else_branch.is_none() {
                    r.line(*addr);
                    r.tagged("WARN: empty if", TextClass::OpName);
                }
                if let (Some(_), Some(else_branch)) = (then_branch, else_branch) {
                    r.line(*addr);
                    r.raw("} ");
                    r.tagged("else", TextClass::Keyword);
                    r.raw(" {");
                    r.indent();
                    else_branch.render(r, labels);
                    r.outdent();
                }
                r.line(*addr);
                r.raw("}");
            }
            Statement::Switch {
                addr,
                arg,
                base,
                branches,
            } => {
                r.line(*addr);
                r.tagged("switch", TextClass::Keyword);
                r.raw(" (");
                arg.render(r);
                r.raw(", ");
                r.address_ref(AddrKind::JumpTable, addr.offset(1));
                r.raw(") {");
                for (i, branch) in branches.iter().enumerate() {
                    r.line(*addr);
                    r.tagged("case", TextClass::Keyword);
                    r.raw(" ");
                    Operand::Constant(base.wrapping_add(i as u16)).render(r);
                    r.raw(":");
                    r.indent();
                    branch.render(r, labels);
                    r.outdent();
                }
                r.line(*addr);
                r.raw("}");
            }
            Statement::While { body, .. } => {
                r.line(Address::from_virtual(0));
                r.tagged("while (1) {", TextClass::Keyword);
                r.tagged(&loop_signature(body, None, labels), TextClass::Signature);
                r.indent();
                body.render(r, labels);
                r.outdent();
                r.line(Address::from_virtual(0));
                r.raw("}");
            }
            Statement::DoWhile { body, cond, .. } => {
                r.line(Address::from_virtual(0));
                r.tagged("do {", TextClass::Keyword);
                r.tagged(
                    &loop_signature(body, Some(cond), labels),
                    TextClass::Signature,
                );
                r.indent();
                body.render(r, labels);
                r.outdent();
                r.line(Address::from_virtual(0));
                r.tagged("} while (", TextClass::Keyword);
                cond.render(r);
                r.raw(")");
            }
            Statement::Label(id) => {
                if labels.info(*id).gotos > 0 {
                    r.label_line(labels.info(*id).addr, &labels.label_signature(*id));
                }
            }
            Statement::Goto(id) => {
                r.line(Address::from_virtual(0));
                r.tagged("goto", TextClass::Keyword);
                r.raw(" ");
                r.address_ref(AddrKind::Label, labels.info(*id).addr);
                r.tagged(&labels.label_signature(*id), TextClass::Signature);
            }
            Statement::Break(id) => {
                r.line(Address::from_virtual(0));
                r.tagged("break", TextClass::Keyword);
                r.tagged(&labels.label_signature(*id), TextClass::Signature);
            }
            Statement::Continue(id) => {
                r.line(Address::from_virtual(0));
                r.tagged("continue", TextClass::Keyword);
                r.tagged(&labels.label_signature(*id), TextClass::Signature);
            }
            Statement::Return => {
                r.line(Address::from_virtual(0));
                r.tagged("return", TextClass::Keyword);
            }
        }
    }
}

/// The `loopvars` annotation: locations both written by the body and
/// carried around the back edge.
fn loop_signature(body: &Block, cond: Option<&Operand>, labels: &LabelTable) -> String {
    let deps = body.dependency_set(labels);
    let mut reads = deps.reads;
    if let Some(cond) = cond {
        reads |= cond.dependencies();
    }
    let loopvars = (deps.writes & reads) - RegSet::MEM;
    format!(" @ loopvars: {}", loopvars.join_names().join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::LoadOp;
    use crate::registers::Reg;

    fn load(target: Reg, source: Operand) -> Statement {
        Statement::Instr(Instruction::Load(LoadOp::new(
            "LD",
            Operand::Register(target),
            source,
            Address::from_virtual(0),
        )))
    }

    fn ret() -> Statement {
        Statement::Return
    }

    #[test]
    fn forward_pass_folds_and_updates() {
        let block = Block::new(vec![
            load(Reg::A, Operand::Constant(1)),
            load(Reg::B, Operand::Register(Reg::A)),
            ret(),
        ]);
        let mut labels = LabelTable::new();
        let overrides = AnalysisOverrides::default();
        let optimized = block.optimized(&mut Context::new(), &mut labels, &overrides);
        match &optimized.contents[1] {
            Statement::Instr(Instruction::Load(op)) => {
                assert_eq!(op.source, Operand::Constant(1));
            }
            other => panic!("expected load, got {other:?}"),
        }
    }

    #[test]
    fn backward_pass_prunes_dead_first_load() {
        // After forward propagation B no longer reads A, so with only B
        // needed the first load is dead.
        let block = Block::new(vec![
            load(Reg::A, Operand::Constant(1)),
            load(Reg::B, Operand::Constant(1)),
        ]);
        let mut labels = LabelTable::new();
        let pruned = block.optimize_dependencies(RegSet::B, &mut labels);
        assert_eq!(pruned.contents.len(), 1);
        match &pruned.contents[0] {
            Statement::Instr(Instruction::Load(op)) => {
                assert_eq!(op.target, Operand::Register(Reg::B));
            }
            other => panic!("expected load of B, got {other:?}"),
        }
    }

    #[test]
    fn pruning_preserves_block_reads() {
        let block = Block::new(vec![
            load(Reg::A, Operand::Constant(1)),
            load(Reg::B, Operand::Register(Reg::C)),
        ]);
        let labels = LabelTable::new();
        let before = block.dependency_set(&labels).reads;
        let mut labels2 = labels.clone();
        let pruned = block.optimize_dependencies(RegSet::B, &mut labels2);
        let after = pruned.dependency_set(&labels2).reads;
        assert_eq!(before, after);
    }

    #[test]
    fn if_merges_conservatively() {
        // if (..) { A = 1 } else { A = 2 }; then A must be unknown,
        // but B set identically in both arms survives.
        let stmt = Statement::If {
            addr: Address::from_virtual(0),
            cond: Operand::Condition(crate::registers::Cond::Fz),
            then_branch: Some(Block::new(vec![
                load(Reg::A, Operand::Constant(1)),
                load(Reg::B, Operand::Constant(7)),
            ])),
            else_branch: Some(Block::new(vec![
                load(Reg::A, Operand::Constant(2)),
                load(Reg::B, Operand::Constant(7)),
            ])),
        };
        let mut ctx = Context::new();
        let mut labels = LabelTable::new();
        let overrides = AnalysisOverrides::default();
        let _ = stmt.optimized(&mut ctx, &mut labels, &overrides);
        assert!(!ctx.has_value(Reg::A));
        assert_eq!(ctx.constant_of(Reg::B), Some(7));
    }

    #[test]
    fn if_needs_both_arms_and_condition() {
        let stmt = Statement::If {
            addr: Address::from_virtual(0),
            cond: Operand::Condition(crate::registers::Cond::Fz),
            then_branch: Some(Block::new(vec![load(Reg::A, Operand::Register(Reg::B))])),
            else_branch: None,
        };
        let labels = LabelTable::new();
        let needed = stmt.dependencies(RegSet::A, &labels);
        // Through the then-arm A is produced from B; through the missing
        // arm A flows unchanged; the condition adds FZ.
        assert_eq!(needed, RegSet::A | RegSet::B | RegSet::FZ);
    }

    #[test]
    fn goto_reads_label_needs() {
        let mut labels = LabelTable::new();
        let id = labels.create(Address::from_virtual(0x0200));
        let goto = Statement::Goto(id);
        // Until recorded, a label conservatively needs everything but
        // flags.
        assert_eq!(
            goto.dependencies(RegSet::empty(), &labels),
            RegSet::tracked() - RegSet::FLAGS
        );

        // The backward pass records the actual needs at the label.
        let label_stmt = Statement::Label(id);
        labels.info_mut(id).gotos = 1;
        let _ = label_stmt.optimize_dependencies(RegSet::A, &mut labels);
        assert_eq!(goto.dependencies(RegSet::empty(), &labels), RegSet::A);
    }

    #[test]
    fn while_invalidates_context() {
        let mut ctx = Context::new();
        ctx.set(Reg::A, Operand::Constant(1));
        let mut labels = LabelTable::new();
        let id = labels.create(Address::from_virtual(0));
        let stmt = Statement::While {
            body: Block::new(vec![load(Reg::B, Operand::Register(Reg::A))]),
            label: id,
        };
        let overrides = AnalysisOverrides::default();
        let optimized = stmt.optimized(&mut ctx, &mut labels, &overrides);
        assert!(!ctx.has_value(Reg::A));
        // Inside the body A was unknown, so the load's source stays A.
        match optimized {
            Statement::While { body, .. } => match &body.contents[0] {
                Statement::Instr(Instruction::Load(op)) => {
                    assert_eq!(op.source, Operand::Register(Reg::A));
                }
                other => panic!("expected load, got {other:?}"),
            },
            other => panic!("expected while, got {other:?}"),
        }
    }

    #[test]
    fn do_while_needs_converge() {
        let mut labels = LabelTable::new();
        let id = labels.create(Address::from_virtual(0));
        // do { A = A - 1 } while (FNZ)
        let stmt = Statement::DoWhile {
            body: Block::new(vec![load(
                Reg::A,
                Operand::Binary {
                    op: BinaryOp::Sub,
                    left: Box::new(Operand::Register(Reg::A)),
                    right: Box::new(Operand::Constant(1)),
                },
            )]),
            cond: Operand::Condition(crate::registers::Cond::Fnz),
            label: id,
        };
        let needed = stmt.dependencies(RegSet::empty(), &labels);
        assert!(needed.contains(RegSet::A | RegSet::FZ));
    }

    #[test]
    fn unreferenced_labels_are_dropped() {
        let mut labels = LabelTable::new();
        let id = labels.create(Address::from_virtual(0x0200));
        let block = Block::new(vec![Statement::Label(id), ret()]);
        labels.rebuild_referrers(&block);
        let pruned = block.optimize_dependencies(RegSet::empty(), &mut labels);
        assert!(matches!(pruned.contents.as_slice(), [Statement::Return]));
    }
}
