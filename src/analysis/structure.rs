//! Graph-to-structured-code conversion.
//!
//! The structurer turns a rooted directed graph of basic blocks into an
//! equivalent tree of nested statements. It recurses over a shrinking
//! universe of unassigned vertices with a current vertex:
//!
//! 1. A vertex outside the universe emits a terminator: nothing when it is
//!    the expected continuation, `Break`/`Continue` when it is a tracked
//!    loop boundary, `Return` for the sink, `Goto` otherwise.
//! 2. Entering an unconsumed cycle carves it into a loop: the cycle body is
//!    structured with the header as entry and continue target, one chosen
//!    exit as break target, and everything reachable only through the exit
//!    processed afterwards as a cascade.
//! 3. A multi-way vertex becomes an `If` (or `Switch`): its merge points
//!    are structured first as cascades, then each branch runs toward the
//!    nearest one.
//! 4. `while { ...; if (c) break; }` canonicalizes to `do { ... } while
//!    (!c)`.
//!
//! The algorithm is total: irreducible control flow falls back to
//! `Goto`/`Label` pairs, never an error. Where several merge or exit
//! candidates qualify, the lowest block id wins and the result is flagged
//! ambiguous so the procedure can be reviewed; ordering is deterministic
//! throughout.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::address::Address;
use crate::analysis::statements::{Block, LabelId, LabelTable, Statement};
use crate::operand::Operand;
use crate::registers::{Cond, Reg};

/// The graph view the structurer consumes.
///
/// Vertices are dense indices; `None` in a child slot is the procedure's
/// implicit return sink.
pub trait FlowGraph {
    /// The entry vertex.
    fn start(&self) -> usize;

    /// Number of vertices; ids are `0..vertex_count()`.
    fn vertex_count(&self) -> usize;

    /// Successor list of a vertex, in branch order (fall-through first).
    fn children(&self, v: usize) -> &[Option<usize>];

    /// Predecessor list, with duplicates preserved.
    fn parents(&self, v: usize) -> &[usize];

    /// The vertex's statements, terminal branch instruction included.
    fn contents(&self, v: usize) -> &[Statement];

    /// Whether the vertex ends in a jump-table dispatch.
    fn is_switch(&self, v: usize) -> bool;

    /// The branch condition of a two-way vertex.
    fn condition(&self, v: usize) -> Cond;

    /// Address of the vertex's terminal instruction.
    fn branch_addr(&self, v: usize) -> Address;

    /// Address of the vertex's first byte, used for labels.
    fn block_addr(&self, v: usize) -> Address;

    /// Collapses trivial return-only vertices into the sink.
    fn skip_simple_jumps(&self, v: Option<usize>) -> Option<usize>;
}

/// Result of structuring one procedure graph.
pub struct StructureResult {
    /// The statement tree.
    pub body: Block,
    /// Label bookkeeping, with referrers counted.
    pub labels: LabelTable,
    /// Several merge/exit candidates qualified somewhere and the lowest id
    /// was taken; worth a manual review.
    pub ambiguous: bool,
}

/// Structures a procedure graph into a statement tree.
#[must_use]
pub fn structure<G: FlowGraph>(graph: &G) -> StructureResult {
    let mut structurer = Structurer {
        graph,
        cycles: find_cycles(graph),
        merges: find_merge_points(graph),
        labels: HashMap::new(),
        table: LabelTable::new(),
        visited: HashSet::new(),
        ambiguous: false,
    };
    let body = structurer.process(Some(graph.start()), None, None, None, true);
    let mut labels = structurer.table;
    labels.rebuild_referrers(&body);
    StructureResult {
        body,
        labels,
        ambiguous: structurer.ambiguous,
    }
}

/// Reverse-DFS finish order from the entry.
fn finish_order<G: FlowGraph>(graph: &G) -> Vec<usize> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack: Vec<(usize, usize)> = vec![(graph.start(), 0)];
    visited.insert(graph.start());
    while let Some((v, child_idx)) = stack.last_mut() {
        let v = *v;
        let children: Vec<usize> = graph.children(v).iter().filter_map(|c| *c).collect();
        if *child_idx < children.len() {
            let child = children[*child_idx];
            *child_idx += 1;
            if visited.insert(child) {
                stack.push((child, 0));
            }
        } else {
            order.push(v);
            stack.pop();
        }
    }
    order
}

/// Associates each vertex with the cycles it lies on: peel vertices in
/// reverse finish order, collecting backward reachability over the
/// not-yet-removed remainder. A vertex reaching itself backwards closes a
/// cycle.
fn find_cycles<G: FlowGraph>(graph: &G) -> HashMap<usize, Vec<BTreeSet<usize>>> {
    let mut stack = finish_order(graph);
    let mut removed: HashSet<usize> = HashSet::new();
    let mut cycles: HashMap<usize, Vec<BTreeSet<usize>>> = HashMap::new();

    while let Some(x) = stack.pop() {
        let mut cycle = BTreeSet::new();
        let mut queue = vec![x];
        while let Some(y) = queue.pop() {
            for &p in graph.parents(y) {
                if !removed.contains(&p) && cycle.insert(p) {
                    queue.push(p);
                }
            }
        }
        for &member in &cycle {
            cycles.entry(member).or_default().push(cycle.clone());
        }
        removed.insert(x);
    }
    cycles
}

/// A fork identity: the forking vertex and the branch index taken.
type BranchTag = (usize, usize);

/// Computes, per fork vertex, the vertices where its branches reconverge.
///
/// Branch tags flow forward from every fork; a vertex holding all of a
/// fork's tags while some parent does not is the first point the branches
/// have rejoined.
fn find_merge_points<G: FlowGraph>(graph: &G) -> HashMap<usize, BTreeSet<usize>> {
    let mut queue: BTreeSet<Option<usize>> = BTreeSet::new();
    queue.insert(Some(graph.start()));
    let mut visited: HashSet<Option<usize>> = HashSet::new();
    let mut branches: HashMap<Option<usize>, HashSet<BranchTag>> = HashMap::new();

    while let Some(x) = queue.pop_first() {
        visited.insert(x);
        let children: Vec<Option<usize>> = match x {
            Some(v) => graph.children(v).to_vec(),
            None => Vec::new(),
        };

        if children.len() > 1 {
            if let Some(fork) = x {
                for (i, child) in children.iter().enumerate() {
                    if branches.entry(*child).or_default().insert((fork, i)) {
                        queue.insert(*child);
                    }
                }
            }
        }

        for child in &children {
            let parent_tags: Vec<BranchTag> =
                branches.get(&x).map(|tags| tags.iter().copied().collect()).unwrap_or_default();
            let mut updated = false;
            for tag in parent_tags {
                // A vertex's own first two branch tags do not flow into it.
                if let Some(v) = *child {
                    if tag == (v, 0) || tag == (v, 1) {
                        continue;
                    }
                }
                if branches.entry(*child).or_default().insert(tag) {
                    updated = true;
                }
            }
            if updated || !visited.contains(child) {
                queue.insert(*child);
            }
        }
    }

    let has_join = |x: Option<usize>, fork: usize| -> bool {
        let Some(tags) = branches.get(&x) else {
            return false;
        };
        let arity = graph.children(fork).len();
        let count = (0..arity).filter(|i| tags.contains(&(fork, *i))).count();
        count == arity || count >= 3
    };

    let mut merges: HashMap<usize, BTreeSet<usize>> = HashMap::new();
    for x in 0..graph.vertex_count() {
        let Some(tags) = branches.get(&Some(x)) else {
            continue;
        };
        let mut joined = BTreeSet::new();
        for (fork, _) in tags {
            if !has_join(Some(x), *fork) {
                continue;
            }
            if graph
                .parents(x)
                .iter()
                .any(|p| !has_join(Some(*p), *fork))
            {
                joined.insert(*fork);
            }
        }
        for fork in joined {
            merges.entry(fork).or_default().insert(x);
        }
    }
    merges
}

struct Structurer<'g, G: FlowGraph> {
    graph: &'g G,
    cycles: HashMap<usize, Vec<BTreeSet<usize>>>,
    merges: HashMap<usize, BTreeSet<usize>>,
    labels: HashMap<Option<usize>, LabelId>,
    table: LabelTable,
    visited: HashSet<usize>,
    ambiguous: bool,
}

impl<G: FlowGraph> Structurer<'_, G> {
    fn label_for(&mut self, x: Option<usize>) -> LabelId {
        if let Some(&id) = self.labels.get(&x) {
            return id;
        }
        let addr = x.map_or(Address::from_virtual(0), |v| self.graph.block_addr(v));
        let id = self.table.create(addr);
        self.labels.insert(x, id);
        id
    }

    /// Takes the first cycle through `x` with no member consumed yet.
    fn take_unused_cycle(&mut self, x: usize) -> Option<BTreeSet<usize>> {
        let visited = &self.visited;
        let list = self.cycles.get_mut(&x)?;
        let pos = list
            .iter()
            .position(|cycle| cycle.iter().all(|v| !visited.contains(v)))?;
        Some(list.remove(pos))
    }

    /// Vertices directly reachable from the cycle but not on it.
    fn cycle_exits(&self, cycle: &BTreeSet<usize>) -> BTreeSet<Option<usize>> {
        let mut exits = BTreeSet::new();
        for &v in cycle {
            for child in self.graph.children(v) {
                let outside = match child {
                    Some(c) => !cycle.contains(c),
                    None => true,
                };
                if outside {
                    exits.insert(*child);
                }
            }
        }
        exits
    }

    /// Structures the given entry points one after another; each cascade
    /// falls through to the previously processed one. Returns the spliced
    /// statements and the nearest continuation for the caller's branches.
    fn process_cascades(
        &mut self,
        entries: &[Option<usize>],
        after: Option<usize>,
        break_target: Option<Option<usize>>,
        continue_target: Option<Option<usize>>,
    ) -> (Vec<Statement>, Option<usize>) {
        let mut next_after = after;
        let mut cascades: Vec<Block> = Vec::new();
        for entry in entries {
            let entry = self.graph.skip_simple_jumps(*entry);
            let Some(v) = entry else {
                // A lone return after the construct is not worth a cascade.
                continue;
            };
            if self.visited.contains(&v) {
                continue;
            }
            cascades.push(self.process(entry, next_after, break_target, continue_target, true));
            next_after = entry;
        }
        if cascades.len() > 1 {
            self.ambiguous = true;
        }
        cascades.reverse();
        let mut out = Vec::new();
        for cascade in cascades {
            out.extend(cascade.contents);
        }
        (out, next_after)
    }

    fn process(
        &mut self,
        x: Option<usize>,
        after: Option<usize>,
        break_target: Option<Option<usize>>,
        continue_target: Option<Option<usize>>,
        mut need_label: bool,
    ) -> Block {
        let after = self.graph.skip_simple_jumps(after);
        let break_target = break_target.map(|t| self.graph.skip_simple_jumps(t));
        let continue_target = continue_target.map(|t| self.graph.skip_simple_jumps(t));

        let mut out: Vec<Statement> = Vec::new();
        let mut x = x;
        loop {
            x = self.graph.skip_simple_jumps(x);

            let boundary = match x {
                None => true,
                Some(v) => self.visited.contains(&v),
            };
            if boundary {
                if x == after {
                    // Falls through to the expected continuation.
                } else if Some(x) == break_target {
                    let id = self.label_for(x);
                    out.push(Statement::Break(id));
                } else if Some(x) == continue_target {
                    let id = self.label_for(x);
                    out.push(Statement::Continue(id));
                } else if x.is_none() {
                    out.push(Statement::Return);
                } else {
                    let id = self.label_for(x);
                    out.push(Statement::Goto(id));
                }
                return Block::new(out);
            }
            let current = x.unwrap_or_default();

            if let Some(cycle) = self.take_unused_cycle(current) {
                let exits = self.cycle_exits(&cycle);
                let chosen: Vec<Option<usize>> = match exits.len() {
                    0 => Vec::new(),
                    1 => exits.into_iter().collect(),
                    _ => {
                        self.ambiguous = true;
                        exits.into_iter().take(1).collect()
                    }
                };
                let (cascades, next_after) =
                    self.process_cascades(&chosen, after, break_target, continue_target);

                let inner = self.process(x, x, Some(next_after), Some(x), true);
                let continue_label = self.label_for(x);
                out.push(self.make_while(inner, continue_label));
                out.extend(cascades);
                return Block::new(out);
            }

            self.visited.insert(current);
            let children: Vec<Option<usize>> = self.graph.children(current).to_vec();

            if (self.graph.parents(current).len() > 1 || need_label)
                && !self.labels.contains_key(&x)
            {
                let id = self.label_for(x);
                out.push(Statement::Label(id));
                need_label = false;
            }

            if children.len() > 1 {
                let merge_entries: Vec<Option<usize>> = self
                    .merges
                    .get(&current)
                    .map(|set| set.iter().map(|v| Some(*v)).collect())
                    .unwrap_or_default();
                let (cascades, mut next_after) =
                    self.process_cascades(&merge_entries, after, break_target, continue_target);

                // The terminal branch instruction is replaced by the
                // structured construct.
                let contents = self.graph.contents(current);
                out.extend(
                    contents[..contents.len().saturating_sub(1)]
                        .iter()
                        .cloned(),
                );

                if self.graph.is_switch(current) {
                    let switch_break = Some(next_after);
                    let mut branches = Vec::new();
                    for child in children.iter().rev() {
                        branches.push(self.process(
                            *child,
                            next_after,
                            switch_break,
                            continue_target,
                            false,
                        ));
                        next_after = *child;
                    }
                    branches.reverse();
                    out.push(self.make_switch(current, branches));
                } else {
                    let option_a =
                        self.process(children[0], next_after, break_target, continue_target, false);
                    let option_b =
                        self.process(children[1], next_after, break_target, continue_target, false);
                    out.extend(self.make_if(current, option_a, option_b));
                }
                out.extend(cascades);
                return Block::new(out);
            }

            out.extend(self.graph.contents(current).iter().cloned());
            x = children.first().copied().flatten();
        }
    }

    /// Builds the `if` for a two-way vertex, ordering the arms: prefer the
    /// simpler arm, then the arm that continues, as the then-branch; a
    /// non-continuing then-branch hoists the other arm to statement
    /// position.
    fn make_if(&self, v: usize, option_a: Block, option_b: Block) -> Vec<Statement> {
        let mut cond = Operand::Condition(self.graph.condition(v).negated());
        let addr = self.graph.branch_addr(v);
        let (mut option_a, mut option_b) = (option_a, option_b);

        if !option_a.is_empty() && !option_b.is_empty() {
            if option_a.complexity() > option_b.complexity() {
                std::mem::swap(&mut option_a, &mut option_b);
                cond = Operand::logical_not(cond);
            }
            if option_a.has_continue() && !option_b.has_continue() {
                std::mem::swap(&mut option_a, &mut option_b);
                cond = Operand::logical_not(cond);
            }
            if !option_a.has_continue() {
                let mut out = vec![Statement::If {
                    addr,
                    cond,
                    then_branch: Some(option_a),
                    else_branch: None,
                }];
                out.extend(option_b.contents);
                return out;
            }
        }

        if option_a.is_empty() {
            std::mem::swap(&mut option_a, &mut option_b);
            cond = Operand::logical_not(cond);
        }
        let to_option = |b: Block| if b.is_empty() { None } else { Some(b) };
        vec![Statement::If {
            addr,
            cond,
            then_branch: to_option(option_a),
            else_branch: to_option(option_b),
        }]
    }

    fn make_switch(&self, v: usize, branches: Vec<Block>) -> Statement {
        Statement::Switch {
            addr: self.graph.branch_addr(v),
            arg: Operand::Register(Reg::A),
            base: 0,
            branches,
        }
    }

    /// Wraps a carved cycle body in a loop, canonicalizing the
    /// trailing-break pattern into a do-while.
    fn make_while(&self, inner: Block, label: LabelId) -> Statement {
        if let Some(Statement::If {
            cond,
            then_branch: Some(then_branch),
            else_branch: None,
            ..
        }) = inner.contents.last()
        {
            let only_break = then_branch.contents.len() == 1
                && matches!(then_branch.contents[0], Statement::Break(_));
            if only_break {
                let postcond = Operand::logical_not(cond.clone());
                let mut body = inner;
                body.contents.pop();
                return Statement::DoWhile {
                    body,
                    cond: postcond,
                    label,
                };
            }
        }
        Statement::While { body: inner, label }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{Instruction, LoadOp};
    use crate::operand::Operand;

    struct TestGraph {
        children: Vec<Vec<Option<usize>>>,
        parents: Vec<Vec<usize>>,
        contents: Vec<Vec<Statement>>,
        conds: Vec<Cond>,
    }

    impl TestGraph {
        fn new(children: Vec<Vec<Option<usize>>>, conds: Vec<Cond>) -> Self {
            let mut parents = vec![Vec::new(); children.len()];
            for (v, childs) in children.iter().enumerate() {
                for child in childs.iter().flatten() {
                    parents[*child].push(v);
                }
            }
            let contents = (0..children.len())
                .map(|v| {
                    vec![Statement::Instr(Instruction::Load(LoadOp::new(
                        "LD",
                        Operand::Register(Reg::B),
                        Operand::Constant(v as u16),
                        Address::from_virtual(v as u16),
                    )))]
                })
                .collect();
            TestGraph {
                children,
                parents,
                contents,
                conds,
            }
        }
    }

    impl FlowGraph for TestGraph {
        fn start(&self) -> usize {
            0
        }
        fn vertex_count(&self) -> usize {
            self.children.len()
        }
        fn children(&self, v: usize) -> &[Option<usize>] {
            &self.children[v]
        }
        fn parents(&self, v: usize) -> &[usize] {
            &self.parents[v]
        }
        fn contents(&self, v: usize) -> &[Statement] {
            &self.contents[v]
        }
        fn is_switch(&self, _v: usize) -> bool {
            false
        }
        fn condition(&self, v: usize) -> Cond {
            self.conds[v]
        }
        fn branch_addr(&self, v: usize) -> Address {
            Address::from_virtual(v as u16)
        }
        fn block_addr(&self, v: usize) -> Address {
            Address::from_virtual(v as u16)
        }
        fn skip_simple_jumps(&self, v: Option<usize>) -> Option<usize> {
            v
        }
    }

    fn count_kind(body: &Block, pred: &dyn Fn(&Statement) -> bool) -> usize {
        let mut count = 0;
        body.visit(&mut |s| {
            if pred(s) {
                count += 1;
            }
        });
        count
    }

    #[test]
    fn diamond_structures_to_single_if() {
        // 0 -> {1, 2}; 1 -> 3; 2 -> 3; 3 -> sink
        let graph = TestGraph::new(
            vec![
                vec![Some(1), Some(2)],
                vec![Some(3)],
                vec![Some(3)],
                vec![None],
            ],
            vec![Cond::Fz, Cond::Always, Cond::Always, Cond::Always],
        );
        let result = structure(&graph);
        assert_eq!(
            count_kind(&result.body, &|s| matches!(s, Statement::If { .. })),
            1
        );
        assert_eq!(
            count_kind(&result.body, &|s| matches!(s, Statement::Goto(_))),
            0
        );
        assert!(!result.ambiguous);
        // Both arms present.
        result.body.visit(&mut |s| {
            if let Statement::If {
                then_branch,
                else_branch,
                ..
            } = s
            {
                assert!(then_branch.is_some());
                assert!(else_branch.is_some());
            }
        });
    }

    #[test]
    fn single_back_edge_becomes_do_while() {
        // 0 -> {1, 0} on NZ; 1 -> sink
        let graph = TestGraph::new(
            vec![vec![Some(1), Some(0)], vec![None]],
            vec![Cond::Fnz, Cond::Always],
        );
        let result = structure(&graph);
        let loops = count_kind(&result.body, &|s| {
            matches!(s, Statement::While { .. } | Statement::DoWhile { .. })
        });
        assert_eq!(loops, 1);
        result.body.visit(&mut |s| {
            if let Statement::DoWhile { cond, .. } = s {
                assert_eq!(*cond, Operand::Condition(Cond::Fnz));
            }
        });
        assert_eq!(
            count_kind(&result.body, &|s| matches!(s, Statement::Goto(_))),
            0
        );
    }

    #[test]
    fn conditional_return_becomes_single_arm_if() {
        // 0 -> {1, sink}: the sink arm is empty, so the branch collapses
        // into an asymmetric if followed by the fall-through code.
        let graph = TestGraph::new(
            vec![vec![Some(1), None], vec![None]],
            vec![Cond::Fz, Cond::Always],
        );
        let result = structure(&graph);
        let mut single_arm_ifs = 0;
        result.body.visit(&mut |s| {
            if let Statement::If {
                then_branch,
                else_branch,
                ..
            } = s
            {
                if then_branch.is_some() && else_branch.is_none() {
                    single_arm_ifs += 1;
                }
            }
        });
        assert_eq!(single_arm_ifs, 1);
    }

    #[test]
    fn irreducible_flow_falls_back_to_goto() {
        // Two entangled entries into a shared tail:
        // 0 -> {1, 2}; 1 -> {2, 3}; 2 -> {1, 3}; 3 -> sink.
        let graph = TestGraph::new(
            vec![
                vec![Some(1), Some(2)],
                vec![Some(2), Some(3)],
                vec![Some(1), Some(3)],
                vec![None],
            ],
            vec![Cond::Fz, Cond::Fc, Cond::Fnz, Cond::Always],
        );
        let result = structure(&graph);
        // Every vertex is consumed exactly once and the walk terminates;
        // the entangled edges come out as explicit transfers.
        let gotos = count_kind(&result.body, &|s| {
            matches!(
                s,
                Statement::Goto(_) | Statement::Continue(_) | Statement::Break(_)
            )
        });
        assert!(gotos > 0);
    }
}
