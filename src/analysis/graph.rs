//! Per-procedure control flow graph.
//!
//! The block partition is keyed by the branch and label targets the range
//! scan observed: each block is the instruction run from its start to the
//! next start or the first non-continuing instruction. Terminal
//! unconditional jumps and returns are elided from block contents - the
//! edge carries the information - while conditional terminals stay, to be
//! replaced by structured constructs later.
//!
//! A `None` successor is the implicit return sink. Branch targets outside
//! the block partition (tail calls into other procedures, truncated
//! jump-table targets) get fabricated stub blocks holding a synthetic
//! tail-call.

use std::collections::HashMap;

use crate::address::{Address, BANK_SIZE};
use crate::analysis::range::RangeAnalysis;
use crate::analysis::statements::{Block, Statement};
use crate::analysis::structure::FlowGraph;
use crate::decoder::{DecodeServices, Disassembler};
use crate::instruction::{CallOp, Instruction};
use crate::registers::Cond;

/// The control flow graph of one procedure.
#[derive(Debug)]
pub struct ProcedureGraph {
    start_addr: Address,
    end_addr: Address,
    block_starts: Vec<Address>,
    blocks: Vec<Vec<Statement>>,
    children: Vec<Vec<Option<usize>>>,
    parents: Vec<Vec<usize>>,
    /// Jump-table inference terminated abnormally during the range scan.
    pub suspicious_switch: bool,
    /// The range scan logged a conflict or decode failure.
    pub warn: bool,
    /// A NOP was decoded inside the extent.
    pub has_nop: bool,
}

impl ProcedureGraph {
    /// Builds the graph from the range scan's block partition.
    pub(crate) fn build(
        disasm: &Disassembler,
        services: &DecodeServices<'_>,
        range: &RangeAnalysis,
    ) -> ProcedureGraph {
        let mut block_starts: Vec<Address> = range.block_starts.iter().copied().collect();
        let mut block_id_at: HashMap<Address, usize> = block_starts
            .iter()
            .enumerate()
            .map(|(i, a)| (*a, i))
            .collect();

        let count = block_starts.len();
        let mut blocks: Vec<Vec<Statement>> = Vec::with_capacity(count);
        let mut child_addrs: Vec<Vec<Option<Address>>> = Vec::with_capacity(count);

        for i in 0..count {
            let start = block_starts[i];
            let end = block_starts.get(i + 1).copied().unwrap_or(range.limit);

            let mut instructions: Vec<Instruction> = Vec::new();
            let mut addr = start;
            while addr < end {
                let Ok((instruction, next_addr)) = disasm.decode_cached(services, addr) else {
                    break;
                };
                let continues = instruction.has_continue();
                instructions.push(instruction);
                match next_addr {
                    Some(next_addr) if continues => addr = next_addr,
                    _ => break,
                }
            }

            let mut childs: Vec<Option<Address>> = Vec::new();
            let mut remove_last = false;
            match instructions.last() {
                Some(last) => {
                    if last.has_continue() {
                        childs.push(Some(end));
                    }
                    match last {
                        Instruction::Jump(op) => {
                            childs.extend(last.all_jumps().into_iter().map(Some));
                            if op.cond.always_true() && !last.all_jumps().is_empty() {
                                remove_last = true;
                            }
                        }
                        Instruction::Switch(op) => {
                            let size = range
                                .jumptable_sizes
                                .get(&op.table_addr)
                                .copied()
                                .unwrap_or(0);
                            childs.extend(op.jumps_for_size(size).iter().map(|a| Some(*a)));
                        }
                        Instruction::Ret(_) => {
                            childs.push(None);
                            if !last.has_continue() {
                                remove_last = true;
                            }
                        }
                        _ => {}
                    }
                }
                None => childs.push(None),
            }
            if remove_last {
                instructions.pop();
            }

            blocks.push(Block::new(instructions.into_iter().map(Statement::Instr).collect()).contents);
            child_addrs.push(childs);
        }

        // Fabricate stub blocks for targets outside the partition.
        let mut children: Vec<Vec<Option<usize>>> = Vec::with_capacity(count);
        for childs in &child_addrs {
            let mut ids = Vec::with_capacity(childs.len());
            for child in childs {
                match child {
                    None => ids.push(None),
                    Some(target) => {
                        if let Some(&id) = block_id_at.get(target) {
                            ids.push(Some(id));
                        } else {
                            let id = blocks.len();
                            block_id_at.insert(*target, id);
                            block_starts.push(*target);
                            blocks.push(vec![Statement::Instr(Instruction::Call(
                                CallOp::tail(services.store, *target),
                            ))]);
                            ids.push(Some(id));
                        }
                    }
                }
            }
            children.push(ids);
        }
        // Stubs end in the sink.
        while children.len() < blocks.len() {
            children.push(vec![None]);
        }

        let mut parents: Vec<Vec<usize>> = vec![Vec::new(); blocks.len()];
        for (v, childs) in children.iter().enumerate() {
            // Duplicate edges must be preserved for merge-point detection.
            for child in childs.iter().flatten() {
                parents[*child].push(v);
            }
        }

        ProcedureGraph {
            start_addr: range.start,
            end_addr: range.limit,
            block_starts,
            blocks,
            children,
            parents,
            suspicious_switch: range.suspicious_switch,
            warn: range.warn,
            has_nop: range.has_nop,
        }
    }

    /// Entry address of the procedure.
    #[must_use]
    pub fn start_addr(&self) -> Address {
        self.start_addr
    }

    /// Extent of the procedure in bytes.
    #[must_use]
    pub fn byte_length(&self) -> u16 {
        // An extent reaching its bank boundary ends at the window top, not
        // at the next bank's (smaller) window base.
        let end = if self.end_addr.bank() > self.start_addr.bank() {
            2 * BANK_SIZE
        } else {
            self.end_addr.virtual_offset()
        };
        end.saturating_sub(self.start_addr.virtual_offset())
    }

    fn last_instruction(&self, v: usize) -> Option<&Instruction> {
        match self.blocks[v].last() {
            Some(Statement::Instr(instruction)) => Some(instruction),
            _ => None,
        }
    }
}

impl FlowGraph for ProcedureGraph {
    fn start(&self) -> usize {
        0
    }

    fn vertex_count(&self) -> usize {
        self.blocks.len()
    }

    fn children(&self, v: usize) -> &[Option<usize>] {
        &self.children[v]
    }

    fn parents(&self, v: usize) -> &[usize] {
        &self.parents[v]
    }

    fn contents(&self, v: usize) -> &[Statement] {
        &self.blocks[v]
    }

    fn is_switch(&self, v: usize) -> bool {
        matches!(self.last_instruction(v), Some(Instruction::Switch(_)))
    }

    fn condition(&self, v: usize) -> Cond {
        match self.last_instruction(v) {
            Some(Instruction::Jump(op)) => op.cond,
            Some(Instruction::Ret(op)) => op.cond,
            _ => Cond::Always,
        }
    }

    fn branch_addr(&self, v: usize) -> Address {
        self.last_instruction(v)
            .map_or(self.block_starts[v], Instruction::addr)
    }

    fn block_addr(&self, v: usize) -> Address {
        self.block_starts[v]
    }

    fn skip_simple_jumps(&self, v: Option<usize>) -> Option<usize> {
        match v {
            Some(x)
                if x != 0
                    && self.blocks[x].is_empty()
                    && self.children[x].as_slice() == [None] =>
            {
                None
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::range::RangeAnalysis;
    use crate::rom::RomImage;
    use crate::session::AnalysisOverrides;
    use crate::xref::MemoryStore;

    fn graph_of(bytes: &[u8]) -> ProcedureGraph {
        let mut data = bytes.to_vec();
        data.resize(0x4000, 0);
        let rom = RomImage::from_bytes(data);
        let store = MemoryStore::new();
        let overrides = AnalysisOverrides::default();
        let services = DecodeServices {
            rom: &rom,
            store: &store,
            overrides: &overrides,
        };
        let disasm = Disassembler::new();
        let range = RangeAnalysis::scan(&disasm, &services, Address::from_virtual(0));
        ProcedureGraph::build(&disasm, &services, &range)
    }

    #[test]
    fn straight_line_is_one_block() {
        // LD A,1; RET
        let graph = graph_of(&[0x3E, 0x01, 0xC9]);
        assert_eq!(graph.vertex_count(), 1);
        // The unconditional return is elided; the edge carries it.
        assert_eq!(graph.children(0), &[None]);
        assert_eq!(graph.contents(0).len(), 1);
        assert_eq!(graph.byte_length(), 3);
    }

    #[test]
    fn conditional_branch_shape() {
        // 0: JR Z,+1; 2: INC B; 3: RET
        let graph = graph_of(&[0x28, 0x01, 0x04, 0xC9]);
        assert_eq!(graph.vertex_count(), 3);
        // Block 0 keeps its conditional terminal and has fall-through
        // first.
        assert_eq!(graph.children(0), &[Some(1), Some(2)]);
        assert_eq!(graph.condition(0), Cond::Fz);
        assert!(!graph.is_switch(0));
        // Block 2 is the elided return.
        assert!(graph.contents(2).is_empty());
        assert_eq!(graph.children(2), &[None]);
        assert_eq!(graph.skip_simple_jumps(Some(2)), None);
        // Both block 0 and block 1 reach block 2.
        assert_eq!(graph.parents(2), &[0, 1]);
    }

    #[test]
    fn conditional_return_keeps_terminal() {
        // 0: RET Z; 1: RET
        let graph = graph_of(&[0xC8, 0xC9]);
        // RET Z stays in contents; successors are fall-through and sink.
        assert_eq!(graph.children(0), &[Some(1), None]);
        assert_eq!(graph.condition(0), Cond::Fz);
        assert_eq!(graph.contents(0).len(), 1);
    }

    #[test]
    fn out_of_partition_target_gets_stub() {
        // JP 0x2000 - outside the scanned extent entirely.
        let graph = graph_of(&[0xC3, 0x00, 0x20]);
        // Entry block plus the fabricated tail-call stub.
        assert_eq!(graph.vertex_count(), 2);
        let stub = 1;
        assert_eq!(graph.children(stub), &[None]);
        match &graph.contents(stub)[0] {
            Statement::Instr(Instruction::Call(op)) => {
                assert_eq!(op.name, "tail-call");
                assert_eq!(op.target_addr, Address::from_virtual(0x2000));
            }
            other => panic!("expected tail call stub, got {other:?}"),
        }
    }
}
