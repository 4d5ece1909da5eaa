//! The per-procedure analysis pipeline.
//!
//! `analyze` runs the strict pipeline for one entry address: extent scan,
//! graph construction, structuring, forward value propagation, backward
//! dead-write elimination - and derives the procedure's publishable
//! [`ProcRecord`] from the result: the calling contract with flag reads
//! stripped, call and memory edges, extent, and anomaly flags.

use crate::address::Address;
use crate::analysis::graph::ProcedureGraph;
use crate::analysis::range::RangeAnalysis;
use crate::analysis::statements::{Block, LabelTable, Statement};
use crate::analysis::structure::{structure, StructureResult};
use crate::context::Context;
use crate::decoder::{DecodeServices, Disassembler};
use crate::depend::DependencySet;
use crate::instruction::Instruction;
use crate::operand::Operand;
use crate::registers::{Reg, RegSet};
use crate::render::Renderer;
use crate::xref::{ProcFlags, ProcRecord};
use crate::{Error, Result};

/// The analyzed, optimized form of one procedure.
pub struct ProcedureAnalysis {
    /// Entry address.
    pub addr: Address,
    /// The optimized statement tree.
    pub body: Block,
    /// Label bookkeeping for the tree.
    pub labels: LabelTable,
    /// The derived store record.
    pub record: ProcRecord,
    /// Structuring hit multiple equally valid merge or exit candidates and
    /// took the lowest; worth manual review.
    pub ambiguous_structure: bool,
}

impl ProcedureAnalysis {
    /// Serializes the procedure's pseudocode through a renderer.
    pub fn render(&self, r: &mut dyn Renderer) {
        self.body.render(r, &self.labels);
    }
}

/// Analyzes the procedure entered at `addr`.
///
/// # Errors
///
/// Returns [`Error::AmbiguousAddress`] when `addr` lies in the switchable
/// window without a bank; every anomaly past that degrades into record
/// flags.
pub(crate) fn analyze(
    disasm: &Disassembler,
    services: &DecodeServices<'_>,
    addr: Address,
) -> Result<ProcedureAnalysis> {
    if addr.is_ambiguous() {
        return Err(Error::AmbiguousAddress(addr));
    }

    let range = RangeAnalysis::scan(disasm, services, addr);
    let graph = ProcedureGraph::build(disasm, services, &range);
    let StructureResult {
        body,
        mut labels,
        ambiguous,
    } = structure(&graph);

    // Forward pass, seeded with whatever bank knowledge exists for the
    // entry.
    let mut ctx = Context::new();
    if let Some(bank) = services
        .overrides
        .initial_banks
        .get(&addr.virtual_offset())
    {
        ctx.set(Reg::RomBank, Operand::Constant(*bank));
    }
    if addr.in_banked_window() && !addr.is_ambiguous() {
        ctx.set(Reg::RomBank, Operand::Constant(addr.bank()));
    }
    let body = body.optimized(&mut ctx, &mut labels, services.overrides);

    // Backward pass: at the return boundary everything but the flags is
    // observable.
    let body = body.optimize_dependencies(RegSet::tracked() - RegSet::FLAGS, &mut labels);

    if ambiguous {
        tracing::warn!("{addr}: multiple structuring candidates, lowest block taken");
    }

    let record = derive_record(&graph, &body, &labels, services);
    Ok(ProcedureAnalysis {
        addr,
        body,
        labels,
        record,
        ambiguous_structure: ambiguous,
    })
}

fn derive_record(
    graph: &ProcedureGraph,
    body: &Block,
    labels: &LabelTable,
    services: &DecodeServices<'_>,
) -> ProcRecord {
    let deps = body.dependency_set(labels);
    let mut record = ProcRecord::unknown(graph.start_addr());
    record.dependency_set = DependencySet::new(deps.reads - RegSet::FLAGS, deps.writes);
    record.byte_length = graph.byte_length();
    record.flags = ProcFlags::empty();
    if graph.suspicious_switch {
        record.flags |= ProcFlags::SUSPICIOUS_SWITCH;
    }
    if graph.warn {
        record.flags |= ProcFlags::HAS_SUSPICIOUS_INSTR;
    }
    if graph.has_nop {
        record.flags |= ProcFlags::HAS_NOP;
    }

    body.visit(&mut |statement| match statement {
        Statement::Instr(instruction) => {
            instruction.mem_reads_into(&mut record.mem_reads);
            instruction.mem_writes_into(&mut record.mem_writes);
            match instruction {
                Instruction::Call(op) => {
                    match instruction.calls() {
                        Some(target) if op.name == "tail-call" => {
                            record.tail_calls.insert(target);
                        }
                        Some(target) => {
                            record.calls.insert(target);
                        }
                        None => {
                            let benign = services
                                .overrides
                                .benign_ambiguous_calls
                                .contains(&op.target_addr.virtual_offset());
                            if !benign {
                                record.flags |= ProcFlags::HAS_AMBIGUOUS_CALLS;
                            }
                        }
                    }
                }
                Instruction::Switch(_) => {
                    record.flags |= ProcFlags::HAS_SUSPICIOUS_INSTR;
                }
                Instruction::Jump(_) => {
                    if instruction.all_jumps().is_empty() {
                        record.flags |= ProcFlags::HAS_SUSPICIOUS_INSTR;
                    }
                }
                Instruction::Expression(op) => {
                    if matches!(op.name, "STOP" | "HALT") {
                        record.flags |= ProcFlags::HAS_SUSPICIOUS_INSTR;
                    }
                }
                _ => {}
            }
        }
        Statement::Switch { .. } => {
            record.flags |= ProcFlags::HAS_SWITCH;
        }
        Statement::If { cond, .. } | Statement::DoWhile { cond, .. } => {
            cond.mem_reads_into(&mut record.mem_reads);
        }
        _ => {}
    });
    record
}
