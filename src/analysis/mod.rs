//! Procedure discovery, control flow recovery and optimization.
//!
//! The pipeline for one procedure is strict and synchronous:
//!
//! 1. [`range`] - worklist disassembly inferring the procedure's extent and
//!    any jump tables;
//! 2. [`graph`] - the basic-block control flow graph over that extent;
//! 3. [`structure`] - conversion of the graph into nested structured
//!    statements;
//! 4. the forward and backward passes of [`statements`] - value propagation
//!    and dead-write elimination;
//! 5. [`procedure`] - record derivation for the cross-reference store.
//!
//! Every stage degrades on anomalies (bad opcodes, byte conflicts,
//! irreducible flow, unknown callees) instead of failing the procedure.

pub mod graph;
pub mod procedure;
pub(crate) mod range;
pub mod statements;
pub mod structure;

pub use graph::ProcedureGraph;
pub use procedure::ProcedureAnalysis;
pub use statements::{Block, LabelId, LabelInfo, LabelTable, Statement};
pub use structure::{structure, FlowGraph, StructureResult};
