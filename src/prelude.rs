//! # gbscope Prelude
//!
//! Convenient re-exports of the most commonly used types and traits.
//!
//! ```rust,no_run
//! use gbscope::prelude::*;
//! ```

pub use crate::address::{Address, MemRegion, BANK_SIZE};
pub use crate::analysis::{Block, LabelTable, ProcedureAnalysis, Statement};
pub use crate::decoder::{DecodeServices, Disassembler};
pub use crate::depend::DependencySet;
pub use crate::instruction::Instruction;
pub use crate::operand::{AddrKind, BinaryOp, FuncOp, Operand};
pub use crate::registers::{Cond, Reg, RegSet};
pub use crate::render::{Renderer, TextClass, TextRenderer};
pub use crate::rom::{ByteSource, RomImage};
pub use crate::session::{AnalysisOverrides, CallIdiom, Session};
pub use crate::xref::{CrossReferenceStore, MemoryStore, ProcFlags, ProcRecord};
pub use crate::{Error, Result};
