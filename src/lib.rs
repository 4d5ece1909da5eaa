#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]

//! # gbscope
//!
//! A framework for analyzing and decompiling Game Boy ROM images. Built in
//! pure Rust, `gbscope` decodes SM83 machine code, discovers procedure
//! boundaries by recursively following control flow (inferred jump tables
//! included), recovers per-procedure control flow graphs, converts them into
//! nested structured pseudocode, and simplifies the result with
//! flow-sensitive value propagation and dependency-based dead-write
//! elimination.
//!
//! ## Features
//!
//! - **Table-driven decoding** - the full opcode map as declarative rules
//!   with typed operands and per-instruction read/write effect sets
//! - **Banked address modeling** - first-class ambiguity for the switchable
//!   ROM window, with canonical round-trippable address text
//! - **Procedure discovery** - worklist disassembly with monotonic extent
//!   shrinking and jump-table inference
//! - **Control flow structuring** - arbitrary, even irreducible graphs
//!   become if/while/do-while/switch trees, with goto as the safety net
//! - **Dataflow simplification** - constant folding, bank tracking and
//!   dead-write elimination over the structured tree
//! - **Graceful degradation** - bad opcodes, byte conflicts and unknown
//!   callees become flags and conservative defaults, never aborts
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use gbscope::prelude::*;
//!
//! // LD A,1; LD B,A; RET
//! let rom = RomImage::from_bytes(vec![0x3E, 0x01, 0x47, 0xC9]);
//! let session = Session::new(Arc::new(rom), Arc::new(MemoryStore::new()));
//!
//! let analysis = session.analyze_procedure(Address::from_virtual(0))?;
//! let mut renderer = TextRenderer::new();
//! analysis.render(&mut renderer);
//! // The second load's source has been folded to the constant 1.
//! assert!(renderer.contents().contains("B = 1"));
//! # Ok::<(), gbscope::Error>(())
//! ```
//!
//! ## Architecture
//!
//! `gbscope` is organized into several key modules:
//!
//! - [`address`] - the banked Game Boy address space
//! - [`rom`] - byte access to ROM images
//! - [`decoder`] - rule tables and instruction decoding
//! - [`instruction`] / [`operand`] - typed instructions and the expression
//!   algebra
//! - [`analysis`] - extent discovery, CFG recovery, structuring, and the
//!   dataflow passes
//! - [`xref`] - the per-procedure cross-reference store
//! - [`render`] - presentation-agnostic pseudocode output
//! - [`session`] - the pipeline owner and whole-ROM batch driver
//!
//! ## Scope
//!
//! The crate is the analysis core only. Presentation layers (GUI, HTTP),
//! durable cross-reference storage and project management are left to
//! consumers of the [`render::Renderer`] and
//! [`xref::CrossReferenceStore`] interfaces.

pub mod address;
pub mod analysis;
pub mod context;
pub mod decoder;
pub mod depend;
mod error;
pub mod instruction;
pub mod operand;
pub mod prelude;
pub mod registers;
pub mod render;
pub mod rom;
pub mod session;
pub mod xref;

pub use address::{Address, MemRegion, BANK_SIZE};
pub use analysis::ProcedureAnalysis;
pub use decoder::{DecodeServices, Disassembler};
pub use depend::DependencySet;
pub use error::Error;
pub use registers::{Cond, Reg, RegSet};
pub use render::{Renderer, TextRenderer};
pub use rom::{ByteSource, RomImage};
pub use session::{AnalysisOverrides, CallIdiom, Session};
pub use xref::{CrossReferenceStore, MemoryStore, ProcFlags, ProcRecord};

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;
