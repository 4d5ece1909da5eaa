//! Table-driven instruction decoding.
//!
//! The decoder is built once from two declarative rule tables (the primary
//! opcode map and the 0xCB-escaped bit operations). Each rule pairs an
//! 8-bit pattern with wildcard letter groups, operand templates, and a
//! read/write effect expression; construction expands the rules into
//! 256-entry dispatch tables. Decoding evaluates the templates against the
//! concrete wildcard values and immediate bytes, producing a typed
//! [`Instruction`](crate::instruction::Instruction) with its dependency
//! sets already computed.
//!
//! # Example
//!
//! ```rust
//! use gbscope::{Address, AnalysisOverrides, Disassembler, DecodeServices, MemoryStore, RomImage};
//!
//! let rom = RomImage::from_bytes(vec![0x3E, 0x01, 0xC9]); // LD A,1; RET
//! let store = MemoryStore::new();
//! let overrides = AnalysisOverrides::default();
//! let services = DecodeServices { rom: &rom, store: &store, overrides: &overrides };
//!
//! let disasm = Disassembler::new();
//! let (instr, next) = disasm.decode(&services, Address::from_virtual(0))?;
//! assert_eq!(instr.name(), "LD");
//! assert_eq!(next, Some(Address::from_virtual(2)));
//! # Ok::<(), gbscope::Error>(())
//! ```

mod dispatch;
mod effect;
mod rules;
mod template;

pub use dispatch::{Decoded, DecodeServices, Disassembler};
