//! Opcode dispatch and the decode cache.
//!
//! At construction every rule of the two tables is expanded against all 256
//! byte values into a dispatch table, so decoding is a single index. Where
//! patterns overlap, later rules take precedence (the HALT rule overrides
//! the 0x76 hole in the `LD r, r` template); bytes no rule matches decode
//! to a non-continuing bad-opcode instruction rather than an error.
//!
//! Decoding is pure and idempotent for a fixed ROM, and structuring revisits
//! addresses repeatedly, so decodes are memoized per address in a concurrent
//! cache owned by the session.

use std::collections::HashMap;

use dashmap::DashMap;

use crate::address::Address;
use crate::decoder::rules::{DecodeRule, CB_OPS, MAIN_OPS};
use crate::decoder::template::standard_env;
use crate::instruction::Instruction;
use crate::rom::ByteSource;
use crate::session::AnalysisOverrides;
use crate::xref::CrossReferenceStore;
use crate::Result;

/// A decode result: the instruction and the address following it
/// (`None` for a bad opcode).
pub type Decoded = (Instruction, Option<Address>);

/// External collaborators a decode needs: bytes, callee records, and the
/// analysis overrides.
pub struct DecodeServices<'a> {
    /// The ROM image.
    pub rom: &'a dyn ByteSource,
    /// Store supplying callee dependency sets.
    pub store: &'a dyn CrossReferenceStore,
    /// Manual analysis knowledge.
    pub overrides: &'a AnalysisOverrides,
}

struct OpcodeTable {
    rules: Vec<DecodeRule>,
    dispatch: [Option<u16>; 256],
}

impl OpcodeTable {
    fn build(text: &'static str) -> OpcodeTable {
        let rules: Vec<DecodeRule> = text.lines().filter_map(DecodeRule::parse).collect();
        let mut dispatch = [None; 256];
        for (idx, decode_rule) in rules.iter().enumerate() {
            for byte in 0..=255u8 {
                if decode_rule.rule.match_bits(byte).is_some() {
                    dispatch[byte as usize] = Some(idx as u16);
                }
            }
        }
        OpcodeTable { rules, dispatch }
    }

    fn rule_for(&self, byte: u8) -> Option<&DecodeRule> {
        self.dispatch[byte as usize].map(|idx| &self.rules[idx as usize])
    }

    fn decode(&self, services: &DecodeServices<'_>, addr: Address) -> Result<Decoded> {
        let opcode = services.rom.get(addr)?;
        let Some(decode_rule) = self.rule_for(opcode) else {
            tracing::warn!("bad opcode {opcode:#04x} at {addr}");
            return Ok((Instruction::bad(addr, opcode), None));
        };
        let rule = &decode_rule.rule;

        let bytes = services.rom.read(addr, rule.len())?;
        let argument = match rule.arg_size() {
            1 => u16::from(bytes[1]),
            2 => u16::from(bytes[2]) << 8 | u16::from(bytes[1]),
            _ => 0,
        };
        // Every dispatched byte matches its own rule.
        let params: HashMap<char, u8> = rule.match_bits(opcode).unwrap_or_default();
        let next_addr = addr.offset(rule.len() as i32);

        let env = standard_env(&params, argument, next_addr);
        let operands = rule.operands().iter().map(|t| t.eval(&env)).collect();
        let (reads, writes, loads) = decode_rule.effect.filled(&params, &env);

        let instruction = Instruction::from_decoded(
            services.rom,
            services.store,
            services.overrides,
            rule.mnemonic,
            operands,
            addr,
            reads,
            writes,
            loads,
        );
        Ok((instruction, Some(next_addr)))
    }
}

/// The table-driven instruction decoder with its per-address cache.
pub struct Disassembler {
    main: OpcodeTable,
    extended: OpcodeTable,
    cache: DashMap<Address, Decoded>,
}

impl Default for Disassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Disassembler {
    /// Builds the dispatch tables from the rule text.
    #[must_use]
    pub fn new() -> Self {
        Disassembler {
            main: OpcodeTable::build(MAIN_OPS),
            extended: OpcodeTable::build(CB_OPS),
            cache: DashMap::new(),
        }
    }

    /// Decodes the instruction at `addr`, bypassing the cache.
    ///
    /// A 0xCB escape byte redirects into the extended table; the decoded
    /// instruction is then attributed to the escaped opcode's address.
    ///
    /// # Errors
    ///
    /// Fails only when the underlying byte source does: ambiguous address
    /// or a read past the image end.
    pub fn decode(&self, services: &DecodeServices<'_>, addr: Address) -> Result<Decoded> {
        if services.rom.get(addr)? == 0xCB {
            self.extended.decode(services, addr.offset(1))
        } else {
            self.main.decode(services, addr)
        }
    }

    /// Decodes the instruction at `addr` through the cache.
    ///
    /// # Errors
    ///
    /// Same conditions as [`decode`](Self::decode).
    pub fn decode_cached(&self, services: &DecodeServices<'_>, addr: Address) -> Result<Decoded> {
        if let Some(hit) = self.cache.get(&addr) {
            return Ok(hit.clone());
        }
        let decoded = self.decode(services, addr)?;
        self.cache.insert(addr, decoded.clone());
        Ok(decoded)
    }

    /// Drops all memoized decodes. Decodes are pure, so this only affects
    /// performance - and freshness of captured callee contracts, which is
    /// why the batch driver clears between waves.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::Operand;
    use crate::registers::{Cond, Reg, RegSet};
    use crate::rom::RomImage;
    use crate::xref::MemoryStore;

    fn decode_bytes(bytes: &[u8]) -> Decoded {
        let mut data = bytes.to_vec();
        data.resize(0x100, 0);
        let rom = RomImage::from_bytes(data);
        let store = MemoryStore::new();
        let overrides = AnalysisOverrides::default();
        let services = DecodeServices {
            rom: &rom,
            store: &store,
            overrides: &overrides,
        };
        Disassembler::new()
            .decode(&services, Address::from_virtual(0))
            .unwrap()
    }

    #[test]
    fn every_byte_decodes() {
        let rom = RomImage::from_bytes((0..=255u8).flat_map(|b| [b, 0, 0]).collect());
        let store = MemoryStore::new();
        let overrides = AnalysisOverrides::default();
        let services = DecodeServices {
            rom: &rom,
            store: &store,
            overrides: &overrides,
        };
        let disasm = Disassembler::new();
        for byte in 0..=255u8 {
            let addr = Address::from_virtual(u16::from(byte) * 3);
            let decoded = disasm.decode(&services, addr);
            assert!(decoded.is_ok(), "byte {byte:#04x} failed to decode");
        }
    }

    #[test]
    fn nop_is_trivial() {
        let (instr, next) = decode_bytes(&[0x00]);
        assert_eq!(instr.name(), "NOP");
        assert_eq!(next, Some(Address::from_virtual(1)));
        let deps = instr.dependency_set();
        assert!(deps.reads.is_empty());
        assert!(deps.writes.is_empty());
        match instr {
            Instruction::Expression(op) => assert!(op.operands.is_empty()),
            other => panic!("expected expression op, got {other:?}"),
        }
    }

    #[test]
    fn halt_overrides_ld_template() {
        let (instr, _) = decode_bytes(&[0x76]);
        assert_eq!(instr.name(), "HALT");
        assert!(!instr.dependency_set().writes.is_empty());
    }

    #[test]
    fn ld_immediate() {
        // LD B, 0x42
        let (instr, next) = decode_bytes(&[0x06, 0x42]);
        assert_eq!(next, Some(Address::from_virtual(2)));
        match instr {
            Instruction::Load(op) => {
                assert_eq!(op.target, Operand::Register(Reg::B));
                assert_eq!(op.source, Operand::Constant(0x42));
            }
            other => panic!("expected load, got {other:?}"),
        }
    }

    #[test]
    fn relative_jump_resolves_target() {
        // JR NZ, -2 (to itself)
        let (instr, _) = decode_bytes(&[0x20, 0xFE]);
        match &instr {
            Instruction::Jump(op) => {
                assert_eq!(op.cond, Cond::Fnz);
                assert_eq!(op.target_addr, Some(Address::from_virtual(0)));
            }
            other => panic!("expected jump, got {other:?}"),
        }
        assert!(instr.has_continue());
        assert_eq!(instr.jumps(), vec![Address::from_virtual(0)]);
    }

    #[test]
    fn rst_zero_is_switch_dispatch() {
        // RST 0x00 followed by a two-entry jump table.
        let (instr, _) = decode_bytes(&[0xC7, 0x50, 0x01, 0x60, 0x01, 0xFF, 0xFF]);
        match instr {
            Instruction::Switch(op) => {
                assert_eq!(op.table_addr, Address::from_virtual(1));
                assert_eq!(op.targets[0], Address::from_virtual(0x0150));
                assert_eq!(op.targets[1], Address::from_virtual(0x0160));
            }
            other => panic!("expected switch, got {other:?}"),
        }
    }

    #[test]
    fn rst_nonzero_is_call() {
        // RST 0x18
        let (instr, _) = decode_bytes(&[0xDF]);
        assert_eq!(instr.calls(), Some(Address::from_virtual(0x18)));
    }

    #[test]
    fn extended_table_via_cb_escape() {
        // BIT 7, H
        let (instr, next) = decode_bytes(&[0xCB, 0x7C]);
        assert_eq!(instr.name(), "BIT");
        assert_eq!(next, Some(Address::from_virtual(2)));
        let deps = instr.dependency_set();
        assert_eq!(deps.reads, RegSet::H);
        assert!(deps.writes.contains(RegSet::FZ));
    }

    #[test]
    fn push_pop_effects() {
        // PUSH BC
        let (push, _) = decode_bytes(&[0xC5]);
        let deps = push.dependency_set();
        assert_eq!(deps.reads, RegSet::SP | RegSet::B | RegSet::C);
        assert!(deps.writes.contains(RegSet::SP | RegSet::MEM));

        // POP BC
        let (pop, _) = decode_bytes(&[0xC1]);
        let deps = pop.dependency_set();
        assert_eq!(deps.reads, RegSet::SP | RegSet::MEM);
        assert!(deps.writes.contains(RegSet::SP | RegSet::B | RegSet::C));
    }

    #[test]
    fn unmatched_byte_degrades() {
        let (instr, next) = decode_bytes(&[0xD3]);
        assert_eq!(instr.name(), "BAD-OP");
        assert!(!instr.has_continue());
        assert_eq!(next, None);
    }

    #[test]
    fn cache_is_transparent() {
        let rom = RomImage::from_bytes(vec![0x06, 0x42, 0x00]);
        let store = MemoryStore::new();
        let overrides = AnalysisOverrides::default();
        let services = DecodeServices {
            rom: &rom,
            store: &store,
            overrides: &overrides,
        };
        let disasm = Disassembler::new();
        let addr = Address::from_virtual(0);
        let (first, _) = disasm.decode_cached(&services, addr).unwrap();
        let (second, _) = disasm.decode_cached(&services, addr).unwrap();
        assert_eq!(first.name(), second.name());
        disasm.clear_cache();
        let (third, _) = disasm.decode_cached(&services, addr).unwrap();
        assert_eq!(first.name(), third.name());
    }
}
