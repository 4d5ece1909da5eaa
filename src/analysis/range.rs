//! Procedure extent discovery.
//!
//! A procedure's extent starts open-ended - bounded by the bank boundary or
//! the next store-owned address - and shrinks monotonically as evidence
//! arrives: a call landing inside the candidate range truncates it (calls
//! never target a procedure's interior), and the final extent ends at the
//! first byte the worklist never claimed.
//!
//! The scan is a worklist over instruction addresses: decode, claim the
//! instruction's bytes for this procedure, enqueue the fall-through and all
//! static branch targets. Jump-table dispatches queue their table for
//! incremental expansion: entries are accepted while the next 2-byte slot
//! is unclaimed and its target plausible (mapped ROM, not suspiciously
//! low), with manual override lengths taking precedence for known-ambiguous
//! tables. Abnormal table termination and byte conflicts degrade to flags,
//! never errors.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::address::Address;
use crate::decoder::{DecodeServices, Disassembler};
use crate::instruction::Instruction;
use crate::xref::CrossReferenceStore;

/// The raw facts discovered about one procedure's extent.
#[derive(Debug)]
pub(crate) struct RangeAnalysis {
    /// Entry address.
    pub start: Address,
    /// Exclusive end of the extent after shrinking.
    pub limit: Address,
    /// Addresses of decoded instructions.
    pub visited: BTreeSet<Address>,
    /// Branch targets, rendered as labels.
    pub labels: BTreeSet<Address>,
    /// Basic block boundaries.
    pub block_starts: BTreeSet<Address>,
    /// Inferred entry count per jump table.
    pub jumptable_sizes: BTreeMap<Address, usize>,
    /// Jump-table inference terminated abnormally.
    pub suspicious_switch: bool,
    /// A decode or ownership conflict was logged.
    pub warn: bool,
    /// A NOP was decoded inside the extent.
    pub has_nop: bool,
    owned: HashSet<Address>,
    queue: BTreeSet<Address>,
    jumptable_queue: BTreeSet<Address>,
}

/// The open-ended upper bound for a procedure at `addr`: its bank boundary,
/// or the next procedure the store already owns, whichever is closer.
fn scan_limit(store: &dyn CrossReferenceStore, addr: Address) -> Address {
    let bank_limit = if addr.in_rom() {
        Address::from_virtual_and_bank(0x4000, addr.bank() + 1)
    } else {
        Address::from_virtual(0xFFFF)
    };
    match store.next_owned_address_after(addr) {
        Some(next) if next < bank_limit => next,
        _ => bank_limit,
    }
}

impl RangeAnalysis {
    /// Runs the scan from `start`.
    pub(crate) fn scan(
        disasm: &Disassembler,
        services: &DecodeServices<'_>,
        start: Address,
    ) -> RangeAnalysis {
        let mut analysis = RangeAnalysis {
            start,
            limit: scan_limit(services.store, start),
            visited: BTreeSet::new(),
            labels: BTreeSet::new(),
            block_starts: BTreeSet::from([start]),
            jumptable_sizes: BTreeMap::new(),
            suspicious_switch: false,
            warn: false,
            has_nop: false,
            owned: HashSet::new(),
            queue: BTreeSet::from([start]),
            jumptable_queue: BTreeSet::new(),
        };
        analysis.drain(disasm, services);
        let gap = analysis.first_gap();
        analysis.shrink_and_cut(gap);
        analysis
    }

    fn is_local(&self, addr: Address) -> bool {
        self.start <= addr && addr < self.limit
    }

    fn is_available(&self, addr: Address) -> bool {
        self.is_local(addr) && !self.owned.contains(&addr)
    }

    fn shrink_limit(&mut self, addr: Address) {
        if self.is_local(addr) {
            self.limit = addr;
        }
    }

    fn own_byte(&mut self, addr: Address) {
        if !self.is_available(addr) {
            tracing::warn!("byte ownership conflict at {addr}");
            self.warn = true;
            return;
        }
        self.owned.insert(addr);
    }

    fn own_byte_range(&mut self, addr: Address, len: u16) {
        for i in 0..len {
            let byte = addr.offset(i32::from(i));
            if !self.is_local(byte) {
                tracing::warn!("instruction at {addr} crosses the extent limit");
                self.warn = true;
                return;
            }
            self.own_byte(byte);
        }
    }

    fn drain(&mut self, disasm: &Disassembler, services: &DecodeServices<'_>) {
        loop {
            if let Some(addr) = self.queue.pop_first() {
                self.visit_instruction(disasm, services, addr);
            } else if let Some(table) = self.jumptable_queue.pop_first() {
                self.try_expand_jumptable(services, table);
            } else {
                break;
            }
        }
    }

    fn visit_instruction(
        &mut self,
        disasm: &Disassembler,
        services: &DecodeServices<'_>,
        addr: Address,
    ) {
        if self.visited.contains(&addr) || !self.is_local(addr) {
            return;
        }
        if !self.is_available(addr) {
            tracing::warn!("instruction conflict at {addr}");
            self.warn = true;
        }
        self.visited.insert(addr);

        let (instruction, next_addr) = match disasm.decode_cached(services, addr) {
            Ok(decoded) => decoded,
            Err(error) => {
                tracing::warn!("decode failed at {addr}: {error}");
                self.warn = true;
                return;
            }
        };

        let Some(next_addr) = next_addr else {
            // A bad opcode owns its byte and ends the trace locally.
            self.warn = true;
            self.own_byte(addr);
            return;
        };
        let length = next_addr.virtual_offset() - addr.virtual_offset();
        self.own_byte_range(addr, length);

        if let Instruction::Expression(op) = &instruction {
            if op.name == "NOP" {
                self.has_nop = true;
            }
        }

        if matches!(instruction, Instruction::Switch(_)) {
            self.jumptable_queue.insert(next_addr);
            return;
        }

        if instruction.has_continue() {
            self.queue.insert(next_addr);
            if matches!(instruction, Instruction::Ret(_)) || !instruction.all_jumps().is_empty() {
                self.block_starts.insert(next_addr);
            }
        }

        for jump in instruction.jumps() {
            self.queue.insert(jump);
            self.labels.insert(jump);
            self.block_starts.insert(jump);
        }

        if let Some(call) = instruction.calls() {
            if call != self.start {
                self.shrink_limit(call);
            }
        }
    }

    fn try_expand_jumptable(&mut self, services: &DecodeServices<'_>, table: Address) {
        let size = self.jumptable_sizes.get(&table).copied().unwrap_or(0);
        let manual = services.overrides.jumptable_limits.get(&table).copied();

        if let Some(limit) = manual {
            if size >= limit {
                tracing::info!("jump table at {table} closed by manual limit {limit}");
                self.suspicious_switch = true;
                return;
            }
        }

        let entry = table.offset(size as i32 * 2);
        if manual.is_none() && !self.is_available(entry) {
            return;
        }

        let Ok(word) = services.rom.get_word(entry) else {
            self.suspicious_switch = true;
            return;
        };
        let target = Address::from_virtual_and_current(word, self.start);

        if manual.is_none() && (!target.in_rom() || target.virtual_offset() <= 0x4A) {
            tracing::warn!("jump table at {table} bounded by implausible target {target}");
            self.suspicious_switch = true;
            return;
        }

        *self.jumptable_sizes.entry(table).or_insert(0) += 1;
        self.own_byte_range(entry, 2);
        self.jumptable_queue.insert(table);
        self.queue.insert(target);
        self.labels.insert(target);
        self.block_starts.insert(target);
    }

    /// First byte after `start` the scan never claimed.
    fn first_gap(&self) -> Address {
        let mut addr = self.start;
        while addr < self.limit && self.owned.contains(&addr) {
            let next = addr.offset(1);
            if next < addr {
                // Walked off the bank window; the extent runs to the limit.
                return self.limit;
            }
            addr = next;
        }
        addr
    }

    fn shrink_and_cut(&mut self, limit: Address) {
        self.limit = limit;
        self.visited.retain(|a| *a >= self.start && *a < limit);
        self.labels.retain(|a| *a >= self.start && *a < limit);
        self.block_starts.retain(|a| *a >= self.start && *a < limit);
        self.jumptable_sizes
            .retain(|a, _| *a >= self.start && *a < limit);
        self.owned.retain(|a| *a >= self.start && *a < limit);
    }
}
