//! Cross-reference store.
//!
//! Analysis results are published per procedure as a [`ProcRecord`]:
//! the calling contract, discovered call and memory edges, extent and
//! anomaly flags. The [`CrossReferenceStore`] trait is the only channel
//! between analyses - a procedure observes its callees exclusively through
//! records, and a missing record degrades to the pessimistic default, so
//! analyses can run in any order and be re-run as more callees become known.
//!
//! [`MemoryStore`] is the in-memory implementation. Durable backends are
//! expected to persist addresses in their canonical text form
//! (`Address::to_string` / `Address::parse`), which round-trips bit-exactly
//! for every non-ambiguous address.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::{PoisonError, RwLock};

use bitflags::bitflags;

use crate::address::Address;
use crate::depend::DependencySet;

bitflags! {
    /// Anomaly flags attached to a procedure record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProcFlags: u8 {
        /// The procedure contains a structured jump-table dispatch.
        const HAS_SWITCH = 1 << 0;
        /// Jump-table inference terminated abnormally or hit a manual limit.
        const SUSPICIOUS_SWITCH = 1 << 1;
        /// Contains an unresolved dispatch, STOP/HALT, an unresolvable jump,
        /// or range analysis logged a conflict.
        const HAS_SUSPICIOUS_INSTR = 1 << 2;
        /// Contains a NOP.
        const HAS_NOP = 1 << 3;
        /// Contains a call whose target could not be resolved.
        const HAS_AMBIGUOUS_CALLS = 1 << 4;
    }
}

/// Classification of a record. Reserved for distinguishing non-procedure
/// entries in future store contents; analysis currently only publishes
/// procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcKind {
    /// An analyzed procedure.
    #[default]
    Procedure,
}

/// The published analysis result for one procedure.
#[derive(Debug, Clone)]
pub struct ProcRecord {
    /// Entry address.
    pub addr: Address,
    /// Record classification.
    pub kind: ProcKind,
    /// The procedure's calling contract (flag reads stripped).
    pub dependency_set: DependencySet,
    /// Anomaly flags.
    pub flags: ProcFlags,
    /// Extent in bytes.
    pub byte_length: u16,
    /// Direct call targets.
    pub calls: BTreeSet<Address>,
    /// Tail-call targets.
    pub tail_calls: BTreeSet<Address>,
    /// Memory addresses read.
    pub mem_reads: BTreeSet<Address>,
    /// Memory addresses written.
    pub mem_writes: BTreeSet<Address>,
}

impl ProcRecord {
    /// The pessimistic default for an unanalyzed address: unknown
    /// dependency set, assumed-ambiguous calls, no known extent.
    #[must_use]
    pub fn unknown(addr: Address) -> Self {
        ProcRecord {
            addr,
            kind: ProcKind::Procedure,
            dependency_set: DependencySet::unknown(),
            flags: ProcFlags::HAS_AMBIGUOUS_CALLS,
            byte_length: 0,
            calls: BTreeSet::new(),
            tail_calls: BTreeSet::new(),
            mem_reads: BTreeSet::new(),
            mem_writes: BTreeSet::new(),
        }
    }
}

/// Shared store of per-procedure analysis records.
///
/// `put` must replace the whole record atomically - call edges from a
/// half-written record would corrupt the derived call graph.
pub trait CrossReferenceStore: Send + Sync {
    /// The record for `addr`, or the pessimistic default when unanalyzed.
    fn get(&self, addr: Address) -> ProcRecord;

    /// Whether a record exists for `addr`.
    fn contains(&self, addr: Address) -> bool;

    /// Atomically replaces the record for `record.addr`.
    fn put(&self, record: ProcRecord);

    /// All recorded procedure addresses, ascending.
    fn all_entries(&self) -> Vec<Address>;

    /// Recorded procedure addresses in one bank, ascending.
    fn entries_in_bank(&self, bank: u16) -> Vec<Address>;

    /// The first recorded procedure address strictly after `addr`.
    fn next_owned_address_after(&self, addr: Address) -> Option<Address>;

    /// Derived reverse call edges: procedures whose calls or tail calls
    /// target `addr`.
    fn callers_of(&self, addr: Address) -> Vec<Address>;
}

/// In-memory [`CrossReferenceStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    procs: RwLock<BTreeMap<Address, ProcRecord>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

impl CrossReferenceStore for MemoryStore {
    fn get(&self, addr: Address) -> ProcRecord {
        self.procs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&addr)
            .cloned()
            .unwrap_or_else(|| ProcRecord::unknown(addr))
    }

    fn contains(&self, addr: Address) -> bool {
        self.procs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&addr)
    }

    fn put(&self, record: ProcRecord) {
        self.procs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.addr, record);
    }

    fn all_entries(&self) -> Vec<Address> {
        self.procs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    fn entries_in_bank(&self, bank: u16) -> Vec<Address> {
        self.procs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|a| a.bank() == bank)
            .copied()
            .collect()
    }

    fn next_owned_address_after(&self, addr: Address) -> Option<Address> {
        self.procs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .range((Bound::Excluded(addr), Bound::Unbounded))
            .next()
            .map(|(a, _)| *a)
    }

    fn callers_of(&self, addr: Address) -> Vec<Address> {
        self.procs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.calls.contains(&addr) || r.tail_calls.contains(&addr))
            .map(|r| r.addr)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::RegSet;

    fn record(addr: Address) -> ProcRecord {
        let mut record = ProcRecord::unknown(addr);
        record.flags = ProcFlags::empty();
        record.dependency_set = DependencySet::new(RegSet::A, RegSet::B);
        record
    }

    #[test]
    fn missing_records_are_pessimistic() {
        let store = MemoryStore::new();
        let addr = Address::from_virtual(0x0150);
        assert!(!store.contains(addr));
        let unknown = store.get(addr);
        assert_eq!(unknown.dependency_set, DependencySet::unknown());
        assert!(unknown.flags.contains(ProcFlags::HAS_AMBIGUOUS_CALLS));
    }

    #[test]
    fn put_replaces_whole_record() {
        let store = MemoryStore::new();
        let addr = Address::from_virtual(0x0150);
        let mut first = record(addr);
        first.calls.insert(Address::from_virtual(0x0200));
        store.put(first);
        assert_eq!(store.get(addr).calls.len(), 1);

        // Replacing drops the previous edges entirely.
        store.put(record(addr));
        assert!(store.get(addr).calls.is_empty());
    }

    #[test]
    fn ordered_queries() {
        let store = MemoryStore::new();
        let home = Address::from_virtual(0x0150);
        let banked = Address::from_virtual_and_bank(0x4100, 3);
        store.put(record(banked));
        store.put(record(home));

        assert_eq!(store.all_entries(), vec![home, banked]);
        assert_eq!(store.entries_in_bank(3), vec![banked]);
        assert_eq!(
            store.next_owned_address_after(Address::from_virtual(0)),
            Some(home)
        );
        assert_eq!(store.next_owned_address_after(home), Some(banked));
        assert_eq!(store.next_owned_address_after(banked), None);
    }

    #[test]
    fn derived_callers() {
        let store = MemoryStore::new();
        let caller = Address::from_virtual(0x0150);
        let callee = Address::from_virtual(0x0200);
        let mut r = record(caller);
        r.calls.insert(callee);
        store.put(r);
        assert_eq!(store.callers_of(callee), vec![caller]);
        assert!(store.callers_of(caller).is_empty());
    }
}
