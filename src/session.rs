//! Analysis sessions and the batch driver.
//!
//! A [`Session`] owns everything mutable about an analysis run: the decoder
//! with its per-address cache, the cross-reference store handle, and the
//! manual [`AnalysisOverrides`]. Procedures are analyzed one at a time
//! through [`Session::analyze_procedure`]; [`Session::analyze_all`] drives a
//! whole-ROM batch over a growing worklist of call targets, fanning out per
//! procedure and checking cancellation only between procedures - an
//! in-flight analysis always runs to completion.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::address::Address;
use crate::analysis::procedure::{self, ProcedureAnalysis};
use crate::decoder::{DecodeServices, Disassembler};
use crate::registers::Reg;
use crate::rom::ByteSource;
use crate::xref::CrossReferenceStore;
use crate::Result;

/// A register-indirect call idiom: a fixed call target that is really a
/// dispatch thunk taking its destination in registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallIdiom {
    /// The thunk jumps to the address in a register pair.
    Register(Reg),
    /// The thunk switches to `bank` and jumps to `addr` (a long call).
    Long {
        /// Register holding the destination bank.
        bank: Reg,
        /// Register pair holding the destination address.
        addr: Reg,
    },
}

/// Manual analysis knowledge supplied per ROM.
///
/// Inference handles the common cases; these overrides carry the facts that
/// are genuinely undecidable from the image alone - jump tables with
/// misleading trailing bytes, dispatch thunks, which helper performs bank
/// switching, and entry points executed with a particular bank mapped.
#[derive(Debug, Clone, Default)]
pub struct AnalysisOverrides {
    /// Exact entry counts for jump tables the plausibility heuristic gets
    /// wrong. Keyed by table address.
    pub jumptable_limits: BTreeMap<Address, usize>,
    /// Register-indirect call idioms, keyed by the thunk's virtual address.
    pub call_idioms: BTreeMap<u16, CallIdiom>,
    /// Virtual address of the bank-switch helper: calling it with a
    /// constant accumulator selects that bank.
    pub bank_switch_proc: Option<u16>,
    /// Banks known to be mapped when specific entry points run, keyed by
    /// the entry's virtual address.
    pub initial_banks: BTreeMap<u16, u16>,
    /// Call targets that are unresolvable but known harmless; they do not
    /// mark the caller as having ambiguous calls.
    pub benign_ambiguous_calls: BTreeSet<u16>,
}

/// An analysis run over one ROM image.
pub struct Session {
    rom: Arc<dyn ByteSource>,
    store: Arc<dyn CrossReferenceStore>,
    disasm: Disassembler,
    overrides: AnalysisOverrides,
}

impl Session {
    /// Creates a session with default (empty) overrides.
    #[must_use]
    pub fn new(rom: Arc<dyn ByteSource>, store: Arc<dyn CrossReferenceStore>) -> Self {
        Self::with_overrides(rom, store, AnalysisOverrides::default())
    }

    /// Creates a session with manual analysis knowledge.
    #[must_use]
    pub fn with_overrides(
        rom: Arc<dyn ByteSource>,
        store: Arc<dyn CrossReferenceStore>,
        overrides: AnalysisOverrides,
    ) -> Self {
        Session {
            rom,
            store,
            disasm: Disassembler::new(),
            overrides,
        }
    }

    /// The session's cross-reference store.
    #[must_use]
    pub fn store(&self) -> &dyn CrossReferenceStore {
        &*self.store
    }

    /// The session's manual overrides.
    #[must_use]
    pub fn overrides(&self) -> &AnalysisOverrides {
        &self.overrides
    }

    fn services(&self) -> DecodeServices<'_> {
        DecodeServices {
            rom: &*self.rom,
            store: &*self.store,
            overrides: &self.overrides,
        }
    }

    /// Analyzes one procedure and publishes its record to the store.
    ///
    /// Safe to re-run: a later run observes any callee records published in
    /// between and produces at least as precise a result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AmbiguousAddress`](crate::Error::AmbiguousAddress)
    /// for an entry in the switchable window without a bank.
    pub fn analyze_procedure(&self, addr: Address) -> Result<ProcedureAnalysis> {
        let analysis = procedure::analyze(&self.disasm, &self.services(), addr)?;
        self.store.put(analysis.record.clone());
        Ok(analysis)
    }

    /// Analyzes every procedure reachable from `roots` by call edges.
    ///
    /// Runs in waves: each wave analyzes its worklist in parallel at
    /// procedure granularity, then enqueues newly discovered call targets.
    /// The decode cache is cleared between waves so the next wave observes
    /// the callee contracts just published. `cancel` is checked only
    /// between procedures; analyses already running complete normally.
    ///
    /// Returns the number of procedures analyzed. Individual failures are
    /// logged and skipped - no local anomaly aborts the batch.
    pub fn analyze_all(&self, roots: &[Address], cancel: &AtomicBool) -> usize {
        let mut pending: BTreeSet<Address> = roots
            .iter()
            .copied()
            .filter(|a| !a.is_ambiguous())
            .collect();
        let mut analyzed: BTreeSet<Address> = BTreeSet::new();
        let mut count = 0;

        while !pending.is_empty() && !cancel.load(Ordering::Relaxed) {
            let wave: Vec<Address> = pending.iter().copied().collect();
            pending.clear();

            let records: Vec<_> = wave
                .par_iter()
                .map(|addr| {
                    if cancel.load(Ordering::Relaxed) {
                        return None;
                    }
                    match procedure::analyze(&self.disasm, &self.services(), *addr) {
                        Ok(analysis) => {
                            self.store.put(analysis.record.clone());
                            Some(analysis.record)
                        }
                        Err(error) => {
                            tracing::warn!("skipping procedure at {addr}: {error}");
                            None
                        }
                    }
                })
                .collect();

            for record in records.into_iter().flatten() {
                count += 1;
                analyzed.insert(record.addr);
                for callee in record.calls.iter().chain(record.tail_calls.iter()) {
                    if !callee.is_ambiguous() && !analyzed.contains(callee) {
                        pending.insert(*callee);
                    }
                }
            }

            // Calls capture their callee's contract at decode time; fresh
            // decodes next wave pick up the records just published.
            self.disasm.clear_cache();
        }
        count
    }

    /// Drops the session's decode cache.
    pub fn clear_caches(&self) {
        self.disasm.clear_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::RegSet;
    use crate::rom::RomImage;
    use crate::xref::MemoryStore;

    fn session_over(bytes: &[u8]) -> Session {
        let mut data = bytes.to_vec();
        data.resize(0x4000, 0xD3); // unmatched filler keeps scans contained
        Session::new(
            Arc::new(RomImage::from_bytes(data)),
            Arc::new(MemoryStore::new()),
        )
    }

    #[test]
    fn analyze_publishes_record() {
        // LD A,1; RET
        let session = session_over(&[0x3E, 0x01, 0xC9]);
        let addr = Address::from_virtual(0);
        let analysis = session.analyze_procedure(addr).unwrap();
        assert_eq!(analysis.record.byte_length, 3);
        assert!(session.store().contains(addr));
        assert!(analysis
            .record
            .dependency_set
            .writes
            .contains(RegSet::A));
    }

    #[test]
    fn ambiguous_entry_is_rejected() {
        let session = session_over(&[0xC9]);
        assert!(session
            .analyze_procedure(Address::from_virtual(0x4100))
            .is_err());
    }

    #[test]
    fn batch_follows_call_edges() {
        // 0: CALL 0x0010; 3: RET ... 0x10: LD B,2; RET
        let mut bytes = vec![0xCD, 0x10, 0x00, 0xC9];
        bytes.resize(0x10, 0xD3);
        bytes.extend_from_slice(&[0x06, 0x02, 0xC9]);
        let session = session_over(&bytes);

        let cancel = AtomicBool::new(false);
        let count = session.analyze_all(&[Address::from_virtual(0)], &cancel);
        assert_eq!(count, 2);
        assert!(session.store().contains(Address::from_virtual(0x10)));
        let root = session.store().get(Address::from_virtual(0));
        assert_eq!(
            root.calls,
            BTreeSet::from([Address::from_virtual(0x10)])
        );
        assert_eq!(
            session.store().callers_of(Address::from_virtual(0x10)),
            vec![Address::from_virtual(0)]
        );
    }

    #[test]
    fn cancellation_stops_between_waves() {
        let session = session_over(&[0xCD, 0x10, 0x00, 0xC9]);
        let cancel = AtomicBool::new(true);
        let count = session.analyze_all(&[Address::from_virtual(0)], &cancel);
        assert_eq!(count, 0);
    }
}
