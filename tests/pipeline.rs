//! End-to-end pipeline behavior: value propagation, bank tracking,
//! dead-write elimination and store interplay.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use gbscope::prelude::*;

fn session_over(bytes: &[u8]) -> Session {
    let mut data = bytes.to_vec();
    data.resize(0x4000, 0xD3); // unmatched filler keeps scans contained
    Session::new(
        Arc::new(RomImage::from_bytes(data)),
        Arc::new(MemoryStore::new()),
    )
}

fn rendered(analysis: &ProcedureAnalysis) -> String {
    let mut renderer = TextRenderer::new();
    analysis.render(&mut renderer);
    renderer.into_string()
}

#[test]
fn forward_pass_folds_register_copies() {
    // LD A,1 ; LD B,A ; RET
    let session = session_over(&[0x3E, 0x01, 0x47, 0xC9]);
    let analysis = session
        .analyze_procedure(Address::from_virtual(0))
        .unwrap();

    let text = rendered(&analysis);
    assert!(text.contains("A = 1"), "got:\n{text}");
    assert!(text.contains("B = 1"), "got:\n{text}");
    // Both writes remain: A and B are visible at the return boundary.
    assert!(analysis
        .record
        .dependency_set
        .writes
        .contains(RegSet::A | RegSet::B));
    assert!(analysis.record.dependency_set.reads.is_empty());
}

#[test]
fn arithmetic_folds_through_the_tree() {
    // LD A,3 ; ADD A,4 ; RET - the ALU op decomposes into loads and the
    // accumulator write folds to a constant.
    let session = session_over(&[0x3E, 0x03, 0xC6, 0x04, 0xC9]);
    let analysis = session
        .analyze_procedure(Address::from_virtual(0))
        .unwrap();
    let text = rendered(&analysis);
    assert!(text.contains("A = 7"), "got:\n{text}");
}

#[test]
fn bank_switch_store_tracks_and_resolves_targets() {
    // LD A,5 ; LD [0x2100],A ; JP 0x4123
    // The store to the bank-switch port becomes a ROMBANK write, and the
    // otherwise ambiguous tail target picks up bank 5.
    let session = session_over(&[0x3E, 0x05, 0xEA, 0x00, 0x21, 0xC3, 0x23, 0x41]);
    let analysis = session
        .analyze_procedure(Address::from_virtual(0))
        .unwrap();

    let text = rendered(&analysis);
    assert!(text.contains("ROMBANK = 5"), "got:\n{text}");
    assert!(text.contains("0005:4123"), "got:\n{text}");

    let resolved = Address::from_virtual_and_bank(0x4123, 5);
    assert!(analysis.record.tail_calls.contains(&resolved));
    assert!(!analysis
        .record
        .flags
        .contains(ProcFlags::HAS_AMBIGUOUS_CALLS));
}

#[test]
fn unresolved_indirect_jump_is_flagged() {
    // JP HL with nothing known about HL.
    let session = session_over(&[0xE9]);
    let analysis = session
        .analyze_procedure(Address::from_virtual(0))
        .unwrap();
    assert!(analysis
        .record
        .flags
        .contains(ProcFlags::HAS_SUSPICIOUS_INSTR));
}

#[test]
fn callee_contract_feeds_the_caller() {
    // 0x10: LD B,2 ; RET - writes B, reads nothing.
    // 0x00: CALL 0x10 ; RET.
    let mut bytes = vec![0xCD, 0x10, 0x00, 0xC9];
    bytes.resize(0x10, 0xD3);
    bytes.extend_from_slice(&[0x06, 0x02, 0xC9]);
    let session = session_over(&bytes);

    // Analyzed in dependency order, the caller observes the callee's
    // published contract instead of the pessimistic default.
    let callee = session
        .analyze_procedure(Address::from_virtual(0x10))
        .unwrap();
    assert_eq!(callee.record.dependency_set.writes, RegSet::B);
    assert!(callee.record.dependency_set.reads.is_empty());

    session.clear_caches();
    let caller = session
        .analyze_procedure(Address::from_virtual(0))
        .unwrap();
    assert_eq!(caller.record.dependency_set.writes, RegSet::B);
    assert!(caller.record.dependency_set.reads.is_empty());
    assert!(caller.record.calls.contains(&Address::from_virtual(0x10)));
}

#[test]
fn unknown_callee_defaults_to_pessimistic_contract() {
    // CALL 0x10 with nothing at 0x10 analyzed yet.
    let mut bytes = vec![0xCD, 0x10, 0x00, 0xC9];
    bytes.resize(0x10, 0xD3);
    bytes.extend_from_slice(&[0x06, 0x02, 0xC9]);
    let session = session_over(&bytes);
    let caller = session
        .analyze_procedure(Address::from_virtual(0))
        .unwrap();
    // The unknown callee contributes reads of everything-but-flags.
    assert!(caller
        .record
        .dependency_set
        .reads
        .contains(RegSet::A | RegSet::B | RegSet::MEM));
}

#[test]
fn batch_driver_reaches_fixpoint_facts() {
    let mut bytes = vec![0xCD, 0x10, 0x00, 0xC9];
    bytes.resize(0x10, 0xD3);
    bytes.extend_from_slice(&[0x06, 0x02, 0xC9]);
    let session = session_over(&bytes);

    let cancel = AtomicBool::new(false);
    let analyzed = session.analyze_all(&[Address::from_virtual(0)], &cancel);
    assert_eq!(analyzed, 2);

    // Re-running the root alone now sees the callee's contract.
    session.clear_caches();
    let caller = session
        .analyze_procedure(Address::from_virtual(0))
        .unwrap();
    assert_eq!(caller.record.dependency_set.writes, RegSet::B);
}

#[test]
fn memory_edges_are_recorded() {
    // LD A,[0xC123] ; LD [0xC456],A ; RET
    let session = session_over(&[0xFA, 0x23, 0xC1, 0xEA, 0x56, 0xC4, 0xC9]);
    let analysis = session
        .analyze_procedure(Address::from_virtual(0))
        .unwrap();
    assert!(analysis
        .record
        .mem_reads
        .contains(&Address::from_virtual(0xC123)));
    assert!(analysis
        .record
        .mem_writes
        .contains(&Address::from_virtual(0xC456)));
}

#[test]
fn overlapping_reanalysis_is_stable() {
    // Analyzing the same procedure twice replaces its record atomically.
    let session = session_over(&[0x3E, 0x01, 0xC9]);
    let addr = Address::from_virtual(0);
    let first = session.analyze_procedure(addr).unwrap();
    let second = session.analyze_procedure(addr).unwrap();
    assert_eq!(first.record.byte_length, second.record.byte_length);
    assert_eq!(
        first.record.dependency_set,
        second.record.dependency_set
    );
    assert_eq!(session.store().all_entries(), vec![addr]);
}
