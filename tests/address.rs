//! Address space properties.

use gbscope::{Address, BANK_SIZE};
use proptest::prelude::*;

proptest! {
    #[test]
    fn physical_roundtrip(physical in 0usize..0x8_0000) {
        let addr = Address::from_physical(physical);
        prop_assert_eq!(addr.physical().unwrap(), physical);
    }

    #[test]
    fn canonical_text_roundtrip(virt in 0u16.., bank in 0u16..0x200) {
        let addr = if (BANK_SIZE..2 * BANK_SIZE).contains(&virt) {
            Address::from_virtual_and_bank(virt, bank)
        } else {
            Address::from_virtual(virt)
        };
        // Holds for ambiguous addresses too: "(A):OFFS" parses back
        // bit-exactly.
        prop_assert_eq!(Address::parse(&addr.to_string()).unwrap(), addr);
    }

    #[test]
    fn banked_window_requires_bank(virt in 0x4000u16..0x8000, bank in 1u16..0x200) {
        let banked = Address::from_virtual_and_bank(virt, bank);
        prop_assert_eq!(banked.bank(), bank);
        prop_assert!(!banked.is_ambiguous());
        prop_assert!(banked.physical().is_ok());

        let bare = Address::from_virtual(virt);
        prop_assert!(bare.is_ambiguous());
        prop_assert!(bare.physical().is_err());
    }

    #[test]
    fn offset_preserves_bank_context(virt in 0x4000u16..0x7F00, bank in 1u16..0x20, delta in 0i32..0x100) {
        let addr = Address::from_virtual_and_bank(virt, bank);
        let moved = addr.offset(delta);
        if moved.in_banked_window() {
            prop_assert_eq!(moved.bank(), bank);
        } else {
            prop_assert_eq!(moved.bank(), 0);
        }
    }
}

#[test]
fn home_bank_is_physical() {
    for virt in [0u16, 0x0150, 0x3FFF] {
        let addr = Address::from_virtual(virt);
        assert!(!addr.is_ambiguous());
        assert_eq!(addr.physical().unwrap(), virt as usize);
    }
}
