//! Register, flag and condition alphabet.
//!
//! Dependency tracking works over *atomic* locations: the eight-bit CPU
//! registers, the four flags, the stack pointer, a `mem` bucket for memory,
//! the tracked bank register and a side-effect marker. Register pairs are a
//! view over two atomic registers and are split on entry to any dependency
//! set ([`Reg::deps`]) and re-joined only for display ([`RegSet::join_names`]).

use std::str::FromStr;

use bitflags::bitflags;
use strum::{Display, EnumString};

bitflags! {
    /// A set of atomic register, flag and memory locations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RegSet: u16 {
        /// Register B.
        const B = 1 << 0;
        /// Register C.
        const C = 1 << 1;
        /// Register D.
        const D = 1 << 2;
        /// Register E.
        const E = 1 << 3;
        /// Register H.
        const H = 1 << 4;
        /// Register L.
        const L = 1 << 5;
        /// The accumulator.
        const A = 1 << 6;
        /// The stack pointer (tracked as one 16-bit location).
        const SP = 1 << 7;
        /// Zero flag.
        const FZ = 1 << 8;
        /// Carry flag.
        const FC = 1 << 9;
        /// Subtract flag.
        const FN = 1 << 10;
        /// Half-carry flag.
        const FH = 1 << 11;
        /// The memory bucket: any dereference read or write.
        const MEM = 1 << 12;
        /// The tracked ROM bank selection.
        const ROMBANK = 1 << 13;
        /// The interrupt master enable.
        const IME = 1 << 14;
        /// Marker for operations whose effect escapes the register model
        /// (control transfers, HALT, ...). Never prunable.
        const SIDE_EFFECTS = 1 << 15;
    }
}

impl RegSet {
    /// All four condition flags.
    pub const FLAGS: RegSet = RegSet::FZ
        .union(RegSet::FC)
        .union(RegSet::FN)
        .union(RegSet::FH);

    /// The full tracked alphabet used by dependency analysis: every register
    /// and flag, `mem` and the bank register. Excludes the IME and
    /// side-effect markers, which only tag individual instructions.
    #[must_use]
    pub const fn tracked() -> RegSet {
        RegSet::B
            .union(RegSet::C)
            .union(RegSet::D)
            .union(RegSet::E)
            .union(RegSet::H)
            .union(RegSet::L)
            .union(RegSet::A)
            .union(RegSet::SP)
            .union(RegSet::FLAGS)
            .union(RegSet::MEM)
            .union(RegSet::ROMBANK)
    }

    /// Resolves an effect-table name to its atomic location set.
    ///
    /// Pairs split (`"BC"` to `B | C`), `"AF"` covers only the accumulator,
    /// negated conditions resolve to their flag, and the `mem` /
    /// `sideeffects` markers map to their buckets.
    #[must_use]
    pub fn from_name(name: &str) -> Option<RegSet> {
        Some(match name {
            "mem" => RegSet::MEM,
            "sideeffects" => RegSet::SIDE_EFFECTS,
            "FNZ" => RegSet::FZ,
            "FNC" => RegSet::FC,
            _ => match Reg::from_str(name) {
                Ok(reg) => reg.deps(),
                Err(_) => match name {
                    "FZ" => RegSet::FZ,
                    "FC" => RegSet::FC,
                    "FN" => RegSet::FN,
                    "FH" => RegSet::FH,
                    _ => return None,
                },
            },
        })
    }

    /// Renders the set as display names, re-joining complete pairs
    /// (`B | C` becomes `"BC"`), in a fixed alphabetical order.
    #[must_use]
    pub fn join_names(&self) -> Vec<String> {
        let mut rest = *self;
        let mut names = Vec::new();
        for (pair, bits) in [
            ("BC", RegSet::B.union(RegSet::C)),
            ("DE", RegSet::D.union(RegSet::E)),
            ("HL", RegSet::H.union(RegSet::L)),
        ] {
            if rest.contains(bits) {
                rest.remove(bits);
                names.push(pair.to_string());
            }
        }
        for (name, bit) in [
            ("A", RegSet::A),
            ("B", RegSet::B),
            ("C", RegSet::C),
            ("D", RegSet::D),
            ("E", RegSet::E),
            ("H", RegSet::H),
            ("L", RegSet::L),
            ("SP", RegSet::SP),
            ("FZ", RegSet::FZ),
            ("FC", RegSet::FC),
            ("FN", RegSet::FN),
            ("FH", RegSet::FH),
            ("IME", RegSet::IME),
            ("ROMBANK", RegSet::ROMBANK),
            ("mem", RegSet::MEM),
            ("sideeffects", RegSet::SIDE_EFFECTS),
        ] {
            if rest.contains(bit) {
                names.push(name.to_string());
            }
        }
        names.sort();
        names
    }

    /// Returns the set as registers, re-joining complete pairs, in a fixed
    /// order. `MEM`, `IME` and `SIDE_EFFECTS` are not included.
    #[must_use]
    pub fn join_regs(&self) -> Vec<Reg> {
        let mut rest = *self;
        let mut regs = Vec::new();
        for pair in [Reg::Bc, Reg::De, Reg::Hl] {
            if rest.contains(pair.deps()) {
                rest.remove(pair.deps());
                regs.push(pair);
            }
        }
        regs.extend(rest.iter_regs());
        regs
    }

    /// Iterates the atomic single registers and flags in the set, in bit
    /// order. `MEM`, `IME` and `SIDE_EFFECTS` are not included.
    pub fn iter_regs(&self) -> impl Iterator<Item = Reg> + '_ {
        [
            (RegSet::B, Reg::B),
            (RegSet::C, Reg::C),
            (RegSet::D, Reg::D),
            (RegSet::E, Reg::E),
            (RegSet::H, Reg::H),
            (RegSet::L, Reg::L),
            (RegSet::A, Reg::A),
            (RegSet::SP, Reg::Sp),
            (RegSet::FZ, Reg::Fz),
            (RegSet::FC, Reg::Fc),
            (RegSet::FN, Reg::Fn),
            (RegSet::FH, Reg::Fh),
            (RegSet::ROMBANK, Reg::RomBank),
        ]
        .into_iter()
        .filter(|(bit, _)| self.contains(*bit))
        .map(|(_, reg)| reg)
    }
}

/// A CPU register, flag or pseudo-register as it appears in decoded operands.
///
/// Pairs are first-class here because instructions name them; dependency sets
/// always see them split via [`Reg::deps`]. `ROMBANK` is the pseudo-register
/// the dataflow engine uses to track the selected bank, `IME` the interrupt
/// enable written by DI/EI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString)]
pub enum Reg {
    /// Register B.
    B,
    /// Register C.
    C,
    /// Register D.
    D,
    /// Register E.
    E,
    /// Register H.
    H,
    /// Register L.
    L,
    /// The accumulator.
    A,
    /// The stack pointer.
    #[strum(serialize = "SP")]
    Sp,
    /// Zero flag as a value location.
    #[strum(serialize = "FZ")]
    Fz,
    /// Carry flag as a value location.
    #[strum(serialize = "FC")]
    Fc,
    /// Subtract flag as a value location.
    #[strum(serialize = "FN")]
    Fn,
    /// Half-carry flag as a value location.
    #[strum(serialize = "FH")]
    Fh,
    /// Register pair BC.
    #[strum(serialize = "BC")]
    Bc,
    /// Register pair DE.
    #[strum(serialize = "DE")]
    De,
    /// Register pair HL.
    #[strum(serialize = "HL")]
    Hl,
    /// Register pair AF.
    #[strum(serialize = "AF")]
    Af,
    /// Pseudo-register tracking the selected ROM bank.
    #[strum(serialize = "ROMBANK")]
    RomBank,
    /// Interrupt master enable.
    #[strum(serialize = "IME")]
    Ime,
}

impl Reg {
    /// Returns the atomic locations this register covers.
    ///
    /// Pairs split into both halves; `AF` covers only the accumulator (flag
    /// effects are always spelled out separately in the effect tables).
    #[must_use]
    pub const fn deps(&self) -> RegSet {
        match self {
            Reg::B => RegSet::B,
            Reg::C => RegSet::C,
            Reg::D => RegSet::D,
            Reg::E => RegSet::E,
            Reg::H => RegSet::H,
            Reg::L => RegSet::L,
            Reg::A | Reg::Af => RegSet::A,
            Reg::Sp => RegSet::SP,
            Reg::Fz => RegSet::FZ,
            Reg::Fc => RegSet::FC,
            Reg::Fn => RegSet::FN,
            Reg::Fh => RegSet::FH,
            Reg::Bc => RegSet::B.union(RegSet::C),
            Reg::De => RegSet::D.union(RegSet::E),
            Reg::Hl => RegSet::H.union(RegSet::L),
            Reg::RomBank => RegSet::ROMBANK,
            Reg::Ime => RegSet::IME,
        }
    }

    /// Returns the high and low halves of a true register pair.
    #[must_use]
    pub const fn halves(&self) -> Option<(Reg, Reg)> {
        match self {
            Reg::Bc => Some((Reg::B, Reg::C)),
            Reg::De => Some((Reg::D, Reg::E)),
            Reg::Hl => Some((Reg::H, Reg::L)),
            _ => None,
        }
    }

    /// Operand width in bits.
    #[must_use]
    pub const fn bits(&self) -> u8 {
        match self {
            Reg::Sp | Reg::Bc | Reg::De | Reg::Hl | Reg::Af => 16,
            Reg::Fz | Reg::Fc | Reg::Fn | Reg::Fh => 1,
            _ => 8,
        }
    }
}

/// A branch condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum Cond {
    /// Zero flag set.
    #[strum(serialize = "FZ")]
    Fz,
    /// Zero flag clear.
    #[strum(serialize = "FNZ")]
    Fnz,
    /// Carry flag set.
    #[strum(serialize = "FC")]
    Fc,
    /// Carry flag clear.
    #[strum(serialize = "FNC")]
    Fnc,
    /// Unconditional.
    #[strum(serialize = "ALWAYS")]
    Always,
}

impl Cond {
    /// Returns the logically negated condition. `ALWAYS` has no negation and
    /// is returned unchanged.
    #[must_use]
    pub const fn negated(&self) -> Cond {
        match self {
            Cond::Fz => Cond::Fnz,
            Cond::Fnz => Cond::Fz,
            Cond::Fc => Cond::Fnc,
            Cond::Fnc => Cond::Fc,
            Cond::Always => Cond::Always,
        }
    }

    /// Returns `true` for the unconditional condition.
    #[must_use]
    pub const fn always_true(&self) -> bool {
        matches!(self, Cond::Always)
    }

    /// The flag this condition reads; empty for `ALWAYS`.
    #[must_use]
    pub const fn deps(&self) -> RegSet {
        match self {
            Cond::Fz | Cond::Fnz => RegSet::FZ,
            Cond::Fc | Cond::Fnc => RegSet::FC,
            Cond::Always => RegSet::empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_split() {
        assert_eq!(Reg::Bc.deps(), RegSet::B | RegSet::C);
        assert_eq!(Reg::Af.deps(), RegSet::A);
        assert_eq!(Reg::Hl.halves(), Some((Reg::H, Reg::L)));
    }

    #[test]
    fn name_resolution() {
        assert_eq!(RegSet::from_name("HL"), Some(RegSet::H | RegSet::L));
        assert_eq!(RegSet::from_name("FNZ"), Some(RegSet::FZ));
        assert_eq!(RegSet::from_name("mem"), Some(RegSet::MEM));
        assert_eq!(RegSet::from_name("sideeffects"), Some(RegSet::SIDE_EFFECTS));
        assert_eq!(RegSet::from_name("bogus"), None);
    }

    #[test]
    fn join_names_repairs() {
        let set = RegSet::B | RegSet::C | RegSet::A | RegSet::MEM;
        assert_eq!(set.join_names(), vec!["A", "BC", "mem"]);

        // An incomplete pair stays split.
        let set = RegSet::B | RegSet::A;
        assert_eq!(set.join_names(), vec!["A", "B"]);
    }

    #[test]
    fn cond_negation() {
        assert_eq!(Cond::Fz.negated(), Cond::Fnz);
        assert_eq!(Cond::Fnc.negated(), Cond::Fc);
        assert!(Cond::Always.always_true());
        assert_eq!(Cond::Fnz.deps(), RegSet::FZ);
    }

    #[test]
    fn strum_roundtrip() {
        assert_eq!(Reg::from_str("ROMBANK").unwrap(), Reg::RomBank);
        assert_eq!(Reg::Sp.to_string(), "SP");
        assert_eq!(Cond::from_str("FNZ").unwrap(), Cond::Fnz);
    }
}
