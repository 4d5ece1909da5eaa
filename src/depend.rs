//! Dependency sets and their composition algebra.
//!
//! A [`DependencySet`] describes the externally observable effect of an
//! operation as a pair of read and write location sets. Two composition
//! operators cover all of structured control flow:
//!
//! - [`DependencySet::join`] for sequence: the second operation's reads are
//!   satisfied by the first's writes where possible.
//! - [`DependencySet::parallel`] for alternative paths: plain union on both
//!   sides.
//!
//! An unanalyzed callee contributes [`DependencySet::unknown`], the
//! pessimistic top element.

use std::fmt;
use std::str::FromStr;

use crate::registers::RegSet;
use crate::{Error, Result};

/// Read and write sets over the register/flag/memory alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DependencySet {
    /// Locations the operation consumes from its environment.
    pub reads: RegSet,
    /// Locations the operation defines.
    pub writes: RegSet,
}

impl DependencySet {
    /// Creates a dependency set from explicit read and write sets.
    #[must_use]
    pub const fn new(reads: RegSet, writes: RegSet) -> Self {
        DependencySet { reads, writes }
    }

    /// Sequential composition: `first` runs, then `second`.
    ///
    /// Reads of `second` already produced by `first` are absorbed:
    /// `reads = (second.reads - first.writes) | first.reads`,
    /// `writes = first.writes | second.writes`.
    #[must_use]
    pub fn join(first: DependencySet, second: DependencySet) -> Self {
        DependencySet {
            reads: (second.reads - first.writes) | first.reads,
            writes: first.writes | second.writes,
        }
    }

    /// Parallel composition for alternative branches: union on both sides.
    #[must_use]
    pub fn parallel(a: DependencySet, b: DependencySet) -> Self {
        DependencySet {
            reads: a.reads | b.reads,
            writes: a.writes | b.writes,
        }
    }

    /// The pessimistic default for an unknown callee: reads every tracked
    /// location except the flags, writes everything except the bank
    /// register.
    #[must_use]
    pub fn unknown() -> Self {
        DependencySet {
            reads: RegSet::tracked() - RegSet::FLAGS,
            writes: RegSet::tracked() - RegSet::ROMBANK,
        }
    }
}

impl fmt::Display for DependencySet {
    /// Canonical `reads -> writes` text, with pairs re-joined, suitable for
    /// persistence. The empty set on either side renders as nothing.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            self.reads.join_names().join(", "),
            self.writes.join_names().join(", ")
        )
    }
}

impl FromStr for DependencySet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Ok(DependencySet::default());
        }
        let (reads, writes) = s
            .split_once("->")
            .ok_or_else(|| Error::Malformed(s.to_string()))?;
        let parse_side = |side: &str| -> RegSet {
            side.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .filter_map(RegSet::from_name)
                .fold(RegSet::empty(), |acc, set| acc | set)
        };
        Ok(DependencySet {
            reads: parse_side(reads),
            writes: parse_side(writes),
        })
    }
}
