//! Opcode effect expressions.
//!
//! Each decode rule carries an effect of the form
//! `read: A #S  write: FC:c_add(A, #S); A:(A + #S); FH; FZ:(A == 0); FN:0;`.
//! The read side is a list of locations, the write side a `;`-separated list
//! of locations, each optionally annotated with a value template describing
//! the written value. Placeholders (`#S`, `#R`, ...) expand per decode, and
//! the `[HL]` cell placeholder contributes the memory bucket plus an `HL`
//! read on either side.

use std::collections::HashMap;
use std::str::FromStr;

use crate::decoder::template::{placeholder, Template, TemplateEnv};
use crate::operand::Operand;
use crate::registers::{Reg, RegSet};

#[derive(Debug, Clone)]
enum EffectItem {
    /// A literal location name from the rule text.
    Name(&'static str),
    /// A wildcard placeholder letter.
    Placeholder(char),
}

impl EffectItem {
    fn parse(text: &'static str) -> EffectItem {
        match text.strip_prefix('#') {
            Some(rest) => EffectItem::Placeholder(rest.chars().next().unwrap_or('?')),
            None => EffectItem::Name(text),
        }
    }
}

#[derive(Debug, Clone)]
struct WriteSpec {
    target: EffectItem,
    /// Dereference cell targets (`[HL]`) pre-parsed as templates.
    deref: Option<Template>,
    value: Option<Template>,
}

/// Parsed effect expression of one decode rule.
#[derive(Debug, Clone)]
pub(crate) struct EffectTemplate {
    reads: Vec<EffectItem>,
    writes: Vec<WriteSpec>,
}

impl EffectTemplate {
    /// Parses the `read: ... write: ...` clause; `None` for malformed text.
    pub(crate) fn parse(text: &'static str) -> Option<EffectTemplate> {
        let rest = text.trim().strip_prefix("read:")?;
        let (reads_text, writes_text) = rest.split_once("write:")?;

        let reads = reads_text
            .split_whitespace()
            .map(EffectItem::parse)
            .collect();

        let mut writes = Vec::new();
        for entry in writes_text.split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (name, value) = match entry.split_once(':') {
                Some((name, value)) => (name.trim(), Some(Template::parse(value)?)),
                None => (entry, None),
            };
            let deref = if name.starts_with('[') {
                Some(Template::parse(name)?)
            } else {
                None
            };
            writes.push(WriteSpec {
                target: EffectItem::parse(name),
                deref,
                value,
            });
        }
        Some(EffectTemplate { reads, writes })
    }

    /// Expands the effect for one decode: concrete read and write sets plus
    /// the ordered `(target, value)` assignments for writes with a known
    /// value.
    pub(crate) fn filled(
        &self,
        params: &HashMap<char, u8>,
        env: &TemplateEnv<'_>,
    ) -> (RegSet, RegSet, Vec<(Operand, Operand)>) {
        let mut reads = RegSet::empty();
        let mut writes = RegSet::empty();
        let mut loads = Vec::new();

        for item in &self.reads {
            match item {
                EffectItem::Name(name) => {
                    if let Some(set) = RegSet::from_name(name) {
                        reads |= set;
                    }
                }
                EffectItem::Placeholder(letter) => {
                    let value = params.get(letter).copied().unwrap_or(0);
                    match placeholder(*letter, value) {
                        Some(Operand::Dereference(_)) => {
                            reads |= RegSet::MEM | Reg::Hl.deps();
                        }
                        Some(operand) => reads |= operand.dependencies(),
                        None => {}
                    }
                }
            }
        }

        for spec in &self.writes {
            let target: Option<Operand> = match &spec.target {
                EffectItem::Name(name) => {
                    if let Some(deref) = &spec.deref {
                        writes |= RegSet::MEM;
                        Some(deref.eval(env))
                    } else {
                        if let Some(set) = RegSet::from_name(name) {
                            writes |= set;
                        }
                        Reg::from_str(name).ok().map(Operand::Register)
                    }
                }
                EffectItem::Placeholder(letter) => {
                    let value = params.get(letter).copied().unwrap_or(0);
                    match placeholder(*letter, value) {
                        Some(operand @ Operand::Dereference(_)) => {
                            writes |= RegSet::MEM;
                            reads |= Reg::Hl.deps();
                            Some(operand)
                        }
                        Some(operand @ Operand::Register(reg)) => {
                            writes |= reg.deps();
                            Some(operand)
                        }
                        _ => None,
                    }
                }
            };
            if let (Some(target), Some(value)) = (target, &spec.value) {
                loads.push((target, value.eval(env)));
            }
        }

        (reads, writes, loads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::decoder::template::standard_env;

    fn fill(
        text: &'static str,
        params: &[(char, u8)],
    ) -> (RegSet, RegSet, Vec<(Operand, Operand)>) {
        let params: HashMap<char, u8> = params.iter().copied().collect();
        let effect = EffectTemplate::parse(text).expect("effect parses");
        let env = standard_env(&params, 0, Address::from_virtual(0x0150));
        effect.filled(&params, &env)
    }

    #[test]
    fn add_register() {
        // ADD A, #S with S = B
        let (reads, writes, loads) = fill(
            "read: A #S write: FC:c_add(A, #S); A:(A + #S); FH; FZ:(A == 0); FN:0;",
            &[('S', 0)],
        );
        assert_eq!(reads, RegSet::A | RegSet::B);
        assert_eq!(
            writes,
            RegSet::FC | RegSet::A | RegSet::FH | RegSet::FZ | RegSet::FN
        );
        // FC, A, FZ and FN carry values; FH does not.
        assert_eq!(loads.len(), 4);
        assert_eq!(loads[1].0, Operand::Register(Reg::A));
        assert_eq!(loads[1].1.to_string(), "A + B");
    }

    #[test]
    fn hl_cell_placeholder() {
        // INC [HL]: reads and writes go through memory plus the pointer.
        let (reads, writes, _) = fill(
            "read: #S write: #S:(#S + 1); FZ:(#S == 0); FH; FN:0;",
            &[('S', 6)],
        );
        assert!(reads.contains(RegSet::MEM | RegSet::H | RegSet::L));
        assert!(writes.contains(RegSet::MEM));
    }

    #[test]
    fn explicit_cell_write() {
        // LDI [HL], A
        let (reads, writes, loads) = fill(
            "read: A HL write: [HL]:A; HL:HL +. 1; mem;",
            &[],
        );
        assert_eq!(reads, RegSet::A | RegSet::H | RegSet::L);
        assert!(writes.contains(RegSet::MEM | RegSet::H | RegSet::L));
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[0].0.to_string(), "[HL]");
        assert_eq!(loads[1].1.to_string(), "HL +. 1");
    }

    #[test]
    fn empty_write_side() {
        let (reads, writes, loads) = fill("read: write:", &[]);
        assert!(reads.is_empty());
        assert!(writes.is_empty());
        assert!(loads.is_empty());
    }

    #[test]
    fn side_effect_marker() {
        let (_, writes, _) = fill("read: write: sideeffects;", &[]);
        assert!(writes.contains(RegSet::SIDE_EFFECTS));
    }
}
