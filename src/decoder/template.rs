//! Operand template expressions.
//!
//! Rule tables describe operands and effect values in a tiny expression
//! language: registers, wildcard placeholders (`#S`), decode pseudo-values
//! (`v8`, `v16`, `FF00_v8`, `v8_rel`), dereferences (`[...]`), the binary
//! operators of the algebra and a handful of named functions
//! (`push`, `popval`, `popst`, `c_add`, `add16`).
//!
//! Templates are parsed once at dispatcher construction into a small AST and
//! evaluated per decode against a [`TemplateEnv`], producing already-folded
//! [`Operand`] trees.

use std::collections::HashMap;
use std::str::FromStr;

use crate::address::Address;
use crate::operand::{BinaryOp, FuncOp, Operand};
use crate::registers::{Cond, Reg, RegSet};

/// Parsed template expression.
#[derive(Debug, Clone)]
pub(crate) enum Template {
    Number(u16),
    Ident(String),
    Deref(Box<Template>),
    Binary {
        op: BinaryOp,
        left: Box<Template>,
        right: Box<Template>,
    },
    Func { op: FuncOp, args: Vec<Template> },
}

/// Per-decode bindings for template evaluation.
pub(crate) struct TemplateEnv<'a> {
    /// Pseudo-value bindings: `v8`, `v16`, `FF00_v8`, `v8_rel`.
    pub values: HashMap<&'static str, Operand>,
    /// Wildcard letter values extracted from the opcode byte.
    pub params: &'a HashMap<char, u8>,
    /// Bank context of the decode position, when known.
    pub bank: Option<u16>,
}

/// Resolves a wildcard placeholder letter to its operand.
pub(crate) fn placeholder(letter: char, value: u8) -> Option<Operand> {
    let value = value as usize;
    match letter {
        'R' => [Reg::Bc, Reg::De, Reg::Hl, Reg::Sp]
            .get(value)
            .map(|r| Operand::Register(*r)),
        'Q' => [Reg::Bc, Reg::De, Reg::Hl, Reg::Af]
            .get(value)
            .map(|r| Operand::Register(*r)),
        'S' | 'Z' => match value {
            6 => Some(Operand::Dereference(Box::new(Operand::Register(Reg::Hl)))),
            _ => [Reg::B, Reg::C, Reg::D, Reg::E, Reg::H, Reg::L]
                .get(value)
                .copied()
                .or(if value == 7 { Some(Reg::A) } else { None })
                .map(Operand::Register),
        },
        'F' => [Cond::Fnz, Cond::Fz, Cond::Fnc, Cond::Fc]
            .get(value)
            .map(|c| Operand::Condition(*c)),
        'N' => Some(Operand::Constant(value as u16 * 0x08)),
        'I' => Some(Operand::Constant(value as u16)),
        _ => None,
    }
}

impl Template {
    /// Parses a template expression; `None` for malformed text.
    pub(crate) fn parse(text: &str) -> Option<Template> {
        let tokens = tokenize(text)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expression()?;
        if parser.pos == parser.tokens.len() {
            Some(expr)
        } else {
            None
        }
    }

    /// Evaluates the template against a decode environment, folding as it
    /// goes. Unknown identifiers degrade to opaque values rather than
    /// failing the decode.
    pub(crate) fn eval(&self, env: &TemplateEnv<'_>) -> Operand {
        match self {
            Template::Number(v) => Operand::Constant(*v),
            Template::Ident(name) => resolve_ident(name, env),
            Template::Deref(target) => {
                let deref = Operand::deref(target.eval(env), None);
                // Constant targets in the switchable window pick up the
                // decode position's bank.
                if let (Operand::Dereference(inner), Some(bank)) = (&deref, env.bank) {
                    if let Operand::Addr { kind, addr } = inner.as_ref() {
                        if addr.is_ambiguous() {
                            return Operand::Dereference(Box::new(Operand::addr(
                                *kind,
                                addr.with_bank(bank),
                            )));
                        }
                    }
                }
                deref
            }
            Template::Binary { op, left, right } => {
                Operand::binary(*op, left.eval(env), right.eval(env))
            }
            Template::Func { op, args } => {
                Operand::func(*op, args.iter().map(|a| a.eval(env)).collect())
            }
        }
    }
}

fn resolve_ident(name: &str, env: &TemplateEnv<'_>) -> Operand {
    if let Some(value) = env.values.get(name) {
        return value.clone();
    }
    if let Some(letter) = name.strip_prefix('#') {
        let letter = letter.chars().next().unwrap_or('?');
        let value = env.params.get(&letter).copied().unwrap_or(0);
        if let Some(operand) = placeholder(letter, value) {
            return operand;
        }
    }
    if let Ok(reg) = Reg::from_str(name) {
        return Operand::Register(reg);
    }
    tracing::warn!("unresolved template identifier '{name}'");
    Operand::Complex {
        hint: "template",
        deps: RegSet::empty(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(u16),
    Op(BinaryOp),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

fn tokenize(text: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '#' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '#' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            c if c.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() {
                        digits.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = if let Some(hex) = digits.strip_prefix("0x") {
                    u16::from_str_radix(hex, 16).ok()?
                } else {
                    digits.parse().ok()?
                };
                tokens.push(Token::Number(value));
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '&' => {
                chars.next();
                tokens.push(Token::Op(BinaryOp::And));
            }
            '|' => {
                chars.next();
                tokens.push(Token::Op(BinaryOp::Or));
            }
            '^' => {
                chars.next();
                tokens.push(Token::Op(BinaryOp::Xor));
            }
            '+' => {
                chars.next();
                if chars.peek() == Some(&'.') {
                    chars.next();
                    tokens.push(Token::Op(BinaryOp::Add16));
                } else {
                    tokens.push(Token::Op(BinaryOp::Add));
                }
            }
            '-' => {
                chars.next();
                if chars.peek() == Some(&'.') {
                    chars.next();
                    tokens.push(Token::Op(BinaryOp::Sub16));
                } else {
                    tokens.push(Token::Op(BinaryOp::Sub));
                }
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return None;
                }
                tokens.push(Token::Op(BinaryOp::Equals));
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'<') {
                    chars.next();
                    tokens.push(Token::Op(BinaryOp::Shl));
                } else {
                    tokens.push(Token::Op(BinaryOp::Less));
                }
            }
            '>' => {
                chars.next();
                if chars.next() != Some('>') {
                    return None;
                }
                tokens.push(Token::Op(BinaryOp::Shr));
            }
            _ => return None,
        }
    }
    Some(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: &Token) -> Option<()> {
        if self.next().as_ref() == Some(token) {
            Some(())
        } else {
            None
        }
    }

    // All binary operators share one precedence level and associate left.
    fn expression(&mut self) -> Option<Template> {
        let mut left = self.term()?;
        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.term()?;
            left = Template::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Some(left)
    }

    fn term(&mut self) -> Option<Template> {
        match self.next()? {
            Token::Number(v) => Some(Template::Number(v)),
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(&Token::RParen)?;
                Some(inner)
            }
            Token::LBracket => {
                let inner = self.expression()?;
                self.expect(&Token::RBracket)?;
                Some(Template::Deref(Box::new(inner)))
            }
            Token::Ident(name) => {
                let func = match name.as_str() {
                    "push" => Some((FuncOp::Push, 2)),
                    "popval" => Some((FuncOp::PopValue, 1)),
                    "popst" => Some((FuncOp::PopStack, 1)),
                    "c_add" => Some((FuncOp::CarryAdd, 2)),
                    _ => None,
                };
                if name == "add16" || func.is_some() {
                    self.expect(&Token::LParen)?;
                    let mut args = vec![self.expression()?];
                    while self.peek() == Some(&Token::Comma) {
                        self.pos += 1;
                        args.push(self.expression()?);
                    }
                    self.expect(&Token::RParen)?;
                    if name == "add16" {
                        if args.len() != 2 {
                            return None;
                        }
                        let right = args.pop()?;
                        let left = args.pop()?;
                        return Some(Template::Binary {
                            op: BinaryOp::Add16,
                            left: Box::new(left),
                            right: Box::new(right),
                        });
                    }
                    let (op, arity) = func?;
                    if args.len() != arity {
                        return None;
                    }
                    return Some(Template::Func { op, args });
                }
                Some(Template::Ident(name))
            }
            _ => None,
        }
    }
}

/// Builds the standard pseudo-value bindings for one decode.
pub(crate) fn standard_env<'a>(
    params: &'a HashMap<char, u8>,
    argument: u16,
    next_addr: Address,
) -> TemplateEnv<'a> {
    let mut values: HashMap<&'static str, Operand> = HashMap::new();
    values.insert("v8", Operand::Constant(argument));
    values.insert("v16", Operand::Constant(argument));
    values.insert("FF00_v8", Operand::Constant(0xFF00 + (argument & 0xFF)));
    // Relative targets are signed 8-bit displacements from the following
    // instruction.
    let mut displacement = i32::from(argument & 0xFF);
    if displacement & 0x80 != 0 {
        displacement -= 0x100;
    }
    values.insert(
        "v8_rel",
        Operand::Constant(next_addr.offset(displacement).virtual_offset()),
    );
    let bank = if next_addr.bank() > 0 {
        Some(next_addr.bank())
    } else {
        None
    };
    TemplateEnv {
        values,
        params,
        bank,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(text: &str, params: &[(char, u8)], argument: u16) -> Operand {
        let params: HashMap<char, u8> = params.iter().copied().collect();
        let template = Template::parse(text).expect("template parses");
        let env = standard_env(&params, argument, Address::from_virtual(0x0152));
        template.eval(&env)
    }

    #[test]
    fn registers_and_constants() {
        assert_eq!(eval("HL", &[], 0), Operand::Register(Reg::Hl));
        assert_eq!(eval("0xFF", &[], 0), Operand::Constant(0xFF));
        assert_eq!(eval("v16", &[], 0x1234), Operand::Constant(0x1234));
    }

    #[test]
    fn placeholders() {
        assert_eq!(eval("#S", &[('S', 7)], 0), Operand::Register(Reg::A));
        assert_eq!(eval("#S", &[('S', 6)], 0).to_string(), "[HL]");
        assert_eq!(eval("#F", &[('F', 0)], 0), Operand::Condition(Cond::Fnz));
        assert_eq!(eval("#N", &[('N', 3)], 0), Operand::Constant(0x18));
    }

    #[test]
    fn expressions_fold_during_eval() {
        // (#S & (1 << #I)) == 0 with S=7, I=3
        let op = eval("(#S & (1<<#I)) == 0", &[('S', 7), ('I', 3)], 0);
        assert_eq!(op.to_string(), "(A & 8) == 0");
    }

    #[test]
    fn relative_target() {
        // Backward displacement 0xFD = -3 from next_addr.
        assert_eq!(eval("v8_rel", &[], 0xFD), Operand::Constant(0x014F));
    }

    #[test]
    fn dereference_of_immediate() {
        let op = eval("[v16]", &[], 0xC123);
        assert_eq!(op.to_string(), "[WORK:C123]");
    }

    #[test]
    fn stack_functions() {
        let op = eval("popval(SP)", &[], 0);
        assert_eq!(op.to_string(), "popval(SP)");
        assert!(op.dependencies().contains(RegSet::MEM | RegSet::SP));
    }

    #[test]
    fn malformed_rejected() {
        assert!(Template::parse("1 +").is_none());
        assert!(Template::parse("[A").is_none());
        assert!(Template::parse("push(SP)").is_none());
    }
}
