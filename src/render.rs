//! Rendering interface for structured pseudocode.
//!
//! The analysis core serializes its output through the [`Renderer`] trait:
//! an append-only sink of raw text, class-tagged text and symbolic address
//! references, with explicit logical-line markers and indent scoping. The
//! core knows nothing about presentation; [`TextRenderer`] is the plain-text
//! implementation used by tests and command-line consumers, and richer
//! front-ends can map the same events to markup.

use crate::address::Address;
use crate::operand::{AddrKind, Operand};

/// Semantic classes for tagged text events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextClass {
    /// The address gutter of a logical line.
    OpAddr,
    /// An operation name.
    OpName,
    /// A dependency signature annotation.
    Signature,
    /// A literal value.
    Constant,
    /// A register name.
    Register,
    /// A structural keyword (`if`, `while`, ...).
    Keyword,
}

/// An append-only pseudocode sink.
pub trait Renderer {
    /// Appends plain text to the current logical line.
    fn raw(&mut self, text: &str);

    /// Appends class-tagged text to the current logical line.
    fn tagged(&mut self, text: &str, class: TextClass);

    /// Appends a symbolic reference to an address.
    fn address_ref(&mut self, kind: AddrKind, addr: Address);

    /// Starts a new logical line attributed to `addr`.
    fn line(&mut self, addr: Address);

    /// Emits a label definition line.
    fn label_line(&mut self, addr: Address, note: &str);

    /// Increases the indent of subsequent logical lines.
    fn indent(&mut self);

    /// Decreases the indent of subsequent logical lines.
    fn outdent(&mut self);
}

/// Renders a comma-separated operand list.
pub fn render_list(r: &mut dyn Renderer, operands: &[Operand]) {
    for (i, operand) in operands.iter().enumerate() {
        if i > 0 {
            r.raw(", ");
        }
        operand.render(r);
    }
}

/// Plain-text renderer.
///
/// Each logical line carries a nine-column address gutter followed by four
/// spaces of padding per indent level.
#[derive(Debug, Default)]
pub struct TextRenderer {
    content: String,
    level: usize,
    line_open: bool,
}

impl TextRenderer {
    /// Creates an empty renderer.
    #[must_use]
    pub fn new() -> Self {
        TextRenderer::default()
    }

    /// Returns the accumulated text.
    #[must_use]
    pub fn contents(&self) -> &str {
        &self.content
    }

    /// Consumes the renderer, returning the accumulated text.
    #[must_use]
    pub fn into_string(mut self) -> String {
        if self.line_open {
            self.content.push('\n');
        }
        self.content
    }

    fn break_line(&mut self) {
        if self.line_open {
            self.content.push('\n');
            self.line_open = false;
        }
    }
}

impl Renderer for TextRenderer {
    fn raw(&mut self, text: &str) {
        self.content.push_str(text);
        self.line_open = true;
    }

    fn tagged(&mut self, text: &str, _class: TextClass) {
        self.raw(text);
    }

    fn address_ref(&mut self, _kind: AddrKind, addr: Address) {
        self.raw(&addr.to_string());
    }

    fn line(&mut self, addr: Address) {
        self.break_line();
        self.raw(&format!("{:>9} ", addr.to_string()));
        for _ in 0..self.level {
            self.raw("    ");
        }
    }

    fn label_line(&mut self, addr: Address, note: &str) {
        self.break_line();
        self.raw(&format!("label_{addr}:{note}"));
        self.break_line();
    }

    fn indent(&mut self) {
        self.level += 1;
    }

    fn outdent(&mut self) {
        self.level = self.level.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_and_indent() {
        let mut r = TextRenderer::new();
        r.line(Address::from_virtual(0x0150));
        r.tagged("if", TextClass::Keyword);
        r.raw(" (FZ) {");
        r.indent();
        r.line(Address::from_virtual(0x0152));
        r.raw("A = 1");
        r.outdent();
        r.line(Address::from_virtual(0x0153));
        r.raw("}");
        let text = r.into_string();
        assert_eq!(
            text,
            "0000:0150 if (FZ) {\n0000:0152     A = 1\n0000:0153 }\n"
        );
    }

    #[test]
    fn outdent_saturates() {
        let mut r = TextRenderer::new();
        r.outdent();
        r.line(Address::from_virtual(0));
        r.raw("x");
        assert_eq!(r.into_string(), "0000:0000 x\n");
    }
}
