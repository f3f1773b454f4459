//! A minimal XML text writer.
//!
//! The JSON, log, and CSV unifiers synthesize markup through this writer
//! and pump it into the one tag scanner, so every input format flows
//! through the same event model. Angle brackets inside data are
//! entity-escaped; the output formatter decodes them again.

#[derive(Debug)]
pub struct XmlWriter {
    buf: String,
    tag_stack: Vec<String>,
    indents: bool,
    indent_level: usize,
}

impl XmlWriter {
    pub fn new() -> Self {
        XmlWriter {
            buf: String::new(),
            tag_stack: Vec::new(),
            indents: true,
            indent_level: 0,
        }
    }

    /// Compact output without newlines or indentation.
    pub fn compact() -> Self {
        XmlWriter {
            indents: false,
            ..XmlWriter::new()
        }
    }

    /// Drain the synthesized markup.
    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.buf)
    }

    pub fn open_depth(&self) -> usize {
        self.tag_stack.len()
    }

    pub fn push_tag(&mut self, tag: &str) {
        self.push_tag_with_attributes(tag, "");
    }

    pub fn push_tag_with_attributes(&mut self, tag: &str, attributes: &str) {
        self.indent();
        self.buf.push('<');
        self.buf.push_str(tag);
        self.buf.push_str(attributes);
        self.buf.push('>');
        self.newline();
        self.indent_level += 1;
        self.tag_stack.push(tag.to_string());
    }

    pub fn pop_tag(&mut self) {
        if let Some(tag) = self.tag_stack.pop() {
            self.indent_level = self.indent_level.saturating_sub(1);
            self.indent();
            if !tag.is_empty() {
                self.buf.push_str("</");
                self.buf.push_str(&tag);
                self.buf.push('>');
            }
            self.newline();
        }
    }

    /// Close any tags still open.
    pub fn pop_all(&mut self) {
        while !self.tag_stack.is_empty() {
            self.pop_tag();
        }
    }

    pub fn add_data(&mut self, tag: &str, data: &str) {
        self.indent();
        self.buf.push('<');
        self.buf.push_str(tag);
        self.buf.push('>');
        encode_into(&mut self.buf, data);
        self.buf.push_str("</");
        self.buf.push_str(tag);
        self.buf.push('>');
        self.newline();
    }

    fn indent(&mut self) {
        if self.indents {
            for _ in 0..self.indent_level {
                self.buf.push_str("  ");
            }
        }
    }

    fn newline(&mut self) {
        if self.indents {
            self.buf.push('\n');
        }
    }
}

impl Default for XmlWriter {
    fn default() -> Self {
        XmlWriter::new()
    }
}

/// Escape the structural brackets only; other bytes pass through and are
/// decoded by the output formatter.
fn encode_into(buf: &mut String, data: &str) {
    for c in data.chars() {
        match c {
            '<' => buf.push_str("&lt;"),
            '>' => buf.push_str("&gt;"),
            c => buf.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_tags() {
        let mut w = XmlWriter::compact();
        w.push_tag("table");
        w.push_tag("row");
        w.add_data("name", "ann");
        w.pop_tag();
        w.pop_tag();
        assert_eq!(
            w.take(),
            "<table><row><name>ann</name></row></table>"
        );
    }

    #[test]
    fn test_brackets_escaped() {
        let mut w = XmlWriter::compact();
        w.add_data("v", "a<b>c");
        assert_eq!(w.take(), "<v>a&lt;b&gt;c</v>");
    }

    #[test]
    fn test_attributes() {
        let mut w = XmlWriter::compact();
        w.push_tag_with_attributes("t", " id=\"1\"");
        w.pop_tag();
        assert_eq!(w.take(), "<t id=\"1\"></t>");
    }

    #[test]
    fn test_pop_all() {
        let mut w = XmlWriter::compact();
        w.push_tag("a");
        w.push_tag("b");
        w.pop_all();
        assert_eq!(w.take(), "<a><b></b></a>");
        assert_eq!(w.open_depth(), 0);
    }

    #[test]
    fn test_indented_output() {
        let mut w = XmlWriter::new();
        w.push_tag("a");
        w.add_data("b", "x");
        w.pop_tag();
        assert_eq!(w.take(), "<a>\n  <b>x</b>\n</a>\n");
    }
}
