//! Minimal XML emission and attribute validation
//!
//! The persisted descriptors are small and their schema is fixed, so writing
//! is a plain string builder with escaping. Parsing lives with the readers
//! (quick-xml); this module only holds the attribute validators they share.

use crate::{CoreError, CoreResult};

/// Streaming XML writer producing two-space-indented elements
#[derive(Debug)]
pub struct XmlWriter {
    buf: String,
    stack: Vec<&'static str>,
    tag_open: bool,
}

impl XmlWriter {
    pub fn new() -> Self {
        Self {
            buf: String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n"),
            stack: Vec::new(),
            tag_open: false,
        }
    }

    pub fn start_tag(&mut self, name: &'static str) {
        self.close_open_tag();
        for _ in 0..self.stack.len() {
            self.buf.push_str("  ");
        }
        self.buf.push('<');
        self.buf.push_str(name);
        self.stack.push(name);
        self.tag_open = true;
    }

    pub fn attr_str(&mut self, name: &str, value: &str) {
        debug_assert!(self.tag_open);
        self.buf.push(' ');
        self.buf.push_str(name);
        self.buf.push_str("=\"");
        self.buf.push_str(&xml_escape(value));
        self.buf.push('"');
    }

    pub fn attr_i64(&mut self, name: &str, value: i64) {
        self.attr_str(name, &value.to_string());
    }

    pub fn attr_u64(&mut self, name: &str, value: u64) {
        self.attr_str(name, &value.to_string());
    }

    pub fn end_tag(&mut self, name: &'static str) {
        let top = self.stack.pop();
        debug_assert_eq!(top, Some(name));
        if self.tag_open {
            // Nothing was nested; emit a self-closing element
            self.buf.push_str("/>\n");
            self.tag_open = false;
        } else {
            for _ in 0..self.stack.len() {
                self.buf.push_str("  ");
            }
            self.buf.push_str("</");
            self.buf.push_str(name);
            self.buf.push_str(">\n");
        }
    }

    pub fn finish(mut self) -> String {
        debug_assert!(self.stack.is_empty());
        self.close_open_tag();
        self.buf
    }

    fn close_open_tag(&mut self) {
        if self.tag_open {
            self.buf.push_str(">\n");
            self.tag_open = false;
        }
    }
}

/// Escape XML special characters
pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Parse an attribute that must be a non-negative 64-bit integer
pub fn parse_nonneg_i64(name: &str, value: &str) -> CoreResult<i64> {
    match value.parse::<i64>() {
        Ok(v) if v >= 0 => Ok(v),
        _ => Err(CoreError::InvalidAttr {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(xml_escape("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&apos;");
    }

    #[test]
    fn test_writer_nesting() {
        let mut w = XmlWriter::new();
        w.start_tag("outer");
        w.attr_i64("n", 3);
        w.start_tag("inner");
        w.attr_str("name", "x<y");
        w.end_tag("inner");
        w.end_tag("outer");
        let out = w.finish();
        assert!(out.contains("<outer n=\"3\">"));
        assert!(out.contains("  <inner name=\"x&lt;y\"/>"));
        assert!(out.contains("</outer>"));
    }

    #[test]
    fn test_writer_self_closing() {
        let mut w = XmlWriter::new();
        w.start_tag("empty");
        w.end_tag("empty");
        assert!(w.finish().contains("<empty/>"));
    }

    #[test]
    fn test_parse_nonneg() {
        assert_eq!(parse_nonneg_i64("start", "42").unwrap(), 42);
        assert_eq!(parse_nonneg_i64("start", "0").unwrap(), 0);
        assert!(parse_nonneg_i64("start", "-1").is_err());
        assert!(parse_nonneg_i64("start", "4.2").is_err());
        assert!(parse_nonneg_i64("start", "bogus").is_err());
    }
}
