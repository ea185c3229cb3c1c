//! Minimal XML tree used by the queue file.
//!
//! Only what the queue document needs: elements, attributes, nested
//! children, the XML declaration and comments. Text content is kept but not
//! interpreted.

use std::fmt::Write as _;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum XmlError {
    #[error("unexpected end of document")]
    UnexpectedEof,
    #[error("malformed element at byte {0}")]
    Malformed(usize),
    #[error("mismatched closing tag: expected {expected}, found {found}")]
    MismatchedTag { expected: String, found: String },
    #[error("document is not valid UTF-8")]
    Utf8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn with_attr(mut self, name: &str, value: impl ToString) -> Self {
        self.attrs.push((name.to_string(), value.to_string()));
        self
    }

    pub fn push(&mut self, child: Element) {
        self.children.push(child);
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Serializes the element with a declaration, two-space indented.
    pub fn to_document(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\" standalone=\"yes\"?>\n");
        self.write_into(&mut out, 0);
        out
    }

    fn write_into(&self, out: &mut String, depth: usize) {
        for _ in 0..depth {
            out.push_str("  ");
        }
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attrs {
            let _ = write!(out, " {}=\"{}\"", key, escape(value));
        }
        if self.children.is_empty() && self.text.is_empty() {
            out.push_str("/>\n");
            return;
        }
        out.push('>');
        if !self.text.is_empty() {
            out.push_str(&escape(&self.text));
        }
        if !self.children.is_empty() {
            out.push('\n');
            for child in &self.children {
                child.write_into(out, depth + 1);
            }
            for _ in 0..depth {
                out.push_str("  ");
            }
        }
        let _ = writeln!(out, "</{}>", self.name);
    }
}

pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

pub fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';').filter(|&i| i <= 10) else {
            out.push('&');
            rest = &tail[1..];
            continue;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(ch) => {
                out.push(ch);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Parses a document and returns its root element.
pub fn parse(data: &[u8]) -> Result<Element, XmlError> {
    let text = std::str::from_utf8(data).map_err(|_| XmlError::Utf8)?;
    let mut parser = Parser { text, pos: 0 };
    parser.skip_misc();
    parser.element()
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn skip_until(&mut self, marker: &str) -> Result<(), XmlError> {
        let end = self.rest().find(marker).ok_or(XmlError::UnexpectedEof)?;
        self.pos += end + marker.len();
        Ok(())
    }

    /// Skips whitespace, declarations and comments.
    fn skip_misc(&mut self) {
        loop {
            self.skip_whitespace();
            let marker = if self.rest().starts_with("<?") {
                "?>"
            } else if self.rest().starts_with("<!--") {
                "-->"
            } else if self.rest().starts_with("<!") {
                ">"
            } else {
                return;
            };
            if self.skip_until(marker).is_err() {
                self.pos = self.text.len();
                return;
            }
        }
    }

    fn name(&mut self) -> Result<&'a str, XmlError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() || matches!(b, b'>' | b'/' | b'=') {
                break;
            }
            self.pos += 1;
        }
        if start == self.pos {
            return Err(XmlError::Malformed(start));
        }
        Ok(&self.text[start..self.pos])
    }

    fn attribute(&mut self) -> Result<(String, String), XmlError> {
        let key = self.name()?.to_string();
        self.skip_whitespace();
        if self.peek() != Some(b'=') {
            return Err(XmlError::Malformed(self.pos));
        }
        self.pos += 1;
        self.skip_whitespace();
        let quote = self.peek().ok_or(XmlError::UnexpectedEof)?;
        if quote != b'"' && quote != b'\'' {
            return Err(XmlError::Malformed(self.pos));
        }
        self.pos += 1;
        let start = self.pos;
        let len = self.rest().find(quote as char).ok_or(XmlError::UnexpectedEof)?;
        self.pos += len + 1;
        Ok((key, unescape(&self.text[start..start + len])))
    }

    fn element(&mut self) -> Result<Element, XmlError> {
        if self.peek() != Some(b'<') {
            return match self.peek() {
                None => Err(XmlError::UnexpectedEof),
                Some(_) => Err(XmlError::Malformed(self.pos)),
            };
        }
        self.pos += 1;
        let mut element = Element::new(self.name()?);

        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(XmlError::UnexpectedEof),
                Some(b'/') => {
                    if !self.rest().starts_with("/>") {
                        return Err(XmlError::Malformed(self.pos));
                    }
                    self.pos += 2;
                    return Ok(element);
                }
                Some(b'>') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => {
                    let attr = self.attribute()?;
                    element.attrs.push(attr);
                }
            }
        }

        let mut text = String::new();
        loop {
            if self.pos >= self.text.len() {
                return Err(XmlError::UnexpectedEof);
            }
            if self.rest().starts_with("</") {
                self.pos += 2;
                let found = self.name()?;
                if found != element.name {
                    return Err(XmlError::MismatchedTag {
                        expected: element.name,
                        found: found.to_string(),
                    });
                }
                self.skip_whitespace();
                if self.peek() != Some(b'>') {
                    return Err(XmlError::Malformed(self.pos));
                }
                self.pos += 1;
                break;
            }
            if self.rest().starts_with("<!--") {
                self.skip_until("-->")?;
                continue;
            }
            if self.peek() == Some(b'<') {
                let child = self.element()?;
                element.children.push(child);
                continue;
            }
            let end = self.rest().find('<').unwrap_or(self.rest().len());
            text.push_str(&self.text[self.pos..self.pos + end]);
            self.pos += end;
        }

        let text = text.trim();
        if !text.is_empty() {
            element.text = unescape(text);
        }
        Ok(element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_with_entities() {
        let doc = br#"<?xml version="1.0"?>
<!-- queue -->
<Downloads Version="2">
  <File Target="a &amp; b.txt"><Source CID='X'/></File>
</Downloads>"#;
        let root = parse(doc).unwrap();
        assert_eq!(root.name, "Downloads");
        assert_eq!(root.attr("Version"), Some("2"));
        let file = root.children_named("File").next().unwrap();
        assert_eq!(file.attr("Target"), Some("a & b.txt"));
        assert_eq!(file.children[0].attr("CID"), Some("X"));
    }

    #[test]
    fn test_written_document_parses_back() {
        let mut root = Element::new("Root").with_attr("Name", "<\"quoted\">");
        root.push(Element::new("Leaf").with_attr("N", 5));
        let parsed = parse(root.to_document().as_bytes()).unwrap();
        assert_eq!(parsed, root);
    }

    #[test]
    fn test_truncated_document_fails() {
        assert_eq!(parse(b"<Root><Child A=\"1\"/>"), Err(XmlError::UnexpectedEof));
        assert!(matches!(
            parse(b"<Root></Other>"),
            Err(XmlError::MismatchedTag { .. })
        ));
    }

    #[test]
    fn test_numeric_entities() {
        assert_eq!(unescape("&#65;&#x42;&bogus;"), "AB&bogus;");
    }
}
