//! Minimal element tree over quick-xml
//!
//! Ad documents are small, so they are read into an owned tree and queried by
//! local name. Namespace prefixes (`vmap:AdBreak`) are ignored.

use crate::{Error, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    /// Local name without namespace prefix
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    text: String,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| Error::Parse(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| Error::Parse(e.to_string()))?
                .into_owned();
            attributes.push((key, value));
        }
        Ok(Self {
            name,
            attributes,
            children: Vec::new(),
            text: String::new(),
        })
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    /// Attribute value, matched case-insensitively
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Trimmed text content of this element (CDATA included)
    pub fn text(&self) -> &str {
        self.text.trim()
    }

    /// First direct child with the given name
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.is(name))
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.is(name))
    }

    /// First descendant with the given name, depth-first
    pub fn find(&self, name: &str) -> Option<&Element> {
        for child in &self.children {
            if child.is(name) {
                return Some(child);
            }
            if let Some(found) = child.find(name) {
                return Some(found);
            }
        }
        None
    }

    /// All descendants with the given name, in document order
    pub fn find_all<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        let mut out = Vec::new();
        self.collect(name, &mut out);
        out
    }

    fn collect<'a>(&'a self, name: &str, out: &mut Vec<&'a Element>) {
        for child in &self.children {
            if child.is(name) {
                out.push(child);
            }
            child.collect(name, out);
        }
    }

    /// Follow a path of direct children, e.g. `["VideoClicks", "ClickThrough"]`
    pub fn path(&self, names: &[&str]) -> Option<&Element> {
        names
            .iter()
            .try_fold(self, |element, name| element.child(name))
    }

    /// Non-empty texts of every descendant with the given name
    pub fn texts(&self, name: &str) -> Vec<String> {
        self.find_all(name)
            .into_iter()
            .map(|e| e.text().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// Parse a document into its root element
pub fn parse_document(xml: &str) -> Result<Element> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| Error::Parse(format!("at byte {}: {}", reader.buffer_position(), e)))?;

        match event {
            Event::Start(ref start) => {
                stack.push(Element::from_start(start)?);
            }
            Event::Empty(ref start) => {
                let element = Element::from_start(start)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| Error::Parse("unbalanced closing tag".to_string()))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(text) => {
                if let Some(current) = stack.last_mut() {
                    match text.unescape() {
                        Ok(value) => current.text.push_str(&value),
                        Err(_) => current.text.push_str(&String::from_utf8_lossy(&text)),
                    }
                }
            }
            Event::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(Error::Parse("unexpected end of document".to_string()));
    }
    root.ok_or_else(|| Error::Parse("document has no root element".to_string()))
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => return Err(Error::Parse("multiple root elements".to_string())),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tree_and_queries() {
        let doc = parse_document(
            r#"<?xml version="1.0"?>
            <vmap:VMAP xmlns:vmap="http://www.iab.net/videosuite/vmap" version="1.0">
              <vmap:AdBreak timeOffset="start" breakId="pre">
                <vmap:AdSource><vmap:AdTagURI><![CDATA[ https://ads.example.com/pre ]]></vmap:AdTagURI></vmap:AdSource>
              </vmap:AdBreak>
              <vmap:AdBreak TimeOffset="end"/>
            </vmap:VMAP>"#,
        )
        .unwrap();

        assert!(doc.is("VMAP"));
        let breaks = doc.find_all("AdBreak");
        assert_eq!(breaks.len(), 2);
        assert_eq!(breaks[0].attr("timeOffset"), Some("start"));
        assert_eq!(breaks[1].attr("timeoffset"), Some("end"));
        assert_eq!(
            breaks[0].path(&["AdSource", "AdTagURI"]).map(Element::text),
            Some("https://ads.example.com/pre")
        );
    }

    #[test]
    fn test_entities_are_unescaped() {
        let doc = parse_document("<Impression>https://t.example.com/i?a=1&amp;b=2</Impression>").unwrap();
        assert_eq!(doc.text(), "https://t.example.com/i?a=1&b=2");
    }

    #[test]
    fn test_malformed_documents() {
        assert!(matches!(parse_document("<VAST><Ad></VAST>"), Err(Error::Parse(_))));
        assert!(matches!(parse_document("<VAST>"), Err(Error::Parse(_))));
        assert!(matches!(parse_document(""), Err(Error::Parse(_))));
        assert!(matches!(parse_document("not xml at all"), Err(Error::Parse(_))));
    }
}
