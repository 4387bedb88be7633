//! Ordered XML tree used by the normalizer, and a small CDATA-aware writer
//! used when rendering replies and envelopes.

use xml::EmitterConfig;
use xml::reader::{EventReader, ParserConfig, XmlEvent as ReadEvent};
use xml::writer::{EventWriter, XmlEvent as WriteEvent};

use crate::error::WeixinError;

/// Every message the platform exchanges is rooted at `<xml>`.
pub const ROOT_ELEMENT: &str = "xml";

/// Element nesting accepted from the wire. Platform payloads nest at most
/// three levels deep.
pub const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum XmlNode {
    /// Element holding only character data (CDATA included).
    Text(String),
    /// Element holding child elements.
    Element(XmlTree),
}

/// Children of one element grouped by tag name. Groups keep the order in
/// which a tag first appeared; occurrences keep document order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct XmlTree {
    children: Vec<(String, Vec<XmlNode>)>,
}

impl XmlTree {
    pub fn children(&self) -> impl Iterator<Item = (&str, &[XmlNode])> {
        self.children
            .iter()
            .map(|(name, nodes)| (name.as_str(), nodes.as_slice()))
    }

    fn push(&mut self, name: String, node: XmlNode) {
        match self.children.iter_mut().find(|(key, _)| *key == name) {
            Some((_, nodes)) => nodes.push(node),
            None => self.children.push((name, vec![node])),
        }
    }
}

struct Frame {
    name: String,
    tree: XmlTree,
    text: String,
    has_children: bool,
}

impl Frame {
    fn new(name: String) -> Self {
        Frame {
            name,
            tree: XmlTree::default(),
            text: String::new(),
            has_children: false,
        }
    }

    fn into_node(self) -> (String, XmlNode) {
        let node = if self.has_children {
            XmlNode::Element(self.tree)
        } else {
            XmlNode::Text(self.text)
        };
        (self.name, node)
    }
}

/// Parses a platform document and returns the children of its `<xml>` root.
pub fn parse_document(input: &[u8]) -> Result<XmlTree, WeixinError> {
    let config = ParserConfig::new()
        .trim_whitespace(false)
        .whitespace_to_characters(true)
        .cdata_to_characters(true)
        .ignore_comments(true);
    let reader = EventReader::new_with_config(input, config);

    let mut stack: Vec<Frame> = Vec::new();
    let mut root: Option<(String, XmlNode)> = None;
    for event in reader {
        match event? {
            ReadEvent::StartElement { name, .. } => {
                if stack.len() >= MAX_DEPTH {
                    return Err(WeixinError::MalformedXml(format!(
                        "element nesting exceeds {MAX_DEPTH} levels"
                    )));
                }
                if let Some(parent) = stack.last_mut() {
                    parent.has_children = true;
                }
                stack.push(Frame::new(name.local_name));
            }
            ReadEvent::Characters(text) | ReadEvent::CData(text) | ReadEvent::Whitespace(text) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&text);
                }
            }
            ReadEvent::EndElement { .. } => {
                let frame = stack
                    .pop()
                    .ok_or_else(|| WeixinError::MalformedXml("unbalanced end tag".into()))?;
                let (name, node) = frame.into_node();
                match stack.last_mut() {
                    Some(parent) => parent.tree.push(name, node),
                    None => root = Some((name, node)),
                }
            }
            _ => {}
        }
    }

    match root {
        Some((name, XmlNode::Element(tree))) if name == ROOT_ELEMENT => Ok(tree),
        Some((name, XmlNode::Text(_))) if name == ROOT_ELEMENT => Ok(XmlTree::default()),
        Some((name, _)) => Err(WeixinError::MalformedXml(format!(
            "unexpected root element <{name}>"
        ))),
        None => Err(WeixinError::MalformedXml("document has no root element".into())),
    }
}

/// Streams `<xml>` documents where text leaves are CDATA sections.
pub struct XmlBuilder {
    writer: EventWriter<Vec<u8>>,
}

impl XmlBuilder {
    pub fn new() -> Result<Self, WeixinError> {
        let writer = EmitterConfig::new()
            .write_document_declaration(false)
            .perform_indent(false)
            .normalize_empty_elements(false)
            .create_writer(Vec::new());
        let mut builder = XmlBuilder { writer };
        builder.start(ROOT_ELEMENT)?;
        Ok(builder)
    }

    pub fn start(&mut self, name: &str) -> Result<&mut Self, WeixinError> {
        self.writer.write(WriteEvent::start_element(name))?;
        Ok(self)
    }

    pub fn end(&mut self) -> Result<&mut Self, WeixinError> {
        self.writer.write(WriteEvent::end_element())?;
        Ok(self)
    }

    /// `<name><![CDATA[value]]></name>`; a literal `]]>` is split across two
    /// sections.
    pub fn cdata(&mut self, name: &str, value: &str) -> Result<&mut Self, WeixinError> {
        self.start(name)?;
        let pieces: Vec<&str> = value.split("]]>").collect();
        let last = pieces.len() - 1;
        for (idx, piece) in pieces.iter().enumerate() {
            let mut section = String::with_capacity(piece.len() + 3);
            if idx > 0 {
                section.push('>');
            }
            section.push_str(piece);
            if idx < last {
                section.push_str("]]");
            }
            self.writer.write(WriteEvent::cdata(&section))?;
        }
        self.end()
    }

    /// `<name>value</name>` for numeric leaves.
    pub fn text(&mut self, name: &str, value: &str) -> Result<&mut Self, WeixinError> {
        self.start(name)?;
        self.writer.write(WriteEvent::characters(value))?;
        self.end()
    }

    pub fn finish(mut self) -> Result<String, WeixinError> {
        self.end()?;
        String::from_utf8(self.writer.into_inner())
            .map_err(|err| WeixinError::Render(err.to_string()))
    }
}
