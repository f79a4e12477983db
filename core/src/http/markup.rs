//! Minimal XML element tree used for markup request bodies.

use std::str::Utf8Error;

use indexmap::IndexMap;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarkupError {
    #[error("malformed xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("invalid utf-8 in xml name: {0}")]
    Encoding(#[from] Utf8Error),
    #[error("document has no root element")]
    NoRoot,
    #[error("document has more than one root element")]
    MultipleRoots,
    #[error("element <{0}> is never closed")]
    Unclosed(String),
    #[error("unexpected end tag")]
    UnexpectedEnd,
    #[error("text outside of the root element")]
    StrayText,
}

/// An XML element: tag, ordered attributes, optional leading text and
/// ordered children. Tail text after a child is not kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Element {
    pub tag: String,
    pub attributes: IndexMap<String, String>,
    pub text: Option<String>,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attributes: IndexMap::new(),
            text: None,
            children: Vec::new(),
        }
    }

    /// Parses a document with exactly one root element.
    pub fn parse(input: &str) -> Result<Element, MarkupError> {
        let mut reader = Reader::from_str(input);
        reader.trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event()? {
                Event::Start(start) => stack.push(element_from_start(&start)?),
                Event::Empty(start) => {
                    let element = element_from_start(&start)?;
                    attach(element, &mut stack, &mut root)?;
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or(MarkupError::UnexpectedEnd)?;
                    attach(element, &mut stack, &mut root)?;
                }
                Event::Text(text) => {
                    let text = text.unescape()?;
                    push_text(&text, &mut stack)?;
                }
                Event::CData(data) => {
                    let bytes = data.into_inner();
                    let text = std::str::from_utf8(&bytes)?;
                    push_text(text, &mut stack)?;
                }
                Event::Eof => break,
                // declarations, comments, processing instructions, doctype
                _ => {}
            }
        }

        if let Some(open) = stack.pop() {
            return Err(MarkupError::Unclosed(open.tag));
        }
        root.ok_or(MarkupError::NoRoot)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.tag);
        for (name, value) in &self.attributes {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape(value.as_str()));
            out.push('"');
        }
        if self.text.is_none() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        if let Some(text) = &self.text {
            out.push_str(&escape(text.as_str()));
        }
        for child in &self.children {
            child.render_into(out);
        }
        out.push_str("</");
        out.push_str(&self.tag);
        out.push('>');
    }

    /// Rebuilds the tree with `f` applied to tags, attribute names and
    /// values, and text.
    pub fn try_map_text<E, F>(&self, f: &mut F) -> Result<Element, E>
    where
        F: FnMut(&str) -> Result<String, E>,
    {
        let mut attributes = IndexMap::with_capacity(self.attributes.len());
        for (k, v) in &self.attributes {
            attributes.insert(f(k)?, f(v)?);
        }
        let text = match &self.text {
            Some(text) => Some(f(text)?),
            None => None,
        };
        let children = self
            .children
            .iter()
            .map(|child| child.try_map_text(f))
            .collect::<Result<Vec<_>, E>>()?;
        Ok(Element {
            tag: f(&self.tag)?,
            attributes,
            text,
            children,
        })
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element, MarkupError> {
    let mut element = Element::new(std::str::from_utf8(start.name().as_ref())?);
    for attr in start.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = std::str::from_utf8(attr.key.as_ref())?.to_string();
        let value = attr.unescape_value()?.into_owned();
        element.attributes.insert(key, value);
    }
    Ok(element)
}

fn attach(
    element: Element,
    stack: &mut [Element],
    root: &mut Option<Element>,
) -> Result<(), MarkupError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_some() => return Err(MarkupError::MultipleRoots),
        None => *root = Some(element),
    }
    Ok(())
}

fn push_text(text: &str, stack: &mut [Element]) -> Result<(), MarkupError> {
    match stack.last_mut() {
        Some(current) => {
            // only text ahead of the first child belongs to the element
            if current.children.is_empty() {
                current.text.get_or_insert_with(String::new).push_str(text);
            }
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err(MarkupError::StrayText),
    }
}
