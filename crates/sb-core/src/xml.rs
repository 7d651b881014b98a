use indexmap::IndexMap;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::error::BridgeError;

#[derive(Debug, Clone, PartialEq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: IndexMap<String, String>,
    pub children: Vec<XmlNode>,
}

/// An owned XML tree. Parsing goes through `roxmltree`; whitespace-only text
/// between elements is dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct XmlDocument {
    root: XmlElement,
}

/// What an XML path points at.
#[derive(Debug, Clone, PartialEq)]
pub enum XmlSelection {
    Element(XmlElement),
    Attribute(String),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
enum XmlStep {
    Element { name: String, position: usize },
    Attribute(String),
    Text,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: IndexMap::new(),
            children: Vec::new(),
        }
    }

    pub fn text(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            match child {
                XmlNode::Text(text) => out.push_str(text),
                XmlNode::Element(element) => out.push_str(&element.text()),
            }
        }
        out
    }

    pub fn set_text(&mut self, text: &str) {
        self.children = vec![XmlNode::Text(text.to_string())];
    }

    fn has_element_children(&self) -> bool {
        self.children
            .iter()
            .any(|child| matches!(child, XmlNode::Element(_)))
    }

    fn nth_child(&self, name: &str, position: usize) -> Option<&XmlElement> {
        self.children
            .iter()
            .filter_map(|child| match child {
                XmlNode::Element(element) if name == "*" || element.name == name => Some(element),
                _ => None,
            })
            .nth(position - 1)
    }

    fn nth_child_mut(&mut self, name: &str, position: usize) -> Option<&mut XmlElement> {
        self.children
            .iter_mut()
            .filter_map(|child| match child {
                XmlNode::Element(element) if name == "*" || element.name == name => Some(element),
                _ => None,
            })
            .nth(position - 1)
    }

    /// Returns the `position`-th child called `name`, appending empty siblings
    /// until it exists.
    fn ensure_child(&mut self, name: &str, position: usize) -> Option<&mut XmlElement> {
        let existing = self
            .children
            .iter()
            .filter(|child| matches!(child, XmlNode::Element(element) if element.name == name))
            .count();
        for _ in existing..position {
            self.children
                .push(XmlNode::Element(XmlElement::new(name.to_string())));
        }
        self.nth_child_mut(name, position)
    }

    fn write_compact(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        write_attributes(&self.attributes, out);
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                XmlNode::Element(element) => element.write_compact(out),
                XmlNode::Text(text) => out.push_str(&escape_text(text)),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    fn write_pretty(&self, depth: usize, out: &mut String) {
        let indent = "  ".repeat(depth);
        out.push_str(&indent);
        if !self.has_element_children() {
            self.write_compact(out);
            out.push('\n');
            return;
        }
        out.push('<');
        out.push_str(&self.name);
        write_attributes(&self.attributes, out);
        out.push_str(">\n");
        for child in &self.children {
            match child {
                XmlNode::Element(element) => element.write_pretty(depth + 1, out),
                XmlNode::Text(text) => {
                    out.push_str(&"  ".repeat(depth + 1));
                    out.push_str(&escape_text(text));
                    out.push('\n');
                }
            }
        }
        out.push_str(&indent);
        out.push_str("</");
        out.push_str(&self.name);
        out.push_str(">\n");
    }

    fn to_json_value(&self) -> JsonValue {
        if self.attributes.is_empty() && !self.has_element_children() {
            let text = self.text();
            return if text.is_empty() {
                JsonValue::Null
            } else {
                JsonValue::String(text)
            };
        }
        let mut object = JsonMap::new();
        for (key, value) in &self.attributes {
            object.insert(format!("@{}", key), JsonValue::String(value.clone()));
        }
        let mut text = String::new();
        for child in &self.children {
            match child {
                XmlNode::Text(value) => text.push_str(value),
                XmlNode::Element(element) => {
                    let converted = element.to_json_value();
                    match object.get_mut(&element.name) {
                        Some(JsonValue::Array(items)) => items.push(converted),
                        Some(existing) => {
                            let first = existing.take();
                            *existing = JsonValue::Array(vec![first, converted]);
                        }
                        None => {
                            object.insert(element.name.clone(), converted);
                        }
                    }
                }
            }
        }
        if !text.trim().is_empty() {
            object.insert("_".to_string(), JsonValue::String(text));
        }
        JsonValue::Object(object)
    }
}

impl XmlDocument {
    pub fn new(root: XmlElement) -> Self {
        Self { root }
    }

    pub fn parse(text: &str) -> Result<Self, BridgeError> {
        let parsed = roxmltree::Document::parse(text).map_err(|error| BridgeError::Xml {
            message: error.to_string(),
        })?;
        Ok(Self {
            root: convert_element(parsed.root_element()),
        })
    }

    pub fn root(&self) -> &XmlElement {
        &self.root
    }

    pub fn to_xml_string(&self) -> String {
        let mut out = String::new();
        self.root.write_compact(&mut out);
        out
    }

    pub fn to_pretty_string(&self) -> String {
        let mut out = String::new();
        self.root.write_pretty(0, &mut out);
        out
    }

    /// `{ rootName: ... }`, attributes as `@name`, mixed text under `_`.
    pub fn to_json_value(&self) -> JsonValue {
        let mut object = JsonMap::new();
        object.insert(self.root.name.clone(), self.root.to_json_value());
        JsonValue::Object(object)
    }

    /// Resolves `/root/child[2]/leaf`, `/root/child/@attr` or `/root/leaf/text()`.
    /// Positions are 1-based.
    pub fn select(&self, path: &str) -> Result<Option<XmlSelection>, BridgeError> {
        let steps = parse_xml_path(path)?;
        let Some((first, rest)) = steps.split_first() else {
            return Ok(Some(XmlSelection::Element(self.root.clone())));
        };
        if !root_matches(&self.root, first) {
            return Ok(None);
        }
        let mut current = &self.root;
        for step in rest {
            match step {
                XmlStep::Element { name, position } => match current.nth_child(name, *position) {
                    Some(child) => current = child,
                    None => return Ok(None),
                },
                XmlStep::Attribute(name) => {
                    return Ok(current
                        .attributes
                        .get(name)
                        .map(|value| XmlSelection::Attribute(value.clone())));
                }
                XmlStep::Text => return Ok(Some(XmlSelection::Text(current.text()))),
            }
        }
        Ok(Some(XmlSelection::Element(current.clone())))
    }

    /// Sets text content or an attribute, creating missing elements on the way.
    pub fn set_text(&mut self, path: &str, text: &str) -> Result<(), BridgeError> {
        let steps = parse_xml_path(path)?;
        let target = self.walk_creating(path, &steps)?;
        match steps.last() {
            Some(XmlStep::Attribute(name)) => {
                target.attributes.insert(name.clone(), text.to_string());
            }
            _ => target.set_text(text),
        }
        Ok(())
    }

    /// Replaces (or creates) the element at `path` with `element`.
    pub fn set_element(&mut self, path: &str, element: XmlElement) -> Result<(), BridgeError> {
        let steps = parse_xml_path(path)?;
        if matches!(steps.last(), Some(XmlStep::Attribute(_) | XmlStep::Text)) {
            return Err(BridgeError::invalid_path(path, "cannot place an element here"));
        }
        if steps.len() == 1 {
            self.root = element;
            return Ok(());
        }
        let target = self.walk_creating(path, &steps)?;
        *target = element;
        Ok(())
    }

    pub fn remove(&mut self, path: &str) -> Result<bool, BridgeError> {
        let steps = parse_xml_path(path)?;
        let Some((last, parents)) = steps.split_last() else {
            return Err(BridgeError::invalid_path(path, "cannot remove the document"));
        };
        if parents.is_empty() {
            return Err(BridgeError::invalid_path(path, "cannot remove the root element"));
        }
        if !root_matches(&self.root, &parents[0]) {
            return Ok(false);
        }
        let mut current = &mut self.root;
        for step in &parents[1..] {
            let XmlStep::Element { name, position } = step else {
                return Err(BridgeError::invalid_path(path, "attribute or text() must be last"));
            };
            match current.nth_child_mut(name, *position) {
                Some(child) => current = child,
                None => return Ok(false),
            }
        }
        match last {
            XmlStep::Attribute(name) => Ok(current.attributes.shift_remove(name).is_some()),
            XmlStep::Text => {
                let had_text = !current.children.is_empty();
                current.children.clear();
                Ok(had_text)
            }
            XmlStep::Element { name, position } => {
                let mut seen = 0usize;
                let slot = current.children.iter().position(|child| match child {
                    XmlNode::Element(element) if name == "*" || &element.name == name => {
                        seen += 1;
                        seen == *position
                    }
                    _ => false,
                });
                match slot {
                    Some(index) => {
                        current.children.remove(index);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
        }
    }

    fn walk_creating(&mut self, path: &str, steps: &[XmlStep]) -> Result<&mut XmlElement, BridgeError> {
        let Some((first, rest)) = steps.split_first() else {
            return Err(BridgeError::invalid_path(path, "empty xml path"));
        };
        if !root_matches(&self.root, first) {
            return Err(BridgeError::invalid_path(path, "root element does not match"));
        }
        let mut current = &mut self.root;
        for step in rest {
            match step {
                XmlStep::Element { name, position } => {
                    if name == "*" {
                        return Err(BridgeError::invalid_path(path, "cannot create '*'"));
                    }
                    current = current.ensure_child(name, *position).ok_or_else(|| {
                        BridgeError::invalid_path(path, format!("cannot create '{}'", name))
                    })?;
                }
                XmlStep::Attribute(_) | XmlStep::Text => break,
            }
        }
        Ok(current)
    }
}

fn root_matches(root: &XmlElement, step: &XmlStep) -> bool {
    matches!(step, XmlStep::Element { name, position: 1 } if name == "*" || *name == root.name)
}

fn parse_xml_path(path: &str) -> Result<Vec<XmlStep>, BridgeError> {
    let Some(body) = path.trim().strip_prefix('/') else {
        return Err(BridgeError::invalid_path(path, "xml path must start with '/'"));
    };
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let segments = body.split('/').collect::<Vec<_>>();
    let mut steps = Vec::with_capacity(segments.len());
    for (index, segment) in segments.iter().enumerate() {
        let last = index + 1 == segments.len();
        if segment.is_empty() {
            return Err(BridgeError::invalid_path(path, "empty path segment"));
        }
        if let Some(name) = segment.strip_prefix('@') {
            if !last || index == 0 {
                return Err(BridgeError::invalid_path(path, "attribute must be last"));
            }
            steps.push(XmlStep::Attribute(name.to_string()));
            continue;
        }
        if *segment == "text()" {
            if !last || index == 0 {
                return Err(BridgeError::invalid_path(path, "text() must be last"));
            }
            steps.push(XmlStep::Text);
            continue;
        }
        let (name, position) = match segment.split_once('[') {
            Some((name, rest)) => {
                let inner = rest.strip_suffix(']').ok_or_else(|| {
                    BridgeError::invalid_path(path, "missing ']'")
                })?;
                let position = inner.trim().parse::<usize>().map_err(|_| {
                    BridgeError::invalid_path(path, format!("bad position '{}'", inner))
                })?;
                if position == 0 {
                    return Err(BridgeError::invalid_path(path, "positions start at 1"));
                }
                (name, position)
            }
            None => (*segment, 1),
        };
        steps.push(XmlStep::Element {
            name: name.to_string(),
            position,
        });
    }
    Ok(steps)
}

fn convert_element(node: roxmltree::Node<'_, '_>) -> XmlElement {
    let mut element = XmlElement::new(node.tag_name().name());
    for attribute in node.attributes() {
        element
            .attributes
            .insert(attribute.name().to_string(), attribute.value().to_string());
    }
    for child in node.children() {
        if child.is_element() {
            element.children.push(XmlNode::Element(convert_element(child)));
        } else if child.is_text() {
            let text = child.text().unwrap_or_default();
            if !text.trim().is_empty() {
                element.children.push(XmlNode::Text(text.to_string()));
            }
        }
    }
    element
}

fn write_attributes(attributes: &IndexMap<String, String>, out: &mut String) {
    for (key, value) in attributes {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape_text(value).replace('"', "&quot;"));
        out.push('"');
    }
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
