//! Opaque structured payloads carried across the correlation boundary

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A protocol document element.
///
/// The correlation layer never interprets these beyond their name; building
/// and parsing the actual documents belongs to the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    name: String,
    namespace: Option<String>,
    attributes: BTreeMap<String, String>,
    children: Vec<Node>,
    text: Option<String>,
}

impl Node {
    /// Empty element with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set or overwrite an attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    /// Append a child element.
    pub fn with_child(mut self, child: Node) -> Self {
        self.children
            .push(child);
        self
    }

    /// Set the text content.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Element name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element namespace.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace
            .as_deref()
    }

    /// Look up an attribute.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .map(|s| s.as_str())
    }

    /// All attributes.
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Set or overwrite an attribute.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes
            .insert(name.into(), value.into());
    }

    /// Child elements in document order.
    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// First child with the given name.
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children
            .iter()
            .find(|c| c.name == name)
    }

    /// Text content.
    pub fn text(&self) -> Option<&str> {
        self.text
            .as_deref()
    }
}
