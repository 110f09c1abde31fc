//! In-memory DOM the recorder reads from.
//!
//! The browser host hands the core a [`Document`]: an arena of element and text
//! nodes with live attributes plus the few element properties the recorder
//! cares about (`value`, `checked`, layout rectangle). Pages can be built
//! programmatically or loaded from a JSON tree ([`NodeSpec`]).

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{RecorderError, Result};
use crate::types::BoundingBox;

/// Handle to a node inside one [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    data: NodeData,
}

#[derive(Debug, Clone)]
enum NodeData {
    Element(Element),
    Text(String),
}

/// An element with its attributes and live properties.
#[derive(Debug, Clone)]
pub struct Element {
    tag: String,
    attributes: Vec<(String, String)>,
    /// Live `value` property. Falls back to the `value` attribute when unset.
    pub value: Option<String>,
    /// Live `checked` property of checkboxes and radios.
    pub checked: bool,
    pub rect: BoundingBox,
}

impl Element {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attributes: Vec::new(),
            value: None,
            checked: false,
            rect: BoundingBox::default(),
        }
    }

    /// Lowercase tag name.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Attribute value when present and non-empty.
    pub fn non_empty_attribute(&self, name: &str) -> Option<&str> {
        self.attribute(name).filter(|value| !value.is_empty())
    }

    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .attributes
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(index) => self.attributes[index].1 = value,
            None => self.attributes.push((name.to_ascii_lowercase(), value)),
        }
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Lowercased `type` attribute, if any.
    pub fn input_type(&self) -> Option<String> {
        self.attribute("type").map(|t| t.trim().to_ascii_lowercase())
    }

    pub fn is_password_field(&self) -> bool {
        self.tag == "input" && self.input_type().as_deref() == Some("password")
    }

    /// Current value as a script would read `element.value`.
    pub fn current_value(&self) -> &str {
        match &self.value {
            Some(value) => value,
            None => self.attribute("value").unwrap_or_default(),
        }
    }
}

/// A page's element tree. The root is always the `html` element.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    refs: HashMap<String, NodeId>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                parent: None,
                children: Vec::new(),
                data: NodeData::Element(Element::new("html")),
            }],
            refs: HashMap::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn append_element(&mut self, parent: NodeId, tag: &str) -> NodeId {
        self.push(parent, NodeData::Element(Element::new(tag)))
    }

    pub fn append_text(&mut self, parent: NodeId, text: impl Into<String>) -> NodeId {
        self.push(parent, NodeData::Text(text.into()))
    }

    fn push(&mut self, parent: NodeId, data: NodeData) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            parent: Some(parent),
            children: Vec::new(),
            data,
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Tag a node with a host-side label so drivers can find it again.
    pub fn set_ref(&mut self, node: NodeId, name: impl Into<String>) {
        self.refs.insert(name.into(), node);
    }

    pub fn find_ref(&self, name: &str) -> Option<NodeId> {
        self.refs.get(name).copied()
    }

    /// First element in tree order whose `id` attribute equals `id`.
    pub fn find_by_id(&self, id: &str) -> Option<NodeId> {
        self.descendants(self.root())
            .find(|&node| self.element(node).and_then(|el| el.attribute("id")) == Some(id))
    }

    /// Resolve a driver target: a ref label first, then an `id` attribute.
    pub fn resolve(&self, target: &str) -> Result<NodeId> {
        self.find_ref(target)
            .or_else(|| self.find_by_id(target))
            .ok_or_else(|| RecorderError::UnknownNode(target.to_string()))
    }

    pub fn element(&self, node: NodeId) -> Option<&Element> {
        match &self.nodes.get(node.0)?.data {
            NodeData::Element(el) => Some(el),
            NodeData::Text(_) => None,
        }
    }

    pub fn element_mut(&mut self, node: NodeId) -> Option<&mut Element> {
        match &mut self.nodes.get_mut(node.0)?.data {
            NodeData::Element(el) => Some(el),
            NodeData::Text(_) => None,
        }
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node.0)?.parent
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.nodes
            .get(node.0)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
    }

    /// Element siblings before `node`, nearest first.
    pub fn preceding_element_siblings(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let siblings = self.parent(node).map(|p| self.children(p)).unwrap_or_default();
        let position = siblings.iter().position(|&s| s == node).unwrap_or(0);
        siblings[..position]
            .iter()
            .rev()
            .copied()
            .filter(|&s| self.element(s).is_some())
    }

    /// `node` and all nodes below it, in tree order.
    pub fn descendants(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let mut stack = vec![node];
        std::iter::from_fn(move || {
            let next = stack.pop()?;
            stack.extend(self.children(next).iter().rev().copied());
            Some(next)
        })
    }

    /// Concatenated text of every descendant text node, like `textContent`.
    pub fn text_content(&self, node: NodeId) -> String {
        self.descendants(node)
            .filter_map(|n| match &self.nodes[n.0].data {
                NodeData::Text(text) => Some(text.as_str()),
                NodeData::Element(_) => None,
            })
            .collect()
    }

    /// Build a document from a JSON tree whose root is the `html` element.
    ///
    /// Every element needs a tag name without whitespace.
    pub fn from_spec(spec: &NodeSpec) -> Result<Self> {
        spec.validate()?;
        let mut doc = Document::new();
        let root = doc.root();
        if let Some(el) = doc.element_mut(root) {
            *el = Element::new(&spec.tag);
        }
        doc.apply_spec(root, spec);
        Ok(doc)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let spec: NodeSpec = serde_json::from_str(json)?;
        Self::from_spec(&spec)
    }

    fn apply_spec(&mut self, node: NodeId, spec: &NodeSpec) {
        if let Some(el) = self.element_mut(node) {
            for (name, value) in &spec.attrs {
                el.set_attribute(name, value.clone());
            }
            el.value = spec.value.clone();
            el.checked = spec.checked;
            el.rect = spec.rect.unwrap_or_default();
        }
        if let Some(reference) = &spec.reference {
            self.set_ref(node, reference.clone());
        }
        for child in &spec.children {
            match child {
                ChildSpec::Text(text) => {
                    self.append_text(node, text.clone());
                }
                ChildSpec::Element(child_spec) => {
                    let child_node = self.append_element(node, &child_spec.tag);
                    self.apply_spec(child_node, child_spec);
                }
            }
        }
    }
}

/// JSON form of an element subtree.
///
/// ```json
/// { "tag": "button", "attrs": { "id": "go" }, "ref": "go", "children": ["Go"] }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSpec {
    pub tag: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub checked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rect: Option<BoundingBox>,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default)]
    pub children: Vec<ChildSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChildSpec {
    Text(String),
    Element(NodeSpec),
}

impl NodeSpec {
    /// `<html><body></body></html>`
    pub fn blank_page() -> Self {
        Self {
            tag: "html".to_string(),
            children: vec![ChildSpec::Element(Self {
                tag: "body".to_string(),
                ..Self::default()
            })],
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.tag.is_empty() || self.tag.chars().any(char::is_whitespace) {
            return Err(RecorderError::InvalidDocument(format!(
                "bad tag name {:?}",
                self.tag
            )));
        }
        self.children.iter().try_for_each(|child| match child {
            ChildSpec::Text(_) => Ok(()),
            ChildSpec::Element(spec) => spec.validate(),
        })
    }
}
