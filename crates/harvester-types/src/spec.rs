//! Specification trees.
//!
//! A [`Specification`] is an ordered, attributed node tree describing a
//! job's scope or one pipeline stage's configuration. Trees can be sealed;
//! once sealed every mutator fails with [`SpecError::Sealed`].
//!
//! # Serialized form
//!
//! JSON. A node is an object with the reserved keys `_type_`, `_value_`,
//! `_attribute_<name>`, and `_children_` (an ordered array of nodes). The
//! root is an object holding only `_children_`. Parsing additionally accepts
//! the compact form where a plain key names the child type:
//!
//! ```json
//! { "include": [ { "_attribute_pattern": ".*\\.txt" } ], "maxdepth": "3" }
//! ```
//!
//! Serialization always writes the ordered `_children_` form so interleaved
//! child types survive a round trip.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

const TYPE_KEY: &str = "_type_";
const VALUE_KEY: &str = "_value_";
const CHILDREN_KEY: &str = "_children_";
const ATTRIBUTE_PREFIX: &str = "_attribute_";

/// Errors from parsing or mutating a specification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("malformed specification: {0}")]
    Malformed(String),

    #[error("specification is sealed and cannot be modified")]
    Sealed,

    #[error("child index {index} out of range (child count {len})")]
    IndexOutOfRange { index: usize, len: usize },
}

fn malformed(msg: impl Into<String>) -> SpecError {
    SpecError::Malformed(msg.into())
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// One node of a specification tree.
#[derive(Debug, Clone)]
pub struct SpecificationNode {
    node_type: String,
    value: Option<String>,
    attributes: BTreeMap<String, String>,
    children: Vec<SpecificationNode>,
    sealed: bool,
}

impl PartialEq for SpecificationNode {
    fn eq(&self, other: &Self) -> bool {
        self.node_type == other.node_type
            && self.value == other.value
            && self.attributes == other.attributes
            && self.children == other.children
    }
}

impl Eq for SpecificationNode {}

impl SpecificationNode {
    #[must_use]
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            value: None,
            attributes: BTreeMap::new(),
            children: Vec::new(),
            sealed: false,
        }
    }

    /// Builder: set the scalar value on an unsealed node.
    #[must_use]
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Builder: set an attribute on an unsealed node.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Builder: append a child to an unsealed node.
    #[must_use]
    pub fn with_child(mut self, child: SpecificationNode) -> Self {
        self.children.push(child);
        self
    }

    #[must_use]
    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    #[must_use]
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub fn child(&self, index: usize) -> Option<&SpecificationNode> {
        self.children.get(index)
    }

    /// Mutable access to a child. Mutators on the returned node still honor
    /// the seal.
    pub fn child_mut(&mut self, index: usize) -> Option<&mut SpecificationNode> {
        self.children.get_mut(index)
    }

    pub fn children(&self) -> impl Iterator<Item = &SpecificationNode> {
        self.children.iter()
    }

    /// Children of the given type, in order.
    pub fn children_of_type<'a>(
        &'a self,
        node_type: &'a str,
    ) -> impl Iterator<Item = &'a SpecificationNode> + 'a {
        self.children.iter().filter(move |c| c.node_type == node_type)
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Seal this node and every descendant.
    pub fn seal(&mut self) {
        self.sealed = true;
        for child in &mut self.children {
            child.seal();
        }
    }

    fn check_unsealed(&self) -> Result<(), SpecError> {
        if self.sealed {
            Err(SpecError::Sealed)
        } else {
            Ok(())
        }
    }

    /// # Errors
    ///
    /// Returns [`SpecError::Sealed`] if the node is sealed.
    pub fn set_value(&mut self, value: Option<String>) -> Result<(), SpecError> {
        self.check_unsealed()?;
        self.value = value;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`SpecError::Sealed`] if the node is sealed.
    pub fn set_attribute(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), SpecError> {
        self.check_unsealed()?;
        self.attributes.insert(name.into(), value.into());
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`SpecError::Sealed`] if the node is sealed.
    pub fn remove_attribute(&mut self, name: &str) -> Result<Option<String>, SpecError> {
        self.check_unsealed()?;
        Ok(self.attributes.remove(name))
    }

    /// Insert `child` at `index` (equal to the child count appends).
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Sealed`] if the node is sealed, or
    /// [`SpecError::IndexOutOfRange`] if `index` exceeds the child count.
    pub fn add_child(&mut self, index: usize, child: SpecificationNode) -> Result<(), SpecError> {
        self.check_unsealed()?;
        insert_child(&mut self.children, index, child)
    }

    /// # Errors
    ///
    /// Returns [`SpecError::Sealed`] if the node is sealed.
    pub fn push_child(&mut self, child: SpecificationNode) -> Result<(), SpecError> {
        self.check_unsealed()?;
        self.children.push(child);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`SpecError::Sealed`] if the node is sealed, or
    /// [`SpecError::IndexOutOfRange`] for a bad index.
    pub fn remove_child(&mut self, index: usize) -> Result<SpecificationNode, SpecError> {
        self.check_unsealed()?;
        remove_child(&mut self.children, index)
    }

    fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert(TYPE_KEY.to_string(), Value::String(self.node_type.clone()));
        if let Some(value) = &self.value {
            map.insert(VALUE_KEY.to_string(), Value::String(value.clone()));
        }
        for (name, value) in &self.attributes {
            map.insert(format!("{ATTRIBUTE_PREFIX}{name}"), Value::String(value.clone()));
        }
        if !self.children.is_empty() {
            map.insert(CHILDREN_KEY.to_string(), children_to_json(&self.children));
        }
        Value::Object(map)
    }

    /// Parse a node object. `implied_type` comes from the compact form's key.
    fn from_json(value: &Value, implied_type: Option<&str>) -> Result<Self, SpecError> {
        match value {
            Value::String(text) => {
                let node_type = implied_type
                    .ok_or_else(|| malformed("bare string value without a node type"))?;
                Ok(Self::new(node_type).with_value(text.clone()))
            }
            Value::Object(map) => {
                let node_type = match (map.get(TYPE_KEY), implied_type) {
                    (Some(Value::String(t)), Some(implied)) if t != implied => {
                        return Err(malformed(format!(
                            "node keyed '{implied}' declares type '{t}'"
                        )))
                    }
                    (Some(Value::String(t)), _) => t.clone(),
                    (Some(other), _) => {
                        return Err(malformed(format!("'{TYPE_KEY}' must be a string, got {other}")))
                    }
                    (None, Some(implied)) => implied.to_string(),
                    (None, None) => return Err(malformed(format!("node is missing '{TYPE_KEY}'"))),
                };
                if node_type.is_empty() {
                    return Err(malformed("node type must not be empty"));
                }
                let mut node = Self::new(node_type);
                for (key, entry) in map {
                    if key == TYPE_KEY {
                        continue;
                    }
                    if key == VALUE_KEY {
                        node.value = Some(scalar(entry, key)?);
                    } else if let Some(name) = key.strip_prefix(ATTRIBUTE_PREFIX) {
                        if name.is_empty() {
                            return Err(malformed("attribute name must not be empty"));
                        }
                        node.attributes.insert(name.to_string(), scalar(entry, key)?);
                    } else {
                        parse_child_entry(key, entry, &mut node.children)?;
                    }
                }
                Ok(node)
            }
            other => Err(malformed(format!("expected a node object, got {other}"))),
        }
    }
}

fn scalar(value: &Value, key: &str) -> Result<String, SpecError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(malformed(format!("'{key}' must be a scalar, got {other}"))),
    }
}

fn children_to_json(children: &[SpecificationNode]) -> Value {
    Value::Array(children.iter().map(SpecificationNode::to_json).collect())
}

/// Parse one non-reserved key of a node or root object into children.
fn parse_child_entry(
    key: &str,
    entry: &Value,
    children: &mut Vec<SpecificationNode>,
) -> Result<(), SpecError> {
    if key == CHILDREN_KEY {
        let Value::Array(items) = entry else {
            return Err(malformed(format!("'{CHILDREN_KEY}' must be an array")));
        };
        for item in items {
            if !item.is_object() {
                return Err(malformed(format!("'{CHILDREN_KEY}' entries must be objects")));
            }
            children.push(SpecificationNode::from_json(item, None)?);
        }
        return Ok(());
    }
    if key.starts_with('_') {
        return Err(malformed(format!("unknown reserved key '{key}'")));
    }
    match entry {
        Value::Array(items) => {
            for item in items {
                children.push(SpecificationNode::from_json(item, Some(key))?);
            }
            Ok(())
        }
        other => {
            children.push(SpecificationNode::from_json(other, Some(key))?);
            Ok(())
        }
    }
}

fn insert_child(
    children: &mut Vec<SpecificationNode>,
    index: usize,
    child: SpecificationNode,
) -> Result<(), SpecError> {
    if index > children.len() {
        return Err(SpecError::IndexOutOfRange {
            index,
            len: children.len(),
        });
    }
    children.insert(index, child);
    Ok(())
}

fn remove_child(
    children: &mut Vec<SpecificationNode>,
    index: usize,
) -> Result<SpecificationNode, SpecError> {
    if index >= children.len() {
        return Err(SpecError::IndexOutOfRange {
            index,
            len: children.len(),
        });
    }
    Ok(children.remove(index))
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

/// Root of a specification tree.
#[derive(Debug, Clone, Default)]
pub struct Specification {
    children: Vec<SpecificationNode>,
    sealed: bool,
}

impl PartialEq for Specification {
    fn eq(&self, other: &Self) -> bool {
        self.children == other.children
    }
}

impl Eq for Specification {}

impl Specification {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the JSON text form.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Malformed`] for invalid JSON or any structural
    /// violation (missing types, non-scalar values, unknown reserved keys).
    pub fn parse(text: &str) -> Result<Self, SpecError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| malformed(format!("invalid JSON: {e}")))?;
        Self::from_value(&value)
    }

    /// Build a tree from an already-decoded JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Malformed`] on structural violations.
    pub fn from_value(value: &Value) -> Result<Self, SpecError> {
        let mut spec = Self::new();
        match value {
            Value::Null => {}
            Value::Object(map) => {
                for (key, entry) in map {
                    if key == TYPE_KEY || key == VALUE_KEY || key.starts_with(ATTRIBUTE_PREFIX) {
                        return Err(malformed(format!(
                            "specification root may not carry '{key}'"
                        )));
                    }
                    parse_child_entry(key, entry, &mut spec.children)?;
                }
            }
            other => return Err(malformed(format!("root must be an object, got {other}"))),
        }
        Ok(spec)
    }

    /// The canonical JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(CHILDREN_KEY.to_string(), children_to_json(&self.children));
        Value::Object(map)
    }

    /// Serialize to compact JSON text.
    #[must_use]
    pub fn serialize(&self) -> String {
        self.to_value().to_string()
    }

    /// Serialize to indented JSON text.
    #[must_use]
    pub fn serialize_pretty(&self) -> String {
        serde_json::to_string_pretty(&self.to_value()).unwrap_or_else(|_| self.serialize())
    }

    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub fn child(&self, index: usize) -> Option<&SpecificationNode> {
        self.children.get(index)
    }

    pub fn child_mut(&mut self, index: usize) -> Option<&mut SpecificationNode> {
        self.children.get_mut(index)
    }

    pub fn children(&self) -> impl Iterator<Item = &SpecificationNode> {
        self.children.iter()
    }

    pub fn children_of_type<'a>(
        &'a self,
        node_type: &'a str,
    ) -> impl Iterator<Item = &'a SpecificationNode> + 'a {
        self.children.iter().filter(move |c| c.node_type == node_type)
    }

    /// Value of the first child of `node_type`, if it has one.
    #[must_use]
    pub fn first_value(&self, node_type: &str) -> Option<&str> {
        self.children
            .iter()
            .filter(|c| c.node_type == node_type)
            .find_map(SpecificationNode::value)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Seal the tree; every node becomes immutable.
    pub fn seal(&mut self) {
        self.sealed = true;
        for child in &mut self.children {
            child.seal();
        }
    }

    /// Consume and return a sealed tree.
    #[must_use]
    pub fn sealed(mut self) -> Self {
        self.seal();
        self
    }

    /// # Errors
    ///
    /// Returns [`SpecError::Sealed`] or [`SpecError::IndexOutOfRange`].
    pub fn add_child(&mut self, index: usize, child: SpecificationNode) -> Result<(), SpecError> {
        if self.sealed {
            return Err(SpecError::Sealed);
        }
        insert_child(&mut self.children, index, child)
    }

    /// # Errors
    ///
    /// Returns [`SpecError::Sealed`] if the tree is sealed.
    pub fn push_child(&mut self, child: SpecificationNode) -> Result<(), SpecError> {
        if self.sealed {
            return Err(SpecError::Sealed);
        }
        self.children.push(child);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`SpecError::Sealed`] or [`SpecError::IndexOutOfRange`].
    pub fn remove_child(&mut self, index: usize) -> Result<SpecificationNode, SpecError> {
        if self.sealed {
            return Err(SpecError::Sealed);
        }
        remove_child(&mut self.children, index)
    }
}

impl fmt::Display for Specification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl Serialize for Specification {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Specification {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(serde::de::Error::custom)
    }
}
