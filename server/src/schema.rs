//! Declarative payload schemas and their validator.
//!
//! A [`Schema`] describes the exact shape of a JSON object: which keys it
//! must have, which it may have, and the type and bounds of each value.
//! Validation is strict. Unknown keys are rejected, missing required keys are
//! rejected, and the first failure found (depth-first, in field declaration
//! order) is reported with the path of the offending value.
//!
//! # Example
//!
//! ```rust
//! use gatehouse_server::schema::{Schema, SchemaNode};
//! use serde_json::json;
//!
//! let schema = Schema::new()
//!     .field("user", SchemaNode::string(1, None))
//!     .field("remember", SchemaNode::boolean().optional());
//!
//! assert!(schema.validate(&json!({"user": "ann"})).is_ok());
//!
//! let err = schema.validate(&json!({"user": ""})).unwrap_err();
//! assert_eq!(err.path, "user");
//! ```

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

/// A failed schema check.
///
/// `path` locates the offending value (`items[2].qty`); the display form
/// always quotes it so a client can tell which field to fix.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("value \"{path}\" {message}")]
pub struct ValidationError {
    /// Dotted path to the offending value. Empty for the payload root.
    pub path: String,
    /// What is wrong with the value.
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Constraints for a scalar value.
#[derive(Debug, Clone)]
pub enum Primitive {
    /// A JSON number within `[min, max]`. `max` is unbounded when `None`.
    Number { min: f64, max: Option<f64> },
    /// A JSON string whose length (in characters) is within
    /// `[min_length, max_length]`, optionally matching `pattern`.
    String {
        min_length: usize,
        max_length: Option<usize>,
        pattern: Option<Regex>,
    },
    /// A JSON boolean.
    Boolean,
}

impl Primitive {
    fn kind_name(&self) -> &'static str {
        match self {
            Self::Number { .. } => "a number",
            Self::String { .. } => "a string",
            Self::Boolean => "a boolean",
        }
    }
}

/// The shape a schema node requires.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Primitive(Primitive),
    /// Every element must satisfy the inner node.
    Array(Box<SchemaNode>),
    /// A nested object, checked with the same strict key-set rules.
    Object(Schema),
}

/// One node of a schema: a shape plus whether it may be left out.
#[derive(Debug, Clone)]
pub struct SchemaNode {
    pub optional: bool,
    pub kind: NodeKind,
}

impl SchemaNode {
    fn required(kind: NodeKind) -> Self {
        Self {
            optional: false,
            kind,
        }
    }

    /// A number with an inclusive lower bound and optional inclusive upper bound.
    #[must_use]
    pub fn number(min: f64, max: Option<f64>) -> Self {
        Self::required(NodeKind::Primitive(Primitive::Number { min, max }))
    }

    /// A string with inclusive length bounds.
    #[must_use]
    pub fn string(min_length: usize, max_length: Option<usize>) -> Self {
        Self::required(NodeKind::Primitive(Primitive::String {
            min_length,
            max_length,
            pattern: None,
        }))
    }

    /// A string with inclusive length bounds that must also match `pattern`.
    #[must_use]
    pub fn string_matching(min_length: usize, max_length: Option<usize>, pattern: Regex) -> Self {
        Self::required(NodeKind::Primitive(Primitive::String {
            min_length,
            max_length,
            pattern: Some(pattern),
        }))
    }

    #[must_use]
    pub fn boolean() -> Self {
        Self::required(NodeKind::Primitive(Primitive::Boolean))
    }

    /// An array whose every element satisfies `element`.
    #[must_use]
    pub fn array(element: SchemaNode) -> Self {
        Self::required(NodeKind::Array(Box::new(element)))
    }

    /// A nested object.
    #[must_use]
    pub fn object(schema: Schema) -> Self {
        Self::required(NodeKind::Object(schema))
    }

    /// Marks this node as optional (builder pattern).
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// The expected key set of a JSON object, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<(String, SchemaNode)>,
}

impl Schema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field (builder pattern). A repeated name replaces the earlier
    /// node but keeps its position.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, node: SchemaNode) -> Self {
        let name = name.into();
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = node,
            None => self.fields.push((name, node)),
        }
        self
    }

    /// Looks up a field's node by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SchemaNode> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, node)| node)
    }

    /// Iterates over fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &SchemaNode)> {
        self.fields.iter().map(|(name, node)| (name.as_str(), node))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Validates a payload against this schema.
    ///
    /// The payload itself must be a JSON object.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] encountered.
    pub fn validate(&self, payload: &Value) -> Result<(), ValidationError> {
        match payload {
            Value::Object(map) => validate_object(map, self, ""),
            _ => Err(ValidationError::new("", "must be an object")),
        }
    }
}

/// Validates a payload against a schema. Free-function form of
/// [`Schema::validate`].
///
/// # Errors
///
/// Returns the first [`ValidationError`] encountered.
pub fn validate(payload: &Value, schema: &Schema) -> Result<(), ValidationError> {
    schema.validate(payload)
}

fn join(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn validate_object(
    payload: &Map<String, Value>,
    schema: &Schema,
    path: &str,
) -> Result<(), ValidationError> {
    if let Some(unknown) = payload.keys().find(|key| schema.get(key).is_none()) {
        return Err(ValidationError::new(join(path, unknown), "is not allowed"));
    }

    for (key, node) in schema.fields() {
        let field_path = join(path, key);
        match payload.get(key) {
            None if node.optional => continue,
            None => return Err(ValidationError::new(field_path, "is missing")),
            Some(value) => validate_node(value, node, &field_path)?,
        }
    }

    Ok(())
}

fn validate_node(value: &Value, node: &SchemaNode, path: &str) -> Result<(), ValidationError> {
    match &node.kind {
        NodeKind::Primitive(primitive) => validate_primitive(value, primitive, path),
        NodeKind::Array(element) => {
            let items = value
                .as_array()
                .ok_or_else(|| ValidationError::new(path, "must be an array"))?;
            items
                .iter()
                .enumerate()
                .try_for_each(|(i, item)| validate_node(item, element, &format!("{path}[{i}]")))
        }
        NodeKind::Object(schema) => {
            let map = value
                .as_object()
                .ok_or_else(|| ValidationError::new(path, "must be an object"))?;
            validate_object(map, schema, path)
        }
    }
}

fn validate_primitive(
    value: &Value,
    primitive: &Primitive,
    path: &str,
) -> Result<(), ValidationError> {
    let type_mismatch = || ValidationError::new(path, format!("must be {}", primitive.kind_name()));

    match primitive {
        Primitive::Number { min, max } => {
            let n = value.as_f64().ok_or_else(type_mismatch)?;
            if n < *min {
                return Err(ValidationError::new(
                    path,
                    format!("is less than the minimum of {min}"),
                ));
            }
            if let Some(max) = max {
                if n > *max {
                    return Err(ValidationError::new(
                        path,
                        format!("is greater than the maximum of {max}"),
                    ));
                }
            }
        }
        Primitive::String {
            min_length,
            max_length,
            pattern,
        } => {
            let s = value.as_str().ok_or_else(type_mismatch)?;
            let len = s.chars().count();
            if len < *min_length {
                return Err(ValidationError::new(
                    path,
                    format!("is shorter than {min_length} characters"),
                ));
            }
            if let Some(max_length) = max_length {
                if len > *max_length {
                    return Err(ValidationError::new(
                        path,
                        format!("is longer than {max_length} characters"),
                    ));
                }
            }
            if let Some(pattern) = pattern {
                if !pattern.is_match(s) {
                    return Err(ValidationError::new(path, "has an invalid format"));
                }
            }
        }
        Primitive::Boolean => {
            if !value.is_boolean() {
                return Err(type_mismatch());
            }
        }
    }

    Ok(())
}
