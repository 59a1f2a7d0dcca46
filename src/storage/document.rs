//! Document representation
//!
//! A Document is a typed view of one stored record: field values keyed by
//! logical field name plus the primary key once the store has assigned one.
//! Embedded documents and resolved references are both held as
//! [`Value::Document`]; an unresolved reference is the raw id string.

use crate::error::{Error, Result};
use crate::schema::{DocumentType, FieldType, SchemaRegistry, ID_FIELD, ID_KEY};
use crate::validation;
use docspec::WireMap;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// A document instance
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    doc_type: String,
    /// Primary key, assigned by the store on first insert
    pub id: Option<String>,
    /// Field values keyed by logical name
    pub fields: Fields,
}

/// Field values of a document
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    /// Embedded document, or the target of a resolved reference
    Document(Box<Document>),
}

/// A map of field names to values
pub type Fields = BTreeMap<String, Value>;

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Untyped conversion from a wire value
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to the stored wire form. Embedded documents are stored
    /// inline, any other document is stored as its primary key.
    pub fn to_stored(&self, registry: &SchemaRegistry) -> Result<JsonValue> {
        Ok(match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .ok_or_else(|| Error::validation(format!("cannot store non-finite float {f}")))?,
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Array(items) => JsonValue::Array(
                items
                    .iter()
                    .map(|v| v.to_stored(registry))
                    .collect::<Result<_>>()?,
            ),
            Value::Object(map) => {
                let mut out = WireMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.to_stored(registry)?);
                }
                JsonValue::Object(out)
            }
            Value::Document(doc) => {
                if registry.get(&doc.doc_type)?.is_embedded() {
                    JsonValue::Object(doc.to_stored(registry)?)
                } else {
                    let id = doc.id.as_ref().ok_or_else(|| {
                        Error::validation(format!(
                            "cannot store a reference to an unsaved '{}'",
                            doc.doc_type
                        ))
                    })?;
                    JsonValue::String(id.clone())
                }
            }
        })
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Document(Box::new(doc))
    }
}

impl Document {
    /// Create a new, unsaved document with declared defaults applied
    pub fn new(doc_type: &DocumentType) -> Self {
        let fields = doc_type
            .fields()
            .iter()
            .filter_map(|f| f.default.as_ref().map(|d| (f.name.clone(), Value::from_json(d))))
            .collect();
        Self {
            doc_type: doc_type.name().to_string(),
            id: None,
            fields,
        }
    }

    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Set a field value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Get a field value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Marshal a stored record. Undeclared keys are kept untyped.
    pub fn from_stored(
        registry: &SchemaRegistry,
        doc_type: &DocumentType,
        raw: &WireMap,
    ) -> Result<Self> {
        let mut doc = Self {
            doc_type: doc_type.name().to_string(),
            id: None,
            fields: Fields::new(),
        };
        for (key, value) in raw {
            match doc_type.lookup_db(key) {
                Some(field) if field.name == ID_FIELD && !doc_type.is_embedded() => {
                    doc.id = match value {
                        JsonValue::String(s) => Some(s.clone()),
                        JsonValue::Null => None,
                        other => Some(other.to_string()),
                    };
                }
                Some(field) => {
                    let typed = marshal(registry, &field.field_type, value)?;
                    doc.fields.insert(field.name.clone(), typed);
                }
                None => {
                    doc.fields.insert(key.clone(), Value::from_json(value));
                }
            }
        }
        Ok(doc)
    }

    /// Render the stored record, keyed by physical field names
    pub fn to_stored(&self, registry: &SchemaRegistry) -> Result<WireMap> {
        let doc_type = registry.get(&self.doc_type)?;
        let mut out = WireMap::new();
        if let Some(id) = &self.id {
            out.insert(ID_KEY.to_string(), JsonValue::String(id.clone()));
        }
        for (name, value) in &self.fields {
            let key = doc_type
                .lookup(name)
                .map(|f| f.db_field.clone())
                .unwrap_or_else(|| name.clone());
            out.insert(key, value.to_stored(registry)?);
        }
        Ok(out)
    }

    /// Check required fields, declared types and choices, recursing into
    /// embedded documents
    pub fn validate(&self, registry: &SchemaRegistry) -> Result<()> {
        let doc_type = registry.get(&self.doc_type)?;
        for field in doc_type.fields() {
            if field.name == ID_FIELD && !doc_type.is_embedded() {
                continue;
            }
            let value = match self.fields.get(&field.name) {
                Some(v) if !v.is_null() => v,
                _ if field.required => {
                    return Err(Error::validation(format!(
                        "field '{}' of '{}' is required",
                        field.name, self.doc_type
                    )))
                }
                _ => continue,
            };

            let stored = value.to_stored(registry)?;
            if !field.field_type.accepts(&stored) {
                return Err(Error::validation(format!(
                    "field '{}' of '{}' expects {}, got {}",
                    field.name,
                    self.doc_type,
                    field.field_type.describe(),
                    docspec::describe(&stored)
                )));
            }
            if let Some(choices) = &field.choices {
                if !choices.contains(&stored) {
                    return Err(Error::validation(format!(
                        "value {stored} is not a valid choice for '{}'",
                        field.name
                    )));
                }
            }
            validate_nested(registry, &field.field_type, value)?;
        }
        Ok(())
    }
}

fn marshal(registry: &SchemaRegistry, ty: &FieldType, raw: &JsonValue) -> Result<Value> {
    Ok(match (ty, raw) {
        (FieldType::Embedded(name), JsonValue::Object(map)) => {
            let embedded = registry.get(name)?;
            Value::Document(Box::new(Document::from_stored(registry, &embedded, map)?))
        }
        (FieldType::List(inner), JsonValue::Array(items)) => Value::Array(
            items
                .iter()
                .map(|item| marshal(registry, inner, item))
                .collect::<Result<_>>()?,
        ),
        (FieldType::Map(inner), JsonValue::Object(map)) => {
            let mut out = BTreeMap::new();
            for (k, v) in map {
                out.insert(k.clone(), marshal(registry, inner, v)?);
            }
            Value::Object(out)
        }
        _ => Value::from_json(raw),
    })
}

fn validate_nested(registry: &SchemaRegistry, ty: &FieldType, value: &Value) -> Result<()> {
    match (ty, value) {
        (FieldType::Embedded(_), Value::Document(doc)) => doc.validate(registry),
        (FieldType::List(inner), Value::Array(items)) => items
            .iter()
            .try_for_each(|item| validate_nested(registry, inner, item)),
        (FieldType::Map(inner), Value::Object(map)) => {
            for (key, item) in map {
                validation::validate_map_key(key)?;
                validate_nested(registry, inner, item)?;
            }
            Ok(())
        }
        (FieldType::Dict, Value::Object(map)) => {
            map.keys().try_for_each(|key| validation::validate_map_key(key))?;
            Ok(())
        }
        _ => Ok(()),
    }
}
