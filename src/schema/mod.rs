//! Schema definitions for docmap
//!
//! Document types are declared explicitly through a builder:
//! - Ordered field descriptors with types
//! - Required vs optional fields, defaults and choices
//! - Embedded document types and references to other types
//! - Inheritance as explicit descriptor-list composition
//!
//! Every type lives in a [`SchemaRegistry`] that the application owns and
//! passes to the mapper, the eager-load resolver and the index synchronizer.

mod field;
mod path;

pub use field::Field;
pub use path::{resolve, PathMode, ResolvedPath};

use crate::error::{Error, Result};
use crate::validation;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Physical key of the primary key field
pub const ID_KEY: &str = "_id";

/// Logical name of the primary key field
pub const ID_FIELD: &str = "id";

/// Database used by types that don't name one
pub const DEFAULT_DATABASE: &str = "docmap";

/// A field type in the schema
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    /// 24 hex character object identifier
    ObjectId,
    String,
    Int,
    Float,
    Bool,
    /// RFC 3339 string or epoch milliseconds
    DateTime,
    /// Free-form object
    Dict,
    /// Any value
    Generic,
    List(Box<FieldType>),
    /// Object with string keys and uniformly typed values
    Map(Box<FieldType>),
    /// Document type declared with [`DocumentType::embedded`]
    Embedded(String),
    Reference(RefTarget),
}

/// Target of a reference field
#[derive(Debug, Clone, PartialEq)]
pub enum RefTarget {
    /// Resolved by name on first use, so types may reference each other
    /// before both are registered
    Named(String),
    /// The owning document type
    SelfRef,
}

impl FieldType {
    pub fn list_of(inner: FieldType) -> Self {
        FieldType::List(Box::new(inner))
    }

    pub fn map_of(inner: FieldType) -> Self {
        FieldType::Map(Box::new(inner))
    }

    pub fn reference(target: impl Into<String>) -> Self {
        FieldType::Reference(RefTarget::Named(target.into()))
    }

    /// The type of a single element for list fields, the type itself otherwise
    pub fn element(&self) -> &FieldType {
        match self {
            FieldType::List(inner) => inner.element(),
            other => other,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, FieldType::List(_))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Int | FieldType::Float | FieldType::Generic)
    }

    pub fn is_text(&self) -> bool {
        matches!(self, FieldType::String | FieldType::Generic)
    }

    /// Reference target, looking through one level of list nesting
    pub fn reference_target(&self) -> Option<&RefTarget> {
        match self.element() {
            FieldType::Reference(target) => Some(target),
            _ => None,
        }
    }

    /// Human-readable type name for error messages
    pub fn describe(&self) -> String {
        match self {
            FieldType::ObjectId => "object id".to_string(),
            FieldType::String => "string".to_string(),
            FieldType::Int => "integer".to_string(),
            FieldType::Float => "float".to_string(),
            FieldType::Bool => "bool".to_string(),
            FieldType::DateTime => "datetime".to_string(),
            FieldType::Dict => "object".to_string(),
            FieldType::Generic => "any".to_string(),
            FieldType::List(inner) => format!("list of {}", inner.describe()),
            FieldType::Map(inner) => format!("map of {}", inner.describe()),
            FieldType::Embedded(name) => format!("embedded {name}"),
            FieldType::Reference(RefTarget::Named(name)) => format!("reference to {name}"),
            FieldType::Reference(RefTarget::SelfRef) => "self reference".to_string(),
        }
    }

    /// Check that a wire value has this type. Null is always accepted.
    pub fn accepts(&self, value: &JsonValue) -> bool {
        if value.is_null() {
            return true;
        }
        match self {
            FieldType::ObjectId => value.as_str().map(is_object_id).unwrap_or(false),
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::DateTime => value.is_string() || value.is_i64(),
            FieldType::Dict | FieldType::Embedded(_) => value.is_object(),
            FieldType::Generic => true,
            FieldType::List(inner) => value
                .as_array()
                .map(|items| items.iter().all(|item| inner.accepts(item)))
                .unwrap_or(false),
            FieldType::Map(inner) => value
                .as_object()
                .map(|map| map.values().all(|item| inner.accepts(item)))
                .unwrap_or(false),
            FieldType::Reference(_) => {
                value.as_str().map(is_object_id).unwrap_or(false)
                    || value
                        .get(ID_KEY)
                        .and_then(JsonValue::as_str)
                        .map(is_object_id)
                        .unwrap_or(false)
            }
        }
    }

    /// Check a query operand. A list field also accepts a single element,
    /// since list fields match when any element matches.
    pub fn accepts_operand(&self, value: &JsonValue) -> bool {
        match self {
            FieldType::List(inner) => self.accepts(value) || inner.accepts_operand(value),
            other => other.accepts(value),
        }
    }
}

/// Whether a string is a 24 character hex object id
pub fn is_object_id(s: &str) -> bool {
    s.len() == 24 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Definition of a single field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    /// Logical name used in code and dotted paths
    pub name: String,
    /// Physical key in stored documents
    pub db_field: String,
    pub field_type: FieldType,
    pub required: bool,
    pub default: Option<JsonValue>,
    /// Allowed values, checked on validate
    pub choices: Option<Vec<JsonValue>>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        Self {
            db_field: name.clone(),
            name,
            field_type,
            required: false,
            default: None,
            choices: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Int)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Float)
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Bool)
    }

    pub fn list(name: impl Into<String>, inner: FieldType) -> Self {
        Self::new(name, FieldType::list_of(inner))
    }

    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, FieldType::reference(target))
    }

    pub fn embedded(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Embedded(type_name.into()))
    }

    /// Store the field under a different physical key
    pub fn db_field(mut self, key: impl Into<String>) -> Self {
        self.db_field = key.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<JsonValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn choices<I, V>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        self.choices = Some(choices.into_iter().map(Into::into).collect());
        self
    }
}

/// A document type: an ordered list of field descriptors plus storage location
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentType {
    name: String,
    collection: String,
    database: String,
    embedded: bool,
    fields: Vec<FieldDescriptor>,
}

impl DocumentType {
    /// A top-level type with an implicit `id` primary key stored as `_id`
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            collection: name.to_lowercase(),
            name,
            database: DEFAULT_DATABASE.to_string(),
            embedded: false,
            fields: vec![FieldDescriptor::new(ID_FIELD, FieldType::ObjectId).db_field(ID_KEY)],
        }
    }

    /// A type only ever stored inside another document
    pub fn embedded(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            collection: String::new(),
            name,
            database: String::new(),
            embedded: true,
            fields: Vec::new(),
        }
    }

    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Add a field, replacing an inherited one with the same name
    pub fn field(mut self, descriptor: FieldDescriptor) -> Self {
        match self.fields.iter_mut().find(|f| f.name == descriptor.name) {
            Some(existing) => *existing = descriptor,
            None => self.fields.push(descriptor),
        }
        self
    }

    /// Inherit the parent's fields ahead of this type's own
    pub fn extends(mut self, parent: &DocumentType) -> Self {
        let mut fields: Vec<FieldDescriptor> = parent
            .fields
            .iter()
            .filter(|f| !self.fields.iter().any(|own| own.name == f.name))
            .cloned()
            .collect();
        fields.append(&mut self.fields);
        self.fields = fields;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    pub fn database_name(&self) -> &str {
        &self.database
    }

    pub fn is_embedded(&self) -> bool {
        self.embedded
    }

    /// `database.collection`, as it appears in the replication log
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Find a field by logical name
    pub fn lookup(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Find a field by physical key
    pub fn lookup_db(&self, db_field: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.db_field == db_field)
    }
}

/// Registry of all document types known to the application
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    types: HashMap<String, Arc<DocumentType>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a document type, replacing any type with the same name
    pub fn register(&mut self, doc_type: DocumentType) -> Result<Arc<DocumentType>> {
        if !doc_type.embedded {
            validation::validate_database_name(&doc_type.database)?;
            validation::validate_collection_name(&doc_type.collection)?;
        }
        for field in &doc_type.fields {
            if field.db_field.is_empty() || field.db_field.contains('.') {
                return Err(Error::validation(format!(
                    "field '{}' of '{}' has an invalid storage key '{}'",
                    field.name, doc_type.name, field.db_field
                )));
            }
        }
        let doc_type = Arc::new(doc_type);
        self.types
            .insert(doc_type.name.clone(), Arc::clone(&doc_type));
        Ok(doc_type)
    }

    /// Get a document type by name
    pub fn get(&self, name: &str) -> Result<Arc<DocumentType>> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownDocumentType {
                name: name.to_string(),
            })
    }

    /// Resolve the target type of a reference field declared on `owner`
    pub fn reference_target(
        &self,
        owner: &DocumentType,
        target: &RefTarget,
    ) -> Result<Arc<DocumentType>> {
        match target {
            RefTarget::SelfRef => self.get(&owner.name),
            RefTarget::Named(name) => self.get(name),
        }
    }

    /// Resolve a dotted logical path into a field handle
    pub fn field(&self, type_name: &str, path: &str) -> Result<Field> {
        let doc_type = self.get(type_name)?;
        Field::resolve(self, &doc_type, path)
    }

    /// List all registered types
    pub fn list(&self) -> impl Iterator<Item = &Arc<DocumentType>> {
        self.types.values()
    }
}
