//! Field handles: typed builders for predicate and mutation expressions
//!
//! A [`Field`] is a resolved path plus the descriptor of its last segment.
//! Every builder checks the operand against the declared type before an
//! expression exists, so a wrong operand fails here and never on the wire.

use super::{resolve, DocumentType, FieldDescriptor, FieldType, PathMode, SchemaRegistry};
use crate::error::{Error, Result};
use docspec::{Mutation, MutationOp, Operator, Predicate};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    descriptor: FieldDescriptor,
    query_path: String,
    update_path: String,
}

impl Field {
    /// Resolve `path` on `doc_type` in both query and update mode
    pub fn resolve(registry: &SchemaRegistry, doc_type: &DocumentType, path: &str) -> Result<Self> {
        let query = resolve(registry, doc_type, path, PathMode::Query)?;
        let update = resolve(registry, doc_type, path, PathMode::Update)?;
        Ok(Self {
            descriptor: query.descriptor,
            query_path: query.path,
            update_path: update.path,
        })
    }

    pub fn descriptor(&self) -> &FieldDescriptor {
        &self.descriptor
    }

    pub fn field_type(&self) -> &FieldType {
        &self.descriptor.field_type
    }

    /// Physical path used in filters and projections
    pub fn query_path(&self) -> &str {
        &self.query_path
    }

    /// Physical path used in update documents
    pub fn update_path(&self) -> &str {
        &self.update_path
    }

    // =========================================================================
    // Operand checks
    // =========================================================================

    fn check_operand(&self, value: &JsonValue) -> Result<()> {
        if self.field_type().accepts_operand(value) {
            Ok(())
        } else {
            Err(self.type_error(value))
        }
    }

    fn check_value(&self, value: &JsonValue) -> Result<()> {
        if self.field_type().accepts(value) {
            Ok(())
        } else {
            Err(self.type_error(value))
        }
    }

    fn check_element(&self, value: &JsonValue) -> Result<JsonValue> {
        match self.field_type() {
            FieldType::List(inner) if inner.accepts(value) => Ok(value.clone()),
            FieldType::Generic => Ok(value.clone()),
            FieldType::List(_) => Err(self.type_error(value)),
            _ => Err(self.require("a list")),
        }
    }

    fn check_elements<I, V>(&self, values: I) -> Result<JsonValue>
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        values
            .into_iter()
            .map(|v| self.check_element(&v.into()))
            .collect::<Result<Vec<_>>>()
            .map(JsonValue::Array)
    }

    fn check_members<I, V>(&self, values: I) -> Result<JsonValue>
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        let mut items = Vec::new();
        for value in values {
            let value = value.into();
            self.check_operand(&value)?;
            items.push(value);
        }
        Ok(JsonValue::Array(items))
    }

    fn require_list(&self) -> Result<()> {
        match self.field_type() {
            FieldType::List(_) | FieldType::Generic => Ok(()),
            _ => Err(self.require("a list")),
        }
    }

    fn require_numeric(&self) -> Result<()> {
        if self.field_type().element().is_numeric() {
            Ok(())
        } else {
            Err(self.require("a number"))
        }
    }

    fn require_text(&self) -> Result<()> {
        if self.field_type().element().is_text() {
            Ok(())
        } else {
            Err(self.require("a string"))
        }
    }

    fn type_error(&self, value: &JsonValue) -> Error {
        Error::validation(format!(
            "field '{}' expects {}, got {}",
            self.descriptor.name,
            self.field_type().describe(),
            docspec::describe(value)
        ))
    }

    fn require(&self, what: &str) -> Error {
        Error::validation(format!(
            "field '{}' is {}, not {}",
            self.descriptor.name,
            self.field_type().describe(),
            what
        ))
    }

    fn compare(&self, operator: Operator, operand: JsonValue) -> Result<Predicate> {
        Ok(Predicate::compare(self.query_path.clone(), operator, operand)?)
    }

    fn mutate(&self, op: MutationOp, path: &str, operand: JsonValue) -> Result<Mutation> {
        Ok(Mutation::new(op, path, operand)?)
    }

    // =========================================================================
    // Comparison
    // =========================================================================

    pub fn eq(&self, value: impl Into<JsonValue>) -> Result<Predicate> {
        let value = value.into();
        self.check_operand(&value)?;
        Ok(Predicate::equals(self.query_path.clone(), value)?)
    }

    /// Match any of `values`, dropping those this field could never hold.
    /// `None` when nothing is left to look up.
    pub fn lookup<I, V>(&self, values: I) -> Result<Option<Predicate>>
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        let mut kept: Vec<JsonValue> = values
            .into_iter()
            .map(Into::into)
            .filter(|v| !v.is_null() && self.field_type().accepts(v))
            .collect();
        let predicate = match kept.len() {
            0 => return Ok(None),
            1 => Predicate::equals(self.query_path.clone(), kept.remove(0))?,
            _ => self.compare(Operator::In, JsonValue::Array(kept))?,
        };
        Ok(Some(predicate))
    }

    pub fn ne(&self, value: impl Into<JsonValue>) -> Result<Predicate> {
        let value = value.into();
        self.check_operand(&value)?;
        self.compare(Operator::Ne, value)
    }

    pub fn lt(&self, value: impl Into<JsonValue>) -> Result<Predicate> {
        let value = value.into();
        self.check_operand(&value)?;
        self.compare(Operator::Lt, value)
    }

    pub fn lte(&self, value: impl Into<JsonValue>) -> Result<Predicate> {
        let value = value.into();
        self.check_operand(&value)?;
        self.compare(Operator::Lte, value)
    }

    pub fn gt(&self, value: impl Into<JsonValue>) -> Result<Predicate> {
        let value = value.into();
        self.check_operand(&value)?;
        self.compare(Operator::Gt, value)
    }

    pub fn gte(&self, value: impl Into<JsonValue>) -> Result<Predicate> {
        let value = value.into();
        self.check_operand(&value)?;
        self.compare(Operator::Gte, value)
    }

    // =========================================================================
    // Containment / existence
    // =========================================================================

    pub fn in_<I, V>(&self, values: I) -> Result<Predicate>
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        let operand = self.check_members(values)?;
        self.compare(Operator::In, operand)
    }

    pub fn nin<I, V>(&self, values: I) -> Result<Predicate>
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        let operand = self.check_members(values)?;
        self.compare(Operator::Nin, operand)
    }

    pub fn all<I, V>(&self, values: I) -> Result<Predicate>
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        let operand = self.check_members(values)?;
        self.compare(Operator::All, operand)
    }

    pub fn size(&self, len: u64) -> Result<Predicate> {
        self.require_list()?;
        self.compare(Operator::Size, len.into())
    }

    pub fn exists(&self, present: bool) -> Result<Predicate> {
        self.compare(Operator::Exists, present.into())
    }

    /// `value % divisor == remainder`
    pub fn mod_(&self, divisor: i64, remainder: i64) -> Result<Predicate> {
        self.require_numeric()?;
        self.compare(Operator::Mod, JsonValue::from(vec![divisor, remainder]))
    }

    /// Stored BSON type, by numeric code or alias
    pub fn type_(&self, code: impl Into<JsonValue>) -> Result<Predicate> {
        self.compare(Operator::Type, code.into())
    }

    /// Server-side expression; not evaluated by the in-memory store
    pub fn where_(&self, expression: &str) -> Result<Predicate> {
        self.compare(Operator::Where, expression.into())
    }

    /// Keep the first `n` (or last, when negative) elements in projections
    pub fn slice(&self, n: i64) -> Result<Predicate> {
        self.require_list()?;
        self.compare(Operator::Slice, n.into())
    }

    pub fn slice_range(&self, skip: i64, limit: i64) -> Result<Predicate> {
        self.require_list()?;
        self.compare(Operator::Slice, JsonValue::from(vec![skip, limit]))
    }

    /// Match list elements against `inner`, written with full field paths
    pub fn elem_match(&self, inner: &Predicate) -> Result<Predicate> {
        self.require_list()?;
        Ok(Predicate::elem_match(self.query_path.clone(), inner)?)
    }

    // =========================================================================
    // Text match
    // =========================================================================

    /// Raw regular expression with optional flags
    pub fn matches(&self, pattern: &str, options: Option<&str>) -> Result<Predicate> {
        self.require_text()?;
        regex::Regex::new(pattern)
            .map_err(|e| Error::validation(format!("invalid pattern '{pattern}': {e}")))?;
        Ok(Predicate::regex(self.query_path.clone(), pattern, options)?)
    }

    fn text(&self, prefix: &str, needle: &str, suffix: &str, insensitive: bool) -> Result<Predicate> {
        self.require_text()?;
        let pattern = format!("{prefix}{}{suffix}", regex::escape(needle));
        let options = if insensitive { Some("i") } else { None };
        Ok(Predicate::regex(self.query_path.clone(), pattern, options)?)
    }

    pub fn exact(&self, s: &str) -> Result<Predicate> {
        self.text("^", s, "$", false)
    }

    pub fn iexact(&self, s: &str) -> Result<Predicate> {
        self.text("^", s, "$", true)
    }

    pub fn starts_with(&self, s: &str) -> Result<Predicate> {
        self.text("^", s, "", false)
    }

    pub fn istarts_with(&self, s: &str) -> Result<Predicate> {
        self.text("^", s, "", true)
    }

    pub fn ends_with(&self, s: &str) -> Result<Predicate> {
        self.text("", s, "$", false)
    }

    pub fn iends_with(&self, s: &str) -> Result<Predicate> {
        self.text("", s, "$", true)
    }

    pub fn contains(&self, s: &str) -> Result<Predicate> {
        self.text("", s, "", false)
    }

    pub fn icontains(&self, s: &str) -> Result<Predicate> {
        self.text("", s, "", true)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    pub fn set(&self, value: impl Into<JsonValue>) -> Result<Mutation> {
        let value = value.into();
        self.check_value(&value)?;
        self.mutate(MutationOp::Set, &self.update_path, value)
    }

    pub fn unset(&self) -> Result<Mutation> {
        Ok(Mutation::unset(self.update_path.clone())?)
    }

    pub fn inc(&self, amount: impl Into<JsonValue>) -> Result<Mutation> {
        self.require_numeric()?;
        let amount = amount.into();
        self.check_value(&amount)?;
        self.mutate(MutationOp::Inc, &self.update_path, amount)
    }

    /// `inc` by the negated amount
    pub fn dec(&self, amount: impl Into<JsonValue>) -> Result<Mutation> {
        let amount = amount.into();
        let negated = negate(&amount).ok_or_else(|| self.type_error(&amount))?;
        self.inc(negated)
    }

    pub fn push(&self, value: impl Into<JsonValue>) -> Result<Mutation> {
        let value = self.check_element(&value.into())?;
        self.mutate(MutationOp::Push, &self.update_path, value)
    }

    pub fn push_all<I, V>(&self, values: I) -> Result<Mutation>
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        let values = self.check_elements(values)?;
        self.mutate(MutationOp::PushAll, &self.update_path, values)
    }

    pub fn pull(&self, value: impl Into<JsonValue>) -> Result<Mutation> {
        let value = self.check_element(&value.into())?;
        self.mutate(MutationOp::Pull, &self.update_path, value)
    }

    pub fn pull_all<I, V>(&self, values: I) -> Result<Mutation>
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        let values = self.check_elements(values)?;
        self.mutate(MutationOp::PullAll, &self.update_path, values)
    }

    /// Remove every element matching `condition`.
    ///
    /// For lists of embedded documents the condition is written with full
    /// paths (`comments.author`); for scalar lists it is written against
    /// this field itself.
    pub fn pull_matching(&self, condition: &Predicate) -> Result<Mutation> {
        self.require_list()?;
        let mut compiled = condition.compile_relative(&self.query_path);
        let operand = match compiled.remove(&self.query_path) {
            Some(own) if compiled.is_empty() => own,
            Some(own) => {
                compiled.insert(self.query_path.clone(), own);
                JsonValue::Object(compiled)
            }
            None => JsonValue::Object(compiled),
        };
        self.mutate(MutationOp::Pull, &self.update_path, operand)
    }

    pub fn add_to_set(&self, value: impl Into<JsonValue>) -> Result<Mutation> {
        let value = self.check_element(&value.into())?;
        self.mutate(MutationOp::AddToSet, &self.update_path, value)
    }

    /// Remove the last element
    pub fn pop(&self) -> Result<Mutation> {
        self.require_list()?;
        Ok(Mutation::pop(self.update_path.clone(), false)?)
    }

    /// Remove the first element
    pub fn pop_first(&self) -> Result<Mutation> {
        self.require_list()?;
        Ok(Mutation::pop(self.update_path.clone(), true)?)
    }

    /// Replace the list element matched by the filter
    pub fn replace_with(&self, value: impl Into<JsonValue>) -> Result<Mutation> {
        let value = self.check_element(&value.into())?;
        let path = format!("{}.{}", self.update_path, super::path::POSITIONAL);
        self.mutate(MutationOp::Set, &path, value)
    }
}

fn negate(value: &JsonValue) -> Option<JsonValue> {
    if let Some(i) = value.as_i64() {
        return i.checked_neg().map(JsonValue::from);
    }
    value
        .as_f64()
        .and_then(|f| serde_json::Number::from_f64(-f))
        .map(JsonValue::Number)
}
