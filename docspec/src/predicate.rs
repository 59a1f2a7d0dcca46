//! Predicate expressions: filters that compile to a query document
//!
//! A [`Predicate`] is a conjunction of clauses. Field clauses are keyed by
//! their physical path, so merging two predicates on the same path unions
//! their operator maps instead of producing a second key.

use serde_json::{Map, Value};

use crate::error::ExprError;
use crate::operator::Operator;
use crate::WireMap;

/// A filter condition built from one or more clauses
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Predicate {
    clauses: Vec<Clause>,
}

/// One top-level entry of a compiled query document
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// Condition on a single field path
    Field { path: String, condition: Condition },
    /// `$or` over sub-predicates
    Or(Vec<Predicate>),
    /// `$nor` over sub-predicates
    Nor(Vec<Predicate>),
    /// `$and` over sub-predicates
    And(Vec<Predicate>),
}

/// What a field clause requires of its path
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Implicit equality: compiles to the bare operand
    Equals(Value),
    /// Single-level operator map
    Operators(Vec<OperatorClause>),
}

/// One `$op: operand` entry, optionally under the `$not` wrapper
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorClause {
    pub operator: Operator,
    pub operand: Value,
    pub negated: bool,
}

impl OperatorClause {
    fn new(operator: Operator, operand: Value) -> Self {
        Self {
            operator,
            operand,
            negated: false,
        }
    }

    fn same_slot(&self, other: &OperatorClause) -> bool {
        self.operator == other.operator && self.negated == other.negated
    }
}

impl Predicate {
    /// The predicate that matches every document
    pub fn empty() -> Self {
        Self::default()
    }

    /// `path == value`, compiled without an operator wrapper
    pub fn equals(path: impl Into<String>, value: impl Into<Value>) -> Result<Self, ExprError> {
        let path = checked_path(path.into())?;
        Ok(Self::field(path, Condition::Equals(value.into())))
    }

    /// `path <operator> operand`
    ///
    /// `Operator::Eq` produces the implicit-equality form.
    pub fn compare(
        path: impl Into<String>,
        operator: Operator,
        operand: impl Into<Value>,
    ) -> Result<Self, ExprError> {
        let operand = operand.into();
        if operator == Operator::Eq {
            return Self::equals(path, operand);
        }
        let path = checked_path(path.into())?;
        operator.check_operand(&operand)?;
        let clause = OperatorClause::new(operator, operand);
        Ok(Self::field(path, Condition::Operators(vec![clause])))
    }

    /// Regular-expression match, with optional flags such as `"i"`
    pub fn regex(
        path: impl Into<String>,
        pattern: impl Into<String>,
        options: Option<&str>,
    ) -> Result<Self, ExprError> {
        let path = checked_path(path.into())?;
        let mut clauses = vec![OperatorClause::new(
            Operator::Regex,
            Value::String(pattern.into()),
        )];
        if let Some(options) = options.filter(|o| !o.is_empty()) {
            clauses.push(OperatorClause::new(
                Operator::Options,
                Value::String(options.to_string()),
            ));
        }
        Ok(Self::field(path, Condition::Operators(clauses)))
    }

    /// `$elemMatch` over the elements of the list at `path`.
    ///
    /// `inner` is written against full paths (`widgets.index`); the list
    /// prefix is stripped when it is embedded.
    pub fn elem_match(path: impl Into<String>, inner: &Predicate) -> Result<Self, ExprError> {
        let path = checked_path(path.into())?;
        let operand = Value::Object(inner.compile_relative(&path));
        Self::compare(path, Operator::ElemMatch, operand)
    }

    fn field(path: String, condition: Condition) -> Self {
        Self {
            clauses: vec![Clause::Field { path, condition }],
        }
    }

    fn single(clause: Clause) -> Self {
        Self {
            clauses: vec![clause],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    // =========================================================================
    // Combinators
    // =========================================================================

    /// Conjunction. Clauses on the same path merge their operator maps; a
    /// repeated operator takes the right-hand operand.
    pub fn and(mut self, other: Predicate) -> Self {
        for clause in other.clauses {
            self.push_clause(clause);
        }
        self
    }

    /// Disjunction. A pure disjunction on either side is extended in place
    /// rather than nested.
    pub fn or(self, other: Predicate) -> Self {
        let mut branches = self.into_branches();
        branches.extend(other.into_branches());
        Self::single(Clause::Or(branches))
    }

    /// Logical negation.
    ///
    /// Single-operator clauses use the operator's dual where one exists and
    /// a `$not` wrapper otherwise; an existing wrapper is stripped. Compound
    /// predicates fall back to `$nor`.
    pub fn not(self) -> Self {
        let mut clauses = self.clauses;
        if clauses.len() != 1 {
            return Self::single(Clause::Nor(vec![Self { clauses }]));
        }
        match clauses.remove(0) {
            Clause::Field { path, condition } => match invert_condition(condition) {
                Ok(condition) => Self::field(path, condition),
                Err(condition) => {
                    Self::single(Clause::Nor(vec![Self::field(path, condition)]))
                }
            },
            Clause::Or(branches) => Self::single(Clause::Nor(branches)),
            Clause::Nor(mut branches) if branches.len() == 1 => branches.remove(0),
            Clause::Nor(branches) => Self::single(Clause::Or(branches)),
            clause @ Clause::And(_) => Self::single(Clause::Nor(vec![Self::single(clause)])),
        }
    }

    fn into_branches(self) -> Vec<Predicate> {
        let mut clauses = self.clauses;
        if clauses.len() == 1 {
            if let Clause::Or(branches) = &mut clauses[0] {
                return std::mem::take(branches);
            }
        }
        vec![Self { clauses }]
    }

    fn push_clause(&mut self, clause: Clause) {
        match clause {
            Clause::Field { path, condition } => {
                let existing = self.clauses.iter_mut().find_map(|c| match c {
                    Clause::Field { path: p, condition } if *p == path => Some(condition),
                    _ => None,
                });
                match existing {
                    Some(current) => {
                        let left = std::mem::replace(current, Condition::Operators(Vec::new()));
                        *current = merge_conditions(left, condition);
                    }
                    None => self.clauses.push(Clause::Field { path, condition }),
                }
            }
            Clause::Nor(branches) => match self.find_mut(|c| matches!(c, Clause::Nor(_))) {
                Some(Clause::Nor(existing)) => existing.extend(branches),
                _ => self.clauses.push(Clause::Nor(branches)),
            },
            Clause::And(branches) => match self.find_mut(|c| matches!(c, Clause::And(_))) {
                Some(Clause::And(existing)) => existing.extend(branches),
                _ => self.clauses.push(Clause::And(branches)),
            },
            Clause::Or(branches) => {
                let position = self.clauses.iter().position(|c| matches!(c, Clause::Or(_)));
                match position {
                    // Two disjunctions cannot share the `$or` key
                    Some(index) => {
                        let existing = self.clauses.remove(index);
                        self.push_clause(Clause::And(vec![
                            Self::single(existing),
                            Self::single(Clause::Or(branches)),
                        ]));
                    }
                    None => self.clauses.push(Clause::Or(branches)),
                }
            }
        }
    }

    fn find_mut(&mut self, pred: impl Fn(&Clause) -> bool) -> Option<&mut Clause> {
        self.clauses.iter_mut().find(|c| pred(c))
    }

    // =========================================================================
    // Compilation
    // =========================================================================

    /// Render the canonical query document
    pub fn compile(&self) -> WireMap {
        self.compile_relative("")
    }

    /// Render with `prefix.` stripped from top-level field paths
    pub fn compile_relative(&self, prefix: &str) -> WireMap {
        let mut doc = Map::new();
        for clause in &self.clauses {
            match clause {
                Clause::Field { path, condition } => {
                    let key = strip_prefix(path, prefix);
                    doc.insert(key.to_string(), compile_condition(condition));
                }
                Clause::Or(branches) => {
                    doc.insert("$or".into(), compile_branches(branches, prefix));
                }
                Clause::Nor(branches) => {
                    doc.insert("$nor".into(), compile_branches(branches, prefix));
                }
                Clause::And(branches) => {
                    doc.insert("$and".into(), compile_branches(branches, prefix));
                }
            }
        }
        doc
    }
}

fn checked_path(path: String) -> Result<String, ExprError> {
    if path.is_empty() {
        return Err(ExprError::EmptyPath);
    }
    Ok(path)
}

fn strip_prefix<'a>(path: &'a str, prefix: &str) -> &'a str {
    if prefix.is_empty() {
        return path;
    }
    path.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(path)
}

fn compile_branches(branches: &[Predicate], prefix: &str) -> Value {
    Value::Array(
        branches
            .iter()
            .map(|b| Value::Object(b.compile_relative(prefix)))
            .collect(),
    )
}

fn compile_condition(condition: &Condition) -> Value {
    match condition {
        Condition::Equals(value) => value.clone(),
        Condition::Operators(clauses) => {
            let mut ops = Map::new();
            let mut negated = Map::new();
            for clause in clauses {
                let target = if clause.negated { &mut negated } else { &mut ops };
                target.insert(clause.operator.wire_key().to_string(), clause.operand.clone());
            }
            if !negated.is_empty() {
                ops.insert("$not".into(), Value::Object(negated));
            }
            Value::Object(ops)
        }
    }
}

fn merge_conditions(left: Condition, right: Condition) -> Condition {
    match (left, right) {
        (Condition::Equals(_), Condition::Equals(value)) => Condition::Equals(value),
        (left, right) => {
            let mut merged = into_operator_clauses(left);
            for clause in into_operator_clauses(right) {
                match merged.iter_mut().find(|c| c.same_slot(&clause)) {
                    Some(existing) => existing.operand = clause.operand,
                    None => merged.push(clause),
                }
            }
            Condition::Operators(merged)
        }
    }
}

/// Equality next to other operators needs an explicit `$eq`
fn into_operator_clauses(condition: Condition) -> Vec<OperatorClause> {
    match condition {
        Condition::Equals(value) => vec![OperatorClause::new(Operator::Eq, value)],
        Condition::Operators(clauses) => clauses,
    }
}

/// Invert a field condition in place. Returns the untouched condition when
/// it cannot be expressed as a single field clause.
fn invert_condition(condition: Condition) -> Result<Condition, Condition> {
    match condition {
        Condition::Equals(value) => Ok(Condition::Operators(vec![OperatorClause::new(
            Operator::Ne,
            value,
        )])),
        Condition::Operators(mut clauses) if clauses.len() == 1 => {
            let mut clause = clauses.remove(0);
            if clause.negated {
                clause.negated = false;
                return Ok(Condition::Operators(vec![clause]));
            }
            match (clause.operator, clause.operator.dual()) {
                (Operator::Exists, _) => {
                    let present = clause.operand.as_bool().unwrap_or(true);
                    clause.operand = Value::Bool(!present);
                }
                (_, Some(Operator::Eq)) => return Ok(Condition::Equals(clause.operand)),
                (_, Some(dual)) => clause.operator = dual,
                (_, None) => clause.negated = true,
            }
            Ok(Condition::Operators(vec![clause]))
        }
        Condition::Operators(mut clauses) => {
            if clauses.iter().all(|c| c.negated) {
                clauses.iter_mut().for_each(|c| c.negated = false);
                Ok(Condition::Operators(clauses))
            } else if clauses.iter().all(|c| !c.negated) {
                clauses.iter_mut().for_each(|c| c.negated = true);
                Ok(Condition::Operators(clauses))
            } else {
                Err(Condition::Operators(clauses))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cmp(path: &str, op: Operator, v: Value) -> Predicate {
        Predicate::compare(path, op, v).unwrap()
    }

    fn compiled(p: &Predicate) -> Value {
        Value::Object(p.compile())
    }

    #[test]
    fn test_implicit_equality() {
        let p = Predicate::equals("username", "stanislav").unwrap();
        assert_eq!(compiled(&p), json!({"username": "stanislav"}));
    }

    #[test]
    fn test_invert_comparisons() {
        assert_eq!(
            compiled(&cmp("age", Operator::Lt, json!(5)).not()),
            json!({"age": {"$gte": 5}})
        );
        assert_eq!(
            compiled(&cmp("age", Operator::Gt, json!(5)).not()),
            json!({"age": {"$lte": 5}})
        );
        assert_eq!(
            compiled(&cmp("age", Operator::Lte, json!(5)).not()),
            json!({"age": {"$gt": 5}})
        );
        assert_eq!(
            compiled(&cmp("age", Operator::Gte, json!(5)).not()),
            json!({"age": {"$lt": 5}})
        );
    }

    #[test]
    fn test_invert_equality_pair() {
        let eq = Predicate::equals("username", "stan").unwrap();
        assert_eq!(compiled(&eq.clone().not()), json!({"username": {"$ne": "stan"}}));
        // not-equal inverts to equality, not to less-than
        let ne = cmp("username", Operator::Ne, json!("stan"));
        assert_eq!(compiled(&ne.not()), json!({"username": "stan"}));
        assert_eq!(eq.clone().not().not(), eq);
    }

    #[test]
    fn test_invert_membership_twice() {
        let p = cmp("followers", Operator::In, json!([2, 5]));
        assert_eq!(compiled(&p.clone().not()), json!({"followers": {"$nin": [2, 5]}}));
        assert_eq!(compiled(&p.not().not()), json!({"followers": {"$in": [2, 5]}}));
    }

    #[test]
    fn test_invert_exists() {
        let p = cmp("followers", Operator::Exists, json!(true));
        assert_eq!(compiled(&p.clone().not()), json!({"followers": {"$exists": false}}));
        assert_eq!(p.clone().not().not(), p);
    }

    #[test]
    fn test_generic_negation_wrapper() {
        let p = cmp("age", Operator::Mod, json!([10, 0]));
        let inverted = p.clone().not();
        assert_eq!(compiled(&inverted), json!({"age": {"$not": {"$mod": [10, 0]}}}));
        assert_eq!(inverted.not(), p);

        let size = cmp("followers", Operator::Size, json!(5));
        assert_eq!(compiled(&size.not()), json!({"followers": {"$not": {"$size": 5}}}));
    }

    #[test]
    fn test_double_inversion_is_identity() {
        let cases = vec![
            Predicate::equals("a", 1).unwrap(),
            cmp("a", Operator::Ne, json!(1)),
            cmp("a", Operator::Lt, json!(1)),
            cmp("a", Operator::Gt, json!(1)),
            cmp("a", Operator::Lte, json!(1)),
            cmp("a", Operator::Gte, json!(1)),
            cmp("a", Operator::Nin, json!([1])),
            cmp("a", Operator::All, json!([1])),
            cmp("a", Operator::Type, json!(2)),
            cmp("a", Operator::Where, json!("this.a == 1")),
            cmp("a", Operator::Gt, json!(1)).and(cmp("a", Operator::Lt, json!(9))),
            cmp("a", Operator::Gt, json!(1)).and(cmp("b", Operator::Lt, json!(9))),
            Predicate::equals("a", 1).unwrap().or(Predicate::equals("b", 2).unwrap()),
            Predicate::empty(),
        ];
        for p in cases {
            assert_eq!(p.clone().not().not(), p, "{:?}", p.compile());
        }
    }

    #[test]
    fn test_same_field_merge_unions_operators() {
        let p = cmp("username", Operator::Gt, json!(5)).and(cmp("username", Operator::Lt, json!(10)));
        assert_eq!(compiled(&p), json!({"username": {"$gt": 5, "$lt": 10}}));
    }

    #[test]
    fn test_disjoint_merge_commutes() {
        let a = cmp("age", Operator::Gt, json!(5));
        let b = Predicate::equals("name", "x").unwrap();
        assert_eq!(
            compiled(&a.clone().and(b.clone())),
            compiled(&b.and(a))
        );
    }

    #[test]
    fn test_equality_merged_with_operators_uses_eq() {
        let p = Predicate::equals("age", 7).unwrap().and(cmp("age", Operator::Lt, json!(10)));
        assert_eq!(compiled(&p), json!({"age": {"$eq": 7, "$lt": 10}}));
    }

    #[test]
    fn test_repeated_disjunction_appends() {
        let p = Predicate::equals("followers", 2)
            .unwrap()
            .or(Predicate::equals("followers", 3).unwrap())
            .or(Predicate::equals("followers", 4).unwrap());
        assert_eq!(
            compiled(&p),
            json!({"$or": [{"followers": 2}, {"followers": 3}, {"followers": 4}]})
        );
    }

    #[test]
    fn test_merging_two_disjunctions_keeps_both() {
        let left = Predicate::equals("followers", 5)
            .unwrap()
            .or(Predicate::equals("followers", 9).unwrap());
        let right = cmp("username", Operator::Ne, json!("wamb"))
            .or(Predicate::equals("age", 5).unwrap());
        assert_eq!(
            compiled(&left.and(right)),
            json!({"$and": [
                {"$or": [{"followers": 5}, {"followers": 9}]},
                {"$or": [{"username": {"$ne": "wamb"}}, {"age": 5}]}
            ]})
        );
    }

    #[test]
    fn test_invert_compound() {
        let p = Predicate::equals("a", 1).unwrap().or(Predicate::equals("b", 2).unwrap());
        assert_eq!(compiled(&p.not()), json!({"$nor": [{"a": 1}, {"b": 2}]}));

        let range = cmp("age", Operator::Gt, json!(5)).and(cmp("age", Operator::Lt, json!(10)));
        assert_eq!(
            compiled(&range.not()),
            json!({"age": {"$not": {"$gt": 5, "$lt": 10}}})
        );

        let multi = Predicate::equals("a", 1).unwrap().and(Predicate::equals("b", 2).unwrap());
        assert_eq!(compiled(&multi.not()), json!({"$nor": [{"a": 1, "b": 2}]}));
    }

    #[test]
    fn test_elem_match_strips_prefix() {
        let inner = cmp("widgets.index", Operator::Lt, json!(2))
            .and(cmp("widgets.index", Operator::Gt, json!(5)));
        let p = Predicate::elem_match("widgets", &inner).unwrap();
        assert_eq!(
            compiled(&p),
            json!({"widgets": {"$elemMatch": {"index": {"$lt": 2, "$gt": 5}}}})
        );
    }

    #[test]
    fn test_regex_with_options() {
        let p = Predicate::regex("name", "^stan", Some("i")).unwrap();
        assert_eq!(compiled(&p), json!({"name": {"$regex": "^stan", "$options": "i"}}));
    }

    #[test]
    fn test_empty_path_rejected() {
        assert_eq!(Predicate::equals("", 1), Err(ExprError::EmptyPath));
    }
}
