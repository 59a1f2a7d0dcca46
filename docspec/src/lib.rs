//! docspec - query and update expression algebra
//!
//! Expressions are immutable values that combine and compile into the nested
//! map documents a schemaless document store understands.
//!
//! # Wire Overview
//!
//! ```text
//! age < 5                        {"age": {"$lt": 5}}
//! not(age < 5)                   {"age": {"$gte": 5}}
//! age > 5 and age < 10           {"age": {"$gt": 5, "$lt": 10}}
//! a == 1 or b == 2 or c == 3     {"$or": [{"a": 1}, {"b": 2}, {"c": 3}]}
//! not(age mod 10 == 0)           {"age": {"$not": {"$mod": [10, 0]}}}
//!
//! set(name, "x")                 {"$set": {"name": "x"}}
//! inc(age, 2) and inc(age, -5)   {"$inc": {"age": -3}}
//! ```
//!
//! Operand shapes are checked when an expression is built, so a malformed
//! expression never reaches compilation.

mod error;
mod mutation;
mod operator;
mod predicate;

pub use error::{describe, ExprError};
pub use mutation::{Mutation, MutationEntry};
pub use operator::{MutationOp, Operator};
pub use predicate::{Clause, Condition, OperatorClause, Predicate};

/// A compiled query, update or projection document
pub type WireMap = serde_json::Map<String, serde_json::Value>;

/// Which half of the algebra an expression belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionKind {
    Predicate,
    Mutation,
}

/// Either kind of expression, for callers that handle both uniformly
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Predicate(Predicate),
    Mutation(Mutation),
}

impl Expression {
    pub fn kind(&self) -> ExpressionKind {
        match self {
            Expression::Predicate(_) => ExpressionKind::Predicate,
            Expression::Mutation(_) => ExpressionKind::Mutation,
        }
    }

    pub fn compile(&self) -> WireMap {
        match self {
            Expression::Predicate(p) => p.compile(),
            Expression::Mutation(m) => m.compile(),
        }
    }
}

impl From<Predicate> for Expression {
    fn from(p: Predicate) -> Self {
        Expression::Predicate(p)
    }
}

impl From<Mutation> for Expression {
    fn from(m: Mutation) -> Self {
        Expression::Mutation(m)
    }
}
