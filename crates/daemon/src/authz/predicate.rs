// Row filter derived from a policy residual.
//
// The residual is first translated into a small predicate tree and only then
// rendered as SQL against the status table's `payload` jsonb column. The same
// tree can be evaluated directly against a payload document.

use std::fmt;

use serde_json::Value;
use tracing::warn;

use super::residual::Expression;

/// jsonb column holding the managed-cluster resource in the status table.
pub const PAYLOAD_COLUMN: &str = "payload";

const SQL_TRUE: &str = "TRUE";
const SQL_FALSE: &str = "FALSE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Literal(String),
    /// Path below `input.cluster`, at least one segment long.
    ClusterField(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Equals(Operand, Operand),
    /// The expression could not be translated.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub negated: bool,
    pub condition: Condition,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conjunction(pub Vec<Clause>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    DenyAll,
    AllowAll,
    AnyOf(Vec<Conjunction>),
}

impl Predicate {
    /// Translate the residual's `queries` list.
    ///
    /// No queries deny everything; a single empty conjunction allows
    /// everything. Untranslatable expressions never fail the translation,
    /// each one becomes a clause that matches no row.
    pub fn from_queries(queries: &[Value]) -> Self {
        if queries.is_empty() {
            return Self::DenyAll;
        }
        if let [only] = queries {
            if only.as_array().is_some_and(Vec::is_empty) {
                return Self::AllowAll;
            }
        }

        let conjunctions = queries
            .iter()
            .filter_map(|query| match query.as_array() {
                Some(expressions) => {
                    Some(Conjunction(expressions.iter().map(Clause::from_expression).collect()))
                }
                None => {
                    warn!(%query, "skipping policy query that is not a list of expressions");
                    None
                }
            })
            .collect();

        Self::AnyOf(conjunctions)
    }

    pub fn to_sql(&self) -> String {
        match self {
            Self::DenyAll => SQL_FALSE.to_owned(),
            Self::AllowAll => SQL_TRUE.to_owned(),
            Self::AnyOf(conjunctions) => {
                let mut sql = String::new();
                for conjunction in conjunctions {
                    sql.push_str(&conjunction.to_sql());
                    sql.push_str(" OR ");
                }
                sql.push_str(SQL_FALSE);
                sql
            }
        }
    }

    /// Evaluate against one status payload with SQL semantics.
    pub fn matches(&self, payload: &Value) -> bool {
        match self {
            Self::DenyAll => false,
            Self::AllowAll => true,
            Self::AnyOf(conjunctions) => {
                conjunctions.iter().any(|conjunction| conjunction.matches(payload))
            }
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

impl Conjunction {
    fn to_sql(&self) -> String {
        let mut sql = String::from("(");
        for clause in &self.0 {
            sql.push('(');
            sql.push_str(&clause.to_sql());
            sql.push_str(") AND ");
        }
        sql.push_str(SQL_TRUE);
        sql.push(')');
        sql
    }

    fn matches(&self, payload: &Value) -> bool {
        self.0.iter().all(|clause| clause.matches(payload))
    }
}

impl Clause {
    pub fn from_expression(raw: &Value) -> Self {
        let translated = Expression::decode(raw).and_then(|expression| {
            let negated = expression.negated;
            expression.equality().map(|(lhs, rhs)| (negated, lhs, rhs))
        });

        match translated {
            Ok((negated, lhs, rhs)) => Self { negated, condition: Condition::Equals(lhs, rhs) },
            Err(error) => {
                warn!(%error, expression = %raw, "rejecting untranslatable policy expression");
                Self { negated: Expression::negated_hint(raw), condition: Condition::Rejected }
            }
        }
    }

    fn to_sql(&self) -> String {
        let inner = match &self.condition {
            Condition::Equals(lhs, rhs) => {
                format!("COALESCE({} = {}, {SQL_FALSE})", lhs.to_sql(), rhs.to_sql())
            }
            // Wrapped in NOT below, so a rejected clause matches nothing either way.
            Condition::Rejected if self.negated => SQL_TRUE.to_owned(),
            Condition::Rejected => SQL_FALSE.to_owned(),
        };

        if self.negated {
            format!("NOT ({inner})")
        } else {
            inner
        }
    }

    fn matches(&self, payload: &Value) -> bool {
        let inner = match &self.condition {
            Condition::Equals(lhs, rhs) => match (lhs.resolve(payload), rhs.resolve(payload)) {
                (Some(lhs), Some(rhs)) => lhs == rhs,
                _ => false,
            },
            Condition::Rejected => self.negated,
        };

        inner != self.negated
    }
}

impl Operand {
    fn to_sql(&self) -> String {
        match self {
            Self::Literal(literal) => quote(literal),
            Self::ClusterField(path) => {
                let mut sql = PAYLOAD_COLUMN.to_owned();
                let last = path.len().saturating_sub(1);
                for (index, segment) in path.iter().enumerate() {
                    sql.push_str(if index == last { " ->> " } else { " -> " });
                    sql.push_str(&quote(segment));
                }
                sql
            }
        }
    }

    /// Text value of the operand, `None` standing in for SQL NULL.
    fn resolve(&self, payload: &Value) -> Option<String> {
        match self {
            Self::Literal(literal) => Some(literal.clone()),
            Self::ClusterField(path) => {
                let value = path.iter().try_fold(payload, |node, segment| node.get(segment))?;
                match value {
                    Value::Null => None,
                    Value::String(text) => Some(text.clone()),
                    other => Some(other.to_string()),
                }
            }
        }
    }
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}
