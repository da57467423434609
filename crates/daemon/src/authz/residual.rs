// Typed decode of the policy engine's partial-evaluation response.
//
// `queries` is a disjunction of conjunctions; every expression is decoded on
// its own so that a single unrecognized shape only rejects that expression.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::predicate::Operand;

/// Root variable every translatable reference starts from.
pub const INPUT_VARIABLE: &str = "input";
/// Unknown declared in the compile request.
pub const CLUSTER_VARIABLE: &str = "cluster";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResidualError {
    #[error("malformed expression: {0}")]
    Malformed(String),

    #[error("expected 3 terms (operator and two operands), got {0}")]
    Arity(usize),

    #[error("operator must be a reference to a single variable")]
    Operator,

    #[error("unsupported operator `{0}`")]
    UnsupportedOperator(String),

    #[error("unsupported operand term `{0}`")]
    UnsupportedOperand(&'static str),

    #[error("reference must start with input.cluster, got `{0}`")]
    ForeignReference(String),

    #[error("reference to input.cluster names no field")]
    EmptyFieldPath,

    #[error("reference segment must be a string term")]
    NonStringSegment,
}

/// Body of a `POST /v1/compile` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompileResponse {
    #[serde(default)]
    pub result: Option<CompileResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompileResult {
    #[serde(default)]
    pub queries: Option<Vec<Value>>,
}

impl CompileResponse {
    /// Raw conjunctions; an absent list means the query is never satisfiable.
    pub fn queries(&self) -> &[Value] {
        self.result.as_ref().and_then(|result| result.queries.as_deref()).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Term {
    Ref(Vec<Term>),
    String(String),
    Var(String),
    Number(serde_json::Number),
    Boolean(bool),
}

impl Term {
    fn kind(&self) -> &'static str {
        match self {
            Self::Ref(_) => "ref",
            Self::String(_) => "string",
            Self::Var(_) => "var",
            Self::Number(_) => "number",
            Self::Boolean(_) => "boolean",
        }
    }

    fn operator_name(&self) -> Result<&str, ResidualError> {
        match self {
            Self::Ref(path) => match path.as_slice() {
                [Self::Var(name)] => Ok(name.as_str()),
                _ => Err(ResidualError::Operator),
            },
            _ => Err(ResidualError::Operator),
        }
    }

    fn to_operand(&self) -> Result<Operand, ResidualError> {
        match self {
            Self::String(literal) => Ok(Operand::Literal(literal.clone())),
            Self::Ref(path) => cluster_field(path),
            other => Err(ResidualError::UnsupportedOperand(other.kind())),
        }
    }
}

/// `input.cluster.<a>.<b>` becomes the field path `[a, b]`.
fn cluster_field(path: &[Term]) -> Result<Operand, ResidualError> {
    let (root, attribute, rest) = match path {
        [root, attribute, rest @ ..] => (root, attribute, rest),
        _ => return Err(ResidualError::ForeignReference(describe_path(path))),
    };

    let in_cluster = matches!(root, Term::Var(name) if name == INPUT_VARIABLE)
        && matches!(attribute, Term::String(name) if name == CLUSTER_VARIABLE);
    if !in_cluster {
        return Err(ResidualError::ForeignReference(describe_path(path)));
    }
    if rest.is_empty() {
        return Err(ResidualError::EmptyFieldPath);
    }

    let segments = rest
        .iter()
        .map(|segment| match segment {
            Term::String(name) => Ok(name.clone()),
            _ => Err(ResidualError::NonStringSegment),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Operand::ClusterField(segments))
}

fn describe_path(path: &[Term]) -> String {
    path.iter()
        .map(|term| match term {
            Term::Var(name) | Term::String(name) => name.clone(),
            other => format!("<{}>", other.kind()),
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// One residual expression: `[operator, lhs, rhs]`, optionally negated.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Expression {
    #[serde(default)]
    pub negated: bool,
    pub terms: Vec<Term>,
}

impl Expression {
    pub fn decode(raw: &Value) -> Result<Self, ResidualError> {
        Self::deserialize(raw).map_err(|error| ResidualError::Malformed(error.to_string()))
    }

    /// Best-effort negation flag of an expression that may not decode.
    pub fn negated_hint(raw: &Value) -> bool {
        raw.get("negated").and_then(Value::as_bool).unwrap_or(false)
    }

    /// Operands of a supported equality test.
    pub fn equality(&self) -> Result<(Operand, Operand), ResidualError> {
        let [operator, lhs, rhs] = self.terms.as_slice() else {
            return Err(ResidualError::Arity(self.terms.len()));
        };

        match operator.operator_name()? {
            "eq" | "equal" => {}
            other => return Err(ResidualError::UnsupportedOperator(other.to_owned())),
        }

        Ok((lhs.to_operand()?, rhs.to_operand()?))
    }
}
