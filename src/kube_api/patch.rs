use serde_json::{Map, Value};

pub const CONTENT_TYPE_STRATEGIC_MERGE_PATCH: &str = "application/strategic-merge-patch+json";
pub const CONTENT_TYPE_MERGE_PATCH: &str = "application/merge-patch+json";
pub const CONTENT_TYPE_JSON_PATCH: &str = "application/json-patch+json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatchStrategy {
    #[default]
    Strategic,
    Merge,
    Json,
}

impl PatchStrategy {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Strategic => CONTENT_TYPE_STRATEGIC_MERGE_PATCH,
            Self::Merge => CONTENT_TYPE_MERGE_PATCH,
            Self::Json => CONTENT_TYPE_JSON_PATCH,
        }
    }
}

/// A patch body whose shape matches its strategy.
///
/// JSON patch operations are kept as given, including explicit `null`
/// values and key order.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    Strategic(Map<String, Value>),
    Merge(Map<String, Value>),
    Json(Vec<Value>),
}

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("a {0:?} patch must be a JSON object")]
    ExpectedObject(PatchStrategy),
    #[error("a json patch must be a list of operations")]
    ExpectedOperations,
    #[error("json patch operation {0} must be an object with string \"op\" and \"path\"")]
    InvalidOperation(usize),
}

fn is_operation(operation: &Value) -> bool {
    operation.get("op").is_some_and(Value::is_string)
        && operation.get("path").is_some_and(Value::is_string)
}

impl Patch {
    /// Checks that `value` has the shape `strategy` requires.
    pub fn from_value(strategy: PatchStrategy, value: Value) -> Result<Self, PatchError> {
        match (strategy, value) {
            (PatchStrategy::Strategic, Value::Object(body)) => Ok(Self::Strategic(body)),
            (PatchStrategy::Merge, Value::Object(body)) => Ok(Self::Merge(body)),
            (PatchStrategy::Json, Value::Array(operations)) => {
                match operations.iter().position(|operation| !is_operation(operation)) {
                    Some(index) => Err(PatchError::InvalidOperation(index)),
                    None => Ok(Self::Json(operations)),
                }
            }
            (PatchStrategy::Json, _) => Err(PatchError::ExpectedOperations),
            (strategy, _) => Err(PatchError::ExpectedObject(strategy)),
        }
    }

    pub fn strategy(&self) -> PatchStrategy {
        match self {
            Self::Strategic(_) => PatchStrategy::Strategic,
            Self::Merge(_) => PatchStrategy::Merge,
            Self::Json(_) => PatchStrategy::Json,
        }
    }

    pub fn to_body(&self) -> Value {
        match self {
            Self::Strategic(body) | Self::Merge(body) => Value::Object(body.clone()),
            Self::Json(operations) => Value::Array(operations.clone()),
        }
    }
}
