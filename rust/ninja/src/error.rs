use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ServiceError>;

pub const FILTER_ESCAPE_HINT: &str =
    "You need to escape the following characters ()', within the value part of your filters";
pub const QUERY_TIMEOUT_HINT: &str =
    "Query for smaller response chunks: narrow the interval or use LIMIT/OFFSET";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request parameter: {0}")]
    InvalidParameter(String),

    #[error("PARSING ERROR: Invalid date given. Format must be {pattern}, where [] denotes optionality. Do not forget, single digits must be leaded by 0. Error message: {reason}.")]
    DateParse {
        pattern: &'static str,
        reason: String,
    },

    #[error("PARSING ERROR: Please choose 'flat' or 'tree' as representation, and 'edge', 'event' or 'node' (default) as dataset. Separate them with a comma. '{0}' is not allowed.")]
    WrongRepresentation(String),

    #[error("DATA FETCHING ERROR: '{0}' is not a valid time zone")]
    WrongTimezone(String),

    #[error("Syntax Error in WHERE clause at position {position}: {reason}")]
    FilterSyntax { position: usize, reason: String },

    #[error("SELECT EXPANSION ERROR: Key '{0}' does not exist")]
    UnknownAttribute(String),

    #[error("SELECT EXPANSION ERROR: Key '{attribute}' is not reachable from the expanded select definition list: {lists}")]
    AttributeNotReachable { attribute: String, lists: String },

    #[error("SELECT EXPANSION ERROR: Operator '{operator}' does not exist for '{operator_id}'")]
    UnknownOperator {
        operator: String,
        operator_id: String,
    },

    #[error("SELECT EXPANSION ERROR: '{alias}.<{operator}>' with value {value} is not valid (checks failed)")]
    OperatorCheckFailed {
        alias: String,
        operator: String,
        value: String,
    },

    #[error("DATA FETCHING ERROR: '{alias}' can only be used with NULL, NUMBERS or STRINGS: '{given}' given.")]
    InvalidWhereDataType { alias: String, given: String },

    #[error("DATA FETCHING ERROR: Method '{method}' not allowed with {representation} representation.")]
    MethodNotAllowed {
        method: &'static str,
        representation: String,
    },

    #[error("{0}")]
    QueryTimeout(String),

    #[error("{message}")]
    Database {
        message: String,
        sql_state: Option<String>,
    },

    #[error("You have exhausted your API Request Quota")]
    RateLimited { policy: String },

    #[error("You have exceeded the date range limit of {limit} days")]
    HistoricRangeExceeded {
        limit: i64,
        policy: String,
        hint: String,
    },

    #[error("TREE BUILDING: Response size of {0} MB exceeded. Please rephrase your request. Use a flat representation, WHERE, SELECT, LIMIT with OFFSET or a narrow time interval.")]
    ResponseTooLarge(i64),

    #[error("TREE BUILDING: The column '{0}' used to build the TREE representation must be of type STRING")]
    TriggerKeyNotString(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Stable machine-readable name of the variant, reported as `info.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Config(_) => "Config",
            ServiceError::NotFound(_) => "NotFound",
            ServiceError::InvalidParameter(_) => "InvalidParameter",
            ServiceError::DateParse { .. } => "DateParseError",
            ServiceError::WrongRepresentation(_) => "WrongRepresentation",
            ServiceError::WrongTimezone(_) => "WrongTimezone",
            ServiceError::FilterSyntax { .. } => "FilterSyntaxError",
            ServiceError::UnknownAttribute(_) => "UnknownAttribute",
            ServiceError::AttributeNotReachable { .. } => "AttributeNotReachable",
            ServiceError::UnknownOperator { .. } => "UnknownOperator",
            ServiceError::OperatorCheckFailed { .. } => "OperatorCheckFailed",
            ServiceError::InvalidWhereDataType { .. } => "InvalidWhereDataType",
            ServiceError::MethodNotAllowed { .. } => "MethodNotAllowed",
            ServiceError::QueryTimeout(_) => "QueryTimeout",
            ServiceError::Database { .. } => "DatabaseError",
            ServiceError::RateLimited { .. } => "RateLimited",
            ServiceError::HistoricRangeExceeded { .. } => "HistoricRangeExceeded",
            ServiceError::ResponseTooLarge(_) => "ResponseTooLarge",
            ServiceError::TriggerKeyNotString(_) => "TriggerKeyNotString",
            ServiceError::Internal(_) => "Internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::NotFound(_) | ServiceError::WrongRepresentation(_) => {
                StatusCode::NOT_FOUND
            }
            ServiceError::InvalidParameter(_)
            | ServiceError::DateParse { .. }
            | ServiceError::WrongTimezone(_)
            | ServiceError::FilterSyntax { .. }
            | ServiceError::UnknownAttribute(_)
            | ServiceError::AttributeNotReachable { .. }
            | ServiceError::UnknownOperator { .. }
            | ServiceError::OperatorCheckFailed { .. }
            | ServiceError::InvalidWhereDataType { .. }
            | ServiceError::MethodNotAllowed { .. }
            | ServiceError::HistoricRangeExceeded { .. } => StatusCode::BAD_REQUEST,
            ServiceError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::Config(_)
            | ServiceError::QueryTimeout(_)
            | ServiceError::Database { .. }
            | ServiceError::ResponseTooLarge(_)
            | ServiceError::TriggerKeyNotString(_)
            | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn description(&self) -> Option<&'static str> {
        match self {
            ServiceError::FilterSyntax { .. } => Some("Syntax error in WHERE-clause"),
            ServiceError::QueryTimeout(_) => Some("Query timed out"),
            ServiceError::Database { .. } => Some("Error from the database backend"),
            _ => None,
        }
    }

    fn hint(&self) -> Option<&str> {
        match self {
            ServiceError::FilterSyntax { .. } => Some(FILTER_ESCAPE_HINT),
            ServiceError::QueryTimeout(_) => Some(QUERY_TIMEOUT_HINT),
            ServiceError::HistoricRangeExceeded { hint, .. } => Some(hint),
            ServiceError::RateLimited { .. } => Some("Authenticate or wait for the quota to refill"),
            _ => None,
        }
    }

    fn info(&self) -> Map<String, Value> {
        let mut info = Map::new();
        info.insert("kind".into(), Value::String(self.kind().into()));
        match self {
            ServiceError::FilterSyntax { position, .. } => {
                info.insert("position".into(), json!(position));
            }
            ServiceError::AttributeNotReachable { attribute, .. } => {
                info.insert("targetName".into(), json!(attribute));
            }
            ServiceError::Database {
                sql_state: Some(state),
                ..
            } => {
                info.insert("sqlState".into(), json!(state));
            }
            _ => {}
        }
        info
    }

    fn policy(&self) -> Option<&str> {
        match self {
            ServiceError::RateLimited { policy } => Some(policy),
            ServiceError::HistoricRangeExceeded { policy, .. } => Some(policy),
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            match &self {
                ServiceError::Internal(err) => error!(error = ?err, "request failed"),
                other => error!(error = %other, kind = other.kind(), "request failed"),
            }
        }

        let mut body = Map::new();
        body.insert("message".into(), Value::String(self.to_string()));
        body.insert("timestamp".into(), Value::String(Utc::now().to_rfc3339()));
        body.insert("code".into(), json!(status.as_u16()));
        body.insert(
            "error".into(),
            Value::String(status.canonical_reason().unwrap_or_default().into()),
        );
        if let Some(description) = self.description() {
            body.insert("description".into(), Value::String(description.into()));
        }
        if let Some(hint) = self.hint() {
            body.insert("hint".into(), Value::String(hint.into()));
        }
        if let Some(policy) = self.policy() {
            body.insert("policy".into(), Value::String(policy.into()));
        }
        body.insert("info".into(), Value::Object(self.info()));

        (status, Json(Value::Object(body))).into_response()
    }
}
