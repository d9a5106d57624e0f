use super::params::BoundStatement;
use crate::error::{Result, ServiceError};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::Text;
use diesel::QueryableByName;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

/// One result row, columns in projection order.
pub type Row = Map<String, Value>;

#[derive(Debug, QueryableByName)]
struct JsonRow {
    #[diesel(sql_type = Text)]
    row: String,
}

/// Session settings applied before each statement.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub timezone: String,
    pub statement_timeout: Duration,
}

pub async fn apply_session(conn: &mut AsyncPgConnection, settings: &SessionSettings) -> Result<()> {
    diesel::sql_query(
        "select set_config('TimeZone', $1, false), set_config('statement_timeout', $2, false)",
    )
    .bind::<Text, _>(settings.timezone.clone())
    .bind::<Text, _>(format!("{}ms", settings.statement_timeout.as_millis()))
    .execute(conn)
    .await
    .map_err(|err| map_database_error(err, Some(&settings.timezone)))?;
    Ok(())
}

/// Runs `statement` and returns its rows as ordered JSON objects.
pub async fn load_rows(conn: &mut AsyncPgConnection, statement: BoundStatement) -> Result<Vec<Row>> {
    let wrapped = BoundStatement {
        sql: format!("select row_to_json(q)::text as row from ({}) q", statement.sql),
        binds: statement.binds,
    };
    debug!(sql = %wrapped.sql, binds = wrapped.binds.len(), "executing statement");

    let rows: Vec<JsonRow> = wrapped
        .into_query()
        .load(conn)
        .await
        .map_err(|err| map_database_error(err, None))?;

    rows.into_iter()
        .map(|json| {
            serde_json::from_str::<Row>(&json.row).map_err(|err| {
                ServiceError::Internal(anyhow::anyhow!("row is not a JSON object: {err}"))
            })
        })
        .collect()
}

/// Single text column `id`, used by the distinct type listings.
pub async fn load_ids(conn: &mut AsyncPgConnection, sql: &str) -> Result<Vec<String>> {
    #[derive(QueryableByName)]
    struct IdRow {
        #[diesel(sql_type = diesel::sql_types::Nullable<Text>)]
        id: Option<String>,
    }

    let rows: Vec<IdRow> = diesel::sql_query(sql)
        .load(conn)
        .await
        .map_err(|err| map_database_error(err, None))?;
    Ok(rows.into_iter().filter_map(|row| row.id).collect())
}

pub const QUERY_CANCELED: &str = "57014";

pub fn map_database_error(err: DieselError, timezone: Option<&str>) -> ServiceError {
    match err {
        DieselError::DatabaseError(kind, info) => {
            let message = info.message();
            classify(message, sql_state(&kind, message), timezone)
        }
        other => ServiceError::Internal(anyhow::anyhow!(other)),
    }
}

/// SQLSTATE of a backend error. diesel only surfaces the error kind, so states
/// without a kind of their own are read from the server's fixed cancellation
/// messages.
fn sql_state(kind: &DatabaseErrorKind, message: &str) -> Option<&'static str> {
    let state = match kind {
        DatabaseErrorKind::UniqueViolation => "23505",
        DatabaseErrorKind::ForeignKeyViolation => "23503",
        DatabaseErrorKind::SerializationFailure => "40001",
        DatabaseErrorKind::ReadOnlyTransaction => "25006",
        DatabaseErrorKind::NotNullViolation => "23502",
        DatabaseErrorKind::CheckViolation => "23514",
        _ => match message.strip_prefix("canceling statement due to ")? {
            "statement timeout" | "user request" => QUERY_CANCELED,
            "lock timeout" => "55P03",
            "conflict with recovery" => "40001",
            _ => return None,
        },
    };
    Some(state)
}

fn classify(message: &str, sql_state: Option<&str>, timezone: Option<&str>) -> ServiceError {
    if sql_state == Some(QUERY_CANCELED) {
        return ServiceError::QueryTimeout(message.to_string());
    }
    if message.contains("\"TimeZone\"") {
        return ServiceError::WrongTimezone(timezone.unwrap_or_default().to_string());
    }
    ServiceError::Database {
        message: message.replace("\\n", ""),
        sql_state: sql_state.map(str::to_string),
    }
}
