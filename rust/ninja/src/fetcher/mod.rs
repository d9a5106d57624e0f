//! Query recipes and their execution.
//!
//! A [`DataFetcher`] turns the path segments and query parameters of one request
//! into a [`CompiledQuery`]: SQL text, named parameters and the plan for shaping
//! the result. Compilation does not touch the database, execution happens in
//! [`QueryEngine::execute`].

pub mod acl;
mod edges;
mod events;
mod measurements;
mod stations;
mod types;

pub use events::EventWindow;
pub use types::{listing_sql, self_links};

use crate::{
    config::AppConfig,
    db::PgPool,
    error::{Result, ServiceError},
    query::{
        bind_named,
        executor::{apply_session, load_ids, load_rows, Row, SessionSettings},
        Catalog, Expansion, Params, QueryBuilder,
    },
    representation::{Dataset, Representation, Shape},
    schema::{ExitPoint, Schema},
    tree::TreeBuilder,
};
use acl::{AclClass, AclRules, ROLE_GUEST};
use serde_json::{Map, Value};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, error, info};

pub const DEFAULT_LIMIT: i64 = 200;

/// Request scoped knobs shared by every recipe.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub representation: Representation,
    pub limit: i64,
    pub offset: i64,
    pub select: Option<String>,
    pub filter: Option<String>,
    pub show_null: bool,
    pub distinct: bool,
    pub roles: Vec<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            representation: Representation::new(Dataset::Node, Shape::Flat),
            limit: DEFAULT_LIMIT,
            offset: 0,
            select: None,
            filter: None,
            show_null: false,
            distinct: true,
            roles: vec![ROLE_GUEST.to_string()],
        }
    }
}

/// Entry point and exit points used to nest rows of a tree response.
#[derive(Debug, Clone, PartialEq)]
pub struct TreePlan {
    pub entry: &'static str,
    pub exits: Vec<ExitPoint>,
}

impl TreePlan {
    fn new(entry: &'static str, exits: &[&str]) -> Self {
        Self {
            entry,
            exits: exits.iter().map(|list| ExitPoint::exclusive(list)).collect(),
        }
    }
}

/// A recipe ready to run.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub command: &'static str,
    pub representation: Representation,
    pub sql: String,
    pub params: Params,
    pub tree: TreePlan,
    /// Rows carry the split value columns of the measurement tables.
    pub collapse_values: bool,
    pub show_null: bool,
    pub build_time: Duration,
    pub log_data: Map<String, Value>,
}

impl CompiledQuery {
    /// Shapes executed rows into the response `data` value.
    pub fn render(&self, schema: &Schema, rows: Vec<Row>, max_size_mb: i64) -> Result<Value> {
        let rows: Vec<Row> = if self.collapse_values {
            rows.into_iter().map(collapse_values).collect()
        } else {
            rows
        };

        match self.representation.shape {
            Shape::Tree => TreeBuilder::new(schema, self.tree.entry, &self.tree.exits)
                .show_null(self.show_null)
                .max_size_mb(max_size_mb)
                .build(&rows),
            Shape::Flat => Ok(Value::Array(
                rows.into_iter()
                    .map(|row| Value::Object(clean_flat(row, self.show_null)))
                    .collect(),
            )),
        }
    }
}

/// Compiles recipes for one request.
pub struct DataFetcher<'a> {
    catalog: &'a Catalog,
    acl: &'a AclRules,
    options: &'a FetchOptions,
}

impl<'a> DataFetcher<'a> {
    pub fn new(catalog: &'a Catalog, acl: &'a AclRules, options: &'a FetchOptions) -> Self {
        Self {
            catalog,
            acl,
            options,
        }
    }

    fn is_tree(&self) -> bool {
        self.options.representation.is_tree()
    }

    fn require(&self, method: &'static str, dataset: Dataset) -> Result<()> {
        if self.options.representation.dataset == dataset {
            return Ok(());
        }
        Err(ServiceError::MethodNotAllowed {
            method,
            representation: self.options.representation.to_string(),
        })
    }

    fn expand(&self, allowed: &[&str]) -> Result<Expansion> {
        self.catalog.expander().expand(
            self.options.select.as_deref(),
            self.options.filter.as_deref(),
            allowed,
            self.options.distinct,
        )
    }

    fn acl_clause(&self, class: AclClass) -> Result<Option<String>> {
        Ok(self.acl.where_clause(class, &self.options.roles)?)
    }

    fn paginate(&self, qb: &mut QueryBuilder<'_>) {
        qb.add_limit(self.options.limit).add_offset(self.options.offset);
    }

    fn compile(
        &self,
        command: &'static str,
        qb: QueryBuilder<'_>,
        tree: TreePlan,
        started: Instant,
        log_data: Map<String, Value>,
    ) -> CompiledQuery {
        let (sql, params) = qb.finish();
        CompiledQuery {
            command,
            representation: self.options.representation,
            sql,
            params,
            tree,
            collapse_values: false,
            show_null: self.options.show_null,
            build_time: started.elapsed(),
            log_data,
        }
    }
}

/// Values of a CSV path segment for the request log, `["*"]` when unrestricted.
fn csv_log(values: Option<&[String]>) -> Value {
    match values {
        Some(values) => Value::from(values.to_vec()),
        None => Value::from(vec!["*"]),
    }
}

/// Folds the per-table value columns into a single `mvalue`, at the position of
/// the first of them. The first non-null slot wins.
pub fn collapse_values(row: Row) -> Row {
    const VALUE_SLOTS: [&str; 4] = ["mvalue", "mvalue_double", "mvalue_string", "mvalue_json"];
    let is_slot = |key: &str| VALUE_SLOTS.contains(&key);
    if !row.keys().any(|key| key != "mvalue" && is_slot(key)) {
        return row;
    }

    let mut out = Row::new();
    let mut value = Value::Null;
    let mut placed = false;
    for (key, cell) in row {
        if !is_slot(&key) {
            out.insert(key, cell);
            continue;
        }
        if !placed {
            out.insert("mvalue".to_string(), Value::Null);
            placed = true;
        }
        if value.is_null() {
            value = cell;
        }
    }
    out.insert("mvalue".to_string(), value);
    out
}

/// Drops hidden `_` columns and, unless `show_null`, empty cells.
pub fn clean_flat(row: Row, show_null: bool) -> Row {
    row.into_iter()
        .filter(|(key, _)| !key.starts_with('_'))
        .filter(|(_, cell)| show_null || !cell.is_null())
        .collect()
}

#[derive(Clone)]
pub struct QueryEngine {
    pool: PgPool,
    config: Arc<AppConfig>,
    catalog: Arc<Catalog>,
    acl: Arc<AclRules>,
}

impl QueryEngine {
    pub fn new(pool: PgPool, config: Arc<AppConfig>, catalog: Arc<Catalog>, acl: Arc<AclRules>) -> Self {
        Self {
            pool,
            config,
            catalog,
            acl,
        }
    }

    pub fn fetcher<'a>(&'a self, options: &'a FetchOptions) -> DataFetcher<'a> {
        DataFetcher::new(&self.catalog, &self.acl, options)
    }

    /// Runs `compiled` under the session `timezone` and returns the response `data`.
    pub async fn execute(&self, compiled: CompiledQuery, timezone: &str) -> Result<Value> {
        let started = Instant::now();
        let statement = bind_named(&compiled.sql, &compiled.params)?;
        let mut conn = self.pool.get().await.map_err(|err| {
            error!(error = ?err, "failed to acquire database connection");
            ServiceError::Internal(anyhow::anyhow!("{err:?}"))
        })?;

        apply_session(
            &mut conn,
            &SessionSettings {
                timezone: timezone.to_string(),
                statement_timeout: self.config.statement_timeout,
            },
        )
        .await?;
        let rows = load_rows(&mut conn, statement).await?;
        drop(conn);
        let execution_time = started.elapsed();

        info!(
            command = compiled.command,
            representation = %compiled.representation,
            result_count = rows.len(),
            build_time_ms = compiled.build_time.as_millis() as u64,
            execution_time_ms = execution_time.as_millis() as u64,
            extra = %serde_json::Value::Object(compiled.log_data.clone()),
            "query_execution"
        );
        debug!(command = compiled.command, sql = %compiled.sql, "query_execution sql");

        compiled.render(&self.catalog.schema, rows, self.config.response_max_size_mb)
    }

    /// Distinct station types, edge types or event origins with their self links.
    /// `raw_representation` is the first path segment as the client wrote it.
    pub async fn list_types(
        &self,
        representation: Representation,
        raw_representation: &str,
    ) -> Result<Vec<Value>> {
        let started = Instant::now();
        let (command, sql) = listing_sql(representation.dataset);
        let mut conn = self.pool.get().await.map_err(|err| {
            error!(error = ?err, "failed to acquire database connection");
            ServiceError::Internal(anyhow::anyhow!("{err:?}"))
        })?;
        let ids = load_ids(&mut conn, sql).await?;
        drop(conn);

        info!(
            command,
            representation = %representation,
            result_count = ids.len(),
            build_time_ms = 0u64,
            execution_time_ms = started.elapsed().as_millis() as u64,
            "query_execution"
        );
        debug!(command, sql, "query_execution sql");

        let url = format!("{}/{}/", self.config.base_url, raw_representation);
        Ok(ids
            .iter()
            .map(|id| self_links(representation, &url, id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SqlValue;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    pub(super) fn catalog() -> Catalog {
        Catalog::standard().unwrap()
    }

    pub(super) fn options(representation: &str) -> FetchOptions {
        FetchOptions {
            representation: representation.parse().unwrap(),
            ..FetchOptions::default()
        }
    }

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn value_columns_collapse_in_place() {
        let collapsed = collapse_values(row(json!({
            "_timestamp": "t",
            "mvalidtime": "t",
            "mvalue_double": null,
            "mvalue_string": "ok",
            "mvalue_json": null,
            "tname": "status",
        })));
        assert_eq!(
            collapsed.keys().collect::<Vec<_>>(),
            vec!["_timestamp", "mvalidtime", "mvalue", "tname"]
        );
        assert_eq!(collapsed["mvalue"], json!("ok"));

        let untouched = row(json!({"sname": "a", "mvalue": 1.5}));
        assert_eq!(collapse_values(untouched.clone()), untouched);
    }

    #[test]
    fn each_value_table_keeps_its_value() {
        let cases = [
            (json!({"mvalue_double": 3.5, "mvalue_string": null, "mvalue_json": null}), json!(3.5)),
            (json!({"mvalue_double": null, "mvalue_string": "ok", "mvalue_json": null}), json!("ok")),
            (
                json!({"mvalue_double": null, "mvalue_string": null, "mvalue_json": {"state": "on"}}),
                json!({"state": "on"}),
            ),
            (json!({"mvalue_double": null, "mvalue_string": null, "mvalue_json": null}), Value::Null),
        ];
        for (input, expected) in cases {
            let collapsed = collapse_values(row(input.clone()));
            assert_eq!(collapsed.len(), 1, "{input}");
            assert_eq!(collapsed["mvalue"], expected, "{input}");
        }
    }

    #[test]
    fn value_named_after_the_alias_is_not_overwritten() {
        let collapsed = collapse_values(row(json!({
            "mvalue": 7.0,
            "mvalue_string": null,
            "mvalue_json": null,
            "tname": "temp",
        })));
        assert_eq!(Value::Object(collapsed), json!({"mvalue": 7.0, "tname": "temp"}));

        let collapsed = collapse_values(row(json!({
            "mvalue_double": null,
            "mvalue": "ok",
            "mvalue_json": null,
        })));
        assert_eq!(Value::Object(collapsed), json!({"mvalue": "ok"}));
    }

    #[test]
    fn flat_rows_hide_internal_columns_and_nulls() {
        let input = row(json!({"_stationcode": "A", "sname": "Alpha", "sorigin": null}));
        assert_eq!(
            Value::Object(clean_flat(input.clone(), false)),
            json!({"sname": "Alpha"})
        );
        assert_eq!(
            Value::Object(clean_flat(input, true)),
            json!({"sname": "Alpha", "sorigin": null})
        );
    }

    #[test]
    fn render_builds_trees_for_tree_representations() {
        let catalog = catalog();
        let acl = AclRules::bundled();
        let options = options("tree");
        let compiled = DataFetcher::new(&catalog, &acl, &options)
            .stations("ParkingStation")
            .unwrap();
        let rows = vec![row(json!({
            "_stationtype": "ParkingStation",
            "_stationcode": "P1",
            "sname": "Centre",
        }))];
        let data = compiled.render(&catalog.schema, rows, 0).unwrap();
        assert_eq!(
            data,
            json!({"ParkingStation": {"stations": {"P1": {"sname": "Centre"}}}})
        );
    }

    #[test]
    fn compilation_is_deterministic() {
        let catalog = catalog();
        let acl = AclRules::bundled();
        let options = FetchOptions {
            filter: Some("and(smetadata.city.eq.\"BZ\",mvalue.gt.3)".into()),
            ..options("tree")
        };
        let fetcher = DataFetcher::new(&catalog, &acl, &options);
        let first = fetcher.measurements("A,B", "*", None).unwrap();
        let second = fetcher.measurements("B,A", "*", None).unwrap();
        assert_eq!(first.sql, second.sql);
        assert_eq!(first.params, second.params);
        assert_eq!(
            first.params.get("stationtypes"),
            Some(&SqlValue::text_list(["A", "B"]))
        );
    }

    #[test]
    fn filter_values_are_never_inlined() {
        let catalog = catalog();
        let acl = AclRules::bundled();
        let hostile = "x'; DROP TABLE station --";
        let options = FetchOptions {
            filter: Some(format!("sname.eq.\"{hostile}\"")),
            ..options("flat")
        };
        let compiled = DataFetcher::new(&catalog, &acl, &options)
            .stations("*")
            .unwrap();
        assert!(!compiled.sql.contains("DROP"), "{}", compiled.sql);
        assert!(compiled.sql.contains("(s.name = :pwhere_0)"), "{}", compiled.sql);
        assert_eq!(
            compiled.params.get("pwhere_0"),
            Some(&SqlValue::Text(hostile.to_string()))
        );
    }
}
