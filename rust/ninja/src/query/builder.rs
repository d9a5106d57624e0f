use super::{
    expansion::{CompiledWhere, Expansion},
    params::{Params, SqlValue},
    Catalog,
};
use crate::error::Result;

/// Accumulates SQL text and named parameters, appending fragments only when
/// the expansion recorded the attribute or target-list they depend on.
pub struct QueryBuilder<'a> {
    catalog: &'a Catalog,
    expansion: &'a Expansion,
    sql: String,
    params: Params,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(catalog: &'a Catalog, expansion: &'a Expansion) -> Self {
        Self {
            catalog,
            expansion,
            sql: String::new(),
            params: Params::new(),
        }
    }

    pub fn add_sql(&mut self, fragment: &str) -> &mut Self {
        let fragment = fragment.trim();
        if !fragment.is_empty() {
            if !self.sql.is_empty() {
                self.sql.push(' ');
            }
            self.sql.push_str(fragment);
        }
        self
    }

    pub fn add_sql_if(&mut self, fragment: &str, condition: bool) -> &mut Self {
        if condition {
            self.add_sql(fragment);
        }
        self
    }

    pub fn add_sql_if_alias(&mut self, fragment: &str, alias: &str) -> &mut Self {
        let used = self.expansion.uses_attribute(alias);
        self.add_sql_if(fragment, used)
    }

    pub fn add_sql_if_definition(&mut self, fragment: &str, list: &str) -> &mut Self {
        let used = self.expansion.uses_list(list);
        self.add_sql_if(fragment, used)
    }

    pub fn set_parameter(&mut self, name: &str, value: SqlValue) -> &mut Self {
        self.params.insert(name.to_string(), value);
        self
    }

    pub fn set_parameter_if_not_null(
        &mut self,
        name: &str,
        value: Option<SqlValue>,
        fragment: &str,
    ) -> &mut Self {
        if let Some(value) = value {
            self.set_parameter(name, value).add_sql(fragment);
        }
        self
    }

    /// Binds the list and appends `fragment` unless `values` is empty.
    pub fn set_parameter_if_not_empty(
        &mut self,
        name: &str,
        values: &[String],
        fragment: &str,
    ) -> &mut Self {
        if !values.is_empty() {
            self.set_parameter(name, SqlValue::text_list(values.iter().cloned()))
                .add_sql(fragment);
        }
        self
    }

    /// `select` or `select distinct`.
    pub fn add_select(&mut self) -> &mut Self {
        if self.expansion.is_distinct() {
            self.add_sql("select distinct")
        } else {
            self.add_sql("select")
        }
    }

    /// Projection of the given lists (all when empty).
    pub fn expand_select(&mut self, lists: &[&str]) -> &mut Self {
        let select = self.expansion.select_sql(lists);
        self.add_sql(&select)
    }

    /// Like [`Self::expand_select`], preceded by `prefix` when `condition` holds and
    /// the projection is not empty.
    pub fn expand_select_prefix(&mut self, prefix: &str, condition: bool, lists: &[&str]) -> &mut Self {
        let select = self.expansion.select_sql(lists);
        if select.is_empty() {
            return self;
        }
        if condition {
            self.sql.push_str(prefix);
        }
        self.add_sql(&select)
    }

    /// Appends `and <predicate>` and merges its parameters. `preferred` picks the
    /// target-list for attributes defined in several lists.
    pub fn expand_where(&mut self, preferred: Option<&str>) -> Result<&mut Self> {
        let compiled = match preferred {
            Some(list) => self.expansion.compile_where_for(self.catalog, list)?,
            None => self.expansion.compiled_where().cloned(),
        };
        if let Some(CompiledWhere { sql, params }) = compiled {
            if !sql.is_empty() {
                self.add_sql(&format!("and {sql}"));
                self.params.extend(params);
            }
        }
        Ok(self)
    }

    pub fn add_limit(&mut self, limit: i64) -> &mut Self {
        if limit > 0 {
            self.set_parameter("limit", SqlValue::Int(limit))
                .add_sql("limit :limit");
        }
        self
    }

    pub fn add_offset(&mut self, offset: i64) -> &mut Self {
        if offset >= 0 {
            self.set_parameter("offset", SqlValue::Int(offset))
                .add_sql("offset :offset");
        }
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn finish(self) -> (String, Params) {
        (self.sql, self.params)
    }
}

/// Splits a path segment such as `A,B` into sorted unique values. `None` stands
/// for `*`, meaning no restriction.
pub fn parse_csv(csv: &str) -> Option<Vec<String>> {
    let mut values: Vec<String> = csv
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect();
    if values.is_empty() || values.iter().any(|value| value == "*") {
        return None;
    }
    values.sort();
    values.dedup();
    Some(values)
}
