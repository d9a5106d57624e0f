use crate::{
    error::{Result, ServiceError},
    filter::Literal,
};
use chrono::{DateTime, Utc};
use diesel::pg::Pg;
use diesel::query_builder::{BoxedSqlQuery, SqlQuery};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// A value bound to a named `:parameter`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    List(Vec<SqlValue>),
}

pub type Params = BTreeMap<String, SqlValue>;

impl From<&Literal> for SqlValue {
    fn from(literal: &Literal) -> Self {
        match literal {
            Literal::Null => SqlValue::Null,
            Literal::Boolean(value) => SqlValue::Bool(*value),
            Literal::Number(number) => match number.as_i64() {
                Some(value) => SqlValue::Int(value),
                None => SqlValue::Float(number.as_f64().unwrap_or(f64::NAN)),
            },
            Literal::String(value) => SqlValue::Text(value.clone()),
        }
    }
}

impl SqlValue {
    pub fn text_list<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SqlValue::List(values.into_iter().map(|v| SqlValue::Text(v.into())).collect())
    }

    fn apply<'a>(&self, query: BoxedSqlQuery<'a, Pg, SqlQuery>) -> BoxedSqlQuery<'a, Pg, SqlQuery> {
        use diesel::sql_types::{Array, BigInt, Bool, Float8, Integer, Nullable, Text, Timestamptz};
        match self {
            SqlValue::Null => query.bind::<Nullable<Text>, _>(None::<String>),
            SqlValue::Bool(value) => query.bind::<Bool, _>(*value),
            // int4 keeps implicit casts (e.g. an SRID argument) resolvable
            SqlValue::Int(value) => match i32::try_from(*value) {
                Ok(small) => query.bind::<Integer, _>(small),
                Err(_) => query.bind::<BigInt, _>(*value),
            },
            SqlValue::Float(value) => query.bind::<Float8, _>(*value),
            SqlValue::Text(value) => query.bind::<Text, _>(value.clone()),
            SqlValue::Timestamp(value) => query.bind::<Timestamptz, _>(*value),
            SqlValue::List(values) => query.bind::<Array<Text>, _>(
                values.iter().map(SqlValue::to_text).collect::<Vec<_>>(),
            ),
        }
    }

    fn to_text(&self) -> String {
        match self {
            SqlValue::Null => String::new(),
            SqlValue::Bool(value) => value.to_string(),
            SqlValue::Int(value) => value.to_string(),
            SqlValue::Float(value) => value.to_string(),
            SqlValue::Text(value) => value.clone(),
            SqlValue::Timestamp(value) => value.to_rfc3339(),
            SqlValue::List(values) => values
                .iter()
                .map(SqlValue::to_text)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// SQL with positional `$n` placeholders and the values to bind, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    pub sql: String,
    pub binds: Vec<SqlValue>,
}

impl BoundStatement {
    pub fn into_query(self) -> BoxedSqlQuery<'static, Pg, SqlQuery> {
        let mut query = diesel::sql_query(self.sql).into_boxed::<Pg>();
        for value in &self.binds {
            query = value.apply(query);
        }
        query
    }
}

/// Rewrites `:name` parameters to `$n`.
///
/// `::` casts and quoted literals are left alone. A list expands to one
/// placeholder per element, nulls are written as the `null` keyword, and a name
/// used twice reuses its placeholders.
pub fn bind_named(sql: &str, params: &Params) -> Result<BoundStatement> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut binds: Vec<SqlValue> = Vec::new();
    let mut rendered: HashMap<String, String> = HashMap::new();
    let mut idx = 0;

    while idx < chars.len() {
        let ch = chars[idx];
        match ch {
            '\'' => {
                out.push(ch);
                idx += 1;
                while idx < chars.len() {
                    out.push(chars[idx]);
                    idx += 1;
                    if chars[idx - 1] == '\'' {
                        // '' is an escaped quote inside the literal
                        if chars.get(idx) == Some(&'\'') {
                            out.push('\'');
                            idx += 1;
                        } else {
                            break;
                        }
                    }
                }
            }
            ':' if chars.get(idx + 1) == Some(&':') => {
                out.push_str("::");
                idx += 2;
            }
            ':' if chars
                .get(idx + 1)
                .is_some_and(|next| next.is_ascii_alphabetic() || *next == '_') =>
            {
                let start = idx + 1;
                let mut end = start;
                while chars
                    .get(end)
                    .is_some_and(|next| next.is_ascii_alphanumeric() || *next == '_')
                {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                let placeholder = match rendered.get(&name) {
                    Some(existing) => existing.clone(),
                    None => {
                        let value = params.get(&name).ok_or_else(|| {
                            ServiceError::Internal(anyhow::anyhow!(
                                "statement references unbound parameter :{name}"
                            ))
                        })?;
                        let text = render(value, &mut binds);
                        rendered.insert(name, text.clone());
                        text
                    }
                };
                out.push_str(&placeholder);
                idx = end;
            }
            _ => {
                out.push(ch);
                idx += 1;
            }
        }
    }

    Ok(BoundStatement { sql: out, binds })
}

fn render(value: &SqlValue, binds: &mut Vec<SqlValue>) -> String {
    match value {
        SqlValue::Null => "null".to_string(),
        SqlValue::List(items) if items.is_empty() => "null".to_string(),
        SqlValue::List(items) => items
            .iter()
            .map(|item| render(item, binds))
            .collect::<Vec<_>>()
            .join(", "),
        scalar => {
            binds.push(scalar.clone());
            format!("${}", binds.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rewrites_names_and_skips_casts_and_literals() {
        let mut params = Params::new();
        params.insert("from".into(), SqlValue::Text("2024-01-01".into()));
        params.insert("types".into(), SqlValue::text_list(["a", "b"]));
        params.insert("limit".into(), SqlValue::Int(5));

        let bound = bind_named(
            "select ':x', m.json#>>'{a}' from t where ts >= :from::timestamptz and k in (:types) and ts < :from limit :limit",
            &params,
        )
        .unwrap();

        assert_eq!(
            bound.sql,
            "select ':x', m.json#>>'{a}' from t where ts >= $1::timestamptz and k in ($2, $3) and ts < $1 limit $4"
        );
        assert_eq!(
            bound.binds,
            vec![
                SqlValue::Text("2024-01-01".into()),
                SqlValue::Text("a".into()),
                SqlValue::Text("b".into()),
                SqlValue::Int(5),
            ]
        );
    }

    #[test]
    fn nulls_are_keywords_not_binds() {
        let mut params = Params::new();
        params.insert("pwhere_0".into(), SqlValue::Null);
        params.insert(
            "pwhere_1".into(),
            SqlValue::List(vec![SqlValue::Int(1), SqlValue::Null]),
        );
        let bound = bind_named("a is :pwhere_0 and b in (:pwhere_1)", &params).unwrap();
        assert_eq!(bound.sql, "a is null and b in ($1, null)");
        assert_eq!(bound.binds, vec![SqlValue::Int(1)]);
    }

    #[test]
    fn escaped_quotes_do_not_end_literals() {
        let params = Params::new();
        let bound = bind_named("select 'it''s :not' as x", &params).unwrap();
        assert_eq!(bound.sql, "select 'it''s :not' as x");
    }

    #[test]
    fn missing_parameter_is_an_error() {
        assert!(bind_named("select :nope", &Params::new()).is_err());
    }

    #[test]
    fn serializes_with_tag_and_content() {
        let value = serde_json::to_value(SqlValue::text_list(["x"])).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"t": "list", "v": [{"t": "text", "v": "x"}]})
        );
    }
}
