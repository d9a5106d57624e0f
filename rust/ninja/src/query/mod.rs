pub mod builder;
pub mod executor;
pub mod expansion;
pub mod params;

pub use builder::{parse_csv, QueryBuilder};
pub use expansion::{CompiledWhere, Expansion, SelectExpander, WhereClauseTarget};
pub use params::{bind_named, BoundStatement, Params, SqlValue};

use crate::{filter::OperatorRegistry, schema::Schema};

/// Schema and operator table, built once at startup and shared read-only.
#[derive(Debug)]
pub struct Catalog {
    pub schema: Schema,
    pub operators: OperatorRegistry,
}

impl Catalog {
    pub fn standard() -> anyhow::Result<Self> {
        Ok(Self {
            schema: crate::schema::api_schema()?,
            operators: OperatorRegistry::standard(),
        })
    }

    pub fn expander(&self) -> SelectExpander<'_> {
        SelectExpander::new(self)
    }
}
