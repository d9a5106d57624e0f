use super::{csv_log, CompiledQuery, DataFetcher, TreePlan};
use crate::{
    error::Result,
    query::{parse_csv, QueryBuilder},
    representation::Dataset,
};
use serde_json::Map;
use std::time::Instant;

impl DataFetcher<'_> {
    /// Edges whose edge-station has one of the given types, with optional
    /// begin and end stations.
    pub fn edges(&self, edge_types: &str) -> Result<CompiledQuery> {
        self.require("fetchEdges", Dataset::Edge)?;
        let started = Instant::now();
        let types = parse_csv(edge_types);
        let tree = self.is_tree();

        let expansion = self.expand(&["edge", "stationbegin", "stationend"])?;
        let mut qb = QueryBuilder::new(self.catalog, &expansion);
        qb.add_select()
            .add_sql_if("i.stationtype as _edgetype, i.stationcode as _edgecode", tree)
            .expand_select_prefix(",", tree, &[])
            .add_sql("from edge e")
            .add_sql("join station i on e.edge_data_id = i.id")
            .add_sql_if_definition("left join station o on e.origin_id = o.id", "stationbegin")
            .add_sql_if_definition("left join station d on e.destination_id = d.id", "stationend")
            .add_sql("where i.available = true")
            .add_sql_if_definition("and (o.available is null or o.available = true)", "stationbegin")
            .add_sql_if_definition("and (d.available is null or d.available = true)", "stationend")
            .set_parameter_if_not_empty(
                "stationtypes",
                types.as_deref().unwrap_or_default(),
                "and i.stationtype in (:stationtypes)",
            );
        qb.expand_where(None)?
            .add_sql_if("order by _edgetype, _edgecode", tree);
        self.paginate(&mut qb);

        let mut log = Map::new();
        log.insert("edge_types".into(), csv_log(types.as_deref()));
        Ok(self.compile("fetchEdges", qb, TreePlan::new("edgetype", &[]), started, log))
    }
}
