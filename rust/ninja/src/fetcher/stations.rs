use super::{csv_log, DataFetcher, CompiledQuery, TreePlan};
use crate::{
    error::Result,
    query::{parse_csv, QueryBuilder, SqlValue},
    representation::Dataset,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::time::Instant;

const TREE_STATION_KEYS: &str = "s.stationtype as _stationtype, s.stationcode as _stationcode";

impl DataFetcher<'_> {
    /// Stations of the given types.
    pub fn stations(&self, station_types: &str) -> Result<CompiledQuery> {
        self.require("fetchStations", Dataset::Node)?;
        let started = Instant::now();
        let types = parse_csv(station_types);
        let tree = self.is_tree();

        let expansion = self.expand(&["station", "parent"])?;
        let mut qb = QueryBuilder::new(self.catalog, &expansion);
        qb.add_select()
            .add_sql_if(TREE_STATION_KEYS, tree)
            .expand_select_prefix(",", tree, &[])
            .add_sql("from station s");
        station_joins(&mut qb);
        qb.add_sql("where s.available = true")
            .add_sql_if_definition("and (p.id is null or p.available = true)", "parent")
            .set_parameter_if_not_empty(
                "stationtypes",
                types.as_deref().unwrap_or_default(),
                "and s.stationtype in (:stationtypes)",
            );
        qb.expand_where(None)?
            .add_sql_if("order by _stationtype, _stationcode", tree);
        self.paginate(&mut qb);

        let mut log = Map::new();
        log.insert("station_types".into(), csv_log(types.as_deref()));
        Ok(self.compile(
            "fetchStations",
            qb,
            TreePlan::new("stationtype", &["datatype", "metadatahistory"]),
            started,
            log,
        ))
    }

    /// Stations with the metadata records created within `[from, to)`.
    pub fn stations_metadata_history(
        &self,
        station_types: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<CompiledQuery> {
        self.require("fetchStationsAndMetadata", Dataset::Node)?;
        let started = Instant::now();
        let types = parse_csv(station_types);
        let tree = self.is_tree();

        let expansion = self.expand(&["station", "parent", "metadatahistory"])?;
        let mut qb = QueryBuilder::new(self.catalog, &expansion);
        qb.add_select()
            .add_sql_if(TREE_STATION_KEYS, tree)
            .expand_select_prefix(",", tree, &[])
            .add_sql("from station s")
            .add_sql("join metadata mh on mh.station_id = s.id");
        station_joins(&mut qb);
        qb.add_sql("where s.available = true")
            .add_sql_if_definition("and (p.id is null or p.available = true)", "parent")
            .set_parameter_if_not_empty(
                "stationtypes",
                types.as_deref().unwrap_or_default(),
                "and s.stationtype in (:stationtypes)",
            )
            .set_parameter_if_not_null(
                "from",
                from.map(SqlValue::Timestamp),
                "and mh.created_on >= :from::timestamptz",
            )
            .set_parameter_if_not_null(
                "to",
                to.map(SqlValue::Timestamp),
                "and mh.created_on < :to::timestamptz",
            );
        qb.expand_where(None)?
            .add_sql_if("order by _stationtype, _stationcode", tree);
        self.paginate(&mut qb);

        let mut log = Map::new();
        log.insert("station_types".into(), csv_log(types.as_deref()));
        log.insert("history_from".into(), timestamp_log(from));
        log.insert("history_to".into(), timestamp_log(to));
        Ok(self.compile(
            "fetchStationsAndMetadata",
            qb,
            TreePlan::new("stationtype", &["datatype"]),
            started,
            log,
        ))
    }

    /// Stations together with the data types they have measurements for.
    pub fn stations_and_types(&self, station_types: &str, data_types: &str) -> Result<CompiledQuery> {
        self.require("fetchStationsAndTypes", Dataset::Node)?;
        let started = Instant::now();
        let types = parse_csv(station_types);
        let datatypes = parse_csv(data_types);
        let tree = self.is_tree();

        let expansion = self.expand(&["station", "parent", "datatype"])?;
        let mut qb = QueryBuilder::new(self.catalog, &expansion);
        for (idx, table) in ["measurement", "measurementstring", "measurementjson"]
            .into_iter()
            .enumerate()
        {
            qb.add_sql_if("union all", idx > 0)
                .add_select()
                .add_sql_if(
                    "s.stationtype as _stationtype, s.stationcode as _stationcode, t.cname as _datatypename",
                    tree,
                )
                .expand_select_prefix(",", tree, &[])
                .add_sql(&format!("from {table} me"))
                .add_sql("join station s on me.station_id = s.id");
            station_joins(&mut qb);
            qb.add_sql("join type t on me.type_id = t.id")
                .add_sql_if_alias("left join type_metadata tm on tm.id = t.meta_data_id", "tmetadata")
                .add_sql("where s.available = true")
                .add_sql_if_definition("and (p.id is null or p.available = true)", "parent")
                .set_parameter_if_not_empty(
                    "stationtypes",
                    types.as_deref().unwrap_or_default(),
                    "and s.stationtype in (:stationtypes)",
                )
                .set_parameter_if_not_empty(
                    "datatypes",
                    datatypes.as_deref().unwrap_or_default(),
                    "and t.cname in (:datatypes)",
                );
            qb.expand_where(None)?;
        }
        qb.add_sql_if("order by _stationtype, _stationcode, _datatypename", tree);
        self.paginate(&mut qb);

        let mut log = Map::new();
        log.insert("station_types".into(), csv_log(types.as_deref()));
        log.insert("data_types".into(), csv_log(datatypes.as_deref()));
        Ok(self.compile(
            "fetchStationsAndTypes",
            qb,
            TreePlan::new(
                "stationtype",
                &[
                    "measurement",
                    "measurementdouble",
                    "measurementstring",
                    "measurementjson",
                    "metadatahistory",
                ],
            ),
            started,
            log,
        ))
    }
}

/// Metadata and parent joins, each only when referenced.
pub(super) fn station_joins(qb: &mut QueryBuilder<'_>) {
    qb.add_sql_if_alias("left join metadata m on m.id = s.meta_data_id", "smetadata")
        .add_sql_if_definition("left join station p on s.parent_id = p.id", "parent")
        .add_sql_if_alias("left join metadata pm on pm.id = p.meta_data_id", "pmetadata");
}

pub(super) fn timestamp_log(moment: Option<DateTime<Utc>>) -> Value {
    moment.map_or(Value::Null, |moment| Value::String(moment.to_rfc3339()))
}
