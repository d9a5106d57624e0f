use super::{csv_log, stations::station_joins, stations::timestamp_log, CompiledQuery, DataFetcher, TreePlan};
use crate::{
    error::{Result, ServiceError},
    fetcher::acl::AclClass,
    filter::ValueType,
    query::{parse_csv, Expansion, QueryBuilder, SqlValue},
    quota::history::range_in_days,
    representation::Dataset,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::time::Instant;

/// One physical value table and the target-list that projects its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueTable {
    Double,
    String,
    Json,
}

impl ValueTable {
    const ALL: [ValueTable; 3] = [ValueTable::Double, ValueTable::String, ValueTable::Json];

    fn table(self, history: bool) -> &'static str {
        match (self, history) {
            (ValueTable::Double, false) => "measurement",
            (ValueTable::Double, true) => "measurementhistory",
            (ValueTable::String, false) => "measurementstring",
            (ValueTable::String, true) => "measurementstringhistory",
            (ValueTable::Json, false) => "measurementjson",
            (ValueTable::Json, true) => "measurementjsonhistory",
        }
    }

    fn value_list(self) -> &'static str {
        match self {
            ValueTable::Double => "measurementdouble",
            ValueTable::String => "measurementstring",
            ValueTable::Json => "measurementjson",
        }
    }
}

/// Tables worth querying given how `mvalue` is used in the filter.
fn value_tables(expansion: &Expansion) -> Result<Vec<ValueTable>> {
    let target = match expansion.where_targets("mvalue") {
        [] => return Ok(ValueTable::ALL.to_vec()),
        [target] => target,
        [_, second, ..] => {
            return Err(ServiceError::OperatorCheckFailed {
                alias: "mvalue".to_string(),
                operator: second.operator.clone(),
                value: format!("{} (only one mvalue clause is supported)", second.value),
            })
        }
    };

    let given = target.value.value_type();
    if !matches!(given, ValueType::Null | ValueType::Number | ValueType::String) {
        return Err(ServiceError::InvalidWhereDataType {
            alias: "mvalue".to_string(),
            given: given.to_string(),
        });
    }
    if target.json_path.is_some() {
        return Ok(vec![ValueTable::Json]);
    }
    Ok(match given {
        ValueType::Number => vec![ValueTable::Double],
        ValueType::String => vec![ValueTable::String],
        _ => ValueTable::ALL.to_vec(),
    })
}

impl DataFetcher<'_> {
    /// Latest measurements, or the history within `[from, to)` when `range` is set.
    pub fn measurements(
        &self,
        station_types: &str,
        data_types: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<CompiledQuery> {
        let command = if range.is_some() {
            "fetchMeasurementHistory"
        } else {
            "fetchMeasurement"
        };
        self.require(command, Dataset::Node)?;
        let started = Instant::now();
        let types = parse_csv(station_types);
        let datatypes = parse_csv(data_types);
        let tree = self.is_tree();
        let history = range.is_some();

        let expansion = self.expand(&[
            "station",
            "parent",
            "datatype",
            "measurement",
            "measurementdouble",
            "measurementstring",
            "measurementjson",
            "provenance",
        ])?;
        let tables = value_tables(&expansion)?;
        let acl = self.acl_clause(AclClass::Stations)?;

        let mut qb = QueryBuilder::new(self.catalog, &expansion);
        for (idx, value) in tables.iter().enumerate() {
            qb.add_sql_if("union all", idx > 0)
                .add_select()
                .add_sql_if(
                    "s.stationtype as _stationtype, s.stationcode as _stationcode, t.cname as _datatypename",
                    tree,
                )
                .add_sql_if("me.timestamp as _timestamp", !tree)
                .expand_select_prefix(
                    ",",
                    true,
                    &["station", "parent", "datatype", "measurement", value.value_list(), "provenance"],
                )
                .add_sql(&format!("from {} me", value.table(history)))
                .add_sql("join station s on me.station_id = s.id");
            station_joins(&mut qb);
            qb.add_sql("join type t on me.type_id = t.id")
                .add_sql_if_alias("left join type_metadata tm on tm.id = t.meta_data_id", "tmetadata")
                .add_sql_if_definition("left join provenance pr on me.provenance_id = pr.id", "provenance")
                .add_sql("where s.available = true");
            if let Some(clause) = &acl {
                qb.add_sql(&format!("and {clause}"));
            }
            qb.add_sql_if_definition("and (p.id is null or p.available = true)", "parent")
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
            if let Some((from, to)) = range {
                qb.set_parameter("from", SqlValue::Timestamp(from))
                    .set_parameter("to", SqlValue::Timestamp(to))
                    .add_sql("and me.timestamp >= :from::timestamptz and me.timestamp < :to::timestamptz");
            }
            qb.expand_where(Some(value.value_list()))?;
        }
        qb.add_sql_if("order by _stationtype, _stationcode, _datatypename", tree)
            .add_sql_if("order by _timestamp asc", !tree);
        self.paginate(&mut qb);

        let mut log = Map::new();
        log.insert("station_types".into(), csv_log(types.as_deref()));
        log.insert("data_types".into(), csv_log(datatypes.as_deref()));
        if let Some((from, to)) = range {
            log.insert("history_from".into(), timestamp_log(Some(from)));
            log.insert("history_to".into(), timestamp_log(Some(to)));
            log.insert("history_days".into(), Value::from(range_in_days(from, to)));
        }

        let mut compiled = self.compile(
            command,
            qb,
            TreePlan::new("stationtype", &["metadatahistory"]),
            started,
            log,
        );
        compiled.collapse_values = true;
        Ok(compiled)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{catalog, options};
    use super::*;
    use crate::fetcher::{acl::AclRules, FetchOptions};
    use pretty_assertions::assert_eq;

    fn compile(filter: Option<&str>, representation: &str) -> Result<CompiledQuery> {
        let catalog = catalog();
        let acl = AclRules::bundled();
        let options = FetchOptions {
            filter: filter.map(str::to_string),
            ..options(representation)
        };
        DataFetcher::new(&catalog, &acl, &options).measurements("*", "*", None)
    }

    #[test]
    fn string_value_filter_reads_only_the_string_table() {
        let sql = compile(Some("mvalue.eq.\"ok\""), "flat").unwrap().sql;
        assert_eq!(sql.matches("from measurementstring me").count(), 1);
        assert!(!sql.contains("from measurement me"));
        assert!(!sql.contains("union all"));
    }

    #[test]
    fn number_value_filter_reads_only_the_double_table() {
        let sql = compile(Some("mvalue.eq.42"), "flat").unwrap().sql;
        assert_eq!(sql.matches("from measurement me").count(), 1);
        assert!(!sql.contains("measurementstring me"));
        assert!(sql.contains("and (me.double_value = :pwhere_0)"), "{sql}");
    }

    #[test]
    fn json_path_reads_only_the_json_table() {
        let sql = compile(Some("mvalue.state.eq.\"ok\""), "flat").unwrap().sql;
        assert_eq!(sql.matches(" me join").count(), 1);
        assert!(sql.contains("from measurementjson me"));
    }

    #[test]
    fn without_value_filter_all_tables_are_united() {
        for filter in [None, Some("mvalue.eq.null")] {
            let sql = compile(filter, "flat").unwrap().sql;
            assert_eq!(sql.matches("union all").count(), 2, "{sql}");
            assert!(sql.contains("from measurement me"));
            assert!(sql.contains("from measurementstring me"));
            assert!(sql.contains("from measurementjson me"));
        }
    }

    #[test]
    fn united_branches_project_the_same_value_labels() {
        let sql = compile(Some("mvalue.eq.null"), "flat").unwrap().sql;
        for projection in [
            "me.double_value as mvalue_double, null::character varying as mvalue_string, null::jsonb as mvalue_json",
            "null::double precision as mvalue_double, me.string_value as mvalue_string, null::jsonb as mvalue_json",
            "null::double precision as mvalue_double, null::character varying as mvalue_string, me.json_value as mvalue_json",
        ] {
            assert_eq!(sql.matches(projection).count(), 1, "{sql}");
        }
        assert!(!sql.contains(" as mvalue,"), "{sql}");
    }

    #[test]
    fn unsupported_value_types_are_rejected() {
        let err = compile(Some("mvalue.eq.true"), "flat").unwrap_err();
        assert!(
            matches!(&err, ServiceError::InvalidWhereDataType { alias, given } if alias == "mvalue" && given == "BOOLEAN"),
            "got: {err:?}"
        );

        let err = compile(Some("and(mvalue.gt.1,mvalue.lt.5)"), "flat").unwrap_err();
        assert!(matches!(err, ServiceError::OperatorCheckFailed { .. }), "got: {err:?}");
    }

    #[test]
    fn flat_measurements_are_ordered_by_time() {
        let compiled = compile(None, "flat").unwrap();
        assert!(compiled.sql.starts_with("select distinct me.timestamp as _timestamp, "));
        assert!(compiled.sql.contains("order by _timestamp asc limit :limit offset :offset"));
        assert!(compiled.collapse_values);
    }

    #[test]
    fn guests_get_the_station_acl() {
        let sql = compile(Some("mvalue.eq.42"), "tree").unwrap().sql;
        assert!(
            sql.contains("where s.available = true and ((s.origin is null or s.origin not like 'CLOSED/%'))"),
            "{sql}"
        );
        assert!(sql.contains("order by _stationtype, _stationcode, _datatypename"));

        let catalog = catalog();
        let acl = AclRules::bundled();
        let options = FetchOptions {
            roles: vec!["ADMIN".into()],
            ..options("tree")
        };
        let compiled = DataFetcher::new(&catalog, &acl, &options)
            .measurements("*", "*", None)
            .unwrap();
        assert!(!compiled.sql.contains("CLOSED"));
    }

    #[test]
    fn history_uses_the_history_tables_and_window() {
        let catalog = catalog();
        let acl = AclRules::bundled();
        let options = options("flat");
        let from = "2024-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let to = "2024-01-02T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let compiled = DataFetcher::new(&catalog, &acl, &options)
            .measurements("ParkingStation", "occupied", Some((from, to)))
            .unwrap();

        assert_eq!(compiled.command, "fetchMeasurementHistory");
        assert!(compiled.sql.contains("from measurementhistory me"));
        assert!(compiled.sql.contains("from measurementstringhistory me"));
        assert!(compiled.sql.contains("from measurementjsonhistory me"));
        assert_eq!(
            compiled
                .sql
                .matches("and me.timestamp >= :from::timestamptz and me.timestamp < :to::timestamptz")
                .count(),
            3
        );
        assert_eq!(compiled.params.get("to"), Some(&SqlValue::Timestamp(to)));
        assert_eq!(compiled.log_data["history_days"], Value::from(1));
    }

    #[test]
    fn provenance_is_joined_only_when_selected() {
        let catalog = catalog();
        let acl = AclRules::bundled();
        let with_provenance = FetchOptions {
            select: Some("mvalue,prname".into()),
            ..options("flat")
        };
        let compiled = DataFetcher::new(&catalog, &acl, &with_provenance)
            .measurements("*", "*", None)
            .unwrap();
        assert_eq!(
            compiled
                .sql
                .matches("left join provenance pr on me.provenance_id = pr.id")
                .count(),
            3
        );

        let plain = compile(None, "flat").unwrap();
        assert!(plain.sql.contains("provenance pr"));
        let without_provenance = FetchOptions {
            select: Some("mvalue".into()),
            ..options("flat")
        };
        let compiled = DataFetcher::new(&catalog, &acl, &without_provenance)
            .measurements("*", "*", None)
            .unwrap();
        assert!(!compiled.sql.contains("provenance pr"));
    }
}
