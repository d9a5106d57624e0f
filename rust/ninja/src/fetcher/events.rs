use super::{csv_log, stations::timestamp_log, CompiledQuery, DataFetcher, TreePlan};
use crate::{
    error::Result,
    fetcher::acl::AclClass,
    query::{parse_csv, QueryBuilder, SqlValue},
    representation::Dataset,
};
use chrono::{DateTime, Utc};
use serde_json::Map;
use std::time::Instant;

/// Which events of the selected origins are returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventWindow {
    All,
    /// Most recent event per origin and series.
    Latest,
    /// Events whose interval reaches past `from`.
    From(DateTime<Utc>),
    /// Events whose interval overlaps `[from, to]`.
    Between(DateTime<Utc>, DateTime<Utc>),
}

impl EventWindow {
    fn bounds(self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        match self {
            EventWindow::All | EventWindow::Latest => (None, None),
            EventWindow::From(from) => (Some(from), None),
            EventWindow::Between(from, to) => (Some(from), Some(to)),
        }
    }
}

impl DataFetcher<'_> {
    pub fn events(&self, origins: &str, window: EventWindow) -> Result<CompiledQuery> {
        self.require("fetchEvents", Dataset::Event)?;
        let started = Instant::now();
        let origins = parse_csv(origins);
        let tree = self.is_tree();
        let latest = window == EventWindow::Latest;
        let (from, to) = window.bounds();

        let expansion = self.expand(&["event", "location", "provenanceevent"])?;
        let with_location = expansion.uses_list("location");
        let acl = self.acl_clause(AclClass::Events)?;

        let mut tree_keys = String::from(
            "ev.origin as _eventorigin, ev.event_series_uuid as _eventseriesuuid, ev.uuid as _eventuuid",
        );
        let mut order = String::from("order by _eventorigin, _eventseriesuuid, _eventuuid");
        if with_location {
            tree_keys.push_str(", ev.location_id::text as _locationid");
            order.push_str(", _locationid");
        }

        let mut qb = QueryBuilder::new(self.catalog, &expansion);
        qb.add_sql_if(
            "with latest as (select e.id, row_number() over(partition by e.origin, e.event_series_uuid \
             order by e.event_interval desc) as rank from event e)",
            latest,
        )
        .add_select()
        .add_sql_if(&tree_keys, tree)
        .expand_select_prefix(",", tree, &[])
        .add_sql("from event ev")
        .add_sql_if("join latest lat on lat.id = ev.id", latest)
        .add_sql_if_definition("left join provenance pr on ev.provenance_id = pr.id", "provenanceevent")
        .add_sql_if_definition("left join location loc on ev.location_id = loc.id", "location")
        .add_sql_if_alias("left join metadata evm on evm.id = ev.meta_data_id", "evmetadata")
        .add_sql("where true");
        if let Some(clause) = &acl {
            qb.add_sql(&format!("and {clause}"));
        }
        qb.add_sql_if("and lat.rank = 1", latest)
            .set_parameter_if_not_null(
                "from",
                from.map(SqlValue::Timestamp),
                "and (upper(ev.event_interval) is null or upper(ev.event_interval) > :from::timestamp)",
            )
            .set_parameter_if_not_null(
                "to",
                to.map(SqlValue::Timestamp),
                "and lower(ev.event_interval) <= :to::timestamp",
            )
            .set_parameter_if_not_empty(
                "origins",
                origins.as_deref().unwrap_or_default(),
                "and ev.origin in (:origins)",
            );
        qb.expand_where(None)?.add_sql_if(&order, tree);
        self.paginate(&mut qb);

        let mut log = Map::new();
        log.insert("origins".into(), csv_log(origins.as_deref()));
        if from.is_some() || to.is_some() {
            log.insert("history_from".into(), timestamp_log(from));
            log.insert("history_to".into(), timestamp_log(to));
        }
        Ok(self.compile("fetchEvents", qb, TreePlan::new("eventorigin", &[]), started, log))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{catalog, options};
    use super::*;
    use crate::fetcher::{acl::AclRules, FetchOptions};
    use pretty_assertions::assert_eq;

    #[test]
    fn latest_events_rank_each_series() {
        let catalog = catalog();
        let acl = AclRules::bundled();
        let options = FetchOptions {
            select: Some("evname".into()),
            ..options("tree,event")
        };
        let compiled = DataFetcher::new(&catalog, &acl, &options)
            .events("A22", EventWindow::Latest)
            .unwrap();

        assert!(compiled.sql.starts_with("with latest as (select e.id, row_number() over("));
        assert!(compiled.sql.contains("join latest lat on lat.id = ev.id"));
        assert!(compiled.sql.contains(
            "where true and ((ev.origin is null or ev.origin not like 'CLOSED/%')) and lat.rank = 1 and ev.origin in (:origins)"
        ));
        assert!(compiled.sql.contains("order by _eventorigin, _eventseriesuuid, _eventuuid limit"));
        assert_eq!(compiled.tree.entry, "eventorigin");
    }

    #[test]
    fn interval_bounds_and_location_ordering() {
        let catalog = catalog();
        let acl = AclRules::bundled();
        let options = FetchOptions {
            select: Some("evname,evldescription".into()),
            roles: vec!["ADMIN".into()],
            ..options("tree,event")
        };
        let from = "2024-05-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let to = "2024-05-31T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let compiled = DataFetcher::new(&catalog, &acl, &options)
            .events("*", EventWindow::Between(from, to))
            .unwrap();

        assert!(compiled.sql.contains(
            "ev.uuid as _eventuuid, ev.location_id::text as _locationid, "
        ), "{}", compiled.sql);
        assert!(compiled.sql.contains("left join location loc on ev.location_id = loc.id"));
        assert!(compiled.sql.contains(
            "where true and (upper(ev.event_interval) is null or upper(ev.event_interval) > :from::timestamp) \
             and lower(ev.event_interval) <= :to::timestamp"
        ));
        assert!(compiled.sql.contains("_eventuuid, _locationid limit"), "{}", compiled.sql);
        assert_eq!(compiled.params.get("from"), Some(&SqlValue::Timestamp(from)));
        assert!(!compiled.params.contains_key("origins"));
    }

    #[test]
    fn flat_events_from_a_start_time() {
        let catalog = catalog();
        let acl = AclRules::bundled();
        let options = options("flat,event");
        let from = "2024-05-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let compiled = DataFetcher::new(&catalog, &acl, &options)
            .events("*", EventWindow::From(from))
            .unwrap();
        assert!(compiled.sql.contains(":from::timestamp"));
        assert!(!compiled.sql.contains(":to"));
        assert!(!compiled.sql.contains("order by"));
    }
}
