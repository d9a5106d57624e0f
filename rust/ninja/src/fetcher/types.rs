use crate::representation::{Dataset, Representation, Shape};
use serde_json::{Map, Value};

/// Command name and SQL of the distinct type listing for `dataset`.
pub fn listing_sql(dataset: Dataset) -> (&'static str, &'static str) {
    match dataset {
        Dataset::Node => (
            "fetchStationTypes",
            "select distinct stationtype as id from station s where s.available = true order by 1",
        ),
        Dataset::Edge => (
            "fetchEdgeTypes",
            "select distinct s.stationtype as id from edge e join station s on e.edge_data_id = s.id \
             where s.available = true order by 1",
        ),
        Dataset::Event => (
            "fetchEventOrigins",
            "select distinct origin as id from event order by 1",
        ),
    }
}

/// One listing entry. `url` is the request's own base ending in `/`.
pub fn self_links(representation: Representation, url: &str, id: &str) -> Value {
    let links: Vec<(&str, String)> = match representation.dataset {
        Dataset::Node => vec![
            ("stations", format!("{url}{id}")),
            ("stations+datatypes", format!("{url}{id}/*")),
            ("stations+datatypes+measurements", format!("{url}{id}/*/latest")),
        ],
        Dataset::Edge => vec![("edges", format!("{url}{id}"))],
        Dataset::Event => vec![("events", format!("{url}{id}"))],
    };

    let mut row = Map::new();
    row.insert("id".into(), Value::String(id.to_string()));
    row.insert("description".into(), Value::Null);
    match representation.shape {
        Shape::Flat => {
            for (name, link) in links {
                row.insert(format!("self.{name}"), Value::String(link));
            }
        }
        Shape::Tree => {
            let nested: Map<String, Value> = links
                .into_iter()
                .map(|(name, link)| (name.to_string(), Value::String(link)))
                .collect();
            row.insert("self".into(), Value::Object(nested));
        }
    }
    Value::Object(row)
}
