use super::{LookUp, LookUpType, Schema, TargetDef, TargetDefList};
use anyhow::Result;

const UTC_TIMESTAMP: &str = "timezone('UTC', %s)";
const GEOJSON: &str = "st_asgeojson(%s, 9, 3)::jsonb";

fn col(name: &str, column: &str) -> Result<TargetDef> {
    TargetDef::column(name, column)
}

fn list(name: &str, lookup: LookUp, targets: Vec<TargetDef>) -> Result<TargetDefList> {
    targets
        .into_iter()
        .try_fold(TargetDefList::new(name, lookup)?, TargetDefList::add)
}

/// The attribute catalogue exposed by the API.
pub fn api_schema() -> Result<Schema> {
    let measurement = list(
        "measurement",
        LookUp::list("datatype", "tmeasurements"),
        vec![
            col("mvalidtime", "me.timestamp")?.with_column_format(UTC_TIMESTAMP)?,
            col("mtransactiontime", "me.created_on")?.with_column_format(UTC_TIMESTAMP)?,
            col("mperiod", "me.period")?,
            TargetDef::pointer("mprovenance", ["provenance"])?,
        ],
    )?;

    // The three value tables are stitched with UNION ALL, so each projects all
    // three value columns under the same labels and in the same order. Rows fold
    // them back into `mvalue`.
    let measurement_double = list(
        "measurementdouble",
        LookUp::merge("measurement", "mvalue"),
        vec![col("mvalue_double", "me.double_value")?
            .with_select_format(
                "%s, null::character varying as mvalue_string, null::jsonb as mvalue_json",
            )?
            .with_alias("mvalue")?
            .with_projected_name("mvalue_double")?
            .scalar_only()],
    )?;

    let measurement_string = list(
        "measurementstring",
        LookUp::merge("measurement", "mvalue"),
        vec![col("mvalue_string", "me.string_value")?
            .with_select_format(
                "null::double precision as mvalue_double, %s, null::jsonb as mvalue_json",
            )?
            .with_alias("mvalue")?
            .with_projected_name("mvalue_string")?
            .scalar_only()],
    )?;

    let measurement_json = list(
        "measurementjson",
        LookUp::merge("measurement", "mvalue"),
        vec![col("mvalue_json", "me.json_value")?
            .with_select_format(
                "null::double precision as mvalue_double, null::character varying as mvalue_string, %s",
            )?
            .with_alias("mvalue")?
            .with_projected_name("mvalue_json")?],
    )?;

    let provenance = list(
        "provenance",
        LookUp::inline("measurement", "mprovenance"),
        vec![
            col("prname", "pr.data_collector")?,
            col("prversion", "pr.data_collector_version")?,
            col("prlineage", "pr.lineage")?,
        ],
    )?;

    let datatype = list(
        "datatype",
        LookUp::map(Some("station"), Some("sdatatypes"), "_datatypename"),
        vec![
            col("tname", "t.cname")?,
            col("tunit", "t.cunit")?,
            col("ttype", "t.rtype")?,
            col("tdescription", "t.description")?,
            col("tmetadata", "tm.json")?,
            TargetDef::pointer(
                "tmeasurements",
                [
                    "measurement",
                    "measurementdouble",
                    "measurementstring",
                    "measurementjson",
                ],
            )?,
        ],
    )?;

    let parent = list(
        "parent",
        LookUp::inline("station", "sparent"),
        vec![
            col("pname", "p.name")?,
            col("ptype", "p.stationtype")?,
            col("pcode", "p.stationcode")?,
            col("porigin", "p.origin")?,
            col("pactive", "p.active")?,
            col("pavailable", "p.available")?,
            col("pcoordinate", "p.pointprojection")?,
            col("pmetadata", "pm.json")?,
        ],
    )?;

    let metadata_history = list(
        "metadatahistory",
        LookUp::list("station", "smetadatahistory"),
        vec![
            col("mhtransactiontime", "mh.created_on")?.with_column_format(UTC_TIMESTAMP)?,
            col("mhmetadata", "mh.json")?,
        ],
    )?;

    let station = list(
        "station",
        LookUp::map(Some("stationtype"), Some("stations"), "_stationcode"),
        vec![
            col("sname", "s.name")?,
            col("stype", "s.stationtype")?,
            col("scode", "s.stationcode")?,
            col("sorigin", "s.origin")?,
            col("sactive", "s.active")?,
            col("savailable", "s.available")?,
            col("scoordinate", "s.pointprojection")?,
            col("smetadata", "m.json")?,
            TargetDef::pointer("sparent", ["parent"])?,
            TargetDef::pointer("sdatatypes", ["datatype"])?,
            TargetDef::pointer("smetadatahistory", ["metadatahistory"])?,
        ],
    )?;

    let station_begin = list(
        "stationbegin",
        LookUp::inline("edge", "ebegin"),
        vec![
            col("sbname", "o.name")?,
            col("sbtype", "o.stationtype")?,
            col("sbcode", "o.stationcode")?,
            col("sborigin", "o.origin")?,
            col("sbactive", "o.active")?,
            col("sbavailable", "o.available")?,
            col("sbcoordinate", "o.pointprojection")?,
        ],
    )?;

    let station_end = list(
        "stationend",
        LookUp::inline("edge", "eend"),
        vec![
            col("sename", "d.name")?,
            col("setype", "d.stationtype")?,
            col("secode", "d.stationcode")?,
            col("seorigin", "d.origin")?,
            col("seactive", "d.active")?,
            col("seavailable", "d.available")?,
            col("secoordinate", "d.pointprojection")?,
        ],
    )?;

    let edge = list(
        "edge",
        LookUp::map(Some("edgetype"), Some("edges"), "_edgecode"),
        vec![
            col("ename", "i.name")?,
            col("etype", "i.stationtype")?,
            col("ecode", "i.stationcode")?,
            col("eorigin", "i.origin")?,
            col("eactive", "i.active")?,
            col("eavailable", "i.available")?,
            col("edirected", "e.directed")?,
            // 9 decimal digits, bounding box plus short CRS
            col("egeometry", "st_transform(e.linegeometry, 4326)")?.with_column_format(GEOJSON)?,
            TargetDef::pointer("ebegin", ["stationbegin"])?,
            TargetDef::pointer("eend", ["stationend"])?,
        ],
    )?;

    let stationtype = list(
        "stationtype",
        LookUp::map(None, None, "_stationtype"),
        vec![TargetDef::pointer("stations", ["station"])?],
    )?;

    let edgetype = list(
        "edgetype",
        LookUp::map(None, None, "_edgetype"),
        vec![TargetDef::pointer("edges", ["edge"])?],
    )?;

    let location = list(
        "location",
        LookUp::new(
            LookUpType::Inline,
            Some("event"),
            Some("evlocation"),
            Some("_locationid"),
        ),
        vec![
            col("evldescription", "loc.description")?,
            col("evlgeometry", "st_transform(loc.geometry, 4326)")?.with_column_format(GEOJSON)?,
        ],
    )?;

    let provenance_event = list(
        "provenanceevent",
        LookUp::inline("event", "evprovenance"),
        vec![
            col("prname", "pr.data_collector")?,
            col("prversion", "pr.data_collector_version")?,
            col("prlineage", "pr.lineage")?,
        ],
    )?;

    let event = list(
        "event",
        LookUp::map(Some("eventseries"), Some("events"), "_eventuuid"),
        vec![
            col("evcategory", "ev.category")?,
            col("evseriesuuid", "ev.event_series_uuid")?,
            col("evtransactiontime", "ev.created_on")?,
            col("evdescription", "ev.description")?,
            col("evstart", "lower(ev.event_interval)")?,
            col("evend", "upper(ev.event_interval)")?,
            col("evorigin", "ev.origin")?,
            col("evuuid", "ev.uuid")?,
            col("evname", "ev.name")?,
            col("evmetadata", "evm.json")?,
            TargetDef::pointer("evlocation", ["location"])?,
            TargetDef::pointer("evprovenance", ["provenanceevent"])?,
        ],
    )?;

    let eventseries = list(
        "eventseries",
        LookUp::map(Some("eventorigin"), Some("eventseries"), "_eventseriesuuid"),
        vec![TargetDef::pointer("events", ["event"])?],
    )?;

    let eventorigin = list(
        "eventorigin",
        LookUp::map(None, None, "_eventorigin"),
        vec![TargetDef::pointer("eventseries", ["eventseries"])?],
    )?;

    Schema::builder()
        .add(measurement)
        .add(measurement_double)
        .add(measurement_string)
        .add(measurement_json)
        .add(provenance)
        .add(datatype)
        .add(parent)
        .add(metadata_history)
        .add(station)
        .add(station_begin)
        .add(station_end)
        .add(edge)
        .add(stationtype)
        .add(edgetype)
        .add(location)
        .add(provenance_event)
        .add(event)
        .add(eventseries)
        .add(eventorigin)
        .build()
}
