//! Resolves a projection and a filter against the allowed target-lists.

use super::{
    params::{Params, SqlValue},
    Catalog,
};
use crate::{
    error::{Result, ServiceError},
    filter::{self, parse_template, FilterNode, TemplatePart, ValueNode},
    schema::{Target, TargetDef, TargetDefList},
};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

/// An alias referenced from the `where` string, with the operator and value it was used with.
#[derive(Debug, Clone, PartialEq)]
pub struct WhereClauseTarget {
    pub alias: String,
    pub json_path: Option<String>,
    pub operator: String,
    pub value: ValueNode,
}

/// Compiled predicate plus the `:pwhere_N` values it references.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledWhere {
    pub sql: String,
    pub params: Params,
}

#[derive(Debug, Clone)]
pub struct Expansion {
    allowed: BTreeSet<String>,
    used_attributes: BTreeSet<String>,
    used_lists: BTreeSet<String>,
    fragments: BTreeMap<String, Vec<String>>,
    filter: Option<FilterNode>,
    compiled_where: Option<CompiledWhere>,
    where_targets: BTreeMap<String, Vec<WhereClauseTarget>>,
    distinct: bool,
}

impl Expansion {
    pub fn uses_attribute(&self, name: &str) -> bool {
        self.used_attributes.contains(name)
    }

    pub fn uses_list(&self, name: &str) -> bool {
        self.used_lists.contains(name)
    }

    pub fn used_attributes(&self) -> &BTreeSet<String> {
        &self.used_attributes
    }

    pub fn used_lists(&self) -> &BTreeSet<String> {
        &self.used_lists
    }

    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    /// Projection fragments keyed by target-list name.
    pub fn fragments(&self) -> &BTreeMap<String, Vec<String>> {
        &self.fragments
    }

    /// Projection of the given lists (all when empty), in list-name order.
    pub fn select_sql(&self, lists: &[&str]) -> String {
        self.fragments
            .iter()
            .filter(|(name, _)| lists.is_empty() || lists.contains(&name.as_str()))
            .flat_map(|(_, fragments)| fragments.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn compiled_where(&self) -> Option<&CompiledWhere> {
        self.compiled_where.as_ref()
    }

    pub fn where_targets(&self, alias: &str) -> &[WhereClauseTarget] {
        self.where_targets
            .get(alias)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn where_aliases(&self) -> impl Iterator<Item = &str> {
        self.where_targets.keys().map(String::as_str)
    }

    /// Recompiles the filter resolving ambiguous aliases through `preferred`.
    /// Parameter names and values are identical to the default compilation.
    pub fn compile_where_for(&self, catalog: &Catalog, preferred: &str) -> Result<Option<CompiledWhere>> {
        match &self.filter {
            Some(node) => WhereCompiler::new(catalog, &self.allowed, Some(preferred))
                .compile(node)
                .map(Some),
            None => Ok(None),
        }
    }
}

pub struct SelectExpander<'a> {
    catalog: &'a Catalog,
}

impl<'a> SelectExpander<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    pub fn expand(
        &self,
        select: Option<&str>,
        filter: Option<&str>,
        allowed: &[&str],
        distinct: bool,
    ) -> Result<Expansion> {
        let schema = &self.catalog.schema;
        let allowed: BTreeSet<String> = allowed.iter().map(|name| name.to_string()).collect();

        let mut requested: BTreeSet<Target> = select
            .unwrap_or_default()
            .split(',')
            .filter_map(Target::parse)
            .collect();
        if requested.is_empty() || requested.iter().any(|target| target.name() == "*") {
            requested = allowed
                .iter()
                .filter_map(|name| schema.get(name))
                .flat_map(TargetDefList::final_names)
                .map(Target::plain)
                .collect();
        }

        let mut expansion = Expansion {
            allowed: allowed.clone(),
            used_attributes: BTreeSet::new(),
            used_lists: BTreeSet::new(),
            fragments: BTreeMap::new(),
            filter: None,
            compiled_where: None,
            where_targets: BTreeMap::new(),
            distinct,
        };

        let mut seen: HashSet<Target> = requested.iter().cloned().collect();
        let mut queue: VecDeque<Target> = requested.into_iter().collect();

        while let Some(target) = queue.pop_front() {
            let lists = resolve(self.catalog, target.name(), &allowed)?;
            for list in lists {
                let Some(def) = list.find(target.name()) else {
                    continue;
                };

                if def.is_pointer() {
                    let children: Vec<&TargetDefList> = def
                        .children()
                        .iter()
                        .filter(|child| allowed.contains(*child))
                        .filter_map(|child| schema.get(child))
                        .collect();
                    for child in children {
                        for name in child.final_names() {
                            let next = Target::plain(name);
                            if seen.insert(next.clone()) {
                                queue.push_back(next);
                            }
                        }
                    }
                    continue;
                }

                expansion
                    .fragments
                    .entry(list.name().to_string())
                    .or_default()
                    .push(projection(def, &target));
                expansion.used_attributes.insert(def.final_name().to_string());
                expansion.used_lists.insert(list.name().to_string());
            }
        }

        if let Some(raw) = filter {
            if let Some(node) = filter::parse(raw, &self.catalog.operators)? {
                for clause in node.clauses() {
                    for list in resolve(self.catalog, &clause.alias, &allowed)? {
                        expansion.used_lists.insert(list.name().to_string());
                    }
                    expansion.used_attributes.insert(clause.alias.clone());
                    expansion
                        .where_targets
                        .entry(clause.alias.clone())
                        .or_default()
                        .push(WhereClauseTarget {
                            alias: clause.alias.clone(),
                            json_path: clause.json_path.clone(),
                            operator: clause.operator.clone(),
                            value: clause.value.clone(),
                        });
                }
                let compiled = WhereCompiler::new(self.catalog, &allowed, None).compile(&node)?;
                expansion.compiled_where = Some(compiled);
                expansion.filter = Some(node);
            }
        }

        Ok(expansion)
    }
}

fn resolve<'c>(
    catalog: &'c Catalog,
    attribute: &str,
    allowed: &'c BTreeSet<String>,
) -> Result<Vec<&'c TargetDefList>> {
    let lists = catalog.schema.find_all(attribute, Some(allowed));
    if !lists.is_empty() {
        return Ok(lists);
    }
    if catalog.schema.knows_attribute(attribute) {
        Err(ServiceError::AttributeNotReachable {
            attribute: attribute.to_string(),
            lists: allowed.iter().cloned().collect::<Vec<_>>().join(", "),
        })
    } else {
        Err(ServiceError::UnknownAttribute(attribute.to_string()))
    }
}

fn projection(def: &TargetDef, target: &Target) -> String {
    match (target.json_path(), target.json_path_sql()) {
        (Some(path), Some(sql_path)) => {
            let alias = format!("\"{}.{}\"", def.final_name(), path);
            if def.is_scalar_only() {
                format!("null::jsonb as {alias}")
            } else {
                let column = def.raw_column().unwrap_or("null");
                format!("{column}#>'{{{sql_path}}}' as {alias}")
            }
        }
        _ => def.select_fragment().unwrap_or_default(),
    }
}

struct WhereCompiler<'a> {
    catalog: &'a Catalog,
    allowed: &'a BTreeSet<String>,
    preferred: Option<&'a str>,
    params: Params,
}

impl<'a> WhereCompiler<'a> {
    fn new(catalog: &'a Catalog, allowed: &'a BTreeSet<String>, preferred: Option<&'a str>) -> Self {
        Self {
            catalog,
            allowed,
            preferred,
            params: Params::new(),
        }
    }

    fn compile(mut self, node: &FilterNode) -> Result<CompiledWhere> {
        let sql = self.node(node)?;
        Ok(CompiledWhere {
            sql,
            params: self.params,
        })
    }

    fn node(&mut self, node: &FilterNode) -> Result<String> {
        let catalog = self.catalog;
        let allowed = self.allowed;
        match node {
            FilterNode::And(children) => self.junction(children, " and "),
            FilterNode::Or(children) => self.junction(children, " or "),
            FilterNode::Clause(clause) => {
                let lists = resolve(catalog, &clause.alias, allowed)?;
                let list = self
                    .preferred
                    .and_then(|preferred| lists.iter().find(|list| list.name() == preferred))
                    .or_else(|| lists.first())
                    .copied();
                let column = list
                    .and_then(|list| list.find(&clause.alias))
                    .and_then(TargetDef::raw_column)
                    .ok_or_else(|| ServiceError::UnknownAttribute(clause.alias.clone()))?;

                let id = filter::operator_id(clause.json_path.is_some(), &clause.value, &clause.operator);
                let operator = catalog.operators.get(&id).ok_or_else(|| {
                    ServiceError::UnknownOperator {
                        operator: clause.operator.clone(),
                        operator_id: id.clone(),
                    }
                })?;
                if !operator.accepts(&clause.value) {
                    return Err(ServiceError::OperatorCheckFailed {
                        alias: clause.alias.clone(),
                        operator: clause.operator.clone(),
                        value: clause.value.to_string(),
                    });
                }

                let mut sql = String::from("(");
                for part in parse_template(&operator.template) {
                    match part {
                        TemplatePart::Text(text) => sql.push_str(&text),
                        TemplatePart::Column => sql.push_str(column),
                        TemplatePart::JsonPath => {
                            sql.push_str(&clause.json_path.as_deref().unwrap_or_default().replace('.', ","))
                        }
                        TemplatePart::Value(slice) => {
                            let value = match (&clause.value, slice) {
                                (ValueNode::Scalar(literal), _) => SqlValue::from(literal),
                                (ValueNode::List(items), None) => {
                                    SqlValue::List(items.iter().map(SqlValue::from).collect())
                                }
                                (ValueNode::List(items), Some(slice)) => SqlValue::List(
                                    items[slice.range(items.len())]
                                        .iter()
                                        .map(SqlValue::from)
                                        .collect(),
                                ),
                            };
                            sql.push_str(&self.bind(value));
                        }
                    }
                }
                sql.push(')');
                Ok(sql)
            }
        }
    }

    fn junction(&mut self, children: &[FilterNode], glue: &str) -> Result<String> {
        let parts = children
            .iter()
            .map(|child| self.node(child))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("({})", parts.join(glue)))
    }

    fn bind(&mut self, value: SqlValue) -> String {
        if value == SqlValue::Null {
            return "null".to_string();
        }
        let name = format!("pwhere_{}", self.params.len());
        let reference = format!(":{name}");
        self.params.insert(name, value);
        reference
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn catalog() -> Catalog {
        Catalog::standard().unwrap()
    }

    const STATION_LISTS: &[&str] = &["station", "parent"];

    #[test]
    fn projects_plain_and_json_targets() {
        let catalog = catalog();
        let expansion = SelectExpander::new(&catalog)
            .expand(Some("sname, smetadata.address.city"), None, STATION_LISTS, true)
            .unwrap();

        assert_eq!(
            expansion.select_sql(&[]),
            "m.json#>'{address,city}' as \"smetadata.address.city\", s.name as sname"
        );
        assert!(expansion.uses_attribute("smetadata"));
        assert!(expansion.uses_list("station"));
        assert!(!expansion.uses_list("parent"));
    }

    #[test]
    fn pointer_targets_expand_to_allowed_children() {
        let catalog = catalog();
        let expansion = SelectExpander::new(&catalog)
            .expand(Some("sparent,sdatatypes"), None, STATION_LISTS, true)
            .unwrap();
        assert!(expansion.uses_attribute("pname"));
        assert!(expansion.uses_list("parent"));
        // datatype is not allowed here, so sdatatypes contributes nothing
        assert!(!expansion.uses_list("datatype"));
        assert!(!expansion.select_sql(&[]).contains("t.cname"));
    }

    #[test]
    fn star_selects_every_allowed_attribute() {
        let catalog = catalog();
        let expansion = SelectExpander::new(&catalog)
            .expand(Some("*"), None, &["parent"], false)
            .unwrap();
        assert_eq!(expansion.used_attributes().len(), 8);
        let empty = SelectExpander::new(&catalog)
            .expand(Some(" , "), None, &["parent"], false)
            .unwrap();
        assert_eq!(empty.used_attributes(), expansion.used_attributes());
    }

    #[test]
    fn json_and_boolean_filter_compiles_to_parenthesised_predicates() {
        let catalog = catalog();
        let expansion = SelectExpander::new(&catalog)
            .expand(
                Some("sname"),
                Some(r#"and(smetadata.city.eq."BZ",sactive.eq.true)"#),
                STATION_LISTS,
                true,
            )
            .unwrap();
        let compiled = expansion.compiled_where().unwrap();
        assert_eq!(
            compiled.sql,
            "((m.json#>>'{city}' = :pwhere_0) and (s.active = :pwhere_1))"
        );
        assert_eq!(compiled.params.get("pwhere_0"), Some(&SqlValue::Text("BZ".into())));
        assert_eq!(compiled.params.get("pwhere_1"), Some(&SqlValue::Bool(true)));
        assert_eq!(expansion.where_targets("sactive").len(), 1);
    }

    #[test]
    fn null_values_become_sql_null() {
        let catalog = catalog();
        let expansion = SelectExpander::new(&catalog)
            .expand(None, Some("pname.neq.null"), STATION_LISTS, true)
            .unwrap();
        let compiled = expansion.compiled_where().unwrap();
        assert_eq!(compiled.sql, "(p.name is not null)");
        assert!(compiled.params.is_empty());
        assert!(expansion.uses_list("parent"));
    }

    #[test]
    fn bounding_box_requires_four_or_five_numbers() {
        let catalog = catalog();
        let expander = SelectExpander::new(&catalog);

        let err = expander
            .expand(None, Some("scoordinate.bbi.(11,46,12)"), STATION_LISTS, true)
            .unwrap_err();
        assert!(matches!(err, ServiceError::OperatorCheckFailed { .. }), "got: {err:?}");

        for filter in ["scoordinate.bbi.(11,46,12,47)", "scoordinate.bbc.(11,46,12,47,4326)"] {
            let expansion = expander.expand(None, Some(filter), STATION_LISTS, true).unwrap();
            let sql = &expansion.compiled_where().unwrap().sql;
            assert!(sql.contains("ST_MakeEnvelope(:pwhere_0)"), "got: {sql}");
        }
    }

    #[test]
    fn resolution_errors() {
        let catalog = catalog();
        let expander = SelectExpander::new(&catalog);

        let err = expander.expand(Some("nope"), None, STATION_LISTS, true).unwrap_err();
        assert!(matches!(err, ServiceError::UnknownAttribute(_)), "got: {err:?}");

        let err = expander.expand(Some("tname"), None, STATION_LISTS, true).unwrap_err();
        assert!(matches!(err, ServiceError::AttributeNotReachable { .. }), "got: {err:?}");

        let err = expander
            .expand(None, Some("sname.lt.'abc'"), STATION_LISTS, true)
            .unwrap_err();
        assert!(
            matches!(&err, ServiceError::UnknownOperator { operator_id, .. } if operator_id == "STRING/LT"),
            "got: {err:?}"
        );
    }

    #[test]
    fn filter_values_never_reach_sql_text() {
        let catalog = catalog();
        let expander = SelectExpander::new(&catalog);
        let benign = expander
            .expand(None, Some("sname.eq.'harmless'"), STATION_LISTS, true)
            .unwrap();
        let hostile = expander
            .expand(None, Some(r"sname.eq.'\'; DROP TABLE station --'"), STATION_LISTS, true)
            .unwrap();

        let benign = benign.compiled_where().unwrap();
        let hostile = hostile.compiled_where().unwrap();
        assert_eq!(benign.sql, hostile.sql);
        assert_eq!(
            hostile.params.get("pwhere_0"),
            Some(&SqlValue::Text("'; DROP TABLE station --".into()))
        );
    }

    #[test]
    fn ambiguous_alias_follows_preferred_list() {
        let catalog = catalog();
        let allowed = [
            "station",
            "datatype",
            "measurement",
            "measurementdouble",
            "measurementstring",
            "measurementjson",
        ];
        let expansion = SelectExpander::new(&catalog)
            .expand(Some("mvalue"), Some("mvalue.eq.'ok'"), &allowed, true)
            .unwrap();
        let for_string = expansion
            .compile_where_for(&catalog, "measurementstring")
            .unwrap()
            .unwrap();
        assert_eq!(for_string.sql, "(me.string_value = :pwhere_0)");
        assert_eq!(
            expansion.select_sql(&["measurementstring"]),
            "null::double precision as mvalue_double, me.string_value as mvalue_string, null::jsonb as mvalue_json"
        );
    }

    #[test]
    fn deterministic_output() {
        let catalog = catalog();
        let expander = SelectExpander::new(&catalog);
        let run = || {
            let expansion = expander
                .expand(Some("*"), Some("or(sname.re.a,scode.in.(x,y))"), STATION_LISTS, true)
                .unwrap();
            (
                expansion.select_sql(&[]),
                expansion.compiled_where().cloned(),
            )
        };
        assert_eq!(run(), run());
    }
}
