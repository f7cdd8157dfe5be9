use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rpc::Method;
use crate::types::MapNode;

/// One filter condition: a bare value means equality, a pair means
/// `[operator, value]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Condition(String, Value),
    Value(Value),
}

/// Field name to condition map, as sent with list queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filters(BTreeMap<String, FilterValue>);

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_string(), FilterValue::Value(value.into()));
        self
    }

    pub fn cond(mut self, field: &str, op: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_string(), FilterValue::Condition(op.to_string(), value.into()));
        self
    }

    pub fn get(&self, field: &str) -> Option<&FilterValue> {
        self.0.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FilterValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What a form asks for when it needs candidate values for a field: local
/// filters, optionally delegated to a named remote query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Method>,
    pub filters: Filters,
}

pub type QueryFn = fn(&MapNode) -> QuerySpec;

/// Candidate filters for `data_field`: leaves only, restricted to siblings
/// unless the record itself is a group.
pub fn data_field_query(doc: &MapNode) -> QuerySpec {
    let filters = if doc.is_group {
        Filters::new().eq("is_group", false)
    } else {
        Filters::new()
            .eq("parent_segment", doc.parent_segment.clone().unwrap_or_default())
            .eq("is_group", false)
    };
    QuerySpec { query: None, filters }
}

/// Candidate fields of the target doctype, minus layout breaks.
pub fn target_df_query(doc: &MapNode) -> QuerySpec {
    QuerySpec {
        query: Some(Method::DfList),
        filters: Filters::new()
            .eq("parent", doc.target_dt.clone().unwrap_or_default())
            .cond("fieldtype", "NOT LIKE", "%Break%"),
    }
}

/// Per-field query hooks for the integration map form.
#[derive(Debug, Clone, Default)]
pub struct FormQueries {
    queries: HashMap<String, QueryFn>,
}

impl FormQueries {
    pub fn integration_map() -> Self {
        let mut q = Self::default();
        q.set_query("data_field", data_field_query);
        q.set_query("target_df", target_df_query);
        q
    }

    pub fn set_query(&mut self, fieldname: &str, query: QueryFn) {
        self.queries.insert(fieldname.to_string(), query);
    }

    pub fn get_query(&self, fieldname: &str, doc: &MapNode) -> Option<QuerySpec> {
        self.queries.get(fieldname).map(|f| f(doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn group_data_field_only_excludes_groups() {
        let doc =
            MapNode { is_group: true, parent_segment: Some("api".into()), ..Default::default() };
        let spec = data_field_query(&doc);
        assert_eq!(serde_json::to_value(&spec.filters).unwrap(), json!({"is_group": false}));
        assert!(spec.filters.get("parent_segment").is_none());
        assert!(spec.query.is_none());
    }

    #[test]
    fn leaf_data_field_is_scoped_to_parent() {
        let doc = MapNode {
            is_group: false,
            parent_segment: Some("orders".into()),
            ..Default::default()
        };
        let spec = data_field_query(&doc);
        assert_eq!(
            serde_json::to_value(&spec.filters).unwrap(),
            json!({"parent_segment": "orders", "is_group": false})
        );
    }

    #[test]
    fn leaf_without_parent_filters_on_empty_value() {
        let spec = data_field_query(&MapNode::default());
        assert_eq!(spec.filters.get("parent_segment"), Some(&FilterValue::Value(json!(""))));
    }

    #[test]
    fn target_df_defaults_parent_to_empty() {
        let spec = target_df_query(&MapNode::default());
        assert_eq!(spec.query, Some(Method::DfList));
        assert_eq!(
            serde_json::to_value(&spec.filters).unwrap(),
            json!({"parent": "", "fieldtype": ["NOT LIKE", "%Break%"]})
        );
    }

    #[test]
    fn target_df_uses_target_doctype() {
        let doc = MapNode { target_dt: Some("Customer".into()), ..Default::default() };
        let spec = FormQueries::integration_map().get_query("target_df", &doc).unwrap();
        assert_eq!(spec.filters.get("parent"), Some(&FilterValue::Value(json!("Customer"))));
    }

    #[test]
    fn filters_round_trip_conditions() {
        let f: Filters =
            serde_json::from_value(json!({"fieldtype": ["NOT LIKE", "%Break%"], "reqd": 1}))
                .unwrap();
        assert_eq!(
            f.get("fieldtype"),
            Some(&FilterValue::Condition("NOT LIKE".into(), json!("%Break%")))
        );
        assert_eq!(f.get("reqd"), Some(&FilterValue::Value(json!(1))));
    }

    #[test]
    fn unknown_field_has_no_query() {
        let queries = FormQueries::integration_map();
        assert!(queries.get_query("segment_name", &MapNode::default()).is_none());
        assert!(queries.get_query("target_dt", &MapNode::default()).is_none());
    }
}
