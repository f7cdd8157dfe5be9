use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::MigrateError;

/// A position in the integration map tree: a URL path segment (group) or an
/// API field name (leaf).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapNode {
    #[serde(default)]
    pub name: String,
    pub segment_name: String,
    #[serde(default)]
    pub parent_segment: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    /// Leaf whose fetched values expand this segment into several urls, or
    /// which supplies a referenced value during import.
    #[serde(default)]
    pub data_field: Option<String>,
    #[serde(default)]
    pub target_dt: Option<String>,
    /// Doc field name (`<doctype>-<fieldname>`) the leaf maps onto.
    #[serde(default)]
    pub target_df: Option<String>,
    #[serde(default)]
    pub convert_method: Option<String>,
    #[serde(default)]
    pub keep_existing: bool,
}

impl MapNode {
    pub fn new(segment_name: &str, parent: Option<&str>, is_group: bool) -> Self {
        let segment_name = clean_segment(segment_name);
        let parent_segment = parent.filter(|p| !p.is_empty()).map(str::to_string);
        Self {
            name: node_name(parent_segment.as_deref(), &segment_name),
            segment_name,
            parent_segment,
            is_group,
            ..Default::default()
        }
    }

    /// Normalise fields before persisting.
    pub fn before_save(&mut self) {
        self.segment_name = clean_segment(&self.segment_name);
        if self.parent_segment.as_deref() == Some("") {
            self.parent_segment = None;
        }
        let blank = |v: &Option<String>| v.as_deref().map_or(true, str::is_empty);
        if blank(&self.target_dt) || blank(&self.target_df) {
            self.target_dt = None;
            self.target_df = None;
        }
        for opt in [&mut self.data_field, &mut self.convert_method] {
            if opt.as_deref() == Some("") {
                *opt = None;
            }
        }
    }

    /// `segment_name` split at its last `.` into (source key, source field).
    pub fn source_path(&self) -> (&str, &str) {
        split_source(&self.segment_name)
    }
}

/// Strip `{`, `}`, `\` and `/` from both ends of a segment.
pub fn clean_segment(segment: &str) -> String {
    segment
        .trim()
        .trim_matches(|c| matches!(c, '{' | '}' | '\\' | '/'))
        .to_string()
}

pub fn node_name(parent: Option<&str>, segment_name: &str) -> String {
    match parent {
        Some(p) if !p.is_empty() => format!("{}/{}", p, segment_name),
        _ => segment_name.to_string(),
    }
}

pub fn split_source(path: &str) -> (&str, &str) {
    match path.rsplit_once('.') {
        Some((key, field)) => (key, field),
        None => ("", path),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamType {
    #[serde(rename = "URL Query")]
    UrlQuery,
    #[serde(rename = "Header")]
    Header,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::UrlQuery => "URL Query",
            ParamType::Header => "Header",
        }
    }
}

impl FromStr for ParamType {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "url query" | "query" => Ok(ParamType::UrlQuery),
            "header" => Ok(ParamType::Header),
            other => Err(MigrateError::validation(format!("unknown parameter type `{}`", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapParam {
    pub param_type: ParamType,
    pub key: String,
    pub value: String,
}

/// Row returned to the tree widget when listing children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNodeRow {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expandable: Option<bool>,
}

/// Target schema: a document type and its fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocType {
    pub name: String,
    /// Child table rows are only stored attached to a parent document.
    #[serde(default)]
    pub istable: bool,
    /// `field:<fieldname>` names documents by a field value; anything else
    /// generates a random name.
    #[serde(default)]
    pub autoname: Option<String>,
    #[serde(default)]
    pub fields: Vec<DocField>,
}

impl DocType {
    pub fn field(&self, fieldname: &str) -> Option<&DocField> {
        self.fields.iter().find(|f| f.fieldname == fieldname)
    }

    /// Table field on this doctype that holds rows of `child_doctype`.
    pub fn parentfield_of(&self, child_doctype: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.fieldtype == "Table" && f.options.as_deref() == Some(child_doctype))
            .map(|f| f.fieldname.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocField {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parent: String,
    pub fieldname: String,
    #[serde(default)]
    pub label: Option<String>,
    pub fieldtype: String,
    #[serde(default)]
    pub options: Option<String>,
    #[serde(default)]
    pub reqd: bool,
}

pub fn docfield_name(doctype: &str, fieldname: &str) -> String {
    format!("{}-{}", doctype, fieldname)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocFieldRow {
    pub name: String,
    pub label: Option<String>,
    pub fieldtype: String,
}

/// Schema file layout: `[[doctype]]` tables with nested `[[doctype.fields]]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaFile {
    #[serde(default)]
    pub doctype: Vec<DocType>,
}

/// A persisted target document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub doctype: String,
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub parenttype: Option<String>,
    #[serde(default)]
    pub parentfield: Option<String>,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Indicator {
    Green,
    Red,
}

/// A user-visible notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub title: String,
    pub indicator: Indicator,
    pub message: String,
}

impl Notice {
    pub fn green(title: &str, message: impl Into<String>) -> Self {
        Self { title: title.to_string(), indicator: Indicator::Green, message: message.into() }
    }

    pub fn red(title: &str, message: impl Into<String>) -> Self {
        Self { title: title.to_string(), indicator: Indicator::Red, message: message.into() }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.title, self.message)
    }
}

/// Progress of a running import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportProgress {
    pub percent: f64,
    pub doctype: Option<String>,
    pub docname: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub records: usize,
    pub documents: usize,
    pub messages: Vec<Notice>,
}

/// Exported map definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    pub nodes: Vec<FixtureNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureNode {
    #[serde(flatten)]
    pub node: MapNode,
    #[serde(default)]
    pub params: Vec<MapParam>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_is_trimmed_of_slashes_and_braces() {
        assert_eq!(clean_segment("/users/"), "users");
        assert_eq!(clean_segment("{id}"), "id");
        assert_eq!(clean_segment("https://api.example.com/"), "https://api.example.com");
        assert_eq!(clean_segment("\\v1"), "v1");
    }

    #[test]
    fn names_follow_the_path() {
        let root = MapNode::new("https://api.example.com/", None, true);
        assert_eq!(root.name, "https://api.example.com");
        let leaf = MapNode::new("address.city", Some(&root.name), false);
        assert_eq!(leaf.name, "https://api.example.com/address.city");
        assert_eq!(leaf.source_path(), ("address", "city"));
    }

    #[test]
    fn targets_are_cleared_together() {
        let mut n = MapNode::new("email", Some("users"), false);
        n.target_dt = Some("Customer".into());
        n.before_save();
        assert_eq!(n.target_dt, None);
        assert_eq!(n.target_df, None);
    }

    #[test]
    fn parentfield_lookup_matches_table_options() {
        let dt = DocType {
            name: "Customer".into(),
            fields: vec![
                DocField {
                    fieldname: "addresses".into(),
                    fieldtype: "Table".into(),
                    options: Some("Address".into()),
                    ..Default::default()
                },
                DocField {
                    fieldname: "email".into(),
                    fieldtype: "Data".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(dt.parentfield_of("Address"), Some("addresses"));
        assert_eq!(dt.parentfield_of("Contact"), None);
    }
}
