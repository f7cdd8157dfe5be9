use std::collections::HashSet;
use std::str::FromStr;

use anyhow::Result;
use serde_json::{Map, Number, Value};

use crate::error::MigrateError;
use crate::types::{split_source, DocField, MapNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrMethod {
    Lower,
    Upper,
    Strip,
    Lstrip,
    Rstrip,
    Title,
    Capitalize,
}

/// A named conversion applied to a source value before it is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Converter {
    Method(StrMethod),
    Int,
    Float,
    Str,
    Bool,
    Len,
    Abs,
    Round,
    JsonDumps,
}

impl FromStr for Converter {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(method) = s.strip_prefix('.') {
            let method = method.strip_suffix("()").unwrap_or(method);
            let m = match method {
                "lower" => StrMethod::Lower,
                "upper" => StrMethod::Upper,
                "strip" => StrMethod::Strip,
                "lstrip" => StrMethod::Lstrip,
                "rstrip" => StrMethod::Rstrip,
                "title" => StrMethod::Title,
                "capitalize" => StrMethod::Capitalize,
                _ => return Err(unknown(s)),
            };
            return Ok(Converter::Method(m));
        }
        Ok(match s {
            "int" => Converter::Int,
            "float" => Converter::Float,
            "str" => Converter::Str,
            "bool" => Converter::Bool,
            "len" => Converter::Len,
            "abs" => Converter::Abs,
            "round" => Converter::Round,
            "json.dumps" => Converter::JsonDumps,
            _ => return Err(unknown(s)),
        })
    }
}

fn unknown(s: &str) -> MigrateError {
    MigrateError::validation(format!("Unknown conversion method: {}", s))
}

impl Converter {
    pub fn apply(&self, src: &Value) -> Result<Value, MigrateError> {
        match self {
            Converter::Method(m) => match src {
                Value::String(s) => Ok(Value::String(apply_method(*m, s))),
                other => {
                    Err(MigrateError::validation(format!("{:?} needs a string, got {}", m, other)))
                }
            },
            Converter::Int => to_int(src).map(Value::from),
            Converter::Float => to_float(src).and_then(float_value),
            Converter::Str => Ok(Value::String(to_text(src))),
            Converter::Bool => Ok(Value::Bool(truthy(src))),
            Converter::Len => match src {
                Value::String(s) => Ok(Value::from(s.chars().count())),
                Value::Array(a) => Ok(Value::from(a.len())),
                Value::Object(o) => Ok(Value::from(o.len())),
                other => Err(MigrateError::validation(format!("len() of {} is undefined", other))),
            },
            Converter::Abs => match src {
                Value::Number(n) if n.is_i64() => {
                    Ok(Value::from(n.as_i64().unwrap_or_default().unsigned_abs()))
                }
                Value::Number(n) if n.is_u64() => Ok(src.clone()),
                Value::Number(n) => float_value(n.as_f64().unwrap_or_default().abs()),
                other => Err(MigrateError::validation(format!("abs() of {} is undefined", other))),
            },
            Converter::Round => match src {
                Value::Number(n) if n.is_f64() => {
                    Ok(Value::from(n.as_f64().unwrap_or_default().round_ties_even() as i64))
                }
                Value::Number(_) => Ok(src.clone()),
                other => {
                    Err(MigrateError::validation(format!("round() of {} is undefined", other)))
                }
            },
            Converter::JsonDumps => Ok(Value::String(src.to_string())),
        }
    }
}

fn apply_method(m: StrMethod, s: &str) -> String {
    match m {
        StrMethod::Lower => s.to_lowercase(),
        StrMethod::Upper => s.to_uppercase(),
        StrMethod::Strip => s.trim().to_string(),
        StrMethod::Lstrip => s.trim_start().to_string(),
        StrMethod::Rstrip => s.trim_end().to_string(),
        StrMethod::Title => {
            let mut out = String::with_capacity(s.len());
            let mut prev_alpha = false;
            for c in s.chars() {
                if prev_alpha {
                    out.extend(c.to_lowercase());
                } else {
                    out.extend(c.to_uppercase());
                }
                prev_alpha = c.is_alphabetic();
            }
            out
        }
        StrMethod::Capitalize => {
            let mut chars = s.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect()
                }
                None => String::new(),
            }
        }
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn to_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn to_int(v: &Value) -> Result<i64, MigrateError> {
    match v {
        Value::Bool(b) => Ok(*b as i64),
        Value::Number(n) => {
            Ok(n.as_i64().unwrap_or_else(|| n.as_f64().unwrap_or_default().trunc() as i64))
        }
        Value::String(s) => {
            let t = s.trim();
            t.parse::<i64>()
                .or_else(|_| t.parse::<f64>().map(|f| f.trunc() as i64))
                .map_err(|_| {
                    MigrateError::validation(format!("invalid literal for int(): '{}'", s))
                })
        }
        other => Err(MigrateError::validation(format!("cannot convert {} to int", other))),
    }
}

fn to_float(v: &Value) -> Result<f64, MigrateError> {
    match v {
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => Ok(n.as_f64().unwrap_or_default()),
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| {
            MigrateError::validation(format!("could not convert string to float: '{}'", s))
        }),
        other => Err(MigrateError::validation(format!("cannot convert {} to float", other))),
    }
}

fn float_value(f: f64) -> Result<Value, MigrateError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| MigrateError::validation(format!("{} is not a finite number", f)))
}

/// Cast a source value to what a field of `fieldtype` stores.
pub fn default_conversion(src: &Value, fieldtype: &str) -> Result<Value, MigrateError> {
    let src = match src {
        Value::Array(items) => {
            Value::String(items.iter().map(to_text).collect::<Vec<_>>().join("\n"))
        }
        Value::Object(_) => Value::String(src.to_string()),
        other => other.clone(),
    };
    match fieldtype {
        "Check" => Ok(Value::from(truthy(&src) as i64)),
        "Currency" | "Float" | "Percent" => match &src {
            Value::String(s) if s.trim().is_empty() => Ok(Value::String(String::new())),
            _ => to_float(&src).and_then(float_value),
        },
        "Int" | "Rating" => match &src {
            Value::String(s) if s.trim().is_empty() => Ok(Value::String(String::new())),
            _ => to_int(&src).map(Value::from),
        },
        "Fold" | "Geolocation" | "Password" | "Signature" => {
            Err(MigrateError::validation(format!("{} not supported", fieldtype)))
        }
        _ => Ok(Value::String(to_text(&src))),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetField {
    pub doctype: String,
    pub fieldname: String,
    pub fieldtype: String,
}

/// How one API field lands in a target document.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMapping {
    /// Key of the nested record holding the field; empty for the top record.
    pub source_key: String,
    pub source_df: String,
    pub target: Option<TargetField>,
    pub converter: Option<Converter>,
    /// `(source key, field)` of the referenced data field.
    pub reference: Option<(String, String)>,
}

impl FieldMapping {
    pub fn from_node(
        node: &MapNode,
        docfield: Option<&DocField>,
        reference_segment: Option<&str>,
    ) -> Result<Self> {
        let (source_key, source_df) = node.source_path();
        let target = match (&node.target_dt, docfield) {
            (Some(dt), Some(df)) => Some(TargetField {
                doctype: dt.clone(),
                fieldname: df.fieldname.clone(),
                fieldtype: df.fieldtype.clone(),
            }),
            _ => None,
        };
        let converter = node.convert_method.as_deref().map(str::parse::<Converter>).transpose()?;
        let reference = reference_segment.map(|seg| {
            let (k, f) = split_source(seg);
            (k.to_string(), f.to_string())
        });
        Ok(Self {
            source_key: source_key.to_string(),
            source_df: source_df.to_string(),
            target,
            converter,
            reference,
        })
    }

    fn convert(&self, src: &Value, fieldtype: &str) -> Result<Value, MigrateError> {
        match &self.converter {
            Some(c) => c.apply(src),
            None => default_conversion(src, fieldtype),
        }
    }
}

fn subrecords<'r>(record: &'r Value, key: &str) -> Vec<&'r Value> {
    if key.is_empty() {
        return vec![record];
    }
    match record.get(key) {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(obj @ Value::Object(_)) => vec![obj],
        _ => Vec::new(),
    }
}

fn distinct<'m>(items: impl Iterator<Item = &'m str>) -> Vec<&'m str> {
    let mut seen = HashSet::new();
    items.filter(|i| seen.insert(*i)).collect()
}

/// Target documents for one fetched record: one per doctype and nested
/// record that yields at least one value.
pub fn build_documents(
    record: &Value,
    mappings: &[FieldMapping],
) -> Result<Vec<Map<String, Value>>> {
    let doctypes =
        distinct(mappings.iter().filter_map(|m| m.target.as_ref()).map(|t| t.doctype.as_str()));
    let source_keys = distinct(mappings.iter().map(|m| m.source_key.as_str()));

    let mut docs = Vec::new();
    for dt in &doctypes {
        for skey in &source_keys {
            for sub in subrecords(record, skey) {
                let mut doc = Map::new();
                for m in mappings {
                    let Some(target) = m.target.as_ref().filter(|t| t.doctype == *dt) else {
                        continue;
                    };
                    if m.source_key != *skey {
                        continue;
                    }
                    let src = if let Some(v) = sub.get(&m.source_df) {
                        v
                    } else {
                        match &m.reference {
                            Some((rkey, rdf)) if rkey.is_empty() => match record.get(rdf) {
                                Some(v) => v,
                                None => continue,
                            },
                            Some((rkey, rdf)) if rkey.as_str() == *skey => match sub.get(rdf) {
                                Some(v) => v,
                                None => continue,
                            },
                            _ => continue,
                        }
                    };
                    if src.is_null() {
                        continue;
                    }
                    let val = m.convert(src, &target.fieldtype)?;
                    if val.as_str() == Some("") || val.is_null() {
                        continue;
                    }
                    doc.insert(target.fieldname.clone(), val);
                    doc.insert("doctype".to_string(), Value::String(dt.to_string()));
                }
                if !doc.is_empty() {
                    docs.push(doc);
                }
            }
        }
    }
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping(segment: &str, dt: &str, field: &str, fieldtype: &str) -> FieldMapping {
        let (k, f) = split_source(segment);
        FieldMapping {
            source_key: k.into(),
            source_df: f.into(),
            target: Some(TargetField {
                doctype: dt.into(),
                fieldname: field.into(),
                fieldtype: fieldtype.into(),
            }),
            converter: None,
            reference: None,
        }
    }

    #[test]
    fn default_conversions_follow_fieldtype() {
        assert_eq!(default_conversion(&json!(["a", "b"]), "Small Text").unwrap(), json!("a\nb"));
        assert_eq!(default_conversion(&json!({"a": 1}), "Code").unwrap(), json!("{\"a\":1}"));
        assert_eq!(default_conversion(&json!("yes"), "Check").unwrap(), json!(1));
        assert_eq!(default_conversion(&json!(0), "Check").unwrap(), json!(0));
        assert_eq!(default_conversion(&json!("2.5"), "Currency").unwrap(), json!(2.5));
        assert_eq!(default_conversion(&json!("7"), "Int").unwrap(), json!(7));
        assert_eq!(default_conversion(&json!(3.9), "Rating").unwrap(), json!(3));
        assert_eq!(default_conversion(&json!(42), "Data").unwrap(), json!("42"));
        assert_eq!(default_conversion(&json!("01:30:00"), "Duration").unwrap(), json!("01:30:00"));
        assert_eq!(default_conversion(&json!(""), "Int").unwrap(), json!(""));
    }

    #[test]
    fn unsupported_fieldtypes_fail() {
        let err = default_conversion(&json!("x"), "Geolocation").unwrap_err();
        assert_eq!(err.to_string(), "Geolocation not supported");
        assert!(default_conversion(&json!("abc"), "Float").is_err());
    }

    #[test]
    fn converters_parse_and_apply() {
        let c: Converter = ".title()".parse().unwrap();
        assert_eq!(c.apply(&json!("hello wORLD-x")).unwrap(), json!("Hello World-X"));
        let c: Converter = ".capitalize".parse().unwrap();
        assert_eq!(c.apply(&json!("hELLO")).unwrap(), json!("Hello"));
        let c: Converter = ".strip()".parse().unwrap();
        assert_eq!(c.apply(&json!("  a ")).unwrap(), json!("a"));
        assert_eq!("int".parse::<Converter>().unwrap().apply(&json!("12")).unwrap(), json!(12));
        assert_eq!("len".parse::<Converter>().unwrap().apply(&json!([1, 2, 3])).unwrap(), json!(3));
        assert_eq!("abs".parse::<Converter>().unwrap().apply(&json!(-4)).unwrap(), json!(4));
        assert_eq!("round".parse::<Converter>().unwrap().apply(&json!(2.5)).unwrap(), json!(2));
        assert_eq!("bool".parse::<Converter>().unwrap().apply(&json!("")).unwrap(), json!(false));
        let c: Converter = "json.dumps".parse().unwrap();
        assert_eq!(c.apply(&json!([1])).unwrap(), json!("[1]"));
    }

    #[test]
    fn unknown_converter_is_a_validation_error() {
        let err = "os.system".parse::<Converter>().unwrap_err();
        assert_eq!(err.exc_type(), "ValidationError");
        assert!(".swapcase()".parse::<Converter>().is_err());
    }

    #[test]
    fn builds_documents_per_doctype_and_subrecord() {
        let mappings = vec![
            mapping("email", "Customer", "email_id", "Data"),
            mapping("name", "Customer", "customer_name", "Data"),
            mapping("addresses.city", "Address", "city", "Data"),
            FieldMapping { target: None, ..mapping("id", "Customer", "x", "Data") },
        ];
        let record = json!({
            "id": 9,
            "email": "a@b.c",
            "name": "",
            "addresses": [{"city": "Oslo"}, {"city": null}, {"city": "Rome"}]
        });
        let docs = build_documents(&record, &mappings).unwrap();
        assert_eq!(
            docs,
            vec![
                json!({"doctype": "Customer", "email_id": "a@b.c"}).as_object().unwrap().clone(),
                json!({"doctype": "Address", "city": "Oslo"}).as_object().unwrap().clone(),
                json!({"doctype": "Address", "city": "Rome"}).as_object().unwrap().clone(),
            ]
        );
    }

    #[test]
    fn single_object_and_missing_keys() {
        let mappings = vec![mapping("owner.login", "User", "username", "Data")];
        let docs = build_documents(&json!({"owner": {"login": "amy"}}), &mappings).unwrap();
        assert_eq!(docs.len(), 1);
        assert!(build_documents(&json!({"other": 1}), &mappings).unwrap().is_empty());
    }

    #[test]
    fn reference_fields_fill_missing_values() {
        let mut user = mapping("items.user", "Line", "user", "Data");
        user.reference = Some((String::new(), "user_id".into()));
        let mut sku = mapping("items.sku", "Line", "sku", "Data");
        sku.reference = Some(("items".into(), "code".into()));
        let record = json!({"user_id": "u1", "items": [{"code": "A"}]});
        let docs = build_documents(&record, &[user, sku]).unwrap();
        let expected = json!({"doctype": "Line", "user": "u1", "sku": "A"});
        assert_eq!(docs, vec![expected.as_object().unwrap().clone()]);
    }

    #[test]
    fn from_node_resolves_targets_and_converters() {
        let mut node = MapNode::new("profile.name", Some("users"), false);
        node.target_dt = Some("Customer".into());
        node.target_df = Some("Customer-customer_name".into());
        node.convert_method = Some(".upper()".into());
        let df = DocField {
            fieldname: "customer_name".into(),
            fieldtype: "Data".into(),
            ..Default::default()
        };
        let m = FieldMapping::from_node(&node, Some(&df), Some("id")).unwrap();
        assert_eq!(m.source_key, "profile");
        assert_eq!(m.source_df, "name");
        assert_eq!(m.converter, Some(Converter::Method(StrMethod::Upper)));
        assert_eq!(m.reference, Some((String::new(), "id".into())));
        assert_eq!(m.target.unwrap().fieldname, "customer_name");
    }
}
