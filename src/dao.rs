use anyhow::{Context, Result};
use serde_json::{Map, Value};
use sqlx::any::AnyArguments;
use sqlx::query::QueryAs;
use sqlx::{Any, AnyConnection, AnyPool};

use crate::error::MigrateError;
use crate::query::{FilterValue, Filters};
use crate::types::{docfield_name, DocField, DocType, Document, MapNode, MapParam, ParamType};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlValue {
    Text(String),
    Int(i64),
    Real(f64),
}

fn sql_value(v: &Value) -> Result<Option<SqlValue>> {
    Ok(match v {
        Value::Null => None,
        Value::Bool(b) => Some(SqlValue::Int(*b as i64)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(SqlValue::Int(i)),
            None => Some(SqlValue::Real(n.as_f64().unwrap_or_default())),
        },
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        other => {
            return Err(
                MigrateError::validation(format!("Unsupported filter value: {}", other)).into()
            )
        }
    })
}

/// Translate filters into a `WHERE` clause over whitelisted columns.
/// Equality against unset columns treats NULL as `''` (or 0).
pub(crate) fn where_clause(
    filters: &Filters,
    columns: &[&str],
) -> Result<(String, Vec<SqlValue>)> {
    let mut parts = Vec::with_capacity(filters.len());
    let mut binds = Vec::with_capacity(filters.len());
    for (field, cond) in filters.iter() {
        if !columns.contains(&field.as_str()) {
            return Err(MigrateError::validation(format!(
                "Field not permitted in query: {}",
                field
            ))
            .into());
        }
        let (op, value) = match cond {
            FilterValue::Value(v) => ("=".to_string(), v),
            FilterValue::Condition(op, v) => (op.trim().to_ascii_uppercase(), v),
        };
        match (op.as_str(), sql_value(value)?) {
            ("=", None) => parts.push(format!("{} IS NULL", field)),
            ("!=", None) => parts.push(format!("{} IS NOT NULL", field)),
            ("=" | "!=", Some(SqlValue::Text(s))) => {
                parts.push(format!("COALESCE({}, '') {} ?", field, op));
                binds.push(SqlValue::Text(s));
            }
            ("=" | "!=", Some(v)) => {
                parts.push(format!("COALESCE({}, 0) {} ?", field, op));
                binds.push(v);
            }
            ("LIKE" | "NOT LIKE", Some(SqlValue::Text(s))) => {
                parts.push(format!("COALESCE({}, '') {} ?", field, op));
                binds.push(SqlValue::Text(s));
            }
            (op, _) => {
                return Err(MigrateError::validation(format!(
                    "Unsupported filter: {} {}",
                    field, op
                ))
                .into());
            }
        }
    }
    if parts.is_empty() {
        Ok((String::new(), binds))
    } else {
        Ok((format!(" WHERE {}", parts.join(" AND ")), binds))
    }
}

fn bind_values<'q, O>(
    mut q: QueryAs<'q, Any, O, AnyArguments<'q>>,
    binds: Vec<SqlValue>,
) -> QueryAs<'q, Any, O, AnyArguments<'q>> {
    for b in binds {
        q = match b {
            SqlValue::Text(s) => q.bind(s),
            SqlValue::Int(i) => q.bind(i),
            SqlValue::Real(f) => q.bind(f),
        };
    }
    q
}

// --- integration map ---

// Nullable text columns go through COALESCE: the Any driver cannot decode NULL
// into Option<String>. `''` reads back as None.
const NODE_COLUMNS: &str = "name, segment_name, COALESCE(parent_segment, ''), is_group, \
    COALESCE(data_field, ''), COALESCE(target_dt, ''), COALESCE(target_df, ''), \
    COALESCE(convert_method, ''), keep_existing";
const NODE_FILTER_COLUMNS: &[&str] = &[
    "name",
    "segment_name",
    "parent_segment",
    "is_group",
    "data_field",
    "target_dt",
    "target_df",
    "keep_existing",
];

type NodeRow = (String, String, String, i64, String, String, String, String, i64);

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn node_from_row(r: NodeRow) -> MapNode {
    MapNode {
        name: r.0,
        segment_name: r.1,
        parent_segment: non_empty(r.2),
        is_group: r.3 != 0,
        data_field: non_empty(r.4),
        target_dt: non_empty(r.5),
        target_df: non_empty(r.6),
        convert_method: non_empty(r.7),
        keep_existing: r.8 != 0,
    }
}

pub async fn get_node(pool: &AnyPool, name: &str) -> Result<Option<MapNode>> {
    let sql = format!("SELECT {} FROM integration_map WHERE name = ?", NODE_COLUMNS);
    let row = sqlx::query_as::<_, NodeRow>(&sql)
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(node_from_row))
}

pub async fn list_nodes(pool: &AnyPool, filters: &Filters) -> Result<Vec<MapNode>> {
    let (clause, binds) = where_clause(filters, NODE_FILTER_COLUMNS)?;
    let sql =
        format!("SELECT {} FROM integration_map{} ORDER BY segment_name", NODE_COLUMNS, clause);
    let rows = bind_values(sqlx::query_as::<_, NodeRow>(&sql), binds).fetch_all(pool).await?;
    Ok(rows.into_iter().map(node_from_row).collect())
}

pub async fn insert_node(pool: &AnyPool, n: &MapNode) -> Result<()> {
    if get_node(pool, &n.name).await?.is_some() {
        return Err(MigrateError::DuplicateEntry {
            doctype: "REST Integration Map".into(),
            name: n.name.clone(),
        }
        .into());
    }
    sqlx::query(
        "INSERT INTO integration_map(name, segment_name, parent_segment, is_group, data_field, target_dt, target_df, convert_method, keep_existing)\n         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&n.name)
    .bind(&n.segment_name)
    .bind(&n.parent_segment)
    .bind(n.is_group as i64)
    .bind(&n.data_field)
    .bind(&n.target_dt)
    .bind(&n.target_df)
    .bind(&n.convert_method)
    .bind(n.keep_existing as i64)
    .execute(pool)
    .await
    .with_context(|| format!("inserting node {}", n.name))?;
    Ok(())
}

pub async fn update_node(pool: &AnyPool, n: &MapNode) -> Result<()> {
    let res = sqlx::query(
        "UPDATE integration_map SET segment_name = ?, parent_segment = ?, is_group = ?, data_field = ?,\n           target_dt = ?, target_df = ?, convert_method = ?, keep_existing = ?, updated_at = CURRENT_TIMESTAMP\n         WHERE name = ?",
    )
    .bind(&n.segment_name)
    .bind(&n.parent_segment)
    .bind(n.is_group as i64)
    .bind(&n.data_field)
    .bind(&n.target_dt)
    .bind(&n.target_df)
    .bind(&n.convert_method)
    .bind(n.keep_existing as i64)
    .bind(&n.name)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        return Err(MigrateError::not_found("REST Integration Map", &n.name).into());
    }
    Ok(())
}

pub async fn delete_node(pool: &AnyPool, name: &str) -> Result<u64> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM map_params WHERE map_name = ?").bind(name).execute(&mut *tx).await?;
    let res = sqlx::query("DELETE FROM integration_map WHERE name = ?")
        .bind(name)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(res.rows_affected())
}

pub async fn get_params(pool: &AnyPool, name: &str) -> Result<Vec<MapParam>> {
    let rows: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT param_type, key, value FROM map_params WHERE map_name = ? ORDER BY idx",
    )
    .bind(name)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|(t, key, value)| -> Result<MapParam> {
            Ok(MapParam { param_type: t.parse::<ParamType>()?, key, value })
        })
        .collect()
}

pub async fn set_params(pool: &AnyPool, name: &str, params: &[MapParam]) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM map_params WHERE map_name = ?").bind(name).execute(&mut *tx).await?;
    for (idx, p) in params.iter().enumerate() {
        sqlx::query(
            "INSERT INTO map_params(map_name, idx, param_type, key, value) VALUES(?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(idx as i64)
        .bind(p.param_type.as_str())
        .bind(&p.key)
        .bind(&p.value)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

// --- target schema ---

const FIELD_COLUMNS: &str =
    "name, parent, fieldname, COALESCE(label, ''), fieldtype, COALESCE(options, ''), reqd";
const FIELD_FILTER_COLUMNS: &[&str] =
    &["name", "parent", "fieldname", "label", "fieldtype", "options", "reqd"];

type FieldRow = (String, String, String, String, String, String, i64);

fn field_from_row(r: FieldRow) -> DocField {
    DocField {
        name: r.0,
        parent: r.1,
        fieldname: r.2,
        label: non_empty(r.3),
        fieldtype: r.4,
        options: non_empty(r.5),
        reqd: r.6 != 0,
    }
}

pub async fn upsert_doctype(pool: &AnyPool, dt: &DocType) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO doctypes(name, istable, autoname) VALUES(?, ?, ?)\n         ON CONFLICT(name) DO UPDATE SET istable=excluded.istable, autoname=excluded.autoname",
    )
    .bind(&dt.name)
    .bind(dt.istable as i64)
    .bind(&dt.autoname)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM docfields WHERE parent = ?").bind(&dt.name).execute(&mut *tx).await?;
    for (idx, f) in dt.fields.iter().enumerate() {
        sqlx::query(
            "INSERT INTO docfields(name, parent, idx, fieldname, label, fieldtype, options, reqd) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(docfield_name(&dt.name, &f.fieldname))
        .bind(&dt.name)
        .bind(idx as i64)
        .bind(&f.fieldname)
        .bind(&f.label)
        .bind(&f.fieldtype)
        .bind(&f.options)
        .bind(f.reqd as i64)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn get_doctype(pool: &AnyPool, name: &str) -> Result<Option<DocType>> {
    let row: Option<(String, i64, String)> =
        sqlx::query_as("SELECT name, istable, COALESCE(autoname, '') FROM doctypes WHERE name = ?")
            .bind(name)
            .fetch_optional(pool)
            .await?;
    let Some((name, istable, autoname)) = row else { return Ok(None); };
    let fields = sqlx::query_as::<_, FieldRow>(&format!(
        "SELECT {} FROM docfields WHERE parent = ? ORDER BY idx",
        FIELD_COLUMNS
    ))
    .bind(&name)
    .fetch_all(pool)
    .await?;
    Ok(Some(DocType {
        name,
        istable: istable != 0,
        autoname: non_empty(autoname),
        fields: fields.into_iter().map(field_from_row).collect(),
    }))
}

pub async fn get_docfield(pool: &AnyPool, name: &str) -> Result<Option<DocField>> {
    let sql = format!("SELECT {} FROM docfields WHERE name = ?", FIELD_COLUMNS);
    let row = sqlx::query_as::<_, FieldRow>(&sql)
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(field_from_row))
}

pub async fn list_docfields(pool: &AnyPool, filters: &Filters) -> Result<Vec<DocField>> {
    let (clause, binds) = where_clause(filters, FIELD_FILTER_COLUMNS)?;
    let sql = format!("SELECT {} FROM docfields{} ORDER BY parent, idx", FIELD_COLUMNS, clause);
    let rows = bind_values(sqlx::query_as::<_, FieldRow>(&sql), binds).fetch_all(pool).await?;
    Ok(rows.into_iter().map(field_from_row).collect())
}

// --- documents ---

type DocumentRow = (String, String, String, String, String, String);

const DOCUMENT_COLUMNS: &str = "doctype, name, COALESCE(parent, ''), COALESCE(parenttype, ''), \
    COALESCE(parentfield, ''), data";

fn document_from_row(r: DocumentRow) -> Result<Document> {
    let data: Map<String, Value> =
        serde_json::from_str(&r.5).with_context(|| format!("decoding document {} {}", r.0, r.1))?;
    Ok(Document {
        doctype: r.0,
        name: r.1,
        parent: non_empty(r.2),
        parenttype: non_empty(r.3),
        parentfield: non_empty(r.4),
        data,
    })
}

pub async fn get_document(
    conn: &mut AnyConnection,
    doctype: &str,
    name: &str,
) -> Result<Option<Document>> {
    let row = sqlx::query_as::<_, DocumentRow>(&format!(
        "SELECT {} FROM documents WHERE doctype = ? AND name = ?",
        DOCUMENT_COLUMNS
    ))
    .bind(doctype)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(document_from_row).transpose()
}

pub async fn document_exists(conn: &mut AnyConnection, doctype: &str, name: &str) -> Result<bool> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE doctype = ? AND name = ?")
        .bind(doctype)
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
    Ok(n > 0)
}

/// Insert or replace a document row.
pub async fn upsert_document(conn: &mut AnyConnection, d: &Document) -> Result<()> {
    sqlx::query(
        "INSERT INTO documents(doctype, name, parent, parenttype, parentfield, data) VALUES(?, ?, ?, ?, ?, ?)\n         ON CONFLICT(doctype, name) DO UPDATE SET\n           parent=excluded.parent, parenttype=excluded.parenttype, parentfield=excluded.parentfield,\n           data=excluded.data, updated_at=CURRENT_TIMESTAMP",
    )
    .bind(&d.doctype)
    .bind(&d.name)
    .bind(&d.parent)
    .bind(&d.parenttype)
    .bind(&d.parentfield)
    .bind(serde_json::to_string(&d.data)?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn list_documents(pool: &AnyPool, doctype: &str) -> Result<Vec<Document>> {
    let rows = sqlx::query_as::<_, DocumentRow>(&format!(
        "SELECT {} FROM documents WHERE doctype = ? ORDER BY name",
        DOCUMENT_COLUMNS
    ))
    .bind(doctype)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(document_from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_filters_have_no_clause() {
        let (clause, binds) = where_clause(&Filters::new(), NODE_FILTER_COLUMNS).unwrap();
        assert!(clause.is_empty());
        assert!(binds.is_empty());
    }

    #[test]
    fn equality_coalesces_nulls() {
        let f = Filters::new().eq("parent_segment", "").eq("is_group", false);
        let (clause, binds) = where_clause(&f, NODE_FILTER_COLUMNS).unwrap();
        assert_eq!(clause, " WHERE COALESCE(is_group, 0) = ? AND COALESCE(parent_segment, '') = ?");
        assert_eq!(binds, vec![SqlValue::Int(0), SqlValue::Text(String::new())]);
    }

    #[test]
    fn not_like_condition() {
        let f = Filters::new().cond("fieldtype", "not like", "%Break%");
        let (clause, _) = where_clause(&f, FIELD_FILTER_COLUMNS).unwrap();
        assert_eq!(clause, " WHERE COALESCE(fieldtype, '') NOT LIKE ?");
    }

    #[test]
    fn rejects_unknown_columns() {
        let f = Filters::new().eq("password", "x");
        let err = where_clause(&f, NODE_FILTER_COLUMNS).unwrap_err();
        assert!(err.to_string().contains("not permitted"));
    }

    #[test]
    fn rejects_unsupported_values() {
        let f = Filters::new().eq("name", json!({"a": 1}));
        assert!(where_clause(&f, NODE_FILTER_COLUMNS).is_err());
    }
}
