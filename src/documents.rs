use std::collections::HashMap;

use anyhow::Result;
use serde_json::{Map, Value};
use sqlx::AnyConnection;

use crate::dao;
use crate::error::MigrateError;
use crate::types::{DocType, Document, ImportProgress, Notice};

/// Progress sink for a running import.
pub type ProgressFn<'p> = &'p mut (dyn FnMut(ImportProgress) + Send);

enum Inserted {
    Created(Document),
    Existing(Document),
    /// Child table row waiting for a parent.
    Child(Document),
}

/// Writes target documents on one connection, usually inside the import
/// transaction. Schema for every doctype written must be supplied up front.
pub struct DocumentWriter<'c> {
    conn: &'c mut AnyConnection,
    schema: HashMap<String, DocType>,
    messages: Vec<Notice>,
    written: usize,
}

impl<'c> DocumentWriter<'c> {
    pub fn new(conn: &'c mut AnyConnection, schema: impl IntoIterator<Item = DocType>) -> Self {
        Self {
            conn,
            schema: schema.into_iter().map(|dt| (dt.name.clone(), dt)).collect(),
            messages: Vec::new(),
            written: 0,
        }
    }

    pub fn messages(&self) -> &[Notice] {
        &self.messages
    }

    /// Documents created, updated or attached so far.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn into_messages(self) -> Vec<Notice> {
        self.messages
    }

    fn doctype(&self, name: &str) -> Result<&DocType, MigrateError> {
        self.schema.get(name).ok_or_else(|| MigrateError::not_found("DocType", name))
    }

    /// Insert the documents built from one record, then attach child table
    /// rows to the first parent that has a table field for them.
    pub async fn insert_and_link(
        &mut self,
        docs: Vec<Map<String, Value>>,
        keep_existing: bool,
        percent: f64,
        progress: ProgressFn<'_>,
    ) -> Result<()> {
        let mut parents: Vec<Document> = Vec::new();
        let mut children: Vec<Document> = Vec::new();

        for data in docs {
            let outcome = match self.new_document(data) {
                Ok(doc) => {
                    progress(ImportProgress {
                        percent,
                        doctype: Some(doc.doctype.clone()),
                        docname: Some(doc.name.clone()),
                    });
                    tracing::debug!(
                        percent,
                        doctype = %doc.doctype,
                        docname = %doc.name,
                        "inserting"
                    );
                    self.insert(doc, keep_existing).await
                }
                Err(e) => Err(e),
            };
            match outcome {
                Ok(Inserted::Created(d)) => {
                    let message = format!("{} {} created", d.doctype, d.name);
                    self.messages.push(Notice::green("Parent", message));
                    parents.push(d);
                }
                Ok(Inserted::Existing(d)) => parents.push(d),
                Ok(Inserted::Child(d)) => children.push(d),
                Err(e) => match e.downcast_ref::<MigrateError>() {
                    Some(err @ MigrateError::Mandatory { .. }) => {
                        let message = format!("MandatoryError: {}", err);
                        self.messages.push(Notice::red("MandatoryError", message));
                    }
                    Some(err @ MigrateError::LinkValidation { .. }) => {
                        let message = format!("LinkValidationError: {}", err);
                        self.messages.push(Notice::red("LinkValidationError", message));
                    }
                    _ => return Err(e),
                },
            }
        }

        for mut child in children {
            let mut orphan = true;
            for parent in &parents {
                let field = self
                    .doctype(&parent.doctype)?
                    .parentfield_of(&child.doctype)
                    .map(str::to_string);
                if let Some(field) = field {
                    child.parent = Some(parent.name.clone());
                    child.parenttype = Some(parent.doctype.clone());
                    child.parentfield = Some(field);
                    dao::upsert_document(&mut *self.conn, &child).await?;
                    self.written += 1;
                    self.messages.push(Notice::green(
                        "Child",
                        format!(
                            "{} {} attached to {} {}",
                            child.doctype, child.name, parent.doctype, parent.name
                        ),
                    ));
                    orphan = false;
                    break;
                }
            }
            if orphan {
                tracing::warn!(doctype = %child.doctype, "no parent for child row");
                self.messages.push(Notice::red("Child", format!("{} orphan lost", child.doctype)));
            }
        }
        Ok(())
    }

    fn new_document(&self, mut data: Map<String, Value>) -> Result<Document> {
        let doctype = match data.remove("doctype") {
            Some(Value::String(dt)) => dt,
            _ => return Err(MigrateError::validation("Document without doctype").into()),
        };
        let name = new_name(self.doctype(&doctype)?, &data)?;
        Ok(Document { doctype, name, parent: None, parenttype: None, parentfield: None, data })
    }

    async fn insert(&mut self, doc: Document, keep_existing: bool) -> Result<Inserted> {
        let dt = self.doctype(&doc.doctype)?.clone();
        if dt.istable && doc.parent.is_none() {
            return Ok(Inserted::Child(doc));
        }

        let missing: Vec<String> = dt
            .fields
            .iter()
            .filter(|f| f.reqd && f.fieldtype != "Table" && is_blank(doc.data.get(&f.fieldname)))
            .map(|f| f.fieldname.clone())
            .collect();
        if !missing.is_empty() {
            return Err(MigrateError::Mandatory {
                doctype: doc.doctype,
                name: doc.name,
                fields: missing,
            }
            .into());
        }

        for f in dt.fields.iter().filter(|f| f.fieldtype == "Link") {
            let (Some(link_doctype), Some(value)) =
                (f.options.as_deref(), doc.data.get(&f.fieldname))
            else {
                continue;
            };
            let value = text(value);
            if value.is_empty() {
                continue;
            }
            if !dao::document_exists(&mut *self.conn, link_doctype, &value).await? {
                return Err(MigrateError::LinkValidation {
                    field: f.label.clone().unwrap_or_else(|| f.fieldname.clone()),
                    value,
                    link_doctype: link_doctype.to_string(),
                }
                .into());
            }
        }

        let found = dao::get_document(&mut *self.conn, &doc.doctype, &doc.name).await?;
        if let Some(mut existing) = found {
            if !keep_existing {
                existing.data.extend(doc.data);
                dao::upsert_document(&mut *self.conn, &existing).await?;
                self.written += 1;
            }
            return Ok(Inserted::Existing(existing));
        }

        dao::upsert_document(&mut *self.conn, &doc).await?;
        self.written += 1;
        Ok(Inserted::Created(doc))
    }
}

/// `field:<fieldname>` takes the name from that field; anything else gets a
/// random name.
fn new_name(dt: &DocType, data: &Map<String, Value>) -> Result<String, MigrateError> {
    if let Some(field) = dt.autoname.as_deref().and_then(|a| a.strip_prefix("field:")) {
        let field = field.trim();
        let value = data.get(field).map(text).unwrap_or_default();
        if value.is_empty() {
            return Err(MigrateError::Mandatory {
                doctype: dt.name.clone(),
                name: String::new(),
                fields: vec![field.to_string()],
            });
        }
        return Ok(value);
    }
    Ok(uuid::Uuid::new_v4().simple().to_string()[..10].to_string())
}

fn text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn is_blank(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::temp_db;
    use crate::types::{DocField, Indicator};
    use serde_json::json;

    fn field(name: &str, fieldtype: &str, options: Option<&str>, reqd: bool) -> DocField {
        DocField {
            fieldname: name.into(),
            fieldtype: fieldtype.into(),
            options: options.map(str::to_string),
            reqd,
            ..Default::default()
        }
    }

    fn schema() -> Vec<DocType> {
        vec![
            DocType {
                name: "Customer".into(),
                autoname: Some("field:customer_name".into()),
                fields: vec![
                    field("customer_name", "Data", None, true),
                    field("email", "Data", None, false),
                    field("territory", "Link", Some("Territory"), false),
                    field("addresses", "Table", Some("Address"), false),
                ],
                ..Default::default()
            },
            DocType {
                name: "Address".into(),
                istable: true,
                fields: vec![field("city", "Data", None, true)],
                ..Default::default()
            },
        ]
    }

    fn doc(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn creates_parents_and_attaches_children() {
        let (_dir, db) = temp_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut w = DocumentWriter::new(&mut *conn, schema());
        let mut seen = Vec::new();
        let mut progress = |p: ImportProgress| seen.push(p);
        w.insert_and_link(
            vec![
                doc(json!({"doctype": "Address", "city": "Oslo"})),
                doc(json!({
                    "doctype": "Customer",
                    "customer_name": "Acme",
                    "email": "a@acme.test"
                })),
            ],
            false,
            50.0,
            &mut progress,
        )
        .await
        .unwrap();

        let titles: Vec<(&str, Indicator)> =
            w.messages().iter().map(|m| (m.title.as_str(), m.indicator)).collect();
        assert_eq!(titles, vec![("Parent", Indicator::Green), ("Child", Indicator::Green)]);
        assert_eq!(w.messages()[0].message, "Customer Acme created");
        assert!(w.messages()[1].message.ends_with("attached to Customer Acme"));
        assert_eq!(w.written(), 2);
        drop(w);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].docname.as_deref(), Some("Acme"));

        let addresses = dao::list_documents(db.pool(), "Address").await.unwrap();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].parent.as_deref(), Some("Acme"));
        assert_eq!(addresses[0].parentfield.as_deref(), Some("addresses"));
    }

    #[tokio::test]
    async fn duplicates_merge_unless_kept() {
        let (_dir, db) = temp_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut w = DocumentWriter::new(&mut *conn, schema());
        let mut noop = |_: ImportProgress| {};
        let first =
            doc(json!({"doctype": "Customer", "customer_name": "Acme", "email": "old@acme.test"}));
        let second =
            doc(json!({"doctype": "Customer", "customer_name": "Acme", "email": "new@acme.test"}));
        w.insert_and_link(vec![first], false, 10.0, &mut noop).await.unwrap();
        w.insert_and_link(vec![second.clone()], true, 20.0, &mut noop).await.unwrap();
        let d = dao::get_document(&mut *w.conn, "Customer", "Acme").await.unwrap().unwrap();
        assert_eq!(d.data["email"], json!("old@acme.test"));

        w.insert_and_link(vec![second], false, 30.0, &mut noop).await.unwrap();
        let d = dao::get_document(&mut *w.conn, "Customer", "Acme").await.unwrap().unwrap();
        assert_eq!(d.data["email"], json!("new@acme.test"));
        assert_eq!(w.messages().len(), 1);
    }

    #[tokio::test]
    async fn validation_failures_become_red_messages() {
        let (_dir, db) = temp_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut schema = schema();
        schema[0].autoname = None;
        let mut w = DocumentWriter::new(&mut *conn, schema);
        let mut noop = |_: ImportProgress| {};
        w.insert_and_link(
            vec![
                doc(json!({"doctype": "Customer", "email": "x@y.z"})),
                doc(json!({"doctype": "Customer", "customer_name": "Acme", "territory": "Mars"})),
                doc(json!({"doctype": "Address", "city": "Nowhere"})),
            ],
            false,
            100.0,
            &mut noop,
        )
        .await
        .unwrap();
        let msgs: Vec<(&str, Indicator)> =
            w.messages().iter().map(|m| (m.title.as_str(), m.indicator)).collect();
        assert_eq!(
            msgs,
            vec![
                ("MandatoryError", Indicator::Red),
                ("LinkValidationError", Indicator::Red),
                ("Child", Indicator::Red),
            ]
        );
        assert!(w.messages()[0].message.contains("customer_name"));
        assert_eq!(w.messages()[2].message, "Address orphan lost");
        assert_eq!(w.written(), 0);
    }

    #[tokio::test]
    async fn unknown_doctype_is_an_error() {
        let (_dir, db) = temp_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut w = DocumentWriter::new(&mut *conn, schema());
        let mut noop = |_: ImportProgress| {};
        let docs = vec![doc(json!({"doctype": "Invoice", "x": 1}))];
        let err = w.insert_and_link(docs, false, 1.0, &mut noop).await.unwrap_err();
        assert_eq!(err.to_string(), "DocType Invoice not found");
    }

    #[test]
    fn field_autoname_uses_value() {
        let s = schema();
        let name = new_name(&s[0], &doc(json!({"customer_name": "Acme"}))).unwrap();
        assert_eq!(name, "Acme");
        assert!(new_name(&s[0], &Map::new()).is_err());
        assert_eq!(new_name(&s[1], &Map::new()).unwrap().len(), 10);
    }
}
