pub mod auth;
pub mod client;
pub mod config;
pub mod dao;
pub mod db;
pub mod documents;
pub mod error;
pub mod mapping;
pub mod query;
pub mod resolver;
pub mod rpc;
pub mod storage;
pub mod tree;
pub mod types;

#[cfg(test)]
mod testing;

// --- Library API for embedding ---

/// Convenience re-exports for embedders.
pub mod prelude {
    pub use crate::auth::{AuthChallenge, AuthScheme, Credentials};
    pub use crate::config::Settings;
    pub use crate::error::MigrateError;
    pub use crate::query::{Filters, FormQueries, QuerySpec};
    pub use crate::rpc::{CallFailure, Method, RemoteCaller};
    pub use crate::tree::{
        get_label, DialogService, RetryState, ToolbarAction, TreeController, TreeNode,
    };
    pub use crate::types::{
        DocType, Document, ImportProgress, ImportReport, MapNode, MapParam, Notice, ParamType,
    };
    pub use crate::{RestMigrate, ROOT_NAME};
}

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::auth::Credentials;
use crate::client::{ApiClient, Transport};
use crate::config::Settings;
use crate::db::Database;
use crate::documents::{DocumentWriter, ProgressFn};
use crate::error::MigrateError;
use crate::mapping::{build_documents, FieldMapping};
use crate::query::{Filters, FormQueries};
use crate::resolver::{root_of, Resolver};
use crate::storage::{require_node, Storage};
use crate::types::{
    docfield_name, node_name, DocFieldRow, DocType, Document, Fixture, FixtureNode, ImportProgress,
    ImportReport, MapNode, MapParam, SchemaFile, TreeNodeRow,
};

/// Label of the synthetic node above all API roots in the tree view.
pub const ROOT_NAME: &str = "REST APIs";

/// Async library entry point. Owns the database and the API client.
pub struct RestMigrate {
    db: Database,
    client: ApiClient,
    settings: Arc<Settings>,
}

impl RestMigrate {
    /// Connect to the configured database and (optionally) run migrations.
    pub async fn connect(settings: Settings, run_migrations: bool) -> Result<Self> {
        let settings = Arc::new(settings);
        let client = ApiClient::from_settings(settings.clone())?;
        Self::open(settings, client, run_migrations).await
    }

    /// Like `connect`, but fetch through a custom transport.
    pub async fn with_transport(
        settings: Settings,
        transport: Arc<dyn Transport>,
        run_migrations: bool,
    ) -> Result<Self> {
        let settings = Arc::new(settings);
        let client = ApiClient::new(transport, settings.clone());
        Self::open(settings, client, run_migrations).await
    }

    async fn open(
        settings: Arc<Settings>,
        client: ApiClient,
        run_migrations: bool,
    ) -> Result<Self> {
        let db = Database::connect(settings.database_url.as_deref()).await?;
        if run_migrations {
            db.run_migrations().await?;
        }
        Ok(Self { db, client, settings })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // --- Tree API ---

    /// Rows for the tree view. Without a parent this is the synthetic root;
    /// `is_root` (or the synthetic root as parent) lists the API roots.
    pub async fn get_children(
        &self,
        parent: Option<&str>,
        is_root: Option<bool>,
    ) -> Result<Vec<TreeNodeRow>> {
        let parent = match (parent, is_root) {
            (_, Some(true)) => "",
            (Some(p), _) if p == ROOT_NAME => "",
            (Some(p), _) => p,
            (None, _) => {
                return Ok(vec![TreeNodeRow {
                    value: ROOT_NAME.to_string(),
                    label: None,
                    expandable: None,
                }]);
            }
        };
        let nodes = self.db.list_nodes(&Filters::new().eq("parent_segment", parent)).await?;
        Ok(nodes
            .into_iter()
            .map(|n| TreeNodeRow {
                value: n.name,
                label: Some(n.segment_name),
                expandable: Some(n.is_group),
            })
            .collect())
    }

    /// Create a node under `parent` (the synthetic root or none for a new API root).
    pub async fn add_node(
        &self,
        segment_name: &str,
        is_group: bool,
        parent: Option<&str>,
    ) -> Result<MapNode> {
        let parent = parent.filter(|p| !p.is_empty() && *p != ROOT_NAME);
        if let Some(p) = parent {
            require_node(&self.db, p).await?;
        }
        self.insert_node(MapNode::new(segment_name, parent, is_group)).await
    }

    /// Insert a fully specified node.
    pub async fn insert_node(&self, mut node: MapNode) -> Result<MapNode> {
        node.before_save();
        if node.segment_name.is_empty() {
            return Err(MigrateError::validation("Segment name is required").into());
        }
        node.name = node_name(node.parent_segment.as_deref(), &node.segment_name);
        self.validate_refs(&node).await?;
        self.db.insert_node(&node).await?;
        tracing::info!(name = %node.name, is_group = node.is_group, "node created");
        self.update_root_attrs().await?;
        self.get_node(&node.name).await
    }

    /// Save changes to an existing node.
    pub async fn save_node(&self, mut node: MapNode) -> Result<MapNode> {
        require_node(&self.db, &node.name).await?;
        node.before_save();
        self.validate_refs(&node).await?;
        self.db.update_node(&node).await?;
        self.update_root_attrs().await?;
        self.get_node(&node.name).await
    }

    async fn validate_refs(&self, node: &MapNode) -> Result<()> {
        if let Some(field) = &node.data_field {
            require_node(&self.db, field).await?;
        }
        if let Some(df) = &node.target_df {
            if self.db.get_docfield(df).await?.is_none() {
                return Err(MigrateError::not_found("DocField", df).into());
            }
        }
        if let Some(method) = &node.convert_method {
            method.parse::<mapping::Converter>()?;
        }
        Ok(())
    }

    /// Delete a node that has no children, with its params.
    pub async fn delete_node(&self, name: &str) -> Result<()> {
        require_node(&self.db, name).await?;
        let children = self.db.list_nodes(&Filters::new().eq("parent_segment", name)).await?;
        if !children.is_empty() {
            return Err(MigrateError::validation(format!(
                "Cannot delete {} because it has child nodes",
                name
            ))
            .into());
        }
        self.db.delete_node(name).await?;
        tracing::info!(%name, "node deleted");
        Ok(())
    }

    pub async fn get_node(&self, name: &str) -> Result<MapNode> {
        require_node(&self.db, name).await
    }

    pub async fn list_nodes(&self, filters: &Filters) -> Result<Vec<MapNode>> {
        self.db.list_nodes(filters).await
    }

    pub async fn get_params(&self, name: &str) -> Result<Vec<MapParam>> {
        require_node(&self.db, name).await?;
        self.db.get_params(name).await
    }

    /// Replace the request params of a node.
    pub async fn set_params(&self, name: &str, params: &[MapParam]) -> Result<()> {
        require_node(&self.db, name).await?;
        self.db.set_params(name, params).await
    }

    /// Copy root-level attributes down to every node of each tree. Returns the
    /// number of nodes changed.
    pub async fn update_root_attrs(&self) -> Result<usize> {
        let mut changed = 0;
        for mut node in self.db.list_nodes(&Filters::new()).await? {
            let root = root_of(&self.db, &node).await?;
            if root.keep_existing != node.keep_existing {
                node.keep_existing = root.keep_existing;
                self.db.update_node(&node).await?;
                changed += 1;
            }
        }
        if changed > 0 {
            tracing::debug!(changed, "root attributes propagated");
        }
        Ok(changed)
    }

    // --- Form API ---

    /// Doc fields matching `filters`, as `(name, label, fieldtype)` rows.
    pub async fn df_list(&self, filters: &Filters) -> Result<Vec<DocFieldRow>> {
        let fields = self.db.list_docfields(filters).await?;
        Ok(fields
            .into_iter()
            .map(|f| DocFieldRow { name: f.name, label: f.label, fieldtype: f.fieldtype })
            .collect())
    }

    /// Candidate values for a form field of `record`, using the registered
    /// query for that field.
    pub async fn field_candidates(&self, fieldname: &str, record: &MapNode) -> Result<Vec<String>> {
        let spec = FormQueries::integration_map()
            .get_query(fieldname, record)
            .ok_or_else(|| {
                MigrateError::validation(format!("No query registered for {}", fieldname))
            })?;
        match spec.query {
            Some(rpc::Method::DfList) => {
                Ok(self.df_list(&spec.filters).await?.into_iter().map(|r| r.name).collect())
            }
            Some(other) => {
                Err(MigrateError::validation(format!("{} is not a field query", other)).into())
            }
            None => {
                Ok(self.db.list_nodes(&spec.filters).await?.into_iter().map(|n| n.name).collect())
            }
        }
    }

    // --- Schema API ---

    /// Register (or replace) a target doctype and its fields.
    pub async fn register_doctype(&self, mut doctype: DocType) -> Result<()> {
        for f in &mut doctype.fields {
            f.parent = doctype.name.clone();
            f.name = docfield_name(&doctype.name, &f.fieldname);
        }
        self.db.upsert_doctype(&doctype).await?;
        tracing::debug!(
            doctype = %doctype.name,
            fields = doctype.fields.len(),
            "doctype registered"
        );
        Ok(())
    }

    /// Register every doctype in a TOML schema document.
    pub async fn load_schema(&self, text: &str) -> Result<usize> {
        let schema: SchemaFile = toml::from_str(text).context("parsing schema")?;
        let count = schema.doctype.len();
        for dt in schema.doctype {
            self.register_doctype(dt).await?;
        }
        Ok(count)
    }

    pub async fn load_schema_file(&self, path: &Path) -> Result<usize> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading schema: {}", path.display()))?;
        self.load_schema(&text).await
    }

    pub async fn get_doctype(&self, name: &str) -> Result<DocType> {
        self.db
            .get_doctype(name)
            .await?
            .ok_or_else(|| MigrateError::not_found("DocType", name).into())
    }

    pub async fn list_documents(&self, doctype: &str) -> Result<Vec<Document>> {
        dao::list_documents(self.db.pool(), doctype).await
    }

    // --- Fetch / import API ---

    /// Records fetched for a leaf node.
    pub async fn get_data(
        &self,
        name: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<Value>> {
        let node = require_node(&self.db, name).await?;
        Resolver::new(&self.db, &self.client, credentials).get_all(&node).await
    }

    /// Import all records of a leaf node into the mapped doctypes.
    pub async fn import_data(
        &self,
        name: &str,
        credentials: Option<&Credentials>,
    ) -> Result<ImportReport> {
        self.import_data_with_progress(name, credentials, &mut |_: ImportProgress| {}).await
    }

    /// Import with a progress callback, called once per document.
    pub async fn import_data_with_progress(
        &self,
        name: &str,
        credentials: Option<&Credentials>,
        progress: ProgressFn<'_>,
    ) -> Result<ImportReport> {
        let node = require_node(&self.db, name).await?;
        if node.is_group {
            return Err(MigrateError::validation("Import is only valid on a data field").into());
        }

        let parent = node.parent_segment.clone().unwrap_or_default();
        let siblings = self.db.list_nodes(&Filters::new().eq("parent_segment", parent)).await?;
        let mut mappings = Vec::with_capacity(siblings.len());
        let mut doctypes: Vec<String> = Vec::new();
        for m in &siblings {
            let docfield = match &m.target_df {
                Some(df) => Some(
                    self.db
                        .get_docfield(df)
                        .await?
                        .ok_or_else(|| MigrateError::not_found("DocField", df))?,
                ),
                None => None,
            };
            let reference = match &m.data_field {
                Some(field) => Some(require_node(&self.db, field).await?.segment_name),
                None => None,
            };
            let mapping = FieldMapping::from_node(m, docfield.as_ref(), reference.as_deref())?;
            if let Some(t) = &mapping.target {
                if !doctypes.contains(&t.doctype) {
                    doctypes.push(t.doctype.clone());
                }
            }
            mappings.push(mapping);
        }
        let mut schema = Vec::with_capacity(doctypes.len());
        for dt in &doctypes {
            schema.push(self.get_doctype(dt).await?);
        }

        let records = Resolver::new(&self.db, &self.client, credentials).get_all(&node).await?;
        let keep_existing = root_of(&self.db, &node).await?.keep_existing;
        tracing::info!(
            node = %node.name,
            records = records.len(),
            ?doctypes,
            keep_existing,
            "importing"
        );
        progress(ImportProgress { percent: 0.0, doctype: None, docname: None });

        let mut tx = self.db.pool().begin().await?;
        let mut writer = DocumentWriter::new(&mut *tx, schema);
        let total = records.len();
        for (i, record) in records.iter().enumerate() {
            let docs = build_documents(record, &mappings)?;
            let percent = ((i + 1) as f64 * 100.0) / total as f64;
            writer.insert_and_link(docs, keep_existing, percent, &mut *progress).await?;
        }
        let documents = writer.written();
        let messages = writer.into_messages();
        tx.commit().await?;

        Ok(ImportReport { records: total, documents, messages })
    }

    // --- Fixtures ---

    /// All nodes with their params, parents before children.
    pub async fn export_fixture(&self) -> Result<Fixture> {
        let nodes = self.db.list_nodes(&Filters::new()).await?;
        let mut by_parent: HashMap<String, Vec<MapNode>> = HashMap::new();
        for n in nodes {
            by_parent.entry(n.parent_segment.clone().unwrap_or_default()).or_default().push(n);
        }
        let mut queue: VecDeque<MapNode> = by_parent.remove("").unwrap_or_default().into();
        let mut out = Vec::new();
        while let Some(node) = queue.pop_front() {
            if let Some(children) = by_parent.remove(&node.name) {
                queue.extend(children);
            }
            let params = self.db.get_params(&node.name).await?;
            out.push(FixtureNode { node, params });
        }
        if !by_parent.is_empty() {
            tracing::warn!(orphans = by_parent.len(), "nodes with missing parents skipped");
        }
        Ok(Fixture { nodes: out })
    }

    /// Load nodes from a fixture, overwriting nodes with the same name.
    pub async fn import_fixture(&self, fixture: Fixture) -> Result<usize> {
        let mut seen = HashSet::new();
        for FixtureNode { mut node, params } in fixture.nodes {
            node.before_save();
            if node.name.is_empty() {
                node.name = node_name(node.parent_segment.as_deref(), &node.segment_name);
            }
            if !seen.insert(node.name.clone()) {
                return Err(MigrateError::DuplicateEntry {
                    doctype: "REST Integration Map".into(),
                    name: node.name,
                }
                .into());
            }
            if self.db.get_node(&node.name).await?.is_some() {
                self.db.update_node(&node).await?;
            } else {
                self.db.insert_node(&node).await?;
            }
            self.db.set_params(&node.name, &params).await?;
        }
        self.update_root_attrs().await?;
        tracing::info!(nodes = seen.len(), "fixture imported");
        Ok(seen.len())
    }

    pub async fn export_fixture_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export_fixture().await?)?)
    }

    pub async fn import_fixture_json(&self, text: &str) -> Result<usize> {
        let fixture: Fixture = serde_json::from_str(text).context("parsing fixture")?;
        self.import_fixture(fixture).await
    }
}
