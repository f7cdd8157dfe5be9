use anyhow::{Context, Result};
use async_trait::async_trait;
use directories::ProjectDirs;
use sqlx::any::AnyPoolOptions;
use sqlx::{any::AnyConnectOptions, migrate::Migrator, AnyPool, ConnectOptions};
use std::sync::Once;
use std::{path::PathBuf, str::FromStr};

use crate::dao;
use crate::query::Filters;
use crate::storage::Storage;
use crate::types::{DocField, DocType, MapNode, MapParam};

// Ensure drivers are installed exactly once for sqlx::any
static INSTALL_DRIVERS: Once = Once::new();

// Embed SQL migrations from the migrations/ directory
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
}

impl Database {
    // Create a connection pool. If database_url is None, use a SQLite file in
    // the user's data directory.
    pub async fn connect(database_url: Option<&str>) -> Result<Self> {
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

        let url = match database_url {
            Some(u) if !u.trim().is_empty() => u.to_string(),
            _ => default_sqlite_url()?,
        };

        let opts = AnyConnectOptions::from_str(&url)
            .with_context(|| format!("invalid database URL: {url}"))?;
        // Quiet by default; callers can enable SQLX_LOG if they want
        let opts = opts.disable_statement_logging();

        // Every connection to an in-memory SQLite database is a new database
        let max_connections = if url.contains(":memory:") { 1 } else { 10 };
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await
            .with_context(|| format!("failed to connect to database: {url}"))?;

        tracing::debug!(%url, "database connected");
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.context("running migrations")
    }

    pub fn pool(&self) -> &AnyPool { &self.pool }
}

#[async_trait]
impl Storage for Database {
    async fn get_node(&self, name: &str) -> Result<Option<MapNode>> {
        dao::get_node(&self.pool, name).await
    }

    async fn list_nodes(&self, filters: &Filters) -> Result<Vec<MapNode>> {
        dao::list_nodes(&self.pool, filters).await
    }

    async fn insert_node(&self, node: &MapNode) -> Result<()> {
        dao::insert_node(&self.pool, node).await
    }

    async fn update_node(&self, node: &MapNode) -> Result<()> {
        dao::update_node(&self.pool, node).await
    }

    async fn delete_node(&self, name: &str) -> Result<u64> {
        dao::delete_node(&self.pool, name).await
    }

    async fn get_params(&self, name: &str) -> Result<Vec<MapParam>> {
        dao::get_params(&self.pool, name).await
    }

    async fn set_params(&self, name: &str, params: &[MapParam]) -> Result<()> {
        dao::set_params(&self.pool, name, params).await
    }

    async fn upsert_doctype(&self, doctype: &DocType) -> Result<()> {
        dao::upsert_doctype(&self.pool, doctype).await
    }

    async fn get_doctype(&self, name: &str) -> Result<Option<DocType>> {
        dao::get_doctype(&self.pool, name).await
    }

    async fn get_docfield(&self, name: &str) -> Result<Option<DocField>> {
        dao::get_docfield(&self.pool, name).await
    }

    async fn list_docfields(&self, filters: &Filters) -> Result<Vec<DocField>> {
        dao::list_docfields(&self.pool, filters).await
    }
}

/// SQLite URL for a file path, with spaces encoded.
pub fn sqlite_url(path: &std::path::Path) -> String {
    let mut path_str = path.to_string_lossy().to_string();
    if path_str.contains(' ') { path_str = path_str.replace(' ', "%20"); }
    format!("sqlite://{path_str}?mode=rwc")
}

fn default_sqlite_url() -> Result<String> {
    let proj = ProjectDirs::from("dev", "rest-migrate", "rest-migrate")
        .context("unable to determine data directory for default sqlite path")?;
    let mut path: PathBuf = proj.data_dir().to_path_buf();
    std::fs::create_dir_all(&path)
        .with_context(|| format!("creating data dir: {}", path.display()))?;
    path.push("rest-migrate.db");
    Ok(sqlite_url(&path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Document, ParamType};

    async fn temp_db(dir: &tempfile::TempDir) -> Database {
        let db = Database::connect(Some(&sqlite_url(&dir.path().join("t.db")))).await.unwrap();
        db.run_migrations().await.unwrap();
        db
    }

    #[tokio::test]
    async fn node_round_trip_and_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let db = temp_db(&dir).await;
        let root = MapNode::new("https://api.example.com", None, true);
        db.insert_node(&root).await.unwrap();
        let got = db.get_node(&root.name).await.unwrap().unwrap();
        assert_eq!(got, root);

        let err = db.insert_node(&root).await.unwrap_err();
        let kind = err.downcast_ref::<crate::error::MigrateError>().map(|e| e.exc_type());
        assert_eq!(kind, Some("DuplicateEntryError"));
    }

    #[tokio::test]
    async fn list_nodes_treats_missing_parent_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db = temp_db(&dir).await;
        let root = MapNode::new("api", None, true);
        db.insert_node(&root).await.unwrap();
        db.insert_node(&MapNode::new("token", None, false)).await.unwrap();
        db.insert_node(&MapNode::new("id", Some("api"), false)).await.unwrap();

        let top_leaves = Filters::new().eq("parent_segment", "").eq("is_group", false);
        let roots = db.list_nodes(&top_leaves).await.unwrap();
        assert_eq!(roots.iter().map(|n| n.name.as_str()).collect::<Vec<_>>(), vec!["token"]);

        let leaves = db.list_nodes(&Filters::new().eq("is_group", false)).await.unwrap();
        assert_eq!(leaves.len(), 2);
    }

    #[tokio::test]
    async fn params_keep_their_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = temp_db(&dir).await;
        db.insert_node(&MapNode::new("api", None, true)).await.unwrap();
        let params = vec![
            MapParam { param_type: ParamType::Header, key: "X-Key".into(), value: "1".into() },
            MapParam { param_type: ParamType::UrlQuery, key: "page".into(), value: "2".into() },
        ];
        db.set_params("api", &params).await.unwrap();
        assert_eq!(db.get_params("api").await.unwrap(), params);
        db.delete_node("api").await.unwrap();
        assert!(db.get_params("api").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unset_columns_read_back_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let db = temp_db(&dir).await;
        let root = MapNode::new("api", None, true);
        let leaf = MapNode::new("id", Some("api"), false);
        db.insert_node(&root).await.unwrap();
        db.insert_node(&leaf).await.unwrap();
        assert_eq!(db.get_node("api").await.unwrap().unwrap(), root);
        let got = db.get_node("api/id").await.unwrap().unwrap();
        assert_eq!(got.parent_segment.as_deref(), Some("api"));
        assert_eq!(
            (got.data_field, got.target_dt, got.target_df, got.convert_method),
            (None, None, None, None)
        );

        let dt = DocType {
            name: "Note".into(),
            fields: vec![DocField {
                fieldname: "body".into(),
                fieldtype: "Text".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        db.upsert_doctype(&dt).await.unwrap();
        let got = db.get_doctype("Note").await.unwrap().unwrap();
        assert_eq!(got.autoname, None);
        assert_eq!((got.fields[0].label.clone(), got.fields[0].options.clone()), (None, None));
        assert_eq!(db.get_docfield("Note-body").await.unwrap().unwrap().parent, "Note");

        let doc = Document {
            doctype: "Note".into(),
            name: "n1".into(),
            parent: None,
            parenttype: None,
            parentfield: None,
            data: serde_json::Map::new(),
        };
        let mut conn = db.pool().acquire().await.unwrap();
        dao::upsert_document(&mut *conn, &doc).await.unwrap();
        assert_eq!(dao::get_document(&mut *conn, "Note", "n1").await.unwrap(), Some(doc.clone()));
        drop(conn);
        assert_eq!(dao::list_documents(db.pool(), "Note").await.unwrap(), vec![doc]);
    }

    #[test]
    fn sqlite_url_encodes_spaces() {
        let url = sqlite_url(std::path::Path::new("/tmp/my data/x.db"));
        assert_eq!(url, "sqlite:///tmp/my%20data/x.db?mode=rwc");
    }
}
