use anyhow::Result;
use async_trait::async_trait;

use crate::error::MigrateError;
use crate::query::Filters;
use crate::types::{DocField, DocType, MapNode, MapParam};

/// Persistence for the integration map and the target schema.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Option<MapNode>>;
    /// Nodes matching `filters`, ordered by segment name.
    async fn list_nodes(&self, filters: &Filters) -> Result<Vec<MapNode>>;
    async fn insert_node(&self, node: &MapNode) -> Result<()>;
    async fn update_node(&self, node: &MapNode) -> Result<()>;
    async fn delete_node(&self, name: &str) -> Result<u64>;

    async fn get_params(&self, name: &str) -> Result<Vec<MapParam>>;
    async fn set_params(&self, name: &str, params: &[MapParam]) -> Result<()>;

    async fn upsert_doctype(&self, doctype: &DocType) -> Result<()>;
    async fn get_doctype(&self, name: &str) -> Result<Option<DocType>>;
    async fn get_docfield(&self, name: &str) -> Result<Option<DocField>>;
    async fn list_docfields(&self, filters: &Filters) -> Result<Vec<DocField>>;
}

/// Fetch a node or fail with `DoesNotExistError`.
pub async fn require_node(store: &dyn Storage, name: &str) -> Result<MapNode> {
    match store.get_node(name).await? {
        Some(n) => Ok(n),
        None => Err(MigrateError::not_found("REST Integration Map", name).into()),
    }
}
