use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use crate::auth::Credentials;
use crate::client::ApiClient;
use crate::error::MigrateError;
use crate::storage::{require_node, Storage};
use crate::types::{MapNode, MapParam, ParamType};

/// Compiles map nodes into API urls and fetches their records.
///
/// A resolver lives for one request: compiled urls are memoised per node and
/// all fetches share the same credentials.
pub struct Resolver<'a> {
    store: &'a dyn Storage,
    client: &'a ApiClient,
    credentials: Option<&'a Credentials>,
    urls: Mutex<HashMap<String, Vec<String>>>,
    fetching: Mutex<HashSet<String>>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        store: &'a dyn Storage,
        client: &'a ApiClient,
        credentials: Option<&'a Credentials>,
    ) -> Self {
        Self {
            store,
            client,
            credentials,
            urls: Mutex::new(HashMap::new()),
            fetching: Mutex::new(HashSet::new()),
        }
    }

    /// All records behind a leaf node.
    pub fn get_all<'b>(&'b self, node: &'b MapNode) -> BoxFuture<'b, Result<Vec<Value>>> {
        async move {
            if node.is_group {
                return Err(MigrateError::validation(
                    "Please run get_all on a data field and not a URL segment",
                )
                .into());
            }
            if !self.lock_fetching().insert(node.name.clone()) {
                return Err(MigrateError::validation(format!(
                    "Circular data field reference through {}",
                    node.name
                ))
                .into());
            }
            let result = self.fetch(node).await;
            self.lock_fetching().remove(&node.name);
            result
        }
        .boxed()
    }

    async fn fetch(&self, node: &MapNode) -> Result<Vec<Value>> {
        let urls = self.get_urls(node).await?;
        let dict_key = match &node.parent_segment {
            Some(p) => Some(require_node(self.store, p).await?.segment_name),
            None => None,
        };
        let mut headers = self.header_params(node).await?;
        set_pair(&mut headers, "Accept", "application/json");
        tracing::info!(node = %node.name, urls = urls.len(), "fetching records");
        self.client.fetch_records(&urls, headers, dict_key.as_deref(), self.credentials).await
    }

    /// Full urls for `node`, built from its own segment (or query string for a
    /// leaf) up through every ancestor.
    pub async fn get_urls(&self, node: &MapNode) -> Result<Vec<String>> {
        if let Some(urls) = self.lock_urls().get(&node.name) {
            return Ok(urls.clone());
        }

        let mut urls = if node.is_group {
            self.add_url_segment(node, Vec::new()).await?
        } else {
            let query = self.url_query(node).await?;
            if query.is_empty() { Vec::new() } else { vec![format!("?{}", query)] }
        };
        let mut parent = node.parent_segment.clone();
        while let Some(name) = parent {
            let pnode = require_node(self.store, &name).await?;
            urls = self.add_url_segment(&pnode, urls).await?;
            parent = pnode.parent_segment;
        }

        self.lock_urls().insert(node.name.clone(), urls.clone());
        Ok(urls)
    }

    /// Prefix `node`'s segments onto every url. A node with a data field
    /// contributes one segment per distinct value of that field.
    pub async fn add_url_segment(&self, node: &MapNode, urls: Vec<String>) -> Result<Vec<String>> {
        let segments = match &node.data_field {
            Some(field) => {
                let reference = require_node(self.store, field).await?;
                let records = self.get_all(&reference).await?;
                distinct_values(&records, &reference.segment_name)
            }
            None => vec![node.segment_name.clone()],
        };
        Ok(prefix_urls(&segments, &urls))
    }

    /// Params set anywhere on the branch. A node with a parent inherits only
    /// its ancestors' params; later ancestors override earlier keys.
    pub async fn params(&self, node: &MapNode) -> Result<Vec<MapParam>> {
        let Some(first) = &node.parent_segment else {
            return self.store.get_params(&node.name).await;
        };
        let mut params = Vec::new();
        let mut parent = Some(first.clone());
        while let Some(name) = parent {
            let pnode = require_node(self.store, &name).await?;
            params.extend(self.store.get_params(&pnode.name).await?);
            parent = pnode.parent_segment;
        }
        Ok(params)
    }

    pub async fn url_query(&self, node: &MapNode) -> Result<String> {
        let pairs = merge_params(&self.params(node).await?, ParamType::UrlQuery);
        let mut ser = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &pairs {
            ser.append_pair(k, v);
        }
        Ok(ser.finish())
    }

    pub async fn header_params(&self, node: &MapNode) -> Result<Vec<(String, String)>> {
        Ok(merge_params(&self.params(node).await?, ParamType::Header))
    }

    fn lock_urls(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<String>>> {
        self.urls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_fetching(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.fetching.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Walk parents up to the root node of `node`'s tree.
pub async fn root_of(store: &dyn Storage, node: &MapNode) -> Result<MapNode> {
    let mut current = node.clone();
    while let Some(parent) = current.parent_segment.clone() {
        current = require_node(store, &parent).await?;
    }
    Ok(current)
}

pub fn prefix_urls(segments: &[String], urls: &[String]) -> Vec<String> {
    if urls.is_empty() {
        return segments.to_vec();
    }
    let mut out = Vec::with_capacity(segments.len() * urls.len());
    for seg in segments {
        for url in urls {
            if url.starts_with('?') {
                out.push(format!("{}{}", seg, url));
            } else {
                out.push(format!("{}/{}", seg, url));
            }
        }
    }
    out
}

/// Distinct values of `field` across records, in first-seen order.
fn distinct_values(records: &[Value], field: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for value in records.iter().filter_map(|r| r.get(field)) {
        let seg = match value {
            Value::Null => continue,
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if seen.insert(seg.clone()) {
            out.push(seg);
        }
    }
    out
}

fn merge_params(params: &[MapParam], kind: ParamType) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for p in params.iter().filter(|p| p.param_type == kind) {
        set_pair(&mut out, &p.key, &p.value);
    }
    out
}

fn set_pair(pairs: &mut Vec<(String, String)>, key: &str, value: &str) {
    match pairs.iter_mut().find(|(k, _)| k == key) {
        Some(pair) => pair.1 = value.to_string(),
        None => pairs.push((key.to_string(), value.to_string())),
    }
}
