//! Tree view wiring for the integration map: node listing and creation,
//! leaf toolbar actions and the credential retry around them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::auth::Credentials;
use crate::rpc::{CallFailure, Method, RemoteCaller};
use crate::types::{Notice, TreeNodeRow};
use crate::ROOT_NAME;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Data,
    Check,
    Password,
}

/// An input requested from the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptField {
    pub fieldname: String,
    pub label: String,
    pub fieldtype: FieldType,
    #[serde(default)]
    pub reqd: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PromptField {
    fn new(fieldname: &str, label: &str, fieldtype: FieldType) -> Self {
        Self {
            fieldname: fieldname.into(),
            label: label.into(),
            fieldtype,
            reqd: false,
            description: None,
        }
    }

    fn required(mut self) -> Self {
        self.reqd = true;
        self
    }

    fn describe(mut self, text: &str) -> Self {
        self.description = Some(text.into());
        self
    }
}

/// A node as the tree widget holds it. `label` is the node identifier;
/// `data` is the row the listing returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub label: String,
    #[serde(default)]
    pub expandable: bool,
    pub data: TreeNodeRow,
}

impl TreeNode {
    pub fn root() -> Self {
        Self::from(TreeNodeRow {
            value: ROOT_NAME.to_string(),
            label: None,
            expandable: Some(true),
        })
    }

    pub fn is_root(&self) -> bool {
        self.label == ROOT_NAME
    }
}

impl From<TreeNodeRow> for TreeNode {
    fn from(row: TreeNodeRow) -> Self {
        let expandable = row.expandable.unwrap_or(row.value == ROOT_NAME);
        Self { label: row.value.clone(), expandable, data: row }
    }
}

pub fn get_label(node: &TreeNode) -> &str {
    match node.data.label.as_deref() {
        Some(label) if !label.is_empty() => label,
        _ => &node.label,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolbarAction {
    ApiImport,
    ShowData,
}

impl ToolbarAction {
    pub const ALL: [ToolbarAction; 2] = [ToolbarAction::ApiImport, ToolbarAction::ShowData];

    pub fn label(&self) -> &'static str {
        match self {
            ToolbarAction::ApiImport => "API Import",
            ToolbarAction::ShowData => "Show Data",
        }
    }

    pub fn method(&self) -> Method {
        match self {
            ToolbarAction::ApiImport => Method::ImportData,
            ToolbarAction::ShowData => Method::GetData,
        }
    }

    /// Only leaves can be imported or shown.
    pub fn condition(&self, node: &TreeNode) -> bool {
        !node.expandable
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSettings {
    pub breadcrumb: String,
    pub get_tree_nodes: Method,
    pub add_tree_node: Method,
    pub fields: Vec<PromptField>,
    pub toolbar: Vec<ToolbarAction>,
}

impl Default for TreeSettings {
    fn default() -> Self {
        Self {
            breadcrumb: "REST Migrate".into(),
            get_tree_nodes: Method::GetChildren,
            add_tree_node: Method::AddNode,
            fields: vec![
                PromptField::new("segment_name", "New Segment Name", FieldType::Data)
                    .required()
                    .describe("URL segment (no leading or trailing slashes) or field name"),
                PromptField::new("is_group", "Is URL Path Segment", FieldType::Check)
                    .describe("Is a URL segment or API field name"),
            ],
            toolbar: ToolbarAction::ALL.to_vec(),
        }
    }
}

pub fn credential_fields() -> Vec<PromptField> {
    vec![
        PromptField::new("username", "Username", FieldType::Data),
        PromptField::new("password", "Password", FieldType::Password),
    ]
}

/// Prompts and notifications shown to the user.
#[async_trait]
pub trait DialogService: Send + Sync {
    /// Values keyed by fieldname, or `None` when the prompt is dismissed.
    async fn prompt(&self, fields: &[PromptField]) -> Option<BTreeMap<String, String>>;
    fn msgprint(&self, notice: Notice);
    /// Show a blocking error.
    fn throw(&self, message: &str);
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TerminalError {
    #[error("Unsupported authentication type: {0}")]
    UnsupportedAuth(String),
    #[error("Server error")]
    ServerError,
    #[error("Please provide credentials")]
    MissingCredentials,
    #[error("{0}")]
    Remote(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// Retry with credentials; `auth` is the challenge text to send back.
    NeedsCredentials { auth: String },
    Terminal(TerminalError),
}

/// Decide what a failed call leads to. A structured challenge decides the
/// scheme; without one the message is searched for "Basic" or "Digest".
pub fn classify(failure: &CallFailure) -> Classified {
    let detail = failure.exc.as_deref().filter(|e| !e.is_empty());
    if failure.is_permission_error() {
        let auth = detail
            .map(str::to_string)
            .or_else(|| failure.challenge.as_ref().map(|c| c.raw.clone()))
            .unwrap_or_default();
        let retryable = match &failure.challenge {
            Some(challenge) => challenge.scheme.accepts_credentials(),
            None => auth.contains("Basic") || auth.contains("Digest"),
        };
        return if retryable {
            Classified::NeedsCredentials { auth }
        } else {
            Classified::Terminal(TerminalError::UnsupportedAuth(auth))
        };
    }
    match detail {
        None => Classified::Terminal(TerminalError::ServerError),
        Some(exc) => Classified::Terminal(TerminalError::Remote(exc.to_string())),
    }
}

/// States of one toolbar action. At most one credential prompt and one
/// retry happen per action; `Retried` is final whatever its outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryState {
    Initial,
    Success(Value),
    Failure(CallFailure),
    AwaitingCredentials { auth: String },
    Retrying(Credentials),
    Retried(Result<Value, CallFailure>),
    Cancelled,
    TerminalError(TerminalError),
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RetryState::Success(_)
                | RetryState::Retried(_)
                | RetryState::Cancelled
                | RetryState::TerminalError(_)
        )
    }
}

pub struct TreeController<C, D> {
    caller: C,
    dialogs: D,
    settings: TreeSettings,
}

impl<C: RemoteCaller, D: DialogService> TreeController<C, D> {
    pub fn new(caller: C, dialogs: D) -> Self {
        Self { caller, dialogs, settings: TreeSettings::default() }
    }

    pub fn settings(&self) -> &TreeSettings {
        &self.settings
    }

    pub fn dialogs(&self) -> &D {
        &self.dialogs
    }

    /// Actions shown for `node`.
    pub fn toolbar(&self, node: &TreeNode) -> Vec<ToolbarAction> {
        self.settings.toolbar.iter().copied().filter(|a| a.condition(node)).collect()
    }

    /// Children of `parent`; `None` lists the top of the tree.
    pub async fn load_children(
        &self,
        parent: Option<&TreeNode>,
    ) -> Result<Vec<TreeNode>, CallFailure> {
        let args = match parent {
            None => json!({}),
            Some(p) if p.is_root() => json!({"parent": p.label, "is_root": true}),
            Some(p) => json!({"parent": p.label}),
        };
        let value = self.caller.call(self.settings.get_tree_nodes, args).await?;
        let rows: Vec<TreeNodeRow> = serde_json::from_value(value)
            .map_err(|e| CallFailure::new(None, Some(&format!("Invalid tree nodes: {}", e))))?;
        Ok(rows.into_iter().map(TreeNode::from).collect())
    }

    /// Create a node under `parent` from the new-node dialog values.
    pub async fn add_node(
        &self,
        parent: &TreeNode,
        values: &BTreeMap<String, String>,
    ) -> Result<Value, CallFailure> {
        let missing: Vec<&str> = self
            .settings
            .fields
            .iter()
            .filter(|f| f.reqd && values.get(&f.fieldname).map_or(true, |v| v.trim().is_empty()))
            .map(|f| f.label.as_str())
            .collect();
        if !missing.is_empty() {
            let message = format!("Missing Values Required: {}", missing.join(", "));
            self.dialogs.throw(&message);
            return Err(CallFailure::new(Some("ValidationError"), Some(&message)));
        }
        let is_group = values.get("is_group").map_or(false, |v| matches!(v.as_str(), "1" | "true"));
        let args = json!({
            "segment_name": values.get("segment_name"),
            "is_group": is_group,
            "parent": parent.label,
            "is_root": parent.is_root(),
        });
        self.caller.call(self.settings.add_tree_node, args).await
    }

    /// Run a toolbar action on `node` to completion.
    pub async fn click(&self, action: ToolbarAction, node: &TreeNode) -> RetryState {
        if !action.condition(node) {
            tracing::debug!(action = action.label(), node = %node.label, "action not available");
            return RetryState::Cancelled;
        }
        let method = action.method();
        let name = node.label.clone();
        let mut state = RetryState::Initial;
        loop {
            tracing::trace!(?state, %method, "retry state");
            state = match state {
                RetryState::Initial => match self.caller.call(method, json!({"name": name})).await {
                    Ok(v) => RetryState::Success(v),
                    Err(f) => RetryState::Failure(f),
                },
                RetryState::Success(v) => {
                    self.on_success(action, &v);
                    return RetryState::Success(v);
                }
                RetryState::Failure(f) => match classify(&f) {
                    Classified::NeedsCredentials { auth } => {
                        RetryState::AwaitingCredentials { auth }
                    }
                    Classified::Terminal(t) => RetryState::TerminalError(t),
                },
                RetryState::AwaitingCredentials { auth } => {
                    match self.dialogs.prompt(&credential_fields()).await {
                        None => RetryState::Cancelled,
                        Some(mut values) => {
                            let username = values.remove("username").unwrap_or_default();
                            if username.is_empty() {
                                RetryState::TerminalError(TerminalError::MissingCredentials)
                            } else {
                                let password = values.remove("password").unwrap_or_default();
                                RetryState::Retrying(Credentials { auth, username, password })
                            }
                        }
                    }
                }
                RetryState::Retrying(credentials) => {
                    let args = json!({"name": name, "credentials": credentials});
                    RetryState::Retried(self.caller.call(method, args).await)
                }
                RetryState::Retried(result) => {
                    match &result {
                        Ok(v) => self.on_success(action, v),
                        Err(f) => {
                            let exc = f.exc.as_deref().filter(|e| !e.is_empty());
                            self.dialogs.throw(exc.unwrap_or("Server error"));
                        }
                    }
                    return RetryState::Retried(result);
                }
                RetryState::Cancelled => return RetryState::Cancelled,
                RetryState::TerminalError(t) => {
                    self.dialogs.throw(&t.to_string());
                    return RetryState::TerminalError(t);
                }
            };
        }
    }

    fn on_success(&self, action: ToolbarAction, payload: &Value) {
        if action == ToolbarAction::ShowData {
            let message =
                serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string());
            self.dialogs.msgprint(Notice::green("Show Data", message));
        }
    }
}
