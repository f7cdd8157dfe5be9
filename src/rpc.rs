use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::{AuthChallenge, Credentials};
use crate::error::MigrateError;
use crate::query::Filters;
use crate::RestMigrate;

/// Remote operations the tree and form call by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "list-children-of-node")]
    GetChildren,
    #[serde(rename = "create-node")]
    AddNode,
    #[serde(rename = "list-fields-of-schema")]
    DfList,
    #[serde(rename = "import-data")]
    ImportData,
    #[serde(rename = "get-data")]
    GetData,
}

impl Method {
    pub const ALL: [Method; 5] = [
        Method::GetChildren,
        Method::AddNode,
        Method::DfList,
        Method::ImportData,
        Method::GetData,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GetChildren => "list-children-of-node",
            Method::AddNode => "create-node",
            Method::DfList => "list-fields-of-schema",
            Method::ImportData => "import-data",
            Method::GetData => "get-data",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| MigrateError::validation(format!("Unknown method: {}", s)))
    }
}

/// Failure payload of a remote call.
///
/// `exc_type` names the exception kind and `exc` carries the message. For
/// authentication failures `challenge` holds the parsed `WWW-Authenticate`
/// header so callers need not inspect the message text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallFailure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exc_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<AuthChallenge>,
}

impl CallFailure {
    pub fn new(exc_type: Option<&str>, exc: Option<&str>) -> Self {
        Self {
            exc_type: exc_type.map(str::to_string),
            exc: exc.map(str::to_string),
            challenge: None,
        }
    }

    pub fn is_permission_error(&self) -> bool {
        self.exc_type.as_deref() == Some("PermissionError")
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.exc_type, &self.exc) {
            (Some(t), Some(e)) => write!(f, "{}: {}", t, e),
            (None, Some(e)) => f.write_str(e),
            (Some(t), None) => f.write_str(t),
            (None, None) => f.write_str("Server error"),
        }
    }
}

impl From<MigrateError> for CallFailure {
    fn from(e: MigrateError) -> Self {
        Self {
            exc_type: Some(e.exc_type().to_string()),
            exc: Some(e.to_string()),
            challenge: e.challenge().cloned(),
        }
    }
}

impl From<anyhow::Error> for CallFailure {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<MigrateError>() {
            Ok(e) => e.into(),
            Err(other) => {
                Self { exc_type: None, exc: Some(format!("{:#}", other)), challenge: None }
            }
        }
    }
}

/// Invokes remote operations by name.
#[async_trait]
pub trait RemoteCaller: Send + Sync {
    async fn call(&self, method: Method, args: Value) -> Result<Value, CallFailure>;
}

#[async_trait]
impl<T: RemoteCaller + ?Sized> RemoteCaller for Arc<T> {
    async fn call(&self, method: Method, args: Value) -> Result<Value, CallFailure> {
        (**self).call(method, args).await
    }
}

fn flag(v: Option<&Value>) -> Option<bool> {
    v.and_then(|v| match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_i64() != Some(0)),
        Value::String(s) => Some(matches!(s.as_str(), "true" | "1")),
        _ => None,
    })
}

fn str_arg<'v>(args: &'v Value, key: &str) -> Option<&'v str> {
    args.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn required<'v>(args: &'v Value, key: &str) -> Result<&'v str, MigrateError> {
    str_arg(args, key).ok_or_else(|| MigrateError::validation(format!("Missing argument: {}", key)))
}

/// Missing, null and `{}` all mean no credentials.
fn credentials_arg(args: &Value) -> Result<Option<Credentials>, MigrateError> {
    match args.get("credentials") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(m)) if m.is_empty() => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| MigrateError::validation(format!("Invalid credentials: {}", e))),
    }
}

#[async_trait]
impl RemoteCaller for RestMigrate {
    async fn call(&self, method: Method, args: Value) -> Result<Value, CallFailure> {
        tracing::debug!(%method, "remote call");
        match method {
            Method::GetChildren => {
                let rows =
                    self.get_children(str_arg(&args, "parent"), flag(args.get("is_root"))).await?;
                Ok(serde_json::to_value(rows).map_err(anyhow::Error::from)?)
            }
            Method::AddNode => {
                let segment = required(&args, "segment_name")?;
                let is_group = flag(args.get("is_group")).unwrap_or(false);
                let node = self.add_node(segment, is_group, str_arg(&args, "parent")).await?;
                Ok(json!(node.name))
            }
            Method::DfList => {
                let filters: Filters = match args.get("filters") {
                    Some(v) if !v.is_null() => serde_json::from_value(v.clone())
                        .map_err(|e| MigrateError::validation(format!("Invalid filters: {}", e)))?,
                    _ => Filters::new(),
                };
                let rows = self.df_list(&filters).await?;
                Ok(serde_json::to_value(rows).map_err(anyhow::Error::from)?)
            }
            Method::ImportData => {
                let name = required(&args, "name")?;
                let report = self.import_data(name, credentials_arg(&args)?.as_ref()).await?;
                tracing::info!(
                    node = name,
                    records = report.records,
                    documents = report.documents,
                    "import finished"
                );
                Ok(json!("Success"))
            }
            Method::GetData => {
                let name = required(&args, "name")?;
                let records = self.get_data(name, credentials_arg(&args)?.as_ref()).await?;
                Ok(Value::Array(records))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthScheme;

    #[test]
    fn method_names_round_trip() {
        for m in Method::ALL {
            assert_eq!(m.as_str().parse::<Method>().unwrap(), m);
            assert_eq!(serde_json::to_value(m).unwrap(), json!(m.as_str()));
        }
        assert!("get_children".parse::<Method>().is_err());
    }

    #[test]
    fn failures_carry_exception_tags() {
        let err = MigrateError::not_found("REST Integration Map", "x");
        let f: CallFailure = anyhow::Error::from(err).into();
        assert_eq!(f.exc_type.as_deref(), Some("DoesNotExistError"));
        assert_eq!(f.exc.as_deref(), Some("REST Integration Map x not found"));

        let f: CallFailure = anyhow::anyhow!("500 error for url: https://api.test").into();
        assert_eq!(f.exc_type, None);
        assert_eq!(f.exc.as_deref(), Some("500 error for url: https://api.test"));
    }

    #[test]
    fn auth_failures_keep_the_challenge() {
        let e = MigrateError::AuthRequired(AuthChallenge::parse("Digest realm=\"x\", nonce=\"n\""));
        let f: CallFailure = anyhow::Error::from(e).into();
        assert!(f.is_permission_error());
        assert_eq!(f.challenge.unwrap().scheme, AuthScheme::Digest);
    }

    #[test]
    fn empty_credentials_mean_none() {
        assert_eq!(credentials_arg(&json!({"credentials": {}})).unwrap(), None);
        assert_eq!(credentials_arg(&json!({})).unwrap(), None);
        let args = json!({"credentials": {"auth": "Basic", "username": "bob", "password": "x"}});
        let c = credentials_arg(&args).unwrap().unwrap();
        assert_eq!(c.username, "bob");
        assert!(credentials_arg(&json!({"credentials": {"username": 1}})).is_err());
    }

    #[test]
    fn flags_accept_strings() {
        assert_eq!(flag(Some(&json!("true"))), Some(true));
        assert_eq!(flag(Some(&json!(0))), Some(false));
        assert_eq!(flag(None), None);
    }
}
