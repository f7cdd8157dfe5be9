use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::auth::{AuthChallenge, CredentialScheme, Credentials, DigestAuth};
use crate::config::{HttpSettings, Settings};
use crate::error::MigrateError;

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    /// Lower-cased header names.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// How a single request is authenticated.
#[derive(Clone, PartialEq, Eq)]
pub enum RequestAuth {
    None,
    Basic { username: String, password: String },
    Bearer(String),
    /// A precomputed `Authorization` header value.
    Authorization(String),
}

impl std::fmt::Debug for RequestAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestAuth::None => write!(f, "None"),
            RequestAuth::Basic { username, .. } => write!(f, "Basic({})", username),
            RequestAuth::Bearer(_) => write!(f, "Bearer"),
            RequestAuth::Authorization(_) => write!(f, "Authorization"),
        }
    }
}

/// Minimal HTTP GET capability used by the fetcher.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        auth: &RequestAuth,
    ) -> Result<HttpResponse>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(settings: &HttpSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        auth: &RequestAuth,
    ) -> Result<HttpResponse> {
        let mut req = self.client.get(url);
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req = match auth {
            RequestAuth::None => req,
            RequestAuth::Basic { username, password } => req.basic_auth(username, Some(password)),
            RequestAuth::Bearer(token) => req.bearer_auth(token),
            RequestAuth::Authorization(value) => {
                req.header(reqwest::header::AUTHORIZATION, value.as_str())
            }
        };
        let resp = req.send().await.with_context(|| format!("GET {}", url))?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str().ok().map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = resp.bytes().await?.to_vec();
        Ok(HttpResponse { status, headers, body })
    }
}

/// Fetches JSON records from compiled API urls.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    settings: Arc<Settings>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, settings: Arc<Settings>) -> Self {
        Self { transport, settings }
    }

    pub fn from_settings(settings: Arc<Settings>) -> Result<Self> {
        let transport = ReqwestTransport::new(&settings.http)?;
        Ok(Self::new(Arc::new(transport), settings))
    }

    /// GET every url in one session and collect the records. Object responses
    /// contribute `response[dict_key]`, array responses their items.
    pub async fn fetch_records(
        &self,
        urls: &[String],
        headers: Vec<(String, String)>,
        dict_key: Option<&str>,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<Value>> {
        let mut session = Session::new(self, headers, credentials);
        let mut results = Vec::new();
        for url in urls {
            let resp = session.get(url).await?;
            if !resp.is_success() {
                return Err(anyhow!("{} error for url: {}", resp.status, url));
            }
            let content = resp.header("content-type").unwrap_or_default().to_ascii_lowercase();
            if !content.contains("json") {
                return Err(
                    MigrateError::validation(format!("Unknown content type: {}", content)).into()
                );
            }
            let body: Value = serde_json::from_slice(&resp.body)
                .with_context(|| format!("decoding JSON from {}", url))?;
            match body {
                Value::Array(items) => results.extend(items),
                Value::Object(mut map) => {
                    let key = dict_key.unwrap_or_default();
                    match map.remove(key) {
                        Some(Value::Array(items)) => results.extend(items),
                        Some(other) => results.push(other),
                        None => {
                            return Err(MigrateError::validation(format!(
                                "Response from {} has no '{}' key",
                                url, key
                            ))
                            .into())
                        }
                    }
                }
                other => results.push(other),
            }
            tracing::debug!(%url, total = results.len(), "fetched");
        }
        Ok(results)
    }
}

enum SessionAuth {
    Pending,
    Anonymous,
    Basic { username: String, password: String },
    Digest(DigestAuth),
    Bearer(String),
}

/// Authentication is settled on the first request and reused afterwards.
struct Session<'a> {
    client: &'a ApiClient,
    headers: Vec<(String, String)>,
    credentials: Option<&'a Credentials>,
    auth: SessionAuth,
}

impl<'a> Session<'a> {
    fn new(
        client: &'a ApiClient,
        headers: Vec<(String, String)>,
        credentials: Option<&'a Credentials>,
    ) -> Self {
        Self { client, headers, credentials, auth: SessionAuth::Pending }
    }

    async fn send(&self, url: &str, auth: &RequestAuth) -> Result<HttpResponse> {
        self.client.transport.get(url, &self.headers, auth).await
    }

    async fn get(&mut self, url: &str) -> Result<HttpResponse> {
        if matches!(self.auth, SessionAuth::Pending) {
            return self.first_get(url).await;
        }
        let auth = match &mut self.auth {
            SessionAuth::Pending | SessionAuth::Anonymous => RequestAuth::None,
            SessionAuth::Basic { username, password } => {
                RequestAuth::Basic { username: username.clone(), password: password.clone() }
            }
            SessionAuth::Digest(digest) => {
                RequestAuth::Authorization(digest.authorization("GET", &request_uri(url)?))
            }
            SessionAuth::Bearer(token) => RequestAuth::Bearer(token.clone()),
        };
        self.send(url, &auth).await
    }

    async fn first_get(&mut self, url: &str) -> Result<HttpResponse> {
        if let Some(creds) = self.credentials {
            return match creds.scheme()? {
                CredentialScheme::Basic => {
                    let auth = RequestAuth::Basic {
                        username: creds.username.clone(),
                        password: creds.password.clone(),
                    };
                    let resp = self.send(url, &auth).await?;
                    self.auth = SessionAuth::Basic {
                        username: creds.username.clone(),
                        password: creds.password.clone(),
                    };
                    Ok(resp)
                }
                CredentialScheme::Digest => {
                    let resp = self.send(url, &RequestAuth::None).await?;
                    match challenge_of(&resp) {
                        Some(ch) if resp.status == 401 => {
                            let mut digest =
                                DigestAuth::from_challenge(&ch, &creds.username, &creds.password)?;
                            let header = digest.authorization("GET", &request_uri(url)?);
                            let resp = self.send(url, &RequestAuth::Authorization(header)).await?;
                            self.auth = SessionAuth::Digest(digest);
                            Ok(resp)
                        }
                        _ => {
                            self.auth = SessionAuth::Anonymous;
                            Ok(resp)
                        }
                    }
                }
            };
        }

        let resp = self.send(url, &RequestAuth::None).await?;
        if resp.status != 401 {
            self.auth = SessionAuth::Anonymous;
            return Ok(resp);
        }
        let Some(challenge) = challenge_of(&resp) else {
            return Err(MigrateError::Permission(format!(
                "401 Unauthorized without a challenge for url: {}",
                url
            ))
            .into());
        };
        if challenge.scheme.is_token() {
            let host = Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_default();
            let token = self
                .client
                .settings
                .oauth_token_for(&host)
                .ok_or_else(|| {
                    MigrateError::validation(format!("Provider {} not configured for OAuth", host))
                })?
                .to_string();
            let resp = self.send(url, &RequestAuth::Bearer(token.clone())).await?;
            self.auth = SessionAuth::Bearer(token);
            return Ok(resp);
        }
        // Let the caller collect credentials from the user
        tracing::info!(%url, scheme = ?challenge.scheme, "authentication required");
        Err(MigrateError::AuthRequired(challenge).into())
    }
}

fn challenge_of(resp: &HttpResponse) -> Option<AuthChallenge> {
    resp.header("www-authenticate").map(AuthChallenge::parse)
}

fn request_uri(url: &str) -> Result<String> {
    let u = Url::parse(url).with_context(|| format!("invalid url: {}", url))?;
    Ok(match u.query() {
        Some(q) => format!("{}?{}", u.path(), q),
        None => u.path().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthScheme;
    use crate::config::OAuthProvider;
    use crate::testing::{json_response, FakeTransport};
    use serde_json::json;

    fn client(fake: &Arc<FakeTransport>, settings: Settings) -> ApiClient {
        ApiClient::new(fake.clone(), Arc::new(settings))
    }

    #[tokio::test]
    async fn collects_arrays_and_dict_keys() {
        let fake = Arc::new(FakeTransport::default());
        fake.respond("https://api.test/a", json_response(json!([{"id": 1}, {"id": 2}])));
        fake.respond(
            "https://api.test/b",
            json_response(json!({"users": [{"id": 3}], "next": null})),
        );
        let c = client(&fake, Settings::default());
        let urls = vec!["https://api.test/a".to_string(), "https://api.test/b".to_string()];
        let records = c.fetch_records(&urls, vec![], Some("users"), None).await.unwrap();
        assert_eq!(records, vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})]);
    }

    #[tokio::test]
    async fn unknown_content_type_is_rejected() {
        let fake = Arc::new(FakeTransport::default());
        let mut resp = json_response(json!([]));
        resp.headers.insert("content-type".into(), "text/html".into());
        fake.respond("https://api.test/a", resp);
        let c = client(&fake, Settings::default());
        let urls = ["https://api.test/a".to_string()];
        let err = c.fetch_records(&urls, vec![], None, None).await.unwrap_err();
        assert_eq!(err.to_string(), "Unknown content type: text/html");
    }

    #[tokio::test]
    async fn basic_challenge_becomes_auth_required() {
        let fake = Arc::new(FakeTransport::default());
        fake.respond("https://api.test/a", FakeTransport::challenge("Basic realm=\"api\""));
        let c = client(&fake, Settings::default());
        let urls = ["https://api.test/a".to_string()];
        let err = c.fetch_records(&urls, vec![], None, None).await.unwrap_err();
        let e = err.downcast_ref::<MigrateError>().unwrap();
        assert_eq!(e.exc_type(), "PermissionError");
        assert_eq!(e.challenge().unwrap().scheme, AuthScheme::Basic);
        assert_eq!(e.to_string(), "Basic realm=\"api\"");
    }

    #[tokio::test]
    async fn basic_credentials_are_reused_for_the_session() {
        let fake = Arc::new(FakeTransport::default());
        fake.respond("https://api.test/a", json_response(json!([1])));
        fake.respond("https://api.test/b", json_response(json!([2])));
        let c = client(&fake, Settings::default());
        let creds = Credentials {
            auth: "Basic realm=\"api\"".into(),
            username: "bob".into(),
            password: "x".into(),
        };
        let urls = vec!["https://api.test/a".to_string(), "https://api.test/b".to_string()];
        c.fetch_records(&urls, vec![], None, Some(&creds)).await.unwrap();
        let auths: Vec<RequestAuth> = fake.requests().into_iter().map(|(_, a)| a).collect();
        let basic = RequestAuth::Basic { username: "bob".into(), password: "x".into() };
        assert_eq!(auths, vec![basic.clone(), basic]);
    }

    #[tokio::test]
    async fn digest_answers_the_challenge() {
        let fake = Arc::new(FakeTransport::default());
        fake.respond_unauthenticated(
            "https://api.test/a?page=1",
            FakeTransport::challenge(r#"Digest realm="api", nonce="abc", qop="auth""#),
        );
        fake.respond("https://api.test/a?page=1", json_response(json!([1])));
        let c = client(&fake, Settings::default());
        let creds = Credentials {
            auth: "Digest realm=\"api\"".into(),
            username: "bob".into(),
            password: "x".into(),
        };
        let urls = ["https://api.test/a?page=1".to_string()];
        let records = c.fetch_records(&urls, vec![], None, Some(&creds)).await.unwrap();
        assert_eq!(records, vec![json!(1)]);
        let reqs = fake.requests();
        assert_eq!(reqs.len(), 2);
        match &reqs[1].1 {
            RequestAuth::Authorization(h) => {
                assert!(h.starts_with("Digest username=\"bob\""));
                assert!(h.contains("uri=\"/a?page=1\""));
            }
            other => panic!("unexpected auth {:?}", other),
        }
    }

    #[tokio::test]
    async fn unsupported_credentials_fail_before_requesting() {
        let fake = Arc::new(FakeTransport::default());
        let c = client(&fake, Settings::default());
        let creds =
            Credentials { auth: "NTLM".into(), username: "bob".into(), password: "x".into() };
        let urls = ["https://api.test/a".to_string()];
        let err = c.fetch_records(&urls, vec![], None, Some(&creds)).await.unwrap_err();
        assert_eq!(err.to_string(), "Unsupported authentication type: NTLM");
        assert!(fake.requests().is_empty());
    }

    #[tokio::test]
    async fn bearer_challenge_uses_configured_token() {
        let fake = Arc::new(FakeTransport::default());
        fake.respond_unauthenticated(
            "https://api.test/a",
            FakeTransport::challenge("Bearer realm=\"api\""),
        );
        fake.respond("https://api.test/a", json_response(json!([1])));
        let settings = Settings {
            oauth: vec![OAuthProvider { host: "api.test".into(), access_token: "tok".into() }],
            ..Default::default()
        };
        let c = client(&fake, settings);
        c.fetch_records(&["https://api.test/a".to_string()], vec![], None, None).await.unwrap();
        assert_eq!(fake.requests()[1].1, RequestAuth::Bearer("tok".into()));
    }

    #[tokio::test]
    async fn bearer_challenge_without_provider_fails() {
        let fake = Arc::new(FakeTransport::default());
        fake.respond("https://api.test/a", FakeTransport::challenge("OAuth realm=\"api\""));
        let c = client(&fake, Settings::default());
        let urls = ["https://api.test/a".to_string()];
        let err = c.fetch_records(&urls, vec![], None, None).await.unwrap_err();
        assert_eq!(err.to_string(), "Provider api.test not configured for OAuth");
    }
}
