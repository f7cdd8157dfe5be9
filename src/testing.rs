//! Fakes shared by the unit tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::client::{HttpResponse, RequestAuth, Transport};
use crate::config::Settings;
use crate::db::{sqlite_url, Database};
use crate::RestMigrate;

pub async fn temp_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::connect(Some(&sqlite_url(&dir.path().join("test.db")))).await.unwrap();
    db.run_migrations().await.unwrap();
    (dir, db)
}

/// A migrated app on a fresh database that fetches through `fake`.
pub async fn app(fake: Arc<FakeTransport>) -> (tempfile::TempDir, RestMigrate) {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        database_url: Some(sqlite_url(&dir.path().join("test.db"))),
        ..Default::default()
    };
    let rm = RestMigrate::with_transport(settings, fake, true).await.unwrap();
    (dir, rm)
}

pub fn json_response(body: Value) -> HttpResponse {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json; charset=utf-8".to_string());
    HttpResponse { status: 200, headers, body: serde_json::to_vec(&body).unwrap() }
}

struct Route {
    url: String,
    anonymous_only: bool,
    response: HttpResponse,
}

struct Request {
    url: String,
    headers: Vec<(String, String)>,
    auth: RequestAuth,
}

/// Canned responses keyed by url. Unknown urls answer 404.
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<Vec<Route>>,
    log: Mutex<Vec<Request>>,
}

impl FakeTransport {
    pub fn respond(&self, url: &str, response: HttpResponse) {
        let route = Route { url: url.to_string(), anonymous_only: false, response };
        self.routes.lock().unwrap().push(route);
    }

    /// Response served only to requests that carry no authentication.
    pub fn respond_unauthenticated(&self, url: &str, response: HttpResponse) {
        let route = Route { url: url.to_string(), anonymous_only: true, response };
        self.routes.lock().unwrap().push(route);
    }

    pub fn challenge(header: &str) -> HttpResponse {
        let mut headers = BTreeMap::new();
        headers.insert("www-authenticate".to_string(), header.to_string());
        headers.insert("content-type".to_string(), "text/html".to_string());
        HttpResponse { status: 401, headers, body: b"Unauthorized".to_vec() }
    }

    pub fn requests(&self) -> Vec<(String, RequestAuth)> {
        self.log.lock().unwrap().iter().map(|r| (r.url.clone(), r.auth.clone())).collect()
    }

    pub fn headers(&self, index: usize) -> Vec<(String, String)> {
        self.log.lock().unwrap()[index].headers.clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        auth: &RequestAuth,
    ) -> Result<HttpResponse> {
        let request =
            Request { url: url.to_string(), headers: headers.to_vec(), auth: auth.clone() };
        self.log.lock().unwrap().push(request);
        let routes = self.routes.lock().unwrap();
        let anonymous = *auth == RequestAuth::None;
        let found = routes
            .iter()
            .find(|r| r.url == url && anonymous && r.anonymous_only)
            .or_else(|| routes.iter().find(|r| r.url == url && !r.anonymous_only));
        Ok(match found {
            Some(r) => r.response.clone(),
            None => HttpResponse { status: 404, ..Default::default() },
        })
    }
}
