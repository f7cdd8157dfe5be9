use std::collections::BTreeMap;
use std::fmt;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::MigrateError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthScheme {
    Basic,
    Digest,
    Bearer,
    OAuth,
    Other(String),
}

impl AuthScheme {
    fn from_token(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "basic" => AuthScheme::Basic,
            "digest" => AuthScheme::Digest,
            "bearer" => AuthScheme::Bearer,
            "oauth" => AuthScheme::OAuth,
            _ => AuthScheme::Other(token.to_string()),
        }
    }

    /// Schemes a user can satisfy with a username and password.
    pub fn accepts_credentials(&self) -> bool {
        matches!(self, AuthScheme::Basic | AuthScheme::Digest)
    }

    pub fn is_token(&self) -> bool {
        matches!(self, AuthScheme::Bearer | AuthScheme::OAuth)
    }
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub scheme: AuthScheme,
    pub realm: Option<String>,
    /// Lower-cased auth-param names to unquoted values.
    pub params: BTreeMap<String, String>,
    pub raw: String,
}

impl AuthChallenge {
    /// Parse the first challenge of a header value. Unknown schemes are kept
    /// as `AuthScheme::Other`.
    pub fn parse(header: &str) -> Self {
        let raw = header.trim().to_string();
        let (scheme, rest) = match raw.split_once(char::is_whitespace) {
            Some((s, r)) => (s, r),
            None => (raw.as_str(), ""),
        };
        let params = parse_auth_params(rest);
        Self {
            scheme: AuthScheme::from_token(scheme),
            realm: params.get("realm").cloned(),
            params,
            raw: raw.clone(),
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

fn parse_auth_params(input: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let mut chars = input.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.is_empty() && chars.peek().is_none() {
            break;
        }
        if chars.peek() != Some(&'=') {
            // token68 or stray token; nothing to record
            chars.next();
            if chars.peek().is_none() {
                break;
            }
            continue;
        }
        chars.next();
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
            value = value.trim().to_string();
        }
        out.insert(key.trim().to_ascii_lowercase(), value);
    }
    out
}

/// Credentials supplied by the user after an authentication challenge.
/// `auth` carries the challenge text the server sent.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub auth: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("auth", &self.auth)
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialScheme {
    Basic,
    Digest,
}

impl Credentials {
    pub fn scheme(&self) -> Result<CredentialScheme, MigrateError> {
        if self.auth.starts_with("Basic") {
            Ok(CredentialScheme::Basic)
        } else if self.auth.starts_with("Digest") {
            Ok(CredentialScheme::Digest)
        } else {
            Err(MigrateError::validation(format!("Unsupported authentication type: {}", self.auth)))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl DigestAlgorithm {
    fn parse(name: Option<&str>) -> Result<Self, MigrateError> {
        match name.map(|s| s.to_ascii_uppercase()).as_deref() {
            None | Some("MD5") => Ok(DigestAlgorithm::Md5),
            Some("MD5-SESS") => Ok(DigestAlgorithm::Md5Sess),
            Some("SHA-256") => Ok(DigestAlgorithm::Sha256),
            Some("SHA-256-SESS") => Ok(DigestAlgorithm::Sha256Sess),
            Some(other) => Err(MigrateError::validation(format!(
                "Unsupported digest algorithm: {}",
                other
            ))),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Md5Sess => "MD5-sess",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha256Sess => "SHA-256-sess",
        }
    }

    fn is_session(&self) -> bool {
        matches!(self, DigestAlgorithm::Md5Sess | DigestAlgorithm::Sha256Sess)
    }

    fn hash(&self, data: &str) -> String {
        match self {
            DigestAlgorithm::Md5 | DigestAlgorithm::Md5Sess => {
                format!("{:x}", Md5::digest(data.as_bytes()))
            }
            DigestAlgorithm::Sha256 | DigestAlgorithm::Sha256Sess => {
                format!("{:x}", Sha256::digest(data.as_bytes()))
            }
        }
    }
}

/// HTTP Digest state for one session. The nonce count grows with every
/// request signed against the same nonce.
#[derive(Clone)]
pub struct DigestAuth {
    username: String,
    password: String,
    realm: String,
    nonce: String,
    opaque: Option<String>,
    algorithm: DigestAlgorithm,
    qop: Option<String>,
    nc: u32,
}

impl fmt::Debug for DigestAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestAuth")
            .field("username", &self.username)
            .field("realm", &self.realm)
            .field("algorithm", &self.algorithm)
            .field("nc", &self.nc)
            .finish()
    }
}

impl DigestAuth {
    pub fn from_challenge(
        challenge: &AuthChallenge,
        username: &str,
        password: &str,
    ) -> Result<Self, MigrateError> {
        if challenge.scheme != AuthScheme::Digest {
            return Err(MigrateError::validation(format!(
                "Expected a Digest challenge, got: {}",
                challenge.raw
            )));
        }
        let nonce = challenge
            .param("nonce")
            .ok_or_else(|| MigrateError::validation("Digest challenge without nonce"))?;
        let qop = match challenge.param("qop") {
            None => None,
            Some(list) => {
                if list.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")) {
                    Some("auth".to_string())
                } else {
                    return Err(MigrateError::validation(format!(
                        "Unsupported digest qop: {}",
                        list
                    )));
                }
            }
        };
        Ok(Self {
            username: username.to_string(),
            password: password.to_string(),
            realm: challenge.realm.clone().unwrap_or_default(),
            nonce: nonce.to_string(),
            opaque: challenge.param("opaque").map(str::to_string),
            algorithm: DigestAlgorithm::parse(challenge.param("algorithm"))?,
            qop,
            nc: 0,
        })
    }

    /// `Authorization` header value for `method` on `uri` (path and query).
    pub fn authorization(&mut self, method: &str, uri: &str) -> String {
        let cnonce = uuid::Uuid::new_v4().simple().to_string()[..16].to_string();
        self.authorization_with_cnonce(method, uri, &cnonce)
    }

    pub(crate) fn authorization_with_cnonce(
        &mut self,
        method: &str,
        uri: &str,
        cnonce: &str,
    ) -> String {
        self.nc += 1;
        let nc = format!("{:08x}", self.nc);
        let alg = self.algorithm;

        let mut ha1 = alg.hash(&format!("{}:{}:{}", self.username, self.realm, self.password));
        if alg.is_session() {
            ha1 = alg.hash(&format!("{}:{}:{}", ha1, self.nonce, cnonce));
        }
        let ha2 = alg.hash(&format!("{}:{}", method, uri));
        let response = match &self.qop {
            Some(qop) => alg.hash(&format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, self.nonce, nc, cnonce, qop, ha2
            )),
            None => alg.hash(&format!("{}:{}:{}", ha1, self.nonce, ha2)),
        };

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm={}, response=\"{}\"",
            self.username, self.realm, self.nonce, uri, alg.as_str(), response
        );
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        if let Some(qop) = &self.qop {
            header.push_str(&format!(", qop={}, nc={}, cnonce=\"{}\"", qop, nc, cnonce));
        }
        header
    }
}
