#![forbid(unsafe_code)]

//! Bearer credential for the Data API.
//!
//! The token cache is the authorized-user JSON written by Google's client
//! libraries (`token.json`). A cached access token is used while it is
//! fresh; otherwise the refresh token is exchanged for a new one and the
//! cache is rewritten in place. Obtaining the first refresh token (the
//! browser consent flow) happens outside this crate.

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const CLIENT_SECRET_FILE: &str = "client_secret.json";
/// Treat tokens this close to expiry as already expired.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenCache {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
    /// Fields we do not interpret are written back untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TokenCache {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading token cache {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(parent)
            .with_context(|| format!("creating temp file in {}", parent.display()))?;
        tmp.write_all(&serde_json::to_vec(self)?)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    /// A token without an expiry is assumed valid, matching the Google
    /// client libraries.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        if self.token.as_deref().is_none_or(str::is_empty) {
            return false;
        }
        match self.expiry.as_deref().map(DateTime::parse_from_rfc3339) {
            None => true,
            Some(Ok(expiry)) => {
                expiry.with_timezone(&Utc) > now + ChronoDuration::seconds(EXPIRY_SKEW_SECS)
            }
            Some(Err(_)) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSecret {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientSecretFile {
    installed: Option<ClientSecret>,
    web: Option<ClientSecret>,
}

/// `client_secret.json` first, then the first `client_secret_*.json` in
/// lexical order.
pub fn find_client_secret_file(dir: &Path) -> Option<PathBuf> {
    let generic = dir.join(CLIENT_SECRET_FILE);
    if generic.exists() {
        return Some(generic);
    }
    let mut matches: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("client_secret_") && name.ends_with(".json"))
        })
        .collect();
    matches.sort();
    matches.into_iter().next()
}

pub fn load_client_secret(path: &Path) -> Result<ClientSecret> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: ClientSecretFile =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    parsed
        .installed
        .or(parsed.web)
        .ok_or_else(|| anyhow!("{} has neither an installed nor a web client", path.display()))
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Exchanges a refresh token for a new access token.
pub trait TokenRefresher {
    fn refresh(
        &self,
        token_uri: &str,
        client: &ClientSecret,
        refresh_token: &str,
    ) -> Result<(String, Option<i64>)>;
}

/// Form-encoded `refresh_token` grant over ureq.
pub struct HttpRefresher {
    agent: ureq::Agent,
}

impl HttpRefresher {
    pub fn new(agent: ureq::Agent) -> Self {
        Self { agent }
    }
}

impl TokenRefresher for HttpRefresher {
    fn refresh(
        &self,
        token_uri: &str,
        client: &ClientSecret,
        refresh_token: &str,
    ) -> Result<(String, Option<i64>)> {
        let response = self
            .agent
            .post(token_uri)
            .send_form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", client.client_id.as_str()),
                ("client_secret", client.client_secret.as_str()),
            ])
            .map_err(|err| match err {
                ureq::Error::Status(code, response) => anyhow!(
                    "token endpoint returned {code}: {}",
                    response.into_string().unwrap_or_default()
                ),
                other => anyhow!(other).context("contacting token endpoint"),
            })?;
        let parsed: RefreshResponse = response
            .into_json()
            .context("decoding token endpoint response")?;
        Ok((parsed.access_token, parsed.expires_in))
    }
}

/// Returns a usable access token, refreshing and rewriting the cache at
/// `token_path` when needed. Any failure here is fatal for the run.
pub fn access_token(
    token_path: &Path,
    secrets_dir: &Path,
    refresher: &dyn TokenRefresher,
    now: DateTime<Utc>,
) -> Result<String> {
    if !token_path.exists() {
        bail!(
            "no token cache at {}; authorize the account first",
            token_path.display()
        );
    }
    let mut cache = TokenCache::load(token_path)?;
    if cache.is_fresh(now)
        && let Some(token) = &cache.token
    {
        debug!("using cached access token");
        return Ok(token.clone());
    }

    let refresh_token = cache
        .refresh_token
        .clone()
        .filter(|token| !token.is_empty())
        .ok_or_else(|| anyhow!("access token expired and no refresh token is cached"))?;
    let client = match (&cache.client_id, &cache.client_secret) {
        (Some(id), Some(secret)) => ClientSecret {
            client_id: id.clone(),
            client_secret: secret.clone(),
            token_uri: cache.token_uri.clone(),
        },
        _ => {
            let path = find_client_secret_file(secrets_dir).ok_or_else(|| {
                anyhow!(
                    "no client credentials in token cache and no client_secret*.json in {}",
                    secrets_dir.display()
                )
            })?;
            load_client_secret(&path)?
        }
    };
    let token_uri = cache
        .token_uri
        .clone()
        .or_else(|| client.token_uri.clone())
        .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string());

    info!("refreshing access token");
    let (token, expires_in) = refresher
        .refresh(&token_uri, &client, &refresh_token)
        .context("refreshing access token")?;
    cache.token = Some(token.clone());
    cache.expiry = expires_in.map(|secs| {
        (now + ChronoDuration::seconds(secs)).to_rfc3339_opts(SecondsFormat::Secs, true)
    });
    cache.client_id.get_or_insert(client.client_id);
    cache.client_secret.get_or_insert(client.client_secret);
    cache.token_uri.get_or_insert(token_uri);
    cache.save(token_path)?;
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::tempdir;

    struct FakeRefresher {
        calls: RefCell<Vec<(String, String)>>,
        fail: bool,
    }

    impl FakeRefresher {
        fn ok() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                fail: false,
            }
        }
    }

    impl TokenRefresher for FakeRefresher {
        fn refresh(
            &self,
            token_uri: &str,
            client: &ClientSecret,
            _refresh_token: &str,
        ) -> Result<(String, Option<i64>)> {
            self.calls
                .borrow_mut()
                .push((token_uri.to_string(), client.client_id.clone()));
            if self.fail {
                bail!("invalid_grant");
            }
            Ok(("fresh-token".to_string(), Some(3600)))
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn fresh_cached_token_is_used_without_refresh() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("token.json");
        fs::write(
            &path,
            r#"{"token":"cached","refresh_token":"r","expiry":"2025-06-01T13:00:00.000000Z"}"#,
        )?;
        let refresher = FakeRefresher::ok();
        assert_eq!(access_token(&path, dir.path(), &refresher, now())?, "cached");
        assert!(refresher.calls.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn expired_token_is_refreshed_and_persisted() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("token.json");
        fs::write(
            &path,
            r#"{"token":"old","refresh_token":"r","client_id":"cid","client_secret":"s","expiry":"2025-06-01T11:00:00Z","universe_domain":"googleapis.com"}"#,
        )?;
        let refresher = FakeRefresher::ok();
        assert_eq!(access_token(&path, dir.path(), &refresher, now())?, "fresh-token");
        assert_eq!(
            *refresher.calls.borrow(),
            vec![(DEFAULT_TOKEN_URI.to_string(), "cid".to_string())]
        );

        let saved = TokenCache::load(&path)?;
        assert_eq!(saved.token.as_deref(), Some("fresh-token"));
        assert_eq!(saved.expiry.as_deref(), Some("2025-06-01T13:00:00Z"));
        assert_eq!(saved.extra["universe_domain"], "googleapis.com");
        Ok(())
    }

    #[test]
    fn client_secret_file_fills_missing_client_fields() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("token.json");
        fs::write(&path, r#"{"refresh_token":"r"}"#)?;
        fs::write(
            dir.path().join("client_secret_123.apps.googleusercontent.com.json"),
            r#"{"installed":{"client_id":"from-file","client_secret":"s","token_uri":"https://example.test/token"}}"#,
        )?;
        let refresher = FakeRefresher::ok();
        access_token(&path, dir.path(), &refresher, now())?;
        assert_eq!(
            *refresher.calls.borrow(),
            vec![("https://example.test/token".to_string(), "from-file".to_string())]
        );
        Ok(())
    }

    #[test]
    fn missing_cache_or_refresh_token_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("token.json");
        let refresher = FakeRefresher::ok();
        assert!(access_token(&path, dir.path(), &refresher, now()).is_err());

        fs::write(&path, r#"{"token":"old","expiry":"2020-01-01T00:00:00Z"}"#).unwrap();
        let err = access_token(&path, dir.path(), &refresher, now()).unwrap_err();
        assert!(err.to_string().contains("no refresh token"));
    }

    #[test]
    fn refresh_failure_is_fatal_and_keeps_cache() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("token.json");
        let original = r#"{"refresh_token":"r","client_id":"c","client_secret":"s"}"#;
        fs::write(&path, original).unwrap();
        let refresher = FakeRefresher {
            calls: RefCell::new(Vec::new()),
            fail: true,
        };
        assert!(access_token(&path, dir.path(), &refresher, now()).is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn generic_client_secret_name_wins() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("client_secret_a.json"), "{}").unwrap();
        fs::write(dir.path().join("client_secret.json"), "{}").unwrap();
        assert_eq!(
            find_client_secret_file(dir.path()),
            Some(dir.path().join("client_secret.json"))
        );
    }

    #[test]
    fn token_without_expiry_is_fresh() {
        let cache = TokenCache {
            token: Some("t".into()),
            ..TokenCache::default()
        };
        assert!(cache.is_fresh(now()));
        assert!(!TokenCache::default().is_fresh(now()));
    }
}
