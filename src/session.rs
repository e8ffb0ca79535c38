//! Authenticated browsing session resolution.
//!
//! A session is a browser storage-state snapshot (cookies plus per-origin
//! local storage). It comes from a local JSON file when `SESSION_STATE_PATH`
//! points at one, otherwise from an AES-256-GCM encrypted record in the
//! settings store.

use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;
use crate::constants::SESSION_SETTING_KEY;
use crate::db::get_setting;

const ENVELOPE_VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no browsing session available: {0}")]
    Missing(String),
    #[error("browsing session is invalid: {0}")]
    Invalid(String),
    #[error("failed to decrypt browsing session: {0}")]
    Decrypt(String),
    #[error("failed to read session file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read session from store: {0}")]
    Store(String),
}

/// A cookie as captured from a logged-in browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: Option<bool>,
    #[serde(default)]
    pub secure: Option<bool>,
    #[serde(default)]
    pub same_site: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalStorageEntry {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginState {
    pub origin: String,
    #[serde(default)]
    pub local_storage: Vec<LocalStorageEntry>,
}

/// Browser storage-state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageState {
    pub cookies: Vec<StoredCookie>,
    #[serde(default)]
    pub origins: Vec<OriginState>,
}

impl StorageState {
    /// Parse and validate a storage-state JSON document.
    pub fn from_json(raw: &str) -> Result<Self, SessionError> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| SessionError::Invalid(format!("not valid JSON: {e}")))?;

        if !value.get("cookies").is_some_and(serde_json::Value::is_array) {
            return Err(SessionError::Invalid("missing `cookies` array".to_string()));
        }

        let state: Self = serde_json::from_value(value)
            .map_err(|e| SessionError::Invalid(format!("unexpected shape: {e}")))?;
        state.validate()?;
        Ok(state)
    }

    fn validate(&self) -> Result<(), SessionError> {
        if self.cookies.is_empty() {
            return Err(SessionError::Invalid("`cookies` is empty".to_string()));
        }
        for (i, cookie) in self.cookies.iter().enumerate() {
            if cookie.name.trim().is_empty() {
                return Err(SessionError::Invalid(format!("cookie {i} has no name")));
            }
            if cookie.domain.trim().is_empty() {
                return Err(SessionError::Invalid(format!(
                    "cookie `{}` has no domain",
                    cookie.name
                )));
            }
        }
        for origin in &self.origins {
            if url::Url::parse(&origin.origin).is_err() {
                return Err(SessionError::Invalid(format!(
                    "origin `{}` is not a URL",
                    origin.origin
                )));
            }
        }
        Ok(())
    }

    /// Build a `Cookie` header value for requests to `host`.
    #[must_use]
    pub fn cookie_header(&self, host: &str) -> Option<String> {
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .filter(|c| domain_matches(host, &c.domain))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        (!pairs.is_empty()).then(|| pairs.join("; "))
    }
}

fn domain_matches(host: &str, cookie_domain: &str) -> bool {
    let domain = cookie_domain.trim_start_matches('.').to_lowercase();
    let host = host.to_lowercase();
    host == domain || host.ends_with(&format!(".{domain}"))
}

/// Resolve the browsing session for a job.
///
/// # Errors
///
/// Returns [`SessionError::Missing`] when neither source has a session and
/// [`SessionError::Invalid`] when the material does not have the expected shape.
pub async fn load_session(config: &Config, pool: &SqlitePool) -> Result<StorageState, SessionError> {
    if let Some(path) = config.session_state_path.as_deref() {
        if path.exists() {
            let state = load_session_file(path).await?;
            info!(path = %path.display(), cookies = state.cookies.len(), "Loaded session from file");
            return Ok(state);
        }
        debug!(path = %path.display(), "Session file configured but not found; trying store");
    }

    let envelope = get_setting(pool, SESSION_SETTING_KEY)
        .await
        .map_err(|e| SessionError::Store(format!("{e:#}")))?
        .ok_or_else(|| {
            SessionError::Missing("no session file and no stored session record".to_string())
        })?;

    let secret = config.session_encryption_key.as_deref().ok_or_else(|| {
        SessionError::Invalid("stored session exists but SESSION_ENCRYPTION_KEY is not set".to_string())
    })?;

    let plaintext = decrypt_session(&envelope, secret)?;
    let state = StorageState::from_json(&plaintext)?;
    info!(cookies = state.cookies.len(), "Loaded session from store");
    Ok(state)
}

/// Read a storage-state file.
pub async fn load_session_file(path: &Path) -> Result<StorageState, SessionError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SessionError::Io {
            path: path.display().to_string(),
            source,
        })?;
    StorageState::from_json(&raw)
}

fn derive_key(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

/// Encrypt session JSON into a `v1:<nonce>:<ciphertext>` envelope.
pub fn encrypt_session(plaintext: &str, secret: &str) -> Result<String, SessionError> {
    let cipher = Aes256Gcm::new_from_slice(&derive_key(secret))
        .map_err(|e| SessionError::Decrypt(e.to_string()))?;

    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
        .map_err(|_| SessionError::Decrypt("AES-GCM encryption failed".to_string()))?;

    Ok(format!(
        "{ENVELOPE_VERSION}:{}:{}",
        BASE64.encode(nonce_bytes),
        BASE64.encode(ciphertext)
    ))
}

/// Decrypt a `v1:<nonce>:<ciphertext>` envelope.
pub fn decrypt_session(envelope: &str, secret: &str) -> Result<String, SessionError> {
    let mut parts = envelope.trim().splitn(3, ':');
    let (Some(version), Some(nonce_b64), Some(ct_b64)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(SessionError::Invalid("malformed session envelope".to_string()));
    };
    if version != ENVELOPE_VERSION {
        return Err(SessionError::Invalid(format!(
            "unsupported session envelope version `{version}`"
        )));
    }

    let nonce = BASE64
        .decode(nonce_b64)
        .map_err(|e| SessionError::Invalid(format!("bad nonce encoding: {e}")))?;
    if nonce.len() != 12 {
        return Err(SessionError::Invalid("nonce must be 12 bytes".to_string()));
    }
    let ciphertext = BASE64
        .decode(ct_b64)
        .map_err(|e| SessionError::Invalid(format!("bad ciphertext encoding: {e}")))?;

    let cipher = Aes256Gcm::new_from_slice(&derive_key(secret))
        .map_err(|e| SessionError::Decrypt(e.to_string()))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .map_err(|_| SessionError::Decrypt("authentication failed (wrong key?)".to_string()))?;

    String::from_utf8(plaintext).map_err(|_| SessionError::Invalid("session is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "cookies": [
            {"name": "NID_AUT", "value": "aut", "domain": ".naver.com", "path": "/", "httpOnly": true},
            {"name": "NID_SES", "value": "ses", "domain": ".naver.com"},
            {"name": "other", "value": "x", "domain": "example.com"}
        ],
        "origins": [
            {"origin": "https://cafe.naver.com", "localStorage": [{"name": "k", "value": "v"}]}
        ]
    }"#;

    #[test]
    fn test_parse_valid_state() {
        let state = StorageState::from_json(VALID).unwrap();
        assert_eq!(state.cookies.len(), 3);
        assert_eq!(state.origins[0].local_storage[0].name, "k");
    }

    #[test]
    fn test_missing_cookies_is_invalid() {
        let err = StorageState::from_json(r#"{"origins": []}"#).unwrap_err();
        assert!(matches!(err, SessionError::Invalid(msg) if msg.contains("cookies")));
    }

    #[test]
    fn test_cookie_without_domain_is_invalid() {
        let err =
            StorageState::from_json(r#"{"cookies": [{"name": "a", "value": "b", "domain": ""}]}"#)
                .unwrap_err();
        assert!(matches!(err, SessionError::Invalid(_)));
    }

    #[test]
    fn test_cookie_header_matches_parent_domain() {
        let state = StorageState::from_json(VALID).unwrap();
        assert_eq!(
            state.cookie_header("apis.naver.com").as_deref(),
            Some("NID_AUT=aut; NID_SES=ses")
        );
        assert_eq!(state.cookie_header("127.0.0.1"), None);
    }

    #[test]
    fn test_envelope_decrypts_with_same_secret_only() {
        let envelope = encrypt_session(VALID, "correct horse").unwrap();
        assert!(envelope.starts_with("v1:"));
        assert_eq!(decrypt_session(&envelope, "correct horse").unwrap(), VALID);
        assert!(matches!(
            decrypt_session(&envelope, "battery staple"),
            Err(SessionError::Decrypt(_))
        ));
    }

    #[test]
    fn test_malformed_envelope() {
        assert!(matches!(
            decrypt_session("garbage", "k"),
            Err(SessionError::Invalid(_))
        ));
        assert!(matches!(
            decrypt_session("v2:AAAA:BBBB", "k"),
            Err(SessionError::Invalid(_))
        ));
    }
}
