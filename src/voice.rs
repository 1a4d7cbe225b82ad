//! Voice credential issuer.
//!
//! The server never touches voice media; it only mints short-lived access
//! tokens that clients present to the media server. The issuer is defined
//! by two operations so the backing service can be swapped out.

use std::collections::HashSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::clock::unix_secs;

/// Credentials returned to a joining peer.
#[derive(Debug, Clone)]
pub struct VoiceGrant {
    pub token: String,
    pub room_name: String,
    pub server_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("voice chat is not configured")]
    Unconfigured,

    #[error("token encoding failed: {0}")]
    Jwt(String),
}

/// The two-operation credential surface the room depends on.
pub trait CredentialIssuer: Send + Sync {
    fn issue_token(
        &self,
        project_id: &str,
        peer_id: &str,
        display_name: &str,
    ) -> Result<VoiceGrant, VoiceError>;

    fn revoke(&self, project_id: &str, peer_id: &str);
}

/// LiveKit issuer configuration.
#[derive(Debug, Clone)]
pub struct LiveKitConfig {
    pub api_key: String,
    pub api_secret: String,
    pub server_url: String,
    pub token_ttl_secs: u64,
}

impl LiveKitConfig {
    pub fn new(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            server_url: server_url.into(),
            token_ttl_secs: 6 * 60 * 60,
        }
    }

    /// Read `LIVEKIT_API_KEY` / `LIVEKIT_API_SECRET` / `LIVEKIT_URL`.
    /// Returns `None` when credentials are absent.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("LIVEKIT_API_KEY").ok()?;
        let api_secret = std::env::var("LIVEKIT_API_SECRET").ok()?;
        if api_key.is_empty() || api_secret.is_empty() {
            return None;
        }
        let server_url =
            std::env::var("LIVEKIT_URL").unwrap_or_else(|_| "wss://localhost:7880".to_string());
        Some(Self::new(api_key, api_secret, server_url))
    }
}

/// LiveKit access-token claims.
#[derive(Debug, Serialize, Deserialize)]
struct AccessTokenClaims {
    iss: String,
    sub: String,
    iat: u64,
    exp: u64,
    nbf: u64,
    jti: String,
    video: VideoGrant,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoGrant {
    room: String,
    room_join: bool,
    can_publish: bool,
    can_subscribe: bool,
    can_publish_data: bool,
}

/// Issuer backed by LiveKit-style HS256 JWTs. When constructed without
/// credentials every issue fails with `Unconfigured`, which surfaces to the
/// requesting peer as `ServerError`; the room stays healthy.
pub struct LiveKitIssuer {
    config: Option<LiveKitConfig>,
    issued: Mutex<HashSet<(String, String)>>,
}

impl LiveKitIssuer {
    pub fn new(config: LiveKitConfig) -> Self {
        Self {
            config: Some(config),
            issued: Mutex::new(HashSet::new()),
        }
    }

    pub fn unconfigured() -> Self {
        Self {
            config: None,
            issued: Mutex::new(HashSet::new()),
        }
    }

    /// Build from the environment; falls back to the unconfigured issuer.
    pub fn from_env() -> Self {
        match LiveKitConfig::from_env() {
            Some(config) => Self::new(config),
            None => Self::unconfigured(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    /// Whether a grant is currently outstanding (issued and not revoked).
    pub fn has_grant(&self, project_id: &str, peer_id: &str) -> bool {
        self.issued
            .lock()
            .expect("issuer lock poisoned")
            .contains(&(project_id.to_string(), peer_id.to_string()))
    }
}

fn voice_room_name(project_id: &str) -> String {
    format!("voice-{project_id}")
}

impl CredentialIssuer for LiveKitIssuer {
    fn issue_token(
        &self,
        project_id: &str,
        peer_id: &str,
        display_name: &str,
    ) -> Result<VoiceGrant, VoiceError> {
        let config = self.config.as_ref().ok_or(VoiceError::Unconfigured)?;

        let room_name = voice_room_name(project_id);
        let now = unix_secs() as u64;
        let claims = AccessTokenClaims {
            iss: config.api_key.clone(),
            sub: peer_id.to_string(),
            iat: now,
            exp: now + config.token_ttl_secs,
            nbf: now,
            jti: uuid::Uuid::new_v4().to_string(),
            video: VideoGrant {
                room: room_name.clone(),
                room_join: true,
                can_publish: true,
                can_subscribe: true,
                can_publish_data: true,
            },
            name: (!display_name.is_empty()).then(|| display_name.to_string()),
        };

        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(config.api_secret.as_bytes()),
        )
        .map_err(|e| VoiceError::Jwt(e.to_string()))?;

        self.issued
            .lock()
            .expect("issuer lock poisoned")
            .insert((project_id.to_string(), peer_id.to_string()));

        Ok(VoiceGrant {
            token,
            room_name,
            server_url: config.server_url.clone(),
        })
    }

    fn revoke(&self, project_id: &str, peer_id: &str) {
        self.issued
            .lock()
            .expect("issuer lock poisoned")
            .remove(&(project_id.to_string(), peer_id.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_issuer() -> LiveKitIssuer {
        LiveKitIssuer::new(LiveKitConfig::new(
            "test-key",
            "test-secret-test-secret-test-secret",
            "wss://voice.test",
        ))
    }

    #[test]
    fn test_unconfigured_issue_fails() {
        let issuer = LiveKitIssuer::unconfigured();
        assert!(!issuer.is_configured());
        assert!(matches!(
            issuer.issue_token("proj", "peer-1", "Ada"),
            Err(VoiceError::Unconfigured)
        ));
    }

    #[test]
    fn test_issue_and_revoke() {
        let issuer = test_issuer();
        let grant = issuer.issue_token("proj", "peer-1", "Ada").unwrap();

        assert_eq!(grant.room_name, "voice-proj");
        assert_eq!(grant.server_url, "wss://voice.test");
        // JWT: three dot-separated segments.
        assert_eq!(grant.token.split('.').count(), 3);
        assert!(issuer.has_grant("proj", "peer-1"));

        issuer.revoke("proj", "peer-1");
        assert!(!issuer.has_grant("proj", "peer-1"));
    }

    #[test]
    fn test_token_claims_decode() {
        let issuer = test_issuer();
        let grant = issuer.issue_token("proj", "peer-1", "Ada").unwrap();

        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_issuer(&["test-key"]);
        validation.sub = Some("peer-1".to_string());

        let decoded = jsonwebtoken::decode::<AccessTokenClaims>(
            &grant.token,
            &jsonwebtoken::DecodingKey::from_secret(b"test-secret-test-secret-test-secret"),
            &validation,
        )
        .unwrap();

        assert_eq!(decoded.claims.video.room, "voice-proj");
        assert!(decoded.claims.video.room_join);
        assert_eq!(decoded.claims.name.as_deref(), Some("Ada"));
    }
}
