// Media server access tokens.
//
// Tokens are HS256 JWTs in the LiveKit access-token format: the API key is
// the issuer, the participant identity is the subject, and permissions live
// under the `video` claim.

use anyhow::Context;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::auth::jwt::current_unix_timestamp;

pub const MEDIA_TOKEN_TTL_SECONDS: i64 = 6 * 60 * 60;
const ROOM_ADMIN_TOKEN_TTL_SECONDS: i64 = 10 * 60;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaGrant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_join: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_create: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_admin: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_publish: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_subscribe: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_publish_data: Option<bool>,
}

impl MediaGrant {
    /// Broadcaster: may publish tracks and data into `room`.
    pub fn publisher(room: &str) -> Self {
        Self {
            room: Some(room.to_string()),
            room_join: Some(true),
            can_publish: Some(true),
            can_subscribe: Some(true),
            can_publish_data: Some(true),
            ..Self::default()
        }
    }

    /// Viewer: receives media and may send data messages, never tracks.
    pub fn subscriber(room: &str) -> Self {
        Self {
            room: Some(room.to_string()),
            room_join: Some(true),
            can_publish: Some(false),
            can_subscribe: Some(true),
            can_publish_data: Some(true),
            ..Self::default()
        }
    }

    /// Server-side room management (create/delete).
    pub fn room_admin() -> Self {
        Self { room_create: Some(true), room_admin: Some(true), ..Self::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaTokenClaims {
    pub iss: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub nbf: i64,
    pub exp: i64,
    pub video: MediaGrant,
}

#[derive(Clone)]
pub struct MediaTokenIssuer {
    api_key: String,
    encoding_key: EncodingKey,
}

impl MediaTokenIssuer {
    pub fn new(api_key: &str, api_secret: &str) -> anyhow::Result<Self> {
        if api_key.trim().is_empty() || api_secret.trim().is_empty() {
            anyhow::bail!("media API key and secret must not be empty");
        }

        Ok(Self {
            api_key: api_key.to_string(),
            encoding_key: EncodingKey::from_secret(api_secret.as_bytes()),
        })
    }

    /// Participant token for joining a room.
    pub fn issue(&self, identity: &str, name: &str, grant: MediaGrant) -> anyhow::Result<String> {
        let now = current_unix_timestamp()?;
        self.encode_claims(MediaTokenClaims {
            iss: self.api_key.clone(),
            sub: identity.to_string(),
            name: Some(name.to_string()),
            nbf: now,
            exp: now + MEDIA_TOKEN_TTL_SECONDS,
            video: grant,
        })
    }

    /// Short-lived token for room service API calls.
    pub fn issue_room_admin(&self) -> anyhow::Result<String> {
        let now = current_unix_timestamp()?;
        self.encode_claims(MediaTokenClaims {
            iss: self.api_key.clone(),
            sub: String::new(),
            name: None,
            nbf: now,
            exp: now + ROOM_ADMIN_TOKEN_TTL_SECONDS,
            video: MediaGrant::room_admin(),
        })
    }

    fn encode_claims(&self, claims: MediaTokenClaims) -> anyhow::Result<String> {
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode media access token")
    }
}
