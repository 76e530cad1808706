use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const USER_TOKEN_TTL_SECONDS: i64 = 60 * 60;
const ANONYMOUS_DISPLAY_NAME: &str = "Anonymous";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserTokenClaims {
    sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    picture: Option<String>,
    iat: i64,
    exp: i64,
}

/// Caller identity carried by a validated bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub picture: Option<String>,
}

impl UserIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), name: None, email: None, picture: None }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_picture(mut self, picture: impl Into<String>) -> Self {
        self.picture = Some(picture.into());
        self
    }

    /// Profile name, then email, then a fixed placeholder.
    pub fn display_name(&self) -> String {
        [self.name.as_deref(), self.email.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|value| !value.is_empty())
            .unwrap_or(ANONYMOUS_DISPLAY_NAME)
            .to_string()
    }
}

#[derive(Clone)]
pub struct UserTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl UserTokenService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue_user_token(&self, identity: &UserIdentity) -> anyhow::Result<String> {
        self.issue_user_token_at(identity, current_unix_timestamp()?)
    }

    fn issue_user_token_at(
        &self,
        identity: &UserIdentity,
        issued_at: i64,
    ) -> anyhow::Result<String> {
        let claims = UserTokenClaims {
            sub: identity.user_id.clone(),
            name: identity.name.clone(),
            email: identity.email.clone(),
            picture: identity.picture.clone(),
            iat: issued_at,
            exp: issued_at + USER_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode user token")
    }

    pub fn validate_user_token(&self, token: &str) -> anyhow::Result<UserIdentity> {
        let claims = decode::<UserTokenClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode user token")?
            .claims;

        if claims.sub.trim().is_empty() {
            bail!("user token subject is empty");
        }

        Ok(UserIdentity {
            user_id: claims.sub,
            name: claims.name,
            email: claims.email,
            picture: claims.picture,
        })
    }
}

pub(crate) fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}
