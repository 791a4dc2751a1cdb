use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use uuid::Uuid;

use huddle_gateway::Authenticator;
use huddle_types::api::Claims;
use huddle_types::models::Principal;

/// Lifetime of issued bearer tokens.
const TOKEN_TTL_DAYS: i64 = 30;

/// HMAC bearer tokens, shared by the REST middleware and the live
/// subscription handshake.
pub struct JwtAuthenticator {
    secret: String,
}

impl JwtAuthenticator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn issue_token(&self, user_id: Uuid, name: &str) -> anyhow::Result<String> {
        let claims = Claims {
            sub: user_id,
            name: name.to_string(),
            exp: (chrono::Utc::now() + chrono::Duration::days(TOKEN_TTL_DAYS)).timestamp() as usize,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?;

        Ok(token)
    }

    pub fn verify(&self, token: &str) -> anyhow::Result<Claims> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )?;
        Ok(data.claims)
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, credential: &str) -> anyhow::Result<Principal> {
        let claims = self.verify(credential)?;
        Ok(Principal {
            user_id: claims.sub,
            name: claims.name,
        })
    }
}
