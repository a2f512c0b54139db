use crate::error::PublishError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use reqwest::Client;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use serde::Deserialize;
use sha2::Sha256;
use std::path::Path;
use tokio::sync::Mutex;

const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    pub token_uri: String,
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self, PublishError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PublishError::Auth(format!("credentials file: {e}")))?;
        serde_json::from_str(&raw).map_err(|e| PublishError::Auth(format!("credentials file: {e}")))
    }
}

struct CachedToken {
    value: String,
    expires_at: i64,
}

/// Service-account OAuth2 flow: a locally signed JWT exchanged for a bearer
/// token, cached until shortly before expiry.
pub struct TokenProvider {
    key: ServiceAccountKey,
    signing_key: SigningKey<Sha256>,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(key: ServiceAccountKey) -> Result<Self, PublishError> {
        let private = RsaPrivateKey::from_pkcs8_pem(&key.private_key)
            .map_err(|e| PublishError::Auth(format!("service account key: {e}")))?;
        Ok(Self {
            signing_key: SigningKey::<Sha256>::new(private),
            key,
            cached: Mutex::new(None),
        })
    }

    pub async fn access_token(&self, http: &Client) -> Result<String, PublishError> {
        let now = Utc::now().timestamp();
        {
            let guard = self.cached.lock().await;
            if let Some(token) = guard.as_ref() {
                if token.expires_at - EXPIRY_MARGIN_SECS > now {
                    return Ok(token.value.clone());
                }
            }
        }

        let assertion = self.signed_assertion(now)?;

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: i64,
        }

        let response = http
            .post(&self.key.token_uri)
            .form(&[("grant_type", GRANT_TYPE), ("assertion", assertion.as_str())])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Auth(format!(
                "token endpoint returned {status}: {body}"
            )));
        }
        let token: TokenResponse = response.json().await?;

        let mut guard = self.cached.lock().await;
        *guard = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: now + token.expires_in,
        });
        Ok(token.access_token)
    }

    fn signed_assertion(&self, now: i64) -> Result<String, PublishError> {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let claims = URL_SAFE_NO_PAD
            .encode(claims_json(&self.key.client_email, &self.key.token_uri, now).to_string());
        let payload = format!("{header}.{claims}");
        let signature = self
            .signing_key
            .try_sign(payload.as_bytes())
            .map_err(|e| PublishError::Auth(format!("assertion signature: {e}")))?;
        Ok(format!(
            "{payload}.{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}

fn claims_json(email: &str, audience: &str, now: i64) -> serde_json::Value {
    serde_json::json!({
        "iss": email,
        "scope": DRIVE_SCOPE,
        "aud": audience,
        "iat": now,
        "exp": now + TOKEN_LIFETIME_SECS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_carry_scope_and_lifetime() {
        let claims = claims_json("svc@example.iam", "https://oauth2.example/token", 1_700_000_000);
        assert_eq!(claims["iss"], "svc@example.iam");
        assert_eq!(claims["aud"], "https://oauth2.example/token");
        assert_eq!(claims["scope"], DRIVE_SCOPE);
        assert_eq!(
            claims["exp"].as_i64().unwrap() - claims["iat"].as_i64().unwrap(),
            TOKEN_LIFETIME_SECS
        );
    }
}
