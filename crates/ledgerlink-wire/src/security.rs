//! HMAC signing and scoped bearer tokens.
//!
//! Both servers share a single secret. Message bodies are signed with
//! HMAC-SHA256 over their exact bytes, and short-lived bearer tokens scope a
//! request to an issuer/audience pair. Verification uses constant-time
//! comparison throughout.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use ledgerlink_types::error::{LinkError, LinkResult};
use ledgerlink_types::server::ServerId;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Claims carried by a scoped bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Issuing server id.
    pub iss: ServerId,
    /// Intended audience server id.
    pub aud: ServerId,
    /// Issued-at (unix seconds).
    pub iat: i64,
    /// Expiry (unix seconds).
    pub exp: i64,
    /// Redundant copy of the issuer for log correlation.
    pub server_id: ServerId,
}

/// Signs message bodies and issues/validates scoped tokens.
///
/// Holds the shared secret and this server's identity. Cheap to clone behind
/// an Arc; all methods are synchronous and lock-free.
pub struct SecurityManager {
    secret: String,
    server_id: ServerId,
    token_ttl_secs: u64,
}

impl SecurityManager {
    /// Create a manager for the given server and shared secret.
    pub fn new(secret: impl Into<String>, server_id: ServerId, token_ttl_secs: u64) -> Self {
        Self {
            secret: secret.into(),
            server_id,
            token_ttl_secs,
        }
    }

    /// The id this manager signs as.
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    fn mac_hex(&self, data: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(data);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Sign exact body bytes. Returns a lowercase hex HMAC-SHA256 digest.
    pub fn sign_bytes(&self, body: &[u8]) -> String {
        self.mac_hex(body)
    }

    /// Verify a signature over exact body bytes in constant time.
    pub fn verify_bytes(&self, body: &[u8], signature: &str) -> bool {
        let expected = self.mac_hex(body);
        subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
    }

    /// Serialize a value with object keys sorted recursively.
    ///
    /// Two servers serializing the same logical value get byte-identical
    /// output, so either side can recompute the signature.
    pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
        let value = serde_json::to_value(value)?;
        let sorted = sort_json(value);
        serde_json::to_vec(&sorted)
    }

    /// Issue a bearer token scoped to the given audience, with the
    /// configured lifetime.
    ///
    /// Format: `base64url(JSON claims) + "." + hex(HMAC-SHA256 over the
    /// encoded claims)`.
    pub fn issue_token(&self, audience: ServerId) -> LinkResult<String> {
        self.issue_token_with_ttl(audience, self.token_ttl_secs as i64)
    }

    /// Issue a token with an explicit lifetime. Rejects non-positive TTLs.
    pub fn issue_token_with_ttl(&self, audience: ServerId, ttl_secs: i64) -> LinkResult<String> {
        if ttl_secs <= 0 {
            return Err(LinkError::Auth(format!(
                "token ttl must be positive, got {ttl_secs}"
            )));
        }
        let now = Utc::now().timestamp();
        let claims = TokenClaims {
            iss: self.server_id,
            aud: audience,
            iat: now,
            exp: now + ttl_secs,
            server_id: self.server_id,
        };
        let encoded = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&claims).map_err(|e| LinkError::Serialization(e.to_string()))?,
        );
        let sig = self.mac_hex(encoded.as_bytes());
        Ok(format!("{encoded}.{sig}"))
    }

    /// Validate a bearer token presented to this server.
    ///
    /// Returns the claims when the MAC checks out, the issuer matches
    /// `expected_issuer`, the audience is this server, and the token has not
    /// expired. Returns None for anything else; never panics on malformed
    /// input.
    pub fn validate_token(&self, token: &str, expected_issuer: ServerId) -> Option<TokenClaims> {
        let (encoded, sig) = token.split_once('.')?;
        let expected = self.mac_hex(encoded.as_bytes());
        let mac_ok: bool =
            subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), sig.as_bytes()).into();
        if !mac_ok {
            return None;
        }

        let raw = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        let claims: TokenClaims = serde_json::from_slice(&raw).ok()?;

        if claims.iss != expected_issuer {
            return None;
        }
        if claims.aud != self.server_id {
            return None;
        }
        if claims.exp <= Utc::now().timestamp() {
            return None;
        }

        Some(claims)
    }
}

fn sort_json(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, serde_json::Value> =
                map.into_iter().map(|(k, v)| (k, sort_json(v))).collect();
            serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sort_json).collect())
        }
        other => other,
    }
}
