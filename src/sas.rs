//! Shared-access-signature token credential.
//!
//! Produces and inspects tokens of the wire-compatible textual form
//!
//! ```text
//! SharedAccessSignature sr=<resource>&sig=<signature>&se=<expiry>&skn=<keyName>
//! ```
//!
//! where `sr` is the URL-encoded resource, `sig` the URL-encoded base64
//! HMAC-SHA256 over `<url-encoded-resource>\n<epoch-seconds-expiry>`, `se`
//! the expiry as epoch seconds, and `skn` the signing key name. Other clients
//! parse this format, so it must be reproduced byte for byte.
//!
//! A credential is either a key-name/secret pair that signs fresh tokens on
//! demand, or a pre-formed token used as-is. Expiry of a pre-formed token is
//! read from its `se` field; a missing or malformed `se` is treated as
//! never-expiring rather than an error.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::Sha256;
use std::time::Duration;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_PREFIX: &str = "SharedAccessSignature ";

/// Everything except unreserved characters is percent-encoded.
const URL_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn url_encode(value: &str) -> String {
    utf8_percent_encode(value, URL_ENCODE).to_string()
}

/// A signed token and its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl SasToken {
    /// Wrap a pre-formed token, reading its expiry from the `se` field.
    pub fn parse(token: impl Into<String>) -> Self {
        let token = token.into();
        let expires_at = expiration_from_token(&token);
        Self { token, expires_at }
    }

    /// The full token text, prefix included.
    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Extract the expiry from a token's `se` field.
///
/// A token without a parseable `se` is conservatively treated as
/// never-expiring, so a malformed token is surfaced by the service rejecting
/// it rather than by this client refreshing it forever.
fn expiration_from_token(token: &str) -> DateTime<Utc> {
    let body = token.strip_prefix(TOKEN_PREFIX).unwrap_or(token);
    body.split('&')
        .find_map(|field| field.strip_prefix("se="))
        .and_then(|value| value.parse::<i64>().ok())
        .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Shared-key credential: signs tokens for a resource on demand.
#[derive(Clone)]
pub struct SharedKeyCredential {
    key_name: String,
    key: String,
}

impl std::fmt::Debug for SharedKeyCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The secret never appears in logs.
        f.debug_struct("SharedKeyCredential")
            .field("key_name", &self.key_name)
            .finish_non_exhaustive()
    }
}

impl SharedKeyCredential {
    pub fn new(key_name: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let key_name = key_name.into();
        let key = key.into();
        if key_name.is_empty() || key.is_empty() {
            return Err(Error::Config("key name and key must be non-empty".into()));
        }
        Ok(Self { key_name, key })
    }

    /// Sign a token for `resource`, valid for `ttl` from now.
    pub fn sign(&self, resource: &str, ttl: Duration) -> Result<SasToken> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|_| Error::Config("token ttl out of range".into()))?;
        self.sign_at(resource, expires_at)
    }

    /// Sign a token expiring at an explicit instant.
    pub fn sign_at(&self, resource: &str, expires_at: DateTime<Utc>) -> Result<SasToken> {
        if resource.is_empty() {
            return Err(Error::Config("resource must be non-empty".into()));
        }
        let encoded_resource = url_encode(resource);
        let expiry = expires_at.timestamp();
        let to_sign = format!("{encoded_resource}\n{expiry}");

        let mut mac = HmacSha256::new_from_slice(self.key.as_bytes())
            .map_err(|_| Error::Config("invalid signing key".into()))?;
        mac.update(to_sign.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        let token = format!(
            "{TOKEN_PREFIX}sr={encoded_resource}&sig={}&se={expiry}&skn={}",
            url_encode(&signature),
            self.key_name,
        );
        Ok(SasToken { token, expires_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_token_has_exact_shape() {
        let credential = SharedKeyCredential::new("test-sas-key", "secret").unwrap();
        let before = Utc::now();
        let token = credential
            .sign("some resource name", Duration::from_secs(600))
            .unwrap();

        let text = token.as_str();
        assert!(text.starts_with("SharedAccessSignature sr=some%20resource%20name&sig="));
        assert!(text.contains("&se="));
        assert!(text.ends_with("&skn=test-sas-key"));
        assert!(token.expires_at() > before);
    }

    #[test]
    fn test_signature_is_deterministic_for_fixed_expiry() {
        let credential = SharedKeyCredential::new("key", "secret").unwrap();
        let expiry = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let a = credential.sign_at("sb://ns.example.com/hub", expiry).unwrap();
        let b = credential.sign_at("sb://ns.example.com/hub", expiry).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.expires_at().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_extracts_expiry() {
        let token = SasToken::parse(
            "SharedAccessSignature sr=amqp%3A%2F%2Ffake.resource.com&sig=dOVaUA%3D%3D&se=1599537084&skn=test-sas-key",
        );
        assert_eq!(
            token.expires_at(),
            Utc.with_ymd_and_hms(2020, 9, 8, 3, 51, 24).unwrap()
        );
        assert!(token.is_expired(Utc::now()));
    }

    #[test]
    fn test_missing_se_never_expires() {
        let token =
            SasToken::parse("SharedAccessSignature sr=resource&sig=abc&skn=test-sas-key");
        assert_eq!(token.expires_at(), DateTime::<Utc>::MAX_UTC);
        assert!(!token.is_expired(Utc::now()));
    }

    #[test]
    fn test_malformed_se_never_expires() {
        let token =
            SasToken::parse("SharedAccessSignature sr=r&sig=abc&se=not-a-number&skn=k");
        assert_eq!(token.expires_at(), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_signed_token_round_trips_through_parse() {
        let credential = SharedKeyCredential::new("key", "secret").unwrap();
        let expiry = Utc.timestamp_opt(1_800_000_000, 0).unwrap();
        let signed = credential.sign_at("resource", expiry).unwrap();

        let parsed = SasToken::parse(signed.as_str());
        assert_eq!(parsed.expires_at(), expiry);
    }

    #[test]
    fn test_empty_inputs_are_rejected() {
        assert!(SharedKeyCredential::new("", "secret").is_err());
        assert!(SharedKeyCredential::new("key", "").is_err());

        let credential = SharedKeyCredential::new("key", "secret").unwrap();
        assert!(credential.sign("", Duration::from_secs(60)).is_err());
    }
}
