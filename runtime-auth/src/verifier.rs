use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use runtime_util::lru_cache::ExpiringLru;

use crate::claims::Claims;
use crate::config::{JwtConfig, Provider};
use crate::error::{AuthError, AuthResult};
use crate::jwks_cache::JwksCache;

/// Allowed clock skew applied to `exp`/`nbf`/`iat` validation.
const LEEWAY: Duration = Duration::from_secs(10);

fn cache_key(jwks_url: &str, raw: &str) -> String {
    format!("{jwks_url}-{raw}")
}

/// Verifies signed tokens against one or more JWKS providers, caching both
/// successful verifications and known-bad tokens so a hammering client
/// doesn't force a re-verify (or a re-fetch) on every request.
pub struct JwtVerifier {
    config: JwtConfig,
    jwks: Arc<JwksCache>,
    good: Arc<ExpiringLru<String, Claims>>,
    known_bad: Arc<ExpiringLru<String, AuthError>>,
}

impl JwtVerifier {
    pub fn new(config: JwtConfig) -> Self {
        Self::with_client(config, Client::new())
    }

    pub fn with_client(config: JwtConfig, client: Client) -> Self {
        let good = Arc::new(ExpiringLru::new(config.max_cached_entries, config.cache_ttl));
        let known_bad = Arc::new(ExpiringLru::new(config.max_cached_entries, config.known_bad_ttl));
        Self {
            jwks: Arc::new(JwksCache::new(client, config.max_cached_entries)),
            good,
            known_bad,
            config,
        }
    }

    pub fn config(&self) -> &JwtConfig {
        &self.config
    }

    /// Spawns the background refresher for every configured provider and
    /// the eviction sweeps for both caches.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        self.jwks.clone().spawn_refresh_loop(
            self.config.providers.clone(),
            self.config.effective_refresh(),
            cancel.clone(),
        );
        self.good.clone().spawn_eviction_loop(self.config.cache_eviction_interval, cancel.clone());
        self.known_bad.clone().spawn_eviction_loop(self.config.cache_eviction_interval, cancel);
    }

    /// Resolves a provider by its JWKS URL, the only identifier a caller
    /// is expected to know ahead of verifying a token.
    pub fn provider(&self, jwks_url: &str) -> Option<&Provider> {
        self.config.provider_for(jwks_url)
    }

    /// Parses and verifies `raw` against `provider`, per the verifier's
    /// known-bad/good cache, signature-check, then claims-validation flow.
    pub async fn parse(&self, raw: &str, provider: &Provider) -> AuthResult<Claims> {
        let key = cache_key(&provider.jwks_url, raw);

        if let Some(err) = self.known_bad.get(&key) {
            return Err(err);
        }
        if let Some(claims) = self.good.get(&key) {
            return Ok(claims);
        }

        match self.parse_uncached(raw, provider).await {
            Ok(claims) => {
                self.cache_good(&key, &claims);
                Ok(claims)
            }
            Err(err) => {
                self.known_bad.set(key, err.clone());
                Err(err)
            }
        }
    }

    async fn parse_uncached(&self, raw: &str, provider: &Provider) -> AuthResult<Claims> {
        let header = decode_header(raw).map_err(|err| AuthError::InvalidHeader(err.to_string()))?;

        let token_data = if provider.jwks_url.is_empty() {
            decode_unverified(raw)?
        } else {
            let kid = header.kid.clone().ok_or(AuthError::MissingKeyId)?;
            let keyset = self.jwks.get(&provider.jwks_url).await?;
            let decoding_key = keyset
                .iter()
                .find(|(k, _)| *k == kid)
                .map(|(_, key)| key)
                .ok_or_else(|| AuthError::UnknownKeyId(kid))?;
            decode_with(raw, decoding_key)?
        };

        let claims = Claims::try_from(token_data)?;
        validate_times(&claims)?;
        debug!(kid = ?header.kid, "verified JWT successfully");
        Ok(claims)
    }

    fn cache_good(&self, key: &str, claims: &Claims) {
        match claims.expires_at {
            Some(exp) => {
                let skewed = exp + chrono::Duration::seconds(LEEWAY.as_secs() as i64);
                let remaining = (skewed - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                let ttl = remaining.min(self.config.cache_ttl);
                self.good.set_with_expiration(key.to_string(), claims.clone(), ttl);
            }
            None => self.good.set(key.to_string(), claims.clone()),
        }
    }
}

fn base_validation() -> Validation {
    let mut validation = Validation::new(Algorithm::RS256);
    // Times are checked manually with our own leeway, including `iat`
    // which jsonwebtoken doesn't validate at all.
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.required_spec_claims.clear();
    validation
}

fn decode_with(raw: &str, key: &DecodingKey) -> AuthResult<Value> {
    let token_data = decode::<Value>(raw, key, &base_validation())?;
    Ok(token_data.claims)
}

fn decode_unverified(raw: &str) -> AuthResult<Value> {
    let mut validation = base_validation();
    validation.insecure_disable_signature_validation();
    let dummy = DecodingKey::from_secret(&[]);
    let token_data = decode::<Value>(raw, &dummy, &validation)?;
    Ok(token_data.claims)
}

fn validate_times(claims: &Claims) -> AuthResult<()> {
    let now = Utc::now();
    let leeway = chrono::Duration::seconds(LEEWAY.as_secs() as i64);

    if let Some(exp) = claims.expires_at {
        if now > exp + leeway {
            return Err(AuthError::ErrExp);
        }
    }
    if let Some(nbf) = claims.not_before {
        if now < nbf - leeway {
            return Err(AuthError::ErrNbf);
        }
    }
    if let Some(iat) = claims.issued_at {
        if iat > now + leeway {
            return Err(AuthError::ErrIat);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use httpmock::MockServer;
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use rsa::RsaPrivateKey;
    use serde_json::json;
    use std::time::SystemTime;

    fn issue_token(key: &RsaPrivateKey, claims: serde_json::Value, kid: &str) -> String {
        let pem = key.to_pkcs1_pem(rsa::pkcs1::LineEnding::LF).unwrap();
        let encoding_key = jsonwebtoken::EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap();
        let mut header = jsonwebtoken::Header::new(Algorithm::RS256);
        header.kid = Some(kid.to_string());
        jsonwebtoken::encode(&header, &claims, &encoding_key).unwrap()
    }

    fn jwk_for(key: &RsaPrivateKey, kid: &str) -> serde_json::Value {
        use rsa::traits::PublicKeyParts;
        let public = key.to_public_key();
        let n = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(public.n().to_bytes_be());
        let e = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(public.e().to_bytes_be());
        json!({ "kid": kid, "kty": "RSA", "alg": "RS256", "n": n, "e": e })
    }

    fn now_secs() -> i64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    #[tokio::test]
    async fn verifies_token_signed_with_registered_key() {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/certs");
            then.status(200)
                .json_body(json!({ "keys": [jwk_for(&key, "k1")] }));
        });

        let provider = Provider::new(server.url("/certs"), Duration::from_secs(600));
        let config = JwtConfig::new(vec![provider.clone()]);
        let verifier = JwtVerifier::new(config);

        let claims = json!({
            "sub": "user-1",
            "iss": "https://issuer.example",
            "aud": "gateway",
            "exp": now_secs() + 3600,
            "scope": "read write",
        });
        let token = issue_token(&key, claims, "k1");

        let parsed = verifier.parse(&token, &provider).await.unwrap();
        assert_eq!(parsed.subject, "user-1");
        assert!(parsed.has_scope("write"));
    }

    #[tokio::test]
    async fn expired_token_is_rejected_and_cached() {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/certs");
            then.status(200)
                .json_body(json!({ "keys": [jwk_for(&key, "k1")] }));
        });

        let provider = Provider::new(server.url("/certs"), Duration::from_secs(600));
        let config = JwtConfig::new(vec![provider.clone()]);
        let verifier = JwtVerifier::new(config);

        let claims = json!({
            "sub": "user-1",
            "iss": "https://issuer.example",
            "exp": now_secs() - 3600,
        });
        let token = issue_token(&key, claims, "k1");

        let err = verifier.parse(&token, &provider).await.unwrap_err();
        assert!(matches!(err, AuthError::ErrExp));

        let err_again = verifier.parse(&token, &provider).await.unwrap_err();
        assert!(matches!(err_again, AuthError::ErrExp));
    }

    #[tokio::test]
    async fn unknown_kid_is_rejected() {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/certs");
            then.status(200).json_body(json!({ "keys": [jwk_for(&key, "other")] }));
        });

        let provider = Provider::new(server.url("/certs"), Duration::from_secs(600));
        let config = JwtConfig::new(vec![provider.clone()]);
        let verifier = JwtVerifier::new(config);

        let claims = json!({ "sub": "user-1", "exp": now_secs() + 3600 });
        let token = issue_token(&key, claims, "k1");

        let err = verifier.parse(&token, &provider).await.unwrap_err();
        assert!(matches!(err, AuthError::UnknownKeyId(_)));
    }
}
