use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, AuthResult};

/// Verified JWT claims, generalized over whatever the token issuer puts in
/// the payload. Callers that need product/application identity combine
/// this with gateway-supplied context rather than expecting it here.
#[derive(Debug, Clone, Serialize)]
pub struct Claims {
    pub subject: String,
    pub issuer: String,
    pub audience: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub not_before: Option<DateTime<Utc>>,
    pub issued_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ClaimsRepr {
    #[serde(default)]
    sub: String,
    #[serde(default)]
    iss: String,
    #[serde(default)]
    aud: Option<AudienceRepr>,
    exp: Option<i64>,
    nbf: Option<i64>,
    iat: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AudienceRepr {
    Single(String),
    Many(Vec<String>),
}

fn timestamp(field: &'static str, secs: Option<i64>) -> AuthResult<Option<DateTime<Utc>>> {
    match secs {
        None => Ok(None),
        Some(secs) => Utc
            .timestamp_opt(secs, 0)
            .single()
            .map(Some)
            .ok_or_else(|| AuthError::InvalidClaim(field, secs.to_string())),
    }
}

impl TryFrom<serde_json::Value> for Claims {
    type Error = AuthError;

    fn try_from(value: serde_json::Value) -> AuthResult<Self> {
        let repr: ClaimsRepr = serde_json::from_value(value.clone())
            .map_err(|err| AuthError::InvalidJson(err.to_string()))?;

        let audience = match repr.aud {
            Some(AudienceRepr::Single(item)) => vec![item],
            Some(AudienceRepr::Many(items)) => items,
            None => Vec::new(),
        };
        let scopes = repr
            .scope
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        Ok(Self {
            subject: repr.sub,
            issuer: repr.iss,
            audience,
            expires_at: timestamp("exp", repr.exp)?,
            not_before: timestamp("nbf", repr.nbf)?,
            issued_at: timestamp("iat", repr.iat)?,
            scopes,
            raw: value,
        })
    }
}

impl Claims {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// `true` if `self.scopes` and `required` share at least one entry, or
    /// `required` is empty.
    pub fn scopes_intersect(&self, required: &[String]) -> bool {
        required.is_empty() || required.iter().any(|r| self.has_scope(r))
    }
}
