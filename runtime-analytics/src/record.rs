//! The analytics event record and its validation rules (§3, §8).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

use runtime_util::ErrorSet;

/// Attribute values the control plane accepts; anything else never makes
/// it past `TryFrom` at the call boundary, so there is no "other kind" to
/// reject here.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Number(f64),
    String(String),
    /// Serialized as milliseconds-since-epoch.
    Timestamp(#[serde(serialize_with = "serialize_millis")] DateTime<Utc>),
}

fn serialize_millis<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_i64(value.timestamp_millis())
}

pub const MAX_ATTRIBUTE_STRING_BYTES: usize = 400;
pub const MAX_ATTRIBUTES: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: AttributeValue) -> Self {
        let mut attr = Self { name: name.into(), value };
        attr.truncate();
        attr
    }

    fn truncate(&mut self) {
        if let AttributeValue::String(s) = &mut self.value {
            if s.len() > MAX_ATTRIBUTE_STRING_BYTES {
                let boundary = floor_char_boundary(s, MAX_ATTRIBUTE_STRING_BYTES);
                s.truncate(boundary);
            }
        }
    }

    /// The wire name: the `dc_` external prefix is rewritten to `dc.`.
    pub fn wire_name(&self) -> String {
        if let Some(rest) = self.name.strip_prefix("dc_") {
            format!("dc.{rest}")
        } else {
            self.name.clone()
        }
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut idx = index;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

pub const MAX_FUTURE_SKEW: ChronoDuration = ChronoDuration::seconds(60);
pub const MAX_AGE: ChronoDuration = ChronoDuration::days(90);

/// One API-call observation enriched with gateway/request context.
#[derive(Debug, Clone)]
pub struct Record {
    pub organization: String,
    pub environment: String,
    pub api_proxy: String,
    pub request_path: String,
    pub request_verb: String,
    pub response_status_code: i32,
    pub developer_email: Option<String>,
    pub application_name: Option<String>,
    pub client_id: Option<String>,
    pub access_token: Option<String>,
    pub product_name: Option<String>,
    pub flow_id: String,
    pub client_received_start: DateTime<Utc>,
    pub client_received_end: DateTime<Utc>,
    pub attributes: Vec<Attribute>,
}

impl Record {
    pub fn tenant(&self) -> String {
        format!("{}~{}", self.organization, self.environment)
    }

    /// The record as a JSON object, attribute keys rewritten per
    /// [`Attribute::wire_name`]. Shared by both the SaaS (one object per
    /// line) and fluentd (`[tag, ts, record]`) upload formats.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("organization".into(), self.organization.clone().into());
        map.insert("environment".into(), self.environment.clone().into());
        map.insert("apiProxy".into(), self.api_proxy.clone().into());
        map.insert("requestPath".into(), self.request_path.clone().into());
        map.insert("requestVerb".into(), self.request_verb.clone().into());
        map.insert("responseStatusCode".into(), self.response_status_code.into());
        map.insert("flowId".into(), self.flow_id.clone().into());
        map.insert(
            "clientReceivedStartTimestamp".into(),
            self.client_received_start.timestamp_millis().into(),
        );
        map.insert(
            "clientReceivedEndTimestamp".into(),
            self.client_received_end.timestamp_millis().into(),
        );
        if let Some(v) = &self.developer_email {
            map.insert("developerEmail".into(), v.clone().into());
        }
        if let Some(v) = &self.application_name {
            map.insert("applicationName".into(), v.clone().into());
        }
        if let Some(v) = &self.client_id {
            map.insert("clientId".into(), v.clone().into());
        }
        if let Some(v) = &self.access_token {
            map.insert("accessToken".into(), v.clone().into());
        }
        if let Some(v) = &self.product_name {
            map.insert("apiProduct".into(), v.clone().into());
        }
        for attr in &self.attributes {
            let value = serde_json::to_value(&attr.value).unwrap_or(serde_json::Value::Null);
            map.insert(attr.wire_name(), value);
        }
        serde_json::Value::Object(map)
    }

    /// Validates every invariant from §3/§8 at once, accumulating all
    /// violations rather than stopping at the first.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ErrorSet> {
        let mut errors = ErrorSet::new();

        if self.organization.is_empty() {
            errors.push(ValidationError::MissingField("organization"));
        }
        if self.environment.is_empty() {
            errors.push(ValidationError::MissingField("environment"));
        }
        if self.flow_id.is_empty() {
            errors.push(ValidationError::MissingField("flow_id"));
        }
        if self.client_received_end < self.client_received_start {
            errors.push(ValidationError::InvertedTimestamps);
        }
        if self.client_received_start > now + MAX_FUTURE_SKEW {
            errors.push(ValidationError::TooFarInFuture);
        }
        if self.client_received_start < now - MAX_AGE {
            errors.push(ValidationError::TooOld);
        }
        if self.attributes.len() > MAX_ATTRIBUTES {
            errors.push(ValidationError::TooManyAttributes(self.attributes.len()));
        }

        errors.into_result()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("record missing required field '{0}'")]
    MissingField(&'static str),
    #[error("client_received_end precedes client_received_start")]
    InvertedTimestamps,
    #[error("record timestamp is more than 60s in the future")]
    TooFarInFuture,
    #[error("record timestamp is more than 90 days old")]
    TooOld,
    #[error("record carries {0} attributes, more than the 100 allowed")]
    TooManyAttributes(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_record(now: DateTime<Utc>) -> Record {
        Record {
            organization: "org".to_string(),
            environment: "env".to_string(),
            api_proxy: "weatherapi".to_string(),
            request_path: "/forecast".to_string(),
            request_verb: "GET".to_string(),
            response_status_code: 200,
            developer_email: None,
            application_name: None,
            client_id: None,
            access_token: None,
            product_name: None,
            flow_id: "flow-1".to_string(),
            client_received_start: now,
            client_received_end: now,
            attributes: Vec::new(),
        }
    }

    #[test]
    fn valid_record_passes() {
        let now = Utc::now();
        assert!(base_record(now).validate(now).is_ok());
    }

    #[test]
    fn missing_flow_id_is_rejected() {
        let now = Utc::now();
        let mut record = base_record(now);
        record.flow_id.clear();
        assert!(record.validate(now).is_err());
    }

    #[test]
    fn one_minute_future_is_accepted_sixty_one_seconds_is_not() {
        let now = Utc::now();
        let mut record = base_record(now);
        record.client_received_start = now + ChronoDuration::seconds(60);
        record.client_received_end = record.client_received_start;
        assert!(record.validate(now).is_ok());

        record.client_received_start = now + ChronoDuration::seconds(61);
        record.client_received_end = record.client_received_start;
        assert!(record.validate(now).is_err());
    }

    #[test]
    fn ninety_day_boundary() {
        let now = Utc::now();
        let mut record = base_record(now);
        record.client_received_start = now - MAX_AGE + ChronoDuration::seconds(1);
        record.client_received_end = record.client_received_start;
        assert!(record.validate(now).is_ok());

        record.client_received_start = now - MAX_AGE - ChronoDuration::seconds(1);
        record.client_received_end = record.client_received_start;
        assert!(record.validate(now).is_err());
    }

    #[test]
    fn attribute_truncates_on_utf8_boundary() {
        let exact = "a".repeat(400);
        let attr = Attribute::new("note", AttributeValue::String(exact.clone()));
        assert_eq!(attr.value_as_str().unwrap().len(), 400);

        let over = "a".repeat(401);
        let attr = Attribute::new("note", AttributeValue::String(over));
        assert_eq!(attr.value_as_str().unwrap().len(), 400);

        let mut multi = "a".repeat(398);
        multi.push('€'); // 3-byte rune starting at byte 398
        multi.push('x');
        let attr = Attribute::new("note", AttributeValue::String(multi));
        assert_eq!(attr.value_as_str().unwrap().len(), 398);
    }

    #[test]
    fn dc_prefix_is_rewritten_on_the_wire() {
        let attr = Attribute::new("dc_region", AttributeValue::String("us".to_string()));
        assert_eq!(attr.wire_name(), "dc.region");
    }

    impl Attribute {
        fn value_as_str(&self) -> Option<&str> {
            match &self.value {
                AttributeValue::String(s) => Some(s),
                _ => None,
            }
        }
    }
}
