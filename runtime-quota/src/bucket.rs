//! A single quota bucket: local counting between syncs with the remote
//! quota service, per §4.8.
//!
//! Grounded on `integration-gateway/src/rate_limiter.rs`'s
//! `InMemoryRateLimiter` (a `Mutex`-guarded counter + fixed window),
//! generalized from a single allowed/rejected count to the
//! allowed/used/exceeded/pending-weight model the remote service expects,
//! with the lock held only across pure computation per the spec's §5
//! concurrency contract.

use std::sync::Mutex;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use runtime_product::{Quota, TimeUnit};

use crate::error::{QuotaError, QuotaResult as Result};

/// The request shape a bucket is built from — its compatibility key.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestTemplate {
    pub identifier: String,
    pub interval: i64,
    pub allow: i64,
    pub time_unit: TimeUnit,
}

impl RequestTemplate {
    pub fn from_quota(identifier: impl Into<String>, quota: Quota) -> Self {
        Self {
            identifier: identifier.into(),
            interval: quota.interval,
            allow: quota.limit,
            time_unit: quota.time_unit,
        }
    }
}

/// The last result returned to a caller, whether computed locally or
/// received from a sync.
#[derive(Debug, Clone, Copy)]
pub struct QuotaOutcome {
    pub allowed: i64,
    pub used: i64,
    pub exceeded: i64,
    pub expiry: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

impl QuotaOutcome {
    fn zero(allowed: i64, expiry: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            allowed,
            used: 0,
            exceeded: 0,
            expiry,
            timestamp: now,
        }
    }
}

/// `calcLocalExpiry(now, interval, unit)` per §4.8.
pub fn calc_local_expiry(now: DateTime<Utc>, interval: i64, unit: TimeUnit) -> DateTime<Utc> {
    let start = match unit {
        TimeUnit::Second => now.with_nanosecond(0).unwrap(),
        TimeUnit::Minute => now.with_second(0).unwrap().with_nanosecond(0).unwrap(),
        TimeUnit::Hour => now
            .with_minute(0)
            .unwrap()
            .with_second(0)
            .unwrap()
            .with_nanosecond(0)
            .unwrap(),
        TimeUnit::Day => now
            .with_hour(0)
            .unwrap()
            .with_minute(0)
            .unwrap()
            .with_second(0)
            .unwrap()
            .with_nanosecond(0)
            .unwrap(),
        TimeUnit::Month => Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
            .unwrap(),
    };

    let span = match unit {
        TimeUnit::Second => ChronoDuration::seconds(interval),
        TimeUnit::Minute => ChronoDuration::minutes(interval),
        TimeUnit::Hour => ChronoDuration::hours(interval),
        TimeUnit::Day => ChronoDuration::days(interval),
        TimeUnit::Month => {
            let months = u32::try_from(interval.max(0)).unwrap_or(0);
            let end = shift_months(start, months);
            return end - ChronoDuration::seconds(1);
        }
    };

    // The subtracted epsilon has to be finer than `unit` itself, or a
    // one-unit interval collapses to a zero-length (already-expired)
    // window. Every unit above `Second` has whole seconds below it to
    // borrow from; `Second` itself only has sub-second precision left.
    let epsilon = match unit {
        TimeUnit::Second => ChronoDuration::nanoseconds(1),
        _ => ChronoDuration::seconds(1),
    };
    start + span - epsilon
}

fn shift_months(date: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    let total = date.month0() + months;
    let year = date.year() + (total / 12) as i32;
    let month = total % 12 + 1;
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single().unwrap()
}

#[derive(Serialize)]
struct SyncRequestBody {
    identifier: String,
    weight: i64,
    interval: i64,
    allow: i64,
    #[serde(rename = "timeUnit")]
    time_unit: String,
}

#[derive(Deserialize)]
struct SyncResponseBody {
    allowed: i64,
    used: i64,
    exceeded: i64,
    #[serde(rename = "expiryTime")]
    expiry_time_ms: i64,
    timestamp: i64,
}

fn time_unit_wire(unit: TimeUnit) -> &'static str {
    match unit {
        TimeUnit::Second => "second",
        TimeUnit::Minute => "minute",
        TimeUnit::Hour => "hour",
        TimeUnit::Day => "day",
        TimeUnit::Month => "month",
    }
}

struct BucketState {
    template: RequestTemplate,
    pending_weight: i64,
    last: QuotaOutcome,
    local_expiry: DateTime<Utc>,
    created: DateTime<Utc>,
    checked: DateTime<Utc>,
    synced: DateTime<Utc>,
}

pub struct QuotaBucket {
    state: Mutex<BucketState>,
}

impl QuotaBucket {
    pub fn new(template: RequestTemplate) -> Self {
        let now = Utc::now();
        let local_expiry = calc_local_expiry(now, template.interval, template.time_unit);
        let allow = template.allow;
        Self {
            state: Mutex::new(BucketState {
                template,
                pending_weight: 0,
                last: QuotaOutcome::zero(allow, local_expiry, now),
                local_expiry,
                created: now,
                checked: now,
                synced: now,
            }),
        }
    }

    pub fn is_compatible(&self, template: &RequestTemplate) -> bool {
        let state = self.state.lock().expect("bucket mutex poisoned");
        &state.template == template
    }

    /// `apply`: step 4 of §4.8.
    pub fn apply(&self, weight: i64) -> QuotaOutcome {
        let mut state = self.state.lock().expect("bucket mutex poisoned");
        let now = Utc::now();

        if now > state.local_expiry {
            state.last.used = 0;
            state.last.exceeded = 0;
            state.pending_weight = 0;
            state.local_expiry = calc_local_expiry(now, state.template.interval, state.template.time_unit);
        }

        let mut used = state.last.used + state.last.exceeded + state.pending_weight + weight;
        let allow = state.template.allow;
        let exceeded = if used > allow {
            let over = used - allow;
            used = allow;
            over
        } else {
            0
        };

        state.pending_weight += weight;
        state.checked = now;
        state.last = QuotaOutcome {
            allowed: allow,
            used,
            exceeded,
            expiry: state.local_expiry,
            timestamp: now,
        };
        state.last
    }

    pub fn needs_sync(&self, refresh_after: ChronoDuration) -> bool {
        let state = self.state.lock().expect("bucket mutex poisoned");
        state.pending_weight > 0 || Utc::now() > state.synced + refresh_after
    }

    pub fn is_idle(&self, delete_after: ChronoDuration) -> bool {
        let state = self.state.lock().expect("bucket mutex poisoned");
        state.pending_weight == 0 && Utc::now() > state.checked + delete_after
    }

    fn snapshot_for_sync(&self) -> (SyncRequestBody, DateTime<Utc>) {
        let state = self.state.lock().expect("bucket mutex poisoned");
        let now = Utc::now();
        let window_expired = now > state.local_expiry;
        let weight = if window_expired { 0 } else { state.pending_weight };
        (
            SyncRequestBody {
                identifier: state.template.identifier.clone(),
                weight,
                interval: state.template.interval,
                allow: state.template.allow,
                time_unit: time_unit_wire(state.template.time_unit).to_string(),
            },
            state.local_expiry,
        )
    }

    /// `bucket.sync()`: POSTs the accumulated request and applies the
    /// server's authoritative result.
    pub async fn sync(&self, client: &Client, base_url: &str) -> Result<()> {
        let (body, expiry_before) = self.snapshot_for_sync();
        let synced_weight = body.weight;
        let url = format!("{}/quotas", base_url.trim_end_matches('/'));

        let response = client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| QuotaError::Sync(err.to_string()))?;

        if !response.status().is_success() {
            return Err(QuotaError::Sync(format!("HTTP {} from {url}", response.status())));
        }

        let parsed: SyncResponseBody = response.json().await.map_err(|err| QuotaError::Decode(err.to_string()))?;

        let mut state = self.state.lock().expect("bucket mutex poisoned");
        let new_expiry = Utc
            .timestamp_millis_opt(parsed.expiry_time_ms)
            .single()
            .unwrap_or(expiry_before);
        let timestamp = Utc.timestamp_opt(parsed.timestamp, 0).single().unwrap_or_else(Utc::now);

        state.last = QuotaOutcome {
            allowed: parsed.allowed,
            used: parsed.used,
            exceeded: parsed.exceeded,
            expiry: new_expiry,
            timestamp,
        };

        if new_expiry != expiry_before {
            state.pending_weight = 0;
        } else {
            state.pending_weight = (state.pending_weight - synced_weight).max(0);
        }
        state.local_expiry = new_expiry;
        state.synced = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn template() -> RequestTemplate {
        RequestTemplate {
            identifier: "p~test~app".to_string(),
            interval: 1,
            allow: 5,
            time_unit: TimeUnit::Minute,
        }
    }

    #[test]
    fn apply_accumulates_and_caps_at_allow() {
        let bucket = QuotaBucket::new(template());
        let first = bucket.apply(3);
        assert_eq!(first.used, 3);
        assert_eq!(first.exceeded, 0);

        let second = bucket.apply(4);
        assert_eq!(second.used, 5);
        assert_eq!(second.exceeded, 2);
    }

    #[test]
    fn compatibility_checks_full_template() {
        let bucket = QuotaBucket::new(template());
        assert!(bucket.is_compatible(&template()));
        let mut other = template();
        other.allow = 10;
        assert!(!bucket.is_compatible(&other));
    }

    #[test]
    fn calc_local_expiry_truncates_to_minute_boundary() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 10, 30, 45).unwrap();
        let expiry = calc_local_expiry(now, 1, TimeUnit::Minute);
        let expected = Utc.with_ymd_and_hms(2026, 1, 1, 10, 31, 0).unwrap() - ChronoDuration::seconds(1);
        assert_eq!(expiry, expected);
    }

    #[test]
    fn calc_local_expiry_handles_month_rollover() {
        let now = Utc.with_ymd_and_hms(2026, 12, 15, 5, 0, 0).unwrap();
        let expiry = calc_local_expiry(now, 1, TimeUnit::Month);
        let expected = Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap() - ChronoDuration::seconds(1);
        assert_eq!(expiry, expected);
    }

    #[test]
    fn window_rollover_resets_the_counter_once_the_second_boundary_passes() {
        let bucket = QuotaBucket::new(RequestTemplate {
            identifier: "p~test~app".to_string(),
            interval: 1,
            allow: 1,
            time_unit: TimeUnit::Second,
        });

        let first = bucket.apply(1);
        assert_eq!(first.used, 1);
        assert_eq!(first.exceeded, 0);

        // Same window: a second unit of weight is entirely over the limit.
        let second = bucket.apply(1);
        assert_eq!(second.used, 1);
        assert_eq!(second.exceeded, 1);

        std::thread::sleep(std::time::Duration::from_millis(1100));

        let third = bucket.apply(1);
        assert_eq!(third.used, 1);
        assert_eq!(third.exceeded, 0);
    }
}
