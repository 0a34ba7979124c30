use chrono::{DateTime, Duration, SecondsFormat, Utc};
use listings_core::{Error, Result};
use serde::Deserialize;

/// One listing as returned by the API. Opaque to the engine.
pub type Record = serde_json::Map<String, serde_json::Value>;

pub const PUBLISHED_AT: &str = "published_at";

#[derive(Clone)]
pub struct Credential {
    pub client_id: String,
    pub client_secret: String,
}

impl Credential {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Clone)]
pub struct Token {
    pub access_token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    /// A token is usable while `now + margin` is still before its expiry.
    ///
    /// The margin is capped at half the token's lifetime, so a short-lived
    /// token is still reused for the first half of its life.
    pub fn is_usable_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let half_life = ((self.expires_at - self.issued_at) / 2).max(Duration::zero());
        now + margin.min(half_life) < self.expires_at
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListingResponse {
    #[serde(default)]
    pub animals: Vec<Record>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Pagination {
    pub total_count: u64,
    #[serde(default)]
    pub total_pages: Option<u64>,
}

/// `[after, before)` range on the `published_at` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub before: DateTime<Utc>,
    pub after: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(before: DateTime<Utc>, after: DateTime<Utc>) -> Self {
        Self { before, after }
    }

    /// Window ending at `before` and reaching `days` back.
    pub fn spanning_days(before: DateTime<Utc>, days: i64) -> Result<Self> {
        let after = Duration::try_days(days)
            .and_then(|span| before.checked_sub_signed(span))
            .ok_or_else(|| {
                Error::Validation(format!("window of {days} days before {before} is out of range"))
            })?;
        Ok(Self { before, after })
    }

    pub fn is_open(&self) -> bool {
        self.before > self.after
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
}

impl PageRequest {
    pub fn page(page: u32) -> Self {
        Self {
            page,
            before: None,
            after: None,
        }
    }

    pub fn windowed(page: u32, window: TimeWindow) -> Self {
        Self {
            page,
            before: Some(window.before),
            after: Some(window.after),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    Ok,
    /// The request budget refused the call; nothing was sent.
    BudgetExhausted,
    SoftFailure(String),
}

#[derive(Debug, Clone)]
pub struct Page {
    pub request: PageRequest,
    pub records: Vec<Record>,
    pub outcome: PageOutcome,
}

impl Page {
    pub fn ok(request: PageRequest, records: Vec<Record>) -> Self {
        Self {
            request,
            records,
            outcome: PageOutcome::Ok,
        }
    }

    pub fn refused(request: PageRequest) -> Self {
        Self {
            request,
            records: Vec::new(),
            outcome: PageOutcome::BudgetExhausted,
        }
    }

    pub fn soft_failure(request: PageRequest, reason: impl Into<String>) -> Self {
        Self {
            request,
            records: Vec::new(),
            outcome: PageOutcome::SoftFailure(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftFailure {
    pub page: u32,
    pub reason: String,
}

/// Formats a bound the way the listing endpoint expects it (`2024-01-20T00:00:00Z`).
pub fn format_bound(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parses a `published_at` value. The API emits `+0000` offsets, which strict RFC 3339 rejects.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

pub fn published_at(record: &Record) -> Option<DateTime<Utc>> {
    record
        .get(PUBLISHED_AT)
        .and_then(|v| v.as_str())
        .and_then(parse_timestamp)
}

/// Oldest `published_at` among the records, ignoring records without one.
pub fn oldest_published(records: &[Record]) -> Option<DateTime<Utc>> {
    records.iter().filter_map(published_at).min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn parses_api_and_rfc3339_timestamps() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 19, 12, 30, 0).unwrap();

        assert_eq!(parse_timestamp("2024-01-19T12:30:00+0000"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-19T12:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-19T14:30:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn oldest_published_skips_records_without_timestamp() {
        let records = vec![
            record(json!({"id": 1, "published_at": "2024-01-19T00:00:00+0000"})),
            record(json!({"id": 2})),
            record(json!({"id": 3, "published_at": "2024-01-17T00:00:00+0000"})),
        ];

        assert_eq!(
            oldest_published(&records),
            Some(Utc.with_ymd_and_hms(2024, 1, 17, 0, 0, 0).unwrap())
        );
        assert_eq!(oldest_published(&[record(json!({"id": 4}))]), None);
    }

    #[test]
    fn token_usability_respects_margin() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let token = Token {
            access_token: "t".into(),
            issued_at: now - Duration::seconds(3540),
            expires_at: now + Duration::seconds(60),
        };

        assert!(token.is_usable_at(now, Duration::zero()));
        assert!(!token.is_usable_at(now, Duration::seconds(60)));
        assert!(!token.is_usable_at(now + Duration::seconds(61), Duration::zero()));
    }

    #[test]
    fn margin_is_capped_at_half_the_token_lifetime() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let token = Token {
            access_token: "t".into(),
            issued_at: now,
            expires_at: now + Duration::seconds(20),
        };

        assert!(token.is_usable_at(now, Duration::seconds(30)));
        assert!(token.is_usable_at(now + Duration::seconds(9), Duration::seconds(30)));
        assert!(!token.is_usable_at(now + Duration::seconds(10), Duration::seconds(30)));
    }

    #[test]
    fn window_spanning_days() {
        let before = Utc.with_ymd_and_hms(2024, 1, 20, 0, 0, 0).unwrap();
        let window = TimeWindow::spanning_days(before, 10).expect("window");

        assert_eq!(window.after, Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap());
        assert!(window.is_open());
        assert_eq!(format_bound(window.before), "2024-01-20T00:00:00Z");
    }

    #[test]
    fn window_spanning_too_many_days_is_rejected() {
        let before = Utc.with_ymd_and_hms(2024, 1, 20, 0, 0, 0).unwrap();

        assert!(matches!(
            TimeWindow::spanning_days(before, i64::MAX),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            TimeWindow::spanning_days(before, 100_000_000),
            Err(Error::Validation(_))
        ));
    }
}
