//! Read-only click analytics over the URL store.

use serde::Serialize;
use time::OffsetDateTime;

use crate::url_repo::{ClickEvent, ShortLinkRecord};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub total_urls: usize,
    pub total_clicks: u64,
    pub average_clicks: f64,
    pub urls: Vec<UrlStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlStats {
    pub original_url: String,
    pub shortcode: String,
    pub short_url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub clicks: u64,
    pub expired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickDetails {
    pub shortcode: String,
    pub clicks: u64,
    pub click_details: Vec<ClickEvent>,
}

/// Summarizes `urls` as of `now`.
#[must_use]
pub fn summarize(urls: &[ShortLinkRecord], now: OffsetDateTime) -> StatsReport {
    let total_clicks: u64 = urls.iter().map(|url| url.clicks).sum();
    #[allow(clippy::cast_precision_loss)]
    let average_clicks = if urls.is_empty() {
        0.0
    } else {
        total_clicks as f64 / urls.len() as f64
    };

    StatsReport {
        total_urls: urls.len(),
        total_clicks,
        average_clicks,
        urls: urls
            .iter()
            .map(|url| UrlStats {
                original_url: url.original_url.clone(),
                shortcode: url.shortcode.clone(),
                short_url: url.short_url.clone(),
                created_at: url.created_at,
                expires_at: url.expires_at,
                clicks: url.clicks,
                expired: url.expires_at < now,
            })
            .collect(),
    }
}

impl From<ShortLinkRecord> for ClickDetails {
    fn from(url: ShortLinkRecord) -> Self {
        Self {
            shortcode: url.shortcode,
            clicks: url.clicks,
            click_details: url.click_details,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use time::Duration;

    use super::*;

    fn record(code: &str, clicks: u64, expires_at: OffsetDateTime) -> ShortLinkRecord {
        ShortLinkRecord {
            original_url: "https://example.com".to_owned(),
            shortcode: code.to_owned(),
            short_url: format!("http://localhost:8080/{code}"),
            created_at: expires_at - Duration::minutes(30),
            expires_at,
            clicks,
            click_details: Vec::new(),
        }
    }

    #[test]
    fn test_empty_store() {
        let report = summarize(&[], OffsetDateTime::now_utc());
        assert_eq!(report.total_urls, 0);
        assert_eq!(report.total_clicks, 0);
        assert!(report.average_clicks.abs() < f64::EPSILON);
        assert!(report.urls.is_empty());
    }

    #[test]
    fn test_totals_and_average() {
        let now = OffsetDateTime::now_utc();
        let urls = [
            record("aaaa", 3, now + Duration::minutes(5)),
            record("bbbb", 0, now + Duration::minutes(5)),
            record("cccc", 2, now + Duration::minutes(5)),
            record("dddd", 0, now + Duration::minutes(5)),
        ];
        let report = summarize(&urls, now);
        assert_eq!(report.total_urls, 4);
        assert_eq!(report.total_clicks, 5);
        assert!((report.average_clicks - 1.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_average_is_not_rounded() {
        let now = OffsetDateTime::now_utc();
        let urls = [
            record("aaaa", 1, now + Duration::minutes(5)),
            record("bbbb", 0, now + Duration::minutes(5)),
            record("cccc", 0, now + Duration::minutes(5)),
        ];
        let report = summarize(&urls, now);
        assert!((report.average_clicks - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_expiry_status_is_strictly_before_now() {
        let now = OffsetDateTime::now_utc();
        let urls = [
            record("past", 0, now - Duration::seconds(1)),
            record("edge", 0, now),
            record("later", 0, now + Duration::seconds(1)),
        ];
        let expired: Vec<_> = summarize(&urls, now)
            .urls
            .into_iter()
            .map(|url| url.expired)
            .collect();
        assert_eq!(expired, [true, false, false]);
    }

    #[test]
    fn test_click_details_from_record() {
        let now = OffsetDateTime::now_utc();
        let mut url = record("abcd", 0, now + Duration::minutes(1));
        url.record_click(ClickEvent::new(now, Some("https://ref.example")));
        url.record_click(ClickEvent::new(now, None));

        let details = ClickDetails::from(url);
        assert_eq!(details.clicks, 2);
        assert_eq!(details.click_details[0].source, "https://ref.example");
        assert_eq!(details.click_details[1].source, "Direct");
    }
}
