//! Incremental event polling.
//!
//! Each call to [`Poller::poll`] asks the event source for everything at or
//! after the cursor watermark, drops the events already delivered at exactly
//! that watermark, and returns the rest as incidents together with the cursor
//! to use next time. Events sharing a timestamp across a page boundary are
//! delivered once because their ids are carried in the cursor.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{ DateTime, Duration, Utc };
use thiserror::Error;
use tracing::{ debug, info, trace, warn };

use crate::{
    cursor::Cursor,
    event::{ Incident, RawEvent, SeverityScore },
    timestamp::{ ParseError, TimestampParser },
    utils,
};

/// Vendors cap search pages at this size.
pub const MAX_PAGE_SIZE: usize = 50;
/// Longest accepted first fetch lookback, in days.
pub const MAX_FIRST_FETCH_DAYS: i64 = 36_500;

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Returns events with `occurred_at >= min_time`, ascending, at most
    /// `page_size` of them.
    async fn search(
        &self,
        min_time: DateTime<Utc>,
        page_size: usize,
        verbose: bool
    ) -> Result<Vec<RawEvent>>;
}

#[async_trait]
impl<T: EventSource + ?Sized> EventSource for Box<T> {
    async fn search(
        &self,
        min_time: DateTime<Utc>,
        page_size: usize,
        verbose: bool
    ) -> Result<Vec<RawEvent>> {
        (**self).search(min_time, page_size, verbose).await
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Error, Debug)]
pub enum PollError {
    #[error("event source query failed: {0:#}")] SourceQuery(anyhow::Error),
    #[error(transparent)] Parse(#[from] ParseError),
    #[error("first fetch lookback reaches past the earliest representable time")] Lookback,
}

/// A failed poll. `cursor` is the one the poll started from, so storing it (or
/// simply not storing anything) retries the same window next time.
#[derive(Error, Debug)]
#[error("{kind}")]
pub struct IngestionError {
    pub cursor: Option<Cursor>,
    pub kind: PollError,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PollerConfig {
    pub first_fetch: Duration,
    pub page_size: usize,
    pub verbose: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig {
            first_fetch: Duration::days(3),
            page_size: MAX_PAGE_SIZE,
            verbose: false,
        }
    }
}

impl PollerConfig {
    /// Rejects a negative or too long lookback and an empty page, and caps the
    /// page size.
    pub fn new(first_fetch: Duration, page_size: usize, verbose: bool) -> Result<Self> {
        if first_fetch < Duration::zero() {
            return Err(anyhow::anyhow!("first fetch lookback cannot be negative"));
        }
        if first_fetch > Duration::days(MAX_FIRST_FETCH_DAYS) {
            return Err(
                anyhow::anyhow!("first fetch lookback cannot exceed {} days", MAX_FIRST_FETCH_DAYS)
            );
        }
        if page_size == 0 {
            return Err(anyhow::anyhow!("page size must be a positive number"));
        }
        Ok(PollerConfig {
            first_fetch,
            page_size: page_size.min(MAX_PAGE_SIZE),
            verbose,
        })
    }
}

#[derive(Debug)]
pub struct PollOutcome {
    pub next_cursor: Cursor,
    pub incidents: Vec<Incident>,
}

pub struct Poller<S, P, C = SystemClock> {
    source: S,
    parser: P,
    clock: C,
    config: PollerConfig,
}

impl<S: EventSource, P: TimestampParser> Poller<S, P, SystemClock> {
    pub fn new(source: S, parser: P, config: PollerConfig) -> Self {
        Poller { source, parser, clock: SystemClock, config }
    }
}

impl<S: EventSource, P: TimestampParser, C: Clock> Poller<S, P, C> {
    pub fn with_clock(source: S, parser: P, clock: C, config: PollerConfig) -> Self {
        Poller { source, parser, clock, config }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    pub async fn poll(&self, cursor: Option<Cursor>) -> Result<PollOutcome, IngestionError> {
        match self.poll_inner(cursor.as_ref()).await {
            Ok(v) => Ok(v),
            Err(kind) => Err(IngestionError { cursor, kind }),
        }
    }

    async fn poll_inner(&self, cursor: Option<&Cursor>) -> Result<PollOutcome, PollError> {
        let start = match cursor {
            Some(c) => c.clone(),
            None => {
                let start = self.clock
                    .now()
                    .checked_sub_signed(self.config.first_fetch)
                    .ok_or(PollError::Lookback)?;
                let c = Cursor::new(start);
                info!(
                    watermark = %utils::format_timestamp(&c.watermark),
                    "no cursor yet, starting from first fetch lookback"
                );
                c
            }
        };

        let events = self.source
            .search(start.watermark, self.config.page_size, self.config.verbose).await
            .map_err(PollError::SourceQuery)?;
        let returned = events.len();
        debug!(count = returned, "event source returned");

        let mut next = start.clone();
        let mut incidents = Vec::with_capacity(events.len());
        for mut e in events {
            if !self.config.verbose {
                e.strip_detail();
            }
            let occurred = self.parser.parse(&e.occurred_at)?;
            if start.has_seen(&occurred, &e.id) {
                trace!(event_id = %e.id, "already delivered, skipping");
                continue;
            }
            next.advance(occurred, &e.id);
            incidents.push(Incident {
                name: e.summary.clone(),
                occurred,
                severity_score: SeverityScore::from_vendor(&e.severity),
                raw_payload: e.into_raw_payload(),
            });
        }

        if returned == self.config.page_size && incidents.is_empty() {
            warn!(
                page_size = returned,
                watermark = %utils::format_timestamp(&start.watermark),
                "a full page was already delivered, more events share this timestamp than fit in one page"
            );
        }
        debug!(
            accepted = incidents.len(),
            watermark = %utils::format_timestamp(&next.watermark),
            seen = next.seen_ids.len(),
            "poll finished"
        );
        Ok(PollOutcome { next_cursor: next, incidents })
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::collections::HashSet;
    use std::sync::Arc;

    use anyhow::anyhow;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::timestamp::VendorTimestampParser;

    pub fn raw(id: &str, occurred_at: &str, severity: &str) -> RawEvent {
        let record =
            json!({
            "eventId": id,
            "persistedTime": occurred_at,
            "severity": severity,
            "incidentSummary": format!("summary {}", id),
            "eventDetail": { "id": id }
        });
        RawEvent::from_record(
            id.into(),
            occurred_at.into(),
            severity.into(),
            format!("summary {}", id),
            "eventDetail",
            record.as_object().cloned().unwrap()
        )
    }

    /// Serves `events` the way a vendor would: filtered by `min_time`, sorted,
    /// truncated to the page size. Records the requested watermarks.
    #[derive(Clone, Default)]
    pub struct FakeSource {
        pub events: Arc<Mutex<Vec<RawEvent>>>,
        pub queries: Arc<Mutex<Vec<(DateTime<Utc>, usize, bool)>>>,
        pub fail: Arc<Mutex<bool>>,
    }

    impl FakeSource {
        pub fn with(events: Vec<RawEvent>) -> Self {
            let s = FakeSource::default();
            *s.events.lock() = events;
            s
        }
    }

    #[async_trait]
    impl EventSource for FakeSource {
        async fn search(
            &self,
            min_time: DateTime<Utc>,
            page_size: usize,
            verbose: bool
        ) -> Result<Vec<RawEvent>> {
            self.queries.lock().push((min_time, page_size, verbose));
            if *self.fail.lock() {
                return Err(anyhow!("connection refused"));
            }
            let p = VendorTimestampParser;
            let mut v: Vec<RawEvent> = self.events
                .lock()
                .iter()
                .filter(|e| p.parse(&e.occurred_at).unwrap() >= min_time)
                .cloned()
                .collect();
            v.sort_by_key(|e| p.parse(&e.occurred_at).unwrap());
            v.truncate(page_size);
            Ok(v)
        }
    }

    pub struct FixedClock(pub DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 9, 1, 0, 0, 0).unwrap()
    }

    fn poller(source: FakeSource, config: PollerConfig) -> Poller<FakeSource, VendorTimestampParser, FixedClock> {
        Poller::with_clock(source, VendorTimestampParser, FixedClock(now()), config)
    }

    fn ts(s: &str) -> DateTime<Utc> {
        VendorTimestampParser.parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_first_poll_then_tie_at_watermark() {
        let source = FakeSource::with(vec![raw("e1", "2020-08-30T10:00:00.000Z", "critical")]);
        let p = poller(source.clone(), PollerConfig::default());

        let out = p.poll(None).await.unwrap();
        assert_eq!(source.queries.lock()[0].0, now() - Duration::days(3));
        assert_eq!(out.incidents.len(), 1);
        let i = &out.incidents[0];
        assert_eq!(i.severity_score, SeverityScore::High);
        assert_eq!(utils::format_timestamp(&i.occurred), "2020-08-30T10:00:00.000Z");
        assert_eq!(out.next_cursor.watermark, ts("2020-08-30T10:00:00.000Z"));
        assert_eq!(out.next_cursor.seen_ids, ["e1".to_string()].into_iter().collect());

        source.events.lock().push(raw("e2", "2020-08-30T10:00:00.000Z", "low"));
        let out2 = p.poll(Some(out.next_cursor)).await.unwrap();
        let ids: Vec<_> = out2.incidents.iter().map(|i| i.raw_payload["eventId"].clone()).collect();
        assert_eq!(ids, vec![json!("e2")]);
        assert_eq!(out2.incidents[0].severity_score, SeverityScore::Low);
        assert_eq!(out2.next_cursor.seen_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_idempotent_when_nothing_new() {
        let source = FakeSource::with(vec![raw("e1", "2020-08-30T10:00:00.000Z", "low")]);
        let p = poller(source, PollerConfig::default());
        let first = p.poll(None).await.unwrap();
        let c = first.next_cursor;
        let a = p.poll(Some(c.clone())).await.unwrap();
        let b = p.poll(Some(a.next_cursor.clone())).await.unwrap();
        assert!(a.incidents.is_empty());
        assert!(b.incidents.is_empty());
        assert_eq!(a.next_cursor, c);
        assert_eq!(b.next_cursor, c);
    }

    #[tokio::test]
    async fn test_empty_source_keeps_cursor() {
        let p = poller(FakeSource::default(), PollerConfig::default());
        let c = Cursor::new(ts("2020-08-30T10:00:00Z"));
        let out = p.poll(Some(c.clone())).await.unwrap();
        assert_eq!(out.next_cursor, c);

        let boot = p.poll(None).await.unwrap();
        assert_eq!(boot.next_cursor, Cursor::new(now() - Duration::days(3)));
    }

    #[tokio::test]
    async fn test_no_duplicates_across_small_pages() {
        let events = vec![
            raw("a", "2020-08-30T10:00:00Z", "low"),
            raw("b", "2020-08-30T10:00:00Z", "low"),
            raw("c", "2020-08-30T10:00:00Z", "high"),
            raw("d", "2020-08-30T10:00:01Z", "low"),
            raw("e", "2020-08-30T10:00:01Z", "medium"),
            raw("f", "2020-08-30T10:00:02Z", "low")
        ];
        let p = poller(FakeSource::with(events), PollerConfig::new(Duration::days(3), 4, false).unwrap());

        let mut cursor = None;
        let mut delivered = vec![];
        let mut last_watermark = now() - Duration::days(3);
        for _ in 0..10 {
            let out = p.poll(cursor.take()).await.unwrap();
            assert!(out.next_cursor.watermark >= last_watermark);
            last_watermark = out.next_cursor.watermark;
            for i in out.incidents {
                delivered.push(i.raw_payload["eventId"].as_str().unwrap().to_string());
            }
            cursor = Some(out.next_cursor);
        }
        let unique: HashSet<_> = delivered.iter().cloned().collect();
        assert_eq!(unique.len(), delivered.len());
        assert_eq!(delivered, vec!["a", "b", "c", "d", "e", "f"]);
    }

    #[tokio::test]
    async fn test_detail_stripped_unless_verbose() {
        let events = vec![raw("e1", "2020-08-30T10:00:00Z", "low")];
        let quiet = poller(FakeSource::with(events.clone()), PollerConfig::default());
        let out = quiet.poll(None).await.unwrap();
        assert!(out.incidents[0].raw_payload.get("eventDetail").is_none());

        let source = FakeSource::with(events);
        let loud = poller(source.clone(), PollerConfig::new(Duration::days(3), 10, true).unwrap());
        let out = loud.poll(None).await.unwrap();
        assert_eq!(out.incidents[0].raw_payload["eventDetail"]["id"], "e1");
        assert_eq!(source.queries.lock()[0].1, 10);
        assert!(source.queries.lock()[0].2);
    }

    #[tokio::test]
    async fn test_source_error_carries_cursor() {
        let source = FakeSource::default();
        *source.fail.lock() = true;
        let p = poller(source, PollerConfig::default());
        let c = Cursor::new(ts("2020-08-30T10:00:00Z"));
        let err = p.poll(Some(c.clone())).await.unwrap_err();
        assert_eq!(err.cursor, Some(c));
        assert!(matches!(err.kind, PollError::SourceQuery(_)));
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_bad_timestamp_aborts_poll() {
        let mut bad = raw("e2", "2020-08-30T10:00:00Z", "low");
        bad.occurred_at = "not a time".into();
        let p = Poller::with_clock(
            StaticSource(vec![raw("e1", "2020-08-30T10:00:00Z", "low"), bad]),
            VendorTimestampParser,
            FixedClock(now()),
            PollerConfig::default()
        );
        let err = p.poll(None).await.unwrap_err();
        assert!(err.cursor.is_none());
        assert!(matches!(err.kind, PollError::Parse(_)));
    }

    #[tokio::test]
    async fn test_unknown_severity_is_not_fatal() {
        let p = poller(FakeSource::with(vec![raw("e1", "2020-08-30T10:00:00Z", "Unknown")]), PollerConfig::default());
        let out = p.poll(None).await.unwrap();
        assert_eq!(out.incidents[0].severity_score, SeverityScore::Unknown);
    }

    #[tokio::test]
    async fn test_reloaded_cursor_keeps_sub_millisecond_tie() {
        let source = FakeSource::with(vec![raw("e1", "2020-08-30T10:00:00.123456Z", "low")]);
        let p = poller(source, PollerConfig::default());
        let mut stored: Option<String> = None;
        let mut delivered = 0;
        for _ in 0..3 {
            let cursor = stored.as_deref().map(|s| Cursor::from_json(s).unwrap());
            let out = p.poll(cursor).await.unwrap();
            delivered += out.incidents.len();
            stored = Some(out.next_cursor.to_json().unwrap());
        }
        assert_eq!(delivered, 1);
        let last = Cursor::from_json(stored.as_deref().unwrap()).unwrap();
        assert_eq!(last.watermark, ts("2020-08-30T10:00:00.123456Z"));
    }

    #[tokio::test]
    async fn test_bootstrap_before_earliest_time_fails() {
        let p = Poller::with_clock(
            FakeSource::default(),
            VendorTimestampParser,
            FixedClock(DateTime::<Utc>::MIN_UTC),
            PollerConfig::default()
        );
        let err = p.poll(None).await.unwrap_err();
        assert!(err.cursor.is_none());
        assert!(matches!(err.kind, PollError::Lookback));
    }

    #[test]
    fn test_config_validation() {
        assert!(PollerConfig::new(Duration::days(MAX_FIRST_FETCH_DAYS + 1), 10, false).is_err());
        assert!(PollerConfig::new(Duration::days(MAX_FIRST_FETCH_DAYS), 10, false).is_ok());
        assert!(PollerConfig::new(Duration::days(-1), 10, false).is_err());
        assert!(PollerConfig::new(Duration::days(1), 0, false).is_err());
        assert_eq!(PollerConfig::new(Duration::zero(), 500, false).unwrap().page_size, MAX_PAGE_SIZE);
    }

    /// Returns the same list regardless of the query.
    struct StaticSource(Vec<RawEvent>);

    #[async_trait]
    impl EventSource for StaticSource {
        async fn search(&self, _: DateTime<Utc>, _: usize, _: bool) -> Result<Vec<RawEvent>> {
            Ok(self.0.clone())
        }
    }
}
