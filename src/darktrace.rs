use anyhow::{ anyhow, Result };
use async_trait::async_trait;
use chrono::{ DateTime, Utc };
use serde_json::{ Map, Value };
use tracing::debug;

use crate::{
    config::ConnectionConfig,
    event::RawEvent,
    http::{ ApiClient, Query },
    poller::EventSource,
    timestamp::{ TimestampParser, VendorTimestampParser },
};

pub mod commands;

const AUTH_HEADER: &str = "dtapi-token";
pub const DETAIL_FIELD: &str = "triggeredComponents";

#[derive(Clone)]
pub struct Client {
    api: ApiClient,
}

impl Client {
    pub fn new(conn: &ConnectionConfig) -> Result<Self> {
        Ok(Client { api: ApiClient::new(conn, AUTH_HEADER)? })
    }

    pub async fn get_breach(&self, pbid: u64) -> Result<Value> {
        self.api.get_json("/modelbreaches", &vec![("pbid", pbid.to_string())]).await
    }

    pub async fn get_comments(&self, pbid: u64) -> Result<Value> {
        self.api.get_json(&format!("/modelbreaches/{}/comments", pbid), &vec![]).await
    }

    pub async fn acknowledge(&self, pbid: u64) -> Result<Value> {
        self.api.post_json(
            &format!("/modelbreaches/{}/acknowledge", pbid),
            &vec![("acknowledge", "true".into())]
        ).await
    }

    pub async fn unacknowledge(&self, pbid: u64) -> Result<Value> {
        self.api.post_json(
            &format!("/modelbreaches/{}/unacknowledge", pbid),
            &vec![("unacknowledge", "true".into())]
        ).await
    }

    pub async fn search_breaches(&self, min_score: f64, start_time_ms: i64) -> Result<Value> {
        let q: Query = vec![
            ("minscore", min_score.to_string()),
            ("starttime", start_time_ms.to_string())
        ];
        self.api.get_json("/modelbreaches", &q).await
    }

    pub async fn similar_devices(&self, did: u64, count: u32) -> Result<Value> {
        let q: Query = vec![("did", did.to_string()), ("count", count.to_string())];
        self.api.get_json("/similardevices", &q).await
    }

    pub async fn endpoint_details(
        &self,
        endpoint_type: &'static str,
        endpoint_value: &str,
        additional_info: bool,
        devices: bool,
        score: bool
    ) -> Result<Value> {
        let q: Query = vec![
            (endpoint_type, endpoint_value.to_string()),
            ("additionalinfo", additional_info.to_string()),
            ("devices", devices.to_string()),
            ("score", score.to_string())
        ];
        self.api.get_json("/endpointdetails", &q).await
    }

    pub async fn device_info(&self, q: &Query) -> Result<Value> {
        self.api.get_json("/deviceinfo", q).await
    }

    pub async fn device_search(&self, q: &Query) -> Result<Value> {
        self.api.get_json("/devicesearch", q).await
    }

    pub async fn entity_details(&self, q: &Query) -> Result<Value> {
        self.api.get_json("/details", q).await
    }
}

/// Breach scores run from 0 to 1; they are bucketed into the vendor severity
/// words the poller understands.
pub fn score_to_severity(score: f64) -> &'static str {
    if score < 0.3 {
        "low"
    } else if score < 0.6 {
        "medium"
    } else if score < 0.8 {
        "high"
    } else {
        "critical"
    }
}

pub fn model_name(breach: &Map<String, Value>) -> Option<String> {
    breach
        .get("model")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn breach_to_event(record: Map<String, Value>) -> Result<RawEvent> {
    let pbid = record
        .get("pbid")
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow!("model breach has no pbid"))?;
    let time = record
        .get("time")
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("model breach {} has no time", pbid))?;
    let score = record
        .get("score")
        .and_then(Value::as_f64)
        .unwrap_or_default();
    let summary = model_name(&record).unwrap_or_else(|| format!("Darktrace Model Breach {}", pbid));
    Ok(
        RawEvent::from_record(
            pbid.to_string(),
            time.to_string(),
            score_to_severity(score).to_string(),
            summary,
            DETAIL_FIELD,
            record
        )
    )
}

/// Model breaches as a polling source. The endpoint has no page size or sort
/// parameter, so both are applied here.
pub struct DarktraceBreaches {
    client: Client,
    min_score: f64,
}

impl DarktraceBreaches {
    pub fn new(client: Client, min_score: f64) -> Self {
        DarktraceBreaches { client, min_score }
    }
}

#[async_trait]
impl EventSource for DarktraceBreaches {
    async fn search(
        &self,
        min_time: DateTime<Utc>,
        page_size: usize,
        _verbose: bool
    ) -> Result<Vec<RawEvent>> {
        let resp = self.client.search_breaches(self.min_score, min_time.timestamp_millis()).await?;
        let Value::Array(items) = resp else {
            return Err(anyhow!("unexpected model breach response, expected a list"));
        };
        let parser = VendorTimestampParser;
        let mut events = vec![];
        for item in items {
            let Value::Object(record) = item else {
                return Err(anyhow!("model breach is not a json object"));
            };
            let score = record.get("score").and_then(Value::as_f64).unwrap_or_default();
            let e = breach_to_event(record)?;
            let t = parser.parse(&e.occurred_at)?;
            if t >= min_time && score >= self.min_score {
                events.push((t, e));
            }
        }
        events.sort_by_key(|(t, _)| *t);
        events.truncate(page_size);
        debug!(count = events.len(), "darktrace model breaches fetched");
        Ok(
            events
                .into_iter()
                .map(|(_, e)| e)
                .collect()
        )
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use chrono::TimeZone;
    use mockito::Matcher;
    use serde_json::json;

    use super::*;

    pub fn conn(url: String) -> ConnectionConfig {
        ConnectionConfig {
            base_url: url,
            api_key: "dtkey".into(),
            insecure: true,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_score_to_severity() {
        assert_eq!(score_to_severity(0.0), "low");
        assert_eq!(score_to_severity(0.45), "medium");
        assert_eq!(score_to_severity(0.674), "high");
        assert_eq!(score_to_severity(0.8), "critical");
        assert_eq!(score_to_severity(1.0), "critical");
    }

    #[test]
    fn test_breach_to_event() {
        let record =
            json!({
            "pbid": 95,
            "time": 1598932817000i64,
            "score": 0.9,
            "model": {"name": "Device::Suspicious Domain"},
            "triggeredComponents": [{"cid": 1}]
        });
        let e = breach_to_event(record.as_object().cloned().unwrap()).unwrap();
        assert_eq!(e.id, "95");
        assert_eq!(e.occurred_at, "1598932817000");
        assert_eq!(e.severity, "critical");
        assert_eq!(e.summary, "Device::Suspicious Domain");
        assert_eq!(e.detail, Some(json!([{"cid": 1}])));

        let bare = json!({"pbid": 7, "time": 1});
        let e = breach_to_event(bare.as_object().cloned().unwrap()).unwrap();
        assert_eq!(e.summary, "Darktrace Model Breach 7");
        assert!(breach_to_event(json!({"time": 1}).as_object().cloned().unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_event_source() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/modelbreaches")
            .match_header("dtapi-token", "dtkey")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("minscore".into(), "0".into()),
                Matcher::UrlEncoded("starttime".into(), "1598932817000".into())
            ]))
            .with_status(200)
            .with_body(
                r#"[
                    {"pbid": 3, "time": 1598932819000, "score": 0.1, "model": {"name": "c"}},
                    {"pbid": 1, "time": 1598932817000, "score": 0.5, "model": {"name": "a"}},
                    {"pbid": 0, "time": 1598932816000, "score": 0.5, "model": {"name": "old"}},
                    {"pbid": 2, "time": 1598932818000, "score": 0.9, "model": {"name": "b"}}
                ]"#
            )
            .create_async().await;
        let source = DarktraceBreaches::new(Client::new(&conn(server.url())).unwrap(), 0.0);
        let min = Utc.timestamp_millis_opt(1598932817000).unwrap();
        let events = source.search(min, 2, false).await.unwrap();
        let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_event_source_exact_min_score() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/modelbreaches")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("minscore".into(), "0.55".into()),
                Matcher::UrlEncoded("starttime".into(), "1598932817000".into())
            ]))
            .with_status(200)
            .with_body(
                r#"[
                    {"pbid": 1, "time": 1598932817000, "score": 0.5},
                    {"pbid": 2, "time": 1598932818000, "score": 0.55},
                    {"pbid": 3, "time": 1598932819000, "score": 0.58}
                ]"#
            )
            .create_async().await;
        let source = DarktraceBreaches::new(Client::new(&conn(server.url())).unwrap(), 0.55);
        let min = Utc.timestamp_millis_opt(1598932817000).unwrap();
        let events = source.search(min, 10, false).await.unwrap();
        let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3"]);
    }

    #[tokio::test]
    async fn test_event_source_bad_payload() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/modelbreaches")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"error": "nope"}"#)
            .create_async().await;
        let source = DarktraceBreaches::new(Client::new(&conn(server.url())).unwrap(), 0.0);
        assert!(source.search(Utc::now(), 10, false).await.is_err());
    }
}
