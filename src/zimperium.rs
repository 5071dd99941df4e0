use std::{ path::Path, time::Duration };

use anyhow::{ anyhow, Context, Result };
use async_trait::async_trait;
use chrono::{ DateTime, Utc };
use reqwest::multipart::{ Form, Part };
use serde_json::Value;
use tracing::debug;

use crate::{
    config::ConnectionConfig,
    event::RawEvent,
    http::{ ApiClient, Query },
    poller::EventSource,
    utils,
};

pub mod commands;

const API_PREFIX: &str = "/api/v1/";
const AUTH_HEADER: &str = "api_key";
const UPLOAD_TIMEOUT_SECS: u64 = 240;
pub const EVENT_DETAIL_FIELD: &str = "eventDetail";

pub enum DeviceLookup {
    Zdid(String),
    DeviceId(String),
}

impl DeviceLookup {
    pub fn from_args(zdid: Option<String>, device_id: Option<String>) -> Result<Self> {
        match (non_empty(zdid), non_empty(device_id)) {
            (Some(z), None) => Ok(DeviceLookup::Zdid(z)),
            (None, Some(d)) => Ok(DeviceLookup::DeviceId(d)),
            _ => Err(anyhow!("To get device by ID, use the zdid or the device_id argument.")),
        }
    }
}

pub enum AppLookup {
    Hash(String),
    Name(String),
}

impl AppLookup {
    pub fn from_args(app_hash: Option<String>, app_name: Option<String>) -> Result<Self> {
        match (non_empty(app_hash), non_empty(app_name)) {
            (Some(h), None) => Ok(AppLookup::Hash(h)),
            (None, Some(n)) => Ok(AppLookup::Name(n)),
            _ =>
                Err(
                    anyhow!(
                        "To get application classification, use the app_hash or the app_name argument."
                    )
                ),
        }
    }
}

pub enum ReportLookup {
    Bundle(String),
    Itunes(String),
    Hash(String),
}

impl ReportLookup {
    pub fn from_args(
        bundle_id: Option<String>,
        itunes_id: Option<String>,
        app_hash: Option<String>
    ) -> Result<Self> {
        match (non_empty(bundle_id), non_empty(itunes_id), non_empty(app_hash)) {
            (None, None, None) =>
                Err(
                    anyhow!(
                        "To get a report, use the bundle_id or the itunes_id or the app_hash argument."
                    )
                ),
            (Some(b), None, None) => Ok(ReportLookup::Bundle(b)),
            (None, Some(i), None) => Ok(ReportLookup::Itunes(i)),
            (None, None, Some(h)) => Ok(ReportLookup::Hash(h)),
            _ =>
                Err(
                    anyhow!(
                        "To get a report, use exactly one of the arguments: bundle_id, itunes_id, app_hash."
                    )
                ),
        }
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[derive(Clone)]
pub struct Client {
    api: ApiClient,
}

impl Client {
    pub fn new(conn: &ConnectionConfig) -> Result<Self> {
        let mut conn = conn.clone();
        conn.base_url = utils::join_url(&conn.base_url, API_PREFIX);
        Ok(Client { api: ApiClient::new(&conn, AUTH_HEADER)? })
    }

    fn paged(query: &str, size: u32, page: u32) -> Query {
        vec![("rsql", query.to_string()), ("size", size.to_string()), ("page", page.to_string())]
    }

    pub async fn users_search(&self, query: &str, size: u32, page: u32) -> Result<Value> {
        self.api.get_json("/users/public/search", &Self::paged(query, size, page)).await
    }

    pub async fn user_get_by_id(&self, object_id: &str) -> Result<Value> {
        self.api.get_json(&format!("/users/public/{}", object_id), &vec![]).await
    }

    pub async fn devices_search(&self, query: &str, size: u32, page: u32) -> Result<Value> {
        self.api.get_json("/devices/public/search", &Self::paged(query, size, page)).await
    }

    pub async fn device_get_by_id(&self, lookup: &DeviceLookup) -> Result<Value> {
        let suffix = match lookup {
            DeviceLookup::Zdid(z) => format!("/devices/public/{}", z),
            DeviceLookup::DeviceId(d) => format!("/devices/public/deviceId/{}", d),
        };
        self.api.get_json(&suffix, &vec![]).await
    }

    pub async fn devices_get_last_updated(
        &self,
        last_updated: &str,
        exclude_deleted: bool,
        size: u32,
        page: u32
    ) -> Result<Value> {
        let q: Query = vec![
            ("fromLastUpdate", last_updated.to_string()),
            ("excludeDeleted", exclude_deleted.to_string()),
            ("size", size.to_string()),
            ("page", page.to_string())
        ];
        self.api.get_json("/devices/public/device_updates", &q).await
    }

    pub async fn app_classification_get(&self, lookup: &AppLookup) -> Result<Value> {
        let suffix = match lookup {
            AppLookup::Hash(h) => format!("/malware/public/classify/hash/{}", h),
            AppLookup::Name(n) => format!("/malware/public/classify/name/{}", n),
        };
        self.api.get_json(&suffix, &vec![]).await
    }

    pub async fn report_get(&self, lookup: &ReportLookup, platform: &str) -> Result<Value> {
        let (suffix, q): (String, Query) = match lookup {
            ReportLookup::Bundle(b) =>
                (format!("/malware/public/reports/bundle/{}", b), vec![("platform", platform.into())]),
            ReportLookup::Itunes(i) => (format!("/malware/public/reports/itunes/{}", i), vec![]),
            ReportLookup::Hash(h) =>
                (format!("/malware/public/reports/hash/{}", h), vec![("platform", platform.into())]),
        };
        self.api.get_json(&suffix, &q).await
    }

    pub async fn app_upload_for_analysis(&self, file: &Path) -> Result<Value> {
        let bytes = std::fs
            ::read(file)
            .context(format!("Failed to prepare application {:?} for upload.", file))?;
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "app".to_string());
        let form = Form::new().part("file1", Part::bytes(bytes).file_name(name));
        self.api.post_multipart(
            "/malware/public/upload/app",
            form,
            Duration::from_secs(UPLOAD_TIMEOUT_SECS)
        ).await
    }

    pub async fn events_search(
        &self,
        query: &str,
        size: u32,
        page: u32,
        verbose: bool,
        sort: &str
    ) -> Result<Value> {
        let mut q = Self::paged(query, size, page);
        q.push(("sort", sort.to_string()));
        q.push(("includeFullEventDetail", verbose.to_string()));
        self.api.get_json("/events/public/search", &q).await
    }
}

/// Maps a Zimperium event record onto the fields the poller needs.
fn event_from_record(v: Value) -> Result<RawEvent> {
    let Value::Object(record) = v else {
        return Err(anyhow!("event is not a json object"));
    };
    let text = |k: &str| -> Option<String> {
        match record.get(k) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    };
    let id = text("eventId").ok_or_else(|| anyhow!("event has no eventId"))?;
    let occurred_at = text("persistedTime").ok_or_else(||
        anyhow!("event {} has no persistedTime", id)
    )?;
    let severity = text("severity").unwrap_or_default();
    let summary = text("incidentSummary").unwrap_or_default();
    Ok(RawEvent::from_record(id, occurred_at, severity, summary, EVENT_DETAIL_FIELD, record))
}

/// Zimperium events as a polling source, filtered and sorted on `persistedTime`.
pub struct ZimperiumEvents {
    client: Client,
}

impl ZimperiumEvents {
    pub fn new(client: Client) -> Self {
        ZimperiumEvents { client }
    }
}

#[async_trait]
impl EventSource for ZimperiumEvents {
    async fn search(
        &self,
        min_time: DateTime<Utc>,
        page_size: usize,
        verbose: bool
    ) -> Result<Vec<RawEvent>> {
        let query = format!("persistedTime=ge={}", utils::format_timestamp(&min_time));
        let size = u32::try_from(page_size)?;
        let resp = self.client.events_search(&query, size, 0, verbose, "persistedTime,asc").await?;
        let content = match resp.get("content") {
            Some(Value::Array(a)) => a.clone(),
            None | Some(Value::Null) => vec![],
            Some(_) => {
                return Err(anyhow!("unexpected events search response, content is not a list"));
            }
        };
        debug!(query = %query, count = content.len(), "zimperium events fetched");
        content.into_iter().map(event_from_record).collect()
    }
}
