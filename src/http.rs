use std::time::Duration;

use anyhow::{ anyhow, Context, Result };
use reqwest::{ header::{ HeaderMap, HeaderName, HeaderValue, ACCEPT }, multipart::Form, RequestBuilder };
use serde_json::Value;
use tracing::{ debug, trace };

use crate::{ config::ConnectionConfig, utils };

// cap on how much of an error body ends up in the error message
const ERR_BODY_MAX: usize = 512;

pub type Query = Vec<(&'static str, String)>;

/// Thin JSON client bound to one vendor base URL and a fixed set of headers.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
}

impl ApiClient {
    pub fn new(conn: &ConnectionConfig, auth_header: &'static str) -> Result<Self> {
        if conn.base_url.trim().is_empty() {
            return Err(anyhow!("base url cannot be empty"));
        }
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static(auth_header),
            HeaderValue::from_str(&conn.api_key).context("api key is not a valid header value")?
        );
        let client = reqwest::Client
            ::builder()
            .timeout(conn.timeout)
            .danger_accept_invalid_certs(conn.insecure)
            .build()
            .context("cannot build http client")?;
        Ok(ApiClient {
            client,
            base_url: conn.base_url.trim_end_matches('/').to_string(),
            headers,
        })
    }

    pub fn url(&self, suffix: &str) -> String {
        utils::join_url(&self.base_url, suffix)
    }

    pub async fn get_json(&self, suffix: &str, query: &Query) -> Result<Value> {
        let req = self.client.get(self.url(suffix)).headers(self.headers.clone()).query(query);
        self.send("GET", suffix, req).await
    }

    pub async fn post_json(&self, suffix: &str, query: &Query) -> Result<Value> {
        let req = self.client.post(self.url(suffix)).headers(self.headers.clone()).query(query);
        self.send("POST", suffix, req).await
    }

    pub async fn post_multipart(&self, suffix: &str, form: Form, timeout: Duration) -> Result<Value> {
        let req = self.client
            .post(self.url(suffix))
            .headers(self.headers.clone())
            .multipart(form)
            .timeout(timeout);
        self.send("POST", suffix, req).await
    }

    async fn send(&self, method: &str, suffix: &str, req: RequestBuilder) -> Result<Value> {
        debug!("{} {}", method, suffix);
        let resp = req.send().await.context(format!("{} {} failed", method, suffix))?;
        let status = resp.status();
        let text = resp
            .text().await
            .context(format!("cannot read response body of {} {}", method, suffix))?;
        if !status.is_success() {
            let excerpt: String = text.chars().take(ERR_BODY_MAX).collect();
            return Err(anyhow!("{} {} returned {}: {}", method, suffix, status, excerpt));
        }
        trace!(len = text.len(), "{} {} returned {}", method, suffix, status);
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json
            ::from_str(&text)
            .context(format!("cannot parse response of {} {} as json", method, suffix))
    }
}
