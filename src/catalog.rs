//! Profiling catalog access over HTTP.
//!
//! [`ProfileCatalog`] is the seam the pipeline works against; [`ApiClient`]
//! implements it on top of the catalog's JSON search endpoint and the binary
//! download endpoint. Tests substitute an in-memory catalog.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::query::{ApiTime, SelectionQuery};

pub const ENV_SITE: &str = "PGOFETCH_SITE";
pub const ENV_API_KEY: &str = "PGOFETCH_API_KEY";
pub const ENV_APP_KEY: &str = "PGOFETCH_APP_KEY";

const HEADER_API_KEY: &str = "PF-API-KEY";
const HEADER_APP_KEY: &str = "PF-APPLICATION-KEY";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const AUTH_HINT: &str =
    "please check that PGOFETCH_SITE, PGOFETCH_API_KEY and PGOFETCH_APP_KEY are set correctly";

/// One profile returned by a catalog search, ranked by CPU usage.
#[derive(Debug, Clone)]
pub struct CandidateProfile {
    pub profile_id: String,
    pub event_id: String,
    pub service: String,
    pub cpu_cores: f64,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
}

/// Searchable source of CPU profiles.
#[async_trait]
pub trait ProfileCatalog: Send + Sync {
    /// Top profiles matching `query`, most CPU-hungry first.
    async fn search(&self, query: &SelectionQuery) -> Result<Vec<CandidateProfile>>;

    /// Raw profile bundle bytes for `candidate`.
    async fn download(&self, candidate: &CandidateProfile) -> Result<Vec<u8>>;
}

/// HTTP client for the profiling catalog API.
pub struct ApiClient {
    http: reqwest::Client,
    site: String,
    api_key: String,
    app_key: String,
}

impl ApiClient {
    /// Build a client from `PGOFETCH_SITE`, `PGOFETCH_API_KEY` and
    /// `PGOFETCH_APP_KEY`. All three must be set and non-empty.
    pub fn from_env(timeout: Duration) -> Result<Self> {
        let site = require_env(ENV_SITE)?;
        let api_key = require_env(ENV_API_KEY)?;
        let app_key = require_env(ENV_APP_KEY)?;
        Self::new(site, api_key, app_key, timeout)
    }

    /// `timeout` caps each request from connect to the last body byte.
    pub fn new(site: String, api_key: String, app_key: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("{}/{}", crate::NAME, crate::VERSION))
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("build http client: {e}")))?;
        Ok(Self {
            http,
            site,
            api_key,
            app_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("https://app.{}{}", self.site, path)
    }

    /// Attach the headers every catalog endpoint expects.
    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header(HEADER_API_KEY, &self.api_key)
            .header(HEADER_APP_KEY, &self.app_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
    }
}

#[async_trait]
impl ProfileCatalog for ApiClient {
    async fn search(&self, query: &SelectionQuery) -> Result<Vec<CandidateProfile>> {
        let path = "/api/v1/profiles/search";
        let response = self
            .request(self.http.post(self.url(path)))
            .json(query)
            .send()
            .await
            .map_err(|e| Error::Search(format!("POST {path}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Search(format!("POST {path}: {status}: {AUTH_HINT}")));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Search(format!("POST {path}: read body: {e}")))?;
        parse_search_response(&body)
    }

    async fn download(&self, candidate: &CandidateProfile) -> Result<Vec<u8>> {
        let path = format!(
            "/api/v1/profiles/{}/download?event_id={}",
            candidate.profile_id, candidate.event_id
        );
        let response = self
            .request(self.http.get(self.url(&path)))
            .send()
            .await
            .map_err(|e| Error::Download(format!("GET {path}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Download(format!(
                "GET {path}: {status}: {AUTH_HINT}"
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Download(format!("GET {path}: read body: {e}")))?;
        Ok(body.to_vec())
    }
}

fn require_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::Config(format!("{name} is not set"))),
    }
}

/// Decode a search response body into candidates, preserving server order.
fn parse_search_response(body: &[u8]) -> Result<Vec<CandidateProfile>> {
    let response: SearchResponse = serde_json::from_slice(body)
        .map_err(|e| Error::Search(format!("decode search response: {e}")))?;
    Ok(response
        .data
        .into_iter()
        .map(|row| CandidateProfile {
            profile_id: row.attributes.id,
            event_id: row.id,
            service: row.attributes.service,
            cpu_cores: row.attributes.custom.metrics.core_cpu_cores,
            timestamp: row.attributes.timestamp.0,
            duration: Duration::from_nanos(row.attributes.duration_nanos.max(0.0) as u64),
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<SearchRow>,
}

/// The outer row id addresses the search event, the nested id the profile.
/// Downloads need both.
#[derive(Debug, Deserialize)]
struct SearchRow {
    id: String,
    attributes: SearchAttributes,
}

#[derive(Debug, Deserialize)]
struct SearchAttributes {
    id: String,
    #[serde(default)]
    service: String,
    #[serde(default)]
    duration_nanos: f64,
    timestamp: ApiTime,
    #[serde(default)]
    custom: SearchCustom,
}

#[derive(Debug, Default, Deserialize)]
struct SearchCustom {
    #[serde(default)]
    metrics: SearchMetrics,
}

#[derive(Debug, Default, Deserialize)]
struct SearchMetrics {
    #[serde(default)]
    core_cpu_cores: f64,
}
