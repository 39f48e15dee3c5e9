pub mod scroll;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::SearchConfig;

/// One page (or aggregation result) from the search backend.
#[derive(Debug, Default, Deserialize)]
pub struct SearchResponse {
    #[serde(rename = "_scroll_id")]
    pub scroll_id: Option<String>,
    #[serde(default)]
    pub hits: Hits,
    pub aggregations: Option<Aggregations>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Hits {
    pub total: Option<TotalHits>,
    #[serde(default)]
    pub hits: Vec<Hit>,
}

/// Total hit count; newer backends report `{value, relation}`, older ones a
/// bare number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TotalHits {
    Legacy(u64),
    Tracked { value: u64 },
}

impl TotalHits {
    pub fn value(&self) -> u64 {
        match self {
            TotalHits::Legacy(v) => *v,
            TotalHits::Tracked { value } => *value,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Hit {
    #[serde(rename = "_source", default)]
    pub source: Value,
}

/// Two-level terms aggregation response: tenant buckets, each holding
/// source-ip buckets with document counts.
#[derive(Debug, Deserialize)]
pub struct Aggregations {
    pub group_by_tenant: TenantBuckets,
}

#[derive(Debug, Deserialize)]
pub struct TenantBuckets {
    #[serde(default)]
    pub buckets: Vec<TenantBucket>,
}

#[derive(Debug, Deserialize)]
pub struct TenantBucket {
    pub key: String,
    pub group_by_ip: IpBuckets,
}

#[derive(Debug, Deserialize)]
pub struct IpBuckets {
    #[serde(default)]
    pub buckets: Vec<IpBucket>,
}

#[derive(Debug, Deserialize)]
pub struct IpBucket {
    pub key: String,
    pub doc_count: u64,
}

/// Search backend API, behind a trait so the run driver can be exercised
/// against a fake.
pub trait SearchBackend: Send + Sync {
    /// Executes an initial search request.
    fn search(
        &self,
        uri: &str,
        body: &Value,
    ) -> impl std::future::Future<Output = Result<SearchResponse>> + Send;

    /// Advances a scroll cursor by one page.
    fn scroll_continue(
        &self,
        scroll_id: &str,
    ) -> impl std::future::Future<Output = Result<SearchResponse>> + Send;

    /// Releases a server-side scroll cursor.
    fn scroll_close(
        &self,
        scroll_id: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Lists all index alias names.
    fn list_aliases(&self) -> impl std::future::Future<Output = Result<Vec<String>>> + Send;
}

/// HTTP client for a replicated search cluster.
///
/// Endpoints are tried in order; the first one that yields an HTTP response
/// wins, since any node answers identically. TLS certificate validation is
/// disabled by deployment policy.
pub struct Client {
    http: reqwest::Client,
    endpoints: Vec<String>,
}

impl Client {
    pub fn new(cfg: &SearchConfig) -> Result<Self> {
        let timeout = if cfg.connect_timeout.is_zero() {
            Duration::from_secs(60)
        } else {
            cfg.connect_timeout
        };

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Client {
            http,
            endpoints: cfg.endpoints.clone(),
        })
    }

    /// Sends the request to the first reachable endpoint and deserializes
    /// the JSON response.
    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        uri: &str,
        body: Option<&Value>,
    ) -> Result<T> {
        let mut last_err = None;

        for endpoint in &self.endpoints {
            let url = format!("{endpoint}{uri}");
            debug!(%url, "search backend request");

            let mut req = self.http.request(method.clone(), &url);
            if let Some(body) = body {
                req = req.json(body);
            }

            let response = match req.send().await {
                Ok(response) => response,
                Err(err) => {
                    warn!(%endpoint, error = %err, "search endpoint unreachable");
                    last_err = Some(err);
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                bail!("unexpected status {status} from {uri}: {text}");
            }

            return response
                .json::<T>()
                .await
                .with_context(|| format!("decoding response from {uri}"));
        }

        match last_err {
            Some(err) => Err(err).context("no reachable search endpoint"),
            None => bail!("no search endpoints configured"),
        }
    }
}

impl SearchBackend for Client {
    async fn search(&self, uri: &str, body: &Value) -> Result<SearchResponse> {
        self.request(reqwest::Method::POST, uri, Some(body)).await
    }

    async fn scroll_continue(&self, scroll_id: &str) -> Result<SearchResponse> {
        let body = serde_json::json!({
            "scroll": crate::catalog::SCROLL_KEEPALIVE,
            "scroll_id": scroll_id,
        });
        self.request(reqwest::Method::POST, "/_search/scroll", Some(&body))
            .await
    }

    async fn scroll_close(&self, scroll_id: &str) -> Result<()> {
        let body = serde_json::json!({ "scroll_id": scroll_id });
        let _: Value = self
            .request(reqwest::Method::DELETE, "/_search/scroll", Some(&body))
            .await?;
        Ok(())
    }

    async fn list_aliases(&self) -> Result<Vec<String>> {
        let aliases: serde_json::Map<String, Value> = self
            .request(reqwest::Method::GET, "/_aliases", None)
            .await?;
        Ok(aliases.keys().cloned().collect())
    }
}
