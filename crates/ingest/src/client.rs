//! Paginated registry client.
//!
//! [`RegistrySource`] is the seam stages and reconciliation fetch through;
//! [`HttpRegistry`] is the production implementation. Every request carries
//! a timeout and is retried with bounded exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use regsync_core::config::RegistryConfig;
use regsync_core::PipelineError;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::backoff::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    Calls,
    Awards,
}

impl Dataset {
    pub fn path(&self) -> &'static str {
        match self {
            Dataset::Calls => "calls",
            Dataset::Awards => "awards",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageQuery {
    pub dataset: Dataset,
    pub page: u32,
    pub page_size: u32,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub subtype: Option<String>,
}

impl PageQuery {
    pub fn at_page(&self, page: u32) -> Self {
        Self { page, ..self.clone() }
    }

    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("page", self.page.to_string()),
            ("pageSize", self.page_size.to_string()),
            ("dateFrom", self.date_from.to_string()),
            ("dateTo", self.date_to.to_string()),
        ];
        if let Some(subtype) = &self.subtype {
            params.push(("subtype", subtype.clone()));
        }
        params
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    #[serde(default)]
    pub content: Vec<serde_json::Value>,
    #[serde(default)]
    pub total_elements: u64,
}

#[async_trait]
pub trait RegistrySource: Send + Sync {
    async fn search(&self, query: &PageQuery) -> Result<Page, PipelineError>;

    async fn fetch_detail(&self, dataset: Dataset, id: &str) -> Result<serde_json::Value, PipelineError>;
}

/// Pages through a listing until the accumulated count reaches the reported
/// total. Pages after the first are fetched with at most `concurrency` in flight.
pub async fn fetch_listing(
    source: &dyn RegistrySource,
    query: &PageQuery,
    concurrency: usize,
) -> Result<Vec<serde_json::Value>, PipelineError> {
    let first = source.search(&query.at_page(0)).await?;
    let total = first.total_elements;
    let mut items = first.content;
    if items.is_empty() || items.len() as u64 >= total {
        return Ok(items);
    }

    let page_size = u64::from(query.page_size.max(1));
    let pages = total.div_ceil(page_size) as u32;
    let mut fetched: Vec<(u32, Page)> = stream::iter(1..pages)
        .map(|page| async move { source.search(&query.at_page(page)).await.map(|p| (page, p)) })
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<_, _>>()?;
    fetched.sort_by_key(|(page, _)| *page);
    for (_, page) in fetched {
        items.extend(page.content);
    }

    // The listing can grow while we page through it.
    let mut next = pages;
    while (items.len() as u64) < total {
        let page = source.search(&query.at_page(next)).await?;
        if page.content.is_empty() {
            warn!(
                dataset = query.dataset.path(),
                expected = total,
                received = items.len(),
                "listing ended short of reported total"
            );
            break;
        }
        items.extend(page.content);
        next += 1;
    }

    debug!(dataset = query.dataset.path(), total, received = items.len(), "listing fetched");
    Ok(items)
}

/// HTTP implementation against `{base_url}/{dataset}/search` and
/// `{base_url}/{dataset}/{id}`.
pub struct HttpRegistry {
    client: reqwest::Client,
    config: RegistryConfig,
}

impl HttpRegistry {
    pub fn new(config: RegistryConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::fatal(format!("failed to build http client: {e}")))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&'static str, String)],
    ) -> Result<T, PipelineError> {
        let mut backoff = Backoff::new(self.config.backoff_ms, self.config.max_backoff_ms);
        let mut last_error = String::new();

        for attempt in 0..=self.config.max_retries {
            match self.client.get(url).query(params).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<T>()
                        .await
                        .map_err(|e| PipelineError::validation(url, format!("invalid response body: {e}")));
                }
                Ok(resp) if is_retryable(resp.status()) => {
                    last_error = format!("HTTP {}", resp.status());
                }
                Ok(resp) => {
                    return Err(PipelineError::validation(url, format!("HTTP {}", resp.status())));
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            if attempt < self.config.max_retries {
                let delay = backoff.next_delay();
                warn!(
                    url,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "registry request failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(PipelineError::TransientNetwork(format!(
            "{url}: {last_error} after {} attempts",
            self.config.max_retries + 1
        )))
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT
}

#[async_trait]
impl RegistrySource for HttpRegistry {
    async fn search(&self, query: &PageQuery) -> Result<Page, PipelineError> {
        let url = self.url(&format!("{}/search", query.dataset.path()));
        self.get_json(&url, &query.params()).await
    }

    async fn fetch_detail(&self, dataset: Dataset, id: &str) -> Result<serde_json::Value, PipelineError> {
        let url = self.url(&format!("{}/{}", dataset.path(), id));
        self.get_json(&url, &[]).await
    }
}
