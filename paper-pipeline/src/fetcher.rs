use crate::config::CatalogConfig;
use crate::parser::ArxivParser;
use crate::types::{CatalogSource, Category, Item, PipelineError, Result};
use async_trait::async_trait;
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(3);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// arXiv Atom API client. One query per category, newest submissions first.
pub struct ArxivFetcher {
    client: Client,
    config: CatalogConfig,
    last_request: Mutex<Option<Instant>>,
}

impl ArxivFetcher {
    pub fn new(config: CatalogConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(REQUEST_TIMEOUT)
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .build()?;

        Ok(Self {
            client,
            config,
            last_request: Mutex::new(None),
        })
    }

    /// `<base_url>?search_query=cat:<c>&sortBy=submittedDate&sortOrder=descending&max_results=<n>`
    pub fn query_url(&self, category: Category) -> Result<Url> {
        let mut url = Url::parse(&self.config.base_url)?;
        url.query_pairs_mut()
            .append_pair("search_query", &format!("cat:{}", category.as_str()))
            .append_pair("start", "0")
            .append_pair("max_results", &self.config.max_results_per_category.to_string())
            .append_pair("sortBy", "submittedDate")
            .append_pair("sortOrder", "descending");
        Ok(url)
    }

    pub async fn fetch_category(&self, category: Category) -> Result<Vec<Item>> {
        let url = self.query_url(category)?;
        let body = self.get_with_retry(&url).await?;
        let items = ArxivParser::parse_feed(&body)?;
        info!(category = %category, entries = items.len(), "Fetched catalog page");
        Ok(items)
    }

    async fn get_with_retry(&self, url: &Url) -> Result<String> {
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: RETRY_DELAY,
            initial_interval: RETRY_DELAY,
            max_interval: RETRY_DELAY * 32,
            multiplier: 2.0,
            max_elapsed_time: Some(RETRY_DELAY * 60),
            ..Default::default()
        };

        let mut last_error = None;
        for attempt in 0..=MAX_RETRIES {
            self.wait_for_interval().await;
            match self.get_once(url).await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < MAX_RETRIES {
                        if let Some(delay) = backoff.next_backoff() {
                            warn!("Attempt {} failed for {}, retrying in {:?}", attempt + 1, url, delay);
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }
                    break;
                }
            }
        }

        error!("Failed to fetch {} after {} attempts", url, MAX_RETRIES + 1);
        Err(last_error.unwrap_or_else(|| PipelineError::Catalog(format!("no response from {}", url))))
    }

    async fn get_once(&self, url: &Url) -> Result<String> {
        debug!("GET {}", url);
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Catalog(format!(
                "HTTP {}: {}",
                status,
                status.canonical_reason().unwrap_or("Unknown")
            )));
        }
        Ok(response.text().await?)
    }

    /// arXiv asks clients to leave a gap between consecutive requests.
    async fn wait_for_interval(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.config.request_interval {
                let wait = self.config.request_interval - elapsed;
                debug!("Rate limiting: waiting {:?}", wait);
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Drop ids already seen in this fetch and entries published before `since`.
pub fn filter_fetched(items: Vec<Item>, since: DateTime<Utc>, seen: &mut HashSet<String>) -> Vec<Item> {
    items
        .into_iter()
        .filter(|item| item.published_at >= since)
        .filter(|item| seen.insert(item.id.clone()))
        .collect()
}

#[async_trait]
impl CatalogSource for ArxivFetcher {
    fn source_name(&self) -> String {
        "arxiv".to_string()
    }

    async fn fetch(&self, categories: &BTreeSet<Category>, since: DateTime<Utc>) -> anyhow::Result<Vec<Item>> {
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        let mut failed = Vec::new();
        for category in categories {
            let page = match self.fetch_category(*category).await {
                Ok(page) => page,
                Err(e) => {
                    error!(category = %category, "Skipping category: {}", e);
                    failed.push(category.as_str());
                    continue;
                }
            };
            let fetched = page.len();
            let kept = filter_fetched(page, since, &mut seen);
            debug!(category = %category, fetched, kept = kept.len(), "Filtered catalog page");
            items.extend(kept);
        }
        // Fail only when every category query failed.
        if !categories.is_empty() && failed.len() == categories.len() {
            anyhow::bail!("all category queries failed: {}", failed.join(", "));
        }
        info!(categories = categories.len(), items = items.len(), since = %since, "Catalog fetch complete");
        Ok(items)
    }
}
