use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::FetchError;
use crate::extract::TextExtractor;
use crate::scanner::CandidateLink;

pub const DEFAULT_PACING: Duration = Duration::from_millis(1500);

const USER_AGENT: &str = concat!("terms_scanner/", env!("CARGO_PKG_VERSION"));

/// Network seam: GET a document, POST a JSON body. Both return the body as
/// text and fail on non-2xx.
pub trait Transport: Send + Sync + 'static {
    fn get_text(&self, url: &str) -> impl Future<Output = Result<String, FetchError>> + Send;

    fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> impl Future<Output = Result<String, FetchError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| FetchError::network("client", e))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::network(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response.text().await.map_err(|e| FetchError::network(url, e))
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<String, FetchError> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| FetchError::network(url, e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| FetchError::network(url, e))?;
        if !status.is_success() {
            warn!(url, status = status.as_u16(), body = %text, "webhook rejected request");
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(text)
    }
}

/// Extracted text of one fetched document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeResult {
    pub url: String,
    pub extracted_text: String,
    pub fetched_at: DateTime<Utc>,
}

/// Counts returned after a batch completes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub total: usize,
    pub ok: usize,
    pub errors: usize,
    pub skipped: usize,
}

/// Spaces out the start of consecutive requests.
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    last_start: Option<Instant>,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_start: None,
        }
    }

    /// Wait until at least `interval` has passed since the previous turn.
    pub async fn wait_turn(&mut self) {
        if let Some(last) = self.last_start {
            tokio::time::sleep_until(last + self.interval).await;
        }
        self.last_start = Some(Instant::now());
    }
}

/// Strip the fragment from `url`; unparsable input is an error.
pub fn strip_fragment(url: &str) -> Result<String, FetchError> {
    let mut parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
    parsed.set_fragment(None);
    Ok(parsed.to_string())
}

/// Fetches candidate documents and reduces them to text.
///
/// Holds the session's scrape results: a URL that already has one is not
/// fetched again, and a URL already in flight is rejected.
pub struct FetchWorker<T> {
    transport: Arc<T>,
    extractor: TextExtractor,
    pacing: Duration,
    scraped: Mutex<HashMap<String, ScrapeResult>>,
    in_flight: Mutex<HashSet<String>>,
}

impl<T: Transport> FetchWorker<T> {
    pub fn new(transport: Arc<T>, extractor: TextExtractor, pacing: Duration) -> Self {
        Self {
            transport,
            extractor,
            pacing,
            scraped: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn scraped(&self, url: &str) -> Option<ScrapeResult> {
        let url = strip_fragment(url).ok()?;
        self.scraped
            .lock()
            .ok()
            .and_then(|map| map.get(&url).cloned())
    }

    pub fn scraped_count(&self) -> usize {
        self.scraped.lock().map(|map| map.len()).unwrap_or(0)
    }

    /// GET `url` (fragment removed) and extract its text. No retries.
    pub async fn fetch_and_extract(&self, url: &str) -> Result<ScrapeResult, FetchError> {
        let url = strip_fragment(url)?;
        if let Some(existing) = self.scraped(&url) {
            debug!(url = %url, "already scraped this session");
            return Ok(existing);
        }
        if !self.begin(&url) {
            return Err(FetchError::InFlight(url));
        }

        let started = Instant::now();
        let body = self.transport.get_text(&url).await;
        self.finish(&url);
        let body = body?;

        let extracted_text = self.extractor.extract(&body);
        info!(
            url = %url,
            chars = extracted_text.len(),
            ms = started.elapsed().as_millis() as u64,
            "fetched"
        );
        let result = ScrapeResult {
            url: url.clone(),
            extracted_text,
            fetched_at: Utc::now(),
        };
        if let Ok(mut map) = self.scraped.lock() {
            map.insert(url, result.clone());
        }
        Ok(result)
    }

    fn begin(&self, url: &str) -> bool {
        self.in_flight
            .lock()
            .map(|mut set| set.insert(url.to_string()))
            .unwrap_or(false)
    }

    fn finish(&self, url: &str) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(url);
        }
    }

    /// Fetch every link, starting requests one at a time at least the pacing
    /// interval apart. `on_done` runs as each fetch completes, in completion
    /// order, with the 1-based position of the link in the batch. Links
    /// already scraped this session are handed their stored result without
    /// a request and count as skipped.
    pub async fn fetch_batch<F, Fut>(
        self: &Arc<Self>,
        links: Vec<CandidateLink>,
        on_done: F,
    ) -> BatchStats
    where
        F: Fn(usize, CandidateLink, Result<ScrapeResult, FetchError>) -> Fut
            + Clone
            + Send
            + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut stats = BatchStats {
            total: links.len(),
            ..BatchStats::default()
        };
        let mut pacer = Pacer::new(self.pacing);
        let mut tasks = JoinSet::new();

        for (i, link) in links.into_iter().enumerate() {
            if let Some(existing) = self.scraped(&link.url) {
                debug!(url = %link.url, "already scraped, reusing result");
                let on_done = on_done.clone();
                tasks.spawn(async move {
                    on_done(i + 1, link, Ok(existing)).await;
                    None
                });
                continue;
            }
            pacer.wait_turn().await;
            debug!(index = i + 1, url = %link.url, "starting fetch");

            let worker = Arc::clone(self);
            let on_done = on_done.clone();
            tasks.spawn(async move {
                let result = worker.fetch_and_extract(&link.url).await;
                let ok = result.is_ok();
                on_done(i + 1, link, result).await;
                Some(ok)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(true)) => stats.ok += 1,
                Ok(Some(false)) => stats.errors += 1,
                Ok(None) => stats.skipped += 1,
                Err(e) => {
                    warn!("fetch task failed: {}", e);
                    stats.errors += 1;
                }
            }
        }
        info!(
            total = stats.total,
            ok = stats.ok,
            errors = stats.errors,
            skipped = stats.skipped,
            "batch complete"
        );
        stats
    }
}
