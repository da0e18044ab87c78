use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::AnalysisRecord;
use crate::config::{PipelineConfig, SettingKey, Settings};
use crate::db;
use crate::error::ConfigurationError;
use crate::extract::TextExtractor;
use crate::fetch::{FetchWorker, ScrapeResult, Transport};
use crate::relay::{ContextId, Envelope, Message, PendingRequests, Relay, RetrySchedule, TabId};
use crate::scanner::CandidateLink;
use crate::service::AnalysisClient;

/// An analysis that came back from the service, handed to the run loop so
/// the store is only written from one place.
#[derive(Debug)]
struct Completed {
    url: String,
    text: String,
    payload: Value,
}

/// Everything a spawned pipeline task needs.
struct Pipeline<T> {
    relay: Relay,
    client: AnalysisClient<T>,
    pending: Arc<Mutex<PendingRequests>>,
    retry: RetrySchedule,
    endpoint: Option<String>,
    completed: mpsc::UnboundedSender<Completed>,
}

impl<T> Clone for Pipeline<T> {
    fn clone(&self) -> Self {
        Self {
            relay: self.relay.clone(),
            client: self.client.clone(),
            pending: Arc::clone(&self.pending),
            retry: self.retry,
            endpoint: self.endpoint.clone(),
            completed: self.completed.clone(),
        }
    }
}

impl<T: Transport> Pipeline<T> {
    /// Show the text in the originating tab, then analyze it and route the
    /// result back.
    async fn on_scraped(self, tab: TabId, index: usize, link_text: String, scrape: ScrapeResult) {
        let display = Message::DisplayContent {
            url: scrape.url.clone(),
            link_text,
            content: scrape.extracted_text.clone(),
            index,
        };
        if let Err(e) = self.relay.send(ContextId::Worker, ContextId::Agent(tab), display) {
            warn!(tab, url = %scrape.url, "content not displayed: {}", e);
        }
        self.analyze(tab, scrape).await;
    }

    async fn analyze(self, tab: TabId, scrape: ScrapeResult) {
        let Some(endpoint) = self.endpoint.as_deref() else {
            error!(url = %scrape.url, "{}", ConfigurationError::Missing(SettingKey::AnalysisWebhook.name()));
            return;
        };
        let url = scrape.url.clone();
        let fresh = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            pending.insert(&url, ContextId::Agent(tab))
        };
        if !fresh {
            info!(url = %url, "analysis already pending, not resending");
            return;
        }

        let payload = match self.client.analyze(endpoint, &scrape).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(url = %url, "analysis request failed: {}", e);
                self.pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&url);
                return;
            }
        };

        if self
            .completed
            .send(Completed {
                url: url.clone(),
                text: scrape.extracted_text,
                payload: payload.clone(),
            })
            .is_err()
        {
            warn!(url = %url, "worker stopped, analysis not recorded");
        }

        let message = Message::AnalysisComplete {
            url: url.clone(),
            payload,
        };
        match self
            .relay
            .deliver_pending(
                &self.pending,
                &url,
                Some(ContextId::Agent(tab)),
                ContextId::Worker,
                message,
                self.retry,
            )
            .await
        {
            Ok(target) => debug!(url = %url, to = %target, "analysis delivered"),
            Err(e) => warn!(url = %url, "analysis result lost: {}", e),
        }
    }
}

/// The background context: owns settings, the fetcher and the pending
/// request table. Runs until its relay registration is dropped and every
/// spawned batch has finished.
pub struct Worker<T> {
    relay: Relay,
    settings: Settings,
    fetcher: Arc<FetchWorker<T>>,
    client: AnalysisClient<T>,
    pending: Arc<Mutex<PendingRequests>>,
    config: PipelineConfig,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    completed_tx: mpsc::UnboundedSender<Completed>,
    completed_rx: mpsc::UnboundedReceiver<Completed>,
    tasks: JoinSet<()>,
}

impl<T: Transport> Worker<T> {
    pub fn new(
        relay: Relay,
        settings: Settings,
        transport: Arc<T>,
        config: PipelineConfig,
    ) -> Result<Self, ConfigurationError> {
        settings.ensure_defaults()?;
        match settings.require(SettingKey::AnalysisWebhook) {
            Ok(url) => info!(webhook = %url, "analysis webhook"),
            Err(e) => warn!("{}; analysis disabled", e),
        }

        let extractor = TextExtractor {
            min_main_chars: config.min_main_chars,
            ..TextExtractor::default()
        };
        let fetcher = Arc::new(FetchWorker::new(Arc::clone(&transport), extractor, config.pacing));
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        let inbox = relay.register(ContextId::Worker);

        Ok(Self {
            relay,
            settings,
            fetcher,
            client: AnalysisClient::new(transport),
            pending: Arc::new(Mutex::new(PendingRequests::new(config.pending_ttl))),
            config,
            inbox,
            completed_tx,
            completed_rx,
            tasks: JoinSet::new(),
        })
    }

    pub fn pending(&self) -> Arc<Mutex<PendingRequests>> {
        Arc::clone(&self.pending)
    }

    pub fn fetcher(&self) -> Arc<FetchWorker<T>> {
        Arc::clone(&self.fetcher)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Process messages until the inbox closes and outstanding work drains.
    /// Returns the settings so the caller can keep using the store.
    pub async fn run(mut self) -> Settings {
        let mut open = true;
        loop {
            tokio::select! {
                envelope = self.inbox.recv(), if open => match envelope {
                    Some(envelope) => self.handle(envelope),
                    None => {
                        debug!("worker inbox closed");
                        open = false;
                    }
                },
                Some(done) = self.completed_rx.recv() => self.record(done),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("worker task failed: {}", e);
                    }
                }
            }
            if !open && self.tasks.is_empty() {
                while let Ok(done) = self.completed_rx.try_recv() {
                    self.record(done);
                }
                break;
            }
        }
        info!("worker stopped");
        self.settings
    }

    fn pipeline(&self) -> Pipeline<T> {
        let endpoint = match self.settings.require(SettingKey::AnalysisWebhook) {
            Ok(url) => Some(url),
            Err(e) => {
                error!("{}; analysis disabled", e);
                None
            }
        };
        Pipeline {
            relay: self.relay.clone(),
            client: self.client.clone(),
            pending: Arc::clone(&self.pending),
            retry: self.config.retry,
            endpoint,
            completed: self.completed_tx.clone(),
        }
    }

    fn handle(&mut self, envelope: Envelope) {
        let from = envelope.from;
        match envelope.message {
            Message::TermsLinksFound {
                links,
                page_url,
                auto_fetch,
            } => {
                info!(page = %page_url, links = links.len(), auto_fetch, "terms links found");
                let Some(tab) = agent_tab(from) else {
                    warn!(from = %from, "links from a non-agent context ignored");
                    return;
                };
                if auto_fetch && !links.is_empty() {
                    self.spawn_batch(tab, links);
                }
            }
            Message::FetchTermsContent { url, text } => {
                let Some(tab) = agent_tab(from) else {
                    warn!(from = %from, "content from a non-agent context ignored");
                    return;
                };
                let scrape = ScrapeResult {
                    url,
                    extracted_text: text,
                    fetched_at: Utc::now(),
                };
                let pipeline = self.pipeline();
                self.tasks.spawn(pipeline.analyze(tab, scrape));
            }
            Message::SetWebhook { url } => {
                let reply = match self.settings.set(SettingKey::AnalysisWebhook, &url) {
                    Ok(saved) => Some(saved),
                    Err(e) => {
                        warn!("webhook not saved: {}", e);
                        self.settings.get(SettingKey::AnalysisWebhook).ok().flatten()
                    }
                };
                self.reply(from, Message::WebhookUrl { url: reply });
            }
            Message::GetWebhook => {
                let url = self.settings.get(SettingKey::AnalysisWebhook).unwrap_or_else(|e| {
                    warn!("reading webhook setting: {}", e);
                    None
                });
                self.reply(from, Message::WebhookUrl { url });
            }
            other => debug!(from = %from, kind = other.name(), "ignored by worker"),
        }
    }

    fn reply(&self, to: ContextId, message: Message) {
        if let Err(e) = self.relay.send(ContextId::Worker, to, message) {
            warn!("reply not delivered: {}", e);
        }
    }

    fn spawn_batch(&mut self, tab: TabId, links: Vec<CandidateLink>) {
        let purged = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .purge_expired();
        if purged > 0 {
            debug!(purged, "stale pending requests dropped");
        }

        let pipeline = self.pipeline();
        let fetcher = Arc::clone(&self.fetcher);
        self.tasks.spawn(async move {
            fetcher
                .fetch_batch(links, move |index, link, result| {
                    let pipeline = pipeline.clone();
                    async move {
                        match result {
                            Ok(scrape) => pipeline.on_scraped(tab, index, link.text, scrape).await,
                            Err(e) => warn!(url = %link.url, index, "fetch failed: {}", e),
                        }
                    }
                })
                .await;
        });
    }

    fn record(&self, done: Completed) {
        let record = match AnalysisRecord::from_response(&done.url, &done.payload) {
            Ok(record) => record,
            Err(e) => {
                debug!(url = %done.url, "not recording malformed analysis: {}", e);
                return;
            }
        };
        match db::record_analysis(self.settings.connection(), &done.url, &done.text, &record) {
            Ok(snapshot_id) => info!(url = %done.url, snapshot_id, score = record.score, "analysis recorded"),
            Err(e) => warn!(url = %done.url, "recording analysis: {:#}", e),
        }
    }
}

fn agent_tab(ctx: ContextId) -> Option<TabId> {
    match ctx {
        ContextId::Agent(tab) => Some(tab),
        _ => None,
    }
}
