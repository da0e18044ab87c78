use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::RelayDeliveryError;
use crate::scanner::CandidateLink;

pub type TabId = u32;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_STEP: Duration = Duration::from_millis(500);
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(120);

/// One of the three cooperating contexts. Page and Agent are per tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextId {
    Page(TabId),
    Agent(TabId),
    Worker,
}

impl ContextId {
    pub fn tab(self) -> Option<TabId> {
        match self {
            Self::Page(tab) | Self::Agent(tab) => Some(tab),
            Self::Worker => None,
        }
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Page(tab) => write!(f, "page:{}", tab),
            Self::Agent(tab) => write!(f, "agent:{}", tab),
            Self::Worker => f.write_str("worker"),
        }
    }
}

/// Everything the contexts say to each other.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Message {
    // page -> agent
    FetchTermsRequest,
    DomInserted {
        html: String,
    },
    // agent -> page
    LinksFound {
        links: Vec<CandidateLink>,
    },
    #[serde(rename_all = "camelCase")]
    ContentReceived {
        url: String,
        link_text: String,
        content: String,
        index: usize,
    },
    // agent -> worker
    #[serde(rename_all = "camelCase")]
    TermsLinksFound {
        links: Vec<CandidateLink>,
        page_url: String,
        auto_fetch: bool,
    },
    FetchTermsContent {
        url: String,
        text: String,
    },
    SetWebhook {
        url: String,
    },
    GetWebhook,
    // worker -> agent
    #[serde(rename_all = "camelCase")]
    DisplayContent {
        url: String,
        link_text: String,
        content: String,
        index: usize,
    },
    AnalysisComplete {
        url: String,
        payload: serde_json::Value,
    },
    WebhookUrl {
        url: Option<String>,
    },
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FetchTermsRequest => "fetchTermsRequest",
            Self::DomInserted { .. } => "domInserted",
            Self::LinksFound { .. } => "linksFound",
            Self::ContentReceived { .. } => "contentReceived",
            Self::TermsLinksFound { .. } => "termsLinksFound",
            Self::FetchTermsContent { .. } => "fetchTermsContent",
            Self::SetWebhook { .. } => "setWebhook",
            Self::GetWebhook => "getWebhook",
            Self::DisplayContent { .. } => "displayContent",
            Self::AnalysisComplete { .. } => "analysisComplete",
            Self::WebhookUrl { .. } => "webhookUrl",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub from: ContextId,
    pub message: Message,
}

/// Delays between delivery attempts: retry `n` waits `n * step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    pub max_retries: u32,
    pub step: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            step: DEFAULT_RETRY_STEP,
        }
    }
}

impl RetrySchedule {
    pub fn delay(&self, retry: u32) -> Duration {
        self.step * retry
    }
}

#[derive(Default)]
struct Routes {
    inboxes: HashMap<ContextId, mpsc::UnboundedSender<Envelope>>,
    open_tabs: HashSet<TabId>,
}

/// Routes messages between registered contexts.
///
/// A tab can be open while its agent has not registered yet; sends to it
/// fail and are worth retrying. Sends to a closed tab are not.
#[derive(Clone, Default)]
pub struct Relay {
    routes: Arc<Mutex<Routes>>,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let routes = self.lock();
        f.debug_struct("Relay")
            .field("contexts", &routes.inboxes.len())
            .field("open_tabs", &routes.open_tabs.len())
            .finish()
    }
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Routes> {
        // Routes are only ever mutated by whole inserts and removes.
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn open_tab(&self, tab: TabId) {
        self.lock().open_tabs.insert(tab);
    }

    /// Close `tab` and drop both of its contexts.
    pub fn close_tab(&self, tab: TabId) {
        let mut routes = self.lock();
        routes.open_tabs.remove(&tab);
        routes.inboxes.remove(&ContextId::Page(tab));
        routes.inboxes.remove(&ContextId::Agent(tab));
        debug!(tab, "tab closed");
    }

    pub fn is_tab_open(&self, tab: TabId) -> bool {
        self.lock().open_tabs.contains(&tab)
    }

    /// Register `ctx` and return its inbox. Registering a tab context also
    /// opens the tab. A second registration replaces the first.
    pub fn register(&self, ctx: ContextId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.lock();
        if let Some(tab) = ctx.tab() {
            routes.open_tabs.insert(tab);
        }
        routes.inboxes.insert(ctx, tx);
        debug!(context = %ctx, "registered");
        rx
    }

    pub fn unregister(&self, ctx: ContextId) {
        self.lock().inboxes.remove(&ctx);
    }

    pub fn is_registered(&self, ctx: ContextId) -> bool {
        self.lock()
            .inboxes
            .get(&ctx)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Single delivery attempt.
    pub fn send(
        &self,
        from: ContextId,
        to: ContextId,
        message: Message,
    ) -> Result<(), RelayDeliveryError> {
        let mut routes = self.lock();
        let Some(tx) = routes.inboxes.get(&to) else {
            return Err(RelayDeliveryError::Unreachable(to.to_string()));
        };
        if tx.send(Envelope { from, message }).is_err() {
            routes.inboxes.remove(&to);
            return Err(RelayDeliveryError::Unreachable(to.to_string()));
        }
        Ok(())
    }

    /// Deliver with retries. Gives up immediately once the target tab is
    /// closed; otherwise retries on `schedule` and reports `Exhausted`.
    pub async fn deliver(
        &self,
        from: ContextId,
        to: ContextId,
        message: Message,
        schedule: RetrySchedule,
    ) -> Result<(), RelayDeliveryError> {
        let name = message.name();
        let mut retry = 0;
        loop {
            if let Some(tab) = to.tab() {
                if !self.is_tab_open(tab) {
                    warn!(to = %to, kind = name, "tab is gone, dropping message");
                    return Err(RelayDeliveryError::Unreachable(to.to_string()));
                }
            }
            match self.send(from, to, message.clone()) {
                Ok(()) => {
                    debug!(to = %to, kind = name, attempts = retry + 1, "delivered");
                    return Ok(());
                }
                Err(e) if retry < schedule.max_retries => {
                    retry += 1;
                    let delay = schedule.delay(retry);
                    debug!(
                        to = %to,
                        kind = name,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        "delivery failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(_) => {
                    warn!(to = %to, kind = name, "delivery failed, giving up");
                    return Err(RelayDeliveryError::Exhausted {
                        target: to.to_string(),
                        attempts: retry + 1,
                    });
                }
            }
        }
    }

    /// Deliver a reply for the request registered under `url`. The target is
    /// the request's origin, or `fallback` when nothing is pending. The
    /// pending entry is removed whatever the outcome.
    pub async fn deliver_pending(
        &self,
        pending: &Mutex<PendingRequests>,
        url: &str,
        fallback: Option<ContextId>,
        from: ContextId,
        message: Message,
        schedule: RetrySchedule,
    ) -> Result<ContextId, RelayDeliveryError> {
        let origin = {
            let pending = pending.lock().unwrap_or_else(|p| p.into_inner());
            pending.get(url).map(|p| p.origin)
        };
        let Some(target) = origin.or(fallback) else {
            remove_pending(pending, url);
            return Err(RelayDeliveryError::Unreachable(format!(
                "no pending request for {}",
                url
            )));
        };

        let outcome = self.deliver(from, target, message, schedule).await;
        remove_pending(pending, url);
        outcome.map(|()| target)
    }
}

fn remove_pending(pending: &Mutex<PendingRequests>, url: &str) {
    pending
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .remove(url);
}

/// An analysis request waiting for its reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub url: String,
    pub origin: ContextId,
    pub created_at: Instant,
}

/// Outstanding requests keyed by document URL. Entries older than the TTL
/// count as absent.
#[derive(Debug)]
pub struct PendingRequests {
    entries: HashMap<String, PendingRequest>,
    ttl: Duration,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_TTL)
    }
}

impl PendingRequests {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    fn is_live(&self, request: &PendingRequest) -> bool {
        request.created_at.elapsed() < self.ttl
    }

    /// Record a request. Returns false when a live request for `url` already
    /// exists, in which case the new one is coalesced into it.
    pub fn insert(&mut self, url: &str, origin: ContextId) -> bool {
        if self.get(url).is_some() {
            debug!(url, "request already pending");
            return false;
        }
        self.entries.insert(
            url.to_string(),
            PendingRequest {
                url: url.to_string(),
                origin,
                created_at: Instant::now(),
            },
        );
        true
    }

    pub fn get(&self, url: &str) -> Option<&PendingRequest> {
        self.entries.get(url).filter(|r| self.is_live(r))
    }

    pub fn take(&mut self, url: &str) -> Option<PendingRequest> {
        let request = self.entries.remove(url)?;
        self.is_live(&request).then_some(request)
    }

    pub fn remove(&mut self, url: &str) -> bool {
        self.entries.remove(url).is_some()
    }

    pub fn purge_expired(&mut self) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, r| r.created_at.elapsed() < ttl);
        let purged = before - self.entries.len();
        if purged > 0 {
            info!(purged, "expired pending requests");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.values().filter(|r| self.is_live(r)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
