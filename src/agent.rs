use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::{AnalysisCache, BadgeCallback, BadgeUpdate};
use crate::config::PipelineConfig;
use crate::dom::Document;
use crate::relay::{ContextId, Envelope, Message, Relay, TabId};
use crate::scanner::{CandidateLink, Debouncer, LinkScanner};

pub const SCORE_ATTR: &str = "data-terms-score";
pub const TIER_ATTR: &str = "data-terms-tier";
pub const COLOR_ATTR: &str = "data-terms-color";
pub const STATUS_ATTR: &str = "data-terms-status";

pub const UNAVAILABLE_TEXT: &str = "unable to display analysis";

/// The in-page context: owns the DOM, the scanner and the analysis cache.
pub struct Agent {
    tab: TabId,
    relay: Relay,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    doc: Document,
    scanner: LinkScanner,
    cache: AnalysisCache,
    badges: Arc<Mutex<Vec<BadgeUpdate>>>,
    debouncer: Debouncer,
    auto_fetch: bool,
}

impl Agent {
    /// Parse `html` as the page at `page_url` and register with the relay.
    /// `on_badge` observes every badge change after it is applied.
    pub fn new(
        tab: TabId,
        page_url: &str,
        html: &str,
        relay: Relay,
        config: &PipelineConfig,
        on_badge: Option<BadgeCallback>,
    ) -> Result<Self, url::ParseError> {
        let scanner = LinkScanner::new(page_url, config.mode)?;
        let badges = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::clone(&badges);
        let mut observer = on_badge;
        let cache = AnalysisCache::with_callback(Box::new(move |update: &BadgeUpdate| {
            queue
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(update.clone());
            if let Some(observer) = observer.as_mut() {
                observer(update);
            }
        }));
        let inbox = relay.register(ContextId::Agent(tab));

        Ok(Self {
            tab,
            relay,
            inbox,
            doc: Document::parse(html),
            scanner,
            cache,
            badges,
            debouncer: Debouncer::new(config.debounce),
            auto_fetch: true,
        })
    }

    pub fn with_auto_fetch(mut self, auto_fetch: bool) -> Self {
        self.auto_fetch = auto_fetch;
        self
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn scanner(&self) -> &LinkScanner {
        &self.scanner
    }

    pub fn cache(&self) -> &AnalysisCache {
        &self.cache
    }

    /// Initial scan. Reports what it found to the page and the worker.
    pub fn start(&mut self) -> Vec<CandidateLink> {
        let found = self.scanner.scan(&mut self.doc);
        self.announce(&found);
        found
    }

    fn announce(&self, found: &[CandidateLink]) {
        if found.is_empty() {
            return;
        }
        self.send(
            ContextId::Page(self.tab),
            Message::LinksFound {
                links: found.to_vec(),
            },
        );
        self.send(
            ContextId::Worker,
            Message::TermsLinksFound {
                links: found.to_vec(),
                page_url: self.scanner.page_url().to_string(),
                auto_fetch: self.auto_fetch,
            },
        );
    }

    fn send(&self, to: ContextId, message: Message) {
        if let Err(e) = self.relay.send(ContextId::Agent(self.tab), to, message) {
            debug!(tab = self.tab, "{}", e);
        }
    }

    /// Handle messages and debounced rescans until the tab closes.
    pub async fn run(mut self) -> Self {
        loop {
            tokio::select! {
                envelope = self.inbox.recv() => match envelope {
                    Some(envelope) => self.handle(envelope),
                    None => break,
                },
                _ = self.debouncer.fired(), if self.debouncer.is_armed() => {
                    self.debouncer.reset();
                    let found = self.scanner.rescan_inserted(&mut self.doc);
                    self.announce(&found);
                }
            }
        }
        info!(
            tab = self.tab,
            candidates = self.scanner.candidates().len(),
            analyses = self.cache.len(),
            "agent stopped"
        );
        self
    }

    pub fn handle(&mut self, envelope: Envelope) {
        match envelope.message {
            Message::FetchTermsRequest => {
                let links = self.scanner.candidates().to_vec();
                info!(tab = self.tab, links = links.len(), "fetch requested by page");
                self.send(ContextId::Page(self.tab), Message::LinksFound { links: links.clone() });
                if !links.is_empty() {
                    self.send(
                        ContextId::Worker,
                        Message::TermsLinksFound {
                            links,
                            page_url: self.scanner.page_url().to_string(),
                            auto_fetch: true,
                        },
                    );
                }
            }
            Message::DomInserted { html } => {
                let Some(body) = self.doc.body() else {
                    warn!(tab = self.tab, "no body to insert into");
                    return;
                };
                self.doc.append_html(body, &html);
                self.debouncer.notify();
            }
            Message::DisplayContent {
                url,
                link_text,
                content,
                index,
            } => {
                debug!(tab = self.tab, url = %url, index, "content received");
                self.send(
                    ContextId::Page(self.tab),
                    Message::ContentReceived {
                        url,
                        link_text,
                        content,
                        index,
                    },
                );
            }
            Message::AnalysisComplete { url, payload } => {
                if let Ok(record) = self.cache.put_response(&url, &payload) {
                    info!(tab = self.tab, url = %url, score = record.score, "analysis received");
                }
                self.apply_badges();
            }
            Message::WebhookUrl { url } => {
                info!(tab = self.tab, webhook = url.as_deref().unwrap_or("<unset>"), "webhook");
            }
            other => debug!(tab = self.tab, kind = other.name(), "ignored by agent"),
        }
    }

    /// Mirror queued badge updates onto the anchors they belong to.
    fn apply_badges(&mut self) {
        let updates: Vec<BadgeUpdate> = std::mem::take(
            &mut *self.badges.lock().unwrap_or_else(|p| p.into_inner()),
        );
        for update in updates {
            let anchors = self.scanner.anchors_for(&self.doc, update.url());
            if anchors.is_empty() {
                debug!(url = update.url(), "no anchor for badge");
            }
            for anchor in anchors {
                match &update {
                    BadgeUpdate::Score { score, tier, .. } => {
                        self.doc.set_attr(anchor, SCORE_ATTR, &score.to_string());
                        self.doc.set_attr(anchor, TIER_ATTR, tier.as_str());
                        self.doc.set_attr(anchor, COLOR_ATTR, tier.color());
                        self.doc.set_attr(anchor, STATUS_ATTR, "ok");
                    }
                    BadgeUpdate::Unavailable { .. } => {
                        self.doc.set_attr(anchor, STATUS_ATTR, UNAVAILABLE_TEXT);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::cache::ScoreTier;
    use crate::classify::DocumentType;

    const PAGE: &str = r#"<html><body>
        <nav><a href="/about">About</a></nav>
        <footer><a href="/privacy">Privacy Policy</a><a href="/terms">Terms of Service</a></footer>
    </body></html>"#;

    fn agent(relay: &Relay, on_badge: Option<BadgeCallback>) -> Agent {
        Agent::new(
            5,
            "https://example.com/",
            PAGE,
            relay.clone(),
            &PipelineConfig::default(),
            on_badge,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn start_reports_links_to_page_and_worker() {
        let relay = Relay::new();
        let mut page = relay.register(ContextId::Page(5));
        let mut worker = relay.register(ContextId::Worker);
        let mut agent = agent(&relay, None);

        let found = agent.start();
        assert_eq!(found.len(), 2);

        let Message::LinksFound { links } = page.recv().await.unwrap().message else {
            panic!("expected links");
        };
        assert_eq!(links[0].document_type, DocumentType::Privacy);
        let envelope = worker.recv().await.unwrap();
        assert_eq!(envelope.from, ContextId::Agent(5));
        assert!(matches!(
            envelope.message,
            Message::TermsLinksFound { auto_fetch: true, ref links, .. } if links.len() == 2
        ));
    }

    #[tokio::test]
    async fn analysis_sets_badge_and_fires_callback() {
        let relay = Relay::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut agent = agent(
            &relay,
            Some(Box::new(move |u: &BadgeUpdate| sink.lock().unwrap().push(u.clone()))),
        );
        agent.start();

        agent.handle(Envelope {
            from: ContextId::Worker,
            message: Message::AnalysisComplete {
                url: "https://example.com/privacy".into(),
                payload: json!([{"score": 85, "summary": "fine", "itemList": []}]),
            },
        });

        assert_eq!(agent.cache().get("https://example.com/privacy").unwrap().score, 85);
        let anchor = agent.scanner().anchors_for(agent.document(), "https://example.com/privacy")[0];
        assert_eq!(agent.document().attr(anchor, SCORE_ATTR), Some("85"));
        assert_eq!(agent.document().attr(anchor, TIER_ATTR), Some("good"));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[BadgeUpdate::Score {
                url: "https://example.com/privacy".into(),
                score: 85,
                tier: ScoreTier::Good
            }]
        );
    }

    #[tokio::test]
    async fn malformed_analysis_marks_badge_unavailable() {
        let relay = Relay::new();
        let mut agent = agent(&relay, None);
        agent.start();
        agent.handle(Envelope {
            from: ContextId::Worker,
            message: Message::AnalysisComplete {
                url: "https://example.com/terms".into(),
                payload: json!({"summary": "no score here", "items": []}),
            },
        });
        assert!(agent.cache().get("https://example.com/terms").is_none());
        let anchor = agent.scanner().anchors_for(agent.document(), "https://example.com/terms")[0];
        assert_eq!(agent.document().attr(anchor, STATUS_ATTR), Some(UNAVAILABLE_TEXT));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_insertions_rescans_once() {
        let relay = Relay::new();
        let mut worker = relay.register(ContextId::Worker);
        let mut agent = agent(&relay, None);
        agent.start();
        worker.recv().await.unwrap();

        let handle = tokio::spawn(agent.run());
        for html in [
            r#"<div><a href="/cookies">Cookie Policy</a></div>"#,
            r#"<div><a href="/eula">EULA</a></div>"#,
            r#"<div><a href="/blog">Blog</a></div>"#,
        ] {
            relay
                .send(ContextId::Page(5), ContextId::Agent(5), Message::DomInserted { html: html.into() })
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let Message::TermsLinksFound { links, .. } = worker.recv().await.unwrap().message else {
            panic!("expected rescan result");
        };
        let kinds: Vec<DocumentType> = links.iter().map(|l| l.document_type).collect();
        assert_eq!(kinds, vec![DocumentType::Cookie, DocumentType::Eula]);
        assert!(worker.try_recv().is_err());

        relay.close_tab(5);
        let agent = handle.await.unwrap();
        assert_eq!(agent.scanner().candidates().len(), 4);
    }

    #[tokio::test]
    async fn display_content_is_forwarded_to_page() {
        let relay = Relay::new();
        let mut page = relay.register(ContextId::Page(5));
        let mut agent = agent(&relay, None);
        agent.handle(Envelope {
            from: ContextId::Worker,
            message: Message::DisplayContent {
                url: "https://example.com/privacy".into(),
                link_text: "Privacy Policy".into(),
                content: "We collect data.".into(),
                index: 1,
            },
        });
        let message = page.recv().await.unwrap().message;
        assert!(matches!(message, Message::ContentReceived { index: 1, .. }));
    }
}
