use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::RelayDeliveryError;
use crate::relay::{ContextId, Envelope, Message, Relay, TabId};
use crate::scanner::CandidateLink;

/// Extracted text of one document, as shown to the page.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageContent {
    pub link_text: String,
    pub content: String,
    pub index: usize,
    pub fetched_at: DateTime<Utc>,
}

/// What the page has been told so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageState {
    pub links: Vec<CandidateLink>,
    pub content: BTreeMap<String, PageContent>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Sends page-originated messages to the tab's agent.
#[derive(Debug, Clone)]
pub struct PageHandle {
    tab: TabId,
    relay: Relay,
}

impl PageHandle {
    pub fn request_fetch(&self) -> Result<(), RelayDeliveryError> {
        self.relay.send(
            ContextId::Page(self.tab),
            ContextId::Agent(self.tab),
            Message::FetchTermsRequest,
        )
    }

    /// Simulate page scripts inserting markup into the body.
    pub fn insert_html(&self, html: &str) -> Result<(), RelayDeliveryError> {
        self.relay.send(
            ContextId::Page(self.tab),
            ContextId::Agent(self.tab),
            Message::DomInserted {
                html: html.to_string(),
            },
        )
    }
}

/// The page context. Keeps a read-only view of detected links and fetched
/// content for inspection.
#[derive(Debug)]
pub struct Page {
    tab: TabId,
    relay: Relay,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    state: PageState,
}

impl Page {
    pub fn new(tab: TabId, relay: Relay) -> Self {
        let inbox = relay.register(ContextId::Page(tab));
        Self {
            tab,
            relay,
            inbox,
            state: PageState::default(),
        }
    }

    pub fn handle(&self) -> PageHandle {
        PageHandle {
            tab: self.tab,
            relay: self.relay.clone(),
        }
    }

    pub fn get_state(&self) -> &PageState {
        &self.state
    }

    pub fn list_candidates(&self) -> &[CandidateLink] {
        &self.state.links
    }

    pub fn receive(&mut self, envelope: Envelope) {
        match envelope.message {
            Message::LinksFound { links } => {
                for link in links {
                    if !self.state.links.iter().any(|l| l.url == link.url) {
                        self.state.links.push(link);
                    }
                }
                self.touch();
                debug!(tab = self.tab, links = self.state.links.len(), "links updated");
            }
            Message::ContentReceived {
                url,
                link_text,
                content,
                index,
            } => {
                info!(tab = self.tab, url = %url, chars = content.len(), "content stored");
                self.state.content.insert(
                    url,
                    PageContent {
                        link_text,
                        content,
                        index,
                        fetched_at: Utc::now(),
                    },
                );
                self.touch();
            }
            other => debug!(tab = self.tab, kind = other.name(), "ignored by page"),
        }
    }

    fn touch(&mut self) {
        self.state.last_updated = Some(Utc::now());
    }

    pub async fn run(mut self) -> Self {
        while let Some(envelope) = self.inbox.recv().await {
            self.receive(envelope);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::DocumentType;

    fn link(url: &str) -> CandidateLink {
        CandidateLink {
            text: "Privacy Policy".into(),
            url: url.into(),
            document_type: DocumentType::Privacy,
        }
    }

    #[test]
    fn links_merge_by_url() {
        let relay = Relay::new();
        let mut page = Page::new(1, relay);
        assert!(page.get_state().last_updated.is_none());
        for links in [
            vec![link("https://example.com/privacy")],
            vec![link("https://example.com/privacy"), link("https://example.com/terms")],
        ] {
            page.receive(Envelope {
                from: ContextId::Agent(1),
                message: Message::LinksFound { links },
            });
        }
        assert_eq!(page.list_candidates().len(), 2);
        assert!(page.get_state().last_updated.is_some());
    }

    #[tokio::test]
    async fn content_is_kept_per_url() {
        let relay = Relay::new();
        let page = Page::new(1, relay.clone());
        let handle = tokio::spawn(page.run());
        relay
            .send(
                ContextId::Agent(1),
                ContextId::Page(1),
                Message::ContentReceived {
                    url: "https://example.com/privacy".into(),
                    link_text: "Privacy Policy".into(),
                    content: "We collect data.".into(),
                    index: 1,
                },
            )
            .unwrap();
        relay.close_tab(1);
        let page = handle.await.unwrap();
        let stored = &page.get_state().content["https://example.com/privacy"];
        assert_eq!(stored.content, "We collect data.");
        assert_eq!(stored.index, 1);
    }

    #[tokio::test]
    async fn handle_reaches_agent() {
        let relay = Relay::new();
        let page = Page::new(3, relay.clone());
        let mut agent = relay.register(ContextId::Agent(3));
        page.handle().request_fetch().unwrap();
        page.handle().insert_html("<p>x</p>").unwrap();
        assert_eq!(agent.recv().await.unwrap().message, Message::FetchTermsRequest);
        assert!(matches!(agent.recv().await.unwrap().message, Message::DomInserted { .. }));
    }
}
