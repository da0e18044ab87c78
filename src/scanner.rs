use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

use crate::classify::{classify_with, DocumentType, MatchMode};
use crate::dom::{Document, NodeId};

/// Attribute set on an anchor once it has been flagged.
pub const FLAG_ATTR: &str = "data-terms-detector-overlay";

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// A link whose visible text names a legal document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateLink {
    pub text: String,
    pub url: String,
    pub document_type: DocumentType,
}

/// Absolute http(s) URL for `href` relative to `base`, fragment removed.
pub fn normalize_url(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    let mut url = base.join(href).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url.to_string())
}

fn visible_text(doc: &Document, anchor: NodeId) -> String {
    doc.text_content(anchor)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Finds and flags policy links on one page load.
///
/// Each anchor is processed at most once for the lifetime of the scanner, so
/// repeated scans and rescans after DOM mutations only look at new anchors.
#[derive(Debug)]
pub struct LinkScanner {
    base: Url,
    mode: MatchMode,
    scanned: HashSet<NodeId>,
    flagged: HashSet<NodeId>,
    known_urls: HashSet<String>,
    candidates: Vec<CandidateLink>,
}

impl LinkScanner {
    pub fn new(page_url: &str, mode: MatchMode) -> Result<Self, url::ParseError> {
        Ok(Self {
            base: Url::parse(page_url)?,
            mode,
            scanned: HashSet::new(),
            flagged: HashSet::new(),
            known_urls: HashSet::new(),
            candidates: Vec::new(),
        })
    }

    pub fn page_url(&self) -> &str {
        self.base.as_str()
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// Scan every anchor not seen before. Returns the new candidates,
    /// deduplicated by URL within this pass.
    pub fn scan(&mut self, doc: &mut Document) -> Vec<CandidateLink> {
        let anchors = doc.elements_by_tag("a");
        let found = self.scan_anchors(doc, anchors);
        info!(
            page = %self.base,
            found = found.len(),
            flagged = self.flagged.len(),
            "scan complete"
        );
        found
    }

    /// Scan only anchors inside subtrees inserted since the last call.
    pub fn rescan_inserted(&mut self, doc: &mut Document) -> Vec<CandidateLink> {
        let roots = doc.take_mutations();
        if roots.is_empty() {
            return Vec::new();
        }
        let anchors: Vec<NodeId> = roots
            .into_iter()
            .flat_map(|root| doc.descendants(root))
            .filter(|&id| doc.tag(id) == Some("a"))
            .collect();
        let found = self.scan_anchors(doc, anchors);
        debug!(found = found.len(), "incremental rescan");
        found
    }

    fn scan_anchors(&mut self, doc: &mut Document, anchors: Vec<NodeId>) -> Vec<CandidateLink> {
        let mut pass_urls = HashSet::new();
        let mut found = Vec::new();

        for anchor in anchors {
            if !self.scanned.insert(anchor) {
                continue;
            }
            let Some(href) = doc.attr(anchor, "href") else {
                continue;
            };
            let Some(url) = normalize_url(&self.base, href) else {
                continue;
            };
            let text = visible_text(doc, anchor);
            if text.is_empty() {
                continue;
            }
            // Strict mode never looks at the href.
            let Some(document_type) = classify_with(self.mode, &text, &url) else {
                continue;
            };

            self.flag(doc, anchor);
            debug!(text = %text, url = %url, kind = %document_type, "flagged link");

            if !pass_urls.insert(url.clone()) {
                continue;
            }
            let link = CandidateLink {
                text,
                url: url.clone(),
                document_type,
            };
            if self.known_urls.insert(url) {
                self.candidates.push(link.clone());
            }
            found.push(link);
        }
        found
    }

    fn flag(&mut self, doc: &mut Document, anchor: NodeId) {
        if self.flagged.contains(&anchor) || doc.attr(anchor, FLAG_ATTR).is_some() {
            self.flagged.insert(anchor);
            return;
        }
        doc.set_attr(anchor, FLAG_ATTR, "true");
        self.flagged.insert(anchor);
    }

    pub fn flagged_count(&self) -> usize {
        self.flagged.len()
    }

    pub fn is_flagged(&self, anchor: NodeId) -> bool {
        self.flagged.contains(&anchor)
    }

    /// Flagged anchors whose resolved URL is `url`.
    pub fn anchors_for(&self, doc: &Document, url: &str) -> Vec<NodeId> {
        let mut anchors: Vec<NodeId> = self
            .flagged
            .iter()
            .copied()
            .filter(|&id| {
                doc.attr(id, "href")
                    .and_then(|href| normalize_url(&self.base, href))
                    .is_some_and(|u| u == url)
            })
            .collect();
        anchors.sort_unstable();
        anchors
    }

    /// Every distinct candidate found since the page loaded.
    pub fn candidates(&self) -> &[CandidateLink] {
        &self.candidates
    }
}

/// Coalesces bursts of DOM mutations into a single rescan.
///
/// The first notification arms a deadline `delay` later; further
/// notifications before it fires are absorbed, so a continuous stream of
/// mutations still gets a rescan every `delay`.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn notify(&mut self) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.delay);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves when the armed deadline passes; never resolves when idle.
    pub async fn fired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }

    pub fn reset(&mut self) {
        self.deadline = None;
    }
}
