use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::dom::{decode_entities, Document};
use crate::error::ExtractionError;

/// Tried in order; the first region with enough text wins.
pub const MAIN_CONTENT_SELECTORS: &[&str] =
    &["main", "article", "[role=main]", ".content", "#content"];

pub const DEFAULT_MIN_MAIN_CHARS: usize = 500;

// Past this the linear regex path is used instead of building a tree.
const MAX_DOM_INPUT_BYTES: usize = 8 * 1024 * 1024;

static SCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").unwrap());
static STYLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style\b[^>]*>.*?</style\s*>").unwrap());
static NOSCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<noscript\b[^>]*>.*?</noscript\s*>").unwrap());
static UNTERMINATED_RAW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(?:script|style|noscript)\b[^>]*>.*\z").unwrap());
static COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());

/// Which extraction path to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractMode {
    /// Build a tree and prefer the main content region.
    #[default]
    Dom,
    /// Regex-only path for contexts without a DOM.
    Regex,
}

/// Converts raw HTML into collapsed plain text.
#[derive(Debug, Clone)]
pub struct TextExtractor {
    pub mode: ExtractMode,
    pub min_main_chars: usize,
}

impl Default for TextExtractor {
    fn default() -> Self {
        Self {
            mode: ExtractMode::Dom,
            min_main_chars: DEFAULT_MIN_MAIN_CHARS,
        }
    }
}

impl TextExtractor {
    pub fn regex_only() -> Self {
        Self {
            mode: ExtractMode::Regex,
            ..Self::default()
        }
    }

    /// Never fails: a DOM-path error falls back to the regex path.
    pub fn extract(&self, html: &str) -> String {
        if self.mode == ExtractMode::Dom {
            match self.extract_dom(html) {
                Ok(text) => return text,
                Err(e) => warn!("{}; using regex fallback", e),
            }
        }
        extract_regex(html)
    }

    fn extract_dom(&self, html: &str) -> Result<String, ExtractionError> {
        if html.len() > MAX_DOM_INPUT_BYTES {
            return Err(ExtractionError(format!(
                "document too large for tree extraction ({} bytes)",
                html.len()
            )));
        }
        let doc = Document::parse(html);

        for selector in MAIN_CONTENT_SELECTORS {
            let Some(region) = doc.select_first(doc.root(), selector) else {
                continue;
            };
            let text = finish(&doc.text_content(region));
            if text.chars().count() > self.min_main_chars {
                debug!(selector, chars = text.len(), "main content region found");
                return Ok(text);
            }
        }

        let scope = doc.body().unwrap_or(doc.root());
        Ok(finish(&doc.text_content(scope)))
    }
}

/// Extract with the default (DOM-preferring) extractor.
pub fn extract(html: &str) -> String {
    TextExtractor::default().extract(html)
}

/// Regex-only extraction: drop raw-text blocks, strip tags, decode, collapse.
pub fn extract_regex(html: &str) -> String {
    let cleaned = COMMENT_RE.replace_all(html, " ");
    let cleaned = SCRIPT_RE.replace_all(&cleaned, " ");
    let cleaned = STYLE_RE.replace_all(&cleaned, " ");
    let cleaned = NOSCRIPT_RE.replace_all(&cleaned, " ");
    let cleaned = UNTERMINATED_RAW_RE.replace_all(&cleaned, " ");
    let cleaned = TAG_RE.replace_all(&cleaned, " ");
    finish(&cleaned)
}

/// Decode entities until none remain, neutralize stray angle brackets and
/// collapse whitespace. The output is a fixed point of both extraction paths.
fn finish(text: &str) -> String {
    let mut decoded = text.to_string();
    loop {
        let next = decode_entities(&decoded);
        if next == decoded {
            break;
        }
        decoded = next;
    }
    let neutral: String = decoded
        .chars()
        .map(|c| match c {
            '<' => '\u{2039}',
            '>' => '\u{203A}',
            other => other,
        })
        .collect();
    neutral.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}.html", name)).unwrap()
    }

    const SIMPLE: &str =
        "<html><body><script>x</script><p>We collect data.</p></body></html>";

    #[test]
    fn simple_page_both_paths() {
        assert_eq!(extract(SIMPLE), "We collect data.");
        assert_eq!(extract_regex(SIMPLE), "We collect data.");
    }

    #[test]
    fn strips_raw_blocks_and_decodes_entities() {
        let html = "<style>.a{color:red}</style><noscript>enable js</noscript>\
                    <p>Fish&nbsp;&amp;&nbsp;Chips &quot;today&quot; it&#39;s &copy; 2024</p>";
        for text in [extract(html), extract_regex(html)] {
            assert_eq!(text, "Fish & Chips \"today\" it's 2024");
        }
    }

    #[test]
    fn output_has_no_markup_or_entities() {
        let html = "<div>a &lt;b&gt; tag &amp;amp; <script>alert(1)</script>\
                    <SCRIPT type=\"x\">y</SCRIPT>end</div>";
        for text in [extract(html), extract_regex(html)] {
            assert!(!text.contains('<'), "{text}");
            assert!(!text.contains("<script"));
            assert!(!text.contains("&nbsp;"));
            assert!(!text.contains("&amp;"));
            assert!(!text.contains("alert"));
            assert!(text.ends_with("end"));
        }
    }

    #[test]
    fn idempotent_on_own_output() {
        let html = fixture("privacy_policy");
        for extractor in [TextExtractor::default(), TextExtractor::regex_only()] {
            let once = extractor.extract(&html);
            assert_eq!(extractor.extract(&once), once);
        }
        let tricky = "x &amp;lt; y <!-- c --> &bogus; z";
        let once = extract(tricky);
        assert_eq!(extract(&once), once);
    }

    #[test]
    fn prefers_main_region_over_chrome() {
        let html = fixture("privacy_policy");
        let text = extract(&html);
        assert!(text.starts_with("Privacy Policy"), "{}", &text[..40]);
        assert!(!text.contains("Site navigation"));
        assert!(!text.contains("All rights reserved"));

        // The regex path has no notion of regions and keeps everything.
        let flat = extract_regex(&html);
        assert!(flat.contains("Site navigation"));
    }

    #[test]
    fn short_main_falls_back_to_body() {
        let html = "<body><nav>Menu</nav><main>Tiny</main><footer>Foot</footer></body>";
        assert_eq!(extract(html), "Menu Tiny Foot");
    }

    #[test]
    fn unterminated_script_is_dropped() {
        let html = "<p>keep</p><script>var leaked = 1;";
        assert_eq!(extract_regex(html), "keep");
        assert_eq!(extract(html), "keep");
    }

    #[test]
    fn empty_input() {
        assert_eq!(extract(""), "");
        assert_eq!(extract_regex("   "), "");
    }
}
