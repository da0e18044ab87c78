use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Kind of legal document a link points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DocumentType {
    Privacy,
    Cookie,
    TermsOfService,
    TermsAndConditions,
    UserAgreement,
    Eula,
    AcceptableUsePolicy,
    DataPolicy,
    Other,
}

impl DocumentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Privacy => "privacy",
            Self::Cookie => "cookie",
            Self::TermsOfService => "termsOfService",
            Self::TermsAndConditions => "termsAndConditions",
            Self::UserAgreement => "userAgreement",
            Self::Eula => "eula",
            Self::AcceptableUsePolicy => "acceptableUsePolicy",
            Self::DataPolicy => "dataPolicy",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// How strictly link text is matched.
///
/// `Strict` matches whole phrases against visible text only. `Loose` is the
/// simple detection flow: plain substring match of a short keyword list
/// against the text *and* the href, falling back to `Other` when no strict
/// category applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    #[default]
    Strict,
    Loose,
}

// Priority order: the first row that matches wins.
const CATEGORY_PHRASES: &[(DocumentType, &[&str])] = &[
    (
        DocumentType::Privacy,
        &["privacy policy", "privacy notice", "privacy statement"],
    ),
    (
        DocumentType::Cookie,
        &["cookie policy", "cookies policy", "cookie notice"],
    ),
    (
        DocumentType::TermsOfService,
        &["terms of service", "terms of use"],
    ),
    (
        DocumentType::TermsAndConditions,
        &["terms and conditions", "terms & conditions"],
    ),
    (
        DocumentType::UserAgreement,
        &["user agreement", "service agreement"],
    ),
    (
        DocumentType::Eula,
        &["end user license agreement", "eula", "license"],
    ),
    (
        DocumentType::AcceptableUsePolicy,
        &["acceptable use policy", "acceptable use"],
    ),
    (
        DocumentType::DataPolicy,
        &["data policy", "data protection policy"],
    ),
];

const LOOSE_KEYWORDS: &[&str] = &[
    "terms",
    "terms and conditions",
    "terms of service",
    "terms of use",
    "tos",
];

static CATEGORY_RES: LazyLock<Vec<(DocumentType, Regex)>> = LazyLock::new(|| {
    CATEGORY_PHRASES
        .iter()
        .filter_map(|(kind, phrases)| {
            let alternation = phrases
                .iter()
                .map(|p| regex::escape(p))
                .collect::<Vec<_>>()
                .join("|");
            // Patterns are built from the literal table above.
            Regex::new(&format!(r"(?i)\b(?:{})\b", alternation))
                .ok()
                .map(|re| (*kind, re))
        })
        .collect()
});

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Strict classification of visible link text.
///
/// Returns `None` when no phrase matches on a word boundary; never returns
/// `Other`.
pub fn classify(link_text: &str) -> Option<DocumentType> {
    let text = normalize(link_text);
    if text.is_empty() {
        return None;
    }
    CATEGORY_RES
        .iter()
        .find(|(_, re)| re.is_match(&text))
        .map(|(kind, _)| *kind)
}

/// Loose detection: substring match on text or href.
pub fn classify_loose(link_text: &str, href: &str) -> Option<DocumentType> {
    let text = normalize(link_text);
    let href = href.to_lowercase();
    let hit = LOOSE_KEYWORDS
        .iter()
        .any(|kw| text.contains(kw) || href.contains(kw));
    if !hit {
        return None;
    }
    Some(classify(&text).unwrap_or(DocumentType::Other))
}

pub fn classify_with(mode: MatchMode, link_text: &str, href: &str) -> Option<DocumentType> {
    match mode {
        MatchMode::Strict => classify(link_text),
        MatchMode::Loose => classify_loose(link_text, href),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_phrase_matches() {
        assert_eq!(classify("Privacy Policy"), Some(DocumentType::Privacy));
        assert_eq!(classify("  COOKIE   policy "), Some(DocumentType::Cookie));
        assert_eq!(classify("Terms of Service"), Some(DocumentType::TermsOfService));
        assert_eq!(
            classify("Terms & Conditions"),
            Some(DocumentType::TermsAndConditions)
        );
        assert_eq!(classify("User Agreement"), Some(DocumentType::UserAgreement));
        assert_eq!(classify("EULA"), Some(DocumentType::Eula));
        assert_eq!(
            classify("Acceptable Use Policy"),
            Some(DocumentType::AcceptableUsePolicy)
        );
        assert_eq!(classify("Data Policy"), Some(DocumentType::DataPolicy));
    }

    #[test]
    fn substring_of_longer_word_does_not_match() {
        assert_eq!(classify("Terminator"), None);
        assert_eq!(classify("Licensed products"), None);
        assert_eq!(classify("privacy policyholders"), None);
        assert_eq!(classify("Terms"), None);
    }

    #[test]
    fn priority_order_privacy_first() {
        assert_eq!(
            classify("Privacy Policy and Terms of Service"),
            Some(DocumentType::Privacy)
        );
        assert_eq!(
            classify("Terms of Service / Cookie Policy"),
            Some(DocumentType::Cookie)
        );
    }

    #[test]
    fn empty_text_is_none() {
        assert_eq!(classify("   "), None);
        assert_eq!(classify_loose("", ""), None);
    }

    #[test]
    fn loose_mode_checks_href_and_falls_back_to_other() {
        assert_eq!(
            classify_loose("Legal", "https://example.com/terms"),
            Some(DocumentType::Other)
        );
        assert_eq!(classify_loose("Our TOS", "/legal"), Some(DocumentType::Other));
        assert_eq!(
            classify_loose("Terms of Use", "/legal"),
            Some(DocumentType::TermsOfService)
        );
        assert_eq!(classify_loose("Home", "/"), None);
    }

    #[test]
    fn strict_mode_ignores_href() {
        assert_eq!(
            classify_with(MatchMode::Strict, "Legal", "https://example.com/terms"),
            None
        );
        assert_eq!(
            classify_with(MatchMode::Loose, "Legal", "https://example.com/terms"),
            Some(DocumentType::Other)
        );
    }
}
