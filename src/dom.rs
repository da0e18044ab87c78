//! Arena DOM used for the page being scanned and for fetched documents.
//!
//! The tree builder is forgiving: unknown end tags are ignored,
//! unclosed elements are closed at end of input, and raw-text elements
//! (`script`, `style`, `noscript`, `textarea`, `title`) keep their content as a
//! single text child.

use std::collections::HashMap;

/// Index of a node in the document arena.
pub type NodeId = usize;

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];
const RAW_TEXT_TAGS: &[&str] = &["script", "style", "noscript", "textarea", "title"];
const HIDDEN_TAGS: &[&str] = &["script", "style", "noscript", "template", "head"];
const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "footer",
    "form", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "main", "nav", "ol",
    "p", "pre", "section", "table", "td", "th", "tr", "ul",
];
// Start tags that end an open paragraph.
const CLOSES_P: &[&str] = &[
    "address", "article", "aside", "blockquote", "div", "dl", "footer", "form", "h1", "h2",
    "h3", "h4", "h5", "h6", "header", "hr", "li", "main", "nav", "ol", "p", "pre", "section",
    "table", "ul",
];
// An implied end tag is never looked for past one of these.
const SCOPE_TAGS: &[&str] = &["button", "table", "td", "th", "caption", "template"];

/// Open elements past this depth are added as leaves.
pub const MAX_OPEN_ELEMENTS: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Document,
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub kind: NodeKind,
}

#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    // Roots of subtrees inserted since the last `take_mutations`.
    inserted: Vec<NodeId>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                parent: None,
                children: Vec::new(),
                kind: NodeKind::Document,
            }],
            inserted: Vec::new(),
        }
    }

    pub fn parse(html: &str) -> Self {
        let mut doc = Self::new();
        TreeBuilder::new(&mut doc, 0).feed(html);
        doc
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn tag(&self, id: NodeId) -> Option<&str> {
        match &self.nodes.get(id)?.kind {
            NodeKind::Element { tag, .. } => Some(tag),
            _ => None,
        }
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        match &self.nodes.get(id)?.kind {
            NodeKind::Element { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        if let Some(Node {
            kind: NodeKind::Element { attrs, .. },
            ..
        }) = self.nodes.get_mut(id)
        {
            match attrs.iter_mut().find(|(k, _)| k == name) {
                Some(slot) => slot.1 = value.to_string(),
                None => attrs.push((name.to_string(), value.to_string())),
            }
        }
    }

    pub fn body(&self) -> Option<NodeId> {
        self.elements_by_tag("body").into_iter().next()
    }

    /// Pre-order traversal of `id` and everything below it.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let Some(node) = self.nodes.get(next) else {
                continue;
            };
            out.push(next);
            stack.extend(node.children.iter().rev());
        }
        out
    }

    pub fn elements_by_tag(&self, tag: &str) -> Vec<NodeId> {
        self.descendants(self.root())
            .into_iter()
            .filter(|&id| self.tag(id) == Some(tag))
            .collect()
    }

    /// First element under `scope` matching a simple selector: `tag`,
    /// `.class`, `#id` or `[attr=value]`.
    pub fn select_first(&self, scope: NodeId, selector: &str) -> Option<NodeId> {
        let selector = Selector::parse(selector)?;
        self.descendants(scope)
            .into_iter()
            .find(|&id| selector.matches(self, id))
    }

    /// Visible text below `id`, with a space at block boundaries and hidden
    /// elements (`script`, `style`, ...) skipped. Whitespace is not collapsed.
    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.collect_text(id, &mut out);
        out
    }

    fn collect_text(&self, id: NodeId, out: &mut String) {
        enum Step {
            Enter(NodeId),
            Leave,
        }
        let mut stack = vec![Step::Enter(id)];
        while let Some(step) = stack.pop() {
            let Step::Enter(next) = step else {
                out.push(' ');
                continue;
            };
            let Some(node) = self.nodes.get(next) else {
                continue;
            };
            match &node.kind {
                NodeKind::Text(text) => {
                    out.push_str(text);
                    continue;
                }
                NodeKind::Element { tag, .. } => {
                    if HIDDEN_TAGS.contains(&tag.as_str()) {
                        continue;
                    }
                    if BLOCK_TAGS.contains(&tag.as_str()) {
                        out.push(' ');
                        stack.push(Step::Leave);
                    }
                }
                NodeKind::Document => {}
            }
            stack.extend(node.children.iter().rev().map(|&child| Step::Enter(child)));
        }
    }

    /// Parse `html` and append the resulting nodes under `parent`, the way a
    /// page script inserting markup would. Returns the new top-level nodes.
    pub fn append_html(&mut self, parent: NodeId, html: &str) -> Vec<NodeId> {
        if self.nodes.get(parent).is_none() {
            return Vec::new();
        }
        let before = self.nodes[parent].children.len();
        TreeBuilder::new(self, parent).feed(html);
        let added: Vec<NodeId> = self.nodes[parent].children[before..].to_vec();
        self.inserted.extend(added.iter().copied());
        added
    }

    /// Drain the roots of subtrees inserted since the previous call.
    pub fn take_mutations(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.inserted)
    }

    fn push(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            parent: Some(parent),
            children: Vec::new(),
            kind,
        });
        self.nodes[parent].children.push(id);
        id
    }
}

enum Selector {
    Tag(String),
    Class(String),
    Id(String),
    Attr(String, String),
}

impl Selector {
    fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if let Some(class) = input.strip_prefix('.') {
            return Some(Self::Class(class.to_string()));
        }
        if let Some(id) = input.strip_prefix('#') {
            return Some(Self::Id(id.to_string()));
        }
        if let Some(inner) = input.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            let (name, value) = inner.split_once('=')?;
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            return Some(Self::Attr(name.trim().to_ascii_lowercase(), value.to_string()));
        }
        if input.is_empty() {
            return None;
        }
        Some(Self::Tag(input.to_ascii_lowercase()))
    }

    fn matches(&self, doc: &Document, id: NodeId) -> bool {
        if doc.tag(id).is_none() {
            return false;
        }
        match self {
            Self::Tag(tag) => doc.tag(id) == Some(tag.as_str()),
            Self::Class(class) => doc
                .attr(id, "class")
                .is_some_and(|v| v.split_whitespace().any(|c| c == class)),
            Self::Id(want) => doc.attr(id, "id") == Some(want.as_str()),
            Self::Attr(name, want) => doc.attr(id, name) == Some(want.as_str()),
        }
    }
}

/// Decode one pass of character references. Unknown named references become
/// a space.
pub fn decode_entities(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        match parse_reference(tail) {
            Some((decoded, consumed)) => {
                out.push_str(&decoded);
                rest = &tail[consumed..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn parse_reference(tail: &str) -> Option<(String, usize)> {
    let semi = tail.as_bytes().iter().take(34).position(|b| *b == b';')?;
    let body = &tail[1..semi];
    if body.is_empty() || body.len() > 32 {
        return None;
    }
    let decoded = if let Some(num) = body.strip_prefix('#') {
        let (digits, radix) = match num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
            Some(hex) => (hex, 16),
            None => (num, 10),
        };
        if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
            return None;
        }
        u32::from_str_radix(digits, radix)
            .ok()
            .and_then(char::from_u32)
            .unwrap_or(' ')
            .to_string()
    } else {
        if !body.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        match body {
            "nbsp" => " ".to_string(),
            "amp" => "&".to_string(),
            "lt" => "<".to_string(),
            "gt" => ">".to_string(),
            "quot" => "\"".to_string(),
            "apos" => "'".to_string(),
            _ => " ".to_string(),
        }
    };
    Some((decoded, semi + 1))
}

struct TreeBuilder<'a> {
    doc: &'a mut Document,
    stack: Vec<NodeId>,
}

struct ParsedTag {
    name: String,
    attrs: Vec<(String, String)>,
    is_end: bool,
    self_closing: bool,
}

impl<'a> TreeBuilder<'a> {
    fn new(doc: &'a mut Document, parent: NodeId) -> Self {
        Self {
            doc,
            stack: vec![parent],
        }
    }

    fn current(&self) -> NodeId {
        self.stack.last().copied().unwrap_or(0)
    }

    fn feed(mut self, input: &str) {
        let bytes = input.as_bytes();
        let mut idx = 0;

        while idx < bytes.len() {
            if bytes[idx] != b'<' {
                let next = find_byte(bytes, idx, b'<').unwrap_or(bytes.len());
                self.text(&input[idx..next]);
                idx = next;
                continue;
            }
            if starts_with(bytes, idx, b"<!--") {
                idx = find_subslice(bytes, idx + 4, b"-->")
                    .map(|end| end + 3)
                    .unwrap_or(bytes.len());
                continue;
            }
            if starts_with(bytes, idx, b"<!") || starts_with(bytes, idx, b"<?") {
                idx = skip_to_gt(bytes, idx + 2);
                continue;
            }
            let Some((tag, next_idx)) = parse_tag(input, idx) else {
                // A lone '<' is text.
                self.text("<");
                idx += 1;
                continue;
            };
            idx = next_idx;

            if tag.is_end {
                self.close(&tag.name);
                continue;
            }
            if CLOSES_P.contains(&tag.name.as_str()) {
                self.close_implied("p", &[]);
            }
            if tag.name == "li" {
                self.close_implied("li", &["ul", "ol"]);
            }

            let id = self.doc.push(
                self.current(),
                NodeKind::Element {
                    tag: tag.name.clone(),
                    attrs: tag.attrs,
                },
            );
            if tag.self_closing || VOID_TAGS.contains(&tag.name.as_str()) {
                continue;
            }
            if RAW_TEXT_TAGS.contains(&tag.name.as_str()) {
                let (raw, after) = read_raw_text_until_end_tag(input, idx, &tag.name);
                if !raw.is_empty() {
                    let text = if tag.name == "title" || tag.name == "textarea" {
                        decode_entities(raw)
                    } else {
                        raw.to_string()
                    };
                    self.doc.push(id, NodeKind::Text(text));
                }
                idx = after;
                continue;
            }
            if self.stack.len() >= MAX_OPEN_ELEMENTS {
                continue;
            }
            self.stack.push(id);
        }
    }

    fn text(&mut self, raw: &str) {
        if raw.is_empty() {
            return;
        }
        let parent = self.current();
        let decoded = decode_entities(raw);
        // Merge with a preceding text sibling.
        if let Some(&last) = self.doc.nodes[parent].children.last() {
            if let NodeKind::Text(existing) = &mut self.doc.nodes[last].kind {
                existing.push_str(&decoded);
                return;
            }
        }
        self.doc.push(parent, NodeKind::Text(decoded));
    }

    /// Close an open `name` element unless a scope boundary or one of
    /// `stop_at` is nearer.
    fn close_implied(&mut self, name: &str, stop_at: &[&str]) {
        for pos in (1..self.stack.len()).rev() {
            let Some(tag) = self.doc.tag(self.stack[pos]) else {
                return;
            };
            if tag == name {
                self.stack.truncate(pos);
                return;
            }
            if SCOPE_TAGS.contains(&tag) || stop_at.contains(&tag) {
                return;
            }
        }
    }

    fn close(&mut self, name: &str) {
        // The bottom of the stack is the insertion root and is never popped.
        let Some(pos) = self
            .stack
            .iter()
            .skip(1)
            .rposition(|&id| self.doc.tag(id) == Some(name))
        else {
            return;
        };
        self.stack.truncate(pos + 1);
    }
}

fn parse_tag(input: &str, start: usize) -> Option<(ParsedTag, usize)> {
    let bytes = input.as_bytes();
    let mut idx = start + 1;
    let mut is_end = false;
    if bytes.get(idx) == Some(&b'/') {
        is_end = true;
        idx += 1;
    }
    let name_start = idx;
    while idx < bytes.len() && is_tag_name_char(bytes[idx]) {
        idx += 1;
    }
    if idx == name_start || !bytes[name_start].is_ascii_alphabetic() {
        return None;
    }
    let name = input[name_start..idx].to_ascii_lowercase();

    let mut attrs = Vec::new();
    let mut self_closing = false;
    loop {
        idx = skip_spaces(bytes, idx);
        match bytes.get(idx) {
            None => return None,
            Some(b'>') => {
                return Some((
                    ParsedTag {
                        name,
                        attrs,
                        is_end,
                        self_closing,
                    },
                    idx + 1,
                ));
            }
            Some(b'/') => {
                self_closing = true;
                idx += 1;
            }
            Some(_) => {
                self_closing = false;
                let attr_start = idx;
                while idx < bytes.len()
                    && !bytes[idx].is_ascii_whitespace()
                    && !matches!(bytes[idx], b'=' | b'>' | b'/')
                {
                    idx += 1;
                }
                let attr_name = input[attr_start..idx].to_ascii_lowercase();
                idx = skip_spaces(bytes, idx);
                let mut value = String::new();
                if bytes.get(idx) == Some(&b'=') {
                    idx = skip_spaces(bytes, idx + 1);
                    match bytes.get(idx) {
                        Some(&quote) if quote == b'"' || quote == b'\'' => {
                            let end = find_byte(bytes, idx + 1, quote)?;
                            value = decode_entities(&input[idx + 1..end]);
                            idx = end + 1;
                        }
                        _ => {
                            let value_start = idx;
                            while idx < bytes.len()
                                && !bytes[idx].is_ascii_whitespace()
                                && bytes[idx] != b'>'
                            {
                                idx += 1;
                            }
                            value = decode_entities(&input[value_start..idx]);
                        }
                    }
                }
                if !attr_name.is_empty() {
                    attrs.push((attr_name, value));
                }
            }
        }
    }
}

fn read_raw_text_until_end_tag<'a>(input: &'a str, start: usize, tag: &str) -> (&'a str, usize) {
    let bytes = input.as_bytes();
    let tag_bytes = tag.as_bytes();
    let mut idx = start;
    while idx < bytes.len() {
        if bytes[idx] == b'<'
            && bytes.get(idx + 1) == Some(&b'/')
            && starts_with_ignore_ascii_case(bytes, idx + 2, tag_bytes)
        {
            let end = skip_to_gt(bytes, idx + 2 + tag_bytes.len());
            return (&input[start..idx], end);
        }
        idx += 1;
    }
    (&input[start..], bytes.len())
}

fn is_tag_name_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b':')
}

fn skip_spaces(bytes: &[u8], mut idx: usize) -> usize {
    while idx < bytes.len() && bytes[idx].is_ascii_whitespace() {
        idx += 1;
    }
    idx
}

fn skip_to_gt(bytes: &[u8], idx: usize) -> usize {
    find_byte(bytes, idx, b'>')
        .map(|gt| gt + 1)
        .unwrap_or(bytes.len())
}

fn starts_with(bytes: &[u8], idx: usize, pattern: &[u8]) -> bool {
    bytes.get(idx..idx + pattern.len()) == Some(pattern)
}

fn starts_with_ignore_ascii_case(bytes: &[u8], idx: usize, pattern: &[u8]) -> bool {
    bytes
        .get(idx..idx + pattern.len())
        .is_some_and(|window| window.eq_ignore_ascii_case(pattern))
}

fn find_subslice(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= bytes.len() {
        return None;
    }
    bytes[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset)
}

fn find_byte(bytes: &[u8], from: usize, byte: u8) -> Option<usize> {
    bytes
        .get(from..)?
        .iter()
        .position(|candidate| *candidate == byte)
        .map(|offset| from + offset)
}

/// Count of elements per tag.
pub fn tag_histogram(doc: &Document) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for id in doc.descendants(doc.root()) {
        if let Some(tag) = doc.tag(id) {
            *counts.entry(tag.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_nested_tree_with_attributes() {
        let doc = Document::parse(
            r#"<html><body><div class="nav main"><a href="/privacy" id=p>Privacy</a></div></body></html>"#,
        );
        let anchors = doc.elements_by_tag("a");
        assert_eq!(anchors.len(), 1);
        assert_eq!(doc.attr(anchors[0], "href"), Some("/privacy"));
        assert_eq!(doc.attr(anchors[0], "id"), Some("p"));
        assert_eq!(doc.text_content(anchors[0]), "Privacy");
        assert_eq!(doc.select_first(doc.root(), ".main"), doc.elements_by_tag("div").first().copied());
        assert_eq!(doc.select_first(doc.root(), "#p"), Some(anchors[0]));
    }

    #[test]
    fn script_and_style_are_hidden_from_text() {
        let doc = Document::parse(
            "<body>Hello<script>var x = '<b>';</script><style>p{}</style> World</body>",
        );
        let text = doc.text_content(doc.root());
        assert!(text.contains("Hello"));
        assert!(text.contains("World"));
        assert!(!text.contains("var x"));
        assert!(!text.contains("p{}"));
    }

    #[test]
    fn decodes_entities_in_text_and_attributes() {
        let doc = Document::parse(r#"<a title="a &amp; b">Terms &amp; Conditions&nbsp;&copy;</a>"#);
        let a = doc.elements_by_tag("a")[0];
        assert_eq!(doc.attr(a, "title"), Some("a & b"));
        assert_eq!(doc.text_content(a), "Terms & Conditions  ");
    }

    #[test]
    fn numeric_references() {
        assert_eq!(decode_entities("it&#39;s &#x41;"), "it's A");
        assert_eq!(decode_entities("AT&T rocks"), "AT&T rocks");
    }

    #[test]
    fn unmatched_end_tags_are_ignored() {
        let doc = Document::parse("<div><p>one</span>two</p></div><p>three");
        let text = doc.text_content(doc.root());
        assert!(text.contains("onetwo"));
        assert!(text.contains("three"));
    }

    #[test]
    fn role_selector() {
        let doc = Document::parse(r#"<div role="main"><p>x</p></div>"#);
        let div = doc.elements_by_tag("div")[0];
        assert_eq!(doc.select_first(doc.root(), "[role=main]"), Some(div));
        assert_eq!(doc.select_first(doc.root(), r#"[role="main"]"#), Some(div));
    }

    #[test]
    fn append_html_records_mutation_roots() {
        let mut doc = Document::parse("<body><p>x</p></body>");
        let body = doc.body().unwrap();
        assert!(doc.take_mutations().is_empty());
        let added = doc.append_html(body, r#"<footer><a href="/terms">Terms of Use</a></footer>"#);
        assert_eq!(added.len(), 1);
        assert_eq!(doc.take_mutations(), added);
        assert!(doc.take_mutations().is_empty());
        assert_eq!(doc.elements_by_tag("a").len(), 1);
    }

    #[test]
    fn paragraphs_and_list_items_close_implicitly() {
        let doc = Document::parse("<body><p>a<p>b<div>c</div><ul><li>x<li>y<ul><li>z</ul></ul></body>");
        let body = doc.body().unwrap();
        let ps = doc.elements_by_tag("p");
        assert_eq!(ps.len(), 2);
        for p in ps {
            assert_eq!(doc.node(p).unwrap().parent, Some(body));
        }
        let div = doc.elements_by_tag("div")[0];
        assert_eq!(doc.node(div).unwrap().parent, Some(body));

        let lis = doc.elements_by_tag("li");
        let outer = doc.elements_by_tag("ul")[0];
        assert_eq!(doc.node(lis[0]).unwrap().parent, Some(outer));
        assert_eq!(doc.node(lis[1]).unwrap().parent, Some(outer));
        assert_ne!(doc.node(lis[2]).unwrap().parent, Some(outer));
    }

    #[test]
    fn table_closes_open_paragraph() {
        let doc = Document::parse("<p>a<table><tr><td><p>b</td></tr></table>");
        let table = doc.elements_by_tag("table")[0];
        // The table closes the outer paragraph; the inner one is scoped to the cell.
        assert_eq!(doc.node(table).unwrap().parent, doc.body().or(Some(doc.root())));
        assert_eq!(doc.elements_by_tag("p").len(), 2);
    }

    #[test]
    fn deep_nesting_is_capped_and_walked_without_recursion() {
        let depth = 100_000;
        let html = format!(
            "{}<p>We collect data.</p>{}",
            "<div>".repeat(depth),
            "</div>".repeat(depth)
        );
        let handle = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(move || {
                let doc = Document::parse(&html);
                // Parents are always created before their children.
                let mut depth = vec![0usize; doc.len()];
                for id in 1..doc.len() {
                    let parent = doc.node(id).and_then(|n| n.parent).unwrap_or(0);
                    depth[id] = depth[parent] + 1;
                }
                let deepest = depth.into_iter().max().unwrap_or(0);
                (deepest, doc.text_content(doc.root()))
            })
            .unwrap();
        let (deepest, text) = handle.join().unwrap();
        assert!(deepest <= MAX_OPEN_ELEMENTS + 1, "{deepest}");
        assert!(text.contains("We collect data."));
    }

    #[test]
    fn ampersands_without_semicolons_decode_in_linear_time() {
        let input = format!("{};", "Q&A ".repeat(200_000));
        let start = std::time::Instant::now();
        let decoded = decode_entities(&input);
        assert_eq!(decoded, input);
        assert!(start.elapsed() < std::time::Duration::from_secs(2));
        assert_eq!(decode_entities("&amp;&#x41;&nbsp;"), "&A ");
    }

    #[test]
    fn histogram_counts_tags() {
        let doc = Document::parse("<ul><li>a</li><li>b</li></ul>");
        let counts = tag_histogram(&doc);
        assert_eq!(counts.get("li"), Some(&2));
    }
}
