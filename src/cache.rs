use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::MalformedResponseError;

/// Severity of one finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flag {
    Good,
    Info,
    Warning,
    Critical,
}

impl Flag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    /// Unknown labels are treated as informational.
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "good" => Self::Good,
            "warning" => Self::Warning,
            "critical" => Self::Critical,
            "info" => Self::Info,
            other => {
                debug!(flag = other, "unknown flag, using info");
                Self::Info
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisItem {
    pub title: String,
    pub description: String,
    pub flag: Flag,
    pub category: Option<String>,
}

/// Canonical analysis of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub url: String,
    pub score: u8,
    pub summary: String,
    pub items: Vec<AnalysisItem>,
    pub cached: bool,
    pub snapshot_id: Option<i64>,
}

impl AnalysisRecord {
    /// Parse a raw response body.
    pub fn parse(url: &str, body: &str) -> Result<Self, MalformedResponseError> {
        let payload: Value = serde_json::from_str(body.trim()).map_err(|_| {
            let preview: String = body.chars().take(80).collect();
            MalformedResponseError::NotJson(preview)
        })?;
        Self::from_response(url, &payload)
    }

    /// Normalize either accepted response shape: a bare object or a
    /// single-element array holding it, with findings under `items` or
    /// `itemList`.
    pub fn from_response(url: &str, payload: &Value) -> Result<Self, MalformedResponseError> {
        let object = match payload {
            Value::Object(object) => object,
            Value::Array(values) => match values.as_slice() {
                [Value::Object(object)] => object,
                [] => return Err(MalformedResponseError::UnexpectedShape("empty array")),
                [_] => return Err(MalformedResponseError::UnexpectedShape("array of non-object")),
                _ => {
                    return Err(MalformedResponseError::UnexpectedShape(
                        "multi-element array",
                    ))
                }
            },
            Value::String(_) => return Err(MalformedResponseError::UnexpectedShape("string")),
            Value::Number(_) => return Err(MalformedResponseError::UnexpectedShape("number")),
            Value::Bool(_) => return Err(MalformedResponseError::UnexpectedShape("bool")),
            Value::Null => return Err(MalformedResponseError::UnexpectedShape("null")),
        };

        let score = read_score(object).ok_or(MalformedResponseError::MissingScore)?;
        let raw_items = object
            .get("items")
            .or_else(|| object.get("itemList"))
            .and_then(Value::as_array)
            .ok_or(MalformedResponseError::MissingItems)?;

        let items = raw_items
            .iter()
            .enumerate()
            .map(|(index, item)| read_item(index, item))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            url: url.to_string(),
            score,
            summary: read_str(object, "summary").unwrap_or_default(),
            items,
            cached: object.get("cached").and_then(Value::as_bool).unwrap_or(false),
            snapshot_id: object.get("snapshot_id").and_then(Value::as_i64),
        })
    }

    pub fn tier(&self) -> ScoreTier {
        ScoreTier::from_score(self.score)
    }

    pub fn count(&self, flag: Flag) -> usize {
        self.items.iter().filter(|i| i.flag == flag).count()
    }
}

fn read_str(object: &Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}

fn read_score(object: &Map<String, Value>) -> Option<u8> {
    let raw = match object.get("score")? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !raw.is_finite() {
        return None;
    }
    Some(raw.round().clamp(0.0, 100.0) as u8)
}

fn read_item(index: usize, item: &Value) -> Result<AnalysisItem, MalformedResponseError> {
    let Value::Object(object) = item else {
        return Err(MalformedResponseError::InvalidItem {
            index,
            message: "not an object".into(),
        });
    };
    let title = read_str(object, "title").ok_or_else(|| MalformedResponseError::InvalidItem {
        index,
        message: "missing title".into(),
    })?;
    Ok(AnalysisItem {
        title,
        description: read_str(object, "description").unwrap_or_default(),
        flag: read_str(object, "flag")
            .map(|f| Flag::parse(&f))
            .unwrap_or(Flag::Info),
        category: read_str(object, "category").filter(|c| !c.is_empty()),
    })
}

/// Colour band for a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreTier {
    Good,
    Fair,
    Caution,
    Poor,
}

impl ScoreTier {
    pub fn from_score(score: u8) -> Self {
        match score {
            80.. => Self::Good,
            60..=79 => Self::Fair,
            40..=59 => Self::Caution,
            _ => Self::Poor,
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            Self::Good => "#22c55e",
            Self::Fair => "#84cc16",
            Self::Caution => "#f59e0b",
            Self::Poor => "#ef4444",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Caution => "caution",
            Self::Poor => "poor",
        }
    }
}

impl fmt::Display for ScoreTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// What the badge next to a link should show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BadgeUpdate {
    Score {
        url: String,
        score: u8,
        tier: ScoreTier,
    },
    Unavailable {
        url: String,
    },
}

impl BadgeUpdate {
    pub fn url(&self) -> &str {
        match self {
            Self::Score { url, .. } | Self::Unavailable { url } => url,
        }
    }
}

pub type BadgeCallback = Box<dyn FnMut(&BadgeUpdate) + Send>;

/// Latest analysis per document URL, for one page load.
#[derive(Default)]
pub struct AnalysisCache {
    records: HashMap<String, AnalysisRecord>,
    on_update: Option<BadgeCallback>,
}

impl fmt::Debug for AnalysisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisCache")
            .field("records", &self.records.len())
            .finish()
    }
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(on_update: BadgeCallback) -> Self {
        Self {
            records: HashMap::new(),
            on_update: Some(on_update),
        }
    }

    /// Store `record` for `url`, replacing any previous one, and fire the
    /// badge callback.
    pub fn put(&mut self, url: &str, mut record: AnalysisRecord) {
        record.url = url.to_string();
        let update = BadgeUpdate::Score {
            url: url.to_string(),
            score: record.score,
            tier: record.tier(),
        };
        self.records.insert(url.to_string(), record);
        self.notify(&update);
    }

    /// Normalize a raw service payload and store it. A malformed payload
    /// leaves any earlier record in place and marks the badge unavailable.
    pub fn put_response(
        &mut self,
        url: &str,
        payload: &Value,
    ) -> Result<&AnalysisRecord, MalformedResponseError> {
        match AnalysisRecord::from_response(url, payload) {
            Ok(record) => {
                self.put(url, record);
                self.records
                    .get(url)
                    .ok_or(MalformedResponseError::UnexpectedShape("missing after insert"))
            }
            Err(e) => {
                warn!(url, "unable to display analysis: {}", e);
                self.notify(&BadgeUpdate::Unavailable {
                    url: url.to_string(),
                });
                Err(e)
            }
        }
    }

    pub fn get(&self, url: &str) -> Option<&AnalysisRecord> {
        self.records.get(url)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &AnalysisRecord> {
        self.records.values()
    }

    fn notify(&mut self, update: &BadgeUpdate) {
        if let Some(callback) = self.on_update.as_mut() {
            callback(update);
        }
    }
}
