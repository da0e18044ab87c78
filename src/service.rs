use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{FetchError, MalformedResponseError, ScanResult};
use crate::fetch::{ScrapeResult, Transport};

/// Body posted to the analysis workflow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRequest<'a> {
    pub url: &'a str,
    pub terms_data: &'a str,
    #[serde(rename = "fetchedAt")]
    pub fetched_at: String,
}

impl<'a> AnalysisRequest<'a> {
    pub fn from_scrape(result: &'a ScrapeResult) -> Self {
        Self {
            url: &result.url,
            terms_data: &result.extracted_text,
            fetched_at: result.fetched_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatAnswer {
    pub answer: String,
    #[serde(default)]
    pub snapshot_id: Option<i64>,
}

/// Turn a response body into a JSON value. Bodies that are not JSON are
/// kept as a JSON string so the receiver can report them as malformed.
pub fn parse_body(body: &str) -> Value {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| {
        debug!("response is plain text");
        Value::String(trimmed.to_string())
    })
}

/// Client for the three outbound webhooks.
pub struct AnalysisClient<T> {
    transport: Arc<T>,
}

impl<T> Clone for AnalysisClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<T: Transport> AnalysisClient<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    /// POST the extracted text to the analysis workflow and return the raw
    /// payload, which may be either accepted shape or something malformed.
    pub async fn analyze(&self, endpoint: &str, result: &ScrapeResult) -> Result<Value, FetchError> {
        let body = serde_json::to_value(AnalysisRequest::from_scrape(result))
            .map_err(|e| FetchError::network(endpoint, e))?;
        info!(url = %result.url, chars = result.extracted_text.len(), "sending to analysis webhook");
        let text = self.transport.post_json(endpoint, &body).await?;
        debug!(url = %result.url, bytes = text.len(), "analysis response");
        Ok(parse_body(&text))
    }

    pub async fn chat(&self, endpoint: &str, snapshot_id: i64, question: &str) -> ScanResult<ChatAnswer> {
        let body = json!({ "snapshot_id": snapshot_id, "question": question });
        let text = self.transport.post_json(endpoint, &body).await?;
        let answer = serde_json::from_str::<ChatAnswer>(text.trim()).map_err(|e| {
            warn!(snapshot_id, "chat response unreadable: {}", e);
            MalformedResponseError::NotJson(text.chars().take(80).collect())
        })?;
        Ok(answer)
    }

    /// Returns the service's confirmation message, if it sent one.
    pub async fn save_report(
        &self,
        endpoint: &str,
        user_id: &str,
        snapshot_id: i64,
    ) -> Result<Option<String>, FetchError> {
        let body = json!({ "user_id": user_id, "snapshot_id": snapshot_id });
        let text = self.transport.post_json(endpoint, &body).await?;
        let message = match parse_body(&text) {
            Value::Object(map) => map.get("message").and_then(Value::as_str).map(str::to_string),
            _ => None,
        };
        info!(snapshot_id, "report saved");
        Ok(message)
    }
}
