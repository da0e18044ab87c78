//! In-memory transport for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::FetchError;
use crate::fetch::Transport;

#[derive(Clone)]
enum Reply {
    Body(String, Duration),
    Status(u16),
}

#[derive(Default)]
pub struct FakeTransport {
    pages: Mutex<HashMap<String, Reply>>,
    webhooks: Mutex<HashMap<String, Reply>>,
    gets: Mutex<Vec<(String, Instant)>>,
    posts: Mutex<Vec<(String, serde_json::Value)>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(&self, url: &str, html: &str) {
        self.slow_page(url, html, Duration::ZERO);
    }

    pub fn slow_page(&self, url: &str, html: &str, delay: Duration) {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), Reply::Body(html.to_string(), delay));
    }

    pub fn status(&self, url: &str, status: u16) {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), Reply::Status(status));
    }

    pub fn webhook(&self, url: &str, body: &str) {
        self.webhooks
            .lock()
            .unwrap()
            .insert(url.to_string(), Reply::Body(body.to_string(), Duration::ZERO));
    }

    pub fn webhook_status(&self, url: &str, status: u16) {
        self.webhooks
            .lock()
            .unwrap()
            .insert(url.to_string(), Reply::Status(status));
    }

    pub fn gets(&self) -> Vec<String> {
        self.gets.lock().unwrap().iter().map(|(u, _)| u.clone()).collect()
    }

    pub fn get_times(&self) -> Vec<Instant> {
        self.gets.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    pub fn posts(&self) -> Vec<(String, serde_json::Value)> {
        self.posts.lock().unwrap().clone()
    }

    async fn reply(url: &str, reply: Option<Reply>) -> Result<String, FetchError> {
        match reply {
            Some(Reply::Body(body, delay)) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(body)
            }
            Some(Reply::Status(status)) => Err(FetchError::Status {
                url: url.to_string(),
                status,
            }),
            None => Err(FetchError::network(url, "connection refused")),
        }
    }
}

impl Transport for FakeTransport {
    async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        self.gets
            .lock()
            .unwrap()
            .push((url.to_string(), Instant::now()));
        let reply = self.pages.lock().unwrap().get(url).cloned();
        Self::reply(url, reply).await
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<String, FetchError> {
        self.posts
            .lock()
            .unwrap()
            .push((url.to_string(), body.clone()));
        let reply = self.webhooks.lock().unwrap().get(url).cloned();
        Self::reply(url, reply).await
    }
}
