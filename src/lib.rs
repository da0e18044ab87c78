//! Finds links to legal documents on a page, fetches and reduces them to
//! text, sends the text off for analysis and routes scores back to the page.

pub mod agent;
pub mod cache;
pub mod classify;
pub mod config;
pub mod db;
pub mod dom;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod page;
pub mod relay;
pub mod scanner;
pub mod service;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ScanError, ScanResult};

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::agent::Agent;
    use crate::cache::BadgeUpdate;
    use crate::classify::DocumentType;
    use crate::config::{PipelineConfig, Settings};
    use crate::page::Page;
    use crate::relay::{ContextId, Relay};
    use crate::testing::FakeTransport;
    use crate::worker::Worker;

    const HOOK: &str = "http://localhost:5678/webhook-test/compliance-analyzer";

    #[tokio::test(start_paused = true)]
    async fn privacy_link_is_scored_end_to_end() {
        let transport = Arc::new(FakeTransport::new());
        transport.page(
            "https://example.com/privacy",
            "<html><body><script>x</script><p>We collect data.</p></body></html>",
        );
        transport.webhook(
            HOOK,
            r#"{"score":72,"summary":"ok","items":[{"title":"Data","description":"...","flag":"warning","category":"privacy"}]}"#,
        );

        let relay = Relay::new();
        let config = PipelineConfig::default();
        let worker = Worker::new(
            relay.clone(),
            Settings::in_memory().unwrap(),
            Arc::clone(&transport),
            config,
        )
        .unwrap();
        let worker = tokio::spawn(worker.run());
        let page = tokio::spawn(Page::new(1, relay.clone()).run());

        let badges = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&badges);
        let mut agent = Agent::new(
            1,
            "https://example.com/",
            r#"<html><body><a href="/privacy">Privacy Policy</a></body></html>"#,
            relay.clone(),
            &config,
            Some(Box::new(move |u: &BadgeUpdate| sink.lock().unwrap().push(u.clone()))),
        )
        .unwrap();

        let found = agent.start();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].document_type, DocumentType::Privacy);
        let agent = tokio::spawn(agent.run());

        // Shut down in pipeline order so every buffered message is handled.
        relay.unregister(ContextId::Worker);
        worker.await.unwrap();
        relay.unregister(ContextId::Agent(1));
        let agent = agent.await.unwrap();
        relay.close_tab(1);
        let page = page.await.unwrap();

        let url = "https://example.com/privacy";
        assert_eq!(agent.cache().get(url).unwrap().score, 72);
        assert!(matches!(
            badges.lock().unwrap().as_slice(),
            [BadgeUpdate::Score { score: 72, .. }]
        ));
        assert_eq!(page.get_state().content[url].content, "We collect data.");
        assert_eq!(page.list_candidates().len(), 1);
    }
}
