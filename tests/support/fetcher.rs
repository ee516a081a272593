use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use ugc_cache::download::{FetchedResource, ResourceFetcher};

/// Serves fixed bodies from memory and records how it was called.
#[derive(Default)]
pub struct MemoryFetcher {
    resources: HashMap<String, Vec<u8>>,
    hide_length: bool,
    delay: Duration,
    fetches: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.resources.insert(url.to_string(), body.into());
        self
    }

    /// Responses carry no content length, like a chunked HTTP body.
    pub fn without_length(mut self) -> Self {
        self.hide_length = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceFetcher for MemoryFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedResource> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let body = self
            .resources
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("404 Not Found: {url}"))?;
        Ok(FetchedResource {
            content_length: (!self.hide_length).then_some(body.len() as u64),
            body: Box::pin(Cursor::new(body)),
        })
    }
}
