use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::interval;
use tracing::debug;

use super::queue::{Search, SearchQueue};
use crate::services::{PartialQuery, SearchSink};
use crate::settings::SearchSettings;

/// Pumps the shared [`SearchQueue`] into the outbound sink.
///
/// Manual searches, alternate-source searches and the queue's
/// auto-searches all go through one instance so the global spacing holds
/// across producers.
pub struct SearchManager {
    queue: Mutex<SearchQueue>,
    sink: Arc<dyn SearchSink>,
}

impl SearchManager {
    pub fn new(settings: SearchSettings, sink: Arc<dyn SearchSink>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(SearchQueue::new(settings.min_interval)),
            sink,
        })
    }

    /// Spawns the once-a-second send loop.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                manager.on_second(Instant::now());
            }
        });
    }

    /// Queues a search; returns the estimated wait before it is sent.
    pub fn add(&self, search: Search) -> Duration {
        let wait = self.queue.lock().add(search, Instant::now());
        debug!(wait_secs = wait.as_secs(), "search queued");
        wait
    }

    pub fn cancel(&self, owner: &str) -> usize {
        self.queue.lock().cancel(owner)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn next_search_in(&self) -> Option<Duration> {
        self.queue.lock().next_search_in(Instant::now())
    }

    pub fn send_partial_query(&self, query: &PartialQuery) {
        self.sink.send_partial_query(query);
    }

    /// Sends the head of the queue if its interval has elapsed.
    pub fn on_second(&self, now: Instant) -> Option<Search> {
        let search = self.queue.lock().pop(now)?;
        debug!(%search, "sending search");
        self.sink.send_search(&search);
        Some(search)
    }
}
