//! Local persistent store provider
//!
//! `StoreProvider` adapts any [`LocalStore`] engine to `EventProvider`.
//! The storage engine itself is a capability: `MemoryStore` is the bundled
//! in-process engine, used for tests and single-process deployments.

use super::{EventProvider, StreamHandler, Subscription, TaskSubscription};
use crate::error::{GatewayError, Result};
use crate::types::{
    matches_any, Capabilities, Capability, Event, Filter, ReplaceableKey,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, RwLock};

/// Capacity of the live-delivery broadcast channel
const LIVE_CHANNEL_CAPACITY: usize = 1024;

/// Storage engine capability behind [`StoreProvider`]
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Open the underlying storage
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    /// Release the underlying storage
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Fetch an event by id
    async fn get(&self, id: &str) -> Result<Option<Event>>;

    /// Persist events, returning those that were not already stored
    async fn put(&self, events: &[Event]) -> Result<Vec<Event>>;

    /// Visible events matching any filter, newest first
    async fn query_by_filter(&self, filters: &[Filter]) -> Result<Vec<Event>>;

    /// Current event for each replaceable address that has one
    async fn query_by_address(&self, keys: &[ReplaceableKey]) -> Result<Vec<Event>>;

    /// Number of distinct visible events matching any filter
    async fn count(&self, filters: &[Filter]) -> Result<u64>;

    /// Whether the engine honors `Filter::search`
    fn supports_search(&self) -> bool {
        false
    }
}

#[derive(Default)]
struct MemoryStoreState {
    events: HashMap<String, Event>,
    /// replaceable address → id of its newest event
    latest: HashMap<ReplaceableKey, String>,
}

impl MemoryStoreState {
    /// Superseded replaceable events stay stored but are shadowed here
    fn is_visible(&self, event: &Event) -> bool {
        match event.replaceable_key() {
            Some(key) => self.latest.get(&key) == Some(&event.id),
            None => true,
        }
    }

    fn matching(&self, filters: &[Filter]) -> Vec<Event> {
        let mut selected: HashMap<&str, &Event> = HashMap::new();
        for filter in filters {
            let mut hits: Vec<&Event> = self
                .events
                .values()
                .filter(|e| filter.matches(e) && self.is_visible(e))
                .collect();
            hits.sort_by(|a, b| newest_first(a, b));
            if let Some(limit) = filter.limit {
                hits.truncate(limit);
            }
            for event in hits {
                selected.insert(event.id.as_str(), event);
            }
        }
        let mut result: Vec<Event> = selected.into_values().cloned().collect();
        result.sort_by(newest_first);
        result
    }
}

fn newest_first(a: &Event, b: &Event) -> std::cmp::Ordering {
    b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id))
}

/// In-memory storage engine
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryStoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total stored events, including shadowed ones
    pub async fn len(&self) -> usize {
        self.state.read().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Event>> {
        Ok(self.state.read().await.events.get(id).cloned())
    }

    async fn put(&self, events: &[Event]) -> Result<Vec<Event>> {
        let mut state = self.state.write().await;
        let mut inserted = Vec::new();

        for event in events {
            if state.events.contains_key(&event.id) {
                continue;
            }
            if let Some(key) = event.replaceable_key() {
                let replace = match state.latest.get(&key).and_then(|id| state.events.get(id)) {
                    Some(current) => event.supersedes(current),
                    None => true,
                };
                if replace {
                    state.latest.insert(key, event.id.clone());
                }
            }
            state.events.insert(event.id.clone(), event.clone());
            inserted.push(event.clone());
        }

        Ok(inserted)
    }

    async fn query_by_filter(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        Ok(self.state.read().await.matching(filters))
    }

    async fn query_by_address(&self, keys: &[ReplaceableKey]) -> Result<Vec<Event>> {
        let state = self.state.read().await;
        Ok(keys
            .iter()
            .filter_map(|key| state.latest.get(key))
            .filter_map(|id| state.events.get(id))
            .cloned()
            .collect())
    }

    async fn count(&self, filters: &[Filter]) -> Result<u64> {
        Ok(self.state.read().await.matching(filters).len() as u64)
    }

    fn supports_search(&self) -> bool {
        true
    }
}

/// `EventProvider` over a local storage engine
///
/// Events added through this provider are also pushed to its live
/// subscriptions, so it advertises `live-subscribe`. The live channel exists
/// only while connected; closing the provider ends every live subscription
/// with an error.
pub struct StoreProvider {
    name: String,
    store: Arc<dyn LocalStore>,
    connected: AtomicBool,
    live: Mutex<Option<broadcast::Sender<Event>>>,
}

impl StoreProvider {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self::with_name("store", store)
    }

    pub fn with_name(name: impl Into<String>, store: Arc<dyn LocalStore>) -> Self {
        Self {
            name: name.into(),
            store,
            connected: AtomicBool::new(false),
            live: Mutex::new(None),
        }
    }

    /// Provider over a fresh `MemoryStore`
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    fn live_sender(&self) -> Option<broadcast::Sender<Event>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(GatewayError::Connection(format!(
                "{} provider is not connected",
                self.name
            )))
        }
    }

    fn spawn_delivery(
        &self,
        filters: &[Filter],
        handler: Arc<dyn StreamHandler>,
        live: bool,
    ) -> Result<TaskSubscription> {
        let store = self.store.clone();
        let filters = filters.to_vec();
        // Subscribe before querying so nothing added in between is missed
        let mut rx = if live {
            let sender = self.live_sender().ok_or_else(|| {
                GatewayError::Connection(format!("{} provider is not connected", self.name))
            })?;
            Some(sender.subscribe())
        } else {
            None
        };

        Ok(TaskSubscription::spawn(move |closed| async move {
            let stored = match store.query_by_filter(&filters).await {
                Ok(events) => events,
                Err(e) => {
                    if !closed.load(Ordering::SeqCst) {
                        handler.on_error(e.to_string());
                    }
                    return;
                }
            };

            let mut seen = HashSet::new();
            for event in stored {
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                seen.insert(event.id.clone());
                handler.on_event(event);
            }

            let Some(rx) = rx.as_mut() else {
                if !closed.load(Ordering::SeqCst) {
                    handler.on_done();
                }
                return;
            };

            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if closed.load(Ordering::SeqCst) {
                            return;
                        }
                        if matches_any(&filters, &event) && seen.insert(event.id.clone()) {
                            handler.on_event(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Live subscription lagged behind store");
                        if !closed.load(Ordering::SeqCst) {
                            handler.on_error(format!(
                                "live subscription lagged, {} events skipped",
                                skipped
                            ));
                        }
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        if !closed.load(Ordering::SeqCst) {
                            handler.on_error("store provider closed".to_string());
                        }
                        return;
                    }
                }
            }
        }))
    }
}

#[async_trait]
impl EventProvider for StoreProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.store
            .open()
            .await
            .map_err(|e| GatewayError::Connection(format!("{}: {}", self.name, e)))?;
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        *self.live.lock().unwrap_or_else(|e| e.into_inner()) = Some(live);
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(provider = %self.name, "Local store opened");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            // Dropping the sender ends live subscriptions with `Closed`
            self.live.lock().unwrap_or_else(|e| e.into_inner()).take();
            self.store.close().await?;
            tracing::debug!(provider = %self.name, "Local store closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn add(&self, event: &Event) -> Result<bool> {
        self.ensure_connected()?;
        if !event.verify_id() {
            tracing::debug!(event_id = %event.id, "Rejected event with mismatched id");
            return Ok(false);
        }

        let inserted = self.store.put(std::slice::from_ref(event)).await?;
        if let Some(live) = self.live_sender() {
            for event in inserted {
                // No receivers is fine
                let _ = live.send(event);
            }
        }
        Ok(true)
    }

    async fn event(&self, id: &str) -> Result<Option<Event>> {
        self.ensure_connected()?;
        self.store.get(id).await
    }

    async fn replaceable(
        &self,
        kind: u32,
        author: &str,
        identifier: Option<&str>,
    ) -> Result<Option<Event>> {
        self.ensure_connected()?;
        let key = ReplaceableKey::new(kind, author, identifier.map(str::to_string));
        let found = self.store.query_by_address(std::slice::from_ref(&key)).await?;
        Ok(found.into_iter().next())
    }

    async fn count(&self, filters: &[Filter]) -> Result<u64> {
        self.ensure_connected()?;
        self.store.count(filters).await
    }

    async fn filters(
        &self,
        filters: &[Filter],
        handler: Arc<dyn StreamHandler>,
    ) -> Result<Box<dyn Subscription>> {
        self.ensure_connected()?;
        Ok(Box::new(self.spawn_delivery(filters, handler, false)?))
    }

    async fn subscribe(
        &self,
        filters: &[Filter],
        handler: Arc<dyn StreamHandler>,
    ) -> Result<Box<dyn Subscription>> {
        self.ensure_connected()?;
        Ok(Box::new(self.spawn_delivery(filters, handler, true)?))
    }

    fn supports(&self) -> Capabilities {
        let mut caps = Capabilities::new();
        caps.insert(Capability::LiveSubscribe);
        if self.store.supports_search() {
            caps.insert(Capability::Search);
        }
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::{Delivery, RecordingHandler};
    use crate::types::EventBuilder;
    use std::time::Duration;

    async fn connected() -> StoreProvider {
        let provider = StoreProvider::memory();
        provider.connect().await.unwrap();
        provider
    }

    fn note(content: &str, created_at: u64) -> Event {
        EventBuilder::new(1, "alice", content)
            .created_at(created_at)
            .build()
    }

    #[tokio::test]
    async fn test_add_then_get() {
        let provider = connected().await;
        let event = note("hello", 10);

        assert!(provider.add(&event).await.unwrap());
        assert_eq!(provider.event(&event.id).await.unwrap(), Some(event.clone()));
        assert_eq!(provider.event("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_add_is_noop_success() {
        let provider = connected().await;
        let event = note("hello", 10);

        assert!(provider.add(&event).await.unwrap());
        assert!(provider.add(&event).await.unwrap());
        assert_eq!(provider.count(&[Filter::new()]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_add_rejects_mismatched_id() {
        let provider = connected().await;
        let mut event = note("hello", 10);
        event.content = "tampered".to_string();
        assert!(!provider.add(&event).await.unwrap());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let provider = StoreProvider::memory();
        let err = provider.event("x").await.unwrap_err();
        assert!(matches!(err, GatewayError::Connection(_)));

        provider.connect().await.unwrap();
        provider.connect().await.unwrap();
        assert!(provider.is_connected());
        provider.close().await.unwrap();
        provider.close().await.unwrap();
        assert!(!provider.is_connected());
    }

    #[tokio::test]
    async fn test_replaceable_returns_newest_in_any_order() {
        let provider = connected().await;
        let mid = EventBuilder::new(0, "alice", "v2").created_at(20).build();
        let old = EventBuilder::new(0, "alice", "v1").created_at(10).build();
        let new = EventBuilder::new(0, "alice", "v3").created_at(30).build();

        provider.add(&mid).await.unwrap();
        provider.add(&old).await.unwrap();
        assert_eq!(provider.replaceable(0, "alice", None).await.unwrap(), Some(mid));

        provider.add(&new).await.unwrap();
        assert_eq!(
            provider.replaceable(0, "alice", None).await.unwrap(),
            Some(new.clone())
        );

        // Older versions are retained but shadowed from queries
        assert_eq!(provider.event(&old.id).await.unwrap(), Some(old));
        assert_eq!(provider.count(&[Filter::new().kind(0)]).await.unwrap(), 1);
        assert_eq!(provider.replaceable(0, "bob", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_addressable_keyed_by_identifier() {
        let provider = connected().await;
        let a = EventBuilder::new(30023, "alice", "a")
            .tag(["d", "first"])
            .created_at(10)
            .build();
        let b = EventBuilder::new(30023, "alice", "b")
            .tag(["d", "second"])
            .created_at(20)
            .build();
        provider.add(&a).await.unwrap();
        provider.add(&b).await.unwrap();

        assert_eq!(
            provider.replaceable(30023, "alice", Some("first")).await.unwrap(),
            Some(a)
        );
        assert_eq!(
            provider.replaceable(30023, "alice", Some("second")).await.unwrap(),
            Some(b)
        );
    }

    #[tokio::test]
    async fn test_addressable_without_identifier_uses_empty_key() {
        let provider = connected().await;
        let untagged = EventBuilder::new(30023, "alice", "no d tag")
            .created_at(10)
            .build();
        let tagged = EventBuilder::new(30023, "alice", "tagged")
            .tag(["d", "intro"])
            .created_at(20)
            .build();
        provider.add(&untagged).await.unwrap();
        provider.add(&tagged).await.unwrap();

        assert_eq!(
            provider.replaceable(30023, "alice", None).await.unwrap(),
            Some(untagged.clone())
        );
        assert_eq!(
            provider.replaceable(30023, "alice", Some("")).await.unwrap(),
            Some(untagged)
        );
    }

    #[tokio::test]
    async fn test_count_matches_filters_stream() {
        let provider = connected().await;
        for i in 0..5 {
            provider.add(&note(&format!("n{}", i), i)).await.unwrap();
        }
        provider
            .add(&EventBuilder::new(7, "bob", "r").created_at(3).build())
            .await
            .unwrap();

        let filters = vec![Filter::new().kind(1).limit(3), Filter::new().author("bob")];
        let count = provider.count(&filters).await.unwrap();

        let handler = Arc::new(RecordingHandler::default());
        let _sub = provider.filters(&filters, handler.clone()).await.unwrap();
        handler.wait_for(count as usize + 1).await;

        let ids: HashSet<String> = handler.events().into_iter().map(|e| e.id).collect();
        assert_eq!(ids.len() as u64, count);
        assert_eq!(count, 4);
        assert_eq!(handler.terminal(), Some(Delivery::Done));
    }

    #[tokio::test]
    async fn test_subscribe_delivers_live_events_until_closed() {
        let provider = connected().await;
        let e1 = note("stored", 1);
        provider.add(&e1).await.unwrap();

        let handler = Arc::new(RecordingHandler::default());
        let sub = provider
            .subscribe(&[Filter::new().kind(1)], handler.clone())
            .await
            .unwrap();
        handler.wait_for(1).await;

        let e2 = note("live", 2);
        provider.add(&e2).await.unwrap();
        provider
            .add(&EventBuilder::new(9, "alice", "other kind").build())
            .await
            .unwrap();
        handler.wait_for(2).await;

        sub.close().await;
        provider.add(&note("after close", 3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(handler.events(), vec![e1, e2]);
        assert_eq!(handler.terminal(), None);
    }

    #[tokio::test]
    async fn test_close_ends_live_subscriptions_with_error() {
        let provider = connected().await;
        let handler = Arc::new(RecordingHandler::default());
        let _sub = provider
            .subscribe(&[Filter::new().kind(1)], handler.clone())
            .await
            .unwrap();

        provider.close().await.unwrap();
        handler.wait_for(1).await;
        assert!(matches!(handler.terminal(), Some(Delivery::Error(_))));

        let err = provider
            .subscribe(&[Filter::new()], Arc::new(RecordingHandler::default()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::Connection(_)));
    }

    #[tokio::test]
    async fn test_reconnect_restores_live_delivery() {
        let provider = connected().await;
        provider.close().await.unwrap();
        provider.connect().await.unwrap();

        let handler = Arc::new(RecordingHandler::default());
        let _sub = provider
            .subscribe(&[Filter::new().kind(1)], handler.clone())
            .await
            .unwrap();
        let event = note("after reconnect", 5);
        provider.add(&event).await.unwrap();
        handler.wait_for(1).await;
        assert_eq!(handler.events(), vec![event]);
    }

    #[tokio::test]
    async fn test_supports_advertises_capabilities() {
        let provider = StoreProvider::memory();
        let caps = provider.supports();
        assert!(caps.contains(&Capability::LiveSubscribe));
        assert!(caps.contains(&Capability::Search));
    }
}
