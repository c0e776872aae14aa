//! Network relay provider
//!
//! `RelayProvider` adapts a [`RelayClient`] (the relay's wire protocol is
//! an external collaborator) to `EventProvider`. One-shot operations are
//! derived by draining a request until the relay signals end-of-stored.

use super::{EventProvider, StreamHandler, Subscription, TaskSubscription};
use crate::error::{GatewayError, Result};
use crate::types::{Capabilities, Capability, Event, Filter, ReplaceableKey};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};

/// NIP number relays advertise for full-text search
const SEARCH_NIP: u32 = 50;

/// One message of a relay request stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// A matching event
    Event(Event),
    /// All stored matches were sent; later events are live
    EndOfStored,
    /// The relay closed the request
    Closed(String),
}

/// Stream of relay messages for one request
pub type RelayStream = BoxStream<'static, RelayMessage>;

/// Relay information document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInfo {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub supported_nips: Vec<u32>,
}

/// Wire-level relay capability behind [`RelayProvider`]
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Open the connection
    async fn connect(&self) -> Result<()>;

    /// Close the connection. Idempotent.
    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Publish an event, returning the relay's OK flag
    async fn publish(&self, event: &Event) -> Result<bool>;

    /// Start a request; dropping the stream cancels it
    async fn request(&self, filters: &[Filter]) -> Result<RelayStream>;

    /// Fetch the relay information document
    async fn fetch_info(&self) -> Result<RelayInfo>;
}

/// `EventProvider` over a network relay
pub struct RelayProvider {
    name: String,
    client: Arc<dyn RelayClient>,
    info: RwLock<Option<RelayInfo>>,
}

impl RelayProvider {
    pub fn new(client: Arc<dyn RelayClient>) -> Self {
        Self::with_name("relay", client)
    }

    pub fn with_name(name: impl Into<String>, client: Arc<dyn RelayClient>) -> Self {
        Self {
            name: name.into(),
            client,
            info: RwLock::new(None),
        }
    }

    /// Relay information cached at connect time
    pub fn info(&self) -> Option<RelayInfo> {
        self.info.read().ok().and_then(|info| info.clone())
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.client.is_connected() {
            Ok(())
        } else {
            Err(GatewayError::Connection(format!(
                "{} provider is not connected",
                self.name
            )))
        }
    }

    /// Collect every stored match, deduplicated by id
    async fn stored(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        self.ensure_connected()?;
        let mut stream = self.client.request(filters).await?;
        let mut seen = HashSet::new();
        let mut events = Vec::new();

        while let Some(message) = stream.next().await {
            match message {
                RelayMessage::Event(event) => {
                    if seen.insert(event.id.clone()) {
                        events.push(event);
                    }
                }
                RelayMessage::EndOfStored => break,
                RelayMessage::Closed(reason) => {
                    return Err(GatewayError::Operation(format!(
                        "{} closed request: {}",
                        self.name, reason
                    )));
                }
            }
        }

        Ok(events)
    }

    async fn spawn_delivery(
        &self,
        filters: &[Filter],
        handler: Arc<dyn StreamHandler>,
        live: bool,
    ) -> Result<Box<dyn Subscription>> {
        self.ensure_connected()?;
        let mut stream = self.client.request(filters).await?;
        let name = self.name.clone();

        let sub = TaskSubscription::spawn(move |closed| async move {
            let mut seen = HashSet::new();
            while let Some(message) = stream.next().await {
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                match message {
                    RelayMessage::Event(event) => {
                        if seen.insert(event.id.clone()) {
                            handler.on_event(event);
                        }
                    }
                    RelayMessage::EndOfStored if live => {
                        tracing::debug!(provider = %name, "Stored events delivered, now live");
                    }
                    RelayMessage::EndOfStored => {
                        handler.on_done();
                        return;
                    }
                    RelayMessage::Closed(reason) => {
                        handler.on_error(format!("{} closed request: {}", name, reason));
                        return;
                    }
                }
            }

            if closed.load(Ordering::SeqCst) {
                return;
            }
            if live {
                handler.on_error(format!("{} connection lost", name));
            } else {
                handler.on_done();
            }
        });

        Ok(Box::new(sub))
    }
}

#[async_trait]
impl EventProvider for RelayProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        if self.client.is_connected() {
            return Ok(());
        }
        if let Ok(mut cached) = self.info.write() {
            cached.take();
        }
        self.client
            .connect()
            .await
            .map_err(|e| GatewayError::Connection(format!("{}: {}", self.name, e)))?;

        match self.client.fetch_info().await {
            Ok(info) => {
                tracing::info!(
                    provider = %self.name,
                    relay = ?info.name,
                    nips = ?info.supported_nips,
                    "Connected to relay"
                );
                if let Ok(mut cached) = self.info.write() {
                    *cached = Some(info);
                }
            }
            Err(e) => {
                tracing::warn!(provider = %self.name, error = %e, "Relay info unavailable");
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Ok(mut cached) = self.info.write() {
            cached.take();
        }
        self.client.close().await
    }

    fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    async fn add(&self, event: &Event) -> Result<bool> {
        self.ensure_connected()?;
        let ok = self.client.publish(event).await?;
        tracing::debug!(provider = %self.name, event_id = %event.id, ok, "Event published");
        Ok(ok)
    }

    async fn event(&self, id: &str) -> Result<Option<Event>> {
        let events = self.stored(&[Filter::new().id(id).limit(1)]).await?;
        Ok(events.into_iter().find(|e| e.id == id))
    }

    async fn replaceable(
        &self,
        kind: u32,
        author: &str,
        identifier: Option<&str>,
    ) -> Result<Option<Event>> {
        let key = ReplaceableKey::new(kind, author, identifier.map(str::to_string));
        let events = self.stored(&[key.to_filter()]).await?;

        Ok(events
            .into_iter()
            .filter(|e| key.matches(e))
            .reduce(|best, e| if e.supersedes(&best) { e } else { best }))
    }

    async fn count(&self, filters: &[Filter]) -> Result<u64> {
        Ok(self.stored(filters).await?.len() as u64)
    }

    async fn filters(
        &self,
        filters: &[Filter],
        handler: Arc<dyn StreamHandler>,
    ) -> Result<Box<dyn Subscription>> {
        self.spawn_delivery(filters, handler, false).await
    }

    async fn subscribe(
        &self,
        filters: &[Filter],
        handler: Arc<dyn StreamHandler>,
    ) -> Result<Box<dyn Subscription>> {
        self.spawn_delivery(filters, handler, true).await
    }

    fn supports(&self) -> Capabilities {
        let mut caps = Capabilities::new();
        caps.insert(Capability::LiveSubscribe);
        if self
            .info()
            .is_some_and(|info| info.supported_nips.contains(&SEARCH_NIP))
        {
            caps.insert(Capability::Search);
        }
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::{Delivery, RecordingHandler};
    use crate::types::{matches_any, EventBuilder};
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    /// In-process relay: answers requests from a Vec, then stays open for
    /// live pushes via `push()`
    #[derive(Default)]
    struct FakeRelay {
        connected: AtomicBool,
        refuse: bool,
        nips: Vec<u32>,
        events: Mutex<Vec<Event>>,
        live: Mutex<Vec<(Vec<Filter>, mpsc::UnboundedSender<RelayMessage>)>>,
    }

    impl FakeRelay {
        fn push(&self, event: Event) {
            self.events.lock().unwrap().push(event.clone());
            for (filters, tx) in self.live.lock().unwrap().iter() {
                if matches_any(filters, &event) {
                    let _ = tx.send(RelayMessage::Event(event.clone()));
                }
            }
        }

        fn drop_connections(&self) {
            self.live.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl RelayClient for FakeRelay {
        async fn connect(&self) -> Result<()> {
            if self.refuse {
                return Err(GatewayError::Connection("refused".to_string()));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn publish(&self, event: &Event) -> Result<bool> {
            self.push(event.clone());
            Ok(true)
        }

        async fn request(&self, filters: &[Filter]) -> Result<RelayStream> {
            let (tx, rx) = mpsc::unbounded_channel();
            for event in self.events.lock().unwrap().iter() {
                if matches_any(filters, event) {
                    let _ = tx.send(RelayMessage::Event(event.clone()));
                }
            }
            let _ = tx.send(RelayMessage::EndOfStored);
            self.live.lock().unwrap().push((filters.to_vec(), tx));
            Ok(UnboundedReceiverStream::new(rx).boxed())
        }

        async fn fetch_info(&self) -> Result<RelayInfo> {
            Ok(RelayInfo {
                name: Some("fake".to_string()),
                supported_nips: self.nips.clone(),
            })
        }
    }

    async fn connected(relay: Arc<FakeRelay>) -> RelayProvider {
        let provider = RelayProvider::new(relay);
        provider.connect().await.unwrap();
        provider
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_error() {
        let relay = Arc::new(FakeRelay {
            refuse: true,
            ..Default::default()
        });
        let provider = RelayProvider::new(relay);
        let err = provider.connect().await.unwrap_err();
        assert!(matches!(err, GatewayError::Connection(_)));
        assert!(!provider.is_connected());
    }

    #[tokio::test]
    async fn test_add_event_and_lookup() {
        let provider = connected(Arc::new(FakeRelay::default())).await;
        let event = EventBuilder::new(1, "alice", "hi").created_at(5).build();

        assert!(provider.add(&event).await.unwrap());
        assert_eq!(provider.event(&event.id).await.unwrap(), Some(event));
        assert_eq!(provider.event("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_replaceable_picks_newest() {
        let relay = Arc::new(FakeRelay::default());
        let provider = connected(relay.clone()).await;
        let v1 = EventBuilder::new(3, "alice", "v1").created_at(10).build();
        let v3 = EventBuilder::new(3, "alice", "v3").created_at(30).build();
        let v2 = EventBuilder::new(3, "alice", "v2").created_at(20).build();
        relay.push(v1);
        relay.push(v3.clone());
        relay.push(v2);

        assert_eq!(provider.replaceable(3, "alice", None).await.unwrap(), Some(v3));
    }

    #[tokio::test]
    async fn test_addressable_without_identifier_ignores_tagged_versions() {
        let relay = Arc::new(FakeRelay::default());
        let provider = connected(relay.clone()).await;
        let untagged = EventBuilder::new(30023, "alice", "no d tag")
            .created_at(10)
            .build();
        let tagged = EventBuilder::new(30023, "alice", "tagged")
            .tag(["d", "intro"])
            .created_at(20)
            .build();
        relay.push(untagged.clone());
        relay.push(tagged.clone());

        assert_eq!(
            provider.replaceable(30023, "alice", None).await.unwrap(),
            Some(untagged.clone())
        );
        assert_eq!(
            provider.replaceable(30023, "alice", Some("")).await.unwrap(),
            Some(untagged)
        );
        assert_eq!(
            provider.replaceable(30023, "alice", Some("intro")).await.unwrap(),
            Some(tagged)
        );
    }

    #[tokio::test]
    async fn test_count_deduplicates() {
        let relay = Arc::new(FakeRelay::default());
        let provider = connected(relay.clone()).await;
        relay.push(EventBuilder::new(1, "alice", "a").created_at(1).build());
        relay.push(EventBuilder::new(1, "bob", "b").created_at(2).build());

        // Both filters match alice's event
        let filters = [Filter::new().kind(1), Filter::new().author("alice")];
        assert_eq!(provider.count(&filters).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_filters_completes_after_stored() {
        let relay = Arc::new(FakeRelay::default());
        let provider = connected(relay.clone()).await;
        let event = EventBuilder::new(1, "alice", "a").created_at(1).build();
        relay.push(event.clone());

        let handler = Arc::new(RecordingHandler::default());
        let _sub = provider
            .filters(&[Filter::new()], handler.clone())
            .await
            .unwrap();
        handler.wait_for(2).await;

        assert_eq!(handler.events(), vec![event]);
        assert_eq!(handler.terminal(), Some(Delivery::Done));
    }

    #[tokio::test]
    async fn test_subscribe_stays_open_and_reports_lost_connection() {
        let relay = Arc::new(FakeRelay::default());
        let provider = connected(relay.clone()).await;

        let handler = Arc::new(RecordingHandler::default());
        let _sub = provider
            .subscribe(&[Filter::new().kind(1)], handler.clone())
            .await
            .unwrap();

        let live = EventBuilder::new(1, "alice", "live").created_at(9).build();
        relay.push(live.clone());
        handler.wait_for(1).await;
        assert_eq!(handler.events(), vec![live]);

        relay.drop_connections();
        handler.wait_for(2).await;
        assert!(matches!(handler.terminal(), Some(Delivery::Error(_))));
    }

    #[tokio::test]
    async fn test_search_capability_follows_relay_info() {
        let plain = connected(Arc::new(FakeRelay::default())).await;
        assert!(!plain.supports().contains(&Capability::Search));

        let searchable = connected(Arc::new(FakeRelay {
            nips: vec![1, 11, 50],
            ..Default::default()
        }))
        .await;
        assert!(searchable.supports().contains(&Capability::Search));
        assert!(searchable.supports().contains(&Capability::LiveSubscribe));
    }

    #[tokio::test]
    async fn test_close_forgets_relay_info() {
        let provider = connected(Arc::new(FakeRelay {
            nips: vec![50],
            ..Default::default()
        }))
        .await;
        assert!(provider.supports().contains(&Capability::Search));

        provider.close().await.unwrap();
        assert_eq!(provider.info(), None);
        assert!(!provider.supports().contains(&Capability::Search));
    }
}
