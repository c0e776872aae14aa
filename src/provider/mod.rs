//! Event provider trait: the capability contract every backend satisfies
//!
//! Backends (local persistent store, network relay, ...) implement
//! `EventProvider`. Callers branch on [`EventProvider::supports`], never on
//! provider identity.

use crate::error::Result;
use crate::types::{Capabilities, Event, Filter};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub mod relay;
pub mod store;

/// Core trait for event backends
#[async_trait]
pub trait EventProvider: Send + Sync {
    /// Provider name (e.g., "store", "relay")
    fn name(&self) -> &str;

    /// Connect to the backend
    ///
    /// Fails with `Connection` if the backend is unreachable or misconfigured.
    /// Calling while already connected is a no-op.
    async fn connect(&self) -> Result<()>;

    /// Release all resources. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Non-blocking health predicate
    fn is_connected(&self) -> bool;

    /// Store an event, returning whether it was accepted
    ///
    /// Re-submitting an already-stored id is a successful no-op.
    async fn add(&self, event: &Event) -> Result<bool>;

    /// Look up an event by id; `None` when absent
    async fn event(&self, id: &str) -> Result<Option<Event>>;

    /// Newest event for `(kind, author, identifier?)`; `None` when absent
    async fn replaceable(
        &self,
        kind: u32,
        author: &str,
        identifier: Option<&str>,
    ) -> Result<Option<Event>>;

    /// Number of distinct events matching any of `filters`
    async fn count(&self, filters: &[Filter]) -> Result<u64>;

    /// Deliver every currently-matching event, then `on_done`
    async fn filters(
        &self,
        filters: &[Filter],
        handler: Arc<dyn StreamHandler>,
    ) -> Result<Box<dyn Subscription>>;

    /// Like `filters`, but keep delivering newly arriving events until closed
    ///
    /// Default implementation delegates to `filters()`, which is legal for
    /// providers without live delivery.
    async fn subscribe(
        &self,
        filters: &[Filter],
        handler: Arc<dyn StreamHandler>,
    ) -> Result<Box<dyn Subscription>> {
        self.filters(filters, handler).await
    }

    /// Optional capabilities this provider actually honors
    fn supports(&self) -> Capabilities;
}

/// Push-delivery callbacks for a provider-level stream
///
/// Called from the provider's delivery task. Events for one stream arrive
/// in emission order; `on_error`/`on_done` are terminal.
pub trait StreamHandler: Send + Sync {
    fn on_event(&self, event: Event);

    fn on_error(&self, error: String);

    fn on_done(&self);
}

/// Provider-level subscription handle
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Stop further delivery. Idempotent.
    async fn close(&self);
}

/// Subscription backed by a spawned delivery task
///
/// Closing flips the shared flag the task checks before each delivery and
/// aborts the task.
pub struct TaskSubscription {
    closed: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSubscription {
    /// Spawn `deliver` with a fresh closed-flag
    pub fn spawn<F, Fut>(deliver: F) -> Self
    where
        F: FnOnce(Arc<AtomicBool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let closed = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(deliver(closed.clone()));
        Self {
            closed,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Subscription for TaskSubscription {
    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }
}

impl Drop for TaskSubscription {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut task) = self.task.try_lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording handler shared by provider and orchestrator tests

    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Delivery {
        Event(Event),
        Error(String),
        Done,
    }

    #[derive(Default)]
    pub struct RecordingHandler {
        pub deliveries: StdMutex<Vec<Delivery>>,
        pub notify: Notify,
    }

    impl RecordingHandler {
        pub fn events(&self) -> Vec<Event> {
            self.deliveries
                .lock()
                .unwrap()
                .iter()
                .filter_map(|d| match d {
                    Delivery::Event(e) => Some(e.clone()),
                    _ => None,
                })
                .collect()
        }

        pub fn terminal(&self) -> Option<Delivery> {
            self.deliveries
                .lock()
                .unwrap()
                .iter()
                .find(|d| !matches!(d, Delivery::Event(_)))
                .cloned()
        }

        /// Wait until at least `n` deliveries were recorded
        pub async fn wait_for(&self, n: usize) {
            loop {
                let notified = self.notify.notified();
                if self.deliveries.lock().unwrap().len() >= n {
                    return;
                }
                tokio::time::timeout(std::time::Duration::from_secs(5), notified)
                    .await
                    .expect("timed out waiting for deliveries");
            }
        }

        fn push(&self, delivery: Delivery) {
            self.deliveries.lock().unwrap().push(delivery);
            self.notify.notify_waiters();
        }
    }

    impl StreamHandler for RecordingHandler {
        fn on_event(&self, event: Event) {
            self.push(Delivery::Event(event));
        }

        fn on_error(&self, error: String) {
            self.push(Delivery::Error(error));
        }

        fn on_done(&self) {
            self.push(Delivery::Done);
        }
    }

    /// Store-backed provider with switchable failures and call counters
    pub struct ScriptedProvider {
        pub inner: super::store::StoreProvider,
        pub refuse_connect: AtomicBool,
        pub fail_operations: AtomicBool,
        pub healthy: AtomicBool,
        pub connect_delay: std::time::Duration,
        pub connect_calls: std::sync::atomic::AtomicU32,
        pub close_calls: std::sync::atomic::AtomicU32,
        pub op_calls: std::sync::atomic::AtomicU32,
    }

    impl ScriptedProvider {
        pub fn new(name: &str) -> Self {
            Self {
                inner: super::store::StoreProvider::with_name(
                    name,
                    Arc::new(super::store::MemoryStore::new()),
                ),
                refuse_connect: AtomicBool::new(false),
                fail_operations: AtomicBool::new(false),
                healthy: AtomicBool::new(true),
                connect_delay: std::time::Duration::ZERO,
                connect_calls: Default::default(),
                close_calls: Default::default(),
                op_calls: Default::default(),
            }
        }

        pub fn refusing(name: &str) -> Self {
            let provider = Self::new(name);
            provider.refuse_connect.store(true, Ordering::SeqCst);
            provider
        }

        pub fn connects(&self) -> u32 {
            self.connect_calls.load(Ordering::SeqCst)
        }

        pub fn closes(&self) -> u32 {
            self.close_calls.load(Ordering::SeqCst)
        }

        fn check_op(&self) -> crate::error::Result<()> {
            self.op_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_operations.load(Ordering::SeqCst) {
                Err(crate::error::GatewayError::Operation(format!(
                    "{} rejected the call",
                    self.inner.name()
                )))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl EventProvider for ScriptedProvider {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn connect(&self) -> crate::error::Result<()> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if !self.connect_delay.is_zero() {
                tokio::time::sleep(self.connect_delay).await;
            }
            if self.refuse_connect.load(Ordering::SeqCst) {
                return Err(crate::error::GatewayError::Connection(format!(
                    "{} unreachable",
                    self.inner.name()
                )));
            }
            self.inner.connect().await
        }

        async fn close(&self) -> crate::error::Result<()> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.close().await
        }

        fn is_connected(&self) -> bool {
            self.healthy.load(Ordering::SeqCst) && self.inner.is_connected()
        }

        async fn add(&self, event: &Event) -> crate::error::Result<bool> {
            self.check_op()?;
            self.inner.add(event).await
        }

        async fn event(&self, id: &str) -> crate::error::Result<Option<Event>> {
            self.check_op()?;
            self.inner.event(id).await
        }

        async fn replaceable(
            &self,
            kind: u32,
            author: &str,
            identifier: Option<&str>,
        ) -> crate::error::Result<Option<Event>> {
            self.check_op()?;
            self.inner.replaceable(kind, author, identifier).await
        }

        async fn count(&self, filters: &[Filter]) -> crate::error::Result<u64> {
            self.check_op()?;
            self.inner.count(filters).await
        }

        async fn filters(
            &self,
            filters: &[Filter],
            handler: Arc<dyn StreamHandler>,
        ) -> crate::error::Result<Box<dyn Subscription>> {
            self.check_op()?;
            self.inner.filters(filters, handler).await
        }

        async fn subscribe(
            &self,
            filters: &[Filter],
            handler: Arc<dyn StreamHandler>,
        ) -> crate::error::Result<Box<dyn Subscription>> {
            self.check_op()?;
            self.inner.subscribe(filters, handler).await
        }

        fn supports(&self) -> Capabilities {
            self.inner.supports()
        }
    }
}
