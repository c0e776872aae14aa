//! Backend orchestrator: provider selection, failover and health checks
//!
//! Owns the ordered provider list, the per-provider connect attempt
//! counters and the single "current provider" pointer. Connect passes are
//! serialized; a fallback requested while another one is running returns
//! immediately instead of racing it.

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::provider::{EventProvider, StreamHandler, Subscription};
use crate::types::{Capabilities, Event, Filter, ProviderStatus};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// A registered provider
#[derive(Clone)]
pub struct ProviderDescriptor {
    /// Stable identifier used by the administrative surface
    pub id: String,

    /// Display name
    pub name: String,

    /// Lower is tried first
    pub priority: u32,

    pub provider: Arc<dyn EventProvider>,
}

impl ProviderDescriptor {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        priority: u32,
        provider: Arc<dyn EventProvider>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            priority,
            provider,
        }
    }
}

struct ProviderEntry {
    descriptor: ProviderDescriptor,
    failed_attempts: u32,
}

struct CurrentProvider {
    id: String,
    provider: Arc<dyn EventProvider>,
}

#[derive(Default)]
struct SelectionState {
    /// Sorted ascending by priority; ties keep registration order
    entries: Vec<ProviderEntry>,
    current: Option<CurrentProvider>,
    preferred: Option<String>,
}

enum FallbackOutcome {
    Connected,
    Failed,
    InProgress,
}

/// Clears the fallback flag and wakes waiters when the pass ends
struct FallbackGuard<'a> {
    flag: &'a AtomicBool,
    done: &'a Notify,
}

impl Drop for FallbackGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        self.done.notify_waiters();
    }
}

/// Selects among interchangeable providers by priority and fails over
pub struct BackendOrchestrator {
    config: GatewayConfig,
    state: RwLock<SelectionState>,
    /// Serializes connect passes
    connect_lock: tokio::sync::Mutex<()>,
    fallback_in_progress: AtomicBool,
    fallback_done: Notify,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl BackendOrchestrator {
    /// Fails with `Config` when `config` does not validate
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: RwLock::new(SelectionState::default()),
            connect_lock: tokio::sync::Mutex::new(()),
            fallback_in_progress: AtomicBool::new(false),
            fallback_done: Notify::new(),
            health_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, SelectionState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, SelectionState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a provider; the list is re-sorted by priority
    pub fn register(&self, descriptor: ProviderDescriptor) -> Result<()> {
        let mut state = self.write_state();
        if state.entries.iter().any(|e| e.descriptor.id == descriptor.id) {
            return Err(GatewayError::Config(format!(
                "Provider '{}' is already registered",
                descriptor.id
            )));
        }

        tracing::info!(
            provider = %descriptor.id,
            name = %descriptor.name,
            priority = descriptor.priority,
            "Provider registered"
        );
        state.entries.push(ProviderEntry {
            descriptor,
            failed_attempts: 0,
        });
        state.entries.sort_by_key(|e| e.descriptor.priority);
        Ok(())
    }

    /// Snapshot of the current provider
    pub fn current_provider(&self) -> Option<Arc<dyn EventProvider>> {
        self.read_state().current.as_ref().map(|c| c.provider.clone())
    }

    /// Id of the current provider
    pub fn current_provider_id(&self) -> Option<String> {
        self.read_state().current.as_ref().map(|c| c.id.clone())
    }

    /// Whether a current provider is set and reports healthy
    pub fn is_connected(&self) -> bool {
        self.current_provider()
            .is_some_and(|provider| provider.is_connected())
    }

    /// Per-provider administrative status, in priority order
    pub fn status(&self) -> Vec<ProviderStatus> {
        self.read_state()
            .entries
            .iter()
            .map(|e| ProviderStatus {
                id: e.descriptor.id.clone(),
                name: e.descriptor.name.clone(),
                connected: e.descriptor.provider.is_connected(),
                failed_attempts: e.failed_attempts,
            })
            .collect()
    }

    /// Run a full priority-ordered connect pass
    ///
    /// Closes the current provider first. Returns false and leaves no
    /// current provider when every candidate fails or is over the retry bound.
    pub async fn connect(&self) -> bool {
        let _pass = self.connect_lock.lock().await;
        self.connect_pass().await
    }

    async fn connect_pass(&self) -> bool {
        let previous = self.write_state().current.take();
        if let Some(previous) = previous {
            if let Err(e) = previous.provider.close().await {
                tracing::warn!(provider = %previous.id, error = %e, "Failed to close provider");
            }
        }

        for (id, provider, failed_attempts) in self.candidates() {
            if failed_attempts >= self.config.max_connect_attempts {
                tracing::debug!(
                    provider = %id,
                    failed_attempts,
                    "Skipping provider over retry bound"
                );
                continue;
            }

            let outcome = match provider.connect().await {
                Ok(()) if provider.is_connected() => Ok(()),
                Ok(()) => Err(GatewayError::Connection(format!(
                    "{} reported unhealthy after connect",
                    id
                ))),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    let mut state = self.write_state();
                    if let Some(entry) = state.entries.iter_mut().find(|e| e.descriptor.id == id) {
                        entry.failed_attempts = 0;
                    }
                    state.current = Some(CurrentProvider {
                        id: id.clone(),
                        provider,
                    });
                    drop(state);
                    tracing::info!(provider = %id, "Provider selected");
                    return true;
                }
                Err(e) => {
                    let attempts = self.record_failure(&id);
                    tracing::warn!(
                        provider = %id,
                        failed_attempts = attempts,
                        error = %e,
                        "Provider connect failed"
                    );
                    if let Err(e) = provider.close().await {
                        tracing::debug!(provider = %id, error = %e, "Close after failed connect");
                    }
                }
            }
        }

        tracing::warn!("No provider available");
        false
    }

    /// Connect order: the preferred provider first, then by priority
    fn candidates(&self) -> Vec<(String, Arc<dyn EventProvider>, u32)> {
        let state = self.read_state();
        let snapshot = |e: &ProviderEntry| {
            (
                e.descriptor.id.clone(),
                e.descriptor.provider.clone(),
                e.failed_attempts,
            )
        };

        let preferred = state.preferred.as_deref();
        let mut ordered: Vec<_> = state
            .entries
            .iter()
            .filter(|e| Some(e.descriptor.id.as_str()) == preferred)
            .map(snapshot)
            .collect();
        ordered.extend(
            state
                .entries
                .iter()
                .filter(|e| Some(e.descriptor.id.as_str()) != preferred)
                .map(snapshot),
        );
        ordered
    }

    fn record_failure(&self, id: &str) -> u32 {
        let mut state = self.write_state();
        match state.entries.iter_mut().find(|e| e.descriptor.id == id) {
            Some(entry) => {
                entry.failed_attempts += 1;
                entry.failed_attempts
            }
            None => 0,
        }
    }

    /// True if the current provider is healthy; otherwise falls back
    pub async fn ensure_connection(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        self.fallback_or_wait().await
    }

    /// Close the current provider and run a connect pass
    ///
    /// Returns false immediately, without touching any provider, when
    /// another fallback is already in progress.
    pub async fn attempt_fallback(&self) -> bool {
        matches!(self.try_fallback().await, FallbackOutcome::Connected)
    }

    async fn try_fallback(&self) -> FallbackOutcome {
        if self
            .fallback_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Fallback already in progress");
            return FallbackOutcome::InProgress;
        }
        let _guard = FallbackGuard {
            flag: &self.fallback_in_progress,
            done: &self.fallback_done,
        };

        tracing::info!(previous = ?self.current_provider_id(), "Attempting provider fallback");
        if self.connect().await {
            FallbackOutcome::Connected
        } else {
            FallbackOutcome::Failed
        }
    }

    /// Fall back, or wait for the fallback someone else is running
    async fn fallback_or_wait(&self) -> bool {
        match self.try_fallback().await {
            FallbackOutcome::Connected => true,
            FallbackOutcome::Failed => false,
            FallbackOutcome::InProgress => {
                let done = self.fallback_done.notified();
                if self.fallback_in_progress.load(Ordering::SeqCst) {
                    done.await;
                }
                self.is_connected()
            }
        }
    }

    /// Run `op` on the current provider, failing over and retrying once
    async fn with_failover<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn EventProvider>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.ensure_connection().await {
            return Err(GatewayError::NoProviderAvailable);
        }
        let provider = self
            .current_provider()
            .ok_or(GatewayError::NoProviderAvailable)?;

        match f(provider).await {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::warn!(
                    operation = op,
                    provider = ?self.current_provider_id(),
                    error = %e,
                    "Provider operation failed, falling back"
                );
                if !self.fallback_or_wait().await {
                    return Err(GatewayError::NoProviderAvailable);
                }
                let provider = self
                    .current_provider()
                    .ok_or(GatewayError::NoProviderAvailable)?;
                f(provider).await
            }
        }
    }

    /// Store an event on the current provider
    pub async fn add(&self, event: &Event) -> Result<bool> {
        self.with_failover("add", |p| async move { p.add(event).await })
            .await
    }

    /// Look up an event by id
    pub async fn event(&self, id: &str) -> Result<Option<Event>> {
        self.with_failover("event", |p| async move { p.event(id).await })
            .await
    }

    /// Newest event for a replaceable address
    pub async fn replaceable(
        &self,
        kind: u32,
        author: &str,
        identifier: Option<&str>,
    ) -> Result<Option<Event>> {
        self.with_failover("replaceable", |p| async move {
            p.replaceable(kind, author, identifier).await
        })
        .await
    }

    /// Count distinct events matching any filter
    pub async fn count(&self, filters: &[Filter]) -> Result<u64> {
        self.with_failover("count", |p| async move { p.count(filters).await })
            .await
    }

    /// Start a one-shot stream; not retried on failure
    pub async fn filters(
        &self,
        filters: &[Filter],
        handler: Arc<dyn StreamHandler>,
    ) -> Result<Box<dyn Subscription>> {
        self.streaming_provider().await?.filters(filters, handler).await
    }

    /// Start a live subscription; not retried on failure
    pub async fn subscribe(
        &self,
        filters: &[Filter],
        handler: Arc<dyn StreamHandler>,
    ) -> Result<Box<dyn Subscription>> {
        self.streaming_provider().await?.subscribe(filters, handler).await
    }

    async fn streaming_provider(&self) -> Result<Arc<dyn EventProvider>> {
        if !self.ensure_connection().await {
            return Err(GatewayError::NoProviderAvailable);
        }
        self.current_provider()
            .ok_or(GatewayError::NoProviderAvailable)
    }

    /// Capabilities of the current provider
    pub async fn supports(&self) -> Result<Capabilities> {
        Ok(self.streaming_provider().await?.supports())
    }

    /// One health-check tick: fall back if the current provider is unhealthy
    pub async fn check_health(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        tracing::warn!(
            provider = ?self.current_provider_id(),
            "Current provider unhealthy or absent"
        );
        self.attempt_fallback().await
    }

    /// Start the recurring health check. No-op if already running.
    pub fn start_health_check(self: &Arc<Self>) {
        let mut task = self.health_task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let period = self.config.health_check_interval();
        let weak = Arc::downgrade(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                orchestrator.check_health().await;
            }
        }));

        tracing::info!(interval_secs = period.as_secs(), "Health check started");
    }

    /// Cancel the recurring health check
    pub fn stop_health_check(&self) {
        let task = self
            .health_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
            tracing::info!("Health check stopped");
        }
    }

    pub fn is_health_check_running(&self) -> bool {
        self.health_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Prefer provider `id` and reselect
    ///
    /// The preferred provider is tried first in this and every later
    /// connect pass; if it cannot connect, selection continues in
    /// priority order.
    pub async fn set_active_provider_preference(self: &Arc<Self>, id: &str) -> Result<bool> {
        {
            let mut state = self.write_state();
            let entry = state
                .entries
                .iter_mut()
                .find(|e| e.descriptor.id == id)
                .ok_or_else(|| GatewayError::Config(format!("Unknown provider '{}'", id)))?;
            entry.failed_attempts = 0;
            state.preferred = Some(id.to_string());
        }

        self.stop_health_check();
        let connected = self.connect().await;
        self.start_health_check();
        Ok(connected)
    }

    /// Drop any preference set by [`set_active_provider_preference`](Self::set_active_provider_preference)
    pub fn clear_preference(&self) {
        self.write_state().preferred = None;
    }

    pub fn preferred_provider_id(&self) -> Option<String> {
        self.read_state().preferred.clone()
    }

    /// Reset every attempt counter and run a connect pass
    pub async fn reconnect(&self) -> bool {
        for entry in self.write_state().entries.iter_mut() {
            entry.failed_attempts = 0;
        }
        self.connect().await
    }

    /// Stop health checks and close the current provider
    pub async fn shutdown(&self) {
        self.stop_health_check();
        let _pass = self.connect_lock.lock().await;
        let current = self.write_state().current.take();
        if let Some(current) = current {
            if let Err(e) = current.provider.close().await {
                tracing::warn!(provider = %current.id, error = %e, "Failed to close provider");
            }
        }
    }
}

impl Drop for BackendOrchestrator {
    fn drop(&mut self) {
        if let Ok(mut task) = self.health_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}
