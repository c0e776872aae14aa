//! # a3s-gateway
//!
//! Failover event gateway: one RPC and streaming API over several
//! interchangeable event providers.
//!
//! ## Overview
//!
//! A privileged [`Host`] owns a [`BackendOrchestrator`] that picks among
//! registered providers by priority, retries and falls back on failure, and
//! health-checks the active one. Callers in another context reach it only
//! through envelopes on a [`Link`], via the [`EventClient`] façade.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use a3s_gateway::provider::store::StoreProvider;
//! use a3s_gateway::{
//!     BackendOrchestrator, EventBuilder, EventClient, Filter, GatewayConfig, Host,
//!     ProviderDescriptor, SessionOrigin,
//! };
//!
//! # async fn example() -> a3s_gateway::Result<()> {
//! let config = GatewayConfig::default();
//! let orchestrator = Arc::new(BackendOrchestrator::new(config.clone())?);
//! orchestrator.register(ProviderDescriptor::new(
//!     "local",
//!     "Local store",
//!     1,
//!     Arc::new(StoreProvider::memory()),
//! ))?;
//! orchestrator.connect().await;
//! orchestrator.start_health_check();
//!
//! let host = Arc::new(Host::new(orchestrator));
//! let client = EventClient::new(host.connect(SessionOrigin::Page), &config);
//!
//! client.add(&EventBuilder::new(1, "alice", "hello").build()).await?;
//!
//! let mut stream = client.filters(&[Filter::new().kind(1)]).await?;
//! while let Some(event) = stream.next().await? {
//!     println!("{}", event.content);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Providers
//!
//! - **store**: adapter over a [`provider::store::LocalStore`] engine; bundled `MemoryStore`
//! - **relay**: adapter over a [`provider::relay::RelayClient`] network connection
//!
//! ## Architecture
//!
//! - **EventProvider** trait: contract every backend implements
//! - **BackendOrchestrator**: selection, fallback, health checks
//! - **Dispatcher**: method routing for one request
//! - **StreamRegistry**: open streams, keyed by stream id and session
//! - **transport**: in-process pairs, framed byte streams, unix sockets
//! - **EventClient**: caller-side façade

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod orchestrator;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod transport;
pub mod types;

// Re-export core types
pub use client::{EventClient, EventStream};
pub use config::GatewayConfig;
pub use dispatcher::{Dispatcher, Session, SessionOrigin};
pub use error::{GatewayError, Result};
pub use orchestrator::{BackendOrchestrator, ProviderDescriptor};
pub use protocol::{Envelope, Method, Request, Response, StreamEvent};
pub use provider::{EventProvider, StreamHandler, Subscription, TaskSubscription};
pub use registry::StreamRegistry;
pub use transport::host::Host;
pub use transport::Link;
pub use types::{
    BackendStatus, Capabilities, Capability, Event, EventBuilder, Filter, ProviderStatus,
    ReplaceableKey, SessionId, StreamId,
};

// Re-export providers for convenience
pub use provider::relay::{RelayClient, RelayInfo, RelayMessage, RelayProvider};
pub use provider::store::{LocalStore, MemoryStore, StoreProvider};
