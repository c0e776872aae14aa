//! Stream registry, the bookkeeping for every open subscription
//!
//! Each streaming call gets a descriptor keyed by its stream id before the
//! provider is asked to start, so a close that races the start still finds
//! it. The registry is the only component that closes provider-level
//! subscriptions.

use crate::error::{GatewayError, Result};
use crate::protocol::{Envelope, Method, StreamEvent};
use crate::provider::{StreamHandler, Subscription};
use crate::transport::EnvelopeSender;
use crate::types::{Event, SessionId, StreamId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

struct StreamDescriptor {
    method: Method,
    params: Vec<serde_json::Value>,
    session: SessionId,
    active: bool,
    subscription: Option<Box<dyn Subscription>>,
    sink: EnvelopeSender,
}

/// Read-only view of an open stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub stream_id: StreamId,
    pub method: Method,
    pub params: Vec<serde_json::Value>,
    pub session: SessionId,
    pub active: bool,
    pub started: bool,
}

/// Owner of all open stream descriptors
#[derive(Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<StreamId, StreamDescriptor>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<StreamId, StreamDescriptor>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a stream before its provider subscription exists
    pub fn open(
        &self,
        stream_id: StreamId,
        method: Method,
        params: Vec<serde_json::Value>,
        session: SessionId,
        sink: EnvelopeSender,
    ) -> Result<()> {
        let mut streams = self.lock();
        if streams.contains_key(&stream_id) {
            return Err(GatewayError::invalid_params(
                method.as_str(),
                format!("stream id '{}' is already open", stream_id),
            ));
        }

        tracing::debug!(stream_id = %stream_id, method = %method, session = %session, "Stream opened");
        streams.insert(
            stream_id,
            StreamDescriptor {
                method,
                params,
                session,
                active: true,
                subscription: None,
                sink,
            },
        );
        Ok(())
    }

    /// Handler set that forwards provider pushes to the stream's session
    pub fn handler(self: &Arc<Self>, stream_id: &StreamId) -> Arc<dyn StreamHandler> {
        Arc::new(StreamForwarder {
            stream_id: stream_id.clone(),
            registry: Arc::downgrade(self),
        })
    }

    /// Hand the provider-level subscription to its descriptor
    ///
    /// If the stream was closed or finished while the provider was
    /// starting, the subscription is closed right away.
    pub async fn attach(&self, stream_id: &StreamId, subscription: Box<dyn Subscription>) {
        let orphan = {
            let mut streams = self.lock();
            match streams.get_mut(stream_id) {
                Some(descriptor) if descriptor.active => {
                    descriptor.subscription = Some(subscription);
                    None
                }
                _ => Some(subscription),
            }
        };

        if let Some(subscription) = orphan {
            tracing::debug!(stream_id = %stream_id, "Stream ended before start completed");
            subscription.close().await;
        }
    }

    /// Forward one event; dropped silently if the stream is gone
    pub fn deliver_event(&self, stream_id: &StreamId, event: Event) -> bool {
        let streams = self.lock();
        match streams.get(stream_id) {
            Some(descriptor) if descriptor.active => descriptor
                .sink
                .send(Envelope::Stream(StreamEvent::event(stream_id.clone(), event)))
                .is_ok(),
            _ => false,
        }
    }

    /// Deliver the terminal signal and remove the descriptor
    ///
    /// At most one terminal signal is sent per stream id.
    pub fn finish(&self, stream_id: &StreamId, error: Option<String>) -> bool {
        let Some(mut descriptor) = self.lock().remove(stream_id) else {
            return false;
        };
        descriptor.active = false;

        let envelope = match &error {
            Some(error) => StreamEvent::error(stream_id.clone(), error.clone()),
            None => StreamEvent::done(stream_id.clone()),
        };
        let _ = descriptor.sink.send(Envelope::Stream(envelope));

        match &error {
            Some(error) => {
                tracing::debug!(stream_id = %stream_id, error = %error, "Stream failed")
            }
            None => tracing::debug!(stream_id = %stream_id, "Stream completed"),
        }

        if let Some(subscription) = descriptor.subscription.take() {
            release(subscription);
        }
        true
    }

    /// Drop the descriptor without notifying the requester
    pub fn remove(&self, stream_id: &StreamId) -> bool {
        self.lock().remove(stream_id).is_some()
    }

    /// Close a stream at the requester's request
    ///
    /// No terminal signal is sent. Returns false for unknown or already
    /// finished streams, which is not an error.
    pub async fn close_stream(&self, stream_id: &StreamId) -> bool {
        let Some(mut descriptor) = self.lock().remove(stream_id) else {
            tracing::debug!(stream_id = %stream_id, "Close for unknown stream ignored");
            return false;
        };
        descriptor.active = false;

        if let Some(subscription) = descriptor.subscription.take() {
            subscription.close().await;
        }
        tracing::debug!(stream_id = %stream_id, "Stream closed");
        true
    }

    /// Close every stream owned by `session`
    pub async fn dispose_session(&self, session: &SessionId) -> usize {
        let owned: Vec<StreamDescriptor> = {
            let mut streams = self.lock();
            let ids: Vec<StreamId> = streams
                .iter()
                .filter(|(_, d)| &d.session == session)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| streams.remove(id)).collect()
        };

        let count = owned.len();
        for mut descriptor in owned {
            descriptor.active = false;
            if let Some(subscription) = descriptor.subscription.take() {
                subscription.close().await;
            }
        }

        if count > 0 {
            tracing::info!(session = %session, streams = count, "Session streams disposed");
        }
        count
    }

    /// Close every open stream
    pub async fn dispose_all(&self) -> usize {
        let all: Vec<StreamDescriptor> = self.lock().drain().map(|(_, d)| d).collect();
        let count = all.len();
        for mut descriptor in all {
            if let Some(subscription) = descriptor.subscription.take() {
                subscription.close().await;
            }
        }
        count
    }

    pub fn contains(&self, stream_id: &StreamId) -> bool {
        self.lock().contains_key(stream_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn info(&self, stream_id: &StreamId) -> Option<StreamInfo> {
        self.lock().get(stream_id).map(|d| StreamInfo {
            stream_id: stream_id.clone(),
            method: d.method,
            params: d.params.clone(),
            session: d.session.clone(),
            active: d.active,
            started: d.subscription.is_some(),
        })
    }

    pub fn session_streams(&self, session: &SessionId) -> Vec<StreamId> {
        self.lock()
            .iter()
            .filter(|(_, d)| &d.session == session)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Close a finished stream's subscription off the delivery path
fn release(subscription: Box<dyn Subscription>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { subscription.close().await });
        }
        Err(_) => drop(subscription),
    }
}

/// Provider-facing handler for one stream id
struct StreamForwarder {
    stream_id: StreamId,
    registry: Weak<StreamRegistry>,
}

impl StreamHandler for StreamForwarder {
    fn on_event(&self, event: Event) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deliver_event(&self.stream_id, event);
        }
    }

    fn on_error(&self, error: String) {
        if let Some(registry) = self.registry.upgrade() {
            registry.finish(&self.stream_id, Some(error));
        }
    }

    fn on_done(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.finish(&self.stream_id, None);
        }
    }
}
