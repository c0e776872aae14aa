//! Public façade
//!
//! `EventClient` turns local calls into request envelopes and rebuilds
//! results and streams from what comes back over its [`Link`]. It owns only
//! transient state: pending requests keyed by request id and local queues
//! keyed by stream id.

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::protocol::{Envelope, Method, Request, Response, StreamEvent};
use crate::transport::{EnvelopeReceiver, EnvelopeSender, Link};
use crate::types::{BackendStatus, Capabilities, Event, Filter, ProviderStatus, StreamId};
use futures::Stream;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

/// Caller-side handle to a gateway host
pub struct EventClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    outbound: EnvelopeSender,
    shared: Arc<Shared>,
    request_timeout: Duration,
    stream_buffer: usize,
}

/// State shared with the reader task
#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<String, oneshot::Sender<Response>>>,
    streams: Mutex<HashMap<StreamId, Arc<StreamQueue>>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Response>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<StreamId, Arc<StreamQueue>>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn route_stream(&self, item: StreamEvent) {
        let queue = {
            let mut streams = self.streams();
            if item.is_terminal() {
                streams.remove(&item.stream_id)
            } else {
                streams.get(&item.stream_id).cloned()
            }
        };
        let Some(queue) = queue else {
            tracing::debug!(stream_id = %item.stream_id, "Dropping envelope for unknown stream");
            return;
        };

        if let Some(error) = item.error {
            queue.finish(Terminal::Error(error));
        } else if item.done {
            queue.finish(Terminal::Done);
        } else if let Some(event) = item.event {
            queue.push(&item.stream_id, event);
        }
    }

    /// Abandon all outstanding work once the link is gone
    fn fail_all(&self, reason: &str) {
        self.pending().clear();
        let streams: Vec<Arc<StreamQueue>> = self.streams().drain().map(|(_, q)| q).collect();
        for queue in streams {
            queue.finish(Terminal::Error(reason.to_string()));
        }
    }
}

async fn read_loop(mut inbound: EnvelopeReceiver, shared: Arc<Shared>) {
    while let Some(envelope) = inbound.recv().await {
        match envelope {
            Envelope::Response(response) => {
                let waiter = shared.pending().remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        tracing::debug!(id = %response.id, "Dropping response with no pending request")
                    }
                }
            }
            Envelope::Stream(item) => shared.route_stream(item),
            Envelope::Request(request) => {
                tracing::warn!(method = %request.method, "Ignoring request sent to client");
            }
        }
    }
    tracing::debug!("Client link closed");
    shared.fail_all("link closed");
}

impl EventClient {
    /// Drive an already-established link
    pub fn new(link: Link, config: &GatewayConfig) -> Self {
        let (outbound, inbound) = link.into_parts();
        let shared = Arc::new(Shared::default());
        tokio::spawn(read_loop(inbound, shared.clone()));

        Self {
            inner: Arc::new(ClientInner {
                outbound,
                shared,
                request_timeout: config.request_timeout(),
                stream_buffer: config.stream_buffer_size,
            }),
        }
    }

    /// Talk to a host over any byte stream
    pub fn connect_framed<R, W>(reader: R, writer: W, config: &GatewayConfig) -> Self
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(Link::framed(reader, writer, config.max_frame_size), config)
    }

    /// Talk to a host listening on a unix socket
    #[cfg(unix)]
    pub async fn connect_unix(
        path: impl AsRef<std::path::Path>,
        config: &GatewayConfig,
    ) -> Result<Self> {
        let (reader, writer) = crate::transport::unix::connect(path).await?;
        Ok(Self::connect_framed(reader, writer, config))
    }

    pub async fn add(&self, event: &Event) -> Result<bool> {
        self.inner.typed(Method::Add, vec![json!(event)]).await
    }

    pub async fn event(&self, id: &str) -> Result<Option<Event>> {
        self.inner.typed(Method::Event, vec![json!(id)]).await
    }

    pub async fn replaceable(
        &self,
        kind: u32,
        author: &str,
        identifier: Option<&str>,
    ) -> Result<Option<Event>> {
        self.inner
            .typed(
                Method::Replaceable,
                vec![json!(kind), json!(author), json!(identifier)],
            )
            .await
    }

    pub async fn count(&self, filters: &[Filter]) -> Result<u64> {
        self.inner.typed(Method::Count, vec![json!(filters)]).await
    }

    pub async fn supports(&self) -> Result<Capabilities> {
        self.inner.typed(Method::Supports, vec![]).await
    }

    /// Every currently-matching event, then end of stream
    pub async fn filters(&self, filters: &[Filter]) -> Result<EventStream> {
        self.inner.open_stream(Method::Filters, filters).await
    }

    /// Matching events now and as they arrive, until closed
    pub async fn subscribe(&self, filters: &[Filter]) -> Result<EventStream> {
        self.inner.open_stream(Method::Subscribe, filters).await
    }

    /// Prefer provider `id` from now on; true if a provider is connected
    pub async fn set_backend(&self, id: &str) -> Result<bool> {
        self.inner.typed(Method::SetBackend, vec![json!(id)]).await
    }

    pub async fn backend(&self) -> Result<Option<String>> {
        self.inner.typed(Method::GetBackend, vec![]).await
    }

    pub async fn backend_status(&self) -> Result<BackendStatus> {
        self.inner.typed(Method::GetBackendStatus, vec![]).await
    }

    pub async fn backends(&self) -> Result<Vec<ProviderStatus>> {
        self.inner.typed(Method::GetBackends, vec![]).await
    }

    pub async fn reconnect_backends(&self) -> Result<bool> {
        self.inner.typed(Method::ReconnectBackends, vec![]).await
    }

    pub async fn is_backend_connected(&self) -> Result<bool> {
        self.inner.typed(Method::IsBackendConnected, vec![]).await
    }

    /// Requests still waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.inner.shared.pending().len()
    }

    /// Streams with a live local queue
    pub fn open_streams(&self) -> usize {
        self.inner.shared.streams().len()
    }
}

impl ClientInner {
    async fn call(&self, method: Method, params: Vec<Value>) -> Result<Value> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id.clone(), tx);

        let request = Envelope::Request(Request::new(id.clone(), method, params));
        if self.outbound.send(request).is_err() {
            self.shared.pending().remove(&id);
            return Err(GatewayError::Transport("link closed".to_string()));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(GatewayError::Transport(
                "link closed before response".to_string(),
            )),
            Err(_) => {
                self.shared.pending().remove(&id);
                Err(GatewayError::Timeout(format!(
                    "{} after {}s",
                    method,
                    self.request_timeout.as_secs()
                )))
            }
        }
    }

    async fn typed<T: DeserializeOwned>(&self, method: Method, params: Vec<Value>) -> Result<T> {
        let value = self.call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send without waiting; the response is dropped on arrival
    fn notify(&self, method: Method, params: Vec<Value>) {
        let id = uuid::Uuid::new_v4().to_string();
        let _ = self
            .outbound
            .send(Envelope::Request(Request::new(id, method, params)));
    }

    async fn open_stream(self: &Arc<Self>, method: Method, filters: &[Filter]) -> Result<EventStream> {
        let stream_id = StreamId::generate();
        let queue = Arc::new(StreamQueue::new(self.stream_buffer));
        // Registered before the request so early events have somewhere to go
        self.shared.streams().insert(stream_id.clone(), queue.clone());

        match self
            .call(method, vec![json!(stream_id), json!(filters)])
            .await
        {
            Ok(_) => Ok(EventStream {
                id: stream_id,
                queue,
                client: self.clone(),
                closed: false,
            }),
            Err(e) => {
                self.shared.streams().remove(&stream_id);
                if matches!(e, GatewayError::Timeout(_)) {
                    self.notify(Method::CloseStream, vec![json!(stream_id)]);
                }
                Err(e)
            }
        }
    }
}

enum Terminal {
    Done,
    Error(String),
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Event>,
    terminal: Option<Terminal>,
    /// Error already handed out; only `None` from here on
    exhausted: bool,
    closed: bool,
    dropped: u64,
}

/// Bounded per-stream buffer between the reader task and the consumer
///
/// Providers push at their own pace. When the consumer falls behind, the
/// oldest buffered event is discarded.
struct StreamQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl StreamQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, stream_id: &StreamId, event: Event) {
        {
            let mut state = self.state();
            if state.closed || state.terminal.is_some() {
                return;
            }
            if state.items.len() >= self.capacity {
                state.items.pop_front();
                state.dropped += 1;
                tracing::warn!(stream_id = %stream_id, dropped = state.dropped, "Stream buffer full, dropped oldest event");
            }
            state.items.push_back(event);
        }
        self.notify.notify_one();
    }

    fn finish(&self, terminal: Terminal) {
        {
            let mut state = self.state();
            if state.terminal.is_none() {
                state.terminal = Some(terminal);
            }
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        {
            let mut state = self.state();
            state.closed = true;
            state.items.clear();
        }
        self.notify.notify_one();
    }

    fn is_finished(&self) -> bool {
        let state = self.state();
        state.closed || state.terminal.is_some()
    }

    fn dropped(&self) -> u64 {
        self.state().dropped
    }

    /// Next buffered event, or the terminal outcome once drained
    async fn next(&self) -> Option<std::result::Result<Event, String>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if state.closed || state.exhausted {
                    return None;
                }
                if let Some(event) = state.items.pop_front() {
                    return Some(Ok(event));
                }
                match state.terminal.take() {
                    Some(Terminal::Done) => {
                        state.exhausted = true;
                        return None;
                    }
                    Some(Terminal::Error(error)) => {
                        state.exhausted = true;
                        return Some(Err(error));
                    }
                    None => {}
                }
            }
            notified.await;
        }
    }
}

/// Caller-side view of one open stream
///
/// Dropping an unfinished stream closes it on the host.
pub struct EventStream {
    id: StreamId,
    queue: Arc<StreamQueue>,
    client: Arc<ClientInner>,
    closed: bool,
}

impl EventStream {
    pub fn id(&self) -> &StreamId {
        &self.id
    }

    /// Next event; `Ok(None)` once the stream completed or was closed
    ///
    /// A provider failure is returned once as `GatewayError::Stream`.
    pub async fn next(&mut self) -> Result<Option<Event>> {
        match self.queue.next().await {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(error)) => Err(GatewayError::Stream(error)),
            None => Ok(None),
        }
    }

    /// Events discarded because the local buffer overflowed
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Stop the stream; nothing is yielded afterward. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.queue.close();
        self.client.shared.streams().remove(&self.id);
        self.client
            .call(Method::CloseStream, vec![json!(self.id)])
            .await?;
        Ok(())
    }

    /// Adapt into a `futures::Stream`
    pub fn into_stream(self) -> impl Stream<Item = Result<Event>> {
        futures::stream::unfold(self, |mut stream| async move {
            match stream.next().await {
                Ok(Some(event)) => Some((Ok(event), stream)),
                Ok(None) => None,
                Err(e) => Some((Err(e), stream)),
            }
        })
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if self.closed || self.queue.is_finished() {
            return;
        }
        self.queue.close();
        self.client.shared.streams().remove(&self.id);
        self.client
            .notify(Method::CloseStream, vec![json!(self.id)]);
    }
}
