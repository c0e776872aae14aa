//! Privileged-side serve loop
//!
//! Every served link is one session. Requests are dispatched concurrently;
//! responses and stream envelopes share the session's outbound channel. When
//! the link closes, in-flight requests are abandoned and the session's
//! streams are disposed.

use super::Link;
use crate::dispatcher::{Dispatcher, Session, SessionOrigin};
use crate::orchestrator::BackendOrchestrator;
use crate::protocol::Envelope;
use crate::registry::StreamRegistry;
use crate::types::SessionId;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;

/// Owner of the dispatcher and stream registry for all sessions
pub struct Host {
    dispatcher: Arc<Dispatcher>,
    max_frame_size: u32,
}

impl Host {
    pub fn new(orchestrator: Arc<BackendOrchestrator>) -> Self {
        let max_frame_size = orchestrator.config().max_frame_size;
        let registry = Arc::new(StreamRegistry::new());
        Self {
            dispatcher: Arc::new(Dispatcher::new(orchestrator, registry)),
            max_frame_size,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn orchestrator(&self) -> &Arc<BackendOrchestrator> {
        self.dispatcher.orchestrator()
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        self.dispatcher.registry()
    }

    /// Serve one link until the caller side goes away
    pub async fn serve(&self, link: Link, origin: SessionOrigin) -> SessionId {
        let (outbound, mut inbound) = link.into_parts();
        let session = Session::new(origin, outbound);
        tracing::info!(session = %session.id, origin = ?origin, "Session opened");

        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                envelope = inbound.recv() => {
                    let Some(envelope) = envelope else { break };
                    match envelope {
                        Envelope::Request(request) => {
                            let dispatcher = self.dispatcher.clone();
                            let session = session.clone();
                            in_flight.spawn(async move {
                                let response = dispatcher.dispatch(&session, request).await;
                                if session.outbound.send(Envelope::Response(response)).is_err() {
                                    tracing::debug!(session = %session.id, "Response dropped, session gone");
                                }
                            });
                        }
                        other => {
                            tracing::warn!(
                                session = %session.id,
                                envelope = ?other,
                                "Ignoring non-request envelope from caller"
                            );
                        }
                    }
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        in_flight.shutdown().await;
        self.registry().dispose_session(&session.id).await;
        tracing::info!(session = %session.id, "Session closed");
        session.id
    }

    /// Open an in-process session and return the caller's end
    pub fn connect(self: &Arc<Self>, origin: SessionOrigin) -> Link {
        let (caller, host_end) = Link::pair();
        let host = self.clone();
        tokio::spawn(async move {
            host.serve(host_end, origin).await;
        });
        caller
    }

    /// Serve a session over any byte stream
    pub async fn serve_framed<R, W>(&self, reader: R, writer: W, origin: SessionOrigin) -> SessionId
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let link = Link::framed(reader, writer, self.max_frame_size);
        self.serve(link, origin).await
    }

    /// Close every stream, stop health checks and release the provider
    pub async fn shutdown(&self) {
        let closed = self.registry().dispose_all().await;
        self.orchestrator().shutdown().await;
        tracing::info!(streams = closed, "Host shut down");
    }
}
