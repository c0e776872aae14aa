//! RPC dispatcher, routing one request to the orchestrator or the registry

use crate::error::{GatewayError, Result};
use crate::orchestrator::BackendOrchestrator;
use crate::protocol::{Method, Request, Response};
use crate::registry::StreamRegistry;
use crate::transport::EnvelopeSender;
use crate::types::{BackendStatus, Capability, Event, Filter, SessionId, StreamId};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;

/// Trust level of the context a session belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    /// Untrusted page context, data methods only
    Page,
    /// Host-side tooling, data and administrative methods
    Privileged,
}

/// One connected caller context
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub origin: SessionOrigin,
    /// Where this session's stream envelopes are sent
    pub outbound: EnvelopeSender,
}

impl Session {
    pub fn new(origin: SessionOrigin, outbound: EnvelopeSender) -> Self {
        Self {
            id: SessionId::generate(),
            origin,
            outbound,
        }
    }
}

/// Positional arguments of one request
struct Params<'a> {
    method: Method,
    values: &'a [Value],
}

impl<'a> Params<'a> {
    fn required<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let value = self.values.get(index).ok_or_else(|| {
            GatewayError::invalid_params(
                self.method.as_str(),
                format!("missing argument {}", index),
            )
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            GatewayError::invalid_params(self.method.as_str(), format!("argument {}: {}", index, e))
        })
    }

    /// Absent and `null` both read as `None`
    fn optional<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>> {
        match self.values.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.required(index).map(Some),
        }
    }
}

/// Stateless router in front of the orchestrator and stream registry
pub struct Dispatcher {
    orchestrator: Arc<BackendOrchestrator>,
    registry: Arc<StreamRegistry>,
}

impl Dispatcher {
    pub fn new(orchestrator: Arc<BackendOrchestrator>, registry: Arc<StreamRegistry>) -> Self {
        Self {
            orchestrator,
            registry,
        }
    }

    pub fn orchestrator(&self) -> &Arc<BackendOrchestrator> {
        &self.orchestrator
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// Answer one request; every failure becomes an error response
    pub async fn dispatch(&self, session: &Session, request: Request) -> Response {
        let id = request.id.clone();
        let method = request.method.clone();

        match self.route(session, request).await {
            Ok(result) => Response::ok(id, result),
            Err(e) => {
                tracing::debug!(method = %method, session = %session.id, error = %e, "Request failed");
                Response::err(id, &e)
            }
        }
    }

    async fn route(&self, session: &Session, request: Request) -> Result<Value> {
        let method: Method = request.method.parse()?;
        if method.is_admin() && session.origin != SessionOrigin::Privileged {
            return Err(GatewayError::Forbidden(method.as_str().to_string()));
        }

        tracing::debug!(method = %method, session = %session.id, "Dispatching request");
        let params = Params {
            method,
            values: &request.params,
        };

        let orchestrator = &self.orchestrator;
        let result = match method {
            Method::Add => {
                let event: Event = params.required(0)?;
                json!(orchestrator.add(&event).await?)
            }
            Method::Event => {
                let id: String = params.required(0)?;
                serde_json::to_value(orchestrator.event(&id).await?)?
            }
            Method::Replaceable => {
                let kind: u32 = params.required(0)?;
                let author: String = params.required(1)?;
                let identifier: Option<String> = params.optional(2)?;
                let event = orchestrator
                    .replaceable(kind, &author, identifier.as_deref())
                    .await?;
                serde_json::to_value(event)?
            }
            Method::Count => {
                let filters: Vec<Filter> = params.required(0)?;
                json!(orchestrator.count(&filters).await?)
            }
            Method::Filters | Method::Subscribe => {
                let stream_id: StreamId = params.required(0)?;
                let filters: Vec<Filter> = params.required(1)?;
                self.open_stream(session, method, stream_id, filters, request.params.clone())
                    .await?
            }
            Method::CloseStream => {
                let stream_id: StreamId = params.required(0)?;
                json!(self.registry.close_stream(&stream_id).await)
            }
            Method::Supports => {
                let capabilities: Vec<Capability> =
                    orchestrator.supports().await?.into_iter().collect();
                serde_json::to_value(capabilities)?
            }
            Method::SetBackend => {
                let id: String = params.required(0)?;
                json!(orchestrator.set_active_provider_preference(&id).await?)
            }
            Method::GetBackend => json!(orchestrator.current_provider_id()),
            Method::GetBackendStatus => serde_json::to_value(BackendStatus {
                current: orchestrator.current_provider_id(),
                preferred: orchestrator.preferred_provider_id(),
                connected: orchestrator.is_connected(),
                health_check_running: orchestrator.is_health_check_running(),
                providers: orchestrator.status(),
            })?,
            Method::GetBackends => serde_json::to_value(orchestrator.status())?,
            Method::ReconnectBackends => json!(orchestrator.reconnect().await),
            Method::IsBackendConnected => json!(orchestrator.is_connected()),
        };
        Ok(result)
    }

    /// Register the stream, start it, and acknowledge
    ///
    /// The descriptor exists before the provider call so an early
    /// `close_stream` finds it. If the start fails the descriptor is removed
    /// and the error is returned as the response.
    async fn open_stream(
        &self,
        session: &Session,
        method: Method,
        stream_id: StreamId,
        filters: Vec<Filter>,
        params: Vec<Value>,
    ) -> Result<Value> {
        self.registry.open(
            stream_id.clone(),
            method,
            params,
            session.id.clone(),
            session.outbound.clone(),
        )?;
        let handler = self.registry.handler(&stream_id);

        let started = match method {
            Method::Subscribe => self.orchestrator.subscribe(&filters, handler).await,
            _ => self.orchestrator.filters(&filters, handler).await,
        };

        match started {
            Ok(subscription) => {
                self.registry.attach(&stream_id, subscription).await;
                Ok(json!({ "streamId": stream_id }))
            }
            Err(e) => {
                self.registry.remove(&stream_id);
                Err(e)
            }
        }
    }
}
