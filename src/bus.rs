//! The external request bus: the executor's only doorway to side effects.
//!
//! The executor never inspects request or response internals. A
//! [`FlowRequest`] is an opaque `{kind, payload}` pair and responses are raw
//! JSON values; `Send` steps carry the projection that folds a response back
//! into state. Hosts implement [`RequestBus`] over whatever dispatch
//! mechanism they actually use (a mediator, an HTTP client, a message
//! broker).

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

/// An opaque request handed to the host's dispatch bus.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowRequest {
    /// Routing key understood by the host bus.
    pub kind: String,
    /// Opaque request body.
    pub payload: Value,
}

impl FlowRequest {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// A request with no body, for fire-and-forget notifications.
    pub fn notification(kind: impl Into<String>) -> Self {
        Self::new(kind, Value::Null)
    }
}

/// Failure surfaced by the host bus for a dispatched request.
///
/// The `kind` of a rejection is what `Catch` clauses match against, so hosts
/// should keep kinds stable and machine-matchable.
#[derive(Clone, Debug, Error, Diagnostic, PartialEq, Eq)]
pub enum BusError {
    #[error("{kind}: {message}")]
    #[diagnostic(code(flowstitch::bus::rejected))]
    Rejected { kind: String, message: String },

    #[error("request bus unavailable: {message}")]
    #[diagnostic(
        code(flowstitch::bus::unavailable),
        help("The dispatch backend is unreachable; the flow can be resumed once it recovers.")
    )]
    Unavailable { message: String },
}

impl BusError {
    pub fn rejected(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// The machine-matchable failure kind used by `Catch` clauses.
    pub fn kind(&self) -> &str {
        match self {
            BusError::Rejected { kind, .. } => kind,
            BusError::Unavailable { .. } => "bus-unavailable",
        }
    }
}

/// Host-side dispatch of side-effecting requests.
#[async_trait]
pub trait RequestBus: Send + Sync {
    /// Dispatch a request and await its response payload.
    async fn dispatch(&self, request: FlowRequest) -> Result<Value, BusError>;

    /// Dispatch a request whose response carries no information.
    async fn notify(&self, request: FlowRequest) -> Result<(), BusError> {
        self.dispatch(request).await.map(|_| ())
    }
}
