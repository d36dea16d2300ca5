//! Broker client abstractions and backends.
//!
//! This module defines the [`BrokerClient`] seam used by the
//! [`Gateway`](crate::Gateway) to reach a broker, together with the
//! concrete backends shipped with the crate.
//!
//! ## Key components
//!
//! - [`BrokerClient`]: Trait implemented by broker backends
//! - [`InMemory`]: In-process broker for tests and local pipelines
//! - `RabbitMq`: AMQP backend built on `lapin` (feature `rabbitmq`)
//! - [`TransportError`]: Unified error type with tracing context

mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use tracing_error::SpanTrace;

use crate::Envelope;

pub use inmemory::{InMemory, InMemoryChannel, InMemoryContext, InMemoryDelivery, Settlement};

/// Trait implemented by concrete broker backends.
///
/// A client owns the connection to the broker. Publishing is
/// fire-and-forget: [`emit`](BrokerClient::emit) returns as soon as the
/// envelope has been handed over and never waits for the broker to confirm
/// receipt.
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Establish the broker connection.
    async fn connect(&self) -> Result<(), Self::Error>;

    /// Hand an envelope to the broker, addressed to `routing_key`.
    ///
    /// Errors raised while handing the envelope over are returned; failures
    /// that happen after the handoff are only logged.
    fn emit(&self, routing_key: &str, envelope: Envelope) -> Result<(), Self::Error>;
}

/// Error returned by transport backends.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// The client was used before a connection was established.
    NotConnected,
    /// Errors raised while connecting to the broker.
    Connect(tower::BoxError),
    /// Errors originating from the sender backend.
    Sender(tower::BoxError),
    /// Errors related to serialization or deserialization.
    Serde(tower::BoxError),
}

impl TransportError {
    /// Create an error for a client that has not been connected.
    pub fn not_connected() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::NotConnected,
        }
    }

    /// Create a connection-related transport error.
    pub fn connect(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Connect(err),
        }
    }

    /// Create a sender-related transport error.
    pub fn sender(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Sender(err),
        }
    }

    /// Create a serialization-related transport error.
    pub fn serde(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Serde(err),
        }
    }

    /// Kind of failure.
    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::NotConnected => writeln!(f, "Broker client is not connected"),
            TransportErrorKind::Connect(err) => writeln!(f, "Connection error: {err}"),
            TransportErrorKind::Sender(err) => writeln!(f, "Sender error: {err}"),
            TransportErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::NotConnected => None,
            TransportErrorKind::Connect(err) => Some(err.as_ref()),
            TransportErrorKind::Sender(err) => Some(err.as_ref()),
            TransportErrorKind::Serde(err) => Some(err.as_ref()),
        }
    }
}
