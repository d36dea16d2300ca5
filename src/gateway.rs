//! Outbound gateway validating and publishing envelopes.
//!
//! The [`Gateway`] is the single entry point for publishing. Every publish
//! request is validated before anything reaches the broker:
//!
//! 1. The payload must be a composite JSON value (object or array)
//! 2. The pattern must contain something other than whitespace
//! 3. The delivery mode must be `1` (non-persistent) or `2` (persistent)
//!
//! The first violated rule is reported. Valid requests are wrapped in an
//! [`Envelope`] and handed to the [`BrokerClient`] without waiting for a
//! broker confirmation.

use serde_json::Value;
use tracing_error::SpanTrace;

use crate::{DeliveryMode, Envelope, transport::BrokerClient};

/// Outbound gateway.
///
/// Generic parameters:
/// - `C`: Broker client used to emit envelopes
/// - `HK`: Hook implementation for lifecycle events
pub struct Gateway<C, HK = DefaultGatewayHook> {
    client: C,
    hook: HK,
}

impl<C> Gateway<C, DefaultGatewayHook>
where
    C: BrokerClient,
{
    /// Create a new gateway with the default hook implementation.
    pub fn new(client: C) -> Self {
        Self {
            client,
            hook: DefaultGatewayHook,
        }
    }
}

impl<C, HK> Gateway<C, HK>
where
    C: BrokerClient,
    HK: GatewayHook,
{
    /// Replace the gateway hook.
    pub fn with_hook<HK2: GatewayHook>(self, hook: HK2) -> Gateway<C, HK2> {
        Gateway {
            client: self.client,
            hook,
        }
    }

    /// Underlying broker client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Establish the broker connection.
    ///
    /// Must complete before publishing. A connection failure is returned to
    /// the caller and is meant to abort application startup.
    #[tracing::instrument(skip(self))]
    pub async fn bootstrap(&self) -> Result<(), GatewayError> {
        self.hook.on_connecting();

        match self.client.connect().await {
            Ok(()) => {
                self.hook.on_connected();
                Ok(())
            }
            Err(e) => {
                let err = GatewayError::connection(e.into());
                self.hook.on_connect_error(&err);
                Err(err)
            }
        }
    }

    /// Publish `data` on `pattern` as a persistent message.
    pub fn publish(&self, pattern: &str, data: Value) -> Result<(), GatewayError> {
        self.publish_with_mode(pattern, data, DeliveryMode::Persistent.code().into())
    }

    /// Publish `data` on `pattern` with an explicit AMQP delivery mode code.
    #[tracing::instrument(skip(self, data))]
    pub fn publish_with_mode(
        &self,
        pattern: &str,
        data: Value,
        delivery_mode: i64,
    ) -> Result<(), GatewayError> {
        let delivery_mode = validate(pattern, &data, delivery_mode)?;
        let envelope = Envelope::new(pattern, data, delivery_mode);

        self.hook.on_publish(&envelope);

        self.client.emit(pattern, envelope).map_err(|e| {
            let err = GatewayError::emit(e.into());
            self.hook.on_emit_error(&err);
            err
        })
    }

    /// Serialize `data` to JSON and publish it as a persistent message.
    pub fn publish_json<T>(&self, pattern: &str, data: &T) -> Result<(), GatewayError>
    where
        T: serde::Serialize + ?Sized,
    {
        let data = serde_json::to_value(data).map_err(GatewayError::unserializable_payload)?;
        self.publish(pattern, data)
    }
}

/// Check a publish request and return the delivery mode to use.
///
/// Rules are checked in order: payload, pattern, delivery mode.
pub fn validate(
    pattern: &str,
    data: &Value,
    delivery_mode: i64,
) -> Result<DeliveryMode, GatewayError> {
    if !matches!(data, Value::Object(_) | Value::Array(_)) {
        return Err(GatewayError::invalid_payload());
    }

    if pattern.trim().is_empty() {
        return Err(GatewayError::invalid_pattern());
    }

    DeliveryMode::try_from(delivery_mode).map_err(|e| GatewayError::invalid_delivery_mode(e.0))
}

/// Error returned by gateway operations.
#[derive(Debug)]
pub struct GatewayError {
    context: SpanTrace,
    kind: GatewayErrorKind,
    /// Cause of a validation failure, when there is one.
    cause: Option<tower::BoxError>,
}

/// Classification of gateway errors.
#[derive(Debug)]
pub enum GatewayErrorKind {
    /// The payload is null or a scalar.
    InvalidPayload,
    /// The pattern is empty or whitespace.
    InvalidPattern,
    /// The delivery mode is neither 1 nor 2.
    InvalidDeliveryMode(i64),
    /// The broker client refused the envelope.
    Emit(tower::BoxError),
    /// The broker could not be reached at startup.
    Connection(tower::BoxError),
}

impl GatewayError {
    fn new(kind: GatewayErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
            cause: None,
        }
    }

    fn invalid_payload() -> Self {
        Self::new(GatewayErrorKind::InvalidPayload)
    }

    fn unserializable_payload(error: serde_json::Error) -> Self {
        Self {
            cause: Some(Box::new(error)),
            ..Self::invalid_payload()
        }
    }

    fn invalid_pattern() -> Self {
        Self::new(GatewayErrorKind::InvalidPattern)
    }

    fn invalid_delivery_mode(mode: i64) -> Self {
        Self::new(GatewayErrorKind::InvalidDeliveryMode(mode))
    }

    fn emit(error: tower::BoxError) -> Self {
        Self::new(GatewayErrorKind::Emit(error))
    }

    fn connection(error: tower::BoxError) -> Self {
        Self::new(GatewayErrorKind::Connection(error))
    }

    /// Kind of failure.
    pub fn kind(&self) -> &GatewayErrorKind {
        &self.kind
    }

    /// Whether the request was refused before reaching the broker client.
    pub fn is_validation(&self) -> bool {
        matches!(
            self.kind,
            GatewayErrorKind::InvalidPayload
                | GatewayErrorKind::InvalidPattern
                | GatewayErrorKind::InvalidDeliveryMode(_)
        )
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            GatewayErrorKind::InvalidPayload => match &self.cause {
                Some(err) => writeln!(f, "The data must be a non-null object: {err}"),
                None => writeln!(f, "The data must be a non-null object"),
            },
            GatewayErrorKind::InvalidPattern => writeln!(f, "Pattern must be a non-empty string"),
            GatewayErrorKind::InvalidDeliveryMode(mode) => writeln!(
                f,
                "Delivery mode must be either 1 (non-persistent) or 2 (persistent), got {mode}"
            ),
            GatewayErrorKind::Emit(err) => writeln!(f, "Emit error: {err}"),
            GatewayErrorKind::Connection(err) => writeln!(f, "Connection error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            GatewayErrorKind::Emit(err) | GatewayErrorKind::Connection(err) => Some(err.as_ref()),
            _ => self
                .cause
                .as_ref()
                .map(|err| err.as_ref() as &(dyn std::error::Error + 'static)),
        }
    }
}

/// Hook trait for observing gateway events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
pub trait GatewayHook: Send + Sync {
    fn on_connecting(&self);
    fn on_connected(&self);
    fn on_connect_error(&self, error: &dyn std::error::Error);
    /// Called with the validated envelope right before it is emitted.
    fn on_publish(&self, envelope: &Envelope);
    fn on_emit_error(&self, error: &dyn std::error::Error);
}

/// Default gateway hook implementation.
///
/// Logs events using `tracing`.
pub struct DefaultGatewayHook;

impl GatewayHook for DefaultGatewayHook {
    fn on_connecting(&self) {
        tracing::info!("Connecting to broker");
    }

    fn on_connected(&self) {
        tracing::info!("Connected to broker");
    }

    fn on_connect_error(&self, error: &dyn std::error::Error) {
        tracing::error!(%error, "Failed to connect to broker");
    }

    fn on_publish(&self, envelope: &Envelope) {
        tracing::info!(
            pattern = %envelope.pattern,
            data = %envelope.data,
            delivery_mode = %envelope.delivery_mode(),
            "Sending message",
        );
    }

    fn on_emit_error(&self, error: &dyn std::error::Error) {
        tracing::error!(%error, "Error sending message");
    }
}
