//! Inbound handler validating and settling delivered messages.
//!
//! The [`InboundHandler`] is bound to one queue pattern. For every delivery
//! it:
//!
//! - Drops payloads that are not objects with a non-empty `pattern` field,
//!   leaving them unsettled
//! - Runs the configured processor on well-formed messages
//! - Acknowledges the delivery when processing succeeds
//! - Rejects the delivery without requeue when anything fails
//!
//! Errors never escape [`InboundHandler::handle`]; they are reported through
//! the [`HandlerHook`] and turned into a [`Disposition`].

use std::{
    convert::Infallible,
    future::{Ready, ready},
    task::{Context, Poll},
};

use serde_json::Value;
use tower::{Service, ServiceExt as _};
use tracing_error::SpanTrace;

use crate::delivery::{BrokerChannel, DeliveryContext, Disposition};

/// Well-formed inbound message handed to the processor.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pattern: String,
    payload: Value,
}

impl InboundMessage {
    /// Pattern carried by the message.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// `data` member of the payload, if any.
    pub fn data(&self) -> Option<&Value> {
        self.payload.get("data")
    }

    /// Whole decoded payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Consume the message, returning the whole decoded payload.
    pub fn into_payload(self) -> Value {
        self.payload
    }
}

/// Processor accepting every message without doing anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl Service<InboundMessage> for PassThrough {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: InboundMessage) -> Self::Future {
        ready(Ok(()))
    }
}

/// Inbound message handler.
///
/// Generic parameters:
/// - `P`: Processor, a `tower::Service` run on every well-formed message
/// - `HK`: Hook implementation for handling events
pub struct InboundHandler<P = PassThrough, HK = DefaultHandlerHook> {
    pattern: String,
    processor: P,
    hook: HK,
}

impl InboundHandler {
    /// Create a handler bound to `pattern` that acknowledges every
    /// well-formed message.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            processor: PassThrough,
            hook: DefaultHandlerHook,
        }
    }
}

impl<P, HK> InboundHandler<P, HK> {
    /// Replace the processor.
    ///
    /// The processor is cloned for every message. Returning an error from it
    /// rejects the message.
    pub fn with_processor<P2>(self, processor: P2) -> InboundHandler<P2, HK> {
        InboundHandler {
            pattern: self.pattern,
            processor,
            hook: self.hook,
        }
    }

    /// Replace the handler hook.
    pub fn with_hook<HK2: HandlerHook>(self, hook: HK2) -> InboundHandler<P, HK2> {
        InboundHandler {
            pattern: self.pattern,
            processor: self.processor,
            hook,
        }
    }

    /// Queue pattern this handler is bound to.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl<P, HK> InboundHandler<P, HK>
where
    P: Service<InboundMessage, Response = ()> + Clone + Send + 'static,
    P::Error: Into<tower::BoxError>,
    P::Future: Send,
    HK: HandlerHook,
{
    /// Handle one delivery and settle it through `ctx`.
    ///
    /// Returns the terminal state reached by the message. When the channel
    /// itself cannot be obtained no settlement is possible; the failure is
    /// reported and the message counts as rejected.
    #[tracing::instrument(skip_all, fields(queue = %self.pattern))]
    pub async fn handle<C>(&self, payload: Value, ctx: &C) -> Disposition
    where
        C: DeliveryContext,
    {
        let Some(pattern) = message_pattern(&payload) else {
            self.hook.on_invalid_message_format(&payload);
            return Disposition::Dropped;
        };

        self.hook.on_received(&payload);
        self.hook.on_processing(&pattern);

        let channel = match ctx.channel() {
            Ok(channel) => channel,
            Err(e) => {
                self.hook.on_processing_error(&ProcessingError::channel(e));
                return Disposition::Rejected;
            }
        };

        let message = InboundMessage {
            pattern: pattern.clone(),
            payload,
        };

        let outcome = match ctx.raw_message() {
            Ok(handle) => match self.process(message, channel, &handle).await {
                Ok(()) => Ok(()),
                Err(err) => Err((err, Some(handle))),
            },
            Err(e) => Err((ProcessingError::message(e), None)),
        };

        match outcome {
            Ok(()) => {
                self.hook.on_acknowledged(&pattern);
                Disposition::Acknowledged
            }
            Err((err, handle)) => {
                self.hook.on_processing_error(&err);
                if let Err(e) = channel.reject(handle.as_ref(), false, false).await {
                    let e: tower::BoxError = e.into();
                    self.hook.on_reject_error(e.as_ref());
                }
                Disposition::Rejected
            }
        }
    }

    async fn process<CH>(
        &self,
        message: InboundMessage,
        channel: &CH,
        handle: &CH::Handle,
    ) -> Result<(), ProcessingError>
    where
        CH: BrokerChannel,
    {
        self.processor
            .clone()
            .oneshot(message)
            .await
            .map_err(|e| ProcessingError::processor(e.into()))?;

        channel
            .ack(handle)
            .await
            .map_err(|e| ProcessingError::acknowledge(e.into()))
    }
}

/// Non-empty `pattern` of a well-formed payload.
fn message_pattern(payload: &Value) -> Option<String> {
    payload
        .as_object()?
        .get("pattern")?
        .as_str()
        .filter(|pattern| !pattern.is_empty())
        .map(str::to_owned)
}

/// Failure while processing a well-formed inbound message.
#[derive(Debug)]
pub struct ProcessingError {
    context: SpanTrace,
    kind: ProcessingErrorKind,
}

/// Step at which processing failed.
#[derive(Debug)]
pub enum ProcessingErrorKind {
    /// The delivery channel could not be obtained.
    Channel(tower::BoxError),
    /// The raw message handle could not be obtained.
    Message(tower::BoxError),
    /// The processor returned an error.
    Processor(tower::BoxError),
    /// The acknowledgment was refused.
    Acknowledge(tower::BoxError),
}

impl ProcessingError {
    fn new(kind: ProcessingErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    fn channel(error: tower::BoxError) -> Self {
        Self::new(ProcessingErrorKind::Channel(error))
    }

    fn message(error: tower::BoxError) -> Self {
        Self::new(ProcessingErrorKind::Message(error))
    }

    fn processor(error: tower::BoxError) -> Self {
        Self::new(ProcessingErrorKind::Processor(error))
    }

    fn acknowledge(error: tower::BoxError) -> Self {
        Self::new(ProcessingErrorKind::Acknowledge(error))
    }

    /// Step at which processing failed.
    pub fn kind(&self) -> &ProcessingErrorKind {
        &self.kind
    }

    /// Span trace captured when the failure happened.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.context
    }

    fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        match &self.kind {
            ProcessingErrorKind::Channel(err)
            | ProcessingErrorKind::Message(err)
            | ProcessingErrorKind::Processor(err)
            | ProcessingErrorKind::Acknowledge(err) => err.as_ref(),
        }
    }
}

impl std::fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ProcessingErrorKind::Channel(err) => writeln!(f, "Channel error: {err}"),
            ProcessingErrorKind::Message(err) => writeln!(f, "Message error: {err}"),
            ProcessingErrorKind::Processor(err) => writeln!(f, "Processor error: {err}"),
            ProcessingErrorKind::Acknowledge(err) => writeln!(f, "Acknowledge error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ProcessingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause())
    }
}

/// Hook trait for observing inbound handling.
///
/// Hooks are invoked synchronously and never influence how a message is
/// settled.
pub trait HandlerHook: Send + Sync {
    fn on_invalid_message_format(&self, payload: &Value);
    fn on_received(&self, payload: &Value);
    fn on_processing(&self, pattern: &str);
    fn on_acknowledged(&self, pattern: &str);
    fn on_processing_error(&self, error: &ProcessingError);
    fn on_reject_error(&self, error: &dyn std::error::Error);
}

/// Default handler hook implementation.
///
/// Logs events using `tracing`.
pub struct DefaultHandlerHook;

impl HandlerHook for DefaultHandlerHook {
    fn on_invalid_message_format(&self, payload: &Value) {
        tracing::error!(%payload, "Invalid message format received");
    }

    fn on_received(&self, payload: &Value) {
        tracing::info!(%payload, "Received message");
    }

    fn on_processing(&self, pattern: &str) {
        tracing::info!(pattern, "Processing message");
    }

    fn on_acknowledged(&self, pattern: &str) {
        tracing::debug!(pattern, "Message acknowledged");
    }

    fn on_processing_error(&self, error: &ProcessingError) {
        tracing::error!(
            error = %error.cause(),
            trace = %error.span_trace(),
            "Error processing message",
        );
    }

    fn on_reject_error(&self, error: &dyn std::error::Error) {
        tracing::error!(%error, "Failed to reject message");
    }
}
