//! Inbound delivery abstractions.
//!
//! A broker hands each consumed message to the crate as a [`Delivery`]: the
//! decoded JSON payload plus a [`DeliveryContext`] giving access to the
//! channel the message arrived on and to the broker's handle for it. The
//! [`InboundHandler`](crate::InboundHandler) uses the context to settle the
//! message exactly once.

/// Channel capable of settling deliveries.
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Broker handle identifying one delivery (e.g. an AMQP delivery tag).
    type Handle: std::fmt::Debug + Send + Sync;
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Confirm consumption, removing the message from the queue.
    async fn ack(&self, message: &Self::Handle) -> Result<(), Self::Error>;

    /// Refuse the message.
    ///
    /// `message` is `None` when the handle could not be obtained from the
    /// delivery; backends decide how to treat such a reject.
    async fn reject(
        &self,
        message: Option<&Self::Handle>,
        requeue: bool,
        multiple: bool,
    ) -> Result<(), Self::Error>;
}

/// Per-delivery access to the broker channel and raw message handle.
///
/// Both accessors are fallible: a failure is treated as a processing failure
/// of the delivery.
pub trait DeliveryContext: Send + Sync {
    /// Channel the delivery arrived on.
    type Channel: BrokerChannel;

    /// Return the channel used to settle this delivery.
    fn channel(&self) -> Result<&Self::Channel, tower::BoxError>;

    /// Return the broker handle of this delivery.
    fn raw_message(&self) -> Result<<Self::Channel as BrokerChannel>::Handle, tower::BoxError>;
}

/// A message delivered by the broker.
pub trait Delivery: Send {
    /// Context used to settle the delivery.
    type Context: DeliveryContext;

    /// Split the delivery into its JSON payload and its context.
    ///
    /// Payloads that cannot be decoded are returned as `Value::Null`.
    fn into_parts(self) -> (serde_json::Value, Self::Context);
}

/// Terminal state reached by one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Malformed message, left unsettled.
    Dropped,
    /// Processed and acknowledged.
    Acknowledged,
    /// Processing failed, rejected without requeue.
    Rejected,
}
