//! Consumer loop feeding broker deliveries to an inbound handler.
//!
//! This module implements a generic consumer that:
//!
//! - Pulls deliveries from a broker stream
//! - Hands each one to an [`InboundHandler`]
//! - Waits for the handler to settle a delivery before pulling the next one
//! - Exposes lifecycle hooks for observability and customization
//!
//! Handling deliveries one at a time matches a prefetch count of one: the
//! broker never has more than a single unacknowledged message in flight for
//! this consumer.
//!
//! The consumer runs until:
//! - The delivery stream ends
//! - The stream yields an error
//! - A [`CancellationToken`] is triggered

use futures_core::Stream;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::{
    delivery::{Delivery, Disposition},
    handler::{HandlerHook, InboundHandler, InboundMessage},
};

/// Delivery consumer.
///
/// Generic parameters:
/// - `P`: Processor used by the handler
/// - `HK`: Hook implementation of the handler
/// - `CHK`: Hook implementation for consumer lifecycle events
pub struct Consumer<P, HK, CHK = DefaultConsumerHook> {
    handler: InboundHandler<P, HK>,
    hook: CHK,
}

impl<P, HK> Consumer<P, HK, DefaultConsumerHook> {
    /// Create a new consumer with the default hook implementation.
    pub fn new(handler: InboundHandler<P, HK>) -> Self {
        Self {
            handler,
            hook: DefaultConsumerHook,
        }
    }
}

impl<P, HK, CHK> Consumer<P, HK, CHK>
where
    P: Service<InboundMessage, Response = ()> + Clone + Send + 'static,
    P::Error: Into<tower::BoxError>,
    P::Future: Send,
    HK: HandlerHook,
    CHK: ConsumerHook,
{
    /// Replace the consumer hook.
    pub fn with_hook<CHK2: ConsumerHook>(self, hook: CHK2) -> Consumer<P, HK, CHK2> {
        Consumer {
            handler: self.handler,
            hook,
        }
    }

    /// Run the consumer loop.
    ///
    /// The consumer:
    /// - Pulls deliveries from `deliveries` in order
    /// - Handles each delivery to completion before pulling the next
    /// - Stops on cancellation, stream end, or stream error
    ///
    /// Cancellation is only observed between deliveries, so a message being
    /// handled is always settled.
    #[tracing::instrument(skip_all, fields(queue = %self.handler.pattern()))]
    pub async fn run<S, D, E>(
        self,
        mut deliveries: S,
        cancel: CancellationToken,
    ) -> Result<(), ConsumerRunError>
    where
        S: Stream<Item = Result<D, E>> + Unpin,
        D: Delivery,
        E: Into<tower::BoxError>,
    {
        self.hook.on_startup();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    self.hook.on_shutdown();
                    return Ok(());
                }
                delivery = deliveries.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            self.hook.on_delivery();
                            let (payload, ctx) = delivery.into_parts();
                            let disposition = self.handler.handle(payload, &ctx).await;
                            self.hook.on_settled(disposition);
                        }
                        Some(Err(err)) => {
                            let err: tower::BoxError = err.into();
                            self.hook.on_receive_error(err.as_ref());
                            return Err(ConsumerRunError::stream(err));
                        }
                        None => {
                            self.hook.on_stream_end();
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

/// Error returned when the consumer loop fails.
#[derive(Debug)]
pub struct ConsumerRunError {
    context: tracing_error::SpanTrace,
    source: tower::BoxError,
}

impl ConsumerRunError {
    fn stream(source: tower::BoxError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            source,
        }
    }
}

impl std::fmt::Display for ConsumerRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Delivery stream error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConsumerRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Hook trait for observing consumer lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
pub trait ConsumerHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_delivery(&self);
    fn on_settled(&self, disposition: Disposition);
    fn on_receive_error(&self, error: &dyn std::error::Error);
    fn on_stream_end(&self);
}

/// Default consumer hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultConsumerHook;

impl ConsumerHook for DefaultConsumerHook {
    fn on_startup(&self) {
        tracing::info!("Consumer is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Consumer is shutting down");
    }

    fn on_delivery(&self) {
        tracing::debug!("Delivery received");
    }

    fn on_settled(&self, disposition: Disposition) {
        tracing::debug!(?disposition, "Delivery settled");
    }

    fn on_receive_error(&self, error: &dyn std::error::Error) {
        tracing::error!(%error, "Error receiving delivery");
    }

    fn on_stream_end(&self) {
        tracing::info!("Delivery stream ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Gateway,
        transport::{InMemory, Settlement},
    };
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingHook(Arc<Mutex<Vec<String>>>);

    impl RecordingHook {
        fn events(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl ConsumerHook for RecordingHook {
        fn on_startup(&self) {
            self.0.lock().unwrap().push("startup".into());
        }

        fn on_shutdown(&self) {
            self.0.lock().unwrap().push("shutdown".into());
        }

        fn on_delivery(&self) {}

        fn on_settled(&self, disposition: Disposition) {
            self.0.lock().unwrap().push(format!("{disposition:?}"));
        }

        fn on_receive_error(&self, error: &dyn std::error::Error) {
            self.0.lock().unwrap().push(format!("receive error {error}"));
        }

        fn on_stream_end(&self) {
            self.0.lock().unwrap().push("end".into());
        }
    }

    #[tokio::test]
    async fn published_messages_are_consumed_in_order() {
        let broker = InMemory::default();
        let gateway = Gateway::new(broker.clone());
        gateway.bootstrap().await.unwrap();

        let deliveries = broker.consume("orders");
        gateway.publish("orders", json!({ "n": 1 })).unwrap();
        gateway.publish_with_mode("orders", json!({ "n": 2 }), 1).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let processor = {
            let seen = seen.clone();
            tower::service_fn(move |msg: InboundMessage| {
                seen.lock().unwrap().push(msg.data().cloned());
                async { Ok::<(), std::convert::Infallible>(()) }
            })
        };
        let hook = RecordingHook::default();
        let consumer = Consumer::new(InboundHandler::new("orders").with_processor(processor))
            .with_hook(hook.clone());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(deliveries, cancel.clone()));

        while broker.channel().settlements().len() < 2 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(
            broker.channel().settlements(),
            vec![Settlement::Ack { tag: 1 }, Settlement::Ack { tag: 2 }]
        );
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some(json!({ "n": 1 })), Some(json!({ "n": 2 }))]
        );
        assert_eq!(
            hook.events(),
            vec!["startup", "Acknowledged", "Acknowledged", "shutdown"]
        );
    }

    #[tokio::test]
    async fn malformed_and_failing_messages_get_their_disposition() {
        let channel = crate::transport::InMemoryChannel::default();
        let deliveries = tokio_stream::iter(vec![
            Ok::<_, std::convert::Infallible>(TestDelivery(json!(null), channel.clone(), 1)),
            Ok(TestDelivery(json!({ "pattern": "fail" }), channel.clone(), 2)),
            Ok(TestDelivery(json!({ "pattern": "ok" }), channel.clone(), 3)),
        ]);
        let processor = tower::service_fn(|msg: InboundMessage| async move {
            if msg.pattern() == "fail" {
                return Err(std::io::Error::other("cannot process"));
            }
            Ok(())
        });
        let hook = RecordingHook::default();

        Consumer::new(InboundHandler::new("jobs").with_processor(processor))
            .with_hook(hook.clone())
            .run(deliveries, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            channel.settlements(),
            vec![
                Settlement::Reject {
                    tag: Some(2),
                    requeue: false,
                    multiple: false
                },
                Settlement::Ack { tag: 3 },
            ]
        );
        assert_eq!(
            hook.events(),
            vec!["startup", "Dropped", "Rejected", "Acknowledged", "end"]
        );
    }

    #[tokio::test]
    async fn stream_errors_stop_the_consumer() {
        let deliveries = tokio_stream::iter(vec![Err::<TestDelivery, _>(std::io::Error::other(
            "connection reset",
        ))]);
        let hook = RecordingHook::default();

        let err = Consumer::new(InboundHandler::new("jobs"))
            .with_hook(hook.clone())
            .run(deliveries, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("connection reset"));
        assert_eq!(hook.events(), vec!["startup", "receive error connection reset"]);
    }

    #[tokio::test]
    async fn cancelled_consumer_stops_without_pulling() {
        let broker = InMemory::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let hook = RecordingHook::default();

        Consumer::new(InboundHandler::new("idle"))
            .with_hook(hook.clone())
            .run(broker.consume("idle"), cancel)
            .await
            .unwrap();

        assert_eq!(hook.events(), vec!["startup", "shutdown"]);
    }

    struct TestDelivery(serde_json::Value, crate::transport::InMemoryChannel, u64);

    struct TestContext(crate::transport::InMemoryChannel, u64);

    impl crate::delivery::DeliveryContext for TestContext {
        type Channel = crate::transport::InMemoryChannel;

        fn channel(&self) -> Result<&Self::Channel, tower::BoxError> {
            Ok(&self.0)
        }

        fn raw_message(&self) -> Result<u64, tower::BoxError> {
            Ok(self.1)
        }
    }

    impl Delivery for TestDelivery {
        type Context = TestContext;

        fn into_parts(self) -> (serde_json::Value, TestContext) {
            (self.0, TestContext(self.1, self.2))
        }
    }
}
