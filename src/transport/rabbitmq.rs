use std::{
    future::Future,
    sync::{Arc, OnceLock},
};

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use lapin::{
    BasicProperties, Connection, ConnectionProperties,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::{FieldTable, ShortString},
};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::StreamExt as _;

use crate::{
    Envelope,
    config::BrokerConfig,
    delivery::{BrokerChannel, Delivery, DeliveryContext},
    transport::{BrokerClient, TransportError},
};

/// RabbitMQ broker client.
///
/// ## Design
///
/// - Connects to the first reachable URL of the [`BrokerConfig`]
/// - Declares the configured queue with its durability flag and applies the
///   prefetch count to the channel
/// - Publishes JSON envelopes to the configured exchange, using the envelope
///   pattern as routing key and its delivery mode as AMQP `delivery-mode`
/// - Consumes the configured queue in manual acknowledgment mode
///
/// The channel is wrapped in `Arc<Mutex<_>>` because:
/// - `lapin::Channel` is not `Sync`
/// - a background publisher task shares it with consumers settling deliveries
///
/// Publishes are queued to that single task, so they reach the broker in the
/// order `emit` was called.
#[derive(Clone)]
pub struct RabbitMq {
    config: Arc<BrokerConfig>,
    session: Arc<OnceLock<Session>>,
}

struct Session {
    /// Kept to hold the connection open.
    _connection: Mutex<Connection>,
    channel: Arc<Mutex<lapin::Channel>>,
    publisher: Publisher,
}

impl RabbitMq {
    /// Create an unconnected client.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config: Arc::new(config),
            session: Arc::new(OnceLock::new()),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Start consuming the configured queue.
    ///
    /// Deliveries must be settled explicitly, typically by feeding the
    /// returned stream to a [`Consumer`](crate::Consumer).
    #[tracing::instrument(skip(self), fields(queue = %self.config.queue))]
    pub async fn consume(
        &self,
        consumer_tag: &str,
    ) -> Result<BoxStream<'static, Result<RabbitMqDelivery, lapin::Error>>, TransportError> {
        let session = self.session.get().ok_or_else(TransportError::not_connected)?;

        let consumer = session
            .channel
            .lock()
            .await
            .basic_consume(
                &self.config.queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::connect(Box::new(e)))?;

        let channel = RabbitMqChannel {
            channel: Arc::clone(&session.channel),
        };

        Ok(Box::pin(consumer.map(move |delivery| {
            delivery.map(|delivery| RabbitMqDelivery {
                delivery,
                channel: channel.clone(),
            })
        })))
    }

    async fn open(&self, url: &str) -> Result<Session, lapin::Error> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .queue_declare(
                &self.config.queue,
                QueueDeclareOptions {
                    durable: self.config.queue_durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await?;

        let channel = Arc::new(Mutex::new(channel));
        let publisher = {
            let channel = Arc::clone(&channel);
            let exchange = self.config.exchange.clone();
            Publisher::spawn(move |outgoing: Outgoing| {
                let channel = Arc::clone(&channel);
                let exchange = exchange.clone();
                async move {
                    let channel = channel.lock().await;
                    if let Err(error) = channel
                        .basic_publish(
                            &exchange,
                            &outgoing.routing_key,
                            BasicPublishOptions::default(),
                            &outgoing.body,
                            outgoing.properties,
                        )
                        .await
                    {
                        tracing::error!(
                            %error,
                            routing_key = %outgoing.routing_key,
                            "Failed to publish message"
                        );
                    }
                }
            })
        };

        Ok(Session {
            _connection: Mutex::new(connection),
            channel,
            publisher,
        })
    }
}

/// Message waiting to be published.
struct Outgoing {
    routing_key: String,
    body: Vec<u8>,
    properties: BasicProperties,
}

/// Handle to the task publishing [`Outgoing`] messages one at a time.
///
/// The task stops once every handle is dropped.
#[derive(Clone)]
struct Publisher {
    sender: mpsc::UnboundedSender<Outgoing>,
}

impl Publisher {
    fn spawn<F, Fut>(mut publish: F) -> Self
    where
        F: FnMut(Outgoing) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(outgoing) = receiver.recv().await {
                publish(outgoing).await;
            }
        });
        Self { sender }
    }

    fn publish(&self, outgoing: Outgoing) -> Result<(), TransportError> {
        self.sender
            .send(outgoing)
            .map_err(|_| TransportError::sender("publisher task has stopped".into()))
    }
}

#[async_trait]
impl BrokerClient for RabbitMq {
    type Error = TransportError;

    /// Connect to the first reachable broker URL.
    ///
    /// Calling `connect` on a connected client does nothing.
    #[tracing::instrument(skip(self), fields(queue = %self.config.queue))]
    async fn connect(&self) -> Result<(), Self::Error> {
        if self.session.get().is_some() {
            return Ok(());
        }

        let mut last_error: Option<tower::BoxError> = None;
        for (index, url) in self.config.urls.iter().enumerate() {
            match self.open(url).await {
                Ok(session) => {
                    tracing::info!(index, "Connected to RabbitMQ");
                    // Another task may have connected meanwhile; its session wins.
                    let _ = self.session.set(session);
                    return Ok(());
                }
                Err(error) => {
                    tracing::warn!(index, %error, "RabbitMQ node unreachable");
                    last_error = Some(Box::new(error));
                }
            }
        }

        Err(TransportError::connect(
            last_error.unwrap_or_else(|| "no broker URL configured".into()),
        ))
    }

    /// Publish an envelope without waiting for the broker.
    ///
    /// ## Mapping
    ///
    /// - `routing_key` → AMQP routing key on the configured exchange
    /// - `envelope.options.delivery_mode` → AMQP `delivery-mode`
    /// - JSON-serialized `envelope` → message body
    ///
    /// Serialization and connection state are checked before returning;
    /// the publish itself runs on the background publisher task and only
    /// logs failures.
    fn emit(&self, routing_key: &str, envelope: Envelope) -> Result<(), Self::Error> {
        let session = self.session.get().ok_or_else(TransportError::not_connected)?;
        let body = serde_json::to_vec(&envelope).map_err(|e| TransportError::serde(Box::new(e)))?;

        let properties = BasicProperties::default()
            .with_delivery_mode(envelope.delivery_mode().code())
            .with_content_type(ShortString::from("application/json"));

        session.publisher.publish(Outgoing {
            routing_key: routing_key.to_owned(),
            body,
            properties,
        })
    }
}

/// Channel settling RabbitMQ deliveries by delivery tag.
#[derive(Clone)]
pub struct RabbitMqChannel {
    channel: Arc<Mutex<lapin::Channel>>,
}

#[async_trait]
impl BrokerChannel for RabbitMqChannel {
    type Handle = u64;
    type Error = TransportError;

    async fn ack(&self, message: &u64) -> Result<(), Self::Error> {
        self.channel
            .lock()
            .await
            .basic_ack(*message, BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::sender(Box::new(e)))
    }

    /// Send `basic.nack` for the delivery.
    ///
    /// A reject without delivery tag cannot be expressed in AMQP and fails.
    async fn reject(
        &self,
        message: Option<&u64>,
        requeue: bool,
        multiple: bool,
    ) -> Result<(), Self::Error> {
        let tag = delivery_tag(message)?;

        self.channel
            .lock()
            .await
            .basic_nack(tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|e| TransportError::sender(Box::new(e)))
    }
}

fn delivery_tag(message: Option<&u64>) -> Result<u64, TransportError> {
    message
        .copied()
        .ok_or_else(|| TransportError::sender("missing delivery tag".into()))
}

/// One message consumed from RabbitMQ.
pub struct RabbitMqDelivery {
    delivery: lapin::message::Delivery,
    channel: RabbitMqChannel,
}

impl Delivery for RabbitMqDelivery {
    type Context = RabbitMqContext;

    fn into_parts(self) -> (serde_json::Value, Self::Context) {
        (
            decode_body(&self.delivery.data),
            RabbitMqContext {
                tag: self.delivery.delivery_tag,
                channel: self.channel,
            },
        )
    }
}

/// Decode a JSON delivery body; undecodable bodies become `null`.
fn decode_body(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body).unwrap_or_else(|error| {
        tracing::warn!(%error, "Delivery body is not valid JSON");
        serde_json::Value::Null
    })
}

/// Delivery context of a [`RabbitMqDelivery`].
pub struct RabbitMqContext {
    tag: u64,
    channel: RabbitMqChannel,
}

impl DeliveryContext for RabbitMqContext {
    type Channel = RabbitMqChannel;

    fn channel(&self) -> Result<&Self::Channel, tower::BoxError> {
        Ok(&self.channel)
    }

    fn raw_message(&self) -> Result<u64, tower::BoxError> {
        Ok(self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeliveryMode, transport::TransportErrorKind};

    #[tokio::test]
    async fn unconnected_client_refuses_to_emit_or_consume() {
        let client = RabbitMq::new(BrokerConfig::new("amqp://127.0.0.1:5672", "jobs"));

        let err = client
            .emit(
                "jobs",
                Envelope::new("jobs", serde_json::json!({}), DeliveryMode::Persistent),
            )
            .unwrap_err();
        assert!(matches!(err.kind(), TransportErrorKind::NotConnected));

        let err = client.consume("worker").await.err().unwrap();
        assert!(matches!(err.kind(), TransportErrorKind::NotConnected));
    }

    #[tokio::test]
    async fn connect_without_urls_fails() {
        let mut config = BrokerConfig::new("amqp://127.0.0.1:5672", "jobs");
        config.urls.clear();

        let err = RabbitMq::new(config).connect().await.unwrap_err();

        assert!(matches!(err.kind(), TransportErrorKind::Connect(_)));
        assert!(err.to_string().contains("no broker URL configured"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn publisher_keeps_emit_order() {
        const COUNT: usize = 100;

        let published = Arc::new(std::sync::Mutex::new(Vec::new()));
        let publisher = {
            let published = Arc::clone(&published);
            Publisher::spawn(move |outgoing: Outgoing| {
                let published = Arc::clone(&published);
                async move {
                    tokio::task::yield_now().await;
                    published.lock().unwrap().push(outgoing.routing_key);
                }
            })
        };

        // Emit from a worker thread, where newly spawned tasks jump the queue.
        tokio::spawn(async move {
            for n in 0..COUNT {
                publisher
                    .publish(Outgoing {
                        routing_key: n.to_string(),
                        body: Vec::new(),
                        properties: BasicProperties::default(),
                    })
                    .unwrap();
            }
        })
        .await
        .unwrap();

        while published.lock().unwrap().len() < COUNT {
            tokio::task::yield_now().await;
        }

        let expected: Vec<String> = (0..COUNT).map(|n| n.to_string()).collect();
        assert_eq!(*published.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn stopped_publisher_reports_sender_error() {
        let publisher = Publisher::spawn(|_outgoing: Outgoing| async {});
        let (sender, receiver) = mpsc::unbounded_channel();
        drop(receiver);
        let stopped = Publisher { sender };

        assert!(
            publisher
                .publish(Outgoing {
                    routing_key: "jobs".into(),
                    body: Vec::new(),
                    properties: BasicProperties::default(),
                })
                .is_ok()
        );

        let err = stopped
            .publish(Outgoing {
                routing_key: "jobs".into(),
                body: Vec::new(),
                properties: BasicProperties::default(),
            })
            .unwrap_err();
        assert!(matches!(err.kind(), TransportErrorKind::Sender(_)));
    }

    #[test]
    fn undecodable_bodies_become_null() {
        assert_eq!(decode_body(&[0xff, 0xfe, 0x00]), serde_json::Value::Null);
        assert_eq!(decode_body(b"not json"), serde_json::Value::Null);
        assert_eq!(decode_body(b""), serde_json::Value::Null);
        assert_eq!(
            decode_body(br#"{"pattern":"jobs","data":{"id":1}}"#),
            serde_json::json!({ "pattern": "jobs", "data": { "id": 1 } })
        );
    }

    #[test]
    fn reject_without_delivery_tag_is_refused() {
        assert_eq!(delivery_tag(Some(&9)).unwrap(), 9);

        let err = delivery_tag(None).unwrap_err();
        assert!(matches!(err.kind(), TransportErrorKind::Sender(_)));
        assert!(err.to_string().contains("missing delivery tag"));
    }
}
