use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use futures_core::Stream;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt as _, wrappers::UnboundedReceiverStream};

use crate::{
    Envelope,
    delivery::{BrokerChannel, Delivery, DeliveryContext},
    transport::{BrokerClient, TransportError},
};

/// In-memory broker for testing or local pipelines.
///
/// This broker keeps one in-process queue per pattern and implements
/// [`BrokerClient`]. It is useful for:
/// - Unit and integration testing
/// - Simulating publish/consume flows without a real broker
/// - Debugging message flows
///
/// Envelopes go through their JSON wire form on the way in, so consumers see
/// exactly what a real broker would deliver. Every ack and reject issued by
/// consumers is recorded on the shared [`InMemoryChannel`].
///
/// Queues are unbounded and created on first use, even for patterns nobody
/// consumes. Messages for such patterns, and the record returned by
/// [`sent_messages`](InMemory::sent_messages), are kept until read, so
/// memory grows with every emit. Not meant for long-running production use.
#[derive(Clone, Default)]
pub struct InMemory {
    state: Arc<State>,
}

#[derive(Default)]
struct State {
    connected: AtomicBool,
    next_tag: AtomicU64,
    sent: Mutex<Vec<(String, Envelope)>>,
    queues: Mutex<HashMap<String, Queue>>,
    channel: InMemoryChannel,
}

struct Queue {
    sender: mpsc::UnboundedSender<InMemoryDelivery>,
    receiver: Option<mpsc::UnboundedReceiver<InMemoryDelivery>>,
}

impl Queue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

impl InMemory {
    /// Subscribe to the queue bound to `pattern`.
    ///
    /// Messages emitted before the subscription are buffered and delivered
    /// first. Subscribing again to the same pattern ends the previous stream.
    pub fn consume(
        &self,
        pattern: &str,
    ) -> impl Stream<Item = Result<InMemoryDelivery, Infallible>> + Send + Unpin + use<> {
        let mut queues = lock(&self.state.queues);
        let queue = queues.entry(pattern.to_owned()).or_insert_with(Queue::new);
        let receiver = match queue.receiver.take() {
            Some(receiver) => receiver,
            None => {
                let (sender, receiver) = mpsc::unbounded_channel();
                queue.sender = sender;
                receiver
            }
        };
        UnboundedReceiverStream::new(receiver).map(Ok)
    }

    /// Return all messages emitted so far and clear the record.
    ///
    /// Each entry is the routing key together with the envelope.
    pub fn sent_messages(&self) -> Vec<(String, Envelope)> {
        std::mem::take(&mut *lock(&self.state.sent))
    }

    /// Channel recording the settlements of every delivery.
    pub fn channel(&self) -> InMemoryChannel {
        self.state.channel.clone()
    }

    /// Whether [`connect`](BrokerClient::connect) has been called.
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }
}

#[async_trait::async_trait]
impl BrokerClient for InMemory {
    type Error = TransportError;

    async fn connect(&self) -> Result<(), Self::Error> {
        self.state.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// "Send" an envelope by routing it to the in-memory queue of
    /// `routing_key`.
    #[tracing::instrument(skip(self, envelope))]
    fn emit(&self, routing_key: &str, envelope: Envelope) -> Result<(), Self::Error> {
        if !self.is_connected() {
            return Err(TransportError::not_connected());
        }

        let bytes = serde_json::to_vec(&envelope).map_err(|e| TransportError::serde(Box::new(e)))?;
        let payload = serde_json::from_slice(&bytes).map_err(|e| TransportError::serde(Box::new(e)))?;

        let delivery = InMemoryDelivery {
            tag: self.state.next_tag.fetch_add(1, Ordering::Relaxed) + 1,
            payload,
            channel: self.state.channel.clone(),
        };

        {
            let mut queues = lock(&self.state.queues);
            let queue = queues.entry(routing_key.to_owned()).or_insert_with(Queue::new);
            if let Err(mpsc::error::SendError(delivery)) = queue.sender.send(delivery) {
                // The previous subscriber went away, keep the message for the next one.
                *queue = Queue::new();
                let _ = queue.sender.send(delivery);
            }
        }

        tracing::info!(
            pattern = %envelope.pattern,
            data = %envelope.data,
            delivery_mode = %envelope.delivery_mode(),
            "Message sent to in-memory queue",
        );
        lock(&self.state.sent).push((routing_key.to_owned(), envelope));
        Ok(())
    }
}

/// One message consumed from an [`InMemory`] queue.
#[derive(Debug)]
pub struct InMemoryDelivery {
    tag: u64,
    payload: serde_json::Value,
    channel: InMemoryChannel,
}

impl InMemoryDelivery {
    /// Delivery tag, unique per broker and starting at 1.
    pub fn tag(&self) -> u64 {
        self.tag
    }
}

impl Delivery for InMemoryDelivery {
    type Context = InMemoryContext;

    fn into_parts(self) -> (serde_json::Value, Self::Context) {
        (
            self.payload,
            InMemoryContext {
                tag: self.tag,
                channel: self.channel,
            },
        )
    }
}

/// Delivery context of an [`InMemoryDelivery`].
#[derive(Debug, Clone)]
pub struct InMemoryContext {
    tag: u64,
    channel: InMemoryChannel,
}

impl DeliveryContext for InMemoryContext {
    type Channel = InMemoryChannel;

    fn channel(&self) -> Result<&Self::Channel, tower::BoxError> {
        Ok(&self.channel)
    }

    fn raw_message(&self) -> Result<u64, tower::BoxError> {
        Ok(self.tag)
    }
}

/// Settlement issued on an [`InMemoryChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack {
        tag: u64,
    },
    Reject {
        tag: Option<u64>,
        requeue: bool,
        multiple: bool,
    },
}

/// Channel that records settlements instead of talking to a broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryChannel {
    settlements: Arc<Mutex<Vec<Settlement>>>,
}

impl InMemoryChannel {
    /// Settlements issued so far, in call order.
    pub fn settlements(&self) -> Vec<Settlement> {
        lock(&self.settlements).clone()
    }
}

#[async_trait::async_trait]
impl BrokerChannel for InMemoryChannel {
    type Handle = u64;
    type Error = Infallible;

    async fn ack(&self, message: &u64) -> Result<(), Self::Error> {
        lock(&self.settlements).push(Settlement::Ack { tag: *message });
        Ok(())
    }

    async fn reject(
        &self,
        message: Option<&u64>,
        requeue: bool,
        multiple: bool,
    ) -> Result<(), Self::Error> {
        lock(&self.settlements).push(Settlement::Reject {
            tag: message.copied(),
            requeue,
            multiple,
        });
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
