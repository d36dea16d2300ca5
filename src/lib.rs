#![doc = include_str!("../README.md")]

pub mod config;
mod consumer;
pub mod delivery;
pub mod envelope;
pub mod gateway;
pub mod handler;
pub mod transport;

#[doc(inline)]
pub use envelope::{DeliveryMode, Envelope, EnvelopeOptions};

#[doc(inline)]
pub use config::{BrokerConfig, ConfigError, ConfigErrorKind};

#[doc(inline)]
pub use delivery::{BrokerChannel, Delivery, DeliveryContext, Disposition};

#[doc(inline)]
pub use gateway::{DefaultGatewayHook, Gateway, GatewayError, GatewayErrorKind, GatewayHook};

#[doc(inline)]
pub use handler::{
    DefaultHandlerHook, HandlerHook, InboundHandler, InboundMessage, PassThrough,
    ProcessingError, ProcessingErrorKind,
};

#[doc(inline)]
pub use transport::{BrokerClient, TransportError, TransportErrorKind};

#[doc(inline)]
pub use consumer::{Consumer, ConsumerHook, ConsumerRunError, DefaultConsumerHook};
