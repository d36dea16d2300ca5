use std::time::Duration;

use letterbox::transport::rabbitmq::RabbitMq;
use letterbox::{BrokerConfig, Consumer, Gateway, InboundHandler, InboundMessage};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Serialize)]
struct Greeting {
    id: u32,
    message: String,
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let config = BrokerConfig::from_env().expect("invalid broker configuration");
    let queue = config.queue.clone();

    let client = RabbitMq::new(config);
    let gateway = Gateway::new(client.clone());
    gateway
        .bootstrap()
        .await
        .expect("failed to connect to RabbitMQ");

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let processor = tower::service_fn(|msg: InboundMessage| async move {
        tracing::info!(pattern = msg.pattern(), data = ?msg.data(), "Got message");
        Ok::<(), std::convert::Infallible>(())
    });
    let deliveries = client
        .consume("letterbox-demo")
        .await
        .expect("failed to start consuming");
    let consumer_handle = tokio::spawn(
        Consumer::new(InboundHandler::new(queue.clone()).with_processor(processor))
            .run(deliveries, cancel.clone()),
    );

    let mut id = 0;
    while !cancel.is_cancelled() {
        let greeting = Greeting {
            id,
            message: "Hello".to_owned(),
        };
        if let Err(err) = gateway.publish_json(&queue, &greeting) {
            tracing::error!(%err, "Publish failed");
        }
        id += 1;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    consumer_handle.await.unwrap().unwrap();
    cancel_handle.await.unwrap();
}
