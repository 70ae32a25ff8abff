use crate::events::EventSink;
use crate::products::{apply_product_message, ProductDisposition};
use crate::repository::Repository;
use crate::service::InventoryService;
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Message;
use serde::Serialize;
use shared::{ProductInventory, Reservation};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Publishes committed updates as JSON, keyed by sku so every update for one
/// product lands on the same partition in commit order.
#[derive(Clone)]
pub struct KafkaEventSink {
    producer: FutureProducer,
    inventory_topic: String,
    reservation_topic: String,
    timeout: Duration,
}

impl KafkaEventSink {
    pub fn new(
        producer: FutureProducer,
        inventory_topic: impl Into<String>,
        reservation_topic: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            producer,
            inventory_topic: inventory_topic.into(),
            reservation_topic: reservation_topic.into(),
            timeout,
        }
    }

    pub fn producer(brokers: &str, timeout: Duration) -> Result<FutureProducer> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .create()?;
        Ok(producer)
    }

    async fn send<T: Serialize>(&self, topic: &str, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let record = FutureRecord::to(topic).payload(&json).key(key);

        let (partition, offset) = self.producer.send(record, self.timeout).await.map_err(|(e, _)| {
            error!(topic, key, error = %e, "failed to publish update");
            anyhow::anyhow!("failed to publish to {topic}: {e}")
        })?;
        debug!(topic, key, partition, offset, "published update");
        Ok(())
    }
}

#[async_trait]
impl EventSink for KafkaEventSink {
    async fn publish_inventory(&self, inventory: &ProductInventory) -> Result<()> {
        self.send(&self.inventory_topic, inventory.sku(), inventory).await
    }

    async fn publish_reservation(&self, reservation: &Reservation) -> Result<()> {
        self.send(&self.reservation_topic, &reservation.sku, reservation).await
    }
}

/// Subscribes to `topic`. Offsets are committed per message by
/// [`ProductConsumer::run`].
pub fn product_consumer(brokers: &str, group_id: &str, topic: &str) -> Result<StreamConsumer> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("group.id", group_id)
        .set("bootstrap.servers", brokers)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set("enable.auto.commit", "false")
        .create()?;
    consumer.subscribe(&[topic])?;
    Ok(consumer)
}

/// Consumes product messages and creates each product. Messages that cannot
/// become a product are forwarded, unchanged, to the dead letter topic with
/// the reason in an `error` header.
pub struct ProductConsumer<R, E> {
    service: Arc<InventoryService<R, E>>,
    producer: FutureProducer,
    dlt_topic: String,
    timeout: Duration,
}

impl<R, E> ProductConsumer<R, E>
where
    R: Repository,
    E: EventSink,
{
    pub fn new(
        service: Arc<InventoryService<R, E>>,
        producer: FutureProducer,
        dlt_topic: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            service,
            producer,
            dlt_topic: dlt_topic.into(),
            timeout,
        }
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        info!(dlt_topic = %self.dlt_topic, "consuming products");
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            match message {
                Ok(m) => {
                    let payload = m.payload().unwrap_or_default();
                    match apply_product_message(&*self.service, payload).await {
                        ProductDisposition::Created => {}
                        ProductDisposition::DeadLetter(reason) => {
                            if let Err(e) = self.dead_letter(m.key(), payload, &reason).await {
                                error!("Error writing product message to dead letter topic: {}", e);
                            }
                        }
                    }
                    if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                        error!("Error committing message: {}", e);
                    }
                }
                Err(e) => error!("Error receiving message: {}", e),
            }
        }
    }

    async fn dead_letter(&self, key: Option<&[u8]>, payload: &[u8], reason: &str) -> Result<()> {
        let headers = OwnedHeaders::new().insert(Header {
            key: "error",
            value: Some(reason),
        });
        let mut record: FutureRecord<'_, [u8], [u8]> =
            FutureRecord::to(&self.dlt_topic).payload(payload).headers(headers);
        if let Some(key) = key {
            record = record.key(key);
        }

        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| anyhow::anyhow!("failed to publish to {}: {e}", self.dlt_topic))?;
        debug!(topic = %self.dlt_topic, reason, "product message dead-lettered");
        Ok(())
    }
}
