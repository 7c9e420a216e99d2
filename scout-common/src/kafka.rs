use std::time::Duration;

use async_trait::async_trait;
use envconfig::Envconfig;
use health::HealthHandle;
use metrics::{counter, gauge};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic
    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes
    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds
    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
    #[envconfig(default = "false")]
    pub kafka_tls: bool,
    #[envconfig(default = "kafka:9092")]
    pub kafka_hosts: String,
}

/// Enumeration of errors for publishing a message to the broker.
/// `Retryable` covers everything a later attempt could fix; the caller
/// decides whether the payload is worth retrying.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("message rejected by the broker as too large")]
    TooLarge,
    #[error("transient broker error, please retry")]
    Retryable,
}

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();

        gauge!("scout_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("scout_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("scout_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
    }
}

pub fn create_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka configuration: {:?}", client_config);
    let producer: FutureProducer<KafkaContext> =
        client_config.create_with_context(KafkaContext { liveness })?;

    // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
    drop(producer.client().fetch_metadata(
        Some("__consumer_offsets"),
        Timeout::After(Duration::new(10, 0)),
    )?);
    info!("connected to Kafka brokers");

    Ok(producer)
}

/// Build a consumer subscribed to `topics`, sharing offsets under `group_id`.
pub fn create_consumer(
    hosts: &str,
    group_id: &str,
    topics: &[&str],
) -> Result<StreamConsumer, KafkaError> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", hosts)
        .set("group.id", group_id)
        .set("enable.auto.commit", "true")
        .set("auto.offset.reset", "earliest")
        .set("session.timeout.ms", "10000")
        .create()?;

    consumer.subscribe(topics)?;

    Ok(consumer)
}

/// The publishing half of the broker, behind a trait so pipeline stages can
/// run against an in-memory implementation in tests.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: String,
    ) -> Result<(), PublishError>;
}

/// Serialize `message` as JSON and publish it on `topic`.
pub async fn publish_json<T: Serialize>(
    publisher: &dyn Publisher,
    topic: &str,
    key: Option<&str>,
    message: &T,
) -> Result<(), PublishError> {
    let payload = serde_json::to_string(message)?;
    publisher.publish(topic, key, payload).await
}

#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer<KafkaContext>,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer<KafkaContext>) -> Self {
        Self { producer }
    }

    async fn process_ack(delivery: DeliveryFuture) -> Result<(), PublishError> {
        match delivery.await {
            Err(_) => {
                // Cancelled due to timeout while retrying
                counter!("scout_kafka_produce_errors_total").increment(1);
                error!("failed to produce to Kafka before write timeout");
                Err(PublishError::Retryable)
            }
            Ok(Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge), _))) => {
                // Rejected by broker due to message size
                counter!("scout_kafka_produce_errors_total").increment(1);
                Err(PublishError::TooLarge)
            }
            Ok(Err((err, _))) => {
                // Unretriable produce error
                counter!("scout_kafka_produce_errors_total").increment(1);
                error!("failed to produce to Kafka: {}", err);
                Err(PublishError::Retryable)
            }
            Ok(Ok(_)) => {
                counter!("scout_kafka_messages_published_total").increment(1);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: String,
    ) -> Result<(), PublishError> {
        let ack = match self.producer.send_result(FutureRecord {
            topic,
            payload: Some(payload.as_str()),
            partition: None,
            key,
            timestamp: None,
            headers: None,
        }) {
            Ok(ack) => ack,
            Err((e, _)) => match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::MessageSizeTooLarge) => {
                    return Err(PublishError::TooLarge);
                }
                _ => {
                    error!("failed to enqueue message for production: {}", e);
                    return Err(PublishError::Retryable);
                }
            },
        };

        Self::process_ack(ack).await
    }
}

/// Logs instead of producing. Stands in for Kafka in local development.
pub struct PrintPublisher {}

#[async_trait]
impl Publisher for PrintPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: String,
    ) -> Result<(), PublishError> {
        info!(topic = topic, key = ?key, "message: {}", payload);
        counter!("scout_kafka_messages_published_total").increment(1);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use health::HealthRegistry;
    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::DefaultProducerContext;

    fn producer_on_mock_cluster(
        cluster: &MockCluster<'_, DefaultProducerContext>,
    ) -> FutureProducer<KafkaContext> {
        let registry = HealthRegistry::new("liveness");
        let liveness = registry.register("rdkafka", time::Duration::seconds(30));

        let config = KafkaConfig {
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_message_timeout_ms: 500,
            kafka_compression_codec: "none".to_string(),
            kafka_tls: false,
            kafka_hosts: cluster.bootstrap_servers(),
        };
        create_producer(&config, liveness).expect("failed to create producer")
    }

    #[tokio::test]
    async fn publishes_to_mocked_cluster() {
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let publisher = KafkaPublisher::new(producer_on_mock_cluster(&cluster));

        // The mock cluster can reject the first sends while starting up.
        for _ in 0..20 {
            if publisher
                .publish("listing.ingested", Some("krisha"), "{}".to_owned())
                .await
                .is_ok()
            {
                break;
            }
        }

        publisher
            .publish("listing.ingested", Some("krisha"), "{}".to_owned())
            .await
            .expect("failed to publish to mock cluster");
    }

    #[tokio::test]
    async fn print_publisher_always_succeeds() {
        let publisher = PrintPublisher {};
        publish_json(&publisher, "listing.ingested", None, &serde_json::json!({"ok": true}))
            .await
            .expect("print publisher failed");
    }
}
