use std::sync::Arc;
use std::time::Duration;

use common_health::{HealthHandle, HealthRegistry};
use common_kafka::{kafka_consumer::BatchConsumer, kafka_producer::EventProducer};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

use crate::{config::Config, error::UnhandledError, hub::Hub};

pub struct AppContext {
    pub health_registry: HealthRegistry,
    pub worker_liveness: HealthHandle,
    pub kafka_consumer: BatchConsumer,
    pub kafka_producer: EventProducer,
    pub pool: PgPool,
    pub hub: Arc<Hub>,
    pub config: Config,
}

impl AppContext {
    pub async fn new(config: &Config) -> Result<Self, UnhandledError> {
        let health_registry = HealthRegistry::new("liveness");
        let worker_liveness = health_registry
            .register("worker".to_string(), Duration::from_secs(60))
            .await;
        let kafka_liveness = health_registry
            .register("rdkafka".to_string(), Duration::from_secs(30))
            .await;

        let kafka_consumer = BatchConsumer::new(config.kafka.clone(), config.consumer.clone())?;
        let kafka_producer = EventProducer::new(&config.kafka, kafka_liveness).await?;

        let options = PgPoolOptions::new().max_connections(config.max_pg_connections);
        let pool = options.connect(&config.database_url).await?;

        let hub = Arc::new(Hub::new(config, pool.clone()));

        info!(
            "AppContext initialized, subscribed to topic {}",
            config.consumer.kafka_consumer_topic
        );

        Ok(Self {
            health_registry,
            worker_liveness,
            kafka_consumer,
            kafka_producer,
            pool,
            hub,
            config: config.clone(),
        })
    }
}
