pub mod config;
pub mod consumer;
pub mod database;
pub mod decode;
pub mod errors;
pub mod images;
pub mod kafka;
pub mod metrics_defs;
pub mod pipeline;
pub mod record;
pub mod service;
pub mod sink;
pub mod storage;

#[cfg(test)]
mod testutils;

use crate::config::{Config, SinkKind};
use crate::consumer::{ConsumerSettings, run_consumer_loop};
use crate::database::MySqlStore;
use crate::errors::{RelayError, Result};
use crate::kafka::{KafkaPublisher, KafkaSource};
use crate::pipeline::Pipeline;
use crate::service::RelayService;
use crate::sink::RecordSink;
use crate::storage::{ImageStore, ensure_bucket};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Runs the produce endpoint and the admin endpoints until `shutdown` resolves.
///
/// The admin listener comes up first so `/health` answers while the clients
/// are being set up. `/ready` flips once the bucket check passed and every
/// client is built.
pub async fn run_server<F>(config: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let ready = Arc::new(AtomicBool::new(false));
    let ready_flag = ready.clone();
    let admin_service = AdminService::<_, RelayError>::new(move || ready_flag.load(Ordering::Relaxed));
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );

    let serve = async {
        let images = build_image_store(&config).await?;
        let sinks = build_sinks(&config).await?;
        let pipeline = Arc::new(Pipeline::new(images, sinks));

        let relay_service = RelayService::new(pipeline, config.max_body_bytes);
        let relay_task = run_http_service(
            &config.listener.host,
            config.listener.port,
            relay_service,
        );

        ready.store(true, Ordering::Relaxed);
        tracing::info!(sinks = ?config.sinks, "Relay ready");
        relay_task.await
    };

    tokio::select! {
        result = async { tokio::try_join!(serve, admin_task).map(|_| ()) } => result,
        _ = shutdown => {
            tracing::info!("Shutting down");
            Ok(())
        }
    }
}

/// Reads the topic into the database until `shutdown` resolves.
pub async fn run_consumer<F>(config: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let (Some(kafka), Some(database)) = (&config.kafka, &config.database) else {
        return Err(RelayError::MissingConfig("kafka and database"));
    };
    let Some(consumer_config) = &kafka.consumer else {
        return Err(RelayError::MissingConfig("kafka.consumer"));
    };

    let images = build_image_store(&config).await?;
    let store: Arc<dyn RecordSink> = Arc::new(MySqlStore::connect(database).await?);
    let pipeline = Pipeline::new(images, vec![store]);
    let source = KafkaSource::new(kafka, consumer_config)?;

    run_consumer_loop(
        &source,
        &pipeline,
        ConsumerSettings::from(consumer_config),
        shutdown,
    )
    .await;
    Ok(())
}

async fn build_image_store(config: &Config) -> Result<Option<ImageStore>> {
    let Some(store_config) = &config.object_store else {
        return Ok(None);
    };
    if store_config.create_bucket {
        ensure_bucket(store_config).await?;
    }
    ImageStore::from_config(store_config).map(Some)
}

async fn build_sinks(config: &Config) -> Result<Vec<Arc<dyn RecordSink>>> {
    let mut sinks: Vec<Arc<dyn RecordSink>> = Vec::with_capacity(config.sinks.len());

    for kind in &config.sinks {
        let sink: Arc<dyn RecordSink> = match (kind, &config.kafka, &config.database) {
            (SinkKind::Queue, Some(kafka), _) => Arc::new(KafkaPublisher::new(kafka)?),
            (SinkKind::Database, _, Some(database)) => Arc::new(MySqlStore::connect(database).await?),
            (SinkKind::Queue, None, _) => return Err(RelayError::MissingConfig("kafka")),
            (SinkKind::Database, _, None) => return Err(RelayError::MissingConfig("database")),
        };
        sinks.push(sink);
    }

    Ok(sinks)
}
