//! Queue consumer loop.
//!
//! Reads rewritten records from the topic and writes them through a
//! [`Pipeline`] (normally into the database). Each iteration waits for the
//! poll interval and then performs one read bounded by the read deadline.
//! Decoded messages collect in a [`Batch`] that is flushed by size or age.

use crate::config::{BatchConfig, ConsumerConfig};
use crate::decode::decode_records;
use crate::errors::RelayError;
use crate::metrics_defs::{CONSUMER_MESSAGES, CONSUMER_READ_ERRORS};
use crate::pipeline::Pipeline;
use crate::record::ActivityRecord;
use async_trait::async_trait;
use shared::counter;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

/// Where the consumer reads raw messages from.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Waits for the next message. `None` is a message without payload.
    async fn next_message(&self) -> Result<Option<Vec<u8>>, RelayError>;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchPolicy {
    pub max_records: usize,
    pub max_wait: Duration,
}

impl From<&BatchConfig> for BatchPolicy {
    fn from(config: &BatchConfig) -> Self {
        BatchPolicy {
            max_records: config.max_records.max(1),
            max_wait: Duration::from_millis(config.max_wait_ms),
        }
    }
}

/// Messages buffered by the consumer loop, each already decoded.
#[derive(Debug)]
pub struct Batch {
    policy: BatchPolicy,
    messages: Vec<Vec<ActivityRecord>>,
    records: usize,
    oldest: Option<Instant>,
}

impl Batch {
    pub fn new(policy: BatchPolicy) -> Self {
        Batch {
            policy,
            messages: Vec::new(),
            records: 0,
            oldest: None,
        }
    }

    pub fn push(&mut self, records: Vec<ActivityRecord>, now: Instant) {
        if records.is_empty() {
            return;
        }
        self.oldest.get_or_insert(now);
        self.records += records.len();
        self.messages.push(records);
    }

    pub fn len(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Time until the batch must be flushed by age. `None` when empty.
    pub fn time_left(&self, now: Instant) -> Option<Duration> {
        self.oldest
            .map(|oldest| (oldest + self.policy.max_wait).saturating_duration_since(now))
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.records >= self.policy.max_records || self.time_left(now) == Some(Duration::ZERO)
    }

    /// Empties the batch, returning its messages in arrival order.
    pub fn take(&mut self) -> Vec<Vec<ActivityRecord>> {
        self.records = 0;
        self.oldest = None;
        std::mem::take(&mut self.messages)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ConsumerSettings {
    pub poll_interval: Duration,
    pub read_timeout: Duration,
    pub batch: BatchPolicy,
}

impl From<&ConsumerConfig> for ConsumerSettings {
    fn from(config: &ConsumerConfig) -> Self {
        ConsumerSettings {
            poll_interval: config.poll_interval(),
            read_timeout: config.read_timeout(),
            batch: BatchPolicy::from(&config.batch),
        }
    }
}

/// Runs until `shutdown` resolves, then flushes whatever is still buffered.
///
/// Read errors and undecodable messages are logged and skipped. So are
/// records the pipeline rejects; there is no retry.
pub async fn run_consumer_loop<S, F>(
    source: &S,
    pipeline: &Pipeline,
    settings: ConsumerSettings,
    shutdown: F,
) where
    S: MessageSource + ?Sized,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    let mut batch = Batch::new(settings.batch);
    // `interval` panics on a zero period
    let mut ticker = tokio::time::interval(settings.poll_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }

        // Wake up in time to flush an aging batch even when the topic is quiet
        let batch_deadline = batch.time_left(Instant::now());
        let wait = batch_deadline.map_or(settings.read_timeout, |left| {
            left.min(settings.read_timeout)
        });

        let read = tokio::select! {
            _ = &mut shutdown => break,
            read = tokio::time::timeout(wait, source.next_message()) => read,
        };

        match read {
            Ok(Ok(Some(payload))) => {
                counter!(CONSUMER_MESSAGES).increment(1);
                match decode_records(&payload) {
                    Ok(records) => batch.push(records, Instant::now()),
                    Err(e) => {
                        tracing::warn!(error = %e, bytes = payload.len(), "Skipping undecodable message");
                    }
                }
            }
            Ok(Ok(None)) => {
                counter!(CONSUMER_MESSAGES).increment(1);
                tracing::debug!("Skipping message without payload");
            }
            Ok(Err(e)) => {
                counter!(CONSUMER_READ_ERRORS, "reason" => "error").increment(1);
                tracing::error!(error = %e, "Failed to read from topic");
            }
            Err(_) if batch_deadline.is_some_and(|left| left < settings.read_timeout) => {
                // Woke up for the batch, not a read deadline
            }
            Err(_) => {
                counter!(CONSUMER_READ_ERRORS, "reason" => "deadline").increment(1);
                tracing::debug!(timeout = ?settings.read_timeout, "No message before the read deadline");
            }
        }

        if batch.is_due(Instant::now()) {
            flush(&mut batch, pipeline).await;
        }
    }

    if !batch.is_empty() {
        flush(&mut batch, pipeline).await;
    }
    tracing::info!("Consumer stopped");
}

async fn flush(batch: &mut Batch, pipeline: &Pipeline) {
    let size = batch.len();
    let mut written = 0;

    for records in batch.take() {
        match pipeline.process_records(records).await {
            Ok(count) => written += count,
            Err(e) => tracing::error!(error = %e, kind = e.kind(), "Dropping message"),
        }
    }

    for sink in pipeline.sinks() {
        sink.after_batch().await;
    }
    tracing::debug!(records = size, written, "Flushed batch");
}
