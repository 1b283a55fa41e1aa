use crate::consumer::MessageSource;
use crate::errors::RelayError;
use crate::record::ActivityRecord;
use crate::sink::RecordSink;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A 1x1 transparent PNG.
pub const PNG_BYTES: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4,
    0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE,
    0x42, 0x60, 0x82,
];

pub fn png_base64() -> String {
    STANDARD.encode(PNG_BYTES)
}

/// Builds a record payload with optional base64 images.
pub fn record_json(
    activity_uuid: &str,
    user_uid: &str,
    screenshot: Option<&str>,
    thumbnail: Option<&str>,
) -> String {
    let mut record = serde_json::json!({
        "activity_uuid": activity_uuid,
        "user_uid": user_uid,
        "app_name": "Terminal",
        "mouse_clicks": 3,
    });
    if let Some(screenshot) = screenshot {
        record["screenshot"] = screenshot.into();
    }
    if let Some(thumbnail) = thumbnail {
        record["thumbnail"] = thumbnail.into();
    }
    record.to_string()
}

/// Sink keeping every published record in memory.
///
/// With `failing_at(n)` the n-th publish call (0-based) and every later one
/// fails with a queue error.
pub struct MemorySink {
    name: &'static str,
    records: Mutex<Vec<ActivityRecord>>,
    fail_at: Option<usize>,
    calls: AtomicUsize,
    batches: AtomicUsize,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::named("queue")
    }
}

impl MemorySink {
    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            records: Mutex::new(Vec::new()),
            fail_at: None,
            calls: AtomicUsize::new(0),
            batches: AtomicUsize::new(0),
        }
    }

    pub fn failing_at(index: usize) -> Self {
        Self {
            fail_at: Some(index),
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<ActivityRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn publish(&self, record: &ActivityRecord) -> Result<(), RelayError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_at.is_some_and(|index| call >= index) {
            return Err(RelayError::Queue(KafkaError::MessageProduction(
                RDKafkaErrorCode::QueueFull,
            )));
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn after_batch(&self) {
        self.batches.fetch_add(1, Ordering::SeqCst);
    }
}

/// What a scripted source returns from one read.
pub enum Read {
    Message(Vec<u8>),
    Error,
    /// Blocks until the read deadline expires
    Hang,
}

/// Message source replaying a fixed script, then blocking forever.
pub struct VecSource {
    reads: Mutex<VecDeque<Read>>,
}

impl VecSource {
    pub fn new(reads: impl IntoIterator<Item = Read>) -> Self {
        Self {
            reads: Mutex::new(reads.into_iter().collect()),
        }
    }

    pub fn messages<I, T>(messages: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Vec<u8>>,
    {
        Self::new(messages.into_iter().map(|m| Read::Message(m.into())))
    }

    pub fn remaining(&self) -> usize {
        self.reads.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageSource for VecSource {
    async fn next_message(&self) -> Result<Option<Vec<u8>>, RelayError> {
        let next = self.reads.lock().unwrap().pop_front();
        match next {
            Some(Read::Message(payload)) => Ok(Some(payload)),
            Some(Read::Error) => Err(RelayError::Queue(KafkaError::NoMessageReceived)),
            Some(Read::Hang) | None => std::future::pending().await,
        }
    }
}
