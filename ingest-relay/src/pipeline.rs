//! Decode, upload, publish.
//!
//! A payload goes through three phases:
//!
//! 1. every record is validated and every image decoded and assigned its key;
//! 2. all images are uploaded;
//! 3. records are published to each sink, in payload order.
//!
//! A failure in phase 1 has no side effect. From phase 2 on, the objects of
//! every record that reached no sink are deleted again before the error is
//! returned. A record written to some sinks but not all stays published.

use crate::decode::decode_records;
use crate::errors::{RelayError, Result};
use crate::images::{PreparedImage, prepare_images};
use crate::metrics_defs::{RECORDS_FAILED, RECORDS_PUBLISHED, RECORDS_RECEIVED};
use crate::record::ActivityRecord;
use crate::sink::RecordSink;
use crate::storage::ImageStore;
use object_store::path::Path as ObjectPath;
use shared::counter;
use std::collections::HashSet;
use std::sync::Arc;

/// A record rewritten to object keys, with the images it references.
struct PreparedRecord {
    record: ActivityRecord,
    images: Vec<PreparedImage>,
}

impl PreparedRecord {
    fn keys(&self) -> impl Iterator<Item = &ObjectPath> {
        self.images.iter().map(|image| &image.key)
    }
}

/// A sink rejected a record after `reached` sinks had accepted it.
struct SinkFailure {
    sink: &'static str,
    reached: usize,
    source: RelayError,
}

pub struct Pipeline {
    images: Option<ImageStore>,
    sinks: Vec<Arc<dyn RecordSink>>,
}

impl Pipeline {
    pub fn new(images: Option<ImageStore>, sinks: Vec<Arc<dyn RecordSink>>) -> Self {
        Self { images, sinks }
    }

    pub fn sinks(&self) -> &[Arc<dyn RecordSink>] {
        &self.sinks
    }

    /// Processes a raw payload and returns the number of published records.
    pub async fn process(&self, payload: &[u8]) -> Result<usize> {
        let records = decode_records(payload).inspect_err(|e| {
            counter!(RECORDS_FAILED, "kind" => e.kind()).increment(1);
        })?;
        self.process_records(records).await
    }

    pub async fn process_records(&self, records: Vec<ActivityRecord>) -> Result<usize> {
        counter!(RECORDS_RECEIVED).increment(records.len() as u64);

        let result = self.run(records).await;
        if let Err(e) = &result {
            counter!(RECORDS_FAILED, "kind" => e.kind()).increment(1);
        }
        result
    }

    async fn run(&self, records: Vec<ActivityRecord>) -> Result<usize> {
        let prepared = records
            .into_iter()
            .map(|record| self.prepare(record))
            .collect::<Result<Vec<_>>>()?;

        self.upload_all(&prepared).await?;

        let total = prepared.len();
        for (index, item) in prepared.iter().enumerate() {
            let Err(failure) = self.publish(&item.record).await else {
                continue;
            };

            // A record already written to one sink counts as published, so
            // its objects stay referenced
            let published = index + usize::from(failure.reached > 0);
            tracing::error!(
                activity_uuid = %item.record.activity_uuid,
                sink = failure.sink,
                published,
                total,
                error = %failure.source,
                "Failed to publish record"
            );
            let (kept, unpublished) = prepared.split_at(published);
            self.discard(kept, unpublished).await;

            return Err(if published == 0 && total == 1 {
                failure.source
            } else {
                RelayError::PartialPublish {
                    published,
                    total,
                    source: Box::new(failure.source),
                }
            });
        }

        tracing::debug!(records = total, "Relayed payload");
        Ok(total)
    }

    fn prepare(&self, mut record: ActivityRecord) -> Result<PreparedRecord> {
        record
            .validate()
            .map_err(|reason| RelayError::InvalidRecord {
                activity_uuid: record.activity_uuid.clone(),
                reason,
            })?;

        if record.has_image_payload() && self.images.is_none() {
            return Err(RelayError::NoObjectStore);
        }

        let images = prepare_images(&mut record)?;
        Ok(PreparedRecord { record, images })
    }

    async fn upload_all(&self, prepared: &[PreparedRecord]) -> Result<()> {
        let Some(store) = &self.images else {
            return Ok(());
        };

        let mut uploaded: Vec<ObjectPath> = Vec::new();
        for image in prepared.iter().flat_map(|item| &item.images) {
            if let Err(e) = store.upload(image).await {
                tracing::error!(key = %image.key, error = %e, "Failed to upload image");
                store.discard(&uploaded).await;
                return Err(e);
            }
            uploaded.push(image.key.clone());
        }
        Ok(())
    }

    /// Writes `record` to every sink in order, stopping at the first failure.
    async fn publish(&self, record: &ActivityRecord) -> std::result::Result<(), SinkFailure> {
        for (reached, sink) in self.sinks.iter().enumerate() {
            if let Err(source) = sink.publish(record).await {
                return Err(SinkFailure {
                    sink: sink.name(),
                    reached,
                    source,
                });
            }
            counter!(RECORDS_PUBLISHED, "sink" => sink.name()).increment(1);
        }
        Ok(())
    }

    /// Deletes the objects of records that reached no sink.
    ///
    /// A key shared with a published record is kept.
    async fn discard(&self, published: &[PreparedRecord], unpublished: &[PreparedRecord]) {
        let Some(store) = &self.images else {
            return;
        };
        let kept: HashSet<&ObjectPath> = published.iter().flat_map(PreparedRecord::keys).collect();
        let keys: Vec<ObjectPath> = unpublished
            .iter()
            .flat_map(PreparedRecord::keys)
            .filter(|key| !kept.contains(key))
            .cloned()
            .collect();
        if !keys.is_empty() {
            store.discard(&keys).await;
        }
    }
}
