use crate::errors::RelayError;
use crate::record::ActivityRecord;
use async_trait::async_trait;

/// A downstream destination for rewritten records.
///
/// A record handed to a sink never carries image bytes, only object keys.
#[async_trait]
pub trait RecordSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Writes one record. There is no retry on failure.
    async fn publish(&self, record: &ActivityRecord) -> Result<(), RelayError>;

    /// Called by the consumer after every flushed batch.
    async fn after_batch(&self) {}
}
