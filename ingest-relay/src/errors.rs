use crate::images::ImageRole;
use hyper::StatusCode;
use thiserror::Error;

/// Result type alias for ingest-relay operations
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Errors that can occur while relaying activity records
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid payload: {0}")]
    InvalidFormat(String),

    #[error("invalid record {activity_uuid:?}: {reason}")]
    InvalidRecord {
        activity_uuid: String,
        reason: String,
    },

    #[error("invalid object key {key:?}: {reason}")]
    InvalidObjectKey { key: String, reason: String },

    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("failed to read request body: {0}")]
    RequestBody(String),

    #[error("invalid base64 in {role} image of {activity_uuid:?}: {source}")]
    ImageDecode {
        role: ImageRole,
        activity_uuid: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("object store error: {0}")]
    Storage(#[from] object_store::Error),

    #[error("record carries an image but no object store is configured")]
    NoObjectStore,

    #[error("bucket setup failed: {0}")]
    BucketSetup(String),

    #[error("queue error: {0}")]
    Queue(#[from] rdkafka::error::KafkaError),

    #[error("database error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("failed to serialize record: {0}")]
    Serialization(#[source] serde_json::Error),

    /// Publishing stopped part way through a multi-record payload
    #[error("published {published} of {total} records before failure: {source}")]
    PartialPublish {
        published: usize,
        total: usize,
        #[source]
        source: Box<RelayError>,
    },

    #[error("processing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("missing configuration: {0}")]
    MissingConfig(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// HTTP status reported to the caller of the produce endpoint.
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::InvalidFormat(_)
            | RelayError::InvalidRecord { .. }
            | RelayError::InvalidObjectKey { .. }
            | RelayError::RequestBody(_) => StatusCode::BAD_REQUEST,
            RelayError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used to tag error metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::InvalidFormat(_)
            | RelayError::InvalidRecord { .. }
            | RelayError::InvalidObjectKey { .. }
            | RelayError::BodyTooLarge { .. }
            | RelayError::RequestBody(_) => "decode",
            RelayError::ImageDecode { .. } => "image_decode",
            RelayError::Storage(_) | RelayError::NoObjectStore | RelayError::BucketSetup(_) => {
                "storage"
            }
            RelayError::Queue(_) => "queue",
            RelayError::Persistence(_) => "persistence",
            RelayError::Serialization(_) => "serialization",
            RelayError::PartialPublish { source, .. } => source.kind(),
            RelayError::Task(_) => "task",
            RelayError::MissingConfig(_) => "config",
            RelayError::Io(_) => "io",
        }
    }
}
