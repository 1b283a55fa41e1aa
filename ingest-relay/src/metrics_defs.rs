use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Produce request duration in seconds. Tagged with status.",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "requests.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of produce requests currently being processed",
};

pub const RECORDS_RECEIVED: MetricDef = MetricDef {
    name: "records.received",
    metric_type: MetricType::Counter,
    description: "Records decoded from produce requests and consumed messages",
};

pub const RECORDS_PUBLISHED: MetricDef = MetricDef {
    name: "records.published",
    metric_type: MetricType::Counter,
    description: "Records written to a sink. Tagged with sink.",
};

pub const RECORDS_FAILED: MetricDef = MetricDef {
    name: "records.failed",
    metric_type: MetricType::Counter,
    description: "Payloads rejected or aborted. Tagged with error kind.",
};

pub const IMAGES_UPLOADED: MetricDef = MetricDef {
    name: "images.uploaded",
    metric_type: MetricType::Counter,
    description: "Images stored in the object store. Tagged with role.",
};

pub const IMAGES_DISCARDED: MetricDef = MetricDef {
    name: "images.discarded",
    metric_type: MetricType::Counter,
    description: "Uploaded images deleted because their record was not published",
};

pub const CONSUMER_MESSAGES: MetricDef = MetricDef {
    name: "consumer.messages",
    metric_type: MetricType::Counter,
    description: "Messages read from the topic by the consumer",
};

pub const CONSUMER_READ_ERRORS: MetricDef = MetricDef {
    name: "consumer.read_errors",
    metric_type: MetricType::Counter,
    description: "Consumer reads that failed or hit the read deadline",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    REQUESTS_INFLIGHT,
    RECORDS_RECEIVED,
    RECORDS_PUBLISHED,
    RECORDS_FAILED,
    IMAGES_UPLOADED,
    IMAGES_DISCARDED,
    CONSUMER_MESSAGES,
    CONSUMER_READ_ERRORS,
];
