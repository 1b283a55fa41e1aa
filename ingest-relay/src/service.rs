use crate::errors::RelayError;
use crate::metrics_defs::{REQUEST_DURATION, REQUESTS_INFLIGHT};
use crate::pipeline::Pipeline;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::CONTENT_LENGTH;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use shared::http::{make_boxed_error_response, text_response};
use shared::{gauge, histogram};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

pub const PRODUCE_PATH: &str = "/produce";

/// Accepts activity payloads on `POST /produce`.
pub struct RelayService {
    pipeline: Arc<Pipeline>,
    max_body_bytes: usize,
}

impl RelayService {
    pub fn new(pipeline: Arc<Pipeline>, max_body_bytes: usize) -> Self {
        Self {
            pipeline,
            max_body_bytes,
        }
    }
}

impl Service<Request<Incoming>> for RelayService {
    type Response = Response<BoxBody<Bytes, Self::Error>>;
    type Error = RelayError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let pipeline = self.pipeline.clone();
        let max_body_bytes = self.max_body_bytes;

        Box::pin(async move { Ok(handle_request(&pipeline, max_body_bytes, req).await) })
    }
}

/// Holds one unit of a gauge for as long as it is alive.
struct InflightGuard {
    gauge: metrics::Gauge,
}

impl InflightGuard {
    fn new(gauge: metrics::Gauge) -> Self {
        gauge.increment(1.0);
        Self { gauge }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.gauge.decrement(1.0);
    }
}

/// Routes one request and turns every failure into a plain text response.
///
/// Once the body is read, the records are processed on a separate task that
/// runs to completion even if the client goes away.
pub async fn handle_request<B>(
    pipeline: &Arc<Pipeline>,
    max_body_bytes: usize,
    req: Request<B>,
) -> Response<BoxBody<Bytes, RelayError>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.uri().path() != PRODUCE_PATH {
        return make_boxed_error_response(StatusCode::NOT_FOUND);
    }
    if req.method() != Method::POST {
        return make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let start = Instant::now();
    let inflight = InflightGuard::new(gauge!(REQUESTS_INFLIGHT));

    let response = match produce(pipeline, max_body_bytes, req).await {
        Ok(count) => text_response(StatusCode::OK, format!("produced {count} record(s)\n")),
        Err(e) => {
            let status = e.status_code();
            if status.is_server_error() {
                tracing::error!(error = %e, kind = e.kind(), "Produce request failed");
            } else {
                tracing::info!(error = %e, "Rejected produce request");
            }
            text_response(status, format!("{e}\n"))
        }
    };

    drop(inflight);
    histogram!(REQUEST_DURATION, "status" => response.status().as_str().to_owned())
        .record(start.elapsed().as_secs_f64());

    response
}

async fn produce<B>(
    pipeline: &Arc<Pipeline>,
    max_body_bytes: usize,
    req: Request<B>,
) -> Result<usize, RelayError>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let declared = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared.is_some_and(|len| len > max_body_bytes) {
        return Err(RelayError::BodyTooLarge {
            limit: max_body_bytes,
        });
    }

    let body = Limited::new(req.into_body(), max_body_bytes)
        .collect()
        .await
        .map_err(|e| {
            if e.is::<http_body_util::LengthLimitError>() {
                RelayError::BodyTooLarge {
                    limit: max_body_bytes,
                }
            } else {
                RelayError::RequestBody(e.to_string())
            }
        })?
        .to_bytes();

    let pipeline = pipeline.clone();
    tokio::spawn(async move { pipeline.process(&body).await }).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::RecordSink;
    use crate::storage::ImageStore;
    use crate::testutils::{MemorySink, png_base64, record_json};
    use crate::record::ActivityRecord;
    use async_trait::async_trait;
    use http_body_util::Full;
    use metrics::GaugeFn;
    use object_store::memory::InMemory;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    fn relay() -> (Arc<Pipeline>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let images = ImageStore::new(Arc::new(InMemory::new()), "no-cache");
        let pipeline = Pipeline::new(Some(images), vec![sink.clone() as Arc<dyn RecordSink>]);
        (Arc::new(pipeline), sink)
    }

    #[derive(Default)]
    struct TestGauge(Mutex<f64>);

    impl GaugeFn for TestGauge {
        fn increment(&self, value: f64) {
            *self.0.lock().unwrap() += value;
        }

        fn decrement(&self, value: f64) {
            *self.0.lock().unwrap() -= value;
        }

        fn set(&self, value: f64) {
            *self.0.lock().unwrap() = value;
        }
    }

    /// Blocks in `publish` until released, then forwards to a [`MemorySink`].
    #[derive(Default)]
    struct GateSink {
        entered: Notify,
        release: Notify,
        inner: MemorySink,
    }

    #[async_trait]
    impl RecordSink for GateSink {
        fn name(&self) -> &'static str {
            "queue"
        }

        async fn publish(&self, record: &ActivityRecord) -> Result<(), RelayError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.publish(record).await
        }
    }

    fn request(method: Method, path: &str, body: impl Into<Bytes>) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(body.into()))
            .unwrap()
    }

    async fn body_text(response: Response<BoxBody<Bytes, RelayError>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_produce_single_record() {
        let (pipeline, sink) = relay();
        let body = record_json("a1", "u1", Some(&png_base64()), None);

        let response =
            handle_request(&pipeline, 1024 * 1024, request(Method::POST, "/produce", body)).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "produced 1 record(s)\n");
        assert_eq!(sink.records()[0].screenshot_uid, "screenshots/a1|u1.png");
    }

    #[tokio::test]
    async fn test_produce_array() {
        let (pipeline, sink) = relay();
        let body = format!(
            "[{},{}]",
            record_json("a1", "u1", None, None),
            record_json("a2", "u1", None, None)
        );

        let response =
            handle_request(&pipeline, 1024 * 1024, request(Method::POST, "/produce", body)).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "produced 2 record(s)\n");
        assert_eq!(sink.records().len(), 2);
    }

    #[tokio::test]
    async fn test_bad_payload() {
        let (pipeline, sink) = relay();

        let response =
            handle_request(&pipeline, 1024, request(Method::POST, "/produce", "[1, 2]")).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.starts_with("invalid payload"));
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_bad_image_is_server_error() {
        let (pipeline, sink) = relay();
        let body = format!(
            "[{},{},{}]",
            record_json("a1", "u1", Some(&png_base64()), None),
            record_json("a2", "u1", Some("@@@"), None),
            record_json("a3", "u1", None, None)
        );

        let response =
            handle_request(&pipeline, 1024 * 1024, request(Method::POST, "/produce", body)).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(response).await.contains("invalid base64"));
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_body_too_large() {
        let (pipeline, _sink) = relay();
        let body = record_json("a1", "u1", Some(&png_base64()), None);

        let response = handle_request(&pipeline, 16, request(Method::POST, "/produce", body)).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        // Declared length alone is enough to reject
        let mut req = request(Method::POST, "/produce", "{}");
        req.headers_mut()
            .insert(CONTENT_LENGTH, "1000".parse().unwrap());
        let response = handle_request(&pipeline, 16, req).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_routing() {
        let (pipeline, _sink) = relay();

        let response = handle_request(&pipeline, 1024, request(Method::GET, "/produce", "")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = handle_request(&pipeline, 1024, request(Method::POST, "/other", "{}")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, "Not Found\n");
    }

    #[test]
    fn test_inflight_guard_releases_on_drop() {
        let value = Arc::new(TestGauge::default());
        let gauge = metrics::Gauge::from_arc(value.clone());

        let first = InflightGuard::new(gauge.clone());
        let second = InflightGuard::new(gauge);
        assert_eq!(*value.0.lock().unwrap(), 2.0);

        drop(first);
        assert_eq!(*value.0.lock().unwrap(), 1.0);
        drop(second);
        assert_eq!(*value.0.lock().unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_dropped_request_still_publishes() {
        let sink = Arc::new(GateSink::default());
        let pipeline = Arc::new(Pipeline::new(
            None,
            vec![sink.clone() as Arc<dyn RecordSink>],
        ));

        let body = record_json("a1", "u1", None, None);
        let req = request(Method::POST, "/produce", body);
        let task = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { handle_request(&pipeline, 1024, req).await })
        };

        // The client disconnects while the record is being published
        sink.entered.notified().await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        sink.release.notify_one();
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while sink.inner.records().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sink.inner.records()[0].activity_uuid, "a1");
    }

    #[tokio::test]
    async fn test_downstream_failure() {
        let sink = Arc::new(MemorySink::failing_at(0));
        let pipeline = Arc::new(Pipeline::new(None, vec![sink as Arc<dyn RecordSink>]));

        let body = record_json("a1", "u1", None, None);
        let response =
            handle_request(&pipeline, 1024, request(Method::POST, "/produce", body)).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(response).await.starts_with("queue error"));
    }
}
