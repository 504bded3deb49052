//! Request boundary that turns handler panics into `500` responses.

use std::any::Any;
use std::future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    BoxError,
    body::{Body, HttpBody},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{FutureExt, future::BoxFuture};
use tower::{Layer, Service};

use crate::config::RecoveryConfig;
use crate::hook::{self, Interception};
use crate::report::{self, DiagnosticSink, FaultReport, TracingSink};
use crate::request::RequestSnapshot;
use crate::stack::Render;
use crate::trace::CapturedStack;

#[derive(Clone)]
struct Settings {
    sink: Arc<dyn DiagnosticSink>,
    skip_frames: usize,
    render: Render,
}

/// Wraps services in [`Recovery`].
#[derive(Clone)]
pub struct RecoveryLayer {
    settings: Settings,
}

impl Default for RecoveryLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryLayer {
    /// Reports to [`TracingSink`], starting at the first frame below the panic runtime.
    pub fn new() -> Self {
        Self {
            settings: Settings {
                sink: Arc::new(TracingSink),
                skip_frames: 0,
                render: Render::default(),
            },
        }
    }

    pub fn from_config(cfg: &RecoveryConfig) -> Self {
        Self::new()
            .sink_arc(cfg.sink.build())
            .skip_frames(cfg.skip_frames)
            .sentinel_on_missing_source(cfg.sentinel_on_missing_source)
    }

    pub fn sink(self, sink: impl DiagnosticSink + 'static) -> Self {
        self.sink_arc(Arc::new(sink))
    }

    pub fn sink_arc(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.settings.sink = sink;
        self
    }

    pub fn skip_frames(mut self, skip: usize) -> Self {
        self.settings.skip_frames = skip;
        self
    }

    pub fn sentinel_on_missing_source(mut self, enabled: bool) -> Self {
        self.settings.render.sentinel_on_missing_source = enabled;
        self
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = Recovery<S>;

    fn layer(&self, inner: S) -> Self::Service {
        hook::install();
        Recovery {
            inner,
            settings: Arc::new(self.settings.clone()),
        }
    }
}

/// Runs the inner service and answers `500 Internal Server Error` with an
/// empty body if it panics, after handing a [`FaultReport`] to the sink.
#[derive(Clone)]
pub struct Recovery<S> {
    inner: S,
    settings: Arc<Settings>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for Recovery<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: HttpBody<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let snapshot = RequestSnapshot::capture(&req);
        let settings = self.settings.clone();

        let inner = &mut self.inner;
        let called = panic::catch_unwind(AssertUnwindSafe(move || {
            let _scope = Interception::enter();
            inner.call(req)
        }));
        let mut fut = match called {
            Ok(fut) => Box::pin(fut),
            Err(payload) => {
                let res = settings.recover(&snapshot, payload);
                return future::ready(Ok(res)).boxed();
            }
        };

        async move {
            let guarded = future::poll_fn(move |cx| {
                let _scope = Interception::enter();
                fut.as_mut().poll(cx)
            });

            match AssertUnwindSafe(guarded).catch_unwind().await {
                Ok(Ok(res)) => Ok(res.map(Body::new)),
                Ok(Err(err)) => Err(err),
                Err(payload) => Ok(settings.recover(&snapshot, payload)),
            }
        }
        .boxed()
    }
}

impl Settings {
    fn recover(&self, snapshot: &RequestSnapshot, payload: Box<dyn Any + Send>) -> Response {
        let captured = hook::take();

        let reported = panic::catch_unwind(AssertUnwindSafe(|| {
            let report = self.report(snapshot, payload.as_ref(), captured);
            self.sink.emit(&report);
        }));
        if reported.is_err() {
            tracing::error!(
                method = %snapshot.method(),
                uri = %snapshot.uri(),
                "failed to report a recovered panic"
            );
        }

        discard(payload);

        metrics::counter!("http_panics_recovered_total").increment(1);
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }

    fn report(
        &self,
        snapshot: &RequestSnapshot,
        payload: &(dyn Any + Send),
        captured: Option<hook::CapturedPanic>,
    ) -> FaultReport {
        let (stack, location) = match captured {
            Some(captured) => (CapturedStack::resolve(captured.trace), captured.location),
            None => {
                tracing::debug!(
                    "panic was not seen by the interception hook, using the guard's stack"
                );
                (CapturedStack::here(), None)
            }
        };

        FaultReport {
            request_dump: snapshot.dump(),
            raw_body: snapshot.raw_body().to_string(),
            fault_value: report::panic_message(payload),
            location,
            stack: self.render.frames(&stack, self.skip_frames),
        }
    }
}

/// Drops a panic payload whose destructor may itself panic.
fn discard(payload: Box<dyn Any + Send>) {
    if let Err(again) = panic::catch_unwind(AssertUnwindSafe(move || drop(payload))) {
        tracing::warn!("panic payload panicked while being dropped");
        mem::forget(again);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::request::RawBody;
    use std::convert::Infallible;
    use std::sync::Mutex;
    use tower::{ServiceExt, service_fn};

    type Reports = Arc<Mutex<Vec<FaultReport>>>;

    fn collecting_layer() -> (RecoveryLayer, Reports) {
        let reports: Reports = Arc::default();
        let sink = {
            let reports = reports.clone();
            move |report: &FaultReport| reports.lock().unwrap().push(report.clone())
        };
        (RecoveryLayer::new().sink(sink), reports)
    }

    fn request(raw_body: &str) -> Request<Body> {
        let mut req = Request::builder()
            .method("POST")
            .uri("/divide")
            .header("host", "localhost")
            .body(Body::from(raw_body.to_string()))
            .unwrap();
        req.extensions_mut().insert(RawBody(raw_body.to_string()));
        req
    }

    async fn body_bytes(res: Response) -> Bytes {
        axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn transparent_without_panic() {
        let (layer, reports) = collecting_layer();
        let svc = layer.layer(service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>((StatusCode::CREATED, "made it").into_response())
        }));

        let res = svc.oneshot(request("{}")).await.unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(&body_bytes(res).await[..], b"made it");
        assert!(reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn async_panic_becomes_500() {
        let (layer, reports) = collecting_layer();
        let svc = layer.layer(service_fn(|_req: Request<Body>| async {
            tokio::task::yield_now().await;
            if true {
                panic!("division by zero");
            }
            Ok::<Response, Infallible>(StatusCode::OK.into_response())
        }));

        let res = svc.oneshot(request(r#"{"a":1,"b":0}"#)).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_bytes(res).await.is_empty());

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.fault_value, "division by zero");
        assert_eq!(report.raw_body, r#"{"a":1,"b":0}"#);
        assert!(report.request_text().starts_with("POST /divide HTTP/1.1\r\n"));
        assert!(!report.stack.is_empty());
        assert!(report.location.as_deref().is_some_and(|l| l.contains("guard.rs")));
    }

    #[tokio::test]
    async fn sync_panic_in_call_becomes_500() {
        let (layer, reports) = collecting_layer();
        let svc = layer.layer(service_fn(|req: Request<Body>| {
            if req.uri().path() == "/divide" {
                panic!("exploded before returning a future");
            }
            future::ready(Ok::<Response, Infallible>(StatusCode::OK.into_response()))
        }));

        let res = svc.oneshot(request("")).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].fault_value, "exploded before returning a future");
        assert_eq!(reports[0].raw_body, "");
    }

    #[tokio::test]
    async fn errors_pass_through() {
        let (layer, reports) = collecting_layer();
        let svc = layer.layer(service_fn(|_req: Request<Body>| async {
            Err::<Response, &'static str>("inner error")
        }));

        let res = svc.oneshot(request("")).await;
        assert_eq!(res.err(), Some("inner error"));
        assert!(reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_sink_still_finalizes_response() {
        fn broken_sink(_: &FaultReport) {
            panic!("sink is broken");
        }

        let layer = RecoveryLayer::new().sink(broken_sink);
        let svc = layer.layer(service_fn(|_req: Request<Body>| async {
            if true {
                panic!("handler is broken");
            }
            Ok::<Response, Infallible>(StatusCode::OK.into_response())
        }));

        let res = svc.oneshot(request("")).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    fn handled_inside_handler() {
        panic!("handled inside the handler");
    }

    #[tokio::test]
    async fn unhooked_fault_does_not_reuse_earlier_capture() {
        let (layer, reports) = collecting_layer();
        let svc = layer.layer(service_fn(|req: Request<Body>| async move {
            if req.uri().path() == "/divide" {
                panic::resume_unwind(Box::new("rethrown without the hook"));
            }
            let handled = panic::catch_unwind(handled_inside_handler);
            assert!(handled.is_err());
            Ok::<Response, Infallible>(StatusCode::OK.into_response())
        }));

        let first = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        let res = svc.clone().oneshot(first).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(reports.lock().unwrap().is_empty());

        let res = svc.oneshot(request("")).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].fault_value, "rethrown without the hook");
        assert_eq!(reports[0].location, None);
        assert!(!reports[0].stack.is_empty());
    }

    struct PanicsOnDrop;

    impl Drop for PanicsOnDrop {
        fn drop(&mut self) {
            panic!("payload destructor");
        }
    }

    #[tokio::test]
    async fn payload_destructor_panic_is_contained() {
        let (layer, reports) = collecting_layer();
        let svc = layer.layer(service_fn(|_req: Request<Body>| async {
            if true {
                panic::panic_any(PanicsOnDrop);
            }
            Ok::<Response, Infallible>(StatusCode::OK.into_response())
        }));

        let task = tokio::spawn(svc.oneshot(request("")));
        let res = task.await.expect("guard contained the panic").unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(reports.lock().unwrap()[0].fault_value, "Box<dyn Any>");
    }

    #[tokio::test]
    async fn over_skip_yields_empty_stack() {
        let (layer, reports) = collecting_layer();
        let svc = layer
            .skip_frames(usize::MAX)
            .layer(service_fn(|_req: Request<Body>| async {
                if true {
                    panic!("deep");
                }
                Ok::<Response, Infallible>(StatusCode::OK.into_response())
            }));

        let res = svc.oneshot(request("")).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(reports.lock().unwrap()[0].stack.is_empty());
    }
}
