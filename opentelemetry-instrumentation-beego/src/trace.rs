//! Server span lifecycle for inbound HTTP requests.
//!
//! [`TraceService`] starts a server span for every request, stores the
//! resulting trace context in the request extensions and keeps it attached
//! while the downstream service runs. Panics raised downstream are recorded on
//! the span and then resumed untouched.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{otel_debug, Context, KeyValue};
use opentelemetry_http::HeaderExtractor;
use opentelemetry_semantic_conventions::trace::{
    ERROR_TYPE, EXCEPTION_MESSAGE, EXCEPTION_TYPE, HTTP_REQUEST_METHOD, HTTP_RESPONSE_STATUS_CODE,
    NETWORK_PROTOCOL_VERSION, URL_PATH, URL_SCHEME,
};
use pin_project_lite::pin_project;
use tower_service::Service;

const EXCEPTION_EVENT_NAME: &str = "exception";
const PANIC_EXCEPTION_TYPE: &str = "panic";
const OTHER_ERROR_TYPE: &str = "_OTHER";

/// Private extension key holding the trace context of a request.
#[derive(Clone, Debug)]
struct RequestTraceContext(Context);

/// Returns the trace context of the request owning `extensions` when it
/// carries a sampled server span, i.e. when the request is being traced.
pub fn transaction_from_extensions(extensions: &http::Extensions) -> Option<Context> {
    let RequestTraceContext(cx) = extensions.get::<RequestTraceContext>()?;
    let span = cx.span();
    let span_context = span.span_context();
    if span_context.is_valid() && span_context.is_sampled() {
        Some(cx.clone())
    } else {
        None
    }
}

/// Span name used until the framework reports the matched route.
pub(crate) fn unknown_route_name(method: &http::Method) -> String {
    format!("{method} unknown route")
}

/// [`Service`] starting a server span around each request.
pub struct TraceService<S> {
    inner: S,
    tracer: Arc<BoxedTracer>,
}

impl<S> TraceService<S> {
    pub(crate) fn new(inner: S, tracer: Arc<BoxedTracer>) -> Self {
        TraceService { inner, tracer }
    }
}

impl<S: Clone> Clone for TraceService<S> {
    fn clone(&self) -> Self {
        TraceService {
            inner: self.inner.clone(),
            tracer: self.tracer.clone(),
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for TraceService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceService")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for TraceService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<ReqBody>) -> Self::Future {
        let parent_cx = global::get_text_map_propagator(|propagator| {
            propagator.extract(&HeaderExtractor(req.headers()))
        });

        let mut attributes = vec![
            KeyValue::new(HTTP_REQUEST_METHOD, req.method().as_str().to_owned()),
            KeyValue::new(URL_PATH, req.uri().path().to_owned()),
            KeyValue::new(NETWORK_PROTOCOL_VERSION, protocol_version(req.version())),
        ];
        if let Some(scheme) = req.uri().scheme_str() {
            attributes.push(KeyValue::new(URL_SCHEME, scheme.to_owned()));
        }

        let span = self
            .tracer
            .span_builder(unknown_route_name(req.method()))
            .with_kind(SpanKind::Server)
            .with_attributes(attributes)
            .start_with_context(&*self.tracer, &parent_cx);
        let cx = parent_cx.with_span(span);
        req.extensions_mut()
            .insert(RequestTraceContext(cx.clone()));

        let called = {
            let _guard = cx.clone().attach();
            panic::catch_unwind(AssertUnwindSafe(|| self.inner.call(req)))
        };
        match called {
            Ok(inner) => ResponseFuture {
                inner: Some(inner),
                cx,
            },
            Err(payload) => {
                record_panic(&cx, payload.as_ref());
                cx.span().end();
                panic::resume_unwind(payload)
            }
        }
    }
}

pin_project! {
    /// Response [`Future`] for [`TraceService`].
    ///
    /// The span ends when the downstream future completes, panics or is
    /// dropped, whichever happens first.
    ///
    /// # Panics
    ///
    /// Polling again after the future returned [`Poll::Ready`] panics, since
    /// the downstream future has already been released.
    pub struct ResponseFuture<F> {
        #[pin]
        inner: Option<F>,
        cx: Context,
    }

    impl<F> PinnedDrop for ResponseFuture<F> {
        fn drop(this: Pin<&mut Self>) {
            let mut this = this.project();
            // Whatever runs when the downstream future drops must still see a live span.
            this.inner.set(None);
            this.cx.span().end();
        }
    }
}

impl<F, ResBody, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<http::Response<ResBody>, E>>,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        let inner = this
            .inner
            .as_mut()
            .as_pin_mut()
            .expect("ResponseFuture polled after completion");

        let polled = {
            let _guard = this.cx.clone().attach();
            panic::catch_unwind(AssertUnwindSafe(|| inner.poll(task_cx)))
        };
        match polled {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(result)) => {
                this.inner.set(None);
                match &result {
                    Ok(response) => record_status(this.cx, response.status()),
                    Err(_) => {
                        let span = this.cx.span();
                        span.set_attribute(KeyValue::new(ERROR_TYPE, OTHER_ERROR_TYPE));
                        span.set_status(Status::error("request failed"));
                    }
                }
                this.cx.span().end();
                Poll::Ready(result)
            }
            Err(payload) => {
                this.inner.set(None);
                record_panic(this.cx, payload.as_ref());
                this.cx.span().end();
                panic::resume_unwind(payload)
            }
        }
    }
}

fn record_status(cx: &Context, status: http::StatusCode) {
    let span = cx.span();
    span.set_attribute(KeyValue::new(
        HTTP_RESPONSE_STATUS_CODE,
        i64::from(status.as_u16()),
    ));
    if status.is_client_error() || status.is_server_error() {
        span.set_attribute(KeyValue::new(ERROR_TYPE, status.as_str().to_owned()));
    }
    // Client errors are not failures of the server span.
    if status.is_server_error() {
        span.set_status(Status::error(""));
    }
}

fn record_panic(cx: &Context, payload: &(dyn Any + Send)) {
    let message = panic_message(payload);
    otel_debug!(
        name: "Beego.PanicCaptured",
        message = message.as_str()
    );

    let span = cx.span();
    span.add_event(
        EXCEPTION_EVENT_NAME,
        vec![
            KeyValue::new(EXCEPTION_TYPE, PANIC_EXCEPTION_TYPE),
            KeyValue::new(EXCEPTION_MESSAGE, message),
        ],
    );
    span.set_attribute(KeyValue::new(ERROR_TYPE, PANIC_EXCEPTION_TYPE));
    span.set_status(Status::error(PANIC_EXCEPTION_TYPE));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("Box<dyn Any>")
    }
}

fn protocol_version(version: http::Version) -> &'static str {
    match version {
        http::Version::HTTP_09 => "0.9",
        http::Version::HTTP_10 => "1.0",
        http::Version::HTTP_11 => "1.1",
        http::Version::HTTP_2 => "2",
        http::Version::HTTP_3 => "3",
        _ => "",
    }
}
