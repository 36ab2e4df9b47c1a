use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures_util::ready;
use opentelemetry::{otel_debug, Context};
use pin_project_lite::pin_project;
use tower_layer::Layer;
use tower_service::Service;

use crate::filter::{set_transaction_context, FilterState, FilterStateHandle};
use crate::trace::transaction_from_extensions;

/// [`Layer`] attaching per-request filter state to traced requests.
///
/// Must sit inside a layer that stores the request's trace context, such as
/// [`BeegoTracing`](crate::BeegoTracing), which already includes it.
#[derive(Clone, Copy, Debug, Default)]
pub struct FilterStateLayer;

impl<S> Layer<S> for FilterStateLayer {
    type Service = FilterStateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        FilterStateService { inner }
    }
}

/// [`Service`] used by [`FilterStateLayer`].
#[derive(Clone, Debug)]
pub struct FilterStateService<S> {
    inner: S,
}

impl<S, ReqBody> Service<http::Request<ReqBody>> for FilterStateService<S>
where
    S: Service<http::Request<ReqBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = FilterStateFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<ReqBody>) -> Self::Future {
        // Untraced requests are forwarded untouched.
        let finalizer = transaction_from_extensions(req.extensions()).map(|cx| {
            let handle = FilterStateHandle::default();
            let state = handle.0.clone();
            req.extensions_mut().insert(handle);
            otel_debug!(
                name: "Beego.FilterStateInstalled",
                path = req.uri().path()
            );
            Finalizer { cx, state }
        });

        FilterStateFuture {
            inner: self.inner.call(req),
            finalizer,
        }
    }
}

/// Names the transaction when dropped, whichever way the request ends.
struct Finalizer {
    cx: Context,
    state: Arc<FilterState>,
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        set_transaction_context(&self.cx, &self.state);
    }
}

impl fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finalizer").finish_non_exhaustive()
    }
}

pin_project! {
    /// Response [`Future`] for [`FilterStateService`].
    pub struct FilterStateFuture<F> {
        #[pin]
        inner: F,
        finalizer: Option<Finalizer>,
    }
}

impl<F: Future> Future for FilterStateFuture<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let output = ready!(this.inner.poll(cx));
        drop(this.finalizer.take());
        Poll::Ready(output)
    }
}
