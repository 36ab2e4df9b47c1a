//! [OpenTelemetry] tracing for beego-style web frameworks served through [tower].
//!
//! The crate wires three pieces around a framework's request pipeline:
//!
//! * [`BeegoTracing`], a tower [`Layer`] starting a server span per request and
//!   naming it `"<METHOD> <route pattern>"` once the framework resolved the route.
//! * [`add_filters`], which registers a `BeforeStatic` filter capturing the
//!   framework's request context so the matched route can be read back.
//! * [`wrap_recover_func`], which overrides the framework's panic-recovery
//!   callback so panics of traced requests reach the tracing layer, where they
//!   are recorded on the span before unwinding continues.
//!
//! [`install`] applies both framework hooks to an [`Application`] in one call.
//!
//! The framework side is described by the traits in the [`framework`] module.
//!
//! ```no_run
//! use opentelemetry::global;
//! use opentelemetry_instrumentation_beego::BeegoTracing;
//! use opentelemetry_sdk::trace::SdkTracerProvider;
//! use tower::ServiceBuilder;
//!
//! # fn wrap<S>(app: S) -> impl Sized {
//! // Configure the provider with the exporter(s) of your choice.
//! let provider = SdkTracerProvider::builder().build();
//! global::set_tracer_provider(provider);
//!
//! // `app` is the framework's tower service; call `install(&mut app)` on the
//! // framework application before serving.
//! ServiceBuilder::new().layer(BeegoTracing::new()).service(app)
//! # }
//! ```
//!
//! [OpenTelemetry]: https://opentelemetry.io
//! [tower]: https://docs.rs/tower

use std::fmt;
use std::sync::Arc;

use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::InstrumentationScope;
use tower_layer::Layer;

mod error;
mod filter;
pub mod framework;
mod middleware;
mod trace;

pub use error::{Error, Result};
pub use filter::{add_filters, before_static, install, wrap_recover_func};
pub use framework::Application;
pub use middleware::{FilterStateFuture, FilterStateLayer, FilterStateService};
pub use trace::{transaction_from_extensions, ResponseFuture, TraceService};

/// Framework name recorded on every traced transaction.
pub const FRAMEWORK_NAME: &str = "beego";

/// Framework version recorded on every traced transaction.
pub const FRAMEWORK_VERSION: &str = "2.0.2";

pub(crate) fn get_scope() -> InstrumentationScope {
    InstrumentationScope::builder("opentelemetry-instrumentation-beego")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(opentelemetry_semantic_conventions::SCHEMA_URL)
        .build()
}

/// Which tracer the builder was told to use.
enum TracerChoice {
    Global,
    Explicit(Option<BoxedTracer>),
}

/// Builder for [`BeegoTracing`].
pub struct BeegoTracingBuilder {
    tracer: TracerChoice,
}

impl fmt::Debug for BeegoTracingBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tracer = match self.tracer {
            TracerChoice::Global => "global",
            TracerChoice::Explicit(Some(_)) => "explicit",
            TracerChoice::Explicit(None) => "none",
        };
        f.debug_struct("BeegoTracingBuilder")
            .field("tracer", &tracer)
            .finish()
    }
}

impl BeegoTracingBuilder {
    /// Tracer used to start server spans.
    ///
    /// Without this call the global tracer provider is used. Passing `None`
    /// is a wiring mistake and makes [`build`](Self::build) fail.
    pub fn with_tracer(mut self, tracer: impl Into<Option<BoxedTracer>>) -> Self {
        self.tracer = TracerChoice::Explicit(tracer.into());
        self
    }

    /// Build the [`BeegoTracing`] layer.
    pub fn build(self) -> Result<BeegoTracing> {
        let tracer = match self.tracer {
            TracerChoice::Global => global::tracer_with_scope(get_scope()),
            TracerChoice::Explicit(Some(tracer)) => tracer,
            TracerChoice::Explicit(None) => {
                return Err(Error::Config(String::from("tracer must not be None")));
            }
        };
        Ok(BeegoTracing {
            tracer: Arc::new(tracer),
        })
    }
}

/// [`Layer`] tracing requests served by a beego-style framework.
///
/// Produces a [`TraceService`] around a [`FilterStateService`] around the
/// framework service.
#[derive(Clone)]
pub struct BeegoTracing {
    tracer: Arc<BoxedTracer>,
}

impl BeegoTracing {
    /// Layer using the global tracer provider.
    pub fn new() -> Self {
        BeegoTracing {
            tracer: Arc::new(global::tracer_with_scope(get_scope())),
        }
    }

    /// Start configuring a [`BeegoTracing`] layer.
    pub fn builder() -> BeegoTracingBuilder {
        BeegoTracingBuilder {
            tracer: TracerChoice::Global,
        }
    }
}

impl Default for BeegoTracing {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BeegoTracing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeegoTracing").finish_non_exhaustive()
    }
}

impl<S> Layer<S> for BeegoTracing {
    type Service = TraceService<FilterStateService<S>>;

    fn layer(&self, service: S) -> Self::Service {
        TraceService::new(FilterStateLayer.layer(service), self.tracer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::trace::SdkTracerProvider;

    #[test]
    fn explicit_none_tracer_is_a_config_error() {
        let err = BeegoTracing::builder().with_tracer(None).build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.to_string(), "config error: tracer must not be None");
    }

    #[test]
    fn explicit_tracer_builds() {
        let provider = SdkTracerProvider::builder().build();
        let tracer = BoxedTracer::new(Box::new(provider.tracer("beego-test")));
        assert!(BeegoTracing::builder().with_tracer(tracer).build().is_ok());
    }

    #[test]
    fn default_builder_uses_global_tracer() {
        assert!(BeegoTracing::builder().build().is_ok());
    }
}
