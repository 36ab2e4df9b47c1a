//! Framework-side hooks: route capture and panic-recovery override.

use std::sync::{Arc, Mutex, PoisonError};

use opentelemetry::trace::TraceContextExt;
use opentelemetry::{otel_debug, Context, KeyValue};
use opentelemetry_semantic_conventions::trace::HTTP_ROUTE;

use crate::framework::{
    self, Application, FilterPosition, FilterRegistry, FrameworkContext, PanicPayload,
    RecoverConfig, RecoverFunc,
};
use crate::trace::transaction_from_extensions;
use crate::{FRAMEWORK_NAME, FRAMEWORK_VERSION};

const FRAMEWORK_NAME_ATTRIBUTE: &str = "service.framework.name";
const FRAMEWORK_VERSION_ATTRIBUTE: &str = "service.framework.version";

/// Per-request scratch state shared between the interceptor and the
/// `BeforeStatic` filter. Only ever stored in request extensions.
#[derive(Default)]
pub(crate) struct FilterState {
    context: Mutex<Option<Arc<dyn FrameworkContext>>>,
}

impl FilterState {
    fn capture(&self, context: Arc<dyn FrameworkContext>) {
        *self.context.lock().unwrap_or_else(PoisonError::into_inner) = Some(context);
    }

    // Taking the handle breaks the context -> extensions -> state -> context cycle.
    fn take(&self) -> Option<Arc<dyn FrameworkContext>> {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Extension key wrapping the shared [`FilterState`].
#[derive(Clone, Default)]
pub(crate) struct FilterStateHandle(pub(crate) Arc<FilterState>);

/// Writes the framework identity and, when a route was captured, the route
/// name onto the request's server span.
pub(crate) fn set_transaction_context(cx: &Context, state: &FilterState) {
    let span = cx.span();
    span.set_attribute(KeyValue::new(FRAMEWORK_NAME_ATTRIBUTE, FRAMEWORK_NAME));
    span.set_attribute(KeyValue::new(FRAMEWORK_VERSION_ATTRIBUTE, FRAMEWORK_VERSION));

    let Some(context) = state.take() else {
        return;
    };
    if let Some(route) = framework::route_pattern(&*context) {
        span.update_name(format!("{} {}", context.request().method, route));
        span.set_attribute(KeyValue::new(HTTP_ROUTE, route));
    }
}

/// `BeforeStatic` filter storing the framework context of traced requests so
/// the route pattern can be read once the request completes.
pub fn before_static<C: FrameworkContext>(context: &Arc<C>) {
    let extensions = &context.request().extensions;
    if let Some(FilterStateHandle(state)) = extensions.get::<FilterStateHandle>() {
        let context: Arc<dyn FrameworkContext> = context.clone();
        state.capture(context);
    }
}

/// Registers the route capture filter ahead of every other phase, for all paths.
///
/// [`install`] calls this for you.
pub fn add_filters<C, R>(handlers: &mut R)
where
    C: FrameworkContext,
    R: FilterRegistry<C> + ?Sized,
{
    handlers.insert_filter("*", FilterPosition::BeforeStatic, Arc::new(before_static::<C>));
}

/// Replaces the configuration's recovery callback so that panics of traced
/// requests propagate to the tracing middleware, which reports them.
///
/// Untraced requests keep the original behavior. When no callback was
/// configured, nothing is invoked and the panic keeps propagating.
///
/// [`install`] calls this for you.
pub fn wrap_recover_func<Cfg: RecoverConfig>(config: &mut Cfg) {
    let original = config.recover_func();
    let wrapped: RecoverFunc<Cfg::Context, Cfg> = Arc::new(
        move |context: &Arc<Cfg::Context>, config: &Cfg, payload: PanicPayload| {
            if transaction_from_extensions(&context.request().extensions).is_some() {
                return Err(payload);
            }
            match &original {
                Some(recover) => recover(context, config, payload),
                None => Err(payload),
            }
        },
    );
    config.set_recover_func(Some(wrapped));
}

#[derive(Clone)]
struct Installed;

/// Adds the route capture filter and the recovery override to `app`.
///
/// Repeated calls on the same application are no-ops. Returns `true` when the
/// hooks were installed by this call.
pub fn install<A: Application + ?Sized>(app: &mut A) -> bool {
    if app.extensions_mut().get::<Installed>().is_some() {
        return false;
    }
    add_filters::<A::Context, A::Handlers>(app.handlers_mut());
    wrap_recover_func(app.config_mut());
    app.extensions_mut().insert(Installed);
    otel_debug!(name: "Beego.Installed");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::{DataValue, ROUTER_PATTERN_KEY};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestContext {
        parts: http::request::Parts,
        data: Mutex<HashMap<String, DataValue>>,
    }

    impl TestContext {
        fn new(extensions: http::Extensions) -> Arc<Self> {
            let mut request = http::Request::get("/users/7").body(()).unwrap();
            *request.extensions_mut() = extensions;
            let (parts, _) = request.into_parts();
            Arc::new(TestContext {
                parts,
                data: Mutex::new(HashMap::new()),
            })
        }

        fn set_route(&self, route: &str) {
            self.data
                .lock()
                .unwrap()
                .insert(ROUTER_PATTERN_KEY.to_owned(), Arc::new(route.to_owned()));
        }
    }

    impl FrameworkContext for TestContext {
        fn request(&self) -> &http::request::Parts {
            &self.parts
        }

        fn get_data(&self, key: &str) -> Option<DataValue> {
            self.data.lock().unwrap().get(key).cloned()
        }
    }

    #[derive(Default)]
    struct TestRegistry {
        filters: Vec<(String, FilterPosition)>,
    }

    impl FilterRegistry<TestContext> for TestRegistry {
        fn insert_filter(
            &mut self,
            pattern: &str,
            position: FilterPosition,
            _filter: framework::FilterFunc<TestContext>,
        ) {
            self.filters.push((pattern.to_owned(), position));
        }
    }

    #[derive(Default)]
    struct TestConfig {
        recover: Option<RecoverFunc<TestContext, TestConfig>>,
    }

    impl RecoverConfig for TestConfig {
        type Context = TestContext;

        fn recover_func(&self) -> Option<RecoverFunc<TestContext, TestConfig>> {
            self.recover.clone()
        }

        fn set_recover_func(&mut self, recover: Option<RecoverFunc<TestContext, TestConfig>>) {
            self.recover = recover;
        }
    }

    #[derive(Default)]
    struct TestApp {
        handlers: TestRegistry,
        config: TestConfig,
        extensions: http::Extensions,
    }

    impl Application for TestApp {
        type Context = TestContext;
        type Handlers = TestRegistry;
        type Config = TestConfig;

        fn handlers_mut(&mut self) -> &mut TestRegistry {
            &mut self.handlers
        }

        fn config_mut(&mut self) -> &mut TestConfig {
            &mut self.config
        }

        fn extensions_mut(&mut self) -> &mut http::Extensions {
            &mut self.extensions
        }
    }

    fn extensions_with_state() -> (http::Extensions, Arc<FilterState>) {
        let handle = FilterStateHandle::default();
        let state = handle.0.clone();
        let mut extensions = http::Extensions::new();
        extensions.insert(handle);
        (extensions, state)
    }

    #[test]
    fn before_static_captures_context_of_instrumented_request() {
        let (extensions, state) = extensions_with_state();
        let context = TestContext::new(extensions);
        context.set_route("/users/:id");

        before_static(&context);
        before_static(&context);

        let captured = state.take().expect("context captured");
        assert_eq!(
            framework::route_pattern(&*captured).as_deref(),
            Some("/users/:id")
        );
        assert!(state.take().is_none());
    }

    #[test]
    fn before_static_ignores_uninstrumented_request() {
        let context = TestContext::new(http::Extensions::new());
        before_static(&context);
        assert_eq!(Arc::strong_count(&context), 1);
    }

    #[test]
    fn add_filters_registers_before_static_for_all_paths() {
        let mut registry = TestRegistry::default();
        add_filters(&mut registry);
        assert_eq!(
            registry.filters,
            vec![(String::from("*"), FilterPosition::BeforeStatic)]
        );
    }

    #[test]
    fn wrapped_recover_calls_original_for_untraced_request() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut config = TestConfig {
            recover: Some(Arc::new(
                move |context: &Arc<TestContext>,
                      _config: &TestConfig,
                      payload: PanicPayload|
                      -> std::result::Result<(), PanicPayload> {
                    seen.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(context.request().uri.path(), "/users/7");
                    assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
                    Ok(())
                },
            )),
        };
        wrap_recover_func(&mut config);

        let context = TestContext::new(http::Extensions::new());
        let recover = config.recover_func().unwrap();
        assert!(recover(&context, &config, Box::new("boom")).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wrapped_recover_without_original_hands_panic_back() {
        let mut config = TestConfig::default();
        wrap_recover_func(&mut config);

        let context = TestContext::new(http::Extensions::new());
        let recover = config.recover_func().unwrap();
        let payload = recover(&context, &config, Box::new("boom")).unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
    }

    #[test]
    fn install_is_idempotent() {
        let mut app = TestApp::default();
        assert!(install(&mut app));
        assert!(!install(&mut app));
        assert_eq!(app.handlers.filters.len(), 1);
        assert!(app.config.recover_func().is_some());
    }
}
