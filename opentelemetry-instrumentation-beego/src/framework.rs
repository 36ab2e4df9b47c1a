//! Hooks a beego-style web framework exposes to this instrumentation.
//!
//! The middleware never routes or dispatches requests itself. It only needs a
//! filter chain to register a hook on, a per-request context carrying the
//! request head and the framework's metadata store, and a global configuration
//! whose panic-recovery callback can be replaced. Frameworks implement the
//! traits below to plug in.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Key under which the framework stores the matched route pattern, e.g.
/// `/users/:id`, in the per-request metadata store.
pub const ROUTER_PATTERN_KEY: &str = "RouterPattern";

/// Value stored in the per-request metadata store.
pub type DataValue = Arc<dyn Any + Send + Sync>;

/// Payload of a caught panic, as produced by [`std::panic::catch_unwind`].
pub type PanicPayload = Box<dyn Any + Send + 'static>;

/// A filter invoked by the framework with the current request context.
pub type FilterFunc<C> = Arc<dyn Fn(&Arc<C>) + Send + Sync + 'static>;

/// Panic-recovery callback.
///
/// The framework calls it with the request context, its configuration and the
/// panic payload whenever a handler panics. Returning `Ok(())` means the panic
/// was dealt with and the framework answers the request itself. Returning the
/// payload back as `Err` makes the framework resume unwinding with it.
pub type RecoverFunc<C, Cfg> =
    Arc<dyn Fn(&Arc<C>, &Cfg, PanicPayload) -> Result<(), PanicPayload> + Send + Sync + 'static>;

/// Points in the request lifecycle at which filters run, in evaluation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterPosition {
    /// Before static files are looked up. First phase of every request.
    BeforeStatic,
    /// Before the router resolves a controller.
    BeforeRouter,
    /// After routing, before the controller runs.
    BeforeExec,
    /// After the controller returned.
    AfterExec,
    /// After the response was written.
    FinishRouter,
}

impl fmt::Display for FilterPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterPosition::BeforeStatic => "BeforeStatic",
            FilterPosition::BeforeRouter => "BeforeRouter",
            FilterPosition::BeforeExec => "BeforeExec",
            FilterPosition::AfterExec => "AfterExec",
            FilterPosition::FinishRouter => "FinishRouter",
        };
        f.write_str(name)
    }
}

/// Per-request context owned by the framework.
pub trait FrameworkContext: Send + Sync + 'static {
    /// Head of the request being served, including the extensions populated
    /// by the middleware stack in front of the framework.
    fn request(&self) -> &http::request::Parts;

    /// Looks up a value in the framework's per-request metadata store.
    fn get_data(&self, key: &str) -> Option<DataValue>;
}

/// The framework's filter chain.
pub trait FilterRegistry<C> {
    /// Registers `filter` to run for requests whose path matches `pattern`
    /// at the given lifecycle `position`.
    fn insert_filter(&mut self, pattern: &str, position: FilterPosition, filter: FilterFunc<C>);
}

/// The framework's global configuration, restricted to the panic-recovery field.
pub trait RecoverConfig: Sized + 'static {
    /// Request context type handed to the recovery callback.
    type Context: FrameworkContext;

    /// Currently configured recovery callback, if any.
    fn recover_func(&self) -> Option<RecoverFunc<Self::Context, Self>>;

    /// Replaces the recovery callback.
    fn set_recover_func(&mut self, recover: Option<RecoverFunc<Self::Context, Self>>);
}

/// A framework application: filter chain plus global configuration.
pub trait Application {
    /// Per-request context type.
    type Context: FrameworkContext;
    /// Filter chain type.
    type Handlers: FilterRegistry<Self::Context>;
    /// Global configuration type.
    type Config: RecoverConfig<Context = Self::Context>;

    /// The application's filter chain.
    fn handlers_mut(&mut self) -> &mut Self::Handlers;

    /// The application's global configuration.
    fn config_mut(&mut self) -> &mut Self::Config;

    /// Application-scoped typed storage, used to remember what was installed.
    fn extensions_mut(&mut self) -> &mut http::Extensions;
}

/// Reads the matched route pattern of a request, if the framework resolved one.
pub(crate) fn route_pattern(context: &dyn FrameworkContext) -> Option<String> {
    let data = context.get_data(ROUTER_PATTERN_KEY)?;
    if let Some(route) = data.downcast_ref::<String>() {
        return Some(route.clone());
    }
    data.downcast_ref::<&'static str>()
        .map(|route| (*route).to_owned())
}
