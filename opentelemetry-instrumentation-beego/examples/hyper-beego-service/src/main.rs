use http::request::Parts;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Method, Request, Response, StatusCode};
use opentelemetry::global;
use opentelemetry_instrumentation_beego::framework::{
    Application, DataValue, FilterFunc, FilterPosition, FilterRegistry, FrameworkContext,
    PanicPayload, RecoverConfig, RecoverFunc, ROUTER_PATTERN_KEY,
};
use opentelemetry_instrumentation_beego::{install, BeegoTracing};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use tokio::net::TcpListener;
use tower::{Service, ServiceBuilder};

const SERVICE_NAME: &str = "example-hyper-beego-service";

type Handler = fn(&RequestContext) -> Response<Full<Bytes>>;

/// Per-request context of the toy framework below.
struct RequestContext {
    parts: Parts,
    data: Mutex<HashMap<String, DataValue>>,
}

impl FrameworkContext for RequestContext {
    fn request(&self) -> &Parts {
        &self.parts
    }

    fn get_data(&self, key: &str) -> Option<DataValue> {
        self.data.lock().ok()?.get(key).cloned()
    }
}

#[derive(Default)]
struct Router {
    filters: Vec<(String, FilterPosition, FilterFunc<RequestContext>)>,
    routes: Vec<(Method, &'static str, Handler)>,
}

impl FilterRegistry<RequestContext> for Router {
    fn insert_filter(
        &mut self,
        pattern: &str,
        position: FilterPosition,
        filter: FilterFunc<RequestContext>,
    ) {
        self.filters.push((pattern.to_owned(), position, filter));
    }
}

#[derive(Default)]
struct Settings {
    recover_func: Option<RecoverFunc<RequestContext, Settings>>,
}

impl RecoverConfig for Settings {
    type Context = RequestContext;

    fn recover_func(&self) -> Option<RecoverFunc<RequestContext, Settings>> {
        self.recover_func.clone()
    }

    fn set_recover_func(&mut self, recover: Option<RecoverFunc<RequestContext, Settings>>) {
        self.recover_func = recover;
    }
}

#[derive(Default)]
struct App {
    router: Router,
    settings: Settings,
    extensions: http::Extensions,
}

impl Application for App {
    type Context = RequestContext;
    type Handlers = Router;
    type Config = Settings;

    fn handlers_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    fn config_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    fn extensions_mut(&mut self) -> &mut http::Extensions {
        &mut self.extensions
    }
}

impl App {
    fn get(&mut self, pattern: &'static str, handler: Handler) {
        self.router.routes.push((Method::GET, pattern, handler));
    }

    fn serve(&self, parts: Parts) -> Response<Full<Bytes>> {
        let context = Arc::new(RequestContext {
            parts,
            data: Mutex::new(HashMap::new()),
        });
        let path = context.parts.uri.path().to_owned();

        for (pattern, position, filter) in &self.router.filters {
            if *position == FilterPosition::BeforeStatic && (pattern == "*" || *pattern == path) {
                filter(&context);
            }
        }

        let route = self.router.routes.iter().find(|(method, pattern, _)| {
            *method == context.parts.method && matches_route(pattern, &path)
        });
        let Some((_, pattern, handler)) = route else {
            return text(StatusCode::NOT_FOUND, "not found\n");
        };
        if let Ok(mut data) = context.data.lock() {
            data.insert(ROUTER_PATTERN_KEY.to_owned(), Arc::new(pattern.to_string()));
        }

        match panic::catch_unwind(AssertUnwindSafe(|| handler(&context))) {
            Ok(response) => response,
            Err(payload) => match self.settings.recover_func() {
                Some(recover) => match recover(&context, &self.settings, payload) {
                    Ok(()) => text(StatusCode::INTERNAL_SERVER_ERROR, "internal error\n"),
                    Err(payload) => panic::resume_unwind(payload),
                },
                None => panic::resume_unwind(payload),
            },
        }
    }
}

/// Tower entry point of the application.
#[derive(Clone)]
struct AppService(Arc<App>);

impl<B> Service<Request<B>> for AppService {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let (parts, _body) = req.into_parts();
        ready(Ok(self.0.serve(parts)))
    }
}

// `:name` segments match any single path segment.
fn matches_route(pattern: &str, path: &str) -> bool {
    let expected = pattern.split('/');
    let actual = path.split('/');
    expected.clone().count() == actual.clone().count()
        && expected
            .zip(actual)
            .all(|(expected, actual)| expected.starts_with(':') || expected == actual)
}

fn text(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_owned())));
    *response.status_mut() = status;
    response
}

fn index(_context: &RequestContext) -> Response<Full<Bytes>> {
    text(StatusCode::OK, "hello world\n")
}

fn user(context: &RequestContext) -> Response<Full<Bytes>> {
    let id = context.parts.uri.path().rsplit('/').next().unwrap_or_default();
    text(StatusCode::OK, &format!("user {id}\n"))
}

fn broken(_context: &RequestContext) -> Response<Full<Bytes>> {
    panic!("handler failed")
}

fn init_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
        .with_resource(Resource::builder().with_service_name(SERVICE_NAME).build())
        .build()
}

#[tokio::main]
async fn main() {
    let provider = init_tracer_provider();
    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(TraceContextPropagator::new());

    let mut app = App::default();
    app.get("/", index);
    app.get("/users/:id", user);
    app.get("/broken", broken);
    // Only untraced requests reach this callback; traced panics unwind into the
    // connection task after being recorded on their span.
    let recover: RecoverFunc<RequestContext, Settings> = Arc::new(
        |context: &Arc<RequestContext>,
         _settings: &Settings,
         _payload: PanicPayload|
         -> Result<(), PanicPayload> {
            eprintln!("recovered panic on {}", context.parts.uri.path());
            Ok(())
        },
    );
    app.settings.recover_func = Some(recover);
    install(&mut app);

    let tower_service = ServiceBuilder::new()
        .layer(BeegoTracing::new())
        .service(AppService(Arc::new(app)));
    let hyper_service = hyper_util::service::TowerToHyperService::new(tower_service);

    let addr = SocketAddr::from(([0, 0, 0, 0], 5000));
    let listener = TcpListener::bind(addr).await.unwrap();

    loop {
        let (stream, _) = listener.accept().await.unwrap();

        let io = hyper_util::rt::TokioIo::new(stream);
        let service_clone = hyper_service.clone();

        tokio::task::spawn(async move {
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service_clone)
                .await
            {
                eprintln!("server error: {}", err);
            }
        });
    }
}
