use thiserror::Error;

/// Errors raised while wiring the beego instrumentation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid configuration supplied to a builder.
    #[error("config error: {0}")]
    Config(String),
}

/// `Result` typedef to use with the `opentelemetry_instrumentation_beego::Error` type
pub type Result<T> = std::result::Result<T, Error>;
