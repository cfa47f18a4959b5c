mod client;
mod eval;
mod hash;
mod model;
mod store;

pub mod replication;

pub use client::{Client, ClientOptions, GetOptions, RestoreOptions};
pub use eval::{evaluate, Outcome};
pub use hash::{fnv1a, fnv1a_unit};
pub use model::{Condition, Config, Context, Override, ReplayBody, Snapshot, StreamEvent};
pub use replication::transport::{ByteStream, Connector, HttpConnector, StreamRequest};
pub use store::{ConfigUpdate, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid client options: {0}")]
    InvalidOptions(String),
    #[error("config {0:?} was not found")]
    NotFound(String),
    #[error("required configs were never received: {}", .0.join(", "))]
    MissingRequired(Vec<String>),
    #[error("timed out waiting for the replication stream")]
    Timeout,
    #[error(transparent)]
    Network(#[from] reqwest::Error),
    #[error("the SDK key was rejected (HTTP 401)")]
    Auth,
    #[error("access to the project is forbidden (HTTP 403)")]
    Forbidden,
    #[error("the replication endpoint was not found (HTTP 404)")]
    EndpointNotFound,
    #[error("server error (HTTP {0})")]
    Server(u16),
    #[error("client error (HTTP {0})")]
    Client(u16),
    #[error("unexpected content type {0:?}")]
    ContentType(String),
    #[error("the client is closed")]
    Closed,
    #[error("the client has not finished initializing")]
    NotInitialized,
    #[error("the replication stream ended unexpectedly")]
    UnexpectedEof,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable wire code of this error class, as reported by the service.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidOptions(_) => "invalid_options",
            Error::NotFound(_) | Error::MissingRequired(_) | Error::EndpointNotFound => "not_found",
            Error::Timeout => "timeout",
            Error::Network(_) => "network_error",
            Error::Auth => "auth_error",
            Error::Forbidden => "forbidden",
            Error::Server(_) | Error::ContentType(_) => "server_error",
            Error::Client(_) => "client_error",
            Error::Closed => "closed",
            Error::NotInitialized => "not_initialized",
            Error::UnexpectedEof | Error::Json(_) => "unknown",
        }
    }

    // A definitive response tells us the server understood the request and
    // refused it; retrying before the client is ready would only mask it.
    pub(crate) fn is_definitive(&self) -> bool {
        matches!(
            self,
            Error::Auth
                | Error::Forbidden
                | Error::EndpointNotFound
                | Error::Server(_)
                | Error::Client(_)
                | Error::ContentType(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
