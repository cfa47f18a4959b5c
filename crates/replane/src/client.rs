use crate::eval;
use crate::model::{Config, Context, Snapshot};
use crate::replication::transport::{Connector, HttpConnector};
use crate::replication::{Driver, InitSignal};
use crate::store::{ConfigUpdate, Store, Subscription};
use crate::Error;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const STREAM_PATH: &str = "api/sdk/v1/replication/stream";

/// Options for [`Client::connect`]. `sdk_key` and `base_url` are required;
/// everything else has a serviceable default:
///
/// ```
/// # use replane::ClientOptions;
/// let options = ClientOptions {
///     sdk_key: "sk_...".to_string(),
///     base_url: "https://config.example.com".to_string(),
///     ..ClientOptions::default()
/// };
/// ```
#[derive(Clone)]
pub struct ClientOptions {
    pub sdk_key: String,
    /// Service base URL; trailing slashes are stripped before use.
    pub base_url: String,
    /// Transport override. `None` uses [`HttpConnector`].
    pub connector: Option<Arc<dyn Connector>>,
    /// Abort a connection attempt whose response has not arrived in time.
    pub request_timeout: Duration,
    /// How long [`Client::connect`] waits for the first replication event
    /// before falling back or failing.
    pub initialization_timeout: Duration,
    /// Reconnect when the stream goes silent for this long.
    pub inactivity_timeout: Duration,
    /// Base delay of the exponential reconnect backoff.
    pub retry_delay: Duration,
    /// Client-level evaluation context; per-call contexts merge over it.
    pub context: Context,
    /// Names that must be present for a fallback-satisfied initialization.
    pub required: Vec<String>,
    /// Seed values served until the server state arrives.
    pub fallbacks: BTreeMap<String, Value>,
    /// `User-Agent` string; `None` sends a version-stamped default.
    pub agent: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            sdk_key: String::new(),
            base_url: String::new(),
            connector: None,
            request_timeout: Duration::from_millis(2_000),
            initialization_timeout: Duration::from_millis(5_000),
            inactivity_timeout: Duration::from_millis(30_000),
            retry_delay: Duration::from_millis(200),
            context: Context::new(),
            required: Vec::new(),
            fallbacks: BTreeMap::new(),
            agent: None,
        }
    }
}

/// Options for [`Client::restore`].
#[derive(Clone)]
pub struct RestoreOptions {
    pub snapshot: Snapshot,
    /// When present, a replication stream is started in the background and
    /// the snapshot values are live-updated.
    pub connection: Option<ClientOptions>,
    /// Overrides entries of the context captured in the snapshot.
    pub context: Option<Context>,
}

/// Per-call options of [`Client::get_with`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Merged over the client context for this call only.
    pub context: Option<Context>,
    /// Returned when the name is unknown. `Some(Value::Null)` is a provided
    /// null default, distinct from no default at all.
    pub default_value: Option<Value>,
}

/// Handle to one project's configuration. Cheap to clone; all clones share
/// the same store and replication stream. The stream lives until `close` is
/// called or the last handle is dropped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

struct Inner {
    store: Arc<Store>,
    context: Context,
    cancel: CancellationToken,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Ok(mut driver) = self.driver.lock() {
            if let Some(task) = driver.take() {
                task.abort();
            }
        }
    }
}

impl Client {
    /// Open a streaming client and wait until it can serve reads: either the
    /// first replication event arrived, or the initialization timeout passed
    /// with fallbacks covering every required name.
    pub async fn connect(options: ClientOptions) -> crate::Result<Client> {
        if options.sdk_key.is_empty() {
            return Err(Error::InvalidOptions("sdk_key must not be empty".to_string()));
        }
        let endpoint = endpoint(&options.base_url)?;

        let store = Arc::new(Store::default());
        store.seed(fallback_configs(&options.fallbacks));

        let cancel = CancellationToken::new();
        let (init, ready) = InitSignal::new();
        let task = tokio::spawn(
            Driver {
                connector: connector_of(&options),
                endpoint,
                sdk_key: options.sdk_key.clone(),
                agent: Some(options.agent.clone().unwrap_or_else(default_agent)),
                required: options.required.clone(),
                request_timeout: options.request_timeout,
                inactivity_timeout: options.inactivity_timeout,
                retry_delay: options.retry_delay,
                store: store.clone(),
                init,
                cancel: cancel.clone(),
            }
            .run(),
        );

        let client = Client {
            inner: Arc::new(Inner {
                store,
                context: options.context.clone(),
                cancel,
                driver: Mutex::new(Some(task)),
            }),
        };

        match tokio::time::timeout(options.initialization_timeout, ready).await {
            Ok(Ok(Ok(()))) => Ok(client),
            Ok(Ok(Err(err))) => {
                client.close();
                Err(err)
            }
            // The driver resolved nothing and is gone; only close (or a
            // panic in the driver task) does that.
            Ok(Err(_recv)) => {
                let was_closed = client.inner.cancel.is_cancelled();
                client.close();
                Err(if was_closed { Error::Closed } else { Error::UnexpectedEof })
            }
            Err(_elapsed) => {
                if options.fallbacks.is_empty() {
                    client.close();
                    return Err(Error::Timeout);
                }
                let missing: Vec<String> = options
                    .required
                    .iter()
                    .filter(|name| !client.inner.store.contains(name))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    client.close();
                    return Err(Error::MissingRequired(missing));
                }
                // Serving fallbacks; the driver keeps trying in the background.
                Ok(client)
            }
        }
    }

    /// Hydrate a client from a snapshot. The handle is immediately usable
    /// with the snapshot's values; with a `connection`, live updates stream
    /// in the background.
    pub fn restore(options: RestoreOptions) -> crate::Result<Client> {
        let RestoreOptions {
            snapshot,
            connection,
            context,
        } = options;

        let mut effective = snapshot.context.unwrap_or_default();
        if let Some(overrides) = context {
            effective.extend(overrides);
        }

        let store = Arc::new(Store::default());
        store.seed(snapshot.configs);

        let cancel = CancellationToken::new();
        let mut task = None;
        if let Some(connection) = connection {
            if connection.sdk_key.is_empty() {
                return Err(Error::InvalidOptions("sdk_key must not be empty".to_string()));
            }
            let endpoint = endpoint(&connection.base_url)?;
            task = Some(tokio::spawn(
                Driver {
                    connector: connector_of(&connection),
                    endpoint,
                    sdk_key: connection.sdk_key.clone(),
                    agent: Some(connection.agent.clone().unwrap_or_else(default_agent)),
                    required: connection.required.clone(),
                    request_timeout: connection.request_timeout,
                    inactivity_timeout: connection.inactivity_timeout,
                    retry_delay: connection.retry_delay,
                    store: store.clone(),
                    // The snapshot already made this handle ready.
                    init: InitSignal::resolved(),
                    cancel: cancel.clone(),
                }
                .run(),
            ));
        }

        Ok(Client {
            inner: Arc::new(Inner {
                store,
                context: effective,
                cancel,
                driver: Mutex::new(task),
            }),
        })
    }

    /// A client over literal records, with no server behind it. Useful for
    /// tests and local tooling; `close` is a no-op and events never arrive.
    pub fn in_memory(configs: impl IntoIterator<Item = Config>, context: Context) -> Client {
        let store = Arc::new(Store::default());
        store.seed(configs);
        Client {
            inner: Arc::new(Inner {
                store,
                context,
                cancel: CancellationToken::new(),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Current value of `name` under the client context.
    pub fn get(&self, name: &str) -> crate::Result<Value> {
        self.get_with(name, GetOptions::default())
    }

    /// Current value of `name` with per-call context and default handling.
    pub fn get_with(&self, name: &str, options: GetOptions) -> crate::Result<Value> {
        let Some(config) = self.inner.store.get(name) else {
            return options
                .default_value
                .ok_or_else(|| Error::NotFound(name.to_string()));
        };
        let value = match options.context {
            None => eval::evaluate(&config.value, &config.overrides, &self.inner.context),
            Some(overrides) => {
                let mut merged = self.inner.context.clone();
                merged.extend(overrides);
                eval::evaluate(&config.value, &config.overrides, &merged)
            }
        };
        Ok(value.clone())
    }

    /// Subscribe to every config change.
    pub fn subscribe(
        &self,
        callback: impl Fn(&ConfigUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.store.subscribe(None, Arc::new(callback))
    }

    /// Subscribe to changes of a single config.
    pub fn subscribe_key(
        &self,
        name: impl Into<String>,
        callback: impl Fn(&ConfigUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.store.subscribe(Some(name.into()), Arc::new(callback))
    }

    /// A defensive copy of the store plus the client context, suitable for
    /// embedding in rendered output and for [`Client::restore`].
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            configs: self.inner.store.configs(),
            context: if self.inner.context.is_empty() {
                None
            } else {
                Some(self.inner.context.clone())
            },
        }
    }

    /// Stop replication and release subscriptions. Idempotent. Reads keep
    /// returning the last-known values; no further updates arrive.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        if let Some(task) = self.inner.driver.lock().unwrap().take() {
            task.abort();
        }
        self.inner.store.clear_subscribers();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

fn connector_of(options: &ClientOptions) -> Arc<dyn Connector> {
    options
        .connector
        .clone()
        .unwrap_or_else(|| Arc::new(HttpConnector::new()))
}

fn fallback_configs(fallbacks: &BTreeMap<String, Value>) -> Vec<Config> {
    fallbacks
        .iter()
        .map(|(name, value)| Config {
            name: name.clone(),
            value: value.clone(),
            overrides: Vec::new(),
        })
        .collect()
}

fn endpoint(base_url: &str) -> crate::Result<url::Url> {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::InvalidOptions("base_url must not be empty".to_string()));
    }
    url::Url::parse(&format!("{trimmed}/{STREAM_PATH}"))
        .map_err(|err| Error::InvalidOptions(format!("invalid base_url {base_url:?}: {err}")))
}

fn default_agent() -> String {
    format!("replane-rust/{}", env!("CARGO_PKG_VERSION"))
}
