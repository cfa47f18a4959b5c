//! The replication driver: a task that keeps the local store synchronized
//! with the server's event stream for the lifetime of a client handle.

pub mod transport;

mod sse;

use crate::model::{ReplayBody, StreamEvent};
use crate::store::Store;
use crate::Error;
use futures::StreamExt;
use sse::{Frame, FrameDecoder};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use transport::{Connector, StreamRequest};

const MAX_BACKOFF: Duration = Duration::from_secs(10);
const JITTER: f64 = 0.1;

/// One-shot initialization latch. The driver resolves it on the first
/// applied data frame, or with an error when the server's initial response
/// is definitive; every later resolution attempt is a no-op.
pub(crate) struct InitSignal {
    tx: Mutex<Option<oneshot::Sender<crate::Result<()>>>>,
}

impl InitSignal {
    pub(crate) fn new() -> (Self, oneshot::Receiver<crate::Result<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// A latch that is already resolved, for drivers started in the
    /// background of an immediately-usable handle.
    pub(crate) fn resolved() -> Self {
        Self {
            tx: Mutex::new(None),
        }
    }

    fn resolve(&self, result: crate::Result<()>) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(result);
        }
    }

    fn is_pending(&self) -> bool {
        self.tx.lock().unwrap().is_some()
    }
}

pub(crate) struct Driver {
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) endpoint: url::Url,
    pub(crate) sdk_key: String,
    pub(crate) agent: Option<String>,
    pub(crate) required: Vec<String>,
    pub(crate) request_timeout: Duration,
    pub(crate) inactivity_timeout: Duration,
    pub(crate) retry_delay: Duration,
    pub(crate) store: Arc<Store>,
    pub(crate) init: InitSignal,
    pub(crate) cancel: CancellationToken,
}

impl Driver {
    pub(crate) async fn run(self) {
        let mut backoff = Backoff::new(self.retry_delay);
        loop {
            let err = match self.run_once(&mut backoff).await {
                Ok(()) => return, // cancelled
                Err(err) => err,
            };

            if self.init.is_pending() && err.is_definitive() {
                self.init.resolve(Err(err));
                return;
            }

            let delay = backoff.next();
            tracing::error!(
                error = %err,
                backoff_ms = delay.as_millis() as u64,
                "replication stream failed, reconnecting"
            );
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    // One connection attempt plus the read loop over its frames. `Ok` means
    // the driver was cancelled; every other exit is a recoverable error.
    async fn run_once(&self, backoff: &mut Backoff) -> crate::Result<()> {
        let request = StreamRequest {
            url: self.endpoint.clone(),
            sdk_key: self.sdk_key.clone(),
            agent: self.agent.clone(),
            body: ReplayBody {
                current_configs: self.store.configs(),
                required_configs: self.required.clone(),
            },
        };

        let open = self.connector.open(request);
        let mut stream = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            opened = tokio::time::timeout(self.request_timeout, open) => match opened {
                Err(_elapsed) => return Err(Error::Timeout),
                Ok(result) => result?,
            },
        };

        backoff.reset();
        tracing::debug!(url = %self.endpoint, "replication stream connected");

        let mut decoder = FrameDecoder::default();
        loop {
            let chunk = tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                // Any received bytes (keep-alive comments included) feed the
                // watchdog; a silent half-open connection does not.
                next = tokio::time::timeout(self.inactivity_timeout, stream.next()) => match next {
                    Err(_elapsed) => return Err(Error::Timeout),
                    // Covers both a dropped connection and a body that ended
                    // without producing a single frame.
                    Ok(None) => return Err(Error::UnexpectedEof),
                    Ok(Some(Err(err))) => return Err(err),
                    Ok(Some(Ok(chunk))) => chunk,
                },
            };

            decoder.feed(&chunk);
            while let Some(frame) = decoder.next_frame() {
                match frame {
                    Frame::Comment => {}
                    Frame::Data(payload) => self.apply(&payload)?,
                }
            }
        }
    }

    fn apply(&self, payload: &str) -> crate::Result<()> {
        let event: StreamEvent = serde_json::from_str(payload)?;
        match event {
            StreamEvent::Init { configs } => self.store.apply_init(configs),
            StreamEvent::ConfigChange { config } => self.store.apply_change(config),
            StreamEvent::Unknown => {
                tracing::debug!("ignoring unrecognized replication event");
                return Ok(());
            }
        }
        self.init.resolve(Ok(()));
        Ok(())
    }
}

/// Exponential reconnect schedule: `retry_delay * 2^(attempts-1)` capped at
/// ten seconds, with a uniform ±10% jitter. `reset` is called whenever a
/// connection is established, so a short-lived stream is not penalized on
/// its next failure.
struct Backoff {
    base: Duration,
    attempts: u32,
}

impl Backoff {
    fn new(base: Duration) -> Self {
        Self { base, attempts: 0 }
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }

    fn next(&mut self) -> Duration {
        use rand::Rng;

        self.attempts += 1;
        let doublings = (self.attempts - 1).min(20);
        let nominal = self.base.saturating_mul(1 << doublings).min(MAX_BACKOFF);
        nominal.mul_f64(rand::thread_rng().gen_range(1.0 - JITTER..=1.0 + JITTER))
    }
}
