//! Request gating: every request waits for the single dev server startup,
//! then is either redirected (root path) or passed on unchanged.

use crate::config::DevServerConfig;
use crate::error::{GateError, StartupError};
use crate::runner::ScriptRunner;
use crate::startup::{start_dev_server, DevServerEndpoint, SharedStartup};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Request, Response, StatusCode};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// What the host should do with a request once the dev server is ready
#[derive(Debug)]
pub enum GateOutcome<B> {
    /// Hand the request, untouched, to the dev server at `endpoint`
    Forward {
        request: Request<B>,
        endpoint: DevServerEndpoint,
    },
    /// Send the client to the dev server directly
    Redirect(String),
}

#[derive(Default)]
struct RunnerSlot {
    runner: Option<ScriptRunner>,
    closed: bool,
}

/// Holds one dev server startup and gates requests on it
pub struct DevServerGate {
    startup: SharedStartup,
    request_timeout: Duration,
    runner: Arc<Mutex<RunnerSlot>>,
}

impl DevServerGate {
    /// Validate `config` and start the dev server in the background.
    ///
    /// Must be called from within a tokio runtime. Configuration problems are
    /// reported here; startup failures are reported to every request.
    pub fn attach(
        config: DevServerConfig,
        host_address: Option<String>,
    ) -> Result<Self, StartupError> {
        config.validate()?;

        let request_timeout = config.request_timeout();
        let slot = Arc::new(Mutex::new(RunnerSlot::default()));
        let task_slot = Arc::clone(&slot);

        info!(
            script = %config.script,
            source_path = %config.source_path,
            "Starting dev server"
        );

        let startup = SharedStartup::spawn(async move {
            let server = start_dev_server(&config, host_address.as_deref()).await?;
            let mut slot = task_slot.lock();
            if slot.closed {
                return Err(StartupError::Aborted(
                    "shut down while the dev server was starting".to_string(),
                ));
            }
            slot.runner = Some(server.runner);
            Ok(server.endpoint)
        });

        Ok(Self {
            startup,
            request_timeout,
            runner: slot,
        })
    }

    /// Gate requests on an arbitrary startup future instead of launching a script
    pub fn with_startup<F>(startup: F, request_timeout: Duration) -> Self
    where
        F: Future<Output = Result<DevServerEndpoint, StartupError>> + Send + 'static,
    {
        Self {
            startup: SharedStartup::spawn(startup),
            request_timeout,
            runner: Arc::new(Mutex::new(RunnerSlot::default())),
        }
    }

    /// The dev server endpoint, if startup has already succeeded
    pub fn endpoint(&self) -> Option<DevServerEndpoint> {
        self.startup.peek().and_then(Result::ok)
    }

    /// Wait up to `timeout` for the dev server to be ready
    pub async fn wait_ready(&self, timeout: Duration) -> Result<DevServerEndpoint, GateError> {
        match tokio::time::timeout(timeout, self.startup.wait()).await {
            Ok(Ok(endpoint)) => Ok(endpoint),
            Ok(Err(e)) => Err(GateError::Startup(e)),
            Err(_) => Err(GateError::RequestTimeout { timeout }),
        }
    }

    /// Gate `request` using the configured per-request timeout
    pub async fn check<B>(&self, request: Request<B>) -> Result<GateOutcome<B>, GateError> {
        self.check_within(request, self.request_timeout).await
    }

    pub async fn check_within<B>(
        &self,
        request: Request<B>,
        timeout: Duration,
    ) -> Result<GateOutcome<B>, GateError> {
        let endpoint = self.wait_ready(timeout).await?;

        if request.uri().path() == "/" {
            debug!(location = %endpoint.uri, "Redirecting root request to dev server");
            return Ok(GateOutcome::Redirect(endpoint.uri));
        }

        Ok(GateOutcome::Forward { request, endpoint })
    }

    /// Stop the dev server, or cancel its startup if it is still running
    pub async fn shutdown(&self, grace_period: Duration) {
        let runner = {
            let mut slot = self.runner.lock();
            slot.closed = true;
            slot.runner.take()
        };

        match runner {
            Some(runner) => runner.shutdown(grace_period).await,
            None => self.startup.abort(),
        }
    }
}

/// 302 Found pointing at `location`
pub fn redirect_response(location: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(hyper::header::LOCATION, location)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}
