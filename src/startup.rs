//! Dev server startup: launch the script once, wait for its readiness marker,
//! and share the outcome with every request.

use crate::config::DevServerConfig;
use crate::error::{MatchError, StartupError};
use crate::port::find_available_port;
use crate::runner::{ScriptRunner, TracingSink};
use crate::stream::OutputCapture;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{error, info, warn};

/// Environment variable carrying the port the dev server must listen on
pub const PORT_ENV: &str = "PORT";
/// Environment variable carrying this server's externally reachable address
pub const BACKEND_URL_ENV: &str = "BACKEND_URL";
/// Keeps dev servers from opening a browser window on start
const BROWSER_ENV: &str = "BROWSER";

/// How long to let stderr drain after stdout closes, so error text is complete
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Where a ready dev server can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevServerEndpoint {
    pub port: u16,
    pub uri: String,
}

impl DevServerEndpoint {
    pub fn localhost(port: u16) -> Self {
        Self {
            port,
            uri: format!("http://localhost:{}", port),
        }
    }
}

/// A dev server that has signalled readiness
pub struct DevServer {
    pub endpoint: DevServerEndpoint,
    pub runner: ScriptRunner,
}

/// Environment for the script: configured variables, then the ones we own
pub fn environment_overlay(
    config: &DevServerConfig,
    port: u16,
    host_address: Option<&str>,
) -> HashMap<String, String> {
    let mut env = config.env.clone();
    env.insert(PORT_ENV.to_string(), port.to_string());
    env.insert(
        BACKEND_URL_ENV.to_string(),
        host_address.unwrap_or_default().to_string(),
    );
    env.insert(BROWSER_ENV.to_string(), "none".to_string());
    env
}

/// Arguments passed to the script after `--`
pub fn dev_server_args(config: &DevServerConfig, port: u16) -> Vec<String> {
    let mut args = vec![
        "--port".to_string(),
        port.to_string(),
        "--host".to_string(),
        "localhost".to_string(),
    ];
    args.extend(config.args.iter().cloned());
    args
}

/// Launch the dev server on a free port and wait until it prints its readiness marker
pub async fn start_dev_server(
    config: &DevServerConfig,
    host_address: Option<&str>,
) -> Result<DevServer, StartupError> {
    let port = find_available_port().map_err(StartupError::PortUnavailable)?;
    let env = environment_overlay(config, port, host_address);
    let args = dev_server_args(config, port);

    let runner = ScriptRunner::launch(config, &args, &env)?;
    runner.attach_to_logger(Arc::new(TracingSink::new(&config.script)));
    let stderr = OutputCapture::attach(runner.stderr());

    let timeout = config.startup_timeout();
    let ready = runner
        .stdout()
        .wait_for_match(config.readiness_pattern(), timeout);
    runner.start_streaming();

    info!(
        script = %config.script,
        port,
        timeout_secs = timeout.as_secs(),
        "Waiting for dev server to indicate readiness"
    );

    match ready.await {
        Ok(_) => {
            info!(script = %config.script, port, "Dev server is ready");
            Ok(DevServer {
                endpoint: DevServerEndpoint::localhost(port),
                runner,
            })
        }
        Err(MatchError::EndOfStream) => {
            runner.stderr().wait_for_end(STDERR_DRAIN_TIMEOUT).await;
            Err(StartupError::ProcessExitedEarly {
                script: config.script.clone(),
                stderr: stderr.contents(),
            })
        }
        Err(MatchError::Timeout(timeout)) => {
            warn!(
                script = %config.script,
                timeout_secs = timeout.as_secs(),
                "Dev server did not indicate readiness in time, stopping it"
            );
            Err(StartupError::ReadinessTimeout {
                script: config.script.clone(),
                timeout,
                stderr: stderr.contents(),
            })
        }
        Err(e @ MatchError::AlreadyWaiting) => Err(StartupError::Aborted(e.to_string())),
    }
}

type StartupFuture = Shared<BoxFuture<'static, Result<DevServerEndpoint, Arc<StartupError>>>>;

/// The single, shared outcome of a dev server startup.
///
/// The startup runs on its own task, so it keeps making progress when an
/// observer stops waiting. Every observer sees the same endpoint, or the same
/// failure; a failure is never retried.
#[derive(Clone)]
pub struct SharedStartup {
    future: StartupFuture,
    abort: AbortHandle,
}

impl SharedStartup {
    /// Spawn `startup` onto the runtime and share its result
    pub fn spawn<F>(startup: F) -> Self
    where
        F: Future<Output = Result<DevServerEndpoint, StartupError>> + Send + 'static,
    {
        let handle = tokio::spawn(startup);
        let abort = handle.abort_handle();
        let future = async move {
            let result = match handle.await {
                Ok(result) => result.map_err(Arc::new),
                Err(e) => Err(Arc::new(StartupError::Aborted(e.to_string()))),
            };
            if let Err(ref e) = result {
                error!(error = %e, "Dev server failed to start");
            }
            result
        }
        .boxed()
        .shared();

        Self { future, abort }
    }

    /// Wait for the outcome
    pub async fn wait(&self) -> Result<DevServerEndpoint, Arc<StartupError>> {
        self.future.clone().await
    }

    /// The outcome, if an observer has already seen it
    pub fn peek(&self) -> Option<Result<DevServerEndpoint, Arc<StartupError>>> {
        self.future.peek().cloned()
    }

    /// Cancel a startup that is still running. Observers then see `Aborted`.
    pub fn abort(&self) {
        self.abort.abort();
    }
}
