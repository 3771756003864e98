use crate::error::{json_error_response, GateErrorCode};
use crate::gate::{redirect_response, DevServerGate, GateOutcome};
use crate::pool::{ConnectionPool, PoolConfig};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// HTTP front end that gates every request on the dev server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    gate: Arc<DevServerGate>,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        gate: Arc<DevServerGate>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(bind_addr, gate, shutdown_rx, PoolConfig::default())
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        gate: Arc<DevServerGate>,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            bind_addr,
            gate,
            shutdown_rx,
            pool: Arc::new(ConnectionPool::new(pool_config)),
        }
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gate = Arc::clone(&self.gate);
                            let pool = Arc::clone(&self.pool);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, gate, pool).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    gate: Arc<DevServerGate>,
    pool: Arc<ConnectionPool>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gate = Arc::clone(&gate);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, gate, pool, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    gate: Arc<DevServerGate>,
    pool: Arc<ConnectionPool>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Overwrite rather than append: this proxy is the first trusted hop.
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let (req, endpoint) = match gate.check(req).await {
        Ok(GateOutcome::Forward { request, endpoint }) => (request, endpoint),
        Ok(GateOutcome::Redirect(location)) => return Ok(redirect_response(&location)),
        Err(e) => {
            if e.code() == GateErrorCode::RequestTimeout {
                warn!(request_id, error = %e, "Request timed out waiting for dev server");
            } else {
                error!(request_id, error = %e, "Dev server unavailable");
            }
            return Ok(json_error_response(e.code(), e.to_string()));
        }
    };

    match pool.send_request(req, &endpoint).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(
                request_id,
                port = endpoint.port,
                error = %e,
                "Failed to forward request via pool"
            );
            Ok(json_error_response(
                GateErrorCode::ConnectionFailed,
                "Failed to connect to the dev server",
            ))
        }
    }
}
