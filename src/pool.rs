//! Pooled HTTP client for forwarding requests to the dev server

use crate::startup::DevServerEndpoint;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("Request build error: {0}")]
    RequestBuild(String),
}

#[derive(Debug, Default)]
pub struct PoolStats {
    /// Requests forwarded to the dev server
    pub forwarded_requests: AtomicU64,
    /// Forwarding attempts that failed to get a response
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.forwarded_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_forwarded_requests(&self) -> u64 {
        self.forwarded_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections to the dev server
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Keeps connections to the dev server open between requests
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward `req` to the dev server, keeping its method, path, headers and body
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        endpoint: &DevServerEndpoint,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = backend_uri(endpoint, &req);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = match self.client.request(backend_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

fn backend_uri<B>(endpoint: &DevServerEndpoint, req: &Request<B>) -> String {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{}{}", endpoint.uri, path)
}
