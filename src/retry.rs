//! A3 — the shared, retrying HTTP transport used by both adapters.
//!
//! Generalizes the single shared `reqwest::Client` pattern (connection
//! pooling, a fixed User-Agent, sane timeouts) by wrapping it in
//! `reqwest-middleware`'s retry layer: exponential backoff starting at 1s,
//! doubling each attempt, capped at 10 attempts (§5), applied uniformly to
//! both the Index and Warehouse clients so individual adapters never have
//! to implement their own retry loop.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::RetryTransientMiddleware;

use crate::errors::SyncError;

const USER_AGENT: &str = concat!(
    "warehouse-sync/",
    env!("CARGO_PKG_VERSION"),
    " (sync engine)"
);

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_RETRIES: u32 = 10;
const BASE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// A shared HTTP client with exponential-backoff retry already wired in.
/// Both [`crate::index::xmlrpc::XmlRpcIndexClient`] and
/// [`crate::warehouse::rest::RestWarehouseClient`] hold an `Arc` of this.
pub struct RetryingClient {
    inner: ClientWithMiddleware,
}

impl RetryingClient {
    pub fn build(ssl_verify: bool) -> Result<Arc<Self>, SyncError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(DEFAULT_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Duration::from_secs(60))
            .danger_accept_invalid_certs(!ssl_verify)
            .build()
            .map_err(|e| SyncError::Config(format!("could not build http client: {e}")))?;

        let backoff = ExponentialBackoff::builder()
            .retry_bounds(BASE_RETRY_INTERVAL, BASE_RETRY_INTERVAL * (1 << MAX_RETRIES))
            .build_with_max_retries(MAX_RETRIES);

        let inner = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(backoff))
            .build();

        Ok(Arc::new(Self { inner }))
    }

    pub fn client(&self) -> &ClientWithMiddleware {
        &self.inner
    }
}
