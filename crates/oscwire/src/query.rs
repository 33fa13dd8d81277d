//! Request/response over the address-mirroring convention.
//!
//! The DAW remote script answers a query sent to address X with a reply on
//! the same address X. Replies carry no correlation id, so two in-flight
//! calls to one address are indistinguishable at the receiver. Calls are
//! therefore serialized per address: each address has an async lane mutex,
//! and a call holds its lane from send until reply or timeout. Calls to
//! distinct addresses proceed concurrently.
//!
//! A reply that arrives after its call has timed out is discarded as an
//! orphan by the transport; if a new call on that address is already
//! waiting, the stale reply can satisfy it instead. All queried addresses
//! are idempotent reads, so callers that care simply re-issue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::codec::{OscMessage, OscValue};
use crate::transport::OscTransport;

/// Default per-query timeout.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors surfaced to callers of [`OscQuery::call`].
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("no reply on {address} within {timeout:?}")]
    Timeout { address: String, timeout: Duration },
    #[error("send failed: {0}")]
    Send(#[from] std::io::Error),
    #[error("transport closed while awaiting {0}")]
    TransportClosed(String),
}

/// Awaitable queries over the fire-and-forget transport.
pub struct OscQuery {
    transport: Arc<OscTransport>,
    lanes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    default_timeout: Duration,
}

impl OscQuery {
    pub fn new(transport: Arc<OscTransport>, default_timeout: Duration) -> Self {
        Self {
            transport,
            lanes: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    /// Query with the default timeout.
    pub async fn call(
        &self,
        address: &str,
        args: Vec<OscValue>,
    ) -> Result<Vec<OscValue>, QueryError> {
        self.call_with_timeout(address, args, self.default_timeout)
            .await
    }

    /// Query with an explicit timeout (the liveness probe uses a longer
    /// one).
    pub async fn call_with_timeout(
        &self,
        address: &str,
        args: Vec<OscValue>,
        timeout: Duration,
    ) -> Result<Vec<OscValue>, QueryError> {
        let lane = self.lane(address);
        let _guard = lane.lock().await;

        let slot = self.transport.expect_reply(address);
        self.transport
            .send(&OscMessage::new(address, args))
            .await?;

        match tokio::time::timeout(timeout, slot.rx).await {
            Ok(Ok(reply)) => Ok(reply.args),
            Ok(Err(_)) => Err(QueryError::TransportClosed(address.to_string())),
            Err(_) => {
                self.transport.cancel_reply(address, slot.token);
                debug!(address, ?timeout, "query timed out");
                Err(QueryError::Timeout {
                    address: address.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Access to the underlying transport for fire-and-forget sends and
    /// push-notification subscriptions.
    pub fn transport(&self) -> &Arc<OscTransport> {
        &self.transport
    }

    fn lane(&self, address: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut lanes = self.lanes.lock().unwrap();
        lanes
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
