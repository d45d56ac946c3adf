//! Process-local registry pairing outbound requests with inbound replies.
//!
//! The [`CorrelationTracker`] is the heart of the single-demultiplexer
//! design: the engine registers a correlation ID before sending to an agent,
//! the global consumer routes the eventual reply into the registered
//! capacity-1 channel, and the waiting caller wakes. Timeouts, caller
//! cancellation, and a background sweep all funnel through the same
//! remove-then-drop discipline, so a channel is never closed twice and a
//! reply for a finished request is simply dropped.
//!
//! Correlation IDs follow the shape `conv-<userID>-<uuid>` for conversations
//! and `exec-<userID>-<uuid>` for execution runs, and are unique per
//! outstanding request. Registering the same ID twice is a caller bug; the
//! tracker does not check for collisions.

use crate::agentmesh::envelope::AgentToAIMessage;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default interval between expiry sweeps of the cleanup worker.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Build a conversation correlation ID: `conv-<userID>-<uuid>`.
pub fn conversation_correlation_id(user_id: &str) -> String {
    format!("conv-{}-{}", user_id, Uuid::new_v4())
}

/// Build an execution correlation ID: `exec-<userID>-<uuid>`.
pub fn execution_correlation_id(user_id: &str) -> String {
    format!("exec-{}-{}", user_id, Uuid::new_v4())
}

/// Why a correlation wait ended without a reply.
#[derive(Debug, Clone)]
pub enum CorrelationError {
    /// No reply arrived within the deadline.
    Timeout {
        correlation_id: String,
        waited: Duration,
    },
    /// The ambient context was cancelled while waiting.
    Cancelled(String),
    /// The registration was removed underneath the waiter (expiry sweep or
    /// explicit cleanup).
    Expired(String),
}

impl fmt::Display for CorrelationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationError::Timeout {
                correlation_id,
                waited,
            } => write!(
                f,
                "no agent response for correlation '{}' within {:?}",
                correlation_id, waited
            ),
            CorrelationError::Cancelled(id) => {
                write!(f, "wait for correlation '{}' was cancelled", id)
            }
            CorrelationError::Expired(id) => {
                write!(f, "correlation '{}' expired before a response arrived", id)
            }
        }
    }
}

impl Error for CorrelationError {}

/// One outstanding request: who is waiting, where the reply goes, and when
/// the registration lapses.
struct CorrelationRequest {
    user_id: String,
    response_tx: mpsc::Sender<AgentToAIMessage>,
    expires_at: Instant,
}

/// Thread-safe registry of outstanding correlations.
///
/// All mutating operations take the single write lock briefly; the response
/// channels have capacity 1 so routing never blocks.
pub struct CorrelationTracker {
    requests: RwLock<HashMap<String, CorrelationRequest>>,
    cleanup_interval: Duration,
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }

    /// Override the expiry sweep interval (builder pattern). Tests use a few
    /// milliseconds; production keeps the default.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Register an outstanding request and hand back the reply channel.
    ///
    /// The caller owns the read end for the lifetime of its wait and must
    /// ensure [`cleanup_request`](Self::cleanup_request) runs on every exit
    /// path where the reply was not consumed
    /// ([`await_response`](Self::await_response) does this automatically).
    pub async fn register_request(
        &self,
        correlation_id: &str,
        user_id: &str,
        timeout: Duration,
    ) -> mpsc::Receiver<AgentToAIMessage> {
        let (tx, rx) = mpsc::channel(1);
        let request = CorrelationRequest {
            user_id: user_id.to_string(),
            response_tx: tx,
            expires_at: Instant::now() + timeout,
        };
        self.requests
            .write()
            .await
            .insert(correlation_id.to_string(), request);
        log::debug!(
            "registered correlation '{}' for user '{}' (timeout {:?})",
            correlation_id,
            user_id,
            timeout
        );
        rx
    }

    /// Deliver a reply to whoever registered its correlation ID.
    ///
    /// Returns `true` when a waiter received the reply. The registration is
    /// removed in every case, so a second reply with the same correlation ID
    /// is dropped as an unknown correlation.
    pub async fn route_response(&self, response: AgentToAIMessage) -> bool {
        let removed = {
            let mut requests = self.requests.write().await;
            requests.remove(&response.correlation_id)
        };

        let request = match removed {
            Some(request) => request,
            None => {
                // A routing miss is not an error: the waiter may have timed
                // out, or the reply may be a duplicate.
                log::debug!(
                    "no waiter for correlation '{}' (from agent '{}')",
                    response.correlation_id,
                    response.agent_id
                );
                return false;
            }
        };

        let correlation_id = response.correlation_id.clone();
        match request.response_tx.try_send(response) {
            Ok(()) => {
                log::debug!(
                    "routed response for correlation '{}' to user '{}'",
                    correlation_id,
                    request.user_id
                );
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                log::debug!(
                    "waiter for correlation '{}' was gone or already served",
                    correlation_id
                );
                false
            }
        }
    }

    /// Drop an outstanding registration, closing its reply channel.
    pub async fn cleanup_request(&self, correlation_id: &str) {
        if self
            .requests
            .write()
            .await
            .remove(correlation_id)
            .is_some()
        {
            log::debug!("cleaned up correlation '{}'", correlation_id);
        }
    }

    /// Number of outstanding registrations.
    pub async fn pending_count(&self) -> usize {
        self.requests.read().await.len()
    }

    /// Whether the given correlation ID is still registered.
    pub async fn is_registered(&self, correlation_id: &str) -> bool {
        self.requests.read().await.contains_key(correlation_id)
    }

    /// Wait for the reply on `rx`, racing the ambient context and an absolute
    /// timeout. The registration is cleaned up on every exit path where the
    /// reply was not consumed.
    pub async fn await_response(
        &self,
        correlation_id: &str,
        rx: &mut mpsc::Receiver<AgentToAIMessage>,
        ctx: &CancellationToken,
        timeout: Duration,
    ) -> Result<AgentToAIMessage, CorrelationError> {
        tokio::select! {
            response = rx.recv() => match response {
                Some(response) => Ok(response),
                // The sweep (or an explicit cleanup) dropped the sender.
                None => Err(CorrelationError::Expired(correlation_id.to_string())),
            },
            _ = ctx.cancelled() => {
                self.cleanup_request(correlation_id).await;
                Err(CorrelationError::Cancelled(correlation_id.to_string()))
            }
            _ = tokio::time::sleep(timeout) => {
                self.cleanup_request(correlation_id).await;
                Err(CorrelationError::Timeout {
                    correlation_id: correlation_id.to_string(),
                    waited: timeout,
                })
            }
        }
    }

    /// Spawn the background sweep that removes expired registrations.
    ///
    /// Runs until `ctx` is cancelled. Dropping a removed entry's sender wakes
    /// its waiter with an [`CorrelationError::Expired`].
    pub fn start_cleanup_worker(self: Arc<Self>, ctx: CancellationToken) -> JoinHandle<()> {
        let tracker = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tracker.cleanup_interval);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let mut requests = tracker.requests.write().await;
                        let before = requests.len();
                        requests.retain(|_, request| request.expires_at > now);
                        let swept = before - requests.len();
                        if swept > 0 {
                            log::debug!("expiry sweep removed {} stale correlation(s)", swept);
                        }
                    }
                }
            }
            log::debug!("correlation cleanup worker stopped");
        })
    }
}

impl Default for CorrelationTracker {
    fn default() -> Self {
        Self::new()
    }
}
