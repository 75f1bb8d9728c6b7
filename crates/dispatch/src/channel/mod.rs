//! Correlated request/response over one persistent connection.
//!
//! Each outbound command gets a fresh correlation id and a pending entry
//! holding a oneshot responder and a cancellation token. A deadline task
//! per request races the inbound response for that entry; whichever
//! removes it from the map first settles the caller, the other is a no-op.

pub mod frame;
pub mod remote;

pub use frame::ChannelFrame;
pub use remote::RemoteAgent;

use crate::collaborator::CollaboratorId;
use crate::error::DispatchError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

type Responder = oneshot::Sender<Result<Value, DispatchError>>;

#[derive(Debug)]
struct PendingCorrelation {
    responder: Responder,
    cancel: CancellationToken,
    command: String,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct ChannelCounters {
    sent: AtomicU64,
    resolved: AtomicU64,
    timed_out: AtomicU64,
    dropped: AtomicU64,
    disconnected: AtomicU64,
}

/// What happened to one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundDisposition {
    /// Settled a pending request
    Resolved { request_id: String },
    /// Response for an id that is not pending (late, duplicate or unknown)
    Dropped { request_id: String },
    /// Frame that is not a response
    Unsolicited { kind: &'static str },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStats {
    pub peer: CollaboratorId,
    pub connected: bool,
    pub pending: usize,
    pub sent: u64,
    pub resolved: u64,
    pub timed_out: u64,
    pub dropped: u64,
    pub disconnected: u64,
}

#[derive(Debug)]
pub struct CorrelatedChannel {
    peer: CollaboratorId,
    outbound: mpsc::UnboundedSender<String>,
    pending: Arc<DashMap<String, PendingCorrelation>>,
    default_timeout: Duration,
    connected: AtomicBool,
    counters: Arc<ChannelCounters>,
}

impl CorrelatedChannel {
    /// Channel writing serialized frames to `outbound`
    pub fn new(
        peer: CollaboratorId,
        outbound: mpsc::UnboundedSender<String>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            peer,
            outbound,
            pending: Arc::new(DashMap::new()),
            default_timeout,
            connected: AtomicBool::new(true),
            counters: Arc::new(ChannelCounters::default()),
        }
    }

    pub fn peer(&self) -> &CollaboratorId {
        &self.peer
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub async fn send(&self, command: &str, params: Value) -> Result<Value, DispatchError> {
        self.send_with_timeout(command, params, self.default_timeout)
            .await
    }

    /// Send `command` and wait for the correlated response or `timeout`.
    pub async fn send_with_timeout(
        &self,
        command: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, DispatchError> {
        if !self.is_connected() {
            return Err(self.disconnected_error());
        }

        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + timeout;

        let request_id = loop {
            let candidate = Uuid::new_v4().to_string();
            if let Entry::Vacant(slot) = self.pending.entry(candidate.clone()) {
                slot.insert(PendingCorrelation {
                    responder: tx,
                    cancel: cancel.clone(),
                    command: command.to_string(),
                    deadline,
                });
                break candidate;
            }
        };

        // A disconnect between the check above and the insert would miss this entry
        if !self.is_connected() {
            self.abandon(&request_id);
            return Err(self.disconnected_error());
        }

        self.spawn_deadline(request_id.clone(), cancel, deadline, timeout);

        let text = match ChannelFrame::command(request_id.as_str(), command, params).to_json() {
            Ok(text) => text,
            Err(e) => {
                self.abandon(&request_id);
                return Err(e.into());
            }
        };

        if self.outbound.send(text).is_err() {
            warn!(peer = %self.peer, "Outbound half of the connection is closed");
            self.abandon(&request_id);
            self.disconnect();
            return Err(self.disconnected_error());
        }

        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        debug!(
            peer = %self.peer,
            correlation_id = %request_id,
            command,
            timeout_ms = timeout.as_millis() as u64,
            "Sent correlated command"
        );

        match rx.await {
            Ok(result) => result,
            // Responder dropped without an answer
            Err(_) => Err(self.disconnected_error()),
        }
    }

    fn spawn_deadline(
        &self,
        request_id: String,
        cancel: CancellationToken,
        deadline: Instant,
        timeout: Duration,
    ) {
        let pending = Arc::clone(&self.pending);
        let counters = Arc::clone(&self.counters);
        let peer = self.peer.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some((_, entry)) = pending.remove(&request_id) {
                        counters.timed_out.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            peer = %peer,
                            correlation_id = %request_id,
                            command = %entry.command,
                            timeout_ms = timeout.as_millis() as u64,
                            "Correlated command timed out"
                        );
                        let _ = entry
                            .responder
                            .send(Err(DispatchError::Timeout { after: timeout }));
                    }
                }
            }
        });
    }

    /// Remove an entry that never made it onto the wire
    fn abandon(&self, request_id: &str) {
        if let Some((_, entry)) = self.pending.remove(request_id) {
            entry.cancel.cancel();
        }
    }

    /// Route one inbound text frame.
    ///
    /// Responses settle their pending request; responses nobody waits for are
    /// dropped. Only malformed frames are errors.
    pub fn handle_inbound(&self, text: &str) -> Result<InboundDisposition, DispatchError> {
        let frame = ChannelFrame::from_json(text).map_err(|e| {
            warn!(peer = %self.peer, error = %e, "Malformed inbound frame");
            DispatchError::from(e)
        })?;

        match frame {
            ChannelFrame::Response {
                request_id,
                success,
                data,
                error,
            } => Ok(self.settle(request_id, success, data, error)),
            ChannelFrame::Heartbeat { .. } => {
                trace!(peer = %self.peer, "Heartbeat");
                Ok(InboundDisposition::Unsolicited { kind: "heartbeat" })
            }
            ChannelFrame::Log { level, message } => {
                info!(
                    peer = %self.peer,
                    level = level.as_deref().unwrap_or("info"),
                    message = %message,
                    "Agent log"
                );
                Ok(InboundDisposition::Unsolicited { kind: "log" })
            }
            ChannelFrame::Handshake { data } => {
                info!(peer = %self.peer, data = ?data, "Agent handshake");
                Ok(InboundDisposition::Unsolicited { kind: "handshake" })
            }
            ChannelFrame::FileChanged { data } => {
                info!(peer = %self.peer, data = ?data, "Agent reported file change");
                Ok(InboundDisposition::Unsolicited { kind: "file_changed" })
            }
            ChannelFrame::Command { command, .. } => {
                warn!(peer = %self.peer, command = %command, "Ignoring command sent by agent");
                Ok(InboundDisposition::Unsolicited { kind: "command" })
            }
        }
    }

    fn settle(
        &self,
        request_id: String,
        success: bool,
        data: Option<Value>,
        error: Option<String>,
    ) -> InboundDisposition {
        let Some((_, entry)) = self.pending.remove(&request_id) else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                peer = %self.peer,
                correlation_id = %request_id,
                "Dropping uncorrelated response"
            );
            return InboundDisposition::Dropped { request_id };
        };

        entry.cancel.cancel();
        self.counters.resolved.fetch_add(1, Ordering::Relaxed);

        let outcome = if success {
            Ok(data.unwrap_or(Value::Null))
        } else {
            let reason = error.unwrap_or_else(|| format!("command '{}' failed", entry.command));
            Err(DispatchError::attempt_failed(&self.peer, reason))
        };

        let remaining = entry.deadline.saturating_duration_since(Instant::now());
        debug!(
            peer = %self.peer,
            correlation_id = %request_id,
            success,
            remaining_ms = remaining.as_millis() as u64,
            "Resolved correlated command"
        );
        if entry.responder.send(outcome).is_err() {
            debug!(peer = %self.peer, correlation_id = %request_id, "Caller stopped waiting");
        }
        InboundDisposition::Resolved { request_id }
    }

    /// Reject every pending request with `PeerDisconnected` and refuse new ones.
    pub fn disconnect(&self) {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);

        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut rejected = 0usize;
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                entry.cancel.cancel();
                let _ = entry.responder.send(Err(self.disconnected_error()));
                rejected += 1;
            }
        }
        self.counters
            .disconnected
            .fetch_add(rejected as u64, Ordering::Relaxed);

        if was_connected || rejected > 0 {
            warn!(peer = %self.peer, rejected, "Peer disconnected");
        }
    }

    /// Pump inbound frames until the stream ends, then disconnect.
    pub async fn serve(&self, mut inbound: mpsc::UnboundedReceiver<String>) {
        info!(peer = %self.peer, "Serving correlated channel");
        while let Some(text) = inbound.recv().await {
            if !self.is_connected() {
                break;
            }
            // Malformed frames are logged by handle_inbound and skipped
            let _ = self.handle_inbound(&text);
        }
        self.disconnect();
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            peer: self.peer.clone(),
            connected: self.is_connected(),
            pending: self.pending.len(),
            sent: self.counters.sent.load(Ordering::Relaxed),
            resolved: self.counters.resolved.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            disconnected: self.counters.disconnected.load(Ordering::Relaxed),
        }
    }

    fn disconnected_error(&self) -> DispatchError {
        DispatchError::PeerDisconnected {
            peer: self.peer.clone(),
        }
    }
}
