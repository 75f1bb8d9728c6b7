//! Remote agent collaborator backed by a [`CorrelatedChannel`].

use super::CorrelatedChannel;
use crate::collaborator::{Capability, Collaborator, CollaboratorId};
use crate::error::DispatchError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// A remote agent reachable over whichever connection is currently attached.
///
/// The capability name is sent as the command and the payload as its params.
/// Without an attached channel every invocation fails with `PeerDisconnected`.
#[derive(Debug)]
pub struct RemoteAgent {
    id: CollaboratorId,
    channel: RwLock<Option<Arc<CorrelatedChannel>>>,
    timeout: Option<Duration>,
}

impl RemoteAgent {
    pub fn new(id: CollaboratorId) -> Self {
        Self {
            id,
            channel: RwLock::new(None),
            timeout: None,
        }
    }

    /// Per-command timeout; otherwise the channel's default applies
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Open a fresh channel for a new connection, replacing (and
    /// disconnecting) any previous one. Returns the channel and the receiver
    /// of outbound frames the transport must write to the peer.
    pub fn connect(
        &self,
        default_timeout: Duration,
    ) -> (Arc<CorrelatedChannel>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(CorrelatedChannel::new(self.id.clone(), tx, default_timeout));
        self.attach(Arc::clone(&channel));
        (channel, rx)
    }

    pub fn attach(&self, channel: Arc<CorrelatedChannel>) {
        let previous = self.channel.write().replace(channel);
        if let Some(previous) = previous {
            previous.disconnect();
        }
        info!(collaborator = %self.id, "Remote agent connected");
    }

    /// Drop the current connection; every pending request gets `PeerDisconnected`
    pub fn detach(&self) {
        let previous = self.channel.write().take();
        if let Some(previous) = previous {
            previous.disconnect();
            info!(collaborator = %self.id, "Remote agent detached");
        }
    }

    pub fn channel(&self) -> Option<Arc<CorrelatedChannel>> {
        self.channel.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.channel
            .read()
            .as_ref()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Collaborator for RemoteAgent {
    fn id(&self) -> &CollaboratorId {
        &self.id
    }

    async fn invoke(
        &self,
        capability: &Capability,
        payload: Value,
    ) -> Result<Value, DispatchError> {
        // Clone the Arc so the lock is not held across the await
        let channel = self.channel().ok_or_else(|| DispatchError::PeerDisconnected {
            peer: self.id.clone(),
        })?;

        match self.timeout {
            Some(timeout) => {
                channel
                    .send_with_timeout(capability.as_str(), payload, timeout)
                    .await
            }
            None => channel.send(capability.as_str(), payload).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelFrame;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_invoke_without_channel() {
        let agent = RemoteAgent::new("desktop".into());
        assert!(!agent.is_connected());
        let err = agent
            .invoke(&"screenshot".into(), json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerDisconnected);
    }

    #[tokio::test]
    async fn test_capability_becomes_command() {
        let agent = Arc::new(RemoteAgent::new("desktop".into()));
        let (channel, mut outbound) = agent.connect(Duration::from_secs(1));

        let caller = Arc::clone(&agent);
        let call = tokio::spawn(async move {
            caller
                .invoke(&"screenshot".into(), json!({"monitor": 1}))
                .await
        });

        let text = outbound.recv().await.expect("command written");
        let ChannelFrame::Command { request_id, command, params } =
            ChannelFrame::from_json(&text).expect("frame")
        else {
            panic!("expected command frame");
        };
        assert_eq!(command, "screenshot");
        assert_eq!(params["monitor"], 1);

        let reply = ChannelFrame::success(request_id, json!("png-bytes"))
            .to_json()
            .expect("serializes");
        channel.handle_inbound(&reply).expect("routed");
        assert_eq!(call.await.expect("task").expect("ok"), json!("png-bytes"));
    }

    #[tokio::test]
    async fn test_reconnect_starts_with_empty_map() {
        let agent = Arc::new(RemoteAgent::new("desktop".into()));
        let (first, mut outbound) = agent.connect(Duration::from_secs(5));

        let caller = Arc::clone(&agent);
        let call = tokio::spawn(async move { caller.invoke(&"type_text".into(), json!({})).await });
        outbound.recv().await.expect("command written");
        assert_eq!(first.pending_count(), 1);

        let (second, _outbound2) = agent.connect(Duration::from_secs(5));
        let err = call.await.expect("task").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerDisconnected);
        assert!(!first.is_connected());
        assert_eq!(second.pending_count(), 0);
        assert!(agent.is_connected());

        agent.detach();
        assert!(!agent.is_connected());
        assert!(agent.channel().is_none());
    }
}
