//! Correlated channel integration tests
//!
//! A simulated peer reads outbound frames and answers through the inbound
//! stream that `serve` pumps, the same way a socket transport would.

use anyhow::{anyhow, Result};
use dispatch::config::OrchestratorSettings;
use dispatch::{
    BreakerConfig, BreakerRegistry, Capability, ChannelFrame, CollaboratorId, CorrelatedChannel,
    DispatchOrchestrator, ErrorKind, PerformanceLedger, RemoteAgent, SelectionWeights,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn channel(timeout: Duration) -> (Arc<CorrelatedChannel>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(CorrelatedChannel::new(CollaboratorId::from("desktop"), tx, timeout)),
        rx,
    )
}

fn parse_command(text: &str) -> Result<(String, String, Value)> {
    match ChannelFrame::from_json(text)? {
        ChannelFrame::Command {
            request_id,
            command,
            params,
        } => Ok((request_id, command, params)),
        other => Err(anyhow!("expected a command frame, got {}", other.kind())),
    }
}

/// Collects `batch` commands, then answers them newest first
fn spawn_reversing_peer(
    mut outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<String>,
    batch: usize,
) -> tokio::task::JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let mut received = Vec::with_capacity(batch);
        while received.len() < batch {
            let Some(text) = outbound.recv().await else {
                break;
            };
            received.push(parse_command(&text)?);
        }
        for (request_id, command, params) in received.into_iter().rev() {
            let reply =
                ChannelFrame::success(request_id, json!({ "echo": command, "params": params }));
            inbound.send(reply.to_json()?)?;
        }
        Ok(())
    })
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() -> Result<()> {
    let (chan, outbound) = channel(Duration::from_secs(5));
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let peer = spawn_reversing_peer(outbound, inbound_tx, 32);

    let server = {
        let chan = Arc::clone(&chan);
        tokio::spawn(async move { chan.serve(inbound_rx).await })
    };

    let requests: Vec<_> = (0..32)
        .map(|i| {
            let chan = Arc::clone(&chan);
            tokio::spawn(async move { chan.send(&format!("cmd-{}", i), json!({ "n": i })).await })
        })
        .collect();

    for (i, request) in requests.into_iter().enumerate() {
        let value = request.await??;
        assert_eq!(value["echo"], format!("cmd-{}", i));
        assert_eq!(value["params"]["n"], i);
    }
    peer.await??;

    let stats = chan.stats();
    assert_eq!(stats.sent, 32);
    assert_eq!(stats.resolved, 32);
    assert_eq!(stats.pending, 0);

    // The peer hung up its inbound half, so the pump ends and disconnects
    server.await?;
    assert!(!chan.is_connected());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_timeout_settles_once_and_late_reply_is_dropped() -> Result<()> {
    let (chan, mut outbound) = channel(Duration::from_millis(250));

    let caller = {
        let chan = Arc::clone(&chan);
        tokio::spawn(async move { chan.send("screenshot", json!({})).await })
    };

    let text = outbound.recv().await.ok_or_else(|| anyhow!("no frame"))?;
    let (request_id, command, _) = parse_command(&text)?;
    assert_eq!(command, "screenshot");
    assert_eq!(chan.pending_count(), 1);

    tokio::time::advance(Duration::from_millis(251)).await;
    let err = caller.await?.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(chan.pending_count(), 0);

    let late = ChannelFrame::success(request_id.clone(), json!("too late")).to_json()?;
    let disposition = chan.handle_inbound(&late)?;
    assert_eq!(disposition, dispatch::InboundDisposition::Dropped { request_id });

    let stats = chan.stats();
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.resolved, 0);
    assert_eq!(stats.dropped, 1);
    Ok(())
}

#[tokio::test]
async fn test_disconnect_rejects_every_pending_request() -> Result<()> {
    let (chan, mut outbound) = channel(Duration::from_secs(30));

    let callers: Vec<_> = (0..5)
        .map(|i| {
            let chan = Arc::clone(&chan);
            tokio::spawn(async move { chan.send("read_file", json!({ "i": i })).await })
        })
        .collect();
    for _ in 0..5 {
        outbound.recv().await.ok_or_else(|| anyhow!("no frame"))?;
    }
    assert_eq!(chan.pending_count(), 5);

    chan.disconnect();
    for caller in callers {
        let err = caller.await?.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerDisconnected);
    }
    assert_eq!(chan.pending_count(), 0);
    assert_eq!(chan.stats().disconnected, 5);

    let err = chan.send("read_file", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PeerDisconnected);
    Ok(())
}

#[tokio::test]
async fn test_failure_response_carries_agent_error() -> Result<()> {
    let (chan, mut outbound) = channel(Duration::from_secs(5));

    let caller = {
        let chan = Arc::clone(&chan);
        tokio::spawn(async move { chan.send("open_app", json!({"name": "notes"})).await })
    };
    let text = outbound.recv().await.ok_or_else(|| anyhow!("no frame"))?;
    let (request_id, _, _) = parse_command(&text)?;
    chan.handle_inbound(&ChannelFrame::failure(request_id, "app not installed").to_json()?)?;

    let err = caller.await?.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AttemptFailed);
    assert!(err.to_string().contains("app not installed"));
    Ok(())
}

#[tokio::test]
async fn test_disconnected_remote_agent_falls_back() -> Result<()> {
    let capture = Capability::from("screenshot");
    let mut orch = DispatchOrchestrator::new(
        Arc::new(BreakerRegistry::new(BreakerConfig::default())),
        Arc::new(PerformanceLedger::new()),
        SelectionWeights::default(),
        OrchestratorSettings::default(),
    );

    let offline = Arc::new(RemoteAgent::new("laptop".into()));
    let online = Arc::new(RemoteAgent::new("desktop".into()));
    orch.register(offline.clone(), vec![capture.clone()]);
    orch.register(online.clone(), vec![capture.clone()]);

    let (chan, outbound) = online.connect(Duration::from_secs(5));
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let peer = spawn_reversing_peer(outbound, inbound_tx, 1);
    let server = tokio::spawn(async move { chan.serve(inbound_rx).await });

    let outcome = orch.execute(&capture, json!({"monitor": 1})).await?;
    assert_eq!(outcome.collaborator, CollaboratorId::from("desktop"));
    assert_eq!(outcome.result["echo"], "screenshot");
    assert_eq!(outcome.failed_attempts.len(), 1);
    assert_eq!(outcome.failed_attempts[0].kind, ErrorKind::PeerDisconnected);

    peer.await??;
    server.await?;
    assert!(!online.is_connected());
    Ok(())
}
