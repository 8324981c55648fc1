//! Long-running loops of a relay session.
//!
//! Every established connection gets a receive loop (classify inbound
//! payloads) and a send loop (identity key first, then queued messages).
//! The outbox pump fans submitted messages out to every live peer. The
//! accept and announce loops only run while serving.

use crate::classifier::Classifier;
use crate::context::{jittered, RelayContext};
use crate::registry::{Peer, PeerChannels};
use crate::tasks::{shutdown_signalled, TaskSet};
use crate::transport::PeerLink;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Register a freshly established link and start its loops.
pub async fn attach_peer(
    ctx: &Arc<RelayContext>,
    tasks: &TaskSet,
    link: Arc<dyn PeerLink>,
) -> Arc<Peer> {
    let (peer, PeerChannels { outbound, shutdown }) = Peer::new(link, ctx.platform());
    ctx.registry.add(peer.clone()).await;
    ctx.health.clear(peer.remote_id());
    info!(
        peer = %peer.remote_id(),
        total = ctx.registry.len(),
        "Peer connected"
    );

    tasks.spawn(receive_loop(ctx.clone(), peer.clone(), shutdown.clone()));
    tasks.spawn(send_loop(ctx.clone(), peer.clone(), outbound, shutdown));
    peer
}

async fn receive_loop(
    ctx: Arc<RelayContext>,
    peer: Arc<Peer>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut classifier = Classifier::new(ctx.tuning.key_threshold);
    loop {
        tokio::select! {
            received = peer.link().recv() => match received {
                Ok(Some(payload)) => {
                    classifier.route(peer.remote_id(), &payload, &ctx.keys, &ctx.inbox);
                }
                Ok(None) => {
                    info!(peer = %peer.remote_id(), "Link closed by remote");
                    break;
                }
                Err(e) => {
                    warn!(peer = %peer.remote_id(), error = %e, "Receive failed");
                    ctx.health.record(peer.remote_id(), &e);
                    break;
                }
            },
            _ = shutdown_signalled(&mut shutdown) => break,
        }
    }
    if ctx.registry.remove_peer(&peer).await {
        info!(peer = %peer.remote_id(), total = ctx.registry.len(), "Peer disconnected");
    }
}

async fn send_loop(
    ctx: Arc<RelayContext>,
    peer: Arc<Peer>,
    mut outbound: mpsc::UnboundedReceiver<Arc<Vec<u8>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut key_rx = ctx.local_key.subscribe();
    let key = tokio::select! {
        current = key_rx.wait_for(|k| k.is_some()) => match current {
            Ok(k) => k.clone(),
            Err(_) => None,
        },
        _ = shutdown_signalled(&mut shutdown) => None,
    };
    let Some(key) = key else {
        return;
    };

    if let Err(e) = peer.link().send(&key).await {
        warn!(peer = %peer.remote_id(), error = %e, "Failed to send local key");
        ctx.health.record(peer.remote_id(), &e);
        ctx.registry.remove_peer(&peer).await;
        return;
    }
    debug!(peer = %peer.remote_id(), bytes = key.len(), "Sent local key");

    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(payload) = next else { break };
                if let Err(e) = peer.link().send(&payload).await {
                    warn!(peer = %peer.remote_id(), error = %e, "Send failed");
                    ctx.health.record(peer.remote_id(), &e);
                    ctx.registry.remove_peer(&peer).await;
                    break;
                }
                debug!(peer = %peer.remote_id(), bytes = payload.len(), "Sent message");
            }
            _ = shutdown_signalled(&mut shutdown) => break,
        }
    }
}

/// Fan every outbox payload out to the peers connected at that moment.
pub async fn outbox_pump(ctx: Arc<RelayContext>, mut shutdown: watch::Receiver<bool>) {
    loop {
        while let Some(payload) = ctx.outbox.pop() {
            let peers = ctx.registry.list();
            if peers.is_empty() {
                debug!(bytes = payload.len(), "No peers connected, message dropped");
                continue;
            }
            for peer in &peers {
                peer.enqueue(payload.clone());
            }
            debug!(
                bytes = payload.len(),
                peers = peers.len(),
                "Message queued for broadcast"
            );
        }
        tokio::select! {
            _ = ctx.outbox.notified() => {}
            _ = shutdown_signalled(&mut shutdown) => break,
        }
    }
}

/// Accept inbound connections until shutdown.
pub async fn accept_loop(
    ctx: Arc<RelayContext>,
    peers: Arc<TaskSet>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(platform = ctx.platform(), "Accepting inbound connections");
    loop {
        tokio::select! {
            accepted = ctx.transport.accept() => match accepted {
                Ok(link) => {
                    if *shutdown.borrow() {
                        let _ = link.close().await;
                        break;
                    }
                    info!(peer = %link.remote_id(), "Inbound connection");
                    attach_peer(&ctx, &peers, link).await;
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::select! {
                        _ = tokio::time::sleep(ctx.tuning.accept_backoff) => {}
                        _ = shutdown_signalled(&mut shutdown) => break,
                    }
                }
            },
            _ = shutdown_signalled(&mut shutdown) => break,
        }
    }
    debug!("Accept loop stopped");
}

/// Periodically announce our own reachability.
pub async fn announce_loop(ctx: Arc<RelayContext>, mut shutdown: watch::Receiver<bool>) {
    loop {
        match ctx.transport.announce().await {
            Ok(()) => debug!("Announced"),
            Err(e) => warn!(error = %e, "Announce failed"),
        }
        let delay = jittered(ctx.tuning.announce_interval);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_signalled(&mut shutdown) => break,
        }
    }
}
