//! Mesh transport (MT): multiplexed, message-oriented intra-cluster links.
//!
//! Contract the core relies on:
//! - per-peer ordered delivery (one writer task per peer)
//! - reliable until the peer is declared down
//! - explicit multicast with a per-peer success/failure vector
//! - bounded in-flight messages per peer (send backpressure)
//! - optional per-message ack
//!
//! Frames reuse the DIS primitives: source, destination, message id, ack
//! flag, counted payload.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::chan::{ChanError, DisChan, TimeoutClass};

/// Messages a peer may have in flight before sends start waiting.
const PEER_QUEUE_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("peer {0} is not registered")]
    UnknownPeer(String),
    #[error("peer {0} is down")]
    PeerDown(String),
    #[error("ack for message {0} was never delivered")]
    AckLost(u64),
}

/// One framed mesh message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshMsg {
    pub src: String,
    pub dst: String,
    pub msg_id: u64,
    pub want_ack: bool,
    pub payload: Bytes,
}

impl MeshMsg {
    pub async fn write_to<S: AsyncWrite + Unpin>(
        &self,
        chan: &mut DisChan<S>,
    ) -> Result<(), ChanError> {
        chan.write_string(&self.src);
        chan.write_string(&self.dst);
        chan.write_uint(self.msg_id);
        chan.write_uint(u64::from(self.want_ack));
        chan.write_bytes(&self.payload);
        chan.flush().await
    }

    pub async fn read_from<S: AsyncRead + Unpin>(
        chan: &mut DisChan<S>,
    ) -> Result<Self, ChanError> {
        let src = chan.read_string().await?;
        let dst = chan.read_string().await?;
        let msg_id = chan.read_uint().await?;
        let want_ack = chan.read_uint().await? != 0;
        let payload = Bytes::from(chan.read_bytes().await?);
        Ok(Self {
            src,
            dst,
            msg_id,
            want_ack,
            payload,
        })
    }
}

/// Per-peer send result from a multicast.
#[derive(Debug)]
pub struct PeerResult {
    pub peer: String,
    pub result: Result<(), MeshError>,
}

struct PeerHandle {
    tx: mpsc::Sender<MeshMsg>,
}

struct HubInner {
    peers: Mutex<HashMap<String, PeerHandle>>,
    pending_acks: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    incoming_tx: mpsc::Sender<MeshMsg>,
    next_msg_id: AtomicU64,
    name: String,
}

/// The local endpoint of the mesh. Owns one writer task per attached
/// peer; readers feed a single incoming queue so per-peer order holds.
#[derive(Clone)]
pub struct MeshHub {
    inner: Arc<HubInner>,
}

impl MeshHub {
    pub fn new(name: impl Into<String>) -> (Self, mpsc::Receiver<MeshMsg>) {
        let (incoming_tx, incoming_rx) = mpsc::channel(PEER_QUEUE_DEPTH * 4);
        let hub = Self {
            inner: Arc::new(HubInner {
                peers: Mutex::new(HashMap::new()),
                pending_acks: Mutex::new(HashMap::new()),
                incoming_tx,
                next_msg_id: AtomicU64::new(1),
                name: name.into(),
            }),
        };
        (hub, incoming_rx)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Attach a connected peer stream. Spawns the writer and reader tasks
    /// for it; the previous handle for the same name, if any, is dropped
    /// (its writer exits once its queue drains).
    pub fn attach_peer<S>(&self, peer: impl Into<String>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.attach_peer_buffered(peer, stream, BytesMut::new())
    }

    /// Attach a peer whose name was learned by reading its first frame;
    /// `carry` holds any bytes read beyond that frame.
    pub fn attach_peer_buffered<S>(&self, peer: impl Into<String>, stream: S, carry: BytesMut)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let peer = peer.into();
        let (tx, mut rx) = mpsc::channel::<MeshMsg>(PEER_QUEUE_DEPTH);
        let (rhalf, whalf) = tokio::io::split(stream);
        let mut rchan = DisChan::with_read_buffer(rhalf, carry);
        rchan.set_timeout(TimeoutClass::None);
        let mut wchan = DisChan::new(whalf);

        // writer: drains the per-peer queue, preserving send order
        let hub_w = self.inner.clone();
        let peer_w = peer.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = msg.write_to(&mut wchan).await {
                    warn!(peer = %peer_w, error = %e, "mesh write failed, declaring peer down");
                    hub_w.peers.lock().unwrap().remove(&peer_w);
                    break;
                }
            }
        });

        // reader: frames feed the hub's single incoming queue
        let hub_r = self.inner.clone();
        let ack_tx = tx.clone();
        let peer_r = peer.clone();
        tokio::spawn(async move {
            loop {
                match MeshMsg::read_from(&mut rchan).await {
                    Ok(msg) => {
                        if msg.payload.is_empty() && !msg.want_ack {
                            // bare ack frame resolves a pending waiter
                            if let Some(waiter) =
                                hub_r.pending_acks.lock().unwrap().remove(&msg.msg_id)
                            {
                                let _ = waiter.send(());
                                continue;
                            }
                        }
                        if msg.want_ack {
                            let ack = MeshMsg {
                                src: hub_r.name.clone(),
                                dst: msg.src.clone(),
                                msg_id: msg.msg_id,
                                want_ack: false,
                                payload: Bytes::new(),
                            };
                            if ack_tx.send(ack).await.is_err() {
                                break;
                            }
                        }
                        if hub_r.incoming_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(peer = %peer_r, error = %e, "mesh peer closed");
                        break;
                    }
                }
            }
            hub_r.peers.lock().unwrap().remove(&peer_r);
        });

        self.inner
            .peers
            .lock()
            .unwrap()
            .insert(peer, PeerHandle { tx });
    }

    /// Hand a frame straight to the incoming queue, as if a peer reader
    /// produced it. Used for the handshake frame read before attach.
    pub async fn inject(&self, msg: MeshMsg) {
        let _ = self.inner.incoming_tx.send(msg).await;
    }

    /// Declare a peer down: queued messages are dropped and later sends
    /// fail with `PeerDown`.
    pub fn declare_down(&self, peer: &str) {
        self.inner.peers.lock().unwrap().remove(peer);
    }

    pub fn is_up(&self, peer: &str) -> bool {
        self.inner.peers.lock().unwrap().contains_key(peer)
    }

    fn handle_for(&self, peer: &str) -> Result<mpsc::Sender<MeshMsg>, MeshError> {
        self.inner
            .peers
            .lock()
            .unwrap()
            .get(peer)
            .map(|h| h.tx.clone())
            .ok_or_else(|| MeshError::PeerDown(peer.to_string()))
    }

    fn next_id(&self) -> u64 {
        self.inner.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send one message to one peer. Waits for queue space (backpressure)
    /// but not for delivery.
    pub async fn send(&self, peer: &str, payload: Bytes) -> Result<u64, MeshError> {
        let tx = self.handle_for(peer)?;
        let msg_id = self.next_id();
        let msg = MeshMsg {
            src: self.inner.name.clone(),
            dst: peer.to_string(),
            msg_id,
            want_ack: false,
            payload,
        };
        tx.send(msg)
            .await
            .map_err(|_| MeshError::PeerDown(peer.to_string()))?;
        Ok(msg_id)
    }

    /// Send and wait for the peer's ack frame.
    pub async fn send_acked(&self, peer: &str, payload: Bytes) -> Result<(), MeshError> {
        let tx = self.handle_for(peer)?;
        let msg_id = self.next_id();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .pending_acks
            .lock()
            .unwrap()
            .insert(msg_id, ack_tx);
        let msg = MeshMsg {
            src: self.inner.name.clone(),
            dst: peer.to_string(),
            msg_id,
            want_ack: true,
            payload,
        };
        tx.send(msg)
            .await
            .map_err(|_| MeshError::PeerDown(peer.to_string()))?;
        ack_rx.await.map_err(|_| MeshError::AckLost(msg_id))
    }

    /// All-or-each multicast: every addressed peer gets the payload and
    /// the caller gets one result per peer, never a silent partial drop.
    pub async fn multicast(&self, peers: &[String], payload: Bytes) -> Vec<PeerResult> {
        let sends = peers.iter().map(|p| {
            let hub = self.clone();
            let payload = payload.clone();
            let peer = p.clone();
            async move {
                let result = hub.send(&peer, payload).await.map(|_| ());
                PeerResult { peer, result }
            }
        });
        futures::future::join_all(sends).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(a: &str, b: &str) -> (MeshHub, mpsc::Receiver<MeshMsg>, MeshHub, mpsc::Receiver<MeshMsg>) {
        let (hub_a, rx_a) = MeshHub::new(a);
        let (hub_b, rx_b) = MeshHub::new(b);
        let (sa, sb) = tokio::io::duplex(16 * 1024);
        hub_a.attach_peer(b, sa);
        hub_b.attach_peer(a, sb);
        (hub_a, rx_a, hub_b, rx_b)
    }

    #[tokio::test]
    async fn send_delivers_in_order() {
        let (hub_a, _rx_a, _hub_b, mut rx_b) = pair("server", "mom1");
        for i in 0..10u64 {
            hub_a.send("mom1", Bytes::from(format!("m{i}"))).await.unwrap();
        }
        for i in 0..10u64 {
            let got = rx_b.recv().await.unwrap();
            assert_eq!(got.payload, Bytes::from(format!("m{i}")));
            assert_eq!(got.src, "server");
        }
    }

    #[tokio::test]
    async fn send_to_down_peer_fails() {
        let (hub_a, _rx_a, _hub_b, _rx_b) = pair("server", "mom1");
        hub_a.declare_down("mom1");
        match hub_a.send("mom1", Bytes::from_static(b"x")).await {
            Err(MeshError::PeerDown(p)) => assert_eq!(p, "mom1"),
            other => panic!("expected PeerDown, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn multicast_reports_per_peer_results() {
        let (hub_a, _rx_a, _hub_b, mut rx_b) = pair("server", "mom1");
        let peers = vec!["mom1".to_string(), "mom2".to_string()];
        let results = hub_a.multicast(&peers, Bytes::from_static(b"hello")).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].result.is_ok());
        assert!(matches!(results[1].result, Err(MeshError::PeerDown(_))));
        assert_eq!(rx_b.recv().await.unwrap().payload, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn acked_send_round_trips() {
        let (hub_a, _rx_a, _hub_b, mut rx_b) = pair("server", "mom1");
        let recv = tokio::spawn(async move { rx_b.recv().await });
        hub_a
            .send_acked("mom1", Bytes::from_static(b"obit"))
            .await
            .unwrap();
        let got = recv.await.unwrap().unwrap();
        assert_eq!(got.payload, Bytes::from_static(b"obit"));
        assert!(got.want_ack);
    }
}
