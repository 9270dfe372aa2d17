//! Node-to-node transport.
//!
//! Request/response over the core frame codec. [`NodeTransport`] is the
//! client seam; [`TransportService`] is the server dispatch seam the host
//! node implements. Production runs [`TcpTransport`]; tests run a
//! [`MemoryMesh`] wiring services directly.

use crate::error::{ClusterError, Result};
use crate::replica::{Message, MessageKind, StepEnvelope};
use crate::traits::ReactorSender;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use reverb_core::{Frame, NodeId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// RPC paths used by the core.
pub mod paths {
    /// Remote term-start-index lookup during conflict check.
    pub const CHANNEL_LEADER_TERM_START_INDEX: &str = "/channel/leaderTermStartIndex";
    /// Channel cluster-config fetch from the slot leader.
    pub const CHANNEL_CLUSTER_CONFIG: &str = "/channel/clusterconfig";
    /// Channel cluster-config mutation proposed via the slot leader.
    pub const CHANNEL_CLUSTER_CONFIG_PROPOSE: &str = "/channel/clusterconfig/propose";
    /// Proxy → leader forward of decrypted publishes.
    pub const CHANNEL_PROPOSE_FORWARD: &str = "/channel/proposeForward";
    /// Leader → home-node delivery batch.
    pub const CHANNEL_DELIVER: &str = "/channel/deliver";
    /// Slot log sync traffic.
    pub const SLOT_LOG_SYNC: &str = "/slot/log/sync";
    /// Slot heartbeat/election traffic.
    pub const SLOT_LOG_APPEND: &str = "/slot/log/append";
    /// Slot leader → member push of an applied slot config.
    pub const SLOT_CONFIG_PUSH: &str = "/slot/config/push";
    /// Channel log sync traffic.
    pub const CHANNEL_LOG_SYNC: &str = "/channel/log/sync";
    /// Channel heartbeat/election traffic.
    pub const CHANNEL_LOG_APPEND: &str = "/channel/log/append";
}

/// Client seam: node-addressed request/response.
#[async_trait]
pub trait NodeTransport: Send + Sync + 'static {
    /// Send `payload` to `to` on `path` and await the response body.
    async fn request(&self, to: NodeId, path: &str, payload: Bytes) -> Result<Bytes>;
}

/// Server seam: dispatch one inbound request.
pub trait TransportService: Send + Sync + 'static {
    /// Handle a request, returning the response body.
    fn handle(&self, path: String, payload: Bytes) -> BoxFuture<'static, Result<Bytes>>;
}

// ---------------------------------------------------------------- memory

/// In-process mesh connecting services by node id.
#[derive(Default)]
pub struct MemoryMesh {
    nodes: DashMap<u64, Arc<dyn TransportService>>,
    /// Links marked down; requests in either direction fail retriably.
    down: DashMap<u64, ()>,
}

impl MemoryMesh {
    /// Create an empty mesh.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node's service.
    pub fn register(&self, node: NodeId, service: Arc<dyn TransportService>) {
        self.nodes.insert(node.value(), service);
    }

    /// Simulate a node failure.
    pub fn take_down(&self, node: NodeId) {
        self.down.insert(node.value(), ());
    }

    /// Restore a failed node.
    pub fn bring_up(&self, node: NodeId) {
        self.down.remove(&node.value());
    }

    fn is_down(&self, node: NodeId) -> bool {
        self.down.contains_key(&node.value())
    }
}

/// One node's client handle into a [`MemoryMesh`].
pub struct MemoryTransport {
    local: NodeId,
    mesh: Arc<MemoryMesh>,
    req_timeout: Duration,
}

impl MemoryTransport {
    /// Create a handle for `local`.
    pub fn new(local: NodeId, mesh: Arc<MemoryMesh>, req_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            local,
            mesh,
            req_timeout,
        })
    }
}

#[async_trait]
impl NodeTransport for MemoryTransport {
    async fn request(&self, to: NodeId, path: &str, payload: Bytes) -> Result<Bytes> {
        if self.mesh.is_down(self.local) || self.mesh.is_down(to) {
            return Err(ClusterError::Transport {
                peer: to,
                details: "link down".into(),
            });
        }
        let service = self
            .mesh
            .nodes
            .get(&to.value())
            .map(|s| s.clone())
            .ok_or(ClusterError::NoRoute(to))?;
        let fut = service.handle(path.to_string(), payload);
        match tokio::time::timeout(self.req_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::RequestTimeout {
                peer: to,
                path: path.to_string(),
            }),
        }
    }
}

// ------------------------------------------------------------------ tcp

struct PeerConn {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

/// TCP transport: one pooled connection per peer, responses correlated by
/// request id, in-flight requests failed on disconnect.
pub struct TcpTransport {
    local: NodeId,
    addrs: DashMap<u64, String>,
    conns: Arc<DashMap<u64, Arc<PeerConn>>>,
    pending: Arc<DashMap<u64, oneshot::Sender<Result<Bytes>>>>,
    next_request_id: AtomicU64,
    req_timeout: Duration,
    max_frame_size: usize,
    service: Arc<dyn TransportService>,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TcpTransport {
    /// Create a transport for `local` with the given peer address book.
    pub fn new(
        local: NodeId,
        peers: impl IntoIterator<Item = (NodeId, String)>,
        service: Arc<dyn TransportService>,
        req_timeout: Duration,
        max_frame_size: usize,
    ) -> Arc<Self> {
        let addrs = DashMap::new();
        for (node, addr) in peers {
            addrs.insert(node.value(), addr);
        }
        Arc::new(Self {
            local,
            addrs,
            conns: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
            next_request_id: AtomicU64::new(1),
            req_timeout,
            max_frame_size,
            service,
            accept_task: Mutex::new(None),
        })
    }

    /// Bind `listen_addr` and serve inbound requests. Returns the bound
    /// address (useful with port 0).
    pub async fn start(self: &Arc<Self>, listen_addr: &str) -> Result<String> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| ClusterError::Transport {
                peer: self.local,
                details: format!("bind {}: {}", listen_addr, e),
            })?;
        let bound = listener
            .local_addr()
            .map_err(|e| ClusterError::Transport {
                peer: self.local,
                details: format!("local addr: {}", e),
            })?
            .to_string();
        info!(node = %self.local, addr = %bound, "transport listening");
        let this = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!(peer = %peer_addr, "inbound connection");
                        let this = this.clone();
                        tokio::spawn(async move {
                            this.serve_conn(stream).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });
        *self.accept_task.lock() = Some(task);
        Ok(bound)
    }

    /// Stop accepting. Outbound connections close as they error.
    pub fn stop(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
    }

    async fn serve_conn(self: Arc<Self>, stream: TcpStream) {
        let (mut reader, writer) = stream.into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        let mut buf = BytesMut::with_capacity(64 * 1024);
        loop {
            let frame = match Frame::decode(&mut buf, self.max_frame_size) {
                Ok(Some(frame)) => frame,
                Ok(None) => match reader.read_buf(&mut buf).await {
                    Ok(0) => return,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "inbound read failed");
                        return;
                    }
                },
                Err(e) => {
                    warn!(error = %e, "undecodable inbound frame, closing");
                    return;
                }
            };
            let this = self.clone();
            let writer = writer.clone();
            tokio::spawn(async move {
                let body = match this.service.handle(frame.path, frame.payload).await {
                    Ok(body) => body,
                    Err(e) => {
                        debug!(error = %e, "request handler failed");
                        Bytes::new()
                    }
                };
                let response = Frame::response(frame.request_id, body);
                if let Ok(encoded) = response.encode() {
                    let mut writer = writer.lock().await;
                    let _ = writer.write_all(&encoded).await;
                }
            });
        }
    }

    async fn conn_to(&self, to: NodeId) -> Result<Arc<PeerConn>> {
        if let Some(conn) = self.conns.get(&to.value()) {
            return Ok(conn.clone());
        }
        let addr = self
            .addrs
            .get(&to.value())
            .map(|a| a.clone())
            .ok_or(ClusterError::NoRoute(to))?;
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| ClusterError::Transport {
                peer: to,
                details: format!("connect {}: {}", addr, e),
            })?;
        let (mut reader, writer) = stream.into_split();
        let conn = Arc::new(PeerConn {
            writer: tokio::sync::Mutex::new(writer),
        });
        self.conns.insert(to.value(), conn.clone());

        // Response pump: correlate by request id; a dropped connection
        // fails everything still in flight.
        let pending = self.pending.clone();
        let conns = self.conns.clone();
        let max_frame = self.max_frame_size;
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(64 * 1024);
            loop {
                match Frame::decode(&mut buf, max_frame) {
                    Ok(Some(frame)) => {
                        if let Some((_, reply)) = pending.remove(&frame.request_id) {
                            let _ = reply.send(Ok(frame.payload));
                        }
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(peer = %to, error = %e, "undecodable response frame");
                        break;
                    }
                }
                match reader.read_buf(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            conns.remove(&to.value());
            // Fail whatever was waiting on this link.
            let doomed: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
            for id in doomed {
                if let Some((_, reply)) = pending.remove(&id) {
                    let _ = reply.send(Err(ClusterError::Transport {
                        peer: to,
                        details: "connection dropped".into(),
                    }));
                }
            }
        });
        Ok(conn)
    }
}

#[async_trait]
impl NodeTransport for TcpTransport {
    async fn request(&self, to: NodeId, path: &str, payload: Bytes) -> Result<Bytes> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::request(path, request_id, payload);
        let encoded = frame.encode()?;

        let (reply, rx) = oneshot::channel();
        self.pending.insert(request_id, reply);

        let conn = match self.conn_to(to).await {
            Ok(conn) => conn,
            Err(e) => {
                self.pending.remove(&request_id);
                return Err(e);
            }
        };
        {
            let mut writer = conn.writer.lock().await;
            if let Err(e) = writer.write_all(&encoded).await {
                drop(writer);
                self.pending.remove(&request_id);
                self.conns.remove(&to.value());
                return Err(ClusterError::Transport {
                    peer: to,
                    details: format!("write: {}", e),
                });
            }
        }

        match tokio::time::timeout(self.req_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClusterError::Transport {
                peer: to,
                details: "connection dropped".into(),
            }),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(ClusterError::RequestTimeout {
                    peer: to,
                    path: path.to_string(),
                })
            }
        }
    }
}

// ------------------------------------------------------------- sender

/// [`ReactorSender`] that ships step messages over a [`NodeTransport`],
/// picking the sync or append path by message kind.
pub struct StepSender {
    transport: Arc<dyn NodeTransport>,
    sync_path: &'static str,
    append_path: &'static str,
}

impl StepSender {
    /// Sender for the channel reactor.
    pub fn channel(transport: Arc<dyn NodeTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            sync_path: paths::CHANNEL_LOG_SYNC,
            append_path: paths::CHANNEL_LOG_APPEND,
        })
    }

    /// Sender for the slot reactor.
    pub fn slot(transport: Arc<dyn NodeTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            sync_path: paths::SLOT_LOG_SYNC,
            append_path: paths::SLOT_LOG_APPEND,
        })
    }
}

#[async_trait]
impl ReactorSender for StepSender {
    async fn send(&self, to: NodeId, handler_key: &str, message: Message) -> Result<()> {
        let path = match message.kind {
            MessageKind::SyncGet | MessageKind::SyncGetResp => self.sync_path,
            _ => self.append_path,
        };
        let envelope = StepEnvelope {
            handler_key: handler_key.to_string(),
            message,
        };
        self.transport.request(to, path, envelope.encode()?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl TransportService for Echo {
        fn handle(&self, path: String, payload: Bytes) -> BoxFuture<'static, Result<Bytes>> {
            Box::pin(async move {
                let mut out = BytesMut::new();
                out.extend_from_slice(path.as_bytes());
                out.extend_from_slice(b":");
                out.extend_from_slice(&payload);
                Ok(out.freeze())
            })
        }
    }

    #[tokio::test]
    async fn test_memory_mesh_roundtrip() {
        let mesh = MemoryMesh::new();
        mesh.register(NodeId::new(2), Arc::new(Echo));
        let transport = MemoryTransport::new(NodeId::new(1), mesh, Duration::from_secs(1));
        let resp = transport
            .request(NodeId::new(2), "/x", Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert_eq!(&resp[..], b"/x:hi");
    }

    #[tokio::test]
    async fn test_memory_mesh_down_node_fails_retriably() {
        let mesh = MemoryMesh::new();
        mesh.register(NodeId::new(2), Arc::new(Echo));
        let transport = MemoryTransport::new(NodeId::new(1), mesh.clone(), Duration::from_secs(1));
        mesh.take_down(NodeId::new(2));
        let err = transport
            .request(NodeId::new(2), "/x", Bytes::new())
            .await
            .unwrap_err();
        assert!(err.is_retriable());
        mesh.bring_up(NodeId::new(2));
        assert!(transport.request(NodeId::new(2), "/x", Bytes::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_mesh_unknown_peer() {
        let mesh = MemoryMesh::new();
        let transport = MemoryTransport::new(NodeId::new(1), mesh, Duration::from_secs(1));
        assert!(matches!(
            transport.request(NodeId::new(9), "/x", Bytes::new()).await,
            Err(ClusterError::NoRoute(_))
        ));
    }

    #[tokio::test]
    async fn test_tcp_roundtrip() {
        let server = TcpTransport::new(
            NodeId::new(2),
            Vec::<(NodeId, String)>::new(),
            Arc::new(Echo),
            Duration::from_secs(1),
            1024 * 1024,
        );
        let addr = server.start("127.0.0.1:0").await.unwrap();

        let client = TcpTransport::new(
            NodeId::new(1),
            vec![(NodeId::new(2), addr)],
            Arc::new(Echo),
            Duration::from_secs(1),
            1024 * 1024,
        );
        let resp = client
            .request(NodeId::new(2), "/ping", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_eq!(&resp[..], b"/ping:abc");
    }
}
