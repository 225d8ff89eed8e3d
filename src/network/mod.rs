use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::{Duration, timeout};
use tracing::{debug, error, info, warn};

use crate::error::RpcError;
use crate::message::{RequestEnvelope, ResponseEnvelope, StorageRequest, StorageResponse};
use crate::node::StorageNode;
use crate::permission::Principal;
use crate::traits::{RpcResult, StorageTransport};
use crate::types::{NodeId, RequestId};

pub mod framing;

use framing::{FrameSink, FrameStream};

/// Server-side entry point for decoded requests.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, principal: &Principal, request: StorageRequest) -> StorageResponse;
}

#[async_trait]
impl RequestHandler for StorageNode {
    async fn handle(&self, principal: &Principal, request: StorageRequest) -> StorageResponse {
        StorageNode::handle(self, principal, request).await
    }
}

#[derive(Debug, Clone)]
pub struct TcpTransportOptions {
    /// Identity attached to every request sent through this transport
    pub principal: Principal,
    pub node_map: HashMap<NodeId, String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl TcpTransportOptions {
    pub fn new(principal: Principal, node_map: HashMap<NodeId, String>) -> Self {
        Self {
            principal,
            node_map,
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(2),
        }
    }
}

type Pending = oneshot::Sender<RpcResult<StorageResponse>>;

struct Connection {
    outgoing_tx: mpsc::UnboundedSender<(RequestEnvelope, Pending)>,
}

/// Client side of the storage protocol over TCP.
///
/// Keeps one multiplexed connection per target; responses are matched to
/// callers by request id. A broken connection fails its pending calls and
/// is re-established on the next call.
#[derive(Clone)]
pub struct TcpTransport {
    options: Arc<TcpTransportOptions>,
    node_map: Arc<tokio::sync::RwLock<HashMap<NodeId, String>>>,
    connections: Arc<Mutex<HashMap<NodeId, Arc<Connection>>>>,
    shutdown: Arc<Notify>,
}

impl TcpTransport {
    pub fn new(options: TcpTransportOptions) -> Self {
        let node_map = Arc::new(tokio::sync::RwLock::new(options.node_map.clone()));
        Self {
            options: Arc::new(options),
            node_map,
            connections: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub async fn add_node(&self, node_id: NodeId, address: String) {
        info!("Node {} added with address {}", node_id, address);
        self.node_map.write().await.insert(node_id, address);
    }

    pub async fn del_node(&self, node_id: &NodeId) {
        info!("Node {} removed", node_id);
        self.node_map.write().await.remove(node_id);
        self.connections.lock().remove(node_id);
    }

    pub fn shutdown(&self) {
        self.connections.lock().clear();
        self.shutdown.notify_waiters();
    }

    async fn resolve_node_address(&self, node_id: &NodeId) -> RpcResult<String> {
        self.node_map
            .read()
            .await
            .get(node_id)
            .cloned()
            .ok_or_else(|| RpcError::NodeNotFound(node_id.clone()))
    }

    async fn connection(&self, node_id: &NodeId) -> RpcResult<Arc<Connection>> {
        if let Some(conn) = self.connections.lock().get(node_id) {
            if !conn.outgoing_tx.is_closed() {
                return Ok(conn.clone());
            }
        }

        let addr = self.resolve_node_address(node_id).await?;
        let stream = timeout(self.options.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| RpcError::Timeout)?
            .map_err(|e| RpcError::Network(format!("Failed to connect to {}: {}", node_id, e)))?;
        stream.set_nodelay(true).ok();
        debug!("Connected to {} at {}", node_id, addr);

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(
            node_id.clone(),
            stream,
            rx,
            self.shutdown.clone(),
        ));

        let conn = Arc::new(Connection { outgoing_tx: tx });
        self.connections.lock().insert(node_id.clone(), conn.clone());
        Ok(conn)
    }

    async fn call_once(&self, target: &NodeId, request: StorageRequest) -> RpcResult<StorageResponse> {
        let conn = self.connection(target).await?;
        let (tx, rx) = oneshot::channel();
        let envelope = RequestEnvelope {
            request_id: RequestId::new(),
            principal: self.options.principal.clone(),
            request,
        };
        conn.outgoing_tx
            .send((envelope, tx))
            .map_err(|_| RpcError::Network(format!("Connection to {} closed", target)))?;
        rx.await
            .map_err(|_| RpcError::Network(format!("Connection to {} dropped", target)))?
    }
}

// 单连接收发循环：请求按 request_id 与响应配对
async fn run_connection(
    node_id: NodeId,
    stream: TcpStream,
    mut outgoing_rx: mpsc::UnboundedReceiver<(RequestEnvelope, Pending)>,
    shutdown: Arc<Notify>,
) {
    let (reader, writer) = stream.into_split();
    let mut sink = FrameSink::new(writer);
    let mut frames = FrameStream::new(reader);
    let mut pending: HashMap<RequestId, Pending> = HashMap::new();

    let failure = loop {
        tokio::select! {
            outgoing = outgoing_rx.recv() => {
                let Some((envelope, reply)) = outgoing else {
                    break RpcError::Network("transport dropped".into());
                };
                if let Err(e) = sink.send(&envelope).await {
                    let _ = reply.send(Err(e.clone()));
                    break e;
                }
                pending.insert(envelope.request_id, reply);
            }
            incoming = frames.recv::<ResponseEnvelope>() => {
                match incoming {
                    Ok(Some(envelope)) => match pending.remove(&envelope.request_id) {
                        Some(reply) => {
                            let _ = reply.send(Ok(envelope.response));
                        }
                        None => debug!("Late response {} from {}", envelope.request_id, node_id),
                    },
                    Ok(None) => break RpcError::Network(format!("{} closed the connection", node_id)),
                    Err(e) => break e,
                }
            }
            _ = shutdown.notified() => {
                break RpcError::Network("transport shut down".into());
            }
        }
    };

    warn!("Connection to {} closed: {}", node_id, failure);
    outgoing_rx.close();
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(failure.clone()));
    }
    while let Ok((_, reply)) = outgoing_rx.try_recv() {
        let _ = reply.send(Err(failure.clone()));
    }
}

#[async_trait]
impl StorageTransport for TcpTransport {
    async fn call(&self, target: &NodeId, request: StorageRequest) -> RpcResult<StorageResponse> {
        timeout(self.options.request_timeout, self.call_once(target, request))
            .await
            .map_err(|_| RpcError::Timeout)?
    }
}

/// Accepts storage-protocol connections and hands requests to a handler.
pub struct TcpServer {
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    shutdown: Arc<Notify>,
}

impl TcpServer {
    pub async fn bind(addr: &str, handler: Arc<dyn RequestHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Storage server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            handler,
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle used to stop `serve`.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn serve(self) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        stream.set_nodelay(true).ok();
                        tokio::spawn(serve_connection(stream, self.handler.clone()));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                _ = self.shutdown.notified() => {
                    info!("Storage server shutting down");
                    return;
                }
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, handler: Arc<dyn RequestHandler>) {
    let (reader, writer) = stream.into_split();
    let mut frames = FrameStream::new(reader);
    let (response_tx, mut response_rx) = mpsc::unbounded_channel::<ResponseEnvelope>();

    let writer_task = tokio::spawn(async move {
        let mut sink = FrameSink::new(writer);
        while let Some(envelope) = response_rx.recv().await {
            if let Err(e) = sink.send(&envelope).await {
                warn!("Failed to write response: {}", e);
                break;
            }
        }
    });

    loop {
        match frames.recv::<RequestEnvelope>().await {
            Ok(Some(envelope)) => {
                let handler = handler.clone();
                let response_tx = response_tx.clone();
                tokio::spawn(async move {
                    let response = handler
                        .handle(&envelope.principal, envelope.request)
                        .await;
                    let _ = response_tx.send(ResponseEnvelope {
                        request_id: envelope.request_id,
                        response,
                    });
                });
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Dropping connection after bad frame: {}", e);
                break;
            }
        }
    }

    drop(response_tx);
    let _ = writer_task.await;
}
