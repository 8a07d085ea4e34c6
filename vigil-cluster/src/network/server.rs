//! HTTP server for cluster RPC.
//!
//! One hyper connection task per peer, all closed when the server stops. Every request is authenticated with
//! the shared cluster key before its body is read, and its type tag is
//! checked against the allow-list before the payload is decoded.

use super::envelope::{
    Envelope, JoinRequest, LeaveRequest, MessageType, RpcReply, LEADER_RPC_PATH, RPC_PATH,
};
use crate::command::ClusterRequest;
use crate::error::{ClusterError, ClusterResult};
use crate::raft::ClusterNode;
use crate::types::{ClusterNodeId, TypeConfig};
use crate::worker::ActiveTask;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use openraft::raft::{AppendEntriesRequest, InstallSnapshotRequest, VoteRequest};
use serde_json::Value;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use vigil_core::auth::{ClusterKey, CLUSTER_KEY_HEADER};

/// How long open connections get to finish their request on shutdown.
const CONNECTION_DRAIN: Duration = Duration::from_secs(2);

/// Source of the task list reported by `Status`.
pub trait TaskReport: Send + Sync {
    /// Tasks currently running on this node.
    fn active_tasks(&self) -> Vec<ActiveTask>;
}

struct ServerContext {
    node: Arc<ClusterNode>,
    key: ClusterKey,
    tasks: Option<Arc<dyn TaskReport>>,
}

/// Cluster RPC server.
pub struct RpcServer {
    listen_addr: String,
    node: Arc<ClusterNode>,
    tasks: Option<Arc<dyn TaskReport>>,
}

impl RpcServer {
    /// Create a server for `node` on its configured listen address.
    pub fn new(node: Arc<ClusterNode>) -> Self {
        Self {
            listen_addr: node.config().listen_addr.clone(),
            node,
            tasks: None,
        }
    }

    /// Report running tasks through `Status`.
    pub fn with_task_report(mut self, tasks: Arc<dyn TaskReport>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Bind the listener and serve in the background.
    ///
    /// Binding happens before this returns, so an unusable address is
    /// reported to the caller instead of being lost in a task.
    pub async fn start(self) -> ClusterResult<ServerHandle> {
        let addr: SocketAddr = self
            .listen_addr
            .parse()
            .map_err(|e| ClusterError::Config(format!("listen_addr: {}", e)))?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let context = Arc::new(ServerContext {
            key: ClusterKey::new(self.node.config().cluster_key.clone()),
            node: self.node,
            tasks: self.tasks,
        });
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        tracing::info!(node_id = context.node.node_id(), addr = %local_addr, "RPC server started");

        let task = tokio::spawn(async move {
            // Connections get the stop signal too: a peer's pooled keep-alive
            // connection must not keep reaching a node that has shut down.
            let (stop_tx, stop_rx) = watch::channel(false);
            let mut connections: JoinSet<()> = JoinSet::new();
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        let (stream, remote_addr) = match result {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                tracing::warn!(error = %e, "accept failed");
                                continue;
                            }
                        };
                        connections.spawn(serve_connection(
                            stream,
                            remote_addr,
                            Arc::clone(&context),
                            stop_rx.clone(),
                        ));
                    }
                    Some(_) = connections.join_next(), if !connections.is_empty() => {}
                    _ = &mut shutdown_rx => {
                        tracing::info!("RPC server shutting down");
                        break;
                    }
                }
            }

            drop(listener);
            let _ = stop_tx.send(true);
            let drained = tokio::time::timeout(CONNECTION_DRAIN, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                tracing::debug!(
                    remaining = connections.len(),
                    "aborting RPC connections that did not drain"
                );
                connections.shutdown().await;
            }
        });

        Ok(ServerHandle {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// Handle to a running [`RpcServer`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections, close the open ones and wait until they
    /// are gone.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    context: Arc<ServerContext>,
    mut stop: watch::Receiver<bool>,
) {
    let service = service_fn(move |req| {
        let context = Arc::clone(&context);
        async move { route(req, context).await }
    });
    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = stop.changed() => {
            // Finishes the request in flight, then closes.
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        if !e.is_incomplete_message() {
            tracing::debug!(remote = %remote_addr, error = %e, "RPC connection error");
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn route(
    req: Request<Incoming>,
    context: Arc<ServerContext>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let forward = match (method, path.as_str()) {
        (Method::POST, RPC_PATH) => false,
        (Method::POST, LEADER_RPC_PATH) => true,
        (_, path) => {
            tracing::debug!(path, "unknown RPC path");
            return Ok(reply(
                StatusCode::NOT_FOUND,
                &RpcReply::failure(&ClusterError::Network(format!("no route for {}", path))),
            ));
        }
    };

    let presented = req
        .headers()
        .get(CLUSTER_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !context.key.verify(presented) {
        tracing::warn!("rejected RPC with invalid cluster key");
        return Ok(error_reply(&ClusterError::Unauthorized));
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return Ok(error_reply(&ClusterError::Network(e.to_string()))),
    };

    let envelope: Envelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => return Ok(error_reply(&ClusterError::from(e))),
    };
    let kind = match envelope.message_type() {
        Ok(kind) => kind,
        Err(e) => {
            tracing::warn!(kind = %envelope.kind, "rejected message outside the allow-list");
            return Ok(error_reply(&e));
        }
    };

    let forward = forward && kind.is_leader_bound();
    match dispatch(&context, kind, envelope, forward).await {
        Ok(value) => Ok(reply(
            StatusCode::OK,
            &RpcReply {
                ok: true,
                value: Some(value),
                error: None,
            },
        )),
        Err(e) => {
            tracing::debug!(%kind, error = %e, "RPC failed");
            Ok(error_reply(&e))
        }
    }
}

async fn dispatch(
    context: &ServerContext,
    kind: MessageType,
    envelope: Envelope,
    forward: bool,
) -> ClusterResult<Value> {
    let node = &context.node;
    let value = match kind {
        MessageType::AppendEntries => {
            let req: AppendEntriesRequest<TypeConfig> = envelope.decode()?;
            serde_json::to_value(node.raft().append_entries(req).await?)?
        }
        MessageType::Vote => {
            let req: VoteRequest<ClusterNodeId> = envelope.decode()?;
            serde_json::to_value(node.raft().vote(req).await?)?
        }
        MessageType::InstallSnapshot => {
            let req: InstallSnapshotRequest<TypeConfig> = envelope.decode()?;
            serde_json::to_value(node.raft().install_snapshot(req).await?)?
        }
        MessageType::Propose => {
            let req: ClusterRequest = envelope.decode()?;
            let response = if forward {
                node.submit(req).await?
            } else {
                node.propose_local(req).await?
            };
            serde_json::to_value(response)?
        }
        MessageType::Join => {
            let req: JoinRequest = envelope.decode()?;
            serde_json::to_value(node.handle_join(req, forward).await?)?
        }
        MessageType::Leave => {
            let req: LeaveRequest = envelope.decode()?;
            node.handle_leave(req, forward).await?;
            Value::Null
        }
        MessageType::Probe => serde_json::to_value(node.probe_reply())?,
        MessageType::Status => {
            let mut status = node.status();
            if let Some(tasks) = &context.tasks {
                status.active_tasks = tasks.active_tasks();
            }
            serde_json::to_value(status)?
        }
    };
    Ok(value)
}

fn status_for(err: &ClusterError) -> StatusCode {
    match err {
        ClusterError::Unauthorized => StatusCode::UNAUTHORIZED,
        ClusterError::UnknownMessageType(_) | ClusterError::Serialization(_) => {
            StatusCode::BAD_REQUEST
        }
        ClusterError::Validation(_) | ClusterError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ClusterError::LeaderUnavailable | ClusterError::NotLeader { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ClusterError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_reply(err: &ClusterError) -> Response<Full<Bytes>> {
    reply(status_for(err), &RpcReply::failure(err))
}

fn reply(status: StatusCode, body: &RpcReply) -> Response<Full<Bytes>> {
    let json = serde_json::to_vec(body).unwrap_or_else(|e| {
        format!(
            r#"{{"ok":false,"error":{{"kind":"serialization","message":"{}"}}}}"#,
            e
        )
        .into_bytes()
    });
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses_follow_taxonomy() {
        assert_eq!(
            status_for(&ClusterError::UnknownMessageType("X".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&ClusterError::Unauthorized),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&ClusterError::NotLeader { leader: Some(1) }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&ClusterError::Validation("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn error_reply_body_is_wire_error() {
        let response = error_reply(&ClusterError::Unauthorized);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[hyper::header::CONTENT_TYPE],
            "application/json"
        );
    }
}
