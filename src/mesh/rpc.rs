//! Inter-node RPC: newline-delimited JSON over TCP, cookie-authenticated.
//!
//! One request per connection. The server checks the shared cookie before
//! dispatching; the client maps transport failures onto the dispatch
//! taxonomy (node-not-connected, timeout, rpc-failed).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::error::Result;
use crate::events::Event;
use crate::exec::TaskOutcome;
use crate::graph::Task;

use super::NodeProfile;

/// Client-side timeout for connect plus one round trip.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for a dispatched remote task (driver timeouts apply on top).
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(3600);

/// Operations a node answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Capabilities,
    RunTask { task: Box<Task> },
    ForwardEvent { event: Box<Event> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    cookie: String,
    #[serde(flatten)]
    request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Response {
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

/// How a dispatch failed, per the mesh error mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// TCP connect failed: the node is not reachable.
    NodeNotConnected(String),
    Timeout,
    RpcFailed(String),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::NodeNotConnected(node) => write!(f, "node '{}' not connected", node),
            DispatchError::Timeout => write!(f, "rpc timed out"),
            DispatchError::RpcFailed(reason) => write!(f, "rpc failed: {}", reason),
        }
    }
}

impl std::error::Error for DispatchError {}

// ============================================================================
// SERVER
// ============================================================================

/// What the daemon plugs into the RPC server.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn capabilities(&self) -> NodeProfile;
    /// Stateless "run one task" entry point.
    async fn run_task(&self, task: Task) -> std::result::Result<TaskOutcome, String>;
    async fn ingest_event(&self, event: Event);
}

/// Accept loop; one spawned task per connection.
pub async fn serve(listener: TcpListener, cookie: String, handler: Arc<dyn RpcHandler>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "rpc connection");
                let cookie = cookie.clone();
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &cookie, handler).await {
                        warn!(%peer, "rpc connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("rpc accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    cookie: &str,
    handler: Arc<dyn RpcHandler>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let Some(line) = lines.next_line().await? else {
        return Ok(());
    };

    let response = match serde_json::from_str::<Envelope>(&line) {
        Err(e) => Response {
            ok: false,
            error: Some(format!("malformed request: {}", e)),
            data: serde_json::Value::Null,
        },
        Ok(envelope) if envelope.cookie != cookie => Response {
            ok: false,
            error: Some("authentication failed: cookie mismatch".to_string()),
            data: serde_json::Value::Null,
        },
        Ok(envelope) => dispatch(envelope.request, handler).await,
    };

    let mut payload = serde_json::to_vec(&response)?;
    payload.push(b'\n');
    write_half.write_all(&payload).await?;
    Ok(())
}

async fn dispatch(request: Request, handler: Arc<dyn RpcHandler>) -> Response {
    match request {
        Request::Ping => Response {
            ok: true,
            error: None,
            data: serde_json::json!("pong"),
        },
        Request::Capabilities => Response {
            ok: true,
            error: None,
            data: serde_json::to_value(handler.capabilities().await).unwrap_or_default(),
        },
        Request::RunTask { task } => match handler.run_task(*task).await {
            Ok(outcome) => Response {
                ok: true,
                error: None,
                data: serde_json::to_value(outcome).unwrap_or_default(),
            },
            Err(reason) => Response {
                ok: false,
                error: Some(reason),
                data: serde_json::Value::Null,
            },
        },
        Request::ForwardEvent { event } => {
            handler.ingest_event(*event).await;
            Response {
                ok: true,
                error: None,
                data: serde_json::Value::Null,
            }
        }
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// Handle on one remote node.
#[derive(Debug, Clone)]
pub struct RpcClient {
    pub node: String,
    pub addr: String,
    pub cookie: String,
}

impl RpcClient {
    pub fn new(node: &str, addr: &str, cookie: &str) -> Self {
        Self {
            node: node.to_string(),
            addr: addr.to_string(),
            cookie: cookie.to_string(),
        }
    }

    pub async fn ping(&self) -> std::result::Result<(), DispatchError> {
        self.call(Request::Ping, RPC_TIMEOUT).await.map(|_| ())
    }

    pub async fn capabilities(&self) -> std::result::Result<NodeProfile, DispatchError> {
        let data = self.call(Request::Capabilities, RPC_TIMEOUT).await?;
        serde_json::from_value(data).map_err(|e| DispatchError::RpcFailed(e.to_string()))
    }

    /// Dispatch one task and wait for its outcome.
    pub async fn run_task(&self, task: &Task) -> std::result::Result<TaskOutcome, DispatchError> {
        let data = self
            .call(
                Request::RunTask {
                    task: Box::new(task.clone()),
                },
                DISPATCH_TIMEOUT,
            )
            .await?;
        serde_json::from_value(data).map_err(|e| DispatchError::RpcFailed(e.to_string()))
    }

    pub async fn forward_event(&self, event: &Event) -> std::result::Result<(), DispatchError> {
        self.call(
            Request::ForwardEvent {
                event: Box::new(event.clone()),
            },
            RPC_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    async fn call(
        &self,
        request: Request,
        timeout: Duration,
    ) -> std::result::Result<serde_json::Value, DispatchError> {
        let attempt = async {
            let mut stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|_| DispatchError::NodeNotConnected(self.node.clone()))?;

            let envelope = Envelope {
                cookie: self.cookie.clone(),
                request,
            };
            let mut payload = serde_json::to_vec(&envelope)
                .map_err(|e| DispatchError::RpcFailed(e.to_string()))?;
            payload.push(b'\n');
            stream
                .write_all(&payload)
                .await
                .map_err(|e| DispatchError::RpcFailed(e.to_string()))?;

            let mut lines = BufReader::new(stream).lines();
            let line = lines
                .next_line()
                .await
                .map_err(|e| DispatchError::RpcFailed(e.to_string()))?
                .ok_or_else(|| DispatchError::RpcFailed("connection closed".to_string()))?;

            let response: Response = serde_json::from_str(&line)
                .map_err(|e| DispatchError::RpcFailed(e.to_string()))?;
            if response.ok {
                Ok(response.data)
            } else {
                Err(DispatchError::RpcFailed(
                    response.error.unwrap_or_else(|| "unknown error".to_string()),
                ))
            }
        };

        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| DispatchError::Timeout)?
    }
}
