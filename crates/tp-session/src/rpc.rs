//! Newline-delimited JSON-RPC 2.0 over any byte stream.
//!
//! One JSON object per line in each direction. Either side may send
//! requests; the connection routes responses to the waiting caller and
//! hands peer requests and notifications to an [`IncomingHandler`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{ProcessError, Result};

/// Standard JSON-RPC error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("method not found: {method}"),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }
}

/// Any frame the peer may send. Which fields are present decides whether it
/// is a request, a notification or a response.
#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

/// Serves what the peer asks of us.
#[async_trait]
pub trait IncomingHandler: Send + Sync + 'static {
    async fn handle_request(
        &self,
        method: &str,
        params: Value,
    ) -> std::result::Result<Value, JsonRpcError>;

    /// Notifications are delivered in arrival order.
    async fn handle_notification(&self, method: &str, params: Value);
}

type Reply = std::result::Result<Value, JsonRpcError>;
type PendingMap = Mutex<HashMap<u64, (String, oneshot::Sender<Reply>)>>;

// ---------------------------------------------------------------------------
// RpcConnection
// ---------------------------------------------------------------------------

pub struct RpcConnection {
    label: String,
    outgoing: flume::Sender<String>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcConnection {
    /// Start the reader and writer tasks for a byte stream pair.
    pub fn start<R, W>(
        label: impl Into<String>,
        reader: R,
        writer: W,
        handler: Arc<dyn IncomingHandler>,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let label = label.into();
        let (outgoing, outgoing_rx) = flume::unbounded::<String>();
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer_task = tokio::spawn(write_loop(label.clone(), writer, outgoing_rx));
        let reader_task = tokio::spawn(read_loop(
            label.clone(),
            reader,
            outgoing.clone(),
            Arc::clone(&pending),
            Arc::clone(&closed),
            handler,
        ));

        Arc::new(Self {
            label,
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            tasks: Mutex::new(vec![writer_task, reader_task]),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(ProcessError::ProcessExitedUnexpectedly(self.label.clone()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, (method.to_string(), tx));
        // The reader may have hit EOF between the check above and the insert.
        if self.is_closed() {
            lock(&self.pending).remove(&id);
            return Err(ProcessError::ProcessExitedUnexpectedly(self.label.clone()));
        }

        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if self.outgoing.send(frame.to_string()).is_err() {
            lock(&self.pending).remove(&id);
            return Err(ProcessError::ProcessExitedUnexpectedly(self.label.clone()));
        }
        debug!(connection = %self.label, id, method, "request sent");

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(ProcessError::Remote {
                method: method.to_string(),
                code: err.code,
                message: err.message,
            }),
            Err(_) => Err(ProcessError::ProcessExitedUnexpectedly(self.label.clone())),
        }
    }

    /// Fire-and-forget notification.
    pub fn notify(&self, method: &str, params: Value) -> Result<()> {
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.outgoing
            .send(frame.to_string())
            .map_err(|_| ProcessError::ProcessExitedUnexpectedly(self.label.clone()))
    }

    /// Stop both tasks and fail every in-flight request.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        fail_pending(&self.label, &self.pending);
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| {
        warn!("rpc lock was poisoned, recovering");
        e.into_inner()
    })
}

fn fail_pending(label: &str, pending: &PendingMap) {
    let drained: Vec<_> = lock(pending).drain().collect();
    if !drained.is_empty() {
        warn!(connection = label, count = drained.len(), "failing in-flight requests");
    }
    // Dropping the senders wakes every waiter with a closed-channel error.
    drop(drained);
}

async fn write_loop<W>(label: String, mut writer: W, rx: flume::Receiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Ok(line) = rx.recv_async().await {
        trace!(connection = %label, %line, "->");
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(connection = %label, error = %e, "write to agent failed");
            break;
        }
    }
}

async fn read_loop<R>(
    label: String,
    reader: R,
    outgoing: flume::Sender<String>,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
    handler: Arc<dyn IncomingHandler>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(connection = %label, error = %e, "read from agent failed");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        trace!(connection = %label, %line, "<-");
        if !line.starts_with('{') {
            debug!(connection = %label, %line, "skipping non-JSON line");
            continue;
        }
        let frame: Frame = match serde_json::from_str(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection = %label, error = %e, "malformed frame from agent");
                continue;
            }
        };

        match (frame.id, frame.method) {
            (Some(id), None) => {
                let Some(numeric) = id.as_u64() else {
                    warn!(connection = %label, %id, "response with unexpected id");
                    continue;
                };
                let waiter = lock(&pending).remove(&numeric);
                let Some((method, tx)) = waiter else {
                    debug!(connection = %label, id = numeric, "response for unknown request");
                    continue;
                };
                let reply = match frame.error {
                    Some(err) => Err(err),
                    None => Ok(frame.result.unwrap_or(Value::Null)),
                };
                debug!(connection = %label, id = numeric, %method, ok = reply.is_ok(), "response received");
                let _ = tx.send(reply);
            }
            (Some(id), Some(method)) => {
                let handler = Arc::clone(&handler);
                let outgoing = outgoing.clone();
                let params = frame.params.unwrap_or(Value::Null);
                // Served concurrently so a slow request (waiting on a
                // terminal) never stalls the read loop.
                tokio::spawn(async move {
                    let response = match handler.handle_request(&method, params).await {
                        Ok(result) => serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result}),
                        Err(err) => serde_json::json!({"jsonrpc": "2.0", "id": id, "error": err}),
                    };
                    let _ = outgoing.send(response.to_string());
                });
            }
            (None, Some(method)) => {
                handler
                    .handle_notification(&method, frame.params.unwrap_or(Value::Null))
                    .await;
            }
            (None, None) => {
                debug!(connection = %label, "ignoring frame without id or method");
            }
        }
    }

    debug!(connection = %label, "agent stream closed");
    closed.store(true, Ordering::SeqCst);
    fail_pending(&label, &pending);
}
