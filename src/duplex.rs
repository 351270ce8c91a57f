//! Duplex channel to a cooperating mail-client extension.
//!
//! When neither a local Thunderbird profile nor a direct IMAP login is
//! available (or the user asks for it explicitly), mailmap talks to a
//! small extension living inside the user's mail client over a plain
//! JSON protocol carried on a WebSocket. The server binds loopback-only
//! and accepts exactly one assumption: whichever client connects first
//! is the one the pipeline will route through. There is no header-level
//! auth handshake; the shared token is carried inside request bodies
//! and checked by the client, not by us.
//!
//! Three message shapes share the wire, disambiguated by which keys are
//! present: a `Request` (we send these, the client answers), a
//! `Response` (the client's answer to one of our requests), and a
//! `ServerEvent` (we push these, fire-and-forget, no reply expected).
//! The server additionally answers a small fixed set of requests the
//! client can send *to* us (`ping`, `getFolders`, `getClassifications`,
//! `getStats`) without needing a round trip to the client at all.

use crate::categories::{category_descriptions, load_categories};
use crate::error::{Error, Result};
use crate::store::Store;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

/// Default time to wait for a client to answer a server-initiated request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A request we send to the connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub action: String,
    pub params: Value,
    /// Carried verbatim; the client validates it, we don't.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// The client's answer to one of our requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMsg {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A fire-and-forget notification we push to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEvent {
    pub event: String,
    pub data: Value,
}

/// A decoded inbound message, shape-detected by which keys are present.
enum Inbound {
    /// The client is asking us something (`action` present).
    Request { id: Option<String>, action: String, params: Value },
    /// The client is answering one of our requests (`ok` present).
    Response(ResponseMsg),
}

fn decode_inbound(text: &str) -> Option<Inbound> {
    let value: Value = serde_json::from_str(text).ok()?;
    let obj = value.as_object()?;
    if obj.contains_key("ok") {
        let resp: ResponseMsg = serde_json::from_value(value).ok()?;
        return Some(Inbound::Response(resp));
    }
    if let Some(action) = obj.get("action").and_then(Value::as_str) {
        let id = obj.get("id").and_then(Value::as_str).map(str::to_string);
        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        return Some(Inbound::Request {
            id,
            action: action.to_string(),
            params,
        });
    }
    None
}

struct Inner {
    clients: Mutex<HashMap<String, mpsc::UnboundedSender<WsMessage>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<ResponseMsg>>>,
    store: Arc<Store>,
    categories_path: PathBuf,
    request_timeout: Duration,
}

/// A running duplex server. Cheaply cloneable; every clone shares the
/// same client table and pending-request table.
#[derive(Clone)]
pub struct DuplexServer {
    inner: Arc<Inner>,
}

impl DuplexServer {
    /// Bind a loopback listener and start accepting connections in the
    /// background.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn bind(
        host: &str,
        port: u16,
        store: Arc<Store>,
        categories_path: PathBuf,
    ) -> Result<Self> {
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| Error::Duplex(format!("invalid bind address: {e}")))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Duplex(format!("bind failed: {e}")))?;
        info!("Duplex server listening on {}", addr);

        let server = Self {
            inner: Arc::new(Inner {
                clients: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                store,
                categories_path,
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
            }),
        };

        let accept_server = server.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let server = accept_server.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer).await {
                                warn!("duplex connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("duplex accept failed: {}", e);
                    }
                }
            }
        });

        Ok(server)
    }

    /// Number of clients currently connected.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    /// Whether at least one client is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.client_count() > 0
    }

    async fn handle_connection(
        &self,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
    ) -> Result<()> {
        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| Error::Duplex(format!("websocket handshake failed: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        let client_id = uuid::Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        self.inner.clients.lock().insert(client_id.clone(), tx);
        debug!("duplex client {} connected from {}", client_id, peer);

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        self.broadcast_event(
            "connected",
            json!({ "clientId": client_id }),
        );

        while let Some(msg) = read.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    warn!("duplex read error from {}: {}", client_id, e);
                    break;
                }
            };
            let WsMessage::Text(text) = msg else {
                continue;
            };
            self.dispatch_inbound(&client_id, &text).await;
        }

        self.inner.clients.lock().remove(&client_id);
        writer_task.abort();
        debug!("duplex client {} disconnected", client_id);
        Ok(())
    }

    async fn dispatch_inbound(&self, client_id: &str, text: &str) {
        match decode_inbound(text) {
            Some(Inbound::Response(resp)) => {
                if let Some(sender) = self.inner.pending.lock().remove(&resp.id) {
                    let _ = sender.send(resp);
                } else {
                    warn!("duplex response for unknown request id {}", resp.id);
                }
            }
            Some(Inbound::Request { id, action, params }) => {
                let result = self.handle_inbound_request(&action, &params);
                if let Some(id) = id {
                    let (ok, result, error) = match result {
                        Ok(v) => (true, Some(v), None),
                        Err(e) => (false, None, Some(e.to_string())),
                    };
                    let response = ResponseMsg { id, ok, result, error };
                    self.send_to(client_id, &response);
                }
            }
            None => {
                warn!("duplex client {} sent an unrecognized message", client_id);
            }
        }
    }

    /// The small set of queries the server answers directly, without a
    /// round trip through the pipeline.
    fn handle_inbound_request(&self, action: &str, _params: &Value) -> Result<Value> {
        match action {
            "ping" => Ok(json!({ "pong": true })),
            "getFolders" => {
                let categories = load_categories(&self.inner.categories_path)?;
                let names: Vec<&str> = categories.iter().map(|c| c.name.as_str()).collect();
                Ok(json!({ "folders": names }))
            }
            "getClassifications" => {
                let counts = self.inner.store.counts_by_category()?;
                Ok(json!({ "counts": counts }))
            }
            "getStats" => {
                let counts = self.inner.store.counts_by_category()?;
                let total: i64 = counts.iter().map(|(_, n)| n).sum();
                Ok(json!({ "total": total, "byCategory": counts }))
            }
            other => Err(Error::NotSupported("unknown inbound duplex action")).map_err(|e| {
                warn!("unsupported inbound duplex action: {}", other);
                e
            }),
        }
    }

    fn send_to<T: Serialize>(&self, client_id: &str, message: &T) {
        let Ok(text) = serde_json::to_string(message) else {
            return;
        };
        if let Some(sender) = self.inner.clients.lock().get(client_id) {
            let _ = sender.send(WsMessage::Text(text.into()));
        }
    }

    /// Broadcast a fire-and-forget event to every connected client.
    pub fn broadcast_event(&self, event: &str, data: Value) {
        let message = ServerEvent {
            event: event.to_string(),
            data,
        };
        let Ok(text) = serde_json::to_string(&message) else {
            return;
        };
        for sender in self.inner.clients.lock().values() {
            let _ = sender.send(WsMessage::Text(text.clone().into()));
        }
    }

    /// Send a request to whichever client is connected and await its
    /// answer, or `None` if nobody is connected or the client doesn't
    /// answer within the timeout.
    ///
    /// # Errors
    ///
    /// Returns an error only if serializing the request fails.
    pub async fn send_request(
        &self,
        action: &str,
        params: Value,
        token: Option<String>,
    ) -> Result<Option<ResponseMsg>> {
        let client_id = {
            let clients = self.inner.clients.lock();
            match clients.keys().next() {
                Some(id) => id.clone(),
                None => {
                    warn!("duplex send_request({}) with no client connected", action);
                    return Ok(None);
                }
            }
        };

        let id = uuid::Uuid::new_v4().to_string();
        let request = Request {
            id: id.clone(),
            action: action.to_string(),
            params,
            token,
        };

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id.clone(), tx);
        self.send_to(&client_id, &request);

        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(Some(response)),
            Ok(Err(_)) => {
                self.inner.pending.lock().remove(&id);
                Ok(None)
            }
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                warn!("duplex request {} ({}) timed out", id, action);
                Ok(None)
            }
        }
    }
}
