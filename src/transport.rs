//! Inspector Transport (C2, §4.2).
//!
//! The CDP wire client: a single task owns the WebSocket, assigns
//! monotonically increasing request ids, correlates responses back to
//! callers through one-shot channels, and fans events out to subscribers.
//!
//! The correlator shape (a control-message enum carrying a `oneshot`
//! responder, drained by a `tokio::select!` loop that also reads the
//! socket) is the same one this codebase's other CDP-adjacent clients use
//! for request/response bookkeeping — here it talks directly to the wire
//! instead of delegating to a browser-automation library, since correlating
//! CDP requests and responses is the behavior this crate exists to provide.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, trace, warn};

use crate::error::{KernelError, Result};

/// A specific or wildcard event handler. Held behind `Arc` so registration
/// is cheap to clone into the dispatch loop.
pub type EventHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

enum Control {
    Send {
        method: String,
        params: Value,
        responder: oneshot::Sender<Result<Value>>,
    },
    Disconnect,
}

struct PendingSlot {
    responder: oneshot::Sender<Result<Value>>,
}

/// Handle to a live CDP connection. Cloning shares the same underlying
/// socket task; the last clone to drop does not close the connection —
/// call [`InspectorTransport::disconnect`] explicitly.
#[derive(Clone)]
pub struct InspectorTransport {
    control_tx: mpsc::UnboundedSender<Control>,
    connected: Arc<AtomicBool>,
    handlers: Arc<Mutex<HashMap<String, Vec<EventHandler>>>>,
    any_handlers: Arc<Mutex<Vec<EventHandler>>>,
    default_deadline: Duration,
    loop_task: Arc<JoinHandle<()>>,
}

impl InspectorTransport {
    /// Connect to `url` and start the reader/correlator task.
    pub async fn connect(url: &str, default_deadline: Duration) -> Result<Self> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|err| KernelError::LaunchFailed {
                reason: format!("websocket connect failed: {err}"),
                exit_code: None,
            })?;

        let (control_tx, control_rx) = mpsc::unbounded_channel::<Control>();
        let connected = Arc::new(AtomicBool::new(true));
        let handlers: Arc<Mutex<HashMap<String, Vec<EventHandler>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let any_handlers: Arc<Mutex<Vec<EventHandler>>> = Arc::new(Mutex::new(Vec::new()));

        let loop_connected = connected.clone();
        let loop_handlers = handlers.clone();
        let loop_any_handlers = any_handlers.clone();
        let loop_task = tokio::spawn(async move {
            run_loop(
                ws_stream,
                control_rx,
                loop_handlers,
                loop_any_handlers,
            )
            .await;
            loop_connected.store(false, Ordering::SeqCst);
        });

        Ok(Self {
            control_tx,
            connected,
            handlers,
            any_handlers,
            default_deadline,
            loop_task: Arc::new(loop_task),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Issue a CDP request and await its response, or `deadline` (falling
    /// back to the transport's configured default).
    pub async fn send(
        &self,
        method: &str,
        params: Value,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        if !self.is_connected() {
            return Err(KernelError::NotConnected);
        }

        let (responder, response_rx) = oneshot::channel();
        let control = Control::Send {
            method: method.to_string(),
            params,
            responder,
        };

        self.control_tx
            .send(control)
            .map_err(|_| KernelError::NotConnected)?;

        let wait = deadline.unwrap_or(self.default_deadline);
        match tokio::time::timeout(wait, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(KernelError::Disconnected),
            Err(_) => Err(KernelError::Timeout),
        }
    }

    /// Subscribe to events of exactly `method`. Handlers for one method are
    /// invoked in wire order; a panicking handler is caught and logged, not
    /// allowed to halt dispatch (§7 propagation policy).
    pub async fn on(&self, method: impl Into<String>, handler: EventHandler) {
        let mut guard = self.handlers.lock().await;
        guard.entry(method.into()).or_default().push(handler);
    }

    /// Subscribe to every event, regardless of method.
    pub async fn on_any(&self, handler: EventHandler) {
        self.any_handlers.lock().await.push(handler);
    }

    /// Close the socket. All outstanding `send`s resolve to `Disconnected`;
    /// subsequent `send`s fail immediately with `NotConnected`.
    pub async fn disconnect(&self) {
        if !self.is_connected() {
            return;
        }
        let _ = self.control_tx.send(Control::Disconnect);
        // Best-effort: give the loop task a moment to drain pending requests
        // and tear down, but don't block forever on a wedged task.
        let _ = tokio::time::timeout(Duration::from_secs(2), wait_for_task(&self.loop_task)).await;
        self.connected.store(false, Ordering::SeqCst);
    }
}

async fn wait_for_task(task: &JoinHandle<()>) {
    // JoinHandle isn't directly awaitable through a shared reference, so we
    // just poll is_finished; the loop task itself flips `connected` as soon
    // as it exits, which is what callers actually depend on.
    while !task.is_finished() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn run_loop(
    mut ws: WsStream,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    handlers: Arc<Mutex<HashMap<String, Vec<EventHandler>>>>,
    any_handlers: Arc<Mutex<Vec<EventHandler>>>,
) {
    let next_id = AtomicU64::new(1);
    let mut pending: HashMap<u64, PendingSlot> = HashMap::new();

    loop {
        tokio::select! {
            control = control_rx.recv() => {
                match control {
                    Some(Control::Send { method, params, responder }) => {
                        let id = next_id.fetch_add(1, Ordering::SeqCst);
                        let frame = serde_json::json!({
                            "id": id,
                            "method": method,
                            "params": params,
                        });
                        match ws.send(WsMessage::Text(frame.to_string())).await {
                            Ok(()) => {
                                pending.insert(id, PendingSlot { responder });
                            }
                            Err(err) => {
                                let _ = responder.send(Err(KernelError::Disconnected));
                                warn!(%err, "failed to write cdp request");
                                break;
                            }
                        }
                    }
                    Some(Control::Disconnect) => {
                        let _ = ws.close(None).await;
                        break;
                    }
                    None => break,
                }
            }
            message = ws.next() => {
                match message {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_incoming(&text, &mut pending, &handlers, &any_handlers).await;
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = ws.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!("cdp websocket closed");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary/Pong frames carry no CDP payload; ignore.
                    }
                    Some(Err(err)) => {
                        warn!(%err, "cdp websocket error");
                        break;
                    }
                }
            }
        }
    }

    for (_, slot) in pending.drain() {
        let _ = slot.responder.send(Err(KernelError::Disconnected));
    }
}

async fn handle_incoming(
    text: &str,
    pending: &mut HashMap<u64, PendingSlot>,
    handlers: &Arc<Mutex<HashMap<String, Vec<EventHandler>>>>,
    any_handlers: &Arc<Mutex<Vec<EventHandler>>>,
) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(err) => {
            warn!(%err, "failed to parse cdp message");
            return;
        }
    };

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let Some(slot) = pending.remove(&id) else {
            trace!(id, "response for unknown/expired request id");
            return;
        };
        let result = if let Some(error) = value.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown cdp error")
                .to_string();
            Err(KernelError::CdpError { code, message })
        } else {
            Ok(value.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = slot.responder.send(result);
        return;
    }

    let method = match value.get("method").and_then(Value::as_str) {
        Some(m) => m.to_string(),
        None => return,
    };
    let params = value.get("params").cloned().unwrap_or(Value::Null);

    dispatch_event(&method, &params, handlers, any_handlers).await;
}

async fn dispatch_event(
    method: &str,
    params: &Value,
    handlers: &Arc<Mutex<HashMap<String, Vec<EventHandler>>>>,
    any_handlers: &Arc<Mutex<Vec<EventHandler>>>,
) {
    let specific: Vec<EventHandler> = {
        let guard = handlers.lock().await;
        guard.get(method).cloned().unwrap_or_default()
    };
    for handler in &specific {
        invoke_isolated(handler, method, params);
    }

    let generic: Vec<EventHandler> = any_handlers.lock().await.clone();
    for handler in &generic {
        invoke_isolated(handler, method, params);
    }
}

fn invoke_isolated(handler: &EventHandler, method: &str, params: &Value) {
    let handler = handler.clone();
    let method_owned = method.to_string();
    let params_owned = params.clone();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        handler(&method_owned, &params_owned);
    }));
    if let Err(_panic) = result {
        warn!(method = %method, "cdp event handler panicked; dispatch continues");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Minimal CDP-shaped echo server used to exercise the correlator
    /// end-to-end without a real JS runtime.
    async fn start_mock_server() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(WsMessage::Text(text))) = ws.next().await {
                let req: Value = serde_json::from_str(&text).unwrap();
                if req.get("method").and_then(Value::as_str) == Some("Emit.Event") {
                    let evt = serde_json::json!({"method": "Debugger.resumed", "params": {}});
                    ws.send(WsMessage::Text(evt.to_string())).await.unwrap();
                    continue;
                }
                let id = req["id"].clone();
                let resp = serde_json::json!({"id": id, "result": {"echo": req["method"]}});
                ws.send(WsMessage::Text(resp.to_string())).await.unwrap();
            }
        });
        (format!("ws://{addr}"), handle)
    }

    #[tokio::test]
    async fn send_receives_correlated_response() {
        let (url, _server) = start_mock_server().await;
        let transport = InspectorTransport::connect(&url, Duration::from_secs(2))
            .await
            .unwrap();
        let result = transport
            .send("Debugger.enable", serde_json::json!({}), None)
            .await
            .unwrap();
        assert_eq!(result["echo"], "Debugger.enable");
    }

    #[tokio::test]
    async fn concurrent_sends_are_each_correlated_to_their_own_response() {
        let (url, _server) = start_mock_server().await;
        let transport = InspectorTransport::connect(&url, Duration::from_secs(2))
            .await
            .unwrap();
        let a = transport.send("Method.A", serde_json::json!({}), None);
        let b = transport.send("Method.B", serde_json::json!({}), None);
        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra.unwrap()["echo"], "Method.A");
        assert_eq!(rb.unwrap()["echo"], "Method.B");
    }

    #[tokio::test]
    async fn on_any_sees_events_in_wire_order() {
        let (url, _server) = start_mock_server().await;
        let transport = InspectorTransport::connect(&url, Duration::from_secs(2))
            .await
            .unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        transport
            .on_any(Arc::new(move |method: &str, _params: &Value| {
                if method == "Debugger.resumed" {
                    seen_clone.fetch_add(1, Ordering::SeqCst);
                }
            }))
            .await;
        transport
            .send("Emit.Event", serde_json::json!({}), None)
            .await
            .unwrap();
        // Give the event a moment to dispatch after the (unrelated) response.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnect_fails_subsequent_sends_with_not_connected() {
        let (url, _server) = start_mock_server().await;
        let transport = InspectorTransport::connect(&url, Duration::from_secs(2))
            .await
            .unwrap();
        transport.disconnect().await;
        let err = transport
            .send("Debugger.enable", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::NotConnected));
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_dispatch_to_others() {
        let (url, _server) = start_mock_server().await;
        let transport = InspectorTransport::connect(&url, Duration::from_secs(2))
            .await
            .unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        transport
            .on_any(Arc::new(|_method: &str, _params: &Value| {
                panic!("boom");
            }))
            .await;
        let seen_clone = seen.clone();
        transport
            .on_any(Arc::new(move |_method: &str, _params: &Value| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .await;
        transport
            .send("Emit.Event", serde_json::json!({}), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
