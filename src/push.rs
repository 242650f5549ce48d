//! Outbound push client for Subscribers (spec.md §4.6, §6 push channel;
//! header-passing supplemented feature in `SPEC_FULL.md`).
//!
//! Grounded in `services/forwarder/src/uplink.rs`'s `UplinkSession`:
//! `connect_async` plus a hand-built request with an optional
//! `Authorization` header, then `SinkExt::send`/`StreamExt::next` over a
//! `tokio_tungstenite::WebSocketStream`. The push channel here is
//! one-directional (server → subscriber); each event is `(event_name,
//! json_payload)` (spec.md §6), sent as `{"event": ..., "payload": ...}`.

use crate::broker::{Emit, EmitFuture};
use crate::store::Point;
use futures_util::SinkExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::warn;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct WsSubscriber {
    ws: Arc<Mutex<WsStream>>,
}

/// Send one `{"event": ..., "payload": ...}` envelope over an owned
/// handle, used directly and as the body of the boxed futures `Emit`
/// returns (which must not borrow from `&self`).
async fn send_event(
    ws: Arc<Mutex<WsStream>>,
    event: &'static str,
    payload: serde_json::Value,
) -> Result<(), ()> {
    let envelope = serde_json::json!({ "event": event, "payload": payload });
    let text = serde_json::to_string(&envelope).map_err(|_| ())?;
    let mut ws = ws.lock().await;
    ws.send(Message::Text(text.into())).await.map_err(|err| {
        warn!(error = %err, "push subscriber send failed");
    })
}

impl WsSubscriber {
    /// Connect to `url`, attaching `auth_header` verbatim as the
    /// `Authorization` header when present. Never validated or
    /// refreshed here (SPEC_FULL.md).
    pub async fn connect(url: &str, auth_header: Option<&str>) -> Result<Self, String> {
        let mut request = url
            .into_client_request()
            .map_err(|e| format!("invalid push subscriber url '{url}': {e}"))?;
        if let Some(header) = auth_header {
            let value = header
                .parse()
                .map_err(|e| format!("invalid auth header: {e}"))?;
            request.headers_mut().insert("Authorization", value);
        }
        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| format!("connect failed: {e}"))?;
        Ok(WsSubscriber {
            ws: Arc::new(Mutex::new(ws)),
        })
    }

    /// Send the `config` event (full schema snapshot) sent on connect to
    /// car/emulation namespaces (spec.md §6). Called by
    /// `controller::connect_subscribers` right after `connect` succeeds,
    /// for those namespaces only.
    pub async fn emit_config(&self, schema_snapshot: serde_json::Value) -> Result<(), ()> {
        send_event(self.ws.clone(), "config", schema_snapshot).await
    }
}

fn batch_to_json(batch: &HashMap<String, Vec<Point>>) -> serde_json::Value {
    batch
        .iter()
        .map(|(sensor, points)| {
            let samples: Vec<_> = points
                .iter()
                .map(|p| serde_json::json!({ "epoch": p.time, "value": p.value }))
                .collect();
            (sensor.clone(), serde_json::Value::Array(samples))
        })
        .collect()
}

impl Emit for WsSubscriber {
    fn emit_meta(&self, meta: serde_json::Value) -> EmitFuture {
        Box::pin(send_event(self.ws.clone(), "meta", meta))
    }

    fn emit_data(&self, batch: HashMap<String, Vec<Point>>) -> EmitFuture {
        let payload = batch_to_json(&batch);
        Box::pin(send_event(self.ws.clone(), "data", payload))
    }
}
