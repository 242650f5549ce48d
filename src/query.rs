//! Query Server (spec.md C7, §4.7).
//!
//! `examples/original_source/src/restful.py` shows the original hosts
//! this over a `websockets.serve` socket, not plain HTTP, with requests
//! parsed by hand from a `"GET /path?key=val"` line. The rewrite keeps
//! that shape: an axum websocket handler (grounded in
//! `services/server/src/ws_forwarder.rs`'s `tokio::select!` loop) that
//! receives one text request per message and replies with the JSON
//! envelope spec.md §4.7 defines, status embedded in the body the way
//! `services/server/src/http/response.rs`'s helpers embed it in a real
//! HTTP response.

use crate::error::QueryError;
use crate::schema::Schema;
use crate::store::{Point, Store};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
enum Route {
    AllSensors,
    Group(String),
    MetaSensors,
}

#[derive(Debug, Clone, PartialEq)]
struct Request {
    route: Route,
    amount: Option<u32>,
    timesince: Option<f64>,
}

/// Parse a request line of the form `GET /path?key=val&key2=val2`
/// (spec.md §4.7).
fn parse_request(line: &str) -> Result<Request, QueryError> {
    let line = line.trim();
    let mut parts = line.splitn(2, ' ');
    let verb = parts
        .next()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| QueryError::Malformed("empty request".to_owned()))?;
    if verb != "GET" {
        return Err(QueryError::UnknownVerb(verb.to_owned()));
    }
    let rest = parts
        .next()
        .ok_or_else(|| QueryError::Malformed("missing path".to_owned()))?
        .trim();

    let mut path_and_query = rest.splitn(2, '?');
    let path = path_and_query.next().unwrap_or("");
    let query_string = path_and_query.next().unwrap_or("");

    let route = match path {
        "/sensors" => Route::AllSensors,
        "/meta/sensors" => Route::MetaSensors,
        other => other
            .strip_prefix("/sensors/")
            .filter(|group| !group.is_empty())
            .map(|group| Route::Group(group.to_owned()))
            .ok_or_else(|| QueryError::UnknownRoute(path.to_owned()))?,
    };

    let mut amount = None;
    let mut timesince = None;
    if !query_string.is_empty() {
        for pair in query_string.split('&') {
            let mut kv = pair.splitn(2, '=');
            let key = kv.next().unwrap_or("");
            let val = kv
                .next()
                .ok_or_else(|| QueryError::Malformed(format!("malformed filter `{pair}`")))?;
            match key {
                "amount" => {
                    amount = Some(val.parse::<u32>().map_err(|_| {
                        QueryError::Malformed(format!("`amount` must be a positive integer, got `{val}`"))
                    })?);
                }
                "timesince" => {
                    timesince = Some(val.parse::<f64>().map_err(|_| {
                        QueryError::Malformed(format!("`timesince` must be a number, got `{val}`"))
                    })?);
                }
                other => {
                    return Err(QueryError::Malformed(format!("unknown filter key `{other}`")));
                }
            }
        }
    }

    Ok(Request {
        route,
        amount,
        timesince,
    })
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs_f64()
}

/// Run the configured store query for one sensor per spec.md §4.7's
/// filter table, normalising to oldest-first.
fn query_sensor(store: &Store, name: &str, req: &Request) -> Result<Vec<Point>, QueryError> {
    let now = now_epoch();
    let points = match (req.amount, req.timesince) {
        (None, None) => Vec::new(),
        (Some(n), None) => {
            let mut pts = store
                .top_n(name, n)
                .map_err(|e| QueryError::Internal(e.to_string()))?;
            pts.reverse();
            pts
        }
        (None, Some(t)) => store
            .range(name, t, now)
            .map_err(|e| QueryError::Internal(e.to_string()))?,
        (Some(n), Some(t)) => {
            let mut pts = store
                .top_n_in_range(name, n, t, now)
                .map_err(|e| QueryError::Internal(e.to_string()))?;
            pts.reverse();
            pts
        }
    };
    Ok(points)
}

fn points_to_json(points: &[Point]) -> Value {
    points
        .iter()
        .map(|p| json!({ "time": p.time, "value": p.value }))
        .collect()
}

/// Build the full JSON envelope for one parsed request (spec.md §4.7).
pub fn handle_request(schema: &Schema, store: &Store, line: &str) -> Value {
    match parse_request(line).and_then(|req| build_response(schema, store, &req)) {
        Ok(body) => body,
        Err(err) => error_envelope(&err),
    }
}

fn error_envelope(err: &QueryError) -> Value {
    json!({ "status": err.status(), "epoch": 0.0, "error": err.to_string() })
}

/// Grouped sensor-metadata snapshot shared by the `/meta/sensors` route and
/// the Broker's one-shot announcement to newly connected Subscribers
/// (spec.md §4.6, §4.7).
pub fn sensor_meta_json(schema: &Schema) -> Value {
    let mut grouped: HashMap<String, Value> = HashMap::new();
    for (name, meta) in schema.iter_sensors() {
        if !meta.enable {
            continue;
        }
        let group_entry = grouped
            .entry(meta.group.clone())
            .or_insert_with(|| json!({}));
        group_entry[name] = json!({
            "group": meta.group,
            "min": meta.min,
            "max": meta.max,
            "on_dash": meta.on_dash,
            "enable": meta.enable,
        });
    }
    json!(grouped)
}

fn group_exists(schema: &Schema, group: &str) -> bool {
    schema
        .iter_sensors()
        .any(|(_, meta)| meta.enable && meta.group == group)
}

fn build_response(schema: &Schema, store: &Store, req: &Request) -> Result<Value, QueryError> {
    match &req.route {
        Route::MetaSensors => Ok(json!({ "status": 200, "epoch": 0.0, "result": sensor_meta_json(schema) })),
        Route::AllSensors => build_sensor_result(schema, store, req, None),
        Route::Group(group) => {
            if !group_exists(schema, group) {
                return Err(QueryError::UnknownGroup(group.clone()));
            }
            build_sensor_result(schema, store, req, Some(group.as_str()))
        }
    }
}

fn build_sensor_result(
    schema: &Schema,
    store: &Store,
    req: &Request,
    group_filter: Option<&str>,
) -> Result<Value, QueryError> {
    let mut result: HashMap<String, HashMap<String, Value>> = HashMap::new();
    let mut max_epoch = 0.0f64;

    for (name, meta) in schema.iter_sensors() {
        if !meta.enable {
            continue;
        }
        if let Some(group) = group_filter {
            if meta.group != group {
                continue;
            }
        }
        let points = query_sensor(store, name, req)?;
        if let Some(last) = points.last() {
            max_epoch = max_epoch.max(last.time);
        }
        result
            .entry(meta.group.clone())
            .or_default()
            .insert(name.to_owned(), points_to_json(&points));
    }

    Ok(json!({ "status": 200, "epoch": max_epoch, "result": result }))
}

/// Shared handle the Controller wires into the axum router.
#[derive(Clone)]
pub struct QueryState {
    pub schema: Arc<Schema>,
    pub store: Arc<Store>,
    pub keep_alive: bool,
}

pub async fn query_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<QueryState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: QueryState) {
    loop {
        let msg = match socket.recv().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => {
                info!("query client disconnected");
                return;
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = socket.send(Message::Pong(data)).await;
                continue;
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                warn!(error = %err, "query websocket error");
                return;
            }
        };

        let body = handle_request(&state.schema, &state.store, &msg);
        let reply = match serde_json::to_string(&body) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to serialise query response");
                return;
            }
        };
        if socket.send(Message::Text(reply.into())).await.is_err() {
            return;
        }

        if !state.keep_alive {
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RawPdu, SensorMeta};

    fn schema() -> Schema {
        let sensors: HashMap<String, SensorMeta> = [("rpm".to_owned(), SensorMeta {
            group: "core".to_owned(),
            min: 0.0,
            max: 20000.0,
            on_dash: true,
            enable: true,
        })]
        .into_iter()
        .collect();
        let raw = [RawPdu {
            name: "CORE",
            pdu_id: 0,
            fields: &[("valid_bitfield", "u32"), ("rpm", "u16")],
        }];
        Schema::build(0x01, &raw, sensors).unwrap()
    }

    #[test]
    fn parses_amount_and_timesince() {
        let req = parse_request("GET /sensors?amount=1&timesince=5.0").unwrap();
        assert_eq!(req.route, Route::AllSensors);
        assert_eq!(req.amount, Some(1));
        assert_eq!(req.timesince, Some(5.0));
    }

    #[test]
    fn parses_group_route() {
        let req = parse_request("GET /sensors/core?amount=3").unwrap();
        assert_eq!(req.route, Route::Group("core".to_owned()));
    }

    #[test]
    fn rejects_non_get_verb() {
        let err = parse_request("POST /sensors").unwrap_err();
        assert!(matches!(err, QueryError::UnknownVerb(v) if v == "POST"));
    }

    #[test]
    fn rejects_unknown_route() {
        let err = parse_request("GET /bogus").unwrap_err();
        assert!(matches!(err, QueryError::UnknownRoute(_)));
    }

    #[test]
    fn rejects_malformed_amount() {
        let err = parse_request("GET /sensors?amount=abc").unwrap_err();
        assert!(matches!(err, QueryError::Malformed(_)));
    }

    #[test]
    fn e6_amount_one_matches_literal_example() {
        let schema = schema();
        let store = Store::open_in_memory().unwrap();
        store.ensure_series("rpm").unwrap();
        store.append("rpm", 5.0, 999.0).unwrap();

        let body = handle_request(&schema, &store, "GET /sensors?amount=1");
        assert_eq!(
            body,
            json!({
                "status": 200,
                "epoch": 5.0,
                "result": { "core": { "rpm": [ { "time": 5.0, "value": 999.0 } ] } }
            })
        );
    }

    #[test]
    fn neither_filter_yields_empty_list() {
        let schema = schema();
        let store = Store::open_in_memory().unwrap();
        store.ensure_series("rpm").unwrap();
        store.append("rpm", 5.0, 999.0).unwrap();

        let body = handle_request(&schema, &store, "GET /sensors");
        assert_eq!(
            body,
            json!({ "status": 200, "epoch": 0.0, "result": { "core": { "rpm": [] } } })
        );
    }

    #[test]
    fn malformed_request_has_status_400_in_body() {
        let schema = schema();
        let store = Store::open_in_memory().unwrap();
        let body = handle_request(&schema, &store, "POST /sensors");
        assert_eq!(body["status"], 501);
    }

    #[test]
    fn unknown_group_is_404() {
        let schema = schema();
        let store = Store::open_in_memory().unwrap();
        let body = handle_request(&schema, &store, "GET /sensors/bogus?amount=1");
        assert_eq!(body["status"], 404);
    }

    #[test]
    fn meta_sensors_lists_metadata_by_group() {
        let schema = schema();
        let store = Store::open_in_memory().unwrap();
        let body = handle_request(&schema, &store, "GET /meta/sensors");
        assert_eq!(body["status"], 200);
        assert_eq!(body["result"]["core"]["rpm"]["group"], "core");
    }
}
