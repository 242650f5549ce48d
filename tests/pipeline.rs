//! End-to-end test wiring Config → Schema → Store → Broker → Ingestion →
//! Query Server without a real Transport or Subscriber, exercising the
//! same E1/E4/E6 scenarios spec.md §8 lists individually per-module.

use std::collections::HashMap;
use std::sync::Arc;
use telemetry_server::broker::Broker;
use telemetry_server::config::{ClientConfig, Config};
use telemetry_server::ingestion;
use telemetry_server::query;
use telemetry_server::store::Store;
use telemetry_server::transport::{Endpoint, Event};
use tokio::sync::mpsc;

const CONFIG: &str = r#"
    [schema]
    start_byte = 1

    [schema.pdu.CORE]
    id = 0
    fields = [
        { name = "rpm", c_type = "u16" },
        { name = "water", c_type = "u16" },
        { name = "tps", c_type = "u16" },
        { name = "batt", c_type = "u16" },
        { name = "ext5", c_type = "u16" },
        { name = "fuel", c_type = "u16" },
        { name = "lam", c_type = "u16" },
        { name = "spd", c_type = "u16" },
    ]

    [sensors.rpm]
    group = "core"
    [sensors.water]
    group = "core"
    [sensors.tps]
    group = "core"
    [sensors.batt]
    group = "core"
    [sensors.ext5]
    group = "core"
    [sensors.fuel]
    group = "core"
    [sensors.lam]
    group = "core"
    [sensors.spd]
    group = "core"

    [client.socket]
    host = "0.0.0.0"
    port = 9000

    [server]
    port = 8080
    database = "telemetry.sqlite3"

    [restful]
    port = 8000
"#;

fn e1_bytes() -> Vec<u8> {
    vec![
        0x01, 0x00, 0xFF, 0x00, 0x00, 0x00, 0xE8, 0x03, 0x50, 0x00, 0x0A, 0x00, 0x20, 0x4E, 0x14,
        0x00, 0xBC, 0x02, 0x37, 0x00, 0xC8, 0x00,
    ]
}

fn e2_bytes() -> Vec<u8> {
    vec![
        0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0xE8, 0x03, 0x50, 0x00, 0x0A, 0x00, 0x20, 0x4E, 0x14,
        0x00, 0xBC, 0x02, 0x37, 0x00, 0xC8, 0x00,
    ]
}

#[tokio::test]
async fn ingests_wire_bytes_and_answers_a_query() {
    let config = Config::from_str(CONFIG).unwrap();
    assert!(matches!(config.client, ClientConfig::Socket { .. }));

    let schema = Arc::new(config.schema.clone());
    let store = Arc::new(Store::open_in_memory().unwrap());
    for (name, _) in schema.iter_sensors() {
        store.ensure_series(name).unwrap();
    }
    let broker = Arc::new(Broker::new());

    let (event_tx, event_rx) = mpsc::channel(8);
    let (write_tx, _write_rx) = mpsc::channel(8);
    let endpoint = Endpoint {
        id: "test-peer".to_owned(),
        events: event_rx,
        writer: write_tx,
    };

    let mut e4 = e1_bytes();
    e4.extend(e2_bytes());

    event_tx.send(Event::Connected).await.unwrap();
    event_tx.send(Event::Bytes(e4)).await.unwrap();
    event_tx.send(Event::Lost(None)).await.unwrap();

    tokio::time::timeout(
        std::time::Duration::from_secs(1),
        ingestion::run(endpoint, schema.clone(), store.clone(), broker.clone()),
    )
    .await
    .expect("ingestion should finish once the transport reports lost");

    // E1 + E2: 8 samples then 1 more for rpm only -> rpm series has 2 points.
    let rpm_points = store.top_n("rpm", 10).unwrap();
    assert_eq!(rpm_points.len(), 2);
    assert_eq!(rpm_points[0].value, 1000.0);
    let water_points = store.top_n("water", 10).unwrap();
    assert_eq!(water_points.len(), 1);

    let body = query::handle_request(&schema, &store, "GET /sensors/core?amount=1");
    assert_eq!(body["status"], 200);
    let rpm_result = &body["result"]["core"]["rpm"];
    assert_eq!(rpm_result.as_array().unwrap().len(), 1);
    assert_eq!(rpm_result[0]["value"], 1000.0);

    let meta = query::handle_request(&schema, &store, "GET /meta/sensors");
    assert_eq!(meta["result"]["core"]["rpm"]["group"], "core");

    let mut fields: HashMap<&str, f64> = HashMap::new();
    fields.insert("rpm", rpm_points[0].value);
    assert_eq!(fields["rpm"], 1000.0);
}
