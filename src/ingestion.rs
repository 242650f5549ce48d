//! Ingestion Pipeline (spec.md C4, §4.4).
//!
//! One task per open Transport (spec.md §5). Accumulates `Event::Bytes`
//! deliveries into a per-Transport carry buffer, decodes as much as
//! possible, and pushes every decoded sample to the Store *then* the
//! Broker in that order — mandatory so a query issued right after a push
//! cannot observe a sample the store doesn't have yet (spec.md §4.4 step 3).

use crate::broker::{Broker, Sample};
use crate::codec;
use crate::error::CodecError;
use crate::schema::Schema;
use crate::store::Store;
use crate::transport::{Endpoint, Event};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs_f64()
}

/// Drive one Transport endpoint to completion (until `on_lost`).
pub async fn run(mut endpoint: Endpoint, schema: Arc<Schema>, store: Arc<Store>, broker: Arc<Broker>) {
    let id = endpoint.id.clone();
    let mut carry: Vec<u8> = Vec::new();

    while let Some(event) = endpoint.events.recv().await {
        match event {
            Event::Connected => info!(%id, "transport connected"),
            Event::Bytes(bytes) => {
                carry.extend_from_slice(&bytes);
                let consumed = decode_and_dispatch(&schema, &store, &broker, &carry).await;
                carry.drain(..consumed);
            }
            Event::Lost(reason) => {
                info!(%id, ?reason, "transport lost");
                return;
            }
        }
    }
}

/// Decode as many complete PDUs as possible from `buffer`, appending each
/// resulting sample to the Store then the Broker. Returns the number of
/// bytes that were fully consumed; the caller retains the remainder.
async fn decode_and_dispatch(
    schema: &Schema,
    store: &Store,
    broker: &Broker,
    buffer: &[u8],
) -> usize {
    let mut frames = Vec::new();
    let (consumed, error) = codec::decode_buffer(schema, buffer, |frame| frames.push(frame));

    for frame in frames {
        let epoch = frame.epoch.unwrap_or_else(now_epoch);
        for (sensor, value) in frame.fields {
            if let Err(err) = store.append(&sensor, epoch, value) {
                warn!(sensor, error = %err, "dropping sample: store append failed");
                continue;
            }
            broker
                .enqueue(Sample {
                    sensor,
                    epoch,
                    value,
                })
                .await;
        }
    }

    match error {
        None => consumed,
        // A partial trailing PDU is not malformed input (spec.md §9 item
        // 5): keep it for the next delivery instead of discarding it.
        Some(CodecError::ShortFrame) => consumed,
        Some(err) => {
            warn!(error = %err, "codec error, discarding remainder of buffer");
            buffer.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RawPdu, SensorMeta};
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn schema() -> Arc<Schema> {
        let sensors: HashMap<String, SensorMeta> = [("rpm".to_owned(), SensorMeta {
            group: "core".to_owned(),
            min: 0.0,
            max: 65535.0,
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
        Arc::new(Schema::build(0x01, &raw, sensors).unwrap())
    }

    #[tokio::test]
    async fn full_pdu_is_decoded_and_stored() {
        let schema = schema();
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.ensure_series("rpm").unwrap();
        let broker = Arc::new(Broker::new());

        let bytes = vec![0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0xE8, 0x03];
        let consumed = decode_and_dispatch(&schema, &store, &broker, &bytes).await;

        assert_eq!(consumed, bytes.len());
        let points = store.top_n("rpm", 1).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 1000.0);
    }

    #[tokio::test]
    async fn partial_trailing_pdu_is_retained_as_carry() {
        let schema = schema();
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.ensure_series("rpm").unwrap();
        let broker = Arc::new(Broker::new());

        let bytes = vec![0x01, 0x00, 0x01, 0x00, 0x00]; // missing 3 trailing bytes
        let consumed = decode_and_dispatch(&schema, &store, &broker, &bytes).await;

        assert_eq!(consumed, 0);
        assert!(store.top_n("rpm", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_start_byte_discards_whole_buffer() {
        let schema = schema();
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.ensure_series("rpm").unwrap();
        let broker = Arc::new(Broker::new());

        let bytes = vec![0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0xE8, 0x03];
        let consumed = decode_and_dispatch(&schema, &store, &broker, &bytes).await;

        assert_eq!(consumed, bytes.len());
        assert!(store.top_n("rpm", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_stops_cleanly_when_transport_reports_lost() {
        let schema = schema();
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.ensure_series("rpm").unwrap();
        let broker = Arc::new(Broker::new());

        let (event_tx, event_rx) = mpsc::channel(8);
        let (write_tx, _write_rx) = mpsc::channel(8);
        let endpoint = Endpoint {
            id: "test".to_owned(),
            events: event_rx,
            writer: write_tx,
        };

        event_tx.send(Event::Connected).await.unwrap();
        event_tx
            .send(Event::Bytes(vec![0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0xE8, 0x03]))
            .await
            .unwrap();
        event_tx.send(Event::Lost(None)).await.unwrap();

        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            run(endpoint, schema, store.clone(), broker),
        )
        .await
        .expect("run should return once the transport reports lost");

        assert_eq!(store.top_n("rpm", 10).unwrap().len(), 1);
    }
}
