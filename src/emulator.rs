//! Emulator (spec.md C8, §4.8).
//!
//! When enabled, replaces the Ingestion Pipeline as the sample source: on
//! a fixed interval, evaluate every enabled sensor's configured
//! expression against an integer tick counter and push the result
//! through Store + Broker on the same contract as C4 (spec.md §4.4 step
//! 3's Store-before-Broker ordering still applies here).

pub mod expr;

use crate::broker::{Broker, Sample};
use crate::error::SchemaError;
use crate::schema::Schema;
use crate::store::Store;
use expr::CompiledExpr;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs_f64()
}

/// Pre-compiled, per-sensor expressions (spec.md §4.8 "sensor-specific
/// expression"). Compiling once at construction means a malformed
/// expression fails fast instead of on every tick.
pub struct Emulator {
    expressions: HashMap<String, CompiledExpr>,
    interval: Duration,
}

impl Emulator {
    pub fn new(
        expressions: &HashMap<String, String>,
        schema: &Schema,
        interval: Duration,
    ) -> Result<Self, SchemaError> {
        let mut compiled = HashMap::with_capacity(expressions.len());
        for (sensor, source) in expressions {
            if schema.sensor_meta(sensor).is_none() {
                return Err(SchemaError::UnknownSensorField {
                    pdu: "emulation".to_owned(),
                    field: sensor.clone(),
                });
            }
            let parsed = CompiledExpr::parse(source).map_err(|_| SchemaError::UnknownWireType(
                format!("emulation expression for `{sensor}`"),
            ))?;
            compiled.insert(sensor.clone(), parsed);
        }
        Ok(Emulator {
            expressions: compiled,
            interval,
        })
    }

    /// Run the tick loop until `shutdown` resolves.
    pub async fn run(
        &self,
        schema: &Schema,
        store: &Store,
        broker: &Broker,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tick: u64 = 0;

        info!(sensors = self.expressions.len(), "emulator started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick_once(schema, store, broker, tick as f64).await;
                    tick += 1;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("emulator shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn tick_once(&self, schema: &Schema, store: &Store, broker: &Broker, x: f64) {
        let epoch = now_epoch();
        for (sensor, expr) in &self.expressions {
            let Some(meta) = schema.sensor_meta(sensor) else {
                continue;
            };
            if !meta.enable {
                continue;
            }
            let value = expr.eval(x);
            if let Err(err) = store.append(sensor, epoch, value) {
                warn!(sensor, error = %err, "emulator: dropping sample, store append failed");
                continue;
            }
            broker
                .enqueue(Sample {
                    sensor: sensor.clone(),
                    epoch,
                    value,
                })
                .await;
        }
    }
}

/// Convenience wrapper matching the Controller's "own the handle" shape:
/// spawns the tick loop on its own task.
pub fn spawn(
    emulator: Arc<Emulator>,
    schema: Arc<Schema>,
    store: Arc<Store>,
    broker: Arc<Broker>,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        emulator.run(&schema, &store, &broker, shutdown).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RawPdu, SensorMeta};

    fn schema() -> Schema {
        let sensors: HashMap<String, SensorMeta> = [("rpm".to_owned(), SensorMeta {
            group: "core".to_owned(),
            min: 0.0,
            max: 10000.0,
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
    fn rejects_expression_for_unknown_sensor() {
        let schema = schema();
        let exprs: HashMap<String, String> = [("ghost".to_owned(), "x".to_owned())].into();
        let err = Emulator::new(&exprs, &schema, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownSensorField { .. }));
    }

    #[tokio::test]
    async fn tick_appends_evaluated_value_to_store_and_broker() {
        let schema = schema();
        let store = Store::open_in_memory().unwrap();
        store.ensure_series("rpm").unwrap();
        let broker = Broker::new();

        let exprs: HashMap<String, String> = [("rpm".to_owned(), "1000 + x".to_owned())].into();
        let emulator = Emulator::new(&exprs, &schema, Duration::from_millis(10)).unwrap();

        emulator.tick_once(&schema, &store, &broker, 5.0).await;

        let points = store.top_n("rpm", 1).unwrap();
        assert_eq!(points[0].value, 1005.0);
    }

    #[tokio::test]
    async fn disabled_sensor_is_skipped() {
        let sensors: HashMap<String, SensorMeta> = [("rpm".to_owned(), SensorMeta {
            group: "core".to_owned(),
            min: 0.0,
            max: 10000.0,
            on_dash: true,
            enable: false,
        })]
        .into_iter()
        .collect();
        let raw = [RawPdu {
            name: "CORE",
            pdu_id: 0,
            fields: &[("valid_bitfield", "u32"), ("rpm", "u16")],
        }];
        let schema = Schema::build(0x01, &raw, sensors).unwrap();
        let store = Store::open_in_memory().unwrap();
        store.ensure_series("rpm").unwrap();
        let broker = Broker::new();

        let exprs: HashMap<String, String> = [("rpm".to_owned(), "x".to_owned())].into();
        let emulator = Emulator::new(&exprs, &schema, Duration::from_millis(10)).unwrap();
        emulator.tick_once(&schema, &store, &broker, 1.0).await;

        assert!(store.top_n("rpm", 1).unwrap().is_empty());
    }
}
