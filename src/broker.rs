//! Fan-out Broker (spec.md C6, §4.6).
//!
//! Each Subscriber's buffer and periodic flush live on their own spawned
//! task (spec.md §5: "Subscriber buffers are owned by their flush task").
//! `Broker::enqueue` never touches a buffer directly — it only forwards
//! the sample down that subscriber's channel, so a slow subscriber can
//! never block another (spec.md §4.6 "no cross-subscriber coupling"),
//! mirroring the registry-of-channels shape of `services/server/src/state.rs`'s
//! `BroadcastRegistry`.

use crate::store::Point;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

/// A single in-flight value bound for the Broker (spec.md §3 `Sample`).
#[derive(Debug, Clone)]
pub struct Sample {
    pub sensor: String,
    pub epoch: f64,
    pub value: f64,
}

/// Identifies a Subscriber (spec.md §3): `(server_key, namespace)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberKey {
    pub server_key: String,
    pub namespace: String,
}

pub type EmitFuture = BoxFuture<'static, Result<(), ()>>;

/// The push primitive the Controller supplies per Subscriber (spec.md
/// §4.6 "emit primitive"). Implementations push over whatever transport
/// the subscriber actually uses (websocket push client, socket.io-style
/// namespace, ...); the Broker only knows about batches of samples.
pub trait Emit: Send + Sync {
    /// One-shot schema/sensor metadata announcement on connect.
    fn emit_meta(&self, meta: serde_json::Value) -> EmitFuture;
    /// A periodic flush of samples accumulated since the last call.
    fn emit_data(&self, batch: HashMap<String, Vec<Point>>) -> EmitFuture;
}

struct SubscriberHandle {
    tx: mpsc::Sender<Sample>,
    alive: Arc<AtomicBool>,
}

pub struct Broker {
    subscribers: RwLock<HashMap<SubscriberKey, SubscriberHandle>>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    #[must_use]
    pub fn new() -> Self {
        Broker {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a Subscriber and spawn its owning flush task. Emits the
    /// one-shot `meta` announcement before the first flush (spec.md §4.6).
    pub async fn connect(
        &self,
        key: SubscriberKey,
        emitter: Arc<dyn Emit>,
        meta: serde_json::Value,
        flush_interval: Duration,
        retry_cap: u32,
    ) {
        let (tx, rx) = mpsc::channel(256);
        let alive = Arc::new(AtomicBool::new(true));

        self.subscribers.write().await.insert(
            key.clone(),
            SubscriberHandle {
                tx,
                alive: alive.clone(),
            },
        );

        tokio::spawn(run_subscriber(key, emitter, meta, rx, flush_interval, retry_cap, alive));
    }

    /// Remove a Subscriber immediately (e.g. on clean disconnect).
    pub async fn disconnect(&self, key: &SubscriberKey) {
        self.subscribers.write().await.remove(key);
    }

    /// Fan a sample out to every connected Subscriber's buffer. Best
    /// effort: a full or closed channel just drops the sample for that
    /// subscriber (spec.md §4.6).
    pub async fn enqueue(&self, sample: Sample) {
        let subscribers = self.subscribers.read().await;
        for (key, handle) in subscribers.iter() {
            if !handle.alive.load(Ordering::Acquire) {
                continue;
            }
            if handle.tx.try_send(sample.clone()).is_err() {
                warn!(?key, "subscriber buffer full or closed, dropping sample");
            }
        }
    }

    /// Ambient health signal (SPEC_FULL.md "Health/liveness signal"): true
    /// iff at least one Subscriber is currently connected.
    pub async fn healthy(&self) -> bool {
        !self.subscribers.read().await.is_empty()
    }

    /// Drop Subscribers whose flush task has given up after exhausting
    /// their retry budget. Cheap periodic housekeeping; `enqueue` also
    /// skips dead entries so correctness never depends on this running.
    pub async fn reap(&self) {
        self.subscribers
            .write()
            .await
            .retain(|_, handle| handle.alive.load(Ordering::Acquire));
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_subscriber(
    key: SubscriberKey,
    emitter: Arc<dyn Emit>,
    meta: serde_json::Value,
    mut rx: mpsc::Receiver<Sample>,
    flush_interval: Duration,
    retry_cap: u32,
    alive: Arc<AtomicBool>,
) {
    if emitter.emit_meta(meta).await.is_err() {
        warn!(?key, "initial meta announcement failed");
    }

    let mut buffer: HashMap<String, Vec<Point>> = HashMap::new();
    let mut interval = tokio::time::interval(flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            sample = rx.recv() => {
                match sample {
                    Some(sample) => {
                        buffer.entry(sample.sensor).or_default().push(Point {
                            time: sample.epoch,
                            value: sample.value,
                        });
                    }
                    None => break,
                }
            }
            _ = interval.tick() => {
                if buffer.is_empty() {
                    continue;
                }
                let batch = std::mem::take(&mut buffer);
                match emitter.emit_data(batch).await {
                    Ok(()) => consecutive_failures = 0,
                    Err(()) => {
                        consecutive_failures += 1;
                        warn!(?key, consecutive_failures, "subscriber emit failed");
                        if consecutive_failures > retry_cap {
                            warn!(?key, "subscriber exceeded retry cap, removing");
                            break;
                        }
                    }
                }
            }
        }
    }

    alive.store(false, Ordering::Release);
    info!(?key, "subscriber flush task stopped");
}
