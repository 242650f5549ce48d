//! TCP server Transport variant (spec.md §4.3): accepts multiple
//! concurrent peers, each an independent [`Endpoint`].
//!
//! Grounded in the teacher's accept-loop shape
//! (`crates/timer-core/src/workers/client_connector.rs`), adapted to emit
//! [`Event`]s over a channel instead of pool-managed `Client` values.

use super::{Endpoint, Event};
use crate::error::TransportError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

const BYTES_CHANNEL_CAPACITY: usize = 64;
const WRITE_CHANNEL_CAPACITY: usize = 16;
const READ_CHUNK_SIZE: usize = 4096;

/// Accept loop: binds `bind_addr` and forwards one [`Endpoint`] per
/// accepted connection onto `endpoints`. Runs until the listener errors
/// fatally or `endpoints` is dropped (spec.md §4.3 "accepts multiple
/// concurrent peers").
pub async fn serve(
    bind_addr: &str,
    endpoints: mpsc::Sender<Endpoint>,
) -> Result<(), TransportError> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "tcp server transport listening");

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "tcp accept failed");
                continue;
            }
        };

        let id = addr.to_string();
        let (event_tx, event_rx) = mpsc::channel(BYTES_CHANNEL_CAPACITY);
        let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_CAPACITY);

        tokio::spawn(run_connection(stream, id.clone(), event_tx, write_rx));

        let endpoint = Endpoint {
            id,
            events: event_rx,
            writer: write_tx,
        };
        if endpoints.send(endpoint).await.is_err() {
            info!("endpoint sink closed, stopping tcp server transport");
            return Ok(());
        }
    }
}

async fn run_connection(
    stream: TcpStream,
    id: String,
    events: mpsc::Sender<Event>,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    if events.send(Event::Connected).await.is_err() {
        return;
    }

    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let reason = loop {
        tokio::select! {
            read = read_half.read(&mut buf) => {
                match read {
                    Ok(0) => break None,
                    Ok(n) => {
                        if events.send(Event::Bytes(buf[..n].to_vec())).await.is_err() {
                            break None;
                        }
                    }
                    Err(err) => break Some(err.to_string()),
                }
            }
            outgoing = write_rx.recv() => {
                match outgoing {
                    Some(bytes) => {
                        if let Err(err) = write_half.write_all(&bytes).await {
                            break Some(err.to_string());
                        }
                    }
                    None => continue,
                }
            }
        }
    };

    info!(%id, ?reason, "tcp server connection lost");
    let _ = events.send(Event::Lost(reason)).await;
}
