//! TCP client Transport variant (spec.md §4.3): exactly one [`Endpoint`]
//! per instance. Reconnects are the Controller's responsibility, not this
//! module's — a failed `connect` simply returns `TransportError`.

use super::{Endpoint, Event};
use crate::error::TransportError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::info;

const BYTES_CHANNEL_CAPACITY: usize = 64;
const WRITE_CHANNEL_CAPACITY: usize = 16;
const READ_CHUNK_SIZE: usize = 4096;

/// Connect once to `addr` and return the resulting [`Endpoint`]. The
/// connection's read/write loop runs on a spawned task until the peer
/// closes or errors.
pub async fn connect(addr: &str) -> Result<Endpoint, TransportError> {
    let stream = TcpStream::connect(addr).await?;
    info!(%addr, "tcp client transport connected");

    let (event_tx, event_rx) = mpsc::channel(BYTES_CHANNEL_CAPACITY);
    let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_CAPACITY);
    let id = addr.to_owned();

    tokio::spawn(run_connection(stream, id.clone(), event_tx, write_rx));

    Ok(Endpoint {
        id,
        events: event_rx,
        writer: write_tx,
    })
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

    info!(%id, ?reason, "tcp client connection lost");
    let _ = events.send(Event::Lost(reason)).await;
}
