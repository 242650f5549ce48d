//! XBee radio Transport variant (spec.md §4.3): exactly one [`Endpoint`]
//! per `(com_port, baud, remote_mac)` tuple.
//!
//! The source talks to the radio through `digi.xbee`'s own framing, which
//! delivers whole application messages. `tokio-serial` gives us the raw
//! byte stream instead, so we no longer get that guarantee for free; the
//! Ingestion Pipeline's carry buffer (spec.md §9 open question 5) is what
//! actually protects decoding here, same as for the TCP variants.

use super::{Endpoint, Event};
use crate::error::TransportError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::SerialPortBuilderExt;
use tracing::info;

const BYTES_CHANNEL_CAPACITY: usize = 64;
const WRITE_CHANNEL_CAPACITY: usize = 16;
const READ_CHUNK_SIZE: usize = 1024;

/// Open the serial port identified by `com_port` at `baud`. `remote_mac`
/// is carried only as part of the endpoint identity (spec.md §4.3); this
/// module does not address individual remote radios on a mesh.
pub fn open(com_port: &str, baud: u32, remote_mac: &str) -> Result<Endpoint, TransportError> {
    let port = tokio_serial::new(com_port, baud)
        .open_native_async()
        .map_err(|err| TransportError::Connect(std::io::Error::other(err)))?;

    let id = format!("{com_port}@{baud}:{remote_mac}");
    info!(%id, "xbee transport opened");

    let (event_tx, event_rx) = tokio::sync::mpsc::channel(BYTES_CHANNEL_CAPACITY);
    let (write_tx, write_rx) = tokio::sync::mpsc::channel(WRITE_CHANNEL_CAPACITY);

    tokio::spawn(run_port(port, id.clone(), event_tx, write_rx));

    Ok(Endpoint {
        id,
        events: event_rx,
        writer: write_tx,
    })
}

async fn run_port(
    mut port: tokio_serial::SerialStream,
    id: String,
    events: tokio::sync::mpsc::Sender<Event>,
    mut write_rx: tokio::sync::mpsc::Receiver<Vec<u8>>,
) {
    if events.send(Event::Connected).await.is_err() {
        return;
    }

    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let reason = loop {
        tokio::select! {
            read = port.read(&mut buf) => {
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
                        if let Err(err) = port.write_all(&bytes).await {
                            break Some(err.to_string());
                        }
                    }
                    None => continue,
                }
            }
        }
    };

    info!(%id, ?reason, "xbee transport lost");
    let _ = events.send(Event::Lost(reason)).await;
}
