//! Transport Factory (spec.md C3, §4.3).
//!
//! The source models a Transport as three callbacks (`on_connect`,
//! `on_bytes`, `on_lost`) invoked from arbitrary threads (the radio
//! library in particular runs its own thread). Per §9's "cross-thread
//! callbacks" redesign note, the rewrite replaces callbacks with an
//! explicit channel of ordered [`Event`]s: each concrete transport owns a
//! task that only ever touches its own socket/port and forwards what it
//! sees to the scheduler over an mpsc channel — no shared mutable state is
//! touched from the library thread.

pub mod tcp_client;
pub mod tcp_server;
pub mod xbee;

use tokio::sync::mpsc;

/// Ordered events for one Transport endpoint (spec.md §4.3).
#[derive(Debug)]
pub enum Event {
    /// Once per successful session open.
    Connected,
    /// Delivered in order; may coalesce or split PDU boundaries (TCP) or
    /// always carry whole PDUs (XBee) — see spec.md §9.
    Bytes(Vec<u8>),
    /// Once per session close. `None` on clean close.
    Lost(Option<String>),
}

/// A live Transport endpoint: an identity, its ordered event stream, and a
/// handle for writing bytes back to the peer (spec.md §4.3 `write`).
pub struct Endpoint {
    /// `"peer_ip:peer_port"` for TCP, `(com_port, baud, remote_mac)` for
    /// XBee (spec.md §4.3).
    pub id: String,
    pub events: mpsc::Receiver<Event>,
    pub writer: mpsc::Sender<Vec<u8>>,
}
