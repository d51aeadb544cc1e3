//! Live peer channel: message schema, transport seam, and the consumer
//! that forwards peer traffic into the selector without ever blocking it.

use std::collections::HashMap;

use crossbeam::channel::{Sender, TrySendError};
use minicbor::{Decoder, Encoder};

use super::SyncError;
use crate::core::{Event, ItemKey, merge};
use crate::repo::CursorMove;
use crate::wal::{WalError, WalFile, read_blob};

/// Messages carried on the peer channel. `Wal` payloads are ordinary blobs
/// (usually holding a single event) addressed to a peer; `Position` tracks
/// live cursors; ping/pong carries liveness and the server-asserted user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerMessage {
    Wal {
        to: String,
        payload: Vec<u8>,
    },
    Position {
        uuid: String,
        item_key: ItemKey,
        unix_nanos: i64,
    },
    Ping {
        nonce: u64,
    },
    Pong {
        user: String,
    },
}

impl PeerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        let result = match self {
            PeerMessage::Wal { to, payload } => enc
                .map(3)
                .and_then(|e| e.str("payload"))
                .and_then(|e| e.bytes(payload))
                .and_then(|e| e.str("to"))
                .and_then(|e| e.str(to))
                .and_then(|e| e.str("type"))
                .and_then(|e| e.str("wal"))
                .map(|_| ()),
            PeerMessage::Position {
                uuid,
                item_key,
                unix_nanos,
            } => enc
                .map(4)
                .and_then(|e| e.str("item_key"))
                .and_then(|e| e.str(item_key.as_str()))
                .and_then(|e| e.str("type"))
                .and_then(|e| e.str("position"))
                .and_then(|e| e.str("unix_nanos"))
                .and_then(|e| e.i64(*unix_nanos))
                .and_then(|e| e.str("uuid"))
                .and_then(|e| e.str(uuid))
                .map(|_| ()),
            PeerMessage::Ping { nonce } => enc
                .map(2)
                .and_then(|e| e.str("nonce"))
                .and_then(|e| e.u64(*nonce))
                .and_then(|e| e.str("type"))
                .and_then(|e| e.str("ping"))
                .map(|_| ()),
            PeerMessage::Pong { user } => enc
                .map(2)
                .and_then(|e| e.str("type"))
                .and_then(|e| e.str("pong"))
                .and_then(|e| e.str("user"))
                .and_then(|e| e.str(user))
                .map(|_| ()),
        };
        result.map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<PeerMessage, SyncError> {
        let mut dec = Decoder::new(bytes);
        let err = |e: minicbor::decode::Error| SyncError::Transport(e.to_string());

        let map_len = dec
            .map()
            .map_err(err)?
            .ok_or_else(|| SyncError::Transport("indefinite map".to_string()))?;

        let mut kind = None;
        let mut to = None;
        let mut payload = None;
        let mut uuid = None;
        let mut item_key = None;
        let mut unix_nanos = None;
        let mut nonce = None;
        let mut user = None;

        for _ in 0..map_len {
            match dec.str().map_err(err)? {
                "type" => kind = Some(dec.str().map_err(err)?.to_string()),
                "to" => to = Some(dec.str().map_err(err)?.to_string()),
                "payload" => payload = Some(dec.bytes().map_err(err)?.to_vec()),
                "uuid" => uuid = Some(dec.str().map_err(err)?.to_string()),
                "item_key" => item_key = Some(ItemKey::from(dec.str().map_err(err)?)),
                "unix_nanos" => unix_nanos = Some(dec.i64().map_err(err)?),
                "nonce" => nonce = Some(dec.u64().map_err(err)?),
                "user" => user = Some(dec.str().map_err(err)?.to_string()),
                _ => {
                    dec.skip().map_err(err)?;
                }
            }
        }

        let missing = |field: &str| SyncError::Transport(format!("missing field {field}"));
        match kind.as_deref() {
            Some("wal") => Ok(PeerMessage::Wal {
                to: to.ok_or_else(|| missing("to"))?,
                payload: payload.ok_or_else(|| missing("payload"))?,
            }),
            Some("position") => Ok(PeerMessage::Position {
                uuid: uuid.ok_or_else(|| missing("uuid"))?,
                item_key: item_key.ok_or_else(|| missing("item_key"))?,
                unix_nanos: unix_nanos.ok_or_else(|| missing("unix_nanos"))?,
            }),
            Some("ping") => Ok(PeerMessage::Ping {
                nonce: nonce.ok_or_else(|| missing("nonce"))?,
            }),
            Some("pong") => Ok(PeerMessage::Pong {
                user: user.ok_or_else(|| missing("user"))?,
            }),
            Some(other) => Err(SyncError::Transport(format!("unknown message type {other}"))),
            None => Err(missing("type")),
        }
    }
}

/// Outbound half of a peer connection. Owned by the refresh loop.
pub trait PeerSender: Send {
    fn send(&mut self, msg: &PeerMessage) -> Result<(), SyncError>;
    fn close(&mut self);
}

/// Inbound half of a peer connection. Owned by the consumer fiber; `recv`
/// blocks and must fail once the connection is closed.
pub trait PeerReceiver: Send {
    fn recv(&mut self) -> Result<PeerMessage, SyncError>;
}

/// Connection factory; the transport itself (websocket, test pair) lives
/// outside this crate.
pub trait PeerTransport: Send + Sync {
    fn connect(&self) -> Result<(Box<dyn PeerSender>, Box<dyn PeerReceiver>), SyncError>;
}

/// A peer-addressed walfile: pushes become single `Wal` messages on the
/// live channel. Peers have no listable history, so pulls see it as empty.
pub struct PeerWalFile {
    uuid: String,
    ws_tx: Sender<PeerMessage>,
}

impl PeerWalFile {
    pub fn new(uuid: impl Into<String>, ws_tx: Sender<PeerMessage>) -> Self {
        Self {
            uuid: uuid.into(),
            ws_tx,
        }
    }
}

impl WalFile for PeerWalFile {
    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn root(&self) -> &str {
        "web"
    }

    fn list(&self) -> Result<Vec<String>, WalError> {
        Ok(Vec::new())
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, WalError> {
        let _ = name;
        Err(WalError::Unsupported {
            uuid: self.uuid.clone(),
            op: "read",
        })
    }

    fn write(&self, _name: &str, bytes: &[u8]) -> Result<(), WalError> {
        self.ws_tx
            .send(PeerMessage::Wal {
                to: self.uuid.clone(),
                payload: bytes.to_vec(),
            })
            .map_err(|_| WalError::ChannelClosed)
    }

    fn remove(&self, _names: &[String]) -> Result<(), WalError> {
        Ok(())
    }
}

/// Drain a peer connection, decoding `Wal` payloads into deltas for the
/// selector and keeping only the newest cursor position per peer.
///
/// Forwarding is bounded: if the selector is busy, consecutive single-event
/// blobs coalesce into one pending delta that is retried on the next
/// message, so a chatty peer can never pile up unbounded backlog and never
/// blocks this consumer.
pub fn run_peer_consumer(
    mut receiver: Box<dyn PeerReceiver>,
    replay_tx: Sender<Vec<Event>>,
    cursor_tx: Sender<CursorMove>,
) {
    let mut pending_delta: Vec<Event> = Vec::new();
    let mut pending_positions: HashMap<String, CursorMove> = HashMap::new();

    loop {
        let msg = match receiver.recv() {
            Ok(msg) => msg,
            Err(_) => return,
        };

        match msg {
            PeerMessage::Wal { payload, .. } => {
                let events = match read_blob(&payload) {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!("undecodable peer blob: {e}");
                        continue;
                    }
                };
                pending_delta = merge(&pending_delta, &events);
                if !pending_delta.is_empty() {
                    match replay_tx.try_send(std::mem::take(&mut pending_delta)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(delta)) => pending_delta = delta,
                        Err(TrySendError::Disconnected(_)) => return,
                    }
                }
            }
            PeerMessage::Position {
                uuid,
                item_key,
                unix_nanos,
            } => {
                // Only the newest position per peer matters; staging every
                // update here keeps per-peer delivery monotonic even when
                // the cursor channel backs up.
                let stale = pending_positions
                    .get(&uuid)
                    .is_some_and(|old| old.unix_nanos >= unix_nanos);
                if !stale {
                    pending_positions.insert(
                        uuid.clone(),
                        CursorMove {
                            email: uuid,
                            item_key,
                            unix_nanos,
                        },
                    );
                }
            }
            PeerMessage::Ping { .. } | PeerMessage::Pong { .. } => {}
        }

        let mut disconnected = false;
        pending_positions.retain(|_, mv| match cursor_tx.try_send(mv.clone()) {
            Ok(()) => false,
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => {
                disconnected = true;
                false
            }
        });
        if disconnected {
            return;
        }
    }
}
