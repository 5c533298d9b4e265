// src/attach/protocol.rs

//! Wire format of the attach socket.
//!
//! Every frame is `[kind: u8][len: u32 BE][payload]`:
//! - kind 0: control message, JSON encoded,
//! - kind 1: raw terminal bytes (pty input from the client, pty output from
//!   the server).

use std::io;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::AttachErrorKind;
use crate::session::{SessionId, SessionSummary};
use crate::types::{SignalKind, TermSize};

pub const MAX_FRAME_BYTES: usize = 1 << 20;
const HEADER_LEN: usize = 5;
const KIND_CONTROL: u8 = 0;
const KIND_DATA: u8 = 1;

/// Byte that detaches the attach client from its session (Ctrl-]).
pub const DETACH_KEY: u8 = 0x1d;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<C> {
    Control(C),
    Data(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ListSessions,
    Attach {
        session_id: SessionId,
        size: Option<TermSize>,
    },
    Detach,
    Resize {
        size: TermSize,
    },
    Signal {
        session_id: SessionId,
        signal: SignalKind,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Sessions { sessions: Vec<SessionSummary> },
    Attached { session_id: SessionId },
    Detached,
    Finished { session_id: SessionId, exit_code: i32 },
    Ok,
    Error { kind: AttachErrorKind, message: String },
}

/// Length-prefixed frame codec; decodes `Rx` control messages and encodes
/// `Tx` ones.
#[derive(Debug)]
pub struct AttachCodec<Rx, Tx> {
    _marker: PhantomData<fn(Tx) -> Rx>,
}

impl<Rx, Tx> AttachCodec<Rx, Tx> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<Rx, Tx> Default for AttachCodec<Rx, Tx> {
    fn default() -> Self {
        Self::new()
    }
}

/// Codec used by the server end of a connection.
pub type ServerCodec = AttachCodec<ClientMessage, ServerMessage>;
/// Codec used by the client end of a connection.
pub type ClientCodec = AttachCodec<ServerMessage, ClientMessage>;

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

impl<Rx: DeserializeOwned, Tx> Decoder for AttachCodec<Rx, Tx> {
    type Item = Frame<Rx>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let kind = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(invalid(format!("frame of {len} bytes exceeds limit")));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        match kind {
            KIND_CONTROL => serde_json::from_slice(&payload)
                .map(|msg| Some(Frame::Control(msg)))
                .map_err(|e| invalid(format!("bad control message: {e}"))),
            KIND_DATA => Ok(Some(Frame::Data(payload))),
            other => Err(invalid(format!("unknown frame kind {other}"))),
        }
    }
}

impl<Rx, Tx: Serialize> Encoder<Frame<Tx>> for AttachCodec<Rx, Tx> {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame<Tx>, dst: &mut BytesMut) -> io::Result<()> {
        let (kind, payload) = match frame {
            Frame::Control(msg) => {
                let json = serde_json::to_vec(&msg).map_err(|e| invalid(e.to_string()))?;
                (KIND_CONTROL, Bytes::from(json))
            }
            Frame::Data(bytes) => (KIND_DATA, bytes),
        };
        if payload.len() > MAX_FRAME_BYTES {
            return Err(invalid(format!(
                "frame of {} bytes exceeds limit",
                payload.len()
            )));
        }
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(kind);
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// Split pty output into frames no larger than the limit.
pub fn data_frames<C>(bytes: Bytes) -> impl Iterator<Item = Frame<C>> {
    let mut rest = bytes;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let n = rest.len().min(MAX_FRAME_BYTES);
        Some(Frame::Data(rest.split_to(n)))
    })
}
