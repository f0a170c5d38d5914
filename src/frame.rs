//! Node protocol framing.
//!
//! Every frame shares one header layout (network byte order, no padding):
//! a u32 length, a message type byte, sender and receiver instance
//! versions, sender and receiver entities, and the correlation nonce.
//! Requests are emitted eagerly in one write; replies are read with a
//! non-blocking peek of the length prefix followed by an exact read of the
//! whole frame, so a reply is consumed either completely or not at all.

use std::io::Read;
use std::net::TcpStream;
use std::os::fd::AsRawFd;

use bytes::Bytes;
use nix::errno::Errno;
use nix::sys::socket::{self, MsgFlags};
use thiserror::Error;

use crate::types::EntityId;
use crate::wire::{put_u16, put_u32};

/// Full header length, the u32 length prefix included.
pub const FRAME_HEADER_LEN: usize = 4 + 1 + 2 + 2 + EntityId::SERIALIZED_LEN * 2 + 4;

pub const NET_SUCCESS: u16 = 1;
pub const NET_NOTFOUND: u16 = 2;
pub const NET_WRONGARITY: u16 = 3;
pub const NET_NOTUS: u16 = 4;
pub const NET_SERVERERROR: u16 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    ReqGet = 0x20,
    RespGet = 0x21,
    ReqPut = 0x22,
    RespPut = 0x23,
    ReqDel = 0x24,
    RespDel = 0x25,
    ReqUpdate = 0x26,
    RespUpdate = 0x27,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x20 => Some(MessageType::ReqGet),
            0x21 => Some(MessageType::RespGet),
            0x22 => Some(MessageType::ReqPut),
            0x23 => Some(MessageType::RespPut),
            0x24 => Some(MessageType::ReqDel),
            0x25 => Some(MessageType::RespDel),
            0x26 => Some(MessageType::ReqUpdate),
            0x27 => Some(MessageType::RespUpdate),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::ReqGet => "REQ_GET",
            MessageType::RespGet => "RESP_GET",
            MessageType::ReqPut => "REQ_PUT",
            MessageType::RespPut => "RESP_PUT",
            MessageType::ReqDel => "REQ_DEL",
            MessageType::RespDel => "RESP_DEL",
            MessageType::ReqUpdate => "REQ_UPDATE",
            MessageType::RespUpdate => "RESP_UPDATE",
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer closed the channel")]
    Closed,
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    TooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("frame length invalid: {reason}")]
    LengthInvalid { reason: String },
}

/// Parsed frame header. The type is kept raw so an unrecognized code can
/// still be matched against a pending operation and rejected there.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: u8,
    pub from_version: u16,
    pub to_version: u16,
    pub from: EntityId,
    pub to: EntityId,
    pub nonce: u32,
}

/// Encode a request frame. The length field counts the entire frame,
/// itself included. Clients have no inbound incarnation, so
/// `from_version` is always 0.
pub fn encode_request(
    msg_type: MessageType,
    from: &EntityId,
    to: &EntityId,
    to_version: u16,
    nonce: u32,
    body: &[u8],
) -> Vec<u8> {
    let size = FRAME_HEADER_LEN + body.len();
    let mut buf = Vec::with_capacity(size);
    put_u32(&mut buf, size as u32);
    buf.push(msg_type.as_u8());
    put_u16(&mut buf, 0);
    put_u16(&mut buf, to_version);
    from.encode(&mut buf);
    to.encode(&mut buf);
    put_u32(&mut buf, nonce);
    buf.extend_from_slice(body);
    buf
}

/// Encode a reply frame the way storage nodes do: the length prefix
/// counts the bytes that follow it, and `to_version` is always 0.
pub fn encode_reply(
    msg_type: MessageType,
    from_version: u16,
    from: &EntityId,
    to: &EntityId,
    nonce: u32,
    body: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    put_u32(&mut buf, (FRAME_HEADER_LEN - 4 + body.len()) as u32);
    buf.push(msg_type.as_u8());
    put_u16(&mut buf, from_version);
    put_u16(&mut buf, 0);
    from.encode(&mut buf);
    to.encode(&mut buf);
    put_u32(&mut buf, nonce);
    buf.extend_from_slice(body);
    buf
}

/// Decode a request frame as a storage node would. Expects the complete
/// frame, length prefix included.
pub fn decode_request(frame: &[u8]) -> Result<(FrameHeader, Bytes), FrameError> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(FrameError::LengthInvalid {
            reason: format!("{} bytes cannot hold a header", frame.len()),
        });
    }
    let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if declared != frame.len() {
        return Err(FrameError::LengthInvalid {
            reason: format!("declared {declared} bytes, frame is {}", frame.len()),
        });
    }
    parse_frame(frame.to_vec())
}

pub enum ReplyRead {
    /// Fewer than 4 bytes buffered; try again after the next readiness
    /// event.
    NotReady,
    Frame { header: FrameHeader, body: Bytes },
}

/// Read one reply frame without ever blocking on a partial one. Peeks the
/// 4-byte length prefix with `MSG_PEEK | MSG_DONTWAIT`; the prefix counts
/// the bytes that follow it, so the full frame is prefix + 4.
pub fn read_reply(stream: &TcpStream, max_frame_bytes: usize) -> Result<ReplyRead, FrameError> {
    let mut prefix = [0u8; 4];
    let peeked = match socket::recv(
        stream.as_raw_fd(),
        &mut prefix,
        MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT,
    ) {
        Ok(n) => n,
        Err(Errno::EAGAIN) => return Ok(ReplyRead::NotReady),
        Err(err) => return Err(std::io::Error::from(err).into()),
    };
    if peeked == 0 {
        return Err(FrameError::Closed);
    }
    if peeked < 4 {
        return Ok(ReplyRead::NotReady);
    }

    let size = u32::from_be_bytes(prefix) as usize + 4;
    if size > max_frame_bytes {
        return Err(FrameError::TooLarge {
            max_frame_bytes,
            got_bytes: size,
        });
    }
    if size < FRAME_HEADER_LEN {
        return Err(FrameError::LengthInvalid {
            reason: format!("reply of {size} bytes cannot hold a header"),
        });
    }

    let mut frame = vec![0u8; size];
    let mut reader = stream;
    reader.read_exact(&mut frame)?;
    let (header, body) = parse_frame(frame)?;
    Ok(ReplyRead::Frame { header, body })
}

fn parse_frame(frame: Vec<u8>) -> Result<(FrameHeader, Bytes), FrameError> {
    let mut ent = [0u8; EntityId::SERIALIZED_LEN];

    let msg_type = frame[4];
    let from_version = u16::from_be_bytes([frame[5], frame[6]]);
    let to_version = u16::from_be_bytes([frame[7], frame[8]]);
    ent.copy_from_slice(&frame[9..9 + EntityId::SERIALIZED_LEN]);
    let from = EntityId::decode(&ent);
    let to_off = 9 + EntityId::SERIALIZED_LEN;
    ent.copy_from_slice(&frame[to_off..to_off + EntityId::SERIALIZED_LEN]);
    let to = EntityId::decode(&ent);
    let nonce_off = to_off + EntityId::SERIALIZED_LEN;
    let nonce = u32::from_be_bytes([
        frame[nonce_off],
        frame[nonce_off + 1],
        frame[nonce_off + 2],
        frame[nonce_off + 3],
    ]);

    let header = FrameHeader {
        msg_type,
        from_version,
        to_version,
        from,
        to,
        nonce,
    };
    let body = Bytes::from(frame).slice(FRAME_HEADER_LEN..);
    Ok((header, body))
}
