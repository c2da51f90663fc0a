// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for node-to-node stream framing.
//!
//! A peer link is a single ordered stream carrying a sequence of frames:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: message type
//! - 8 bytes: query id (0 for frames that are not part of a query)
//! - N bytes: protobuf payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (64 MB)
/// Large enough for a full cluster data sync of a big installation
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Frame header size (4 bytes length + 2 bytes type + 8 bytes query id)
pub const HEADER_SIZE: usize = 14;

/// Message types for the wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// Authentication sent by the dialing node
    Auth = 1,
    /// Authentication result sent back by the accepting node
    AuthResult = 2,
    /// Fire-and-forget channel message
    Message = 3,
    /// Channel message expecting exactly one response
    Query = 4,
    /// Response to a query
    Response = 5,
    /// Error raised by the remote while handling a query
    Error = 6,
}

impl TryFrom<u16> for MessageType {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(MessageType::Auth),
            2 => Ok(MessageType::AuthResult),
            3 => Ok(MessageType::Message),
            4 => Ok(MessageType::Query),
            5 => Ok(MessageType::Response),
            6 => Ok(MessageType::Error),
            _ => Err(FrameError::InvalidMessageType(value)),
        }
    }
}

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("connection closed")]
    ConnectionClosed,
}

/// A framed message with type, query correlation id and payload
#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub query_id: u64,
    pub payload: Bytes,
}

impl Frame {
    /// Create a fire-and-forget message frame
    pub fn message<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Message, 0, msg)
    }

    /// Create a query frame correlated by `query_id`
    pub fn query<M: Message>(query_id: u64, msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Query, query_id, msg)
    }

    /// Create a response frame for `query_id`
    pub fn response<M: Message>(query_id: u64, msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Response, query_id, msg)
    }

    /// Create an error frame for `query_id` with a UTF-8 reason as payload
    pub fn error(query_id: u64, reason: &str) -> Self {
        Self {
            message_type: MessageType::Error,
            query_id,
            payload: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }

    /// Create a new frame with the given type and message
    pub fn new<M: Message>(
        message_type: MessageType,
        query_id: u64,
        msg: &M,
    ) -> Result<Self, FrameError> {
        let payload = msg.encode_to_vec();
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            message_type,
            query_id,
            payload: Bytes::from(payload),
        })
    }

    /// Decode the payload as a protobuf message
    pub fn decode<M: Message + Default>(&self) -> Result<M, FrameError> {
        Ok(M::decode(self.payload.clone())?)
    }

    /// Encode the frame to bytes for wire transmission
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.message_type as u16);
        buf.put_u64(self.query_id);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode a frame from bytes
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame header",
            )));
        }

        let length = bytes.get_u32() as usize;
        let message_type = MessageType::try_from(bytes.get_u16())?;
        let query_id = bytes.get_u64();

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }

        if bytes.len() < length {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            )));
        }

        let payload = bytes.split_to(length);
        Ok(Self {
            message_type,
            query_id,
            payload,
        })
    }
}

/// Write a frame to an async writer
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let encoded = frame.encode();
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame from an async reader
///
/// An unknown message type is reported only after the payload was consumed,
/// so the stream stays aligned on the next frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    // Read header
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let mut header = &header[..];
    let length = header.get_u32() as usize;
    let raw_type = header.get_u16();
    let query_id = header.get_u64();

    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    // Read payload
    let mut payload = vec![0u8; length];
    match reader.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    Ok(Frame {
        message_type: MessageType::try_from(raw_type)?,
        query_id,
        payload: Bytes::from(payload),
    })
}
