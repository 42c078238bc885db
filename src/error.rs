//! Error taxonomy.
//!
//! Codec errors are detected while encoding or decoding bytes; session
//! errors are detected while driving the connection. Receive-side errors of
//! either kind are fatal to the connection; `NoFreePacketId` is the one
//! error that leaves the connection open.

use crate::protocol::ControlType;
use thiserror::Error;

/// Errors produced by the packet codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),
    #[error("malformed remaining length")]
    MalformedRemainingLength,
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("reserved flag bits 0x{0:02X} set")]
    ReservedFlagSet(u8),
    #[error("reserved QoS value 3")]
    ReservedQos,
    #[error("unsupported for negotiated protocol version: {0}")]
    UnsupportedVersion(&'static str),
    #[error("duplicate property 0x{0:02X}")]
    DuplicateProperty(u8),
    #[error("property 0x{0:02X} not allowed for this packet type")]
    UnknownProperty(u8),
    #[error("packet exceeds maximum encodable size")]
    PayloadTooLarge,
}

/// Errors produced by the session engine and connection tasks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no free packet identifier")]
    NoFreePacketId,
    #[error("server rejected the negotiated protocol version (code 0x{code:02X})")]
    VersionMismatch { code: u8 },
    #[error("unexpected {0:?} packet for client session")]
    UnexpectedPacket(ControlType),
    #[error("CONNECT rejected with reason code 0x{code:02X}")]
    ConnectRejected { code: u8 },
    #[error("AUTH packet without authentication method")]
    AuthMethodMissing,
    #[error("keepalive timeout")]
    KeepaliveTimeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("codec failure: {0}")]
    Codec(#[from] CodecError),
    #[error("transport failure: {0}")]
    Transport(String),
}
