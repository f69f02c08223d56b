//! Protocol error types

use std::fmt;

/// Errors that can occur during packet decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data in buffer (helpers only; the streaming decoder waits instead)
    InsufficientData,
    /// A payload field would read past the declared remaining length
    ReadPastEnd,
    /// Invalid packet type
    InvalidPacketType(u8),
    /// Remaining length uses more than four bytes
    InvalidRemainingLength,
    /// Invalid protocol name
    InvalidProtocolName,
    /// Protocol level not valid for the given protocol name
    InvalidProtocolVersion(u8),
    /// Invalid QoS value
    InvalidQoS(u8),
    /// Invalid UTF-8 string
    InvalidUtf8,
    /// Invalid packet flags
    InvalidFlags,
    /// Malformed packet
    MalformedPacket(&'static str),
    /// Packet exceeds the configured size limit
    PacketTooLarge,
}

impl DecodeError {
    /// Whether the client should get CONNACK "unacceptable protocol version"
    /// before the connection is closed.
    pub fn is_unacceptable_protocol(&self) -> bool {
        matches!(
            self,
            Self::InvalidProtocolName | Self::InvalidProtocolVersion(_)
        )
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::ReadPastEnd => write!(f, "field read past declared remaining length"),
            Self::InvalidPacketType(t) => write!(f, "invalid packet type: {}", t),
            Self::InvalidRemainingLength => write!(f, "invalid remaining length encoding"),
            Self::InvalidProtocolName => write!(f, "invalid protocol name"),
            Self::InvalidProtocolVersion(v) => write!(f, "invalid protocol version: {}", v),
            Self::InvalidQoS(q) => write!(f, "invalid QoS value: {}", q),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::InvalidFlags => write!(f, "invalid packet flags"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => write!(f, "packet too large"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur during packet encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Remaining length above 268,435,455
    PacketTooLarge,
    /// String or binary field longer than 65,535 bytes
    StringTooLong,
    /// QoS > 0 publish without a packet identifier
    MissingPacketId,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string too long"),
            Self::MissingPacketId => write!(f, "missing packet identifier"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Broad error classes used to decide what a failure does to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Fatal to the connection
    ProtocolViolation,
    /// Reported through a return code
    AuthDenied,
    /// Size limits and queue overflow
    ResourceExhausted,
    /// Session store unreachable
    StorageUnavailable,
}

/// High-level protocol errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Decode error
    Decode(DecodeError),
    /// Encode error
    Encode(EncodeError),
    /// Protocol violation
    ProtocolViolation(&'static str),
    /// Credentials or ACL check failed
    AuthDenied,
    /// Outbound queue full or similar limit
    ResourceExhausted(&'static str),
    /// Session store backend failed
    StorageUnavailable,
    /// Keep alive timeout
    KeepAliveTimeout,
}

impl ProtocolError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Decode(DecodeError::PacketTooLarge) | Self::ResourceExhausted(_) => {
                ErrorClass::ResourceExhausted
            }
            Self::AuthDenied => ErrorClass::AuthDenied,
            Self::StorageUnavailable => ErrorClass::StorageUnavailable,
            Self::Decode(_)
            | Self::Encode(_)
            | Self::ProtocolViolation(_)
            | Self::KeepAliveTimeout => ErrorClass::ProtocolViolation,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::AuthDenied => write!(f, "not authorized"),
            Self::ResourceExhausted(msg) => write!(f, "resource exhausted: {}", msg),
            Self::StorageUnavailable => write!(f, "session storage unavailable"),
            Self::KeepAliveTimeout => write!(f, "keep alive timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        ProtocolError::Decode(e)
    }
}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        ProtocolError::Encode(e)
    }
}
