//! MQTT Packet Decoder
//!
//! Incremental decoder driven by an explicit state enum. Bytes are consumed
//! from the caller's `BytesMut` as they arrive, so a frame may be split
//! across any number of reads.

use bytes::{Buf, Bytes, BytesMut};

use super::{PayloadReader, DEFAULT_MAX_PACKET_SIZE, MAX_REMAINING_LENGTH, MAX_VARINT_BYTES};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PacketType, ProtocolVersion,
    PubAck, PubComp, PubRec, PubRel, Publish, QoS, SubAck, SubAckReturnCode, Subscribe,
    SubscribeTopic, UnsubAck, Unsubscribe, Will,
};

/// Where the decoder is inside the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Next byte is a fixed header
    AwaitingHeader,
    /// Reading the remaining-length varint
    AwaitingLength {
        header: u8,
        value: u32,
        multiplier: u32,
        bytes_read: usize,
    },
    /// Header and length known, waiting for `remaining` payload bytes
    AwaitingPayload { header: u8, remaining: usize },
}

/// MQTT Packet Decoder
#[derive(Debug)]
pub struct Decoder {
    state: DecodeState,
    /// Message-size limit applied to the remaining length
    max_packet_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitingHeader,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Decode the next frame from `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Consumed bytes are
    /// removed from `buf`; a partial frame's header and length stay in the
    /// decoder state.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, DecodeError> {
        let result = self.advance(buf);
        if result.is_err() {
            self.state = DecodeState::AwaitingHeader;
        }
        result
    }

    fn advance(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, DecodeError> {
        loop {
            match self.state {
                DecodeState::AwaitingHeader => {
                    if !buf.has_remaining() {
                        return Ok(None);
                    }
                    let header = buf.get_u8();
                    let kind = header >> 4;
                    if PacketType::from_u8(kind).is_none() {
                        return Err(DecodeError::InvalidPacketType(kind));
                    }
                    self.state = DecodeState::AwaitingLength {
                        header,
                        value: 0,
                        multiplier: 1,
                        bytes_read: 0,
                    };
                }
                DecodeState::AwaitingLength {
                    header,
                    value,
                    multiplier,
                    bytes_read,
                } => {
                    if !buf.has_remaining() {
                        return Ok(None);
                    }
                    let byte = buf.get_u8();
                    let value = value + ((byte & 0x7F) as u32) * multiplier;
                    let bytes_read = bytes_read + 1;

                    if (byte & 0x80) == 0 {
                        let remaining = value as usize;
                        if remaining > self.max_packet_size {
                            return Err(DecodeError::PacketTooLarge);
                        }
                        self.state = DecodeState::AwaitingPayload { header, remaining };
                    } else if bytes_read == MAX_VARINT_BYTES {
                        return Err(DecodeError::InvalidRemainingLength);
                    } else {
                        self.state = DecodeState::AwaitingLength {
                            header,
                            value,
                            multiplier: multiplier * 128,
                            bytes_read,
                        };
                    }
                }
                DecodeState::AwaitingPayload { header, remaining } => {
                    if buf.len() < remaining {
                        buf.reserve(remaining - buf.len());
                        return Ok(None);
                    }
                    let payload = buf.split_to(remaining).freeze();
                    self.state = DecodeState::AwaitingHeader;
                    return decode_packet(header, payload).map(Some);
                }
            }
        }
    }
}

/// Parse one complete frame body
pub(crate) fn decode_packet(header: u8, payload: Bytes) -> Result<Packet, DecodeError> {
    let kind = header >> 4;
    let flags = header & 0x0F;
    let packet_type = PacketType::from_u8(kind).ok_or(DecodeError::InvalidPacketType(kind))?;
    let mut r = PayloadReader::new(payload);

    let packet = match packet_type {
        PacketType::Connect => {
            expect_flags(flags, 0)?;
            decode_connect(&mut r)?
        }
        PacketType::ConnAck => {
            expect_flags(flags, 0)?;
            decode_connack(&mut r)?
        }
        PacketType::Publish => decode_publish(flags, &mut r)?,
        PacketType::PubAck => {
            expect_flags(flags, 0)?;
            Packet::PubAck(PubAck::new(r.read_u16()?))
        }
        PacketType::PubRec => {
            expect_flags(flags, 0)?;
            Packet::PubRec(PubRec::new(r.read_u16()?))
        }
        PacketType::PubRel => {
            expect_flags(flags, 0x02)?;
            Packet::PubRel(PubRel::new(r.read_u16()?))
        }
        PacketType::PubComp => {
            expect_flags(flags, 0)?;
            Packet::PubComp(PubComp::new(r.read_u16()?))
        }
        PacketType::Subscribe => {
            expect_flags(flags, 0x02)?;
            decode_subscribe(&mut r)?
        }
        PacketType::SubAck => {
            expect_flags(flags, 0)?;
            decode_suback(&mut r)?
        }
        PacketType::Unsubscribe => {
            expect_flags(flags, 0x02)?;
            decode_unsubscribe(&mut r)?
        }
        PacketType::UnsubAck => {
            expect_flags(flags, 0)?;
            Packet::UnsubAck(UnsubAck::new(r.read_u16()?))
        }
        PacketType::PingReq => {
            expect_flags(flags, 0)?;
            Packet::PingReq
        }
        PacketType::PingResp => {
            expect_flags(flags, 0)?;
            Packet::PingResp
        }
        PacketType::Disconnect => {
            expect_flags(flags, 0)?;
            Packet::Disconnect
        }
    };

    r.finish()?;
    Ok(packet)
}

#[inline]
fn expect_flags(flags: u8, expected: u8) -> Result<(), DecodeError> {
    if flags != expected {
        return Err(DecodeError::InvalidFlags);
    }
    Ok(())
}

/// Non-zero packet identifier
fn read_packet_id(r: &mut PayloadReader) -> Result<u16, DecodeError> {
    match r.read_u16()? {
        0 => Err(DecodeError::MalformedPacket("packet id cannot be 0")),
        id => Ok(id),
    }
}

fn decode_connect(r: &mut PayloadReader) -> Result<Packet, DecodeError> {
    let protocol_name = r.read_string()?;
    if protocol_name != "MQTT" && protocol_name != "MQIsdp" {
        return Err(DecodeError::InvalidProtocolName);
    }

    let level = r.read_u8()?;
    let protocol_version = ProtocolVersion::from_name_and_level(&protocol_name, level)
        .ok_or(DecodeError::InvalidProtocolVersion(level))?;

    let connect_flags = r.read_u8()?;

    // Reserved bit must be 0
    if (connect_flags & 0x01) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let clean_session = (connect_flags & 0x02) != 0;
    let will_flag = (connect_flags & 0x04) != 0;
    let will_qos = (connect_flags >> 3) & 0x03;
    let will_retain = (connect_flags & 0x20) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username_flag = (connect_flags & 0x80) != 0;

    if !username_flag && password_flag {
        return Err(DecodeError::InvalidFlags);
    }

    let will_qos = QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?;

    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(DecodeError::InvalidFlags);
    }

    let keep_alive = r.read_u16()?;
    let client_id = r.read_string()?;

    let will = if will_flag {
        let topic = r.read_string()?;
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(DecodeError::MalformedPacket("invalid will topic"));
        }
        let payload = r.read_binary()?;
        Some(Will {
            topic,
            payload,
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(r.read_string()?)
    } else {
        None
    };

    let password = if password_flag {
        Some(r.read_binary()?)
    } else {
        None
    };

    Ok(Packet::Connect(Box::new(Connect {
        protocol_version,
        client_id,
        clean_session,
        keep_alive,
        username,
        password,
        will,
    })))
}

fn decode_connack(r: &mut PayloadReader) -> Result<Packet, DecodeError> {
    let acknowledge_flags = r.read_u8()?;
    if (acknowledge_flags & 0xFE) != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    let code = r.read_u8()?;
    let return_code = ConnectReturnCode::from_u8(code)
        .ok_or(DecodeError::MalformedPacket("unknown CONNACK return code"))?;

    Ok(Packet::ConnAck(ConnAck {
        session_present: (acknowledge_flags & 0x01) != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, r: &mut PayloadReader) -> Result<Packet, DecodeError> {
    let dup = (flags & 0x08) != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = (flags & 0x01) != 0;

    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

    if qos == QoS::AtMostOnce && dup {
        return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
    }

    let topic = r.read_string()?;
    if topic.is_empty() {
        return Err(DecodeError::MalformedPacket("empty topic name"));
    }
    if topic.contains(['+', '#']) {
        return Err(DecodeError::MalformedPacket("topic contains wildcard"));
    }

    let packet_id = if qos != QoS::AtMostOnce {
        Some(read_packet_id(r)?)
    } else {
        None
    };

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: topic.into(),
        packet_id,
        payload: r.read_rest(),
    }))
}

fn decode_subscribe(r: &mut PayloadReader) -> Result<Packet, DecodeError> {
    let packet_id = read_packet_id(r)?;
    let mut topics = Vec::new();

    while !r.is_empty() {
        let filter = r.read_string()?;
        let requested = r.read_u8()?;
        if (requested & 0xFC) != 0 {
            return Err(DecodeError::MalformedPacket(
                "reserved bits set in requested QoS",
            ));
        }
        let qos = QoS::from_u8(requested).ok_or(DecodeError::InvalidQoS(requested))?;
        topics.push(SubscribeTopic { filter, qos });
    }

    if topics.is_empty() {
        return Err(DecodeError::MalformedPacket("SUBSCRIBE without topic filters"));
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, topics }))
}

fn decode_suback(r: &mut PayloadReader) -> Result<Packet, DecodeError> {
    let packet_id = r.read_u16()?;
    let mut return_codes = Vec::with_capacity(r.remaining());
    while !r.is_empty() {
        let code = r.read_u8()?;
        return_codes.push(
            SubAckReturnCode::from_u8(code)
                .ok_or(DecodeError::MalformedPacket("invalid SUBACK return code"))?,
        );
    }
    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(r: &mut PayloadReader) -> Result<Packet, DecodeError> {
    let packet_id = read_packet_id(r)?;
    let mut filters = Vec::new();
    while !r.is_empty() {
        filters.push(r.read_string()?);
    }
    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "UNSUBSCRIBE without topic filters",
        ));
    }
    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}
