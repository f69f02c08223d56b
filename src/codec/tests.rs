//! MQTT Codec Tests
//!
//! Encoding and decoding of every v3.1 / v3.1.1 packet type, plus the
//! streaming behavior of the decoder on split and malformed input.

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

use crate::codec::{
    read_variable_int, variable_int_len, write_variable_int, DecodeState, Decoder, Encoder,
    MAX_REMAINING_LENGTH,
};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, EncodeError, Packet, ProtocolVersion,
    PubAck, PubComp, PubRec, PubRel, Publish, QoS, SubAck, SubAckReturnCode, Subscribe,
    SubscribeTopic, UnsubAck, Unsubscribe, Will,
};

// ============================================================================
// Helper functions
// ============================================================================

fn encode_packet(packet: &Packet, version: ProtocolVersion) -> BytesMut {
    let encoder = Encoder::new(version);
    let mut buf = BytesMut::new();
    encoder.encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(bytes: &[u8]) -> Result<Option<Packet>, DecodeError> {
    let mut decoder = Decoder::new();
    let mut buf = BytesMut::from(bytes);
    decoder.decode(&mut buf)
}

fn decode_complete(bytes: &[u8]) -> Packet {
    decode_packet(bytes).unwrap().expect("complete frame")
}

// ============================================================================
// Remaining length
// ============================================================================

#[test]
fn test_variable_int_boundaries() {
    let cases: [(u32, &[u8]); 8] = [
        (0, &[0x00]),
        (127, &[0x7F]),
        (128, &[0x80, 0x01]),
        (16_383, &[0xFF, 0x7F]),
        (16_384, &[0x80, 0x80, 0x01]),
        (2_097_151, &[0xFF, 0xFF, 0x7F]),
        (2_097_152, &[0x80, 0x80, 0x80, 0x01]),
        (268_435_455, &[0xFF, 0xFF, 0xFF, 0x7F]),
    ];

    for (value, expected) in cases {
        let mut buf = BytesMut::new();
        let written = write_variable_int(&mut buf, value).unwrap();
        assert_eq!(&buf[..], expected, "encoding of {}", value);
        assert_eq!(written, variable_int_len(value));
        assert_eq!(read_variable_int(expected).unwrap(), (value, expected.len()));
    }
}

#[test]
fn test_variable_int_above_max_rejected() {
    let mut buf = BytesMut::new();
    assert_eq!(
        write_variable_int(&mut buf, MAX_REMAINING_LENGTH as u32 + 1),
        Err(EncodeError::PacketTooLarge)
    );
    assert!(buf.is_empty());
}

#[test]
fn test_variable_int_five_bytes_rejected() {
    assert_eq!(
        read_variable_int(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
        Err(DecodeError::InvalidRemainingLength)
    );
}

proptest! {
    #[test]
    fn prop_variable_int_round_trip(n in 0u32..=268_435_455u32) {
        let mut buf = BytesMut::new();
        let written = write_variable_int(&mut buf, n).unwrap();
        prop_assert!(written <= 4);
        prop_assert_eq!(read_variable_int(&buf).unwrap(), (n, written));
    }
}

// ============================================================================
// Streaming decoder
// ============================================================================

#[test]
fn test_decode_empty_buffer_needs_more_data() {
    assert_eq!(decode_packet(&[]), Ok(None));
}

#[test]
fn test_decode_declared_length_exceeds_supplied_bytes() {
    // PUBLISH QoS 0, remaining length 10 but only 6 payload bytes present
    let bytes = [0x30, 0x0A, 0x00, 0x03, b'a', b'/', b'b', b'x'];
    let mut decoder = Decoder::new();
    let mut buf = BytesMut::from(&bytes[..]);

    assert_eq!(decoder.decode(&mut buf), Ok(None));
    assert_eq!(
        decoder.state(),
        DecodeState::AwaitingPayload {
            header: 0x30,
            remaining: 10
        }
    );

    // The rest arrives later and completes the frame
    buf.extend_from_slice(b"yzw");
    assert_eq!(decoder.decode(&mut buf), Ok(None));
    buf.extend_from_slice(b"v");
    let packet = decoder.decode(&mut buf).unwrap().unwrap();
    match packet {
        Packet::Publish(p) => {
            assert_eq!(&*p.topic, "a/b");
            assert_eq!(p.payload, Bytes::from_static(b"xyzwv"));
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }
    assert_eq!(decoder.state(), DecodeState::AwaitingHeader);
}

#[test]
fn test_decode_byte_at_a_time() {
    let packet = Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        packet_id: Some(7),
        ..Publish::new("sensors/7/temp", "21.5", QoS::AtLeastOnce, false)
    });
    let encoded = encode_packet(&packet, ProtocolVersion::V311);

    let mut decoder = Decoder::new();
    let mut buf = BytesMut::new();
    let mut decoded = None;
    for (i, byte) in encoded.iter().enumerate() {
        buf.extend_from_slice(&[*byte]);
        let result = decoder.decode(&mut buf).unwrap();
        if i + 1 < encoded.len() {
            assert!(result.is_none(), "frame completed early at byte {}", i);
        } else {
            decoded = result;
        }
    }
    assert_eq!(decoded, Some(packet));
}

#[test]
fn test_decode_two_frames_in_one_buffer() {
    let mut buf = encode_packet(&Packet::PingReq, ProtocolVersion::V311);
    buf.extend_from_slice(&encode_packet(
        &Packet::PubAck(PubAck::new(3)),
        ProtocolVersion::V311,
    ));

    let mut decoder = Decoder::new();
    assert_eq!(decoder.decode(&mut buf).unwrap(), Some(Packet::PingReq));
    assert_eq!(
        decoder.decode(&mut buf).unwrap(),
        Some(Packet::PubAck(PubAck::new(3)))
    );
    assert_eq!(decoder.decode(&mut buf).unwrap(), None);
}

#[test]
fn test_decode_field_past_remaining_length() {
    // PUBLISH whose topic length prefix claims 16 bytes inside a 4 byte frame
    let bytes = [0x30, 0x04, 0x00, 0x10, b'a', b'b'];
    assert_eq!(decode_packet(&bytes), Err(DecodeError::ReadPastEnd));
}

#[test]
fn test_decode_qos3_rejected() {
    let bytes = [0x36, 0x05, 0x00, 0x01, b'a', 0x00, 0x01];
    assert_eq!(decode_packet(&bytes), Err(DecodeError::InvalidQoS(3)));
}

#[test]
fn test_decode_fifth_length_byte_rejected() {
    let bytes = [0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
    assert_eq!(
        decode_packet(&bytes),
        Err(DecodeError::InvalidRemainingLength)
    );
}

#[test]
fn test_decode_packet_too_large() {
    let mut decoder = Decoder::new().with_max_packet_size(16);
    let mut buf = BytesMut::from(&[0x30, 0x20][..]);
    assert_eq!(decoder.decode(&mut buf), Err(DecodeError::PacketTooLarge));
    assert_eq!(decoder.state(), DecodeState::AwaitingHeader);
}

#[test]
fn test_packet_size_limit_excludes_fixed_header() {
    // Remaining length 16 (2 + "t" + 13 payload bytes), 18 bytes on the wire
    let mut frame = vec![0x30, 0x10, 0x00, 0x01, b't'];
    frame.extend_from_slice(&[b'x'; 13]);

    let mut decoder = Decoder::new().with_max_packet_size(16);
    let mut buf = BytesMut::from(&frame[..]);
    assert!(matches!(decoder.decode(&mut buf), Ok(Some(Packet::Publish(_)))));

    let mut decoder = Decoder::new().with_max_packet_size(15);
    let mut buf = BytesMut::from(&frame[..]);
    assert_eq!(decoder.decode(&mut buf), Err(DecodeError::PacketTooLarge));
}

#[test]
fn test_decode_invalid_packet_type() {
    assert_eq!(
        decode_packet(&[0x00, 0x00]),
        Err(DecodeError::InvalidPacketType(0))
    );
    assert_eq!(
        decode_packet(&[0xF0, 0x00]),
        Err(DecodeError::InvalidPacketType(15))
    );
}

#[test]
fn test_decode_trailing_bytes_rejected() {
    // PUBACK with one extra byte
    let bytes = [0x40, 0x03, 0x00, 0x01, 0xFF];
    assert!(matches!(
        decode_packet(&bytes),
        Err(DecodeError::MalformedPacket(_))
    ));
}

// ============================================================================
// CONNECT
// ============================================================================

#[test]
fn test_connect_v311_minimal() {
    let packet = Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V311,
        client_id: String::new(),
        clean_session: true,
        keep_alive: 60,
        username: None,
        password: None,
        will: None,
    }));

    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    assert_eq!(&encoded[2..8], b"\x00\x04MQTT");
    assert_eq!(encoded[8], 4);
    assert_eq!(decode_complete(&encoded), packet);
}

#[test]
fn test_connect_v31_full() {
    let packet = Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V31,
        client_id: "legacy-device".to_string(),
        clean_session: false,
        keep_alive: 300,
        username: Some("user".to_string()),
        password: Some(Bytes::from("password")),
        will: Some(Will {
            topic: "devices/legacy/status".to_string(),
            payload: Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
    }));

    let encoded = encode_packet(&packet, ProtocolVersion::V31);
    assert_eq!(&encoded[2..10], b"\x00\x06MQIsdp");
    assert_eq!(encoded[10], 3);
    assert_eq!(decode_complete(&encoded), packet);
}

#[test]
fn test_connect_invalid_protocol_name() {
    let bytes = [
        0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'X', b'X', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x00,
    ];
    let err = decode_packet(&bytes).unwrap_err();
    assert_eq!(err, DecodeError::InvalidProtocolName);
    assert!(err.is_unacceptable_protocol());
}

#[test]
fn test_connect_level_mismatch_rejected() {
    // "MQTT" is only valid at level 4
    let bytes = [
        0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x03, 0x02, 0x00, 0x3C, 0x00, 0x00,
    ];
    let err = decode_packet(&bytes).unwrap_err();
    assert_eq!(err, DecodeError::InvalidProtocolVersion(3));
    assert!(err.is_unacceptable_protocol());

    let bytes = [
        0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x05, 0x02, 0x00, 0x3C, 0x00, 0x00,
    ];
    assert_eq!(
        decode_packet(&bytes),
        Err(DecodeError::InvalidProtocolVersion(5))
    );
}

#[test]
fn test_connect_reserved_bit_set() {
    let bytes = [
        0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x03, 0x00, 0x3C, 0x00, 0x00,
    ];
    assert_eq!(decode_packet(&bytes), Err(DecodeError::InvalidFlags));
}

#[test]
fn test_connect_will_qos_invalid() {
    // will flag + will QoS 3
    let bytes = [
        0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x1E, 0x00, 0x3C, 0x00, 0x00,
    ];
    assert_eq!(decode_packet(&bytes), Err(DecodeError::InvalidQoS(3)));
}

#[test]
fn test_connect_will_flags_without_will() {
    // will retain without will flag
    let bytes = [
        0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x22, 0x00, 0x3C, 0x00, 0x00,
    ];
    assert_eq!(decode_packet(&bytes), Err(DecodeError::InvalidFlags));
}

#[test]
fn test_connect_password_without_username() {
    let bytes = [
        0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x42, 0x00, 0x3C, 0x00, 0x00,
    ];
    assert_eq!(decode_packet(&bytes), Err(DecodeError::InvalidFlags));
}

#[test]
fn test_connect_truncated_client_id() {
    // Client id length says 5 but the frame ends after 2 bytes
    let bytes = [
        0x10, 0x0E, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x05, b'a',
        b'b',
    ];
    assert_eq!(decode_packet(&bytes), Err(DecodeError::ReadPastEnd));
}

// ============================================================================
// CONNACK
// ============================================================================

#[test]
fn test_connack_v311_session_present() {
    let packet = Packet::ConnAck(ConnAck {
        session_present: true,
        return_code: ConnectReturnCode::Accepted,
    });
    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    assert_eq!(&encoded[..], &[0x20, 0x02, 0x01, 0x00]);
    assert_eq!(decode_complete(&encoded), packet);
}

#[test]
fn test_connack_v31_never_sets_session_present() {
    let packet = Packet::ConnAck(ConnAck {
        session_present: true,
        return_code: ConnectReturnCode::Accepted,
    });
    let encoded = encode_packet(&packet, ProtocolVersion::V31);
    assert_eq!(&encoded[..], &[0x20, 0x02, 0x00, 0x00]);
}

#[test]
fn test_connack_all_return_codes() {
    let codes = [
        (ConnectReturnCode::Accepted, 0),
        (ConnectReturnCode::UnacceptableProtocolVersion, 1),
        (ConnectReturnCode::IdentifierRejected, 2),
        (ConnectReturnCode::ServerUnavailable, 3),
        (ConnectReturnCode::BadUsernameOrPassword, 4),
        (ConnectReturnCode::NotAuthorized, 5),
    ];
    for (code, byte) in codes {
        let encoded = encode_packet(
            &Packet::ConnAck(ConnAck::refused(code)),
            ProtocolVersion::V311,
        );
        assert_eq!(encoded[3], byte);
        assert_eq!(ConnectReturnCode::from_u8(byte), Some(code));
    }
}

// ============================================================================
// PUBLISH
// ============================================================================

#[test]
fn test_publish_qos0_bytes() {
    let packet = Packet::Publish(Publish::new("a/b", "hi", QoS::AtMostOnce, false));
    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    assert_eq!(
        &encoded[..],
        &[0x30, 0x07, 0x00, 0x03, b'a', b'/', b'b', b'h', b'i']
    );
    assert_eq!(decode_complete(&encoded), packet);
}

#[test]
fn test_publish_qos2_dup_retain() {
    let packet = Packet::Publish(Publish {
        dup: true,
        qos: QoS::ExactlyOnce,
        retain: true,
        topic: "status/7".into(),
        packet_id: Some(0x1234),
        payload: Bytes::from_static(b"online"),
    });
    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    assert_eq!(encoded[0], 0x3D);
    assert_eq!(decode_complete(&encoded), packet);
}

#[test]
fn test_publish_empty_payload() {
    let packet = Packet::Publish(Publish::new("status/7", Bytes::new(), QoS::AtMostOnce, true));
    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    assert_eq!(decode_complete(&encoded), packet);
}

#[test]
fn test_publish_without_packet_id_fails_to_encode() {
    let packet = Packet::Publish(Publish::new("a", "x", QoS::AtLeastOnce, false));
    let mut buf = BytesMut::new();
    assert_eq!(
        Encoder::default().encode(&packet, &mut buf),
        Err(EncodeError::MissingPacketId)
    );
}

#[test]
fn test_publish_dup_must_be_zero_for_qos0() {
    let bytes = [0x38, 0x03, 0x00, 0x01, b'a'];
    assert!(matches!(
        decode_packet(&bytes),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_publish_topic_with_wildcard_invalid() {
    for topic in [&b"a/+"[..], &b"a/#"[..]] {
        let mut bytes = vec![0x30, 2 + topic.len() as u8, 0x00, topic.len() as u8];
        bytes.extend_from_slice(topic);
        assert_eq!(
            decode_packet(&bytes),
            Err(DecodeError::MalformedPacket("topic contains wildcard"))
        );
    }
}

#[test]
fn test_publish_empty_topic_invalid() {
    let bytes = [0x30, 0x03, 0x00, 0x00, b'x'];
    assert_eq!(
        decode_packet(&bytes),
        Err(DecodeError::MalformedPacket("empty topic name"))
    );
}

#[test]
fn test_publish_packet_id_zero_invalid() {
    let bytes = [0x32, 0x05, 0x00, 0x01, b'a', 0x00, 0x00];
    assert_eq!(
        decode_packet(&bytes),
        Err(DecodeError::MalformedPacket("packet id cannot be 0"))
    );
}

// ============================================================================
// Acknowledgments
// ============================================================================

#[test]
fn test_ack_packets() {
    let cases = [
        (Packet::PubAck(PubAck::new(1)), 0x40),
        (Packet::PubRec(PubRec::new(2)), 0x50),
        (Packet::PubRel(PubRel::new(3)), 0x62),
        (Packet::PubComp(PubComp::new(4)), 0x70),
        (Packet::UnsubAck(UnsubAck::new(5)), 0xB0),
    ];
    for (packet, header) in cases {
        let encoded = encode_packet(&packet, ProtocolVersion::V311);
        assert_eq!(encoded.len(), 4);
        assert_eq!(encoded[0], header);
        assert_eq!(decode_complete(&encoded), packet);
    }
}

#[test]
fn test_pubrel_invalid_flags() {
    assert_eq!(
        decode_packet(&[0x60, 0x02, 0x00, 0x01]),
        Err(DecodeError::InvalidFlags)
    );
}

#[test]
fn test_puback_short_frame() {
    assert_eq!(
        decode_packet(&[0x40, 0x01, 0x00]),
        Err(DecodeError::ReadPastEnd)
    );
}

// ============================================================================
// SUBSCRIBE / SUBACK
// ============================================================================

#[test]
fn test_subscribe_multiple_topics() {
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 10,
        topics: vec![
            SubscribeTopic {
                filter: "sensors/+/temp".to_string(),
                qos: QoS::AtLeastOnce,
            },
            SubscribeTopic {
                filter: "status/#".to_string(),
                qos: QoS::ExactlyOnce,
            },
        ],
    });
    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    assert_eq!(encoded[0], 0x82);
    assert_eq!(decode_complete(&encoded), packet);
}

#[test]
fn test_subscribe_invalid_flags() {
    let bytes = [0x80, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x00];
    assert_eq!(decode_packet(&bytes), Err(DecodeError::InvalidFlags));
}

#[test]
fn test_subscribe_empty_topics_invalid() {
    let bytes = [0x82, 0x02, 0x00, 0x01];
    assert!(matches!(
        decode_packet(&bytes),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_subscribe_requested_qos3_invalid() {
    let bytes = [0x82, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x03];
    assert_eq!(decode_packet(&bytes), Err(DecodeError::InvalidQoS(3)));
}

#[test]
fn test_subscribe_missing_qos_byte() {
    let bytes = [0x82, 0x05, 0x00, 0x01, 0x00, 0x01, b'a'];
    assert_eq!(decode_packet(&bytes), Err(DecodeError::ReadPastEnd));
}

#[test]
fn test_suback_with_failure() {
    let packet = Packet::SubAck(SubAck {
        packet_id: 10,
        return_codes: vec![
            SubAckReturnCode::Granted(QoS::AtLeastOnce),
            SubAckReturnCode::Failure,
            SubAckReturnCode::Granted(QoS::AtMostOnce),
        ],
    });
    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    assert_eq!(&encoded[..], &[0x90, 0x05, 0x00, 0x0A, 0x01, 0x80, 0x00]);
    assert_eq!(decode_complete(&encoded), packet);
}

// ============================================================================
// UNSUBSCRIBE
// ============================================================================

#[test]
fn test_unsubscribe_multiple_topics() {
    let packet = Packet::Unsubscribe(Unsubscribe {
        packet_id: 11,
        filters: vec!["a/+".to_string(), "b/#".to_string()],
    });
    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    assert_eq!(encoded[0], 0xA2);
    assert_eq!(decode_complete(&encoded), packet);
}

#[test]
fn test_unsubscribe_empty_topics_invalid() {
    assert!(matches!(
        decode_packet(&[0xA2, 0x02, 0x00, 0x01]),
        Err(DecodeError::MalformedPacket(_))
    ));
}

// ============================================================================
// PINGREQ / PINGRESP / DISCONNECT
// ============================================================================

#[test]
fn test_ping_and_disconnect() {
    for (packet, header) in [
        (Packet::PingReq, 0xC0),
        (Packet::PingResp, 0xD0),
        (Packet::Disconnect, 0xE0),
    ] {
        let encoded = encode_packet(&packet, ProtocolVersion::V311);
        assert_eq!(&encoded[..], &[header, 0x00]);
        assert_eq!(decode_complete(&encoded), packet);
    }
}

#[test]
fn test_pingreq_invalid_flags() {
    assert_eq!(
        decode_packet(&[0xC1, 0x00]),
        Err(DecodeError::InvalidFlags)
    );
}

#[test]
fn test_disconnect_with_payload_invalid() {
    assert!(matches!(
        decode_packet(&[0xE0, 0x01, 0x00]),
        Err(DecodeError::MalformedPacket(_))
    ));
}
