//! Wire-format coverage: byte-exact frames for both protocol versions,
//! round-trips for every packet family, and malformed-input rejection.

use photon::protocol::codec::{decode_frame, decode_packet, encode_packet, read_packet};
use photon::protocol::properties::{
    AckProperties, AuthProperties, ConnAckProperties, ConnectProperties, DisconnectProperties,
    PublishProperties, SubscribeProperties,
};
use photon::protocol::{
    AckPacket, AuthPacket, ConnAckPacket, ConnectPacket, ControlType, DisconnectPacket, Packet,
    ProtocolVersion, PublishPacket, Qos, SubAckPacket, SubscribePacket, TopicFilter,
    UnsubAckPacket, UnsubscribePacket, Will,
};
use photon::CodecError;

fn round_trip(packet: Packet, version: ProtocolVersion) {
    let frame = encode_packet(&packet, version).expect("encode");
    let decoded = decode_frame(version, &frame).expect("decode");
    assert_eq!(decoded, packet, "round trip under {version:?}");
}

#[test]
fn subscribe_v311_wire_format() {
    let packet = Packet::Subscribe(SubscribePacket {
        pid: 10,
        filters: vec![
            TopicFilter::new("a/b", Qos::AtLeastOnce),
            TopicFilter::new("c", Qos::ExactlyOnce),
        ],
        properties: SubscribeProperties::default(),
    });
    let frame = encode_packet(&packet, ProtocolVersion::V311).unwrap();
    assert_eq!(
        frame,
        [
            0x82, 0x0C, 0x00, 0x0A, 0x00, 0x03, 0x61, 0x2F, 0x62, 0x01, 0x00, 0x01, 0x63, 0x02
        ]
    );
    assert_eq!(decode_frame(ProtocolVersion::V311, &frame).unwrap(), packet);
}

#[test]
fn publish_v5_with_properties_wire_format() {
    let packet = Packet::Publish(PublishPacket {
        topic: "t".into(),
        payload: b"hi".to_vec(),
        qos: Qos::AtLeastOnce,
        pid: Some(1),
        dup: false,
        retain: false,
        properties: PublishProperties {
            payload_format_indicator: Some(1),
            user_properties: vec![("k".into(), "v".into())],
            ..Default::default()
        },
    });
    let frame = encode_packet(&packet, ProtocolVersion::V5).unwrap();
    assert_eq!(
        frame,
        [
            0x32, 0x11, 0x00, 0x01, 0x74, 0x00, 0x01, 0x09, 0x01, 0x01, 0x26, 0x00, 0x01, 0x6B,
            0x00, 0x01, 0x76, 0x68, 0x69
        ]
    );
    let decoded = decode_frame(ProtocolVersion::V5, &frame).unwrap();
    assert_eq!(decoded, packet);
}

#[test]
fn short_disconnect_decodes_and_reencodes_identically() {
    let frame = [0xE0u8, 0x00];
    let decoded = decode_frame(ProtocolVersion::V5, &frame).unwrap();
    let Packet::Disconnect(ref d) = decoded else {
        panic!("expected DISCONNECT");
    };
    assert_eq!(d.reason_code, 0);
    assert_eq!(d.properties, DisconnectProperties::default());
    assert_eq!(encode_packet(&decoded, ProtocolVersion::V5).unwrap(), frame);
}

#[test]
fn ping_frames() {
    assert_eq!(
        encode_packet(&Packet::PingReq, ProtocolVersion::V311).unwrap(),
        [0xC0, 0x00]
    );
    assert_eq!(
        encode_packet(&Packet::PingResp, ProtocolVersion::V5).unwrap(),
        [0xD0, 0x00]
    );
    assert_eq!(
        decode_frame(ProtocolVersion::V311, &[0xD0, 0x00]).unwrap(),
        Packet::PingResp
    );
}

#[test]
fn connect_round_trips() {
    let minimal = Packet::Connect(ConnectPacket {
        client_id: "c1".into(),
        keep_alive: 30,
        clean_start: true,
        ..Default::default()
    });
    round_trip(minimal, ProtocolVersion::V311);

    let full = Packet::Connect(ConnectPacket {
        client_id: "c2".into(),
        keep_alive: 10,
        clean_start: false,
        will: Some(Will {
            topic: "state/c2".into(),
            payload: b"gone".to_vec(),
            qos: Qos::AtLeastOnce,
            retain: true,
            properties: Default::default(),
        }),
        username: Some("user".into()),
        password: Some(b"secret".to_vec()),
        properties: Default::default(),
    });
    round_trip(full, ProtocolVersion::V311);

    let v5 = Packet::Connect(ConnectPacket {
        client_id: "c3".into(),
        keep_alive: 60,
        clean_start: true,
        will: Some(Will {
            topic: "state/c3".into(),
            payload: Vec::new(),
            qos: Qos::ExactlyOnce,
            retain: false,
            properties: photon::protocol::properties::WillProperties {
                delay_interval: Some(5),
                content_type: Some("text/plain".into()),
                ..Default::default()
            },
        }),
        username: None,
        password: None,
        properties: ConnectProperties {
            session_expiry_interval: Some(3600),
            receive_maximum: Some(16),
            user_properties: vec![("origin".into(), "test".into())],
            ..Default::default()
        },
    });
    round_trip(v5, ProtocolVersion::V5);
}

#[test]
fn connack_round_trips() {
    round_trip(
        Packet::ConnAck(ConnAckPacket {
            session_present: true,
            reason_code: 0,
            properties: Default::default(),
        }),
        ProtocolVersion::V311,
    );
    round_trip(
        Packet::ConnAck(ConnAckPacket {
            session_present: false,
            reason_code: 0,
            properties: ConnAckProperties {
                server_keep_alive: Some(45),
                assigned_client_id: Some("gen-1".into()),
                reason_string: Some("welcome".into()),
                ..Default::default()
            },
        }),
        ProtocolVersion::V5,
    );
}

#[test]
fn publish_round_trips() {
    for version in [ProtocolVersion::V311, ProtocolVersion::V5] {
        round_trip(
            Packet::Publish(PublishPacket {
                topic: "a".into(),
                payload: b"x".to_vec(),
                qos: Qos::AtMostOnce,
                pid: None,
                dup: false,
                retain: true,
                properties: Default::default(),
            }),
            version,
        );
        round_trip(
            Packet::Publish(PublishPacket {
                topic: "a/b".into(),
                payload: Vec::new(),
                qos: Qos::ExactlyOnce,
                pid: Some(9),
                dup: true,
                retain: false,
                properties: Default::default(),
            }),
            version,
        );
    }
}

#[test]
fn ack_family_round_trips() {
    for version in [ProtocolVersion::V311, ProtocolVersion::V5] {
        round_trip(Packet::PubAck(AckPacket::success(3)), version);
        round_trip(Packet::PubRec(AckPacket::success(4)), version);
        round_trip(Packet::PubRel(AckPacket::success(5)), version);
        round_trip(Packet::PubComp(AckPacket::success(6)), version);
    }
    round_trip(
        Packet::PubAck(AckPacket {
            pid: 7,
            reason_code: 0x10,
            properties: AckProperties {
                reason_string: Some("no subscribers".into()),
                user_properties: vec![("a".into(), "b".into())],
            },
        }),
        ProtocolVersion::V5,
    );
}

#[test]
fn ack_short_form_accepted() {
    // Two-byte body: reason defaults to success with no properties.
    let decoded = decode_frame(ProtocolVersion::V5, &[0x40, 0x02, 0x00, 0x07]).unwrap();
    assert_eq!(decoded, Packet::PubAck(AckPacket::success(7)));

    // Three-byte body: reason present, properties omitted.
    let decoded = decode_frame(ProtocolVersion::V5, &[0x50, 0x03, 0x00, 0x07, 0x92]).unwrap();
    assert_eq!(
        decoded,
        Packet::PubRec(AckPacket {
            pid: 7,
            reason_code: 0x92,
            properties: AckProperties::default(),
        })
    );
}

#[test]
fn subscribe_v5_options_round_trip() {
    round_trip(
        Packet::Subscribe(SubscribePacket {
            pid: 2,
            filters: vec![TopicFilter {
                filter: "sensors/#".into(),
                qos: Qos::AtLeastOnce,
                no_local: true,
                retain_as_published: true,
                retain_handling: 2,
            }],
            properties: SubscribeProperties {
                subscription_identifier: Some(12),
                user_properties: Vec::new(),
            },
        }),
        ProtocolVersion::V5,
    );
}

#[test]
fn suback_round_trips() {
    round_trip(
        Packet::SubAck(SubAckPacket {
            pid: 10,
            codes: vec![0x00, 0x01, 0x80],
            properties: Default::default(),
        }),
        ProtocolVersion::V311,
    );
    round_trip(
        Packet::SubAck(SubAckPacket {
            pid: 11,
            codes: vec![0x02, 0x9E],
            properties: AckProperties {
                reason_string: Some("partial".into()),
                user_properties: Vec::new(),
            },
        }),
        ProtocolVersion::V5,
    );
}

#[test]
fn unsubscribe_round_trips() {
    for version in [ProtocolVersion::V311, ProtocolVersion::V5] {
        round_trip(
            Packet::Unsubscribe(UnsubscribePacket {
                pid: 21,
                filters: vec!["a/b".into(), "c".into()],
                properties: Default::default(),
            }),
            version,
        );
    }
    round_trip(
        Packet::UnsubAck(UnsubAckPacket {
            pid: 21,
            codes: Vec::new(),
            properties: Default::default(),
        }),
        ProtocolVersion::V311,
    );
    round_trip(
        Packet::UnsubAck(UnsubAckPacket {
            pid: 22,
            codes: vec![0x00, 0x11],
            properties: Default::default(),
        }),
        ProtocolVersion::V5,
    );
}

#[test]
fn disconnect_and_auth_round_trips() {
    round_trip(
        Packet::Disconnect(DisconnectPacket::default()),
        ProtocolVersion::V311,
    );
    round_trip(
        Packet::Disconnect(DisconnectPacket {
            reason_code: 0x8D,
            properties: DisconnectProperties {
                reason_string: Some("keepalive timeout".into()),
                ..Default::default()
            },
        }),
        ProtocolVersion::V5,
    );
    round_trip(
        Packet::Auth(AuthPacket {
            reason_code: 0x18,
            properties: AuthProperties {
                auth_method: Some("SCRAM-SHA-1".into()),
                auth_data: Some(b"challenge".to_vec()),
                ..Default::default()
            },
        }),
        ProtocolVersion::V5,
    );
}

#[test]
fn auth_rejected_for_v311() {
    let err = decode_packet(ProtocolVersion::V311, 0xF0, &[]).unwrap_err();
    assert!(matches!(err, CodecError::UnsupportedVersion(_)));

    let packet = Packet::Auth(AuthPacket::default());
    assert!(matches!(
        encode_packet(&packet, ProtocolVersion::V311).unwrap_err(),
        CodecError::UnsupportedVersion(_)
    ));
}

#[test]
fn reserved_qos_rejected() {
    // PUBLISH flags with QoS bits set to 3.
    let err = decode_packet(ProtocolVersion::V311, 0x36, &[0x00, 0x01, b'a']).unwrap_err();
    assert_eq!(err, CodecError::ReservedQos);
}

#[test]
fn reserved_flags_rejected() {
    // SUBSCRIBE without its mandatory 0x02 flags.
    assert!(matches!(
        decode_packet(ProtocolVersion::V311, 0x80, &[0x00, 0x01]).unwrap_err(),
        CodecError::ReservedFlagSet(_)
    ));
    // PUBREL with plain flags.
    assert!(matches!(
        decode_packet(ProtocolVersion::V311, 0x60, &[0x00, 0x01]).unwrap_err(),
        CodecError::ReservedFlagSet(_)
    ));
}

#[test]
fn malformed_inputs_do_not_panic() {
    let cases: &[&[u8]] = &[
        &[],
        &[0x82, 0x02, 0x00],
        &[0x30, 0x01, 0xFF],
        &[0x82, 0x80, 0x80, 0x80, 0x80, 0x01],
        &[0x20, 0x02, 0x02, 0x00],
        &[0x90, 0x02, 0x00, 0x05],
        &[0xC0, 0x01, 0x00],
        &[0x10, 0x03, 0x00, 0x01, 0x4D],
    ];
    for (i, frame) in cases.iter().enumerate() {
        for version in [ProtocolVersion::V311, ProtocolVersion::V5] {
            assert!(
                decode_frame(version, frame).is_err(),
                "case {i} under {version:?} should fail"
            );
        }
    }
}

#[test]
fn subscribe_empty_payload_rejected() {
    // PID only, no topic filters.
    let err = decode_packet(ProtocolVersion::V311, 0x82, &[0x00, 0x01]).unwrap_err();
    assert_eq!(
        err,
        CodecError::MalformedPacket("SUBSCRIBE requires at least one topic filter")
    );
}

#[test]
fn publish_invalid_topic_rejected() {
    let bad_utf8 = [0x00u8, 0x02, 0xFF, 0xFE, 0x00];
    assert_eq!(
        decode_packet(ProtocolVersion::V311, 0x30, &bad_utf8).unwrap_err(),
        CodecError::InvalidUtf8
    );

    let packet = Packet::Publish(PublishPacket {
        topic: String::new(),
        ..Default::default()
    });
    assert!(encode_packet(&packet, ProtocolVersion::V311).is_err());
}

#[test]
fn connack_session_present_requires_success() {
    // Reason 0x80 with the session-present bit set.
    let err = decode_packet(ProtocolVersion::V311, 0x20, &[0x01, 0x80]).unwrap_err();
    assert!(matches!(err, CodecError::MalformedPacket(_)));
}

#[test]
fn zero_packet_identifier_rejected() {
    let err = decode_packet(ProtocolVersion::V311, 0x40, &[0x00, 0x00]).unwrap_err();
    assert_eq!(err, CodecError::MalformedPacket("zero packet identifier"));
}

#[tokio::test]
async fn read_packet_frames_from_stream() {
    let packet = Packet::SubAck(SubAckPacket {
        pid: 3,
        codes: vec![0x01],
        properties: Default::default(),
    });
    let mut bytes = encode_packet(&packet, ProtocolVersion::V311).unwrap();
    bytes.extend(encode_packet(&Packet::PingResp, ProtocolVersion::V311).unwrap());

    let mut stream: &[u8] = &bytes;
    assert_eq!(
        read_packet(&mut stream, ProtocolVersion::V311)
            .await
            .unwrap(),
        packet
    );
    assert_eq!(
        read_packet(&mut stream, ProtocolVersion::V311)
            .await
            .unwrap(),
        Packet::PingResp
    );
    assert!(read_packet(&mut stream, ProtocolVersion::V311).await.is_err());
    assert_eq!(packet.control_type(), ControlType::SubAck);
}
