//! Wire codec.
//!
//! Every packet serializes as `(control-type << 4) | flags`, a
//! variable-byte remaining length, the variable header, and the payload;
//! MQTT 5.0 inserts a property table between variable header and payload.
//! Encoding works on owned `Vec<u8>` frames, decoding on a borrowed body
//! slice with a cursor, and [`read_packet`] layers async fixed-header
//! framing on top for the receive loop.

use super::properties::{
    AckProperties, AuthProperties, ConnAckProperties, ConnectProperties, DisconnectProperties,
    PublishProperties, SubscribeProperties, UnsubscribeProperties, WillProperties,
};
use super::{
    valid_topic, AckPacket, AuthPacket, ConnAckPacket, ConnectPacket, ControlType,
    DisconnectPacket, Packet, ProtocolVersion, PublishPacket, Qos, SubAckPacket, SubscribePacket,
    TopicFilter, UnsubAckPacket, UnsubscribePacket, Will,
};
use crate::error::CodecError;
use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;

/// Largest value a four-byte variable-length integer can carry.
pub const MAX_REMAINING_LENGTH: u32 = 268_435_455;

const PROTOCOL_NAME: &str = "MQTT";

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

pub(crate) fn read_u8(buf: &[u8], cursor: &mut usize) -> Result<u8, CodecError> {
    let v = *buf
        .get(*cursor)
        .ok_or(CodecError::MalformedPacket("unexpected end of buffer"))?;
    *cursor += 1;
    Ok(v)
}

pub(crate) fn read_u16(buf: &[u8], cursor: &mut usize) -> Result<u16, CodecError> {
    if *cursor + 2 > buf.len() {
        return Err(CodecError::MalformedPacket("unexpected end of buffer"));
    }
    let v = u16::from_be_bytes([buf[*cursor], buf[*cursor + 1]]);
    *cursor += 2;
    Ok(v)
}

pub(crate) fn read_u32(buf: &[u8], cursor: &mut usize) -> Result<u32, CodecError> {
    if *cursor + 4 > buf.len() {
        return Err(CodecError::MalformedPacket("unexpected end of buffer"));
    }
    let v = u32::from_be_bytes([
        buf[*cursor],
        buf[*cursor + 1],
        buf[*cursor + 2],
        buf[*cursor + 3],
    ]);
    *cursor += 4;
    Ok(v)
}

/// Length-prefixed UTF-8 string. Embedded null characters are rejected
/// alongside invalid UTF-8, per the protocol's string rules.
pub(crate) fn read_string(buf: &[u8], cursor: &mut usize) -> Result<String, CodecError> {
    let bytes = read_binary(buf, cursor)?;
    let s = String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
    if s.contains('\u{0}') {
        return Err(CodecError::InvalidUtf8);
    }
    Ok(s)
}

pub(crate) fn read_binary(buf: &[u8], cursor: &mut usize) -> Result<Vec<u8>, CodecError> {
    let len = read_u16(buf, cursor)? as usize;
    if *cursor + len > buf.len() {
        return Err(CodecError::MalformedPacket("unexpected end of buffer"));
    }
    let bytes = buf[*cursor..*cursor + len].to_vec();
    *cursor += len;
    Ok(bytes)
}

pub(crate) fn write_string(out: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
    if s.contains('\u{0}') {
        return Err(CodecError::InvalidUtf8);
    }
    write_binary(out, s.as_bytes())
}

pub(crate) fn write_binary(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| CodecError::MalformedPacket("field exceeds 65535 bytes"))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

/// Decode a variable-length integer: 1-4 bytes, 7 payload bits each, high
/// bit as continuation. A fifth byte or truncated input is malformed.
pub(crate) fn decode_varint(buf: &[u8], cursor: &mut usize) -> Result<u32, CodecError> {
    let mut value = 0u32;
    for i in 0..4 {
        let byte = *buf
            .get(*cursor)
            .ok_or(CodecError::MalformedRemainingLength)?;
        *cursor += 1;
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CodecError::MalformedRemainingLength)
}

pub(crate) fn encode_varint(mut value: u32, out: &mut Vec<u8>) -> Result<(), CodecError> {
    if value > MAX_REMAINING_LENGTH {
        return Err(CodecError::MalformedRemainingLength);
    }
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return Ok(());
        }
    }
}

fn require_pid(pid: u16) -> Result<u16, CodecError> {
    if pid == 0 {
        return Err(CodecError::MalformedPacket("zero packet identifier"));
    }
    Ok(pid)
}

fn properties_block(
    version: ProtocolVersion,
    encode: impl FnOnce(&mut Vec<u8>) -> Result<(), CodecError>,
) -> Result<Vec<u8>, CodecError> {
    let mut table = Vec::new();
    if version == ProtocolVersion::V5 {
        let mut body = Vec::new();
        encode(&mut body)?;
        encode_varint(body.len() as u32, &mut table)?;
        table.extend(body);
    }
    Ok(table)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a packet for the negotiated protocol version.
pub fn encode_packet(packet: &Packet, version: ProtocolVersion) -> Result<Vec<u8>, CodecError> {
    let (first, body) = match packet {
        Packet::Connect(p) => ((ControlType::Connect as u8) << 4, encode_connect(p, version)?),
        Packet::ConnAck(p) => ((ControlType::ConnAck as u8) << 4, encode_connack(p, version)?),
        Packet::Publish(p) => encode_publish(p, version)?,
        Packet::PubAck(a) => ack_frame(ControlType::PubAck, a, version)?,
        Packet::PubRec(a) => ack_frame(ControlType::PubRec, a, version)?,
        Packet::PubRel(a) => ack_frame(ControlType::PubRel, a, version)?,
        Packet::PubComp(a) => ack_frame(ControlType::PubComp, a, version)?,
        Packet::Subscribe(p) => (
            (ControlType::Subscribe as u8) << 4 | 0x02,
            encode_subscribe(p, version)?,
        ),
        Packet::SubAck(p) => ((ControlType::SubAck as u8) << 4, encode_suback(p, version)?),
        Packet::Unsubscribe(p) => (
            (ControlType::Unsubscribe as u8) << 4 | 0x02,
            encode_unsubscribe(p, version)?,
        ),
        Packet::UnsubAck(p) => ((ControlType::UnsubAck as u8) << 4, encode_unsuback(p, version)?),
        Packet::PingReq => ((ControlType::PingReq as u8) << 4, Vec::new()),
        Packet::PingResp => ((ControlType::PingResp as u8) << 4, Vec::new()),
        Packet::Disconnect(p) => (
            (ControlType::Disconnect as u8) << 4,
            encode_disconnect(p, version)?,
        ),
        Packet::Auth(p) => ((ControlType::Auth as u8) << 4, encode_auth(p, version)?),
    };
    if body.len() > MAX_REMAINING_LENGTH as usize {
        return Err(CodecError::PayloadTooLarge);
    }
    let mut frame = Vec::with_capacity(body.len() + 5);
    frame.push(first);
    encode_varint(body.len() as u32, &mut frame)?;
    frame.extend(body);
    Ok(frame)
}

fn encode_connect(p: &ConnectPacket, version: ProtocolVersion) -> Result<Vec<u8>, CodecError> {
    let mut body = Vec::new();
    write_string(&mut body, PROTOCOL_NAME)?;
    body.push(version.level());

    let mut flags = 0u8;
    if p.clean_start {
        flags |= 0x02;
    }
    if let Some(will) = &p.will {
        flags |= 0x04;
        flags |= will.qos.bits() << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if p.password.is_some() {
        flags |= 0x40;
    }
    if p.username.is_some() {
        flags |= 0x80;
    }
    body.push(flags);
    body.extend_from_slice(&p.keep_alive.to_be_bytes());
    body.extend(properties_block(version, |out| p.properties.encode_into(out))?);

    write_string(&mut body, &p.client_id)?;
    if let Some(will) = &p.will {
        if !valid_topic(&will.topic) {
            return Err(CodecError::MalformedPacket("invalid will topic"));
        }
        body.extend(properties_block(version, |out| {
            will.properties.encode_into(out)
        })?);
        write_string(&mut body, &will.topic)?;
        write_binary(&mut body, &will.payload)?;
    }
    if let Some(username) = &p.username {
        write_string(&mut body, username)?;
    }
    if let Some(password) = &p.password {
        write_binary(&mut body, password)?;
    }
    Ok(body)
}

fn encode_connack(p: &ConnAckPacket, version: ProtocolVersion) -> Result<Vec<u8>, CodecError> {
    if p.reason_code != 0 && p.session_present {
        return Err(CodecError::MalformedPacket(
            "session present with non-zero reason code",
        ));
    }
    let mut body = vec![u8::from(p.session_present), p.reason_code];
    body.extend(properties_block(version, |out| p.properties.encode_into(out))?);
    Ok(body)
}

fn encode_publish(
    p: &PublishPacket,
    version: ProtocolVersion,
) -> Result<(u8, Vec<u8>), CodecError> {
    if !valid_topic(&p.topic) {
        return Err(CodecError::MalformedPacket("invalid topic name"));
    }
    let mut first = (ControlType::Publish as u8) << 4 | p.qos.bits() << 1;
    if p.retain {
        first |= 0x01;
    }
    if p.dup {
        if p.qos == Qos::AtMostOnce {
            return Err(CodecError::MalformedPacket("dup flag set for QoS 0"));
        }
        first |= 0x08;
    }

    let mut body = Vec::new();
    write_string(&mut body, &p.topic)?;
    match (p.qos, p.pid) {
        (Qos::AtMostOnce, None) => {}
        (Qos::AtMostOnce, Some(_)) => {
            return Err(CodecError::MalformedPacket("packet identifier for QoS 0"));
        }
        (_, Some(pid)) => body.extend_from_slice(&require_pid(pid)?.to_be_bytes()),
        (_, None) => {
            return Err(CodecError::MalformedPacket(
                "missing packet identifier for QoS > 0",
            ));
        }
    }
    body.extend(properties_block(version, |out| p.properties.encode_into(out))?);
    body.extend_from_slice(&p.payload);
    Ok((first, body))
}

/// PUBACK, PUBREC, PUBREL and PUBCOMP share one frame shape. MQTT 5.0
/// emits the full form (reason byte plus an empty property table) even for
/// success, matching the widest deployed behavior; the decoder accepts the
/// two-byte short form as well.
fn ack_frame(
    kind: ControlType,
    a: &AckPacket,
    version: ProtocolVersion,
) -> Result<(u8, Vec<u8>), CodecError> {
    let first = (kind as u8) << 4 | kind.required_flags();
    let mut body = require_pid(a.pid)?.to_be_bytes().to_vec();
    match version {
        ProtocolVersion::V311 => {
            if a.reason_code != 0 || !a.properties.is_empty() {
                return Err(CodecError::UnsupportedVersion(
                    "acknowledgement reason codes are v5-only",
                ));
            }
        }
        ProtocolVersion::V5 => {
            body.push(a.reason_code);
            body.extend(properties_block(version, |out| a.properties.encode_into(out))?);
        }
    }
    Ok((first, body))
}

fn encode_subscribe(p: &SubscribePacket, version: ProtocolVersion) -> Result<Vec<u8>, CodecError> {
    if p.filters.is_empty() {
        return Err(CodecError::MalformedPacket(
            "SUBSCRIBE requires at least one topic filter",
        ));
    }
    let mut body = require_pid(p.pid)?.to_be_bytes().to_vec();
    body.extend(properties_block(version, |out| p.properties.encode_into(out))?);
    for filter in &p.filters {
        if !valid_topic(&filter.filter) {
            return Err(CodecError::MalformedPacket("invalid topic filter"));
        }
        if filter.retain_handling > 2 {
            return Err(CodecError::MalformedPacket("invalid retain handling"));
        }
        write_string(&mut body, &filter.filter)?;
        let mut opts = filter.qos.bits();
        if version == ProtocolVersion::V5 {
            if filter.no_local {
                opts |= 0x04;
            }
            if filter.retain_as_published {
                opts |= 0x08;
            }
            opts |= filter.retain_handling << 4;
        }
        body.push(opts);
    }
    Ok(body)
}

fn encode_suback(p: &SubAckPacket, version: ProtocolVersion) -> Result<Vec<u8>, CodecError> {
    if p.codes.is_empty() {
        return Err(CodecError::MalformedPacket("SUBACK without reason codes"));
    }
    let mut body = require_pid(p.pid)?.to_be_bytes().to_vec();
    body.extend(properties_block(version, |out| p.properties.encode_into(out))?);
    body.extend_from_slice(&p.codes);
    Ok(body)
}

fn encode_unsubscribe(
    p: &UnsubscribePacket,
    version: ProtocolVersion,
) -> Result<Vec<u8>, CodecError> {
    if p.filters.is_empty() {
        return Err(CodecError::MalformedPacket(
            "UNSUBSCRIBE requires at least one topic filter",
        ));
    }
    let mut body = require_pid(p.pid)?.to_be_bytes().to_vec();
    body.extend(properties_block(version, |out| p.properties.encode_into(out))?);
    for filter in &p.filters {
        if !valid_topic(filter) {
            return Err(CodecError::MalformedPacket("invalid topic filter"));
        }
        write_string(&mut body, filter)?;
    }
    Ok(body)
}

fn encode_unsuback(p: &UnsubAckPacket, version: ProtocolVersion) -> Result<Vec<u8>, CodecError> {
    let mut body = require_pid(p.pid)?.to_be_bytes().to_vec();
    match version {
        ProtocolVersion::V311 => {
            if !p.codes.is_empty() || !p.properties.is_empty() {
                return Err(CodecError::UnsupportedVersion(
                    "UNSUBACK reason codes are v5-only",
                ));
            }
        }
        ProtocolVersion::V5 => {
            if p.codes.is_empty() {
                return Err(CodecError::MalformedPacket("UNSUBACK without reason codes"));
            }
            body.extend(properties_block(version, |out| p.properties.encode_into(out))?);
            body.extend_from_slice(&p.codes);
        }
    }
    Ok(body)
}

fn encode_disconnect(
    p: &DisconnectPacket,
    version: ProtocolVersion,
) -> Result<Vec<u8>, CodecError> {
    match version {
        ProtocolVersion::V311 => {
            if p.reason_code != 0 || !p.properties.is_empty() {
                return Err(CodecError::UnsupportedVersion(
                    "DISCONNECT reason codes are v5-only",
                ));
            }
            Ok(Vec::new())
        }
        ProtocolVersion::V5 => {
            // Success with no properties takes the two-byte short form.
            if p.reason_code == 0 && p.properties.is_empty() {
                return Ok(Vec::new());
            }
            let mut body = vec![p.reason_code];
            body.extend(properties_block(version, |out| p.properties.encode_into(out))?);
            Ok(body)
        }
    }
}

fn encode_auth(p: &AuthPacket, version: ProtocolVersion) -> Result<Vec<u8>, CodecError> {
    if version != ProtocolVersion::V5 {
        return Err(CodecError::UnsupportedVersion("AUTH is v5-only"));
    }
    let mut body = vec![p.reason_code];
    body.extend(properties_block(version, |out| p.properties.encode_into(out))?);
    Ok(body)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a packet body given its first byte and the negotiated version.
pub fn decode_packet(
    version: ProtocolVersion,
    first: u8,
    body: &[u8],
) -> Result<Packet, CodecError> {
    let nibble = first >> 4;
    let flags = first & 0x0F;
    let kind = ControlType::from_nibble(nibble)
        .ok_or(CodecError::MalformedPacket("control type 0 is reserved"))?;
    if kind != ControlType::Publish && flags != kind.required_flags() {
        return Err(CodecError::ReservedFlagSet(flags));
    }
    match kind {
        ControlType::Connect => decode_connect(version, body).map(Packet::Connect),
        ControlType::ConnAck => decode_connack(version, body).map(Packet::ConnAck),
        ControlType::Publish => decode_publish(version, flags, body).map(Packet::Publish),
        ControlType::PubAck => decode_ack(version, body).map(Packet::PubAck),
        ControlType::PubRec => decode_ack(version, body).map(Packet::PubRec),
        ControlType::PubRel => decode_ack(version, body).map(Packet::PubRel),
        ControlType::PubComp => decode_ack(version, body).map(Packet::PubComp),
        ControlType::Subscribe => decode_subscribe(version, body).map(Packet::Subscribe),
        ControlType::SubAck => decode_suback(version, body).map(Packet::SubAck),
        ControlType::Unsubscribe => decode_unsubscribe(version, body).map(Packet::Unsubscribe),
        ControlType::UnsubAck => decode_unsuback(version, body).map(Packet::UnsubAck),
        ControlType::PingReq => expect_empty(body).map(|()| Packet::PingReq),
        ControlType::PingResp => expect_empty(body).map(|()| Packet::PingResp),
        ControlType::Disconnect => decode_disconnect(version, body).map(Packet::Disconnect),
        ControlType::Auth => decode_auth(version, body).map(Packet::Auth),
    }
}

/// Decode a complete frame (fixed header included) from a slice. Used when
/// replaying persisted packets.
pub fn decode_frame(version: ProtocolVersion, frame: &[u8]) -> Result<Packet, CodecError> {
    let mut cursor = 0usize;
    let first = read_u8(frame, &mut cursor)?;
    let remaining = decode_varint(frame, &mut cursor)? as usize;
    if frame.len() != cursor + remaining {
        return Err(CodecError::MalformedPacket("frame length mismatch"));
    }
    decode_packet(version, first, &frame[cursor..])
}

fn expect_empty(body: &[u8]) -> Result<(), CodecError> {
    if !body.is_empty() {
        return Err(CodecError::MalformedPacket("unexpected payload"));
    }
    Ok(())
}

fn expect_consumed(body: &[u8], cursor: usize) -> Result<(), CodecError> {
    if cursor != body.len() {
        return Err(CodecError::MalformedPacket("trailing bytes"));
    }
    Ok(())
}

fn decode_connect(version: ProtocolVersion, body: &[u8]) -> Result<ConnectPacket, CodecError> {
    let mut cursor = 0usize;
    let name = read_string(body, &mut cursor)?;
    if name != PROTOCOL_NAME {
        return Err(CodecError::MalformedPacket("bad protocol name"));
    }
    let level = read_u8(body, &mut cursor)?;
    match ProtocolVersion::from_level(level) {
        Some(v) if v == version => {}
        Some(_) => {
            return Err(CodecError::MalformedPacket(
                "protocol level differs from negotiated version",
            ));
        }
        None => return Err(CodecError::UnsupportedVersion("unknown protocol level")),
    }
    let flags = read_u8(body, &mut cursor)?;
    if flags & 0x01 != 0 {
        return Err(CodecError::ReservedFlagSet(0x01));
    }
    let keep_alive = read_u16(body, &mut cursor)?;
    let properties = if version == ProtocolVersion::V5 {
        ConnectProperties::parse(body, &mut cursor)?
    } else {
        ConnectProperties::default()
    };

    let client_id = read_string(body, &mut cursor)?;
    let clean_start = flags & 0x02 != 0;
    let will_flag = flags & 0x04 != 0;
    let will_qos = Qos::from_bits((flags >> 3) & 0x03)?;
    let will_retain = flags & 0x20 != 0;
    if !will_flag && (will_qos != Qos::AtMostOnce || will_retain) {
        return Err(CodecError::MalformedPacket("will flags without will"));
    }
    let will = if will_flag {
        let will_properties = if version == ProtocolVersion::V5 {
            WillProperties::parse(body, &mut cursor)?
        } else {
            WillProperties::default()
        };
        let topic = read_string(body, &mut cursor)?;
        let payload = read_binary(body, &mut cursor)?;
        Some(Will {
            topic,
            payload,
            qos: will_qos,
            retain: will_retain,
            properties: will_properties,
        })
    } else {
        None
    };
    let username_flag = flags & 0x80 != 0;
    let password_flag = flags & 0x40 != 0;
    if version == ProtocolVersion::V311 && password_flag && !username_flag {
        return Err(CodecError::MalformedPacket("password without username"));
    }
    let username = if username_flag {
        Some(read_string(body, &mut cursor)?)
    } else {
        None
    };
    let password = if password_flag {
        Some(read_binary(body, &mut cursor)?)
    } else {
        None
    };
    expect_consumed(body, cursor)?;
    Ok(ConnectPacket {
        client_id,
        keep_alive,
        clean_start,
        will,
        username,
        password,
        properties,
    })
}

fn decode_connack(version: ProtocolVersion, body: &[u8]) -> Result<ConnAckPacket, CodecError> {
    let mut cursor = 0usize;
    let ack_flags = read_u8(body, &mut cursor)?;
    if ack_flags & !0x01 != 0 {
        return Err(CodecError::MalformedPacket("reserved session-present bits"));
    }
    let session_present = ack_flags & 0x01 != 0;
    let reason_code = read_u8(body, &mut cursor)?;
    if reason_code != 0 && session_present {
        return Err(CodecError::MalformedPacket(
            "session present with non-zero reason code",
        ));
    }
    let properties = if version == ProtocolVersion::V5 {
        ConnAckProperties::parse(body, &mut cursor)?
    } else {
        ConnAckProperties::default()
    };
    expect_consumed(body, cursor)?;
    Ok(ConnAckPacket {
        session_present,
        reason_code,
        properties,
    })
}

fn decode_publish(
    version: ProtocolVersion,
    flags: u8,
    body: &[u8],
) -> Result<PublishPacket, CodecError> {
    let dup = flags & 0x08 != 0;
    let retain = flags & 0x01 != 0;
    let qos = Qos::from_bits((flags >> 1) & 0x03)?;
    if qos == Qos::AtMostOnce && dup {
        return Err(CodecError::MalformedPacket("dup flag set for QoS 0"));
    }
    let mut cursor = 0usize;
    let topic = read_string(body, &mut cursor)?;
    if !valid_topic(&topic) {
        return Err(CodecError::MalformedPacket("invalid topic name"));
    }
    let pid = if qos == Qos::AtMostOnce {
        None
    } else {
        Some(require_pid(read_u16(body, &mut cursor)?)?)
    };
    let properties = if version == ProtocolVersion::V5 {
        PublishProperties::parse(body, &mut cursor)?
    } else {
        PublishProperties::default()
    };
    let payload = body[cursor..].to_vec();
    Ok(PublishPacket {
        topic,
        payload,
        qos,
        pid,
        dup,
        retain,
        properties,
    })
}

fn decode_ack(version: ProtocolVersion, body: &[u8]) -> Result<AckPacket, CodecError> {
    let mut cursor = 0usize;
    let pid = require_pid(read_u16(body, &mut cursor)?)?;
    let mut ack = AckPacket::success(pid);
    match version {
        ProtocolVersion::V311 => expect_consumed(body, cursor)?,
        ProtocolVersion::V5 => {
            // Remaining length of two is the success short form.
            if cursor < body.len() {
                ack.reason_code = read_u8(body, &mut cursor)?;
            }
            if cursor < body.len() {
                ack.properties = AckProperties::parse(body, &mut cursor)?;
            }
            expect_consumed(body, cursor)?;
        }
    }
    Ok(ack)
}

fn decode_subscribe(version: ProtocolVersion, body: &[u8]) -> Result<SubscribePacket, CodecError> {
    let mut cursor = 0usize;
    let pid = require_pid(read_u16(body, &mut cursor)?)?;
    let properties = if version == ProtocolVersion::V5 {
        SubscribeProperties::parse(body, &mut cursor)?
    } else {
        SubscribeProperties::default()
    };
    let mut filters = Vec::new();
    while cursor < body.len() {
        let filter = read_string(body, &mut cursor)?;
        if !valid_topic(&filter) {
            return Err(CodecError::MalformedPacket("invalid topic filter"));
        }
        let opts = read_u8(body, &mut cursor)?;
        if opts & 0xC0 != 0 {
            return Err(CodecError::MalformedPacket(
                "reserved subscription option bits",
            ));
        }
        if version == ProtocolVersion::V311 && opts & !0x03 != 0 {
            return Err(CodecError::MalformedPacket(
                "v5 subscription options in v3 packet",
            ));
        }
        let qos = Qos::from_bits(opts & 0x03)?;
        let retain_handling = (opts >> 4) & 0x03;
        if retain_handling > 2 {
            return Err(CodecError::MalformedPacket("invalid retain handling"));
        }
        filters.push(TopicFilter {
            filter,
            qos,
            no_local: opts & 0x04 != 0,
            retain_as_published: opts & 0x08 != 0,
            retain_handling,
        });
    }
    if filters.is_empty() {
        return Err(CodecError::MalformedPacket(
            "SUBSCRIBE requires at least one topic filter",
        ));
    }
    Ok(SubscribePacket {
        pid,
        filters,
        properties,
    })
}

fn decode_suback(version: ProtocolVersion, body: &[u8]) -> Result<SubAckPacket, CodecError> {
    let mut cursor = 0usize;
    let pid = require_pid(read_u16(body, &mut cursor)?)?;
    let properties = if version == ProtocolVersion::V5 {
        AckProperties::parse(body, &mut cursor)?
    } else {
        AckProperties::default()
    };
    let codes = body[cursor..].to_vec();
    if codes.is_empty() {
        return Err(CodecError::MalformedPacket("SUBACK without reason codes"));
    }
    Ok(SubAckPacket {
        pid,
        codes,
        properties,
    })
}

fn decode_unsubscribe(
    version: ProtocolVersion,
    body: &[u8],
) -> Result<UnsubscribePacket, CodecError> {
    let mut cursor = 0usize;
    let pid = require_pid(read_u16(body, &mut cursor)?)?;
    let properties = if version == ProtocolVersion::V5 {
        UnsubscribeProperties::parse(body, &mut cursor)?
    } else {
        UnsubscribeProperties::default()
    };
    let mut filters = Vec::new();
    while cursor < body.len() {
        let filter = read_string(body, &mut cursor)?;
        if !valid_topic(&filter) {
            return Err(CodecError::MalformedPacket("invalid topic filter"));
        }
        filters.push(filter);
    }
    if filters.is_empty() {
        return Err(CodecError::MalformedPacket(
            "UNSUBSCRIBE requires at least one topic filter",
        ));
    }
    Ok(UnsubscribePacket {
        pid,
        filters,
        properties,
    })
}

fn decode_unsuback(version: ProtocolVersion, body: &[u8]) -> Result<UnsubAckPacket, CodecError> {
    let mut cursor = 0usize;
    let pid = require_pid(read_u16(body, &mut cursor)?)?;
    let mut packet = UnsubAckPacket {
        pid,
        ..Default::default()
    };
    match version {
        ProtocolVersion::V311 => expect_consumed(body, cursor)?,
        ProtocolVersion::V5 => {
            packet.properties = AckProperties::parse(body, &mut cursor)?;
            packet.codes = body[cursor..].to_vec();
            if packet.codes.is_empty() {
                return Err(CodecError::MalformedPacket("UNSUBACK without reason codes"));
            }
        }
    }
    Ok(packet)
}

fn decode_disconnect(
    version: ProtocolVersion,
    body: &[u8],
) -> Result<DisconnectPacket, CodecError> {
    match version {
        ProtocolVersion::V311 => {
            expect_empty(body)?;
            Ok(DisconnectPacket::default())
        }
        ProtocolVersion::V5 => {
            let mut packet = DisconnectPacket::default();
            let mut cursor = 0usize;
            if cursor < body.len() {
                packet.reason_code = read_u8(body, &mut cursor)?;
            }
            if cursor < body.len() {
                packet.properties = DisconnectProperties::parse(body, &mut cursor)?;
            }
            expect_consumed(body, cursor)?;
            Ok(packet)
        }
    }
}

fn decode_auth(version: ProtocolVersion, body: &[u8]) -> Result<AuthPacket, CodecError> {
    if version != ProtocolVersion::V5 {
        return Err(CodecError::UnsupportedVersion("AUTH is v5-only"));
    }
    let mut packet = AuthPacket::default();
    let mut cursor = 0usize;
    if cursor < body.len() {
        packet.reason_code = read_u8(body, &mut cursor)?;
    }
    if cursor < body.len() {
        packet.properties = AuthProperties::parse(body, &mut cursor)?;
    }
    expect_consumed(body, cursor)?;
    Ok(packet)
}

// ---------------------------------------------------------------------------
// Stream framing
// ---------------------------------------------------------------------------

/// Read one packet from the stream: fixed header (one byte plus up to four
/// length bytes), then the body, then a body decode for the negotiated
/// version.
pub async fn read_packet<S: AsyncReadExt + Unpin>(
    stream: &mut S,
    version: ProtocolVersion,
) -> Result<Packet> {
    let mut first = [0u8; 1];
    stream
        .read_exact(&mut first)
        .await
        .context("reading fixed header")?;
    let remaining = read_remaining_length(stream).await?;
    let mut body = vec![0u8; remaining as usize];
    stream
        .read_exact(&mut body)
        .await
        .context("reading packet body")?;
    Ok(decode_packet(version, first[0], &body)?)
}

async fn read_remaining_length<S: AsyncReadExt + Unpin>(stream: &mut S) -> Result<u32> {
    let mut value = 0u32;
    for i in 0..4 {
        let mut buf = [0u8; 1];
        stream
            .read_exact(&mut buf)
            .await
            .context("reading remaining length")?;
        value |= u32::from(buf[0] & 0x7F) << (7 * i);
        if buf[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CodecError::MalformedRemainingLength.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_boundaries() {
        for (value, expect) in [
            (0u32, vec![0x00u8]),
            (127, vec![0x7F]),
            (128, vec![0x80, 0x01]),
            (16_383, vec![0xFF, 0x7F]),
            (16_384, vec![0x80, 0x80, 0x01]),
            (MAX_REMAINING_LENGTH, vec![0xFF, 0xFF, 0xFF, 0x7F]),
        ] {
            let mut out = Vec::new();
            encode_varint(value, &mut out).unwrap();
            assert_eq!(out, expect, "encoding {value}");
            let mut cursor = 0;
            assert_eq!(decode_varint(&out, &mut cursor).unwrap(), value);
            assert_eq!(cursor, out.len());
        }
    }

    #[test]
    fn varint_fifth_byte_rejected() {
        let mut cursor = 0;
        let err = decode_varint(&[0x80, 0x80, 0x80, 0x80, 0x01], &mut cursor).unwrap_err();
        assert_eq!(err, CodecError::MalformedRemainingLength);
    }

    #[test]
    fn varint_truncation_rejected() {
        let mut cursor = 0;
        assert_eq!(
            decode_varint(&[0x80], &mut cursor).unwrap_err(),
            CodecError::MalformedRemainingLength
        );
    }

    #[test]
    fn varint_overflow_rejected_on_encode() {
        let mut out = Vec::new();
        assert!(encode_varint(MAX_REMAINING_LENGTH + 1, &mut out).is_err());
    }

    #[test]
    fn string_null_byte_rejected() {
        let buf = [0x00u8, 0x03, b'a', 0x00, b'b'];
        let mut cursor = 0;
        assert_eq!(
            read_string(&buf, &mut cursor).unwrap_err(),
            CodecError::InvalidUtf8
        );
    }

    #[test]
    fn string_invalid_utf8_rejected() {
        let buf = [0x00u8, 0x02, 0xFF, 0xFE];
        let mut cursor = 0;
        assert_eq!(
            read_string(&buf, &mut cursor).unwrap_err(),
            CodecError::InvalidUtf8
        );
    }
}
