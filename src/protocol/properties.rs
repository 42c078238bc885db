//! MQTT 5.0 property tables.
//!
//! A property table encodes as a variable-byte total length followed by
//! concatenated (key byte, typed value) pairs. Each packet family admits a
//! fixed key set, modeled here as one struct per family; the typed fields
//! make it impossible to emit an at-most-once key twice, and the parsers
//! reject unknown and duplicated keys. Cross-property rules (authentication
//! data requiring a method) are enforced at session ingestion, not here.

use super::codec::{
    decode_varint, encode_varint, read_binary, read_string, read_u16, read_u32, read_u8,
    write_binary, write_string,
};
use crate::error::CodecError;

/// MQTT 5.0 property identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQos = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
}

/// Ordered user-defined key/value pairs; duplicates permitted, order
/// preserved end-to-end.
pub type UserProperties = Vec<(String, String)>;

fn set_once<T>(slot: &mut Option<T>, value: T, id: u8) -> Result<(), CodecError> {
    if slot.is_some() {
        return Err(CodecError::DuplicateProperty(id));
    }
    *slot = Some(value);
    Ok(())
}

fn begin(buf: &[u8], cursor: &mut usize) -> Result<usize, CodecError> {
    let len = decode_varint(buf, cursor)? as usize;
    let end = cursor
        .checked_add(len)
        .ok_or(CodecError::MalformedPacket("property length overflow"))?;
    if end > buf.len() {
        return Err(CodecError::MalformedPacket("property table exceeds packet"));
    }
    Ok(end)
}

fn finish(cursor: usize, end: usize) -> Result<(), CodecError> {
    if cursor != end {
        return Err(CodecError::MalformedPacket("property table length mismatch"));
    }
    Ok(())
}

fn push_u8(out: &mut Vec<u8>, id: u8, value: u8) {
    out.push(id);
    out.push(value);
}

fn push_u16(out: &mut Vec<u8>, id: u8, value: u16) {
    out.push(id);
    out.extend_from_slice(&value.to_be_bytes());
}

fn push_u32(out: &mut Vec<u8>, id: u8, value: u32) {
    out.push(id);
    out.extend_from_slice(&value.to_be_bytes());
}

fn push_string(out: &mut Vec<u8>, id: u8, value: &str) -> Result<(), CodecError> {
    out.push(id);
    write_string(out, value)
}

fn push_binary(out: &mut Vec<u8>, id: u8, value: &[u8]) -> Result<(), CodecError> {
    out.push(id);
    write_binary(out, value)
}

fn push_user_properties(out: &mut Vec<u8>, pairs: &UserProperties) -> Result<(), CodecError> {
    for (key, value) in pairs {
        out.push(PropertyId::UserProperty as u8);
        write_string(out, key)?;
        write_string(out, value)?;
    }
    Ok(())
}

fn read_user_property(buf: &[u8], cursor: &mut usize) -> Result<(String, String), CodecError> {
    let key = read_string(buf, cursor)?;
    let value = read_string(buf, cursor)?;
    Ok((key, value))
}

/// CONNECT properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConnectProperties {
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub max_packet_size: Option<u32>,
    pub topic_alias_maximum: Option<u16>,
    pub request_response_information: Option<u8>,
    pub request_problem_information: Option<u8>,
    pub auth_method: Option<String>,
    pub auth_data: Option<Vec<u8>>,
    #[serde(default)]
    pub user_properties: UserProperties,
}

impl ConnectProperties {
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        if let Some(v) = self.session_expiry_interval {
            push_u32(out, PropertyId::SessionExpiryInterval as u8, v);
        }
        if let Some(v) = self.receive_maximum {
            push_u16(out, PropertyId::ReceiveMaximum as u8, v);
        }
        if let Some(v) = self.max_packet_size {
            push_u32(out, PropertyId::MaximumPacketSize as u8, v);
        }
        if let Some(v) = self.topic_alias_maximum {
            push_u16(out, PropertyId::TopicAliasMaximum as u8, v);
        }
        if let Some(v) = self.request_response_information {
            push_u8(out, PropertyId::RequestResponseInformation as u8, v);
        }
        if let Some(v) = self.request_problem_information {
            push_u8(out, PropertyId::RequestProblemInformation as u8, v);
        }
        if let Some(v) = &self.auth_method {
            push_string(out, PropertyId::AuthenticationMethod as u8, v)?;
        }
        if let Some(v) = &self.auth_data {
            push_binary(out, PropertyId::AuthenticationData as u8, v)?;
        }
        push_user_properties(out, &self.user_properties)
    }

    pub fn parse(buf: &[u8], cursor: &mut usize) -> Result<Self, CodecError> {
        let mut props = Self::default();
        let end = begin(buf, cursor)?;
        while *cursor < end {
            let id = read_u8(buf, cursor)?;
            match id {
                0x11 => set_once(&mut props.session_expiry_interval, read_u32(buf, cursor)?, id)?,
                0x21 => set_once(&mut props.receive_maximum, read_u16(buf, cursor)?, id)?,
                0x27 => set_once(&mut props.max_packet_size, read_u32(buf, cursor)?, id)?,
                0x22 => set_once(&mut props.topic_alias_maximum, read_u16(buf, cursor)?, id)?,
                0x19 => set_once(
                    &mut props.request_response_information,
                    read_u8(buf, cursor)?,
                    id,
                )?,
                0x17 => set_once(
                    &mut props.request_problem_information,
                    read_u8(buf, cursor)?,
                    id,
                )?,
                0x15 => set_once(&mut props.auth_method, read_string(buf, cursor)?, id)?,
                0x16 => set_once(&mut props.auth_data, read_binary(buf, cursor)?, id)?,
                0x26 => props
                    .user_properties
                    .push(read_user_property(buf, cursor)?),
                other => return Err(CodecError::UnknownProperty(other)),
            }
        }
        finish(*cursor, end)?;
        Ok(props)
    }
}

/// Will properties carried inside the CONNECT payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WillProperties {
    pub delay_interval: Option<u32>,
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    #[serde(default)]
    pub user_properties: UserProperties,
}

impl WillProperties {
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        if let Some(v) = self.delay_interval {
            push_u32(out, PropertyId::WillDelayInterval as u8, v);
        }
        if let Some(v) = self.payload_format_indicator {
            push_u8(out, PropertyId::PayloadFormatIndicator as u8, v);
        }
        if let Some(v) = self.message_expiry_interval {
            push_u32(out, PropertyId::MessageExpiryInterval as u8, v);
        }
        if let Some(v) = &self.content_type {
            push_string(out, PropertyId::ContentType as u8, v)?;
        }
        if let Some(v) = &self.response_topic {
            push_string(out, PropertyId::ResponseTopic as u8, v)?;
        }
        if let Some(v) = &self.correlation_data {
            push_binary(out, PropertyId::CorrelationData as u8, v)?;
        }
        push_user_properties(out, &self.user_properties)
    }

    pub fn parse(buf: &[u8], cursor: &mut usize) -> Result<Self, CodecError> {
        let mut props = Self::default();
        let end = begin(buf, cursor)?;
        while *cursor < end {
            let id = read_u8(buf, cursor)?;
            match id {
                0x18 => set_once(&mut props.delay_interval, read_u32(buf, cursor)?, id)?,
                0x01 => set_once(
                    &mut props.payload_format_indicator,
                    read_u8(buf, cursor)?,
                    id,
                )?,
                0x02 => set_once(
                    &mut props.message_expiry_interval,
                    read_u32(buf, cursor)?,
                    id,
                )?,
                0x03 => set_once(&mut props.content_type, read_string(buf, cursor)?, id)?,
                0x08 => set_once(&mut props.response_topic, read_string(buf, cursor)?, id)?,
                0x09 => set_once(&mut props.correlation_data, read_binary(buf, cursor)?, id)?,
                0x26 => props
                    .user_properties
                    .push(read_user_property(buf, cursor)?),
                other => return Err(CodecError::UnknownProperty(other)),
            }
        }
        finish(*cursor, end)?;
        Ok(props)
    }
}

/// CONNACK properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnAckProperties {
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    pub max_packet_size: Option<u32>,
    pub assigned_client_id: Option<String>,
    pub topic_alias_maximum: Option<u16>,
    pub reason_string: Option<String>,
    pub wildcard_subscription_available: Option<u8>,
    pub subscription_identifiers_available: Option<u8>,
    pub shared_subscription_available: Option<u8>,
    pub server_keep_alive: Option<u16>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub auth_method: Option<String>,
    pub auth_data: Option<Vec<u8>>,
    pub user_properties: UserProperties,
}

impl ConnAckProperties {
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        if let Some(v) = self.session_expiry_interval {
            push_u32(out, PropertyId::SessionExpiryInterval as u8, v);
        }
        if let Some(v) = self.receive_maximum {
            push_u16(out, PropertyId::ReceiveMaximum as u8, v);
        }
        if let Some(v) = self.maximum_qos {
            push_u8(out, PropertyId::MaximumQos as u8, v);
        }
        if let Some(v) = self.retain_available {
            push_u8(out, PropertyId::RetainAvailable as u8, v);
        }
        if let Some(v) = self.max_packet_size {
            push_u32(out, PropertyId::MaximumPacketSize as u8, v);
        }
        if let Some(v) = &self.assigned_client_id {
            push_string(out, PropertyId::AssignedClientIdentifier as u8, v)?;
        }
        if let Some(v) = self.topic_alias_maximum {
            push_u16(out, PropertyId::TopicAliasMaximum as u8, v);
        }
        if let Some(v) = &self.reason_string {
            push_string(out, PropertyId::ReasonString as u8, v)?;
        }
        if let Some(v) = self.wildcard_subscription_available {
            push_u8(out, PropertyId::WildcardSubscriptionAvailable as u8, v);
        }
        if let Some(v) = self.subscription_identifiers_available {
            push_u8(out, PropertyId::SubscriptionIdentifierAvailable as u8, v);
        }
        if let Some(v) = self.shared_subscription_available {
            push_u8(out, PropertyId::SharedSubscriptionAvailable as u8, v);
        }
        if let Some(v) = self.server_keep_alive {
            push_u16(out, PropertyId::ServerKeepAlive as u8, v);
        }
        if let Some(v) = &self.response_information {
            push_string(out, PropertyId::ResponseInformation as u8, v)?;
        }
        if let Some(v) = &self.server_reference {
            push_string(out, PropertyId::ServerReference as u8, v)?;
        }
        if let Some(v) = &self.auth_method {
            push_string(out, PropertyId::AuthenticationMethod as u8, v)?;
        }
        if let Some(v) = &self.auth_data {
            push_binary(out, PropertyId::AuthenticationData as u8, v)?;
        }
        push_user_properties(out, &self.user_properties)
    }

    pub fn parse(buf: &[u8], cursor: &mut usize) -> Result<Self, CodecError> {
        let mut props = Self::default();
        let end = begin(buf, cursor)?;
        while *cursor < end {
            let id = read_u8(buf, cursor)?;
            match id {
                0x11 => set_once(&mut props.session_expiry_interval, read_u32(buf, cursor)?, id)?,
                0x21 => set_once(&mut props.receive_maximum, read_u16(buf, cursor)?, id)?,
                0x24 => set_once(&mut props.maximum_qos, read_u8(buf, cursor)?, id)?,
                0x25 => set_once(&mut props.retain_available, read_u8(buf, cursor)?, id)?,
                0x27 => set_once(&mut props.max_packet_size, read_u32(buf, cursor)?, id)?,
                0x12 => set_once(&mut props.assigned_client_id, read_string(buf, cursor)?, id)?,
                0x22 => set_once(&mut props.topic_alias_maximum, read_u16(buf, cursor)?, id)?,
                0x1F => set_once(&mut props.reason_string, read_string(buf, cursor)?, id)?,
                0x28 => set_once(
                    &mut props.wildcard_subscription_available,
                    read_u8(buf, cursor)?,
                    id,
                )?,
                0x29 => set_once(
                    &mut props.subscription_identifiers_available,
                    read_u8(buf, cursor)?,
                    id,
                )?,
                0x2A => set_once(
                    &mut props.shared_subscription_available,
                    read_u8(buf, cursor)?,
                    id,
                )?,
                0x13 => set_once(&mut props.server_keep_alive, read_u16(buf, cursor)?, id)?,
                0x1A => set_once(
                    &mut props.response_information,
                    read_string(buf, cursor)?,
                    id,
                )?,
                0x1C => set_once(&mut props.server_reference, read_string(buf, cursor)?, id)?,
                0x15 => set_once(&mut props.auth_method, read_string(buf, cursor)?, id)?,
                0x16 => set_once(&mut props.auth_data, read_binary(buf, cursor)?, id)?,
                0x26 => props
                    .user_properties
                    .push(read_user_property(buf, cursor)?),
                other => return Err(CodecError::UnknownProperty(other)),
            }
        }
        finish(*cursor, end)?;
        Ok(props)
    }
}

/// PUBLISH properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub topic_alias: Option<u16>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub content_type: Option<String>,
    /// Repeatable; populated by the server when delivering.
    pub subscription_identifiers: Vec<u32>,
    pub user_properties: UserProperties,
}

impl PublishProperties {
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        if let Some(v) = self.payload_format_indicator {
            push_u8(out, PropertyId::PayloadFormatIndicator as u8, v);
        }
        if let Some(v) = self.message_expiry_interval {
            push_u32(out, PropertyId::MessageExpiryInterval as u8, v);
        }
        if let Some(v) = self.topic_alias {
            push_u16(out, PropertyId::TopicAlias as u8, v);
        }
        if let Some(v) = &self.response_topic {
            push_string(out, PropertyId::ResponseTopic as u8, v)?;
        }
        if let Some(v) = &self.correlation_data {
            push_binary(out, PropertyId::CorrelationData as u8, v)?;
        }
        if let Some(v) = &self.content_type {
            push_string(out, PropertyId::ContentType as u8, v)?;
        }
        for id in &self.subscription_identifiers {
            out.push(PropertyId::SubscriptionIdentifier as u8);
            encode_varint(*id, out)?;
        }
        push_user_properties(out, &self.user_properties)
    }

    pub fn parse(buf: &[u8], cursor: &mut usize) -> Result<Self, CodecError> {
        let mut props = Self::default();
        let end = begin(buf, cursor)?;
        while *cursor < end {
            let id = read_u8(buf, cursor)?;
            match id {
                0x01 => set_once(
                    &mut props.payload_format_indicator,
                    read_u8(buf, cursor)?,
                    id,
                )?,
                0x02 => set_once(
                    &mut props.message_expiry_interval,
                    read_u32(buf, cursor)?,
                    id,
                )?,
                0x23 => set_once(&mut props.topic_alias, read_u16(buf, cursor)?, id)?,
                0x08 => set_once(&mut props.response_topic, read_string(buf, cursor)?, id)?,
                0x09 => set_once(&mut props.correlation_data, read_binary(buf, cursor)?, id)?,
                0x03 => set_once(&mut props.content_type, read_string(buf, cursor)?, id)?,
                0x0B => props
                    .subscription_identifiers
                    .push(decode_varint(buf, cursor)?),
                0x26 => props
                    .user_properties
                    .push(read_user_property(buf, cursor)?),
                other => return Err(CodecError::UnknownProperty(other)),
            }
        }
        finish(*cursor, end)?;
        Ok(props)
    }
}

/// Properties common to the acknowledgement families: PUBACK, PUBREC,
/// PUBREL, PUBCOMP, SUBACK and UNSUBACK.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckProperties {
    pub reason_string: Option<String>,
    pub user_properties: UserProperties,
}

impl AckProperties {
    pub fn is_empty(&self) -> bool {
        self.reason_string.is_none() && self.user_properties.is_empty()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        if let Some(v) = &self.reason_string {
            push_string(out, PropertyId::ReasonString as u8, v)?;
        }
        push_user_properties(out, &self.user_properties)
    }

    pub fn parse(buf: &[u8], cursor: &mut usize) -> Result<Self, CodecError> {
        let mut props = Self::default();
        let end = begin(buf, cursor)?;
        while *cursor < end {
            let id = read_u8(buf, cursor)?;
            match id {
                0x1F => set_once(&mut props.reason_string, read_string(buf, cursor)?, id)?,
                0x26 => props
                    .user_properties
                    .push(read_user_property(buf, cursor)?),
                other => return Err(CodecError::UnknownProperty(other)),
            }
        }
        finish(*cursor, end)?;
        Ok(props)
    }
}

/// SUBSCRIBE properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeProperties {
    pub subscription_identifier: Option<u32>,
    pub user_properties: UserProperties,
}

impl SubscribeProperties {
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        if let Some(v) = self.subscription_identifier {
            out.push(PropertyId::SubscriptionIdentifier as u8);
            encode_varint(v, out)?;
        }
        push_user_properties(out, &self.user_properties)
    }

    pub fn parse(buf: &[u8], cursor: &mut usize) -> Result<Self, CodecError> {
        let mut props = Self::default();
        let end = begin(buf, cursor)?;
        while *cursor < end {
            let id = read_u8(buf, cursor)?;
            match id {
                0x0B => {
                    if props.subscription_identifier.is_some() {
                        return Err(CodecError::DuplicateProperty(id));
                    }
                    props.subscription_identifier = Some(decode_varint(buf, cursor)?);
                }
                0x26 => props
                    .user_properties
                    .push(read_user_property(buf, cursor)?),
                other => return Err(CodecError::UnknownProperty(other)),
            }
        }
        finish(*cursor, end)?;
        Ok(props)
    }
}

/// UNSUBSCRIBE properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnsubscribeProperties {
    pub user_properties: UserProperties,
}

impl UnsubscribeProperties {
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        push_user_properties(out, &self.user_properties)
    }

    pub fn parse(buf: &[u8], cursor: &mut usize) -> Result<Self, CodecError> {
        let mut props = Self::default();
        let end = begin(buf, cursor)?;
        while *cursor < end {
            let id = read_u8(buf, cursor)?;
            match id {
                0x26 => props
                    .user_properties
                    .push(read_user_property(buf, cursor)?),
                other => return Err(CodecError::UnknownProperty(other)),
            }
        }
        finish(*cursor, end)?;
        Ok(props)
    }
}

/// DISCONNECT properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisconnectProperties {
    pub session_expiry_interval: Option<u32>,
    pub reason_string: Option<String>,
    pub server_reference: Option<String>,
    pub user_properties: UserProperties,
}

impl DisconnectProperties {
    pub fn is_empty(&self) -> bool {
        self.session_expiry_interval.is_none()
            && self.reason_string.is_none()
            && self.server_reference.is_none()
            && self.user_properties.is_empty()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        if let Some(v) = self.session_expiry_interval {
            push_u32(out, PropertyId::SessionExpiryInterval as u8, v);
        }
        if let Some(v) = &self.reason_string {
            push_string(out, PropertyId::ReasonString as u8, v)?;
        }
        if let Some(v) = &self.server_reference {
            push_string(out, PropertyId::ServerReference as u8, v)?;
        }
        push_user_properties(out, &self.user_properties)
    }

    pub fn parse(buf: &[u8], cursor: &mut usize) -> Result<Self, CodecError> {
        let mut props = Self::default();
        let end = begin(buf, cursor)?;
        while *cursor < end {
            let id = read_u8(buf, cursor)?;
            match id {
                0x11 => set_once(&mut props.session_expiry_interval, read_u32(buf, cursor)?, id)?,
                0x1F => set_once(&mut props.reason_string, read_string(buf, cursor)?, id)?,
                0x1C => set_once(&mut props.server_reference, read_string(buf, cursor)?, id)?,
                0x26 => props
                    .user_properties
                    .push(read_user_property(buf, cursor)?),
                other => return Err(CodecError::UnknownProperty(other)),
            }
        }
        finish(*cursor, end)?;
        Ok(props)
    }
}

/// AUTH properties. The authentication method is required by the protocol;
/// the session engine enforces that before acting on the packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthProperties {
    pub auth_method: Option<String>,
    pub auth_data: Option<Vec<u8>>,
    pub reason_string: Option<String>,
    pub user_properties: UserProperties,
}

impl AuthProperties {
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        if let Some(v) = &self.auth_method {
            push_string(out, PropertyId::AuthenticationMethod as u8, v)?;
        }
        if let Some(v) = &self.auth_data {
            push_binary(out, PropertyId::AuthenticationData as u8, v)?;
        }
        if let Some(v) = &self.reason_string {
            push_string(out, PropertyId::ReasonString as u8, v)?;
        }
        push_user_properties(out, &self.user_properties)
    }

    pub fn parse(buf: &[u8], cursor: &mut usize) -> Result<Self, CodecError> {
        let mut props = Self::default();
        let end = begin(buf, cursor)?;
        while *cursor < end {
            let id = read_u8(buf, cursor)?;
            match id {
                0x15 => set_once(&mut props.auth_method, read_string(buf, cursor)?, id)?,
                0x16 => set_once(&mut props.auth_data, read_binary(buf, cursor)?, id)?,
                0x1F => set_once(&mut props.reason_string, read_string(buf, cursor)?, id)?,
                0x26 => props
                    .user_properties
                    .push(read_user_property(buf, cursor)?),
                other => return Err(CodecError::UnknownProperty(other)),
            }
        }
        finish(*cursor, end)?;
        Ok(props)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(props: &PublishProperties) -> Vec<u8> {
        let mut body = Vec::new();
        props.encode_into(&mut body).unwrap();
        let mut out = Vec::new();
        encode_varint(body.len() as u32, &mut out).unwrap();
        out.extend(body);
        out
    }

    #[test]
    fn duplicate_at_most_once_key_rejected() {
        // Two payload format indicators in one table.
        let buf = [4u8, 0x01, 0x01, 0x01, 0x00];
        let mut cursor = 0;
        let err = PublishProperties::parse(&buf, &mut cursor).unwrap_err();
        assert_eq!(err, CodecError::DuplicateProperty(0x01));
    }

    #[test]
    fn unknown_key_rejected() {
        let buf = [2u8, 0x7F, 0x00];
        let mut cursor = 0;
        let err = AckProperties::parse(&buf, &mut cursor).unwrap_err();
        assert_eq!(err, CodecError::UnknownProperty(0x7F));
    }

    #[test]
    fn user_properties_repeat_and_keep_order() {
        let props = PublishProperties {
            user_properties: vec![
                ("k".into(), "v1".into()),
                ("k".into(), "v2".into()),
            ],
            ..Default::default()
        };
        let buf = table(&props);
        let mut cursor = 0;
        let parsed = PublishProperties::parse(&buf, &mut cursor).unwrap();
        assert_eq!(parsed, props);
    }

    #[test]
    fn subscription_identifiers_repeat() {
        let props = PublishProperties {
            subscription_identifiers: vec![1, 268_435_455],
            ..Default::default()
        };
        let buf = table(&props);
        let mut cursor = 0;
        let parsed = PublishProperties::parse(&buf, &mut cursor).unwrap();
        assert_eq!(parsed.subscription_identifiers, vec![1, 268_435_455]);
    }

    #[test]
    fn length_mismatch_rejected() {
        // Declared length 3 but the single u8 property only spans 2 bytes.
        let buf = [3u8, 0x01, 0x01, 0x26];
        let mut cursor = 0;
        assert!(PublishProperties::parse(&buf, &mut cursor).is_err());
    }
}
