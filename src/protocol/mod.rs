//! Packet model for MQTT 3.1.1 and 5.0.
//!
//! Every control packet is a variant of [`Packet`]; the codec in
//! [`codec`] dispatches on that tag plus the negotiated
//! [`ProtocolVersion`]. MQTT 5.0 property tables live in [`properties`].

pub mod codec;
pub mod properties;

pub use codec::{decode_packet, encode_packet, read_packet};

use crate::error::CodecError;
use properties::{
    AckProperties, AuthProperties, ConnAckProperties, ConnectProperties, DisconnectProperties,
    PublishProperties, SubscribeProperties, UnsubscribeProperties, WillProperties,
};

/// Negotiated protocol version, set once per connection at handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    #[default]
    V311,
    V5,
}

impl ProtocolVersion {
    /// Protocol level byte carried in CONNECT.
    pub fn level(self) -> u8 {
        match self {
            Self::V311 => 4,
            Self::V5 => 5,
        }
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            4 => Some(Self::V311),
            5 => Some(Self::V5),
            _ => None,
        }
    }
}

/// Quality of service level for a publication or subscription.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, serde::Serialize,
    serde::Deserialize,
)]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn bits(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }

    pub fn from_bits(bits: u8) -> Result<Self, CodecError> {
        match bits {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            3 => Err(CodecError::ReservedQos),
            _ => Err(CodecError::MalformedPacket("QoS out of range")),
        }
    }
}

/// Four-bit control packet type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl ControlType {
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            1 => Some(Self::Connect),
            2 => Some(Self::ConnAck),
            3 => Some(Self::Publish),
            4 => Some(Self::PubAck),
            5 => Some(Self::PubRec),
            6 => Some(Self::PubRel),
            7 => Some(Self::PubComp),
            8 => Some(Self::Subscribe),
            9 => Some(Self::SubAck),
            10 => Some(Self::Unsubscribe),
            11 => Some(Self::UnsubAck),
            12 => Some(Self::PingReq),
            13 => Some(Self::PingResp),
            14 => Some(Self::Disconnect),
            15 => Some(Self::Auth),
            _ => None,
        }
    }

    /// Fixed-header flag bits mandated for this type. PUBLISH carries its
    /// own flags and is not covered here.
    pub fn required_flags(self) -> u8 {
        match self {
            Self::Subscribe | Self::Unsubscribe | Self::PubRel => 0x02,
            _ => 0x00,
        }
    }
}

/// One requested subscription: a topic filter plus its options byte.
/// The MQTT 5.0 options (no-local, retain-as-published, retain-handling)
/// are ignored when encoding for 3.1.1.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicFilter {
    pub filter: String,
    pub qos: Qos,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
}

impl TopicFilter {
    pub fn new(filter: impl Into<String>, qos: Qos) -> Self {
        Self {
            filter: filter.into(),
            qos,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
    pub properties: WillProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectPacket {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_start: bool,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub properties: ConnectProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub reason_code: u8,
    pub properties: ConnAckProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishPacket {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub pid: Option<u16>,
    pub dup: bool,
    pub retain: bool,
    pub properties: PublishProperties,
}

/// Shared body of PUBACK, PUBREC, PUBREL and PUBCOMP. In MQTT 5.0 the
/// reason code and property table are optional on the wire; the two-byte
/// short form decodes as reason 0 with no properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckPacket {
    pub pid: u16,
    pub reason_code: u8,
    pub properties: AckProperties,
}

impl AckPacket {
    pub fn success(pid: u16) -> Self {
        Self {
            pid,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribePacket {
    pub pid: u16,
    pub filters: Vec<TopicFilter>,
    pub properties: SubscribeProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubAckPacket {
    pub pid: u16,
    pub codes: Vec<u8>,
    pub properties: AckProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub pid: u16,
    pub filters: Vec<String>,
    pub properties: UnsubscribeProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnsubAckPacket {
    pub pid: u16,
    /// Per-filter reason codes; always empty for 3.1.1.
    pub codes: Vec<u8>,
    pub properties: AckProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisconnectPacket {
    pub reason_code: u8,
    pub properties: DisconnectProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthPacket {
    pub reason_code: u8,
    pub properties: AuthProperties,
}

/// A decoded control packet of either protocol version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(ConnectPacket),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck(AckPacket),
    PubRec(AckPacket),
    PubRel(AckPacket),
    PubComp(AckPacket),
    Subscribe(SubscribePacket),
    SubAck(SubAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubAck(UnsubAckPacket),
    PingReq,
    PingResp,
    Disconnect(DisconnectPacket),
    Auth(AuthPacket),
}

impl Packet {
    pub fn control_type(&self) -> ControlType {
        match self {
            Self::Connect(_) => ControlType::Connect,
            Self::ConnAck(_) => ControlType::ConnAck,
            Self::Publish(_) => ControlType::Publish,
            Self::PubAck(_) => ControlType::PubAck,
            Self::PubRec(_) => ControlType::PubRec,
            Self::PubRel(_) => ControlType::PubRel,
            Self::PubComp(_) => ControlType::PubComp,
            Self::Subscribe(_) => ControlType::Subscribe,
            Self::SubAck(_) => ControlType::SubAck,
            Self::Unsubscribe(_) => ControlType::Unsubscribe,
            Self::UnsubAck(_) => ControlType::UnsubAck,
            Self::PingReq => ControlType::PingReq,
            Self::PingResp => ControlType::PingResp,
            Self::Disconnect(_) => ControlType::Disconnect,
            Self::Auth(_) => ControlType::Auth,
        }
    }

    /// Packet identifier, for the families that carry one.
    pub fn pid(&self) -> Option<u16> {
        match self {
            Self::Publish(p) => p.pid,
            Self::PubAck(a) | Self::PubRec(a) | Self::PubRel(a) | Self::PubComp(a) => Some(a.pid),
            Self::Subscribe(s) => Some(s.pid),
            Self::SubAck(s) => Some(s.pid),
            Self::Unsubscribe(u) => Some(u.pid),
            Self::UnsubAck(u) => Some(u.pid),
            _ => None,
        }
    }
}

/// Validate a topic name or filter against the shared MQTT constraints:
/// non-empty, at most 65535 bytes of UTF-8, no embedded null character.
pub fn valid_topic(topic: &str) -> bool {
    !topic.is_empty() && topic.len() <= usize::from(u16::MAX) && !topic.contains('\u{0}')
}
