// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::{AttributeError, Error};
use nom::{
    bytes::complete::take,
    number::complete::{be_u16, be_u32, u8 as parse_u8},
};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const MAX_MESSAGE_SIZE: usize = 4096;

pub const AFI_IPV4: u16 = 1;
pub const AFI_IPV6: u16 = 2;
pub const SAFI_UNICAST: u8 = 1;

/// BGP Message types.
///
/// Ref: RFC 4271 §4.1
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum MessageType {
    /// The first message sent by each side once a TCP connection is
    /// established.
    ///
    /// RFC 4271 §4.2
    Open = 1,

    /// Used to transfer routing information between BGP peers.
    ///
    /// RFC 4271 §4.3
    Update = 2,

    /// Sent when an error condition is detected.
    ///
    /// RFC 4271 §4.5
    Notification = 3,

    /// Exchanged between peers often enough not to cause the hold timer to
    /// expire.
    ///
    /// RFC 4271 §4.4
    KeepAlive = 4,

    /// Asks the peer to re-advertise its routes for an address family.
    ///
    /// RFC 2918 §3
    RouteRefresh = 5,
}

impl From<&Message> for MessageType {
    fn from(m: &Message) -> Self {
        match m {
            Message::Open(_) => Self::Open,
            Message::Update(_) => Self::Update,
            Message::Notification(_) => Self::Notification,
            Message::KeepAlive => Self::KeepAlive,
            Message::RouteRefresh(_) => Self::RouteRefresh,
        }
    }
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Message {
    Open(OpenMessage),
    Update(UpdateMessage),
    Notification(NotificationMessage),
    KeepAlive,
    RouteRefresh(RouteRefreshMessage),
}

impl Message {
    /// Serialize the message body, without the header.
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Open(m) => m.to_wire(),
            Self::Update(m) => m.to_wire(),
            Self::Notification(m) => m.to_wire(),
            Self::KeepAlive => Ok(Vec::new()),
            Self::RouteRefresh(m) => Ok(m.to_wire()),
        }
    }

    /// Serialize the message including its header.
    pub fn to_frame(&self) -> Result<Vec<u8>, Error> {
        let body = self.to_wire()?;
        let length = body.len() + Header::WIRE_SIZE;
        if length > MAX_MESSAGE_SIZE {
            return Err(Error::TooLarge(format!(
                "{} message of {length} octets",
                self.title()
            )));
        }
        let mut buf = Header::new(length as u16, self.into())?.to_wire();
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Decode a message body that followed `header` on the wire. When
    /// `four_octet_as` is set the session negotiated four-octet AS numbers
    /// and AS_PATH and AGGREGATOR carry 4-octet ASNs.
    pub fn from_frame(
        header: &Header,
        body: &[u8],
        four_octet_as: bool,
    ) -> Result<Message, Error> {
        let short = || Error::BadMessageLength(header.length);
        match header.typ {
            MessageType::Open => {
                if body.len() < OpenMessage::MIN_WIRE_SIZE {
                    return Err(short());
                }
                Ok(OpenMessage::from_wire(body)?.into())
            }
            MessageType::Update => {
                if body.len() < UpdateMessage::MIN_WIRE_SIZE {
                    return Err(short());
                }
                let m = if four_octet_as {
                    UpdateMessage::from_wire_as4(body)?
                } else {
                    UpdateMessage::from_wire(body)?
                };
                Ok(m.into())
            }
            MessageType::Notification => {
                if body.len() < NotificationMessage::MIN_WIRE_SIZE {
                    return Err(short());
                }
                Ok(NotificationMessage::from_wire(body)?.into())
            }
            MessageType::KeepAlive => {
                if !body.is_empty() {
                    return Err(short());
                }
                Ok(Message::KeepAlive)
            }
            MessageType::RouteRefresh => {
                if body.len() != RouteRefreshMessage::WIRE_SIZE {
                    return Err(short());
                }
                Ok(Message::RouteRefresh(RouteRefreshMessage::from_wire(
                    body,
                )?))
            }
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Open(_) => "open",
            Self::Update(_) => "update",
            Self::Notification(_) => "notification",
            Self::KeepAlive => "keepalive",
            Self::RouteRefresh(_) => "route refresh",
        }
    }
}

impl From<OpenMessage> for Message {
    fn from(m: OpenMessage) -> Message {
        Message::Open(m)
    }
}

impl From<UpdateMessage> for Message {
    fn from(m: UpdateMessage) -> Message {
        Message::Update(m)
    }
}

impl From<NotificationMessage> for Message {
    fn from(m: NotificationMessage) -> Message {
        Message::Notification(m)
    }
}

/// Each BGP message has a fixed sized header.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |                                                               |
///   +                                                               +
///   |                                                               |
///   +                                                               +
///   |                           Marker                              |
///   +                                                               +
///   |                                                               |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |          Length               |      Type     |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The marker is written as all ones by [`Header::to_wire`]. Its content is
/// not checked by [`Header::from_wire`].
///
/// Ref: RFC 4271 §4.1
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Header {
    /// Total length of the message, including the header. Between 19 and
    /// 4096.
    pub length: u16,

    /// Indicates the type of message.
    pub typ: MessageType,
}

const MARKER: [u8; 16] = [0xFFu8; 16];

impl Header {
    pub const WIRE_SIZE: usize = 19;

    pub fn new(length: u16, typ: MessageType) -> Result<Header, Error> {
        if !(Header::WIRE_SIZE..=MAX_MESSAGE_SIZE).contains(&length.into()) {
            return Err(Error::BadMessageLength(length));
        }
        Ok(Header { length, typ })
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = MARKER.to_vec();
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.push(self.typ as u8);
        buf
    }

    pub fn from_wire(input: &[u8]) -> Result<Header, Error> {
        let (input, _marker) = take(MARKER.len())(input)?;
        let (input, length) = be_u16(input)?;
        let (_, typ) = parse_u8(input)?;
        let typ = MessageType::try_from(typ)
            .map_err(|_| Error::BadMessageType(typ))?;
        Header::new(length, typ)
    }

    /// Number of body octets following this header.
    pub fn body_len(&self) -> usize {
        usize::from(self.length) - Header::WIRE_SIZE
    }
}

/// The autonomous system number used in OPEN messages when 4-byte ASNs are in
/// use.
///
/// Ref: RFC 4893 §7
pub const AS_TRANS: u16 = 23456;

/// The version number for BGP-4
pub const BGP4: u8 = 4;

/// The first message sent by each side once a TCP connection is established.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    Version    |     My Autonomous System      |   Hold Time   :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :               |                BGP Identifier                 :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :               | Opt Parm Len  |     Optional Parameters       :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :                                                               :
/// :             Optional Parameters (cont, variable)              :
/// :                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Ref: RFC 4271 §4.2
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OpenMessage {
    /// BGP protocol version.
    pub version: u8,

    /// Autonomous system number of the sender. When 4-byte ASNs are in use this
    /// value is set to AS_TRANS which has a value of 23456.
    ///
    /// Ref: RFC 4893 §7
    pub asn: u16,

    /// Number of seconds the sender proposes for the hold timer.
    pub hold_time: u16,

    /// BGP identifier of the sender
    pub id: u32,

    /// A list of optional parameters.
    pub parameters: Vec<OptionalParameter>,
}

impl OpenMessage {
    pub const MIN_WIRE_SIZE: usize = 10;

    /// Create a new open message for a sender with a 2-byte ASN
    pub fn new2(asn: u16, hold_time: u16, id: u32) -> OpenMessage {
        OpenMessage {
            version: BGP4,
            asn,
            hold_time,
            id,
            parameters: Vec::new(),
        }
    }

    /// Create a new open message for a sender with a 4-byte ASN
    pub fn new4(asn: u32, hold_time: u16, id: u32) -> OpenMessage {
        OpenMessage {
            version: BGP4,
            asn: AS_TRANS,
            hold_time,
            id,
            parameters: vec![OptionalParameter::Capabilities(vec![
                Capability::FourOctetAs { asn },
            ])],
        }
    }

    pub fn add_capabilities(&mut self, capabilities: &[Capability]) {
        if capabilities.is_empty() {
            return;
        }
        for p in &mut self.parameters {
            if let OptionalParameter::Capabilities(cs) = p {
                cs.extend_from_slice(capabilities);
                return;
            }
        }
        self.parameters
            .push(OptionalParameter::Capabilities(capabilities.into()));
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &Capability> {
        self.parameters.iter().flat_map(|p| match p {
            OptionalParameter::Capabilities(cs) => cs.iter(),
        })
    }

    /// The value of the four-octet AS capability, if the sender included one.
    pub fn four_octet_asn(&self) -> Option<u32> {
        self.capabilities().find_map(|c| match c {
            Capability::FourOctetAs { asn } => Some(*asn),
            _ => None,
        })
    }

    /// The sender's AS number. When the 2-byte field holds AS_TRANS the real
    /// number comes from the four-octet AS capability.
    pub fn effective_asn(&self) -> u32 {
        match (self.asn, self.four_octet_asn()) {
            (AS_TRANS, Some(asn)) => asn,
            (asn, _) => u32::from(asn),
        }
    }

    /// Serilize an open message to wire format.
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();

        // version
        buf.push(self.version);

        // as
        buf.extend_from_slice(&self.asn.to_be_bytes());

        // hold time
        buf.extend_from_slice(&self.hold_time.to_be_bytes());

        // id
        buf.extend_from_slice(&self.id.to_be_bytes());

        // opt param len
        let opt_buf = self.parameters_to_wire()?;
        if opt_buf.len() > u8::MAX as usize {
            return Err(Error::TooLarge(
                "open message optional parameters".into(),
            ));
        }
        buf.push(opt_buf.len() as u8);
        buf.extend_from_slice(&opt_buf);

        Ok(buf)
    }

    fn parameters_to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        for p in &self.parameters {
            buf.extend_from_slice(&p.to_wire()?);
        }
        Ok(buf)
    }

    /// Deserialize an open message from wire format.
    pub fn from_wire(input: &[u8]) -> Result<OpenMessage, Error> {
        let (input, version) = parse_u8(input)?;
        if version != BGP4 {
            return Err(Error::UnsupportedVersionNumber(version));
        }
        let (input, asn) = be_u16(input)?;
        let (input, hold_time) = be_u16(input)?;
        let (input, id) = be_u32(input)?;
        // Identifiers in 224.0.0.0/3 are not valid unicast addresses.
        if id & 0xe000_0000 == 0xe000_0000 {
            return Err(Error::BadBgpIdentifier(Ipv4Addr::from(id)));
        }
        let (input, param_len) = parse_u8(input)?;
        let param_len = param_len as usize;

        if input.len() < param_len {
            return Err(Error::MalformedOptionalParameters(format!(
                "length {param_len} exceeds remaining {} octets",
                input.len()
            )));
        }

        let parameters = Self::parameters_from_wire(&input[..param_len])?;

        Ok(OpenMessage {
            version,
            asn,
            hold_time,
            id,
            parameters,
        })
    }

    pub fn parameters_from_wire(
        mut buf: &[u8],
    ) -> Result<Vec<OptionalParameter>, Error> {
        let mut result = Vec::new();

        while !buf.is_empty() {
            let (out, param) = OptionalParameter::from_wire(buf)?;
            if let Some(param) = param {
                result.push(param);
            }
            buf = out;
        }

        Ok(result)
    }
}

/// An update message is used to advertise feasible routes that share common
/// path attributes to a peer, or to withdraw multiple unfeasible routes from
/// service.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |        Witdrawn Length        |       Withdrawn Routes        :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :                                                               :
/// :                Withdrawn Routes (cont, variable)              :
/// :                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    Path Attribute Length      |       Path Attributes         :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :                                                               :
/// :                Path Attributes (cont, variable)               :
/// :                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :                                                               :
/// :       Network Layer Reachability Information (variable)       :
/// :                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Ref: RFC 4271 §4.3
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct UpdateMessage {
    pub withdrawn: Vec<Prefix>,
    pub path_attributes: Vec<PathAttribute>,
    pub nlri: Vec<Prefix>,
}

impl UpdateMessage {
    pub const MIN_WIRE_SIZE: usize = 4;

    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();

        // withdrawn
        let withdrawn = prefixes_to_wire(&self.withdrawn)?;
        if withdrawn.len() > u16::MAX as usize {
            return Err(Error::TooLarge(
                "update: too many withdrawn prefixes".into(),
            ));
        }
        let len = withdrawn.len() as u16;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&withdrawn);

        // path attributes
        let attrs = self.path_attrs_to_wire()?;
        if attrs.len() > u16::MAX as usize {
            return Err(Error::TooLarge(
                "update: too many path attributes".into(),
            ));
        }
        let len = attrs.len() as u16;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&attrs);

        // nlri
        buf.extend_from_slice(&prefixes_to_wire(&self.nlri)?);

        if buf.len() + Header::WIRE_SIZE > MAX_MESSAGE_SIZE {
            return Err(Error::TooLarge(
                "update exceeds max message size".into(),
            ));
        }

        Ok(buf)
    }

    fn path_attrs_to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        for p in &self.path_attributes {
            buf.extend_from_slice(&p.to_wire()?);
        }
        Ok(buf)
    }

    /// Decode an update from a session using 2-octet AS numbers.
    pub fn from_wire(input: &[u8]) -> Result<UpdateMessage, Error> {
        Self::decode(input, false)
    }

    /// Decode an update from a session that negotiated 4-octet AS numbers.
    pub fn from_wire_as4(input: &[u8]) -> Result<UpdateMessage, Error> {
        Self::decode(input, true)
    }

    fn decode(
        input: &[u8],
        four_octet_as: bool,
    ) -> Result<UpdateMessage, Error> {
        let (withdrawn_input, input) =
            split_length_prefixed(input, "withdrawn routes")?;
        let withdrawn = prefixes_from_wire(withdrawn_input, 32)?;

        let (attrs_input, input) =
            split_length_prefixed(input, "path attributes")?;
        let path_attributes =
            Self::path_attrs_from_wire(attrs_input, four_octet_as)?;

        let nlri = prefixes_from_wire(input, 32)?;

        Ok(UpdateMessage {
            withdrawn,
            path_attributes,
            nlri,
        })
    }

    fn path_attrs_from_wire(
        mut buf: &[u8],
        four_octet_as: bool,
    ) -> Result<Vec<PathAttribute>, Error> {
        let mut result = Vec::new();
        while !buf.is_empty() {
            let (out, pa) = PathAttribute::from_wire(buf, four_octet_as)?;
            result.push(pa);
            buf = out;
        }
        Ok(result)
    }

    pub fn nexthop4(&self) -> Option<Ipv4Addr> {
        self.path_attributes.iter().find_map(|a| match a.value {
            PathAttributeValue::NextHop(addr) => Some(addr),
            _ => None,
        })
    }

    /// Every prefix this update makes reachable, keyed by address family.
    /// Plain NLRI are IPv4 unicast.
    pub fn announced(&self) -> Vec<(AddressFamily, Prefix)> {
        let mut result: Vec<_> = self
            .nlri
            .iter()
            .map(|p| (AddressFamily::IPV4_UNICAST, p.clone()))
            .collect();
        for a in &self.path_attributes {
            if let PathAttributeValue::MpReachNlri(mp) = &a.value {
                let af = AddressFamily {
                    afi: mp.afi,
                    safi: mp.safi,
                };
                result.extend(mp.nlri.iter().map(|p| (af, p.clone())));
            }
        }
        result
    }

    /// Every prefix this update withdraws, keyed by address family.
    pub fn withdrawn_routes(&self) -> Vec<(AddressFamily, Prefix)> {
        let mut result: Vec<_> = self
            .withdrawn
            .iter()
            .map(|p| (AddressFamily::IPV4_UNICAST, p.clone()))
            .collect();
        for a in &self.path_attributes {
            if let PathAttributeValue::MpUnreachNlri(mp) = &a.value {
                let af = AddressFamily {
                    afi: mp.afi,
                    safi: mp.safi,
                };
                result.extend(mp.withdrawn.iter().map(|p| (af, p.clone())));
            }
        }
        result
    }
}

/// Split a 2-octet length prefixed field off the front of an update.
fn split_length_prefixed<'a>(
    input: &'a [u8],
    what: &str,
) -> Result<(&'a [u8], &'a [u8]), Error> {
    if input.len() < 2 {
        return Err(Error::MalformedAttributeList(format!(
            "{what} length truncated"
        )));
    }
    let (input, len) = be_u16(input)?;
    let len = usize::from(len);
    if len > input.len() {
        return Err(Error::MalformedAttributeList(format!(
            "{what} length {len} exceeds remaining {} octets",
            input.len()
        )));
    }
    Ok(input.split_at(len))
}

fn prefixes_to_wire(prefixes: &[Prefix]) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    for p in prefixes {
        buf.extend_from_slice(&p.to_wire()?);
    }
    Ok(buf)
}

fn prefixes_from_wire(mut buf: &[u8], max: u8) -> Result<Vec<Prefix>, Error> {
    let mut result = Vec::new();
    while !buf.is_empty() {
        let (out, pfx) = Prefix::from_wire(buf, max)?;
        result.push(pfx);
        buf = out;
    }
    Ok(result)
}

/// A route refresh request for one address family.
///
/// Ref: RFC 2918 §3
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RouteRefreshMessage {
    pub afi: u16,
    pub safi: u8,
}

impl RouteRefreshMessage {
    pub const WIRE_SIZE: usize = 4;

    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = self.afi.to_be_bytes().to_vec();
        buf.push(0);
        buf.push(self.safi);
        buf
    }

    pub fn from_wire(input: &[u8]) -> Result<RouteRefreshMessage, Error> {
        let (input, afi) = be_u16(input)?;
        let (input, _reserved) = parse_u8(input)?;
        let (_, safi) = parse_u8(input)?;
        Ok(RouteRefreshMessage { afi, safi })
    }
}

/// An address family and subsequent address family pair.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct AddressFamily {
    pub afi: u16,
    pub safi: u8,
}

impl AddressFamily {
    pub const IPV4_UNICAST: AddressFamily = AddressFamily {
        afi: AFI_IPV4,
        safi: SAFI_UNICAST,
    };
    pub const IPV6_UNICAST: AddressFamily = AddressFamily {
        afi: AFI_IPV6,
        safi: SAFI_UNICAST,
    };
}

impl Display for AddressFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "afi={} safi={}", self.afi, self.safi)
    }
}

/// This data structure captures a network prefix as it's layed out in a BGP
/// message. There is a prefix length followed by a variable number of bytes.
/// Just enough bytes to express the prefix.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
pub struct Prefix {
    pub length: u8,
    pub value: Vec<u8>,
}

impl Prefix {
    /// Build a prefix from an address, keeping only the octets the length
    /// covers and clearing bits past the length.
    pub fn new(addr: IpAddr, length: u8) -> Result<Prefix, Error> {
        let (octets, max) = match addr {
            IpAddr::V4(a) => (a.octets().to_vec(), 32),
            IpAddr::V6(a) => (a.octets().to_vec(), 128),
        };
        if length > max {
            return Err(Error::InvalidNetworkField { length, max });
        }
        let n = usize::from(length).div_ceil(8);
        let mut value = octets[..n].to_vec();
        let rem = length % 8;
        if rem != 0 {
            if let Some(last) = value.last_mut() {
                *last &= 0xffu8 << (8 - rem);
            }
        }
        Ok(Prefix { length, value })
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let n = usize::from(self.length).div_ceil(8);
        if self.value.len() < n {
            return Err(Error::TooSmall(format!(
                "prefix of length {} has {} octets",
                self.length,
                self.value.len()
            )));
        }
        let mut buf = vec![self.length];
        buf.extend_from_slice(&self.value[..n]);
        Ok(buf)
    }

    /// Decode one prefix whose length may not exceed `max` bits.
    pub fn from_wire(input: &[u8], max: u8) -> Result<(&[u8], Prefix), Error> {
        let Some((&length, input)) = input.split_first() else {
            return Err(Error::MalformedAttributeList(
                "missing prefix length".into(),
            ));
        };
        if length > max {
            return Err(Error::InvalidNetworkField { length, max });
        }
        let n = usize::from(length).div_ceil(8);
        if input.len() < n {
            return Err(Error::MalformedAttributeList(format!(
                "prefix of length {length} truncated"
            )));
        }
        let (value, input) = input.split_at(n);
        Ok((
            input,
            Prefix {
                length,
                value: value.to_owned(),
            },
        ))
    }

    pub fn as_ipv4(&self) -> Option<Ipv4Addr> {
        if self.length > 32 || self.value.len() > 4 {
            return None;
        }
        let mut octets = [0u8; 4];
        octets[..self.value.len()].copy_from_slice(&self.value);
        Some(Ipv4Addr::from(octets))
    }

    pub fn as_ipv6(&self) -> Option<Ipv6Addr> {
        if self.length > 128 || self.value.len() > 16 {
            return None;
        }
        let mut octets = [0u8; 16];
        octets[..self.value.len()].copy_from_slice(&self.value);
        Some(Ipv6Addr::from(octets))
    }
}

impl Display for Prefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.length, self.as_ipv4(), self.as_ipv6()) {
            (0..=32, Some(a), _) => write!(f, "{a}/{}", self.length),
            (_, _, Some(a)) => write!(f, "{a}/{}", self.length),
            _ => write!(f, "{:02x?}/{}", self.value, self.length),
        }
    }
}

impl std::str::FromStr for Prefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = match s.split_once('/') {
            Some(split) => split,
            None => return Err("invalid prefix".to_owned()),
        };
        let addr: IpAddr = match addr.parse() {
            Ok(addr) => addr,
            Err(_) => return Err("invalid addr".to_owned()),
        };
        let length: u8 = match len.parse() {
            Ok(len) => len,
            Err(_) => return Err("invalid length".to_owned()),
        };
        Prefix::new(addr, length).map_err(|e| e.to_string())
    }
}

pub mod path_attribute_flags {
    pub const OPTIONAL: u8 = 0b10000000;
    pub const TRANSITIVE: u8 = 0b01000000;
    pub const PARTIAL: u8 = 0b00100000;
    pub const EXTENDED_LENGTH: u8 = 0b00010000;

    /// The flag bits carried by a decoded attribute. Extended length is a
    /// property of the encoding, not of the attribute.
    pub const ATTRIBUTE_MASK: u8 = OPTIONAL | TRANSITIVE | PARTIAL;
}

/// A path attribute and its optional, transitive and partial flags.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PathAttribute {
    pub flags: u8,
    pub value: PathAttributeValue,
}

impl From<PathAttributeValue> for PathAttribute {
    fn from(v: PathAttributeValue) -> Self {
        use path_attribute_flags::{OPTIONAL, TRANSITIVE};
        use PathAttributeValue as V;
        let flags = match &v {
            V::Origin(_)
            | V::AsPath(_)
            | V::AsPath4(_)
            | V::NextHop(_)
            | V::LocalPref(_)
            | V::AtomicAggregate => TRANSITIVE,
            V::Aggregator(_)
            | V::Aggregator4(_)
            | V::Communities(_)
            | V::As4Path(_)
            | V::As4Aggregator(_) => OPTIONAL | TRANSITIVE,
            V::MultiExitDisc(_)
            | V::OriginatorId(_)
            | V::ClusterList(_)
            | V::MpReachNlri(_)
            | V::MpUnreachNlri(_) => OPTIONAL,
            V::Unknown { .. } => OPTIONAL | TRANSITIVE,
        };
        Self { flags, value: v }
    }
}

impl PathAttribute {
    pub fn optional(&self) -> bool {
        self.flags & path_attribute_flags::OPTIONAL != 0
    }

    pub fn transitive(&self) -> bool {
        self.flags & path_attribute_flags::TRANSITIVE != 0
    }

    pub fn partial(&self) -> bool {
        self.flags & path_attribute_flags::PARTIAL != 0
    }

    pub fn type_code(&self) -> u8 {
        self.value.type_code()
    }

    /// Serialize the attribute. The extended length bit is set exactly when
    /// the value is longer than 255 octets.
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let val = self.value.to_wire()?;
        let mut flags = self.flags & path_attribute_flags::ATTRIBUTE_MASK;
        let extended = val.len() > u8::MAX as usize;
        if extended {
            flags |= path_attribute_flags::EXTENDED_LENGTH;
        }
        let mut buf = vec![flags, self.type_code()];
        if extended {
            if val.len() > u16::MAX as usize {
                return Err(Error::TooLarge("extended path attribute".into()));
            }
            buf.extend_from_slice(&(val.len() as u16).to_be_bytes());
        } else {
            buf.push(val.len() as u8);
        }
        buf.extend_from_slice(&val);
        Ok(buf)
    }

    pub fn from_wire(
        input: &[u8],
        four_octet_as: bool,
    ) -> Result<(&[u8], PathAttribute), Error> {
        let start = input;
        if input.len() < 3 {
            return Err(Error::MalformedAttributeList(
                "truncated attribute header".into(),
            ));
        }
        let (input, flags) = parse_u8(input)?;
        let (input, type_code) = parse_u8(input)?;
        let (input, len) =
            if flags & path_attribute_flags::EXTENDED_LENGTH != 0 {
                if input.len() < 2 {
                    return Err(Error::MalformedAttributeList(
                        "truncated extended attribute length".into(),
                    ));
                }
                let (input, len) = be_u16(input)?;
                (input, len as usize)
            } else {
                let (input, len) = parse_u8(input)?;
                (input, len as usize)
            };
        if input.len() < len {
            return Err(Error::AttributeLength(AttributeError::new(
                type_code, start,
            )));
        }
        let header_len = start.len() - input.len();
        let raw = &start[..header_len + len];
        let (value, rest) = input.split_at(len);
        let value = PathAttributeValue::from_wire(
            type_code,
            value,
            raw,
            four_octet_as,
        )?;
        Ok((
            rest,
            PathAttribute {
                flags: flags & path_attribute_flags::ATTRIBUTE_MASK,
                value,
            },
        ))
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum PathAttributeTypeCode {
    /// RFC 4271
    Origin = 1,
    AsPath = 2,
    NextHop = 3,
    MultiExitDisc = 4,
    LocalPref = 5,
    AtomicAggregate = 6,
    Aggregator = 7,

    /// RFC 1997
    Communities = 8,

    /// RFC 4456
    OriginatorId = 9,
    ClusterList = 10,

    /// RFC 4760
    MpReachNlri = 14,
    MpUnreachNlri = 15,

    /// RFC 6793
    As4Path = 17,
    As4Aggregator = 18,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum PathAttributeValue {
    Origin(PathOrigin),
    /// AS_PATH with 2-octet AS numbers.
    AsPath(Vec<AsPathSegment>),
    /// AS_PATH on a session that negotiated 4-octet AS numbers.
    AsPath4(Vec<As4PathSegment>),
    NextHop(Ipv4Addr),
    MultiExitDisc(u32),
    LocalPref(u32),
    AtomicAggregate,
    Aggregator(Aggregator),
    /// AGGREGATOR on a session that negotiated 4-octet AS numbers.
    Aggregator4(As4Aggregator),
    Communities(Vec<Community>),
    OriginatorId(Ipv4Addr),
    ClusterList(Vec<u32>),
    MpReachNlri(MpReachNlri),
    MpUnreachNlri(MpUnreachNlri),
    As4Path(Vec<As4PathSegment>),
    As4Aggregator(As4Aggregator),
    /// An attribute this speaker does not interpret, kept verbatim.
    Unknown { type_code: u8, value: Vec<u8> },
}

impl PathAttributeValue {
    pub fn type_code(&self) -> u8 {
        use PathAttributeTypeCode as T;
        let code = match self {
            Self::Origin(_) => T::Origin,
            Self::AsPath(_) | Self::AsPath4(_) => T::AsPath,
            Self::NextHop(_) => T::NextHop,
            Self::MultiExitDisc(_) => T::MultiExitDisc,
            Self::LocalPref(_) => T::LocalPref,
            Self::AtomicAggregate => T::AtomicAggregate,
            Self::Aggregator(_) | Self::Aggregator4(_) => T::Aggregator,
            Self::Communities(_) => T::Communities,
            Self::OriginatorId(_) => T::OriginatorId,
            Self::ClusterList(_) => T::ClusterList,
            Self::MpReachNlri(_) => T::MpReachNlri,
            Self::MpUnreachNlri(_) => T::MpUnreachNlri,
            Self::As4Path(_) => T::As4Path,
            Self::As4Aggregator(_) => T::As4Aggregator,
            Self::Unknown { type_code, .. } => return *type_code,
        };
        code as u8
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Origin(x) => Ok(vec![*x as u8]),
            Self::AsPath(segments) => {
                let mut buf = Vec::new();
                for s in segments {
                    buf.extend_from_slice(&s.to_wire()?);
                }
                Ok(buf)
            }
            Self::AsPath4(segments) | Self::As4Path(segments) => {
                let mut buf = Vec::new();
                for s in segments {
                    buf.extend_from_slice(&s.to_wire()?);
                }
                Ok(buf)
            }
            Self::NextHop(addr) | Self::OriginatorId(addr) => {
                Ok(addr.octets().into())
            }
            Self::MultiExitDisc(v) | Self::LocalPref(v) => {
                Ok(v.to_be_bytes().into())
            }
            Self::AtomicAggregate => Ok(Vec::new()),
            Self::Aggregator(a) => {
                let mut buf = a.asn.to_be_bytes().to_vec();
                buf.extend_from_slice(&a.address.octets());
                Ok(buf)
            }
            Self::Aggregator4(a) | Self::As4Aggregator(a) => {
                let mut buf = a.asn.to_be_bytes().to_vec();
                buf.extend_from_slice(&a.address.octets());
                Ok(buf)
            }
            Self::Communities(communities) => {
                let mut buf = Vec::new();
                for community in communities {
                    buf.extend_from_slice(&u32::from(*community).to_be_bytes());
                }
                Ok(buf)
            }
            Self::ClusterList(ids) => {
                let mut buf = Vec::new();
                for id in ids {
                    buf.extend_from_slice(&id.to_be_bytes());
                }
                Ok(buf)
            }
            Self::MpReachNlri(mp) => mp.to_wire(),
            Self::MpUnreachNlri(mp) => mp.to_wire(),
            Self::Unknown { value, .. } => Ok(value.clone()),
        }
    }

    /// Decode an attribute value. `raw` is the complete attribute as it
    /// appeared on the wire and is attached to any error.
    pub fn from_wire(
        type_code: u8,
        input: &[u8],
        raw: &[u8],
        four_octet_as: bool,
    ) -> Result<PathAttributeValue, Error> {
        use PathAttributeTypeCode as T;
        let fault = |f: fn(AttributeError) -> Error| {
            f(AttributeError::new(type_code, raw))
        };
        let exact = |n: usize| {
            if input.len() == n {
                Ok(())
            } else {
                Err(fault(Error::AttributeLength))
            }
        };
        let Ok(code) = T::try_from(type_code) else {
            return Ok(PathAttributeValue::Unknown {
                type_code,
                value: input.to_vec(),
            });
        };
        match code {
            T::Origin => {
                exact(1)?;
                let origin = PathOrigin::try_from(input[0])
                    .map_err(|_| fault(Error::InvalidOrigin))?;
                Ok(PathAttributeValue::Origin(origin))
            }
            T::AsPath if four_octet_as => {
                let segments = As4PathSegment::list_from_wire(input)
                    .ok_or_else(|| fault(Error::MalformedAsPath))?;
                Ok(PathAttributeValue::AsPath4(segments))
            }
            T::AsPath => {
                let segments = AsPathSegment::list_from_wire(input)
                    .ok_or_else(|| fault(Error::MalformedAsPath))?;
                Ok(PathAttributeValue::AsPath(segments))
            }
            T::As4Path => {
                let segments = As4PathSegment::list_from_wire(input)
                    .ok_or_else(|| fault(Error::MalformedAsPath))?;
                Ok(PathAttributeValue::As4Path(segments))
            }
            T::NextHop => {
                exact(4)?;
                let (_, v) = be_u32(input)?;
                Ok(PathAttributeValue::NextHop(Ipv4Addr::from(v)))
            }
            T::MultiExitDisc => {
                exact(4)?;
                let (_, v) = be_u32(input)?;
                Ok(PathAttributeValue::MultiExitDisc(v))
            }
            T::LocalPref => {
                exact(4)?;
                let (_, v) = be_u32(input)?;
                Ok(PathAttributeValue::LocalPref(v))
            }
            T::AtomicAggregate => {
                exact(0)?;
                Ok(PathAttributeValue::AtomicAggregate)
            }
            T::Aggregator if four_octet_as => {
                exact(8)?;
                Ok(PathAttributeValue::Aggregator4(As4Aggregator::from_wire(
                    input,
                )?))
            }
            T::Aggregator => {
                exact(6)?;
                let (input, asn) = be_u16(input)?;
                let (_, address) = be_u32(input)?;
                Ok(PathAttributeValue::Aggregator(Aggregator {
                    asn,
                    address: Ipv4Addr::from(address),
                }))
            }
            T::As4Aggregator => {
                exact(8)?;
                Ok(PathAttributeValue::As4Aggregator(
                    As4Aggregator::from_wire(input)?,
                ))
            }
            T::Communities => {
                if input.len() < 4 || input.len() % 4 != 0 {
                    return Err(fault(Error::OptionalAttribute));
                }
                let communities = input
                    .chunks_exact(4)
                    .map(|c| Community::from(u32_from(c)))
                    .collect();
                Ok(PathAttributeValue::Communities(communities))
            }
            T::OriginatorId => {
                exact(4)?;
                let (_, v) = be_u32(input)?;
                Ok(PathAttributeValue::OriginatorId(Ipv4Addr::from(v)))
            }
            T::ClusterList => {
                if input.is_empty() || input.len() % 4 != 0 {
                    return Err(fault(Error::OptionalAttribute));
                }
                Ok(PathAttributeValue::ClusterList(
                    input.chunks_exact(4).map(u32_from).collect(),
                ))
            }
            T::MpReachNlri => {
                let mp = MpReachNlri::from_wire(input).map_err(|e| {
                    mp_fault(e, || fault(Error::OptionalAttribute))
                })?;
                Ok(PathAttributeValue::MpReachNlri(mp))
            }
            T::MpUnreachNlri => {
                let mp = MpUnreachNlri::from_wire(input).map_err(|e| {
                    mp_fault(e, || fault(Error::OptionalAttribute))
                })?;
                Ok(PathAttributeValue::MpUnreachNlri(mp))
            }
        }
    }
}

/// Structural errors inside a multiprotocol attribute are reported against
/// the attribute. Prefix length violations keep their own error.
fn mp_fault(e: Error, attr: impl FnOnce() -> Error) -> Error {
    match e {
        Error::InvalidNetworkField { .. } => e,
        _ => attr(),
    }
}

fn u32_from(c: &[u8]) -> u32 {
    u32::from_be_bytes([c[0], c[1], c[2], c[3]])
}

/// The largest prefix length for an address family.
fn max_prefix_len(afi: u16) -> u8 {
    match afi {
        AFI_IPV4 => 32,
        AFI_IPV6 => 128,
        _ => u8::MAX,
    }
}

/// Ref: RFC 4760 §3
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MpReachNlri {
    pub afi: u16,
    pub safi: u8,
    pub next_hop: Vec<u8>,
    pub nlri: Vec<Prefix>,
}

impl MpReachNlri {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        if self.next_hop.len() > u8::MAX as usize {
            return Err(Error::TooLarge("mp reach next hop".into()));
        }
        let mut buf = self.afi.to_be_bytes().to_vec();
        buf.push(self.safi);
        buf.push(self.next_hop.len() as u8);
        buf.extend_from_slice(&self.next_hop);
        // reserved
        buf.push(0);
        buf.extend_from_slice(&prefixes_to_wire(&self.nlri)?);
        Ok(buf)
    }

    pub fn from_wire(input: &[u8]) -> Result<MpReachNlri, Error> {
        let (input, afi) = be_u16(input)?;
        let (input, safi) = parse_u8(input)?;
        let (input, nh_len) = parse_u8(input)?;
        let (input, next_hop) = take(nh_len)(input)?;
        let (input, _reserved) = parse_u8(input)?;
        let nlri = prefixes_from_wire(input, max_prefix_len(afi))?;
        Ok(MpReachNlri {
            afi,
            safi,
            next_hop: next_hop.to_vec(),
            nlri,
        })
    }
}

/// Ref: RFC 4760 §4
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MpUnreachNlri {
    pub afi: u16,
    pub safi: u8,
    pub withdrawn: Vec<Prefix>,
}

impl MpUnreachNlri {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = self.afi.to_be_bytes().to_vec();
        buf.push(self.safi);
        buf.extend_from_slice(&prefixes_to_wire(&self.withdrawn)?);
        Ok(buf)
    }

    pub fn from_wire(input: &[u8]) -> Result<MpUnreachNlri, Error> {
        let (input, afi) = be_u16(input)?;
        let (input, safi) = parse_u8(input)?;
        let withdrawn = prefixes_from_wire(input, max_prefix_len(afi))?;
        Ok(MpUnreachNlri {
            afi,
            safi,
            withdrawn,
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Aggregator {
    pub asn: u16,
    pub address: Ipv4Addr,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct As4Aggregator {
    pub asn: u32,
    pub address: Ipv4Addr,
}

impl As4Aggregator {
    fn from_wire(input: &[u8]) -> Result<As4Aggregator, Error> {
        let (input, asn) = be_u32(input)?;
        let (_, address) = be_u32(input)?;
        Ok(As4Aggregator {
            asn,
            address: Ipv4Addr::from(address),
        })
    }
}

/// Ref: RFC 1997
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Community {
    /// All routes received carrying a communities attribute
    /// containing this value MUST NOT be advertised outside a BGP
    /// confederation boundary (a stand-alone autonomous system that
    /// is not part of a confederation should be considered a
    /// confederation itself)
    NoExport,

    /// All routes received carrying a communities attribute
    /// containing this value MUST NOT be advertised to other BGP
    /// peers.
    NoAdvertise,

    /// All routes received carrying a communities attribute
    /// containing this value MUST NOT be advertised to external BGP
    /// peers (this includes peers in other members autonomous
    /// systems inside a BGP confederation).
    NoExportSubConfed,

    /// All routes received carrying a communities attribute
    /// containing this value must set the local preference for
    /// the received routes to a low value, preferably zero.
    GracefulShutdown,

    /// Any other community, conventionally `asn:value`.
    UserDefined(u32),
}

impl From<u32> for Community {
    fn from(v: u32) -> Self {
        match v {
            0xFFFFFF01 => Self::NoExport,
            0xFFFFFF02 => Self::NoAdvertise,
            0xFFFFFF03 => Self::NoExportSubConfed,
            0xFFFF0000 => Self::GracefulShutdown,
            x => Self::UserDefined(x),
        }
    }
}

impl From<Community> for u32 {
    fn from(c: Community) -> u32 {
        match c {
            Community::NoExport => 0xFFFFFF01,
            Community::NoAdvertise => 0xFFFFFF02,
            Community::NoExportSubConfed => 0xFFFFFF03,
            Community::GracefulShutdown => 0xFFFF0000,
            Community::UserDefined(x) => x,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum PathOrigin {
    Igp = 0,
    Egp = 1,
    Incomplete = 2,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AsPathSegment {
    pub typ: AsPathType,
    pub value: Vec<u16>,
}

impl AsPathSegment {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        if self.value.len() > u8::MAX as usize {
            return Err(Error::TooLarge("AS path segment".into()));
        }
        let mut buf = vec![self.typ as u8, self.value.len() as u8];
        for v in &self.value {
            buf.extend_from_slice(&v.to_be_bytes());
        }
        Ok(buf)
    }

    /// Decode a complete AS_PATH value. An empty value is an empty path.
    /// Returns `None` on a bad segment type or a count overrunning the
    /// value.
    pub fn list_from_wire(input: &[u8]) -> Option<Vec<AsPathSegment>> {
        segments_from_wire(input, 2)
            .map(|segs| {
                segs.into_iter()
                    .map(|(typ, asns)| AsPathSegment {
                        typ,
                        value: asns
                            .chunks_exact(2)
                            .map(|c| u16::from_be_bytes([c[0], c[1]]))
                            .collect(),
                    })
                    .collect()
            })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct As4PathSegment {
    pub typ: AsPathType,
    pub value: Vec<u32>,
}

impl As4PathSegment {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        if self.value.len() > u8::MAX as usize {
            return Err(Error::TooLarge("AS4 path segment".into()));
        }
        let mut buf = vec![self.typ as u8, self.value.len() as u8];
        for v in &self.value {
            buf.extend_from_slice(&v.to_be_bytes());
        }
        Ok(buf)
    }

    pub fn list_from_wire(input: &[u8]) -> Option<Vec<As4PathSegment>> {
        segments_from_wire(input, 4).map(|segs| {
            segs.into_iter()
                .map(|(typ, asns)| As4PathSegment {
                    typ,
                    value: asns.chunks_exact(4).map(u32_from).collect(),
                })
                .collect()
        })
    }
}

/// Split an AS path value into (type, ASN octets) segments for ASNs of
/// `width` octets.
fn segments_from_wire(
    mut input: &[u8],
    width: usize,
) -> Option<Vec<(AsPathType, &[u8])>> {
    let mut result = Vec::new();
    while !input.is_empty() {
        let [typ, count, rest @ ..] = input else {
            return None;
        };
        let typ = AsPathType::try_from(*typ).ok()?;
        let len = usize::from(*count) * width;
        if rest.len() < len {
            return None;
        }
        let (asns, rest) = rest.split_at(len);
        result.push((typ, asns));
        input = rest;
    }
    Some(result)
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum AsPathType {
    AsSet = 1,
    AsSequence = 2,
}

/// Sent when an error is detected. The connection is closed right after.
///
/// Ref: RFC 4271 §4.5
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct NotificationMessage {
    pub error_code: ErrorCode,
    pub error_subcode: ErrorSubcode,

    /// Diagnostic data, for example the offending attribute of an UPDATE.
    pub data: Vec<u8>,
}

impl NotificationMessage {
    pub const MIN_WIRE_SIZE: usize = 2;

    pub fn new(
        error_code: ErrorCode,
        error_subcode: impl Into<ErrorSubcode>,
    ) -> Self {
        Self {
            error_code,
            error_subcode: error_subcode.into(),
            data: Vec::new(),
        }
    }

    pub fn cease(subcode: CeaseErrorSubcode) -> Self {
        Self::new(ErrorCode::Cease, subcode)
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf =
            vec![u8::from(self.error_code), self.error_subcode.as_u8()];
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    /// Codes and subcodes outside the known registries are kept as raw
    /// values so a peer's notification is never itself a decode error.
    pub fn from_wire(input: &[u8]) -> Result<NotificationMessage, Error> {
        let (input, error_code) = parse_u8(input)?;
        let error_code = ErrorCode::from(error_code);

        let (input, raw) = parse_u8(input)?;
        let error_subcode = match error_code {
            ErrorCode::Header => HeaderErrorSubcode::try_from(raw)
                .map_or(ErrorSubcode::Unknown(raw), Into::into),
            ErrorCode::Open => OpenErrorSubcode::try_from(raw)
                .map_or(ErrorSubcode::Unknown(raw), Into::into),
            ErrorCode::Update => UpdateErrorSubcode::try_from(raw)
                .map_or(ErrorSubcode::Unknown(raw), Into::into),
            ErrorCode::HoldTimerExpired => ErrorSubcode::HoldTime(raw),
            ErrorCode::Fsm => ErrorSubcode::Fsm(raw),
            ErrorCode::Cease => ErrorSubcode::Cease(raw),
            ErrorCode::Unknown(_) => ErrorSubcode::Unknown(raw),
        };
        Ok(NotificationMessage {
            error_code,
            error_subcode,
            data: input.to_owned(),
        })
    }

    /// True for the notification a peer sends when it does not support the
    /// version number we offered.
    pub fn is_version_error(&self) -> bool {
        self.error_subcode
            == ErrorSubcode::Open(OpenErrorSubcode::UnsupportedVersionNumber)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ErrorCode {
    Header = 1,
    Open = 2,
    Update = 3,
    HoldTimerExpired = 4,
    Fsm = 5,
    Cease = 6,

    /// For example ROUTE-REFRESH message error (7, RFC 7313).
    #[num_enum(catch_all)]
    Unknown(u8),
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ErrorSubcode {
    Header(HeaderErrorSubcode),
    Open(OpenErrorSubcode),
    Update(UpdateErrorSubcode),
    HoldTime(u8),
    Fsm(u8),
    Cease(u8),
    Unknown(u8),
}

impl From<HeaderErrorSubcode> for ErrorSubcode {
    fn from(x: HeaderErrorSubcode) -> ErrorSubcode {
        ErrorSubcode::Header(x)
    }
}

impl From<OpenErrorSubcode> for ErrorSubcode {
    fn from(x: OpenErrorSubcode) -> ErrorSubcode {
        ErrorSubcode::Open(x)
    }
}

impl From<UpdateErrorSubcode> for ErrorSubcode {
    fn from(x: UpdateErrorSubcode) -> ErrorSubcode {
        ErrorSubcode::Update(x)
    }
}

impl From<CeaseErrorSubcode> for ErrorSubcode {
    fn from(x: CeaseErrorSubcode) -> ErrorSubcode {
        ErrorSubcode::Cease(x.into())
    }
}

impl ErrorSubcode {
    fn as_u8(&self) -> u8 {
        match self {
            Self::Header(h) => *h as u8,
            Self::Open(o) => *o as u8,
            Self::Update(u) => *u as u8,
            Self::HoldTime(x) => *x,
            Self::Fsm(x) => *x,
            Self::Cease(x) => *x,
            Self::Unknown(x) => *x,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum HeaderErrorSubcode {
    Unspecific = 0,
    ConnectionNotSynchronized,
    BadMessageLength,
    BadMessageType,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum OpenErrorSubcode {
    Unspecific = 0,
    UnsupportedVersionNumber,
    BadPeerAs,
    BadBgpIdentifier,
    UnsupportedOptionalParameter,
    Deprecated,
    UnacceptableHoldTime,
    UnsupportedCapability,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum UpdateErrorSubcode {
    Unspecific = 0,
    MalformedAttributeList,
    UnrecognizedWellKnownAttribute,
    MissingWellKnownAttribute,
    AttributeFlags,
    AttributeLength,
    InvalidOriginAttribute,
    Deprecated,
    InvalidNexthopAttribute,
    OptionalAttribute,
    InvalidNetworkField,
    MalformedAsPath,
}

/// Ref: RFC 4486 §4
#[derive(Debug, PartialEq, Eq, Clone, Copy, IntoPrimitive)]
#[repr(u8)]
pub enum CeaseErrorSubcode {
    Unspecific = 0,
    MaximumNumberofPrefixesReached,
    AdministrativeShutdown,
    PeerDeconfigured,
    AdministrativeReset,
    ConnectionRejected,
    OtherConfigurationChange,
    ConnectionCollisionResolution,
    OutOfResources,
}

/// The optional parameters this speaker understands. Authentication
/// parameters (code 1, deprecated by RFC 5492) are skipped on decode.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum OptionalParameter {
    /// Code 2: RFC 5492
    Capabilities(Vec<Capability>),
}

#[derive(Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum OptionalParameterCode {
    Authentication = 1,
    Capabilities = 2,
}

impl OptionalParameter {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Capabilities(cs) => {
                let mut buf = vec![OptionalParameterCode::Capabilities as u8];
                let mut csbuf = Vec::new();
                for c in cs {
                    csbuf.extend_from_slice(&c.to_wire()?);
                }
                if csbuf.len() > u8::MAX as usize {
                    return Err(Error::TooLarge("capabilities".into()));
                }
                buf.push(csbuf.len() as u8);
                buf.extend_from_slice(&csbuf);
                Ok(buf)
            }
        }
    }

    pub fn from_wire(
        input: &[u8],
    ) -> Result<(&[u8], Option<OptionalParameter>), Error> {
        let [code, len, input @ ..] = input else {
            return Err(Error::MalformedOptionalParameters(
                "truncated parameter header".into(),
            ));
        };
        let len = usize::from(*len);
        if input.len() < len {
            return Err(Error::MalformedOptionalParameters(format!(
                "parameter {code} length {len} exceeds remaining {} octets",
                input.len()
            )));
        }
        let (mut cap_input, input) = input.split_at(len);

        match OptionalParameterCode::try_from(*code) {
            Ok(OptionalParameterCode::Authentication) => Ok((input, None)),
            Ok(OptionalParameterCode::Capabilities) => {
                let mut result = Vec::new();
                while !cap_input.is_empty() {
                    let (out, cap) = Capability::from_wire(cap_input)?;
                    result.push(cap);
                    cap_input = out;
                }
                Ok((input, Some(OptionalParameter::Capabilities(result))))
            }
            Err(_) => Err(Error::UnsupportedOptionalParameter(*code)),
        }
    }
}

/// Optional capabilities supported by a BGP implementation.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Capability {
    /// RFC 2858
    MultiprotocolExtensions { afi: u16, safi: u8 },

    /// RFC 2918
    RouteRefresh,

    /// RFC 6793
    FourOctetAs { asn: u32 },

    /// A capability this speaker does not interpret, kept verbatim.
    Unknown { code: u8, value: Vec<u8> },
}

#[derive(Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum CapabilityCode {
    /// RFC 2858
    MultiprotocolExtensions = 1,

    /// RFC 2918
    RouteRefresh = 2,

    /// RFC 6793
    FourOctetAs = 65,
}

impl Capability {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::MultiprotocolExtensions { afi, safi } => {
                let mut buf =
                    vec![CapabilityCode::MultiprotocolExtensions as u8, 4];
                buf.extend_from_slice(&afi.to_be_bytes());
                buf.push(0);
                buf.push(*safi);
                Ok(buf)
            }
            Self::RouteRefresh => {
                Ok(vec![CapabilityCode::RouteRefresh as u8, 0])
            }
            Self::FourOctetAs { asn } => {
                let mut buf = vec![CapabilityCode::FourOctetAs as u8, 4];
                buf.extend_from_slice(&asn.to_be_bytes());
                Ok(buf)
            }
            Self::Unknown { code, value } => {
                if value.len() > u8::MAX as usize {
                    return Err(Error::TooLarge(format!(
                        "capability {code}"
                    )));
                }
                let mut buf = vec![*code, value.len() as u8];
                buf.extend_from_slice(value);
                Ok(buf)
            }
        }
    }

    pub fn from_wire(input: &[u8]) -> Result<(&[u8], Capability), Error> {
        let [code, len, input @ ..] = input else {
            return Err(Error::MalformedOptionalParameters(
                "truncated capability header".into(),
            ));
        };
        let len = usize::from(*len);
        if input.len() < len {
            return Err(Error::MalformedOptionalParameters(format!(
                "capability {code} length {len} exceeds remaining {} octets",
                input.len()
            )));
        }
        let (value, input) = input.split_at(len);
        let malformed = || {
            Error::MalformedOptionalParameters(format!(
                "capability {code} has length {len}"
            ))
        };

        let cap = match CapabilityCode::try_from(*code) {
            Ok(CapabilityCode::MultiprotocolExtensions) => {
                let [a0, a1, _reserved, safi] = value else {
                    return Err(malformed());
                };
                Capability::MultiprotocolExtensions {
                    afi: u16::from_be_bytes([*a0, *a1]),
                    safi: *safi,
                }
            }
            Ok(CapabilityCode::RouteRefresh) => Capability::RouteRefresh,
            Ok(CapabilityCode::FourOctetAs) => {
                if value.len() != 4 {
                    return Err(malformed());
                }
                Capability::FourOctetAs {
                    asn: u32_from(value),
                }
            }
            Err(_) => Capability::Unknown {
                code: *code,
                value: value.to_vec(),
            },
        };
        Ok((input, cap))
    }
}
