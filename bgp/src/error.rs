// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::messages::{
    ErrorCode, ErrorSubcode, HeaderErrorSubcode, NotificationMessage,
    OpenErrorSubcode, UpdateErrorSubcode,
};
use num_enum::TryFromPrimitiveError;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("too small: {0}")]
    TooSmall(String),

    #[error("too large: {0}")]
    TooLarge(String),

    #[error("bad message length: {0}")]
    BadMessageLength(u16),

    #[error("bad message type: {0}")]
    BadMessageType(u8),

    #[error("unsupported version number: {0}")]
    UnsupportedVersionNumber(u8),

    #[error("bad peer as: {0}")]
    BadPeerAs(ExpectationMismatch<u32>),

    #[error("bad bgp identifier: {0}")]
    BadBgpIdentifier(Ipv4Addr),

    #[error("unsupported optional parameter type: {0}")]
    UnsupportedOptionalParameter(u8),

    #[error("malformed optional parameters: {0}")]
    MalformedOptionalParameters(String),

    #[error("unacceptable hold time: {0}")]
    UnacceptableHoldTime(u16),

    #[error("malformed attribute list: {0}")]
    MalformedAttributeList(String),

    #[error("attribute length error: {0}")]
    AttributeLength(AttributeError),

    #[error("invalid origin: {0}")]
    InvalidOrigin(AttributeError),

    #[error("optional attribute error: {0}")]
    OptionalAttribute(AttributeError),

    #[error("malformed as path: {0}")]
    MalformedAsPath(AttributeError),

    #[error("invalid network field: prefix length {length}, max is {max}")]
    InvalidNetworkField { length: u8, max: u8 },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout")]
    Timeout,

    #[error("disconnected")]
    Disconnected,

    #[error("channel send: {0}")]
    ChannelSend(String),

    #[error("Message type error")]
    MessageType(#[from] TryFromPrimitiveError<crate::messages::MessageType>),

    #[error("message parse error")]
    Parse(nom::Err<(Vec<u8>, nom::error::ErrorKind)>),

    #[error("Channel connect error")]
    ChannelConnect,

    #[error("Attempt to send a message when not connected")]
    NotConnected,

    #[error("Unknown peer: {0}")]
    UnknownPeer(IpAddr),

    #[error("Session for peer already exists")]
    PeerExists,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// The offending attribute of an UPDATE, from its flags octet through the
/// end of its value as far as it was present on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeError {
    pub type_code: u8,
    pub raw: Vec<u8>,
}

impl AttributeError {
    pub fn new(type_code: u8, raw: &[u8]) -> Self {
        Self {
            type_code,
            raw: raw.to_vec(),
        }
    }
}

impl Display for AttributeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "type {} ({} octets)", self.type_code, self.raw.len())
    }
}

#[derive(Debug)]
pub struct ExpectationMismatch<T: Display> {
    pub expected: T,
    pub got: T,
}

impl<T: Display> Display for ExpectationMismatch<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected: {} got: {}", self.expected, self.got)
    }
}

impl<'a> From<nom::Err<(&'a [u8], nom::error::ErrorKind)>> for Error {
    fn from(e: nom::Err<(&'a [u8], nom::error::ErrorKind)>) -> Error {
        Error::Parse(e.to_owned())
    }
}

impl Error {
    /// The NOTIFICATION a speaker sends when it detects this error in a
    /// received message. Errors that are not protocol errors have none.
    pub fn notification(&self) -> Option<NotificationMessage> {
        let (error_code, error_subcode, data): (_, ErrorSubcode, _) =
            match self {
                Self::BadMessageLength(len) => (
                    ErrorCode::Header,
                    HeaderErrorSubcode::BadMessageLength.into(),
                    len.to_be_bytes().to_vec(),
                ),
                Self::BadMessageType(typ) => (
                    ErrorCode::Header,
                    HeaderErrorSubcode::BadMessageType.into(),
                    vec![*typ],
                ),
                // Data is the largest locally supported version.
                Self::UnsupportedVersionNumber(_) => (
                    ErrorCode::Open,
                    OpenErrorSubcode::UnsupportedVersionNumber.into(),
                    u16::from(crate::messages::BGP4).to_be_bytes().to_vec(),
                ),
                Self::BadPeerAs(_) => (
                    ErrorCode::Open,
                    OpenErrorSubcode::BadPeerAs.into(),
                    Vec::new(),
                ),
                Self::BadBgpIdentifier(_) => (
                    ErrorCode::Open,
                    OpenErrorSubcode::BadBgpIdentifier.into(),
                    Vec::new(),
                ),
                Self::UnsupportedOptionalParameter(_) => (
                    ErrorCode::Open,
                    OpenErrorSubcode::UnsupportedOptionalParameter.into(),
                    Vec::new(),
                ),
                Self::MalformedOptionalParameters(_) => (
                    ErrorCode::Open,
                    OpenErrorSubcode::Unspecific.into(),
                    Vec::new(),
                ),
                Self::UnacceptableHoldTime(_) => (
                    ErrorCode::Open,
                    OpenErrorSubcode::UnacceptableHoldTime.into(),
                    Vec::new(),
                ),
                Self::MalformedAttributeList(_) => (
                    ErrorCode::Update,
                    UpdateErrorSubcode::MalformedAttributeList.into(),
                    Vec::new(),
                ),
                Self::AttributeLength(a) => (
                    ErrorCode::Update,
                    UpdateErrorSubcode::AttributeLength.into(),
                    a.raw.clone(),
                ),
                Self::InvalidOrigin(a) => (
                    ErrorCode::Update,
                    UpdateErrorSubcode::InvalidOriginAttribute.into(),
                    a.raw.clone(),
                ),
                Self::OptionalAttribute(a) => (
                    ErrorCode::Update,
                    UpdateErrorSubcode::OptionalAttribute.into(),
                    a.raw.clone(),
                ),
                Self::MalformedAsPath(a) => (
                    ErrorCode::Update,
                    UpdateErrorSubcode::MalformedAsPath.into(),
                    a.raw.clone(),
                ),
                Self::InvalidNetworkField { .. } => (
                    ErrorCode::Update,
                    UpdateErrorSubcode::InvalidNetworkField.into(),
                    Vec::new(),
                ),
                _ => return None,
            };
        Some(NotificationMessage {
            error_code,
            error_subcode,
            data,
        })
    }
}
