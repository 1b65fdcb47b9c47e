//! DHT message model. See [codec](self::codec) for the binary wire format.

mod codec;

use std::convert::TryFrom;
use std::net::SocketAddr;

use crate::common::{Contact, DhtValue, Kuid};

pub use codec::{MAX_LIST_SIZE, MAX_MESSAGE_SIZE};

/// Errors encoding or decoding a [Message].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Malformed message: {0}")]
    Malformed(&'static str),

    #[error("Message is truncated")]
    Truncated,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Invalid socket address length: {0}")]
    InvalidAddress(u8),

    /// A list is longer than the single byte length prefix allows.
    #[error("Too many elements in list: {0}")]
    TooManyElements(usize),

    #[error("Message of {size} bytes exceeds the maximum of {max} bytes")]
    PacketTooLarge { size: usize, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
/// The one byte type tag of every message.
pub enum MessageType {
    PingRequest = 0,
    PingResponse = 1,
    FindNodeRequest = 2,
    FindNodeResponse = 3,
    FindValueRequest = 4,
    FindValueResponse = 5,
    StoreRequest = 6,
    StoreResponse = 7,
}

impl MessageType {
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            MessageType::PingRequest
                | MessageType::FindNodeRequest
                | MessageType::FindValueRequest
                | MessageType::StoreRequest
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::PingRequest),
            1 => Ok(MessageType::PingResponse),
            2 => Ok(MessageType::FindNodeRequest),
            3 => Ok(MessageType::FindNodeResponse),
            4 => Ok(MessageType::FindValueRequest),
            5 => Ok(MessageType::FindValueResponse),
            6 => Ok(MessageType::StoreRequest),
            7 => Ok(MessageType::StoreResponse),
            _ => Err(MessageError::UnknownMessageType(value)),
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    /// Arbitrary tag of the implementation that sent this message.
    pub vendor: u32,
    /// Protocol version of the sender.
    pub version: u16,
    /// Node id of the sender, `None` for anonymous messages.
    pub node_id: Option<Kuid>,
    /// Correlates requests and responses.
    pub message_id: Option<Kuid>,
    pub body: MessageBody,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    pub fn is_request(&self) -> bool {
        self.message_type().is_request()
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageBody {
    PingRequest,
    PingResponse(PingResponse),
    FindNodeRequest(FindNodeRequest),
    FindNodeResponse(FindNodeResponse),
    FindValueRequest(FindValueRequest),
    FindValueResponse(FindValueResponse),
    StoreRequest(StoreRequest),
    StoreResponse(StoreResponse),
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::PingRequest => MessageType::PingRequest,
            MessageBody::PingResponse(_) => MessageType::PingResponse,
            MessageBody::FindNodeRequest(_) => MessageType::FindNodeRequest,
            MessageBody::FindNodeResponse(_) => MessageType::FindNodeResponse,
            MessageBody::FindValueRequest(_) => MessageType::FindValueRequest,
            MessageBody::FindValueResponse(_) => MessageType::FindValueResponse,
            MessageBody::StoreRequest(_) => MessageType::StoreRequest,
            MessageBody::StoreResponse(_) => MessageType::StoreResponse,
        }
    }

    pub fn is_request(&self) -> bool {
        self.message_type().is_request()
    }
}

// === PING ===

#[derive(Debug, PartialEq, Clone)]
pub struct PingResponse {
    /// The address of the requester as seen by the responder.
    pub external_address: Option<SocketAddr>,
}

// === FIND_NODE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequest {
    pub target: Kuid,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeResponse {
    /// Token the requester must present in a following [StoreRequest].
    pub query_key: Vec<u8>,
    pub contacts: Vec<Contact>,
}

// === FIND_VALUE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindValueRequest {
    pub target: Kuid,
    /// Only return values from these creators, all of them if empty.
    pub secondary_keys: Vec<Kuid>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindValueResponse {
    /// Secondary keys of values available but not included in this response.
    pub secondary_keys: Vec<Kuid>,
    pub values: Vec<WireValue>,
}

// === STORE ===

#[derive(Debug, PartialEq, Clone)]
pub struct StoreRequest {
    pub query_key: Vec<u8>,
    pub values: Vec<WireValue>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct StoreResponse {
    pub statuses: Vec<StoreStatus>,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct StoreStatus {
    pub primary_key: Kuid,
    pub secondary_key: Kuid,
    pub code: StoreStatusCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StoreStatusCode {
    Failed = 0,
    Succeeded = 1,
}

impl TryFrom<u8> for StoreStatusCode {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StoreStatusCode::Failed),
            1 => Ok(StoreStatusCode::Succeeded),
            _ => Err(MessageError::Malformed("unknown store status")),
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
/// A value as it travels on the wire, with the contact that created it.
pub struct WireValue {
    pub creator: Contact,
    pub primary_key: Kuid,
    pub value: DhtValue,
}

impl WireValue {
    /// Values are keyed by their creator under a primary key.
    pub fn secondary_key(&self) -> &Kuid {
        self.creator.node_id()
    }
}
