//! Binary wire format of [Message]s.
//!
//! All integers are big-endian. A message is a fixed header followed by a
//! payload specific to its type:
//!
//! ```text
//! [4] vendor  [2] version
//! [1] node id flag     ([20] node id)
//! [1] message id flag  ([20] message id)
//! [1] message type
//! [..] payload
//! ```
//!
//! Socket addresses are `[1] ip length, [n] ip, [2] port`, a length of zero
//! being no address. Lists are prefixed with a one byte element count.

use std::convert::{TryFrom, TryInto};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::*;
use crate::common::{Contact, Kuid, ValueFactoryRegistry, ValueType, Version, KUID_SIZE};

/// Maximum encoded size of a message.
pub const MAX_MESSAGE_SIZE: usize = 8192;
/// Lists are length prefixed with a single byte.
pub const MAX_LIST_SIZE: usize = u8::MAX as usize;

const ABSENT: u8 = 0;
const PRESENT: u8 = 1;

impl Message {
    /// Encodes this message, failing if it would exceed [MAX_MESSAGE_SIZE].
    pub fn to_bytes(&self) -> Result<Bytes, MessageError> {
        self.to_bytes_with_limit(MAX_MESSAGE_SIZE)
    }

    /// Encodes this message, failing if it would exceed `max_size` bytes.
    pub fn to_bytes_with_limit(&self, max_size: usize) -> Result<Bytes, MessageError> {
        let mut buf = BytesMut::with_capacity(64);

        buf.put_u32(self.vendor);
        buf.put_u16(self.version);
        put_optional_kuid(&mut buf, self.node_id.as_ref());
        put_optional_kuid(&mut buf, self.message_id.as_ref());
        buf.put_u8(self.message_type() as u8);

        match &self.body {
            MessageBody::PingRequest => {}
            MessageBody::PingResponse(ping) => {
                put_address(&mut buf, ping.external_address.as_ref());
            }
            MessageBody::FindNodeRequest(request) => {
                buf.put_slice(request.target.as_bytes());
            }
            MessageBody::FindNodeResponse(response) => {
                put_query_key(&mut buf, &response.query_key)?;
                put_list(&mut buf, &response.contacts, put_contact)?;
            }
            MessageBody::FindValueRequest(request) => {
                buf.put_slice(request.target.as_bytes());
                put_list(&mut buf, &request.secondary_keys, put_kuid)?;
            }
            MessageBody::FindValueResponse(response) => {
                put_list(&mut buf, &response.secondary_keys, put_kuid)?;
                put_list(&mut buf, &response.values, put_value)?;
            }
            MessageBody::StoreRequest(request) => {
                put_query_key(&mut buf, &request.query_key)?;
                put_list(&mut buf, &request.values, put_value)?;
            }
            MessageBody::StoreResponse(response) => {
                put_list(&mut buf, &response.statuses, put_status)?;
            }
        }

        if buf.len() > max_size {
            return Err(MessageError::PacketTooLarge {
                size: buf.len(),
                max: max_size,
            });
        }

        Ok(buf.freeze())
    }

    /// Decodes a message, accepting values of any type as opaque bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Message, MessageError> {
        Self::from_bytes_with(bytes, &ValueFactoryRegistry::new())
    }

    /// Decodes a message, building values through the given registry.
    pub fn from_bytes_with(
        bytes: &[u8],
        registry: &ValueFactoryRegistry,
    ) -> Result<Message, MessageError> {
        let mut reader = Reader { buf: bytes };

        let vendor = reader.u32()?;
        let version = reader.u16()?;
        let node_id = reader.optional_kuid()?;
        let message_id = reader.optional_kuid()?;
        let message_type = MessageType::try_from(reader.u8()?)?;

        let body = match message_type {
            MessageType::PingRequest => MessageBody::PingRequest,
            MessageType::PingResponse => MessageBody::PingResponse(PingResponse {
                external_address: reader.address()?,
            }),
            MessageType::FindNodeRequest => MessageBody::FindNodeRequest(FindNodeRequest {
                target: reader.kuid()?,
            }),
            MessageType::FindNodeResponse => MessageBody::FindNodeResponse(FindNodeResponse {
                query_key: reader.query_key()?,
                contacts: reader.list(|r| r.contact())?,
            }),
            MessageType::FindValueRequest => MessageBody::FindValueRequest(FindValueRequest {
                target: reader.kuid()?,
                secondary_keys: reader.list(|r| r.kuid())?,
            }),
            MessageType::FindValueResponse => {
                MessageBody::FindValueResponse(FindValueResponse {
                    secondary_keys: reader.list(|r| r.kuid())?,
                    values: reader.list(|r| r.value(registry))?,
                })
            }
            MessageType::StoreRequest => MessageBody::StoreRequest(StoreRequest {
                query_key: reader.query_key()?,
                values: reader.list(|r| r.value(registry))?,
            }),
            MessageType::StoreResponse => MessageBody::StoreResponse(StoreResponse {
                statuses: reader.list(|r| r.status())?,
            }),
        };

        if !reader.buf.is_empty() {
            return Err(MessageError::Malformed("trailing bytes"));
        }

        Ok(Message {
            vendor,
            version,
            node_id,
            message_id,
            body,
        })
    }
}

// === Encoding ===

fn put_optional_kuid(buf: &mut BytesMut, id: Option<&Kuid>) {
    match id {
        Some(id) => {
            buf.put_u8(PRESENT);
            buf.put_slice(id.as_bytes());
        }
        None => buf.put_u8(ABSENT),
    }
}

fn put_kuid(buf: &mut BytesMut, id: &Kuid) -> Result<(), MessageError> {
    buf.put_slice(id.as_bytes());
    Ok(())
}

fn put_address(buf: &mut BytesMut, address: Option<&SocketAddr>) {
    match address {
        Some(SocketAddr::V4(address)) => {
            buf.put_u8(4);
            buf.put_slice(&address.ip().octets());
            buf.put_u16(address.port());
        }
        Some(SocketAddr::V6(address)) => {
            buf.put_u8(16);
            buf.put_slice(&address.ip().octets());
            buf.put_u16(address.port());
        }
        None => buf.put_u8(0),
    }
}

fn put_query_key(buf: &mut BytesMut, query_key: &[u8]) -> Result<(), MessageError> {
    if query_key.len() > MAX_LIST_SIZE {
        return Err(MessageError::TooManyElements(query_key.len()));
    }

    buf.put_u8(query_key.len() as u8);
    buf.put_slice(query_key);
    Ok(())
}

fn put_list<T>(
    buf: &mut BytesMut,
    items: &[T],
    put: fn(&mut BytesMut, &T) -> Result<(), MessageError>,
) -> Result<(), MessageError> {
    if items.len() > MAX_LIST_SIZE {
        return Err(MessageError::TooManyElements(items.len()));
    }

    buf.put_u8(items.len() as u8);
    for item in items {
        put(buf, item)?;
    }

    Ok(())
}

fn put_contact(buf: &mut BytesMut, contact: &Contact) -> Result<(), MessageError> {
    buf.put_slice(contact.node_id().as_bytes());
    put_address(buf, Some(&contact.address()));
    Ok(())
}

fn put_value(buf: &mut BytesMut, value: &WireValue) -> Result<(), MessageError> {
    let bytes = value.value.bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(MessageError::PacketTooLarge {
            size: bytes.len(),
            max: u16::MAX as usize,
        });
    }

    put_contact(buf, &value.creator)?;
    buf.put_slice(value.primary_key.as_bytes());
    buf.put_u32(value.value.value_type().0);
    buf.put_u8(value.value.version().major);
    buf.put_u8(value.value.version().minor);
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
    Ok(())
}

fn put_status(buf: &mut BytesMut, status: &StoreStatus) -> Result<(), MessageError> {
    buf.put_slice(status.primary_key.as_bytes());
    buf.put_slice(status.secondary_key.as_bytes());
    buf.put_u8(status.code as u8);
    Ok(())
}

// === Decoding ===

struct Reader<'a> {
    buf: &'a [u8],
}

impl Reader<'_> {
    fn ensure(&self, len: usize) -> Result<(), MessageError> {
        if self.buf.remaining() < len {
            return Err(MessageError::Truncated);
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, MessageError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, MessageError> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32, MessageError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    fn bytes(&mut self, len: usize) -> Result<&[u8], MessageError> {
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn kuid(&mut self) -> Result<Kuid, MessageError> {
        let bytes: [u8; KUID_SIZE] = self
            .bytes(KUID_SIZE)?
            .try_into()
            .map_err(|_| MessageError::Truncated)?;
        Ok(Kuid(bytes))
    }

    fn optional_kuid(&mut self) -> Result<Option<Kuid>, MessageError> {
        match self.u8()? {
            ABSENT => Ok(None),
            PRESENT => Ok(Some(self.kuid()?)),
            _ => Err(MessageError::Malformed("invalid id presence flag")),
        }
    }

    fn address(&mut self) -> Result<Option<SocketAddr>, MessageError> {
        let len = self.u8()?;
        let ip = match len {
            0 => return Ok(None),
            4 => {
                let octets: [u8; 4] = self
                    .bytes(4)?
                    .try_into()
                    .map_err(|_| MessageError::Truncated)?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            16 => {
                let octets: [u8; 16] = self
                    .bytes(16)?
                    .try_into()
                    .map_err(|_| MessageError::Truncated)?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return Err(MessageError::InvalidAddress(len)),
        };
        let port = self.u16()?;

        Ok(Some(SocketAddr::new(ip, port)))
    }

    fn query_key(&mut self) -> Result<Vec<u8>, MessageError> {
        let len = self.u8()? as usize;
        Ok(self.bytes(len)?.to_vec())
    }

    fn list<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> Result<T, MessageError>,
    ) -> Result<Vec<T>, MessageError> {
        let count = self.u8()? as usize;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(item(self)?);
        }
        Ok(items)
    }

    fn contact(&mut self) -> Result<Contact, MessageError> {
        let node_id = self.kuid()?;
        let address = self
            .address()?
            .ok_or(MessageError::Malformed("contact without address"))?;

        Ok(Contact::new(node_id, address))
    }

    fn value(&mut self, registry: &ValueFactoryRegistry) -> Result<WireValue, MessageError> {
        let creator = self.contact()?;
        let primary_key = self.kuid()?;
        let value_type = ValueType(self.u32()?);
        let version = Version::new(self.u8()?, self.u8()?);
        let len = self.u16()? as usize;
        let bytes = Bytes::copy_from_slice(self.bytes(len)?);

        Ok(WireValue {
            creator,
            primary_key,
            value: registry.create(value_type, version, bytes)?,
        })
    }

    fn status(&mut self) -> Result<StoreStatus, MessageError> {
        Ok(StoreStatus {
            primary_key: self.kuid()?,
            secondary_key: self.kuid()?,
            code: StoreStatusCode::try_from(self.u8()?)?,
        })
    }
}
