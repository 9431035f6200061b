//! STUN message codec (RFC 5389) with the attributes ICE and TURN need.
//!
//! Attributes are TLV with 4-byte alignment. MESSAGE-INTEGRITY is an
//! HMAC-SHA1 over the message up to the integrity attribute, with the
//! header length field patched to include it; FINGERPRINT is a CRC-32 over
//! everything before it, XORed with `0x5354554E`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::Error;
use crate::Result;

type HmacSha1 = Hmac<Sha1>;

/// STUN magic cookie (RFC 5389 Section 6).
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// Fixed STUN header size in bytes.
pub const HEADER_SIZE: usize = 20;

/// XOR mask applied to the CRC-32 fingerprint.
const FINGERPRINT_XOR: u32 = 0x5354_554E;

/// Length of a MESSAGE-INTEGRITY value (HMAC-SHA1 output).
const INTEGRITY_LEN: usize = 20;

/// STUN message class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunClass {
    /// Request expecting a response
    Request,
    /// One-way indication
    Indication,
    /// Success response
    SuccessResponse,
    /// Error response
    ErrorResponse,
}

/// STUN/TURN methods this stack uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StunMethod {
    /// Binding (RFC 5389)
    Binding = 0x001,
    /// Allocate (RFC 5766)
    Allocate = 0x003,
    /// Refresh (RFC 5766)
    Refresh = 0x004,
    /// Send indication (RFC 5766)
    Send = 0x006,
    /// Data indication (RFC 5766)
    Data = 0x007,
    /// CreatePermission (RFC 5766)
    CreatePermission = 0x008,
    /// ChannelBind (RFC 5766)
    ChannelBind = 0x009,
}

impl StunMethod {
    fn from_bits(bits: u16) -> Result<Self> {
        match bits {
            0x001 => Ok(Self::Binding),
            0x003 => Ok(Self::Allocate),
            0x004 => Ok(Self::Refresh),
            0x006 => Ok(Self::Send),
            0x007 => Ok(Self::Data),
            0x008 => Ok(Self::CreatePermission),
            0x009 => Ok(Self::ChannelBind),
            other => Err(Error::StunError(format!("unknown STUN method {other:#x}"))),
        }
    }
}

/// Attribute type codes.
mod attr_type {
    pub const MAPPED_ADDRESS: u16 = 0x0001;
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const ERROR_CODE: u16 = 0x0009;
    pub const CHANNEL_NUMBER: u16 = 0x000C;
    pub const LIFETIME: u16 = 0x000D;
    pub const XOR_PEER_ADDRESS: u16 = 0x0012;
    pub const DATA: u16 = 0x0013;
    pub const REALM: u16 = 0x0014;
    pub const NONCE: u16 = 0x0015;
    pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
    pub const REQUESTED_TRANSPORT: u16 = 0x0019;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const PRIORITY: u16 = 0x0024;
    pub const USE_CANDIDATE: u16 = 0x0025;
    pub const SOFTWARE: u16 = 0x8022;
    pub const FINGERPRINT: u16 = 0x8028;
    pub const ICE_CONTROLLED: u16 = 0x8029;
    pub const ICE_CONTROLLING: u16 = 0x802A;
}

/// A STUN attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    /// Reflexive transport address, XOR-obfuscated
    XorMappedAddress(SocketAddr),
    /// Relayed transport address from a TURN allocation
    XorRelayedAddress(SocketAddr),
    /// Peer address in TURN permission/indication messages
    XorPeerAddress(SocketAddr),
    /// Plain mapped address (legacy servers)
    MappedAddress(SocketAddr),
    /// ICE credentials, `remote_ufrag:local_ufrag`
    Username(String),
    /// HMAC-SHA1 over the preceding message
    MessageIntegrity([u8; 20]),
    /// Error code and reason phrase
    ErrorCode {
        /// Numeric code (e.g. 401, 487)
        code: u16,
        /// Human-readable reason
        reason: String,
    },
    /// TURN channel number
    ChannelNumber(u16),
    /// Allocation lifetime in seconds
    Lifetime(u32),
    /// Application payload of a Send/Data indication
    Data(Bytes),
    /// Authentication realm
    Realm(String),
    /// Authentication nonce
    Nonce(String),
    /// Requested transport protocol (17 = UDP)
    RequestedTransport(u8),
    /// ICE candidate priority of the reflexive candidate a check creates
    Priority(u32),
    /// Nomination flag on a connectivity check
    UseCandidate,
    /// Tiebreaker from the controlled agent
    IceControlled(u64),
    /// Tiebreaker from the controlling agent
    IceControlling(u64),
    /// Software descriptor
    Software(String),
    /// CRC-32 integrity check
    Fingerprint(u32),
    /// Attribute this stack does not interpret
    Unknown {
        /// Attribute type code
        attr_type: u16,
        /// Raw value bytes
        value: Bytes,
    },
}

impl StunAttribute {
    fn type_code(&self) -> u16 {
        match self {
            Self::XorMappedAddress(_) => attr_type::XOR_MAPPED_ADDRESS,
            Self::XorRelayedAddress(_) => attr_type::XOR_RELAYED_ADDRESS,
            Self::XorPeerAddress(_) => attr_type::XOR_PEER_ADDRESS,
            Self::MappedAddress(_) => attr_type::MAPPED_ADDRESS,
            Self::Username(_) => attr_type::USERNAME,
            Self::MessageIntegrity(_) => attr_type::MESSAGE_INTEGRITY,
            Self::ErrorCode { .. } => attr_type::ERROR_CODE,
            Self::ChannelNumber(_) => attr_type::CHANNEL_NUMBER,
            Self::Lifetime(_) => attr_type::LIFETIME,
            Self::Data(_) => attr_type::DATA,
            Self::Realm(_) => attr_type::REALM,
            Self::Nonce(_) => attr_type::NONCE,
            Self::RequestedTransport(_) => attr_type::REQUESTED_TRANSPORT,
            Self::Priority(_) => attr_type::PRIORITY,
            Self::UseCandidate => attr_type::USE_CANDIDATE,
            Self::IceControlled(_) => attr_type::ICE_CONTROLLED,
            Self::IceControlling(_) => attr_type::ICE_CONTROLLING,
            Self::Software(_) => attr_type::SOFTWARE,
            Self::Fingerprint(_) => attr_type::FINGERPRINT,
            Self::Unknown { attr_type, .. } => *attr_type,
        }
    }
}

/// A STUN message: class, method, transaction id and attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    /// Message class
    pub class: StunClass,
    /// Message method
    pub method: StunMethod,
    /// 96-bit transaction identifier
    pub transaction_id: [u8; 12],
    /// Attributes in wire order
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Create a message with a fresh random transaction id.
    pub fn new(class: StunClass, method: StunMethod) -> Self {
        Self {
            class,
            method,
            transaction_id: rand::random(),
            attributes: Vec::new(),
        }
    }

    /// Binding request with a fresh transaction id.
    pub fn binding_request() -> Self {
        Self::new(StunClass::Request, StunMethod::Binding)
    }

    /// Binding success response echoing `transaction_id`.
    pub fn binding_response(transaction_id: [u8; 12]) -> Self {
        Self {
            class: StunClass::SuccessResponse,
            method: StunMethod::Binding,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Binding indication (keepalive).
    pub fn binding_indication() -> Self {
        Self::new(StunClass::Indication, StunMethod::Binding)
    }

    /// Append an attribute.
    pub fn add_attribute(&mut self, attr: StunAttribute) -> &mut Self {
        self.attributes.push(attr);
        self
    }

    /// First attribute matching `predicate`.
    pub fn attribute<T>(&self, predicate: impl Fn(&StunAttribute) -> Option<T>) -> Option<T> {
        self.attributes.iter().find_map(predicate)
    }

    /// XOR-MAPPED-ADDRESS value, if present.
    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attribute(|a| match a {
            StunAttribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// XOR-RELAYED-ADDRESS value, if present.
    pub fn xor_relayed_address(&self) -> Option<SocketAddr> {
        self.attribute(|a| match a {
            StunAttribute::XorRelayedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// ERROR-CODE value, if present.
    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }

    /// True when the USE-CANDIDATE attribute is present.
    pub fn has_use_candidate(&self) -> bool {
        self.attributes
            .iter()
            .any(|a| matches!(a, StunAttribute::UseCandidate))
    }

    /// Quick check that a datagram can only be STUN: leading two bits are
    /// zero and the magic cookie is in place.
    pub fn is_stun(data: &[u8]) -> bool {
        data.len() >= HEADER_SIZE
            && data[0] & 0xC0 == 0
            && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
    }

    /// Parse a STUN message.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: HEADER_SIZE,
                available: data.len(),
            });
        }
        if !Self::is_stun(data) {
            return Err(Error::NotStun);
        }

        let msg_type = u16::from_be_bytes([data[0], data[1]]);
        let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if data.len() < HEADER_SIZE + msg_len {
            return Err(Error::BufferTooSmall {
                required: HEADER_SIZE + msg_len,
                available: data.len(),
            });
        }
        if msg_len % 4 != 0 {
            return Err(Error::StunError(format!(
                "message length {msg_len} not 32-bit aligned"
            )));
        }

        let class = match ((msg_type >> 7) & 0x02) | ((msg_type >> 4) & 0x01) {
            0b00 => StunClass::Request,
            0b01 => StunClass::Indication,
            0b10 => StunClass::SuccessResponse,
            _ => StunClass::ErrorResponse,
        };
        let method_bits =
            ((msg_type >> 2) & 0x0F80) | ((msg_type >> 1) & 0x0070) | (msg_type & 0x000F);
        let method = StunMethod::from_bits(method_bits)?;

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..20]);

        let mut attributes = Vec::new();
        let mut buf = &data[HEADER_SIZE..HEADER_SIZE + msg_len];
        while buf.remaining() >= 4 {
            let attr_type = buf.get_u16();
            let attr_len = buf.get_u16() as usize;
            if buf.remaining() < attr_len {
                return Err(Error::BufferTooSmall {
                    required: attr_len,
                    available: buf.remaining(),
                });
            }
            let value = Bytes::copy_from_slice(&buf[..attr_len]);
            buf.advance(attr_len);
            // Values are padded to 4-byte boundaries
            let pad = (4 - attr_len % 4) % 4;
            buf.advance(pad.min(buf.remaining()));

            attributes.push(Self::parse_attribute(attr_type, value, &transaction_id)?);
        }

        Ok(Self {
            class,
            method,
            transaction_id,
            attributes,
        })
    }

    fn parse_attribute(
        attr_type: u16,
        value: Bytes,
        transaction_id: &[u8; 12],
    ) -> Result<StunAttribute> {
        let attr = match attr_type {
            attr_type::XOR_MAPPED_ADDRESS => {
                StunAttribute::XorMappedAddress(decode_xor_address(&value, transaction_id)?)
            }
            attr_type::XOR_RELAYED_ADDRESS => {
                StunAttribute::XorRelayedAddress(decode_xor_address(&value, transaction_id)?)
            }
            attr_type::XOR_PEER_ADDRESS => {
                StunAttribute::XorPeerAddress(decode_xor_address(&value, transaction_id)?)
            }
            attr_type::MAPPED_ADDRESS => {
                StunAttribute::MappedAddress(decode_plain_address(&value)?)
            }
            attr_type::USERNAME => StunAttribute::Username(utf8(&value, "USERNAME")?),
            attr_type::MESSAGE_INTEGRITY => {
                if value.len() != INTEGRITY_LEN {
                    return Err(Error::StunError(format!(
                        "MESSAGE-INTEGRITY of {} bytes",
                        value.len()
                    )));
                }
                let mut mac = [0u8; INTEGRITY_LEN];
                mac.copy_from_slice(&value);
                StunAttribute::MessageIntegrity(mac)
            }
            attr_type::ERROR_CODE => {
                if value.len() < 4 {
                    return Err(Error::StunError("short ERROR-CODE".to_string()));
                }
                let class = (value[2] & 0x07) as u16;
                let number = value[3] as u16;
                StunAttribute::ErrorCode {
                    code: class * 100 + number,
                    reason: utf8(&value.slice(4..), "ERROR-CODE reason")?,
                }
            }
            attr_type::CHANNEL_NUMBER => {
                if value.len() < 4 {
                    return Err(Error::StunError("short CHANNEL-NUMBER".to_string()));
                }
                StunAttribute::ChannelNumber(u16::from_be_bytes([value[0], value[1]]))
            }
            attr_type::LIFETIME => {
                if value.len() != 4 {
                    return Err(Error::StunError("short LIFETIME".to_string()));
                }
                StunAttribute::Lifetime(u32::from_be_bytes([
                    value[0], value[1], value[2], value[3],
                ]))
            }
            attr_type::DATA => StunAttribute::Data(value),
            attr_type::REALM => StunAttribute::Realm(utf8(&value, "REALM")?),
            attr_type::NONCE => StunAttribute::Nonce(utf8(&value, "NONCE")?),
            attr_type::REQUESTED_TRANSPORT => {
                if value.is_empty() {
                    return Err(Error::StunError("empty REQUESTED-TRANSPORT".to_string()));
                }
                StunAttribute::RequestedTransport(value[0])
            }
            attr_type::PRIORITY => {
                if value.len() != 4 {
                    return Err(Error::StunError("short PRIORITY".to_string()));
                }
                StunAttribute::Priority(u32::from_be_bytes([
                    value[0], value[1], value[2], value[3],
                ]))
            }
            attr_type::USE_CANDIDATE => StunAttribute::UseCandidate,
            attr_type::ICE_CONTROLLED => {
                if value.len() != 8 {
                    return Err(Error::StunError("short ICE-CONTROLLED".to_string()));
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&value);
                StunAttribute::IceControlled(u64::from_be_bytes(bytes))
            }
            attr_type::ICE_CONTROLLING => {
                if value.len() != 8 {
                    return Err(Error::StunError("short ICE-CONTROLLING".to_string()));
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&value);
                StunAttribute::IceControlling(u64::from_be_bytes(bytes))
            }
            attr_type::SOFTWARE => StunAttribute::Software(utf8(&value, "SOFTWARE")?),
            attr_type::FINGERPRINT => {
                if value.len() != 4 {
                    return Err(Error::StunError("short FINGERPRINT".to_string()));
                }
                StunAttribute::Fingerprint(u32::from_be_bytes([
                    value[0], value[1], value[2], value[3],
                ]))
            }
            other => StunAttribute::Unknown {
                attr_type: other,
                value,
            },
        };
        Ok(attr)
    }

    /// Serialise the message.
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);
        self.put_header(&mut buf, 0);

        for attr in &self.attributes {
            Self::put_attribute(&mut buf, attr, &self.transaction_id);
        }

        let body_len = (buf.len() - HEADER_SIZE) as u16;
        buf[2..4].copy_from_slice(&body_len.to_be_bytes());
        buf
    }

    fn put_header(&self, buf: &mut BytesMut, length: u16) {
        let method = self.method as u16;
        let class_bits: u16 = match self.class {
            StunClass::Request => 0b00,
            StunClass::Indication => 0b01,
            StunClass::SuccessResponse => 0b10,
            StunClass::ErrorResponse => 0b11,
        };
        let msg_type = ((method & 0x0F80) << 2)
            | ((method & 0x0070) << 1)
            | (method & 0x000F)
            | ((class_bits & 0x02) << 7)
            | ((class_bits & 0x01) << 4);

        buf.put_u16(msg_type);
        buf.put_u16(length);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(&self.transaction_id);
    }

    fn put_attribute(buf: &mut BytesMut, attr: &StunAttribute, transaction_id: &[u8; 12]) {
        let mut value = BytesMut::new();
        match attr {
            StunAttribute::XorMappedAddress(addr)
            | StunAttribute::XorRelayedAddress(addr)
            | StunAttribute::XorPeerAddress(addr) => {
                encode_xor_address(&mut value, *addr, transaction_id)
            }
            StunAttribute::MappedAddress(addr) => encode_plain_address(&mut value, *addr),
            StunAttribute::Username(s)
            | StunAttribute::Realm(s)
            | StunAttribute::Nonce(s)
            | StunAttribute::Software(s) => value.put_slice(s.as_bytes()),
            StunAttribute::MessageIntegrity(mac) => value.put_slice(mac),
            StunAttribute::ErrorCode { code, reason } => {
                value.put_u16(0);
                value.put_u8((code / 100) as u8);
                value.put_u8((code % 100) as u8);
                value.put_slice(reason.as_bytes());
            }
            StunAttribute::ChannelNumber(n) => {
                value.put_u16(*n);
                value.put_u16(0);
            }
            StunAttribute::Lifetime(secs) => value.put_u32(*secs),
            StunAttribute::Data(data) => value.put_slice(data),
            StunAttribute::RequestedTransport(proto) => {
                value.put_u8(*proto);
                value.put_bytes(0, 3);
            }
            StunAttribute::Priority(p) => value.put_u32(*p),
            StunAttribute::UseCandidate => {}
            StunAttribute::IceControlled(t) => value.put_u64(*t),
            StunAttribute::IceControlling(t) => value.put_u64(*t),
            StunAttribute::Fingerprint(crc) => value.put_u32(*crc),
            StunAttribute::Unknown { value: raw, .. } => value.put_slice(raw),
        }

        buf.put_u16(attr.type_code());
        buf.put_u16(value.len() as u16);
        buf.put_slice(&value);
        let pad = (4 - value.len() % 4) % 4;
        buf.put_bytes(0, pad);
    }

    /// Append a MESSAGE-INTEGRITY attribute keyed with `key`.
    ///
    /// The HMAC covers the message as if its length already included the
    /// integrity attribute, per RFC 5389 Section 15.4.
    pub fn add_message_integrity(&mut self, key: &[u8]) {
        let mut wire = self.serialize();
        let hashed_len = (wire.len() - HEADER_SIZE + 4 + INTEGRITY_LEN) as u16;
        wire[2..4].copy_from_slice(&hashed_len.to_be_bytes());

        let mut mac = <HmacSha1 as Mac>::new_from_slice(key)
            .expect("HMAC-SHA1 accepts any key length");
        mac.update(&wire);
        let digest = mac.finalize().into_bytes();

        let mut tag = [0u8; INTEGRITY_LEN];
        tag.copy_from_slice(&digest);
        self.attributes.push(StunAttribute::MessageIntegrity(tag));
    }

    /// Verify the MESSAGE-INTEGRITY of raw message bytes against `key`.
    ///
    /// Works on the wire image because the HMAC input depends on exact
    /// byte layout, not the parsed view.
    pub fn verify_message_integrity(raw: &[u8], key: &[u8]) -> Result<()> {
        let (offset, tag) = find_attribute(raw, attr_type::MESSAGE_INTEGRITY)?
            .ok_or_else(|| Error::StunError("no MESSAGE-INTEGRITY attribute".to_string()))?;
        if tag.len() != INTEGRITY_LEN {
            return Err(Error::StunError("malformed MESSAGE-INTEGRITY".to_string()));
        }

        let mut covered = raw[..offset].to_vec();
        let hashed_len = (offset - HEADER_SIZE + 4 + INTEGRITY_LEN) as u16;
        covered[2..4].copy_from_slice(&hashed_len.to_be_bytes());

        let mut mac = <HmacSha1 as Mac>::new_from_slice(key)
            .expect("HMAC-SHA1 accepts any key length");
        mac.update(&covered);
        mac.verify_slice(tag).map_err(|_| Error::IntegrityMismatch)
    }

    /// Append a FINGERPRINT attribute.
    pub fn add_fingerprint(&mut self) {
        let mut wire = self.serialize();
        let hashed_len = (wire.len() - HEADER_SIZE + 8) as u16;
        wire[2..4].copy_from_slice(&hashed_len.to_be_bytes());

        let crc = crc32fast::hash(&wire) ^ FINGERPRINT_XOR;
        self.attributes.push(StunAttribute::Fingerprint(crc));
    }

    /// Verify the FINGERPRINT of raw message bytes.
    pub fn verify_fingerprint(raw: &[u8]) -> Result<()> {
        let (offset, value) = find_attribute(raw, attr_type::FINGERPRINT)?
            .ok_or_else(|| Error::StunError("no FINGERPRINT attribute".to_string()))?;
        if value.len() != 4 {
            return Err(Error::StunError("malformed FINGERPRINT".to_string()));
        }
        let stored = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);

        let computed = crc32fast::hash(&raw[..offset]) ^ FINGERPRINT_XOR;
        if computed == stored {
            Ok(())
        } else {
            Err(Error::FingerprintMismatch)
        }
    }
}

/// Locate an attribute in raw message bytes; returns (offset of the
/// attribute header, value slice).
fn find_attribute(raw: &[u8], wanted: u16) -> Result<Option<(usize, &[u8])>> {
    if raw.len() < HEADER_SIZE {
        return Err(Error::BufferTooSmall {
            required: HEADER_SIZE,
            available: raw.len(),
        });
    }
    let msg_len = u16::from_be_bytes([raw[2], raw[3]]) as usize;
    let end = (HEADER_SIZE + msg_len).min(raw.len());

    let mut offset = HEADER_SIZE;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([raw[offset], raw[offset + 1]]);
        let attr_len = u16::from_be_bytes([raw[offset + 2], raw[offset + 3]]) as usize;
        let value_end = offset + 4 + attr_len;
        if value_end > end {
            return Err(Error::StunError("truncated attribute".to_string()));
        }
        if attr_type == wanted {
            return Ok(Some((offset, &raw[offset + 4..value_end])));
        }
        offset = value_end + (4 - attr_len % 4) % 4;
    }
    Ok(None)
}

fn utf8(value: &Bytes, what: &str) -> Result<String> {
    String::from_utf8(value.to_vec())
        .map_err(|_| Error::StunError(format!("{what} is not UTF-8")))
}

fn encode_xor_address(buf: &mut BytesMut, addr: SocketAddr, transaction_id: &[u8; 12]) {
    buf.put_u8(0);
    match addr {
        SocketAddr::V4(v4) => {
            buf.put_u8(0x01);
            buf.put_u16(v4.port() ^ (MAGIC_COOKIE >> 16) as u16);
            buf.put_u32(u32::from(*v4.ip()) ^ MAGIC_COOKIE);
        }
        SocketAddr::V6(v6) => {
            buf.put_u8(0x02);
            buf.put_u16(v6.port() ^ (MAGIC_COOKIE >> 16) as u16);
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(transaction_id);
            let octets = v6.ip().octets();
            for i in 0..16 {
                buf.put_u8(octets[i] ^ mask[i]);
            }
        }
    }
}

fn decode_xor_address(value: &[u8], transaction_id: &[u8; 12]) -> Result<SocketAddr> {
    if value.len() < 8 {
        return Err(Error::StunError("short XOR address".to_string()));
    }
    let family = value[1];
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;

    match family {
        0x01 => {
            let raw = u32::from_be_bytes([value[4], value[5], value[6], value[7]]) ^ MAGIC_COOKIE;
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(raw)), port))
        }
        0x02 => {
            if value.len() < 20 {
                return Err(Error::StunError("short XOR IPv6 address".to_string()));
            }
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(transaction_id);
            let mut octets = [0u8; 16];
            for i in 0..16 {
                octets[i] = value[4 + i] ^ mask[i];
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        other => Err(Error::StunError(format!("unknown address family {other}"))),
    }
}

fn encode_plain_address(buf: &mut BytesMut, addr: SocketAddr) {
    buf.put_u8(0);
    match addr {
        SocketAddr::V4(v4) => {
            buf.put_u8(0x01);
            buf.put_u16(v4.port());
            buf.put_u32(u32::from(*v4.ip()));
        }
        SocketAddr::V6(v6) => {
            buf.put_u8(0x02);
            buf.put_u16(v6.port());
            buf.put_slice(&v6.ip().octets());
        }
    }
}

fn decode_plain_address(value: &[u8]) -> Result<SocketAddr> {
    if value.len() < 8 {
        return Err(Error::StunError("short MAPPED-ADDRESS".to_string()));
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    match value[1] {
        0x01 => {
            let raw = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(raw)), port))
        }
        0x02 => {
            if value.len() < 20 {
                return Err(Error::StunError("short IPv6 MAPPED-ADDRESS".to_string()));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        other => Err(Error::StunError(format!("unknown address family {other}"))),
    }
}
