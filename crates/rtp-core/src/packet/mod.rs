//! RTP packet parsing and serialisation (RFC 3550).

pub mod rtcp;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::{Result, RtpCsrc, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// RTP protocol version, always 2 on the wire.
pub const RTP_VERSION: u8 = 2;

/// Minimum RTP header size in bytes (no CSRCs, no extension).
pub const RTP_MIN_HEADER_SIZE: usize = 12;

/// Byte offset of the SSRC field within an RTP packet.
pub const RTP_SSRC_OFFSET: usize = 8;

/// RTP fixed header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// Protocol version (always 2)
    pub version: u8,

    /// Padding flag: last payload byte holds the padding length
    pub padding: bool,

    /// Marker bit; semantics are payload-specific (e.g. end of video frame)
    pub marker: bool,

    /// Payload type (7 bits)
    pub payload_type: u8,

    /// Sequence number, increments per packet
    pub sequence: RtpSequenceNumber,

    /// Media clock timestamp
    pub timestamp: RtpTimestamp,

    /// Synchronisation source
    pub ssrc: RtpSsrc,

    /// Contributing sources (present after a mixer)
    pub csrc: Vec<RtpCsrc>,
}

impl RtpHeader {
    /// Create a header with the given identity fields and no CSRCs.
    pub fn new(
        payload_type: u8,
        sequence: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
    ) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            csrc: Vec::new(),
        }
    }

    /// Size of this header on the wire, excluding any extension.
    pub fn size(&self) -> usize {
        RTP_MIN_HEADER_SIZE + self.csrc.len() * 4
    }
}

/// One-shot RTP header extension (profile + data).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpExtension {
    /// Profile-defined identifier
    pub profile: u16,

    /// Extension payload, padded to a 32-bit boundary on the wire
    pub data: Bytes,
}

/// A parsed RTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// Fixed header
    pub header: RtpHeader,

    /// Optional header extension
    pub extension: Option<RtpExtension>,

    /// Media payload with padding stripped
    pub payload: Bytes,
}

impl RtpPacket {
    /// Create a packet from header and payload.
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self {
            header,
            extension: None,
            payload,
        }
    }

    /// Parse an RTP packet from raw bytes.
    ///
    /// Rejects any version other than 2. Padding declared by the P bit is
    /// stripped from the payload. CSRC list and one header extension are
    /// preserved.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < RTP_MIN_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: RTP_MIN_HEADER_SIZE,
                available: data.len(),
            });
        }

        let mut buf = data;

        let byte0 = buf.get_u8();
        let version = (byte0 >> 6) & 0x03;
        if version != RTP_VERSION {
            return Err(Error::InvalidVersion(version));
        }
        let padding = (byte0 & 0x20) != 0;
        let has_extension = (byte0 & 0x10) != 0;
        let csrc_count = (byte0 & 0x0F) as usize;

        let byte1 = buf.get_u8();
        let marker = (byte1 & 0x80) != 0;
        let payload_type = byte1 & 0x7F;

        let sequence = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        if buf.remaining() < csrc_count * 4 {
            return Err(Error::BufferTooSmall {
                required: RTP_MIN_HEADER_SIZE + csrc_count * 4,
                available: data.len(),
            });
        }
        let mut csrc = Vec::with_capacity(csrc_count);
        for _ in 0..csrc_count {
            csrc.push(buf.get_u32());
        }

        let extension = if has_extension {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall {
                    required: 4,
                    available: buf.remaining(),
                });
            }
            let profile = buf.get_u16();
            let ext_len = buf.get_u16() as usize * 4;
            if buf.remaining() < ext_len {
                return Err(Error::BufferTooSmall {
                    required: ext_len,
                    available: buf.remaining(),
                });
            }
            let ext_data = Bytes::copy_from_slice(&buf[..ext_len]);
            buf.advance(ext_len);
            Some(RtpExtension {
                profile,
                data: ext_data,
            })
        } else {
            None
        };

        let mut payload_len = buf.remaining();
        if padding && payload_len > 0 {
            let pad = data[data.len() - 1] as usize;
            if pad > payload_len {
                return Err(Error::InvalidPadding {
                    padding: pad,
                    payload: payload_len,
                });
            }
            payload_len -= pad;
        }
        let payload = Bytes::copy_from_slice(&buf[..payload_len]);

        Ok(Self {
            header: RtpHeader {
                version,
                padding,
                marker,
                payload_type,
                sequence,
                timestamp,
                ssrc,
                csrc,
            },
            extension,
            payload,
        })
    }

    /// Serialise the packet to bytes.
    ///
    /// The padding bit is not re-emitted: parsing strips padding, so a
    /// serialised packet carries none.
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());

        let byte0 = (RTP_VERSION << 6)
            | if self.extension.is_some() { 0x10 } else { 0 }
            | (self.header.csrc.len() as u8 & 0x0F);
        buf.put_u8(byte0);

        let byte1 = if self.header.marker { 0x80 } else { 0 } | (self.header.payload_type & 0x7F);
        buf.put_u8(byte1);

        buf.put_u16(self.header.sequence);
        buf.put_u32(self.header.timestamp);
        buf.put_u32(self.header.ssrc);

        for csrc in &self.header.csrc {
            buf.put_u32(*csrc);
        }

        if let Some(ext) = &self.extension {
            buf.put_u16(ext.profile);
            let words = (ext.data.len() + 3) / 4;
            buf.put_u16(words as u16);
            buf.put_slice(&ext.data);
            for _ in ext.data.len()..words * 4 {
                buf.put_u8(0);
            }
        }

        buf.put_slice(&self.payload);
        buf
    }

    /// Total serialised size in bytes.
    pub fn size(&self) -> usize {
        let mut sz = self.header.size();
        if let Some(ext) = &self.extension {
            sz += 4 + (ext.data.len() + 3) / 4 * 4;
        }
        sz + self.payload.len()
    }
}

/// Incremental builder for outgoing RTP packets.
#[derive(Debug, Default)]
pub struct RtpPacketBuilder {
    payload_type: u8,
    sequence: RtpSequenceNumber,
    timestamp: RtpTimestamp,
    ssrc: RtpSsrc,
    marker: bool,
    csrc: Vec<RtpCsrc>,
    extension: Option<RtpExtension>,
    payload: Bytes,
}

impl RtpPacketBuilder {
    /// Start a new builder with all fields zeroed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the payload type.
    pub fn payload_type(mut self, pt: u8) -> Self {
        self.payload_type = pt;
        self
    }

    /// Set the sequence number.
    pub fn sequence(mut self, seq: RtpSequenceNumber) -> Self {
        self.sequence = seq;
        self
    }

    /// Set the timestamp.
    pub fn timestamp(mut self, ts: RtpTimestamp) -> Self {
        self.timestamp = ts;
        self
    }

    /// Set the SSRC.
    pub fn ssrc(mut self, ssrc: RtpSsrc) -> Self {
        self.ssrc = ssrc;
        self
    }

    /// Set the marker bit.
    pub fn marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    /// Append a contributing source.
    pub fn add_csrc(mut self, csrc: RtpCsrc) -> Self {
        self.csrc.push(csrc);
        self
    }

    /// Attach a header extension.
    pub fn extension(mut self, profile: u16, data: Bytes) -> Self {
        self.extension = Some(RtpExtension { profile, data });
        self
    }

    /// Set the payload.
    pub fn payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Build the packet.
    pub fn build(self) -> RtpPacket {
        let mut header = RtpHeader::new(self.payload_type, self.sequence, self.timestamp, self.ssrc);
        header.marker = self.marker;
        header.csrc = self.csrc;
        RtpPacket {
            header,
            extension: self.extension,
            payload: self.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> RtpPacket {
        RtpPacketBuilder::new()
            .payload_type(111)
            .sequence(4242)
            .timestamp(160_000)
            .ssrc(0xAABBCCDD)
            .marker(true)
            .payload(Bytes::from_static(b"opus-frame"))
            .build()
    }

    #[test]
    fn test_parse_serialize_round_trip() {
        let packet = sample_packet();
        let wire = packet.serialize();
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_round_trip_with_csrc_and_extension() {
        let packet = RtpPacketBuilder::new()
            .payload_type(96)
            .sequence(1)
            .timestamp(90_000)
            .ssrc(0x01020304)
            .add_csrc(0x11111111)
            .add_csrc(0x22222222)
            .extension(0xBEDE, Bytes::from_static(&[0x10, 0x42, 0x00, 0x00]))
            .payload(Bytes::from_static(b"vp8"))
            .build();

        let wire = packet.serialize();
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut wire = sample_packet().serialize();
        wire[0] = (wire[0] & 0x3F) | (1 << 6); // version 1
        assert_eq!(RtpPacket::parse(&wire), Err(Error::InvalidVersion(1)));
    }

    #[test]
    fn test_rejects_truncated_header() {
        let err = RtpPacket::parse(&[0x80, 0x6F, 0x00]).unwrap_err();
        assert!(matches!(err, Error::BufferTooSmall { .. }));
    }

    #[test]
    fn test_padding_is_stripped() {
        let mut wire = sample_packet().serialize().to_vec();
        // Append 3 padding bytes, last one holding the count, and set P
        wire.extend_from_slice(&[0x00, 0x00, 0x03]);
        wire[0] |= 0x20;

        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed.payload, Bytes::from_static(b"opus-frame"));
        assert!(parsed.header.padding);
    }

    #[test]
    fn test_invalid_padding_rejected() {
        let mut wire = sample_packet().serialize().to_vec();
        wire.push(0xFF); // padding length larger than payload
        wire[0] |= 0x20;

        let err = RtpPacket::parse(&wire).unwrap_err();
        assert!(matches!(err, Error::InvalidPadding { .. }));
    }

    #[test]
    fn test_ssrc_offset_constant_matches_layout() {
        let wire = sample_packet().serialize();
        let ssrc = u32::from_be_bytes([
            wire[RTP_SSRC_OFFSET],
            wire[RTP_SSRC_OFFSET + 1],
            wire[RTP_SSRC_OFFSET + 2],
            wire[RTP_SSRC_OFFSET + 3],
        ]);
        assert_eq!(ssrc, 0xAABBCCDD);
    }
}
