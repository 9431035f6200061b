//! RTCP Source Description (RFC 3550 Section 6.5).

use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// SDES item types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SdesItemType {
    /// Canonical endpoint identifier
    Cname = 1,
    /// User name
    Name = 2,
    /// Email address
    Email = 3,
    /// Phone number
    Phone = 4,
    /// Geographic location
    Location = 5,
    /// Tool name and version
    Tool = 6,
    /// Transient note
    Note = 7,
}

impl TryFrom<u8> for SdesItemType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Cname),
            2 => Ok(Self::Name),
            3 => Ok(Self::Email),
            4 => Ok(Self::Phone),
            5 => Ok(Self::Location),
            6 => Ok(Self::Tool),
            7 => Ok(Self::Note),
            other => Err(Error::RtcpError(format!("unknown SDES item type {other}"))),
        }
    }
}

/// One SDES item: type plus UTF-8 text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesItem {
    /// Item type
    pub item_type: SdesItemType,
    /// Item text (max 255 bytes)
    pub text: String,
}

/// SDES chunk: an SSRC and its items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    /// Source the items describe
    pub ssrc: RtpSsrc,
    /// Description items
    pub items: Vec<SdesItem>,
}

/// Source Description packet: one chunk per described source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtcpSdes {
    /// Chunks, at most 31 per packet
    pub chunks: Vec<SdesChunk>,
}

impl RtcpSdes {
    /// Create a single-chunk SDES carrying a CNAME.
    pub fn cname(ssrc: RtpSsrc, cname: impl Into<String>) -> Self {
        Self {
            chunks: vec![SdesChunk {
                ssrc,
                items: vec![SdesItem {
                    item_type: SdesItemType::Cname,
                    text: cname.into(),
                }],
            }],
        }
    }

    /// Body size in bytes, including per-chunk padding.
    pub fn size(&self) -> usize {
        self.chunks
            .iter()
            .map(|chunk| {
                let items: usize = chunk.items.iter().map(|i| 2 + i.text.len()).sum();
                // SSRC + items + at least one terminating zero, padded to 32 bits
                let unpadded = 4 + items + 1;
                (unpadded + 3) / 4 * 4
            })
            .sum()
    }

    /// Parse the SDES body; `chunk_count` comes from the RTCP header.
    pub fn parse(buf: &mut impl Buf, chunk_count: u8) -> Result<Self> {
        let mut chunks = Vec::with_capacity(chunk_count as usize);

        for _ in 0..chunk_count {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall {
                    required: 4,
                    available: buf.remaining(),
                });
            }
            let ssrc = buf.get_u32();
            let mut consumed = 4usize;
            let mut items = Vec::new();

            loop {
                if buf.remaining() < 1 {
                    return Err(Error::RtcpError("unterminated SDES chunk".to_string()));
                }
                let item_type = buf.get_u8();
                consumed += 1;
                if item_type == 0 {
                    break;
                }

                if buf.remaining() < 1 {
                    return Err(Error::RtcpError("truncated SDES item".to_string()));
                }
                let len = buf.get_u8() as usize;
                consumed += 1;
                if buf.remaining() < len {
                    return Err(Error::BufferTooSmall {
                        required: len,
                        available: buf.remaining(),
                    });
                }
                let mut text = vec![0u8; len];
                buf.copy_to_slice(&mut text);
                consumed += len;

                items.push(SdesItem {
                    item_type: SdesItemType::try_from(item_type)?,
                    text: String::from_utf8(text)
                        .map_err(|_| Error::RtcpError("SDES item is not UTF-8".to_string()))?,
                });
            }

            // Chunks are padded to a 32-bit boundary with zeros
            while consumed % 4 != 0 {
                if buf.remaining() < 1 {
                    return Err(Error::RtcpError("missing SDES chunk padding".to_string()));
                }
                buf.get_u8();
                consumed += 1;
            }

            chunks.push(SdesChunk { ssrc, items });
        }

        Ok(Self { chunks })
    }

    /// Serialise the SDES body into `buf`.
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        for chunk in &self.chunks {
            buf.put_u32(chunk.ssrc);
            let mut written = 4usize;

            for item in &chunk.items {
                if item.text.len() > 255 {
                    return Err(Error::OutOfRange(format!(
                        "SDES item text of {} bytes exceeds 255",
                        item.text.len()
                    )));
                }
                buf.put_u8(item.item_type as u8);
                buf.put_u8(item.text.len() as u8);
                buf.put_slice(item.text.as_bytes());
                written += 2 + item.text.len();
            }

            // Terminator plus pad to a 32-bit boundary
            buf.put_u8(0);
            written += 1;
            while written % 4 != 0 {
                buf.put_u8(0);
                written += 1;
            }
        }
        Ok(())
    }
}
