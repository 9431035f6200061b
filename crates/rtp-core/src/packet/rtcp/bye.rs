//! RTCP Goodbye (RFC 3550 Section 6.6).

use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// BYE packet: sources leaving the session, with an optional reason.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtcpBye {
    /// Departing SSRCs
    pub ssrcs: Vec<RtpSsrc>,

    /// Optional reason text
    pub reason: Option<String>,
}

impl RtcpBye {
    /// Create a BYE for a single source.
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self {
            ssrcs: vec![ssrc],
            reason: None,
        }
    }

    /// Attach a reason string.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Body size in bytes, including reason padding.
    pub fn size(&self) -> usize {
        let mut sz = self.ssrcs.len() * 4;
        if let Some(reason) = &self.reason {
            sz += (1 + reason.len() + 3) / 4 * 4;
        }
        sz
    }

    /// Parse the BYE body; `source_count` comes from the RTCP header and
    /// `body_len` bounds the optional reason.
    pub fn parse(buf: &mut impl Buf, source_count: u8, body_len: usize) -> Result<Self> {
        let ssrc_bytes = source_count as usize * 4;
        if buf.remaining() < ssrc_bytes {
            return Err(Error::BufferTooSmall {
                required: ssrc_bytes,
                available: buf.remaining(),
            });
        }

        let mut ssrcs = Vec::with_capacity(source_count as usize);
        for _ in 0..source_count {
            ssrcs.push(buf.get_u32());
        }

        let mut consumed = ssrc_bytes;
        let reason = if consumed < body_len && buf.remaining() > 0 {
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

            // Skip padding up to the declared body length
            while consumed < body_len && buf.remaining() > 0 {
                buf.get_u8();
                consumed += 1;
            }

            Some(
                String::from_utf8(text)
                    .map_err(|_| Error::RtcpError("BYE reason is not UTF-8".to_string()))?,
            )
        } else {
            None
        };

        Ok(Self { ssrcs, reason })
    }

    /// Serialise the BYE body into `buf`.
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        if self.ssrcs.len() > 31 {
            return Err(Error::OutOfRange(format!(
                "BYE with {} sources exceeds the 31 the count field can carry",
                self.ssrcs.len()
            )));
        }

        for ssrc in &self.ssrcs {
            buf.put_u32(*ssrc);
        }

        if let Some(reason) = &self.reason {
            if reason.len() > 255 {
                return Err(Error::OutOfRange(format!(
                    "BYE reason of {} bytes exceeds 255",
                    reason.len()
                )));
            }
            buf.put_u8(reason.len() as u8);
            buf.put_slice(reason.as_bytes());
            let mut written = 1 + reason.len();
            while written % 4 != 0 {
                buf.put_u8(0);
                written += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_with_reason() {
        let bye = RtcpBye {
            ssrcs: vec![0xAAAA, 0xBBBB],
            reason: Some("shutting down".to_string()),
        };

        let mut buf = BytesMut::new();
        bye.serialize(&mut buf).unwrap();
        assert_eq!(buf.len(), bye.size());

        let body_len = buf.len();
        let parsed = RtcpBye::parse(&mut buf.freeze(), 2, body_len).unwrap();
        assert_eq!(parsed, bye);
    }

    #[test]
    fn test_round_trip_without_reason() {
        let bye = RtcpBye::new(0x1234);

        let mut buf = BytesMut::new();
        bye.serialize(&mut buf).unwrap();

        let body_len = buf.len();
        let parsed = RtcpBye::parse(&mut buf.freeze(), 1, body_len).unwrap();
        assert_eq!(parsed, bye);
    }
}
