//! RTCP report block, shared by SR and RR (RFC 3550 Section 6.4.1).

use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// Reception statistics about one source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtcpReportBlock {
    /// SSRC of the source this block reports on
    pub ssrc: RtpSsrc,

    /// Fraction of packets lost since the previous report (fixed point /256)
    pub fraction_lost: u8,

    /// Cumulative packets lost (24-bit on the wire)
    pub cumulative_lost: u32,

    /// Extended highest sequence number received
    pub highest_seq: u32,

    /// Interarrival jitter estimate
    pub jitter: u32,

    /// Middle 32 bits of the last SR's NTP timestamp
    pub last_sr: u32,

    /// Delay since that SR, in 1/65536 seconds
    pub delay_since_last_sr: u32,
}

impl RtcpReportBlock {
    /// Wire size of a report block in bytes.
    pub const SIZE: usize = 24;

    /// Create an empty block for the given source.
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self {
            ssrc,
            ..Default::default()
        }
    }

    /// Parse a report block.
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                required: Self::SIZE,
                available: buf.remaining(),
            });
        }

        let ssrc = buf.get_u32();
        let loss_word = buf.get_u32();
        let fraction_lost = (loss_word >> 24) as u8;
        let cumulative_lost = loss_word & 0x00FF_FFFF;
        let highest_seq = buf.get_u32();
        let jitter = buf.get_u32();
        let last_sr = buf.get_u32();
        let delay_since_last_sr = buf.get_u32();

        Ok(Self {
            ssrc,
            fraction_lost,
            cumulative_lost,
            highest_seq,
            jitter,
            last_sr,
            delay_since_last_sr,
        })
    }

    /// Serialise the block into `buf`.
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        if self.cumulative_lost > 0x00FF_FFFF {
            return Err(Error::OutOfRange(format!(
                "cumulative_lost {} exceeds 24 bits",
                self.cumulative_lost
            )));
        }

        buf.put_u32(self.ssrc);
        buf.put_u32(((self.fraction_lost as u32) << 24) | self.cumulative_lost);
        buf.put_u32(self.highest_seq);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr);
        buf.put_u32(self.delay_since_last_sr);
        Ok(())
    }
}
