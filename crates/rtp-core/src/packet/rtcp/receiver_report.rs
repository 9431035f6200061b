//! RTCP Receiver Report (RFC 3550 Section 6.4.2).

use bytes::{Buf, BufMut, BytesMut};

use super::report_block::RtcpReportBlock;
use crate::error::Error;
use crate::{Result, RtpSsrc};

/// Receiver Report: reception report blocks from a non-sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpReceiverReport {
    /// SSRC of the receiver issuing the report
    pub ssrc: RtpSsrc,

    /// Reception reports
    pub report_blocks: Vec<RtcpReportBlock>,
}

impl RtcpReceiverReport {
    /// Create an empty receiver report.
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self {
            ssrc,
            report_blocks: Vec::new(),
        }
    }

    /// Body size in bytes (header excluded).
    pub fn size(&self) -> usize {
        4 + self.report_blocks.len() * RtcpReportBlock::SIZE
    }

    /// Parse the RR body; `report_count` comes from the RTCP header.
    pub fn parse(buf: &mut impl Buf, report_count: u8) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(Error::BufferTooSmall {
                required: 4,
                available: buf.remaining(),
            });
        }

        let ssrc = buf.get_u32();
        let mut report_blocks = Vec::with_capacity(report_count as usize);
        for _ in 0..report_count {
            report_blocks.push(RtcpReportBlock::parse(buf)?);
        }

        Ok(Self {
            ssrc,
            report_blocks,
        })
    }

    /// Serialise the RR body into `buf`.
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u32(self.ssrc);
        for block in &self.report_blocks {
            block.serialize(buf)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut rr = RtcpReceiverReport::new(0x12345678);
        rr.report_blocks.push(RtcpReportBlock {
            ssrc: 0xABCDEF01,
            fraction_lost: 42,
            cumulative_lost: 1000,
            highest_seq: 5000,
            jitter: 100,
            last_sr: 0x87654321,
            delay_since_last_sr: 1500,
        });

        let mut buf = BytesMut::new();
        rr.serialize(&mut buf).unwrap();

        let parsed = RtcpReceiverReport::parse(&mut buf.freeze(), 1).unwrap();
        assert_eq!(parsed, rr);
    }

    #[test]
    fn test_empty_report() {
        let rr = RtcpReceiverReport::new(7);
        let mut buf = BytesMut::new();
        rr.serialize(&mut buf).unwrap();
        assert_eq!(buf.len(), 4);

        let parsed = RtcpReceiverReport::parse(&mut buf.freeze(), 0).unwrap();
        assert!(parsed.report_blocks.is_empty());
    }
}
