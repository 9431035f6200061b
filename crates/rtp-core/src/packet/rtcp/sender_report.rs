//! RTCP Sender Report (RFC 3550 Section 6.4.1).

use bytes::{Buf, BufMut, BytesMut};

use super::report_block::RtcpReportBlock;
use crate::error::Error;
use crate::{Result, RtpSsrc, RtpTimestamp};

/// Sender Report: sender clocks plus reception report blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpSenderReport {
    /// SSRC of the sender
    pub ssrc: RtpSsrc,

    /// 64-bit NTP timestamp at the moment of sending
    pub ntp_timestamp: u64,

    /// RTP timestamp corresponding to the NTP timestamp
    pub rtp_timestamp: RtpTimestamp,

    /// Total packets sent
    pub packet_count: u32,

    /// Total payload octets sent
    pub octet_count: u32,

    /// Reception reports about sources this sender receives
    pub report_blocks: Vec<RtcpReportBlock>,
}

impl RtcpSenderReport {
    /// Create a report with empty statistics.
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self {
            ssrc,
            ntp_timestamp: 0,
            rtp_timestamp: 0,
            packet_count: 0,
            octet_count: 0,
            report_blocks: Vec::new(),
        }
    }

    /// Body size in bytes (header excluded).
    pub fn size(&self) -> usize {
        24 + self.report_blocks.len() * RtcpReportBlock::SIZE
    }

    /// Parse the SR body; `report_count` comes from the RTCP header.
    pub fn parse(buf: &mut impl Buf, report_count: u8) -> Result<Self> {
        if buf.remaining() < 24 {
            return Err(Error::BufferTooSmall {
                required: 24,
                available: buf.remaining(),
            });
        }

        let ssrc = buf.get_u32();
        let ntp_timestamp = buf.get_u64();
        let rtp_timestamp = buf.get_u32();
        let packet_count = buf.get_u32();
        let octet_count = buf.get_u32();

        let mut report_blocks = Vec::with_capacity(report_count as usize);
        for _ in 0..report_count {
            report_blocks.push(RtcpReportBlock::parse(buf)?);
        }

        Ok(Self {
            ssrc,
            ntp_timestamp,
            rtp_timestamp,
            packet_count,
            octet_count,
            report_blocks,
        })
    }

    /// Serialise the SR body into `buf`.
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u32(self.ssrc);
        buf.put_u64(self.ntp_timestamp);
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);
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
    fn test_round_trip_with_blocks() {
        let mut sr = RtcpSenderReport::new(0xCAFEBABE);
        sr.ntp_timestamp = 0x83AA7E80_12345678;
        sr.rtp_timestamp = 960_000;
        sr.packet_count = 1500;
        sr.octet_count = 180_000;
        sr.report_blocks.push(RtcpReportBlock::new(0x1111));
        sr.report_blocks.push(RtcpReportBlock::new(0x2222));

        let mut buf = BytesMut::new();
        sr.serialize(&mut buf).unwrap();
        assert_eq!(buf.len(), sr.size());

        let parsed = RtcpSenderReport::parse(&mut buf.freeze(), 2).unwrap();
        assert_eq!(parsed, sr);
    }
}
