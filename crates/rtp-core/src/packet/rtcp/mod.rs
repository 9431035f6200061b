//! RTCP packet types and compound-packet framing (RFC 3550, RFC 4585).
//!
//! The length field of every RTCP header counts 32-bit words minus one;
//! compound parsing walks packets by that field so unknown types can be
//! skipped without desynchronising.

pub mod bye;
pub mod feedback;
pub mod receiver_report;
pub mod report_block;
pub mod sdes;
pub mod sender_report;

use bytes::{BufMut, BytesMut};

use crate::error::Error;
use crate::Result;

pub use bye::RtcpBye;
pub use feedback::{RtcpFir, RtcpNack, RtcpPli, RtcpRemb};
pub use receiver_report::RtcpReceiverReport;
pub use report_block::RtcpReportBlock;
pub use sdes::{RtcpSdes, SdesChunk, SdesItem, SdesItemType};
pub use sender_report::RtcpSenderReport;

/// RTCP packet type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RtcpPacketType {
    /// Sender Report
    SenderReport = 200,
    /// Receiver Report
    ReceiverReport = 201,
    /// Source Description
    SourceDescription = 202,
    /// Goodbye
    Goodbye = 203,
    /// Transport-layer feedback (NACK)
    TransportFeedback = 205,
    /// Payload-specific feedback (PLI/FIR/REMB)
    PayloadFeedback = 206,
}

impl TryFrom<u8> for RtcpPacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            200 => Ok(Self::SenderReport),
            201 => Ok(Self::ReceiverReport),
            202 => Ok(Self::SourceDescription),
            203 => Ok(Self::Goodbye),
            205 => Ok(Self::TransportFeedback),
            206 => Ok(Self::PayloadFeedback),
            other => Err(Error::UnknownRtcpType(other)),
        }
    }
}

/// Any RTCP packet this engine understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    /// Sender Report (PT 200)
    SenderReport(RtcpSenderReport),
    /// Receiver Report (PT 201)
    ReceiverReport(RtcpReceiverReport),
    /// Source Description (PT 202)
    SourceDescription(RtcpSdes),
    /// Goodbye (PT 203)
    Goodbye(RtcpBye),
    /// Generic NACK (PT 205, FMT 1)
    Nack(RtcpNack),
    /// Picture Loss Indication (PT 206, FMT 1)
    PictureLossIndication(RtcpPli),
    /// Full Intra Request (PT 206, FMT 4)
    FullIntraRequest(RtcpFir),
    /// Receiver Estimated Max Bitrate (PT 206, FMT 15)
    ReceiverEstimatedMaxBitrate(RtcpRemb),
}

impl RtcpPacket {
    /// Parse one RTCP packet from the start of `data`.
    ///
    /// Returns the packet and the number of bytes it occupied so callers
    /// can walk compound buffers.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 4 {
            return Err(Error::BufferTooSmall {
                required: 4,
                available: data.len(),
            });
        }

        let byte0 = data[0];
        let version = (byte0 >> 6) & 0x03;
        if version != 2 {
            return Err(Error::InvalidVersion(version));
        }
        let count = byte0 & 0x1F;
        let packet_type = RtcpPacketType::try_from(data[1])?;
        let length_words = u16::from_be_bytes([data[2], data[3]]) as usize;
        let total_len = (length_words + 1) * 4;

        if data.len() < total_len {
            return Err(Error::BufferTooSmall {
                required: total_len,
                available: data.len(),
            });
        }

        let body_len = total_len - 4;
        let mut body = &data[4..total_len];

        let packet = match packet_type {
            RtcpPacketType::SenderReport => {
                Self::SenderReport(RtcpSenderReport::parse(&mut body, count)?)
            }
            RtcpPacketType::ReceiverReport => {
                Self::ReceiverReport(RtcpReceiverReport::parse(&mut body, count)?)
            }
            RtcpPacketType::SourceDescription => {
                Self::SourceDescription(RtcpSdes::parse(&mut body, count)?)
            }
            RtcpPacketType::Goodbye => Self::Goodbye(RtcpBye::parse(&mut body, count, body_len)?),
            RtcpPacketType::TransportFeedback => match count {
                feedback::RTPFB_NACK => Self::Nack(RtcpNack::parse(&mut body, body_len)?),
                other => {
                    return Err(Error::RtcpError(format!(
                        "unsupported RTPFB format {other}"
                    )))
                }
            },
            RtcpPacketType::PayloadFeedback => match count {
                feedback::PSFB_PLI => Self::PictureLossIndication(RtcpPli::parse(&mut body)?),
                feedback::PSFB_FIR => Self::FullIntraRequest(RtcpFir::parse(&mut body)?),
                feedback::PSFB_REMB => {
                    Self::ReceiverEstimatedMaxBitrate(RtcpRemb::parse(&mut body, body_len)?)
                }
                other => {
                    return Err(Error::RtcpError(format!(
                        "unsupported PSFB format {other}"
                    )))
                }
            },
        };

        Ok((packet, total_len))
    }

    /// Parse every packet in a compound RTCP buffer.
    pub fn parse_compound(data: &[u8]) -> Result<Vec<Self>> {
        let mut packets = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let (packet, consumed) = Self::parse(&data[offset..])?;
            packets.push(packet);
            offset += consumed;
        }
        Ok(packets)
    }

    /// Serialise the packet, header included.
    pub fn serialize(&self) -> Result<BytesMut> {
        let (count, packet_type, body) = match self {
            Self::SenderReport(sr) => {
                let mut body = BytesMut::with_capacity(sr.size());
                sr.serialize(&mut body)?;
                (
                    sr.report_blocks.len() as u8,
                    RtcpPacketType::SenderReport,
                    body,
                )
            }
            Self::ReceiverReport(rr) => {
                let mut body = BytesMut::with_capacity(rr.size());
                rr.serialize(&mut body)?;
                (
                    rr.report_blocks.len() as u8,
                    RtcpPacketType::ReceiverReport,
                    body,
                )
            }
            Self::SourceDescription(sdes) => {
                let mut body = BytesMut::with_capacity(sdes.size());
                sdes.serialize(&mut body)?;
                (
                    sdes.chunks.len() as u8,
                    RtcpPacketType::SourceDescription,
                    body,
                )
            }
            Self::Goodbye(bye) => {
                let mut body = BytesMut::with_capacity(bye.size());
                bye.serialize(&mut body)?;
                (bye.ssrcs.len() as u8, RtcpPacketType::Goodbye, body)
            }
            Self::Nack(nack) => {
                let mut body = BytesMut::with_capacity(nack.size());
                nack.serialize(&mut body)?;
                (
                    feedback::RTPFB_NACK,
                    RtcpPacketType::TransportFeedback,
                    body,
                )
            }
            Self::PictureLossIndication(pli) => {
                let mut body = BytesMut::with_capacity(RtcpPli::SIZE);
                pli.serialize(&mut body);
                (feedback::PSFB_PLI, RtcpPacketType::PayloadFeedback, body)
            }
            Self::FullIntraRequest(fir) => {
                let mut body = BytesMut::with_capacity(RtcpFir::SIZE);
                fir.serialize(&mut body);
                (feedback::PSFB_FIR, RtcpPacketType::PayloadFeedback, body)
            }
            Self::ReceiverEstimatedMaxBitrate(remb) => {
                let mut body = BytesMut::with_capacity(remb.size());
                remb.serialize(&mut body)?;
                (feedback::PSFB_REMB, RtcpPacketType::PayloadFeedback, body)
            }
        };

        debug_assert!(body.len() % 4 == 0, "RTCP body must be 32-bit aligned");
        let length_words = body.len() / 4;
        if length_words > u16::MAX as usize {
            return Err(Error::OutOfRange("RTCP packet too large".to_string()));
        }

        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u8((2 << 6) | (count & 0x1F));
        buf.put_u8(packet_type as u8);
        buf.put_u16(length_words as u16);
        buf.put_slice(&body);
        Ok(buf)
    }

    /// Serialise a list of packets into one compound buffer.
    pub fn serialize_compound(packets: &[Self]) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        for packet in packets {
            buf.put_slice(&packet.serialize()?);
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_packet_round_trip() {
        let original = RtcpPacket::ReceiverReport(RtcpReceiverReport::new(0xFEEDFACE));
        let wire = original.serialize().unwrap();
        let (parsed, consumed) = RtcpPacket::parse(&wire).unwrap();
        assert_eq!(parsed, original);
        assert_eq!(consumed, wire.len());
    }

    #[test]
    fn test_compound_round_trip() {
        let packets = vec![
            RtcpPacket::SenderReport(RtcpSenderReport {
                ssrc: 1,
                ntp_timestamp: 99,
                rtp_timestamp: 160,
                packet_count: 10,
                octet_count: 1200,
                report_blocks: vec![RtcpReportBlock::new(2)],
            }),
            RtcpPacket::SourceDescription(RtcpSdes::cname(1, "mixer@confero")),
            RtcpPacket::ReceiverEstimatedMaxBitrate(RtcpRemb::new(1, 1_000_000, vec![2, 3])),
            RtcpPacket::Goodbye(RtcpBye::new(1).with_reason("done")),
        ];

        let wire = RtcpPacket::serialize_compound(&packets).unwrap();
        let parsed = RtcpPacket::parse_compound(&wire).unwrap();
        assert_eq!(parsed, packets);
    }

    #[test]
    fn test_nack_through_compound_framing() {
        let nack = RtcpPacket::Nack(RtcpNack::new(5, 6, vec![1000, 1001, 1002]));
        let wire = nack.serialize().unwrap();

        // Length field is words minus one
        let words = u16::from_be_bytes([wire[2], wire[3]]) as usize;
        assert_eq!((words + 1) * 4, wire.len());

        let (parsed, _) = RtcpPacket::parse(&wire).unwrap();
        assert_eq!(parsed, nack);
    }

    #[test]
    fn test_rejects_unknown_type() {
        let mut wire = RtcpPacket::ReceiverReport(RtcpReceiverReport::new(1))
            .serialize()
            .unwrap();
        wire[1] = 204; // APP, unsupported
        assert!(matches!(
            RtcpPacket::parse(&wire),
            Err(Error::UnknownRtcpType(204))
        ));
    }

    #[test]
    fn test_rejects_truncated_compound() {
        let wire = RtcpPacket::ReceiverReport(RtcpReceiverReport::new(1))
            .serialize()
            .unwrap();
        assert!(RtcpPacket::parse_compound(&wire[..wire.len() - 2]).is_err());
    }
}
