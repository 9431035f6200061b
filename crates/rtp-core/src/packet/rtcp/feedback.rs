//! RTCP feedback messages (RFC 4585, RFC 5104) and REMB.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSequenceNumber, RtpSsrc};

/// Transport-layer feedback formats (RTPFB, PT 205).
pub const RTPFB_NACK: u8 = 1;

/// Payload-specific feedback formats (PSFB, PT 206).
pub const PSFB_PLI: u8 = 1;
/// Full Intra Request format.
pub const PSFB_FIR: u8 = 4;
/// Receiver Estimated Max Bitrate format (application layer feedback).
pub const PSFB_REMB: u8 = 15;

/// Unique identifier carried in the REMB FCI.
const REMB_IDENTIFIER: [u8; 4] = *b"REMB";

/// Generic NACK: sequence numbers the receiver is missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpNack {
    /// SSRC of the packet sender
    pub sender_ssrc: RtpSsrc,
    /// SSRC of the media source the NACK is about
    pub media_ssrc: RtpSsrc,
    /// Lost sequence numbers, sorted ascending
    pub lost_packets: Vec<RtpSequenceNumber>,
}

impl RtcpNack {
    /// Create a NACK for the given lost sequences.
    pub fn new(sender_ssrc: RtpSsrc, media_ssrc: RtpSsrc, lost: Vec<RtpSequenceNumber>) -> Self {
        let mut lost_packets = lost;
        lost_packets.sort_unstable();
        lost_packets.dedup();
        Self {
            sender_ssrc,
            media_ssrc,
            lost_packets,
        }
    }

    /// Body size in bytes. Each FCI entry covers a PID plus a 16-bit
    /// bitmask of the following sequences.
    pub fn size(&self) -> usize {
        8 + self.fci_entries().len() * 4
    }

    /// Pack the lost sequences into (PID, BLP) pairs.
    fn fci_entries(&self) -> Vec<(u16, u16)> {
        let mut entries: Vec<(u16, u16)> = Vec::new();
        for &seq in &self.lost_packets {
            let mut absorbed = false;
            if let Some((pid, blp)) = entries.last_mut() {
                let delta = seq.wrapping_sub(*pid);
                if delta > 0 && delta <= 16 {
                    *blp |= 1 << (delta - 1);
                    absorbed = true;
                }
            }
            if !absorbed {
                entries.push((seq, 0));
            }
        }
        entries
    }

    /// Parse the NACK body of `body_len` bytes.
    pub fn parse(buf: &mut impl Buf, body_len: usize) -> Result<Self> {
        if buf.remaining() < body_len || body_len < 8 || body_len % 4 != 0 {
            return Err(Error::RtcpError(format!(
                "bad NACK body length {body_len}"
            )));
        }

        let sender_ssrc = buf.get_u32();
        let media_ssrc = buf.get_u32();

        let mut lost_packets = Vec::new();
        let mut remaining = body_len - 8;
        while remaining >= 4 {
            let pid = buf.get_u16();
            let blp = buf.get_u16();
            lost_packets.push(pid);
            for bit in 0..16 {
                if blp & (1 << bit) != 0 {
                    lost_packets.push(pid.wrapping_add(bit + 1));
                }
            }
            remaining -= 4;
        }

        Ok(Self {
            sender_ssrc,
            media_ssrc,
            lost_packets,
        })
    }

    /// Serialise the NACK body into `buf`.
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        for (pid, blp) in self.fci_entries() {
            buf.put_u16(pid);
            buf.put_u16(blp);
        }
        Ok(())
    }
}

/// Picture Loss Indication: "send me a keyframe, decoding broke".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpPli {
    /// SSRC of the packet sender
    pub sender_ssrc: RtpSsrc,
    /// SSRC of the media source that lost the picture
    pub media_ssrc: RtpSsrc,
}

impl RtcpPli {
    /// Body size in bytes.
    pub const SIZE: usize = 8;

    /// Parse the PLI body.
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                required: Self::SIZE,
                available: buf.remaining(),
            });
        }
        Ok(Self {
            sender_ssrc: buf.get_u32(),
            media_ssrc: buf.get_u32(),
        })
    }

    /// Serialise the PLI body into `buf`.
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
    }
}

/// Full Intra Request (RFC 5104): a decoder refresh with a command
/// sequence number so duplicates can be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpFir {
    /// SSRC of the packet sender
    pub sender_ssrc: RtpSsrc,
    /// SSRC of the media source being asked for a keyframe
    pub media_ssrc: RtpSsrc,
    /// Command sequence number
    pub seq_nr: u8,
}

impl RtcpFir {
    /// Body size: sender SSRC + zeroed media field + one FCI entry.
    pub const SIZE: usize = 16;

    /// Parse the FIR body.
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                required: Self::SIZE,
                available: buf.remaining(),
            });
        }
        let sender_ssrc = buf.get_u32();
        let _zeroed_media = buf.get_u32();
        let media_ssrc = buf.get_u32();
        let seq_nr = buf.get_u8();
        buf.advance(3); // reserved

        Ok(Self {
            sender_ssrc,
            media_ssrc,
            seq_nr,
        })
    }

    /// Serialise the FIR body into `buf`.
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u32(self.sender_ssrc);
        // The packet-level media SSRC field is zero; the target lives in the FCI
        buf.put_u32(0);
        buf.put_u32(self.media_ssrc);
        buf.put_u8(self.seq_nr);
        buf.put_bytes(0, 3);
    }
}

/// Receiver Estimated Max Bitrate (draft-alvestrand-rmcat-remb).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpRemb {
    /// SSRC of the packet sender
    pub sender_ssrc: RtpSsrc,
    /// Estimated available bitrate in bits per second
    pub bitrate_bps: u64,
    /// Media SSRCs the estimate applies to
    pub ssrcs: Vec<RtpSsrc>,
}

impl RtcpRemb {
    /// Create a REMB for the given sources.
    pub fn new(sender_ssrc: RtpSsrc, bitrate_bps: u64, ssrcs: Vec<RtpSsrc>) -> Self {
        Self {
            sender_ssrc,
            bitrate_bps,
            ssrcs,
        }
    }

    /// Body size in bytes.
    pub fn size(&self) -> usize {
        16 + self.ssrcs.len() * 4
    }

    /// Parse the REMB body of `body_len` bytes.
    pub fn parse(buf: &mut impl Buf, body_len: usize) -> Result<Self> {
        if buf.remaining() < body_len || body_len < 16 {
            return Err(Error::RtcpError(format!(
                "bad REMB body length {body_len}"
            )));
        }

        let sender_ssrc = buf.get_u32();
        let _zeroed_media = buf.get_u32();

        let mut ident = [0u8; 4];
        buf.copy_to_slice(&mut ident);
        if ident != REMB_IDENTIFIER {
            return Err(Error::RtcpError("missing REMB identifier".to_string()));
        }

        let num_ssrcs = buf.get_u8() as usize;
        let exp_mantissa_hi = buf.get_u8();
        let mantissa_lo = buf.get_u16();
        let exponent = (exp_mantissa_hi >> 2) as u32;
        let mantissa =
            (((exp_mantissa_hi & 0x03) as u64) << 16) | mantissa_lo as u64;
        let bitrate_bps = mantissa << exponent;

        if buf.remaining() < num_ssrcs * 4 {
            return Err(Error::BufferTooSmall {
                required: num_ssrcs * 4,
                available: buf.remaining(),
            });
        }
        let mut ssrcs = Vec::with_capacity(num_ssrcs);
        for _ in 0..num_ssrcs {
            ssrcs.push(buf.get_u32());
        }

        Ok(Self {
            sender_ssrc,
            bitrate_bps,
            ssrcs,
        })
    }

    /// Serialise the REMB body into `buf`.
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        if self.ssrcs.len() > 255 {
            return Err(Error::OutOfRange(format!(
                "REMB with {} SSRCs exceeds the 255 the count field can carry",
                self.ssrcs.len()
            )));
        }

        // 18-bit mantissa with a 6-bit exponent
        let mut exponent = 0u32;
        let mut mantissa = self.bitrate_bps;
        while mantissa >= (1 << 18) {
            mantissa >>= 1;
            exponent += 1;
        }
        if exponent > 63 {
            return Err(Error::OutOfRange(format!(
                "REMB bitrate {} bps not representable",
                self.bitrate_bps
            )));
        }

        buf.put_u32(self.sender_ssrc);
        buf.put_u32(0);
        buf.put_slice(&REMB_IDENTIFIER);
        buf.put_u8(self.ssrcs.len() as u8);
        buf.put_u8(((exponent as u8) << 2) | ((mantissa >> 16) as u8 & 0x03));
        buf.put_u16(mantissa as u16);
        for ssrc in &self.ssrcs {
            buf.put_u32(*ssrc);
        }
        Ok(())
    }
}
