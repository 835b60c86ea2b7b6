//! Authentication Header codec (RFC 4302).
//!
//!  0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Next Header  |  Payload Len  |           Reserved            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Security Parameters Index                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Sequence Number                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                Integrity Check Value (variable)               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!
//! The payload carried behind the header is a raw Ethernet frame.

use crate::error::PacketError;

pub const AH_PROTOCOL: u8 = 51;

/// Fixed part of the header: next header, payload length, reserved, SPI,
/// sequence number.
pub const AH_FIXED_LEN: usize = 12;

/// Next Header value tagging an Ethernet frame payload (EtherIP).
pub const NEXT_HEADER_ETHERNET: u8 = 0x61;

/// Total header length in bytes for a Payload Len field value
/// (4-octet units minus 2).
#[inline]
pub fn total_hdr_len(payload_len: u8) -> usize {
    (payload_len as usize + 2) * 4
}

/// Payload Len field value for a given ICV length. The ICV length is fixed
/// by the SA transform and is always a multiple of 4.
#[inline]
pub fn payload_len_words(icv_len: usize) -> u8 {
    ((AH_FIXED_LEN + icv_len) / 4 - 2) as u8
}

/// Borrowed view of a parsed AH datagram.
#[derive(Debug)]
pub struct AhPacket<'a> {
    pub next_header: u8,
    pub spi: u32,
    pub seq: u32,
    pub icv: &'a [u8],
    pub payload: &'a [u8],
}

pub fn parse(buf: &[u8]) -> Result<AhPacket<'_>, PacketError> {
    if buf.len() < AH_FIXED_LEN {
        return Err(PacketError::Malformed("ah header truncated"));
    }
    let hdr_len = total_hdr_len(buf[1]);
    if hdr_len < AH_FIXED_LEN {
        return Err(PacketError::Malformed("ah payload length underflow"));
    }
    if buf.len() < hdr_len {
        return Err(PacketError::Malformed("ah icv truncated"));
    }
    Ok(AhPacket {
        next_header: buf[0],
        spi: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        seq: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        icv: &buf[AH_FIXED_LEN..hdr_len],
        payload: &buf[hdr_len..],
    })
}

/// Serialize a datagram. Passing an all-zero `icv` of the transform's
/// length yields exactly the buffer the ICV is computed over.
pub fn serialize(next_header: u8, spi: u32, seq: u32, icv: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(AH_FIXED_LEN + icv.len() + payload.len());
    out.push(next_header);
    out.push(payload_len_words(icv.len()));
    out.extend_from_slice(&0u16.to_be_bytes()); // reserved
    out.extend_from_slice(&spi.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(icv);
    out.extend_from_slice(payload);
    out
}
