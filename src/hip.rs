//! HIP control packet codec (RFC 7401 framing).
//!
//! Fixed 40-byte header followed by TLV parameters, each padded so the next
//! starts on an 8-byte boundary. Parameters are serialized in ascending type
//! order; the HMAC parameter covers everything serialized before it, and the
//! SIGNATURE parameter covers everything before it including the HMAC. The
//! checksum is the Internet checksum over an IPv4 pseudo-header plus the
//! packet.

use std::net::Ipv4Addr;

use crate::crypto;
use crate::error::PacketError;
use crate::identity::{self, Hit, Identity};
use crate::ipv4;

pub const HIP_PROTOCOL: u8 = 139;
pub const HIP_VERSION: u8 = 2;
pub const HIP_HEADER_LEN: usize = 40;

/// Next Header value when nothing follows the HIP packet.
const NEXT_HEADER_NONE: u8 = 59;

/// Host identity algorithm: EdDSA (Ed25519).
pub const HI_ALG_ED25519: u16 = 13;

/// DH group identifier for X25519.
pub const DH_GROUP_X25519: u8 = 12;

/// HIP transform suite: HMAC-SHA-256 with a 128-bit ICV.
pub const TRANSFORM_HMAC_SHA256: u16 = 1;

/// ESP transform suite carried for on-wire compatibility. Its selection
/// never activates an encryption path.
pub const ESP_TRANSFORM_COMPAT: u16 = 7;

const TLV_ESP_INFO: u16 = 65;
const TLV_R1_COUNTER: u16 = 129;
const TLV_PUZZLE: u16 = 257;
const TLV_SOLUTION: u16 = 321;
const TLV_DIFFIE_HELLMAN: u16 = 513;
const TLV_HIP_TRANSFORM: u16 = 577;
const TLV_HOST_ID: u16 = 705;
const TLV_ESP_TRANSFORM: u16 = 4095;
const TLV_HMAC: u16 = 61505;
const TLV_SIGNATURE: u16 = 61697;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    I1 = 1,
    R1 = 2,
    I2 = 3,
    R2 = 4,
    Update = 16,
    Close = 18,
    CloseAck = 19,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, PacketError> {
        match value {
            1 => Ok(PacketType::I1),
            2 => Ok(PacketType::R1),
            3 => Ok(PacketType::I2),
            4 => Ok(PacketType::R2),
            16 => Ok(PacketType::Update),
            18 => Ok(PacketType::Close),
            19 => Ok(PacketType::CloseAck),
            _ => Err(PacketError::Malformed("unknown packet type")),
        }
    }
}

/// Typed view of a parameter TLV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parameter {
    /// Carries the sender's freshly allocated inbound SPI.
    EspInfo { new_spi: u32 },
    /// Responder secret epoch backing a stateless R1.
    R1Counter(u64),
    Puzzle {
        difficulty: u8,
        lifetime: u8,
        opaque: u16,
        random_i: [u8; 8],
    },
    Solution {
        difficulty: u8,
        opaque: u16,
        random_i: [u8; 8],
        solution_j: [u8; 8],
    },
    DiffieHellman {
        group: u8,
        public_value: [u8; 32],
    },
    HipTransform(Vec<u16>),
    HostId {
        algorithm: u16,
        public_key: [u8; 32],
    },
    /// Retained for on-wire compatibility; never selects a cipher.
    EspTransform(Vec<u16>),
    Hmac([u8; 32]),
    Signature {
        algorithm: u8,
        signature: [u8; 64],
    },
}

impl Parameter {
    pub fn type_code(&self) -> u16 {
        match self {
            Parameter::EspInfo { .. } => TLV_ESP_INFO,
            Parameter::R1Counter(_) => TLV_R1_COUNTER,
            Parameter::Puzzle { .. } => TLV_PUZZLE,
            Parameter::Solution { .. } => TLV_SOLUTION,
            Parameter::DiffieHellman { .. } => TLV_DIFFIE_HELLMAN,
            Parameter::HipTransform(_) => TLV_HIP_TRANSFORM,
            Parameter::HostId { .. } => TLV_HOST_ID,
            Parameter::EspTransform(_) => TLV_ESP_TRANSFORM,
            Parameter::Hmac(_) => TLV_HMAC,
            Parameter::Signature { .. } => TLV_SIGNATURE,
        }
    }

    fn encode_value(&self) -> Vec<u8> {
        match self {
            Parameter::EspInfo { new_spi } => {
                let mut v = vec![0u8; 8];
                v.extend_from_slice(&new_spi.to_be_bytes());
                v
            }
            Parameter::R1Counter(counter) => {
                let mut v = vec![0u8; 4];
                v.extend_from_slice(&counter.to_be_bytes());
                v
            }
            Parameter::Puzzle {
                difficulty,
                lifetime,
                opaque,
                random_i,
            } => {
                let mut v = Vec::with_capacity(12);
                v.push(*difficulty);
                v.push(*lifetime);
                v.extend_from_slice(&opaque.to_be_bytes());
                v.extend_from_slice(random_i);
                v
            }
            Parameter::Solution {
                difficulty,
                opaque,
                random_i,
                solution_j,
            } => {
                let mut v = Vec::with_capacity(20);
                v.push(*difficulty);
                v.push(0);
                v.extend_from_slice(&opaque.to_be_bytes());
                v.extend_from_slice(random_i);
                v.extend_from_slice(solution_j);
                v
            }
            Parameter::DiffieHellman {
                group,
                public_value,
            } => {
                let mut v = Vec::with_capacity(35);
                v.push(*group);
                v.extend_from_slice(&(public_value.len() as u16).to_be_bytes());
                v.extend_from_slice(public_value);
                v
            }
            Parameter::HipTransform(suites) => {
                let mut v = Vec::with_capacity(suites.len() * 2);
                for suite in suites {
                    v.extend_from_slice(&suite.to_be_bytes());
                }
                v
            }
            Parameter::HostId {
                algorithm,
                public_key,
            } => {
                let mut v = Vec::with_capacity(34);
                v.extend_from_slice(&algorithm.to_be_bytes());
                v.extend_from_slice(public_key);
                v
            }
            Parameter::EspTransform(suites) => {
                let mut v = vec![0u8; 2];
                for suite in suites {
                    v.extend_from_slice(&suite.to_be_bytes());
                }
                v
            }
            Parameter::Hmac(tag) => tag.to_vec(),
            Parameter::Signature {
                algorithm,
                signature,
            } => {
                let mut v = Vec::with_capacity(65);
                v.push(*algorithm);
                v.extend_from_slice(signature);
                v
            }
        }
    }

    /// Decode a TLV value. `Ok(None)` skips an unknown non-critical type;
    /// a type with its low bit set is critical and fails the whole parse.
    fn decode(type_code: u16, value: &[u8]) -> Result<Option<Parameter>, PacketError> {
        let param = match type_code {
            TLV_ESP_INFO => {
                if value.len() != 12 {
                    return Err(PacketError::Malformed("esp_info length"));
                }
                Parameter::EspInfo {
                    new_spi: u32::from_be_bytes([value[8], value[9], value[10], value[11]]),
                }
            }
            TLV_R1_COUNTER => {
                if value.len() != 12 {
                    return Err(PacketError::Malformed("r1_counter length"));
                }
                Parameter::R1Counter(u64::from_be_bytes(value[4..12].try_into().unwrap()))
            }
            TLV_PUZZLE => {
                if value.len() != 12 {
                    return Err(PacketError::Malformed("puzzle length"));
                }
                Parameter::Puzzle {
                    difficulty: value[0],
                    lifetime: value[1],
                    opaque: u16::from_be_bytes([value[2], value[3]]),
                    random_i: value[4..12].try_into().unwrap(),
                }
            }
            TLV_SOLUTION => {
                if value.len() != 20 {
                    return Err(PacketError::Malformed("solution length"));
                }
                Parameter::Solution {
                    difficulty: value[0],
                    opaque: u16::from_be_bytes([value[2], value[3]]),
                    random_i: value[4..12].try_into().unwrap(),
                    solution_j: value[12..20].try_into().unwrap(),
                }
            }
            TLV_DIFFIE_HELLMAN => {
                if value.len() != 35 {
                    return Err(PacketError::Malformed("diffie_hellman length"));
                }
                let pub_len = u16::from_be_bytes([value[1], value[2]]) as usize;
                if pub_len != 32 {
                    return Err(PacketError::Malformed("diffie_hellman public length"));
                }
                Parameter::DiffieHellman {
                    group: value[0],
                    public_value: value[3..35].try_into().unwrap(),
                }
            }
            TLV_HIP_TRANSFORM => {
                if value.is_empty() || value.len() % 2 != 0 {
                    return Err(PacketError::Malformed("hip_transform length"));
                }
                Parameter::HipTransform(
                    value
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect(),
                )
            }
            TLV_HOST_ID => {
                if value.len() != 34 {
                    return Err(PacketError::Malformed("host_id length"));
                }
                Parameter::HostId {
                    algorithm: u16::from_be_bytes([value[0], value[1]]),
                    public_key: value[2..34].try_into().unwrap(),
                }
            }
            TLV_ESP_TRANSFORM => {
                if value.len() < 2 || value.len() % 2 != 0 {
                    return Err(PacketError::Malformed("esp_transform length"));
                }
                Parameter::EspTransform(
                    value[2..]
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect(),
                )
            }
            TLV_HMAC => {
                if value.len() != 32 {
                    return Err(PacketError::Malformed("hmac length"));
                }
                Parameter::Hmac(value.try_into().unwrap())
            }
            TLV_SIGNATURE => {
                if value.len() != 65 {
                    return Err(PacketError::Malformed("signature length"));
                }
                Parameter::Signature {
                    algorithm: value[0],
                    signature: value[1..65].try_into().unwrap(),
                }
            }
            unknown if unknown & 0x0001 != 0 => {
                return Err(PacketError::Malformed("unknown critical parameter"));
            }
            _ => return Ok(None),
        };
        Ok(Some(param))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub packet_type: PacketType,
    pub sender_hit: Hit,
    pub receiver_hit: Hit,
    pub parameters: Vec<Parameter>,
}

impl ControlPacket {
    pub fn new(packet_type: PacketType, sender_hit: Hit, receiver_hit: Hit) -> Self {
        Self {
            packet_type,
            sender_hit,
            receiver_hit,
            parameters: Vec::new(),
        }
    }

    pub fn push(&mut self, param: Parameter) {
        self.parameters.push(param);
    }

    fn find(&self, type_code: u16) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.type_code() == type_code)
    }

    pub fn esp_info(&self) -> Option<u32> {
        match self.find(TLV_ESP_INFO)? {
            Parameter::EspInfo { new_spi } => Some(*new_spi),
            _ => None,
        }
    }

    pub fn r1_counter(&self) -> Option<u64> {
        match self.find(TLV_R1_COUNTER)? {
            Parameter::R1Counter(counter) => Some(*counter),
            _ => None,
        }
    }

    pub fn puzzle(&self) -> Option<(u8, [u8; 8])> {
        match self.find(TLV_PUZZLE)? {
            Parameter::Puzzle {
                difficulty,
                random_i,
                ..
            } => Some((*difficulty, *random_i)),
            _ => None,
        }
    }

    pub fn solution(&self) -> Option<(u8, [u8; 8], [u8; 8])> {
        match self.find(TLV_SOLUTION)? {
            Parameter::Solution {
                difficulty,
                random_i,
                solution_j,
                ..
            } => Some((*difficulty, *random_i, *solution_j)),
            _ => None,
        }
    }

    pub fn diffie_hellman(&self) -> Option<[u8; 32]> {
        match self.find(TLV_DIFFIE_HELLMAN)? {
            Parameter::DiffieHellman {
                group,
                public_value,
            } if *group == DH_GROUP_X25519 => Some(*public_value),
            _ => None,
        }
    }

    pub fn hip_transform(&self) -> Option<&[u16]> {
        match self.find(TLV_HIP_TRANSFORM)? {
            Parameter::HipTransform(suites) => Some(suites),
            _ => None,
        }
    }

    pub fn host_id(&self) -> Option<[u8; 32]> {
        match self.find(TLV_HOST_ID)? {
            Parameter::HostId {
                algorithm,
                public_key,
            } if *algorithm == HI_ALG_ED25519 => Some(*public_key),
            _ => None,
        }
    }

    pub fn hmac(&self) -> Option<[u8; 32]> {
        match self.find(TLV_HMAC)? {
            Parameter::Hmac(tag) => Some(*tag),
            _ => None,
        }
    }

    pub fn signature(&self) -> Option<[u8; 64]> {
        match self.find(TLV_SIGNATURE)? {
            Parameter::Signature { signature, .. } => Some(*signature),
            _ => None,
        }
    }

    /// Serialize the header plus all parameters with a type below
    /// `upto_type`, checksum zeroed and the header length covering only the
    /// emitted bytes. `u16::MAX` as bound emits every parameter (no
    /// parameter uses that type code).
    fn serialize_truncated(&self, upto_type: u16) -> Vec<u8> {
        let mut params: Vec<&Parameter> = self
            .parameters
            .iter()
            .filter(|p| p.type_code() < upto_type)
            .collect();
        params.sort_by_key(|p| p.type_code());

        let mut buf = vec![0u8; HIP_HEADER_LEN];
        buf[0] = NEXT_HEADER_NONE;
        // buf[1] (header length) patched below
        buf[2] = self.packet_type as u8;
        buf[3] = (HIP_VERSION << 4) | 0x01;
        // checksum [4..6] stays zero here, controls [6..8] zero
        buf[8..24].copy_from_slice(&self.sender_hit.0);
        buf[24..40].copy_from_slice(&self.receiver_hit.0);

        for param in params {
            let value = param.encode_value();
            buf.extend_from_slice(&param.type_code().to_be_bytes());
            buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
            buf.extend_from_slice(&value);
            let padded = (4 + value.len() + 7) & !7;
            buf.resize(buf.len() + padded - 4 - value.len(), 0);
        }

        buf[1] = ((buf.len() - 8) / 8) as u8;
        buf
    }

    /// Full wire form with the pseudo-header checksum filled in.
    pub fn serialize(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
        let mut buf = self.serialize_truncated(u16::MAX);
        let csum = ipv4::pseudo_header_checksum(src, dst, HIP_PROTOCOL, &buf);
        buf[4..6].copy_from_slice(&csum.to_be_bytes());
        buf
    }

    pub fn parse(buf: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> Result<Self, PacketError> {
        if buf.len() < HIP_HEADER_LEN {
            return Err(PacketError::Malformed("hip header truncated"));
        }
        let total = (buf[1] as usize + 1) * 8;
        if total != buf.len() {
            return Err(PacketError::Malformed("hip length mismatch"));
        }
        if buf[3] >> 4 != HIP_VERSION {
            return Err(PacketError::Malformed("hip version"));
        }
        if buf[2] & 0x80 != 0 || buf[3] & 0x01 != 1 {
            return Err(PacketError::Malformed("hip fixed bits"));
        }

        let transmitted = u16::from_be_bytes([buf[4], buf[5]]);
        let mut zeroed = buf.to_vec();
        zeroed[4] = 0;
        zeroed[5] = 0;
        if ipv4::pseudo_header_checksum(src, dst, HIP_PROTOCOL, &zeroed) != transmitted {
            return Err(PacketError::Malformed("hip checksum"));
        }

        let packet_type = PacketType::try_from(buf[2] & 0x7F)?;
        let sender_hit = Hit(buf[8..24].try_into().unwrap());
        let receiver_hit = Hit(buf[24..40].try_into().unwrap());

        let mut parameters = Vec::new();
        let mut offset = HIP_HEADER_LEN;
        let mut last_type = 0u16;
        while offset < total {
            if total - offset < 4 {
                return Err(PacketError::Malformed("tlv header truncated"));
            }
            let type_code = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let length = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            let padded = (4 + length + 7) & !7;
            if offset + padded > total {
                return Err(PacketError::Malformed("tlv value truncated"));
            }
            // Ascending order is what makes the HMAC/signature coverage
            // rule well-defined.
            if type_code < last_type {
                return Err(PacketError::Malformed("tlv order"));
            }
            last_type = type_code;

            let value = &buf[offset + 4..offset + 4 + length];
            if let Some(param) = Parameter::decode(type_code, value)? {
                parameters.push(param);
            }
            offset += padded;
        }

        Ok(Self {
            packet_type,
            sender_hit,
            receiver_hit,
            parameters,
        })
    }

    /// Append an HMAC parameter covering everything serialized before it.
    pub fn push_hmac(&mut self, key: &[u8]) {
        let covered = self.serialize_truncated(TLV_HMAC);
        self.parameters
            .push(Parameter::Hmac(crypto::hmac_sha256(key, &covered)));
    }

    pub fn verify_hmac(&self, key: &[u8]) -> Result<(), PacketError> {
        let received = self.hmac().ok_or(PacketError::Malformed("missing hmac"))?;
        let covered = self.serialize_truncated(TLV_HMAC);
        if crypto::hmac_verify(key, &covered, &received) {
            Ok(())
        } else {
            Err(PacketError::AuthFailure)
        }
    }

    /// Append a signature covering everything before it, the HMAC included.
    pub fn push_signature(&mut self, identity: &Identity) {
        let covered = self.serialize_truncated(TLV_SIGNATURE);
        self.parameters.push(Parameter::Signature {
            algorithm: HI_ALG_ED25519 as u8,
            signature: identity.sign(&covered),
        });
    }

    pub fn verify_packet_signature(&self, public_key: &[u8; 32]) -> Result<(), PacketError> {
        let signature = self
            .signature()
            .ok_or(PacketError::Malformed("missing signature"))?;
        let covered = self.serialize_truncated(TLV_SIGNATURE);
        if identity::verify_signature(public_key, &covered, &signature) {
            Ok(())
        } else {
            Err(PacketError::AuthFailure)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const DST: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 2);

    fn sample_packet() -> ControlPacket {
        let mut pkt = ControlPacket::new(PacketType::I2, Hit([0xAA; 16]), Hit([0xBB; 16]));
        pkt.push(Parameter::EspInfo { new_spi: 0x01020304 });
        pkt.push(Parameter::R1Counter(7));
        pkt.push(Parameter::Solution {
            difficulty: 8,
            opaque: 0,
            random_i: [1; 8],
            solution_j: [2; 8],
        });
        pkt.push(Parameter::DiffieHellman {
            group: DH_GROUP_X25519,
            public_value: [3; 32],
        });
        pkt.push(Parameter::HipTransform(vec![TRANSFORM_HMAC_SHA256]));
        pkt.push(Parameter::HostId {
            algorithm: HI_ALG_ED25519,
            public_key: [4; 32],
        });
        pkt.push(Parameter::EspTransform(vec![ESP_TRANSFORM_COMPAT]));
        pkt
    }

    #[test]
    fn test_serialize_parse_identity() {
        let pkt = sample_packet();
        let wire = pkt.serialize(SRC, DST);
        assert_eq!(wire.len() % 8, 0);

        let parsed = ControlPacket::parse(&wire, SRC, DST).expect("well-formed");
        assert_eq!(parsed, pkt);

        // parse ∘ serialize is the identity on the wire image too.
        assert_eq!(parsed.serialize(SRC, DST), wire);
    }

    #[test]
    fn test_checksum_binds_addresses() {
        let wire = sample_packet().serialize(SRC, DST);
        let other = Ipv4Addr::new(198, 51, 100, 9);
        assert!(matches!(
            ControlPacket::parse(&wire, other, DST),
            Err(PacketError::Malformed("hip checksum"))
        ));
    }

    #[test]
    fn test_hmac_covers_preceding_parameters() {
        let key = [0x42u8; 32];
        let mut pkt = sample_packet();
        pkt.push_hmac(&key);
        let wire = pkt.serialize(SRC, DST);

        let parsed = ControlPacket::parse(&wire, SRC, DST).unwrap();
        assert!(parsed.verify_hmac(&key).is_ok());
        assert_eq!(
            parsed.verify_hmac(&[0u8; 32]),
            Err(PacketError::AuthFailure)
        );

        // Any change to a covered parameter breaks the tag.
        let mut tampered = parsed.clone();
        for param in tampered.parameters.iter_mut() {
            if let Parameter::EspInfo { new_spi } = param {
                *new_spi ^= 1;
            }
        }
        assert_eq!(tampered.verify_hmac(&key), Err(PacketError::AuthFailure));
    }

    #[test]
    fn test_signature_covers_hmac() {
        let id = Identity::generate();
        let key = [0x42u8; 32];
        let mut pkt = sample_packet();
        pkt.push_hmac(&key);
        pkt.push_signature(&id);
        let wire = pkt.serialize(SRC, DST);

        let parsed = ControlPacket::parse(&wire, SRC, DST).unwrap();
        assert!(parsed
            .verify_packet_signature(&id.public_key_bytes())
            .is_ok());

        let mut tampered = parsed;
        for param in tampered.parameters.iter_mut() {
            if let Parameter::Hmac(tag) = param {
                tag[0] ^= 1;
            }
        }
        assert_eq!(
            tampered.verify_packet_signature(&id.public_key_bytes()),
            Err(PacketError::AuthFailure)
        );
    }

    #[test]
    fn test_unknown_critical_rejected() {
        let pkt = sample_packet();
        let mut wire = pkt.serialize(SRC, DST);
        // Append an unknown critical TLV (odd type), fix length and checksum.
        wire.extend_from_slice(&0x7FFFu16.to_be_bytes());
        wire.extend_from_slice(&2u16.to_be_bytes());
        wire.extend_from_slice(&[0xEE, 0xEE, 0, 0]);
        wire[1] = ((wire.len() - 8) / 8) as u8;
        wire[4] = 0;
        wire[5] = 0;
        let csum = ipv4::pseudo_header_checksum(SRC, DST, HIP_PROTOCOL, &wire);
        wire[4..6].copy_from_slice(&csum.to_be_bytes());

        assert!(matches!(
            ControlPacket::parse(&wire, SRC, DST),
            Err(PacketError::Malformed("unknown critical parameter"))
        ));
    }

    #[test]
    fn test_unknown_noncritical_skipped() {
        let pkt = ControlPacket::new(PacketType::I1, Hit([1; 16]), Hit([2; 16]));
        let mut wire = pkt.serialize(SRC, DST);
        // Unknown even (non-critical) type.
        wire.extend_from_slice(&0x7FFEu16.to_be_bytes());
        wire.extend_from_slice(&2u16.to_be_bytes());
        wire.extend_from_slice(&[0xEE, 0xEE, 0, 0]);
        wire[1] = ((wire.len() - 8) / 8) as u8;
        wire[4] = 0;
        wire[5] = 0;
        let csum = ipv4::pseudo_header_checksum(SRC, DST, HIP_PROTOCOL, &wire);
        wire[4..6].copy_from_slice(&csum.to_be_bytes());

        let parsed = ControlPacket::parse(&wire, SRC, DST).expect("skipped");
        assert!(parsed.parameters.is_empty());
    }

    #[test]
    fn test_descending_tlv_order_rejected() {
        // Hand-build a packet with R1_COUNTER after HOST_ID.
        let mut pkt = ControlPacket::new(PacketType::R1, Hit([1; 16]), Hit([2; 16]));
        pkt.push(Parameter::HostId {
            algorithm: HI_ALG_ED25519,
            public_key: [0; 32],
        });
        let mut wire = pkt.serialize(SRC, DST);
        let value_r1 = Parameter::R1Counter(1).encode_value();
        wire.extend_from_slice(&129u16.to_be_bytes());
        wire.extend_from_slice(&(value_r1.len() as u16).to_be_bytes());
        wire.extend_from_slice(&value_r1);
        wire[1] = ((wire.len() - 8) / 8) as u8;
        wire[4] = 0;
        wire[5] = 0;
        let csum = ipv4::pseudo_header_checksum(SRC, DST, HIP_PROTOCOL, &wire);
        wire[4..6].copy_from_slice(&csum.to_be_bytes());

        assert!(matches!(
            ControlPacket::parse(&wire, SRC, DST),
            Err(PacketError::Malformed("tlv order"))
        ));
    }
}
