//! On-wire data shapes exchanged during the handshake, ahead of action-envelope dispatch.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Error, Read, Write};

/// The RSA-sealed payload carried after `type@id@format::` in the first handshake packet:
/// `aes-key ‖ 10-digit-unix-timestamp` (spec §4.4).
pub struct HandshakeSecret {
    pub aes_key: [u8; 32],
    pub timestamp: u64,
}

impl HandshakeSecret {
    /// `aes_key` (32 bytes) followed by a fixed-width 10-digit decimal timestamp.
    pub const WIRE_SIZE: usize = 32 + 10;

    #[inline]
    pub fn read<R: Read>(mut stream: R) -> Result<HandshakeSecret, Error> {
        let mut aes_key = [0u8; 32];
        stream.read_exact(&mut aes_key)?;

        let mut digits = [0u8; 10];
        stream.read_exact(&mut digits)?;
        let timestamp = std::str::from_utf8(&digits)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| Error::new(std::io::ErrorKind::InvalidData, "bad handshake timestamp"))?;

        Ok(HandshakeSecret { aes_key, timestamp })
    }

    #[inline]
    pub fn write<W: Write>(&self, mut stream: W) -> Result<(), Error> {
        stream.write_all(&self.aes_key)?;
        write!(stream, "{:010}", self.timestamp % 10_000_000_000)
    }
}

/// The authenticate action's decoded result, carried on the connection once it leaves `FRESH`
/// (spec §3: "an authentication record ... carrying type, id, optional iid/sn, company-id,
/// user-id, and an optional raw-protocol tag").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authentication {
    pub kind: String,
    pub id: String,
    pub iid: Option<String>,
    pub sn: Option<String>,
    pub company_id: Option<u64>,
    pub user_id: Option<u64>,
    /// Non-empty iff this connection should use the raw-protocol dispatch path (spec §4.5).
    pub protocol: Option<String>,
}

impl Authentication {
    pub fn is_raw(&self) -> bool {
        self.protocol.as_deref().is_some_and(|p| !p.is_empty())
    }
}

/// Frame header shared by the binary length-prefixed codec: a tag byte and a length field.
/// Kept as a manually (de)serialized structure matching the original `PrivateData`-style
/// fixed-layout encoding (big-endian length per the Open Question decision, see DESIGN.md).
pub struct FrameHeader {
    pub tag: u8,
    pub length: u16,
}

impl FrameHeader {
    pub const SIZE: usize = 3;

    #[inline]
    pub fn read<R: Read>(mut stream: R) -> Result<FrameHeader, Error> {
        let tag = stream.read_u8()?;
        let length = stream.read_u16::<BigEndian>()?;
        Ok(FrameHeader { tag, length })
    }

    #[inline]
    pub fn write<W: Write>(&self, mut stream: W) -> Result<(), Error> {
        stream.write_u8(self.tag)?;
        stream.write_u16::<BigEndian>(self.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_secret_round_trip() {
        let secret = HandshakeSecret {
            aes_key: [7u8; 32],
            timestamp: 1_732_000_000,
        };
        let mut buf = Vec::new();
        secret.write(&mut buf).unwrap();
        assert_eq!(buf.len(), HandshakeSecret::WIRE_SIZE);

        let decoded = HandshakeSecret::read(&buf[..]).unwrap();
        assert_eq!(decoded.aes_key, secret.aes_key);
        assert_eq!(decoded.timestamp, secret.timestamp);
    }

    #[test]
    fn frame_header_round_trip() {
        let header = FrameHeader { tag: 0xAB, length: 1024 };
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        let decoded = FrameHeader::read(&buf[..]).unwrap();
        assert_eq!(decoded.tag, 0xAB);
        assert_eq!(decoded.length, 1024);
    }
}
