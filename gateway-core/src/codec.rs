//! Framing codecs and action-envelope package builders (spec §4.2, §4.3).
//!
//! Grounded on `original_source/service/codec/{provider,pkgbuilder}.go` for the dispatch logic
//! (first-byte tag selects format) and the teacher's `neutronium::net::frame` for the shape of
//! a decoded frame enum.

use crate::error::GatewayError;
use byteorder::{ReadBytesExt, WriteBytesExt};
use flux::contract::FrameHeader;
use gateway_proto::GatewayPackage;
use prost::Message;
use serde_derive::{Deserialize, Serialize};
use std::io::Cursor;

pub const LENGTH_TAG: u8 = 0xAB;
pub const DEFAULT_MAX_BODY: usize = 1024;
const DELIMITER_PADDING: &[u8] = b"SWOOLEFN";
const DELIMITER_FINISH: &[u8] = b"SWOOLE_SOCKET_FINISH";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Proto,
    Json,
}

/// Selects codec + package builder from the first byte of the first post-handshake packet
/// (spec §4.2: "`j` selects JSON, anything else selects the default binary protocol").
pub fn select_format(first_byte: u8) -> DataFormat {
    if first_byte == b'j' {
        DataFormat::Json
    } else {
        DataFormat::Proto
    }
}

/// Parses as many complete frames as possible out of `leftover ++ bytes`, invoking `emit` once
/// per complete frame, and returns the unconsumed remainder to prepend on the next call.
pub trait Framer: Send + Sync {
    fn unmarshal(&self, leftover: Vec<u8>, bytes: &[u8], emit: &mut dyn FnMut(Vec<u8>)) -> Vec<u8>;
    fn marshal(&self, body: &[u8]) -> Vec<u8>;
}

/// Default TCP/UDP binary framing: `[tag:1][length:2 BE][body]` (Open Question decision in
/// DESIGN.md: 2-byte big-endian length field).
pub struct LengthFramer {
    pub tag: u8,
    pub max_body: usize,
}

impl Default for LengthFramer {
    fn default() -> Self {
        LengthFramer {
            tag: LENGTH_TAG,
            max_body: DEFAULT_MAX_BODY,
        }
    }
}

impl Framer for LengthFramer {
    fn unmarshal(&self, leftover: Vec<u8>, bytes: &[u8], emit: &mut dyn FnMut(Vec<u8>)) -> Vec<u8> {
        let mut buf = leftover;
        buf.extend_from_slice(bytes);
        let mut offset = 0usize;

        loop {
            if buf.len() - offset < FrameHeader::SIZE {
                break;
            }
            let header = match FrameHeader::read(Cursor::new(&buf[offset..offset + FrameHeader::SIZE])) {
                Ok(h) => h,
                Err(_) => break,
            };
            let body_len = header.length as usize;
            let frame_len = FrameHeader::SIZE + body_len;
            if buf.len() - offset < frame_len {
                break;
            }
            let body_start = offset + FrameHeader::SIZE;
            emit(buf[body_start..body_start + body_len].to_vec());
            offset += frame_len;
        }

        buf.drain(..offset);
        buf
    }

    fn marshal(&self, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FrameHeader::SIZE + body.len());
        let header = FrameHeader {
            tag: self.tag,
            length: body.len().min(self.max_body) as u16,
        };
        header.write(&mut out).expect("write to Vec never fails");
        out.extend_from_slice(body);
        out
    }
}

/// Default TCP/UDP JSON framing: body terminated by a padding + finish marker.
#[derive(Default)]
pub struct DelimiterFramer;

impl Framer for DelimiterFramer {
    fn unmarshal(&self, leftover: Vec<u8>, bytes: &[u8], emit: &mut dyn FnMut(Vec<u8>)) -> Vec<u8> {
        let mut buf = leftover;
        buf.extend_from_slice(bytes);
        let mut offset = 0usize;

        while let Some(pos) = find_subslice(&buf[offset..], DELIMITER_FINISH) {
            let frame_end = offset + pos;
            let mut body_end = frame_end;
            if buf[offset..frame_end].ends_with(DELIMITER_PADDING) {
                body_end = frame_end - DELIMITER_PADDING.len();
            }
            emit(buf[offset..body_end].to_vec());
            offset = frame_end + DELIMITER_FINISH.len();
        }

        buf.drain(..offset);
        buf
    }

    fn marshal(&self, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(body.len() + DELIMITER_PADDING.len() + DELIMITER_FINISH.len());
        out.extend_from_slice(body);
        out.extend_from_slice(DELIMITER_PADDING);
        out.extend_from_slice(DELIMITER_FINISH);
        out
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// WSS framing: one websocket message is one frame, identity marshal/unmarshal (spec §4.2).
#[derive(Default)]
pub struct WebSocketFramer;

impl Framer for WebSocketFramer {
    fn unmarshal(&self, _leftover: Vec<u8>, bytes: &[u8], emit: &mut dyn FnMut(Vec<u8>)) -> Vec<u8> {
        emit(bytes.to_vec());
        Vec::new()
    }

    fn marshal(&self, body: &[u8]) -> Vec<u8> {
        body.to_vec()
    }
}

/// Encodes/decodes the `{action-id, data}` action envelope (spec §4.3). Envelopes with
/// action-id 0 are rejected at decode time.
pub trait PackageBuilder: Send + Sync {
    fn encode(&self, action: u32, data: &[u8]) -> Vec<u8>;
    fn decode(&self, bytes: &[u8]) -> Result<(u32, Vec<u8>), GatewayError>;
    /// The format this builder encodes, so callers holding only a connection's selected `Codec`
    /// (control-plane RPCs choosing between a request's `pb_bytes`/`json_bytes`, spec §4.8) can
    /// pick the matching payload without downcasting.
    fn format(&self) -> DataFormat;
}

#[derive(Default)]
pub struct ProtoPackageBuilder;

impl PackageBuilder for ProtoPackageBuilder {
    fn encode(&self, action: u32, data: &[u8]) -> Vec<u8> {
        let pkg = GatewayPackage {
            action,
            data: data.to_vec(),
        };
        pkg.encode_to_vec()
    }

    fn decode(&self, bytes: &[u8]) -> Result<(u32, Vec<u8>), GatewayError> {
        let pkg = GatewayPackage::decode(bytes).map_err(|_| GatewayError::PackageErr)?;
        if pkg.action == 0 {
            return Err(GatewayError::PackageErr);
        }
        Ok((pkg.action, pkg.data))
    }

    fn format(&self) -> DataFormat {
        DataFormat::Proto
    }
}

#[derive(Serialize, Deserialize)]
struct JsonPackage {
    action: u32,
    #[serde(
        serialize_with = "flux::encoding::base64::serialize",
        deserialize_with = "flux::encoding::base64::deserialize_vec"
    )]
    data: Vec<u8>,
}

#[derive(Default)]
pub struct JsonPackageBuilder;

impl PackageBuilder for JsonPackageBuilder {
    fn encode(&self, action: u32, data: &[u8]) -> Vec<u8> {
        let pkg = JsonPackage {
            action,
            data: data.to_vec(),
        };
        serde_json::to_vec(&pkg).expect("JsonPackage serialization never fails")
    }

    fn decode(&self, bytes: &[u8]) -> Result<(u32, Vec<u8>), GatewayError> {
        let pkg: JsonPackage = serde_json::from_slice(bytes).map_err(|_| GatewayError::PackageErr)?;
        if pkg.action == 0 {
            return Err(GatewayError::PackageErr);
        }
        Ok((pkg.action, pkg.data))
    }

    fn format(&self) -> DataFormat {
        DataFormat::Json
    }
}

/// A bundled codec (framer + package builder) ready to drive one connection.
pub struct Codec {
    pub framer: Box<dyn Framer>,
    pub package: Box<dyn PackageBuilder>,
}

impl Codec {
    /// The one-time, first-byte-driven provider selection (spec §4.2). `is_message_oriented`
    /// is true for transports (WSS) that always use message-boundary framing.
    pub fn select(first_byte: u8, is_message_oriented: bool) -> Codec {
        let format = select_format(first_byte);
        if is_message_oriented {
            return Codec {
                framer: Box::new(WebSocketFramer),
                package: match format {
                    DataFormat::Proto => Box::new(ProtoPackageBuilder),
                    DataFormat::Json => Box::new(JsonPackageBuilder),
                },
            };
        }
        match format {
            DataFormat::Proto => Codec {
                framer: Box::new(LengthFramer::default()),
                package: Box::new(ProtoPackageBuilder),
            },
            DataFormat::Json => Codec {
                framer: Box::new(DelimiterFramer),
                package: Box::new(JsonPackageBuilder),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_framer_round_trips_and_handles_fragmentation() {
        let framer = LengthFramer::default();
        let body = b"hello gateway".to_vec();
        let framed = framer.marshal(&body);

        // Deliver byte-by-byte to exercise the leftover-buffering contract.
        let mut leftover = Vec::new();
        let mut received = Vec::new();
        for byte in framed {
            leftover = framer.unmarshal(leftover, &[byte], &mut |pkg| received.push(pkg));
        }

        assert_eq!(received, vec![body]);
        assert!(leftover.is_empty());
    }

    #[test]
    fn delimiter_framer_round_trips() {
        let framer = DelimiterFramer;
        let body = b"{\"action\":1}".to_vec();
        let framed = framer.marshal(&body);

        let mut received = Vec::new();
        let leftover = framer.unmarshal(Vec::new(), &framed, &mut |pkg| received.push(pkg));

        assert_eq!(received, vec![body]);
        assert!(leftover.is_empty());
    }

    #[test]
    fn envelope_with_action_zero_is_rejected() {
        let builder = ProtoPackageBuilder;
        let bytes = builder.encode(0, b"ignored");
        assert!(builder.decode(&bytes).is_err());
    }

    #[test]
    fn proto_envelope_round_trips() {
        let builder = ProtoPackageBuilder;
        let bytes = builder.encode(42, b"payload");
        let (action, data) = builder.decode(&bytes).unwrap();
        assert_eq!(action, 42);
        assert_eq!(data, b"payload");
    }
}
