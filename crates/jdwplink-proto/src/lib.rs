// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Wire-level definitions shared between the debugger transport and
//! daemon-side tooling.
//!
//! A framed packet starts with a fixed 11-byte header: a big-endian total
//! length (header included), a big-endian request id, a flag byte, and
//! either a command-set/command pair (requests) or a 16-bit error code
//! (replies). The transport interprets only the length field; everything
//! else is carried opaquely to the command layer, but is decoded here for
//! diagnostics.
//!
//! Before any framed packet is exchanged, both sides trade the fixed
//! 14-byte handshake literal verbatim.

/// Size of the fixed packet header in bytes.
pub const HEADER_LEN: usize = 11;

/// Flag bit marking a packet as a reply.
pub const FLAG_REPLY: u8 = 0x80;

/// The handshake literal, exchanged identically in both directions exactly
/// once per session.
pub const HANDSHAKE: &[u8; 14] = b"JDWP-Handshake";

/// Command set used for DDM chunk traffic (0xc7, or 'G' + 128).
pub const DDM_COMMAND_SET: u8 = 199;
/// Command id used for DDM chunk traffic.
pub const DDM_COMMAND: u8 = 1;

/// Errors produced while decoding a packet header.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum HeaderError {
    #[error("truncated header: {have} of {HEADER_LEN} bytes")]
    Truncated { have: usize },
    #[error("declared length {length} smaller than the header")]
    LengthTooSmall { length: u32 },
}

/// Request/reply discriminant carried in the last three header bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Command { command_set: u8, command: u8 },
    Reply { error_code: u16 },
}

/// Decoded view of the fixed packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    /// Total packet length, header included.
    pub length: u32,
    /// Request id chosen by the packet originator.
    pub id: u32,
    /// Raw flag byte.
    pub flags: u8,
    pub kind: PacketKind,
}

impl PacketHeader {
    /// Decode a header from the front of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_LEN {
            return Err(HeaderError::Truncated { have: buf.len() });
        }
        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if (length as usize) < HEADER_LEN {
            return Err(HeaderError::LengthTooSmall { length });
        }
        let id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let flags = buf[8];
        let kind = if flags & FLAG_REPLY != 0 {
            PacketKind::Reply {
                error_code: u16::from_be_bytes([buf[9], buf[10]]),
            }
        } else {
            PacketKind::Command {
                command_set: buf[9],
                command: buf[10],
            }
        };
        Ok(Self {
            length,
            id,
            flags,
            kind,
        })
    }

    pub fn is_reply(&self) -> bool {
        self.flags & FLAG_REPLY != 0
    }

    /// True for DDM chunk traffic, which shares the framing but is routed
    /// to a different consumer by the command layer.
    pub fn is_ddm(&self) -> bool {
        matches!(
            self.kind,
            PacketKind::Command {
                command_set: DDM_COMMAND_SET,
                command: DDM_COMMAND,
            }
        )
    }

    /// Lay the header back out in wire order.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.length.to_be_bytes());
        out[4..8].copy_from_slice(&self.id.to_be_bytes());
        out[8] = self.flags;
        match self.kind {
            PacketKind::Command {
                command_set,
                command,
            } => {
                out[9] = command_set;
                out[10] = command;
            }
            PacketKind::Reply { error_code } => {
                out[9..11].copy_from_slice(&error_code.to_be_bytes());
            }
        }
        out
    }
}

/// Whether the front of `buf` holds a complete framed packet: the header is
/// fully buffered and the declared total length is satisfied.
///
/// A declared length smaller than the header still reports "full" once the
/// header itself is buffered, so the malformed frame surfaces as a decode
/// error instead of stalling the connection.
pub fn have_full_packet(buf: &[u8]) -> bool {
    if buf.len() < HEADER_LEN {
        return false;
    }
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    length < HEADER_LEN || buf.len() >= length
}

/// Borrowed view of one complete framed packet.
#[derive(Clone, Copy, Debug)]
pub struct Packet<'a> {
    header: PacketHeader,
    bytes: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Frame a packet over `bytes`, which must hold exactly one complete
    /// packet as declared by its own length field.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, HeaderError> {
        let header = PacketHeader::parse(bytes)?;
        if bytes.len() < header.length as usize {
            return Err(HeaderError::Truncated { have: bytes.len() });
        }
        Ok(Self {
            header,
            bytes: &bytes[..header.length as usize],
        })
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    /// The full framed bytes, header included.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[HEADER_LEN..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_bytes(length: u32, id: u32, set: u8, cmd: u8, payload: &[u8]) -> Vec<u8> {
        let header = PacketHeader {
            length,
            id,
            flags: 0,
            kind: PacketKind::Command {
                command_set: set,
                command: cmd,
            },
        };
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn parses_command_header() {
        let bytes = command_bytes(20, 0x41, 1, 7, &[0xaa; 9]);
        let header = PacketHeader::parse(&bytes).unwrap();
        assert_eq!(header.length, 20);
        assert_eq!(header.id, 0x41);
        assert!(!header.is_reply());
        assert_eq!(
            header.kind,
            PacketKind::Command {
                command_set: 1,
                command: 7
            }
        );
    }

    #[test]
    fn parses_reply_error_code() {
        let mut bytes = command_bytes(11, 9, 0, 0, &[]);
        bytes[8] = FLAG_REPLY;
        bytes[9] = 0x01;
        bytes[10] = 0x02;
        let header = PacketHeader::parse(&bytes).unwrap();
        assert!(header.is_reply());
        assert_eq!(header.kind, PacketKind::Reply { error_code: 0x0102 });
    }

    #[test]
    fn rejects_truncated_and_undersized_headers() {
        assert_eq!(
            PacketHeader::parse(&[0u8; 10]),
            Err(HeaderError::Truncated { have: 10 })
        );
        let bytes = command_bytes(5, 0, 0, 0, &[]);
        assert_eq!(
            PacketHeader::parse(&bytes),
            Err(HeaderError::LengthTooSmall { length: 5 })
        );
    }

    #[test]
    fn full_packet_boundary() {
        // Declared length 20: not full at 19 buffered bytes, full at 20.
        let bytes = command_bytes(20, 1, 1, 1, &[0u8; 9]);
        assert_eq!(bytes.len(), 20);
        assert!(!have_full_packet(&bytes[..19]));
        assert!(have_full_packet(&bytes));
        assert!(!have_full_packet(&bytes[..10]));
    }

    #[test]
    fn packet_view_splits_payload() {
        let bytes = command_bytes(15, 3, 2, 4, b"ping");
        let packet = Packet::parse(&bytes).unwrap();
        assert_eq!(packet.payload(), b"ping");
        assert_eq!(packet.bytes().len(), 15);
    }

    #[test]
    fn ddm_traffic_is_recognized() {
        let bytes = command_bytes(11, 1, DDM_COMMAND_SET, DDM_COMMAND, &[]);
        assert!(PacketHeader::parse(&bytes).unwrap().is_ddm());
    }
}
