// ABOUTME: Wire codec for the multiplexer's 8-byte frame header and UPD payload
// ABOUTME: Separates wire encode/decode from the session's dispatch logic

use crate::error::Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed frame header: version, command, length, stream id.
pub const HEADER_SIZE: usize = 8;

/// Size of a decoded `UPD` payload: `consumed` + `window`, both `u32` LE.
pub const UPD_PAYLOAD_SIZE: usize = 8;

/// Frame command byte. Numeric values are a wire contract, not an implementation detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Syn = 0,
    Fin = 1,
    Psh = 2,
    Nop = 3,
    Upd = 4,
}

impl Command {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Command::Syn),
            1 => Some(Command::Fin),
            2 => Some(Command::Psh),
            3 => Some(Command::Nop),
            4 => Some(Command::Upd),
            _ => None,
        }
    }
}

/// The fixed 8-byte header common to every frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub command: Command,
    pub length: u16,
    pub stream_id: u32,
}

impl FrameHeader {
    /// Decode a header from exactly `HEADER_SIZE` bytes, validating the protocol version and
    /// command byte. A version mismatch or unknown command is a fatal protocol error.
    pub fn decode(buf: &[u8], expected_version: u8) -> Result<Self, Error> {
        debug_assert_eq!(buf.len(), HEADER_SIZE);
        let mut cursor = buf;

        let version = cursor.get_u8();
        if version != expected_version {
            return Err(Error::InvalidProtocol(format!(
                "version mismatch: expected {expected_version}, got {version}"
            )));
        }

        let command_byte = cursor.get_u8();
        let command = Command::from_byte(command_byte).ok_or_else(|| {
            Error::InvalidProtocol(format!("unknown command byte: {command_byte}"))
        })?;

        let length = cursor.get_u16_le();
        let stream_id = cursor.get_u32_le();

        Ok(FrameHeader {
            version,
            command,
            length,
            stream_id,
        })
    }

    /// Encode this header into `buf`, appending `HEADER_SIZE` bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.command as u8);
        buf.put_u16_le(self.length);
        buf.put_u32_le(self.stream_id);
    }
}

/// A decoded `UPD` payload: cumulative consumed bytes plus the peer's current free window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdate {
    pub consumed: u32,
    pub window: u32,
}

impl WindowUpdate {
    pub fn decode(buf: &[u8]) -> Self {
        debug_assert_eq!(buf.len(), UPD_PAYLOAD_SIZE);
        let mut cursor = buf;
        let consumed = cursor.get_u32_le();
        let window = cursor.get_u32_le();
        WindowUpdate { consumed, window }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(UPD_PAYLOAD_SIZE);
        buf.put_u32_le(self.consumed);
        buf.put_u32_le(self.window);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(version: u8, command: u8, length: u16, stream_id: u32) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_u8(version);
        buf.put_u8(command);
        buf.put_u16_le(length);
        buf.put_u32_le(stream_id);
        buf
    }

    #[test]
    fn header_roundtrip() {
        let header = FrameHeader {
            version: 1,
            command: Command::Psh,
            length: 5,
            stream_id: 1,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = FrameHeader::decode(&buf, 1).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn syn_header_encodes_version_command_length_stream_id_in_order() {
        let header = FrameHeader {
            version: 1,
            command: Command::Syn,
            length: 0,
            stream_id: 1,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(&buf[..], &[1, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn version_mismatch_is_protocol_error() {
        let buf = header_bytes(2, 0, 0, 1);
        let err = FrameHeader::decode(&buf, 1).unwrap_err();
        assert!(matches!(err, Error::InvalidProtocol(_)));
    }

    #[test]
    fn unknown_command_is_protocol_error() {
        let buf = header_bytes(1, 99, 0, 1);
        let err = FrameHeader::decode(&buf, 1).unwrap_err();
        assert!(matches!(err, Error::InvalidProtocol(_)));
    }

    #[test]
    fn window_update_roundtrip() {
        let upd = WindowUpdate {
            consumed: 5,
            window: 1 << 20,
        };
        let bytes = upd.encode();
        assert_eq!(bytes.len(), UPD_PAYLOAD_SIZE);
        let decoded = WindowUpdate::decode(&bytes);
        assert_eq!(decoded, upd);
    }
}
