// ABOUTME: Framed transport wrapper: reads/writes fixed headers plus payload
// ABOUTME: Exposes an optional vectored-write and peer-address capability probe

use crate::codec::{FrameHeader, HEADER_SIZE};
use crate::error::{Error, Result};
use bytes::{Buf, BytesMut};
use std::io::IoSlice;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// A transport that can report its local and peer socket addresses.
///
/// Implemented for `tokio::net::TcpStream`. Generic `AsyncRead + AsyncWrite` transports
/// (e.g. `tokio::io::DuplexStream`, used in tests) simply have no addresses to report.
pub trait PeerAddr {
    fn local_addr(&self) -> Option<std::net::SocketAddr>;
    fn remote_addr(&self) -> Option<std::net::SocketAddr>;
}

impl PeerAddr for TcpStream {
    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

/// `tokio::io::DuplexStream` has no socket addresses; sessions built over one (as the test
/// suite does, to simulate a transport without a real socket) simply report `None`.
impl PeerAddr for tokio::io::DuplexStream {
    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }
}

/// Marker probed once at session start: does this transport benefit from a vectored write
/// of the header and payload, or should they be copied into one contiguous buffer first.
///
/// Implemented for `tokio::net::TcpStream`; generic transports fall back to the
/// contiguous-buffer path in the sender.
pub trait SupportsVectoredWrites {
    fn supports_vectored_writes(&self) -> bool {
        false
    }
}

impl SupportsVectoredWrites for TcpStream {
    fn supports_vectored_writes(&self) -> bool {
        true
    }
}

/// `DuplexStream` writes go through an in-memory pipe; vectored writes offer no benefit but
/// are harmless, so the contiguous-buffer path is used via the default `false`.
impl SupportsVectoredWrites for tokio::io::DuplexStream {}

/// A frame read off the wire: its header plus the raw payload bytes, if any.
#[derive(Debug)]
pub struct RawFrame {
    pub header: FrameHeader,
    pub payload: BytesMut,
}

/// Read half of a framed transport. Accumulates bytes into an internal buffer and parses
/// header-first, then payload; leftover bytes after a frame is parsed are kept for the
/// next call.
pub struct FrameReader<R> {
    stream: R,
    read_buf: BytesMut,
    version: u8,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(stream: R, version: u8, max_frame_size: usize) -> Self {
        FrameReader {
            stream,
            read_buf: BytesMut::with_capacity(HEADER_SIZE + max_frame_size),
            version,
        }
    }

    /// Read one frame, blocking until the header and the full payload it announces have
    /// arrived. Returns `Ok(None)` on a clean EOF between frames; an EOF mid-frame is a
    /// fatal `Io` error (`UnexpectedEof`).
    pub async fn read_frame(&mut self) -> Result<Option<RawFrame>> {
        loop {
            if let Some(frame) = self.try_parse()? {
                return Ok(Some(frame));
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::from(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed mid-frame",
                )));
            }
        }
    }

    fn try_parse(&mut self) -> Result<Option<RawFrame>> {
        if self.read_buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = FrameHeader::decode(&self.read_buf[..HEADER_SIZE], self.version)?;
        let total_len = HEADER_SIZE + header.length as usize;
        if self.read_buf.len() < total_len {
            return Ok(None);
        }

        self.read_buf.advance(HEADER_SIZE);
        let payload = self.read_buf.split_to(header.length as usize);
        Ok(Some(RawFrame { header, payload }))
    }
}

/// Write half of a framed transport. Writes are either vectored (header + payload in one
/// syscall) or copied into a reused contiguous buffer, depending on what the transport
/// supports.
pub struct FrameWriter<W> {
    stream: W,
    write_buf: BytesMut,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(stream: W, max_frame_size: usize) -> Self {
        FrameWriter {
            stream,
            write_buf: BytesMut::with_capacity(HEADER_SIZE + max_frame_size),
        }
    }

    /// Write a header and payload as a contiguous buffer, reusing the internal scratch
    /// buffer across calls. Returns the number of payload bytes written.
    pub async fn write_frame(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<usize> {
        self.write_buf.clear();
        header.encode(&mut self.write_buf);
        self.write_buf.extend_from_slice(payload);
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(payload.len())
    }

    /// Write a header and payload as two vectored slices, avoiding the contiguous-buffer
    /// copy. Falls back to a contiguous `write_all` if the transport doesn't drain both
    /// slices in one call, as `AsyncWrite::poll_write_vectored`'s contract allows a short
    /// write.
    pub async fn write_frame_vectored(
        &mut self,
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<usize> {
        let mut header_buf = BytesMut::with_capacity(HEADER_SIZE);
        header.encode(&mut header_buf);

        let slices = [IoSlice::new(&header_buf), IoSlice::new(payload)];
        let total = HEADER_SIZE + payload.len();
        let written = self.stream.write_vectored(&slices).await?;
        if written < total {
            let mut combined = BytesMut::with_capacity(total);
            combined.extend_from_slice(&header_buf);
            combined.extend_from_slice(payload);
            self.stream.write_all(&combined[written..]).await?;
        }
        self.stream.flush().await?;
        Ok(payload.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Command;
    use bytes::BufMut;

    #[tokio::test]
    async fn read_frame_reassembles_split_reads() {
        let (mut client, server) = tokio::io::duplex(4);
        let mut reader = FrameReader::new(server, 1, 1024);

        let header = FrameHeader {
            version: 1,
            command: Command::Psh,
            length: 5,
            stream_id: 7,
        };
        let mut wire = BytesMut::new();
        header.encode(&mut wire);
        wire.put_slice(b"hello");

        let writer = tokio::spawn(async move {
            client.write_all(&wire).await.unwrap();
        });

        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.header.stream_id, 7);
        assert_eq!(&frame.payload[..], b"hello");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn clean_eof_between_frames_returns_none() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server, 1, 1024);
        drop(client);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_frame_roundtrips_through_read_frame() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(client, 1024);
        let mut reader = FrameReader::new(server, 1, 1024);

        let header = FrameHeader {
            version: 1,
            command: Command::Syn,
            length: 0,
            stream_id: 3,
        };

        let write_task = tokio::spawn(async move {
            writer.write_frame(&header, &[]).await.unwrap();
        });

        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.header.command, Command::Syn);
        assert_eq!(frame.header.stream_id, 3);
        assert!(frame.payload.is_empty());
        write_task.await.unwrap();
    }

    #[tokio::test]
    async fn write_frame_vectored_roundtrips_through_read_frame() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(client, 1024);
        let mut reader = FrameReader::new(server, 1, 1024);

        let header = FrameHeader {
            version: 1,
            command: Command::Psh,
            length: 5,
            stream_id: 1,
        };

        let write_task = tokio::spawn(async move {
            writer.write_frame_vectored(&header, b"hello").await.unwrap();
        });

        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"hello");
        write_task.await.unwrap();
    }
}
