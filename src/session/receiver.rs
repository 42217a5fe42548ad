// ABOUTME: Receiver task: bucket-gated read loop dispatching frames into the stream table
// ABOUTME: Any transport read error or protocol violation latches the session closed

use super::Inner;
use crate::codec::Command;
use crate::connection::FrameReader;
use crate::error::TerminalState;
use crate::stream::StreamShared;
use std::sync::Arc;
use tokio::io::AsyncRead;

pub async fn run<R>(mut reader: FrameReader<R>, inner: Arc<Inner>)
where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            _ = inner.wait_closed() => return,
            _ = admission_gate(&inner) => {}
        }
        if inner.is_closed() {
            return;
        }

        let frame = tokio::select! {
            _ = inner.wait_closed() => return,
            frame = reader.read_frame() => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                inner.set_terminal(TerminalState::Closed);
                return;
            }
            Err(e @ (crate::error::Error::InvalidProtocol(_) | crate::error::Error::Consumed { .. })) => {
                tracing::warn!(error = %e, "receiver: protocol violation");
                inner.set_terminal(TerminalState::Protocol(e));
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "receiver: transport read failed");
                inner.set_terminal(TerminalState::ReadError(as_io_arc(e)));
                return;
            }
        };

        inner.mark_data_ready();

        match frame.header.command {
            Command::Nop => {}
            Command::Syn => {
                let shared = StreamShared::new(frame.header.stream_id, inner.config.max_receive_buffer);
                let admitted = tokio::select! {
                    _ = inner.wait_closed() => return,
                    admitted = inner.stream_table().insert_remote_if_absent(shared) => admitted,
                };
                if admitted {
                    tracing::debug!(stream_id = frame.header.stream_id, "receiver: stream opened");
                }
            }
            Command::Fin => {
                if let Some(stream) = inner.stream_table().lookup(frame.header.stream_id) {
                    stream.mark_fin();
                }
            }
            Command::Psh => {
                if frame.header.length > 0 {
                    let len = frame.header.length as u32;
                    if let Some(stream) = inner.stream_table().lookup(frame.header.stream_id) {
                        stream.push_bytes(frame.payload.freeze());
                        inner.bucket().debit(len);
                    }
                }
            }
            Command::Upd => {
                if frame.payload.len() != crate::codec::UPD_PAYLOAD_SIZE {
                    inner.set_terminal(TerminalState::Protocol(crate::error::Error::InvalidProtocol(
                        "UPD payload must be 8 bytes".to_string(),
                    )));
                    return;
                }
                let upd = crate::codec::WindowUpdate::decode(&frame.payload);
                if let Some(stream) = inner.stream_table().lookup(frame.header.stream_id) {
                    if let Err(e) = stream.update(upd.consumed, upd.window) {
                        inner.set_terminal(TerminalState::Protocol(e));
                        return;
                    }
                }
            }
        }
    }
}

async fn admission_gate(inner: &Inner) {
    if inner.bucket().is_positive() || inner.is_closed() {
        return;
    }
    inner.bucket().wait_for_credit().await;
}

fn as_io_arc(e: crate::error::Error) -> Arc<std::io::Error> {
    match e {
        crate::error::Error::Io(arc) => arc,
        other => Arc::new(std::io::Error::new(std::io::ErrorKind::Other, other.to_string())),
    }
}
