// ABOUTME: Sender task: pulls one shaped write request at a time and serializes it
// ABOUTME: Vectored writes are used when the transport supports them

use super::Inner;
use crate::connection::FrameWriter;
use crate::error::TerminalState;
use std::sync::Arc;
use tokio::io::AsyncWrite;

pub async fn run<W>(mut writer: FrameWriter<W>, inner: Arc<Inner>, vectored: bool)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let request = tokio::select! {
            _ = inner.wait_closed() => return,
            request = inner.shaper().next() => request,
        };

        let result = if vectored {
            writer
                .write_frame_vectored(&request.header, &request.payload)
                .await
        } else {
            writer.write_frame(&request.header, &request.payload).await
        };

        match result {
            Ok(n) => {
                let _ = request.completion.send(Ok(n));
            }
            Err(e) => {
                tracing::warn!(error = %e, "sender: transport write failed");
                let io_err = match &e {
                    crate::error::Error::Io(arc) => arc.clone(),
                    other => Arc::new(std::io::Error::new(std::io::ErrorKind::Other, other.to_string())),
                };
                let _ = request.completion.send(Err(e));
                inner.set_terminal(TerminalState::WriteError(io_err));
                return;
            }
        }
    }
}
