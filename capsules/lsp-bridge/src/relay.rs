use std::fmt;
use std::io;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::framing::{encode_frame, FrameDecoder, FramingError};

const READ_CHUNK: usize = 16 * 1024;

/// Why a bridge session ended. Exactly one is produced per session.
#[derive(Debug)]
pub enum SessionEnd {
    /// The client closed its connection.
    ClientClosed,
    /// The language server closed its output or its input pipe broke.
    CompanionExited,
    /// The language server wrote something that is not a valid frame.
    Framing(FramingError),
    CompanionIo(io::Error),
    /// A decoded message could not be delivered to the client.
    ClientSend(String),
    /// The language server could not be started.
    Launch(String),
}

impl SessionEnd {
    pub fn label(&self) -> &'static str {
        match self {
            SessionEnd::ClientClosed => "client_closed",
            SessionEnd::CompanionExited => "companion_exited",
            SessionEnd::Framing(_) => "framing_error",
            SessionEnd::CompanionIo(_) => "companion_io_error",
            SessionEnd::ClientSend(_) => "client_send_error",
            SessionEnd::Launch(_) => "launch_failed",
        }
    }

    /// Short reason to show the client when the bridge closes the connection.
    /// `None` when the client closed it first.
    pub fn close_reason(&self) -> Option<String> {
        match self {
            SessionEnd::ClientClosed => None,
            SessionEnd::CompanionExited => Some("language server exited".to_string()),
            SessionEnd::Framing(err) => Some(format!("language server framing error: {}", err.code())),
            SessionEnd::CompanionIo(_) => Some("language server i/o error".to_string()),
            SessionEnd::ClientSend(_) => Some("failed to deliver message".to_string()),
            SessionEnd::Launch(_) => Some("language server unavailable".to_string()),
        }
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::ClientClosed => write!(f, "client closed the connection"),
            SessionEnd::CompanionExited => write!(f, "language server exited"),
            SessionEnd::Framing(err) => write!(f, "{}", err),
            SessionEnd::CompanionIo(err) => write!(f, "language server i/o failed: {}", err),
            SessionEnd::ClientSend(err) => write!(f, "client send failed: {}", err),
            SessionEnd::Launch(err) => write!(f, "language server launch failed: {}", err),
        }
    }
}

/// Relay messages until either side ends the session.
///
/// Client messages from `client_rx` are framed onto `companion_in`; frames
/// read from `companion_out` are unwrapped and sent on `client_tx`. The two
/// directions run concurrently and each preserves its own order.
/// `companion_in` is dropped on return, which closes the language server's
/// input.
pub async fn relay<In, Out, R, W>(
    client_rx: &mut In,
    client_tx: &mut Out,
    companion_out: R,
    companion_in: W,
    max_frame_bytes: usize,
) -> SessionEnd
where
    In: Stream<Item = Vec<u8>> + Unpin,
    Out: Sink<Vec<u8>> + Unpin,
    Out::Error: fmt::Display,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let upstream = client_to_companion(client_rx, companion_in);
    let downstream = companion_to_client(companion_out, client_tx, max_frame_bytes);

    tokio::select! {
        end = upstream => end,
        end = downstream => end,
    }
}

async fn client_to_companion<In, W>(client_rx: &mut In, mut companion_in: W) -> SessionEnd
where
    In: Stream<Item = Vec<u8>> + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(message) = client_rx.next().await {
        let written = async {
            companion_in.write_all(&encode_frame(&message)).await?;
            companion_in.flush().await
        };
        if let Err(err) = written.await {
            return companion_write_end(err);
        }
    }

    let _ = companion_in.shutdown().await;
    SessionEnd::ClientClosed
}

async fn companion_to_client<R, Out>(
    mut companion_out: R,
    client_tx: &mut Out,
    max_frame_bytes: usize,
) -> SessionEnd
where
    R: AsyncRead + Unpin,
    Out: Sink<Vec<u8>> + Unpin,
    Out::Error: fmt::Display,
{
    let mut decoder = FrameDecoder::new(max_frame_bytes);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let read = match companion_out.read(&mut chunk).await {
            Ok(0) => return SessionEnd::CompanionExited,
            Ok(read) => read,
            Err(err) => return SessionEnd::CompanionIo(err),
        };
        decoder.push(&chunk[..read]);

        loop {
            match decoder.next_frame() {
                Ok(Some(payload)) => {
                    if let Err(err) = client_tx.send(payload).await {
                        return SessionEnd::ClientSend(err.to_string());
                    }
                }
                Ok(None) => break,
                Err(err) => return SessionEnd::Framing(err),
            }
        }
    }
}

fn companion_write_end(err: io::Error) -> SessionEnd {
    match err.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => SessionEnd::CompanionExited,
        _ => SessionEnd::CompanionIo(err),
    }
}
