//! Bridge between message-oriented JSON-RPC clients and language servers.
//!
//! Clients exchange one JSON-RPC message per transport message. Language
//! servers speak the same payloads over stdio, each prefixed with a
//! `Content-Length` header. A [`Bridge`] pairs one client connection with
//! its own confined language server, started when the first client message
//! arrives, and relays in both directions until either side goes away.

use std::fmt;

use futures_util::{stream, Sink, Stream, StreamExt};
use tracing::{error, info};

mod companion;
mod framing;
mod relay;

pub use companion::{BridgeError, Companion, CompanionLauncher, CompanionProcess, CompanionSpec};
pub use framing::{encode_frame, FrameDecoder, FramingError, DEFAULT_MAX_FRAME_BYTES, MAX_HEADER_BYTES};
pub use relay::{relay, SessionEnd};

#[derive(Debug, Clone)]
pub struct Bridge {
    launcher: CompanionLauncher,
}

impl Bridge {
    pub fn new(launcher: CompanionLauncher) -> Self {
        Self { launcher }
    }

    pub fn launcher(&self) -> &CompanionLauncher {
        &self.launcher
    }

    /// Serve one client connection to completion.
    ///
    /// No language server is started for a client that disconnects before
    /// sending anything. Every resource of the session is released before
    /// this returns.
    pub async fn serve<In, Out>(&self, client_rx: &mut In, client_tx: &mut Out) -> SessionEnd
    where
        In: Stream<Item = Vec<u8>> + Unpin,
        Out: Sink<Vec<u8>> + Unpin,
        Out::Error: fmt::Display,
    {
        let Some(first) = client_rx.next().await else {
            return SessionEnd::ClientClosed;
        };

        let companion = match self.launcher.launch() {
            Ok(companion) => companion,
            Err(err) => {
                error!(error = %err, code = err.code(), "failed to start language server");
                return SessionEnd::Launch(err.to_string());
            }
        };
        let (stdout, stdin, process) = companion.into_parts();
        let key = process.key();
        info!(session = %key, "bridge session started");

        let mut replay = stream::iter(Some(first)).chain(&mut *client_rx);
        let end = relay(
            &mut replay,
            client_tx,
            stdout,
            stdin,
            self.launcher.spec().max_frame_bytes,
        )
        .await;

        info!(session = %key, end = end.label(), detail = %end, "bridge session ended");
        process.shutdown().await;
        end
    }
}
