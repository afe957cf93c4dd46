//! Bridge session specs against real subprocesses.
//!
//! `/bin/cat` stands in for a language server: it echoes every framed
//! request back, which the bridge must unwrap into the original message.

use anyhow::Result;
use capsules_lsp_bridge::{Bridge, CompanionLauncher, CompanionSpec, FramingError, SessionEnd};
use confinement::DirectConfiner;
use futures_util::{stream, Sink, StreamExt};
use session_registry::SessionRegistry;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

struct Harness {
    _root: TempDir,
    registry: SessionRegistry,
    bridge: Bridge,
}

impl Harness {
    fn new(program: &str, args: &[&str]) -> Self {
        let root = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(root.path().join("scratch")).unwrap();
        let spec = CompanionSpec {
            args: args.iter().map(|arg| arg.to_string()).collect(),
            ..CompanionSpec::new(program)
        };
        let launcher =
            CompanionLauncher::new(Arc::new(DirectConfiner::new()), registry.clone(), spec);
        Self {
            _root: root,
            registry,
            bridge: Bridge::new(launcher),
        }
    }

    fn scratch_entries(&self) -> usize {
        std::fs::read_dir(self.registry.scratch_root())
            .unwrap()
            .count()
    }
}

/// Client sink that forwards delivered messages to a channel so the test can
/// observe them while the session is still running.
fn client_sink(tx: mpsc::UnboundedSender<Vec<u8>>) -> Pin<Box<dyn Sink<Vec<u8>, Error = String> + Send>> {
    Box::pin(futures_util::sink::unfold(
        tx,
        |tx, message: Vec<u8>| async move {
            tx.send(message).map_err(|err| err.to_string())?;
            Ok::<_, String>(tx)
        },
    ))
}

#[tokio::test]
async fn given_echo_server_when_client_sends_messages_then_each_round_trips_unchanged() -> Result<()>
{
    // Arrange
    let harness = Harness::new("/bin/cat", &[]);
    let (client_tx, client_messages) = mpsc::channel(8);
    let mut client_rx = ReceiverStream::new(client_messages);
    let (delivered_tx, mut delivered) = mpsc::unbounded_channel();
    let mut sink = client_sink(delivered_tx);

    let messages = [
        r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
        r#"{"jsonrpc":"2.0","method":"textDocument/didOpen","params":{"text":"é\r\n\r\n"}}"#,
    ];

    // Act
    let session = tokio::spawn({
        let bridge = harness.bridge.clone();
        async move { bridge.serve(&mut client_rx, &mut sink).await }
    });
    for message in messages {
        client_tx.send(message.as_bytes().to_vec()).await?;
    }

    // Assert: order preserved, payloads byte-identical.
    for message in messages {
        let echoed = tokio::time::timeout(Duration::from_secs(5), delivered.recv())
            .await?
            .expect("bridge stopped delivering");
        assert_eq!(echoed, message.as_bytes());
    }
    assert_eq!(harness.registry.active(), 1);

    drop(client_tx);
    let end = session.await?;
    assert!(matches!(end, SessionEnd::ClientClosed));
    assert_eq!(harness.registry.active(), 0);
    assert_eq!(harness.scratch_entries(), 0);

    Ok(())
}

#[tokio::test]
async fn given_client_disconnects_before_sending_when_serve_then_no_server_is_started(
) -> Result<()> {
    let harness = Harness::new("/nonexistent/language-server", &[]);
    let mut client_rx = stream::empty::<Vec<u8>>();
    let mut sink: Vec<Vec<u8>> = Vec::new();

    let end = harness.bridge.serve(&mut client_rx, &mut sink).await;

    // A launch attempt would have failed on the missing binary.
    assert!(matches!(end, SessionEnd::ClientClosed));
    assert_eq!(harness.scratch_entries(), 0);

    Ok(())
}

#[tokio::test]
async fn given_server_exits_when_session_running_then_ends_with_clear_status() -> Result<()> {
    let harness = Harness::new("/bin/sh", &["-c", "exit 0"]);
    let mut client_rx = stream::iter(vec![b"{}".to_vec()]).chain(stream::pending());
    let mut sink: Vec<Vec<u8>> = Vec::new();

    let end = tokio::time::timeout(
        Duration::from_secs(5),
        harness.bridge.serve(&mut client_rx, &mut sink),
    )
    .await?;

    assert!(matches!(end, SessionEnd::CompanionExited));
    assert!(end.close_reason().is_some());
    assert_eq!(harness.registry.active(), 0);

    Ok(())
}

#[tokio::test]
async fn given_malformed_server_output_when_relaying_then_session_terminates() -> Result<()> {
    let harness = Harness::new(
        "/bin/sh",
        &["-c", "printf 'Content-Length: nope\\r\\n\\r\\n'; sleep 30"],
    );
    let mut client_rx = stream::iter(vec![b"{}".to_vec()]).chain(stream::pending());
    let mut sink: Vec<Vec<u8>> = Vec::new();

    let end = tokio::time::timeout(
        Duration::from_secs(5),
        harness.bridge.serve(&mut client_rx, &mut sink),
    )
    .await?;

    assert!(matches!(
        end,
        SessionEnd::Framing(FramingError::MalformedHeader { .. })
    ));
    assert!(sink.is_empty());
    assert_eq!(harness.registry.active(), 0);
    assert_eq!(harness.scratch_entries(), 0);

    Ok(())
}

#[tokio::test]
async fn given_server_cannot_start_when_first_message_arrives_then_launch_end() -> Result<()> {
    let harness = Harness::new("/nonexistent/language-server", &[]);
    let mut client_rx = stream::iter(vec![b"{}".to_vec()]);
    let mut sink: Vec<Vec<u8>> = Vec::new();

    let end = harness.bridge.serve(&mut client_rx, &mut sink).await;

    assert!(matches!(end, SessionEnd::Launch(_)));
    assert_eq!(end.label(), "launch_failed");
    assert_eq!(harness.scratch_entries(), 0);

    Ok(())
}

#[tokio::test]
async fn given_two_sessions_when_served_concurrently_then_each_gets_its_own_server() -> Result<()>
{
    let harness = Harness::new("/bin/cat", &[]);

    let run = |payload: &'static str| {
        let bridge = harness.bridge.clone();
        async move {
            let mut client_rx = stream::iter(vec![payload.as_bytes().to_vec()]).chain(stream::pending());
            let (delivered_tx, mut delivered) = mpsc::unbounded_channel();
            let mut sink = client_sink(delivered_tx);
            tokio::select! {
                _ = bridge.serve(&mut client_rx, &mut sink) => None,
                echoed = delivered.recv() => echoed,
            }
        }
    };

    let (left, right) = tokio::join!(run(r#"{"id":"left"}"#), run(r#"{"id":"right"}"#));

    assert_eq!(left.as_deref(), Some(br#"{"id":"left"}"#.as_slice()));
    assert_eq!(right.as_deref(), Some(br#"{"id":"right"}"#.as_slice()));

    // Abandoned sessions release their servers and workspaces on drop.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.registry.active(), 0);

    Ok(())
}
