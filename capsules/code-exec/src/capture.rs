use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

const READ_CHUNK: usize = 8 * 1024;

/// Output buffer that keeps at most `cap` bytes and remembers whether more
/// were offered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CappedBuffer {
    bytes: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(cap.min(READ_CHUNK)),
            cap,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
            self.bytes.extend_from_slice(&chunk[..room]);
        } else {
            self.bytes.extend_from_slice(chunk);
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Captured bytes and the truncation flag. A cut that split a UTF-8
    /// sequence drops the partial sequence, so the text never renders a
    /// replacement character past the cap.
    pub fn into_parts(mut self) -> (Vec<u8>, bool) {
        if self.truncated {
            let keep = complete_prefix_len(&self.bytes);
            self.bytes.truncate(keep);
        }
        (self.bytes, self.truncated)
    }
}

/// Length of `bytes` without a trailing incomplete UTF-8 sequence.
fn complete_prefix_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    let mut start = len;
    while start > 0 && len - start < 3 && is_continuation(bytes[start - 1]) {
        start -= 1;
    }
    let Some(lead) = start.checked_sub(1) else {
        return len;
    };
    let width = match bytes[lead] {
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF7 => 4,
        _ => return len,
    };
    if len - lead < width {
        lead
    } else {
        len
    }
}

fn is_continuation(byte: u8) -> bool {
    (0x80..=0xBF).contains(&byte)
}

/// Read `reader` to end into a capped buffer. Reading continues after the cap
/// is hit so the writer never stalls on a full pipe. A `true` on `stop` ends
/// the drain early, for pipes held open by escaped descendants.
pub(crate) async fn drain<R>(mut reader: R, cap: usize, mut stop: watch::Receiver<bool>) -> CappedBuffer
where
    R: AsyncRead + Unpin,
{
    let mut buffer = CappedBuffer::new(cap);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => buffer.push(&chunk[..n]),
                Err(err) => {
                    debug!(error = %err, "output pipe read failed");
                    break;
                }
            },
            _ = stop.wait_for(|stop| *stop) => break,
        }
    }

    buffer
}

pub(crate) fn spawn_drain<R>(
    reader: Option<R>,
    cap: usize,
    stop: watch::Receiver<bool>,
) -> JoinHandle<CappedBuffer>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match reader {
            Some(reader) => drain(reader, cap, stop).await,
            None => CappedBuffer::new(cap),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn push_keeps_prefix_up_to_cap() {
        let mut buffer = CappedBuffer::new(5);
        buffer.push(b"abc");
        assert!(!buffer.truncated());
        buffer.push(b"defgh");
        assert!(buffer.truncated());
        buffer.push(b"ij");
        assert_eq!(buffer.into_parts(), (b"abcde".to_vec(), true));
    }

    #[test]
    fn cut_inside_a_character_drops_the_partial_sequence() {
        // "é" is two bytes; a cap of 5 splits the third one.
        let mut buffer = CappedBuffer::new(5);
        buffer.push("ééé".as_bytes());
        let (bytes, truncated) = buffer.into_parts();
        assert!(truncated);
        assert_eq!(String::from_utf8(bytes).unwrap(), "éé");

        let mut buffer = CappedBuffer::new(3);
        buffer.push("a€".as_bytes());
        assert_eq!(buffer.into_parts(), (b"a".to_vec(), true));

        let mut buffer = CappedBuffer::new(4);
        buffer.push("€€".as_bytes());
        assert_eq!(buffer.into_parts(), ("€".as_bytes().to_vec(), true));
    }

    #[test]
    fn complete_or_binary_tails_are_kept() {
        let mut buffer = CappedBuffer::new(4);
        buffer.push("éé!".as_bytes());
        assert_eq!(buffer.into_parts(), ("éé".as_bytes().to_vec(), true));

        let mut buffer = CappedBuffer::new(3);
        buffer.push(&[0xFF, 0x80, 0x80, 0x80, 0x00]);
        assert_eq!(buffer.into_parts(), (vec![0xFF, 0x80, 0x80], true));

        // Untruncated output is returned as written, even if it ends mid-sequence.
        let mut buffer = CappedBuffer::new(8);
        buffer.push(&[b'a', 0xC3]);
        assert_eq!(buffer.into_parts(), (vec![b'a', 0xC3], false));
    }

    #[test]
    fn exact_fill_is_not_truncation() {
        let mut buffer = CappedBuffer::new(4);
        buffer.push(b"abcd");
        assert_eq!(buffer.len(), 4);
        assert!(!buffer.truncated());
        buffer.push(b"");
        assert!(!buffer.truncated());
    }

    #[test]
    fn zero_cap_truncates_any_output() {
        let mut buffer = CappedBuffer::new(0);
        buffer.push(b"x");
        assert!(buffer.is_empty());
        assert!(buffer.truncated());
    }

    #[tokio::test]
    async fn drain_consumes_everything_past_the_cap() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(drain(reader, 10, stop_rx));

        // Far more than the duplex buffer: completes only if the reader keeps
        // consuming after the cap.
        let payload = vec![b'x'; 64 * 1024];
        writer.write_all(&payload).await.unwrap();
        drop(writer);

        let buffer = task.await.unwrap();
        assert_eq!(buffer.len(), 10);
        assert!(buffer.truncated());
    }

    #[tokio::test]
    async fn stop_signal_ends_drain_of_open_pipe() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(drain(reader, 100, stop_rx));

        writer.write_all(b"partial").await.unwrap();
        tokio::task::yield_now().await;
        stop_tx.send(true).unwrap();

        let buffer = task.await.unwrap();
        assert!(!buffer.truncated());
        assert!(buffer.len() <= 7);
        drop(writer);
    }

    #[tokio::test]
    async fn missing_pipe_yields_empty_buffer() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let buffer = spawn_drain(None::<tokio::io::DuplexStream>, 8, stop_rx)
            .await
            .unwrap();
        assert!(buffer.is_empty());
    }
}
