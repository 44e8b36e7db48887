//! Daemon stdout/stderr handling
//!
//! Each stream is read continuously by a pump task so the child can never
//! block on a full pipe. Chunks are buffered until a consumer attaches with
//! [`NodeHandle::take_stdout`](super::manager::NodeHandle::take_stdout); if
//! nobody attaches before the drain delay, the buffer is dropped and later
//! output is discarded. An attached consumer that falls more than
//! [`ATTACHED_CHUNKS`] chunks behind is cut off the same way.

use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

const CHUNK_SIZE: usize = 8 * 1024;

/// Upper bound on captured stderr kept for startup failures
const CAPTURE_LIMIT: usize = 64 * 1024;

/// Chunks an attached consumer may leave unread before it is cut off
pub const ATTACHED_CHUNKS: usize = 1024;

enum TapState {
    /// No consumer yet
    Pending(Vec<Bytes>),
    Attached(mpsc::Sender<Bytes>),
    /// Drained, or the consumer went away
    Discarding,
}

struct TapInner {
    state: TapState,
    closed: bool,
}

/// Hand-off point between a pump and at most one consumer
pub(crate) struct OutputTap {
    name: &'static str,
    inner: Mutex<TapInner>,
}

impl OutputTap {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(TapInner {
                state: TapState::Pending(Vec::new()),
                closed: false,
            }),
        }
    }

    /// Attach the single consumer, replaying anything buffered so far
    pub(crate) fn attach(&self) -> Option<DaemonOutput> {
        let mut inner = self.inner.lock().unwrap();
        let buffered = match std::mem::replace(&mut inner.state, TapState::Discarding) {
            TapState::Pending(chunks) => chunks,
            other => {
                inner.state = other;
                return None;
            }
        };

        let (tx, rx) = mpsc::channel(ATTACHED_CHUNKS.max(buffered.len()));
        for chunk in buffered {
            let _ = tx.try_send(chunk);
        }
        if !inner.closed {
            inner.state = TapState::Attached(tx);
        }
        Some(DaemonOutput { rx })
    }

    fn push(&self, chunk: Bytes) {
        let mut inner = self.inner.lock().unwrap();
        let consumer_gone = match &mut inner.state {
            TapState::Pending(chunks) => {
                chunks.push(chunk);
                false
            }
            TapState::Attached(tx) => match tx.try_send(chunk) {
                Ok(()) => false,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!(
                        "bitcoind {} consumer is {} chunks behind; discarding further output",
                        self.name,
                        ATTACHED_CHUNKS
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => true,
            },
            TapState::Discarding => false,
        };
        if consumer_gone {
            inner.state = TapState::Discarding;
        }
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        if matches!(inner.state, TapState::Attached(_)) {
            inner.state = TapState::Discarding;
        }
    }

    /// Discard buffered output if no consumer attached
    pub(crate) fn drain(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let TapState::Pending(chunks) = &inner.state {
            let bytes: usize = chunks.iter().map(Bytes::len).sum();
            log::debug!("Draining unclaimed bitcoind {} ({} bytes)", self.name, bytes);
            inner.state = TapState::Discarding;
            true
        } else {
            false
        }
    }
}

/// A claimed daemon output stream
#[derive(Debug)]
pub struct DaemonOutput {
    rx: mpsc::Receiver<Bytes>,
}

impl DaemonOutput {
    /// Next chunk of output, `None` once the stream is closed
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Collect everything until the daemon closes the stream
    pub async fn read_to_end(mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    pub async fn read_to_string(self) -> String {
        String::from_utf8_lossy(&self.read_to_end().await).into_owned()
    }
}

/// Bounded copy of a stream, kept for error reporting
#[derive(Clone, Default)]
pub(crate) struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Capture {
    fn extend(&self, data: &[u8]) {
        let mut buf = self.buf.lock().unwrap();
        let room = CAPTURE_LIMIT.saturating_sub(buf.len());
        buf.extend_from_slice(&data[..data.len().min(room)]);
    }

    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().unwrap()).into_owned()
    }
}

/// Read `reader` to EOF, feeding the tap, the optional mirror and capture
pub(crate) async fn pump<R, W>(
    mut reader: R,
    tap: Arc<OutputTap>,
    mut mirror: Option<W>,
    capture: Option<Capture>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::debug!("Error reading bitcoind {}: {}", tap.name, e);
                break;
            }
        };
        let data = &buf[..n];

        if let Some(out) = mirror.as_mut() {
            if out.write_all(data).await.is_err() || out.flush().await.is_err() {
                mirror = None;
            }
        }
        if let Some(capture) = &capture {
            capture.extend(data);
        }
        tap.push(Bytes::copy_from_slice(data));
    }
    tap.close();
}
