//! Evented reader over a child process output stream
//!
//! An [`EventedStreamReader`] pumps bytes from an `AsyncRead` on its own tokio
//! task and fans them out to any number of subscribers as two kinds of events:
//! raw chunks (one per read, partial lines included) and complete lines.
//!
//! ```text
//!   child stdout ──▶ pump task ──┬──▶ Chunk subscribers
//!                                ├──▶ Line subscribers
//!                                └──▶ pending readiness match (at most one)
//! ```
//!
//! Readers start paused so that subscribers and the readiness wait can be
//! registered before the first byte is read. Call [`EventedStreamReader::start`]
//! once the wiring is in place.

use crate::error::MatchError;
use parking_lot::Mutex;
use regex::Regex;
use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{oneshot, watch};
use tracing::debug;

/// Size of each read from the underlying stream
const READ_BUFFER_SIZE: usize = 4096;

/// Bytes of already searched text kept so a match can span reads
const MATCH_OVERLAP: usize = 4096;

/// An event emitted by an [`EventedStreamReader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent<'a> {
    /// A complete line, newline stripped
    Line(&'a str),
    /// The raw bytes of a single read
    Chunk(&'a [u8]),
}

type Subscriber = Arc<dyn Fn(&StreamEvent<'_>) + Send + Sync>;

struct PendingMatch {
    id: u64,
    pattern: Regex,
    window: Vec<u8>,
    result_tx: oneshot::Sender<Result<String, MatchError>>,
}

#[derive(Default)]
struct ReaderState {
    subscribers: Vec<Subscriber>,
    pending: Option<PendingMatch>,
    ended: bool,
    next_match_id: u64,
}

struct ReaderInner {
    label: &'static str,
    state: Mutex<ReaderState>,
    ended_tx: watch::Sender<bool>,
}

impl ReaderInner {
    fn dispatch(&self, event: &StreamEvent<'_>) {
        // Subscribers may register further subscribers, so never call them under the lock
        let subscribers = self.state.lock().subscribers.clone();
        for subscriber in &subscribers {
            subscriber(event);
        }
    }

    fn feed_pending(&self, chunk: &[u8]) {
        let mut state = self.state.lock();
        let matched = match state.pending.as_mut() {
            Some(pending) => {
                pending.window.extend_from_slice(chunk);
                let found = {
                    let text = String::from_utf8_lossy(&pending.window);
                    pending.pattern.find(&text).map(|m| m.as_str().to_string())
                };
                if found.is_none() {
                    trim_window(&mut pending.window);
                }
                found
            }
            None => None,
        };

        if let Some(text) = matched {
            if let Some(pending) = state.pending.take() {
                let _ = pending.result_tx.send(Ok(text));
            }
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.ended = true;
        if let Some(pending) = state.pending.take() {
            let _ = pending.result_tx.send(Err(MatchError::EndOfStream));
        }
        drop(state);
        self.ended_tx.send_replace(true);
    }

    fn register(
        &self,
        pattern: Regex,
    ) -> Result<(u64, oneshot::Receiver<Result<String, MatchError>>), MatchError> {
        let mut state = self.state.lock();
        if state.ended {
            return Err(MatchError::EndOfStream);
        }
        if state.pending.is_some() {
            return Err(MatchError::AlreadyWaiting);
        }

        let id = state.next_match_id;
        state.next_match_id += 1;
        let (result_tx, result_rx) = oneshot::channel();
        state.pending = Some(PendingMatch {
            id,
            pattern,
            window: Vec::new(),
            result_tx,
        });
        Ok((id, result_rx))
    }

    fn cancel(&self, id: u64) {
        let mut state = self.state.lock();
        if state.pending.as_ref().is_some_and(|p| p.id == id) {
            state.pending = None;
        }
    }
}

/// Clears an abandoned match so the reader accepts a new one
struct PendingGuard {
    inner: Arc<ReaderInner>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.inner.cancel(self.id);
    }
}

/// Fan-out reader over a byte stream.
///
/// Cloning is cheap; clones share subscribers and match state. Must be created
/// from within a tokio runtime.
#[derive(Clone)]
pub struct EventedStreamReader {
    inner: Arc<ReaderInner>,
    start_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl EventedStreamReader {
    /// Create a paused reader over `stream`. Nothing is read until [`start`](Self::start).
    pub fn new<R>(label: &'static str, stream: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let inner = Arc::new(ReaderInner {
            label,
            state: Mutex::new(ReaderState::default()),
            ended_tx: watch::channel(false).0,
        });
        let (start_tx, start_rx) = oneshot::channel();

        tokio::spawn(pump(Arc::clone(&inner), stream, start_rx));

        Self {
            inner,
            start_tx: Arc::new(Mutex::new(Some(start_tx))),
        }
    }

    /// Begin reading. Calling this more than once has no effect.
    pub fn start(&self) {
        if let Some(tx) = self.start_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Wait up to `timeout` for the stream to end. Returns whether it did.
    pub async fn wait_for_end(&self, timeout: Duration) -> bool {
        let mut ended_rx = self.inner.ended_tx.subscribe();
        let ended = tokio::time::timeout(timeout, ended_rx.wait_for(|ended| *ended))
            .await
            .is_ok_and(|r| r.is_ok());
        ended
    }

    /// Register a callback for every event, in stream order
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&StreamEvent<'_>) + Send + Sync + 'static,
    {
        self.inner.state.lock().subscribers.push(Arc::new(callback));
    }

    /// Register a callback for complete lines
    pub fn on_line<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subscribe(move |event| {
            if let StreamEvent::Line(line) = event {
                callback(line);
            }
        });
    }

    /// Register a callback for raw chunks
    pub fn on_chunk<F>(&self, callback: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.subscribe(move |event| {
            if let StreamEvent::Chunk(chunk) = event {
                callback(chunk);
            }
        });
    }

    /// Wait until text read from now on matches `pattern`.
    ///
    /// Interest is registered when this method is called, not when the returned
    /// future is first polled. Resolves with the matched text, or fails on
    /// timeout, end of stream, or if another wait is already pending on this
    /// reader. Dropping the future withdraws the registration.
    ///
    /// Each read is searched together with the last 4 KiB already seen, so a
    /// match may span reads as long as it is shorter than that.
    pub fn wait_for_match(
        &self,
        pattern: Regex,
        timeout: Duration,
    ) -> impl Future<Output = Result<String, MatchError>> + Send + 'static {
        let registration = self.inner.register(pattern).map(|(id, result_rx)| {
            let guard = PendingGuard {
                inner: Arc::clone(&self.inner),
                id,
            };
            (guard, result_rx)
        });

        async move {
            let (_guard, result_rx) = registration?;

            match tokio::time::timeout(timeout, result_rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(MatchError::EndOfStream),
                Err(_) => Err(MatchError::Timeout(timeout)),
            }
        }
    }
}

async fn pump<R>(inner: Arc<ReaderInner>, mut stream: R, start_rx: oneshot::Receiver<()>)
where
    R: AsyncRead + Unpin,
{
    // All handles dropped before start: nobody will ever listen
    if start_rx.await.is_err() {
        return;
    }

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut line_buf: Vec<u8> = Vec::new();

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(stream = inner.label, error = %e, "Read failed, treating as end of stream");
                break;
            }
        };
        let chunk = &buf[..n];

        inner.dispatch(&StreamEvent::Chunk(chunk));

        line_buf.extend_from_slice(chunk);
        let mut line_start = 0;
        while let Some(pos) = line_buf[line_start..].iter().position(|&b| b == b'\n') {
            let line_end = line_start + pos;
            let line = decode_line(&line_buf[line_start..line_end]);
            inner.dispatch(&StreamEvent::Line(&*line));
            line_start = line_end + 1;
        }
        line_buf.drain(..line_start);

        inner.feed_pending(chunk);
    }

    if !line_buf.is_empty() {
        let line = decode_line(&line_buf);
        inner.dispatch(&StreamEvent::Line(&*line));
    }

    debug!(stream = inner.label, "Stream ended");
    inner.close();
}

/// Keep only the last `MATCH_OVERLAP` bytes, starting on a UTF-8 boundary
fn trim_window(window: &mut Vec<u8>) {
    let mut excess = window.len().saturating_sub(MATCH_OVERLAP);
    while excess < window.len() && window[excess] & 0xC0 == 0x80 {
        excess += 1;
    }
    window.drain(..excess);
}

fn decode_line(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes)
}

/// Accumulates everything a reader emits, for inclusion in error messages
#[derive(Clone, Default)]
pub struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl OutputCapture {
    /// Start capturing all chunks emitted by `reader`
    pub fn attach(reader: &EventedStreamReader) -> Self {
        let capture = Self::default();
        let buffer = Arc::clone(&capture.buffer);
        reader.on_chunk(move |chunk| buffer.lock().extend_from_slice(chunk));
        capture
    }

    /// Everything captured so far
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }
}
