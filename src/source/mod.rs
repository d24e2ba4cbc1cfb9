//! Message sources feeding the consume loop.
//!
//! A source hands out messages one at a time; each message can be marked
//! (acknowledged as processed without advancing the committed position) or
//! committed (advancing the position through that message).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

/// A single message read from a source.
pub trait Message: Send + Sync {
    /// Raw wire payload.
    fn payload(&self) -> &[u8];

    /// Position of the message in its source.
    fn offset(&self) -> i64;

    /// Acknowledge this message as processed without committing.
    fn mark(&self);

    /// Commit the source position through this message.
    fn commit(&self);
}

/// Suspending stream of messages.
pub trait MessageSource: Send + Sync {
    type Message: Message;

    /// Waits for the next message. Returns `Ok(None)` once the source is
    /// exhausted or closed, and an error when the source can no longer be
    /// read. Must be cancel-safe.
    fn next_message(
        &self,
    ) -> impl std::future::Future<Output = Result<Option<Self::Message>>> + Send;

    /// Stops the source. Pending reads return `Ok(None)`.
    fn close(&self) -> impl std::future::Future<Output = Result<()>> + Send;
}

#[derive(Debug, Default)]
struct OffsetState {
    marked: Vec<i64>,
    committed: Option<i64>,
}

/// Records marked and committed offsets for a source.
#[derive(Debug, Clone, Default)]
pub struct OffsetTracker {
    state: Arc<Mutex<OffsetState>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn mark(&self, offset: i64) {
        self.state.lock().marked.push(offset);
    }

    fn commit(&self, offset: i64) {
        let mut state = self.state.lock();
        state.committed = Some(state.committed.map_or(offset, |c| c.max(offset)));
    }

    /// Offsets marked since the tracker was created, in mark order.
    pub fn marked(&self) -> Vec<i64> {
        self.state.lock().marked.clone()
    }

    /// Highest committed offset, if any.
    pub fn committed(&self) -> Option<i64> {
        self.state.lock().committed
    }
}

/// Message produced by the in-process sources.
#[derive(Debug)]
pub struct TrackedMessage {
    payload: Vec<u8>,
    offset: i64,
    tracker: OffsetTracker,
}

impl TrackedMessage {
    pub fn new(payload: Vec<u8>, offset: i64, tracker: OffsetTracker) -> Self {
        Self {
            payload,
            offset,
            tracker,
        }
    }
}

impl Message for TrackedMessage {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn offset(&self) -> i64 {
        self.offset
    }

    fn mark(&self) {
        self.tracker.mark(self.offset);
    }

    fn commit(&self) {
        debug!(offset = self.offset, "committing offset");
        self.tracker.commit(self.offset);
    }
}

/// Source fed by an in-process channel.
pub struct ChannelSource {
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    next_offset: AtomicI64,
    tracker: OffsetTracker,
}

/// Creates a bounded channel source and the sender feeding it.
pub fn channel_source(capacity: usize) -> (mpsc::Sender<Vec<u8>>, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity);

    let source = ChannelSource {
        rx: tokio::sync::Mutex::new(rx),
        next_offset: AtomicI64::new(0),
        tracker: OffsetTracker::new(),
    };

    (tx, source)
}

impl ChannelSource {
    pub fn tracker(&self) -> OffsetTracker {
        self.tracker.clone()
    }
}

impl MessageSource for ChannelSource {
    type Message = TrackedMessage;

    async fn next_message(&self) -> Result<Option<TrackedMessage>> {
        let Some(payload) = self.rx.lock().await.recv().await else {
            return Ok(None);
        };
        let offset = self.next_offset.fetch_add(1, Ordering::Relaxed);

        Ok(Some(TrackedMessage::new(payload, offset, self.tracker.clone())))
    }

    async fn close(&self) -> Result<()> {
        self.rx.lock().await.close();
        Ok(())
    }
}

/// Reader plus the bytes of a line not yet completed.
///
/// The partial line lives here rather than in the read future so a read
/// cancelled mid-line resumes where it stopped.
struct LineReader<R> {
    reader: R,
    pending: Vec<u8>,
}

/// Source reading one payload per line from an async reader.
///
/// Lines are handed on as raw bytes, so a line that is not valid UTF-8 is
/// dropped by the decoder like any other malformed payload. Blank lines are
/// skipped. The offset is the zero-based line number.
pub struct LineSource<R> {
    reader: tokio::sync::Mutex<Option<LineReader<R>>>,
    next_offset: AtomicI64,
    tracker: OffsetTracker,
}

/// Line source over stdin or a file.
pub type BoxedLineSource = LineSource<Box<dyn AsyncBufRead + Unpin + Send>>;

impl<R: AsyncBufRead + Unpin + Send> LineSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: tokio::sync::Mutex::new(Some(LineReader {
                reader,
                pending: Vec::new(),
            })),
            next_offset: AtomicI64::new(0),
            tracker: OffsetTracker::new(),
        }
    }

    pub fn tracker(&self) -> OffsetTracker {
        self.tracker.clone()
    }
}

impl BoxedLineSource {
    /// Opens `location`, where "-" selects stdin.
    pub async fn open(location: &str) -> Result<Self> {
        let reader: Box<dyn AsyncBufRead + Unpin + Send> = if location == "-" {
            Box::new(BufReader::new(tokio::io::stdin()))
        } else {
            let file = tokio::fs::File::open(location)
                .await
                .with_context(|| format!("opening input {location}"))?;
            Box::new(BufReader::new(file))
        };

        Ok(Self::new(reader))
    }
}

fn trim_line_ending(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
}

impl<R: AsyncBufRead + Unpin + Send> MessageSource for LineSource<R> {
    type Message = TrackedMessage;

    async fn next_message(&self) -> Result<Option<TrackedMessage>> {
        let mut guard = self.reader.lock().await;
        let Some(state) = guard.as_mut() else {
            return Ok(None);
        };

        loop {
            let offset = self.next_offset.load(Ordering::Relaxed);

            let read = state
                .reader
                .read_until(b'\n', &mut state.pending)
                .await
                .with_context(|| format!("reading input line {offset}"))?;
            if read == 0 && state.pending.is_empty() {
                return Ok(None);
            }

            let mut line = std::mem::take(&mut state.pending);
            self.next_offset.fetch_add(1, Ordering::Relaxed);

            trim_line_ending(&mut line);
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return Ok(Some(TrackedMessage::new(
                line,
                offset,
                self.tracker.clone(),
            )));
        }
    }

    async fn close(&self) -> Result<()> {
        self.reader.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context as TaskContext, Poll};

    use tokio::io::{AsyncRead, ReadBuf};

    use super::*;

    async fn next<S: MessageSource>(source: &S) -> S::Message {
        source
            .next_message()
            .await
            .expect("read")
            .expect("message")
    }

    async fn exhausted<S: MessageSource>(source: &S) -> bool {
        source.next_message().await.expect("read").is_none()
    }

    #[tokio::test]
    async fn test_channel_source_assigns_offsets() {
        let (tx, source) = channel_source(4);
        tx.send(b"a".to_vec()).await.expect("send a");
        tx.send(b"b".to_vec()).await.expect("send b");
        drop(tx);

        let first = next(&source).await;
        let second = next(&source).await;
        assert_eq!(first.payload(), b"a");
        assert_eq!(first.offset(), 0);
        assert_eq!(second.offset(), 1);
        assert!(exhausted(&source).await);
    }

    #[tokio::test]
    async fn test_tracker_records_mark_and_commit() {
        let (tx, source) = channel_source(4);
        for payload in [b"1", b"2", b"3"] {
            tx.send(payload.to_vec()).await.expect("send");
        }

        let a = next(&source).await;
        let b = next(&source).await;
        let c = next(&source).await;
        a.mark();
        b.mark();
        c.commit();

        let tracker = source.tracker();
        assert_eq!(tracker.marked(), vec![0, 1]);
        assert_eq!(tracker.committed(), Some(2));
    }

    #[tokio::test]
    async fn test_channel_source_close() {
        let (tx, source) = channel_source(4);
        source.close().await.expect("close");
        assert!(tx.send(b"late".to_vec()).await.is_err());
        assert!(exhausted(&source).await);
    }

    #[tokio::test]
    async fn test_line_source_skips_blank_lines() {
        let input: &[u8] = b"first\n\n  \r\nsecond\r\n";
        let source = LineSource::new(input);

        let first = next(&source).await;
        let second = next(&source).await;
        assert_eq!(first.payload(), b"first");
        assert_eq!(first.offset(), 0);
        assert_eq!(second.payload(), b"second");
        assert_eq!(second.offset(), 3);
        assert!(exhausted(&source).await);
    }

    #[tokio::test]
    async fn test_line_source_last_line_without_newline() {
        let input: &[u8] = b"first\nlast";
        let source = LineSource::new(input);

        assert_eq!(next(&source).await.payload(), b"first");
        assert_eq!(next(&source).await.payload(), b"last");
        assert!(exhausted(&source).await);
    }

    #[tokio::test]
    async fn test_line_source_passes_invalid_utf8_through() {
        let input: &[u8] = b"first\n\xff\xfe\nthird\n";
        let source = LineSource::new(input);

        assert_eq!(next(&source).await.payload(), b"first");

        let invalid = next(&source).await;
        assert_eq!(invalid.payload(), b"\xff\xfe");
        assert_eq!(invalid.offset(), 1);

        let third = next(&source).await;
        assert_eq!(third.payload(), b"third");
        assert_eq!(third.offset(), 2);
        assert!(exhausted(&source).await);
    }

    /// Reader that yields one line and then fails.
    struct FailingReader {
        served: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.served {
                return Poll::Ready(Err(io::Error::other("device gone")));
            }
            self.served = true;
            buf.put_slice(b"first\n");
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_line_source_read_error_is_returned() {
        let source = LineSource::new(BufReader::new(FailingReader { served: false }));

        assert_eq!(next(&source).await.payload(), b"first");

        let err = source.next_message().await.expect_err("read error");
        assert!(format!("{err:#}").contains("device gone"));
    }

    #[tokio::test]
    async fn test_line_source_close() {
        let input: &[u8] = b"first\n";
        let source = LineSource::new(input);
        source.close().await.expect("close");
        assert!(exhausted(&source).await);
    }

    #[tokio::test]
    async fn test_line_source_open_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("events.jsonl");
        std::fs::write(&path, "one\ntwo\n").expect("write input");

        let source = BoxedLineSource::open(path.to_str().expect("utf8 path"))
            .await
            .expect("open");
        assert_eq!(next(&source).await.payload(), b"one");
        assert_eq!(next(&source).await.payload(), b"two");
    }

    #[tokio::test]
    async fn test_line_source_open_missing_file() {
        assert!(BoxedLineSource::open("/nonexistent/events.jsonl").await.is_err());
    }
}
