use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::event::InsertedEvent;

/// Sink accepts encoded records for delivery downstream.
pub trait Sink: Send + Sync {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Deliver one encoded record.
    fn publish(&self, payload: Vec<u8>) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Flush and release the sink. Later publishes fail.
    fn close(&self) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Sink backed by an in-process channel.
pub struct ChannelSink {
    name: String,
    tx: parking_lot::Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

/// Creates a bounded channel sink and the receiver draining it.
pub fn channel_sink(name: &str, capacity: usize) -> (ChannelSink, mpsc::Receiver<Vec<u8>>) {
    let (tx, rx) = mpsc::channel(capacity);

    let sink = ChannelSink {
        name: name.to_string(),
        tx: parking_lot::Mutex::new(Some(tx)),
    };

    (sink, rx)
}

impl Sink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| anyhow!("sink {} is closed", self.name))?;

        tx.send(payload)
            .await
            .map_err(|_| anyhow!("sink {} receiver dropped", self.name))
    }

    async fn close(&self) -> Result<()> {
        self.tx.lock().take();
        Ok(())
    }
}

/// Sink writing one record per line to an async writer.
pub struct WriterSink {
    name: String,
    writer: tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Unpin + Send>>>,
}

impl WriterSink {
    pub fn new(name: &str, writer: Box<dyn AsyncWrite + Unpin + Send>) -> Self {
        Self {
            name: name.to_string(),
            writer: tokio::sync::Mutex::new(Some(writer)),
        }
    }

    /// Opens `location` for appending. "-" selects `default`.
    pub async fn open(
        name: &str,
        location: &str,
        default: fn() -> Box<dyn AsyncWrite + Unpin + Send>,
    ) -> Result<Self> {
        if location == "-" {
            return Ok(Self::new(name, default()));
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(location)
            .await
            .with_context(|| format!("opening {name} output {location}"))?;

        Ok(Self::new(name, Box::new(file)))
    }
}

/// Stdout as a boxed writer.
pub fn stdout() -> Box<dyn AsyncWrite + Unpin + Send> {
    Box::new(tokio::io::stdout())
}

/// Stderr as a boxed writer.
pub fn stderr() -> Box<dyn AsyncWrite + Unpin + Send> {
    Box::new(tokio::io::stderr())
}

impl Sink for WriterSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| anyhow!("sink {} is closed", self.name))?;

        writer
            .write_all(&payload)
            .await
            .with_context(|| format!("writing to {}", self.name))?;
        writer
            .write_all(b"\n")
            .await
            .with_context(|| format!("writing to {}", self.name))?;
        writer
            .flush()
            .await
            .with_context(|| format!("flushing {}", self.name))
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer
                .shutdown()
                .await
                .with_context(|| format!("closing {}", self.name))?;
        }
        Ok(())
    }
}

/// Publishes one inserted-event record per persisted instance.
pub struct ResultPublisher<S> {
    sink: Arc<S>,
}

impl<S: Sink> ResultPublisher<S> {
    pub fn new(sink: Arc<S>) -> Self {
        Self { sink }
    }

    pub async fn publish(&self, results: &[InsertedEvent]) -> Result<()> {
        for result in results {
            let payload = result.encode()?;
            self.sink
                .publish(payload)
                .await
                .with_context(|| format!("publishing result for {}", result.instance_id))?;

            debug!(
                instance_id = %result.instance_id,
                observations = result.observations_inserted,
                sink = self.sink.name(),
                "published result",
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_publish_and_close() {
        let (sink, mut rx) = channel_sink("results", 4);
        assert_eq!(sink.name(), "results");

        sink.publish(b"one".to_vec()).await.expect("publish");
        assert_eq!(rx.recv().await.expect("received"), b"one");

        sink.close().await.expect("close");
        assert!(sink.publish(b"two".to_vec()).await.is_err());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_writer_sink_writes_lines() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("results.jsonl");
        let location = path.to_str().expect("utf8 path");

        let sink = WriterSink::open("results", location, stdout)
            .await
            .expect("open");
        sink.publish(b"{\"a\":1}".to_vec()).await.expect("publish a");
        sink.publish(b"{\"b\":2}".to_vec()).await.expect("publish b");
        sink.close().await.expect("close");

        let written = std::fs::read_to_string(&path).expect("read output");
        assert_eq!(written, "{\"a\":1}\n{\"b\":2}\n");
        assert!(sink.publish(b"late".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_result_publisher_encodes_each_result() {
        let (sink, mut rx) = channel_sink("results", 4);
        let publisher = ResultPublisher::new(Arc::new(sink));

        let results = vec![
            InsertedEvent {
                instance_id: "a".to_string(),
                observations_inserted: 2,
            },
            InsertedEvent {
                instance_id: "b".to_string(),
                observations_inserted: 1,
            },
        ];
        publisher.publish(&results).await.expect("publish");

        let first = InsertedEvent::decode(&rx.recv().await.expect("a")).expect("decode a");
        let second = InsertedEvent::decode(&rx.recv().await.expect("b")).expect("decode b");
        assert_eq!(first, results[0]);
        assert_eq!(second, results[1]);
    }
}
