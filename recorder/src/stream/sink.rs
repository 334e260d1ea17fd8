//! Trace output file with write backpressure
//!
//! Frames are queued to a writer task that appends them to the file in order.
//! [`SinkWriter::write`] always accepts the frame but returns `false` once the
//! queued byte count reaches the high-water mark; [`SinkWriter::drained`]
//! resolves when the queue is empty again.

use bytes::Bytes;
use metrics::counter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{TraceError, TraceResult};

struct SinkShared {
    path: PathBuf,
    high_water_mark: usize,
    /// Bytes accepted but not yet written
    queued: AtomicUsize,
    failed: AtomicBool,
    drained: Notify,
}

/// Output file owned by one trace session
pub struct FileSink {
    writer: SinkWriter,
    task: JoinHandle<TraceResult<u64>>,
}

/// Cloneable write handle to a [`FileSink`]
#[derive(Clone)]
pub struct SinkWriter {
    tx: mpsc::UnboundedSender<Bytes>,
    shared: Arc<SinkShared>,
}

impl FileSink {
    /// Create (or truncate) `path` and start the writer task
    pub async fn create(path: &Path, high_water_mark: usize) -> TraceResult<Self> {
        let file = File::create(path)
            .await
            .map_err(|e| TraceError::io(format!("creating trace file {}", path.display()), e))?;

        let shared = Arc::new(SinkShared {
            path: path.to_path_buf(),
            high_water_mark,
            queued: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            drained: Notify::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_loop(file, rx, Arc::clone(&shared)));

        debug!("Opened trace file {}", path.display());
        Ok(Self {
            writer: SinkWriter { tx, shared },
            task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.writer.shared.path
    }

    pub fn writer(&self) -> SinkWriter {
        self.writer.clone()
    }

    /// Finish the file once every writer handle is gone; returns bytes written
    pub async fn end(self) -> TraceResult<u64> {
        let Self { writer, task } = self;
        drop(writer);
        task.await
            .map_err(|e| TraceError::Task(format!("trace file writer: {}", e)))?
    }
}

impl SinkWriter {
    /// Queue `frame`; `Ok(false)` asks the producer to wait for [`Self::drained`]
    pub fn write(&self, frame: Bytes) -> TraceResult<bool> {
        if self.shared.failed.load(Ordering::Acquire) {
            return Err(TraceError::SinkClosed(self.shared.path.clone()));
        }

        let len = frame.len();
        let queued = self.shared.queued.fetch_add(len, Ordering::AcqRel) + len;
        if self.tx.send(frame).is_err() {
            self.shared.queued.fetch_sub(len, Ordering::AcqRel);
            return Err(TraceError::SinkClosed(self.shared.path.clone()));
        }

        Ok(queued < self.shared.high_water_mark)
    }

    /// Wait until every queued frame has reached the file
    pub async fn drained(&self) -> TraceResult<()> {
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.failed.load(Ordering::Acquire) {
                return Err(TraceError::SinkClosed(self.shared.path.clone()));
            }
            if self.shared.queued.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Bytes accepted but not yet written
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }
}

async fn write_loop(
    mut file: File,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<SinkShared>,
) -> TraceResult<u64> {
    let mut written: u64 = 0;

    while let Some(frame) = rx.recv().await {
        if let Err(e) = file.write_all(&frame).await {
            error!("Failed writing {}: {}", shared.path.display(), e);
            shared.failed.store(true, Ordering::Release);
            shared.drained.notify_waiters();
            return Err(TraceError::io(
                format!("writing trace file {}", shared.path.display()),
                e,
            ));
        }

        written += frame.len() as u64;
        counter!("ecptrace_frames_written_total").increment(1);
        counter!("ecptrace_bytes_written_total").increment(frame.len() as u64);

        if shared.queued.fetch_sub(frame.len(), Ordering::AcqRel) == frame.len() {
            shared.drained.notify_waiters();
        }
    }

    file.flush()
        .await
        .map_err(|e| TraceError::io(format!("flushing trace file {}", shared.path.display()), e))?;

    debug!("Closed trace file {} ({} bytes)", shared.path.display(), written);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_frames_in_order() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.trace");
        let sink = FileSink::create(&path, 1024).await.unwrap();
        let writer = sink.writer();

        assert!(writer.write(Bytes::from_static(b"abc")).unwrap());
        assert!(writer.write(Bytes::from_static(b"def")).unwrap());
        drop(writer);

        assert_eq!(sink.end().await.unwrap(), 6);
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn truncates_existing_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.trace");
        std::fs::write(&path, b"stale contents").unwrap();

        let sink = FileSink::create(&path, 1024).await.unwrap();
        assert_eq!(sink.end().await.unwrap(), 0);
        assert_eq!(std::fs::read(&path).unwrap(), b"");
    }

    #[tokio::test]
    async fn reports_backpressure_at_high_water_mark() {
        let temp = TempDir::new().unwrap();
        let sink = FileSink::create(&temp.path().join("out.trace"), 8)
            .await
            .unwrap();
        let writer = sink.writer();

        assert!(!writer.write(Bytes::from(vec![0u8; 8])).unwrap());
        writer.drained().await.unwrap();
        assert_eq!(writer.queued(), 0);

        drop(writer);
        assert_eq!(sink.end().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn drained_is_immediate_when_idle() {
        let temp = TempDir::new().unwrap();
        let sink = FileSink::create(&temp.path().join("out.trace"), 8)
            .await
            .unwrap();
        sink.writer().drained().await.unwrap();
        sink.end().await.unwrap();
    }

    #[tokio::test]
    async fn create_fails_in_missing_directory() {
        let temp = TempDir::new().unwrap();
        let result = FileSink::create(&temp.path().join("missing/out.trace"), 8).await;
        assert!(matches!(result, Err(TraceError::Io { .. })));
    }
}
