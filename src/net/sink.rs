//! Outbound side of a session
//!
//! The transport hands the engine a [`SessionSink`]. The engine never writes
//! to it directly from shared code paths: every session gets an [`Outbound`]
//! queue drained by its own writer task, so a slow or dead session can only
//! ever stall itself.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Errors reported by a session sink
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Session sink closed")]
    Closed,
    #[error("Write timed out after {0:?}")]
    Timeout(Duration),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Raw byte channel to one remote terminal, provided by the transport
#[async_trait]
pub trait SessionSink: Send + Sync + 'static {
    /// Write bytes to the terminal
    async fn write(&self, data: Bytes) -> Result<(), SinkError>;

    /// Close the channel; further writes fail
    async fn close(&self);
}

/// Why a frame could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Outbound queue full")]
    Full,
    #[error("Outbound queue closed")]
    Closed,
}

#[derive(Debug)]
enum Frame {
    Data(Bytes),
    /// Written last; anything queued behind it is discarded
    Last(Bytes),
}

/// Ordered, bounded queue in front of a session sink
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Frame>,
}

impl Outbound {
    /// Spawn the writer task for `sink`.
    ///
    /// The task writes queued frames in order, each bounded by
    /// `write_timeout`. On the first failure it stops, calls `on_failure`
    /// and closes the sink. It also stops after a frame queued with
    /// [`Outbound::finish`], or once every handle is dropped and the queue
    /// is drained.
    pub fn spawn<F>(
        sink: Arc<dyn SessionSink>,
        capacity: usize,
        write_timeout: Duration,
        on_failure: F,
    ) -> Self
    where
        F: FnOnce(SinkError) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Frame>(capacity.max(1));

        tokio::spawn(async move {
            let mut failure = None;
            while let Some(frame) = rx.recv().await {
                let (data, last) = match frame {
                    Frame::Data(data) => (data, false),
                    Frame::Last(data) => (data, true),
                };
                match tokio::time::timeout(write_timeout, sink.write(data)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        failure = Some(e);
                        break;
                    }
                    Err(_) => {
                        failure = Some(SinkError::Timeout(write_timeout));
                        break;
                    }
                }
                if last {
                    break;
                }
            }
            // Stop accepting frames before the sink goes away
            rx.close();
            sink.close().await;
            if let Some(e) = failure {
                debug!("Session writer stopped: {}", e);
                on_failure(e);
            }
        });

        Self { tx }
    }

    /// Queue a frame without waiting; a full queue drops the frame
    pub fn try_send(&self, data: Bytes) -> Result<(), QueueError> {
        self.queue(Frame::Data(data))
    }

    /// Queue the final frame; the writer closes the sink after it
    pub fn finish(&self, data: Bytes) -> Result<(), QueueError> {
        self.queue(Frame::Last(data))
    }

    fn queue(&self, frame: Frame) -> Result<(), QueueError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{settle, MemorySink};
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Sink whose writes never complete
    struct StuckSink;

    #[async_trait]
    impl SessionSink for StuckSink {
        async fn write(&self, _data: Bytes) -> Result<(), SinkError> {
            std::future::pending().await
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_frames_written_in_order() {
        let sink = MemorySink::new();
        let outbound = Outbound::spawn(sink.clone(), 8, Duration::from_secs(1), |_| {});
        outbound.try_send(Bytes::from_static(b"one ")).unwrap();
        outbound.try_send(Bytes::from_static(b"two ")).unwrap();
        outbound.try_send(Bytes::from_static(b"three")).unwrap();
        settle().await;
        assert_eq!(sink.text(), "one two three");
        assert!(!sink.is_closed());
    }

    #[tokio::test]
    async fn test_drop_drains_then_closes() {
        let sink = MemorySink::new();
        let outbound = Outbound::spawn(sink.clone(), 8, Duration::from_secs(1), |_| {});
        outbound.try_send(Bytes::from_static(b"bye")).unwrap();
        drop(outbound);
        settle().await;
        assert_eq!(sink.text(), "bye");
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_finish_discards_later_frames() {
        let sink = MemorySink::new();
        let outbound = Outbound::spawn(sink.clone(), 8, Duration::from_secs(1), |_| {});
        let straggler = outbound.clone();
        outbound.try_send(Bytes::from_static(b"frame ")).unwrap();
        outbound.finish(Bytes::from_static(b"bye")).unwrap();
        let _ = straggler.try_send(Bytes::from_static(b" late"));
        settle().await;
        assert_eq!(sink.text(), "frame bye");
        assert!(sink.is_closed());
        assert!(straggler.is_closed());
    }

    #[tokio::test]
    async fn test_write_failure_reported_once() {
        let sink = MemorySink::new();
        sink.fail_writes();
        let failed = Arc::new(AtomicBool::new(false));
        let flag = failed.clone();
        let outbound = Outbound::spawn(sink.clone(), 8, Duration::from_secs(1), move |e| {
            assert!(matches!(e, SinkError::Io(_)));
            flag.store(true, Ordering::SeqCst);
        });
        outbound.try_send(Bytes::from_static(b"x")).unwrap();
        settle().await;
        assert!(failed.load(Ordering::SeqCst));
        assert!(sink.is_closed());
        assert_eq!(
            outbound.try_send(Bytes::from_static(b"y")),
            Err(QueueError::Closed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_write_times_out() {
        let failed = Arc::new(AtomicBool::new(false));
        let flag = failed.clone();
        let outbound = Outbound::spawn(Arc::new(StuckSink), 2, Duration::from_millis(100), move |e| {
            assert!(matches!(e, SinkError::Timeout(_)));
            flag.store(true, Ordering::SeqCst);
        });
        outbound.try_send(Bytes::from_static(b"a")).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        settle().await;
        assert!(failed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_instead_of_blocking() {
        let outbound = Outbound::spawn(Arc::new(StuckSink), 1, Duration::from_secs(60), |_| {});
        // First frame is taken by the writer, second fills the queue.
        outbound.try_send(Bytes::from_static(b"a")).unwrap();
        settle().await;
        outbound.try_send(Bytes::from_static(b"b")).unwrap();
        assert_eq!(
            outbound.try_send(Bytes::from_static(b"c")),
            Err(QueueError::Full)
        );
    }
}
