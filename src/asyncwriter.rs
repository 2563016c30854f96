//! Per-reader async writer
//!
//! Bounded FIFO of deferred write jobs plus a single worker task. This is
//! what keeps the fan-out writer non-blocking: a slow reader overflows its
//! own queue and is reaped, while the publisher never waits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// A deferred write job. Returning an error stops the worker.
pub type WriteJob = Box<dyn FnOnce() -> Result<()> + Send>;

/// Bounded queue of write jobs with a dedicated worker task.
pub struct AsyncWriter {
    size: usize,
    tx: mpsc::Sender<WriteJob>,
    rx: Option<mpsc::Receiver<WriteJob>>,
    stopped: Arc<AtomicBool>,
    err_tx: mpsc::Sender<Error>,
    err_rx: mpsc::Receiver<Error>,
    worker: Option<JoinHandle<()>>,
}

impl AsyncWriter {
    pub fn new(size: usize) -> Self {
        let (tx, rx) = mpsc::channel(size.max(1));
        let (err_tx, err_rx) = mpsc::channel(1);

        Self {
            size,
            tx,
            rx: Some(rx),
            stopped: Arc::new(AtomicBool::new(false)),
            err_tx,
            err_rx,
            worker: None,
        }
    }

    /// Queue capacity, as configured at admission.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Enqueue a job without blocking.
    ///
    /// Returns `false` when the queue is full or the worker has stopped; the
    /// caller must then treat the reader as overrun.
    pub fn push(&self, job: WriteJob) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        self.tx.try_send(job).is_ok()
    }

    /// Start the worker task. Must be called exactly once.
    pub fn start(&mut self) {
        let mut rx = self.rx.take().expect("writer already started");
        let stopped = Arc::clone(&self.stopped);
        let err_tx = self.err_tx.clone();

        self.worker = Some(tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(err) = job() {
                    stopped.store(true, Ordering::Release);
                    let _ = err_tx.try_send(err);
                    return;
                }
            }
        }));
    }

    /// Receive the worker's terminal error, if any.
    pub async fn error(&mut self) -> Error {
        match self.err_rx.recv().await {
            Some(err) => err,
            None => Error::Terminated,
        }
    }

    /// Stop the worker, discarding pending jobs.
    pub async fn stop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            worker.abort();
            let _ = worker.await;
        }
    }
}

/// Cloneable enqueue-side handle, given to stream callbacks.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriteJob>,
    stopped: Arc<AtomicBool>,
    err_tx: mpsc::Sender<Error>,
    size: usize,
}

impl WriterHandle {
    /// Enqueue a job; on overflow, report `ReaderOverflow` on the error
    /// channel so the owning session terminates the reader.
    pub fn push(&self, job: WriteJob) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if self.tx.try_send(job).is_err() {
            self.stopped.store(true, Ordering::Release);
            let _ = self.err_tx.try_send(Error::ReaderOverflow(self.size));
        }
    }
}

impl AsyncWriter {
    /// Handle for producers that must never block.
    pub fn handle(&self) -> WriterHandle {
        WriterHandle {
            tx: self.tx.clone(),
            stopped: Arc::clone(&self.stopped),
            err_tx: self.err_tx.clone(),
            size: self.size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_jobs_run_in_order() {
        let mut w = AsyncWriter::new(16);
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..5 {
            let log = Arc::clone(&log);
            assert!(w.push(Box::new(move || {
                log.lock().unwrap().push(i);
                Ok(())
            })));
        }

        w.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        w.stop().await;
    }

    #[tokio::test]
    async fn test_push_overflow_returns_false() {
        let w = AsyncWriter::new(2);

        assert!(w.push(Box::new(|| Ok(()))));
        assert!(w.push(Box::new(|| Ok(()))));
        assert!(!w.push(Box::new(|| Ok(()))));
    }

    #[tokio::test]
    async fn test_job_error_stops_worker() {
        let mut w = AsyncWriter::new(16);
        let ran = Arc::new(AtomicUsize::new(0));

        w.push(Box::new(|| Err(Error::Write("disk full".into()))));
        let ran2 = Arc::clone(&ran);
        w.push(Box::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        w.start();
        let err = w.error().await;
        assert!(matches!(err, Error::Write(_)));

        // worker stopped before the second job
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        // and pushes are rejected from now on
        assert!(!w.push(Box::new(|| Ok(()))));

        w.stop().await;
    }

    #[tokio::test]
    async fn test_handle_overflow_reports_error() {
        let mut w = AsyncWriter::new(1);
        let handle = w.handle();

        // worker not started: first job sits in the queue, second overflows
        handle.push(Box::new(|| Ok(())));
        handle.push(Box::new(|| Ok(())));

        let err = w.error().await;
        assert!(matches!(err, Error::ReaderOverflow(1)));
    }

    #[tokio::test]
    async fn test_stop_discards_pending() {
        let mut w = AsyncWriter::new(16);
        let ran = Arc::new(AtomicUsize::new(0));

        let ran2 = Arc::clone(&ran);
        w.push(Box::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        // never started; stop drains without executing
        w.stop().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!w.push(Box::new(|| Ok(()))));
    }
}
