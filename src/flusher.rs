//! Background flushing of filled memory segments.
//!
//! A [`Flusher`] owns one worker thread. Segments submitted to it are moved to
//! the worker, so the insert path never waits on segment I/O, and a submitted
//! segment can no longer receive inserts.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::error::{PilumError, Result};
use crate::meta::SeqNumber;
use crate::segment::{FlushReport, MemSegment};

struct FlushTask {
    segment: MemSegment,
    wal_lsn: SeqNumber,
}

/// Result of one background flush.
#[derive(Debug)]
pub enum FlushOutcome {
    Flushed(FlushReport),
    /// The flush failed. The segment is handed back so the caller can retry
    /// or discard it.
    Failed {
        segment: Box<MemSegment>,
        error: PilumError,
    },
}

impl FlushOutcome {
    pub fn is_flushed(&self) -> bool {
        matches!(self, FlushOutcome::Flushed(_))
    }
}

#[derive(Debug)]
pub struct Flusher {
    task_sender: Option<Sender<FlushTask>>,
    result_receiver: Receiver<FlushOutcome>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Flusher {
    /// Start the worker thread.
    pub fn start() -> Result<Self> {
        let (task_sender, task_receiver) = unbounded::<FlushTask>();
        let (result_sender, result_receiver) = unbounded();

        let worker = thread::Builder::new()
            .name("pilum-flusher".to_string())
            .spawn(move || run_worker(task_receiver, result_sender))?;

        Ok(Self {
            task_sender: Some(task_sender),
            result_receiver,
            worker: Some(worker),
        })
    }

    /// Queue `segment` to be flushed with `wal_lsn`.
    pub fn submit(&self, segment: MemSegment, wal_lsn: SeqNumber) -> Result<()> {
        let sender = self
            .task_sender
            .as_ref()
            .ok_or_else(|| PilumError::invalid_operation("flusher is shut down"))?;
        sender
            .send(FlushTask { segment, wal_lsn })
            .map_err(|_| PilumError::other("flusher worker has stopped"))
    }

    /// Outcomes available now, without blocking.
    pub fn results(&self) -> Vec<FlushOutcome> {
        self.result_receiver.try_iter().collect()
    }

    /// Wait up to `timeout` for the next outcome.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<FlushOutcome> {
        self.result_receiver.recv_timeout(timeout).ok()
    }

    /// Flush everything already submitted, stop the worker and return the
    /// outcomes not collected yet.
    pub fn shutdown(mut self) -> Result<Vec<FlushOutcome>> {
        self.stop()?;
        Ok(self.result_receiver.try_iter().collect())
    }

    fn stop(&mut self) -> Result<()> {
        // Closing the task channel ends the worker loop once the queue is drained.
        self.task_sender.take();
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| PilumError::other("flusher worker panicked"))?;
        }
        Ok(())
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("Failed to stop flusher: {err}");
        }
    }
}

fn run_worker(tasks: Receiver<FlushTask>, results: Sender<FlushOutcome>) {
    log::debug!("Flusher worker started");
    for FlushTask {
        mut segment,
        wal_lsn,
    } in tasks.iter()
    {
        let outcome = match segment.flush(wal_lsn) {
            Ok(report) => FlushOutcome::Flushed(report),
            Err(error) => {
                log::warn!(
                    "Background flush of segment {} failed: {error}",
                    segment.segment_id()
                );
                FlushOutcome::Failed {
                    segment: Box::new(segment),
                    error,
                }
            }
        };
        if results.send(outcome).is_err() {
            log::warn!("Flusher result receiver dropped, stopping worker");
            break;
        }
    }
    log::debug!("Flusher worker stopped");
}
