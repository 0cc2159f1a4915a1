//! State and stage bodies of one run.
//!
//! A `RunState` lives for exactly one `execute` call and is shared by the
//! reader thread, every worker, and the writer thread.  The writer thread
//! owns the end of the run: once it stops writing it tears the other stages
//! down, decides the terminal status and sends the completion.

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

use super::progress::ProgressTracker;
use super::{BlockSink, Chunk, ChunkStrategy, Engine, TransformedBlock};
use crate::concurrent::{BoundedGate, GatePermit, OrderedQueue, WorkerScheduler};
use crate::config::EngineOptions;
use crate::error::EngineError;
use crate::events::{CompletedCallback, Completion, CompletionStatus};

pub(crate) struct RunState<S: ChunkStrategy> {
    strategy:      Arc<S>,
    options:       EngineOptions,
    input:         PathBuf,
    output:        PathBuf,
    input_len:     u64,

    cancel:        Arc<AtomicBool>,
    reading:       AtomicBool,
    errors:        Mutex<Vec<EngineError>>,

    scheduler:     WorkerScheduler,
    queue_gate:    Arc<BoundedGate>,
    queue:         OrderedQueue<TransformedBlock>,

    progress:      ProgressTracker,
    bytes_written: AtomicU64,
    on_completed:  Option<CompletedCallback>,
}

/// Clears the reading flag however the reader stage ends.
struct ReadingDone<'a>(&'a AtomicBool);

impl Drop for ReadingDone<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<S: ChunkStrategy> RunState<S> {
    pub(crate) fn new(engine: &Engine<S>, input: &Path, output: &Path, input_len: u64) -> Result<Self, EngineError> {
        let options = engine.options.clone();
        Ok(RunState {
            strategy:      Arc::clone(&engine.strategy),
            scheduler:     WorkerScheduler::new(options.worker_limit()?),
            queue_gate:    Arc::new(BoundedGate::new(options.queue_depth_limit()?)),
            queue:         OrderedQueue::new(),
            progress:      ProgressTracker::new(
                engine.strategy.progress_policy(),
                input_len,
                engine.on_progress.clone(),
            ),
            input:         input.to_path_buf(),
            output:        output.to_path_buf(),
            input_len,
            cancel:        Arc::clone(&engine.cancel),
            // Set before any stage starts so the writer never sees a reader
            // that has "finished" before it began.
            reading:       AtomicBool::new(true),
            errors:        Mutex::new(Vec::new()),
            bytes_written: AtomicU64::new(0),
            on_completed:  engine.on_completed.clone(),
            options,
        })
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Record `err` and stop the run.
    fn fail(&self, err: EngineError) {
        error!(error = %err, "run failed");
        self.errors.lock().push(err);
        self.cancel.store(true, Ordering::SeqCst);
    }

    // ── Reader stage ─────────────────────────────────────────────────────────

    pub(crate) fn read_stage(self: Arc<Self>) {
        let _done = ReadingDone(&self.reading);
        match panic::catch_unwind(AssertUnwindSafe(|| self.discover())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.fail(e),
            Err(payload) => self.fail(EngineError::from_panic("reader", payload)),
        }
    }

    fn discover(self: &Arc<Self>) -> Result<(), EngineError> {
        let mut file = File::open(&self.input).map_err(|e| EngineError::io(&self.input, e))?;
        let poll = self.options.poll_interval();
        let mut submit_error = None;

        self.strategy.discover(&self.input, &mut file, self.input_len, &self.options, &mut |chunk: Chunk| {
            if self.is_cancelled() {
                return ControlFlow::Break(());
            }
            self.progress.chunk_discovered(chunk.end());

            let Some(permit) = self.queue_gate.permit_unless(&self.cancel, poll) else {
                return ControlFlow::Break(());
            };
            let run = Arc::clone(self);
            let permit = Arc::new(permit);
            debug!(order = chunk.order, offset = chunk.offset, len = chunk.len, "chunk submitted");
            match self.scheduler.submit(move || run.transform_stage(chunk, permit)) {
                Ok(()) => ControlFlow::Continue(()),
                Err(source) => {
                    submit_error = Some(EngineError::Spawn { what: "worker", source });
                    ControlFlow::Break(())
                }
            }
        })?;

        submit_error.map_or(Ok(()), Err)
    }

    // ── Transform stage ──────────────────────────────────────────────────────

    fn transform_stage(&self, chunk: Chunk, permit: Arc<GatePermit>) {
        match panic::catch_unwind(AssertUnwindSafe(|| self.transform(&chunk, permit))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.fail(e),
            Err(payload) => self.fail(EngineError::from_panic("worker", payload)),
        }
    }

    fn transform(&self, chunk: &Chunk, permit: Arc<GatePermit>) -> Result<(), EngineError> {
        if self.is_cancelled() {
            return Ok(());
        }
        let data = read_range(&self.input, chunk).map_err(|e| EngineError::io(&self.input, e))?;
        let mut sink = BlockSink::new(&self.queue, chunk.order, permit);
        self.strategy.transform(chunk, &data, &self.options, &mut sink)?;
        sink.finish()?;
        self.progress.chunk_transformed();
        Ok(())
    }

    // ── Writer stage ─────────────────────────────────────────────────────────

    pub(crate) fn write_stage(self: Arc<Self>, reader: JoinHandle<()>) -> Completion {
        match panic::catch_unwind(AssertUnwindSafe(|| self.drain())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.fail(e),
            Err(payload) => self.fail(EngineError::from_panic("writer", payload)),
        }
        self.complete(reader)
    }

    /// Write blocks in order until every producer is done and the queue is
    /// empty, or until the run is cancelled.
    fn drain(&self) -> Result<(), EngineError> {
        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.output)
            .map_err(|e| EngineError::io(&self.output, e))?;
        let poll = self.options.poll_interval();

        loop {
            if self.is_cancelled() {
                return Ok(());
            }
            if let Some(block) = self.queue.try_dequeue() {
                self.write_block(&mut out, block)?;
                continue;
            }

            // Reader first: once it is done, every chunk already holds a
            // worker slot or has finished.
            let producing = self.reading.load(Ordering::SeqCst) || self.scheduler.active_count() > 0;
            if producing {
                thread::sleep(poll);
                continue;
            }
            if let Some(block) = self.queue.try_dequeue() {
                self.write_block(&mut out, block)?;
                continue;
            }
            if self.queue.is_empty() || self.is_cancelled() {
                return Ok(());
            }
            let (order, sub_order) = self.queue.cursor();
            return Err(EngineError::Stalled { order, sub_order });
        }
    }

    fn write_block(&self, out: &mut File, block: TransformedBlock) -> Result<(), EngineError> {
        out.write_all(&block.data)
            .and_then(|()| out.flush())
            .map_err(|e| EngineError::io(&self.output, e))?;
        self.bytes_written.fetch_add(block.data.len() as u64, Ordering::Relaxed);
        drop(block);
        self.progress.chunks_written(self.queue.completed_orders());
        self.progress.report();
        Ok(())
    }

    // ── Completion ───────────────────────────────────────────────────────────

    fn complete(&self, reader: JoinHandle<()>) -> Completion {
        // Dropping buffered blocks frees their queue-depth permits, so a
        // reader waiting for one can see the cancel flag and leave.
        self.queue.clear();
        if let Err(payload) = reader.join() {
            self.fail(EngineError::from_panic("reader", payload));
        }
        self.scheduler.join_all();
        self.queue.clear();

        let mut errors = std::mem::take(&mut *self.errors.lock());
        let mut status = if !errors.is_empty() {
            CompletionStatus::Faulted
        } else if self.is_cancelled() {
            CompletionStatus::Cancelled
        } else {
            CompletionStatus::Succeeded
        };

        if status != CompletionStatus::Succeeded {
            match fs::remove_file(&self.output) {
                Ok(()) => debug!(output = %self.output.display(), "partial output removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    error!(output = %self.output.display(), error = %e, "could not remove partial output");
                    errors.push(EngineError::io(&self.output, e));
                    status = CompletionStatus::Faulted;
                }
            }
        }

        let completion = if status == CompletionStatus::Succeeded {
            self.progress.finish();
            Completion {
                status,
                input_bytes:  self.input_len,
                output_bytes: self.bytes_written.load(Ordering::SeqCst),
                errors,
            }
        } else {
            Completion { status, input_bytes: 0, output_bytes: 0, errors }
        };

        info!(
            status = %completion.status,
            input_bytes = completion.input_bytes,
            output_bytes = completion.output_bytes,
            errors = completion.errors.len(),
            "run completed"
        );
        if let Some(cb) = &self.on_completed {
            cb(&completion);
        }
        completion
    }
}

/// Read one chunk through a handle of its own.
fn read_range(path: &Path, chunk: &Chunk) -> io::Result<Vec<u8>> {
    let len = usize::try_from(chunk.len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "chunk does not fit in memory"))?;
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(chunk.offset))?;
    let mut data = vec![0u8; len];
    file.read_exact(&mut data)?;
    Ok(data)
}
