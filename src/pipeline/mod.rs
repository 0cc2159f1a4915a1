//! The three-stage pipeline: reader → transform workers → ordered writer.
//!
//! ```text
//!  reader ──chunk──▶ WorkerScheduler ──block──▶ OrderedQueue ──▶ writer ──▶ output
//!    │   (queue-depth permit)   │  (order, sub_order)                │
//!    └────────── cancel flag, error list, progress counters ─────────┘
//! ```
//!
//! An [`Engine`] runs exactly one file-to-file job.  What a job does to each
//! chunk, and how the input is cut into chunks, is a [`ChunkStrategy`]:
//! [`Compression`] cuts fixed-size chunks and encodes each into a member,
//! [`Decompression`] scans for members and streams each back out in slices.

pub mod compress;
pub mod decompress;
mod progress;
mod run;

use std::fs::{self, File};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::info;

use crate::concurrent::{GatePermit, OrderedQueue, QueueError};
use crate::config::EngineOptions;
use crate::error::EngineError;
use crate::events::{
    CompletedCallback, Completion, CompletionStatus, ProgressCallback, ProgressEvent,
};

pub use compress::Compression;
pub use decompress::Decompression;
pub use progress::ProgressPolicy;

use run::RunState;

// ── Strategy seam ────────────────────────────────────────────────────────────

/// A contiguous byte range of the input, numbered densely in input order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub len:    u64,
    pub order:  u64,
}

impl Chunk {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// How a job cuts its input and what it does to each piece.
pub trait ChunkStrategy: Send + Sync + 'static {
    /// How stage fractions combine into the reported progress.
    fn progress_policy(&self) -> ProgressPolicy;

    /// Walk `input` (at `path`, `input_len` bytes long) and hand every chunk,
    /// in order and numbered from 0, to `emit`.  Stop as soon as `emit`
    /// breaks.  Runs on the reader thread with its own file handle.
    fn discover(
        &self,
        path:      &Path,
        input:     &mut File,
        input_len: u64,
        options:   &EngineOptions,
        emit:      &mut dyn FnMut(Chunk) -> ControlFlow<()>,
    ) -> Result<(), EngineError>;

    /// Transform the bytes of one chunk and push the result(s) into `sink`.
    /// Runs on a worker thread.
    fn transform(
        &self,
        chunk:   &Chunk,
        data:    &[u8],
        options: &EngineOptions,
        sink:    &mut BlockSink<'_>,
    ) -> Result<(), EngineError>;
}

// ── Transformed blocks ───────────────────────────────────────────────────────

/// Output bytes of one chunk, or one slice of them.
///
/// Every block of a chunk shares that chunk's queue-depth permit; the slot
/// frees once the last of them has been written or dropped.
pub(crate) struct TransformedBlock {
    pub(crate) data: Vec<u8>,
    _permit:         Arc<GatePermit>,
}

/// Where a transform puts its output.
///
/// Each `push` becomes the next sub-order of the chunk.  A transform that
/// knows which piece is its last can say so with [`push_last`](Self::push_last);
/// otherwise the chunk is closed after the transform returns.
pub struct BlockSink<'a> {
    queue:    &'a OrderedQueue<TransformedBlock>,
    order:    u64,
    next_sub: u32,
    closed:   bool,
    permit:   Arc<GatePermit>,
}

impl<'a> BlockSink<'a> {
    pub(crate) fn new(queue: &'a OrderedQueue<TransformedBlock>, order: u64, permit: Arc<GatePermit>) -> Self {
        BlockSink { queue, order, next_sub: 0, closed: false, permit }
    }

    pub fn push(&mut self, data: Vec<u8>) -> Result<(), QueueError> {
        self.insert(data, false)
    }

    pub fn push_last(&mut self, data: Vec<u8>) -> Result<(), QueueError> {
        self.insert(data, true)?;
        self.closed = true;
        Ok(())
    }

    fn insert(&mut self, data: Vec<u8>, is_last: bool) -> Result<(), QueueError> {
        let block = TransformedBlock { data, _permit: Arc::clone(&self.permit) };
        self.queue.enqueue(self.order, self.next_sub, block, is_last)?;
        self.next_sub += 1;
        Ok(())
    }

    /// Close the chunk if the transform did not.  A chunk that produced
    /// nothing still gets one empty block so the writer can move past it.
    pub(crate) fn finish(mut self) -> Result<(), QueueError> {
        if self.closed {
            return Ok(());
        }
        match self.next_sub {
            0 => self.push_last(Vec::new()),
            n => self.queue.set_last_sub_order(self.order, n - 1),
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// A single-use compression or decompression job.
pub struct Engine<S: ChunkStrategy> {
    strategy:     Arc<S>,
    options:      EngineOptions,
    cancel:       Arc<AtomicBool>,
    used:         AtomicBool,
    on_progress:  Option<ProgressCallback>,
    on_completed: Option<CompletedCallback>,
}

pub type Compressor   = Engine<Compression>;
pub type Decompressor = Engine<Decompression>;

impl Engine<Compression> {
    pub fn new(options: EngineOptions) -> Result<Self, EngineError> {
        Self::with_strategy(Compression, options)
    }
}

impl Engine<Decompression> {
    pub fn new(options: EngineOptions) -> Result<Self, EngineError> {
        Self::with_strategy(Decompression::default(), options)
    }
}

impl<S: ChunkStrategy> Engine<S> {
    /// Build an engine around any strategy.  Options are validated here so an
    /// invalid configuration never reaches a run.
    pub fn with_strategy(strategy: S, options: EngineOptions) -> Result<Self, EngineError> {
        options.validate()?;
        Ok(Engine {
            strategy:     Arc::new(strategy),
            options,
            cancel:       Arc::new(AtomicBool::new(false)),
            used:         AtomicBool::new(false),
            on_progress:  None,
            on_completed: None,
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn on_progress(mut self, f: impl Fn(ProgressEvent) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    pub fn on_completed(mut self, f: impl Fn(&Completion) + Send + Sync + 'static) -> Self {
        self.on_completed = Some(Arc::new(f));
        self
    }

    /// Request cooperative shutdown.  Idempotent, returns immediately.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Start the run and return at once.
    ///
    /// Fails synchronously if `input` does not exist or this engine has
    /// already run; everything else is reported through the completion.
    pub fn execute(&self, input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<RunHandle, EngineError> {
        let (input, output) = (input.as_ref(), output.as_ref());
        if self.used.load(Ordering::SeqCst) {
            return Err(EngineError::AlreadyUsed);
        }
        let meta = match fs::metadata(input) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Err(EngineError::InputNotFound(input.to_path_buf())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::InputNotFound(input.to_path_buf()));
            }
            Err(e) => return Err(EngineError::io(input, e)),
        };
        if self.used.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyUsed);
        }

        info!(
            input = %input.display(),
            output = %output.display(),
            bytes = meta.len(),
            workers = self.options.workers,
            "run started"
        );

        let run = Arc::new(RunState::new(self, input, output, meta.len())?);

        let reader = {
            let run = Arc::clone(&run);
            thread::Builder::new()
                .name("blockzip-reader".into())
                .spawn(move || run.read_stage())
                .map_err(|source| {
                    run_aborted(&self.cancel);
                    EngineError::Spawn { what: "reader", source }
                })?
        };
        let writer = {
            let run = Arc::clone(&run);
            thread::Builder::new()
                .name("blockzip-writer".into())
                .spawn(move || run.write_stage(reader))
                .map_err(|source| {
                    run_aborted(&self.cancel);
                    EngineError::Spawn { what: "writer", source }
                })?
        };

        Ok(RunHandle { writer, cancel: Arc::clone(&self.cancel) })
    }

    /// [`execute`](Self::execute) and wait for the completion.
    pub fn run(&self, input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<Completion, EngineError> {
        Ok(self.execute(input, output)?.wait())
    }
}

fn run_aborted(cancel: &AtomicBool) {
    cancel.store(true, Ordering::SeqCst);
}

/// A running job.
pub struct RunHandle {
    writer: JoinHandle<Completion>,
    cancel: Arc<AtomicBool>,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.writer.is_finished()
    }

    /// Block until every stage has stopped.
    pub fn wait(self) -> Completion {
        match self.writer.join() {
            Ok(completion) => completion,
            // Only a panicking completion observer gets here.
            Err(payload) => Completion {
                status:       CompletionStatus::Faulted,
                input_bytes:  0,
                output_bytes: 0,
                errors:       vec![EngineError::from_panic("writer", payload)],
            },
        }
    }
}
