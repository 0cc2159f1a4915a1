use blockzip::codec::CodecError;
use blockzip::member::{FrameError, MEMBER_HEADER_SIZE};
use blockzip::scanner::{BoundaryScanner, PatternScanner};
use blockzip::{
    BlockSink, Chunk, ChunkStrategy, CodecId, CompletionStatus, Compression, Compressor,
    Decompression, Decompressor, Engine, EngineError, EngineOptions, ProgressPolicy,
};
use std::fs::{self, File};
use std::io::{self, Read, Seek};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn small_options() -> EngineOptions {
    EngineOptions {
        chunk_size:        4096,
        workers:           4,
        max_queue_depth:   3,
        output_slice_size: 1000,
        poll_interval_ms:  1,
        ..EngineOptions::default()
    }
}

/// Half noise, half repeated text, so every codec has something to chew on.
fn sample(len: usize, seed: u64) -> Vec<u8> {
    let mut x = seed;
    (0..len)
        .map(|i| {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            if i % 2 == 0 { (x >> 56) as u8 } else { b"blockzip "[i % 9] }
        })
        .collect()
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Workspace { dir: TempDir::new().unwrap() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn file(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.path(name);
        fs::write(&path, data).unwrap();
        path
    }
}

fn roundtrip(data: &[u8], options: EngineOptions) {
    let ws = Workspace::new();
    let input = ws.file("input.bin", data);
    let packed = ws.path("input.bz");
    let restored = ws.path("restored.bin");

    let done = Compressor::new(options.clone()).unwrap().run(&input, &packed).unwrap();
    assert_eq!(done.status, CompletionStatus::Succeeded, "{:?}", done.errors);
    assert_eq!(done.input_bytes, data.len() as u64);
    assert_eq!(done.output_bytes, fs::metadata(&packed).unwrap().len());

    let done = Decompressor::new(options).unwrap().run(&packed, &restored).unwrap();
    assert_eq!(done.status, CompletionStatus::Succeeded, "{:?}", done.errors);
    assert_eq!(done.output_bytes, data.len() as u64);
    assert_eq!(fs::read(&restored).unwrap(), data);
}

// ── Round trips ──────────────────────────────────────────────────────────────

#[test]
fn test_roundtrip_empty_input() {
    roundtrip(&[], small_options());
}

#[test]
fn test_roundtrip_smaller_than_one_chunk() {
    roundtrip(b"just a few bytes", small_options());
}

#[test]
fn test_roundtrip_many_chunks() {
    roundtrip(&sample(100_000, 1), small_options());
    // Exact multiple of the chunk size.
    roundtrip(&sample(4096 * 5, 2), small_options());
}

#[test]
fn test_roundtrip_every_codec() {
    let data = sample(30_000, 3);
    for codec in CodecId::ALL {
        roundtrip(&data, EngineOptions { codec, ..small_options() });
    }
}

#[test]
fn test_roundtrip_with_single_worker_and_depth() {
    let options = EngineOptions { workers: 1, max_queue_depth: 1, ..small_options() };
    roundtrip(&sample(50_000, 4), options);
}

#[test]
fn test_roundtrip_many_slices_per_member() {
    // Each 64 KiB member decodes into 64+ sub-ordered slices.
    let options = EngineOptions { chunk_size: 64 * 1024, output_slice_size: 1024, ..small_options() };
    roundtrip(&sample(300_000, 5), options);
}

#[test]
fn test_concatenated_outputs_decompress_as_one() {
    let ws = Workspace::new();
    let (a, b) = (sample(9_000, 6), sample(5_000, 7));
    let (pa, pb) = (ws.path("a.bz"), ws.path("b.bz"));
    Compressor::new(small_options()).unwrap().run(ws.file("a", &a), &pa).unwrap();
    Compressor::new(small_options()).unwrap().run(ws.file("b", &b), &pb).unwrap();

    let mut joined = fs::read(&pa).unwrap();
    joined.extend(fs::read(&pb).unwrap());
    let joined = ws.file("joined.bz", &joined);

    let out = ws.path("joined.bin");
    let done = Decompressor::new(small_options()).unwrap().run(&joined, &out).unwrap();
    assert!(done.is_success(), "{:?}", done.errors);
    assert_eq!(fs::read(out).unwrap(), [a, b].concat());
}

// ── Notifications ────────────────────────────────────────────────────────────

#[test]
fn test_progress_is_monotonic_and_ends_at_one() {
    let ws = Workspace::new();
    let input = ws.file("input.bin", &sample(60_000, 8));

    for compress in [true, false] {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let completions = Arc::new(AtomicUsize::new(0));
        let (s, c) = (Arc::clone(&seen), Arc::clone(&completions));

        let (src, dst) = if compress {
            (input.clone(), ws.path("p.bz"))
        } else {
            (ws.path("p.bz"), ws.path("p.bin"))
        };
        let done = if compress {
            Compressor::new(small_options())
                .unwrap()
                .on_progress(move |e| s.lock().unwrap().push(e.percentage))
                .on_completed(move |_| { c.fetch_add(1, Ordering::SeqCst); })
                .run(&src, &dst)
                .unwrap()
        } else {
            Decompressor::new(small_options())
                .unwrap()
                .on_progress(move |e| s.lock().unwrap().push(e.percentage))
                .on_completed(move |_| { c.fetch_add(1, Ordering::SeqCst); })
                .run(&src, &dst)
                .unwrap()
        };
        assert!(done.is_success());
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {seen:?}");
        assert!(seen.iter().all(|p| (0.0..=1.0).contains(p)));
        assert_eq!(*seen.last().unwrap(), 1.0);
    }
}

#[test]
fn test_empty_input_still_reports_full_progress() {
    let ws = Workspace::new();
    let last = Arc::new(Mutex::new(None));
    let l = Arc::clone(&last);
    let done = Compressor::new(small_options())
        .unwrap()
        .on_progress(move |e| *l.lock().unwrap() = Some(e.percentage))
        .run(ws.file("empty", &[]), ws.path("empty.bz"))
        .unwrap();
    assert!(done.is_success());
    assert_eq!(*last.lock().unwrap(), Some(1.0));
    assert_eq!(fs::metadata(ws.path("empty.bz")).unwrap().len(), 0);
}

// ── Synchronous rejections ───────────────────────────────────────────────────

#[test]
fn test_missing_input_is_rejected_up_front() {
    let ws = Workspace::new();
    let engine = Compressor::new(small_options()).unwrap();
    let err = engine.execute(ws.path("nope"), ws.path("out")).err().unwrap();
    assert!(matches!(err, EngineError::InputNotFound(_)));
    assert!(!ws.path("out").exists());

    // A failed start does not use the engine up.
    let input = ws.file("real", b"data");
    assert!(engine.run(&input, ws.path("out")).unwrap().is_success());
}

#[test]
fn test_engine_runs_only_once() {
    let ws = Workspace::new();
    let input = ws.file("input", b"data");
    let engine = Compressor::new(small_options()).unwrap();
    engine.run(&input, ws.path("one")).unwrap();
    assert!(matches!(engine.execute(&input, ws.path("two")), Err(EngineError::AlreadyUsed)));
}

#[test]
fn test_invalid_options_are_rejected() {
    for options in [
        EngineOptions { workers: 0, ..small_options() },
        EngineOptions { chunk_size: 0, ..small_options() },
        EngineOptions { max_queue_depth: 0, ..small_options() },
    ] {
        assert!(matches!(Compressor::new(options.clone()), Err(EngineError::Config(_))));
        assert!(matches!(Decompressor::new(options), Err(EngineError::Config(_))));
    }
}

// ── Faults ───────────────────────────────────────────────────────────────────

/// Compression that misbehaves on one chunk.
struct Faulty {
    bad_order: u64,
    panic:     bool,
}

impl ChunkStrategy for Faulty {
    fn progress_policy(&self) -> ProgressPolicy {
        ProgressPolicy::Mean
    }

    fn discover(
        &self,
        path:      &Path,
        input:     &mut File,
        input_len: u64,
        options:   &EngineOptions,
        emit:      &mut dyn FnMut(Chunk) -> ControlFlow<()>,
    ) -> Result<(), EngineError> {
        Compression.discover(path, input, input_len, options, emit)
    }

    fn transform(
        &self,
        chunk:   &Chunk,
        data:    &[u8],
        options: &EngineOptions,
        sink:    &mut BlockSink<'_>,
    ) -> Result<(), EngineError> {
        if chunk.order == self.bad_order {
            if self.panic {
                panic!("chunk {} blew up", chunk.order);
            }
            return Err(CodecError::Compression { codec: CodecId::Zstd, message: "synthetic failure".into() }.into());
        }
        Compression.transform(chunk, data, options, sink)
    }
}

#[test]
fn test_failing_chunk_faults_the_run_and_removes_output() {
    let ws = Workspace::new();
    let input = ws.file("input", &sample(40_000, 9));
    let out = ws.path("out.bz");

    let done = Engine::with_strategy(Faulty { bad_order: 3, panic: false }, small_options())
        .unwrap()
        .run(&input, &out)
        .unwrap();
    assert_eq!(done.status, CompletionStatus::Faulted);
    assert!(done
        .errors
        .iter()
        .any(|e| matches!(e, EngineError::Codec(CodecError::Compression { message, .. }) if message == "synthetic failure")));
    assert!(!out.exists());
}

#[test]
fn test_panicking_chunk_is_recorded() {
    let ws = Workspace::new();
    let input = ws.file("input", &sample(40_000, 10));
    let out = ws.path("out.bz");

    let done = Engine::with_strategy(Faulty { bad_order: 0, panic: true }, small_options())
        .unwrap()
        .run(&input, &out)
        .unwrap();
    assert_eq!(done.status, CompletionStatus::Faulted);
    assert!(done
        .errors
        .iter()
        .any(|e| matches!(e, EngineError::Panic { stage: "worker", message } if message == "chunk 0 blew up")));
    assert!(!out.exists());
}

#[test]
fn test_corrupted_member_faults_decompression() {
    let ws = Workspace::new();
    let input = ws.file("input", &sample(20_000, 11));
    let packed = ws.path("packed.bz");
    let opts = EngineOptions { codec: CodecId::None, ..small_options() };
    Compressor::new(opts.clone()).unwrap().run(&input, &packed).unwrap();

    let mut bytes = fs::read(&packed).unwrap();
    // Inside the first member's payload: past the 32-byte header.
    bytes[100] ^= 0xFF;
    fs::write(&packed, &bytes).unwrap();

    let out = ws.path("out.bin");
    let done = Decompressor::new(opts).unwrap().run(&packed, &out).unwrap();
    assert_eq!(done.status, CompletionStatus::Faulted);
    assert!(done
        .errors
        .iter()
        .any(|e| matches!(e, EngineError::Frame(FrameError::PayloadChecksum { offset: 0 }))));
    assert!(!out.exists());
}

#[test]
fn test_damaged_member_header_faults_decompression() {
    let ws = Workspace::new();
    let data = sample(12_000, 14);
    let input = ws.file("input", &data);
    let packed = ws.path("packed.bz");
    let opts = EngineOptions { codec: CodecId::None, ..small_options() };
    let done = Compressor::new(opts.clone()).unwrap().run(&input, &packed).unwrap();
    assert!(done.is_success(), "{:?}", done.errors);

    // Stored members are header + 4096 bytes; hit the second one's header.
    let second = (MEMBER_HEADER_SIZE + 4096) as u64;
    let mut bytes = fs::read(&packed).unwrap();
    bytes[second as usize + 10] ^= 0xFF;
    fs::write(&packed, &bytes).unwrap();

    let out = ws.path("out.bin");
    let done = Decompressor::new(opts).unwrap().run(&packed, &out).unwrap();
    assert_eq!(done.status, CompletionStatus::Faulted);
    assert!(done
        .errors
        .iter()
        .any(|e| matches!(e, EngineError::Frame(FrameError::Gap { offset, bytes }) if *offset == second && *bytes == second)));
    assert!(!out.exists());
}

#[test]
fn test_trailing_garbage_faults_decompression() {
    let ws = Workspace::new();
    let input = ws.file("input", &sample(9_000, 15));
    let packed = ws.path("packed.bz");
    Compressor::new(small_options()).unwrap().run(&input, &packed).unwrap();

    let mut bytes = fs::read(&packed).unwrap();
    let end = bytes.len() as u64;
    bytes.extend_from_slice(b"appended later");
    fs::write(&packed, &bytes).unwrap();

    let out = ws.path("out.bin");
    let done = Decompressor::new(small_options()).unwrap().run(&packed, &out).unwrap();
    assert_eq!(done.status, CompletionStatus::Faulted);
    assert!(done
        .errors
        .iter()
        .any(|e| matches!(e, EngineError::Frame(FrameError::Gap { offset, bytes: 14 }) if *offset == end)));
    assert!(!out.exists());
}

#[test]
fn test_plain_file_is_not_an_archive() {
    let ws = Workspace::new();
    let input = ws.file("plain.txt", b"this was never compressed");
    let out = ws.path("out");
    let done = Decompressor::new(small_options()).unwrap().run(&input, &out).unwrap();
    assert_eq!(done.status, CompletionStatus::Faulted);
    assert!(matches!(done.errors.as_slice(), [EngineError::NoMembers(_)]));
    assert!(!out.exists());
}

// ── Backpressure ─────────────────────────────────────────────────────────────

/// Compression whose first chunk is slow.  Until it finishes nothing can be
/// written, so every chunk started meanwhile is transformed but unwritten.
struct SlowHead {
    started:   Arc<AtomicUsize>,
    peak:      Arc<AtomicUsize>,
    head_done: Arc<AtomicBool>,
}

impl ChunkStrategy for SlowHead {
    fn progress_policy(&self) -> ProgressPolicy {
        ProgressPolicy::Mean
    }

    fn discover(
        &self,
        path:      &Path,
        input:     &mut File,
        input_len: u64,
        options:   &EngineOptions,
        emit:      &mut dyn FnMut(Chunk) -> ControlFlow<()>,
    ) -> Result<(), EngineError> {
        Compression.discover(path, input, input_len, options, emit)
    }

    fn transform(
        &self,
        chunk:   &Chunk,
        data:    &[u8],
        options: &EngineOptions,
        sink:    &mut BlockSink<'_>,
    ) -> Result<(), EngineError> {
        let started = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.head_done.load(Ordering::SeqCst) {
            self.peak.fetch_max(started, Ordering::SeqCst);
        }
        if chunk.order == 0 {
            thread::sleep(Duration::from_millis(150));
            self.peak.fetch_max(self.started.load(Ordering::SeqCst), Ordering::SeqCst);
            self.head_done.store(true, Ordering::SeqCst);
        }
        Compression.transform(chunk, data, options, sink)
    }
}

#[test]
fn test_queue_depth_caps_unwritten_chunks() {
    let ws = Workspace::new();
    let data = sample(4096 * 16, 16);
    let input = ws.file("input", &data);
    let packed = ws.path("packed.bz");
    let peak = Arc::new(AtomicUsize::new(0));
    let strategy = SlowHead {
        started:   Arc::new(AtomicUsize::new(0)),
        peak:      Arc::clone(&peak),
        head_done: Arc::new(AtomicBool::new(false)),
    };
    let opts = EngineOptions { workers: 8, max_queue_depth: 2, ..small_options() };

    let done = Engine::with_strategy(strategy, opts.clone()).unwrap().run(&input, &packed).unwrap();
    assert!(done.is_success(), "{:?}", done.errors);
    let peak = peak.load(Ordering::SeqCst);
    assert!((1..=opts.max_queue_depth).contains(&peak), "{peak} chunks waited on the writer");

    let restored = ws.path("restored.bin");
    assert!(Decompressor::new(opts).unwrap().run(&packed, &restored).unwrap().is_success());
    assert_eq!(fs::read(restored).unwrap(), data);
}

// ── Custom scanners ──────────────────────────────────────────────────────────

/// Pattern search that counts how often discovery asks for a boundary.
struct CountingScanner {
    calls: Arc<AtomicUsize>,
}

impl BoundaryScanner for CountingScanner {
    fn next_member_offset<R: Read + Seek>(
        &self,
        stream:           &mut R,
        pattern:          &[u8],
        read_buffer_size: usize,
    ) -> io::Result<Option<u64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        PatternScanner.next_member_offset(stream, pattern, read_buffer_size)
    }
}

#[test]
fn test_decompression_with_custom_scanner() {
    let ws = Workspace::new();
    let data = sample(12_000, 17);
    let input = ws.file("input", &data);
    let packed = ws.path("packed.bz");
    Compressor::new(small_options()).unwrap().run(&input, &packed).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let strategy = Decompression::with_scanner(CountingScanner { calls: Arc::clone(&calls) });
    let out = ws.path("out.bin");
    let done = Engine::with_strategy(strategy, small_options()).unwrap().run(&packed, &out).unwrap();
    assert!(done.is_success(), "{:?}", done.errors);
    assert_eq!(fs::read(out).unwrap(), data);
    // One lookup per member (three chunks of 4096) plus the one that hits EOF.
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Compression whose workers hold until released.
struct Held {
    released: Arc<AtomicBool>,
}

impl ChunkStrategy for Held {
    fn progress_policy(&self) -> ProgressPolicy {
        ProgressPolicy::Mean
    }

    fn discover(
        &self,
        path:      &Path,
        input:     &mut File,
        input_len: u64,
        options:   &EngineOptions,
        emit:      &mut dyn FnMut(Chunk) -> ControlFlow<()>,
    ) -> Result<(), EngineError> {
        Compression.discover(path, input, input_len, options, emit)
    }

    fn transform(
        &self,
        chunk:   &Chunk,
        data:    &[u8],
        options: &EngineOptions,
        sink:    &mut BlockSink<'_>,
    ) -> Result<(), EngineError> {
        while !self.released.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        Compression.transform(chunk, data, options, sink)
    }
}

#[test]
fn test_cancel_mid_run_leaves_no_output() {
    let ws = Workspace::new();
    let input = ws.file("input", &sample(64_000, 12));
    let out = ws.path("out.bz");
    let released = Arc::new(AtomicBool::new(false));

    let engine = Engine::with_strategy(Held { released: Arc::clone(&released) }, small_options()).unwrap();
    let handle = engine.execute(&input, &out).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(!handle.is_finished());
    handle.cancel();
    released.store(true, Ordering::SeqCst);

    let done = handle.wait();
    assert_eq!(done.status, CompletionStatus::Cancelled);
    assert!(done.errors.is_empty());
    assert!(!out.exists());
}

/// Decompression whose workers hold until released.
struct HeldDecompression {
    inner:    Decompression,
    released: Arc<AtomicBool>,
}

impl ChunkStrategy for HeldDecompression {
    fn progress_policy(&self) -> ProgressPolicy {
        self.inner.progress_policy()
    }

    fn discover(
        &self,
        path:      &Path,
        input:     &mut File,
        input_len: u64,
        options:   &EngineOptions,
        emit:      &mut dyn FnMut(Chunk) -> ControlFlow<()>,
    ) -> Result<(), EngineError> {
        self.inner.discover(path, input, input_len, options, emit)
    }

    fn transform(
        &self,
        chunk:   &Chunk,
        data:    &[u8],
        options: &EngineOptions,
        sink:    &mut BlockSink<'_>,
    ) -> Result<(), EngineError> {
        while !self.released.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        self.inner.transform(chunk, data, options, sink)
    }
}

#[test]
fn test_cancel_mid_decompression_leaves_no_output() {
    let ws = Workspace::new();
    let input = ws.file("input", &sample(64_000, 18));
    let packed = ws.path("packed.bz");
    Compressor::new(small_options()).unwrap().run(&input, &packed).unwrap();

    let out = ws.path("out.bin");
    let released = Arc::new(AtomicBool::new(false));
    let strategy = HeldDecompression {
        inner:    Decompression::with_scanner(PatternScanner),
        released: Arc::clone(&released),
    };
    let handle = Engine::with_strategy(strategy, small_options()).unwrap().execute(&packed, &out).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(!handle.is_finished());
    handle.cancel();
    released.store(true, Ordering::SeqCst);

    let done = handle.wait();
    assert_eq!(done.status, CompletionStatus::Cancelled);
    assert!(done.errors.is_empty());
    assert!(!out.exists());
}

#[test]
fn test_cancel_before_execute() {
    let ws = Workspace::new();
    let input = ws.file("input", &sample(10_000, 13));
    let out = ws.path("out.bz");

    let engine = Compressor::new(small_options()).unwrap();
    engine.cancel();
    engine.cancel();
    let done = engine.run(&input, &out).unwrap();
    assert_eq!(done.status, CompletionStatus::Cancelled);
    assert!(!out.exists());
}
