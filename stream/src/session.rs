use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Instant;

/// Shared pipeline state: the capture clock, the process-wide cancel flag
/// and stream id allocation.
///
/// Every component holds an `Arc<Session>`; its lifetime frames the
/// lifetime of every buffer and worker built on top of it.
pub struct Session {
    start: Instant,
    cancel: AtomicBool,
    next_audio: AtomicI32,
    next_video: AtomicI32,
}

impl Session {
    pub fn new() -> Arc<Session> {
        Arc::new(Session {
            start: Instant::now(),
            cancel: AtomicBool::new(false),
            next_audio: AtomicI32::new(1),
            next_video: AtomicI32::new(1),
        })
    }

    /// Monotonic capture time in microseconds.
    pub fn now(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    /// Request shutdown of every worker polling this session.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Allocate the next audio stream id. Id 0 means "uninitialized".
    pub fn new_audio_id(&self) -> i32 {
        self.next_audio.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate the next video stream id.
    pub fn new_video_id(&self) -> i32 {
        self.next_video.fetch_add(1, Ordering::SeqCst)
    }
}

/// Worker thread count hint for two-sided stages.
pub fn threads_hint() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
