use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Mutex, MutexGuard};

use container::{
    AUDIO_INTERLEAVED, AudioDataHeader, AudioFormat, Codable, MessageType, SampleFormat,
};
use stream::{Buffer, Error, Mode, Packet, Result, Session};

use crate::sync::{Semaphore, SpinGuard, SpinLock};

/// Opaque host PCM handle key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pcm(pub u64);

/// Host open-mode bits that matter to the capturer. Async streams may
/// call back from a signal handler and therefore take the spinlock
/// path.
#[derive(Debug, Clone, Copy, Default)]
pub struct PcmMode {
    pub asynchronous: bool,
    pub nonblock: bool,
}

/// Sample formats the host may announce. Only the signed little-endian
/// ones are capturable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmSampleFormat {
    S8,
    U8,
    S16Le,
    S24Le,
    S32Le,
    F32Le,
}

fn capture_format(f: PcmSampleFormat) -> Option<SampleFormat> {
    match f {
        PcmSampleFormat::S16Le => Some(SampleFormat::S16Le),
        PcmSampleFormat::S24Le => Some(SampleFormat::S24Le),
        PcmSampleFormat::S32Le => Some(SampleFormat::S32Le),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmAccess {
    RwInterleaved,
    RwNoninterleaved,
    MmapInterleaved,
    MmapNoninterleaved,
    MmapComplex,
}

#[derive(Debug, Clone, Copy)]
pub struct HwParams {
    pub format: PcmSampleFormat,
    pub rate: u32,
    pub channels: u32,
    pub access: PcmAccess,
}

/// One channel of a host mmap area. `first` and `step` are bit offsets
/// as the host reports them. The pointer must stay valid from
/// `mmap_begin` until the matching `mmap_commit` returns.
#[derive(Debug, Clone, Copy)]
pub struct ChannelArea {
    pub addr: *const u8,
    pub first: usize,
    pub step: usize,
}

// Safety: the area is a borrowed view of host memory; validity across
// the begin/commit window is the caller's contract, as it is for the
// host API itself.
unsafe impl Send for ChannelArea {}

#[derive(Debug, Clone, Copy)]
struct StreamCfg {
    format: SampleFormat,
    flags: u32,
    rate: u32,
    channels: u32,
    complex: bool,
}

impl StreamCfg {
    fn frames_to_bytes(&self, frames: u64) -> usize {
        frames as usize * self.channels as usize * self.format.bytes_per_sample()
    }

    fn samples_to_bytes(&self, frames: u64) -> usize {
        frames as usize * self.format.bytes_per_sample()
    }
}

struct MmapSnap {
    areas: Vec<ChannelArea>,
    offset: u64,
    frames: u64,
}

struct HandBuf {
    data: Vec<u8>,
    size: usize,
    time: u64,
}

/// Single-element handoff between the capture call sites and the
/// per-stream writer thread.
struct Handoff {
    cell: UnsafeCell<HandBuf>,
    full: Semaphore,
    empty: Semaphore,
    /// Busy flag for the async path: true while the writer is parked on
    /// `full` and the handoff buffer is free.
    ready: AtomicBool,
    running: AtomicBool,
    asynchronous: AtomicBool,
    id: AtomicI32,
}

// Safety: `cell` is touched by the capture side only between a
// successful ready/empty handshake and the `full` post, and by the
// writer thread only between its `full` wait and the `empty` post (or
// `ready` store). The semaphores' internal locks order those accesses.
unsafe impl Send for Handoff {}
unsafe impl Sync for Handoff {}

struct RecState {
    name: String,
    cfg: Option<StreamCfg>,
    /// Format seen and not closed; cleared by `close` so later starts
    /// skip the stream.
    fmt_ready: bool,
    initialized: bool,
    id: i32,
    mmap: Option<MmapSnap>,
    writer: Option<JoinHandle<()>>,
}

/// Per-PCM stream record. All mutable state is guarded by the
/// write-side lock, which is a spinlock for async streams and a mutex
/// otherwise.
struct StreamRec {
    pcm: u64,
    asynchronous: AtomicBool,
    spin: SpinLock,
    mutex: Mutex<()>,
    state: UnsafeCell<RecState>,
    shared: Arc<Handoff>,
}

// Safety: `state` is only reached through `with`, which holds the
// stream's write lock (spin or mutex, fixed per stream by its open
// mode).
unsafe impl Send for StreamRec {}
unsafe impl Sync for StreamRec {}

enum WriteGuard<'a> {
    Spin(#[allow(dead_code)] SpinGuard<'a>),
    Mutex(#[allow(dead_code)] MutexGuard<'a, ()>),
}

impl StreamRec {
    fn with<R>(&self, f: impl FnOnce(&mut RecState) -> R) -> R {
        let _guard = if self.asynchronous.load(Ordering::Relaxed) {
            WriteGuard::Spin(self.spin.lock())
        } else {
            WriteGuard::Mutex(self.mutex.lock())
        };
        // Safety: write lock held for the duration of `f`.
        f(unsafe { &mut *self.state.get() })
    }
}

/// Intercepts audio-device writes from the host application and frames
/// them as AUDIO_DATA packets on the target buffer.
///
/// The host is expected to call, per PCM handle: `open`, `hw_params`
/// (again on every configuration change), any mix of `writei` /
/// `writen` / `mmap_begin`+`mmap_commit`, and `close`. Unsupported
/// formats report `NotSup` and the stream is skipped.
pub struct AudioCapture {
    session: Arc<Session>,
    to: Arc<Buffer>,
    capturing: AtomicBool,
    started: AtomicBool,
    allow_skip: AtomicBool,
    streams: Mutex<Vec<Arc<StreamRec>>>,
}

impl AudioCapture {
    pub fn new(session: &Arc<Session>, to: &Arc<Buffer>) -> AudioCapture {
        AudioCapture {
            session: session.clone(),
            to: to.clone(),
            capturing: AtomicBool::new(false),
            started: AtomicBool::new(false),
            allow_skip: AtomicBool::new(false),
            streams: Mutex::new(Vec::new()),
        }
    }

    /// When set, an async capture call finding the writer busy drops
    /// the period instead of spinning.
    pub fn set_allow_skip(&self, allow: bool) {
        self.allow_skip.store(allow, Ordering::Relaxed);
    }

    /// Initialize every format-ready stream and start capturing.
    pub fn start(&self) -> Result<()> {
        if !self.started.swap(true, Ordering::SeqCst) {
            let streams: Vec<_> = self.streams.lock().clone();
            for rec in streams {
                rec.with(|st| {
                    if st.fmt_ready && !st.initialized {
                        self.stream_init(&rec, st)
                    } else {
                        Ok(())
                    }
                })?;
            }
        }
        if self.capturing.swap(true, Ordering::SeqCst) {
            log::warn!("audio: capturing is already active");
        } else {
            log::info!("audio: starting capturing");
        }
        Ok(())
    }

    pub fn stop(&self) {
        if self.capturing.swap(false, Ordering::SeqCst) {
            log::info!("audio: stopping capturing");
        } else {
            log::warn!("audio: capturing is already stopped");
        }
    }

    fn stream(&self, pcm: Pcm) -> Arc<StreamRec> {
        let mut streams = self.streams.lock();
        if let Some(r) = streams.iter().find(|r| r.pcm == pcm.0) {
            return r.clone();
        }
        let rec = Arc::new(StreamRec {
            pcm: pcm.0,
            asynchronous: AtomicBool::new(false),
            spin: SpinLock::new(),
            mutex: Mutex::new(()),
            state: UnsafeCell::new(RecState {
                name: String::new(),
                cfg: None,
                fmt_ready: false,
                initialized: false,
                id: 0,
                mmap: None,
                writer: None,
            }),
            shared: Arc::new(Handoff {
                cell: UnsafeCell::new(HandBuf { data: Vec::new(), size: 0, time: 0 }),
                full: Semaphore::new(0),
                empty: Semaphore::new(1),
                ready: AtomicBool::new(false),
                running: AtomicBool::new(false),
                asynchronous: AtomicBool::new(false),
                id: AtomicI32::new(0),
            }),
        });
        streams.push(rec.clone());
        rec
    }

    pub fn open(&self, pcm: Pcm, name: &str, mode: PcmMode) {
        let rec = self.stream(pcm);
        rec.asynchronous.store(mode.asynchronous, Ordering::SeqCst);
        rec.shared.asynchronous.store(mode.asynchronous, Ordering::SeqCst);
        rec.with(|st| st.name = name.to_string());
        log::info!(
            "audio: {pcm:?}: opened device \"{name}\" (async={}, nonblock={})",
            mode.asynchronous,
            mode.nonblock
        );
    }

    /// Mark the stream closed; it will not be re-initialized by later
    /// starts.
    pub fn close(&self, pcm: Pcm) {
        let rec = self.stream(pcm);
        let id = rec.with(|st| {
            st.fmt_ready = false;
            st.id
        });
        log::info!("audio: {pcm:?}: closing stream {id}");
    }

    /// Extract the hardware configuration the host negotiated. If the
    /// pipeline has already started, the stream is (re)initialized
    /// immediately.
    pub fn hw_params(&self, pcm: Pcm, params: &HwParams) -> Result<()> {
        let rec = self.stream(pcm);
        rec.with(|st| {
            log::debug!(
                "audio: {pcm:?}: creating/updating configuration for stream {}",
                st.id
            );
            let Some(format) = capture_format(params.format) else {
                log::error!("audio: {pcm:?}: unsupported sample format {:?}", params.format);
                return Err(Error::NotSup);
            };
            let (flags, complex) = match params.access {
                PcmAccess::RwInterleaved | PcmAccess::MmapInterleaved => (AUDIO_INTERLEAVED, false),
                // Complex layouts are transposed to interleaved on commit.
                PcmAccess::MmapComplex => (AUDIO_INTERLEAVED, true),
                PcmAccess::RwNoninterleaved | PcmAccess::MmapNoninterleaved => (0, false),
            };
            st.cfg = Some(StreamCfg {
                format,
                flags,
                rate: params.rate,
                channels: params.channels,
                complex,
            });
            st.fmt_ready = true;
            log::debug!(
                "audio: {pcm:?}: {} channels, rate {}, flags 0x{flags:02x}",
                params.channels,
                params.rate
            );
            if self.started.load(Ordering::SeqCst) {
                self.stream_init(&rec, st)?;
            }
            Ok(())
        })
    }

    /// Emit AUDIO_FORMAT and (re)spawn the writer thread. Called with
    /// the record lock held.
    fn stream_init(&self, rec: &StreamRec, st: &mut RecState) -> Result<()> {
        if !st.fmt_ready {
            return Err(Error::Inval);
        }
        let cfg = st.cfg.expect("format-ready stream has a configuration");
        if st.id < 1 {
            st.id = self.session.new_audio_id();
            rec.shared.id.store(st.id, Ordering::SeqCst);
        }
        log::info!("audio: initializing stream {}", st.id);

        let fmt = AudioFormat {
            id: st.id,
            flags: cfg.flags,
            rate: cfg.rate,
            channels: cfg.channels,
            format: cfg.format,
        };
        let mut pkt = Packet::new(&self.to);
        pkt.open(Mode::Write)?;
        pkt.write(&[MessageType::AudioFormat.tag()])?;
        pkt.write(&fmt.encode_vec())?;
        pkt.close()?;

        // A format change tears the old writer down first.
        if rec.shared.running.swap(false, Ordering::SeqCst) {
            rec.shared.full.post();
            if let Some(h) = st.writer.take() {
                let _ = h.join();
            }
        }
        rec.shared.running.store(true, Ordering::SeqCst);
        rec.shared.ready.store(false, Ordering::SeqCst);
        let shared = rec.shared.clone();
        let packet = Packet::new(&self.to);
        st.writer = Some(
            std::thread::Builder::new()
                .name(format!("audio-writer-{}", st.id))
                .spawn(move || writer_loop(shared, packet))
                .map_err(Error::Io)?,
        );
        st.initialized = true;
        Ok(())
    }

    /// Block (or skip) until the writer thread can take another period.
    fn wait_for_thread(&self, shared: &Handoff) -> Result<()> {
        if shared.asynchronous.load(Ordering::Relaxed) {
            // A semaphore wait from a signal handler can deadlock, so
            // async streams busy-poll the ready flag.
            while !shared.ready.load(Ordering::Acquire) {
                if self.allow_skip.load(Ordering::Relaxed) {
                    log::warn!("audio: dropped audio data, capture thread not ready");
                    return Err(Error::Busy);
                }
                std::thread::yield_now();
            }
        } else {
            shared.empty.wait();
        }
        Ok(())
    }

    /// Timestamp and stage one period for the writer thread. Called
    /// with the record lock held.
    fn submit(&self, shared: &Handoff, size: usize, fill: impl FnOnce(&mut [u8])) -> Result<()> {
        self.wait_for_thread(shared)?;
        // Safety: the ready/empty handshake above guarantees the writer
        // is parked and the handoff buffer is ours; the record lock
        // excludes other capture calls.
        let hb = unsafe { &mut *shared.cell.get() };
        if hb.data.len() < size {
            hb.data.resize(size, 0);
        }
        hb.size = size;
        hb.time = self.session.now();
        fill(&mut hb.data[..size]);
        shared.full.post();
        Ok(())
    }

    /// Interleaved write of `frames` frames from `data`.
    pub fn writei(&self, pcm: Pcm, data: &[u8], frames: u64) -> Result<()> {
        if !self.capturing.load(Ordering::Relaxed) {
            return Ok(());
        }
        let rec = self.stream(pcm);
        rec.with(|st| {
            if !st.initialized {
                return Err(Error::Inval);
            }
            let cfg = st.cfg.ok_or(Error::Inval)?;
            let bytes = cfg.frames_to_bytes(frames);
            if data.len() < bytes {
                return Err(Error::Inval);
            }
            self.submit(&rec.shared, bytes, |buf| buf.copy_from_slice(&data[..bytes]))
        })
    }

    /// Non-interleaved write, one slice per channel.
    pub fn writen(&self, pcm: Pcm, bufs: &[&[u8]], frames: u64) -> Result<()> {
        if !self.capturing.load(Ordering::Relaxed) {
            return Ok(());
        }
        let rec = self.stream(pcm);
        rec.with(|st| {
            if !st.initialized {
                return Err(Error::Inval);
            }
            let cfg = st.cfg.ok_or(Error::Inval)?;
            if cfg.flags & AUDIO_INTERLEAVED != 0 {
                log::error!("audio: interleaved stream incompatible with writen");
                return Err(Error::Inval);
            }
            let chunk = cfg.samples_to_bytes(frames);
            if bufs.len() < cfg.channels as usize || bufs.iter().any(|b| b.len() < chunk) {
                return Err(Error::Inval);
            }
            let bytes = cfg.frames_to_bytes(frames);
            self.submit(&rec.shared, bytes, |buf| {
                for (c, src) in bufs.iter().take(cfg.channels as usize).enumerate() {
                    buf[c * chunk..(c + 1) * chunk].copy_from_slice(&src[..chunk]);
                }
            })
        })
    }

    /// Snapshot the mmap areas the host is about to fill.
    pub fn mmap_begin(
        &self,
        pcm: Pcm,
        areas: &[ChannelArea],
        offset: u64,
        frames: u64,
    ) -> Result<()> {
        if !self.capturing.load(Ordering::Relaxed) {
            return Ok(());
        }
        let rec = self.stream(pcm);
        rec.with(|st| {
            if !st.initialized {
                return Err(Error::Inval);
            }
            st.mmap = Some(MmapSnap { areas: areas.to_vec(), offset, frames });
            Ok(())
        })
    }

    /// Harvest the samples the host committed into the snapshotted
    /// areas.
    pub fn mmap_commit(&self, pcm: Pcm, offset: u64, frames: u64) -> Result<()> {
        if !self.capturing.load(Ordering::Relaxed) {
            return Ok(());
        }
        let rec = self.stream(pcm);
        rec.with(|st| {
            let cfg = st.cfg.ok_or(Error::Inval)?;
            if cfg.channels == 0 {
                return Ok(());
            }
            let Some(snap) = st.mmap.as_ref() else {
                log::warn!("audio: mmap_commit without mmap_begin");
                return Err(Error::Inval);
            };
            if offset != snap.offset {
                log::warn!("audio: offset={} != snapshot offset={}", offset, snap.offset);
            }
            if snap.areas.len() < cfg.channels as usize {
                return Err(Error::Inval);
            }
            let areas = snap.areas.clone();
            let bytes = cfg.frames_to_bytes(frames);
            let chunk = cfg.samples_to_bytes(frames);
            let sample = cfg.samples_to_bytes(1);
            let frame_bytes = cfg.frames_to_bytes(1);
            let interleaved = cfg.flags & AUDIO_INTERLEAVED != 0 && !cfg.complex;
            self.submit(&rec.shared, bytes, |buf| unsafe {
                if interleaved {
                    std::ptr::copy_nonoverlapping(area_pos(&areas[0], offset), buf.as_mut_ptr(), bytes);
                } else if cfg.complex {
                    // Transpose per-channel strides into interleaved.
                    for c in 0..cfg.channels as usize {
                        let mut at = c * sample;
                        for s in 0..frames {
                            std::ptr::copy_nonoverlapping(
                                area_pos(&areas[c], offset + s),
                                buf[at..at + sample].as_mut_ptr(),
                                sample,
                            );
                            at += frame_bytes;
                        }
                    }
                } else {
                    // Channel planes, same layout as writen.
                    for c in 0..cfg.channels as usize {
                        std::ptr::copy_nonoverlapping(
                            area_pos(&areas[c], offset),
                            buf[c * chunk..(c + 1) * chunk].as_mut_ptr(),
                            chunk,
                        );
                    }
                }
            })
        })
    }

    /// Stop every writer thread. The target buffer should be cancelled
    /// or still drained by a consumer, or blocked writers cannot exit.
    pub fn shutdown(&self) {
        let streams: Vec<_> = std::mem::take(&mut *self.streams.lock());
        for rec in streams {
            let handle = rec.with(|st| {
                if rec.shared.running.swap(false, Ordering::SeqCst) {
                    rec.shared.full.post();
                }
                st.writer.take()
            });
            if let Some(h) = handle {
                let _ = h.join();
            }
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sample address within a channel area, bit offsets scaled to bytes.
unsafe fn area_pos(area: &ChannelArea, offset: u64) -> *const u8 {
    unsafe { area.addr.add(area.first / 8 + offset as usize * (area.step / 8)) }
}

fn writer_loop(shared: Arc<Handoff>, mut packet: Packet) {
    shared.ready.store(true, Ordering::Release);
    loop {
        shared.full.wait();
        shared.ready.store(false, Ordering::Release);
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        // Safety: the producer posted `full` and will not touch the
        // handoff until the writer signals empty/ready again.
        let (time, size) = {
            let hb = unsafe { &*shared.cell.get() };
            (hb.time, hb.size)
        };
        let hdr = AudioDataHeader {
            id: shared.id.load(Ordering::SeqCst),
            time,
            size: size as u64,
        };

        let res = (|| -> Result<()> {
            let mut hdr_bytes = [0u8; AudioDataHeader::WIRE_SIZE];
            let mut w: &mut [u8] = &mut hdr_bytes;
            hdr.encode_into(&mut w)?;
            packet.open(Mode::Write)?;
            packet.write(&[MessageType::AudioData.tag()])?;
            packet.write(&hdr_bytes)?;
            let hb = unsafe { &*shared.cell.get() };
            packet.write(&hb.data[..size])?;
            packet.close()?;
            Ok(())
        })();

        if let Err(e) = res {
            if !e.is_cancel() {
                log::error!("audio: writer thread failed: {e}");
            }
            break;
        }

        if !shared.asynchronous.load(Ordering::Relaxed) {
            shared.empty.post();
        }
        shared.ready.store(true, Ordering::Release);
    }
}
