use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/*

Packet stream layout:

    arena (capacity bytes, ring)
    [ slot 0 | slot 1 | slot 2 | ... free ... ]
      ^tail                     ^head

Cursors are absolute byte counters; the physical offset is cursor %
capacity, so a slot's bytes may wrap around the end of the arena. Slots
form a FIFO: writers append at head, readers claim from the front, space
is reclaimed at tail strictly in order.

Write side: at most one packet with an undeclared extent exists at a
time. Declaring the final size (`set_size`) fixes the reservation, lets
the next writer open while this one is still filling its bytes, and
makes the packet claimable by a reader; a later `set_size` may shrink
the published length without giving back the reservation.

Visibility: each slot carries an `avail` cursor, the contiguous prefix
of payload bytes the writer has finished with. Reads of an in-flight
packet block until the cursor covers them (or the writer closes);
published bytes are immutable, so a writer must lay a packet down
front-to-back — in particular, a deferred header byte at offset 0 is
what unlocks the first read.

*/

/// Open mode for [`Packet::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

struct Slot {
    seq: u64,
    base: u64,
    /// Reserved extent in the arena. Never shrinks once another writer
    /// may have opened behind it.
    alloc: u64,
    /// Published payload length, `<= alloc`.
    len: u64,
    /// Contiguous prefix of payload bytes visible to the reader.
    avail: u64,
    sized: bool,
    closed: bool,
    claimed: bool,
    released: bool,
}

struct Shared {
    head: u64,
    tail: u64,
    next_seq: u64,
    slots: VecDeque<Slot>,
    /// A write packet with an undeclared extent exists.
    writer_unsized: bool,
    cancelled: bool,
}

/// Aggregate transfer counters, for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub packets_written: u64,
    pub packets_read: u64,
}

/// Bounded shared-memory packet stream.
///
/// One mutex and one condition variable guard all cursor and slot state;
/// payload copies happen outside the lock against regions owned by
/// exactly one packet handle.
pub struct Buffer {
    arena: Box<[UnsafeCell<u8>]>,
    capacity: u64,
    shared: Mutex<Shared>,
    cond: Condvar,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    packets_written: AtomicU64,
    packets_read: AtomicU64,
}

// Safety: the arena is only touched through `Packet` handles. A byte
// range belongs to at most one handle at a time: the writer owns
// [base, base+alloc) of its slot and hands ranges over to the reader by
// advancing the slot's `avail` cursor (or closing), never writing a
// published byte again. Cursor transitions happen under `shared`, and
// readers only perform shared reads of published or closed ranges.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    pub fn with_capacity(capacity: usize) -> Arc<Buffer> {
        assert!(capacity > 0, "packet stream capacity must be non-zero");
        let arena: Vec<UnsafeCell<u8>> = (0..capacity).map(|_| UnsafeCell::new(0)).collect();
        Arc::new(Buffer {
            arena: arena.into_boxed_slice(),
            capacity: capacity as u64,
            shared: Mutex::new(Shared {
                head: 0,
                tail: 0,
                next_seq: 0,
                slots: VecDeque::new(),
                writer_unsized: false,
                cancelled: false,
            }),
            cond: Condvar::new(),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            packets_written: AtomicU64::new(0),
            packets_read: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Wake every blocked packet operation with `Canceled`. Idempotent.
    pub fn cancel(&self) {
        let mut sh = self.shared.lock();
        sh.cancelled = true;
        drop(sh);
        self.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.lock().cancelled
    }

    pub fn stats(&self) -> Stats {
        Stats {
            bytes_written: self.bytes_written.load(Ordering::SeqCst),
            bytes_read: self.bytes_read.load(Ordering::SeqCst),
            packets_written: self.packets_written.load(Ordering::SeqCst),
            packets_read: self.packets_read.load(Ordering::SeqCst),
        }
    }

    fn ptr(&self) -> *mut u8 {
        self.arena.as_ptr() as *mut u8
    }

    fn phys(&self, abs: u64) -> usize {
        (abs % self.capacity) as usize
    }

    /// Physical offset of `abs` if the next `n` bytes do not wrap.
    fn contiguous(&self, abs: u64, n: usize) -> Option<usize> {
        let p = self.phys(abs);
        if p + n <= self.capacity as usize { Some(p) } else { None }
    }

    /// Copy into the arena at `abs`, splitting at the wrap point.
    ///
    /// Safety: [abs, abs+src.len()) must be owned by the calling handle.
    unsafe fn copy_in(&self, abs: u64, src: &[u8]) {
        if src.is_empty() {
            return;
        }
        let p = self.phys(abs);
        let first = src.len().min(self.capacity as usize - p);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr().add(p), first);
            if first < src.len() {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(first),
                    self.ptr(),
                    src.len() - first,
                );
            }
        }
    }

    /// Copy out of the arena at `abs`, splitting at the wrap point.
    ///
    /// Safety: [abs, abs+dst.len()) must be published or closed for the
    /// calling handle.
    unsafe fn copy_out(&self, abs: u64, dst: &mut [u8]) {
        if dst.is_empty() {
            return;
        }
        let p = self.phys(abs);
        let first = dst.len().min(self.capacity as usize - p);
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr().add(p), dst.as_mut_ptr(), first);
            if first < dst.len() {
                std::ptr::copy_nonoverlapping(
                    self.ptr(),
                    dst.as_mut_ptr().add(first),
                    dst.len() - first,
                );
            }
        }
    }
}

fn slot_mut(sh: &mut Shared, seq: u64) -> &mut Slot {
    sh.slots
        .iter_mut()
        .find(|s| s.seq == seq)
        .expect("packet slot vanished while handle open")
}

/// Pop released slots from the front and reclaim their space.
fn advance_tail(sh: &mut Shared) {
    while let Some(front) = sh.slots.front() {
        if !front.released {
            break;
        }
        sh.tail = front.base + front.alloc;
        sh.slots.pop_front();
    }
}

#[derive(Clone, Copy)]
enum State {
    Idle,
    Write {
        seq: u64,
        base: u64,
        pos: u64,
        /// High-water mark of reserved bytes while the extent is
        /// undeclared; equals the slot's `alloc` then.
        end: u64,
        declared: Option<u64>,
        len: u64,
    },
    Read {
        seq: u64,
        base: u64,
        pos: u64,
    },
}

/// A DMA range handed out to the caller; its bytes are published once
/// the next operation on the handle proves the borrow has ended.
#[derive(Clone, Copy)]
struct PendingDma {
    pos: u64,
    len: usize,
    /// Served from the bounce buffer, flushed into the arena on settle.
    bounce: bool,
}

/// A packet handle bound to one buffer.
///
/// Opens one read or one write transaction at a time and gives
/// sequential read/write/seek/size access to the packet payload.
/// Per-handle access is single-threaded; the buffer coordinates between
/// handles.
pub struct Packet {
    buffer: Arc<Buffer>,
    state: State,
    bounce: Vec<u8>,
    pending: Option<PendingDma>,
    /// Write-side publication bookkeeping: ranges finished but not yet
    /// contiguous with the published prefix, and the prefix itself.
    staged: Vec<(u64, u64)>,
    avail: u64,
}

impl Packet {
    pub fn new(buffer: &Arc<Buffer>) -> Packet {
        Packet {
            buffer: buffer.clone(),
            state: State::Idle,
            bounce: Vec::new(),
            pending: None,
            staged: Vec::new(),
            avail: 0,
        }
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// Open a transaction. Blocks until a packet with a declared size is
    /// available (read) or until no undeclared writer is open and at
    /// least one byte is free (write). Fails with `Canceled` once the
    /// buffer is cancelled.
    pub fn open(&mut self, mode: Mode) -> Result<()> {
        if !matches!(self.state, State::Idle) {
            return Err(Error::Already);
        }
        match mode {
            Mode::Write => {
                let mut sh = self.buffer.shared.lock();
                loop {
                    if sh.cancelled {
                        return Err(Error::Canceled);
                    }
                    let free = self.buffer.capacity - (sh.head - sh.tail);
                    if !sh.writer_unsized && free >= 1 {
                        break;
                    }
                    self.buffer.cond.wait(&mut sh);
                }
                let seq = sh.next_seq;
                sh.next_seq += 1;
                let base = sh.head;
                sh.slots.push_back(Slot {
                    seq,
                    base,
                    alloc: 0,
                    len: 0,
                    avail: 0,
                    sized: false,
                    closed: false,
                    claimed: false,
                    released: false,
                });
                sh.writer_unsized = true;
                drop(sh);
                self.staged.clear();
                self.avail = 0;
                self.pending = None;
                self.state = State::Write {
                    seq,
                    base,
                    pos: 0,
                    end: 0,
                    declared: None,
                    len: 0,
                };
                Ok(())
            }
            Mode::Read => {
                let mut sh = self.buffer.shared.lock();
                loop {
                    if sh.cancelled {
                        return Err(Error::Canceled);
                    }
                    if let Some(slot) = sh.slots.iter_mut().find(|s| !s.claimed) {
                        if slot.sized {
                            slot.claimed = true;
                            self.state = State::Read {
                                seq: slot.seq,
                                base: slot.base,
                                pos: 0,
                            };
                            return Ok(());
                        }
                    }
                    self.buffer.cond.wait(&mut sh);
                }
            }
        }
    }

    /// Grow the undeclared write packet so its extent covers `need`
    /// bytes from base, waiting for readers to free space.
    fn grow(&mut self, need: u64) -> Result<()> {
        let State::Write { seq, base, end, .. } = self.state else {
            return Err(Error::Inval);
        };
        if need <= end {
            return Ok(());
        }
        if need > self.buffer.capacity {
            return Err(Error::NoMem);
        }
        let mut sh = self.buffer.shared.lock();
        loop {
            if sh.cancelled {
                return Err(Error::Canceled);
            }
            let grow_by = need - (sh.head - base);
            if sh.head - sh.tail + grow_by <= self.buffer.capacity {
                sh.head += grow_by;
                slot_mut(&mut sh, seq).alloc = need;
                break;
            }
            self.buffer.cond.wait(&mut sh);
        }
        drop(sh);
        if let State::Write { end, .. } = &mut self.state {
            *end = need;
        }
        Ok(())
    }

    /// Merge a finished range into the published prefix and wake
    /// readers when it advanced.
    fn stage_range(&mut self, a: u64, b: u64) {
        if a >= b {
            return;
        }
        self.staged.push((a, b));
        let mut avail = self.avail;
        loop {
            let before = avail;
            self.staged.retain(|&(s, e)| {
                if s <= avail {
                    if e > avail {
                        avail = e;
                    }
                    false
                } else {
                    true
                }
            });
            if avail == before {
                break;
            }
        }
        if avail != self.avail {
            self.avail = avail;
            let State::Write { seq, .. } = self.state else {
                return;
            };
            let mut sh = self.buffer.shared.lock();
            slot_mut(&mut sh, seq).avail = avail;
            drop(sh);
            self.buffer.cond.notify_all();
        }
    }

    /// Publish the most recent DMA range; any operation after the hand-
    /// out proves the caller is done with the slice.
    fn settle_dma(&mut self) {
        if let Some(p) = self.pending.take() {
            let State::Write { base, .. } = self.state else {
                return;
            };
            if p.bounce {
                unsafe { self.buffer.copy_in(base + p.pos, &self.bounce[..p.len]) };
            }
            self.stage_range(p.pos, p.pos + p.len as u64);
        }
    }

    /// Append/overwrite bytes at the current position of the open write
    /// packet. Blocks while the arena is full. Bytes already handed to
    /// a reader cannot be rewritten.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.settle_dma();
        let State::Write { base, pos, end, declared, .. } = self.state else {
            return Err(Error::Inval);
        };
        if pos < self.avail {
            return Err(Error::Inval);
        }
        let new_end = pos + data.len() as u64;
        match declared {
            Some(alloc) if new_end > alloc => return Err(Error::Inval),
            Some(_) => {}
            None if new_end > end => self.grow(new_end)?,
            None => {}
        }
        unsafe { self.buffer.copy_in(base + pos, data) };
        if let State::Write { pos, end, .. } = &mut self.state {
            *pos = new_end;
            *end = (*end).max(new_end);
        }
        self.stage_range(pos, new_end);
        Ok(())
    }

    /// Block until [0, upto) of the claimed packet is readable, or the
    /// request exceeds the packet's (possibly shrunk) length.
    fn wait_readable(&self, seq: u64, upto: u64) -> Result<()> {
        let mut sh = self.buffer.shared.lock();
        loop {
            if sh.cancelled {
                return Err(Error::Canceled);
            }
            let slot = slot_mut(&mut sh, seq);
            if upto > slot.len {
                return Err(Error::Inval);
            }
            if slot.closed || slot.avail >= upto {
                return Ok(());
            }
            self.buffer.cond.wait(&mut sh);
        }
    }

    /// Copy the next bytes of the open read packet into `out`, waiting
    /// for an in-flight writer to publish them.
    pub fn read_into(&mut self, out: &mut [u8]) -> Result<()> {
        let State::Read { seq, base, pos } = self.state else {
            return Err(Error::Inval);
        };
        let new_pos = pos + out.len() as u64;
        self.wait_readable(seq, new_pos)?;
        unsafe { self.buffer.copy_out(base + pos, out) };
        if let State::Read { pos, .. } = &mut self.state {
            *pos = new_pos;
        }
        Ok(())
    }

    /// Borrow the next `n` bytes of the open read packet in place,
    /// waiting for an in-flight writer to publish them. Falls back to
    /// an internal bounce copy when the range wraps the arena. The
    /// slice is valid until the next operation on this handle.
    pub fn dma_read(&mut self, n: usize) -> Result<&[u8]> {
        let State::Read { seq, base, pos } = self.state else {
            return Err(Error::Inval);
        };
        self.wait_readable(seq, pos + n as u64)?;
        let abs = base + pos;
        if let State::Read { pos, .. } = &mut self.state {
            *pos += n as u64;
        }
        if let Some(p) = self.buffer.contiguous(abs, n) {
            // Safety: the range is published (or the slot closed) and
            // will not be written again.
            Ok(unsafe { std::slice::from_raw_parts(self.buffer.ptr().add(p), n) })
        } else {
            self.bounce.resize(n, 0);
            unsafe { self.buffer.copy_out(abs, &mut self.bounce[..n]) };
            Ok(&self.bounce[..n])
        }
    }

    /// Reserve and borrow the next `n` bytes of the open write packet in
    /// place. A wrapping range is served from a bounce buffer that is
    /// flushed into the arena when the hand-out settles ("fake DMA").
    pub fn dma_write(&mut self, n: usize) -> Result<&mut [u8]> {
        self.settle_dma();
        let State::Write { base, pos, end, declared, .. } = self.state else {
            return Err(Error::Inval);
        };
        if pos < self.avail {
            return Err(Error::Inval);
        }
        let new_end = pos + n as u64;
        match declared {
            Some(alloc) if new_end > alloc => return Err(Error::Inval),
            Some(_) => {}
            None if new_end > end => self.grow(new_end)?,
            None => {}
        }
        let abs = base + pos;
        if let State::Write { pos, end, .. } = &mut self.state {
            *pos = new_end;
            *end = (*end).max(new_end);
        }
        if let Some(p) = self.buffer.contiguous(abs, n) {
            self.pending = Some(PendingDma { pos: abs - base, len: n, bounce: false });
            // Safety: the range is reserved for this write slot and not
            // published until the hand-out settles.
            Ok(unsafe { std::slice::from_raw_parts_mut(self.buffer.ptr().add(p), n) })
        } else {
            self.bounce.resize(n, 0);
            self.pending = Some(PendingDma { pos: abs - base, len: n, bounce: true });
            Ok(&mut self.bounce[..n])
        }
    }

    /// Reposition within the open packet. Seeking a write packet past
    /// its current extent reserves the gap.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        match self.state {
            State::Write { end, declared, .. } => {
                self.settle_dma();
                match declared {
                    Some(alloc) if offset > alloc => return Err(Error::Inval),
                    Some(_) => {}
                    None if offset > end => self.grow(offset)?,
                    None => {}
                }
                if let State::Write { pos, end, .. } = &mut self.state {
                    *pos = offset;
                    *end = (*end).max(offset);
                }
                Ok(())
            }
            State::Read { seq, .. } => {
                let mut sh = self.buffer.shared.lock();
                if offset > slot_mut(&mut sh, seq).len {
                    return Err(Error::Inval);
                }
                drop(sh);
                if let State::Read { pos, .. } = &mut self.state {
                    *pos = offset;
                }
                Ok(())
            }
            State::Idle => Err(Error::Inval),
        }
    }

    /// Declare the packet's final length so the next writer may open —
    /// and a reader may claim the packet — before this one closes. A
    /// second call may only shrink the published length; the
    /// reservation stays.
    pub fn set_size(&mut self, n: u64) -> Result<()> {
        self.settle_dma();
        let State::Write { seq, end, declared, .. } = self.state else {
            return Err(Error::Inval);
        };
        match declared {
            None => {
                if n > end {
                    self.grow(n)?;
                }
                let alloc = if let State::Write { end, .. } = self.state { end } else { 0 };
                let mut sh = self.buffer.shared.lock();
                let slot = slot_mut(&mut sh, seq);
                slot.sized = true;
                slot.alloc = alloc;
                slot.len = n;
                sh.writer_unsized = false;
                drop(sh);
                self.buffer.cond.notify_all();
                if let State::Write { declared, len, .. } = &mut self.state {
                    *declared = Some(alloc);
                    *len = n;
                }
                Ok(())
            }
            Some(alloc) => {
                if n > alloc {
                    return Err(Error::Inval);
                }
                let mut sh = self.buffer.shared.lock();
                slot_mut(&mut sh, seq).len = n;
                drop(sh);
                if let State::Write { len, .. } = &mut self.state {
                    *len = n;
                }
                Ok(())
            }
        }
    }

    /// Declared or final size of the open packet. For a read packet the
    /// current (possibly shrunk) length is reported.
    pub fn size(&self) -> Result<u64> {
        match self.state {
            State::Write { end, declared, len, .. } => {
                Ok(if declared.is_some() { len } else { end })
            }
            State::Read { seq, .. } => {
                let mut sh = self.buffer.shared.lock();
                Ok(slot_mut(&mut sh, seq).len)
            }
            State::Idle => Err(Error::Inval),
        }
    }

    /// Publish a write packet or release a read packet.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            State::Write { seq, end, declared, len, .. } => {
                self.settle_dma();
                let mut sh = self.buffer.shared.lock();
                let slot = slot_mut(&mut sh, seq);
                if declared.is_none() {
                    slot.sized = true;
                    slot.alloc = end;
                    slot.len = end;
                    sh.writer_unsized = false;
                }
                let published = if declared.is_some() { len } else { end };
                slot_mut(&mut sh, seq).closed = true;
                drop(sh);
                self.buffer.bytes_written.fetch_add(published, Ordering::SeqCst);
                self.buffer.packets_written.fetch_add(1, Ordering::SeqCst);
                self.buffer.cond.notify_all();
                self.state = State::Idle;
                Ok(())
            }
            State::Read { seq, .. } => {
                let mut sh = self.buffer.shared.lock();
                let slot = slot_mut(&mut sh, seq);
                let len = slot.len;
                slot.released = true;
                advance_tail(&mut sh);
                drop(sh);
                self.buffer.bytes_read.fetch_add(len, Ordering::SeqCst);
                self.buffer.packets_read.fetch_add(1, Ordering::SeqCst);
                self.buffer.cond.notify_all();
                self.state = State::Idle;
                Ok(())
            }
            State::Idle => Err(Error::Inval),
        }
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        match self.state {
            State::Idle => {}
            State::Read { seq, .. } => {
                let mut sh = self.buffer.shared.lock();
                slot_mut(&mut sh, seq).released = true;
                advance_tail(&mut sh);
                drop(sh);
                self.buffer.cond.notify_all();
            }
            State::Write { seq, base, declared, .. } => {
                if declared.is_some() {
                    // The slot is already visible downstream; publish
                    // whatever was declared.
                    let _ = self.close();
                } else {
                    // Nothing depends on this slot yet, roll it back.
                    self.pending = None;
                    let mut sh = self.buffer.shared.lock();
                    let last = sh.slots.pop_back();
                    debug_assert!(last.map(|s| s.seq) == Some(seq));
                    sh.head = base;
                    sh.writer_unsized = false;
                    drop(sh);
                    self.buffer.cond.notify_all();
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;
    use tinyrand::{Rand, RandRange, StdRand};

    #[test]
    fn write_then_read_roundtrip() {
        let buf = Buffer::with_capacity(64);
        let mut w = Packet::new(&buf);
        w.open(Mode::Write).unwrap();
        w.write(b"\x02hello").unwrap();
        w.close().unwrap();

        let mut r = Packet::new(&buf);
        r.open(Mode::Read).unwrap();
        assert_eq!(r.size().unwrap(), 6);
        let mut out = [0u8; 6];
        r.read_into(&mut out).unwrap();
        assert_eq!(&out, b"\x02hello");
        r.close().unwrap();
    }

    #[test]
    fn seek_rewrites_header_after_payload() {
        let buf = Buffer::with_capacity(64);
        let mut w = Packet::new(&buf);
        w.open(Mode::Write).unwrap();
        w.seek(1).unwrap();
        w.write(b"body").unwrap();
        w.seek(0).unwrap();
        w.write(&[0x42]).unwrap();
        w.close().unwrap();

        let mut r = Packet::new(&buf);
        r.open(Mode::Read).unwrap();
        let got = r.dma_read(5).unwrap();
        assert_eq!(got, b"\x42body");
        r.close().unwrap();
    }

    #[test]
    fn wrapping_packets_use_bounce_buffers() {
        // Capacity 16 forces the second packet to wrap.
        let buf = Buffer::with_capacity(16);
        for round in 0u8..8 {
            let payload = [round; 11];
            let mut w = Packet::new(&buf);
            w.open(Mode::Write).unwrap();
            let out = w.dma_write(11).unwrap();
            out.copy_from_slice(&payload);
            w.close().unwrap();

            let mut r = Packet::new(&buf);
            r.open(Mode::Read).unwrap();
            let got = r.dma_read(11).unwrap();
            assert_eq!(got, &payload);
            r.close().unwrap();
        }
    }

    #[test]
    fn set_size_lets_next_writer_open() {
        let buf = Buffer::with_capacity(64);
        let mut a = Packet::new(&buf);
        a.open(Mode::Write).unwrap();
        a.write(b"\x01").unwrap();
        a.set_size(4).unwrap();

        // `a` is still open but sized, so `b` must not block.
        let mut b = Packet::new(&buf);
        b.open(Mode::Write).unwrap();
        b.write(b"\x05second").unwrap();
        b.close().unwrap();

        a.seek(1).unwrap();
        a.write(b"abc").unwrap();
        a.close().unwrap();

        // Reads come back in open order.
        let mut r = Packet::new(&buf);
        r.open(Mode::Read).unwrap();
        assert_eq!(r.dma_read(4).unwrap(), b"\x01abc");
        r.close().unwrap();
        r.open(Mode::Read).unwrap();
        assert_eq!(r.dma_read(7).unwrap(), b"\x05second");
        r.close().unwrap();
    }

    #[test]
    fn sized_packet_is_claimable_and_reads_follow_the_writer() {
        let buf = Buffer::with_capacity(64);
        let mut w = Packet::new(&buf);
        w.open(Mode::Write).unwrap();
        w.write(&[0x42]).unwrap();
        w.set_size(4).unwrap();

        // Claimable before close; the published prefix is readable.
        let mut r = Packet::new(&buf);
        r.open(Mode::Read).unwrap();
        assert_eq!(r.size().unwrap(), 4);
        let mut tag = [0u8; 1];
        r.read_into(&mut tag).unwrap();
        assert_eq!(tag[0], 0x42);

        // The rest arrives while the reader is blocked.
        let writer = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(30));
            w.write(b"abc").unwrap();
            w.close().unwrap();
        });
        assert_eq!(r.dma_read(3).unwrap(), b"abc");
        writer.join().unwrap();
        r.close().unwrap();
    }

    #[test]
    fn blocked_reader_of_inflight_packet_sees_cancel() {
        let buf = Buffer::with_capacity(64);
        let mut w = Packet::new(&buf);
        w.open(Mode::Write).unwrap();
        w.set_size(8).unwrap();

        let buf2 = buf.clone();
        let t = thread::spawn(move || {
            let mut r = Packet::new(&buf2);
            r.open(Mode::Read).unwrap();
            let mut out = [0u8; 8];
            r.read_into(&mut out)
        });
        thread::sleep(std::time::Duration::from_millis(20));
        buf.cancel();
        assert!(matches!(t.join().unwrap(), Err(Error::Canceled)));
    }

    #[test]
    fn published_bytes_cannot_be_rewritten() {
        let buf = Buffer::with_capacity(64);
        let mut w = Packet::new(&buf);
        w.open(Mode::Write).unwrap();
        w.write(b"\x01ab").unwrap();
        w.seek(1).unwrap();
        assert!(matches!(w.write(b"x"), Err(Error::Inval)));
    }

    #[test]
    fn set_size_can_shrink_published_length() {
        let buf = Buffer::with_capacity(64);
        let mut w = Packet::new(&buf);
        w.open(Mode::Write).unwrap();
        w.set_size(32).unwrap();
        let out = w.dma_write(32).unwrap();
        out[..5].copy_from_slice(b"\x09abcd");
        w.set_size(5).unwrap();
        w.close().unwrap();

        let mut r = Packet::new(&buf);
        r.open(Mode::Read).unwrap();
        assert_eq!(r.size().unwrap(), 5);
        assert_eq!(r.dma_read(5).unwrap(), b"\x09abcd");
        r.close().unwrap();
    }

    #[test]
    fn oversized_packet_reports_nomem() {
        let buf = Buffer::with_capacity(32);
        let mut w = Packet::new(&buf);
        w.open(Mode::Write).unwrap();
        assert!(matches!(w.write(&[0u8; 33]), Err(Error::NoMem)));
    }

    #[test]
    fn cancel_wakes_blocked_reader() {
        let buf = Buffer::with_capacity(32);
        let buf2 = buf.clone();
        let t = thread::spawn(move || {
            let mut r = Packet::new(&buf2);
            r.open(Mode::Read)
        });
        thread::sleep(std::time::Duration::from_millis(20));
        buf.cancel();
        assert!(matches!(t.join().unwrap(), Err(Error::Canceled)));
    }

    #[test]
    fn cancel_wakes_blocked_writer() {
        let buf = Buffer::with_capacity(8);
        let mut w = Packet::new(&buf);
        w.open(Mode::Write).unwrap();
        w.write(&[1u8; 6]).unwrap();
        w.close().unwrap();

        let buf2 = buf.clone();
        let t = thread::spawn(move || {
            let mut w = Packet::new(&buf2);
            w.open(Mode::Write).unwrap();
            // Only 2 bytes free, this must block until cancel.
            w.write(&[2u8; 5])
        });
        thread::sleep(std::time::Duration::from_millis(20));
        buf.cancel();
        assert!(matches!(t.join().unwrap(), Err(Error::Canceled)));
    }

    #[test]
    fn concurrent_producer_consumer_preserves_content_and_counts() {
        let buf = Buffer::with_capacity(256);
        let n_packets = 500usize;

        let prod_buf = buf.clone();
        let producer = thread::spawn(move || {
            let mut rand = StdRand::default();
            let mut pkt = Packet::new(&prod_buf);
            for i in 0..n_packets {
                let len = rand.next_range(1usize..120);
                let body = vec![(i % 251) as u8; len];
                pkt.open(Mode::Write).unwrap();
                pkt.write(&body).unwrap();
                pkt.close().unwrap();
            }
        });

        let cons_buf = buf.clone();
        let consumer = thread::spawn(move || {
            let mut pkt = Packet::new(&cons_buf);
            let mut total = 0u64;
            for i in 0..n_packets {
                pkt.open(Mode::Read).unwrap();
                let len = pkt.size().unwrap() as usize;
                let data = pkt.dma_read(len).unwrap();
                assert!(data.iter().all(|&b| b == (i % 251) as u8));
                total += len as u64;
                pkt.close().unwrap();
            }
            total
        });

        producer.join().unwrap();
        let read_total = consumer.join().unwrap();
        let stats = buf.stats();
        assert_eq!(stats.bytes_written, stats.bytes_read);
        assert_eq!(stats.bytes_read, read_total);
        assert_eq!(stats.packets_written, n_packets as u64);
        assert_eq!(stats.packets_read, n_packets as u64);
    }

    #[test]
    fn dropped_unsized_writer_rolls_back() {
        let buf = Buffer::with_capacity(32);
        {
            let mut w = Packet::new(&buf);
            w.open(Mode::Write).unwrap();
            w.write(b"doomed").unwrap();
            // dropped without close
        }
        let mut w = Packet::new(&buf);
        w.open(Mode::Write).unwrap();
        w.write(b"\x01ok").unwrap();
        w.close().unwrap();

        let mut r = Packet::new(&buf);
        r.open(Mode::Read).unwrap();
        assert_eq!(r.dma_read(3).unwrap(), b"\x01ok");
        r.close().unwrap();
        let stats = buf.stats();
        assert_eq!(stats.packets_written, 1);
    }

    #[test]
    fn random_sizes_many_rounds() {
        let buf = Buffer::with_capacity(97);
        let mut rand = StdRand::default();
        let mut w = Packet::new(&buf);
        let mut r = Packet::new(&buf);
        for _ in 0..300 {
            let len = rand.next_range(0usize..90);
            let fill = rand.next_u16() as u8;
            w.open(Mode::Write).unwrap();
            if len > 0 {
                let out = w.dma_write(len).unwrap();
                out.fill(fill);
            }
            w.close().unwrap();

            r.open(Mode::Read).unwrap();
            assert_eq!(r.size().unwrap(), len as u64);
            if len > 0 {
                let data = r.dma_read(len).unwrap();
                assert!(data.iter().all(|&b| b == fill));
            }
            r.close().unwrap();
        }
    }
}
