use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::buffer::{Buffer, Mode, Packet};
use crate::error::{Error, Result};
use crate::session::Session;

/// End-of-stream message tag. A worker propagates it downstream and then
/// stops.
pub const MSG_CLOSE: u8 = 0x01;

/// Per-iteration state handed to every stage hook.
///
/// `read_size`/`write_size` count payload bytes, excluding the one-byte
/// message header. Hooks steer the iteration through the flags: `copy`
/// forwards the payload unchanged, `skip_read`/`skip_write` suppress one
/// side, `unknown_size` defers the size declaration until after the
/// write hook, `stop` ends the thread after this iteration.
pub struct Pass {
    pub header: u8,
    pub read_size: usize,
    pub write_size: usize,
    pub copy: bool,
    pub skip_read: bool,
    pub skip_write: bool,
    pub unknown_size: bool,
    pub stop: bool,
}

impl Pass {
    fn new() -> Pass {
        Pass {
            header: 0,
            read_size: 0,
            write_size: 0,
            copy: false,
            skip_read: false,
            skip_write: false,
            unknown_size: false,
            stop: false,
        }
    }

    /// Clear the per-iteration flags. The header survives so write-only
    /// stages can keep emitting it.
    fn reset(&mut self) {
        self.read_size = 0;
        self.write_size = 0;
        self.copy = false;
        self.skip_read = false;
        self.skip_write = false;
        self.unknown_size = false;
        self.stop = false;
    }
}

/// A packet-stream processor: N threads each pull one packet from the
/// input buffer, run the hooks, and push one packet to the output buffer
/// while preserving stream order.
///
/// Hook order per iteration: `open`, then on the read side `header`
/// (after the message header and size are known) and `read` (with the
/// payload mapped in place), then the write side (either a verbatim copy
/// or `write` over the output region), then `close`. `context` runs once
/// per thread at startup, `thread_finish` once per thread at exit, and
/// `finish` exactly once — on the last thread out, with the first error
/// observed by any thread.
pub trait Stage: Send + Sync + 'static {
    /// Per-thread scratch state, built on the worker thread itself.
    type Ctx;

    fn name(&self) -> &'static str {
        "stage"
    }

    fn context(&self) -> Result<Self::Ctx>;

    fn open(&self, _pass: &mut Pass) -> Result<()> {
        Ok(())
    }

    fn header(&self, _ctx: &mut Self::Ctx, _pass: &mut Pass) -> Result<()> {
        Ok(())
    }

    fn read(&self, _ctx: &mut Self::Ctx, _pass: &mut Pass, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn write(
        &self,
        _ctx: &mut Self::Ctx,
        _pass: &mut Pass,
        _data: &[u8],
        _out: &mut [u8],
    ) -> Result<()> {
        Ok(())
    }

    fn close(&self, _pass: &mut Pass) -> Result<()> {
        Ok(())
    }

    fn thread_finish(&self, _ctx: &mut Self::Ctx, _err: Option<&Error>) {}

    fn finish(&self, _err: Option<&Error>) {}
}

struct FinishState {
    running: usize,
    err: Option<Error>,
}

struct Control {
    /// Serialises packet opens across workers so output order matches
    /// input order.
    open: Mutex<()>,
    finish: Mutex<FinishState>,
    stop: AtomicBool,
}

/// Handle over the spawned worker threads of one stage.
pub struct Worker {
    handles: Vec<JoinHandle<()>>,
    control: Arc<Control>,
}

impl Worker {
    /// Join every thread and surface the first error the stage hit.
    /// A cancelled run is a clean one.
    pub fn wait(self) -> Result<()> {
        for h in self.handles {
            let _ = h.join();
        }
        match self.control.finish.lock().err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Spawn `threads` worker threads over `from`/`to`. At least one buffer
/// must be given; a missing side disables that half of the iteration.
pub fn spawn<S: Stage>(
    session: &Arc<Session>,
    stage: &Arc<S>,
    from: Option<&Arc<Buffer>>,
    to: Option<&Arc<Buffer>>,
    threads: usize,
) -> Result<Worker> {
    if threads < 1 || (from.is_none() && to.is_none()) {
        return Err(Error::Inval);
    }
    let control = Arc::new(Control {
        open: Mutex::new(()),
        finish: Mutex::new(FinishState { running: 0, err: None }),
        stop: AtomicBool::new(false),
    });
    let mut handles = Vec::with_capacity(threads);
    for i in 0..threads {
        control.finish.lock().running += 1;
        let session = session.clone();
        let stage = stage.clone();
        let control2 = control.clone();
        let from = from.cloned();
        let to = to.cloned();
        let spawned = std::thread::Builder::new()
            .name(format!("{}-{i}", stage.name()))
            .spawn(move || run(session, stage, control2, from, to));
        match spawned {
            Ok(h) => handles.push(h),
            Err(e) => {
                control.finish.lock().running -= 1;
                log::error!("can't create worker thread: {e}");
                return Err(Error::Io(e));
            }
        }
    }
    Ok(Worker { handles, control })
}

fn run<S: Stage>(
    session: Arc<Session>,
    stage: Arc<S>,
    control: Arc<Control>,
    from: Option<Arc<Buffer>>,
    to: Option<Arc<Buffer>>,
) {
    let mut read_pkt = from.as_ref().map(Packet::new);
    let mut write_pkt = to.as_ref().map(Packet::new);
    let mut pass = Pass::new();
    let mut ctx: Option<S::Ctx> = None;

    let outcome: Result<()> = (|| {
        ctx = Some(stage.context()?);
        let ctx = ctx.as_mut().expect("context just created");

        loop {
            pass.reset();
            stage.open(&mut pass)?;

            let mut gate = if read_pkt.is_some() && write_pkt.is_some() {
                Some(control.open.lock())
            } else {
                None
            };

            let reading = read_pkt.is_some() && !pass.skip_read;
            let data: &[u8] = if reading {
                let rp = read_pkt.as_mut().expect("read side present");
                rp.open(Mode::Read)?;
                // The header byte is published last by an in-flight
                // writer, so once it is readable the size is final.
                let mut tag = [0u8; 1];
                rp.read_into(&mut tag)?;
                pass.header = tag[0];
                pass.read_size = rp.size()? as usize - 1;
                pass.write_size = pass.read_size;
                stage.header(ctx, &mut pass)?;
                rp.dma_read(pass.read_size)?
            } else {
                &[]
            };
            if reading {
                stage.read(ctx, &mut pass, data)?;
            }

            let writing = write_pkt.is_some() && !pass.skip_write;
            let mut declared: Option<usize> = None;
            if writing {
                let wp = write_pkt.as_mut().expect("write side present");
                wp.open(Mode::Write)?;
                // Order is fixed once both packets are open.
                gate = None;

                wp.seek(1)?;
                if !pass.unknown_size {
                    wp.set_size(1 + pass.write_size as u64)?;
                    declared = Some(pass.write_size);
                }
                if pass.copy {
                    wp.write(data)?;
                } else {
                    let out = wp.dma_write(pass.write_size)?;
                    stage.write(ctx, &mut pass, data, out)?;
                }
                // Settle the final size before the header byte goes in:
                // the header is what releases early readers.
                if pass.unknown_size || declared != Some(pass.write_size) {
                    wp.set_size(1 + pass.write_size as u64)?;
                }
                wp.seek(0)?;
                wp.write(&[pass.header])?;
            }
            drop(gate);

            if reading {
                read_pkt.as_mut().expect("read side present").close()?;
            }
            if writing {
                write_pkt.as_mut().expect("write side present").close()?;
            }

            stage.close(&mut pass)?;

            if pass.stop
                || session.is_cancelled()
                || pass.header == MSG_CLOSE
                || control.stop.load(Ordering::SeqCst)
            {
                break;
            }
        }
        Ok(())
    })();

    drop(read_pkt);
    drop(write_pkt);

    let err = match outcome {
        Ok(()) => None,
        Err(Error::Canceled) => None,
        Err(e) => {
            session.cancel();
            log::error!("{}: {e}", stage.name());
            Some(e)
        }
    };

    // Wake up sibling threads blocked on the input; on a global cancel
    // there may also be threads blocked on the output.
    if from.is_some() && !control.stop.swap(true, Ordering::SeqCst) {
        from.as_ref().expect("read side present").cancel();
        if session.is_cancelled() {
            if let Some(to) = to.as_ref() {
                to.cancel();
            }
        }
    }

    if let Some(ctx) = ctx.as_mut() {
        stage.thread_finish(ctx, err.as_ref());
    }

    let mut fin = control.finish.lock();
    fin.running -= 1;
    if fin.err.is_none() {
        fin.err = err;
    }
    let last = fin.running == 0;
    drop(fin);
    if last {
        let fin = control.finish.lock();
        stage.finish(fin.err.as_ref());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tinyrand::{RandRange, StdRand};

    struct CopyStage;

    impl Stage for CopyStage {
        type Ctx = ();

        fn context(&self) -> Result<()> {
            Ok(())
        }

        fn read(&self, _ctx: &mut (), pass: &mut Pass, _data: &[u8]) -> Result<()> {
            pass.copy = true;
            Ok(())
        }
    }

    /// Maps every payload byte, exercising the dma write path.
    struct XorStage;

    impl Stage for XorStage {
        type Ctx = ();

        fn context(&self) -> Result<()> {
            Ok(())
        }

        fn write(&self, _ctx: &mut (), _pass: &mut Pass, data: &[u8], out: &mut [u8]) -> Result<()> {
            for (o, d) in out.iter_mut().zip(data) {
                *o = d ^ 0xff;
            }
            Ok(())
        }
    }

    struct FailStage;

    impl Stage for FailStage {
        type Ctx = ();

        fn context(&self) -> Result<()> {
            Ok(())
        }

        fn read(&self, _ctx: &mut (), pass: &mut Pass, _data: &[u8]) -> Result<()> {
            if pass.header == 0x06 {
                return Err(Error::BadMsg);
            }
            pass.copy = true;
            Ok(())
        }
    }

    fn post(pkt: &mut Packet, tag: u8, body: &[u8]) {
        pkt.open(Mode::Write).unwrap();
        pkt.write(&[tag]).unwrap();
        pkt.write(body).unwrap();
        pkt.close().unwrap();
    }

    fn drain(buf: &Arc<Buffer>) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        let mut pkt = Packet::new(buf);
        loop {
            pkt.open(Mode::Read).unwrap();
            let mut tag = [0u8; 1];
            pkt.read_into(&mut tag).unwrap();
            let total = pkt.size().unwrap() as usize;
            let body = pkt.dma_read(total - 1).unwrap().to_vec();
            pkt.close().unwrap();
            let done = tag[0] == MSG_CLOSE;
            out.push((tag[0], body));
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn copy_stage_preserves_order_with_many_threads() {
        let session = Session::new();
        let input = Buffer::with_capacity(1 << 14);
        let output = Buffer::with_capacity(1 << 14);
        let worker = spawn(&session, &Arc::new(CopyStage), Some(&input), Some(&output), 8).unwrap();

        let feeder_buf = input.clone();
        let feeder = std::thread::spawn(move || {
            let mut rand = StdRand::default();
            let mut pkt = Packet::new(&feeder_buf);
            let mut sent = Vec::new();
            for i in 0..1000u32 {
                let tag = [0x02u8, 0x06, 0x08][rand.next_range(0usize..3)];
                let mut body = i.to_le_bytes().to_vec();
                body.resize(4 + rand.next_range(0usize..64), tag);
                post(&mut pkt, tag, &body);
                sent.push((tag, body));
            }
            post(&mut pkt, MSG_CLOSE, &[]);
            sent.push((MSG_CLOSE, Vec::new()));
            sent
        });

        let got = drain(&output);
        let sent = feeder.join().unwrap();
        worker.wait().unwrap();
        assert_eq!(got, sent);
    }

    #[test]
    fn transform_stage_rewrites_payloads_in_order() {
        let session = Session::new();
        let input = Buffer::with_capacity(4096);
        let output = Buffer::with_capacity(4096);
        let worker = spawn(&session, &Arc::new(XorStage), Some(&input), Some(&output), 4).unwrap();

        let feeder_buf = input.clone();
        let feeder = std::thread::spawn(move || {
            let mut pkt = Packet::new(&feeder_buf);
            for i in 0..200u8 {
                post(&mut pkt, 0x02, &[i, i, i]);
            }
            post(&mut pkt, MSG_CLOSE, &[]);
        });

        let got = drain(&output);
        feeder.join().unwrap();
        worker.wait().unwrap();
        assert_eq!(got.len(), 201);
        for (i, (tag, body)) in got[..200].iter().enumerate() {
            assert_eq!(*tag, 0x02);
            assert_eq!(body.as_slice(), &[i as u8 ^ 0xff; 3]);
        }
    }

    #[test]
    fn failing_stage_cancels_pipeline_and_reports_first_error() {
        let session = Session::new();
        let input = Buffer::with_capacity(4096);
        let output = Buffer::with_capacity(4096);
        let worker = spawn(&session, &Arc::new(FailStage), Some(&input), Some(&output), 2).unwrap();

        let mut pkt = Packet::new(&input);
        post(&mut pkt, 0x02, b"fine");
        post(&mut pkt, 0x06, b"poison");

        assert!(matches!(worker.wait(), Err(Error::BadMsg)));
        assert!(session.is_cancelled());
        assert!(input.is_cancelled());
    }

    #[test]
    fn close_propagates_through_chained_stages() {
        let session = Session::new();
        let a = Buffer::with_capacity(4096);
        let b = Buffer::with_capacity(4096);
        let c = Buffer::with_capacity(4096);
        let w1 = spawn(&session, &Arc::new(CopyStage), Some(&a), Some(&b), 3).unwrap();
        let w2 = spawn(&session, &Arc::new(CopyStage), Some(&b), Some(&c), 3).unwrap();

        let mut pkt = Packet::new(&a);
        post(&mut pkt, 0x02, b"frame");
        post(&mut pkt, MSG_CLOSE, &[]);

        let got = drain(&c);
        w1.wait().unwrap();
        w2.wait().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], (0x02, b"frame".to_vec()));
        assert_eq!(got[1].0, MSG_CLOSE);
    }

    #[test]
    fn rejects_zero_threads_and_missing_buffers() {
        let session = Session::new();
        let buf = Buffer::with_capacity(64);
        assert!(matches!(
            spawn(&session, &Arc::new(CopyStage), Some(&buf), None, 0),
            Err(Error::Inval)
        ));
        assert!(matches!(
            spawn::<CopyStage>(&session, &Arc::new(CopyStage), None, None, 1),
            Err(Error::Inval)
        ));
    }
}
