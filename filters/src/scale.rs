use std::sync::Arc;

use litemap::LiteMap;
use parking_lot::Mutex;

use container::{
    Codable, FrameHeader, MessageType, PixelFormat, VIDEO_DWORD_ALIGNED, VideoFormat,
};
use stream::{Buffer, Error, Pass, Result, Session, Stage, Worker, threads_hint, worker};

/// Target geometry: a uniform factor or fixed dimensions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleTarget {
    Factor(f64),
    Size(u32, u32),
}

impl ScaleTarget {
    fn apply(self, format: &VideoFormat) -> (u32, u32) {
        let (mut w, mut h) = match self {
            ScaleTarget::Factor(f) => (
                ((format.width as f64 * f).round() as u32).max(1),
                ((format.height as f64 * f).round() as u32).max(1),
            ),
            ScaleTarget::Size(w, h) => (w.max(1), h.max(1)),
        };
        if format.format == PixelFormat::Ycbcr420 {
            w = (w & !1).max(2);
            h = (h & !1).max(2);
        }
        (w, h)
    }
}

#[derive(Clone, Copy)]
pub struct StreamState {
    src: VideoFormat,
    dw: u32,
    dh: u32,
}

impl StreamState {
    fn identity(&self) -> bool {
        self.dw == self.src.width && self.dh == self.src.height
    }

    fn out_frame_size(&self) -> usize {
        let (w, h) = (self.dw as usize, self.dh as usize);
        match self.src.format {
            PixelFormat::Ycbcr420 => w * h + 2 * ((w / 2) * (h / 2)),
            _ => w * h * self.src.format.bytes_per_pixel().expect("packed format"),
        }
    }
}

pub enum ScaleOp {
    Copy,
    Format(VideoFormat),
    Frame(StreamState),
}

/// Rescale stage (nearest neighbour).
///
/// Rewrites VIDEO_FORMAT dimensions and resamples VIDEO_FRAME payloads.
/// Output rows are tightly packed; the DWORD_ALIGNED flag is honoured
/// on input and dropped on output. 1:1 targets copy through untouched.
pub struct Scale {
    session: Arc<Session>,
    threads: usize,
    target: ScaleTarget,
    streams: Mutex<LiteMap<i32, StreamState>>,
}

impl Scale {
    pub fn new(session: &Arc<Session>, target: ScaleTarget) -> Scale {
        Scale {
            session: session.clone(),
            threads: threads_hint(),
            target,
            streams: Mutex::new(LiteMap::new()),
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Scale {
        self.threads = threads;
        self
    }

    pub fn start(self, from: &Arc<Buffer>, to: &Arc<Buffer>) -> Result<Worker> {
        let threads = self.threads;
        let session = self.session.clone();
        worker::spawn(&session, &Arc::new(self), Some(from), Some(to), threads)
    }
}

impl Stage for Scale {
    type Ctx = ScaleOp;

    fn name(&self) -> &'static str {
        "scale"
    }

    fn context(&self) -> Result<ScaleOp> {
        Ok(ScaleOp::Copy)
    }

    fn read(&self, ctx: &mut ScaleOp, pass: &mut Pass, data: &[u8]) -> Result<()> {
        *ctx = ScaleOp::Copy;
        pass.copy = true;

        match MessageType::try_from(pass.header) {
            Ok(MessageType::VideoFormat) => {
                let src = VideoFormat::decode_slice(data).map_err(|_| Error::BadMsg)?;
                let (dw, dh) = self.target.apply(&src);
                let state = StreamState { src, dw, dh };
                self.streams.lock().insert(src.id, state);
                if !state.identity() {
                    log::info!(
                        "scale: stream {}: {}x{} -> {}x{}",
                        src.id,
                        src.width,
                        src.height,
                        dw,
                        dh
                    );
                    let out = VideoFormat {
                        width: dw,
                        height: dh,
                        flags: src.flags & !VIDEO_DWORD_ALIGNED,
                        ..src
                    };
                    *ctx = ScaleOp::Format(out);
                    pass.copy = false;
                    pass.write_size = VideoFormat::WIRE_SIZE;
                }
            }
            Ok(MessageType::VideoFrame) => {
                let hdr = FrameHeader::decode_slice(data).map_err(|_| Error::BadMsg)?;
                let streams = self.streams.lock();
                if let Some(state) = streams.get(&hdr.id) {
                    if !state.identity() {
                        *ctx = ScaleOp::Frame(*state);
                        pass.copy = false;
                        pass.write_size = FrameHeader::WIRE_SIZE + state.out_frame_size();
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn write(&self, ctx: &mut ScaleOp, _pass: &mut Pass, data: &[u8], out: &mut [u8]) -> Result<()> {
        match ctx {
            ScaleOp::Copy => Err(Error::Inval),
            ScaleOp::Format(vf) => {
                let mut w = &mut out[..];
                vf.encode_into(&mut w)?;
                Ok(())
            }
            ScaleOp::Frame(state) => {
                if data.len() < FrameHeader::WIRE_SIZE + state.src.frame_size() {
                    return Err(Error::BadMsg);
                }
                out[..FrameHeader::WIRE_SIZE].copy_from_slice(&data[..FrameHeader::WIRE_SIZE]);
                let src = &data[FrameHeader::WIRE_SIZE..];
                let dst = &mut out[FrameHeader::WIRE_SIZE..];
                match state.src.format {
                    PixelFormat::Ycbcr420 => scale_planar(state, src, dst),
                    _ => scale_packed(state, src, dst),
                }
                Ok(())
            }
        }
    }

    fn finish(&self, err: Option<&Error>) {
        if let Some(e) = err {
            log::error!("scale: {e}");
        }
    }
}

fn scale_packed(state: &StreamState, src: &[u8], dst: &mut [u8]) {
    let bpp = state.src.format.bytes_per_pixel().expect("packed format");
    let sstride = state.src.stride();
    let (sw, sh) = (state.src.width as usize, state.src.height as usize);
    let (dw, dh) = (state.dw as usize, state.dh as usize);
    let dstride = dw * bpp;
    for y in 0..dh {
        let sy = y * sh / dh;
        for x in 0..dw {
            let sx = x * sw / dw;
            let s = sy * sstride + sx * bpp;
            let d = y * dstride + x * bpp;
            dst[d..d + bpp].copy_from_slice(&src[s..s + bpp]);
        }
    }
}

fn scale_plane(src: &[u8], sw: usize, sh: usize, dst: &mut [u8], dw: usize, dh: usize) {
    for y in 0..dh {
        let sy = y * sh / dh;
        for x in 0..dw {
            dst[y * dw + x] = src[sy * sw + x * sw / dw];
        }
    }
}

/// Planes in payload order: Y, then Cb and Cr at quarter size.
fn scale_planar(state: &StreamState, src: &[u8], dst: &mut [u8]) {
    let (sw, sh) = (state.src.width as usize, state.src.height as usize);
    let (dw, dh) = (state.dw as usize, state.dh as usize);
    let (scw, sch) = (sw / 2, sh / 2);
    let (dcw, dch) = (dw / 2, dh / 2);

    scale_plane(&src[..sw * sh], sw, sh, &mut dst[..dw * dh], dw, dh);
    let s_cb = &src[sw * sh..sw * sh + scw * sch];
    let d_cb_at = dw * dh;
    scale_plane(s_cb, scw, sch, &mut dst[d_cb_at..d_cb_at + dcw * dch], dcw, dch);
    let s_cr = &src[sw * sh + scw * sch..];
    let d_cr_at = dw * dh + dcw * dch;
    scale_plane(s_cr, scw, sch, &mut dst[d_cr_at..d_cr_at + dcw * dch], dcw, dch);
}
