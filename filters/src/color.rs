use std::sync::Arc;

use litemap::LiteMap;
use parking_lot::Mutex;

use container::{Codable, ColorSetup, FrameHeader, MessageType, VideoFormat};
use stream::{Buffer, Error, Pass, Result, Session, Stage, Worker, threads_hint, worker};

/// Fixed correction values that replace whatever COLOR messages the
/// stream carries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorOverride {
    pub brightness: f32,
    pub contrast: f32,
    pub red: f32,
    pub green: f32,
    pub blue: f32,
}

pub struct Lut {
    r: [u8; 256],
    g: [u8; 256],
    b: [u8; 256],
}

/// Transfer function: gamma first, then brightness offset and contrast
/// gain, clamped to [0, 1].
fn build_channel(brightness: f32, contrast: f32, gamma: f32) -> [u8; 256] {
    let mut t = [0u8; 256];
    for (i, v) in t.iter_mut().enumerate() {
        let x = (i as f32 / 255.0).powf(1.0 / gamma);
        let x = (x + brightness) * (1.0 + contrast);
        *v = (x.clamp(0.0, 1.0) * 255.0).round() as u8;
    }
    t
}

fn is_identity(c: &ColorSetup) -> bool {
    c.brightness == 0.0 && c.contrast == 0.0 && c.red == 1.0 && c.green == 1.0 && c.blue == 1.0
}

fn build_lut(c: &ColorSetup) -> Option<Arc<Lut>> {
    if is_identity(c) {
        return None;
    }
    Some(Arc::new(Lut {
        r: build_channel(c.brightness, c.contrast, c.red),
        g: build_channel(c.brightness, c.contrast, c.green),
        b: build_channel(c.brightness, c.contrast, c.blue),
    }))
}

struct StreamState {
    format: Option<VideoFormat>,
    lut: Option<Arc<Lut>>,
}

/// What the write hook should do with the current packet.
pub enum ColorOp {
    Copy,
    Frame { format: VideoFormat, lut: Arc<Lut> },
}

/// Color-correction stage.
///
/// Records VIDEO_FORMAT per stream, absorbs COLOR messages into a
/// per-channel lookup table (forwarding them downstream), and rewrites
/// packed-RGB VIDEO_FRAME payloads through the table. Planar frames and
/// identity corrections pass through unchanged.
pub struct Color {
    session: Arc<Session>,
    threads: usize,
    override_values: Option<ColorOverride>,
    streams: Mutex<LiteMap<i32, StreamState>>,
}

impl Color {
    pub fn new(session: &Arc<Session>) -> Color {
        Color {
            session: session.clone(),
            threads: threads_hint(),
            override_values: None,
            streams: Mutex::new(LiteMap::new()),
        }
    }

    /// Ignore in-stream COLOR values and apply these instead.
    pub fn with_override(mut self, values: ColorOverride) -> Color {
        log::info!(
            "color: overriding brightness={}, contrast={}, gamma=({}, {}, {})",
            values.brightness,
            values.contrast,
            values.red,
            values.green,
            values.blue
        );
        self.override_values = Some(values);
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Color {
        self.threads = threads;
        self
    }

    pub fn start(self, from: &Arc<Buffer>, to: &Arc<Buffer>) -> Result<Worker> {
        let threads = self.threads;
        let session = self.session.clone();
        worker::spawn(&session, &Arc::new(self), Some(from), Some(to), threads)
    }

    fn setup_for(&self, id: i32, from_stream: &ColorSetup) -> ColorSetup {
        match self.override_values {
            Some(o) => ColorSetup {
                id,
                brightness: o.brightness,
                contrast: o.contrast,
                red: o.red,
                green: o.green,
                blue: o.blue,
            },
            None => *from_stream,
        }
    }
}

impl Stage for Color {
    type Ctx = ColorOp;

    fn name(&self) -> &'static str {
        "color"
    }

    fn context(&self) -> Result<ColorOp> {
        Ok(ColorOp::Copy)
    }

    fn read(&self, ctx: &mut ColorOp, pass: &mut Pass, data: &[u8]) -> Result<()> {
        *ctx = ColorOp::Copy;
        pass.copy = true;

        match MessageType::try_from(pass.header) {
            Ok(MessageType::VideoFormat) => {
                let vf = VideoFormat::decode_slice(data).map_err(|_| Error::BadMsg)?;
                let mut streams = self.streams.lock();
                if streams.get(&vf.id).is_none() {
                    streams.insert(vf.id, StreamState { format: None, lut: None });
                }
                let state = streams.get_mut(&vf.id).expect("just ensured");
                state.format = Some(vf);
                if let Some(o) = self.override_values {
                    let setup = ColorSetup {
                        id: vf.id,
                        brightness: o.brightness,
                        contrast: o.contrast,
                        red: o.red,
                        green: o.green,
                        blue: o.blue,
                    };
                    state.lut = build_lut(&setup);
                }
            }
            Ok(MessageType::Color) => {
                let msg = ColorSetup::decode_slice(data).map_err(|_| Error::BadMsg)?;
                let setup = self.setup_for(msg.id, &msg);
                log::debug!(
                    "color: stream {}: brightness={}, contrast={}, gamma=({}, {}, {})",
                    msg.id,
                    setup.brightness,
                    setup.contrast,
                    setup.red,
                    setup.green,
                    setup.blue
                );
                let mut streams = self.streams.lock();
                if streams.get(&msg.id).is_none() {
                    streams.insert(msg.id, StreamState { format: None, lut: None });
                }
                streams.get_mut(&msg.id).expect("just ensured").lut = build_lut(&setup);
            }
            Ok(MessageType::VideoFrame) => {
                let hdr = FrameHeader::decode_slice(data).map_err(|_| Error::BadMsg)?;
                let streams = self.streams.lock();
                if let Some(state) = streams.get(&hdr.id) {
                    if let (Some(format), Some(lut)) = (state.format, state.lut.as_ref()) {
                        if format.format.bytes_per_pixel().is_some() {
                            *ctx = ColorOp::Frame { format, lut: lut.clone() };
                            pass.copy = false;
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn write(&self, ctx: &mut ColorOp, _pass: &mut Pass, data: &[u8], out: &mut [u8]) -> Result<()> {
        let ColorOp::Frame { format, lut } = ctx else {
            return Err(Error::Inval);
        };
        if data.len() != out.len() || data.len() < FrameHeader::WIRE_SIZE {
            return Err(Error::BadMsg);
        }
        out[..FrameHeader::WIRE_SIZE].copy_from_slice(&data[..FrameHeader::WIRE_SIZE]);

        let src = &data[FrameHeader::WIRE_SIZE..];
        let dst = &mut out[FrameHeader::WIRE_SIZE..];
        let bpp = format.format.bytes_per_pixel().expect("packed format checked on read");
        let stride = format.stride();
        let width = format.width as usize;
        if src.len() < stride * format.height as usize {
            return Err(Error::BadMsg);
        }

        // Red/blue byte offsets within a pixel; green sits at 1 either way.
        let (ri, bi) = match format.format {
            container::PixelFormat::Rgb24 => (0usize, 2usize),
            _ => (2, 0),
        };
        for y in 0..format.height as usize {
            let row = y * stride;
            let (srow, drow) = (&src[row..row + stride], &mut dst[row..row + stride]);
            for x in 0..width {
                let p = x * bpp;
                drow[p + ri] = lut.r[srow[p + ri] as usize];
                drow[p + 1] = lut.g[srow[p + 1] as usize];
                drow[p + bi] = lut.b[srow[p + bi] as usize];
                if bpp == 4 {
                    drow[p + 3] = srow[p + 3];
                }
            }
            // Row padding is carried through untouched.
            let tail = width * bpp;
            drow[tail..].copy_from_slice(&srow[tail..]);
        }
        Ok(())
    }

    fn finish(&self, err: Option<&Error>) {
        if let Some(e) = err {
            log::error!("color: {e}");
        }
    }
}
