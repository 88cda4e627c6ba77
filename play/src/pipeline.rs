use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use litemap::LiteMap;
use parking_lot::Mutex;

use container::{
    AudioDataHeader, Codable, FileSink, FileSource, FrameHeader, MessageType, StreamInfo,
};
use filters::{Color, Pack, Scale, Unpack};
use stream::{Buffer, Mode, Packet, Result, Session, Worker};

use crate::config::Config;
use crate::demux::{Demux, MediaKind, StreamHandler};
use crate::info::Info;

/*

Playback pipeline:

  file -> (compressed) -> unpack -> (uncompressed) -> color -> scale
       -> demux -> per-stream consumers

Capture pipeline:

  producers -> (raw) -> pack -> (packed) -> file sink

Every filter runs its own worker threads; packet order is preserved
through each buffer.

*/

/// Run the playback pipeline over `path`, handing demuxed streams to
/// `handler`. Returns the stream prologue.
pub fn play_file(
    session: &Arc<Session>,
    cfg: &Config,
    path: &Path,
    handler: Box<dyn StreamHandler>,
) -> Result<(StreamInfo, String, String)> {
    let source = FileSource::new(session);
    source.open_source(path)?;
    let (info, name, date) = source.read_info()?;
    log::info!("play: \"{name}\" captured {date}, {} fps", info.fps);

    let compressed = Buffer::with_capacity(cfg.compressed_size);
    let uncompressed = Buffer::with_capacity(cfg.uncompressed_size);
    let color_out = Buffer::with_capacity(cfg.uncompressed_size);
    let scale_out = Buffer::with_capacity(cfg.uncompressed_size);

    let unpack_w = Unpack::new(session).start(&compressed, &uncompressed)?;
    let mut color = Color::new(session);
    if let Some(values) = cfg.color {
        color = color.with_override(values);
    }
    let color_w = color.start(&uncompressed, &color_out)?;
    let scale_w = Scale::new(session, cfg.scale).start(&color_out, &scale_out)?;
    let demux_w = Demux::new(session, handler)
        .with_video_size(cfg.uncompressed_size)
        .with_audio_size(cfg.uncompressed_size / 10)
        .start(&scale_out)?;

    source.read_into(&compressed)?;

    // Demux quits first; the others should follow it out.
    demux_w.wait()?;
    scale_w.wait()?;
    color_w.wait()?;
    unpack_w.wait()?;
    source.close_source()?;
    Ok((info, name, date))
}

/// Print stream information for `path`.
pub fn info_file(session: &Arc<Session>, cfg: &Config, path: &Path) -> Result<()> {
    let source = FileSource::new(session);
    source.open_source(path)?;
    let (info, name, date) = source.read_info()?;
    println!("name     = {name}");
    println!("date     = {date}");
    println!("version  = 0x{:02x}", info.version);
    println!("fps      = {}", info.fps);
    println!("pid      = {}", info.pid);

    let compressed = Buffer::with_capacity(cfg.compressed_size);
    let uncompressed = Buffer::with_capacity(cfg.uncompressed_size);
    let unpack_w = Unpack::new(session).start(&compressed, &uncompressed)?;
    let info_w = Info::new(session, cfg.info_level).start(&uncompressed)?;

    source.read_into(&compressed)?;

    info_w.wait()?;
    unpack_w.wait()?;
    source.close_source()
}

/// Capture-side assembly: a raw buffer feeding the compressor and the
/// file sink. Producers (audio capture, frame readback) write packets
/// into [`Recorder::buffer`].
pub struct Recorder {
    raw: Arc<Buffer>,
    sink: Arc<FileSink>,
    pack_worker: Option<Worker>,
    sink_worker: Option<Worker>,
}

impl Recorder {
    pub fn start(
        session: &Arc<Session>,
        cfg: &Config,
        path: &Path,
        fps: f64,
        app_name: &str,
    ) -> Result<Recorder> {
        let raw = Buffer::with_capacity(cfg.uncompressed_size);
        let sink = FileSink::new(session);
        sink.open_target(path)?;
        let info = StreamInfo::builder()
            .fps(fps)
            .pid(std::process::id())
            .build();
        sink.write_info(info, app_name, &date_string())?;

        // Rotation: a CALLBACK_REQUEST carrying the new path reaches
        // the sink in stream order; the retained state makes the new
        // file self-contained.
        {
            let sink2 = sink.clone();
            let name = app_name.to_string();
            sink.set_callback(move |payload| {
                let path = String::from_utf8_lossy(payload).to_string();
                let rotated = sink2
                    .write_eof()
                    .and_then(|_| sink2.close_target())
                    .and_then(|_| sink2.open_target(Path::new(&path)))
                    .and_then(|_| sink2.write_info(info, &name, &date_string()))
                    .and_then(|_| sink2.write_state());
                match rotated {
                    Ok(()) => log::info!("record: rotated to {path}"),
                    Err(e) => log::error!("record: can't rotate to {path}: {e}"),
                }
            });
        }

        let (pack_worker, sink_worker) = match cfg.codec {
            Some(codec) => {
                let packed = Buffer::with_capacity(cfg.compressed_size);
                let pack_w = Pack::new(session, codec)
                    .with_compress_min(cfg.compress_min)
                    .start(&raw, &packed)?;
                let sink_w = sink.start(&packed)?;
                (Some(pack_w), sink_w)
            }
            None => (None, sink.start(&raw)?),
        };

        Ok(Recorder {
            raw,
            sink,
            pack_worker,
            sink_worker: Some(sink_worker),
        })
    }

    /// The shared buffer producers write capture packets into.
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.raw
    }

    /// Ask the sink to continue into a fresh file, in stream order.
    pub fn rotate(&self, path: &Path) -> Result<()> {
        let mut pkt = Packet::new(&self.raw);
        pkt.open(Mode::Write)?;
        pkt.write(&[MessageType::CallbackRequest.tag()])?;
        pkt.write(path.to_string_lossy().as_bytes())?;
        pkt.close()
    }

    /// Send end-of-stream, drain the pipeline and close the target.
    pub fn stop(mut self) -> Result<()> {
        let mut pkt = Packet::new(&self.raw);
        pkt.open(Mode::Write)?;
        pkt.write(&[MessageType::Close.tag()])?;
        pkt.close()?;
        drop(pkt);

        if let Some(w) = self.pack_worker.take() {
            w.wait()?;
        }
        if let Some(w) = self.sink_worker.take() {
            w.wait()?;
        }
        self.sink.close_target()
    }
}

fn date_string() -> String {
    chrono::Utc::now().format("%a %b %e %H:%M:%S %Y UTC").to_string()
}

/// Totals one drain consumer observed for its stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamTotals {
    pub messages: u64,
    pub data_messages: u64,
    pub data_bytes: u64,
    pub time_monotonic: bool,
}

#[derive(Default)]
struct DrainShared {
    totals: Mutex<LiteMap<(MediaKind, i32), StreamTotals>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Stand-in player: spawns one consumer thread per stream that drains
/// packets until CLOSE and records totals. The real ALSA/GL players
/// plug in through the same [`StreamHandler`] contract.
pub struct DrainHandler {
    shared: Arc<DrainShared>,
}

/// Read-side view of a [`DrainHandler`], usable after the pipeline is
/// done.
pub struct DrainMonitor {
    shared: Arc<DrainShared>,
}

impl DrainHandler {
    pub fn new() -> DrainHandler {
        DrainHandler { shared: Arc::new(DrainShared::default()) }
    }

    pub fn monitor(&self) -> DrainMonitor {
        DrainMonitor { shared: self.shared.clone() }
    }
}

impl Default for DrainHandler {
    fn default() -> Self {
        DrainHandler::new()
    }
}

impl StreamHandler for DrainHandler {
    fn stream(&mut self, kind: MediaKind, id: i32, buffer: &Arc<Buffer>) -> Result<()> {
        let shared = self.shared.clone();
        let buffer = buffer.clone();
        let handle = std::thread::Builder::new()
            .name(format!("drain-{kind:?}-{id}"))
            .spawn(move || {
                let mut pkt = Packet::new(&buffer);
                let mut totals = StreamTotals { time_monotonic: true, ..Default::default() };
                let mut last_time = 0u64;
                loop {
                    if pkt.open(Mode::Read).is_err() {
                        break;
                    }
                    let mut tag = [0u8; 1];
                    if pkt.read_into(&mut tag).is_err() {
                        break;
                    }
                    let total = pkt.size().unwrap_or(1) as usize;
                    let body = match pkt.dma_read(total - 1) {
                        Ok(b) => b.to_vec(),
                        Err(_) => break,
                    };
                    let _ = pkt.close();
                    totals.messages += 1;
                    let time = match MessageType::try_from(tag[0]) {
                        Ok(MessageType::Close) => break,
                        Ok(MessageType::VideoFrame) => FrameHeader::decode_slice(&body)
                            .ok()
                            .map(|h| (h.time, body.len() as u64 - FrameHeader::WIRE_SIZE as u64)),
                        Ok(MessageType::AudioData) => AudioDataHeader::decode_slice(&body)
                            .ok()
                            .map(|h| (h.time, h.size)),
                        _ => None,
                    };
                    if let Some((time, bytes)) = time {
                        totals.data_messages += 1;
                        totals.data_bytes += bytes;
                        totals.time_monotonic &= time >= last_time;
                        last_time = time;
                    }
                }
                shared.totals.lock().insert((kind, id), totals);
            })
            .map_err(stream::Error::Io)?;
        self.shared.threads.lock().push(handle);
        Ok(())
    }
}

impl DrainMonitor {
    /// Join the consumer threads and collect their totals.
    pub fn finish(self) -> Vec<((MediaKind, i32), StreamTotals)> {
        let threads: Vec<_> = std::mem::take(&mut *self.shared.threads.lock());
        for t in threads {
            let _ = t.join();
        }
        self.shared
            .totals
            .lock()
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect()
    }
}
