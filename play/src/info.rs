use std::sync::Arc;

use litemap::LiteMap;
use parking_lot::Mutex;

use container::{
    AudioDataHeader, AudioFormat, Codable, ColorSetup, FrameHeader, MessageType, VideoFormat,
};
use stream::{Buffer, Error, Pass, Result, Session, Stage, Worker, worker};

use crate::demux::MediaKind;

#[derive(Default, Clone, Copy)]
struct StreamStat {
    messages: u64,
    bytes: u64,
    first_time: Option<u64>,
    last_time: u64,
}

#[derive(Default)]
struct Totals {
    streams: LiteMap<(MediaKind, i32), StreamStat>,
    messages: u64,
}

/// Stream summary sink: prints formats as they appear and per-stream
/// totals at the end. Level 2 and above also prints every data
/// message.
pub struct Info {
    session: Arc<Session>,
    level: u32,
    totals: Mutex<Totals>,
}

impl Info {
    pub fn new(session: &Arc<Session>, level: u32) -> Info {
        Info {
            session: session.clone(),
            level,
            totals: Mutex::new(Totals::default()),
        }
    }

    pub fn start(self, from: &Arc<Buffer>) -> Result<Worker> {
        let session = self.session.clone();
        worker::spawn(&session, &Arc::new(self), Some(from), None, 1)
    }

    fn data(&self, kind: MediaKind, id: i32, time: u64, bytes: u64) {
        let mut totals = self.totals.lock();
        let key = (kind, id);
        if totals.streams.get(&key).is_none() {
            totals.streams.insert(key, StreamStat::default());
        }
        let stat = totals.streams.get_mut(&key).expect("just ensured");
        stat.messages += 1;
        stat.bytes += bytes;
        stat.first_time.get_or_insert(time);
        stat.last_time = time;
    }
}

impl Stage for Info {
    type Ctx = ();

    fn name(&self) -> &'static str {
        "info"
    }

    fn context(&self) -> Result<()> {
        Ok(())
    }

    fn read(&self, _ctx: &mut (), pass: &mut Pass, data: &[u8]) -> Result<()> {
        self.totals.lock().messages += 1;
        match MessageType::try_from(pass.header) {
            Ok(MessageType::VideoFormat) => {
                let vf = VideoFormat::decode_slice(data).map_err(|_| Error::BadMsg)?;
                println!(
                    "video stream {}: {}x{}, {:?}, flags 0x{:02x}",
                    vf.id, vf.width, vf.height, vf.format, vf.flags
                );
            }
            Ok(MessageType::AudioFormat) => {
                let af = AudioFormat::decode_slice(data).map_err(|_| Error::BadMsg)?;
                println!(
                    "audio stream {}: {} Hz, {} channels, {:?}, flags 0x{:02x}",
                    af.id, af.rate, af.channels, af.format, af.flags
                );
            }
            Ok(MessageType::Color) => {
                let c = ColorSetup::decode_slice(data).map_err(|_| Error::BadMsg)?;
                println!(
                    "color for stream {}: brightness={}, contrast={}, gamma=({}, {}, {})",
                    c.id, c.brightness, c.contrast, c.red, c.green, c.blue
                );
            }
            Ok(MessageType::VideoFrame) => {
                let hdr = FrameHeader::decode_slice(data).map_err(|_| Error::BadMsg)?;
                if self.level >= 2 {
                    println!(
                        "video frame: stream {}, time {} us, {} bytes",
                        hdr.id,
                        hdr.time,
                        data.len() - FrameHeader::WIRE_SIZE
                    );
                }
                self.data(MediaKind::Video, hdr.id, hdr.time, (data.len() - FrameHeader::WIRE_SIZE) as u64);
            }
            Ok(MessageType::AudioData) => {
                let hdr = AudioDataHeader::decode_slice(data).map_err(|_| Error::BadMsg)?;
                if self.level >= 2 {
                    println!(
                        "audio data: stream {}, time {} us, {} bytes",
                        hdr.id, hdr.time, hdr.size
                    );
                }
                self.data(MediaKind::Audio, hdr.id, hdr.time, hdr.size);
            }
            Ok(MessageType::Close) => println!("end of stream"),
            _ => {
                if self.level >= 2 {
                    println!("message 0x{:02x}, {} bytes", pass.header, data.len());
                }
            }
        }
        Ok(())
    }

    fn finish(&self, err: Option<&Error>) {
        if let Some(e) = err {
            log::error!("info: {e}");
            return;
        }
        let totals = self.totals.lock();
        println!("{} messages total", totals.messages);
        for (key, stat) in totals.streams.iter() {
            let (kind, id) = key;
            let span = stat.last_time.saturating_sub(stat.first_time.unwrap_or(0));
            println!(
                "{kind:?} stream {id}: {} data messages, {} bytes, {:.3} s",
                stat.messages,
                stat.bytes,
                span as f64 / 1_000_000.0
            );
        }
    }
}
