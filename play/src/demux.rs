use std::sync::Arc;

use litemap::LiteMap;
use parking_lot::Mutex;

use container::{MessageType, StateTracker, payload_stream_id};
use stream::{Buffer, Error, Mode, Packet, Pass, Result, Session, Stage, Worker, worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MediaKind {
    Video,
    Audio,
}

fn media_kind(tag: u8) -> Option<MediaKind> {
    match MessageType::try_from(tag) {
        Ok(MessageType::VideoFormat | MessageType::VideoFrame | MessageType::Color) => {
            Some(MediaKind::Video)
        }
        Ok(MessageType::AudioFormat | MessageType::AudioData) => Some(MediaKind::Audio),
        _ => None,
    }
}

/// Collaborator notified once per distinct stream id; it owns the
/// consumer side of the handed-over buffer and typically runs its own
/// stage worker on it.
pub trait StreamHandler: Send {
    fn stream(&mut self, kind: MediaKind, id: i32, buffer: &Arc<Buffer>) -> Result<()>;
}

struct Route {
    buffer: Arc<Buffer>,
    packet: Packet,
}

/// Sink stage routing messages to one consumer buffer per stream id.
///
/// Format and COLOR messages are forwarded to the matching video
/// stream, data messages to their stream, and CLOSE is broadcast to
/// every attached buffer.
pub struct Demux {
    session: Arc<Session>,
    video_size: usize,
    audio_size: usize,
    handler: Mutex<Box<dyn StreamHandler>>,
    routes: Mutex<LiteMap<(MediaKind, i32), Route>>,
    tracker: StateTracker,
}

impl Demux {
    pub fn new(session: &Arc<Session>, handler: Box<dyn StreamHandler>) -> Demux {
        Demux {
            session: session.clone(),
            video_size: 1024 * 1024,
            audio_size: 1024 * 1024,
            handler: Mutex::new(handler),
            routes: Mutex::new(LiteMap::new()),
            tracker: StateTracker::new(),
        }
    }

    /// Format declarations seen so far, for consumers attached late.
    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    pub fn with_video_size(mut self, bytes: usize) -> Demux {
        self.video_size = bytes;
        self
    }

    pub fn with_audio_size(mut self, bytes: usize) -> Demux {
        self.audio_size = bytes;
        self
    }

    pub fn start(self, from: &Arc<Buffer>) -> Result<Worker> {
        let session = self.session.clone();
        worker::spawn(&session, &Arc::new(self), Some(from), None, 1)
    }

    fn route(&self, kind: MediaKind, tag: u8, payload: &[u8]) -> Result<()> {
        let Some(id) = payload_stream_id(payload) else {
            return Err(Error::BadMsg);
        };
        let mut routes = self.routes.lock();
        let key = (kind, id);
        if routes.get(&key).is_none() {
            let size = match kind {
                MediaKind::Video => self.video_size,
                MediaKind::Audio => self.audio_size,
            };
            log::info!("demux: new {kind:?} stream {id}");
            let buffer = Buffer::with_capacity(size);
            self.handler.lock().stream(kind, id, &buffer)?;
            let mut packet = Packet::new(&buffer);
            // Bring the consumer up to date: replay the retained
            // declarations for this stream ahead of the message that
            // announced it. The triggering message itself is skipped,
            // it is forwarded right below.
            self.tracker.visit(&mut |t, p| {
                if t == tag || media_kind(t) != Some(kind) || payload_stream_id(p) != Some(id) {
                    return Ok(());
                }
                packet.open(Mode::Write)?;
                packet.write(&[t])?;
                packet.write(p)?;
                packet.close()
            })?;
            routes.insert(key, Route { packet, buffer });
        }
        let route = routes.get_mut(&key).expect("route just ensured");
        let pkt = &mut route.packet;
        pkt.open(Mode::Write)?;
        pkt.write(&[tag])?;
        pkt.write(payload)?;
        pkt.close()
    }

    fn broadcast_close(&self) -> Result<()> {
        let mut routes = self.routes.lock();
        for (_key, route) in routes.iter_mut() {
            let pkt = &mut route.packet;
            pkt.open(Mode::Write)?;
            pkt.write(&[MessageType::Close.tag()])?;
            pkt.close()?;
        }
        Ok(())
    }
}

impl Stage for Demux {
    type Ctx = ();

    fn name(&self) -> &'static str {
        "demux"
    }

    fn context(&self) -> Result<()> {
        Ok(())
    }

    fn read(&self, _ctx: &mut (), pass: &mut Pass, data: &[u8]) -> Result<()> {
        self.tracker.submit(pass.header, data);
        match MessageType::try_from(pass.header) {
            Ok(MessageType::Close) => self.broadcast_close(),
            Ok(MessageType::VideoFormat | MessageType::VideoFrame | MessageType::Color) => {
                self.route(MediaKind::Video, pass.header, data)
            }
            Ok(MessageType::AudioFormat | MessageType::AudioData) => {
                self.route(MediaKind::Audio, pass.header, data)
            }
            Ok(MessageType::CallbackRequest) => Ok(()),
            // Codec-tagged or unknown packets mean the stream was not
            // decompressed upstream.
            _ => Err(Error::BadMsg),
        }
    }

    fn finish(&self, err: Option<&Error>) {
        if let Some(e) = err {
            log::error!("demux: {e}");
            let routes = self.routes.lock();
            for (_key, route) in routes.iter() {
                route.buffer.cancel();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use container::{AUDIO_INTERLEAVED, AudioDataHeader, AudioFormat, Codable, SampleFormat};
    use std::thread;

    fn post(buf: &Arc<Buffer>, tag: u8, body: &[u8]) {
        let mut pkt = Packet::new(buf);
        pkt.open(Mode::Write).unwrap();
        pkt.write(&[tag]).unwrap();
        pkt.write(body).unwrap();
        pkt.close().unwrap();
    }

    struct Collector {
        outputs: Arc<Mutex<Vec<(MediaKind, i32, thread::JoinHandle<(u64, bool)>)>>>,
    }

    impl StreamHandler for Collector {
        fn stream(&mut self, kind: MediaKind, id: i32, buffer: &Arc<Buffer>) -> Result<()> {
            let buffer = buffer.clone();
            // Per-stream consumer: count data messages, verify time
            // never goes backwards.
            let handle = thread::spawn(move || {
                let mut pkt = Packet::new(&buffer);
                let mut data_messages = 0u64;
                let mut last_time = 0u64;
                let mut monotonic = true;
                loop {
                    pkt.open(Mode::Read).unwrap();
                    let mut tag = [0u8; 1];
                    pkt.read_into(&mut tag).unwrap();
                    let total = pkt.size().unwrap() as usize;
                    let body = pkt.dma_read(total - 1).unwrap().to_vec();
                    pkt.close().unwrap();
                    match MessageType::try_from(tag[0]) {
                        Ok(MessageType::Close) => break,
                        Ok(MessageType::AudioData) => {
                            let hdr = AudioDataHeader::decode_slice(&body).unwrap();
                            monotonic &= hdr.time >= last_time;
                            last_time = hdr.time;
                            data_messages += 1;
                        }
                        _ => {}
                    }
                }
                (data_messages, monotonic)
            });
            self.outputs.lock().push((kind, id, handle));
            Ok(())
        }
    }

    #[test]
    fn two_audio_streams_route_exactly() {
        let session = Session::new();
        let input = Buffer::with_capacity(1 << 18);
        let outputs = Arc::new(Mutex::new(Vec::new()));
        let demux = Demux::new(&session, Box::new(Collector { outputs: outputs.clone() }))
            .with_audio_size(1 << 16);
        let worker = demux.start(&input).unwrap();

        // Two producer threads interleave writes for their own stream.
        let n = 500u64;
        let producers: Vec<_> = [1i32, 2]
            .into_iter()
            .map(|id| {
                let input = input.clone();
                thread::spawn(move || {
                    let fmt = AudioFormat {
                        id,
                        flags: AUDIO_INTERLEAVED,
                        rate: 44_100,
                        channels: 2,
                        format: SampleFormat::S16Le,
                    };
                    post(&input, MessageType::AudioFormat.tag(), &fmt.encode_vec());
                    for i in 0..n {
                        let hdr = AudioDataHeader { id, time: i * 100, size: 8 };
                        let mut body = hdr.encode_vec();
                        body.extend_from_slice(&[id as u8; 8]);
                        post(&input, MessageType::AudioData.tag(), &body);
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        post(&input, MessageType::Close.tag(), &[]);

        worker.wait().unwrap();
        let mut outputs = outputs.lock();
        assert_eq!(outputs.len(), 2);
        for (kind, _id, handle) in outputs.drain(..) {
            assert_eq!(kind, MediaKind::Audio);
            let (count, monotonic) = handle.join().unwrap();
            assert_eq!(count, n);
            assert!(monotonic);
        }
    }

    #[test]
    fn color_goes_to_the_video_stream() {
        let session = Session::new();
        let input = Buffer::with_capacity(4096);
        let seen = Arc::new(Mutex::new(Vec::new()));

        struct Recording {
            seen: Arc<Mutex<Vec<(MediaKind, i32, Arc<Buffer>)>>>,
        }
        impl StreamHandler for Recording {
            fn stream(&mut self, kind: MediaKind, id: i32, buffer: &Arc<Buffer>) -> Result<()> {
                self.seen.lock().push((kind, id, buffer.clone()));
                Ok(())
            }
        }

        let demux = Demux::new(&session, Box::new(Recording { seen: seen.clone() }));
        let worker = demux.start(&input).unwrap();

        let color = container::ColorSetup {
            id: 3,
            brightness: 0.0,
            contrast: 0.0,
            red: 1.0,
            green: 1.0,
            blue: 1.0,
        };
        post(&input, MessageType::Color.tag(), &color.encode_vec());
        post(&input, MessageType::Close.tag(), &[]);
        worker.wait().unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!((seen[0].0, seen[0].1), (MediaKind::Video, 3));
        // COLOR first, then the broadcast CLOSE.
        let mut pkt = Packet::new(&seen[0].2);
        pkt.open(Mode::Read).unwrap();
        let mut tag = [0u8; 1];
        pkt.read_into(&mut tag).unwrap();
        assert_eq!(tag[0], MessageType::Color.tag());
        pkt.close().unwrap();
        pkt.open(Mode::Read).unwrap();
        pkt.read_into(&mut tag).unwrap();
        assert_eq!(tag[0], MessageType::Close.tag());
        pkt.close().unwrap();
    }

    #[test]
    fn late_stream_is_caught_up_from_retained_state() {
        let session = Session::new();
        let input = Buffer::with_capacity(4096);
        let seen = Arc::new(Mutex::new(Vec::new()));

        struct Recording {
            seen: Arc<Mutex<Vec<(MediaKind, i32, Arc<Buffer>)>>>,
        }
        impl StreamHandler for Recording {
            fn stream(&mut self, kind: MediaKind, id: i32, buffer: &Arc<Buffer>) -> Result<()> {
                self.seen.lock().push((kind, id, buffer.clone()));
                Ok(())
            }
        }

        let demux = Demux::new(&session, Box::new(Recording { seen: seen.clone() }));
        // State retained before this demux saw the stream itself, as
        // after a mid-stream attach.
        let vf = container::VideoFormat {
            id: 5,
            flags: 0,
            width: 8,
            height: 8,
            format: container::PixelFormat::Bgr24,
        };
        let color = container::ColorSetup {
            id: 5,
            brightness: 0.5,
            contrast: 0.0,
            red: 1.0,
            green: 1.0,
            blue: 1.0,
        };
        demux.tracker().submit(MessageType::VideoFormat.tag(), &vf.encode_vec());
        demux.tracker().submit(MessageType::Color.tag(), &color.encode_vec());
        let worker = demux.start(&input).unwrap();

        let mut frame = container::FrameHeader { id: 5, time: 0 }.encode_vec();
        frame.extend_from_slice(&[0u8; 192]);
        post(&input, MessageType::VideoFrame.tag(), &frame);
        post(&input, MessageType::Close.tag(), &[]);
        worker.wait().unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let mut pkt = Packet::new(&seen[0].2);
        let mut tags = Vec::new();
        loop {
            pkt.open(Mode::Read).unwrap();
            let mut tag = [0u8; 1];
            pkt.read_into(&mut tag).unwrap();
            let total = pkt.size().unwrap() as usize;
            let body = pkt.dma_read(total - 1).unwrap().to_vec();
            pkt.close().unwrap();
            tags.push(tag[0]);
            if tag[0] == MessageType::Close.tag() {
                break;
            }
            if tag[0] == MessageType::VideoFormat.tag() {
                assert_eq!(container::VideoFormat::decode_slice(&body).unwrap(), vf);
            }
        }
        assert_eq!(
            tags,
            vec![
                MessageType::VideoFormat.tag(),
                MessageType::Color.tag(),
                MessageType::VideoFrame.tag(),
                MessageType::Close.tag(),
            ]
        );
    }

    #[test]
    fn compressed_input_is_a_bad_message() {
        let session = Session::new();
        let input = Buffer::with_capacity(4096);
        struct Nop;
        impl StreamHandler for Nop {
            fn stream(&mut self, _k: MediaKind, _id: i32, _b: &Arc<Buffer>) -> Result<()> {
                Ok(())
            }
        }
        let worker = Demux::new(&session, Box::new(Nop)).start(&input).unwrap();
        post(&input, MessageType::Lz4.tag(), &[0u8; 16]);
        assert!(matches!(worker.wait(), Err(Error::BadMsg)));
    }
}
