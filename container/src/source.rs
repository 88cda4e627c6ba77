use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};
use parking_lot::Mutex;

use stream::{Buffer, Error, Mode, Packet, Result, Session};

use crate::{Codable, MessageType, SIGNATURE, STREAM_VERSION, STREAM_VERSION_SWAPPED, StreamInfo};

struct Inner {
    file: Option<File>,
    version: u32,
    info_read: bool,
    info_valid: bool,
}

/// Replays a stream file into a packet buffer.
///
/// After `read_info` validates the prologue, `read_into` runs on the
/// caller thread, writing one packet per frame until CLOSE or
/// cancellation. A truncated file yields a synthetic CLOSE so
/// downstream stages unwind normally.
pub struct FileSource {
    session: Arc<Session>,
    inner: Mutex<Inner>,
}

/// Current version is always supported; 0x3 differs only in the frame
/// field order.
pub fn test_stream_version(version: u32) -> Result<()> {
    match version {
        STREAM_VERSION | STREAM_VERSION_SWAPPED => Ok(()),
        _ => Err(Error::NotSup),
    }
}

impl FileSource {
    pub fn new(session: &Arc<Session>) -> FileSource {
        FileSource {
            session: session.clone(),
            inner: Mutex::new(Inner {
                file: None,
                version: STREAM_VERSION,
                info_read: false,
                info_valid: false,
            }),
        }
    }

    pub fn open_source(&self, path: &Path) -> Result<()> {
        log::info!("file: opening {} for reading stream", path.display());
        let file = File::open(path).map_err(|e| {
            log::error!("file: can't open {}: {e}", path.display());
            Error::Io(e)
        })?;
        self.set_source(file)
    }

    pub fn set_source(&self, file: File) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.file.is_some() {
            return Err(Error::Busy);
        }
        inner.file = Some(file);
        Ok(())
    }

    pub fn close_source(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            return Err(Error::Again);
        }
        inner.file = None;
        inner.info_read = false;
        inner.info_valid = false;
        Ok(())
    }

    /// Read and validate the prologue; returns the info structure plus
    /// the program name and date strings.
    pub fn read_info(&self) -> Result<(StreamInfo, String, String)> {
        let mut inner = self.inner.lock();
        let Some(file) = inner.file.as_mut() else {
            return Err(Error::Again);
        };
        let info = StreamInfo::decode_from(file).map_err(|e| {
            log::error!("file: can't read stream info header: {e}");
            Error::Io(e)
        })?;
        inner.info_read = true;

        if info.signature != SIGNATURE {
            log::error!(
                "file: signature 0x{:08x} does not match 0x{SIGNATURE:08x}",
                info.signature
            );
            return Err(Error::Inval);
        }
        if test_stream_version(info.version).is_err() {
            log::error!("file: unsupported stream version 0x{:02x}", info.version);
            return Err(Error::NotSup);
        }
        log::info!("file: stream version 0x{:02x}", info.version);
        inner.version = info.version;

        let file = inner.file.as_mut().expect("checked above");
        let mut name = vec![0u8; info.name_size as usize];
        file.read_exact(&mut name)?;
        let mut date = vec![0u8; info.date_size as usize];
        file.read_exact(&mut date)?;
        inner.info_valid = true;

        let name = String::from_utf8_lossy(&name).trim_end_matches('\0').to_string();
        let date = String::from_utf8_lossy(&date).trim_end_matches('\0').to_string();
        Ok((info, name, date))
    }

    /// Replay every frame into `to` as packets. Runs on the caller
    /// thread until CLOSE, cancellation or end of file.
    pub fn read_into(&self, to: &Arc<Buffer>) -> Result<()> {
        let (mut file, version) = {
            let mut inner = self.inner.lock();
            if inner.file.is_none() {
                return Err(Error::Again);
            }
            if !inner.info_read {
                log::error!("file: stream info header not read");
                return Err(Error::Again);
            }
            if !inner.info_valid {
                log::error!("file: stream info header not valid");
                inner.info_read = false;
                return Err(Error::Inval);
            }
            (inner.file.take().expect("checked above"), inner.version)
        };

        let res = self.replay(&mut file, version, to);

        let mut inner = self.inner.lock();
        inner.file = Some(file);
        inner.info_read = false;
        inner.info_valid = false;
        res
    }

    fn replay(&self, file: &mut File, version: u32, to: &Arc<Buffer>) -> Result<()> {
        let mut packet = Packet::new(to);
        loop {
            let (tag, size) = match read_frame_prefix(file, version) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    send_close(&mut packet)?;
                    log::error!("file: unexpected EOF");
                    return Ok(());
                }
                Err(e) => {
                    to.cancel();
                    log::error!("file: {e}");
                    return Err(Error::Io(e));
                }
            };

            let res: Result<()> = (|| {
                packet.open(Mode::Write)?;
                packet.write(&[tag])?;
                if size > 0 {
                    let dma = packet.dma_write(size as usize)?;
                    file.read_exact(dma).map_err(Error::Io)?;
                }
                packet.close()?;
                Ok(())
            })();

            match res {
                Ok(()) => {}
                Err(Error::Canceled) => return Ok(()),
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    // Roll back the half-written packet before the
                    // synthetic CLOSE.
                    packet = Packet::new(to);
                    send_close(&mut packet)?;
                    log::error!("file: unexpected EOF");
                    return Ok(());
                }
                Err(e) => {
                    to.cancel();
                    log::error!("file: {e} (packet size {size})");
                    return Err(e);
                }
            }

            if tag == MessageType::Close.tag() || self.session.is_cancelled() {
                return Ok(());
            }
        }
    }
}

fn read_frame_prefix(file: &mut File, version: u32) -> io::Result<(u8, u64)> {
    if version == STREAM_VERSION_SWAPPED {
        let tag = file.read_u8()?;
        let size = file.read_u64::<LittleEndian>()?;
        Ok((tag, size))
    } else {
        let size = file.read_u64::<LittleEndian>()?;
        let tag = file.read_u8()?;
        Ok((tag, size))
    }
}

fn send_close(packet: &mut Packet) -> Result<()> {
    packet.open(Mode::Write)?;
    packet.write(&[MessageType::Close.tag()])?;
    packet.close()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sink::FileSink;
    use crate::{AudioFormat, SampleFormat, VideoFormat, PixelFormat, AUDIO_INTERLEAVED};
    use std::io::Write as _;
    use std::path::PathBuf;

    fn post(buf: &Arc<Buffer>, tag: u8, body: &[u8]) {
        let mut pkt = Packet::new(buf);
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
            let done = tag[0] == MessageType::Close.tag();
            out.push((tag[0], body));
            if done {
                break;
            }
        }
        out
    }

    fn write_fixture(dir: &tempfile::TempDir) -> (PathBuf, Vec<(u8, Vec<u8>)>) {
        let path = dir.path().join("fixture.glc");
        let session = Session::new();
        let sink = FileSink::new(&session);
        sink.open_target(&path).unwrap();
        sink.write_info(
            StreamInfo::builder().fps(60.0).pid(7).build(),
            "app",
            "2020-01-01",
        )
        .unwrap();

        let vf = VideoFormat {
            id: 1,
            flags: 0,
            width: 4,
            height: 2,
            format: PixelFormat::Bgr24,
        };
        let mut messages = vec![(MessageType::VideoFormat.tag(), vf.encode_vec())];
        for (i, shade) in [0x10u8, 0x20, 0x30].iter().enumerate() {
            let hdr = crate::FrameHeader { id: 1, time: i as u64 * 16_667 };
            let mut body = hdr.encode_vec();
            body.extend(std::iter::repeat_n(*shade, vf.frame_size()));
            messages.push((MessageType::VideoFrame.tag(), body));
        }
        messages.push((MessageType::Close.tag(), Vec::new()));

        let buf = Buffer::with_capacity(4096);
        let worker = sink.start(&buf).unwrap();
        for (tag, body) in &messages {
            post(&buf, *tag, body);
        }
        worker.wait().unwrap();
        sink.close_target().unwrap();
        (path, messages)
    }

    #[test]
    fn file_roundtrip_preserves_messages() {
        let dir = tempfile::tempdir().unwrap();
        let (path, messages) = write_fixture(&dir);

        let session = Session::new();
        let source = FileSource::new(&session);
        source.open_source(&path).unwrap();
        let (info, name, date) = source.read_info().unwrap();
        assert_eq!(info.fps, 60.0);
        assert_eq!(info.pid, 7);
        assert_eq!(name, "app");
        assert_eq!(date, "2020-01-01");

        let out = Buffer::with_capacity(4096);
        source.read_into(&out).unwrap();
        assert_eq!(drain(&out), messages);
        source.close_source().unwrap();
    }

    #[test]
    fn version_3_frames_decode_with_swapped_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v3.glc");

        let af = AudioFormat {
            id: 1,
            flags: AUDIO_INTERLEAVED,
            rate: 44_100,
            channels: 2,
            format: SampleFormat::S16Le,
        };
        let body = af.encode_vec();
        {
            let mut f = File::create(&path).unwrap();
            let info = StreamInfo::builder().version(STREAM_VERSION_SWAPPED).build();
            info.encode_into(&mut f).unwrap();
            // v3 frame: header byte first, then size.
            f.write_all(&[MessageType::AudioFormat.tag()]).unwrap();
            f.write_all(&(body.len() as u64).to_le_bytes()).unwrap();
            f.write_all(&body).unwrap();
            f.write_all(&[MessageType::Close.tag()]).unwrap();
            f.write_all(&0u64.to_le_bytes()).unwrap();
        }

        let session = Session::new();
        let source = FileSource::new(&session);
        source.open_source(&path).unwrap();
        let (info, _, _) = source.read_info().unwrap();
        assert_eq!(info.version, STREAM_VERSION_SWAPPED);

        let out = Buffer::with_capacity(1024);
        source.read_into(&out).unwrap();
        let got = drain(&out);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], (MessageType::AudioFormat.tag(), body));
        assert_eq!(got[1].0, MessageType::Close.tag());
    }

    #[test]
    fn truncated_file_yields_synthetic_close() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = write_fixture(&dir);

        // Cut the file in the middle of the second frame's payload.
        let len = std::fs::metadata(&path).unwrap().len();
        let f = File::options().write(true).open(&path).unwrap();
        f.set_len(len - 20).unwrap();
        drop(f);

        let session = Session::new();
        let source = FileSource::new(&session);
        source.open_source(&path).unwrap();
        source.read_info().unwrap();

        let out = Buffer::with_capacity(4096);
        source.read_into(&out).unwrap();
        let got = drain(&out);
        assert_eq!(got.last().unwrap().0, MessageType::Close.tag());
        // Format + first two complete frames survive, nothing else.
        assert!(got.len() < 5);
        assert_eq!(got[0].0, MessageType::VideoFormat.tag());
    }

    #[test]
    fn bad_signature_and_version_are_rejected() {
        let dir = tempfile::tempdir().unwrap();

        let bad_sig = dir.path().join("sig.glc");
        let info = StreamInfo::builder().signature(0xdead_beef).build();
        std::fs::write(&bad_sig, info.encode_vec()).unwrap();
        let session = Session::new();
        let source = FileSource::new(&session);
        source.open_source(&bad_sig).unwrap();
        assert!(matches!(source.read_info(), Err(Error::Inval)));
        source.close_source().unwrap();

        let bad_ver = dir.path().join("ver.glc");
        let info = StreamInfo::builder().version(0x9).build();
        std::fs::write(&bad_ver, info.encode_vec()).unwrap();
        source.open_source(&bad_ver).unwrap();
        assert!(matches!(source.read_info(), Err(Error::NotSup)));
    }

    #[test]
    fn read_without_info_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = write_fixture(&dir);
        let session = Session::new();
        let source = FileSource::new(&session);
        source.open_source(&path).unwrap();
        let out = Buffer::with_capacity(1024);
        assert!(matches!(source.read_into(&out), Err(Error::Again)));
    }

    #[test]
    fn write_state_makes_rotated_file_self_contained() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new();
        let sink = FileSink::new(&session);
        sink.open_target(&dir.path().join("first.glc")).unwrap();
        sink.write_info(StreamInfo::builder().build(), "app", "d").unwrap();

        let af = AudioFormat {
            id: 1,
            flags: AUDIO_INTERLEAVED,
            rate: 48_000,
            channels: 2,
            format: SampleFormat::S16Le,
        };
        let buf = Buffer::with_capacity(2048);
        let worker = sink.start(&buf).unwrap();
        post(&buf, MessageType::AudioFormat.tag(), &af.encode_vec());
        post(&buf, MessageType::Close.tag(), &[]);
        worker.wait().unwrap();
        sink.close_target().unwrap();

        // Rotate: the new file gets the prologue plus the tracked state.
        let second = dir.path().join("second.glc");
        sink.open_target(&second).unwrap();
        sink.write_info(StreamInfo::builder().build(), "app", "d").unwrap();
        sink.write_state().unwrap();
        sink.write_eof().unwrap();
        sink.close_target().unwrap();

        let source = FileSource::new(&session);
        source.open_source(&second).unwrap();
        source.read_info().unwrap();
        let out = Buffer::with_capacity(1024);
        source.read_into(&out).unwrap();
        let got = drain(&out);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], (MessageType::AudioFormat.tag(), af.encode_vec()));
    }
}
