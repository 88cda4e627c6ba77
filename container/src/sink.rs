use std::fs::{File, TryLockError};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};
use parking_lot::Mutex;

use stream::{Buffer, Error, Pass, Result, Session, Stage, Worker, worker};

use crate::{Codable, ContainerHeader, MessageType, StateTracker, StreamInfo};

type Callback = Box<dyn Fn(&[u8]) + Send + Sync>;

struct Inner {
    file: Option<File>,
    writing: bool,
    running: bool,
    info_written: bool,
}

/// Stage worker writing container-framed packets to a locked stream
/// file.
///
/// Lifecycle: acquire a target (`open_target`/`set_target`, which takes
/// an exclusive advisory lock and truncates), `write_info`, then `start`
/// a single worker thread over the input buffer. CONTAINER payloads are
/// written verbatim (they already carry the frame prefix); every other
/// message gets a synthesized `size | header | payload` frame.
/// CALLBACK_REQUEST messages are never persisted; while the registered
/// callback runs the running flag is cleared so it may rotate the
/// target.
pub struct FileSink {
    session: Arc<Session>,
    inner: Mutex<Inner>,
    tracker: StateTracker,
    callback: Mutex<Option<Callback>>,
}

impl FileSink {
    pub fn new(session: &Arc<Session>) -> Arc<FileSink> {
        Arc::new(FileSink {
            session: session.clone(),
            inner: Mutex::new(Inner {
                file: None,
                writing: false,
                running: false,
                info_written: false,
            }),
            tracker: StateTracker::new(),
            callback: Mutex::new(None),
        })
    }

    /// Register the CALLBACK_REQUEST handler; it receives the opaque
    /// request payload.
    pub fn set_callback(&self, cb: impl Fn(&[u8]) + Send + Sync + 'static) {
        *self.callback.lock() = Some(Box::new(cb));
    }

    pub fn open_target(&self, path: &Path) -> Result<()> {
        log::info!("file: opening {} for writing stream", path.display());
        let file = File::options()
            .create(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                log::error!("file: can't open {}: {e}", path.display());
                Error::Io(e)
            })?;
        self.set_target(file)
    }

    /// Adopt `file` as the write target: lock it exclusively, then
    /// truncate it.
    pub fn set_target(&self, mut file: File) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.file.is_some() {
            return Err(Error::Busy);
        }
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                log::error!("file: target is locked by another process");
                return Err(Error::Busy);
            }
            Err(TryLockError::Error(e)) => {
                log::error!("file: can't lock target: {e}");
                return Err(Error::Io(e));
            }
        }
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        inner.file = Some(file);
        inner.writing = true;
        Ok(())
    }

    pub fn close_target(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.file.is_none() || inner.running || !inner.writing {
            return Err(Error::Again);
        }
        let file = inner.file.take().expect("checked above");
        if let Err(e) = file.unlock() {
            log::warn!("file: can't unlock target: {e}");
        }
        inner.writing = false;
        inner.info_written = false;
        Ok(())
    }

    /// Write the stream prologue. The name/date sizes are filled in from
    /// the given strings.
    pub fn write_info(&self, info: StreamInfo, name: &str, date: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.file.is_none() || inner.running || !inner.writing {
            return Err(Error::Again);
        }
        let mut info = info;
        info.name_size = name.len() as u32;
        info.date_size = date.len() as u32;
        let file = inner.file.as_mut().expect("checked above");
        let res = (|| -> Result<()> {
            info.encode_into(file)?;
            file.write_all(name.as_bytes())?;
            file.write_all(date.as_bytes())?;
            Ok(())
        })();
        if let Err(e) = res {
            log::error!("file: can't write stream information: {e}");
            return Err(e);
        }
        inner.info_written = true;
        Ok(())
    }

    fn write_frame(file: &mut File, tag: u8, payload: &[u8]) -> Result<()> {
        file.write_u64::<LittleEndian>(payload.len() as u64)?;
        file.write_all(&[tag])?;
        file.write_all(payload)?;
        Ok(())
    }

    /// Append a CLOSE frame.
    pub fn write_eof(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.file.is_none() || inner.running || !inner.writing {
            log::error!("file: can't write end of stream, no target");
            return Err(Error::Again);
        }
        let file = inner.file.as_mut().expect("checked above");
        Self::write_frame(file, MessageType::Close.tag(), &[])
    }

    /// Replay every retained format declaration into the target, making
    /// a freshly rotated file self-contained.
    pub fn write_state(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.file.is_none() || inner.running || !inner.writing {
            return Err(Error::Again);
        }
        let file = inner.file.as_mut().expect("checked above");
        self.tracker.visit(&mut |tag, payload| Self::write_frame(file, tag, payload))
    }

    /// Spawn the single sink worker thread over `from`.
    pub fn start(self: &Arc<Self>, from: &Arc<Buffer>) -> Result<Worker> {
        {
            let mut inner = self.inner.lock();
            if inner.file.is_none() || inner.running || !inner.writing || !inner.info_written {
                return Err(Error::Again);
            }
            inner.running = true;
        }
        worker::spawn(&self.session, self, Some(from), None, 1)
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }
}

impl Stage for FileSink {
    type Ctx = ();

    fn name(&self) -> &'static str {
        "file"
    }

    fn context(&self) -> Result<()> {
        Ok(())
    }

    fn read(&self, _ctx: &mut (), pass: &mut Pass, data: &[u8]) -> Result<()> {
        self.tracker.submit(pass.header, data);

        match MessageType::try_from(pass.header) {
            Ok(MessageType::CallbackRequest) => {
                let cb = self.callback.lock();
                if let Some(cb) = cb.as_ref() {
                    // The callback may rotate the target file.
                    self.inner.lock().running = false;
                    cb(data);
                    self.inner.lock().running = true;
                }
                Ok(())
            }
            Ok(MessageType::Container) => {
                let hdr = ContainerHeader::decode_slice(data).map_err(|_| Error::BadMsg)?;
                let total = ContainerHeader::WIRE_SIZE + hdr.size as usize;
                if total > data.len() {
                    return Err(Error::BadMsg);
                }
                let mut inner = self.inner.lock();
                let file = inner.file.as_mut().ok_or(Error::Again)?;
                file.write_all(&data[..total])?;
                Ok(())
            }
            _ => {
                let mut inner = self.inner.lock();
                let file = inner.file.as_mut().ok_or(Error::Again)?;
                Self::write_frame(file, pass.header, data)
            }
        }
    }

    fn finish(&self, err: Option<&Error>) {
        if let Some(e) = err {
            log::error!("file: {e}");
        }
        self.inner.lock().running = false;
    }
}
