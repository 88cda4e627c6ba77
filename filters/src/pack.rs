use std::sync::Arc;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use zstd::zstd_safe;

use container::{Codable, CodecHeader, ContainerHeader, MessageType};
use stream::{Buffer, Error, Pass, Result, Session, Stage, Worker, threads_hint, worker};

/// Payloads at or below this size pass through uncompressed.
pub const DEFAULT_COMPRESS_MIN: usize = 1024;

/// Combined size of the container prefix and the codec header in a
/// compressed packet.
const HDRS: usize = ContainerHeader::WIRE_SIZE + CodecHeader::WIRE_SIZE;

/// Stream codec, fixed at compressor construction and carried in the
/// container tag so mixed files decode correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Lz4,
    Zstd,
    Deflate,
}

impl Codec {
    pub fn tag(self) -> MessageType {
        match self {
            Codec::Lz4 => MessageType::Lz4,
            Codec::Zstd => MessageType::Zstd,
            Codec::Deflate => MessageType::Deflate,
        }
    }

    /// Upper bound on compressed output for `size` input bytes, used to
    /// pre-size the write packet.
    pub fn worst_case(self, size: usize) -> usize {
        match self {
            Codec::Lz4 => lz4_flex::block::get_maximum_output_size(size),
            Codec::Zstd => zstd_safe::compress_bound(size),
            // Raw deflate stored blocks cost 5 bytes per 64 KiB; this
            // bound is far above that.
            Codec::Deflate => size + size / 16 + 64 + 3,
        }
    }
}

/// Per-thread compression scratch, allocated once per worker thread.
pub enum PackCtx {
    Lz4,
    Zstd {
        compressor: zstd::bulk::Compressor<'static>,
        scratch: Vec<u8>,
    },
    Deflate(Compress),
}

/// Compressor stage: wraps large audio and video payloads in a
/// CONTAINER message whose nested frame carries the codec tag, the
/// uncompressed size, the original header and the compressed bytes.
/// Everything else is copied through.
pub struct Pack {
    session: Arc<Session>,
    codec: Codec,
    compress_min: usize,
    threads: usize,
}

impl Pack {
    pub fn new(session: &Arc<Session>, codec: Codec) -> Pack {
        log::info!("pack: compressing with {codec:?}");
        Pack {
            session: session.clone(),
            codec,
            compress_min: DEFAULT_COMPRESS_MIN,
            threads: threads_hint(),
        }
    }

    pub fn with_compress_min(mut self, min: usize) -> Pack {
        self.compress_min = min;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Pack {
        self.threads = threads;
        self
    }

    pub fn start(self, from: &Arc<Buffer>, to: &Arc<Buffer>) -> Result<Worker> {
        let threads = self.threads;
        let session = self.session.clone();
        worker::spawn(&session, &Arc::new(self), Some(from), Some(to), threads)
    }
}

impl Stage for Pack {
    type Ctx = PackCtx;

    fn name(&self) -> &'static str {
        "pack"
    }

    fn context(&self) -> Result<PackCtx> {
        Ok(match self.codec {
            Codec::Lz4 => PackCtx::Lz4,
            Codec::Zstd => PackCtx::Zstd {
                compressor: zstd::bulk::Compressor::new(zstd::DEFAULT_COMPRESSION_LEVEL)?,
                scratch: Vec::new(),
            },
            Codec::Deflate => PackCtx::Deflate(Compress::new(Compression::default(), false)),
        })
    }

    fn read(&self, _ctx: &mut PackCtx, pass: &mut Pass, _data: &[u8]) -> Result<()> {
        // Compress only audio and pictures above the threshold.
        let kind = MessageType::try_from(pass.header);
        if pass.read_size > self.compress_min
            && matches!(kind, Ok(MessageType::VideoFrame | MessageType::AudioData))
        {
            pass.write_size = HDRS + self.codec.worst_case(pass.read_size);
        } else {
            pass.copy = true;
        }
        Ok(())
    }

    fn write(&self, ctx: &mut PackCtx, pass: &mut Pass, data: &[u8], out: &mut [u8]) -> Result<()> {
        let compressed = match ctx {
            PackCtx::Lz4 => lz4_flex::block::compress_into(data, &mut out[HDRS..])
                .map_err(|e| {
                    log::error!("pack: lz4: {e}");
                    Error::NoMem
                })?,
            PackCtx::Zstd { compressor, scratch } => {
                scratch.clear();
                scratch.reserve(zstd_safe::compress_bound(data.len()));
                let n = compressor.compress_to_buffer(data, scratch)?;
                out[HDRS..HDRS + n].copy_from_slice(&scratch[..n]);
                n
            }
            PackCtx::Deflate(z) => {
                z.reset();
                let status = z
                    .compress(data, &mut out[HDRS..], FlushCompress::Finish)
                    .map_err(|e| {
                        log::error!("pack: deflate: {e}");
                        Error::BadMsg
                    })?;
                if status != Status::StreamEnd {
                    return Err(Error::NoMem);
                }
                z.total_out() as usize
            }
        };

        let codec_hdr = CodecHeader { size: pass.read_size as u64, tag: pass.header };
        let mut w = &mut out[ContainerHeader::WIRE_SIZE..HDRS];
        codec_hdr.encode_into(&mut w)?;

        let container = ContainerHeader {
            size: (CodecHeader::WIRE_SIZE + compressed) as u64,
            tag: self.codec.tag().tag(),
        };
        let mut w = &mut out[..ContainerHeader::WIRE_SIZE];
        container.encode_into(&mut w)?;

        pass.header = MessageType::Container.tag();
        pass.write_size = HDRS + compressed;
        Ok(())
    }

    fn finish(&self, err: Option<&Error>) {
        if let Some(e) = err {
            log::error!("pack: {e}");
        }
    }
}

/// Per-thread decompression contexts.
pub struct UnpackCtx {
    zstd: zstd::bulk::Decompressor<'static>,
    scratch: Vec<u8>,
    inflate: Decompress,
}

/// Decompressor stage: rewrites codec-tagged packets back to their
/// original header and payload; everything else is copied through.
pub struct Unpack {
    session: Arc<Session>,
    threads: usize,
}

impl Unpack {
    pub fn new(session: &Arc<Session>) -> Unpack {
        Unpack { session: session.clone(), threads: threads_hint() }
    }

    pub fn with_threads(mut self, threads: usize) -> Unpack {
        self.threads = threads;
        self
    }

    pub fn start(self, from: &Arc<Buffer>, to: &Arc<Buffer>) -> Result<Worker> {
        let threads = self.threads;
        let session = self.session.clone();
        worker::spawn(&session, &Arc::new(self), Some(from), Some(to), threads)
    }
}

impl Stage for Unpack {
    type Ctx = UnpackCtx;

    fn name(&self) -> &'static str {
        "unpack"
    }

    fn context(&self) -> Result<UnpackCtx> {
        Ok(UnpackCtx {
            zstd: zstd::bulk::Decompressor::new()?,
            scratch: Vec::new(),
            inflate: Decompress::new(false),
        })
    }

    fn read(&self, _ctx: &mut UnpackCtx, pass: &mut Pass, data: &[u8]) -> Result<()> {
        match MessageType::try_from(pass.header) {
            Ok(MessageType::Lz4 | MessageType::Zstd | MessageType::Deflate) => {
                let hdr = CodecHeader::decode_slice(data).map_err(|_| Error::BadMsg)?;
                pass.write_size = hdr.size as usize;
            }
            _ => pass.copy = true,
        }
        Ok(())
    }

    fn write(&self, ctx: &mut UnpackCtx, pass: &mut Pass, data: &[u8], out: &mut [u8]) -> Result<()> {
        let hdr = CodecHeader::decode_slice(data).map_err(|_| Error::BadMsg)?;
        let body = &data[CodecHeader::WIRE_SIZE..];
        match MessageType::try_from(pass.header) {
            Ok(MessageType::Lz4) => {
                let n = lz4_flex::block::decompress_into(body, out).map_err(|e| {
                    log::error!("unpack: lz4: {e}");
                    Error::BadMsg
                })?;
                if n != out.len() {
                    return Err(Error::BadMsg);
                }
            }
            Ok(MessageType::Zstd) => {
                ctx.scratch.clear();
                ctx.scratch.reserve(hdr.size as usize);
                let n = ctx.zstd.decompress_to_buffer(body, &mut ctx.scratch)?;
                if n != out.len() {
                    return Err(Error::BadMsg);
                }
                out.copy_from_slice(&ctx.scratch[..n]);
            }
            Ok(MessageType::Deflate) => {
                ctx.inflate.reset(false);
                let status = ctx
                    .inflate
                    .decompress(body, out, FlushDecompress::Finish)
                    .map_err(|e| {
                        log::error!("unpack: deflate: {e}");
                        Error::BadMsg
                    })?;
                if status != Status::StreamEnd || ctx.inflate.total_out() as usize != out.len() {
                    return Err(Error::BadMsg);
                }
            }
            _ => return Err(Error::NotSup),
        }
        pass.header = hdr.tag;
        Ok(())
    }

    fn finish(&self, err: Option<&Error>) {
        if let Some(e) = err {
            log::error!("unpack: {e}");
        }
    }
}
