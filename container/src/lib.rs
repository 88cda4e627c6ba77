use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use typed_builder::TypedBuilder;

pub mod sink;
pub mod source;
pub mod tracker;

pub use sink::FileSink;
pub use source::FileSource;
pub use tracker::StateTracker;

/*

Stream file format:

-- StreamInfo prologue (48 bytes, packed, little-endian)
-- name_size bytes of UTF-8 program path
-- date_size bytes of UTF-8 UTC date
-- frames until a CLOSE frame:
     version 0x4:  <size: u64> <header: u8> <payload: size bytes>
     version 0x3:  <header: u8> <size: u64> <payload: size bytes>

In-memory packets carry the same header byte followed by the payload;
the on-disk size prefix is added by the sink and stripped by the source.

*/

/// Stream version written by the sink.
pub const STREAM_VERSION: u32 = 0x4;
/// Last version with the swapped size/header frame order.
pub const STREAM_VERSION_SWAPPED: u32 = 0x3;
/// File signature, the bytes `"GLC\0"` read as a little-endian u32.
pub const SIGNATURE: u32 = 0x0043_4c47;

/// Audio payload is interleaved.
pub const AUDIO_INTERLEAVED: u32 = 0x1;
/// Video rows are padded to an 8-byte boundary.
pub const VIDEO_DWORD_ALIGNED: u32 = 0x1;

/// Message type tag, the single-byte header of every packet.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MessageType {
    /// End of stream.
    Close = 0x01,
    VideoFrame = 0x02,
    VideoFormat = 0x03,
    /// lz4-compressed packet.
    Lz4 = 0x04,
    AudioFormat = 0x05,
    AudioData = 0x06,
    /// zstd-compressed packet.
    Zstd = 0x07,
    /// Color correction information.
    Color = 0x08,
    /// A nested, ready-framed packet of a different type.
    Container = 0x09,
    /// deflate-compressed packet.
    Deflate = 0x0a,
    /// In-process only; never persisted.
    CallbackRequest = 0x0b,
}

impl TryFrom<u8> for MessageType {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => MessageType::Close,
            0x02 => MessageType::VideoFrame,
            0x03 => MessageType::VideoFormat,
            0x04 => MessageType::Lz4,
            0x05 => MessageType::AudioFormat,
            0x06 => MessageType::AudioData,
            0x07 => MessageType::Zstd,
            0x08 => MessageType::Color,
            0x09 => MessageType::Container,
            0x0a => MessageType::Deflate,
            0x0b => MessageType::CallbackRequest,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown message type 0x{other:02x}"),
                ));
            }
        })
    }
}

impl MessageType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Format-declaration messages retained by the state tracker.
    pub fn is_sticky(self) -> bool {
        matches!(
            self,
            MessageType::VideoFormat | MessageType::AudioFormat | MessageType::Color
        )
    }
}

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PixelFormat {
    /// 24bit BGR, last row first.
    Bgr24 = 0x1,
    /// 32bit BGRA, last row first.
    Bgra32 = 0x2,
    /// Planar Y'CbCr 4:2:0 ("420jpeg" chroma siting).
    Ycbcr420 = 0x3,
    /// 24bit RGB, last row first.
    Rgb24 = 0x4,
}

impl TryFrom<u8> for PixelFormat {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x1 => PixelFormat::Bgr24,
            0x2 => PixelFormat::Bgra32,
            0x3 => PixelFormat::Ycbcr420,
            0x4 => PixelFormat::Rgb24,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown pixel format 0x{other:02x}"),
                ));
            }
        })
    }
}

impl PixelFormat {
    /// Bytes per pixel for the packed formats, `None` for planar ones.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => Some(3),
            PixelFormat::Bgra32 => Some(4),
            PixelFormat::Ycbcr420 => None,
        }
    }
}

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SampleFormat {
    S16Le = 0x1,
    S24Le = 0x2,
    S32Le = 0x3,
}

impl TryFrom<u8> for SampleFormat {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x1 => SampleFormat::S16Le,
            0x2 => SampleFormat::S24Le,
            0x3 => SampleFormat::S32Le,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown sample format 0x{other:02x}"),
                ));
            }
        })
    }
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S16Le => 2,
            SampleFormat::S24Le => 3,
            SampleFormat::S32Le => 4,
        }
    }
}

/// Fixed-layout wire encoding, packed little-endian.
pub trait Codable: Sized {
    const WIRE_SIZE: usize;

    fn encode_into<W: Write>(&self, out: &mut W) -> io::Result<()>;

    fn decode_from<R: Read>(input: &mut R) -> io::Result<Self>;

    fn decode_slice(mut data: &[u8]) -> io::Result<Self> {
        Self::decode_from(&mut data)
    }

    fn encode_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        self.encode_into(&mut out).expect("vec write can't fail");
        out
    }
}

/// VIDEO_FORMAT payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub id: i32,
    pub flags: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl VideoFormat {
    /// Input row stride in bytes, honouring DWORD_ALIGNED padding.
    /// Planar formats have no row padding.
    pub fn stride(&self) -> usize {
        match self.format.bytes_per_pixel() {
            Some(bpp) => {
                let row = self.width as usize * bpp;
                if self.flags & VIDEO_DWORD_ALIGNED != 0 {
                    (row + 7) & !7
                } else {
                    row
                }
            }
            None => self.width as usize,
        }
    }

    /// Total frame payload size in bytes.
    pub fn frame_size(&self) -> usize {
        let (w, h) = (self.width as usize, self.height as usize);
        match self.format {
            PixelFormat::Ycbcr420 => w * h + 2 * ((w / 2) * (h / 2)),
            _ => self.stride() * h,
        }
    }
}

impl Codable for VideoFormat {
    const WIRE_SIZE: usize = 17;

    fn encode_into<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_i32::<LittleEndian>(self.id)?;
        out.write_u32::<LittleEndian>(self.flags)?;
        out.write_u32::<LittleEndian>(self.width)?;
        out.write_u32::<LittleEndian>(self.height)?;
        out.write_u8(self.format as u8)
    }

    fn decode_from<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(VideoFormat {
            id: input.read_i32::<LittleEndian>()?,
            flags: input.read_u32::<LittleEndian>()?,
            width: input.read_u32::<LittleEndian>()?,
            height: input.read_u32::<LittleEndian>()?,
            format: PixelFormat::try_from(input.read_u8()?)?,
        })
    }
}

/// VIDEO_FRAME payload prefix; raw pixels follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub id: i32,
    pub time: u64,
}

impl Codable for FrameHeader {
    const WIRE_SIZE: usize = 12;

    fn encode_into<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_i32::<LittleEndian>(self.id)?;
        out.write_u64::<LittleEndian>(self.time)
    }

    fn decode_from<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(FrameHeader {
            id: input.read_i32::<LittleEndian>()?,
            time: input.read_u64::<LittleEndian>()?,
        })
    }
}

/// AUDIO_FORMAT payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub id: i32,
    pub flags: u32,
    pub rate: u32,
    pub channels: u32,
    pub format: SampleFormat,
}

impl AudioFormat {
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.format.bytes_per_sample()
    }
}

impl Codable for AudioFormat {
    const WIRE_SIZE: usize = 17;

    fn encode_into<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_i32::<LittleEndian>(self.id)?;
        out.write_u32::<LittleEndian>(self.flags)?;
        out.write_u32::<LittleEndian>(self.rate)?;
        out.write_u32::<LittleEndian>(self.channels)?;
        out.write_u8(self.format as u8)
    }

    fn decode_from<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(AudioFormat {
            id: input.read_i32::<LittleEndian>()?,
            flags: input.read_u32::<LittleEndian>()?,
            rate: input.read_u32::<LittleEndian>()?,
            channels: input.read_u32::<LittleEndian>()?,
            format: SampleFormat::try_from(input.read_u8()?)?,
        })
    }
}

/// AUDIO_DATA payload prefix; samples follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioDataHeader {
    pub id: i32,
    pub time: u64,
    pub size: u64,
}

impl Codable for AudioDataHeader {
    const WIRE_SIZE: usize = 20;

    fn encode_into<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_i32::<LittleEndian>(self.id)?;
        out.write_u64::<LittleEndian>(self.time)?;
        out.write_u64::<LittleEndian>(self.size)
    }

    fn decode_from<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(AudioDataHeader {
            id: input.read_i32::<LittleEndian>()?,
            time: input.read_u64::<LittleEndian>()?,
            size: input.read_u64::<LittleEndian>()?,
        })
    }
}

/// COLOR payload: brightness/contrast offsets and per-channel gamma for
/// one video stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorSetup {
    pub id: i32,
    pub brightness: f32,
    pub contrast: f32,
    pub red: f32,
    pub green: f32,
    pub blue: f32,
}

impl Codable for ColorSetup {
    const WIRE_SIZE: usize = 24;

    fn encode_into<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_i32::<LittleEndian>(self.id)?;
        out.write_f32::<LittleEndian>(self.brightness)?;
        out.write_f32::<LittleEndian>(self.contrast)?;
        out.write_f32::<LittleEndian>(self.red)?;
        out.write_f32::<LittleEndian>(self.green)?;
        out.write_f32::<LittleEndian>(self.blue)
    }

    fn decode_from<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(ColorSetup {
            id: input.read_i32::<LittleEndian>()?,
            brightness: input.read_f32::<LittleEndian>()?,
            contrast: input.read_f32::<LittleEndian>()?,
            red: input.read_f32::<LittleEndian>()?,
            green: input.read_f32::<LittleEndian>()?,
            blue: input.read_f32::<LittleEndian>()?,
        })
    }
}

/// CONTAINER payload prefix: the size and header byte of the nested
/// packet, which follows verbatim. Identical to the on-disk frame
/// prefix, so the sink can write the payload through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub size: u64,
    pub tag: u8,
}

impl Codable for ContainerHeader {
    const WIRE_SIZE: usize = 9;

    fn encode_into<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.size)?;
        out.write_u8(self.tag)
    }

    fn decode_from<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(ContainerHeader {
            size: input.read_u64::<LittleEndian>()?,
            tag: input.read_u8()?,
        })
    }
}

/// Prefix of every compressed payload: the uncompressed size and the
/// original message header, restored by the decompressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecHeader {
    pub size: u64,
    pub tag: u8,
}

impl Codable for CodecHeader {
    const WIRE_SIZE: usize = 9;

    fn encode_into<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.size)?;
        out.write_u8(self.tag)
    }

    fn decode_from<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(CodecHeader {
            size: input.read_u64::<LittleEndian>()?,
            tag: input.read_u8()?,
        })
    }
}

/// Stream file prologue. The program path and date strings follow it
/// immediately, `name_size` and `date_size` bytes each.
#[derive(Debug, Clone, Copy, PartialEq, TypedBuilder)]
pub struct StreamInfo {
    #[builder(default = SIGNATURE)]
    pub signature: u32,
    #[builder(default = STREAM_VERSION)]
    pub version: u32,
    #[builder(default = 0.0)]
    pub fps: f64,
    #[builder(default = 0)]
    pub flags: u32,
    #[builder(default = 0)]
    pub pid: u32,
    #[builder(default = 0)]
    pub name_size: u32,
    #[builder(default = 0)]
    pub date_size: u32,
    #[builder(default = 0)]
    pub reserved1: u64,
    #[builder(default = 0)]
    pub reserved2: u64,
}

impl Codable for StreamInfo {
    const WIRE_SIZE: usize = 48;

    fn encode_into<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.signature)?;
        out.write_u32::<LittleEndian>(self.version)?;
        out.write_f64::<LittleEndian>(self.fps)?;
        out.write_u32::<LittleEndian>(self.flags)?;
        out.write_u32::<LittleEndian>(self.pid)?;
        out.write_u32::<LittleEndian>(self.name_size)?;
        out.write_u32::<LittleEndian>(self.date_size)?;
        out.write_u64::<LittleEndian>(self.reserved1)?;
        out.write_u64::<LittleEndian>(self.reserved2)
    }

    fn decode_from<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(StreamInfo {
            signature: input.read_u32::<LittleEndian>()?,
            version: input.read_u32::<LittleEndian>()?,
            fps: input.read_f64::<LittleEndian>()?,
            flags: input.read_u32::<LittleEndian>()?,
            pid: input.read_u32::<LittleEndian>()?,
            name_size: input.read_u32::<LittleEndian>()?,
            date_size: input.read_u32::<LittleEndian>()?,
            reserved1: input.read_u64::<LittleEndian>()?,
            reserved2: input.read_u64::<LittleEndian>()?,
        })
    }
}

/// Stream id of a format-declaration payload; every sticky message
/// starts with the id.
pub fn payload_stream_id(payload: &[u8]) -> Option<i32> {
    let bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    Some(i32::from_le_bytes(bytes))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signature_matches_byte_literal() {
        assert_eq!(SIGNATURE, u32::from_le_bytes(*b"GLC\0"));
    }

    #[test]
    fn close_tag_matches_worker_constant() {
        assert_eq!(MessageType::Close.tag(), stream::MSG_CLOSE);
    }

    #[test]
    fn headers_roundtrip_at_wire_size() {
        let vf = VideoFormat {
            id: 3,
            flags: VIDEO_DWORD_ALIGNED,
            width: 320,
            height: 240,
            format: PixelFormat::Bgr24,
        };
        let bytes = vf.encode_vec();
        assert_eq!(bytes.len(), VideoFormat::WIRE_SIZE);
        assert_eq!(VideoFormat::decode_slice(&bytes).unwrap(), vf);

        let ah = AudioDataHeader { id: -1, time: 123_456, size: 4096 };
        let bytes = ah.encode_vec();
        assert_eq!(bytes.len(), AudioDataHeader::WIRE_SIZE);
        assert_eq!(AudioDataHeader::decode_slice(&bytes).unwrap(), ah);

        let info = StreamInfo::builder().fps(60.0).pid(42).build();
        let bytes = info.encode_vec();
        assert_eq!(bytes.len(), StreamInfo::WIRE_SIZE);
        assert_eq!(StreamInfo::decode_slice(&bytes).unwrap(), info);
    }

    #[test]
    fn stride_honours_dword_alignment() {
        let mut vf = VideoFormat {
            id: 1,
            flags: 0,
            width: 3,
            height: 2,
            format: PixelFormat::Bgr24,
        };
        assert_eq!(vf.stride(), 9);
        assert_eq!(vf.frame_size(), 18);
        vf.flags = VIDEO_DWORD_ALIGNED;
        assert_eq!(vf.stride(), 16);
        assert_eq!(vf.frame_size(), 32);
    }

    #[test]
    fn ycbcr_frame_size_counts_planes() {
        let vf = VideoFormat {
            id: 1,
            flags: 0,
            width: 4,
            height: 4,
            format: PixelFormat::Ycbcr420,
        };
        assert_eq!(vf.frame_size(), 16 + 2 * 4);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        assert!(MessageType::try_from(0x0c).is_err());
        assert!(PixelFormat::try_from(0).is_err());
        assert!(SampleFormat::try_from(9).is_err());
    }
}
