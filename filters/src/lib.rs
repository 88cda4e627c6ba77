pub mod color;
pub mod pack;
pub mod scale;

pub use color::Color;
pub use pack::{Codec, DEFAULT_COMPRESS_MIN, Pack, Unpack};
pub use scale::{Scale, ScaleTarget};
