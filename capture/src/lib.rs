pub mod audio;
pub mod sync;

pub use audio::{
    AudioCapture, ChannelArea, HwParams, Pcm, PcmAccess, PcmMode, PcmSampleFormat,
};
pub use sync::{Semaphore, SpinLock};
