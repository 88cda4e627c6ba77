pub mod config;
pub mod demux;
pub mod info;
pub mod pipeline;

pub use config::{Action, Config, Hotkey};
pub use demux::{Demux, MediaKind, StreamHandler};
pub use info::Info;
pub use pipeline::{DrainHandler, Recorder};
