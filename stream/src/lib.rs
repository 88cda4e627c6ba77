pub mod buffer;
pub mod error;
pub mod session;
pub mod worker;

pub use buffer::{Buffer, Mode, Packet};
pub use error::{Error, Result};
pub use session::{Session, threads_hint};
pub use worker::{MSG_CLOSE, Pass, Stage, Worker};
