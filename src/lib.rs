pub mod call;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
mod utils;

pub use call::{join, spawn, Call, CallHandle};
pub use config::{CallConfig, ServerConfig, ServerKind};
pub use error::{CallError, ErrorKind, MediaError, Result};
pub use media::{LocalStream, LocalTrack, MediaDevices, MediaSessionController, SampleDevices};
pub use peer::{CallEvent, CallState, IceCandidate, Role};
pub use session::SessionId;
pub use signaling::{ChannelEvent, Envelope, SignalingChannel};
