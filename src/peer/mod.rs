pub mod connection;
pub mod ice;
pub mod negotiation;
pub mod rtc;
pub mod state;
pub mod types;

pub use connection::{PeerConnection, PeerConnectionFactory, PeerConnectionManager, PeerObserver};
pub use ice::{CandidateBuffer, DrainReport};
pub use negotiation::Negotiator;
pub use state::{CallState, GRACE_PERIOD};
pub use types::{CallEvent, IceCandidate, RemoteTrack, Role, SessionDescription, TrackKind};
