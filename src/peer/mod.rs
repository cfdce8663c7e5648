pub mod codec;
pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod state;
pub mod types;

pub use connection::{EngineOptions, WebRtcEngine};
pub use state::PeerFactory;
pub use types::{ConnectionBundle, IceCandidate, SdpPayload, ServerConfig};
