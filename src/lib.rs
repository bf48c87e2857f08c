#![warn(rust_2018_idioms)]

// re-export sub-crates
pub use data;
pub use dtls;
pub use ice;
pub use rtcp;
pub use rtp;
pub use sctp;
pub use sdp;
pub use srtp;
pub use stun;
pub use util;

pub mod auth;
pub mod component;
pub mod config;
pub mod data_channel;
pub mod dtls_srtp;
pub mod error;
pub mod events;
pub mod handle;
pub mod ice_agent;
pub mod mux;
pub mod nack;
pub mod plugin;
pub mod rtp_engine;
pub mod sdp_utils;
pub mod session;
pub mod stats;
pub mod stream;
pub mod trickle;

pub use error::Error;

/// Equal to UDP MTU
pub(crate) const RECEIVE_MTU: usize = 1460;

/// Plugins compiled against a different API revision are refused at
/// registration time.
pub const PLUGIN_API_VERSION: u32 = 9;

/// Transport plugins carry their own parallel constant.
pub const TRANSPORT_API_VERSION: u32 = 7;
